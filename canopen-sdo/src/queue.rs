//! Pending client requests waiting for their channel.

use std::collections::VecDeque;

use log::debug;

use crate::channel::ChannelId;
use crate::client::{TransferOptions, TransferOutcome};
use crate::error::SdoError;
use crate::frame::ObjectAddress;

/// Called once with the outcome of a queued transfer.
pub type QueueCallback = dyn FnOnce(&TransferOutcome<'_>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedKind {
    Read { max_len: usize },
    Write { data: Vec<u8> },
}

pub struct QueuedTransfer {
    pub channel: ChannelId,
    pub address: ObjectAddress,
    pub kind: QueuedKind,
    pub options: TransferOptions,
    pub done: Box<QueueCallback>,
}

/// Bounded FIFO of requests. Entries for one channel run in the order they
/// were queued; entries for different channels do not wait on each other.
pub struct SdoQueue {
    entries: VecDeque<QueuedTransfer>,
    capacity: usize,
}

impl SdoQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: QueuedTransfer) -> Result<(), SdoError> {
        if self.entries.len() >= self.capacity {
            return Err(SdoError::QueueFull);
        }
        debug!(
            "SDO queue: {:?} of {} on channel {} queued ({} waiting)",
            entry.kind,
            entry.address,
            entry.channel,
            self.entries.len()
        );
        self.entries.push_back(entry);
        Ok(())
    }

    /// Remove the oldest entry for `channel`.
    pub fn take_for(&mut self, channel: ChannelId) -> Option<QueuedTransfer> {
        let position = self.entries.iter().position(|e| e.channel == channel)?;
        self.entries.remove(position)
    }

    pub fn pending_for(&self, channel: ChannelId) -> usize {
        self.entries.iter().filter(|e| e.channel == channel).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
