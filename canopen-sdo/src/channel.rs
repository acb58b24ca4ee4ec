//! Channel handles, COB-ID bindings and the fixed-size channel arena.

use std::fmt;

use crate::error::SdoError;

/// Handle of a client or server channel, the index into its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u8);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request and response COB-IDs of one channel, seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CobIds {
    /// Frames accepted by this channel.
    pub rx: u16,
    /// Frames sent by this channel.
    pub tx: u16,
}

impl CobIds {
    pub const SERVER_RX_BASE: u16 = 0x600;
    pub const SERVER_TX_BASE: u16 = 0x580;

    /// Predefined connection of the default server of `node_id`.
    pub fn server(node_id: u8) -> Self {
        Self {
            rx: Self::SERVER_RX_BASE + node_id as u16,
            tx: Self::SERVER_TX_BASE + node_id as u16,
        }
    }

    /// Client side of the predefined connection to `node_id`.
    pub fn client(node_id: u8) -> Self {
        let server = Self::server(node_id);
        Self { rx: server.tx, tx: server.rx }
    }
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Free,
    UploadInit,
    UploadSegment,
    DownloadInit,
    DownloadSegment,
    BlockUploadInit,
    BlockUploadBlock,
    BlockUploadAck,
    BlockUploadEnd,
    BlockDownloadInit,
    BlockDownloadBlock,
    BlockDownloadAck,
    BlockDownloadEnd,
    /// Parked until the application answers a deferred indication.
    Suspended(SplitPoint),
}

impl TransferState {
    pub fn is_free(self) -> bool {
        self == TransferState::Free
    }
}

/// Step a suspended transfer continues with once resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPoint {
    /// Upload initiate response (read indication or first domain chunk).
    UploadInit,
    /// Next upload segment (domain chunk refill).
    UploadSegment,
    /// Block upload initiate response.
    BlockUploadInit,
    /// Streaming of the current block upload window.
    BlockUploadWindow,
    /// Expedited download response.
    DownloadInit,
    /// Download segment response.
    DownloadSegment,
    /// Block download acknowledge.
    BlockDownloadAck,
    /// Block download end response.
    BlockDownloadEnd,
    /// Client domain write waiting for the next chunk.
    DomainWrite,
}

/// COB-ID binding and enable flag of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub cob: Option<CobIds>,
    pub enabled: bool,
}

impl Binding {
    pub const UNBOUND: Binding = Binding { cob: None, enabled: false };

    pub fn bound(cob: CobIds) -> Self {
        Self { cob: Some(cob), enabled: true }
    }

    pub fn accepts(&self, cob_id: u16) -> bool {
        self.enabled && self.cob.is_some_and(|cob| cob.rx == cob_id)
    }

    pub fn tx(&self) -> Option<u16> {
        self.cob.filter(|_| self.enabled).map(|cob| cob.tx)
    }
}

/// Fixed set of channels addressed by [`ChannelId`]. Lookups of a handle
/// outside the pool fail instead of panicking.
#[derive(Debug)]
pub struct ChannelPool<C> {
    slots: Vec<C>,
}

impl<C> ChannelPool<C> {
    pub fn new(count: u8, mut make: impl FnMut(ChannelId) -> C) -> Self {
        Self {
            slots: (0..count).map(|i| make(ChannelId(i))).collect(),
        }
    }

    pub fn get(&self, id: ChannelId) -> Result<&C, SdoError> {
        self.slots.get(id.0 as usize).ok_or(SdoError::InvalidChannel(id))
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Result<&mut C, SdoError> {
        self.slots.get_mut(id.0 as usize).ok_or(SdoError::InvalidChannel(id))
    }

    /// First channel matching `pred`.
    pub fn find(&self, mut pred: impl FnMut(&C) -> bool) -> Option<ChannelId> {
        self.slots.iter().position(|c| pred(c)).map(|i| ChannelId(i as u8))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut C> {
        self.slots.iter_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = ChannelId> {
        (0..self.slots.len()).map(|i| ChannelId(i as u8))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predefined_connection() {
        let server = CobIds::server(4);
        assert_eq!(server, CobIds { rx: 0x604, tx: 0x584 });
        assert_eq!(CobIds::client(4), CobIds { rx: 0x584, tx: 0x604 });
    }

    #[test]
    fn out_of_range_handle_fails_closed() {
        let mut pool = ChannelPool::new(2, |id| id.0);
        assert_eq!(*pool.get(ChannelId(1)).unwrap(), 1);
        assert!(matches!(pool.get(ChannelId(2)), Err(SdoError::InvalidChannel(ChannelId(2)))));
        assert!(pool.get_mut(ChannelId(200)).is_err());
        assert_eq!(pool.ids().count(), 2);
    }

    #[test]
    fn disabled_binding_accepts_nothing() {
        let mut binding = Binding::bound(CobIds::server(1));
        assert!(binding.accepts(0x601));
        assert!(!binding.accepts(0x581));
        binding.enabled = false;
        assert!(!binding.accepts(0x601));
        assert_eq!(binding.tx(), None);
        assert!(!Binding::UNBOUND.accepts(0x601));
    }
}
