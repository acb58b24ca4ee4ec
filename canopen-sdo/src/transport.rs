//! Outgoing side of the bus as seen by the SDO engines.

use std::collections::VecDeque;

use thiserror::Error;

use crate::frame::Frame;

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("transmit buffer full")]
    BufferFull,
    #[error("bus error: {0}")]
    Bus(String),
}

/// Send side of a CAN driver or COB queue.
pub trait Transport {
    /// Enqueue one 8-byte frame on `cob_id`.
    fn send(&mut self, cob_id: u16, frame: &Frame) -> Result<(), TransmitError>;

    /// Fill level of the transmit buffer in percent.
    fn fill_percent(&self) -> u8 {
        0
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, cob_id: u16, frame: &Frame) -> Result<(), TransmitError> {
        (**self).send(cob_id, frame)
    }

    fn fill_percent(&self) -> u8 {
        (**self).fill_percent()
    }
}

/// Bounded queue of outgoing frames, drained by whoever owns the bus.
#[derive(Debug, Clone)]
pub struct FrameQueue {
    frames: VecDeque<(u16, Frame)>,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn pop(&mut self) -> Option<(u16, Frame)> {
        self.frames.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (u16, Frame)> + '_ {
        self.frames.drain(..)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Transport for FrameQueue {
    fn send(&mut self, cob_id: u16, frame: &Frame) -> Result<(), TransmitError> {
        if self.frames.len() >= self.capacity {
            return Err(TransmitError::BufferFull);
        }
        self.frames.push_back((cob_id, *frame));
        Ok(())
    }

    fn fill_percent(&self) -> u8 {
        (self.frames.len() * 100 / self.capacity).min(100) as u8
    }
}

#[cfg(feature = "socketcan")]
pub use self::socket::{from_can_frame, to_can_frame};

#[cfg(feature = "socketcan")]
mod socket {
    use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Id, Socket, StandardId};

    use super::{TransmitError, Transport};
    use crate::frame::Frame;

    /// Build a standard-id data frame for `cob_id`.
    pub fn to_can_frame(cob_id: u16, data: &Frame) -> Option<CanFrame> {
        let id = StandardId::new(cob_id)?;
        CanFrame::new(id, data)
    }

    /// Extract COB-ID and payload of an SDO-sized frame. Extended ids,
    /// remote frames and short frames are not SDO traffic.
    pub fn from_can_frame(frame: &CanFrame) -> Option<(u16, Frame)> {
        let cob_id = match frame.id() {
            Id::Standard(std_id) => std_id.as_raw(),
            Id::Extended(_) => return None,
        };
        if frame.is_remote_frame() {
            return None;
        }
        let data: Frame = frame.data().try_into().ok()?;
        Some((cob_id, data))
    }

    impl Transport for CanSocket {
        fn send(&mut self, cob_id: u16, data: &Frame) -> Result<(), TransmitError> {
            let frame = to_can_frame(cob_id, data)
                .ok_or_else(|| TransmitError::Bus(format!("invalid COB-ID 0x{:03X}", cob_id)))?;
            self.write_frame(&frame).map_err(|e| match e.kind() {
                std::io::ErrorKind::WouldBlock => TransmitError::BufferFull,
                _ => TransmitError::Bus(e.to_string()),
            })
        }
    }
}
