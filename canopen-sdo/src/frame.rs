//! SDO frame layout shared by the client and server engines.
//!
//! Every SDO frame is 8 bytes: a command byte, the multiplexer
//! (index little endian + sub-index) and up to 4 bytes of data, or a command
//! byte followed by 7 bytes of segment data.

use std::fmt;

use crate::abort::AbortCode;

/// Raw SDO payload. Classic CAN only.
pub type Frame = [u8; 8];

/// Payload bytes carried by one segment.
pub const SEGMENT_DATA_LEN: usize = 7;
/// Largest value that fits an expedited transfer.
pub const EXPEDITED_MAX_LEN: usize = 4;
/// Largest block size (and sequence number) of a block transfer.
pub const MAX_BLOCK_SIZE: u8 = 127;

pub const TOGGLE_BIT: u8 = 0x10;
/// Continuation flag of a segment: no more segments follow.
pub const LAST_SEGMENT_FLAG: u8 = 0x01;
pub const EXPEDITED_FLAG: u8 = 0x02;
pub const SIZE_INDICATED_FLAG: u8 = 0x01;
pub const BLOCK_CRC_FLAG: u8 = 0x04;
pub const BLOCK_SIZE_INDICATED_FLAG: u8 = 0x02;
pub const BLOCK_LAST_FLAG: u8 = 0x80;
pub const BLOCK_SEQ_MASK: u8 = 0x7F;

/// Sub-commands of block transfers (low two bits of the command byte).
pub const BLOCK_SUB_MASK: u8 = 0x03;
pub const BLOCK_SUB_INIT: u8 = 0x00;
pub const BLOCK_SUB_END: u8 = 0x01;
pub const BLOCK_SUB_ACK: u8 = 0x02;
pub const BLOCK_SUB_START: u8 = 0x03;

const SPECIFIER_MASK: u8 = 0xE0;

/// Command specifiers sent by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientCommand {
    /// Download segment (write data)
    DownloadSegment = 0x00,
    /// Initiate download (write)
    InitiateDownload = 0x20,
    /// Initiate upload (read)
    InitiateUpload = 0x40,
    /// Upload segment request
    UploadSegment = 0x60,
    /// Abort transfer
    Abort = 0x80,
    /// Block upload sub-protocol
    BlockUpload = 0xA0,
    /// Block download sub-protocol
    BlockDownload = 0xC0,
}

impl ClientCommand {
    pub fn parse(command: u8) -> Option<Self> {
        match command & SPECIFIER_MASK {
            0x00 => Some(Self::DownloadSegment),
            0x20 => Some(Self::InitiateDownload),
            0x40 => Some(Self::InitiateUpload),
            0x60 => Some(Self::UploadSegment),
            0x80 => Some(Self::Abort),
            0xA0 => Some(Self::BlockUpload),
            0xC0 => Some(Self::BlockDownload),
            _ => None,
        }
    }
}

/// Command specifiers sent by a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerCommand {
    /// Upload segment (read data)
    UploadSegment = 0x00,
    /// Download segment response
    DownloadSegment = 0x20,
    /// Initiate upload response
    InitiateUpload = 0x40,
    /// Initiate download response
    InitiateDownload = 0x60,
    /// Abort transfer
    Abort = 0x80,
    /// Block download sub-protocol
    BlockDownload = 0xA0,
    /// Block upload sub-protocol
    BlockUpload = 0xC0,
}

impl ServerCommand {
    pub fn parse(command: u8) -> Option<Self> {
        match command & SPECIFIER_MASK {
            0x00 => Some(Self::UploadSegment),
            0x20 => Some(Self::DownloadSegment),
            0x40 => Some(Self::InitiateUpload),
            0x60 => Some(Self::InitiateDownload),
            0x80 => Some(Self::Abort),
            0xA0 => Some(Self::BlockDownload),
            0xC0 => Some(Self::BlockUpload),
            _ => None,
        }
    }
}

/// Abort frames carry exactly this command byte.
pub fn is_abort(frame: &Frame) -> bool {
    frame[0] == ClientCommand::Abort as u8
}

/// Location of an object in the object dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectAddress {
    pub index: u16,
    pub sub_index: u8,
}

impl ObjectAddress {
    pub const fn new(index: u16, sub_index: u8) -> Self {
        Self { index, sub_index }
    }

    /// Write the multiplexer into bytes 1..4.
    pub fn encode(&self, frame: &mut Frame) {
        // Index in little endian
        frame[1..3].copy_from_slice(&self.index.to_le_bytes());
        frame[3] = self.sub_index;
    }

    pub fn decode(frame: &Frame) -> Self {
        Self {
            index: u16::from_le_bytes([frame[1], frame[2]]),
            sub_index: frame[3],
        }
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}:{:02X}", self.index, self.sub_index)
    }
}

/// Frame with a command byte and multiplexer, remaining bytes zero.
pub fn with_address(command: u8, address: ObjectAddress) -> Frame {
    let mut frame = [0u8; 8];
    frame[0] = command;
    address.encode(&mut frame);
    frame
}

pub fn abort(address: ObjectAddress, code: AbortCode) -> Frame {
    let mut frame = with_address(ClientCommand::Abort as u8, address);
    // Abort code in bytes 4-7 (little-endian)
    frame[4..8].copy_from_slice(&code.raw().to_le_bytes());
    frame
}

pub fn abort_code(frame: &Frame) -> AbortCode {
    AbortCode(u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]))
}

/// Size field of init frames (bytes 4..8).
pub fn size_field(frame: &Frame) -> u32 {
    u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]])
}

pub fn set_size_field(frame: &mut Frame, size: u32) {
    frame[4..8].copy_from_slice(&size.to_le_bytes());
}

/// Expedited init frame carrying `data` (1..=4 bytes) in bytes 4..8.
pub fn expedited(command: u8, address: ObjectAddress, data: &[u8]) -> Frame {
    let len = data.len().min(EXPEDITED_MAX_LEN);
    // bits 2-3: number of bytes that do NOT contain data
    let unused = (EXPEDITED_MAX_LEN - len) as u8;
    let mut frame = with_address(
        command | (unused << 2) | EXPEDITED_FLAG | SIZE_INDICATED_FLAG,
        address,
    );
    frame[4..4 + len].copy_from_slice(&data[..len]);
    frame
}

/// Payload length of an expedited frame. Without the size flag the whole
/// 4 bytes count.
pub fn expedited_len(command: u8) -> usize {
    if command & SIZE_INDICATED_FLAG != 0 {
        EXPEDITED_MAX_LEN - ((command >> 2) & 0x03) as usize
    } else {
        EXPEDITED_MAX_LEN
    }
}

/// Segment frame carrying up to 7 bytes.
pub fn segment(command: u8, toggle: u8, data: &[u8], last: bool) -> Frame {
    let len = data.len().min(SEGMENT_DATA_LEN);
    let mut frame = [0u8; 8];
    frame[0] = command | toggle;
    if last {
        frame[0] |= (((SEGMENT_DATA_LEN - len) as u8) << 1) | LAST_SEGMENT_FLAG;
    }
    frame[1..1 + len].copy_from_slice(&data[..len]);
    frame
}

/// Payload length of a segment frame.
pub fn segment_len(command: u8) -> usize {
    SEGMENT_DATA_LEN - ((command >> 1) & 0x07) as usize
}

pub fn block_segment(seq: u8, last: bool, data: &[u8]) -> Frame {
    let len = data.len().min(SEGMENT_DATA_LEN);
    let mut frame = [0u8; 8];
    frame[0] = seq & BLOCK_SEQ_MASK;
    if last {
        frame[0] |= BLOCK_LAST_FLAG;
    }
    frame[1..1 + len].copy_from_slice(&data[..len]);
    frame
}

/// Block acknowledge: last accepted sequence number and next block size.
pub fn block_ack(command: u8, seq: u8, block_size: u8) -> Frame {
    let mut frame = [0u8; 8];
    frame[0] = command | BLOCK_SUB_ACK;
    frame[1] = seq;
    frame[2] = block_size;
    frame
}

/// Block end frame with the unused byte count of the last segment.
pub fn block_end(command: u8, unused: usize, crc: Option<u16>) -> Frame {
    let mut frame = [0u8; 8];
    frame[0] = command | BLOCK_SUB_END | (((unused & 0x07) as u8) << 2);
    if let Some(crc) = crc {
        frame[1..3].copy_from_slice(&crc.to_le_bytes());
    }
    frame
}

pub fn block_end_unused(command: u8) -> usize {
    ((command >> 2) & 0x07) as usize
}

pub fn block_end_crc(frame: &Frame) -> u16 {
    u16::from_le_bytes([frame[1], frame[2]])
}

/// Unused bytes in the final 7-byte segment of a `size` byte transfer.
/// An empty transfer still sends one segment, with nothing in it.
pub fn unused_in_last_segment(size: usize) -> usize {
    match size % SEGMENT_DATA_LEN {
        0 if size == 0 => SEGMENT_DATA_LEN,
        0 => 0,
        rest => SEGMENT_DATA_LEN - rest,
    }
}

/// Convert a numeric value between host and wire (little endian) order.
/// Byte strings pass through untouched.
pub fn swap_numeric(data: &mut [u8], numeric: bool) {
    if numeric && cfg!(target_endian = "big") {
        data.reverse();
    }
}
