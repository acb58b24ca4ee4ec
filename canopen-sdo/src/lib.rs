//! # CANopen SDO
//!
//! Service Data Object transfers for CANopen nodes, shared by the mock node
//! and anything else that needs to read or write an object dictionary over
//! CAN.
//!
//! This library provides:
//! - An SDO server answering from an [`ObjectStore`]
//! - An SDO client with a request queue
//! - Expedited, segmented and block transfers, including domain streaming
//! - Frame codecs, abort codes and the block CRC
//!
//! Both engines are driven from the outside: feed received frames in with
//! `handle_frame`, call `poll` periodically, and drain the [`Transport`]
//! they send on. With the `socketcan` feature a `CanSocket` is a transport.

pub mod abort;
pub mod channel;
pub mod client;
pub mod config;
pub mod crc;
pub mod error;
pub mod frame;
pub mod indication;
pub mod queue;
pub mod server;
pub mod store;
pub mod timer;
pub mod transport;

// Re-export commonly used types for convenience
pub use abort::{AbortCode, AbortReason};
pub use channel::{ChannelId, CobIds, SplitPoint, TransferState};
pub use client::{DomainRefill, Direction, SdoClient, TransferOptions, TransferOutcome};
pub use config::SdoConfig;
pub use error::SdoError;
pub use frame::{Frame, ObjectAddress};
pub use indication::{Completion, IndicationResult, ObserverId};
pub use server::{DomainChunk, SdoServer, ServerRequest};
pub use store::{Access, MemoryStore, ObjectInfo, ObjectStore};
pub use timer::{Clock, ManualClock, SystemClock};
pub use transport::{FrameQueue, TransmitError, Transport};
