//! Local errors returned by the request APIs.
//!
//! These are rejected before anything is sent and never change channel
//! state. Failures of a running transfer are reported as [`AbortReason`]s
//! through the indications instead.
//!
//! [`AbortReason`]: crate::abort::AbortReason

use thiserror::Error;

use crate::channel::ChannelId;
use crate::transport::TransmitError;

#[derive(Debug, Error)]
pub enum SdoError {
    /// Channel handle does not address a configured slot.
    #[error("invalid SDO channel {0}")]
    InvalidChannel(ChannelId),

    /// Timeout of zero or out of range.
    #[error("invalid timeout of {0} ms")]
    InvalidTimeout(u32),

    /// Caller buffer cannot hold what the request declares.
    #[error("buffer of {len} bytes is shorter than the declared {declared} bytes")]
    BufferTooShort { len: usize, declared: usize },

    /// A transfer is already running on this channel.
    #[error("SDO channel {0} is busy")]
    Busy(ChannelId),

    #[error("SDO channel {0} is disabled")]
    Disabled(ChannelId),

    /// Abort requested on a channel without a running transfer.
    #[error("no transfer active on SDO channel {0}")]
    NotActive(ChannelId),

    /// Continuation called for a channel that is not parked.
    #[error("SDO channel {0} is not waiting for an indication result")]
    NotSuspended(ChannelId),

    #[error("transmit failed: {0}")]
    Transmit(#[from] TransmitError),

    #[error("SDO queue is full")]
    QueueFull,

    #[error("invalid configuration: {0}")]
    Config(String),
}
