//! SDO abort codes and the result taxonomy they are derived from.
//!
//! Engines work with [`AbortReason`]. Only the frame codec sees the 4-byte
//! [`AbortCode`] that travels on the wire.

use std::fmt;
use thiserror::Error;

/// Why a transfer was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum AbortReason {
    #[error("service busy")]
    ServiceBusy,
    #[error("toggle bit not alternated")]
    ToggleMismatch,
    #[error("SDO protocol timed out")]
    Timeout,
    #[error("command specifier not valid or unknown")]
    UnknownCommand,
    #[error("invalid block size")]
    WrongBlockSize,
    #[error("invalid sequence number")]
    WrongSequenceNumber,
    #[error("CRC error")]
    CrcError,
    #[error("out of memory")]
    OutOfMemory,
    #[error("unsupported access to an object")]
    TransferNotSupported,
    #[error("attempt to read a write only object")]
    NoReadPermission,
    #[error("attempt to write a read only object")]
    NoWritePermission,
    #[error("object does not exist")]
    ObjectNotFound,
    #[error("general internal incompatibility")]
    InternalIncompatibility,
    #[error("hardware error")]
    HardwareError,
    #[error("data type or length does not match")]
    DataTypeMismatch,
    #[error("sub-index does not exist")]
    SubIndexNotFound,
    #[error("value range exceeded")]
    InvalidValue,
    #[error("value too high")]
    ValueTooHigh,
    #[error("value too low")]
    ValueTooLow,
    #[error("object cannot be mapped")]
    MappingError,
    #[error("mapping length exceeded")]
    MappingLengthError,
    #[error("general parameter incompatibility")]
    ParameterIncompatible,
    #[error("data cannot be stored")]
    StoreFailed,
    #[error("data cannot be stored because of local control")]
    LocalControl,
    #[error("data cannot be stored in the present device state")]
    DeviceState,
    #[error("no data available")]
    NoData,
    #[error("network id unknown")]
    NetworkIdUnknown,
    #[error("node id unknown")]
    NodeIdUnknown,
    #[error("SDO channel in use")]
    ChannelInUse,
    #[error("general error")]
    General,
}

/// Reason to wire code. `General` is the fallback in both directions.
static ABORT_TABLE: &[(AbortReason, u32)] = &[
    (AbortReason::ServiceBusy, 0x0500_0000),
    (AbortReason::ToggleMismatch, 0x0503_0000),
    (AbortReason::Timeout, 0x0504_0000),
    (AbortReason::UnknownCommand, 0x0504_0001),
    (AbortReason::WrongBlockSize, 0x0504_0002),
    (AbortReason::WrongSequenceNumber, 0x0504_0003),
    (AbortReason::CrcError, 0x0504_0004),
    (AbortReason::OutOfMemory, 0x0504_0005),
    (AbortReason::TransferNotSupported, 0x0601_0000),
    (AbortReason::NoReadPermission, 0x0601_0001),
    (AbortReason::NoWritePermission, 0x0601_0002),
    (AbortReason::ObjectNotFound, 0x0602_0000),
    (AbortReason::MappingError, 0x0604_0041),
    (AbortReason::MappingLengthError, 0x0604_0042),
    (AbortReason::ParameterIncompatible, 0x0604_0043),
    (AbortReason::InternalIncompatibility, 0x0604_0047),
    (AbortReason::HardwareError, 0x0606_0000),
    (AbortReason::DataTypeMismatch, 0x0607_0010),
    (AbortReason::SubIndexNotFound, 0x0609_0011),
    (AbortReason::InvalidValue, 0x0609_0030),
    (AbortReason::ValueTooHigh, 0x0609_0031),
    (AbortReason::ValueTooLow, 0x0609_0032),
    (AbortReason::General, 0x0800_0000),
    (AbortReason::StoreFailed, 0x0800_0020),
    (AbortReason::LocalControl, 0x0800_0021),
    (AbortReason::DeviceState, 0x0800_0022),
    (AbortReason::NoData, 0x0800_0024),
    (AbortReason::NetworkIdUnknown, 0x0A00_0001),
    (AbortReason::NodeIdUnknown, 0x0A00_0002),
    (AbortReason::ChannelInUse, 0x0A00_0003),
];

impl AbortReason {
    /// Wire code for this reason.
    pub fn code(self) -> AbortCode {
        ABORT_TABLE
            .iter()
            .find(|(reason, _)| *reason == self)
            .map(|(_, code)| AbortCode(*code))
            .unwrap_or(AbortCode::GENERAL)
    }

    /// Every reason known to the table, in table order.
    pub fn all() -> impl Iterator<Item = AbortReason> {
        ABORT_TABLE.iter().map(|(reason, _)| *reason)
    }
}

/// 32-bit abort code as carried in bytes 4..8 of an abort frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AbortCode(pub u32);

impl AbortCode {
    pub const GENERAL: AbortCode = AbortCode(0x0800_0000);

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Translate a received code back into a reason. Codes outside the
    /// table come back as [`AbortReason::General`].
    pub fn reason(self) -> AbortReason {
        ABORT_TABLE
            .iter()
            .find(|(_, code)| *code == self.0)
            .map(|(reason, _)| *reason)
            .unwrap_or(AbortReason::General)
    }

    /// Human-readable description of the code
    pub fn description(self) -> String {
        match self.0 {
            0x0500_0000 => "Service busy".to_string(),
            0x0503_0000 => "Toggle bit not alternated".to_string(),
            0x0504_0000 => "SDO protocol timed out".to_string(),
            0x0504_0001 => "Client/server command specifier not valid or unknown".to_string(),
            0x0504_0002 => "Invalid block size (block mode only)".to_string(),
            0x0504_0003 => "Invalid sequence number (block mode only)".to_string(),
            0x0504_0004 => "CRC error (block mode only)".to_string(),
            0x0504_0005 => "Out of memory".to_string(),
            0x0601_0000 => "Unsupported access to an object".to_string(),
            0x0601_0001 => "Attempt to read a write only object".to_string(),
            0x0601_0002 => "Attempt to write a read only object".to_string(),
            0x0602_0000 => "Object does not exist in the object dictionary".to_string(),
            0x0604_0041 => "Object cannot be mapped to the PDO".to_string(),
            0x0604_0042 => "The number and length of the objects to be mapped would exceed PDO length".to_string(),
            0x0604_0043 => "General parameter incompatibility reason".to_string(),
            0x0604_0047 => "General internal incompatibility in the device".to_string(),
            0x0606_0000 => "Access failed due to a hardware error".to_string(),
            0x0607_0010 => "Data type does not match, length of service parameter does not match".to_string(),
            0x0607_0012 => "Data type does not match, length of service parameter too high".to_string(),
            0x0607_0013 => "Data type does not match, length of service parameter too low".to_string(),
            0x0609_0011 => "Sub-index does not exist".to_string(),
            0x0609_0030 => "Value range of parameter exceeded (only for write access)".to_string(),
            0x0609_0031 => "Value of parameter written too high".to_string(),
            0x0609_0032 => "Value of parameter written too low".to_string(),
            0x0609_0036 => "Maximum value is less than minimum value".to_string(),
            0x0800_0000 => "General error".to_string(),
            0x0800_0020 => "Data cannot be transferred or stored to the application".to_string(),
            0x0800_0021 => "Data cannot be transferred or stored to the application because of local control".to_string(),
            0x0800_0022 => "Data cannot be transferred or stored to the application because of the present device state".to_string(),
            0x0800_0024 => "No data available".to_string(),
            0x0A00_0001 => "Network id unknown".to_string(),
            0x0A00_0002 => "Node id unknown".to_string(),
            0x0A00_0003 => "SDO channel already in use".to_string(),
            code => format!("Unknown abort code: 0x{:08X}", code),
        }
    }
}

impl From<AbortReason> for AbortCode {
    fn from(reason: AbortReason) -> Self {
        reason.code()
    }
}

impl fmt::Display for AbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X} ({})", self.0, self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_reasons_map_to_wire_codes() {
        assert_eq!(AbortReason::ToggleMismatch.code(), AbortCode(0x0503_0000));
        assert_eq!(AbortReason::Timeout.code(), AbortCode(0x0504_0000));
        assert_eq!(AbortReason::CrcError.code(), AbortCode(0x0504_0004));
        assert_eq!(AbortReason::DataTypeMismatch.code(), AbortCode(0x0607_0010));
        assert_eq!(AbortReason::ChannelInUse.code(), AbortCode(0x0A00_0003));
    }

    #[test]
    fn unknown_code_is_general() {
        assert_eq!(AbortCode(0x1234_5678).reason(), AbortReason::General);
        assert_eq!(AbortCode(0x0607_0012).reason(), AbortReason::General);
    }

    #[test]
    fn descriptions_cover_table_and_fallback() {
        for reason in AbortReason::all() {
            assert!(!reason.code().description().starts_with("Unknown"));
        }
        assert_eq!(
            AbortCode(0xDEAD_BEEF).description(),
            "Unknown abort code: 0xDEADBEEF"
        );
    }

    #[test]
    fn display_includes_hex_and_text() {
        let text = AbortReason::ObjectNotFound.code().to_string();
        assert!(text.starts_with("0x06020000"));
        assert!(text.contains("does not exist"));
    }
}
