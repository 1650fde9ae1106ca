//! Error types for canflash.
//!
//! Two layers live here. [`Error`] is what fallible library calls return
//! (codec, transports, configuration). [`ErrorKind`] is the taxonomy the
//! upgrade engine reports inside an [`ErrorRecord`] when an operation ends
//! badly; records travel through the event stream rather than `Result`s.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for canflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for canflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (CAN socket, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The transport could not create the CAN device.
    #[error("Failed to create CAN device: {0}")]
    DeviceCreate(String),

    /// The CAN device exists but the link could not be brought up.
    #[error("Failed to connect CAN device: {0}")]
    Connect(String),

    /// A frame could not be transmitted.
    #[error("Failed to send frame: {0}")]
    Send(String),

    /// A received frame has an unexpected identifier or length.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A firmware chunk cannot be encoded.
    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// Unsupported plugin or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Operations the engine can run, used to attribute records and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Operation {
    /// Opening the CAN link.
    Connect,
    /// Closing the CAN link.
    Disconnect,
    /// Erase, upload and confirm of a firmware image.
    Flash,
    /// Bootloader version query.
    GetVersion,
    /// Reboot command.
    Reboot,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Disconnect => write!(f, "disconnect"),
            Self::Flash => write!(f, "flash"),
            Self::GetVersion => write!(f, "get-version"),
            Self::Reboot => write!(f, "reboot"),
        }
    }
}

/// Failure kinds reported by the upgrade engine.
///
/// Board response codes are opaque: they are carried verbatim and never
/// mapped onto a closed set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum ErrorKind {
    /// Generic receive timeout (version query, pending link).
    #[error("CAN receive timeout")]
    ReceiveTimeout,

    /// The transport could not create the CAN device.
    #[error("failed to create CAN device")]
    DeviceCreateFailure,

    /// The CAN link could not be established.
    #[error("failed to connect CAN device")]
    ConnectFailure,

    /// The transport refused to transmit a frame.
    #[error("failed to send frame")]
    SendFailure,

    /// No erase acknowledgement within the erase timeout.
    #[error("flash erase: timeout")]
    FlashEraseTimeout,

    /// The board rejected the erase.
    #[error("flash erase error: code({code}), offset({offset})")]
    FlashEraseError {
        /// Board response code.
        code: u32,
        /// Offset reported by the board.
        offset: u32,
    },

    /// No chunk acknowledgement within the upload timeout.
    #[error("firmware upload: timeout")]
    FirmwareUploadTimeout,

    /// The board rejected a chunk.
    #[error("firmware upload error: code({code}), offset({offset})")]
    FirmwareUploadError {
        /// Board response code.
        code: u32,
        /// Offset reported by the board.
        offset: u32,
    },

    /// No confirm acknowledgement within the confirm timeout.
    #[error("confirm: timeout")]
    ConfirmTimeout,

    /// The board answered the confirm request with something unexpected.
    #[error("confirm rejected: code({code}), value({value:#010X})")]
    ConfirmRejected {
        /// Board response code.
        code: u32,
        /// Value reported by the board.
        value: u32,
    },

    /// The board reported a transfer error at confirm time.
    #[error("download failed")]
    DownloadFailed,

    /// A response frame could not be decoded.
    #[error("malformed response frame")]
    MalformedFrame,

    /// The CAN driver reported a link-level error.
    #[error("CAN error: {detail}")]
    CanError {
        /// Driver-provided description.
        detail: String,
    },

    /// The image does not fit the 32-bit size field of the erase request.
    #[error("firmware image too large: {size} bytes")]
    ImageTooLarge {
        /// Image size in bytes.
        size: usize,
    },

    /// Another operation is in flight.
    #[error("busy: another operation is in progress")]
    Busy,

    /// The command needs an open link.
    #[error("CAN not connected")]
    NotConnected,

    /// The operation was cancelled by a disconnect.
    #[error("cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Board response code, when the failure carries one.
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::FlashEraseError { code, .. }
            | Self::FirmwareUploadError { code, .. }
            | Self::ConfirmRejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Byte offset, when the failure carries one.
    pub fn offset(&self) -> Option<u32> {
        match self {
            Self::FlashEraseError { offset, .. } | Self::FirmwareUploadError { offset, .. } => {
                Some(*offset)
            },
            _ => None,
        }
    }

    /// Whether this failure takes the link down with it.
    pub fn is_link_level(&self) -> bool {
        matches!(
            self,
            Self::DeviceCreateFailure | Self::ConnectFailure | Self::CanError { .. }
        )
    }
}

/// Immutable description of a failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[error("{operation} failed: {kind}")]
pub struct ErrorRecord {
    /// Operation that failed.
    pub operation: Operation,
    /// What went wrong.
    pub kind: ErrorKind,
}

impl ErrorRecord {
    /// Create a record.
    pub fn new(operation: Operation, kind: ErrorKind) -> Self {
        Self { operation, kind }
    }

    /// Board response code, if any.
    pub fn code(&self) -> Option<u32> {
        self.kind.code()
    }

    /// Byte offset, if any.
    pub fn offset(&self) -> Option<u32> {
        self.kind.offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_exposes_code_and_offset() {
        let record = ErrorRecord::new(
            Operation::Flash,
            ErrorKind::FirmwareUploadError {
                code: 3,
                offset: 2048,
            },
        );
        assert_eq!(record.code(), Some(3));
        assert_eq!(record.offset(), Some(2048));
        assert_eq!(
            record.to_string(),
            "flash failed: firmware upload error: code(3), offset(2048)"
        );
    }

    #[test]
    fn test_timeouts_carry_no_code() {
        assert_eq!(ErrorKind::FlashEraseTimeout.code(), None);
        assert_eq!(ErrorKind::FirmwareUploadTimeout.offset(), None);
    }

    #[test]
    fn test_confirm_rejected_has_code_but_no_offset() {
        let kind = ErrorKind::ConfirmRejected {
            code: 4,
            value: 0,
        };
        assert_eq!(kind.code(), Some(4));
        assert_eq!(kind.offset(), None);
    }

    #[test]
    fn test_link_level_kinds() {
        assert!(ErrorKind::ConnectFailure.is_link_level());
        assert!(
            ErrorKind::CanError {
                detail: "bus off".into()
            }
            .is_link_level()
        );
        assert!(!ErrorKind::SendFailure.is_link_level());
        assert!(!ErrorKind::Busy.is_link_level());
    }

    #[test]
    fn test_error_display() {
        let err = Error::MalformedFrame("expected 8 bytes, got 3".into());
        assert_eq!(err.to_string(), "Malformed frame: expected 8 bytes, got 3");
    }
}
