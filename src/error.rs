//! Error types for gicisky-writer.

use thiserror::Error;

/// Main error type for all screen-update operations.
///
/// Every variant is fatal to the session that produced it. Retrying means
/// starting a new session.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A received notification could not be decoded.
    #[error("Malformed frame (opcode {opcode:#04x?}, {len} bytes)")]
    MalformedFrame {
        /// Opcode byte, if the buffer had one.
        opcode: Option<u8>,
        /// Length of the offending buffer.
        len: usize,
    },

    /// Notification opcode not in the protocol table.
    #[error("Unknown notification opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// The tag answered a command with a nonzero status.
    #[error("Device rejected command {opcode:#04x} with status {status:#04x}")]
    DeviceRejected {
        /// Command opcode.
        opcode: u8,
        /// Status byte returned by the tag.
        status: u8,
    },

    /// Negotiated block size cannot carry the index prefix plus one byte.
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u16),

    /// The tag asked for a block past the end of the image.
    #[error("Block index {index} out of range ({blocks_total} blocks)")]
    IndexOutOfRange {
        /// Requested block index.
        index: u32,
        /// Number of blocks in the image.
        blocks_total: u32,
    },

    /// The transfer stream reported a status other than "ready" or "complete".
    #[error("Transfer aborted by device (status {status:#04x})")]
    TransferAborted {
        /// Status byte of the 0x05 notification.
        status: u8,
    },

    /// A well-formed notification arrived that does not confirm the
    /// outstanding command.
    #[error("Unexpected response {received:#04x} (expected {expected:#04x?})")]
    UnexpectedResponse {
        /// Confirmation opcode that was expected, if any request was pending.
        expected: Option<u8>,
        /// Opcode that was received.
        received: u8,
    },

    /// A command was issued while another one was still awaiting its
    /// confirmation.
    #[error("Command {requested:#04x} rejected: {pending:#04x} still in flight")]
    RequestInFlight {
        /// Opcode of the outstanding command.
        pending: u8,
        /// Opcode of the rejected command.
        requested: u8,
    },

    /// No confirmation or block request arrived within the configured time.
    #[error("Timed out waiting for response to {opcode:#04x}")]
    Timeout {
        /// Opcode whose response was awaited.
        opcode: u8,
    },

    /// Transport-level I/O failure (connection drop, write failure).
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The notification stream ended while the session was still running.
    #[error("Notification stream closed")]
    NotificationsClosed,

    /// The caller aborted the session.
    #[error("Transfer cancelled")]
    Cancelled,

    /// A session was run after it had already been started.
    #[error("Session already used; start a new one")]
    SessionReused,

    /// Encoded image is empty.
    #[error("Image is empty")]
    EmptyImage,

    /// Encoded image does not fit the 4-byte size announcement.
    #[error("Image too large: {0} bytes")]
    ImageTooLarge(usize),

    /// A device address could not be parsed.
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    /// Bitplane geometry or contents are not encodable.
    #[error("Invalid bitmap: {0}")]
    InvalidBitmap(String),

    /// Configuration could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl TransferError {
    /// Opcode of the step that failed, where the error carries one.
    pub fn opcode(&self) -> Option<u8> {
        match self {
            TransferError::DeviceRejected { opcode, .. } => Some(*opcode),
            TransferError::Timeout { opcode } => Some(*opcode),
            TransferError::UnknownOpcode(opcode) => Some(*opcode),
            TransferError::UnexpectedResponse { received, .. } => Some(*received),
            TransferError::MalformedFrame { opcode, .. } => *opcode,
            TransferError::TransferAborted { .. } | TransferError::IndexOutOfRange { .. } => {
                Some(0x05)
            }
            TransferError::InvalidBlockSize(_) => Some(0x01),
            _ => None,
        }
    }

    /// Status byte reported by the tag, where the error carries one.
    pub fn status(&self) -> Option<u8> {
        match self {
            TransferError::DeviceRejected { status, .. } => Some(*status),
            TransferError::TransferAborted { status } => Some(*status),
            _ => None,
        }
    }

    /// True for errors caused by the tag breaking the protocol contract.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TransferError::MalformedFrame { .. }
                | TransferError::UnknownOpcode(_)
                | TransferError::IndexOutOfRange { .. }
                | TransferError::TransferAborted { .. }
                | TransferError::UnexpectedResponse { .. }
                | TransferError::InvalidBlockSize(_)
        )
    }
}

/// Result type alias using TransferError.
pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_rejected_accessors() {
        let err = TransferError::DeviceRejected {
            opcode: 0x02,
            status: 0x01,
        };
        assert_eq!(err.opcode(), Some(0x02));
        assert_eq!(err.status(), Some(0x01));
        assert!(!err.is_protocol_violation());
        assert_eq!(
            err.to_string(),
            "Device rejected command 0x02 with status 0x01"
        );
    }

    #[test]
    fn test_transport_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "link lost");
        let err: TransferError = io.into();
        assert!(matches!(err, TransferError::Transport(_)));
        assert_eq!(err.opcode(), None);
    }

    #[test]
    fn test_protocol_violation_classification() {
        assert!(TransferError::UnknownOpcode(0x77).is_protocol_violation());
        assert!(TransferError::IndexOutOfRange {
            index: 10,
            blocks_total: 10
        }
        .is_protocol_violation());
        assert!(!TransferError::Cancelled.is_protocol_violation());
    }
}
