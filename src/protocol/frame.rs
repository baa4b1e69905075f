//! Command and notification frames.
//!
//! Control-characteristic frames carry no length prefix; the transport
//! delivers each one as a self-delimited message:
//!
//! ```text
//! outbound:  [opcode:1][payload:N]
//! inbound:   [opcode:1][status_or_payload:N]
//! ```
//!
//! # Example
//!
//! ```
//! use gicisky_writer::protocol::{decode_notification, CommandFrame, Notification};
//!
//! let frame = CommandFrame::write_screen(1000);
//! assert_eq!(&frame.encode()[..], &[0x02, 0xE8, 0x03, 0x00, 0x00]);
//!
//! let reply = decode_notification(&[0x01, 0x68, 0x00]).unwrap();
//! let parsed = Notification::from_frame(&reply).unwrap();
//! assert_eq!(parsed, Notification::BlockSize(104));
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::opcode::{status, Opcode};
use crate::address::DeviceAddress;
use crate::error::{Result, TransferError};

/// An outbound command for the control characteristic. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    opcode: Opcode,
    payload: Bytes,
}

impl CommandFrame {
    /// Create a command frame from an opcode and opaque payload.
    pub fn new(opcode: Opcode, payload: Bytes) -> Self {
        Self { opcode, payload }
    }

    /// 0x01: query the transfer block size.
    pub fn block_size() -> Self {
        Self::new(Opcode::BlockSize, Bytes::new())
    }

    /// 0x02: announce the total payload size.
    pub fn write_screen(image_len: u32) -> Self {
        Self::new(
            Opcode::WriteScreen,
            Bytes::copy_from_slice(&image_len.to_le_bytes()),
        )
    }

    /// 0x03: start the chunked transfer.
    pub fn start_transfer() -> Self {
        Self::new(Opcode::StartTransfer, Bytes::new())
    }

    /// 0x04: cancel the screen write.
    pub fn cancel() -> Self {
        Self::new(Opcode::Cancel, Bytes::new())
    }

    /// 0x19: set a new device address (sent in reversed byte order).
    pub fn set_address(address: &DeviceAddress) -> Self {
        Self::new(
            Opcode::SetAddress,
            Bytes::copy_from_slice(&address.to_wire()),
        )
    }

    /// 0x40: write raw device settings.
    pub fn write_setting(settings: &[u8]) -> Self {
        Self::new(Opcode::WriteSetting, Bytes::copy_from_slice(settings))
    }

    /// 0x50: leave settings mode.
    pub fn exit_settings() -> Self {
        Self::new(Opcode::ExitSettings, Bytes::new())
    }

    /// Get the opcode.
    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        encode_command(self.opcode, &self.payload)
    }
}

/// Concatenate opcode byte and payload.
pub fn encode_command(opcode: Opcode, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(opcode.as_u8());
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// A raw inbound notification from the control characteristic.
///
/// The opcode is kept as a raw byte; mapping it onto the protocol table
/// happens in [`Notification::from_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationFrame {
    opcode: u8,
    payload: Bytes,
}

impl NotificationFrame {
    /// Create a notification frame from parts.
    pub fn new(opcode: u8, payload: Bytes) -> Self {
        Self { opcode, payload }
    }

    /// Get the opcode byte.
    #[inline]
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Get a reference to the status/payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Total length on the wire.
    #[inline]
    pub fn len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Always false: a decoded frame holds at least its opcode.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Serialize back to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        buf.put_u8(self.opcode);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    fn malformed(&self) -> TransferError {
        TransferError::MalformedFrame {
            opcode: Some(self.opcode),
            len: self.len(),
        }
    }
}

/// Split a received buffer into opcode and payload.
///
/// Fails with [`TransferError::MalformedFrame`] if the buffer is empty.
pub fn decode_notification(buf: &[u8]) -> Result<NotificationFrame> {
    match buf.split_first() {
        Some((&opcode, payload)) => Ok(NotificationFrame::new(
            opcode,
            Bytes::copy_from_slice(payload),
        )),
        None => Err(TransferError::MalformedFrame {
            opcode: None,
            len: 0,
        }),
    }
}

/// A notification mapped onto the protocol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// 0x01: negotiated block size.
    BlockSize(u16),
    /// Single status byte confirming `opcode`.
    Status {
        /// Confirmed command.
        opcode: Opcode,
        /// Status byte (0 = success).
        status: u8,
    },
    /// 0x05 / 0x00: the tag is ready for this block.
    BlockRequest(u32),
    /// 0x05 / 0x08: no further blocks will be requested.
    TransferComplete,
    /// 0x05 with any other status.
    TransferStatus(u8),
}

impl Notification {
    /// Interpret a raw frame.
    ///
    /// Unknown opcodes yield [`TransferError::UnknownOpcode`]; payloads of the
    /// wrong length yield [`TransferError::MalformedFrame`].
    pub fn from_frame(frame: &NotificationFrame) -> Result<Self> {
        let opcode =
            Opcode::from_u8(frame.opcode()).ok_or(TransferError::UnknownOpcode(frame.opcode()))?;
        let payload = frame.payload();

        match opcode {
            Opcode::BlockSize => match payload {
                [lo, hi] => Ok(Notification::BlockSize(u16::from_le_bytes([*lo, *hi]))),
                _ => Err(frame.malformed()),
            },
            Opcode::TransferStream => match payload {
                [status::SUCCESS, a, b, c, d] => Ok(Notification::BlockRequest(
                    u32::from_le_bytes([*a, *b, *c, *d]),
                )),
                [status::SUCCESS, ..] => Err(frame.malformed()),
                [status::TRANSFER_COMPLETE] => Ok(Notification::TransferComplete),
                [status::TRANSFER_COMPLETE, ..] => Err(frame.malformed()),
                [other, ..] => Ok(Notification::TransferStatus(*other)),
                [] => Err(frame.malformed()),
            },
            // 0x03 is never confirmed directly; the tag answers on 0x05.
            Opcode::StartTransfer => Err(TransferError::UnexpectedResponse {
                expected: None,
                received: opcode.as_u8(),
            }),
            _ => match payload {
                [status] => Ok(Notification::Status {
                    opcode,
                    status: *status,
                }),
                _ => Err(frame.malformed()),
            },
        }
    }

    /// Opcode this notification travels under.
    pub fn opcode(&self) -> Opcode {
        match self {
            Notification::BlockSize(_) => Opcode::BlockSize,
            Notification::Status { opcode, .. } => *opcode,
            Notification::BlockRequest(_)
            | Notification::TransferComplete
            | Notification::TransferStatus(_) => Opcode::TransferStream,
        }
    }

    /// Serialize to wire bytes (as the tag would send it).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u8(self.opcode().as_u8());
        match self {
            Notification::BlockSize(size) => buf.put_u16_le(*size),
            Notification::Status { status, .. } => buf.put_u8(*status),
            Notification::BlockRequest(index) => {
                buf.put_u8(status::SUCCESS);
                buf.put_u32_le(*index);
            }
            Notification::TransferComplete => buf.put_u8(status::TRANSFER_COMPLETE),
            Notification::TransferStatus(status) => buf.put_u8(*status),
        }
        buf.freeze()
    }
}
