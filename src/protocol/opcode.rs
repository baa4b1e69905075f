//! Opcode table for the control characteristic.
//!
//! ```text
//! ┌──────┬───────────────────┬─────────┬──────────────────────────┐
//! │ Cmd  │ Payload           │ Confirm │ Confirm payload          │
//! ├──────┼───────────────────┼─────────┼──────────────────────────┤
//! │ 0x01 │ -                 │ 0x01    │ block size (u16 LE)      │
//! │ 0x02 │ image size (u32)  │ 0x02    │ status                   │
//! │ 0x03 │ -                 │ 0x05    │ status [+ index (u32)]   │
//! │ 0x04 │ -                 │ 0x04    │ status                   │
//! │ 0x19 │ 6 address bytes   │ 0x19    │ status                   │
//! │ 0x40 │ settings bytes    │ 0x40    │ status                   │
//! │ 0x50 │ -                 │ 0x50    │ status                   │
//! └──────┴───────────────────┴─────────┴──────────────────────────┘
//! ```
//!
//! All multi-byte integers are Little Endian.

/// Size of the block index prefix on every data-channel write.
pub const BLOCK_INDEX_SIZE: usize = 4;

/// Status values carried by confirmation notifications.
pub mod status {
    /// Command accepted.
    pub const SUCCESS: u8 = 0x00;
    /// Transfer stream: the tag has every block it needs.
    pub const TRANSFER_COMPLETE: u8 = 0x08;
}

/// Opcodes understood by the tag's control characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Query the transfer block size.
    BlockSize = 0x01,
    /// Announce the total payload size (a.k.a. "write screen").
    WriteScreen = 0x02,
    /// Start the chunked transfer.
    StartTransfer = 0x03,
    /// Cancel a pending screen write.
    Cancel = 0x04,
    /// Block request / completion stream (notification only).
    TransferStream = 0x05,
    /// Set a new device address.
    SetAddress = 0x19,
    /// Write a device setting.
    WriteSetting = 0x40,
    /// Leave the device settings mode.
    ExitSettings = 0x50,
}

impl Opcode {
    /// Look up an opcode by its wire byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Opcode::BlockSize),
            0x02 => Some(Opcode::WriteScreen),
            0x03 => Some(Opcode::StartTransfer),
            0x04 => Some(Opcode::Cancel),
            0x05 => Some(Opcode::TransferStream),
            0x19 => Some(Opcode::SetAddress),
            0x40 => Some(Opcode::WriteSetting),
            0x50 => Some(Opcode::ExitSettings),
            _ => None,
        }
    }

    /// Wire byte.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Opcode of the notification that confirms this command.
    ///
    /// `None` for opcodes that are never sent as commands.
    pub fn confirmation(self) -> Option<Opcode> {
        match self {
            Opcode::StartTransfer => Some(Opcode::TransferStream),
            Opcode::TransferStream => None,
            other => Some(other),
        }
    }

    /// True if the confirmation of this command is a single status byte.
    pub fn has_status(self) -> bool {
        matches!(
            self,
            Opcode::WriteScreen
                | Opcode::Cancel
                | Opcode::SetAddress
                | Opcode::WriteSetting
                | Opcode::ExitSettings
        )
    }

    /// Human-readable name used in log lines.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::BlockSize => "block size",
            Opcode::WriteScreen => "write screen",
            Opcode::StartTransfer => "start transfer",
            Opcode::Cancel => "write cancel",
            Opcode::TransferStream => "image transfer",
            Opcode::SetAddress => "set address",
            Opcode::WriteSetting => "write setting",
            Opcode::ExitSettings => "exit settings",
        }
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> u8 {
        opcode.as_u8()
    }
}
