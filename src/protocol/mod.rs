//! Protocol module - opcodes, frame codec and block layout.
//!
//! This module implements the tag's application-layer protocol:
//! - Opcode table and status constants
//! - Command/notification frame encoding and decoding
//! - Block slicing for the image characteristic

mod block;
mod frame;
mod opcode;

pub use block::BlockLayout;
pub use frame::{decode_notification, encode_command, CommandFrame, Notification, NotificationFrame};
pub use opcode::{status, Opcode, BLOCK_INDEX_SIZE};
