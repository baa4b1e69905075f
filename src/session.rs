//! Session state for one image transfer.
//!
//! ```text
//! Idle ─► QueryingBlockSize ─► AnnouncingSize ─► StartingTransfer ─► Transferring ─► Complete
//!   │             │                  │                  │                  │
//!   └─────────────┴──────────────────┴──────────────────┴──────────────────┴──► Failed
//! ```
//!
//! `Complete` and `Failed` are terminal; a new transfer needs a new session.

use bytes::Bytes;
use serde::Serialize;

use crate::error::{Result, TransferError};
use crate::protocol::BlockLayout;

/// Lifecycle phase of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Created, nothing sent yet.
    Idle,
    /// 0x01 sent, waiting for the block size.
    QueryingBlockSize,
    /// 0x02 sent, waiting for the tag to accept the image size.
    AnnouncingSize,
    /// 0x03 about to be sent.
    StartingTransfer,
    /// Serving block requests.
    Transferring,
    /// Tag reported the transfer complete.
    Complete,
    /// Session aborted.
    Failed,
}

impl Phase {
    /// Check if this is a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }

    /// The phase that follows this one on the success path.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Idle => Some(Phase::QueryingBlockSize),
            Phase::QueryingBlockSize => Some(Phase::AnnouncingSize),
            Phase::AnnouncingSize => Some(Phase::StartingTransfer),
            Phase::StartingTransfer => Some(Phase::Transferring),
            Phase::Transferring => Some(Phase::Complete),
            Phase::Complete | Phase::Failed => None,
        }
    }
}

/// Where and why a session failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// Phase the session was in when it failed.
    pub phase: Phase,
    /// Opcode of the failing step, if known.
    pub opcode: Option<u8>,
    /// Status byte reported by the tag, if any.
    pub status: Option<u8>,
    /// Rendered error.
    pub message: String,
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    /// Encoded image length in bytes.
    pub image_len: usize,
    /// Negotiated block size.
    pub block_size: u16,
    /// Number of blocks in the image.
    pub blocks_total: u32,
    /// Block writes issued, re-requests included.
    pub blocks_sent: u32,
    /// Bytes written to the image characteristic, index prefixes included.
    pub bytes_sent: usize,
}

/// Mutable state of one transfer attempt.
#[derive(Debug)]
pub struct Session {
    image: Bytes,
    layout: Option<BlockLayout>,
    phase: Phase,
    blocks_sent: u32,
    bytes_sent: usize,
    last_error: Option<Failure>,
}

impl Session {
    /// Create a session for an encoded image.
    pub fn new(image: Bytes) -> Result<Self> {
        if image.is_empty() {
            return Err(TransferError::EmptyImage);
        }
        if u32::try_from(image.len()).is_err() {
            return Err(TransferError::ImageTooLarge(image.len()));
        }

        Ok(Self {
            image,
            layout: None,
            phase: Phase::Idle,
            blocks_sent: 0,
            bytes_sent: 0,
            last_error: None,
        })
    }

    /// Encoded image bytes.
    #[inline]
    pub fn image(&self) -> &Bytes {
        &self.image
    }

    /// Image length as announced to the tag.
    #[inline]
    pub fn image_len(&self) -> u32 {
        // Checked in `new`.
        self.image.len() as u32
    }

    /// Block layout, once the block size has been negotiated.
    #[inline]
    pub fn layout(&self) -> Option<&BlockLayout> {
        self.layout.as_ref()
    }

    /// Current phase.
    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// First failure recorded, if the session failed.
    #[inline]
    pub fn last_error(&self) -> Option<&Failure> {
        self.last_error.as_ref()
    }

    /// Block writes issued so far.
    #[inline]
    pub fn blocks_sent(&self) -> u32 {
        self.blocks_sent
    }

    /// Move to the next phase on the success path.
    ///
    /// Returns the new phase, or `None` if the session is terminal.
    pub(crate) fn advance(&mut self) -> Option<Phase> {
        let next = self.phase.next()?;
        self.phase = next;
        Some(next)
    }

    /// Store the negotiated block size. Only the first value is kept.
    pub(crate) fn set_block_size(&mut self, block_size: u16) -> Result<BlockLayout> {
        if let Some(layout) = self.layout {
            return Ok(layout);
        }
        let layout = BlockLayout::new(block_size, self.image.len())?;
        self.layout = Some(layout);
        Ok(layout)
    }

    /// Count a block write.
    pub(crate) fn record_block(&mut self, len: usize) {
        self.blocks_sent += 1;
        self.bytes_sent += len;
    }

    /// Enter `Failed`, keeping the first error only.
    pub(crate) fn fail(&mut self, error: &TransferError) {
        if self.phase.is_terminal() {
            return;
        }
        self.last_error = Some(Failure {
            phase: self.phase,
            opcode: error.opcode(),
            status: error.status(),
            message: error.to_string(),
        });
        self.phase = Phase::Failed;
    }

    /// Build the transfer summary.
    pub fn report(&self) -> Option<TransferReport> {
        let layout = self.layout?;
        Some(TransferReport {
            image_len: self.image.len(),
            block_size: layout.block_size(),
            blocks_total: layout.blocks_total(),
            blocks_sent: self.blocks_sent,
            bytes_sent: self.bytes_sent,
        })
    }
}
