//! A scripted tag for tests and demos.
//!
//! [`SimulatedTag`] plays the device side of a [`MemoryTransport`] link: it
//! answers the handshake, requests blocks one at a time as each block write
//! arrives, and reassembles the image it receives.
//!
//! [`MemoryTransport`]: crate::transport::MemoryTransport

use std::collections::{HashMap, VecDeque};
use std::io;

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::{Result, TransferError};
use crate::protocol::{status, BlockLayout, Notification, Opcode, BLOCK_INDEX_SIZE};
use crate::transport::{Characteristic, DeviceEndpoint};

/// Behaviour of a simulated tag.
#[derive(Debug, Clone)]
pub struct SimulatedTag {
    block_size: u16,
    rejections: HashMap<Opcode, u8>,
    request_order: Option<Vec<u32>>,
    abort_after: Option<(usize, u8)>,
}

/// Transfer in progress on the tag side.
struct Reassembly {
    layout: BlockLayout,
    image: Vec<u8>,
    queue: VecDeque<u32>,
    awaiting: Option<u32>,
    received: usize,
}

impl SimulatedTag {
    /// A well-behaved tag announcing `block_size`.
    pub fn new(block_size: u16) -> Self {
        Self {
            block_size,
            rejections: HashMap::new(),
            request_order: None,
            abort_after: None,
        }
    }

    /// Answer `opcode` with a nonzero `status`.
    ///
    /// 0x03 is answered on the transfer stream. 0x01 carries no status and
    /// is never rejected.
    pub fn reject(mut self, opcode: Opcode, status: u8) -> Self {
        self.rejections.insert(opcode, status);
        self
    }

    /// Request blocks in this order instead of `0..blocks_total`.
    ///
    /// The transfer completes when the list is exhausted.
    pub fn request_order(mut self, order: Vec<u32>) -> Self {
        self.request_order = Some(order);
        self
    }

    /// Report `status` on the transfer stream after `blocks` blocks.
    pub fn abort_after(mut self, blocks: usize, status: u8) -> Self {
        self.abort_after = Some((blocks, status));
        self
    }

    /// Serve the link until the transfer completes.
    ///
    /// Returns the reassembled image. A cancel command is answered and then
    /// ends the run with [`TransferError::Cancelled`].
    pub async fn run(self, mut device: DeviceEndpoint) -> Result<Bytes> {
        let mut image_len: Option<usize> = None;
        let mut transfer: Option<Reassembly> = None;

        while let Some(write) = device.next_write().await {
            if write.characteristic == Characteristic::Image {
                let Some(transfer) = transfer.as_mut() else {
                    return Err(TransferError::UnexpectedResponse {
                        expected: None,
                        received: Opcode::TransferStream.as_u8(),
                    });
                };

                transfer.store(&write.data)?;
                if let Some((blocks, code)) = self.abort_after {
                    if transfer.received == blocks {
                        info!(status = code, "Tag aborting transfer");
                        device.reply(Notification::TransferStatus(code)).await?;
                        continue;
                    }
                }

                match transfer.request_next() {
                    Some(index) => device.reply(Notification::BlockRequest(index)).await?,
                    None => {
                        device.reply(Notification::TransferComplete).await?;
                        info!(blocks = transfer.received, "Tag received image");
                        return Ok(Bytes::from(std::mem::take(&mut transfer.image)));
                    }
                }
                continue;
            }

            let (&byte, payload) = write
                .data
                .split_first()
                .ok_or(TransferError::MalformedFrame { opcode: None, len: 0 })?;
            let opcode = Opcode::from_u8(byte).ok_or(TransferError::UnknownOpcode(byte))?;
            let code = self.rejections.get(&opcode).copied().unwrap_or(status::SUCCESS);
            debug!(opcode = opcode.name(), status = code, "Tag received command");

            match opcode {
                Opcode::BlockSize => {
                    device.reply(Notification::BlockSize(self.block_size)).await?;
                }
                Opcode::WriteScreen => {
                    let len: [u8; 4] = payload.try_into().map_err(|_| {
                        TransferError::MalformedFrame {
                            opcode: Some(byte),
                            len: write.data.len(),
                        }
                    })?;
                    image_len = Some(u32::from_le_bytes(len) as usize);
                    device.reply(Notification::Status { opcode, status: code }).await?;
                }
                Opcode::StartTransfer if code != status::SUCCESS => {
                    device.reply(Notification::TransferStatus(code)).await?;
                }
                Opcode::StartTransfer => {
                    let len = image_len.ok_or(TransferError::EmptyImage)?;
                    let layout = BlockLayout::new(self.block_size, len)?;
                    let order = self
                        .request_order
                        .clone()
                        .unwrap_or_else(|| (0..layout.blocks_total()).collect());

                    let state = transfer.insert(Reassembly {
                        layout,
                        image: vec![0; len],
                        queue: order.into(),
                        awaiting: None,
                        received: 0,
                    });
                    match state.request_next() {
                        Some(index) => device.reply(Notification::BlockRequest(index)).await?,
                        None => device.reply(Notification::TransferComplete).await?,
                    }
                }
                Opcode::Cancel => {
                    device.reply(Notification::Status { opcode, status: code }).await?;
                    return Err(TransferError::Cancelled);
                }
                _ => {
                    device.reply(Notification::Status { opcode, status: code }).await?;
                }
            }
        }

        Err(io::Error::new(io::ErrorKind::NotConnected, "engine dropped the link").into())
    }
}

impl Reassembly {
    fn request_next(&mut self) -> Option<u32> {
        self.awaiting = self.queue.pop_front();
        self.awaiting
    }

    /// Check a block write against the outstanding request and keep its data.
    fn store(&mut self, data: &[u8]) -> Result<()> {
        let malformed = || TransferError::MalformedFrame {
            opcode: None,
            len: data.len(),
        };
        if data.len() < BLOCK_INDEX_SIZE {
            return Err(malformed());
        }
        let (prefix, chunk) = data.split_at(BLOCK_INDEX_SIZE);
        let index = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);

        if self.awaiting != Some(index) {
            debug!(index, awaiting = ?self.awaiting, "Tag received unrequested block");
            return Err(TransferError::UnexpectedResponse {
                expected: Some(Opcode::TransferStream.as_u8()),
                received: Opcode::TransferStream.as_u8(),
            });
        }

        let range = self.layout.range(index)?;
        if range.len() != chunk.len() {
            return Err(malformed());
        }

        self.image[range].copy_from_slice(chunk);
        self.awaiting = None;
        self.received += 1;
        Ok(())
    }
}
