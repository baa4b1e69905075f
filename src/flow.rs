//! Block flow control for the image characteristic.
//!
//! The tag paces the transfer: each "ready for block N" signal produces
//! exactly one write of block N. Signals are consumed from a single ordered
//! queue, so writes happen in the order the tag asked for them and never
//! overlap. Notification intake keeps running while a write is in progress.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, Instrument, Span};

use crate::correlator::BlockSignal;
use crate::error::{Result, TransferError};
use crate::protocol::{BlockLayout, Opcode};
use crate::session::Session;
use crate::transport::{Characteristic, Transport};

/// Feeds image blocks to the data characteristic as the tag requests them.
pub struct FlowController<'a, T> {
    transport: &'a T,
    block_timeout: Option<Duration>,
    span: Span,
}

impl<'a, T: Transport> FlowController<'a, T> {
    /// Create a flow controller over `transport`, logging under `parent`.
    pub fn new(transport: &'a T, block_timeout: Option<Duration>, parent: &Span) -> Self {
        Self {
            transport,
            block_timeout,
            span: tracing::debug_span!(parent: parent, "flow"),
        }
    }

    /// Serve block requests until the tag reports completion.
    ///
    /// `layout` is the validated geometry for `session`'s image; holding one
    /// is what allows data-channel writes at all.
    pub async fn run(
        &self,
        session: &mut Session,
        layout: BlockLayout,
        signals: &mut mpsc::Receiver<BlockSignal>,
    ) -> Result<()> {
        async {
            debug!("Handle transfer");
            loop {
                match self.next_signal(signals).await? {
                    BlockSignal::Ready(index) => self.send_block(session, &layout, index).await?,
                    BlockSignal::Complete => {
                        debug!(blocks_sent = session.blocks_sent(), "Screen write complete");
                        return Ok(());
                    }
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    async fn next_signal(&self, signals: &mut mpsc::Receiver<BlockSignal>) -> Result<BlockSignal> {
        let signal = match self.block_timeout {
            Some(limit) => tokio::time::timeout(limit, signals.recv())
                .await
                .map_err(|_| TransferError::Timeout {
                    opcode: Opcode::TransferStream.as_u8(),
                })?,
            None => signals.recv().await,
        };
        signal.ok_or(TransferError::NotificationsClosed)
    }

    async fn send_block(
        &self,
        session: &mut Session,
        layout: &BlockLayout,
        index: u32,
    ) -> Result<()> {
        // Fails before any write if the tag asks past the end.
        let block = layout.block(session.image(), index)?;

        info!(
            "Sending image part {}/{}",
            index as u64 + 1,
            layout.blocks_total()
        );
        let len = block.len();
        self.transport.write(Characteristic::Image, block).await?;
        session.record_block(len);
        Ok(())
    }
}
