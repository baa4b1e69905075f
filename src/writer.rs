//! Screen writer: drives a whole screen update.
//!
//! A transfer runs three commands, then hands over to the tag's pacing:
//!
//! ```text
//! 0x01 block size ─► 0x02 image size ─► 0x03 start ─► [0x05 ready N ─► block N]* ─► 0x05 complete
//! ```
//!
//! The command sequence and [`Correlator::dispatch`] run side by side in one
//! `select!`. Whichever fails first fails the session; the losing future is
//! dropped, which also releases any pending request.
//!
//! # Example
//!
//! ```ignore
//! use gicisky_writer::ScreenWriter;
//!
//! let writer = ScreenWriter::builder(transport)
//!     .response_timeout(std::time::Duration::from_secs(10))
//!     .build();
//!
//! let report = writer.transfer_image(encoded).await?;
//! println!("{} blocks", report.blocks_sent);
//! ```

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument, Span};

use crate::address::DeviceAddress;
use crate::config::TransferConfig;
use crate::correlator::{BlockSignal, Correlator};
use crate::error::{Result, TransferError};
use crate::flow::FlowController;
use crate::protocol::{CommandFrame, Notification, Opcode};
use crate::session::{Phase, Session, TransferReport};
use crate::transport::{Characteristic, Transport};

/// Builder for configuring and creating a [`ScreenWriter`].
pub struct ScreenWriterBuilder<T> {
    transport: T,
    config: TransferConfig,
    span: Option<Span>,
}

impl<T: Transport> ScreenWriterBuilder<T> {
    /// Create a builder over a connected transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            config: TransferConfig::default(),
            span: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: TransferConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum wait for a command confirmation.
    ///
    /// Default: wait forever
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = Some(timeout);
        self
    }

    /// Set the maximum wait for the next block request.
    ///
    /// Default: wait forever
    pub fn block_timeout(mut self, timeout: Duration) -> Self {
        self.config.block_timeout = Some(timeout);
        self
    }

    /// Enable or disable the advisory cancel after a failure.
    ///
    /// Default: enabled
    pub fn cancel_on_failure(mut self, enabled: bool) -> Self {
        self.config.cancel_on_failure = enabled;
        self
    }

    /// Set the bound on the advisory cancel exchange.
    ///
    /// Default: 2 seconds
    pub fn cancel_timeout(mut self, timeout: Duration) -> Self {
        self.config.cancel_timeout = timeout;
        self
    }

    /// Set the block-signal queue capacity.
    ///
    /// Default: 64
    pub fn signal_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.signal_queue_capacity = capacity.max(1);
        self
    }

    /// Log under `span` instead of a fresh `screen_update` span.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Build the writer.
    pub fn build(self) -> ScreenWriter<T> {
        ScreenWriter {
            transport: self.transport,
            config: self.config,
            span: self
                .span
                .unwrap_or_else(|| tracing::info_span!("screen_update")),
        }
    }
}

/// Writes encoded images (and device settings) to a connected tag.
pub struct ScreenWriter<T> {
    transport: T,
    config: TransferConfig,
    span: Span,
}

impl<T: Transport> ScreenWriter<T> {
    /// Create a writer with default configuration.
    pub fn new(transport: T) -> Self {
        ScreenWriterBuilder::new(transport).build()
    }

    /// Create a new writer builder.
    pub fn builder(transport: T) -> ScreenWriterBuilder<T> {
        ScreenWriterBuilder::new(transport)
    }

    /// Get the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get the configuration.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Send an encoded image to the tag.
    pub async fn transfer_image(&self, image: impl Into<Bytes>) -> Result<TransferReport> {
        self.transfer_image_until(image, std::future::pending())
            .await
    }

    /// Send an encoded image, giving up when `abort` resolves.
    ///
    /// An aborted transfer fails with [`TransferError::Cancelled`] after the
    /// advisory cancel has been attempted.
    pub async fn transfer_image_until<F>(
        &self,
        image: impl Into<Bytes>,
        abort: F,
    ) -> Result<TransferReport>
    where
        F: Future<Output = ()>,
    {
        let mut session = Session::new(image.into())?;
        self.run_session(&mut session, abort).await
    }

    /// Drive `session` from `Idle` to a terminal phase.
    ///
    /// On failure the session is left in [`Phase::Failed`] with the first
    /// error recorded, and that error is returned.
    pub async fn run_session<F>(&self, session: &mut Session, abort: F) -> Result<TransferReport>
    where
        F: Future<Output = ()>,
    {
        if session.phase() != Phase::Idle {
            return Err(TransferError::SessionReused);
        }

        let span = tracing::info_span!(
            parent: &self.span,
            "transfer",
            image_len = session.image().len()
        );

        async {
            info!("Sending image data...");
            debug!(mtu = self.transport.negotiated_unit_size(), "MTU");

            let mut notifications = match self.transport.subscribe(Characteristic::Request).await
            {
                Ok(rx) => rx,
                Err(err) => {
                    let err = TransferError::from(err);
                    session.fail(&err);
                    return Err(err);
                }
            };
            let correlator = Correlator::new(&self.transport, self.config.response_timeout, &span);

            let result = tokio::select! {
                r = self.exchange(session, &correlator, &mut notifications) => r,
                _ = abort => Err(TransferError::Cancelled),
            };

            let outcome = match result {
                Ok(()) => session.report().ok_or(TransferError::NotificationsClosed),
                Err(err) => Err(err),
            };

            if let Err(err) = &outcome {
                warn!(error = %err, phase = ?session.phase(), "Transfer failed");
                // A caller abort may land before the tag holds any state;
                // the cancel is still attempted.
                let needs_cancel = matches!(err, TransferError::Cancelled)
                    || matches!(
                        session.phase(),
                        Phase::AnnouncingSize | Phase::StartingTransfer | Phase::Transferring
                    );
                session.fail(err);
                if needs_cancel && self.config.cancel_on_failure {
                    self.advisory_cancel(&correlator, &mut notifications).await;
                }
            }

            correlator.end_stream();
            if let Err(err) = self.transport.unsubscribe(Characteristic::Request).await {
                debug!(error = %err, "Stop notify failed");
            }

            if let Ok(report) = &outcome {
                info!(blocks_sent = report.blocks_sent, "Done.");
            }
            outcome
        }
        .instrument(span.clone())
        .await
    }

    /// Run the command sequence alongside notification intake.
    async fn exchange(
        &self,
        session: &mut Session,
        correlator: &Correlator<'_, T>,
        notifications: &mut mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        let (signal_tx, mut signal_rx) = mpsc::channel(self.config.signal_queue_capacity);
        let drive = self.drive(session, correlator, &mut signal_rx);
        tokio::pin!(drive);

        let ended = tokio::select! {
            r = &mut drive => return r,
            r = correlator.dispatch(notifications, Some(&signal_tx)) => r,
        };

        // The tag may drop the link right after its final 0x05. Signals
        // already queued still count; an empty queue then reports closed.
        drop(signal_tx);
        match ended {
            Err(TransferError::NotificationsClosed) if correlator.is_streaming() => drive.await,
            other => other.and(Err(TransferError::NotificationsClosed)),
        }
    }

    /// The handshake and the paced transfer, in order.
    async fn drive(
        &self,
        session: &mut Session,
        correlator: &Correlator<'_, T>,
        signals: &mut mpsc::Receiver<BlockSignal>,
    ) -> Result<()> {
        session.advance();
        debug!("Request: block size");
        let block_size = match correlator.send_and_await(CommandFrame::block_size()).await? {
            Notification::BlockSize(size) => size,
            other => {
                return Err(TransferError::UnexpectedResponse {
                    expected: Some(Opcode::BlockSize.as_u8()),
                    received: other.opcode().as_u8(),
                })
            }
        };
        debug!(block_size, "Received block size");

        let layout = session.set_block_size(block_size)?;
        if block_size as usize > self.transport.negotiated_unit_size() {
            warn!(
                block_size,
                mtu = self.transport.negotiated_unit_size(),
                "Block size exceeds the negotiated transfer unit"
            );
        }

        session.advance();
        debug!(size = session.image_len(), "Request: write screen");
        correlator
            .send_and_await(CommandFrame::write_screen(session.image_len()))
            .await?;

        session.advance();
        correlator
            .start_stream(CommandFrame::start_transfer())
            .await?;

        session.advance();
        let flow = FlowController::new(&self.transport, self.config.block_timeout, &Span::current());
        flow.run(session, layout, signals).await?;

        session.advance();
        Ok(())
    }

    /// Best-effort 0x04. Its outcome is logged and otherwise ignored.
    async fn advisory_cancel(
        &self,
        correlator: &Correlator<'_, T>,
        notifications: &mut mpsc::Receiver<Bytes>,
    ) {
        debug!("Request: write cancel");
        let exchange = async {
            tokio::select! {
                r = correlator.send_and_await(CommandFrame::cancel()) => r.map(|_| ()),
                r = correlator.dispatch(notifications, None) => {
                    r.and(Err(TransferError::NotificationsClosed))
                }
            }
        };

        match tokio::time::timeout(self.config.cancel_timeout, exchange).await {
            Ok(Ok(())) => debug!("Success: update cancel request"),
            Ok(Err(err)) => debug!(error = %err, "Advisory cancel failed"),
            Err(_) => debug!("Advisory cancel timed out"),
        }
    }

    /// Cancel a pending screen write (0x04).
    pub async fn cancel(&self) -> Result<()> {
        self.command(CommandFrame::cancel()).await.map(|_| ())
    }

    /// Give the tag a new address (0x19).
    pub async fn set_address(&self, address: DeviceAddress) -> Result<()> {
        info!(%address, "Request: set address");
        self.command(CommandFrame::set_address(&address))
            .await
            .map(|_| ())
    }

    /// Write raw device settings (0x40).
    pub async fn write_settings(&self, settings: &[u8]) -> Result<()> {
        debug!(len = settings.len(), "Request: write settings");
        self.command(CommandFrame::write_setting(settings))
            .await
            .map(|_| ())
    }

    /// Leave the settings mode (0x50).
    pub async fn exit_settings(&self) -> Result<()> {
        self.command(CommandFrame::exit_settings())
            .await
            .map(|_| ())
    }

    /// One command in its own subscribe/unsubscribe bracket.
    async fn command(&self, command: CommandFrame) -> Result<Notification> {
        let span = tracing::debug_span!(parent: &self.span, "command", opcode = command.opcode().name());

        async {
            let mut notifications = self.transport.subscribe(Characteristic::Request).await?;
            let correlator = Correlator::new(&self.transport, self.config.response_timeout, &span);

            let result = tokio::select! {
                r = correlator.send_and_await(command) => r,
                r = correlator.dispatch(&mut notifications, None) => {
                    r.and(Err(TransferError::NotificationsClosed))
                }
            };

            if let Err(err) = self.transport.unsubscribe(Characteristic::Request).await {
                debug!(error = %err, "Stop notify failed");
            }
            result
        }
        .instrument(span.clone())
        .await
    }
}

/// Send an encoded image over `transport` with default configuration.
pub async fn transfer_image<T: Transport>(
    transport: &T,
    image: impl Into<Bytes>,
) -> Result<TransferReport> {
    ScreenWriter::new(transport).transfer_image(image).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_builder_configuration() {
        let (transport, _device) = MemoryTransport::pair(247);
        let writer = ScreenWriter::builder(transport)
            .response_timeout(Duration::from_secs(3))
            .block_timeout(Duration::from_secs(30))
            .cancel_on_failure(false)
            .cancel_timeout(Duration::from_millis(500))
            .signal_queue_capacity(0)
            .build();

        let config = writer.config();
        assert_eq!(config.response_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.block_timeout, Some(Duration::from_secs(30)));
        assert!(!config.cancel_on_failure);
        assert_eq!(config.cancel_timeout, Duration::from_millis(500));
        assert_eq!(config.signal_queue_capacity, 1);
    }

    #[test]
    fn test_builder_default() {
        let (transport, _device) = MemoryTransport::pair(247);
        let writer = ScreenWriter::new(transport);
        assert_eq!(writer.config(), &TransferConfig::default());
        assert_eq!(writer.transport().negotiated_unit_size(), 247);
    }

    #[tokio::test]
    async fn test_session_cannot_be_reused() {
        let (transport, _device) = MemoryTransport::pair(247);
        let writer = ScreenWriter::new(&transport);

        let mut session = Session::new(Bytes::from_static(&[1, 2, 3])).unwrap();
        session.advance();

        let err = writer
            .run_session(&mut session, std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SessionReused));
    }

    #[tokio::test]
    async fn test_empty_image_rejected_before_io() {
        let (transport, mut device) = MemoryTransport::pair(247);
        let err = transfer_image(&transport, Bytes::new()).await.unwrap_err();

        assert!(matches!(err, TransferError::EmptyImage));
        assert!(device.try_next_write().is_none());
        assert!(!device.is_subscribed());
    }

    #[tokio::test]
    async fn test_set_address_sends_reversed_bytes() {
        let (transport, mut device) = MemoryTransport::pair(247);
        let writer = ScreenWriter::new(&transport);
        let address: DeviceAddress = "FF:FF:01:02:03:04".parse().unwrap();

        let tag = async {
            let write = device.next_write().await.unwrap();
            assert_eq!(write.characteristic, Characteristic::Request);
            assert_eq!(&write.data[..], &[0x19, 0x04, 0x03, 0x02, 0x01, 0xFF, 0xFF]);
            device
                .reply(Notification::Status {
                    opcode: Opcode::SetAddress,
                    status: 0,
                })
                .await
                .unwrap();
        };

        let (result, _) = tokio::join!(writer.set_address(address), tag);
        result.unwrap();
        assert!(!device.is_subscribed());
    }

    #[tokio::test]
    async fn test_write_settings_rejected() {
        let (transport, mut device) = MemoryTransport::pair(247);
        let writer = ScreenWriter::new(&transport);

        let tag = async {
            let write = device.next_write().await.unwrap();
            assert_eq!(&write.data[..], &[0x40, 0x01, 0x02]);
            device
                .reply(Notification::Status {
                    opcode: Opcode::WriteSetting,
                    status: 0x05,
                })
                .await
                .unwrap();
        };

        let (result, _) = tokio::join!(writer.write_settings(&[0x01, 0x02]), tag);
        assert!(matches!(
            result,
            Err(TransferError::DeviceRejected {
                opcode: 0x40,
                status: 0x05
            })
        ));
    }

    #[tokio::test]
    async fn test_exit_settings_and_cancel() {
        let (transport, mut device) = MemoryTransport::pair(247);
        let writer = ScreenWriter::new(&transport);

        let tag = async {
            for opcode in [Opcode::ExitSettings, Opcode::Cancel] {
                let write = device.next_write().await.unwrap();
                assert_eq!(&write.data[..], &[opcode.as_u8()]);
                device
                    .reply(Notification::Status { opcode, status: 0 })
                    .await
                    .unwrap();
            }
        };

        let commands = async {
            writer.exit_settings().await?;
            writer.cancel().await
        };

        let (result, _) = tokio::join!(commands, tag);
        result.unwrap();
    }
}
