//! Request/response correlation on the control characteristic.
//!
//! The tag answers one command at a time, so the pending request is a single
//! slot holding a oneshot sender rather than a registry keyed by id:
//!
//! ```text
//! send_and_await ──► slot: Some(pending) ──► write Request
//!                                                  │
//! notifications ──► dispatch ──► confirmation ──► oneshot ──► send_and_await
//!                          └──► 0x05 stream ──► mpsc<BlockSignal> ──► FlowController
//! ```
//!
//! [`Correlator::dispatch`] is the single consumer of the notification
//! stream. It runs alongside whichever future is issuing commands; neither
//! spawns a task.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn, Instrument, Span};

use crate::error::{Result, TransferError};
use crate::protocol::{decode_notification, status, CommandFrame, Notification, Opcode};
use crate::transport::{Characteristic, Transport};

/// Flow-control signal carried by the 0x05 notification stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSignal {
    /// The tag is ready to receive this block.
    Ready(u32),
    /// The tag has every block; no further requests will follow.
    Complete,
}

/// The outstanding command, if any.
#[derive(Debug)]
struct PendingRequest {
    opcode: Opcode,
    /// Taken by `dispatch` when the confirmation arrives.
    tx: Option<oneshot::Sender<Result<Notification>>>,
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<PendingRequest>,
    streaming: bool,
}

/// Clears the slot when the request that filled it finishes or is dropped.
struct PendingGuard<'a> {
    slot: &'a Mutex<Slot>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.slot).pending = None;
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Issues commands one at a time and resolves them from notifications.
pub struct Correlator<'a, T> {
    transport: &'a T,
    slot: Mutex<Slot>,
    response_timeout: Option<Duration>,
    span: Span,
}

impl<'a, T: Transport> Correlator<'a, T> {
    /// Create a correlator over `transport`, logging under `parent`.
    pub fn new(transport: &'a T, response_timeout: Option<Duration>, parent: &Span) -> Self {
        Self {
            transport,
            slot: Mutex::new(Slot::default()),
            response_timeout,
            span: tracing::debug_span!(parent: parent, "correlator"),
        }
    }

    /// Opcode of the command currently awaiting confirmation.
    pub fn pending(&self) -> Option<Opcode> {
        lock(&self.slot).pending.as_ref().map(|p| p.opcode)
    }

    /// True once the start-transfer command has been issued.
    pub fn is_streaming(&self) -> bool {
        lock(&self.slot).streaming
    }

    /// Send `command` and wait for its confirmation.
    ///
    /// A second call while one is outstanding fails immediately with
    /// [`TransferError::RequestInFlight`]; the outstanding request is not
    /// affected. A nonzero status byte fails with
    /// [`TransferError::DeviceRejected`].
    ///
    /// Confirmations are only delivered while [`Correlator::dispatch`] is
    /// being polled.
    pub async fn send_and_await(&self, command: CommandFrame) -> Result<Notification> {
        self.send_and_await_inner(command)
            .instrument(self.span.clone())
            .await
    }

    async fn send_and_await_inner(&self, command: CommandFrame) -> Result<Notification> {
        let opcode = command.opcode();
        let rx = self.reserve(opcode)?;
        let _guard = PendingGuard { slot: &self.slot };

        let data = command.encode();
        trace!(?data, "Sending request: {}", opcode.name());
        self.transport.write(Characteristic::Request, data).await?;

        let resolved = match self.response_timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| TransferError::Timeout {
                    opcode: opcode.as_u8(),
                })?,
            None => rx.await,
        };
        let notification = resolved.map_err(|_| TransferError::NotificationsClosed)??;

        if opcode.has_status() {
            if let Notification::Status { status: code, .. } = notification {
                if code != status::SUCCESS {
                    return Err(TransferError::DeviceRejected {
                        opcode: opcode.as_u8(),
                        status: code,
                    });
                }
            }
        }

        debug!("Success: {} request", opcode.name());
        Ok(notification)
    }

    /// Issue the start-transfer command without waiting for a confirmation.
    ///
    /// From here on, 0x05 notifications are routed to the block-signal queue
    /// given to [`Correlator::dispatch`].
    pub async fn start_stream(&self, command: CommandFrame) -> Result<()> {
        let opcode = command.opcode();
        {
            let mut slot = lock(&self.slot);
            if let Some(pending) = &slot.pending {
                return Err(TransferError::RequestInFlight {
                    pending: pending.opcode.as_u8(),
                    requested: opcode.as_u8(),
                });
            }
            slot.streaming = true;
        }

        debug!(parent: &self.span, "Request: {}", opcode.name());
        self.transport
            .write(Characteristic::Request, command.encode())
            .await?;
        Ok(())
    }

    /// Stop routing 0x05 notifications.
    pub fn end_stream(&self) {
        lock(&self.slot).streaming = false;
    }

    fn reserve(&self, opcode: Opcode) -> Result<oneshot::Receiver<Result<Notification>>> {
        let mut slot = lock(&self.slot);
        if let Some(pending) = &slot.pending {
            warn!(
                pending = pending.opcode.name(),
                requested = opcode.name(),
                "Rejecting command while another is in flight"
            );
            return Err(TransferError::RequestInFlight {
                pending: pending.opcode.as_u8(),
                requested: opcode.as_u8(),
            });
        }

        let (tx, rx) = oneshot::channel();
        slot.pending = Some(PendingRequest {
            opcode,
            tx: Some(tx),
        });
        Ok(rx)
    }

    /// Consume notifications until the stream ends or a fatal error occurs.
    ///
    /// Confirmations resolve the pending request. While streaming, block
    /// requests and completion go to `signals` in arrival order; with no
    /// queue they are dropped. Errors are handed to the waiting request if
    /// there is one; otherwise they end the dispatch loop.
    ///
    /// Never returns `Ok`: it runs until the stream closes
    /// ([`TransferError::NotificationsClosed`]) or fails.
    pub async fn dispatch(
        &self,
        notifications: &mut mpsc::Receiver<Bytes>,
        signals: Option<&mpsc::Sender<BlockSignal>>,
    ) -> Result<()> {
        async {
            while let Some(data) = notifications.recv().await {
                trace!(?data, "Received notify");
                if let Err(err) = self.route(&data, signals).await {
                    self.fail_pending(err)?;
                }
            }
            Err(TransferError::NotificationsClosed)
        }
        .instrument(self.span.clone())
        .await
    }

    async fn route(&self, data: &[u8], signals: Option<&mpsc::Sender<BlockSignal>>) -> Result<()> {
        let frame = decode_notification(data)?;
        let notification = Notification::from_frame(&frame)?;

        let signal = match notification {
            Notification::BlockRequest(index) => BlockSignal::Ready(index),
            Notification::TransferComplete => BlockSignal::Complete,
            Notification::TransferStatus(status) => {
                return Err(TransferError::TransferAborted { status })
            }
            _ => return self.resolve(notification),
        };

        if !self.is_streaming() {
            return Err(TransferError::UnexpectedResponse {
                expected: self
                    .pending()
                    .and_then(Opcode::confirmation)
                    .map(Opcode::as_u8),
                received: Opcode::TransferStream.as_u8(),
            });
        }

        match signals {
            Some(queue) => queue
                .send(signal)
                .await
                .map_err(|_| TransferError::NotificationsClosed),
            None => {
                debug!(?signal, "Dropping block signal outside a transfer");
                Ok(())
            }
        }
    }

    /// Hand a confirmation to the waiting request.
    fn resolve(&self, notification: Notification) -> Result<()> {
        let mut slot = lock(&self.slot);
        let received = notification.opcode();

        let pending = match slot.pending.as_mut() {
            Some(pending) if pending.tx.is_some() => pending,
            _ => {
                return Err(TransferError::UnexpectedResponse {
                    expected: None,
                    received: received.as_u8(),
                })
            }
        };

        let expected = pending.opcode.confirmation();
        if expected != Some(received) {
            return Err(TransferError::UnexpectedResponse {
                expected: expected.map(Opcode::as_u8),
                received: received.as_u8(),
            });
        }

        if let Some(tx) = pending.tx.take() {
            // The requester may have given up (timeout or drop).
            let _ = tx.send(Ok(notification));
        }
        Ok(())
    }

    /// Deliver `err` to the waiting request, or return it if nobody waits.
    fn fail_pending(&self, err: TransferError) -> Result<()> {
        let tx = lock(&self.slot)
            .pending
            .as_mut()
            .and_then(|pending| pending.tx.take());

        match tx {
            Some(tx) => {
                warn!(error = %err, "Error in the notify handler");
                let _ = tx.send(Err(err));
                Ok(())
            }
            None => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DeviceEndpoint, MemoryTransport};

    async fn setup() -> (MemoryTransport, DeviceEndpoint, mpsc::Receiver<Bytes>) {
        let (transport, device) = MemoryTransport::pair(247);
        let rx = transport.subscribe(Characteristic::Request).await.unwrap();
        (transport, device, rx)
    }

    #[tokio::test]
    async fn test_block_size_roundtrip() {
        let (transport, mut device, mut rx) = setup().await;
        let correlator = Correlator::new(&transport, None, &Span::none());

        let tag = async {
            let write = device.next_write().await.unwrap();
            assert_eq!(&write.data[..], &[0x01]);
            device.reply(Notification::BlockSize(104)).await.unwrap();
        };

        let (reply, _) = tokio::join!(
            async {
                tokio::select! {
                    r = correlator.send_and_await(CommandFrame::block_size()) => r,
                    e = correlator.dispatch(&mut rx, None) => Err(e.unwrap_err()),
                }
            },
            tag
        );

        assert_eq!(reply.unwrap(), Notification::BlockSize(104));
        assert_eq!(correlator.pending(), None);
    }

    #[tokio::test]
    async fn test_nonzero_status_is_rejected() {
        let (transport, mut device, mut rx) = setup().await;
        let correlator = Correlator::new(&transport, None, &Span::none());

        let tag = async {
            device.next_write().await.unwrap();
            device
                .reply(Notification::Status {
                    opcode: Opcode::WriteScreen,
                    status: 0x01,
                })
                .await
                .unwrap();
        };

        let (reply, _) = tokio::join!(
            async {
                tokio::select! {
                    r = correlator.send_and_await(CommandFrame::write_screen(10)) => r,
                    e = correlator.dispatch(&mut rx, None) => Err(e.unwrap_err()),
                }
            },
            tag
        );

        assert!(matches!(
            reply,
            Err(TransferError::DeviceRejected {
                opcode: 0x02,
                status: 0x01
            })
        ));
    }

    #[tokio::test]
    async fn test_every_status_command_checks_its_status() {
        let (transport, mut device, mut rx) = setup().await;
        let correlator = Correlator::new(&transport, None, &Span::none());

        let tag = async {
            device.next_write().await.unwrap();
            device
                .reply(Notification::Status {
                    opcode: Opcode::Cancel,
                    status: 0x02,
                })
                .await
                .unwrap();
        };

        let (reply, _) = tokio::join!(
            async {
                tokio::select! {
                    r = correlator.send_and_await(CommandFrame::cancel()) => r,
                    e = correlator.dispatch(&mut rx, None) => Err(e.unwrap_err()),
                }
            },
            tag
        );

        assert!(Opcode::Cancel.has_status());
        assert!(matches!(
            reply,
            Err(TransferError::DeviceRejected {
                opcode: 0x04,
                status: 0x02
            })
        ));
    }

    #[tokio::test]
    async fn test_second_request_rejected_while_in_flight() {
        let (transport, mut device, mut rx) = setup().await;
        let correlator = Correlator::new(&transport, None, &Span::none());

        let requests = async {
            let first = correlator.send_and_await(CommandFrame::block_size());
            let second = async {
                // Let the first request claim the slot and write.
                tokio::task::yield_now().await;
                correlator.send_and_await(CommandFrame::cancel()).await
            };
            tokio::join!(first, second)
        };

        let tag = async {
            let write = device.next_write().await.unwrap();
            assert_eq!(&write.data[..], &[0x01]);
            // Only one control write may be in flight.
            tokio::task::yield_now().await;
            assert!(device.try_next_write().is_none());
            device.reply(Notification::BlockSize(64)).await.unwrap();
        };

        let ((first, second), _) = tokio::join!(
            async {
                tokio::select! {
                    r = requests => r,
                    e = correlator.dispatch(&mut rx, None) => panic!("dispatch ended: {e:?}"),
                }
            },
            tag
        );

        assert_eq!(first.unwrap(), Notification::BlockSize(64));
        assert!(matches!(
            second,
            Err(TransferError::RequestInFlight {
                pending: 0x01,
                requested: 0x04
            })
        ));
    }

    #[tokio::test]
    async fn test_unknown_opcode_fails_waiting_request() {
        let (transport, mut device, mut rx) = setup().await;
        let correlator = Correlator::new(&transport, None, &Span::none());

        let tag = async {
            device.next_write().await.unwrap();
            device.notify(vec![0x66, 0x00]).await.unwrap();
        };

        let (reply, _) = tokio::join!(
            async {
                tokio::select! {
                    r = correlator.send_and_await(CommandFrame::block_size()) => r,
                    e = correlator.dispatch(&mut rx, None) => Err(e.unwrap_err()),
                }
            },
            tag
        );

        assert!(matches!(reply, Err(TransferError::UnknownOpcode(0x66))));
    }

    #[tokio::test]
    async fn test_unsolicited_notification_ends_dispatch() {
        let (transport, device, mut rx) = setup().await;
        let correlator = Correlator::new(&transport, None, &Span::none());

        device.notify(vec![0x02, 0x00]).await.unwrap();
        let err = correlator.dispatch(&mut rx, None).await.unwrap_err();

        assert!(matches!(
            err,
            TransferError::UnexpectedResponse {
                expected: None,
                received: 0x02
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_notification_is_malformed() {
        let (transport, device, mut rx) = setup().await;
        let correlator = Correlator::new(&transport, None, &Span::none());

        device.notify(Vec::new()).await.unwrap();
        let err = correlator.dispatch(&mut rx, None).await.unwrap_err();
        assert!(matches!(err, TransferError::MalformedFrame { len: 0, .. }));
    }

    #[tokio::test]
    async fn test_mismatched_confirmation() {
        let (transport, mut device, mut rx) = setup().await;
        let correlator = Correlator::new(&transport, None, &Span::none());

        let tag = async {
            device.next_write().await.unwrap();
            device
                .reply(Notification::Status {
                    opcode: Opcode::Cancel,
                    status: 0,
                })
                .await
                .unwrap();
        };

        let (reply, _) = tokio::join!(
            async {
                tokio::select! {
                    r = correlator.send_and_await(CommandFrame::block_size()) => r,
                    e = correlator.dispatch(&mut rx, None) => Err(e.unwrap_err()),
                }
            },
            tag
        );

        assert!(matches!(
            reply,
            Err(TransferError::UnexpectedResponse {
                expected: Some(0x01),
                received: 0x04
            })
        ));
    }

    #[tokio::test]
    async fn test_stream_signals_routed_in_order() {
        let (transport, mut device, mut rx) = setup().await;
        let correlator = Correlator::new(&transport, None, &Span::none());
        let (signal_tx, mut signal_rx) = mpsc::channel(8);

        correlator
            .start_stream(CommandFrame::start_transfer())
            .await
            .unwrap();
        assert!(correlator.is_streaming());
        assert_eq!(&device.next_write().await.unwrap().data[..], &[0x03]);

        for index in [3, 0, 7] {
            device.reply(Notification::BlockRequest(index)).await.unwrap();
        }
        device.reply(Notification::TransferComplete).await.unwrap();
        drop(device);

        let err = correlator
            .dispatch(&mut rx, Some(&signal_tx))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotificationsClosed));

        let mut received = Vec::new();
        while let Ok(signal) = signal_rx.try_recv() {
            received.push(signal);
        }
        assert_eq!(
            received,
            vec![
                BlockSignal::Ready(3),
                BlockSignal::Ready(0),
                BlockSignal::Ready(7),
                BlockSignal::Complete
            ]
        );
    }

    #[tokio::test]
    async fn test_block_request_before_start_is_unexpected() {
        let (transport, device, mut rx) = setup().await;
        let correlator = Correlator::new(&transport, None, &Span::none());

        device.reply(Notification::BlockRequest(0)).await.unwrap();
        let err = correlator.dispatch(&mut rx, None).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::UnexpectedResponse {
                expected: None,
                received: 0x05
            }
        ));
    }

    #[tokio::test]
    async fn test_transfer_error_status_aborts() {
        let (transport, device, mut rx) = setup().await;
        let correlator = Correlator::new(&transport, None, &Span::none());
        correlator
            .start_stream(CommandFrame::start_transfer())
            .await
            .unwrap();

        device.notify(vec![0x05, 0x03]).await.unwrap();
        let err = correlator.dispatch(&mut rx, None).await.unwrap_err();
        assert!(matches!(err, TransferError::TransferAborted { status: 0x03 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout() {
        let (transport, _device, mut rx) = setup().await;
        let correlator =
            Correlator::new(&transport, Some(Duration::from_secs(1)), &Span::none());

        let reply = tokio::select! {
            r = correlator.send_and_await(CommandFrame::block_size()) => r,
            e = correlator.dispatch(&mut rx, None) => Err(e.unwrap_err()),
        };

        assert!(matches!(reply, Err(TransferError::Timeout { opcode: 0x01 })));
        assert_eq!(correlator.pending(), None);
    }
}
