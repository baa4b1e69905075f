//! In-memory transport.
//!
//! [`MemoryTransport::pair`] returns the engine side of a link plus a
//! [`DeviceEndpoint`] that plays the tag: it observes every write in order
//! and pushes notifications back.
//!
//! # Example
//!
//! ```
//! use gicisky_writer::transport::{Characteristic, MemoryTransport, Transport};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> std::io::Result<()> {
//! let (transport, mut device) = MemoryTransport::pair(247);
//! let mut notifications = transport.subscribe(Characteristic::Request).await?;
//!
//! transport.write(Characteristic::Request, vec![0x01].into()).await?;
//! let write = device.next_write().await.unwrap();
//! assert_eq!(&write.data[..], &[0x01]);
//!
//! device.notify(vec![0x01, 0x68, 0x00]).await?;
//! assert_eq!(&notifications.recv().await.unwrap()[..], &[0x01, 0x68, 0x00]);
//! # Ok(())
//! # }
//! ```

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Characteristic, Transport};
use crate::protocol::Notification;

/// Default notification channel capacity.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 64;

/// A write observed by the device side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportWrite {
    /// Target characteristic.
    pub characteristic: Characteristic,
    /// Bytes written.
    pub data: Bytes,
}

/// State shared between the two ends of the link.
#[derive(Debug, Default)]
struct Link {
    subscriber: Option<mpsc::Sender<Bytes>>,
    failing: Option<Characteristic>,
}

type SharedLink = Arc<Mutex<Link>>;

fn lock(link: &SharedLink) -> std::sync::MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Engine side of an in-memory link.
#[derive(Debug)]
pub struct MemoryTransport {
    unit_size: usize,
    writes: mpsc::UnboundedSender<TransportWrite>,
    link: SharedLink,
}

impl MemoryTransport {
    /// Create a connected transport/device pair.
    pub fn pair(unit_size: usize) -> (MemoryTransport, DeviceEndpoint) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = SharedLink::default();

        let transport = MemoryTransport {
            unit_size,
            writes: tx,
            link: link.clone(),
        };
        let device = DeviceEndpoint { writes: rx, link };

        (transport, device)
    }
}

impl Transport for MemoryTransport {
    fn negotiated_unit_size(&self) -> usize {
        self.unit_size
    }

    async fn subscribe(&self, characteristic: Characteristic) -> io::Result<mpsc::Receiver<Bytes>> {
        if characteristic != Characteristic::Request {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "characteristic does not notify",
            ));
        }

        let (tx, rx) = mpsc::channel(DEFAULT_NOTIFICATION_CAPACITY);
        lock(&self.link).subscriber = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, _characteristic: Characteristic) -> io::Result<()> {
        lock(&self.link).subscriber = None;
        Ok(())
    }

    async fn write(&self, characteristic: Characteristic, data: Bytes) -> io::Result<()> {
        if lock(&self.link).failing == Some(characteristic) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write rejected by link",
            ));
        }

        self.writes
            .send(TransportWrite {
                characteristic,
                data,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "device disconnected"))
    }
}

/// Device side of an in-memory link.
///
/// Dropping the endpoint disconnects the link: the notification stream ends
/// and further writes fail.
#[derive(Debug)]
pub struct DeviceEndpoint {
    writes: mpsc::UnboundedReceiver<TransportWrite>,
    link: SharedLink,
}

impl DeviceEndpoint {
    /// Wait for the next write from the engine.
    ///
    /// Returns `None` once the engine side has been dropped.
    pub async fn next_write(&mut self) -> Option<TransportWrite> {
        self.writes.recv().await
    }

    /// Take a write that has already arrived, without waiting.
    pub fn try_next_write(&mut self) -> Option<TransportWrite> {
        self.writes.try_recv().ok()
    }

    /// Push raw notification bytes to the current subscriber.
    pub async fn notify(&self, data: impl Into<Bytes>) -> io::Result<()> {
        let subscriber = lock(&self.link).subscriber.clone();
        let tx = subscriber
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no subscriber"))?;

        tx.send(data.into())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "subscriber dropped"))
    }

    /// Push a protocol notification to the current subscriber.
    pub async fn reply(&self, notification: Notification) -> io::Result<()> {
        self.notify(notification.encode()).await
    }

    /// True while the engine is subscribed to the control characteristic.
    pub fn is_subscribed(&self) -> bool {
        lock(&self.link).subscriber.is_some()
    }

    /// Make every subsequent write to `characteristic` fail, or clear with `None`.
    pub fn fail_writes_to(&self, characteristic: Option<Characteristic>) {
        lock(&self.link).failing = characteristic;
    }
}

impl Drop for DeviceEndpoint {
    fn drop(&mut self) {
        lock(&self.link).subscriber = None;
    }
}
