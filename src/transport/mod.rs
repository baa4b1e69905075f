//! Transport module - the attribute-exchange link to the tag.
//!
//! The engine talks to two characteristics:
//! - **Request** (control): write commands, subscribe to notifications
//! - **Image** (data): write-only, one block per write
//!
//! Backends implement [`Transport`]. Capabilities such as the negotiated
//! transfer unit are part of the trait, so no backend is ever detected at
//! runtime.

use std::future::Future;
use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;

pub mod memory;

pub use memory::{DeviceEndpoint, MemoryTransport, TransportWrite};

/// GATT characteristics used by the screen-update protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// Control characteristic: commands out, confirmations in.
    Request,
    /// Data characteristic: image blocks out.
    Image,
}

impl Characteristic {
    /// 128-bit UUID of the characteristic.
    pub fn uuid(self) -> &'static str {
        match self {
            Characteristic::Request => "0000fef1-0000-1000-8000-00805f9b34fb",
            Characteristic::Image => "0000fef2-0000-1000-8000-00805f9b34fb",
        }
    }
}

/// A connected attribute-exchange link.
///
/// Writes are acknowledged writes: the returned future resolves once the
/// peer has accepted the bytes. Notifications are delivered in order on the
/// receiver returned by [`Transport::subscribe`].
pub trait Transport: Send + Sync {
    /// Negotiated maximum transfer unit, in bytes.
    fn negotiated_unit_size(&self) -> usize;

    /// Start receiving notifications from `characteristic`.
    fn subscribe(
        &self,
        characteristic: Characteristic,
    ) -> impl Future<Output = io::Result<mpsc::Receiver<Bytes>>> + Send;

    /// Stop receiving notifications from `characteristic`.
    fn unsubscribe(
        &self,
        characteristic: Characteristic,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Write `data` to `characteristic`.
    fn write(
        &self,
        characteristic: Characteristic,
        data: Bytes,
    ) -> impl Future<Output = io::Result<()>> + Send;
}

impl<T: Transport> Transport for &T {
    fn negotiated_unit_size(&self) -> usize {
        (**self).negotiated_unit_size()
    }

    fn subscribe(
        &self,
        characteristic: Characteristic,
    ) -> impl Future<Output = io::Result<mpsc::Receiver<Bytes>>> + Send {
        (**self).subscribe(characteristic)
    }

    fn unsubscribe(
        &self,
        characteristic: Characteristic,
    ) -> impl Future<Output = io::Result<()>> + Send {
        (**self).unsubscribe(characteristic)
    }

    fn write(
        &self,
        characteristic: Characteristic,
        data: Bytes,
    ) -> impl Future<Output = io::Result<()>> + Send {
        (**self).write(characteristic, data)
    }
}
