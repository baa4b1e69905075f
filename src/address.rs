//! Bluetooth device addresses.

use std::fmt;
use std::str::FromStr;

use crate::error::TransferError;

/// A 48-bit device address, stored in display order (`AA:BB:CC:DD:EE:FF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Create from bytes in display order.
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Bytes in display order.
    #[inline]
    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Bytes in the order the tag expects them on the wire (reversed).
    pub fn to_wire(&self) -> [u8; 6] {
        let mut wire = self.0;
        wire.reverse();
        wire
    }

    /// True if the address starts with the given display-order prefix.
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }
}

impl FromStr for DeviceAddress {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransferError::InvalidAddress(s.to_string());

        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split([':', '-']);
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}
