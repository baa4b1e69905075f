//! Transfer configuration.
//!
//! Defaults reproduce the reference behaviour: no timeouts, advisory cancel
//! on failure. Timeouts are a hardening option for tags that stop answering.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use gicisky_writer::TransferConfig;
//!
//! let config = TransferConfig::from_json(r#"{ "response_timeout_ms": 5000 }"#).unwrap();
//! assert_eq!(config.response_timeout, Some(Duration::from_secs(5)));
//! assert!(config.cancel_on_failure);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Default bound on the advisory cancel exchange.
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(2);

/// Default capacity of the block-signal queue.
pub const DEFAULT_SIGNAL_QUEUE_CAPACITY: usize = 64;

/// Configuration for a [`ScreenWriter`](crate::ScreenWriter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Maximum wait for a command confirmation. `None` waits forever.
    pub response_timeout: Option<Duration>,
    /// Maximum wait for the next block request. `None` waits forever.
    pub block_timeout: Option<Duration>,
    /// Send the advisory cancel command when a session fails.
    pub cancel_on_failure: bool,
    /// Bound on the advisory cancel exchange.
    pub cancel_timeout: Duration,
    /// Capacity of the queue between notification intake and block writes.
    pub signal_queue_capacity: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            response_timeout: None,
            block_timeout: None,
            cancel_on_failure: true,
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
            signal_queue_capacity: DEFAULT_SIGNAL_QUEUE_CAPACITY,
        }
    }
}

/// On-disk shape of [`TransferConfig`]; durations in milliseconds.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    response_timeout_ms: Option<u64>,
    block_timeout_ms: Option<u64>,
    cancel_on_failure: bool,
    cancel_timeout_ms: u64,
    signal_queue_capacity: usize,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let defaults = TransferConfig::default();
        Self {
            response_timeout_ms: None,
            block_timeout_ms: None,
            cancel_on_failure: defaults.cancel_on_failure,
            cancel_timeout_ms: defaults.cancel_timeout.as_millis() as u64,
            signal_queue_capacity: defaults.signal_queue_capacity,
        }
    }
}

impl From<ConfigFile> for TransferConfig {
    fn from(file: ConfigFile) -> Self {
        Self {
            response_timeout: file.response_timeout_ms.map(Duration::from_millis),
            block_timeout: file.block_timeout_ms.map(Duration::from_millis),
            cancel_on_failure: file.cancel_on_failure,
            cancel_timeout: Duration::from_millis(file.cancel_timeout_ms),
            // A zero-capacity channel cannot be created.
            signal_queue_capacity: file.signal_queue_capacity.max(1),
        }
    }
}

impl TransferConfig {
    /// Parse a JSON configuration document. Missing keys take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(json)?;
        Ok(file.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;

    #[test]
    fn test_default_config() {
        let config = TransferConfig::default();
        assert_eq!(config.response_timeout, None);
        assert_eq!(config.block_timeout, None);
        assert!(config.cancel_on_failure);
        assert_eq!(config.cancel_timeout, DEFAULT_CANCEL_TIMEOUT);
        assert_eq!(config.signal_queue_capacity, DEFAULT_SIGNAL_QUEUE_CAPACITY);
    }

    #[test]
    fn test_empty_json_is_default() {
        let config = TransferConfig::from_json("{}").unwrap();
        assert_eq!(config, TransferConfig::default());
    }

    #[test]
    fn test_full_json() {
        let config = TransferConfig::from_json(
            r#"{
                "response_timeout_ms": 1500,
                "block_timeout_ms": 10000,
                "cancel_on_failure": false,
                "cancel_timeout_ms": 250,
                "signal_queue_capacity": 8
            }"#,
        )
        .unwrap();

        assert_eq!(config.response_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.block_timeout, Some(Duration::from_secs(10)));
        assert!(!config.cancel_on_failure);
        assert_eq!(config.cancel_timeout, Duration::from_millis(250));
        assert_eq!(config.signal_queue_capacity, 8);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let config = TransferConfig::from_json(r#"{ "signal_queue_capacity": 0 }"#).unwrap();
        assert_eq!(config.signal_queue_capacity, 1);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = TransferConfig::from_json(r#"{ "mtu": 247 }"#);
        assert!(matches!(result, Err(TransferError::Config(_))));
    }
}
