//! Configuration for broker listeners.
//!
//! [`ListenerConfig`] deserializes from any serde format; missing fields take
//! their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`BrokerListener`](crate::BrokerListener) and the
/// channels it creates.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Listen address URI, e.g. `wharf://broker:61616/queue/orders`.
    ///
    /// Validated on open, not on construction.
    pub address: String,

    /// Timeout applied by `open` when the caller does not supply one.
    pub open_timeout: Duration,

    /// Timeout handed to broker resources when closing gracefully.
    pub close_timeout: Duration,

    /// Default timeout for accepting a channel.
    pub accept_timeout: Duration,

    /// Default timeout for receiving a message on a channel.
    pub receive_timeout: Duration,

    /// Number of decode buffers retained between deliveries.
    pub buffer_pool_capacity: usize,

    /// Largest decode buffer retained, in bytes.
    pub max_buffer_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            open_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(60),
            accept_timeout: Duration::from_secs(600),
            receive_timeout: Duration::from_secs(600),
            buffer_pool_capacity: 64,
            max_buffer_size: 64 * 1024,
        }
    }
}

impl ListenerConfig {
    /// Create a configuration for the given address with default timeouts.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Override the default accept timeout.
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Override the default receive timeout.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Override the open and close timeouts.
    pub fn with_lifecycle_timeouts(mut self, open: Duration, close: Duration) -> Self {
        self.open_timeout = open;
        self.close_timeout = close;
        self
    }

    /// Override the decode buffer pool bounds.
    pub fn with_buffer_pool(mut self, capacity: usize, max_buffer_size: usize) -> Self {
        self.buffer_pool_capacity = capacity;
        self.max_buffer_size = max_buffer_size;
        self
    }

    /// Short timeouts for a broker on the same host.
    pub fn local_broker(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            open_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
            accept_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(30),
            buffer_pool_capacity: 16,
            max_buffer_size: 64 * 1024,
        }
    }

    /// Generous timeouts for a broker across a WAN.
    pub fn remote_broker(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            open_timeout: Duration::from_secs(120),
            close_timeout: Duration::from_secs(120),
            accept_timeout: Duration::from_secs(1800),
            receive_timeout: Duration::from_secs(1800),
            buffer_pool_capacity: 256,
            max_buffer_size: 1024 * 1024,
        }
    }
}
