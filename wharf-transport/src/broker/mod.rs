//! Broker client interfaces consumed by the listener.
//!
//! The listener never talks to a concrete broker library. It drives these
//! traits: connect, start the connection, open a session, resolve the
//! destination, create a consumer, then hand the consumer a
//! [`MessageHandler`]. Broker-level failures arrive separately through the
//! connection's [`ExceptionHandler`].
//!
//! Handlers may be invoked from any thread, concurrently, and must not assume
//! their calls are serialized.
//!
//! [`InMemoryBroker`] implements the traits in-process.

mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use wharf_core::{BrokerAddress, DestinationKind};

pub use memory::{
    BrokerResource, InMemoryBroker, MemoryConnection, MemoryConsumer, MemoryDestination,
    MemorySession,
};

/// Callback receiving raw frames from a consumer.
///
/// `None` is an empty or unreadable frame.
pub type MessageHandler = Arc<dyn Fn(Option<Vec<u8>>) + Send + Sync>;

/// Callback receiving broker-level errors from a connection.
pub type ExceptionHandler = Arc<dyn Fn(BrokerError) + Send + Sync>;

/// Errors reported by a broker client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Could not reach or authenticate with the broker.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A session was requested before the connection was started.
    #[error("connection not started")]
    NotStarted,

    /// The resource is already closed.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// The destination does not exist.
    #[error("destination not found: {name}")]
    DestinationNotFound {
        /// Name that failed to resolve.
        name: String,
    },

    /// A condition the client recovers from on its own, such as a failover.
    #[error("transient broker condition: {0}")]
    Transient(String),

    /// A condition the client cannot recover from.
    #[error("fatal broker error: {0}")]
    Fatal(String),
}

impl BrokerError {
    /// Whether the client recovers from this error without intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

/// Entry point to a broker client.
pub trait Broker: Send + Sync + 'static {
    /// Connection type produced by [`connect`](Self::connect).
    type Connection: BrokerConnection;

    /// Open a connection. The connection is not started.
    fn connect(&self, address: &BrokerAddress) -> Result<Self::Connection, BrokerError>;
}

/// An open broker connection.
pub trait BrokerConnection: Send + Sync + 'static {
    /// Session type produced by [`create_session`](Self::create_session).
    type Session: BrokerSession;

    /// Install the handler for broker-level errors.
    fn set_exception_handler(&self, handler: ExceptionHandler);

    /// Start message flow on this connection.
    fn start(&self) -> Result<(), BrokerError>;

    /// Open a session. Fails with [`BrokerError::NotStarted`] before
    /// [`start`](Self::start).
    fn create_session(&self) -> Result<Self::Session, BrokerError>;

    /// Close the connection, waiting at most `timeout`.
    fn close(&self, timeout: Duration) -> Result<(), BrokerError>;
}

/// A session on a connection.
pub trait BrokerSession: Send + Sync + 'static {
    /// Resolved destination handle.
    type Destination: fmt::Debug + Send + Sync;
    /// Consumer type produced by [`create_consumer`](Self::create_consumer).
    type Consumer: BrokerConsumer;

    /// Resolve a logical name and kind to a destination handle.
    fn resolve_destination(
        &self,
        name: &str,
        kind: DestinationKind,
    ) -> Result<Self::Destination, BrokerError>;

    /// Create a consumer on a resolved destination.
    fn create_consumer(
        &self,
        destination: &Self::Destination,
    ) -> Result<Self::Consumer, BrokerError>;

    /// Close the session, waiting at most `timeout`.
    fn close(&self, timeout: Duration) -> Result<(), BrokerError>;
}

/// A consumer delivering frames to one handler.
pub trait BrokerConsumer: Send + Sync + 'static {
    /// Install the delivery handler. Delivery starts once a handler is set.
    fn set_message_handler(&self, handler: MessageHandler);

    /// Stop delivery and close the consumer, waiting at most `timeout`.
    fn close(&self, timeout: Duration) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_recoverable() {
        assert!(BrokerError::Transient("failover".into()).is_recoverable());
        assert!(!BrokerError::Fatal("gone".into()).is_recoverable());
        assert!(!BrokerError::NotStarted.is_recoverable());
    }
}
