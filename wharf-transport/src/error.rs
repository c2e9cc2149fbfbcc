//! Error types for the wharf transport layer.

use std::time::Duration;

use wharf_core::{AddressParseError, CodecError};

use crate::broker::BrokerError;

/// Programmer contract violations.
///
/// These are never retried: they surface immediately to the caller that broke
/// the contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    /// A completion token was completed a second time.
    #[error("operation already completed")]
    AlreadyCompleted,

    /// A completion token was ended a second time.
    #[error("operation already ended")]
    AlreadyEnded,

    /// Synchronous completion was reported after someone started waiting.
    #[error("synchronous completion reported after a wait handle was created")]
    SynchronousCompletionObserved,

    /// A token was ended by a component that did not issue it.
    #[error("token issued by {issued_by} cannot be ended by {ended_by}")]
    ForeignToken {
        /// Owner id recorded in the token.
        issued_by: u64,
        /// Owner id of the component asked to end it.
        ended_by: u64,
    },

    /// A message was dispatched to a channel that is not open.
    #[error("channel {channel} is not open")]
    ChannelNotOpen {
        /// Id of the channel.
        channel: u64,
    },
}

/// Errors that can occur in the transport layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Contract violation by the caller.
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    /// A timed wait expired.
    #[error("operation timed out after {timeout:?}")]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The object is closed and cannot perform the operation.
    #[error("{what} is closed")]
    Closed {
        /// What was closed.
        what: &'static str,
    },

    /// Invalid state for the requested operation.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Details about the invalid state.
        message: String,
    },

    /// Broker client error.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Frame could not be decoded or encoded.
    #[error("codec error: {message}")]
    Codec {
        /// Details about the codec failure.
        message: String,
    },

    /// Listener configuration is unusable.
    #[error("configuration error: {message}")]
    Configuration {
        /// Details about the configuration problem.
        message: String,
    },

    /// The listener faulted on an unrecoverable broker error.
    #[error("listener faulted: {message}")]
    Faulted {
        /// The error that faulted the listener.
        message: String,
    },
}

impl TransportError {
    /// Whether this is a timeout rather than a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    /// Whether this is a usage error.
    pub fn is_usage(&self) -> bool {
        matches!(self, TransportError::Usage(_))
    }
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        TransportError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<AddressParseError> for TransportError {
    fn from(err: AddressParseError) -> Self {
        TransportError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_distinguished() {
        let err = TransportError::Timeout {
            timeout: Duration::from_millis(5),
        };
        assert!(err.is_timeout());
        assert!(!err.is_usage());
        assert!(err.to_string().contains("5ms"));
    }

    #[test]
    fn test_usage_error_conversion() {
        let err: TransportError = UsageError::AlreadyEnded.into();
        assert!(err.is_usage());
        assert_eq!(err.to_string(), "usage error: operation already ended");
    }

    #[test]
    fn test_address_error_becomes_configuration() {
        let err: TransportError = AddressParseError::MissingScheme.into();
        assert!(matches!(err, TransportError::Configuration { .. }));
    }
}
