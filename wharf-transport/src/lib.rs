//! # wharf transport
//!
//! One-way listener/channel transport over a message broker.
//!
//! This crate provides:
//! - **CompletionToken**: dual sync/async completion with exactly-once end
//! - **HandoffQueue**: FIFO rendezvous between delivery threads and receivers
//! - **Broker interfaces**: connection/session/consumer traits and an
//!   in-process [`InMemoryBroker`]
//! - **BrokerListener**: lazy, race-free creation of the broker subscription
//!   and the single [`InputChannel`] fed by it
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use wharf_core::{JsonEncoder, Message, MessageEncoder};
//! use wharf_transport::{BrokerListener, InMemoryBroker, ListenerConfig};
//!
//! let broker = InMemoryBroker::new();
//! let config = ListenerConfig::local_broker("wharf://localhost:61616/queue/orders");
//! let listener = BrokerListener::new(config, broker.clone(), JsonEncoder);
//! listener.open_default().unwrap();
//!
//! let channel = listener.accept_channel(Duration::from_secs(5)).unwrap().unwrap();
//! let frame = JsonEncoder.encode(&Message::text("order-1", "created")).unwrap();
//! broker.publish("orders", frame);
//!
//! let message = channel.receive(Duration::from_secs(5)).unwrap().unwrap();
//! assert_eq!(message.body_str(), Some("created"));
//! listener.close_default().unwrap();
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use wharf_core::{
    AddressParseError, BrokerAddress, BufferPool, CodecError, DestinationKind, JsonEncoder,
    ListenAddress, Message, MessageEncoder, RawEncoder,
};

// =============================================================================
// Modules
// =============================================================================

/// Broker client interfaces and the in-memory broker.
pub mod broker;

mod channel;
mod completion;
mod config;
mod error;
mod handoff;
mod listener;
mod state;
mod timer;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use broker::{
    Broker, BrokerConnection, BrokerConsumer, BrokerError, BrokerResource, BrokerSession,
    ExceptionHandler, InMemoryBroker, MessageHandler,
};
pub use channel::InputChannel;
pub use completion::{AsyncState, CompletionCallback, CompletionToken, UNOWNED, WaitHandle};
pub use config::ListenerConfig;
pub use error::{TransportError, TransportResult, UsageError};
pub use handoff::{HandoffQueue, Received};
pub use listener::{BrokerListener, DispatchOutcome};
pub use state::CommunicationState;
