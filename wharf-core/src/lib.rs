//! # wharf-core
//!
//! Leaf types shared by the wharf transport.
//!
//! This crate has no threads and no broker dependency. It provides:
//!
//! - **Addressing**: [`ListenAddress`], [`BrokerAddress`], [`DestinationKind`]
//! - **Messages**: the decoded [`Message`] handed to input channels
//! - **Encoding**: the [`MessageEncoder`] boundary with [`JsonEncoder`] and
//!   [`RawEncoder`], plus the [`BufferPool`] encoders draw bodies from

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod address;
mod buffer_pool;
mod codec;
mod message;

pub use address::{
    AddressParseError, BrokerAddress, DestinationKind, ListenAddress, SCHEME, SECURE_SCHEME,
};
pub use buffer_pool::BufferPool;
pub use codec::{CodecError, JsonEncoder, MessageEncoder, RawEncoder};
pub use message::Message;
