//! Pluggable message encoding for broker frames.
//!
//! The [`MessageEncoder`] trait is the boundary between raw broker frames and
//! structured [`Message`]s. Two encoders are provided:
//!
//! - [`JsonEncoder`]: a text envelope carrying id, headers and a UTF-8 body.
//! - [`RawEncoder`]: the frame *is* the body; ids are assigned on decode.
//!
//! # Example
//!
//! ```rust
//! use wharf_core::{BufferPool, JsonEncoder, Message, MessageEncoder};
//!
//! let encoder = JsonEncoder;
//! let pool = BufferPool::default();
//!
//! let msg = Message::text("order-1", "created").with_header("kind", "order");
//! let frame = encoder.encode(&msg).unwrap();
//! let decoded = encoder.decode(&frame, &pool).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer_pool::BufferPool;
use crate::message::Message;

/// Error type for encoder operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The broker delivered a frame with no content.
    #[error("empty frame")]
    EmptyFrame,

    /// Failed to encode a message to bytes.
    #[error("encode error: {0}")]
    Encode(Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode bytes to a message.
    #[error("decode error: {0}")]
    Decode(Box<dyn std::error::Error + Send + Sync>),

    /// The message cannot be represented by this encoder.
    #[error("unsupported message: {0}")]
    Unsupported(String),
}

/// Converts between broker frames and structured messages.
///
/// Implementations are shared across the broker delivery thread and
/// application threads, hence `Send + Sync`.
pub trait MessageEncoder: Send + Sync + 'static {
    /// MIME-style name of the wire format, for diagnostics.
    fn content_type(&self) -> &'static str;

    /// Decode a raw frame, drawing the body buffer from `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::EmptyFrame`] for zero-length frames and
    /// [`CodecError::Decode`] for malformed ones.
    fn decode(&self, frame: &[u8], pool: &BufferPool) -> Result<Message, CodecError>;

    /// Encode a message to a raw frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] or [`CodecError::Unsupported`] when the
    /// message cannot be written in this format.
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError>;
}

#[derive(Serialize, Deserialize)]
struct JsonFrame<'a> {
    id: Cow<'a, str>,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(borrow, default)]
    body: Cow<'a, str>,
}

/// JSON text envelope encoder.
///
/// Wire form: `{"id":"..","headers":[["k","v"]],"body":".."}`. Bodies must be
/// UTF-8; binary bodies are rejected at encode time.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonEncoder;

impl MessageEncoder for JsonEncoder {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn decode(&self, frame: &[u8], pool: &BufferPool) -> Result<Message, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::EmptyFrame);
        }
        let parsed: JsonFrame<'_> =
            serde_json::from_slice(frame).map_err(|e| CodecError::Decode(Box::new(e)))?;

        let mut body = pool.take(parsed.body.len());
        body.extend_from_slice(parsed.body.as_bytes());

        Ok(Message {
            id: parsed.id.into_owned(),
            headers: parsed.headers,
            body,
        })
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let body = message.body_str().ok_or_else(|| {
            CodecError::Unsupported(format!("message {} has a non UTF-8 body", message.id))
        })?;
        let frame = JsonFrame {
            id: Cow::Borrowed(&message.id),
            headers: message.headers.clone(),
            body: Cow::Borrowed(body),
        };
        serde_json::to_vec(&frame).map_err(|e| CodecError::Encode(Box::new(e)))
    }
}

/// Pass-through encoder: the frame is the message body.
///
/// Headers are not representable and are dropped on encode. Decoded messages
/// get sequential ids of the form `raw-<n>`.
#[derive(Debug)]
pub struct RawEncoder {
    next_id: AtomicU64,
}

impl Default for RawEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RawEncoder {
    /// Create a raw encoder whose ids start at 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }
}

impl MessageEncoder for RawEncoder {
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }

    fn decode(&self, frame: &[u8], pool: &BufferPool) -> Result<Message, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::EmptyFrame);
        }
        let mut body = pool.take(frame.len());
        body.extend_from_slice(frame);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Message {
            id: format!("raw-{id}"),
            headers: Vec::new(),
            body,
        })
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        Ok(message.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_decode_known_frame() {
        let pool = BufferPool::default();
        let frame = br#"{"id":"m-7","headers":[["kind","order"]],"body":"created"}"#;

        let msg = JsonEncoder.decode(frame, &pool).expect("decode should succeed");
        assert_eq!(msg.id, "m-7");
        assert_eq!(msg.header("kind"), Some("order"));
        assert_eq!(msg.body_str(), Some("created"));
    }

    #[test]
    fn test_json_decode_defaults_missing_fields() {
        let pool = BufferPool::default();
        let msg = JsonEncoder
            .decode(br#"{"id":"bare"}"#, &pool)
            .expect("decode should succeed");
        assert!(msg.headers.is_empty());
        assert!(msg.body.is_empty());
    }

    #[test]
    fn test_json_rejects_empty_and_malformed_frames() {
        let pool = BufferPool::default();
        assert!(matches!(
            JsonEncoder.decode(b"", &pool),
            Err(CodecError::EmptyFrame)
        ));
        assert!(matches!(
            JsonEncoder.decode(b"not json", &pool),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_json_rejects_binary_body() {
        let msg = Message::new("bin", vec![0xc3, 0x28]);
        let err = JsonEncoder.encode(&msg).expect_err("binary body should fail");
        assert!(err.to_string().contains("bin"));
    }

    #[test]
    fn test_json_decode_uses_pooled_buffer() {
        let pool = BufferPool::new(1, 1024);
        pool.give_back(Vec::with_capacity(512));
        assert_eq!(pool.available(), 1);

        let frame = JsonEncoder
            .encode(&Message::text("p", "pooled"))
            .expect("encode should succeed");
        let msg = JsonEncoder.decode(&frame, &pool).expect("decode should succeed");

        assert_eq!(pool.available(), 0);
        assert!(msg.body.capacity() >= 512);
    }

    #[test]
    fn test_raw_assigns_sequential_ids() {
        let pool = BufferPool::default();
        let encoder = RawEncoder::new();

        let first = encoder.decode(b"one", &pool).expect("decode should succeed");
        let second = encoder.decode(b"two", &pool).expect("decode should succeed");

        assert_eq!(first.id, "raw-1");
        assert_eq!(second.id, "raw-2");
        assert_eq!(second.body, b"two");
    }

    #[test]
    fn test_raw_encode_drops_headers() {
        let msg = Message::text("x", "payload").with_header("h", "v");
        let frame = RawEncoder::new().encode(&msg).expect("encode should succeed");
        assert_eq!(frame, b"payload");
    }
}
