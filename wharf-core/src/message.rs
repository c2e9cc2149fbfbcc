//! Structured messages delivered to input channels.
//!
//! A [`Message`] is what an application sees after the broker frame has been
//! decoded by a [`MessageEncoder`](crate::MessageEncoder). The body is opaque
//! bytes; headers carry the broker properties that survived decoding.

use serde::{Deserialize, Serialize};

/// A decoded one-way message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// Broker-assigned or sender-assigned message identifier.
    pub id: String,
    /// Ordered header list (name, value).
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Opaque message body.
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Message {
    /// Create a message with the given id and body and no headers.
    pub fn new(id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Create a message whose body is a UTF-8 string.
    pub fn text(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(id, body.into().into_bytes())
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header value with the given name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Body as a string, if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message() {
        let msg = Message::text("m-1", "hello");
        assert_eq!(msg.id, "m-1");
        assert_eq!(msg.body_str(), Some("hello"));
        assert!(msg.headers.is_empty());
    }

    #[test]
    fn test_header_lookup_returns_first_match() {
        let msg = Message::new("m-1", Vec::new())
            .with_header("reply-to", "none")
            .with_header("content-type", "text/plain")
            .with_header("content-type", "application/json");

        assert_eq!(msg.header("content-type"), Some("text/plain"));
        assert_eq!(msg.header("missing"), None);
    }

    #[test]
    fn test_body_str_rejects_invalid_utf8() {
        let msg = Message::new("m-1", vec![0xff, 0xfe]);
        assert_eq!(msg.body_str(), None);
    }
}
