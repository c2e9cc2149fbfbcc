//! Listen addresses and destination kinds.
//!
//! A listening endpoint is identified by a URI of the form
//! `wharf://host:port/<kind>/<name>`:
//!
//! - `host:port` is the broker to connect to ([`BrokerAddress`])
//! - `<kind>` is one of `queue`, `topic`, `temp-queue`, `temp-topic`
//! - `<name>` is the logical destination name, resolved by the broker session
//!
//! `wharfs://` selects a TLS connection to the broker.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// URI scheme for plain broker connections.
pub const SCHEME: &str = "wharf";

/// URI scheme for TLS broker connections.
pub const SECURE_SCHEME: &str = "wharfs";

/// Kind tag used to resolve a destination name on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    /// Point-to-point queue.
    Queue,
    /// Publish/subscribe topic.
    Topic,
    /// Queue that lives only as long as the connection that created it.
    TemporaryQueue,
    /// Topic that lives only as long as the connection that created it.
    TemporaryTopic,
}

impl DestinationKind {
    /// Path segment naming this kind in a listen address.
    pub const fn as_segment(&self) -> &'static str {
        match self {
            DestinationKind::Queue => "queue",
            DestinationKind::Topic => "topic",
            DestinationKind::TemporaryQueue => "temp-queue",
            DestinationKind::TemporaryTopic => "temp-topic",
        }
    }

    /// Parse a path segment.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "queue" => Some(DestinationKind::Queue),
            "topic" => Some(DestinationKind::Topic),
            "temp-queue" => Some(DestinationKind::TemporaryQueue),
            "temp-topic" => Some(DestinationKind::TemporaryTopic),
            _ => None,
        }
    }

    /// Whether the destination is scoped to a single connection.
    pub const fn is_temporary(&self) -> bool {
        matches!(self, DestinationKind::TemporaryQueue | DestinationKind::TemporaryTopic)
    }

    /// Whether the destination fans out to every subscriber.
    pub const fn is_topic(&self) -> bool {
        matches!(self, DestinationKind::Topic | DestinationKind::TemporaryTopic)
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_segment())
    }
}

/// Broker host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerAddress {
    /// Host name or IP literal (IPv6 without brackets).
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether the connection uses TLS.
    pub tls: bool,
}

impl BrokerAddress {
    /// Create a plain broker address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    /// Parse from `host:port` or `[v6]:port`.
    ///
    /// # Errors
    ///
    /// Returns error if the host is empty or the port is missing or invalid.
    pub fn parse(s: &str) -> Result<Self, AddressParseError> {
        let (host, port_str) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or(AddressParseError::MissingHost)?;
            let port_str = after
                .strip_prefix(':')
                .ok_or(AddressParseError::MissingPort)?;
            (host, port_str)
        } else {
            s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?
        };

        if host.is_empty() {
            return Err(AddressParseError::MissingHost);
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressParseError::InvalidPort(port_str.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Complete identity of a listening endpoint.
///
/// # Examples
///
/// ```
/// use wharf_core::{DestinationKind, ListenAddress};
///
/// let addr: ListenAddress = "wharf://broker.local:61616/queue/orders".parse().unwrap();
/// assert_eq!(addr.broker.port, 61616);
/// assert_eq!(addr.kind, DestinationKind::Queue);
/// assert_eq!(addr.destination, "orders");
/// assert_eq!(addr.to_string(), "wharf://broker.local:61616/queue/orders");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenAddress {
    /// Broker to connect to.
    pub broker: BrokerAddress,
    /// How the destination name is resolved.
    pub kind: DestinationKind,
    /// Logical destination name.
    pub destination: String,
}

impl ListenAddress {
    /// Create a listen address from its parts.
    pub fn new(
        broker: BrokerAddress,
        kind: DestinationKind,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            kind,
            destination: destination.into(),
        }
    }

    /// Parse a `wharf://host:port/kind/name` URI.
    ///
    /// # Errors
    ///
    /// Returns [`AddressParseError`] describing the first malformed part.
    pub fn parse(s: &str) -> Result<Self, AddressParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressParseError::Empty);
        }
        let (scheme, rest) = s
            .split_once("://")
            .ok_or(AddressParseError::MissingScheme)?;
        let tls = match scheme {
            SCHEME => false,
            SECURE_SCHEME => true,
            other => return Err(AddressParseError::UnsupportedScheme(other.to_string())),
        };

        let (authority, path) = rest
            .split_once('/')
            .ok_or(AddressParseError::MissingDestination)?;
        let mut broker = BrokerAddress::parse(authority)?;
        broker.tls = tls;

        let (kind_segment, name) = path
            .split_once('/')
            .ok_or(AddressParseError::MissingDestination)?;
        let kind = DestinationKind::from_segment(kind_segment)
            .ok_or_else(|| AddressParseError::UnknownDestinationKind(kind_segment.to_string()))?;
        let name = name.trim_end_matches('/');
        if name.is_empty() {
            return Err(AddressParseError::MissingDestination);
        }

        Ok(Self::new(broker, kind, name))
    }
}

impl FromStr for ListenAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.broker.tls { SECURE_SCHEME } else { SCHEME };
        write!(
            f,
            "{}://{}/{}/{}",
            scheme, self.broker, self.kind, self.destination
        )
    }
}

/// Error parsing a listen or broker address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    /// The input was empty.
    #[error("address is empty")]
    Empty,
    /// No `scheme://` prefix.
    #[error("missing scheme separator")]
    MissingScheme,
    /// Scheme other than `wharf` or `wharfs`.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    /// Host part is empty or malformed.
    #[error("missing broker host")]
    MissingHost,
    /// No port separator (`:`) found.
    #[error("missing port separator")]
    MissingPort,
    /// Port is not a valid `u16`.
    #[error("invalid port number: {0}")]
    InvalidPort(String),
    /// Kind segment is not recognized.
    #[error("unknown destination kind: {0}")]
    UnknownDestinationKind(String),
    /// The `/kind/name` path is missing or has an empty name.
    #[error("missing destination")]
    MissingDestination,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_queue_address() {
        let addr = ListenAddress::parse("wharf://10.0.0.1:61616/queue/orders.inbound")
            .expect("parse should succeed");
        assert_eq!(addr.broker, BrokerAddress::new("10.0.0.1", 61616));
        assert_eq!(addr.kind, DestinationKind::Queue);
        assert_eq!(addr.destination, "orders.inbound");
    }

    #[test]
    fn test_parse_tls_temporary_topic() {
        let addr = ListenAddress::parse("wharfs://broker:5671/temp-topic/prices/")
            .expect("parse should succeed");
        assert!(addr.broker.tls);
        assert!(addr.kind.is_temporary());
        assert!(addr.kind.is_topic());
        assert_eq!(addr.destination, "prices");
        assert_eq!(addr.to_string(), "wharfs://broker:5671/temp-topic/prices");
    }

    #[test]
    fn test_parse_ipv6_broker() {
        let addr =
            ListenAddress::parse("wharf://[::1]:61616/topic/events").expect("parse should succeed");
        assert_eq!(addr.broker.host, "::1");
        assert_eq!(addr.broker.to_string(), "[::1]:61616");
    }

    #[test]
    fn test_destination_names_may_contain_slashes() {
        let addr = ListenAddress::parse("wharf://b:1/queue/tenant/a/orders")
            .expect("parse should succeed");
        assert_eq!(addr.destination, "tenant/a/orders");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(ListenAddress::parse(""), Err(AddressParseError::Empty));
        assert_eq!(
            ListenAddress::parse("broker:1/queue/x"),
            Err(AddressParseError::MissingScheme)
        );
        assert_eq!(
            ListenAddress::parse("amqp://b:1/queue/x"),
            Err(AddressParseError::UnsupportedScheme("amqp".to_string()))
        );
        assert_eq!(
            ListenAddress::parse("wharf://b/queue/x"),
            Err(AddressParseError::MissingPort)
        );
        assert_eq!(
            ListenAddress::parse("wharf://b:99999/queue/x"),
            Err(AddressParseError::InvalidPort("99999".to_string()))
        );
        assert_eq!(
            ListenAddress::parse("wharf://:1/queue/x"),
            Err(AddressParseError::MissingHost)
        );
        assert_eq!(
            ListenAddress::parse("wharf://b:1/mailbox/x"),
            Err(AddressParseError::UnknownDestinationKind("mailbox".to_string()))
        );
        assert_eq!(
            ListenAddress::parse("wharf://b:1/queue/"),
            Err(AddressParseError::MissingDestination)
        );
        assert_eq!(
            ListenAddress::parse("wharf://b:1"),
            Err(AddressParseError::MissingDestination)
        );
    }

    #[test]
    fn test_kind_segments_are_symmetric() {
        for kind in [
            DestinationKind::Queue,
            DestinationKind::Topic,
            DestinationKind::TemporaryQueue,
            DestinationKind::TemporaryTopic,
        ] {
            assert_eq!(DestinationKind::from_segment(kind.as_segment()), Some(kind));
        }
    }
}
