//! In-process broker for tests, demos and single-process deployments.
//!
//! Destinations are named backlogs shared by every connection of the same
//! [`InMemoryBroker`]. Each consumer owns one delivery thread that pops frames
//! in publish order and invokes the consumer's handler; competing consumers on
//! one destination split its frames point-to-point.
//!
//! Failure injection ([`fail_next_connect`](InMemoryBroker::fail_next_connect),
//! [`fail_close`](InMemoryBroker::fail_close),
//! [`raise_exception`](InMemoryBroker::raise_exception)) and counters make
//! the listener's lazy-creation and teardown paths observable.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! use wharf_core::{BrokerAddress, DestinationKind};
//! use wharf_transport::{Broker, BrokerConnection, BrokerConsumer, BrokerSession, InMemoryBroker};
//!
//! let broker = InMemoryBroker::new();
//! let connection = broker.connect(&BrokerAddress::new("local", 1)).unwrap();
//! connection.start().unwrap();
//! let session = connection.create_session().unwrap();
//! let orders = session.resolve_destination("orders", DestinationKind::Queue).unwrap();
//! let consumer = session.create_consumer(&orders).unwrap();
//!
//! let (tx, rx) = mpsc::channel();
//! let tx = std::sync::Mutex::new(tx);
//! consumer.set_message_handler(Arc::new(move |frame: Option<Vec<u8>>| {
//!     let _ = tx.lock().unwrap().send(frame);
//! }));
//!
//! broker.publish("orders", b"hello".to_vec());
//! let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap();
//! assert_eq!(frame.as_deref(), Some(&b"hello"[..]));
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use wharf_core::{BrokerAddress, DestinationKind};

use super::{
    Broker, BrokerConnection, BrokerConsumer, BrokerError, BrokerSession, ExceptionHandler,
    MessageHandler,
};

/// Kind of broker resource, used by failure injection and the teardown log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerResource {
    /// A connection.
    Connection,
    /// A session.
    Session,
    /// A consumer.
    Consumer,
}

impl BrokerResource {
    fn as_str(&self) -> &'static str {
        match self {
            BrokerResource::Connection => "connection",
            BrokerResource::Session => "session",
            BrokerResource::Consumer => "consumer",
        }
    }
}

impl fmt::Display for BrokerResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Destination {
    name: String,
    backlog: Mutex<VecDeque<Option<Vec<u8>>>>,
    ready: Condvar,
}

#[derive(Default)]
struct BrokerInner {
    destinations: Mutex<HashMap<String, Arc<Destination>>>,
    connections: Mutex<Vec<Weak<ConnectionInner>>>,
    next_connect_error: Mutex<Option<BrokerError>>,
    failing_closes: Mutex<HashSet<BrokerResource>>,
    teardown_log: Mutex<Vec<BrokerResource>>,
    connections_opened: AtomicUsize,
    sessions_opened: AtomicUsize,
    consumers_opened: AtomicUsize,
}

impl BrokerInner {
    fn destination(&self, name: &str) -> Arc<Destination> {
        let mut destinations = self.destinations.lock();
        Arc::clone(destinations.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Destination {
                name: name.to_string(),
                backlog: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
            })
        }))
    }

    fn record_close(&self, resource: BrokerResource) -> Result<(), BrokerError> {
        self.teardown_log.lock().push(resource);
        if self.failing_closes.lock().remove(&resource) {
            return Err(BrokerError::Fatal(format!("injected {resource} close failure")));
        }
        Ok(())
    }
}

/// Broker living entirely inside the process.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("connections_opened", &self.connections_opened())
            .field("sessions_opened", &self.sessions_opened())
            .field("consumers_opened", &self.consumers_opened())
            .finish()
    }
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame to `destination`, creating it if needed.
    pub fn publish(&self, destination: &str, frame: impl Into<Vec<u8>>) {
        self.push_frame(destination, Some(frame.into()));
    }

    /// Append an empty frame, delivered to handlers as `None`.
    pub fn publish_empty(&self, destination: &str) {
        self.push_frame(destination, None);
    }

    fn push_frame(&self, destination: &str, frame: Option<Vec<u8>>) {
        let destination = self.inner.destination(destination);
        destination.backlog.lock().push_back(frame);
        destination.ready.notify_all();
    }

    /// Frames published to `destination` and not yet delivered.
    pub fn backlog_len(&self, destination: &str) -> usize {
        self.inner
            .destinations
            .lock()
            .get(destination)
            .map_or(0, |d| d.backlog.lock().len())
    }

    /// Make the next [`connect`](Broker::connect) fail with `error`.
    pub fn fail_next_connect(&self, error: BrokerError) {
        *self.inner.next_connect_error.lock() = Some(error);
    }

    /// Make the next close of `resource` fail. The close still takes effect.
    pub fn fail_close(&self, resource: BrokerResource) {
        self.inner.failing_closes.lock().insert(resource);
    }

    /// Report `error` to every open connection's exception handler.
    ///
    /// Returns the number of handlers invoked.
    pub fn raise_exception(&self, error: BrokerError) -> usize {
        let handlers: Vec<ExceptionHandler> = {
            let mut connections = self.inner.connections.lock();
            connections.retain(|c| c.strong_count() > 0);
            connections
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|c| !c.closed.load(Ordering::Acquire))
                .filter_map(|c| c.exception_handler.lock().clone())
                .collect()
        };
        for handler in &handlers {
            handler(error.clone());
        }
        handlers.len()
    }

    /// Connections opened so far.
    pub fn connections_opened(&self) -> usize {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    /// Sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    /// Consumers opened so far.
    pub fn consumers_opened(&self) -> usize {
        self.inner.consumers_opened.load(Ordering::SeqCst)
    }

    /// Every close attempt, in order, including failed ones.
    pub fn teardown_log(&self) -> Vec<BrokerResource> {
        self.inner.teardown_log.lock().clone()
    }
}

impl Broker for InMemoryBroker {
    type Connection = MemoryConnection;

    fn connect(&self, address: &BrokerAddress) -> Result<MemoryConnection, BrokerError> {
        if let Some(error) = self.inner.next_connect_error.lock().take() {
            return Err(error);
        }
        let connection = Arc::new(ConnectionInner {
            broker: Arc::clone(&self.inner),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            exception_handler: Mutex::new(None),
        });
        self.inner
            .connections
            .lock()
            .push(Arc::downgrade(&connection));
        self.inner.connections_opened.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(broker = %address, "in-memory connection opened");
        Ok(MemoryConnection { inner: connection })
    }
}

struct ConnectionInner {
    broker: Arc<BrokerInner>,
    started: AtomicBool,
    closed: AtomicBool,
    exception_handler: Mutex<Option<ExceptionHandler>>,
}

/// Connection to an [`InMemoryBroker`].
pub struct MemoryConnection {
    inner: Arc<ConnectionInner>,
}

impl BrokerConnection for MemoryConnection {
    type Session = MemorySession;

    fn set_exception_handler(&self, handler: ExceptionHandler) {
        *self.inner.exception_handler.lock() = Some(handler);
    }

    fn start(&self) -> Result<(), BrokerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed("connection"));
        }
        self.inner.started.store(true, Ordering::Release);
        Ok(())
    }

    fn create_session(&self) -> Result<MemorySession, BrokerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed("connection"));
        }
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(BrokerError::NotStarted);
        }
        self.inner
            .broker
            .sessions_opened
            .fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            broker: Arc::clone(&self.inner.broker),
            closed: AtomicBool::new(false),
        })
    }

    fn close(&self, _timeout: Duration) -> Result<(), BrokerError> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.exception_handler.lock().take();
        self.inner.broker.record_close(BrokerResource::Connection)
    }
}

/// Destination handle resolved by a [`MemorySession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDestination {
    /// Destination name.
    pub name: String,
    /// Kind it was resolved as.
    pub kind: DestinationKind,
}

/// Session on a [`MemoryConnection`].
pub struct MemorySession {
    broker: Arc<BrokerInner>,
    closed: AtomicBool,
}

impl BrokerSession for MemorySession {
    type Destination = MemoryDestination;
    type Consumer = MemoryConsumer;

    fn resolve_destination(
        &self,
        name: &str,
        kind: DestinationKind,
    ) -> Result<MemoryDestination, BrokerError> {
        if name.is_empty() {
            return Err(BrokerError::DestinationNotFound {
                name: name.to_string(),
            });
        }
        Ok(MemoryDestination {
            name: name.to_string(),
            kind,
        })
    }

    fn create_consumer(
        &self,
        destination: &MemoryDestination,
    ) -> Result<MemoryConsumer, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed("session"));
        }
        self.broker.consumers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConsumer {
            inner: Arc::new(ConsumerInner {
                destination: self.broker.destination(&destination.name),
                handler: Mutex::new(None),
                stopped: AtomicBool::new(false),
                delivering: AtomicBool::new(false),
            }),
            broker: Arc::clone(&self.broker),
        })
    }

    fn close(&self, _timeout: Duration) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        self.broker.record_close(BrokerResource::Session)
    }
}

struct ConsumerInner {
    destination: Arc<Destination>,
    handler: Mutex<Option<MessageHandler>>,
    stopped: AtomicBool,
    delivering: AtomicBool,
}

impl ConsumerInner {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // taken so a delivery thread between its check and its wait sees the stop
        let _backlog = self.destination.backlog.lock();
        self.destination.ready.notify_all();
    }

    fn next_frame(&self) -> Option<Option<Vec<u8>>> {
        let mut backlog = self.destination.backlog.lock();
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            if let Some(frame) = backlog.pop_front() {
                return Some(frame);
            }
            self.destination.ready.wait(&mut backlog);
        }
    }

    fn deliver(self: Arc<Self>) {
        while let Some(frame) = self.next_frame() {
            let handler = self.handler.lock().clone();
            match handler {
                Some(handler) => handler(frame),
                None => break,
            }
        }
        tracing::trace!(destination = %self.destination.name, "delivery thread stopped");
    }
}

/// Consumer on an in-memory destination.
///
/// Dropping the consumer stops its delivery thread.
pub struct MemoryConsumer {
    inner: Arc<ConsumerInner>,
    broker: Arc<BrokerInner>,
}

impl BrokerConsumer for MemoryConsumer {
    fn set_message_handler(&self, handler: MessageHandler) {
        *self.inner.handler.lock() = Some(handler);
        if self.inner.delivering.swap(true, Ordering::AcqRel) {
            return;
        }

        let consumer = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name(format!("wharf-consumer-{}", self.inner.destination.name))
            .spawn(move || consumer.deliver());
        if let Err(e) = spawned {
            self.inner.delivering.store(false, Ordering::Release);
            tracing::error!(
                destination = %self.inner.destination.name,
                error = %e,
                "failed to start delivery thread"
            );
        }
    }

    fn close(&self, _timeout: Duration) -> Result<(), BrokerError> {
        self.inner.stop();
        self.broker.record_close(BrokerResource::Consumer)
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn started_session(broker: &InMemoryBroker) -> (MemoryConnection, MemorySession) {
        let connection = broker
            .connect(&BrokerAddress::new("local", 1))
            .expect("connect");
        connection.start().expect("start");
        let session = connection.create_session().expect("session");
        (connection, session)
    }

    fn channel_handler() -> (MessageHandler, mpsc::Receiver<Option<Vec<u8>>>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler: MessageHandler = Arc::new(move |frame: Option<Vec<u8>>| {
            let _ = tx.lock().send(frame);
        });
        (handler, rx)
    }

    #[test]
    fn test_session_requires_started_connection() {
        let broker = InMemoryBroker::new();
        let connection = broker
            .connect(&BrokerAddress::new("local", 1))
            .expect("connect");
        assert_eq!(
            connection.create_session().err(),
            Some(BrokerError::NotStarted)
        );
        connection.start().expect("start");
        assert!(connection.create_session().is_ok());
    }

    #[test]
    fn test_frames_delivered_in_publish_order() {
        let broker = InMemoryBroker::new();
        let (_connection, session) = started_session(&broker);
        let destination = session
            .resolve_destination("orders", DestinationKind::Queue)
            .expect("resolve");

        broker.publish("orders", b"1".to_vec());
        broker.publish_empty("orders");
        broker.publish("orders", b"3".to_vec());

        let consumer = session.create_consumer(&destination).expect("consumer");
        let (handler, rx) = channel_handler();
        consumer.set_message_handler(handler);

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).expect("1"), Some(b"1".to_vec()));
        assert_eq!(rx.recv_timeout(timeout).expect("empty"), None);
        assert_eq!(rx.recv_timeout(timeout).expect("3"), Some(b"3".to_vec()));
        assert_eq!(broker.backlog_len("orders"), 0);
    }

    #[test]
    fn test_closed_consumer_stops_delivery() {
        let broker = InMemoryBroker::new();
        let (_connection, session) = started_session(&broker);
        let destination = session
            .resolve_destination("q", DestinationKind::Queue)
            .expect("resolve");
        let consumer = session.create_consumer(&destination).expect("consumer");
        let (handler, rx) = channel_handler();
        consumer.set_message_handler(handler);

        consumer.close(Duration::ZERO).expect("close");
        std::thread::sleep(Duration::from_millis(20));
        broker.publish("q", b"late".to_vec());

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(broker.backlog_len("q"), 1);
    }

    #[test]
    fn test_injected_connect_failure_is_single_shot() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connect(BrokerError::ConnectionFailed("refused".into()));

        let address = BrokerAddress::new("local", 1);
        assert!(broker.connect(&address).is_err());
        assert!(broker.connect(&address).is_ok());
        assert_eq!(broker.connections_opened(), 1);
    }

    #[test]
    fn test_injected_close_failure_still_logs_teardown() {
        let broker = InMemoryBroker::new();
        let (connection, session) = started_session(&broker);
        broker.fail_close(BrokerResource::Session);

        assert!(session.close(Duration::ZERO).is_err());
        assert!(connection.close(Duration::ZERO).is_ok());
        assert_eq!(
            broker.teardown_log(),
            vec![BrokerResource::Session, BrokerResource::Connection]
        );
    }

    #[test]
    fn test_raise_exception_reaches_open_connections_only() {
        let broker = InMemoryBroker::new();
        let (open, _s1) = started_session(&broker);
        let (closed, _s2) = started_session(&broker);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for connection in [&open, &closed] {
            let seen = seen.clone();
            connection.set_exception_handler(Arc::new(move |e: BrokerError| seen.lock().push(e)));
        }
        closed.close(Duration::ZERO).expect("close");

        assert_eq!(broker.raise_exception(BrokerError::Transient("blip".into())), 1);
        assert_eq!(*seen.lock(), vec![BrokerError::Transient("blip".into())]);
    }

    #[test]
    fn test_empty_destination_name_does_not_resolve() {
        let broker = InMemoryBroker::new();
        let (_connection, session) = started_session(&broker);
        assert!(matches!(
            session.resolve_destination("", DestinationKind::Topic),
            Err(BrokerError::DestinationNotFound { .. })
        ));
    }
}
