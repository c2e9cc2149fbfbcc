//! BrokerListener: accepts the single logical channel of one broker endpoint.
//!
//! Broker resources (connection, session, consumer) are created lazily, the
//! first time either an application accepts or the broker delivers, and
//! exactly once no matter how many threads race. Every inbound frame is
//! decoded and funnelled into the live [`InputChannel`]; the call that creates
//! a channel also publishes it to the accept queue.
//!
//! ```text
//!   broker delivery thread               application threads
//!           │                                     │
//!   frame ──► decode ──► dispatch          accept_channel(timeout)
//!                          │                      │
//!                          └──► ensure_channel ◄──┘
//!                                  │  (created?)
//!                     ┌────────────┴─────────────┐
//!            channel.dispatch(msg)     accepted.enqueue(channel)
//! ```
//!
//! # Creation
//!
//! The live-channel slot is read under a read lock only. On a miss the
//! creation guard is taken, the slot re-checked, and only then are broker
//! resources opened. The channel's closed hook clears the slot if it still
//! holds that channel and tears down the resources created with it.
//!
//! # Errors at the broker boundary
//!
//! [`BrokerListener::dispatch`] never returns an error to the delivery thread:
//! failures are logged and the message is dropped. Broker exceptions that the
//! client recovers from are logged and ignored; anything else faults the
//! listener.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use wharf_core::{BufferPool, ListenAddress, Message, MessageEncoder};

use crate::broker::{Broker, BrokerConnection, BrokerConsumer, BrokerError, BrokerSession};
use crate::channel::InputChannel;
use crate::completion::{settle, AsyncState, CompletionCallback, CompletionToken};
use crate::config::ListenerConfig;
use crate::error::{TransportError, TransportResult};
use crate::handoff::HandoffQueue;
use crate::state::CommunicationState;

type ConnectionOf<B> = <B as Broker>::Connection;
type SessionOf<B> = <ConnectionOf<B> as BrokerConnection>::Session;
type ConsumerOf<B> = <SessionOf<B> as BrokerSession>::Consumer;

/// What a [`BrokerListener::dispatch`] call did with its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No message was supplied.
    Ignored,
    /// The message was enqueued on the live channel.
    Delivered {
        /// Whether this call created the channel.
        created: bool,
    },
    /// The message was dropped; the cause was logged.
    Failed,
}

struct BrokerResources<B: Broker> {
    channel_id: u64,
    connection: ConnectionOf<B>,
    session: SessionOf<B>,
    consumer: ConsumerOf<B>,
}

struct ListenerInner<B: Broker, E> {
    broker: B,
    encoder: E,
    config: ListenerConfig,
    pool: BufferPool,
    address: RwLock<Option<ListenAddress>>,
    state: Mutex<CommunicationState>,
    live: RwLock<Option<InputChannel>>,
    creation: Mutex<Option<BrokerResources<B>>>,
    accepted: HandoffQueue<InputChannel>,
    fault: Mutex<Option<TransportError>>,
}

/// Listener for one broker destination.
///
/// Cloning yields another handle to the same listener.
pub struct BrokerListener<B: Broker, E: MessageEncoder> {
    inner: Arc<ListenerInner<B, E>>,
}

impl<B: Broker, E: MessageEncoder> Clone for BrokerListener<B, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Broker, E: MessageEncoder> fmt::Debug for BrokerListener<B, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerListener")
            .field("id", &self.inner.id())
            .field("address", &self.inner.config.address)
            .field("state", &self.state())
            .field("encoder", &self.inner.encoder.content_type())
            .finish()
    }
}

impl<B: Broker, E: MessageEncoder> BrokerListener<B, E> {
    /// Create an unopened listener. No broker resources are touched.
    pub fn new(config: ListenerConfig, broker: B, encoder: E) -> Self {
        let pool = BufferPool::new(config.buffer_pool_capacity, config.max_buffer_size);
        Self {
            inner: Arc::new(ListenerInner {
                broker,
                encoder,
                config,
                pool,
                address: RwLock::new(None),
                state: Mutex::new(CommunicationState::Created),
                live: RwLock::new(None),
                creation: Mutex::new(None),
                accepted: HandoffQueue::new(),
                fault: Mutex::new(None),
            }),
        }
    }

    /// Validate the configured address and start accepting.
    ///
    /// Broker resources are still not created; that happens on the first
    /// accept or delivery.
    ///
    /// # Errors
    ///
    /// [`TransportError::Configuration`] for a missing or malformed address,
    /// which also faults the listener; [`TransportError::InvalidState`] if the
    /// listener was already opened.
    pub fn open(&self, timeout: Duration) -> TransportResult<()> {
        self.inner.open(timeout)
    }

    /// [`open`](Self::open) with the configured open timeout.
    ///
    /// # Errors
    ///
    /// As [`open`](Self::open).
    pub fn open_default(&self) -> TransportResult<()> {
        self.open(self.inner.config.open_timeout)
    }

    /// Accept the listener's channel, creating it if needed.
    ///
    /// Returns `Ok(None)` once the listener is closed.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] if no channel is available in time,
    /// [`TransportError::Faulted`] after an unrecoverable broker error, or
    /// the broker error that prevented creating the channel.
    pub fn accept_channel(&self, timeout: Duration) -> TransportResult<Option<InputChannel>> {
        if !self.inner.prepare_accept()? {
            return Ok(None);
        }
        self.inner.accepted.dequeue(timeout)
    }

    /// [`accept_channel`](Self::accept_channel) with the configured accept
    /// timeout.
    ///
    /// # Errors
    ///
    /// As [`accept_channel`](Self::accept_channel).
    pub fn accept_channel_default(&self) -> TransportResult<Option<InputChannel>> {
        self.accept_channel(self.inner.config.accept_timeout)
    }

    /// Begin an asynchronous accept.
    ///
    /// Channel creation runs on the calling thread; only the wait for an
    /// accepted channel is asynchronous. Creation errors complete the token
    /// synchronously.
    pub fn begin_accept_channel(
        &self,
        timeout: Duration,
        callback: Option<CompletionCallback<Option<InputChannel>>>,
        state: Option<AsyncState>,
    ) -> CompletionToken<Option<InputChannel>> {
        let accepted = &self.inner.accepted;
        let outcome = match self.inner.prepare_accept() {
            Ok(true) => return accepted.begin_dequeue(timeout, callback, state),
            Ok(false) => Ok(None),
            Err(e) => Err(e),
        };
        let token = CompletionToken::with_owner(accepted.id(), callback, state);
        settle(&token, outcome, true);
        token
    }

    /// Finish an accept begun with
    /// [`begin_accept_channel`](Self::begin_accept_channel).
    ///
    /// # Errors
    ///
    /// Whatever the accept captured, or a usage error for a token this
    /// listener did not issue or that was already ended.
    pub fn end_accept_channel(
        &self,
        token: &CompletionToken<Option<InputChannel>>,
    ) -> TransportResult<Option<InputChannel>> {
        self.inner.accepted.end_dequeue(token)
    }

    /// Deliver one inbound message. Called from broker delivery threads.
    ///
    /// Never fails: errors are logged and the message dropped.
    pub fn dispatch(&self, message: Option<Message>) -> DispatchOutcome {
        self.inner.dispatch(message)
    }

    /// Create or retrieve the live channel.
    ///
    /// Returns the channel and whether this call created it. A created channel
    /// is not published to the accept queue; [`dispatch`](Self::dispatch) and
    /// accept do that.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the listener is shutting down, or the
    /// broker error that prevented creating resources.
    pub fn ensure_channel(&self) -> TransportResult<(InputChannel, bool)> {
        self.inner.ensure_channel()
    }

    /// Close gracefully, giving each broker resource the configured close
    /// timeout.
    ///
    /// # Errors
    ///
    /// As [`close`](Self::close).
    pub fn close_default(&self) -> TransportResult<()> {
        self.close(self.inner.config.close_timeout)
    }

    /// Close gracefully: consumer, session and connection in that order, then
    /// the accept queue and the live channel.
    ///
    /// Teardown is best-effort; a resource that fails to close is logged and
    /// the next one is still attempted. Idempotent.
    ///
    /// # Errors
    ///
    /// [`TransportError::Faulted`] if the listener had already faulted. Its
    /// resources are released regardless.
    pub fn close(&self, timeout: Duration) -> TransportResult<()> {
        self.inner.close(timeout)
    }

    /// Tear down immediately with a zero timeout. Never fails.
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CommunicationState {
        *self.inner.state.lock()
    }

    /// Parsed listen address, once opened.
    pub fn address(&self) -> Option<ListenAddress> {
        self.inner.address.read().clone()
    }

    /// Listener configuration.
    pub fn config(&self) -> &ListenerConfig {
        &self.inner.config
    }

    /// Whether a live channel currently exists.
    pub fn has_live_channel(&self) -> bool {
        self.inner.live.read().is_some()
    }

    /// Channels published but not yet accepted.
    pub fn pending_accept_count(&self) -> usize {
        self.inner.accepted.pending_count()
    }

    /// The error that faulted the listener, if any.
    pub fn fault(&self) -> Option<TransportError> {
        self.inner.fault.lock().clone()
    }
}

impl<B: Broker, E: MessageEncoder> ListenerInner<B, E> {
    fn id(&self) -> u64 {
        self.accepted.id()
    }

    fn open(&self, timeout: Duration) -> TransportResult<()> {
        {
            let mut state = self.state.lock();
            if *state != CommunicationState::Created {
                return Err(TransportError::InvalidState {
                    message: format!("cannot open a listener that is {state}"),
                });
            }
            *state = CommunicationState::Opening;
        }

        let parsed = if self.config.address.trim().is_empty() {
            Err(TransportError::Configuration {
                message: "listen address is not configured".to_string(),
            })
        } else {
            ListenAddress::parse(&self.config.address).map_err(TransportError::from)
        };

        match parsed {
            Ok(address) => {
                tracing::debug!(
                    listener = self.id(),
                    address = %address,
                    timeout = ?timeout,
                    "listener opened"
                );
                *self.address.write() = Some(address);
                *self.state.lock() = CommunicationState::Opened;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    listener = self.id(),
                    address = %self.config.address,
                    error = %e,
                    "listener failed to open"
                );
                *self.fault.lock() = Some(e.clone());
                *self.state.lock() = CommunicationState::Faulted;
                Err(e)
            }
        }
    }

    /// Returns `Ok(false)` when the listener is shut and accept should yield
    /// no channel.
    fn prepare_accept(self: &Arc<Self>) -> TransportResult<bool> {
        let state = *self.state.lock();
        match state {
            CommunicationState::Opened => {}
            CommunicationState::Faulted => return Err(self.fault_error()),
            CommunicationState::Closing
            | CommunicationState::Closed
            | CommunicationState::Aborted => return Ok(false),
            state @ (CommunicationState::Created | CommunicationState::Opening) => {
                return Err(TransportError::InvalidState {
                    message: format!("cannot accept on a listener that is {state}"),
                });
            }
        }

        match self.ensure_channel() {
            Ok((channel, created)) => {
                if created {
                    self.publish(channel);
                }
                Ok(true)
            }
            Err(TransportError::Closed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn fault_error(&self) -> TransportError {
        self.fault
            .lock()
            .clone()
            .unwrap_or_else(|| TransportError::Faulted {
                message: "listener faulted".to_string(),
            })
    }

    fn publish(&self, channel: InputChannel) {
        let id = channel.id();
        if self.accepted.enqueue_and_dispatch(channel) {
            tracing::debug!(listener = self.id(), channel = id, "channel published");
        } else {
            tracing::debug!(listener = self.id(), channel = id, "accept queue closed");
        }
    }

    fn dispatch(self: &Arc<Self>, message: Option<Message>) -> DispatchOutcome {
        let Some(message) = message else {
            tracing::trace!(listener = self.id(), "empty delivery ignored");
            return DispatchOutcome::Ignored;
        };

        let message_id = message.id.clone();
        match self.try_dispatch(message) {
            Ok(created) => DispatchOutcome::Delivered { created },
            Err(e) => {
                tracing::error!(
                    listener = self.id(),
                    message_id = %message_id,
                    error = %e,
                    "dispatch failed, message dropped"
                );
                DispatchOutcome::Failed
            }
        }
    }

    fn try_dispatch(self: &Arc<Self>, message: Message) -> TransportResult<bool> {
        let (channel, created) = self.ensure_channel()?;
        let dispatched = channel.dispatch(message);
        // a created channel is published even if this message was refused
        if created {
            self.publish(channel);
        }
        dispatched.map(|()| created)
    }

    fn deliver_frame(self: &Arc<Self>, frame: Option<Vec<u8>>) {
        let message = frame.and_then(|bytes| {
            let decoded = self.encoder.decode(&bytes, &self.pool);
            self.pool.give_back(bytes);
            match decoded {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(
                        listener = self.id(),
                        encoder = self.encoder.content_type(),
                        error = %e,
                        "dropping undecodable frame"
                    );
                    None
                }
            }
        });
        self.dispatch(message);
    }

    fn live_channel(&self) -> Option<InputChannel> {
        self.live.read().clone()
    }

    fn ensure_channel(self: &Arc<Self>) -> TransportResult<(InputChannel, bool)> {
        if let Some(channel) = self.live_channel() {
            return Ok((channel, false));
        }

        let (channel, stale) = {
            let mut resources = self.creation.lock();
            if let Some(channel) = self.live_channel() {
                return Ok((channel, false));
            }

            let state = *self.state.lock();
            if state != CommunicationState::Opened {
                return Err(match state {
                    CommunicationState::Faulted => self.fault_error(),
                    CommunicationState::Created | CommunicationState::Opening => {
                        TransportError::InvalidState {
                            message: format!("listener is {state}"),
                        }
                    }
                    _ => TransportError::Closed { what: "listener" },
                });
            }

            let address = self
                .address
                .read()
                .clone()
                .ok_or_else(|| TransportError::InvalidState {
                    message: "listener opened without an address".to_string(),
                })?;

            let channel = InputChannel::new(address.clone(), self.config.receive_timeout);
            let fresh = self.open_resources(&address, channel.id())?;

            let weak = Arc::downgrade(self);
            channel.set_closed_hook(Box::new(move |channel_id| {
                if let Some(inner) = weak.upgrade() {
                    inner.detach(channel_id);
                }
            }));

            *self.live.write() = Some(channel.clone());
            let stale = resources.replace(fresh);
            (channel, stale)
        };

        if let Some(stale) = stale {
            tracing::debug!(
                listener = self.id(),
                channel = stale.channel_id,
                "releasing resources of a superseded channel"
            );
            self.teardown(stale, Duration::ZERO);
        }
        tracing::debug!(listener = self.id(), channel = channel.id(), "channel created");
        Ok((channel, true))
    }

    fn open_resources(
        self: &Arc<Self>,
        address: &ListenAddress,
        channel_id: u64,
    ) -> TransportResult<BrokerResources<B>> {
        let connection = self.broker.connect(&address.broker)?;

        let weak: Weak<Self> = Arc::downgrade(self);
        connection.set_exception_handler(Arc::new(move |error| {
            if let Some(inner) = weak.upgrade() {
                inner.on_broker_exception(error);
            }
        }));

        let session = connection
            .start()
            .and_then(|()| connection.create_session())
            .inspect_err(|_| {
                self.log_teardown(channel_id, "connection", connection.close(Duration::ZERO));
            })?;

        let consumer = session
            .resolve_destination(&address.destination, address.kind)
            .and_then(|destination| session.create_consumer(&destination))
            .inspect_err(|_| {
                self.log_teardown(channel_id, "session", session.close(Duration::ZERO));
                self.log_teardown(channel_id, "connection", connection.close(Duration::ZERO));
            })?;

        let weak: Weak<Self> = Arc::downgrade(self);
        consumer.set_message_handler(Arc::new(move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.deliver_frame(frame);
            }
        }));

        tracing::debug!(
            listener = self.id(),
            channel = channel_id,
            broker = %address.broker,
            destination = %address.destination,
            kind = %address.kind,
            "broker resources created"
        );
        Ok(BrokerResources {
            channel_id,
            connection,
            session,
            consumer,
        })
    }

    fn detach(&self, channel_id: u64) {
        {
            let mut live = self.live.write();
            if live.as_ref().is_some_and(|c| c.id() == channel_id) {
                *live = None;
            }
        }

        let resources = {
            let mut resources = self.creation.lock();
            if resources.as_ref().is_some_and(|r| r.channel_id == channel_id) {
                resources.take()
            } else {
                None
            }
        };
        if let Some(resources) = resources {
            tracing::debug!(listener = self.id(), channel = channel_id, "channel detached");
            self.teardown(resources, self.config.close_timeout);
        }
    }

    fn teardown(&self, resources: BrokerResources<B>, timeout: Duration) {
        let BrokerResources {
            channel_id,
            connection,
            session,
            consumer,
        } = resources;
        self.log_teardown(channel_id, "consumer", consumer.close(timeout));
        self.log_teardown(channel_id, "session", session.close(timeout));
        self.log_teardown(channel_id, "connection", connection.close(timeout));
    }

    fn log_teardown(
        &self,
        channel_id: u64,
        resource: &'static str,
        result: Result<(), BrokerError>,
    ) {
        if let Err(e) = result {
            tracing::warn!(
                listener = self.id(),
                channel = channel_id,
                resource,
                error = %e,
                "failed to close broker resource"
            );
        }
    }

    fn shut(&self, timeout: Duration) {
        let resources = self.creation.lock().take();
        if let Some(resources) = resources {
            self.teardown(resources, timeout);
        }

        let unclaimed = self.accepted.close_and_discard();
        let live = self.live.write().take();
        if let Some(channel) = live {
            if timeout.is_zero() {
                channel.abort();
            } else {
                channel.close();
            }
        }
        tracing::debug!(listener = self.id(), unclaimed, "listener resources released");
    }

    fn close(&self, timeout: Duration) -> TransportResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                CommunicationState::Closing
                | CommunicationState::Closed
                | CommunicationState::Aborted => return Ok(()),
                CommunicationState::Faulted => {
                    drop(state);
                    self.shut(Duration::ZERO);
                    return Err(self.fault_error());
                }
                CommunicationState::Created
                | CommunicationState::Opening
                | CommunicationState::Opened => *state = CommunicationState::Closing,
            }
        }

        self.shut(timeout);
        *self.state.lock() = CommunicationState::Closed;
        tracing::debug!(listener = self.id(), "listener closed");
        Ok(())
    }

    fn abort(&self) {
        {
            let mut state = self.state.lock();
            if !matches!(
                *state,
                CommunicationState::Closed
                    | CommunicationState::Aborted
                    | CommunicationState::Faulted
            ) {
                *state = CommunicationState::Aborted;
            }
        }
        self.shut(Duration::ZERO);
        tracing::debug!(listener = self.id(), "listener aborted");
    }

    fn on_broker_exception(&self, error: BrokerError) {
        if error.is_recoverable() {
            tracing::warn!(listener = self.id(), error = %error, "recoverable broker error");
            return;
        }

        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = CommunicationState::Faulted;
        }
        tracing::error!(listener = self.id(), error = %error, "listener faulted");
        *self.fault.lock() = Some(TransportError::Faulted {
            message: error.to_string(),
        });
        self.shut(Duration::ZERO);
    }
}
