//! InputChannel: the per-accept handle an application receives messages on.
//!
//! A channel wraps one [`HandoffQueue<Message>`]. The listener pushes
//! decoded broker messages into it; applications pull them out in delivery
//! order by blocking, polling or beginning an asynchronous receive.
//!
//! Closing a channel discards anything still buffered and notifies the
//! listener through a hook registered at creation, so the listener can detach
//! the channel and tear its broker session down.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use wharf_core::{ListenAddress, Message};

use crate::completion::{AsyncState, CompletionCallback, CompletionToken};
use crate::error::{TransportResult, UsageError};
use crate::handoff::{HandoffQueue, Received};
use crate::state::CommunicationState;

/// Invoked once with the channel id when the channel closes or aborts.
pub(crate) type ClosedHook = Box<dyn FnOnce(u64) + Send>;

struct ChannelInner {
    address: ListenAddress,
    queue: HandoffQueue<Message>,
    state: Mutex<CommunicationState>,
    receive_timeout: Duration,
    on_closed: Mutex<Option<ClosedHook>>,
}

/// Receiving side of a listener's single logical channel.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct InputChannel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for InputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputChannel")
            .field("id", &self.id())
            .field("address", &self.inner.address.to_string())
            .field("state", &self.state())
            .field("pending", &self.pending_message_count())
            .finish()
    }
}

impl InputChannel {
    pub(crate) fn new(address: ListenAddress, receive_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                address,
                queue: HandoffQueue::new(),
                state: Mutex::new(CommunicationState::Opened),
                receive_timeout,
                on_closed: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn set_closed_hook(&self, hook: ClosedHook) {
        *self.inner.on_closed.lock() = Some(hook);
    }

    /// Process-unique channel id.
    pub fn id(&self) -> u64 {
        self.inner.queue.id()
    }

    /// Address this channel listens on.
    pub fn address(&self) -> &ListenAddress {
        &self.inner.address
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CommunicationState {
        *self.inner.state.lock()
    }

    /// Messages buffered and not yet received. Diagnostic only.
    pub fn pending_message_count(&self) -> usize {
        self.inner.queue.pending_count()
    }

    /// Receive the next message, blocking up to `timeout`.
    ///
    /// Returns `Ok(None)` once the channel is closed.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`](crate::TransportError::Timeout) if nothing
    /// arrives in time.
    pub fn receive(&self, timeout: Duration) -> TransportResult<Option<Message>> {
        self.inner.queue.dequeue(timeout)
    }

    /// [`receive`](Self::receive) with the configured receive timeout.
    ///
    /// # Errors
    ///
    /// As [`receive`](Self::receive).
    pub fn receive_default(&self) -> TransportResult<Option<Message>> {
        self.receive(self.inner.receive_timeout)
    }

    /// Receive without failing on timeout or close.
    pub fn try_receive(&self, timeout: Duration) -> Received<Message> {
        self.inner.queue.try_dequeue(timeout)
    }

    /// Begin an asynchronous receive.
    pub fn begin_receive(
        &self,
        timeout: Duration,
        callback: Option<CompletionCallback<Option<Message>>>,
        state: Option<AsyncState>,
    ) -> CompletionToken<Option<Message>> {
        self.inner.queue.begin_dequeue(timeout, callback, state)
    }

    /// Finish a receive begun with [`begin_receive`](Self::begin_receive).
    ///
    /// # Errors
    ///
    /// The captured timeout, or a usage error for a token this channel did
    /// not issue or that was already ended.
    pub fn end_receive(
        &self,
        token: &CompletionToken<Option<Message>>,
    ) -> TransportResult<Option<Message>> {
        self.inner.queue.end_dequeue(token)
    }

    /// Wait until a message is buffered (`true`) or the channel closes
    /// (`false`), without receiving it.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`](crate::TransportError::Timeout) if neither
    /// happens in time.
    pub fn wait_for_message(&self, timeout: Duration) -> TransportResult<bool> {
        self.inner.queue.wait_for_item(timeout)
    }

    /// Asynchronous form of [`wait_for_message`](Self::wait_for_message).
    pub fn begin_wait_for_message(
        &self,
        timeout: Duration,
        callback: Option<CompletionCallback<bool>>,
        state: Option<AsyncState>,
    ) -> CompletionToken<bool> {
        self.inner.queue.begin_wait_for_item(timeout, callback, state)
    }

    /// Finish a wait begun with
    /// [`begin_wait_for_message`](Self::begin_wait_for_message).
    ///
    /// # Errors
    ///
    /// As [`end_receive`](Self::end_receive).
    pub fn end_wait_for_message(&self, token: &CompletionToken<bool>) -> TransportResult<bool> {
        self.inner.queue.end_wait_for_item(token)
    }

    /// Enqueue a message for receivers.
    ///
    /// # Errors
    ///
    /// [`UsageError::ChannelNotOpen`] once the channel has started closing.
    pub fn dispatch(&self, message: Message) -> TransportResult<()> {
        let not_open = UsageError::ChannelNotOpen { channel: self.id() };
        if self.state() != CommunicationState::Opened {
            return Err(not_open.into());
        }
        if !self.inner.queue.enqueue_and_dispatch(message) {
            return Err(not_open.into());
        }
        Ok(())
    }

    /// Close the channel, discarding buffered messages. Idempotent.
    pub fn close(&self) {
        self.shut(CommunicationState::Closed);
    }

    /// Abort the channel. Same effect as [`close`](Self::close), recorded as
    /// [`CommunicationState::Aborted`].
    pub fn abort(&self) {
        self.shut(CommunicationState::Aborted);
    }

    fn shut(&self, terminal: CommunicationState) {
        {
            let mut state = self.inner.state.lock();
            if state.is_shutting_down() {
                return;
            }
            *state = CommunicationState::Closing;
        }

        let discarded = self.inner.queue.close_and_discard();
        *self.inner.state.lock() = terminal;
        tracing::debug!(channel = self.id(), discarded, state = %terminal, "channel shut");

        let hook = self.inner.on_closed.lock().take();
        if let Some(hook) = hook {
            hook(self.id());
        }
    }
}
