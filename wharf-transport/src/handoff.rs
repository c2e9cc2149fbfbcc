//! HandoffQueue: producer/consumer rendezvous between delivery threads and
//! receivers.
//!
//! Items are handed directly to the oldest waiting reader when one exists and
//! buffered otherwise. Readers can block with a timeout, poll without failing,
//! or begin an asynchronous dequeue that completes from whichever thread later
//! enqueues, closes the queue, or lets the timeout expire.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` guards items, readers and availability waiters
//! - Tokens are completed after the lock is released, so callbacks may
//!   re-enter the queue
//! - Blocking reads wait on the token's own handle, never on the queue lock
//! - Asynchronous timeouts go through the shared [`timer`](crate::timer)
//!   thread; lock order is queue, then timer
//!
//! Items and readers are both served FIFO.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::completion::{next_owner_id, settle, AsyncState, CompletionCallback, CompletionToken};
use crate::error::{TransportError, TransportResult};
use crate::timer::{self, TimerHandle};

/// Outcome of a non-failing dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received<T> {
    /// An item was dequeued.
    Item(T),
    /// The queue is closed and drained.
    Closed,
    /// The timeout elapsed first.
    TimedOut,
}

impl<T> Received<T> {
    /// The item, if one was received.
    pub fn into_option(self) -> Option<T> {
        match self {
            Received::Item(item) => Some(item),
            Received::Closed | Received::TimedOut => None,
        }
    }

    /// Whether the timeout elapsed.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Received::TimedOut)
    }

    fn from_outcome(outcome: TransportResult<Option<T>>) -> Self {
        match outcome {
            Ok(Some(item)) => Received::Item(item),
            Ok(None) => Received::Closed,
            Err(e) if e.is_timeout() => Received::TimedOut,
            Err(e) => {
                tracing::warn!(error = %e, "dequeue failed, reporting closed");
                Received::Closed
            }
        }
    }
}

struct Waiter<R> {
    id: u64,
    token: CompletionToken<R>,
    timer: Option<TimerHandle>,
}

impl<R> Waiter<R> {
    fn settle(self, outcome: TransportResult<R>) {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
        settle(&self.token, outcome, false);
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    readers: VecDeque<Waiter<Option<T>>>,
    item_waiters: VecDeque<Waiter<bool>>,
    closed: bool,
    next_waiter: u64,
}

type Selector<T, R> = fn(&mut QueueState<T>) -> &mut VecDeque<Waiter<R>>;

fn readers<T>(state: &mut QueueState<T>) -> &mut VecDeque<Waiter<Option<T>>> {
    &mut state.readers
}

fn item_waiters<T>(state: &mut QueueState<T>) -> &mut VecDeque<Waiter<bool>> {
    &mut state.item_waiters
}

fn remove_waiter<R>(waiters: &mut VecDeque<Waiter<R>>, id: u64) -> Option<Waiter<R>> {
    let position = waiters.iter().position(|w| w.id == id)?;
    waiters.remove(position)
}

struct QueueShared<T> {
    id: u64,
    state: Mutex<QueueState<T>>,
}

impl<T: Send + 'static> QueueShared<T> {
    fn expire<R: Send + 'static>(&self, id: u64, timeout: Duration, select: Selector<T, R>) {
        let waiter = {
            let mut state = self.state.lock();
            remove_waiter(select(&mut state), id)
        };
        if let Some(waiter) = waiter {
            tracing::trace!(queue = self.id, waiter = id, "waiter timed out");
            settle(&waiter.token, Err(TransportError::Timeout { timeout }), false);
        }
    }
}

impl<T> Drop for QueueShared<T> {
    // waiters outlive the last handle; complete them as if closed
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for reader in state.readers.drain(..) {
            reader.settle(Ok(None));
        }
        for waiter in state.item_waiters.drain(..) {
            waiter.settle(Ok(false));
        }
    }
}

/// FIFO hand-off queue shared between producers and consumers.
///
/// Cloning yields another handle to the same queue.
pub struct HandoffQueue<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> Clone for HandoffQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for HandoffQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("HandoffQueue")
            .field("id", &self.shared.id)
            .field("pending", &state.items.len())
            .field("readers", &state.readers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T: Send + 'static> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> HandoffQueue<T> {
    /// Create an open, empty queue.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                id: next_owner_id(),
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    readers: VecDeque::new(),
                    item_waiters: VecDeque::new(),
                    closed: false,
                    next_waiter: 1,
                }),
            }),
        }
    }

    /// Process-unique id, recorded as the owner of every token this queue
    /// issues.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Hand `item` to the oldest waiting reader, or buffer it.
    ///
    /// Returns `false` and drops the item if the queue is closed.
    pub fn enqueue_and_dispatch(&self, item: T) -> bool {
        let (handoff, waiters) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                drop(state);
                tracing::trace!(queue = self.shared.id, "enqueue after close ignored");
                return false;
            }
            match state.readers.pop_front() {
                Some(reader) => (Some((reader, item)), Vec::new()),
                None => {
                    state.items.push_back(item);
                    let waiters: Vec<_> = state.item_waiters.drain(..).collect();
                    (None, waiters)
                }
            }
        };

        if let Some((reader, item)) = handoff {
            reader.settle(Ok(Some(item)));
        }
        for waiter in waiters {
            waiter.settle(Ok(true));
        }
        true
    }

    /// Begin an asynchronous dequeue.
    ///
    /// Completes synchronously when an item is buffered, the queue is closed,
    /// or `timeout` is zero. Otherwise the token completes from a later
    /// enqueue (`Some(item)`), close (`None`) or timer expiry
    /// ([`TransportError::Timeout`]).
    pub fn begin_dequeue(
        &self,
        timeout: Duration,
        callback: Option<CompletionCallback<Option<T>>>,
        state: Option<AsyncState>,
    ) -> CompletionToken<Option<T>> {
        let token = CompletionToken::with_owner(self.shared.id, callback, state);
        let fast = {
            let mut queue = self.shared.state.lock();
            if let Some(item) = queue.items.pop_front() {
                Some(Ok(Some(item)))
            } else if queue.closed {
                Some(Ok(None))
            } else if timeout.is_zero() {
                Some(Err(TransportError::Timeout { timeout }))
            } else {
                self.register(&mut queue, readers, token.clone(), Some(timeout));
                None
            }
        };
        if let Some(outcome) = fast {
            settle(&token, outcome, true);
        }
        token
    }

    /// Finish a dequeue begun with [`begin_dequeue`](Self::begin_dequeue).
    ///
    /// # Errors
    ///
    /// The captured timeout, or a usage error for a token this queue did not
    /// issue or that was already ended.
    pub fn end_dequeue(&self, token: &CompletionToken<Option<T>>) -> TransportResult<Option<T>> {
        token.end_owned_by(self.shared.id)
    }

    /// Dequeue without failing on timeout or close.
    pub fn try_dequeue(&self, timeout: Duration) -> Received<T> {
        let (id, token) = {
            let mut queue = self.shared.state.lock();
            if let Some(item) = queue.items.pop_front() {
                return Received::Item(item);
            }
            if queue.closed {
                return Received::Closed;
            }
            if timeout.is_zero() {
                return Received::TimedOut;
            }
            let token = CompletionToken::with_owner(self.shared.id, None, None);
            let id = self.register(&mut queue, readers, token.clone(), None);
            (id, token)
        };
        Received::from_outcome(self.block_on(id, &token, timeout, readers))
    }

    /// Dequeue one item, blocking up to `timeout`.
    ///
    /// Returns `Ok(None)` once the queue is closed and drained.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] if nothing arrives in time.
    pub fn dequeue(&self, timeout: Duration) -> TransportResult<Option<T>> {
        match self.try_dequeue(timeout) {
            Received::Item(item) => Ok(Some(item)),
            Received::Closed => Ok(None),
            Received::TimedOut => Err(TransportError::Timeout { timeout }),
        }
    }

    /// Wait until an item is buffered (`true`) or the queue closes (`false`),
    /// without consuming anything.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] if neither happens in time.
    pub fn wait_for_item(&self, timeout: Duration) -> TransportResult<bool> {
        let (id, token) = {
            let mut queue = self.shared.state.lock();
            if !queue.items.is_empty() {
                return Ok(true);
            }
            if queue.closed {
                return Ok(false);
            }
            if timeout.is_zero() {
                return Err(TransportError::Timeout { timeout });
            }
            let token = CompletionToken::with_owner(self.shared.id, None, None);
            let id = self.register(&mut queue, item_waiters, token.clone(), None);
            (id, token)
        };
        self.block_on(id, &token, timeout, item_waiters)
    }

    /// Asynchronous form of [`wait_for_item`](Self::wait_for_item).
    pub fn begin_wait_for_item(
        &self,
        timeout: Duration,
        callback: Option<CompletionCallback<bool>>,
        state: Option<AsyncState>,
    ) -> CompletionToken<bool> {
        let token = CompletionToken::with_owner(self.shared.id, callback, state);
        let fast = {
            let mut queue = self.shared.state.lock();
            if !queue.items.is_empty() {
                Some(Ok(true))
            } else if queue.closed {
                Some(Ok(false))
            } else if timeout.is_zero() {
                Some(Err(TransportError::Timeout { timeout }))
            } else {
                self.register(&mut queue, item_waiters, token.clone(), Some(timeout));
                None
            }
        };
        if let Some(outcome) = fast {
            settle(&token, outcome, true);
        }
        token
    }

    /// Finish a wait begun with
    /// [`begin_wait_for_item`](Self::begin_wait_for_item).
    ///
    /// # Errors
    ///
    /// As [`end_dequeue`](Self::end_dequeue).
    pub fn end_wait_for_item(&self, token: &CompletionToken<bool>) -> TransportResult<bool> {
        token.end_owned_by(self.shared.id)
    }

    /// Close the queue. Idempotent.
    ///
    /// Waiting readers complete with `None` and availability waiters with
    /// `false`. Buffered items stay drainable.
    pub fn close(&self) {
        self.shut(false);
    }

    /// Close the queue and drop everything buffered.
    ///
    /// Returns the number of items discarded.
    pub fn close_and_discard(&self) -> usize {
        self.shut(true)
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of buffered, unclaimed items.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Number of registered readers and availability waiters.
    pub fn waiter_count(&self) -> usize {
        let state = self.shared.state.lock();
        state.readers.len() + state.item_waiters.len()
    }

    fn register<R: Send + 'static>(
        &self,
        queue: &mut QueueState<T>,
        select: Selector<T, R>,
        token: CompletionToken<R>,
        timeout: Option<Duration>,
    ) -> u64 {
        let id = queue.next_waiter;
        queue.next_waiter += 1;

        let timer = timeout.and_then(|timeout| {
            let weak: Weak<QueueShared<T>> = Arc::downgrade(&self.shared);
            timer::schedule(timeout, move || {
                if let Some(shared) = weak.upgrade() {
                    shared.expire(id, timeout, select);
                }
            })
        });

        select(queue).push_back(Waiter { id, token, timer });
        id
    }

    fn block_on<R>(
        &self,
        id: u64,
        token: &CompletionToken<R>,
        timeout: Duration,
        select: Selector<T, R>,
    ) -> TransportResult<R> {
        if !token.wait_timeout(timeout) {
            let removed = {
                let mut queue = self.shared.state.lock();
                remove_waiter(select(&mut queue), id).is_some()
            };
            if removed {
                return Err(TransportError::Timeout { timeout });
            }
            // completed concurrently with the timeout
        }
        token.end()
    }

    fn shut(&self, discard: bool) -> usize {
        let (discarded, readers, waiters, was_open) = {
            let mut queue = self.shared.state.lock();
            let discarded = if discard {
                std::mem::take(&mut queue.items)
            } else {
                VecDeque::new()
            };
            let was_open = !queue.closed;
            queue.closed = true;
            let readers: Vec<_> = queue.readers.drain(..).collect();
            let waiters: Vec<_> = queue.item_waiters.drain(..).collect();
            (discarded, readers, waiters, was_open)
        };

        if was_open {
            tracing::debug!(
                queue = self.shared.id,
                readers = readers.len(),
                discarded = discarded.len(),
                "queue closed"
            );
        }
        for reader in readers {
            reader.settle(Ok(None));
        }
        for waiter in waiters {
            waiter.settle(Ok(false));
        }
        discarded.len()
    }
}
