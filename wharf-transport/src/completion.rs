//! CompletionToken: one in-flight operation's eventual outcome.
//!
//! A token is created when an operation begins and is completed exactly once,
//! either before the `begin_*` call returns (synchronous fast path) or later
//! from whichever thread finishes the work. The caller observes completion by
//! polling [`CompletionToken::is_completed`], by a callback, by blocking on
//! [`CompletionToken::wait_handle`], or by `.await`ing the token, and then
//! consumes the outcome with exactly one [`CompletionToken::end`].
//!
//! ```text
//!  begin_*() ──► token ──complete_ok/complete_err (once)──► completed
//!                  │                                           │
//!                  │  wait_handle() / callback / poll / await  │
//!                  └───────────────────────► end() (once) ◄────┘
//! ```
//!
//! The blocking handle is only allocated when somebody actually waits, so the
//! synchronous path never touches a condition variable.
//!
//! # Example
//!
//! ```rust
//! use wharf_transport::CompletionToken;
//!
//! let token: CompletionToken<u32> = CompletionToken::new(None, None);
//! let worker = token.clone();
//! std::thread::spawn(move || {
//!     worker.complete_ok(42, false).unwrap();
//! });
//! assert_eq!(token.end().unwrap(), 42);
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{TransportError, TransportResult, UsageError};

/// Callback invoked exactly once when a token completes.
///
/// Runs on the completing thread, after the outcome is visible.
pub type CompletionCallback<T> = Box<dyn FnOnce(&CompletionToken<T>) + Send>;

/// Opaque caller state carried by a token.
pub type AsyncState = Arc<dyn Any + Send + Sync>;

/// Owner id for tokens not issued by a queue, channel or listener.
pub const UNOWNED: u64 = 0;

/// Allocate a process-unique owner id.
pub(crate) fn next_owner_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Manual-reset event signaled when a token completes.
#[derive(Debug)]
pub struct WaitHandle {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WaitHandle {
    fn new(signaled: bool) -> Self {
        Self {
            signaled: Mutex::new(signaled),
            cond: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.signaled.lock() = true;
        self.cond.notify_all();
    }

    /// Whether the handle has been signaled.
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until signaled.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }

    /// Block until signaled or `timeout` elapses. Returns whether signaled.
    ///
    /// A timeout too large to represent as a deadline waits forever.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }
        true
    }
}

struct TokenState<T> {
    outcome: Option<TransportResult<T>>,
    ended: bool,
    handle: Option<Arc<WaitHandle>>,
    callback: Option<CompletionCallback<T>>,
    waker: Option<Waker>,
}

struct TokenInner<T> {
    owner: u64,
    completed: AtomicBool,
    completed_synchronously: AtomicBool,
    async_state: Option<AsyncState>,
    state: Mutex<TokenState<T>>,
}

/// Future-like handle to one asynchronous operation.
///
/// Cloning shares the same operation: every clone observes the same
/// completion, and only one `end` across all clones succeeds.
pub struct CompletionToken<T> {
    inner: Arc<TokenInner<T>>,
}

impl<T> Clone for CompletionToken<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for CompletionToken<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionToken")
            .field("owner", &self.inner.owner)
            .field("completed", &self.is_completed())
            .field("completed_synchronously", &self.completed_synchronously())
            .finish()
    }
}

impl<T> CompletionToken<T> {
    /// Create a token that is not yet completed.
    pub fn new(callback: Option<CompletionCallback<T>>, state: Option<AsyncState>) -> Self {
        Self::with_owner(UNOWNED, callback, state)
    }

    pub(crate) fn with_owner(
        owner: u64,
        callback: Option<CompletionCallback<T>>,
        state: Option<AsyncState>,
    ) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                owner,
                completed: AtomicBool::new(false),
                completed_synchronously: AtomicBool::new(false),
                async_state: state,
                state: Mutex::new(TokenState {
                    outcome: None,
                    ended: false,
                    handle: None,
                    callback,
                    waker: None,
                }),
            }),
        }
    }

    /// Id of the component that issued this token.
    pub fn owner(&self) -> u64 {
        self.inner.owner
    }

    /// Whether the operation has completed.
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Whether the operation completed before its `begin_*` call returned.
    pub fn completed_synchronously(&self) -> bool {
        self.inner.completed_synchronously.load(Ordering::Acquire)
    }

    /// Caller state supplied at creation.
    pub fn async_state(&self) -> Option<&AsyncState> {
        self.inner.async_state.as_ref()
    }

    /// Complete successfully with `value`.
    ///
    /// # Errors
    ///
    /// [`UsageError::AlreadyCompleted`] on a second completion;
    /// [`UsageError::SynchronousCompletionObserved`] if
    /// `completed_synchronously` is set but a wait handle already exists.
    pub fn complete_ok(&self, value: T, completed_synchronously: bool) -> Result<(), UsageError> {
        self.complete(Ok(value), completed_synchronously)
    }

    /// Complete with a captured error, re-raised by `end`.
    ///
    /// # Errors
    ///
    /// Same contract as [`complete_ok`](Self::complete_ok).
    pub fn complete_err(
        &self,
        error: TransportError,
        completed_synchronously: bool,
    ) -> Result<(), UsageError> {
        self.complete(Err(error), completed_synchronously)
    }

    /// Complete with an outcome.
    ///
    /// # Errors
    ///
    /// Same contract as [`complete_ok`](Self::complete_ok).
    pub fn complete(
        &self,
        outcome: TransportResult<T>,
        completed_synchronously: bool,
    ) -> Result<(), UsageError> {
        let (handle, callback, waker) = {
            let mut state = self.inner.state.lock();
            if self.inner.completed.load(Ordering::Acquire) {
                return Err(UsageError::AlreadyCompleted);
            }
            if completed_synchronously && state.handle.is_some() {
                return Err(UsageError::SynchronousCompletionObserved);
            }
            state.outcome = Some(outcome);
            self.inner
                .completed_synchronously
                .store(completed_synchronously, Ordering::Release);
            self.inner.completed.store(true, Ordering::Release);
            (state.handle.clone(), state.callback.take(), state.waker.take())
        };

        if let Some(handle) = handle {
            handle.set();
        }
        if let Some(waker) = waker {
            waker.wake();
        }
        if let Some(callback) = callback {
            callback(self);
        }
        Ok(())
    }

    /// Handle signaled on completion, created on first access.
    ///
    /// A handle created after completion is already signaled.
    pub fn wait_handle(&self) -> Arc<WaitHandle> {
        let mut state = self.inner.state.lock();
        if let Some(handle) = &state.handle {
            return Arc::clone(handle);
        }
        let handle = Arc::new(WaitHandle::new(self.is_completed()));
        state.handle = Some(Arc::clone(&handle));
        handle
    }

    /// Wait up to `timeout` for completion without consuming the outcome.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_completed() {
            return true;
        }
        self.wait_handle().wait_timeout(timeout)
    }

    /// Consume the outcome, blocking until completion if needed.
    ///
    /// # Errors
    ///
    /// Re-raises the captured error, or [`UsageError::AlreadyEnded`] if any
    /// clone of this token was already ended.
    pub fn end(&self) -> TransportResult<T> {
        {
            let mut state = self.inner.state.lock();
            if state.ended {
                return Err(UsageError::AlreadyEnded.into());
            }
            state.ended = true;
        }

        if !self.is_completed() {
            self.wait_handle().wait();
        }

        let outcome = {
            let mut state = self.inner.state.lock();
            state.handle = None;
            state.waker = None;
            state.outcome.take()
        };
        outcome.unwrap_or_else(|| {
            Err(TransportError::InvalidState {
                message: "token completed without an outcome".to_string(),
            })
        })
    }

    /// Consume the outcome on behalf of the component `owner`.
    ///
    /// # Errors
    ///
    /// [`UsageError::ForeignToken`] if the token was issued by another
    /// component; otherwise as [`end`](Self::end).
    pub fn end_owned_by(&self, owner: u64) -> TransportResult<T> {
        if self.inner.owner != owner {
            return Err(UsageError::ForeignToken {
                issued_by: self.inner.owner,
                ended_by: owner,
            }
            .into());
        }
        self.end()
    }
}

impl<T> Future for CompletionToken<T> {
    type Output = TransportResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.is_completed() {
            let mut state = self.inner.state.lock();
            if !self.inner.completed.load(Ordering::Acquire) {
                state.waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
        }
        Poll::Ready(self.end())
    }
}

/// Complete `token`, logging instead of failing if it was already settled.
pub(crate) fn settle<T>(token: &CompletionToken<T>, outcome: TransportResult<T>, sync: bool) {
    if let Err(e) = token.complete(outcome, sync) {
        tracing::error!(owner = token.owner(), error = %e, "completion token settled twice");
    }
}
