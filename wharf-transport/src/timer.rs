//! Process-wide deadline timer for asynchronous timeouts.
//!
//! Blocking waits time out on their own condition variable. Asynchronous
//! operations have no waiting thread, so their timeouts are scheduled here:
//! one lazily started thread sleeps until the earliest deadline and runs the
//! expired callbacks without holding the timer lock.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type TimerCallback = Box<dyn FnOnce() + Send>;

type TimerKey = (Instant, u64);

struct TimerState {
    // ordered by deadline, ties broken by scheduling order
    pending: BTreeMap<TimerKey, TimerCallback>,
    next_id: u64,
    started: bool,
}

struct TimerService {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// Handle to a scheduled callback.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    key: TimerKey,
}

impl TimerHandle {
    /// Cancel the callback. Returns `false` if it already ran or is running.
    pub(crate) fn cancel(&self) -> bool {
        service().state.lock().pending.remove(&self.key).is_some()
    }
}

fn service() -> &'static TimerService {
    static SERVICE: OnceLock<TimerService> = OnceLock::new();
    SERVICE.get_or_init(|| TimerService {
        state: Mutex::new(TimerState {
            pending: BTreeMap::new(),
            next_id: 1,
            started: false,
        }),
        wake: Condvar::new(),
    })
}

/// Run `callback` on the timer thread once `after` has elapsed.
///
/// Returns `None` when the deadline is not representable (an effectively
/// infinite timeout); such callbacks never run.
pub(crate) fn schedule<F>(after: Duration, callback: F) -> Option<TimerHandle>
where
    F: FnOnce() + Send + 'static,
{
    let deadline = Instant::now().checked_add(after)?;
    let timers = service();
    let mut state = timers.state.lock();

    if !state.started {
        let spawned = std::thread::Builder::new()
            .name("wharf-timer".to_string())
            .spawn(|| run(service()));
        match spawned {
            Ok(_) => state.started = true,
            Err(e) => {
                tracing::error!(error = %e, "failed to start timer thread");
                return None;
            }
        }
    }

    let key = (deadline, state.next_id);
    state.next_id += 1;
    state.pending.insert(key, Box::new(callback));
    drop(state);

    timers.wake.notify_one();
    Some(TimerHandle { key })
}

fn run(timers: &'static TimerService) {
    let mut state = timers.state.lock();
    loop {
        let Some(&(deadline, id)) = state.pending.keys().next() else {
            timers.wake.wait(&mut state);
            continue;
        };

        if deadline > Instant::now() {
            timers.wake.wait_until(&mut state, deadline);
            continue;
        }

        if let Some(callback) = state.pending.remove(&(deadline, id)) {
            drop(state);
            callback();
            state = timers.state.lock();
        }
    }
}
