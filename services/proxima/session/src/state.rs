//! Connection state and the reconnection timer.
//!
//! Every adapter owns one [`RetryTimer`]. A failure schedules a single retry
//! after a fixed delay; further failures while that retry is armed are
//! absorbed. When the timer fires it disarms itself before running the
//! attempt, so a failure inside the attempt can arm a fresh timer.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::trace;

/// Default delay between a connection failure and the next attempt
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

/// Per-adapter connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected; initial state and the state after `stop()`
    #[default]
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Connected; the only state in which data-plane operations succeed
    Connected,
    /// Waiting for the reconnect timer after a failure
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Slot {
    id: u64,
    /// Still waiting on the delay (not yet fired)
    armed: bool,
    handle: AbortHandle,
}

#[derive(Debug, Default)]
struct TimerState {
    next_id: u64,
    slot: Option<Slot>,
}

/// Fixed-delay, single-flight retry timer
#[derive(Debug, Clone)]
pub struct RetryTimer {
    interval: Duration,
    state: Arc<Mutex<TimerState>>,
}

impl RetryTimer {
    /// Create a timer with the given retry delay
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Arc::new(Mutex::new(TimerState::default())),
        }
    }

    /// Retry delay
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Schedule `attempt` to run after the retry delay.
    ///
    /// Returns `false` without scheduling anything if a retry is already
    /// armed.
    pub fn schedule(&self, attempt: BoxFuture<'static, ()>) -> bool {
        let mut state = self.state.lock();
        if state.slot.as_ref().is_some_and(|slot| slot.armed) {
            trace!("Retry already pending; not scheduling another");
            return false;
        }

        state.next_id += 1;
        let id = state.next_id;
        let delay = self.interval;
        let timer_state = self.state.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = timer_state.lock();
                if let Some(slot) = state.slot.as_mut() {
                    if slot.id == id {
                        slot.armed = false;
                    }
                }
            }
            attempt.await;
        });

        // A previous slot here has already fired; its task may be the caller
        state.slot = Some(Slot {
            id,
            armed: true,
            handle: task.abort_handle(),
        });
        true
    }

    /// Cancel the pending retry, or the attempt it started, if any
    pub fn cancel(&self) {
        if let Some(slot) = self.state.lock().slot.take() {
            slot.handle.abort();
        }
    }

    /// Whether a retry is armed and waiting on its delay
    pub fn is_pending(&self) -> bool {
        self.state
            .lock()
            .slot
            .as_ref()
            .is_some_and(|slot| slot.armed)
    }
}
