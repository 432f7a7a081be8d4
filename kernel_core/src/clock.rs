//! Kernel clock and timers
//!
//! Time is a virtual nanosecond counter the platform advances. An
//! await-clock submission completes when the counter passes its deadline;
//! timers whose deadline is already past complete immediately.

use kernel_api::{Duration, Instant};
use std::sync::Mutex;

use crate::writer::{Completer, EventWriter};

struct Timer {
    deadline: Instant,
    completer: Completer,
}

struct ClockState {
    now: Instant,
    timers: Vec<Timer>,
}

/// The kernel clock.
pub struct Clock {
    state: Mutex<ClockState>,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            state: Mutex::new(ClockState {
                now: Instant::from_nanos(0),
                timers: Vec::new(),
            }),
        }
    }

    pub fn now(&self) -> Instant {
        self.state.lock().expect("clock lock").now
    }

    /// Parks a completion for `delay` from now; a zero delay completes
    /// immediately.
    pub fn submit_await(&self, delay: Duration, completer: Completer) {
        {
            let mut state = self.state.lock().expect("clock lock");
            if delay.as_nanos() != 0 {
                let deadline = state.now + delay;
                state.timers.push(Timer {
                    deadline,
                    completer,
                });
                return;
            }
        }
        completer.complete(EventWriter::ok());
    }

    /// Advances the counter and fires every timer whose deadline passed.
    /// Returns the number fired.
    pub fn advance(&self, delta: Duration) -> usize {
        let due = {
            let mut state = self.state.lock().expect("clock lock");
            state.now = state.now + delta;
            let now = state.now;
            let mut due = Vec::new();
            let mut remaining = Vec::new();
            for timer in state.timers.drain(..) {
                if timer.deadline <= now {
                    due.push(timer.completer);
                } else {
                    remaining.push(timer);
                }
            }
            state.timers = remaining;
            due
        };

        let fired = due.len();
        for completer in due {
            completer.complete(EventWriter::ok());
        }
        fired
    }

    /// Timers still pending (tests).
    pub fn pending_timers(&self) -> usize {
        self.state.lock().expect("clock lock").timers.len()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
