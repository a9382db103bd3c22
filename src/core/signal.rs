use crate::sync::{Mutex, Condvar};

use std::time::{Duration, Instant};

/// A manual-reset, broadcast wait/notify primitive.
///
/// `signal_all` releases *every* thread that is blocked in `wait` or `wait_for`
/// at that moment, not just the first one to reacquire the lock. Each released
/// waiter resets the signaled flag on its own return path, so a thread that
/// starts waiting after the broadcast blocks until the next `signal_all`.
///
/// The broadcast guarantee comes from an epoch counter: a waiter is released
/// when the flag is set *or* when the epoch advanced past the one it captured
/// on entry, so a sibling's reset can't put it back to sleep.
pub struct Signal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

struct SignalState {
    signaled: bool,
    epoch: u64,
}

impl Signal {
    pub fn new() -> Self {
        Signal {
            state: Mutex::new(SignalState {
                signaled: false,
                epoch: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Set the signaled state and release every thread currently waiting.
    pub fn signal_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.signaled = true;
        state.epoch += 1;

        self.cond.notify_all();
    }

    /// Block until signaled, then reset the signal before returning.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        let epoch = state.epoch;

        while !state.signaled && state.epoch == epoch {
            state = self.cond.wait(state).unwrap();
        }

        state.signaled = false;
    }

    /// Bounded `wait`. Returns whether the signal was observed before the
    /// timeout elapsed.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let mut state = self.state.lock().unwrap();
        let epoch = state.epoch;

        while !state.signaled && state.epoch == epoch {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }

        state.signaled = false;

        true
    }
}

impl Default for Signal {
    fn default() -> Self {
        Signal::new()
    }
}
