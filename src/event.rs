use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

// A one-way boolean flag that threads can block on. This is the primitive
// behind both cancellation tokens (the root kill event set by the signal
// handler) and task completion events. Cleanup call sites construct a fresh
// event with `Event::new()` so that global cancellation can never prevent
// cleanup commands from running.
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    // Set the flag and wake every waiter.
    pub fn set(&self) {
        let mut state = self.inner.state.lock().unwrap();
        *state = true;
        self.inner.condvar.notify_all();
    }

    // Reset the flag. Used by the supervisor's scan trigger, which is a
    // reusable condition rather than a one-shot cancellation.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock().unwrap();
        *state = false;
    }

    pub fn is_set(&self) -> bool {
        *self.inner.state.lock().unwrap()
    }

    // Block until the flag is set.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while !*state {
            state = self.inner.condvar.wait(state).unwrap();
        }
    }

    // Block until the flag is set or the timeout elapses. Returns whether the
    // flag was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let mut remaining = timeout;
        let start = std::time::Instant::now();
        while !*state {
            let (new_state, result) = self
                .inner
                .condvar
                .wait_timeout(state, remaining)
                .unwrap();
            state = new_state;
            if *state {
                return true;
            }
            remaining = match (result.timed_out(), timeout.checked_sub(start.elapsed())) {
                (false, Some(remaining)) => remaining,
                _ => return false,
            };
        }
        true
    }
}
