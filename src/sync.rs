//! Cooperative cancellation for native threads.
//!
//! Every sensor and worker thread owns a `StopToken`; all blocking waits go
//! through `wait()` so a stop request wakes the thread immediately instead of
//! waiting out a full sleep interval.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Default)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the owning thread stop. Wakes any pending `wait()`.
    pub fn request_stop(&self) {
        let mut stopped = self.inner.stopped.lock();
        *stopped = true;
        self.inner.condvar.notify_all();
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Block for up to `timeout`, waking early on a stop request.
    /// Returns true if stop has been requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.inner.stopped.lock();
        if *stopped {
            return true;
        }
        self.inner.condvar.wait_for(&mut stopped, timeout);
        *stopped
    }

    /// Clear a previous stop request so the token can be reused.
    pub fn reset(&self) {
        *self.inner.stopped.lock() = false;
    }
}
