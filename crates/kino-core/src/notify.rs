// crates/kino-core/src/notify.rs
//
// One condvar shared between the demuxer and the decoder threads: decoders
// ping it when their input queue runs dry, the orchestrator pings it on
// seek, and the demuxer waits on it (with a short timeout) while in
// backpressure. A ping with no waiter is deliberately lost — the timeout
// bounds how stale the demuxer's view can get.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub struct Notify {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Notify {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        self.cond.notify_one();
    }

    pub fn wait_timeout(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        let _ = self.cond.wait_for(&mut guard, timeout);
    }
}

impl Default for Notify {
    fn default() -> Self {
        Self::new()
    }
}
