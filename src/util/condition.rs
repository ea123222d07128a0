//! A reusable one-shot boolean condition.

use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;

/// Thread-safe boolean condition.
///
/// One thread blocks in [`Condition::wait`] until another calls
/// [`Condition::notify`]. Waking up consumes the notification, so the
/// condition can be waited on again afterwards. A notification that arrives
/// before anyone waits is kept until it is consumed.
#[derive(Default)]
pub struct Condition {
    ready: Mutex<bool>,
    cv: Condvar,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the condition is ready, then reset it.
    pub fn wait(&self) {
        let mut ready = self.ready.lock();
        while !*ready {
            self.cv.wait(&mut ready);
        }
        *ready = false;
    }

    /// Block until the condition is ready or the timeout expires.
    ///
    /// # Returns
    ///
    /// `true` if the condition became ready (and was reset), `false` on
    /// timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.lock();
        self.cv.wait_while_for(&mut ready, |ready| !*ready, timeout);
        let was_ready = *ready;
        *ready = false;
        was_ready
    }

    /// Mark the condition as ready and wake the waiter.
    pub fn notify(&self) {
        *self.ready.lock() = true;
        self.cv.notify_one();
    }
}
