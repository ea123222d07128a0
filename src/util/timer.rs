//! A one-shot timer that runs a callback on expiry unless dropped first.

use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use parking_lot::Condvar;
use parking_lot::Mutex;

#[derive(Default)]
struct Shared {
    canceled: Mutex<bool>,
    cv: Condvar,
}

/// A timer that calls a function once it expires.
///
/// The timer owns a thread that blocks until either the duration elapses or
/// the timer is dropped. Dropping the timer before it expires cancels it, and
/// the callback is never called.
pub struct CallbackTimer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl CallbackTimer {
    /// Arm a new timer.
    ///
    /// # Arguments
    ///
    /// * `duration` - Time until the callback fires
    /// * `callback` - Function to call on expiry, on the timer thread
    pub fn new<F>(duration: Duration, callback: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("callback-timer".to_string())
                .spawn(move || Self::run(&shared, duration, callback))
                .with_context(|| "failed to spawn timer thread")?
        };
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    fn run<F: FnOnce()>(shared: &Shared, duration: Duration, callback: F) {
        let deadline = Instant::now() + duration;
        let mut canceled = shared.canceled.lock();
        // Loop to absorb spurious wakeups.
        while !*canceled {
            if shared.cv.wait_until(&mut canceled, deadline).timed_out() {
                if *canceled {
                    return;
                }
                drop(canceled);
                callback();
                return;
            }
        }
    }
}

impl Drop for CallbackTimer {
    fn drop(&mut self) {
        *self.shared.canceled.lock() = true;
        self.shared.cv.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
