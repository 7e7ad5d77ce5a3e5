//! Notify/wait primitive for worker loops.
//!
//! Wraps a mutex + condvar pair with a sticky notification flag so a notify
//! that races ahead of the wait is never lost.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct WaitEvent {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl WaitEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every current and the next future waiter.
    pub fn notify(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.condvar.notify_all();
    }

    /// Block until notified. Consumes the notification.
    pub fn wait(&self) {
        let mut notified = self.notified.lock();
        while !*notified {
            self.condvar.wait(&mut notified);
        }
        *notified = false;
    }

    /// Block until notified or `timeout` elapses. Returns true when woken by
    /// a notification. Consumes the notification.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut notified = self.notified.lock();
        if !*notified {
            self.condvar.wait_for(&mut notified, timeout);
        }
        let was_notified = *notified;
        *notified = false;
        was_notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_timeout_without_notify() {
        let event = WaitEvent::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_notify_before_wait_is_not_lost() {
        let event = WaitEvent::new();
        event.notify();
        assert!(event.wait_timeout(Duration::from_millis(0)));
        // Consumed by the first wait.
        assert!(!event.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let event = Arc::new(WaitEvent::new());
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait())
        };
        thread::sleep(Duration::from_millis(20));
        event.notify();
        waiter.join().unwrap();
    }
}
