//! Bounded status polling with cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use scan_core::{PollTiming, Result, ScanError};
use tracing::trace;

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cancellation flag shared by the session, the reader and the consumer.
///
/// Waiting on the token instead of sleeping lets a cancel interrupt a poll
/// interval immediately.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock();
        self.inner.wake.notify_all();
    }

    /// Whether the flag is raised.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Lower the flag for reuse.
    pub fn reset(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }

    /// Sleep up to `timeout`. Returns true when cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut guard = self.inner.lock.lock();
        if self.is_cancelled() {
            return true;
        }
        let _ = self.inner.wake.wait_for(&mut guard, timeout);
        self.is_cancelled()
    }
}

/// Bounded-attempt, fixed-interval poll.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    condition: &'static str,
    attempts: u32,
    interval: Duration,
}

impl Poller {
    /// Poll for `condition` up to `attempts` times, `interval` apart.
    #[must_use]
    pub fn new(condition: &'static str, attempts: u32, interval: Duration) -> Self {
        Self {
            condition,
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Wait for the first image data.
    #[must_use]
    pub fn data(timing: &PollTiming) -> Self {
        Self::new(
            "buffer data",
            timing.data_poll_attempts,
            Duration::from_millis(timing.data_poll_interval_ms),
        )
    }

    /// Wait for the stop action.
    #[must_use]
    pub fn stop(timing: &PollTiming) -> Self {
        Self::new(
            "stop action",
            timing.stop_poll_attempts,
            Duration::from_millis(timing.stop_poll_interval_ms),
        )
    }

    /// Wait for the home sensor.
    #[must_use]
    pub fn home(timing: &PollTiming) -> Self {
        Self::new(
            "home sensor",
            timing.home_poll_attempts,
            Duration::from_millis(timing.home_poll_interval_ms),
        )
    }

    /// Wait for a feed to finish.
    #[must_use]
    pub fn feed(timing: &PollTiming) -> Self {
        Self::new(
            "feed finished",
            timing.feed_poll_attempts,
            Duration::from_millis(timing.feed_poll_interval_ms),
        )
    }

    /// Call `check` until it yields a value, the attempts run out, or
    /// `cancel` is raised.
    ///
    /// Returns `Ok(None)` when cancelled and [`ScanError::Timeout`] when the
    /// attempts are exhausted. Errors from `check` end the poll.
    pub fn until<T>(
        &self,
        cancel: &CancelToken,
        mut check: impl FnMut() -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        for attempt in 1..=self.attempts {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(value) = check()? {
                trace!(condition = self.condition, attempt, "Poll satisfied");
                return Ok(Some(value));
            }
            if attempt < self.attempts && cancel.wait(self.interval) {
                return Ok(None);
            }
        }
        Err(ScanError::Timeout {
            condition: self.condition,
            attempts: self.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_poll_succeeds_after_retries() {
        let poller = Poller::new("test", 5, Duration::from_millis(1));
        let mut calls = 0;
        let out = poller
            .until(&CancelToken::new(), || {
                calls += 1;
                Ok((calls == 3).then_some(calls))
            })
            .unwrap();
        assert_eq!(out, Some(3));
    }

    #[test]
    fn test_poll_times_out() {
        let poller = Poller::new("home sensor", 4, Duration::from_millis(1));
        let mut calls = 0;
        let err = poller
            .until(&CancelToken::new(), || -> Result<Option<()>> {
                calls += 1;
                Ok(None)
            })
            .unwrap_err();
        assert_eq!(calls, 4);
        assert!(matches!(
            err,
            ScanError::Timeout {
                condition: "home sensor",
                attempts: 4
            }
        ));
    }

    #[test]
    fn test_poll_propagates_check_error() {
        let poller = Poller::new("x", 10, Duration::from_millis(1));
        let err = poller
            .until(&CancelToken::new(), || -> Result<Option<()>> {
                Err(ScanError::transport("control_in", "stall"))
            })
            .unwrap_err();
        assert!(matches!(err, ScanError::Transport { .. }));
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let token = CancelToken::new();
        let poller = Poller::new("slow", 1000, Duration::from_secs(5));
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let start = Instant::now();
        let out = poller
            .until(&token, || -> Result<Option<()>> { Ok(None) })
            .unwrap();
        handle.join().unwrap();
        assert!(out.is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_token_reset() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.wait(Duration::from_secs(10)));
        token.reset();
        assert!(!token.is_cancelled());
    }
}
