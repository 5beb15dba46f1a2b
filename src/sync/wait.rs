//! Spin waiting with an optional stall bound.
//!
//! Every blocking primitive in the runtime spins on shared memory. On silicon
//! a missing arrival hangs the core forever; under a bounded [`WaitPolicy`]
//! the waiter instead logs and panics, naming the wait site, so a broken
//! protocol fails a test rather than wedging it.

use std::hint;
use std::thread;
use std::time::{Duration, Instant};

/// Doubling spin rounds before falling back to yielding the host thread.
const SPIN_LIMIT: u32 = 6;

/// Polls between clock reads while a bound is active.
const POLLS_PER_CLOCK_CHECK: u32 = 256;

/// How long a waiter may go without progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitPolicy {
    timeout: Option<Duration>,
}

impl WaitPolicy {
    /// Wait forever, as the hardware does.
    pub const fn unbounded() -> Self {
        Self { timeout: None }
    }

    /// Panic once a single wait exceeds `timeout`.
    pub const fn bounded(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Instant after which a wait starting now counts as stalled.
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    /// Spin until `done` returns true.
    pub fn spin_until(&self, site: &str, mut done: impl FnMut() -> bool) {
        let deadline = self.deadline();
        let mut backoff = Backoff::new();
        let mut polls = 0u32;
        while !done() {
            backoff.snooze();
            if let Some(deadline) = deadline {
                polls += 1;
                if polls % POLLS_PER_CLOCK_CHECK == 0 && Instant::now() >= deadline {
                    stalled(site, self.timeout.unwrap_or_default());
                }
            }
        }
    }
}

/// Exponential spin that degrades to yielding once contention persists.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn snooze(&mut self) {
        if self.step < SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                hint::spin_loop();
            }
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }
}

/// Report a wait that made no progress within its bound.
#[cold]
pub(crate) fn stalled(site: &str, limit: Duration) -> ! {
    log::error!("stall: {} made no progress for {:?}", site, limit);
    panic!("stalled in {} for more than {:?}", site, limit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_spin_until_returns_when_done() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                flag.store(true, Ordering::Release);
            })
        };
        WaitPolicy::bounded(Duration::from_secs(5))
            .spin_until("test flag", || flag.load(Ordering::Acquire));
        setter.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "stalled in never")]
    fn test_bounded_wait_panics_on_stall() {
        WaitPolicy::bounded(Duration::from_millis(20)).spin_until("never", || false);
    }

    #[test]
    fn test_unbounded_has_no_deadline() {
        assert!(WaitPolicy::unbounded().deadline().is_none());
        assert_eq!(WaitPolicy::default(), WaitPolicy::unbounded());
    }
}
