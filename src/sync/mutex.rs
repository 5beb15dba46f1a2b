//! Mutex over a single shared word.
//!
//! Mirrors the hardware idiom: a 32-bit word in shared memory, taken with an
//! atomic swap and released with a plain store. Used for the CLINT register
//! mutex and the DM request queue. No data is attached; callers protect
//! whatever the word guards by convention.

use std::sync::atomic::{AtomicU32, Ordering};

use super::wait::Backoff;

#[derive(Debug, Default)]
#[repr(transparent)]
pub struct HwMutex {
    word: AtomicU32,
}

impl HwMutex {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    /// Acquire with a swap loop (`amoswap` on every attempt).
    pub fn acquire(&self) {
        let mut backoff = Backoff::new();
        while self.word.swap(1, Ordering::Acquire) != 0 {
            backoff.snooze();
        }
    }

    /// Test-and-test-and-set: spin on plain loads, swap only once the word
    /// reads free. Keeps the interconnect quiet under contention.
    pub fn acquire_ttas(&self) {
        let mut backoff = Backoff::new();
        loop {
            while self.word.load(Ordering::Relaxed) != 0 {
                backoff.snooze();
            }
            if self.word.swap(1, Ordering::Acquire) == 0 {
                return;
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release(&self) {
        debug_assert!(self.is_locked(), "releasing a free mutex");
        self.word.store(0, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != 0
    }

    /// Acquire and release on drop.
    pub fn lock(&self) -> HwMutexGuard<'_> {
        self.acquire_ttas();
        HwMutexGuard { mutex: self }
    }
}

/// Guard for a held [`HwMutex`].
pub struct HwMutexGuard<'a> {
    mutex: &'a HwMutex,
}

impl Drop for HwMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}
