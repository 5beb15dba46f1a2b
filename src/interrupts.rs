//! Software and cluster-local interrupts.
//!
//! Software interrupts live in the CLINT: hart `h` owns bit `h % 32` of msip
//! word `h / 32`. The words are shared by 32 harts, so every
//! read-modify-write goes through the CLINT mutex. Cluster-local interrupts
//! are one register per cluster with a bit per core, and support atomic
//! set/clear masks directly.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::hal::{Platform, WakeSource};
use crate::topology::CoreIdentity;

/// `(word, mask)` pairs covering harts `[first, first + count)`.
pub type HartMaskWords = SmallVec<[(usize, u32); 2]>;

/// Split a contiguous hart range into per-word masks.
pub fn hart_mask_words(first: u32, count: u32) -> HartMaskWords {
    let mut words = HartMaskWords::new();
    let mut hart = first;
    let end = first + count;
    while hart < end {
        let word = hart / 32;
        let lo = hart % 32;
        let hi = (end - word * 32).min(32);
        let mask = if hi - lo == 32 {
            u32::MAX
        } else {
            ((1u32 << (hi - lo)) - 1) << lo
        };
        words.push((word as usize, mask));
        hart = (word + 1) * 32;
    }
    words
}

/// Interrupt operations over a [`Platform`].
#[derive(Clone)]
pub struct Interrupts {
    platform: Arc<dyn Platform>,
}

impl Interrupts {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    /// OR `mask` into msip word `word`.
    pub fn clint_set(&self, word: usize, mask: u32) {
        let _guard = self.platform.clint_mutex().lock();
        let reg = self.platform.msip(word);
        let value = reg.load(Ordering::Relaxed);
        reg.store(value | mask, Ordering::Release);
    }

    /// Clear `mask` in msip word `word`.
    pub fn clint_clear(&self, word: usize, mask: u32) {
        let _guard = self.platform.clint_mutex().lock();
        let reg = self.platform.msip(word);
        let value = reg.load(Ordering::Relaxed);
        reg.store(value & !mask, Ordering::Release);
    }

    /// Raise the software interrupt of one hart.
    pub fn sw_set(&self, hart: u32) {
        log::trace!("sw interrupt -> hart {}", hart);
        self.clint_set((hart / 32) as usize, 1 << (hart % 32));
    }

    pub fn sw_clear(&self, hart: u32) {
        self.clint_clear((hart / 32) as usize, 1 << (hart % 32));
    }

    pub fn sw_get(&self, hart: u32) -> bool {
        let _guard = self.platform.clint_mutex().lock();
        self.platform.msip((hart / 32) as usize).load(Ordering::Acquire) & (1 << (hart % 32)) != 0
    }

    /// Raise the software interrupt of `count` consecutive harts.
    pub fn clint_set_mask(&self, first_hart: u32, count: u32) {
        log::trace!("sw interrupt -> harts {}..{}", first_hart, first_hart + count);
        for (word, mask) in hart_mask_words(first_hart, count) {
            self.clint_set(word, mask);
        }
    }

    /// Sleep until this hart's software interrupt is raised, then clear it.
    pub fn sw_poll(&self, hart: u32) {
        loop {
            self.platform.wfi(hart, WakeSource::Software);
            let _guard = self.platform.clint_mutex().lock();
            let reg = self.platform.msip((hart / 32) as usize);
            let value = reg.load(Ordering::Acquire);
            let bit = 1 << (hart % 32);
            if value & bit != 0 {
                reg.store(value & !bit, Ordering::Release);
                return;
            }
        }
    }

    /// Wait for an interrupt without consuming it.
    pub fn wfi(&self, hart: u32, source: WakeSource) {
        self.platform.wfi(hart, source);
    }

    pub fn cluster_set(&self, cluster: u32, mask: u32) {
        self.platform.cluster_irq_set(cluster, mask);
    }

    pub fn cluster_clear(&self, cluster: u32, mask: u32) {
        self.platform.cluster_irq_clear(cluster, mask);
    }

    pub fn cluster_pending(&self, cluster: u32) -> u32 {
        self.platform.cluster_irq_pending(cluster)
    }

    /// Raise a core's own cluster interrupt.
    pub fn set_mcip(&self, core: &CoreIdentity) {
        self.cluster_set(core.cluster_id, core.cluster_mask());
    }

    /// Acknowledge a core's own cluster interrupt.
    pub fn clear_mcip(&self, core: &CoreIdentity) {
        self.cluster_clear(core.cluster_id, core.cluster_mask());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimPlatform;
    use crate::sync::WaitPolicy;
    use crate::topology::TopologyConfig;
    use std::thread;
    use std::time::Duration;

    fn interrupts(topo: TopologyConfig) -> Interrupts {
        Interrupts::new(Arc::new(SimPlatform::new(
            topo,
            WaitPolicy::bounded(Duration::from_secs(10)),
        )))
    }

    #[test]
    fn test_hart_mask_words_split() {
        let words = hart_mask_words(1, 36);
        assert_eq!(words.as_slice(), &[(0, 0xffff_fffe), (1, 0x1f)]);
        assert_eq!(hart_mask_words(0, 32).as_slice(), &[(0, u32::MAX)]);
        assert_eq!(hart_mask_words(33, 2).as_slice(), &[(1, 0b110)]);
        assert!(hart_mask_words(5, 0).is_empty());
    }

    #[test]
    fn test_sw_set_clear_get() {
        let irq = interrupts(TopologyConfig::new(9, 4, 1, 1));
        irq.sw_set(0);
        irq.sw_set(35);
        assert!(irq.sw_get(0));
        assert!(irq.sw_get(35));
        assert!(!irq.sw_get(34));
        irq.sw_clear(35);
        assert!(!irq.sw_get(35));
        assert!(irq.sw_get(0));
    }

    #[test]
    fn test_concurrent_sets_are_not_lost() {
        let irq = interrupts(TopologyConfig::new(8, 4, 1, 0));
        let handles: Vec<_> = (0..32)
            .map(|hart| {
                let irq = irq.clone();
                thread::spawn(move || irq.sw_set(hart))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!((0..32).all(|h| irq.sw_get(h)));
    }

    #[test]
    fn test_sw_poll_consumes_interrupt() {
        let irq = interrupts(TopologyConfig::new(3, 1, 1, 1));
        let waiter = {
            let irq = irq.clone();
            thread::spawn(move || irq.sw_poll(2))
        };
        thread::sleep(Duration::from_millis(5));
        irq.sw_set(2);
        waiter.join().unwrap();
        assert!(!irq.sw_get(2));
    }

    #[test]
    fn test_clint_set_mask_covers_device() {
        let topo = TopologyConfig::new(9, 4, 1, 1);
        let irq = interrupts(topo);
        irq.clint_set_mask(topo.hartid_base, topo.core_count());
        assert!(!irq.sw_get(0));
        assert!((1..=36).all(|h| irq.sw_get(h)));
    }

    #[test]
    fn test_mcip_touches_only_own_bit() {
        let topo = TopologyConfig::new(4, 1, 1, 1);
        let irq = interrupts(topo);
        let core = topo.resolve(2);
        irq.cluster_set(0, 0b1111);
        irq.clear_mcip(&core);
        assert_eq!(irq.cluster_pending(0), 0b1011);
        irq.set_mcip(&core);
        assert_eq!(irq.cluster_pending(0), 0b1111);
    }
}
