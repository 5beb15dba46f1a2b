//! Barrier hierarchy.
//!
//! - **Hardware barrier**: per cluster, every core of the cluster must
//!   trigger it. Cheapest; no shared memory involved.
//! - **Counting barrier**: a `{count, generation}` pair in shared memory for
//!   an arbitrary participant count. Reusable back to back.
//! - **Global barrier**: cluster barrier, then the DM cores of all clusters
//!   rendezvous on a counting barrier in global memory, then a second
//!   cluster barrier to release the compute cores.
//!
//! ```text
//!   cluster 0        cluster 1              cluster 0        cluster 1
//!  c0 c1 c2 DM      c0 c1 c2 DM            c0 c1 c2 DM      c0 c1 c2 DM
//!  ===hw=====       ===hw=====      -->    ===hw=====       ===hw=====
//!           \______________/
//!          counting barrier (DMs only)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let barrier = ctx.cluster().sw_barrier();
//! for _ in 0..rounds {
//!     compute_tile();
//!     barrier.wait(ctx.topology().cores_per_cluster, &ctx.policy());
//! }
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::wait::WaitPolicy;
use crate::hal::Platform;
use crate::memory::Placed;
use crate::topology::CoreIdentity;

/// Handle to one cluster's hardware barrier.
#[derive(Clone)]
pub struct HardwareBarrier {
    platform: Arc<dyn Platform>,
    cluster: u32,
}

impl HardwareBarrier {
    pub fn new(platform: Arc<dyn Platform>, cluster: u32) -> Self {
        Self { platform, cluster }
    }

    /// Block until every core of the cluster has arrived.
    pub fn wait(&self) {
        self.platform.hw_barrier(self.cluster);
    }
}

/// Outcome of arriving at a [`CountingBarrier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// This core was the last one in and released the round.
    Released,
    /// Others are still missing; the round to wait on is `generation`.
    Waiting { generation: u32 },
}

/// Software barrier over a shared counter.
///
/// Place it in TCDM for cluster-local use or in global memory for
/// cross-cluster use. Participants of one round must agree on the count.
#[derive(Debug, Default)]
#[repr(C)]
pub struct CountingBarrier {
    count: AtomicU32,
    generation: AtomicU32,
}

impl CountingBarrier {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            generation: AtomicU32::new(0),
        }
    }

    /// Register arrival without waiting.
    pub fn arrive(&self, participants: u32) -> Arrival {
        debug_assert!(participants > 0, "barrier with no participants");
        // Read before incrementing: the releasing core bumps it only after
        // everyone, this core included, has arrived.
        let generation = self.generation.load(Ordering::Acquire);
        let arrived = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(
            arrived <= participants,
            "barrier overrun: {} arrivals for {} participants",
            arrived,
            participants
        );

        if arrived == participants {
            self.count.store(0, Ordering::Relaxed);
            self.generation
                .store(generation.wrapping_add(1), Ordering::Release);
            Arrival::Released
        } else {
            Arrival::Waiting { generation }
        }
    }

    /// Block until `participants` cores have arrived in this round.
    ///
    /// Returns `true` on exactly one core per round, the last to arrive.
    pub fn wait(&self, participants: u32, policy: &WaitPolicy) -> bool {
        match self.arrive(participants) {
            Arrival::Released => true,
            Arrival::Waiting { generation } => {
                policy.spin_until("counting barrier", || {
                    self.generation.load(Ordering::Acquire) != generation
                });
                false
            }
        }
    }

    /// Completed rounds (wrapping).
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Arrivals in the current round.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

/// Machine-wide barrier.
#[derive(Clone)]
pub struct GlobalBarrier {
    cluster: HardwareBarrier,
    counter: Placed<CountingBarrier>,
    clusters: u32,
    policy: WaitPolicy,
}

impl GlobalBarrier {
    pub fn new(
        cluster: HardwareBarrier,
        counter: Placed<CountingBarrier>,
        clusters: u32,
        policy: WaitPolicy,
    ) -> Self {
        Self {
            cluster,
            counter,
            clusters,
            policy,
        }
    }

    /// Every core of every cluster must call this.
    pub fn wait(&self, core: &CoreIdentity) {
        log::trace!("{} enters global barrier", core);
        self.cluster.wait();
        if core.is_dm() {
            self.counter.wait(self.clusters, &self.policy);
        }
        self.cluster.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn policy() -> WaitPolicy {
        WaitPolicy::bounded(Duration::from_secs(10))
    }

    #[test]
    fn test_all_increments_visible_after_barrier() {
        // x starts at 0, each of four cores adds 1 then waits: all read 4.
        let x = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(CountingBarrier::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let x = Arc::clone(&x);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    x.fetch_add(1, Ordering::Relaxed);
                    barrier.wait(4, &policy());
                    x.load(Ordering::Relaxed)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 4);
        }
        assert_eq!(barrier.count(), 0);
        assert_eq!(barrier.generation(), 1);
    }

    #[test]
    fn test_round_robin_increments() {
        // Core i adds 1 only in round i; a barrier separates every round.
        let x = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(CountingBarrier::new());
        let handles: Vec<_> = (0..4u32)
            .map(|core| {
                let x = Arc::clone(&x);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait(4, &policy());
                    for round in 0..4 {
                        if core == round {
                            let v = x.load(Ordering::Relaxed);
                            x.store(v + 1, Ordering::Relaxed);
                        }
                        barrier.wait(4, &policy());
                    }
                    x.load(Ordering::Relaxed)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 4);
        }
    }

    #[test]
    fn test_reuse_back_to_back() {
        const ROUNDS: u32 = 200;
        let barrier = Arc::new(CountingBarrier::new());
        let releases = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let releases = Arc::clone(&releases);
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        if barrier.wait(3, &policy()) {
                            releases.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // Exactly one releaser per round
        assert_eq!(releases.load(Ordering::Relaxed), ROUNDS);
        assert_eq!(barrier.generation(), ROUNDS);
    }

    #[test]
    fn test_single_participant_releases_immediately() {
        let barrier = CountingBarrier::new();
        assert_eq!(barrier.arrive(1), Arrival::Released);
        assert_eq!(barrier.arrive(2), Arrival::Waiting { generation: 1 });
        assert_eq!(barrier.count(), 1);
    }

    #[test]
    #[should_panic(expected = "stalled in counting barrier")]
    fn test_missing_participant_is_loud() {
        let barrier = CountingBarrier::new();
        barrier.wait(2, &WaitPolicy::bounded(Duration::from_millis(20)));
    }
}
