//! Host-thread implementation of [`Platform`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Instant;

use super::{Platform, WakeSource};
use crate::sync::wait::stalled;
use crate::sync::{HwMutex, WaitPolicy};
use crate::topology::TopologyConfig;

/// Simulated machine registers.
pub struct SimPlatform {
    topology: TopologyConfig,
    policy: WaitPolicy,
    barriers: Vec<BarrierUnit>,
    clint_mutex: HwMutex,
    msip: Vec<AtomicU32>,
    cluster_irq: Vec<AtomicU32>,
}

impl SimPlatform {
    pub fn new(topology: TopologyConfig, policy: WaitPolicy) -> Self {
        let clusters = topology.cluster_count() as usize;
        let harts = (topology.hartid_base + topology.core_count()) as usize;
        let words = harts.div_ceil(32);
        log::debug!(
            "sim platform: {} clusters x {} cores, {} msip words, policy {:?}",
            clusters,
            topology.cores_per_cluster,
            words,
            policy
        );

        Self {
            topology,
            policy,
            barriers: (0..clusters)
                .map(|_| BarrierUnit::new(topology.cores_per_cluster))
                .collect(),
            clint_mutex: HwMutex::new(),
            msip: (0..words).map(|_| AtomicU32::new(0)).collect(),
            cluster_irq: (0..clusters).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Whether `hart` has an interrupt from `source` pending.
    fn pending(&self, hart: u32, source: WakeSource) -> bool {
        if source.software() {
            let word = self.msip[(hart / 32) as usize].load(Ordering::Acquire);
            if word & (1 << (hart % 32)) != 0 {
                return true;
            }
        }
        if source.cluster() {
            if let Some(id) = self.topology.global_id_of_hart(hart) {
                let core = self.topology.resolve(id);
                let irq = self.cluster_irq[core.cluster_id as usize].load(Ordering::Acquire);
                return irq & core.cluster_mask() != 0;
            }
        }
        false
    }
}

impl Platform for SimPlatform {
    fn topology(&self) -> &TopologyConfig {
        &self.topology
    }

    fn wait_policy(&self) -> WaitPolicy {
        self.policy
    }

    fn hw_barrier(&self, cluster: u32) {
        self.barriers[cluster as usize].trigger(cluster, &self.policy);
    }

    fn clint_mutex(&self) -> &HwMutex {
        &self.clint_mutex
    }

    fn msip(&self, word: usize) -> &AtomicU32 {
        &self.msip[word]
    }

    fn msip_words(&self) -> usize {
        self.msip.len()
    }

    fn cluster_irq_set(&self, cluster: u32, mask: u32) {
        self.cluster_irq[cluster as usize].fetch_or(mask, Ordering::AcqRel);
    }

    fn cluster_irq_clear(&self, cluster: u32, mask: u32) {
        self.cluster_irq[cluster as usize].fetch_and(!mask, Ordering::AcqRel);
    }

    fn cluster_irq_pending(&self, cluster: u32) -> u32 {
        self.cluster_irq[cluster as usize].load(Ordering::Acquire)
    }

    fn wfi(&self, hart: u32, source: WakeSource) {
        self.policy
            .spin_until("wfi", || self.pending(hart, source));
    }
}

/// One cluster's barrier: a generation-counted rendezvous.
struct BarrierUnit {
    participants: u32,
    round: Mutex<BarrierRound>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct BarrierRound {
    arrived: u32,
    generation: u64,
}

impl BarrierUnit {
    fn new(participants: u32) -> Self {
        Self {
            participants,
            round: Mutex::new(BarrierRound::default()),
            released: Condvar::new(),
        }
    }

    fn trigger(&self, cluster: u32, policy: &WaitPolicy) {
        let mut round = self.round.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = round.generation;
        round.arrived += 1;
        log::trace!(
            "cluster {} hw barrier: {}/{} arrived",
            cluster,
            round.arrived,
            self.participants
        );

        if round.arrived == self.participants {
            round.arrived = 0;
            round.generation += 1;
            self.released.notify_all();
            return;
        }

        let deadline = policy.deadline();
        while round.generation == generation {
            round = match deadline {
                None => self
                    .released
                    .wait(round)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(round);
                        stalled("cluster hw barrier", policy.timeout().unwrap_or_default());
                    }
                    self.released
                        .wait_timeout(round, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}
