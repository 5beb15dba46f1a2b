//! Leader election and hand-off to the host.
//!
//! An election is a single atomic race, not a barrier: every participant
//! increments a shared counter once and the core that lands it on
//! `participants - 1` is the leader for the round. Only the leader resets the
//! counter, after every other participant has already incremented past it.
//!
//! ```text
//!   DM c0 ──┐
//!   DM c1 ──┼──► race_counter ──► last increment? ──► leader ──► msip[host]
//!   DM c2 ──┘
//! ```
//!
//! The counter is not reusable until the leader's reset is visible. Callers
//! separate rounds with a host round trip or a barrier, which is what
//! [`return_to_host`] and the offload loop do.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::machine::CoreContext;

/// Hart the supervising host runs on.
pub const HOST_HART: u32 = 0;

/// Shared race counter, placed in TCDM (cluster scope) or global memory.
#[derive(Debug, Default)]
#[repr(C)]
pub struct ElectionState {
    race_counter: AtomicU32,
}

impl ElectionState {
    pub const fn new() -> Self {
        Self {
            race_counter: AtomicU32::new(0),
        }
    }

    /// Join the round. Exactly one of `participants` callers gets `true`.
    pub fn elect(&self, participants: u32) -> bool {
        debug_assert!(participants > 0, "election with no participants");
        let prev = self.race_counter.fetch_add(1, Ordering::AcqRel);
        debug_assert!(
            prev < participants,
            "election overrun: {} arrivals for {} participants",
            prev + 1,
            participants
        );
        let leader = prev == participants - 1;
        if leader {
            self.race_counter.store(0, Ordering::Release);
        }
        leader
    }

    /// Current count; 0 between rounds.
    pub fn counter(&self) -> u32 {
        self.race_counter.load(Ordering::Acquire)
    }
}

/// How much agreement `return_to_host` needs before the host is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Every core of every cluster calls in; clusters barrier first, then
    /// their DM cores elect the reporter.
    All,
    /// Only DM cores matter; they elect the reporter without a cluster
    /// barrier. Compute cores calling in return immediately.
    Clusters,
    /// The caller reports on its own.
    None,
}

/// Signal the host that the device is done with the current step.
pub fn return_to_host(ctx: &CoreContext, mode: SyncMode) {
    let core = ctx.identity();
    if mode == SyncMode::All {
        ctx.cluster_hw_barrier();
    }

    match mode {
        SyncMode::All | SyncMode::Clusters => {
            if core.is_dm() && ctx.elect_global() {
                log::debug!("{} elected to report to host", core);
                ctx.interrupts().sw_set(HOST_HART);
            }
        }
        SyncMode::None => ctx.interrupts().sw_set(HOST_HART),
    }
}

/// Acknowledge the software interrupt that woke this core.
pub fn post_wakeup(ctx: &CoreContext) {
    ctx.interrupts().sw_clear(ctx.identity().hartid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn race(participants: u32, rounds: u32) -> (u32, Arc<ElectionState>) {
        let election = Arc::new(ElectionState::new());
        let barrier = Arc::new(std::sync::Barrier::new(participants as usize));
        let handles: Vec<_> = (0..participants)
            .map(|_| {
                let election = Arc::clone(&election);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut wins = 0;
                    for _ in 0..rounds {
                        if election.elect(participants) {
                            wins += 1;
                        }
                        // Rounds must not overlap the leader's reset
                        barrier.wait();
                    }
                    wins
                })
            })
            .collect();
        let leaders = handles.into_iter().map(|h| h.join().unwrap()).sum();
        (leaders, election)
    }

    #[test]
    fn test_exactly_one_leader_per_round() {
        for n in [1, 2, 5, 16] {
            let (leaders, election) = race(n, 50);
            assert_eq!(leaders, 50, "{} participants", n);
            assert_eq!(election.counter(), 0);
        }
    }

    #[test]
    fn test_single_participant_always_leads() {
        let election = ElectionState::new();
        assert!(election.elect(1));
        assert!(election.elect(1));
        assert_eq!(election.counter(), 0);
    }

    #[test]
    fn test_last_arrival_leads() {
        let election = ElectionState::new();
        assert!(!election.elect(3));
        assert!(!election.elect(3));
        assert_eq!(election.counter(), 2);
        assert!(election.elect(3));
        assert_eq!(election.counter(), 0);
    }
}
