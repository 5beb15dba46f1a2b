//! Event unit: fork-join task dispatch within a cluster.
//!
//! Core 0 of a cluster is the dispatcher; compute cores `1..` park in
//! [`EventUnit::event_loop`], sleeping on their cluster interrupt. A
//! dispatch goes through one shared slot:
//!
//! ```text
//!            dispatch_push          first participant        last completion
//!   ┌──────┐ ───────────► ┌────────┐ ──────────────► ┌─────────┐ ──────────► ┌─────────┐
//!   │ Idle │              │ Posted │                 │ Running │             │ Drained │
//!   └──────┘ ◄─────────── └────────┘                 └─────────┘             └────┬────┘
//!       ▲                                   run_empty resets                         │
//!       └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `run_empty` wakes exactly the participating workers (indices below
//! `thread_count`), runs the task on the dispatcher too if its own index is
//! below `thread_count`, and returns once every participant has finished.
//! There is one slot per cluster: posting while a task is in flight is a
//! caller error.
//!
//! # Usage
//!
//! ```ignore
//! // Workers (core_in_cluster 1..compute)
//! eu.event_loop(&core);
//!
//! // Dispatcher (core_in_cluster 0)
//! eu.dispatch_push(task, ArgBlock::new(args_addr, 2), 4);
//! eu.run_empty(&core);
//! eu.exit(&core);
//! ```

pub mod omp;

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::hal::WakeSource;
use crate::interrupts::Interrupts;
use crate::memory::Placed;
use crate::sync::WaitPolicy;
use crate::topology::{CoreIdentity, MAX_CORES_PER_CLUSTER};

/// Opaque argument block handed to every participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArgBlock {
    /// Address of the arguments, usually in TCDM.
    pub addr: u64,
    /// Number of arguments at `addr`.
    pub argc: u32,
}

impl ArgBlock {
    pub fn new(addr: u64, argc: u32) -> Self {
        Self { addr, argc }
    }
}

/// What a task sees when it runs.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    pub core: CoreIdentity,
    pub args: ArgBlock,
    /// Participants in this dispatch.
    pub thread_count: u32,
}

/// Task entry point.
pub type Task = Arc<dyn Fn(&TaskContext) + Send + Sync>;

/// Lifecycle of the dispatch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DispatchState {
    Idle = 0,
    Posted = 1,
    Running = 2,
    Drained = 3,
}

impl DispatchState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => DispatchState::Posted,
            2 => DispatchState::Running,
            3 => DispatchState::Drained,
            _ => DispatchState::Idle,
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatchState::Idle => "idle",
            DispatchState::Posted => "posted",
            DispatchState::Running => "running",
            DispatchState::Drained => "drained",
        };
        f.write_str(s)
    }
}

/// Event-unit words shared by the cluster, placed in TCDM.
#[derive(Debug, Default)]
pub struct EventUnitState {
    state: AtomicU32,
    /// Bumped on every post so a worker never runs one dispatch twice.
    sequence: AtomicU32,
    args_addr: AtomicU64,
    argc: AtomicU32,
    thread_count: AtomicU32,
    completed_count: AtomicU32,
    workers_in_loop: AtomicU32,
    workers_wfi: AtomicU32,
    exit_flag: AtomicU32,
    /// Times each core left wfi, by index in the cluster.
    wakeups: [AtomicU32; MAX_CORES_PER_CLUSTER as usize],
}

/// One cluster's dispatcher.
pub struct EventUnit {
    shared: Placed<EventUnitState>,
    /// Entry point of the posted task. Written by the dispatcher before
    /// publishing `Posted`, read by participants after observing it.
    entry: Mutex<Option<Task>>,
    interrupts: Interrupts,
    cluster: u32,
    compute_cores: u32,
    policy: WaitPolicy,
}

impl EventUnit {
    /// Wrap already-placed shared state.
    pub fn init(
        shared: Placed<EventUnitState>,
        interrupts: Interrupts,
        cluster: u32,
        compute_cores: u32,
        policy: WaitPolicy,
    ) -> Self {
        log::debug!(
            "cluster {} event unit at {:#x}, {} compute cores",
            cluster,
            shared.addr(),
            compute_cores
        );
        Self {
            shared,
            entry: Mutex::new(None),
            interrupts,
            cluster,
            compute_cores,
            policy,
        }
    }

    pub fn state(&self) -> DispatchState {
        DispatchState::from_raw(self.shared.state.load(Ordering::Acquire))
    }

    pub fn workers_in_loop(&self) -> u32 {
        self.shared.workers_in_loop.load(Ordering::Acquire)
    }

    pub fn workers_in_wfi(&self) -> u32 {
        self.shared.workers_wfi.load(Ordering::Acquire)
    }

    /// How often worker `core_in_cluster` has been woken from its loop.
    pub fn wakeups(&self, core_in_cluster: u32) -> u32 {
        self.shared.wakeups[core_in_cluster as usize].load(Ordering::Acquire)
    }

    /// Participants in the current dispatch, 0 when idle.
    pub fn thread_count(&self) -> u32 {
        self.shared.thread_count.load(Ordering::Acquire)
    }

    /// Worker loop. Returns after [`exit`](Self::exit).
    pub fn event_loop(&self, core: &CoreIdentity) {
        debug_assert!(
            core.is_compute() && core.cluster_id == self.cluster,
            "{} cannot serve cluster {}'s event unit",
            core,
            self.cluster
        );
        let eu = &*self.shared;
        eu.workers_in_loop.fetch_add(1, Ordering::AcqRel);
        log::debug!("{} parked in event loop", core);

        // Sequence numbers start at 1, so a worker that enters late still
        // joins a dispatch already posted for it.
        let mut last_run = 0;
        loop {
            if eu.exit_flag.load(Ordering::Acquire) != 0 {
                eu.workers_in_loop.fetch_sub(1, Ordering::AcqRel);
                log::debug!("{} left event loop", core);
                return;
            }

            // Participation is decided from thread_count alone; a core
            // outside it never looks at the dispatch state.
            let sequence = eu.sequence.load(Ordering::Acquire);
            if sequence != last_run && core.core_in_cluster < eu.thread_count.load(Ordering::Acquire) {
                last_run = sequence;
                self.participate(core);
            }

            eu.workers_wfi.fetch_add(1, Ordering::AcqRel);
            self.interrupts.wfi(core.hartid, WakeSource::Cluster);
            self.interrupts.clear_mcip(core);
            eu.wakeups[core.core_in_cluster as usize].fetch_add(1, Ordering::AcqRel);
            eu.workers_wfi.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Block until every worker in the loop is asleep.
    pub fn wait_workers_parked(&self) {
        let eu = &*self.shared;
        self.policy.spin_until("event unit workers parked", || {
            eu.workers_wfi.load(Ordering::Acquire) == eu.workers_in_loop.load(Ordering::Acquire)
        });
    }

    /// Block until `count` workers have entered the loop.
    pub fn wait_workers_ready(&self, count: u32) {
        self.policy.spin_until("event unit workers ready", || {
            self.workers_in_loop() >= count
        });
    }

    /// Fill the dispatch slot. Runs nothing until [`run_empty`](Self::run_empty).
    pub fn dispatch_push(&self, entry: Task, args: ArgBlock, thread_count: u32) {
        let eu = &*self.shared;
        debug_assert_eq!(
            self.state(),
            DispatchState::Idle,
            "cluster {}: dispatch while a task is in flight",
            self.cluster
        );
        debug_assert!(
            (1..=self.compute_cores).contains(&thread_count),
            "thread_count {} outside 1..={}",
            thread_count,
            self.compute_cores
        );

        // Workers still finishing the previous round must be asleep before
        // the slot is rewritten.
        self.wait_workers_parked();

        *self.entry.lock().unwrap_or_else(PoisonError::into_inner) = Some(entry);
        eu.args_addr.store(args.addr, Ordering::Relaxed);
        eu.argc.store(args.argc, Ordering::Relaxed);
        eu.completed_count.store(0, Ordering::Relaxed);
        eu.thread_count.store(thread_count, Ordering::Relaxed);
        eu.sequence.fetch_add(1, Ordering::Release);
        eu.state.store(DispatchState::Posted as u32, Ordering::Release);
        log::debug!(
            "cluster {} posted task for {} threads (args {:#x}/{})",
            self.cluster,
            thread_count,
            args.addr,
            args.argc
        );
    }

    /// Run the posted task to completion. No-op when nothing is posted.
    pub fn run_empty(&self, dispatcher: &CoreIdentity) {
        let eu = &*self.shared;
        let thread_count = eu.thread_count.load(Ordering::Acquire);
        if thread_count == 0 {
            return;
        }

        let participants = (1u32 << thread_count) - 1;
        let wake = participants & !dispatcher.cluster_mask();
        if wake != 0 {
            self.interrupts.cluster_set(self.cluster, wake);
        }
        if dispatcher.core_in_cluster < thread_count {
            self.participate(dispatcher);
        }

        self.policy.spin_until("event unit drain", || {
            self.state() == DispatchState::Drained
        });

        eu.thread_count.store(0, Ordering::Relaxed);
        self.entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        eu.state.store(DispatchState::Idle as u32, Ordering::Release);
        log::debug!("cluster {} task drained", self.cluster);
    }

    /// Make every worker leave its event loop.
    pub fn exit(&self, dispatcher: &CoreIdentity) {
        let eu = &*self.shared;
        if eu.thread_count.load(Ordering::Acquire) != 0 {
            self.run_empty(dispatcher);
        }
        self.wait_workers_parked();
        eu.exit_flag.store(1, Ordering::Release);

        let workers = ((1u32 << self.compute_cores) - 1) & !dispatcher.cluster_mask();
        self.interrupts.cluster_set(self.cluster, workers);
        log::debug!("cluster {} event unit exit", self.cluster);
    }

    fn participate(&self, core: &CoreIdentity) {
        let eu = &*self.shared;
        let _ = eu.state.compare_exchange(
            DispatchState::Posted as u32,
            DispatchState::Running as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let entry = self
            .entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let thread_count = eu.thread_count.load(Ordering::Acquire);
        let ctx = TaskContext {
            core: *core,
            args: ArgBlock {
                addr: eu.args_addr.load(Ordering::Relaxed),
                argc: eu.argc.load(Ordering::Relaxed),
            },
            thread_count,
        };
        log::trace!("{} runs task", core);
        if let Some(entry) = entry {
            entry(&ctx);
        }

        let done = eu.completed_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(done <= thread_count, "more completions than participants");
        if done == thread_count {
            eu.state.store(DispatchState::Drained as u32, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{test_machine, CoreContext};
    use crate::topology::TopologyConfig;
    use std::collections::BTreeSet;

    /// Workers park, core 0 runs `dispatcher`, then everyone leaves.
    fn with_event_unit(topology: TopologyConfig, dispatcher: impl Fn(&CoreContext) + Sync) {
        let machine = test_machine(topology);
        let workers = topology.compute_cores_per_cluster() - 1;
        machine.run(|ctx| {
            let core = *ctx.identity();
            let eu = ctx.event_unit();
            if core.core_in_cluster == 0 {
                eu.wait_workers_ready(workers);
                dispatcher(ctx);
                eu.exit(&core);
            } else if core.is_compute() {
                eu.event_loop(&core);
            }
        });
    }

    #[test]
    fn test_dispatch_runs_exactly_thread_count_times() {
        with_event_unit(TopologyConfig::new(5, 1, 1, 1), |ctx| {
            let eu = ctx.event_unit();
            let core = ctx.identity();
            for k in 1..=4 {
                let counter = Arc::new(AtomicU32::new(0));
                let c = Arc::clone(&counter);
                eu.dispatch_push(
                    Arc::new(move |_: &TaskContext| {
                        c.fetch_add(1, Ordering::Relaxed);
                    }),
                    ArgBlock::default(),
                    k,
                );
                assert_eq!(eu.state(), DispatchState::Posted);
                eu.run_empty(core);
                assert_eq!(counter.load(Ordering::Relaxed), k);
                assert_eq!(eu.state(), DispatchState::Idle);
                assert_eq!(eu.thread_count(), 0);
            }
        });
    }

    #[test]
    fn test_excluded_workers_stay_parked() {
        with_event_unit(TopologyConfig::new(5, 1, 1, 1), |ctx| {
            let eu = ctx.event_unit();
            let ran = Arc::new(Mutex::new(BTreeSet::new()));
            for _ in 0..10 {
                let r = Arc::clone(&ran);
                eu.dispatch_push(
                    Arc::new(move |task: &TaskContext| {
                        assert_eq!(task.thread_count, 2);
                        r.lock().unwrap().insert(task.core.core_in_cluster);
                    }),
                    ArgBlock::default(),
                    2,
                );
                eu.run_empty(ctx.identity());
            }
            assert_eq!(*ran.lock().unwrap(), BTreeSet::from([0, 1]));
        });
    }

    #[test]
    fn test_workers_outside_thread_count_never_wake() {
        with_event_unit(TopologyConfig::new(5, 1, 1, 1), |ctx| {
            let eu = ctx.event_unit();
            let noop: Task = Arc::new(|_: &TaskContext| {});
            for thread_count in [2, 1, 2, 2, 1] {
                eu.dispatch_push(Arc::clone(&noop), ArgBlock::default(), thread_count);
                eu.run_empty(ctx.identity());
                assert_eq!(ctx.interrupts().cluster_pending(0) & 0b1100, 0);
            }
            eu.wait_workers_parked();
            assert_eq!(eu.wakeups(1), 3);
            assert_eq!(eu.wakeups(2), 0);
            assert_eq!(eu.wakeups(3), 0);
        });
    }

    #[test]
    fn test_arguments_reach_every_participant() {
        with_event_unit(TopologyConfig::new(9, 1, 1, 1), |ctx| {
            let eu = ctx.event_unit();
            let args = ctx.l1().alloc(16).unwrap();
            ctx.memory().write_u64(args, 7).unwrap();
            ctx.memory().write_u64(args + 8, 5).unwrap();

            for n in [8, 4, 1] {
                let sum = Arc::new(AtomicU64::new(0));
                let s = Arc::clone(&sum);
                let memory = ctx.cluster().l1().region().clone();
                eu.dispatch_push(
                    Arc::new(move |task: &TaskContext| {
                        let mut word = [0u8; 8];
                        memory.read_bytes(task.args.addr, &mut word).unwrap();
                        assert_eq!(task.args.argc, 2);
                        s.fetch_add(u64::from_le_bytes(word), Ordering::Relaxed);
                    }),
                    ArgBlock::new(args, 2),
                    n,
                );
                eu.run_empty(ctx.identity());
                assert_eq!(sum.load(Ordering::Relaxed), 7 * n as u64);
            }
        });
    }

    #[test]
    fn test_run_empty_without_task_returns() {
        with_event_unit(TopologyConfig::new(3, 1, 1, 1), |ctx| {
            ctx.event_unit().run_empty(ctx.identity());
            assert_eq!(ctx.event_unit().state(), DispatchState::Idle);
        });
    }

    #[test]
    fn test_exit_drains_pending_task() {
        let hits = Arc::new(AtomicU32::new(0));
        with_event_unit(TopologyConfig::new(4, 1, 1, 1), |ctx| {
            let h = Arc::clone(&hits);
            ctx.event_unit().dispatch_push(
                Arc::new(move |_: &TaskContext| {
                    h.fetch_add(1, Ordering::Relaxed);
                }),
                ArgBlock::default(),
                3,
            );
            // No run_empty: exit() has to drain it
        });
        assert_eq!(hits.load(Ordering::Relaxed), 3);
    }
}
