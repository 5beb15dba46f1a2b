//! OpenMP-style parallel regions on top of the event unit.
//!
//! Core 0 of a cluster is the master. [`bootstrap`] parks the workers in
//! the event loop and the DM core in its request queue; the master then
//! opens regions with [`parallel`] or [`parallel_for`] and finally tears the
//! session down with [`destroy`].
//!
//! Loop iterations are split statically: [`static_range`] hands every
//! thread one contiguous block, [`static_chunks`] deals fixed-size chunks
//! round-robin.
//!
//! # Usage
//!
//! ```ignore
//! machine.run(|ctx| {
//!     if !omp::bootstrap(ctx) {
//!         return;
//!     }
//!     omp::parallel_for(ctx, omp::max_threads(ctx), 0..n, move |i| {
//!         scale(i);
//!     });
//!     omp::destroy(ctx);
//! });
//! ```

use std::ops::Range;
use std::sync::Arc;

use super::{ArgBlock, Task, TaskContext};
use crate::machine::CoreContext;
use crate::memory::Placed;
use crate::sync::{CountingBarrier, WaitPolicy};
use crate::topology::CoreIdentity;

/// One participant's view of a parallel region.
pub struct Team<'a> {
    task: &'a TaskContext,
    barrier: &'a CountingBarrier,
    policy: WaitPolicy,
}

impl Team<'_> {
    /// Index of this thread, `0..num_threads`.
    pub fn thread_num(&self) -> u32 {
        self.task.core.core_in_cluster
    }

    pub fn num_threads(&self) -> u32 {
        self.task.thread_count
    }

    pub fn is_master(&self) -> bool {
        self.thread_num() == 0
    }

    pub fn core(&self) -> &CoreIdentity {
        &self.task.core
    }

    pub fn args(&self) -> ArgBlock {
        self.task.args
    }

    /// Wait for every thread of the team. Returns `true` on the last to
    /// arrive.
    pub fn barrier(&self) -> bool {
        self.barrier.wait(self.task.thread_count, &self.policy)
    }

    /// This thread's block of `range`.
    pub fn static_range(&self, range: Range<u64>) -> Range<u64> {
        static_range(range, self.thread_num(), self.num_threads())
    }

    /// This thread's chunks of `range`, `chunk` iterations each.
    pub fn static_chunks(&self, range: Range<u64>, chunk: u64) -> impl Iterator<Item = Range<u64>> {
        static_chunks(range, chunk, self.thread_num(), self.num_threads())
    }
}

/// Contiguous block of `range` for `thread` out of `threads`. The first
/// `len % threads` threads take one extra iteration.
pub fn static_range(range: Range<u64>, thread: u32, threads: u32) -> Range<u64> {
    debug_assert!(thread < threads, "thread {} outside a team of {}", thread, threads);
    let len = range.end.saturating_sub(range.start);
    let (thread, threads) = (thread as u64, threads.max(1) as u64);
    let chunk = len / threads;
    let left = len % threads;
    let start = range.start + thread * chunk + thread.min(left);
    let end = start + chunk + u64::from(thread < left);
    start..end
}

/// Chunks of `chunk` iterations dealt round-robin, starting with thread 0.
/// The last chunk of the loop may be short.
pub fn static_chunks(
    range: Range<u64>,
    chunk: u64,
    thread: u32,
    threads: u32,
) -> impl Iterator<Item = Range<u64>> {
    debug_assert!(thread < threads, "thread {} outside a team of {}", thread, threads);
    let chunk = chunk.max(1);
    let span = chunk.saturating_mul(threads.max(1) as u64);
    let end = range.end;
    let first = range.start.saturating_add(chunk.saturating_mul(thread as u64));
    (first..end)
        .step_by(usize::try_from(span).unwrap_or(usize::MAX))
        .map(move |lo| lo..lo.saturating_add(chunk).min(end))
}

/// Largest team a region on this cluster can have.
pub fn max_threads(ctx: &CoreContext) -> u32 {
    ctx.topology().compute_cores_per_cluster()
}

/// Enter OpenMP mode on every core of a cluster.
///
/// Returns `true` on the master once the workers are parked and the DM
/// core is serving. The other cores return `false` after the master's
/// [`destroy`].
pub fn bootstrap(ctx: &CoreContext) -> bool {
    let core = *ctx.identity();
    let eu = ctx.event_unit();
    if core.core_in_cluster == 0 {
        eu.wait_workers_ready(max_threads(ctx) - 1);
        ctx.dm_queue().wait_ready();
        log::debug!("{} is the omp master", core);
        return true;
    }

    if core.is_dm() {
        ctx.dm_queue().serve(ctx.dma());
    } else {
        eu.event_loop(&core);
    }
    ctx.cluster_hw_barrier();
    false
}

/// Release the workers and the DM core. Master only.
pub fn destroy(ctx: &CoreContext) {
    let core = ctx.identity();
    debug_assert_eq!(core.core_in_cluster, 0, "{} is not the omp master", core);
    ctx.event_unit().exit(core);
    ctx.dm_queue().exit();
    ctx.cluster_hw_barrier();
}

/// Run `body` on threads `0..num_threads` of the cluster and wait for all
/// of them. Master only.
///
/// Inside a region the cluster's counting barrier belongs to the team.
pub fn parallel<F>(ctx: &CoreContext, num_threads: u32, args: ArgBlock, body: F)
where
    F: Fn(&Team<'_>) + Send + Sync + 'static,
{
    let core = ctx.identity();
    debug_assert_eq!(core.core_in_cluster, 0, "{} is not the omp master", core);

    let barrier: Placed<CountingBarrier> = ctx.cluster().sw_barrier().clone();
    let policy = ctx.policy();
    let task: Task = Arc::new(move |task: &TaskContext| {
        body(&Team {
            task,
            barrier: &barrier,
            policy,
        });
    });

    let eu = ctx.event_unit();
    eu.dispatch_push(task, args, num_threads);
    eu.run_empty(core);
}

/// Parallel loop over `range` with a static schedule.
pub fn parallel_for<F>(ctx: &CoreContext, num_threads: u32, range: Range<u64>, body: F)
where
    F: Fn(u64) + Send + Sync + 'static,
{
    parallel(ctx, num_threads, ArgBlock::default(), move |team| {
        team.static_range(range.clone()).for_each(&body);
    });
}
