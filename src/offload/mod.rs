//! Job offload between the host (hart 0) and the device cores.
//!
//! The host writes a job record into global memory and publishes its
//! address through the comm buffer at `global_base`, then raises the software
//! interrupt of every device hart and sleeps until the device reports back.
//!
//! ```text
//!   host                          DM cores                 compute cores
//!   ────                          ────────                 ─────────────
//!   write record ─► comm.post
//!   clint_set_mask ─────────────► wake ──────────────────► wake
//!                                 dma record -> L1
//!                                 ════════════ cluster hw barrier ════════
//!                                 run_dm                   run_compute
//!                                 ════════════ cluster hw barrier ════════
//!                                 elect ─► leader
//!   sw_poll(0) ◄──────────────────────── msip[0]
//! ```
//!
//! A record is a [`JobHeader`] followed by `args_size` bytes of arguments.
//! A null record pointer tells the device to leave [`run_job_loop`].

mod axpy;

pub use axpy::{AxpyArgs, AxpyJob, AXPY_JOB_ID};

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::election::{post_wakeup, return_to_host, SyncMode, HOST_HART};
use crate::hal::WakeSource;
use crate::interrupts::Interrupts;
use crate::machine::{CoreContext, GlobalState};
use crate::memory::{align_up, AddressMap, AllocError, MemoryError, MIN_CHUNK_SIZE};
use crate::topology::TopologyConfig;

/// Record pointer that ends the job loop.
pub const EXIT_JOB_PTR: u64 = 0;

/// Host/device mailbox at the start of global memory.
#[derive(Debug, Default)]
#[repr(C)]
pub struct CommBuffer {
    lock: AtomicU32,
    _reserved: AtomicU32,
    user_data_ptr: AtomicU64,
}

impl CommBuffer {
    pub const fn new() -> Self {
        Self {
            lock: AtomicU32::new(0),
            _reserved: AtomicU32::new(0),
            user_data_ptr: AtomicU64::new(0),
        }
    }

    /// Publish a job record.
    pub fn post(&self, job_ptr: u64) {
        self.user_data_ptr.store(job_ptr, Ordering::Relaxed);
        self.lock.store(1, Ordering::Release);
    }

    /// The posted record, if any.
    pub fn job_ptr(&self) -> Option<u64> {
        if self.lock.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(self.user_data_ptr.load(Ordering::Relaxed))
    }

    /// Mark the mailbox empty again.
    pub fn release(&self) {
        self.lock.store(0, Ordering::Release);
    }
}

/// Fixed header of every job record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct JobHeader {
    pub id: u32,
    /// Bytes of arguments following the header.
    pub args_size: u32,
}

impl JobHeader {
    pub const SIZE: u64 = mem::size_of::<JobHeader>() as u64;

    /// Header plus arguments.
    pub fn record_size(&self) -> u64 {
        Self::SIZE + self.args_size as u64
    }
}

/// Where a job's record lives while it runs.
#[derive(Debug, Clone, Copy)]
pub struct JobFrame {
    pub header: JobHeader,
    /// Record in global memory.
    pub remote: u64,
    /// Copy of the record in this cluster's TCDM.
    pub local: u64,
}

impl JobFrame {
    /// Arguments inside the local copy.
    pub fn args_addr(&self) -> u64 {
        self.local + JobHeader::SIZE
    }

    /// First free TCDM address after the local copy.
    pub fn scratch_base(&self) -> u64 {
        align_up(self.local + self.header.record_size(), MIN_CHUNK_SIZE)
    }

    pub fn read_args<T: FromBytes>(&self, memory: &AddressMap) -> Result<T, MemoryError> {
        memory.read_obj(self.args_addr())
    }
}

/// A job the device knows how to run.
///
/// Both entry points run between two cluster barriers taken by the job loop
/// and must agree on how many barriers they take in between.
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// Runs on each cluster's DM core.
    fn run_dm(&self, ctx: &CoreContext, frame: &JobFrame);

    /// Runs on every compute core.
    fn run_compute(&self, ctx: &CoreContext, frame: &JobFrame);
}

/// Jobs by id.
#[derive(Default)]
pub struct JobTable {
    jobs: HashMap<u32, Box<dyn Job>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` under `id`, replacing any previous entry.
    pub fn register(&mut self, id: u32, job: impl Job + 'static) -> &mut Self {
        if let Some(old) = self.jobs.insert(id, Box::new(job)) {
            log::warn!("job {} ({}) replaced", id, old.name());
        }
        self
    }

    pub fn get(&self, id: u32) -> Option<&dyn Job> {
        self.jobs.get(&id).map(|job| &**job)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Device side of the offload protocol. Every core calls this and returns
/// once the host posts [`EXIT_JOB_PTR`].
pub fn run_job_loop(ctx: &CoreContext, table: &JobTable) {
    let core = *ctx.identity();
    post_wakeup(ctx);
    return_to_host(ctx, SyncMode::All);

    loop {
        ctx.interrupts().wfi(core.hartid, WakeSource::Software);
        post_wakeup(ctx);

        let ptr = match ctx.global().comm().job_ptr() {
            Some(ptr) => ptr,
            None => {
                log::warn!("{} woke without a posted job", core);
                continue;
            }
        };
        if ptr == EXIT_JOB_PTR {
            log::debug!("{} leaves job loop", core);
            return;
        }

        if core.is_dm() {
            run_dm_side(ctx, table, ptr);
        } else {
            run_compute_side(ctx, table, ptr);
        }
    }
}

fn run_dm_side(ctx: &CoreContext, table: &JobTable, remote: u64) {
    let core = ctx.identity();
    let l1 = ctx.l1();
    let local = l1.next();
    let frame = job_frame(ctx, remote, local);

    if let Some(frame) = &frame {
        ctx.dma()
            .start_1d(local, remote, frame.header.record_size() as usize);
        ctx.dma().wait_all();
    }
    ctx.cluster_hw_barrier();

    if let Some(frame) = &frame {
        // Compute cores have read `local` by now; keep job allocations off
        // the record.
        if let Err(e) = l1.alloc(frame.header.record_size()) {
            log::error!("{} cannot reserve job record: {}", core, e);
        }
        match table.get(frame.header.id) {
            Some(job) => {
                log::debug!("{} runs job {} ({})", core, frame.header.id, job.name());
                job.run_dm(ctx, frame);
            }
            None => log::warn!("{} skips unknown job {}", core, frame.header.id),
        }
    }
    ctx.cluster_hw_barrier();

    l1.update_next(local);
    return_to_host(ctx, SyncMode::Clusters);
}

fn run_compute_side(ctx: &CoreContext, table: &JobTable, remote: u64) {
    // The DM core only allocates past the record after this barrier.
    let local = ctx.l1().next();
    let frame = job_frame(ctx, remote, local);
    ctx.cluster_hw_barrier();

    if let Some(frame) = &frame {
        if let Some(job) = table.get(frame.header.id) {
            job.run_compute(ctx, frame);
        }
    }
    ctx.cluster_hw_barrier();
}

/// Frame of the record at `remote`, or `None` if the record is unreadable or
/// its copy would not fit in TCDM. Every core of a cluster reaches the same
/// answer.
fn job_frame(ctx: &CoreContext, remote: u64, local: u64) -> Option<JobFrame> {
    let header = match ctx.memory().read_obj::<JobHeader>(remote) {
        Ok(header) => header,
        Err(e) => {
            log::error!("{} cannot read job record at {:#x}: {}", ctx.identity(), remote, e);
            return None;
        }
    };
    if local + header.record_size() > ctx.l1().region().end() {
        log::error!(
            "{} has no TCDM left for a job record of {} bytes",
            ctx.identity(),
            header.record_size()
        );
        return None;
    }
    Some(JobFrame {
        header,
        remote,
        local,
    })
}

/// Errors on the host side of an offload.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("no room for job record: {0}")]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("job arguments of {0} bytes do not fit a record")]
    ArgsTooLarge(usize),
}

/// Supervisor running on hart 0.
pub struct Host {
    topology: TopologyConfig,
    interrupts: Interrupts,
    memory: Arc<AddressMap>,
    global: Arc<GlobalState>,
}

impl Host {
    pub(crate) fn new(
        topology: TopologyConfig,
        interrupts: Interrupts,
        memory: Arc<AddressMap>,
        global: Arc<GlobalState>,
    ) -> Self {
        Self {
            topology,
            interrupts,
            memory,
            global,
        }
    }

    pub fn memory(&self) -> &AddressMap {
        &self.memory
    }

    /// Block until the device raises the host's software interrupt.
    pub fn wait_for_device(&self) {
        self.interrupts.sw_poll(HOST_HART);
    }

    /// Copy `data` into freshly allocated global memory.
    pub fn upload<T: IntoBytes + Immutable>(&self, data: &[T]) -> Result<u64, HostError> {
        let addr = self.global.l3().alloc(mem::size_of_val(data) as u64)?;
        self.memory.write_slice(addr, data)?;
        Ok(addr)
    }

    pub fn download<T: FromBytes + IntoBytes>(&self, addr: u64, count: usize) -> Result<Vec<T>, HostError> {
        Ok(self.memory.read_slice(addr, count)?)
    }

    /// Run job `id` with `args` on the device and wait for it to finish.
    pub fn offload<A: IntoBytes + Immutable>(&self, id: u32, args: &A) -> Result<(), HostError> {
        let bytes = args.as_bytes();
        let args_size = u32::try_from(bytes.len()).map_err(|_| HostError::ArgsTooLarge(bytes.len()))?;
        let header = JobHeader { id, args_size };

        let l3 = self.global.l3();
        let mark = l3.next();
        let record = l3.alloc(header.record_size())?;
        self.memory.write_obj(record, &header)?;
        self.memory.write_bytes(record + JobHeader::SIZE, bytes)?;

        log::debug!("host posts job {} at {:#x}", id, record);
        self.global.comm().post(record);
        self.wake_device();
        self.wait_for_device();
        self.global.comm().release();
        l3.update_next(mark);
        log::info!("job {} done", id);
        Ok(())
    }

    /// Make every core leave the job loop. Does not wait.
    pub fn shutdown(&self) {
        log::debug!("host posts exit");
        self.global.comm().post(EXIT_JOB_PTR);
        self.wake_device();
    }

    fn wake_device(&self) {
        self.interrupts
            .clint_set_mask(self.topology.hartid_base, self.topology.core_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::test_machine;
    use std::sync::atomic::AtomicU32;

    struct CountJob {
        dm_runs: Arc<AtomicU32>,
        compute_runs: Arc<AtomicU32>,
    }

    impl Job for CountJob {
        fn name(&self) -> &str {
            "count"
        }

        fn run_dm(&self, ctx: &CoreContext, frame: &JobFrame) {
            let add: u32 = frame.read_args(ctx.memory()).unwrap();
            self.dm_runs.fetch_add(add, Ordering::Relaxed);
        }

        fn run_compute(&self, ctx: &CoreContext, frame: &JobFrame) {
            let add: u32 = frame.read_args(ctx.memory()).unwrap();
            self.compute_runs.fetch_add(add, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_comm_buffer_post_and_release() {
        let comm = CommBuffer::new();
        assert_eq!(comm.job_ptr(), None);
        comm.post(0x8000_1000);
        assert_eq!(comm.job_ptr(), Some(0x8000_1000));
        comm.release();
        assert_eq!(comm.job_ptr(), None);
        comm.post(EXIT_JOB_PTR);
        assert_eq!(comm.job_ptr(), Some(EXIT_JOB_PTR));
    }

    #[test]
    fn test_job_header_layout() {
        assert_eq!(JobHeader::SIZE, 8);
        let header = JobHeader { id: 3, args_size: 12 };
        assert_eq!(header.as_bytes(), &[3, 0, 0, 0, 12, 0, 0, 0]);
        assert_eq!(header.record_size(), 20);
    }

    #[test]
    fn test_jobs_run_on_every_core() {
        let machine = test_machine(TopologyConfig::new(3, 2, 1, 1));
        let dm_runs = Arc::new(AtomicU32::new(0));
        let compute_runs = Arc::new(AtomicU32::new(0));
        let mut table = JobTable::new();
        table.register(
            7,
            CountJob {
                dm_runs: Arc::clone(&dm_runs),
                compute_runs: Arc::clone(&compute_runs),
            },
        );

        let marks: Vec<u64> = (0..2).map(|c| machine.cluster(c).l1().next()).collect();
        machine.run_with_host(
            |ctx| run_job_loop(ctx, &table),
            |host| {
                host.wait_for_device();
                host.offload(7, &1u32).unwrap();
                host.offload(7, &10u32).unwrap();
                // Unknown ids are skipped but still reported back
                host.offload(99, &0u32).unwrap();
                host.shutdown();
            },
        );

        // 2 clusters: 2 DM cores and 4 compute cores
        assert_eq!(dm_runs.load(Ordering::Relaxed), 2 * 11);
        assert_eq!(compute_runs.load(Ordering::Relaxed), 4 * 11);
        // TCDM copies of the records are reclaimed
        for (c, mark) in (0..2).zip(marks) {
            assert_eq!(machine.cluster(c).l1().next(), mark);
        }
    }

    #[test]
    fn test_register_replaces() {
        let mut table = JobTable::new();
        let runs = || Arc::new(AtomicU32::new(0));
        table
            .register(1, CountJob { dm_runs: runs(), compute_runs: runs() })
            .register(1, CountJob { dm_runs: runs(), compute_runs: runs() });
        assert_eq!(table.len(), 1);
        assert!(table.get(1).is_some());
        assert!(table.get(2).is_none());
    }
}
