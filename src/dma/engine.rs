//! Cluster DMA engine.
//!
//! One engine per cluster, driven by the cluster's DM core. Descriptors are
//! queued in issue order and executed one at a time by a background engine
//! thread standing in for the hardware, so transfers complete in the order
//! they were started. Completion is published through a monotonically
//! increasing `completed` watermark: transfer `id` is done once the
//! watermark reaches it.
//!
//! # Usage
//!
//! ```ignore
//! let dma = ctx.dma();
//! let a = dma.start_1d(l1_buf, l3_src, 4096);
//! let b = dma.start_2d(l1_tile, l3_matrix, row_bytes, row_bytes, pitch, rows);
//! dma.wait(a);      // only `a` (and anything before it) is done
//! dma.wait_all();   // everything issued so far is done
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::descriptor::{DmaDescriptor, TransferId, TransferState};
use crate::memory::AddressMap;
use crate::sync::WaitPolicy;

/// Throughput counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaStats {
    /// Transfers completed.
    pub transfers: u64,
    /// Bytes moved.
    pub bytes: u64,
    /// Time the engine spent copying.
    pub busy: Duration,
    /// Wall time covered by the counters.
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct EngineQueue {
    pending: VecDeque<DmaDescriptor>,
    in_flight: Option<DmaDescriptor>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Tracking {
    started: Option<Instant>,
    window: DmaStats,
    lifetime: DmaStats,
}

struct EngineShared {
    cluster: u32,
    memory: Arc<AddressMap>,
    queue: Mutex<EngineQueue>,
    work: Condvar,
    /// Last issued id.
    issued: AtomicU32,
    /// Last completed id.
    completed: AtomicU32,
    tracking: Mutex<Tracking>,
}

impl EngineShared {
    fn queue(&self) -> MutexGuard<'_, EngineQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Engine thread body.
    fn run(&self) {
        log::debug!("cluster {} dma engine up", self.cluster);
        loop {
            let desc = {
                let mut queue = self.queue();
                loop {
                    if let Some(mut desc) = queue.pending.pop_front() {
                        desc.state = TransferState::InFlight;
                        queue.in_flight = Some(desc);
                        break desc;
                    }
                    if queue.shutdown {
                        log::debug!("cluster {} dma engine down", self.cluster);
                        return;
                    }
                    queue = self.work.wait(queue).unwrap_or_else(PoisonError::into_inner);
                }
            };

            let started = Instant::now();
            self.execute(&desc);
            let busy = started.elapsed();

            {
                let mut guard = self.tracking();
                let tracking = &mut *guard;
                for stats in [&mut tracking.lifetime, &mut tracking.window] {
                    stats.transfers += 1;
                    stats.bytes += desc.total_bytes();
                    stats.busy += busy;
                }
            }

            self.queue().in_flight = None;
            self.completed.store(desc.transfer_id, Ordering::Release);
            log::trace!("cluster {} dma done {}", self.cluster, desc);
        }
    }

    fn execute(&self, desc: &DmaDescriptor) {
        for (dst, src) in desc.rows() {
            if let Err(e) = self.memory.copy(dst, src, desc.size) {
                log::error!("cluster {} dma {} aborted: {}", self.cluster, desc, e);
                return;
            }
        }
    }
}

/// A cluster's DMA engine.
pub struct DmaEngine {
    shared: Arc<EngineShared>,
    policy: WaitPolicy,
    worker: Option<JoinHandle<()>>,
}

impl DmaEngine {
    /// Create the engine and start its engine thread.
    pub fn new(cluster: u32, memory: Arc<AddressMap>, policy: WaitPolicy) -> std::io::Result<Self> {
        let shared = Arc::new(EngineShared {
            cluster,
            memory,
            queue: Mutex::new(EngineQueue::default()),
            work: Condvar::new(),
            issued: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            tracking: Mutex::new(Tracking::default()),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("dma-{}", cluster))
                .spawn(move || shared.run())?
        };
        Ok(Self {
            shared,
            policy,
            worker: Some(worker),
        })
    }

    pub fn cluster(&self) -> u32 {
        self.shared.cluster
    }

    /// Start a contiguous copy of `size` bytes.
    pub fn start_1d(&self, dst: u64, src: u64, size: usize) -> TransferId {
        self.start_2d(dst, src, size, 0, 0, 1)
    }

    /// Start a strided copy of `repetitions` rows of `size` bytes.
    pub fn start_2d(
        &self,
        dst: u64,
        src: u64,
        size: usize,
        dst_stride: u64,
        src_stride: u64,
        repetitions: u32,
    ) -> TransferId {
        let mut queue = self.shared.queue();
        let id = self.shared.issued.load(Ordering::Relaxed) + 1;
        let desc = DmaDescriptor::new_2d(id, dst, src, size, dst_stride, src_stride, repetitions);
        debug_assert!(
            desc.validate(|addr, len| self.shared.memory.resolve(addr, len).is_ok()).is_ok(),
            "dma descriptor {} touches unmapped memory",
            desc
        );
        log::trace!("cluster {} dma start {}", self.shared.cluster, desc);

        queue.pending.push_back(desc);
        self.shared.issued.store(id, Ordering::Release);
        drop(queue);
        self.shared.work.notify_one();
        id
    }

    /// Block until transfer `id` (and everything issued before it) is done.
    pub fn wait(&self, id: TransferId) {
        debug_assert!(
            id <= self.shared.issued.load(Ordering::Acquire),
            "waiting on transfer {} that was never started",
            id
        );
        self.policy.spin_until("dma wait", || {
            self.shared.completed.load(Ordering::Acquire) >= id
        });
    }

    /// Block until every transfer issued before this call is done.
    pub fn wait_all(&self) {
        let target = self.shared.issued.load(Ordering::Acquire);
        self.wait(target);
    }

    /// Whether every issued transfer is done.
    pub fn is_idle(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire) == self.shared.issued.load(Ordering::Acquire)
    }

    /// Where transfer `id` is in its lifecycle; `None` if never issued.
    pub fn descriptor_state(&self, id: TransferId) -> Option<TransferState> {
        if id == 0 || id > self.shared.issued.load(Ordering::Acquire) {
            return None;
        }
        if self.shared.completed.load(Ordering::Acquire) >= id {
            return Some(TransferState::Done);
        }
        let queue = self.shared.queue();
        if queue.in_flight.is_some_and(|d| d.transfer_id == id) {
            return Some(TransferState::InFlight);
        }
        if queue.pending.iter().any(|d| d.transfer_id == id) {
            return Some(TransferState::Queued);
        }
        // Finished between the watermark check and taking the lock
        Some(TransferState::Done)
    }

    /// Transfers started but not yet done.
    pub fn outstanding(&self) -> u32 {
        let completed = self.shared.completed.load(Ordering::Acquire);
        self.shared.issued.load(Ordering::Acquire) - completed
    }

    /// Open a tracking window; counters restart from zero.
    pub fn start_tracking(&self) {
        let mut tracking = self.shared.tracking();
        tracking.started = Some(Instant::now());
        tracking.window = DmaStats::default();
    }

    /// Close the tracking window and return what it saw.
    pub fn stop_tracking(&self) -> DmaStats {
        let mut tracking = self.shared.tracking();
        let mut stats = tracking.window;
        stats.elapsed = tracking
            .started
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        tracking.window = DmaStats::default();
        stats
    }

    /// Counters since the engine was created.
    pub fn lifetime_stats(&self) -> DmaStats {
        self.shared.tracking().lifetime
    }
}

impl Drop for DmaEngine {
    fn drop(&mut self) {
        self.shared.queue().shutdown = true;
        self.shared.work.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("cluster {} dma engine thread panicked", self.shared.cluster);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegion;

    const L1: u64 = 0x1000_0000;
    const L3: u64 = 0x8000_0000;

    fn engine() -> (DmaEngine, Arc<AddressMap>) {
        let mut map = AddressMap::new();
        map.add(Arc::new(MemoryRegion::new("tcdm", L1, 0x4000))).unwrap();
        map.add(Arc::new(MemoryRegion::new("l3", L3, 0x4000))).unwrap();
        let map = Arc::new(map);
        let dma = DmaEngine::new(0, Arc::clone(&map), WaitPolicy::bounded(Duration::from_secs(10))).unwrap();
        (dma, map)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_1d_copies_exact_bytes() {
        let (dma, mem) = engine();
        for size in [0usize, 1, 4096, 4095] {
            let src = pattern(size);
            mem.write_bytes(L3, &src).unwrap();
            mem.write_bytes(L1, &vec![0xee; size + 1]).unwrap();

            let id = dma.start_1d(L1, L3, size);
            dma.wait(id);

            let mut dst = vec![0u8; size + 1];
            mem.read_bytes(L1, &mut dst).unwrap();
            assert_eq!(&dst[..size], &src[..], "size {}", size);
            // Nothing past the end is touched
            assert_eq!(dst[size], 0xee, "size {}", size);
        }
    }

    #[test]
    fn test_2d_gathers_strided_rows() {
        let (dma, mem) = engine();
        let src: Vec<u32> = (0..8).collect();
        mem.write_slice(L3, &src).unwrap();

        // 4-byte rows: every other word from the source, packed at the destination
        let id = dma.start_2d(L1, L3, 4, 4, 8, 4);
        dma.wait(id);
        assert_eq!(mem.read_slice::<u32>(L1, 4).unwrap(), vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_transfers_complete_in_order() {
        let (dma, mem) = engine();
        mem.write_slice(L3, &pattern(0x1000)).unwrap();
        let ids: Vec<_> = (0..8).map(|i| dma.start_1d(L1 + i * 0x200, L3, 0x200)).collect();
        assert_eq!(ids, (1..=8).collect::<Vec<_>>());

        dma.wait(ids[3]);
        for &id in &ids[..4] {
            assert_eq!(dma.descriptor_state(id), Some(TransferState::Done));
        }
        dma.wait_all();
        assert!(dma.is_idle());
        assert_eq!(dma.outstanding(), 0);
        assert_eq!(dma.descriptor_state(9), None);
        assert_eq!(dma.descriptor_state(0), None);
    }

    #[test]
    fn test_wait_all_when_idle_returns() {
        let (dma, _) = engine();
        dma.wait_all();
        assert!(dma.is_idle());
    }

    #[test]
    fn test_tracking_window() {
        let (dma, _) = engine();
        dma.start_1d(L1, L3, 64);
        dma.wait_all();

        dma.start_tracking();
        dma.start_1d(L1, L3, 128);
        dma.start_2d(L1, L3, 16, 16, 32, 4);
        dma.wait_all();
        let stats = dma.stop_tracking();

        assert_eq!(stats.transfers, 2);
        assert_eq!(stats.bytes, 128 + 64);
        assert_eq!(dma.lifetime_stats().transfers, 3);
        assert_eq!(dma.lifetime_stats().bytes, 64 + 128 + 64);
    }
}
