//! Data-mover request queue.
//!
//! Compute cores cannot program the DMA engine, so they post copy requests
//! into a small ring in TCDM and the DM core executes them. The DM core
//! sleeps in `sw_poll` whenever the ring is empty and no status request is
//! pending; every post raises its software interrupt.
//!
//! ```text
//!   compute cores                       DM core (serve)
//!  ─────────────                       ───────────────
//!  memcpy_async ─┐   ring[4]          ┌─► start_1d / start_2d
//!  memcpy2d ─────┼─► front ... back ──┘
//!  wait ─────────┼─► stat_q=WAIT_IDLE ──► engine idle? ─► stat_p=1
//!  exit ─────────┘   stat_q=EXIT ──────► return
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::engine::DmaEngine;
use crate::interrupts::Interrupts;
use crate::memory::Placed;
use crate::sync::{HwMutex, WaitPolicy};

/// Ring depth.
pub const DM_TASK_QUEUE_SIZE: usize = 4;

/// Status requests from compute cores to the DM core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusRequest {
    None = 0,
    /// Answer once the engine has no transfer outstanding.
    WaitIdle = 1,
    /// Leave `serve`.
    Exit = 2,
    /// Answer as soon as the DM core is serving.
    Ready = 3,
}

impl StatusRequest {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => StatusRequest::WaitIdle,
            2 => StatusRequest::Exit,
            3 => StatusRequest::Ready,
            _ => StatusRequest::None,
        }
    }
}

#[derive(Debug, Default)]
struct DmTaskSlot {
    src: AtomicU64,
    dst: AtomicU64,
    size: AtomicU64,
    src_stride: AtomicU64,
    dst_stride: AtomicU64,
    repetitions: AtomicU32,
}

/// Ring and status words, placed in TCDM.
#[derive(Debug, Default)]
pub struct DmQueueState {
    slots: [DmTaskSlot; DM_TASK_QUEUE_SIZE],
    /// Next slot the DM core consumes.
    back: AtomicU32,
    /// Next slot a producer fills.
    front: AtomicU32,
    fill: AtomicU32,
    mutex: HwMutex,
    stat_q: AtomicU32,
    stat_p: AtomicU32,
}

/// Handle used by both sides of the queue.
#[derive(Clone)]
pub struct DataMoverQueue {
    state: Placed<DmQueueState>,
    interrupts: Interrupts,
    dm_hart: u32,
    policy: WaitPolicy,
}

impl DataMoverQueue {
    pub fn new(
        state: Placed<DmQueueState>,
        interrupts: Interrupts,
        dm_hart: u32,
        policy: WaitPolicy,
    ) -> Self {
        Self {
            state,
            interrupts,
            dm_hart,
            policy,
        }
    }

    /// Queue a contiguous copy.
    pub fn memcpy_async(&self, dst: u64, src: u64, size: usize) {
        self.post(dst, src, size, 0, 0, 1);
    }

    /// Queue a strided copy.
    pub fn memcpy2d_async(
        &self,
        dst: u64,
        src: u64,
        size: usize,
        dst_stride: u64,
        src_stride: u64,
        repetitions: u32,
    ) {
        self.post(dst, src, size, dst_stride, src_stride, repetitions);
    }

    fn post(
        &self,
        dst: u64,
        src: u64,
        size: usize,
        dst_stride: u64,
        src_stride: u64,
        repetitions: u32,
    ) {
        let q = &*self.state;
        loop {
            self.policy.spin_until("dm queue full", || {
                q.fill.load(Ordering::Acquire) < DM_TASK_QUEUE_SIZE as u32
            });
            q.mutex.acquire_ttas();
            // Another producer may have taken the last slot
            if q.fill.load(Ordering::Acquire) < DM_TASK_QUEUE_SIZE as u32 {
                break;
            }
            q.mutex.release();
        }

        let front = q.front.load(Ordering::Relaxed) as usize;
        let slot = &q.slots[front];
        slot.src.store(src, Ordering::Relaxed);
        slot.dst.store(dst, Ordering::Relaxed);
        slot.size.store(size as u64, Ordering::Relaxed);
        slot.src_stride.store(src_stride, Ordering::Relaxed);
        slot.dst_stride.store(dst_stride, Ordering::Relaxed);
        slot.repetitions.store(repetitions, Ordering::Relaxed);
        q.front
            .store(((front + 1) % DM_TASK_QUEUE_SIZE) as u32, Ordering::Relaxed);
        q.fill.fetch_add(1, Ordering::Release);
        q.mutex.release();

        log::trace!("dm queue post {:#x}->{:#x} {}B x{}", src, dst, size, repetitions);
        self.interrupts.sw_set(self.dm_hart);
    }

    /// Block until every posted copy has completed.
    pub fn wait(&self) {
        let q = &*self.state;
        self.policy
            .spin_until("dm queue drain", || q.fill.load(Ordering::Acquire) == 0);
        self.status_request(StatusRequest::WaitIdle);
    }

    /// Block until the DM core is serving requests.
    pub fn wait_ready(&self) {
        self.status_request(StatusRequest::Ready);
    }

    /// Ask the DM core to leave `serve`. Does not wait.
    pub fn exit(&self) {
        let q = &*self.state;
        q.mutex.acquire_ttas();
        self.policy.spin_until("dm status slot", || {
            q.stat_q.load(Ordering::Acquire) == StatusRequest::None as u32
        });
        q.stat_q.store(StatusRequest::Exit as u32, Ordering::Release);
        q.mutex.release();
        self.interrupts.sw_set(self.dm_hart);
    }

    fn status_request(&self, request: StatusRequest) {
        let q = &*self.state;
        // One status request in flight at a time
        q.mutex.acquire_ttas();
        self.policy.spin_until("dm status slot", || {
            q.stat_q.load(Ordering::Acquire) == StatusRequest::None as u32
        });
        q.stat_p.store(0, Ordering::Relaxed);
        q.stat_q.store(request as u32, Ordering::Release);
        self.interrupts.sw_set(self.dm_hart);
        self.policy
            .spin_until("dm status reply", || q.stat_p.load(Ordering::Acquire) != 0);
        q.mutex.release();
    }

    /// DM-core service loop. Returns after an exit request.
    pub fn serve(&self, dma: &DmaEngine) {
        let q = &*self.state;
        log::debug!("cluster {} dm queue serving", dma.cluster());
        loop {
            if q.fill.load(Ordering::Acquire) > 0 {
                let back = q.back.load(Ordering::Relaxed) as usize;
                let slot = &q.slots[back];
                let dst = slot.dst.load(Ordering::Relaxed);
                let src = slot.src.load(Ordering::Relaxed);
                // 1-D requests are posted as a single repetition
                dma.start_2d(
                    dst,
                    src,
                    slot.size.load(Ordering::Relaxed) as usize,
                    slot.dst_stride.load(Ordering::Relaxed),
                    slot.src_stride.load(Ordering::Relaxed),
                    slot.repetitions.load(Ordering::Relaxed),
                );
                q.back
                    .store(((back + 1) % DM_TASK_QUEUE_SIZE) as u32, Ordering::Relaxed);
                q.fill.fetch_sub(1, Ordering::AcqRel);
            }

            match StatusRequest::from_raw(q.stat_q.load(Ordering::Acquire)) {
                StatusRequest::WaitIdle => {
                    if dma.is_idle() {
                        self.answer();
                    }
                }
                StatusRequest::Ready => self.answer(),
                StatusRequest::Exit => {
                    q.stat_q.store(StatusRequest::None as u32, Ordering::Release);
                    log::debug!("cluster {} dm queue exit", dma.cluster());
                    return;
                }
                StatusRequest::None => {}
            }

            if q.fill.load(Ordering::Acquire) == 0
                && q.stat_q.load(Ordering::Acquire) == StatusRequest::None as u32
            {
                self.interrupts.sw_poll(self.dm_hart);
            }
        }
    }

    fn answer(&self) {
        let q = &*self.state;
        q.stat_q.store(StatusRequest::None as u32, Ordering::Relaxed);
        q.stat_p.store(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimPlatform;
    use crate::memory::{AddressMap, MemoryRegion, Scratchpad};
    use crate::topology::TopologyConfig;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const TOPO: TopologyConfig = TopologyConfig::new(3, 1, 1, 1);
    const L3: u64 = 0x8000_0000;

    struct Fixture {
        queue: DataMoverQueue,
        dma: Arc<DmaEngine>,
        memory: Arc<AddressMap>,
        l1: Scratchpad,
    }

    fn fixture() -> Fixture {
        let policy = WaitPolicy::bounded(Duration::from_secs(10));
        let platform = Arc::new(SimPlatform::new(TOPO, policy));
        let tcdm = Arc::new(MemoryRegion::new("tcdm", 0x1000_0000, 0x10000));
        let mut map = AddressMap::new();
        map.add(Arc::clone(&tcdm)).unwrap();
        map.add(Arc::new(MemoryRegion::new("l3", L3, 0x10000))).unwrap();
        let memory = Arc::new(map);

        let l1 = Scratchpad::new(tcdm);
        let state = l1.place(DmQueueState::default()).unwrap();
        let dm_hart = TOPO.hartid(TOPO.dm_global_id(0));
        Fixture {
            queue: DataMoverQueue::new(state, Interrupts::new(platform), dm_hart, policy),
            dma: Arc::new(DmaEngine::new(0, Arc::clone(&memory), policy).unwrap()),
            memory,
            l1,
        }
    }

    fn spawn_server(f: &Fixture) -> thread::JoinHandle<()> {
        let queue = f.queue.clone();
        let dma = Arc::clone(&f.dma);
        thread::spawn(move || queue.serve(&dma))
    }

    #[test]
    fn test_requests_from_compute_cores_complete() {
        let f = fixture();
        let server = spawn_server(&f);
        f.queue.wait_ready();

        let src: Vec<u32> = (0..512).collect();
        f.memory.write_slice(L3, &src).unwrap();
        let dst = f.l1.alloc(2048).unwrap();

        // Two producers, more requests than ring slots
        let producers: Vec<_> = (0..2u64)
            .map(|core| {
                let queue = f.queue.clone();
                thread::spawn(move || {
                    for chunk in 0..4u64 {
                        let off = (core * 4 + chunk) * 256;
                        queue.memcpy_async(dst + off, L3 + off, 256);
                    }
                    queue.wait();
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        assert_eq!(f.memory.read_slice::<u32>(dst, 512).unwrap(), src);
        f.queue.exit();
        server.join().unwrap();
    }

    #[test]
    fn test_2d_request() {
        let f = fixture();
        let server = spawn_server(&f);

        let src: Vec<u32> = (0..16).collect();
        f.memory.write_slice(L3, &src).unwrap();
        let dst = f.l1.alloc(16).unwrap();
        // First word of every row of a 4x4 matrix
        f.queue.memcpy2d_async(dst, L3, 4, 4, 16, 4);
        f.queue.wait();

        assert_eq!(f.memory.read_slice::<u32>(dst, 4).unwrap(), vec![0, 4, 8, 12]);
        f.queue.exit();
        server.join().unwrap();
    }

    #[test]
    fn test_zero_repetitions_copy_nothing() {
        let f = fixture();
        let server = spawn_server(&f);

        f.memory.write_slice(L3, &[0xabu8; 16]).unwrap();
        let dst = f.l1.alloc(16).unwrap();
        f.queue.memcpy2d_async(dst, L3, 16, 16, 16, 0);
        f.queue.wait();
        assert_eq!(f.memory.read_slice::<u8>(dst, 16).unwrap(), vec![0; 16]);

        f.queue.memcpy2d_async(dst, L3, 16, 16, 16, 1);
        f.queue.wait();
        assert_eq!(f.memory.read_slice::<u8>(dst, 16).unwrap(), vec![0xab; 16]);
        f.queue.exit();
        server.join().unwrap();
    }

    #[test]
    fn test_exit_before_any_request() {
        let f = fixture();
        let server = spawn_server(&f);
        f.queue.exit();
        server.join().unwrap();
        assert!(f.dma.is_idle());
    }
}
