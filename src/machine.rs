//! Simulated machine: bring-up of shared state and one thread per core.
//!
//! ```text
//!   Machine
//!   ├── platform (SimPlatform)          hw barriers, CLINT, cluster irqs
//!   ├── memory (AddressMap)
//!   │     ├── tcdm0 ── ClusterState 0   sw barrier, event unit, DM queue,
//!   │     ├── tcdm1 ── ClusterState 1   election, DMA engine thread
//!   │     └── global ─ GlobalState      comm buffer (at global_base),
//!   │                                   global barrier, global election
//!   └── run(f) ──► core-0 .. core-N     each with its own CoreContext
//! ```
//!
//! Coordination structs are placed into the memory they would live in on
//! silicon and handed to cores as explicit handles; nothing is reached
//! through globals.
//!
//! # Usage
//!
//! ```ignore
//! let machine = Machine::from_config(Config::get())?;
//! let sums = machine.run(|ctx| {
//!     ctx.cluster_hw_barrier();
//!     ctx.identity().global_id
//! });
//! ```

use std::io;
use std::sync::Arc;
use std::thread;

use thiserror::Error;

use crate::config::{Config, ConfigError, MemoryLayout};
use crate::dma::{DataMoverQueue, DmQueueState, DmaEngine};
use crate::election::ElectionState;
use crate::eu::{EventUnit, EventUnitState};
use crate::hal::{Platform, SimPlatform};
use crate::interrupts::Interrupts;
use crate::memory::{AddressMap, AllocError, MemoryError, MemoryRegion, Placed, Scratchpad};
use crate::offload::{CommBuffer, Host};
use crate::sync::{CountingBarrier, GlobalBarrier, HardwareBarrier, WaitPolicy};
use crate::topology::{CoreIdentity, TopologyConfig};

/// Errors bringing up a machine.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("placing runtime state: {0}")]
    Alloc(#[from] AllocError),

    #[error("failed to start DMA engine of cluster {cluster}: {source}")]
    DmaThread {
        cluster: u32,
        #[source]
        source: io::Error,
    },
}

/// Everything one cluster shares.
pub struct ClusterState {
    id: u32,
    l1: Scratchpad,
    hw_barrier: HardwareBarrier,
    sw_barrier: Placed<CountingBarrier>,
    event_unit: EventUnit,
    dma: DmaEngine,
    dm_queue: DataMoverQueue,
    election: Placed<ElectionState>,
}

impl ClusterState {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Allocator over this cluster's TCDM.
    pub fn l1(&self) -> &Scratchpad {
        &self.l1
    }

    pub fn hw_barrier(&self) -> &HardwareBarrier {
        &self.hw_barrier
    }

    pub fn sw_barrier(&self) -> &Placed<CountingBarrier> {
        &self.sw_barrier
    }

    pub fn event_unit(&self) -> &EventUnit {
        &self.event_unit
    }

    pub fn dma(&self) -> &DmaEngine {
        &self.dma
    }

    pub fn dm_queue(&self) -> &DataMoverQueue {
        &self.dm_queue
    }

    pub fn election(&self) -> &ElectionState {
        &self.election
    }
}

/// State shared by all clusters, placed in global memory.
pub struct GlobalState {
    l3: Scratchpad,
    comm: Placed<CommBuffer>,
    barrier: Placed<CountingBarrier>,
    election: Placed<ElectionState>,
}

impl GlobalState {
    /// Allocator over global memory.
    pub fn l3(&self) -> &Scratchpad {
        &self.l3
    }

    pub fn comm(&self) -> &Placed<CommBuffer> {
        &self.comm
    }

    pub fn barrier(&self) -> &Placed<CountingBarrier> {
        &self.barrier
    }

    pub fn election(&self) -> &ElectionState {
        &self.election
    }
}

pub struct Machine {
    topology: TopologyConfig,
    layout: MemoryLayout,
    policy: WaitPolicy,
    platform: Arc<dyn Platform>,
    interrupts: Interrupts,
    memory: Arc<AddressMap>,
    clusters: Vec<Arc<ClusterState>>,
    global: Arc<GlobalState>,
}

impl Machine {
    /// Build a machine from the validated configuration.
    pub fn from_config(config: &Config) -> Result<Self, MachineError> {
        let topology = config.topology()?;
        Self::new(topology, config.layout(), config.wait_policy())
    }

    pub fn new(
        topology: TopologyConfig,
        layout: MemoryLayout,
        policy: WaitPolicy,
    ) -> Result<Self, MachineError> {
        let platform: Arc<dyn Platform> = Arc::new(SimPlatform::new(topology, policy));
        let interrupts = Interrupts::new(Arc::clone(&platform));

        let mut map = AddressMap::new();
        let mut tcdms = Vec::with_capacity(topology.cluster_count() as usize);
        for cluster in 0..topology.cluster_count() {
            let region = Arc::new(MemoryRegion::new(
                format!("tcdm{}", cluster),
                layout.tcdm_base_of(cluster),
                layout.tcdm_size as usize,
            ));
            map.add(Arc::clone(&region))?;
            tcdms.push(region);
        }
        let global_region = Arc::new(MemoryRegion::new(
            "global",
            layout.global_base,
            layout.global_size as usize,
        ));
        map.add(Arc::clone(&global_region))?;
        let memory = Arc::new(map);

        // The comm buffer goes first so the host finds it at global_base.
        let l3 = Scratchpad::new(global_region);
        let comm = l3.place(CommBuffer::new())?;
        let global = Arc::new(GlobalState {
            comm,
            barrier: l3.place(CountingBarrier::new())?,
            election: l3.place(ElectionState::new())?,
            l3,
        });

        let compute_cores = topology.compute_cores_per_cluster();
        let mut clusters = Vec::with_capacity(tcdms.len());
        for (cluster, region) in (0u32..).zip(tcdms) {
            let l1 = Scratchpad::new(region);
            let sw_barrier = l1.place(CountingBarrier::new())?;
            let election = l1.place(ElectionState::new())?;
            let event_unit = EventUnit::init(
                l1.place(EventUnitState::default())?,
                interrupts.clone(),
                cluster,
                compute_cores,
                policy,
            );
            let dm_queue = DataMoverQueue::new(
                l1.place(DmQueueState::default())?,
                interrupts.clone(),
                topology.hartid(topology.dm_global_id(cluster)),
                policy,
            );
            let dma = DmaEngine::new(cluster, Arc::clone(&memory), policy)
                .map_err(|source| MachineError::DmaThread { cluster, source })?;

            log::debug!(
                "cluster {} state placed, {} bytes of TCDM left",
                cluster,
                l1.allocator().available()
            );
            clusters.push(Arc::new(ClusterState {
                id: cluster,
                hw_barrier: HardwareBarrier::new(Arc::clone(&platform), cluster),
                sw_barrier,
                event_unit,
                dma,
                dm_queue,
                election,
                l1,
            }));
        }

        log::info!(
            "machine up: {} clusters x {} cores ({} harts), comm buffer at {:#x}",
            topology.cluster_count(),
            topology.cores_per_cluster,
            topology.core_count(),
            global.comm.addr()
        );
        Ok(Self {
            topology,
            layout,
            policy,
            platform,
            interrupts,
            memory,
            clusters,
            global,
        })
    }

    pub fn topology(&self) -> &TopologyConfig {
        &self.topology
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn policy(&self) -> WaitPolicy {
        self.policy
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn memory(&self) -> &Arc<AddressMap> {
        &self.memory
    }

    pub fn cluster(&self, id: u32) -> &ClusterState {
        &self.clusters[id as usize]
    }

    pub fn global(&self) -> &GlobalState {
        &self.global
    }

    /// Context of core `global_id`.
    pub fn context(&self, global_id: u32) -> CoreContext {
        let identity = self.topology.resolve(global_id);
        CoreContext {
            identity,
            topology: self.topology,
            policy: self.policy,
            interrupts: self.interrupts.clone(),
            memory: Arc::clone(&self.memory),
            cluster: Arc::clone(&self.clusters[identity.cluster_id as usize]),
            global: Arc::clone(&self.global),
        }
    }

    /// Supervisor handle for hart 0.
    pub fn host(&self) -> Host {
        Host::new(
            self.topology,
            self.interrupts.clone(),
            Arc::clone(&self.memory),
            Arc::clone(&self.global),
        )
    }

    /// Run `f` on every core and collect the results by global id.
    ///
    /// A panic on any core is re-raised here once all cores have stopped.
    pub fn run<R, F>(&self, f: F) -> Vec<R>
    where
        F: Fn(&CoreContext) -> R + Sync,
        R: Send,
    {
        thread::scope(|s| {
            let handles: Vec<_> = (0..self.topology.core_count())
                .map(|id| {
                    let ctx = self.context(id);
                    let f = &f;
                    s.spawn(move || f(&ctx))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }

    /// Run `device` on every core while `host` runs on the calling thread.
    pub fn run_with_host<H, R, D, F>(&self, device: D, host: F) -> (H, Vec<R>)
    where
        D: Fn(&CoreContext) -> R + Sync,
        F: FnOnce(&Host) -> H,
        R: Send,
    {
        let supervisor = self.host();
        thread::scope(|s| {
            let handles: Vec<_> = (0..self.topology.core_count())
                .map(|id| {
                    let ctx = self.context(id);
                    let device = &device;
                    s.spawn(move || device(&ctx))
                })
                .collect();
            let host_result = host(&supervisor);
            let device_results = handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect();
            (host_result, device_results)
        })
    }
}

/// One core's view of the machine.
#[derive(Clone)]
pub struct CoreContext {
    identity: CoreIdentity,
    topology: TopologyConfig,
    policy: WaitPolicy,
    interrupts: Interrupts,
    memory: Arc<AddressMap>,
    cluster: Arc<ClusterState>,
    global: Arc<GlobalState>,
}

impl CoreContext {
    pub fn identity(&self) -> &CoreIdentity {
        &self.identity
    }

    pub fn topology(&self) -> &TopologyConfig {
        &self.topology
    }

    pub fn policy(&self) -> WaitPolicy {
        self.policy
    }

    #[inline]
    pub fn is_dm(&self) -> bool {
        self.identity.is_dm()
    }

    #[inline]
    pub fn is_compute(&self) -> bool {
        self.identity.is_compute()
    }

    pub fn memory(&self) -> &AddressMap {
        &self.memory
    }

    pub fn interrupts(&self) -> &Interrupts {
        &self.interrupts
    }

    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }

    pub fn global(&self) -> &GlobalState {
        &self.global
    }

    /// This cluster's TCDM allocator.
    pub fn l1(&self) -> &Scratchpad {
        &self.cluster.l1
    }

    /// Global memory allocator.
    pub fn l3(&self) -> &Scratchpad {
        &self.global.l3
    }

    /// Every core of the cluster must call this.
    pub fn cluster_hw_barrier(&self) {
        self.cluster.hw_barrier.wait();
    }

    /// Counting barrier over every core of the cluster.
    pub fn cluster_sw_barrier(&self) -> bool {
        self.cluster
            .sw_barrier
            .wait(self.topology.cores_per_cluster, &self.policy)
    }

    /// Every core of every cluster must call this.
    pub fn global_barrier(&self) {
        GlobalBarrier::new(
            self.cluster.hw_barrier.clone(),
            self.global.barrier.clone(),
            self.topology.cluster_count(),
            self.policy,
        )
        .wait(&self.identity);
    }

    /// The cluster's DMA engine. DM core only.
    pub fn dma(&self) -> &DmaEngine {
        debug_assert!(
            self.identity.is_dm(),
            "{} is not allowed to program the DMA engine",
            self.identity
        );
        &self.cluster.dma
    }

    pub fn dm_queue(&self) -> &DataMoverQueue {
        &self.cluster.dm_queue
    }

    pub fn event_unit(&self) -> &EventUnit {
        &self.cluster.event_unit
    }

    /// Election among `participants` cores of this cluster.
    pub fn elect(&self, participants: u32) -> bool {
        self.cluster.election.elect(participants)
    }

    /// Election among the DM cores of all clusters.
    pub fn elect_global(&self) -> bool {
        self.global.election.elect(self.topology.cluster_count())
    }
}

/// Small machine with a bounded wait policy for tests.
#[cfg(test)]
pub(crate) fn test_machine(topology: TopologyConfig) -> Machine {
    let layout = MemoryLayout {
        tcdm_base: 0x1000_0000,
        tcdm_size: 0x1_0000,
        tcdm_stride: 0x4_0000,
        global_base: 0x8000_0000,
        global_size: 0x10_0000,
    };
    let policy = WaitPolicy::bounded(std::time::Duration::from_secs(10));
    Machine::new(topology, layout, policy).unwrap()
}
