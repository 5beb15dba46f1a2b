//! Hardware-access layer.
//!
//! Everything the runtime touches that is not plain shared memory goes
//! through [`Platform`]: the per-cluster barrier trigger, the CLINT
//! software-interrupt words and their mutex, the cluster-local interrupt
//! registers, and wait-for-interrupt.
//!
//! ```text
//!                 +-------------------------------+
//!   hart 0 (host) |  CLINT                        |
//!   ------------> |  msip[0] msip[1] ...  mutex   |
//!                 +-------------------------------+
//!                 +---------------+ +---------------+
//!   cluster 0     | barrier  irq  | | barrier  irq  |  cluster 1
//!                 +---------------+ +---------------+
//! ```
//!
//! [`SimPlatform`] backs these with host atomics so the whole runtime can
//! run on ordinary threads.

mod sim;

pub use sim::SimPlatform;

use std::sync::atomic::AtomicU32;

use crate::sync::{HwMutex, WaitPolicy};
use crate::topology::TopologyConfig;

/// Which pending interrupts end a wait-for-interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    /// CLINT software interrupt only.
    Software,
    /// Cluster-local interrupt only.
    Cluster,
    /// Either.
    Any,
}

impl WakeSource {
    pub fn software(self) -> bool {
        matches!(self, WakeSource::Software | WakeSource::Any)
    }

    pub fn cluster(self) -> bool {
        matches!(self, WakeSource::Cluster | WakeSource::Any)
    }
}

/// Machine registers shared by all cores.
pub trait Platform: Send + Sync {
    fn topology(&self) -> &TopologyConfig;

    /// Stall bound applied to every blocking wait.
    fn wait_policy(&self) -> WaitPolicy;

    /// Trigger the cluster's hardware barrier. Returns once every core of
    /// the cluster has triggered it in the current round.
    fn hw_barrier(&self, cluster: u32);

    /// Mutex serializing read-modify-write of the msip words.
    fn clint_mutex(&self) -> &HwMutex;

    /// Software-interrupt pending word `word`; hart `h` is bit `h % 32` of
    /// word `h / 32`.
    fn msip(&self, word: usize) -> &AtomicU32;

    /// Number of msip words.
    fn msip_words(&self) -> usize;

    fn cluster_irq_set(&self, cluster: u32, mask: u32);

    fn cluster_irq_clear(&self, cluster: u32, mask: u32);

    fn cluster_irq_pending(&self, cluster: u32) -> u32;

    /// Sleep `hart` until an interrupt from `source` is pending for it.
    /// Returns immediately if one already is. Does not clear anything.
    fn wfi(&self, hart: u32, source: WakeSource);
}
