//! snitch-rt library
//!
//! Bare-metal runtime for many-core Snitch clusters: core topology, the
//! barrier hierarchy, cluster DMA, fork-join dispatch through the event unit,
//! and leader election for handing control back to the host. Everything
//! runs on a simulated machine with one host thread per core.

pub mod config;
pub mod dma;
pub mod election;
pub mod eu;
pub mod hal;
pub mod interrupts;
pub mod machine;
pub mod memory;
pub mod offload;
pub mod sync;
pub mod topology;

pub use config::Config;
pub use machine::{CoreContext, Machine, MachineError};
pub use topology::{CoreIdentity, CoreRole, TopologyConfig};
