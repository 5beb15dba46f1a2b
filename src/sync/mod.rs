//! Synchronization primitives built on shared memory and the barrier unit.

pub mod barrier;
pub mod mutex;
pub mod wait;

pub use barrier::{Arrival, CountingBarrier, GlobalBarrier, HardwareBarrier};
pub use mutex::{HwMutex, HwMutexGuard};
pub use wait::WaitPolicy;
