//! Cluster DMA: engine, descriptors, the DM request queue and double
//! buffering.
//!
//! Only a cluster's DM core drives its engine. Compute cores reach it through
//! the [`DataMoverQueue`].

pub mod descriptor;
pub mod engine;
pub mod pingpong;
pub mod queue;

pub use descriptor::{DmaDescriptor, TransferId, TransferState};
pub use engine::{DmaEngine, DmaStats};
pub use pingpong::PingPong;
pub use queue::{DataMoverQueue, DmQueueState, StatusRequest, DM_TASK_QUEUE_SIZE};
