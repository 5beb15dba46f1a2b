//! Scratch memory: TCDM (L1) per cluster and global memory (L3).

pub mod alloc;
pub mod region;

pub use alloc::{align_up, AllocError, BumpAllocator, Placed, Scratchpad, MIN_CHUNK_SIZE};
pub use region::{AddressMap, MemoryError, MemoryRegion};
