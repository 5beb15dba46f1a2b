//! DMA transfer descriptors.
//!
//! A descriptor moves `repetitions` rows of `size` bytes. Row `r` reads from
//! `src + r * src_stride` and writes to `dst + r * dst_stride`; a 1-D
//! transfer is a single row.
//!
//! ```text
//! ┌────────┐  start  ┌────────┐  engine picks  ┌──────────┐  last byte  ┌──────┐
//! │ (none) ├────────►│ Queued ├───────────────►│ InFlight ├────────────►│ Done │
//! └────────┘         └────────┘                └──────────┘             └──────┘
//! ```

use std::fmt;

use crate::memory::MemoryError;

/// Transfer identifier. Issued in increasing order per engine; 0 is never
/// issued.
pub type TransferId = u32;

/// Lifecycle of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Accepted, waiting for the engine.
    Queued,
    /// Being copied.
    InFlight,
    /// Every byte has reached its destination.
    Done,
}

/// One 1-D or 2-D transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
    pub transfer_id: TransferId,
    pub src: u64,
    pub dst: u64,
    /// Bytes per row.
    pub size: usize,
    pub src_stride: u64,
    pub dst_stride: u64,
    /// Number of rows; 1 for 1-D.
    pub repetitions: u32,
    pub state: TransferState,
}

impl DmaDescriptor {
    pub fn new_1d(transfer_id: TransferId, dst: u64, src: u64, size: usize) -> Self {
        Self::new_2d(transfer_id, dst, src, size, 0, 0, 1)
    }

    pub fn new_2d(
        transfer_id: TransferId,
        dst: u64,
        src: u64,
        size: usize,
        dst_stride: u64,
        src_stride: u64,
        repetitions: u32,
    ) -> Self {
        Self {
            transfer_id,
            src,
            dst,
            size,
            src_stride,
            dst_stride,
            repetitions,
            state: TransferState::Queued,
        }
    }

    pub fn is_2d(&self) -> bool {
        self.repetitions > 1
    }

    /// Bytes moved by the whole transfer.
    pub fn total_bytes(&self) -> u64 {
        self.size as u64 * self.repetitions as u64
    }

    /// `(dst, src)` start address of every row.
    pub fn rows(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        (0..self.repetitions as u64).map(move |r| {
            (self.dst + r * self.dst_stride, self.src + r * self.src_stride)
        })
    }

    /// Check every row against `mapped`, the predicate telling whether a
    /// range is backed by memory.
    pub fn validate(&self, mapped: impl Fn(u64, usize) -> bool) -> Result<(), MemoryError> {
        if self.size == 0 {
            return Ok(());
        }
        for (dst, src) in self.rows() {
            if !mapped(src, self.size) {
                return Err(MemoryError::Unmapped { addr: src, len: self.size });
            }
            if !mapped(dst, self.size) {
                return Err(MemoryError::Unmapped { addr: dst, len: self.size });
            }
        }
        Ok(())
    }
}

impl fmt::Display for DmaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_2d() {
            write!(
                f,
                "#{} {:#x}->{:#x} {}B x{} (src+{} dst+{})",
                self.transfer_id,
                self.src,
                self.dst,
                self.size,
                self.repetitions,
                self.src_stride,
                self.dst_stride
            )
        } else {
            write!(f, "#{} {:#x}->{:#x} {}B", self.transfer_id, self.src, self.dst, self.size)
        }
    }
}
