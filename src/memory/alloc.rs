//! Bump allocation inside a memory region.
//!
//! There is no free: kernels and the runtime carve buffers out of TCDM (L1)
//! or global memory (L3) by bumping a pointer, and a job resets it when it
//! is done. Coordination structs shared between cores are placed the same
//! way with [`Scratchpad::place`], which hands back a [`Placed`] handle
//! every core can dereference.

use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use super::region::MemoryRegion;

/// Allocation granule. Every allocation size is rounded up to this.
pub const MIN_CHUNK_SIZE: u64 = 8;

/// Round `value` up to a multiple of `align` (a power of two).
///
/// Panics if the result does not fit in a `u64`; see [`checked_align_up`].
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// [`align_up`], or `None` on overflow.
#[inline]
pub const fn checked_align_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("out of scratch memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("alignment of {align} bytes exceeds the 8-byte granule")]
    Misaligned { align: usize },
}

/// Lock-free bump pointer over `[base, end)`.
#[derive(Debug)]
pub struct BumpAllocator {
    base: u64,
    end: u64,
    next: AtomicU64,
}

impl BumpAllocator {
    pub fn new(base: u64, size: u64) -> Self {
        let end = base.saturating_add(size);
        let aligned = checked_align_up(base, MIN_CHUNK_SIZE).unwrap_or(end).min(end);
        Self {
            base: aligned,
            end,
            next: AtomicU64::new(aligned),
        }
    }

    /// Reserve `size` bytes and return their address.
    pub fn alloc(&self, size: u64) -> Result<u64, AllocError> {
        let mut current = self.next.load(Ordering::Relaxed);
        let Some(size) = checked_align_up(size, MIN_CHUNK_SIZE) else {
            return Err(AllocError::OutOfMemory {
                requested: size,
                available: self.end.saturating_sub(current),
            });
        };
        loop {
            let available = self.end.saturating_sub(current);
            if size > available {
                log::warn!(
                    "scratch allocation of {} bytes failed at {:#x}: {} available",
                    size,
                    current,
                    available
                );
                return Err(AllocError::OutOfMemory {
                    requested: size,
                    available,
                });
            }
            match self.next.compare_exchange_weak(
                current,
                current + size,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Address the next allocation would return.
    pub fn next(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    /// Move the bump pointer, e.g. after carving buffers by hand or to
    /// release everything allocated since `addr` was read from [`next`](Self::next).
    pub fn update_next(&self, addr: u64) {
        debug_assert!(
            addr >= self.base && addr <= self.end,
            "bump pointer {:#x} outside [{:#x}, {:#x}]",
            addr,
            self.base,
            self.end
        );
        self.next
            .store(align_up(addr, MIN_CHUNK_SIZE).min(self.end), Ordering::Release);
    }

    /// Release everything.
    pub fn reset(&self) {
        self.next.store(self.base, Ordering::Release);
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn capacity(&self) -> u64 {
        self.end.saturating_sub(self.base)
    }

    pub fn available(&self) -> u64 {
        self.end.saturating_sub(self.next())
    }
}

/// A memory region together with the allocator that carves it up.
#[derive(Debug)]
pub struct Scratchpad {
    region: Arc<MemoryRegion>,
    alloc: BumpAllocator,
}

impl Scratchpad {
    /// Allocate over the whole of `region`.
    pub fn new(region: Arc<MemoryRegion>) -> Self {
        let alloc = BumpAllocator::new(region.base(), region.size() as u64);
        Self { region, alloc }
    }

    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    pub fn allocator(&self) -> &BumpAllocator {
        &self.alloc
    }

    pub fn alloc(&self, size: u64) -> Result<u64, AllocError> {
        self.alloc.alloc(size)
    }

    pub fn next(&self) -> u64 {
        self.alloc.next()
    }

    pub fn update_next(&self, addr: u64) {
        self.alloc.update_next(addr)
    }

    pub fn reset(&self) {
        self.alloc.reset()
    }

    /// Allocate room for `value` and move it into the region.
    ///
    /// `T` is shared between cores through `&T` only, so it must be `Sync`;
    /// the region never runs destructors, so `T` must not need one.
    pub fn place<T: Sync>(&self, value: T) -> Result<Placed<T>, AllocError> {
        debug_assert!(!mem::needs_drop::<T>(), "placed values are never dropped");
        if mem::align_of::<T>() > MIN_CHUNK_SIZE as usize {
            return Err(AllocError::Misaligned {
                align: mem::align_of::<T>(),
            });
        }

        let size = mem::size_of::<T>().max(1) as u64;
        let addr = self.alloc.alloc(size)?;
        let ptr = self.region.ptr_at(addr).cast::<T>();
        // SAFETY: freshly allocated and in bounds. Allocations start on
        // 8-byte physical granules and region storage keeps host addresses
        // congruent to physical ones modulo 8, so `ptr` is aligned for `T`.
        unsafe { ptr.write(value) };

        Ok(Placed {
            region: Arc::clone(&self.region),
            addr,
            _marker: PhantomData,
        })
    }
}

/// Shared handle to a value living in a [`MemoryRegion`].
///
/// Cloning the handle aliases the same value.
pub struct Placed<T> {
    region: Arc<MemoryRegion>,
    addr: u64,
    _marker: PhantomData<T>,
}

impl<T> Placed<T> {
    /// Physical address of the value.
    pub fn addr(&self) -> u64 {
        self.addr
    }
}

impl<T> Clone for Placed<T> {
    fn clone(&self) -> Self {
        Self {
            region: Arc::clone(&self.region),
            addr: self.addr,
            _marker: PhantomData,
        }
    }
}

impl<T: Sync> Deref for Placed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: initialized by `place`; the region outlives the handle.
        unsafe { &*self.region.ptr_at(self.addr).cast::<T>() }
    }
}

impl<T: Sync + std::fmt::Debug> std::fmt::Debug for Placed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Placed@{:#x}({:?})", self.addr, &**self)
    }
}
