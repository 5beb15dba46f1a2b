//! Physical memory windows shared by all cores.
//!
//! A [`MemoryRegion`] is a fixed byte window at a physical base address:
//! one per cluster TCDM plus one for global memory. Cores and DMA engines
//! access it concurrently, just as they would the real SRAM. Nothing here
//! orders those accesses: overlapping bytes must be separated by a barrier,
//! a DMA wait, or an atomic placed in the region.
//!
//! # Usage
//!
//! ```
//! use snitch_rt::memory::{AddressMap, MemoryRegion};
//! use std::sync::Arc;
//!
//! let mut map = AddressMap::new();
//! map.add(Arc::new(MemoryRegion::new("l3", 0x8000_0000, 4096))).unwrap();
//!
//! map.write_u32(0x8000_0010, 0xdead_beef).unwrap();
//! assert_eq!(map.read_u32(0x8000_0010).unwrap(), 0xdead_beef);
//! assert!(map.read_u32(0x9000_0000).is_err());
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes};

/// Address-map failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("range {addr:#x}+{len:#x} is not backed by a single memory region")]
    Unmapped { addr: u64, len: usize },

    #[error("region {name} at {base:#x} overlaps an existing region")]
    Overlap { name: String, base: u64 },
}

/// A byte window at a fixed physical base.
pub struct MemoryRegion {
    name: String,
    base: u64,
    size: usize,
    /// 8-byte granules starting at `base` rounded down to a granule, so a
    /// host address is congruent to its physical address modulo 8.
    words: Box<[UnsafeCell<u64>]>,
}

// Raw SRAM semantics: callers order overlapping accesses themselves.
unsafe impl Sync for MemoryRegion {}
unsafe impl Send for MemoryRegion {}

impl MemoryRegion {
    /// Create a zero-filled region.
    pub fn new(name: impl Into<String>, base: u64, size: usize) -> Self {
        let lead = (base % 8) as usize;
        let words = (0..(lead + size).div_ceil(8))
            .map(|_| UnsafeCell::new(0))
            .collect();
        Self {
            name: name.into(),
            base,
            size,
            words,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last address.
    pub fn end(&self) -> u64 {
        self.base + self.size as u64
    }

    /// Whether `[addr, addr + len)` lies inside this region.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.end())
    }

    fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// Host pointer for an address inside the region.
    ///
    /// The caller guarantees `contains(addr, len)` for whatever it touches.
    pub(crate) fn ptr_at(&self, addr: u64) -> *mut u8 {
        debug_assert!(self.contains(addr, 0), "{:#x} outside {}", addr, self.name);
        let offset = (addr - self.base) as usize + (self.base % 8) as usize;
        // SAFETY: offset is within the allocation of `words`.
        unsafe { UnsafeCell::raw_get(self.words.as_ptr()).cast::<u8>().add(offset) }
    }

    fn check(&self, addr: u64, len: usize) -> Result<*mut u8, MemoryError> {
        if self.contains(addr, len) {
            Ok(self.ptr_at(addr))
        } else {
            Err(MemoryError::Unmapped { addr, len })
        }
    }

    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let src = self.check(addr, buf.len())?;
        // SAFETY: range checked; `buf` is a distinct host allocation.
        unsafe { ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let dst = self.check(addr, data.len())?;
        // SAFETY: range checked; `data` is a distinct host allocation.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    pub fn fill(&self, addr: u64, len: usize, byte: u8) -> Result<(), MemoryError> {
        let dst = self.check(addr, len)?;
        // SAFETY: range checked.
        unsafe { ptr::write_bytes(dst, byte, len) };
        Ok(())
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryRegion({} [{:#x}, {:#x}))", self.name, self.base, self.end())
    }
}

/// Physical address space: a set of non-overlapping regions.
#[derive(Debug, Default)]
pub struct AddressMap {
    regions: Vec<Arc<MemoryRegion>>,
}

impl AddressMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a region. Fails if it overlaps one already mapped.
    pub fn add(&mut self, region: Arc<MemoryRegion>) -> Result<(), MemoryError> {
        if self.regions.iter().any(|r| r.overlaps(&region)) {
            return Err(MemoryError::Overlap {
                name: region.name.clone(),
                base: region.base,
            });
        }
        log::debug!("mapped {:?}", region);
        self.regions.push(region);
        Ok(())
    }

    pub fn regions(&self) -> &[Arc<MemoryRegion>] {
        &self.regions
    }

    /// Region backing the whole range `[addr, addr + len)`.
    pub fn resolve(&self, addr: u64, len: usize) -> Result<&Arc<MemoryRegion>, MemoryError> {
        self.regions
            .iter()
            .find(|r| r.contains(addr, len))
            .ok_or(MemoryError::Unmapped { addr, len })
    }

    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.resolve(addr, buf.len())?.read_bytes(addr, buf)
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.resolve(addr, data.len())?.write_bytes(addr, data)
    }

    /// Copy `len` bytes between two mapped ranges. Overlap is allowed.
    pub fn copy(&self, dst: u64, src: u64, len: usize) -> Result<(), MemoryError> {
        if len == 0 {
            return Ok(());
        }
        let from = self.resolve(src, len)?.ptr_at(src);
        let to = self.resolve(dst, len)?.ptr_at(dst);
        // SAFETY: both ranges checked; `ptr::copy` tolerates overlap.
        unsafe { ptr::copy(from, to, len) };
        Ok(())
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write_bytes(addr, &buf)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.write_bytes(addr, &buf)
    }

    pub fn read_f64(&self, addr: u64) -> Result<f64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(LittleEndian::read_f64(&buf))
    }

    pub fn write_f64(&self, addr: u64, value: f64) -> Result<(), MemoryError> {
        let mut buf = [0u8; 8];
        LittleEndian::write_f64(&mut buf, value);
        self.write_bytes(addr, &buf)
    }

    /// Read a plain-data value.
    pub fn read_obj<T: FromBytes>(&self, addr: u64) -> Result<T, MemoryError> {
        let len = std::mem::size_of::<T>();
        let mut buf = vec![0u8; len];
        self.read_bytes(addr, &mut buf)?;
        T::read_from_bytes(&buf).map_err(|_| MemoryError::Unmapped { addr, len })
    }

    /// Write a plain-data value.
    pub fn write_obj<T: IntoBytes + Immutable>(&self, addr: u64, value: &T) -> Result<(), MemoryError> {
        self.write_bytes(addr, value.as_bytes())
    }

    /// Write a slice of plain-data values (test data, job buffers).
    pub fn write_slice<T: IntoBytes + Immutable>(&self, addr: u64, data: &[T]) -> Result<(), MemoryError> {
        self.write_bytes(addr, data.as_bytes())
    }

    /// Read `count` plain-data values.
    pub fn read_slice<T: FromBytes + IntoBytes>(&self, addr: u64, count: usize) -> Result<Vec<T>, MemoryError> {
        let mut out: Vec<T> = (0..count).map(|_| <T as FromZeros>::new_zeroed()).collect();
        self.read_bytes(addr, out.as_mut_slice().as_mut_bytes())?;
        Ok(out)
    }
}
