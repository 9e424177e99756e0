//! Provide a [`DmaAllocator`] backed by anonymous mmap'ed memory.
//!
//! There is no IOMMU or device here. The allocator hands out page-aligned
//! mappings and assigns each one a synthetic physical address from a
//! monotonically growing I/O virtual address range. [`PhysicalMemory`] gives
//! the device's view: it accesses the same memory by those physical
//! addresses, like a controller would via DMA.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, trace};

use super::{AllocationError, DmaAllocator, DmaBuffer, DmaFlags, DmaMemory};

/// The granularity of allocations and physical addresses.
pub const PAGE_SIZE: u64 = 0x1000;

/// The first physical address handed out by [`HostDmaAllocator::default`].
pub const DEFAULT_IOVA_BASE: u64 = 0x8000_0000;

#[derive(Debug)]
struct Mapping {
    mmap: MmapMut,
    phys_base: u64,
    /// Used to remove the mapping from the allocator once it is released.
    allocator: Weak<Mutex<AllocatorState>>,
}

impl DmaMemory for Mapping {
    fn as_ptr(&self) -> *mut u8 {
        // We only access the mapping via atomics, so handing out a mutable
        // pointer derived from a shared reference is fine.
        self.mmap.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.mmap.len()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Some(state) = self.allocator.upgrade() {
            state
                .lock()
                .unwrap()
                .forget(self.phys_base, self.mmap.len() as u64);
        }
    }
}

#[derive(Debug)]
struct Region {
    phys_base: u64,
    len: u64,
    mapping: Weak<Mapping>,
}

#[derive(Debug)]
struct AllocatorState {
    /// The physical address of the next allocation.
    next_phys: u64,
    /// Bytes that may still be allocated. `None` means unlimited.
    budget: Option<u64>,
    /// All live allocations.
    regions: Vec<Region>,
}

impl AllocatorState {
    fn refund(&mut self, len: u64) {
        if let Some(budget) = self.budget.as_mut() {
            *budget += len;
        }
    }

    fn forget(&mut self, phys_base: u64, len: u64) {
        self.regions.retain(|region| region.phys_base != phys_base);
        self.refund(len);
        trace!("forgot DMA region at phys {:#x} (+{:#x})", phys_base, len);
    }
}

/// A [`DmaAllocator`] for running without real hardware.
///
/// Clones share the same address space and budget.
#[derive(Debug, Clone)]
pub struct HostDmaAllocator {
    state: Arc<Mutex<AllocatorState>>,
}

impl Default for HostDmaAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_IOVA_BASE, None)
    }
}

impl HostDmaAllocator {
    /// Create an allocator.
    ///
    /// # Parameters
    ///
    /// - `iova_base`: the physical address of the first allocation. It is
    ///   rounded up to a page boundary. Allocations that would run past the
    ///   end of the 64-bit address space fail with
    ///   [`AllocationError::AddressSpaceExhausted`].
    /// - `budget`: the maximum number of bytes that may be allocated at the
    ///   same time, or `None` for no limit.
    pub fn new(iova_base: u64, budget: Option<u64>) -> Self {
        Self {
            state: Arc::new(Mutex::new(AllocatorState {
                next_phys: iova_base
                    .checked_next_multiple_of(PAGE_SIZE)
                    .unwrap_or(u64::MAX & !(PAGE_SIZE - 1)),
                budget,
                regions: Vec::new(),
            })),
        }
    }

    /// The device's view of all memory handed out by this allocator.
    pub fn physical_memory(&self) -> PhysicalMemory {
        PhysicalMemory {
            state: self.state.clone(),
        }
    }
}

impl DmaAllocator for HostDmaAllocator {
    fn allocate(&self, size: usize, flags: DmaFlags) -> Result<DmaBuffer, AllocationError> {
        if size == 0 {
            return Err(AllocationError::Empty);
        }

        if !flags.contiguous {
            // Every mapping is contiguous. Scatter-gather is never needed for
            // rings, so we don't pretend to support it.
            return Err(AllocationError::Unsupported(flags));
        }

        let len = (size as u64)
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(AllocationError::AddressSpaceExhausted {
                requested: size as u64,
            })?;

        // Reserve the physical range first. Nothing below may drop a Mapping
        // while the state is locked, its Drop impl takes the same lock.
        let phys_base = {
            let mut state = self.state.lock().unwrap();

            if let Some(available) = state.budget {
                if len > available {
                    return Err(AllocationError::Exhausted {
                        requested: len,
                        available,
                    });
                }
            }

            let phys_base = state.next_phys;
            state.next_phys = phys_base
                .checked_add(len)
                .ok_or(AllocationError::AddressSpaceExhausted { requested: len })?;
            if let Some(budget) = state.budget.as_mut() {
                *budget -= len;
            }

            phys_base
        };

        // The mapping stays writable even for read-only buffers, because the
        // device side writes through it. Anonymous mappings are zeroed.
        let mmap = match MmapOptions::new().len(len as usize).map_anon() {
            Ok(mmap) => mmap,
            Err(err) => {
                self.state.lock().unwrap().refund(len);
                return Err(err.into());
            }
        };

        let mapping = Arc::new(Mapping {
            mmap,
            phys_base,
            allocator: Arc::downgrade(&self.state),
        });

        self.state.lock().unwrap().regions.push(Region {
            phys_base,
            len,
            mapping: Arc::downgrade(&mapping),
        });

        debug!(
            "allocated {:#x} bytes of DMA memory at phys {:#x} ({:?})",
            len, phys_base, flags
        );

        Ok(DmaBuffer::new(mapping, phys_base, flags))
    }
}

/// Access to DMA memory by physical address.
///
/// This is how the device side sees memory. All accesses are atomic and
/// ordered: loads acquire and stores release, so a store to a TRB's control
/// field publishes the preceding stores to its other fields.
#[derive(Debug, Clone)]
pub struct PhysicalMemory {
    state: Arc<Mutex<AllocatorState>>,
}

impl PhysicalMemory {
    /// Find the mapping that covers `phys..phys + size`.
    ///
    /// Returns the mapping and the pointer to `phys` inside of it.
    fn locate(&self, phys: u64, size: u64) -> (Arc<Mapping>, *mut u8) {
        assert_eq!(phys % size, 0, "unaligned DMA access at {phys:#x}");

        let mapping = {
            let state = self.state.lock().unwrap();

            state
                .regions
                .iter()
                .find(|region| {
                    phys >= region.phys_base && phys + size <= region.phys_base + region.len
                })
                .and_then(|region| region.mapping.upgrade())
        };

        let Some(mapping) = mapping else {
            panic!("DMA access to unmapped physical address {phys:#x}");
        };

        // SAFETY: The lookup above made sure the access is inside the
        // mapping.
        let ptr = unsafe { mapping.as_ptr().add((phys - mapping.phys_base) as usize) };

        (mapping, ptr)
    }

    /// Read a little-endian 32-bit value.
    pub fn read_u32(&self, phys: u64) -> u32 {
        let (_mapping, ptr) = self.locate(phys, 4);

        // SAFETY:
        //
        // All accesses to the mapping happen via atomics. `locate` checked
        // bounds and alignment, and `_mapping` keeps the memory alive.
        let atomic = unsafe { &*(ptr as *const AtomicU32) };

        u32::from_le(atomic.load(Ordering::Acquire))
    }

    /// Read a little-endian 64-bit value.
    pub fn read_u64(&self, phys: u64) -> u64 {
        let (_mapping, ptr) = self.locate(phys, 8);

        // SAFETY: See read_u32.
        let atomic = unsafe { &*(ptr as *const AtomicU64) };

        u64::from_le(atomic.load(Ordering::Acquire))
    }

    /// Write a little-endian 32-bit value.
    pub fn write_u32(&self, phys: u64, value: u32) {
        let (_mapping, ptr) = self.locate(phys, 4);

        // SAFETY: See read_u32.
        let atomic = unsafe { &*(ptr as *const AtomicU32) };

        atomic.store(value.to_le(), Ordering::Release);
    }

    /// Write a little-endian 64-bit value.
    pub fn write_u64(&self, phys: u64, value: u64) {
        let (_mapping, ptr) = self.locate(phys, 8);

        // SAFETY: See read_u32.
        let atomic = unsafe { &*(ptr as *const AtomicU64) };

        atomic.store(value.to_le(), Ordering::Release);
    }
}
