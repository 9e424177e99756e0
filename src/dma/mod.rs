//! # DMA Allocator Boundary
//!
//! Rings live in memory that both software and the controller access. This
//! module describes how that memory is requested ([`DmaAllocator`]), what a
//! caller gets back ([`DmaBuffer`]) and how addresses inside it translate
//! between the CPU's and the controller's view ([`DmaWindow`]).

use std::{fmt::Debug, sync::Arc};

use thiserror::Error;
use tracing::debug;

mod host;
mod window;

pub use host::{HostDmaAllocator, PhysicalMemory};
pub use window::DmaWindow;

/// The access rights software needs for a DMA buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRights {
    /// Software only reads, the device writes. Used for the Event Ring.
    ReadOnly,
    /// Software and the device both read and write.
    ReadWrite,
}

/// Properties requested for a DMA allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaFlags {
    /// Which direction software accesses the memory in.
    pub access: AccessRights,
    /// The buffer has to be physically contiguous.
    pub contiguous: bool,
    /// CPU caches must not hold stale copies of the buffer.
    pub cache_inhibited: bool,
}

impl DmaFlags {
    /// Flags for a ring that software produces into.
    pub const RING_READ_WRITE: Self = Self {
        access: AccessRights::ReadWrite,
        contiguous: true,
        cache_inhibited: true,
    };

    /// Flags for a ring that only the device produces into.
    pub const RING_READ_ONLY: Self = Self {
        access: AccessRights::ReadOnly,
        contiguous: true,
        cache_inhibited: true,
    };
}

/// The allocator could not satisfy a request.
#[derive(Error, Debug)]
pub enum AllocationError {
    /// Zero-sized DMA buffers cannot be mapped.
    #[error("Cannot allocate an empty DMA buffer")]
    Empty,
    /// The allocator ran out of memory it is allowed to hand out.
    #[error("DMA allocation of {requested:#x} bytes exceeds the remaining budget of {available:#x} bytes")]
    Exhausted {
        /// Size of the failed request after rounding to pages.
        requested: u64,
        /// Bytes still available.
        available: u64,
    },
    /// The request does not fit into the remaining physical address space.
    #[error("DMA allocation of {requested:#x} bytes runs past the end of the physical address space")]
    AddressSpaceExhausted {
        /// Size of the failed request.
        requested: u64,
    },
    /// The allocator cannot provide memory with these properties.
    #[error("Unsupported DMA flags: {0:?}")]
    Unsupported(DmaFlags),
    /// The backing memory could not be mapped.
    #[error("Failed to map DMA memory: {0}")]
    Map(#[from] std::io::Error),
}

/// Memory that backs a [`DmaBuffer`].
///
/// Implementations must keep the memory mapped at a fixed virtual address for
/// as long as the object lives. The memory is released when it is dropped.
pub trait DmaMemory: Debug + Send + Sync {
    /// The virtual address of the first byte.
    fn as_ptr(&self) -> *mut u8;

    /// The size of the mapping in bytes.
    fn len(&self) -> usize;

    /// Returns true if the mapping is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A source of DMA memory.
pub trait DmaAllocator: Debug {
    /// Allocate at least `size` bytes of zeroed memory with the given
    /// properties.
    fn allocate(&self, size: usize, flags: DmaFlags) -> Result<DmaBuffer, AllocationError>;
}

/// A single contiguous DMA allocation.
///
/// The buffer never moves or changes its size, so its [`DmaWindow`] stays
/// valid for the whole lifetime. Dropping the buffer releases the memory.
#[derive(Debug)]
pub struct DmaBuffer {
    memory: Arc<dyn DmaMemory>,
    window: DmaWindow,
    flags: DmaFlags,
}

impl DmaBuffer {
    /// Wrap memory that the device sees at `phys_base`.
    pub fn new(memory: Arc<dyn DmaMemory>, phys_base: u64, flags: DmaFlags) -> Self {
        let window = DmaWindow::new(memory.as_ptr() as usize, phys_base, memory.len());

        Self {
            memory,
            window,
            flags,
        }
    }

    /// The address translation for this buffer.
    pub const fn window(&self) -> &DmaWindow {
        &self.window
    }

    /// The address the device uses for the first byte.
    pub const fn phys_base(&self) -> u64 {
        self.window.phys_base()
    }

    /// The size of the buffer in bytes.
    pub const fn len(&self) -> usize {
        self.window.len()
    }

    /// Returns true if the buffer has no bytes.
    pub const fn is_empty(&self) -> bool {
        self.window.len() == 0
    }

    /// The flags the buffer was allocated with.
    pub const fn flags(&self) -> DmaFlags {
        self.flags
    }

    /// Give the buffer back to the allocator.
    pub fn release(self) {
        drop(self);
    }

    /// View the start of the buffer as `len` elements of `T`.
    ///
    /// # Safety
    ///
    /// `T` must consist only of atomics (or be otherwise valid for any bit
    /// pattern and safe to share with a concurrently writing device).
    pub(crate) unsafe fn as_slice<T>(&self, len: usize) -> &[T] {
        let ptr = self.memory.as_ptr();

        assert!(!ptr.is_null(), "DMA memory is not mapped");
        assert!(
            len.checked_mul(size_of::<T>())
                .is_some_and(|bytes| bytes <= self.memory.len()),
            "{len} elements do not fit into a DMA buffer of {:#x} bytes",
            self.memory.len()
        );
        assert_eq!(
            ptr as usize % align_of::<T>(),
            0,
            "DMA buffer is not sufficiently aligned"
        );

        // SAFETY: The pointer is non-null, aligned and the checks above make
        // sure the slice stays inside the mapping, which lives as long as
        // `self`. The caller guarantees that T tolerates concurrent access.
        unsafe { std::slice::from_raw_parts(ptr as *const T, len) }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        debug!(
            "releasing DMA buffer at phys {:#x} ({:#x} bytes, {:?})",
            self.window.phys_base(),
            self.window.len(),
            self.flags.access
        );
    }
}
