//! The Event Ring: the controller produces events, software consumes them.
//!
//! The specification is available
//! [here](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf),
//! see Section 4.9.4 for the ring protocol and Section 6.5 for the segment
//! table.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::{debug, trace};

use super::{
    constants::{
        event_ring::{SEGMENT_TABLE_ALIGNMENT, SEGMENT_TABLE_ENTRY_SIZE},
        TRB_SIZE,
    },
    trb::{CycleState, Trb, TrbData},
};
use crate::dma::{AllocationError, DmaAllocator, DmaBuffer, DmaFlags};

/// An Event Ring Segment Table Entry.
///
/// This is the registration record that tells the controller where an Event
/// Ring segment lives and how many TRBs it holds. It has the hardware layout,
/// so it can be placed in DMA memory directly (see [`SegmentTable`]).
#[repr(C)]
#[derive(Debug, Default)]
pub struct SegmentTableEntry {
    ring_segment_base: AtomicU64,
    ring_segment_size: AtomicU32,
    reserved: AtomicU32,
}

const _: () = assert!(size_of::<SegmentTableEntry>() == SEGMENT_TABLE_ENTRY_SIZE);

impl SegmentTableEntry {
    /// Create an empty entry.
    pub const fn new() -> Self {
        Self {
            ring_segment_base: AtomicU64::new(0),
            ring_segment_size: AtomicU32::new(0),
            reserved: AtomicU32::new(0),
        }
    }

    /// Point the entry at a segment of `size` TRBs at physical address
    /// `base`.
    pub fn set(&self, base: u64, size: u32) {
        self.ring_segment_base.store(base.to_le(), Ordering::Release);
        self.ring_segment_size.store(size.to_le(), Ordering::Release);
        self.reserved.store(0, Ordering::Release);
    }

    /// The physical base address of the segment.
    pub fn base(&self) -> u64 {
        u64::from_le(self.ring_segment_base.load(Ordering::Acquire))
    }

    /// The number of TRBs in the segment.
    pub fn size(&self) -> u32 {
        u32::from_le(self.ring_segment_size.load(Ordering::Acquire))
    }
}

/// An Event Ring Segment Table in DMA memory.
///
/// Its physical base and length are what the driver programs into the ERSTBA
/// and ERSTSZ registers.
#[derive(Debug)]
pub struct SegmentTable {
    buffer: DmaBuffer,
    len: usize,
}

impl SegmentTable {
    /// Allocate a table with `len` zeroed entries.
    pub fn new(allocator: &dyn DmaAllocator, len: usize) -> Result<Self, AllocationError> {
        assert!(len >= 1, "a segment table needs at least one entry");

        let buffer = allocator.allocate(len * SEGMENT_TABLE_ENTRY_SIZE, DmaFlags::RING_READ_WRITE)?;

        assert_eq!(
            buffer.phys_base() % SEGMENT_TABLE_ALIGNMENT,
            0,
            "unaligned event ring segment table"
        );

        Ok(Self { buffer, len })
    }

    /// Access an entry.
    pub fn entry(&self, index: usize) -> &SegmentTableEntry {
        // SAFETY: SegmentTableEntry consists only of atomics.
        let entries: &[SegmentTableEntry] = unsafe { self.buffer.as_slice(self.len) };

        &entries[index]
    }

    /// The value for the ERSTBA register.
    pub const fn phys_base(&self) -> u64 {
        self.buffer.phys_base()
    }

    /// The value for the ERSTSZ register.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always false, a table has at least one entry.
    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// An Event Ring made of a single segment.
///
/// There is no Link TRB. The controller wraps to the first TRB after the last
/// one and flips its producer cycle state. Software finds new events purely by
/// comparing cycle bits: the TRB at the dequeue pointer is new if its cycle
/// bit equals the consumer cycle state.
#[derive(Debug)]
pub struct EventRing {
    /// The ring memory. Only the controller writes to it.
    buffer: DmaBuffer,
    /// The number of TRBs.
    count: usize,
    /// The slot software reads next.
    dequeue: usize,
    /// The consumer cycle state. Starts at One and flips on each wrap.
    cycle_state: CycleState,
}

impl EventRing {
    /// Create an Event Ring with `count` TRBs and register it in `entry`.
    ///
    /// # Parameters
    ///
    /// - `allocator`: source of the ring memory.
    /// - `count`: the number of TRBs.
    /// - `entry`: the segment table entry to fill with the ring's physical
    ///   base and size.
    pub fn new(
        allocator: &dyn DmaAllocator,
        count: usize,
        entry: &SegmentTableEntry,
    ) -> Result<Self, AllocationError> {
        assert!(count >= 1, "an event ring needs at least one TRB");
        assert!(
            u32::try_from(count).is_ok(),
            "event ring size has to fit in 32 bits"
        );

        // Read-only for software. The controller writes every TRB.
        let buffer = allocator.allocate(count * TRB_SIZE, DmaFlags::RING_READ_ONLY)?;

        entry.set(buffer.phys_base(), count as u32);

        debug!(
            "created event ring with {} TRBs at phys {:#x}",
            count,
            buffer.phys_base()
        );

        Ok(Self {
            buffer,
            count,
            dequeue: 0,
            cycle_state: CycleState::One,
        })
    }

    fn trbs(&self) -> &[Trb] {
        Trb::slice_from_buffer(&self.buffer, self.count)
    }

    /// The number of TRBs.
    pub const fn count(&self) -> usize {
        self.count
    }

    /// The physical address of the first TRB.
    pub const fn phys_base(&self) -> u64 {
        self.buffer.phys_base()
    }

    /// The consumer cycle state.
    pub const fn cycle_state(&self) -> CycleState {
        self.cycle_state
    }

    /// The slot index software reads next.
    pub const fn dequeue_index(&self) -> usize {
        self.dequeue
    }

    /// The value for the ERDP register after processing events.
    pub fn dequeue_pointer_phys(&self) -> u64 {
        self.phys_base() + (self.dequeue * TRB_SIZE) as u64
    }

    /// The TRB at the dequeue pointer, if the controller has written a new
    /// event there.
    pub fn peek(&self) -> Option<&Trb> {
        let trb = &self.trbs()[self.dequeue];

        (trb.cycle() == self.cycle_state).then_some(trb)
    }

    /// Move past the TRB at the dequeue pointer.
    ///
    /// Only call this after [`EventRing::peek`] returned an event.
    pub fn advance(&mut self) {
        self.dequeue += 1;

        if self.dequeue == self.count {
            self.dequeue = 0;
            self.cycle_state = self.cycle_state.toggled();

            trace!(
                "event ring {:#x} wrapped; cycle={:?}",
                self.phys_base(),
                self.cycle_state
            );
        }
    }

    /// Take the next event, if there is one.
    pub fn pop(&mut self) -> Option<TrbData> {
        let event = self.peek()?.snapshot();

        trace!(
            "drained event from slot {} of event ring {:#x}: {:?}",
            self.dequeue,
            self.phys_base(),
            event
        );

        self.advance();

        Some(event)
    }

    /// Destroy the ring and release its memory.
    pub fn release(self) {
        debug!("releasing event ring at phys {:#x}", self.phys_base());
        self.buffer.release();
    }
}
