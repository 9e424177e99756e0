//! The Transfer Ring: software produces TRBs, the controller consumes them.
//!
//! The specification is available
//! [here](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf),
//! see Section 4.9 for the ring protocol.

use tracing::{debug, trace};

use super::{
    constants::{
        control::{CHAIN, CYCLE, TOGGLE_CYCLE},
        endpoint_context::DEQUEUE_CYCLE_STATE,
        TRB_SIZE,
    },
    trb::{CycleState, Trb, TrbData},
};
use crate::dma::{AllocationError, DmaAllocator, DmaBuffer, DmaFlags};

/// A Transfer Ring of a single endpoint.
///
/// The ring is one contiguous segment of `count` TRBs. The last TRB is a Link
/// TRB that points back to the first one and toggles the cycle state, which
/// leaves `count - 1` usable slots.
///
/// Positions on the ring are slot indices. The enqueue pointer is where
/// software writes the next TRB. The dequeue pointer is the first TRB the
/// controller has not yet reported as completed; only completion processing
/// moves it, via [`TransferRing::set_dequeue_pointer`]. Neither ever points at
/// the Link TRB.
///
/// # Concurrency
///
/// There is no locking inside. The producer methods and
/// [`TransferRing::set_dequeue_pointer`] read the cursors and the full flag
/// together, which `&mut self` already enforces for a single owner. Callers
/// that share a ring between the submission path and completion processing
/// have to put it behind a lock. The controller is the only concurrent
/// accessor and is synchronized purely through the cycle bits.
#[derive(Debug)]
pub struct TransferRing {
    /// The ring memory. Owned exclusively by the ring.
    buffer: DmaBuffer,
    /// The number of TRBs including the Link TRB.
    count: usize,
    /// The number of usable slots.
    capacity: usize,
    /// The slot software writes next.
    enqueue: usize,
    /// The oldest slot not yet known to be consumed by the controller.
    dequeue: usize,
    /// Disambiguates `enqueue == dequeue`, which means either empty or full.
    full: bool,
    /// The producer cycle state. Starts at One and flips on each wrap.
    cycle_state: CycleState,
}

impl TransferRing {
    /// Create a Transfer Ring with `count` TRBs, one of which is the Link
    /// TRB.
    ///
    /// # Parameters
    ///
    /// - `allocator`: source of the ring memory.
    /// - `count`: the total number of TRBs. Has to be at least 2.
    pub fn new(allocator: &dyn DmaAllocator, count: usize) -> Result<Self, AllocationError> {
        assert!(
            count >= 2,
            "a transfer ring needs room for a Link TRB and at least one TRB"
        );

        let buffer = allocator.allocate(count * TRB_SIZE, DmaFlags::RING_READ_WRITE)?;
        let ring = Self {
            buffer,
            count,
            capacity: count - 1,
            enqueue: 0,
            dequeue: 0,
            full: false,
            cycle_state: CycleState::One,
        };

        ring.slot(count - 1).write_link(ring.buffer.phys_base());

        debug!(
            "created transfer ring with {} TRBs at phys {:#x}",
            count,
            ring.buffer.phys_base()
        );

        Ok(ring)
    }

    fn trbs(&self) -> &[Trb] {
        Trb::slice_from_buffer(&self.buffer, self.count)
    }

    /// Access the TRB at a slot index.
    pub fn slot(&self, index: usize) -> &Trb {
        &self.trbs()[index]
    }

    /// The TRB at the enqueue pointer, which software writes next.
    pub fn current(&self) -> &Trb {
        self.slot(self.enqueue)
    }

    /// The number of usable slots.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of TRBs including the Link TRB.
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Returns true when every usable slot is waiting for the controller.
    pub const fn is_full(&self) -> bool {
        self.full
    }

    /// The producer cycle state.
    pub const fn cycle_state(&self) -> CycleState {
        self.cycle_state
    }

    /// The slot index of the enqueue pointer.
    pub const fn enqueue_index(&self) -> usize {
        self.enqueue
    }

    /// The slot index of the dequeue pointer.
    pub const fn dequeue_index(&self) -> usize {
        self.dequeue
    }

    /// The physical address of the first TRB.
    pub const fn phys_base(&self) -> u64 {
        self.buffer.phys_base()
    }

    /// The physical address of the enqueue pointer.
    pub fn enqueue_pointer_phys(&self) -> u64 {
        self.phys_of(self.enqueue)
    }

    /// The value for the TR Dequeue Pointer field of an Endpoint Context or a
    /// Set TR Dequeue Pointer Command: the physical enqueue pointer with the
    /// Dequeue Cycle State in bit 0.
    ///
    /// Only meaningful while the controller has nothing left to consume, e.g.
    /// right after creation.
    pub fn endpoint_dequeue_pointer(&self) -> u64 {
        let dcs = match self.cycle_state {
            CycleState::One => DEQUEUE_CYCLE_STATE,
            CycleState::Zero => 0,
        };

        self.enqueue_pointer_phys() | dcs
    }

    /// The physical address of a slot.
    pub fn phys_of(&self, index: usize) -> u64 {
        assert!(index < self.count, "slot {index} is outside of the ring");

        self.buffer
            .window()
            .virt_to_phys(self.buffer.window().virt_base() + index * TRB_SIZE)
    }

    /// Returns true if `phys` is the address of a usable slot of this ring.
    pub fn owns_trb(&self, phys: u64) -> bool {
        let window = self.buffer.window();

        window.contains_phys(phys) && {
            let offset = (phys - window.phys_base()) as usize;
            offset % TRB_SIZE == 0 && offset / TRB_SIZE < self.capacity
        }
    }

    /// The slot index for a physical TRB address.
    ///
    /// The address has to lie inside the ring. Controllers only report
    /// addresses they were given, so anything else is a bug.
    pub fn slot_of_phys(&self, phys: u64) -> usize {
        let window = self.buffer.window();
        let offset = window.phys_to_virt(phys) - window.virt_base();

        assert_eq!(offset % TRB_SIZE, 0, "unaligned TRB address {phys:#x}");
        assert!(
            offset / TRB_SIZE < self.count,
            "TRB address {phys:#x} is past the end of the ring"
        );

        offset / TRB_SIZE
    }

    /// The slot addressed by the pointer field of the TRB at `index`.
    ///
    /// Used to follow Link TRBs.
    pub fn trb_pointer_target(&self, index: usize) -> usize {
        self.slot_of_phys(self.slot(index).pointer())
    }

    /// Return the number of slots software can still fill.
    pub fn free_slots(&self) -> usize {
        if self.full {
            assert_eq!(
                self.enqueue, self.dequeue,
                "transfer ring is marked full, but enqueue and dequeue pointer differ"
            );
            return 0;
        }

        let mut enqueue = self.enqueue;

        // The producer has wrapped since the dequeue pointer was last set.
        if enqueue < self.dequeue {
            enqueue += self.capacity;
        }

        self.capacity - (enqueue - self.dequeue)
    }

    /// Hand the TRB at the enqueue pointer to the controller and move on.
    ///
    /// Pointer and status of the current TRB have to be written already. This
    /// sets its cycle bit to the producer cycle state, which is the ordered
    /// store that makes the TRB visible to the controller. If the next slot
    /// is a Link TRB, the Link TRB is armed as well, carrying over the chain
    /// bit, and the enqueue pointer follows it.
    ///
    /// Check [`TransferRing::free_slots`] first. Advancing a full ring
    /// overwrites TRBs the controller still owns and panics instead.
    pub fn advance(&mut self) {
        assert!(!self.full, "advance called on a full transfer ring");

        let chain = self.current().arm(self.cycle_state) & CHAIN;

        trace!(
            "armed TRB {} of transfer ring {:#x}; cycle={:?}",
            self.enqueue,
            self.phys_base(),
            self.cycle_state
        );

        self.enqueue += 1;

        let link = self.slot(self.enqueue);
        if link.is_link() {
            let control =
                (link.control() & !(CHAIN | CYCLE)) | chain | self.cycle_state.control_bit();
            link.set_control(control);
            let target = link.pointer();

            if control & TOGGLE_CYCLE != 0 {
                self.cycle_state = self.cycle_state.toggled();
            }
            self.enqueue = self.slot_of_phys(target);

            trace!(
                "followed Link TRB of transfer ring {:#x} to slot {}; cycle={:?}",
                self.phys_base(),
                self.enqueue,
                self.cycle_state
            );
        }

        // We've just enqueued something, so if the pointers are equal, the
        // ring must be full.
        if self.enqueue == self.dequeue {
            self.full = true;
        }
    }

    /// Place a TRB on the ring and hand it to the controller.
    ///
    /// The contents are staged with a cycle bit the controller ignores and
    /// then armed by [`TransferRing::advance`]. The cycle bit in
    /// `data.control` is ignored. Returns the slot index the TRB went to.
    pub fn enqueue(&mut self, data: TrbData) -> usize {
        assert!(!self.full, "enqueue called on a full transfer ring");

        let index = self.enqueue;

        self.current().stage(data, self.cycle_state);
        self.advance();

        index
    }

    /// Record that the controller has consumed everything before `index`.
    ///
    /// Completion processing calls this with the slot after the last
    /// completed TRB (see [`TransferRing::next_live`]). This is the only way
    /// to reclaim slots.
    pub fn set_dequeue_pointer(&mut self, index: usize) {
        assert!(
            index < self.capacity,
            "dequeue pointer {index} is outside of the usable slots"
        );

        self.dequeue = index;
        self.full = false;

        trace!(
            "transfer ring {:#x}: dequeue pointer at slot {}, {} slots free",
            self.phys_base(),
            index,
            self.free_slots()
        );
    }

    /// The slot after `index`, skipping over Link TRBs.
    ///
    /// If the following slot holds a Link TRB, the slot it points to is
    /// returned instead. The result never is a Link TRB slot.
    pub fn next_live(&self, index: usize) -> usize {
        assert!(
            index < self.capacity,
            "slot {index} is not a usable slot of the ring"
        );

        let next = index + 1;

        if self.slot(next).is_link() {
            self.trb_pointer_target(next)
        } else {
            next
        }
    }

    /// Destroy the ring and release its memory.
    pub fn release(self) {
        debug!("releasing transfer ring at phys {:#x}", self.phys_base());
        self.buffer.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dma::HostDmaAllocator,
        xhci::{
            constants::trb_types,
            trb::control_for_type,
        },
    };
    use proptest::prelude::*;

    fn normal_trb(chain: bool) -> TrbData {
        let chain = if chain { CHAIN } else { 0 };

        TrbData::new(0x4000_0000, 64, control_for_type(trb_types::NORMAL) | chain)
    }

    fn ring(count: usize) -> TransferRing {
        TransferRing::new(&HostDmaAllocator::default(), count).unwrap()
    }

    #[test]
    fn new_ring_is_empty_with_link_back_to_start() {
        let ring = ring(8);

        assert_eq!(ring.count(), 8);
        assert_eq!(ring.capacity(), 7);
        assert_eq!(ring.free_slots(), 7);
        assert!(!ring.is_full());
        assert_eq!(ring.cycle_state(), CycleState::One);
        assert_eq!(ring.enqueue_index(), 0);
        assert_eq!(ring.dequeue_index(), 0);

        let link = ring.slot(7);
        assert!(link.is_link());
        assert_eq!(link.pointer(), ring.phys_base());
        assert_eq!(link.control() & TOGGLE_CYCLE, TOGGLE_CYCLE);
        assert_eq!(ring.endpoint_dequeue_pointer(), ring.phys_base() | 1);
    }

    #[test]
    fn allocation_failure_is_reported() {
        let allocator = HostDmaAllocator::new(0x8000_0000, Some(0));

        assert!(matches!(
            TransferRing::new(&allocator, 4),
            Err(AllocationError::Exhausted { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "room for a Link TRB")]
    fn ring_of_one_is_rejected() {
        ring(1);
    }

    // The ring from the protocol description: four TRBs, three usable.
    #[test]
    fn fill_reclaim_and_wrap() {
        let mut ring = ring(4);
        assert_eq!(ring.free_slots(), 3);

        let first = ring.enqueue(normal_trb(false));
        ring.enqueue(normal_trb(false));
        ring.enqueue(normal_trb(false));

        assert!(ring.is_full());
        assert_eq!(ring.free_slots(), 0);
        assert_eq!(ring.enqueue_index(), 0);
        assert_eq!(ring.cycle_state(), CycleState::Zero);

        ring.set_dequeue_pointer(ring.next_live(first));
        assert!(!ring.is_full());
        assert_eq!(ring.free_slots(), 1);

        assert_eq!(ring.enqueue(normal_trb(false)), 0);
        assert!(ring.is_full());
        assert_eq!(ring.free_slots(), 0);
        assert_eq!(ring.enqueue_index(), 1);
        // Still only one wrap.
        assert_eq!(ring.cycle_state(), CycleState::Zero);
        assert_eq!(ring.slot(0).cycle(), CycleState::Zero);
    }

    #[test]
    fn armed_trbs_carry_the_producer_cycle_state() {
        let mut ring = ring(3);

        ring.enqueue(normal_trb(false));
        assert_eq!(ring.slot(0).cycle(), CycleState::One);
        assert_eq!(ring.slot(1).cycle(), CycleState::Zero);
        assert_eq!(ring.slot(0).pointer(), 0x4000_0000);
        assert_eq!(ring.slot(0).status(), 64);
    }

    #[test]
    fn raw_writes_then_advance() {
        let mut ring = ring(4);

        let trb = ring.current();
        trb.set_pointer(0x1234_0000);
        trb.set_status(8);
        trb.set_control(control_for_type(trb_types::NO_OP));
        ring.advance();

        assert_eq!(ring.slot(0).cycle(), CycleState::One);
        assert_eq!(ring.slot(0).trb_type(), trb_types::NO_OP);
        assert_eq!(ring.free_slots(), 2);
    }

    #[test]
    fn link_trb_inherits_chain_bit_and_cycle_state() {
        let mut ring = ring(3);

        ring.enqueue(normal_trb(false));
        ring.enqueue(normal_trb(true));

        let link = ring.slot(2);
        assert_eq!(link.control() & CHAIN, CHAIN);
        assert_eq!(link.cycle(), CycleState::One);
        assert_eq!(ring.cycle_state(), CycleState::Zero);

        // Second pass: reclaim everything, wrap again without chaining.
        ring.set_dequeue_pointer(0);
        ring.enqueue(normal_trb(false));
        ring.enqueue(normal_trb(false));

        let link = ring.slot(2);
        assert_eq!(link.control() & CHAIN, 0);
        assert_eq!(link.cycle(), CycleState::Zero);
        assert_eq!(link.control() & TOGGLE_CYCLE, TOGGLE_CYCLE);
        assert!(link.is_link());
        assert_eq!(ring.cycle_state(), CycleState::One);
    }

    #[test]
    fn next_live_skips_the_link_trb() {
        let ring = ring(5);

        assert_eq!(ring.next_live(0), 1);
        assert_eq!(ring.next_live(2), 3);
        assert_eq!(ring.next_live(3), 0);
    }

    #[test]
    #[should_panic(expected = "not a usable slot")]
    fn next_live_rejects_the_link_slot() {
        ring(5).next_live(4);
    }

    #[test]
    #[should_panic(expected = "outside of the usable slots")]
    fn dequeue_pointer_cannot_point_at_the_link_trb() {
        let mut ring = ring(4);

        ring.set_dequeue_pointer(ring.capacity());
    }

    #[test]
    #[should_panic(expected = "outside of the usable slots")]
    fn dequeue_pointer_cannot_point_past_the_ring() {
        let mut ring = ring(4);

        ring.set_dequeue_pointer(ring.count() + 1);
    }

    #[test]
    #[should_panic(expected = "marked full")]
    fn full_ring_with_diverging_cursors_panics() {
        let mut ring = ring(4);

        ring.enqueue(normal_trb(false));
        ring.full = true;
        assert_ne!(ring.enqueue_index(), ring.dequeue_index());

        ring.free_slots();
    }

    #[test]
    #[should_panic(expected = "advance called on a full transfer ring")]
    fn advancing_a_full_ring_panics() {
        let mut ring = ring(2);

        ring.advance();
        assert!(ring.is_full());
        ring.advance();
    }

    #[test]
    fn physical_addresses_map_back_to_slots() {
        let ring = ring(4);

        for index in 0..4 {
            assert_eq!(ring.slot_of_phys(ring.phys_of(index)), index);
        }
        assert_eq!(ring.trb_pointer_target(3), 0);
        assert!(ring.owns_trb(ring.phys_of(2)));
        assert!(!ring.owns_trb(ring.phys_of(3)));
        assert!(!ring.owns_trb(ring.phys_of(2) + 4));
        assert!(!ring.owns_trb(ring.phys_base() + 0x1000));
    }

    #[test]
    fn release_frees_the_memory() {
        let allocator = HostDmaAllocator::new(0x8000_0000, Some(0x1000));
        let ring = TransferRing::new(&allocator, 4).unwrap();

        assert!(TransferRing::new(&allocator, 4).is_err());
        ring.release();
        assert!(TransferRing::new(&allocator, 4).is_ok());
    }

    proptest! {
        #[test]
        fn free_slots_count_down_while_filling(count in 2..64_usize, advances in 0..64_usize) {
            let mut ring = ring(count);
            let advances = advances.min(ring.capacity());

            for done in 1..=advances {
                ring.enqueue(normal_trb(false));
                prop_assert_eq!(ring.free_slots(), ring.capacity() - done);
            }

            prop_assert_eq!(ring.is_full(), advances == ring.capacity());
        }

        #[test]
        fn set_dequeue_pointer_matches_outstanding_trbs(
            count in 2..32_usize,
            produced in 0..128_usize,
            outstanding in 0..32_usize,
        ) {
            let mut ring = ring(count);
            let capacity = ring.capacity();
            let mut slots = Vec::new();

            // Keep at most `outstanding` TRBs unconsumed, then report the
            // oldest one as the next to complete.
            let outstanding = outstanding.min(capacity);
            for _ in 0..produced {
                if ring.free_slots() == 0 {
                    let oldest: usize = slots.remove(0);
                    ring.set_dequeue_pointer(ring.next_live(oldest));
                }
                slots.push(ring.enqueue(normal_trb(false)));
                if slots.len() > outstanding {
                    let oldest = slots.remove(0);
                    ring.set_dequeue_pointer(ring.next_live(oldest));
                }
            }

            prop_assert!(!ring.is_full() || slots.len() == capacity);
            prop_assert_eq!(ring.free_slots(), capacity - slots.len());
            prop_assert!(ring.enqueue_index() < capacity);
            prop_assert!(ring.dequeue_index() < capacity);
        }

        #[test]
        fn cycle_state_flips_once_per_traversal(count in 2..16_usize, passes in 1..6_usize) {
            let mut ring = ring(count);
            let capacity = ring.capacity();
            let mut expected = CycleState::One;

            for _ in 0..passes {
                for _ in 0..capacity {
                    let slot = ring.enqueue(normal_trb(false));
                    ring.set_dequeue_pointer(ring.next_live(slot));
                }
                expected = expected.toggled();
                prop_assert_eq!(ring.cycle_state(), expected);
                prop_assert_eq!(ring.slot(capacity).cycle(), expected.toggled());
            }
        }

        #[test]
        fn next_live_never_returns_the_link_slot(count in 2..64_usize, from in 0..64_usize) {
            let ring = ring(count);
            let from = from % ring.capacity();
            let next = ring.next_live(from);

            prop_assert!(next < ring.capacity());
            prop_assert!(!ring.slot(next).is_link());
        }
    }
}
