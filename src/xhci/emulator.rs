//! A software model of the controller's side of the rings.
//!
//! The model touches ring memory only through [`PhysicalMemory`], i.e. by the
//! physical addresses software handed to it, like a controller doing DMA. It
//! consumes Transfer Rings by cycle bit, follows Link TRBs and posts Transfer
//! Events onto a single-segment Event Ring. Registers, doorbells and
//! interrupts are reduced to plain method calls.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, trace, warn};

use super::{
    constants::{
        control::{IOC, TOGGLE_CYCLE},
        endpoint_context::{DEQUEUE_CYCLE_STATE, DEQUEUE_POINTER_MASK},
        event_ring::segments_table_entry_offsets::{BASE_ADDR, SIZE},
        trb_types, TRB_SIZE,
    },
    trb::{CompletionCode, CycleState, TransferEvent, TrbData},
};
use crate::dma::PhysicalMemory;

/// Read a TRB from memory, control dword first.
fn read_trb(memory: &PhysicalMemory, addr: u64) -> TrbData {
    let control = memory.read_u32(addr + 12);

    TrbData {
        pointer: memory.read_u64(addr),
        status: memory.read_u32(addr + 8),
        control,
    }
}

/// A TRB fetched from a Transfer Ring together with its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchedTrb {
    /// The physical address of the TRB.
    pub address: u64,
    /// The TRB contents.
    pub data: TrbData,
}

/// The consumer side of one Transfer Ring.
///
/// This is the state a controller keeps in the endpoint context: the dequeue
/// pointer and the consumer cycle state.
#[derive(Debug)]
pub struct TransferRingConsumer {
    memory: PhysicalMemory,
    dequeue_pointer: u64,
    cycle_state: CycleState,
}

impl TransferRingConsumer {
    /// Create a consumer from a TR Dequeue Pointer value (address with the
    /// Dequeue Cycle State in bit 0).
    pub fn new(memory: PhysicalMemory, tr_dequeue_pointer: u64) -> Self {
        Self {
            memory,
            dequeue_pointer: tr_dequeue_pointer & DEQUEUE_POINTER_MASK,
            cycle_state: (tr_dequeue_pointer & DEQUEUE_CYCLE_STATE != 0).into(),
        }
    }

    /// The physical address of the next TRB to fetch.
    pub const fn dequeue_pointer(&self) -> u64 {
        self.dequeue_pointer
    }

    /// The consumer cycle state.
    pub const fn cycle_state(&self) -> CycleState {
        self.cycle_state
    }

    /// Try to retrieve a fresh TRB at the dequeue pointer.
    ///
    /// Returns Link TRBs as well.
    fn next_trb_buffer(&self) -> Option<TrbData> {
        let trb = read_trb(&self.memory, self.dequeue_pointer);

        trace!(
            "interpreting transfer TRB at {:#x}; cycle state = {:?}, TRB = {:?}",
            self.dequeue_pointer,
            self.cycle_state,
            trb
        );

        // cycle-bit mismatch: no new TRB available
        (trb.cycle() == self.cycle_state).then_some(trb)
    }

    /// Try to retrieve a new TRB from the transfer ring.
    ///
    /// This function never returns Link TRBs. It follows them instead, which
    /// is the reason why it might read two TRBs to return a single one.
    pub fn next_transfer_trb(&mut self) -> Option<FetchedTrb> {
        let mut trb = self.next_trb_buffer()?;

        if trb.trb_type() == trb_types::LINK {
            self.dequeue_pointer = trb.pointer & DEQUEUE_POINTER_MASK;
            if trb.control & TOGGLE_CYCLE != 0 {
                self.cycle_state = self.cycle_state.toggled();
            }

            trace!(
                "followed Link TRB to {:#x}; cycle state = {:?}",
                self.dequeue_pointer,
                self.cycle_state
            );

            trb = self.next_trb_buffer()?;
            assert_ne!(
                trb.trb_type(),
                trb_types::LINK,
                "Link TRB should not follow directly after another Link TRB"
            );
        }

        let address = self.dequeue_pointer;
        self.dequeue_pointer += TRB_SIZE as u64;

        Some(FetchedTrb { address, data: trb })
    }
}

/// The Event Ring is full. The event was not written.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("The Event Ring is full")]
pub struct EventRingFull;

/// The producer side of a single-segment Event Ring.
#[derive(Debug)]
pub struct EventRingProducer {
    memory: PhysicalMemory,
    /// The physical address of the segment.
    segment_base: u64,
    /// The number of TRBs in the segment.
    segment_size: u32,
    /// Where the next event goes (EREP).
    enqueue_pointer: u64,
    /// The Event Ring Dequeue Pointer as written by software (ERDP).
    dequeue_pointer: u64,
    /// The producer cycle state. Flips after every full pass.
    cycle_state: CycleState,
}

impl EventRingProducer {
    /// Configure the Event Ring from the first entry of a segment table.
    ///
    /// Call this when software writes ERSTBA.
    pub fn configure(memory: PhysicalMemory, erstba: u64) -> Self {
        assert_eq!(erstba & 0x3f, 0, "unaligned event ring base address");

        let segment_base = memory.read_u64(erstba + BASE_ADDR);
        let segment_size = memory.read_u32(erstba + SIZE);

        assert!(segment_size > 0, "event ring segment is empty");

        debug!(
            "event ring segment table is at {:#x}; segment at {:#x} with {} TRBs",
            erstba, segment_base, segment_size
        );

        Self {
            memory,
            segment_base,
            segment_size,
            enqueue_pointer: segment_base,
            dequeue_pointer: segment_base,
            cycle_state: CycleState::One,
        }
    }

    /// Handle writes to the Event Ring Dequeue Pointer (ERDP).
    pub fn update_dequeue_pointer(&mut self, erdp: u64) {
        self.dequeue_pointer = erdp & DEQUEUE_POINTER_MASK;
        trace!("software set event ring dequeue pointer to {:#x}", erdp);
    }

    /// The position after `addr`, wrapping at the end of the segment.
    fn next_position(&self, addr: u64) -> u64 {
        let next = addr + TRB_SIZE as u64;

        if next == self.segment_base + u64::from(self.segment_size) * TRB_SIZE as u64 {
            self.segment_base
        } else {
            next
        }
    }

    /// Returns true if writing one more event would overrun the consumer.
    ///
    /// One slot always stays empty, otherwise a full ring would look empty
    /// to software.
    pub fn is_full(&self) -> bool {
        self.next_position(self.enqueue_pointer) == self.dequeue_pointer
    }

    /// Enqueue a new event.
    pub fn enqueue(&mut self, event: &TransferEvent) -> Result<(), EventRingFull> {
        if self.is_full() {
            return Err(EventRingFull);
        }

        let trb = event.to_trb_data(self.cycle_state);

        self.memory.write_u64(self.enqueue_pointer, trb.pointer);
        self.memory.write_u32(self.enqueue_pointer + 8, trb.status);
        // The control dword goes last. It carries the cycle bit.
        self.memory.write_u32(self.enqueue_pointer + 12, trb.control);

        trace!(
            "enqueued event at {:#x}; cycle={:?}; (TRB: {:?})",
            self.enqueue_pointer,
            self.cycle_state,
            event
        );

        self.enqueue_pointer = self.next_position(self.enqueue_pointer);
        if self.enqueue_pointer == self.segment_base {
            self.cycle_state = self.cycle_state.toggled();
        }

        Ok(())
    }
}

/// A controller with one interrupter and one device slot.
#[derive(Debug)]
pub struct Controller {
    memory: PhysicalMemory,
    slot_id: u8,
    event_ring: Option<EventRingProducer>,
    endpoints: BTreeMap<u8, TransferRingConsumer>,
}

impl Controller {
    /// Create a controller that performs DMA through `memory`.
    pub const fn new(memory: PhysicalMemory, slot_id: u8) -> Self {
        Self {
            memory,
            slot_id,
            event_ring: None,
            endpoints: BTreeMap::new(),
        }
    }

    /// Handle a write to ERSTBA. ERSTSZ is assumed to be 1.
    pub fn configure_event_ring(&mut self, erstba: u64) {
        self.event_ring = Some(EventRingProducer::configure(self.memory.clone(), erstba));
    }

    /// Handle a write to ERDP.
    pub fn update_event_ring_dequeue_pointer(&mut self, erdp: u64) {
        self.event_ring
            .as_mut()
            .expect("event ring is not configured")
            .update_dequeue_pointer(erdp);
    }

    /// Configure an endpoint with the TR Dequeue Pointer from its context.
    pub fn configure_endpoint(&mut self, endpoint_id: u8, tr_dequeue_pointer: u64) {
        debug!(
            "endpoint {} transfer ring at {:#x}",
            endpoint_id, tr_dequeue_pointer
        );

        self.endpoints.insert(
            endpoint_id,
            TransferRingConsumer::new(self.memory.clone(), tr_dequeue_pointer),
        );
    }

    /// Handle a doorbell write for an endpoint.
    ///
    /// Consumes fresh TRBs until the ring runs dry. Every TRB that ends a
    /// Transfer Descriptor (no chain bit) or asks for an interrupt gets a
    /// successful Transfer Event. Processing stops early while the Event Ring
    /// is full, leaving the remaining TRBs on the ring.
    ///
    /// Returns the number of TRBs consumed.
    pub fn ring_doorbell(&mut self, endpoint_id: u8) -> usize {
        let event_ring = self
            .event_ring
            .as_mut()
            .expect("event ring is not configured");
        let Some(endpoint) = self.endpoints.get_mut(&endpoint_id) else {
            warn!("doorbell for unconfigured endpoint {}", endpoint_id);
            return 0;
        };

        let mut consumed = 0;
        while !event_ring.is_full() {
            let Some(trb) = endpoint.next_transfer_trb() else {
                break;
            };
            consumed += 1;

            if !trb.data.chain() || trb.data.control & IOC != 0 {
                let event = TransferEvent::new(
                    trb.address,
                    0,
                    CompletionCode::Success,
                    endpoint_id,
                    self.slot_id,
                );

                event_ring
                    .enqueue(&event)
                    .expect("room was checked before fetching");
            }
        }

        trace!(
            "doorbell for endpoint {} consumed {} TRBs",
            endpoint_id,
            consumed
        );

        consumed
    }
}
