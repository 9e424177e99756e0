//! # XHCI Rings
//!
//! Software and an XHCI controller talk through rings of 16-byte TRBs in DMA
//! memory. Two kinds are implemented here:
//!
//! - [`TransferRing`](transfer_ring::TransferRing): software produces work,
//!   the controller consumes it. A Link TRB at the end turns the linear
//!   buffer into a ring.
//! - [`EventRing`](event_ring::EventRing): the controller produces
//!   completion events, software consumes them. Wraparound is purely
//!   arithmetic.
//!
//! [`completion`] connects the two: a drained Transfer Event moves the
//! Transfer Ring's dequeue pointer and frees its slots. [`emulator`] plays the
//! controller for testing.
//!
//! ## Example
//!
//! ```rust
//! use xhci_rings::dma::HostDmaAllocator;
//! use xhci_rings::xhci::{
//!     completion::process_transfer_event,
//!     constants::trb_types,
//!     emulator::Controller,
//!     event_ring::{EventRing, SegmentTable},
//!     transfer_ring::TransferRing,
//!     trb::{control_for_type, TrbData},
//! };
//!
//! let allocator = HostDmaAllocator::default();
//! let table = SegmentTable::new(&allocator, 1).unwrap();
//! let mut event_ring = EventRing::new(&allocator, 16, table.entry(0)).unwrap();
//! let mut transfer_ring = TransferRing::new(&allocator, 16).unwrap();
//!
//! let mut controller = Controller::new(allocator.physical_memory(), 1);
//! controller.configure_event_ring(table.phys_base());
//! controller.update_event_ring_dequeue_pointer(event_ring.dequeue_pointer_phys());
//! controller.configure_endpoint(1, transfer_ring.endpoint_dequeue_pointer());
//!
//! transfer_ring.enqueue(TrbData::new(0, 0, control_for_type(trb_types::NO_OP)));
//! assert_eq!(transfer_ring.free_slots(), 14);
//!
//! controller.ring_doorbell(1);
//!
//! while let Some(event) = event_ring.pop() {
//!     process_transfer_event(&mut transfer_ring, &event).unwrap();
//! }
//! assert_eq!(transfer_ring.free_slots(), 15);
//! ```

pub mod completion;
pub mod constants;
pub mod emulator;
pub mod event_ring;
pub mod transfer_ring;
pub mod trb;
