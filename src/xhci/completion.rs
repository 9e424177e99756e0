//! Completion processing: turning Transfer Events back into free ring slots.

use thiserror::Error;
use tracing::{trace, warn};

use super::{
    transfer_ring::TransferRing,
    trb::{CompletionCode, TransferEvent, TrbData},
};

/// A Transfer Event could not be applied to a Transfer Ring.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CompletionError {
    /// The event is not a Transfer Event.
    #[error("Expected a Transfer Event TRB, got TRB type {0}")]
    UnexpectedTrbType(u8),
    /// The event reports a TRB that is not a usable slot of the ring.
    #[error("Transfer Event points at {0:#x}, which is not a TRB of this transfer ring")]
    ForeignTrbPointer(u64),
}

/// A completed transfer as reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCompletion {
    /// The ring slot of the TRB that generated the event.
    pub slot: usize,
    /// The raw completion code.
    pub completion_code: u8,
    /// The number of bytes that were not transferred.
    pub residual_length: u32,
}

impl TransferCompletion {
    /// Returns true for codes that mean the data made it across, possibly
    /// shorter than requested.
    pub const fn is_success(&self) -> bool {
        self.completion_code == CompletionCode::Success as u8
            || self.completion_code == CompletionCode::ShortPacket as u8
    }
}

/// Apply a Transfer Event to the ring it belongs to.
///
/// The event's TRB pointer is translated back to a ring slot. Everything up to
/// and including that slot is consumed, so the dequeue pointer moves to the
/// next live slot after it.
///
/// Routing events to the right ring (by slot and endpoint ID) is up to the
/// caller.
pub fn process_transfer_event(
    ring: &mut TransferRing,
    event: &TrbData,
) -> Result<TransferCompletion, CompletionError> {
    let event =
        TransferEvent::parse(event).ok_or(CompletionError::UnexpectedTrbType(event.trb_type()))?;

    if !ring.owns_trb(event.trb_pointer) {
        warn!(
            "transfer event for TRB {:#x} does not match transfer ring {:#x}",
            event.trb_pointer,
            ring.phys_base()
        );
        return Err(CompletionError::ForeignTrbPointer(event.trb_pointer));
    }

    let slot = ring.slot_of_phys(event.trb_pointer);
    ring.set_dequeue_pointer(ring.next_live(slot));

    trace!(
        "slot {} of transfer ring {:#x} completed with code {}",
        slot,
        ring.phys_base(),
        event.completion_code
    );

    Ok(TransferCompletion {
        slot,
        completion_code: event.completion_code,
        residual_length: event.trb_transfer_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dma::HostDmaAllocator,
        xhci::{
            constants::{control::CHAIN, trb_types},
            trb::{control_for_type, CycleState},
        },
    };

    fn event_for(ring: &TransferRing, slot: usize, code: CompletionCode) -> TrbData {
        TransferEvent::new(ring.phys_of(slot), 0, code, 1, 1).to_trb_data(CycleState::One)
    }

    #[test]
    fn completion_reclaims_up_to_the_reported_trb() {
        let mut ring = TransferRing::new(&HostDmaAllocator::default(), 4).unwrap();
        let normal = control_for_type(trb_types::NORMAL);

        ring.enqueue(TrbData::new(0, 8, normal | CHAIN));
        let last = ring.enqueue(TrbData::new(0, 8, normal));
        assert_eq!(ring.free_slots(), 1);

        let event = event_for(&ring, last, CompletionCode::Success);
        let completion = process_transfer_event(&mut ring, &event).unwrap();

        assert_eq!(completion.slot, 1);
        assert!(completion.is_success());
        assert_eq!(ring.dequeue_index(), 2);
        assert_eq!(ring.free_slots(), 3);
    }

    #[test]
    fn completion_of_last_slot_wraps_dequeue_pointer() {
        let mut ring = TransferRing::new(&HostDmaAllocator::default(), 4).unwrap();

        for _ in 0..3 {
            ring.enqueue(TrbData::new(0, 0, control_for_type(trb_types::NORMAL)));
        }
        assert!(ring.is_full());

        let event = event_for(&ring, 2, CompletionCode::StallError);
        let completion = process_transfer_event(&mut ring, &event).unwrap();

        assert!(!completion.is_success());
        assert_eq!(completion.completion_code, CompletionCode::StallError as u8);
        assert_eq!(ring.dequeue_index(), 0);
        assert!(!ring.is_full());
        assert_eq!(ring.free_slots(), 3);
    }

    #[test]
    fn rejects_other_event_types() {
        let mut ring = TransferRing::new(&HostDmaAllocator::default(), 4).unwrap();
        let event = TrbData::new(
            0,
            0,
            control_for_type(trb_types::COMMAND_COMPLETION_EVENT),
        );

        assert_eq!(
            process_transfer_event(&mut ring, &event),
            Err(CompletionError::UnexpectedTrbType(
                trb_types::COMMAND_COMPLETION_EVENT
            ))
        );
    }

    #[test]
    fn rejects_events_for_other_rings() {
        let allocator = HostDmaAllocator::default();
        let mut ring = TransferRing::new(&allocator, 4).unwrap();
        let other = TransferRing::new(&allocator, 4).unwrap();
        let event = event_for(&other, 0, CompletionCode::Success);

        assert_eq!(
            process_transfer_event(&mut ring, &event),
            Err(CompletionError::ForeignTrbPointer(other.phys_base()))
        );

        // The Link TRB is not a usable slot either.
        let link = TransferEvent::new(ring.phys_of(3), 0, CompletionCode::Success, 1, 1)
            .to_trb_data(CycleState::One);
        assert!(process_transfer_event(&mut ring, &link).is_err());
    }
}
