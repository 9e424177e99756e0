//! Push transfers through a Transfer Ring, let the emulated controller
//! consume them, and reclaim the slots from the Event Ring.

use anyhow::{bail, ensure, Context, Result};
use tracing::{debug, trace};

use xhci_rings::{
    dma::{DmaAllocator, DmaBuffer, DmaFlags, HostDmaAllocator},
    xhci::{
        completion::process_transfer_event,
        constants::{
            control::{CHAIN, IOC},
            trb_types,
        },
        emulator::Controller,
        event_ring::{EventRing, SegmentTable},
        transfer_ring::TransferRing,
        trb::{control_for_type, TrbData},
    },
};

/// The endpoint the workload runs on (EP 1 OUT).
const ENDPOINT_ID: u8 = 2;

/// The device slot the endpoint belongs to.
const SLOT_ID: u8 = 1;

/// The number of bytes each TRB transfers.
const TRB_TRANSFER_LENGTH: u32 = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadConfig {
    pub transfer_ring_size: usize,
    pub event_ring_size: usize,
    pub transfers: u64,
    pub trbs_per_transfer: usize,
    pub iova_base: u64,
    pub dma_budget: Option<u64>,
}

/// What a finished run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub transfers: u64,
    pub trbs: u64,
    pub events: u64,
    pub doorbells: u64,
    pub transfer_ring_wraps: u64,
}

#[derive(Debug)]
pub struct Workload {
    config: WorkloadConfig,
    transfer_ring: TransferRing,
    event_ring: EventRing,
    /// Referenced by the controller via ERSTBA, has to stay alive.
    _segment_table: SegmentTable,
    /// Source of the data pointers in the TRBs.
    data_buffer: DmaBuffer,
    controller: Controller,
}

impl Workload {
    pub fn new(config: WorkloadConfig) -> Result<Self> {
        ensure!(
            config.trbs_per_transfer < config.transfer_ring_size,
            "a transfer of {} TRBs does not fit into a transfer ring of {} TRBs",
            config.trbs_per_transfer,
            config.transfer_ring_size
        );

        let allocator = HostDmaAllocator::new(config.iova_base, config.dma_budget);

        let segment_table =
            SegmentTable::new(&allocator, 1).context("Failed to allocate segment table")?;
        let event_ring = EventRing::new(&allocator, config.event_ring_size, segment_table.entry(0))
            .context("Failed to allocate event ring")?;
        let transfer_ring = TransferRing::new(&allocator, config.transfer_ring_size)
            .context("Failed to allocate transfer ring")?;
        let data_buffer = allocator
            .allocate(
                config.trbs_per_transfer * TRB_TRANSFER_LENGTH as usize,
                DmaFlags::RING_READ_WRITE,
            )
            .context("Failed to allocate data buffer")?;

        let mut controller = Controller::new(allocator.physical_memory(), SLOT_ID);
        controller.configure_event_ring(segment_table.phys_base());
        controller.update_event_ring_dequeue_pointer(event_ring.dequeue_pointer_phys());
        controller.configure_endpoint(ENDPOINT_ID, transfer_ring.endpoint_dequeue_pointer());

        debug!("workload set up: {:?}", config);

        Ok(Self {
            config,
            transfer_ring,
            event_ring,
            _segment_table: segment_table,
            data_buffer,
            controller,
        })
    }

    /// Place one transfer on the ring, if it fits.
    fn submit(&mut self) -> Option<u64> {
        let trbs = self.config.trbs_per_transfer;

        if self.transfer_ring.free_slots() < trbs {
            return None;
        }

        let mut wraps = 0;
        for i in 0..trbs {
            let last = i + 1 == trbs;
            let control = control_for_type(trb_types::NORMAL) | if last { IOC } else { CHAIN };
            let pointer =
                self.data_buffer.phys_base() + (i as u64) * u64::from(TRB_TRANSFER_LENGTH);

            let cycle_state = self.transfer_ring.cycle_state();
            let slot = self
                .transfer_ring
                .enqueue(TrbData::new(pointer, TRB_TRANSFER_LENGTH, control));
            if self.transfer_ring.cycle_state() != cycle_state {
                wraps += 1;
            }

            trace!("submitted TRB {}/{} in slot {}", i + 1, trbs, slot);
        }

        Some(wraps)
    }

    /// Drain the Event Ring and reclaim transfer ring slots.
    fn drain_events(&mut self) -> Result<u64> {
        let mut events = 0;

        while let Some(event) = self.event_ring.pop() {
            let completion = process_transfer_event(&mut self.transfer_ring, &event)
                .context("Failed to process event")?;

            if !completion.is_success() {
                bail!(
                    "transfer in slot {} failed with completion code {}",
                    completion.slot,
                    completion.completion_code
                );
            }
            events += 1;
        }

        self.controller
            .update_event_ring_dequeue_pointer(self.event_ring.dequeue_pointer_phys());

        Ok(events)
    }

    pub fn run(mut self) -> Result<Summary> {
        let mut summary = Summary::default();
        let mut submitted = 0;

        while summary.events < self.config.transfers {
            let mut progress = false;

            while submitted < self.config.transfers {
                let Some(wraps) = self.submit() else {
                    break;
                };
                submitted += 1;
                summary.transfer_ring_wraps += wraps;
                progress = true;
            }

            let consumed = self.controller.ring_doorbell(ENDPOINT_ID);
            summary.doorbells += 1;
            summary.trbs += consumed as u64;

            let events = self.drain_events()?;
            summary.events += events;

            debug!(
                "round {}: {} TRBs consumed, {} events, {} free slots",
                summary.doorbells,
                consumed,
                events,
                self.transfer_ring.free_slots()
            );

            if !progress && consumed == 0 && events == 0 {
                bail!(
                    "rings stalled after {} of {} transfers",
                    summary.events,
                    self.config.transfers
                );
            }
        }

        summary.transfers = submitted;

        let transfer_ring = self.transfer_ring.phys_base();
        let event_ring = self.event_ring.phys_base();
        self.transfer_ring.release();
        self.event_ring.release();
        debug!(
            "released transfer ring {:#x} and event ring {:#x}",
            transfer_ring, event_ring
        );

        Ok(summary)
    }
}
