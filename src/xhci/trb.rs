//! Abstraction of the Transfer Request Block of a USB3 Host (XHCI) controller.
//!
//! The specification is available
//! [here](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::constants::{
    control::{
        CHAIN, CYCLE, ENDPOINT_ID_MASK, ENDPOINT_ID_SHIFT, SLOT_ID_MASK, SLOT_ID_SHIFT,
        TOGGLE_CYCLE, TYPE_MASK, TYPE_SHIFT,
    },
    status::{COMPLETION_CODE_SHIFT, TRANSFER_LENGTH_MASK},
    trb_types, TRB_SIZE,
};
use crate::dma::DmaBuffer;

/// The value of a cycle bit.
///
/// Producer and consumer each track the cycle state they expect. A TRB whose
/// cycle bit equals the consumer's cycle state is valid; everything else is
/// left over from the previous pass over the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// The cycle bit is clear.
    Zero,
    /// The cycle bit is set. Rings start in this state, so zeroed memory
    /// never looks valid.
    One,
}

impl CycleState {
    /// The other state.
    #[must_use]
    pub const fn toggled(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }

    /// Extract the cycle bit from a control dword.
    pub const fn from_control(control: u32) -> Self {
        if control & CYCLE != 0 {
            Self::One
        } else {
            Self::Zero
        }
    }

    /// The cycle bit as it is stored in a control dword.
    pub const fn control_bit(self) -> u32 {
        match self {
            Self::Zero => 0,
            Self::One => CYCLE,
        }
    }
}

impl From<bool> for CycleState {
    fn from(bit: bool) -> Self {
        if bit {
            Self::One
        } else {
            Self::Zero
        }
    }
}

/// A plain copy of the three fields of a TRB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrbData {
    /// Parameter field. A physical address for most TRB types.
    pub pointer: u64,
    /// Status field. Opaque to the rings.
    pub status: u32,
    /// Control field with type, flags and cycle bit.
    pub control: u32,
}

impl TrbData {
    /// Create TRB contents. The cycle bit in `control` is ignored when the
    /// TRB is placed on a ring.
    pub const fn new(pointer: u64, status: u32, control: u32) -> Self {
        Self {
            pointer,
            status,
            control,
        }
    }

    /// The TRB type.
    pub const fn trb_type(&self) -> u8 {
        ((self.control & TYPE_MASK) >> TYPE_SHIFT) as u8
    }

    /// The cycle bit.
    pub const fn cycle(&self) -> CycleState {
        CycleState::from_control(self.control)
    }

    /// Whether the next TRB belongs to the same Transfer Descriptor.
    pub const fn chain(&self) -> bool {
        self.control & CHAIN != 0
    }
}

/// Build the control dword for a TRB of the given type.
pub const fn control_for_type(trb_type: u8) -> u32 {
    ((trb_type as u32) << TYPE_SHIFT) & TYPE_MASK
}

/// A TRB in DMA memory.
///
/// The other side of a ring is hardware, so every field access is an atomic,
/// ordered memory operation. The compiler neither caches nor reorders them:
/// loads acquire and stores release. The control dword holds the cycle bit
/// and always goes last when a TRB is handed over, so the pointer and status
/// stores before it are visible first.
///
/// Values are stored little-endian as the controller expects them.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Trb {
    pointer: AtomicU64,
    status: AtomicU32,
    control: AtomicU32,
}

const _: () = assert!(size_of::<Trb>() == TRB_SIZE);

impl Trb {
    /// View the start of a DMA buffer as `count` TRBs.
    pub(crate) fn slice_from_buffer(buffer: &DmaBuffer, count: usize) -> &[Self] {
        // SAFETY: Trb consists only of atomics, which can be shared with a
        // device that writes concurrently.
        unsafe { buffer.as_slice(count) }
    }

    /// Read the parameter field.
    pub fn pointer(&self) -> u64 {
        u64::from_le(self.pointer.load(Ordering::Acquire))
    }

    /// Read the status field.
    pub fn status(&self) -> u32 {
        u32::from_le(self.status.load(Ordering::Acquire))
    }

    /// Read the control field.
    pub fn control(&self) -> u32 {
        u32::from_le(self.control.load(Ordering::Acquire))
    }

    /// Write the parameter field.
    pub fn set_pointer(&self, pointer: u64) {
        self.pointer.store(pointer.to_le(), Ordering::Release);
    }

    /// Write the status field.
    pub fn set_status(&self, status: u32) {
        self.status.store(status.to_le(), Ordering::Release);
    }

    /// Write the control field.
    ///
    /// If the cycle bit in `control` matches the consumer's cycle state, this
    /// write hands the TRB over.
    pub fn set_control(&self, control: u32) {
        self.control.store(control.to_le(), Ordering::Release);
    }

    /// The TRB type.
    pub fn trb_type(&self) -> u8 {
        ((self.control() & TYPE_MASK) >> TYPE_SHIFT) as u8
    }

    /// Returns true for Link TRBs.
    pub fn is_link(&self) -> bool {
        self.trb_type() == trb_types::LINK
    }

    /// The cycle bit.
    pub fn cycle(&self) -> CycleState {
        CycleState::from_control(self.control())
    }

    /// Read all three fields.
    ///
    /// The control field is read first. Once its cycle bit says the TRB is
    /// valid, the other fields are guaranteed to be up to date.
    pub fn snapshot(&self) -> TrbData {
        let control = self.control();

        TrbData {
            pointer: self.pointer(),
            status: self.status(),
            control,
        }
    }

    /// Write new contents without handing the TRB over yet.
    ///
    /// The cycle bit is set to the opposite of `producer_cycle_state`, so the
    /// consumer keeps ignoring the TRB until [`Trb::arm`] is called.
    pub fn stage(&self, data: TrbData, producer_cycle_state: CycleState) {
        self.set_pointer(data.pointer);
        self.set_status(data.status);
        self.set_control((data.control & !CYCLE) | producer_cycle_state.toggled().control_bit());
    }

    /// Hand the TRB over to the consumer.
    ///
    /// Sets the cycle bit to `cycle_state` in one ordered store to the control
    /// field. Pointer and status must already be written. Returns the control
    /// field as it was before arming.
    pub fn arm(&self, cycle_state: CycleState) -> u32 {
        let control = self.control();

        self.set_control((control & !CYCLE) | cycle_state.control_bit());

        control
    }

    /// Turn this TRB into a Link TRB to `target` with Toggle Cycle set.
    ///
    /// The cycle bit stays clear, so the Link TRB is not valid before the
    /// producer reaches it.
    pub fn write_link(&self, target: u64) {
        self.set_pointer(target);
        self.set_status(0);
        self.set_control(control_for_type(trb_types::LINK) | TOGGLE_CYCLE);
    }

    /// Zero all fields. The control field goes last.
    pub fn clear(&self) {
        self.set_pointer(0);
        self.set_status(0);
        self.set_control(0);
    }
}

/// Encodes the completion code that event TRBs contain.
///
/// The names follow Table 6-90 of the XHCI specification.
#[allow(dead_code, missing_docs)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompletionCode {
    Invalid = 0,
    Success,
    DataBufferError,
    BabbleDetectedError,
    UsbTransactionError,
    TrbError,
    StallError,
    ResourceError,
    BandwidthError,
    NoSlotsAvailableError,
    InvalidStreamTypeError,
    SlotNotEnabledError,
    EndpointNotEnabledError,
    ShortPacket,
    RingUnderrun,
    RingOverrun,
    VfEventRingFullError,
    ParameterError,
    BandwidthOverrunError,
    ContextStateError,
    NoPingResponseError,
    EventRingFullError,
    IncompatibleDeviceError,
    MissedServiceError,
    CommandRingStopped,
    CommandAborted,
    Stopped,
    StoppedLengthInvalid,
    StoppedShortedPacket,
    MaxExitLatencyTooLargeError,
    Reserved,
    IsochBufferOverrun,
    EventLostError,
    UndefinedError,
    InvalidStreamIdError,
    SecondaryBandwidthError,
    SplitTransactionError,
}

/// A Transfer Event TRB as the controller places it on the Event Ring.
///
/// The XHCI spec describes this structure in Section 6.4.2.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    /// Physical address of the TRB that generated this event.
    pub trb_pointer: u64,
    /// Residual number of bytes not transferred. A 24-bit value.
    pub trb_transfer_length: u32,
    /// Completion status of the transfer.
    pub completion_code: u8,
    /// The endpoint (Device Context Index) the transfer ran on.
    pub endpoint_id: u8,
    /// The slot of the device the transfer ran on.
    pub slot_id: u8,
}

impl TransferEvent {
    /// Create a new Transfer Event.
    ///
    /// # Parameters
    ///
    /// - `trb_pointer`: address of the TRB that generated this event. TRBs
    ///   are 16-byte-aligned, so the lowest four bit have to be 0.
    /// - `trb_transfer_length`: residual length, a 24-bit value.
    /// - `completion_code`: outcome of the transfer.
    /// - `endpoint_id`: a 5-bit Device Context Index.
    /// - `slot_id`: the slot the endpoint belongs to.
    pub fn new(
        trb_pointer: u64,
        trb_transfer_length: u32,
        completion_code: CompletionCode,
        endpoint_id: u8,
        slot_id: u8,
    ) -> Self {
        assert_eq!(
            0,
            trb_pointer & 0x0f,
            "trb_pointer has to be 16-byte-aligned."
        );
        assert_eq!(
            0,
            trb_transfer_length & !TRANSFER_LENGTH_MASK,
            "trb_transfer_length has to be a 24-bit value."
        );
        assert!(endpoint_id < 32, "endpoint_id has to be a 5-bit value.");

        Self {
            trb_pointer,
            trb_transfer_length,
            completion_code: completion_code as u8,
            endpoint_id,
            slot_id,
        }
    }

    /// Decode a Transfer Event. Returns `None` for other TRB types.
    pub const fn parse(data: &TrbData) -> Option<Self> {
        if data.trb_type() != trb_types::TRANSFER_EVENT {
            return None;
        }

        Some(Self {
            trb_pointer: data.pointer,
            trb_transfer_length: data.status & TRANSFER_LENGTH_MASK,
            completion_code: (data.status >> COMPLETION_CODE_SHIFT) as u8,
            endpoint_id: ((data.control & ENDPOINT_ID_MASK) >> ENDPOINT_ID_SHIFT) as u8,
            slot_id: ((data.control & SLOT_ID_MASK) >> SLOT_ID_SHIFT) as u8,
        })
    }

    /// Generate the TRB contents.
    ///
    /// The cycle bit's value does not depend on the event but on the ring
    /// that the TRB will be placed on.
    pub fn to_trb_data(&self, cycle_state: CycleState) -> TrbData {
        TrbData {
            pointer: self.trb_pointer,
            status: self.trb_transfer_length
                | (u32::from(self.completion_code) << COMPLETION_CODE_SHIFT),
            control: control_for_type(trb_types::TRANSFER_EVENT)
                | (u32::from(self.endpoint_id) << ENDPOINT_ID_SHIFT)
                | (u32::from(self.slot_id) << SLOT_ID_SHIFT)
                | cycle_state.control_bit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaAllocator, DmaFlags, HostDmaAllocator};

    #[test]
    fn cycle_state_toggles() {
        assert_eq!(CycleState::One.toggled(), CycleState::Zero);
        assert_eq!(CycleState::Zero.toggled(), CycleState::One);
        assert_eq!(CycleState::from_control(0xffff_fffe), CycleState::Zero);
        assert_eq!(CycleState::from_control(CYCLE), CycleState::One);
        assert_eq!(CycleState::from(true).control_bit(), CYCLE);
    }

    #[test]
    fn fields_are_stored_little_endian_at_hardware_offsets() {
        let allocator = HostDmaAllocator::default();
        let memory = allocator.physical_memory();
        let buffer = allocator
            .allocate(TRB_SIZE, DmaFlags::RING_READ_WRITE)
            .unwrap();
        let trb = &Trb::slice_from_buffer(&buffer, 1)[0];

        trb.set_pointer(0x1122_3344_5566_7788);
        trb.set_status(0x99aa_bbcc);
        trb.set_control(0xddee_ff00);

        let base = buffer.phys_base();
        assert_eq!(memory.read_u64(base), 0x1122_3344_5566_7788);
        assert_eq!(memory.read_u32(base + 8), 0x99aa_bbcc);
        assert_eq!(memory.read_u32(base + 12), 0xddee_ff00);

        trb.clear();
        assert_eq!(trb.snapshot(), TrbData::default());
    }

    #[test]
    fn stage_then_arm_hands_over_with_the_right_cycle_bit() {
        let trb = Trb::default();
        let data = TrbData::new(0x1000, 8, control_for_type(trb_types::NORMAL) | CHAIN | CYCLE);

        trb.stage(data, CycleState::One);
        assert_eq!(trb.cycle(), CycleState::Zero);
        assert_eq!(trb.pointer(), 0x1000);
        assert_eq!(trb.status(), 8);

        let before = trb.arm(CycleState::One);
        assert_eq!(before & CHAIN, CHAIN);
        assert_eq!(trb.cycle(), CycleState::One);
        assert_eq!(trb.trb_type(), trb_types::NORMAL);

        // On the next pass the producer cycle state is Zero, so the stale
        // cycle bit has to be flipped, not just left alone.
        trb.stage(data, CycleState::Zero);
        assert_eq!(trb.cycle(), CycleState::One);
        trb.arm(CycleState::Zero);
        assert_eq!(trb.cycle(), CycleState::Zero);
    }

    #[test]
    fn link_trb_is_not_valid_until_armed() {
        let trb = Trb::default();

        trb.write_link(0x8000_0000);

        assert!(trb.is_link());
        assert_eq!(trb.pointer(), 0x8000_0000);
        assert_eq!(trb.cycle(), CycleState::Zero);
        assert_eq!(trb.control() & TOGGLE_CYCLE, TOGGLE_CYCLE);
    }

    #[test]
    fn transfer_event_layout() {
        let event = TransferEvent::new(0x8000_0020, 0x12, CompletionCode::ShortPacket, 3, 1);
        let data = event.to_trb_data(CycleState::One);

        assert_eq!(data.pointer, 0x8000_0020);
        assert_eq!(data.status, 0x0d00_0012);
        assert_eq!(data.control, 0x0103_8001);
        assert_eq!(data.trb_type(), trb_types::TRANSFER_EVENT);
        assert_eq!(TransferEvent::parse(&data), Some(event));
    }

    #[test]
    fn parse_ignores_other_trb_types() {
        let data = TrbData::new(0, 0, control_for_type(trb_types::PORT_STATUS_CHANGE_EVENT));

        assert_eq!(TransferEvent::parse(&data), None);
    }

    #[test]
    #[should_panic(expected = "16-byte-aligned")]
    fn transfer_event_requires_aligned_pointer() {
        TransferEvent::new(0x8000_0004, 0, CompletionCode::Success, 1, 1);
    }
}
