//! # XHCI Ring Constants
//!
//! This module collects the bit layouts the ring core depends on. All
//! definitions are derived from the XHCI specification, mostly Section 6.4
//! (TRBs) and Section 6.5 (Event Ring Segment Table).

// Allow missing docs to avoid duplicating the XHCI spec for all constants.
#![allow(missing_docs)]

/// The size of a single TRB in bytes.
pub const TRB_SIZE: usize = 16;

/// TRB type codes as stored in the type field of the control dword.
pub mod trb_types {
    pub const NORMAL: u8 = 1;
    pub const LINK: u8 = 6;
    pub const NO_OP: u8 = 8;
    pub const TRANSFER_EVENT: u8 = 32;
    pub const COMMAND_COMPLETION_EVENT: u8 = 33;
    pub const PORT_STATUS_CHANGE_EVENT: u8 = 34;
}

/// Bits of the control dword (offset 12) of a TRB.
pub mod control {
    /// Cycle bit. Marks the TRB as valid for the consumer.
    pub const CYCLE: u32 = 1 << 0;
    /// Toggle Cycle. Only meaningful in Link TRBs.
    pub const TOGGLE_CYCLE: u32 = 1 << 1;
    /// Chain bit. The next TRB belongs to the same Transfer Descriptor.
    pub const CHAIN: u32 = 1 << 4;
    /// Interrupt On Completion.
    pub const IOC: u32 = 1 << 5;

    pub const TYPE_SHIFT: u32 = 10;
    pub const TYPE_MASK: u32 = 0x3f << TYPE_SHIFT;

    pub const ENDPOINT_ID_SHIFT: u32 = 16;
    pub const ENDPOINT_ID_MASK: u32 = 0x1f << ENDPOINT_ID_SHIFT;

    pub const SLOT_ID_SHIFT: u32 = 24;
    pub const SLOT_ID_MASK: u32 = 0xff << SLOT_ID_SHIFT;
}

/// Bits of the status dword (offset 8) of event TRBs.
pub mod status {
    pub const TRANSFER_LENGTH_MASK: u32 = 0x00ff_ffff;
    pub const COMPLETION_CODE_SHIFT: u32 = 24;
}

/// Constants for the Event Ring.
pub mod event_ring {
    /// The size of an Event Ring Segment Table Entry in bytes.
    pub const SEGMENT_TABLE_ENTRY_SIZE: usize = 16;

    /// The Event Ring Segment Table has to be 64-byte aligned.
    pub const SEGMENT_TABLE_ALIGNMENT: u64 = 64;

    /// Offsets of the fields of a segment table entry.
    pub mod segments_table_entry_offsets {
        pub const BASE_ADDR: u64 = 0x0;
        pub const SIZE: u64 = 0x8;
    }
}

/// Constants for the TR Dequeue Pointer field of an Endpoint Context.
pub mod endpoint_context {
    /// Dequeue Cycle State, stored in bit 0 next to the pointer.
    pub const DEQUEUE_CYCLE_STATE: u64 = 0x1;
    pub const DEQUEUE_POINTER_MASK: u64 = !0xf;
}
