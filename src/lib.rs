//! # XHCI Ring Core
//!
//! This crate implements the producer/consumer rings that software and a USB3
//! host (XHCI) controller use to exchange Transfer Request Blocks (TRBs). The
//! rings live in DMA memory that both sides access without any lock; the only
//! synchronization is the cycle bit in every TRB and the order in which the
//! fields of a TRB become visible.
//!
//! The crate is split in two parts:
//!
//! - [`dma`] describes the DMA allocator boundary and ships an mmap-backed
//!   allocator for running without real hardware.
//! - [`xhci`] contains the TRB layout, the Transfer and Event Rings,
//!   completion processing and a software model of the controller's side of
//!   the rings.

#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

pub mod dma;
pub mod xhci;
