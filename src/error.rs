//! The one error surface this crate exposes to a driver.
//!
//! Guest-code conditions (an unsupported instruction, a runtime memory
//! fault) are not errors in this crate's sense: they are reported through
//! [`crate::region::RegionBuilder::success`] and ordinary MIR, per the
//! failure semantics in the region builder's own documentation. A
//! `RegionError` exists only for driver misuse that would otherwise corrupt
//! this crate's own bookkeeping.

use crate::entities::GuestAddr;

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionError {
    /// `start_insn` was called with a PC at or before the one the previous
    /// call recorded. The decode stream driving one region must be
    /// strictly increasing; a region that wants to revisit an earlier
    /// address belongs in a fresh `RegionBuilder`, not a rewound PC on this
    /// one.
    #[error("start_insn called with pc {pc:#x}, which does not advance past {previous:#x}")]
    NonMonotonicPc { previous: GuestAddr, pc: GuestAddr },
}
