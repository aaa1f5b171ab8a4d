//! Opaque entity references used throughout the MIR container.
//!
//! Instructions reference blocks and virtual registers by small `u32`
//! handles rather than by pointer. This keeps positions cheap to copy and
//! lets the block list live in an arena that can be indexed instead of
//! walked, which is what makes block splitting in the jump resolver
//! affordable.

use cranelift_entity::entity_impl;

/// A 64-bit guest program counter.
pub type GuestAddr = u64;

/// Guest address used to mean "no reservation" / "not a real target".
pub const NULL_GUEST_ADDR: GuestAddr = 0;

/// A basic block in the MIR being built for the region.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque virtual register allocation id.
///
/// General-purpose and SIMD virtual registers are allocated from the same
/// id space (the MIR container hands out one counter), but callers never
/// see a bare `VReg` outside of this module: [`GpReg`] and [`SimdReg`] wrap
/// it so a general-purpose value can't be passed where a SIMD value is
/// expected, and vice versa.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u32);
entity_impl!(VReg, "v");

/// A general-purpose virtual register.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct GpReg(pub VReg);

/// A SIMD/FP virtual register, holding a NaN-boxed value when it carries a
/// single-precision result.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct SimdReg(pub VReg);

/// Index of a RISC-V general-purpose register (`x0`..`x31`).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct GprIndex(pub u8);

impl GprIndex {
    pub const ZERO: GprIndex = GprIndex(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// Index of a RISC-V floating point register (`f0`..`f31`).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct FprIndex(pub u8);
