//! The MIR container: an arena of basic blocks, each an append-only vector
//! of [`MirInst`], with explicit successor/predecessor edges.
//!
//! This plays the role of the MIR builder: it owns block and
//! virtual-register allocation, and it is the only thing that mutates the
//! instruction lists. The region builder and jump resolver are both clients
//! of this module; neither reaches into a block's instruction vector
//! directly.
//!
//! Positions into this container are `(Block, usize)` pairs rather than
//! real iterators, per the indexed-handle approach the design notes
//! recommend over raw pointers into a linked list: an index is stable
//! across appends to the *same* block, and [`MirFunction::split_block`]
//! is the only operation that can move an instruction to a different
//! block, which it does by explicit bookkeeping rather than leaving a
//! dangling handle.

use cranelift_entity::{EntityRef, PrimaryMap};
use smallvec::SmallVec;

use crate::entities::{Block, GuestAddr, VReg};
use crate::pseudo::{AluOp, Cond, Extend, HostHelper, MemSize, PseudoJumpKind, ShiftOp, Width};

/// One MIR instruction.
///
/// This is intentionally flatter than a real backend's instruction set:
/// register classes, addressing modes and opcodes that a real backend
/// would treat separately are collapsed into single variants here. What matters for this
/// front end is that every variant correctly reports whether it is a
/// control transfer (see [`MirFunction::is_control_transfer`]), since that
/// fact drives block termination and the jump resolver.
#[derive(Clone, Debug)]
pub enum MirInst {
    /// Load a sign-extended 32-bit immediate (or the zero-extended
    /// materialization of a smaller one) into `dst`.
    LoadImm { dst: VReg, imm: i64 },
    /// Copy `src` into `dst`. Used to materialize operands the host ISA
    /// can't destructively reuse, and to implement guest register reads.
    Move { dst: VReg, src: VReg },
    /// `dst <- lhs op rhs`, one virtual register per operand.
    AluReg {
        op: AluOp,
        width: Width,
        dst: VReg,
        lhs: VReg,
        rhs: VReg,
    },
    /// `dst <- lhs op imm`.
    AluImm {
        op: AluOp,
        width: Width,
        dst: VReg,
        lhs: VReg,
        imm: i64,
    },
    /// `dst <- lhs shift_op imm`. Register-amount shifts go through
    /// [`MirInst::AluReg`] instead (`Sll`/`Srl`/`Sra` are ordinary
    /// register-register ALU opcodes in RISC-V).
    ShiftImm {
        op: ShiftOp,
        width: Width,
        dst: VReg,
        lhs: VReg,
        imm: u32,
    },
    /// `dst <- imm << 12` (LUI).
    Lui { dst: VReg, imm: i32 },
    /// `dst <- current_pc + (imm << 12)` (AUIPC).
    Auipc { dst: VReg, pc: GuestAddr, imm: i32 },
    /// Load from `base + offset [+ index]` into `dst`.
    Load {
        dst: VReg,
        base: VReg,
        index: Option<VReg>,
        offset: i32,
        size: MemSize,
        extend: Extend,
        /// The recovery block this load's fault diverts to.
        recovery: Block,
    },
    /// Store `src` to `base + offset [+ index]`.
    Store {
        src: VReg,
        base: VReg,
        index: Option<VReg>,
        offset: i32,
        size: MemSize,
        recovery: Block,
    },
    /// Compare `lhs` against `rhs` and latch the host condition flags.
    Cmp { flags: VReg, lhs: VReg, rhs: VReg },
    /// Read the per-thread state structure at a constant byte offset.
    /// Backs `GetReg`/`GetFpReg`/the reservation-protocol bookkeeping: the
    /// thread-state base is an ABI-fixed register, not a virtual one, so
    /// it has no operand here.
    LoadThreadState { dst: VReg, offset: i32 },
    /// Write `src` to the per-thread state structure at a constant byte
    /// offset.
    StoreThreadState { src: VReg, offset: i32 },
    /// Call a runtime helper the generated code links against.
    ///
    /// `size` carries the access width for helpers that touch guest memory
    /// at a width narrower than a full register (`LockedCmpxchg`'s 32-bit
    /// `sc.w` case); helpers with no memory width of their own (`SetOwner`,
    /// `TryLock`, `Unlock`) always pass `None`, the same way `Load`/`Store`
    /// always carry a `size` but a plain `Move` never does.
    HostCall {
        helper: HostHelper,
        args: SmallVec<[VReg; 3]>,
        result: Option<VReg>,
        size: Option<MemSize>,
    },

    // --- terminators -----------------------------------------------------
    /// Unconditional branch to an already-known MIR block (never a raw
    /// guest address). Emitted by the region entry preamble and by the
    /// jump resolver once it links a pseudo-jump locally.
    Jump(Block),
    /// Conditional branch on the flags register set by the most recent
    /// `Cmp`.
    CondBranch {
        cond: Cond,
        flags: VReg,
        then_block: Block,
        else_block: Block,
    },
    /// A direct control transfer to a guest address, not yet known to be
    /// local. Every occurrence has a branch-targets table entry for
    /// `target` (possibly pending).
    PseudoJump {
        kind: PseudoJumpKind,
        target: GuestAddr,
    },
    /// An indirect control transfer computed at runtime; always a
    /// dispatcher exit.
    IndirectJump { target: VReg },
    /// The pending-signals check the resolver inserts on a linked back
    /// edge: `pending_signals_status == kPendingSignalsPresent` routes to
    /// `exit_block`, otherwise falls through to `local_block`.
    CondBranchPendingSignal {
        exit_block: Block,
        local_block: Block,
    },
}

#[derive(Clone, Default)]
struct BlockData {
    insts: Vec<MirInst>,
    preds: SmallVec<[Block; 4]>,
    succs: SmallVec<[Block; 2]>,
    recovery: bool,
}

/// Owns every block and virtual register allocated while building one
/// translation region.
#[derive(Default)]
pub struct MirFunction {
    blocks: PrimaryMap<Block, BlockData>,
    /// Blocks in creation order. The region builder only ever creates
    /// blocks it is about to fill, and the jump resolver appends to this
    /// same order when it splits blocks, so iterating it is always a safe
    /// "every block, including ones created mid-pass" walk.
    order: Vec<Block>,
    next_vreg: u32,
}

impl MirFunction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh virtual register id.
    pub fn alloc_vreg(&mut self) -> VReg {
        let v = VReg::new(self.next_vreg as usize);
        self.next_vreg += 1;
        v
    }

    /// Create a new, empty block and append it to the block order.
    pub fn new_block(&mut self) -> Block {
        let block = self.blocks.push(BlockData::default());
        self.order.push(block);
        block
    }

    /// Mark `block` as reachable only via a fault handler. Recovery blocks
    /// are never rewritten by the jump resolver.
    pub fn mark_recovery(&mut self, block: Block) {
        self.blocks[block].recovery = true;
    }

    pub fn is_recovery(&self, block: Block) -> bool {
        self.blocks[block].recovery
    }

    /// Append an instruction to the end of `block`. Returns the index it
    /// was appended at (its position, before any later split moves it).
    pub fn append(&mut self, block: Block, inst: MirInst) -> usize {
        if let Some(target) = inst.successors() {
            for succ in target {
                self.add_edge(block, succ);
            }
        }
        let data = &mut self.blocks[block];
        data.insts.push(inst);
        data.insts.len() - 1
    }

    /// Add a CFG edge without touching any instruction list. Used for the
    /// region entry preamble and by the jump resolver when it links a
    /// pseudo-jump to a block directly (no new terminator carries the
    /// edge implicitly in that case, since the target block already
    /// existed).
    pub fn add_edge(&mut self, from: Block, to: Block) {
        if !self.blocks[from].succs.contains(&to) {
            self.blocks[from].succs.push(to);
        }
        if !self.blocks[to].preds.contains(&from) {
            self.blocks[to].preds.push(from);
        }
    }

    pub fn predecessors(&self, block: Block) -> &[Block] {
        &self.blocks[block].preds
    }

    pub fn successors(&self, block: Block) -> &[Block] {
        &self.blocks[block].succs
    }

    pub fn block_len(&self, block: Block) -> usize {
        self.blocks[block].insts.len()
    }

    pub fn block_insts(&self, block: Block) -> &[MirInst] {
        &self.blocks[block].insts
    }

    pub fn inst(&self, block: Block, idx: usize) -> &MirInst {
        &self.blocks[block].insts[idx]
    }

    pub fn block_count(&self) -> usize {
        self.order.len()
    }

    /// Block at position `i` in creation order. The jump resolver walks
    /// the block list by index rather than holding an iterator so that
    /// blocks it creates mid-pass (splits, pending-signal exit blocks)
    /// are picked up by re-checking `block_count()` each step.
    pub fn block_order_at(&self, i: usize) -> Option<Block> {
        self.order.get(i).copied()
    }

    /// A non-empty block's last instruction is a control transfer: either
    /// nothing has been appended yet (caller must still close it), or the
    /// last instruction terminates the block.
    pub fn needs_terminator(&self, block: Block) -> bool {
        match self.blocks[block].insts.last() {
            None => true,
            Some(inst) => !Self::is_control_transfer(inst),
        }
    }

    pub fn is_control_transfer(inst: &MirInst) -> bool {
        matches!(
            inst,
            MirInst::Jump(_)
                | MirInst::CondBranch { .. }
                | MirInst::PseudoJump { .. }
                | MirInst::IndirectJump { .. }
                | MirInst::CondBranchPendingSignal { .. }
        )
    }

    /// Overwrite the terminator of `block` in place. The caller is
    /// responsible for updating CFG edges to match; this never does
    /// erase-and-insert, which would invalidate any other branch-targets
    /// entry that (unusually) still points at this same slot.
    pub fn set_terminator(&mut self, block: Block, inst: MirInst) {
        let data = &mut self.blocks[block];
        let last = data
            .insts
            .last_mut()
            .expect("set_terminator called on an empty block");
        debug_assert!(Self::is_control_transfer(last));
        *last = inst;
    }

    /// Split `block` immediately before index `at`: `block` keeps
    /// `insts[..at]` and gains a fresh `Jump` terminator to the returned
    /// block, which gets `insts[at..]` (including whatever terminator and
    /// outgoing edges `block` used to have).
    ///
    /// Returns `(block, new_block)` so callers can tell which half kept
    /// the original identity.
    pub fn split_block(&mut self, block: Block, at: usize) -> (Block, Block) {
        debug_assert!(!self.blocks[block].recovery, "recovery blocks never split");
        let new_block = self.blocks.push(BlockData::default());
        self.order.push(new_block);

        let moved_insts = self.blocks[block].insts.split_off(at);
        let moved_succs = core::mem::take(&mut self.blocks[block].succs);

        for succ in &moved_succs {
            if let Some(pos) = self.blocks[*succ].preds.iter().position(|p| *p == block) {
                self.blocks[*succ].preds[pos] = new_block;
            }
        }

        self.blocks[new_block].insts = moved_insts;
        self.blocks[new_block].succs = moved_succs;
        self.blocks[new_block].preds.push(block);

        self.blocks[block].insts.push(MirInst::Jump(new_block));
        self.blocks[block].succs.push(new_block);

        (block, new_block)
    }
}

impl MirInst {
    /// Local MIR-block successors an instruction implies, for edges that
    /// should be added the moment the instruction is appended (entry
    /// preamble, conditional branches, memory recovery plumbing). Direct
    /// and indirect pseudo-jumps are deliberately excluded: their
    /// successor, if any, is only known once the jump resolver runs.
    fn successors(&self) -> Option<SmallVec<[Block; 2]>> {
        match self {
            MirInst::Jump(b) => Some(SmallVec::from_slice(&[*b])),
            MirInst::CondBranch {
                then_block,
                else_block,
                ..
            } => Some(SmallVec::from_slice(&[*then_block, *else_block])),
            MirInst::CondBranchPendingSignal {
                exit_block,
                local_block,
            } => Some(SmallVec::from_slice(&[*exit_block, *local_block])),
            _ => None,
        }
    }
}
