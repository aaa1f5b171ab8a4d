//! The region builder: the `InstructionSink` implementation that turns a
//! sequence of semantics callbacks into MIR, plus the driver contract
//! (`StartInsn`, `IsRegionEndReached`, `Finalize`) a decoder loop drives it
//! with.
//!
//! This is the piece the rest of the crate exists to support: [`crate::mir`]
//! gives it a place to put instructions, [`crate::position`] gives it
//! somewhere to remember guest addresses, and [`crate::resolver`] is what
//! `finalize` hands off to once decoding stops.

use crate::entities::{Block, GpReg, GprIndex, FprIndex, GuestAddr, SimdReg};
use crate::error::RegionError;
use crate::mir::{MirFunction, MirInst};
use crate::position::{BranchTargets, Position};
use crate::pseudo::{AluOp, BranchOp, Extend, HostHelper, MemSize, PseudoJumpKind, ShiftOp, Width};
use crate::resolver;
use crate::semantics::InstructionSink;
use crate::thread_state::{ThreadStateLayout, NO_RESERVATION};

/// Tunables that change how a region is built, independent of guest
/// semantics.
#[derive(Copy, Clone, Debug)]
pub struct RegionConfig {
    /// When false, the jump resolver is skipped entirely: every pseudo-jump
    /// is left as a dispatcher exit. Useful for isolating a miscompile to
    /// either decode or linking.
    pub link_jumps_within_region: bool,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            link_jumps_within_region: true,
        }
    }
}

/// Builds the MIR for one translation region, one guest instruction at a
/// time.
///
/// The driver contract is: call [`RegionBuilder::start_insn`] before
/// decoding each guest instruction, call the matching [`InstructionSink`]
/// method(s) for it, check [`RegionBuilder::is_region_end_reached`] after
/// each one, and call [`RegionBuilder::finalize`] once decoding stops.
pub struct RegionBuilder<'a> {
    mir: &'a mut MirFunction,
    targets: BranchTargets,
    layout: ThreadStateLayout,
    config: RegionConfig,
    pc: GuestAddr,
    current_block: Block,
    /// Per-region scratch register for condition flags. Every `Cmp` and
    /// every branch that reads it uses this same virtual register; nothing
    /// in this crate's output needs more than one flags value live at once.
    flags: GpReg,
    unconditional_branch_emitted: bool,
    success: bool,
    last_start_pc: Option<GuestAddr>,
}

impl<'a> RegionBuilder<'a> {
    /// Builds into `mir`, an arena the caller owns and may already hold
    /// blocks from an earlier region -- this builder only ever appends.
    pub fn new(mir: &'a mut MirFunction, start_pc: GuestAddr, config: RegionConfig) -> Self {
        let flags = GpReg(mir.alloc_vreg());
        let entry = mir.new_block();
        let continuation = mir.new_block();
        mir.append(entry, MirInst::Jump(continuation));
        log::debug!("new region at pc {start_pc:#x}");

        Self {
            mir,
            targets: BranchTargets::new(),
            layout: ThreadStateLayout::default(),
            config,
            pc: start_pc,
            current_block: continuation,
            flags,
            unconditional_branch_emitted: false,
            success: true,
            last_start_pc: None,
        }
    }

    pub fn current_pc(&self) -> GuestAddr {
        self.pc
    }

    pub fn advance_pc(&mut self, insn_len: u64) {
        self.pc += insn_len;
    }

    /// Whether decoding produced MIR for every guest instruction it saw.
    /// `false` once any `unimplemented` call has fired.
    pub fn success(&self) -> bool {
        self.success
    }

    pub fn branch_targets(&self) -> &BranchTargets {
        &self.targets
    }

    pub fn mir(&self) -> &MirFunction {
        self.mir
    }

    /// Record the current guest address's position and, if the previous
    /// instruction closed its block with an unconditional branch, open a
    /// fresh one.
    ///
    /// Fails if `current_pc` has not advanced past the address recorded by
    /// the previous call: the decode stream feeding one region must be
    /// strictly increasing.
    pub fn start_insn(&mut self) -> Result<(), RegionError> {
        if let Some(previous) = self.last_start_pc {
            if self.pc <= previous {
                return Err(RegionError::NonMonotonicPc { previous, pc: self.pc });
            }
        }
        self.last_start_pc = Some(self.pc);

        if self.unconditional_branch_emitted {
            self.current_block = self.mir.new_block();
            self.unconditional_branch_emitted = false;
        }
        let len = self.mir.block_len(self.current_block);
        let iter = if len == 0 { None } else { Some(len - 1) };
        self.targets.record(self.pc, Position::new(self.current_block, iter));
        Ok(())
    }

    /// True once the last instruction decoded closed its block
    /// unconditionally and its address is not itself a target something
    /// else in the region still needs translated (i.e. decode cannot
    /// simply fall through into already-planned code).
    pub fn is_region_end_reached(&self) -> bool {
        self.unconditional_branch_emitted && !self.targets.contains(self.pc)
    }

    /// Closes the current block if still open, resolves every recorded
    /// position, and runs the jump resolver over the caller's MIR in
    /// place. After this call the MIR is ready to hand to a backend.
    pub fn finalize(mut self, stop_pc: GuestAddr) -> (BranchTargets, bool) {
        if self.mir.needs_terminator(self.current_block) {
            let block = self.current_block;
            self.gen_jump(block, stop_pc);
        }
        self.targets.finalize_positions();
        resolver::resolve(self.mir, &mut self.targets, self.config.link_jumps_within_region);
        log::debug!(
            "region finalized: {} blocks, {} branch targets, success={}",
            self.mir.block_count(),
            self.targets.len(),
            self.success
        );
        (self.targets, self.success)
    }

    // -- internal helpers --------------------------------------------------

    /// Appends a `PseudoJump` to `block`, picking the pending-signals-check
    /// kind from whether `target` is a back edge relative to the current
    /// decode position, and ensuring `target` has a branch-targets entry
    /// (pending, if decode hasn't reached it).
    fn gen_jump(&mut self, block: Block, target: GuestAddr) {
        self.targets.record_pending_if_missing(target);
        let kind = if target <= self.pc {
            PseudoJumpKind::JumpWithPendingSignalsCheck
        } else {
            PseudoJumpKind::JumpWithoutPendingSignalsCheck
        };
        self.mir.append(block, MirInst::PseudoJump { kind, target });
    }

    /// Appends an unconditional dispatcher exit to `target`. Used for
    /// syscalls, unimplemented instructions and memory-fault recovery,
    /// none of which the jump resolver is allowed to link locally.
    fn exit_generated_code(&mut self, block: Block, target: GuestAddr) {
        self.mir.append(
            block,
            MirInst::PseudoJump {
                kind: PseudoJumpKind::ExitGeneratedCode,
                target,
            },
        );
    }

    fn zero_vreg(&mut self) -> GpReg {
        let dst = self.mir.alloc_vreg();
        self.mir.append(self.current_block, MirInst::LoadImm { dst, imm: 0 });
        GpReg(dst)
    }

    /// Wraps a guest load or store: creates the continue/recovery block
    /// pair, wires the edges, lets `emit` append the memory instruction
    /// (which must reference the recovery block it's given), closes the
    /// source block with an unconditional jump to `continue`, and fills
    /// the recovery block with a dispatcher exit back to the current guest
    /// address. Leaves `current_block` pointed at `continue`.
    fn with_memory_recovery(&mut self, emit: impl FnOnce(&mut Self, Block)) {
        let continue_block = self.mir.new_block();
        let recovery_block = self.mir.new_block();
        self.mir.mark_recovery(recovery_block);
        self.mir.add_edge(self.current_block, continue_block);
        self.mir.add_edge(self.current_block, recovery_block);

        emit(self, recovery_block);

        self.mir.append(self.current_block, MirInst::Jump(continue_block));

        let pc = self.pc;
        self.current_block = recovery_block;
        self.exit_generated_code(recovery_block, pc);

        self.current_block = continue_block;
    }

    fn alu(&mut self, op: AluOp, width: Width, rd: GprIndex, rs1: GprIndex, rs2: GprIndex) {
        let lhs = self.get_reg(rs1).0;
        let rhs = self.get_reg(rs2).0;
        let dst = self.mir.alloc_vreg();
        self.mir.append(
            self.current_block,
            MirInst::AluReg { op, width, dst, lhs, rhs },
        );
        self.set_reg(rd, GpReg(dst));
    }

    fn alu_imm(&mut self, op: AluOp, width: Width, rd: GprIndex, rs1: GprIndex, imm: i64) {
        let lhs = self.get_reg(rs1).0;
        let dst = self.mir.alloc_vreg();
        self.mir.append(
            self.current_block,
            MirInst::AluImm { op, width, dst, lhs, imm },
        );
        self.set_reg(rd, GpReg(dst));
    }
}

impl<'a> InstructionSink for RegionBuilder<'a> {
    fn get_reg(&mut self, reg: GprIndex) -> GpReg {
        if reg.is_zero() {
            return self.zero_vreg();
        }
        let dst = self.mir.alloc_vreg();
        self.mir.append(
            self.current_block,
            MirInst::LoadThreadState {
                dst,
                offset: self.layout.gpr_offset(reg.0),
            },
        );
        GpReg(dst)
    }

    fn set_reg(&mut self, reg: GprIndex, val: GpReg) {
        if reg.is_zero() {
            return;
        }
        self.mir.append(
            self.current_block,
            MirInst::StoreThreadState {
                src: val.0,
                offset: self.layout.gpr_offset(reg.0),
            },
        );
    }

    fn get_fp_reg(&mut self, reg: FprIndex) -> SimdReg {
        let dst = self.mir.alloc_vreg();
        self.mir.append(
            self.current_block,
            MirInst::LoadThreadState {
                dst,
                offset: self.layout.fpr_offset(reg.0),
            },
        );
        SimdReg(dst)
    }

    fn nan_box_and_set_fp_reg(&mut self, reg: FprIndex, val: SimdReg, is_single: bool) {
        let src = if is_single {
            let boxed = self.mir.alloc_vreg();
            self.mir.append(
                self.current_block,
                MirInst::AluImm {
                    op: AluOp::Or,
                    width: Width::W64,
                    dst: boxed,
                    lhs: val.0,
                    imm: 0xFFFF_FFFF_0000_0000u64 as i64,
                },
            );
            boxed
        } else {
            val.0
        };
        self.mir.append(
            self.current_block,
            MirInst::StoreThreadState {
                src,
                offset: self.layout.fpr_offset(reg.0),
            },
        );
    }

    fn get_imm(&mut self, imm: i64) -> GpReg {
        let dst = self.mir.alloc_vreg();
        self.mir.append(self.current_block, MirInst::LoadImm { dst, imm });
        GpReg(dst)
    }

    fn op(&mut self, op: AluOp, rd: GprIndex, rs1: GprIndex, rs2: GprIndex) {
        self.alu(op, Width::W64, rd, rs1, rs2);
    }

    fn op32(&mut self, op: AluOp, rd: GprIndex, rs1: GprIndex, rs2: GprIndex) {
        self.alu(op, Width::W32, rd, rs1, rs2);
    }

    fn op_imm(&mut self, op: AluOp, rd: GprIndex, rs1: GprIndex, imm: i64) {
        self.alu_imm(op, Width::W64, rd, rs1, imm);
    }

    fn op_imm32(&mut self, op: AluOp, rd: GprIndex, rs1: GprIndex, imm: i64) {
        self.alu_imm(op, Width::W32, rd, rs1, imm);
    }

    fn shift_imm(&mut self, op: ShiftOp, is_32: bool, rd: GprIndex, rs1: GprIndex, shamt: u32) {
        let lhs = self.get_reg(rs1).0;
        let dst = self.mir.alloc_vreg();
        let width = if is_32 { Width::W32 } else { Width::W64 };
        self.mir.append(
            self.current_block,
            MirInst::ShiftImm { op, width, dst, lhs, imm: shamt },
        );
        self.set_reg(rd, GpReg(dst));
    }

    fn lui(&mut self, rd: GprIndex, imm: i32) {
        let dst = self.mir.alloc_vreg();
        self.mir.append(self.current_block, MirInst::Lui { dst, imm });
        self.set_reg(rd, GpReg(dst));
    }

    fn auipc(&mut self, rd: GprIndex, imm: i32) {
        let dst = self.mir.alloc_vreg();
        let pc = self.pc;
        self.mir.append(self.current_block, MirInst::Auipc { dst, pc, imm });
        self.set_reg(rd, GpReg(dst));
    }

    fn load(&mut self, rd: GprIndex, rs1: GprIndex, offset: i32, size: MemSize, extend: Extend) {
        let base = self.get_reg(rs1).0;
        let dst = self.mir.alloc_vreg();
        self.with_memory_recovery(|sb, recovery| {
            sb.mir.append(
                sb.current_block,
                MirInst::Load {
                    dst,
                    base,
                    index: None,
                    offset,
                    size,
                    extend,
                    recovery,
                },
            );
        });
        self.set_reg(rd, GpReg(dst));
    }

    fn store(&mut self, rs1: GprIndex, rs2: GprIndex, offset: i32, size: MemSize) {
        let base = self.get_reg(rs1).0;
        let src = self.get_reg(rs2).0;
        self.with_memory_recovery(|sb, recovery| {
            sb.mir.append(
                sb.current_block,
                MirInst::Store {
                    src,
                    base,
                    index: None,
                    offset,
                    size,
                    recovery,
                },
            );
        });
    }

    fn load_reserved(&mut self, rd: GprIndex, rs1: GprIndex, is_32: bool) {
        let addr = self.get_reg(rs1).0;
        let dst = self.mir.alloc_vreg();
        let size = if is_32 { MemSize::Word } else { MemSize::Double };
        self.with_memory_recovery(|sb, recovery| {
            sb.mir.append(
                sb.current_block,
                MirInst::Load {
                    dst,
                    base: addr,
                    index: None,
                    offset: 0,
                    size,
                    extend: Extend::Sign,
                    recovery,
                },
            );
        });

        self.mir.append(
            self.current_block,
            MirInst::StoreThreadState {
                src: addr,
                offset: self.layout.reservation_address,
            },
        );
        self.mir.append(
            self.current_block,
            MirInst::StoreThreadState {
                src: dst,
                offset: self.layout.reservation_value,
            },
        );
        let cpu = self.mir.alloc_vreg();
        self.mir.append(
            self.current_block,
            MirInst::LoadThreadState {
                dst: cpu,
                offset: self.layout.current_cpu,
            },
        );
        self.mir.append(
            self.current_block,
            MirInst::HostCall {
                helper: HostHelper::SetOwner,
                args: smallvec::smallvec![addr, cpu],
                result: None,
                size: None,
            },
        );

        self.set_reg(rd, GpReg(dst));
    }

    /// Implements the reservation protocol described in the design notes:
    /// the stored reservation is cleared unconditionally (single-shot),
    /// then the exchange only proceeds if the cleared address matched and
    /// the per-address lock was free. `is_32` selects `sc.w` vs `sc.d` and
    /// is carried into the `LockedCmpxchg` helper call as a `MemSize`, the
    /// same way `load_reserved` carries it into its `Load`.
    fn store_conditional(&mut self, rd: GprIndex, rs1: GprIndex, rs2: GprIndex, is_32: bool) {
        let addr = self.get_reg(rs1).0;
        let new_val = self.get_reg(rs2).0;
        let size = if is_32 { MemSize::Word } else { MemSize::Double };

        let stored_addr = self.mir.alloc_vreg();
        self.mir.append(
            self.current_block,
            MirInst::LoadThreadState {
                dst: stored_addr,
                offset: self.layout.reservation_address,
            },
        );
        let cleared = self.mir.alloc_vreg();
        self.mir.append(
            self.current_block,
            MirInst::LoadImm {
                dst: cleared,
                imm: NO_RESERVATION as i64,
            },
        );
        self.mir.append(
            self.current_block,
            MirInst::StoreThreadState {
                src: cleared,
                offset: self.layout.reservation_address,
            },
        );

        let continue_block = self.mir.new_block();
        let failure_block = self.mir.new_block();
        let addr_match_block = self.mir.new_block();

        self.mir.append(
            self.current_block,
            MirInst::Cmp {
                flags: self.flags.0,
                lhs: stored_addr,
                rhs: addr,
            },
        );
        self.mir.append(
            self.current_block,
            MirInst::CondBranch {
                cond: crate::pseudo::Cond::Equal,
                flags: self.flags.0,
                then_block: addr_match_block,
                else_block: failure_block,
            },
        );

        self.current_block = addr_match_block;
        let lock_result = self.mir.alloc_vreg();
        self.mir.append(
            self.current_block,
            MirInst::HostCall {
                helper: HostHelper::TryLock,
                args: smallvec::smallvec![addr],
                result: Some(lock_result),
                size: None,
            },
        );
        let zero = self.zero_vreg();
        self.mir.append(
            self.current_block,
            MirInst::Cmp {
                flags: self.flags.0,
                lhs: lock_result,
                rhs: zero.0,
            },
        );
        let lock_success_block = self.mir.new_block();
        self.mir.append(
            self.current_block,
            MirInst::CondBranch {
                cond: crate::pseudo::Cond::NotEqual,
                flags: self.flags.0,
                then_block: lock_success_block,
                else_block: failure_block,
            },
        );

        self.current_block = lock_success_block;
        let expected = self.mir.alloc_vreg();
        self.mir.append(
            self.current_block,
            MirInst::LoadThreadState {
                dst: expected,
                offset: self.layout.reservation_value,
            },
        );
        let cas_result = self.mir.alloc_vreg();
        self.mir.append(
            self.current_block,
            MirInst::HostCall {
                helper: HostHelper::LockedCmpxchg,
                args: smallvec::smallvec![addr, expected, new_val],
                result: Some(cas_result),
                size: Some(size),
            },
        );
        self.mir.append(
            self.current_block,
            MirInst::HostCall {
                helper: HostHelper::Unlock,
                args: smallvec::smallvec![addr],
                result: None,
                size: None,
            },
        );
        self.mir.append(
            self.current_block,
            MirInst::Cmp {
                flags: self.flags.0,
                lhs: cas_result,
                rhs: expected,
            },
        );
        let swap_ok_block = self.mir.new_block();
        self.mir.append(
            self.current_block,
            MirInst::CondBranch {
                cond: crate::pseudo::Cond::Equal,
                flags: self.flags.0,
                then_block: swap_ok_block,
                else_block: failure_block,
            },
        );

        let result = self.mir.alloc_vreg();

        self.current_block = swap_ok_block;
        self.mir.append(self.current_block, MirInst::LoadImm { dst: result, imm: 0 });
        self.mir.append(self.current_block, MirInst::Jump(continue_block));

        self.current_block = failure_block;
        self.mir.append(self.current_block, MirInst::LoadImm { dst: result, imm: 1 });
        self.mir.append(self.current_block, MirInst::Jump(continue_block));

        self.current_block = continue_block;
        self.set_reg(rd, GpReg(result));
    }

    fn compare_and_branch(&mut self, op: BranchOp, rs1: GprIndex, rs2: GprIndex, offset: i64) {
        let lhs = self.get_reg(rs1).0;
        let rhs = self.get_reg(rs2).0;
        self.mir.append(
            self.current_block,
            MirInst::Cmp {
                flags: self.flags.0,
                lhs,
                rhs,
            },
        );
        let then_block = self.mir.new_block();
        let else_block = self.mir.new_block();
        self.mir.append(
            self.current_block,
            MirInst::CondBranch {
                cond: op.to_host_cond(),
                flags: self.flags.0,
                then_block,
                else_block,
            },
        );

        self.current_block = then_block;
        let target = self.pc.wrapping_add(offset as u64);
        self.gen_jump(then_block, target);

        self.current_block = else_block;
    }

    fn branch(&mut self, offset: i64) {
        self.unconditional_branch_emitted = true;
        let target = self.pc.wrapping_add(offset as u64);
        let block = self.current_block;
        self.gen_jump(block, target);
    }

    fn branch_register(&mut self, rs1: GprIndex, offset: i64) {
        let base = self.get_reg(rs1).0;
        let tmp = self.mir.alloc_vreg();
        self.mir.append(self.current_block, MirInst::Move { dst: tmp, src: base });
        self.mir.append(
            self.current_block,
            MirInst::AluImm {
                op: AluOp::Add,
                width: Width::W64,
                dst: tmp,
                lhs: tmp,
                imm: offset,
            },
        );
        self.mir.append(
            self.current_block,
            MirInst::AluImm {
                op: AluOp::And,
                width: Width::W64,
                dst: tmp,
                lhs: tmp,
                imm: !1i64,
            },
        );
        self.mir.append(self.current_block, MirInst::IndirectJump { target: tmp });
        self.unconditional_branch_emitted = true;
    }

    fn unimplemented(&mut self) {
        self.success = false;
        let pc = self.pc;
        log::warn!("unimplemented instruction at pc {pc:#x}, exiting region there");
        let block = self.current_block;
        self.exit_generated_code(block, pc);
        self.unconditional_branch_emitted = true;
    }
}
