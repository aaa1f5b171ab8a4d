//! End-to-end tests driving `RegionBuilder` directly through
//! `InstructionSink`, standing in for a real RISC-V decoder the way the
//! frontend crate this design follows tests its builder without a real
//! source-language parser.

use rv64_region::entities::GprIndex;
use rv64_region::mir::MirInst;
use rv64_region::pseudo::{AluOp, BranchOp, Extend, MemSize};
use rv64_region::region::{RegionBuilder, RegionConfig};
use rv64_region::{InstructionSink, MirFunction};

const ZERO: GprIndex = GprIndex::ZERO;
const RA: GprIndex = GprIndex(1);
const A0: GprIndex = GprIndex(10);
const A1: GprIndex = GprIndex(11);
const A2: GprIndex = GprIndex(12);
const A3: GprIndex = GprIndex(13);

fn count_alu_imm_adds(mir: &MirFunction) -> usize {
    let mut count = 0;
    for i in 0..mir.block_count() {
        let block = mir.block_order_at(i).unwrap();
        for inst in mir.block_insts(block) {
            if let MirInst::AluImm { op: AluOp::Add, .. } = inst {
                count += 1;
            }
        }
    }
    count
}

#[test]
fn straight_line_add_then_indirect_return() {
    let mut mir = MirFunction::new();
    let mut rb = RegionBuilder::new(&mut mir, 0x1000, RegionConfig::default());

    rb.start_insn().unwrap();
    rb.op_imm(AluOp::Add, A0, A0, 1);
    rb.advance_pc(4);

    rb.start_insn().unwrap();
    rb.op_imm(AluOp::Add, A0, A0, 2);
    rb.advance_pc(4);

    rb.start_insn().unwrap();
    rb.branch_register(RA, 0);
    rb.advance_pc(4);

    let (targets, success) = rb.finalize(0x100c);

    assert!(success);
    assert!(targets.position(0x1000).is_some());
    assert!(targets.position(0x1004).is_some());
    assert!(targets.position(0x1008).is_some());
    assert_eq!(count_alu_imm_adds(&mir), 2);

    let last_block = mir.block_order_at(mir.block_count() - 1).unwrap();
    let last = mir.block_insts(last_block).last().unwrap();
    assert!(matches!(last, MirInst::IndirectJump { .. }));
}

#[test]
fn forward_branch_joins_taken_and_fallthrough_paths() {
    let mut mir = MirFunction::new();
    let mut rb = RegionBuilder::new(&mut mir, 0x2000, RegionConfig::default());

    rb.start_insn().unwrap();
    rb.compare_and_branch(BranchOp::Eq, A0, A1, 8);
    rb.advance_pc(4);

    rb.start_insn().unwrap();
    rb.op_imm(AluOp::Add, A2, A2, 1);
    rb.advance_pc(4);

    rb.start_insn().unwrap();
    rb.op_imm(AluOp::Add, A3, A3, 1);
    rb.advance_pc(4);

    rb.start_insn().unwrap();
    rb.branch_register(RA, 0);
    rb.advance_pc(4);

    let (targets, success) = rb.finalize(0x2010);
    assert!(success);

    let join = targets.position(0x2008).unwrap();
    assert_eq!(mir.predecessors(join.block).len(), 2);
}

#[test]
fn back_edge_gets_a_pending_signals_check() {
    let mut mir = MirFunction::new();
    let mut rb = RegionBuilder::new(&mut mir, 0x3000, RegionConfig::default());

    rb.start_insn().unwrap();
    rb.op_imm(AluOp::Add, A0, A0, -1);
    rb.advance_pc(4);

    rb.start_insn().unwrap();
    rb.compare_and_branch(BranchOp::Ne, A0, ZERO, -4);
    rb.advance_pc(4);

    rb.start_insn().unwrap();
    rb.branch_register(RA, 0);
    rb.advance_pc(4);

    let (targets, success) = rb.finalize(0x300c);
    assert!(success);

    let loop_head = targets.position(0x3000).unwrap();
    let found = (0..mir.block_count()).any(|i| {
        let block = mir.block_order_at(i).unwrap();
        matches!(
            mir.block_insts(block).last(),
            Some(MirInst::CondBranchPendingSignal { local_block, .. }) if *local_block == loop_head.block
        )
    });
    assert!(found, "expected a pending-signals check guarding the back edge");
}

#[test]
fn indirect_branch_masks_low_bit_before_jumping() {
    let mut mir = MirFunction::new();
    let mut rb = RegionBuilder::new(&mut mir, 0x4000, RegionConfig::default());

    rb.start_insn().unwrap();
    rb.branch_register(A0, 0);
    rb.advance_pc(4);

    let (_targets, success) = rb.finalize(0x4004);
    assert!(success);

    let last_block = mir.block_order_at(mir.block_count() - 1).unwrap();
    let insts = mir.block_insts(last_block);
    assert!(matches!(insts.last(), Some(MirInst::IndirectJump { .. })));
    assert!(insts.iter().any(|i| matches!(
        i,
        MirInst::AluImm { op: AluOp::And, imm, .. } if *imm == !1i64
    )));
}

#[test]
fn unimplemented_instruction_marks_region_unsuccessful_but_keeps_decoding() {
    let mut mir = MirFunction::new();
    let mut rb = RegionBuilder::new(&mut mir, 0x5000, RegionConfig::default());

    rb.start_insn().unwrap();
    rb.op_imm(AluOp::Add, A0, A0, 1);
    rb.advance_pc(4);

    rb.start_insn().unwrap();
    rb.unimplemented();
    rb.advance_pc(4);

    rb.start_insn().unwrap();
    rb.op_imm(AluOp::Add, A1, A1, 1);
    rb.advance_pc(4);

    let (targets, success) = rb.finalize(0x500c);

    assert!(!success);
    assert_eq!(count_alu_imm_adds(&mir), 2);
    assert!(targets.position(0x5004).is_some());
}

#[test]
fn lr_sc_success_path_without_intervening_store() {
    let mut mir = MirFunction::new();
    let mut rb = RegionBuilder::new(&mut mir, 0x6000, RegionConfig::default());

    rb.start_insn().unwrap();
    rb.load_reserved(A0, A1, false);
    rb.advance_pc(4);

    rb.start_insn().unwrap();
    rb.store_conditional(A2, A1, A3, false);
    rb.advance_pc(4);

    rb.start_insn().unwrap();
    rb.branch_register(RA, 0);
    rb.advance_pc(4);

    let (_targets, success) = rb.finalize(0x600c);
    assert!(success);

    let mut helpers = Vec::new();
    for i in 0..mir.block_count() {
        let block = mir.block_order_at(i).unwrap();
        for inst in mir.block_insts(block) {
            if let MirInst::HostCall { helper, size, .. } = inst {
                helpers.push((*helper, *size));
            }
        }
    }
    use rv64_region::pseudo::HostHelper;
    assert!(helpers.contains(&(HostHelper::SetOwner, None)));
    assert!(helpers.contains(&(HostHelper::TryLock, None)));
    assert!(helpers.contains(&(HostHelper::LockedCmpxchg, Some(MemSize::Double))));
    assert!(helpers.contains(&(HostHelper::Unlock, None)));
}

fn cmpxchg_size(mir: &MirFunction) -> Option<MemSize> {
    use rv64_region::pseudo::HostHelper;
    for i in 0..mir.block_count() {
        let block = mir.block_order_at(i).unwrap();
        for inst in mir.block_insts(block) {
            if let MirInst::HostCall {
                helper: HostHelper::LockedCmpxchg,
                size,
                ..
            } = inst
            {
                return *size;
            }
        }
    }
    None
}

#[test]
fn sc_w_carries_a_32_bit_width_distinct_from_sc_d() {
    let mut mir32 = MirFunction::new();
    let mut rb32 = RegionBuilder::new(&mut mir32, 0x9000, RegionConfig::default());
    rb32.start_insn().unwrap();
    rb32.load_reserved(A0, A1, true);
    rb32.advance_pc(4);
    rb32.start_insn().unwrap();
    rb32.store_conditional(A2, A1, A3, true);
    rb32.advance_pc(4);
    rb32.start_insn().unwrap();
    rb32.branch_register(RA, 0);
    rb32.advance_pc(4);
    rb32.finalize(0x900c);

    let mut mir64 = MirFunction::new();
    let mut rb64 = RegionBuilder::new(&mut mir64, 0xa000, RegionConfig::default());
    rb64.start_insn().unwrap();
    rb64.load_reserved(A0, A1, false);
    rb64.advance_pc(4);
    rb64.start_insn().unwrap();
    rb64.store_conditional(A2, A1, A3, false);
    rb64.advance_pc(4);
    rb64.start_insn().unwrap();
    rb64.branch_register(RA, 0);
    rb64.advance_pc(4);
    rb64.finalize(0xa00c);

    let size32 = cmpxchg_size(&mir32);
    let size64 = cmpxchg_size(&mir64);

    assert_eq!(size32, Some(MemSize::Word));
    assert_eq!(size64, Some(MemSize::Double));
    assert_ne!(size32, size64);
}

#[test]
fn store_immediately_followed_by_load_emits_two_recovery_blocks() {
    let mut mir = MirFunction::new();
    let mut rb = RegionBuilder::new(&mut mir, 0x7000, RegionConfig::default());

    rb.start_insn().unwrap();
    rb.store(A1, A2, 0, MemSize::Double);
    rb.advance_pc(4);

    rb.start_insn().unwrap();
    rb.load(A3, A1, 0, MemSize::Double, Extend::Sign);
    rb.advance_pc(4);

    rb.start_insn().unwrap();
    rb.branch_register(RA, 0);
    rb.advance_pc(4);

    let (_targets, success) = rb.finalize(0x700c);
    assert!(success);

    let recovery_count = (0..mir.block_count())
        .filter(|&i| mir.is_recovery(mir.block_order_at(i).unwrap()))
        .count();
    assert_eq!(recovery_count, 2);
}

#[test]
fn non_monotonic_pc_is_rejected() {
    let mut mir = MirFunction::new();
    let mut rb = RegionBuilder::new(&mut mir, 0x8000, RegionConfig::default());
    rb.start_insn().unwrap();
    rb.advance_pc(4);
    rb.start_insn().unwrap();
    rb.advance_pc(0);
    assert!(rb.start_insn().is_err());
}
