//! The post-decode jump resolver.
//!
//! Every direct pseudo-jump the region builder emits carries a guest
//! target; this pass looks each one up in the branch-targets table and,
//! when the target landed inside the region, rewrites the pseudo-jump into
//! a real MIR branch instead of a dispatcher exit. A target that falls
//! mid-block forces a split so the branch can land exactly on the right
//! instruction. Linked back edges get a pending-signals check inserted, so
//! that every cycle the generated code can run passes through a safepoint.
//!
//! Grounded on the same "walk the block list by index, picking up blocks
//! appended mid-pass" shape as a relaxation pass over straight-line code:
//! the list of blocks to consider grows as the pass runs (splits and
//! pending-signal exit blocks both append), so the walk re-checks the
//! block count on every iteration instead of snapshotting it up front.

use crate::mir::{MirFunction, MirInst};
use crate::position::BranchTargets;
use crate::pseudo::PseudoJumpKind;

pub fn resolve(mir: &mut MirFunction, targets: &mut BranchTargets, link_jumps_within_region: bool) {
    if !link_jumps_within_region {
        return;
    }

    let mut i = 0;
    while i < mir.block_count() {
        let block = mir
            .block_order_at(i)
            .expect("index under block_count always resolves to a block");
        i += 1;

        if mir.is_recovery(block) {
            continue;
        }
        let last = match mir.block_len(block) {
            0 => continue,
            n => n - 1,
        };
        let (kind, target) = match mir.inst(block, last) {
            MirInst::PseudoJump { kind, target } => (*kind, *target),
            _ => continue,
        };
        if matches!(kind, PseudoJumpKind::Syscall | PseudoJumpKind::ExitGeneratedCode) {
            continue;
        }

        let pos = match targets.position(target) {
            Some(pos) => pos,
            None => continue,
        };

        let (rewrite_block, link_block) = if pos.resolved_iter() == 0 {
            (block, pos.block)
        } else {
            let (prefix, new_block) = mir.split_block(pos.block, pos.resolved_iter());
            targets.rehome_suffix(target, prefix, new_block, pos.resolved_iter());
            let rewrite = if prefix == block { new_block } else { block };
            (rewrite, new_block)
        };

        match kind {
            PseudoJumpKind::JumpWithoutPendingSignalsCheck => {
                mir.set_terminator(rewrite_block, MirInst::Jump(link_block));
                mir.add_edge(rewrite_block, link_block);
            }
            PseudoJumpKind::JumpWithPendingSignalsCheck => {
                let exit_block = mir.new_block();
                mir.append(
                    exit_block,
                    MirInst::PseudoJump {
                        kind: PseudoJumpKind::ExitGeneratedCode,
                        target,
                    },
                );
                mir.set_terminator(
                    rewrite_block,
                    MirInst::CondBranchPendingSignal {
                        exit_block,
                        local_block: link_block,
                    },
                );
                mir.add_edge(rewrite_block, exit_block);
                mir.add_edge(rewrite_block, link_block);
            }
            PseudoJumpKind::Syscall | PseudoJumpKind::ExitGeneratedCode => unreachable!(),
        }
    }
}
