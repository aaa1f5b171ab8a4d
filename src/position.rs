//! The position tracker and branch-targets table.
//!
//! The spec describes these as two collaborating components, but they
//! share one backing map in practice: every guest address that gets
//! translated is recorded here (that's the position-tracker role), and
//! every address some jump wants to reach gets an entry too, inserted
//! with a pending marker if decode hasn't reached it yet (that's the
//! branch-targets role). `StartInsn` always calls [`BranchTargets::record`],
//! which upgrades a pending entry to a translated one if one already
//! existed.
//!
//! Iteration is by ascending guest address, which a `BTreeMap` gives for
//! free and which the jump resolver's block-splitting pass depends on.

use std::collections::BTreeMap;

use crate::entities::{Block, GuestAddr};

/// A machine-instruction position: a block and, once resolved, an index
/// into that block's instruction vector.
///
/// `iter: None` is the sentinel for "the first instruction of this block,
/// once one exists" -- used while a block is still empty at the moment its
/// first guest address is recorded. [`BranchTargets::finalize_positions`]
/// resolves every sentinel before the jump resolver runs.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Position {
    pub block: Block,
    pub iter: Option<usize>,
}

impl Position {
    pub fn new(block: Block, iter: Option<usize>) -> Self {
        Self { block, iter }
    }

    /// Panics if this position was not resolved by `finalize_positions`;
    /// only the resolver and tests should ever call this.
    pub fn resolved_iter(&self) -> usize {
        self.iter
            .expect("position iterator accessed before Finalize resolved it")
    }
}

#[derive(Copy, Clone, Debug)]
enum TargetEntry {
    /// Some intra-region jump wants to reach this address, but it has not
    /// been translated (it may turn out to be outside the region).
    Pending,
    Translated(Position),
}

/// Ordered guest-address -> position map doubling as the branch-targets
/// table.
#[derive(Default)]
pub struct BranchTargets {
    entries: BTreeMap<GuestAddr, TargetEntry>,
}

impl BranchTargets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the position of `addr`'s first host instruction, replacing
    /// any earlier pending entry. Called once per `StartInsn`.
    pub fn record(&mut self, addr: GuestAddr, position: Position) {
        self.entries.insert(addr, TargetEntry::Translated(position));
    }

    /// Ensure `addr` has an entry, inserting a pending (null-block) one if
    /// it has none. Called by `GenJump` for every jump target.
    pub fn record_pending_if_missing(&mut self, addr: GuestAddr) {
        self.entries.entry(addr).or_insert(TargetEntry::Pending);
    }

    pub fn contains(&self, addr: GuestAddr) -> bool {
        self.entries.contains_key(&addr)
    }

    /// The resolved position for `addr`, or `None` if it is still pending
    /// (outside the region) or altogether unknown.
    pub fn position(&self, addr: GuestAddr) -> Option<Position> {
        match self.entries.get(&addr) {
            Some(TargetEntry::Translated(pos)) => Some(*pos),
            _ => None,
        }
    }

    pub fn is_pending(&self, addr: GuestAddr) -> bool {
        matches!(self.entries.get(&addr), Some(TargetEntry::Pending))
    }

    /// Finalize step 2: for every translated entry, turn the "last
    /// instruction before this guest address was emitted" bookkeeping
    /// position recorded by `StartInsn` into "first instruction of this
    /// guest address". A `None` iterator (block was empty when recorded)
    /// becomes index 0; otherwise the stored index is advanced by one.
    pub fn finalize_positions(&mut self) {
        for entry in self.entries.values_mut() {
            if let TargetEntry::Translated(pos) = entry {
                pos.iter = Some(match pos.iter {
                    None => 0,
                    Some(last_before) => last_before + 1,
                });
            }
        }
    }

    /// Re-home every translated entry from `from_addr` onward whose
    /// position still points into `old_block` at or after `split_at` to
    /// `new_block`, rebasing the index. Entries are visited in ascending
    /// address order and the walk stops at the first one that no longer
    /// belongs to `old_block`, per the contiguous-suffix guarantee: one
    /// block covers one increasing run of guest addresses.
    pub fn rehome_suffix(
        &mut self,
        from_addr: GuestAddr,
        old_block: Block,
        new_block: Block,
        split_at: usize,
    ) {
        for (_, entry) in self.entries.range_mut(from_addr..) {
            match entry {
                TargetEntry::Translated(pos) if pos.block == old_block => {
                    let idx = pos.resolved_iter();
                    if idx < split_at {
                        break;
                    }
                    pos.block = new_block;
                    pos.iter = Some(idx - split_at);
                }
                _ => break,
            }
        }
    }

    /// Ascending-address iterator over every entry, read-only; exposed so
    /// the jump resolver (and tests) can walk entries without cloning the
    /// whole map.
    pub fn iter(&self) -> impl Iterator<Item = (GuestAddr, Option<Position>)> + '_ {
        self.entries.iter().map(|(addr, entry)| {
            let pos = match entry {
                TargetEntry::Translated(pos) => Some(*pos),
                TargetEntry::Pending => None,
            };
            (*addr, pos)
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
