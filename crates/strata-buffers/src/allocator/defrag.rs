// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The defragmenting allocator.
//!
//! Blocks live in a linear address space made of appended bank segments.
//! Besides allocation, the allocator owns a bounded set of move slots and
//! drives each compaction move through an explicit state machine:
//!
//! ```text
//! Idle -> CopyIssued -> Relocated -> (retired)
//!            \-> Canceled -----------/
//! ```
//!
//! [`DefragAllocator::plan_moves`] reserves destinations and puts moves in
//! `Idle`. The pool issues the GPU copy and reports it with
//! [`DefragAllocator::mark_copy_issued`]. Once the copy fence passes the pool
//! calls [`DefragAllocator::relocate`], which moves the block's bookkeeping to
//! the destination while keeping the source reserved. When the relocate
//! fence passes, [`DefragAllocator::retire`] releases whichever region is no
//! longer referenced. Pinning or freeing a block whose copy is still in
//! flight cancels the move; canceled moves go through the same retire path.

use strata_core::FenceId;

use super::free_list::{Fit, FreeList};
use super::{AllocFailure, Allocation};
use crate::table::{SlotKey, SlotTable};

/// A block of the defragmenting allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BlockHandle(pub(crate) SlotKey);

/// A bank-relative position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Location {
    pub(crate) bank: usize,
    pub(crate) offset: usize,
}

#[derive(Debug)]
struct Block {
    location: Location,
    size: usize,
    pins: u32,
    /// The item stored in this block.
    context: SlotKey,
    moving: Option<usize>,
}

/// Progress of one compaction move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MoveState {
    Idle,
    CopyIssued,
    Relocated,
    Canceled,
}

#[derive(Debug)]
struct PendingMove {
    state: MoveState,
    block: Option<BlockHandle>,
    src: Location,
    dst: Location,
    size: usize,
    relocated: bool,
}

#[derive(Debug)]
struct MoveSlot {
    copy_fence: FenceId,
    relocate_fence: FenceId,
    active: Option<PendingMove>,
}

/// A move reserved by [`DefragAllocator::plan_moves`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MovePlan {
    pub(crate) slot: usize,
    pub(crate) context: SlotKey,
    pub(crate) src: Location,
    pub(crate) dst: Location,
    pub(crate) size: usize,
}

/// The item whose storage [`DefragAllocator::relocate`] just moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Relocation {
    pub(crate) context: SlotKey,
    pub(crate) dst: Location,
}

/// Space handed back by [`DefragAllocator::retire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetiredMove {
    pub(crate) bank: usize,
    pub(crate) size: usize,
    pub(crate) canceled: bool,
}

#[derive(Debug)]
pub(crate) struct DefragAllocator {
    banks: Vec<FreeList>,
    blocks: SlotTable<Block>,
    slots: Vec<MoveSlot>,
    fit: Fit,
    max_allocs: usize,
}

impl DefragAllocator {
    /// `move_fences` provides one `(copy, relocate)` fence pair per move slot.
    pub(crate) fn new(fit: Fit, max_allocs: usize, move_fences: Vec<(FenceId, FenceId)>) -> Self {
        let slots = move_fences
            .into_iter()
            .map(|(copy_fence, relocate_fence)| MoveSlot {
                copy_fence,
                relocate_fence,
                active: None,
            })
            .collect();
        Self {
            banks: Vec::new(),
            blocks: SlotTable::new(),
            slots,
            fit,
            max_allocs,
        }
    }

    pub(crate) fn extend(&mut self, capacity: usize) {
        self.banks.push(FreeList::new(capacity));
    }

    pub(crate) fn bank_count(&self) -> usize {
        self.banks.len()
    }

    pub(crate) fn live(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn fences(&self, slot: usize) -> (FenceId, FenceId) {
        let slot = &self.slots[slot];
        (slot.copy_fence, slot.relocate_fence)
    }

    pub(crate) fn all_fences(&self) -> impl Iterator<Item = FenceId> + '_ {
        self.slots
            .iter()
            .flat_map(|slot| [slot.copy_fence, slot.relocate_fence])
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.active.is_some()).count()
    }

    pub(crate) fn state(&self, slot: usize) -> Option<MoveState> {
        self.slots
            .get(slot)
            .and_then(|slot| slot.active.as_ref())
            .map(|mv| mv.state)
    }

    pub(crate) fn allocate(
        &mut self,
        size: usize,
        context: SlotKey,
    ) -> Result<Allocation, AllocFailure> {
        if self.blocks.len() >= self.max_allocs {
            return Err(AllocFailure::HandlesExhausted);
        }
        let fit = self.fit;
        let found = match fit {
            Fit::First => self
                .banks
                .iter_mut()
                .enumerate()
                .find_map(|(bank, list)| list.allocate(size, fit).map(|o| (bank, o))),
            Fit::Best => {
                let bank = self
                    .banks
                    .iter()
                    .enumerate()
                    .filter(|(_, list)| list.largest_free() >= size)
                    .min_by_key(|(_, list)| list.free_bytes())
                    .map(|(bank, _)| bank);
                bank.and_then(|bank| self.banks[bank].allocate(size, fit).map(|o| (bank, o)))
            }
        };
        let (bank, offset) = found.ok_or(AllocFailure::NoSpace)?;
        let handle = BlockHandle(self.blocks.insert(Block {
            location: Location { bank, offset },
            size,
            pins: 0,
            context,
            moving: None,
        }));
        Ok(Allocation {
            bank,
            offset,
            block: Some(handle),
        })
    }

    /// Frees a block regardless of pins. An in-flight copy is canceled; a
    /// relocated move keeps its source reserved until it retires.
    pub(crate) fn free(&mut self, handle: BlockHandle) {
        let Some(block) = self.blocks.remove(handle.0) else {
            debug_assert!(false, "double free of defrag block {handle:?}");
            return;
        };
        self.banks[block.location.bank].release(block.location.offset, block.size);
        if let Some(slot) = block.moving {
            if let Some(mv) = self.slots[slot].active.as_mut() {
                mv.block = None;
                if matches!(mv.state, MoveState::Idle | MoveState::CopyIssued) {
                    mv.state = MoveState::Canceled;
                }
            }
        }
    }

    /// Pins a block so it is never chosen for a move. Returns `true` if an
    /// in-flight copy of the block had to be canceled.
    pub(crate) fn pin(&mut self, handle: BlockHandle) -> bool {
        let Some(block) = self.blocks.get_mut(handle.0) else {
            return false;
        };
        block.pins += 1;
        let Some(slot) = block.moving else {
            return false;
        };
        let Some(mv) = self.slots[slot].active.as_mut() else {
            return false;
        };
        if !matches!(mv.state, MoveState::Idle | MoveState::CopyIssued) {
            return false;
        }
        mv.state = MoveState::Canceled;
        block.moving = None;
        true
    }

    pub(crate) fn unpin(&mut self, handle: BlockHandle) {
        if let Some(block) = self.blocks.get_mut(handle.0) {
            debug_assert!(block.pins > 0, "unbalanced unpin of {handle:?}");
            block.pins = block.pins.saturating_sub(1);
        }
    }

    pub(crate) fn set_context(&mut self, handle: BlockHandle, context: SlotKey) {
        if let Some(block) = self.blocks.get_mut(handle.0) {
            block.context = context;
        }
    }

    /// Reserves destinations for up to `budget` moves, highest blocks first,
    /// each to the lowest free region below it.
    pub(crate) fn plan_moves(&mut self, budget: usize) -> Vec<MovePlan> {
        let mut free_slots: Vec<usize> = (0..self.slots.len())
            .rev()
            .filter(|&slot| self.slots[slot].active.is_none())
            .collect();
        if budget == 0 || free_slots.is_empty() {
            return Vec::new();
        }

        let mut candidates: Vec<(SlotKey, Location, usize)> = self
            .blocks
            .iter()
            .filter(|(_, block)| block.pins == 0 && block.moving.is_none())
            .map(|(key, block)| (key, block.location, block.size))
            .collect();
        candidates.sort_by_key(|(_, loc, _)| std::cmp::Reverse((loc.bank, loc.offset)));

        let mut plans = Vec::new();
        for (key, src, size) in candidates {
            if plans.len() >= budget {
                break;
            }
            let target = (0..=src.bank).find_map(|bank| {
                let limit = if bank == src.bank { src.offset } else { usize::MAX };
                self.banks[bank]
                    .lowest_fit_below(size, limit)
                    .map(|offset| Location { bank, offset })
            });
            let Some(dst) = target else {
                continue;
            };
            let Some(slot) = free_slots.pop() else {
                break;
            };
            let reserved = self.banks[dst.bank].reserve(dst.offset, size);
            debug_assert!(reserved, "planned destination must be free");

            let handle = BlockHandle(key);
            let context = match self.blocks.get_mut(key) {
                Some(block) => {
                    block.moving = Some(slot);
                    block.context
                }
                None => continue,
            };
            self.slots[slot].active = Some(PendingMove {
                state: MoveState::Idle,
                block: Some(handle),
                src,
                dst,
                size,
                relocated: false,
            });
            plans.push(MovePlan {
                slot,
                context,
                src,
                dst,
                size,
            });
        }
        plans
    }

    pub(crate) fn mark_copy_issued(&mut self, slot: usize) {
        if let Some(mv) = self.slots[slot].active.as_mut() {
            if mv.state == MoveState::Idle {
                mv.state = MoveState::CopyIssued;
            }
        }
    }

    /// Drops a planned move whose copy could not be issued.
    pub(crate) fn abandon(&mut self, slot: usize) {
        let Some(mv) = self.slots[slot].active.take() else {
            return;
        };
        debug_assert_eq!(mv.state, MoveState::Idle, "only unissued moves can be abandoned");
        self.banks[mv.dst.bank].release(mv.dst.offset, mv.size);
        if let Some(block) = mv.block.and_then(|h| self.blocks.get_mut(h.0)) {
            block.moving = None;
        }
    }

    /// Points the block at its destination once the copy has landed.
    pub(crate) fn relocate(&mut self, slot: usize) -> Option<Relocation> {
        let mv = self.slots[slot].active.as_mut()?;
        if mv.state != MoveState::CopyIssued {
            return None;
        }
        let block = self.blocks.get_mut(mv.block?.0)?;
        block.location = mv.dst;
        mv.relocated = true;
        mv.state = MoveState::Relocated;
        Some(Relocation {
            context: block.context,
            dst: mv.dst,
        })
    }

    /// Ends a relocated or canceled move, releasing the region nothing
    /// refers to any more. Each move retires at most once.
    pub(crate) fn retire(&mut self, slot: usize) -> Option<RetiredMove> {
        let state = self.state(slot)?;
        if !matches!(state, MoveState::Relocated | MoveState::Canceled) {
            return None;
        }
        let mv = self.slots[slot].active.take()?;
        let unused = if mv.relocated { mv.src } else { mv.dst };
        self.banks[unused.bank].release(unused.offset, mv.size);
        if let Some(block) = mv.block.and_then(|h| self.blocks.get_mut(h.0)) {
            if block.moving == Some(slot) {
                block.moving = None;
            }
        }
        Some(RetiredMove {
            bank: unused.bank,
            size: mv.size,
            canceled: !mv.relocated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(index: u32) -> SlotKey {
        SlotKey {
            index,
            generation: 0,
        }
    }

    fn allocator(slots: usize) -> DefragAllocator {
        let fences = (0..slots)
            .map(|i| (FenceId(2 * i), FenceId(2 * i + 1)))
            .collect();
        let mut allocator = DefragAllocator::new(Fit::First, 64, fences);
        allocator.extend(1024);
        allocator
    }

    #[test]
    fn test_move_lifecycle_releases_source() {
        let mut alloc = allocator(2);
        let first = alloc.allocate(256, key(0)).unwrap();
        let second = alloc.allocate(256, key(1)).unwrap();
        alloc.free(first.block.unwrap());

        let plans = alloc.plan_moves(4);
        assert_eq!(plans.len(), 1);
        let plan = plans[0];
        assert_eq!(plan.context, key(1));
        assert_eq!((plan.src.offset, plan.dst.offset), (256, 0));
        assert_eq!(alloc.state(plan.slot), Some(MoveState::Idle));

        alloc.mark_copy_issued(plan.slot);
        assert_eq!(alloc.retire(plan.slot), None, "copy still in flight");

        let relocation = alloc.relocate(plan.slot).unwrap();
        assert_eq!(relocation.dst.offset, 0);
        assert_eq!(alloc.relocate(plan.slot), None);

        let retired = alloc.retire(plan.slot).unwrap();
        assert_eq!((retired.bank, retired.size, retired.canceled), (0, 256, false));
        assert_eq!(alloc.in_flight(), 0);
        assert_eq!(alloc.retire(plan.slot), None, "retire is one-shot");

        // The vacated source merged back: 768 contiguous bytes after the block.
        assert_eq!(alloc.banks[0].largest_free(), 768);
        alloc.free(second.block.unwrap());
        assert_eq!(alloc.banks[0].free_bytes(), 1024);
    }

    #[test]
    fn test_pin_cancels_inflight_copy_once() {
        let mut alloc = allocator(1);
        let hole = alloc.allocate(256, key(0)).unwrap();
        let live = alloc.allocate(256, key(1)).unwrap();
        alloc.free(hole.block.unwrap());

        let plan = alloc.plan_moves(1)[0];
        alloc.mark_copy_issued(plan.slot);
        let block = live.block.unwrap();
        assert!(alloc.pin(block));
        assert!(!alloc.pin(block), "second pin finds nothing to cancel");
        assert!(alloc.plan_moves(1).is_empty(), "pinned blocks are not moved");

        let retired = alloc.retire(plan.slot).unwrap();
        assert!(retired.canceled);
        assert_eq!(alloc.banks[0].free_bytes(), 768, "destination returned exactly once");
        assert_eq!(alloc.retire(plan.slot), None);
    }

    #[test]
    fn test_free_after_relocate_keeps_source_until_retire() {
        let mut alloc = allocator(1);
        let hole = alloc.allocate(512, key(0)).unwrap();
        let live = alloc.allocate(256, key(1)).unwrap();
        alloc.free(hole.block.unwrap());

        let plan = alloc.plan_moves(1)[0];
        alloc.mark_copy_issued(plan.slot);
        alloc.relocate(plan.slot).unwrap();
        alloc.free(live.block.unwrap());
        assert_eq!(alloc.banks[0].free_bytes(), 768, "source still reserved");

        alloc.retire(plan.slot).unwrap();
        assert_eq!(alloc.banks[0].free_bytes(), 1024);
    }

    #[test]
    fn test_moves_prefer_lower_banks() {
        let mut alloc = allocator(1);
        alloc.extend(1024);
        let lower = alloc.allocate(1024, key(0)).unwrap();
        let upper = alloc.allocate(512, key(1)).unwrap();
        assert_eq!(upper.bank, 1);
        alloc.free(lower.block.unwrap());

        let plan = alloc.plan_moves(1)[0];
        assert_eq!(plan.src, Location { bank: 1, offset: 0 });
        assert_eq!(plan.dst, Location { bank: 0, offset: 0 });
    }
}
