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

//! Sub-allocation inside banks.
//!
//! A pool owns exactly one [`ItemAllocator`]. Both variants carve banks with
//! the same free-list primitive; only the defragmenting one tracks blocks and
//! can move them.

mod defrag;
mod direct;
mod free_list;

pub(crate) use self::defrag::{BlockHandle, DefragAllocator, MovePlan, MoveState};
pub(crate) use self::direct::DirectAllocator;
pub(crate) use self::free_list::Fit;

use crate::table::SlotKey;

/// Where an allocation landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Allocation {
    pub(crate) bank: usize,
    pub(crate) offset: usize,
    pub(crate) block: Option<BlockHandle>,
}

/// Why an allocation could not be served from the existing banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocFailure {
    /// No bank has a large enough free region. Extending may help.
    NoSpace,
    /// The allocator-wide allocation limit is reached.
    HandlesExhausted,
}

#[derive(Debug)]
pub(crate) enum ItemAllocator {
    Direct(DirectAllocator),
    Defrag(DefragAllocator),
}

impl ItemAllocator {
    pub(crate) fn extend(&mut self, capacity: usize) {
        match self {
            Self::Direct(alloc) => alloc.extend(capacity),
            Self::Defrag(alloc) => alloc.extend(capacity),
        }
    }

    pub(crate) fn bank_count(&self) -> usize {
        match self {
            Self::Direct(alloc) => alloc.bank_count(),
            Self::Defrag(alloc) => alloc.bank_count(),
        }
    }

    pub(crate) fn live(&self) -> usize {
        match self {
            Self::Direct(alloc) => alloc.live(),
            Self::Defrag(alloc) => alloc.live(),
        }
    }

    /// Defrag blocks start without an owner; see [`ItemAllocator::set_context`].
    pub(crate) fn allocate(&mut self, size: usize) -> Result<Allocation, AllocFailure> {
        match self {
            Self::Direct(alloc) => alloc.allocate(size),
            Self::Defrag(alloc) => alloc.allocate(size, SlotKey::DANGLING),
        }
    }

    pub(crate) fn free(&mut self, allocation: Allocation, size: usize) {
        match (self, allocation.block) {
            (Self::Defrag(alloc), Some(block)) => alloc.free(block),
            (Self::Direct(alloc), None) => alloc.free(allocation.bank, allocation.offset, size),
            (_, block) => debug_assert!(false, "allocation {block:?} freed into the wrong allocator"),
        }
    }

    /// Returns `true` if pinning canceled an in-flight move.
    pub(crate) fn pin(&mut self, block: Option<BlockHandle>) -> bool {
        match (self, block) {
            (Self::Defrag(alloc), Some(block)) => alloc.pin(block),
            _ => false,
        }
    }

    pub(crate) fn unpin(&mut self, block: Option<BlockHandle>) {
        if let (Self::Defrag(alloc), Some(block)) = (self, block) {
            alloc.unpin(block);
        }
    }

    pub(crate) fn set_context(&mut self, block: Option<BlockHandle>, context: SlotKey) {
        if let (Self::Defrag(alloc), Some(block)) = (self, block) {
            alloc.set_context(block, context);
        }
    }

    pub(crate) fn as_defrag_mut(&mut self) -> Option<&mut DefragAllocator> {
        match self {
            Self::Defrag(alloc) => Some(alloc),
            Self::Direct(_) => None,
        }
    }

    pub(crate) fn as_defrag(&self) -> Option<&DefragAllocator> {
        match self {
            Self::Defrag(alloc) => Some(alloc),
            Self::Direct(_) => None,
        }
    }
}
