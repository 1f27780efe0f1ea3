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

//! Bank and item records of a banked pool.

use strata_core::{MappedRange, NativeBufferId};

use crate::allocator::{Allocation, BlockHandle};
use crate::table::SlotKey;

/// One fixed-capacity backing buffer.
///
/// The record outlives its native buffer: releasing an empty bank clears
/// `buffer`, and the next allocation or move into it recreates one.
#[derive(Debug)]
pub(crate) struct Bank {
    pub(crate) capacity: usize,
    pub(crate) free_space: usize,
    pub(crate) buffer: Option<NativeBufferId>,
    pub(crate) base: Option<MappedRange>,
}

impl Bank {
    pub(crate) fn is_empty(&self) -> bool {
        self.free_space == self.capacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Banked(usize),
    /// Owns a dedicated native buffer.
    Freestanding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    BasePointer,
    Updater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenKind {
    Read,
    /// `target` is the item actually written: the item itself, or its
    /// copy-on-write shadow.
    Write { target: SlotKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Open {
    pub(crate) kind: OpenKind,
    pub(crate) access: Access,
}

#[derive(Debug)]
pub(crate) struct Item {
    pub(crate) size: usize,
    pub(crate) offset: usize,
    pub(crate) placement: Placement,
    pub(crate) buffer: NativeBufferId,
    pub(crate) block: Option<BlockHandle>,
    /// Written at least once.
    pub(crate) used: bool,
    /// A base-pointer write needs a GPU flush when it ends.
    pub(crate) gpu_flush: bool,
    /// Deferred-ring interval of the last completed write.
    pub(crate) last_write_interval: u64,
    pub(crate) open: Option<Open>,
    /// Queued for deferred free; unreachable through handles.
    pub(crate) freed: bool,
}

impl Item {
    pub(crate) fn new(size: usize, offset: usize, placement: Placement, buffer: NativeBufferId) -> Self {
        Self {
            size,
            offset,
            placement,
            buffer,
            block: None,
            used: false,
            gpu_flush: false,
            last_write_interval: 0,
            open: None,
            freed: false,
        }
    }

    pub(crate) fn bank(&self) -> Option<usize> {
        match self.placement {
            Placement::Banked(bank) => Some(bank),
            Placement::Freestanding => None,
        }
    }

    pub(crate) fn allocation(&self) -> Option<Allocation> {
        self.bank().map(|bank| Allocation {
            bank,
            offset: self.offset,
            block: self.block,
        })
    }

    /// Exchanges backing storage with `other`; the write stamp follows the
    /// storage.
    pub(crate) fn swap_storage(&mut self, other: &mut Item) {
        std::mem::swap(&mut self.offset, &mut other.offset);
        std::mem::swap(&mut self.placement, &mut other.placement);
        std::mem::swap(&mut self.buffer, &mut other.buffer);
        std::mem::swap(&mut self.block, &mut other.block);
        std::mem::swap(&mut self.used, &mut other.used);
        std::mem::swap(&mut self.last_write_interval, &mut other.last_write_interval);
    }
}
