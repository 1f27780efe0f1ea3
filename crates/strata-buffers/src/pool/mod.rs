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

//! Buffer pools, one per (binding × usage) combination.

mod banked;
mod item;
mod transient;

use std::sync::Arc;

use serde::Serialize;
use strata_core::{BufferDevice, FenceId, MappedRange};

use crate::allocator::Fit;
use crate::error::BufferError;
use crate::table::SlotKey;
use crate::types::{BindingType, BufferLocation, UsageClass};

pub(crate) use self::banked::BankedPool;
pub(crate) use self::transient::TransientPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocatorKind {
    Direct,
    /// `enabled` turns on the per-update compaction tick.
    Defrag { enabled: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdaterKind {
    Staged,
    Direct,
    Noop,
}

#[derive(Debug, Clone)]
pub(crate) struct PoolSettings {
    pub(crate) binding: BindingType,
    pub(crate) usage: UsageClass,
    pub(crate) bank_size: usize,
    pub(crate) max_allocs: usize,
    pub(crate) max_moves_per_update: usize,
    pub(crate) fit: Fit,
    pub(crate) allocator: AllocatorKind,
    pub(crate) updater: UpdaterKind,
    pub(crate) lockless_updates: bool,
    pub(crate) full_gpu_sync: bool,
}

/// A snapshot of one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Capacity of each bank in bytes.
    pub bank_size: usize,
    /// Bank records, including released ones.
    pub bank_count: usize,
    /// Banks currently backed by a native buffer.
    pub live_banks: usize,
    /// Live allocations, freestanding ones included.
    pub allocations: usize,
    /// Allocations with a dedicated native buffer.
    pub freestanding: usize,
    /// Bytes held by banks and freestanding buffers.
    pub bytes_in_use: usize,
    /// Free bytes in resident banks.
    pub free_bytes: usize,
    /// Compaction moves not yet retired.
    pub moves_in_flight: usize,
    /// Frees waiting for their frame fence.
    pub deferred_items: usize,
    /// Copy-on-write swaps waiting for the render thread.
    pub pending_relocations: usize,
}

#[derive(Debug)]
pub(crate) enum BufferPool {
    Banked(BankedPool),
    Transient(TransientPool),
}

impl BufferPool {
    pub(crate) fn banked(
        device: Arc<dyn BufferDevice>,
        settings: PoolSettings,
    ) -> Result<Self, BufferError> {
        BankedPool::new(device, settings).map(Self::Banked)
    }

    pub(crate) fn transient(
        device: Arc<dyn BufferDevice>,
        settings: PoolSettings,
        capacity: usize,
    ) -> Result<Self, BufferError> {
        TransientPool::new(device, settings, capacity).map(Self::Transient)
    }

    pub(crate) fn allocate(&mut self, size: usize) -> Result<SlotKey, BufferError> {
        match self {
            Self::Banked(pool) => pool.allocate(size),
            Self::Transient(pool) => pool.allocate(size),
        }
    }

    pub(crate) fn free(&mut self, key: SlotKey) -> Result<(), BufferError> {
        match self {
            Self::Banked(pool) => pool.free(key),
            Self::Transient(pool) => pool.free(key),
        }
    }

    pub(crate) fn size(&self, key: SlotKey) -> Result<usize, BufferError> {
        match self {
            Self::Banked(pool) => pool.size(key),
            Self::Transient(pool) => pool.size(key),
        }
    }

    pub(crate) fn resolve(&self, key: SlotKey) -> Result<BufferLocation, BufferError> {
        match self {
            Self::Banked(pool) => pool.resolve(key),
            Self::Transient(pool) => pool.resolve(key),
        }
    }

    pub(crate) fn begin_read(&mut self, key: SlotKey) -> Result<MappedRange, BufferError> {
        match self {
            Self::Banked(pool) => pool.begin_read(key),
            Self::Transient(_) => Err(BufferError::ReadUnsupported),
        }
    }

    pub(crate) fn begin_write(&mut self, key: SlotKey) -> Result<MappedRange, BufferError> {
        match self {
            Self::Banked(pool) => pool.begin_write(key),
            Self::Transient(pool) => pool.begin_write(key),
        }
    }

    pub(crate) fn end_read_write(
        &mut self,
        key: SlotKey,
        on_render_thread: bool,
    ) -> Result<(), BufferError> {
        match self {
            Self::Banked(pool) => pool.end_read_write(key, on_render_thread),
            Self::Transient(pool) => pool.end_write(key),
        }
    }

    pub(crate) fn write(
        &mut self,
        key: SlotKey,
        data: &[u8],
        on_render_thread: bool,
    ) -> Result<(), BufferError> {
        match self {
            Self::Banked(pool) => pool.write(key, data, on_render_thread),
            Self::Transient(pool) => pool.write(key, data),
        }
    }

    pub(crate) fn read(&mut self, key: SlotKey, out: &mut [u8]) -> Result<usize, BufferError> {
        match self {
            Self::Banked(pool) => pool.read(key, out),
            Self::Transient(_) => Err(BufferError::ReadUnsupported),
        }
    }

    pub(crate) fn update(
        &mut self,
        frame_id: u64,
        fence: FenceId,
        allow_defrag: bool,
    ) -> Result<(), BufferError> {
        match self {
            Self::Banked(pool) => pool.update(frame_id, fence, allow_defrag),
            Self::Transient(pool) => {
                pool.update();
                Ok(())
            }
        }
    }

    pub(crate) fn sync(&mut self) -> Result<(), BufferError> {
        match self {
            Self::Banked(pool) => pool.sync(),
            Self::Transient(_) => Ok(()),
        }
    }

    pub(crate) fn release_empty_banks(&mut self) -> Result<(), BufferError> {
        match self {
            Self::Banked(pool) => pool.release_empty_banks(),
            Self::Transient(_) => Ok(()),
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        match self {
            Self::Banked(pool) => pool.stats(),
            Self::Transient(pool) => pool.stats(),
        }
    }

    pub(crate) fn teardown(&mut self) -> Result<(), BufferError> {
        match self {
            Self::Banked(pool) => pool.teardown(),
            Self::Transient(pool) => pool.teardown(),
        }
    }
}
