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

//! Constant-buffer sub-allocation.
//!
//! Requests are rounded to a power-of-two bucket of at least
//! [`MIN_CONSTANT_BUFFER_SIZE`] bytes. Each bucket owns pages: native
//! constant buffers of `cb_bank_size` bytes split into equal slots by a
//! [`PartitionAllocator`]. Freed slots go through a fence ring and are only
//! reused once the frame that freed them has retired on the GPU.

mod partition;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use strata_core::{
    BindFlags, BufferDevice, FenceId, MapMode, MappedRange, NativeBufferDescriptor, NativeBufferId,
    UsageFlags,
};

use self::partition::PartitionAllocator;
use crate::config::MIN_CONSTANT_BUFFER_SIZE;
use crate::error::BufferError;
use crate::native::{create_native, destroy_native, map_failed};
use crate::ring::DeferredRing;
use crate::table::{SlotKey, SlotTable};
use crate::types::BufferLocation;

/// Number of size buckets, covering 256 bytes to 32 MB.
pub(crate) const BUCKET_COUNT: usize = 18;

const MIN_BUCKET_SHIFT: u32 = MIN_CONSTANT_BUFFER_SIZE.trailing_zeros();

/// A constant-buffer slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstantBufferHandle {
    page: SlotKey,
    slot: u32,
    generation: u32,
}

impl fmt::Debug for ConstantBufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConstantBufferHandle(page #{}v{} slot {} v{})",
            self.page.index, self.page.generation, self.slot, self.generation
        )
    }
}

/// A snapshot of the constant-buffer allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConstantBufferStats {
    /// Pages alive, all buckets together.
    pub pages: usize,
    /// Bytes held by pages.
    pub page_bytes: usize,
    /// Slots handed out, including those waiting for their fence.
    pub live_slots: usize,
    /// Freed slots waiting for their fence.
    pub pending_frees: usize,
}

#[derive(Debug)]
struct ConstantPage {
    buffer: NativeBufferId,
    base: Option<MappedRange>,
    bucket: usize,
    slot_size: usize,
    slots: PartitionAllocator,
    generations: Vec<u32>,
}

/// Rounds `size` to its bucket: `(bucket index, slot size)`.
pub(crate) fn bucket_for(size: usize) -> Option<(usize, usize)> {
    let slot_size = size
        .max(1)
        .checked_next_power_of_two()?
        .max(MIN_CONSTANT_BUFFER_SIZE);
    let bucket = (slot_size.trailing_zeros() - MIN_BUCKET_SHIFT) as usize;
    (bucket < BUCKET_COUNT).then_some((bucket, slot_size))
}

#[derive(Debug)]
pub(crate) struct ConstantBufferAllocator {
    device: Arc<dyn BufferDevice>,
    page_size: usize,
    threshold: usize,
    lockless_updates: bool,
    pages: SlotTable<ConstantPage>,
    buckets: Vec<Vec<SlotKey>>,
    retired: DeferredRing<(SlotKey, u32)>,
}

impl ConstantBufferAllocator {
    pub(crate) fn new(
        device: Arc<dyn BufferDevice>,
        page_size: usize,
        threshold: usize,
        lockless_updates: bool,
    ) -> Self {
        Self {
            device,
            page_size,
            threshold,
            lockless_updates,
            pages: SlotTable::new(),
            buckets: vec![Vec::new(); BUCKET_COUNT],
            retired: DeferredRing::new(),
        }
    }

    fn try_allocate(&mut self, bucket: usize) -> Option<ConstantBufferHandle> {
        for &key in self.buckets[bucket].iter().rev() {
            let Some(page) = self.pages.get_mut(key) else {
                continue;
            };
            if let Some(slot) = page.slots.allocate() {
                return Some(ConstantBufferHandle {
                    page: key,
                    slot,
                    generation: page.generations[slot as usize],
                });
            }
        }
        None
    }

    fn create_page(&mut self, bucket: usize, slot_size: usize) -> Result<(), BufferError> {
        let mut usage = UsageFlags::DYNAMIC | UsageFlags::CPU_WRITE;
        if self.lockless_updates {
            usage |= UsageFlags::DIRECT_ACCESS;
        }
        let label = format!("constant page {slot_size}B");
        let descriptor =
            NativeBufferDescriptor::new(self.page_size, usage, BindFlags::CONSTANT).with_label(label);
        let buffer = create_native(&*self.device, &descriptor)?;
        let base = if self.lockless_updates {
            self.device.base_pointer(buffer)
        } else {
            None
        };
        let capacity = self.page_size / slot_size;
        let key = self.pages.insert(ConstantPage {
            buffer,
            base,
            bucket,
            slot_size,
            slots: PartitionAllocator::new(capacity),
            generations: vec![0; capacity],
        });
        self.buckets[bucket].push(key);
        log::debug!("Created constant page {key:?}: {capacity} slots of {slot_size} bytes");
        Ok(())
    }

    pub(crate) fn allocate(&mut self, size: usize) -> Result<ConstantBufferHandle, BufferError> {
        let too_large = BufferError::ConstantBufferTooLarge {
            size,
            max: self.page_size,
        };
        let Some((bucket, slot_size)) = bucket_for(size) else {
            return Err(too_large);
        };
        if slot_size > self.page_size {
            return Err(too_large);
        }
        if let Some(handle) = self.try_allocate(bucket) {
            return Ok(handle);
        }
        self.create_page(bucket, slot_size)?;
        self.try_allocate(bucket).ok_or(BufferError::OutOfVideoMemory { size: slot_size })
    }

    fn page(&self, handle: ConstantBufferHandle) -> Result<&ConstantPage, BufferError> {
        self.pages
            .get(handle.page)
            .filter(|page| page.generations.get(handle.slot as usize) == Some(&handle.generation))
            .ok_or(BufferError::StaleHandle)
    }

    /// Queues the slot for reuse once the current frame retires.
    pub(crate) fn free(&mut self, handle: ConstantBufferHandle) -> Result<(), BufferError> {
        self.page(handle)?;
        if let Some(page) = self.pages.get_mut(handle.page) {
            let generation = &mut page.generations[handle.slot as usize];
            *generation = generation.wrapping_add(1);
        }
        self.retired.push((handle.page, handle.slot));
        Ok(())
    }

    pub(crate) fn resolve(&self, handle: ConstantBufferHandle) -> Result<BufferLocation, BufferError> {
        let page = self.page(handle)?;
        Ok(BufferLocation {
            buffer: page.buffer,
            offset: handle.slot as usize * page.slot_size,
            size: page.slot_size,
        })
    }

    pub(crate) fn write(
        &mut self,
        handle: ConstantBufferHandle,
        data: &[u8],
    ) -> Result<(), BufferError> {
        let page = self.page(handle)?;
        if data.len() > page.slot_size {
            return Err(BufferError::WriteTooLarge {
                len: data.len(),
                capacity: page.slot_size,
            });
        }
        let offset = handle.slot as usize * page.slot_size;
        if let Some(mut range) = page.base.and_then(|base| base.subrange(offset, data.len())) {
            // SAFETY: base pointers stay mapped for the page's lifetime.
            unsafe { range.as_mut_slice() }.copy_from_slice(data);
            return Ok(());
        }
        let buffer = page.buffer;
        let mapped = self
            .device
            .map(buffer, MapMode::WriteNoOverwrite)
            .map_err(|err| map_failed(buffer, err))?;
        if let Some(mut range) = mapped.subrange(offset, data.len()) {
            // SAFETY: mapped until the unmap below.
            unsafe { range.as_mut_slice() }.copy_from_slice(data);
        }
        self.device.unmap(buffer)?;
        Ok(())
    }

    fn recycle(&mut self, retired: Vec<(SlotKey, u32)>) {
        for (key, slot) in retired {
            let released = self
                .pages
                .get_mut(key)
                .is_some_and(|page| page.slots.free(slot));
            debug_assert!(released, "constant slot {slot} of {key:?} freed twice");
        }
    }

    pub(crate) fn update(&mut self, frame_id: u64, fence: FenceId) -> Result<(), BufferError> {
        let mut retired = Vec::new();
        self.retired.retire_ready(&*self.device, &mut retired)?;
        self.retired
            .seal(&*self.device, frame_id, fence, &mut retired)?;
        self.recycle(retired);
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<(), BufferError> {
        let mut retired = Vec::new();
        self.retired
            .retire_sealed_blocking(&*self.device, &mut retired)?;
        self.recycle(retired);
        Ok(())
    }

    /// Deletes empty pages, but only while the pages together exceed the
    /// configured threshold.
    pub(crate) fn release_empty_banks(&mut self) -> Result<(), BufferError> {
        if self.pages.len() * self.page_size <= self.threshold {
            return Ok(());
        }
        let empty: Vec<SlotKey> = self
            .pages
            .iter()
            .filter(|(_, page)| page.slots.is_empty())
            .map(|(key, _)| key)
            .collect();
        for key in empty {
            if let Some(page) = self.pages.remove(key) {
                self.buckets[page.bucket].retain(|&k| k != key);
                destroy_native(&*self.device, page.buffer, self.page_size)?;
            }
        }
        Ok(())
    }

    pub(crate) fn stats(&self) -> ConstantBufferStats {
        ConstantBufferStats {
            pages: self.pages.len(),
            page_bytes: self.pages.len() * self.page_size,
            live_slots: self.pages.iter().map(|(_, page)| page.slots.len()).sum(),
            pending_frees: self.retired.pending(),
        }
    }

    pub(crate) fn teardown(&mut self) -> Result<(), BufferError> {
        let pages = std::mem::take(&mut self.pages);
        for (_, page) in pages.iter() {
            destroy_native(&*self.device, page.buffer, self.page_size)?;
        }
        self.buckets.iter_mut().for_each(Vec::clear);
        Ok(())
    }
}
