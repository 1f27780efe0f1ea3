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

//! The transient ring pool: one buffer, bump allocation, reset every frame.

use std::sync::Arc;

use strata_core::{
    BufferDevice, MapMode, MappedRange, NativeBufferDescriptor, NativeBufferId, UsageFlags,
};

use super::{PoolSettings, PoolStats};
use crate::error::BufferError;
use crate::native::{create_native, destroy_native, map_failed};
use crate::table::{SlotKey, SlotTable};
use crate::types::{align_up, BufferLocation};

#[derive(Debug)]
struct TransientItem {
    offset: usize,
    size: usize,
    open: bool,
}

#[derive(Debug)]
pub(crate) struct TransientPool {
    device: Arc<dyn BufferDevice>,
    settings: PoolSettings,
    usage: UsageFlags,
    capacity: usize,
    buffer: NativeBufferId,
    base: Option<MappedRange>,
    cursor: usize,
    next_map: MapMode,
    mapping: Option<(MappedRange, usize)>,
    items: SlotTable<TransientItem>,
}

impl TransientPool {
    pub(crate) fn new(
        device: Arc<dyn BufferDevice>,
        settings: PoolSettings,
        capacity: usize,
    ) -> Result<Self, BufferError> {
        let usage = settings.usage.usage_flags();
        let native_usage = if settings.lockless_updates {
            usage | UsageFlags::DIRECT_ACCESS
        } else {
            usage
        };
        let label = format!("{} {} transient ring", settings.binding, settings.usage);
        let descriptor =
            NativeBufferDescriptor::new(capacity, native_usage, settings.binding.bind_flags())
                .with_label(label);
        let buffer = create_native(&*device, &descriptor)?;
        let base = if settings.lockless_updates {
            device.base_pointer(buffer)
        } else {
            None
        };
        log::debug!(
            "Created {} {} transient pool of {capacity} bytes",
            settings.binding,
            settings.usage
        );
        Ok(Self {
            device,
            settings,
            usage,
            capacity,
            buffer,
            base,
            cursor: 0,
            next_map: MapMode::WriteDiscard,
            mapping: None,
            items: SlotTable::new(),
        })
    }

    pub(crate) fn allocate(&mut self, size: usize) -> Result<SlotKey, BufferError> {
        let size = align_up(size)?;
        if size > self.capacity {
            return Err(BufferError::TransientOverflow {
                size,
                capacity: self.capacity,
            });
        }
        if self.cursor + size > self.capacity {
            log::trace!(
                "{} {} transient pool wrapped",
                self.settings.binding,
                self.settings.usage
            );
            self.cursor = 0;
            self.next_map = MapMode::WriteDiscard;
        }
        let offset = self.cursor;
        self.cursor += size;
        Ok(self.items.insert(TransientItem {
            offset,
            size,
            open: false,
        }))
    }

    pub(crate) fn free(&mut self, key: SlotKey) -> Result<(), BufferError> {
        let item = self.items.get(key).ok_or(BufferError::StaleHandle)?;
        if item.open {
            return Err(BufferError::AlreadyMapped);
        }
        self.items.remove(key);
        Ok(())
    }

    fn item(&self, key: SlotKey) -> Result<&TransientItem, BufferError> {
        self.items.get(key).ok_or(BufferError::StaleHandle)
    }

    pub(crate) fn size(&self, key: SlotKey) -> Result<usize, BufferError> {
        Ok(self.item(key)?.size)
    }

    pub(crate) fn resolve(&self, key: SlotKey) -> Result<BufferLocation, BufferError> {
        let item = self.item(key)?;
        Ok(BufferLocation {
            buffer: self.buffer,
            offset: item.offset,
            size: item.size,
        })
    }

    pub(crate) fn begin_write(&mut self, key: SlotKey) -> Result<MappedRange, BufferError> {
        let item = self.item(key)?;
        if item.open {
            return Err(BufferError::AlreadyMapped);
        }
        let (offset, size) = (item.offset, item.size);
        let whole = match (self.base, self.mapping.as_mut()) {
            (Some(base), _) => base,
            (None, Some((mapped, users))) => {
                *users += 1;
                *mapped
            }
            (None, None) => {
                let mapped = self
                    .device
                    .map(self.buffer, self.next_map)
                    .map_err(|err| map_failed(self.buffer, err))?;
                self.next_map = MapMode::WriteNoOverwrite;
                self.mapping = Some((mapped, 1));
                mapped
            }
        };
        let range = whole
            .subrange(offset, size)
            .ok_or_else(|| BufferError::MapFailed(format!("transient range {offset}+{size}")))?;
        if let Some(item) = self.items.get_mut(key) {
            item.open = true;
        }
        Ok(range)
    }

    pub(crate) fn end_write(&mut self, key: SlotKey) -> Result<(), BufferError> {
        let item = self.items.get_mut(key).ok_or(BufferError::StaleHandle)?;
        if !std::mem::take(&mut item.open) {
            return Err(BufferError::NotMapped);
        }
        let (offset, size) = (item.offset, item.size);
        if self.base.is_some() {
            if !self.usage.contains(UsageFlags::GPU_COHERENT) {
                self.device.flush_gpu_range(self.buffer, offset, size)?;
            }
            return Ok(());
        }
        if let Some((_, users)) = self.mapping.as_mut() {
            *users -= 1;
            if *users == 0 {
                self.mapping = None;
                self.device.unmap(self.buffer)?;
            }
        }
        Ok(())
    }

    pub(crate) fn write(&mut self, key: SlotKey, data: &[u8]) -> Result<(), BufferError> {
        let size = self.item(key)?.size;
        if data.len() > size {
            return Err(BufferError::WriteTooLarge {
                len: data.len(),
                capacity: size,
            });
        }
        let mut range = self.begin_write(key)?;
        // SAFETY: mapped until `end_write`.
        (unsafe { range.as_mut_slice() })[..data.len()].copy_from_slice(data);
        self.end_write(key)
    }

    /// Rewinds the ring. Every allocation of the frame must be gone.
    pub(crate) fn update(&mut self) {
        if !self.items.is_empty() {
            log::error!(
                "{} {} transient pool: {} allocation(s) outlived their frame",
                self.settings.binding,
                self.settings.usage,
                self.items.len()
            );
            debug_assert!(self.items.is_empty(), "transient allocations outlived their frame");
        }
        self.cursor = 0;
        self.next_map = MapMode::WriteDiscard;
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            bank_size: self.capacity,
            bank_count: 1,
            live_banks: 1,
            allocations: self.items.len(),
            bytes_in_use: self.cursor,
            free_bytes: self.capacity - self.cursor,
            ..Default::default()
        }
    }

    pub(crate) fn teardown(&mut self) -> Result<(), BufferError> {
        if self.mapping.take().is_some() {
            self.device.unmap(self.buffer)?;
        }
        destroy_native(&*self.device, self.buffer, self.capacity)
    }
}
