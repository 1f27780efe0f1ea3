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

//! The banked pool: fixed-size banks carved by an item allocator, with
//! deferred frees, copy-on-write and optional online compaction.

use std::sync::Arc;

use strata_core::{
    BindFlags, BufferDevice, DeviceError, FenceId, MappedRange, NativeBufferDescriptor,
    NativeBufferId, UsageFlags,
};

use super::item::{Access, Bank, Item, Open, OpenKind, Placement};
use super::{AllocatorKind, PoolSettings, PoolStats, UpdaterKind};
use crate::allocator::{
    AllocFailure, DefragAllocator, DirectAllocator, ItemAllocator, MovePlan, MoveState,
};
use crate::error::BufferError;
use crate::native::{create_native, destroy_native};
use crate::ring::DeferredRing;
use crate::table::{SlotKey, SlotTable};
use crate::types::{align_up, BufferLocation};
use crate::updater::{BufferUpdater, DirectUpdater, StagedUpdater};

#[derive(Debug)]
pub(crate) struct BankedPool {
    device: Arc<dyn BufferDevice>,
    settings: PoolSettings,
    usage: UsageFlags,
    bind: BindFlags,
    banks: Vec<Bank>,
    items: SlotTable<Item>,
    allocator: ItemAllocator,
    updater: BufferUpdater,
    ring: DeferredRing<SlotKey>,
    /// `(original, shadow)` swaps waiting for the render thread.
    cow_relocations: Vec<(SlotKey, SlotKey)>,
    lockstep_fence: FenceId,
}

impl BankedPool {
    pub(crate) fn new(
        device: Arc<dyn BufferDevice>,
        settings: PoolSettings,
    ) -> Result<Self, BufferError> {
        let allocator = match settings.allocator {
            AllocatorKind::Direct => {
                ItemAllocator::Direct(DirectAllocator::new(settings.fit, settings.max_allocs))
            }
            AllocatorKind::Defrag { .. } => {
                let mut fences = Vec::with_capacity(settings.max_moves_per_update);
                for _ in 0..settings.max_moves_per_update {
                    fences.push((device.create_fence()?, device.create_fence()?));
                }
                ItemAllocator::Defrag(DefragAllocator::new(
                    settings.fit,
                    settings.max_allocs,
                    fences,
                ))
            }
        };
        let bind = settings.binding.bind_flags();
        let updater = match settings.updater {
            UpdaterKind::Staged => {
                BufferUpdater::Staged(StagedUpdater::new(settings.bank_size, bind))
            }
            UpdaterKind::Direct => BufferUpdater::Direct(DirectUpdater::default()),
            UpdaterKind::Noop => BufferUpdater::Noop,
        };
        let lockstep_fence = device.create_fence()?;
        log::debug!(
            "Created {} {} pool: {} byte banks, {:?} allocator, {:?} updater",
            settings.binding,
            settings.usage,
            settings.bank_size,
            settings.allocator,
            settings.updater
        );
        Ok(Self {
            usage: settings.usage.usage_flags(),
            bind,
            device,
            settings,
            banks: Vec::new(),
            items: SlotTable::new(),
            allocator,
            updater,
            ring: DeferredRing::new(),
            cow_relocations: Vec::new(),
            lockstep_fence,
        })
    }

    fn defragments(&self) -> bool {
        matches!(self.settings.allocator, AllocatorKind::Defrag { enabled: true })
    }

    fn native_usage(&self) -> UsageFlags {
        if self.settings.lockless_updates {
            self.usage | UsageFlags::DIRECT_ACCESS
        } else {
            self.usage
        }
    }

    fn label(&self, what: std::fmt::Arguments<'_>) -> String {
        format!("{} {} {what}", self.settings.binding, self.settings.usage)
    }

    // ── Banks ───────────────────────────────────────────────────────

    fn create_bank_buffer(
        &self,
        index: usize,
    ) -> Result<(NativeBufferId, Option<MappedRange>), BufferError> {
        let label = self.label(format_args!("bank {index}"));
        let descriptor = NativeBufferDescriptor::new(self.settings.bank_size, self.native_usage(), self.bind)
            .with_label(label);
        let id = create_native(&*self.device, &descriptor)?;
        let base = if self.settings.lockless_updates {
            self.device.base_pointer(id)
        } else {
            None
        };
        log::debug!(
            "{} {} pool: bank {index} backed by {id:?} (base pointer: {})",
            self.settings.binding,
            self.settings.usage,
            base.is_some()
        );
        Ok((id, base))
    }

    fn add_bank(&mut self) -> Result<(), BufferError> {
        let index = self.banks.len();
        let (buffer, base) = self.create_bank_buffer(index)?;
        self.banks.push(Bank {
            capacity: self.settings.bank_size,
            free_space: self.settings.bank_size,
            buffer: Some(buffer),
            base,
        });
        self.allocator.extend(self.settings.bank_size);
        debug_assert_eq!(self.allocator.bank_count(), self.banks.len());
        Ok(())
    }

    /// Returns the bank's native buffer, recreating a released one.
    fn ensure_resident(&mut self, bank: usize) -> Result<NativeBufferId, BufferError> {
        if let Some(id) = self.banks[bank].buffer {
            return Ok(id);
        }
        let (id, base) = self.create_bank_buffer(bank)?;
        let record = &mut self.banks[bank];
        record.buffer = Some(id);
        record.base = base;
        Ok(id)
    }

    /// Destroys the native buffer of every bank with nothing allocated in it.
    pub(crate) fn release_empty_banks(&mut self) -> Result<(), BufferError> {
        let mut released = 0;
        for bank in &mut self.banks {
            if !bank.is_empty() {
                continue;
            }
            if let Some(id) = bank.buffer.take() {
                bank.base = None;
                destroy_native(&*self.device, id, bank.capacity)?;
                released += 1;
            }
        }
        if released > 0 {
            log::debug!(
                "{} {} pool: released {released} empty bank(s)",
                self.settings.binding,
                self.settings.usage
            );
        }
        Ok(())
    }

    // ── Allocation ──────────────────────────────────────────────────

    pub(crate) fn allocate(&mut self, size: usize) -> Result<SlotKey, BufferError> {
        let size = align_up(size)?;
        if size > self.settings.bank_size {
            log::debug!(
                "{} {} pool: {size} bytes exceed the bank size, allocating freestanding",
                self.settings.binding,
                self.settings.usage
            );
            return self.allocate_freestanding(size);
        }

        let allocation = match self.allocator.allocate(size) {
            Ok(allocation) => Some(allocation),
            Err(AllocFailure::HandlesExhausted) => None,
            Err(AllocFailure::NoSpace) => {
                self.add_bank()?;
                self.allocator.allocate(size).ok()
            }
        };
        let Some(allocation) = allocation else {
            log::warn!(
                "{} {} pool: no bank space for {size} bytes, falling back to a freestanding buffer",
                self.settings.binding,
                self.settings.usage
            );
            return self.allocate_freestanding(size);
        };

        let buffer = match self.ensure_resident(allocation.bank) {
            Ok(buffer) => buffer,
            Err(err) => {
                self.allocator.free(allocation, size);
                return Err(err);
            }
        };
        self.banks[allocation.bank].free_space -= size;
        let mut item = Item::new(
            size,
            allocation.offset,
            Placement::Banked(allocation.bank),
            buffer,
        );
        item.block = allocation.block;
        let key = self.items.insert(item);
        self.allocator.set_context(allocation.block, key);
        Ok(key)
    }

    fn allocate_freestanding(&mut self, size: usize) -> Result<SlotKey, BufferError> {
        let label = self.label(format_args!("freestanding"));
        let descriptor = NativeBufferDescriptor::new(size, self.native_usage(), self.bind).with_label(label);
        let buffer = create_native(&*self.device, &descriptor)?;
        Ok(self
            .items
            .insert(Item::new(size, 0, Placement::Freestanding, buffer)))
    }

    /// Returns an item's storage right away. Only for storage the GPU can no
    /// longer reference.
    fn release_item(&mut self, key: SlotKey) -> Result<(), BufferError> {
        let Some(item) = self.items.remove(key) else {
            debug_assert!(false, "released unknown item {key:?}");
            return Ok(());
        };
        match item.allocation() {
            Some(allocation) => {
                self.banks[allocation.bank].free_space += item.size;
                self.allocator.free(allocation, item.size);
                Ok(())
            }
            None => destroy_native(&*self.device, item.buffer, item.size),
        }
    }

    fn live_item(&self, key: SlotKey) -> Result<&Item, BufferError> {
        self.items
            .get(key)
            .filter(|item| !item.freed)
            .ok_or(BufferError::StaleHandle)
    }

    fn live_item_mut(&mut self, key: SlotKey) -> Result<&mut Item, BufferError> {
        self.items
            .get_mut(key)
            .filter(|item| !item.freed)
            .ok_or(BufferError::StaleHandle)
    }

    pub(crate) fn free(&mut self, key: SlotKey) -> Result<(), BufferError> {
        if self.live_item(key)?.open.is_some() {
            return Err(BufferError::AlreadyMapped);
        }
        self.apply_pending_cow(key)?;
        let item = self.live_item_mut(key)?;
        match item.placement {
            Placement::Freestanding => self.release_item(key),
            Placement::Banked(_) => {
                item.freed = true;
                let block = item.block;
                self.allocator.pin(block);
                self.ring.push(key);
                Ok(())
            }
        }
    }

    pub(crate) fn size(&self, key: SlotKey) -> Result<usize, BufferError> {
        Ok(self.live_item(key)?.size)
    }

    pub(crate) fn resolve(&self, key: SlotKey) -> Result<BufferLocation, BufferError> {
        let item = self.live_item(key)?;
        Ok(BufferLocation {
            buffer: item.buffer,
            offset: item.offset,
            size: item.size,
        })
    }

    // ── Copy-on-write ───────────────────────────────────────────────

    fn apply_pending_cow(&mut self, key: SlotKey) -> Result<(), BufferError> {
        if let Some(index) = self.cow_relocations.iter().position(|(orig, _)| *orig == key) {
            let (original, shadow) = self.cow_relocations.swap_remove(index);
            self.swap_in_shadow(original, shadow);
        }
        Ok(())
    }

    pub(crate) fn apply_cow_relocations(&mut self) {
        for (original, shadow) in std::mem::take(&mut self.cow_relocations) {
            self.swap_in_shadow(original, shadow);
        }
    }

    /// Moves the freshly written shadow storage under the original handle
    /// and queues the old storage for deferred free.
    fn swap_in_shadow(&mut self, original: SlotKey, shadow: SlotKey) {
        let Some((orig, old)) = self.items.get_pair_mut(original, shadow) else {
            debug_assert!(false, "copy-on-write pair {original:?}/{shadow:?} vanished");
            return;
        };
        orig.swap_storage(old);
        old.freed = true;
        let (new_block, old_block) = (orig.block, old.block);
        self.allocator.set_context(new_block, original);
        self.allocator.set_context(old_block, shadow);
        self.allocator.unpin(new_block);
        self.allocator.pin(old_block);
        self.ring.push(shadow);
        log::trace!("Copy-on-write: {original:?} now backed by the storage of {shadow:?}");
    }

    // ── Reads and writes ────────────────────────────────────────────

    fn base_pointer(&self, item: &Item) -> Option<MappedRange> {
        if !self.settings.lockless_updates {
            return None;
        }
        let base = match item.placement {
            Placement::Banked(bank) => self.banks[bank].base,
            Placement::Freestanding => self.device.base_pointer(item.buffer),
        };
        base.and_then(|base| base.subrange(item.offset, item.size))
    }

    fn map_for_write(&mut self, target: SlotKey) -> Result<(MappedRange, Access), BufferError> {
        let item = self.items.get(target).ok_or(BufferError::StaleHandle)?;
        if let Some(range) = self.base_pointer(item) {
            let needs_flush = !self.usage.contains(UsageFlags::GPU_COHERENT);
            if let Some(item) = self.items.get_mut(target) {
                item.gpu_flush = needs_flush;
            }
            return Ok((range, Access::BasePointer));
        }
        let (buffer, offset, size) = (item.buffer, item.offset, item.size);
        match self
            .updater
            .begin_write(&*self.device, target, buffer, offset, size)?
        {
            Some(range) => Ok((range, Access::Updater)),
            None => {
                log::error!(
                    "{} {} pool: no CPU path to write {buffer:?}",
                    self.settings.binding,
                    self.settings.usage
                );
                Err(BufferError::MapFailed(format!(
                    "no CPU access to native buffer {buffer:?}"
                )))
            }
        }
    }

    /// Opens `key` for writing. The returned range stays valid until
    /// [`BankedPool::end_read_write`].
    pub(crate) fn begin_write(&mut self, key: SlotKey) -> Result<MappedRange, BufferError> {
        if self.live_item(key)?.open.is_some() {
            return Err(BufferError::AlreadyMapped);
        }
        self.apply_pending_cow(key)?;

        let item = self.live_item(key)?;
        let (size, block, interval) = (item.size, item.block, item.last_write_interval);
        let in_use = item.bank().is_some()
            && item.used
            && !self.ring.interval_completed(&*self.device, interval)?;

        let target = if in_use {
            let shadow = self
                .allocate(size)
                .map_err(|source| BufferError::CopyOnWriteFailed {
                    size,
                    source: Box::new(source),
                })?;
            let shadow_block = self.items.get(shadow).and_then(|item| item.block);
            self.allocator.pin(shadow_block);
            log::trace!("Copy-on-write: write to {key:?} redirected to {shadow:?}");
            shadow
        } else {
            if self.allocator.pin(block) {
                log::debug!("Write to {key:?} canceled its in-flight move");
            }
            key
        };

        match self.map_for_write(target) {
            Ok((range, access)) => {
                self.live_item_mut(key)?.open = Some(Open {
                    kind: OpenKind::Write { target },
                    access,
                });
                Ok(range)
            }
            Err(err) => {
                if target == key {
                    self.allocator.unpin(block);
                } else {
                    self.release_item(target)?;
                }
                Err(err)
            }
        }
    }

    pub(crate) fn begin_read(&mut self, key: SlotKey) -> Result<MappedRange, BufferError> {
        if self.live_item(key)?.open.is_some() {
            return Err(BufferError::AlreadyMapped);
        }
        self.apply_pending_cow(key)?;

        let item = self.live_item(key)?;
        let (buffer, offset, size, block) = (item.buffer, item.offset, item.size, item.block);
        let base = self.base_pointer(item);
        self.allocator.pin(block);

        let mapped = match base {
            Some(range) => {
                let invalidated = if self.usage.contains(UsageFlags::CPU_COHERENT) {
                    Ok(())
                } else {
                    self.device.invalidate_cpu_range(buffer, offset, size)
                };
                invalidated
                    .map(|()| (range, Access::BasePointer))
                    .map_err(BufferError::from)
            }
            None => match self
                .updater
                .begin_read(&*self.device, key, buffer, offset, size)
            {
                Ok(Some(range)) => Ok((range, Access::Updater)),
                Ok(None) => Err(BufferError::ReadUnsupported),
                Err(err) => Err(err),
            },
        };
        match mapped {
            Ok((range, access)) => {
                self.live_item_mut(key)?.open = Some(Open {
                    kind: OpenKind::Read,
                    access,
                });
                Ok(range)
            }
            Err(err) => {
                self.allocator.unpin(block);
                Err(err)
            }
        }
    }

    /// Closes a read or write. Off the render thread a copy-on-write swap
    /// is queued for the next update instead of applied.
    pub(crate) fn end_read_write(
        &mut self,
        key: SlotKey,
        on_render_thread: bool,
    ) -> Result<(), BufferError> {
        let open = self.live_item_mut(key)?.open.take().ok_or(BufferError::NotMapped)?;
        match open.kind {
            OpenKind::Read => {
                if open.access == Access::Updater {
                    self.updater.end(&*self.device, key)?;
                }
                let block = self.live_item(key)?.block;
                self.allocator.unpin(block);
            }
            OpenKind::Write { target } => {
                self.finish_write(target, open.access)?;
                if target == key {
                    let block = self.live_item(key)?.block;
                    self.allocator.unpin(block);
                } else if on_render_thread {
                    self.swap_in_shadow(key, target);
                } else {
                    self.cow_relocations.push((key, target));
                }
                if self.settings.full_gpu_sync {
                    self.device.issue_fence(self.lockstep_fence)?;
                    self.device.sync_fence(self.lockstep_fence, true)?;
                }
            }
        }
        Ok(())
    }

    fn finish_write(&mut self, target: SlotKey, access: Access) -> Result<(), BufferError> {
        match access {
            Access::BasePointer => {
                let item = self.items.get_mut(target).ok_or(BufferError::StaleHandle)?;
                if std::mem::take(&mut item.gpu_flush) {
                    self.device
                        .flush_gpu_range(item.buffer, item.offset, item.size)?;
                }
            }
            Access::Updater => self.updater.end(&*self.device, target)?,
        }
        let interval = self.ring.open_interval();
        let item = self.items.get_mut(target).ok_or(BufferError::StaleHandle)?;
        item.used = true;
        item.last_write_interval = interval;
        Ok(())
    }

    /// Writes `data` at the start of the item.
    pub(crate) fn write(
        &mut self,
        key: SlotKey,
        data: &[u8],
        on_render_thread: bool,
    ) -> Result<(), BufferError> {
        let item = self.live_item(key)?;
        if data.len() > item.size {
            return Err(BufferError::WriteTooLarge {
                len: data.len(),
                capacity: item.size,
            });
        }
        let chunked = item.placement == Placement::Freestanding
            && item.size > self.settings.bank_size
            && self.base_pointer(item).is_none();
        if chunked {
            if item.open.is_some() {
                return Err(BufferError::AlreadyMapped);
            }
            let buffer = item.buffer;
            self.updater.write_chunked(
                &*self.device,
                key,
                buffer,
                data,
                self.settings.bank_size,
            )?;
            let interval = self.ring.open_interval();
            let item = self.live_item_mut(key)?;
            item.used = true;
            item.last_write_interval = interval;
            return Ok(());
        }

        let mut range = self.begin_write(key)?;
        // SAFETY: the range is mapped until `end_read_write` below.
        (unsafe { range.as_mut_slice() })[..data.len()].copy_from_slice(data);
        self.end_read_write(key, on_render_thread)
    }

    /// Copies the start of the item into `out`, returning the bytes copied.
    pub(crate) fn read(&mut self, key: SlotKey, out: &mut [u8]) -> Result<usize, BufferError> {
        let range = self.begin_read(key)?;
        let len = out.len().min(range.len());
        // SAFETY: the range is mapped until `end_read_write` below.
        out[..len].copy_from_slice(&unsafe { range.as_slice() }[..len]);
        self.end_read_write(key, true)?;
        Ok(len)
    }

    // ── Compaction ──────────────────────────────────────────────────

    /// Advances every pending move. Blocking processing waits for each
    /// fence and runs the moves to completion.
    ///
    /// ## Returns
    ///
    /// The number of moves still in flight.
    fn process_moves(&mut self, block: bool) -> Result<usize, BufferError> {
        let Some(defrag) = self.allocator.as_defrag_mut() else {
            return Ok(0);
        };
        let device = &*self.device;
        let mut in_flight = 0;
        for slot in 0..defrag.slot_count() {
            let (copy_fence, relocate_fence) = defrag.fences(slot);
            while let Some(state) = defrag.state(slot) {
                match state {
                    MoveState::Idle => {
                        in_flight += 1;
                        break;
                    }
                    MoveState::CopyIssued => {
                        if !device.sync_fence(copy_fence, block)? {
                            in_flight += 1;
                            break;
                        }
                        let Some(relocation) = defrag.relocate(slot) else {
                            in_flight += 1;
                            break;
                        };
                        if let Some(item) = self.items.get_mut(relocation.context) {
                            item.offset = relocation.dst.offset;
                            item.placement = Placement::Banked(relocation.dst.bank);
                            if let Some(buffer) = self.banks[relocation.dst.bank].buffer {
                                item.buffer = buffer;
                            }
                        }
                        device.issue_fence(relocate_fence)?;
                        log::trace!(
                            "Relocated {:?} to bank {} offset {}",
                            relocation.context,
                            relocation.dst.bank,
                            relocation.dst.offset
                        );
                        if !block {
                            in_flight += 1;
                            break;
                        }
                    }
                    MoveState::Relocated | MoveState::Canceled => {
                        if state == MoveState::Relocated
                            && !device.sync_fence(relocate_fence, block)?
                        {
                            in_flight += 1;
                            break;
                        }
                        if let Some(retired) = defrag.retire(slot) {
                            self.banks[retired.bank].free_space += retired.size;
                            log::trace!(
                                "Retired {} move slot {slot}: {} bytes back to bank {}",
                                if retired.canceled { "canceled" } else { "completed" },
                                retired.size,
                                retired.bank
                            );
                        }
                    }
                }
            }
        }
        Ok(in_flight)
    }

    fn defragment(&mut self, budget: usize) -> Result<(), BufferError> {
        let plans = match self.allocator.as_defrag_mut() {
            Some(defrag) => defrag.plan_moves(budget),
            None => return Ok(()),
        };
        if !plans.is_empty() {
            log::trace!(
                "{} {} pool: starting {} move(s)",
                self.settings.binding,
                self.settings.usage,
                plans.len()
            );
        }
        for plan in plans {
            if let Err(err) = self.begin_copy(&plan) {
                log::warn!("Abandoning move of {:?}: {err}", plan.context);
                if let Some(defrag) = self.allocator.as_defrag_mut() {
                    defrag.abandon(plan.slot);
                }
            }
        }
        Ok(())
    }

    fn begin_copy(&mut self, plan: &MovePlan) -> Result<(), BufferError> {
        let dst = self.ensure_resident(plan.dst.bank)?;
        let src = self.banks[plan.src.bank].buffer.ok_or_else(|| {
            BufferError::Device(DeviceError::Backend(format!(
                "bank {} has no native buffer",
                plan.src.bank
            )))
        })?;
        self.updater.move_region(
            &*self.device,
            dst,
            plan.dst.offset,
            src,
            plan.src.offset,
            plan.size,
        )?;
        let Some(defrag) = self.allocator.as_defrag_mut() else {
            return Ok(());
        };
        let (copy_fence, _) = defrag.fences(plan.slot);
        self.device.issue_fence(copy_fence)?;
        defrag.mark_copy_issued(plan.slot);
        self.banks[plan.dst.bank].free_space -= plan.size;
        Ok(())
    }

    // ── Frame hooks ─────────────────────────────────────────────────

    /// Per-frame maintenance. `fence` is the frame fence the caller issues
    /// once every pool has been updated.
    pub(crate) fn update(
        &mut self,
        frame_id: u64,
        fence: FenceId,
        allow_defrag: bool,
    ) -> Result<(), BufferError> {
        let in_flight = self.process_moves(false)?;

        let mut retired = Vec::new();
        self.ring.retire_ready(&*self.device, &mut retired)?;
        self.ring
            .seal(&*self.device, frame_id, fence, &mut retired)?;
        for key in retired {
            self.release_item(key)?;
        }

        self.apply_cow_relocations();

        if allow_defrag && self.defragments() {
            let budget = self.settings.max_moves_per_update.saturating_sub(in_flight);
            self.defragment(budget)?;
        }
        Ok(())
    }

    /// Waits for the GPU, then settles every move, deferred free and queued
    /// relocation.
    pub(crate) fn sync(&mut self) -> Result<(), BufferError> {
        self.process_moves(true)?;
        self.device.issue_fence(self.lockstep_fence)?;
        self.device.sync_fence(self.lockstep_fence, true)?;

        let mut retired = Vec::new();
        self.ring.drain_all(&mut retired);
        for key in retired {
            self.release_item(key)?;
        }
        self.apply_cow_relocations();
        self.release_empty_banks()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            bank_size: self.settings.bank_size,
            bank_count: self.banks.len(),
            deferred_items: self.ring.pending(),
            pending_relocations: self.cow_relocations.len(),
            moves_in_flight: self.allocator.as_defrag().map_or(0, |d| d.in_flight()),
            ..Default::default()
        };
        for bank in &self.banks {
            if bank.buffer.is_some() {
                stats.live_banks += 1;
                stats.free_bytes += bank.free_space;
            }
            stats.bytes_in_use += bank.capacity - bank.free_space;
        }
        for (_, item) in self.items.iter() {
            if item.freed {
                continue;
            }
            stats.allocations += 1;
            if item.placement == Placement::Freestanding {
                stats.freestanding += 1;
                stats.bytes_in_use += item.size;
            }
        }
        stats
    }

    /// Destroys every native resource the pool owns.
    pub(crate) fn teardown(&mut self) -> Result<(), BufferError> {
        let leaked = self.items.iter().filter(|(_, item)| !item.freed).count();
        if leaked > 0 {
            log::warn!(
                "{} {} pool: {leaked} allocation(s) still alive at shutdown ({} in banks)",
                self.settings.binding,
                self.settings.usage,
                self.allocator.live()
            );
        }
        let freestanding: Vec<(NativeBufferId, usize)> = self
            .items
            .iter()
            .filter(|(_, item)| item.placement == Placement::Freestanding)
            .map(|(_, item)| (item.buffer, item.size))
            .collect();
        for (buffer, size) in freestanding {
            destroy_native(&*self.device, buffer, size)?;
        }
        self.items = SlotTable::new();
        for bank in &mut self.banks {
            if let Some(id) = bank.buffer.take() {
                bank.base = None;
                destroy_native(&*self.device, id, bank.capacity)?;
            }
        }
        self.updater.destroy(&*self.device)?;
        if let Some(defrag) = self.allocator.as_defrag() {
            for fence in defrag.all_fences() {
                self.device.destroy_fence(fence)?;
            }
        }
        self.device.destroy_fence(self.lockstep_fence)?;
        Ok(())
    }
}
