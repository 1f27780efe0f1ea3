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

//! The host backend: native buffers live in boxed CPU memory and the GPU is
//! a simulated timeline of issued fences.
//!
//! Every issued fence takes the next serial of the submission stream. The
//! simulated GPU has executed everything up to `completed`. In the default
//! auto-complete mode the GPU is infinitely fast and catches up whenever a
//! fence is queried; with auto-complete disabled it only advances when a
//! caller blocks on a fence or calls [`HostBufferDevice::complete_all`],
//! which lets tests hold work "in flight" deliberately.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use strata_core::{
    BufferDevice, DeviceError, FenceId, MapMode, MappedRange, NativeBufferDescriptor,
    NativeBufferId, UsageFlags,
};

/// Construction options for a [`HostBufferDevice`].
#[derive(Debug, Clone)]
pub struct HostDeviceSettings {
    /// Expose persistent base pointers for [`UsageFlags::DIRECT_ACCESS`] buffers.
    pub unified_memory: bool,
    /// Upper bound on the total bytes of live buffers, if any.
    pub memory_budget: Option<usize>,
    /// Let queried fences complete immediately.
    pub auto_complete: bool,
}

impl Default for HostDeviceSettings {
    fn default() -> Self {
        Self {
            unified_memory: false,
            memory_budget: None,
            auto_complete: true,
        }
    }
}

#[derive(Debug)]
struct HostBuffer {
    storage: Box<[u8]>,
    usage: UsageFlags,
    label: Option<String>,
    mapped: Option<MapMode>,
}

#[derive(Debug, Default)]
struct Timeline {
    fences: HashMap<FenceId, u64>,
    submitted: u64,
    completed: u64,
    auto_complete: bool,
}

/// A [`BufferDevice`] backed by host memory.
#[derive(Debug)]
pub struct HostBufferDevice {
    settings: HostDeviceSettings,
    buffers: Mutex<HashMap<NativeBufferId, HostBuffer>>,
    timeline: Mutex<Timeline>,
    next_buffer_id: AtomicUsize,
    next_fence_id: AtomicUsize,
    allocated_bytes: AtomicUsize,
    failing_allocations: AtomicUsize,
    copies: AtomicUsize,
}

impl Default for HostBufferDevice {
    fn default() -> Self {
        Self::new(HostDeviceSettings::default())
    }
}

impl HostBufferDevice {
    /// Creates a device with the given settings.
    pub fn new(settings: HostDeviceSettings) -> Self {
        let timeline = Timeline {
            auto_complete: settings.auto_complete,
            ..Default::default()
        };
        Self {
            settings,
            buffers: Mutex::new(HashMap::new()),
            timeline: Mutex::new(timeline),
            next_buffer_id: AtomicUsize::new(1),
            next_fence_id: AtomicUsize::new(1),
            allocated_bytes: AtomicUsize::new(0),
            failing_allocations: AtomicUsize::new(0),
            copies: AtomicUsize::new(0),
        }
    }

    fn lock_buffers(&self) -> Result<MutexGuard<'_, HashMap<NativeBufferId, HostBuffer>>, DeviceError> {
        self.buffers
            .lock()
            .map_err(|e| DeviceError::Backend(format!("Mutex poisoned (buffers): {e}")))
    }

    fn lock_timeline(&self) -> Result<MutexGuard<'_, Timeline>, DeviceError> {
        self.timeline
            .lock()
            .map_err(|e| DeviceError::Backend(format!("Mutex poisoned (timeline): {e}")))
    }

    /// Switches the simulated GPU between instant and manual completion.
    pub fn set_auto_complete(&self, enabled: bool) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.auto_complete = enabled;
        }
    }

    /// Lets the simulated GPU execute everything submitted so far.
    pub fn complete_all(&self) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.completed = timeline.submitted;
        }
    }

    /// Makes the next `count` buffer creations fail with out-of-memory.
    pub fn fail_next_allocations(&self, count: usize) {
        self.failing_allocations.store(count, Ordering::Relaxed);
    }

    /// Number of live native buffers.
    pub fn live_buffer_count(&self) -> usize {
        self.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Total bytes held by live native buffers.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Number of `copy_region` calls executed.
    pub fn copy_count(&self) -> usize {
        self.copies.load(Ordering::Relaxed)
    }

    /// `true` if the buffer exists.
    pub fn contains(&self, id: NativeBufferId) -> bool {
        self.buffers
            .lock()
            .map(|b| b.contains_key(&id))
            .unwrap_or(false)
    }

    /// `true` if the buffer is currently mapped.
    pub fn is_mapped(&self, id: NativeBufferId) -> bool {
        self.buffers
            .lock()
            .ok()
            .and_then(|b| b.get(&id).map(|buf| buf.mapped.is_some()))
            .unwrap_or(false)
    }

    /// Copies `len` bytes at `offset` out of a buffer.
    pub fn read_bytes(&self, id: NativeBufferId, offset: usize, len: usize) -> Option<Vec<u8>> {
        let buffers = self.buffers.lock().ok()?;
        let buffer = buffers.get(&id)?;
        buffer
            .storage
            .get(offset..offset.checked_add(len)?)
            .map(<[u8]>::to_vec)
    }

    /// The debug label a buffer was created with.
    pub fn label(&self, id: NativeBufferId) -> Option<String> {
        let buffers = self.buffers.lock().ok()?;
        buffers.get(&id).and_then(|b| b.label.clone())
    }

    fn check_range(
        id: NativeBufferId,
        buffer: &HostBuffer,
        offset: usize,
        size: usize,
    ) -> Result<(), DeviceError> {
        let end = offset.saturating_add(size);
        if end > buffer.storage.len() {
            return Err(DeviceError::OutOfBounds {
                buffer: id,
                offset,
                end,
                size: buffer.storage.len(),
            });
        }
        Ok(())
    }

    fn mapping_of(buffer: &mut HostBuffer) -> Option<MappedRange> {
        let len = buffer.storage.len();
        let ptr = NonNull::new(buffer.storage.as_mut_ptr())?;
        // SAFETY: the boxed storage never moves and lives until the buffer is
        // destroyed, which invalidates the mapping by contract.
        Some(unsafe { MappedRange::from_raw_parts(ptr, len) })
    }
}

impl BufferDevice for HostBufferDevice {
    fn create_buffer(
        &self,
        descriptor: &NativeBufferDescriptor,
    ) -> Result<NativeBufferId, DeviceError> {
        let out_of_memory = DeviceError::OutOfDeviceMemory {
            requested: descriptor.size,
        };
        let injected = self
            .failing_allocations
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(out_of_memory);
        }
        if let Some(budget) = self.settings.memory_budget {
            match self.allocated_bytes().checked_add(descriptor.size) {
                Some(total) if total <= budget => {}
                _ => return Err(out_of_memory),
            }
        }

        let mut storage = Vec::new();
        if storage.try_reserve_exact(descriptor.size).is_err() {
            return Err(out_of_memory);
        }
        storage.resize(descriptor.size, 0u8);

        let id = NativeBufferId(self.next_buffer_id.fetch_add(1, Ordering::Relaxed));
        let buffer = HostBuffer {
            storage: storage.into_boxed_slice(),
            usage: descriptor.usage,
            label: descriptor.label.as_ref().map(|l| l.to_string()),
            mapped: None,
        };
        self.lock_buffers()?.insert(id, buffer);
        self.allocated_bytes
            .fetch_add(descriptor.size, Ordering::Relaxed);

        log::trace!(
            "HostBufferDevice: Created buffer '{}' with ID: {:?}, size: {} bytes",
            descriptor.label.as_deref().unwrap_or_default(),
            id,
            descriptor.size
        );
        Ok(id)
    }

    fn destroy_buffer(&self, id: NativeBufferId) -> Result<(), DeviceError> {
        let buffer = self
            .lock_buffers()?
            .remove(&id)
            .ok_or(DeviceError::InvalidBuffer(id))?;
        self.allocated_bytes
            .fetch_sub(buffer.storage.len(), Ordering::Relaxed);
        log::trace!("HostBufferDevice: Destroyed buffer with ID: {id:?}");
        Ok(())
    }

    fn map(&self, id: NativeBufferId, mode: MapMode) -> Result<MappedRange, DeviceError> {
        let mut buffers = self.lock_buffers()?;
        let buffer = buffers.get_mut(&id).ok_or(DeviceError::InvalidBuffer(id))?;
        if mode == MapMode::Read && !buffer.usage.contains(UsageFlags::CPU_READ) {
            return Err(DeviceError::MapFailed {
                buffer: id,
                reason: "buffer was not created for CPU reads".into(),
            });
        }
        if let Some(current) = buffer.mapped {
            return Err(DeviceError::MapFailed {
                buffer: id,
                reason: format!("already mapped ({current:?})"),
            });
        }
        let range = Self::mapping_of(buffer).ok_or_else(|| DeviceError::MapFailed {
            buffer: id,
            reason: "zero-sized buffer".into(),
        })?;
        buffer.mapped = Some(mode);
        Ok(range)
    }

    fn unmap(&self, id: NativeBufferId) -> Result<(), DeviceError> {
        let mut buffers = self.lock_buffers()?;
        let buffer = buffers.get_mut(&id).ok_or(DeviceError::InvalidBuffer(id))?;
        buffer.mapped.take().map(|_| ()).ok_or(DeviceError::NotMapped(id))
    }

    fn base_pointer(&self, id: NativeBufferId) -> Option<MappedRange> {
        if !self.settings.unified_memory {
            return None;
        }
        let mut buffers = self.buffers.lock().ok()?;
        let buffer = buffers.get_mut(&id)?;
        if !buffer.usage.contains(UsageFlags::DIRECT_ACCESS) {
            return None;
        }
        Self::mapping_of(buffer)
    }

    fn copy_region(
        &self,
        dst: NativeBufferId,
        dst_offset: usize,
        src: NativeBufferId,
        src_offset: usize,
        size: usize,
    ) -> Result<(), DeviceError> {
        let mut buffers = self.lock_buffers()?;
        if src == dst {
            let buffer = buffers.get_mut(&dst).ok_or(DeviceError::InvalidBuffer(dst))?;
            Self::check_range(src, buffer, src_offset, size)?;
            Self::check_range(dst, buffer, dst_offset, size)?;
            buffer
                .storage
                .copy_within(src_offset..src_offset + size, dst_offset);
        } else {
            let source = buffers.get(&src).ok_or(DeviceError::InvalidBuffer(src))?;
            Self::check_range(src, source, src_offset, size)?;
            let bytes = source.storage[src_offset..src_offset + size].to_vec();
            let target = buffers.get_mut(&dst).ok_or(DeviceError::InvalidBuffer(dst))?;
            Self::check_range(dst, target, dst_offset, size)?;
            target.storage[dst_offset..dst_offset + size].copy_from_slice(&bytes);
        }
        self.copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn create_fence(&self) -> Result<FenceId, DeviceError> {
        let fence = FenceId(self.next_fence_id.fetch_add(1, Ordering::Relaxed));
        self.lock_timeline()?.fences.insert(fence, 0);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: FenceId) -> Result<(), DeviceError> {
        self.lock_timeline()?
            .fences
            .remove(&fence)
            .map(|_| ())
            .ok_or(DeviceError::InvalidFence(fence))
    }

    fn issue_fence(&self, fence: FenceId) -> Result<(), DeviceError> {
        let mut timeline = self.lock_timeline()?;
        timeline.submitted += 1;
        let serial = timeline.submitted;
        let slot = timeline
            .fences
            .get_mut(&fence)
            .ok_or(DeviceError::InvalidFence(fence))?;
        *slot = serial;
        Ok(())
    }

    fn sync_fence(&self, fence: FenceId, block: bool) -> Result<bool, DeviceError> {
        let mut timeline = self.lock_timeline()?;
        let serial = *timeline
            .fences
            .get(&fence)
            .ok_or(DeviceError::InvalidFence(fence))?;
        if timeline.auto_complete {
            timeline.completed = timeline.submitted;
        }
        if timeline.completed >= serial {
            return Ok(true);
        }
        if block {
            timeline.completed = serial;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::BindFlags;

    fn manual_device() -> HostBufferDevice {
        HostBufferDevice::new(HostDeviceSettings {
            auto_complete: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_fence_waits_for_completion() {
        let device = manual_device();
        let fence = device.create_fence().unwrap();
        assert!(device.sync_fence(fence, false).unwrap(), "fresh fences are satisfied");

        device.issue_fence(fence).unwrap();
        assert!(!device.sync_fence(fence, false).unwrap());

        device.complete_all();
        assert!(device.sync_fence(fence, false).unwrap());
    }

    #[test]
    fn test_blocking_sync_only_advances_to_the_fence() {
        let device = manual_device();
        let early = device.create_fence().unwrap();
        let late = device.create_fence().unwrap();
        device.issue_fence(early).unwrap();
        device.issue_fence(late).unwrap();

        assert!(device.sync_fence(early, true).unwrap());
        assert!(!device.sync_fence(late, false).unwrap());
        assert!(device.sync_fence(late, true).unwrap());
    }

    #[test]
    fn test_copy_within_one_buffer() {
        let device = HostBufferDevice::default();
        let desc = NativeBufferDescriptor::new(256, UsageFlags::CPU_WRITE, BindFlags::VERTEX);
        let id = device.create_buffer(&desc).unwrap();

        let mut map = device.map(id, MapMode::Write).unwrap();
        unsafe { map.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]) };
        device.unmap(id).unwrap();

        device.copy_region(id, 128, id, 0, 4).unwrap();
        assert_eq!(device.read_bytes(id, 128, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(matches!(
            device.copy_region(id, 254, id, 0, 4),
            Err(DeviceError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_double_map_and_stray_unmap_fail() {
        let device = HostBufferDevice::default();
        let desc = NativeBufferDescriptor::new(64, UsageFlags::CPU_WRITE, BindFlags::INDEX);
        let id = device.create_buffer(&desc).unwrap();

        assert!(matches!(device.unmap(id), Err(DeviceError::NotMapped(_))));
        device.map(id, MapMode::Write).unwrap();
        assert!(matches!(
            device.map(id, MapMode::Write),
            Err(DeviceError::MapFailed { .. })
        ));
        assert!(matches!(
            device.map(id, MapMode::Read),
            Err(DeviceError::MapFailed { .. })
        ));
    }

    #[test]
    fn test_budget_and_injected_failures() {
        let device = HostBufferDevice::new(HostDeviceSettings {
            memory_budget: Some(1024),
            ..Default::default()
        });
        let desc = NativeBufferDescriptor::new(768, UsageFlags::EMPTY, BindFlags::VERTEX);
        let first = device.create_buffer(&desc).unwrap();
        assert!(device.create_buffer(&desc).is_err(), "budget exceeded");

        device.destroy_buffer(first).unwrap();
        device.fail_next_allocations(1);
        assert!(device.create_buffer(&desc).is_err(), "injected failure");
        assert!(device.create_buffer(&desc).is_ok());
        assert_eq!(device.allocated_bytes(), 768);
    }

    #[test]
    fn test_base_pointer_requires_unified_memory() {
        let discrete = HostBufferDevice::default();
        let unified = HostBufferDevice::new(HostDeviceSettings {
            unified_memory: true,
            ..Default::default()
        });
        let desc =
            NativeBufferDescriptor::new(128, UsageFlags::DIRECT_ACCESS, BindFlags::VERTEX);

        let a = discrete.create_buffer(&desc).unwrap();
        let b = unified.create_buffer(&desc).unwrap();
        assert!(discrete.base_pointer(a).is_none());
        assert_eq!(unified.base_pointer(b).map(|r| r.len()), Some(128));
    }
}
