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

//! `wgpu` backend for the buffer pools.
//!
//! `wgpu` has no persistent mappings and no CPU-side fences, so this backend
//! keeps a CPU shadow of every buffer. Mapping hands out the shadow; unmapping
//! after a write uploads it through the queue. GPU copies are mirrored in the
//! shadows, which therefore always match the device contents and also serve
//! reads. Fences are flags raised by `Queue::on_submitted_work_done`.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use strata_core::{
    BindFlags, BufferDevice, DeviceError, FenceId, MapMode, MappedRange, NativeBufferDescriptor,
    NativeBufferId, UsageFlags,
};

#[derive(Debug)]
struct WgpuBufferEntry {
    buffer: Arc<wgpu::Buffer>,
    shadow: Box<[u8]>,
    mapped: Option<MapMode>,
}

/// A buffer device driving a `wgpu::Device`.
#[derive(Debug)]
pub struct WgpuBufferDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    buffers: Mutex<HashMap<NativeBufferId, WgpuBufferEntry>>,
    fences: Mutex<HashMap<FenceId, Arc<AtomicBool>>>,
    next_buffer_id: AtomicUsize,
    next_fence_id: AtomicUsize,
}

impl WgpuBufferDevice {
    /// Wraps an existing device and queue.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            buffers: Mutex::new(HashMap::new()),
            fences: Mutex::new(HashMap::new()),
            next_buffer_id: AtomicUsize::new(1),
            next_fence_id: AtomicUsize::new(1),
        }
    }

    /// Creates a device on the first available adapter, without a surface.
    pub fn headless() -> Result<Self, DeviceError> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::new_without_display_handle());
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .map_err(|e| DeviceError::Backend(format!("Failed to find an adapter: {e}")))?;
            log::info!("WgpuBufferDevice: Using adapter {}", adapter.get_info().name);

            let (device, queue) = adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some("Strata Buffer Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    experimental_features: wgpu::ExperimentalFeatures::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                    trace: wgpu::Trace::default(),
                })
                .await
                .map_err(|e| {
                    DeviceError::Backend(format!("Failed to create logical device: {e}"))
                })?;
            device.on_uncaptured_error(Arc::new(|e: wgpu::Error| {
                log::error!("WGPU Uncaptured Error: {e:?}");
            }));
            Ok::<Self, DeviceError>(Self::new(device, queue))
        })
    }

    /// Retrieves the `wgpu::Buffer` behind a native id, for binding.
    pub fn wgpu_buffer(&self, id: NativeBufferId) -> Option<Arc<wgpu::Buffer>> {
        let buffers = self.buffers.lock().ok()?;
        buffers.get(&id).map(|entry| Arc::clone(&entry.buffer))
    }

    fn lock_buffers(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<NativeBufferId, WgpuBufferEntry>>, DeviceError> {
        self.buffers
            .lock()
            .map_err(|e| DeviceError::Backend(format!("Mutex poisoned (buffers): {e}")))
    }

    fn lock_fences(&self) -> Result<MutexGuard<'_, HashMap<FenceId, Arc<AtomicBool>>>, DeviceError> {
        self.fences
            .lock()
            .map_err(|e| DeviceError::Backend(format!("Mutex poisoned (fences): {e}")))
    }

    fn wgpu_usages(usage: UsageFlags, bind: BindFlags) -> wgpu::BufferUsages {
        let mut usages = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
        if bind.contains(BindFlags::VERTEX) {
            usages |= wgpu::BufferUsages::VERTEX;
        }
        if bind.contains(BindFlags::INDEX) {
            usages |= wgpu::BufferUsages::INDEX;
        }
        if bind.contains(BindFlags::CONSTANT) {
            usages |= wgpu::BufferUsages::UNIFORM;
        }
        if usage.contains(UsageFlags::STAGING) && bind.is_empty() {
            // Staging memory never gets bound; keep it a plain copy source.
            usages = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
        }
        usages
    }

    fn check_range(
        id: NativeBufferId,
        entry: &WgpuBufferEntry,
        offset: usize,
        size: usize,
    ) -> Result<(), DeviceError> {
        let end = offset.saturating_add(size);
        if end > entry.shadow.len() {
            return Err(DeviceError::OutOfBounds {
                buffer: id,
                offset,
                end,
                size: entry.shadow.len(),
            });
        }
        Ok(())
    }

    fn poll(&self, block: bool) {
        let poll_type = if block {
            wgpu::PollType::wait_indefinitely()
        } else {
            wgpu::PollType::Poll
        };
        if let Err(e) = self.device.poll(poll_type) {
            log::warn!("Failed to poll device (block: {block}): {e:?}");
        }
    }
}

impl BufferDevice for WgpuBufferDevice {
    fn create_buffer(
        &self,
        descriptor: &NativeBufferDescriptor,
    ) -> Result<NativeBufferId, DeviceError> {
        // wgpu requires copy sizes in multiples of 4.
        let padded = descriptor.size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT as usize);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: descriptor.label.as_deref(),
            size: padded as u64,
            usage: Self::wgpu_usages(descriptor.usage, descriptor.bind),
            mapped_at_creation: false,
        });
        let id = NativeBufferId(self.next_buffer_id.fetch_add(1, Ordering::Relaxed));
        self.lock_buffers()?.insert(
            id,
            WgpuBufferEntry {
                buffer: Arc::new(buffer),
                shadow: vec![0u8; padded].into_boxed_slice(),
                mapped: None,
            },
        );
        log::debug!(
            "WgpuBufferDevice: Created buffer '{}' with ID: {:?}, size: {} bytes",
            descriptor.label.as_deref().unwrap_or_default(),
            id,
            padded
        );
        Ok(id)
    }

    fn destroy_buffer(&self, id: NativeBufferId) -> Result<(), DeviceError> {
        let entry = self
            .lock_buffers()?
            .remove(&id)
            .ok_or(DeviceError::InvalidBuffer(id))?;
        entry.buffer.destroy();
        log::debug!("WgpuBufferDevice: Destroyed buffer with ID: {id:?}");
        Ok(())
    }

    fn map(&self, id: NativeBufferId, mode: MapMode) -> Result<MappedRange, DeviceError> {
        let mut buffers = self.lock_buffers()?;
        let entry = buffers.get_mut(&id).ok_or(DeviceError::InvalidBuffer(id))?;
        if entry.mapped.is_some() {
            return Err(DeviceError::MapFailed {
                buffer: id,
                reason: "already mapped".into(),
            });
        }
        if mode == MapMode::WriteDiscard {
            entry.shadow.fill(0);
        }
        let len = entry.shadow.len();
        let ptr = NonNull::new(entry.shadow.as_mut_ptr()).ok_or_else(|| DeviceError::MapFailed {
            buffer: id,
            reason: "null shadow".into(),
        })?;
        entry.mapped = Some(mode);
        // SAFETY: the boxed shadow is stable and outlives the mapping.
        Ok(unsafe { MappedRange::from_raw_parts(ptr, len) })
    }

    fn unmap(&self, id: NativeBufferId) -> Result<(), DeviceError> {
        let mut buffers = self.lock_buffers()?;
        let entry = buffers.get_mut(&id).ok_or(DeviceError::InvalidBuffer(id))?;
        match entry.mapped.take() {
            None => Err(DeviceError::NotMapped(id)),
            Some(MapMode::Read) => Ok(()),
            Some(_) => {
                self.queue.write_buffer(&entry.buffer, 0, &entry.shadow);
                Ok(())
            }
        }
    }

    fn base_pointer(&self, _id: NativeBufferId) -> Option<MappedRange> {
        None
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
        let source = buffers.get(&src).ok_or(DeviceError::InvalidBuffer(src))?;
        Self::check_range(src, source, src_offset, size)?;
        let bytes = source.shadow[src_offset..src_offset + size].to_vec();
        let source_buffer = Arc::clone(&source.buffer);
        let target = buffers.get_mut(&dst).ok_or(DeviceError::InvalidBuffer(dst))?;
        Self::check_range(dst, target, dst_offset, size)?;
        target.shadow[dst_offset..dst_offset + size].copy_from_slice(&bytes);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Strata Copy Region"),
            });
        if src == dst {
            // wgpu rejects copies within one buffer; bounce through a scratch buffer.
            let scratch = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Strata Copy Scratch"),
                size: size as u64,
                usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            encoder.copy_buffer_to_buffer(&source_buffer, src_offset as u64, &scratch, 0, size as u64);
            encoder.copy_buffer_to_buffer(&scratch, 0, &target.buffer, dst_offset as u64, size as u64);
        } else {
            encoder.copy_buffer_to_buffer(
                &source_buffer,
                src_offset as u64,
                &target.buffer,
                dst_offset as u64,
                size as u64,
            );
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn create_fence(&self) -> Result<FenceId, DeviceError> {
        let fence = FenceId(self.next_fence_id.fetch_add(1, Ordering::Relaxed));
        self.lock_fences()?
            .insert(fence, Arc::new(AtomicBool::new(true)));
        Ok(fence)
    }

    fn destroy_fence(&self, fence: FenceId) -> Result<(), DeviceError> {
        self.lock_fences()?
            .remove(&fence)
            .map(|_| ())
            .ok_or(DeviceError::InvalidFence(fence))
    }

    fn issue_fence(&self, fence: FenceId) -> Result<(), DeviceError> {
        let flag = Arc::new(AtomicBool::new(false));
        {
            let mut fences = self.lock_fences()?;
            let slot = fences.get_mut(&fence).ok_or(DeviceError::InvalidFence(fence))?;
            *slot = Arc::clone(&flag);
        }
        // Flush pending queue writes so the callback covers them.
        self.queue.submit(std::iter::empty());
        self.queue
            .on_submitted_work_done(move || flag.store(true, Ordering::Release));
        Ok(())
    }

    fn sync_fence(&self, fence: FenceId, block: bool) -> Result<bool, DeviceError> {
        let flag = {
            let fences = self.lock_fences()?;
            Arc::clone(fences.get(&fence).ok_or(DeviceError::InvalidFence(fence))?)
        };
        if flag.load(Ordering::Acquire) {
            return Ok(true);
        }
        self.poll(block);
        Ok(flag.load(Ordering::Acquire) || block)
    }
}
