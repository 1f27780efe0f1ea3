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

//! The pool manager: the single entry point of the pooling subsystem.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, ThreadId};

use strata_core::{memory, BufferDevice, FenceId, MappedRange};

use crate::allocator::Fit;
use crate::config::PoolConfig;
use crate::constant::{ConstantBufferAllocator, ConstantBufferHandle, ConstantBufferStats};
use crate::error::BufferError;
use crate::pool::{AllocatorKind, BufferPool, PoolSettings, PoolStats, UpdaterKind};
use crate::types::{
    BindingType, BufferHandle, BufferLocation, PoolIndex, UsageClass, FRAME_QUERY_COUNT,
    FRAME_QUERY_MASK,
};

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>, BufferError> {
    mutex.lock().map_err(|e| {
        log::error!("Mutex poisoned ({what}): {e}");
        BufferError::LockPoisoned(what)
    })
}

#[derive(Debug)]
struct FrameState {
    fences: [FenceId; FRAME_QUERY_COUNT],
}

/// What a pool slot of the table is built as.
enum PoolLayout {
    Banked(PoolSettings),
    Ring(PoolSettings, usize),
}

fn layout_for(config: &PoolConfig, binding: BindingType, usage: UsageClass) -> Option<PoolLayout> {
    let updater = |kind| {
        if config.staged_updates {
            kind
        } else {
            UpdaterKind::Noop
        }
    };
    let (allocator, updater) = match usage {
        UsageClass::Immutable => return None,
        UsageClass::Static => (
            AllocatorKind::Defrag {
                enabled: config.defrag_static,
            },
            updater(UpdaterKind::Staged),
        ),
        UsageClass::Dynamic => (
            AllocatorKind::Defrag {
                enabled: config.defrag_dynamic,
            },
            updater(UpdaterKind::Direct),
        ),
        UsageClass::Transient | UsageClass::TransientRt | UsageClass::WhenLoadingThreadActive => {
            (AllocatorKind::Direct, updater(UpdaterKind::Direct))
        }
    };
    let max_moves_per_update = match allocator {
        AllocatorKind::Defrag { enabled: true } => config.max_moves_per_update,
        _ => 0,
    };
    let settings = PoolSettings {
        binding,
        usage,
        bank_size: config.bank_size,
        max_allocs: config.max_allocs,
        max_moves_per_update,
        fit: if config.best_fit { Fit::Best } else { Fit::First },
        allocator,
        updater,
        lockless_updates: config.lockless_updates,
        full_gpu_sync: config.full_gpu_sync,
    };
    let ring = config.transient_pools
        && matches!(
            usage,
            UsageClass::TransientRt | UsageClass::WhenLoadingThreadActive
        );
    Some(if ring {
        PoolLayout::Ring(settings, config.transient_pool_size)
    } else {
        PoolLayout::Banked(settings)
    })
}

/// Owns every buffer pool, the constant-buffer allocator and the frame
/// fence ring.
///
/// There is no global instance: create one with [`PoolManager::init`], pass
/// it to whoever allocates buffers, and end it with
/// [`PoolManager::shutdown`]. Each pool has its own lock, so allocation and
/// writes may come from any thread; frame-level operations (`update`,
/// `sync`, `release_empty_banks`) additionally serialize on a manager lock.
#[derive(Debug)]
pub struct PoolManager {
    device: Arc<dyn BufferDevice>,
    config: PoolConfig,
    pools: Vec<Option<Mutex<BufferPool>>>,
    constants: Mutex<ConstantBufferAllocator>,
    frame: Mutex<FrameState>,
    render_thread: RwLock<ThreadId>,
}

impl PoolManager {
    /// Builds every pool of the table for `config`.
    ///
    /// The calling thread becomes the render thread; see
    /// [`PoolManager::set_render_thread`].
    pub fn init(device: Arc<dyn BufferDevice>, config: PoolConfig) -> Result<Self, BufferError> {
        let config = config.normalized();
        config.validate()?;

        let mut pools = Vec::with_capacity(PoolIndex::COUNT);
        for index in 0..PoolIndex::COUNT {
            let index = PoolIndex(index as u8);
            let pool = match layout_for(&config, index.binding(), index.usage()) {
                None => None,
                Some(PoolLayout::Banked(settings)) => {
                    Some(BufferPool::banked(device.clone(), settings)?)
                }
                Some(PoolLayout::Ring(settings, capacity)) => {
                    Some(BufferPool::transient(device.clone(), settings, capacity)?)
                }
            };
            pools.push(pool.map(Mutex::new));
        }

        let mut fences = Vec::with_capacity(FRAME_QUERY_COUNT);
        for _ in 0..FRAME_QUERY_COUNT {
            fences.push(device.create_fence()?);
        }
        let fences: [FenceId; FRAME_QUERY_COUNT] = fences
            .try_into()
            .map_err(|_| BufferError::Config("frame fence ring".into()))?;

        let constants = ConstantBufferAllocator::new(
            device.clone(),
            config.cb_bank_size,
            config.cb_threshold,
            config.lockless_updates,
        );
        log::info!(
            "Buffer pools initialized: {} pools, {} byte banks, {} byte constant pages",
            pools.iter().flatten().count(),
            config.bank_size,
            config.cb_bank_size
        );
        Ok(Self {
            device,
            config,
            pools,
            constants: Mutex::new(constants),
            frame: Mutex::new(FrameState { fences }),
            render_thread: RwLock::new(thread::current().id()),
        })
    }

    /// Waits for the GPU and destroys every native resource.
    pub fn shutdown(self) -> Result<(), BufferError> {
        let frame = lock(&self.frame, "frame")?;
        for &fence in &frame.fences {
            self.device.sync_fence(fence, true)?;
        }
        for pool in self.pools.iter().flatten() {
            lock(pool, "pool")?.teardown()?;
        }
        lock(&self.constants, "constant buffers")?.teardown()?;
        for &fence in &frame.fences {
            self.device.destroy_fence(fence)?;
        }
        log::info!("Buffer pools shut down");
        Ok(())
    }

    /// The normalized configuration in effect.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The device all pools allocate from.
    pub fn device(&self) -> &Arc<dyn BufferDevice> {
        &self.device
    }

    /// Names the thread that submits GPU work. Copy-on-write swaps finished
    /// on other threads are deferred to the next update.
    pub fn set_render_thread(&self, id: ThreadId) -> Result<(), BufferError> {
        *self
            .render_thread
            .write()
            .map_err(|_| BufferError::LockPoisoned("render thread"))? = id;
        Ok(())
    }

    fn on_render_thread(&self) -> Result<bool, BufferError> {
        let id = self
            .render_thread
            .read()
            .map_err(|_| BufferError::LockPoisoned("render thread"))?;
        Ok(*id == thread::current().id())
    }

    /// `true` once any device allocation has failed.
    pub fn is_out_of_video_memory(&self) -> bool {
        memory::is_out_of_video_memory()
    }

    fn pool(&self, handle: BufferHandle) -> Result<MutexGuard<'_, BufferPool>, BufferError> {
        let pool = self
            .pools
            .get(handle.pool.as_usize())
            .and_then(Option::as_ref)
            .ok_or(BufferError::StaleHandle)?;
        lock(pool, "pool")
    }

    // ── Buffers ─────────────────────────────────────────────────────

    /// Allocates `size` bytes, rounded up to [`crate::ALIGNMENT`].
    ///
    /// ## Errors
    ///
    /// [`BufferError::PoolNotConfigured`] for a combination without a pool,
    /// [`BufferError::OutOfVideoMemory`] when the device refuses a bank or
    /// dedicated buffer.
    pub fn create(
        &self,
        binding: BindingType,
        usage: UsageClass,
        size: usize,
    ) -> Result<BufferHandle, BufferError> {
        let index = PoolIndex::new(binding, usage);
        let pool = self
            .pools
            .get(index.as_usize())
            .and_then(Option::as_ref)
            .ok_or(BufferError::PoolNotConfigured { binding, usage })?;
        let key = lock(pool, "pool")?.allocate(size)?;
        Ok(BufferHandle { pool: index, key })
    }

    /// Frees a buffer. Bank space returns once the GPU is done with the
    /// current frame.
    pub fn destroy(&self, handle: BufferHandle) -> Result<(), BufferError> {
        self.pool(handle)?.free(handle.key)
    }

    /// Maps the buffer for reading until [`PoolManager::end_read_write`].
    ///
    /// The range is only valid while the buffer stays open; every access
    /// through it is `unsafe` for that reason.
    pub fn begin_read(&self, handle: BufferHandle) -> Result<MappedRange, BufferError> {
        self.pool(handle)?.begin_read(handle.key)
    }

    /// Maps the buffer for writing until [`PoolManager::end_read_write`].
    ///
    /// If the GPU may still read the buffer's current storage, the write is
    /// redirected to fresh storage that replaces it when the write ends.
    pub fn begin_write(&self, handle: BufferHandle) -> Result<MappedRange, BufferError> {
        self.pool(handle)?.begin_write(handle.key)
    }

    /// Closes a read or write started with `begin_read` or `begin_write`.
    pub fn end_read_write(&self, handle: BufferHandle) -> Result<(), BufferError> {
        let on_render_thread = self.on_render_thread()?;
        self.pool(handle)?.end_read_write(handle.key, on_render_thread)
    }

    /// Writes `data` at the start of the buffer.
    pub fn update_buffer(&self, handle: BufferHandle, data: &[u8]) -> Result<(), BufferError> {
        let on_render_thread = self.on_render_thread()?;
        self.pool(handle)?.write(handle.key, data, on_render_thread)
    }

    /// Reads the start of the buffer into `out`, returning the bytes copied.
    pub fn read_buffer(&self, handle: BufferHandle, out: &mut [u8]) -> Result<usize, BufferError> {
        self.pool(handle)?.read(handle.key, out)
    }

    /// The allocated size, a multiple of [`crate::ALIGNMENT`].
    pub fn size(&self, handle: BufferHandle) -> Result<usize, BufferError> {
        self.pool(handle)?.size(handle.key)
    }

    /// Where the buffer currently lives. The answer changes when the pool
    /// relocates the buffer, so resolve again every frame.
    pub fn resolve(&self, handle: BufferHandle) -> Result<BufferLocation, BufferError> {
        self.pool(handle)?.resolve(handle.key)
    }

    /// Statistics of one pool.
    pub fn stats(&self, binding: BindingType, usage: UsageClass) -> Result<PoolStats, BufferError> {
        let index = PoolIndex::new(binding, usage);
        let pool = self
            .pools
            .get(index.as_usize())
            .and_then(Option::as_ref)
            .ok_or(BufferError::PoolNotConfigured { binding, usage })?;
        Ok(lock(pool, "pool")?.stats())
    }

    // ── Constant buffers ────────────────────────────────────────────

    /// Allocates a constant buffer slot of at least `size` bytes.
    pub fn create_constant_buffer(&self, size: usize) -> Result<ConstantBufferHandle, BufferError> {
        lock(&self.constants, "constant buffers")?.allocate(size)
    }

    /// Frees a constant buffer slot once the current frame retires.
    pub fn destroy_constant_buffer(&self, handle: ConstantBufferHandle) -> Result<(), BufferError> {
        lock(&self.constants, "constant buffers")?.free(handle)
    }

    /// Writes `data` at the start of the slot.
    pub fn write_constant_buffer(
        &self,
        handle: ConstantBufferHandle,
        data: &[u8],
    ) -> Result<(), BufferError> {
        lock(&self.constants, "constant buffers")?.write(handle, data)
    }

    /// Where the slot lives.
    pub fn resolve_constant_buffer(
        &self,
        handle: ConstantBufferHandle,
    ) -> Result<BufferLocation, BufferError> {
        lock(&self.constants, "constant buffers")?.resolve(handle)
    }

    /// Statistics of the constant-buffer allocator.
    pub fn constant_buffer_stats(&self) -> Result<ConstantBufferStats, BufferError> {
        Ok(lock(&self.constants, "constant buffers")?.stats())
    }

    // ── Frame hooks ─────────────────────────────────────────────────

    /// Per-frame maintenance: retires deferred frees, advances compaction
    /// (suspended while `during_load`) and issues the frame fence.
    ///
    /// Blocks only if the GPU is still working on the frame issued
    /// [`FRAME_QUERY_COUNT`] updates ago.
    pub fn update(&self, frame_id: u64, during_load: bool) -> Result<(), BufferError> {
        let frame = lock(&self.frame, "frame")?;
        let fence = frame.fences[(frame_id & FRAME_QUERY_MASK) as usize];
        self.device.sync_fence(fence, true)?;
        for pool in self.pools.iter().flatten() {
            lock(pool, "pool")?.update(frame_id, fence, !during_load)?;
        }
        lock(&self.constants, "constant buffers")?.update(frame_id, fence)?;
        self.device.issue_fence(fence)?;
        Ok(())
    }

    /// Waits for the GPU to go idle and settles every pool: moves finish,
    /// deferred frees retire and empty banks are released.
    pub fn sync(&self, frame_id: u64) -> Result<(), BufferError> {
        let frame = lock(&self.frame, "frame")?;
        for &fence in &frame.fences {
            self.device.sync_fence(fence, true)?;
        }
        for pool in self.pools.iter().flatten() {
            lock(pool, "pool")?.sync()?;
        }
        lock(&self.constants, "constant buffers")?.sync()?;
        self.device
            .issue_fence(frame.fences[(frame_id & FRAME_QUERY_MASK) as usize])?;
        log::debug!("Buffer pools synchronized at frame {frame_id}");
        Ok(())
    }

    /// Releases the native buffers of every empty bank and, above the
    /// configured threshold, of empty constant pages.
    pub fn release_empty_banks(&self, frame_id: u64) -> Result<(), BufferError> {
        let frame = lock(&self.frame, "frame")?;
        for pool in self.pools.iter().flatten() {
            lock(pool, "pool")?.release_empty_banks()?;
        }
        lock(&self.constants, "constant buffers")?.release_empty_banks()?;
        self.device
            .issue_fence(frame.fences[(frame_id & FRAME_QUERY_MASK) as usize])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_infra::HostBufferDevice;

    #[test]
    fn test_pool_table_layout() {
        let config = PoolConfig {
            transient_pools: true,
            ..Default::default()
        };
        assert!(layout_for(&config, BindingType::Vertex, UsageClass::Immutable).is_none());
        assert!(matches!(
            layout_for(&config, BindingType::Index, UsageClass::Static),
            Some(PoolLayout::Banked(PoolSettings {
                allocator: AllocatorKind::Defrag { enabled: true },
                updater: UpdaterKind::Staged,
                ..
            }))
        ));
        assert!(matches!(
            layout_for(&config, BindingType::Vertex, UsageClass::Dynamic),
            Some(PoolLayout::Banked(PoolSettings {
                allocator: AllocatorKind::Defrag { enabled: false },
                updater: UpdaterKind::Direct,
                max_moves_per_update: 0,
                ..
            }))
        ));
        assert!(matches!(
            layout_for(&config, BindingType::Vertex, UsageClass::TransientRt),
            Some(PoolLayout::Ring(_, _))
        ));
        assert!(matches!(
            layout_for(&config, BindingType::Vertex, UsageClass::Transient),
            Some(PoolLayout::Banked(PoolSettings {
                allocator: AllocatorKind::Direct,
                ..
            }))
        ));
    }

    #[test]
    fn test_without_staging_every_pool_is_noop() {
        let config = PoolConfig {
            staged_updates: false,
            ..Default::default()
        };
        for usage in UsageClass::ALL {
            if let Some(PoolLayout::Banked(settings)) = layout_for(&config, BindingType::Vertex, usage)
            {
                assert_eq!(settings.updater, UpdaterKind::Noop);
            }
        }
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let device = Arc::new(HostBufferDevice::default());
        let config = PoolConfig {
            max_allocs: 0,
            ..Default::default()
        };
        assert!(matches!(
            PoolManager::init(device, config),
            Err(BufferError::Config(_))
        ));
    }
}
