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

//! How CPU writes reach a pool's native buffers.
//!
//! The strategy is fixed per pool at construction. All variants issue moves
//! the same way, as a device-side region copy.

use std::collections::HashMap;

use strata_core::{
    BindFlags, BufferDevice, DeviceError, FenceId, MapMode, MappedRange, NativeBufferDescriptor,
    NativeBufferId, UsageFlags,
};

use crate::error::BufferError;
use crate::native::{create_native, destroy_native, map_failed};
use crate::table::SlotKey;

#[derive(Debug, Clone, Copy)]
enum Pending {
    Write {
        dst: NativeBufferId,
        offset: usize,
        size: usize,
    },
    Read,
}

#[derive(Debug, Clone, Copy)]
struct StagingBuffer {
    id: NativeBufferId,
    size: usize,
}

/// Writes go through a CPU-writable staging buffer followed by a GPU copy.
///
/// Each open operation holds its own staging buffer; finished ones are kept
/// for reuse.
#[derive(Debug)]
pub(crate) struct StagedUpdater {
    capacity: usize,
    bind: BindFlags,
    idle_write: Vec<StagingBuffer>,
    idle_read: Vec<StagingBuffer>,
    open: HashMap<SlotKey, (StagingBuffer, Pending)>,
    read_fence: Option<FenceId>,
}

impl StagedUpdater {
    pub(crate) fn new(capacity: usize, bind: BindFlags) -> Self {
        Self {
            capacity,
            bind,
            idle_write: Vec::new(),
            idle_read: Vec::new(),
            open: HashMap::new(),
            read_fence: None,
        }
    }

    fn take_staging(
        &mut self,
        device: &dyn BufferDevice,
        read: bool,
    ) -> Result<StagingBuffer, BufferError> {
        let idle = if read {
            &mut self.idle_read
        } else {
            &mut self.idle_write
        };
        if let Some(staging) = idle.pop() {
            return Ok(staging);
        }
        let (usage, label) = if read {
            (UsageFlags::STAGING | UsageFlags::CPU_READ, "read staging")
        } else {
            (UsageFlags::STAGING | UsageFlags::CPU_WRITE, "write staging")
        };
        let descriptor = NativeBufferDescriptor::new(self.capacity, usage, self.bind).with_label(label);
        let id = create_native(device, &descriptor)?;
        log::debug!("Created {label} buffer of {} bytes", self.capacity);
        Ok(StagingBuffer {
            id,
            size: self.capacity,
        })
    }

    fn give_back(&mut self, staging: StagingBuffer, pending: Pending) {
        match pending {
            Pending::Write { .. } => self.idle_write.push(staging),
            Pending::Read => self.idle_read.push(staging),
        }
    }

    fn check_capacity(&self, ticket: SlotKey, size: usize) -> Result<(), BufferError> {
        if self.open.contains_key(&ticket) {
            return Err(BufferError::AlreadyMapped);
        }
        if size > self.capacity {
            return Err(BufferError::StagingTooSmall {
                size,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn begin_write(
        &mut self,
        device: &dyn BufferDevice,
        ticket: SlotKey,
        dst: NativeBufferId,
        offset: usize,
        size: usize,
    ) -> Result<Option<MappedRange>, BufferError> {
        self.check_capacity(ticket, size)?;
        let staging = self.take_staging(device, false)?;
        let pending = Pending::Write { dst, offset, size };
        let mapped = match device.map(staging.id, MapMode::WriteDiscard) {
            Ok(mapped) => mapped,
            Err(err) => {
                self.give_back(staging, pending);
                return Err(map_failed(staging.id, err));
            }
        };
        self.open.insert(ticket, (staging, pending));
        Ok(mapped.subrange(0, size))
    }

    fn begin_read(
        &mut self,
        device: &dyn BufferDevice,
        ticket: SlotKey,
        src: NativeBufferId,
        offset: usize,
        size: usize,
    ) -> Result<Option<MappedRange>, BufferError> {
        self.check_capacity(ticket, size)?;
        let fence = match self.read_fence {
            Some(fence) => fence,
            None => {
                let fence = device.create_fence()?;
                self.read_fence = Some(fence);
                fence
            }
        };
        let staging = self.take_staging(device, true)?;
        let mapped = device
            .copy_region(staging.id, 0, src, offset, size)
            .and_then(|()| device.issue_fence(fence))
            .and_then(|()| device.sync_fence(fence, true))
            .and_then(|_| device.map(staging.id, MapMode::Read));
        let mapped = match mapped {
            Ok(mapped) => mapped,
            Err(err) => {
                self.give_back(staging, Pending::Read);
                return Err(map_failed(staging.id, err));
            }
        };
        self.open.insert(ticket, (staging, Pending::Read));
        Ok(mapped.subrange(0, size))
    }

    fn end(&mut self, device: &dyn BufferDevice, ticket: SlotKey) -> Result<(), BufferError> {
        let (staging, pending) = self.open.remove(&ticket).ok_or(BufferError::NotMapped)?;
        self.give_back(staging, pending);
        device.unmap(staging.id)?;
        if let Pending::Write { dst, offset, size } = pending {
            device.copy_region(dst, offset, staging.id, 0, size)?;
        }
        Ok(())
    }

    fn destroy(&mut self, device: &dyn BufferDevice) -> Result<(), BufferError> {
        let open = self.open.drain().map(|(_, (staging, _))| staging);
        let all: Vec<StagingBuffer> = open
            .chain(self.idle_write.drain(..))
            .chain(self.idle_read.drain(..))
            .collect();
        for staging in all {
            destroy_native(device, staging.id, staging.size)?;
        }
        if let Some(fence) = self.read_fence.take() {
            device.destroy_fence(fence)?;
        }
        Ok(())
    }
}

/// Writes map the destination buffer with no-overwrite semantics.
///
/// A buffer stays mapped while any write into it is open.
#[derive(Debug, Default)]
pub(crate) struct DirectUpdater {
    mappings: HashMap<NativeBufferId, (MappedRange, usize)>,
    open: HashMap<SlotKey, NativeBufferId>,
}

impl DirectUpdater {
    fn begin_write(
        &mut self,
        device: &dyn BufferDevice,
        ticket: SlotKey,
        dst: NativeBufferId,
        offset: usize,
        size: usize,
    ) -> Result<Option<MappedRange>, BufferError> {
        if self.open.contains_key(&ticket) {
            return Err(BufferError::AlreadyMapped);
        }
        let mapped = match self.mappings.get_mut(&dst) {
            Some((mapped, users)) => {
                *users += 1;
                *mapped
            }
            None => {
                let mapped = device
                    .map(dst, MapMode::WriteNoOverwrite)
                    .map_err(|err| map_failed(dst, err))?;
                self.mappings.insert(dst, (mapped, 1));
                mapped
            }
        };
        self.open.insert(ticket, dst);
        match mapped.subrange(offset, size) {
            Some(range) => Ok(Some(range)),
            None => {
                self.end(device, ticket)?;
                Err(BufferError::MapFailed(format!(
                    "range {offset}..{} outside native buffer {dst:?}",
                    offset + size
                )))
            }
        }
    }

    fn end(&mut self, device: &dyn BufferDevice, ticket: SlotKey) -> Result<(), BufferError> {
        let id = self.open.remove(&ticket).ok_or(BufferError::NotMapped)?;
        let Some((_, users)) = self.mappings.get_mut(&id) else {
            return Err(BufferError::NotMapped);
        };
        *users -= 1;
        if *users == 0 {
            self.mappings.remove(&id);
            device.unmap(id)?;
        }
        Ok(())
    }
}

/// The update strategy of one pool.
#[derive(Debug)]
pub(crate) enum BufferUpdater {
    Staged(StagedUpdater),
    Direct(DirectUpdater),
    /// Memory is reached only through base pointers.
    Noop,
}

impl BufferUpdater {
    /// Starts a write of `size` bytes at `offset` into `dst` on behalf of
    /// `ticket`, which must be passed back to [`BufferUpdater::end`].
    ///
    /// `Ok(None)` means this strategy cannot hand out a pointer.
    pub(crate) fn begin_write(
        &mut self,
        device: &dyn BufferDevice,
        ticket: SlotKey,
        dst: NativeBufferId,
        offset: usize,
        size: usize,
    ) -> Result<Option<MappedRange>, BufferError> {
        match self {
            Self::Staged(staged) => staged.begin_write(device, ticket, dst, offset, size),
            Self::Direct(direct) => direct.begin_write(device, ticket, dst, offset, size),
            Self::Noop => Ok(None),
        }
    }

    pub(crate) fn begin_read(
        &mut self,
        device: &dyn BufferDevice,
        ticket: SlotKey,
        src: NativeBufferId,
        offset: usize,
        size: usize,
    ) -> Result<Option<MappedRange>, BufferError> {
        match self {
            Self::Staged(staged) => staged.begin_read(device, ticket, src, offset, size),
            Self::Direct(_) | Self::Noop => Ok(None),
        }
    }

    pub(crate) fn end(&mut self, device: &dyn BufferDevice, ticket: SlotKey) -> Result<(), BufferError> {
        match self {
            Self::Staged(staged) => staged.end(device, ticket),
            Self::Direct(direct) => direct.end(device, ticket),
            Self::Noop => Ok(()),
        }
    }

    pub(crate) fn move_region(
        &mut self,
        device: &dyn BufferDevice,
        dst: NativeBufferId,
        dst_offset: usize,
        src: NativeBufferId,
        src_offset: usize,
        size: usize,
    ) -> Result<(), DeviceError> {
        device.copy_region(dst, dst_offset, src, src_offset, size)
    }

    /// Writes `data` into `dst` in pieces of at most `chunk` bytes.
    pub(crate) fn write_chunked(
        &mut self,
        device: &dyn BufferDevice,
        ticket: SlotKey,
        dst: NativeBufferId,
        data: &[u8],
        chunk: usize,
    ) -> Result<(), BufferError> {
        let chunk = chunk.max(1);
        for (index, piece) in data.chunks(chunk).enumerate() {
            let offset = index * chunk;
            let Some(mut mapped) = self.begin_write(device, ticket, dst, offset, piece.len())?
            else {
                return Err(BufferError::MapFailed(format!(
                    "no CPU access to native buffer {dst:?}"
                )));
            };
            // SAFETY: the range was mapped by `begin_write` and stays mapped until `end`.
            unsafe { mapped.as_mut_slice() }.copy_from_slice(piece);
            self.end(device, ticket)?;
        }
        Ok(())
    }

    pub(crate) fn destroy(&mut self, device: &dyn BufferDevice) -> Result<(), BufferError> {
        match self {
            Self::Staged(staged) => staged.destroy(device),
            Self::Direct(direct) => {
                for (id, _) in direct.mappings.drain() {
                    device.unmap(id)?;
                }
                direct.open.clear();
                Ok(())
            }
            Self::Noop => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_infra::HostBufferDevice;

    const A: SlotKey = SlotKey {
        index: 0,
        generation: 0,
    };
    const B: SlotKey = SlotKey {
        index: 1,
        generation: 0,
    };

    fn target(device: &HostBufferDevice, size: usize) -> NativeBufferId {
        device
            .create_buffer(&NativeBufferDescriptor::new(
                size,
                UsageFlags::DYNAMIC,
                BindFlags::VERTEX,
            ))
            .unwrap()
    }

    #[test]
    fn test_staged_write_lands_after_end() {
        let device = HostBufferDevice::default();
        let dst = target(&device, 1024);
        let mut updater = BufferUpdater::Staged(StagedUpdater::new(512, BindFlags::VERTEX));

        let mut mapped = updater.begin_write(&device, A, dst, 256, 4).unwrap().unwrap();
        unsafe { mapped.as_mut_slice() }.copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(device.read_bytes(dst, 256, 4), Some(vec![0; 4]));

        updater.end(&device, A).unwrap();
        assert_eq!(device.read_bytes(dst, 256, 4), Some(vec![1, 2, 3, 4]));
        assert!(matches!(updater.end(&device, A), Err(BufferError::NotMapped)));
    }

    #[test]
    fn test_staged_concurrent_writes_use_separate_staging() {
        let device = HostBufferDevice::default();
        let dst = target(&device, 1024);
        let mut updater = BufferUpdater::Staged(StagedUpdater::new(512, BindFlags::VERTEX));

        let mut first = updater.begin_write(&device, A, dst, 0, 2).unwrap().unwrap();
        let mut second = updater.begin_write(&device, B, dst, 128, 2).unwrap().unwrap();
        unsafe { first.as_mut_slice() }.copy_from_slice(&[1, 1]);
        unsafe { second.as_mut_slice() }.copy_from_slice(&[2, 2]);
        updater.end(&device, B).unwrap();
        updater.end(&device, A).unwrap();

        assert_eq!(device.read_bytes(dst, 0, 2), Some(vec![1, 1]));
        assert_eq!(device.read_bytes(dst, 128, 2), Some(vec![2, 2]));
        assert_eq!(device.live_buffer_count(), 3);
    }

    #[test]
    fn test_staged_rejects_oversized_write() {
        let device = HostBufferDevice::default();
        let dst = target(&device, 4096);
        let mut updater = BufferUpdater::Staged(StagedUpdater::new(512, BindFlags::VERTEX));
        assert!(matches!(
            updater.begin_write(&device, A, dst, 0, 1024),
            Err(BufferError::StagingTooSmall {
                size: 1024,
                capacity: 512
            })
        ));
    }

    #[test]
    fn test_staged_read_back() {
        let device = HostBufferDevice::default();
        let dst = target(&device, 1024);
        let mut updater = BufferUpdater::Staged(StagedUpdater::new(512, BindFlags::VERTEX));
        updater.write_chunked(&device, A, dst, &[7; 128], 512).unwrap();

        let mapped = updater.begin_read(&device, A, dst, 0, 128).unwrap().unwrap();
        assert_eq!(unsafe { mapped.as_slice() }, &[7; 128][..]);
        updater.end(&device, A).unwrap();

        updater.destroy(&device).unwrap();
        assert_eq!(device.live_buffer_count(), 1);
    }

    #[test]
    fn test_direct_shares_one_mapping() {
        let device = HostBufferDevice::default();
        let dst = target(&device, 1024);
        let mut updater = BufferUpdater::Direct(DirectUpdater::default());

        updater.begin_write(&device, A, dst, 0, 128).unwrap().unwrap();
        updater.begin_write(&device, B, dst, 128, 128).unwrap().unwrap();
        updater.end(&device, A).unwrap();
        assert!(device.is_mapped(dst));
        updater.end(&device, B).unwrap();
        assert!(!device.is_mapped(dst));
    }

    #[test]
    fn test_chunked_write_through_direct_mapping() {
        let device = HostBufferDevice::default();
        let dst = target(&device, 1000);
        let mut updater = BufferUpdater::Direct(DirectUpdater::default());
        let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();

        updater.write_chunked(&device, A, dst, &data, 256).unwrap();
        assert_eq!(device.read_bytes(dst, 0, 1000), Some(data));
        assert!(!device.is_mapped(dst));
    }

    #[test]
    fn test_noop_hands_out_nothing() {
        let device = HostBufferDevice::default();
        let dst = target(&device, 256);
        let mut updater = BufferUpdater::Noop;
        assert!(updater.begin_write(&device, A, dst, 0, 128).unwrap().is_none());
        assert!(updater.begin_read(&device, A, dst, 0, 128).unwrap().is_none());
        assert!(updater.write_chunked(&device, A, dst, &[1; 10], 8).is_err());
    }
}
