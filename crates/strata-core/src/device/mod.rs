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

//! The contract between the buffer pools and the graphics backend.
//!
//! Pools never talk to a graphics API directly. Everything they need from the
//! device (creating native buffers, mapping them, recording copies and
//! tracking GPU progress through fences) goes through [`BufferDevice`].

mod error;
mod types;

pub use self::error::DeviceError;
pub use self::types::{
    BindFlags, FenceId, MapMode, MappedRange, NativeBufferDescriptor, NativeBufferId, UsageFlags,
};

use std::fmt::Debug;

/// A device capable of owning native buffers and tracking GPU progress.
///
/// This trait is the only seam between the allocator and the graphics API.
/// It must be thread-safe: pools are locked independently and may call into
/// the device from several threads at once.
pub trait BufferDevice: Send + Sync + Debug + 'static {
    /// Creates a native buffer.
    ///
    /// ## Errors
    ///
    /// Returns [`DeviceError::OutOfDeviceMemory`] when the device cannot back
    /// the request.
    fn create_buffer(
        &self,
        descriptor: &NativeBufferDescriptor,
    ) -> Result<NativeBufferId, DeviceError>;

    /// Destroys a native buffer. Any mapping of it becomes invalid.
    fn destroy_buffer(&self, id: NativeBufferId) -> Result<(), DeviceError>;

    /// Maps the whole buffer into CPU address space.
    fn map(&self, id: NativeBufferId, mode: MapMode) -> Result<MappedRange, DeviceError>;

    /// Ends a mapping started by [`BufferDevice::map`].
    fn unmap(&self, id: NativeBufferId) -> Result<(), DeviceError>;

    /// Returns the persistent CPU mapping of a buffer created with
    /// [`UsageFlags::DIRECT_ACCESS`], if the device supports one.
    fn base_pointer(&self, id: NativeBufferId) -> Option<MappedRange>;

    /// Records a GPU copy of `size` bytes from `src` to `dst`.
    ///
    /// Source and destination may be the same buffer as long as the ranges do
    /// not overlap.
    fn copy_region(
        &self,
        dst: NativeBufferId,
        dst_offset: usize,
        src: NativeBufferId,
        src_offset: usize,
        size: usize,
    ) -> Result<(), DeviceError>;

    /// Creates a fence. A fresh fence counts as satisfied.
    fn create_fence(&self) -> Result<FenceId, DeviceError>;

    /// Destroys a fence.
    fn destroy_fence(&self, fence: FenceId) -> Result<(), DeviceError>;

    /// Places `fence` after all work submitted so far.
    fn issue_fence(&self, fence: FenceId) -> Result<(), DeviceError>;

    /// Checks whether `fence` is satisfied, waiting for it when `block` is set.
    ///
    /// ## Returns
    ///
    /// `true` once every command submitted before the fence was issued has
    /// executed.
    fn sync_fence(&self, fence: FenceId, block: bool) -> Result<bool, DeviceError>;

    /// Makes GPU writes to a direct-access range visible to CPU reads.
    fn invalidate_cpu_range(
        &self,
        _id: NativeBufferId,
        _offset: usize,
        _size: usize,
    ) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Makes CPU writes to a direct-access range visible to the GPU.
    fn flush_gpu_range(
        &self,
        _id: NativeBufferId,
        _offset: usize,
        _size: usize,
    ) -> Result<(), DeviceError> {
        Ok(())
    }
}
