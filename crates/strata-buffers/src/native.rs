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

//! Native buffer creation with memory accounting.

use strata_core::{memory, BufferDevice, DeviceError, NativeBufferDescriptor, NativeBufferId};

use crate::error::BufferError;

/// Creates a native buffer, recording it in the video memory counters.
///
/// An allocation the device refuses raises the low-video-memory flag and
/// yields [`BufferError::OutOfVideoMemory`].
pub(crate) fn create_native(
    device: &dyn BufferDevice,
    descriptor: &NativeBufferDescriptor,
) -> Result<NativeBufferId, BufferError> {
    match device.create_buffer(descriptor) {
        Ok(id) => {
            memory::record_native_created(descriptor.size);
            Ok(id)
        }
        Err(DeviceError::OutOfDeviceMemory { requested }) => {
            memory::flag_out_of_video_memory();
            Err(BufferError::OutOfVideoMemory { size: requested })
        }
        Err(err) => {
            log::error!(
                "Failed to create native buffer {:?} of {} bytes: {err}",
                descriptor.label,
                descriptor.size
            );
            memory::flag_out_of_video_memory();
            Err(BufferError::OutOfVideoMemory {
                size: descriptor.size,
            })
        }
    }
}

pub(crate) fn destroy_native(
    device: &dyn BufferDevice,
    id: NativeBufferId,
    size: usize,
) -> Result<(), BufferError> {
    device.destroy_buffer(id)?;
    memory::record_native_released(size);
    Ok(())
}

/// Converts a device map failure into the pool-level error, logging it.
pub(crate) fn map_failed(id: NativeBufferId, err: DeviceError) -> BufferError {
    log::error!("Mapping native buffer {id:?} failed: {err}");
    BufferError::MapFailed(err.to_string())
}
