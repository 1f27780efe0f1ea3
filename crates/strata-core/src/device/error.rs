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

//! Errors reported by a [`super::BufferDevice`] implementation.

use thiserror::Error;

use super::{FenceId, NativeBufferId};

/// A failure raised by the graphics backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The device could not reserve the requested amount of memory.
    #[error("out of device memory while allocating {requested} bytes")]
    OutOfDeviceMemory {
        /// The size of the failed request.
        requested: usize,
    },
    /// The buffer handle is unknown or already destroyed.
    #[error("invalid native buffer {0:?}")]
    InvalidBuffer(NativeBufferId),
    /// The fence handle is unknown or already destroyed.
    #[error("invalid fence {0:?}")]
    InvalidFence(FenceId),
    /// `unmap` was called on a buffer that is not mapped.
    #[error("native buffer {0:?} is not mapped")]
    NotMapped(NativeBufferId),
    /// The driver refused to map the buffer.
    #[error("failed to map native buffer {buffer:?}: {reason}")]
    MapFailed {
        /// The buffer that could not be mapped.
        buffer: NativeBufferId,
        /// Backend specific explanation.
        reason: String,
    },
    /// A copy or mapping referenced bytes outside a buffer.
    #[error("range {offset}..{end} exceeds native buffer {buffer:?} of {size} bytes")]
    OutOfBounds {
        /// The buffer being accessed.
        buffer: NativeBufferId,
        /// Start of the offending range.
        offset: usize,
        /// End of the offending range.
        end: usize,
        /// Size of the buffer.
        size: usize,
    },
    /// Any other backend failure.
    #[error("device backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = DeviceError::OutOfDeviceMemory { requested: 4096 };
        assert_eq!(
            err.to_string(),
            "out of device memory while allocating 4096 bytes"
        );

        let err = DeviceError::OutOfBounds {
            buffer: NativeBufferId(3),
            offset: 64,
            end: 192,
            size: 128,
        };
        assert_eq!(
            err.to_string(),
            "range 64..192 exceeds native buffer NativeBufferId(3) of 128 bytes"
        );
    }
}
