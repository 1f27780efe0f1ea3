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

//! Errors surfaced by the buffer pools.

use thiserror::Error;

use strata_core::DeviceError;

use crate::types::{BindingType, UsageClass};

/// A failure of a pool operation.
///
/// Resource exhaustion ([`BufferError::OutOfVideoMemory`],
/// [`BufferError::MapFailed`]) is transient: the caller skips the update and
/// may retry next frame. The remaining variants report misuse of the API.
#[derive(Debug, Error)]
pub enum BufferError {
    /// A bank or dedicated native allocation could not be created.
    #[error("out of video memory while allocating {size} bytes")]
    OutOfVideoMemory {
        /// Size of the failed request.
        size: usize,
    },
    /// CPU access to the allocation could not be established.
    #[error("failed to map buffer memory: {0}")]
    MapFailed(String),
    /// The handle was destroyed, or never belonged to this manager.
    #[error("stale or foreign buffer handle")]
    StaleHandle,
    /// No pool serves the requested combination.
    #[error("no pool configured for {binding} buffers with {usage} usage")]
    PoolNotConfigured {
        /// Requested binding.
        binding: BindingType,
        /// Requested usage.
        usage: UsageClass,
    },
    /// The shadow allocation for a copy-on-write update failed. The write
    /// did not happen and the buffer keeps its previous contents.
    #[error("copy-on-write shadow allocation of {size} bytes failed")]
    CopyOnWriteFailed {
        /// Size of the shadow allocation.
        size: usize,
        /// Why the shadow allocation failed.
        #[source]
        source: Box<BufferError>,
    },
    /// The source data is larger than the allocation.
    #[error("write of {len} bytes exceeds allocation of {capacity} bytes")]
    WriteTooLarge {
        /// Bytes supplied.
        len: usize,
        /// Bytes available.
        capacity: usize,
    },
    /// A mapped write larger than the staging buffer was requested.
    #[error("staging buffer of {capacity} bytes cannot hold {size} bytes; use a chunked update")]
    StagingTooSmall {
        /// Bytes requested.
        size: usize,
        /// Staging capacity.
        capacity: usize,
    },
    /// `end_read_write` without a matching begin.
    #[error("buffer is not open for reading or writing")]
    NotMapped,
    /// A second begin before the matching `end_read_write`.
    #[error("buffer is already open for reading or writing")]
    AlreadyMapped,
    /// The pool has no read path.
    #[error("reads are not supported by this pool")]
    ReadUnsupported,
    /// A transient allocation larger than the whole transient ring.
    #[error("transient allocation of {size} bytes exceeds pool capacity of {capacity} bytes")]
    TransientOverflow {
        /// Bytes requested.
        size: usize,
        /// Ring capacity.
        capacity: usize,
    },
    /// A constant buffer larger than one constant page.
    #[error("constant buffer of {size} bytes exceeds the maximum of {max} bytes")]
    ConstantBufferTooLarge {
        /// Bytes requested.
        size: usize,
        /// Largest supported size.
        max: usize,
    },
    /// A mutex guarding pool state was poisoned by a panicking thread.
    #[error("lock poisoned ({0})")]
    LockPoisoned(&'static str),
    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The device reported an error.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl BufferError {
    /// `true` for transient resource exhaustion the caller may retry later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::OutOfVideoMemory { .. } | Self::MapFailed(_) | Self::Device(_) => true,
            Self::CopyOnWriteFailed { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_copy_on_write_failure_keeps_its_cause() {
        let err = BufferError::CopyOnWriteFailed {
            size: 256,
            source: Box::new(BufferError::OutOfVideoMemory { size: 256 }),
        };
        assert!(err.is_recoverable());
        assert_eq!(
            err.source().map(|s| s.to_string()),
            Some("out of video memory while allocating 256 bytes".to_string())
        );
    }

    #[test]
    fn test_misuse_is_not_recoverable() {
        assert!(!BufferError::StaleHandle.is_recoverable());
        let err = BufferError::PoolNotConfigured {
            binding: BindingType::Index,
            usage: UsageClass::Immutable,
        };
        assert_eq!(
            err.to_string(),
            "no pool configured for index buffers with immutable usage"
        );
    }
}
