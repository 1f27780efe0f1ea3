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

//! Public vocabulary of the pooling subsystem: binding and usage classes,
//! buffer handles and the fixed constants shared by every pool.

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_core::{BindFlags, UsageFlags};

use crate::error::BufferError;
use crate::table::SlotKey;

/// Every pool allocation is aligned to, and sized in multiples of, this many bytes.
pub const ALIGNMENT: usize = 128;

/// Number of frames that may be in flight on the GPU, and the size of every
/// fence-keyed ring.
pub const FRAME_QUERY_COUNT: usize = 4;

/// Mask turning a frame id into a ring slot.
pub const FRAME_QUERY_MASK: u64 = FRAME_QUERY_COUNT as u64 - 1;

/// Rounds a request up to the pool alignment. Zero-sized requests take one
/// aligned unit. A size that cannot be rounded within `usize` is reported as
/// out of video memory.
pub(crate) fn align_up(size: usize) -> Result<usize, BufferError> {
    size.max(1)
        .checked_add(ALIGNMENT - 1)
        .map(|padded| padded & !(ALIGNMENT - 1))
        .ok_or(BufferError::OutOfVideoMemory { size })
}

/// The kind of stream a buffer is bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingType {
    /// Vertex data.
    Vertex,
    /// Index data.
    Index,
}

impl BindingType {
    /// All binding types, in pool-table order.
    pub const ALL: [Self; 2] = [Self::Vertex, Self::Index];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Vertex => 0,
            Self::Index => 1,
        }
    }

    pub(crate) fn bind_flags(self) -> BindFlags {
        match self {
            Self::Vertex => BindFlags::VERTEX,
            Self::Index => BindFlags::INDEX,
        }
    }
}

impl fmt::Display for BindingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Vertex => "vertex",
            Self::Index => "index",
        })
    }
}

/// How often a buffer's contents change, which selects the pool serving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageClass {
    /// Written once at creation and never again.
    Immutable,
    /// Rarely updated geometry.
    Static,
    /// Updated every few frames.
    Dynamic,
    /// Rewritten every frame.
    Transient,
    /// Per-frame data produced by the render thread.
    TransientRt,
    /// Transient data produced while the loading thread runs.
    WhenLoadingThreadActive,
}

impl UsageClass {
    /// All usage classes, in pool-table order.
    pub const ALL: [Self; 6] = [
        Self::Immutable,
        Self::Static,
        Self::Dynamic,
        Self::Transient,
        Self::TransientRt,
        Self::WhenLoadingThreadActive,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Immutable => 0,
            Self::Static => 1,
            Self::Dynamic => 2,
            Self::Transient => 3,
            Self::TransientRt => 4,
            Self::WhenLoadingThreadActive => 5,
        }
    }

    /// Device usage flags of native buffers backing this class.
    pub(crate) fn usage_flags(self) -> UsageFlags {
        match self {
            Self::Immutable | Self::Static => UsageFlags::CPU_COHERENT,
            Self::Dynamic | Self::Transient => {
                UsageFlags::DYNAMIC
                    | UsageFlags::CPU_WRITE
                    | UsageFlags::CPU_COHERENT
                    | UsageFlags::GPU_COHERENT
            }
            Self::TransientRt | Self::WhenLoadingThreadActive => {
                UsageFlags::DYNAMIC
                    | UsageFlags::CPU_WRITE
                    | UsageFlags::CPU_COHERENT
                    | UsageFlags::GPU_COHERENT
                    | UsageFlags::TRANSIENT
            }
        }
    }
}

impl fmt::Display for UsageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Immutable => "immutable",
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Transient => "transient",
            Self::TransientRt => "transient-rt",
            Self::WhenLoadingThreadActive => "loading-thread",
        })
    }
}

/// Index of a pool in the manager's (binding × usage) table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct PoolIndex(pub(crate) u8);

impl PoolIndex {
    pub(crate) const COUNT: usize = BindingType::ALL.len() * UsageClass::ALL.len();

    pub(crate) fn new(binding: BindingType, usage: UsageClass) -> Self {
        Self((binding.index() * UsageClass::ALL.len() + usage.index()) as u8)
    }

    pub(crate) fn binding(self) -> BindingType {
        BindingType::ALL[self.0 as usize / UsageClass::ALL.len()]
    }

    pub(crate) fn usage(self) -> UsageClass {
        UsageClass::ALL[self.0 as usize % UsageClass::ALL.len()]
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A stable reference to one buffer allocation.
///
/// Handles survive defragmentation and copy-on-write relocation. They carry
/// a generation, so a handle used after its allocation was destroyed is
/// rejected instead of aliasing whatever reused the slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub(crate) pool: PoolIndex,
    pub(crate) key: SlotKey,
}

impl BufferHandle {
    /// The binding type the buffer was created with.
    pub fn binding(&self) -> BindingType {
        self.pool.binding()
    }

    /// The usage class the buffer was created with.
    pub fn usage(&self) -> UsageClass {
        self.pool.usage()
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BufferHandle({}/{} #{}v{})",
            self.binding(),
            self.usage(),
            self.key.index,
            self.key.generation
        )
    }
}

/// Where an allocation currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLocation {
    /// The native buffer holding the bytes.
    pub buffer: strata_core::NativeBufferId,
    /// Byte offset of the allocation inside `buffer`.
    pub offset: usize,
    /// Aligned size of the allocation.
    pub size: usize,
}
