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

//! Banked GPU buffer pools.
//!
//! Vertex and index buffers are sub-allocated from large fixed-size banks,
//! one pool per binding type and usage class. Handles stay valid while the
//! pools relocate storage underneath them, whether to compact banks or to
//! avoid overwriting memory the GPU may still be reading. Frees are
//! deferred until the frame that issued them has retired on the GPU.
//!
//! All device access goes through [`strata_core::BufferDevice`]; the
//! [`PoolManager`] is the only entry point.

#![warn(missing_docs)]

mod allocator;
pub mod config;
mod constant;
pub mod error;
mod manager;
mod native;
mod pool;
mod ring;
mod table;
pub mod types;
mod updater;

pub use self::config::{PoolConfig, MIN_CONSTANT_BUFFER_SIZE};
pub use self::constant::{ConstantBufferHandle, ConstantBufferStats};
pub use self::error::BufferError;
pub use self::manager::PoolManager;
pub use self::pool::PoolStats;
pub use self::types::{
    BindingType, BufferHandle, BufferLocation, UsageClass, ALIGNMENT, FRAME_QUERY_COUNT,
};

pub use strata_core::{BufferDevice, MappedRange, NativeBufferId};
