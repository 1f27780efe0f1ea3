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

//! Pool configuration.
//!
//! A [`PoolConfig`] is usually deserialized from a RON file shipped next to
//! the renderer settings. Every field has a default, so a file only needs to
//! name what it overrides:
//!
//! ```ron
//! (
//!     bank_size: 8388608,
//!     defrag_dynamic: true,
//! )
//! ```

use serde::{Deserialize, Serialize};

use crate::error::BufferError;
use crate::types::ALIGNMENT;

/// Smallest constant buffer slot in bytes.
pub const MIN_CONSTANT_BUFFER_SIZE: usize = 256;

/// Tuning knobs for every pool owned by a [`crate::PoolManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Capacity of one bank in bytes. Rounded up to a power of two.
    pub bank_size: usize,
    /// Capacity of each transient ring pool in bytes.
    pub transient_pool_size: usize,
    /// Capacity of one constant buffer page in bytes.
    pub cb_bank_size: usize,
    /// Constant pages are only reclaimed while they hold more than this many bytes.
    pub cb_threshold: usize,
    /// Live allocations a single pool may track before falling back to
    /// dedicated allocations.
    pub max_allocs: usize,
    /// Concurrent defragmentation moves per pool.
    pub max_moves_per_update: usize,
    /// Compact static pools.
    pub defrag_static: bool,
    /// Compact dynamic pools.
    pub defrag_dynamic: bool,
    /// Use best fit instead of first fit when searching free regions.
    pub best_fit: bool,
    /// Route CPU writes through staging buffers. When disabled every pool
    /// relies on persistently mapped banks.
    pub staged_updates: bool,
    /// Write straight through bank base pointers when the device exposes them.
    pub lockless_updates: bool,
    /// Serve render-thread and loading-thread transient usage from ring pools.
    pub transient_pools: bool,
    /// Debug lockstep mode: wait for the GPU after every write.
    pub full_gpu_sync: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            bank_size: 4 << 20,
            transient_pool_size: 16 << 20,
            cb_bank_size: 4 << 20,
            cb_threshold: 64 << 20,
            max_allocs: 0xfff0,
            max_moves_per_update: 64,
            defrag_static: true,
            defrag_dynamic: false,
            best_fit: false,
            staged_updates: true,
            lockless_updates: true,
            transient_pools: false,
            full_gpu_sync: false,
        }
    }
}

impl PoolConfig {
    /// Parses a RON document. Missing fields keep their defaults.
    pub fn from_ron_str(source: &str) -> Result<Self, BufferError> {
        ron::from_str(source).map_err(|e| BufferError::Config(format!("RON parse error: {e}")))
    }

    /// Serializes to pretty-printed RON.
    pub fn to_ron_string(&self) -> Result<String, BufferError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| BufferError::Config(format!("RON serialization error: {e}")))
    }

    /// Rounds sizes to powers of two and disables move slots when no pool
    /// defragments.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.bank_size = self.bank_size.max(ALIGNMENT).next_power_of_two();
        self.transient_pool_size = self.transient_pool_size.max(ALIGNMENT).next_power_of_two();
        self.cb_bank_size = self
            .cb_bank_size
            .max(MIN_CONSTANT_BUFFER_SIZE)
            .next_power_of_two();
        self.cb_threshold = self.cb_threshold.next_power_of_two();
        if !self.defrag_static && !self.defrag_dynamic {
            self.max_moves_per_update = 0;
        }
        self
    }

    /// Rejects configurations no pool can operate with.
    pub fn validate(&self) -> Result<(), BufferError> {
        if !self.bank_size.is_power_of_two() || self.bank_size < ALIGNMENT {
            return Err(BufferError::Config(format!(
                "bank_size must be a power of two of at least {ALIGNMENT} bytes, got {}",
                self.bank_size
            )));
        }
        if self.transient_pool_size < ALIGNMENT {
            return Err(BufferError::Config(format!(
                "transient_pool_size must hold at least one {ALIGNMENT} byte allocation"
            )));
        }
        if !self.cb_bank_size.is_power_of_two() || self.cb_bank_size < MIN_CONSTANT_BUFFER_SIZE {
            return Err(BufferError::Config(format!(
                "cb_bank_size must be a power of two of at least {MIN_CONSTANT_BUFFER_SIZE} bytes, got {}",
                self.cb_bank_size
            )));
        }
        if self.max_allocs == 0 {
            return Err(BufferError::Config("max_allocs must be positive".into()));
        }
        if (self.defrag_static || self.defrag_dynamic) && self.max_moves_per_update == 0 {
            log::warn!("Defragmentation is enabled but max_moves_per_update is 0; no moves will run");
        }
        Ok(())
    }
}
