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

//! Process-wide video memory counters and the low-video-memory flag.
//!
//! Buffer pools record every native buffer they create or release here, and
//! raise the low-video-memory flag whenever the device refuses an
//! allocation. Any subsystem can poll the flag to degrade gracefully (drop
//! optional effects, stream lower mips) instead of failing outright.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Bytes currently held in native buffers created by the pools.
pub static CURRENT_DEVICE_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Highest value [`CURRENT_DEVICE_BYTES`] ever reached.
pub static PEAK_DEVICE_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Native buffers currently alive.
pub static LIVE_NATIVE_BUFFERS: AtomicUsize = AtomicUsize::new(0);

/// Native buffer creations over the process lifetime.
pub static TOTAL_NATIVE_CREATIONS: AtomicU64 = AtomicU64::new(0);

/// Allocation failures reported by the device over the process lifetime.
pub static TOTAL_ALLOCATION_FAILURES: AtomicU64 = AtomicU64::new(0);

static OUT_OF_VIDEO_MEMORY: AtomicBool = AtomicBool::new(false);

/// Records a newly created native buffer of `size` bytes.
pub fn record_native_created(size: usize) {
    let current = CURRENT_DEVICE_BYTES.fetch_add(size, Ordering::Relaxed) + size;
    PEAK_DEVICE_BYTES.fetch_max(current, Ordering::Relaxed);
    LIVE_NATIVE_BUFFERS.fetch_add(1, Ordering::Relaxed);
    TOTAL_NATIVE_CREATIONS.fetch_add(1, Ordering::Relaxed);
}

/// Records the release of a native buffer of `size` bytes.
pub fn record_native_released(size: usize) {
    let _ = CURRENT_DEVICE_BYTES.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bytes| {
        Some(bytes.saturating_sub(size))
    });
    let _ = LIVE_NATIVE_BUFFERS.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
        Some(count.saturating_sub(1))
    });
}

/// Raises the low-video-memory flag after a failed device allocation.
pub fn flag_out_of_video_memory() {
    TOTAL_ALLOCATION_FAILURES.fetch_add(1, Ordering::Relaxed);
    if !OUT_OF_VIDEO_MEMORY.swap(true, Ordering::AcqRel) {
        log::warn!("Video memory exhausted, low-memory flag raised");
    }
}

/// `true` once any device allocation has failed since the last clear.
pub fn is_out_of_video_memory() -> bool {
    OUT_OF_VIDEO_MEMORY.load(Ordering::Acquire)
}

/// Clears the low-video-memory flag, typically after a level unload.
pub fn clear_out_of_video_memory() {
    OUT_OF_VIDEO_MEMORY.store(false, Ordering::Release);
}

/// A snapshot of the counters in this module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoMemoryStats {
    /// Bytes currently held in native buffers.
    pub current_bytes: usize,
    /// Peak of `current_bytes`.
    pub peak_bytes: usize,
    /// Native buffers currently alive.
    pub live_buffers: usize,
    /// Lifetime native buffer creations.
    pub total_creations: u64,
    /// Lifetime device allocation failures.
    pub allocation_failures: u64,
    /// State of the low-video-memory flag.
    pub out_of_video_memory: bool,
}

/// Reads all counters.
pub fn video_memory_stats() -> VideoMemoryStats {
    VideoMemoryStats {
        current_bytes: CURRENT_DEVICE_BYTES.load(Ordering::Relaxed),
        peak_bytes: PEAK_DEVICE_BYTES.load(Ordering::Relaxed),
        live_buffers: LIVE_NATIVE_BUFFERS.load(Ordering::Relaxed),
        total_creations: TOTAL_NATIVE_CREATIONS.load(Ordering::Relaxed),
        allocation_failures: TOTAL_ALLOCATION_FAILURES.load(Ordering::Relaxed),
        out_of_video_memory: is_out_of_video_memory(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_tracks_creations() {
        record_native_created(1 << 20);
        let stats = video_memory_stats();
        assert!(stats.peak_bytes >= 1 << 20);
        assert!(stats.total_creations >= 1);
        record_native_released(1 << 20);
    }

    #[test]
    fn test_flag_is_sticky_until_cleared() {
        flag_out_of_video_memory();
        assert!(is_out_of_video_memory());
        assert!(video_memory_stats().allocation_failures >= 1);
    }
}
