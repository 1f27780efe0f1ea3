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

//! Integration tests for online compaction of static pools.
//!
//! The scenarios share one layout: three 1 KiB items `a`, `b` and `c` fill
//! the first three quarters of a 4 KiB bank, then `a` is destroyed. Once
//! `a` retires, the pool moves `c` into the hole at offset 0.

use std::sync::Arc;

use strata_buffers::{BindingType, BufferHandle, PoolConfig, PoolManager, PoolStats, UsageClass};
use strata_infra::{HostBufferDevice, HostDeviceSettings};

const ITEM: usize = 1024;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Fixture {
    device: Arc<HostBufferDevice>,
    manager: PoolManager,
    b: BufferHandle,
    c: BufferHandle,
}

impl Fixture {
    /// Builds the three-item layout and destroys `a`.
    fn new(settings: HostDeviceSettings) -> Self {
        init_logger();
        let device = Arc::new(HostBufferDevice::new(settings));
        let config = PoolConfig {
            bank_size: 4 * ITEM,
            defrag_static: true,
            max_moves_per_update: 4,
            ..Default::default()
        };
        let manager = PoolManager::init(device.clone(), config).expect("valid configuration");
        let a = manager.create(BindingType::Vertex, UsageClass::Static, ITEM).unwrap();
        let b = manager.create(BindingType::Vertex, UsageClass::Static, ITEM).unwrap();
        let c = manager.create(BindingType::Vertex, UsageClass::Static, ITEM).unwrap();
        manager.update_buffer(b, &[0xb; ITEM]).unwrap();
        manager.update_buffer(c, &[0xc; ITEM]).unwrap();
        manager.destroy(a).unwrap();
        Self {
            device,
            manager,
            b,
            c,
        }
    }

    fn stats(&self) -> PoolStats {
        self.manager
            .stats(BindingType::Vertex, UsageClass::Static)
            .unwrap()
    }

    fn offset(&self, handle: BufferHandle) -> usize {
        self.manager.resolve(handle).unwrap().offset
    }

    fn bytes_at(&self, handle: BufferHandle) -> Vec<u8> {
        let location = self.manager.resolve(handle).unwrap();
        self.device
            .read_bytes(location.buffer, location.offset, ITEM)
            .expect("live native buffer")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Completed moves
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_move_keeps_handle_and_contents() {
    // ARRANGE
    let fx = Fixture::new(HostDeviceSettings::default());
    assert_eq!(fx.offset(fx.c), 2 * ITEM);

    // ACT / ASSERT: `a` is still deferred, so there is no hole yet.
    fx.manager.update(0, false).unwrap();
    assert_eq!(fx.stats().moves_in_flight, 0);

    // `a` retires and the copy of `c` is issued.
    fx.manager.update(1, false).unwrap();
    assert_eq!(fx.stats().moves_in_flight, 1);
    assert_eq!(fx.offset(fx.c), 2 * ITEM, "the handle moves only once the copy is done");

    // The copy fence passed: the handle points at the new storage.
    fx.manager.update(2, false).unwrap();
    assert_eq!(fx.offset(fx.c), 0);
    assert_eq!(fx.bytes_at(fx.c), vec![0xc; ITEM]);
    assert_eq!(fx.stats().moves_in_flight, 1);
    assert_eq!(fx.stats().free_bytes, ITEM);

    // The relocate fence passed: the old storage is free.
    fx.manager.update(3, false).unwrap();
    let stats = fx.stats();
    assert_eq!(stats.moves_in_flight, 0);
    assert_eq!(stats.free_bytes, 2 * ITEM);
    assert_eq!(stats.allocations, 2);
    assert_eq!(fx.offset(fx.b), ITEM, "nothing fits below b");

    let mut out = vec![0u8; ITEM];
    assert_eq!(fx.manager.read_buffer(fx.c, &mut out).unwrap(), ITEM);
    assert_eq!(out, vec![0xc; ITEM]);
    assert!(fx.device.copy_count() > 0);
}

#[test]
fn test_sync_finishes_moves_in_flight() {
    // ARRANGE
    let fx = Fixture::new(HostDeviceSettings::default());
    fx.manager.update(0, false).unwrap();
    fx.manager.update(1, false).unwrap();
    assert_eq!(fx.stats().moves_in_flight, 1);

    // ACT
    fx.manager.sync(2).unwrap();

    // ASSERT
    let stats = fx.stats();
    assert_eq!(stats.moves_in_flight, 0);
    assert_eq!(stats.free_bytes, 2 * ITEM);
    assert_eq!(fx.offset(fx.c), 0);
    assert_eq!(fx.bytes_at(fx.c), vec![0xc; ITEM]);
}

#[test]
fn test_loading_suspends_compaction() {
    let fx = Fixture::new(HostDeviceSettings::default());
    fx.manager.update(0, true).unwrap();
    fx.manager.update(1, true).unwrap();
    assert_eq!(fx.stats().moves_in_flight, 0);
    assert_eq!(fx.stats().free_bytes, 2 * ITEM);

    fx.manager.update(2, false).unwrap();
    assert_eq!(fx.stats().moves_in_flight, 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Canceled moves
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_write_cancels_move_exactly_once() {
    // ARRANGE
    let fx = Fixture::new(HostDeviceSettings {
        auto_complete: false,
        ..Default::default()
    });
    fx.manager.update(0, false).unwrap();
    fx.device.complete_all();
    fx.manager.update(1, false).unwrap();
    assert_eq!(fx.stats().moves_in_flight, 1);

    // ACT: the GPU finished the frame that last used `c`, so the write
    // lands in place and the move loses its source.
    let mut range = fx.manager.begin_write(fx.c).unwrap();
    // SAFETY: mapped until `end_read_write`.
    unsafe { range.as_mut_slice() }.fill(0xd);
    fx.manager.end_read_write(fx.c).unwrap();
    // A second pin of the same block finds no move to cancel.
    let mut out = vec![0u8; ITEM];
    fx.manager.read_buffer(fx.c, &mut out).unwrap();

    // ASSERT: the reserved destination returns exactly once.
    fx.manager.update(2, true).unwrap();
    let first = fx.stats();
    fx.manager.update(3, true).unwrap();
    let second = fx.stats();

    assert_eq!(out, vec![0xd; ITEM]);
    assert_eq!(first.moves_in_flight, 0);
    assert_eq!(first.free_bytes, 2 * ITEM);
    assert_eq!(second.free_bytes, 2 * ITEM);
    assert_eq!(fx.offset(fx.c), 2 * ITEM);
    assert_eq!(fx.bytes_at(fx.c), vec![0xd; ITEM]);
}

#[test]
fn test_destroy_during_copy_releases_both_locations() {
    // ARRANGE
    let fx = Fixture::new(HostDeviceSettings::default());
    fx.manager.update(0, false).unwrap();
    fx.manager.update(1, false).unwrap();
    assert_eq!(fx.stats().moves_in_flight, 1);

    // ACT
    fx.manager.destroy(fx.c).unwrap();
    fx.manager.update(2, true).unwrap();
    let canceled = fx.stats();
    fx.manager.update(3, true).unwrap();
    let retired = fx.stats();

    // ASSERT: the destination comes back first, the item when its frame retires.
    assert_eq!(canceled.moves_in_flight, 0);
    assert_eq!(canceled.free_bytes, 2 * ITEM);
    assert_eq!(retired.free_bytes, 3 * ITEM);
    assert_eq!(retired.allocations, 1);
    assert_eq!(fx.bytes_at(fx.b), vec![0xb; ITEM]);
}

#[test]
fn test_destroy_after_relocation_frees_the_new_storage() {
    // ARRANGE
    let fx = Fixture::new(HostDeviceSettings::default());
    for frame in 0..3 {
        fx.manager.update(frame, false).unwrap();
    }
    assert_eq!(fx.offset(fx.c), 0);

    // ACT
    fx.manager.destroy(fx.c).unwrap();
    fx.manager.sync(3).unwrap();

    // ASSERT: everything but `b` is free and the bank stays resident.
    let stats = fx.stats();
    assert_eq!(stats.moves_in_flight, 0);
    assert_eq!(stats.free_bytes, 3 * ITEM);
    assert_eq!(stats.live_banks, 1);
}
