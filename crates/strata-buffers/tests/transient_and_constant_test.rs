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

//! Integration tests for the transient ring pools, constant buffers and the
//! CPU access paths chosen by the configuration.

use std::sync::Arc;

use strata_buffers::{BindingType, BufferError, PoolConfig, PoolManager, UsageClass};
use strata_infra::{HostBufferDevice, HostDeviceSettings};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup(config: PoolConfig, settings: HostDeviceSettings) -> (Arc<HostBufferDevice>, PoolManager) {
    init_logger();
    let device = Arc::new(HostBufferDevice::new(settings));
    let manager = PoolManager::init(device.clone(), config).expect("valid configuration");
    (device, manager)
}

fn unified() -> HostDeviceSettings {
    HostDeviceSettings {
        unified_memory: true,
        ..Default::default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transient rings
// ─────────────────────────────────────────────────────────────────────────────

fn ring_config() -> PoolConfig {
    PoolConfig {
        transient_pools: true,
        transient_pool_size: 1024,
        ..Default::default()
    }
}

#[test]
fn test_ring_allocates_linearly_and_wraps() {
    // ARRANGE
    let (_device, manager) = setup(ring_config(), HostDeviceSettings::default());

    // ACT
    let first = manager.create(BindingType::Vertex, UsageClass::TransientRt, 512).unwrap();
    let second = manager.create(BindingType::Vertex, UsageClass::TransientRt, 500).unwrap();
    let wrapped = manager.create(BindingType::Vertex, UsageClass::TransientRt, 512).unwrap();

    // ASSERT
    let offsets: Vec<usize> = [first, second, wrapped]
        .iter()
        .map(|&h| manager.resolve(h).unwrap().offset)
        .collect();
    assert_eq!(offsets, vec![0, 512, 0]);
    assert_eq!(manager.size(second).unwrap(), 512);
    assert!(matches!(
        manager.create(BindingType::Vertex, UsageClass::TransientRt, 2048),
        Err(BufferError::TransientOverflow {
            size: 2048,
            capacity: 1024
        })
    ));

    for handle in [first, second, wrapped] {
        manager.destroy(handle).unwrap();
    }
    manager.update(0, false).unwrap();
    let stats = manager.stats(BindingType::Vertex, UsageClass::TransientRt).unwrap();
    assert_eq!(stats.allocations, 0);
    assert_eq!(stats.free_bytes, 1024, "update rewinds the ring");
}

#[test]
fn test_ring_writes_and_rejects_reads() {
    // ARRANGE
    let (device, manager) = setup(ring_config(), HostDeviceSettings::default());
    let handle = manager
        .create(BindingType::Index, UsageClass::WhenLoadingThreadActive, 256)
        .unwrap();

    // ACT
    manager.update_buffer(handle, &[5; 256]).unwrap();

    // ASSERT
    let location = manager.resolve(handle).unwrap();
    assert_eq!(device.read_bytes(location.buffer, 0, 256), Some(vec![5; 256]));
    assert!(!device.is_mapped(location.buffer));
    assert!(matches!(manager.begin_read(handle), Err(BufferError::ReadUnsupported)));

    // Freeing is immediate: the handle is gone before any update.
    manager.destroy(handle).unwrap();
    assert!(matches!(manager.size(handle), Err(BufferError::StaleHandle)));
}

#[test]
fn test_without_rings_transient_classes_use_banks() {
    let (_device, manager) = setup(PoolConfig::default(), HostDeviceSettings::default());
    let handle = manager.create(BindingType::Vertex, UsageClass::TransientRt, 512).unwrap();
    manager.destroy(handle).unwrap();

    let stats = manager.stats(BindingType::Vertex, UsageClass::TransientRt).unwrap();
    assert_eq!(stats.bank_size, PoolConfig::default().bank_size);
    assert_eq!(stats.deferred_items, 1, "banked frees wait for the frame fence");
}

// ─────────────────────────────────────────────────────────────────────────────
// Constant buffers
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_constant_buffer_lifecycle() {
    // ARRANGE
    let config = PoolConfig {
        cb_bank_size: 64 * 1024,
        cb_threshold: 0,
        ..Default::default()
    };
    let (device, manager) = setup(config, HostDeviceSettings::default());

    // ACT
    let small = manager.create_constant_buffer(100).unwrap();
    let large = manager.create_constant_buffer(3000).unwrap();
    manager.write_constant_buffer(small, &[1; 100]).unwrap();

    // ASSERT
    let small_at = manager.resolve_constant_buffer(small).unwrap();
    let large_at = manager.resolve_constant_buffer(large).unwrap();
    assert_eq!(small_at.size, 256);
    assert_eq!(large_at.size, 4096);
    assert_ne!(small_at.buffer, large_at.buffer, "sizes live in separate pages");
    assert_eq!(
        device.read_bytes(small_at.buffer, small_at.offset, 100),
        Some(vec![1; 100])
    );
    assert!(matches!(
        manager.write_constant_buffer(small, &[0; 257]),
        Err(BufferError::WriteTooLarge { .. })
    ));
    assert!(matches!(
        manager.create_constant_buffer(64 * 1024 + 1),
        Err(BufferError::ConstantBufferTooLarge { .. })
    ));

    // ACT: frees wait for the frame fence, then empty pages can go.
    manager.destroy_constant_buffer(small).unwrap();
    manager.destroy_constant_buffer(large).unwrap();
    let pending = manager.constant_buffer_stats().unwrap();
    manager.update(0, false).unwrap();
    manager.update(1, false).unwrap();
    let retired = manager.constant_buffer_stats().unwrap();
    manager.release_empty_banks(2).unwrap();
    let released = manager.constant_buffer_stats().unwrap();

    // ASSERT
    assert_eq!(pending.pending_frees, 2);
    assert_eq!(pending.live_slots, 2);
    assert_eq!(retired.pending_frees, 0);
    assert_eq!(retired.live_slots, 0);
    assert_eq!(retired.pages, 2);
    assert_eq!(released.pages, 0);
    assert!(matches!(
        manager.resolve_constant_buffer(small),
        Err(BufferError::StaleHandle)
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Access paths
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_unified_memory_without_staging_uses_base_pointers() {
    // ARRANGE
    let config = PoolConfig {
        staged_updates: false,
        ..Default::default()
    };
    let (device, manager) = setup(config, unified());
    let handle = manager.create(BindingType::Vertex, UsageClass::Static, 256).unwrap();

    // ACT
    manager.update_buffer(handle, &[4; 256]).unwrap();
    let mut out = [0u8; 256];
    let read = manager.read_buffer(handle, &mut out).unwrap();

    // ASSERT
    assert_eq!(read, 256);
    assert_eq!(out, [4; 256]);
    let location = manager.resolve(handle).unwrap();
    assert!(!device.is_mapped(location.buffer));
    assert_eq!(device.copy_count(), 0, "no staging copies on this path");
}

#[test]
fn test_missing_cpu_path_is_a_map_failure() {
    let config = PoolConfig {
        staged_updates: false,
        ..Default::default()
    };
    let (_device, manager) = setup(config, HostDeviceSettings::default());
    let handle = manager.create(BindingType::Vertex, UsageClass::Dynamic, 256).unwrap();

    assert!(matches!(
        manager.update_buffer(handle, &[1; 4]),
        Err(BufferError::MapFailed(_))
    ));
    // The failed write leaves the buffer closed.
    assert!(matches!(manager.end_read_write(handle), Err(BufferError::NotMapped)));
    manager.destroy(handle).unwrap();
}

#[test]
fn test_lockstep_mode_waits_after_each_write() {
    // ARRANGE: the simulated GPU only advances when someone waits on it.
    let config = PoolConfig {
        full_gpu_sync: true,
        ..Default::default()
    };
    let (device, manager) = setup(
        config,
        HostDeviceSettings {
            auto_complete: false,
            ..Default::default()
        },
    );
    let freed = manager.create(BindingType::Index, UsageClass::Dynamic, 256).unwrap();
    let written = manager.create(BindingType::Index, UsageClass::Dynamic, 256).unwrap();
    manager.destroy(freed).unwrap();
    manager.update(0, false).unwrap();

    // ACT
    manager.update_buffer(written, &[3; 4]).unwrap();
    manager.update(1, false).unwrap();

    // ASSERT: the wait after the write also covered the previous frame.
    let stats = manager.stats(BindingType::Index, UsageClass::Dynamic).unwrap();
    assert_eq!(stats.deferred_items, 0);
    assert_eq!(stats.allocations, 1);
    let location = manager.resolve(written).unwrap();
    assert_eq!(device.read_bytes(location.buffer, location.offset, 4), Some(vec![3; 4]));
}
