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


// Strata Sandbox
// Streams meshes in and out of the pools on the host backend and logs what
// the allocator does with them.

use std::sync::Arc;

use anyhow::{Context, Result};
use strata_buffers::{BindingType, BufferHandle, PoolConfig, PoolManager, UsageClass};
use strata_core::memory;
use strata_infra::{HostBufferDevice, HostDeviceSettings};

const FRAMES: u64 = 240;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 3],
}

struct Mesh {
    vertices: BufferHandle,
    indices: BufferHandle,
}

/// A fan of `sides` triangles around the origin.
fn polygon(sides: u32, radius: f32) -> (Vec<Vertex>, Vec<u16>) {
    let mut vertices = vec![Vertex {
        position: [0.0; 3],
        color: [1.0; 3],
    }];
    for i in 0..sides {
        let angle = i as f32 / sides as f32 * std::f32::consts::TAU;
        vertices.push(Vertex {
            position: [radius * angle.cos(), radius * angle.sin(), 0.0],
            color: [angle.cos().abs(), angle.sin().abs(), 0.5],
        });
    }
    let indices = (0..sides as u16)
        .flat_map(|i| [0, i + 1, (i + 1) % sides as u16 + 1])
        .collect();
    (vertices, indices)
}

fn upload(pools: &PoolManager, sides: u32) -> Result<Mesh> {
    let (vertices, indices) = polygon(sides, 1.0);
    let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
    let index_bytes: &[u8] = bytemuck::cast_slice(&indices);
    let mesh = Mesh {
        vertices: pools.create(BindingType::Vertex, UsageClass::Static, vertex_bytes.len())?,
        indices: pools.create(BindingType::Index, UsageClass::Static, index_bytes.len())?,
    };
    pools.update_buffer(mesh.vertices, vertex_bytes)?;
    pools.update_buffer(mesh.indices, index_bytes)?;
    Ok(mesh)
}

fn load_config() -> Result<PoolConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("reading pool configuration {path}"))?;
            Ok(PoolConfig::from_ron_str(&source)?)
        }
        None => Ok(PoolConfig::from_ron_str(include_str!("../pools.ron"))?),
    }
}

fn main() -> Result<()> {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();

    let device = Arc::new(HostBufferDevice::new(HostDeviceSettings::default()));
    let pools = PoolManager::init(device.clone(), load_config()?)?;

    let mut meshes: Vec<Mesh> = Vec::new();
    let transform = pools.create_constant_buffer(std::mem::size_of::<[[f32; 4]; 4]>())?;
    let particles = pools.create(BindingType::Vertex, UsageClass::Dynamic, 64 * 1024)?;

    for frame in 0..FRAMES {
        // Stream a new mesh in every frame, drop every third one.
        meshes.push(upload(&pools, 3 + (frame % 61) as u32)?);
        if frame % 3 == 0 && meshes.len() > 8 {
            let mesh = meshes.swap_remove((frame as usize * 7) % meshes.len());
            pools.destroy(mesh.vertices)?;
            pools.destroy(mesh.indices)?;
        }

        let angle = frame as f32 * 0.05;
        let matrix: [[f32; 4]; 4] = [
            [angle.cos(), -angle.sin(), 0.0, 0.0],
            [angle.sin(), angle.cos(), 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        pools.write_constant_buffer(transform, bytemuck::cast_slice(&matrix))?;
        pools.update_buffer(particles, &vec![frame as u8; 64 * 1024])?;

        let overlay = pools.create(BindingType::Vertex, UsageClass::TransientRt, 4096)?;
        pools.update_buffer(overlay, &[0xff; 4096])?;
        pools.destroy(overlay)?;

        pools.update(frame, false)?;

        if frame % 60 == 59 {
            let stats = pools.stats(BindingType::Vertex, UsageClass::Static)?;
            log::info!(
                "frame {frame}: {} meshes, static vertex pool {} banks, {} bytes in use, {} free, {} moves in flight",
                meshes.len(),
                stats.live_banks,
                stats.bytes_in_use,
                stats.free_bytes,
                stats.moves_in_flight
            );
        }
    }

    pools.sync(FRAMES)?;
    pools.release_empty_banks(FRAMES + 1)?;
    let memory = memory::video_memory_stats();
    log::info!(
        "after sync: {} native buffers, {} bytes (peak {}), {} device copies",
        memory.live_buffers,
        memory.current_bytes,
        memory.peak_bytes,
        device.copy_count()
    );
    log::info!(
        "constant buffers: {:?}",
        pools.constant_buffer_stats()?
    );

    for mesh in meshes {
        pools.destroy(mesh.vertices)?;
        pools.destroy(mesh.indices)?;
    }
    pools.destroy(particles)?;
    pools.destroy_constant_buffer(transform)?;
    pools.shutdown()?;
    Ok(())
}
