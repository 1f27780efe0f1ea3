use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use strata_buffers::{BindingType, PoolConfig, PoolManager, UsageClass};
use strata_infra::HostBufferDevice;

fn manager(config: PoolConfig) -> PoolManager {
    PoolManager::init(Arc::new(HostBufferDevice::default()), config).unwrap()
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Buffer Pools");

    // 256 mixed-size buffers per frame, freed the same frame.
    group.bench_function("Frame churn (dynamic, first fit)", |b| {
        let pools = manager(PoolConfig::default());
        let mut frame = 0u64;
        b.iter(|| {
            let handles: Vec<_> = (0..256)
                .map(|i| {
                    pools
                        .create(BindingType::Vertex, UsageClass::Dynamic, 128 + (i % 7) * 384)
                        .unwrap()
                })
                .collect();
            for handle in handles {
                pools.destroy(black_box(handle)).unwrap();
            }
            pools.update(frame, false).unwrap();
            frame += 1;
        });
    });

    group.bench_function("Frame churn (dynamic, best fit)", |b| {
        let pools = manager(PoolConfig {
            best_fit: true,
            ..Default::default()
        });
        let mut frame = 0u64;
        b.iter(|| {
            let handles: Vec<_> = (0..256)
                .map(|i| {
                    pools
                        .create(BindingType::Vertex, UsageClass::Dynamic, 128 + (i % 7) * 384)
                        .unwrap()
                })
                .collect();
            for handle in handles {
                pools.destroy(black_box(handle)).unwrap();
            }
            pools.update(frame, false).unwrap();
            frame += 1;
        });
    });

    group.bench_function("Transient ring (256 allocations)", |b| {
        let pools = manager(PoolConfig {
            transient_pools: true,
            ..Default::default()
        });
        let mut frame = 0u64;
        b.iter(|| {
            for _ in 0..256 {
                let handle = pools
                    .create(BindingType::Index, UsageClass::TransientRt, 1024)
                    .unwrap();
                pools.destroy(black_box(handle)).unwrap();
            }
            pools.update(frame, false).unwrap();
            frame += 1;
        });
    });

    group.bench_function("Constant buffers (256 x 256B)", |b| {
        let pools = manager(PoolConfig::default());
        let mut frame = 0u64;
        b.iter(|| {
            let handles: Vec<_> = (0..256)
                .map(|_| pools.create_constant_buffer(256).unwrap())
                .collect();
            for handle in handles {
                pools.destroy_constant_buffer(black_box(handle)).unwrap();
            }
            pools.update(frame, false).unwrap();
            frame += 1;
        });
    });

    group.finish();
}

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("Compaction");

    // Every other buffer freed: each update moves up to 64 survivors down.
    group.bench_function("Static pool, half fragmented", |b| {
        let pools = manager(PoolConfig {
            bank_size: 1 << 20,
            ..Default::default()
        });
        let handles: Vec<_> = (0..2048)
            .map(|_| {
                pools
                    .create(BindingType::Vertex, UsageClass::Static, 1024)
                    .unwrap()
            })
            .collect();
        for handle in handles.iter().step_by(2) {
            pools.destroy(*handle).unwrap();
        }
        let mut frame = 0u64;
        b.iter(|| {
            pools.update(black_box(frame), false).unwrap();
            frame += 1;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_allocation, bench_compaction);
criterion_main!(benches);
