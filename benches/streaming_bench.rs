//! Microbenches for the hot allocator and streaming paths.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use glam::Vec3;

use ember::device::staging::StagingRing;
use ember::errors::Result;
use ember::world::{
    Entity, EntityLoader, PackedEntityRecord, StreamingBox, StreamingEngine, StreamingGrid,
    StreamingIsland, StreamingObserver, WorldBinding,
};

fn staging_ring_churn(c: &mut Criterion) {
    let ring = StagingRing::new(64 << 20, 4096);
    c.bench_function("staging_ring_alloc_free", |b| {
        b.iter(|| {
            let a = ring.allocate(black_box(200 * 1024), "bench").unwrap();
            let b2 = ring.allocate(black_box(16 * 1024), "bench").unwrap();
            ring.free(&a);
            let c2 = ring.allocate(black_box(64 * 1024), "bench").unwrap();
            ring.free(&b2);
            ring.free(&c2);
        });
    });
}

fn grid_insert(c: &mut Criterion) {
    c.bench_function("grid_insert_4096", |b| {
        b.iter(|| {
            let mut grid = StreamingGrid::new(16.0);
            for index in 0..4096u32 {
                let center = Vec3::new((index % 64) as f32 * 37.0, (index / 64) as f32 * 37.0, 0.0);
                let island_box =
                    StreamingBox::from_center_half_extent(center, 8.0 + (index % 17) as f32 * 4.0);
                grid.insert(index, &island_box);
            }
            black_box(grid.total_island_count())
        });
    });
}

struct NullWorld;

impl WorldBinding for NullWorld {
    fn attach_entity(&mut self, _entity: &Arc<dyn Entity>) {}
    fn detach_entity(&mut self, _entity: &Arc<dyn Entity>) {}
}

struct NullEntity(u64);

impl Entity for NullEntity {
    fn id(&self) -> u64 {
        self.0
    }
}

struct NullLoader;

impl EntityLoader for NullLoader {
    fn load_entity(&self, record: &PackedEntityRecord) -> Result<Arc<dyn Entity>> {
        Ok(Arc::new(NullEntity(record.id)))
    }
}

fn task_process(c: &mut Criterion) {
    // Many small islands in a plane, one observer near a corner. Each
    // iteration runs the full visibility/unload/load phases, including
    // decompression of the in-range islands.
    let islands: Vec<Arc<StreamingIsland>> = (0..2048u32)
        .map(|index| {
            let center = Vec3::new((index % 64) as f32 * 150.0, (index / 64) as f32 * 150.0, 0.0);
            Arc::new(StreamingIsland::pack(
                StreamingBox::from_center_half_extent(center, 60.0),
                false,
                vec![PackedEntityRecord {
                    id: u64::from(index),
                    data: serde_json::Value::Null,
                }],
            ))
        })
        .collect();
    let scene = ember::world::compile_scene(&islands, 16.0);

    let mut engine = StreamingEngine::new();
    engine.bind_scene(&mut NullWorld, Some(&scene));
    let loader = NullLoader;

    c.bench_function("streaming_task_process_2048", |b| {
        b.iter(|| {
            let mut task = engine
                .create_streaming_task(&[StreamingObserver::at(Vec3::new(4800.0, 2400.0, 0.0))]);
            task.process(&loader);
            black_box(task.loaded_islands().len())
        });
    });
}

criterion_group!(benches, staging_ring_churn, grid_insert, task_process);
criterion_main!(benches);
