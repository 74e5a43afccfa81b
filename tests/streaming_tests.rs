//! World Streaming Tests
//!
//! Tests for:
//! - Island pack/load roundtrip through the entity loader
//! - Parent-before-child attach and child-before-parent detach ordering
//! - Idempotence: unchanged observers leave the attached set unchanged
//! - Always-loaded islands, decode failure retry, task cancellation
//! - Compiled scene/sector containers and the grid bake

use std::sync::{Arc, Mutex};

use glam::Vec3;
use serde_json::json;

use ember::world::{
    compile_scene, CompiledScene, CompiledSector, Entity, EntityLoader, PackedEntityRecord,
    StreamingBox, StreamingEngine, StreamingIsland, StreamingObserver, WorldBinding,
};
use ember::errors::{EmberError, Result};

// ============================================================================
// Test doubles
// ============================================================================

struct TestEntity {
    id: u64,
}

impl Entity for TestEntity {
    fn id(&self) -> u64 {
        self.id
    }
}

struct TestLoader {
    fail: bool,
}

impl EntityLoader for TestLoader {
    fn load_entity(&self, record: &PackedEntityRecord) -> Result<Arc<dyn Entity>> {
        if self.fail {
            return Err(EmberError::IslandDecode("forced failure".into()));
        }
        Ok(Arc::new(TestEntity { id: record.id }))
    }
}

#[derive(Default)]
struct TestWorld {
    /// (attached, entity id) event journal.
    events: Vec<(bool, u64)>,
    attached: std::collections::HashSet<u64>,
}

impl WorldBinding for TestWorld {
    fn attach_entity(&mut self, entity: &Arc<dyn Entity>) {
        assert!(self.attached.insert(entity.id()), "entity attached twice");
        self.events.push((true, entity.id()));
    }

    fn detach_entity(&mut self, entity: &Arc<dyn Entity>) {
        assert!(self.attached.remove(&entity.id()), "detach of unattached entity");
        self.events.push((false, entity.id()));
    }
}

fn island(center: Vec3, half: f32, ids: &[u64]) -> StreamingIsland {
    StreamingIsland::pack(
        StreamingBox::from_center_half_extent(center, half),
        false,
        ids.iter()
            .map(|&id| PackedEntityRecord {
                id,
                data: json!({ "kind": "prop" }),
            })
            .collect(),
    )
}

fn scene_of(roots: Vec<Arc<StreamingIsland>>) -> CompiledScene {
    compile_scene(&roots, 16.0)
}

fn step(
    engine: &mut StreamingEngine,
    world: &mut TestWorld,
    loader: &TestLoader,
    position: Vec3,
) {
    let mut task = engine.create_streaming_task(&[StreamingObserver::at(position)]);
    task.process(loader);
    engine.apply_streaming_task(world, task);
}

// ============================================================================
// Island pack / load
// ============================================================================

#[test]
fn island_roundtrip_restores_entities() {
    let island = island(Vec3::ZERO, 10.0, &[1, 2, 3]);
    assert_eq!(island.entity_count, 3);
    assert!(island.unpacked_size > 0);

    let loader = TestLoader { fail: false };
    let instance = island.load(&loader).expect("load succeeds");
    assert_eq!(instance.len(), 3);
    let ids: Vec<u64> = instance.entities().iter().map(|entity| entity.id()).collect();
    assert_eq!(ids, vec![1, 2, 3], "entity ids are stable across reloads");
}

#[test]
fn corrupted_island_fails_to_load() {
    let mut island = island(Vec3::ZERO, 10.0, &[1]);
    island.packed_data = vec![0xFF; 4];
    let loader = TestLoader { fail: false };
    assert!(island.load(&loader).is_none());
}

// ============================================================================
// Parent/child streaming (seed scenario 5)
// ============================================================================

/// World with root island R and child C, `C.streaming_box ⊂ R.streaming_box`.
/// The observer walks toward the center and back out.
#[test]
fn parent_child_walkthrough() {
    let mut root = island(Vec3::ZERO, 500.0, &[10, 11]);
    let child = island(Vec3::ZERO, 100.0, &[20]);
    assert!(root.streaming_box.contains_box(&child.streaming_box));
    root.attach_child(Arc::new(child));

    let scene = scene_of(vec![Arc::new(root)]);
    let loader = TestLoader { fail: false };
    let mut world = TestWorld::default();
    let mut engine = StreamingEngine::new();
    engine.bind_scene(&mut world, Some(&scene));
    assert_eq!(engine.island_count(), 2);

    // Enter R's box only: R attached, C not.
    step(&mut engine, &mut world, &loader, Vec3::new(400.0, 0.0, 0.0));
    assert!(engine.is_attached(0));
    assert!(!engine.is_attached(1));
    assert!(world.attached.contains(&10));
    assert!(!world.attached.contains(&20));

    // Enter C's box: both attached, parent first.
    step(&mut engine, &mut world, &loader, Vec3::new(50.0, 0.0, 0.0));
    assert!(engine.is_attached(0) && engine.is_attached(1));
    assert!(world.attached.contains(&20));

    // Exit C's box but stay in R's: child detached, parent remains.
    step(&mut engine, &mut world, &loader, Vec3::new(400.0, 0.0, 0.0));
    assert!(engine.is_attached(0));
    assert!(!engine.is_attached(1));
    assert!(!world.attached.contains(&20));
    assert!(world.attached.contains(&10));

    // Exit both: everything detached.
    step(&mut engine, &mut world, &loader, Vec3::new(5000.0, 0.0, 0.0));
    assert!(!engine.is_attached(0) && !engine.is_attached(1));
    assert!(world.attached.is_empty());
}

#[test]
fn parent_gate_orders_loads_within_one_pass() {
    // Jumping straight into C's box: the load phase walks parents before
    // children, so one pass attaches both, in order.
    let mut root = island(Vec3::ZERO, 500.0, &[1]);
    root.attach_child(Arc::new(island(Vec3::ZERO, 100.0, &[2])));
    let scene = scene_of(vec![Arc::new(root)]);

    let loader = TestLoader { fail: false };
    let mut world = TestWorld::default();
    let mut engine = StreamingEngine::new();
    engine.bind_scene(&mut world, Some(&scene));

    let mut task = engine.create_streaming_task(&[StreamingObserver::at(Vec3::ZERO)]);
    task.process(&loader);
    // Within one pass the parent is loaded first and the child sees the
    // updated mask, so both load in order.
    assert_eq!(task.loaded_islands(), &[0, 1]);
    engine.apply_streaming_task(&mut world, task);

    // Parent attach events precede child ones.
    let first_child_event = world.events.iter().position(|&(_, id)| id == 2).unwrap();
    let parent_event = world.events.iter().position(|&(_, id)| id == 1).unwrap();
    assert!(parent_event < first_child_event);
}

#[test]
fn unload_detaches_children_before_parents() {
    let mut root = island(Vec3::ZERO, 500.0, &[1]);
    root.attach_child(Arc::new(island(Vec3::ZERO, 100.0, &[2])));
    let scene = scene_of(vec![Arc::new(root)]);

    let loader = TestLoader { fail: false };
    let mut world = TestWorld::default();
    let mut engine = StreamingEngine::new();
    engine.bind_scene(&mut world, Some(&scene));

    step(&mut engine, &mut world, &loader, Vec3::ZERO);
    assert_eq!(world.attached.len(), 2);
    world.events.clear();

    step(&mut engine, &mut world, &loader, Vec3::splat(9999.0));
    let detach_child = world
        .events
        .iter()
        .position(|&(attached, id)| !attached && id == 2)
        .unwrap();
    let detach_parent = world
        .events
        .iter()
        .position(|&(attached, id)| !attached && id == 1)
        .unwrap();
    assert!(detach_child < detach_parent, "children detach before parents");
}

// ============================================================================
// Idempotence & misc
// ============================================================================

#[test]
fn unchanged_observers_are_idempotent() {
    let roots: Vec<Arc<StreamingIsland>> = (0..4)
        .map(|index| {
            Arc::new(island(
                Vec3::new(index as f32 * 300.0, 0.0, 0.0),
                80.0,
                &[index as u64 + 100],
            ))
        })
        .collect();
    let scene = scene_of(roots);

    let loader = TestLoader { fail: false };
    let mut world = TestWorld::default();
    let mut engine = StreamingEngine::new();
    engine.bind_scene(&mut world, Some(&scene));

    let position = Vec3::new(300.0, 10.0, 0.0);
    step(&mut engine, &mut world, &loader, position);
    let attached_before: Vec<u32> = engine.attached_islands().to_vec();
    let events_before = world.events.len();

    // Same observers again: no churn at all.
    step(&mut engine, &mut world, &loader, position);
    assert_eq!(engine.attached_islands(), attached_before.as_slice());
    assert_eq!(world.events.len(), events_before, "no attach/detach events");
}

#[test]
fn always_loaded_islands_ignore_range() {
    let mut always = island(Vec3::splat(10_000.0), 10.0, &[7]);
    always.always_loaded = true;
    let scene = scene_of(vec![Arc::new(always)]);

    let loader = TestLoader { fail: false };
    let mut world = TestWorld::default();
    let mut engine = StreamingEngine::new();
    engine.bind_scene(&mut world, Some(&scene));

    step(&mut engine, &mut world, &loader, Vec3::ZERO);
    assert!(engine.is_attached(0));
    assert!(world.attached.contains(&7));

    // And it never unloads.
    step(&mut engine, &mut world, &loader, Vec3::splat(-9999.0));
    assert!(engine.is_attached(0));
}

#[test]
fn decode_failure_leaves_island_unattached_and_retries() {
    let scene = scene_of(vec![Arc::new(island(Vec3::ZERO, 100.0, &[5]))]);
    let mut world = TestWorld::default();
    let mut engine = StreamingEngine::new();
    engine.bind_scene(&mut world, Some(&scene));

    let failing = TestLoader { fail: true };
    step(&mut engine, &mut world, &failing, Vec3::ZERO);
    assert!(!engine.is_attached(0));
    assert!(world.attached.is_empty());

    // Next visibility pass with a healthy loader succeeds.
    let loader = TestLoader { fail: false };
    step(&mut engine, &mut world, &loader, Vec3::ZERO);
    assert!(engine.is_attached(0));
}

#[test]
fn spawned_task_processes_on_the_pool() {
    let scene = scene_of(vec![Arc::new(island(Vec3::ZERO, 100.0, &[42]))]);
    let mut world = TestWorld::default();
    let mut engine = StreamingEngine::new();
    engine.bind_scene(&mut world, Some(&scene));

    let pool = ember::TaskPool::new(1);
    let loader: Arc<dyn EntityLoader> = Arc::new(TestLoader { fail: false });
    let pending = engine.spawn_streaming_task(
        &pool,
        &[StreamingObserver::at(Vec3::ZERO)],
        Arc::clone(&loader),
    );

    let task = pending.wait().expect("task completes");
    assert!(task.is_processed());
    engine.apply_streaming_task(&mut world, task);
    assert!(engine.is_attached(0));
    assert!(world.attached.contains(&42));
}

#[test]
fn cancelled_task_applies_as_noop() {
    let scene = scene_of(vec![Arc::new(island(Vec3::ZERO, 100.0, &[5]))]);
    let loader = TestLoader { fail: false };
    let mut world = TestWorld::default();
    let mut engine = StreamingEngine::new();
    engine.bind_scene(&mut world, Some(&scene));

    let mut task = engine.create_streaming_task(&[StreamingObserver::at(Vec3::ZERO)]);
    task.cancel_handle().request_cancel();
    task.process(&loader);
    engine.apply_streaming_task(&mut world, task);

    assert!(engine.attached_islands().is_empty());
    assert!(world.events.is_empty(), "cancelled task must not touch the world");
}

#[test]
fn unbind_detaches_everything_in_reverse() {
    let mut root = island(Vec3::ZERO, 500.0, &[1]);
    root.attach_child(Arc::new(island(Vec3::ZERO, 100.0, &[2])));
    let scene = scene_of(vec![Arc::new(root)]);

    let loader = TestLoader { fail: false };
    let mut world = TestWorld::default();
    let mut engine = StreamingEngine::new();
    engine.bind_scene(&mut world, Some(&scene));
    step(&mut engine, &mut world, &loader, Vec3::ZERO);
    assert_eq!(world.attached.len(), 2);

    engine.unbind_entities(&mut world);
    assert!(world.attached.is_empty());
    assert!(engine.attached_islands().is_empty());
}

// ============================================================================
// Persisted formats & bake
// ============================================================================

#[test]
fn sector_container_roundtrip() {
    let sector = CompiledSector {
        streaming_box: StreamingBox::from_center_half_extent(Vec3::ZERO, 128.0),
        islands: vec![Arc::new(island(Vec3::ZERO, 50.0, &[1, 2]))],
    };
    let bytes = sector.to_bytes();
    assert_eq!(&bytes[0..4], b"EMSC");

    let restored = CompiledSector::from_bytes(&bytes).unwrap();
    assert_eq!(restored.islands.len(), 1);
    assert_eq!(restored.islands[0].entity_count, 2);

    // Restored islands still decode.
    let loader = TestLoader { fail: false };
    assert!(restored.islands[0].load(&loader).is_some());
}

#[test]
fn bad_magic_is_rejected() {
    assert!(matches!(
        CompiledSector::from_bytes(b"NOPE\0\0\0\0{}"),
        Err(EmberError::BadContainerHeader { .. })
    ));
}

#[test]
fn scene_container_roundtrip_resolves_sectors() {
    let roots: Vec<Arc<StreamingIsland>> = (0..3)
        .map(|index| Arc::new(island(Vec3::new(index as f32 * 1000.0, 0.0, 0.0), 40.0, &[index])))
        .collect();
    let scene = compile_scene(&roots, 16.0);
    assert!(!scene.cells.is_empty());

    // Persist sectors by reference name, then reload the scene.
    let stored: Arc<Mutex<std::collections::HashMap<String, Vec<u8>>>> = Arc::default();
    for cell in &scene.cells {
        stored
            .lock()
            .unwrap()
            .insert(cell.sector_ref.clone(), cell.sector.to_bytes());
    }

    let scene_bytes = scene.to_bytes();
    assert_eq!(&scene_bytes[0..4], b"EMCS");

    let reloaded = CompiledScene::from_bytes(&scene_bytes, |name| {
        let stored = stored.lock().unwrap();
        let bytes = stored
            .get(name)
            .ok_or_else(|| EmberError::IslandDecode(format!("missing sector {name}")))?;
        Ok(Arc::new(CompiledSector::from_bytes(bytes)?))
    })
    .unwrap();

    assert_eq!(reloaded.cells.len(), scene.cells.len());
    assert_eq!(reloaded.root_islands().count(), 3);
}

#[test]
fn bake_separates_levels_by_extent() {
    let small = Arc::new(island(Vec3::new(8.0, 8.0, 0.0), 4.0, &[1]));
    let large = Arc::new(island(Vec3::new(8.0, 8.0, 0.0), 400.0, &[2]));
    let scene = compile_scene(&[small, large], 16.0);
    // Same center, wildly different extents: they land in different cells.
    assert_eq!(scene.cells.len(), 2);
}
