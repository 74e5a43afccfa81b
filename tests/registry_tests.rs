//! Object Registry Tests
//!
//! Tests for:
//! - Handle packing and kind guarding
//! - Resolve returning the registered object, never a different one
//! - Two-phase deletion: resolvable while marked, gone after unregister
//! - Generation monotonicity across slot reuse
//! - Proxy disconnect behavior

use std::sync::Arc;

use ember::device::handle::{ObjectId, ObjectKind};
use ember::device::object::{BufferObject, BufferSetup, BufferUsage, DeviceObject};
use ember::device::registry::{ObjectRegistry, RegistryProxy};

fn test_buffer(size: u64) -> Arc<DeviceObject> {
    Arc::new(DeviceObject::Buffer(BufferObject::new(BufferSetup {
        label: "test".into(),
        size,
        usage: BufferUsage::STORAGE,
    })))
}

// ============================================================================
// Register & Resolve
// ============================================================================

#[test]
fn resolve_returns_registered_object() {
    let registry = ObjectRegistry::new(1024);
    let object = test_buffer(64);
    let id = registry.register(Arc::clone(&object)).unwrap();

    assert_eq!(id.kind(), ObjectKind::Buffer);
    let resolved = registry.resolve(id).unwrap();
    assert!(Arc::ptr_eq(&resolved, &object));
}

#[test]
fn resolve_checks_kind() {
    let registry = ObjectRegistry::new(1024);
    let id = registry.register(test_buffer(64)).unwrap();

    assert!(registry.resolve_kind(id, ObjectKind::Buffer).is_some());
    assert!(registry.resolve_kind(id, ObjectKind::Image).is_none());
}

#[test]
fn none_handle_never_resolves() {
    let registry = ObjectRegistry::new(1024);
    assert!(registry.resolve(ObjectId::NONE).is_none());
}

#[test]
fn registry_full_is_an_error() {
    // Capacity floors at 1024.
    let registry = ObjectRegistry::new(0);
    let mut last = None;
    for _ in 0..1024 {
        last = Some(registry.register(test_buffer(4)).unwrap());
    }
    assert!(registry.register(test_buffer(4)).is_err());
    // Freeing one slot makes registration possible again.
    let ticket = registry.mark_for_deletion(last.unwrap()).unwrap();
    drop(registry.unregister(ticket));
    assert!(registry.register(test_buffer(4)).is_ok());
}

// ============================================================================
// Two-phase deletion
// ============================================================================

#[test]
fn marked_object_still_resolves_until_unregistered() {
    let registry = ObjectRegistry::new(1024);
    let object = test_buffer(64);
    let id = registry.register(Arc::clone(&object)).unwrap();

    let ticket = registry.mark_for_deletion(id).unwrap();
    assert_eq!(ticket, id);

    // Deferred deletion: resolves keep working while the frame is open.
    let resolved = registry.resolve(id).unwrap();
    assert!(Arc::ptr_eq(&resolved, &object));

    // Second marking is idempotent and yields no ticket.
    assert!(registry.mark_for_deletion(id).is_none());

    drop(registry.unregister(ticket));
    assert!(registry.resolve(id).is_none());
}

#[test]
fn run_with_rejects_marked_objects() {
    let registry = ObjectRegistry::new(1024);
    let id = registry.register(test_buffer(64)).unwrap();

    assert!(registry.run_with(id, |object| object.kind()).is_some());
    let _ticket = registry.mark_for_deletion(id).unwrap();
    assert!(registry.run_with(id, |object| object.kind()).is_none());
}

// ============================================================================
// Generations
// ============================================================================

#[test]
fn reused_slot_gets_a_new_generation() {
    let registry = ObjectRegistry::new(1024);

    let first = registry.register(test_buffer(64)).unwrap();
    let ticket = registry.mark_for_deletion(first).unwrap();
    drop(registry.unregister(ticket));

    // Low indices hand out first, so the slot is recycled immediately.
    let second = registry.register(test_buffer(64)).unwrap();
    assert_eq!(first.index(), second.index(), "slot must be recycled");
    assert_ne!(first.generation(), second.generation());

    // The stale handle resolves to nothing, never to the new object.
    assert!(registry.resolve(first).is_none());
    assert!(registry.resolve(second).is_some());
}

#[test]
fn generations_are_monotonic_across_many_cycles() {
    let registry = ObjectRegistry::new(1024);
    let mut seen = std::collections::HashSet::new();
    for _ in 0..100 {
        let id = registry.register(test_buffer(4)).unwrap();
        assert!(seen.insert(id.raw()), "handle reused across generations");
        let ticket = registry.mark_for_deletion(id).unwrap();
        drop(registry.unregister(ticket));
    }
}

// ============================================================================
// Teardown & proxy
// ============================================================================

#[test]
fn drain_live_marks_everything() {
    let registry = ObjectRegistry::new(1024);
    let a = registry.register(test_buffer(4)).unwrap();
    let b = registry.register(test_buffer(4)).unwrap();
    let marked = registry.mark_for_deletion(a).unwrap();

    let tickets = registry.drain_live();
    assert_eq!(tickets, vec![b], "already-marked objects are not re-ticketed");

    drop(registry.unregister(marked));
    for ticket in tickets {
        drop(registry.unregister(ticket));
    }
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn proxy_noops_after_disconnect() {
    let registry = Arc::new(ObjectRegistry::new(1024));
    let released = Arc::new(std::sync::Mutex::new(Vec::new()));

    let proxy = {
        let registry = Arc::clone(&registry);
        let released = Arc::clone(&released);
        RegistryProxy::new(
            Arc::clone(&registry),
            Arc::new(move |id| {
                if registry.mark_for_deletion(id).is_some() {
                    released.lock().unwrap().push(id);
                }
            }),
        )
    };

    let id = registry.register(test_buffer(4)).unwrap();
    assert!(proxy.run_with(id, |object| object.kind()).is_some());

    proxy.disconnect();
    proxy.release_to_device(id);
    assert!(proxy.run_with(id, |object| object.kind()).is_none());
    assert!(released.lock().unwrap().is_empty(), "disconnected proxy must no-op");
}
