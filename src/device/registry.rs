//! Object registry
//!
//! Central table mapping opaque handles to live device objects. Fixed slot
//! capacity, free-index stack, and a device-wide generation counter that
//! stamps every registration; a resolve with a stale generation yields
//! `None`, never a different object.
//!
//! Deletion is two-phase. `mark_for_deletion` flips an idempotent per-slot
//! flag and hands back a deletion ticket (the handle itself) exactly once;
//! the caller parks the ticket in the current frame record. Resolves keep
//! succeeding until the device worker finalizes the frame and calls
//! `unregister`, which clears the slot and recycles the index.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::handle::{ObjectId, ObjectKind};
use crate::device::object::DeviceObject;
use crate::errors::{EmberError, Result};

struct Slot {
    object: Option<Arc<DeviceObject>>,
    id: ObjectId,
    marked: bool,
}

struct RegistryInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    generation: u32,
    live: u32,
}

pub struct ObjectRegistry {
    inner: Mutex<RegistryInner>,
    capacity: u32,
}

impl ObjectRegistry {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1024);
        log::info!("Creating object registry with {capacity} slots");

        let mut slots = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            slots.push(Slot {
                object: None,
                id: ObjectId::NONE,
                marked: false,
            });
        }

        // Descending so low indices hand out first.
        let free = (0..capacity).rev().collect();

        Self {
            inner: Mutex::new(RegistryInner {
                slots,
                free,
                generation: 0,
                live: 0,
            }),
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub fn live_count(&self) -> u32 {
        self.inner.lock().live
    }

    /// Register an object and mint its handle.
    pub fn register(&self, object: Arc<DeviceObject>) -> Result<ObjectId> {
        let kind = object.kind();
        debug_assert_ne!(kind, ObjectKind::Invalid);

        let mut inner = self.inner.lock();
        let Some(index) = inner.free.pop() else {
            return Err(EmberError::RegistryFull {
                capacity: self.capacity,
            });
        };

        inner.generation += 1;
        inner.live += 1;
        let id = ObjectId::pack(index, inner.generation, kind);

        let slot = &mut inner.slots[index as usize];
        debug_assert!(slot.object.is_none());
        debug_assert!(!slot.marked);
        slot.object = Some(object);
        slot.id = id;
        slot.marked = false;

        log::trace!("Registered {id}");
        Ok(id)
    }

    /// Resolve a handle to its live object. Kind and generation must match.
    #[must_use]
    pub fn resolve(&self, id: ObjectId) -> Option<Arc<DeviceObject>> {
        if id.is_none() || id.index() >= self.capacity {
            return None;
        }
        let inner = self.inner.lock();
        let slot = &inner.slots[id.index() as usize];
        if slot.id != id {
            return None;
        }
        let object = slot.object.as_ref()?;
        debug_assert_eq!(object.kind(), id.kind());
        Some(Arc::clone(object))
    }

    /// Resolve expecting a specific kind; mismatches yield `None`.
    #[must_use]
    pub fn resolve_kind(&self, id: ObjectId, kind: ObjectKind) -> Option<Arc<DeviceObject>> {
        if id.kind() != kind {
            return None;
        }
        self.resolve(id)
    }

    /// Run `f` against the object while holding the registry lock,
    /// preventing a concurrent finalize for the duration. Fails on stale
    /// handles and on objects already marked for deletion.
    pub fn run_with<R>(&self, id: ObjectId, f: impl FnOnce(&DeviceObject) -> R) -> Option<R> {
        if id.is_none() || id.index() >= self.capacity {
            return None;
        }
        let inner = self.inner.lock();
        let slot = &inner.slots[id.index() as usize];
        if slot.id != id || slot.marked {
            return None;
        }
        slot.object.as_deref().map(f)
    }

    /// Idempotently mark an object for deletion. Returns the deletion
    /// ticket on the first marking only; the caller must park it in the
    /// current frame record.
    #[must_use]
    pub fn mark_for_deletion(&self, id: ObjectId) -> Option<ObjectId> {
        if id.is_none() || id.index() >= self.capacity {
            return None;
        }
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[id.index() as usize];
        if slot.id != id || slot.object.is_none() || slot.marked {
            return None;
        }
        slot.marked = true;
        log::trace!("Marked {id} for deletion");
        Some(id)
    }

    /// Clear a previously marked slot and recycle its index. Returns the
    /// object for the caller (the device worker) to drop.
    pub fn unregister(&self, ticket: ObjectId) -> Option<Arc<DeviceObject>> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[ticket.index() as usize];
        if slot.id != ticket {
            debug_assert!(false, "unregister with mismatched ticket {ticket}");
            return None;
        }
        debug_assert!(slot.marked, "unregister of unmarked {ticket}");

        let object = slot.object.take();
        slot.id = ObjectId::NONE;
        slot.marked = false;
        inner.free.push(ticket.index());
        if object.is_some() {
            inner.live -= 1;
        }
        log::trace!("Unregistered {ticket}");
        object
    }

    /// Mark every still-live object for deletion (device teardown) and
    /// return the tickets.
    #[must_use]
    pub fn drain_live(&self) -> Vec<ObjectId> {
        let mut inner = self.inner.lock();
        let mut tickets = Vec::new();
        for slot in &mut inner.slots {
            if slot.object.is_some() && !slot.marked {
                slot.marked = true;
                tickets.push(slot.id);
            }
        }
        if !tickets.is_empty() {
            log::warn!("{} live objects at teardown, deleting", tickets.len());
        }
        tickets
    }
}

// ============================================================================
// Proxy
// ============================================================================

type ReleaseHook = Arc<dyn Fn(ObjectId) + Send + Sync>;

struct ProxyState {
    registry: Arc<ObjectRegistry>,
    release: ReleaseHook,
}

/// Handle held by producer-side wrappers. Forwards deletions and guarded
/// accesses to the registry, and gracefully no-ops once the device has been
/// torn down.
pub struct RegistryProxy {
    state: Mutex<Option<ProxyState>>,
}

impl RegistryProxy {
    #[must_use]
    pub fn new(registry: Arc<ObjectRegistry>, release: ReleaseHook) -> Self {
        Self {
            state: Mutex::new(Some(ProxyState { registry, release })),
        }
    }

    /// Sever the proxy from the device. Subsequent calls no-op.
    pub fn disconnect(&self) {
        *self.state.lock() = None;
    }

    /// Request deferred deletion of `id`, if still connected.
    pub fn release_to_device(&self, id: ObjectId) {
        let state = self.state.lock();
        if let Some(state) = state.as_ref() {
            (state.release)(id);
        }
    }

    /// Guarded short access to a live object, if still connected.
    pub fn run_with<R>(&self, id: ObjectId, f: impl FnOnce(&DeviceObject) -> R) -> Option<R> {
        let state = self.state.lock();
        state.as_ref().and_then(|state| state.registry.run_with(id, f))
    }
}
