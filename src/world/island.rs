//! Streaming islands
//!
//! An island carries its entities as one LZ4-compressed blob of serialized
//! records, decoded through the embedder's [`EntityLoader`] when the island
//! streams in. Children hang off their parent island and are only ever
//! loaded while the parent is attached.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{EmberError, Result};
use crate::world::{StreamingBox, WorldBinding};

/// A world entity as streaming sees it. The update/tick side lives outside
/// this system; streaming only needs identity and the stream-in/out hooks.
pub trait Entity: Send + Sync {
    /// Stable id within the island; survives reloads so cross-island
    /// references stay valid.
    fn id(&self) -> u64;
    fn on_stream_in(&self) {}
    fn on_stream_out(&self) {}
}

/// One serialized entity inside an island blob. The `data` payload is
/// opaque to streaming; the loader resolves external resource references.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackedEntityRecord {
    pub id: u64,
    pub data: serde_json::Value,
}

/// Decodes packed entity records into live entities. Supplied by the
/// embedder; the resource factory behind it is outside this system.
pub trait EntityLoader: Send + Sync {
    fn load_entity(&self, record: &PackedEntityRecord) -> Result<Arc<dyn Entity>>;
}

#[derive(Serialize, Deserialize)]
struct PackedEntities {
    entities: Vec<PackedEntityRecord>,
}

/// The smallest unit of streamable scene content.
pub struct StreamingIsland {
    pub always_loaded: bool,
    pub streaming_box: StreamingBox,
    pub entity_count: u32,
    /// LZ4 block-compressed [`PackedEntities`] payload.
    pub packed_data: Vec<u8>,
    pub unpacked_size: u32,
    pub children: Vec<Arc<StreamingIsland>>,
}

impl StreamingIsland {
    /// Pack entity records into a compressed island.
    #[must_use]
    pub fn pack(
        streaming_box: StreamingBox,
        always_loaded: bool,
        entities: Vec<PackedEntityRecord>,
    ) -> Self {
        let payload = PackedEntities { entities };
        let bytes = serde_json::to_vec(&payload).expect("packed entities always serialize");
        let packed_data = lz4_flex::compress(&bytes);
        Self {
            always_loaded,
            streaming_box,
            entity_count: payload.entities.len() as u32,
            packed_data,
            unpacked_size: bytes.len() as u32,
            children: Vec::new(),
        }
    }

    pub fn attach_child(&mut self, child: Arc<StreamingIsland>) {
        self.children.push(child);
    }

    /// Decompress and decode the entity blob. Returns `None` on any
    /// failure; the island stays unattached and is retried on the next
    /// visibility pass.
    #[must_use]
    pub fn load(&self, loader: &dyn EntityLoader) -> Option<Arc<IslandInstance>> {
        match self.decode(loader) {
            Ok(instance) => Some(Arc::new(instance)),
            Err(err) => {
                log::warn!("Island load failed: {err}");
                None
            }
        }
    }

    fn decode(&self, loader: &dyn EntityLoader) -> Result<IslandInstance> {
        let bytes = lz4_flex::decompress(&self.packed_data, self.unpacked_size as usize)
            .map_err(|err| EmberError::IslandDecompress(err.to_string()))?;
        let payload: PackedEntities = serde_json::from_slice(&bytes)
            .map_err(|err| EmberError::IslandDecode(err.to_string()))?;

        let mut entities = Vec::with_capacity(payload.entities.len());
        for record in &payload.entities {
            entities.push(loader.load_entity(record)?);
        }
        Ok(IslandInstance { entities })
    }
}

/// Materialized entities of one loaded island.
pub struct IslandInstance {
    entities: Vec<Arc<dyn Entity>>,
}

impl IslandInstance {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[must_use]
    pub fn entities(&self) -> &[Arc<dyn Entity>] {
        &self.entities
    }

    /// Attach every entity to the world, then fire the stream-in hooks.
    pub fn attach(&self, world: &mut dyn WorldBinding) {
        for entity in &self.entities {
            world.attach_entity(entity);
        }
        for entity in &self.entities {
            entity.on_stream_in();
        }
    }

    /// Fire the stream-out hooks, then detach every entity.
    pub fn detach(&self, world: &mut dyn WorldBinding) {
        for entity in &self.entities {
            entity.on_stream_out();
        }
        for entity in &self.entities {
            world.detach_entity(entity);
        }
    }
}
