//! World streaming
//!
//! Grid-partitioned streaming of precompiled islands around moving
//! observers. An island is the smallest streamable unit: a group of
//! entities packed into one compressed blob, attached to and detached from
//! the world as a whole. The engine produces streaming tasks on background
//! workers; the world is only ever mutated in the single task-application
//! step on the main thread.

pub mod grid;
pub mod island;
pub mod scene_format;
pub mod streaming;

use std::sync::Arc;

use glam::Vec3;

pub use grid::StreamingGrid;
pub use island::{Entity, EntityLoader, IslandInstance, PackedEntityRecord, StreamingIsland};
pub use scene_format::{compile_scene, CompiledScene, CompiledSector, StreamingCell};
pub use streaming::{PendingStreamingTask, StreamingEngine, StreamingObserver, StreamingTask};

/// Axis-aligned streaming bounds.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl StreamingBox {
    #[must_use]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub fn from_center_half_extent(center: Vec3, half_extent: f32) -> Self {
        Self {
            min: center - Vec3::splat(half_extent),
            max: center + Vec3::splat(half_extent),
        }
    }

    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[must_use]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Largest edge of the box.
    #[must_use]
    pub fn max_extent(&self) -> f32 {
        self.size().max_element()
    }

    #[must_use]
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    #[must_use]
    pub fn contains_box(&self, other: &StreamingBox) -> bool {
        self.contains_point(other.min) && self.contains_point(other.max)
    }

    /// Grow the box around every point of `other`.
    #[must_use]
    pub fn union(&self, other: &StreamingBox) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Enforce a minimum streaming range: small boxes stream in too late
    /// for fast observers, so anything below `min_size` is replaced by a
    /// cube of that size around its center.
    #[must_use]
    pub fn expanded_to_min_size(&self, min_size: f32) -> Self {
        if self.size().length() < min_size {
            Self::from_center_half_extent(self.center(), min_size)
        } else {
            *self
        }
    }
}

/// The scene-graph side of streaming: the engine only ever attaches and
/// detaches whole entities, on the main thread.
pub trait WorldBinding {
    fn attach_entity(&mut self, entity: &Arc<dyn Entity>);
    fn detach_entity(&mut self, entity: &Arc<dyn Entity>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_containment() {
        let outer = StreamingBox::from_center_half_extent(Vec3::ZERO, 10.0);
        let inner = StreamingBox::from_center_half_extent(Vec3::splat(2.0), 1.0);
        assert!(outer.contains_box(&inner));
        assert!(!inner.contains_box(&outer));
        assert!(outer.contains_point(Vec3::new(9.9, -9.9, 0.0)));
        assert!(!outer.contains_point(Vec3::new(10.1, 0.0, 0.0)));
    }

    #[test]
    fn min_size_expansion() {
        let tiny = StreamingBox::from_center_half_extent(Vec3::splat(5.0), 0.5);
        let grown = tiny.expanded_to_min_size(70.0);
        assert!((grown.max_extent() - 140.0).abs() < 1e-3);
        assert_eq!(grown.center(), tiny.center());

        let big = StreamingBox::from_center_half_extent(Vec3::ZERO, 100.0);
        assert_eq!(big.expanded_to_min_size(70.0), big);
    }
}
