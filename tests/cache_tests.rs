//! Object Cache Tests (headless parts)
//!
//! Tests for:
//! - Stable bind point index allocation per name/layout structure
//! - Vertex layout content addressing and hit counting
//! - Descriptor layout hashing driving shared binding maps
//!
//! The GPU-coupled cache paths (shader stages, binding map layouts,
//! pipelines, samplers) are exercised by `device_gpu_tests`.

use std::sync::Arc;

use ember::command::descriptor::{DescriptorBindingDesc, DescriptorKind, DescriptorLayoutDesc};
use ember::device::cache::ObjectCache;
use ember::device::object::{VertexAttributeDesc, VertexLayoutDesc, VertexStreamDesc};

fn layout(name: &str, bindings: &[(&str, DescriptorKind)]) -> Arc<DescriptorLayoutDesc> {
    Arc::new(DescriptorLayoutDesc {
        name: name.to_string(),
        bindings: bindings
            .iter()
            .map(|(binding_name, kind)| DescriptorBindingDesc {
                name: (*binding_name).to_string(),
                kind: *kind,
                writable: false,
                format: None,
            })
            .collect(),
    })
}

fn vertex_layout(streams: &[(&str, u32)]) -> VertexLayoutDesc {
    VertexLayoutDesc {
        streams: streams
            .iter()
            .map(|(name, stride)| VertexStreamDesc {
                name: (*name).to_string(),
                stride: *stride,
                instanced: false,
                attributes: vec![VertexAttributeDesc {
                    location: 0,
                    format: wgpu::VertexFormat::Float32x3,
                    offset: 0,
                }],
            })
            .collect(),
    }
}

// ============================================================================
// Bind point indices
// ============================================================================

#[test]
fn vertex_bindpoint_indices_are_stable_per_name() {
    let cache = ObjectCache::new();
    let position = cache.vertex_bindpoint_index("position");
    let normal = cache.vertex_bindpoint_index("normal");
    assert_ne!(position, normal);
    assert_eq!(cache.vertex_bindpoint_index("position"), position);
    assert_eq!(cache.vertex_bindpoint_index("normal"), normal);
}

/// Seed scenario: two tables with the same layout used by two different
/// programs share one bind point index; a structurally different layout
/// gets another.
#[test]
fn descriptor_bindpoint_shared_by_structure() {
    let cache = ObjectCache::new();

    let camera_a = layout("Camera", &[("view", DescriptorKind::ConstantBuffer)]);
    let camera_b = layout("Camera", &[("view", DescriptorKind::ConstantBuffer)]);
    let other = layout(
        "Camera",
        &[
            ("view", DescriptorKind::ConstantBuffer),
            ("lights", DescriptorKind::StorageBuffer),
        ],
    );

    let index_a = cache.descriptor_bindpoint_index(&camera_a);
    let index_b = cache.descriptor_bindpoint_index(&camera_b);
    let index_other = cache.descriptor_bindpoint_index(&other);

    assert_eq!(index_a, index_b);
    assert_ne!(index_a, index_other);
}

// ============================================================================
// Vertex layouts
// ============================================================================

#[test]
fn vertex_layouts_are_content_addressed() {
    let cache = ObjectCache::new();

    let first = cache.vertex_layout(&vertex_layout(&[("geometry", 12)]));
    let second = cache.vertex_layout(&vertex_layout(&[("geometry", 12)]));
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.hash, second.hash);

    let different = cache.vertex_layout(&vertex_layout(&[("geometry", 16)]));
    assert_ne!(first.hash, different.hash);
}

#[test]
fn warm_cache_hits_every_time() {
    let cache = ObjectCache::new();
    let desc = vertex_layout(&[("geometry", 12), ("instance", 64)]);

    let _ = cache.vertex_layout(&desc);
    let misses_after_warmup = cache.miss_count();

    for _ in 0..16 {
        let _ = cache.vertex_layout(&desc);
    }
    assert_eq!(cache.miss_count(), misses_after_warmup, "warm cache never misses");
    assert!(cache.hit_count() >= 16);
}
