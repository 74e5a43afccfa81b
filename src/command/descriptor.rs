//! Descriptor tables
//!
//! A descriptor table is the producer-visible bundle of resource references
//! for one logical bind point. Its layout (names + kinds) is content-hashed;
//! the device's object cache flattens each distinct layout into a binding
//! map with platform slots assigned per resource class. The slot numbering
//! must match what the shader compiler baked into the blobs, so the
//! numbering rule lives here, next to the wire types.

use std::sync::Arc;

use xxhash_rust::xxh3::Xxh3;

use crate::device::handle::ObjectId;
use crate::device::predefined::PredefinedSampler;

/// Resource class of one descriptor binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Uniform/constant buffer view.
    ConstantBuffer,
    /// Storage buffer view (typed or untyped).
    StorageBuffer,
    /// Sampled texture.
    Texture,
    /// Storage image.
    StorageImage,
    /// Standalone sampler.
    Sampler,
}

/// One binding declaration within a descriptor layout.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBindingDesc {
    pub name: String,
    pub kind: DescriptorKind,
    pub writable: bool,
    /// Declared format for storage images / typed buffer views.
    pub format: Option<wgpu::TextureFormat>,
}

/// Ordered layout of a descriptor table; identity is its content hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorLayoutDesc {
    pub name: String,
    pub bindings: Vec<DescriptorBindingDesc>,
}

impl DescriptorLayoutDesc {
    /// Stable content hash over the binding structure. The layout name is
    /// part of the bind-point identity, not of the structure.
    #[must_use]
    pub fn structure_hash(&self) -> u64 {
        let mut h = Xxh3::new();
        for binding in &self.bindings {
            h.update(binding.name.as_bytes());
            h.update(&[binding.kind as u8, u8::from(binding.writable)]);
            let format_tag = binding.format.map_or(0u32, |f| {
                let mut fh = Xxh3::new();
                fh.update(format!("{f:?}").as_bytes());
                fh.digest() as u32
            });
            h.update(&format_tag.to_le_bytes());
        }
        h.digest()
    }
}

/// Sampler selector carried inside texture/sampler descriptor entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplerKey {
    /// One of the device's fixed predefined samplers.
    Predefined(PredefinedSampler),
    /// A sampler object created by the producer.
    Object(ObjectId),
}

impl Default for SamplerKey {
    fn default() -> Self {
        Self::Predefined(PredefinedSampler::WrapTrilinear)
    }
}

/// A filled descriptor slot, matched positionally against the layout.
#[derive(Clone, Debug)]
pub enum DescriptorEntry {
    /// Inline constants recorded into the command buffer; resolved against
    /// the per-frame constants temp buffer during replay.
    Constants {
        /// Index of the constants upload within the owning command buffer.
        upload: u32,
        /// Byte offset inside that upload.
        offset: u32,
        /// Bound window size in bytes.
        size: u32,
    },
    /// Directly bound constant-buffer view.
    ConstantView { view: ObjectId },
    /// Storage buffer view (typed or untyped object).
    BufferView { view: ObjectId },
    /// Sampled texture with its sampler selector.
    Texture { view: ObjectId, sampler: SamplerKey },
    /// One of the device's predefined images.
    PredefinedTexture {
        image: crate::device::predefined::PredefinedImage,
        sampler: SamplerKey,
    },
    /// Writable storage image.
    StorageImage { view: ObjectId },
    /// Standalone sampler slot.
    Sampler { sampler: SamplerKey },
}

impl DescriptorEntry {
    /// The resource class this entry can legally fill.
    #[must_use]
    pub fn kind(&self) -> DescriptorKind {
        match self {
            Self::Constants { .. } | Self::ConstantView { .. } => DescriptorKind::ConstantBuffer,
            Self::BufferView { .. } => DescriptorKind::StorageBuffer,
            Self::Texture { .. } | Self::PredefinedTexture { .. } => DescriptorKind::Texture,
            Self::StorageImage { .. } => DescriptorKind::StorageImage,
            Self::Sampler { .. } => DescriptorKind::Sampler,
        }
    }
}

/// A bound descriptor table: a layout plus one entry per binding.
#[derive(Clone, Debug)]
pub struct DescriptorTable {
    pub layout: Arc<DescriptorLayoutDesc>,
    pub entries: Vec<DescriptorEntry>,
}

// ============================================================================
// Platform slot numbering — contract with compiled shader blobs
// ============================================================================

/// Base platform binding index per resource class. Within a class, slots
/// number from 0 in layout declaration order; the platform binding index is
/// `base + slot`. Shader blobs bake the same affine encoding.
#[must_use]
pub fn slot_base(kind: DescriptorKind) -> u32 {
    match kind {
        DescriptorKind::ConstantBuffer => 0,
        DescriptorKind::StorageBuffer => 100,
        DescriptorKind::Texture => 200,
        DescriptorKind::StorageImage => 300,
        DescriptorKind::Sampler => 400,
    }
}

/// Base binding index of the implicit per-texture samplers: every texture
/// slot `s` owns a companion sampler binding at `TEXTURE_SAMPLER_BASE + s`,
/// selected by the sampler key carried in the texture descriptor entry.
pub const TEXTURE_SAMPLER_BASE: u32 = 500;

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(bindings: &[(&str, DescriptorKind)]) -> DescriptorLayoutDesc {
        DescriptorLayoutDesc {
            name: "Test".into(),
            bindings: bindings
                .iter()
                .map(|(name, kind)| DescriptorBindingDesc {
                    name: (*name).to_string(),
                    kind: *kind,
                    writable: false,
                    format: None,
                })
                .collect(),
        }
    }

    #[test]
    fn structure_hash_ignores_layout_name() {
        let mut a = layout(&[("camera", DescriptorKind::ConstantBuffer)]);
        let mut b = layout(&[("camera", DescriptorKind::ConstantBuffer)]);
        a.name = "A".into();
        b.name = "B".into();
        assert_eq!(a.structure_hash(), b.structure_hash());
    }

    #[test]
    fn structure_hash_sees_binding_changes() {
        let a = layout(&[("camera", DescriptorKind::ConstantBuffer)]);
        let b = layout(&[("camera", DescriptorKind::StorageBuffer)]);
        let c = layout(&[("lights", DescriptorKind::ConstantBuffer)]);
        assert_ne!(a.structure_hash(), b.structure_hash());
        assert_ne!(a.structure_hash(), c.structure_hash());
    }
}
