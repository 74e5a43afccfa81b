//! Object cache
//!
//! Content-addressed caches for every derived GPU object: bind point
//! indices, vertex layouts, compiled shader stages, linked bundles,
//! flattened descriptor binding maps, samplers, and pipelines. Entries are
//! built once on the device worker and live for the device lifetime; a
//! failed shader build poisons its entry so draws using it are skipped
//! rather than retried every frame.
//!
//! Each map carries its own lock; writes are one-shot.

use std::borrow::Cow;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::command::descriptor::{
    slot_base, DescriptorKind, DescriptorLayoutDesc, TEXTURE_SAMPLER_BASE,
};
use crate::device::gpu::GpuContext;
use crate::device::object::{
    SamplerSetup, ShaderBundleObject, ShaderStageBlob, ShaderStageKind, VertexLayoutDesc,
};

// ============================================================================
// Cached entry types
// ============================================================================

/// A compiled shader stage.
pub struct ShaderStage {
    pub stage: ShaderStageKind,
    pub module: wgpu::ShaderModule,
}

/// Cached vertex layout with the platform-facing stream descriptions.
pub struct VertexLayoutEntry {
    pub hash: u64,
    pub desc: VertexLayoutDesc,
}

impl VertexLayoutEntry {
    /// Build the wgpu vertex buffer layouts. Attributes are borrowed from
    /// `storage`, which the caller keeps alive for the pipeline build.
    #[must_use]
    pub fn wgpu_layouts<'a>(
        &self,
        storage: &'a mut Vec<Vec<wgpu::VertexAttribute>>,
    ) -> Vec<wgpu::VertexBufferLayout<'a>> {
        storage.clear();
        for stream in &self.desc.streams {
            storage.push(
                stream
                    .attributes
                    .iter()
                    .map(|attribute| wgpu::VertexAttribute {
                        format: attribute.format,
                        offset: u64::from(attribute.offset),
                        shader_location: attribute.location,
                    })
                    .collect(),
            );
        }
        self.desc
            .streams
            .iter()
            .zip(storage.iter())
            .map(|(stream, attributes)| wgpu::VertexBufferLayout {
                array_stride: u64::from(stream.stride),
                step_mode: if stream.instanced {
                    wgpu::VertexStepMode::Instance
                } else {
                    wgpu::VertexStepMode::Vertex
                },
                attributes,
            })
            .collect()
    }
}

/// One flattened binding of a descriptor map.
#[derive(Clone, Debug)]
pub struct BindingMapEntry {
    /// Position of the source entry within its descriptor table.
    pub element: u32,
    pub kind: DescriptorKind,
    /// Slot within the resource class, numbered from 0 in declaration
    /// order. Must match the numbering baked into shader blobs.
    pub slot: u32,
    /// Platform binding index (`slot_base(kind) + slot`).
    pub binding: u32,
    pub writable: bool,
    pub format: Option<wgpu::TextureFormat>,
    /// Companion sampler of a texture slot, filled from the sampler key of
    /// the texture entry at `element`.
    pub implicit_sampler: bool,
}

/// Flattened descriptor binding map for one layout.
pub struct BindingMap {
    pub structure_hash: u64,
    pub entries: Vec<BindingMapEntry>,
    pub layout: wgpu::BindGroupLayout,
}

/// A linked shader bundle, ready for pipeline builds.
pub struct ShaderBundle {
    pub bundle_hash: u64,
    pub stages: Vec<Arc<ShaderStage>>,
    pub vertex_layout: Option<Arc<VertexLayoutEntry>>,
    /// Binding maps of the bundle's descriptor layouts, in bind point order
    /// paired with the cache-assigned bind point index.
    pub binding_maps: Vec<(u16, Arc<BindingMap>)>,
}

impl ShaderBundle {
    #[must_use]
    pub fn stage(&self, kind: ShaderStageKind) -> Option<&Arc<ShaderStage>> {
        self.stages.iter().find(|stage| stage.stage == kind)
    }
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Default)]
struct BindPointNames {
    indices: FxHashMap<String, u16>,
}

impl BindPointNames {
    fn index_for(&mut self, name: &str) -> u16 {
        if let Some(&index) = self.indices.get(name) {
            return index;
        }
        let index = self.indices.len() as u16;
        self.indices.insert(name.to_string(), index);
        index
    }
}

pub struct ObjectCache {
    vertex_bindpoints: Mutex<BindPointNames>,
    descriptor_bindpoints: Mutex<BindPointNames>,
    vertex_layouts: Mutex<FxHashMap<u64, Arc<VertexLayoutEntry>>>,
    shader_stages: Mutex<FxHashMap<u64, Option<Arc<ShaderStage>>>>,
    shader_bundles: Mutex<FxHashMap<u64, Arc<ShaderBundle>>>,
    binding_maps: Mutex<FxHashMap<u64, Arc<BindingMap>>>,
    samplers: Mutex<FxHashMap<u64, Arc<wgpu::Sampler>>>,
    render_pipelines: Mutex<FxHashMap<u64, Option<Arc<wgpu::RenderPipeline>>>>,
    compute_pipelines: Mutex<FxHashMap<u64, Option<Arc<wgpu::ComputePipeline>>>>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            vertex_bindpoints: Mutex::default(),
            descriptor_bindpoints: Mutex::default(),
            vertex_layouts: Mutex::new(FxHashMap::default()),
            shader_stages: Mutex::new(FxHashMap::default()),
            shader_bundles: Mutex::new(FxHashMap::default()),
            binding_maps: Mutex::new(FxHashMap::default()),
            samplers: Mutex::new(FxHashMap::default()),
            render_pipelines: Mutex::new(FxHashMap::default()),
            compute_pipelines: Mutex::new(FxHashMap::default()),
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
        }
    }

    // ── Bind point indices ───────────────────────────────────────────────

    /// Stable small integer for a vertex stream name.
    pub fn vertex_bindpoint_index(&self, name: &str) -> u16 {
        self.vertex_bindpoints.lock().index_for(name)
    }

    /// Stable small integer for a descriptor bind point. Identity is the
    /// layout name plus its structure, so two layouts sharing a structure
    /// under one name share the index.
    pub fn descriptor_bindpoint_index(&self, layout: &DescriptorLayoutDesc) -> u16 {
        let key = format!("{}#{:016x}", layout.name, layout.structure_hash());
        self.descriptor_bindpoints.lock().index_for(&key)
    }

    // ── Vertex layouts ───────────────────────────────────────────────────

    pub fn vertex_layout(&self, desc: &VertexLayoutDesc) -> Arc<VertexLayoutEntry> {
        let hash = desc.structure_hash();
        let mut layouts = self.vertex_layouts.lock();
        if let Some(entry) = layouts.get(&hash) {
            self.note_hit();
            return Arc::clone(entry);
        }
        self.note_miss();
        let entry = Arc::new(VertexLayoutEntry {
            hash,
            desc: desc.clone(),
        });
        layouts.insert(hash, Arc::clone(&entry));
        entry
    }

    // ── Shader stages ────────────────────────────────────────────────────

    /// Compile (or fetch) one stage. `None` marks a poisoned entry: the
    /// blob failed to decompress or compile and draws using it are skipped.
    pub fn shader_stage(&self, gpu: &GpuContext, blob: &ShaderStageBlob) -> Option<Arc<ShaderStage>> {
        let hash = blob.blob_hash();
        {
            let stages = self.shader_stages.lock();
            if let Some(entry) = stages.get(&hash) {
                self.note_hit();
                return entry.clone();
            }
        }
        self.note_miss();

        let built = Self::build_shader_stage(gpu, blob);
        let entry = built.map(Arc::new);
        self.shader_stages.lock().insert(hash, entry.clone());
        entry
    }

    fn build_shader_stage(gpu: &GpuContext, blob: &ShaderStageBlob) -> Option<ShaderStage> {
        gpu.assert_worker_thread();

        let bytes: Cow<'_, [u8]> = if blob.compressed {
            match lz4_flex::decompress(&blob.bytes, blob.unpacked_size as usize) {
                Ok(bytes) => Cow::Owned(bytes),
                Err(err) => {
                    log::error!("Shader blob decompression failed: {err}");
                    return None;
                }
            }
        } else {
            Cow::Borrowed(blob.bytes.as_ref())
        };

        let source = match std::str::from_utf8(&bytes) {
            Ok(source) => source.to_string(),
            Err(err) => {
                log::error!("Shader blob is not valid UTF-8: {err}");
                return None;
            }
        };

        let error_scope = gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: gpu.label("Shader Stage"),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(source.clone())),
            });
        if let Some(error) = pollster::block_on(error_scope.pop()) {
            log::error!("Shader compile failed: {error}\n--- source ---\n{source}");
            return None;
        }

        Some(ShaderStage {
            stage: blob.stage,
            module,
        })
    }

    // ── Shader bundles ───────────────────────────────────────────────────

    /// Link (or fetch) the bundle for a shaders object: compiled stages,
    /// vertex layout entry, and binding maps with bind point indices.
    pub fn shader_bundle(&self, gpu: &GpuContext, object: &ShaderBundleObject) -> Arc<ShaderBundle> {
        {
            let bundles = self.shader_bundles.lock();
            if let Some(bundle) = bundles.get(&object.bundle_hash) {
                self.note_hit();
                return Arc::clone(bundle);
            }
        }
        self.note_miss();

        let stages = object
            .setup
            .stages
            .iter()
            .filter_map(|blob| self.shader_stage(gpu, blob))
            .collect();
        let vertex_layout = object
            .setup
            .vertex_layout
            .as_ref()
            .map(|desc| self.vertex_layout(desc));
        let binding_maps = object
            .setup
            .descriptor_layouts
            .iter()
            .map(|layout| {
                (
                    self.descriptor_bindpoint_index(layout),
                    self.binding_map(gpu, layout),
                )
            })
            .collect();

        let bundle = Arc::new(ShaderBundle {
            bundle_hash: object.bundle_hash,
            stages,
            vertex_layout,
            binding_maps,
        });
        self.shader_bundles
            .lock()
            .insert(object.bundle_hash, Arc::clone(&bundle));
        bundle
    }

    // ── Binding maps ─────────────────────────────────────────────────────

    /// Flatten (or fetch) a descriptor layout into its binding map. Slots
    /// number from 0 per resource class in declaration order.
    pub fn binding_map(&self, gpu: &GpuContext, layout: &DescriptorLayoutDesc) -> Arc<BindingMap> {
        let hash = layout.structure_hash();
        {
            let maps = self.binding_maps.lock();
            if let Some(map) = maps.get(&hash) {
                self.note_hit();
                return Arc::clone(map);
            }
        }
        self.note_miss();

        let mut class_counts: FxHashMap<DescriptorKind, u32> = FxHashMap::default();
        let mut entries = Vec::with_capacity(layout.bindings.len());
        for (element, binding) in layout.bindings.iter().enumerate() {
            let slot_counter = class_counts.entry(binding.kind).or_insert(0);
            let slot = *slot_counter;
            *slot_counter += 1;
            entries.push(BindingMapEntry {
                element: element as u32,
                kind: binding.kind,
                slot,
                binding: slot_base(binding.kind) + slot,
                writable: binding.writable,
                format: binding.format,
                implicit_sampler: false,
            });
        }
        // Each texture slot carries a companion sampler binding fed by the
        // sampler key of the texture entry itself.
        let implicit: Vec<BindingMapEntry> = entries
            .iter()
            .filter(|entry| entry.kind == DescriptorKind::Texture)
            .map(|entry| BindingMapEntry {
                element: entry.element,
                kind: DescriptorKind::Sampler,
                slot: entry.slot,
                binding: TEXTURE_SAMPLER_BASE + entry.slot,
                writable: false,
                format: None,
                implicit_sampler: true,
            })
            .collect();
        entries.extend(implicit);

        let layout_entries: Vec<wgpu::BindGroupLayoutEntry> = entries
            .iter()
            .map(|entry| wgpu::BindGroupLayoutEntry {
                binding: entry.binding,
                visibility: if entry.writable {
                    wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::COMPUTE
                } else {
                    wgpu::ShaderStages::VERTEX
                        | wgpu::ShaderStages::FRAGMENT
                        | wgpu::ShaderStages::COMPUTE
                },
                ty: match entry.kind {
                    DescriptorKind::ConstantBuffer => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    DescriptorKind::StorageBuffer => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage {
                            read_only: !entry.writable,
                        },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    DescriptorKind::Texture => wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    DescriptorKind::StorageImage => wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: entry.format.unwrap_or(wgpu::TextureFormat::Rgba8Unorm),
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    DescriptorKind::Sampler => {
                        wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)
                    }
                },
                count: None,
            })
            .collect();

        gpu.assert_worker_thread();
        let bind_group_layout =
            gpu.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: gpu.label(&layout.name),
                    entries: &layout_entries,
                });

        let map = Arc::new(BindingMap {
            structure_hash: hash,
            entries,
            layout: bind_group_layout,
        });
        self.binding_maps.lock().insert(hash, Arc::clone(&map));
        map
    }

    // ── Samplers ─────────────────────────────────────────────────────────

    pub fn sampler(&self, gpu: &GpuContext, setup: &SamplerSetup) -> Arc<wgpu::Sampler> {
        let hash = setup.state_hash();
        {
            let samplers = self.samplers.lock();
            if let Some(sampler) = samplers.get(&hash) {
                self.note_hit();
                return Arc::clone(sampler);
            }
        }
        self.note_miss();

        gpu.assert_worker_thread();
        let sampler = Arc::new(gpu.device.create_sampler(&wgpu::SamplerDescriptor {
            label: gpu.label(&setup.label),
            address_mode_u: setup.address_u,
            address_mode_v: setup.address_v,
            address_mode_w: setup.address_w,
            mag_filter: setup.mag_filter,
            min_filter: setup.min_filter,
            mipmap_filter: match setup.mip_filter {
                wgpu::FilterMode::Nearest => wgpu::MipmapFilterMode::Nearest,
                wgpu::FilterMode::Linear => wgpu::MipmapFilterMode::Linear,
            },
            lod_min_clamp: setup.lod_min,
            lod_max_clamp: setup.lod_max,
            compare: setup.compare,
            anisotropy_clamp: setup.anisotropy,
            border_color: setup.border,
        }));
        self.samplers.lock().insert(hash, Arc::clone(&sampler));
        sampler
    }

    // ── Pipelines ────────────────────────────────────────────────────────

    /// Fetch or build a render pipeline. `build` returning `None` poisons
    /// the key (failed builds are not retried).
    pub fn render_pipeline(
        &self,
        key: u64,
        build: impl FnOnce() -> Option<wgpu::RenderPipeline>,
    ) -> Option<Arc<wgpu::RenderPipeline>> {
        {
            let pipelines = self.render_pipelines.lock();
            if let Some(entry) = pipelines.get(&key) {
                self.note_hit();
                return entry.clone();
            }
        }
        self.note_miss();
        let entry = build().map(Arc::new);
        self.render_pipelines.lock().insert(key, entry.clone());
        entry
    }

    pub fn compute_pipeline(
        &self,
        key: u64,
        build: impl FnOnce() -> Option<wgpu::ComputePipeline>,
    ) -> Option<Arc<wgpu::ComputePipeline>> {
        {
            let pipelines = self.compute_pipelines.lock();
            if let Some(entry) = pipelines.get(&key) {
                self.note_hit();
                return entry.clone();
            }
        }
        self.note_miss();
        let entry = build().map(Arc::new);
        self.compute_pipelines.lock().insert(key, entry.clone());
        entry
    }

    // ── Stats & teardown ─────────────────────────────────────────────────

    #[must_use]
    pub fn hit_count(&self) -> u64 {
        self.hits.load(std::sync::atomic::Ordering::Relaxed)
    }

    #[must_use]
    pub fn miss_count(&self) -> u64 {
        self.misses.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn note_hit(&self) {
        self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn note_miss(&self) {
        self.misses
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Drop every cached GPU object. Must run on the device worker.
    pub fn clear(&self) {
        self.render_pipelines.lock().clear();
        self.compute_pipelines.lock().clear();
        self.shader_bundles.lock().clear();
        self.shader_stages.lock().clear();
        self.binding_maps.lock().clear();
        self.samplers.lock().clear();
        self.vertex_layouts.lock().clear();
    }
}
