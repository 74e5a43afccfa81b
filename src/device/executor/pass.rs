//! Pass handling
//!
//! Resolves pass setups into attachment sets, enforces the
//! width/height/sample agreement rule, and materializes the platform render
//! pass lazily: clears recorded between `BeginPass` and the first draw fold
//! into the attachment load ops, which is how clear-at-begin semantics map
//! onto a load-op based platform.

use smallvec::SmallVec;

use crate::command::{
    AttachmentTarget, DepthLoadOp, PassLoadOp, PassSetup,
};
use crate::device::gpu::GpuContext;
use crate::device::handle::ObjectKind;
use crate::device::object::{is_depth_format, DeviceObject};
use crate::device::registry::ObjectRegistry;

pub struct ResolvedColorAttachment {
    pub view: wgpu::TextureView,
    pub format: wgpu::TextureFormat,
    pub load: wgpu::LoadOp<wgpu::Color>,
    pub store: bool,
}

pub struct ResolvedDepthAttachment {
    pub view: wgpu::TextureView,
    pub format: wgpu::TextureFormat,
    pub depth_load: wgpu::LoadOp<f32>,
    pub stencil_load: wgpu::LoadOp<u32>,
    pub store: bool,
}

/// An open pass: attachments resolved, platform pass not yet begun.
pub struct PassState {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub color: SmallVec<[ResolvedColorAttachment; 4]>,
    pub depth: Option<ResolvedDepthAttachment>,
    pub raw: Option<wgpu::RenderPass<'static>>,
}

impl PassState {
    /// Resolve a pass setup against the registry. Returns `None` (with a
    /// log line) on any attachment disagreement; the executor then drops
    /// the pass and everything up to `EndPass`.
    pub fn resolve(
        setup: &PassSetup,
        gpu: &GpuContext,
        registry: &ObjectRegistry,
    ) -> Option<Self> {
        let mut width = 0u32;
        let mut height = 0u32;
        let mut samples = 0u32;
        let mut check = |w: u32, h: u32, s: u32| -> bool {
            if width == 0 {
                width = w;
                height = h;
                samples = s;
                true
            } else {
                width == w && height == h && samples == s
            }
        };

        let mut color = SmallVec::new();
        for attachment in &setup.color {
            let (view, format, w, h, s) = resolve_target(&attachment.target, gpu, registry)?;
            if !check(w, h, s) {
                log::warn!("Pass attachments disagree on dimensions/samples; pass dropped");
                return None;
            }
            color.push(ResolvedColorAttachment {
                view,
                format,
                load: match attachment.load {
                    PassLoadOp::Clear(c) => wgpu::LoadOp::Clear(wgpu::Color {
                        r: c[0],
                        g: c[1],
                        b: c[2],
                        a: c[3],
                    }),
                    // The platform has no don't-care load; loading is the
                    // conservative translation.
                    PassLoadOp::Load | PassLoadOp::DontCare => wgpu::LoadOp::Load,
                },
                store: attachment.store,
            });
        }

        let depth = match &setup.depth {
            None => None,
            Some(attachment) => {
                let (view, format, w, h, s) = resolve_target(&attachment.target, gpu, registry)?;
                if !check(w, h, s) {
                    log::warn!("Depth attachment disagrees on dimensions/samples; pass dropped");
                    return None;
                }
                if !is_depth_format(format) {
                    log::warn!("Depth attachment has color format {format:?}; pass dropped");
                    return None;
                }
                let (depth_load, stencil_load) = match attachment.load {
                    DepthLoadOp::Clear { depth, stencil } => {
                        (wgpu::LoadOp::Clear(depth), wgpu::LoadOp::Clear(stencil))
                    }
                    DepthLoadOp::Load | DepthLoadOp::DontCare => {
                        (wgpu::LoadOp::Load, wgpu::LoadOp::Load)
                    }
                };
                Some(ResolvedDepthAttachment {
                    view,
                    format,
                    depth_load,
                    stencil_load,
                    store: attachment.store,
                })
            }
        };

        if width == 0 {
            log::warn!("Pass has no attachments; dropped");
            return None;
        }

        Some(Self {
            label: setup.label.clone(),
            width,
            height,
            samples,
            color,
            depth,
            raw: None,
        })
    }

    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.raw.is_some()
    }

    /// Fold a mid-stream clear of color attachment `index` into its load
    /// op. Only legal while the platform pass has not begun.
    pub fn clear_color(&mut self, index: usize, value: [f64; 4]) -> bool {
        if self.raw.is_some() {
            return false;
        }
        let Some(attachment) = self.color.get_mut(index) else {
            return false;
        };
        attachment.load = wgpu::LoadOp::Clear(wgpu::Color {
            r: value[0],
            g: value[1],
            b: value[2],
            a: value[3],
        });
        true
    }

    pub fn clear_depth(&mut self, depth: f32, stencil: u32) -> bool {
        if self.raw.is_some() {
            return false;
        }
        let Some(attachment) = self.depth.as_mut() else {
            return false;
        };
        attachment.depth_load = wgpu::LoadOp::Clear(depth);
        attachment.stencil_load = wgpu::LoadOp::Clear(stencil);
        true
    }

    /// Begin the platform render pass if it hasn't been begun yet.
    pub fn materialize(&mut self, encoder: &mut wgpu::CommandEncoder) -> &mut wgpu::RenderPass<'static> {
        if self.raw.is_none() {
            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = self
                .color
                .iter()
                .map(|attachment| {
                    Some(wgpu::RenderPassColorAttachment {
                        view: &attachment.view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: attachment.load,
                            store: if attachment.store {
                                wgpu::StoreOp::Store
                            } else {
                                wgpu::StoreOp::Discard
                            },
                        },
                        depth_slice: None,
                    })
                })
                .collect();

            let depth_stencil_attachment =
                self.depth.as_ref().map(|attachment| {
                    let has_stencil = matches!(
                        attachment.format,
                        wgpu::TextureFormat::Depth24PlusStencil8
                            | wgpu::TextureFormat::Depth32FloatStencil8
                    );
                    wgpu::RenderPassDepthStencilAttachment {
                        view: &attachment.view,
                        depth_ops: Some(wgpu::Operations {
                            load: attachment.depth_load,
                            store: if attachment.store {
                                wgpu::StoreOp::Store
                            } else {
                                wgpu::StoreOp::Discard
                            },
                        }),
                        stencil_ops: has_stencil.then_some(wgpu::Operations {
                            load: attachment.stencil_load,
                            store: wgpu::StoreOp::Store,
                        }),
                    }
                });

            let pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: self.label.as_deref(),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            // The executor owns both the encoder and the pass and always
            // drops the pass before finishing the encoder.
            self.raw = Some(pass.forget_lifetime());
        }
        self.raw.as_mut().expect("materialized above")
    }

    /// Content hash of the attachment formats, part of the pipeline key.
    #[must_use]
    pub fn formats_hash(&self) -> u64 {
        let mut h = xxhash_rust::xxh3::Xxh3::new();
        for attachment in &self.color {
            h.update(format!("{:?}", attachment.format).as_bytes());
        }
        if let Some(depth) = &self.depth {
            h.update(format!("D{:?}", depth.format).as_bytes());
        }
        h.update(&self.samples.to_le_bytes());
        h.digest()
    }
}

/// Resolve an attachment target into a platform view plus its geometry.
pub fn resolve_target(
    target: &AttachmentTarget,
    gpu: &GpuContext,
    registry: &ObjectRegistry,
) -> Option<(wgpu::TextureView, wgpu::TextureFormat, u32, u32, u32)> {
    match target {
        AttachmentTarget::View(id) => {
            let object = registry.resolve_kind(*id, ObjectKind::ImageView)?;
            let DeviceObject::ImageView(view) = object.as_ref() else {
                return None;
            };
            let image_object = registry.resolve_kind(view.setup.image, ObjectKind::Image)?;
            let image = image_object.as_image()?;
            let (w, h, _) = image.setup.mip_extent(view.setup.first_mip);
            Some((
                view.ensure(gpu, image).clone(),
                view.format,
                w,
                h,
                image.setup.samples,
            ))
        }
        AttachmentTarget::Output(id) => {
            let object = registry.resolve_kind(*id, ObjectKind::Output)?;
            let output = object.as_output()?;
            let target_id = output.current_target()?;
            let rt_object = registry.resolve_kind(target_id, ObjectKind::RenderTarget)?;
            let rt = rt_object.as_render_target()?;
            Some((rt.view.clone(), rt.format, rt.width, rt.height, 1))
        }
    }
}
