//! Predefined resources
//!
//! Small fixed tables of images and samplers that producer and device agree
//! on by stable small-integer id. Built once at device init on the worker;
//! they live for the device lifetime and are not registered in the object
//! registry (they are addressed by enum, not by handle).

use crate::device::gpu::GpuContext;

/// Predefined image ids. The numeric values are a wire contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PredefinedImage {
    Black = 0,
    White = 1,
    GrayLinear = 2,
    GraySrgb = 3,
    NormalZ = 4,
    DefaultDepthRt = 5,
    DefaultColorRt = 6,
    DefaultDepthArrayRt = 7,
}

impl PredefinedImage {
    pub const COUNT: usize = 8;

    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Black),
            1 => Some(Self::White),
            2 => Some(Self::GrayLinear),
            3 => Some(Self::GraySrgb),
            4 => Some(Self::NormalZ),
            5 => Some(Self::DefaultDepthRt),
            6 => Some(Self::DefaultColorRt),
            7 => Some(Self::DefaultDepthArrayRt),
            _ => None,
        }
    }
}

/// Predefined sampler ids. The numeric values are a wire contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PredefinedSampler {
    ClampPoint = 0,
    ClampBilinear = 1,
    ClampTrilinear = 2,
    ClampAniso = 3,
    WrapPoint = 4,
    WrapBilinear = 5,
    WrapTrilinear = 6,
    WrapAniso = 7,
    PointCompareLe = 8,
    PointCompareGe = 9,
    BilinearCompareLe = 10,
    BilinearCompareGe = 11,
}

impl PredefinedSampler {
    pub const COUNT: usize = 12;

    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        (raw < Self::COUNT as u8).then(|| match raw {
            0 => Self::ClampPoint,
            1 => Self::ClampBilinear,
            2 => Self::ClampTrilinear,
            3 => Self::ClampAniso,
            4 => Self::WrapPoint,
            5 => Self::WrapBilinear,
            6 => Self::WrapTrilinear,
            7 => Self::WrapAniso,
            8 => Self::PointCompareLe,
            9 => Self::PointCompareGe,
            10 => Self::BilinearCompareLe,
            _ => Self::BilinearCompareGe,
        })
    }
}

/// The built predefined tables, indexed by the enums above.
pub struct PredefinedResources {
    images: Vec<wgpu::Texture>,
    image_views: Vec<wgpu::TextureView>,
    samplers: Vec<wgpu::Sampler>,
}

impl PredefinedResources {
    /// Build every predefined image and sampler. Runs on the device worker.
    #[must_use]
    pub fn create(gpu: &GpuContext) -> Self {
        let mut images = Vec::with_capacity(PredefinedImage::COUNT);
        let mut image_views = Vec::with_capacity(PredefinedImage::COUNT);

        for raw in 0..PredefinedImage::COUNT as u8 {
            let id = PredefinedImage::from_raw(raw).unwrap();
            let texture = Self::create_image(gpu, id);
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            images.push(texture);
            image_views.push(view);
        }

        let samplers = (0..PredefinedSampler::COUNT as u8)
            .map(|raw| Self::create_sampler(gpu, PredefinedSampler::from_raw(raw).unwrap()))
            .collect();

        Self {
            images,
            image_views,
            samplers,
        }
    }

    #[must_use]
    pub fn image(&self, id: PredefinedImage) -> &wgpu::Texture {
        &self.images[id as usize]
    }

    #[must_use]
    pub fn image_view(&self, id: PredefinedImage) -> &wgpu::TextureView {
        &self.image_views[id as usize]
    }

    #[must_use]
    pub fn sampler(&self, id: PredefinedSampler) -> &wgpu::Sampler {
        &self.samplers[id as usize]
    }

    fn create_image(gpu: &GpuContext, id: PredefinedImage) -> wgpu::Texture {
        let (format, usage, layers, fill): (
            wgpu::TextureFormat,
            wgpu::TextureUsages,
            u32,
            Option<[u8; 4]>,
        ) = match id {
            PredefinedImage::Black => (
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                1,
                Some([0, 0, 0, 255]),
            ),
            PredefinedImage::White => (
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                1,
                Some([255, 255, 255, 255]),
            ),
            PredefinedImage::GrayLinear => (
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                1,
                Some([127, 127, 127, 255]),
            ),
            PredefinedImage::GraySrgb => (
                wgpu::TextureFormat::Rgba8UnormSrgb,
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                1,
                Some([127, 127, 127, 255]),
            ),
            PredefinedImage::NormalZ => (
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                1,
                Some([127, 127, 255, 255]),
            ),
            PredefinedImage::DefaultDepthRt => (
                wgpu::TextureFormat::Depth24PlusStencil8,
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
                1,
                None,
            ),
            PredefinedImage::DefaultColorRt => (
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
                1,
                None,
            ),
            PredefinedImage::DefaultDepthArrayRt => (
                wgpu::TextureFormat::Depth24PlusStencil8,
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
                4,
                None,
            ),
        };

        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Predefined Image"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: layers,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });

        if let Some(pixel) = fill {
            for layer in 0..layers {
                gpu.queue.write_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture: &texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d {
                            x: 0,
                            y: 0,
                            z: layer,
                        },
                        aspect: wgpu::TextureAspect::All,
                    },
                    &pixel,
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(4),
                        rows_per_image: Some(1),
                    },
                    wgpu::Extent3d {
                        width: 1,
                        height: 1,
                        depth_or_array_layers: 1,
                    },
                );
            }
        }

        texture
    }

    fn create_sampler(gpu: &GpuContext, id: PredefinedSampler) -> wgpu::Sampler {
        use PredefinedSampler as P;

        let address = match id {
            P::ClampPoint | P::ClampBilinear | P::ClampTrilinear | P::ClampAniso => {
                wgpu::AddressMode::ClampToEdge
            }
            _ => wgpu::AddressMode::Repeat,
        };
        let (mag, min, mip) = match id {
            P::ClampPoint | P::WrapPoint | P::PointCompareLe | P::PointCompareGe => (
                wgpu::FilterMode::Nearest,
                wgpu::FilterMode::Nearest,
                wgpu::FilterMode::Nearest,
            ),
            P::ClampBilinear | P::WrapBilinear | P::BilinearCompareLe | P::BilinearCompareGe => (
                wgpu::FilterMode::Linear,
                wgpu::FilterMode::Linear,
                wgpu::FilterMode::Nearest,
            ),
            _ => (
                wgpu::FilterMode::Linear,
                wgpu::FilterMode::Linear,
                wgpu::FilterMode::Linear,
            ),
        };
        let compare = match id {
            P::PointCompareLe | P::BilinearCompareLe => Some(wgpu::CompareFunction::LessEqual),
            P::PointCompareGe | P::BilinearCompareGe => Some(wgpu::CompareFunction::GreaterEqual),
            _ => None,
        };
        let anisotropy = match id {
            P::ClampAniso | P::WrapAniso => 16,
            _ => 1,
        };

        gpu.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Predefined Sampler"),
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            mag_filter: mag,
            min_filter: min,
            mipmap_filter: match mip {
                wgpu::FilterMode::Nearest => wgpu::MipmapFilterMode::Nearest,
                wgpu::FilterMode::Linear => wgpu::MipmapFilterMode::Linear,
            },
            anisotropy_clamp: anisotropy,
            compare,
            ..Default::default()
        })
    }
}
