//! GPU images: allocation, view, optional sampler and layout tracking.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::command::{Barrier, CommandRecorder};
use crate::context::GraphicsContext;
use crate::descriptors::Bindable;
use crate::device::DescriptorWrite;
use crate::error::{GpuError, Result};
use crate::graph::ResourceKind;
use crate::memory::MemoryBlock;
use crate::resource::{GpuAllocatable, Registration};

/// Sampler parameters of a sampled image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerConfig {
    pub filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
    /// Requested anisotropy, clamped to the device maximum. `None` disables it.
    pub anisotropy: Option<f32>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            anisotropy: None,
        }
    }
}

/// Creation parameters of a [`GpuImage`].
#[derive(Debug, Clone)]
pub struct ImageCreateInfo {
    pub label: String,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub sampler: Option<SamplerConfig>,
}

impl ImageCreateInfo {
    /// Single-mip 2D color image.
    pub fn new(
        label: impl Into<String>,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            label: label.into(),
            extent: vk::Extent2D { width, height },
            format,
            usage,
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            sampler: None,
        }
    }

    /// Depth attachment.
    pub fn depth(label: impl Into<String>, width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            aspect: vk::ImageAspectFlags::DEPTH,
            ..Self::new(
                label,
                width,
                height,
                format,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            )
        }
    }

    /// Capped at the full chain for the extent.
    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.clamp(1, max_mip_levels(self.extent));
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    /// Attach a sampler. Adds `SAMPLED` usage.
    pub fn sampler(mut self, config: SamplerConfig) -> Self {
        self.usage |= vk::ImageUsageFlags::SAMPLED;
        self.sampler = Some(config);
        self
    }
}

/// Levels of a full mip chain down to 1x1.
pub fn max_mip_levels(extent: vk::Extent2D) -> u32 {
    u32::BITS - extent.width.max(extent.height).max(1).leading_zeros()
}

#[derive(Debug)]
struct NativeImage {
    image: vk::Image,
    memory: MemoryBlock,
    view: vk::ImageView,
    sampler: vk::Sampler,
}

/// A 2D image registered in the dependency graph.
///
/// The tracked layout is what the last recorded transition left the image
/// in; it is only correct if every transition goes through
/// [`GpuImage::transition`].
#[derive(Debug)]
pub struct GpuImage {
    registration: Registration,
    native: Option<NativeImage>,
    info: ImageCreateInfo,
    max_anisotropy: Option<f32>,
    layout: vk::ImageLayout,
}

impl GpuImage {
    pub fn create(ctx: &Arc<GraphicsContext>, info: &ImageCreateInfo) -> Result<Self> {
        let max_anisotropy = info.sampler.and_then(|s| s.anisotropy).and_then(|requested| {
            let clamped = ctx.physical_device_info().clamp_anisotropy(requested);
            if clamped != Some(requested) {
                tracing::info!(
                    label = %info.label,
                    requested,
                    clamped = ?clamped,
                    "Anisotropic filtering clamped to device limits"
                );
            }
            clamped
        });

        let native = create_native(ctx, info, max_anisotropy)?;
        let registration = match Registration::new(ctx, ResourceKind::Image, info.label.clone()) {
            Ok(registration) => registration,
            Err(e) => {
                destroy_native(ctx, native);
                return Err(e);
            }
        };
        tracing::trace!(label = %info.label, extent = ?info.extent, format = ?info.format, "allocated image");

        Ok(Self {
            registration,
            native: Some(native),
            info: info.clone(),
            max_anisotropy,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    /// Native image handle, null once destroyed.
    pub fn handle(&self) -> vk::Image {
        self.native.as_ref().map_or(vk::Image::null(), |n| n.image)
    }

    pub fn view(&self) -> vk::ImageView {
        self.native.as_ref().map_or(vk::ImageView::null(), |n| n.view)
    }

    /// Sampler handle, null when the image has none.
    pub fn sampler(&self) -> vk::Sampler {
        self.native.as_ref().map_or(vk::Sampler::null(), |n| n.sampler)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.info.extent
    }

    pub fn format(&self) -> vk::Format {
        self.info.format
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.info.usage
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.info.aspect
    }

    pub fn mip_levels(&self) -> u32 {
        self.info.mip_levels
    }

    /// Extent of mip `level`, never below 1x1.
    pub fn mip_extent(&self, level: u32) -> vk::Extent2D {
        vk::Extent2D {
            width: (self.info.extent.width >> level).max(1),
            height: (self.info.extent.height >> level).max(1),
        }
    }

    /// Anisotropy level the sampler was created with.
    pub fn max_anisotropy(&self) -> Option<f32> {
        self.max_anisotropy
    }

    /// Layout after the last recorded transition.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Record a layout transition and update the tracked layout.
    pub fn transition(&mut self, recorder: &mut CommandRecorder<'_>, new_layout: vk::ImageLayout) {
        if self.layout == new_layout {
            return;
        }
        recorder.reference(self.registration.id());
        recorder.barrier(Barrier::image_layout(
            self.handle(),
            self.info.aspect,
            self.info.mip_levels,
            self.layout,
            new_layout,
        ));
        self.layout = new_layout;
    }

    /// Fill mips `1..mip_levels` from mip 0 by successive linear blits and
    /// leave every level in `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// Mip 0 must already hold the image, with all levels in
    /// `TRANSFER_DST_OPTIMAL`.
    pub fn generate_mipmaps(&mut self, recorder: &mut CommandRecorder<'_>) -> Result<()> {
        if self.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            return Err(GpuError::InvalidState(format!(
                "mipmaps of '{}' need TRANSFER_DST_OPTIMAL, image is in {:?}",
                self.label(),
                self.layout
            )));
        }
        let levels = self.info.mip_levels;
        if levels > 1 && !self.info.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC) {
            return Err(GpuError::InvalidState(format!(
                "mipmaps of '{}' need TRANSFER_SRC usage",
                self.label()
            )));
        }

        let (image, aspect) = (self.handle(), self.info.aspect);
        for level in 1..levels {
            recorder.barrier(Barrier::mip_level_layout(
                image,
                aspect,
                level - 1,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ));
            recorder.blit_mip_level(self, level - 1, vk::Filter::LINEAR);
            recorder.barrier(Barrier::mip_level_layout(
                image,
                aspect,
                level - 1,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ));
        }
        // The last level was only ever written.
        recorder.reference(self.registration.id());
        recorder.barrier(Barrier::mip_level_layout(
            image,
            aspect,
            levels - 1,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ));
        self.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        tracing::trace!(label = %self.label(), levels, "recorded mipmap generation");
        Ok(())
    }

    /// Recreate the image at a new size, keeping its graph identity.
    ///
    /// The image must not be in use by pending GPU work. Dependents captured
    /// the old handles and are marked invalid until rebuilt or rebound.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if self.registration.is_released() {
            return Err(GpuError::UnknownResource(self.registration.id()));
        }
        let extent = vk::Extent2D { width, height };
        if extent == self.info.extent {
            return Ok(());
        }

        let ctx = Arc::clone(self.registration.context());
        let mut info = self.info.clone();
        info.extent = extent;
        let native = create_native(&ctx, &info, self.max_anisotropy)?;
        if let Some(old) = self.native.replace(native) {
            destroy_native(&ctx, old);
        }
        self.info = info;
        self.layout = vk::ImageLayout::UNDEFINED;

        let mut graph = ctx.graph();
        let invalidated = graph.invalidate_dependents(self.registration.id());
        graph.bump_generation(self.registration.id())?;
        tracing::debug!(
            label = %self.label(),
            width,
            height,
            invalidated = invalidated.len(),
            "resized image"
        );
        Ok(())
    }

    /// Descriptor for shader access in `GENERAL` layout.
    pub fn storage_descriptor(&self) -> DescriptorWrite {
        DescriptorWrite::Image {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            view: self.view(),
            layout: vk::ImageLayout::GENERAL,
            sampler: vk::Sampler::null(),
        }
    }

    /// Descriptor for sampling in `SHADER_READ_ONLY_OPTIMAL` layout.
    pub fn sampled_descriptor(&self) -> DescriptorWrite {
        let ty = if self.sampler() == vk::Sampler::null() {
            vk::DescriptorType::SAMPLED_IMAGE
        } else {
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        };
        DescriptorWrite::Image {
            ty,
            view: self.view(),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            sampler: self.sampler(),
        }
    }
}

fn create_native(
    ctx: &GraphicsContext,
    info: &ImageCreateInfo,
    max_anisotropy: Option<f32>,
) -> Result<NativeImage> {
    if info.extent.width == 0 || info.extent.height == 0 {
        return Err(GpuError::InvalidState(format!(
            "image '{}' has zero extent",
            info.label
        )));
    }
    let device = ctx.device();

    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(info.format)
        .extent(vk::Extent3D {
            width: info.extent.width,
            height: info.extent.height,
            depth: 1,
        })
        .mip_levels(info.mip_levels)
        .array_layers(1)
        .samples(info.samples)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(info.usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let (image, memory) = device.create_image(&image_info, MemoryLocation::GpuOnly, &info.label)?;

    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(info.format)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(info.aspect)
                .base_mip_level(0)
                .level_count(info.mip_levels)
                .base_array_layer(0)
                .layer_count(1),
        );
    let view = match device.create_image_view(&view_info) {
        Ok(view) => view,
        Err(e) => {
            device.destroy_image(image, memory);
            return Err(e);
        }
    };

    let sampler = match info.sampler {
        Some(config) => {
            let sampler_info = vk::SamplerCreateInfo::default()
                .mag_filter(config.filter)
                .min_filter(config.filter)
                .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                .address_mode_u(config.address_mode)
                .address_mode_v(config.address_mode)
                .address_mode_w(config.address_mode)
                .anisotropy_enable(max_anisotropy.is_some())
                .max_anisotropy(max_anisotropy.unwrap_or(1.0))
                .min_lod(0.0)
                .max_lod(info.mip_levels as f32);
            match device.create_sampler(&sampler_info) {
                Ok(sampler) => sampler,
                Err(e) => {
                    device.destroy_image_view(view);
                    device.destroy_image(image, memory);
                    return Err(e);
                }
            }
        }
        None => vk::Sampler::null(),
    };

    Ok(NativeImage {
        image,
        memory,
        view,
        sampler,
    })
}

fn destroy_native(ctx: &GraphicsContext, native: NativeImage) {
    let device = ctx.device();
    if native.sampler != vk::Sampler::null() {
        device.destroy_sampler(native.sampler);
    }
    device.destroy_image_view(native.view);
    device.destroy_image(native.image, native.memory);
}

impl GpuAllocatable for GpuImage {
    fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Estimated at four bytes per texel.
    fn size_bytes(&self) -> u64 {
        if self.native.is_none() {
            return 0;
        }
        u64::from(self.info.extent.width) * u64::from(self.info.extent.height) * 4
    }

    fn destroy(&mut self) -> Result<()> {
        self.registration.release()?;
        if let Some(native) = self.native.take() {
            destroy_native(self.registration.context(), native);
        }
        Ok(())
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        if let Some(native) = self.native.take() {
            destroy_native(self.registration.context(), native);
        }
    }
}

impl Bindable for GpuImage {
    fn natural_type(&self) -> vk::DescriptorType {
        if self.sampler() != vk::Sampler::null() {
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        } else if self.info.usage.contains(vk::ImageUsageFlags::STORAGE) {
            vk::DescriptorType::STORAGE_IMAGE
        } else {
            vk::DescriptorType::SAMPLED_IMAGE
        }
    }

    fn supports(&self, ty: vk::DescriptorType) -> bool {
        match ty {
            vk::DescriptorType::STORAGE_IMAGE => {
                self.info.usage.contains(vk::ImageUsageFlags::STORAGE)
            }
            vk::DescriptorType::SAMPLED_IMAGE => {
                self.info.usage.contains(vk::ImageUsageFlags::SAMPLED)
            }
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => {
                self.info.usage.contains(vk::ImageUsageFlags::SAMPLED)
                    && self.sampler() != vk::Sampler::null()
            }
            _ => false,
        }
    }

    fn descriptor_write(&self, ty: vk::DescriptorType) -> DescriptorWrite {
        if ty == vk::DescriptorType::STORAGE_IMAGE {
            self.storage_descriptor()
        } else {
            self.sampled_descriptor()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::PhysicalDeviceInfo;
    use crate::command::{Command, CommandBufferManager};
    use crate::context::GraphicsContextBuilder;
    use crate::descriptors::{DescriptorPool, DescriptorSet, DescriptorSetCreateInfo, DescriptorSetLayoutBuilder};
    use approx::assert_relative_eq;

    fn context() -> Arc<GraphicsContext> {
        GraphicsContextBuilder::new()
            .headless(PhysicalDeviceInfo::headless())
            .build()
            .unwrap()
    }

    fn storage_image(ctx: &Arc<GraphicsContext>) -> GpuImage {
        GpuImage::create(
            ctx,
            &ImageCreateInfo::new(
                "target",
                64,
                32,
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
            ),
        )
        .unwrap()
    }

    #[test]
    fn anisotropy_is_clamped_to_device_max() {
        let ctx = context();
        let image = GpuImage::create(
            &ctx,
            &ImageCreateInfo::new(
                "albedo",
                16,
                16,
                vk::Format::R8G8B8A8_SRGB,
                vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sampler(SamplerConfig {
                anisotropy: Some(64.0),
                ..Default::default()
            }),
        )
        .unwrap();
        assert_relative_eq!(image.max_anisotropy().unwrap(), 16.0);
        assert_eq!(
            image.natural_type(),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }

    #[test]
    fn anisotropy_disabled_without_device_support() {
        let mut info = PhysicalDeviceInfo::headless();
        info.sampler_anisotropy = false;
        let ctx = GraphicsContextBuilder::new().headless(info).build().unwrap();
        let image = GpuImage::create(
            &ctx,
            &ImageCreateInfo::new("tex", 4, 4, vk::Format::R8G8B8A8_SRGB, vk::ImageUsageFlags::empty())
                .sampler(SamplerConfig {
                    anisotropy: Some(8.0),
                    ..Default::default()
                }),
        )
        .unwrap();
        assert!(image.max_anisotropy().is_none());
    }

    #[test]
    fn transition_tracks_layout_and_records_barrier() {
        let ctx = context();
        let mut image = storage_image(&ctx);
        let mut cmds = CommandBufferManager::graphics(&ctx).unwrap();
        let index = cmds.create_command_buffers(1).unwrap();
        cmds.record_command_buffer(index, |r| {
            image.transition(r, vk::ImageLayout::GENERAL);
            image.transition(r, vk::ImageLayout::GENERAL);
            Ok(())
        })
        .unwrap();

        assert_eq!(image.layout(), vk::ImageLayout::GENERAL);
        let commands = cmds.commands(index).unwrap();
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], Command::Barrier(Barrier::Image(_))));
    }

    #[test]
    fn resize_keeps_identity_and_invalidates_dependents() {
        let ctx = context();
        let mut image = storage_image(&ctx);
        let layout = DescriptorSetLayoutBuilder::new("out")
            .storage_image(0, vk::ShaderStageFlags::RAYGEN_KHR)
            .build(&ctx)
            .unwrap();
        let pool = DescriptorPool::for_layout(&ctx, &layout, 1).unwrap();
        let mut set = DescriptorSet::create(
            &ctx,
            DescriptorSetCreateInfo::new("out", &layout, &pool).bind(0, &image),
        )
        .unwrap();
        let id = image.resource_id();
        let old_handle = image.handle();

        image.resize(128, 64).unwrap();

        assert_eq!(image.resource_id(), id);
        assert_ne!(image.handle(), old_handle);
        assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(ctx.graph().generation(id), Some(1));
        assert!(!set.is_valid());
        assert!(matches!(set.validate(), Err(GpuError::StaleReference(_))));

        set.bind(0, &image).unwrap();
        set.validate().unwrap();
        assert_eq!(ctx.headless().unwrap().live_objects_of("image"), 1);
    }

    fn texture(ctx: &Arc<GraphicsContext>, mip_levels: u32) -> GpuImage {
        GpuImage::create(
            ctx,
            &ImageCreateInfo::new(
                "albedo",
                64,
                32,
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .mip_levels(mip_levels)
            .sampler(SamplerConfig::default()),
        )
        .unwrap()
    }

    #[test]
    fn mip_levels_are_capped_at_the_full_chain() {
        assert_eq!(max_mip_levels(vk::Extent2D { width: 64, height: 32 }), 7);
        assert_eq!(max_mip_levels(vk::Extent2D { width: 1, height: 1 }), 1);
        let ctx = context();
        let image = texture(&ctx, 20);
        assert_eq!(image.mip_levels(), 7);
        assert_eq!(image.mip_extent(6), vk::Extent2D { width: 1, height: 1 });
        assert_eq!(image.mip_extent(1), vk::Extent2D { width: 32, height: 16 });
    }

    #[test]
    fn generate_mipmaps_blits_each_level_from_the_previous() {
        let ctx = context();
        let mut image = texture(&ctx, 4);
        let mut cmds = CommandBufferManager::graphics(&ctx).unwrap();
        let index = cmds.create_command_buffers(1).unwrap();
        cmds.record_command_buffer(index, |r| {
            image.transition(r, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            image.generate_mipmaps(r)
        })
        .unwrap();

        let blits: Vec<_> = cmds
            .commands(index)
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Command::BlitImage {
                    src_level,
                    dst_level,
                    dst_extent,
                    ..
                } => Some((*src_level, *dst_level, dst_extent.width)),
                _ => None,
            })
            .collect();
        assert_eq!(blits.len() as u32, image.mip_levels() - 1);
        assert_eq!(blits, [(0, 1, 32), (1, 2, 16), (2, 3, 8)]);
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn single_level_mipmaps_only_transition() {
        let ctx = context();
        let mut image = texture(&ctx, 1);
        let mut cmds = CommandBufferManager::graphics(&ctx).unwrap();
        let index = cmds.create_command_buffers(1).unwrap();
        cmds.record_command_buffer(index, |r| {
            image.transition(r, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            image.generate_mipmaps(r)
        })
        .unwrap();

        let commands = cmds.commands(index).unwrap();
        assert!(!commands.iter().any(|c| matches!(c, Command::BlitImage { .. })));
        assert_eq!(commands.len(), 2);
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn mipmaps_need_the_image_in_transfer_dst() {
        let ctx = context();
        let mut image = texture(&ctx, 3);
        let mut cmds = CommandBufferManager::graphics(&ctx).unwrap();
        let index = cmds.create_command_buffers(1).unwrap();
        let result = cmds.record_command_buffer(index, |r| image.generate_mipmaps(r));
        assert!(matches!(result, Err(GpuError::InvalidState(_))));
    }

    #[test]
    fn destroy_releases_native_objects() {
        let ctx = context();
        let mut image = storage_image(&ctx);
        assert_eq!(image.size_bytes(), 64 * 32 * 4);
        image.destroy().unwrap();
        image.destroy().unwrap();
        assert_eq!(image.size_bytes(), 0);
        assert_eq!(ctx.headless().unwrap().live_objects_of("image"), 0);
        assert_eq!(ctx.headless().unwrap().live_objects_of("image_view"), 0);
    }
}
