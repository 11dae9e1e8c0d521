//! Forward rasterizer: one render pass, one pipeline, a draw per mesh.

use std::sync::Arc;

use ash::vk;
use crystal_gpu::{
    create_framebuffers, rebuild_framebuffers, submit_one_shot, BufferCreateInfo,
    CommandRecorder, DescriptorPool, DescriptorSet, DescriptorSetCreateInfo,
    DescriptorSetLayout, DescriptorSetLayoutBuilder, Framebuffer, GpuAllocatable, GpuBuffer,
    GpuImage, GraphicsContext, ImageCreateInfo, MemoryLocation, PipelineLayout,
    RasterizationPipeline, RasterizationPipelineCreateInfo, RenderPass, RenderPassCreateInfo,
    SamplerConfig,
};
use glam::{Affine3A, Mat4};
use hashbrown::HashMap;

use crate::engine::{Frame, FrameRenderer, FrameUniforms, SceneUpdate, TARGET_FORMAT};
use crate::error::Result;
use crate::gpu_mesh::GpuMesh;
use crate::scene::MeshId;
use crate::settings::Settings;
use crate::shaders::ShaderLibrary;

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
const CLEAR_COLOR: [f32; 4] = [0.05, 0.05, 0.08, 1.0];
const CHECKER_SIZE: u32 = 64;
const CHECKER_CELL: u32 = 8;

struct DrawnMesh {
    id: MeshId,
    gpu: GpuMesh,
    transform: Affine3A,
}

/// Draws every scene mesh with a checker-textured material.
///
/// Targets must be color attachments sampled at the settings' MSAA count.
pub struct Rasterizer {
    ctx: Arc<GraphicsContext>,
    // Dependents first, so drops release them before what they use.
    sets: Vec<DescriptorSet>,
    meshes: Vec<DrawnMesh>,
    pipeline: RasterizationPipeline,
    framebuffers: Vec<Framebuffer>,
    depth: GpuImage,
    render_pass: RenderPass,
    texture: GpuImage,
    uniforms: Vec<GpuBuffer>,
    pipeline_info: RasterizationPipelineCreateInfo,
    pipeline_layout: Arc<PipelineLayout>,
    set_layout: Arc<DescriptorSetLayout>,
    pool: Arc<DescriptorPool>,
}

impl Rasterizer {
    pub fn new(
        ctx: &Arc<GraphicsContext>,
        settings: &Settings,
        shaders: &ShaderLibrary,
        targets: &[GpuImage],
    ) -> Result<Self> {
        let extent = settings.resolution.extent();
        let samples = settings.sample_count();

        let render_pass = RenderPass::create(
            ctx,
            &RenderPassCreateInfo::new("forward", TARGET_FORMAT)
                .depth(DEPTH_FORMAT)
                .samples(samples),
        )?;
        let depth = GpuImage::create(
            ctx,
            &ImageCreateInfo::depth("forward_depth", extent.width, extent.height, DEPTH_FORMAT)
                .samples(samples),
        )?;
        let framebuffers = create_framebuffers(ctx, &render_pass, targets, Some(&depth))?;

        let set_layout = DescriptorSetLayoutBuilder::new("forward")
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .sampled_image(1, vk::ShaderStageFlags::FRAGMENT)
            .build(ctx)?;
        let push_constants = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: std::mem::size_of::<Mat4>() as u32,
        }];
        let pipeline_layout =
            PipelineLayout::new(ctx, &[Arc::clone(&set_layout)], &push_constants)?;
        let pipeline_info = RasterizationPipelineCreateInfo::new(
            "forward",
            shaders.raster_vertex.clone(),
            shaders.raster_fragment.clone(),
            extent,
        );
        let pipeline =
            RasterizationPipeline::create(ctx, &pipeline_info, &render_pass, &pipeline_layout)?;

        let texture = upload_checker(ctx, settings.anisotropic_filter_level, settings.mip_levels)?;
        let uniforms = (0..targets.len())
            .map(|slot| {
                GpuBuffer::create(
                    ctx,
                    &BufferCreateInfo::new(
                        format!("forward_uniforms_{slot}"),
                        std::mem::size_of::<FrameUniforms>() as u64,
                        vk::BufferUsageFlags::UNIFORM_BUFFER,
                    )
                    .location(MemoryLocation::CpuToGpu),
                )
            })
            .collect::<crystal_gpu::Result<Vec<_>>>()?;

        let pool = DescriptorPool::for_layout(ctx, &set_layout, targets.len() as u32)?;
        let sets = uniforms
            .iter()
            .enumerate()
            .map(|(slot, buffer)| {
                DescriptorSet::create(
                    ctx,
                    DescriptorSetCreateInfo::new(format!("forward_{slot}"), &set_layout, &pool)
                        .bind(0, buffer)
                        .bind(1, &texture),
                )
            })
            .collect::<crystal_gpu::Result<Vec<_>>>()?;

        Ok(Self {
            ctx: Arc::clone(ctx),
            sets,
            meshes: Vec::new(),
            pipeline,
            framebuffers,
            depth,
            render_pass,
            texture,
            uniforms,
            pipeline_info,
            pipeline_layout,
            set_layout,
            pool,
        })
    }

    /// Meshes currently resident, in draw order.
    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    pub fn pipeline(&self) -> &RasterizationPipeline {
        &self.pipeline
    }

    pub fn framebuffers(&self) -> &[Framebuffer] {
        &self.framebuffers
    }

    pub fn texture(&self) -> &GpuImage {
        &self.texture
    }
}

impl FrameRenderer for Rasterizer {
    fn name(&self) -> &'static str {
        "rasterizer"
    }

    fn on_scene_change(&mut self, update: SceneUpdate<'_>) -> Result<()> {
        let scene = update.scene;
        // Allocate before touching the current meshes so a failure leaves
        // them intact for the retry.
        let mut fresh: HashMap<MeshId, GpuMesh> = HashMap::new();
        for (id, mesh) in scene.meshes() {
            let reusable = self.meshes.iter().find(|drawn| drawn.id == id).is_some_and(|drawn| {
                !update.diff.geometry.contains(&id) || drawn.gpu.fits(mesh)
            });
            if !reusable {
                let label = format!("mesh_{}", id.index());
                let gpu = GpuMesh::upload_with_retry(&self.ctx, &label, mesh, false, update.retired)?;
                fresh.insert(id, gpu);
            }
        }

        let (kept, removed): (Vec<DrawnMesh>, Vec<DrawnMesh>) = self
            .meshes
            .drain(..)
            .partition(|drawn| scene.mesh(drawn.id).is_some());
        self.meshes = kept;
        for drawn in removed {
            update
                .retired
                .retire(drawn.gpu, format!("mesh_{}", drawn.id.index()), update.frame_number);
        }

        let mut result = Ok(());
        for drawn in &mut self.meshes {
            let Some(mesh) = scene.mesh(drawn.id) else {
                continue;
            };
            if let Some(gpu) = fresh.remove(&drawn.id) {
                let old = std::mem::replace(&mut drawn.gpu, gpu);
                update
                    .retired
                    .retire(old, format!("mesh_{}", drawn.id.index()), update.frame_number);
            } else if result.is_ok() && update.diff.geometry.contains(&drawn.id) {
                result = drawn.gpu.update(mesh).map(|_| ());
            }
            drawn.transform = mesh.transform;
        }
        for (id, mesh) in scene.meshes() {
            if let Some(gpu) = fresh.remove(&id) {
                self.meshes.push(DrawnMesh {
                    id,
                    gpu,
                    transform: mesh.transform,
                });
            }
        }
        tracing::debug!(meshes = self.meshes.len(), "rasterizer meshes updated");
        result
    }

    fn record_frame(
        &mut self,
        recorder: &mut CommandRecorder<'_>,
        frame: &mut Frame<'_>,
    ) -> crystal_gpu::Result<()> {
        self.uniforms[frame.slot].write(0, &[FrameUniforms::new(frame)])?;
        let layout = self.pipeline_layout.handle();

        recorder.reference(frame.target.resource_id());
        recorder.begin_render_pass(&self.render_pass, &self.framebuffers[frame.slot], CLEAR_COLOR);
        self.pipeline.bind(recorder);
        recorder.bind_descriptor_set(
            vk::PipelineBindPoint::GRAPHICS,
            layout,
            0,
            &self.sets[frame.slot],
        )?;
        for drawn in &self.meshes {
            let model = Mat4::from(drawn.transform);
            recorder.push_constants(layout, vk::ShaderStageFlags::VERTEX, 0, bytemuck::bytes_of(&model));
            drawn.gpu.draw(recorder);
        }
        recorder.end_render_pass();
        Ok(())
    }

    fn on_resize(&mut self, targets: &[GpuImage]) -> Result<()> {
        let Some(extent) = targets.first().map(GpuImage::extent) else {
            return Ok(());
        };
        self.depth.resize(extent.width, extent.height)?;
        rebuild_framebuffers(
            &self.ctx,
            &mut self.framebuffers,
            &self.render_pass,
            targets,
            Some(&self.depth),
        )?;

        // The viewport is baked into the pipeline.
        self.pipeline_info.extent = extent;
        let pipeline = RasterizationPipeline::create(
            &self.ctx,
            &self.pipeline_info,
            &self.render_pass,
            &self.pipeline_layout,
        )?;
        drop(std::mem::replace(&mut self.pipeline, pipeline));
        Ok(())
    }
}

impl std::fmt::Debug for Rasterizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rasterizer")
            .field("meshes", &self.meshes.len())
            .field("frames", &self.sets.len())
            .field("samples", &self.render_pass.samples())
            .field("set_layout", &self.set_layout.label())
            .finish_non_exhaustive()
    }
}

/// Create the checker texture, upload it and generate its mip chain.
fn upload_checker(ctx: &Arc<GraphicsContext>, anisotropy: f32, mip_levels: u32) -> Result<GpuImage> {
    let pixels: Vec<[u8; 4]> = (0..CHECKER_SIZE * CHECKER_SIZE)
        .map(|i| {
            let (x, y) = (i % CHECKER_SIZE, i / CHECKER_SIZE);
            if (x / CHECKER_CELL + y / CHECKER_CELL) % 2 == 0 {
                [220, 220, 220, 255]
            } else {
                [40, 40, 40, 255]
            }
        })
        .collect();
    let staging = GpuBuffer::from_slice(
        ctx,
        "checker_staging",
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        &pixels,
    )?;

    let mut texture = GpuImage::create(
        ctx,
        &ImageCreateInfo::new(
            "checker",
            CHECKER_SIZE,
            CHECKER_SIZE,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
        )
        .mip_levels(mip_levels)
        .sampler(SamplerConfig {
            anisotropy: (anisotropy > 1.0).then_some(anisotropy),
            ..SamplerConfig::default()
        }),
    )?;
    submit_one_shot(ctx, |recorder| {
        texture.transition(recorder, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        recorder.copy_buffer_to_image(&staging, &texture);
        texture.generate_mipmaps(recorder)
    })?;
    Ok(texture)
}
