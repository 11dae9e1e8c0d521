//! Shader modules, pipeline layouts and rasterization pipelines.
//!
//! Pipelines are immutable. Changing any state, including the viewport,
//! means creating a new pipeline and dropping the old one.

use std::mem::offset_of;
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::command::CommandRecorder;
use crate::context::GraphicsContext;
use crate::descriptors::DescriptorSetLayout;
use crate::error::{GpuError, Result};
use crate::graph::{ResourceId, ResourceKind};
use crate::render_pass::RenderPass;
use crate::resource::Registration;

/// Mesh vertex as consumed by both the rasterizer and BLAS builds.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    /// Zero when the mesh has no tangents.
    pub tangent: [f32; 4],
}

impl Vertex {
    pub const fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
            tangent: [0.0; 4],
        }
    }

    pub const fn with_tangent(mut self, tangent: [f32; 4]) -> Self {
        self.tangent = tangent;
        self
    }

    /// Format of `position`, as read by acceleration structure builds.
    pub const POSITION_FORMAT: vk::Format = vk::Format::R32G32B32_SFLOAT;

    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(Self::STRIDE)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 4] {
        [
            (0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            (1, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, normal)),
            (2, vk::Format::R32G32_SFLOAT, offset_of!(Self, uv)),
            (3, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, tangent)),
        ]
        .map(|(location, format, offset)| {
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(location)
                .format(format)
                .offset(offset as u32)
        })
    }
}

/// A compiled shader stage. Bytecode is supplied externally.
pub struct ShaderModule {
    ctx: Arc<GraphicsContext>,
    handle: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
}

impl ShaderModule {
    pub fn new(ctx: &Arc<GraphicsContext>, stage: vk::ShaderStageFlags, code: &[u32]) -> Result<Self> {
        let handle = ctx
            .device()
            .create_shader_module(code)
            .map_err(|e| GpuError::ShaderModule(format!("{stage:?}: {e}")))?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            handle,
            stage,
        })
    }

    /// Create from raw SPIR-V bytes.
    pub fn from_bytes(ctx: &Arc<GraphicsContext>, stage: vk::ShaderStageFlags, bytes: &[u8]) -> Result<Self> {
        let code = ash::util::read_spv(&mut std::io::Cursor::new(bytes))
            .map_err(|e| GpuError::ShaderModule(format!("{stage:?}: {e}")))?;
        Self::new(ctx, stage, &code)
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    /// Stage info with entry point `main`.
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage)
            .module(self.handle)
            .name(c"main")
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.ctx.device().destroy_shader_module(self.handle);
    }
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

/// Descriptor set layouts and push constant ranges of a pipeline.
pub struct PipelineLayout {
    ctx: Arc<GraphicsContext>,
    handle: vk::PipelineLayout,
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
}

impl PipelineLayout {
    pub fn new(
        ctx: &Arc<GraphicsContext>,
        set_layouts: &[Arc<DescriptorSetLayout>],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<Arc<Self>> {
        let handles: Vec<_> = set_layouts.iter().map(|l| l.handle()).collect();
        let handle = ctx
            .device()
            .create_pipeline_layout(&handles, push_constants)
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;
        Ok(Arc::new(Self {
            ctx: Arc::clone(ctx),
            handle,
            set_layouts: set_layouts.to_vec(),
        }))
    }

    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        self.ctx.device().destroy_pipeline_layout(self.handle);
    }
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("set_layouts", &self.set_layouts.len())
            .finish_non_exhaustive()
    }
}

/// Rasterization pipeline configuration.
#[derive(Debug, Clone)]
pub struct RasterizationPipelineCreateInfo {
    pub label: String,
    pub vertex_shader: Vec<u32>,
    pub fragment_shader: Vec<u32>,
    /// Fixed viewport and scissor.
    pub extent: vk::Extent2D,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
}

impl RasterizationPipelineCreateInfo {
    pub fn new(
        label: impl Into<String>,
        vertex_shader: Vec<u32>,
        fragment_shader: Vec<u32>,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            label: label.into(),
            vertex_shader,
            fragment_shader,
            extent,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
        }
    }
}

/// Graphics pipeline bound to a render pass and a fixed viewport.
#[derive(Debug)]
pub struct RasterizationPipeline {
    registration: Registration,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
    info: RasterizationPipelineCreateInfo,
}

impl RasterizationPipeline {
    /// Create a graphics pipeline for subpass 0 of `render_pass`.
    pub fn create(
        ctx: &Arc<GraphicsContext>,
        info: &RasterizationPipelineCreateInfo,
        render_pass: &RenderPass,
        layout: &Arc<PipelineLayout>,
    ) -> Result<Self> {
        let vertex = ShaderModule::new(ctx, vk::ShaderStageFlags::VERTEX, &info.vertex_shader)?;
        let fragment =
            ShaderModule::new(ctx, vk::ShaderStageFlags::FRAGMENT, &info.fragment_shader)?;
        let shader_stages = [vertex.stage_info(), fragment.stage_info()];

        let vertex_bindings = [Vertex::binding_description()];
        let vertex_attributes = Vertex::attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(info.topology)
            .primitive_restart_enable(false);

        let viewport = vk::Viewport::default()
            .width(info.extent.width as f32)
            .height(info.extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0);
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: info.extent,
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(std::slice::from_ref(&viewport))
            .scissors(std::slice::from_ref(&scissor));

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(info.polygon_mode)
            .cull_mode(info.cull_mode)
            .front_face(info.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(render_pass.samples())
            .sample_shading_enable(false);

        let depth_enabled = render_pass.has_depth();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth_enabled && info.depth_test)
            .depth_write_enable(depth_enabled && info.depth_write)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(std::slice::from_ref(&color_blend_attachment));

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .layout(layout.handle())
            .render_pass(render_pass.handle())
            .subpass(0);

        let handle = ctx.device().create_graphics_pipeline(&pipeline_info)?;
        // Modules are only needed during creation.
        drop((vertex, fragment));

        let registration = Registration::new(ctx, ResourceKind::Pipeline, info.label.clone())
            .and_then(|registration| {
                registration.depend_on(render_pass.resource_id())?;
                Ok(registration)
            });
        let registration = match registration {
            Ok(registration) => registration,
            Err(e) => {
                ctx.device().destroy_pipeline(handle);
                return Err(e);
            }
        };
        tracing::debug!(label = %info.label, extent = ?info.extent, "created rasterization pipeline");

        Ok(Self {
            registration,
            handle,
            layout: Arc::clone(layout),
            info: info.clone(),
        })
    }

    /// Build a replacement with a new viewport and drop this pipeline.
    ///
    /// The old pipeline must not be referenced by pending command buffers.
    pub fn recreate(self, render_pass: &RenderPass, extent: vk::Extent2D) -> Result<Self> {
        let ctx = Arc::clone(self.registration.context());
        let mut info = self.info.clone();
        info.extent = extent;
        let replacement = Self::create(&ctx, &info, render_pass, &self.layout)?;
        drop(self);
        Ok(replacement)
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.info.extent
    }

    pub fn resource_id(&self) -> ResourceId {
        self.registration.id()
    }

    /// False once its render pass was released.
    pub fn is_valid(&self) -> bool {
        self.registration.is_valid()
    }

    /// Record a bind of this pipeline.
    pub fn bind(&self, recorder: &mut CommandRecorder<'_>) {
        recorder.bind_pipeline(
            vk::PipelineBindPoint::GRAPHICS,
            self.handle,
            self.registration.id(),
        );
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.registration.release()?;
        self.destroy_native();
        Ok(())
    }

    fn destroy_native(&mut self) {
        if self.handle != vk::Pipeline::null() {
            self.registration
                .context()
                .device()
                .destroy_pipeline(self.handle);
            self.handle = vk::Pipeline::null();
        }
    }
}

impl Drop for RasterizationPipeline {
    fn drop(&mut self) {
        self.destroy_native();
    }
}
