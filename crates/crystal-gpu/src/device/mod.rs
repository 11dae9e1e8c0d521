//! Device backends.
//!
//! Every manager talks to the GPU through [`Device`]. The Vulkan variant wraps
//! an `ash` device; the headless variant fabricates handles and simulates
//! memory pressure, fences and device loss so the resource state machines can
//! run without a GPU.

mod headless;
pub(crate) mod vulkan;

pub use headless::HeadlessDevice;
pub use vulkan::VulkanDevice;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::command::Command;
use crate::error::Result;
use crate::memory::MemoryBlock;

/// Triangle geometry for a bottom-level acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_stride: u64,
    pub vertex_format: vk::Format,
    pub max_vertex: u32,
    pub index_address: vk::DeviceAddress,
    pub index_type: vk::IndexType,
    pub triangle_count: u32,
    pub opaque: bool,
}

/// Instance array for a top-level acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceGeometry {
    pub instances_address: vk::DeviceAddress,
    pub instance_count: u32,
}

/// Geometry input of an acceleration structure build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AccelerationGeometry {
    Triangles(TriangleGeometry),
    Instances(InstanceGeometry),
}

impl AccelerationGeometry {
    pub fn primitive_count(&self) -> u32 {
        match self {
            Self::Triangles(t) => t.triangle_count,
            Self::Instances(i) => i.instance_count,
        }
    }
}

/// A recorded acceleration structure build.
#[derive(Debug, Clone, PartialEq)]
pub struct AccelerationBuild {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub mode: vk::BuildAccelerationStructureModeKHR,
    /// Source structure for updates, null for full builds.
    pub src: vk::AccelerationStructureKHR,
    pub dst: vk::AccelerationStructureKHR,
    pub scratch_address: vk::DeviceAddress,
    pub geometries: Vec<AccelerationGeometry>,
}

/// Sizes reported for an acceleration structure build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerationStructureSizes {
    pub acceleration_structure_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

/// One descriptor write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DescriptorWrite {
    Buffer {
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Image {
        ty: vk::DescriptorType,
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl DescriptorWrite {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::Buffer { ty, .. } | Self::Image { ty, .. } => *ty,
            Self::AccelerationStructure(_) => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

/// Parameters of a native buffer allocation.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub sharing_mode: vk::SharingMode,
}

/// A queue submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
    pub fence: vk::Fence,
}

/// Tagged device backend.
pub enum Device {
    Vulkan(VulkanDevice),
    Headless(HeadlessDevice),
}

macro_rules! dispatch {
    ($self:ident, $dev:ident => $body:expr) => {
        match $self {
            Device::Vulkan($dev) => $body,
            Device::Headless($dev) => $body,
        }
    };
}

/// Handles passed to these methods must have been created by the same device
/// and must not be in use by pending GPU work when destroyed.
impl Device {
    /// The headless backend, when this device is simulated.
    pub fn as_headless(&self) -> Option<&HeadlessDevice> {
        match self {
            Self::Headless(dev) => Some(dev),
            Self::Vulkan(_) => None,
        }
    }

    pub fn is_headless(&self) -> bool {
        matches!(self, Self::Headless(_))
    }

    pub fn queue(&self, family: u32) -> vk::Queue {
        dispatch!(self, d => d.queue(family))
    }

    pub fn wait_idle(&self) -> Result<()> {
        dispatch!(self, d => d.wait_idle())
    }

    pub fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        dispatch!(self, d => d.queue_wait_idle(queue))
    }

    // Memory

    pub fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<(vk::Buffer, MemoryBlock)> {
        dispatch!(self, d => d.create_buffer(desc))
    }

    pub fn destroy_buffer(&self, buffer: vk::Buffer, memory: MemoryBlock) {
        dispatch!(self, d => d.destroy_buffer(buffer, memory))
    }

    pub fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        dispatch!(self, d => d.buffer_device_address(buffer))
    }

    pub fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        location: MemoryLocation,
        label: &str,
    ) -> Result<(vk::Image, MemoryBlock)> {
        dispatch!(self, d => d.create_image(info, location, label))
    }

    pub fn destroy_image(&self, image: vk::Image, memory: MemoryBlock) {
        dispatch!(self, d => d.destroy_image(image, memory))
    }

    pub fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> Result<vk::ImageView> {
        dispatch!(self, d => d.create_image_view(info))
    }

    pub fn destroy_image_view(&self, view: vk::ImageView) {
        dispatch!(self, d => d.destroy_image_view(view))
    }

    pub fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>) -> Result<vk::Sampler> {
        dispatch!(self, d => d.create_sampler(info))
    }

    pub fn destroy_sampler(&self, sampler: vk::Sampler) {
        dispatch!(self, d => d.destroy_sampler(sampler))
    }

    // Commands

    pub fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        dispatch!(self, d => d.create_command_pool(queue_family))
    }

    pub fn destroy_command_pool(&self, pool: vk::CommandPool) {
        dispatch!(self, d => d.destroy_command_pool(pool))
    }

    pub fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        dispatch!(self, d => d.allocate_command_buffers(pool, count))
    }

    pub fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        dispatch!(self, d => d.free_command_buffers(pool, buffers))
    }

    pub fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        dispatch!(self, d => d.begin_command_buffer(cmd, flags))
    }

    pub fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        dispatch!(self, d => d.end_command_buffer(cmd))
    }

    pub fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        dispatch!(self, d => d.reset_command_buffer(cmd))
    }

    pub fn record(&self, cmd: vk::CommandBuffer, command: &Command) {
        dispatch!(self, d => d.record(cmd, command))
    }

    pub fn submit(&self, queue: vk::Queue, submission: &Submission<'_>) -> Result<()> {
        dispatch!(self, d => d.submit(queue, submission))
    }

    // Synchronization

    pub fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        dispatch!(self, d => d.create_fence(signaled))
    }

    pub fn destroy_fence(&self, fence: vk::Fence) {
        dispatch!(self, d => d.destroy_fence(fence))
    }

    pub fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<()> {
        dispatch!(self, d => d.wait_for_fences(fences, timeout_ns))
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        dispatch!(self, d => d.fence_signaled(fence))
    }

    pub fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        dispatch!(self, d => d.reset_fences(fences))
    }

    pub fn create_semaphore(&self) -> Result<vk::Semaphore> {
        dispatch!(self, d => d.create_semaphore())
    }

    pub fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        dispatch!(self, d => d.destroy_semaphore(semaphore))
    }

    // Descriptors

    pub fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        dispatch!(self, d => d.create_descriptor_set_layout(bindings))
    }

    pub fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        dispatch!(self, d => d.destroy_descriptor_set_layout(layout))
    }

    pub fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        dispatch!(self, d => d.create_descriptor_pool(sizes, max_sets))
    }

    pub fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        dispatch!(self, d => d.destroy_descriptor_pool(pool))
    }

    pub fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        dispatch!(self, d => d.allocate_descriptor_set(pool, layout))
    }

    pub fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        dispatch!(self, d => d.free_descriptor_set(pool, set))
    }

    pub fn write_descriptor(&self, set: vk::DescriptorSet, binding: u32, write: &DescriptorWrite) {
        dispatch!(self, d => d.write_descriptor(set, binding, write))
    }

    // Render passes and pipelines

    pub fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> Result<vk::RenderPass> {
        dispatch!(self, d => d.create_render_pass(info))
    }

    pub fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        dispatch!(self, d => d.destroy_render_pass(render_pass))
    }

    pub fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo<'_>) -> Result<vk::Framebuffer> {
        dispatch!(self, d => d.create_framebuffer(info))
    }

    pub fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        dispatch!(self, d => d.destroy_framebuffer(framebuffer))
    }

    pub fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        dispatch!(self, d => d.create_shader_module(code))
    }

    pub fn destroy_shader_module(&self, module: vk::ShaderModule) {
        dispatch!(self, d => d.destroy_shader_module(module))
    }

    pub fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        dispatch!(self, d => d.create_pipeline_layout(set_layouts, push_constants))
    }

    pub fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        dispatch!(self, d => d.destroy_pipeline_layout(layout))
    }

    pub fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline> {
        dispatch!(self, d => d.create_graphics_pipeline(info))
    }

    pub fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        dispatch!(self, d => d.destroy_pipeline(pipeline))
    }

    // Ray tracing

    /// Create a ray tracing pipeline. Fails with `Unsupported` unless ray
    /// tracing was negotiated at context creation.
    pub fn create_ray_tracing_pipeline(
        &self,
        info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline> {
        dispatch!(self, d => d.create_ray_tracing_pipeline(info))
    }

    /// Raw shader group handles, `handle_size` bytes per group.
    pub fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        group_count: u32,
        handle_size: u32,
    ) -> Result<Vec<u8>> {
        dispatch!(self, d => d.shader_group_handles(pipeline, group_count, handle_size))
    }

    pub fn acceleration_structure_build_sizes(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        geometries: &[AccelerationGeometry],
    ) -> Result<AccelerationStructureSizes> {
        dispatch!(self, d => d.acceleration_structure_build_sizes(ty, geometries))
    }

    pub fn create_acceleration_structure(
        &self,
        buffer: vk::Buffer,
        size: u64,
        ty: vk::AccelerationStructureTypeKHR,
    ) -> Result<vk::AccelerationStructureKHR> {
        dispatch!(self, d => d.create_acceleration_structure(buffer, size, ty))
    }

    pub fn destroy_acceleration_structure(&self, structure: vk::AccelerationStructureKHR) {
        dispatch!(self, d => d.destroy_acceleration_structure(structure))
    }

    pub fn acceleration_structure_address(
        &self,
        structure: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        dispatch!(self, d => d.acceleration_structure_address(structure))
    }
}
