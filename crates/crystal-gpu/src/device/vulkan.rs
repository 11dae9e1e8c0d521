//! Vulkan backend built on `ash` and `gpu-allocator`.

use std::ffi::CStr;

use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use super::{
    AccelerationBuild, AccelerationGeometry, AccelerationStructureSizes, BufferDesc,
    DescriptorWrite, Submission,
};
use crate::capabilities::{PhysicalDeviceInfo, QueueFamilies, RAY_TRACING_EXTENSIONS};
use crate::command::{Barrier, Command};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, find_queue_families, select_physical_device};
use crate::memory::{GpuAllocator, MemoryBlock};

/// Parameters of device creation.
#[derive(Debug, Clone)]
pub(crate) struct VulkanDeviceDesc<'a> {
    pub app_name: &'a str,
    pub app_version: u32,
    pub validation: bool,
    pub request_ray_tracing: bool,
}

/// A real Vulkan device.
pub struct VulkanDevice {
    // Entry must be kept alive for the lifetime of the device
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    allocator: Mutex<GpuAllocator>,
    acceleration_structure: Option<ash::khr::acceleration_structure::Device>,
    ray_tracing_pipeline: Option<ash::khr::ray_tracing_pipeline::Device>,
}

impl VulkanDevice {
    /// Create the instance, pick a physical device and negotiate features.
    ///
    /// Returns the device, its capability snapshot and whether ray tracing was
    /// enabled.
    pub(crate) fn create(desc: &VulkanDeviceDesc<'_>) -> Result<(Self, PhysicalDeviceInfo, bool)> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance =
            unsafe { create_instance(&entry, desc.app_name, desc.app_version, desc.validation) }?;

        let physical_device = unsafe { select_physical_device(&instance, desc.request_ray_tracing) }?;
        let queue_families = unsafe { find_queue_families(&instance, physical_device) }?;
        let info = unsafe { PhysicalDeviceInfo::query(&instance, physical_device, queue_families) };

        if !info.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }
        tracing::info!("Selected GPU: {}", info.summary());

        let enable_ray_tracing = desc.request_ray_tracing && info.supports_ray_tracing();
        let device = unsafe {
            create_logical_device(
                &instance,
                physical_device,
                &queue_families,
                enable_ray_tracing,
                info.sampler_anisotropy,
            )
        }?;

        let allocator = unsafe { GpuAllocator::new(&instance, &device, physical_device) }?;

        let (acceleration_structure, ray_tracing_pipeline) = if enable_ray_tracing {
            (
                Some(ash::khr::acceleration_structure::Device::new(&instance, &device)),
                Some(ash::khr::ray_tracing_pipeline::Device::new(&instance, &device)),
            )
        } else {
            (None, None)
        };

        Ok((
            Self {
                entry,
                instance,
                physical_device,
                device,
                allocator: Mutex::new(allocator),
                acceleration_structure,
                ray_tracing_pipeline,
            },
            info,
            enable_ray_tracing,
        ))
    }

    /// Raw `ash` device for code that needs functionality not wrapped here.
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    fn as_loader(&self) -> Result<&ash::khr::acceleration_structure::Device> {
        self.acceleration_structure
            .as_ref()
            .ok_or_else(|| GpuError::Unsupported("acceleration structures not enabled".to_string()))
    }

    fn rt_loader(&self) -> Result<&ash::khr::ray_tracing_pipeline::Device> {
        self.ray_tracing_pipeline
            .as_ref()
            .ok_or_else(|| GpuError::Unsupported("ray tracing pipelines not enabled".to_string()))
    }

    pub(super) fn queue(&self, family: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family, 0) }
    }

    pub(super) fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    pub(super) fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        unsafe { self.device.queue_wait_idle(queue)? };
        Ok(())
    }

    pub(super) fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<(vk::Buffer, MemoryBlock)> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(desc.sharing_mode);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation =
            match self
                .allocator
                .lock()
                .allocate(desc.label, requirements, desc.location, true)
            {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { self.device.destroy_buffer(buffer, None) };
                    return Err(e);
                }
            };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.destroy_buffer(buffer, MemoryBlock::Allocated(allocation));
            return Err(e.into());
        }

        Ok((buffer, MemoryBlock::Allocated(allocation)))
    }

    pub(super) fn destroy_buffer(&self, buffer: vk::Buffer, memory: MemoryBlock) {
        self.free_memory(memory);
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn free_memory(&self, memory: MemoryBlock) {
        if let MemoryBlock::Allocated(allocation) = memory {
            if let Err(e) = self.allocator.lock().free(allocation) {
                tracing::error!("Failed to free allocation: {e}");
            }
        }
    }

    pub(super) fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    pub(super) fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        location: MemoryLocation,
        label: &str,
    ) -> Result<(vk::Image, MemoryBlock)> {
        let image = unsafe { self.device.create_image(info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self
            .allocator
            .lock()
            .allocate(label, requirements, location, false)
        {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.destroy_image(image, MemoryBlock::Allocated(allocation));
            return Err(e.into());
        }

        Ok((image, MemoryBlock::Allocated(allocation)))
    }

    pub(super) fn destroy_image(&self, image: vk::Image, memory: MemoryBlock) {
        self.free_memory(memory);
        unsafe { self.device.destroy_image(image, None) };
    }

    pub(super) fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> Result<vk::ImageView> {
        Ok(unsafe { self.device.create_image_view(info, None)? })
    }

    pub(super) fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    pub(super) fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>) -> Result<vk::Sampler> {
        Ok(unsafe { self.device.create_sampler(info, None)? })
    }

    pub(super) fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    pub(super) fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        Ok(unsafe { self.device.create_command_pool(&create_info, None)? })
    }

    pub(super) fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    pub(super) fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        Ok(unsafe { self.device.allocate_command_buffers(&alloc_info)? })
    }

    pub(super) fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, buffers) };
    }

    pub(super) fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info)? };
        Ok(())
    }

    pub(super) fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd)? };
        Ok(())
    }

    pub(super) fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?
        };
        Ok(())
    }

    pub(super) fn record(&self, cmd: vk::CommandBuffer, command: &Command) {
        let device = &self.device;
        unsafe {
            match command {
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    extent,
                    clear_color,
                    clear_depth,
                } => {
                    let mut clear_values = vec![vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: *clear_color,
                        },
                    }];
                    if let Some(depth) = clear_depth {
                        clear_values.push(vk::ClearValue {
                            depth_stencil: vk::ClearDepthStencilValue {
                                depth: *depth,
                                stencil: 0,
                            },
                        });
                    }
                    let begin_info = vk::RenderPassBeginInfo::default()
                        .render_pass(*render_pass)
                        .framebuffer(*framebuffer)
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D::default(),
                            extent: *extent,
                        })
                        .clear_values(&clear_values);
                    device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
                }
                Command::EndRenderPass => device.cmd_end_render_pass(cmd),
                Command::BindPipeline {
                    bind_point,
                    pipeline,
                } => device.cmd_bind_pipeline(cmd, *bind_point, *pipeline),
                Command::BindDescriptorSet {
                    bind_point,
                    layout,
                    set_index,
                    set,
                } => device.cmd_bind_descriptor_sets(
                    cmd,
                    *bind_point,
                    *layout,
                    *set_index,
                    std::slice::from_ref(set),
                    &[],
                ),
                Command::BindVertexBuffer { buffer, offset } => device.cmd_bind_vertex_buffers(
                    cmd,
                    0,
                    std::slice::from_ref(buffer),
                    std::slice::from_ref(offset),
                ),
                Command::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => device.cmd_bind_index_buffer(cmd, *buffer, *offset, *index_type),
                Command::PushConstants {
                    layout,
                    stages,
                    offset,
                    data,
                } => device.cmd_push_constants(cmd, *layout, *stages, *offset, data),
                Command::Draw {
                    vertex_count,
                    instance_count,
                } => device.cmd_draw(cmd, *vertex_count, *instance_count, 0, 0),
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                } => device.cmd_draw_indexed(
                    cmd,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    0,
                ),
                Command::BuildAccelerationStructure(build) => match self.as_loader() {
                    Ok(loader) => record_build(loader, cmd, build),
                    Err(e) => tracing::error!("Dropping acceleration structure build: {e}"),
                },
                Command::Barrier(barrier) => record_barrier(device, cmd, barrier),
                Command::CopyBuffer { src, dst, regions } => {
                    device.cmd_copy_buffer(cmd, *src, *dst, regions)
                }
                Command::CopyBufferToImage {
                    src,
                    image,
                    extent,
                    aspect,
                } => {
                    let region = vk::BufferImageCopy::default()
                        .image_subresource(
                            vk::ImageSubresourceLayers::default()
                                .aspect_mask(*aspect)
                                .mip_level(0)
                                .base_array_layer(0)
                                .layer_count(1),
                        )
                        .image_extent(*extent);
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        *src,
                        *image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        std::slice::from_ref(&region),
                    );
                }
                Command::BlitImage {
                    image,
                    aspect,
                    src_level,
                    src_extent,
                    dst_level,
                    dst_extent,
                    filter,
                } => {
                    let corner = |extent: &vk::Extent2D| vk::Offset3D {
                        x: extent.width as i32,
                        y: extent.height as i32,
                        z: 1,
                    };
                    let layers = |level: u32| {
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(*aspect)
                            .mip_level(level)
                            .base_array_layer(0)
                            .layer_count(1)
                    };
                    let blit = vk::ImageBlit::default()
                        .src_subresource(layers(*src_level))
                        .src_offsets([vk::Offset3D::default(), corner(src_extent)])
                        .dst_subresource(layers(*dst_level))
                        .dst_offsets([vk::Offset3D::default(), corner(dst_extent)]);
                    device.cmd_blit_image(
                        cmd,
                        *image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        *image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        std::slice::from_ref(&blit),
                        *filter,
                    );
                }
                Command::TraceRays {
                    regions,
                    width,
                    height,
                    depth,
                } => match self.rt_loader() {
                    Ok(loader) => loader.cmd_trace_rays(
                        cmd,
                        &regions.raygen,
                        &regions.miss,
                        &regions.hit,
                        &regions.callable,
                        *width,
                        *height,
                        *depth,
                    ),
                    Err(e) => tracing::error!("Dropping trace rays: {e}"),
                },
            }
        }
    }

    pub(super) fn submit(&self, queue: vk::Queue, submission: &Submission<'_>) -> Result<()> {
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(submission.command_buffers)
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_stages)
            .signal_semaphores(submission.signal_semaphores);
        unsafe {
            self.device
                .queue_submit(queue, std::slice::from_ref(&submit_info), submission.fence)?
        };
        Ok(())
    }

    pub(super) fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&create_info, None)? })
    }

    pub(super) fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    pub(super) fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<()> {
        match unsafe { self.device.wait_for_fences(fences, true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout { timeout_ns }),
            Err(e) => Err(e.into()),
        }
    }

    pub(super) fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    pub(super) fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        unsafe { self.device.reset_fences(fences)? };
        Ok(())
    }

    pub(super) fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&create_info, None)? })
    }

    pub(super) fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    pub(super) fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        Ok(unsafe { self.device.create_descriptor_set_layout(&layout_info, None)? })
    }

    pub(super) fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    pub(super) fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
        Ok(unsafe { self.device.create_descriptor_pool(&create_info, None)? })
    }

    pub(super) fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    pub(super) fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(std::slice::from_ref(&layout));
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
        sets.into_iter()
            .next()
            .ok_or_else(|| GpuError::Allocation("descriptor pool returned no set".to_string()))
    }

    pub(super) fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        if let Err(e) = unsafe { self.device.free_descriptor_sets(pool, &[set]) } {
            tracing::error!("Failed to free descriptor set: {e}");
        }
    }

    pub(super) fn write_descriptor(&self, set: vk::DescriptorSet, binding: u32, write: &DescriptorWrite) {
        let base = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(write.descriptor_type());

        match *write {
            DescriptorWrite::Buffer {
                buffer,
                offset,
                range,
                ..
            } => {
                let info = vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(offset)
                    .range(range);
                let write = base.buffer_info(std::slice::from_ref(&info));
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
            DescriptorWrite::Image {
                view,
                layout,
                sampler,
                ..
            } => {
                let info = vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .image_layout(layout)
                    .sampler(sampler);
                let write = base.image_info(std::slice::from_ref(&info));
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
            DescriptorWrite::AccelerationStructure(structure) => {
                let mut as_write = vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(std::slice::from_ref(&structure));
                let write = base.descriptor_count(1).push_next(&mut as_write);
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
        }
    }

    pub(super) fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> Result<vk::RenderPass> {
        Ok(unsafe { self.device.create_render_pass(info, None)? })
    }

    pub(super) fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    pub(super) fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo<'_>) -> Result<vk::Framebuffer> {
        Ok(unsafe { self.device.create_framebuffer(info, None)? })
    }

    pub(super) fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    pub(super) fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|e| GpuError::ShaderModule(e.to_string()))
    }

    pub(super) fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    pub(super) fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constants);
        Ok(unsafe { self.device.create_pipeline_layout(&create_info, None)? })
    }

    pub(super) fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    pub(super) fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline> {
        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(info), None)
        }
        .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::PipelineCreation("no pipeline returned".to_string()))
    }

    pub(super) fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    pub(super) fn create_ray_tracing_pipeline(
        &self,
        info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline> {
        let pipelines = unsafe {
            self.rt_loader()?.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(info),
                None,
            )
        }
        .map_err(|e| GpuError::PipelineCreation(format!("Ray tracing pipeline: {e:?}")))?;
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::PipelineCreation("no pipeline returned".to_string()))
    }

    pub(super) fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        group_count: u32,
        handle_size: u32,
    ) -> Result<Vec<u8>> {
        let data_size = (handle_size * group_count) as usize;
        Ok(unsafe {
            self.rt_loader()?
                .get_ray_tracing_shader_group_handles(pipeline, 0, group_count, data_size)?
        })
    }

    pub(super) fn acceleration_structure_build_sizes(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        geometries: &[AccelerationGeometry],
    ) -> Result<AccelerationStructureSizes> {
        let loader = self.as_loader()?;
        let vk_geometries: Vec<_> = geometries.iter().map(vk_geometry).collect();
        let primitive_counts: Vec<u32> = geometries.iter().map(|g| g.primitive_count()).collect();

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ty)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&vk_geometries);

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &primitive_counts,
                &mut sizes,
            );
        }

        Ok(AccelerationStructureSizes {
            acceleration_structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        })
    }

    pub(super) fn create_acceleration_structure(
        &self,
        buffer: vk::Buffer,
        size: u64,
        ty: vk::AccelerationStructureTypeKHR,
    ) -> Result<vk::AccelerationStructureKHR> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer)
            .offset(0)
            .size(size)
            .ty(ty);
        Ok(unsafe { self.as_loader()?.create_acceleration_structure(&create_info, None)? })
    }

    pub(super) fn destroy_acceleration_structure(&self, structure: vk::AccelerationStructureKHR) {
        match self.as_loader() {
            Ok(loader) => unsafe { loader.destroy_acceleration_structure(structure, None) },
            Err(e) => tracing::error!("Cannot destroy acceleration structure: {e}"),
        }
    }

    pub(super) fn acceleration_structure_address(
        &self,
        structure: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        let Ok(loader) = self.as_loader() else {
            return 0;
        };
        let info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(structure);
        unsafe { loader.get_acceleration_structure_device_address(&info) }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Allocator must release its memory before the device goes away.
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn vk_geometry(geometry: &AccelerationGeometry) -> vk::AccelerationStructureGeometryKHR<'static> {
    match geometry {
        AccelerationGeometry::Triangles(t) => vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(if t.opaque {
                vk::GeometryFlagsKHR::OPAQUE
            } else {
                vk::GeometryFlagsKHR::empty()
            })
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(t.vertex_format)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: t.vertex_address,
                    })
                    .vertex_stride(t.vertex_stride)
                    .max_vertex(t.max_vertex)
                    .index_type(t.index_type)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: t.index_address,
                    }),
            }),
        AccelerationGeometry::Instances(i) => vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: i.instances_address,
                    }),
            }),
    }
}

unsafe fn record_build(
    loader: &ash::khr::acceleration_structure::Device,
    cmd: vk::CommandBuffer,
    build: &AccelerationBuild,
) {
    let geometries: Vec<_> = build.geometries.iter().map(vk_geometry).collect();
    let ranges: Vec<_> = build
        .geometries
        .iter()
        .map(|g| {
            vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(g.primitive_count())
                .primitive_offset(0)
                .first_vertex(0)
                .transform_offset(0)
        })
        .collect();

    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(build.ty)
        .flags(build.flags)
        .mode(build.mode)
        .src_acceleration_structure(build.src)
        .dst_acceleration_structure(build.dst)
        .geometries(&geometries)
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: build.scratch_address,
        });

    loader.cmd_build_acceleration_structures(
        cmd,
        std::slice::from_ref(&build_info),
        &[ranges.as_slice()],
    );
}

unsafe fn record_barrier(device: &ash::Device, cmd: vk::CommandBuffer, barrier: &Barrier) {
    match *barrier {
        Barrier::Memory {
            src_stage,
            src_access,
            dst_stage,
            dst_access,
        } => {
            let memory_barrier = vk::MemoryBarrier2::default()
                .src_stage_mask(src_stage)
                .src_access_mask(src_access)
                .dst_stage_mask(dst_stage)
                .dst_access_mask(dst_access);
            let dependency_info = vk::DependencyInfo::default()
                .memory_barriers(std::slice::from_ref(&memory_barrier));
            device.cmd_pipeline_barrier2(cmd, &dependency_info);
        }
        Barrier::Image(image) => {
            let image_barrier = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(image.src_stage)
                .src_access_mask(image.src_access)
                .dst_stage_mask(image.dst_stage)
                .dst_access_mask(image.dst_access)
                .old_layout(image.old_layout)
                .new_layout(image.new_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.image)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(image.aspect)
                        .base_mip_level(image.base_mip_level)
                        .level_count(image.mip_levels)
                        .base_array_layer(0)
                        .layer_count(1),
                );
            let dependency_info = vk::DependencyInfo::default()
                .image_memory_barriers(std::slice::from_ref(&image_barrier));
            device.cmd_pipeline_barrier2(cmd, &dependency_info);
        }
    }
}

/// Create the logical device, enabling ray tracing features when requested.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: &QueueFamilies,
    enable_ray_tracing: bool,
    enable_anisotropy: bool,
) -> Result<ash::Device> {
    let mut unique_families = std::collections::HashSet::new();
    unique_families.insert(queue_families.graphics);
    unique_families.insert(queue_families.compute);
    unique_families.insert(queue_families.transfer);

    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extensions: Vec<&CStr> = if enable_ray_tracing {
        RAY_TRACING_EXTENSIONS.to_vec()
    } else {
        Vec::new()
    };
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .maintenance4(true);

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .scalar_block_layout(true);

    let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
        .acceleration_structure(true);
    let mut rt_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

    let features = vk::PhysicalDeviceFeatures::default()
        .shader_int64(true)
        .sampler_anisotropy(enable_anisotropy);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);
    if enable_ray_tracing {
        features2 = features2.push_next(&mut as_features).push_next(&mut rt_features);
    }

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)
}
