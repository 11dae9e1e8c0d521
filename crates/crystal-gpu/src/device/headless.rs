//! Simulated device.
//!
//! Handles are fabricated from a counter, buffer contents live in host memory
//! and submissions complete when a fence is waited on (or when
//! [`HeadlessDevice::complete_all`] is called). Failure modes are injected
//! through the `set_*`/`lose_device` hooks.

use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{
    AccelerationGeometry, AccelerationStructureSizes, BufferDesc, DescriptorWrite, Submission,
};
use crate::command::Command;
use crate::error::{GpuError, Result};
use crate::memory::MemoryBlock;

const ADDRESS_ALIGNMENT: u64 = 256;

#[derive(Debug, Clone, Copy)]
struct LiveObject {
    kind: &'static str,
    bytes: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct FenceState {
    signaled: bool,
    pending: bool,
}

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    next_address: u64,
    live: HashMap<u64, LiveObject>,
    addresses: HashMap<u64, vk::DeviceAddress>,
    fences: HashMap<u64, FenceState>,
    memory_used: u64,
    memory_budget: Option<u64>,
    stalled: bool,
    lost: bool,
    submissions: u64,
    recorded: u64,
}

impl State {
    fn create(&mut self, kind: &'static str, bytes: u64) -> u64 {
        self.next_handle += 1;
        let raw = self.next_handle;
        self.live.insert(raw, LiveObject { kind, bytes });
        raw
    }

    fn destroy(&mut self, raw: u64, kind: &'static str) {
        match self.live.remove(&raw) {
            Some(object) => {
                self.memory_used = self.memory_used.saturating_sub(object.bytes);
                self.addresses.remove(&raw);
            }
            None if raw == 0 => {}
            None => tracing::warn!(raw, kind, "destroying unknown or already destroyed handle"),
        }
    }

    fn reserve(&mut self, bytes: u64) -> Result<()> {
        if let Some(budget) = self.memory_budget {
            if self.memory_used + bytes > budget {
                return Err(GpuError::Allocation(format!(
                    "out of device memory: {} + {bytes} > {budget} bytes",
                    self.memory_used
                )));
            }
        }
        self.memory_used += bytes;
        Ok(())
    }

    fn assign_address(&mut self, raw: u64, bytes: u64) -> vk::DeviceAddress {
        let address = ADDRESS_ALIGNMENT + self.next_address;
        self.next_address += bytes.max(1).div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT;
        self.addresses.insert(raw, address);
        address
    }

    fn check_lost(&self) -> Result<()> {
        if self.lost {
            Err(GpuError::DeviceLost)
        } else {
            Ok(())
        }
    }
}

/// Device that runs without a GPU.
#[derive(Debug)]
pub struct HeadlessDevice {
    state: Mutex<State>,
    ray_tracing: bool,
}

impl HeadlessDevice {
    pub(crate) fn new(ray_tracing: bool) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ray_tracing,
        }
    }

    /// Limit total simulated memory. `None` removes the limit.
    pub fn set_memory_budget(&self, bytes: Option<u64>) {
        self.state.lock().memory_budget = bytes;
    }

    /// Bytes currently held by buffers, images and acceleration structures.
    pub fn memory_used(&self) -> u64 {
        self.state.lock().memory_used
    }

    /// While stalled, fence waits on pending work time out.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Simulate device loss. Every later wait or submit fails with `DeviceLost`.
    pub fn lose_device(&self) {
        tracing::warn!("Simulating device loss");
        self.state.lock().lost = true;
    }

    /// Finish every pending submission and signal its fence.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        for fence in state.fences.values_mut() {
            if fence.pending {
                fence.pending = false;
                fence.signaled = true;
            }
        }
    }

    /// Number of live native objects, for leak checks.
    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Number of live native objects of one kind, e.g. `"buffer"`.
    pub fn live_objects_of(&self, kind: &str) -> usize {
        self.state
            .lock()
            .live
            .values()
            .filter(|object| object.kind == kind)
            .count()
    }

    pub fn submissions(&self) -> u64 {
        self.state.lock().submissions
    }

    /// Number of commands recorded into any command buffer.
    pub fn recorded_commands(&self) -> u64 {
        self.state.lock().recorded
    }

    fn require_ray_tracing(&self) -> Result<()> {
        if self.ray_tracing {
            Ok(())
        } else {
            Err(GpuError::Unsupported("ray tracing not enabled".to_string()))
        }
    }

    fn create_plain<H: Handle>(&self, kind: &'static str) -> H {
        H::from_raw(self.state.lock().create(kind, 0))
    }

    pub(super) fn queue(&self, family: u32) -> vk::Queue {
        vk::Queue::from_raw(0x8000_0000 + u64::from(family))
    }

    pub(super) fn wait_idle(&self) -> Result<()> {
        self.state.lock().check_lost()?;
        self.complete_all();
        Ok(())
    }

    pub(super) fn queue_wait_idle(&self, _queue: vk::Queue) -> Result<()> {
        self.wait_idle()
    }

    pub(super) fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<(vk::Buffer, MemoryBlock)> {
        let size = usize::try_from(desc.size)
            .map_err(|_| GpuError::Allocation(format!("buffer too large: {}", desc.size)))?;
        let mut state = self.state.lock();
        state.reserve(desc.size)?;
        let raw = state.create("buffer", desc.size);
        if desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            state.assign_address(raw, desc.size);
        }
        Ok((vk::Buffer::from_raw(raw), MemoryBlock::Host(vec![0; size])))
    }

    pub(super) fn destroy_buffer(&self, buffer: vk::Buffer, _memory: MemoryBlock) {
        self.state.lock().destroy(buffer.as_raw(), "buffer");
    }

    pub(super) fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        self.state
            .lock()
            .addresses
            .get(&buffer.as_raw())
            .copied()
            .unwrap_or(0)
    }

    pub(super) fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        _location: MemoryLocation,
        _label: &str,
    ) -> Result<(vk::Image, MemoryBlock)> {
        let extent = info.extent;
        let bytes = u64::from(extent.width)
            * u64::from(extent.height)
            * u64::from(extent.depth.max(1))
            * u64::from(info.array_layers.max(1))
            * 4;
        let mut state = self.state.lock();
        state.reserve(bytes)?;
        let raw = state.create("image", bytes);
        Ok((vk::Image::from_raw(raw), MemoryBlock::Host(Vec::new())))
    }

    pub(super) fn destroy_image(&self, image: vk::Image, _memory: MemoryBlock) {
        self.state.lock().destroy(image.as_raw(), "image");
    }

    pub(super) fn create_image_view(&self, _info: &vk::ImageViewCreateInfo<'_>) -> Result<vk::ImageView> {
        Ok(self.create_plain("image_view"))
    }

    pub(super) fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().destroy(view.as_raw(), "image_view");
    }

    pub(super) fn create_sampler(&self, _info: &vk::SamplerCreateInfo<'_>) -> Result<vk::Sampler> {
        Ok(self.create_plain("sampler"))
    }

    pub(super) fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state.lock().destroy(sampler.as_raw(), "sampler");
    }

    pub(super) fn create_command_pool(&self, _queue_family: u32) -> Result<vk::CommandPool> {
        Ok(self.create_plain("command_pool"))
    }

    pub(super) fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.state.lock().destroy(pool.as_raw(), "command_pool");
    }

    pub(super) fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        Ok((0..count)
            .map(|_| self.create_plain("command_buffer"))
            .collect())
    }

    pub(super) fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for buffer in buffers {
            state.destroy(buffer.as_raw(), "command_buffer");
        }
    }

    pub(super) fn begin_command_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        self.state.lock().check_lost()
    }

    pub(super) fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    pub(super) fn reset_command_buffer(&self, _cmd: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    pub(super) fn record(&self, _cmd: vk::CommandBuffer, command: &Command) {
        tracing::trace!(?command, "headless record");
        self.state.lock().recorded += 1;
    }

    pub(super) fn submit(&self, _queue: vk::Queue, submission: &Submission<'_>) -> Result<()> {
        let mut state = self.state.lock();
        state.check_lost()?;
        state.submissions += 1;
        if submission.fence != vk::Fence::null() {
            let fence = state
                .fences
                .get_mut(&submission.fence.as_raw())
                .ok_or_else(|| GpuError::InvalidState("submit with unknown fence".to_string()))?;
            fence.signaled = false;
            fence.pending = true;
        }
        Ok(())
    }

    pub(super) fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.create("fence", 0);
        state.fences.insert(
            raw,
            FenceState {
                signaled,
                pending: false,
            },
        );
        Ok(vk::Fence::from_raw(raw))
    }

    pub(super) fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence.as_raw());
        state.destroy(fence.as_raw(), "fence");
    }

    pub(super) fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.check_lost()?;
        let stalled = state.stalled;
        for fence in fences {
            let fence_state = state
                .fences
                .get_mut(&fence.as_raw())
                .ok_or_else(|| GpuError::InvalidState("wait on unknown fence".to_string()))?;
            if fence_state.signaled {
                continue;
            }
            if !fence_state.pending || stalled {
                return Err(GpuError::Timeout { timeout_ns });
            }
            fence_state.pending = false;
            fence_state.signaled = true;
        }
        Ok(())
    }

    pub(super) fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        let state = self.state.lock();
        state.check_lost()?;
        state
            .fences
            .get(&fence.as_raw())
            .map(|f| f.signaled)
            .ok_or_else(|| GpuError::InvalidState("query of unknown fence".to_string()))
    }

    pub(super) fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        let mut state = self.state.lock();
        for fence in fences {
            if let Some(fence_state) = state.fences.get_mut(&fence.as_raw()) {
                fence_state.signaled = false;
            }
        }
        Ok(())
    }

    pub(super) fn create_semaphore(&self) -> Result<vk::Semaphore> {
        Ok(self.create_plain("semaphore"))
    }

    pub(super) fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().destroy(semaphore.as_raw(), "semaphore");
    }

    pub(super) fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        Ok(self.create_plain("descriptor_set_layout"))
    }

    pub(super) fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state
            .lock()
            .destroy(layout.as_raw(), "descriptor_set_layout");
    }

    pub(super) fn create_descriptor_pool(
        &self,
        _sizes: &[vk::DescriptorPoolSize],
        _max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        Ok(self.create_plain("descriptor_pool"))
    }

    pub(super) fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state.lock().destroy(pool.as_raw(), "descriptor_pool");
    }

    pub(super) fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        Ok(self.create_plain("descriptor_set"))
    }

    pub(super) fn free_descriptor_set(&self, _pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        self.state.lock().destroy(set.as_raw(), "descriptor_set");
    }

    pub(super) fn write_descriptor(&self, set: vk::DescriptorSet, binding: u32, write: &DescriptorWrite) {
        tracing::trace!(set = set.as_raw(), binding, ?write, "headless descriptor write");
    }

    pub(super) fn create_render_pass(&self, _info: &vk::RenderPassCreateInfo<'_>) -> Result<vk::RenderPass> {
        Ok(self.create_plain("render_pass"))
    }

    pub(super) fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state.lock().destroy(render_pass.as_raw(), "render_pass");
    }

    pub(super) fn create_framebuffer(&self, _info: &vk::FramebufferCreateInfo<'_>) -> Result<vk::Framebuffer> {
        Ok(self.create_plain("framebuffer"))
    }

    pub(super) fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state.lock().destroy(framebuffer.as_raw(), "framebuffer");
    }

    pub(super) fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        if code.is_empty() {
            return Err(GpuError::ShaderModule("empty SPIR-V".to_string()));
        }
        Ok(self.create_plain("shader_module"))
    }

    pub(super) fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state.lock().destroy(module.as_raw(), "shader_module");
    }

    pub(super) fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        Ok(self.create_plain("pipeline_layout"))
    }

    pub(super) fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state.lock().destroy(layout.as_raw(), "pipeline_layout");
    }

    pub(super) fn create_graphics_pipeline(
        &self,
        _info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline> {
        Ok(self.create_plain("pipeline"))
    }

    pub(super) fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.lock().destroy(pipeline.as_raw(), "pipeline");
    }

    pub(super) fn create_ray_tracing_pipeline(
        &self,
        _info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline> {
        self.require_ray_tracing()?;
        Ok(self.create_plain("pipeline"))
    }

    /// Handles are derived from the pipeline handle and group index, so two
    /// pipelines never share handle bytes.
    pub(super) fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        group_count: u32,
        handle_size: u32,
    ) -> Result<Vec<u8>> {
        self.require_ray_tracing()?;
        let mut data = Vec::with_capacity((group_count * handle_size) as usize);
        for group in 0..group_count {
            let seed = (pipeline.as_raw() << 16) | u64::from(group);
            let bytes = seed.to_le_bytes();
            data.extend((0..handle_size as usize).map(|i| bytes[i % bytes.len()]));
        }
        Ok(data)
    }

    pub(super) fn acceleration_structure_build_sizes(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        geometries: &[AccelerationGeometry],
    ) -> Result<AccelerationStructureSizes> {
        self.require_ray_tracing()?;
        let primitives: u64 = geometries.iter().map(|g| u64::from(g.primitive_count())).sum();
        let per_primitive = if ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL {
            128
        } else {
            64
        };
        Ok(AccelerationStructureSizes {
            acceleration_structure_size: 256 + primitives * per_primitive,
            build_scratch_size: 128 + primitives * 32,
            update_scratch_size: 64 + primitives * 16,
        })
    }

    pub(super) fn create_acceleration_structure(
        &self,
        _buffer: vk::Buffer,
        size: u64,
        _ty: vk::AccelerationStructureTypeKHR,
    ) -> Result<vk::AccelerationStructureKHR> {
        self.require_ray_tracing()?;
        let mut state = self.state.lock();
        // Storage is owned by the backing buffer.
        let raw = state.create("acceleration_structure", 0);
        state.assign_address(raw, size);
        Ok(vk::AccelerationStructureKHR::from_raw(raw))
    }

    pub(super) fn destroy_acceleration_structure(&self, structure: vk::AccelerationStructureKHR) {
        self.state
            .lock()
            .destroy(structure.as_raw(), "acceleration_structure");
    }

    pub(super) fn acceleration_structure_address(
        &self,
        structure: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        self.state
            .lock()
            .addresses
            .get(&structure.as_raw())
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_desc(size: u64) -> BufferDesc<'static> {
        BufferDesc {
            label: "test",
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::GpuOnly,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
        }
    }

    #[test]
    fn budget_exhaustion_is_an_allocation_error() {
        let device = HeadlessDevice::new(false);
        device.set_memory_budget(Some(1024));
        let (buffer, memory) = device.create_buffer(&buffer_desc(1000)).unwrap();
        let err = device.create_buffer(&buffer_desc(100)).unwrap_err();
        assert!(err.is_allocation());

        device.destroy_buffer(buffer, memory);
        assert_eq!(device.memory_used(), 0);
        assert!(device.create_buffer(&buffer_desc(100)).is_ok());
    }

    #[test]
    fn addresses_are_distinct_and_aligned() {
        let device = HeadlessDevice::new(false);
        let (a, _) = device.create_buffer(&buffer_desc(10)).unwrap();
        let (b, _) = device.create_buffer(&buffer_desc(10)).unwrap();
        let addr_a = device.buffer_device_address(a);
        let addr_b = device.buffer_device_address(b);
        assert_ne!(addr_a, addr_b);
        assert_eq!(addr_a % ADDRESS_ALIGNMENT, 0);
        assert_eq!(addr_b % ADDRESS_ALIGNMENT, 0);
    }

    #[test]
    fn fence_completes_on_wait_unless_stalled() {
        let device = HeadlessDevice::new(false);
        let fence = device.create_fence(false).unwrap();
        let submission = Submission {
            fence,
            ..Default::default()
        };
        device.submit(vk::Queue::null(), &submission).unwrap();
        assert!(!device.fence_signaled(fence).unwrap());

        device.set_stalled(true);
        assert!(matches!(
            device.wait_for_fences(&[fence], 5),
            Err(GpuError::Timeout { timeout_ns: 5 })
        ));

        device.set_stalled(false);
        device.wait_for_fences(&[fence], 5).unwrap();
        assert!(device.fence_signaled(fence).unwrap());
    }

    #[test]
    fn device_loss_is_distinct_from_timeout() {
        let device = HeadlessDevice::new(false);
        let fence = device.create_fence(false).unwrap();
        device.lose_device();
        assert!(matches!(
            device.wait_for_fences(&[fence], 5),
            Err(GpuError::DeviceLost)
        ));
        assert!(matches!(
            device.submit(vk::Queue::null(), &Submission::default()),
            Err(GpuError::DeviceLost)
        ));
    }

    #[test]
    fn ray_tracing_calls_require_negotiation() {
        let device = HeadlessDevice::new(false);
        assert!(matches!(
            device.shader_group_handles(vk::Pipeline::null(), 3, 32),
            Err(GpuError::Unsupported(_))
        ));
    }

    #[test]
    fn destroyed_objects_leave_no_live_handles() {
        let device = HeadlessDevice::new(true);
        let fence = device.create_fence(true).unwrap();
        let semaphore = device.create_semaphore().unwrap();
        assert_eq!(device.live_objects(), 2);
        device.destroy_fence(fence);
        device.destroy_semaphore(semaphore);
        assert_eq!(device.live_objects(), 0);
    }
}
