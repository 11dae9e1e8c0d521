//! Command buffer management.
//!
//! Each buffer follows `Initial -> Recording -> Executable -> Pending`, and
//! returns to `Initial` once its fence is observed signaled. Recording goes
//! through a [`CommandRecorder`], which forwards every command to the device
//! and keeps an in-order log plus the set of resources referenced, so
//! submission can reject buffers that captured released or rebuilt resources.

use std::sync::Arc;

use ash::vk;
use hashbrown::HashSet;

use crate::buffer::GpuBuffer;
use crate::context::GraphicsContext;
use crate::descriptors::DescriptorSet;
use crate::device::{AccelerationBuild, Submission};
use crate::error::{GpuError, Result};
use crate::graph::ResourceId;
use crate::image::GpuImage;
use crate::render_pass::{Framebuffer, RenderPass};
use crate::resource::GpuAllocatable;
use crate::sync::{Fence, DEFAULT_FENCE_TIMEOUT_NS};

/// Device regions of a shader binding table, one per group kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShaderBindingRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Layout transition of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip_level: u32,
    /// Number of levels from `base_mip_level`.
    pub mip_levels: u32,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

/// A pipeline barrier, recorded exactly where it is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    Memory {
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    },
    Image(ImageBarrier),
}

impl Barrier {
    /// Orders acceleration structure builds before later builds and traces
    /// that read them.
    pub fn acceleration_structure_build() -> Self {
        Self::Memory {
            src_stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            src_access: vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            dst_stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            dst_access: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        }
    }

    /// Orders transfer writes before shader reads.
    pub fn transfer_to_shader_read() -> Self {
        Self::Memory {
            src_stage: vk::PipelineStageFlags2::TRANSFER,
            src_access: vk::AccessFlags2::TRANSFER_WRITE,
            dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_access: vk::AccessFlags2::SHADER_READ,
        }
    }

    /// Layout transition with stages and access masks derived from the layouts.
    pub fn image_layout(
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        let (src_stage, src_access) = layout_scope(old_layout);
        let (dst_stage, dst_access) = layout_scope(new_layout);
        Self::Image(ImageBarrier {
            image,
            old_layout,
            new_layout,
            aspect,
            base_mip_level: 0,
            mip_levels: mip_levels.max(1),
            src_stage,
            src_access,
            dst_stage,
            dst_access,
        })
    }

    /// Layout transition of the single mip level `level`.
    pub fn mip_level_layout(
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        level: u32,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        match Self::image_layout(image, aspect, 1, old_layout, new_layout) {
            Self::Image(barrier) => Self::Image(ImageBarrier {
                base_mip_level: level,
                ..barrier
            }),
            memory => memory,
        }
    }

    /// Whether this barrier makes acceleration structure writes visible.
    pub fn is_acceleration_structure_build(&self) -> bool {
        match self {
            Self::Memory { src_access, .. } => {
                src_access.contains(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
            }
            Self::Image(_) => false,
        }
    }
}

fn layout_scope(layout: vk::ImageLayout) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        vk::ImageLayout::UNDEFINED => (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags2::FRAGMENT_SHADER
                | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            vk::AccessFlags2::SHADER_READ,
        ),
        vk::ImageLayout::GENERAL => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::AccessFlags2::NONE,
        ),
        _ => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        ),
    }
}

/// A recorded GPU operation.
#[derive(Debug, Clone)]
pub enum Command {
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
        clear_depth: Option<f32>,
    },
    EndRenderPass,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSet {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    },
    BindVertexBuffer {
        buffer: vk::Buffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
    },
    BuildAccelerationStructure(AccelerationBuild),
    Barrier(Barrier),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        image: vk::Image,
        extent: vk::Extent3D,
        aspect: vk::ImageAspectFlags,
    },
    /// Blit between two mip levels of one image, `src_level` in
    /// `TRANSFER_SRC_OPTIMAL` and `dst_level` in `TRANSFER_DST_OPTIMAL`.
    BlitImage {
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        src_level: u32,
        src_extent: vk::Extent2D,
        dst_level: u32,
        dst_extent: vk::Extent2D,
        filter: vk::Filter,
    },
    TraceRays {
        regions: ShaderBindingRegions,
        width: u32,
        height: u32,
        depth: u32,
    },
}

/// Execution state of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    /// Submitted; the GPU may still be executing it.
    Pending,
    /// Recording failed or a referenced resource went away.
    Invalid,
}

/// Records commands into one command buffer.
///
/// Commands are recorded in call order; no barrier is inferred or moved.
pub struct CommandRecorder<'a> {
    ctx: &'a GraphicsContext,
    cmd: vk::CommandBuffer,
    commands: Vec<Command>,
    references: HashSet<ResourceId>,
    unsynchronized_build: bool,
}

impl<'a> CommandRecorder<'a> {
    fn new(ctx: &'a GraphicsContext, cmd: vk::CommandBuffer) -> Self {
        Self {
            ctx,
            cmd,
            commands: Vec::new(),
            references: HashSet::new(),
            unsynchronized_build: false,
        }
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub fn context(&self) -> &GraphicsContext {
        self.ctx
    }

    /// Commands recorded so far.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Record a raw command.
    pub fn record(&mut self, command: Command) {
        match &command {
            Command::BuildAccelerationStructure(_) => self.unsynchronized_build = true,
            Command::Barrier(barrier) if barrier.is_acceleration_structure_build() => {
                self.unsynchronized_build = false;
            }
            _ => {}
        }
        self.ctx.device().record(self.cmd, &command);
        self.commands.push(command);
    }

    /// Mark a resource as used by this buffer. It must still be alive and
    /// valid when the buffer is submitted.
    pub fn reference(&mut self, id: ResourceId) {
        self.references.insert(id);
    }

    pub fn begin_render_pass(
        &mut self,
        render_pass: &RenderPass,
        framebuffer: &Framebuffer,
        clear_color: [f32; 4],
    ) {
        self.reference(render_pass.resource_id());
        self.reference(framebuffer.resource_id());
        self.record(Command::BeginRenderPass {
            render_pass: render_pass.handle(),
            framebuffer: framebuffer.handle(),
            extent: framebuffer.extent(),
            clear_color,
            clear_depth: render_pass.has_depth().then_some(1.0),
        });
    }

    pub fn end_render_pass(&mut self) {
        self.record(Command::EndRenderPass);
    }

    pub fn bind_pipeline(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
        id: ResourceId,
    ) {
        self.reference(id);
        self.record(Command::BindPipeline {
            bind_point,
            pipeline,
        });
    }

    /// Bind a descriptor set. Fails before recording anything if the set has
    /// unwritten bindings or must be rebound.
    pub fn bind_descriptor_set(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: &DescriptorSet,
    ) -> Result<()> {
        set.validate()?;
        self.reference(set.resource_id());
        self.record(Command::BindDescriptorSet {
            bind_point,
            layout,
            set_index,
            set: set.handle(),
        });
        Ok(())
    }

    pub fn bind_vertex_buffer(&mut self, buffer: &GpuBuffer, offset: u64) {
        self.reference(buffer.resource_id());
        self.record(Command::BindVertexBuffer {
            buffer: buffer.handle(),
            offset,
        });
    }

    pub fn bind_index_buffer(&mut self, buffer: &GpuBuffer, offset: u64, index_type: vk::IndexType) {
        self.reference(buffer.resource_id());
        self.record(Command::BindIndexBuffer {
            buffer: buffer.handle(),
            offset,
            index_type,
        });
    }

    pub fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.record(Command::PushConstants {
            layout,
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.record(Command::Draw {
            vertex_count,
            instance_count,
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
    ) {
        self.record(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
        });
    }

    pub fn barrier(&mut self, barrier: Barrier) {
        self.record(Command::Barrier(barrier));
    }

    pub fn copy_buffer(&mut self, src: &GpuBuffer, dst: &GpuBuffer, size: u64) {
        self.reference(src.resource_id());
        self.reference(dst.resource_id());
        self.record(Command::CopyBuffer {
            src: src.handle(),
            dst: dst.handle(),
            regions: vec![vk::BufferCopy::default().size(size)],
        });
    }

    /// Copy into mip 0 of `image`, which must be in `TRANSFER_DST_OPTIMAL`.
    pub fn copy_buffer_to_image(&mut self, src: &GpuBuffer, image: &GpuImage) {
        self.reference(src.resource_id());
        self.reference(image.resource_id());
        let extent = image.extent();
        self.record(Command::CopyBufferToImage {
            src: src.handle(),
            image: image.handle(),
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            aspect: image.aspect(),
        });
    }

    /// Downsample mip `src_level` of `image` into `src_level + 1`.
    pub fn blit_mip_level(&mut self, image: &GpuImage, src_level: u32, filter: vk::Filter) {
        self.reference(image.resource_id());
        self.record(Command::BlitImage {
            image: image.handle(),
            aspect: image.aspect(),
            src_level,
            src_extent: image.mip_extent(src_level),
            dst_level: src_level + 1,
            dst_extent: image.mip_extent(src_level + 1),
            filter,
        });
    }

    /// Record an acceleration structure build writing the structure `id`.
    pub fn build_acceleration_structure(&mut self, build: AccelerationBuild, id: ResourceId) {
        self.reference(id);
        self.record(Command::BuildAccelerationStructure(build));
    }

    /// Record a trace dispatch. `references` are the pipeline, table and
    /// descriptor resources the trace reads.
    pub fn trace_rays(
        &mut self,
        regions: ShaderBindingRegions,
        extent: vk::Extent3D,
        references: &[ResourceId],
    ) {
        if self.unsynchronized_build {
            tracing::warn!(
                "trace_rays recorded after an acceleration structure build without a build barrier"
            );
        }
        for &id in references {
            self.reference(id);
        }
        self.record(Command::TraceRays {
            regions,
            width: extent.width,
            height: extent.height,
            depth: extent.depth,
        });
    }

    fn finish(self) -> (Vec<Command>, HashSet<ResourceId>) {
        (self.commands, self.references)
    }
}

/// Fail with `StaleReference` if any referenced resource is gone or invalid.
fn check_references(ctx: &GraphicsContext, references: &HashSet<ResourceId>) -> Result<()> {
    let graph = ctx.graph();
    for &id in references {
        if !graph.contains(id) {
            return Err(GpuError::StaleReference(format!(
                "resource {id:?} was released after recording"
            )));
        }
        if !graph.is_valid(id) {
            return Err(GpuError::StaleReference(format!(
                "'{}' was invalidated after recording",
                graph.label(id).unwrap_or_default()
            )));
        }
    }
    Ok(())
}

/// Semaphores and fence of one submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitInfo<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
    pub fence: Option<&'a Fence>,
}

#[derive(Debug)]
struct Slot {
    handle: vk::CommandBuffer,
    state: CommandBufferState,
    fence: vk::Fence,
    commands: Vec<Command>,
    references: HashSet<ResourceId>,
}

/// Command buffers allocated from one pool, keyed by queue family.
pub struct CommandBufferManager {
    ctx: Arc<GraphicsContext>,
    pool: vk::CommandPool,
    queue_family: u32,
    queue: vk::Queue,
    slots: Vec<Slot>,
}

impl CommandBufferManager {
    /// Create a manager submitting to the first queue of `queue_family`.
    pub fn new(ctx: &Arc<GraphicsContext>, queue_family: u32) -> Result<Self> {
        let pool = ctx.device().create_command_pool(queue_family)?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            pool,
            queue_family,
            queue: ctx.device().queue(queue_family),
            slots: Vec::new(),
        })
    }

    /// Create a manager for the graphics queue.
    pub fn graphics(ctx: &Arc<GraphicsContext>) -> Result<Self> {
        Self::new(ctx, ctx.graphics_queue_family())
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Allocate `count` more buffers. Returns the index of the first one.
    pub fn create_command_buffers(&mut self, count: u32) -> Result<usize> {
        let first = self.slots.len();
        let handles = self
            .ctx
            .device()
            .allocate_command_buffers(self.pool, count)?;
        self.slots.extend(handles.into_iter().map(|handle| Slot {
            handle,
            state: CommandBufferState::Initial,
            fence: vk::Fence::null(),
            commands: Vec::new(),
            references: HashSet::new(),
        }));
        tracing::debug!(count, family = self.queue_family, "allocated command buffers");
        Ok(first)
    }

    pub fn state(&self, index: usize) -> Result<CommandBufferState> {
        Ok(self.slot(index)?.state)
    }

    pub fn handle(&self, index: usize) -> Result<vk::CommandBuffer> {
        Ok(self.slot(index)?.handle)
    }

    /// Command log of the last recording.
    pub fn commands(&self, index: usize) -> Result<&[Command]> {
        Ok(&self.slot(index)?.commands)
    }

    /// Record buffer `index` with `f`.
    ///
    /// Legal from every state except `Pending` (`UseAfterSubmit`) and
    /// `Recording`. If `f` fails the buffer ends up `Invalid`.
    pub fn record_command_buffer<F>(&mut self, index: usize, f: F) -> Result<()>
    where
        F: FnOnce(&mut CommandRecorder<'_>) -> Result<()>,
    {
        let ctx = Arc::clone(&self.ctx);
        let slot = self.slot_mut(index)?;
        match slot.state {
            CommandBufferState::Pending => return Err(GpuError::UseAfterSubmit { index }),
            CommandBufferState::Recording => {
                return Err(GpuError::InvalidState(format!(
                    "command buffer {index} is already recording"
                )))
            }
            _ => {}
        }

        slot.commands.clear();
        slot.references.clear();
        ctx.device()
            .begin_command_buffer(slot.handle, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        slot.state = CommandBufferState::Recording;

        let mut recorder = CommandRecorder::new(&ctx, slot.handle);
        let recorded = f(&mut recorder);
        let (commands, references) = recorder.finish();
        slot.commands = commands;
        slot.references = references;

        let ended = recorded.and_then(|()| ctx.device().end_command_buffer(slot.handle));
        match ended {
            Ok(()) => {
                slot.state = CommandBufferState::Executable;
                tracing::trace!(index, commands = slot.commands.len(), "recorded command buffer");
                Ok(())
            }
            Err(e) => {
                slot.state = CommandBufferState::Invalid;
                Err(e)
            }
        }
    }

    /// Record several buffers with the same steps.
    pub fn record_command_buffers<F>(&mut self, indices: &[usize], mut f: F) -> Result<()>
    where
        F: FnMut(usize, &mut CommandRecorder<'_>) -> Result<()>,
    {
        for &index in indices {
            self.record_command_buffer(index, |recorder| f(index, recorder))?;
        }
        Ok(())
    }

    /// Return buffer `index` to `Initial`. Fails with `UseAfterSubmit` while
    /// it is pending; wait for its fence first.
    pub fn reset_command_buffer(&mut self, index: usize) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let slot = self.slot_mut(index)?;
        if slot.state == CommandBufferState::Pending {
            return Err(GpuError::UseAfterSubmit { index });
        }
        ctx.device().reset_command_buffer(slot.handle)?;
        slot.state = CommandBufferState::Initial;
        slot.commands.clear();
        slot.references.clear();
        Ok(())
    }

    pub fn reset_command_buffers(&mut self, indices: &[usize]) -> Result<()> {
        indices
            .iter()
            .try_for_each(|&index| self.reset_command_buffer(index))
    }

    /// Submit buffer `index`.
    ///
    /// Only one thread may submit to a given queue at a time. If a resource
    /// referenced during recording was released or invalidated since, the
    /// buffer becomes `Invalid` and `StaleReference` is returned.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn submit(&mut self, index: usize, info: &SubmitInfo<'_>) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let queue = self.queue;
        let slot = self.slot_mut(index)?;
        match slot.state {
            CommandBufferState::Executable => {}
            CommandBufferState::Pending => return Err(GpuError::UseAfterSubmit { index }),
            state => {
                return Err(GpuError::InvalidState(format!(
                    "command buffer {index} cannot be submitted from {state:?}"
                )))
            }
        }
        if let Err(e) = check_references(&ctx, &slot.references) {
            slot.state = CommandBufferState::Invalid;
            return Err(e);
        }

        let fence = info.fence.map_or(vk::Fence::null(), Fence::handle);
        ctx.device().submit(
            queue,
            &Submission {
                command_buffers: std::slice::from_ref(&slot.handle),
                wait_semaphores: info.wait_semaphores,
                wait_stages: info.wait_stages,
                signal_semaphores: info.signal_semaphores,
                fence,
            },
        )?;
        slot.state = CommandBufferState::Pending;
        slot.fence = fence;
        Ok(())
    }

    /// Non-blocking completion check. A pending buffer whose fence signaled
    /// moves to `Initial`.
    pub fn poll(&mut self, index: usize) -> Result<CommandBufferState> {
        let ctx = Arc::clone(&self.ctx);
        let slot = self.slot_mut(index)?;
        if slot.state == CommandBufferState::Pending
            && slot.fence != vk::Fence::null()
            && ctx.device().fence_signaled(slot.fence)?
        {
            slot.complete();
        }
        Ok(slot.state)
    }

    /// Block until buffer `index` is no longer pending.
    ///
    /// Buffers submitted without a fence wait for their whole queue. Fails
    /// with `Timeout` (buffer stays pending) or `DeviceLost`.
    pub fn wait_for_completion(&mut self, index: usize, timeout_ns: u64) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let queue = self.queue;
        let slot = self.slot_mut(index)?;
        if slot.state != CommandBufferState::Pending {
            return Ok(());
        }
        if slot.fence == vk::Fence::null() {
            ctx.device().queue_wait_idle(queue)?;
        } else {
            ctx.device().wait_for_fences(&[slot.fence], timeout_ns)?;
        }
        slot.complete();
        Ok(())
    }

    /// Record, submit and wait for a transient command buffer on this
    /// manager's queue.
    pub fn one_shot<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut CommandRecorder<'_>) -> Result<()>,
    {
        run_one_shot(&self.ctx, self.queue_family, self.queue, f)
    }

    fn slot(&self, index: usize) -> Result<&Slot> {
        self.slots.get(index).ok_or_else(|| {
            GpuError::InvalidState(format!("no command buffer at index {index}"))
        })
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Slot> {
        self.slots.get_mut(index).ok_or_else(|| {
            GpuError::InvalidState(format!("no command buffer at index {index}"))
        })
    }
}

impl Slot {
    fn complete(&mut self) {
        self.state = CommandBufferState::Initial;
        self.fence = vk::Fence::null();
        self.commands.clear();
        self.references.clear();
    }
}

impl Drop for CommandBufferManager {
    fn drop(&mut self) {
        if self
            .slots
            .iter()
            .any(|s| s.state == CommandBufferState::Pending)
        {
            tracing::warn!("Dropping command buffers still pending, waiting for the queue");
            if let Err(e) = self.ctx.device().queue_wait_idle(self.queue) {
                tracing::error!("Queue wait failed during teardown: {e}");
            }
        }
        let handles: Vec<_> = self.slots.iter().map(|s| s.handle).collect();
        if !handles.is_empty() {
            self.ctx.device().free_command_buffers(self.pool, &handles);
        }
        self.ctx.device().destroy_command_pool(self.pool);
    }
}

impl std::fmt::Debug for CommandBufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBufferManager")
            .field("queue_family", &self.queue_family)
            .field("buffers", &self.slots.len())
            .finish_non_exhaustive()
    }
}

/// Execute a single-time command buffer on the graphics queue and wait for it.
pub fn submit_one_shot<F>(ctx: &GraphicsContext, f: F) -> Result<()>
where
    F: FnOnce(&mut CommandRecorder<'_>) -> Result<()>,
{
    run_one_shot(
        ctx,
        ctx.graphics_queue_family(),
        ctx.graphics_queue(),
        f,
    )
}

struct OneShot<'a> {
    ctx: &'a GraphicsContext,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

impl Drop for OneShot<'_> {
    fn drop(&mut self) {
        let device = self.ctx.device();
        if self.fence != vk::Fence::null() {
            device.destroy_fence(self.fence);
        }
        if self.cmd != vk::CommandBuffer::null() {
            device.free_command_buffers(self.pool, &[self.cmd]);
        }
        device.destroy_command_pool(self.pool);
    }
}

fn run_one_shot<F>(ctx: &GraphicsContext, queue_family: u32, queue: vk::Queue, f: F) -> Result<()>
where
    F: FnOnce(&mut CommandRecorder<'_>) -> Result<()>,
{
    let device = ctx.device();
    let mut guard = OneShot {
        ctx,
        pool: device.create_command_pool(queue_family)?,
        cmd: vk::CommandBuffer::null(),
        fence: vk::Fence::null(),
    };
    guard.cmd = device
        .allocate_command_buffers(guard.pool, 1)?
        .into_iter()
        .next()
        .ok_or_else(|| GpuError::Other("no command buffer allocated".to_string()))?;
    guard.fence = device.create_fence(false)?;

    device.begin_command_buffer(guard.cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
    let mut recorder = CommandRecorder::new(ctx, guard.cmd);
    f(&mut recorder)?;
    let (_, references) = recorder.finish();
    device.end_command_buffer(guard.cmd)?;
    check_references(ctx, &references)?;

    device.submit(
        queue,
        &Submission {
            command_buffers: std::slice::from_ref(&guard.cmd),
            fence: guard.fence,
            ..Default::default()
        },
    )?;
    device.wait_for_fences(&[guard.fence], DEFAULT_FENCE_TIMEOUT_NS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferCreateInfo;
    use crate::capabilities::PhysicalDeviceInfo;
    use crate::context::GraphicsContextBuilder;
    use gpu_allocator::MemoryLocation;

    fn context() -> Arc<GraphicsContext> {
        GraphicsContextBuilder::new()
            .headless(PhysicalDeviceInfo::headless())
            .build()
            .unwrap()
    }

    fn buffer(ctx: &Arc<GraphicsContext>, label: &str) -> GpuBuffer {
        GpuBuffer::create(
            ctx,
            &BufferCreateInfo::new(
                label,
                64,
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            ),
        )
        .unwrap()
    }

    #[test]
    fn state_machine_round_trip() {
        let ctx = context();
        let mut cmds = CommandBufferManager::graphics(&ctx).unwrap();
        let index = cmds.create_command_buffers(1).unwrap();
        let fence = Fence::new(&ctx, false).unwrap();
        assert_eq!(cmds.state(index).unwrap(), CommandBufferState::Initial);

        cmds.record_command_buffer(index, |r| {
            r.draw(3, 1);
            Ok(())
        })
        .unwrap();
        assert_eq!(cmds.state(index).unwrap(), CommandBufferState::Executable);

        cmds.submit(
            index,
            &SubmitInfo {
                fence: Some(&fence),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cmds.state(index).unwrap(), CommandBufferState::Pending);

        cmds.wait_for_completion(index, 1_000).unwrap();
        assert_eq!(cmds.state(index).unwrap(), CommandBufferState::Initial);
    }

    #[test]
    fn pending_buffer_rejects_reset_and_record() {
        let ctx = context();
        let mut cmds = CommandBufferManager::graphics(&ctx).unwrap();
        let index = cmds.create_command_buffers(1).unwrap();
        let fence = Fence::new(&ctx, false).unwrap();
        cmds.record_command_buffer(index, |_| Ok(())).unwrap();
        cmds.submit(
            index,
            &SubmitInfo {
                fence: Some(&fence),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(matches!(
            cmds.reset_command_buffer(index),
            Err(GpuError::UseAfterSubmit { index: 0 })
        ));
        assert!(matches!(
            cmds.record_command_buffer(index, |_| Ok(())),
            Err(GpuError::UseAfterSubmit { .. })
        ));
        assert!(matches!(
            cmds.submit(index, &SubmitInfo::default()),
            Err(GpuError::UseAfterSubmit { .. })
        ));

        // Polling does not complete the work on its own.
        assert_eq!(cmds.poll(index).unwrap(), CommandBufferState::Pending);
        fence.wait(1_000).unwrap();
        assert_eq!(cmds.poll(index).unwrap(), CommandBufferState::Initial);
        cmds.reset_command_buffer(index).unwrap();
    }

    #[test]
    fn stalled_wait_keeps_buffer_pending() {
        let ctx = context();
        let mut cmds = CommandBufferManager::graphics(&ctx).unwrap();
        let index = cmds.create_command_buffers(1).unwrap();
        let fence = Fence::new(&ctx, false).unwrap();
        cmds.record_command_buffer(index, |_| Ok(())).unwrap();
        cmds.submit(
            index,
            &SubmitInfo {
                fence: Some(&fence),
                ..Default::default()
            },
        )
        .unwrap();

        ctx.headless().unwrap().set_stalled(true);
        let err = cmds.wait_for_completion(index, 10).unwrap_err();
        assert!(matches!(err, GpuError::Timeout { .. }));
        assert!(!err.is_fatal());
        assert_eq!(cmds.state(index).unwrap(), CommandBufferState::Pending);

        ctx.headless().unwrap().lose_device();
        let err = cmds.wait_for_completion(index, 10).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn failed_recording_invalidates_buffer() {
        let ctx = context();
        let mut cmds = CommandBufferManager::graphics(&ctx).unwrap();
        let index = cmds.create_command_buffers(1).unwrap();
        let result = cmds.record_command_buffer(index, |_| {
            Err(GpuError::InvalidState("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(cmds.state(index).unwrap(), CommandBufferState::Invalid);
        assert!(cmds.submit(index, &SubmitInfo::default()).is_err());
    }

    #[test]
    fn released_reference_fails_submit() {
        let ctx = context();
        let mut cmds = CommandBufferManager::graphics(&ctx).unwrap();
        let index = cmds.create_command_buffers(1).unwrap();
        let src = buffer(&ctx, "src");
        let mut dst = buffer(&ctx, "dst");
        cmds.record_command_buffer(index, |r| {
            r.copy_buffer(&src, &dst, 64);
            Ok(())
        })
        .unwrap();

        dst.destroy().unwrap();
        assert!(matches!(
            cmds.submit(index, &SubmitInfo::default()),
            Err(GpuError::StaleReference(_))
        ));
        assert_eq!(cmds.state(index).unwrap(), CommandBufferState::Invalid);
    }

    #[test]
    fn commands_are_logged_in_call_order() {
        let ctx = context();
        let mut cmds = CommandBufferManager::graphics(&ctx).unwrap();
        let index = cmds.create_command_buffers(1).unwrap();
        cmds.record_command_buffer(index, |r| {
            r.draw(3, 1);
            r.barrier(Barrier::transfer_to_shader_read());
            r.draw(6, 2);
            Ok(())
        })
        .unwrap();

        let commands = cmds.commands(index).unwrap();
        assert_eq!(commands.len(), 3);
        assert!(matches!(commands[0], Command::Draw { vertex_count: 3, .. }));
        assert!(matches!(commands[1], Command::Barrier(_)));
        assert!(matches!(commands[2], Command::Draw { vertex_count: 6, .. }));
    }

    #[test]
    fn batch_overloads_match_single_calls() {
        let ctx = context();
        let mut cmds = CommandBufferManager::graphics(&ctx).unwrap();
        let first = cmds.create_command_buffers(3).unwrap();
        let indices = [first, first + 1, first + 2];
        cmds.record_command_buffers(&indices, |i, r| {
            r.draw(u32::try_from(i).unwrap() + 1, 1);
            Ok(())
        })
        .unwrap();
        for &i in &indices {
            assert_eq!(cmds.state(i).unwrap(), CommandBufferState::Executable);
            assert_eq!(cmds.commands(i).unwrap().len(), 1);
        }
        cmds.reset_command_buffers(&indices).unwrap();
        for &i in &indices {
            assert_eq!(cmds.state(i).unwrap(), CommandBufferState::Initial);
        }
    }

    #[test]
    fn image_barrier_derives_scopes_from_layouts() {
        let barrier = Barrier::image_layout(
            vk::Image::null(),
            vk::ImageAspectFlags::COLOR,
            1,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        let Barrier::Image(image) = barrier else {
            panic!("expected image barrier");
        };
        assert_eq!(image.src_stage, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert_eq!(image.dst_access, vk::AccessFlags2::TRANSFER_WRITE);
        assert!(!barrier.is_acceleration_structure_build());
        assert!(Barrier::acceleration_structure_build().is_acceleration_structure_build());
    }

    #[test]
    fn one_shot_copies_and_cleans_up() {
        let ctx = context();
        let mut device_local = GpuBuffer::create(
            &ctx,
            &BufferCreateInfo::new("gpu", 16, vk::BufferUsageFlags::STORAGE_BUFFER),
        )
        .unwrap();
        let staging = GpuBuffer::from_slice(
            &ctx,
            "staging",
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            &[1u32, 2, 3, 4],
        )
        .unwrap();
        let cmds = CommandBufferManager::graphics(&ctx).unwrap();
        let before = ctx.headless().unwrap().live_objects();
        cmds.one_shot(|r| {
            r.copy_buffer(&staging, &device_local, 16);
            Ok(())
        })
        .unwrap();
        assert_eq!(ctx.headless().unwrap().live_objects(), before);
        assert_eq!(ctx.headless().unwrap().submissions(), 1);

        // Headless memory is host visible, so uploads skip staging.
        device_local.upload(&[7u8; 16]).unwrap();
        assert_eq!(ctx.headless().unwrap().submissions(), 1);
        assert_eq!(device_local.read_back(0, 16).unwrap(), vec![7u8; 16]);
    }
}
