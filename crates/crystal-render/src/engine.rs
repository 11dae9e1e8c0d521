//! Frame-in-flight orchestration.
//!
//! [`RenderEngine`] owns one command buffer, fence and semaphore pair per
//! frame slot plus the images frames render into. Each
//! [`render_frame`](RenderEngine::render_frame) waits for its slot, hands
//! scene changes to the active renderer, records and submits.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use crystal_gpu::{
    CommandBufferManager, CommandRecorder, DeferredDeletionQueue, FrameSyncManager, GpuImage,
    GraphicsContext, ImageCreateInfo, SubmitInfo,
};
use glam::Mat4;
use tracing::{error, info, trace_span, warn};

use crate::error::Result;
use crate::rasterizer::Rasterizer;
use crate::ray_tracer::RayTracer;
use crate::scene::{Scene, SceneChanges, SceneDiff, SceneSnapshot};
use crate::settings::{BackendKind, Settings};
use crate::shaders::ShaderLibrary;

/// Format of the images frames render into.
pub const TARGET_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Per-frame uniform block shared by both renderers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrameUniforms {
    pub view_projection: Mat4,
    pub inverse_view_projection: Mat4,
    pub frame_number: u32,
    pub width: u32,
    pub height: u32,
    pub _pad: u32,
}

impl FrameUniforms {
    pub fn new(frame: &Frame<'_>) -> Self {
        let extent = frame.target.extent();
        Self {
            view_projection: frame.view_projection,
            inverse_view_projection: frame.view_projection.inverse(),
            // Shaders only use the low bits for noise seeds.
            frame_number: frame.number as u32,
            width: extent.width,
            height: extent.height,
            _pad: 0,
        }
    }
}

/// Scene changes handed to a renderer before recording.
pub struct SceneUpdate<'a> {
    pub scene: &'a Scene,
    pub diff: &'a SceneDiff,
    /// One render target per frame slot.
    pub targets: &'a [GpuImage],
    /// Replaced resources go here rather than being dropped, since earlier
    /// frames may still read them.
    pub retired: &'a mut DeferredDeletionQueue,
    pub frame_number: u64,
}

/// The frame being recorded.
pub struct Frame<'a> {
    pub number: u64,
    pub slot: usize,
    pub target: &'a mut GpuImage,
    pub view_projection: Mat4,
}

/// A way of turning a scene into pixels.
pub trait FrameRenderer {
    fn name(&self) -> &'static str;

    /// Bring GPU copies of the scene up to date. Pending frames that could
    /// read resources being modified in place are complete when this runs.
    fn on_scene_change(&mut self, update: SceneUpdate<'_>) -> Result<()>;

    /// Record the commands for one frame into `recorder`.
    fn record_frame(
        &mut self,
        recorder: &mut CommandRecorder<'_>,
        frame: &mut Frame<'_>,
    ) -> crystal_gpu::Result<()>;

    /// Rebuild whatever captured the previous target size.
    fn on_resize(&mut self, targets: &[GpuImage]) -> Result<()>;

    /// The last recorded frame failed to record or submit. Work it recorded
    /// never reaches the device.
    fn frame_discarded(&mut self) {}
}

/// The renderer chosen at engine creation.
#[derive(Debug)]
pub enum Renderer {
    Rasterizer(Rasterizer),
    RayTracer(RayTracer),
}

impl FrameRenderer for Renderer {
    fn name(&self) -> &'static str {
        match self {
            Self::Rasterizer(r) => r.name(),
            Self::RayTracer(r) => r.name(),
        }
    }

    fn on_scene_change(&mut self, update: SceneUpdate<'_>) -> Result<()> {
        match self {
            Self::Rasterizer(r) => r.on_scene_change(update),
            Self::RayTracer(r) => r.on_scene_change(update),
        }
    }

    fn record_frame(
        &mut self,
        recorder: &mut CommandRecorder<'_>,
        frame: &mut Frame<'_>,
    ) -> crystal_gpu::Result<()> {
        match self {
            Self::Rasterizer(r) => r.record_frame(recorder, frame),
            Self::RayTracer(r) => r.record_frame(recorder, frame),
        }
    }

    fn on_resize(&mut self, targets: &[GpuImage]) -> Result<()> {
        match self {
            Self::Rasterizer(r) => r.on_resize(targets),
            Self::RayTracer(r) => r.on_resize(targets),
        }
    }

    fn frame_discarded(&mut self) {
        match self {
            Self::Rasterizer(r) => r.frame_discarded(),
            Self::RayTracer(r) => r.frame_discarded(),
        }
    }
}

/// What a submitted frame hands to presentation.
#[derive(Debug, Clone, Copy)]
pub struct FrameOutput {
    pub frame_number: u64,
    pub slot: usize,
    pub command_buffer: vk::CommandBuffer,
    /// Signaled when the frame's commands finish.
    pub signal_semaphore: vk::Semaphore,
    /// Image holding the frame, in `TRANSFER_SRC_OPTIMAL` once complete.
    pub target: vk::Image,
    pub renderer: &'static str,
}

/// Drives a [`Renderer`] with several frames in flight.
// Fields drop in order: dependents before the resources they use.
pub struct RenderEngine {
    renderer: Renderer,
    retired: DeferredDeletionQueue,
    targets: Vec<GpuImage>,
    commands: CommandBufferManager,
    first_command_buffer: usize,
    frame_sync: FrameSyncManager,
    settings: Settings,
    uploaded: SceneSnapshot,
    frame_number: u64,
    lost: bool,
    ctx: Arc<GraphicsContext>,
}

impl RenderEngine {
    /// Create an engine on an existing context.
    ///
    /// The ray tracer is used only when `settings` ask for it and the
    /// context has ray tracing enabled. Otherwise the rasterizer is used
    /// and no acceleration structure is ever created.
    pub fn new(ctx: &Arc<GraphicsContext>, settings: &Settings, shaders: &ShaderLibrary) -> Result<Self> {
        let settings = settings.clamped_to(ctx.physical_device_info());
        let ray_tracing = settings.ray_tracing && ctx.ray_tracing_enabled();
        if settings.ray_tracing && !ray_tracing {
            warn!("Ray tracing requested but not enabled on this context, using the rasterizer");
        }

        let frames = settings.frames_in_flight;
        let frame_sync = FrameSyncManager::new(ctx, frames)?;
        let mut commands = CommandBufferManager::graphics(ctx)?;
        let first_command_buffer = commands.create_command_buffers(frames as u32)?;
        let targets = create_targets(ctx, &settings, frames, ray_tracing)?;

        let renderer = if ray_tracing {
            Renderer::RayTracer(RayTracer::new(ctx, &settings, shaders, &targets)?)
        } else {
            Renderer::Rasterizer(Rasterizer::new(ctx, &settings, shaders, &targets)?)
        };
        info!(
            renderer = renderer.name(),
            frames_in_flight = frames,
            width = settings.resolution.width,
            height = settings.resolution.height,
            "Render engine ready"
        );

        Ok(Self {
            ctx: Arc::clone(ctx),
            retired: DeferredDeletionQueue::new(frames),
            settings,
            frame_sync,
            commands,
            first_command_buffer,
            targets,
            renderer,
            uploaded: SceneSnapshot::default(),
            frame_number: 0,
            lost: false,
        })
    }

    /// Build a context from `settings` and an engine on it.
    pub fn from_settings(settings: &Settings, shaders: &ShaderLibrary) -> Result<Self> {
        let ctx = settings.context_builder().build()?;
        if settings.backend == BackendKind::Headless {
            if let (Some(device), Some(budget_mb)) =
                (ctx.headless(), settings.headless.memory_budget_mb)
            {
                device.set_memory_budget(Some(budget_mb * 1024 * 1024));
            }
        }
        Self::new(&ctx, settings, shaders)
    }

    pub fn context(&self) -> &Arc<GraphicsContext> {
        &self.ctx
    }

    /// Effective settings after clamping to the device.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn renderer_name(&self) -> &'static str {
        self.renderer.name()
    }

    /// Frames submitted so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn targets(&self) -> &[GpuImage] {
        &self.targets
    }

    pub fn pending_deletions(&self) -> usize {
        self.retired.pending_count()
    }

    /// Whether device loss stopped the engine.
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Render `scene` into the next frame slot and submit.
    ///
    /// A timeout leaves the engine usable. Device loss is fatal: this and
    /// every later call fail with `DeviceLost`.
    pub fn render_frame(&mut self, scene: &Scene) -> Result<FrameOutput> {
        if self.lost {
            return Err(crystal_gpu::GpuError::DeviceLost.into());
        }
        let result = self.render_frame_inner(scene);
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(frame = self.frame_number, "Fatal render error: {e}");
                self.lost = true;
            }
        }
        result
    }

    fn render_frame_inner(&mut self, scene: &Scene) -> Result<FrameOutput> {
        let _frame_span = trace_span!("frame", number = self.frame_number).entered();
        let slot = self.frame_sync.current_frame();
        let index = self.first_command_buffer + slot;
        let timeout = self.settings.fence_timeout_ns();

        {
            let _span = trace_span!("frame.acquire", slot).entered();
            self.commands.wait_for_completion(index, timeout)?;
            self.retired.process(self.frame_number);
        }

        let diff = scene.diff(&self.uploaded);
        if !diff.is_empty() {
            let _span = trace_span!("frame.rebuild", changes = ?diff.changes).entered();
            // In-place updates overwrite buffers older frames may still read.
            if diff
                .changes
                .intersects(SceneChanges::GEOMETRY | SceneChanges::TRANSFORM)
            {
                self.drain(timeout)?;
            }
            self.renderer.on_scene_change(SceneUpdate {
                scene,
                diff: &diff,
                targets: &self.targets,
                retired: &mut self.retired,
                frame_number: self.frame_number,
            })?;
            self.uploaded = scene.snapshot();
        }

        {
            let _span = trace_span!("frame.record").entered();
            self.commands.reset_command_buffer(index)?;
            let renderer = &mut self.renderer;
            let mut frame = Frame {
                number: self.frame_number,
                slot,
                target: &mut self.targets[slot],
                view_projection: scene.view_projection(),
            };
            let recorded = self
                .commands
                .record_command_buffer(index, |recorder| renderer.record_frame(recorder, &mut frame));
            if let Err(e) = recorded {
                self.renderer.frame_discarded();
                return Err(e.into());
            }
        }

        let sync = self.frame_sync.current();
        {
            let _span = trace_span!("frame.submit").entered();
            // Slots wait through the command buffer state, so a fence left
            // unsignaled by a failed submit is never waited on.
            let signal = [sync.render_finished.handle()];
            let submitted = sync.reset().and_then(|()| {
                self.commands.submit(
                    index,
                    &SubmitInfo {
                        signal_semaphores: &signal,
                        fence: Some(&sync.in_flight),
                        ..Default::default()
                    },
                )
            });
            if let Err(e) = submitted {
                self.renderer.frame_discarded();
                return Err(e.into());
            }
        }

        let output = FrameOutput {
            frame_number: self.frame_number,
            slot,
            command_buffer: self.commands.handle(index)?,
            signal_semaphore: sync.render_finished.handle(),
            target: self.targets[slot].handle(),
            renderer: self.renderer.name(),
        };

        let _span = trace_span!("frame.advance").entered();
        self.frame_sync.advance();
        self.frame_number += 1;
        Ok(output)
    }

    /// Resize every target and rebuild what depends on the old size.
    /// Acceleration structures are kept.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        if self.lost {
            return Err(crystal_gpu::GpuError::DeviceLost.into());
        }

        self.drain(self.settings.fence_timeout_ns())?;
        self.ctx.wait_idle()?;
        for target in &mut self.targets {
            target.resize(width, height)?;
        }
        self.settings.resolution.width = width;
        self.settings.resolution.height = height;
        self.renderer.on_resize(&self.targets)?;

        info!("Resized to {}x{}", width, height);
        Ok(())
    }

    /// Block until every slot's last submission completed.
    pub fn wait_idle(&mut self) -> Result<()> {
        self.drain(self.settings.fence_timeout_ns())
    }

    fn drain(&mut self, timeout_ns: u64) -> Result<()> {
        for slot in 0..self.frame_sync.frames_in_flight() {
            self.commands
                .wait_for_completion(self.first_command_buffer + slot, timeout_ns)?;
        }
        Ok(())
    }
}

impl Drop for RenderEngine {
    fn drop(&mut self) {
        if !self.lost {
            if let Err(e) = self.drain(self.settings.fence_timeout_ns()) {
                error!("Failed to wait for frames in flight: {e}");
            }
        }
        let dropped = self.retired.flush();
        tracing::debug!(dropped, frames = self.frame_number, "render engine shut down");
    }
}

impl std::fmt::Debug for RenderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderEngine")
            .field("renderer", &self.renderer.name())
            .field("frame_number", &self.frame_number)
            .field("frames_in_flight", &self.frame_sync.frames_in_flight())
            .field("lost", &self.lost)
            .finish_non_exhaustive()
    }
}

fn create_targets(
    ctx: &Arc<GraphicsContext>,
    settings: &Settings,
    count: usize,
    ray_tracing: bool,
) -> Result<Vec<GpuImage>> {
    let (usage, samples) = if ray_tracing {
        (
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
            vk::SampleCountFlags::TYPE_1,
        )
    } else {
        (
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            settings.sample_count(),
        )
    };
    let resolution = settings.resolution;
    let targets = (0..count)
        .map(|i| {
            let info = ImageCreateInfo::new(
                format!("frame_target_{i}"),
                resolution.width,
                resolution.height,
                TARGET_FORMAT,
                usage,
            )
            .samples(samples);
            GpuImage::create(ctx, &info)
        })
        .collect::<crystal_gpu::Result<Vec<_>>>()?;
    Ok(targets)
}
