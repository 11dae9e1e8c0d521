//! Synchronization primitives.

use std::sync::Arc;

use ash::vk;

use crate::context::GraphicsContext;
use crate::error::Result;

/// Default timeout for frame fence waits.
pub const DEFAULT_FENCE_TIMEOUT_NS: u64 = 5_000_000_000;

/// CPU-GPU fence.
#[derive(Debug)]
pub struct Fence {
    ctx: Arc<GraphicsContext>,
    handle: vk::Fence,
}

impl Fence {
    pub fn new(ctx: &Arc<GraphicsContext>, signaled: bool) -> Result<Self> {
        Ok(Self {
            ctx: Arc::clone(ctx),
            handle: ctx.device().create_fence(signaled)?,
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Block until signaled.
    ///
    /// Fails with `Timeout` when the GPU is merely slow and with `DeviceLost`
    /// when it is gone; only the latter is fatal.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        self.ctx.device().wait_for_fences(&[self.handle], timeout_ns)
    }

    /// Non-blocking status query.
    pub fn is_signaled(&self) -> Result<bool> {
        self.ctx.device().fence_signaled(self.handle)
    }

    /// Reset to unsignaled.
    pub fn reset(&self) -> Result<()> {
        self.ctx.device().reset_fences(&[self.handle])
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.ctx.device().destroy_fence(self.handle);
    }
}

/// GPU-GPU semaphore.
#[derive(Debug)]
pub struct Semaphore {
    ctx: Arc<GraphicsContext>,
    handle: vk::Semaphore,
}

impl Semaphore {
    pub fn new(ctx: &Arc<GraphicsContext>) -> Result<Self> {
        Ok(Self {
            ctx: Arc::clone(ctx),
            handle: ctx.device().create_semaphore()?,
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.ctx.device().destroy_semaphore(self.handle);
    }
}

/// Frame synchronization resources.
#[derive(Debug)]
pub struct FrameSync {
    /// Semaphore signaled when the target image is available
    pub image_available: Semaphore,
    /// Semaphore signaled when rendering is complete, handed to presentation
    pub render_finished: Semaphore,
    /// Fence to wait for frame completion
    pub in_flight: Fence,
}

impl FrameSync {
    pub fn new(ctx: &Arc<GraphicsContext>) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(ctx)?,
            render_finished: Semaphore::new(ctx)?,
            in_flight: Fence::new(ctx, true)?,
        })
    }

    /// Wait for this frame slot to be available.
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        self.in_flight.wait(timeout_ns)
    }

    /// Reset the fence for the next submission.
    pub fn reset(&self) -> Result<()> {
        self.in_flight.reset()
    }
}

/// Manages synchronization for multiple frames in flight.
#[derive(Debug)]
pub struct FrameSyncManager {
    frame_syncs: Vec<FrameSync>,
    current_frame: usize,
}

impl FrameSyncManager {
    /// Create sync resources for `frames_in_flight` slots (at least one).
    pub fn new(ctx: &Arc<GraphicsContext>, frames_in_flight: usize) -> Result<Self> {
        let frame_syncs = (0..frames_in_flight.max(1))
            .map(|_| FrameSync::new(ctx))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            frame_syncs,
            current_frame: 0,
        })
    }

    /// Get the current frame's sync resources.
    pub fn current(&self) -> &FrameSync {
        &self.frame_syncs[self.current_frame]
    }

    /// Advance to the next frame.
    pub fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % self.frame_syncs.len();
    }

    /// Get the current frame index.
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frame_syncs.len()
    }

    /// Wait for every slot, e.g. before teardown or resize.
    pub fn wait_all(&self, timeout_ns: u64) -> Result<()> {
        self.frame_syncs
            .iter()
            .try_for_each(|sync| sync.wait(timeout_ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::PhysicalDeviceInfo;
    use crate::context::GraphicsContextBuilder;
    use crate::error::GpuError;

    fn context() -> Arc<GraphicsContext> {
        GraphicsContextBuilder::new()
            .headless(PhysicalDeviceInfo::headless())
            .build()
            .unwrap()
    }

    #[test]
    fn frame_slots_round_robin() {
        let ctx = context();
        let mut frames = FrameSyncManager::new(&ctx, 2).unwrap();
        assert_eq!(frames.current_frame(), 0);
        frames.advance();
        assert_eq!(frames.current_frame(), 1);
        frames.advance();
        assert_eq!(frames.current_frame(), 0);
    }

    #[test]
    fn new_frame_fences_start_signaled() {
        let ctx = context();
        let frames = FrameSyncManager::new(&ctx, 3).unwrap();
        frames.wait_all(0).unwrap();
        assert!(frames.current().in_flight.is_signaled().unwrap());
    }

    #[test]
    fn unsignaled_fence_times_out() {
        let ctx = context();
        let fence = Fence::new(&ctx, false).unwrap();
        assert!(matches!(
            fence.wait(1_000),
            Err(GpuError::Timeout { timeout_ns: 1_000 })
        ));
    }

    #[test]
    fn submit_info_debug_shows_the_fence() {
        let ctx = context();
        let fence = Fence::new(&ctx, false).unwrap();
        let info = crate::command::SubmitInfo {
            fence: Some(&fence),
            ..Default::default()
        };
        let printed = format!("{info:?}");
        assert!(printed.contains("Fence"));
        assert!(printed.contains(&format!("{:?}", fence.handle())));
    }

    #[test]
    fn sync_objects_are_destroyed_on_drop() {
        let ctx = context();
        {
            let _frames = FrameSyncManager::new(&ctx, 2).unwrap();
            assert_eq!(ctx.headless().unwrap().live_objects(), 6);
        }
        assert_eq!(ctx.headless().unwrap().live_objects(), 0);
    }
}
