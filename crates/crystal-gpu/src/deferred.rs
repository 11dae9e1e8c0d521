//! Deferred resource deletion for multi-frame-in-flight rendering.
//!
//! When using multiple frames in flight, GPU resources cannot be freed immediately
//! as they may still be in use by a previous frame. Retired resources are kept
//! alive here and dropped once no in-flight frame can reference them.

use std::collections::VecDeque;

/// A resource pending deletion.
struct PendingDeletion {
    resource: Box<dyn Send>,
    label: String,
    /// Frame number when this resource was queued for deletion.
    frame_queued: u64,
}

/// Queue for deferred deletions.
///
/// Anything that releases itself on drop (buffers, images, acceleration
/// structures, descriptor sets) can be retired.
pub struct DeferredDeletionQueue {
    pending: VecDeque<PendingDeletion>,
    /// Number of frames in flight (determines how long to wait before freeing).
    frames_in_flight: usize,
}

impl DeferredDeletionQueue {
    /// Create a new deferred deletion queue.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Queue a resource for deletion once `frames_in_flight` frames have passed.
    pub fn retire<T: Send + 'static>(&mut self, resource: T, label: impl Into<String>, frame_number: u64) {
        let label = label.into();
        tracing::trace!(%label, frame_number, "retiring resource");
        self.pending.push_back(PendingDeletion {
            resource: Box::new(resource),
            label,
            frame_queued: frame_number,
        });
    }

    /// Drop resources that are safe to delete. Returns how many were dropped.
    ///
    /// Call this at the start of each frame, after waiting for the frame slot.
    pub fn process(&mut self, current_frame_number: u64) -> usize {
        // Keep resources that were queued within the last `frames_in_flight` frames
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);

        let mut dropped = 0;
        // Queue order is FIFO and frame numbers are non-decreasing, so only the front can mature.
        while self
            .pending
            .front()
            .is_some_and(|p| p.frame_queued < cutoff)
        {
            if let Some(pending) = self.pending.pop_front() {
                tracing::trace!(label = %pending.label, "deleting retired resource");
                drop(pending.resource);
                dropped += 1;
            }
        }
        dropped
    }

    /// Drop every pending resource immediately.
    ///
    /// Call this during shutdown or allocation recovery, after the device is idle.
    pub fn flush(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Get the number of pending deletions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for DeferredDeletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredDeletionQueue")
            .field("pending", &self.pending.len())
            .field("frames_in_flight", &self.frames_in_flight)
            .finish()
    }
}
