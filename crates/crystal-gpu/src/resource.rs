//! Graph registration shared by every GPU resource.

use std::sync::Arc;

use crate::context::GraphicsContext;
use crate::error::Result;
use crate::graph::{Released, ResourceId, ResourceKind};

/// A resource's node in the dependency graph.
///
/// Releasing is idempotent. [`Registration::release`] honours the teardown
/// policy; dropping a registration always releases.
#[derive(Debug)]
pub struct Registration {
    ctx: Arc<GraphicsContext>,
    id: ResourceId,
    label: String,
    released: bool,
}

impl Registration {
    pub fn new(ctx: &Arc<GraphicsContext>, kind: ResourceKind, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let id = ctx.register(kind, &label)?;
        tracing::debug!(?kind, %label, ?id, "created resource");
        Ok(Self {
            ctx: Arc::clone(ctx),
            id,
            label,
            released: false,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn context(&self) -> &Arc<GraphicsContext> {
        &self.ctx
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Live and not invalidated by a released dependency.
    pub fn is_valid(&self) -> bool {
        !self.released && self.ctx.is_valid(self.id)
    }

    /// Add `self -> dependency`.
    pub fn depend_on(&self, dependency: ResourceId) -> Result<()> {
        self.ctx.graph().add_dependency(self.id, dependency)
    }

    /// Add `self -> dependency` for each id, all or nothing.
    pub fn depend_on_all(&self, dependencies: &[ResourceId]) -> Result<()> {
        self.ctx.graph().add_dependencies(self.id, dependencies)
    }

    /// Release the node per the teardown policy.
    pub fn release(&mut self) -> Result<Released> {
        if self.released {
            return Ok(Released::default());
        }
        let released = self.ctx.graph().release(self.id)?;
        self.released = true;
        tracing::debug!(label = %self.label, id = ?self.id, "destroyed resource");
        Ok(released)
    }

    fn force_release(&mut self) {
        if !self.released {
            self.ctx.graph().force_release(self.id);
            self.released = true;
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.force_release();
    }
}

/// Capabilities shared by every resource that owns device memory.
pub trait GpuAllocatable {
    fn registration(&self) -> &Registration;

    /// Bytes of device memory held.
    fn size_bytes(&self) -> u64;

    /// Destroy the native object. Safe to call more than once.
    fn destroy(&mut self) -> Result<()>;

    fn resource_id(&self) -> ResourceId {
        self.registration().id()
    }

    fn label(&self) -> &str {
        self.registration().label()
    }

    fn is_valid(&self) -> bool {
        self.registration().is_valid()
    }

    fn is_destroyed(&self) -> bool {
        self.registration().is_released()
    }

    fn context(&self) -> &Arc<GraphicsContext> {
        self.registration().context()
    }
}
