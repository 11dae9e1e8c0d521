//! Descriptor set management.
//!
//! A [`DescriptorSet`] depends in the graph on every resource bound to it.
//! Rebinding a slot swaps exactly that slot's edge. Since edges only point
//! from newer to older resources, a set can only bind resources created
//! before it; after a topology change a new set is created instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::context::GraphicsContext;
use crate::device::DescriptorWrite;
use crate::error::{GpuError, Result};
use crate::graph::{ResourceId, ResourceKind};
use crate::resource::{GpuAllocatable, Registration};

/// A resource that can be written into a descriptor binding.
pub trait Bindable: GpuAllocatable {
    /// Descriptor type this resource is usually bound as.
    fn natural_type(&self) -> vk::DescriptorType;

    /// Whether the resource may be written to a binding of type `ty`.
    fn supports(&self, ty: vk::DescriptorType) -> bool;

    fn descriptor_write(&self, ty: vk::DescriptorType) -> DescriptorWrite;
}

/// One declared slot of a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Descriptor set layout builder.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    label: String,
    bindings: Vec<LayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new builder.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        ty: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(LayoutBinding {
            binding,
            ty,
            count,
            stages,
        });
        self
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stages)
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stages)
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stages)
    }

    /// Add a sampled image binding.
    pub fn sampled_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1, stages)
    }

    /// Add an acceleration structure binding (for ray tracing).
    pub fn acceleration_structure(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            1,
            stages,
        )
    }

    /// Build the descriptor set layout. Duplicate slots are rejected.
    pub fn build(mut self, ctx: &Arc<GraphicsContext>) -> Result<Arc<DescriptorSetLayout>> {
        self.bindings.sort_by_key(|b| b.binding);
        if let Some(pair) = self
            .bindings
            .windows(2)
            .find(|pair| pair[0].binding == pair[1].binding)
        {
            return Err(GpuError::InvalidState(format!(
                "layout '{}' declares binding {} twice",
                self.label, pair[0].binding
            )));
        }

        let vk_bindings: Vec<_> = self
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();
        let handle = ctx.device().create_descriptor_set_layout(&vk_bindings)?;
        tracing::debug!(label = %self.label, bindings = self.bindings.len(), "created descriptor set layout");

        Ok(Arc::new(DescriptorSetLayout {
            ctx: Arc::clone(ctx),
            handle,
            label: self.label,
            bindings: self.bindings,
        }))
    }
}

/// Immutable binding contract shared by sets and pipeline layouts.
pub struct DescriptorSetLayout {
    ctx: Arc<GraphicsContext>,
    handle: vk::DescriptorSetLayout,
    label: String,
    bindings: Vec<LayoutBinding>,
}

impl DescriptorSetLayout {
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Declared bindings, sorted by slot.
    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    pub fn binding(&self, slot: u32) -> Option<&LayoutBinding> {
        self.bindings.iter().find(|b| b.binding == slot)
    }

    /// Pool sizes for `max_sets` sets of this layout.
    pub fn pool_sizes(&self, max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            let count = binding.count * max_sets;
            match sizes.iter_mut().find(|s| s.ty == binding.ty) {
                Some(size) => size.descriptor_count += count,
                None => sizes.push(
                    vk::DescriptorPoolSize::default()
                        .ty(binding.ty)
                        .descriptor_count(count),
                ),
            }
        }
        sizes
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.ctx.device().destroy_descriptor_set_layout(self.handle);
    }
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("label", &self.label)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

/// Descriptor pool for allocating descriptor sets.
///
/// Sets keep their pool alive, so the pool is only destroyed once every set
/// allocated from it is gone.
pub struct DescriptorPool {
    ctx: Arc<GraphicsContext>,
    handle: vk::DescriptorPool,
    max_sets: u32,
    allocated: Mutex<u32>,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    pub fn new(
        ctx: &Arc<GraphicsContext>,
        pool_sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<Arc<Self>> {
        let handle = ctx.device().create_descriptor_pool(pool_sizes, max_sets)?;
        Ok(Arc::new(Self {
            ctx: Arc::clone(ctx),
            handle,
            max_sets,
            allocated: Mutex::new(0),
        }))
    }

    /// Create a pool sized for `max_sets` sets of `layout`.
    pub fn for_layout(
        ctx: &Arc<GraphicsContext>,
        layout: &DescriptorSetLayout,
        max_sets: u32,
    ) -> Result<Arc<Self>> {
        Self::new(ctx, &layout.pool_sizes(max_sets), max_sets)
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.handle
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    /// Sets currently allocated from this pool.
    pub fn allocated(&self) -> u32 {
        *self.allocated.lock()
    }

    fn allocate(&self, layout: &DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let mut allocated = self.allocated.lock();
        if *allocated >= self.max_sets {
            return Err(GpuError::Allocation(format!(
                "descriptor pool exhausted ({} sets)",
                self.max_sets
            )));
        }
        let set = self
            .ctx
            .device()
            .allocate_descriptor_set(self.handle, layout.handle())?;
        *allocated += 1;
        Ok(set)
    }

    fn free(&self, set: vk::DescriptorSet) {
        self.ctx.device().free_descriptor_set(self.handle, set);
        let mut allocated = self.allocated.lock();
        *allocated = allocated.saturating_sub(1);
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.ctx.device().destroy_descriptor_pool(self.handle);
    }
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("max_sets", &self.max_sets)
            .field("allocated", &self.allocated())
            .finish_non_exhaustive()
    }
}

/// Creation parameters of a [`DescriptorSet`].
pub struct DescriptorSetCreateInfo<'a> {
    pub label: String,
    pub layout: Arc<DescriptorSetLayout>,
    pub pool: Arc<DescriptorPool>,
    /// Initial `(slot, resource)` writes.
    pub bindings: Vec<(u32, &'a dyn Bindable)>,
}

impl<'a> DescriptorSetCreateInfo<'a> {
    pub fn new(
        label: impl Into<String>,
        layout: &Arc<DescriptorSetLayout>,
        pool: &Arc<DescriptorPool>,
    ) -> Self {
        Self {
            label: label.into(),
            layout: Arc::clone(layout),
            pool: Arc::clone(pool),
            bindings: Vec::new(),
        }
    }

    pub fn bind(mut self, slot: u32, resource: &'a dyn Bindable) -> Self {
        self.bindings.push((slot, resource));
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct BoundResource {
    id: ResourceId,
    ty: vk::DescriptorType,
}

/// A descriptor set allocated against a layout.
pub struct DescriptorSet {
    registration: Registration,
    handle: vk::DescriptorSet,
    layout: Arc<DescriptorSetLayout>,
    pool: Arc<DescriptorPool>,
    bound: BTreeMap<u32, BoundResource>,
}

impl DescriptorSet {
    /// Allocate a set and write its initial bindings.
    pub fn create(ctx: &Arc<GraphicsContext>, info: DescriptorSetCreateInfo<'_>) -> Result<Self> {
        let handle = info.pool.allocate(&info.layout)?;
        let registration = match Registration::new(ctx, ResourceKind::DescriptorSet, info.label) {
            Ok(registration) => registration,
            Err(e) => {
                info.pool.free(handle);
                return Err(e);
            }
        };

        let mut set = Self {
            registration,
            handle,
            layout: info.layout,
            pool: info.pool,
            bound: BTreeMap::new(),
        };
        for (slot, resource) in info.bindings {
            set.bind(slot, resource)?;
        }
        Ok(set)
    }

    pub fn handle(&self) -> vk::DescriptorSet {
        self.handle
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn resource_id(&self) -> ResourceId {
        self.registration.id()
    }

    pub fn label(&self) -> &str {
        self.registration.label()
    }

    pub fn is_valid(&self) -> bool {
        self.registration.is_valid()
    }

    /// Resource currently written to `slot`.
    pub fn bound_resource(&self, slot: u32) -> Option<ResourceId> {
        self.bound.get(&slot).map(|b| b.id)
    }

    /// Write `resource` to `slot`, replacing the previous dependency edge of
    /// that slot only.
    pub fn bind(&mut self, slot: u32, resource: &dyn Bindable) -> Result<()> {
        if self.registration.is_released() {
            return Err(GpuError::UnknownResource(self.registration.id()));
        }
        let declared = *self.layout.binding(slot).ok_or_else(|| {
            GpuError::InvalidState(format!(
                "descriptor set '{}' has no binding {slot}",
                self.label()
            ))
        })?;
        if !resource.supports(declared.ty) {
            return Err(GpuError::BindingTypeMismatch {
                binding: slot,
                expected: declared.ty,
                actual: resource.natural_type(),
            });
        }
        if resource.is_destroyed() {
            return Err(GpuError::UnknownResource(resource.resource_id()));
        }

        let new_id = resource.resource_id();
        let set_id = self.registration.id();
        let old_id = self.bound.get(&slot).map(|b| b.id);
        {
            let mut graph = self.registration.context().graph();
            if old_id != Some(new_id) {
                graph.add_dependency(set_id, new_id)?;
                if let Some(old_id) = old_id {
                    let shared = self
                        .bound
                        .iter()
                        .any(|(&other, b)| other != slot && b.id == old_id);
                    if !shared {
                        graph.remove_dependency(set_id, old_id);
                    }
                }
            }
        }

        self.registration.context().device().write_descriptor(
            self.handle,
            slot,
            &resource.descriptor_write(declared.ty),
        );
        self.bound.insert(
            slot,
            BoundResource {
                id: new_id,
                ty: declared.ty,
            },
        );
        tracing::trace!(set = %self.label(), slot, resource = %resource.label(), "bound descriptor");

        self.revalidate_if_complete()
    }

    /// Declared slots that have nothing live written to them.
    pub fn unbound_bindings(&self) -> Vec<u32> {
        let graph = self.registration.context().graph();
        self.layout
            .bindings()
            .iter()
            .map(|b| b.binding)
            .filter(|slot| {
                self.bound
                    .get(slot)
                    .map_or(true, |bound| !graph.contains(bound.id))
            })
            .collect()
    }

    /// Check the set may be used by a command.
    ///
    /// Fails with `BindingIncomplete` while any declared slot is unwritten or
    /// its resource was released, and with `StaleReference` when a bound
    /// resource was rebuilt with a new native handle since it was written.
    pub fn validate(&self) -> Result<()> {
        if self.registration.is_released() {
            return Err(GpuError::UnknownResource(self.registration.id()));
        }
        let missing = self.unbound_bindings();
        if !missing.is_empty() {
            return Err(GpuError::BindingIncomplete {
                label: self.label().to_string(),
                missing,
            });
        }
        if !self.registration.is_valid() {
            return Err(GpuError::StaleReference(format!(
                "descriptor set '{}' must be rebound",
                self.label()
            )));
        }
        Ok(())
    }

    /// Return the set to its pool.
    pub fn destroy(&mut self) -> Result<()> {
        self.registration.release()?;
        self.free_native();
        Ok(())
    }

    fn revalidate_if_complete(&self) -> Result<()> {
        if self.registration.is_valid() {
            return Ok(());
        }
        let mut graph = self.registration.context().graph();
        let complete = self.layout.bindings().iter().all(|b| {
            self.bound
                .get(&b.binding)
                .is_some_and(|bound| graph.contains(bound.id) && bound.ty == b.ty)
        });
        // An invalid dependency keeps the set invalid.
        let stale = graph
            .dependencies_of(self.registration.id())
            .into_iter()
            .any(|id| !graph.is_valid(id));
        if complete && !stale {
            graph.revalidate(self.registration.id())?;
        }
        Ok(())
    }

    fn free_native(&mut self) {
        if self.handle != vk::DescriptorSet::null() {
            self.pool.free(self.handle);
            self.handle = vk::DescriptorSet::null();
        }
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        self.free_native();
    }
}

impl std::fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("label", &self.label())
            .field("layout", &self.layout.label())
            .field("bound", &self.bound.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferCreateInfo, GpuBuffer};
    use crate::capabilities::PhysicalDeviceInfo;
    use crate::context::GraphicsContextBuilder;
    use crate::graph::TeardownPolicy;

    fn context() -> Arc<GraphicsContext> {
        GraphicsContextBuilder::new()
            .headless(PhysicalDeviceInfo::headless())
            .build()
            .unwrap()
    }

    fn storage(ctx: &Arc<GraphicsContext>, label: &str) -> GpuBuffer {
        GpuBuffer::create(
            ctx,
            &BufferCreateInfo::new(label, 64, vk::BufferUsageFlags::STORAGE_BUFFER),
        )
        .unwrap()
    }

    fn three_slot_layout(ctx: &Arc<GraphicsContext>) -> Arc<DescriptorSetLayout> {
        DescriptorSetLayoutBuilder::new("three")
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .storage_buffer(1, vk::ShaderStageFlags::COMPUTE)
            .storage_buffer(2, vk::ShaderStageFlags::COMPUTE)
            .build(ctx)
            .unwrap()
    }

    #[test]
    fn duplicate_binding_is_rejected() {
        let ctx = context();
        let result = DescriptorSetLayoutBuilder::new("dup")
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .uniform_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .build(&ctx);
        assert!(result.is_err());
    }

    #[test]
    fn pool_sizes_merge_types() {
        let ctx = context();
        let layout = DescriptorSetLayoutBuilder::new("mixed")
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .storage_buffer(1, vk::ShaderStageFlags::COMPUTE)
            .uniform_buffer(2, vk::ShaderStageFlags::COMPUTE)
            .build(&ctx)
            .unwrap();
        let sizes = layout.pool_sizes(4);
        assert_eq!(sizes.len(), 2);
        let storage = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::STORAGE_BUFFER)
            .unwrap();
        assert_eq!(storage.descriptor_count, 8);
    }

    #[test]
    fn incomplete_set_fails_validation() {
        let ctx = context();
        let layout = three_slot_layout(&ctx);
        let pool = DescriptorPool::for_layout(&ctx, &layout, 1).unwrap();
        let a = storage(&ctx, "a");
        let b = storage(&ctx, "b");
        let set = DescriptorSet::create(
            &ctx,
            DescriptorSetCreateInfo::new("partial", &layout, &pool)
                .bind(0, &a)
                .bind(1, &b),
        )
        .unwrap();

        match set.validate() {
            Err(GpuError::BindingIncomplete { missing, .. }) => assert_eq!(missing, vec![2]),
            other => panic!("expected BindingIncomplete, got {other:?}"),
        }
    }

    #[test]
    fn rebinding_replaces_exactly_one_edge() {
        let ctx = context();
        let layout = three_slot_layout(&ctx);
        let pool = DescriptorPool::for_layout(&ctx, &layout, 1).unwrap();
        let a = storage(&ctx, "a");
        let b = storage(&ctx, "b");
        let c = storage(&ctx, "c");
        let replacement = storage(&ctx, "replacement");
        let mut set = DescriptorSet::create(
            &ctx,
            DescriptorSetCreateInfo::new("full", &layout, &pool)
                .bind(0, &a)
                .bind(1, &b)
                .bind(2, &c),
        )
        .unwrap();
        set.validate().unwrap();

        set.bind(1, &replacement).unwrap();

        let graph = ctx.graph();
        let id = set.resource_id();
        assert!(graph.depends_on(id, a.resource_id()));
        assert!(!graph.depends_on(id, b.resource_id()));
        assert!(graph.depends_on(id, c.resource_id()));
        assert!(graph.depends_on(id, replacement.resource_id()));
        // Three slots plus the context.
        assert_eq!(graph.dependencies_of(id).len(), 4);
    }

    #[test]
    fn binding_newer_resource_is_a_cycle() {
        let ctx = context();
        let layout = three_slot_layout(&ctx);
        let pool = DescriptorPool::for_layout(&ctx, &layout, 1).unwrap();
        let mut set =
            DescriptorSet::create(&ctx, DescriptorSetCreateInfo::new("early", &layout, &pool))
                .unwrap();
        let late = storage(&ctx, "late");
        assert!(matches!(set.bind(0, &late), Err(GpuError::Cycle { .. })));
        assert_eq!(set.unbound_bindings(), vec![0, 1, 2]);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let ctx = context();
        let layout = DescriptorSetLayoutBuilder::new("ubo")
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build(&ctx)
            .unwrap();
        let pool = DescriptorPool::for_layout(&ctx, &layout, 1).unwrap();
        let ssbo = storage(&ctx, "ssbo");
        let result = DescriptorSet::create(
            &ctx,
            DescriptorSetCreateInfo::new("bad", &layout, &pool).bind(0, &ssbo),
        );
        assert!(matches!(
            result,
            Err(GpuError::BindingTypeMismatch { binding: 0, .. })
        ));
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn released_buffer_leaves_slot_unbound() {
        let ctx = context();
        let layout = DescriptorSetLayoutBuilder::new("one")
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .build(&ctx)
            .unwrap();
        let pool = DescriptorPool::for_layout(&ctx, &layout, 1).unwrap();
        let mut a = storage(&ctx, "a");
        let fresh = storage(&ctx, "fresh");
        let mut set = DescriptorSet::create(
            &ctx,
            DescriptorSetCreateInfo::new("set", &layout, &pool).bind(0, &a),
        )
        .unwrap();

        a.destroy().unwrap();
        assert!(!set.is_valid());
        assert!(matches!(
            set.validate(),
            Err(GpuError::BindingIncomplete { .. })
        ));

        set.bind(0, &fresh).unwrap();
        assert!(set.is_valid());
        set.validate().unwrap();
    }

    #[test]
    fn refuse_policy_keeps_bound_buffer_alive() {
        let ctx = GraphicsContextBuilder::new()
            .teardown_policy(TeardownPolicy::Refuse)
            .headless(PhysicalDeviceInfo::headless())
            .build()
            .unwrap();
        let layout = DescriptorSetLayoutBuilder::new("one")
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .build(&ctx)
            .unwrap();
        let pool = DescriptorPool::for_layout(&ctx, &layout, 1).unwrap();
        let mut a = storage(&ctx, "a");
        let mut set = DescriptorSet::create(
            &ctx,
            DescriptorSetCreateInfo::new("set", &layout, &pool).bind(0, &a),
        )
        .unwrap();

        assert!(matches!(
            a.destroy(),
            Err(GpuError::DependentsAlive { count: 1, .. })
        ));
        set.destroy().unwrap();
        a.destroy().unwrap();
    }

    #[test]
    fn destroy_returns_set_to_pool() {
        let ctx = context();
        let layout = three_slot_layout(&ctx);
        let pool = DescriptorPool::for_layout(&ctx, &layout, 1).unwrap();
        let mut first =
            DescriptorSet::create(&ctx, DescriptorSetCreateInfo::new("first", &layout, &pool))
                .unwrap();
        let exhausted =
            DescriptorSet::create(&ctx, DescriptorSetCreateInfo::new("second", &layout, &pool));
        assert!(exhausted.unwrap_err().is_allocation());

        first.destroy().unwrap();
        first.destroy().unwrap();
        assert_eq!(pool.allocated(), 0);
        assert!(
            DescriptorSet::create(&ctx, DescriptorSetCreateInfo::new("third", &layout, &pool))
                .is_ok()
        );
    }
}
