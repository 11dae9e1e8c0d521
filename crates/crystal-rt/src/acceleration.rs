//! Acceleration structure management for hardware ray tracing.
//!
//! Bottom-level structures (BLAS) are built from mesh vertex and index
//! buffers. Top-level structures (TLAS) hold instances of BLASes and record
//! the generation of every referenced BLAS at build time, so a trace against
//! a TLAS whose BLASes were rebuilt since is caught before it is recorded.
//!
//! Rebuilding keeps the native handle and bumps the generation. Only when the
//! required size exceeds the current storage is a new handle allocated, and
//! then every dependent (descriptor sets, TLASes) is invalidated.

use std::sync::Arc;

use ash::vk;
use crystal_gpu::{
    submit_one_shot, AccelerationBuild, AccelerationGeometry, AccelerationStructureSizes,
    Barrier, Bindable, BufferCreateInfo, CommandRecorder, DescriptorWrite, GpuAllocatable,
    GpuBuffer, GpuError, GraphicsContext, InstanceGeometry, MemoryLocation, Registration,
    ResourceId, ResourceKind, Result, TriangleGeometry, Vertex,
};
use glam::Affine3A;

/// Storage, scratch and native handle shared by both tiers.
struct AccelerationCore {
    registration: Registration,
    ty: vk::AccelerationStructureTypeKHR,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    handle: vk::AccelerationStructureKHR,
    storage: Option<GpuBuffer>,
    scratch: Option<GpuBuffer>,
    sizes: AccelerationStructureSizes,
    built: bool,
}

impl AccelerationCore {
    fn new(
        ctx: &Arc<GraphicsContext>,
        ty: vk::AccelerationStructureTypeKHR,
        label: String,
        dependencies: &[ResourceId],
    ) -> Result<Self> {
        if !ctx.ray_tracing_enabled() {
            return Err(GpuError::Unsupported(format!(
                "acceleration structure '{label}' requires ray tracing"
            )));
        }
        let registration = Registration::new(ctx, ResourceKind::AccelerationStructure, label)?;
        registration.depend_on_all(dependencies)?;
        Ok(Self {
            registration,
            ty,
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            handle: vk::AccelerationStructureKHR::null(),
            storage: None,
            scratch: None,
            sizes: AccelerationStructureSizes::default(),
            built: false,
        })
    }

    fn ctx(&self) -> Arc<GraphicsContext> {
        Arc::clone(self.registration.context())
    }

    fn label(&self) -> &str {
        self.registration.label()
    }

    /// Make sure storage and scratch fit `geometries`. Returns whether the
    /// native handle changed.
    fn ensure_capacity(&mut self, geometries: &[AccelerationGeometry]) -> Result<bool> {
        let ctx = self.ctx();
        let sizes = ctx
            .device()
            .acceleration_structure_build_sizes(self.ty, geometries)?;
        self.sizes = sizes;

        let storage_fits = self
            .storage
            .as_ref()
            .is_some_and(|s| s.size() >= sizes.acceleration_structure_size);
        let grew = if storage_fits {
            false
        } else {
            let storage = GpuBuffer::create(
                &ctx,
                &BufferCreateInfo::new(
                    format!("{}_storage", self.label()),
                    sizes.acceleration_structure_size,
                    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                )
                .location(MemoryLocation::GpuOnly),
            )?;
            let handle = ctx.device().create_acceleration_structure(
                storage.handle(),
                sizes.acceleration_structure_size,
                self.ty,
            )?;

            let replaced = self.handle != vk::AccelerationStructureKHR::null();
            if replaced {
                // Earlier submissions may still read the old structure.
                ctx.wait_idle()?;
                ctx.device().destroy_acceleration_structure(self.handle);
                tracing::debug!(
                    label = %self.label(),
                    size = sizes.acceleration_structure_size,
                    "acceleration structure outgrew its storage"
                );
            }
            self.handle = handle;
            self.storage = Some(storage);
            replaced
        };

        let scratch_fits = self
            .scratch
            .as_ref()
            .is_some_and(|s| s.size() >= sizes.build_scratch_size);
        if !scratch_fits {
            self.scratch = Some(GpuBuffer::create(
                &ctx,
                &BufferCreateInfo::new(
                    format!("{}_scratch", self.label()),
                    sizes.build_scratch_size.max(1),
                    vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                )
                .location(MemoryLocation::GpuOnly),
            )?);
        }

        if grew {
            let invalidated = ctx
                .graph()
                .invalidate_dependents(self.registration.id());
            tracing::debug!(
                label = %self.label(),
                invalidated = invalidated.len(),
                "acceleration structure handle replaced"
            );
        }
        Ok(grew)
    }

    /// Check that every input is still alive and valid, and clear a stale
    /// invalid mark left by an earlier input rebuild.
    fn check_inputs(&self, inputs: &[ResourceId]) -> Result<()> {
        let ctx = self.ctx();
        let mut graph = ctx.graph();
        for &id in inputs {
            if !graph.contains(id) {
                return Err(GpuError::StaleReference(format!(
                    "input {id:?} of '{}' was released",
                    self.label()
                )));
            }
            if !graph.is_valid(id) {
                return Err(GpuError::StaleReference(format!(
                    "input '{}' of '{}' is invalid",
                    graph.label(id).unwrap_or_default(),
                    self.label()
                )));
            }
        }
        graph.revalidate(self.registration.id())
    }

    /// Record a full build, or run it synchronously when `recorder` is
    /// `None`. Bumps the generation on success and returns the new value.
    fn build(
        &mut self,
        geometries: Vec<AccelerationGeometry>,
        inputs: &[ResourceId],
        recorder: Option<&mut CommandRecorder<'_>>,
    ) -> Result<u64> {
        if self.registration.is_released() {
            return Err(GpuError::UnknownResource(self.registration.id()));
        }
        self.check_inputs(inputs)?;
        self.ensure_capacity(&geometries)?;

        let scratch_address = match &self.scratch {
            Some(scratch) => scratch.device_address()?,
            None => {
                return Err(GpuError::InvalidState(format!(
                    "'{}' has no scratch buffer",
                    self.label()
                )))
            }
        };
        let build = AccelerationBuild {
            ty: self.ty,
            flags: self.flags,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            src: vk::AccelerationStructureKHR::null(),
            dst: self.handle,
            scratch_address,
            geometries,
        };
        let id = self.registration.id();
        match recorder {
            Some(recorder) => {
                for &input in inputs {
                    recorder.reference(input);
                }
                recorder.build_acceleration_structure(build, id);
            }
            None => {
                let ctx = self.ctx();
                submit_one_shot(&ctx, |recorder| {
                    for &input in inputs {
                        recorder.reference(input);
                    }
                    recorder.build_acceleration_structure(build, id);
                    recorder.barrier(Barrier::acceleration_structure_build());
                    Ok(())
                })?;
            }
        }

        self.built = true;
        let generation = self.ctx().graph().bump_generation(id)?;
        tracing::trace!(label = %self.label(), generation, "built acceleration structure");
        Ok(generation)
    }

    fn generation(&self) -> u64 {
        self.ctx()
            .graph()
            .generation(self.registration.id())
            .unwrap_or_default()
    }

    fn device_address(&self) -> vk::DeviceAddress {
        self.registration
            .context()
            .device()
            .acceleration_structure_address(self.handle)
    }

    fn size_bytes(&self) -> u64 {
        if self.registration.is_released() {
            return 0;
        }
        self.storage.as_ref().map_or(0, GpuBuffer::size)
            + self.scratch.as_ref().map_or(0, GpuBuffer::size)
    }

    fn destroy(&mut self) -> Result<()> {
        self.registration.release()?;
        self.destroy_native();
        Ok(())
    }

    fn destroy_native(&mut self) {
        if self.handle != vk::AccelerationStructureKHR::null() {
            self.registration
                .context()
                .device()
                .destroy_acceleration_structure(self.handle);
            self.handle = vk::AccelerationStructureKHR::null();
        }
        self.storage = None;
        self.scratch = None;
    }
}

impl Drop for AccelerationCore {
    fn drop(&mut self) {
        self.destroy_native();
    }
}

/// Triangle input of a BLAS, read straight from mesh buffers.
#[derive(Clone, Copy)]
pub struct BlasGeometry<'a> {
    pub vertices: &'a GpuBuffer,
    pub indices: &'a GpuBuffer,
    pub vertex_count: u32,
    pub index_count: u32,
    pub vertex_stride: u64,
    pub vertex_format: vk::Format,
    pub opaque: bool,
}

impl<'a> BlasGeometry<'a> {
    /// Geometry for buffers holding [`Vertex`] data and `u32` indices.
    pub fn from_mesh_buffers(vertices: &'a GpuBuffer, indices: &'a GpuBuffer) -> Self {
        Self {
            vertices,
            indices,
            vertex_count: (vertices.size() / u64::from(Vertex::STRIDE)) as u32,
            index_count: (indices.size() / 4) as u32,
            vertex_stride: u64::from(Vertex::STRIDE),
            vertex_format: Vertex::POSITION_FORMAT,
            opaque: true,
        }
    }

    pub fn with_counts(mut self, vertex_count: u32, index_count: u32) -> Self {
        self.vertex_count = vertex_count;
        self.index_count = index_count;
        self
    }

    fn resolve(&self) -> Result<ResolvedGeometry> {
        if self.index_count % 3 != 0 {
            return Err(GpuError::InvalidState(format!(
                "index count {} of '{}' is not a multiple of 3",
                self.index_count,
                self.indices.label()
            )));
        }
        Ok(ResolvedGeometry {
            vertex_buffer: self.vertices.resource_id(),
            index_buffer: self.indices.resource_id(),
            triangles: TriangleGeometry {
                vertex_address: self.vertices.device_address()?,
                vertex_stride: self.vertex_stride,
                vertex_format: self.vertex_format,
                max_vertex: self.vertex_count.saturating_sub(1),
                index_address: self.indices.device_address()?,
                index_type: vk::IndexType::UINT32,
                triangle_count: self.index_count / 3,
                opaque: self.opaque,
            },
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ResolvedGeometry {
    vertex_buffer: ResourceId,
    index_buffer: ResourceId,
    triangles: TriangleGeometry,
}

/// Bottom-level acceleration structure over one mesh.
pub struct BottomLevelAccelerationStructure {
    core: AccelerationCore,
    geometry: ResolvedGeometry,
}

impl BottomLevelAccelerationStructure {
    /// Allocate a BLAS for `geometry`. It depends on the mesh buffers and is
    /// not built until [`rebuild`](Self::rebuild).
    pub fn new(
        ctx: &Arc<GraphicsContext>,
        label: impl Into<String>,
        geometry: &BlasGeometry<'_>,
    ) -> Result<Self> {
        let geometry = geometry.resolve()?;
        let mut core = AccelerationCore::new(
            ctx,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            label.into(),
            &[geometry.vertex_buffer, geometry.index_buffer],
        )?;
        core.ensure_capacity(&[AccelerationGeometry::Triangles(geometry.triangles)])?;
        Ok(Self { core, geometry })
    }

    /// Create and build synchronously.
    pub fn build_new(
        ctx: &Arc<GraphicsContext>,
        label: impl Into<String>,
        geometry: &BlasGeometry<'_>,
    ) -> Result<Self> {
        let mut blas = Self::new(ctx, label, geometry)?;
        blas.rebuild(None)?;
        Ok(blas)
    }

    /// Replace the geometry, for instance after the mesh changed size.
    /// The new buffers must be older than this structure.
    pub fn set_geometry(&mut self, geometry: &BlasGeometry<'_>) -> Result<()> {
        let resolved = geometry.resolve()?;
        let ctx = self.core.ctx();
        let id = self.core.registration.id();
        let mut graph = ctx.graph();
        let new = [resolved.vertex_buffer, resolved.index_buffer];
        graph.add_dependencies(id, &new)?;
        for old in [self.geometry.vertex_buffer, self.geometry.index_buffer] {
            if !new.contains(&old) {
                graph.remove_dependency(id, old);
            }
        }
        drop(graph);
        self.geometry = resolved;
        Ok(())
    }

    /// Rebuild from the current geometry and bump the generation. Every TLAS
    /// referencing this structure becomes stale until it is rebuilt too.
    ///
    /// With a `recorder`, the structure counts as built once the build is
    /// recorded. If that command buffer is never submitted, the caller must
    /// rebuild again.
    pub fn rebuild(&mut self, recorder: Option<&mut CommandRecorder<'_>>) -> Result<u64> {
        let inputs = [self.geometry.vertex_buffer, self.geometry.index_buffer];
        let generation = self.core.build(
            vec![AccelerationGeometry::Triangles(self.geometry.triangles)],
            &inputs,
            recorder,
        )?;
        if generation > 1 {
            let ctx = self.core.ctx();
            ctx.graph().invalidate_dependents(self.core.registration.id());
        }
        Ok(generation)
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.core.handle
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.core.device_address()
    }

    /// Number of successful builds.
    pub fn generation(&self) -> u64 {
        self.core.generation()
    }

    pub fn is_built(&self) -> bool {
        self.core.built
    }

    pub fn triangle_count(&self) -> u32 {
        self.geometry.triangles.triangle_count
    }

    pub fn build_sizes(&self) -> AccelerationStructureSizes {
        self.core.sizes
    }
}

impl GpuAllocatable for BottomLevelAccelerationStructure {
    fn registration(&self) -> &Registration {
        &self.core.registration
    }

    fn size_bytes(&self) -> u64 {
        self.core.size_bytes()
    }

    fn destroy(&mut self) -> Result<()> {
        self.core.destroy()
    }
}

impl std::fmt::Debug for BottomLevelAccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BottomLevelAccelerationStructure")
            .field("label", &self.core.label())
            .field("triangles", &self.geometry.triangles.triangle_count)
            .field("built", &self.core.built)
            .finish_non_exhaustive()
    }
}

/// Placement of one BLAS in a TLAS.
#[derive(Debug, Clone, Copy)]
pub struct AccelerationInstance<'a> {
    pub blas: &'a BottomLevelAccelerationStructure,
    pub transform: Affine3A,
    pub custom_index: u32,
    pub mask: u8,
    pub sbt_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

impl<'a> AccelerationInstance<'a> {
    pub fn new(blas: &'a BottomLevelAccelerationStructure) -> Self {
        Self {
            blas,
            transform: Affine3A::IDENTITY,
            custom_index: 0,
            mask: 0xFF,
            sbt_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        }
    }

    pub fn transform(mut self, transform: Affine3A) -> Self {
        self.transform = transform;
        self
    }

    pub fn custom_index(mut self, index: u32) -> Self {
        self.custom_index = index;
        self
    }

    pub fn mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    pub fn sbt_offset(mut self, offset: u32) -> Self {
        self.sbt_offset = offset;
        self
    }
}

/// Device layout of `VkAccelerationStructureInstanceKHR` (64 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 transform.
    pub transform: [f32; 12],
    pub custom_index_and_mask: u32,
    pub sbt_offset_and_flags: u32,
    pub blas_address: u64,
}

impl InstanceRecord {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    fn new(instance: &TlasInstance, blas_address: vk::DeviceAddress) -> Self {
        Self {
            transform: row_major_3x4(&instance.transform),
            custom_index_and_mask: (instance.custom_index & 0x00FF_FFFF)
                | (u32::from(instance.mask) << 24),
            sbt_offset_and_flags: (instance.sbt_offset & 0x00FF_FFFF)
                | ((instance.flags.as_raw() & 0xFF) << 24),
            blas_address,
        }
    }
}

fn row_major_3x4(transform: &Affine3A) -> [f32; 12] {
    let m = transform.matrix3;
    let t = transform.translation;
    [
        m.x_axis.x, m.y_axis.x, m.z_axis.x, t.x, //
        m.x_axis.y, m.y_axis.y, m.z_axis.y, t.y, //
        m.x_axis.z, m.y_axis.z, m.z_axis.z, t.z,
    ]
}

#[derive(Debug, Clone, Copy)]
struct TlasInstance {
    blas: ResourceId,
    transform: Affine3A,
    custom_index: u32,
    mask: u8,
    sbt_offset: u32,
    flags: vk::GeometryInstanceFlagsKHR,
    /// BLAS generation captured by the last TLAS build.
    built_generation: Option<u64>,
}

/// Top-level acceleration structure over a fixed set of BLAS instances.
///
/// The instance set is fixed at creation. Adding or removing a mesh means a
/// new TLAS; moving an instance is [`set_transform`](Self::set_transform)
/// followed by a rebuild.
pub struct TopLevelAccelerationStructure {
    core: AccelerationCore,
    instances: Vec<TlasInstance>,
    instance_buffer: GpuBuffer,
    transforms_dirty: bool,
}

impl TopLevelAccelerationStructure {
    /// Allocate a TLAS referencing `instances`. It depends on every
    /// referenced BLAS and is not built until [`rebuild`](Self::rebuild).
    pub fn new(
        ctx: &Arc<GraphicsContext>,
        label: impl Into<String>,
        instances: &[AccelerationInstance<'_>],
    ) -> Result<Self> {
        let label = label.into();
        let blas_ids: Vec<ResourceId> = instances.iter().map(|i| i.blas.resource_id()).collect();

        let instance_buffer = GpuBuffer::create(
            ctx,
            &BufferCreateInfo::new(
                format!("{label}_instances"),
                InstanceRecord::SIZE * instances.len().max(1) as u64,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            )
            .location(MemoryLocation::CpuToGpu),
        )?;
        let mut core = AccelerationCore::new(
            ctx,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            label,
            &blas_ids,
        )?;

        let instances: Vec<TlasInstance> = instances
            .iter()
            .map(|i| TlasInstance {
                blas: i.blas.resource_id(),
                transform: i.transform,
                custom_index: i.custom_index,
                mask: i.mask,
                sbt_offset: i.sbt_offset,
                flags: i.flags,
                built_generation: None,
            })
            .collect();
        let geometry = instance_geometry(&instance_buffer, instances.len())?;
        core.ensure_capacity(&[geometry])?;
        tracing::debug!(label = %core.label(), instances = instances.len(), "created TLAS");

        Ok(Self {
            core,
            instances,
            instance_buffer,
            transforms_dirty: false,
        })
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// BLASes referenced by this TLAS, in instance order.
    pub fn referenced_blases(&self) -> Vec<ResourceId> {
        self.instances.iter().map(|i| i.blas).collect()
    }

    /// Move instance `index`. Takes effect at the next rebuild.
    pub fn set_transform(&mut self, index: usize, transform: Affine3A) -> Result<()> {
        let instance = self.instances.get_mut(index).ok_or_else(|| {
            GpuError::InvalidState(format!("TLAS has no instance {index}"))
        })?;
        instance.transform = transform;
        self.transforms_dirty = true;
        Ok(())
    }

    /// Rewrite the instance buffer from the current BLAS addresses and
    /// rebuild. `blases` must contain every referenced BLAS, in any order.
    /// A recorded build counts as done once recorded, as for a BLAS.
    pub fn rebuild(
        &mut self,
        blases: &[&BottomLevelAccelerationStructure],
        recorder: Option<&mut CommandRecorder<'_>>,
    ) -> Result<u64> {
        let mut records = Vec::with_capacity(self.instances.len());
        let mut generations = Vec::with_capacity(self.instances.len());
        for instance in &self.instances {
            let blas = blases
                .iter()
                .find(|b| b.resource_id() == instance.blas)
                .ok_or_else(|| {
                    GpuError::StaleReference(format!(
                        "BLAS {:?} of '{}' was not supplied to the rebuild",
                        instance.blas,
                        self.core.label()
                    ))
                })?;
            if !blas.is_built() {
                return Err(GpuError::InvalidState(format!(
                    "BLAS '{}' must be built before TLAS '{}'",
                    blas.label(),
                    self.core.label()
                )));
            }
            records.push(InstanceRecord::new(instance, blas.device_address()));
            generations.push(blas.generation());
        }
        if !records.is_empty() {
            self.instance_buffer.write(0, &records)?;
        }

        let geometry = instance_geometry(&self.instance_buffer, self.instances.len())?;
        let inputs = self.referenced_blases();
        let generation = self.core.build(vec![geometry], &inputs, recorder)?;

        for (instance, built) in self.instances.iter_mut().zip(generations) {
            instance.built_generation = Some(built);
        }
        self.transforms_dirty = false;
        Ok(generation)
    }

    /// Fail with `StaleReference` unless every referenced BLAS still exists
    /// at the generation captured by the last build.
    pub fn check_current(&self) -> Result<()> {
        if self.core.registration.is_released() {
            return Err(GpuError::UnknownResource(self.core.registration.id()));
        }
        if !self.core.built {
            return Err(GpuError::StaleReference(format!(
                "TLAS '{}' was never built",
                self.core.label()
            )));
        }
        let ctx = self.core.ctx();
        let graph = ctx.graph();
        for instance in &self.instances {
            let Some(current) = graph.generation(instance.blas) else {
                return Err(GpuError::StaleReference(format!(
                    "TLAS '{}' references a released BLAS",
                    self.core.label()
                )));
            };
            if instance.built_generation != Some(current) {
                return Err(GpuError::StaleReference(format!(
                    "TLAS '{}' was built against generation {:?} of '{}', now {current}",
                    self.core.label(),
                    instance.built_generation,
                    graph.label(instance.blas).unwrap_or_default()
                )));
            }
        }
        if !graph.is_valid(self.core.registration.id()) {
            return Err(GpuError::StaleReference(format!(
                "TLAS '{}' must be rebuilt",
                self.core.label()
            )));
        }
        Ok(())
    }

    /// Require a rebuild before the next trace, e.g. after the command
    /// buffer holding the last build was dropped unsubmitted.
    pub fn mark_for_rebuild(&mut self) {
        self.transforms_dirty = true;
    }

    /// Whether a rebuild is required before the next trace.
    pub fn needs_rebuild(&self) -> bool {
        self.transforms_dirty || self.check_current().is_err()
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.core.handle
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.core.device_address()
    }

    pub fn generation(&self) -> u64 {
        self.core.generation()
    }

    pub fn is_built(&self) -> bool {
        self.core.built
    }
}

fn instance_geometry(buffer: &GpuBuffer, count: usize) -> Result<AccelerationGeometry> {
    Ok(AccelerationGeometry::Instances(InstanceGeometry {
        instances_address: buffer.device_address()?,
        instance_count: count as u32,
    }))
}

impl GpuAllocatable for TopLevelAccelerationStructure {
    fn registration(&self) -> &Registration {
        &self.core.registration
    }

    fn size_bytes(&self) -> u64 {
        if self.core.registration.is_released() {
            0
        } else {
            self.core.size_bytes() + self.instance_buffer.size()
        }
    }

    fn destroy(&mut self) -> Result<()> {
        self.core.destroy()?;
        self.instance_buffer.destroy()
    }
}

impl Bindable for TopLevelAccelerationStructure {
    fn natural_type(&self) -> vk::DescriptorType {
        vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
    }

    fn supports(&self, ty: vk::DescriptorType) -> bool {
        ty == vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
    }

    fn descriptor_write(&self, _ty: vk::DescriptorType) -> DescriptorWrite {
        DescriptorWrite::AccelerationStructure(self.core.handle)
    }
}

impl std::fmt::Debug for TopLevelAccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopLevelAccelerationStructure")
            .field("label", &self.core.label())
            .field("instances", &self.instances.len())
            .field("built", &self.core.built)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crystal_gpu::{GraphicsContextBuilder, PhysicalDeviceInfo, ResourceState};

    fn context() -> Arc<GraphicsContext> {
        GraphicsContextBuilder::new()
            .ray_tracing(true)
            .headless(PhysicalDeviceInfo::headless())
            .build()
            .unwrap()
    }

    fn mesh_buffers(ctx: &Arc<GraphicsContext>, triangles: u32) -> (GpuBuffer, GpuBuffer) {
        let usage = vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let vertices: Vec<Vertex> = (0..triangles * 3)
            .map(|i| Vertex::new([i as f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0]))
            .collect();
        let indices: Vec<u32> = (0..triangles * 3).collect();
        (
            GpuBuffer::from_slice(ctx, "vertices", usage, MemoryLocation::GpuOnly, &vertices)
                .unwrap(),
            GpuBuffer::from_slice(ctx, "indices", usage, MemoryLocation::GpuOnly, &indices)
                .unwrap(),
        )
    }

    #[test]
    fn instance_record_is_64_bytes() {
        assert_eq!(InstanceRecord::SIZE, 64);
    }

    #[test]
    fn transform_is_row_major() {
        let transform = Affine3A::from_translation(glam::Vec3::new(1.0, 2.0, 3.0));
        let rows = row_major_3x4(&transform);
        assert_eq!(rows[3], 1.0);
        assert_eq!(rows[7], 2.0);
        assert_eq!(rows[11], 3.0);
        assert_eq!(rows[0], 1.0);
        assert_eq!(rows[5], 1.0);
        assert_eq!(rows[10], 1.0);
    }

    #[test]
    fn requires_ray_tracing() {
        let ctx = GraphicsContextBuilder::new()
            .headless(PhysicalDeviceInfo::headless())
            .build()
            .unwrap();
        let (vertices, indices) = mesh_buffers(&ctx, 1);
        let err = BottomLevelAccelerationStructure::new(
            &ctx,
            "blas",
            &BlasGeometry::from_mesh_buffers(&vertices, &indices),
        )
        .unwrap_err();
        assert!(matches!(err, GpuError::Unsupported(_)));
    }

    #[test]
    fn blas_depends_on_mesh_buffers() {
        let ctx = context();
        let (vertices, indices) = mesh_buffers(&ctx, 2);
        let blas = BottomLevelAccelerationStructure::build_new(
            &ctx,
            "blas",
            &BlasGeometry::from_mesh_buffers(&vertices, &indices),
        )
        .unwrap();
        assert_eq!(blas.triangle_count(), 2);
        assert_eq!(blas.generation(), 1);
        let graph = ctx.graph();
        assert!(graph.depends_on(blas.resource_id(), vertices.resource_id()));
        assert!(graph.depends_on(blas.resource_id(), indices.resource_id()));
    }

    #[test]
    fn rebuild_keeps_handle_and_bumps_generation() {
        let ctx = context();
        let (vertices, indices) = mesh_buffers(&ctx, 4);
        let mut blas = BottomLevelAccelerationStructure::build_new(
            &ctx,
            "blas",
            &BlasGeometry::from_mesh_buffers(&vertices, &indices),
        )
        .unwrap();
        let handle = blas.handle();
        blas.rebuild(None).unwrap();
        assert_eq!(blas.handle(), handle);
        assert_eq!(blas.generation(), 2);
    }

    #[test]
    fn growth_replaces_handle_and_invalidates_dependents() {
        let ctx = context();
        let (small_v, small_i) = mesh_buffers(&ctx, 1);
        let (large_v, large_i) = mesh_buffers(&ctx, 64);
        let mut blas = BottomLevelAccelerationStructure::build_new(
            &ctx,
            "blas",
            &BlasGeometry::from_mesh_buffers(&small_v, &small_i),
        )
        .unwrap();
        let mut tlas =
            TopLevelAccelerationStructure::new(&ctx, "tlas", &[AccelerationInstance::new(&blas)])
                .unwrap();
        tlas.rebuild(&[&blas], None).unwrap();
        let old_handle = blas.handle();

        // The larger buffers are older than the BLAS, so they may be swapped in.
        blas.set_geometry(&BlasGeometry::from_mesh_buffers(&large_v, &large_i))
            .unwrap();
        blas.rebuild(None).unwrap();

        assert_ne!(blas.handle(), old_handle);
        assert_eq!(
            ctx.graph().state(tlas.resource_id()),
            Some(ResourceState::Invalid)
        );
        assert!(tlas.needs_rebuild());
        tlas.rebuild(&[&blas], None).unwrap();
        assert!(tlas.check_current().is_ok());
        assert!(!ctx.graph().depends_on(blas.resource_id(), small_v.resource_id()));
    }

    #[test]
    fn tlas_must_be_built_before_use() {
        let ctx = context();
        let (vertices, indices) = mesh_buffers(&ctx, 1);
        let blas = BottomLevelAccelerationStructure::build_new(
            &ctx,
            "blas",
            &BlasGeometry::from_mesh_buffers(&vertices, &indices),
        )
        .unwrap();
        let tlas =
            TopLevelAccelerationStructure::new(&ctx, "tlas", &[AccelerationInstance::new(&blas)])
                .unwrap();
        assert!(matches!(
            tlas.check_current(),
            Err(GpuError::StaleReference(_))
        ));
    }

    #[test]
    fn moved_instance_needs_rebuild() {
        let ctx = context();
        let (vertices, indices) = mesh_buffers(&ctx, 1);
        let blas = BottomLevelAccelerationStructure::build_new(
            &ctx,
            "blas",
            &BlasGeometry::from_mesh_buffers(&vertices, &indices),
        )
        .unwrap();
        let mut tlas =
            TopLevelAccelerationStructure::new(&ctx, "tlas", &[AccelerationInstance::new(&blas)])
                .unwrap();
        tlas.rebuild(&[&blas], None).unwrap();
        assert!(!tlas.needs_rebuild());

        tlas.set_transform(0, Affine3A::from_translation(glam::Vec3::X))
            .unwrap();
        assert!(tlas.needs_rebuild());
        tlas.rebuild(&[&blas], None).unwrap();
        assert!(!tlas.needs_rebuild());
    }

    #[test]
    fn marked_tlas_needs_rebuild() {
        let ctx = context();
        let (vertices, indices) = mesh_buffers(&ctx, 1);
        let blas = BottomLevelAccelerationStructure::build_new(
            &ctx,
            "blas",
            &BlasGeometry::from_mesh_buffers(&vertices, &indices),
        )
        .unwrap();
        let mut tlas =
            TopLevelAccelerationStructure::new(&ctx, "tlas", &[AccelerationInstance::new(&blas)])
                .unwrap();
        tlas.rebuild(&[&blas], None).unwrap();
        assert!(tlas.check_current().is_ok());

        tlas.mark_for_rebuild();
        assert!(tlas.needs_rebuild());
        let generation = tlas.rebuild(&[&blas], None).unwrap();
        assert_eq!(generation, 2);
        assert!(!tlas.needs_rebuild());
    }

    #[test]
    fn rebuild_without_every_blas_is_rejected() {
        let ctx = context();
        let (v1, i1) = mesh_buffers(&ctx, 1);
        let (v2, i2) = mesh_buffers(&ctx, 1);
        let a = BottomLevelAccelerationStructure::build_new(
            &ctx,
            "a",
            &BlasGeometry::from_mesh_buffers(&v1, &i1),
        )
        .unwrap();
        let b = BottomLevelAccelerationStructure::build_new(
            &ctx,
            "b",
            &BlasGeometry::from_mesh_buffers(&v2, &i2),
        )
        .unwrap();
        let mut tlas = TopLevelAccelerationStructure::new(
            &ctx,
            "tlas",
            &[AccelerationInstance::new(&a), AccelerationInstance::new(&b)],
        )
        .unwrap();
        assert!(matches!(
            tlas.rebuild(&[&a], None),
            Err(GpuError::StaleReference(_))
        ));
    }

    #[test]
    fn recorded_build_lands_in_caller_buffer() {
        let ctx = context();
        let (vertices, indices) = mesh_buffers(&ctx, 1);
        let mut blas = BottomLevelAccelerationStructure::new(
            &ctx,
            "blas",
            &BlasGeometry::from_mesh_buffers(&vertices, &indices),
        )
        .unwrap();
        let mut commands = crystal_gpu::CommandBufferManager::graphics(&ctx).unwrap();
        let index = commands.create_command_buffers(1).unwrap();
        let before = ctx.headless().unwrap().submissions();
        commands
            .record_command_buffer(index, |rec| {
                blas.rebuild(Some(&mut *rec))?;
                rec.barrier(Barrier::acceleration_structure_build());
                Ok(())
            })
            .unwrap();
        assert_eq!(ctx.headless().unwrap().submissions(), before);
        assert!(matches!(
            commands.commands(index).unwrap()[0],
            crystal_gpu::Command::BuildAccelerationStructure(_)
        ));
        assert_eq!(blas.generation(), 1);
    }
}
