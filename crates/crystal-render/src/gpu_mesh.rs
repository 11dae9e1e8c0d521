//! Device-resident copies of scene meshes.

use std::sync::Arc;

use ash::vk;
use crystal_gpu::{
    CommandRecorder, DeferredDeletionQueue, GpuBuffer, GraphicsContext, MemoryLocation,
};
use crystal_rt::BlasGeometry;

use crate::error::Result;
use crate::scene::Mesh;

/// Vertex and index buffers of one mesh.
#[derive(Debug)]
pub struct GpuMesh {
    vertices: GpuBuffer,
    indices: GpuBuffer,
    vertex_count: u32,
    index_count: u32,
}

impl GpuMesh {
    /// Upload `mesh`. With `ray_tracing` the buffers are also usable as
    /// acceleration structure build input.
    pub fn upload(
        ctx: &Arc<GraphicsContext>,
        label: &str,
        mesh: &Mesh,
        ray_tracing: bool,
    ) -> crystal_gpu::Result<Self> {
        let mut usage = vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER;
        if ray_tracing {
            usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        }
        let vertices = GpuBuffer::from_slice(
            ctx,
            format!("{label}_vertices"),
            usage,
            MemoryLocation::GpuOnly,
            &mesh.vertices,
        )?;
        let indices = GpuBuffer::from_slice(
            ctx,
            format!("{label}_indices"),
            usage,
            MemoryLocation::GpuOnly,
            &mesh.indices,
        )?;
        Ok(Self {
            vertices,
            indices,
            vertex_count: mesh.vertices.len() as u32,
            index_count: mesh.indices.len() as u32,
        })
    }

    /// Upload, retrying once after dropping retired resources if memory ran out.
    pub fn upload_with_retry(
        ctx: &Arc<GraphicsContext>,
        label: &str,
        mesh: &Mesh,
        ray_tracing: bool,
        retired: &mut DeferredDeletionQueue,
    ) -> Result<Self> {
        let uploaded = ctx.with_allocation_retry(
            || {
                let dropped = retired.flush();
                tracing::debug!(dropped, "flushed retired resources");
                Ok(())
            },
            || Self::upload(ctx, label, mesh, ray_tracing),
        )?;
        Ok(uploaded)
    }

    /// Overwrite the buffers in place. Returns `false` when the counts
    /// differ and the mesh must be uploaded again instead.
    ///
    /// The buffers must not be in use by pending GPU work.
    pub fn update(&mut self, mesh: &Mesh) -> Result<bool> {
        if !self.fits(mesh) {
            return Ok(false);
        }
        self.vertices.upload(bytemuck::cast_slice(&mesh.vertices))?;
        self.indices.upload(bytemuck::cast_slice(&mesh.indices))?;
        Ok(true)
    }

    /// Whether `mesh` has the vertex and index counts of these buffers.
    pub fn fits(&self, mesh: &Mesh) -> bool {
        mesh.vertices.len() == self.vertex_count as usize
            && mesh.indices.len() == self.index_count as usize
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn vertices(&self) -> &GpuBuffer {
        &self.vertices
    }

    pub fn indices(&self) -> &GpuBuffer {
        &self.indices
    }

    pub fn blas_geometry(&self) -> BlasGeometry<'_> {
        BlasGeometry::from_mesh_buffers(&self.vertices, &self.indices)
    }

    /// Bind both buffers and draw every index.
    pub fn draw(&self, recorder: &mut CommandRecorder<'_>) {
        recorder.bind_vertex_buffer(&self.vertices, 0);
        recorder.bind_index_buffer(&self.indices, 0, vk::IndexType::UINT32);
        recorder.draw_indexed(self.index_count, 1, 0, 0);
    }
}
