//! Linear GPU memory allocations.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::command::submit_one_shot;
use crate::context::GraphicsContext;
use crate::descriptors::Bindable;
use crate::device::{BufferDesc, DescriptorWrite};
use crate::error::{GpuError, Result};
use crate::graph::ResourceKind;
use crate::memory::MemoryBlock;
use crate::resource::{GpuAllocatable, Registration};

/// Creation parameters of a [`GpuBuffer`].
#[derive(Debug, Clone)]
pub struct BufferCreateInfo<'a> {
    pub label: String,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub sharing_mode: vk::SharingMode,
    /// Uploaded after allocation, directly when mapped or through a staging
    /// buffer otherwise.
    pub initial_data: Option<&'a [u8]>,
}

impl<'a> BufferCreateInfo<'a> {
    pub fn new(label: impl Into<String>, size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            label: label.into(),
            size,
            usage,
            location: MemoryLocation::GpuOnly,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_data: None,
        }
    }

    pub fn location(mut self, location: MemoryLocation) -> Self {
        self.location = location;
        self
    }

    pub fn sharing_mode(mut self, sharing_mode: vk::SharingMode) -> Self {
        self.sharing_mode = sharing_mode;
        self
    }

    pub fn initial_data(mut self, data: &'a [u8]) -> Self {
        self.initial_data = Some(data);
        self
    }
}

/// A GPU buffer registered in the dependency graph.
#[derive(Debug)]
pub struct GpuBuffer {
    registration: Registration,
    buffer: vk::Buffer,
    memory: MemoryBlock,
    size: u64,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
}

impl GpuBuffer {
    /// Allocate a buffer. Fails with [`GpuError::Allocation`] when memory is exhausted.
    pub fn create(ctx: &Arc<GraphicsContext>, info: &BufferCreateInfo<'_>) -> Result<Self> {
        if info.size == 0 {
            return Err(GpuError::InvalidState(format!(
                "buffer '{}' has zero size",
                info.label
            )));
        }
        if let Some(data) = info.initial_data {
            if data.len() as u64 > info.size {
                return Err(GpuError::InvalidState(format!(
                    "initial data of {} bytes exceeds buffer '{}' of {} bytes",
                    data.len(),
                    info.label,
                    info.size
                )));
            }
        }

        let mut usage = info.usage;
        if info.initial_data.is_some() {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }

        let (buffer, memory) = ctx.device().create_buffer(&BufferDesc {
            label: &info.label,
            size: info.size,
            usage,
            location: info.location,
            sharing_mode: info.sharing_mode,
        })?;

        let registration = match Registration::new(ctx, ResourceKind::Buffer, info.label.clone()) {
            Ok(registration) => registration,
            Err(e) => {
                ctx.device().destroy_buffer(buffer, memory);
                return Err(e);
            }
        };

        tracing::trace!(label = %info.label, size = info.size, ?usage, "allocated buffer");

        let mut this = Self {
            registration,
            buffer,
            memory,
            size: info.size,
            usage,
            location: info.location,
        };

        if let Some(data) = info.initial_data {
            this.upload(data)?;
        }
        Ok(this)
    }

    /// Allocate a buffer holding `data`.
    pub fn from_slice<T: bytemuck::Pod>(
        ctx: &Arc<GraphicsContext>,
        label: impl Into<String>,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        data: &[T],
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let info = BufferCreateInfo::new(label, bytes.len().max(1) as u64, usage)
            .location(location)
            .initial_data(bytes);
        Self::create(ctx, &info)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    /// Whether the CPU can write the buffer directly.
    pub fn is_host_visible(&self) -> bool {
        self.memory.mapped_slice().is_some()
    }

    /// Device address. Requires `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> Result<vk::DeviceAddress> {
        if !self
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            return Err(GpuError::InvalidState(format!(
                "buffer '{}' lacks SHADER_DEVICE_ADDRESS usage",
                self.label()
            )));
        }
        self.ensure_live()?;
        Ok(self
            .registration
            .context()
            .device()
            .buffer_device_address(self.buffer))
    }

    /// Write typed data to host-visible memory at `offset`.
    pub fn write<T: bytemuck::Pod>(&mut self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Write raw bytes to host-visible memory at `offset`.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        self.memory.write_bytes(offset, data)
    }

    /// Read back host-visible memory.
    pub fn read_back(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.ensure_live()?;
        self.memory.read_bytes(offset, len)
    }

    /// Fill the buffer from the start, staging through a temporary buffer
    /// when the memory is not mapped.
    pub fn upload(&mut self, data: &[u8]) -> Result<()> {
        if self.is_host_visible() {
            return self.write_bytes(0, data);
        }
        if data.is_empty() {
            return Ok(());
        }

        let ctx = Arc::clone(self.registration.context());
        let mut staging = GpuBuffer::create(
            &ctx,
            &BufferCreateInfo::new(
                format!("{}_staging", self.label()),
                data.len() as u64,
                vk::BufferUsageFlags::TRANSFER_SRC,
            )
            .location(MemoryLocation::CpuToGpu),
        )?;
        staging.write_bytes(0, data)?;

        submit_one_shot(&ctx, |recorder| {
            recorder.copy_buffer(&staging, &*self, data.len() as u64);
            Ok(())
        })?;
        tracing::trace!(label = %self.label(), bytes = data.len(), "staged upload");
        staging.destroy()
    }

    /// Descriptor write covering the whole buffer.
    pub fn descriptor(&self, ty: vk::DescriptorType) -> DescriptorWrite {
        DescriptorWrite::Buffer {
            ty,
            buffer: self.buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.registration.is_released() {
            Err(GpuError::UnknownResource(self.registration.id()))
        } else {
            Ok(())
        }
    }

    fn destroy_native(&mut self) {
        if self.buffer != vk::Buffer::null() {
            let memory = std::mem::take(&mut self.memory);
            self.registration
                .context()
                .device()
                .destroy_buffer(self.buffer, memory);
            self.buffer = vk::Buffer::null();
        }
    }
}

impl GpuAllocatable for GpuBuffer {
    fn registration(&self) -> &Registration {
        &self.registration
    }

    fn size_bytes(&self) -> u64 {
        if self.registration.is_released() {
            0
        } else {
            self.size
        }
    }

    fn destroy(&mut self) -> Result<()> {
        self.registration.release()?;
        self.destroy_native();
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.destroy_native();
    }
}

impl Bindable for GpuBuffer {
    fn natural_type(&self) -> vk::DescriptorType {
        if self.usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            vk::DescriptorType::UNIFORM_BUFFER
        } else {
            vk::DescriptorType::STORAGE_BUFFER
        }
    }

    fn supports(&self, ty: vk::DescriptorType) -> bool {
        match ty {
            vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => {
                self.usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER)
            }
            vk::DescriptorType::STORAGE_BUFFER | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => {
                self.usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER)
            }
            _ => false,
        }
    }

    fn descriptor_write(&self, ty: vk::DescriptorType) -> DescriptorWrite {
        self.descriptor(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::PhysicalDeviceInfo;
    use crate::context::GraphicsContextBuilder;

    fn context() -> Arc<GraphicsContext> {
        GraphicsContextBuilder::new()
            .headless(PhysicalDeviceInfo::headless())
            .build()
            .unwrap()
    }

    #[test]
    fn create_registers_with_context_dependency() {
        let ctx = context();
        let buffer = GpuBuffer::create(
            &ctx,
            &BufferCreateInfo::new("vertices", 256, vk::BufferUsageFlags::VERTEX_BUFFER),
        )
        .unwrap();
        assert!(ctx.graph().depends_on(buffer.resource_id(), ctx.root()));
        assert!(buffer.is_valid());
        assert_eq!(buffer.size_bytes(), 256);
    }

    #[test]
    fn destroy_is_idempotent() {
        let ctx = context();
        let mut buffer = GpuBuffer::create(
            &ctx,
            &BufferCreateInfo::new("tmp", 64, vk::BufferUsageFlags::STORAGE_BUFFER),
        )
        .unwrap();
        let id = buffer.resource_id();
        buffer.destroy().unwrap();
        buffer.destroy().unwrap();
        assert!(!ctx.graph().contains(id));
        assert!(buffer.is_destroyed());
        assert_eq!(ctx.headless().unwrap().live_objects_of("buffer"), 0);
    }

    #[test]
    fn out_of_memory_surfaces_allocation_error() {
        let ctx = context();
        ctx.headless().unwrap().set_memory_budget(Some(128));
        let err = GpuBuffer::create(
            &ctx,
            &BufferCreateInfo::new("big", 4096, vk::BufferUsageFlags::STORAGE_BUFFER),
        )
        .unwrap_err();
        assert!(err.is_allocation());
        // Nothing half-registered is left behind.
        assert_eq!(ctx.graph().len(), 1);
    }

    #[test]
    fn initial_data_is_readable() {
        let ctx = context();
        let data = [1u32, 2, 3, 4];
        let buffer = GpuBuffer::from_slice(
            &ctx,
            "indices",
            vk::BufferUsageFlags::INDEX_BUFFER,
            MemoryLocation::CpuToGpu,
            &data,
        )
        .unwrap();
        let bytes = buffer.read_back(0, 16).unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, u32>(&bytes), &data);
    }

    #[test]
    fn device_address_requires_usage_flag() {
        let ctx = context();
        let plain = GpuBuffer::create(
            &ctx,
            &BufferCreateInfo::new("plain", 64, vk::BufferUsageFlags::STORAGE_BUFFER),
        )
        .unwrap();
        assert!(plain.device_address().is_err());

        let addressable = GpuBuffer::create(
            &ctx,
            &BufferCreateInfo::new(
                "addressable",
                64,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ),
        )
        .unwrap();
        assert_ne!(addressable.device_address().unwrap(), 0);
    }

    #[test]
    fn binding_support_follows_usage() {
        let ctx = context();
        let uniform = GpuBuffer::create(
            &ctx,
            &BufferCreateInfo::new("ubo", 64, vk::BufferUsageFlags::UNIFORM_BUFFER),
        )
        .unwrap();
        assert!(uniform.supports(vk::DescriptorType::UNIFORM_BUFFER));
        assert!(!uniform.supports(vk::DescriptorType::STORAGE_BUFFER));
        assert_eq!(uniform.natural_type(), vk::DescriptorType::UNIFORM_BUFFER);
    }
}
