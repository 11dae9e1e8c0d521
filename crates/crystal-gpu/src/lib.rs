//! GPU resource lifetime management for the Crystal engine.
//!
//! This crate provides:
//! - A dependency graph every GPU object registers in, enforcing teardown order
//! - Vulkan device creation and capability negotiation, plus a headless device
//! - Buffers, images, descriptor sets, render passes and rasterization pipelines
//! - Command buffer state tracking, submission and frame synchronization
//! - Deferred deletion for frames in flight

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod graph;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod render_pass;
pub mod resource;
pub mod sync;

pub use buffer::{BufferCreateInfo, GpuBuffer};
pub use capabilities::{GpuVendor, PhysicalDeviceInfo, QueueFamilies, RayTracingProperties};
pub use command::{
    submit_one_shot, Barrier, Command, CommandBufferManager, CommandBufferState, CommandRecorder,
    ImageBarrier, ShaderBindingRegions, SubmitInfo,
};
pub use context::{Backend, GraphicsContext, GraphicsContextBuilder};
pub use deferred::DeferredDeletionQueue;
pub use descriptors::{
    Bindable, DescriptorPool, DescriptorSet, DescriptorSetCreateInfo, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, LayoutBinding,
};
pub use device::{
    AccelerationBuild, AccelerationGeometry, AccelerationStructureSizes, DescriptorWrite, Device,
    HeadlessDevice, InstanceGeometry, TriangleGeometry,
};
pub use error::{GpuError, Result};
pub use graph::{DependencyGraph, Released, ResourceId, ResourceKind, ResourceState, TeardownPolicy};
pub use image::{max_mip_levels, GpuImage, ImageCreateInfo, SamplerConfig};
pub use pipeline::{
    PipelineLayout, RasterizationPipeline, RasterizationPipelineCreateInfo, ShaderModule, Vertex,
};
pub use render_pass::{
    create_framebuffers, rebuild_framebuffers, Framebuffer, RenderPass, RenderPassCreateInfo,
};
pub use resource::{GpuAllocatable, Registration};
pub use sync::{Fence, FrameSync, FrameSyncManager, Semaphore, DEFAULT_FENCE_TIMEOUT_NS};

pub use gpu_allocator::MemoryLocation;
