//! Hardware ray tracing resources for the Crystal engine.
//!
//! This crate provides, on top of `crystal-gpu`:
//! - Bottom- and top-level acceleration structures over triangle meshes
//! - Ray tracing pipelines with cached shader group handles
//! - Shader binding tables laid out from those handles
//! - Recording of ray dispatches that refuses stale inputs
//!
//! Every type here requires a context created with ray tracing enabled and
//! fails with `GpuError::Unsupported` otherwise.
//!
//! # Example
//!
//! ```ignore
//! use crystal_rt::{BlasGeometry, BottomLevelAccelerationStructure};
//!
//! let blas = BottomLevelAccelerationStructure::build_new(
//!     &ctx,
//!     "cube",
//!     &BlasGeometry::from_mesh_buffers(&vertices, &indices),
//! )?;
//! ```

pub mod acceleration;
pub mod commands;
pub mod pipeline;
pub mod sbt;

pub use acceleration::{
    AccelerationInstance, BlasGeometry, BottomLevelAccelerationStructure, InstanceRecord,
    TopLevelAccelerationStructure,
};
pub use commands::{TraceDispatch, TraceRaysExt};
pub use pipeline::{
    RayTracingPipeline, RayTracingPipelineCreateInfo, RayTracingShaderStage, ShaderGroup,
    ShaderGroupCounts, ShaderGroupKind,
};
pub use sbt::{align_up, SbtLayout, ShaderBindingTable};

/// Check whether ray tracing resources can be created on `ctx`.
pub fn is_available(ctx: &crystal_gpu::GraphicsContext) -> bool {
    ctx.ray_tracing_enabled()
}
