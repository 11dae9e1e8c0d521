//! GPU error types.

use ash::vk;
use thiserror::Error;

use crate::graph::ResourceId;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error that has no more specific mapping.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// Device or host memory exhausted.
    #[error("Memory allocation failed: {0}")]
    Allocation(String),

    /// A dependency edge would point at a resource created later than its dependent.
    #[error("Dependency cycle: {dependent:?} cannot depend on {dependency:?}")]
    Cycle {
        dependent: ResourceId,
        dependency: ResourceId,
    },

    /// Release refused because live dependents still reference the resource.
    #[error("Resource {id:?} still has {count} live dependent(s)")]
    DependentsAlive { id: ResourceId, count: usize },

    /// The id does not name a live resource.
    #[error("Unknown resource: {0:?}")]
    UnknownResource(ResourceId),

    /// A command buffer was touched while the GPU may still be executing it.
    #[error("Command buffer {index} is pending GPU completion")]
    UseAfterSubmit { index: usize },

    /// A top-level structure (or a recorded command) references an out-of-date resource.
    #[error("Stale reference: {0}")]
    StaleReference(String),

    /// The device was lost; the context must be torn down and recreated.
    #[error("GPU device lost")]
    DeviceLost,

    /// A fence wait timed out.
    #[error("Timed out after {timeout_ns} ns waiting for the GPU")]
    Timeout { timeout_ns: u64 },

    /// A descriptor set was used before every declared binding was written.
    #[error("Descriptor set '{label}' has unwritten bindings {missing:?}")]
    BindingIncomplete { label: String, missing: Vec<u32> },

    /// A resource of the wrong kind was written to a binding slot.
    #[error("Binding {binding} expects {expected:?}, got {actual:?}")]
    BindingTypeMismatch {
        binding: u32,
        expected: vk::DescriptorType,
        actual: vk::DescriptorType,
    },

    /// Shader groups are not in raygen, miss, hit order.
    #[error("Invalid shader group layout: {0}")]
    ShaderGroupLayout(String),

    /// Required extension or feature not available.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Shader module creation failed.
    #[error("Shader module creation failed: {0}")]
    ShaderModule(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Errors after which the render loop must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceLost | Self::Cycle { .. } | Self::UseAfterSubmit { .. }
        )
    }

    /// Whether releasing unused resources and retrying once may help.
    pub fn is_allocation(&self) -> bool {
        matches!(self, Self::Allocation(_))
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::TIMEOUT => Self::Timeout { timeout_ns: 0 },
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY
            | vk::Result::ERROR_FRAGMENTED_POOL => Self::Allocation(result.to_string()),
            other => Self::Vulkan(other),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
