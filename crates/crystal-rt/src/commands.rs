//! Recording ray dispatches.
//!
//! Everything a dispatch reads is checked before the first command is
//! recorded, so a stale TLAS or shader binding table fails the recording
//! instead of reaching the device.

use ash::vk;
use crystal_gpu::{CommandRecorder, DescriptorSet, GpuAllocatable, GpuError, Result};

use crate::acceleration::TopLevelAccelerationStructure;
use crate::pipeline::RayTracingPipeline;
use crate::sbt::ShaderBindingTable;

/// One `vkCmdTraceRaysKHR` and the state it needs bound.
pub struct TraceDispatch<'a> {
    pub pipeline: &'a RayTracingPipeline,
    pub sbt: &'a ShaderBindingTable,
    pub tlas: &'a TopLevelAccelerationStructure,
    /// Bound in order starting at set 0.
    pub descriptor_sets: &'a [&'a DescriptorSet],
    pub push_constants: Option<(vk::ShaderStageFlags, &'a [u8])>,
    pub raygen: u32,
    pub extent: vk::Extent3D,
}

impl<'a> TraceDispatch<'a> {
    pub fn new(
        pipeline: &'a RayTracingPipeline,
        sbt: &'a ShaderBindingTable,
        tlas: &'a TopLevelAccelerationStructure,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            pipeline,
            sbt,
            tlas,
            descriptor_sets: &[],
            push_constants: None,
            raygen: 0,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        }
    }

    pub fn descriptor_sets(mut self, sets: &'a [&'a DescriptorSet]) -> Self {
        self.descriptor_sets = sets;
        self
    }

    pub fn push_constants(mut self, stages: vk::ShaderStageFlags, data: &'a [u8]) -> Self {
        self.push_constants = Some((stages, data));
        self
    }

    pub fn raygen(mut self, raygen: u32) -> Self {
        self.raygen = raygen;
        self
    }

    /// Check every input without recording anything.
    pub fn validate(&self) -> Result<()> {
        self.tlas.check_current()?;
        self.sbt.check_current_for(self.pipeline)?;
        if !self.pipeline.is_valid() {
            return Err(GpuError::StaleReference(format!(
                "pipeline '{}' is no longer valid",
                self.pipeline.label()
            )));
        }
        for set in self.descriptor_sets {
            set.validate()?;
        }
        Ok(())
    }
}

/// Ray tracing commands on [`CommandRecorder`].
pub trait TraceRaysExt {
    /// Bind the pipeline and descriptor sets of `dispatch` and trace.
    fn trace(&mut self, dispatch: &TraceDispatch<'_>) -> Result<()>;
}

impl TraceRaysExt for CommandRecorder<'_> {
    fn trace(&mut self, dispatch: &TraceDispatch<'_>) -> Result<()> {
        dispatch.validate()?;
        let regions = dispatch.sbt.regions_for_raygen(dispatch.raygen)?;
        let layout = dispatch.pipeline.layout().handle();

        dispatch.pipeline.bind(self);
        for (index, set) in (0u32..).zip(dispatch.descriptor_sets) {
            self.bind_descriptor_set(vk::PipelineBindPoint::RAY_TRACING_KHR, layout, index, set)?;
        }
        if let Some((stages, data)) = dispatch.push_constants {
            self.push_constants(layout, stages, 0, data);
        }
        self.trace_rays(
            regions,
            dispatch.extent,
            &[
                dispatch.tlas.resource_id(),
                dispatch.sbt.resource_id(),
                dispatch.pipeline.resource_id(),
            ],
        );
        tracing::trace!(
            pipeline = %dispatch.pipeline.label(),
            width = dispatch.extent.width,
            height = dispatch.extent.height,
            "recorded trace"
        );
        Ok(())
    }
}
