//! Shader Binding Table (SBT) management for hardware ray tracing.
//!
//! The SBT is a GPU buffer containing shader handles organized by type:
//! - Ray generation shaders
//! - Miss shaders
//! - Hit groups (intersection + any-hit + closest-hit)
//! - Callable shaders
//!
//! Regions follow the group order the pipeline was created with. The table
//! remembers which pipeline incarnation it was built from; after
//! [`RayTracingPipeline::recreate`] it must be regenerated before tracing.

use std::sync::Arc;

use ash::vk;
use crystal_gpu::{
    BufferCreateInfo, GpuAllocatable, GpuBuffer, GpuError, GraphicsContext, MemoryLocation,
    RayTracingProperties, Registration, ResourceId, ResourceKind, Result, ShaderBindingRegions,
};

use crate::pipeline::{RayTracingPipeline, ShaderGroupCounts};

/// Align a value up to the given power-of-two alignment.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// Byte layout of a table, independent of any buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    /// Record stride: handle size aligned to the handle alignment.
    pub stride: u64,
    /// Distance between raygen records. Each must start on a base alignment.
    pub raygen_stride: u64,
    pub raygen_count: u32,
    pub miss_offset: u64,
    pub miss_size: u64,
    pub hit_offset: u64,
    pub hit_size: u64,
    pub callable_offset: u64,
    pub callable_size: u64,
    pub total_size: u64,
}

impl SbtLayout {
    pub fn compute(properties: &RayTracingProperties, counts: ShaderGroupCounts) -> Self {
        let base = u64::from(properties.shader_group_base_alignment);
        let stride = align_up(
            u64::from(properties.shader_group_handle_size),
            u64::from(properties.shader_group_handle_alignment),
        );
        let raygen_stride = align_up(stride, base);
        let region = |count: u32| align_up(stride * u64::from(count), base);

        let raygen_size = raygen_stride * u64::from(counts.raygen);
        let miss_offset = raygen_size;
        let miss_size = region(counts.miss);
        let hit_offset = miss_offset + miss_size;
        let hit_size = region(counts.hit);
        let callable_offset = hit_offset + hit_size;
        let callable_size = region(counts.callable);

        Self {
            stride,
            raygen_stride,
            raygen_count: counts.raygen,
            miss_offset,
            miss_size,
            hit_offset,
            hit_size,
            callable_offset,
            callable_size,
            total_size: callable_offset + callable_size,
        }
    }

    /// Byte offset of each group's record, in group order.
    pub fn record_offsets(&self, counts: ShaderGroupCounts) -> Vec<u64> {
        let raygen = (0..u64::from(counts.raygen)).map(|i| i * self.raygen_stride);
        let miss = (0..u64::from(counts.miss)).map(|i| self.miss_offset + i * self.stride);
        let hit = (0..u64::from(counts.hit)).map(|i| self.hit_offset + i * self.stride);
        let callable =
            (0..u64::from(counts.callable)).map(|i| self.callable_offset + i * self.stride);
        raygen.chain(miss).chain(hit).chain(callable).collect()
    }

    /// Device regions for a table at `address`, tracing from raygen `raygen`.
    pub fn regions(&self, address: vk::DeviceAddress, raygen: u32) -> ShaderBindingRegions {
        let region = |offset: u64, size: u64| {
            if size == 0 {
                vk::StridedDeviceAddressRegionKHR::default()
            } else {
                vk::StridedDeviceAddressRegionKHR {
                    device_address: address + offset,
                    stride: self.stride,
                    size,
                }
            }
        };
        ShaderBindingRegions {
            // Raygen size must equal its stride.
            raygen: vk::StridedDeviceAddressRegionKHR {
                device_address: address + u64::from(raygen) * self.raygen_stride,
                stride: self.stride,
                size: self.stride,
            },
            miss: region(self.miss_offset, self.miss_size),
            hit: region(self.hit_offset, self.hit_size),
            callable: region(self.callable_offset, self.callable_size),
        }
    }
}

/// Shader binding table for one ray tracing pipeline.
pub struct ShaderBindingTable {
    registration: Registration,
    buffer: GpuBuffer,
    layout: SbtLayout,
    counts: ShaderGroupCounts,
    pipeline_id: ResourceId,
    creation_token: u64,
}

impl ShaderBindingTable {
    /// Lay out the cached group handles of `pipeline` in a new table.
    pub fn new(ctx: &Arc<GraphicsContext>, pipeline: &RayTracingPipeline) -> Result<Self> {
        let label = format!("{}_sbt", pipeline.label());
        let (buffer, layout, counts) = write_table(ctx, &label, pipeline)?;
        let registration = Self::register(ctx, label, pipeline)?;
        tracing::debug!(
            label = %registration.label(),
            size = layout.total_size,
            "created shader binding table"
        );
        Ok(Self {
            registration,
            buffer,
            layout,
            counts,
            pipeline_id: pipeline.resource_id(),
            creation_token: pipeline.creation_token(),
        })
    }

    fn register(
        ctx: &Arc<GraphicsContext>,
        label: String,
        pipeline: &RayTracingPipeline,
    ) -> Result<Registration> {
        let registration = Registration::new(ctx, ResourceKind::ShaderBindingTable, label)?;
        registration.depend_on(pipeline.resource_id())?;
        Ok(registration)
    }

    /// Rebuild the table from a recreated pipeline.
    ///
    /// The table gets a new resource id, so command buffers recorded against
    /// the old table fail at submission.
    pub fn regenerate(&mut self, pipeline: &RayTracingPipeline) -> Result<()> {
        let ctx = Arc::clone(self.registration.context());
        let label = self.registration.label().to_string();
        let (buffer, layout, counts) = write_table(&ctx, &label, pipeline)?;
        self.registration.release()?;
        self.registration = Self::register(&ctx, label, pipeline)?;
        self.buffer = buffer;
        self.layout = layout;
        self.counts = counts;
        self.pipeline_id = pipeline.resource_id();
        self.creation_token = pipeline.creation_token();
        tracing::debug!(
            label = %self.registration.label(),
            creation_token = self.creation_token,
            "regenerated shader binding table"
        );
        Ok(())
    }

    /// Whether the table was built from exactly this pipeline.
    pub fn is_current_for(&self, pipeline: &RayTracingPipeline) -> bool {
        self.registration.is_valid()
            && self.pipeline_id == pipeline.resource_id()
            && self.creation_token == pipeline.creation_token()
    }

    /// Fail with `StaleReference` unless [`is_current_for`](Self::is_current_for).
    pub fn check_current_for(&self, pipeline: &RayTracingPipeline) -> Result<()> {
        if self.is_current_for(pipeline) {
            Ok(())
        } else {
            Err(GpuError::StaleReference(format!(
                "shader binding table '{}' was not built from pipeline '{}'",
                self.registration.label(),
                pipeline.label()
            )))
        }
    }

    /// Regions for a trace starting at the first raygen group.
    pub fn regions(&self) -> Result<ShaderBindingRegions> {
        self.regions_for_raygen(0)
    }

    pub fn regions_for_raygen(&self, raygen: u32) -> Result<ShaderBindingRegions> {
        if raygen >= self.counts.raygen {
            return Err(GpuError::InvalidState(format!(
                "raygen {raygen} out of range ({} groups)",
                self.counts.raygen
            )));
        }
        Ok(self.layout.regions(self.buffer.device_address()?, raygen))
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    pub fn pipeline_id(&self) -> ResourceId {
        self.pipeline_id
    }

    pub fn creation_token(&self) -> u64 {
        self.creation_token
    }

    /// Handle bytes stored for group `index`, read back from the table.
    pub fn record(&self, index: u32, handle_size: u32) -> Result<Vec<u8>> {
        let offsets = self.layout.record_offsets(self.counts);
        let offset = offsets.get(index as usize).copied().ok_or_else(|| {
            GpuError::InvalidState(format!("shader binding table has no record {index}"))
        })?;
        self.buffer.read_back(offset, handle_size as usize)
    }
}

fn write_table(
    ctx: &Arc<GraphicsContext>,
    label: &str,
    pipeline: &RayTracingPipeline,
) -> Result<(GpuBuffer, SbtLayout, ShaderGroupCounts)> {
    let properties = *ctx.ray_tracing_properties().ok_or_else(|| {
        GpuError::Unsupported("shader binding tables require ray tracing".to_string())
    })?;
    let counts = pipeline.group_counts();
    let layout = SbtLayout::compute(&properties, counts);

    let mut buffer = GpuBuffer::create(
        ctx,
        &BufferCreateInfo::new(
            label,
            layout.total_size.max(1),
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )
        .location(MemoryLocation::CpuToGpu),
    )?;

    let mut contents = vec![0u8; layout.total_size as usize];
    for (group, offset) in layout.record_offsets(counts).into_iter().enumerate() {
        let handle = pipeline.group_handle(group as u32).ok_or_else(|| {
            GpuError::ShaderGroupLayout(format!(
                "pipeline '{}' has no handle for group {group}",
                pipeline.label()
            ))
        })?;
        let start = offset as usize;
        contents[start..start + handle.len()].copy_from_slice(handle);
    }
    buffer.upload(&contents)?;
    Ok((buffer, layout, counts))
}

impl GpuAllocatable for ShaderBindingTable {
    fn registration(&self) -> &Registration {
        &self.registration
    }

    fn size_bytes(&self) -> u64 {
        if self.registration.is_released() {
            0
        } else {
            self.buffer.size()
        }
    }

    fn destroy(&mut self) -> Result<()> {
        self.registration.release()?;
        self.buffer.destroy()
    }
}

impl std::fmt::Debug for ShaderBindingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderBindingTable")
            .field("label", &self.registration.label())
            .field("layout", &self.layout)
            .field("creation_token", &self.creation_token)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RayTracingPipelineCreateInfo;
    use crystal_gpu::{GraphicsContextBuilder, PhysicalDeviceInfo, PipelineLayout};

    const SPIRV: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];

    fn counts(raygen: u32, miss: u32, hit: u32) -> ShaderGroupCounts {
        ShaderGroupCounts {
            raygen,
            miss,
            hit,
            callable: 0,
        }
    }

    #[test]
    fn align_up_test() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
    }

    #[test]
    fn layout_respects_alignments() {
        let properties = RayTracingProperties::default();
        let layout = SbtLayout::compute(&properties, counts(1, 2, 3));
        assert_eq!(layout.stride, 32);
        assert_eq!(layout.raygen_stride, 64);
        assert_eq!(layout.miss_offset, 64);
        assert_eq!(layout.miss_size, 64);
        assert_eq!(layout.hit_offset, 128);
        assert_eq!(layout.hit_size, 128);
        assert_eq!(layout.callable_size, 0);
        assert_eq!(layout.total_size, 256);
        assert_eq!(
            layout.record_offsets(counts(1, 2, 3)),
            vec![0, 64, 96, 128, 160, 192]
        );
    }

    #[test]
    fn handle_alignment_pads_stride() {
        let properties = RayTracingProperties {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 48,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 1,
        };
        let layout = SbtLayout::compute(&properties, counts(1, 1, 1));
        assert_eq!(layout.stride % 48, 0);
        assert_eq!(layout.miss_offset % 64, 0);
        assert_eq!(layout.hit_offset % 64, 0);
    }

    #[test]
    fn raygen_region_size_equals_stride() {
        let layout = SbtLayout::compute(&RayTracingProperties::default(), counts(2, 1, 1));
        let regions = layout.regions(0x1000, 1);
        assert_eq!(regions.raygen.size, regions.raygen.stride);
        assert_eq!(regions.raygen.device_address, 0x1000 + 64);
        assert_eq!(regions.raygen.device_address % 64, 0);
        assert_eq!(regions.callable.size, 0);
    }

    fn test_pipeline(ctx: &Arc<GraphicsContext>) -> RayTracingPipeline {
        let layout = PipelineLayout::new(ctx, &[], &[]).unwrap();
        let info = RayTracingPipelineCreateInfo::new("rt")
            .raygen(SPIRV.to_vec())
            .miss(SPIRV.to_vec())
            .triangles_hit(SPIRV.to_vec(), None);
        RayTracingPipeline::create(ctx, &info, &layout).unwrap()
    }

    #[test]
    fn table_holds_cached_handles_in_group_order() {
        let ctx = GraphicsContextBuilder::new()
            .ray_tracing(true)
            .headless(PhysicalDeviceInfo::headless())
            .build()
            .unwrap();
        let pipeline = test_pipeline(&ctx);
        let sbt = ShaderBindingTable::new(&ctx, &pipeline).unwrap();
        for group in 0..3 {
            assert_eq!(
                sbt.record(group, pipeline.handle_size()).unwrap(),
                pipeline.group_handle(group).unwrap()
            );
        }
        assert!(sbt.is_current_for(&pipeline));
    }

    #[test]
    fn recreated_pipeline_forces_regeneration() {
        let ctx = GraphicsContextBuilder::new()
            .ray_tracing(true)
            .headless(PhysicalDeviceInfo::headless())
            .build()
            .unwrap();
        let pipeline = test_pipeline(&ctx);
        let mut sbt = ShaderBindingTable::new(&ctx, &pipeline).unwrap();
        let old_id = sbt.resource_id();

        let pipeline = pipeline.recreate().unwrap();
        assert!(!sbt.is_current_for(&pipeline));
        assert!(!sbt.is_valid());
        assert!(matches!(
            sbt.check_current_for(&pipeline),
            Err(GpuError::StaleReference(_))
        ));

        sbt.regenerate(&pipeline).unwrap();
        assert!(sbt.is_current_for(&pipeline));
        assert_ne!(sbt.resource_id(), old_id);
        assert_eq!(
            sbt.record(0, pipeline.handle_size()).unwrap(),
            pipeline.group_handle(0).unwrap()
        );
    }
}
