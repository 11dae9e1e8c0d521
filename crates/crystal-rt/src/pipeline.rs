//! Ray tracing pipeline.
//!
//! Shader groups must be ordered raygen, then miss, then hit, then callable,
//! which is the order the shader binding table lays its regions out in.
//! Group handles are queried once at creation and cached for the lifetime of
//! the pipeline. Hot reload is [`RayTracingPipeline::recreate`], which yields
//! a new pipeline with a new creation token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use crystal_gpu::{
    CommandRecorder, GpuError, GraphicsContext, PipelineLayout, Registration, ResourceId,
    ResourceKind, Result, ShaderModule,
};

static NEXT_CREATION_TOKEN: AtomicU64 = AtomicU64::new(1);

/// One shader stage, as precompiled SPIR-V.
#[derive(Debug, Clone)]
pub struct RayTracingShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub code: Vec<u32>,
}

/// A shader group. Stage fields index into the pipeline's stage list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderGroup {
    /// Raygen, miss or callable shader.
    General { shader: u32 },
    TrianglesHit {
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
    ProceduralHit {
        intersection: u32,
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
}

/// Region of the shader binding table a group belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShaderGroupKind {
    Raygen,
    Miss,
    Hit,
    Callable,
}

/// Number of groups of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShaderGroupCounts {
    pub raygen: u32,
    pub miss: u32,
    pub hit: u32,
    pub callable: u32,
}

impl ShaderGroupCounts {
    pub fn total(&self) -> u32 {
        self.raygen + self.miss + self.hit + self.callable
    }
}

/// Ray tracing pipeline configuration.
#[derive(Debug, Clone)]
pub struct RayTracingPipelineCreateInfo {
    pub label: String,
    pub stages: Vec<RayTracingShaderStage>,
    pub groups: Vec<ShaderGroup>,
    pub max_recursion_depth: u32,
}

impl RayTracingPipelineCreateInfo {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            stages: Vec::new(),
            groups: Vec::new(),
            max_recursion_depth: 1,
        }
    }

    /// Append a stage without a group. Returns its index.
    pub fn push_stage(&mut self, stage: vk::ShaderStageFlags, code: Vec<u32>) -> u32 {
        self.stages.push(RayTracingShaderStage { stage, code });
        (self.stages.len() - 1) as u32
    }

    pub fn group(mut self, group: ShaderGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn raygen(self, code: Vec<u32>) -> Self {
        self.general(vk::ShaderStageFlags::RAYGEN_KHR, code)
    }

    pub fn miss(self, code: Vec<u32>) -> Self {
        self.general(vk::ShaderStageFlags::MISS_KHR, code)
    }

    pub fn callable(self, code: Vec<u32>) -> Self {
        self.general(vk::ShaderStageFlags::CALLABLE_KHR, code)
    }

    /// Triangle hit group with a closest-hit and optional any-hit shader.
    pub fn triangles_hit(mut self, closest_hit: Vec<u32>, any_hit: Option<Vec<u32>>) -> Self {
        let closest_hit = self.push_stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR, closest_hit);
        let any_hit = any_hit.map(|code| self.push_stage(vk::ShaderStageFlags::ANY_HIT_KHR, code));
        self.group(ShaderGroup::TrianglesHit {
            closest_hit: Some(closest_hit),
            any_hit,
        })
    }

    /// Procedural hit group with an intersection and closest-hit shader.
    pub fn procedural_hit(mut self, intersection: Vec<u32>, closest_hit: Vec<u32>) -> Self {
        let intersection = self.push_stage(vk::ShaderStageFlags::INTERSECTION_KHR, intersection);
        let closest_hit = self.push_stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR, closest_hit);
        self.group(ShaderGroup::ProceduralHit {
            intersection,
            closest_hit: Some(closest_hit),
            any_hit: None,
        })
    }

    pub fn max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    fn general(mut self, stage: vk::ShaderStageFlags, code: Vec<u32>) -> Self {
        let shader = self.push_stage(stage, code);
        self.group(ShaderGroup::General { shader })
    }

    /// Classify every group and check the raygen, miss, hit, callable order.
    pub fn validate(&self) -> Result<ShaderGroupCounts> {
        let mut counts = ShaderGroupCounts::default();
        let mut previous = ShaderGroupKind::Raygen;
        for (index, group) in self.groups.iter().enumerate() {
            let kind = self.classify(index, group)?;
            if kind < previous {
                return Err(GpuError::ShaderGroupLayout(format!(
                    "group {index} is {kind:?} but follows a {previous:?} group; \
                     expected raygen, miss, hit, callable order"
                )));
            }
            previous = kind;
            match kind {
                ShaderGroupKind::Raygen => counts.raygen += 1,
                ShaderGroupKind::Miss => counts.miss += 1,
                ShaderGroupKind::Hit => counts.hit += 1,
                ShaderGroupKind::Callable => counts.callable += 1,
            }
        }
        if counts.raygen == 0 {
            return Err(GpuError::ShaderGroupLayout(
                "pipeline has no raygen group".to_string(),
            ));
        }
        Ok(counts)
    }

    fn stage_of(&self, group: usize, shader: u32) -> Result<vk::ShaderStageFlags> {
        self.stages
            .get(shader as usize)
            .map(|s| s.stage)
            .ok_or_else(|| {
                GpuError::ShaderGroupLayout(format!(
                    "group {group} references missing stage {shader}"
                ))
            })
    }

    fn expect_stage(&self, group: usize, shader: u32, expected: vk::ShaderStageFlags) -> Result<()> {
        let stage = self.stage_of(group, shader)?;
        if stage == expected {
            Ok(())
        } else {
            Err(GpuError::ShaderGroupLayout(format!(
                "group {group} expects a {expected:?} shader at stage {shader}, found {stage:?}"
            )))
        }
    }

    fn classify(&self, index: usize, group: &ShaderGroup) -> Result<ShaderGroupKind> {
        match *group {
            ShaderGroup::General { shader } => match self.stage_of(index, shader)? {
                vk::ShaderStageFlags::RAYGEN_KHR => Ok(ShaderGroupKind::Raygen),
                vk::ShaderStageFlags::MISS_KHR => Ok(ShaderGroupKind::Miss),
                vk::ShaderStageFlags::CALLABLE_KHR => Ok(ShaderGroupKind::Callable),
                other => Err(GpuError::ShaderGroupLayout(format!(
                    "general group {index} cannot hold a {other:?} shader"
                ))),
            },
            ShaderGroup::TrianglesHit {
                closest_hit,
                any_hit,
            } => {
                if let Some(shader) = closest_hit {
                    self.expect_stage(index, shader, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?;
                }
                if let Some(shader) = any_hit {
                    self.expect_stage(index, shader, vk::ShaderStageFlags::ANY_HIT_KHR)?;
                }
                Ok(ShaderGroupKind::Hit)
            }
            ShaderGroup::ProceduralHit {
                intersection,
                closest_hit,
                any_hit,
            } => {
                self.expect_stage(index, intersection, vk::ShaderStageFlags::INTERSECTION_KHR)?;
                if let Some(shader) = closest_hit {
                    self.expect_stage(index, shader, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?;
                }
                if let Some(shader) = any_hit {
                    self.expect_stage(index, shader, vk::ShaderStageFlags::ANY_HIT_KHR)?;
                }
                Ok(ShaderGroupKind::Hit)
            }
        }
    }
}

fn group_info(group: &ShaderGroup) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    let unused = vk::SHADER_UNUSED_KHR;
    let info = vk::RayTracingShaderGroupCreateInfoKHR::default()
        .general_shader(unused)
        .closest_hit_shader(unused)
        .any_hit_shader(unused)
        .intersection_shader(unused);
    match *group {
        ShaderGroup::General { shader } => info
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(shader),
        ShaderGroup::TrianglesHit {
            closest_hit,
            any_hit,
        } => info
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .closest_hit_shader(closest_hit.unwrap_or(unused))
            .any_hit_shader(any_hit.unwrap_or(unused)),
        ShaderGroup::ProceduralHit {
            intersection,
            closest_hit,
            any_hit,
        } => info
            .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
            .intersection_shader(intersection)
            .closest_hit_shader(closest_hit.unwrap_or(unused))
            .any_hit_shader(any_hit.unwrap_or(unused)),
    }
}

/// Hardware ray tracing pipeline with its cached shader group handles.
pub struct RayTracingPipeline {
    registration: Registration,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
    info: RayTracingPipelineCreateInfo,
    counts: ShaderGroupCounts,
    group_handles: Vec<u8>,
    handle_size: u32,
    creation_token: u64,
}

impl RayTracingPipeline {
    /// Compile the stages and groups of `info` against `layout`.
    ///
    /// Fails with `Unsupported` when ray tracing was not negotiated and with
    /// `ShaderGroupLayout` when the groups are out of order.
    pub fn create(
        ctx: &Arc<GraphicsContext>,
        info: &RayTracingPipelineCreateInfo,
        layout: &Arc<PipelineLayout>,
    ) -> Result<Self> {
        let properties = *ctx.ray_tracing_properties().ok_or_else(|| {
            GpuError::Unsupported(format!(
                "ray tracing pipeline '{}' requires ray tracing",
                info.label
            ))
        })?;
        let counts = info.validate()?;

        let recursion = info
            .max_recursion_depth
            .min(properties.max_ray_recursion_depth);
        if recursion < info.max_recursion_depth {
            tracing::warn!(
                requested = info.max_recursion_depth,
                max = properties.max_ray_recursion_depth,
                "Clamping ray recursion depth"
            );
        }

        let modules = info
            .stages
            .iter()
            .map(|s| ShaderModule::new(ctx, s.stage, &s.code))
            .collect::<Result<Vec<_>>>()?;
        let stages: Vec<_> = modules.iter().map(ShaderModule::stage_info).collect();
        let groups: Vec<_> = info.groups.iter().map(group_info).collect();

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(recursion)
            .layout(layout.handle());
        let handle = ctx
            .device()
            .create_ray_tracing_pipeline(&pipeline_info)
            .map_err(|e| match e {
                GpuError::Unsupported(_) | GpuError::DeviceLost => e,
                other => GpuError::PipelineCreation(format!("{}: {other}", info.label)),
            })?;
        drop(modules);

        let group_handles = match ctx.device().shader_group_handles(
            handle,
            counts.total(),
            properties.shader_group_handle_size,
        ) {
            Ok(handles) => handles,
            Err(e) => {
                ctx.device().destroy_pipeline(handle);
                return Err(e);
            }
        };
        let registration = match Registration::new(ctx, ResourceKind::Pipeline, info.label.clone())
        {
            Ok(registration) => registration,
            Err(e) => {
                ctx.device().destroy_pipeline(handle);
                return Err(e);
            }
        };

        let creation_token = NEXT_CREATION_TOKEN.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            label = %info.label,
            groups = counts.total(),
            creation_token,
            "created ray tracing pipeline"
        );

        Ok(Self {
            registration,
            handle,
            layout: Arc::clone(layout),
            info: info.clone(),
            counts,
            group_handles,
            handle_size: properties.shader_group_handle_size,
            creation_token,
        })
    }

    /// Build a replacement from the same configuration and drop this one.
    ///
    /// Shader binding tables built from the old pipeline go stale and must be
    /// regenerated. The old pipeline must not be referenced by pending
    /// command buffers.
    pub fn recreate(self) -> Result<Self> {
        let ctx = Arc::clone(self.registration.context());
        let replacement = Self::create(&ctx, &self.info, &self.layout)?;
        drop(self);
        Ok(replacement)
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn label(&self) -> &str {
        self.registration.label()
    }

    pub fn resource_id(&self) -> ResourceId {
        self.registration.id()
    }

    pub fn context(&self) -> &Arc<GraphicsContext> {
        self.registration.context()
    }

    pub fn is_valid(&self) -> bool {
        self.registration.is_valid()
    }

    /// Distinguishes this pipeline from every other pipeline ever created,
    /// including earlier incarnations of the same configuration.
    pub fn creation_token(&self) -> u64 {
        self.creation_token
    }

    pub fn group_counts(&self) -> ShaderGroupCounts {
        self.counts
    }

    /// Size of one group handle in bytes.
    pub fn handle_size(&self) -> u32 {
        self.handle_size
    }

    /// Cached handle bytes of group `index`.
    pub fn group_handle(&self, index: u32) -> Option<&[u8]> {
        let size = self.handle_size as usize;
        let start = index as usize * size;
        self.group_handles.get(start..start + size)
    }

    /// Record a bind of this pipeline.
    pub fn bind(&self, recorder: &mut CommandRecorder<'_>) {
        recorder.bind_pipeline(
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            self.handle,
            self.registration.id(),
        );
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.registration.release()?;
        self.destroy_native();
        Ok(())
    }

    fn destroy_native(&mut self) {
        if self.handle != vk::Pipeline::null() {
            self.registration
                .context()
                .device()
                .destroy_pipeline(self.handle);
            self.handle = vk::Pipeline::null();
        }
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        self.destroy_native();
    }
}

impl std::fmt::Debug for RayTracingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayTracingPipeline")
            .field("label", &self.label())
            .field("groups", &self.counts)
            .field("creation_token", &self.creation_token)
            .finish_non_exhaustive()
    }
}
