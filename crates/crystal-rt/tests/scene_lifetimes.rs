//! Ray tracing resources used together on the headless device.

use std::sync::Arc;

use ash::vk;
use crystal_gpu::{
    Command, CommandBufferManager, CommandBufferState, DescriptorPool, DescriptorSet,
    DescriptorSetCreateInfo, DescriptorSetLayoutBuilder, Fence, GpuAllocatable, GpuBuffer,
    GpuError, GpuImage, GraphicsContext, GraphicsContextBuilder, ImageCreateInfo, MemoryLocation,
    PhysicalDeviceInfo, PipelineLayout, SubmitInfo, Vertex, DEFAULT_FENCE_TIMEOUT_NS,
};
use crystal_rt::{
    AccelerationInstance, BlasGeometry, BottomLevelAccelerationStructure, RayTracingPipeline,
    RayTracingPipelineCreateInfo, ShaderBindingTable, TopLevelAccelerationStructure,
    TraceDispatch, TraceRaysExt,
};
use glam::{Affine3A, Vec3};

const SPIRV: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];

fn context() -> Arc<GraphicsContext> {
    GraphicsContextBuilder::new()
        .ray_tracing(true)
        .headless(PhysicalDeviceInfo::headless())
        .build()
        .unwrap()
}

struct Mesh {
    vertices: GpuBuffer,
    indices: GpuBuffer,
}

fn triangle(ctx: &Arc<GraphicsContext>, name: &str) -> Mesh {
    let usage = vk::BufferUsageFlags::VERTEX_BUFFER
        | vk::BufferUsageFlags::INDEX_BUFFER
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    let vertices = [
        Vertex::new([0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0]),
        Vertex::new([1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0]),
        Vertex::new([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0]),
    ];
    Mesh {
        vertices: GpuBuffer::from_slice(
            ctx,
            format!("{name}_vertices"),
            usage,
            MemoryLocation::GpuOnly,
            &vertices,
        )
        .unwrap(),
        indices: GpuBuffer::from_slice(
            ctx,
            format!("{name}_indices"),
            usage,
            MemoryLocation::GpuOnly,
            &[0u32, 1, 2],
        )
        .unwrap(),
    }
}

fn blas(ctx: &Arc<GraphicsContext>, name: &str, mesh: &Mesh) -> BottomLevelAccelerationStructure {
    BottomLevelAccelerationStructure::build_new(
        ctx,
        name,
        &BlasGeometry::from_mesh_buffers(&mesh.vertices, &mesh.indices),
    )
    .unwrap()
}

fn scene_tlas(
    ctx: &Arc<GraphicsContext>,
    blases: &[&BottomLevelAccelerationStructure],
) -> TopLevelAccelerationStructure {
    let instances: Vec<AccelerationInstance<'_>> = blases
        .iter()
        .zip(0u8..)
        .map(|(b, i)| {
            AccelerationInstance::new(b)
                .transform(Affine3A::from_translation(Vec3::new(f32::from(i) * 2.0, 0.0, 0.0)))
        })
        .collect();
    let mut tlas = TopLevelAccelerationStructure::new(ctx, "scene", &instances).unwrap();
    tlas.rebuild(blases, None).unwrap();
    tlas
}

#[test]
fn rebuilding_one_blas_only_stales_the_tlas() {
    let ctx = context();
    let meshes: Vec<Mesh> = ["a", "b", "c"].iter().map(|n| triangle(&ctx, n)).collect();
    let mut blases: Vec<BottomLevelAccelerationStructure> = meshes
        .iter()
        .zip(["a", "b", "c"])
        .map(|(m, n)| blas(&ctx, n, m))
        .collect();
    let refs: Vec<&BottomLevelAccelerationStructure> = blases.iter().collect();
    let mut tlas = scene_tlas(&ctx, &refs);
    assert!(tlas.check_current().is_ok());

    let peer_generation = blases[0].generation();
    blases[1].rebuild(None).unwrap();

    assert!(matches!(
        tlas.check_current(),
        Err(GpuError::StaleReference(_))
    ));
    assert!(blases[0].is_valid());
    assert!(blases[2].is_valid());
    assert_eq!(blases[0].generation(), peer_generation);
    assert_eq!(blases[1].generation(), 2);

    let refs: Vec<&BottomLevelAccelerationStructure> = blases.iter().collect();
    tlas.rebuild(&refs, None).unwrap();
    assert!(tlas.check_current().is_ok());
    assert!(!tlas.needs_rebuild());
}

#[test]
fn destroyed_blas_leaves_tlas_unusable() {
    let ctx = context();
    let mesh = triangle(&ctx, "a");
    let mut lone = blas(&ctx, "a", &mesh);
    let tlas = scene_tlas(&ctx, &[&lone]);

    lone.destroy().unwrap();
    assert!(!tlas.is_valid());
    assert!(tlas.check_current().is_err());
}

struct Tracer {
    pipeline: RayTracingPipeline,
    layout: Arc<crystal_gpu::DescriptorSetLayout>,
    pool: Arc<DescriptorPool>,
}

fn tracer(ctx: &Arc<GraphicsContext>) -> Tracer {
    let layout = DescriptorSetLayoutBuilder::new("trace")
        .acceleration_structure(0, vk::ShaderStageFlags::RAYGEN_KHR)
        .storage_image(1, vk::ShaderStageFlags::RAYGEN_KHR)
        .build(ctx)
        .unwrap();
    let pipeline_layout = PipelineLayout::new(ctx, &[Arc::clone(&layout)], &[]).unwrap();
    let info = RayTracingPipelineCreateInfo::new("trace")
        .raygen(SPIRV.to_vec())
        .miss(SPIRV.to_vec())
        .triangles_hit(SPIRV.to_vec(), None);
    let pipeline = RayTracingPipeline::create(ctx, &info, &pipeline_layout).unwrap();
    let pool = DescriptorPool::for_layout(ctx, &layout, 2).unwrap();
    Tracer {
        pipeline,
        layout,
        pool,
    }
}

fn output_image(ctx: &Arc<GraphicsContext>) -> GpuImage {
    GpuImage::create(
        ctx,
        &ImageCreateInfo::new(
            "output",
            16,
            16,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::STORAGE,
        ),
    )
    .unwrap()
}

#[test]
fn trace_is_recorded_and_submitted() {
    let ctx = context();
    let mesh = triangle(&ctx, "a");
    let blas = blas(&ctx, "a", &mesh);
    let tlas = scene_tlas(&ctx, &[&blas]);
    let image = output_image(&ctx);
    let tracer = tracer(&ctx);
    let sbt = ShaderBindingTable::new(&ctx, &tracer.pipeline).unwrap();
    let set = DescriptorSet::create(
        &ctx,
        DescriptorSetCreateInfo::new("trace", &tracer.layout, &tracer.pool)
            .bind(0, &tlas)
            .bind(1, &image),
    )
    .unwrap();

    let sets = [&set];
    let dispatch = TraceDispatch::new(&tracer.pipeline, &sbt, &tlas, 16, 16).descriptor_sets(&sets);
    let fence = Fence::new(&ctx, false).unwrap();
    let mut commands = CommandBufferManager::graphics(&ctx).unwrap();
    let index = commands.create_command_buffers(1).unwrap();
    commands
        .record_command_buffer(index, |rec| rec.trace(&dispatch))
        .unwrap();

    let recorded = commands.commands(index).unwrap();
    assert!(matches!(recorded.last(), Some(Command::TraceRays { width: 16, .. })));

    commands
        .submit(
            index,
            &SubmitInfo {
                fence: Some(&fence),
                ..Default::default()
            },
        )
        .unwrap();
    commands
        .wait_for_completion(index, DEFAULT_FENCE_TIMEOUT_NS)
        .unwrap();
    assert_eq!(commands.state(index).unwrap(), CommandBufferState::Initial);
}

#[test]
fn stale_tlas_fails_before_recording() {
    let ctx = context();
    let mesh = triangle(&ctx, "a");
    let mut blas = blas(&ctx, "a", &mesh);
    let tlas = scene_tlas(&ctx, &[&blas]);
    let image = output_image(&ctx);
    let tracer = tracer(&ctx);
    let sbt = ShaderBindingTable::new(&ctx, &tracer.pipeline).unwrap();
    let set = DescriptorSet::create(
        &ctx,
        DescriptorSetCreateInfo::new("trace", &tracer.layout, &tracer.pool)
            .bind(0, &tlas)
            .bind(1, &image),
    )
    .unwrap();

    blas.rebuild(None).unwrap();

    let sets = [&set];
    let dispatch = TraceDispatch::new(&tracer.pipeline, &sbt, &tlas, 16, 16).descriptor_sets(&sets);
    let mut commands = CommandBufferManager::graphics(&ctx).unwrap();
    let index = commands.create_command_buffers(1).unwrap();
    let err = commands
        .record_command_buffer(index, |rec| rec.trace(&dispatch))
        .unwrap_err();

    assert!(matches!(err, GpuError::StaleReference(_)));
    assert!(commands.commands(index).unwrap().is_empty());
    assert_eq!(commands.state(index).unwrap(), CommandBufferState::Invalid);
}

#[test]
fn blas_rebuilt_after_recording_fails_submission() {
    let ctx = context();
    let mesh = triangle(&ctx, "a");
    let mut blas = blas(&ctx, "a", &mesh);
    let tlas = scene_tlas(&ctx, &[&blas]);
    let image = output_image(&ctx);
    let tracer = tracer(&ctx);
    let sbt = ShaderBindingTable::new(&ctx, &tracer.pipeline).unwrap();
    let set = DescriptorSet::create(
        &ctx,
        DescriptorSetCreateInfo::new("trace", &tracer.layout, &tracer.pool)
            .bind(0, &tlas)
            .bind(1, &image),
    )
    .unwrap();

    let sets = [&set];
    let dispatch = TraceDispatch::new(&tracer.pipeline, &sbt, &tlas, 8, 8).descriptor_sets(&sets);
    let mut commands = CommandBufferManager::graphics(&ctx).unwrap();
    let index = commands.create_command_buffers(1).unwrap();
    commands
        .record_command_buffer(index, |rec| rec.trace(&dispatch))
        .unwrap();

    blas.rebuild(None).unwrap();

    let err = commands.submit(index, &SubmitInfo::default()).unwrap_err();
    assert!(matches!(err, GpuError::StaleReference(_)));
    assert_eq!(ctx.headless().unwrap().submissions(), 0);
}

#[test]
fn recreated_pipeline_needs_a_regenerated_table() {
    let ctx = context();
    let mesh = triangle(&ctx, "a");
    let blas = blas(&ctx, "a", &mesh);
    let tlas = scene_tlas(&ctx, &[&blas]);
    let image = output_image(&ctx);
    let mut tracer = tracer(&ctx);
    let mut sbt = ShaderBindingTable::new(&ctx, &tracer.pipeline).unwrap();
    let set = DescriptorSet::create(
        &ctx,
        DescriptorSetCreateInfo::new("trace", &tracer.layout, &tracer.pool)
            .bind(0, &tlas)
            .bind(1, &image),
    )
    .unwrap();

    tracer.pipeline = tracer.pipeline.recreate().unwrap();
    let sets = [&set];
    {
        let dispatch =
            TraceDispatch::new(&tracer.pipeline, &sbt, &tlas, 8, 8).descriptor_sets(&sets);
        assert!(matches!(
            dispatch.validate(),
            Err(GpuError::StaleReference(_))
        ));
    }

    sbt.regenerate(&tracer.pipeline).unwrap();
    let dispatch = TraceDispatch::new(&tracer.pipeline, &sbt, &tlas, 8, 8).descriptor_sets(&sets);
    assert!(dispatch.validate().is_ok());
}
