//! The render loop on the headless device.

use crystal_gpu::{GpuAllocatable, GpuError};
use crystal_render::{
    BackendKind, HeadlessSettings, Mesh, RenderEngine, RenderError, Renderer, Scene, Settings,
    ShaderLibrary,
};
use glam::{Affine3A, Vec3};

fn settings(device_ray_tracing: bool, request_ray_tracing: bool) -> Settings {
    Settings::default()
        .with_backend(BackendKind::Headless)
        .with_headless(HeadlessSettings {
            ray_tracing: device_ray_tracing,
            memory_budget_mb: None,
        })
        .with_ray_tracing(request_ray_tracing)
        .with_resolution(64, 48)
}

fn engine(settings: &Settings) -> RenderEngine {
    RenderEngine::from_settings(settings, &ShaderLibrary::placeholder()).unwrap()
}

fn rasterizer() -> RenderEngine {
    engine(&settings(false, false))
}

fn ray_tracer() -> RenderEngine {
    engine(&settings(true, true))
}

fn two_mesh_scene() -> Scene {
    let mut scene = Scene::new();
    scene.add_mesh(Mesh::cube()).unwrap();
    scene
        .add_mesh(Mesh::triangle().with_transform(Affine3A::from_translation(Vec3::X * 3.0)))
        .unwrap();
    scene
}

/// `copies` cubes packed into one mesh.
fn cubes(copies: u32) -> Mesh {
    let cube = Mesh::cube();
    let stride = cube.vertices.len() as u32;
    let vertices = (0..copies).flat_map(|_| cube.vertices.iter().copied()).collect();
    let indices = (0..copies)
        .flat_map(|copy| cube.indices.iter().map(move |index| index + copy * stride))
        .collect();
    Mesh::new(vertices, indices)
}

fn tracer(engine: &RenderEngine) -> &crystal_render::RayTracer {
    match engine.renderer() {
        Renderer::RayTracer(tracer) => tracer,
        Renderer::Rasterizer(_) => panic!("expected the ray tracer"),
    }
}

#[test]
fn ray_tracing_request_on_unsupported_device_uses_the_rasterizer() {
    let mut engine = engine(&settings(false, true));
    assert_eq!(engine.renderer_name(), "rasterizer");
    assert!(matches!(engine.renderer(), Renderer::Rasterizer(_)));
    assert!(!engine.settings().ray_tracing);

    let output = engine.render_frame(&two_mesh_scene()).unwrap();
    assert_eq!(output.renderer, "rasterizer");

    let device = engine.context().headless().unwrap();
    assert_eq!(device.live_objects_of("acceleration_structure"), 0);
}

#[test]
fn ray_tracer_is_used_when_supported() {
    let mut engine = ray_tracer();
    assert_eq!(engine.renderer_name(), "ray_tracer");

    engine.render_frame(&two_mesh_scene()).unwrap();
    let tlas = tracer(&engine).tlas().unwrap();
    assert_eq!(tlas.instance_count(), 2);
    assert!(tlas.is_built());
    assert!(!tlas.needs_rebuild());
    // Two BLASes and the TLAS.
    let device = engine.context().headless().unwrap();
    assert_eq!(device.live_objects_of("acceleration_structure"), 3);
}

#[test]
fn frames_rotate_through_slots() {
    let mut engine = rasterizer();
    let scene = two_mesh_scene();
    let device_submissions = engine.context().headless().unwrap().submissions();

    let slots: Vec<usize> = (0..5)
        .map(|_| engine.render_frame(&scene).unwrap().slot)
        .collect();

    assert_eq!(slots, [0, 1, 0, 1, 0]);
    assert_eq!(engine.frame_number(), 5);
    // Mesh uploads on the first frame go through one-shot submissions too.
    assert!(engine.context().headless().unwrap().submissions() >= device_submissions + 5);
}

#[test]
fn each_slot_signals_its_own_semaphore() {
    let mut engine = rasterizer();
    let scene = Scene::new();
    let first = engine.render_frame(&scene).unwrap();
    let second = engine.render_frame(&scene).unwrap();
    let third = engine.render_frame(&scene).unwrap();

    assert_ne!(first.signal_semaphore, second.signal_semaphore);
    assert_eq!(first.signal_semaphore, third.signal_semaphore);
    assert_ne!(first.target, second.target);
    assert_eq!(first.command_buffer, third.command_buffer);
}

#[test]
fn editing_a_mesh_rebuilds_only_its_blas() {
    let mut engine = ray_tracer();
    let mut scene = two_mesh_scene();
    let ids: Vec<_> = scene.meshes().into_iter().map(|(id, _)| id).collect();
    engine.render_frame(&scene).unwrap();
    let tlas_generation = tracer(&engine).tlas().unwrap().generation();

    let mut edited = Mesh::triangle();
    for vertex in &mut edited.vertices {
        vertex.position[2] = 0.5;
    }
    scene
        .update_geometry(ids[1], edited.vertices, edited.indices)
        .unwrap();
    engine.render_frame(&scene).unwrap();

    let tracer = tracer(&engine);
    assert_eq!(tracer.blas(ids[0]).unwrap().generation(), 1);
    assert_eq!(tracer.blas(ids[1]).unwrap().generation(), 2);
    let tlas = tracer.tlas().unwrap();
    assert_eq!(tlas.generation(), tlas_generation + 1);
    assert!(tlas.check_current().is_ok());
}

#[test]
fn resizing_a_mesh_replaces_its_blas_and_the_tlas() {
    let mut engine = ray_tracer();
    let mut scene = two_mesh_scene();
    let ids: Vec<_> = scene.meshes().into_iter().map(|(id, _)| id).collect();
    engine.render_frame(&scene).unwrap();
    let old_blas = tracer(&engine).blas(ids[1]).unwrap().resource_id();
    let old_tlas = tracer(&engine).tlas().unwrap().resource_id();

    let cube = Mesh::cube();
    scene.update_geometry(ids[1], cube.vertices, cube.indices).unwrap();
    engine.render_frame(&scene).unwrap();

    let tracer = tracer(&engine);
    assert_ne!(tracer.blas(ids[1]).unwrap().resource_id(), old_blas);
    assert_ne!(tracer.tlas().unwrap().resource_id(), old_tlas);
    assert!(engine.pending_deletions() > 0);
}

#[test]
fn adding_a_mesh_builds_a_new_tlas_and_sets() {
    let mut engine = ray_tracer();
    let mut scene = two_mesh_scene();
    engine.render_frame(&scene).unwrap();
    let old_tlas = tracer(&engine).tlas().unwrap().resource_id();
    let old_set = tracer(&engine).descriptor_set(0).unwrap().resource_id();

    scene.add_mesh(Mesh::cube()).unwrap();
    engine.render_frame(&scene).unwrap();

    let tracer = tracer(&engine);
    let tlas = tracer.tlas().unwrap();
    assert_ne!(tlas.resource_id(), old_tlas);
    assert_eq!(tlas.instance_count(), 3);
    assert_ne!(tracer.descriptor_set(0).unwrap().resource_id(), old_set);
    assert!(engine.pending_deletions() > 0);
}

#[test]
fn retired_scene_is_dropped_once_frames_complete() {
    let mut engine = ray_tracer();
    let mut scene = two_mesh_scene();
    engine.render_frame(&scene).unwrap();
    let id = scene.meshes()[0].0;
    scene.remove_mesh(id);
    engine.render_frame(&scene).unwrap();
    assert!(engine.pending_deletions() > 0);

    for _ in 0..4 {
        engine.render_frame(&scene).unwrap();
    }
    assert_eq!(engine.pending_deletions(), 0);
    assert_eq!(tracer(&engine).mesh_count(), 1);
}

#[test]
fn moving_a_mesh_rebuilds_the_tlas_but_no_blas() {
    let mut engine = ray_tracer();
    let mut scene = two_mesh_scene();
    let id = scene.meshes()[0].0;
    engine.render_frame(&scene).unwrap();
    let tlas_id = tracer(&engine).tlas().unwrap().resource_id();
    let tlas_generation = tracer(&engine).tlas().unwrap().generation();

    scene
        .set_transform(id, Affine3A::from_translation(Vec3::Y))
        .unwrap();
    engine.render_frame(&scene).unwrap();

    let tracer = tracer(&engine);
    assert_eq!(tracer.blas(id).unwrap().generation(), 1);
    let tlas = tracer.tlas().unwrap();
    assert_eq!(tlas.resource_id(), tlas_id);
    assert_eq!(tlas.generation(), tlas_generation + 1);
}

#[test]
fn empty_scene_submits_without_tracing() {
    let mut engine = ray_tracer();
    let output = engine.render_frame(&Scene::new()).unwrap();
    assert_eq!(output.frame_number, 0);
    assert!(tracer(&engine).tlas().is_none());
}

#[test]
fn rasterizer_resize_rebuilds_framebuffers_and_pipeline() {
    let mut engine = rasterizer();
    let scene = two_mesh_scene();
    engine.render_frame(&scene).unwrap();

    engine.resize(32, 16).unwrap();
    for target in engine.targets() {
        assert_eq!(target.extent().width, 32);
        assert_eq!(target.extent().height, 16);
    }
    let Renderer::Rasterizer(raster) = engine.renderer() else {
        panic!("expected the rasterizer");
    };
    assert!(raster
        .framebuffers()
        .iter()
        .all(|fb| fb.is_valid() && fb.extent().width == 32));
    assert_eq!(raster.pipeline().extent().height, 16);
    assert_eq!(engine.settings().resolution.width, 32);

    engine.render_frame(&scene).unwrap();
}

#[test]
fn ray_tracer_resize_keeps_acceleration_structures() {
    let mut engine = ray_tracer();
    let scene = two_mesh_scene();
    engine.render_frame(&scene).unwrap();
    let tlas_generation = tracer(&engine).tlas().unwrap().generation();

    engine.resize(128, 96).unwrap();
    assert!(tracer(&engine).descriptor_set(0).unwrap().is_valid());
    engine.render_frame(&scene).unwrap();

    assert_eq!(tracer(&engine).tlas().unwrap().generation(), tlas_generation);
}

#[test]
fn zero_sized_resize_is_ignored() {
    let mut engine = rasterizer();
    engine.resize(0, 100).unwrap();
    assert_eq!(engine.targets()[0].extent().width, 64);
}

#[test]
fn stalled_device_times_out_and_recovers() {
    let mut engine = engine(&settings(false, false).with_frames_in_flight(1));
    let scene = two_mesh_scene();
    engine.render_frame(&scene).unwrap();

    let device = engine.context().headless().unwrap();
    device.set_stalled(true);
    let err = engine.render_frame(&scene).unwrap_err();
    assert!(matches!(err, RenderError::Gpu(GpuError::Timeout { .. })));
    assert!(!err.is_fatal());
    assert!(!engine.is_lost());

    engine.context().headless().unwrap().set_stalled(false);
    let output = engine.render_frame(&scene).unwrap();
    assert_eq!(output.frame_number, 1);
}

#[test]
fn device_loss_stops_the_engine() {
    let mut engine = ray_tracer();
    let scene = two_mesh_scene();
    engine.render_frame(&scene).unwrap();

    engine.context().headless().unwrap().lose_device();
    let err = engine.render_frame(&scene).unwrap_err();
    assert!(err.is_device_lost());
    assert!(err.is_fatal());
    assert!(engine.is_lost());

    let again = engine.render_frame(&Scene::new()).unwrap_err();
    assert!(again.is_device_lost());
    assert!(engine.resize(10, 10).unwrap_err().is_device_lost());
}

#[test]
fn ray_tracer_recovers_from_running_out_of_memory_mid_change() {
    let mut engine = ray_tracer();
    let mut scene = two_mesh_scene();
    let ids: Vec<_> = scene.meshes().into_iter().map(|(id, _)| id).collect();
    engine.render_frame(&scene).unwrap();
    let old_tlas = tracer(&engine).tlas().unwrap().resource_id();

    let device = engine.context().headless().unwrap();
    device.set_memory_budget(Some(device.memory_used()));
    let grown = cubes(64);
    scene
        .update_geometry(ids[1], grown.vertices.clone(), grown.indices.clone())
        .unwrap();
    let err = engine.render_frame(&scene).unwrap_err();
    assert!(matches!(err, RenderError::Gpu(ref e) if e.is_allocation()));
    assert!(!err.is_fatal());

    // The failed change left the previous meshes and TLAS in place.
    let tracer_before = tracer(&engine);
    assert_eq!(tracer_before.mesh_count(), 2);
    assert_eq!(tracer_before.tlas().unwrap().resource_id(), old_tlas);
    assert_eq!(tracer_before.blas(ids[1]).unwrap().triangle_count(), 1);

    engine.context().headless().unwrap().set_memory_budget(None);
    for _ in 0..3 {
        engine.render_frame(&scene).unwrap();
    }
    let tracer = tracer(&engine);
    assert_eq!(tracer.mesh_count(), 2);
    assert_eq!(
        tracer.blas(ids[1]).unwrap().triangle_count() as usize,
        grown.triangle_count()
    );
    let tlas = tracer.tlas().unwrap();
    assert_ne!(tlas.resource_id(), old_tlas);
    assert_eq!(tlas.instance_count(), 2);
    assert!(tlas.check_current().is_ok());
}

#[test]
fn rasterizer_recovers_from_running_out_of_memory_mid_change() {
    let mut engine = rasterizer();
    let mut scene = two_mesh_scene();
    let ids: Vec<_> = scene.meshes().into_iter().map(|(id, _)| id).collect();
    engine.render_frame(&scene).unwrap();

    let device = engine.context().headless().unwrap();
    device.set_memory_budget(Some(device.memory_used()));
    let grown = cubes(64);
    scene
        .update_geometry(ids[0], grown.vertices, grown.indices)
        .unwrap();
    scene.add_mesh(Mesh::triangle()).unwrap();
    assert!(engine.render_frame(&scene).is_err());
    let Renderer::Rasterizer(raster) = engine.renderer() else {
        panic!("expected the rasterizer");
    };
    assert_eq!(raster.mesh_count(), 2);

    engine.context().headless().unwrap().set_memory_budget(None);
    for _ in 0..3 {
        engine.render_frame(&scene).unwrap();
    }
    let Renderer::Rasterizer(raster) = engine.renderer() else {
        panic!("expected the rasterizer");
    };
    assert_eq!(raster.mesh_count(), 3);
}

#[test]
fn rasterizer_texture_carries_a_mip_chain() {
    let mut engine = RenderEngine::from_settings(
        &settings(false, false).with_mip_levels(4),
        &ShaderLibrary::placeholder(),
    )
    .unwrap();
    engine.render_frame(&two_mesh_scene()).unwrap();
    let Renderer::Rasterizer(raster) = engine.renderer() else {
        panic!("expected the rasterizer");
    };
    assert_eq!(raster.texture().mip_levels(), 4);
    assert_eq!(
        raster.texture().layout(),
        ash::vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    );

    // The 64x64 checker has seven levels at most.
    let capped = RenderEngine::from_settings(
        &settings(false, false).with_mip_levels(100),
        &ShaderLibrary::placeholder(),
    )
    .unwrap();
    let Renderer::Rasterizer(raster) = capped.renderer() else {
        panic!("expected the rasterizer");
    };
    assert_eq!(raster.texture().mip_levels(), 7);
}

#[test]
fn memory_budget_from_settings_reaches_the_device() {
    let mut settings = settings(false, false);
    settings.headless.memory_budget_mb = Some(1);
    let mut engine = engine(&settings);
    engine.render_frame(&two_mesh_scene()).unwrap();
    assert!(engine.context().headless().unwrap().memory_used() <= 1024 * 1024);
}

#[test]
fn dropping_the_engine_releases_native_objects() {
    let mut engine = ray_tracer();
    let ctx = std::sync::Arc::clone(engine.context());
    let mut scene = two_mesh_scene();
    engine.render_frame(&scene).unwrap();
    scene.add_mesh(Mesh::cube()).unwrap();
    engine.render_frame(&scene).unwrap();
    drop(engine);

    let device = ctx.headless().unwrap();
    assert_eq!(device.live_objects_of("acceleration_structure"), 0);
    assert_eq!(device.live_objects_of("buffer"), 0);
    assert_eq!(device.live_objects_of("descriptor_set"), 0);
}
