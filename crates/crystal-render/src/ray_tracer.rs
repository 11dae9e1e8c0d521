//! Hardware ray tracer.
//!
//! Every mesh gets its own BLAS; one TLAS instances them all. What a scene
//! change costs depends on its kind:
//!
//! - moved meshes only rewrite TLAS instance transforms
//! - edited meshes of unchanged size are re-uploaded in place and their
//!   BLAS is rebuilt
//! - added or removed meshes (or resized ones) get fresh buffers and BLASes
//!   plus a new TLAS and descriptor sets
//!
//! Builds are recorded into the frame's command buffer ahead of the trace,
//! separated from it by a build barrier.

use std::sync::Arc;

use ash::vk;
use crystal_gpu::{
    Barrier, BufferCreateInfo, CommandRecorder, DescriptorPool, DescriptorSet,
    DescriptorSetCreateInfo, DescriptorSetLayout, DescriptorSetLayoutBuilder, GpuBuffer,
    GpuImage, GraphicsContext, MemoryLocation, PipelineLayout,
};
use crystal_rt::{
    AccelerationInstance, BottomLevelAccelerationStructure, RayTracingPipeline,
    RayTracingPipelineCreateInfo, ShaderBindingTable, TopLevelAccelerationStructure,
    TraceDispatch, TraceRaysExt,
};
use glam::Affine3A;
use hashbrown::HashMap;

use crate::engine::{Frame, FrameRenderer, FrameUniforms, SceneUpdate};
use crate::error::Result;
use crate::gpu_mesh::GpuMesh;
use crate::scene::{Mesh, MeshId, SceneChanges};
use crate::settings::Settings;
use crate::shaders::ShaderLibrary;

const TLAS_BINDING: u32 = 0;
const OUTPUT_BINDING: u32 = 1;
const UNIFORM_BINDING: u32 = 2;

struct TracedMesh {
    id: MeshId,
    blas: BottomLevelAccelerationStructure,
    gpu: GpuMesh,
    transform: Affine3A,
    /// BLAS must be rebuilt before the next trace.
    dirty: bool,
}

/// Resources tied to one set of BLASes.
struct TracedScene {
    sets: Vec<DescriptorSet>,
    tlas: TopLevelAccelerationStructure,
    // Kept for the sets allocated from it.
    _pool: Arc<DescriptorPool>,
}

pub struct RayTracer {
    ctx: Arc<GraphicsContext>,
    scene: Option<TracedScene>,
    meshes: Vec<TracedMesh>,
    /// BLASes built by the last recorded frame.
    recorded_builds: Vec<MeshId>,
    sbt: ShaderBindingTable,
    pipeline: RayTracingPipeline,
    uniforms: Vec<GpuBuffer>,
    set_layout: Arc<DescriptorSetLayout>,
}

impl RayTracer {
    /// Targets must be single-sampled storage images.
    pub fn new(
        ctx: &Arc<GraphicsContext>,
        _settings: &Settings,
        shaders: &ShaderLibrary,
        targets: &[GpuImage],
    ) -> Result<Self> {
        let set_layout = DescriptorSetLayoutBuilder::new("trace")
            .acceleration_structure(
                TLAS_BINDING,
                vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            )
            .storage_image(OUTPUT_BINDING, vk::ShaderStageFlags::RAYGEN_KHR)
            .uniform_buffer(
                UNIFORM_BINDING,
                vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::MISS_KHR,
            )
            .build(ctx)?;
        let pipeline_layout = PipelineLayout::new(ctx, &[Arc::clone(&set_layout)], &[])?;
        let info = RayTracingPipelineCreateInfo::new("scene")
            .raygen(shaders.raygen.clone())
            .miss(shaders.miss.clone())
            .triangles_hit(shaders.closest_hit.clone(), None);
        let pipeline = RayTracingPipeline::create(ctx, &info, &pipeline_layout)?;
        let sbt = ShaderBindingTable::new(ctx, &pipeline)?;

        let uniforms = (0..targets.len())
            .map(|slot| {
                GpuBuffer::create(
                    ctx,
                    &BufferCreateInfo::new(
                        format!("trace_uniforms_{slot}"),
                        std::mem::size_of::<FrameUniforms>() as u64,
                        vk::BufferUsageFlags::UNIFORM_BUFFER,
                    )
                    .location(MemoryLocation::CpuToGpu),
                )
            })
            .collect::<crystal_gpu::Result<Vec<_>>>()?;

        Ok(Self {
            ctx: Arc::clone(ctx),
            scene: None,
            meshes: Vec::new(),
            recorded_builds: Vec::new(),
            sbt,
            pipeline,
            uniforms,
            set_layout,
        })
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    /// The current TLAS, if the scene has any mesh.
    pub fn tlas(&self) -> Option<&TopLevelAccelerationStructure> {
        self.scene.as_ref().map(|scene| &scene.tlas)
    }

    pub fn blas(&self, id: MeshId) -> Option<&BottomLevelAccelerationStructure> {
        self.meshes.iter().find(|m| m.id == id).map(|m| &m.blas)
    }

    pub fn descriptor_set(&self, slot: usize) -> Option<&DescriptorSet> {
        self.scene.as_ref().and_then(|scene| scene.sets.get(slot))
    }

    pub fn pipeline(&self) -> &RayTracingPipeline {
        &self.pipeline
    }

    pub fn shader_binding_table(&self) -> &ShaderBindingTable {
        &self.sbt
    }

    fn upload(&self, id: MeshId, mesh: &Mesh, update: &mut SceneUpdate<'_>) -> Result<TracedMesh> {
        let label = format!("mesh_{}", id.index());
        let gpu = GpuMesh::upload_with_retry(&self.ctx, &label, mesh, true, update.retired)?;
        let blas = BottomLevelAccelerationStructure::new(&self.ctx, label, &gpu.blas_geometry())?;
        Ok(TracedMesh {
            id,
            blas,
            gpu,
            transform: mesh.transform,
            dirty: true,
        })
    }

    /// Replace the TLAS and the sets reading it. The new TLAS is built by
    /// the next recorded frame.
    fn rebuild_scene(&mut self, update: &mut SceneUpdate<'_>) -> Result<()> {
        if let Some(old) = self.scene.take() {
            update.retired.retire(old, "traced_scene", update.frame_number);
        }
        if self.meshes.is_empty() {
            return Ok(());
        }

        let instances: Vec<AccelerationInstance<'_>> = self
            .meshes
            .iter()
            .zip(0u32..)
            .map(|(mesh, index)| {
                AccelerationInstance::new(&mesh.blas)
                    .transform(mesh.transform)
                    .custom_index(index)
            })
            .collect();
        let tlas = TopLevelAccelerationStructure::new(&self.ctx, "scene", &instances)?;

        let pool =
            DescriptorPool::for_layout(&self.ctx, &self.set_layout, update.targets.len() as u32)?;
        let sets = update
            .targets
            .iter()
            .zip(&self.uniforms)
            .enumerate()
            .map(|(slot, (target, uniforms))| {
                DescriptorSet::create(
                    &self.ctx,
                    DescriptorSetCreateInfo::new(format!("trace_{slot}"), &self.set_layout, &pool)
                        .bind(TLAS_BINDING, &tlas)
                        .bind(OUTPUT_BINDING, target)
                        .bind(UNIFORM_BINDING, uniforms),
                )
            })
            .collect::<crystal_gpu::Result<Vec<_>>>()?;

        tracing::debug!(instances = self.meshes.len(), "rebuilt traced scene");
        self.scene = Some(TracedScene {
            sets,
            tlas,
            _pool: pool,
        });
        Ok(())
    }
}

impl FrameRenderer for RayTracer {
    fn name(&self) -> &'static str {
        "ray_tracer"
    }

    fn on_scene_change(&mut self, mut update: SceneUpdate<'_>) -> Result<()> {
        let (scene, diff) = (update.scene, update.diff);
        // Allocate before touching the current meshes so a failure leaves
        // them and the TLAS intact for the retry.
        let mut fresh: HashMap<MeshId, TracedMesh> = HashMap::new();
        for (id, mesh) in scene.meshes() {
            // A BLAS may only use buffers older than itself, so resized
            // meshes get a new one.
            let reusable = self.meshes.iter().find(|traced| traced.id == id).is_some_and(|traced| {
                !diff.geometry.contains(&id) || traced.gpu.fits(mesh)
            });
            if !reusable {
                fresh.insert(id, self.upload(id, mesh, &mut update)?);
            }
        }

        let (kept, mut stale): (Vec<TracedMesh>, Vec<TracedMesh>) = self
            .meshes
            .drain(..)
            .partition(|traced| scene.mesh(traced.id).is_some());
        self.meshes = kept;
        // A failed rebuild leaves no scene behind.
        let new_tlas = !fresh.is_empty()
            || !stale.is_empty()
            || diff.changes.contains(SceneChanges::TOPOLOGY)
            || (self.scene.is_none() && !scene.is_empty());

        let mut result = Ok(());
        for traced in &mut self.meshes {
            let Some(mesh) = scene.mesh(traced.id) else {
                continue;
            };
            if let Some(replacement) = fresh.remove(&traced.id) {
                stale.push(std::mem::replace(traced, replacement));
            } else if result.is_ok() && diff.geometry.contains(&traced.id) {
                result = traced.gpu.update(mesh).map(|_| ());
                traced.dirty = true;
            }
            traced.transform = mesh.transform;
        }
        for (id, _) in scene.meshes() {
            if let Some(traced) = fresh.remove(&id) {
                self.meshes.push(traced);
            }
        }

        // The old TLAS references the stale meshes, so it goes even when an
        // in-place update failed.
        let rebuilt: Result<()> = if new_tlas {
            self.rebuild_scene(&mut update)
        } else {
            match &mut self.scene {
                Some(traced) if diff.changes.contains(SceneChanges::TRANSFORM) => self
                    .meshes
                    .iter()
                    .enumerate()
                    .try_for_each(|(index, mesh)| traced.tlas.set_transform(index, mesh.transform))
                    .map_err(Into::into),
                _ => Ok(()),
            }
        };

        // After the old TLAS, which references them, was retired.
        for mesh in stale {
            update.retired.retire(mesh, "stale_mesh", update.frame_number);
        }
        result.and(rebuilt)
    }

    fn record_frame(
        &mut self,
        recorder: &mut CommandRecorder<'_>,
        frame: &mut Frame<'_>,
    ) -> crystal_gpu::Result<()> {
        let Some(scene) = self.scene.as_mut() else {
            frame
                .target
                .transition(recorder, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            return Ok(());
        };

        self.recorded_builds.clear();
        let mut built = 0;
        for mesh in self.meshes.iter_mut().filter(|m| m.dirty) {
            mesh.blas.rebuild(Some(&mut *recorder))?;
            built += 1;
        }
        if built > 0 {
            recorder.barrier(Barrier::acceleration_structure_build());
        }
        if scene.tlas.needs_rebuild() {
            let blases: Vec<&BottomLevelAccelerationStructure> =
                self.meshes.iter().map(|m| &m.blas).collect();
            scene.tlas.rebuild(&blases, Some(&mut *recorder))?;
            recorder.barrier(Barrier::acceleration_structure_build());
        }
        tracing::trace!(blas_builds = built, "acceleration structures current");

        self.uniforms[frame.slot].write(0, &[FrameUniforms::new(frame)])?;
        frame.target.transition(recorder, vk::ImageLayout::GENERAL);
        let extent = frame.target.extent();
        let sets = [&scene.sets[frame.slot]];
        let dispatch = TraceDispatch::new(
            &self.pipeline,
            &self.sbt,
            &scene.tlas,
            extent.width,
            extent.height,
        )
        .descriptor_sets(&sets);
        recorder.trace(&dispatch)?;
        frame
            .target
            .transition(recorder, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

        // Builds count once the whole frame is recorded.
        for mesh in self.meshes.iter_mut().filter(|m| m.dirty) {
            mesh.dirty = false;
            self.recorded_builds.push(mesh.id);
        }
        Ok(())
    }

    fn frame_discarded(&mut self) {
        for mesh in &mut self.meshes {
            if self.recorded_builds.contains(&mesh.id) {
                mesh.dirty = true;
            }
        }
        self.recorded_builds.clear();
        // Its last build may have been in the discarded frame.
        if let Some(scene) = &mut self.scene {
            scene.tlas.mark_for_rebuild();
        }
    }

    fn on_resize(&mut self, targets: &[GpuImage]) -> Result<()> {
        // Resizing kept the target ids; only the image views changed.
        if let Some(scene) = &mut self.scene {
            for (set, target) in scene.sets.iter_mut().zip(targets) {
                set.bind(OUTPUT_BINDING, target)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for RayTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayTracer")
            .field("meshes", &self.meshes.len())
            .field("tlas", &self.tlas())
            .field("pipeline", &self.pipeline.label())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TARGET_FORMAT;
    use crate::scene::{Scene, SceneSnapshot};
    use crystal_gpu::{
        Command, CommandBufferManager, DeferredDeletionQueue, GraphicsContextBuilder,
        ImageCreateInfo, PhysicalDeviceInfo,
    };
    use glam::Mat4;

    struct Harness {
        tracer: RayTracer,
        targets: Vec<GpuImage>,
        retired: DeferredDeletionQueue,
        commands: CommandBufferManager,
        index: usize,
        uploaded: SceneSnapshot,
    }

    impl Harness {
        fn new() -> Self {
            let ctx = GraphicsContextBuilder::new()
                .ray_tracing(true)
                .headless(PhysicalDeviceInfo::headless())
                .build()
                .unwrap();
            let targets: Vec<GpuImage> = (0..2)
                .map(|i| {
                    let usage = vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC;
                    let info =
                        ImageCreateInfo::new(format!("target_{i}"), 16, 16, TARGET_FORMAT, usage);
                    GpuImage::create(&ctx, &info).unwrap()
                })
                .collect();
            let tracer = RayTracer::new(
                &ctx,
                &Settings::default(),
                &ShaderLibrary::placeholder(),
                &targets,
            )
            .unwrap();
            let mut commands = CommandBufferManager::graphics(&ctx).unwrap();
            let index = commands.create_command_buffers(1).unwrap();
            Self {
                tracer,
                targets,
                retired: DeferredDeletionQueue::new(2),
                commands,
                index,
                uploaded: SceneSnapshot::default(),
            }
        }

        fn apply(&mut self, scene: &Scene) {
            let diff = scene.diff(&self.uploaded);
            self.tracer
                .on_scene_change(SceneUpdate {
                    scene,
                    diff: &diff,
                    targets: &self.targets,
                    retired: &mut self.retired,
                    frame_number: 0,
                })
                .unwrap();
            self.uploaded = scene.snapshot();
        }

        fn record(&mut self) -> crystal_gpu::Result<()> {
            self.commands.reset_command_buffer(self.index)?;
            let tracer = &mut self.tracer;
            let mut frame = Frame {
                number: 0,
                slot: 0,
                target: &mut self.targets[0],
                view_projection: Mat4::IDENTITY,
            };
            self.commands
                .record_command_buffer(self.index, |rec| tracer.record_frame(rec, &mut frame))
        }

        fn builds(&self) -> usize {
            self.commands
                .commands(self.index)
                .unwrap()
                .iter()
                .filter(|c| matches!(c, Command::BuildAccelerationStructure(_)))
                .count()
        }
    }

    fn scene() -> (Scene, Vec<MeshId>) {
        let mut scene = Scene::new();
        let ids = vec![
            scene.add_mesh(Mesh::cube()).unwrap(),
            scene.add_mesh(Mesh::triangle()).unwrap(),
        ];
        (scene, ids)
    }

    fn flatten(scene: &mut Scene, id: MeshId) {
        let mut edited = Mesh::triangle();
        for vertex in &mut edited.vertices {
            vertex.position[2] = 0.25;
        }
        scene
            .update_geometry(id, edited.vertices, edited.indices)
            .unwrap();
    }

    #[test]
    fn first_frame_builds_every_structure() {
        let mut harness = Harness::new();
        let (scene, ids) = scene();
        harness.apply(&scene);
        harness.record().unwrap();
        // Two BLASes and the TLAS.
        assert_eq!(harness.builds(), 3);
        assert_eq!(harness.tracer.blas(ids[0]).unwrap().generation(), 1);

        harness.record().unwrap();
        assert_eq!(harness.builds(), 0);
    }

    #[test]
    fn failed_recording_keeps_blas_dirty() {
        let mut harness = Harness::new();
        let (mut scene, ids) = scene();
        harness.apply(&scene);
        harness.record().unwrap();

        flatten(&mut scene, ids[1]);
        harness.apply(&scene);
        // Leaves the output binding of set 0 pointing at the old image.
        harness.targets[0].resize(8, 8).unwrap();
        assert!(harness.record().is_err());
        assert_eq!(harness.tracer.blas(ids[1]).unwrap().generation(), 2);

        harness.tracer.on_resize(&harness.targets).unwrap();
        harness.record().unwrap();
        assert_eq!(harness.tracer.blas(ids[1]).unwrap().generation(), 3);
        assert_eq!(harness.tracer.blas(ids[0]).unwrap().generation(), 1);
        assert_eq!(harness.builds(), 2);
    }

    #[test]
    fn discarded_frame_repeats_its_builds() {
        let mut harness = Harness::new();
        let (mut scene, ids) = scene();
        harness.apply(&scene);
        harness.record().unwrap();

        flatten(&mut scene, ids[1]);
        harness.apply(&scene);
        harness.record().unwrap();
        assert_eq!(harness.builds(), 2);
        let tlas_generation = harness.tracer.tlas().unwrap().generation();

        // As after a failed submit.
        harness.tracer.frame_discarded();
        assert!(harness.tracer.tlas().unwrap().needs_rebuild());
        harness.record().unwrap();
        assert_eq!(harness.builds(), 2);
        assert_eq!(harness.tracer.blas(ids[1]).unwrap().generation(), 3);
        assert_eq!(harness.tracer.blas(ids[0]).unwrap().generation(), 1);
        assert_eq!(
            harness.tracer.tlas().unwrap().generation(),
            tlas_generation + 1
        );
    }
}
