//! Crystal headless runner
//!
//! Drives the render loop against the simulated device: builds a small scene,
//! animates it, edits and resizes meshes, adds and removes them, and resizes
//! the render targets along the way.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p crystal-headless -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `-c, --config <PATH>`: Settings file (TOML)
//! - `-s, --shaders <DIR>`: Directory of compiled SPIR-V shaders
//! - `-n, --frames <N>`: Number of frames to render (default: 120)
//! - `--raster`: Force the rasterizer even if ray tracing is available
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::path::PathBuf;

use anyhow::Context;
use crystal_render::{
    BackendKind, Mesh, MeshId, RenderEngine, Scene, Settings, ShaderLibrary,
};
use glam::{Affine3A, Mat4, Quat, Vec3};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FRAMES: u64 = 120;

/// Frames between scripted scene events.
const EVENT_INTERVAL: u64 = 30;

#[derive(Debug)]
struct Args {
    config: Option<PathBuf>,
    shaders: Option<PathBuf>,
    frames: u64,
    raster: bool,
}

impl Args {
    fn parse() -> anyhow::Result<Option<Self>> {
        let mut args = Self {
            config: None,
            shaders: None,
            frames: DEFAULT_FRAMES,
            raster: false,
        };
        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-h" | "--help" => return Ok(None),
                "-c" | "--config" => {
                    args.config = Some(iter.next().context("--config needs a path")?.into());
                }
                "-s" | "--shaders" => {
                    args.shaders = Some(iter.next().context("--shaders needs a directory")?.into());
                }
                "-n" | "--frames" => {
                    let value = iter.next().context("--frames needs a count")?;
                    args.frames = value
                        .parse()
                        .with_context(|| format!("invalid frame count '{value}'"))?;
                }
                "--raster" => args.raster = true,
                other => anyhow::bail!("unknown argument '{other}' (try --help)"),
            }
        }
        Ok(Some(args))
    }
}

fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let Some(args) = Args::parse()? else {
        print_help();
        return Ok(());
    };

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::default().with_ray_tracing(true),
    };
    if settings.backend != BackendKind::Headless {
        info!("Only the headless backend can run without a window, switching to it");
        settings.backend = BackendKind::Headless;
    }
    if args.raster {
        settings.ray_tracing = false;
    }

    let shaders = match &args.shaders {
        Some(dir) => ShaderLibrary::load_dir(dir)?,
        None => ShaderLibrary::placeholder(),
    };

    let mut engine = RenderEngine::from_settings(&settings, &shaders)?;
    info!(
        renderer = engine.renderer_name(),
        width = engine.settings().resolution.width,
        height = engine.settings().resolution.height,
        frames_in_flight = engine.settings().frames_in_flight,
        "Engine ready"
    );

    let mut demo = Demo::new(&settings)?;
    let mut timeouts = 0u32;
    for frame in 0..args.frames {
        demo.step(frame, &mut engine)?;
        match engine.render_frame(&demo.scene) {
            Ok(output) => {
                tracing::trace!(
                    frame = output.frame_number,
                    slot = output.slot,
                    "Frame submitted"
                );
            }
            Err(e) if e.is_fatal() => {
                return Err(e).context(format!("frame {frame} failed"));
            }
            Err(e) => {
                timeouts += 1;
                warn!("Frame {frame} skipped: {e}");
            }
        }
    }
    engine.wait_idle()?;

    let submissions = engine
        .context()
        .headless()
        .map_or(0, crystal_gpu::HeadlessDevice::submissions);
    info!(
        frames = engine.frame_number(),
        skipped = timeouts,
        renderer = engine.renderer_name(),
        meshes = demo.scene.len(),
        submissions,
        pending_deletions = engine.pending_deletions(),
        "Run complete"
    );
    Ok(())
}

/// Scripted scene changes, one kind per event.
struct Demo {
    scene: Scene,
    spinning: MeshId,
    extra: Option<MeshId>,
    aspect_ratio: f32,
}

impl Demo {
    fn new(settings: &Settings) -> anyhow::Result<Self> {
        let mut scene = Scene::new();
        let spinning = scene.add_mesh(Mesh::cube())?;
        for x in [-2.0, 2.0] {
            scene.add_mesh(
                Mesh::triangle().with_transform(Affine3A::from_translation(Vec3::new(x, 0.0, 0.0))),
            )?;
        }
        let mut demo = Self {
            scene,
            spinning,
            extra: None,
            aspect_ratio: settings.resolution.aspect_ratio(),
        };
        demo.update_camera();
        Ok(demo)
    }

    fn update_camera(&mut self) {
        let projection = Mat4::perspective_rh(60f32.to_radians(), self.aspect_ratio, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 2.0, 6.0), Vec3::ZERO, Vec3::Y);
        self.scene.set_view_projection(projection * view);
    }

    fn step(&mut self, frame: u64, engine: &mut RenderEngine) -> anyhow::Result<()> {
        let angle = frame as f32 * 0.05;
        self.scene
            .set_transform(self.spinning, Affine3A::from_quat(Quat::from_rotation_y(angle)))?;

        if frame == 0 || frame % EVENT_INTERVAL != 0 {
            return Ok(());
        }
        match (frame / EVENT_INTERVAL) % 4 {
            1 => {
                let mesh = Mesh::cube()
                    .with_transform(Affine3A::from_translation(Vec3::new(0.0, 2.0, -1.0)));
                self.extra = Some(self.scene.add_mesh(mesh)?);
                info!(frame, "Added a mesh");
            }
            2 => {
                // Same vertex count, so buffers are updated in place.
                let mut squashed = Mesh::cube();
                for vertex in &mut squashed.vertices {
                    vertex.position[1] *= 0.5;
                }
                self.scene
                    .update_geometry(self.spinning, squashed.vertices, squashed.indices)?;
                info!(frame, "Edited a mesh");
            }
            3 => {
                let width = engine.settings().resolution.width / 2;
                let height = engine.settings().resolution.height / 2;
                engine.resize(width, height)?;
                self.aspect_ratio = engine.settings().resolution.aspect_ratio();
                self.update_camera();
            }
            _ => {
                if let Some(id) = self.extra.take() {
                    self.scene.remove_mesh(id);
                    info!(frame, "Removed a mesh");
                }
            }
        }
        Ok(())
    }
}

fn print_help() {
    eprintln!(
        "Crystal headless runner

USAGE:
    cargo run -p crystal-headless -- [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Settings file (TOML)
    -s, --shaders <DIR>     Directory of compiled SPIR-V shaders
                            Default: placeholder modules
    -n, --frames <N>        Number of frames to render (default: {DEFAULT_FRAMES})
    --raster                Force the rasterizer
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
