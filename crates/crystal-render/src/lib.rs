//! Frame orchestration for the Crystal engine.
//!
//! This crate provides:
//! - Renderer [`Settings`] loaded from TOML and clamped to the device
//! - A [`Scene`] of meshes with change tracking
//! - [`RenderEngine`], which runs frames in flight through either the
//!   [`Rasterizer`] or the [`RayTracer`]
//!
//! The ray tracer is picked only when the settings request it and the
//! device supports it. Otherwise the rasterizer is used without error.
//!
//! # Example
//!
//! ```ignore
//! use crystal_render::{Mesh, RenderEngine, Scene, Settings, ShaderLibrary};
//!
//! let settings = Settings::load("crystal.toml")?;
//! let mut engine = RenderEngine::from_settings(&settings, &ShaderLibrary::load_dir("shaders")?)?;
//!
//! let mut scene = Scene::new();
//! scene.add_mesh(Mesh::cube())?;
//! let frame = engine.render_frame(&scene)?;
//! ```

pub mod engine;
pub mod error;
pub mod gpu_mesh;
pub mod rasterizer;
pub mod ray_tracer;
pub mod scene;
pub mod settings;
pub mod shaders;

pub use engine::{
    Frame, FrameOutput, FrameRenderer, FrameUniforms, RenderEngine, Renderer, SceneUpdate,
    TARGET_FORMAT,
};
pub use error::{RenderError, Result};
pub use gpu_mesh::GpuMesh;
pub use rasterizer::Rasterizer;
pub use ray_tracer::RayTracer;
pub use scene::{Mesh, MeshId, Scene, SceneChanges, SceneDiff, SceneSnapshot};
pub use settings::{BackendKind, HeadlessSettings, Resolution, Settings, TeardownMode};
pub use shaders::ShaderLibrary;
