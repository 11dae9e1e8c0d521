//! Precompiled SPIR-V used by the built-in renderers.

use std::path::Path;

use crate::error::{RenderError, Result};

/// SPIR-V words for every stage the renderers need.
#[derive(Debug, Clone)]
pub struct ShaderLibrary {
    pub raster_vertex: Vec<u32>,
    pub raster_fragment: Vec<u32>,
    pub raygen: Vec<u32>,
    pub miss: Vec<u32>,
    pub closest_hit: Vec<u32>,
}

impl ShaderLibrary {
    /// File names looked up by [`load_dir`](Self::load_dir).
    pub const FILES: [&'static str; 5] = [
        "mesh.vert.spv",
        "mesh.frag.spv",
        "scene.rgen.spv",
        "scene.rmiss.spv",
        "scene.rchit.spv",
    ];

    /// Load compiled shaders from `dir`.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let [vert, frag, rgen, rmiss, rchit] = Self::FILES;
        let library = Self {
            raster_vertex: read_spirv(&dir.join(vert))?,
            raster_fragment: read_spirv(&dir.join(frag))?,
            raygen: read_spirv(&dir.join(rgen))?,
            miss: read_spirv(&dir.join(rmiss))?,
            closest_hit: read_spirv(&dir.join(rchit))?,
        };
        tracing::debug!(dir = %dir.display(), "loaded shader library");
        Ok(library)
    }

    /// Header-only modules. Enough for the headless device, which never
    /// executes shaders.
    pub fn placeholder() -> Self {
        let module = vec![0x0723_0203, 0x0001_0000, 0, 1, 0];
        Self {
            raster_vertex: module.clone(),
            raster_fragment: module.clone(),
            raygen: module.clone(),
            miss: module.clone(),
            closest_hit: module,
        }
    }
}

fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let io_error = |source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(io_error)?;
    ash::util::read_spv(&mut file).map_err(io_error)
}
