//! Error types for frame orchestration.

use std::path::PathBuf;

use crystal_gpu::GpuError;
use thiserror::Error;

/// Renderer-level error type.
#[derive(Error, Debug)]
pub enum RenderError {
    /// GPU error
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// Settings file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Settings file could not be parsed
    #[error("invalid settings: {0}")]
    Settings(#[from] toml::de::Error),

    /// Mesh data that cannot be drawn or traced
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),

    #[error("unknown mesh {0:?}")]
    UnknownMesh(crate::scene::MeshId),
}

impl RenderError {
    /// Whether the render loop must stop. Only device-level failures qualify.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Gpu(e) if e.is_fatal())
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::Gpu(GpuError::DeviceLost))
    }
}

/// Result type alias using [`RenderError`].
pub type Result<T> = std::result::Result<T, RenderError>;
