//! Renderer settings.
//!
//! Every field has a default, so a settings file only needs the options it
//! changes:
//!
//! ```toml
//! ray_tracing = true
//! anisotropic_filter_level = 8.0
//!
//! [resolution]
//! width = 1920
//! height = 1080
//! ```

use std::path::Path;

use ash::vk;
use crystal_gpu::{GraphicsContextBuilder, PhysicalDeviceInfo, TeardownPolicy};
use serde::{Deserialize, Serialize};

use crate::error::{RenderError, Result};

/// Output resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl Resolution {
    pub fn extent(self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }

    pub fn aspect_ratio(self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }
}

/// What happens to dependents when a resource they need is destroyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeardownMode {
    /// Dependents are detached and marked invalid.
    #[default]
    Invalidate,
    /// Destruction fails while dependents are alive.
    Refuse,
}

impl From<TeardownMode> for TeardownPolicy {
    fn from(mode: TeardownMode) -> Self {
        match mode {
            TeardownMode::Invalidate => Self::Invalidate,
            TeardownMode::Refuse => Self::Refuse,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Vulkan,
    Headless,
}

/// Simulated device used by the headless backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlessSettings {
    /// Whether the simulated device reports hardware ray tracing.
    pub ray_tracing: bool,
    /// Device memory limit. `None` is unlimited.
    pub memory_budget_mb: Option<u64>,
}

impl Default for HeadlessSettings {
    fn default() -> Self {
        Self {
            ray_tracing: true,
            memory_budget_mb: None,
        }
    }
}

/// Requested renderer configuration.
///
/// These are requests: [`Settings::clamped_to`] reduces them to what a
/// device can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub application_name: String,
    /// `[major, minor, patch]`, passed through to the instance.
    pub application_version: [u32; 3],
    pub ray_tracing: bool,
    pub resolution: Resolution,
    /// 1.0 disables anisotropic filtering.
    pub anisotropic_filter_level: f32,
    pub refresh_rate: u32,
    pub frames_in_flight: usize,
    pub msaa_samples: u32,
    /// Mip levels of sampled textures, capped at each texture's full chain.
    pub mip_levels: u32,
    pub validation: bool,
    pub teardown_policy: TeardownMode,
    pub backend: BackendKind,
    pub headless: HeadlessSettings,
    pub fence_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application_name: "Crystal".to_string(),
            application_version: [0, 1, 0],
            ray_tracing: false,
            resolution: Resolution::default(),
            anisotropic_filter_level: 1.0,
            refresh_rate: 60,
            frames_in_flight: 2,
            msaa_samples: 1,
            mip_levels: 1,
            validation: cfg!(debug_assertions),
            teardown_policy: TeardownMode::default(),
            backend: BackendKind::default(),
            headless: HeadlessSettings::default(),
            fence_timeout_ms: 5_000,
        }
    }
}

impl Settings {
    /// Parse settings from TOML. Missing fields take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Load settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| RenderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml_str(&source)?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    pub fn with_ray_tracing(mut self, enabled: bool) -> Self {
        self.ray_tracing = enabled;
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution { width, height };
        self
    }

    pub fn with_anisotropic_filter_level(mut self, level: f32) -> Self {
        self.anisotropic_filter_level = level;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_msaa_samples(mut self, samples: u32) -> Self {
        self.msaa_samples = samples;
        self
    }

    pub fn with_mip_levels(mut self, levels: u32) -> Self {
        self.mip_levels = levels;
        self
    }

    pub fn with_teardown_policy(mut self, mode: TeardownMode) -> Self {
        self.teardown_policy = mode;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_headless(mut self, headless: HeadlessSettings) -> Self {
        self.headless = headless;
        self
    }

    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ms.saturating_mul(1_000_000)
    }

    /// Reduce the requests to what `info` supports.
    ///
    /// Anisotropy and MSAA are clamped to the device maxima, ray tracing is
    /// turned off when unsupported and at least one frame stays in flight.
    pub fn clamped_to(&self, info: &PhysicalDeviceInfo) -> Self {
        let mut clamped = self.clone();

        clamped.anisotropic_filter_level = info
            .clamp_anisotropy(self.anisotropic_filter_level)
            .unwrap_or(1.0);
        if clamped.anisotropic_filter_level < self.anisotropic_filter_level {
            tracing::info!(
                requested = self.anisotropic_filter_level,
                effective = clamped.anisotropic_filter_level,
                "anisotropic filtering clamped to device maximum"
            );
        }

        clamped.msaa_samples = info.clamp_msaa(self.msaa_samples);
        if clamped.msaa_samples != self.msaa_samples {
            tracing::info!(
                requested = self.msaa_samples,
                effective = clamped.msaa_samples,
                "MSAA sample count clamped"
            );
        }

        if self.ray_tracing && !info.supports_ray_tracing() {
            tracing::warn!(device = %info.device_name, "ray tracing disabled: unsupported by device");
            clamped.ray_tracing = false;
        }

        clamped.frames_in_flight = self.frames_in_flight.max(1);
        clamped.mip_levels = self.mip_levels.max(1);
        clamped
    }

    /// MSAA sample count as Vulkan flags.
    pub fn sample_count(&self) -> vk::SampleCountFlags {
        vk::SampleCountFlags::from_raw(self.msaa_samples.max(1).next_power_of_two())
    }

    /// Context builder configured from these settings.
    pub fn context_builder(&self) -> GraphicsContextBuilder {
        let [major, minor, patch] = self.application_version;
        let builder = GraphicsContextBuilder::new()
            .app_name(self.application_name.clone())
            .app_version(vk::make_api_version(0, major, minor, patch))
            .ray_tracing(self.ray_tracing)
            .validation(self.validation)
            .teardown_policy(self.teardown_policy.into());
        match self.backend {
            BackendKind::Vulkan => builder,
            BackendKind::Headless => {
                let info = PhysicalDeviceInfo::headless();
                let info = if self.headless.ray_tracing {
                    info
                } else {
                    info.without_ray_tracing()
                };
                builder.headless(info)
            }
        }
    }
}
