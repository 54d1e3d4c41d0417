/// Culling configuration.
/// Every field has a default so a partial TOML file (or none at all) is valid.
use serde::Deserialize;
use std::path::Path;

use crate::error::{CullError, Result};

/// Largest edge accepted for the 16-bit z-buffer grid.
pub const MAX_ZBUFFER_RESOLUTION: usize = 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CullConfig {
    /// Master switch; when false every query answers "visible"
    pub enabled: bool,
    /// Cull buffer width in texels (multiple of 4)
    pub resolution_x: usize,
    /// Cull buffer height in texels
    pub resolution_y: usize,
    /// Reproject last frame's hardware depth buffer as the depth source
    pub hw_reprojection: bool,
    /// Rasterize occluder meshes from the loaded level
    pub rasterize_occluders: bool,
    /// Rows handled by one reprojection band job
    pub lines_per_job: usize,
    /// Positive: non-linear bias multiplier. Negative: linear offset pushed backwards.
    pub reprojection_bias: f32,
    /// Hardware depth values below this are written in place with the near depth
    pub nearest_max: f32,
    /// Projection and hardware depth use reversed depth (1 near, 0 far)
    pub reverse_depth: bool,
    /// Stop submitting occluders once the check was requested and this much time passed
    pub raster_time_budget_ms: f32,
    /// Per-frame triangle cap for occluder rasterization (0 = unlimited)
    pub triangle_budget: usize,
    /// Bubble-sort passes applied to the persistent front-to-back instance order
    pub sort_passes: usize,
    /// Worker threads for the job system (0 = one per core)
    pub worker_threads: usize,
    pub zbuffer: ZBufferConfig,
}

impl Default for CullConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resolution_x: 128,
            resolution_y: 64,
            hw_reprojection: false,
            rasterize_occluders: true,
            lines_per_job: 16,
            reprojection_bias: 0.05,
            nearest_max: 0.0,
            reverse_depth: false,
            raster_time_budget_ms: 2.0,
            triangle_budget: 0,
            sort_passes: 20,
            worker_threads: 0,
            zbuffer: ZBufferConfig::default(),
        }
    }
}

impl CullConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CullConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject resolutions the rasterizer cannot work with.
    pub fn validate(&self) -> Result<()> {
        let (width, height) = (self.resolution_x, self.resolution_y);
        if width == 0 || height == 0 {
            return Err(CullError::InvalidResolution {
                width,
                height,
                reason: "resolution must be non-zero",
            });
        }
        if width % 4 != 0 {
            return Err(CullError::InvalidResolution {
                width,
                height,
                reason: "width must be a multiple of 4",
            });
        }
        if self.lines_per_job == 0 {
            return Err(CullError::InvalidResolution {
                width,
                height,
                reason: "lines_per_job must be non-zero",
            });
        }
        Ok(())
    }
}

/// How the z-buffer culler treats boxes whose screen rectangle leaves the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationSafety {
    /// Truncate to texels; a rectangle entirely off the grid is not visible.
    #[default]
    Legacy,
    /// Any corner outside the grid makes the box visible.
    Strict,
    /// Grow the rectangle by one texel and clamp it to the grid.
    Lenient,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZBufferConfig {
    /// Grid edge in texels (square grid, clamped to MAX_ZBUFFER_RESOLUTION)
    pub resolution: usize,
    pub rotation_safety: RotationSafety,
}

impl Default for ZBufferConfig {
    fn default() -> Self {
        Self {
            resolution: 256,
            rotation_safety: RotationSafety::Legacy,
        }
    }
}
