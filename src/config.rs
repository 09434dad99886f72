use crate::{
    error::{TerraError, TerraResult},
    math::UpAxis,
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Parameters of the separable gaussian blur applied to the raw ray marched shadows.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct GaussianConfig {
    /// Must be even. `None` picks 8 (4 for low resolution shadows).
    pub kernel_radius: Option<u8>,
    pub deviation_factor: f32,
}

impl Default for GaussianConfig {
    fn default() -> Self {
        Self {
            kernel_radius: None,
            deviation_factor: 0.5,
        }
    }
}

impl GaussianConfig {
    pub fn kernel_radius(&self, low_res_shadow: bool) -> u8 {
        self.kernel_radius
            .unwrap_or(if low_res_shadow { 4 } else { 8 })
    }

    /// Rejects odd kernel radii, which the blur passes cannot mirror.
    pub fn validate(&self) -> TerraResult<()> {
        match self.kernel_radius {
            Some(radius) if radius % 2 != 0 => Err(TerraError::InvalidKernelRadius(radius)),
            _ => Ok(()),
        }
    }
}

/// Settings of a [`Terra`](crate::terra::Terra) instance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TerraConfig {
    /// The size of a LOD 0 cell in heightmap pixels.
    pub base_pixel_dimension: u32,
    pub up_axis: UpAxis,
    /// Default epsilon used by [`Terra::update_default`](crate::terra::Terra::update_default).
    pub light_epsilon: f32,
    /// Destroy the shadow workspace after every update instead of keeping it alive.
    pub minimize_memory: bool,
    /// Bake the shadows at a quarter of the heightmap resolution.
    pub low_res_shadow: bool,
    pub shadow_blur: GaussianConfig,
}

impl Default for TerraConfig {
    fn default() -> Self {
        Self {
            base_pixel_dimension: 64,
            up_axis: UpAxis::Y,
            light_epsilon: 1e-6,
            minimize_memory: false,
            low_res_shadow: false,
            shadow_blur: GaussianConfig::default(),
        }
    }
}

impl TerraConfig {
    pub fn from_ron(source: &str) -> TerraResult<Self> {
        let config: Self = ron::from_str(source)?;
        config.shadow_blur.validate()?;

        Ok(config)
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> TerraResult<Self> {
        let source = fs::read_to_string(path)?;
        Self::from_ron(&source)
    }
}
