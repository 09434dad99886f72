use bevy::render::render_resource::TextureFormat;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerraError {
    #[error("terrain dimensions must be positive, got {0}")]
    InvalidDimensions(bevy::math::Vec3),
    #[error("heightmap has no pixels ({width}x{height})")]
    EmptyHeightmap { width: u32, height: u32 },
    #[error("heightmap must be greyscale 8 bpp, 16 bpp or 32-bit float, got {0}")]
    UnsupportedPixelFormat(String),
    #[error("heightmap of {size} pixels exceeds the shadow mapper limit of {max}")]
    HeightmapTooLarge { size: u32, max: u32 },
    #[error("image error")]
    Image(#[from] image::ImageError),
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("invalid terra config")]
    Config(#[from] ron::error::SpannedError),
    #[error("gaussian kernel radius must be even, got {0}")]
    InvalidKernelRadius(u8),
    #[error("render backend error: {0}")]
    Backend(String),
    #[error("texture format {0:?} is not supported by the texture manager")]
    FormatNotSupported(TextureFormat),
    #[error("compute job {0} not found")]
    ComputeJobNotFound(String),
    #[error("shader parameter {param} not found in compute job {job}")]
    ShaderParamNotFound { job: String, param: String },
    #[error("the shadow map has not been created")]
    ShadowMapNotCreated,
    #[error("the terrain has not been loaded")]
    NotLoaded,
}

pub type TerraResult<T> = Result<T, TerraError>;
