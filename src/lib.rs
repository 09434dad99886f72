//! This crate renders a single heightmap terrain with distance based LOD and baked shadows.
//!
//! # Background
//! A [`Terra`](terra::Terra) is loaded from one heightmap image. Every frame it selects a
//! small set of [`TerrainCell`](terrain_cell::TerrainCell)s around the camera, each of them
//! drawn as a single triangle strip. Cells get coarser the further they are from the
//! camera, so the vertex count stays roughly constant regardless of the terrain size.
//!
//! Shadows are computed on the GPU by marching the heightmap along the light direction.
//! The [`ShadowMapper`](shadow::ShadowMapper) partitions the heightmap into Bresenham lines
//! and dispatches them to a compute job. The result is blurred with a separable gaussian
//! filter.
//!
//! The crate does not talk to a graphics API itself. Textures, constant buffers, compute
//! jobs and compositor workspaces are reached through the traits in [`backend`]. The
//! [`HeadlessBackend`](backend::headless::HeadlessBackend) implements them in memory.

pub mod backend;
pub mod camera;
pub mod config;
pub mod error;
pub mod heightmap;
pub mod math;
pub mod shadow;
pub mod shared_resources;
pub mod terra;
pub mod terrain_cell;

pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        backend::{headless::HeadlessBackend, RenderServices, TextureFlags, TextureId},
        camera::TerraCamera,
        config::{GaussianConfig, TerraConfig},
        error::{TerraError, TerraResult},
        heightmap::{HeightSamples, Heightmap, HeightmapImage},
        math::{GridDirection, GridPoint, UpAxis},
        shadow::{ShadowMapper, ShadowMapperState},
        shared_resources::{TemporaryUsage, TerraSharedResources},
        terra::Terra,
        terrain_cell::{CellGpuRecord, TerrainCell},
    };
}
