//! The terrain itself.
//!
//! # Explanation
//! A [`Terra`] is loaded from a single heightmap. Loading uploads the heightmap, bakes a
//! normal map, creates the [`ShadowMapper`] and sizes a pool of [`TerrainCell`]s.
//!
//! Every frame [`Terra::update`] re-bakes the shadows if the light moved and selects the
//! cells to draw. The selection is a set of concentric rings around the camera: a 4x4
//! block of base sized cells, surrounded by rings of 12 cells that double in size (and
//! LOD level) with every ring. Neighbouring cells thus never differ by more than one
//! LOD. Cells outside the terrain or the camera frustum are skipped, and adjacent cells
//! of a ring are merged to save draw calls.
//!
//! All internal math happens in Y-up space. Positions and directions passed in and out
//! are converted according to the configured [`UpAxis`].

use crate::{
    backend::{OwnedTexture, OwnedWorkspace, ParamValue, RenderServices, TextureDesc, TextureFlags, TextureId},
    camera::TerraCamera,
    config::TerraConfig,
    error::{TerraError, TerraResult},
    heightmap::{Heightmap, HeightmapImage},
    math::{GridDirection, GridPoint, UpAxis},
    shadow::ShadowMapper,
    shared_resources::{SharedResourcesHandle, TemporaryUsage, TerraSharedResources},
    terrain_cell::{CellGpuRecord, CellShaderConstants, TerrainCell},
};
use bevy::{
    log::{info, warn},
    math::{UVec2, Vec2, Vec3, Vec4},
    render::render_resource::TextureFormat,
};
use std::path::Path;

pub const NORMAL_MAPPER_JOB: &str = "Terra/GpuNormalMapper";
pub const NORMAL_MAPPER_WORKSPACE: &str = "Terra/GpuNormalMapperWorkspace";

/// The innermost 4x4 block. These cells are drawn without skirts.
const LOD0_CELL_COUNT: usize = 16;
const RING_CELL_COUNT: usize = 12;

/// The four segments of a ring as (first cell, step, cell count), in cells relative to
/// the camera: the rows above and below the 2x2 hole, then the columns left and right.
const RING_SEGMENTS: [(GridDirection, GridDirection, i32); 4] = [
    (GridDirection::new(-2, 1), GridDirection::POSITIVE_X, 4),
    (GridDirection::new(-2, -2), GridDirection::POSITIVE_X, 4),
    (GridDirection::new(-2, -1), GridDirection::POSITIVE_Z, 2),
    (GridDirection::new(1, -1), GridDirection::POSITIVE_Z, 2),
];

/// Size and placement of the loaded terrain in Y-up space.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct TerrainLayout {
    width: u32,
    depth: u32,
    depth_width_ratio: f32,
    inv_width: f32,
    inv_depth: f32,
    xz_dimensions: Vec2,
    xz_inv_dimensions: Vec2,
    /// World size of one heightmap pixel.
    xz_relative_size: Vec2,
    height: f32,
    height_unorm_scaled: f32,
    terrain_origin: Vec3,
}

impl TerrainLayout {
    fn new(image: &HeightmapImage, center: Vec3, dimensions: Vec3) -> Self {
        let (width, depth) = (image.width(), image.depth());
        let xz_dimensions = Vec2::new(dimensions.x, dimensions.z);
        let height = dimensions.y;

        Self {
            width,
            depth,
            depth_width_ratio: depth as f32 / width as f32,
            inv_width: 1.0 / width as f32,
            inv_depth: 1.0 / depth as f32,
            xz_dimensions,
            xz_inv_dimensions: xz_dimensions.recip(),
            xz_relative_size: xz_dimensions / Vec2::new(width as f32, depth as f32),
            height,
            // integer samples reach the shader unnormalized
            height_unorm_scaled: if image.format() == TextureFormat::R16Uint {
                height / 65535.0
            } else {
                height
            },
            terrain_origin: center - dimensions * 0.5,
        }
    }

    fn grid_coordinates(&self, pos: Vec3) -> Vec2 {
        Vec2::new(
            (pos.x - self.terrain_origin.x) * self.xz_inv_dimensions.x * self.width as f32,
            (pos.z - self.terrain_origin.z) * self.xz_inv_dimensions.y * self.depth as f32,
        )
    }

    fn world_to_grid(&self, pos: Vec3) -> GridPoint {
        let grid = self.grid_coordinates(pos).floor();
        GridPoint::new(grid.x as i32, grid.y as i32)
    }

    fn grid_to_world(&self, pos: GridPoint) -> Vec2 {
        Vec2::new(
            pos.x as f32 * self.inv_width * self.xz_dimensions.x + self.terrain_origin.x,
            pos.z as f32 * self.inv_depth * self.xz_dimensions.y + self.terrain_origin.z,
        )
    }

    /// The box around a cell spanning the full terrain height, as (center, half extents).
    /// `None` if the cell lies outside of the terrain.
    fn cell_bounds(&self, pos: GridPoint, size: GridPoint) -> Option<(Vec3, Vec3)> {
        if i64::from(pos.x) >= i64::from(self.width)
            || i64::from(pos.z) >= i64::from(self.depth)
            || i64::from(pos.x) + i64::from(size.x) <= 0
            || i64::from(pos.z) + i64::from(size.z) <= 0
        {
            return None;
        }

        let cell_pos = self.grid_to_world(pos);
        let cell_size = Vec2::new(
            (size.x as f32 + 1.0) * self.xz_relative_size.x,
            (size.z as f32 + 1.0) * self.xz_relative_size.y,
        );

        let half_size = Vec3::new(cell_size.x, self.height, cell_size.y) * 0.5;
        let center = Vec3::new(cell_pos.x, self.terrain_origin.y, cell_pos.y) + half_size;

        Some((center, half_size))
    }
}

/// Everything a frame's cell selection writes. Two of them exist so a second camera can
/// select cells without disturbing the first.
#[derive(Clone, Debug, Default)]
struct FrameState {
    cells: Vec<TerrainCell>,
    renderables: Vec<usize>,
    current_cell: usize,
    camera: TerraCamera,
}

struct CellSelector<'a> {
    layout: &'a TerrainLayout,
    up_axis: UpAxis,
    state: &'a mut FrameState,
    collected: &'a mut [Vec<usize>; 2],
    pool_exhausted: bool,
}

impl CellSelector<'_> {
    fn select(&mut self, base_pixel_dimension: u32) {
        self.state.renderables.clear();
        self.state.current_cell = 0;

        let mut cell_size = GridPoint::new(
            base_pixel_dimension as i32,
            ((base_pixel_dimension as f32 * self.layout.depth_width_ratio) as i32).max(1),
        );

        let camera_position = self.up_axis.to_y_up(self.state.camera.position());
        // Far cameras are pulled in so the ring offsets stay in i32 range. From there the
        // outermost ring still reaches across the whole terrain.
        let extent = self.layout.width.max(self.layout.depth) as i32;
        let camera_grid = self.layout.world_to_grid(camera_position);
        let camera_center = GridPoint::new(
            camera_grid.x.clamp(-extent, extent.saturating_mul(2)),
            camera_grid.z.clamp(-extent, extent.saturating_mul(2)),
        )
        .quantize(cell_size);
        let mut lod_level = 0;

        for z in -2..2 {
            self.add_segment(
                camera_center,
                (GridDirection::new(-2, z), GridDirection::POSITIVE_X, 4),
                cell_size,
                lod_level,
            );
        }
        self.optimize_cells_and_add();

        self.state.current_cell = LOD0_CELL_COUNT;

        let max_resolution = u64::from(self.layout.width.max(self.layout.depth));
        let mut num_added = usize::MAX;

        while num_added != self.state.current_cell
            || (self.state.renderables.is_empty() && (1u64 << lod_level) <= max_resolution)
        {
            num_added = self.state.current_cell;

            cell_size = GridPoint::new(cell_size.x.saturating_mul(2), cell_size.z.saturating_mul(2));
            lod_level += 1;

            for segment in RING_SEGMENTS {
                self.add_segment(camera_center, segment, cell_size, lod_level);
            }
            self.optimize_cells_and_add();
        }
    }

    fn add_segment(
        &mut self,
        camera_center: GridPoint,
        (first, step, count): (GridDirection, GridDirection, i32),
        cell_size: GridPoint,
        lod_level: u32,
    ) {
        for i in 0..count {
            let offset = GridDirection::new(first.x + step.x * i, first.z + step.z * i);
            let pos = camera_center + offset * cell_size;

            if self.is_visible(pos, cell_size) {
                self.add_renderable(pos, cell_size, lod_level);
            }
        }
    }

    fn is_visible(&self, pos: GridPoint, size: GridPoint) -> bool {
        self.layout
            .cell_bounds(pos, size)
            .is_some_and(|(center, half_size)| {
                self.state.camera.is_box_visible(
                    self.up_axis.from_y_up(center),
                    self.up_axis.from_y_up_sign_preserving(half_size),
                )
            })
    }

    fn add_renderable(&mut self, pos: GridPoint, size: GridPoint, lod_level: u32) {
        let index = self.state.current_cell;

        if index >= self.state.cells.len() {
            if !self.pool_exhausted {
                warn!(
                    "Terrain cell pool of {index} cells exhausted, skipping LOD {lod_level} cells."
                );
                self.pool_exhausted = true;
            }
            return;
        }

        self.state.cells[index].set_origin(pos, size.x as u32, size.z as u32, lod_level);
        self.collected[0].push(index);
        self.state.current_cell += 1;
    }

    /// Merges neighbouring cells until the collected list stops shrinking, then moves
    /// the survivors to the renderables.
    fn optimize_cells_and_add(&mut self) {
        let [current, scratch] = &mut *self.collected;
        let cells = &mut self.state.cells;

        let mut num_collected = usize::MAX;
        while num_collected != current.len() {
            num_collected = current.len();

            if current.len() > 1 {
                scratch.clear();

                let mut i = 0;
                while current.len() - i >= 2 {
                    let (curr, next) = (current[i], current[i + 1]);
                    scratch.push(curr);

                    let next_cell = cells[next];
                    i += if cells[curr].merge(&next_cell) { 2 } else { 1 };
                }
                scratch.extend_from_slice(&current[i..]);

                std::mem::swap(current, scratch);
            }
        }

        self.state.renderables.append(current);
    }
}

/// A heightmap terrain.
pub struct Terra {
    id: u32,
    config: TerraConfig,
    services: RenderServices,
    shared_resources: Option<SharedResourcesHandle>,
    layout: TerrainLayout,
    heightmap: Heightmap,
    skirt_size: f32,
    states: [FrameState; 2],
    active_state: usize,
    collected_cells: [Vec<usize>; 2],
    prev_light_dir: Vec3,
    // released before the textures they reference
    shadow_mapper: Option<ShadowMapper>,
    normal_map: Option<OwnedTexture>,
    height_map: Option<OwnedTexture>,
}

impl Terra {
    pub fn new(id: u32, services: RenderServices, camera: TerraCamera, config: TerraConfig) -> Self {
        let state = FrameState {
            camera,
            ..Default::default()
        };

        Self {
            id,
            config,
            services,
            shared_resources: None,
            layout: TerrainLayout::default(),
            heightmap: Heightmap::default(),
            skirt_size: 0.0,
            states: [state.clone(), state],
            active_state: 0,
            collected_cells: Default::default(),
            prev_light_dir: Vec3::ZERO,
            shadow_mapper: None,
            normal_map: None,
            height_map: None,
        }
    }

    /// Loads a heightmap file, taking the shadow settings from the config.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P, center: Vec3, dimensions: Vec3) -> TerraResult<()> {
        let image = HeightmapImage::open(path)?;
        self.load(
            &image,
            center,
            dimensions,
            self.config.minimize_memory,
            self.config.low_res_shadow,
        )
    }

    /// Builds the terrain from `image`, centered at `center` with the world size
    /// `dimensions` (client space).
    ///
    /// On failure the previously loaded terrain, if any, stays untouched.
    pub fn load(
        &mut self,
        image: &HeightmapImage,
        center: Vec3,
        dimensions: Vec3,
        minimize_memory: bool,
        low_res_shadow: bool,
    ) -> TerraResult<()> {
        let up_axis = self.config.up_axis;

        if !(dimensions.is_finite() && dimensions.cmpgt(Vec3::ZERO).all()) {
            return Err(TerraError::InvalidDimensions(dimensions));
        }

        let layout = TerrainLayout::new(
            image,
            up_axis.to_y_up(center),
            up_axis.to_y_up_sign_preserving(dimensions),
        );
        let heightmap = Heightmap::from_image(image, layout.height);

        let height_map = self.create_heightmap_texture(image)?;
        let normal_map = self.create_normal_texture(&layout, &height_map)?;

        let mut shadow_mapper = ShadowMapper::new(self.services.clone(), self.config.shadow_blur);
        shadow_mapper.set_shared_resources(self.shared_resources.clone())?;
        shadow_mapper.set_minimize_memory_consumption(minimize_memory)?;
        shadow_mapper.create_shadow_map(self.id, &height_map, low_res_shadow)?;

        let skirt_size = heightmap.optimum_skirt_size();
        let cells = self.create_terrain_cells(&layout);

        info!(
            "Loaded terra {} ({}x{} pixels, skirt size {skirt_size}, {} cells).",
            self.id,
            layout.width,
            layout.depth,
            cells.len()
        );

        self.shadow_mapper = Some(shadow_mapper);
        self.normal_map = Some(normal_map);
        self.height_map = Some(height_map);
        self.layout = layout;
        self.heightmap = heightmap;
        self.skirt_size = skirt_size;
        self.prev_light_dir = Vec3::ZERO;

        for state in &mut self.states {
            state.cells.clone_from(&cells);
            state.renderables.clear();
            state.current_cell = 0;
        }

        Ok(())
    }

    /// Selects the cells to draw for the current camera, then re-bakes the shadows if
    /// `light_dir` (client space) turned by more than `light_epsilon` (in cosine) since
    /// the last bake.
    ///
    /// An epsilon of zero or less re-bakes every call. The cells are selected even when
    /// the bake fails.
    pub fn update(&mut self, light_dir: Vec3, light_epsilon: f32) -> TerraResult<()> {
        let shadow_mapper = self.shadow_mapper.as_mut().ok_or(TerraError::NotLoaded)?;

        CellSelector {
            layout: &self.layout,
            up_axis: self.config.up_axis,
            state: &mut self.states[self.active_state],
            collected: &mut self.collected_cells,
            pool_exhausted: false,
        }
        .select(self.config.base_pixel_dimension.max(1));

        let light_dir = self.config.up_axis.to_y_up(light_dir);
        let normalized = light_dir.normalize_or_zero();
        let light_cos_angle_change = self.prev_light_dir.dot(normalized).clamp(-1.0, 1.0);

        if light_cos_angle_change <= 1.0 - light_epsilon {
            shadow_mapper.update_shadow_map(
                light_dir,
                self.layout.xz_dimensions,
                self.layout.height,
            )?;
            self.prev_light_dir = normalized;
        }

        Ok(())
    }

    /// [`Self::update`] with the configured light epsilon.
    pub fn update_default(&mut self, light_dir: Vec3) -> TerraResult<()> {
        self.update(light_dir, self.config.light_epsilon)
    }

    /// Interpolates the terrain height under `pos` (client space) and writes it into the
    /// up component. Returns `false` and leaves `pos` untouched outside of the terrain.
    pub fn get_height_at(&self, pos: &mut Vec3) -> bool {
        let up_axis = self.config.up_axis;
        let mut y_up = up_axis.to_y_up(*pos);
        let grid = self.layout.grid_coordinates(y_up);

        match self.heightmap.sample_bilinear(grid.x, grid.y) {
            Some(height) => {
                y_up.y = height + self.layout.terrain_origin.y;
                *pos = up_axis.from_y_up(y_up);
                true
            }
            None => false,
        }
    }

    /// Exchanges the selected cells and camera with the saved set.
    pub fn swap_saved_state(&mut self) {
        self.active_state ^= 1;
    }

    /// Replaces the shared resource cache, also for the shadow mapper.
    pub fn set_shared_resources(
        &mut self,
        shared_resources: Option<SharedResourcesHandle>,
    ) -> TerraResult<()> {
        if let Some(shadow_mapper) = &mut self.shadow_mapper {
            shadow_mapper.set_shared_resources(shared_resources.clone())?;
        }
        self.shared_resources = shared_resources;

        Ok(())
    }

    pub fn camera(&self) -> &TerraCamera {
        &self.states[self.active_state].camera
    }

    pub fn set_camera(&mut self, camera: TerraCamera) {
        self.states[self.active_state].camera = camera;
    }

    /// The cells selected by the last update.
    pub fn renderables(&self) -> impl Iterator<Item = &TerrainCell> + '_ {
        let state = &self.states[self.active_state];
        state.renderables.iter().map(|&index| &state.cells[index])
    }

    pub fn shader_constants(&self) -> CellShaderConstants {
        CellShaderConstants {
            width: self.layout.width,
            depth: self.layout.depth,
            skirt_size: self.skirt_size,
            height: self.layout.height,
            terrain_origin: self.layout.terrain_origin,
            inv_width: self.layout.inv_width,
            inv_depth: self.layout.inv_depth,
            xz_relative_size: self.layout.xz_relative_size,
            height_unorm_scaled: self.layout.height_unorm_scaled,
        }
    }

    /// One record per renderable, in draw order.
    pub fn gpu_records(&self) -> Vec<CellGpuRecord> {
        let constants = self.shader_constants();
        self.renderables()
            .map(|cell| cell.gpu_record(&constants))
            .collect()
    }

    /// How far skirts reach below the cell edges, in world units.
    ///
    /// Computed at load time. Lower it if the terrain is seen from outside and gaps show.
    pub fn set_custom_skirt_min_height(&mut self, skirt_size: f32) {
        self.skirt_size = skirt_size;
    }

    pub fn custom_skirt_min_height(&self) -> f32 {
        self.skirt_size
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn config(&self) -> &TerraConfig {
        &self.config
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.shadow_mapper.is_some()
    }

    pub fn heightmap(&self) -> &Heightmap {
        &self.heightmap
    }

    pub fn shadow_mapper(&self) -> Option<&ShadowMapper> {
        self.shadow_mapper.as_ref()
    }

    pub fn shadow_mapper_mut(&mut self) -> Option<&mut ShadowMapper> {
        self.shadow_mapper.as_mut()
    }

    pub fn height_map_texture(&self) -> Option<TextureId> {
        self.height_map.as_ref().map(OwnedTexture::id)
    }

    pub fn normal_map_texture(&self) -> Option<TextureId> {
        self.normal_map.as_ref().map(OwnedTexture::id)
    }

    pub fn shadow_map_texture(&self) -> Option<TextureId> {
        self.shadow_mapper
            .as_ref()
            .and_then(ShadowMapper::shadow_map_texture)
    }

    pub fn cell_pool_size(&self) -> usize {
        self.states[0].cells.len()
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.layout.width
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.layout.depth
    }

    // The following are in Y-up space.

    #[inline]
    pub fn xz_dimensions(&self) -> Vec2 {
        self.layout.xz_dimensions
    }

    #[inline]
    pub fn xz_inv_dimensions(&self) -> Vec2 {
        self.layout.xz_inv_dimensions
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.layout.height
    }

    #[inline]
    pub fn terrain_origin_raw(&self) -> Vec3 {
        self.layout.terrain_origin
    }

    pub fn terrain_xz_center(&self) -> Vec2 {
        Vec2::new(
            self.layout.terrain_origin.x + self.layout.xz_dimensions.x * 0.5,
            self.layout.terrain_origin.z + self.layout.xz_dimensions.y * 0.5,
        )
    }

    /// The terrain origin in client space.
    pub fn terrain_origin(&self) -> Vec3 {
        self.config.up_axis.from_y_up(self.layout.terrain_origin)
    }

    fn create_heightmap_texture(&self, image: &HeightmapImage) -> TerraResult<OwnedTexture> {
        let texture = OwnedTexture::create(
            &self.services.textures,
            TextureDesc::new(
                format!("HeightMapTex{}", self.id),
                UVec2::new(image.width(), image.depth()),
                image.format(),
                TextureFlags::MANUAL_TEXTURE,
            ),
        )?;
        texture.upload(image.bytes())?;

        Ok(texture)
    }

    fn create_normal_texture(
        &self,
        layout: &TerrainLayout,
        height_map: &OwnedTexture,
    ) -> TerraResult<OwnedTexture> {
        let normal_map = OwnedTexture::create(
            &self.services.textures,
            TextureDesc::new(
                format!("NormalMapTex_{}", self.id),
                height_map.size(),
                TextureFormat::Rgb10a2Unorm,
                TextureFlags::RENDER_TO_TEXTURE | TextureFlags::ALLOW_AUTOMIPMAPS,
            )
            .with_full_mip_chain(),
        )?;

        {
            let mut compute = self.services.compute.borrow_mut();
            let job = compute
                .find_job(NORMAL_MAPPER_JOB)
                .ok_or_else(|| TerraError::ComputeJobNotFound(NORMAL_MAPPER_JOB.to_string()))?;

            // normalized for precision in the shader
            let v_scale = Vec3::new(
                layout.xz_relative_size.x,
                layout.height,
                layout.xz_relative_size.y,
            )
            .normalize_or_zero();

            let values = [
                (
                    "heightMapResolution",
                    ParamValue::Float4(Vec4::new(layout.width as f32, layout.depth as f32, 1.0, 1.0)),
                ),
                ("vScale", ParamValue::Float3(v_scale)),
            ];

            for (name, value) in values {
                let param = compute.find_parameter(job, name).ok_or_else(|| {
                    TerraError::ShaderParamNotFound {
                        job: NORMAL_MAPPER_JOB.to_string(),
                        param: name.to_string(),
                    }
                })?;
                compute.set_manual_value(job, param, value);
            }

            compute.set_texture(job, 0, height_map.id());
            compute.set_params_dirty(job);
        }

        let tmp_normal_map = TerraSharedResources::get_temp_texture(
            "Terra tmpNormalMap",
            self.id,
            self.shared_resources.as_ref(),
            TemporaryUsage::TmpNormalMap,
            normal_map.desc(),
            TextureFlags::RENDER_TO_TEXTURE,
            &self.services.textures,
        )?;

        let workspace = OwnedWorkspace::create(
            &self.services.compositor,
            NORMAL_MAPPER_WORKSPACE,
            &[normal_map.id(), tmp_normal_map.id()],
        )?;
        workspace.update();

        drop(workspace);
        drop(tmp_normal_map);

        Ok(normal_map)
    }

    /// Sizes the pool for the LOD 0 block and enough rings to cover the terrain, plus one.
    fn create_terrain_cells(&self, layout: &TerrainLayout) -> Vec<TerrainCell> {
        let base_pixel_dimension = u64::from(self.config.base_pixel_dimension.max(1));
        let max_resolution = u64::from(layout.width.max(layout.depth));

        let mut num_cells = LOD0_CELL_COUNT;
        let mut accum_dimension = 0u64;
        let mut ring = 1;

        while accum_dimension < max_resolution {
            num_cells += RING_CELL_COUNT;
            accum_dimension += base_pixel_dimension << ring;
            ring += 1;
        }
        num_cells += RING_CELL_COUNT;

        let terrain_size = UVec2::new(layout.width, layout.depth);
        (0..num_cells)
            .map(|index| TerrainCell::new(terrain_size, index >= LOD0_CELL_COUNT))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::headless::HeadlessBackend,
        heightmap::HeightSamples,
        shadow::SHADOW_GENERATOR_WORKSPACE,
    };
    use ndarray::Array2;
    use std::{cell::RefCell, f32::consts::FRAC_PI_2, rc::Rc};

    fn flat_image(size: u32) -> HeightmapImage {
        HeightmapImage::new(size, size, HeightSamples::R8(vec![0; (size * size) as usize])).unwrap()
    }

    fn setup(
        backend: HeadlessBackend,
        camera: TerraCamera,
        config: TerraConfig,
    ) -> (Rc<RefCell<HeadlessBackend>>, Terra) {
        let backend = Rc::new(RefCell::new(backend));
        let services = RenderServices::from_backend(backend.clone());
        (backend, Terra::new(0, services, camera, config))
    }

    fn load_flat(terra: &mut Terra, size: u32) {
        let half = size as f32 * 0.5;
        terra
            .load(
                &flat_image(size),
                Vec3::new(half, 0.5, half),
                Vec3::new(size as f32, 1.0, size as f32),
                false,
                false,
            )
            .unwrap();
    }

    fn shadow_updates(backend: &Rc<RefCell<HeadlessBackend>>) -> usize {
        backend
            .borrow()
            .workspace_updates()
            .iter()
            .filter(|definition| *definition == SHADOW_GENERATOR_WORKSPACE)
            .count()
    }

    /// How often each heightmap pixel is covered by a renderable.
    fn coverage(terra: &Terra) -> Array2<u32> {
        let mut coverage = Array2::zeros((terra.depth() as usize, terra.width() as usize));

        for cell in terra.renderables() {
            let origin = cell.grid_position();
            let size = cell.size();

            for z in origin.z.max(0)..(origin.z + size.y as i32).min(terra.depth() as i32) {
                for x in origin.x.max(0)..(origin.x + size.x as i32).min(terra.width() as i32) {
                    coverage[[z as usize, x as usize]] += 1;
                }
            }
        }

        coverage
    }

    #[test]
    fn small_flat_terrain() {
        let camera = TerraCamera::new(Vec3::new(2.5, 100.0, 2.5));
        let (_backend, mut terra) = setup(HeadlessBackend::with_terra_jobs(), camera, TerraConfig::default());

        load_flat(&mut terra, 5);
        terra.update(Vec3::new(0.3, -1.0, 0.2), 1e-6).unwrap();

        let cells: Vec<&TerrainCell> = terra.renderables().collect();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].lod_level(), 0);
        assert_eq!(cells[0].grid_position(), GridPoint::ZERO);
        assert_eq!(cells[0].size(), UVec2::new(5, 5));

        let mut pos = Vec3::new(2.0, 7.0, 2.0);
        assert!(terra.get_height_at(&mut pos));
        assert_eq!(pos, Vec3::new(2.0, 0.0, 2.0));

        let mut origin = Vec3::new(0.0, 7.0, 0.0);
        assert!(terra.get_height_at(&mut origin));
        assert_eq!(origin.y, 0.0);

        for outside in [Vec3::new(-0.5, 7.0, 2.0), Vec3::new(2.0, 7.0, 5.0)] {
            let mut pos = outside;
            assert!(!terra.get_height_at(&mut pos));
            assert_eq!(pos, outside);
        }
    }

    #[test]
    fn straight_down_light() {
        let camera = TerraCamera::new(Vec3::new(2.5, 100.0, 2.5));
        let (_backend, mut terra) = setup(HeadlessBackend::with_terra_jobs(), camera, TerraConfig::default());

        load_flat(&mut terra, 5);
        terra.update(Vec3::NEG_Y, 1e-6).unwrap();

        let params = terra.shadow_mapper().unwrap().last_params().unwrap();
        assert!(params.height_delta.is_finite());
        assert!(params.march.delta.is_finite());
    }

    #[test]
    fn rings_cover_the_terrain_once() {
        let camera = TerraCamera::new(Vec3::new(512.0, 10.0, 512.0));
        let (_backend, mut terra) = setup(HeadlessBackend::with_terra_jobs(), camera, TerraConfig::default());

        load_flat(&mut terra, 1024);
        terra.update_default(Vec3::new(1.0, -1.0, 0.0)).unwrap();

        assert!(coverage(&terra).iter().all(|&count| count == 1));

        let lods: Vec<u32> = terra.renderables().map(TerrainCell::lod_level).collect();
        assert_eq!(lods.iter().max(), Some(&2));
        assert!(lods.contains(&0) && lods.contains(&1));
        assert!(terra.renderables().count() < 16 + 2 * 12);
        assert!(terra
            .renderables()
            .all(|cell| cell.use_skirts() == (cell.lod_level() > 0)));
    }

    #[test]
    fn far_away_camera() {
        let positions = [
            Vec3::new(1e10, 10.0, 500.0),
            Vec3::new(-1e10, 10.0, -1e10),
        ];

        for position in positions {
            let (_backend, mut terra) = setup(
                HeadlessBackend::with_terra_jobs(),
                TerraCamera::new(position),
                TerraConfig::default(),
            );
            terra
                .load(
                    &flat_image(256),
                    Vec3::new(500.0, 0.5, 500.0),
                    Vec3::new(1000.0, 1.0, 1000.0),
                    false,
                    false,
                )
                .unwrap();
            terra.update_default(Vec3::new(1.0, -1.0, 0.0)).unwrap();

            assert!(
                coverage(&terra).iter().all(|&count| count == 1),
                "gaps or overlaps for a camera at {position}"
            );
            assert!(terra.renderables().all(|cell| cell.lod_level() >= 2));
        }
    }

    #[test]
    fn cells_follow_the_camera_when_the_bake_fails() {
        let camera = TerraCamera::new(Vec3::new(512.0, 10.0, 512.0));
        let (_backend, mut terra) = setup(HeadlessBackend::with_terra_jobs(), camera, TerraConfig::default());

        load_flat(&mut terra, 1024);
        terra.update(Vec3::NEG_Y, 0.0).unwrap();

        let lod_at_corner = |terra: &Terra| {
            terra
                .renderables()
                .find(|cell| {
                    let origin = cell.grid_position();
                    let end = origin.as_ivec2() + cell.size().as_ivec2();
                    origin.x <= 10 && origin.z <= 10 && end.x > 10 && end.y > 10
                })
                .map(TerrainCell::lod_level)
        };
        assert_eq!(lod_at_corner(&terra), Some(2));

        terra.shadow_mapper_mut().unwrap().destroy_shadow_map();
        terra.set_camera(TerraCamera::new(Vec3::new(10.0, 10.0, 10.0)));

        assert!(matches!(
            terra.update(Vec3::NEG_Y, 0.0),
            Err(TerraError::ShadowMapNotCreated)
        ));
        assert_eq!(lod_at_corner(&terra), Some(0));
        assert!(coverage(&terra).iter().all(|&count| count == 1));
    }

    #[test]
    fn camera_near_a_corner() {
        let positions = [
            Vec3::new(3.0, 5.0, 3.0),
            Vec3::new(250.0, 5.0, 20.0),
            Vec3::new(-40.0, 5.0, 300.0),
        ];

        for position in positions {
            let (_backend, mut terra) = setup(
                HeadlessBackend::with_terra_jobs(),
                TerraCamera::new(position),
                TerraConfig::default(),
            );
            load_flat(&mut terra, 256);
            terra.update_default(Vec3::NEG_Y).unwrap();

            assert!(
                coverage(&terra).iter().all(|&count| count == 1),
                "gaps or overlaps for a camera at {position}"
            );
        }
    }

    #[test]
    fn frustum_culling() {
        let config = TerraConfig::default();
        let looking_up = TerraCamera::perspective(
            Vec3::new(512.0, 10.0, 512.0),
            Vec3::new(512.0, 100.0, 513.0),
            Vec3::Z,
            FRAC_PI_2,
            1.0,
            0.1,
            None,
        );
        let (_backend, mut terra) = setup(HeadlessBackend::with_terra_jobs(), looking_up, config);

        load_flat(&mut terra, 1024);
        terra.update_default(Vec3::NEG_Y).unwrap();
        assert_eq!(terra.renderables().count(), 0);

        terra.set_camera(TerraCamera::perspective(
            Vec3::new(512.0, 10.0, 512.0),
            Vec3::new(512.0, 0.0, 0.0),
            Vec3::Y,
            FRAC_PI_2,
            1.0,
            0.1,
            Some(10_000.0),
        ));
        terra.update_default(Vec3::NEG_Y).unwrap();

        let visible = coverage(&terra);
        assert!(terra.renderables().count() > 0);
        // the far corner behind the camera is culled
        assert_eq!(visible[[1023, 1023]], 0);
        assert_eq!(visible[[0, 512]], 1);
    }

    #[test]
    fn saved_state_swap() {
        let camera = TerraCamera::new(Vec3::new(512.0, 10.0, 512.0));
        let (_backend, mut terra) = setup(HeadlessBackend::with_terra_jobs(), camera, TerraConfig::default());

        load_flat(&mut terra, 1024);
        terra.update_default(Vec3::NEG_Y).unwrap();
        let primary = terra.gpu_records();

        terra.swap_saved_state();
        terra.set_camera(TerraCamera::new(Vec3::new(10.0, 10.0, 10.0)));
        terra.update_default(Vec3::NEG_Y).unwrap();
        let saved = terra.gpu_records();
        assert_ne!(saved, primary);

        terra.swap_saved_state();
        assert_eq!(terra.gpu_records(), primary);
        assert_eq!(terra.camera().position(), Vec3::new(512.0, 10.0, 512.0));
    }

    #[test]
    fn light_epsilon() {
        let camera = TerraCamera::new(Vec3::new(2.5, 10.0, 2.5));
        let (backend, mut terra) = setup(HeadlessBackend::with_terra_jobs(), camera, TerraConfig::default());
        load_flat(&mut terra, 5);

        let light_dir = Vec3::new(1.0, -1.0, 0.0);
        terra.update(light_dir, 1e-6).unwrap();
        terra.update(light_dir * 2.0, 1e-6).unwrap();
        assert_eq!(shadow_updates(&backend), 1);

        terra.update(light_dir, 0.0).unwrap();
        assert_eq!(shadow_updates(&backend), 2);

        terra.update(Vec3::new(0.0, -1.0, 1.0), 0.6).unwrap();
        assert_eq!(shadow_updates(&backend), 2);
        terra.update(Vec3::new(-1.0, -1.0, 0.0), 0.6).unwrap();
        assert_eq!(shadow_updates(&backend), 3);
    }

    #[test]
    fn z_up_conversion() {
        let config = TerraConfig {
            up_axis: UpAxis::Z,
            ..Default::default()
        };
        let (_backend, mut terra) = setup(
            HeadlessBackend::with_terra_jobs(),
            TerraCamera::new(Vec3::new(2.5, -2.5, 50.0)),
            config,
        );

        let mut samples = vec![0u8; 25];
        samples[2 * 5 + 2] = 255;
        let image = HeightmapImage::new(5, 5, HeightSamples::R8(samples)).unwrap();
        terra
            .load(
                &image,
                Vec3::new(2.5, -2.5, 0.5),
                Vec3::new(5.0, 5.0, 1.0),
                false,
                false,
            )
            .unwrap();

        assert_eq!(terra.terrain_origin_raw(), Vec3::ZERO);
        assert_eq!(terra.height(), 1.0);

        let mut pos = Vec3::new(2.0, -2.0, 7.0);
        assert!(terra.get_height_at(&mut pos));
        assert_eq!(pos, Vec3::new(2.0, -2.0, 1.0));

        terra.update_default(Vec3::new(0.0, 0.0, -1.0)).unwrap();
        assert_eq!(terra.renderables().count(), 1);
    }

    #[test]
    fn uint_heightmaps() {
        let camera = TerraCamera::new(Vec3::ZERO);
        let (backend, mut terra) = setup(HeadlessBackend::with_terra_jobs(), camera, TerraConfig::default());

        let image = HeightmapImage::new(4, 4, HeightSamples::R16Uint(vec![65535; 16])).unwrap();
        terra
            .load(&image, Vec3::ZERO, Vec3::new(4.0, 655.35, 4.0), false, false)
            .unwrap();

        assert!((terra.shader_constants().height_unorm_scaled - 0.01).abs() < 1e-6);
        assert!(backend.borrow().job_by_name("Terra/ShadowGeneratorU16").is_some());

        let height_map = terra.height_map_texture().unwrap();
        let backend = backend.borrow();
        let texture = backend.texture(height_map);
        assert_eq!(texture.desc.format, TextureFormat::R16Uint);
        assert_eq!(texture.uploads, 1);
    }

    #[test]
    fn load_failures_keep_no_partial_state() {
        let camera = TerraCamera::new(Vec3::ZERO);
        let (backend, mut terra) = setup(HeadlessBackend::new(), camera, TerraConfig::default());

        assert!(matches!(
            terra.load(&flat_image(8), Vec3::ZERO, Vec3::new(8.0, 0.0, 8.0), false, false),
            Err(TerraError::InvalidDimensions(_))
        ));
        assert!(matches!(
            terra.load(&flat_image(8), Vec3::ZERO, Vec3::splat(8.0), false, false),
            Err(TerraError::ComputeJobNotFound(_))
        ));

        assert!(!terra.is_loaded());
        assert_eq!(backend.borrow().live_texture_count(), 0);
        assert!(matches!(
            terra.update(Vec3::NEG_Y, 0.0),
            Err(TerraError::NotLoaded)
        ));

        let mut pos = Vec3::ZERO;
        assert!(!terra.get_height_at(&mut pos));
    }

    #[test]
    fn normal_map_and_shared_resources() {
        let camera = TerraCamera::new(Vec3::ZERO);
        let (backend, mut terra) = setup(HeadlessBackend::with_terra_jobs(), camera, TerraConfig::default());
        let shared = TerraSharedResources::new_shared();
        terra.set_shared_resources(Some(shared.clone())).unwrap();

        load_flat(&mut terra, 32);

        {
            let backend = backend.borrow();
            let normal_map = backend.texture(terra.normal_map_texture().unwrap());
            assert_eq!(normal_map.desc.size, UVec2::splat(32));
            assert_eq!(normal_map.desc.mip_level_count, 6);

            let job = backend.job_by_name(NORMAL_MAPPER_JOB).unwrap();
            assert_eq!(
                job.param("heightMapResolution"),
                Some(&ParamValue::Float4(Vec4::new(32.0, 32.0, 1.0, 1.0)))
            );
            assert_eq!(backend.workspace_updates()[0], NORMAL_MAPPER_WORKSPACE);
        }

        assert!(shared.borrow().cached(TemporaryUsage::TmpNormalMap).is_some());
        shared.borrow_mut().free_static_memory();
        assert!(shared.borrow().cached(TemporaryUsage::TmpNormalMap).is_none());
        assert!(shared.borrow().cached(TemporaryUsage::TmpShadows).is_some());
    }

    #[test]
    fn cell_pool_and_records() {
        let camera = TerraCamera::new(Vec3::new(512.0, 10.0, 512.0));
        let (_backend, mut terra) = setup(HeadlessBackend::with_terra_jobs(), camera, TerraConfig::default());

        load_flat(&mut terra, 1024);
        // rings of 128, 256, 512 and 1024 pixels, plus one
        assert_eq!(terra.cell_pool_size(), 16 + 5 * 12);

        terra.set_custom_skirt_min_height(0.5);
        terra.update_default(Vec3::NEG_Y).unwrap();

        let records = terra.gpu_records();
        assert_eq!(records.len(), terra.renderables().count());
        for (record, cell) in records.iter().zip(terra.renderables()) {
            assert_eq!(record.vertices_per_line, cell.vertices_per_line());
            assert_eq!(record.lod_level, cell.lod_level());
            assert_eq!(record.skirt_size(), 0.5);
            assert_eq!(record.max_x, 1023);
        }
    }
}
