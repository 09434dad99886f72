use crate::math::GridPoint;
use bevy::math::{UVec2, Vec2, Vec3};
use bytemuck::{Pod, Zeroable};
use std::mem;

/// The terrain wide values every cell record repeats.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CellShaderConstants {
    pub width: u32,
    pub depth: u32,
    pub skirt_size: f32,
    /// Used to normalize the skirt size.
    pub height: f32,
    pub terrain_origin: Vec3,
    pub inv_width: f32,
    pub inv_depth: f32,
    pub xz_relative_size: Vec2,
    pub height_unorm_scaled: f32,
}

/// The per cell data read by the terrain vertex shader.
///
/// Four vectors of four 32-bit values. The field order matches the shader side.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CellGpuRecord {
    pub vertices_per_line: u32,
    pub lod_level: u32,
    /// The number of triangle strip rows, excluding the two skirt rows.
    pub rows: u32,
    /// The normalized skirt size as raw `f32` bits.
    pub skirt_size_bits: u32,

    pub grid_x: i32,
    pub grid_z: i32,
    pub max_x: u32,
    pub max_z: u32,

    pub terrain_origin: [f32; 3],
    pub inv_width: f32,

    pub xz_relative_size_x: f32,
    pub height_unorm_scaled: f32,
    pub xz_relative_size_z: f32,
    pub inv_depth: f32,
}

impl CellGpuRecord {
    pub const SIZE: usize = 64;

    pub fn skirt_size(&self) -> f32 {
        f32::from_bits(self.skirt_size_bits)
    }
}

const _: () = assert!(mem::size_of::<CellGpuRecord>() == CellGpuRecord::SIZE);

/// A rectangular patch of the heightmap drawn as one triangle strip.
///
/// Cells are pooled and reused every frame. Their footprint is always clamped to the
/// terrain bounds on the positive side.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TerrainCell {
    grid_x: i32,
    grid_z: i32,
    lod_level: u32,
    vertices_per_line: u32,
    size_x: u32,
    size_z: u32,
    primitive_count: u32,
    terrain_size: UVec2,
    use_skirts: bool,
}

impl TerrainCell {
    pub fn new(terrain_size: UVec2, use_skirts: bool) -> Self {
        Self {
            grid_x: 0,
            grid_z: 0,
            lod_level: 0,
            vertices_per_line: 1,
            size_x: 0,
            size_z: 0,
            primitive_count: 0,
            terrain_size,
            use_skirts,
        }
    }

    /// Places the cell at `grid_pos` covering `horizontal` x `vertical` heightmap pixels,
    /// sampled every `1 << lod_level` pixels.
    pub fn set_origin(
        &mut self,
        grid_pos: GridPoint,
        horizontal_pixel_dim: u32,
        vertical_pixel_dim: u32,
        lod_level: u32,
    ) {
        let clamp_to = |pos: i32, dim: u32, extent: u32| -> u32 {
            (i64::from(extent) - i64::from(pos)).clamp(0, i64::from(dim)) as u32
        };

        let mut horizontal = clamp_to(grid_pos.x, horizontal_pixel_dim, self.terrain_size.x);
        let mut vertical = clamp_to(grid_pos.z, vertical_pixel_dim, self.terrain_size.y);

        self.grid_x = grid_pos.x;
        self.grid_z = grid_pos.z;
        self.lod_level = lod_level;
        self.size_x = horizontal;
        self.size_z = vertical;

        let lod_step = 1u32 << lod_level;
        horizontal = horizontal.div_ceil(lod_step) + 1;
        vertical = vertical.div_ceil(lod_step) + 1;

        horizontal = horizontal.max(2);
        vertical = vertical.max(2);

        if self.use_skirts {
            horizontal += 2;
            vertical += 2;
        }

        // Each strip row draws every vertex twice plus two degenerate vertices.
        self.vertices_per_line = horizontal * 2 + 2;
        self.primitive_count = self.vertices_per_line * (vertical - 1);

        debug_assert!(self.primitive_count > 0);
    }

    /// Absorbs `next` if both cells have the same LOD and share an edge of the same
    /// length, keeping the lower origin. Returns `false` and leaves both untouched otherwise.
    pub fn merge(&mut self, next: &TerrainCell) -> bool {
        if self.lod_level != next.lod_level {
            return false;
        }

        let (this_x, this_z) = (i64::from(self.grid_x), i64::from(self.grid_z));
        let (next_x, next_z) = (i64::from(next.grid_x), i64::from(next.grid_z));

        let horizontal_neighbour = (this_x + i64::from(self.size_x) == next_x
            || next_x + i64::from(next.size_x) == this_x)
            && self.grid_z == next.grid_z
            && self.size_z == next.size_z;
        let vertical_neighbour = (this_z + i64::from(self.size_z) == next_z
            || next_z + i64::from(next.size_z) == this_z)
            && self.grid_x == next.grid_x
            && self.size_x == next.size_x;

        if horizontal_neighbour {
            let origin = GridPoint::new(self.grid_x.min(next.grid_x), self.grid_z);
            self.set_origin(origin, self.size_x + next.size_x, self.size_z, self.lod_level);
            true
        } else if vertical_neighbour {
            let origin = GridPoint::new(self.grid_x, self.grid_z.min(next.grid_z));
            self.set_origin(origin, self.size_x, self.size_z + next.size_z, self.lod_level);
            true
        } else {
            false
        }
    }

    pub fn gpu_record(&self, constants: &CellShaderConstants) -> CellGpuRecord {
        let normalized_skirt = if constants.height > 0.0 {
            constants.skirt_size / constants.height
        } else {
            0.0
        };

        CellGpuRecord {
            vertices_per_line: self.vertices_per_line,
            lod_level: self.lod_level,
            rows: (self.primitive_count / self.vertices_per_line).saturating_sub(2),
            skirt_size_bits: normalized_skirt.to_bits(),
            grid_x: self.grid_x,
            grid_z: self.grid_z,
            max_x: constants.width.saturating_sub(1),
            max_z: constants.depth.saturating_sub(1),
            terrain_origin: constants.terrain_origin.to_array(),
            inv_width: constants.inv_width,
            xz_relative_size_x: constants.xz_relative_size.x,
            height_unorm_scaled: constants.height_unorm_scaled,
            xz_relative_size_z: constants.xz_relative_size.y,
            inv_depth: constants.inv_depth,
        }
    }

    /// Writes the 64 byte record to the start of `out`.
    pub fn upload_to_gpu(&self, constants: &CellShaderConstants, out: &mut [u8]) {
        let record = self.gpu_record(constants);
        out[..CellGpuRecord::SIZE].copy_from_slice(bytemuck::bytes_of(&record));
    }

    #[inline]
    pub fn grid_position(&self) -> GridPoint {
        GridPoint::new(self.grid_x, self.grid_z)
    }

    /// The clamped footprint in heightmap pixels.
    #[inline]
    pub fn size(&self) -> UVec2 {
        UVec2::new(self.size_x, self.size_z)
    }

    #[inline]
    pub fn lod_level(&self) -> u32 {
        self.lod_level
    }

    #[inline]
    pub fn vertices_per_line(&self) -> u32 {
        self.vertices_per_line
    }

    #[inline]
    pub fn primitive_count(&self) -> u32 {
        self.primitive_count
    }

    #[inline]
    pub fn use_skirts(&self) -> bool {
        self.use_skirts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const TERRAIN: UVec2 = UVec2::new(256, 256);

    fn cell_at(x: i32, z: i32, size: u32, lod: u32) -> TerrainCell {
        let mut cell = TerrainCell::new(TERRAIN, false);
        cell.set_origin(GridPoint::new(x, z), size, size, lod);
        cell
    }

    #[test]
    fn vertex_counts() {
        let cell = cell_at(0, 0, 64, 0);
        assert_eq!(cell.vertices_per_line(), 132);
        assert_eq!(cell.primitive_count(), 132 * 64);

        let cell = cell_at(0, 0, 64, 1);
        assert_eq!(cell.vertices_per_line(), 68);
        assert_eq!(cell.primitive_count(), 68 * 32);

        let mut skirted = TerrainCell::new(TERRAIN, true);
        skirted.set_origin(GridPoint::ZERO, 64, 64, 0);
        assert_eq!(skirted.vertices_per_line(), 136);
        assert_eq!(skirted.primitive_count(), 136 * 66);
    }

    #[test]
    fn clamped_against_terrain_edge() {
        let cell = cell_at(240, 250, 64, 0);

        assert_eq!(cell.size(), UVec2::new(16, 6));
        assert_eq!(cell.vertices_per_line(), 2 * 17 + 2);
    }

    #[test]
    fn outside_cells_still_draw_a_quad() {
        let cell = cell_at(300, 0, 64, 0);

        assert_eq!(cell.size(), UVec2::new(0, 64));
        assert_eq!(cell.vertices_per_line(), 6);
        assert!(cell.primitive_count() > 0);
    }

    #[test]
    fn negative_origin_keeps_full_size() {
        let cell = cell_at(-64, -64, 64, 1);

        assert_eq!(cell.grid_position(), GridPoint::new(-64, -64));
        assert_eq!(cell.size(), UVec2::new(64, 64));
    }

    #[test]
    fn merge_horizontal_neighbours() {
        let mut left = cell_at(0, 0, 64, 0);
        let right = cell_at(64, 0, 64, 0);

        assert!(left.merge(&right));
        assert_eq!(left.grid_position(), GridPoint::ZERO);
        assert_eq!(left.size(), UVec2::new(128, 64));

        let mut right = cell_at(64, 0, 64, 0);
        assert!(right.merge(&cell_at(0, 0, 64, 0)));
        assert_eq!(right, left);
    }

    #[test]
    fn merge_vertical_neighbours() {
        let mut bottom = cell_at(64, 0, 64, 2);

        assert!(bottom.merge(&cell_at(64, 64, 64, 2)));
        assert_eq!(bottom.size(), UVec2::new(64, 128));
        assert_eq!(bottom.lod_level(), 2);
    }

    #[test]
    fn merge_rejects_mismatched_cells() {
        let cell = cell_at(0, 0, 64, 0);

        for other in [
            cell_at(128, 0, 64, 0),
            cell_at(64, 64, 64, 0),
            cell_at(64, 0, 32, 0),
            cell_at(64, 0, 64, 1),
        ] {
            let mut merged = cell;
            assert!(!merged.merge(&other));
            assert_eq!(merged, cell);
        }
    }

    #[test]
    fn merge_is_symmetric() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let lod = rng.random_range(0..3);
            let size = 8 << rng.random_range(0..3);
            let (x, z) = (rng.random_range(-4..4) * 8, rng.random_range(-4..4) * 8);
            let a = cell_at(x, z, size, lod);

            let neighbour = match rng.random_range(0..4) {
                0 => GridPoint::new(x + size as i32, z),
                1 => GridPoint::new(x - size as i32, z),
                2 => GridPoint::new(x, z + size as i32),
                _ => GridPoint::new(x, z - size as i32),
            };
            let b = cell_at(neighbour.x, neighbour.z, size, lod);

            let (mut ab, mut ba) = (a, b);
            assert!(ab.merge(&b));
            assert!(ba.merge(&a));
            assert_eq!(ab, ba);
            assert_eq!(ab.size().x * ab.size().y, 2 * size * size);
        }
    }

    #[test]
    fn set_origin_is_repeatable() {
        let mut cell = cell_at(32, 16, 48, 2);
        let before = cell;

        cell.set_origin(GridPoint::new(32, 16), 48, 48, 2);
        assert_eq!(cell, before);
    }

    #[test]
    fn gpu_record_layout() {
        let constants = CellShaderConstants {
            width: 256,
            depth: 128,
            skirt_size: 2.0,
            height: 8.0,
            terrain_origin: Vec3::new(-1.0, 2.0, -3.0),
            inv_width: 1.0 / 256.0,
            inv_depth: 1.0 / 128.0,
            xz_relative_size: Vec2::new(0.5, 0.25),
            height_unorm_scaled: 8.0,
        };
        let cell = cell_at(64, -64, 64, 0);

        let mut words = [0u32; 20];
        cell.upload_to_gpu(&constants, bytemuck::cast_slice_mut(&mut words));

        assert_eq!(words[0], 132);
        assert_eq!(words[1], 0);
        assert_eq!(words[2], 62);
        assert_eq!(f32::from_bits(words[3]), 0.25);
        assert_eq!(words[4] as i32, 64);
        assert_eq!(words[5] as i32, -64);
        assert_eq!(words[6], 255);
        assert_eq!(words[7], 127);
        assert_eq!(f32::from_bits(words[9]), 2.0);
        assert_eq!(f32::from_bits(words[13]), 8.0);
        assert_eq!(words[16..], [0; 4]);
    }
}
