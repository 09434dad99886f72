//! Heightmap images and the CPU copy of the terrain heights.

use crate::error::{TerraError, TerraResult};
use bevy::{log::debug, render::render_resource::TextureFormat};
use image::{DynamicImage, ImageReader};
use itertools::iproduct;
use ndarray::{s, Array2, ArrayView2};
use std::path::Path;

/// Pixel storage of a greyscale heightmap.
#[derive(Clone, Debug, PartialEq)]
pub enum HeightSamples {
    R8(Vec<u8>),
    R16(Vec<u16>),
    /// 16 bit integers sampled without normalization on the GPU.
    R16Uint(Vec<u16>),
    R32Float(Vec<f32>),
}

impl HeightSamples {
    fn len(&self) -> usize {
        match self {
            HeightSamples::R8(samples) => samples.len(),
            HeightSamples::R16(samples) | HeightSamples::R16Uint(samples) => samples.len(),
            HeightSamples::R32Float(samples) => samples.len(),
        }
    }
}

/// A validated heightmap with rows laid out along X, one row per Z.
#[derive(Clone, Debug, PartialEq)]
pub struct HeightmapImage {
    width: u32,
    depth: u32,
    samples: HeightSamples,
}

impl HeightmapImage {
    pub fn new(width: u32, depth: u32, samples: HeightSamples) -> TerraResult<Self> {
        if width == 0 || depth == 0 {
            return Err(TerraError::EmptyHeightmap {
                width,
                height: depth,
            });
        }
        if samples.len() != width as usize * depth as usize {
            return Err(TerraError::UnsupportedPixelFormat(format!(
                "{} samples do not fill a {width}x{depth} heightmap",
                samples.len()
            )));
        }

        Ok(Self {
            width,
            depth,
            samples,
        })
    }

    /// Accepts 8 and 16 bit greyscale images and the red channel of 32-bit float images.
    pub fn from_dynamic(image: &DynamicImage) -> TerraResult<Self> {
        let samples = match image {
            DynamicImage::ImageLuma8(buffer) => HeightSamples::R8(buffer.as_raw().clone()),
            DynamicImage::ImageLuma16(buffer) => HeightSamples::R16(buffer.as_raw().clone()),
            DynamicImage::ImageRgb32F(buffer) => {
                HeightSamples::R32Float(buffer.pixels().map(|pixel| pixel[0]).collect())
            }
            DynamicImage::ImageRgba32F(buffer) => {
                HeightSamples::R32Float(buffer.pixels().map(|pixel| pixel[0]).collect())
            }
            other => {
                return Err(TerraError::UnsupportedPixelFormat(format!(
                    "{:?}",
                    other.color()
                )))
            }
        };

        Self::new(image.width(), image.height(), samples)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> TerraResult<Self> {
        let path = path.as_ref();
        let image = ImageReader::open(path)?.decode()?;

        debug!(
            "Decoded heightmap {} ({}x{}, {:?}).",
            path.display(),
            image.width(),
            image.height(),
            image.color()
        );

        Self::from_dynamic(&image)
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn samples(&self) -> &HeightSamples {
        &self.samples
    }

    pub fn format(&self) -> TextureFormat {
        match self.samples {
            HeightSamples::R8(_) => TextureFormat::R8Unorm,
            HeightSamples::R16(_) => TextureFormat::R16Unorm,
            HeightSamples::R16Uint(_) => TextureFormat::R16Uint,
            HeightSamples::R32Float(_) => TextureFormat::R32Float,
        }
    }

    /// The raw texel data, ready for upload.
    pub fn bytes(&self) -> &[u8] {
        match &self.samples {
            HeightSamples::R8(samples) => samples.as_slice(),
            HeightSamples::R16(samples) | HeightSamples::R16Uint(samples) => {
                bytemuck::cast_slice(samples)
            }
            HeightSamples::R32Float(samples) => bytemuck::cast_slice(samples),
        }
    }

    /// Every sample mapped to `[0, 1]` (float maps are taken as is).
    fn normalized(&self) -> Vec<f32> {
        match &self.samples {
            HeightSamples::R8(samples) => samples
                .iter()
                .map(|&sample| f32::from(sample) / 255.0)
                .collect(),
            HeightSamples::R16(samples) | HeightSamples::R16Uint(samples) => samples
                .iter()
                .map(|&sample| f32::from(sample) / 65535.0)
                .collect(),
            HeightSamples::R32Float(samples) => samples.clone(),
        }
    }
}

/// Terrain heights in world units, relative to the terrain origin. Indexed `[[z, x]]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Heightmap {
    heights: Array2<f32>,
}

impl Default for Heightmap {
    fn default() -> Self {
        Self {
            heights: Array2::zeros((0, 0)),
        }
    }
}

impl Heightmap {
    pub fn from_image(image: &HeightmapImage, height: f32) -> Self {
        let width = image.width as usize;
        let normalized = image.normalized();

        Self {
            heights: Array2::from_shape_fn((image.depth as usize, width), |(z, x)| {
                normalized[z * width + x] * height
            }),
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.heights.ncols() as u32
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.heights.nrows() as u32
    }

    #[inline]
    pub fn get(&self, x: u32, z: u32) -> f32 {
        self.heights[[z as usize, x as usize]]
    }

    pub fn view(&self) -> ArrayView2<f32> {
        self.heights.view()
    }

    /// Bilinearly interpolates the height at fractional grid coordinates.
    ///
    /// Returns `None` outside of `[0, width) x [0, depth)`.
    pub fn sample_bilinear(&self, x: f32, z: f32) -> Option<f32> {
        let (width, depth) = (self.width(), self.depth());

        if !(x >= 0.0 && x < width as f32 && z >= 0.0 && z < depth as f32) {
            return None;
        }

        let (x0, z0) = ((x as u32).min(width - 1), (z as u32).min(depth - 1));
        let (x1, z1) = ((x0 + 1).min(width - 1), (z0 + 1).min(depth - 1));
        let (fx, fz) = (x - x0 as f32, z - z0 as f32);

        let top = self.get(x0, z0) * (1.0 - fx) + self.get(x1, z0) * fx;
        let bottom = self.get(x0, z1) * (1.0 - fx) + self.get(x1, z1) * fx;

        Some(top * (1.0 - fz) + bottom * fz)
    }

    /// The skirt length needed to hide cracks between cells of different LOD.
    ///
    /// Looks at 4x4 windows overlapping by one sample, so every pair of adjacent samples
    /// is compared. The result is the smallest non-zero steepest step over all windows,
    /// or zero for a flat map.
    pub fn optimum_skirt_size(&self) -> f32 {
        const WINDOW: usize = 4;
        const STRIDE: usize = WINDOW - 1;

        let (depth, width) = self.heights.dim();
        let mut skirt = f32::INFINITY;

        for (z, x) in iproduct!((0..depth).step_by(STRIDE), (0..width).step_by(STRIDE)) {
            let window = self
                .heights
                .slice(s![z..(z + WINDOW).min(depth), x..(x + WINDOW).min(width)]);

            let along_x = window
                .windows((1, 2))
                .into_iter()
                .map(|pair| (pair[[0, 1]] - pair[[0, 0]]).abs());
            let along_z = window
                .windows((2, 1))
                .into_iter()
                .map(|pair| (pair[[1, 0]] - pair[[0, 0]]).abs());

            let steepest = along_x.chain(along_z).fold(0.0f32, f32::max);

            if steepest > 0.0 {
                skirt = skirt.min(steepest);
            }
        }

        if skirt.is_finite() {
            skirt
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Rgb32FImage, RgbImage};

    fn float_map(width: u32, depth: u32, heights: Vec<f32>) -> Heightmap {
        let image = HeightmapImage::new(width, depth, HeightSamples::R32Float(heights)).unwrap();
        Heightmap::from_image(&image, 1.0)
    }

    #[test]
    fn image_formats() {
        let grey = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 2, image::Luma([255])));
        let image = HeightmapImage::from_dynamic(&grey).unwrap();
        assert_eq!(image.format(), TextureFormat::R8Unorm);
        assert_eq!(image.bytes().len(), 8);
        assert_eq!(Heightmap::from_image(&image, 10.0).get(3, 1), 10.0);

        let float = DynamicImage::ImageRgb32F(Rgb32FImage::from_pixel(2, 2, image::Rgb([0.5, 1.0, 1.0])));
        let image = HeightmapImage::from_dynamic(&float).unwrap();
        assert_eq!(image.format(), TextureFormat::R32Float);
        assert_eq!(Heightmap::from_image(&image, 4.0).get(1, 1), 2.0);

        let rgb = DynamicImage::ImageRgb8(RgbImage::new(2, 2));
        assert!(matches!(
            HeightmapImage::from_dynamic(&rgb),
            Err(TerraError::UnsupportedPixelFormat(_))
        ));
    }

    #[test]
    fn sixteen_bit_maps_share_scaling() {
        let unorm = HeightmapImage::new(1, 1, HeightSamples::R16(vec![65535])).unwrap();
        let uint = HeightmapImage::new(1, 1, HeightSamples::R16Uint(vec![65535])).unwrap();

        assert_eq!(uint.format(), TextureFormat::R16Uint);
        assert_eq!(Heightmap::from_image(&unorm, 3.0), Heightmap::from_image(&uint, 3.0));
    }

    #[test]
    fn empty_and_mismatched_images() {
        assert!(matches!(
            HeightmapImage::new(0, 4, HeightSamples::R8(vec![])),
            Err(TerraError::EmptyHeightmap { .. })
        ));
        assert!(HeightmapImage::new(2, 2, HeightSamples::R8(vec![0; 3])).is_err());
    }

    #[test]
    fn bilinear_sampling() {
        let map = float_map(2, 2, vec![0.0, 1.0, 2.0, 3.0]);

        assert_eq!(map.sample_bilinear(0.0, 0.0), Some(0.0));
        assert_eq!(map.sample_bilinear(0.5, 0.0), Some(0.5));
        assert_eq!(map.sample_bilinear(0.5, 0.5), Some(1.5));
        // the last row and column clamp their neighbours
        assert_eq!(map.sample_bilinear(1.5, 1.5), Some(3.0));
        assert_eq!(map.sample_bilinear(2.0, 0.0), None);
        assert_eq!(map.sample_bilinear(-0.1, 0.0), None);
        assert_eq!(map.sample_bilinear(f32::NAN, 0.0), None);
    }

    #[test]
    fn skirt_of_flat_map_is_zero() {
        assert_eq!(float_map(9, 9, vec![0.25; 81]).optimum_skirt_size(), 0.0);
    }

    #[test]
    fn skirt_of_single_spike() {
        let mut heights = vec![0.0; 100];
        heights[5 * 10 + 6] = 0.75;

        assert_eq!(float_map(10, 10, heights).optimum_skirt_size(), 0.75);
    }

    #[test]
    fn skirt_picks_smallest_step() {
        let mut heights = vec![0.0; 100];
        heights[0] = 0.5;
        heights[99] = 0.125;

        assert_eq!(float_map(10, 10, heights).optimum_skirt_size(), 0.125);
    }
}
