//! Integer heightmap addressing and the conversions between the client space and the
//! Y-up space the terrain works in internally.

use bevy::math::{IVec2, Vec3};
use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul};

/// An integer position on the heightmap grid.
///
/// May be negative while computing LOD rings around the camera, before a cell is
/// clamped against the terrain bounds.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct GridPoint {
    pub x: i32,
    pub z: i32,
}

impl GridPoint {
    pub const ZERO: Self = Self { x: 0, z: 0 };

    #[inline]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Snaps the point down to a multiple of `step` on each axis (flooring, also for
    /// negative coordinates).
    #[inline]
    pub fn quantize(self, step: GridPoint) -> Self {
        Self {
            x: self.x.div_euclid(step.x) * step.x,
            z: self.z.div_euclid(step.z) * step.z,
        }
    }

    #[inline]
    pub fn as_ivec2(self) -> IVec2 {
        IVec2::new(self.x, self.z)
    }
}

impl Add<GridDirection> for GridPoint {
    type Output = GridPoint;

    #[inline]
    fn add(self, rhs: GridDirection) -> Self::Output {
        GridPoint::new(self.x.saturating_add(rhs.x), self.z.saturating_add(rhs.z))
    }
}

/// A step on the heightmap grid, measured in cells.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct GridDirection {
    pub x: i32,
    pub z: i32,
}

impl GridDirection {
    pub const POSITIVE_X: Self = Self { x: 1, z: 0 };
    pub const POSITIVE_Z: Self = Self { x: 0, z: 1 };

    #[inline]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

/// Scales a direction (in cells) by a cell size (in pixels).
impl Mul<GridPoint> for GridDirection {
    type Output = GridDirection;

    #[inline]
    fn mul(self, rhs: GridPoint) -> Self::Output {
        GridDirection::new(self.x.saturating_mul(rhs.x), self.z.saturating_mul(rhs.z))
    }
}

/// Which axis the client considers "up".
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum UpAxis {
    #[default]
    Y,
    Z,
}

impl UpAxis {
    /// Converts a client space vector into Y-up space.
    #[inline]
    pub fn to_y_up(self, mut value: Vec3) -> Vec3 {
        if self == UpAxis::Z {
            std::mem::swap(&mut value.y, &mut value.z);
            value.z = -value.z;
        }
        value
    }

    /// Converts a Y-up vector back into client space.
    #[inline]
    pub fn from_y_up(self, mut value: Vec3) -> Vec3 {
        if self == UpAxis::Z {
            std::mem::swap(&mut value.y, &mut value.z);
            value.y = -value.y;
        }
        value
    }

    /// Same as [`Self::to_y_up`], but keeps the sign. Needed when the value is a scale.
    #[inline]
    pub fn to_y_up_sign_preserving(self, mut value: Vec3) -> Vec3 {
        if self == UpAxis::Z {
            std::mem::swap(&mut value.y, &mut value.z);
        }
        value
    }

    /// Same as [`Self::from_y_up`], but keeps the sign. Needed when the value is a scale.
    #[inline]
    pub fn from_y_up_sign_preserving(self, value: Vec3) -> Vec3 {
        self.to_y_up_sign_preserving(value)
    }
}
