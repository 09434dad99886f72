use bevy::{
    math::{Affine3A, Mat4, Vec3, Vec3A},
    render::primitives::{Aabb, Frustum},
};

/// The viewpoint cells are selected and culled for, in client space.
///
/// Without a frustum every cell on the terrain counts as visible.
#[derive(Clone, Copy, Debug, Default)]
pub struct TerraCamera {
    position: Vec3,
    frustum: Option<Frustum>,
    infinite_far: bool,
}

impl TerraCamera {
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            frustum: None,
            infinite_far: false,
        }
    }

    /// Culls against the frustum of `clip_from_world`. The far plane is ignored if
    /// `infinite_far` is set.
    pub fn with_clip_from_world(position: Vec3, clip_from_world: &Mat4, infinite_far: bool) -> Self {
        Self {
            position,
            frustum: Some(Frustum::from_clip_from_world(clip_from_world)),
            infinite_far,
        }
    }

    /// A right handed perspective camera. `far: None` uses an infinite projection.
    pub fn perspective(
        position: Vec3,
        target: Vec3,
        up: Vec3,
        fov_y: f32,
        aspect_ratio: f32,
        near: f32,
        far: Option<f32>,
    ) -> Self {
        let view_from_world = Mat4::look_at_rh(position, target, up);
        let clip_from_view = match far {
            Some(far) => Mat4::perspective_rh(fov_y, aspect_ratio, near, far),
            None => Mat4::perspective_infinite_reverse_rh(fov_y, aspect_ratio, near),
        };

        Self::with_clip_from_world(position, &(clip_from_view * view_from_world), far.is_none())
    }

    #[inline]
    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn frustum(&self) -> Option<&Frustum> {
        self.frustum.as_ref()
    }

    pub fn is_box_visible(&self, center: Vec3, half_extents: Vec3) -> bool {
        let Some(frustum) = &self.frustum else {
            return true;
        };

        let aabb = Aabb {
            center: Vec3A::from(center),
            half_extents: Vec3A::from(half_extents.abs()),
        };

        frustum.intersects_obb(&aabb, &Affine3A::IDENTITY, true, !self.infinite_far)
    }
}
