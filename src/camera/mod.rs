/// Cull camera: orientation, projection and the screen-space matrix
/// the software rasterizer works in.
use glam::{Mat4, Quat, Vec3, Vec4};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub yaw: f32,   // Rotation around Y axis (radians)
    pub pitch: f32, // Rotation around X axis (radians)
    pub roll: f32,  // Rotation around the view axis (radians)
    pub fov: f32,
    pub near: f32,
    pub far: f32,
    pub aspect_ratio: f32,
}

impl Camera {
    pub fn new(position: Vec3, aspect_ratio: f32) -> Self {
        Self {
            position,
            yaw: 0.0,
            pitch: 0.0,
            roll: 0.0,
            fov: 70.0f32.to_radians(),
            near: 0.1,
            far: 1000.0,
            aspect_ratio,
        }
    }

    /// Update camera orientation to look at a specific target point.
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        let view_matrix = Mat4::look_at_rh(self.position, target, up);
        let rotation_quat = Quat::from_mat4(&view_matrix.inverse());
        let (yaw, pitch, roll) = rotation_quat.to_euler(glam::EulerRot::YXZ);
        self.yaw = yaw;
        self.pitch = pitch;
        self.roll = roll;
    }

    pub fn view_matrix(&self) -> Mat4 {
        let rotation = self.rotation_quat();
        let forward = rotation * Vec3::NEG_Z;
        let up = rotation * Vec3::Y;
        Mat4::look_at_rh(self.position, self.position + forward, up)
    }

    /// Standard depth range: clip z is negative in front of the near plane
    /// and z/w runs from 0 at near to 1 at far.
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov, self.aspect_ratio, self.near, self.far)
    }

    /// Same frustum with depth running from 1 at near to 0 at far.
    pub fn reverse_depth_projection_matrix(&self) -> Mat4 {
        flip_depth_range(self.projection_matrix())
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// View-projection followed by the viewport transform to a `width`×`height`
    /// grid with y pointing down. Clip z is left undivided, so after dividing
    /// x and y by w the z component is a depth linear in view distance,
    /// equal to `far` at the far plane and negative in front of the near plane.
    pub fn screen_view_projection(&self, width: usize, height: usize) -> Mat4 {
        screen_matrix(width, height) * self.view_projection_matrix()
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation_quat() * Vec3::NEG_Z
    }

    pub fn right(&self) -> Vec3 {
        self.rotation_quat() * Vec3::X
    }

    pub fn up(&self) -> Vec3 {
        self.rotation_quat() * Vec3::Y
    }

    fn rotation_quat(&self) -> Quat {
        Quat::from_euler(glam::EulerRot::YXZ, self.yaw, self.pitch, self.roll)
    }

    pub fn set_aspect_ratio(&mut self, aspect_ratio: f32) {
        self.aspect_ratio = aspect_ratio;
    }

    /// Extract frustum planes from the view-projection matrix
    pub fn extract_frustum(&self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection_matrix())
    }
}

/// Maps clip x/y to pixel coordinates of a `width`×`height` grid (y down).
pub fn screen_matrix(width: usize, height: usize) -> Mat4 {
    let hw = width as f32 * 0.5;
    let hh = height as f32 * 0.5;
    Mat4::from_cols(
        Vec4::new(hw, 0.0, 0.0, 0.0),
        Vec4::new(0.0, -hh, 0.0, 0.0),
        Vec4::new(0.0, 0.0, 1.0, 0.0),
        Vec4::new(hw, hh, 0.0, 1.0),
    )
}

/// Converts between standard and reversed depth: z' = w - z.
/// Applying it twice returns the input.
pub fn flip_depth_range(m: Mat4) -> Mat4 {
    let mut out = m;
    for c in 0..4 {
        let col = out.col_mut(c);
        col.z = col.w - col.z;
    }
    out
}

/// View frustum represented as 6 planes for AABB culling
/// Planes are stored in Hessian normal form: ax + by + cz + d = 0
/// where (a,b,c) is the inward-facing normal
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    /// 6 planes: left, right, bottom, top, near, far
    pub planes: [Vec4; 6],
}

impl Frustum {
    /// Gribb-Hartmann extraction for a [0, 1] depth range.
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let row0 = vp.row(0);
        let row1 = vp.row(1);
        let row2 = vp.row(2);
        let row3 = vp.row(3);

        Self {
            planes: [
                Self::normalize_plane(row3 + row0),
                Self::normalize_plane(row3 - row0),
                Self::normalize_plane(row3 + row1),
                Self::normalize_plane(row3 - row1),
                // 0 <= z, the near plane of a [0, 1] depth range
                Self::normalize_plane(row2),
                Self::normalize_plane(row3 - row2),
            ],
        }
    }

    #[inline]
    fn normalize_plane(plane: Vec4) -> Vec4 {
        let normal_length = plane.truncate().length();
        if normal_length > 0.0001 {
            plane / normal_length
        } else {
            plane
        }
    }

    /// Test if an AABB intersects the frustum
    /// Returns true if the box is at least partially inside
    pub fn intersects_aabb(&self, min: Vec3, max: Vec3) -> bool {
        for plane in &self.planes {
            // Corner furthest along the plane normal
            let p_vertex = Vec3::new(
                if plane.x > 0.0 { max.x } else { min.x },
                if plane.y > 0.0 { max.y } else { min.y },
                if plane.z > 0.0 { max.z } else { min.z },
            );

            if plane.truncate().dot(p_vertex) + plane.w < 0.0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frustum_culls_box_behind_camera() {
        let camera = Camera::new(Vec3::ZERO, 16.0 / 9.0);
        let frustum = camera.extract_frustum();

        assert!(
            frustum.intersects_aabb(Vec3::new(-1.0, -1.0, -10.0), Vec3::new(1.0, 1.0, -8.0)),
            "box in front of camera should be inside frustum"
        );
        assert!(
            !frustum.intersects_aabb(Vec3::new(-1.0, -1.0, 8.0), Vec3::new(1.0, 1.0, 10.0)),
            "box behind camera should be outside frustum"
        );
    }

    #[test]
    fn screen_matrix_maps_center_and_linear_depth() {
        let camera = Camera::new(Vec3::ZERO, 2.0);
        let m = camera.screen_view_projection(128, 64);

        let p = m * Vec4::new(0.0, 0.0, -10.0, 1.0);
        assert!((p.x / p.w - 64.0).abs() < 1e-3, "center column, got {}", p.x / p.w);
        assert!((p.y / p.w - 32.0).abs() < 1e-3, "center row, got {}", p.y / p.w);

        let far = camera.far;
        let near = camera.near;
        let expected = far * (10.0 - near) / (far - near);
        assert!((p.z - expected).abs() < 1e-3, "undivided z should be linear in distance");

        let in_front_of_near = m * Vec4::new(0.0, 0.0, -0.05, 1.0);
        assert!(in_front_of_near.z < 0.0, "points closer than near must have negative z");
    }

    #[test]
    fn flip_depth_range_is_an_involution() {
        let camera = Camera::new(Vec3::ZERO, 1.5);
        let p = camera.projection_matrix();
        let back = flip_depth_range(flip_depth_range(p));
        assert!(p.abs_diff_eq(back, 1e-6));

        let r = camera.reverse_depth_projection_matrix();
        let near = r.project_point3(Vec3::new(0.0, 0.0, -camera.near));
        assert!((near.z - 1.0).abs() < 1e-4, "reverse depth puts near at 1");
    }

    #[test]
    fn roll_rotates_up_vector() {
        let mut camera = Camera::new(Vec3::ZERO, 1.0);
        camera.roll = std::f32::consts::FRAC_PI_2;
        assert!(camera.up().abs_diff_eq(Vec3::NEG_X, 1e-5) || camera.up().abs_diff_eq(Vec3::X, 1e-5));
        assert!(camera.forward().abs_diff_eq(Vec3::NEG_Z, 1e-5));
    }
}
