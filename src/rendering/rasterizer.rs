/// Software occluder rasterizer and depth-buffer visibility tests.
///
/// All geometry goes through the screen-space view-projection matrix
/// (`Camera::screen_view_projection`): x/y are divided by w to get texel
/// coordinates, z stays undivided and is interpolated as a linear depth.
use glam::{Affine3A, Mat4, Vec2, Vec3, Vec4};
use std::ops::ControlFlow;

use super::clipping::clip_triangle_near;
use super::depth_buffer::DepthBuffer;
use super::fixed_point::{scan_triangle, signed_area};
use crate::geometry::Aabb;
use crate::perf::FUNCTION_COUNTERS;
use crate::{count_add, count_call};

/// Triangles submitted per mesh are capped to this count.
pub const MAX_TRIANGLES_PER_MESH: usize = 65_535;

const DET_EPSILON: f32 = 1e-6;

/// Box faces as corner indices (bit 0 = x, bit 1 = y, bit 2 = z).
const FACE_NEG_X: [usize; 4] = [0, 2, 6, 4];
const FACE_POS_X: [usize; 4] = [1, 5, 7, 3];
const FACE_NEG_Y: [usize; 4] = [0, 4, 5, 1];
const FACE_POS_Y: [usize; 4] = [2, 3, 7, 6];
const FACE_NEG_Z: [usize; 4] = [0, 1, 3, 2];
const FACE_POS_Z: [usize; 4] = [4, 6, 7, 5];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RasterStats {
    pub draw_calls: u32,
    pub triangles: u32,
    pub triangles_clipped: u32,
}

/// Where an occluder stands relative to the camera and the current depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccluderClass {
    /// Entirely closer than the near plane
    Behind,
    /// Crosses the near plane; not safe to rasterize
    StraddlesNear,
    OffScreen,
    /// Already hidden by depth written earlier this frame
    Occluded,
    Visible,
}

/// Result of testing one triangle against the depth buffer.
#[derive(Debug, Clone, Copy, Default)]
struct Coverage {
    visible: bool,
    covered: bool,
}

impl Coverage {
    #[inline]
    fn merge(self, other: Coverage) -> Coverage {
        Coverage {
            visible: self.visible || other.visible,
            covered: self.covered || other.covered,
        }
    }
}

pub struct CullRasterizer {
    depth: DepthBuffer,
    stats: RasterStats,
}

impl CullRasterizer {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            depth: DepthBuffer::new(width, height),
            stats: RasterStats::default(),
        }
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        if width != self.depth.width() || height != self.depth.height() {
            self.depth.resize(width, height);
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.depth.width()
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.depth.height()
    }

    /// Clear depth and per-frame counters.
    pub fn clear(&mut self) {
        self.depth.clear();
        self.stats = RasterStats::default();
    }

    pub fn reset_stats(&mut self) {
        self.stats = RasterStats::default();
    }

    #[inline]
    pub fn depth(&self) -> &DepthBuffer {
        &self.depth
    }

    #[inline]
    pub fn depth_mut(&mut self) -> &mut DepthBuffer {
        &mut self.depth
    }

    #[inline]
    pub fn stats(&self) -> RasterStats {
        self.stats
    }

    /// Rasterize a triangle list given in world space. Front faces are
    /// counter-clockwise in world space; back faces are skipped.
    /// Returns the number of triangles submitted.
    pub fn rasterize(&mut self, screen_vp: &Mat4, vertices: &[Vec4]) -> usize {
        let tri_count = (vertices.len() / 3).min(MAX_TRIANGLES_PER_MESH);
        if tri_count == 0 {
            return 0;
        }
        self.stats.draw_calls += 1;
        self.stats.triangles += tri_count as u32;
        count_add!(FUNCTION_COUNTERS.triangles_submitted, tri_count);

        for tri in vertices[..tri_count * 3].chunks_exact(3) {
            let v0 = *screen_vp * tri[0];
            let v1 = *screen_vp * tri[1];
            let v2 = *screen_vp * tri[2];
            // Screen y points down, so swap to keep front faces positive
            self.write_triangle([v0, v2, v1], true);
        }
        tri_count
    }

    /// Rasterize a mesh placed by `transform`, submitting at most `max_triangles`.
    pub fn rasterize_instance(
        &mut self,
        screen_vp: &Mat4,
        transform: &Affine3A,
        vertices: &[Vec4],
        max_triangles: usize,
    ) -> usize {
        let matrix = *screen_vp * Mat4::from(*transform);
        let limit = max_triangles.min(vertices.len() / 3) * 3;
        self.rasterize(&matrix, &vertices[..limit])
    }

    fn write_triangle(&mut self, v: [Vec4; 3], cull_backface: bool) {
        if v.iter().any(|p| p.z < 0.0) {
            self.stats.triangles_clipped += 1;
            count_call!(FUNCTION_COUNTERS.triangles_clipped);
            let (count, clipped) = clip_triangle_near(v);
            for tri in &clipped[..count] {
                self.write_triangle_2d(*tri, cull_backface);
            }
        } else {
            self.write_triangle_2d(v, cull_backface);
        }
    }

    fn write_triangle_2d(&mut self, v: [Vec4; 3], cull_backface: bool) {
        let Some((p, z)) = project(v) else {
            return;
        };
        let det = signed_area(p);
        if cull_backface && det <= DET_EPSILON {
            count_call!(FUNCTION_COUNTERS.triangles_backface_culled);
            return;
        }

        let width = self.depth.width();
        let height = self.depth.height();
        let texels = self.depth.as_mut_slice();
        scan_triangle(p, width, height, |x, y, w1, w2| {
            let depth = z[0] + (z[1] - z[0]) * w1 + (z[2] - z[0]) * w2;
            let stored = &mut texels[y * width + x];
            if depth < *stored {
                *stored = depth;
                count_call!(FUNCTION_COUNTERS.pixels_written);
            }
            ControlFlow::Continue(())
        });
    }

    /// Visible if any covered texel stores a depth behind the triangle's nearest point.
    fn test_triangle_2d(&self, v: [Vec4; 3]) -> Coverage {
        let Some((p, z)) = project(v) else {
            return Coverage::default();
        };
        let min_z = z[0].min(z[1]).min(z[2]);
        let width = self.depth.width();
        let texels = self.depth.as_slice();

        let mut covered = false;
        let visible = scan_triangle(p, width, self.depth.height(), |x, y, _, _| {
            covered = true;
            if texels[y * width + x] > min_z {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        Coverage { visible, covered }
    }

    fn test_triangle(&self, v: [Vec4; 3]) -> Coverage {
        if v.iter().any(|p| p.z < 0.0) {
            let (count, clipped) = clip_triangle_near(v);
            clipped[..count]
                .iter()
                .fold(Coverage::default(), |acc, tri| acc.merge(self.test_triangle_2d(*tri)))
        } else {
            self.test_triangle_2d(v)
        }
    }

    /// Conservative rectangle test used when the box covers no texel center.
    fn test_rect(&self, projected: &[Vec4]) -> bool {
        let mut min = Vec2::splat(f32::MAX);
        let mut max = Vec2::splat(f32::MIN);
        let mut min_z = f32::MAX;
        for p in projected {
            let s = Vec2::new(p.x, p.y) / p.w;
            min = min.min(s);
            max = max.max(s);
            min_z = min_z.min(p.z);
        }

        let width = self.depth.width() as f32;
        let height = self.depth.height() as f32;
        if max.x < 0.0 || max.y < 0.0 || min.x >= width || min.y >= height {
            return false;
        }
        let x0 = min.x.floor().max(0.0) as usize;
        let y0 = min.y.floor().max(0.0) as usize;
        let x1 = (max.x.floor() as usize).min(self.depth.width() - 1);
        let y1 = (max.y.floor() as usize).min(self.depth.height() - 1);

        (y0..=y1).any(|y| self.depth.row(y)[x0..=x1].iter().any(|&d| d > min_z))
    }

    /// Is any camera-facing face of `aabb` in front of the stored depth?
    /// Answers visible when the camera is inside the box.
    pub fn test_aabb(&self, screen_vp: &Mat4, aabb: &Aabb, view_pos: Vec3) -> bool {
        count_call!(FUNCTION_COUNTERS.aabb_tests);
        if aabb.contains_point(view_pos) || self.depth.width() == 0 {
            return true;
        }

        let projected = aabb.corners().map(|c| *screen_vp * c.extend(1.0));
        let clipping = projected.iter().any(|p| p.z < 0.0);

        let faces = [
            (view_pos.x < aabb.min.x, FACE_NEG_X),
            (view_pos.x > aabb.max.x, FACE_POS_X),
            (view_pos.y < aabb.min.y, FACE_NEG_Y),
            (view_pos.y > aabb.max.y, FACE_POS_Y),
            (view_pos.z < aabb.min.z, FACE_NEG_Z),
            (view_pos.z > aabb.max.z, FACE_POS_Z),
        ];

        let mut coverage = Coverage::default();
        for (_, [a, b, c, d]) in faces.iter().filter(|(facing, _)| *facing) {
            for tri in [[*a, *b, *c], [*a, *c, *d]] {
                coverage = coverage.merge(self.test_triangle(tri.map(|i| projected[i])));
                if coverage.visible {
                    count_call!(FUNCTION_COUNTERS.aabb_visible);
                    return true;
                }
            }
        }

        let visible = if coverage.covered {
            false
        } else if clipping {
            // Near-clipped and too small to reach a texel center
            true
        } else {
            self.test_rect(&projected)
        };
        if visible {
            count_call!(FUNCTION_COUNTERS.aabb_visible);
        }
        visible
    }

    /// Quad spanned by `center ± axis_x ± axis_y`, tested from both sides.
    pub fn test_quad(&self, screen_vp: &Mat4, center: Vec3, axis_x: Vec3, axis_y: Vec3) -> bool {
        count_call!(FUNCTION_COUNTERS.quad_tests);
        if self.depth.width() == 0 {
            return true;
        }
        let corners = [
            center - axis_x - axis_y,
            center - axis_x + axis_y,
            center + axis_x + axis_y,
            center + axis_x - axis_y,
        ];
        let projected = corners.map(|c| *screen_vp * c.extend(1.0));
        let clipping = projected.iter().any(|p| p.z < 0.0);

        let mut coverage = Coverage::default();
        for tri in [[2, 0, 3], [1, 0, 2]] {
            coverage = coverage.merge(self.test_triangle(tri.map(|i| projected[i])));
            if coverage.visible {
                return true;
            }
        }

        if coverage.covered {
            false
        } else if clipping {
            true
        } else {
            self.test_rect(&projected)
        }
    }

    /// Decide whether an occluder's bounds are worth rasterizing.
    pub fn classify_occluder(&self, screen_vp: &Mat4, aabb: &Aabb, view_pos: Vec3) -> OccluderClass {
        let projected = aabb.corners().map(|c| *screen_vp * c.extend(1.0));
        let behind = projected.iter().filter(|p| p.z < 0.0).count();
        if behind == projected.len() {
            return OccluderClass::Behind;
        }
        if behind > 0 {
            return OccluderClass::StraddlesNear;
        }

        let mut min = Vec2::splat(f32::MAX);
        let mut max = Vec2::splat(f32::MIN);
        for p in &projected {
            let s = Vec2::new(p.x, p.y) / p.w;
            min = min.min(s);
            max = max.max(s);
        }
        if max.x < 0.0
            || max.y < 0.0
            || min.x >= self.depth.width() as f32
            || min.y >= self.depth.height() as f32
        {
            return OccluderClass::OffScreen;
        }

        if self.test_aabb(screen_vp, aabb, view_pos) {
            OccluderClass::Visible
        } else {
            OccluderClass::Occluded
        }
    }

    /// 8-bit view of the buffer for debug overlays.
    pub fn debug_image(&self, far: f32) -> Vec<u8> {
        self.depth.to_grayscale(far)
    }
}

/// Divide x/y by w, keep z. `None` if any vertex has non-positive w.
#[inline]
fn project(v: [Vec4; 3]) -> Option<([Vec2; 3], [f32; 3])> {
    if v.iter().any(|p| p.w <= 0.0) {
        return None;
    }
    Some((
        v.map(|p| Vec2::new(p.x / p.w, p.y / p.w)),
        v.map(|p| p.z),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::rendering::depth_buffer::CLEAR_DEPTH;

    fn setup() -> (CullRasterizer, Camera, Mat4) {
        let rasterizer = CullRasterizer::new(64, 32);
        let camera = Camera::new(Vec3::ZERO, 2.0);
        let m = camera.screen_view_projection(64, 32);
        (rasterizer, camera, m)
    }

    /// Counter-clockwise (seen from +z) wall at depth `z` facing the camera.
    fn wall(z: f32, half: f32) -> Vec<Vec4> {
        let a = Vec4::new(-half, -half, z, 1.0);
        let b = Vec4::new(half, -half, z, 1.0);
        let c = Vec4::new(half, half, z, 1.0);
        let d = Vec4::new(-half, half, z, 1.0);
        vec![a, b, c, a, c, d]
    }

    #[test]
    fn front_facing_wall_writes_depth() {
        let (mut r, _, m) = setup();
        assert_eq!(r.rasterize(&m, &wall(-10.0, 50.0)), 2);
        let center = r.depth().get(32, 16);
        assert!(center < CLEAR_DEPTH, "wall should cover the center texel");
        assert!(r.depth().as_slice().iter().all(|&d| d < CLEAR_DEPTH), "large wall covers everything");
    }

    #[test]
    fn back_facing_wall_is_culled() {
        let (mut r, _, m) = setup();
        let mut tris = wall(-10.0, 50.0);
        tris.swap(1, 2);
        tris.swap(4, 5);
        r.rasterize(&m, &tris);
        assert!(r.depth().as_slice().iter().all(|&d| d == CLEAR_DEPTH));
    }

    #[test]
    fn box_behind_wall_is_occluded_and_in_front_is_visible() {
        let (mut r, camera, m) = setup();
        r.rasterize(&m, &wall(-10.0, 50.0));

        let behind = Aabb::new(Vec3::new(-1.0, -1.0, -30.0), Vec3::new(1.0, 1.0, -28.0));
        let in_front = Aabb::new(Vec3::new(-1.0, -1.0, -6.0), Vec3::new(1.0, 1.0, -4.0));
        assert!(!r.test_aabb(&m, &behind, camera.position));
        assert!(r.test_aabb(&m, &in_front, camera.position));
    }

    #[test]
    fn camera_inside_box_is_visible() {
        let (mut r, camera, m) = setup();
        r.depth_mut().fill(0.0);
        let around = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        assert!(r.test_aabb(&m, &around, camera.position));
    }

    #[test]
    fn straddling_box_with_no_coverage_fails_open() {
        let (mut r, camera, m) = setup();
        r.depth_mut().fill(0.0);
        // Beside the camera, crossing the near plane, projected far off-screen
        let beside = Aabb::new(Vec3::new(5.0, -1.0, -0.5), Vec3::new(6.0, 1.0, 0.5));
        assert!(r.test_aabb(&m, &beside, camera.position));
    }

    #[test]
    fn tiny_box_uses_rect_fallback() {
        let (mut r, camera, m) = setup();
        let tiny = Aabb::new(Vec3::new(-0.001, -0.001, -50.0), Vec3::new(0.001, 0.001, -49.999));
        assert!(r.test_aabb(&m, &tiny, camera.position), "empty buffer hides nothing");
        r.depth_mut().fill(0.0);
        assert!(!r.test_aabb(&m, &tiny, camera.position));
    }

    #[test]
    fn quad_behind_wall_is_hidden() {
        let (mut r, _, m) = setup();
        r.rasterize(&m, &wall(-10.0, 50.0));
        assert!(!r.test_quad(&m, Vec3::new(0.0, 0.0, -20.0), Vec3::X, Vec3::Y));
        assert!(r.test_quad(&m, Vec3::new(0.0, 0.0, -5.0), Vec3::X, Vec3::Y));
    }

    #[test]
    fn classify_reports_near_and_offscreen() {
        let (r, camera, m) = setup();
        let straddle = Aabb::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0));
        let behind = Aabb::new(Vec3::new(-1.0, -1.0, 5.0), Vec3::new(1.0, 1.0, 6.0));
        let off = Aabb::new(Vec3::new(500.0, -1.0, -12.0), Vec3::new(501.0, 1.0, -10.0));
        let ahead = Aabb::new(Vec3::new(-1.0, -1.0, -12.0), Vec3::new(1.0, 1.0, -10.0));
        let eye = camera.position;

        assert_eq!(r.classify_occluder(&m, &behind, eye), OccluderClass::Behind);
        assert_eq!(
            r.classify_occluder(&m, &straddle, eye + Vec3::new(0.0, 0.0, 2.0)),
            OccluderClass::StraddlesNear
        );
        assert_eq!(r.classify_occluder(&m, &off, eye), OccluderClass::OffScreen);
        assert_eq!(r.classify_occluder(&m, &ahead, eye), OccluderClass::Visible);
    }

    #[test]
    fn triangle_clamp_limits_submission() {
        let (mut r, _, m) = setup();
        let many: Vec<Vec4> = std::iter::repeat(wall(-10.0, 1.0))
            .take(MAX_TRIANGLES_PER_MESH / 2 + 10)
            .flatten()
            .collect();
        assert_eq!(r.rasterize(&m, &many), MAX_TRIANGLES_PER_MESH);
        assert_eq!(r.stats().draw_calls, 1);
    }
}
