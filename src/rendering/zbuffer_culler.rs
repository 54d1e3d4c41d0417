/// Per-frame 16-bit z-buffer for box and quad visibility against content the
/// renderer feeds in directly.
///
/// Depth is normalized device depth quantized to `u16`; `FAR_DEPTH` (0xFFFF)
/// means empty. Tests are conservative: when in doubt a box is visible.
use glam::{Mat4, Vec2, Vec3, Vec4};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};

use super::fixed_point::{scan_triangle, SUBPIXEL_BITS, SUBPIXEL_ONE};
use crate::camera::Camera;
use crate::config::{RotationSafety, ZBufferConfig, MAX_ZBUFFER_RESOLUTION};
use crate::geometry::Aabb;
use crate::perf::FUNCTION_COUNTERS;
use crate::count_call;

pub const FAR_DEPTH: u16 = u16::MAX;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ZBufferStats {
    pub tests: u32,
    pub visible: u32,
    pub occluded: u32,
    pub triangles: u32,
}

#[derive(Default)]
struct AtomicStats {
    tests: AtomicU32,
    visible: AtomicU32,
    occluded: AtomicU32,
    triangles: AtomicU32,
}

impl AtomicStats {
    fn reset(&self) {
        for c in [&self.tests, &self.visible, &self.occluded, &self.triangles] {
            c.store(0, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> ZBufferStats {
        ZBufferStats {
            tests: self.tests.load(Ordering::Relaxed),
            visible: self.visible.load(Ordering::Relaxed),
            occluded: self.occluded.load(Ordering::Relaxed),
            triangles: self.triangles.load(Ordering::Relaxed),
        }
    }
}

/// Screen rectangle of projected points, in 1/16 texel units.
#[derive(Debug, Clone, Copy)]
struct FixedRect {
    min_x: i64,
    min_y: i64,
    max_x: i64,
    max_y: i64,
}

pub struct ScreenSpaceZBufferCuller {
    resolution: usize,
    grid: Vec<u16>,
    view_proj: Mat4,
    rotation_safety: RotationSafety,
    stats: AtomicStats,
}

impl Default for ScreenSpaceZBufferCuller {
    fn default() -> Self {
        Self::new()
    }
}

impl ScreenSpaceZBufferCuller {
    pub fn new() -> Self {
        Self {
            resolution: 0,
            grid: Vec::new(),
            view_proj: Mat4::IDENTITY,
            rotation_safety: RotationSafety::default(),
            stats: AtomicStats::default(),
        }
    }

    /// Start a frame: reset counters, resize the grid if the configured
    /// resolution changed, capture the camera and clear to far.
    pub fn begin_frame(&mut self, camera: &Camera, config: &ZBufferConfig) {
        self.stats.reset();

        let mut resolution = config.resolution;
        if resolution > MAX_ZBUFFER_RESOLUTION {
            log::warn!(
                "z-buffer resolution {} clamped to {}",
                resolution,
                MAX_ZBUFFER_RESOLUTION
            );
            resolution = MAX_ZBUFFER_RESOLUTION;
        }
        if resolution != self.resolution {
            log::debug!("z-buffer grid resized {} -> {}", self.resolution, resolution);
            self.resolution = resolution;
            self.grid = vec![FAR_DEPTH; resolution * resolution];
        }

        self.view_proj = camera.view_projection_matrix();
        self.rotation_safety = config.rotation_safety;
        self.clear(FAR_DEPTH);
    }

    pub fn set_view_projection(&mut self, view_proj: Mat4) {
        self.view_proj = view_proj;
    }

    pub fn set_rotation_safety(&mut self, mode: RotationSafety) {
        self.rotation_safety = mode;
    }

    pub fn clear(&mut self, depth: u16) {
        self.grid.fill(depth);
    }

    #[inline]
    pub fn resolution(&self) -> usize {
        self.resolution
    }

    #[inline]
    pub fn grid(&self) -> &[u16] {
        &self.grid
    }

    #[inline]
    pub fn depth_at(&self, x: usize, y: usize) -> u16 {
        self.grid[y * self.resolution + x]
    }

    pub fn stats(&self) -> ZBufferStats {
        self.stats.snapshot()
    }

    #[inline]
    fn to_grid(&self, clip: Vec4) -> (Vec2, f32) {
        let inv_w = 1.0 / clip.w;
        let r = self.resolution as f32;
        let ndc = clip.truncate() * inv_w;
        (
            Vec2::new((ndc.x + 1.0) * 0.5 * r, (1.0 - ndc.y) * 0.5 * r),
            ndc.z,
        )
    }

    /// Write a world-space triangle. Triangles touching `w <= 0` are skipped.
    pub fn add_occluder_triangle(&mut self, a: Vec3, b: Vec3, c: Vec3) {
        if self.resolution == 0 {
            return;
        }
        let clip = [a, b, c].map(|p| self.view_proj * p.extend(1.0));
        if clip.iter().any(|p| p.w <= 0.0) {
            return;
        }
        let projected = clip.map(|p| self.to_grid(p));
        let points = projected.map(|(s, _)| s);
        let z = projected.map(|(_, z)| z.clamp(0.0, 1.0) * FAR_DEPTH as f32);

        self.stats.triangles.fetch_add(1, Ordering::Relaxed);
        count_call!(FUNCTION_COUNTERS.zbuffer_triangles);

        let res = self.resolution;
        let grid = &mut self.grid;
        scan_triangle(points, res, res, |x, y, w1, w2| {
            let depth = (z[0] + (z[1] - z[0]) * w1 + (z[2] - z[0]) * w2).ceil();
            let depth = depth.clamp(0.0, FAR_DEPTH as f32) as u16;
            let texel = &mut grid[y * res + x];
            if depth < *texel {
                *texel = depth;
            }
            ControlFlow::Continue(())
        });
    }

    /// Write the quad spanned by `center ± axis_x ± axis_y`.
    pub fn add_occluder_quad(&mut self, center: Vec3, axis_x: Vec3, axis_y: Vec3) {
        let v0 = center - axis_x - axis_y;
        let v1 = center - axis_x + axis_y;
        let v2 = center + axis_x + axis_y;
        let v3 = center + axis_x - axis_y;
        self.add_occluder_triangle(v0, v1, v2);
        self.add_occluder_triangle(v0, v2, v3);
    }

    pub fn is_box_visible(&self, aabb: &Aabb) -> bool {
        count_call!(FUNCTION_COUNTERS.zbuffer_box_tests);
        self.record(self.test_points(&aabb.corners()))
    }

    pub fn is_quad_visible(&self, center: Vec3, axis_x: Vec3, axis_y: Vec3) -> bool {
        let corners = [
            center - axis_x - axis_y,
            center - axis_x + axis_y,
            center + axis_x + axis_y,
            center + axis_x - axis_y,
        ];
        self.record(self.test_points(&corners))
    }

    fn record(&self, visible: bool) -> bool {
        self.stats.tests.fetch_add(1, Ordering::Relaxed);
        if visible {
            self.stats.visible.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.occluded.fetch_add(1, Ordering::Relaxed);
        }
        visible
    }

    fn test_points(&self, points: &[Vec3]) -> bool {
        if self.resolution == 0 || !self.view_proj.is_finite() {
            return true;
        }

        let mut rect = FixedRect {
            min_x: i64::MAX,
            min_y: i64::MAX,
            max_x: i64::MIN,
            max_y: i64::MIN,
        };
        let mut near = f32::MAX;
        for p in points {
            let clip = self.view_proj * p.extend(1.0);
            if clip.w <= 0.0 {
                return true;
            }
            let (s, z) = self.to_grid(clip);
            if !s.is_finite() {
                return true;
            }
            let fx = (s.x * SUBPIXEL_ONE as f32) as i64;
            let fy = (s.y * SUBPIXEL_ONE as f32) as i64;
            rect.min_x = rect.min_x.min(fx);
            rect.min_y = rect.min_y.min(fy);
            rect.max_x = rect.max_x.max(fx);
            rect.max_y = rect.max_y.max(fy);
            near = near.min(z);
        }
        let box_depth = (near.clamp(0.0, 1.0) * FAR_DEPTH as f32).floor() as u16;

        let (x0, y0, x1, y1) = match self.texel_range(rect) {
            TexelRange::Visible => return true,
            TexelRange::Hidden => return false,
            TexelRange::Texels { x0, y0, x1, y1 } => (x0, y0, x1, y1),
        };
        let res = self.resolution;
        (y0..=y1).any(|y| self.grid[y * res + x0..=y * res + x1].iter().any(|&d| d > box_depth))
    }

    /// Texel rectangle to scan under the current rotation-safety mode.
    fn texel_range(&self, rect: FixedRect) -> TexelRange {
        let res = self.resolution as i64;
        let edge = res << SUBPIXEL_BITS;
        let clamp = |v: i64| v.clamp(0, res - 1) as usize;
        let texels = |x0: i64, y0: i64, x1: i64, y1: i64| TexelRange::Texels {
            x0: clamp(x0),
            y0: clamp(y0),
            x1: clamp(x1),
            y1: clamp(y1),
        };

        match self.rotation_safety {
            RotationSafety::Strict => {
                if rect.min_x < 0 || rect.min_y < 0 || rect.max_x > edge || rect.max_y > edge {
                    return TexelRange::Visible;
                }
                texels(
                    rect.min_x >> SUBPIXEL_BITS,
                    rect.min_y >> SUBPIXEL_BITS,
                    rect.max_x >> SUBPIXEL_BITS,
                    rect.max_y >> SUBPIXEL_BITS,
                )
            }
            RotationSafety::Lenient => texels(
                (rect.min_x >> SUBPIXEL_BITS) - 1,
                (rect.min_y >> SUBPIXEL_BITS) - 1,
                (rect.max_x >> SUBPIXEL_BITS) + 1,
                (rect.max_y >> SUBPIXEL_BITS) + 1,
            ),
            RotationSafety::Legacy => {
                // Truncation toward zero
                let (x0, y0) = (rect.min_x / SUBPIXEL_ONE, rect.min_y / SUBPIXEL_ONE);
                let (x1, y1) = (rect.max_x / SUBPIXEL_ONE, rect.max_y / SUBPIXEL_ONE);
                if x1 < 0 || y1 < 0 || x0 >= res || y0 >= res {
                    return TexelRange::Hidden;
                }
                texels(x0, y0, x1, y1)
            }
        }
    }
}

enum TexelRange {
    Visible,
    Hidden,
    Texels {
        x0: usize,
        y0: usize,
        x1: usize,
        y1: usize,
    },
}
