/// Reprojection of last frame's hardware depth buffer into the cull buffer.
///
/// Runs in three band-parallel phases:
/// 1. `reproject_band`: source rows are unprojected with the previous
///    frame's matrix and splatted into a per-slot swap buffer with the
///    current screen-space matrix (min depth wins, 0 marks empty).
/// 2. `merge_band`: swap buffers are combined per target row band.
/// 3. `resolve_band`: holes are filled from the 3x3 neighbourhood or the
///    far plane, then the reprojection bias is applied.
use glam::{Mat4, Vec4};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use super::depth_buffer::DepthBuffer;
use crate::camera::flip_depth_range;
use crate::perf::FUNCTION_COUNTERS;
use crate::{count_add, count_call};

const W_EPSILON: f32 = 1e-7;

/// Depth image read back from the GPU for the previous frame.
#[derive(Debug, Clone)]
pub struct HardwareDepthFrame {
    pub width: usize,
    pub height: usize,
    /// Device depth per texel, row-major, top row first
    pub depth: Vec<f32>,
    /// View-projection the depth was rendered with
    pub view_proj: Mat4,
}

/// Supplies the previous frame's depth, typically a GPU readback.
pub trait HardwareDepthSource: Send + Sync {
    /// `None` when no depth is available yet (first frames, device reset).
    fn download(&self, width: usize, height: usize) -> Option<HardwareDepthFrame>;
}

#[derive(Debug, Clone, Copy)]
pub struct ReprojectionParams {
    pub width: usize,
    pub height: usize,
    /// Current frame screen-space view-projection
    pub screen_vp: Mat4,
    pub near: f32,
    pub far: f32,
    pub nearest_max: f32,
    pub bias: f32,
    pub reverse_depth: bool,
}

/// Contiguous row range handled by one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Band {
    pub index: usize,
    pub y0: usize,
    pub rows: usize,
}

/// Split `height` rows into bands of at most `lines_per_band` rows.
pub fn bands(height: usize, lines_per_band: usize) -> Vec<Band> {
    let lines = lines_per_band.max(1);
    (0..height)
        .step_by(lines)
        .enumerate()
        .map(|(index, y0)| Band {
            index,
            y0,
            rows: lines.min(height - y0),
        })
        .collect()
}

/// A downloaded frame prepared for reprojection.
pub struct ReprojectionFrame {
    pub frame: HardwareDepthFrame,
    pub params: ReprojectionParams,
    inv_prev: Mat4,
}

impl ReprojectionFrame {
    /// `None` if the frame is malformed or its matrix cannot be inverted.
    pub fn new(frame: HardwareDepthFrame, params: ReprojectionParams) -> Option<Self> {
        if frame.width == 0 || frame.height == 0 || frame.depth.len() != frame.width * frame.height {
            log::warn!(
                "discarding hardware depth {}x{} with {} texels",
                frame.width,
                frame.height,
                frame.depth.len()
            );
            return None;
        }
        let prev = if params.reverse_depth {
            flip_depth_range(frame.view_proj)
        } else {
            frame.view_proj
        };
        if prev.determinant().abs() < f32::EPSILON * 1e-3 {
            return None;
        }
        Some(Self {
            inv_prev: prev.inverse(),
            frame,
            params,
        })
    }

    /// Far plane in cull-buffer depth units.
    #[inline]
    pub fn far_depth(&self) -> f32 {
        self.params.far
    }

    #[inline]
    fn device_depth(&self, index: usize) -> f32 {
        let d = self.frame.depth[index];
        if self.params.reverse_depth {
            1.0 - d
        } else {
            d
        }
    }
}

/// Per-frame scratch shared by the band jobs.
pub struct ReprojectScratch {
    width: usize,
    height: usize,
    swaps: Vec<RwLock<Vec<f32>>>,
    merged: Vec<AtomicU32>,
}

impl ReprojectScratch {
    pub fn new(width: usize, height: usize, slots: usize) -> Self {
        let texels = width * height;
        Self {
            width,
            height,
            swaps: (0..slots.max(1)).map(|_| RwLock::new(vec![0.0; texels])).collect(),
            merged: (0..texels).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    #[inline]
    pub fn matches(&self, width: usize, height: usize, slots: usize) -> bool {
        self.width == width && self.height == height && self.swaps.len() == slots.max(1)
    }

    /// Zero all swap buffers before a new frame.
    pub fn reset(&self) {
        for swap in &self.swaps {
            swap.write().fill(0.0);
        }
    }

    /// Phase 1 over source rows of `band`.
    pub fn reproject_band(&self, frame: &ReprojectionFrame, band: Band) {
        let params = &frame.params;
        let (src_w, src_h) = (frame.frame.width, frame.frame.height);
        let (dst_w, dst_h) = (self.width, self.height);
        let mut swap = self.swaps[band.index % self.swaps.len()].write();

        for y in band.y0..(band.y0 + band.rows).min(src_h) {
            for x in 0..src_w {
                let d = frame.device_depth(y * src_w + x);
                let ndc = Vec4::new(
                    (x as f32 + 0.5) * 2.0 / src_w as f32 - 1.0,
                    1.0 - (y as f32 + 0.5) * 2.0 / src_h as f32,
                    d,
                    1.0,
                );
                let world = frame.inv_prev * ndc;
                if world.w.abs() < W_EPSILON {
                    continue;
                }
                let world = (world / world.w).truncate().extend(1.0);
                let screen = params.screen_vp * world;
                if screen.z <= 0.0 || screen.w <= 0.0 {
                    continue;
                }

                let (tx, ty, depth) = if d < params.nearest_max {
                    // First-person geometry: keep in place at its own depth
                    (x * dst_w / src_w, y * dst_h / src_h, nearest_depth(d, params))
                } else {
                    let sx = (screen.x / screen.w).floor();
                    let sy = (screen.y / screen.w).floor();
                    if sx < 0.0 || sy < 0.0 || sx >= dst_w as f32 || sy >= dst_h as f32 {
                        continue;
                    }
                    (sx as usize, sy as usize, screen.z)
                };

                let slot = &mut swap[ty * dst_w + tx];
                if *slot == 0.0 || depth < *slot {
                    *slot = depth;
                }
                count_call!(FUNCTION_COUNTERS.texels_reprojected);
            }
        }
    }

    /// Phase 2 over target rows of `band`: min across swap buffers, zero = empty.
    pub fn merge_band(&self, band: Band) {
        let start = band.y0 * self.width;
        let end = ((band.y0 + band.rows) * self.width).min(self.merged.len());
        let swaps: Vec<_> = self.swaps.iter().map(|s| s.read()).collect();
        for i in start..end {
            let merged = swaps
                .iter()
                .map(|s| s[i])
                .filter(|&d| d > 0.0)
                .fold(0.0f32, |acc, d| if acc == 0.0 { d } else { acc.min(d) });
            self.merged[i].store(merged.to_bits(), Ordering::Relaxed);
        }
    }

    #[inline]
    fn merged_at(&self, x: usize, y: usize) -> f32 {
        f32::from_bits(self.merged[y * self.width + x].load(Ordering::Relaxed))
    }

    /// Phase 3 over target rows of `band`; returns the band's final texels.
    pub fn resolve_band(&self, frame: &ReprojectionFrame, band: Band) -> Vec<f32> {
        let far = frame.far_depth();
        let linear = (-frame.params.bias).max(0.0);
        let scale = frame.params.bias.max(0.0);
        let rows_end = (band.y0 + band.rows).min(self.height);

        let mut out = Vec::with_capacity((rows_end - band.y0) * self.width);
        #[cfg(feature = "profiling")]
        let mut holes = 0u64;
        for y in band.y0..rows_end {
            for x in 0..self.width {
                let mut d = self.merged_at(x, y);
                if d == 0.0 {
                    #[cfg(feature = "profiling")]
                    {
                        holes += 1;
                    }
                    for ny in y.saturating_sub(1)..(y + 2).min(self.height) {
                        for nx in x.saturating_sub(1)..(x + 2).min(self.width) {
                            d = d.max(self.merged_at(nx, ny));
                        }
                    }
                    if d == 0.0 {
                        d = far;
                    }
                }
                d += linear;
                d += scale * d + scale;
                out.push(d);
            }
        }
        count_add!(FUNCTION_COUNTERS.holes_filled, holes);
        out
    }

    /// All three phases on the calling thread.
    pub fn reproject_serial(&self, frame: &ReprojectionFrame, depth: &mut DepthBuffer, lines_per_band: usize) {
        self.reset();
        for band in bands(frame.frame.height, lines_per_band) {
            self.reproject_band(frame, band);
        }
        let target = bands(self.height, lines_per_band);
        for band in &target {
            self.merge_band(*band);
        }
        for band in &target {
            let texels = self.resolve_band(frame, *band);
            depth.band_mut(band.y0, band.rows).copy_from_slice(&texels);
        }
    }
}

/// Cull-buffer depth of a texel that stays in place: the undivided clip z
/// at the view distance encoded by device depth `d`.
#[inline]
fn nearest_depth(d: f32, params: &ReprojectionParams) -> f32 {
    let (n, f) = (params.near, params.far);
    let distance = f * n / (f - d * (f - n));
    d * distance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use glam::Vec3;

    fn params(camera: &Camera, w: usize, h: usize) -> ReprojectionParams {
        ReprojectionParams {
            width: w,
            height: h,
            screen_vp: camera.screen_view_projection(w, h),
            near: camera.near,
            far: camera.far,
            nearest_max: 0.0,
            bias: 0.0,
            reverse_depth: false,
        }
    }

    /// Device depth of a flat wall at view distance `distance`.
    fn wall_frame(camera: &Camera, w: usize, h: usize, distance: f32) -> HardwareDepthFrame {
        let p = camera.projection_matrix();
        let d = p.project_point3(Vec3::new(0.0, 0.0, -distance)).z;
        HardwareDepthFrame {
            width: w,
            height: h,
            depth: vec![d; w * h],
            view_proj: camera.view_projection_matrix(),
        }
    }

    #[test]
    fn bands_cover_all_rows() {
        let b = bands(37, 16);
        assert_eq!(b.len(), 3);
        assert_eq!(b[2], Band { index: 2, y0: 32, rows: 5 });
        assert_eq!(b.iter().map(|b| b.rows).sum::<usize>(), 37);
    }

    #[test]
    fn static_camera_reprojects_wall_depth() {
        let camera = Camera::new(Vec3::ZERO, 2.0);
        let (w, h) = (32, 16);
        let frame = ReprojectionFrame::new(wall_frame(&camera, w, h, 20.0), params(&camera, w, h)).unwrap();
        let scratch = ReprojectScratch::new(w, h, 2);
        let mut depth = DepthBuffer::new(w, h);
        scratch.reproject_serial(&frame, &mut depth, 4);

        // A plane at -z = 20 has view distance 20 along the axis only;
        // off-axis texels are farther in Euclidean terms but same clip z
        let expected = camera.far * (20.0 - camera.near) / (camera.far - camera.near);
        for &d in depth.as_slice() {
            assert!((d - expected).abs() < 0.05 * expected, "got {d}, expected about {expected}");
        }
    }

    #[test]
    fn holes_fall_back_to_far_plane() {
        let camera = Camera::new(Vec3::ZERO, 2.0);
        let (w, h) = (16, 8);
        let mut raw = wall_frame(&camera, w, h, 20.0);
        // Depth 1.0 is the far plane; after reprojection it lands at far
        raw.depth.fill(1.0);
        let mut moved = camera;
        moved.yaw = std::f32::consts::PI; // looking the other way
        let frame = ReprojectionFrame::new(raw, params(&moved, w, h)).unwrap();
        let scratch = ReprojectScratch::new(w, h, 1);
        let mut depth = DepthBuffer::new(w, h);
        scratch.reproject_serial(&frame, &mut depth, 8);
        assert!(depth.as_slice().iter().all(|&d| (d - camera.far).abs() < 1e-3));
    }

    #[test]
    fn positive_bias_pushes_depth_back() {
        let camera = Camera::new(Vec3::ZERO, 2.0);
        let (w, h) = (16, 8);
        let mut p = params(&camera, w, h);
        p.bias = 0.1;
        let frame = ReprojectionFrame::new(wall_frame(&camera, w, h, 20.0), p).unwrap();
        let scratch = ReprojectScratch::new(w, h, 1);
        let mut depth = DepthBuffer::new(w, h);
        scratch.reproject_serial(&frame, &mut depth, 8);

        let unbiased = camera.far * (20.0 - camera.near) / (camera.far - camera.near);
        let center = depth.get(8, 4);
        assert!(center > unbiased * 1.09, "bias should move {center} behind {unbiased}");
    }

    #[test]
    fn malformed_frame_is_rejected() {
        let camera = Camera::new(Vec3::ZERO, 2.0);
        let mut raw = wall_frame(&camera, 8, 8, 10.0);
        raw.depth.truncate(10);
        assert!(ReprojectionFrame::new(raw, params(&camera, 8, 8)).is_none());
    }

    #[test]
    fn reverse_depth_matches_standard() {
        let camera = Camera::new(Vec3::ZERO, 2.0);
        let (w, h) = (16, 8);
        let standard = wall_frame(&camera, w, h, 15.0);
        let mut reversed = standard.clone();
        for d in &mut reversed.depth {
            *d = 1.0 - *d;
        }
        reversed.view_proj = camera.reverse_depth_projection_matrix() * camera.view_matrix();

        let mut p = params(&camera, w, h);
        let a = ReprojectionFrame::new(standard, p).unwrap();
        p.reverse_depth = true;
        let b = ReprojectionFrame::new(reversed, p).unwrap();

        let scratch = ReprojectScratch::new(w, h, 1);
        let mut da = DepthBuffer::new(w, h);
        let mut db = DepthBuffer::new(w, h);
        scratch.reproject_serial(&a, &mut da, 8);
        scratch.reproject_serial(&b, &mut db, 8);
        for (x, y) in da.as_slice().iter().zip(db.as_slice()) {
            assert!((x - y).abs() < 1e-2 * x.abs().max(1.0));
        }
    }
}
