/// Fixed-point triangle scan conversion shared by both depth grids.
///
/// Vertices are snapped to 1/16 pixel, edge functions are evaluated in i64
/// at pixel centers and stepped incrementally, and shared edges follow the
/// top-left fill rule so no texel is covered twice.
use glam::Vec2;
use std::ops::ControlFlow;

pub const SUBPIXEL_BITS: u32 = 4;
pub const SUBPIXEL_ONE: i64 = 1 << SUBPIXEL_BITS;
const HALF_PIXEL: i64 = SUBPIXEL_ONE / 2;

/// Screen coordinates are clamped to this many pixels before snapping.
const COORD_LIMIT: f32 = (1 << 22) as f32;

#[inline]
fn to_fixed(v: f32) -> i64 {
    (v.clamp(-COORD_LIMIT, COORD_LIMIT) * SUBPIXEL_ONE as f32).round() as i64
}

#[derive(Clone, Copy)]
struct FixedPoint {
    x: i64,
    y: i64,
}

/// Twice the signed area. Positive for triangles wound clockwise on screen (y down).
#[inline]
pub fn signed_area(p: [Vec2; 3]) -> f32 {
    (p[1].x - p[0].x) * (p[2].y - p[0].y) - (p[1].y - p[0].y) * (p[2].x - p[0].x)
}

#[inline]
fn edge(a: FixedPoint, b: FixedPoint, px: i64, py: i64) -> i64 {
    (b.x - a.x) * (py - a.y) - (b.y - a.y) * (px - a.x)
}

#[inline]
fn is_top_left(a: FixedPoint, b: FixedPoint) -> bool {
    (a.y == b.y && b.x > a.x) || b.y < a.y
}

/// Calls `visit(x, y, w1, w2)` for every texel center inside the triangle,
/// where `w1`/`w2` are the barycentric weights of `p[1]`/`p[2]`.
/// Either winding is accepted. Returns `true` if `visit` stopped the scan.
pub fn scan_triangle<F>(p: [Vec2; 3], width: usize, height: usize, mut visit: F) -> bool
where
    F: FnMut(usize, usize, f32, f32) -> ControlFlow<()>,
{
    if width == 0 || height == 0 {
        return false;
    }

    let mut v = p.map(|q| FixedPoint {
        x: to_fixed(q.x),
        y: to_fixed(q.y),
    });
    let mut area = edge(v[0], v[1], v[2].x, v[2].y);
    let swapped = area < 0;
    if swapped {
        v.swap(1, 2);
        area = -area;
    }
    if area == 0 {
        return false;
    }

    let min_x = v.iter().map(|q| q.x).min().unwrap_or(0);
    let max_x = v.iter().map(|q| q.x).max().unwrap_or(0);
    let min_y = v.iter().map(|q| q.y).min().unwrap_or(0);
    let max_y = v.iter().map(|q| q.y).max().unwrap_or(0);

    // Texel x covers centers at x * ONE + HALF
    let x0 = ((min_x - HALF_PIXEL + SUBPIXEL_ONE - 1) >> SUBPIXEL_BITS).max(0);
    let x1 = ((max_x - HALF_PIXEL) >> SUBPIXEL_BITS).min(width as i64 - 1);
    let y0 = ((min_y - HALF_PIXEL + SUBPIXEL_ONE - 1) >> SUBPIXEL_BITS).max(0);
    let y1 = ((max_y - HALF_PIXEL) >> SUBPIXEL_BITS).min(height as i64 - 1);
    if x0 > x1 || y0 > y1 {
        return false;
    }

    let bias = |a: FixedPoint, b: FixedPoint| if is_top_left(a, b) { 0 } else { -1 };
    let bias0 = bias(v[1], v[2]);
    let bias1 = bias(v[2], v[0]);
    let bias2 = bias(v[0], v[1]);

    let px0 = x0 * SUBPIXEL_ONE + HALF_PIXEL;
    let py0 = y0 * SUBPIXEL_ONE + HALF_PIXEL;

    // Per-texel steps
    let step_x = |a: FixedPoint, b: FixedPoint| -(b.y - a.y) * SUBPIXEL_ONE;
    let step_y = |a: FixedPoint, b: FixedPoint| (b.x - a.x) * SUBPIXEL_ONE;
    let (dx0, dy0) = (step_x(v[1], v[2]), step_y(v[1], v[2]));
    let (dx1, dy1) = (step_x(v[2], v[0]), step_y(v[2], v[0]));
    let (dx2, dy2) = (step_x(v[0], v[1]), step_y(v[0], v[1]));

    let mut row0 = edge(v[1], v[2], px0, py0);
    let mut row1 = edge(v[2], v[0], px0, py0);
    let mut row2 = edge(v[0], v[1], px0, py0);
    let inv_area = 1.0 / area as f32;

    for y in y0..=y1 {
        let (mut e0, mut e1, mut e2) = (row0, row1, row2);
        for x in x0..=x1 {
            if e0 + bias0 >= 0 && e1 + bias1 >= 0 && e2 + bias2 >= 0 {
                let b1 = e1 as f32 * inv_area;
                let b2 = e2 as f32 * inv_area;
                let (w1, w2) = if swapped { (b2, b1) } else { (b1, b2) };
                if visit(x as usize, y as usize, w1, w2).is_break() {
                    return true;
                }
            }
            e0 += dx0;
            e1 += dx1;
            e2 += dx2;
        }
        row0 += dy0;
        row1 += dy1;
        row2 += dy2;
    }
    false
}
