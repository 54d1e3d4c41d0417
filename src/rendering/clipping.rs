/// Near-plane clipping in screen-space clip coordinates.
///
/// With the screen-space matrix, clip z is negative exactly for points closer
/// than the near plane, so the kept half-space is `z >= 0`.
use glam::Vec4;

/// Intersect edge AB with the plane z = 0.
#[inline]
pub fn intersect_near(a: Vec4, b: Vec4) -> Vec4 {
    let t = a.z / (a.z - b.z);
    a + (b - a) * t
}

/// Sutherland-Hodgman against z >= 0.
/// Returns (triangle_count, triangles). triangle_count is 0, 1, or 2.
pub fn clip_triangle_near(tri: [Vec4; 3]) -> (usize, [[Vec4; 3]; 2]) {
    let mut output = [tri[0]; 4];
    let mut out_len = 0usize;

    let mut prev = tri[2];
    let mut prev_inside = prev.z >= 0.0;

    for &curr in tri.iter() {
        let curr_inside = curr.z >= 0.0;

        match (prev_inside, curr_inside) {
            (true, true) => {
                output[out_len] = curr;
                out_len += 1;
            }
            (true, false) => {
                output[out_len] = intersect_near(prev, curr);
                out_len += 1;
            }
            (false, true) => {
                output[out_len] = intersect_near(prev, curr);
                out_len += 1;
                output[out_len] = curr;
                out_len += 1;
            }
            (false, false) => {}
        }

        prev = curr;
        prev_inside = curr_inside;
    }

    let mut tris = [[tri[0]; 3]; 2];
    match out_len {
        3 => {
            tris[0] = [output[0], output[1], output[2]];
            (1, tris)
        }
        4 => {
            tris[0] = [output[0], output[1], output[2]];
            tris[1] = [output[0], output[2], output[3]];
            (2, tris)
        }
        _ => (0, tris),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_in_front_is_unchanged() {
        let tri = [
            Vec4::new(0.0, 0.0, 1.0, 1.0),
            Vec4::new(1.0, 0.0, 2.0, 1.0),
            Vec4::new(0.0, 1.0, 3.0, 1.0),
        ];
        let (count, out) = clip_triangle_near(tri);
        assert_eq!(count, 1);
        assert_eq!(out[0], tri);
    }

    #[test]
    fn fully_behind_near_is_dropped() {
        let tri = [Vec4::new(0.0, 0.0, -1.0, 1.0); 3];
        assert_eq!(clip_triangle_near(tri).0, 0);
    }

    #[test]
    fn one_vertex_behind_yields_two_triangles_on_plane() {
        let tri = [
            Vec4::new(0.0, 0.0, -1.0, 0.5),
            Vec4::new(1.0, 0.0, 1.0, 1.0),
            Vec4::new(0.0, 1.0, 1.0, 1.0),
        ];
        let (count, out) = clip_triangle_near(tri);
        assert_eq!(count, 2, "quad after clipping splits into two triangles");
        for t in &out[..count] {
            for v in t {
                assert!(v.z >= -1e-6, "clipped vertex {v:?} must be on or past the near plane");
            }
        }
    }
}
