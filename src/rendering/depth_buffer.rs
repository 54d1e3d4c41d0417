/// Cull depth buffer: row-major `f32` texels in 128-byte aligned storage.
///
/// Depth is the undivided clip z of the screen-space matrix, linear in view
/// distance. Smaller is nearer; cleared texels hold `CLEAR_DEPTH`.
use bytemuck::{Pod, Zeroable};

pub const CLEAR_DEPTH: f32 = 9_999_999_999.0;

/// Texels per storage block (one 128-byte line).
pub const BLOCK_TEXELS: usize = 32;

#[repr(C, align(128))]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DepthBlock([f32; BLOCK_TEXELS]);

#[derive(Clone)]
pub struct DepthBuffer {
    width: usize,
    height: usize,
    blocks: Vec<DepthBlock>,
}

impl DepthBuffer {
    pub fn new(width: usize, height: usize) -> Self {
        let mut buffer = Self {
            width: 0,
            height: 0,
            blocks: Vec::new(),
        };
        buffer.resize(width, height);
        buffer
    }

    /// Reallocates only when the texel count grows; contents are cleared.
    pub fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        let needed = (width * height + BLOCK_TEXELS - 1) / BLOCK_TEXELS;
        if self.blocks.len() != needed {
            self.blocks.resize(needed, DepthBlock([CLEAR_DEPTH; BLOCK_TEXELS]));
        }
        self.clear();
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn clear(&mut self) {
        self.fill(CLEAR_DEPTH);
    }

    #[inline]
    pub fn fill(&mut self, depth: f32) {
        self.as_mut_slice().fill(depth);
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        let len = self.width * self.height;
        &bytemuck::cast_slice(&self.blocks)[..len]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        let len = self.width * self.height;
        &mut bytemuck::cast_slice_mut(&mut self.blocks)[..len]
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.as_slice()[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, depth: f32) {
        let width = self.width;
        self.as_mut_slice()[y * width + x] = depth;
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[f32] {
        &self.as_slice()[y * self.width..(y + 1) * self.width]
    }

    /// Rows `[y0, y0 + rows)` as one contiguous slice.
    #[inline]
    pub fn band_mut(&mut self, y0: usize, rows: usize) -> &mut [f32] {
        let width = self.width;
        let end = ((y0 + rows) * width).min(width * self.height);
        &mut self.as_mut_slice()[y0 * width..end]
    }

    /// Nearest depth over the whole buffer.
    pub fn min_depth(&self) -> f32 {
        self.as_slice().iter().copied().fold(f32::INFINITY, f32::min)
    }

    /// 8-bit visualisation: black near, white at `far` and beyond.
    pub fn to_grayscale(&self, far: f32) -> Vec<u8> {
        let scale = if far > 0.0 { 255.0 / far } else { 0.0 };
        self.as_slice()
            .iter()
            .map(|&d| (d.max(0.0) * scale).min(255.0) as u8)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_is_128_byte_aligned() {
        let buffer = DepthBuffer::new(128, 64);
        assert_eq!(buffer.as_slice().as_ptr() as usize % 128, 0);
        assert_eq!(buffer.as_slice().len(), 128 * 64);
        assert!(buffer.as_slice().iter().all(|&d| d == CLEAR_DEPTH));
    }

    #[test]
    fn band_covers_requested_rows() {
        let mut buffer = DepthBuffer::new(8, 4);
        buffer.band_mut(1, 2).fill(5.0);
        assert_eq!(buffer.get(0, 0), CLEAR_DEPTH);
        assert_eq!(buffer.get(7, 1), 5.0);
        assert_eq!(buffer.get(7, 2), 5.0);
        assert_eq!(buffer.get(0, 3), CLEAR_DEPTH);
    }

    #[test]
    fn grayscale_clamps_far_to_white() {
        let mut buffer = DepthBuffer::new(4, 1);
        buffer.set(0, 0, 0.0);
        buffer.set(1, 0, 50.0);
        let image = buffer.to_grayscale(100.0);
        assert_eq!(image[0], 0);
        assert_eq!(image[1], 127);
        assert_eq!(image[2], 255);
    }
}
