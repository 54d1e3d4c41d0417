/// Process-wide call counters for the culling hot paths.
/// Incremented only when the `profiling` feature is enabled.
use std::sync::atomic::{AtomicU64, Ordering};

pub struct FunctionCounters {
    // Rasterizer
    pub triangles_submitted: AtomicU64,
    pub triangles_clipped: AtomicU64,
    pub triangles_backface_culled: AtomicU64,
    pub pixels_written: AtomicU64,

    // Queries
    pub aabb_tests: AtomicU64,
    pub aabb_visible: AtomicU64,
    pub quad_tests: AtomicU64,

    // Reprojection
    pub texels_reprojected: AtomicU64,
    pub holes_filled: AtomicU64,

    // Z-buffer culler
    pub zbuffer_box_tests: AtomicU64,
    pub zbuffer_triangles: AtomicU64,
}

impl FunctionCounters {
    pub const fn new() -> Self {
        Self {
            triangles_submitted: AtomicU64::new(0),
            triangles_clipped: AtomicU64::new(0),
            triangles_backface_culled: AtomicU64::new(0),
            pixels_written: AtomicU64::new(0),
            aabb_tests: AtomicU64::new(0),
            aabb_visible: AtomicU64::new(0),
            quad_tests: AtomicU64::new(0),
            texels_reprojected: AtomicU64::new(0),
            holes_filled: AtomicU64::new(0),
            zbuffer_box_tests: AtomicU64::new(0),
            zbuffer_triangles: AtomicU64::new(0),
        }
    }

    fn all(&self) -> [&AtomicU64; 11] {
        [
            &self.triangles_submitted,
            &self.triangles_clipped,
            &self.triangles_backface_culled,
            &self.pixels_written,
            &self.aabb_tests,
            &self.aabb_visible,
            &self.quad_tests,
            &self.texels_reprojected,
            &self.holes_filled,
            &self.zbuffer_box_tests,
            &self.zbuffer_triangles,
        ]
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        for counter in self.all() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let [triangles_submitted, triangles_clipped, triangles_backface_culled, pixels_written, aabb_tests, aabb_visible, quad_tests, texels_reprojected, holes_filled, zbuffer_box_tests, zbuffer_triangles] =
            self.all().map(|c| c.load(Ordering::Relaxed));
        CounterSnapshot {
            triangles_submitted,
            triangles_clipped,
            triangles_backface_culled,
            pixels_written,
            aabb_tests,
            aabb_visible,
            quad_tests,
            texels_reprojected,
            holes_filled,
            zbuffer_box_tests,
            zbuffer_triangles,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub triangles_submitted: u64,
    pub triangles_clipped: u64,
    pub triangles_backface_culled: u64,
    pub pixels_written: u64,
    pub aabb_tests: u64,
    pub aabb_visible: u64,
    pub quad_tests: u64,
    pub texels_reprojected: u64,
    pub holes_filled: u64,
    pub zbuffer_box_tests: u64,
    pub zbuffer_triangles: u64,
}

impl CounterSnapshot {
    /// Log a formatted report at info level
    pub fn log_report(&self) {
        log::info!("=== Culling Counters ===");
        log::info!("  triangles submitted:   {:12}", self.triangles_submitted);
        log::info!("  triangles clipped:     {:12}", self.triangles_clipped);
        log::info!("  backfaces culled:      {:12}", self.triangles_backface_culled);
        log::info!("  pixels written:        {:12}", self.pixels_written);
        log::info!("  aabb tests:            {:12}", self.aabb_tests);
        if self.aabb_tests > 0 {
            let rate = self.aabb_visible as f64 / self.aabb_tests as f64 * 100.0;
            log::info!("  aabb visible rate:     {:11.2}%", rate);
        }
        log::info!("  quad tests:            {:12}", self.quad_tests);
        log::info!("  texels reprojected:    {:12}", self.texels_reprojected);
        log::info!("  holes filled:          {:12}", self.holes_filled);
        log::info!("  z-buffer box tests:    {:12}", self.zbuffer_box_tests);
        log::info!("  z-buffer triangles:    {:12}", self.zbuffer_triangles);
    }
}

/// Global function counters instance
pub static FUNCTION_COUNTERS: FunctionCounters = FunctionCounters::new();

/// Macro for incrementing a counter (only when profiling feature is enabled)
#[macro_export]
macro_rules! count_call {
    ($counter:expr) => {
        #[cfg(feature = "profiling")]
        {
            $counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    };
}

/// Macro for adding to a counter (only when profiling feature is enabled)
#[macro_export]
macro_rules! count_add {
    ($counter:expr, $value:expr) => {
        #[cfg(feature = "profiling")]
        {
            $counter.fetch_add($value as u64, std::sync::atomic::Ordering::Relaxed);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_snapshot() {
        let counters = FunctionCounters::new();
        counters.aabb_tests.fetch_add(3, Ordering::Relaxed);
        assert_eq!(counters.snapshot().aabb_tests, 3);
        counters.reset();
        assert_eq!(counters.snapshot().aabb_tests, 0);
    }
}
