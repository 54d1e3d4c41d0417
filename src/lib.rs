/// Occlusion Culler - software depth rasterization for visibility culling
/// Occluder meshes and last frame's depth are rasterized into a small CPU
/// depth buffer that scene traversal queries before submitting draws.
pub mod camera;
pub mod config;
pub mod error;
pub mod geometry;
pub mod jobs;
pub mod occluder;
pub mod perf;
pub mod pipeline;
pub mod query;
pub mod rendering;

pub use camera::{Camera, Frustum};
pub use config::{CullConfig, RotationSafety, ZBufferConfig};
pub use error::{CullError, Result};
pub use geometry::Aabb;
pub use occluder::{LevelFileSystem, OcclusionMeshStore, StdFileSystem};
pub use perf::{CounterSnapshot, FunctionCounters, FUNCTION_COUNTERS};
pub use pipeline::{CullPipeline, CullStats, PrepareState};
pub use query::{CullNode, PassInfo, VisibilityQuery, VisibilityQueue};
pub use rendering::{CullRasterizer, HardwareDepthFrame, HardwareDepthSource, ScreenSpaceZBufferCuller};
