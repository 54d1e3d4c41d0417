/// Software depth rasterization for occlusion culling
pub mod clipping;
pub mod depth_buffer;
pub mod fixed_point;
pub mod rasterizer;
pub mod reprojection;
pub mod zbuffer_culler;

pub use depth_buffer::{DepthBuffer, CLEAR_DEPTH};
pub use rasterizer::{CullRasterizer, OccluderClass, RasterStats, MAX_TRIANGLES_PER_MESH};
pub use reprojection::{
    bands, Band, HardwareDepthFrame, HardwareDepthSource, ReprojectScratch, ReprojectionFrame,
    ReprojectionParams,
};
pub use zbuffer_culler::{ScreenSpaceZBufferCuller, ZBufferStats, FAR_DEPTH};
