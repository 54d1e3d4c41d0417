/// Asynchronous occlusion cull pipeline.
///
/// A frame runs as:
/// `prepare_cullbuffer_async` (caller) → depth source job (reprojection or
/// clear) → rasterize stage → check job (started by `cull_start`, or by the
/// prepare chain if `cull_start` came early) → `cull_end`.
///
/// Between `prepare_cullbuffer_async` and the end of the check job the queue
/// carries one producer registered on behalf of the frame, so consumers can
/// tell when traversal has stopped feeding work.
mod instance_order;
mod stages;
mod state;

pub use instance_order::bubble_sort_passes;
pub use state::{CullStateMachine, EndAction, PrepareOutcome, PrepareState, StartAction};

use glam::{Mat4, Vec3};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::camera::Camera;
use crate::config::CullConfig;
use crate::error::Result;
use crate::geometry::Aabb;
use crate::jobs::{JobFence, JobSystem};
use crate::occluder::{occluder_path, LevelFileSystem, OcclusionMeshStore};
use crate::query::{PassInfo, VisibilityQuery, VisibilityQueue};
use crate::rendering::{CullRasterizer, HardwareDepthSource, ReprojectScratch};

/// Camera data captured when a frame is prepared.
#[derive(Debug, Clone, Copy)]
struct FrameParams {
    /// Standard-depth view-projection, used for frustum tests
    view_proj: Mat4,
    screen_vp: Mat4,
    view_pos: Vec3,
    near: f32,
    far: f32,
    started: Instant,
}

impl FrameParams {
    fn new(camera: &Camera, width: usize, height: usize) -> Self {
        Self {
            view_proj: camera.view_projection_matrix(),
            screen_vp: camera.screen_view_projection(width, height),
            view_pos: camera.position,
            near: camera.near,
            far: camera.far,
            started: Instant::now(),
        }
    }
}

/// Per-frame pipeline counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CullStats {
    pub draw_calls: u32,
    pub triangles: u32,
    pub triangles_clipped: u32,
    pub instances_rasterized: u32,
    pub instances_occluded: u32,
    /// Behind the camera, straddling the near plane, outside the frustum or
    /// left out by a budget
    pub instances_skipped: u32,
    pub queries_tested: u32,
    pub queries_visible: u32,
    pub nodes_rendered: u32,
    pub reprojected: bool,
    pub raster_early_out: bool,
    pub no_occluder_data: bool,
}

#[derive(Default)]
struct StatCounters {
    draw_calls: AtomicU32,
    triangles: AtomicU32,
    triangles_clipped: AtomicU32,
    instances_rasterized: AtomicU32,
    instances_occluded: AtomicU32,
    instances_skipped: AtomicU32,
    queries_tested: AtomicU32,
    queries_visible: AtomicU32,
    nodes_rendered: AtomicU32,
    reprojected: AtomicBool,
    raster_early_out: AtomicBool,
    no_occluder_data: AtomicBool,
}

impl StatCounters {
    fn counts(&self) -> [&AtomicU32; 9] {
        [
            &self.draw_calls,
            &self.triangles,
            &self.triangles_clipped,
            &self.instances_rasterized,
            &self.instances_occluded,
            &self.instances_skipped,
            &self.queries_tested,
            &self.queries_visible,
            &self.nodes_rendered,
        ]
    }

    fn reset(&self) {
        for counter in self.counts() {
            counter.store(0, Ordering::Relaxed);
        }
        for flag in [&self.reprojected, &self.raster_early_out, &self.no_occluder_data] {
            flag.store(false, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> CullStats {
        let [draw_calls, triangles, triangles_clipped, instances_rasterized, instances_occluded, instances_skipped, queries_tested, queries_visible, nodes_rendered] =
            self.counts().map(|c| c.load(Ordering::Relaxed));
        CullStats {
            draw_calls,
            triangles,
            triangles_clipped,
            instances_rasterized,
            instances_occluded,
            instances_skipped,
            queries_tested,
            queries_visible,
            nodes_rendered,
            reprojected: self.reprojected.load(Ordering::Relaxed),
            raster_early_out: self.raster_early_out.load(Ordering::Relaxed),
            no_occluder_data: self.no_occluder_data.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the caller and the job chain.
struct Shared {
    config: CullConfig,
    hardware_depth: Option<Arc<dyn HardwareDepthSource>>,
    jobs: JobSystem,
    prepare_fence: JobFence,
    check_fence: JobFence,

    state: Mutex<CullStateMachine>,
    /// Mirrors `PrepareState::CheckRequested` for the rasterize loop
    check_requested: AtomicBool,
    buffer_valid: AtomicBool,
    stage_failed: AtomicBool,

    frame: RwLock<Option<FrameParams>>,
    rasterizer: RwLock<CullRasterizer>,
    scratch: Mutex<Option<Arc<ReprojectScratch>>>,
    store: RwLock<Option<Arc<OcclusionMeshStore>>>,
    instance_order: Mutex<Vec<usize>>,
    queue: VisibilityQueue,

    counters: StatCounters,
    warned_no_data: AtomicBool,
}

impl Shared {
    /// Run `test` against the current buffer, or answer visible when there
    /// is nothing trustworthy to test against.
    fn with_buffer(&self, distance: Option<f32>, test: impl FnOnce(&CullRasterizer, &FrameParams) -> bool) -> bool {
        if !self.config.enabled || !self.buffer_valid.load(Ordering::Acquire) {
            return true;
        }
        let Some(frame) = *self.frame.read() else {
            return true;
        };
        if distance.is_some_and(|d| d < frame.near) {
            return true;
        }
        let raster = self.rasterizer.read();
        test(&raster, &frame)
    }

    fn test_aabb(&self, aabb: &Aabb, distance: f32, vertical_expand: f32) -> bool {
        self.counters.queries_tested.fetch_add(1, Ordering::Relaxed);
        let bounds = if vertical_expand != 0.0 {
            aabb.expanded_vertically(vertical_expand)
        } else {
            *aabb
        };
        let visible = self.with_buffer(Some(distance), |raster, frame| {
            raster.test_aabb(&frame.screen_vp, &bounds, frame.view_pos)
        });
        if visible {
            self.counters.queries_visible.fetch_add(1, Ordering::Relaxed);
        }
        visible
    }

    fn scratch_for(&self, width: usize, height: usize, slots: usize) -> Arc<ReprojectScratch> {
        let mut scratch = self.scratch.lock();
        match scratch.as_ref() {
            Some(existing) if existing.matches(width, height, slots) => existing.clone(),
            _ => {
                let fresh = Arc::new(ReprojectScratch::new(width, height, slots));
                *scratch = Some(fresh.clone());
                fresh
            }
        }
    }
}

pub struct CullPipeline {
    shared: Arc<Shared>,
}

impl CullPipeline {
    pub fn new(config: CullConfig, hardware_depth: Option<Arc<dyn HardwareDepthSource>>) -> Result<Self> {
        config.validate()?;
        let jobs = JobSystem::new(config.worker_threads)?;
        log::info!(
            "cull pipeline {}x{} on {} workers (reprojection {}, occluders {})",
            config.resolution_x,
            config.resolution_y,
            jobs.thread_count(),
            config.hw_reprojection && hardware_depth.is_some(),
            config.rasterize_occluders
        );

        let rasterizer = CullRasterizer::new(config.resolution_x, config.resolution_y);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                hardware_depth,
                jobs,
                prepare_fence: JobFence::new(),
                check_fence: JobFence::new(),
                state: Mutex::new(CullStateMachine::new()),
                check_requested: AtomicBool::new(false),
                buffer_valid: AtomicBool::new(false),
                stage_failed: AtomicBool::new(false),
                frame: RwLock::new(None),
                rasterizer: RwLock::new(rasterizer),
                scratch: Mutex::new(None),
                store: RwLock::new(None),
                instance_order: Mutex::new(Vec::new()),
                queue: VisibilityQueue::new(),
                counters: StatCounters::default(),
                warned_no_data: AtomicBool::new(false),
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &CullConfig {
        &self.shared.config
    }

    /// Load `folder/occluder.ocm`. On failure the store is left empty and
    /// the error is returned after being logged.
    pub fn load_level(&self, fs: &dyn LevelFileSystem, folder: &Path) -> Result<()> {
        let path = occluder_path(folder);
        match OcclusionMeshStore::load(fs, &path) {
            Ok(store) => {
                log::info!(
                    "loaded {} occluder instances ({} meshes, {} vertices) from {}",
                    store.instance_count(),
                    store.mesh_count(),
                    store.total_vertex_count(),
                    path.display()
                );
                *self.shared.store.write() = Some(Arc::new(store));
                self.shared.instance_order.lock().clear();
                self.shared.warned_no_data.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                log::error!("failed to load occluders from {}: {}", path.display(), err);
                self.unload_level();
                Err(err)
            }
        }
    }

    pub fn unload_level(&self) {
        if self.shared.store.write().take().is_some() {
            log::info!("occluder data unloaded");
        }
        let mut order = self.shared.instance_order.lock();
        order.clear();
        order.shrink_to_fit();
    }

    pub fn instance_count(&self) -> usize {
        self.shared
            .store
            .read()
            .as_ref()
            .map_or(0, |store| store.instance_count())
    }

    /// Start building the cull buffer for `camera`. Must be called from
    /// `Idle`; returns immediately.
    pub fn prepare_cullbuffer_async(&self, camera: &Camera) {
        let shared = &self.shared;
        let (width, height) = (shared.config.resolution_x, shared.config.resolution_y);
        let frame = FrameParams::new(camera, width, height);
        {
            let mut state = shared.state.lock();
            let started = state.begin_prepare();
            debug_assert!(started, "prepare_cullbuffer_async in state {:?}", state.state());
            if !started {
                log::error!("prepare_cullbuffer_async ignored in state {:?}", state.state());
                return;
            }

            let stale = shared.queue.drain();
            if stale > 0 {
                log::debug!("discarded {} stale visibility queries", stale);
            }
            shared.counters.reset();
            shared.buffer_valid.store(false, Ordering::Release);
            shared.stage_failed.store(false, Ordering::Release);
            shared.check_requested.store(false, Ordering::Release);
            *shared.frame.write() = Some(frame);
            {
                let mut raster = shared.rasterizer.write();
                raster.resize(width, height);
                raster.reset_stats();
            }
            shared.queue.add_producer();
        }
        stages::launch_prepare(shared, frame);
    }

    /// Begin draining the visibility queue. Returns false if no frame is
    /// being prepared or the check already started.
    pub fn cull_start(&self, pass: PassInfo) -> bool {
        let action = {
            let mut state = self.shared.state.lock();
            let action = state.request_check(pass);
            if action == StartAction::Deferred {
                self.shared.check_requested.store(true, Ordering::Release);
            }
            action
        };
        match action {
            StartAction::LaunchCheck(pass) => {
                stages::launch_check(&self.shared, pass);
                true
            }
            StartAction::Deferred => true,
            StartAction::Rejected(state) => {
                log::warn!("cull_start ignored in state {:?}", state);
                false
            }
        }
    }

    /// End the frame. With `wait`, blocks until every prepare and check job
    /// has finished.
    pub fn cull_end(&self, wait: bool) {
        let action = self.shared.state.lock().end_frame();
        if action == EndAction::ReleaseProducer {
            self.shared.queue.remove_producer();
            let dropped = self.shared.queue.drain();
            if dropped > 0 {
                log::debug!("frame ended without a check, dropped {} queries", dropped);
            }
        }
        if wait {
            self.shared.prepare_fence.wait();
            self.shared.check_fence.wait();
        }
    }

    /// Is `aabb` possibly visible? `distance` is the caller's camera distance
    /// to the box; `vertical_expand` grows the box along y before testing.
    pub fn test_aabb(&self, aabb: &Aabb, distance: f32, vertical_expand: f32) -> bool {
        self.shared.test_aabb(aabb, distance, vertical_expand)
    }

    /// Is the quad `center ± axis_x ± axis_y` possibly visible?
    pub fn test_quad(&self, center: Vec3, axis_x: Vec3, axis_y: Vec3) -> bool {
        self.shared.counters.queries_tested.fetch_add(1, Ordering::Relaxed);
        let visible = self.shared.with_buffer(None, |raster, frame| {
            raster.test_quad(&frame.screen_vp, center, axis_x, axis_y)
        });
        if visible {
            self.shared.counters.queries_visible.fetch_add(1, Ordering::Relaxed);
        }
        visible
    }

    pub fn push_visibility_query(&self, item: VisibilityQuery) {
        self.shared.queue.push(item);
    }

    pub fn push_quit(&self) {
        self.shared.queue.push_quit();
    }

    /// The queue, for traversal threads that register as producers.
    #[inline]
    pub fn queue(&self) -> &VisibilityQueue {
        &self.shared.queue
    }

    pub fn state(&self) -> PrepareState {
        self.shared.state.lock().state()
    }

    pub fn stats(&self) -> CullStats {
        self.shared.counters.snapshot()
    }

    /// True once this frame's buffer is complete and usable for tests.
    #[inline]
    pub fn is_buffer_valid(&self) -> bool {
        self.shared.buffer_valid.load(Ordering::Acquire)
    }

    /// Copy of the cull buffer, row-major.
    pub fn depth_snapshot(&self) -> Option<Vec<f32>> {
        if !self.is_buffer_valid() {
            return None;
        }
        Some(self.shared.rasterizer.read().depth().as_slice().to_vec())
    }

    /// 8-bit visualisation of the cull buffer.
    pub fn debug_depth_image(&self) -> Option<Vec<u8>> {
        if !self.is_buffer_valid() {
            return None;
        }
        let far = (*self.shared.frame.read())?.far;
        Some(self.shared.rasterizer.read().debug_image(far))
    }
}

impl Drop for CullPipeline {
    fn drop(&mut self) {
        let state = self.shared.state.lock().state();
        if matches!(state, PrepareState::CheckRequested | PrepareState::CheckStarted) {
            // Let a check job that is still waiting on traversal terminate
            self.shared.queue.push_quit();
        }
        self.shared.prepare_fence.wait();
        self.shared.check_fence.wait();
    }
}
