/// Job bodies of the prepare chain and the check job.
///
/// Every stage runs its work under `guarded` so a panic cannot break the
/// chain: the frame still reaches its completion transition, with the
/// buffer marked invalid so all tests answer visible.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::instance_order::{bubble_sort_passes, ensure_len};
use super::state::PrepareOutcome;
use super::{FrameParams, Shared};
use crate::camera::Frustum;
use crate::jobs::BandGate;
use crate::perf_scope;
use crate::query::{PassInfo, VisibilityQuery};
use crate::rendering::{
    bands, OccluderClass, ReprojectScratch, ReprojectionFrame, ReprojectionParams, MAX_TRIANGLES_PER_MESH,
};

fn guarded(shared: &Shared, stage: &'static str, work: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(work)).is_err() {
        log::error!("cull stage '{}' panicked, frame falls back to visible", stage);
        shared.stage_failed.store(true, Ordering::Release);
    }
}

pub(super) fn launch_prepare(shared: &Arc<Shared>, frame: FrameParams) {
    let job_shared = shared.clone();
    shared
        .jobs
        .spawn(&shared.prepare_fence, "cull depth source", move || depth_source(job_shared, frame));
}

pub(super) fn launch_check(shared: &Arc<Shared>, pass: PassInfo) {
    let job_shared = shared.clone();
    shared
        .jobs
        .spawn(&shared.check_fence, "cull check", move || run_check(&job_shared, pass));
}

fn depth_source(shared: Arc<Shared>, frame: FrameParams) {
    let mut reprojection = None;
    guarded(&shared, "depth download", || {
        reprojection = download_depth(&shared, &frame);
    });

    match reprojection {
        Some(reprojection) => start_reprojection(&shared, Arc::new(reprojection), frame),
        None => {
            guarded(&shared, "clear", || shared.rasterizer.write().clear());
            rasterize_and_complete(&shared, &frame);
        }
    }
}

fn download_depth(shared: &Shared, frame: &FrameParams) -> Option<ReprojectionFrame> {
    let config = &shared.config;
    if !config.enabled || !config.hw_reprojection {
        return None;
    }
    let source = shared.hardware_depth.as_ref()?;
    let (width, height) = (config.resolution_x, config.resolution_y);
    let downloaded = source.download(width, height)?;
    let params = ReprojectionParams {
        width,
        height,
        screen_vp: frame.screen_vp,
        near: frame.near,
        far: frame.far,
        nearest_max: config.nearest_max,
        bias: config.reprojection_bias,
        reverse_depth: config.reverse_depth,
    };
    ReprojectionFrame::new(downloaded, params)
}

fn start_reprojection(shared: &Arc<Shared>, reprojection: Arc<ReprojectionFrame>, frame: FrameParams) {
    let config = &shared.config;
    let slots = shared.jobs.thread_count().max(1);
    let scratch = shared.scratch_for(config.resolution_x, config.resolution_y, slots);
    scratch.reset();
    shared.counters.reprojected.store(true, Ordering::Relaxed);

    let source_bands = bands(reprojection.frame.height, config.lines_per_job);
    let gate = BandGate::new(source_bands.len());
    for band in source_bands {
        let (job_shared, scratch, reprojection, gate) =
            (shared.clone(), scratch.clone(), reprojection.clone(), gate.clone());
        shared.jobs.spawn(&shared.prepare_fence, "cull reproject", move || {
            guarded(&job_shared, "reproject", || scratch.reproject_band(&reprojection, band));
            if gate.arrive() {
                start_merge(&job_shared, scratch, reprojection, frame);
            }
        });
    }
}

fn start_merge(
    shared: &Arc<Shared>,
    scratch: Arc<ReprojectScratch>,
    reprojection: Arc<ReprojectionFrame>,
    frame: FrameParams,
) {
    let target = bands(shared.config.resolution_y, shared.config.lines_per_job);
    let gate = BandGate::new(target.len());
    for band in target {
        let (job_shared, scratch, reprojection, gate) =
            (shared.clone(), scratch.clone(), reprojection.clone(), gate.clone());
        shared.jobs.spawn(&shared.prepare_fence, "cull merge", move || {
            guarded(&job_shared, "merge", || scratch.merge_band(band));
            if gate.arrive() {
                start_resolve(&job_shared, scratch, reprojection, frame);
            }
        });
    }
}

fn start_resolve(
    shared: &Arc<Shared>,
    scratch: Arc<ReprojectScratch>,
    reprojection: Arc<ReprojectionFrame>,
    frame: FrameParams,
) {
    let target = bands(shared.config.resolution_y, shared.config.lines_per_job);
    let gate = BandGate::new(target.len());
    for band in target {
        let (job_shared, scratch, reprojection, gate) =
            (shared.clone(), scratch.clone(), reprojection.clone(), gate.clone());
        shared.jobs.spawn(&shared.prepare_fence, "cull resolve", move || {
            guarded(&job_shared, "resolve", || {
                let texels = scratch.resolve_band(&reprojection, band);
                job_shared
                    .rasterizer
                    .write()
                    .depth_mut()
                    .band_mut(band.y0, band.rows)
                    .copy_from_slice(&texels);
            });
            if gate.arrive() {
                rasterize_and_complete(&job_shared, &frame);
            }
        });
    }
}

fn rasterize_and_complete(shared: &Arc<Shared>, frame: &FrameParams) {
    guarded(shared, "rasterize", || rasterize_occluders(shared, frame));
    complete_prepare(shared);
}

fn rasterize_occluders(shared: &Shared, frame: &FrameParams) {
    perf_scope!("cull rasterize");
    let config = &shared.config;
    if !config.enabled || !config.rasterize_occluders {
        return;
    }

    let store = shared.store.read().clone();
    let Some(store) = store.filter(|store| !store.is_empty()) else {
        shared.counters.no_occluder_data.store(true, Ordering::Relaxed);
        if !shared.warned_no_data.swap(true, Ordering::Relaxed) {
            log::warn!("no occluder data loaded, culling against reprojected depth only");
        }
        return;
    };

    let instances = store.instances();
    let distances: Vec<f32> = instances
        .iter()
        .map(|instance| instance.world_bounds.distance_to_point(frame.view_pos))
        .collect();
    let mut order = shared.instance_order.lock();
    ensure_len(&mut order, instances.len());
    let passes = bubble_sort_passes(&mut order, &distances, config.sort_passes);
    log::trace!("occluder order refined in {} passes", passes);

    let frustum = Frustum::from_view_projection(&frame.view_proj);
    let time_budget = Duration::from_secs_f32(config.raster_time_budget_ms.max(0.0) / 1000.0);
    let mut remaining = match config.triangle_budget {
        0 => usize::MAX,
        budget => budget,
    };
    let (mut rasterized, mut occluded, mut skipped) = (0u32, 0u32, 0u32);

    let mut raster = shared.rasterizer.write();
    for (position, &index) in order.iter().enumerate() {
        if shared.check_requested.load(Ordering::Acquire) && frame.started.elapsed() > time_budget {
            let left = order.len() - position;
            log::warn!("occluder rasterization over budget, {} instances left out", left);
            shared.counters.raster_early_out.store(true, Ordering::Relaxed);
            skipped += left as u32;
            break;
        }

        let instance = &instances[index];
        let bounds = &instance.world_bounds;
        if !frustum.intersects_aabb(bounds.min, bounds.max) {
            skipped += 1;
            continue;
        }
        match raster.classify_occluder(&frame.screen_vp, bounds, frame.view_pos) {
            OccluderClass::Visible => {}
            OccluderClass::Occluded => {
                occluded += 1;
                continue;
            }
            OccluderClass::Behind | OccluderClass::StraddlesNear | OccluderClass::OffScreen => {
                skipped += 1;
                continue;
            }
        }

        let mesh = &store.meshes()[instance.mesh];
        let submitted = raster.rasterize_instance(
            &frame.screen_vp,
            &instance.transform,
            store.mesh_vertices(mesh),
            remaining.min(MAX_TRIANGLES_PER_MESH),
        );
        rasterized += 1;
        remaining -= submitted;
        if remaining == 0 {
            let left = order.len() - position - 1;
            log::debug!("triangle budget reached, {} instances left out", left);
            skipped += left as u32;
            break;
        }
    }

    let stats = raster.stats();
    let counters = &shared.counters;
    counters.draw_calls.store(stats.draw_calls, Ordering::Relaxed);
    counters.triangles.store(stats.triangles, Ordering::Relaxed);
    counters.triangles_clipped.store(stats.triangles_clipped, Ordering::Relaxed);
    counters.instances_rasterized.store(rasterized, Ordering::Relaxed);
    counters.instances_occluded.store(occluded, Ordering::Relaxed);
    counters.instances_skipped.store(skipped, Ordering::Relaxed);
}

fn complete_prepare(shared: &Arc<Shared>) {
    let failed = shared.stage_failed.load(Ordering::Acquire);
    shared.buffer_valid.store(!failed, Ordering::Release);

    let outcome = shared.state.lock().finish_prepare();
    match outcome {
        PrepareOutcome::LaunchCheck(pass) => launch_check(shared, pass),
        PrepareOutcome::Ready => {}
        PrepareOutcome::FrameEnded => log::trace!("frame ended before the cull buffer was ready"),
    }
}

/// Releases the frame's producer and returns to `Idle`, also on unwind.
struct CheckCompletion<'a> {
    shared: &'a Shared,
}

impl Drop for CheckCompletion<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.shared.queue.drain();
        }
        self.shared.queue.remove_producer();
        self.shared.state.lock().finish_check();
    }
}

fn run_check(shared: &Shared, pass: PassInfo) {
    perf_scope!("cull check");
    let _completion = CheckCompletion { shared };
    loop {
        match shared.queue.pop() {
            VisibilityQuery::Quit => break,
            VisibilityQuery::OctreeNode {
                node,
                render_mask,
                camera,
                sort_key,
            } => {
                let bounds = node.bounds();
                let distance = bounds.distance_to_point(camera.position);
                if shared.test_aabb(&bounds, distance, 0.0) {
                    node.render(render_mask, distance, sort_key, &pass);
                    shared.counters.nodes_rendered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}
