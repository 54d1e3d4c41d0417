/// Fire-and-forget jobs on a dedicated rayon pool, with counting fences
/// for quiescence and countdown gates for fan-in between job phases.
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Result;

#[derive(Clone)]
pub struct JobSystem {
    pool: Arc<rayon::ThreadPool>,
}

impl JobSystem {
    /// `threads == 0` lets rayon pick one thread per core.
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("cull-worker-{i}"))
            .build()?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `job` on the pool. `fence` counts it as outstanding until it has
    /// returned or panicked; a panic is logged and swallowed.
    pub fn spawn<F>(&self, fence: &JobFence, name: &'static str, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = fence.enter();
        self.pool.spawn(move || {
            let _guard = guard;
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                log::error!("cull job '{}' panicked", name);
            }
        });
    }
}

struct FenceState {
    pending: Mutex<usize>,
    idle: Condvar,
}

/// Counts outstanding jobs; `wait` blocks until none remain.
#[derive(Clone)]
pub struct JobFence {
    state: Arc<FenceState>,
}

impl Default for JobFence {
    fn default() -> Self {
        Self::new()
    }
}

impl JobFence {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FenceState {
                pending: Mutex::new(0),
                idle: Condvar::new(),
            }),
        }
    }

    /// Register one outstanding job, released when the guard drops.
    pub fn enter(&self) -> FenceGuard {
        *self.state.pending.lock() += 1;
        FenceGuard {
            state: self.state.clone(),
        }
    }

    #[inline]
    pub fn pending(&self) -> usize {
        *self.state.pending.lock()
    }

    pub fn wait(&self) {
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            self.state.idle.wait(&mut pending);
        }
    }
}

pub struct FenceGuard {
    state: Arc<FenceState>,
}

impl Drop for FenceGuard {
    fn drop(&mut self) {
        let mut pending = self.state.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.state.idle.notify_all();
        }
    }
}

/// Countdown shared by the jobs of one phase; exactly one caller of
/// `arrive` sees `true`, after every other participant has arrived.
#[derive(Clone)]
pub struct BandGate {
    remaining: Arc<AtomicUsize>,
}

impl BandGate {
    pub fn new(participants: usize) -> Self {
        Self {
            remaining: Arc::new(AtomicUsize::new(participants)),
        }
    }

    #[inline]
    pub fn arrive(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn fence_waits_for_all_jobs() {
        let jobs = JobSystem::new(4).unwrap();
        let fence = JobFence::new();
        let done = Arc::new(AtomicU32::new(0));
        for _ in 0..32 {
            let done = done.clone();
            jobs.spawn(&fence, "count", move || {
                std::thread::sleep(std::time::Duration::from_millis(1));
                done.fetch_add(1, Ordering::Relaxed);
            });
        }
        fence.wait();
        assert_eq!(done.load(Ordering::Relaxed), 32);
        assert_eq!(fence.pending(), 0);
    }

    #[test]
    fn panicking_job_still_releases_fence() {
        let jobs = JobSystem::new(2).unwrap();
        let fence = JobFence::new();
        jobs.spawn(&fence, "boom", || panic!("job failure"));
        fence.wait();
        assert_eq!(fence.pending(), 0);
    }

    #[test]
    fn gate_opens_for_last_arrival_only() {
        let gate = BandGate::new(3);
        assert!(!gate.arrive());
        assert!(!gate.arrive());
        assert!(gate.arrive());
    }

    #[test]
    fn follow_up_jobs_are_covered_by_fence() {
        let jobs = JobSystem::new(2).unwrap();
        let fence = JobFence::new();
        let done = Arc::new(AtomicU32::new(0));
        let (inner_jobs, inner_fence, inner_done) = (jobs.clone(), fence.clone(), done.clone());
        jobs.spawn(&fence, "outer", move || {
            inner_jobs.spawn(&inner_fence, "inner", move || {
                inner_done.fetch_add(1, Ordering::Relaxed);
            });
        });
        fence.wait();
        assert_eq!(done.load(Ordering::Relaxed), 1);
    }
}
