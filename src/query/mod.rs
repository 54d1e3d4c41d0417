/// Visibility query queue: scene traversal pushes nodes, the check job
/// drains them until it reads `Quit`.
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::camera::Camera;
use crate::geometry::Aabb;

/// Pass-level data forwarded to every render callback of a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassInfo {
    pub frame_id: u64,
    pub pass_id: u32,
}

/// A scene node that can be culled and, if visible, rendered.
pub trait CullNode: Send + Sync {
    fn bounds(&self) -> Aabb;

    /// Called from the check job for nodes that passed the occlusion test.
    fn render(&self, render_mask: u32, distance: f32, sort_key: u32, pass: &PassInfo);
}

pub enum VisibilityQuery {
    OctreeNode {
        node: Arc<dyn CullNode>,
        render_mask: u32,
        camera: Camera,
        sort_key: u32,
    },
    /// No more items will follow this frame.
    Quit,
}

impl VisibilityQuery {
    pub fn octree_node(node: Arc<dyn CullNode>, render_mask: u32, camera: Camera, sort_key: u32) -> Self {
        VisibilityQuery::OctreeNode {
            node,
            render_mask,
            camera,
            sort_key,
        }
    }

    #[inline]
    pub fn is_quit(&self) -> bool {
        matches!(self, VisibilityQuery::Quit)
    }
}

impl std::fmt::Debug for VisibilityQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VisibilityQuery::OctreeNode {
                render_mask,
                sort_key,
                ..
            } => f
                .debug_struct("OctreeNode")
                .field("render_mask", render_mask)
                .field("sort_key", sort_key)
                .finish_non_exhaustive(),
            VisibilityQuery::Quit => f.write_str("Quit"),
        }
    }
}

/// Unbounded multi-producer queue plus a count of registered producers.
#[derive(Clone)]
pub struct VisibilityQueue {
    sender: Sender<VisibilityQuery>,
    receiver: Receiver<VisibilityQuery>,
    producers: Arc<AtomicUsize>,
}

impl Default for VisibilityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl VisibilityQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            producers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push(&self, item: VisibilityQuery) {
        // The queue owns a receiver, so send cannot fail
        let _ = self.sender.send(item);
    }

    pub fn push_quit(&self) {
        self.push(VisibilityQuery::Quit);
    }

    /// Blocks until an item is available.
    pub fn pop(&self) -> VisibilityQuery {
        self.receiver.recv().unwrap_or(VisibilityQuery::Quit)
    }

    pub fn try_pop(&self) -> Option<VisibilityQuery> {
        match self.receiver.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn add_producer(&self) {
        self.producers.fetch_add(1, Ordering::AcqRel);
    }

    /// Unregister a producer. Unbalanced removals are ignored.
    pub fn remove_producer(&self) {
        let result = self
            .producers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if result.is_err() {
            log::warn!("visibility queue producer count underflow");
        }
    }

    #[inline]
    pub fn producer_count(&self) -> usize {
        self.producers.load(Ordering::Acquire)
    }

    /// Drop everything still queued, returning how many items were discarded.
    pub fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }
}
