/// Persistent front-to-back ordering of occluder instances.
///
/// The order carries over between frames and is refined with a bounded
/// number of bubble-sort passes, so a slowly moving camera converges to a
/// sorted order without paying for a full sort every frame.

/// Run at most `max_passes` bubble passes over `order`, comparing `keys[i]`.
/// Stops early on a pass without swaps. Returns the passes performed.
pub fn bubble_sort_passes(order: &mut [usize], keys: &[f32], max_passes: usize) -> usize {
    let mut passes = 0;
    while passes < max_passes {
        passes += 1;
        let mut swapped = false;
        for i in 1..order.len() {
            if keys[order[i - 1]] > keys[order[i]] {
                order.swap(i - 1, i);
                swapped = true;
            }
        }
        if !swapped {
            break;
        }
    }
    passes
}

/// Reset `order` to the identity when the instance count changed.
pub fn ensure_len(order: &mut Vec<usize>, len: usize) {
    if order.len() != len {
        order.clear();
        order.extend(0..len);
    }
}
