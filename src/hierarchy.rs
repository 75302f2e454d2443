use crate::config;
use crate::forest::Forest;
use crate::partition::INVALID;
use crate::sync::SharedSlice;
use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info_span;

/// Common-prefix length of the keys at leaves `i` and `j` of one type's
/// sorted key slice. Equal keys fall back to the leaf indices so every pair
/// still has a well-defined split; out-of-range `j` compares lower than
/// everything.
fn delta(codes: &[u32], i: i64, j: i64) -> i64 {
    if j < 0 || j >= codes.len() as i64 {
        return -1;
    }
    let ci = codes[i as usize];
    let cj = codes[j as usize];
    if ci == cj {
        32 + ((i as u32) ^ (j as u32)).leading_zeros() as i64
    } else {
        (ci ^ cj).leading_zeros() as i64
    }
}

/// A child within one type's local index space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Child {
    Leaf(usize),
    Internal(usize),
}

/// Children of internal node `i` of a binary radix tree over `codes`,
/// determined independently of every other node: direction and range from
/// neighboring-key prefix lengths, split point by binary search on the
/// longest common prefix.
fn radix_children(codes: &[u32], i: usize) -> (Child, Child) {
    let n = codes.len() as i64;
    let i = i as i64;
    debug_assert!(n >= 2 && i < n - 1);

    let d: i64 = if delta(codes, i, i + 1) > delta(codes, i, i - 1) {
        1
    } else {
        -1
    };
    let delta_min = delta(codes, i, i - d);

    // Exponential probe for the far end of this node's range...
    let mut l_max: i64 = 2;
    while delta(codes, i, i + l_max * d) > delta_min {
        l_max *= 2;
    }
    // ...then binary search it down.
    let mut l: i64 = 0;
    let mut t = l_max / 2;
    while t >= 1 {
        if delta(codes, i, i + (l + t) * d) > delta_min {
            l += t;
        }
        t /= 2;
    }
    let j = i + l * d;

    // Split position: the longest prefix shared by the whole range.
    let delta_node = delta(codes, i, j);
    let mut s: i64 = 0;
    let mut div: i64 = 2;
    loop {
        let t = (l + div - 1) / div;
        if delta(codes, i, i + (s + t) * d) > delta_node {
            s += t;
        }
        if t <= 1 {
            break;
        }
        div *= 2;
    }
    let gamma = i + s * d + d.min(0);

    let first = i.min(j);
    let last = i.max(j);
    let left = if first == gamma {
        Child::Leaf(gamma as usize)
    } else {
        Child::Internal(gamma as usize)
    };
    let right = if last == gamma + 1 {
        Child::Leaf((gamma + 1) as usize)
    } else {
        Child::Internal((gamma + 1) as usize)
    };
    (left, right)
}

/// Builds each type's binary radix tree over its reduced sorted keys.
///
/// Each internal node is produced independently; the only outputs are its
/// left-child link and the parent/sibling links of its two children, so every
/// array element has exactly one writer. Roots keep `INVALID` parent and
/// sibling links from the reset.
pub(crate) fn generate(forest: &mut Forest) {
    let Forest {
        partition,
        codes_red,
        parent,
        sibling,
        left_child,
        rope,
        ..
    } = forest;
    let n_leaf = partition.n_leaf;
    let n_nodes = partition.n_nodes();
    let n_internal = partition.n_internal;
    let _span = info_span!("gen_hierarchy", n_leaf, n_internal).entered();
    let partition = &*partition;
    let codes_red: &[u32] = codes_red.as_slice();

    parent[..n_nodes].par_iter_mut().for_each(|p| *p = INVALID);
    sibling[..n_nodes].par_iter_mut().for_each(|s| *s = INVALID);
    rope[..n_nodes].par_iter_mut().for_each(|r| *r = INVALID);
    left_child[..n_internal]
        .par_iter_mut()
        .for_each(|c| *c = INVALID);

    let parent = SharedSlice::new(&mut parent[..n_nodes]);
    let sibling = SharedSlice::new(&mut sibling[..n_nodes]);
    let left_child = SharedSlice::new(&mut left_child[..n_internal]);

    let n_types = partition.leaf_count.len();
    (0..n_types).into_par_iter().for_each(|t| {
        let n = partition.leaf_count[t];
        if n < 2 {
            return;
        }
        let base = partition.leaf_base[t];
        let codes_t = &codes_red[base..base + n];
        let to_global = |child: Child| -> u32 {
            match child {
                Child::Leaf(g) => (base + g) as u32,
                Child::Internal(g) => partition.internal_node(t, g),
            }
        };

        (0..n - 1)
            .into_par_iter()
            .with_min_len(config::chunk_min_len(n - 1))
            .for_each(|i| {
                let (left, right) = radix_children(codes_t, i);
                let node = partition.internal_node(t, i);
                let lg = to_global(left);
                let rg = to_global(right);
                assert!(
                    lg < n_nodes as u32 && rg < n_nodes as u32,
                    "radix split produced a node outside the forest"
                );
                // Single writer per element: a node has one parent, an
                // internal ordinal one generator.
                unsafe {
                    left_child.write(node as usize - n_leaf, lg);
                    parent.write(lg as usize, node);
                    parent.write(rg as usize, node);
                    sibling.write(lg as usize, (rg << 1) | 1);
                    sibling.write(rg as usize, lg << 1);
                }
            });
    });
}

/// Rope of `node`: the sibling of its first left-child ancestor (or itself),
/// `INVALID` once the walk leaves the root. Links are immutable during the
/// bubble phase, so this needs no synchronization.
fn climb_rope(parent: &[u32], sibling: &[u32], node: u32) -> u32 {
    let mut a = node;
    loop {
        if parent[a as usize] == INVALID {
            return INVALID;
        }
        let s = sibling[a as usize];
        if s & 1 == 1 {
            return s >> 1;
        }
        a = parent[a as usize];
    }
}

/// Bottom-up box union and rope assignment without level barriers.
///
/// One walker starts per leaf. At each parent an atomic arrival counter is
/// incremented: the first child to arrive stops (the sibling subtree's box is
/// not ready), the second unions the two child boxes, assigns the node's
/// rope, and keeps climbing. Each internal node is therefore finalized
/// exactly once, after both children.
pub(crate) fn bubble(forest: &mut Forest) {
    let Forest {
        partition,
        lower,
        upper,
        rope,
        parent,
        sibling,
        left_child,
        counters,
        ..
    } = forest;
    let n_leaf = partition.n_leaf;
    let n_nodes = partition.n_nodes();
    let n_internal = partition.n_internal;
    let _span = info_span!("bubble_aabbs", n_leaf, n_internal).entered();

    let counters: &[AtomicU32] = &counters[..n_internal];
    for counter in counters {
        counter.store(0, Ordering::Relaxed);
    }

    let parent: &[u32] = &parent[..n_nodes];
    let sibling: &[u32] = &sibling[..n_nodes];
    let left_child: &[u32] = &left_child[..n_internal];
    let lower = SharedSlice::new(&mut lower[..n_nodes]);
    let upper = SharedSlice::new(&mut upper[..n_nodes]);
    let rope = SharedSlice::new(&mut rope[..n_nodes]);

    (0..n_leaf)
        .into_par_iter()
        .with_min_len(config::chunk_min_len(n_leaf))
        .for_each(|leaf| {
            // Leaf ropes depend only on the static links.
            unsafe {
                rope.write(leaf, climb_rope(parent, sibling, leaf as u32));
            }

            let mut current = leaf as u32;
            loop {
                let up_node = parent[current as usize];
                if up_node == INVALID {
                    break;
                }
                let ordinal = up_node as usize - n_leaf;
                // The acquire/release pair on the counter publishes the
                // sibling subtree's box writes to the second arriver.
                if counters[ordinal].fetch_add(1, Ordering::AcqRel) == 0 {
                    break;
                }

                let lc = left_child[ordinal] as usize;
                let rc = (sibling[lc] >> 1) as usize;
                unsafe {
                    let lo = lower.read(lc).inf(lower.read(rc));
                    let hi = upper.read(lc).sup(upper.read(rc));
                    lower.write(up_node as usize, lo);
                    upper.write(up_node as usize, hi);
                    rope.write(
                        up_node as usize,
                        climb_rope(parent, sibling, up_node),
                    );
                }
                current = up_node;
            }
        });
}
