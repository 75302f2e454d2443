use crate::cell::Cell;
use crate::config;
use crate::forest::Forest;
use crate::particle::{Particles, FREE_BODY};
use crate::partition::INVALID;
use crate::sync::SharedSlice;
use crate::TreeParams;
use nalgebra::Vector3;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::info_span;

/// Caller-owned neighbor-list storage.
///
/// Per-particle rows live in one flattened index buffer addressed through
/// `heads`; the engine fills at most `capacity[i]` entries per row and
/// reports overflow instead of growing anything itself.
#[derive(Debug, Clone, Default)]
pub struct NeighborList {
    /// Flattened neighbor indices; row `i` is `indices[heads[i]..heads[i] + counts[i]]`.
    pub indices: Vec<u32>,
    /// Stored neighbors per particle (clamped to the row capacity).
    pub counts: Vec<u32>,
    /// Row offsets into `indices`.
    pub heads: Vec<usize>,
    /// Row capacities.
    pub capacity: Vec<u32>,
    /// Query positions at the last traversal, for displacement checks.
    pub last_pos: Vec<Vector3<f64>>,
}

impl NeighborList {
    /// Uniform layout: `per_particle` slots for each of `n_local` particles.
    pub fn with_capacity(n_local: usize, per_particle: u32) -> Self {
        let mut nl = Self::default();
        nl.relayout(n_local, per_particle);
        nl
    }

    /// Re-lays the rows out with a new uniform capacity, keeping buffers
    /// grow-only. Existing contents are discarded; the caller re-traverses.
    pub fn relayout(&mut self, n_local: usize, per_particle: u32) {
        let total = n_local * per_particle as usize;
        if total > self.indices.len() {
            self.indices.resize(total, INVALID);
        }
        self.counts.clear();
        self.counts.resize(n_local, 0);
        self.heads.clear();
        self.heads
            .extend((0..n_local).map(|i| i * per_particle as usize));
        self.capacity.clear();
        self.capacity.resize(n_local, per_particle);
        if n_local > self.last_pos.len() {
            self.last_pos.resize(n_local, Vector3::zeros());
        }
    }

    /// Recovery step after an overflow: grow every row to `max_neighbors`
    /// (at least doubling) and clear the stale contents.
    pub fn grow(&mut self, n_local: usize, max_neighbors: u32) {
        let current = self.capacity.iter().cloned().max().unwrap_or(0);
        let new_cap = max_neighbors.max(current * 2).max(1);
        self.relayout(n_local, new_cap);
    }

    pub fn neighbors_of(&self, i: usize) -> &[u32] {
        let head = self.heads[i];
        &self.indices[head..head + self.counts[i] as usize]
    }
}

/// Outcome of a traversal pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraverseStatus {
    /// True if any particle needed more slots than its row provides. Not an
    /// error: grow the list and re-run the full build + traversal.
    pub overflow: bool,
    /// Largest per-particle neighbor count requested anywhere.
    pub max_neighbors: u32,
}

/// Walks every type's tree for every local query particle under every
/// periodic image, appending in-range pairs to the caller's rows.
pub(crate) fn traverse(
    forest: &Forest,
    particles: &Particles<'_>,
    params: &TreeParams,
    out: &mut NeighborList,
) -> TraverseStatus {
    let n_local = particles.n_local;
    let _span = info_span!("traverse", n_local).entered();

    assert!(
        out.counts.len() >= n_local
            && out.heads.len() >= n_local
            && out.capacity.len() >= n_local
            && out.last_pos.len() >= n_local,
        "neighbor list rows cover fewer than {n_local} particles"
    );

    let part = forest.partition();
    let n_leaf = part.n_leaf;
    let n_types = params.n_types();
    let overflow = AtomicBool::new(false);
    let max_request = AtomicU32::new(0);

    let NeighborList {
        indices,
        counts,
        heads,
        capacity,
        last_pos,
    } = out;
    let indices_len = indices.len();
    let indices = SharedSlice::new(indices.as_mut_slice());
    let heads: &[usize] = heads.as_slice();
    let capacity: &[u32] = capacity.as_slice();

    let min_len = config::chunk_min_len(n_local);
    counts[..n_local]
        .par_iter_mut()
        .zip(last_pos[..n_local].par_iter_mut())
        .enumerate()
        .with_min_len(min_len)
        .for_each(|(i, (count_out, snapshot))| {
            let pos_i = particles.positions[i];
            let type_i = particles.type_ids[i] as usize;
            let body_i = particles.bodies[i];
            let head = heads[i];
            let cap = capacity[i];
            assert!(
                head + cap as usize <= indices_len,
                "row {i} exceeds the flattened neighbor buffer"
            );

            let mut n_found = 0u32;
            for t in 0..n_types {
                let root = part.root[t];
                if root == INVALID {
                    continue;
                }
                let r_cut = params.r_cut(type_i, t);
                if r_cut <= 0.0 {
                    continue;
                }
                let r_list = r_cut + params.r_buff();
                let r_list_sq = r_list * r_list;

                for (image_idx, image) in forest.images.iter().enumerate() {
                    let q = pos_i + image;
                    let home_image = image_idx == 0;

                    let mut node = root;
                    while node != INVALID {
                        let lo = &forest.lower[node as usize];
                        let hi = &forest.upper[node as usize];
                        let hit = q.x >= lo.x - r_list
                            && q.x <= hi.x + r_list
                            && q.y >= lo.y - r_list
                            && q.y <= hi.y + r_list
                            && q.z >= lo.z - r_list
                            && q.z <= hi.z + r_list;
                        if !hit {
                            node = forest.rope[node as usize];
                            continue;
                        }
                        if (node as usize) < n_leaf {
                            let first = forest.leaf_first[node as usize] as usize;
                            let len = forest.leaf_len[node as usize] as usize;
                            for slot in first..first + len {
                                let j = part.tree_order[slot] as usize;
                                if home_image && j == i {
                                    continue;
                                }
                                if params.filter_body()
                                    && body_i != FREE_BODY
                                    && body_i == particles.bodies[j]
                                {
                                    continue;
                                }
                                let dr = particles.positions[j] - q;
                                if dr.norm_squared() < r_list_sq {
                                    if n_found < cap {
                                        unsafe {
                                            indices.write(
                                                head + n_found as usize,
                                                j as u32,
                                            );
                                        }
                                    }
                                    n_found += 1;
                                }
                            }
                            node = forest.rope[node as usize];
                        } else {
                            node = forest.left_child[node as usize - n_leaf];
                        }
                    }
                }
            }

            if n_found > cap {
                overflow.store(true, Ordering::Relaxed);
            }
            max_request.fetch_max(n_found, Ordering::Relaxed);
            *count_out = n_found.min(cap);
            *snapshot = pos_i;
        });

    TraverseStatus {
        overflow: overflow.load(Ordering::Relaxed),
        max_neighbors: max_request.load(Ordering::Relaxed),
    }
}

/// O(N²) all-pairs reference with the same image, cutoff, and exclusion
/// semantics as the tree engine. Used for validation; never in production
/// paths.
pub fn brute_force_pairs(
    particles: &Particles<'_>,
    cell: &Cell,
    params: &TreeParams,
) -> Vec<(u32, u32)> {
    let images = cell.image_vectors();
    let mut pairs = Vec::new();
    for i in 0..particles.n_local {
        let pos_i = particles.positions[i];
        let type_i = particles.type_ids[i] as usize;
        let body_i = particles.bodies[i];
        for j in 0..particles.n_total() {
            let r_cut = params.r_cut(type_i, particles.type_ids[j] as usize);
            if r_cut <= 0.0 {
                continue;
            }
            let r_list = r_cut + params.r_buff();
            let r_list_sq = r_list * r_list;
            for (image_idx, image) in images.iter().enumerate() {
                if image_idx == 0 && i == j {
                    continue;
                }
                if params.filter_body()
                    && body_i != FREE_BODY
                    && body_i == particles.bodies[j]
                {
                    continue;
                }
                let dr = particles.positions[j] - (pos_i + image);
                if dr.norm_squared() < r_list_sq {
                    pairs.push((i as u32, j as u32));
                }
            }
        }
    }
    pairs
}
