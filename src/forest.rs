use crate::cell::Cell;
use crate::config;
use crate::hierarchy;
use crate::morton;
use crate::particle::Particles;
use crate::partition::{TypePartition, INVALID, LEAF_CAPACITY};
use crate::{BuildError, TreeParams};
use nalgebra::Vector3;
use rayon::prelude::*;
use std::sync::atomic::AtomicU32;
use tracing::info_span;

/// Snapshot of the grow-only buffer capacities, for auditing reallocation
/// behavior across rebuilds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capacities {
    pub particles: usize,
    pub types: usize,
    pub leaves: usize,
    pub nodes: usize,
    pub internal: usize,
}

/// One bounding-volume hierarchy per particle type, stored as flat arenas.
///
/// All buffers are allocated lazily on the first build and only ever grow;
/// every rebuild overwrites the active prefix wholesale. Node indices share
/// one global space: leaves come first (`0..n_leaf`, type-major), internal
/// nodes follow (`n_leaf..n_leaf + n_internal`, type-major).
#[derive(Debug, Default)]
pub struct Forest {
    pub(crate) partition: TypePartition,

    // per tree-order slot
    pub(crate) codes: Vec<u32>,
    sort_buf: Vec<(u32, u32)>,

    // per leaf
    pub(crate) leaf_first: Vec<u32>,
    pub(crate) leaf_len: Vec<u32>,
    pub(crate) codes_red: Vec<u32>,

    // per node
    pub(crate) lower: Vec<Vector3<f64>>,
    pub(crate) upper: Vec<Vector3<f64>>,
    pub(crate) rope: Vec<u32>,
    pub(crate) parent: Vec<u32>,
    /// Packed sibling link: (sibling index << 1) | (1 if this node is a left child).
    pub(crate) sibling: Vec<u32>,
    /// Left child per internal-node ordinal; the right child is the left
    /// child's sibling.
    pub(crate) left_child: Vec<u32>,
    /// Bubble-phase arrival counters, one per internal node.
    pub(crate) counters: Vec<AtomicU32>,

    // periodic images, refreshed lazily on cell change
    pub(crate) images: Vec<Vector3<f64>>,
    last_cell: Option<Cell>,

    cap_particles: usize,
    cap_types: usize,
    cap_leaves: usize,
    cap_nodes: usize,
    cap_internal: usize,
}

impl Forest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_leaf(&self) -> usize {
        self.partition.n_leaf
    }

    pub fn n_internal(&self) -> usize {
        self.partition.n_internal
    }

    pub fn n_nodes(&self) -> usize {
        self.partition.n_nodes()
    }

    pub fn partition(&self) -> &TypePartition {
        &self.partition
    }

    /// Root node of type `ty`, or `INVALID` if the type has no particles.
    pub fn root(&self, ty: usize) -> u32 {
        self.partition.root[ty]
    }

    pub fn is_leaf(&self, node: u32) -> bool {
        (node as usize) < self.partition.n_leaf
    }

    pub fn node_bounds(&self, node: u32) -> (Vector3<f64>, Vector3<f64>) {
        (self.lower[node as usize], self.upper[node as usize])
    }

    pub fn rope_of(&self, node: u32) -> u32 {
        self.rope[node as usize]
    }

    /// Children of an internal node; `None` for leaves.
    pub fn children(&self, node: u32) -> Option<(u32, u32)> {
        if self.is_leaf(node) {
            return None;
        }
        let left = self.left_child[node as usize - self.partition.n_leaf];
        let right = self.sibling[left as usize] >> 1;
        Some((left, right))
    }

    /// Particle indices held by a leaf, in tree order.
    pub fn leaf_members(&self, leaf: u32) -> &[u32] {
        let first = self.leaf_first[leaf as usize] as usize;
        let len = self.leaf_len[leaf as usize] as usize;
        &self.partition.tree_order[first..first + len]
    }

    pub fn images(&self) -> &[Vector3<f64>] {
        &self.images
    }

    pub fn capacities(&self) -> Capacities {
        Capacities {
            particles: self.cap_particles,
            types: self.cap_types,
            leaves: self.cap_leaves,
            nodes: self.cap_nodes,
            internal: self.cap_internal,
        }
    }

    /// Runs the whole build pipeline: partition, Morton codes, per-type sort,
    /// leaf merge, hierarchy generation, bottom-up box/rope pass.
    pub(crate) fn build(
        &mut self,
        particles: &Particles<'_>,
        params: &TreeParams,
        cell: &Cell,
    ) -> Result<(), BuildError> {
        let _span = info_span!(
            "forest_build",
            n_total = particles.n_total(),
            n_types = params.n_types()
        )
        .entered();

        particles.validate()?;
        validate_geometry(cell, params.max_r_list())?;

        self.reserve_particles(particles.n_total(), params.n_types());
        self.partition.rebuild(particles, params.n_types())?;
        self.reserve_nodes(self.partition.n_leaf, self.partition.n_internal);
        self.refresh_images(cell);

        let ghost_layer =
            params.max_r_list() + (particles.max_diameter() - 1.0).max(0.0);
        morton::assign_codes(
            &mut self.codes,
            particles.positions,
            &self.partition.tree_order,
            cell,
            ghost_layer,
        );
        self.sort_codes();
        self.merge_leaves(particles.positions);
        hierarchy::generate(self);
        hierarchy::bubble(self);
        Ok(())
    }

    fn reserve_particles(&mut self, n_total: usize, n_types: usize) {
        if n_total > self.cap_particles {
            self.codes.resize(n_total, 0);
            self.sort_buf.resize(n_total, (0, 0));
            self.cap_particles = n_total;
        }
        if n_types > self.cap_types {
            // A new type set reshapes every type-indexed array; the partition
            // recomputes all of them from scratch on rebuild, so nothing
            // derived from the old layout may survive this point.
            self.cap_types = n_types;
        }
    }

    fn reserve_nodes(&mut self, n_leaf: usize, n_internal: usize) {
        let n_nodes = n_leaf + n_internal;
        if n_leaf > self.cap_leaves {
            self.leaf_first.resize(n_leaf, 0);
            self.leaf_len.resize(n_leaf, 0);
            self.codes_red.resize(n_leaf, 0);
            self.cap_leaves = n_leaf;
        }
        if n_nodes > self.cap_nodes {
            self.lower.resize(n_nodes, Vector3::zeros());
            self.upper.resize(n_nodes, Vector3::zeros());
            self.rope.resize(n_nodes, INVALID);
            self.parent.resize(n_nodes, INVALID);
            self.sibling.resize(n_nodes, INVALID);
            self.cap_nodes = n_nodes;
        }
        if n_internal > self.cap_internal {
            self.left_child.resize(n_internal, INVALID);
            self.counters.resize_with(n_internal, || AtomicU32::new(0));
            self.cap_internal = n_internal;
        }
    }

    fn refresh_images(&mut self, cell: &Cell) {
        if self.last_cell.as_ref() != Some(cell) {
            self.images = cell.image_vectors();
            self.last_cell = Some(cell.clone());
        }
    }

    /// Sorts (key, particle) pairs within each type's slice independently.
    /// Slices never mix: each is sorted in place behind its own split.
    fn sort_codes(&mut self) {
        let n = self.partition.tree_order.len();
        let _span = info_span!("sort_codes", n).entered();

        let min_len = config::chunk_min_len(n);
        self.sort_buf[..n]
            .par_iter_mut()
            .zip(self.codes[..n].par_iter())
            .zip(self.partition.tree_order[..n].par_iter())
            .with_min_len(min_len)
            .for_each(|((buf, &code), &pid)| *buf = (code, pid));

        let mut slices = Vec::with_capacity(self.partition.count.len());
        let mut rest = &mut self.sort_buf[..n];
        for &count in &self.partition.count {
            let (slice, tail) = rest.split_at_mut(count);
            slices.push(slice);
            rest = tail;
        }
        slices
            .into_par_iter()
            .for_each(|slice| slice.par_sort_unstable_by_key(|&(code, _)| code));

        self.codes[..n]
            .par_iter_mut()
            .zip(self.partition.tree_order[..n].par_iter_mut())
            .zip(self.sort_buf[..n].par_iter())
            .with_min_len(min_len)
            .for_each(|((code, pid), &(bc, bp))| {
                *code = bc;
                *pid = bp;
            });
    }

    /// Groups each type's sorted particles into capacity-4 leaves with tight
    /// boxes, and writes the reduced per-leaf key array for hierarchy
    /// generation.
    fn merge_leaves(&mut self, positions: &[Vector3<f64>]) {
        let Forest {
            partition,
            codes,
            leaf_first,
            leaf_len,
            codes_red,
            lower,
            upper,
            ..
        } = self;
        let n_leaf = partition.n_leaf;
        let _span = info_span!("merge_leaves", n_leaf).entered();
        let min_len = config::chunk_min_len(n_leaf);
        let partition = &*partition;
        let codes: &[u32] = codes.as_slice();

        lower[..n_leaf]
            .par_iter_mut()
            .zip(upper[..n_leaf].par_iter_mut())
            .zip(leaf_first[..n_leaf].par_iter_mut())
            .zip(leaf_len[..n_leaf].par_iter_mut())
            .zip(codes_red[..n_leaf].par_iter_mut())
            .enumerate()
            .with_min_len(min_len)
            .for_each(|(l, ((((lo, up), first), len), red))| {
                let t = partition.leaf_type[l] as usize;
                let local = l - partition.leaf_base[t];
                let begin = partition.head[t] + LEAF_CAPACITY * local;
                let slice_end = partition.head[t] + partition.count[t];
                let end = (begin + LEAF_CAPACITY).min(slice_end);
                assert!(
                    begin < end && end <= slice_end,
                    "leaf {l} range escapes its type slice"
                );

                let mut bb_lo = positions[partition.tree_order[begin] as usize];
                let mut bb_hi = bb_lo;
                for slot in begin + 1..end {
                    let pos = positions[partition.tree_order[slot] as usize];
                    bb_lo = bb_lo.inf(&pos);
                    bb_hi = bb_hi.sup(&pos);
                }
                *lo = bb_lo;
                *up = bb_hi;
                *first = begin as u32;
                *len = (end - begin) as u32;
                *red = codes[begin];
            });
    }
}

/// Rejects cell/cutoff combinations that cannot produce a complete neighbor
/// set: on a periodic axis the search sphere must fit within half the face
/// spacing (one image layer each way), on a non-periodic axis within the full
/// extent.
fn validate_geometry(cell: &Cell, r_list: f64) -> Result<(), BuildError> {
    let widths = cell.perpendicular_widths();
    for axis in 0..3 {
        if axis == 2 && cell.ndim() == 2 {
            continue;
        }
        let width = widths[axis];
        let limit = if cell.periodic(axis) { width / 2.0 } else { width };
        if r_list > limit {
            return Err(BuildError::CutoffExceedsCell {
                axis,
                r_list,
                width,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::FREE_BODY;
    use nalgebra::Matrix3;

    struct Owned {
        positions: Vec<Vector3<f64>>,
        type_ids: Vec<u32>,
        bodies: Vec<u32>,
        diameters: Vec<f64>,
        tags: Vec<u32>,
    }

    impl Owned {
        fn new(positions: Vec<Vector3<f64>>, type_ids: Vec<u32>) -> Self {
            let n = positions.len();
            Self {
                positions,
                type_ids,
                bodies: vec![FREE_BODY; n],
                diameters: vec![1.0; n],
                tags: (0..n as u32).collect(),
            }
        }

        fn view(&self) -> Particles<'_> {
            Particles {
                positions: &self.positions,
                type_ids: &self.type_ids,
                bodies: &self.bodies,
                diameters: &self.diameters,
                tags: &self.tags,
                n_local: self.positions.len(),
            }
        }
    }

    fn cubic(l: f64) -> Cell {
        Cell::new(
            Matrix3::identity() * l,
            Vector3::new(true, true, true),
            3,
        )
        .unwrap()
    }

    fn params_one_type(r_cut: f64) -> TreeParams {
        TreeParams::new(1, vec![r_cut], 0.0, false).unwrap()
    }

    #[test]
    fn test_geometry_validation() {
        let cell = cubic(10.0);
        assert!(validate_geometry(&cell, 4.9).is_ok());
        assert!(validate_geometry(&cell, 5.1).is_err());

        let open = Cell::new(
            Matrix3::identity() * 10.0,
            Vector3::new(false, false, false),
            3,
        )
        .unwrap();
        assert!(validate_geometry(&open, 9.0).is_ok());
        assert!(validate_geometry(&open, 11.0).is_err());
    }

    #[test]
    fn test_capacities_grow_only() {
        let cell = cubic(20.0);
        let params = params_one_type(2.0);
        let mut forest = Forest::new();

        let big = Owned::new(
            (0..64)
                .map(|i| Vector3::new((i % 16) as f64 + 0.5, (i / 16) as f64 + 0.5, 1.0))
                .collect(),
            vec![0u32; 64],
        );
        forest.build(&big.view(), &params, &cell).unwrap();
        let caps_after_big = forest.capacities();
        assert_eq!(caps_after_big.particles, 64);
        assert_eq!(caps_after_big.leaves, 16);

        let small = Owned::new(
            (0..8).map(|i| Vector3::new(i as f64 + 0.5, 1.0, 1.0)).collect(),
            vec![0u32; 8],
        );
        forest.build(&small.view(), &params, &cell).unwrap();
        // Shrinking the system never shrinks the buffers
        assert_eq!(forest.capacities(), caps_after_big);
        assert_eq!(forest.n_leaf(), 2);

        let bigger = Owned::new(
            (0..100)
                .map(|i| Vector3::new((i % 10) as f64 + 0.5, (i / 10) as f64 + 0.5, 2.0))
                .collect(),
            vec![0u32; 100],
        );
        forest.build(&bigger.view(), &params, &cell).unwrap();
        assert!(forest.capacities().particles >= 100);
        assert!(forest.capacities().leaves >= 25);
    }

    #[test]
    fn test_sorted_codes_stay_inside_type_slices() {
        let cell = cubic(10.0);
        let params = TreeParams::new(2, vec![1.0, 1.0, 1.0, 1.0], 0.0, false).unwrap();
        let mut forest = Forest::new();

        let mut positions = Vec::new();
        let mut type_ids = Vec::new();
        for i in 0..20 {
            positions.push(Vector3::new(
                (i * 7 % 10) as f64 + 0.1,
                (i * 3 % 10) as f64 + 0.1,
                (i % 10) as f64 + 0.1,
            ));
            type_ids.push((i % 2) as u32);
        }
        let owned = Owned::new(positions, type_ids);
        forest.build(&owned.view(), &params, &cell).unwrap();

        let part = forest.partition();
        for t in 0..2 {
            let begin = part.head[t];
            let end = begin + part.count[t];
            // codes ascend within the slice
            for slot in begin + 1..end {
                assert!(forest.codes[slot - 1] <= forest.codes[slot]);
            }
            // and every member still has the right type
            for slot in begin..end {
                let pid = part.tree_order[slot] as usize;
                assert_eq!(owned.type_ids[pid] as usize, t);
            }
        }
    }

    #[test]
    fn test_leaf_boxes_are_tight() {
        let cell = cubic(10.0);
        let params = params_one_type(1.0);
        let mut forest = Forest::new();

        let owned = Owned::new(
            vec![
                Vector3::new(1.0, 2.0, 3.0),
                Vector3::new(1.5, 1.0, 3.5),
                Vector3::new(0.5, 2.5, 2.5),
            ],
            vec![0; 3],
        );
        forest.build(&owned.view(), &params, &cell).unwrap();

        assert_eq!(forest.n_leaf(), 1);
        assert_eq!(forest.n_internal(), 0);
        let (lo, hi) = forest.node_bounds(0);
        assert_eq!(lo, Vector3::new(0.5, 1.0, 2.5));
        assert_eq!(hi, Vector3::new(1.5, 2.5, 3.5));
        assert_eq!(forest.leaf_members(0).len(), 3);
    }

    #[test]
    fn test_image_list_refreshed_on_cell_change() {
        let params = params_one_type(1.0);
        let mut forest = Forest::new();
        let owned = Owned::new(vec![Vector3::new(1.0, 1.0, 1.0)], vec![0]);

        let cell = cubic(10.0);
        forest.build(&owned.view(), &params, &cell).unwrap();
        assert_eq!(forest.images().len(), 27);

        let slab = Cell::new(
            Matrix3::identity() * 10.0,
            Vector3::new(true, true, false),
            3,
        )
        .unwrap();
        forest.build(&owned.view(), &params, &slab).unwrap();
        assert_eq!(forest.images().len(), 9);
    }
}
