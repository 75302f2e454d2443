use crate::particle::Particles;
use crate::BuildError;
use rayon::prelude::*;
use tracing::info_span;

/// Particles per leaf node.
pub const LEAF_CAPACITY: usize = 4;

/// Sentinel node index; also terminates rope traversal.
pub const INVALID: u32 = u32::MAX;

/// Type-major layout of the forest: a contiguous tree-order slice per type,
/// plus the per-type leaf/node offsets everything downstream indexes with.
///
/// Rebuilt from scratch on every build; membership depends on the current
/// type assignments and cannot be cached.
#[derive(Debug, Default)]
pub struct TypePartition {
    /// `tree_order[slot]` = particle index. Slots of type `t` are
    /// `head[t]..head[t] + count[t]`, members in ascending particle order.
    pub tree_order: Vec<u32>,
    /// Particles of each type.
    pub count: Vec<usize>,
    /// First tree-order slot of each type.
    pub head: Vec<usize>,
    /// Leaves of each type: ceil(count / LEAF_CAPACITY).
    pub leaf_count: Vec<usize>,
    /// First global leaf index of each type.
    pub leaf_base: Vec<usize>,
    /// Type of each global leaf.
    pub leaf_type: Vec<u32>,
    /// Global node index of each type's root; `INVALID` for empty types.
    pub root: Vec<u32>,
    /// First internal-node ordinal of each type (0-based over all internal nodes).
    pub internal_base: Vec<usize>,
    /// Total leaves over the forest.
    pub n_leaf: usize,
    /// Total internal nodes: n_leaf minus the number of non-empty types.
    pub n_internal: usize,
}

impl TypePartition {
    pub fn n_nodes(&self) -> usize {
        self.n_leaf + self.n_internal
    }

    /// Global node index of internal node `ordinal` of type `ty`.
    pub fn internal_node(&self, ty: usize, ordinal: usize) -> u32 {
        (self.n_leaf + self.internal_base[ty] + ordinal) as u32
    }

    /// Two passes over the particle set: membership counting, then a stable
    /// compaction into the type-major tree order.
    pub fn rebuild(
        &mut self,
        particles: &Particles<'_>,
        n_types: usize,
    ) -> Result<(), BuildError> {
        let n_total = particles.n_total();
        let _span = info_span!("map_particles", n = n_total, n_types).entered();

        if let Some((index, &type_id)) = particles
            .type_ids
            .par_iter()
            .enumerate()
            .find_first(|(_, &t)| t as usize >= n_types)
        {
            return Err(BuildError::TypeOutOfRange {
                index,
                type_id,
                n_types,
            });
        }

        // Pass one: membership histogram.
        self.count = particles
            .type_ids
            .par_iter()
            .fold(
                || vec![0usize; n_types],
                |mut acc, &t| {
                    acc[t as usize] += 1;
                    acc
                },
            )
            .reduce(
                || vec![0usize; n_types],
                |mut a, b| {
                    for (x, y) in a.iter_mut().zip(b) {
                        *x += y;
                    }
                    a
                },
            );

        self.head.clear();
        self.head.resize(n_types, 0);
        let mut accum = 0;
        for t in 0..n_types {
            self.head[t] = accum;
            accum += self.count[t];
        }
        assert_eq!(accum, n_total, "type histogram does not cover all particles");

        // Pass two: stable compaction. Each slot has exactly one writer.
        self.tree_order.clear();
        self.tree_order.resize(n_total, INVALID);
        let mut fill = self.head.clone();
        for (i, &t) in particles.type_ids.iter().enumerate() {
            let slot = fill[t as usize];
            self.tree_order[slot] = i as u32;
            fill[t as usize] += 1;
        }
        for t in 0..n_types {
            assert_eq!(
                fill[t],
                self.head[t] + self.count[t],
                "type {t} slice over- or under-filled"
            );
        }

        // Leaf and internal-node offsets per type.
        self.leaf_count.clear();
        self.leaf_base.clear();
        self.internal_base.clear();
        self.root.clear();
        self.leaf_type.clear();
        let mut leaf_accum = 0;
        let mut internal_accum = 0;
        for t in 0..n_types {
            let n_leaf_t = self.count[t].div_ceil(LEAF_CAPACITY);
            self.leaf_base.push(leaf_accum);
            self.leaf_count.push(n_leaf_t);
            self.internal_base.push(internal_accum);
            leaf_accum += n_leaf_t;
            internal_accum += n_leaf_t.saturating_sub(1);
            self.leaf_type.extend(std::iter::repeat(t as u32).take(n_leaf_t));
        }
        self.n_leaf = leaf_accum;
        self.n_internal = internal_accum;
        for t in 0..n_types {
            let r = match self.leaf_count[t] {
                0 => INVALID,
                1 => self.leaf_base[t] as u32,
                _ => self.internal_node(t, 0),
            };
            self.root.push(r);
        }
        Ok(())
    }
}
