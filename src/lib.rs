//! BVH-based neighbor lists for periodic particle systems.
//!
//! Each particle type gets its own bounding-volume hierarchy, built every
//! rebuild from unsorted positions: particles are partitioned by type,
//! ordered along a Morton curve, grouped into capacity-4 leaves, linked into
//! a binary radix tree, and finished with a bottom-up box/rope pass. Queries
//! walk the trees stacklessly via ropes, once per periodic image, and emit
//! flattened per-particle neighbor rows.
//!
//! The engine is a pure in-memory service: the caller owns the particle
//! arrays and the [`NeighborList`] storage, decides when to rebuild, and
//! reacts to the overflow signal by growing the list and re-running the
//! pipeline.

pub mod cell;
pub mod config;
pub mod forest;
mod hierarchy;
pub mod morton;
pub mod particle;
pub mod partition;
mod sync;
pub mod traverse;

pub use cell::{Cell, CellError};
pub use forest::{Capacities, Forest};
pub use particle::{Particles, FREE_BODY};
pub use partition::{TypePartition, INVALID, LEAF_CAPACITY};
pub use traverse::{brute_force_pairs, NeighborList, TraverseStatus};

use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Cell(#[from] CellError),
    #[error("cutoff matrix must have {expected} entries for {n_types} types, got {got}")]
    CutoffMatrixShape {
        n_types: usize,
        expected: usize,
        got: usize,
    },
    #[error("cutoff matrix entry ({a},{b}) = {left} does not match ({b},{a}) = {right}")]
    CutoffMatrixAsymmetric {
        a: usize,
        b: usize,
        left: f64,
        right: f64,
    },
    #[error("cutoff matrix entry ({a},{b}) = {value} is not finite")]
    CutoffNotFinite { a: usize, b: usize, value: f64 },
    #[error("buffer width must be finite and non-negative, got {0}")]
    BadBuffer(f64),
    #[error("particle array `{field}` has length {got}, expected {expected}")]
    ArrayLengthMismatch {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("particle {index} has type id {type_id}, but only {n_types} types are configured")]
    TypeOutOfRange {
        index: usize,
        type_id: u32,
        n_types: usize,
    },
    #[error(
        "cutoff + buffer = {r_list} cannot be resolved along axis {axis} of the cell (width {width})"
    )]
    CutoffExceedsCell { axis: usize, r_list: f64, width: f64 },
}

/// Search parameters: the per-type-pair cutoff matrix, the skin/buffer width
/// added on top of every cutoff, and the rigid-body exclusion toggle.
///
/// A non-positive matrix entry disables that type pair entirely.
#[derive(Debug, Clone)]
pub struct TreeParams {
    n_types: usize,
    r_cut: Vec<f64>,
    r_buff: f64,
    filter_body: bool,
    max_r_cut: f64,
}

impl TreeParams {
    /// `r_cut` is row-major `n_types * n_types` and must be symmetric.
    pub fn new(
        n_types: usize,
        r_cut: Vec<f64>,
        r_buff: f64,
        filter_body: bool,
    ) -> Result<Self, BuildError> {
        let expected = n_types * n_types;
        if r_cut.len() != expected {
            return Err(BuildError::CutoffMatrixShape {
                n_types,
                expected,
                got: r_cut.len(),
            });
        }
        if !r_buff.is_finite() || r_buff < 0.0 {
            return Err(BuildError::BadBuffer(r_buff));
        }
        for a in 0..n_types {
            for b in 0..n_types {
                let value = r_cut[a * n_types + b];
                if !value.is_finite() {
                    return Err(BuildError::CutoffNotFinite { a, b, value });
                }
                let mirrored = r_cut[b * n_types + a];
                if value != mirrored {
                    return Err(BuildError::CutoffMatrixAsymmetric {
                        a,
                        b,
                        left: value,
                        right: mirrored,
                    });
                }
            }
        }
        let max_r_cut = r_cut.iter().cloned().fold(0.0, f64::max);
        Ok(Self {
            n_types,
            r_cut,
            r_buff,
            filter_body,
            max_r_cut,
        })
    }

    pub fn n_types(&self) -> usize {
        self.n_types
    }

    pub fn r_cut(&self, a: usize, b: usize) -> f64 {
        self.r_cut[a * self.n_types + b]
    }

    pub fn r_buff(&self) -> f64 {
        self.r_buff
    }

    pub fn filter_body(&self) -> bool {
        self.filter_body
    }

    pub fn max_r_cut(&self) -> f64 {
        self.max_r_cut
    }

    /// Largest search radius anywhere: max cutoff plus the buffer.
    pub fn max_r_list(&self) -> f64 {
        self.max_r_cut + self.r_buff
    }
}

/// Build-plus-query interface over neighbor-list construction strategies.
///
/// This crate implements the tree-based strategy ([`TreeNeighborList`]);
/// cell-list or brute-force strategies can slot in behind the same surface.
pub trait PairSearch {
    /// Rebuilds the spatial index from the current positions. Always a full
    /// rebuild; stale indices are discarded wholesale.
    fn rebuild(&mut self, particles: &Particles<'_>, cell: &Cell) -> Result<(), BuildError>;

    /// Fills the caller's rows with every in-range pair. Must be called with
    /// the same particle data the index was built from.
    fn traverse(&self, particles: &Particles<'_>, out: &mut NeighborList) -> TraverseStatus;
}

/// The tree-based neighbor-list strategy: owns the per-type BVH forest and
/// its amortized buffers across rebuilds.
#[derive(Debug)]
pub struct TreeNeighborList {
    params: TreeParams,
    forest: Forest,
}

impl TreeNeighborList {
    pub fn new(params: TreeParams) -> Self {
        Self {
            params,
            forest: Forest::new(),
        }
    }

    pub fn params(&self) -> &TreeParams {
        &self.params
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }
}

impl PairSearch for TreeNeighborList {
    fn rebuild(&mut self, particles: &Particles<'_>, cell: &Cell) -> Result<(), BuildError> {
        self.forest.build(particles, &self.params, cell)
    }

    fn traverse(&self, particles: &Particles<'_>, out: &mut NeighborList) -> TraverseStatus {
        traverse::traverse(&self.forest, particles, &self.params, out)
    }
}

/// Installs a global `tracing` subscriber honoring `RUST_LOG`, falling back
/// to the given level. Safe to call more than once; later calls are no-ops.
pub fn init_logging(level: Option<&str>) {
    let fallback = level.unwrap_or("info");
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .with_thread_ids(true)
        .try_init();
}
