use crate::BuildError;
use nalgebra::Vector3;

/// Body id marking a particle that belongs to no rigid body.
pub const FREE_BODY: u32 = 0;

/// Read-only view over the caller's particle arrays.
///
/// The first `n_local` entries are locally owned particles; the remainder are
/// ghost copies supplied by the communication layer. Ghosts participate in the
/// tree and may appear as neighbors, but never act as query particles.
#[derive(Clone, Copy, Debug)]
pub struct Particles<'a> {
    /// Cartesian positions, local particles first.
    pub positions: &'a [Vector3<f64>],
    /// Interaction type of each particle.
    pub type_ids: &'a [u32],
    /// Rigid-body membership, [`FREE_BODY`] for unbound particles.
    pub bodies: &'a [u32],
    /// Particle diameters; only the maximum feeds the ghost layer width.
    pub diameters: &'a [f64],
    /// Stable global tags, untouched by the engine.
    pub tags: &'a [u32],
    /// Number of locally owned (non-ghost) particles.
    pub n_local: usize,
}

impl Particles<'_> {
    pub fn n_total(&self) -> usize {
        self.positions.len()
    }

    pub fn n_ghost(&self) -> usize {
        self.n_total() - self.n_local
    }

    pub fn max_diameter(&self) -> f64 {
        self.diameters.iter().cloned().fold(0.0, f64::max)
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        let expected = self.positions.len();
        for (field, got) in [
            ("type_ids", self.type_ids.len()),
            ("bodies", self.bodies.len()),
            ("diameters", self.diameters.len()),
            ("tags", self.tags.len()),
        ] {
            if got != expected {
                return Err(BuildError::ArrayLengthMismatch {
                    field,
                    expected,
                    got,
                });
            }
        }
        if self.n_local > expected {
            return Err(BuildError::ArrayLengthMismatch {
                field: "n_local",
                expected,
                got: self.n_local,
            });
        }
        Ok(())
    }
}
