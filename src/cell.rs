use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CellError {
    #[error("cell matrix is not invertible")]
    NotInvertible,
    #[error("spatial dimensionality must be 2 or 3, got {0}")]
    BadDimension(usize),
    #[error("a 2d cell cannot be periodic along z")]
    PeriodicZIn2d,
}

/// Triclinic simulation cell with per-axis periodicity.
///
/// Columns of `h` are the lattice vectors, so `cart = h * frac`.
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    h: Matrix3<f64>,
    h_inv: Matrix3<f64>,
    pbc: Vector3<bool>,
    ndim: usize,
}

impl Cell {
    pub fn new(h: Matrix3<f64>, pbc: Vector3<bool>, ndim: usize) -> Result<Self, CellError> {
        if ndim != 2 && ndim != 3 {
            return Err(CellError::BadDimension(ndim));
        }
        if ndim == 2 && pbc.z {
            return Err(CellError::PeriodicZIn2d);
        }
        let h_inv = h.try_inverse().ok_or(CellError::NotInvertible)?;
        Ok(Self { h, h_inv, pbc, ndim })
    }

    pub fn to_fractional(&self, cart: &Vector3<f64>) -> Vector3<f64> {
        self.h_inv * cart
    }

    pub fn to_cartesian(&self, frac: &Vector3<f64>) -> Vector3<f64> {
        self.h * frac
    }

    pub fn h(&self) -> &Matrix3<f64> {
        &self.h
    }

    pub fn h_inv(&self) -> &Matrix3<f64> {
        &self.h_inv
    }

    pub fn pbc(&self) -> &Vector3<bool> {
        &self.pbc
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn periodic(&self, axis: usize) -> bool {
        self.pbc[axis]
    }

    pub fn lattice_vector(&self, axis: usize) -> Vector3<f64> {
        self.h.column(axis).into_owned()
    }

    /// Returns the perpendicular widths of the cell (distances between parallel faces).
    /// d_i = 1 / |h_inv.row(i)|
    pub fn perpendicular_widths(&self) -> Vector3<f64> {
        Vector3::new(
            1.0 / self.h_inv.row(0).norm(),
            1.0 / self.h_inv.row(1).norm(),
            1.0 / self.h_inv.row(2).norm(),
        )
    }

    /// Minimum-image shift (in lattice counts) and displacement from `r_i` to
    /// `r_j`. Callers use this for their displacement/skin checks against the
    /// traversal's position snapshot; the engine itself works with explicit
    /// image vectors instead.
    pub fn get_shift_and_displacement(
        &self,
        r_i: &Vector3<f64>,
        r_j: &Vector3<f64>,
    ) -> (Vector3<i32>, Vector3<f64>) {
        let d_frac = self.to_fractional(&(r_j - r_i));
        let shift_frac = Vector3::new(
            if self.pbc.x { -d_frac.x.round() } else { 0.0 },
            if self.pbc.y { -d_frac.y.round() } else { 0.0 },
            if self.pbc.z { -d_frac.z.round() } else { 0.0 },
        );
        let shift = Vector3::new(
            shift_frac.x as i32,
            shift_frac.y as i32,
            shift_frac.z as i32,
        );
        let r_j_img = r_j + self.h * shift_frac;
        let disp = r_j_img - r_i;
        (shift, disp)
    }

    /// Lattice translations needed to find neighbors across periodic faces.
    ///
    /// The list has 3^n_periodic entries and the zero vector always comes first,
    /// so traversal tests the home image before any translated one.
    pub fn image_vectors(&self) -> Vec<Vector3<f64>> {
        let n_periodic = self.pbc.x as u32 + self.pbc.y as u32 + self.pbc.z as u32;
        let n_images = 3usize.pow(n_periodic);

        let mut images = Vec::with_capacity(n_images);
        images.push(Vector3::zeros());

        let a = self.lattice_vector(0);
        let b = self.lattice_vector(1);
        let c = self.lattice_vector(2);
        for i in -1i32..=1 {
            for j in -1i32..=1 {
                for k in -1i32..=1 {
                    if i == 0 && j == 0 && k == 0 {
                        continue;
                    }
                    if i != 0 && !self.pbc.x {
                        continue;
                    }
                    if j != 0 && !self.pbc.y {
                        continue;
                    }
                    if k != 0 && !self.pbc.z {
                        continue;
                    }
                    images.push(i as f64 * a + j as f64 * b + k as f64 * c);
                }
            }
        }
        debug_assert_eq!(images.len(), n_images);
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cubic(l: f64, pbc: Vector3<bool>) -> Cell {
        Cell::new(Matrix3::identity() * l, pbc, 3).unwrap()
    }

    #[test]
    fn test_fractional_round_trip_triclinic() {
        // Columns are the lattice vectors: a = (8,0,0), b = (1.5,9,0), c = (0,2,7.5)
        let h = Matrix3::new(8.0, 1.5, 0.0, 0.0, 9.0, 2.0, 0.0, 0.0, 7.5);
        let cell = Cell::new(h, Vector3::new(true, true, true), 3).unwrap();

        let cart = Vector3::new(3.2, -1.7, 6.4);
        let back = cell.to_cartesian(&cell.to_fractional(&cart));
        assert_relative_eq!(back.x, cart.x, epsilon = 1e-12);
        assert_relative_eq!(back.y, cart.y, epsilon = 1e-12);
        assert_relative_eq!(back.z, cart.z, epsilon = 1e-12);

        // The far corner is the sum of the three lattice vectors
        let corner = cell.to_cartesian(&Vector3::new(1.0, 1.0, 1.0));
        assert_relative_eq!(corner.x, 9.5);
        assert_relative_eq!(corner.y, 11.0);
        assert_relative_eq!(corner.z, 7.5);
    }

    #[test]
    fn test_singular_cell_rejected() {
        // Rank deficient: the third lattice vector is a + b
        let h = Matrix3::new(8.0, 1.0, 9.0, 0.0, 8.0, 8.0, 0.0, 0.0, 0.0);
        assert!(matches!(
            Cell::new(h, Vector3::new(true, true, true), 3),
            Err(CellError::NotInvertible)
        ));
    }

    #[test]
    fn test_bad_dimension() {
        let h = Matrix3::identity();
        assert!(Cell::new(h, Vector3::new(true, true, false), 4).is_err());
        assert!(Cell::new(h, Vector3::new(true, true, true), 2).is_err());
        assert!(Cell::new(h, Vector3::new(true, true, false), 2).is_ok());
    }

    #[test]
    fn test_perpendicular_widths_shear() {
        // Shearing b along x leaves the y/z face spacings alone but narrows x
        let h = Matrix3::new(10.0, 4.0, 0.0, 0.0, 10.0, 0.0, 0.0, 0.0, 10.0);
        let cell = Cell::new(h, Vector3::new(true, true, true), 3).unwrap();
        let w = cell.perpendicular_widths();
        assert_relative_eq!(w.x, 1000.0 / 11600f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(w.y, 10.0);
        assert_relative_eq!(w.z, 10.0);
    }

    #[test]
    fn test_minimum_image_respects_periodicity() {
        let cell = cubic(10.0, Vector3::new(true, false, true));

        let r_i = Vector3::new(9.0, 2.0, 0.5);
        let r_j = Vector3::new(0.5, 9.0, 9.5);
        let (shift, disp) = cell.get_shift_and_displacement(&r_i, &r_j);

        // x and z fold back through the boundary; y is left untouched
        assert_eq!(shift, Vector3::new(1, 0, -1));
        assert_relative_eq!(disp.x, 1.5);
        assert_relative_eq!(disp.y, 7.0);
        assert_relative_eq!(disp.z, -1.0);
    }

    #[test]
    fn test_image_vectors_fully_periodic() {
        let cell = cubic(10.0, Vector3::new(true, true, true));
        let images = cell.image_vectors();

        assert_eq!(images.len(), 27);
        assert_eq!(images[0], Vector3::zeros());
        assert!(images
            .iter()
            .any(|v| (v - Vector3::new(-10.0, 0.0, 0.0)).norm() < 1e-12));
        assert!(images
            .iter()
            .any(|v| (v - Vector3::new(10.0, 10.0, -10.0)).norm() < 1e-12));
    }

    #[test]
    fn test_image_vectors_mixed_pbc() {
        let cell = cubic(10.0, Vector3::new(true, false, false));
        let images = cell.image_vectors();

        assert_eq!(images.len(), 3);
        assert_eq!(images[0], Vector3::zeros());
        for v in &images {
            assert_relative_eq!(v.y, 0.0);
            assert_relative_eq!(v.z, 0.0);
        }
    }

    #[test]
    fn test_image_vectors_2d() {
        let h = Matrix3::new(10.0, 0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 0.0, 1.0);
        let cell = Cell::new(h, Vector3::new(true, true, false), 2).unwrap();
        let images = cell.image_vectors();

        assert_eq!(images.len(), 9);
        for v in &images {
            assert_relative_eq!(v.z, 0.0);
        }
    }

    #[test]
    fn test_image_vectors_none_periodic() {
        let cell = cubic(10.0, Vector3::new(false, false, false));
        let images = cell.image_vectors();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0], Vector3::zeros());
    }
}
