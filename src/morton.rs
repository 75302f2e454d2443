use crate::cell::Cell;
use crate::config;
use nalgebra::Vector3;
use rayon::prelude::*;
use tracing::info_span;

/// Bits of spatial resolution per axis; three interleaved axes fill 30 of 32 bits.
pub const MORTON_BITS: u32 = 10;
const CODE_CLAMP_MAX: f64 = 0.999_999;

/// Computes one 32-bit spatial key per tree-order slot.
///
/// `out[slot]` receives the key of particle `tree_order[slot]`. Keys are
/// derived from the fractional position inside the ghost-extended cell:
/// periodic axes wrap the raw fraction, non-periodic axes rescale it so the
/// ghost margin on either side still lands in [0, 1). In 2d the z bits are
/// zero.
pub fn assign_codes(
    out: &mut [u32],
    positions: &[Vector3<f64>],
    tree_order: &[u32],
    cell: &Cell,
    ghost_layer: f64,
) {
    let _span = info_span!("morton_codes", n = tree_order.len()).entered();
    debug_assert!(out.len() >= tree_order.len());

    let widths = cell.perpendicular_widths();
    // Fractional-space ghost margin per axis; zero where the axis is periodic
    // (ghosts there come in through image vectors, not the margin).
    let mut gfrac = Vector3::zeros();
    for axis in 0..3 {
        if !cell.periodic(axis) && (axis < 2 || cell.ndim() == 3) {
            gfrac[axis] = ghost_layer / widths[axis];
        }
    }

    let min_len = config::chunk_min_len(tree_order.len());
    out[..tree_order.len()]
        .par_iter_mut()
        .zip(tree_order.par_iter())
        .with_min_len(min_len)
        .for_each(|(code, &pid)| {
            let frac = cell.to_fractional(&positions[pid as usize]);
            let mut f = Vector3::zeros();
            for axis in 0..3 {
                f[axis] = if cell.periodic(axis) {
                    frac[axis] - frac[axis].floor()
                } else {
                    (frac[axis] + gfrac[axis]) / (1.0 + 2.0 * gfrac[axis])
                };
            }
            if cell.ndim() == 2 {
                f.z = 0.0;
            }
            *code = code_from_fraction(&f);
        });
}

fn code_from_fraction(f: &Vector3<f64>) -> u32 {
    let scale = (1u32 << MORTON_BITS) as f64;
    let x = (f.x.clamp(0.0, CODE_CLAMP_MAX) * scale) as u32;
    let y = (f.y.clamp(0.0, CODE_CLAMP_MAX) * scale) as u32;
    let z = (f.z.clamp(0.0, CODE_CLAMP_MAX) * scale) as u32;
    interleave_10(x) | (interleave_10(y) << 1) | (interleave_10(z) << 2)
}

fn interleave_10(mut x: u32) -> u32 {
    x &= 0x0000_03ff;
    x = (x ^ (x << 16)) & 0xff00_00ff;
    x = (x ^ (x << 8)) & 0x0300_f00f;
    x = (x ^ (x << 4)) & 0x030c_30c3;
    x = (x ^ (x << 2)) & 0x0924_9249;
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    #[test]
    fn test_interleave_10() {
        assert_eq!(interleave_10(0), 0);
        assert_eq!(interleave_10(0b1), 0b1);
        assert_eq!(interleave_10(0b11), 0b1001);
        assert_eq!(interleave_10(0x3ff), 0x0924_9249);
        // Bits above the tenth are discarded
        assert_eq!(interleave_10(0x400), 0);
    }

    #[test]
    fn test_code_ordering_along_axes() {
        let lo = code_from_fraction(&Vector3::new(0.1, 0.1, 0.1));
        let mid = code_from_fraction(&Vector3::new(0.1, 0.1, 0.11));
        let hi = code_from_fraction(&Vector3::new(0.9, 0.9, 0.9));
        assert!(lo < mid);
        assert!(mid < hi);

        // Out-of-range fractions clamp rather than wrap
        let clamped = code_from_fraction(&Vector3::new(1.1, -0.1, 0.5));
        assert!(clamped > 0);
    }

    #[test]
    fn test_assign_codes_periodic_wrap() {
        let cell = Cell::new(
            Matrix3::identity() * 10.0,
            Vector3::new(true, true, true),
            3,
        )
        .unwrap();
        let positions = vec![
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(11.0, 1.0, 1.0), // same wrapped position
        ];
        let tree_order = vec![0u32, 1];
        let mut codes = vec![0u32; 2];
        assign_codes(&mut codes, &positions, &tree_order, &cell, 0.0);
        assert_eq!(codes[0], codes[1]);
    }

    #[test]
    fn test_assign_codes_ghost_margin() {
        let cell = Cell::new(
            Matrix3::identity() * 10.0,
            Vector3::new(false, false, false),
            3,
        )
        .unwrap();
        // A ghost slightly outside the box must still bucket below an interior
        // particle once the margin widens the mapped extent.
        let positions = vec![Vector3::new(-0.5, 5.0, 5.0), Vector3::new(0.5, 5.0, 5.0)];
        let tree_order = vec![0u32, 1];
        let mut codes = vec![0u32; 2];
        assign_codes(&mut codes, &positions, &tree_order, &cell, 1.0);
        assert_ne!(codes[0], codes[1]);

        // x bits only differ, so the smaller x sorts first
        let x0 = codes[0] & 0x0924_9249;
        let x1 = codes[1] & 0x0924_9249;
        assert!(x0 < x1);
    }

    #[test]
    fn test_assign_codes_2d_zeroes_z() {
        let h = Matrix3::new(10.0, 0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 0.0, 1.0);
        let cell = Cell::new(h, Vector3::new(true, true, false), 2).unwrap();
        let positions = vec![
            Vector3::new(3.0, 4.0, 0.2),
            Vector3::new(3.0, 4.0, 0.9),
        ];
        let tree_order = vec![0u32, 1];
        let mut codes = vec![0u32; 2];
        assign_codes(&mut codes, &positions, &tree_order, &cell, 0.0);
        assert_eq!(codes[0], codes[1]);
    }
}
