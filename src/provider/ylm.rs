//! Real spherical harmonics without the Condon-Shortley phase, normalized so that
//! `Y_00 = 1` and `∫ Y_lm² dΩ = 4π`

use crate::degree::n_coeffs;

/// Evaluates every `Y_lm` up to `lmax` at the unit vector `(x, y, z)` into `out`
///
/// The associated Legendre functions are computed divided by `sin^m(θ)`, and the azimuthal part
/// is taken from `(x + iy)^m`, so the result is polynomial in the coordinates and regular at the
/// poles.
pub fn ylm_row(lmax: usize, x: f64, y: f64, z: f64, out: &mut [f64]) {
    assert_eq!(out.len(), n_coeffs(lmax), "output length must be (lmax + 1)^2");

    // Re and Im of (x + iy)^m
    let mut re = 1.0;
    let mut im = 0.0;
    // (2m - 1)!!
    let mut double_factorial = 1.0;
    for m in 0..=lmax {
        if m > 0 {
            (re, im) = (re * x - im * y, re * y + im * x);
            double_factorial *= (2 * m - 1) as f64;
        }

        // P_l^m(z) / sin^m for l = m, m + 1, ...
        let mut q_prev2 = 0.0;
        let mut q_prev = double_factorial;
        for l in m..=lmax {
            let q = match l - m {
                0 => q_prev,
                1 => z * (2 * m + 1) as f64 * q_prev,
                _ => {
                    ((2 * l - 1) as f64 * z * q_prev - (l + m - 1) as f64 * q_prev2)
                        / (l - m) as f64
                }
            };
            if l > m {
                q_prev2 = q_prev;
                q_prev = q;
            }

            let norm = normalization(l, m);
            let center = l * l + l;
            if m == 0 {
                out[center] = norm * q;
            } else {
                out[center + m] = norm * q * re;
                out[center - m] = norm * q * im;
            }
        }
    }
}

/// `sqrt((2l + 1) (l - m)! / (l + m)!)`, times `sqrt(2)` for `m != 0`
fn normalization(l: usize, m: usize) -> f64 {
    let ratio = ((l - m + 1)..=(l + m)).fold(1.0, |acc, k| acc / k as f64);
    let norm = f64::sqrt((2 * l + 1) as f64 * ratio);
    if m == 0 {
        norm
    } else {
        norm * std::f64::consts::SQRT_2
    }
}
