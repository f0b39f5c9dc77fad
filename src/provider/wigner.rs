//! Rotation of spherical harmonic coefficient rows
//!
//! Matrices act on row vectors from the right, `M' = M · D`, where `D(Q)` transforms the
//! coefficients of a map `f` into the coefficients of the rotated map `f'(p) = f(Qᵀ p)`.
//! Rotation about the polar axis `Dz(θ)` is applied in closed form. A general frame rotation
//! `Q(inc, obl) = Rz(obl) · Rx(-inc)` is decomposed as
//!
//! ```text
//! D(Q) = Dz(obl) · D(P) · Dz(-inc) · D(P)ᵀ
//! ```
//!
//! where `P` is the cyclic permutation of the axes taking `z` to `x`, so that rotations about
//! `x` become rotations about `z`. `D(P)` is block-diagonal in `l` and is found once by exact
//! sphere quadrature.

use crate::basis::degree_of_width;
use crate::degree::n_coeffs;
use crate::error::ConfigError;
use crate::provider::quadrature::SphereGrid;
use crate::provider::ylm::ylm_row;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis, Zip, s};
use std::f64::consts::PI;

/// Width of a coefficient row, checked to be `(l + 1)²` with `l <= lmax`
pub fn row_degree(what: &'static str, width: usize, lmax: usize) -> Result<usize, ConfigError> {
    match degree_of_width(width) {
        Some(l) if l <= lmax => Ok(l),
        _ => Err(ConfigError::NotHarmonicWidth {
            what,
            actual: width,
        }),
    }
}

/// Applies `Dz(θ)` to a single row in place
pub fn dz_row(mut row: ArrayViewMut1<f64>, theta: f64) {
    let lmax = degree_of_width(row.len()).unwrap_or(0);
    for m in 1..=lmax {
        let (s, c) = (m as f64 * theta).sin_cos();
        for l in m..=lmax {
            let pos = l * l + l + m;
            let neg = l * l + l - m;
            let (vp, vn) = (row[pos], row[neg]);
            row[pos] = vp * c + vn * s;
            row[neg] = -vp * s + vn * c;
        }
    }
}

/// Derivative of `row · Dz(θ)` with respect to `θ`
pub fn dz_row_derivative(row: ArrayView1<f64>, theta: f64) -> Array1<f64> {
    let lmax = degree_of_width(row.len()).unwrap_or(0);
    let mut out = Array1::zeros(row.len());
    for m in 1..=lmax {
        let (s, c) = (m as f64 * theta).sin_cos();
        let mf = m as f64;
        for l in m..=lmax {
            let pos = l * l + l + m;
            let neg = l * l + l - m;
            let (vp, vn) = (row[pos], row[neg]);
            out[pos] = mf * (-vp * s + vn * c);
            out[neg] = mf * (-vp * c - vn * s);
        }
    }
    out
}

/// `Dz(θ)ᵀ = Dz(-θ)` applied to a row in place, the pullback of [dz_row]
#[inline]
pub fn dz_row_transpose(row: ArrayViewMut1<f64>, theta: f64) {
    dz_row(row, -theta)
}

/// Applies `Dz(θ)` to every row
pub fn dz_rows(m: &mut Array2<f64>, theta: f64) {
    for row in m.rows_mut() {
        dz_row(row, theta);
    }
}

/// `Σ G ∘ ∂(M · Dz(θ))/∂θ`
pub fn dz_angle_vjp(m: ArrayView2<f64>, theta: f64, output_gradient: ArrayView2<f64>) -> f64 {
    Zip::from(m.rows())
        .and(output_gradient.rows())
        .fold(0.0, |acc, row, g| acc + dz_row_derivative(row, theta).dot(&g))
}

/// Blocks of `D(P)` for `l = 0..=lmax`
#[derive(Clone, Debug)]
pub struct AxisPermutation {
    blocks: Vec<Array2<f64>>,
}

impl AxisPermutation {
    pub fn new(lmax: usize) -> Self {
        let n = n_coeffs(lmax);
        let mut blocks: Vec<Array2<f64>> = (0..=lmax)
            .map(|l| Array2::zeros((2 * l + 1, 2 * l + 1)))
            .collect();
        let grid = SphereGrid::new(lmax);
        let mut y_p = vec![0.0; n];
        let mut y_pt = vec![0.0; n];
        for (&[x, y, z], w) in grid.iter() {
            ylm_row(lmax, x, y, z, &mut y_p);
            // Pᵀ (x, y, z) = (y, z, x)
            ylm_row(lmax, y, z, x, &mut y_pt);
            let w = w / (4.0 * PI);
            for (l, block) in blocks.iter_mut().enumerate() {
                let offset = l * l;
                for a in 0..(2 * l + 1) {
                    let ya = w * y_p[offset + a];
                    for b in 0..(2 * l + 1) {
                        block[(a, b)] += ya * y_pt[offset + b];
                    }
                }
            }
        }
        Self { blocks }
    }

    pub fn lmax(&self) -> usize {
        self.blocks.len() - 1
    }

    /// `row · D(P)`, or `row · D(P)ᵀ` if `transpose`
    pub fn apply_row(&self, mut row: ArrayViewMut1<f64>, transpose: bool) {
        let lmax = degree_of_width(row.len()).unwrap_or(0);
        for (l, block) in self.blocks.iter().enumerate().take(lmax + 1) {
            let (start, end) = (l * l, (l + 1) * (l + 1));
            let segment = row.slice(s![start..end]).to_owned();
            let rotated = if transpose {
                block.dot(&segment)
            } else {
                segment.dot(block)
            };
            row.slice_mut(s![start..end]).assign(&rotated);
        }
    }

    pub fn apply_rows(&self, m: &mut Array2<f64>, transpose: bool) {
        for row in m.rows_mut() {
            self.apply_row(row, transpose);
        }
    }
}

/// One factor of a frame rotation chain
#[derive(Clone, Copy, Debug)]
enum Factor {
    Dz(f64),
    P { transpose: bool },
}

/// Result of a frame rotation together with its vector-Jacobian product
pub struct FrameRotation {
    pub value: Array2<f64>,
    pub vjp: Option<(Array2<f64>, f64, f64)>,
}

/// Rotation between the frame of the stellar rotation axis and the observer frame
#[derive(Clone, Debug)]
pub struct FrameRotator {
    permutation: AxisPermutation,
}

impl FrameRotator {
    pub fn new(lmax: usize) -> Self {
        Self {
            permutation: AxisPermutation::new(lmax),
        }
    }

    pub fn lmax(&self) -> usize {
        self.permutation.lmax()
    }

    /// `M · D(Q)ᵀ = M · D(P) · Dz(inc) · D(P)ᵀ · Dz(-obl)`
    pub fn rotate(
        &self,
        m: ArrayView2<f64>,
        inc: f64,
        obl: f64,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> FrameRotation {
        // `inc` is the second factor and `obl` the fourth
        let chain = [
            Factor::P { transpose: false },
            Factor::Dz(inc),
            Factor::P { transpose: true },
            Factor::Dz(-obl),
        ];
        let (value, vjp) = self.apply_chain(m, &chain, output_gradient);
        FrameRotation {
            value,
            vjp: vjp.map(|(bm, angles)| (bm, angles[1], -angles[3])),
        }
    }

    /// `M · D(Q) = M · Dz(obl) · D(P) · Dz(-inc) · D(P)ᵀ`
    pub fn rotate_transpose(
        &self,
        m: ArrayView2<f64>,
        inc: f64,
        obl: f64,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> FrameRotation {
        let chain = [
            Factor::Dz(obl),
            Factor::P { transpose: false },
            Factor::Dz(-inc),
            Factor::P { transpose: true },
        ];
        let (value, vjp) = self.apply_chain(m, &chain, output_gradient);
        FrameRotation {
            value,
            vjp: vjp.map(|(bm, angles)| (bm, -angles[2], angles[0])),
        }
    }

    fn apply_factor(&self, m: &mut Array2<f64>, factor: Factor) {
        match factor {
            Factor::Dz(theta) => dz_rows(m, theta),
            Factor::P { transpose } => self.permutation.apply_rows(m, transpose),
        }
    }

    /// Pullback of a factor: the output gradient is multiplied by the factor's transpose
    fn pullback_factor(&self, g: &mut Array2<f64>, factor: Factor) {
        match factor {
            Factor::Dz(theta) => dz_rows(g, -theta),
            Factor::P { transpose } => self.permutation.apply_rows(g, !transpose),
        }
    }

    /// Applies the factors left to right, returning gradients with respect to the input and to
    /// every `Dz` angle as it enters its factor
    #[allow(clippy::type_complexity)]
    fn apply_chain(
        &self,
        m: ArrayView2<f64>,
        chain: &[Factor; 4],
        output_gradient: Option<ArrayView2<f64>>,
    ) -> (Array2<f64>, Option<(Array2<f64>, [f64; 4])>) {
        let mut stages = Vec::with_capacity(chain.len() + 1);
        let mut current = m.to_owned();
        for &factor in chain {
            if output_gradient.is_some() {
                stages.push(current.clone());
            }
            self.apply_factor(&mut current, factor);
        }
        let Some(output_gradient) = output_gradient else {
            return (current, None);
        };

        let mut g = output_gradient.to_owned();
        let mut angles = [0.0; 4];
        for (i, (&factor, stage)) in chain.iter().zip(stages.iter()).enumerate().rev() {
            if let Factor::Dz(theta) = factor {
                angles[i] = dz_angle_vjp(stage.view(), theta, g.view());
            }
            self.pullback_factor(&mut g, factor);
        }
        (current, Some((g, angles)))
    }
}

/// Rotates every row of `m` about the polar axis by the matching angle
///
/// A single-row `m` is broadcast over all angles. The gradient with respect to a broadcast row is
/// summed over the angles.
#[allow(clippy::type_complexity)]
pub fn rotate_polar(
    m: ArrayView2<f64>,
    theta: ArrayView1<f64>,
    output_gradient: Option<ArrayView2<f64>>,
) -> Result<(Array2<f64>, Option<(Array2<f64>, Array1<f64>)>), ConfigError> {
    let rows = m.nrows();
    if rows != 1 && rows != theta.len() {
        return Err(ConfigError::ShapeMismatch {
            what: "number of rows to rotate",
            expected: theta.len(),
            actual: rows,
        });
    }
    let broadcast = rows == 1;
    let value = if broadcast {
        m.broadcast((theta.len(), m.ncols()))
            .map(|v| v.to_owned())
            .ok_or(ConfigError::ShapeMismatch {
                what: "row to broadcast",
                expected: m.ncols(),
                actual: m.len(),
            })?
    } else {
        m.to_owned()
    };
    let mut rotated = value.clone();
    Zip::from(rotated.rows_mut())
        .and(&theta)
        .for_each(|row, &t| dz_row(row, t));

    let Some(output_gradient) = output_gradient else {
        return Ok((rotated, None));
    };
    if output_gradient.dim() != rotated.dim() {
        return Err(ConfigError::ShapeMismatch {
            what: "output gradient",
            expected: rotated.len(),
            actual: output_gradient.len(),
        });
    }

    let mut bm = output_gradient.to_owned();
    let mut btheta = Array1::zeros(theta.len());
    Zip::from(bm.rows_mut())
        .and(value.rows())
        .and(&theta)
        .and(&mut btheta)
        .for_each(|g, row, &t, bt| {
            *bt = dz_row_derivative(row, t).dot(&g);
            dz_row_transpose(g, t);
        });
    let bm = if broadcast {
        bm.sum_axis(Axis(0)).insert_axis(Axis(0))
    } else {
        bm
    };
    Ok((rotated, Some((bm, btheta))))
}
