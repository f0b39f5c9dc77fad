//! Occultation solution vector in the polynomial basis
//!
//! The unocculted disk flux of every basis term, `rT`, is known in closed form. The occulted part
//! is integrated over circles centred on the occultor: a point at distance `r'` from the occultor
//! centre and angle `φ'` lies on the visible disk iff `cos φ' <= κ(r')`, so every circle
//! contributes an arc, and the arcs are integrated over `r'` with breakpoints where the arc
//! topology changes. Endpoint-clustering substitutions keep the square root behaviour of `z` at
//! the limb from spoiling the Gauss-Legendre convergence.

use crate::basis::{PolyTerm, poly_terms};
use crate::error::ConfigError;
use crate::provider::quadrature::{GaussLegendre, OCCULTATION_NODES};

use libm::tgamma;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};
use std::f64::consts::PI;

/// Unocculted flux `∫ x^i y^j z^k dA` over the unit disk
pub fn disk_integral(term: &PolyTerm) -> f64 {
    if term.i % 2 == 1 || term.j % 2 == 1 {
        return 0.0;
    }
    let (i, j) = (term.i as f64, term.j as f64);
    let angular = 2.0 * tgamma(0.5 * (i + 1.0)) * tgamma(0.5 * (j + 1.0)) / tgamma(0.5 * (i + j + 2.0));
    let radial = match term.k {
        0 => 1.0 / (i + j + 2.0),
        _ => {
            let a = 0.5 * (i + j);
            0.5 * tgamma(a + 1.0) * tgamma(1.5) / tgamma(a + 2.5)
        }
    };
    angular * radial
}

/// Accumulates weighted polynomial basis rows without per-point allocations
struct PolyAccumulator {
    terms: Vec<PolyTerm>,
    x_pow: Vec<f64>,
    y_pow: Vec<f64>,
}

impl PolyAccumulator {
    fn new(lmax: usize) -> Self {
        Self {
            terms: poly_terms(lmax),
            x_pow: vec![1.0; lmax + 1],
            y_pow: vec![1.0; lmax + 1],
        }
    }

    /// `out += weight · p̃(x, y, z)`, and `out_cos += weight · cos_phi · p̃(x, y, z)`
    fn add(
        &mut self,
        [x, y, z]: [f64; 3],
        weight: f64,
        cos_phi: f64,
        out: &mut [f64],
        out_cos: Option<&mut [f64]>,
    ) {
        for p in 1..self.x_pow.len() {
            self.x_pow[p] = self.x_pow[p - 1] * x;
            self.y_pow[p] = self.y_pow[p - 1] * y;
        }
        let value = |term: &PolyTerm| {
            let v = self.x_pow[term.i as usize] * self.y_pow[term.j as usize];
            if term.k == 1 { v * z } else { v }
        };
        match out_cos {
            Some(out_cos) => {
                let weight_cos = weight * cos_phi;
                for ((term, a), c) in self.terms.iter().zip(out.iter_mut()).zip(out_cos.iter_mut()) {
                    let v = value(term);
                    *a += weight * v;
                    *c += weight_cos * v;
                }
            }
            None => {
                for (term, a) in self.terms.iter().zip(out.iter_mut()) {
                    *a += weight * value(term);
                }
            }
        }
    }
}

/// Solution vector `sT(b, r) = rT - ∫∫_occulted p̃ dA` and its partial derivatives
#[derive(Clone, Debug)]
pub struct SolutionVector {
    lmax: usize,
    rt: Array1<f64>,
}

impl SolutionVector {
    pub fn new(lmax: usize) -> Self {
        let rt = poly_terms(lmax).iter().map(disk_integral).collect();
        Self { lmax, rt }
    }

    pub fn len(&self) -> usize {
        self.rt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rt.is_empty()
    }

    /// Flux of every basis term over the unocculted disk
    pub fn base_flux(&self) -> ArrayView1<'_, f64> {
        self.rt.view()
    }

    /// Solution vector for the occultor at impact parameter `b` and of radius `r`
    ///
    /// Returns `(sT, ∂sT/∂b, ∂sT/∂r)`, derivatives are zero-filled when `derivatives` is false.
    pub fn compute(&self, b: f64, r: f64, derivatives: bool) -> [Array1<f64>; 3] {
        let n = self.len();
        let mut occulted = vec![0.0; n];
        let mut ds_db = Array1::zeros(n);
        let mut ds_dr = Array1::zeros(n);
        let mut acc = PolyAccumulator::new(self.lmax);
        let sign = if b < 0.0 { -1.0 } else { 1.0 };
        let b_abs = b.abs();

        if r > 0.0 {
            let upper = r.min(1.0 + b_abs);
            let mut breakpoints = vec![0.0];
            breakpoints.extend(
                [(1.0 - b_abs).abs(), 1.0 + b_abs]
                    .into_iter()
                    .filter(|&x| x > 0.0 && x < upper),
            );
            breakpoints.push(upper);
            let rule = GaussLegendre::occultation();
            for segment in breakpoints.windows(2) {
                let (lo, hi) = (segment[0], segment[1]);
                if hi <= lo {
                    continue;
                }
                // r' = lo + (hi - lo) (1 - cos w) / 2 clusters nodes at both ends
                for (w, weight) in rule.mapped(0.0, PI) {
                    let radius = lo + 0.5 * (hi - lo) * (1.0 - w.cos());
                    let dr = 0.5 * (hi - lo) * w.sin() * weight;
                    arc(&mut acc, b_abs, sign, radius, dr, &mut occulted, None);
                }
            }
            if derivatives {
                let mut a = vec![0.0; n];
                let mut c = vec![0.0; n];
                arc(&mut acc, b_abs, sign, r, 1.0, &mut a, Some(&mut c));
                ds_dr = a.into_iter().map(|v| -v).collect();
                ds_db = c.into_iter().map(|v| -sign * v).collect();
            }
        }

        let s = Zip::from(&self.rt)
            .and(&Array1::from(occulted))
            .map_collect(|&rt, &occ| rt - occ);
        [s, ds_db, ds_dr]
    }

    /// Batched solution vectors, `(K, N)`, with the vector-Jacobian product with respect to `b`
    /// and `r` when `output_gradient` is given
    #[allow(clippy::type_complexity)]
    pub fn compute_batch(
        &self,
        b: ArrayView1<f64>,
        r: ArrayView1<f64>,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> Result<(Array2<f64>, Option<[Array1<f64>; 2]>), ConfigError> {
        if r.len() != b.len() {
            return Err(ConfigError::ShapeMismatch {
                what: "occultor radius",
                expected: b.len(),
                actual: r.len(),
            });
        }
        if let Some(g) = output_gradient {
            if g.dim() != (b.len(), self.len()) {
                return Err(ConfigError::ShapeMismatch {
                    what: "output gradient",
                    expected: b.len() * self.len(),
                    actual: g.len(),
                });
            }
        }

        let mut value = Array2::zeros((b.len(), self.len()));
        let mut bb = Array1::zeros(b.len());
        let mut br = Array1::zeros(b.len());
        for (k, (&b, &r)) in b.iter().zip(r.iter()).enumerate() {
            let [s, ds_db, ds_dr] = self.compute(b, r, output_gradient.is_some());
            if let Some(g) = output_gradient {
                bb[k] = g.row(k).dot(&ds_db);
                br[k] = g.row(k).dot(&ds_dr);
            }
            value.row_mut(k).assign(&s);
        }
        Ok((value, output_gradient.map(|_| [bb, br])))
    }
}

/// Adds `weight · ∫ p̃ r' dφ'` over the visible part of the circle of radius `radius` around
/// the occultor, and the same integral weighted by `cos φ'` to `out_cos`
fn arc(
    acc: &mut PolyAccumulator,
    b_abs: f64,
    sign: f64,
    radius: f64,
    weight: f64,
    out: &mut [f64],
    mut out_cos: Option<&mut [f64]>,
) {
    if radius <= 0.0 || weight == 0.0 {
        return;
    }
    let denom = 2.0 * b_abs * radius;
    let numer = 1.0 - radius * radius - b_abs * b_abs;
    let kappa = if denom > 0.0 {
        numer / denom
    } else if numer >= 0.0 {
        f64::INFINITY
    } else {
        f64::NEG_INFINITY
    };
    if kappa <= -1.0 {
        return;
    }

    let mut add = |phi: f64, dphi: f64| {
        let (sin_phi, cos_phi) = phi.sin_cos();
        let x = sign * radius * sin_phi;
        let y = sign * (b_abs + radius * cos_phi);
        let z = f64::sqrt(f64::max(0.0, 1.0 - x * x - y * y));
        acc.add(
            [x, y, z],
            weight * radius * dphi,
            cos_phi,
            out,
            out_cos.as_deref_mut(),
        );
    };

    if kappa >= 1.0 {
        // periodic integrand, the uniform rule converges exponentially
        let n = 2 * OCCULTATION_NODES;
        let dphi = 2.0 * PI / n as f64;
        for k in 0..n {
            add((k as f64 + 0.5) * dphi, dphi);
        }
    } else {
        // φ' = π - (π - φ0) cos u for u in [0, π]
        let half = PI - kappa.acos();
        for (u, w) in GaussLegendre::occultation().mapped(0.0, PI) {
            add(PI - half * u.cos(), half * u.sin() * w);
        }
    }
}
