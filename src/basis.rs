//! Spherical harmonic indexing and the polynomial basis on the unit sphere
//!
//! Coefficients of both the spherical harmonic and the polynomial representation are ordered
//! by `n = l² + l + m` with `l = 0..=lmax` and `m = -l..=l`. The polynomial term of index
//! `(l, m)` is defined through `mu = l - m` and `nu = l + m`:
//!
//! ```text
//! nu even: x^(mu / 2) y^(nu / 2)
//! nu odd:  x^((mu - 1) / 2) y^((nu - 1) / 2) z
//! ```
//!
//! so every term carries at most the first power of `z`, which makes the basis complete on the
//! sphere where `z² = 1 - x² - y²`.

use crate::degree::n_coeffs;
use crate::error::ConfigError;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};

/// Index of the `(l, m)` coefficient
pub fn ylm_index(l: usize, m: i64, lmax: usize) -> Result<usize, ConfigError> {
    if l > lmax || m.unsigned_abs() as usize > l {
        return Err(ConfigError::InvalidYlmIndex { l, m, lmax });
    }
    Ok(((l * l + l) as i64 + m) as usize)
}

/// `(l, m)` of the coefficient with index `n`
pub fn ylm_lm(n: usize) -> (usize, i64) {
    let mut l = (n as f64).sqrt() as usize;
    // guard against rounding of the square root
    while l * l > n {
        l -= 1;
    }
    while (l + 1) * (l + 1) <= n {
        l += 1;
    }
    (l, n as i64 - (l * l + l) as i64)
}

/// Degree `l` such that `(l + 1)² == width`
pub fn degree_of_width(width: usize) -> Option<usize> {
    if width == 0 {
        return None;
    }
    let (l, m) = ylm_lm(width - 1);
    (m == l as i64).then_some(l)
}

/// Monomial `x^i y^j z^k` with `k` being zero or one
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PolyTerm {
    pub i: u32,
    pub j: u32,
    pub k: u32,
}

impl PolyTerm {
    pub fn from_index(n: usize) -> Self {
        let (l, m) = ylm_lm(n);
        let mu = l as i64 - m;
        let nu = l as i64 + m;
        if nu % 2 == 0 {
            Self {
                i: (mu / 2) as u32,
                j: (nu / 2) as u32,
                k: 0,
            }
        } else {
            Self {
                i: ((mu - 1) / 2) as u32,
                j: ((nu - 1) / 2) as u32,
                k: 1,
            }
        }
    }

    pub fn index(&self) -> usize {
        let l = self.degree() as i64;
        let m = 2 * self.j as i64 + self.k as i64 - l;
        (l * l + l + m) as usize
    }

    #[inline]
    pub fn degree(&self) -> usize {
        (self.i + self.j + self.k) as usize
    }

    #[inline]
    pub fn eval(&self, x: f64, y: f64, z: f64) -> f64 {
        let v = x.powi(self.i as i32) * y.powi(self.j as i32);
        if self.k == 1 { v * z } else { v }
    }

    /// Partial derivatives with respect to `x`, `y` and `z`
    pub fn gradient(&self, x: f64, y: f64, z: f64) -> [f64; 3] {
        let zk = if self.k == 1 { z } else { 1.0 };
        let dx = if self.i == 0 {
            0.0
        } else {
            self.i as f64 * x.powi(self.i as i32 - 1) * y.powi(self.j as i32) * zk
        };
        let dy = if self.j == 0 {
            0.0
        } else {
            self.j as f64 * x.powi(self.i as i32) * y.powi(self.j as i32 - 1) * zk
        };
        let dz = if self.k == 1 {
            x.powi(self.i as i32) * y.powi(self.j as i32)
        } else {
            0.0
        };
        [dx, dy, dz]
    }

    /// Calls `f(term, coeff)` for every term of the product reduced to the sphere
    pub fn for_each_product_term(&self, other: &Self, mut f: impl FnMut(PolyTerm, f64)) {
        let i = self.i + other.i;
        let j = self.j + other.j;
        match self.k + other.k {
            k @ (0 | 1) => f(PolyTerm { i, j, k }, 1.0),
            _ => {
                // z² = 1 - x² - y²
                f(PolyTerm { i, j, k: 0 }, 1.0);
                f(PolyTerm { i: i + 2, j, k: 0 }, -1.0);
                f(PolyTerm { i, j: j + 2, k: 0 }, -1.0);
            }
        }
    }
}

/// All terms up to degree `lmax` in coefficient order
pub fn poly_terms(lmax: usize) -> Vec<PolyTerm> {
    (0..n_coeffs(lmax)).map(PolyTerm::from_index).collect()
}

/// Product of two polynomials given in the reduced basis
pub fn poly_mul(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Result<Array1<f64>, ConfigError> {
    let deg_a = degree_of_width(a.len()).ok_or(ConfigError::NotHarmonicWidth {
        what: "polynomial",
        actual: a.len(),
    })?;
    let deg_b = degree_of_width(b.len()).ok_or(ConfigError::NotHarmonicWidth {
        what: "polynomial",
        actual: b.len(),
    })?;
    let mut c = Array1::zeros(n_coeffs(deg_a + deg_b));
    for (na, &ca) in a.iter().enumerate() {
        if ca == 0.0 {
            continue;
        }
        let ta = PolyTerm::from_index(na);
        for (nb, &cb) in b.iter().enumerate() {
            if cb == 0.0 {
                continue;
            }
            ta.for_each_product_term(&PolyTerm::from_index(nb), |t, coeff| {
                c[t.index()] += coeff * ca * cb;
            });
        }
    }
    Ok(c)
}

/// Vector-Jacobian product of [poly_mul] with respect to both factors
pub fn poly_mul_vjp(
    a: ArrayView1<f64>,
    b: ArrayView1<f64>,
    output_gradient: ArrayView1<f64>,
) -> (Array1<f64>, Array1<f64>) {
    let mut ba = Array1::zeros(a.len());
    let mut bb = Array1::zeros(b.len());
    for na in 0..a.len() {
        let ta = PolyTerm::from_index(na);
        for nb in 0..b.len() {
            let mut g = 0.0;
            ta.for_each_product_term(&PolyTerm::from_index(nb), |t, coeff| {
                g += coeff * output_gradient.get(t.index()).copied().unwrap_or(0.0);
            });
            ba[na] += g * b[nb];
            bb[nb] += g * a[na];
        }
    }
    (ba, bb)
}

/// Zero-pads a polynomial to `width` coefficients
pub fn poly_pad(a: ArrayView1<f64>, width: usize) -> Array1<f64> {
    let mut out = Array1::zeros(width.max(a.len()));
    out.slice_mut(ndarray::s![..a.len()]).assign(&a);
    out
}

/// Polynomial basis evaluated at points, `(n_points, (lmax + 1)²)`
pub fn poly_basis(
    lmax: usize,
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    z: ArrayView1<f64>,
) -> Array2<f64> {
    let terms = poly_terms(lmax);
    let mut basis = Array2::zeros((x.len(), terms.len()));
    Zip::from(basis.rows_mut())
        .and(&x)
        .and(&y)
        .and(&z)
        .for_each(|mut row, &x, &y, &z| {
            for (value, term) in row.iter_mut().zip(terms.iter()) {
                *value = term.eval(x, y, z);
            }
        });
    basis
}

/// Vector-Jacobian product of [poly_basis] with respect to the point coordinates
pub fn poly_basis_vjp(
    lmax: usize,
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    z: ArrayView1<f64>,
    output_gradient: ArrayView2<f64>,
) -> [Array1<f64>; 3] {
    let terms = poly_terms(lmax);
    let mut bx = Array1::zeros(x.len());
    let mut by = Array1::zeros(x.len());
    let mut bz = Array1::zeros(x.len());
    for (p, g) in output_gradient.rows().into_iter().enumerate() {
        for (term, &g) in terms.iter().zip(g.iter()) {
            let [dx, dy, dz] = term.gradient(x[p], y[p], z[p]);
            bx[p] += g * dx;
            by[p] += g * dy;
            bz[p] += g * dz;
        }
    }
    [bx, by, bz]
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn index_round_trip() {
        for n in 0..n_coeffs(8) {
            let (l, m) = ylm_lm(n);
            assert_eq!(ylm_index(l, m, 8).unwrap(), n);
            assert_eq!(PolyTerm::from_index(n).index(), n);
            assert_eq!(PolyTerm::from_index(n).degree(), l);
        }
    }

    #[test]
    fn invalid_ylm_index() {
        assert!(ylm_index(2, 3, 4).is_err());
        assert!(ylm_index(2, -3, 4).is_err());
        assert!(ylm_index(5, 0, 4).is_err());
    }

    #[test]
    fn width_degree() {
        assert_eq!(degree_of_width(1), Some(0));
        assert_eq!(degree_of_width(9), Some(2));
        assert_eq!(degree_of_width(10), None);
        assert_eq!(degree_of_width(0), None);
    }

    #[test]
    fn first_terms() {
        // 1, x, z, y, x², xz, xy, yz, y²
        let expected = [
            (0, 0, 0),
            (1, 0, 0),
            (0, 0, 1),
            (0, 1, 0),
            (2, 0, 0),
            (1, 0, 1),
            (1, 1, 0),
            (0, 1, 1),
            (0, 2, 0),
        ];
        for (term, &(i, j, k)) in poly_terms(2).iter().zip(expected.iter()) {
            assert_eq!(*term, PolyTerm { i, j, k });
        }
    }

    #[test]
    fn product_reduces_z_squared() {
        // z * z = 1 - x² - y²
        let mut z = Array1::zeros(4);
        z[2] = 1.0;
        let zz = poly_mul(z.view(), z.view()).unwrap();
        let mut expected = Array1::zeros(9);
        expected[0] = 1.0;
        expected[4] = -1.0;
        expected[8] = -1.0;
        assert_eq!(zz, expected);
    }

    #[test]
    fn product_matches_pointwise_product() {
        let a = array![0.3, -1.0, 0.5, 2.0];
        let b = array![1.0, 0.2, -0.7, 0.1, 0.4, -0.3, 0.8, 0.05, -0.6];
        let c = poly_mul(a.view(), b.view()).unwrap();
        let (x, y) = (0.3, -0.4);
        let z = f64::sqrt(1.0 - x * x - y * y);
        let eval = |p: &Array1<f64>| {
            let lmax = degree_of_width(p.len()).unwrap();
            poly_basis(lmax, array![x].view(), array![y].view(), array![z].view())
                .row(0)
                .dot(p)
        };
        assert_relative_eq!(eval(&c), eval(&a) * eval(&b), epsilon = 1e-12);
    }

    #[test]
    fn product_gradient() {
        let a = array![0.3, -1.0, 0.5, 2.0];
        let b = array![1.0, 0.2, -0.7, 0.1];
        let g = Array1::from_shape_fn(9, |i| (i as f64 * 0.7).cos());
        let (ba, bb) = poly_mul_vjp(a.view(), b.view(), g.view());
        // bilinear, so a unit step gives the exact directional derivative
        for i in 0..4 {
            let mut a1 = a.clone();
            a1[i] += 1.0;
            let diff = poly_mul(a1.view(), b.view()).unwrap() - poly_mul(a.view(), b.view()).unwrap();
            assert_relative_eq!(diff.dot(&g), ba[i], epsilon = 1e-12);
            let mut b1 = b.clone();
            b1[i] += 1.0;
            let diff = poly_mul(a.view(), b1.view()).unwrap() - poly_mul(a.view(), b.view()).unwrap();
            assert_relative_eq!(diff.dot(&g), bb[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn basis_gradient() {
        let (x, y, z) = (array![0.2, -0.5], array![0.4, 0.1], array![0.6, 0.3]);
        let g = Array2::from_shape_fn((2, 16), |(i, j)| ((i + 2 * j) as f64).sin());
        let [bx, _by, bz] = poly_basis_vjp(3, x.view(), y.view(), z.view(), g.view());
        let eps = 1e-6;
        let loss = |x: &Array1<f64>, z: &Array1<f64>| {
            (poly_basis(3, x.view(), y.view(), z.view()) * &g).sum()
        };
        for p in 0..2 {
            let mut xp = x.clone();
            xp[p] += eps;
            let mut xm = x.clone();
            xm[p] -= eps;
            assert_relative_eq!(
                bx[p],
                (loss(&xp, &z) - loss(&xm, &z)) / (2.0 * eps),
                epsilon = 1e-6
            );
            let mut zp = z.clone();
            zp[p] += eps;
            let mut zm = z.clone();
            zm[p] -= eps;
            assert_relative_eq!(
                bz[p],
                (loss(&x, &zp) - loss(&x, &zm)) / (2.0 * eps),
                epsilon = 1e-6
            );
        }
    }
}
