//! Limb darkening and filter operator
//!
//! The intensity of the filtered map is the pointwise product of the surface map with the kernel
//! `k = p_u · p_f`, where `p_u = -Σ u_i (1 - z)^i` is the limb darkening law and `p_f` is the
//! filter map in the polynomial basis. Multiplication by `k` is linear in the polynomial
//! coefficients of the surface map, giving the `(N, Ny)` matrix `F(u, f)`.

use crate::basis::{PolyTerm, poly_mul, poly_mul_vjp, poly_pad};
use crate::degree::{DegreeConfig, n_coeffs};
use crate::error::ConfigError;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};

#[derive(Clone, Debug)]
pub struct FilterKernel {
    config: DegreeConfig,
    /// Ylm to polynomial change of basis of degree `fdeg`
    a1_f: Array2<f64>,
    /// `(1 - z)^i` for `i = 0..=udeg`, padded to `(udeg + 1)²` coefficients
    one_minus_z_powers: Vec<Array1<f64>>,
}

impl FilterKernel {
    pub fn new(config: DegreeConfig, a1_full: ArrayView2<f64>) -> Result<Self, ConfigError> {
        let n_f = config.n_f();
        let a1_f = a1_full.slice(s![..n_f, ..n_f]).to_owned();

        let width = n_coeffs(config.udeg());
        let mut one_minus_z = Array1::zeros(4);
        one_minus_z[0] = 1.0;
        one_minus_z[2] = -1.0;
        let mut power = Array1::from_elem(1, 1.0);
        let mut one_minus_z_powers = Vec::with_capacity(config.n_u());
        for i in 0..config.n_u() {
            if i > 0 {
                power = poly_mul(power.view(), one_minus_z.view())?;
            }
            one_minus_z_powers.push(poly_pad(power.view(), width));
        }
        Ok(Self {
            config,
            a1_f,
            one_minus_z_powers,
        })
    }

    fn check_inputs(&self, u: ArrayView1<f64>, f: ArrayView1<f64>) -> Result<(), ConfigError> {
        if u.len() != self.config.n_u() {
            return Err(ConfigError::ShapeMismatch {
                what: "limb darkening coefficients",
                expected: self.config.n_u(),
                actual: u.len(),
            });
        }
        if f.len() != self.config.n_f() {
            return Err(ConfigError::ShapeMismatch {
                what: "filter coefficients",
                expected: self.config.n_f(),
                actual: f.len(),
            });
        }
        Ok(())
    }

    /// Limb darkening law in the polynomial basis
    fn limb_darkening(&self, u: ArrayView1<f64>) -> Array1<f64> {
        self.one_minus_z_powers
            .iter()
            .zip(u.iter())
            .fold(Array1::zeros(n_coeffs(self.config.udeg())), |acc, (p, &ui)| {
                acc - ui * p
            })
    }

    /// `F(u, f)`, `(N, Ny)`, and its vector-Jacobian product when `output_gradient` is given
    #[allow(clippy::type_complexity)]
    pub fn matrix(
        &self,
        u: ArrayView1<f64>,
        f: ArrayView1<f64>,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> Result<(Array2<f64>, Option<(Array1<f64>, Array1<f64>)>), ConfigError> {
        self.check_inputs(u, f)?;
        let (n, n_y) = (self.config.n(), self.config.n_y());
        if let Some(g) = output_gradient {
            if g.dim() != (n, n_y) {
                return Err(ConfigError::ShapeMismatch {
                    what: "filter output gradient",
                    expected: n * n_y,
                    actual: g.len(),
                });
            }
        }

        let p_u = self.limb_darkening(u);
        let p_f = self.a1_f.dot(&f);
        let kernel = poly_mul(p_u.view(), p_f.view())?;

        let mut matrix = Array2::zeros((n, n_y));
        let mut b_kernel = Array1::zeros(kernel.len());
        for (a, &ka) in kernel.iter().enumerate() {
            let term = PolyTerm::from_index(a);
            for j in 0..n_y {
                term.for_each_product_term(&PolyTerm::from_index(j), |t, coeff| {
                    let row = t.index();
                    matrix[(row, j)] += coeff * ka;
                    if let Some(g) = output_gradient {
                        b_kernel[a] += coeff * g[(row, j)];
                    }
                });
            }
        }
        if output_gradient.is_none() {
            return Ok((matrix, None));
        }

        let (b_pu, b_pf) = poly_mul_vjp(p_u.view(), p_f.view(), b_kernel.view());
        let bu = self
            .one_minus_z_powers
            .iter()
            .map(|p| -p.dot(&b_pu))
            .collect();
        let bf = self.a1_f.t().dot(&b_pf);
        Ok((matrix, Some((bu, bf))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::basis::poly_basis;
    use crate::provider::{MathProvider, ReferenceProvider};
    use crate::tests::sample_matrix;

    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::array;

    fn kernel(config: DegreeConfig) -> FilterKernel {
        let provider = ReferenceProvider::new(config).unwrap();
        FilterKernel::new(config, provider.to_greens_basis()).unwrap()
    }

    #[test]
    fn unit_filter_is_identity() {
        let config = DegreeConfig::new(2, 1, 1).unwrap();
        let filter = kernel(config);
        let u = array![-1.0, 0.0];
        let f = array![1.0, 0.0, 0.0, 0.0];
        let (matrix, _) = filter.matrix(u.view(), f.view(), None).unwrap();
        let mut expected = Array2::zeros((config.n(), config.n_y()));
        for j in 0..config.n_y() {
            expected[(j, j)] = 1.0;
        }
        assert_abs_diff_eq!(matrix, expected, epsilon = 1e-12);
    }

    #[test]
    fn linear_limb_darkening_profile() {
        // I(z) = 1 - u1 (1 - z) for u = [-1, u1]
        let config = DegreeConfig::new(1, 1, 0).unwrap();
        let filter = kernel(config);
        let u1 = 0.4;
        let (matrix, _) = filter
            .matrix(array![-1.0, u1].view(), array![1.0].view(), None)
            .unwrap();
        let map = array![0.7, 0.1, -0.2, 0.3];
        let filtered = matrix.dot(&map);
        let (x, y) = (0.2, -0.3);
        let z = f64::sqrt(1.0 - x * x - y * y);
        let eval = |p: &Array1<f64>, lmax| {
            poly_basis(lmax, array![x].view(), array![y].view(), array![z].view())
                .row(0)
                .dot(p)
        };
        assert_relative_eq!(
            eval(&filtered, 2),
            eval(&map, 1) * (1.0 - u1 * (1.0 - z)),
            epsilon = 1e-12
        );
    }

    #[test]
    fn gradient() {
        let config = DegreeConfig::new(2, 2, 1).unwrap();
        let filter = kernel(config);
        let u = array![-1.0, 0.3, 0.2];
        let f = array![1.0, 0.1, -0.2, 0.05];
        let g = sample_matrix(config.n(), config.n_y(), 3);
        let (_, vjp) = filter.matrix(u.view(), f.view(), Some(g.view())).unwrap();
        let (bu, bf) = vjp.unwrap();
        let loss = |u: &Array1<f64>, f: &Array1<f64>| {
            (filter.matrix(u.view(), f.view(), None).unwrap().0 * &g).sum()
        };
        // F is linear in u and in f separately
        for i in 0..u.len() {
            let mut u1 = u.clone();
            u1[i] += 1.0;
            assert_relative_eq!(loss(&u1, &f) - loss(&u, &f), bu[i], epsilon = 1e-10);
        }
        for i in 0..f.len() {
            let mut f1 = f.clone();
            f1[i] += 1.0;
            assert_relative_eq!(loss(&u, &f1) - loss(&u, &f), bf[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn wrong_lengths() {
        let config = DegreeConfig::new(1, 1, 0).unwrap();
        let filter = kernel(config);
        assert!(matches!(
            filter.matrix(array![-1.0].view(), array![1.0].view(), None),
            Err(ConfigError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            filter.matrix(array![-1.0, 0.0].view(), array![1.0, 0.0].view(), None),
            Err(ConfigError::ShapeMismatch { .. })
        ));
    }
}
