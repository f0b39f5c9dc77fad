use crate::basis::poly_terms;
use crate::degree::{DegreeConfig, n_coeffs};
use crate::error::ConfigError;
use crate::provider::filter::FilterKernel;
use crate::provider::quadrature::SphereGrid;
use crate::provider::solution::SolutionVector;
use crate::provider::wigner::{FrameRotator, rotate_polar, row_degree};
use crate::provider::ylm::ylm_row;
use crate::provider::{FilterVjp, FrameVjp, MathProvider, PolarVjp, SolutionVjp, WithVjp};

use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use std::f64::consts::PI;

/// Degree of the sphere quadrature used to project spots onto spherical harmonics
pub const SPOT_GRID_DEGREE: usize = 100;

/// Matrix entries below this magnitude are rounding noise of the quadrature
const CHOP_THRESHOLD: f64 = 1e-13;

/// Pure Rust implementation of [MathProvider]
///
/// The change of basis matrices are found by exact sphere quadrature, the solution vector by
/// fixed-order one-dimensional Gauss-Legendre integration over the occulted area, and the
/// rotations in closed form for the polar axis and through an axis permutation otherwise.
/// Everything but the solution vector and the filter is precomputed on construction.
#[derive(Clone, Debug)]
pub struct ReferenceProvider {
    config: DegreeConfig,
    a1: Array2<f64>,
    a: Array2<f64>,
    a1_inv: Array2<f64>,
    rt: Array2<f64>,
    rt_a1: Array2<f64>,
    solution: SolutionVector,
    rotator: FrameRotator,
    filter: FilterKernel,
}

impl ReferenceProvider {
    pub fn new(config: DegreeConfig) -> Result<Self, ConfigError> {
        let deg = config.deg();
        let n = config.n();
        let n_y = config.n_y();

        let a1_inv = poly_to_ylm(deg);
        let a = invert(a1_inv.view()).ok_or(ConfigError::SingularBasis(deg))?;
        let a1 = a.slice(s![..n_y, ..n_y]).to_owned();

        let solution = SolutionVector::new(deg);
        let rt = solution.base_flux().to_owned().insert_axis(Axis(0));
        let rt_a1 = rt.slice(s![.., ..n_y]).dot(&a1);

        let rotator = FrameRotator::new(deg);
        let filter = FilterKernel::new(config, a.view())?;

        log::debug!(
            "reference provider constructed for ydeg = {}, udeg = {}, fdeg = {}: N = {n}, Ny = {n_y}",
            config.ydeg(),
            config.udeg(),
            config.fdeg(),
        );
        Ok(Self {
            config,
            a1,
            a,
            a1_inv,
            rt,
            rt_a1,
            solution,
            rotator,
            filter,
        })
    }

    fn check_rows(&self, what: &'static str, m: ArrayView2<f64>) -> Result<(), ConfigError> {
        row_degree(what, m.ncols(), self.config.deg()).map(|_| ())
    }

    fn check_output_gradient(
        m: ArrayView2<f64>,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> Result<(), ConfigError> {
        match output_gradient {
            Some(g) if g.dim() != m.dim() => Err(ConfigError::ShapeMismatch {
                what: "output gradient",
                expected: m.len(),
                actual: g.len(),
            }),
            _ => Ok(()),
        }
    }
}

/// `A1⁻¹[a, n] = (1 / 4π) ∫ Y_a p̃_n dΩ`, exact since the integrand has degree `2 lmax`
fn poly_to_ylm(lmax: usize) -> Array2<f64> {
    let n = n_coeffs(lmax);
    let terms = poly_terms(lmax);
    let grid = SphereGrid::new(lmax);
    let mut matrix = Array2::zeros((n, n));
    let mut ylm = vec![0.0; n];
    let mut poly = vec![0.0; n];
    for (&[x, y, z], w) in grid.iter() {
        ylm_row(lmax, x, y, z, &mut ylm);
        for (p, term) in poly.iter_mut().zip(terms.iter()) {
            *p = term.eval(x, y, z);
        }
        let w = w / (4.0 * PI);
        for (a, &ya) in ylm.iter().enumerate() {
            let wy = w * ya;
            for (b, &pb) in poly.iter().enumerate() {
                matrix[(a, b)] += wy * pb;
            }
        }
    }
    chop(matrix)
}

fn invert(matrix: ArrayView2<f64>) -> Option<Array2<f64>> {
    let (rows, cols) = matrix.dim();
    let inverse = DMatrix::from_fn(rows, cols, |i, j| matrix[(i, j)]).try_inverse()?;
    Some(chop(Array2::from_shape_fn((rows, cols), |(i, j)| {
        inverse[(i, j)]
    })))
}

fn chop(mut matrix: Array2<f64>) -> Array2<f64> {
    matrix.mapv_inplace(|x| if x.abs() < CHOP_THRESHOLD { 0.0 } else { x });
    matrix
}

impl MathProvider for ReferenceProvider {
    fn config(&self) -> &DegreeConfig {
        &self.config
    }

    fn solution_vector(
        &self,
        b: ArrayView1<f64>,
        r: ArrayView1<f64>,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> Result<WithVjp<Array2<f64>, SolutionVjp>, ConfigError> {
        let (value, vjp) = self.solution.compute_batch(b, r, output_gradient)?;
        Ok(WithVjp::new(value, vjp))
    }

    fn to_poly_basis(&self) -> ArrayView2<'_, f64> {
        self.a1.view()
    }

    fn to_greens_basis(&self) -> ArrayView2<'_, f64> {
        self.a.view()
    }

    fn from_poly_basis(&self) -> ArrayView2<'_, f64> {
        self.a1_inv.view()
    }

    fn base_flux_row(&self) -> ArrayView2<'_, f64> {
        self.rt.view()
    }

    fn base_flux_poly_row(&self) -> ArrayView2<'_, f64> {
        self.rt_a1.view()
    }

    fn rotate_polar(
        &self,
        m: ArrayView2<f64>,
        theta: ArrayView1<f64>,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> Result<WithVjp<Array2<f64>, PolarVjp>, ConfigError> {
        self.check_rows("rows rotated about the polar axis", m)?;
        let (value, vjp) = rotate_polar(m, theta, output_gradient)?;
        Ok(WithVjp::new(value, vjp))
    }

    fn rotate_frame(
        &self,
        m: ArrayView2<f64>,
        inc: f64,
        obl: f64,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> Result<WithVjp<Array2<f64>, FrameVjp>, ConfigError> {
        self.check_rows("rows rotated into the observer frame", m)?;
        Self::check_output_gradient(m, output_gradient)?;
        let rotation = self.rotator.rotate(m, inc, obl, output_gradient);
        Ok(WithVjp::new(rotation.value, rotation.vjp))
    }

    fn rotate_frame_transpose(
        &self,
        m: ArrayView2<f64>,
        inc: f64,
        obl: f64,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> Result<WithVjp<Array2<f64>, FrameVjp>, ConfigError> {
        self.check_rows("rows rotated into the stellar frame", m)?;
        Self::check_output_gradient(m, output_gradient)?;
        let rotation = self.rotator.rotate_transpose(m, inc, obl, output_gradient);
        Ok(WithVjp::new(rotation.value, rotation.vjp))
    }

    fn filter_matrix(
        &self,
        u: ArrayView1<f64>,
        f: ArrayView1<f64>,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> Result<WithVjp<Array2<f64>, FilterVjp>, ConfigError> {
        let (value, vjp) = self.filter.matrix(u, f, output_gradient)?;
        Ok(WithVjp::new(value, vjp))
    }

    fn spot_ylm(
        &self,
        amp: ArrayView1<f64>,
        sigma: f64,
        lat: f64,
        lon: f64,
        inc: f64,
        obl: f64,
    ) -> Result<Array2<f64>, ConfigError> {
        if !(sigma > 0.0 && sigma.is_finite()) {
            return Err(ConfigError::InvalidParameter(
                "spot width must be positive and finite",
            ));
        }
        let ydeg = self.config.ydeg();
        let n_y = self.config.n_y();

        // unit vector of the spot centre in the stellar frame, the pole is z
        let (sin_lat, cos_lat) = lat.sin_cos();
        let (sin_lon, cos_lon) = lon.sin_cos();
        let center = [cos_lat * sin_lon, -cos_lat * cos_lon, sin_lat];

        let grid = SphereGrid::new(SPOT_GRID_DEGREE.max(2 * ydeg));
        let mut profile = Array1::<f64>::zeros(n_y);
        let mut ylm = vec![0.0; n_y];
        let inv_two_sigma2 = 0.5 / (sigma * sigma);
        for (p, w) in grid.iter() {
            let cos_d = (p[0] * center[0] + p[1] * center[1] + p[2] * center[2]).clamp(-1.0, 1.0);
            let d = cos_d.acos();
            let intensity = f64::exp(-d * d * inv_two_sigma2);
            if intensity == 0.0 {
                continue;
            }
            ylm_row(ydeg, p[0], p[1], p[2], &mut ylm);
            let w = w * intensity / (4.0 * PI);
            for (c, &y) in profile.iter_mut().zip(ylm.iter()) {
                *c += w * y;
            }
        }

        let observed = self
            .rotator
            .rotate(profile.view().insert_axis(Axis(0)), inc, obl, None)
            .value;
        let observed = observed.row(0);
        Ok(Array2::from_shape_fn((n_y, amp.len()), |(i, k)| {
            amp[k] * observed[i]
        }))
    }
}
