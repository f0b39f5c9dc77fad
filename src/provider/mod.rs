//! Numerical primitives of the occultation model
//!
//! [MathProvider] is the boundary between the operator layer and the numerical kernels: it hands
//! out the fixed change-of-basis matrices and solution rows, and evaluates the rotation, filter and
//! solution vector kernels. Every kernel is a single combined call returning the value and, when
//! an output gradient is supplied, its vector-Jacobian product.

mod filter;
pub use filter::FilterKernel;

pub mod quadrature;

mod reference;
pub use reference::{ReferenceProvider, SPOT_GRID_DEGREE};

mod solution;
pub use solution::{SolutionVector, disk_integral};

pub mod wigner;

pub mod ylm;

use crate::degree::DegreeConfig;
use crate::error::ConfigError;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Kernel value together with its optional vector-Jacobian product
#[derive(Clone, Debug, PartialEq)]
pub struct WithVjp<V, G> {
    pub value: V,
    pub vjp: Option<G>,
}

impl<V, G> WithVjp<V, G> {
    pub fn new(value: V, vjp: Option<G>) -> Self {
        Self { value, vjp }
    }
}

/// Gradients of [MathProvider::solution_vector] with respect to `b` and `r`
pub type SolutionVjp = [Array1<f64>; 2];

/// Gradients of [MathProvider::rotate_polar] with respect to the rows and the angles
pub type PolarVjp = (Array2<f64>, Array1<f64>);

/// Gradients of the frame rotations with respect to the rows, inclination and obliquity
pub type FrameVjp = (Array2<f64>, f64, f64);

/// Gradients of [MathProvider::filter_matrix] with respect to `u` and `f`
pub type FilterVjp = (Array1<f64>, Array1<f64>);

/// Numerical kernels for a fixed [DegreeConfig]
///
/// All matrices act on row vectors from the right. Angles are in radians.
pub trait MathProvider {
    fn config(&self) -> &DegreeConfig;

    /// Solution vectors `(K, N)` for impact parameters `b` and occultor radii `r`
    fn solution_vector(
        &self,
        b: ArrayView1<f64>,
        r: ArrayView1<f64>,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> Result<WithVjp<Array2<f64>, SolutionVjp>, ConfigError>;

    /// `A1`, `(Ny, Ny)`: spherical harmonics to polynomials of degree `ydeg`
    fn to_poly_basis(&self) -> ArrayView2<'_, f64>;

    /// `A`, `(N, N)`: spherical harmonics to the integration basis of degree `deg`
    fn to_greens_basis(&self) -> ArrayView2<'_, f64>;

    /// `A1⁻¹`, `(N, N)`: polynomials to spherical harmonics of degree `deg`
    fn from_poly_basis(&self) -> ArrayView2<'_, f64>;

    /// `rT`, `(1, N)`: disk-integrated flux of every integration basis term
    fn base_flux_row(&self) -> ArrayView2<'_, f64>;

    /// `rT · A1`, `(1, Ny)`: disk-integrated flux of every spherical harmonic
    fn base_flux_poly_row(&self) -> ArrayView2<'_, f64>;

    /// Row `k` of the result is `m_k · Dz(theta_k)`, a single row of `m` is broadcast
    fn rotate_polar(
        &self,
        m: ArrayView2<f64>,
        theta: ArrayView1<f64>,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> Result<WithVjp<Array2<f64>, PolarVjp>, ConfigError>;

    /// `M · D(Q)ᵀ`, rotation from the stellar frame into the observer frame
    fn rotate_frame(
        &self,
        m: ArrayView2<f64>,
        inc: f64,
        obl: f64,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> Result<WithVjp<Array2<f64>, FrameVjp>, ConfigError>;

    /// `M · D(Q)`, rotation from the observer frame into the stellar frame
    fn rotate_frame_transpose(
        &self,
        m: ArrayView2<f64>,
        inc: f64,
        obl: f64,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> Result<WithVjp<Array2<f64>, FrameVjp>, ConfigError>;

    /// Filter matrix `F(u, f)`, `(N, Ny)`
    fn filter_matrix(
        &self,
        u: ArrayView1<f64>,
        f: ArrayView1<f64>,
        output_gradient: Option<ArrayView2<f64>>,
    ) -> Result<WithVjp<Array2<f64>, FilterVjp>, ConfigError>;

    /// Spherical harmonic expansion `(Ny, len(amp))` of Gaussian spots of width `sigma` centred
    /// at the stellar latitude `lat` and longitude `lon`, seen from the observer frame
    fn spot_ylm(
        &self,
        amp: ArrayView1<f64>,
        sigma: f64,
        lat: f64,
        lon: f64,
        inc: f64,
        obl: f64,
    ) -> Result<Array2<f64>, ConfigError>;
}
