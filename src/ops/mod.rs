//! Differentiable occultation operator layer
//!
//! [Ops] composes the kernels of a [MathProvider] into the design matrix `X` of a light curve,
//! `flux = X · y`, and into images and point intensities of the surface map. Every sample of a
//! [SampleBatch] is classified as rotation-only or occulted, see [Regime], and the two branches
//! are evaluated separately and merged. Gradients are reverse-mode: each `*_vjp` method takes
//! the gradient of a scalar with respect to the output and returns it with respect to every
//! input.

mod batch;
pub use batch::{FluxGradient, SampleBatch, SurfaceParams};

mod composition;
use composition::{BasisFilter, RotationChain};

pub mod operator;
pub use operator::{DifferentiableOp, Operator, OperatorKind};

pub mod rank;
pub use rank::RankAdapter;

mod selector;
pub use selector::{Partition, Regime};
use selector::DesignMatrix;

use crate::degree::DegreeConfig;
use crate::error::{ConfigError, OpsError};
use crate::provider::{MathProvider, ReferenceProvider};
use crate::render::{GridCache, GridCacheConfig, Projection};

use ndarray::{Array, Array1, Array2, Array3, ArrayView, ArrayView1, ArrayView2, Axis, Dimension};

/// Flux, intensity and image model of an occulted spherical harmonic map
///
/// Flux and gradient evaluation takes `&self` and has no shared mutable state. Rendering takes
/// `&mut self` because it fills the [GridCache].
#[derive(Clone, Debug)]
pub struct Ops<P = ReferenceProvider> {
    provider: P,
    grid_cache: GridCache,
}

impl Ops<ReferenceProvider> {
    pub fn new(config: DegreeConfig) -> Result<Self, OpsError> {
        Ok(Self::with_provider(ReferenceProvider::new(config)?))
    }
}

impl<P: MathProvider> Ops<P> {
    pub fn with_provider(provider: P) -> Self {
        Self::with_provider_and_cache(provider, GridCacheConfig::default())
    }

    pub fn with_provider_and_cache(provider: P, cache: GridCacheConfig) -> Self {
        Self {
            provider,
            grid_cache: GridCache::new(cache),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &DegreeConfig {
        self.provider.config()
    }

    pub fn grid_cache(&self) -> &GridCache {
        &self.grid_cache
    }

    fn math(&self) -> &dyn MathProvider {
        &self.provider
    }

    /// Rotation-only and occulted samples of the batch
    pub fn partition(&self, batch: &SampleBatch) -> Partition {
        Partition::new(batch)
    }

    /// Design matrix `X`, `(K, Ny)`: row `k` maps the surface map to the flux of sample `k`
    pub fn design_matrix(
        &self,
        batch: &SampleBatch,
        params: &SurfaceParams,
    ) -> Result<Array2<f64>, OpsError> {
        params.validate(self.config())?;
        Ok(DesignMatrix::new(self.math(), batch, params)?.into_value())
    }

    /// Gradients of `Σ bX ∘ X` with respect to every input, the surface map gradient is zero
    pub fn design_matrix_vjp(
        &self,
        batch: &SampleBatch,
        params: &SurfaceParams,
        output_gradient: ArrayView2<f64>,
    ) -> Result<FluxGradient, OpsError> {
        params.validate(self.config())?;
        let expected = (batch.len(), self.config().n_y());
        if output_gradient.dim() != expected {
            return Err(ConfigError::ShapeMismatch {
                what: "design matrix gradient",
                expected: expected.0 * expected.1,
                actual: output_gradient.len(),
            }
            .into());
        }
        let x = DesignMatrix::new(self.math(), batch, params)?;
        Ok(x.vjp(self.math(), params, output_gradient)?)
    }

    /// Flux of every sample, `X · y`
    pub fn flux(&self, batch: &SampleBatch, params: &SurfaceParams) -> Result<Array1<f64>, OpsError> {
        Ok(self.design_matrix(batch, params)?.dot(&params.y))
    }

    /// Flux together with the gradients of `Σ bflux ∘ flux` with respect to every input
    pub fn flux_vjp(
        &self,
        batch: &SampleBatch,
        params: &SurfaceParams,
        output_gradient: ArrayView1<f64>,
    ) -> Result<(Array1<f64>, FluxGradient), OpsError> {
        params.validate(self.config())?;
        if output_gradient.len() != batch.len() {
            return Err(ConfigError::ShapeMismatch {
                what: "flux gradient",
                expected: batch.len(),
                actual: output_gradient.len(),
            }
            .into());
        }
        let x = DesignMatrix::new(self.math(), batch, params)?;
        let flux = x.value().dot(&params.y);
        let b_x = output_gradient
            .insert_axis(Axis(1))
            .dot(&params.y.view().insert_axis(Axis(0)));
        let mut grad = x.vjp(self.math(), params, b_x.view())?;
        grad.y = x.value().t().dot(&output_gradient);
        Ok((flux, grad))
    }

    /// Surface map rotated by `dotR` for every phase, `(K, Ny)`
    pub fn rotate_map(
        &self,
        y: ArrayView1<f64>,
        inc: f64,
        obl: f64,
        theta: ArrayView1<f64>,
    ) -> Result<Array2<f64>, OpsError> {
        if y.len() != self.config().n_y() {
            return Err(ConfigError::ShapeMismatch {
                what: "surface map coefficients",
                expected: self.config().n_y(),
                actual: y.len(),
            }
            .into());
        }
        let chain = RotationChain::new(self.math(), y.insert_axis(Axis(0)), inc, obl, theta)?;
        Ok(chain.into_value())
    }

    /// Intensity `pT · [F] · A1 · y` of the surface at points `(x, y, z)` of any shape
    pub fn intensity<D: Dimension>(
        &self,
        x: ArrayView<f64, D>,
        y: ArrayView<f64, D>,
        z: ArrayView<f64, D>,
        params: &SurfaceParams,
    ) -> Result<Array<f64, D>, OpsError> {
        params.validate(self.config())?;
        let shape = x.raw_dim();
        let basis = operator::PolyBasisAtPoints {}.evaluate(
            self.math(),
            &[x.view().into_dyn(), y.view().into_dyn(), z.view().into_dyn()],
        )?;
        let poly = self.filtered_poly(params, params.y.view().insert_axis(Axis(1)))?;
        let intensity = basis.dot(&poly).remove_axis(Axis(1));
        let (expected, actual) = (shape.size(), intensity.len());
        intensity.into_shape_with_order(shape).map_err(|_| {
            ConfigError::ShapeMismatch {
                what: "intensity points",
                expected,
                actual,
            }
            .into()
        })
    }

    /// `[F] · A1 · m` for surface map columns `m`, `(Ny, K)` to `(N, K)`
    fn filtered_poly(
        &self,
        params: &SurfaceParams,
        m: ArrayView2<f64>,
    ) -> Result<Array2<f64>, OpsError> {
        let filter = BasisFilter::new(self.math(), params.u.view(), params.f.view())?;
        let poly = self.provider.to_poly_basis().dot(&m);
        Ok(match filter.matrix() {
            Some(matrix) => matrix.dot(&poly),
            None => poly,
        })
    }

    /// Gaussian spots expanded in spherical harmonics, `(Ny, len(amp))`
    ///
    /// `sigma` is the angular width, `lat` and `lon` the spot centre on the body, all in radians.
    /// The expansion is rotated into the observer frame by `inc` and `obl`.
    pub fn spot_ylm(
        &self,
        amp: ArrayView1<f64>,
        sigma: f64,
        lat: f64,
        lon: f64,
        inc: f64,
        obl: f64,
    ) -> Result<Array2<f64>, OpsError> {
        Ok(self.provider.spot_ylm(amp, sigma, lat, lon, inc, obl)?)
    }

    /// Image stack `(res, width, K)` of the surface at phases `theta`
    ///
    /// The map of frame `k` is `dotR(y, inc, obl, -theta_k)`. The rectangular projection ignores
    /// `inc` and `obl` of the grid itself.
    pub fn render(
        &mut self,
        res: usize,
        projection: Projection,
        theta: ArrayView1<f64>,
        params: &SurfaceParams,
    ) -> Result<Array3<f64>, OpsError> {
        params.validate(self.config())?;
        if res == 0 {
            return Err(ConfigError::InvalidParameter("resolution must be positive").into());
        }
        let neg_theta = theta.mapv(|t| -t);
        let rotated = self.rotate_map(params.y.view(), params.inc, params.obl, neg_theta.view())?;
        let poly = self.filtered_poly(params, rotated.t())?;
        let basis = self
            .grid_cache
            .basis(&self.provider, projection, res)?;
        let image = basis.dot(&poly);
        let shape = (projection.height(res), projection.width(res), theta.len());
        image.into_shape_with_order(shape).map_err(|_| {
            ConfigError::ShapeMismatch {
                what: "image",
                expected: shape.0 * shape.1 * shape.2,
                actual: basis.nrows() * theta.len(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::basis::ylm_index;
    use crate::tests::{assert_gradient, sample_vector};

    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::array;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn batch(ro: f64) -> SampleBatch {
        SampleBatch::with_radius(
            array![0.0, 0.4, 1.3, 2.0, 2.9],
            array![-1.5, -0.3, 0.2, 0.5, 0.0],
            array![0.1, 0.2, -0.3, 0.9, -1.2],
            array![1.0, 1.0, 1.0, -1.0, 1.0],
            ro,
        )
        .unwrap()
    }

    #[test]
    fn end_to_end_unocculted_sample() {
        let ops = Ops::new(DegreeConfig::unfiltered(1).unwrap()).unwrap();
        let y = array![1.0, 0.3, -0.2, 0.4];
        let params = SurfaceParams::new(0.7, 0.2, y.clone());
        let batch =
            SampleBatch::with_radius(array![0.0], array![0.5], array![0.5], array![1.0], 0.0)
                .unwrap();
        let flux = ops.flux(&batch, &params).unwrap();
        let expected = ops.provider().base_flux_poly_row().row(0).dot(&y);
        assert_relative_eq!(flux[0], expected, epsilon = 1e-12);
    }

    #[test]
    fn zero_radius_is_pure_rotation() {
        let ops = Ops::new(DegreeConfig::new(2, 1, 0).unwrap()).unwrap();
        let params = SurfaceParams::new(1.0, 0.4, sample_vector(9, -1.0, 1.0, 1))
            .with_limb_darkening(array![-1.0, 0.5]);
        let batch = batch(0.0);
        assert_eq!(ops.partition(&batch).rotation().len(), batch.len());
        let x = ops.design_matrix(&batch, &params).unwrap();

        let filter = BasisFilter::new(ops.math(), params.u.view(), params.f.view()).unwrap();
        let forced = ops
            .rotate_map(
                filter.flux_row(ops.math()).row(0),
                params.inc,
                params.obl,
                batch.theta(),
            )
            .unwrap();
        assert_abs_diff_eq!(x, forced, epsilon = 1e-12);
    }

    #[test]
    fn unocculted_flux_of_a_limb_darkened_uniform_map() {
        // ∫ (1 - u1 (1 - z)) dA over the unit disk is π (1 - u1 / 3)
        let ops = Ops::new(DegreeConfig::new(0, 1, 0).unwrap()).unwrap();
        let u1 = 0.6;
        let params =
            SurfaceParams::new(FRAC_PI_2, 0.0, array![1.0]).with_limb_darkening(array![-1.0, u1]);
        let flux = ops.flux(&batch(0.0), &params).unwrap();
        for f in flux {
            assert_relative_eq!(f, PI * (1.0 - u1 / 3.0), epsilon = 1e-10);
        }
    }

    #[test]
    fn full_occultation_of_a_uniform_map() {
        let ops = Ops::new(DegreeConfig::unfiltered(0).unwrap()).unwrap();
        let params = SurfaceParams::new(FRAC_PI_2, 0.0, array![1.0]);
        let batch =
            SampleBatch::with_radius(array![0.0, 0.0], array![0.0, 0.1], array![0.0, 0.0], array![1.0, 1.0], 0.2)
                .unwrap();
        let flux = ops.flux(&batch, &params).unwrap();
        for f in flux {
            assert_relative_eq!(f, PI * (1.0 - 0.04), epsilon = 1e-10);
        }
    }

    #[test]
    fn flux_gradient() {
        let ops = Ops::new(DegreeConfig::new(2, 1, 1).unwrap()).unwrap();
        let base = SurfaceParams::new(1.1, 0.3, sample_vector(9, -1.0, 1.0, 2))
            .with_limb_darkening(array![-1.0, 0.4])
            .with_filter(array![1.0, 0.1, -0.05, 0.2]);
        let base_batch = batch(0.15);
        let partition = ops.partition(&base_batch);
        assert_eq!(partition.occultation(), &[1, 2]);

        let g = sample_vector(base_batch.len(), -1.0, 1.0, 3);
        let (flux, grad) = ops.flux_vjp(&base_batch, &base, g.view()).unwrap();
        assert_abs_diff_eq!(flux, ops.flux(&base_batch, &base).unwrap(), epsilon = 1e-14);
        assert!(grad.zo.iter().all(|&x| x == 0.0));

        let loss = |batch: &SampleBatch, params: &SurfaceParams| {
            ops.flux(batch, params).unwrap().dot(&g)
        };
        assert_gradient(
            |x| loss(&base_batch, &SurfaceParams { inc: x, ..base.clone() }),
            base.inc,
            grad.inc,
        );
        assert_gradient(
            |x| loss(&base_batch, &SurfaceParams { obl: x, ..base.clone() }),
            base.obl,
            grad.obl,
        );
        for (name, coeffs, analytic) in [
            ("y", &base.y, &grad.y),
            ("u", &base.u, &grad.u),
            ("f", &base.f, &grad.f),
        ] {
            for i in 0..coeffs.len() {
                let perturbed = |x: f64| {
                    let mut params = base.clone();
                    let target = match name {
                        "y" => &mut params.y,
                        "u" => &mut params.u,
                        _ => &mut params.f,
                    };
                    target[i] = x;
                    loss(&base_batch, &params)
                };
                assert_gradient(perturbed, coeffs[i], analytic[i]);
            }
        }

        let arrays = |batch: &SampleBatch| {
            [
                batch.theta().to_owned(),
                batch.xo().to_owned(),
                batch.yo().to_owned(),
                batch.zo().to_owned(),
                batch.ro().to_owned(),
            ]
        };
        let per_sample = [&grad.theta, &grad.xo, &grad.yo, &grad.zo, &grad.ro];
        for (which, analytic) in per_sample.iter().enumerate() {
            for k in 0..base_batch.len() {
                let x0 = arrays(&base_batch)[which][k];
                let perturbed = |x: f64| {
                    let mut a = arrays(&base_batch);
                    a[which][k] = x;
                    let [theta, xo, yo, zo, ro] = a;
                    let batch = SampleBatch::new(theta, xo, yo, zo, ro).unwrap();
                    loss(&batch, &base)
                };
                assert_gradient(perturbed, x0, analytic[k]);
            }
        }
    }

    #[test]
    fn intensity_of_first_degree_map() {
        let ops = Ops::new(DegreeConfig::unfiltered(1).unwrap()).unwrap();
        let y = Array1::from_shape_fn(4, |n| if n == ylm_index(1, 1, 1).unwrap() { 1.0 } else { 0.0 });
        let params = SurfaceParams::new(FRAC_PI_2, 0.0, y);
        let x = array![[0.3, -0.2], [0.0, 0.5]];
        let yy = array![[0.1, 0.4], [-0.6, 0.0]];
        let z = (1.0_f64 - &x * &x - &yy * &yy).mapv(f64::sqrt);
        let intensity = ops.intensity(x.view(), yy.view(), z.view(), &params).unwrap();
        assert_eq!(intensity.dim(), (2, 2));
        // Y_1,1 = sqrt(3) x
        assert_abs_diff_eq!(intensity, &x * 3f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn limb_darkened_intensity() {
        let ops = Ops::new(DegreeConfig::new(0, 2, 0).unwrap()).unwrap();
        let (u1, u2) = (0.4, 0.2);
        let params = SurfaceParams::new(FRAC_PI_2, 0.0, array![1.0])
            .with_limb_darkening(array![-1.0, u1, u2]);
        let z = array![1.0, 0.5, 0.1];
        let x = z.mapv(|z: f64| (1.0 - z * z).sqrt());
        let y = Array1::zeros(3);
        let intensity = ops.intensity(x.view(), y.view(), z.view(), &params).unwrap();
        let expected = z.mapv(|z| 1.0 - u1 * (1.0 - z) - u2 * (1.0 - z).powi(2));
        assert_abs_diff_eq!(intensity, expected, epsilon = 1e-12);
    }

    #[test]
    fn render_uses_cache() {
        let mut ops = Ops::new(DegreeConfig::unfiltered(2).unwrap()).unwrap();
        let params = SurfaceParams::new(FRAC_PI_2, 0.0, sample_vector(9, -1.0, 1.0, 4));
        let theta = array![0.0, 0.5, 1.0];
        let image = ops
            .render(6, Projection::Rectangular, theta.view(), &params)
            .unwrap();
        assert_eq!(image.dim(), (6, 12, 3));
        assert_eq!(ops.grid_cache().evaluations(), 1);
        ops.render(6, Projection::Rectangular, theta.view(), &params)
            .unwrap();
        assert_eq!(ops.grid_cache().evaluations(), 1);
        let ortho = ops
            .render(5, Projection::Orthographic, theta.view(), &params)
            .unwrap();
        assert_eq!(ortho.dim(), (5, 5, 3));
        assert_eq!(ops.grid_cache().evaluations(), 2);
        ops.render(7, Projection::Orthographic, theta.view(), &params)
            .unwrap();
        assert_eq!(ops.grid_cache().evaluations(), 3);
        // corners are outside of the disk
        assert!(ortho[(0, 0, 0)].is_nan());
        assert!(ortho[(2, 2, 1)].is_finite());
    }

    #[test]
    fn orthographic_render_matches_intensity() {
        let mut ops = Ops::new(DegreeConfig::new(2, 1, 0).unwrap()).unwrap();
        let params = SurfaceParams::new(0.8, 0.3, sample_vector(9, -1.0, 1.0, 5))
            .with_limb_darkening(array![-1.0, 0.3]);
        let image = ops
            .render(5, Projection::Orthographic, array![0.0].view(), &params)
            .unwrap();
        // pixel (2, 3) is x = 0.5, y = 0
        let rotated = ops
            .rotate_map(params.y.view(), params.inc, params.obl, array![0.0].view())
            .unwrap();
        let observed = SurfaceParams {
            y: rotated.row(0).to_owned(),
            ..params.clone()
        };
        let point = ops
            .intensity(
                array![0.5].view(),
                array![0.0].view(),
                array![0.75f64.sqrt()].view(),
                &observed,
            )
            .unwrap();
        assert_relative_eq!(image[(2, 3, 0)], point[0], epsilon = 1e-12);
    }

    #[test]
    fn spot_is_brightest_facing_the_observer() {
        let ops = Ops::new(DegreeConfig::unfiltered(6).unwrap()).unwrap();
        let spot = ops
            .spot_ylm(array![1.0].view(), 0.4, 0.0, 0.0, FRAC_PI_2, 0.0)
            .unwrap();
        assert_eq!(spot.dim(), (49, 1));
        assert!(ops.spot_ylm(array![1.0].view(), -0.1, 0.0, 0.0, 0.0, 0.0).is_err());
    }

    #[test]
    fn wrong_coefficient_lengths() {
        let ops = Ops::new(DegreeConfig::unfiltered(2).unwrap()).unwrap();
        let params = SurfaceParams::new(0.0, 0.0, Array1::zeros(4));
        assert!(matches!(
            ops.flux(&batch(0.1), &params),
            Err(OpsError::Config(ConfigError::ShapeMismatch { .. }))
        ));
        let params = SurfaceParams::new(0.0, 0.0, Array1::zeros(9));
        let g = Array1::zeros(2);
        assert!(ops.flux_vjp(&batch(0.1), &params, g.view()).is_err());
    }
}
