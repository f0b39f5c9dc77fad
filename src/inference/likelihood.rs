use crate::basis::poly_basis;
use crate::error::{ConfigError, InferenceError};
use crate::inference::{Objective, check_dim};
use crate::inference::prior::LnPrior;
use crate::ops::{Ops, SampleBatch, SurfaceParams};
use crate::provider::MathProvider;
use crate::render::Projection;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};

/// Gaussian log-likelihood of a phase curve of a body orbiting a unit-flux host
///
/// The free parameters are the surface map coefficients `y_lm` with `l ≥ 1` followed by the
/// luminosity `L`, `y_00` is fixed to unity. The system flux of sample `k` is `1 + L (X · y)_k`
/// where `X` is the design matrix of the batch. When normalization is on, the model is divided
/// by the flux of the first sample. The design matrix is evaluated once at construction, so the
/// geometry and the limb darkening and filter coefficients are fixed.
#[derive(Clone, Debug)]
pub struct PhaseCurveLikelihood {
    design_matrix: Array2<f64>,
    observed: Array1<f64>,
    inv_err: Array1<f64>,
    normalize: bool,
    prior: LnPrior,
    positivity: Option<Array2<f64>>,
}

impl PhaseCurveLikelihood {
    /// `surface` provides inclination, obliquity, limb darkening and filter, its map is unused
    pub fn new<P: MathProvider>(
        ops: &Ops<P>,
        batch: &SampleBatch,
        surface: &SurfaceParams,
        observed: Array1<f64>,
        err: Array1<f64>,
    ) -> Result<Self, InferenceError> {
        for (what, len) in [
            ("observed fluxes", observed.len()),
            ("flux errors", err.len()),
        ] {
            if len != batch.len() {
                return Err(ConfigError::ShapeMismatch {
                    what,
                    expected: batch.len(),
                    actual: len,
                }
                .into());
            }
        }
        if batch.is_empty() {
            return Err(ConfigError::InvalidParameter("light curve must be non-empty").into());
        }
        if err.iter().any(|&e| !(e > 0.0)) {
            return Err(ConfigError::InvalidParameter("flux errors must be positive").into());
        }
        let design_matrix = ops.design_matrix(batch, surface)?;
        Ok(Self {
            design_matrix,
            observed,
            inv_err: err.mapv(f64::recip),
            normalize: Self::default_normalize(),
            prior: LnPrior::default(),
            positivity: None,
        })
    }

    #[inline]
    pub fn default_normalize() -> bool {
        true
    }

    /// Divide the model by its first sample
    pub fn with_normalization(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_prior(mut self, prior: LnPrior) -> Result<Self, InferenceError> {
        match prior.dim() {
            Some(dim) if dim != self.dim() => Err(InferenceError::Dimension {
                expected: self.dim(),
                actual: dim,
            }),
            _ => {
                self.prior = prior;
                Ok(self)
            }
        }
    }

    /// Reject maps with negative intensity anywhere on a `res × 2 res` latitude-longitude grid
    pub fn with_positivity<P: MathProvider>(
        mut self,
        ops: &Ops<P>,
        res: usize,
    ) -> Result<Self, InferenceError> {
        if res == 0 {
            return Err(ConfigError::InvalidParameter("resolution must be positive").into());
        }
        let [x, y, z] = Projection::Rectangular.grid(res);
        let ydeg = ops.config().ydeg();
        let basis = poly_basis(ydeg, x.view(), y.view(), z.view());
        let n_y = ops.config().n_y();
        self.positivity = Some(basis.slice(s![.., ..n_y]).dot(&ops.provider().to_poly_basis()));
        Ok(self)
    }

    pub fn prior(&self) -> &LnPrior {
        &self.prior
    }

    pub fn design_matrix(&self) -> ArrayView2<'_, f64> {
        self.design_matrix.view()
    }

    /// Full surface map `[1, params[..Ny - 1]]`
    pub fn map_coefficients(&self, params: &[f64]) -> Result<Array1<f64>, InferenceError> {
        check_dim(self, params)?;
        let mut y = Array1::ones(self.design_matrix.ncols());
        y.slice_mut(s![1..])
            .assign(&ArrayView1::from(&params[..self.dim() - 1]));
        Ok(y)
    }

    pub fn luminosity(&self, params: &[f64]) -> Result<f64, InferenceError> {
        check_dim(self, params)?;
        Ok(params[self.dim() - 1])
    }

    /// Model light curve, the system flux it is derived from and the flux of the body `X · y`
    fn evaluate(&self, params: &[f64]) -> Result<Evaluation, InferenceError> {
        let body = self.design_matrix.dot(&self.map_coefficients(params)?);
        let luminosity = self.luminosity(params)?;
        let flux = body.mapv(|f| 1.0 + luminosity * f);
        let model = if self.normalize {
            &flux / flux[0]
        } else {
            flux.clone()
        };
        Ok(Evaluation {
            model,
            flux,
            body,
            luminosity,
        })
    }

    /// Model light curve
    pub fn model(&self, params: &[f64]) -> Result<Array1<f64>, InferenceError> {
        Ok(self.evaluate(params)?.model)
    }

    /// Whether the map intensity is non-negative on the positivity grid
    pub fn is_positive(&self, params: &[f64]) -> Result<bool, InferenceError> {
        let y = self.map_coefficients(params)?;
        Ok(match &self.positivity {
            Some(matrix) => matrix.dot(&y).iter().all(|&i| i >= 0.0),
            None => true,
        })
    }
}

struct Evaluation {
    model: Array1<f64>,
    flux: Array1<f64>,
    body: Array1<f64>,
    luminosity: f64,
}

impl Objective for PhaseCurveLikelihood {
    fn dim(&self) -> usize {
        self.design_matrix.ncols()
    }

    fn ln_prior(&self, params: &[f64]) -> f64 {
        match self.is_positive(params) {
            Ok(true) => self.prior.ln_prior(params, None),
            _ => f64::NEG_INFINITY,
        }
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        self.prior.support(self.dim())
    }

    /// Minus infinity for a parameter vector of a wrong length, `grad` is left untouched then
    fn ln_likelihood(&self, params: &[f64], grad: Option<&mut [f64]>) -> f64 {
        let Ok(Evaluation {
            model,
            flux,
            body,
            luminosity,
        }) = self.evaluate(params)
        else {
            return f64::NEG_INFINITY;
        };
        let residual = (&self.observed - &model) * &self.inv_err;
        let ln_like = -0.5 * residual.dot(&residual);
        if let Some(grad) = grad.filter(|grad| grad.len() == params.len()) {
            let b_model = &residual * &self.inv_err;
            let b_flux = if self.normalize {
                let mut b_flux = &b_model / flux[0];
                b_flux[0] -= b_model.dot(&flux) / flux[0].powi(2);
                b_flux
            } else {
                b_model
            };
            let b_y = self.design_matrix.t().dot(&b_flux) * luminosity;
            let n = self.dim();
            for (g, &b) in grad[..n - 1].iter_mut().zip(b_y.iter().skip(1)) {
                *g = b;
            }
            grad[n - 1] = body.dot(&b_flux);
        }
        ln_like
    }
}
