use crate::error::InferenceError;
use crate::inference::{InferenceResult, Objective, check_dim, draw_in_prior};

use cobyla::{Func, RhoBeg, StopTols, minimize};
use ordered_float::NotNan;
use rand::SeedableRng;
use rand::rngs::StdRng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Objective value used where the log-posterior is not finite
const INFEASIBLE: f64 = 1e300;

/// Multi-start maximum likelihood with COBYLA
///
/// COBYLA (Constrained Optimization BY Linear Approximations) is derivative-free. The first start
/// is the initial guess itself when its prior is finite, the other `nstarts - 1` starts are drawn
/// from a Gaussian ball of width `start_std` around it, rejecting points outside of the prior
/// support. Every start minimizes `-ln_prob` within [Objective::bounds], the best result is
/// returned.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename = "Cobyla")]
pub struct CobylaMaxLikelihood {
    pub niterations: u32,
    pub rhobeg: NotNan<f64>,
    pub ftol_rel: NotNan<f64>,
    pub nstarts: u32,
    pub start_std: NotNan<f64>,
    pub seed: u64,
}

impl CobylaMaxLikelihood {
    /// Create a new [CobylaMaxLikelihood]
    ///
    /// # Arguments
    /// - `niterations`: maximum number of objective evaluations per start
    /// - `rhobeg`: initial change of the parameters
    /// - `ftol_rel`: relative tolerance on the objective
    /// - `nstarts`: number of starting points
    /// - `start_std`: width of the Gaussian ball the extra starts are drawn from
    /// - `seed`: random seed of the starting points
    pub fn new(
        niterations: u32,
        rhobeg: f64,
        ftol_rel: f64,
        nstarts: u32,
        start_std: f64,
        seed: u64,
    ) -> Self {
        assert!(niterations > 0, "niterations must be positive");
        assert!(rhobeg > 0.0 && rhobeg.is_finite(), "rhobeg must be positive and finite");
        assert!(ftol_rel >= 0.0 && ftol_rel.is_finite(), "ftol_rel must be non-negative and finite");
        assert!(nstarts > 0, "nstarts must be positive");
        assert!(start_std >= 0.0 && start_std.is_finite(), "start_std must be non-negative and finite");
        Self {
            niterations,
            rhobeg: NotNan::new(rhobeg).expect("rhobeg must be not NaN"),
            ftol_rel: NotNan::new(ftol_rel).expect("ftol_rel must be not NaN"),
            nstarts,
            start_std: NotNan::new(start_std).expect("start_std must be not NaN"),
            seed,
        }
    }

    #[inline]
    pub fn default_niterations() -> u32 {
        1000
    }

    #[inline]
    pub fn default_rhobeg() -> f64 {
        0.1
    }

    #[inline]
    pub fn default_ftol_rel() -> f64 {
        1e-8
    }

    #[inline]
    pub fn default_nstarts() -> u32 {
        4
    }

    #[inline]
    pub fn default_start_std() -> f64 {
        0.1
    }

    #[inline]
    pub fn default_seed() -> u64 {
        0
    }

    /// Maximizes the log-posterior of `objective` starting around `x0`
    pub fn maximize(
        &self,
        objective: &dyn Objective,
        x0: &[f64],
    ) -> Result<InferenceResult, InferenceError> {
        check_dim(objective, x0)?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let bounds = objective.bounds();
        let constraints: Vec<&dyn Func<()>> = vec![];

        let mut best: Option<InferenceResult> = None;
        for start in 0..self.nstarts {
            let x_init = if start == 0 && objective.ln_prior(x0).is_finite() {
                x0.to_vec()
            } else {
                draw_in_prior(objective, x0, self.start_std.into(), &mut rng)?
            };
            let neg_ln_prob = |x: &[f64], _user_data: &mut ()| -> f64 {
                let ln_prob = objective.ln_prob(x);
                if ln_prob.is_finite() {
                    -ln_prob
                } else {
                    INFEASIBLE
                }
            };
            let (success, x) = match minimize(
                neg_ln_prob,
                &x_init,
                &bounds,
                &constraints,
                (),
                self.niterations as usize,
                RhoBeg::All(self.rhobeg.into()),
                Some(StopTols {
                    ftol_rel: self.ftol_rel.into(),
                    ..StopTols::default()
                }),
            ) {
                Ok((status, x, _)) => (
                    matches!(
                        status,
                        cobyla::SuccessStatus::Success
                            | cobyla::SuccessStatus::FtolReached
                            | cobyla::SuccessStatus::XtolReached
                    ),
                    x,
                ),
                Err((status, x, _)) => {
                    log::debug!("COBYLA start {start} stopped with {status:?}");
                    (false, x)
                }
            };
            let ln_prob = objective.ln_prob(&x);
            log::debug!("COBYLA start {start} finished with ln_prob = {ln_prob}");
            if best.as_ref().is_none_or(|best| ln_prob > best.ln_prob) {
                best = Some(InferenceResult {
                    x,
                    ln_prob,
                    success,
                });
            }
        }
        best.ok_or(InferenceError::NoValidInitialGuess(0))
    }
}

impl Default for CobylaMaxLikelihood {
    fn default() -> Self {
        Self::new(
            Self::default_niterations(),
            Self::default_rhobeg(),
            Self::default_ftol_rel(),
            Self::default_nstarts(),
            Self::default_start_std(),
            Self::default_seed(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::degree::DegreeConfig;
    use crate::inference::PhaseCurveLikelihood;
    use crate::inference::prior::{LnPrior, LnPrior1D};
    use crate::inference::tests::gaussian;
    use crate::ops::{Ops, SampleBatch, SurfaceParams};

    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    #[test]
    fn gaussian_maximum() {
        let objective = gaussian();
        let fitter = CobylaMaxLikelihood::new(2000, 0.1, 1e-12, 3, 0.3, 1);
        let result = fitter.maximize(&objective, &[1.5, 0.0]).unwrap();
        assert_abs_diff_eq!(&result.x[..], &objective.mu[..], epsilon = 1e-3);
        assert!(result.ln_prob.is_finite());
    }

    #[test]
    fn starts_outside_of_prior_are_redrawn() {
        let objective = gaussian();
        let fitter = CobylaMaxLikelihood::new(2000, 0.1, 1e-12, 2, 0.5, 2);
        let result = fitter.maximize(&objective, &[-0.1, 0.0]).unwrap();
        assert_abs_diff_eq!(&result.x[..], &objective.mu[..], epsilon = 1e-3);
        assert!(matches!(
            fitter.maximize(&objective, &[0.0]),
            Err(InferenceError::Dimension { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn recovers_noiseless_phase_curve() {
        let ops = Ops::new(DegreeConfig::unfiltered(1).unwrap()).unwrap();
        let theta = Array1::linspace(0.0, 6.0, 30);
        let n = theta.len();
        let batch = SampleBatch::with_radius(
            theta,
            Array1::from_elem(n, 3.0),
            Array1::zeros(n),
            Array1::from_elem(n, -1.0),
            0.1,
        )
        .unwrap();
        let surface = SurfaceParams::new(1.2, 0.1, Array1::zeros(4));
        let err = Array1::from_elem(n, 1e-3);
        let truth = [0.1, 0.2, -0.15, 0.3];
        let observed = PhaseCurveLikelihood::new(&ops, &batch, &surface, Array1::zeros(n), err.clone())
            .unwrap()
            .with_normalization(false)
            .model(&truth)
            .unwrap();
        let likelihood = PhaseCurveLikelihood::new(&ops, &batch, &surface, observed.clone(), err)
            .unwrap()
            .with_normalization(false)
            .with_prior(LnPrior::ind_components(vec![
                LnPrior1D::uniform(-1.0, 1.0),
                LnPrior1D::uniform(-1.0, 1.0),
                LnPrior1D::uniform(-1.0, 1.0),
                LnPrior1D::uniform(0.0, 1.0),
            ]))
            .unwrap();

        let fitter = CobylaMaxLikelihood::new(5000, 0.05, 1e-14, 2, 0.02, 0);
        let result = fitter
            .maximize(&likelihood, &[0.15, 0.15, -0.1, 0.35])
            .unwrap();
        assert!(likelihood.ln_likelihood(&result.x, None) > -10.0);
        assert_abs_diff_eq!(likelihood.model(&result.x).unwrap(), observed, epsilon = 5e-3);
    }
}
