//! Fitting surface maps to light curves
//!
//! An [Objective] is a log-posterior over a flat parameter vector. [PhaseCurveLikelihood] builds
//! one from the design matrix of a fixed sample batch, [CobylaMaxLikelihood] maximizes it from
//! several starting points and [McmcSampler] samples it with an affine-invariant ensemble.

pub mod cobyla;
pub use cobyla::CobylaMaxLikelihood;

pub mod likelihood;
pub use likelihood::PhaseCurveLikelihood;

pub mod mcmc;
pub use mcmc::{McmcResult, McmcSampler};

pub mod prior;
pub use prior::{LnPrior, LnPrior1D};

use crate::error::InferenceError;

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Attempts to draw a single initial guess with finite prior
pub const MAX_START_ATTEMPTS: usize = 1000;

/// Log-posterior `ln_prior + ln_likelihood` over `dim` parameters
///
/// Parameter slices passed to the methods must have [Objective::dim] elements.
pub trait Objective {
    fn dim(&self) -> usize;

    fn ln_prior(&self, params: &[f64]) -> f64;

    /// Log-likelihood, its gradient is written into `grad` when given
    fn ln_likelihood(&self, params: &[f64], grad: Option<&mut [f64]>) -> f64;

    /// Box containing the prior support, unbounded unless overridden
    fn bounds(&self) -> Vec<(f64, f64)> {
        vec![(f64::NEG_INFINITY, f64::INFINITY); self.dim()]
    }

    /// Log-posterior, the likelihood is not evaluated outside of the prior support
    fn ln_prob(&self, params: &[f64]) -> f64 {
        let ln_prior = self.ln_prior(params);
        if ln_prior.is_finite() {
            ln_prior + self.ln_likelihood(params, None)
        } else {
            f64::NEG_INFINITY
        }
    }
}

/// Best parameters found by an inference driver
#[derive(Clone, Debug, PartialEq)]
pub struct InferenceResult {
    pub x: Vec<f64>,
    pub ln_prob: f64,
    pub success: bool,
}

pub(crate) fn check_dim(objective: &dyn Objective, x: &[f64]) -> Result<(), InferenceError> {
    if x.len() == objective.dim() {
        Ok(())
    } else {
        Err(InferenceError::Dimension {
            expected: objective.dim(),
            actual: x.len(),
        })
    }
}

/// Point of the Gaussian ball `center + std · N(0, 1)` with finite prior
pub(crate) fn draw_in_prior(
    objective: &dyn Objective,
    center: &[f64],
    std: f64,
    rng: &mut impl Rng,
) -> Result<Vec<f64>, InferenceError> {
    for _ in 0..MAX_START_ATTEMPTS {
        let x: Vec<f64> = center
            .iter()
            .map(|&c| {
                let eps: f64 = StandardNormal.sample(&mut *rng);
                c + std * eps
            })
            .collect();
        if objective.ln_prior(&x).is_finite() {
            return Ok(x);
        }
    }
    Err(InferenceError::NoValidInitialGuess(MAX_START_ATTEMPTS))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Gaussian log-likelihood centred at `mu` with a uniform prior box
    pub struct Gaussian {
        pub mu: Vec<f64>,
        pub prior: LnPrior,
    }

    impl Objective for Gaussian {
        fn dim(&self) -> usize {
            self.mu.len()
        }

        fn ln_prior(&self, params: &[f64]) -> f64 {
            self.prior.ln_prior(params, None)
        }

        fn ln_likelihood(&self, params: &[f64], grad: Option<&mut [f64]>) -> f64 {
            if let Some(grad) = grad {
                for ((g, &x), &mu) in grad.iter_mut().zip(params).zip(&self.mu) {
                    *g = mu - x;
                }
            }
            params
                .iter()
                .zip(&self.mu)
                .map(|(&x, &mu)| -0.5 * (x - mu).powi(2))
                .sum()
        }
    }

    pub fn gaussian() -> Gaussian {
        Gaussian {
            mu: vec![0.5, -1.0],
            prior: LnPrior::ind_components(vec![
                LnPrior1D::uniform(0.0, 2.0),
                LnPrior1D::uniform(-3.0, 3.0),
            ]),
        }
    }

    #[test]
    fn ln_prob_outside_of_prior() {
        let objective = gaussian();
        assert_eq!(objective.ln_prob(&[-0.5, 0.0]), f64::NEG_INFINITY);
        assert_relative_eq!(
            objective.ln_prob(&[0.5, -1.0]),
            -f64::ln(2.0) - f64::ln(6.0),
            max_relative = 1e-12
        );
    }

    #[test]
    fn initial_guesses_are_in_prior() {
        let objective = gaussian();
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            let x = draw_in_prior(&objective, &[0.1, 0.0], 0.5, &mut rng).unwrap();
            assert!(objective.ln_prior(&x).is_finite());
        }
        assert_eq!(
            draw_in_prior(&objective, &[-100.0, 0.0], 1e-3, &mut rng),
            Err(InferenceError::NoValidInitialGuess(MAX_START_ATTEMPTS))
        );
        assert!(check_dim(&objective, &[0.0]).is_err());
    }
}
