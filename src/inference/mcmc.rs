use crate::error::InferenceError;
use crate::inference::{InferenceResult, Objective, check_dim, draw_in_prior};

use emcee::{EnsembleSampler, Guess, Prob};
use ndarray::Array2;
use ordered_float::NotNan;
use rand::SeedableRng;
use rand::rngs::StdRng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Affine-invariant ensemble MCMC sampler
///
/// Walkers start in a Gaussian ball of width `ball_std` around the initial guess, restricted to
/// the prior support. The sampler runs `niterations` steps of `walkers_per_dim · dim` walkers and
/// reports the position with the largest log-posterior together with the whole chain. Positions
/// are passed to the sampler in single precision.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename = "Mcmc")]
pub struct McmcSampler {
    pub niterations: u32,
    pub walkers_per_dim: u32,
    pub ball_std: NotNan<f64>,
    pub seed: u64,
}

impl McmcSampler {
    pub fn new(niterations: u32, walkers_per_dim: u32, ball_std: f64, seed: u64) -> Self {
        assert!(niterations > 0, "niterations must be positive");
        assert!(walkers_per_dim >= 2, "at least two walkers per dimension are required");
        assert!(ball_std >= 0.0 && ball_std.is_finite(), "ball_std must be non-negative and finite");
        Self {
            niterations,
            walkers_per_dim,
            ball_std: NotNan::new(ball_std).expect("ball_std must be not NaN"),
            seed,
        }
    }

    #[inline]
    pub fn default_niterations() -> u32 {
        1000
    }

    #[inline]
    pub fn default_walkers_per_dim() -> u32 {
        10
    }

    #[inline]
    pub fn default_ball_std() -> f64 {
        0.01
    }

    #[inline]
    pub fn default_seed() -> u64 {
        0
    }

    /// Ensemble size, rounded up to an even number
    pub fn nwalkers(&self, dim: usize) -> usize {
        let n = self.walkers_per_dim as usize * dim;
        n + n % 2
    }

    /// Samples the log-posterior of `objective` with walkers started around `x0`
    pub fn sample(
        &self,
        objective: &dyn Objective,
        x0: &[f64],
    ) -> Result<McmcResult, InferenceError> {
        check_dim(objective, x0)?;
        let dim = x0.len();
        let nwalkers = self.nwalkers(dim);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let initial_guesses = (0..nwalkers)
            .map(|_| {
                let x = draw_in_prior(objective, x0, self.ball_std.into(), &mut rng)?;
                Ok(Guess::new(&x.iter().map(|&v| v as f32).collect::<Vec<_>>()))
            })
            .collect::<Result<Vec<_>, InferenceError>>()?;

        let model = EmceeObjective { objective };
        let mut sampler = EnsembleSampler::new(nwalkers, dim, &model)
            .map_err(|err| InferenceError::Sampler(err.to_string()))?;
        sampler.seed(&[self.seed as _]);

        let mut chain = Vec::with_capacity(self.niterations as usize * nwalkers * dim);
        let mut best_x = initial_guesses[0].values.clone();
        let mut best_ln_prob = f32::NEG_INFINITY;
        sampler
            .sample(&initial_guesses, self.niterations as usize, |step| {
                for (position, &ln_prob) in step.pos.iter().zip(step.lnprob.iter()) {
                    chain.extend(position.values.iter().map(|&v| v as f64));
                    if ln_prob > best_ln_prob {
                        best_x.clone_from(&position.values);
                        best_ln_prob = ln_prob;
                    }
                }
            })
            .map_err(|err| InferenceError::Sampler(err.to_string()))?;
        log::debug!(
            "MCMC finished {} steps of {nwalkers} walkers, best ln_prob = {best_ln_prob}",
            self.niterations
        );

        let nsamples = chain.len() / dim;
        let chain = Array2::from_shape_vec((nsamples, dim), chain)
            .map_err(|err| InferenceError::Sampler(err.to_string()))?;
        let x: Vec<f64> = best_x.iter().map(|&v| v as f64).collect();
        let ln_prob = objective.ln_prob(&x);
        Ok(McmcResult {
            best: InferenceResult {
                success: ln_prob.is_finite(),
                x,
                ln_prob,
            },
            chain,
        })
    }
}

impl Default for McmcSampler {
    fn default() -> Self {
        Self::new(
            Self::default_niterations(),
            Self::default_walkers_per_dim(),
            Self::default_ball_std(),
            Self::default_seed(),
        )
    }
}

/// Output of [McmcSampler::sample]
#[derive(Clone, Debug, PartialEq)]
pub struct McmcResult {
    /// Chain position with the largest log-posterior
    pub best: InferenceResult,
    /// Walker positions, `(niterations · nwalkers, dim)`, step-major
    pub chain: Array2<f64>,
}

struct EmceeObjective<'a> {
    objective: &'a dyn Objective,
}

impl EmceeObjective<'_> {
    fn params(guess: &Guess) -> Vec<f64> {
        guess.values.iter().map(|&v| v as f64).collect()
    }
}

impl Prob for EmceeObjective<'_> {
    fn lnlike(&self, params: &Guess) -> f32 {
        self.objective.ln_likelihood(&Self::params(params), None) as f32
    }

    fn lnprior(&self, params: &Guess) -> f32 {
        self.objective.ln_prior(&Self::params(params)) as f32
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

    use ndarray::{Array1, Axis};

    #[test]
    fn gaussian_chain() {
        let objective = gaussian();
        let sampler = McmcSampler::new(300, 8, 0.1, 0);
        let result = sampler.sample(&objective, &[0.5, -1.0]).unwrap();
        assert_eq!(result.chain.ncols(), 2);
        assert!(result.chain.nrows() > 0 && result.chain.nrows() % 16 == 0);
        assert!(result.best.success);
        assert!(objective.ln_prior(&result.best.x).is_finite());
        // every position stays inside of the prior box
        for row in result.chain.rows() {
            assert!(objective.ln_prior(row.as_slice().unwrap()).is_finite());
        }
        // means of the unit normals truncated by the prior box
        let mean = result.chain.mean_axis(Axis(0)).unwrap();
        assert!((mean[0] - 0.856).abs() < 0.25, "{mean}");
        assert!((mean[1] + 0.945).abs() < 0.25, "{mean}");
    }

    #[test]
    fn phase_curve_best_sample_is_finite() {
        let ops = Ops::new(DegreeConfig::unfiltered(1).unwrap()).unwrap();
        let theta = Array1::linspace(0.0, 6.0, 20);
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
        let err = Array1::from_elem(n, 1e-2);
        let truth = [0.1, 0.2, -0.15, 0.3];
        let observed = PhaseCurveLikelihood::new(&ops, &batch, &surface, Array1::zeros(n), err.clone())
            .unwrap()
            .model(&truth)
            .unwrap();
        let likelihood = PhaseCurveLikelihood::new(&ops, &batch, &surface, observed, err)
            .unwrap()
            .with_positivity(&ops, 8)
            .unwrap()
            .with_prior(LnPrior::ind_components(vec![
                LnPrior1D::uniform(-1.0, 1.0),
                LnPrior1D::uniform(-1.0, 1.0),
                LnPrior1D::uniform(-1.0, 1.0),
                LnPrior1D::log_uniform(1e-3, 1.0),
            ]))
            .unwrap();
        let sampler = McmcSampler::new(50, 4, 0.01, 3);
        let result = sampler.sample(&likelihood, &truth).unwrap();
        assert!(result.best.ln_prob.is_finite());
        assert_eq!(result.best.x.len(), 4);
        assert_eq!(result.chain.ncols(), 4);
    }

    #[test]
    fn wrong_dimension() {
        let sampler = McmcSampler::default();
        assert!(matches!(
            sampler.sample(&gaussian(), &[0.0, 0.0, 0.0]),
            Err(InferenceError::Dimension { expected: 2, actual: 3 })
        ));
    }
}
