use enum_dispatch::enum_dispatch;
use ordered_float::NotNan;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use std::fmt::Debug;
use std::hash::Hash;

#[enum_dispatch]
pub trait LnPrior1DTrait:
    Clone + Debug + Serialize + DeserializeOwned + PartialEq + Eq + Hash
{
    /// Natural logarithm of the prior density at `x`
    ///
    /// If `grad` is `Some`, `d ln_prior / dx` is written into it.
    fn ln_prior_1d(&self, x: f64, grad: Option<&mut f64>) -> f64;

    /// Interval outside of which the density is zero
    fn support(&self) -> (f64, f64) {
        (f64::NEG_INFINITY, f64::INFINITY)
    }
}

/// Natural logarithm of the prior of a single parameter
#[enum_dispatch(LnPrior1DTrait)]
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum LnPrior1D {
    None(NoneLnPrior1D),
    Uniform(UniformLnPrior1D),
    Normal(NormalLnPrior1D),
    LogUniform(LogUniformLnPrior1D),
}

impl LnPrior1D {
    pub fn none() -> Self {
        NoneLnPrior1D {}.into()
    }

    pub fn uniform(left: f64, right: f64) -> Self {
        UniformLnPrior1D::new(left, right).into()
    }

    pub fn normal(mu: f64, std: f64) -> Self {
        NormalLnPrior1D::new(mu, std).into()
    }

    pub fn log_uniform(left: f64, right: f64) -> Self {
        LogUniformLnPrior1D::new(left, right).into()
    }
}

fn write_grad(grad: Option<&mut f64>, value: f64) {
    if let Some(g) = grad {
        *g = value;
    }
}

/// Improper flat prior
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct NoneLnPrior1D {}

impl LnPrior1DTrait for NoneLnPrior1D {
    fn ln_prior_1d(&self, _x: f64, grad: Option<&mut f64>) -> f64 {
        write_grad(grad, 0.0);
        0.0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(into = "RangeParameters", from = "RangeParameters")]
pub struct UniformLnPrior1D {
    range: std::ops::RangeInclusive<NotNan<f64>>,
    ln_prob: NotNan<f64>,
}

impl UniformLnPrior1D {
    pub fn new(left: f64, right: f64) -> Self {
        assert!(left < right, "left must be less than right");
        let left = NotNan::new(left).expect("left must be not NaN");
        let right = NotNan::new(right).expect("right must be not NaN");
        Self {
            range: left..=right,
            ln_prob: NotNan::new(-f64::ln(right.into_inner() - left.into_inner()))
                .expect("range must be finite"),
        }
    }
}

impl LnPrior1DTrait for UniformLnPrior1D {
    fn ln_prior_1d(&self, x: f64, grad: Option<&mut f64>) -> f64 {
        write_grad(grad, 0.0);
        match NotNan::new(x) {
            Ok(x) if self.range.contains(&x) => self.ln_prob.into_inner(),
            _ => f64::NEG_INFINITY,
        }
    }

    fn support(&self) -> (f64, f64) {
        (
            self.range.start().into_inner(),
            self.range.end().into_inner(),
        )
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename = "UniformLnPrior1D")]
struct RangeParameters {
    left: f64,
    right: f64,
}

impl From<UniformLnPrior1D> for RangeParameters {
    fn from(p: UniformLnPrior1D) -> Self {
        let (left, right) = p.support();
        Self { left, right }
    }
}

impl From<RangeParameters> for UniformLnPrior1D {
    fn from(p: RangeParameters) -> Self {
        Self::new(p.left, p.right)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(into = "NormalParameters", from = "NormalParameters")]
pub struct NormalLnPrior1D {
    mu: NotNan<f64>,
    inv_std2: NotNan<f64>,
    ln_norm: NotNan<f64>,
}

impl NormalLnPrior1D {
    pub fn new(mu: f64, std: f64) -> Self {
        assert!(std > 0.0 && std.is_finite(), "std must be positive and finite");
        Self {
            mu: NotNan::new(mu).expect("mu must be not NaN"),
            inv_std2: NotNan::new(std.powi(-2)).expect("std must be positive and finite"),
            ln_norm: NotNan::new(-f64::ln(std) - 0.5 * f64::ln(TAU))
                .expect("std must be positive and finite"),
        }
    }

    fn mu(&self) -> f64 {
        self.mu.into_inner()
    }

    fn inv_std2(&self) -> f64 {
        self.inv_std2.into_inner()
    }
}

impl LnPrior1DTrait for NormalLnPrior1D {
    fn ln_prior_1d(&self, x: f64, grad: Option<&mut f64>) -> f64 {
        let diff = self.mu() - x;
        write_grad(grad, diff * self.inv_std2());
        self.ln_norm.into_inner() - 0.5 * diff * diff * self.inv_std2()
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename = "NormalLnPrior1D")]
struct NormalParameters {
    mu: f64,
    std: f64,
}

impl From<NormalLnPrior1D> for NormalParameters {
    fn from(p: NormalLnPrior1D) -> Self {
        Self {
            mu: p.mu(),
            std: p.inv_std2().recip().sqrt(),
        }
    }
}

impl From<NormalParameters> for NormalLnPrior1D {
    fn from(p: NormalParameters) -> Self {
        Self::new(p.mu, p.std)
    }
}

/// Density proportional to `1 / x` on `[left, right]`
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(into = "LogRangeParameters", from = "LogRangeParameters")]
pub struct LogUniformLnPrior1D {
    ln_range: std::ops::RangeInclusive<NotNan<f64>>,
    ln_norm: NotNan<f64>,
}

impl LogUniformLnPrior1D {
    pub fn new(left: f64, right: f64) -> Self {
        assert!(0.0 < left && left < right, "0 < left < right is required");
        let ln_left = NotNan::new(left.ln()).expect("left must be positive");
        let ln_right = NotNan::new(right.ln()).expect("right must be finite");
        Self {
            ln_range: ln_left..=ln_right,
            ln_norm: NotNan::new(-f64::ln(ln_right.into_inner() - ln_left.into_inner()))
                .expect("range must be finite"),
        }
    }
}

impl LnPrior1DTrait for LogUniformLnPrior1D {
    fn ln_prior_1d(&self, x: f64, grad: Option<&mut f64>) -> f64 {
        match NotNan::new(x.ln()) {
            Ok(ln_x) if self.ln_range.contains(&ln_x) => {
                write_grad(grad, -1.0 / x);
                self.ln_norm.into_inner() - ln_x.into_inner()
            }
            _ => {
                write_grad(grad, 0.0);
                f64::NEG_INFINITY
            }
        }
    }

    fn support(&self) -> (f64, f64) {
        (
            self.ln_range.start().into_inner().exp(),
            self.ln_range.end().into_inner().exp(),
        )
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename = "LogUniformLnPrior1D")]
struct LogRangeParameters {
    left: f64,
    right: f64,
}

impl From<LogUniformLnPrior1D> for LogRangeParameters {
    fn from(p: LogUniformLnPrior1D) -> Self {
        let (left, right) = p.support();
        Self { left, right }
    }
}

impl From<LogRangeParameters> for LogUniformLnPrior1D {
    fn from(p: LogRangeParameters) -> Self {
        Self::new(p.left, p.right)
    }
}

/// Natural logarithm of the prior of a parameter vector
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum LnPrior {
    None(NoneLnPrior),
    IndComponents(IndComponentsLnPrior),
}

impl LnPrior {
    pub fn none() -> Self {
        Self::None(NoneLnPrior {})
    }

    pub fn ind_components(components: Vec<LnPrior1D>) -> Self {
        Self::IndComponents(IndComponentsLnPrior { components })
    }

    /// Number of parameters the prior is defined for, any for [LnPrior::None]
    pub fn dim(&self) -> Option<usize> {
        match self {
            Self::None(_) => None,
            Self::IndComponents(p) => Some(p.components.len()),
        }
    }

    /// `ln_prior(params)`, `jac` receives the gradient when given
    ///
    /// `params` must have [LnPrior::dim] elements.
    pub fn ln_prior(&self, params: &[f64], jac: Option<&mut [f64]>) -> f64 {
        match self {
            Self::None(_) => {
                if let Some(jac) = jac {
                    jac.fill(0.0);
                }
                0.0
            }
            Self::IndComponents(p) => p.ln_prior(params, jac),
        }
    }

    /// Support of every component, unbounded ones are infinite
    pub fn support(&self, dim: usize) -> Vec<(f64, f64)> {
        match self {
            Self::None(_) => vec![(f64::NEG_INFINITY, f64::INFINITY); dim],
            Self::IndComponents(p) => p.components.iter().map(|c| c.support()).collect(),
        }
    }
}

impl Default for LnPrior {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct NoneLnPrior {}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct IndComponentsLnPrior {
    pub components: Vec<LnPrior1D>,
}

impl IndComponentsLnPrior {
    fn ln_prior(&self, params: &[f64], jac: Option<&mut [f64]>) -> f64 {
        match jac {
            Some(jac) => params
                .iter()
                .zip(self.components.iter())
                .zip(jac.iter_mut())
                .map(|((&x, prior), g)| prior.ln_prior_1d(x, Some(g)))
                .sum(),
            None => params
                .iter()
                .zip(self.components.iter())
                .map(|(&x, prior)| prior.ln_prior_1d(x, None))
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::tests::assert_gradient;

    use approx::assert_relative_eq;

    #[test]
    fn uniform() {
        let prior = LnPrior1D::uniform(-1.0, 3.0);
        assert_relative_eq!(prior.ln_prior_1d(0.0, None), -f64::ln(4.0));
        assert_eq!(prior.ln_prior_1d(3.5, None), f64::NEG_INFINITY);
        assert_eq!(prior.ln_prior_1d(f64::NAN, None), f64::NEG_INFINITY);
        assert_eq!(prior.support(), (-1.0, 3.0));
    }

    #[test]
    fn normal_value_and_gradient() {
        let prior = LnPrior1D::normal(0.5, 2.0);
        let expected = -f64::ln(2.0) - 0.5 * f64::ln(TAU) - 0.5 * (1.5f64 / 2.0).powi(2);
        assert_relative_eq!(prior.ln_prior_1d(2.0, None), expected, max_relative = 1e-12);
        for x in [-1.0, 0.5, 3.0] {
            let mut grad = 0.0;
            prior.ln_prior_1d(x, Some(&mut grad));
            assert_gradient(|x| prior.ln_prior_1d(x, None), x, grad);
        }
    }

    #[test]
    fn log_uniform_value_and_gradient() {
        let prior = LnPrior1D::log_uniform(1e-3, 1e-1);
        let norm = f64::ln(f64::ln(100.0));
        assert_relative_eq!(
            prior.ln_prior_1d(1e-2, None),
            -norm - f64::ln(1e-2),
            max_relative = 1e-12
        );
        assert_eq!(prior.ln_prior_1d(-1.0, None), f64::NEG_INFINITY);
        assert_eq!(prior.ln_prior_1d(1.0, None), f64::NEG_INFINITY);
        let mut grad = 0.0;
        prior.ln_prior_1d(0.05, Some(&mut grad));
        assert_gradient(|x| prior.ln_prior_1d(x, None), 0.05, grad);
        let (left, right) = prior.support();
        assert_relative_eq!(left, 1e-3, max_relative = 1e-12);
        assert_relative_eq!(right, 1e-1, max_relative = 1e-12);
    }

    #[test]
    fn independent_components() {
        let prior = LnPrior::ind_components(vec![
            LnPrior1D::normal(0.0, 1.0),
            LnPrior1D::uniform(0.0, 2.0),
            LnPrior1D::none(),
        ]);
        assert_eq!(prior.dim(), Some(3));
        let mut jac = [1.0; 3];
        let value = prior.ln_prior(&[0.3, 1.0, 7.0], Some(&mut jac[..]));
        assert_relative_eq!(
            value,
            -0.5 * f64::ln(TAU) - 0.045 - f64::ln(2.0),
            max_relative = 1e-12
        );
        assert_relative_eq!(jac[0], -0.3, max_relative = 1e-12);
        assert_eq!(jac[1..], [0.0, 0.0]);
        assert_eq!(prior.ln_prior(&[0.3, 2.5, 7.0], None), f64::NEG_INFINITY);
        assert_eq!(
            prior.support(3),
            vec![
                (f64::NEG_INFINITY, f64::INFINITY),
                (0.0, 2.0),
                (f64::NEG_INFINITY, f64::INFINITY)
            ]
        );
    }

    #[test]
    fn none_is_flat() {
        let prior = LnPrior::none();
        let mut jac = [1.0, 1.0];
        assert_eq!(prior.ln_prior(&[1e10, -3.0], Some(&mut jac[..])), 0.0);
        assert_eq!(jac, [0.0, 0.0]);
        assert_eq!(prior.dim(), None);
    }

    #[test]
    fn serialization() {
        let prior = LnPrior::ind_components(vec![
            LnPrior1D::uniform(-5.0, 5.0),
            LnPrior1D::log_uniform(1e-4, 1e-2),
            LnPrior1D::normal(1.0, 0.5),
        ]);
        let json = serde_json::to_string(&prior).unwrap();
        let back: LnPrior = serde_json::from_str(&json).unwrap();
        for x in [[0.0, 1e-3, 1.2], [4.0, 5e-3, 0.0]] {
            assert_relative_eq!(
                prior.ln_prior(&x, None),
                back.ln_prior(&x, None),
                max_relative = 1e-12
            );
        }
        let json = serde_json::to_string(&LnPrior1D::uniform(-5.0, 5.0)).unwrap();
        assert_eq!(json, r#"{"Uniform":{"left":-5.0,"right":5.0}}"#);
    }
}
