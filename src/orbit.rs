use crate::error::ConfigError;
use crate::ops::SampleBatch;

use ndarray::{Array1, ArrayView1};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, TAU};

/// Upper bound of Newton iterations for Kepler's equation
pub const MAX_KEPLER_ITERATIONS: usize = 100;

const KEPLER_TOLERANCE: f64 = 1e-12;

/// Eccentric anomaly `E` solving `E - e sin E = M`
///
/// Newton iterations stop after [MAX_KEPLER_ITERATIONS], the last iterate is returned if the
/// tolerance is not reached by then.
pub fn eccentric_anomaly(mean_anomaly: f64, ecc: f64) -> f64 {
    let m = mean_anomaly.rem_euclid(TAU);
    if ecc == 0.0 {
        return m;
    }
    let mut e = if ecc > 0.8 { std::f64::consts::PI } else { m };
    for _ in 0..MAX_KEPLER_ITERATIONS {
        let (sin_e, cos_e) = e.sin_cos();
        let step = (e - ecc * sin_e - m) / (1.0 - ecc * cos_e);
        e -= step;
        if step.abs() < KEPLER_TOLERANCE {
            return e;
        }
    }
    log::debug!("Kepler's equation did not converge for M = {m}, e = {ecc}");
    e
}

/// Keplerian orbit of an occultor around the occulted body
///
/// Distances are in units of the occulted body radius and angles in radians. `t0` is the time of
/// periastron passage, `omega` the argument of periastron and `inc` the orbital inclination,
/// the longitude of the ascending node is zero. The occultor transits when `omega + f = π / 2`
/// where `f` is the true anomaly. The occulted body rotates with period `prot` and has phase
/// `theta0` at `t0`, a `prot` of `None` keeps the phase at `theta0`.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(try_from = "KeplerOrbitParameters", into = "KeplerOrbitParameters")]
pub struct KeplerOrbit {
    period: f64,
    t0: f64,
    a: f64,
    inc: f64,
    ecc: f64,
    omega: f64,
    radius: f64,
    prot: Option<f64>,
    theta0: f64,
}

impl KeplerOrbit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        period: f64,
        t0: f64,
        a: f64,
        inc: f64,
        ecc: f64,
        omega: f64,
        radius: f64,
        prot: Option<f64>,
        theta0: f64,
    ) -> Result<Self, ConfigError> {
        if !(period > 0.0 && period.is_finite()) {
            return Err(ConfigError::InvalidParameter(
                "orbital period must be positive and finite",
            ));
        }
        if !(a > 0.0 && a.is_finite()) {
            return Err(ConfigError::InvalidParameter(
                "semi-major axis must be positive and finite",
            ));
        }
        if !(0.0..1.0).contains(&ecc) {
            return Err(ConfigError::InvalidParameter(
                "eccentricity must be in [0, 1)",
            ));
        }
        if !(radius >= 0.0 && radius.is_finite()) {
            return Err(ConfigError::InvalidParameter(
                "occultor radius must be non-negative and finite",
            ));
        }
        if prot.is_some_and(|prot| !(prot > 0.0 && prot.is_finite())) {
            return Err(ConfigError::InvalidParameter(
                "rotation period must be positive and finite",
            ));
        }
        if !(t0.is_finite() && inc.is_finite() && omega.is_finite() && theta0.is_finite()) {
            return Err(ConfigError::InvalidParameter(
                "orbit angles and reference time must be finite",
            ));
        }
        Ok(Self {
            period,
            t0,
            a,
            inc,
            ecc,
            omega,
            radius,
            prot,
            theta0,
        })
    }

    /// Circular edge-on orbit transiting at `t0` around a non-rotating body
    pub fn circular(period: f64, t0: f64, a: f64, radius: f64) -> Result<Self, ConfigError> {
        Self::new(period, t0, a, FRAC_PI_2, 0.0, FRAC_PI_2, radius, None, 0.0)
    }

    #[inline]
    pub fn default_period() -> f64 {
        1.0
    }

    #[inline]
    pub fn default_a() -> f64 {
        10.0
    }

    #[inline]
    pub fn default_radius() -> f64 {
        0.1
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    pub fn t0(&self) -> f64 {
        self.t0
    }

    pub fn a(&self) -> f64 {
        self.a
    }

    pub fn inc(&self) -> f64 {
        self.inc
    }

    pub fn ecc(&self) -> f64 {
        self.ecc
    }

    pub fn omega(&self) -> f64 {
        self.omega
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn prot(&self) -> Option<f64> {
        self.prot
    }

    pub fn theta0(&self) -> f64 {
        self.theta0
    }

    /// Occultor position `[x, y, z]` at time `t`, `z` points towards the observer
    pub fn position(&self, t: f64) -> [f64; 3] {
        let mean_anomaly = TAU * (t - self.t0) / self.period;
        let e = eccentric_anomaly(mean_anomaly, self.ecc);
        let (sin_half, cos_half) = (0.5 * e).sin_cos();
        let true_anomaly = 2.0
            * f64::atan2(
                (1.0 + self.ecc).sqrt() * sin_half,
                (1.0 - self.ecc).sqrt() * cos_half,
            );
        let r = self.a * (1.0 - self.ecc * e.cos());
        let (sin_w, cos_w) = (self.omega + true_anomaly).sin_cos();
        let (sin_i, cos_i) = self.inc.sin_cos();
        [r * cos_w, r * sin_w * cos_i, r * sin_w * sin_i]
    }

    /// Rotational phase of the occulted body at time `t`
    pub fn phase(&self, t: f64) -> f64 {
        match self.prot {
            Some(prot) => self.theta0 + TAU * (t - self.t0) / prot,
            None => self.theta0,
        }
    }

    /// Sample batch at times `t`
    pub fn sample_batch(&self, t: ArrayView1<f64>) -> Result<SampleBatch, ConfigError> {
        let n = t.len();
        let mut xo = Array1::zeros(n);
        let mut yo = Array1::zeros(n);
        let mut zo = Array1::zeros(n);
        for (i, &t) in t.iter().enumerate() {
            [xo[i], yo[i], zo[i]] = self.position(t);
        }
        let theta = t.mapv(|t| self.phase(t));
        SampleBatch::with_radius(theta, xo, yo, zo, self.radius)
    }
}

impl Default for KeplerOrbit {
    fn default() -> Self {
        Self {
            period: Self::default_period(),
            t0: 0.0,
            a: Self::default_a(),
            inc: FRAC_PI_2,
            ecc: 0.0,
            omega: FRAC_PI_2,
            radius: Self::default_radius(),
            prot: Some(Self::default_period()),
            theta0: 0.0,
        }
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename = "KeplerOrbit")]
struct KeplerOrbitParameters {
    period: f64,
    t0: f64,
    a: f64,
    inc: f64,
    ecc: f64,
    omega: f64,
    radius: f64,
    #[serde(default)]
    prot: Option<f64>,
    theta0: f64,
}

impl From<KeplerOrbit> for KeplerOrbitParameters {
    fn from(o: KeplerOrbit) -> Self {
        Self {
            period: o.period,
            t0: o.t0,
            a: o.a,
            inc: o.inc,
            ecc: o.ecc,
            omega: o.omega,
            radius: o.radius,
            prot: o.prot,
            theta0: o.theta0,
        }
    }
}

impl TryFrom<KeplerOrbitParameters> for KeplerOrbit {
    type Error = ConfigError;

    fn try_from(p: KeplerOrbitParameters) -> Result<Self, Self::Error> {
        Self::new(
            p.period, p.t0, p.a, p.inc, p.ecc, p.omega, p.radius, p.prot, p.theta0,
        )
    }
}
