use crate::error::ConfigError;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Maximum spherical harmonic degree, both for the surface map and for the
/// total degree of the filtered map
pub const MAX_DEGREE: usize = 20;

/// Number of `(l, m)` coefficients up to degree `lmax` inclusive
#[inline]
pub const fn n_coeffs(lmax: usize) -> usize {
    (lmax + 1) * (lmax + 1)
}

/// Degrees of the surface map, the limb darkening law and the filter
///
/// The configuration is fixed at construction time and determines every
/// matrix dimension of the operator layer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(try_from = "DegreeConfigParameters", into = "DegreeConfigParameters")]
pub struct DegreeConfig {
    ydeg: usize,
    udeg: usize,
    fdeg: usize,
}

impl DegreeConfig {
    pub fn new(ydeg: usize, udeg: usize, fdeg: usize) -> Result<Self, ConfigError> {
        if ydeg > MAX_DEGREE {
            return Err(ConfigError::DegreeOutOfRange {
                name: "spherical harmonic",
                degree: ydeg,
                max: MAX_DEGREE,
            });
        }
        let total = ydeg + udeg + fdeg;
        if total > MAX_DEGREE {
            return Err(ConfigError::DegreeOutOfRange {
                name: "total",
                degree: total,
                max: MAX_DEGREE,
            });
        }
        Ok(Self { ydeg, udeg, fdeg })
    }

    /// Surface map without limb darkening and filter
    pub fn unfiltered(ydeg: usize) -> Result<Self, ConfigError> {
        Self::new(ydeg, 0, 0)
    }

    #[inline]
    pub fn ydeg(&self) -> usize {
        self.ydeg
    }

    #[inline]
    pub fn udeg(&self) -> usize {
        self.udeg
    }

    #[inline]
    pub fn fdeg(&self) -> usize {
        self.fdeg
    }

    /// Total degree of the filtered map
    #[inline]
    pub fn deg(&self) -> usize {
        self.ydeg + self.udeg + self.fdeg
    }

    /// Number of surface map coefficients
    #[inline]
    pub fn n_y(&self) -> usize {
        n_coeffs(self.ydeg)
    }

    /// Number of limb darkening coefficients, including the zeroth one
    #[inline]
    pub fn n_u(&self) -> usize {
        self.udeg + 1
    }

    /// Number of filter map coefficients
    #[inline]
    pub fn n_f(&self) -> usize {
        n_coeffs(self.fdeg)
    }

    /// Number of coefficients of the filtered map
    #[inline]
    pub fn n(&self) -> usize {
        n_coeffs(self.deg())
    }

    #[inline]
    pub fn has_filter(&self) -> bool {
        self.udeg > 0 || self.fdeg > 0
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename = "DegreeConfig")]
struct DegreeConfigParameters {
    ydeg: usize,
    #[serde(default)]
    udeg: usize,
    #[serde(default)]
    fdeg: usize,
}

impl From<DegreeConfig> for DegreeConfigParameters {
    fn from(c: DegreeConfig) -> Self {
        Self {
            ydeg: c.ydeg,
            udeg: c.udeg,
            fdeg: c.fdeg,
        }
    }
}

impl TryFrom<DegreeConfigParameters> for DegreeConfig {
    type Error = ConfigError;

    fn try_from(p: DegreeConfigParameters) -> Result<Self, Self::Error> {
        Self::new(p.ydeg, p.udeg, p.fdeg)
    }
}
