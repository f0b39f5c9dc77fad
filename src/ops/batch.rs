use crate::degree::DegreeConfig;
use crate::error::ConfigError;

use ndarray::{Array1, ArrayView1};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Per-sample geometry of an occultation light curve
///
/// `theta` is the rotational phase of the occulted body, `(xo, yo, zo)` the position of the
/// occultor in units of the occulted body radius with `z` towards the observer, and `ro` the
/// occultor radius. All arrays have the same length and their order is kept in every output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SampleBatchParameters", into = "SampleBatchParameters")]
pub struct SampleBatch {
    theta: Array1<f64>,
    xo: Array1<f64>,
    yo: Array1<f64>,
    zo: Array1<f64>,
    ro: Array1<f64>,
}

impl SampleBatch {
    pub fn new(
        theta: Array1<f64>,
        xo: Array1<f64>,
        yo: Array1<f64>,
        zo: Array1<f64>,
        ro: Array1<f64>,
    ) -> Result<Self, ConfigError> {
        let len = theta.len();
        for (what, x) in [
            ("occultor x positions", &xo),
            ("occultor y positions", &yo),
            ("occultor z positions", &zo),
            ("occultor radii", &ro),
        ] {
            if x.len() != len {
                return Err(ConfigError::ShapeMismatch {
                    what,
                    expected: len,
                    actual: x.len(),
                });
            }
        }
        if ro.iter().any(|&r| r.is_nan() || r < 0.0) {
            return Err(ConfigError::InvalidParameter(
                "occultor radius must be non-negative",
            ));
        }
        Ok(Self {
            theta,
            xo,
            yo,
            zo,
            ro,
        })
    }

    /// Batch with the same occultor radius for every sample
    pub fn with_radius(
        theta: Array1<f64>,
        xo: Array1<f64>,
        yo: Array1<f64>,
        zo: Array1<f64>,
        ro: f64,
    ) -> Result<Self, ConfigError> {
        let ro = Array1::from_elem(theta.len(), ro);
        Self::new(theta, xo, yo, zo, ro)
    }

    pub fn len(&self) -> usize {
        self.theta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.theta.is_empty()
    }

    pub fn theta(&self) -> ArrayView1<'_, f64> {
        self.theta.view()
    }

    pub fn xo(&self) -> ArrayView1<'_, f64> {
        self.xo.view()
    }

    pub fn yo(&self) -> ArrayView1<'_, f64> {
        self.yo.view()
    }

    pub fn zo(&self) -> ArrayView1<'_, f64> {
        self.zo.view()
    }

    pub fn ro(&self) -> ArrayView1<'_, f64> {
        self.ro.view()
    }

    /// Projected separation `hypot(xo, yo)` of every sample
    pub fn impact_parameter(&self) -> Array1<f64> {
        ndarray::Zip::from(&self.xo)
            .and(&self.yo)
            .map_collect(|&x, &y| x.hypot(y))
    }
}

impl JsonSchema for SampleBatch {
    fn is_referenceable() -> bool {
        false
    }

    fn schema_name() -> String {
        SampleBatchParameters::schema_name()
    }

    fn json_schema(r#gen: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        SampleBatchParameters::json_schema(r#gen)
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename = "SampleBatch")]
struct SampleBatchParameters {
    theta: Vec<f64>,
    xo: Vec<f64>,
    yo: Vec<f64>,
    zo: Vec<f64>,
    ro: Vec<f64>,
}

impl From<SampleBatch> for SampleBatchParameters {
    fn from(batch: SampleBatch) -> Self {
        Self {
            theta: batch.theta.to_vec(),
            xo: batch.xo.to_vec(),
            yo: batch.yo.to_vec(),
            zo: batch.zo.to_vec(),
            ro: batch.ro.to_vec(),
        }
    }
}

impl TryFrom<SampleBatchParameters> for SampleBatch {
    type Error = ConfigError;

    fn try_from(p: SampleBatchParameters) -> Result<Self, Self::Error> {
        Self::new(
            p.theta.into(),
            p.xo.into(),
            p.yo.into(),
            p.zo.into(),
            p.ro.into(),
        )
    }
}

/// Surface parameters shared by all samples of a batch
///
/// Angles are in radians. `y` holds the spherical harmonic coefficients of the surface map, `u`
/// the limb darkening coefficients with `u = [-1]` being uniform intensity, and `f` the filter
/// map coefficients with `f = [1]` being no filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurfaceParams {
    pub inc: f64,
    pub obl: f64,
    pub y: Array1<f64>,
    pub u: Array1<f64>,
    pub f: Array1<f64>,
}

impl SurfaceParams {
    /// Parameters of an unfiltered map
    pub fn new(inc: f64, obl: f64, y: Array1<f64>) -> Self {
        Self {
            inc,
            obl,
            y,
            u: Self::default_u(),
            f: Self::default_f(),
        }
    }

    #[inline]
    pub fn default_u() -> Array1<f64> {
        Array1::from_elem(1, -1.0)
    }

    #[inline]
    pub fn default_f() -> Array1<f64> {
        Array1::from_elem(1, 1.0)
    }

    pub fn with_limb_darkening(mut self, u: Array1<f64>) -> Self {
        self.u = u;
        self
    }

    pub fn with_filter(mut self, f: Array1<f64>) -> Self {
        self.f = f;
        self
    }

    /// Checks coefficient lengths against the degree configuration
    pub fn validate(&self, config: &DegreeConfig) -> Result<(), ConfigError> {
        for (what, x, expected) in [
            ("surface map coefficients", &self.y, config.n_y()),
            ("limb darkening coefficients", &self.u, config.n_u()),
            ("filter coefficients", &self.f, config.n_f()),
        ] {
            if x.len() != expected {
                return Err(ConfigError::ShapeMismatch {
                    what,
                    expected,
                    actual: x.len(),
                });
            }
        }
        Ok(())
    }
}

/// Gradient of a scalar with respect to every input of the flux computation
///
/// The occultor `z` position only selects the branch, its gradient is always zero.
#[derive(Clone, Debug, PartialEq)]
pub struct FluxGradient {
    pub theta: Array1<f64>,
    pub xo: Array1<f64>,
    pub yo: Array1<f64>,
    pub zo: Array1<f64>,
    pub ro: Array1<f64>,
    pub inc: f64,
    pub obl: f64,
    pub y: Array1<f64>,
    pub u: Array1<f64>,
    pub f: Array1<f64>,
}

impl FluxGradient {
    pub(crate) fn zeros(len: usize, config: &DegreeConfig) -> Self {
        Self {
            theta: Array1::zeros(len),
            xo: Array1::zeros(len),
            yo: Array1::zeros(len),
            zo: Array1::zeros(len),
            ro: Array1::zeros(len),
            inc: 0.0,
            obl: 0.0,
            y: Array1::zeros(config.n_y()),
            u: Array1::zeros(config.n_u()),
            f: Array1::zeros(config.n_f()),
        }
    }
}
