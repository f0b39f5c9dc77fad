//! Surface intensity on image grids

use crate::error::{ConfigError, OperatorError};
use crate::ops::operator::{DifferentiableOp, Operator, PolyBasisAtPoints};
use crate::provider::MathProvider;

use itertools::iproduct;
use ndarray::{Array1, Array2};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f64::consts::{FRAC_PI_2, PI};

const POLY_BASIS_AT_POINTS: Operator = Operator::PolyBasisAtPoints(PolyBasisAtPoints {});

/// Image projection of the surface
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Projection {
    /// Equirectangular latitude-longitude grid, `res × 2 res`
    ///
    /// The grid is fixed in the frame of the map: inclination and obliquity are not applied.
    Rectangular,
    /// The visible disk as seen by the observer, `res × res` over `[-1, 1]²`, points outside of
    /// the disk are NaN
    Orthographic,
}

impl Projection {
    pub fn height(&self, res: usize) -> usize {
        res
    }

    pub fn width(&self, res: usize) -> usize {
        match self {
            Self::Rectangular => 2 * res,
            Self::Orthographic => res,
        }
    }

    /// Cartesian coordinates of the grid points in row-major image order
    pub fn grid(&self, res: usize) -> [Array1<f64>; 3] {
        match self {
            Self::Rectangular => {
                let lon = Array1::linspace(-PI, PI, 2 * res) - FRAC_PI_2;
                let lat = Array1::linspace(-FRAC_PI_2, FRAC_PI_2, res);
                let n = lat.len() * lon.len();
                let mut x = Array1::zeros(n);
                let mut y = Array1::zeros(n);
                let mut z = Array1::zeros(n);
                for (i, (&lat, &lon)) in iproduct!(lat.iter(), lon.iter()).enumerate() {
                    let (sin_lat, cos_lat) = lat.sin_cos();
                    let (sin_lon, cos_lon) = lon.sin_cos();
                    // -90° about the x axis takes the latitude axis to y
                    x[i] = cos_lat * cos_lon;
                    y[i] = sin_lat;
                    z[i] = -cos_lat * sin_lon;
                }
                [x, y, z]
            }
            Self::Orthographic => {
                let axis = Array1::linspace(-1.0, 1.0, res);
                let n = res * res;
                let x = Array1::from_shape_fn(n, |i| axis[i % res]);
                let y = Array1::from_shape_fn(n, |i| axis[i / res]);
                let z = ndarray::Zip::from(&x)
                    .and(&y)
                    .map_collect(|&x, &y| f64::sqrt(1.0 - x * x - y * y));
                [x, y, z]
            }
        }
    }
}

/// Configuration of [GridCache]
///
/// `capacity` is the maximum number of cached grids and must be positive.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "GridCacheConfigParameters", into = "GridCacheConfigParameters")]
pub struct GridCacheConfig {
    capacity: usize,
}

impl GridCacheConfig {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidParameter(
                "grid cache capacity must be positive",
            ));
        }
        Ok(Self { capacity })
    }

    #[inline]
    pub fn default_capacity() -> usize {
        4
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for GridCacheConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
        }
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename = "GridCacheConfig")]
struct GridCacheConfigParameters {
    capacity: usize,
}

impl From<GridCacheConfig> for GridCacheConfigParameters {
    fn from(c: GridCacheConfig) -> Self {
        Self {
            capacity: c.capacity,
        }
    }
}

impl TryFrom<GridCacheConfigParameters> for GridCacheConfig {
    type Error = ConfigError;

    fn try_from(p: GridCacheConfigParameters) -> Result<Self, Self::Error> {
        Self::new(p.capacity)
    }
}

/// Polynomial basis on image grids keyed by projection and resolution
///
/// Holds at most `capacity` grids, the oldest one is evicted first.
#[derive(Clone, Debug)]
pub struct GridCache {
    config: GridCacheConfig,
    entries: VecDeque<((Projection, usize), Array2<f64>)>,
    evaluations: usize,
}

impl GridCache {
    pub fn new(config: GridCacheConfig) -> Self {
        Self {
            entries: VecDeque::with_capacity(config.capacity),
            config,
            evaluations: 0,
        }
    }

    pub fn config(&self) -> &GridCacheConfig {
        &self.config
    }

    /// Number of grid basis evaluations so far
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, projection: Projection, res: usize) -> bool {
        self.position(projection, res).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn position(&self, projection: Projection, res: usize) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| *key == (projection, res))
    }

    /// `(points, N)` polynomial basis on the grid, evaluated on a miss
    pub fn basis(
        &mut self,
        provider: &dyn MathProvider,
        projection: Projection,
        res: usize,
    ) -> Result<&Array2<f64>, OperatorError> {
        let index = match self.position(projection, res) {
            Some(index) => index,
            None => {
                log::debug!("grid cache miss for {projection:?} projection at resolution {res}");
                let [x, y, z] = projection.grid(res);
                let basis = POLY_BASIS_AT_POINTS.evaluate(
                    provider,
                    &[x.view().into_dyn(), y.view().into_dyn(), z.view().into_dyn()],
                )?;
                self.evaluations += 1;
                if self.entries.len() >= self.config.capacity {
                    if let Some((evicted, _)) = self.entries.pop_front() {
                        log::debug!("evicted {:?} grid at resolution {}", evicted.0, evicted.1);
                    }
                }
                self.entries.push_back(((projection, res), basis));
                self.entries.len() - 1
            }
        };
        Ok(&self.entries[index].1)
    }
}

impl Default for GridCache {
    fn default() -> Self {
        Self::new(GridCacheConfig::default())
    }
}
