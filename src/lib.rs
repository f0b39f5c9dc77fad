#![doc = include_str!("../README.md")]


pub mod basis;
pub use basis::ylm_index;

mod degree;
pub use degree::{DegreeConfig, MAX_DEGREE, n_coeffs};

mod error;
pub use error::{ConfigError, InferenceError, OperatorError, OpsError};

pub mod inference;
pub use inference::{
    CobylaMaxLikelihood, LnPrior, LnPrior1D, McmcSampler, Objective, PhaseCurveLikelihood,
};

pub mod ops;
pub use ops::{FluxGradient, Ops, Partition, Regime, SampleBatch, SurfaceParams};

pub mod orbit;
pub use orbit::KeplerOrbit;

pub mod provider;
pub use provider::{MathProvider, ReferenceProvider};

pub mod render;
pub use render::{GridCache, GridCacheConfig, Projection};

pub use ndarray;
