use crate::ops::operator::OperatorKind;

/// Error returned when a degree configuration or an input array is inconsistent
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name} degree {degree} is out of range, maximum is {max}")]
    DegreeOutOfRange {
        name: &'static str,
        degree: usize,
        max: usize,
    },

    #[error("{what} has length {actual}, {expected} is expected")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{what} has width {actual} which is not (l + 1)^2 for any supported l")]
    NotHarmonicWidth { what: &'static str, actual: usize },

    #[error("invalid spherical harmonic index l = {l}, m = {m} for lmax = {lmax}")]
    InvalidYlmIndex { l: usize, m: i64, lmax: usize },

    #[error("change of basis matrix of degree {0} is singular")]
    SingularBasis(usize),

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

/// Error of a single differentiable operator, tagged with the operator kind
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum OperatorError {
    #[error("{op}: {expected} inputs are expected, {actual} given")]
    Arity {
        op: OperatorKind,
        expected: usize,
        actual: usize,
    },

    #[error("{op}: input #{index} has rank {actual}, {expected} is expected")]
    Rank {
        op: OperatorKind,
        index: usize,
        expected: &'static str,
        actual: usize,
    },

    #[error("{op}: input #{index}: {source}")]
    Input {
        op: OperatorKind,
        index: usize,
        #[source]
        source: ConfigError,
    },

    #[error("{op}: provider returned no vector-Jacobian product")]
    MissingGradient { op: OperatorKind },

    #[error("{op}: {source}")]
    Provider {
        op: OperatorKind,
        #[source]
        source: ConfigError,
    },
}

impl OperatorError {
    pub fn provider(op: OperatorKind) -> impl FnOnce(ConfigError) -> Self {
        move |source| Self::Provider { op, source }
    }

    pub fn kind(&self) -> OperatorKind {
        match self {
            Self::Arity { op, .. }
            | Self::Rank { op, .. }
            | Self::Input { op, .. }
            | Self::MissingGradient { op }
            | Self::Provider { op, .. } => *op,
        }
    }
}

/// Error returned from [crate::Ops]
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum OpsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Operator(#[from] OperatorError),
}

/// Error returned from the inference drivers
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum InferenceError {
    #[error("parameter vector has length {actual}, {expected} is expected")]
    Dimension { expected: usize, actual: usize },

    #[error("no initial guess with finite prior found after {0} attempts")]
    NoValidInitialGuess(usize),

    #[error("sampler failed: {0}")]
    Sampler(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ops(#[from] OpsError),
}
