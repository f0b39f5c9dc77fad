use crate::basis::{poly_basis, poly_basis_vjp};
use crate::error::{ConfigError, OperatorError};
use crate::ops::rank::RankAdapter;
use crate::provider::MathProvider;
use crate::provider::wigner::row_degree;

use enum_dispatch::enum_dispatch;
use ndarray::{Array1, Array2, ArrayD, ArrayView2, ArrayViewD, arr0};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag of a [DifferentiableOp], used to report which operator failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum OperatorKind {
    RotatePolar,
    RotateFrame,
    RotateFrameTranspose,
    SolutionVector,
    PolyBasisAtPoints,
    FilterMatrix,
}

impl OperatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RotatePolar => "RotatePolar",
            Self::RotateFrame => "RotateFrame",
            Self::RotateFrameTranspose => "RotateFrameTranspose",
            Self::SolutionVector => "SolutionVector",
            Self::PolyBasisAtPoints => "PolyBasisAtPoints",
            Self::FilterMatrix => "FilterMatrix",
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Node of the flux computation with forward evaluation and reverse-mode gradient
#[enum_dispatch]
pub trait DifferentiableOp {
    fn kind(&self) -> OperatorKind;

    /// Number of inputs
    fn arity(&self) -> usize;

    /// Shape of the output for inputs of the given shapes, inputs are validated the same way
    /// [DifferentiableOp::evaluate] validates them
    fn infer_output_shape(
        &self,
        provider: &dyn MathProvider,
        shapes: &[&[usize]],
    ) -> Result<(usize, usize), OperatorError>;

    fn evaluate(
        &self,
        provider: &dyn MathProvider,
        inputs: &[ArrayViewD<f64>],
    ) -> Result<Array2<f64>, OperatorError>;

    /// Vector-Jacobian product: gradients with respect to every input, each of the same shape as
    /// the input
    fn gradient(
        &self,
        provider: &dyn MathProvider,
        inputs: &[ArrayViewD<f64>],
        output_gradient: ArrayView2<f64>,
    ) -> Result<Vec<ArrayD<f64>>, OperatorError>;
}

/// Closed set of differentiable operators
#[enum_dispatch(DifferentiableOp)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[non_exhaustive]
pub enum Operator {
    RotatePolar,
    RotateFrame,
    RotateFrameTranspose,
    SolutionVector,
    PolyBasisAtPoints,
    FilterMatrix,
}

fn check_arity(op: OperatorKind, expected: usize, actual: usize) -> Result<(), OperatorError> {
    if expected == actual {
        Ok(())
    } else {
        Err(OperatorError::Arity {
            op,
            expected,
            actual,
        })
    }
}

fn check_rank(
    op: OperatorKind,
    index: usize,
    shape: &[usize],
    allowed: &[usize],
    expected: &'static str,
) -> Result<RankAdapter, OperatorError> {
    if allowed.contains(&shape.len()) {
        Ok(RankAdapter::new(shape))
    } else {
        Err(OperatorError::Rank {
            op,
            index,
            expected,
            actual: shape.len(),
        })
    }
}

fn input_error(op: OperatorKind, index: usize) -> impl FnOnce(ConfigError) -> OperatorError {
    move |source| OperatorError::Input { op, index, source }
}

fn reshape_error(
    op: OperatorKind,
    index: usize,
    adapter: &RankAdapter,
    actual: usize,
) -> impl FnOnce(ndarray::ShapeError) -> OperatorError {
    let expected = adapter.len();
    move |_| OperatorError::Input {
        op,
        index,
        source: ConfigError::ShapeMismatch {
            what: "reshaped array",
            expected,
            actual,
        },
    }
}

/// Rank-1 or rank-2 input as a matrix
fn matrix_input(
    op: OperatorKind,
    index: usize,
    x: &ArrayViewD<f64>,
) -> Result<(RankAdapter, Array2<f64>), OperatorError> {
    let adapter = check_rank(op, index, x.shape(), &[1, 2], "1 or 2")?;
    let matrix = adapter
        .to_matrix(x.view())
        .map_err(reshape_error(op, index, &adapter, x.len()))?;
    Ok((adapter, matrix))
}

/// Rank-0 or rank-1 input as a vector
fn vector_input(
    op: OperatorKind,
    index: usize,
    x: &ArrayViewD<f64>,
) -> Result<(RankAdapter, Array1<f64>), OperatorError> {
    let adapter = check_rank(op, index, x.shape(), &[0, 1], "0 or 1")?;
    let vector = adapter
        .to_vector(x.view())
        .map_err(reshape_error(op, index, &adapter, x.len()))?;
    Ok((adapter, vector))
}

fn scalar_input(op: OperatorKind, index: usize, x: &ArrayViewD<f64>) -> Result<f64, OperatorError> {
    check_rank(op, index, x.shape(), &[0], "0")?;
    x.first().copied().ok_or(OperatorError::Rank {
        op,
        index,
        expected: "0",
        actual: x.ndim(),
    })
}

fn restore<D: ndarray::Dimension>(
    op: OperatorKind,
    index: usize,
    adapter: &RankAdapter,
    x: ndarray::Array<f64, D>,
) -> Result<ArrayD<f64>, OperatorError> {
    let actual = x.len();
    adapter
        .restore(x)
        .map_err(reshape_error(op, index, adapter, actual))
}

fn harmonic_width(
    op: OperatorKind,
    index: usize,
    provider: &dyn MathProvider,
    width: usize,
) -> Result<(), OperatorError> {
    row_degree("operand rows", width, provider.config().deg())
        .map(|_| ())
        .map_err(input_error(op, index))
}

/// Shape of a rank-1 or rank-2 operand coerced to a matrix
fn matrix_shape(
    op: OperatorKind,
    index: usize,
    shape: &[usize],
) -> Result<(usize, usize), OperatorError> {
    Ok(check_rank(op, index, shape, &[1, 2], "1 or 2")?.matrix_shape())
}

fn vector_len(op: OperatorKind, index: usize, shape: &[usize]) -> Result<usize, OperatorError> {
    Ok(check_rank(op, index, shape, &[0, 1], "0 or 1")?.len())
}

/// Common length of rank-0 and rank-1 inputs, rank-0 inputs are broadcast
fn broadcast_len(op: OperatorKind, shapes: &[&[usize]]) -> Result<usize, OperatorError> {
    let mut len = None;
    for (index, shape) in shapes.iter().enumerate() {
        let n = vector_len(op, index, shape)?;
        if shape.is_empty() {
            continue;
        }
        match len {
            None => len = Some(n),
            Some(expected) if expected != n => {
                return Err(OperatorError::Input {
                    op,
                    index,
                    source: ConfigError::ShapeMismatch {
                        what: "batched input",
                        expected,
                        actual: n,
                    },
                });
            }
            Some(_) => {}
        }
    }
    Ok(len.unwrap_or(1))
}

/// Rotation of coefficient rows about the polar axis by per-row angles
///
/// Inputs are `M` of shape `(n,)`, `(1, n)` or `(K, n)` and `theta` of shape `()` or `(K,)`.
/// The output is `(K, n)`, a single row of `M` is broadcast over the angles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct RotatePolar {}

impl DifferentiableOp for RotatePolar {
    fn kind(&self) -> OperatorKind {
        OperatorKind::RotatePolar
    }

    fn arity(&self) -> usize {
        2
    }

    fn infer_output_shape(
        &self,
        provider: &dyn MathProvider,
        shapes: &[&[usize]],
    ) -> Result<(usize, usize), OperatorError> {
        let op = self.kind();
        check_arity(op, self.arity(), shapes.len())?;
        let (rows, width) = matrix_shape(op, 0, shapes[0])?;
        harmonic_width(op, 0, provider, width)?;
        let k = vector_len(op, 1, shapes[1])?;
        if rows != 1 && rows != k {
            return Err(OperatorError::Input {
                op,
                index: 1,
                source: ConfigError::ShapeMismatch {
                    what: "number of angles",
                    expected: rows,
                    actual: k,
                },
            });
        }
        Ok((k, width))
    }

    fn evaluate(
        &self,
        provider: &dyn MathProvider,
        inputs: &[ArrayViewD<f64>],
    ) -> Result<Array2<f64>, OperatorError> {
        let op = self.kind();
        check_arity(op, self.arity(), inputs.len())?;
        let (_, m) = matrix_input(op, 0, &inputs[0])?;
        let (_, theta) = vector_input(op, 1, &inputs[1])?;
        let result = provider
            .rotate_polar(m.view(), theta.view(), None)
            .map_err(OperatorError::provider(op))?;
        Ok(result.value)
    }

    fn gradient(
        &self,
        provider: &dyn MathProvider,
        inputs: &[ArrayViewD<f64>],
        output_gradient: ArrayView2<f64>,
    ) -> Result<Vec<ArrayD<f64>>, OperatorError> {
        let op = self.kind();
        check_arity(op, self.arity(), inputs.len())?;
        let (m_adapter, m) = matrix_input(op, 0, &inputs[0])?;
        let (theta_adapter, theta) = vector_input(op, 1, &inputs[1])?;
        let (bm, btheta) = provider
            .rotate_polar(m.view(), theta.view(), Some(output_gradient))
            .map_err(OperatorError::provider(op))?
            .vjp
            .ok_or(OperatorError::MissingGradient { op })?;
        Ok(vec![
            restore(op, 0, &m_adapter, bm)?,
            restore(op, 1, &theta_adapter, btheta)?,
        ])
    }
}

macro_rules! frame_rotation {
    ($name: ident, $method: ident, $doc: literal) => {
        #[doc = $doc]
        ///
        /// Inputs are `M` of shape `(n,)` or `(K, n)`, the inclination and the obliquity, both of
        /// shape `()`. The output is `(K, n)`.
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
        )]
        pub struct $name {}

        impl DifferentiableOp for $name {
            fn kind(&self) -> OperatorKind {
                OperatorKind::$name
            }

            fn arity(&self) -> usize {
                3
            }

            fn infer_output_shape(
                &self,
                provider: &dyn MathProvider,
                shapes: &[&[usize]],
            ) -> Result<(usize, usize), OperatorError> {
                let op = self.kind();
                check_arity(op, self.arity(), shapes.len())?;
                let (rows, width) = matrix_shape(op, 0, shapes[0])?;
                harmonic_width(op, 0, provider, width)?;
                check_rank(op, 1, shapes[1], &[0], "0")?;
                check_rank(op, 2, shapes[2], &[0], "0")?;
                Ok((rows, width))
            }

            fn evaluate(
                &self,
                provider: &dyn MathProvider,
                inputs: &[ArrayViewD<f64>],
            ) -> Result<Array2<f64>, OperatorError> {
                let op = self.kind();
                check_arity(op, self.arity(), inputs.len())?;
                let (_, m) = matrix_input(op, 0, &inputs[0])?;
                let inc = scalar_input(op, 1, &inputs[1])?;
                let obl = scalar_input(op, 2, &inputs[2])?;
                let result = provider
                    .$method(m.view(), inc, obl, None)
                    .map_err(OperatorError::provider(op))?;
                Ok(result.value)
            }

            fn gradient(
                &self,
                provider: &dyn MathProvider,
                inputs: &[ArrayViewD<f64>],
                output_gradient: ArrayView2<f64>,
            ) -> Result<Vec<ArrayD<f64>>, OperatorError> {
                let op = self.kind();
                check_arity(op, self.arity(), inputs.len())?;
                let (m_adapter, m) = matrix_input(op, 0, &inputs[0])?;
                let inc = scalar_input(op, 1, &inputs[1])?;
                let obl = scalar_input(op, 2, &inputs[2])?;
                let (bm, binc, bobl) = provider
                    .$method(m.view(), inc, obl, Some(output_gradient))
                    .map_err(OperatorError::provider(op))?
                    .vjp
                    .ok_or(OperatorError::MissingGradient { op })?;
                Ok(vec![
                    restore(op, 0, &m_adapter, bm)?,
                    arr0(binc).into_dyn(),
                    arr0(bobl).into_dyn(),
                ])
            }
        }
    };
}

frame_rotation!(
    RotateFrame,
    rotate_frame,
    "Rotation of coefficient rows from the stellar frame into the observer frame, `M · D(Q)ᵀ`"
);

frame_rotation!(
    RotateFrameTranspose,
    rotate_frame_transpose,
    "Rotation of coefficient rows from the observer frame into the stellar frame, `M · D(Q)`"
);

/// Occultation solution vectors
///
/// Inputs are the impact parameter `b` and the occultor radius `r`, each of shape `()` or
/// `(K,)`; rank-0 inputs are broadcast. The output is `(K, N)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct SolutionVector {}

impl SolutionVector {
    fn broadcast_inputs(
        &self,
        inputs: &[ArrayViewD<f64>],
    ) -> Result<[(RankAdapter, Array1<f64>); 2], OperatorError> {
        let op = self.kind();
        check_arity(op, self.arity(), inputs.len())?;
        let k = broadcast_len(op, &[inputs[0].shape(), inputs[1].shape()])?;
        let broadcast = |index: usize| -> Result<(RankAdapter, Array1<f64>), OperatorError> {
            let (adapter, x) = vector_input(op, index, &inputs[index])?;
            let x = if adapter.rank() == 0 {
                Array1::from_elem(k, x[0])
            } else {
                x
            };
            Ok((adapter, x))
        };
        Ok([broadcast(0)?, broadcast(1)?])
    }
}

impl DifferentiableOp for SolutionVector {
    fn kind(&self) -> OperatorKind {
        OperatorKind::SolutionVector
    }

    fn arity(&self) -> usize {
        2
    }

    fn infer_output_shape(
        &self,
        provider: &dyn MathProvider,
        shapes: &[&[usize]],
    ) -> Result<(usize, usize), OperatorError> {
        let op = self.kind();
        check_arity(op, self.arity(), shapes.len())?;
        Ok((broadcast_len(op, shapes)?, provider.config().n()))
    }

    fn evaluate(
        &self,
        provider: &dyn MathProvider,
        inputs: &[ArrayViewD<f64>],
    ) -> Result<Array2<f64>, OperatorError> {
        let [(_, b), (_, r)] = self.broadcast_inputs(inputs)?;
        let result = provider
            .solution_vector(b.view(), r.view(), None)
            .map_err(OperatorError::provider(self.kind()))?;
        Ok(result.value)
    }

    fn gradient(
        &self,
        provider: &dyn MathProvider,
        inputs: &[ArrayViewD<f64>],
        output_gradient: ArrayView2<f64>,
    ) -> Result<Vec<ArrayD<f64>>, OperatorError> {
        let op = self.kind();
        let [(b_adapter, b), (r_adapter, r)] = self.broadcast_inputs(inputs)?;
        let [bb, br] = provider
            .solution_vector(b.view(), r.view(), Some(output_gradient))
            .map_err(OperatorError::provider(op))?
            .vjp
            .ok_or(OperatorError::MissingGradient { op })?;
        let reduce = |index, adapter: &RankAdapter, g: Array1<f64>| {
            if adapter.rank() == 0 {
                Ok(arr0(g.sum()).into_dyn())
            } else {
                restore(op, index, adapter, g)
            }
        };
        Ok(vec![reduce(0, &b_adapter, bb)?, reduce(1, &r_adapter, br)?])
    }
}

/// Polynomial basis evaluated at surface points
///
/// Inputs are the `x`, `y` and `z` coordinates, arrays of any rank sharing one shape. The output
/// is `(P, N)` with `P` points taken in logical order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct PolyBasisAtPoints {}

impl PolyBasisAtPoints {
    fn points(
        &self,
        inputs: &[ArrayViewD<f64>],
    ) -> Result<(RankAdapter, [Array1<f64>; 3]), OperatorError> {
        let op = self.kind();
        check_arity(op, self.arity(), inputs.len())?;
        let adapter = RankAdapter::new(inputs[0].shape());
        let flatten = |index: usize| -> Result<Array1<f64>, OperatorError> {
            let x = &inputs[index];
            if x.shape() != adapter.shape() {
                return Err(OperatorError::Input {
                    op,
                    index,
                    source: ConfigError::ShapeMismatch {
                        what: "point coordinates",
                        expected: adapter.len(),
                        actual: x.len(),
                    },
                });
            }
            adapter
                .to_vector(x.view())
                .map_err(reshape_error(op, index, &adapter, x.len()))
        };
        let coords = [flatten(0)?, flatten(1)?, flatten(2)?];
        Ok((adapter, coords))
    }
}

impl DifferentiableOp for PolyBasisAtPoints {
    fn kind(&self) -> OperatorKind {
        OperatorKind::PolyBasisAtPoints
    }

    fn arity(&self) -> usize {
        3
    }

    fn infer_output_shape(
        &self,
        provider: &dyn MathProvider,
        shapes: &[&[usize]],
    ) -> Result<(usize, usize), OperatorError> {
        let op = self.kind();
        check_arity(op, self.arity(), shapes.len())?;
        for (index, shape) in shapes.iter().enumerate().skip(1) {
            if *shape != shapes[0] {
                return Err(OperatorError::Input {
                    op,
                    index,
                    source: ConfigError::ShapeMismatch {
                        what: "point coordinates",
                        expected: shapes[0].iter().product(),
                        actual: shape.iter().product(),
                    },
                });
            }
        }
        Ok((shapes[0].iter().product(), provider.config().n()))
    }

    fn evaluate(
        &self,
        provider: &dyn MathProvider,
        inputs: &[ArrayViewD<f64>],
    ) -> Result<Array2<f64>, OperatorError> {
        let (_, [x, y, z]) = self.points(inputs)?;
        Ok(poly_basis(
            provider.config().deg(),
            x.view(),
            y.view(),
            z.view(),
        ))
    }

    fn gradient(
        &self,
        provider: &dyn MathProvider,
        inputs: &[ArrayViewD<f64>],
        output_gradient: ArrayView2<f64>,
    ) -> Result<Vec<ArrayD<f64>>, OperatorError> {
        let op = self.kind();
        let (adapter, [x, y, z]) = self.points(inputs)?;
        let expected = (x.len(), provider.config().n());
        if output_gradient.dim() != expected {
            return Err(OperatorError::Input {
                op,
                index: 0,
                source: ConfigError::ShapeMismatch {
                    what: "output gradient",
                    expected: expected.0 * expected.1,
                    actual: output_gradient.len(),
                },
            });
        }
        let [bx, by, bz] = poly_basis_vjp(
            provider.config().deg(),
            x.view(),
            y.view(),
            z.view(),
            output_gradient,
        );
        Ok(vec![
            restore(op, 0, &adapter, bx)?,
            restore(op, 1, &adapter, by)?,
            restore(op, 2, &adapter, bz)?,
        ])
    }
}

/// Limb darkening and filter matrix `F(u, f)`
///
/// Inputs are `u` of shape `(udeg + 1,)` and `f` of shape `((fdeg + 1)²,)`, the output is
/// `(N, Ny)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct FilterMatrix {}

impl DifferentiableOp for FilterMatrix {
    fn kind(&self) -> OperatorKind {
        OperatorKind::FilterMatrix
    }

    fn arity(&self) -> usize {
        2
    }

    fn infer_output_shape(
        &self,
        provider: &dyn MathProvider,
        shapes: &[&[usize]],
    ) -> Result<(usize, usize), OperatorError> {
        let op = self.kind();
        check_arity(op, self.arity(), shapes.len())?;
        let config = provider.config();
        for (index, (shape, expected)) in shapes
            .iter()
            .zip([config.n_u(), config.n_f()])
            .enumerate()
        {
            check_rank(op, index, shape, &[1], "1")?;
            if shape[0] != expected {
                return Err(OperatorError::Input {
                    op,
                    index,
                    source: ConfigError::ShapeMismatch {
                        what: "filter coefficients",
                        expected,
                        actual: shape[0],
                    },
                });
            }
        }
        Ok((config.n(), config.n_y()))
    }

    fn evaluate(
        &self,
        provider: &dyn MathProvider,
        inputs: &[ArrayViewD<f64>],
    ) -> Result<Array2<f64>, OperatorError> {
        let op = self.kind();
        check_arity(op, self.arity(), inputs.len())?;
        let (_, u) = vector_input(op, 0, &inputs[0])?;
        let (_, f) = vector_input(op, 1, &inputs[1])?;
        let result = provider
            .filter_matrix(u.view(), f.view(), None)
            .map_err(OperatorError::provider(op))?;
        Ok(result.value)
    }

    fn gradient(
        &self,
        provider: &dyn MathProvider,
        inputs: &[ArrayViewD<f64>],
        output_gradient: ArrayView2<f64>,
    ) -> Result<Vec<ArrayD<f64>>, OperatorError> {
        let op = self.kind();
        check_arity(op, self.arity(), inputs.len())?;
        let (u_adapter, u) = vector_input(op, 0, &inputs[0])?;
        let (f_adapter, f) = vector_input(op, 1, &inputs[1])?;
        let (bu, bf) = provider
            .filter_matrix(u.view(), f.view(), Some(output_gradient))
            .map_err(OperatorError::provider(op))?
            .vjp
            .ok_or(OperatorError::MissingGradient { op })?;
        Ok(vec![
            restore(op, 0, &u_adapter, bu)?,
            restore(op, 1, &f_adapter, bf)?,
        ])
    }
}
