//! Basis and filter composition, and the three-stage rotation `dotR`

use crate::error::{ConfigError, OperatorError};
use crate::ops::operator::{
    DifferentiableOp, FilterMatrix, Operator, OperatorKind, RotateFrame, RotateFrameTranspose,
    RotatePolar,
};
use crate::provider::MathProvider;

use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, Ix1, Ix2, arr0};

pub(crate) const ROTATE_POLAR: Operator = Operator::RotatePolar(RotatePolar {});
pub(crate) const ROTATE_FRAME: Operator = Operator::RotateFrame(RotateFrame {});
pub(crate) const ROTATE_FRAME_TRANSPOSE: Operator =
    Operator::RotateFrameTranspose(RotateFrameTranspose {});
pub(crate) const FILTER_MATRIX: Operator = Operator::FilterMatrix(FilterMatrix {});

/// Converts an operator gradient back to the matrix it was computed for
pub(crate) fn into_matrix(
    op: OperatorKind,
    index: usize,
    x: ArrayD<f64>,
) -> Result<Array2<f64>, OperatorError> {
    let ndim = x.ndim();
    x.into_dimensionality::<Ix2>()
        .map_err(|_| OperatorError::Rank {
            op,
            index,
            expected: "2",
            actual: ndim,
        })
}

pub(crate) fn into_vector(
    op: OperatorKind,
    index: usize,
    x: ArrayD<f64>,
) -> Result<Array1<f64>, OperatorError> {
    let ndim = x.ndim();
    x.into_dimensionality::<Ix1>()
        .map_err(|_| OperatorError::Rank {
            op,
            index,
            expected: "1",
            actual: ndim,
        })
}

pub(crate) fn into_scalar(
    op: OperatorKind,
    index: usize,
    x: &ArrayD<f64>,
) -> Result<f64, OperatorError> {
    match x.ndim() {
        0 => x.first().copied().ok_or(OperatorError::Input {
            op,
            index,
            source: ConfigError::ShapeMismatch {
                what: "scalar gradient",
                expected: 1,
                actual: x.len(),
            },
        }),
        actual => Err(OperatorError::Rank {
            op,
            index,
            expected: "0",
            actual,
        }),
    }
}

/// Limb darkening and filter stage of a single evaluation
///
/// Holds `F(u, f)` when the degree configuration has a filter. Without one every method is the
/// identity or returns the precomputed base row, and no matrix product is evaluated.
#[derive(Clone, Debug)]
pub(crate) struct BasisFilter {
    matrix: Option<Array2<f64>>,
}

impl BasisFilter {
    pub fn new(
        provider: &dyn MathProvider,
        u: ArrayView1<f64>,
        f: ArrayView1<f64>,
    ) -> Result<Self, OperatorError> {
        let matrix = if provider.config().has_filter() {
            let inputs = [u.view().into_dyn(), f.view().into_dyn()];
            Some(FILTER_MATRIX.evaluate(provider, &inputs)?)
        } else {
            None
        };
        Ok(Self { matrix })
    }

    pub fn matrix(&self) -> Option<ArrayView2<'_, f64>> {
        self.matrix.as_ref().map(|m| m.view())
    }

    /// Flux of every spherical harmonic, `rT · F · A1` or the precomputed `rT · A1`
    pub fn flux_row(&self, provider: &dyn MathProvider) -> Array2<f64> {
        match &self.matrix {
            Some(matrix) => provider
                .base_flux_row()
                .dot(matrix)
                .dot(&provider.to_poly_basis()),
            None => provider.base_flux_poly_row().to_owned(),
        }
    }

    /// Gradient with respect to `F` of `flux_row`, zero-sized without a filter
    pub fn flux_row_vjp(
        &self,
        provider: &dyn MathProvider,
        output_gradient: ArrayView2<f64>,
    ) -> Option<Array2<f64>> {
        self.matrix.as_ref()?;
        let b_row = output_gradient.dot(&provider.to_poly_basis().t());
        Some(provider.base_flux_row().t().dot(&b_row))
    }

    /// `rows · A1⁻¹ · F · A1`, `(K, N)` to `(K, Ny)`, evaluated left to right
    pub fn apply(&self, provider: &dyn MathProvider, rows: ArrayView2<f64>) -> Array2<f64> {
        match &self.matrix {
            Some(matrix) => rows
                .dot(&provider.from_poly_basis())
                .dot(matrix)
                .dot(&provider.to_poly_basis()),
            None => rows.to_owned(),
        }
    }

    /// Gradients of `apply` with respect to the rows and to `F`
    pub fn apply_vjp(
        &self,
        provider: &dyn MathProvider,
        rows: ArrayView2<f64>,
        output_gradient: ArrayView2<f64>,
    ) -> (Array2<f64>, Option<Array2<f64>>) {
        let Some(matrix) = &self.matrix else {
            return (output_gradient.to_owned(), None);
        };
        let a1_inv = provider.from_poly_basis();
        let t = rows.dot(&a1_inv);
        let b_u = output_gradient.dot(&provider.to_poly_basis().t());
        let b_matrix = t.t().dot(&b_u);
        let b_rows = b_u.dot(&matrix.t()).dot(&a1_inv.t());
        (b_rows, Some(b_matrix))
    }

    /// Gradients with respect to `u` and `f` of a scalar whose gradient with respect to `F` is
    /// `b_matrix`
    pub fn coefficients_vjp(
        provider: &dyn MathProvider,
        u: ArrayView1<f64>,
        f: ArrayView1<f64>,
        b_matrix: ArrayView2<f64>,
    ) -> Result<(Array1<f64>, Array1<f64>), OperatorError> {
        let op = OperatorKind::FilterMatrix;
        let inputs = [u.view().into_dyn(), f.view().into_dyn()];
        let mut grads = FILTER_MATRIX.gradient(provider, &inputs, b_matrix)?.into_iter();
        match (grads.next(), grads.next()) {
            (Some(bu), Some(bf)) => Ok((into_vector(op, 0, bu)?, into_vector(op, 1, bf)?)),
            _ => Err(OperatorError::MissingGradient { op }),
        }
    }
}

/// Gradients of [RotationChain::vjp]
#[derive(Clone, Debug)]
pub(crate) struct RotationVjp {
    pub m: Array2<f64>,
    pub inc: f64,
    pub obl: f64,
    pub theta: Array1<f64>,
}

/// `dotR(M, inc, obl, θ) = RotateFrame(RotatePolar(RotateFrameTranspose(M), θ))`
///
/// Rows of `M` are taken into the frame of the rotation axis, spun about it by the per-row
/// phase and taken back into the observer frame. A single row of `M` is broadcast over all
/// phases. The intermediates are kept for the vector-Jacobian product.
#[derive(Clone, Debug)]
pub(crate) struct RotationChain {
    inc: f64,
    obl: f64,
    input: Array2<f64>,
    theta: Array1<f64>,
    aligned: Array2<f64>,
    spun: Array2<f64>,
    value: Array2<f64>,
}

impl RotationChain {
    pub fn new(
        provider: &dyn MathProvider,
        m: ArrayView2<f64>,
        inc: f64,
        obl: f64,
        theta: ArrayView1<f64>,
    ) -> Result<Self, OperatorError> {
        let (inc_d, obl_d) = (arr0(inc).into_dyn(), arr0(obl).into_dyn());
        let aligned = ROTATE_FRAME_TRANSPOSE
            .evaluate(provider, &[m.view().into_dyn(), inc_d.view(), obl_d.view()])?;
        let spun = ROTATE_POLAR
            .evaluate(provider, &[aligned.view().into_dyn(), theta.view().into_dyn()])?;
        let value =
            ROTATE_FRAME.evaluate(provider, &[spun.view().into_dyn(), inc_d.view(), obl_d.view()])?;
        Ok(Self {
            inc,
            obl,
            input: m.to_owned(),
            theta: theta.to_owned(),
            aligned,
            spun,
            value,
        })
    }

    pub fn value(&self) -> ArrayView2<'_, f64> {
        self.value.view()
    }

    pub fn into_value(self) -> Array2<f64> {
        self.value
    }

    pub fn vjp(
        &self,
        provider: &dyn MathProvider,
        output_gradient: ArrayView2<f64>,
    ) -> Result<RotationVjp, OperatorError> {
        let (inc_d, obl_d) = (arr0(self.inc).into_dyn(), arr0(self.obl).into_dyn());
        let frame = ROTATE_FRAME.gradient(
            provider,
            &[self.spun.view().into_dyn(), inc_d.view(), obl_d.view()],
            output_gradient,
        )?;
        let [b_spun, b_inc_out, b_obl_out] = three(OperatorKind::RotateFrame, frame)?;
        let b_spun = into_matrix(OperatorKind::RotateFrame, 0, b_spun)?;

        let polar = ROTATE_POLAR.gradient(
            provider,
            &[self.aligned.view().into_dyn(), self.theta.view().into_dyn()],
            b_spun.view(),
        )?;
        let mut polar = polar.into_iter();
        let (b_aligned, b_theta) = match (polar.next(), polar.next()) {
            (Some(m), Some(theta)) => (
                into_matrix(OperatorKind::RotatePolar, 0, m)?,
                into_vector(OperatorKind::RotatePolar, 1, theta)?,
            ),
            _ => {
                return Err(OperatorError::MissingGradient {
                    op: OperatorKind::RotatePolar,
                });
            }
        };

        let frame_t = ROTATE_FRAME_TRANSPOSE.gradient(
            provider,
            &[self.input.view().into_dyn(), inc_d.view(), obl_d.view()],
            b_aligned.view(),
        )?;
        let [b_m, b_inc_in, b_obl_in] = three(OperatorKind::RotateFrameTranspose, frame_t)?;

        Ok(RotationVjp {
            m: into_matrix(OperatorKind::RotateFrameTranspose, 0, b_m)?,
            inc: into_scalar(OperatorKind::RotateFrame, 1, &b_inc_out)?
                + into_scalar(OperatorKind::RotateFrameTranspose, 1, &b_inc_in)?,
            obl: into_scalar(OperatorKind::RotateFrame, 2, &b_obl_out)?
                + into_scalar(OperatorKind::RotateFrameTranspose, 2, &b_obl_in)?,
            theta: b_theta,
        })
    }
}

fn three(op: OperatorKind, grads: Vec<ArrayD<f64>>) -> Result<[ArrayD<f64>; 3], OperatorError> {
    grads
        .try_into()
        .map_err(|_| OperatorError::MissingGradient { op })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::degree::DegreeConfig;
    use crate::provider::ReferenceProvider;
    use crate::tests::{assert_gradient, sample_matrix};

    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn provider(ydeg: usize, udeg: usize, fdeg: usize) -> ReferenceProvider {
        ReferenceProvider::new(DegreeConfig::new(ydeg, udeg, fdeg).unwrap()).unwrap()
    }

    #[test]
    fn unfiltered_flux_row_is_base_row() {
        let provider = provider(3, 0, 0);
        // coefficients are ignored without a filter
        let filter = BasisFilter::new(&provider, array![0.3].view(), array![2.0].view()).unwrap();
        assert!(filter.matrix().is_none());
        assert_abs_diff_eq!(
            filter.flux_row(&provider),
            provider.base_flux_poly_row(),
            epsilon = 1e-12
        );
        let rows = sample_matrix(3, 16, 1);
        assert_eq!(filter.apply(&provider, rows.view()), rows);
    }

    #[test]
    fn unit_filter_keeps_base_row() {
        let provider = provider(2, 2, 1);
        let u = array![-1.0, 0.0, 0.0];
        let f = array![1.0, 0.0, 0.0, 0.0];
        let filter = BasisFilter::new(&provider, u.view(), f.view()).unwrap();
        assert!(filter.matrix().is_some());
        assert_abs_diff_eq!(
            filter.flux_row(&provider),
            provider.base_flux_poly_row(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn filter_stage_gradients() {
        let provider = provider(1, 1, 1);
        let u = array![-1.0, 0.4];
        let f = array![1.0, 0.1, 0.2, -0.1];
        let rows = sample_matrix(2, 16, 2);
        let g = sample_matrix(2, 4, 3);
        let g_row = sample_matrix(1, 4, 4);

        let loss = |u: &Array1<f64>, f: &Array1<f64>, rows: &Array2<f64>| {
            let filter = BasisFilter::new(&provider, u.view(), f.view()).unwrap();
            (filter.apply(&provider, rows.view()) * &g).sum()
                + (filter.flux_row(&provider) * &g_row).sum()
        };

        let filter = BasisFilter::new(&provider, u.view(), f.view()).unwrap();
        let (b_rows, b_matrix) = filter.apply_vjp(&provider, rows.view(), g.view());
        let b_matrix = b_matrix.unwrap() + filter.flux_row_vjp(&provider, g_row.view()).unwrap();
        let (bu, bf) =
            BasisFilter::coefficients_vjp(&provider, u.view(), f.view(), b_matrix.view()).unwrap();

        for i in 0..u.len() {
            assert_gradient(
                |x| {
                    let mut u1 = u.clone();
                    u1[i] = x;
                    loss(&u1, &f, &rows)
                },
                u[i],
                bu[i],
            );
        }
        for i in 0..f.len() {
            assert_gradient(
                |x| {
                    let mut f1 = f.clone();
                    f1[i] = x;
                    loss(&u, &f1, &rows)
                },
                f[i],
                bf[i],
            );
        }
        for ((i, j), &analytic) in b_rows.indexed_iter() {
            assert_gradient(
                |x| {
                    let mut r1 = rows.clone();
                    r1[(i, j)] = x;
                    loss(&u, &f, &r1)
                },
                rows[(i, j)],
                analytic,
            );
        }
    }

    #[test]
    fn zero_phase_round_trip() {
        let provider = provider(3, 0, 0);
        let m = sample_matrix(1, 16, 5);
        let chain = RotationChain::new(&provider, m.view(), 0.8, -0.4, array![0.0, 0.0].view())
            .unwrap();
        for row in chain.value().rows() {
            assert_abs_diff_eq!(row, m.row(0), epsilon = 1e-10);
        }
    }

    #[test]
    fn rotation_chain_gradient() {
        let provider = provider(2, 0, 0);
        let m = sample_matrix(1, 9, 6);
        let theta = array![0.3, -1.1, 2.5];
        let (inc, obl) = (1.1, 0.3);
        let g = sample_matrix(3, 9, 7);
        let chain = RotationChain::new(&provider, m.view(), inc, obl, theta.view()).unwrap();
        let vjp = chain.vjp(&provider, g.view()).unwrap();
        assert_eq!(vjp.m.dim(), (1, 9));

        let loss = |m: &Array2<f64>, inc, obl, theta: &Array1<f64>| {
            let chain = RotationChain::new(&provider, m.view(), inc, obl, theta.view()).unwrap();
            (chain.into_value() * &g).sum()
        };
        assert_gradient(|x| loss(&m, x, obl, &theta), inc, vjp.inc);
        assert_gradient(|x| loss(&m, inc, x, &theta), obl, vjp.obl);
        for k in 0..theta.len() {
            assert_gradient(
                |x| {
                    let mut t1 = theta.clone();
                    t1[k] = x;
                    loss(&m, inc, obl, &t1)
                },
                theta[k],
                vjp.theta[k],
            );
        }
        for j in 0..m.ncols() {
            assert_gradient(
                |x| {
                    let mut m1 = m.clone();
                    m1[(0, j)] = x;
                    loss(&m1, inc, obl, &theta)
                },
                m[(0, j)],
                vjp.m[(0, j)],
            );
        }
    }
}
