//! Per-sample choice between the rotation-only and the occultation formula

use crate::error::OperatorError;
use crate::ops::batch::{FluxGradient, SampleBatch, SurfaceParams};
use crate::ops::composition::{
    BasisFilter, ROTATE_POLAR, RotationChain, into_matrix, into_vector,
};
use crate::ops::operator::{DifferentiableOp, Operator, OperatorKind, SolutionVector};
use crate::provider::MathProvider;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const SOLUTION_VECTOR: Operator = Operator::SolutionVector(SolutionVector {});

/// Analytic regime of a single sample
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Regime {
    /// The occultor misses the visible disk, only the rotation changes the flux
    Rotation,
    /// The occultor overlaps the visible disk
    Occultation,
}

impl Regime {
    /// `b` is the projected separation, `zo` the occultor position along the line of sight and
    /// `ro` its radius
    pub fn classify(b: f64, zo: f64, ro: f64) -> Self {
        if b >= 1.0 + ro || zo <= 0.0 || ro == 0.0 {
            Self::Rotation
        } else {
            Self::Occultation
        }
    }
}

/// Disjoint index sets covering a [SampleBatch], in batch order
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Partition {
    rotation: Vec<usize>,
    occultation: Vec<usize>,
}

impl Partition {
    pub fn new(batch: &SampleBatch) -> Self {
        let mut partition = Self::default();
        let b = batch.impact_parameter();
        for (i, ((&b, &zo), &ro)) in b
            .iter()
            .zip(batch.zo().iter())
            .zip(batch.ro().iter())
            .enumerate()
        {
            match Regime::classify(b, zo, ro) {
                Regime::Rotation => partition.rotation.push(i),
                Regime::Occultation => partition.occultation.push(i),
            }
        }
        log::trace!(
            "partitioned {} samples: {} rotation-only, {} occulted",
            batch.len(),
            partition.rotation.len(),
            partition.occultation.len()
        );
        partition
    }

    /// Indices of rotation-only samples
    pub fn rotation(&self) -> &[usize] {
        &self.rotation
    }

    /// Indices of occulted samples
    pub fn occultation(&self) -> &[usize] {
        &self.occultation
    }

    pub fn len(&self) -> usize {
        self.rotation.len() + self.occultation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn regime(&self, index: usize) -> Option<Regime> {
        if self.rotation.binary_search(&index).is_ok() {
            Some(Regime::Rotation)
        } else if self.occultation.binary_search(&index).is_ok() {
            Some(Regime::Occultation)
        } else {
            None
        }
    }
}

fn gather(x: ArrayView1<f64>, indices: &[usize]) -> Array1<f64> {
    x.select(Axis(0), indices)
}

/// Zero-filled `(len, width)` matrix with `rows` placed at `indices`
fn scatter(len: usize, indices: &[usize], rows: ArrayView2<f64>) -> Array2<f64> {
    let mut out = Array2::zeros((len, rows.ncols()));
    for (&i, row) in indices.iter().zip(rows.rows()) {
        out.row_mut(i).assign(&row);
    }
    out
}

fn scatter_add(out: &mut Array1<f64>, indices: &[usize], values: ArrayView1<f64>) {
    for (&i, &v) in indices.iter().zip(values.iter()) {
        out[i] += v;
    }
}

/// Occulted samples with their intermediates
#[derive(Clone, Debug)]
struct OccultationBranch {
    b: Array1<f64>,
    ro: Array1<f64>,
    xo: Array1<f64>,
    yo: Array1<f64>,
    /// Position angle of the occultor measured from the polar axis, `atan2(xo, yo)`
    angle: Array1<f64>,
    /// `sT · A`
    greens: Array2<f64>,
    /// `sT · A` rotated by `angle`
    aligned: Array2<f64>,
    rotation: RotationChain,
}

/// Forward pass of the design matrix `X`, `(K, Ny)`, with `flux = X · y`
#[derive(Clone, Debug)]
pub(crate) struct DesignMatrix {
    partition: Partition,
    filter: BasisFilter,
    rotation: RotationChain,
    occultation: OccultationBranch,
    value: Array2<f64>,
}

impl DesignMatrix {
    pub fn new(
        provider: &dyn MathProvider,
        batch: &SampleBatch,
        params: &SurfaceParams,
    ) -> Result<Self, OperatorError> {
        let len = batch.len();
        let partition = Partition::new(batch);
        let filter = BasisFilter::new(provider, params.u.view(), params.f.view())?;

        let rotation = RotationChain::new(
            provider,
            filter.flux_row(provider).view(),
            params.inc,
            params.obl,
            gather(batch.theta(), partition.rotation()).view(),
        )?;

        let occultation = {
            let idx = partition.occultation();
            let xo = gather(batch.xo(), idx);
            let yo = gather(batch.yo(), idx);
            let b = ndarray::Zip::from(&xo)
                .and(&yo)
                .map_collect(|&x, &y| x.hypot(y));
            let ro = gather(batch.ro(), idx);
            let angle = ndarray::Zip::from(&xo)
                .and(&yo)
                .map_collect(|&x, &y| x.atan2(y));
            let solution =
                SOLUTION_VECTOR.evaluate(provider, &[b.view().into_dyn(), ro.view().into_dyn()])?;
            let greens = solution.dot(&provider.to_greens_basis());
            let aligned = ROTATE_POLAR
                .evaluate(provider, &[greens.view().into_dyn(), angle.view().into_dyn()])?;
            let filtered = filter.apply(provider, aligned.view());
            let rotation = RotationChain::new(
                provider,
                filtered.view(),
                params.inc,
                params.obl,
                gather(batch.theta(), idx).view(),
            )?;
            OccultationBranch {
                b,
                ro,
                xo,
                yo,
                angle,
                greens,
                aligned,
                rotation,
            }
        };

        let value = scatter(len, partition.rotation(), rotation.value())
            + scatter(len, partition.occultation(), occultation.rotation.value());
        Ok(Self {
            partition,
            filter,
            rotation,
            occultation,
            value,
        })
    }

    pub fn value(&self) -> ArrayView2<'_, f64> {
        self.value.view()
    }

    pub fn into_value(self) -> Array2<f64> {
        self.value
    }

    /// Gradients with respect to every input given the gradient with respect to `X`, the
    /// surface map gradient is left zero
    pub fn vjp(
        &self,
        provider: &dyn MathProvider,
        params: &SurfaceParams,
        output_gradient: ArrayView2<f64>,
    ) -> Result<FluxGradient, OperatorError> {
        let config = provider.config();
        let len = self.value.nrows();
        let mut grad = FluxGradient::zeros(len, config);
        let mut b_filter: Option<Array2<f64>> = None;
        let mut add_filter = |g: Option<Array2<f64>>| {
            if let Some(g) = g {
                b_filter = Some(match b_filter.take() {
                    Some(acc) => acc + g,
                    None => g,
                });
            }
        };

        // rotation-only samples
        let idx = self.partition.rotation();
        let g = output_gradient.select(Axis(0), idx);
        let rot = self.rotation.vjp(provider, g.view())?;
        grad.inc += rot.inc;
        grad.obl += rot.obl;
        scatter_add(&mut grad.theta, idx, rot.theta.view());
        add_filter(self.filter.flux_row_vjp(provider, rot.m.view()));

        // occulted samples
        let branch = &self.occultation;
        let idx = self.partition.occultation();
        let g = output_gradient.select(Axis(0), idx);
        let rot = branch.rotation.vjp(provider, g.view())?;
        grad.inc += rot.inc;
        grad.obl += rot.obl;
        scatter_add(&mut grad.theta, idx, rot.theta.view());
        let (b_aligned, b_matrix) = self.filter.apply_vjp(provider, branch.aligned.view(), rot.m.view());
        add_filter(b_matrix);

        let polar = ROTATE_POLAR.gradient(
            provider,
            &[branch.greens.view().into_dyn(), branch.angle.view().into_dyn()],
            b_aligned.view(),
        )?;
        let [b_greens, b_angle]: [_; 2] = polar
            .try_into()
            .map_err(|_| OperatorError::MissingGradient {
                op: OperatorKind::RotatePolar,
            })?;
        let b_greens = into_matrix(OperatorKind::RotatePolar, 0, b_greens)?;
        let b_angle = into_vector(OperatorKind::RotatePolar, 1, b_angle)?;
        let b_solution = b_greens.dot(&provider.to_greens_basis().t());

        let solution = SOLUTION_VECTOR.gradient(
            provider,
            &[branch.b.view().into_dyn(), branch.ro.view().into_dyn()],
            b_solution.view(),
        )?;
        let [b_b, b_ro]: [_; 2] = solution
            .try_into()
            .map_err(|_| OperatorError::MissingGradient {
                op: OperatorKind::SolutionVector,
            })?;
        let b_b = into_vector(OperatorKind::SolutionVector, 0, b_b)?;
        let b_ro = into_vector(OperatorKind::SolutionVector, 1, b_ro)?;
        scatter_add(&mut grad.ro, idx, b_ro.view());

        // b = hypot(xo, yo) and angle = atan2(xo, yo), both flat at the origin
        for (k, &i) in idx.iter().enumerate() {
            let (x, y, b) = (branch.xo[k], branch.yo[k], branch.b[k]);
            if b > 0.0 {
                let b2 = b * b;
                grad.xo[i] += b_b[k] * x / b + b_angle[k] * y / b2;
                grad.yo[i] += b_b[k] * y / b - b_angle[k] * x / b2;
            }
        }

        if let Some(b_matrix) = b_filter {
            let (bu, bf) = BasisFilter::coefficients_vjp(
                provider,
                params.u.view(),
                params.f.view(),
                b_matrix.view(),
            )?;
            grad.u = bu;
            grad.f = bf;
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::degree::DegreeConfig;
    use crate::provider::ReferenceProvider;
    use crate::tests::{sample_matrix, sample_vector};

    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn provider(ydeg: usize, udeg: usize, fdeg: usize) -> ReferenceProvider {
        ReferenceProvider::new(DegreeConfig::new(ydeg, udeg, fdeg).unwrap()).unwrap()
    }

    #[test]
    fn classification_boundary() {
        assert_eq!(Regime::classify(1.1, 1.0, 0.1), Regime::Rotation);
        assert_eq!(Regime::classify(1.0999, 1.0, 0.1), Regime::Occultation);
        assert_eq!(Regime::classify(0.0, 0.0, 0.1), Regime::Rotation);
        assert_eq!(Regime::classify(0.0, -1.0, 0.1), Regime::Rotation);
        assert_eq!(Regime::classify(0.0, 1.0, 0.0), Regime::Rotation);
        assert_eq!(Regime::classify(0.5, 1e-3, 0.1), Regime::Occultation);
    }

    #[test]
    fn partition_is_complete_and_disjoint() {
        let n = 200;
        let xo = sample_vector(n, -2.0, 2.0, 1);
        let yo = sample_vector(n, -2.0, 2.0, 2);
        let zo = sample_vector(n, -1.0, 1.0, 3);
        let ro = sample_vector(n, 0.0, 0.5, 4);
        let batch = SampleBatch::new(Array1::zeros(n), xo, yo, zo, ro).unwrap();
        let partition = Partition::new(&batch);
        assert_eq!(partition.len(), n);
        let mut all: Vec<_> = partition
            .rotation()
            .iter()
            .chain(partition.occultation())
            .copied()
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..n).collect::<Vec<_>>());
        assert!(!partition.rotation().is_empty());
        assert!(!partition.occultation().is_empty());
        for i in 0..n {
            let b = batch.xo()[i].hypot(batch.yo()[i]);
            assert_eq!(
                partition.regime(i),
                Some(Regime::classify(b, batch.zo()[i], batch.ro()[i]))
            );
        }
    }

    #[test]
    fn scatter_places_rows() {
        let rows = array![[1.0, 2.0], [3.0, 4.0]];
        let out = scatter(4, &[3, 1], rows.view());
        assert_eq!(out, array![[0.0, 0.0], [3.0, 4.0], [0.0, 0.0], [1.0, 2.0]]);
        let empty = scatter(2, &[], Array2::<f64>::zeros((0, 2)).view());
        assert_eq!(empty, Array2::<f64>::zeros((2, 2)));
    }

    #[test]
    fn single_regime_batches() {
        let provider = provider(2, 0, 0);
        let params = SurfaceParams::new(1.2, 0.3, sample_vector(9, -1.0, 1.0, 5));
        let far = SampleBatch::with_radius(
            array![0.1, 0.2],
            array![3.0, 0.0],
            array![0.0, 3.0],
            array![1.0, 1.0],
            0.1,
        )
        .unwrap();
        let x = DesignMatrix::new(&provider, &far, &params).unwrap();
        assert_eq!(x.value().dim(), (2, 9));
        assert!(x.partition.occultation().is_empty());

        let near = SampleBatch::with_radius(
            array![0.1, 0.2],
            array![0.1, 0.0],
            array![0.0, 0.3],
            array![1.0, 1.0],
            0.1,
        )
        .unwrap();
        let x = DesignMatrix::new(&provider, &near, &params).unwrap();
        assert_eq!(x.value().dim(), (2, 9));
        assert!(x.partition.rotation().is_empty());
        let grad = x
            .vjp(&provider, &params, sample_matrix(2, 9, 6).view())
            .unwrap();
        assert_eq!(grad.theta.len(), 2);
    }

    #[test]
    fn tiny_occultor_is_almost_rotation() {
        let provider = provider(2, 1, 0);
        let params = SurfaceParams::new(0.9, 0.2, sample_vector(9, -1.0, 1.0, 7))
            .with_limb_darkening(array![-1.0, 0.3]);
        let theta = array![0.4];
        let occulted =
            SampleBatch::with_radius(theta.clone(), array![0.2], array![0.3], array![1.0], 1e-6)
                .unwrap();
        let clear =
            SampleBatch::with_radius(theta, array![0.2], array![0.3], array![1.0], 0.0).unwrap();
        let x_occ = DesignMatrix::new(&provider, &occulted, &params).unwrap();
        let x_rot = DesignMatrix::new(&provider, &clear, &params).unwrap();
        assert_eq!(x_occ.partition.occultation(), &[0]);
        assert_eq!(x_rot.partition.rotation(), &[0]);
        assert_abs_diff_eq!(x_occ.value(), x_rot.value(), epsilon = 1e-9);
    }
}
