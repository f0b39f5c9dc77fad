use ndarray::{Array1, Array2, ArrayD, ArrayViewD, IxDyn, ShapeError};

/// Coerces arrays of any rank to the fixed ranks the operators work with and back
///
/// A rank-0 or rank-1 array becomes a single row, higher ranks keep the leading axis as rows and
/// flatten the rest. [RankAdapter::restore] is the exact inverse for the recorded shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankAdapter {
    shape: Vec<usize>,
}

impl RankAdapter {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
        }
    }

    /// Original shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Two-dimensional shape the array is coerced to
    pub fn matrix_shape(&self) -> (usize, usize) {
        match self.shape.as_slice() {
            [] => (1, 1),
            [n] => (1, *n),
            [rows, rest @ ..] => (*rows, rest.iter().product()),
        }
    }

    pub fn to_matrix(&self, x: ArrayViewD<f64>) -> Result<Array2<f64>, ShapeError> {
        x.as_standard_layout()
            .into_owned()
            .into_shape_with_order(self.matrix_shape())
    }

    pub fn to_vector(&self, x: ArrayViewD<f64>) -> Result<Array1<f64>, ShapeError> {
        x.as_standard_layout()
            .into_owned()
            .into_shape_with_order(self.len())
    }

    /// Reshapes a two-dimensional or flat array back into the original shape
    pub fn restore<D: ndarray::Dimension>(
        &self,
        x: ndarray::Array<f64, D>,
    ) -> Result<ArrayD<f64>, ShapeError> {
        let x = x.as_standard_layout().into_owned();
        x.into_shape_with_order(IxDyn(&self.shape))
    }
}
