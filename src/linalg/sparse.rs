//! Sparse Jacobian assembly and sparse normal equations.
//!
//! Jacobians are generated element by element as coordinate triplets and compacted into a
//! column-major faer matrix. Every (row, column) pair may be written at most once; the builder
//! checks this before handing the triplets to faer, which would otherwise silently sum them.

use std::collections::HashSet;
use std::ops::Mul;

use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};
use nalgebra::{DMatrix, DVector};

use crate::core::EPS;
use crate::linalg::{LinAlgError, LinAlgResult};

/// Collects coordinate entries of a sparse matrix with known dimensions.
#[derive(Debug, Clone)]
pub struct TripletBuilder {
    nrows: usize,
    ncols: usize,
    triplets: Vec<Triplet<usize, usize, f64>>,
}

impl TripletBuilder {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self::with_capacity(nrows, ncols, 0)
    }

    pub fn with_capacity(nrows: usize, ncols: usize, capacity: usize) -> Self {
        Self {
            nrows,
            ncols,
            triplets: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn push(&mut self, row: usize, col: usize, value: f64) {
        self.triplets.push(Triplet::new(row, col, value));
    }

    /// Moves all entries of `other` into the builder.
    pub fn append(&mut self, other: &mut Vec<Triplet<usize, usize, f64>>) {
        self.triplets.append(other);
    }

    pub fn len(&self) -> usize {
        self.triplets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triplets.is_empty()
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn triplets(&self) -> &[Triplet<usize, usize, f64>] {
        &self.triplets
    }

    /// Returns the first (row, column) pair that occurs more than once.
    pub fn find_duplicate(&self) -> Option<(usize, usize)> {
        let mut seen = HashSet::with_capacity(self.triplets.len());
        self.triplets
            .iter()
            .map(|t| (t.row, t.col))
            .find(|&position| !seen.insert(position))
    }

    /// Compacts the triplets into a column-major sparse matrix.
    ///
    /// # Errors
    /// - `LinAlgError::SparseMatrixCreation` for entries outside the matrix
    /// - `LinAlgError::DuplicateEntry` if a (row, column) pair was written twice
    pub fn build(self) -> LinAlgResult<SparseColMat<usize, f64>> {
        if let Some(t) = self
            .triplets
            .iter()
            .find(|t| t.row >= self.nrows || t.col >= self.ncols)
        {
            return Err(LinAlgError::SparseMatrixCreation(format!(
                "Entry ({}, {}) outside of {}x{} matrix",
                t.row, t.col, self.nrows, self.ncols
            ))
            .log());
        }

        if let Some((row, col)) = self.find_duplicate() {
            return Err(LinAlgError::DuplicateEntry { row, col }.log());
        }

        SparseColMat::try_new_from_triplets(self.nrows, self.ncols, &self.triplets).map_err(|e| {
            LinAlgError::SparseMatrixCreation("Failed to compact Jacobian triplets".to_string())
                .log_with_source(e)
        })
    }
}

/// Copies an nalgebra vector into a single-column faer matrix.
pub fn to_faer_column(vector: &DVector<f64>) -> Mat<f64> {
    Mat::from_fn(vector.len(), 1, |i, _| vector[i])
}

/// Copies the first column of a faer matrix into an nalgebra vector.
pub fn from_faer_column(matrix: &Mat<f64>) -> DVector<f64> {
    DVector::from_fn(matrix.nrows(), |i, _| matrix[(i, 0)])
}

/// Builds `JᵀWJ` and `JᵀWe` for a sparse Jacobian.
///
/// `weights` holds one weight per Jacobian row; `None` means every row has weight one.
pub fn normal_equations(
    jacobian: &SparseColMat<usize, f64>,
    weighted_errors: &DVector<f64>,
    weights: Option<&DVector<f64>>,
) -> LinAlgResult<(SparseColMat<usize, f64>, DVector<f64>)> {
    let rows = jacobian.nrows();
    if weighted_errors.len() != rows {
        return Err(LinAlgError::DimensionMismatch(format!(
            "Jacobian has {} rows but the error vector has {} entries",
            rows,
            weighted_errors.len()
        ))
        .log());
    }

    let transposed = jacobian
        .as_ref()
        .transpose()
        .to_col_major()
        .map_err(|e| {
            LinAlgError::MatrixConversion(
                "Failed to convert transposed Jacobian to column-major format".to_string(),
            )
            .log_with_source(e)
        })?;

    let hessian = match weights {
        Some(weights) => {
            if weights.len() != rows {
                return Err(LinAlgError::DimensionMismatch(format!(
                    "Jacobian has {} rows but the weight vector has {} entries",
                    rows,
                    weights.len()
                ))
                .log());
            }

            let weighted_triplets: Vec<Triplet<usize, usize, f64>> = jacobian
                .triplet_iter()
                .map(|t| Triplet::new(t.row, t.col, *t.val * weights[t.row]))
                .collect();
            let weighted_jacobian =
                SparseColMat::try_new_from_triplets(rows, jacobian.ncols(), &weighted_triplets)
                    .map_err(|e| {
                        LinAlgError::SparseMatrixCreation(
                            "Failed to create weighted Jacobian".to_string(),
                        )
                        .log_with_source(e)
                    })?;
            transposed.mul(weighted_jacobian.as_ref())
        }
        None => transposed.mul(jacobian.as_ref()),
    };

    let error_jacobian = jacobian
        .as_ref()
        .transpose()
        .mul(&to_faer_column(weighted_errors));

    Ok((hessian, from_faer_column(&error_jacobian)))
}

/// Diagonal of a square sparse matrix, zero where no entry is stored.
pub fn diagonal(matrix: &SparseColMat<usize, f64>) -> DVector<f64> {
    let mut diagonal = DVector::zeros(matrix.nrows().min(matrix.ncols()));
    for t in matrix.triplet_iter() {
        if t.row == t.col {
            diagonal[t.row] += *t.val;
        }
    }
    diagonal
}

/// Returns `hessian` with its diagonal replaced by `diagonal · (1 + lambda)`.
///
/// Zero diagonal entries stay zero. For `lambda <= EPS` the matrix is returned unchanged.
pub fn damped(
    hessian: &SparseColMat<usize, f64>,
    diagonal: &DVector<f64>,
    lambda: f64,
) -> LinAlgResult<SparseColMat<usize, f64>> {
    let n = hessian.nrows();
    let scale = if lambda > EPS { lambda } else { 0.0 };

    let lambda_triplets: Vec<Triplet<usize, usize, f64>> = (0..n)
        .map(|i| Triplet::new(i, i, diagonal[i] * scale))
        .collect();
    let lambda_d = SparseColMat::try_new_from_triplets(n, n, &lambda_triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Failed to create lambda*D matrix".to_string())
            .log_with_source(e)
    })?;

    Ok(hessian + lambda_d)
}

/// Dense copy of a sparse matrix.
pub fn to_dense(matrix: &SparseColMat<usize, f64>) -> DMatrix<f64> {
    let mut dense = DMatrix::zeros(matrix.nrows(), matrix.ncols());
    for t in matrix.triplet_iter() {
        dense[(t.row, t.col)] += *t.val;
    }
    dense
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn example_jacobian() -> Result<SparseColMat<usize, f64>, LinAlgError> {
        let mut builder = TripletBuilder::new(3, 2);
        builder.push(0, 0, 1.0);
        builder.push(1, 1, 2.0);
        builder.push(2, 0, 1.0);
        builder.push(2, 1, 1.0);
        builder.build()
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let mut builder = TripletBuilder::new(2, 2);
        builder.push(0, 0, 1.0);
        builder.push(1, 1, 1.0);
        builder.push(0, 0, 2.0);
        assert_eq!(builder.find_duplicate(), Some((0, 0)));
        assert!(matches!(
            builder.build(),
            Err(LinAlgError::DuplicateEntry { row: 0, col: 0 })
        ));
    }

    #[test]
    fn test_builder_rejects_out_of_bounds() {
        let mut builder = TripletBuilder::new(2, 2);
        builder.push(2, 0, 1.0);
        assert!(matches!(
            builder.build(),
            Err(LinAlgError::SparseMatrixCreation(_))
        ));
    }

    #[test]
    fn test_sparse_normal_equations_match_dense() -> TestResult {
        let jacobian = example_jacobian()?;
        let errors = dvector![1.0, 2.0, 3.0];
        let weights = dvector![1.0, 0.5, 2.0];

        let (hessian, error_jacobian) = normal_equations(&jacobian, &errors, Some(&weights))?;

        let dense_jacobian = to_dense(&jacobian);
        let (dense_hessian, dense_error_jacobian) =
            crate::linalg::dense::normal_equations(&dense_jacobian, &errors, Some(&weights))?;

        assert_relative_eq!(to_dense(&hessian), dense_hessian, epsilon = 1e-12);
        assert_relative_eq!(error_jacobian, dense_error_jacobian, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_damped_keeps_zero_diagonal() -> TestResult {
        let mut builder = TripletBuilder::new(2, 2);
        builder.push(0, 0, 4.0);
        builder.push(0, 1, 1.0);
        builder.push(1, 0, 1.0);
        let hessian = builder.build()?;

        let d = diagonal(&hessian);
        assert_relative_eq!(d, dvector![4.0, 0.0]);

        let result = to_dense(&damped(&hessian, &d, 0.25)?);
        assert_relative_eq!(result, dmatrix![5.0, 1.0; 1.0, 0.0]);

        let undamped = to_dense(&damped(&hessian, &d, 0.0)?);
        assert_relative_eq!(undamped, to_dense(&hessian));
        Ok(())
    }
}
