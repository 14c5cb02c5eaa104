use faer::{
    Side,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
};
use nalgebra::DVector;

use crate::linalg::{
    LinAlgError, LinAlgResult,
    sparse::{from_faer_column, to_faer_column},
};

/// Sparse Cholesky solver for the damped normal equations of one optimization run.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    /// Symbolic factorization reused while the sparsity pattern stays the same.
    ///
    /// The universal adapters write every Jacobian entry on every iteration (zeros
    /// included), so `JᵀJ` keeps its pattern for the lifetime of an optimization.
    symbolic_factorization: Option<SymbolicLlt<usize>>,

    /// Sparsity pattern the cached factorization was computed for.
    cached_pattern: Option<SparsityPattern>,
}

/// Compressed column structure of a sparse matrix, without values.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SparsityPattern {
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
}

impl SparsityPattern {
    fn of(matrix: &SparseColMat<usize, f64>) -> Self {
        let symbolic = matrix.symbolic();
        let mut col_ptr = Vec::with_capacity(symbolic.ncols() + 1);
        let mut row_idx = Vec::with_capacity(symbolic.compute_nnz());
        col_ptr.push(0);
        for col in 0..symbolic.ncols() {
            row_idx.extend_from_slice(&symbolic.row_idx()[symbolic.col_range(col)]);
            col_ptr.push(row_idx.len());
        }
        Self { col_ptr, row_idx }
    }
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the cached symbolic factorization.
    pub fn reset(&mut self) {
        self.symbolic_factorization = None;
        self.cached_pattern = None;
    }

    pub fn has_symbolic_factorization(&self) -> bool {
        self.symbolic_factorization.is_some()
    }

    /// Solves `matrix · x = rhs` for a symmetric positive definite `matrix`.
    ///
    /// Only the lower triangle of `matrix` is read.
    ///
    /// # Errors
    /// - `LinAlgError::DimensionMismatch` for non-square systems
    /// - `LinAlgError::FactorizationFailed` if the symbolic analysis fails
    /// - `LinAlgError::SingularMatrix` if the numeric factorization fails or the solution is not finite
    pub fn solve(
        &mut self,
        matrix: &SparseColMat<usize, f64>,
        rhs: &DVector<f64>,
    ) -> LinAlgResult<DVector<f64>> {
        let n = matrix.nrows();
        if matrix.ncols() != n || rhs.len() != n {
            return Err(LinAlgError::DimensionMismatch(format!(
                "Cannot solve {}x{} system with right-hand side of length {}",
                n,
                matrix.ncols(),
                rhs.len()
            ))
            .log());
        }

        let pattern = SparsityPattern::of(matrix);
        let sym = match &self.symbolic_factorization {
            Some(cached) if self.cached_pattern.as_ref() == Some(&pattern) => cached.clone(),
            _ => {
                let new_sym = SymbolicLlt::try_new(matrix.symbolic(), Side::Lower).map_err(|e| {
                    LinAlgError::FactorizationFailed(
                        "Symbolic Cholesky decomposition failed".to_string(),
                    )
                    .log_with_source(e)
                })?;
                self.symbolic_factorization = Some(new_sym.clone());
                self.cached_pattern = Some(pattern);
                new_sym
            }
        };

        // a failed numeric factorization is an ordinary outcome for rejected LM steps
        let cholesky = Llt::try_new_with_symbolic(sym, matrix.as_ref(), Side::Lower)
            .map_err(|_| LinAlgError::SingularMatrix)?;

        let solution = from_faer_column(&cholesky.solve(&to_faer_column(rhs)));
        if solution.iter().all(|v| v.is_finite()) {
            Ok(solution)
        } else {
            Err(LinAlgError::SingularMatrix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse::{TripletBuilder, to_dense};
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Symmetric positive definite 3x3 test matrix.
    fn spd_matrix() -> LinAlgResult<SparseColMat<usize, f64>> {
        let mut builder = TripletBuilder::new(3, 3);
        builder.push(0, 0, 4.0);
        builder.push(0, 1, 1.0);
        builder.push(1, 0, 1.0);
        builder.push(1, 1, 3.0);
        builder.push(1, 2, 0.5);
        builder.push(2, 1, 0.5);
        builder.push(2, 2, 2.0);
        builder.build()
    }

    #[test]
    fn test_solver_creation() {
        let solver = SparseCholeskySolver::new();
        assert!(!solver.has_symbolic_factorization());
    }

    #[test]
    fn test_solve_well_conditioned() -> TestResult {
        let matrix = spd_matrix()?;
        let rhs = dvector![1.0, 2.0, 3.0];

        let mut solver = SparseCholeskySolver::new();
        let x = solver.solve(&matrix, &rhs)?;

        assert_relative_eq!(to_dense(&matrix) * x, rhs, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn test_symbolic_pattern_caching() -> TestResult {
        let matrix = spd_matrix()?;
        let mut solver = SparseCholeskySolver::new();

        solver.solve(&matrix, &dvector![1.0, 0.0, 0.0])?;
        assert!(solver.has_symbolic_factorization());

        let x = solver.solve(&matrix, &dvector![0.0, 1.0, 0.0])?;
        assert_relative_eq!(to_dense(&matrix) * x, dvector![0.0, 1.0, 0.0], epsilon = 1e-10);

        solver.reset();
        assert!(!solver.has_symbolic_factorization());
        Ok(())
    }

    #[test]
    fn test_changed_pattern_with_equal_nnz_is_refactorized() -> TestResult {
        let first = spd_matrix()?;

        // same dimension and non-zero count, coupling 0-2 instead of 0-1
        let mut builder = TripletBuilder::new(3, 3);
        builder.push(0, 0, 5.0);
        builder.push(0, 2, 2.0);
        builder.push(2, 0, 2.0);
        builder.push(1, 1, 3.0);
        builder.push(1, 2, -1.0);
        builder.push(2, 1, -1.0);
        builder.push(2, 2, 4.0);
        let second = builder.build()?;
        assert_eq!(first.compute_nnz(), second.compute_nnz());

        let mut solver = SparseCholeskySolver::new();
        let rhs = dvector![1.0, -2.0, 0.5];
        solver.solve(&first, &rhs)?;
        let x = solver.solve(&second, &rhs)?;

        assert_relative_eq!(to_dense(&second) * x, rhs, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn test_singular_matrix() -> TestResult {
        let mut builder = TripletBuilder::new(2, 2);
        builder.push(0, 0, 1.0);
        builder.push(0, 1, 1.0);
        builder.push(1, 0, 1.0);
        builder.push(1, 1, 1.0);
        let matrix = builder.build()?;

        let mut solver = SparseCholeskySolver::new();
        assert!(solver.solve(&matrix, &dvector![1.0, 2.0]).is_err());
        Ok(())
    }

    #[test]
    fn test_dimension_mismatch() -> TestResult {
        let matrix = spd_matrix()?;
        let mut solver = SparseCholeskySolver::new();
        assert!(matches!(
            solver.solve(&matrix, &dvector![1.0]),
            Err(LinAlgError::DimensionMismatch(_))
        ));
        Ok(())
    }
}
