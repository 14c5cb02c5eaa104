//! Dense normal equations on nalgebra matrices.
//!
//! Used by the dense Levenberg-Marquardt loop, for the reduced system of the Schur complement
//! and wherever a problem is small enough that sparsity does not pay off.

use nalgebra::{DMatrix, DVector};

use crate::core::EPS;
use crate::linalg::{LinAlgError, LinAlgResult};

/// Builds `JᵀWJ` and `JᵀWe` from a Jacobian and the (already weighted) residual vector.
///
/// `weights` holds one weight per Jacobian row; `None` means every row has weight one.
///
/// # Errors
/// Returns `LinAlgError::DimensionMismatch` if the vectors do not have one entry per row.
pub fn normal_equations(
    jacobian: &DMatrix<f64>,
    weighted_errors: &DVector<f64>,
    weights: Option<&DVector<f64>>,
) -> LinAlgResult<(DMatrix<f64>, DVector<f64>)> {
    let rows = jacobian.nrows();
    if weighted_errors.len() != rows {
        return Err(LinAlgError::DimensionMismatch(format!(
            "Jacobian has {} rows but the error vector has {} entries",
            rows,
            weighted_errors.len()
        ))
        .log());
    }

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

            let mut weighted_jacobian = jacobian.clone();
            for (r, mut row) in weighted_jacobian.row_iter_mut().enumerate() {
                row *= weights[r];
            }
            jacobian.tr_mul(&weighted_jacobian)
        }
        None => jacobian.tr_mul(jacobian),
    };

    let error_jacobian = jacobian.tr_mul(weighted_errors);

    Ok((hessian, error_jacobian))
}

/// Writes `diagonal · (1 + lambda)` onto the diagonal of `hessian`.
///
/// For `lambda <= EPS` the undamped diagonal is restored, which turns the step into a plain
/// Gauss-Newton step.
pub fn apply_damping(hessian: &mut DMatrix<f64>, diagonal: &DVector<f64>, lambda: f64) {
    let factor = if lambda > EPS { 1.0 + lambda } else { 1.0 };
    for n in 0..diagonal.len() {
        hessian[(n, n)] = diagonal[n] * factor;
    }
}

/// Solves the symmetric system `matrix · x = rhs`.
///
/// Cholesky is tried first; semi-definite or indefinite matrices fall back to LU.
///
/// # Errors
/// Returns `LinAlgError::SingularMatrix` if neither factorization yields a finite solution.
pub fn solve_symmetric(matrix: &DMatrix<f64>, rhs: &DVector<f64>) -> LinAlgResult<DVector<f64>> {
    if !matrix.is_square() || matrix.nrows() != rhs.len() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "Cannot solve {}x{} system with right-hand side of length {}",
            matrix.nrows(),
            matrix.ncols(),
            rhs.len()
        ))
        .log());
    }

    if let Some(cholesky) = matrix.clone().cholesky() {
        let solution = cholesky.solve(rhs);
        if solution.iter().all(|v| v.is_finite()) {
            return Ok(solution);
        }
    }

    match matrix.clone().lu().solve(rhs) {
        Some(solution) if solution.iter().all(|v| v.is_finite()) => Ok(solution),
        _ => Err(LinAlgError::SingularMatrix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_normal_equations_unweighted() -> TestResult {
        let jacobian = dmatrix![1.0, 0.0; 0.0, 2.0; 1.0, 1.0];
        let errors = dvector![1.0, 2.0, 3.0];
        let (hessian, error_jacobian) = normal_equations(&jacobian, &errors, None)?;

        assert_relative_eq!(hessian, dmatrix![2.0, 1.0; 1.0, 5.0]);
        assert_relative_eq!(error_jacobian, dvector![4.0, 7.0]);
        Ok(())
    }

    #[test]
    fn test_normal_equations_weighted_rows() -> TestResult {
        let jacobian = dmatrix![1.0; 1.0];
        let errors = dvector![2.0, 0.5];
        let weights = dvector![2.0, 0.5];
        let (hessian, error_jacobian) = normal_equations(&jacobian, &errors, Some(&weights))?;

        assert_relative_eq!(hessian[(0, 0)], 2.5);
        assert_relative_eq!(error_jacobian[0], 2.5);
        Ok(())
    }

    #[test]
    fn test_normal_equations_dimension_mismatch() {
        let jacobian = dmatrix![1.0; 1.0];
        let errors = dvector![2.0];
        assert!(normal_equations(&jacobian, &errors, None).is_err());
    }

    #[test]
    fn test_damping_is_multiplicative() {
        let mut hessian = dmatrix![4.0, 1.0; 1.0, 2.0];
        let diagonal = hessian.diagonal();

        apply_damping(&mut hessian, &diagonal, 0.5);
        assert_relative_eq!(hessian[(0, 0)], 6.0);
        assert_relative_eq!(hessian[(1, 1)], 3.0);
        assert_relative_eq!(hessian[(0, 1)], 1.0);

        apply_damping(&mut hessian, &diagonal, 0.0);
        assert_relative_eq!(hessian[(0, 0)], 4.0);
    }

    #[test]
    fn test_solve_symmetric_positive_definite() -> TestResult {
        let matrix = dmatrix![4.0, 1.0; 1.0, 3.0];
        let rhs = dvector![1.0, 2.0];
        let x = solve_symmetric(&matrix, &rhs)?;
        assert_relative_eq!(&matrix * x, rhs, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_solve_symmetric_indefinite_falls_back_to_lu() -> TestResult {
        let matrix = dmatrix![0.0, 1.0; 1.0, 0.0];
        let rhs = dvector![3.0, 5.0];
        let x = solve_symmetric(&matrix, &rhs)?;
        assert_relative_eq!(x, dvector![5.0, 3.0], epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_solve_symmetric_singular() {
        let matrix = dmatrix![1.0, 1.0; 1.0, 1.0];
        let rhs = dvector![1.0, 2.0];
        assert!(matches!(
            solve_symmetric(&matrix, &rhs),
            Err(LinAlgError::SingularMatrix)
        ));
    }
}
