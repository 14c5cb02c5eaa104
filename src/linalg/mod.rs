//! Linear algebra for the normal equations of Levenberg-Marquardt steps.
//!
//! - [`dense`]: `JᵀWJ` assembly, multiplicative damping and a symmetric solve on nalgebra matrices
//! - [`sparse`]: Jacobian assembly from coordinate triplets and sparse `JᵀWJ` products with faer
//! - [`cholesky`]: sparse Cholesky solver caching its symbolic factorization between steps
//! - [`schur`]: block elimination of a `[A B; C D]` system with block-diagonal `A` or `D`

pub mod cholesky;
pub mod dense;
pub mod schur;
pub mod sparse;

use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;

pub use cholesky::SparseCholeskySolver;
pub use schur::BlockLayout;
pub use sparse::TripletBuilder;

/// Linear solver used for the sparse normal equations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    /// Sparse Cholesky on the full damped system.
    SparseCholesky,
    /// Schur complement whenever the provider exposes a block layout, sparse Cholesky otherwise.
    #[default]
    Schur,
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
            LinearSolverType::Schur => write!(f, "Schur complement"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (Cholesky, LU)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or near-singular matrix detected
    #[error("Singular matrix detected (matrix is not invertible)")]
    SingularMatrix,

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),

    /// The same (row, column) pair was written twice while assembling a sparse matrix
    #[error("Duplicate sparse entry at ({row}, {col})")]
    DuplicateEntry { row: usize, col: usize },

    /// Matrix does not match the block layout required by the Schur complement
    #[error("Invalid block structure: {0}")]
    InvalidBlockStructure(String),

    /// Operand sizes do not fit together
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| LinAlgError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// This keeps faer's `FaerError`, `LltError` or `CreationError` visible in the log while
    /// callers only see the `LinAlgError`.
    ///
    /// # Example
    /// ```ignore
    /// SymbolicLlt::try_new(matrix.symbolic(), Side::Lower)
    ///     .map_err(|e| {
    ///         LinAlgError::FactorizationFailed(
    ///             "Symbolic Cholesky decomposition failed".to_string()
    ///         )
    ///         .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;
