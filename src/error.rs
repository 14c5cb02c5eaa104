//! Error types for the lm-universal library
//!
//! # Error Hierarchy
//!
//! - **`LmError`** is the top-level error returned by the public optimize functions
//! - **Module errors** (`CoreError`, `LinAlgError`, `OptimizerError`) are wrapped inside it
//! - **Error sources** are preserved, so the whole chain can be inspected
//!
//! Example error chain:
//! ```text
//! LmError::Optimizer(
//!     OptimizerError::LinAlg(LinAlgError::SingularMatrix)
//! )
//! ```

use crate::{core::CoreError, linalg::LinAlgError, optimizer::OptimizerError};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the lm-universal library
pub type LmResult<T> = Result<T, LmError>;

/// Main error type for the lm-universal library
///
/// ```rust,ignore
/// if let Err(e) = optimize_homography(&homography, &left, &right, &config) {
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum LmError {
    /// Core module errors (model buffers, estimators, caller input)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Optimization loop errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),
}

impl LmError {
    /// Get the full error chain as a multi-line string, one cause per line.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    ///
    /// ```rust,ignore
    /// error!("Optimization failed: {}", err.chain_compact());
    /// // Output: "Linear algebra error: ... → Singular matrix"
    /// ```
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lm_error_display() {
        let error = LmError::from(LinAlgError::SingularMatrix);
        assert!(error.to_string().contains("Singular matrix"));
    }

    #[test]
    fn test_lm_error_chain() {
        let optimizer_error = OptimizerError::from(LinAlgError::FactorizationFailed(
            "Cholesky factorization failed".to_string(),
        ));
        let error = LmError::from(optimizer_error);

        let chain = error.chain();
        assert!(chain.contains("Cholesky"));
        assert!(chain.contains("  → "));
    }

    #[test]
    fn test_lm_error_chain_compact() {
        let error = LmError::from(CoreError::InvalidInput("no elements".to_string()));
        assert!(error.chain_compact().contains("no elements"));
        assert!(!error.chain_compact().contains('\n'));
    }

    #[test]
    fn test_transparent_error_conversion() {
        let error: LmError = OptimizerError::InvalidInitialModel.into();
        assert!(matches!(error, LmError::Optimizer(_)));
    }
}
