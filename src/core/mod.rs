//! Core building blocks shared by every optimizer in the crate
//!
//! This module contains the small value types that flow through the numeric inner loops:
//! - [`FixedVector`]: stack allocated model/result buffers with a compile-time size
//! - [`Estimator`]: robust estimators turning squared residuals into weights and a scalar cost
//! - Numeric tolerances used for finite differences and step control

pub mod estimator;
pub mod fixed_vector;

pub use estimator::Estimator;
pub use fixed_vector::FixedVector;

use thiserror::Error;
use tracing::error;

/// Machine-level tolerance used for damping and weight thresholds.
pub const EPS: f64 = 1e-12;

/// Weak tolerance used as finite-difference step and convergence threshold.
pub const WEAK_EPS: f64 = 1e-6;

/// Core module error types for model buffers, estimators and caller input
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Dimension mismatch between buffers, element counts or parameter blocks
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Robust estimator could not be constructed or evaluated
    #[error("Estimator error: {0}")]
    Estimator(String),

    /// Invalid input parameter or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying error that caused it
    ///
    /// # Arguments
    /// * `source_error` - The original error (must implement Debug)
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
