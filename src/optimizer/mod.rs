//! Levenberg-Marquardt optimization over abstract providers.
//!
//! A provider owns the model being optimized and knows how to linearize it; the optimizer
//! owns the iteration/damping state machine. Four provider contracts exist:
//! - [`DenseProvider`]: dense Jacobian, optional custom dense solve
//! - [`SparseProvider`]: sparse Jacobian, optional block layout for the Schur complement
//! - [`AdvancedDenseProvider`] / [`AdvancedSparseProvider`]: the provider builds (or solves)
//!   the normal equations itself and may stop the optimization early
//!
//! All providers share the candidate/current model lifecycle of [`ModelProvider`]:
//! `apply_correction` computes a candidate from the current model, the candidate is scored and
//! `accept_correction` promotes it. A rejected candidate is simply overwritten by the next one.

use crate::core::Estimator;
use crate::linalg::{self, BlockLayout, LinAlgResult, dense};
use faer::sparse::SparseColMat;
use nalgebra::{DMatrix, DVector};
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;

pub mod advanced;
pub mod levenberg_marquardt;

pub use advanced::{AdvancedDenseProvider, AdvancedSparseProvider};
pub use levenberg_marquardt::{
    IterationStats, LevenbergMarquardt, LevenbergMarquardtConfig, LevenbergMarquardtSummary,
};

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// The initial model has no finite robust error
    #[error("The initial model is invalid, no robust error could be determined")]
    InvalidInitialModel,

    /// Not a single iteration produced a solvable linear system
    #[error("No iteration produced a solvable linear system")]
    NoValidIteration,

    /// Invalid optimization parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// Jacobian or normal-equation computation failed
    #[error("Jacobian computation failed: {0}")]
    JacobianFailed(String),

    /// A provider violated its contract (vector sizes, weight vector usage)
    #[error("Provider contract violated: {0}")]
    ProviderContract(String),

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] linalg::LinAlgError),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| OptimizerError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error
    ///
    /// # Arguments
    /// * `source_error` - The original error (must implement Debug)
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Terminal state of an optimization that produced at least one valid step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// The last parameter update was below the convergence threshold
    Converged,
    /// The iteration budget was used up
    MaxIterationsReached,
    /// Damping exceeded its maximum (or could not grow), no further improvement possible
    DampingLimitReached,
    /// The provider requested termination
    UserTerminated,
}

impl OptimizationStatus {
    /// True for the states in which the model is (locally) optimal.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::Converged | OptimizationStatus::DampingLimitReached
        )
    }
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::DampingLimitReached => write!(f, "Damping limit reached"),
            OptimizationStatus::UserTerminated => write!(f, "User terminated"),
        }
    }
}

/// Result of a solver execution.
#[derive(Debug, Clone)]
pub struct SolverResult<T> {
    /// Optimized parameters
    pub parameters: T,
    /// Final optimization status
    pub status: OptimizationStatus,
    /// Robust error of the initial model
    pub initial_error: f64,
    /// Robust error of the optimized model
    pub final_error: f64,
    /// Initial error followed by the error of every accepted step
    pub intermediate_errors: Vec<f64>,
    /// Statistics of the whole run
    pub summary: LevenbergMarquardtSummary,
}

impl<T> SolverResult<T> {
    /// Replaces the parameters, keeping all statistics.
    pub fn with_parameters<U>(self, parameters: U) -> SolverResult<U> {
        SolverResult {
            parameters,
            status: self.status,
            initial_error: self.initial_error,
            final_error: self.final_error,
            intermediate_errors: self.intermediate_errors,
            summary: self.summary,
        }
    }

    /// Number of iterations (inner attempts) consumed.
    pub fn iterations(&self) -> usize {
        self.summary.iterations
    }
}

/// Candidate/current model lifecycle shared by the dense and sparse providers.
pub trait ModelProvider {
    /// Number of internal model parameters (columns of the Jacobian).
    fn parameter_count(&self) -> usize;

    /// Computes the candidate model as `current - deltas`.
    fn apply_correction(&mut self, deltas: &DVector<f64>);

    /// Robust error of the candidate model.
    ///
    /// `weighted_errors` receives the (weighted) residual vector. For non-standard estimators
    /// `weights` receives one weight per residual entry; for the standard estimator it must be
    /// left empty. Returns `f64::MAX` if the candidate is invalid.
    fn determine_robust_error(
        &self,
        estimator: Estimator,
        weighted_errors: &mut DVector<f64>,
        weights: &mut DVector<f64>,
    ) -> f64;

    /// Promotes the candidate model to the current model.
    fn accept_correction(&mut self);
}

/// Provider with a dense Jacobian.
pub trait DenseProvider: ModelProvider {
    /// Jacobian of the residual vector at the current model.
    fn determine_jacobian(&self) -> DMatrix<f64>;

    /// Solves the damped normal equations; overriding allows closed-form solvers.
    fn solve(
        &self,
        hessian: &DMatrix<f64>,
        error_jacobian: &DVector<f64>,
    ) -> LinAlgResult<DVector<f64>> {
        dense::solve_symmetric(hessian, error_jacobian)
    }
}

/// Provider with a sparse Jacobian.
pub trait SparseProvider: ModelProvider {
    /// Jacobian of the residual vector at the current model.
    fn determine_jacobian(&self) -> LinAlgResult<SparseColMat<usize, f64>>;

    /// Block structure of `JᵀJ`, enabling the Schur complement solve.
    fn block_layout(&self) -> Option<BlockLayout> {
        None
    }
}
