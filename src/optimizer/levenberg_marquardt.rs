//! Levenberg-Marquardt iteration with multiplicative damping and strict step acceptance.
//!
//! Every outer iteration linearizes the provider at the current model and builds the normal
//! equations
//!
//! ```text
//! (JᵀWJ)·δ = JᵀWe
//! ```
//!
//! where `W` holds the robust weights of the previous evaluation (identity for least squares).
//! The inner loop then tries damped steps until one improves the robust error:
//!
//! ```text
//! (JᵀWJ)ₙₙ ← diag(JᵀWJ)ₙ · (1 + λ)
//! candidate = current - δ
//! ```
//!
//! ## Step Acceptance and Damping Update
//!
//! - **candidate error < current error**: the candidate becomes the current model, `λ ← λ / f`
//!   and a new Jacobian is computed
//! - **candidate error ≥ current error** (including invalid candidates reporting `f64::MAX`):
//!   the candidate is discarded, `λ ← λ · f` and the same normal equations are solved again
//! - **singular system**: treated like a rejected step
//!
//! Once `λ` exceeds the maximum damping no further improvement is possible and the loop stops.
//! Each inner attempt consumes one unit of the iteration budget, so `max_iterations` bounds the
//! number of linear solves. A step whose mean magnitude falls below `EPS` ends the run as
//! converged; heavily damped steps are small but not negligible.
//!
//! ## Guarantees
//!
//! - The final error never exceeds the initial error (non-improving steps are never accepted)
//! - Reaching the iteration budget is a normal outcome, not an error
//! - An invalid initial model or a run without a single solvable system is an error
//!
//! # Example
//!
//! ```no_run
//! use lm_universal::core::Estimator;
//! use lm_universal::optimizer::LevenbergMarquardtConfig;
//!
//! let config = LevenbergMarquardtConfig::new()
//!     .with_max_iterations(20)
//!     .with_estimator(Estimator::Huber)
//!     .with_damping(1e-3)
//!     .with_damping_factor(5.0);
//! assert!(config.validate().is_ok());
//! ```

use std::mem;
use std::{
    fmt,
    fmt::{Display, Formatter},
};

use faer::sparse::SparseColMat;
use nalgebra::{DMatrix, DVector};
use tracing::debug;
use web_time::{Duration, Instant};

use crate::core::{EPS, Estimator};
use crate::linalg::{
    self, BlockLayout, LinAlgResult, LinearSolverType, SparseCholeskySolver, dense, schur,
};
use crate::optimizer::{
    DenseProvider, ModelProvider, OptimizationStatus, OptimizerError, OptimizerResult,
    SolverResult, SparseProvider,
};

/// Summary statistics for one Levenberg-Marquardt run.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtSummary {
    /// Robust error of the initial model
    pub initial_error: f64,
    /// Robust error of the final model
    pub final_error: f64,
    /// Number of inner attempts (linear solves) performed
    pub iterations: usize,
    /// Number of accepted steps
    pub successful_steps: usize,
    /// Number of rejected steps (error did not decrease)
    pub unsuccessful_steps: usize,
    /// Number of attempts whose linear system could not be solved
    pub failed_solves: usize,
    /// Number of Jacobian (linearization) evaluations
    pub jacobian_evaluations: usize,
    /// Number of robust error evaluations, the initial one included
    pub error_evaluations: usize,
    /// Damping value after the last attempt
    pub final_damping: f64,
    /// Total time elapsed
    pub total_time: Duration,
    /// Average time per attempt
    pub average_time_per_iteration: Duration,
    /// Per-attempt statistics
    pub iteration_history: Vec<IterationStats>,
    /// Terminal state
    pub convergence_status: OptimizationStatus,
}

impl Display for LevenbergMarquardtSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Levenberg-Marquardt Final Result")?;

        if self.convergence_status.is_converged() {
            writeln!(f, "CONVERGED ({})", self.convergence_status)?;
        } else {
            writeln!(f, "STOPPED ({})", self.convergence_status)?;
        }

        writeln!(f)?;
        writeln!(f, "Robust error:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_error)?;
        writeln!(f, "  Final:     {:.6e}", self.final_error)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_error - self.final_error,
            100.0 * (self.initial_error - self.final_error) / self.initial_error.max(EPS)
        )?;
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Total:              {}", self.iterations)?;
        writeln!(
            f,
            "  Successful steps:   {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(
            f,
            "  Unsuccessful steps: {} ({:.1}%)",
            self.unsuccessful_steps,
            100.0 * self.unsuccessful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(f, "  Failed solves:      {}", self.failed_solves)?;
        writeln!(f, "  Final damping:      {:.2e}", self.final_damping)?;
        writeln!(f)?;
        writeln!(f, "Evaluations:")?;
        writeln!(f, "  Jacobians: {}", self.jacobian_evaluations)?;
        writeln!(f, "  Errors:    {}", self.error_evaluations)?;
        writeln!(f)?;
        writeln!(f, "Performance:")?;
        writeln!(
            f,
            "  Total time:             {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "  Average per iteration:  {:.2}ms",
            self.average_time_per_iteration.as_secs_f64() * 1000.0
        )?;

        Ok(())
    }
}

/// Per-attempt statistics (Ceres-style table when DEBUG logging is enabled).
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Attempt number, starting at 1
    pub iteration: usize,
    /// Robust error of the current model after this attempt
    pub error: f64,
    /// Reduction of the current error achieved by this attempt
    pub error_change: f64,
    /// L2 norm of `JᵀWe`
    pub gradient_norm: f64,
    /// L2 norm of the step (0 when the system could not be solved)
    pub step_norm: f64,
    /// Damping λ used for this attempt
    pub damping: f64,
    /// Time taken for this attempt in milliseconds
    pub iter_time_ms: f64,
    /// Total elapsed time since optimization started in milliseconds
    pub total_time_ms: f64,
    /// Whether the linear system was solved
    pub solved: bool,
    /// Whether the candidate was accepted
    pub accepted: bool,
}

impl IterationStats {
    /// Print table header in Ceres-style format
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}  {:>11}  {:>11}  {:>13}  {:>6}",
            "iter",
            "error",
            "error_change",
            "|gradient|",
            "|step|",
            "damping",
            "iter_time",
            "total_time",
            "status"
        );
    }

    /// Print single attempt line with scientific notation
    pub fn print_line(&self) {
        let status = if !self.solved {
            "singular"
        } else if self.accepted {
            "✓"
        } else {
            "✗"
        };

        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>13.2e}  {:>13.2e}  {:>11.2e}  {:>9.2}ms  {:>11.2}ms  {:>6}",
            self.iteration,
            self.error,
            self.error_change,
            self.gradient_norm,
            self.step_norm,
            self.damping,
            self.iter_time_ms,
            self.total_time_ms,
            status
        );
    }
}

/// Configuration parameters for the Levenberg-Marquardt optimizer.
///
/// ```
/// use lm_universal::optimizer::LevenbergMarquardtConfig;
/// use lm_universal::linalg::LinearSolverType;
///
/// let config = LevenbergMarquardtConfig::new()
///     .with_max_iterations(10)
///     .with_damping(1e-2)
///     .with_linear_solver_type(LinearSolverType::SparseCholesky);
/// assert_eq!(config.max_iterations, 10);
/// ```
///
/// # Damping Parameter Behavior
///
/// - **Initial damping** (`damping`, default 1e-3): λ of the first attempt; `0` gives Gauss-Newton steps
/// - **Damping factor** (`damping_factor`, default 5): λ is multiplied on rejection and divided on acceptance
/// - **Maximum damping** (`max_damping`, default 1e8): beyond this λ the run stops
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtConfig {
    /// Linear solver for sparse providers
    pub linear_solver_type: LinearSolverType,
    /// Maximum number of attempts (linear solves)
    pub max_iterations: usize,
    /// Robust estimator weighting the residuals
    pub estimator: Estimator,
    /// Initial damping parameter λ
    pub damping: f64,
    /// Factor by which λ grows on rejection and shrinks on acceptance
    pub damping_factor: f64,
    /// Largest λ that is still increased
    pub max_damping: f64,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            linear_solver_type: LinearSolverType::default(),
            max_iterations: 5,
            estimator: Estimator::Square,
            damping: 1e-3,
            damping_factor: 5.0,
            max_damping: 1e8,
        }
    }
}

impl LevenbergMarquardtConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_estimator(mut self, estimator: Estimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_damping_factor(mut self, damping_factor: f64) -> Self {
        self.damping_factor = damping_factor;
        self
    }

    pub fn with_max_damping(mut self, max_damping: f64) -> Self {
        self.max_damping = max_damping;
        self
    }

    /// True when steps are damped and rejected steps are retried.
    ///
    /// With `damping == 0` and `damping_factor == 1` the advanced loops perform plain
    /// Gauss-Newton steps that are always accepted.
    pub fn uses_levenberg_marquardt(&self) -> bool {
        self.damping > 0.0 && self.damping_factor > 1.0
    }

    /// Checks the configuration for the standard loops.
    ///
    /// # Errors
    /// Returns `OptimizerError::InvalidParameters` for a zero iteration budget, a negative or
    /// non-finite damping, a damping factor below one or a damping above its maximum.
    pub fn validate(&self) -> OptimizerResult<()> {
        if self.max_iterations == 0 {
            return Err(OptimizerError::InvalidParameters(
                "max_iterations must be at least 1".to_string(),
            )
            .log());
        }
        if !self.damping.is_finite() || self.damping < 0.0 {
            return Err(OptimizerError::InvalidParameters(format!(
                "damping must be finite and non-negative, got {}",
                self.damping
            ))
            .log());
        }
        if !self.damping_factor.is_finite() || self.damping_factor < 1.0 {
            return Err(OptimizerError::InvalidParameters(format!(
                "damping_factor must be at least 1, got {}",
                self.damping_factor
            ))
            .log());
        }
        if self.damping > self.max_damping {
            return Err(OptimizerError::InvalidParameters(format!(
                "damping {} exceeds max_damping {}",
                self.damping, self.max_damping
            ))
            .log());
        }
        Ok(())
    }

    /// Checks the configuration for the advanced loops, which additionally require either
    /// Levenberg-Marquardt (`damping > 0`, `damping_factor > 1`) or Gauss-Newton
    /// (`damping == 0`, `damping_factor == 1`).
    pub fn validate_advanced(&self) -> OptimizerResult<()> {
        self.validate()?;
        let gauss_newton = self.damping == 0.0 && self.damping_factor == 1.0;
        if !gauss_newton && !self.uses_levenberg_marquardt() {
            return Err(OptimizerError::InvalidParameters(format!(
                "damping {} with factor {} is neither Levenberg-Marquardt nor Gauss-Newton",
                self.damping, self.damping_factor
            ))
            .log());
        }
        Ok(())
    }

    /// Print configuration parameters (DEBUG level)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:          Levenberg-Marquardt\n  Linear solver:   {}\n  Estimator:       {}\n  Max iterations:  {}\n  Initial damping: {:.2e}\n  Damping factor:  {:.2}\n  Max damping:     {:.2e}",
            self.linear_solver_type,
            self.estimator,
            self.max_iterations,
            self.damping,
            self.damping_factor,
            self.max_damping,
        );
    }
}

/// One linearize/solve/evaluate cycle, implemented once per provider flavour.
///
/// The driver in [`LevenbergMarquardt::iterate`] owns λ, the budget and acceptance; a stepper
/// only moves data between the provider and the linear solvers.
pub(crate) trait StepControl {
    /// Normal equations kept across the inner attempts of one outer iteration.
    type System;

    /// Scores the candidate model, keeping its residuals for a later acceptance.
    fn evaluate(&mut self) -> OptimizerResult<f64>;

    /// Takes over the residuals of the last evaluation without touching the model.
    fn adopt_evaluation(&mut self);

    /// Linearizes at the current model.
    fn linearize(&mut self) -> OptimizerResult<Self::System>;

    /// Solves the system damped with `lambda`.
    fn solve(&mut self, system: &mut Self::System, lambda: f64) -> LinAlgResult<DVector<f64>>;

    fn apply_correction(&mut self, deltas: &DVector<f64>);

    fn accept_correction(&mut self);

    fn should_stop(&self) -> bool {
        false
    }

    fn gradient_norm(&self, _system: &Self::System) -> f64 {
        0.0
    }
}

/// Residual vectors of the current model and of the latest candidate.
#[derive(Debug, Clone, Default)]
struct Residuals {
    weighted_errors: DVector<f64>,
    weights: DVector<f64>,
    candidate_errors: DVector<f64>,
    candidate_weights: DVector<f64>,
}

impl Residuals {
    fn new() -> Self {
        Self {
            weighted_errors: DVector::zeros(0),
            weights: DVector::zeros(0),
            candidate_errors: DVector::zeros(0),
            candidate_weights: DVector::zeros(0),
        }
    }

    fn evaluate<P: ModelProvider>(
        &mut self,
        provider: &P,
        estimator: Estimator,
    ) -> OptimizerResult<f64> {
        self.candidate_weights = DVector::zeros(0);
        let error = provider.determine_robust_error(
            estimator,
            &mut self.candidate_errors,
            &mut self.candidate_weights,
        );

        if error == f64::MAX {
            return Ok(error);
        }

        if estimator.is_standard() && !self.candidate_weights.is_empty() {
            return Err(OptimizerError::ProviderContract(
                "weight vector must stay empty for the standard estimator".to_string(),
            )
            .log());
        }
        if !estimator.is_standard() && self.candidate_weights.len() != self.candidate_errors.len()
        {
            return Err(OptimizerError::ProviderContract(format!(
                "expected {} weights for estimator {}, got {}",
                self.candidate_errors.len(),
                estimator,
                self.candidate_weights.len()
            ))
            .log());
        }
        Ok(error)
    }

    fn adopt(&mut self) {
        mem::swap(&mut self.weighted_errors, &mut self.candidate_errors);
        mem::swap(&mut self.weights, &mut self.candidate_weights);
    }

    fn weights(&self, estimator: Estimator) -> Option<&DVector<f64>> {
        (!estimator.is_standard()).then_some(&self.weights)
    }
}

pub(crate) struct DenseSystem {
    pub(crate) hessian: DMatrix<f64>,
    pub(crate) diagonal: DVector<f64>,
    pub(crate) error_jacobian: DVector<f64>,
}

struct DenseStepper<'a, P> {
    provider: &'a mut P,
    estimator: Estimator,
    residuals: Residuals,
}

impl<P: DenseProvider> StepControl for DenseStepper<'_, P> {
    type System = DenseSystem;

    fn evaluate(&mut self) -> OptimizerResult<f64> {
        self.residuals.evaluate(&*self.provider, self.estimator)
    }

    fn adopt_evaluation(&mut self) {
        self.residuals.adopt();
    }

    fn linearize(&mut self) -> OptimizerResult<DenseSystem> {
        let jacobian = self.provider.determine_jacobian();
        if jacobian.ncols() != self.provider.parameter_count() {
            return Err(OptimizerError::ProviderContract(format!(
                "Jacobian has {} columns for {} parameters",
                jacobian.ncols(),
                self.provider.parameter_count()
            ))
            .log());
        }

        let (hessian, error_jacobian) = dense::normal_equations(
            &jacobian,
            &self.residuals.weighted_errors,
            self.residuals.weights(self.estimator),
        )?;
        let diagonal = hessian.diagonal();

        Ok(DenseSystem {
            hessian,
            diagonal,
            error_jacobian,
        })
    }

    fn solve(&mut self, system: &mut DenseSystem, lambda: f64) -> LinAlgResult<DVector<f64>> {
        dense::apply_damping(&mut system.hessian, &system.diagonal, lambda);
        self.provider.solve(&system.hessian, &system.error_jacobian)
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        self.provider.apply_correction(deltas);
    }

    fn accept_correction(&mut self) {
        self.provider.accept_correction();
        self.residuals.adopt();
    }

    fn gradient_norm(&self, system: &DenseSystem) -> f64 {
        system.error_jacobian.norm()
    }
}

pub(crate) struct SparseSystem {
    hessian: SparseColMat<usize, f64>,
    diagonal: DVector<f64>,
    error_jacobian: DVector<f64>,
}

struct SparseStepper<'a, P> {
    provider: &'a mut P,
    estimator: Estimator,
    residuals: Residuals,
    layout: Option<BlockLayout>,
    cholesky: SparseCholeskySolver,
}

impl<P: SparseProvider> StepControl for SparseStepper<'_, P> {
    type System = SparseSystem;

    fn evaluate(&mut self) -> OptimizerResult<f64> {
        self.residuals.evaluate(&*self.provider, self.estimator)
    }

    fn adopt_evaluation(&mut self) {
        self.residuals.adopt();
    }

    fn linearize(&mut self) -> OptimizerResult<SparseSystem> {
        let jacobian = self.provider.determine_jacobian()?;
        if jacobian.ncols() != self.provider.parameter_count() {
            return Err(OptimizerError::ProviderContract(format!(
                "Jacobian has {} columns for {} parameters",
                jacobian.ncols(),
                self.provider.parameter_count()
            ))
            .log());
        }

        let (hessian, error_jacobian) = linalg::sparse::normal_equations(
            &jacobian,
            &self.residuals.weighted_errors,
            self.residuals.weights(self.estimator),
        )?;
        let diagonal = linalg::sparse::diagonal(&hessian);

        Ok(SparseSystem {
            hessian,
            diagonal,
            error_jacobian,
        })
    }

    fn solve(&mut self, system: &mut SparseSystem, lambda: f64) -> LinAlgResult<DVector<f64>> {
        let damped = linalg::sparse::damped(&system.hessian, &system.diagonal, lambda)?;
        match &self.layout {
            Some(layout) => schur::solve(&damped, &system.error_jacobian, layout),
            None => self.cholesky.solve(&damped, &system.error_jacobian),
        }
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        self.provider.apply_correction(deltas);
    }

    fn accept_correction(&mut self) {
        self.provider.accept_correction();
        self.residuals.adopt();
    }

    fn gradient_norm(&self, system: &SparseSystem) -> f64 {
        system.error_jacobian.norm()
    }
}

/// Levenberg-Marquardt optimizer for dense, sparse and advanced providers.
///
/// ```no_run
/// use lm_universal::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig};
///
/// let solver = LevenbergMarquardt::with_config(
///     LevenbergMarquardtConfig::new().with_max_iterations(20),
/// );
/// assert_eq!(solver.config().max_iterations, 20);
/// ```
#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
}

impl LevenbergMarquardt {
    /// Create a new solver with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new solver with the given configuration.
    pub fn with_config(config: LevenbergMarquardtConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    /// Optimizes a provider with a dense Jacobian.
    ///
    /// On success the provider holds the optimized model.
    pub fn optimize_dense<P: DenseProvider>(
        &self,
        provider: &mut P,
    ) -> OptimizerResult<SolverResult<()>> {
        self.config.validate()?;
        let stepper = DenseStepper {
            provider,
            estimator: self.config.estimator,
            residuals: Residuals::new(),
        };
        self.iterate(stepper, true)
    }

    /// Optimizes a provider with a sparse Jacobian.
    ///
    /// With [`LinearSolverType::Schur`] and a provider exposing a block layout the damped
    /// systems are solved by block elimination, otherwise by sparse Cholesky.
    pub fn optimize_sparse<P: SparseProvider>(
        &self,
        provider: &mut P,
    ) -> OptimizerResult<SolverResult<()>> {
        self.config.validate()?;
        let layout = match self.config.linear_solver_type {
            LinearSolverType::Schur => provider.block_layout(),
            LinearSolverType::SparseCholesky => None,
        };
        let stepper = SparseStepper {
            provider,
            estimator: self.config.estimator,
            residuals: Residuals::new(),
            layout,
            cholesky: SparseCholeskySolver::new(),
        };
        self.iterate(stepper, true)
    }

    /// The shared accept/reject state machine.
    ///
    /// With `use_lm == false` every solved step is accepted (Gauss-Newton).
    pub(crate) fn iterate<S: StepControl>(
        &self,
        mut stepper: S,
        use_lm: bool,
    ) -> OptimizerResult<SolverResult<()>> {
        let config = &self.config;
        let start_time = Instant::now();

        let mut best_error = stepper.evaluate()?;
        if best_error == f64::MAX {
            return Err(OptimizerError::InvalidInitialModel.log());
        }
        stepper.adopt_evaluation();

        let initial_error = best_error;
        let mut intermediate_errors = vec![initial_error];

        let mut lambda = config.damping;
        let mut status = OptimizationStatus::MaxIterationsReached;
        let mut iteration = 0;
        let mut one_valid_iteration = false;

        let mut successful_steps = 0;
        let mut unsuccessful_steps = 0;
        let mut failed_solves = 0;
        let mut jacobian_evaluations = 0;
        let mut error_evaluations = 1;
        let mut iteration_history = Vec::with_capacity(config.max_iterations);

        let debug_enabled = tracing::enabled!(tracing::Level::DEBUG);
        if debug_enabled {
            config.print_configuration();
            IterationStats::print_header();
        }

        'outer: while iteration < config.max_iterations {
            if stepper.should_stop() {
                status = OptimizationStatus::UserTerminated;
                break;
            }

            let mut system = stepper.linearize()?;
            jacobian_evaluations += 1;
            let gradient_norm = stepper.gradient_norm(&system);

            while iteration < config.max_iterations {
                if stepper.should_stop() {
                    status = OptimizationStatus::UserTerminated;
                    break 'outer;
                }

                iteration += 1;
                let iter_start = Instant::now();
                let damping = lambda;
                let previous_error = best_error;

                let mut stats = IterationStats {
                    iteration,
                    error: best_error,
                    error_change: 0.0,
                    gradient_norm,
                    step_norm: 0.0,
                    damping,
                    iter_time_ms: 0.0,
                    total_time_ms: 0.0,
                    solved: false,
                    accepted: false,
                };

                let mut stop = false;
                let mut next_outer = false;

                match stepper.solve(&mut system, lambda) {
                    Ok(deltas) => {
                        one_valid_iteration = true;
                        stats.solved = true;
                        stats.step_norm = deltas.norm();

                        let converged = stats.step_norm / deltas.len().max(1) as f64 <= EPS;

                        stepper.apply_correction(&deltas);
                        let candidate_error = stepper.evaluate()?;
                        error_evaluations += 1;

                        if use_lm && candidate_error >= best_error {
                            unsuccessful_steps += 1;
                            if lambda > 0.0 && lambda <= config.max_damping {
                                lambda *= config.damping_factor;
                            } else {
                                status = OptimizationStatus::DampingLimitReached;
                                stop = true;
                            }
                        } else {
                            best_error = candidate_error;
                            intermediate_errors.push(best_error);
                            stepper.accept_correction();
                            successful_steps += 1;
                            stats.accepted = true;

                            if use_lm && lambda > EPS {
                                lambda /= config.damping_factor;
                            }
                            next_outer = true;
                        }

                        if converged {
                            status = OptimizationStatus::Converged;
                            stop = true;
                        }
                    }
                    Err(e) => {
                        failed_solves += 1;
                        debug!("Attempt {} could not be solved: {}", iteration, e);
                        if lambda > EPS && lambda <= config.max_damping {
                            lambda *= config.damping_factor;
                        } else {
                            status = OptimizationStatus::DampingLimitReached;
                            stop = true;
                        }
                    }
                }

                stats.error = best_error;
                stats.error_change = previous_error - best_error;
                stats.iter_time_ms = iter_start.elapsed().as_secs_f64() * 1000.0;
                stats.total_time_ms = start_time.elapsed().as_secs_f64() * 1000.0;
                if debug_enabled {
                    stats.print_line();
                }
                iteration_history.push(stats);

                if stop {
                    break 'outer;
                }
                if next_outer {
                    continue 'outer;
                }
            }
        }

        if !one_valid_iteration {
            return Err(OptimizerError::NoValidIteration.log());
        }

        let total_time = start_time.elapsed();
        let summary = LevenbergMarquardtSummary {
            initial_error,
            final_error: best_error,
            iterations: iteration,
            successful_steps,
            unsuccessful_steps,
            failed_solves,
            jacobian_evaluations,
            error_evaluations,
            final_damping: lambda,
            total_time,
            average_time_per_iteration: if iteration > 0 {
                total_time / iteration as u32
            } else {
                Duration::from_secs(0)
            },
            iteration_history,
            convergence_status: status.clone(),
        };

        if debug_enabled {
            debug!("{}", summary);
        }

        Ok(SolverResult {
            parameters: (),
            status,
            initial_error,
            final_error: best_error,
            intermediate_errors,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse::TripletBuilder;
    use approx::assert_relative_eq;
    use std::cell::Cell;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Fits `y = a·exp(b·x)` with an analytic Jacobian.
    struct ExponentialProvider {
        samples: Vec<(f64, f64)>,
        model: [f64; 2],
        candidate: [f64; 2],
        /// Number of upcoming candidate evaluations that report an invalid model
        poisoned_evaluations: Cell<usize>,
        poison_first_candidate: bool,
    }

    impl ExponentialProvider {
        fn new(a: f64, b: f64, initial: [f64; 2]) -> Self {
            let samples = (0..12)
                .map(|i| {
                    let x = i as f64 * 0.25;
                    (x, a * (b * x).exp())
                })
                .collect();
            Self {
                samples,
                model: initial,
                candidate: initial,
                poisoned_evaluations: Cell::new(0),
                poison_first_candidate: false,
            }
        }

        fn residual(model: &[f64; 2], x: f64, y: f64) -> f64 {
            model[0] * (model[1] * x).exp() - y
        }

        fn jacobian_row(&self, x: f64) -> [f64; 2] {
            let e = (self.model[1] * x).exp();
            [e, self.model[0] * x * e]
        }
    }

    impl ModelProvider for ExponentialProvider {
        fn parameter_count(&self) -> usize {
            2
        }

        fn apply_correction(&mut self, deltas: &DVector<f64>) {
            if self.poison_first_candidate {
                self.poison_first_candidate = false;
                self.poisoned_evaluations.set(1);
            }
            self.candidate = [self.model[0] - deltas[0], self.model[1] - deltas[1]];
        }

        fn determine_robust_error(
            &self,
            estimator: Estimator,
            weighted_errors: &mut DVector<f64>,
            weights: &mut DVector<f64>,
        ) -> f64 {
            let poisoned = self.poisoned_evaluations.get();
            if poisoned > 0 {
                self.poisoned_evaluations.set(poisoned - 1);
                return f64::MAX;
            }

            *weighted_errors = DVector::from_iterator(
                self.samples.len(),
                self.samples
                    .iter()
                    .map(|&(x, y)| Self::residual(&self.candidate, x, y)),
            );
            let sqr_errors: Vec<f64> = weighted_errors.iter().map(|e| e * e).collect();

            if estimator.is_standard() {
                return sqr_errors.iter().sum::<f64>() / sqr_errors.len() as f64;
            }

            *weights = DVector::zeros(weighted_errors.len());
            estimator.sqr_errors_to_robust_errors(
                &sqr_errors,
                2,
                weighted_errors.as_mut_slice(),
                weights.as_mut_slice(),
                1,
            )
        }

        fn accept_correction(&mut self) {
            self.model = self.candidate;
        }
    }

    impl DenseProvider for ExponentialProvider {
        fn determine_jacobian(&self) -> DMatrix<f64> {
            let mut jacobian = DMatrix::zeros(self.samples.len(), 2);
            for (r, &(x, _)) in self.samples.iter().enumerate() {
                let row = self.jacobian_row(x);
                jacobian[(r, 0)] = row[0];
                jacobian[(r, 1)] = row[1];
            }
            jacobian
        }
    }

    impl SparseProvider for ExponentialProvider {
        fn determine_jacobian(&self) -> LinAlgResult<SparseColMat<usize, f64>> {
            let mut builder = TripletBuilder::new(self.samples.len(), 2);
            for (r, &(x, _)) in self.samples.iter().enumerate() {
                let row = self.jacobian_row(x);
                builder.push(r, 0, row[0]);
                builder.push(r, 1, row[1]);
            }
            builder.build()
        }
    }

    #[test]
    fn test_dense_recovers_exponential() -> TestResult {
        let mut provider = ExponentialProvider::new(2.0, 0.5, [1.5, 0.4]);
        let solver = LevenbergMarquardt::with_config(
            LevenbergMarquardtConfig::new().with_max_iterations(50),
        );

        let result = solver.optimize_dense(&mut provider)?;

        assert_relative_eq!(provider.model[0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(provider.model[1], 0.5, epsilon = 1e-6);
        assert!(result.final_error < 1e-12);
        assert!(result.final_error <= result.initial_error);
        assert_eq!(result.intermediate_errors[0], result.initial_error);
        assert_eq!(
            result.intermediate_errors.len(),
            result.summary.successful_steps + 1
        );
        Ok(())
    }

    #[test]
    fn test_sparse_matches_dense() -> TestResult {
        let config = LevenbergMarquardtConfig::new()
            .with_max_iterations(30)
            .with_linear_solver_type(LinearSolverType::SparseCholesky);
        let solver = LevenbergMarquardt::with_config(config);

        let mut dense_provider = ExponentialProvider::new(2.0, 0.5, [1.0, 0.3]);
        let dense_result = solver.optimize_dense(&mut dense_provider)?;

        let mut sparse_provider = ExponentialProvider::new(2.0, 0.5, [1.0, 0.3]);
        let sparse_result = solver.optimize_sparse(&mut sparse_provider)?;

        assert_relative_eq!(dense_provider.model[0], sparse_provider.model[0], epsilon = 1e-8);
        assert_relative_eq!(dense_provider.model[1], sparse_provider.model[1], epsilon = 1e-8);
        assert_relative_eq!(
            dense_result.final_error,
            sparse_result.final_error,
            epsilon = 1e-12
        );
        Ok(())
    }

    #[test]
    fn test_rejected_step_grows_damping_and_keeps_model() -> TestResult {
        let mut provider = ExponentialProvider::new(2.0, 0.5, [1.5, 0.4]);
        provider.poison_first_candidate = true;
        let config = LevenbergMarquardtConfig::new().with_max_iterations(10);
        let solver = LevenbergMarquardt::with_config(config.clone());

        let result = solver.optimize_dense(&mut provider)?;
        let history = &result.summary.iteration_history;

        assert!(history[0].solved);
        assert!(!history[0].accepted);
        assert_eq!(history[0].error, result.initial_error);
        assert_relative_eq!(history[1].damping, history[0].damping * config.damping_factor);
        // the second attempt reuses the first linearization
        assert_relative_eq!(history[1].gradient_norm, history[0].gradient_norm);
        assert!(result.summary.unsuccessful_steps >= 1);
        assert!(result.final_error < result.initial_error);
        Ok(())
    }

    /// `y = a·x + b` with a closed-form Jacobian.
    struct TinyLine {
        samples: Vec<(f64, f64)>,
        model: [f64; 2],
        candidate: [f64; 2],
    }

    impl TinyLine {
        fn new(a: f64, b: f64) -> Self {
            Self {
                samples: (0..10).map(|i| (i as f64, a * i as f64 + b)).collect(),
                model: [0.0, 0.0],
                candidate: [0.0, 0.0],
            }
        }
    }

    impl ModelProvider for TinyLine {
        fn parameter_count(&self) -> usize {
            2
        }

        fn apply_correction(&mut self, deltas: &DVector<f64>) {
            self.candidate = [self.model[0] - deltas[0], self.model[1] - deltas[1]];
        }

        fn determine_robust_error(
            &self,
            _estimator: Estimator,
            weighted_errors: &mut DVector<f64>,
            _weights: &mut DVector<f64>,
        ) -> f64 {
            *weighted_errors = DVector::from_iterator(
                self.samples.len(),
                self.samples
                    .iter()
                    .map(|&(x, y)| self.candidate[0] * x + self.candidate[1] - y),
            );
            weighted_errors.norm_squared() / self.samples.len() as f64
        }

        fn accept_correction(&mut self) {
            self.model = self.candidate;
        }
    }

    impl DenseProvider for TinyLine {
        fn determine_jacobian(&self) -> DMatrix<f64> {
            DMatrix::from_fn(self.samples.len(), 2, |row, col| {
                if col == 0 { self.samples[row].0 } else { 1.0 }
            })
        }
    }

    #[test]
    fn test_heavily_damped_small_steps_keep_iterating() -> TestResult {
        let mut provider = TinyLine::new(1e-5, 2e-6);
        let config = LevenbergMarquardtConfig::new()
            .with_damping(100.0)
            .with_max_iterations(30);

        let result = LevenbergMarquardt::with_config(config).optimize_dense(&mut provider)?;

        // the first damped step moves the slope by far less than WEAK_EPS
        assert!(result.summary.successful_steps > 1);
        assert_relative_eq!(provider.model[0], 1e-5, max_relative = 1e-4);
        assert_relative_eq!(provider.model[1], 2e-6, max_relative = 1e-3);
        assert!(result.final_error < 1e-6 * result.initial_error);
        Ok(())
    }

    #[test]
    fn test_invalid_initial_model_fails() {
        let mut provider = ExponentialProvider::new(2.0, 0.5, [1.0, 0.3]);
        provider.poisoned_evaluations.set(1);
        let result = LevenbergMarquardt::new().optimize_dense(&mut provider);
        assert!(matches!(result, Err(OptimizerError::InvalidInitialModel)));
    }

    #[test]
    fn test_robust_estimator_populates_weights() -> TestResult {
        let mut provider = ExponentialProvider::new(2.0, 0.5, [1.8, 0.45]);
        let solver = LevenbergMarquardt::with_config(
            LevenbergMarquardtConfig::new()
                .with_estimator(Estimator::Cauchy)
                .with_max_iterations(20),
        );
        let result = solver.optimize_dense(&mut provider)?;
        assert!(result.final_error < result.initial_error);
        assert!((provider.model[0] - 2.0).abs() < 0.2);
        Ok(())
    }

    #[test]
    fn test_config_validation() {
        assert!(LevenbergMarquardtConfig::new().validate().is_ok());
        assert!(
            LevenbergMarquardtConfig::new()
                .with_max_iterations(0)
                .validate()
                .is_err()
        );
        assert!(
            LevenbergMarquardtConfig::new()
                .with_damping(-1.0)
                .validate()
                .is_err()
        );
        assert!(
            LevenbergMarquardtConfig::new()
                .with_damping_factor(0.5)
                .validate()
                .is_err()
        );
        assert!(
            LevenbergMarquardtConfig::new()
                .with_damping(0.0)
                .with_damping_factor(1.0)
                .validate_advanced()
                .is_ok()
        );
        assert!(
            LevenbergMarquardtConfig::new()
                .with_damping(0.0)
                .with_damping_factor(5.0)
                .validate_advanced()
                .is_err()
        );
    }

    #[test]
    fn test_summary_display() -> TestResult {
        let mut provider = ExponentialProvider::new(2.0, 0.5, [1.9, 0.5]);
        let result = LevenbergMarquardt::new().optimize_dense(&mut provider)?;
        let text = result.summary.to_string();
        assert!(text.contains("Levenberg-Marquardt Final Result"));
        assert!(text.contains("Robust error:"));
        Ok(())
    }
}
