//! Providers that build the normal equations themselves.
//!
//! Analytic problems often know `JᵀJ` and `Jᵀe` in closed form, without ever materializing the
//! Jacobian. These providers hand the optimizer the normal equations directly and may end the
//! optimization early through [`AdvancedDenseProvider::should_stop`].
//!
//! Two step modes are supported:
//! - Levenberg-Marquardt (`damping > 0`, `damping_factor > 1`): steps are damped and rejected
//!   unless they strictly decrease the error
//! - Gauss-Newton (`damping == 0`, `damping_factor == 1`): every solved step is accepted

use faer::sparse::SparseColMat;
use nalgebra::{DMatrix, DVector};

use crate::linalg::{LinAlgResult, SparseCholeskySolver, dense, sparse};
use crate::optimizer::levenberg_marquardt::{DenseSystem, StepControl};
use crate::optimizer::{LevenbergMarquardt, OptimizerError, OptimizerResult, SolverResult};

/// Provider owning the dense normal equations.
pub trait AdvancedDenseProvider {
    /// Error of the candidate model, `f64::MAX` if the candidate is invalid.
    fn determine_error(&mut self) -> f64;

    /// Writes `JᵀJ` and `Jᵀe` of the current model, resizing both as needed.
    ///
    /// Returns `false` if the system cannot be determined.
    fn determine_hessian_and_error_jacobian(
        &mut self,
        hessian: &mut DMatrix<f64>,
        error_jacobian: &mut DVector<f64>,
    ) -> bool;

    /// Computes the candidate model as `current - deltas`.
    fn apply_correction(&mut self, deltas: &DVector<f64>);

    /// Promotes the candidate model to the current model.
    fn accept_correction(&mut self);

    /// Checked before every attempt; `true` ends the optimization.
    fn should_stop(&self) -> bool {
        false
    }

    /// Solves the already damped normal equations.
    fn solve(
        &self,
        hessian: &DMatrix<f64>,
        error_jacobian: &DVector<f64>,
    ) -> LinAlgResult<DVector<f64>> {
        dense::solve_symmetric(hessian, error_jacobian)
    }
}

/// Provider owning the sparse normal equations and their damping.
pub trait AdvancedSparseProvider {
    /// Error of the candidate model, `f64::MAX` if the candidate is invalid.
    fn determine_error(&mut self) -> f64;

    /// `JᵀJ` and `Jᵀe` of the current model, `None` if they cannot be determined.
    fn determine_hessian_and_error_jacobian(
        &mut self,
    ) -> Option<(SparseColMat<usize, f64>, DVector<f64>)>;

    /// Computes the candidate model as `current - deltas`.
    fn apply_correction(&mut self, deltas: &DVector<f64>);

    /// Promotes the candidate model to the current model.
    fn accept_correction(&mut self);

    /// Checked before every attempt; `true` ends the optimization.
    fn should_stop(&self) -> bool {
        false
    }

    /// Solves `(JᵀJ + λ·diag(JᵀJ))·δ = Jᵀe`.
    ///
    /// The default damps the diagonal multiplicatively and factorizes with sparse Cholesky.
    fn solve(
        &mut self,
        hessian: &SparseColMat<usize, f64>,
        error_jacobian: &DVector<f64>,
        lambda: f64,
    ) -> LinAlgResult<DVector<f64>> {
        let diagonal = sparse::diagonal(hessian);
        let damped = sparse::damped(hessian, &diagonal, lambda)?;
        SparseCholeskySolver::new().solve(&damped, error_jacobian)
    }
}

struct AdvancedDenseStepper<'a, P> {
    provider: &'a mut P,
}

impl<P: AdvancedDenseProvider> StepControl for AdvancedDenseStepper<'_, P> {
    type System = DenseSystem;

    fn evaluate(&mut self) -> OptimizerResult<f64> {
        Ok(self.provider.determine_error())
    }

    fn adopt_evaluation(&mut self) {}

    fn linearize(&mut self) -> OptimizerResult<DenseSystem> {
        let mut hessian = DMatrix::zeros(0, 0);
        let mut error_jacobian = DVector::zeros(0);
        if !self
            .provider
            .determine_hessian_and_error_jacobian(&mut hessian, &mut error_jacobian)
        {
            return Err(OptimizerError::JacobianFailed(
                "provider could not determine the normal equations".to_string(),
            )
            .log());
        }
        check_system(hessian.nrows(), hessian.ncols(), error_jacobian.len())?;

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
    }

    fn should_stop(&self) -> bool {
        self.provider.should_stop()
    }

    fn gradient_norm(&self, system: &DenseSystem) -> f64 {
        system.error_jacobian.norm()
    }
}

struct AdvancedSparseStepper<'a, P> {
    provider: &'a mut P,
}

impl<P: AdvancedSparseProvider> StepControl for AdvancedSparseStepper<'_, P> {
    type System = (SparseColMat<usize, f64>, DVector<f64>);

    fn evaluate(&mut self) -> OptimizerResult<f64> {
        Ok(self.provider.determine_error())
    }

    fn adopt_evaluation(&mut self) {}

    fn linearize(&mut self) -> OptimizerResult<Self::System> {
        let (hessian, error_jacobian) = self
            .provider
            .determine_hessian_and_error_jacobian()
            .ok_or_else(|| {
                OptimizerError::JacobianFailed(
                    "provider could not determine the normal equations".to_string(),
                )
                .log()
            })?;
        check_system(hessian.nrows(), hessian.ncols(), error_jacobian.len())?;
        Ok((hessian, error_jacobian))
    }

    fn solve(&mut self, system: &mut Self::System, lambda: f64) -> LinAlgResult<DVector<f64>> {
        let (hessian, error_jacobian) = system;
        self.provider.solve(hessian, error_jacobian, lambda)
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        self.provider.apply_correction(deltas);
    }

    fn accept_correction(&mut self) {
        self.provider.accept_correction();
    }

    fn should_stop(&self) -> bool {
        self.provider.should_stop()
    }

    fn gradient_norm(&self, system: &Self::System) -> f64 {
        system.1.norm()
    }
}

fn check_system(rows: usize, cols: usize, rhs: usize) -> OptimizerResult<()> {
    if rows != cols || rows != rhs || rows == 0 {
        return Err(OptimizerError::ProviderContract(format!(
            "normal equations of size {}x{} with right-hand side of length {}",
            rows, cols, rhs
        ))
        .log());
    }
    Ok(())
}

impl LevenbergMarquardt {
    /// Optimizes a provider owning dense normal equations.
    ///
    /// # Errors
    /// Besides the errors of [`LevenbergMarquardt::optimize_dense`], fails with
    /// `OptimizerError::JacobianFailed` when the provider cannot build its system.
    pub fn optimize_advanced_dense<P: AdvancedDenseProvider>(
        &self,
        provider: &mut P,
    ) -> OptimizerResult<SolverResult<()>> {
        self.config().validate_advanced()?;
        let use_lm = self.config().uses_levenberg_marquardt();
        self.iterate(AdvancedDenseStepper { provider }, use_lm)
    }

    /// Optimizes a provider owning sparse normal equations.
    pub fn optimize_advanced_sparse<P: AdvancedSparseProvider>(
        &self,
        provider: &mut P,
    ) -> OptimizerResult<SolverResult<()>> {
        self.config().validate_advanced()?;
        let use_lm = self.config().uses_levenberg_marquardt();
        self.iterate(AdvancedSparseStepper { provider }, use_lm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::TripletBuilder;
    use crate::optimizer::{LevenbergMarquardtConfig, OptimizationStatus};
    use approx::assert_relative_eq;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Line `y = m·x + c` through noisy samples, with closed-form normal equations.
    struct LineFit {
        samples: Vec<(f64, f64)>,
        model: [f64; 2],
        candidate: [f64; 2],
        stop_after_accepts: Option<usize>,
        accepts: usize,
    }

    impl LineFit {
        fn new() -> Self {
            let samples = vec![(0.0, 1.1), (1.0, 2.9), (2.0, 5.2), (3.0, 6.8), (4.0, 9.1)];
            Self {
                samples,
                model: [0.0, 0.0],
                candidate: [0.0, 0.0],
                stop_after_accepts: None,
                accepts: 0,
            }
        }

        fn normal_equations(&self) -> (DMatrix<f64>, DVector<f64>) {
            let mut hessian = DMatrix::zeros(2, 2);
            let mut error_jacobian = DVector::zeros(2);
            for &(x, y) in &self.samples {
                let residual = self.model[0] * x + self.model[1] - y;
                let row = [x, 1.0];
                for r in 0..2 {
                    error_jacobian[r] += row[r] * residual;
                    for c in 0..2 {
                        hessian[(r, c)] += row[r] * row[c];
                    }
                }
            }
            (hessian, error_jacobian)
        }

        fn error_of(&self, model: &[f64; 2]) -> f64 {
            self.samples
                .iter()
                .map(|&(x, y)| (model[0] * x + model[1] - y).powi(2))
                .sum::<f64>()
                / self.samples.len() as f64
        }
    }

    impl AdvancedDenseProvider for LineFit {
        fn determine_error(&mut self) -> f64 {
            self.error_of(&self.candidate)
        }

        fn determine_hessian_and_error_jacobian(
            &mut self,
            hessian: &mut DMatrix<f64>,
            error_jacobian: &mut DVector<f64>,
        ) -> bool {
            (*hessian, *error_jacobian) = self.normal_equations();
            true
        }

        fn apply_correction(&mut self, deltas: &DVector<f64>) {
            self.candidate = [self.model[0] - deltas[0], self.model[1] - deltas[1]];
        }

        fn accept_correction(&mut self) {
            self.model = self.candidate;
            self.accepts += 1;
        }

        fn should_stop(&self) -> bool {
            self.stop_after_accepts
                .is_some_and(|limit| self.accepts >= limit)
        }
    }

    impl AdvancedSparseProvider for LineFit {
        fn determine_error(&mut self) -> f64 {
            self.error_of(&self.candidate)
        }

        fn determine_hessian_and_error_jacobian(
            &mut self,
        ) -> Option<(SparseColMat<usize, f64>, DVector<f64>)> {
            let (hessian, error_jacobian) = self.normal_equations();
            let mut builder = TripletBuilder::new(2, 2);
            for c in 0..2 {
                for r in 0..2 {
                    builder.push(r, c, hessian[(r, c)]);
                }
            }
            Some((builder.build().ok()?, error_jacobian))
        }

        fn apply_correction(&mut self, deltas: &DVector<f64>) {
            AdvancedDenseProvider::apply_correction(self, deltas);
        }

        fn accept_correction(&mut self) {
            AdvancedDenseProvider::accept_correction(self);
        }
    }

    /// Least-squares line through the samples.
    fn expected_line() -> (f64, f64) {
        let samples = LineFit::new().samples;
        let n = samples.len() as f64;
        let sx: f64 = samples.iter().map(|s| s.0).sum();
        let sy: f64 = samples.iter().map(|s| s.1).sum();
        let sxx: f64 = samples.iter().map(|s| s.0 * s.0).sum();
        let sxy: f64 = samples.iter().map(|s| s.0 * s.1).sum();
        let slope = (n * sxy - sx * sy) / (n * sxx - sx * sx);
        (slope, (sy - slope * sx) / n)
    }

    #[test]
    fn test_gauss_newton_solves_linear_problem_in_one_step() -> TestResult {
        let config = LevenbergMarquardtConfig::new()
            .with_damping(0.0)
            .with_damping_factor(1.0)
            .with_max_iterations(3);
        let mut provider = LineFit::new();

        let result =
            LevenbergMarquardt::with_config(config).optimize_advanced_dense(&mut provider)?;

        let (slope, intercept) = expected_line();
        assert_relative_eq!(provider.model[0], slope, epsilon = 1e-10);
        assert_relative_eq!(provider.model[1], intercept, epsilon = 1e-10);
        assert!(result.summary.iteration_history.iter().all(|s| s.accepted));
        Ok(())
    }

    #[test]
    fn test_levenberg_marquardt_mode_matches_sparse() -> TestResult {
        let config = LevenbergMarquardtConfig::new().with_max_iterations(20);
        let solver = LevenbergMarquardt::with_config(config);

        let mut dense_provider = LineFit::new();
        solver.optimize_advanced_dense(&mut dense_provider)?;

        let mut sparse_provider = LineFit::new();
        let result = solver.optimize_advanced_sparse(&mut sparse_provider)?;

        assert_relative_eq!(dense_provider.model[0], sparse_provider.model[0], epsilon = 1e-8);
        assert_relative_eq!(dense_provider.model[1], sparse_provider.model[1], epsilon = 1e-8);
        assert!(result.final_error < result.initial_error);
        Ok(())
    }

    #[test]
    fn test_should_stop_terminates() -> TestResult {
        let mut provider = LineFit::new();
        provider.stop_after_accepts = Some(1);

        let result = LevenbergMarquardt::with_config(
            LevenbergMarquardtConfig::new().with_max_iterations(20),
        )
        .optimize_advanced_dense(&mut provider)?;

        assert_eq!(result.status, OptimizationStatus::UserTerminated);
        assert_eq!(provider.accepts, 1);
        Ok(())
    }

    #[test]
    fn test_mixed_mode_is_rejected() {
        let mut provider = LineFit::new();
        let config = LevenbergMarquardtConfig::new()
            .with_damping(0.0)
            .with_damping_factor(10.0);
        let result = LevenbergMarquardt::with_config(config).optimize_advanced_dense(&mut provider);
        assert!(matches!(result, Err(OptimizerError::InvalidParameters(_))));
    }
}
