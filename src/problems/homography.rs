//! Homography refinement from 2D point correspondences.
//!
//! A homography `H` maps a left image point `(x, y)` to
//! `((h0·x + h3·y + h6) / w, (h1·x + h4·y + h7) / w)` with `w = h2·x + h5·y + h8`
//! (column-major parameters). Homographies are kept normalized to `h8 = 1`.
//!
//! Two optimizations are offered:
//! - [`optimize_homography`]: the dense universal adapter with numeric derivatives
//! - [`HomographyProvider`]: closed-form Jacobian with 8 or 9 parameters, usable with the standard
//!   dense loop ([`optimize_homography_analytic`]) and with the advanced loop

use nalgebra::{DMatrix, DVector, Matrix3, Vector2};
use tracing::warn;

use crate::core::{CoreError, CoreResult, EPS, Estimator, FixedVector};
use crate::error::LmResult;
use crate::linalg::dense;
use crate::optimizer::{
    AdvancedDenseProvider, DenseProvider, LevenbergMarquardt, LevenbergMarquardtConfig,
    ModelProvider, SolverResult,
};
use crate::universal::{DenseUniversalModel, optimize_universal_model, robust_error};

/// Scales `homography` so that its lower right element is one.
///
/// Returns `None` if that element is (almost) zero.
pub fn normalize_homography(homography: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let scale = homography[(2, 2)];
    (scale.abs() > EPS).then(|| homography / scale)
}

/// True for finite, non-singular matrices with a non-zero lower right element.
pub fn is_homography(homography: &Matrix3<f64>) -> bool {
    homography.iter().all(|v| v.is_finite())
        && homography[(2, 2)].abs() > EPS
        && homography.determinant().abs() > EPS
}

/// Maps `point` with `homography`, `None` if the point is mapped to infinity.
#[inline]
pub fn project(homography: &Matrix3<f64>, point: &Vector2<f64>) -> Option<Vector2<f64>> {
    let mapped = homography * point.push(1.0);
    (mapped.z.abs() > EPS).then(|| Vector2::new(mapped.x / mapped.z, mapped.y / mapped.z))
}

fn check_correspondences(left: &[Vector2<f64>], right: &[Vector2<f64>]) -> CoreResult<()> {
    if left.len() != right.len() {
        warn!(
            "Homography with {} left but {} right points",
            left.len(),
            right.len()
        );
        return Err(CoreError::DimensionMismatch(format!(
            "{} left points but {} right points",
            left.len(),
            right.len()
        ))
        .log());
    }
    if left.len() < 4 {
        return Err(CoreError::InvalidInput(format!(
            "a homography needs at least 4 correspondences, got {}",
            left.len()
        ))
        .log());
    }
    Ok(())
}

fn normalized_input(homography: &Matrix3<f64>) -> CoreResult<Matrix3<f64>> {
    normalize_homography(homography)
        .filter(is_homography)
        .ok_or_else(|| CoreError::InvalidInput("initial homography is singular".to_string()).log())
}

/// Correspondences seen through the dense universal adapter.
pub struct HomographyData<'a> {
    left: &'a [Vector2<f64>],
    right: &'a [Vector2<f64>],
}

impl<'a> HomographyData<'a> {
    pub fn new(left: &'a [Vector2<f64>], right: &'a [Vector2<f64>]) -> Self {
        Self { left, right }
    }
}

impl DenseUniversalModel<9, 2, 9> for HomographyData<'_> {
    fn value(&self, external: &FixedVector<f64, 9>, index: usize) -> FixedVector<f64, 2> {
        let homography = Matrix3::from_column_slice(external.as_slice());
        project(&homography, &self.left[index])
            .map(|p| FixedVector::from([p.x, p.y]))
            .unwrap_or_default()
    }

    fn error(&self, external: &FixedVector<f64, 9>, index: usize) -> Option<FixedVector<f64, 2>> {
        let homography = Matrix3::from_column_slice(external.as_slice());
        if !is_homography(&homography) {
            return None;
        }
        let mapped = project(&homography, &self.left[index])?;
        let error = mapped - self.right[index];
        Some(FixedVector::from([error.x, error.y]))
    }

    fn transform(
        &self,
        internal: &FixedVector<f64, 9>,
    ) -> (FixedVector<f64, 9>, FixedVector<f64, 9>) {
        let homography = Matrix3::from_column_slice(internal.as_slice());
        match normalize_homography(&homography) {
            Some(normalized) => {
                let model = FixedVector::from_prefix(normalized.as_slice());
                (model, model)
            }
            None => (*internal, *internal),
        }
    }
}

/// Optimizes a homography with the dense universal adapter.
///
/// The result is normalized to `h8 = 1`.
///
/// # Errors
/// - `CoreError::DimensionMismatch` if `left` and `right` differ in length
/// - `CoreError::InvalidInput` for fewer than 4 correspondences or a singular initial homography
/// - the optimizer errors of [`LevenbergMarquardt::optimize_dense`]
pub fn optimize_homography(
    homography: &Matrix3<f64>,
    left: &[Vector2<f64>],
    right: &[Vector2<f64>],
    config: &LevenbergMarquardtConfig,
) -> LmResult<SolverResult<Matrix3<f64>>> {
    check_correspondences(left, right)?;
    let initial = normalized_input(homography)?;

    let mut data = HomographyData::new(left, right);
    let model = FixedVector::from_prefix(initial.as_slice());
    let result = optimize_universal_model::<_, 9, 2, 9>(&mut data, &model, left.len(), config)?;

    let optimized = Matrix3::from_column_slice(result.parameters.as_slice());
    Ok(result.with_parameters(optimized))
}

/// Homography optimization with a closed-form Jacobian.
///
/// With 9 parameters every corrected candidate is renormalized to `h8 = 1`; with 8 parameters
/// `h8` stays fixed at one.
pub struct HomographyProvider<'a> {
    left: &'a [Vector2<f64>],
    right: &'a [Vector2<f64>],
    homography: Matrix3<f64>,
    candidate: Matrix3<f64>,
    parameters: usize,
}

impl<'a> HomographyProvider<'a> {
    /// # Errors
    /// Returns `CoreError` for mismatching or too few correspondences, a parameter count other
    /// than 8 or 9, or a singular homography.
    pub fn new(
        homography: &Matrix3<f64>,
        left: &'a [Vector2<f64>],
        right: &'a [Vector2<f64>],
        parameters: usize,
    ) -> CoreResult<Self> {
        check_correspondences(left, right)?;
        if !(8..=9).contains(&parameters) {
            return Err(CoreError::InvalidInput(format!(
                "a homography has 8 or 9 parameters, got {}",
                parameters
            ))
            .log());
        }
        let homography = normalized_input(homography)?;

        Ok(Self {
            left,
            right,
            homography,
            candidate: homography,
            parameters,
        })
    }

    /// The current (best) homography.
    pub fn homography(&self) -> &Matrix3<f64> {
        &self.homography
    }

    fn residuals(&self, homography: &Matrix3<f64>) -> Option<Vec<FixedVector<f64, 2>>> {
        if !is_homography(homography) {
            return None;
        }
        self.left
            .iter()
            .zip(self.right)
            .map(|(left, right)| {
                let error = project(homography, left)? - right;
                Some(FixedVector::from([error.x, error.y]))
            })
            .collect()
    }

    /// Jacobian of the mapped points with respect to the homography parameters.
    fn jacobian(&self) -> DMatrix<f64> {
        let h = &self.homography;
        let mut jacobian = DMatrix::zeros(2 * self.left.len(), self.parameters);

        for (n, point) in self.left.iter().enumerate() {
            let (x, y) = (point.x, point.y);
            let w = h[(2, 0)] * x + h[(2, 1)] * y + h[(2, 2)];
            if w.abs() <= EPS {
                continue;
            }
            let u = (h[(0, 0)] * x + h[(0, 1)] * y + h[(0, 2)]) / w;
            let v = (h[(1, 0)] * x + h[(1, 1)] * y + h[(1, 2)]) / w;
            let inv_w = 1.0 / w;

            let row_u = [x, 0.0, -x * u, y, 0.0, -y * u, 1.0, 0.0, -u];
            let row_v = [0.0, x, -x * v, 0.0, y, -y * v, 0.0, 1.0, -v];
            for parameter in 0..self.parameters {
                jacobian[(2 * n, parameter)] = row_u[parameter] * inv_w;
                jacobian[(2 * n + 1, parameter)] = row_v[parameter] * inv_w;
            }
        }
        jacobian
    }
}

impl ModelProvider for HomographyProvider<'_> {
    fn parameter_count(&self) -> usize {
        self.parameters
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        let mut candidate = self.homography;
        for (n, value) in candidate.iter_mut().enumerate().take(self.parameters) {
            *value -= deltas[n];
        }
        self.candidate = match self.parameters {
            9 => normalize_homography(&candidate).unwrap_or(candidate),
            _ => candidate,
        };
    }

    fn determine_robust_error(
        &self,
        estimator: Estimator,
        weighted_errors: &mut DVector<f64>,
        weights: &mut DVector<f64>,
    ) -> f64 {
        match self.residuals(&self.candidate) {
            Some(errors) => {
                robust_error(estimator, &errors, self.parameters, weighted_errors, weights)
            }
            None => f64::MAX,
        }
    }

    fn accept_correction(&mut self) {
        self.homography = self.candidate;
    }
}

impl DenseProvider for HomographyProvider<'_> {
    fn determine_jacobian(&self) -> DMatrix<f64> {
        self.jacobian()
    }
}

impl AdvancedDenseProvider for HomographyProvider<'_> {
    fn determine_error(&mut self) -> f64 {
        match self.residuals(&self.candidate) {
            Some(errors) => {
                errors.iter().map(FixedVector::squared_norm).sum::<f64>() / errors.len() as f64
            }
            None => f64::MAX,
        }
    }

    fn determine_hessian_and_error_jacobian(
        &mut self,
        hessian: &mut DMatrix<f64>,
        error_jacobian: &mut DVector<f64>,
    ) -> bool {
        let Some(errors) = self.residuals(&self.homography) else {
            return false;
        };
        let residuals = DVector::from_iterator(
            2 * errors.len(),
            errors.iter().flat_map(|e| e.iter().copied()),
        );

        match dense::normal_equations(&self.jacobian(), &residuals, None) {
            Ok((h, g)) => {
                *hessian = h;
                *error_jacobian = g;
                true
            }
            Err(_) => false,
        }
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        ModelProvider::apply_correction(self, deltas);
    }

    fn accept_correction(&mut self) {
        ModelProvider::accept_correction(self);
    }
}

/// Optimizes a homography with the closed-form Jacobian of [`HomographyProvider`].
///
/// # Errors
/// The input errors of [`HomographyProvider::new`] and the optimizer errors of
/// [`LevenbergMarquardt::optimize_dense`].
pub fn optimize_homography_analytic(
    homography: &Matrix3<f64>,
    left: &[Vector2<f64>],
    right: &[Vector2<f64>],
    parameters: usize,
    config: &LevenbergMarquardtConfig,
) -> LmResult<SolverResult<Matrix3<f64>>> {
    let mut provider = HomographyProvider::new(homography, left, right, parameters)?;
    let result = LevenbergMarquardt::with_config(config.clone()).optimize_dense(&mut provider)?;
    Ok(result.with_parameters(provider.homography))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::matrix;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn ground_truth() -> Matrix3<f64> {
        matrix![
            1.1, 0.05, 12.0;
            -0.02, 0.95, -7.0;
            0.0002, -0.0001, 1.0
        ]
    }

    fn correspondences(homography: &Matrix3<f64>) -> (Vec<Vector2<f64>>, Vec<Vector2<f64>>) {
        let left: Vec<Vector2<f64>> = (0..12)
            .map(|i| Vector2::new(20.0 + 37.0 * (i % 4) as f64, 15.0 + 41.0 * (i / 4) as f64))
            .collect();
        let right = left
            .iter()
            .filter_map(|p| project(homography, p))
            .collect();
        (left, right)
    }

    #[test]
    fn test_project_and_normalize() {
        let homography = ground_truth() * 3.0;
        let normalized = normalize_homography(&homography);
        assert!(normalized.is_some());
        if let Some(normalized) = normalized {
            assert_relative_eq!(normalized, ground_truth(), epsilon = 1e-12);
        }
        assert!(normalize_homography(&Matrix3::zeros()).is_none());
        assert!(!is_homography(&Matrix3::zeros()));
        let degenerate = matrix![1.0, 0.0, 0.0; 0.0, 1.0, 0.0; 1.0, 0.0, 0.0];
        assert!(project(&degenerate, &Vector2::zeros()).is_none());
    }

    #[test]
    fn test_universal_and_analytic_jacobians_agree() {
        let (left, right) = correspondences(&ground_truth());
        let provider = HomographyProvider::new(&ground_truth(), &left, &right, 9);
        assert!(provider.is_ok());
        let Ok(provider) = provider else { return };
        let analytic = provider.jacobian();

        let data = HomographyData::new(&left, &right);
        let model = FixedVector::<f64, 9>::from_prefix(ground_truth().as_slice());
        for (n, _) in left.iter().enumerate().take(3) {
            let value = data.value(&model, n);
            for parameter in 0..8 {
                let mut perturbed = model;
                perturbed[parameter] += 1e-7;
                let derivative = (data.value(&perturbed, n)[0] - value[0]) / 1e-7;
                assert_relative_eq!(
                    derivative,
                    analytic[(2 * n, parameter)],
                    epsilon = 1e-5,
                    max_relative = 1e-4
                );
            }
        }
    }

    #[test]
    fn test_analytic_provider_recovers_homography() -> TestResult {
        let truth = ground_truth();
        let (left, right) = correspondences(&truth);
        let mut initial = truth;
        initial[(0, 2)] += 3.0;
        initial[(1, 1)] -= 0.05;

        for parameters in [8, 9] {
            let config = LevenbergMarquardtConfig::new().with_max_iterations(30);
            let result =
                optimize_homography_analytic(&initial, &left, &right, parameters, &config)?;
            assert_relative_eq!(result.parameters, truth, epsilon = 1e-6);
            assert!(result.final_error < 1e-10);
        }
        Ok(())
    }

    #[test]
    fn test_advanced_gauss_newton_mode() -> TestResult {
        let truth = ground_truth();
        let (left, right) = correspondences(&truth);
        let mut initial = truth;
        initial[(0, 2)] += 0.5;

        let mut provider = HomographyProvider::new(&initial, &left, &right, 8)?;
        let config = LevenbergMarquardtConfig::new()
            .with_max_iterations(10)
            .with_damping(0.0)
            .with_damping_factor(1.0);
        let result =
            LevenbergMarquardt::with_config(config).optimize_advanced_dense(&mut provider)?;

        assert!(result.final_error < result.initial_error);
        assert_relative_eq!(*provider.homography(), truth, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_input_validation() {
        let (left, right) = correspondences(&ground_truth());
        let config = LevenbergMarquardtConfig::new();

        assert!(optimize_homography(&ground_truth(), &left[..3], &right[..3], &config).is_err());
        assert!(optimize_homography(&ground_truth(), &left, &right[..5], &config).is_err());
        assert!(optimize_homography(&Matrix3::zeros(), &left, &right, &config).is_err());
        assert!(HomographyProvider::new(&ground_truth(), &left, &right, 7).is_err());
    }
}
