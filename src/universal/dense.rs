//! Dense universal adapter: one model, numeric Jacobian, dense normal equations.

use nalgebra::{DMatrix, DVector};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::warn;

use crate::core::{CoreError, Estimator, FixedVector};
use crate::error::LmResult;
use crate::optimizer::{
    DenseProvider, LevenbergMarquardt, LevenbergMarquardtConfig, ModelProvider, SolverResult,
};
use crate::universal::{forward_difference, perturbed_externals, robust_error};

/// A problem with `M` internal parameters, `E` external parameters and `R`-dimensional
/// element results.
///
/// `value` and `error` must be deterministic; `error` returns `None` when the element cannot
/// be evaluated for the given model, which invalidates the whole candidate.
pub trait DenseUniversalModel<const M: usize, const R: usize, const E: usize>: Sync {
    fn value(&self, external: &FixedVector<f64, E>, index: usize) -> FixedVector<f64, R>;

    fn error(&self, external: &FixedVector<f64, E>, index: usize) -> Option<FixedVector<f64, R>>;

    /// Returns the external model and the renormalized internal model.
    fn transform(
        &self,
        internal: &FixedVector<f64, M>,
    ) -> (FixedVector<f64, E>, FixedVector<f64, M>);

    /// Adjusts a freshly corrected candidate before it is transformed and scored.
    fn adjust(&self, _candidate: &mut FixedVector<f64, M>) {}

    /// Called with the initial model and with every accepted model.
    fn model_accepted(&mut self, _model: &FixedVector<f64, M>) {}
}

struct DenseUniversalProvider<'a, D, const M: usize, const R: usize, const E: usize> {
    data: &'a mut D,
    model: FixedVector<f64, M>,
    candidate: FixedVector<f64, M>,
    candidate_external: FixedVector<f64, E>,
    number_elements: usize,
}

impl<'a, D, const M: usize, const R: usize, const E: usize> DenseUniversalProvider<'a, D, M, R, E>
where
    D: DenseUniversalModel<M, R, E>,
{
    fn new(data: &'a mut D, model: FixedVector<f64, M>, number_elements: usize) -> Self {
        let (candidate_external, candidate) = data.transform(&model);
        Self {
            data,
            model,
            candidate,
            candidate_external,
            number_elements,
        }
    }

    /// The `R x M` Jacobian block of one element, row-major.
    fn element_jacobian(
        &self,
        external: &FixedVector<f64, E>,
        perturbed: &[FixedVector<f64, E>],
        index: usize,
    ) -> Vec<f64> {
        let value = self.data.value(external, index);
        let mut block = vec![0.0; R * M];
        for (parameter, perturbed_external) in perturbed.iter().enumerate() {
            let derivative =
                forward_difference(&self.data.value(perturbed_external, index), &value);
            for d in 0..R {
                block[d * M + parameter] = derivative[d];
            }
        }
        block
    }
}

impl<D, const M: usize, const R: usize, const E: usize> ModelProvider
    for DenseUniversalProvider<'_, D, M, R, E>
where
    D: DenseUniversalModel<M, R, E>,
{
    fn parameter_count(&self) -> usize {
        M
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        let mut candidate = self.model;
        for (parameter, delta) in deltas.iter().enumerate().take(M) {
            candidate[parameter] -= delta;
        }
        self.data.adjust(&mut candidate);

        let (external, renormalized) = self.data.transform(&candidate);
        self.candidate = renormalized;
        self.candidate_external = external;
    }

    fn determine_robust_error(
        &self,
        estimator: Estimator,
        weighted_errors: &mut DVector<f64>,
        weights: &mut DVector<f64>,
    ) -> f64 {
        let mut errors = Vec::with_capacity(self.number_elements);
        for index in 0..self.number_elements {
            match self.data.error(&self.candidate_external, index) {
                Some(error) => errors.push(error),
                None => return f64::MAX,
            }
        }

        robust_error(estimator, &errors, M, weighted_errors, weights)
    }

    fn accept_correction(&mut self) {
        self.model = self.candidate;
        self.data.model_accepted(&self.model);
    }
}

impl<D, const M: usize, const R: usize, const E: usize> DenseProvider
    for DenseUniversalProvider<'_, D, M, R, E>
where
    D: DenseUniversalModel<M, R, E>,
{
    fn determine_jacobian(&self) -> DMatrix<f64> {
        let (external, _) = self.data.transform(&self.model);
        let perturbed = perturbed_externals(&self.model, |model| self.data.transform(model).0);

        #[cfg(feature = "parallel")]
        let blocks: Vec<Vec<f64>> = (0..self.number_elements)
            .into_par_iter()
            .map(|index| self.element_jacobian(&external, &perturbed, index))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let blocks: Vec<Vec<f64>> = (0..self.number_elements)
            .map(|index| self.element_jacobian(&external, &perturbed, index))
            .collect();

        let mut jacobian = DMatrix::zeros(R * self.number_elements, M);
        for (index, block) in blocks.iter().enumerate() {
            for d in 0..R {
                for parameter in 0..M {
                    jacobian[(index * R + d, parameter)] = block[d * M + parameter];
                }
            }
        }
        jacobian
    }
}

/// Optimizes a model of a [`DenseUniversalModel`] over `number_elements` elements.
///
/// Returns the optimized internal model together with the error statistics. `model_accepted`
/// is called with the initial model first and then with every improved model.
///
/// # Errors
/// - `CoreError::InvalidInput` if `number_elements` is zero
/// - `OptimizerError::InvalidInitialModel` if the initial model cannot be evaluated
/// - `OptimizerError::NoValidIteration` if not a single step could be solved
///
/// # Example
/// ```
/// use lm_universal::core::FixedVector;
/// use lm_universal::optimizer::LevenbergMarquardtConfig;
/// use lm_universal::universal::{DenseUniversalModel, optimize_universal_model};
///
/// /// `y = a·x + b`
/// struct Line(Vec<(f64, f64)>);
///
/// impl DenseUniversalModel<2, 1, 2> for Line {
///     fn value(&self, model: &FixedVector<f64, 2>, index: usize) -> FixedVector<f64, 1> {
///         FixedVector::from([model[0] * self.0[index].0 + model[1]])
///     }
///
///     fn error(&self, model: &FixedVector<f64, 2>, index: usize) -> Option<FixedVector<f64, 1>> {
///         Some(FixedVector::from([self.value(model, index)[0] - self.0[index].1]))
///     }
///
///     fn transform(&self, internal: &FixedVector<f64, 2>) -> (FixedVector<f64, 2>, FixedVector<f64, 2>) {
///         (*internal, *internal)
///     }
/// }
///
/// let mut line = Line(vec![(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)]);
/// let config = LevenbergMarquardtConfig::new().with_max_iterations(10);
/// let result = optimize_universal_model::<_, 2, 1, 2>(&mut line, &FixedVector::from([0.0, 0.0]), 3, &config)?;
/// assert!((result.parameters[0] - 2.0).abs() < 1e-6);
/// # Ok::<(), lm_universal::error::LmError>(())
/// ```
pub fn optimize_universal_model<D, const M: usize, const R: usize, const E: usize>(
    data: &mut D,
    model: &FixedVector<f64, M>,
    number_elements: usize,
    config: &LevenbergMarquardtConfig,
) -> LmResult<SolverResult<FixedVector<f64, M>>>
where
    D: DenseUniversalModel<M, R, E>,
{
    if number_elements == 0 {
        warn!("Dense universal optimization without elements");
        return Err(CoreError::InvalidInput("no elements to optimize".to_string()).into());
    }

    data.model_accepted(model);

    let mut provider = DenseUniversalProvider::new(data, *model, number_elements);
    let result = LevenbergMarquardt::with_config(config.clone()).optimize_dense(&mut provider)?;

    Ok(result.with_parameters(provider.model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// `y = a·exp(b·x)` with a transform that clamps nothing and a count of accepted models.
    struct Exponential {
        samples: Vec<(f64, f64)>,
        accepted: Vec<FixedVector<f64, 2>>,
    }

    impl Exponential {
        fn new(a: f64, b: f64) -> Self {
            let samples = (0..10)
                .map(|i| {
                    let x = i as f64 * 0.2;
                    (x, a * (b * x).exp())
                })
                .collect();
            Self {
                samples,
                accepted: Vec::new(),
            }
        }
    }

    impl DenseUniversalModel<2, 1, 2> for Exponential {
        fn value(&self, external: &FixedVector<f64, 2>, index: usize) -> FixedVector<f64, 1> {
            let x = self.samples[index].0;
            FixedVector::from([external[0] * (external[1] * x).exp()])
        }

        fn error(
            &self,
            external: &FixedVector<f64, 2>,
            index: usize,
        ) -> Option<FixedVector<f64, 1>> {
            if external[0] <= 0.0 {
                return None;
            }
            let value = self.value(external, index);
            Some(FixedVector::from([value[0] - self.samples[index].1]))
        }

        fn transform(
            &self,
            internal: &FixedVector<f64, 2>,
        ) -> (FixedVector<f64, 2>, FixedVector<f64, 2>) {
            (*internal, *internal)
        }

        fn model_accepted(&mut self, model: &FixedVector<f64, 2>) {
            self.accepted.push(*model);
        }
    }

    #[test]
    fn test_numeric_jacobian_matches_analytic() {
        let mut data = Exponential::new(1.5, 0.7);
        let model = FixedVector::from([1.2, 0.5]);
        let provider = DenseUniversalProvider::<_, 2, 1, 2>::new(&mut data, model, 10);

        let jacobian = provider.determine_jacobian();

        assert_eq!(jacobian.shape(), (10, 2));
        for (row, &(x, _)) in provider.data.samples.iter().enumerate() {
            let e = (0.5 * x).exp();
            assert_relative_eq!(jacobian[(row, 0)], e, epsilon = 1e-4);
            assert_relative_eq!(jacobian[(row, 1)], 1.2 * x * e, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_invalid_candidate_reports_maximum() {
        let mut data = Exponential::new(1.5, 0.7);
        let mut provider =
            DenseUniversalProvider::<_, 2, 1, 2>::new(&mut data, FixedVector::from([1.0, 0.5]), 10);

        provider.apply_correction(&DVector::from_vec(vec![2.0, 0.0]));

        let mut weighted = DVector::zeros(0);
        let mut weights = DVector::zeros(0);
        let error = provider.determine_robust_error(Estimator::Square, &mut weighted, &mut weights);
        assert_eq!(error, f64::MAX);
    }

    #[test]
    fn test_recovers_model_and_notifies_acceptance() -> TestResult {
        let mut data = Exponential::new(1.5, 0.7);
        let initial = FixedVector::from([1.0, 0.5]);
        let config = LevenbergMarquardtConfig::new().with_max_iterations(30);

        let result = optimize_universal_model::<_, 2, 1, 2>(&mut data, &initial, 10, &config)?;

        assert_relative_eq!(result.parameters[0], 1.5, epsilon = 1e-5);
        assert_relative_eq!(result.parameters[1], 0.7, epsilon = 1e-5);
        assert!(data.accepted[0].bitwise_eq(&initial));
        assert_eq!(data.accepted.len(), result.summary.successful_steps + 1);
        Ok(())
    }

    #[test]
    fn test_zero_elements_rejected() {
        let mut data = Exponential::new(1.0, 1.0);
        let result = optimize_universal_model::<_, 2, 1, 2>(
            &mut data,
            &FixedVector::from([1.0, 1.0]),
            0,
            &LevenbergMarquardtConfig::new(),
        );
        assert!(result.is_err());
    }
}
