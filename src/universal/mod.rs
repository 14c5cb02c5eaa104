//! Universal adapters turning caller-defined residual functions into optimizer providers.
//!
//! A problem only describes how a model maps to per-element values and errors; the adapters
//! compute forward-difference Jacobians, robust errors and the candidate/current lifecycle.
//!
//! - [`dense`]: one model, dense Jacobian
//! - [`sparse`]: shared and individual model families with a block-sparse Jacobian
//!
//! Every model has an *internal* representation (optimized parameters) and an *external* one
//! (what the value and error functions read). `transform` maps internal to external and returns
//! the renormalized internal model next to it. Candidates keep the renormalized model; models
//! perturbed for the Jacobian discard it.

pub mod dense;
pub mod sparse;

pub use dense::{DenseUniversalModel, optimize_universal_model};
pub use sparse::{
    IndividualIndividualModel, SharedIndividualIndividualModel, SharedIndividualModel,
    optimize_individual_individual, optimize_shared_individual,
    optimize_shared_individual_individual,
};

use nalgebra::DVector;
use tracing::warn;

use crate::core::{CoreError, CoreResult, Estimator, FixedVector, WEAK_EPS};

/// External models of `model` with each internal parameter shifted by `WEAK_EPS` in turn.
pub(crate) fn perturbed_externals<const N: usize, const E: usize>(
    model: &FixedVector<f64, N>,
    transform: impl Fn(&FixedVector<f64, N>) -> FixedVector<f64, E>,
) -> Vec<FixedVector<f64, E>> {
    (0..N)
        .map(|parameter| {
            let mut perturbed = *model;
            perturbed[parameter] += WEAK_EPS;
            transform(&perturbed)
        })
        .collect()
}

/// Forward difference `(perturbed - value) / WEAK_EPS`.
#[inline]
pub(crate) fn forward_difference<const R: usize>(
    perturbed: &FixedVector<f64, R>,
    value: &FixedVector<f64, R>,
) -> FixedVector<f64, R> {
    let mut derivative = FixedVector::new();
    for d in 0..R {
        derivative[d] = (perturbed[d] - value[d]) / WEAK_EPS;
    }
    derivative
}

/// Collects element residuals and reduces them to a robust error.
///
/// Writes the residuals of `errors` into `weighted_errors` (`R` entries per element). The
/// standard estimator returns the mean squared element error and leaves `weights` untouched;
/// every other estimator fills `weights` and scales `weighted_errors`.
pub(crate) fn robust_error<const R: usize>(
    estimator: Estimator,
    errors: &[FixedVector<f64, R>],
    model_parameters: usize,
    weighted_errors: &mut DVector<f64>,
    weights: &mut DVector<f64>,
) -> f64 {
    *weighted_errors = DVector::from_iterator(
        errors.len() * R,
        errors.iter().flat_map(|error| error.iter().copied()),
    );

    if estimator.is_standard() {
        let sqr_error: f64 = errors.iter().map(FixedVector::squared_norm).sum();
        return sqr_error / errors.len() as f64;
    }

    let sqr_errors: Vec<f64> = errors.iter().map(FixedVector::squared_norm).collect();
    *weights = DVector::zeros(weighted_errors.len());
    estimator.sqr_errors_to_robust_errors(
        &sqr_errors,
        model_parameters,
        weighted_errors.as_mut_slice(),
        weights.as_mut_slice(),
        R,
    )
}

/// Checks per-model element counts and returns their sum.
pub(crate) fn total_elements(counts: &[usize], models: usize, family: &str) -> CoreResult<usize> {
    if counts.len() != models {
        warn!(
            "{} {} models but {} element counts",
            models,
            family,
            counts.len()
        );
        return Err(CoreError::DimensionMismatch(format!(
            "{} {} models need {} element counts, got {}",
            models,
            family,
            models,
            counts.len()
        ))
        .log());
    }

    let total: usize = counts.iter().sum();
    if total == 0 {
        return Err(CoreError::InvalidInput("no elements to optimize".to_string()).log());
    }
    Ok(total)
}

/// Row offset of every model's first residual row, `R` rows per element.
pub(crate) fn row_offsets(counts: &[usize], result_dimension: usize) -> Vec<usize> {
    counts
        .iter()
        .scan(0, |row, &count| {
            let start = *row;
            *row += count * result_dimension;
            Some(start)
        })
        .collect()
}
