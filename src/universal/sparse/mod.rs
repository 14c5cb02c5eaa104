//! Sparse universal adapters for problems split into model families.
//!
//! | Adapter | Families | Columns | Schur layout |
//! |---|---|---|---|
//! | [`shared_individual`] | one shared, `n` individual | `S + i·I` | `A` dense, `D` blocks of `I` |
//! | [`individual_individual`] | `f` first, `s` second | first `F·j`, second `F·f + i·SEC` | `A` blocks of `F`, `D` blocks of `SEC` |
//! | [`shared_individual_individual`] | one shared, `f` first, `s` second | shifted by `S` | `A` dense, `D` blocks of `SEC` |
//!
//! Elements always belong to the last family: rows are grouped per individual (or second)
//! model, `R` rows per element. Each element row block touches the shared columns (if any), the
//! columns of its own model and, for the two-family adapters, the columns of the first model its
//! value reports. Every such entry is written, zeros included, so the sparsity pattern never
//! changes during an optimization.

pub mod individual_individual;
pub mod shared_individual;
pub mod shared_individual_individual;

pub use individual_individual::{IndividualIndividualModel, optimize_individual_individual};
pub use shared_individual::{SharedIndividualModel, optimize_shared_individual};
pub use shared_individual_individual::{
    SharedIndividualIndividualModel, optimize_shared_individual_individual,
};

use nalgebra::DVector;

use crate::core::FixedVector;

/// `model - deltas[offset..offset + N]`.
#[inline]
pub(crate) fn corrected<const N: usize>(
    model: &FixedVector<f64, N>,
    deltas: &DVector<f64>,
    offset: usize,
) -> FixedVector<f64, N> {
    let mut candidate = *model;
    for parameter in 0..N {
        candidate[parameter] -= deltas[offset + parameter];
    }
    candidate
}

/// Transforms every model, keeping the renormalized internal models.
pub(crate) fn transform_all<const N: usize, const E: usize>(
    models: &mut [FixedVector<f64, N>],
    transform: impl Fn(&FixedVector<f64, N>) -> (FixedVector<f64, E>, FixedVector<f64, N>),
) -> Vec<FixedVector<f64, E>> {
    models
        .iter_mut()
        .map(|model| {
            let (external, renormalized) = transform(model);
            *model = renormalized;
            external
        })
        .collect()
}

/// For every internal parameter `a`, the external models of all models with parameter `a`
/// shifted by `WEAK_EPS`.
pub(crate) fn perturbed_families<const N: usize, const E: usize>(
    models: &[FixedVector<f64, N>],
    transform: impl Fn(&FixedVector<f64, N>) -> FixedVector<f64, E>,
) -> Vec<Vec<FixedVector<f64, E>>> {
    let per_model: Vec<Vec<FixedVector<f64, E>>> = models
        .iter()
        .map(|model| super::perturbed_externals(model, &transform))
        .collect();

    (0..N)
        .map(|parameter| per_model.iter().map(|p| p[parameter]).collect())
        .collect()
}
