//! Two families of individual models, e.g. cameras (first) and points (second).
//!
//! Elements belong to second models. Every element depends on its own second model and on
//! exactly one first model, whose index the value function reports.

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::DVector;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::{CoreError, Estimator, FixedVector};
use crate::error::LmResult;
use crate::linalg::{BlockLayout, LinAlgError, LinAlgResult, TripletBuilder};
use crate::optimizer::{
    LevenbergMarquardt, LevenbergMarquardtConfig, ModelProvider, SolverResult, SparseProvider,
};
use crate::universal::sparse::{corrected, perturbed_families, transform_all};
use crate::universal::{forward_difference, robust_error, row_offsets, total_elements};

/// A problem with first models (`F` internal, `EF` external parameters) and second models
/// (`SEC` internal, `ESEC` external parameters).
pub trait IndividualIndividualModel<
    const F: usize,
    const SEC: usize,
    const R: usize,
    const EF: usize,
    const ESEC: usize,
>: Sync
{
    /// Value of one element of second model `second_index`, together with the index of the
    /// first model the element depends on.
    fn value(
        &self,
        firsts: &[FixedVector<f64, EF>],
        seconds: &[FixedVector<f64, ESEC>],
        second_index: usize,
        element_index: usize,
    ) -> (usize, FixedVector<f64, R>);

    fn error(
        &self,
        firsts: &[FixedVector<f64, EF>],
        seconds: &[FixedVector<f64, ESEC>],
        second_index: usize,
        element_index: usize,
    ) -> Option<FixedVector<f64, R>>;

    fn transform_first(
        &self,
        internal: &FixedVector<f64, F>,
    ) -> (FixedVector<f64, EF>, FixedVector<f64, F>);

    fn transform_second(
        &self,
        internal: &FixedVector<f64, SEC>,
    ) -> (FixedVector<f64, ESEC>, FixedVector<f64, SEC>);

    fn model_accepted(
        &mut self,
        _firsts: &[FixedVector<f64, F>],
        _seconds: &[FixedVector<f64, SEC>],
    ) {
    }
}

struct IndividualIndividualProvider<
    'a,
    D,
    const F: usize,
    const SEC: usize,
    const R: usize,
    const EF: usize,
    const ESEC: usize,
> {
    data: &'a mut D,
    firsts: Vec<FixedVector<f64, F>>,
    seconds: Vec<FixedVector<f64, SEC>>,
    candidate_firsts: Vec<FixedVector<f64, F>>,
    candidate_seconds: Vec<FixedVector<f64, SEC>>,
    candidate_first_externals: Vec<FixedVector<f64, EF>>,
    candidate_second_externals: Vec<FixedVector<f64, ESEC>>,
    element_counts: Vec<usize>,
    row_offsets: Vec<usize>,
    total_elements: usize,
}

/// Current external models and their perturbations, shared by all element groups.
struct Linearization<const EF: usize, const ESEC: usize> {
    firsts: Vec<FixedVector<f64, EF>>,
    seconds: Vec<FixedVector<f64, ESEC>>,
    perturbed_firsts: Vec<Vec<FixedVector<f64, EF>>>,
    perturbed_seconds: Vec<Vec<FixedVector<f64, ESEC>>>,
}

impl<'a, D, const F: usize, const SEC: usize, const R: usize, const EF: usize, const ESEC: usize>
    IndividualIndividualProvider<'a, D, F, SEC, R, EF, ESEC>
where
    D: IndividualIndividualModel<F, SEC, R, EF, ESEC>,
{
    fn new(
        data: &'a mut D,
        firsts: Vec<FixedVector<f64, F>>,
        seconds: Vec<FixedVector<f64, SEC>>,
        element_counts: Vec<usize>,
        total_elements: usize,
    ) -> Self {
        let mut provider = Self {
            data,
            candidate_firsts: firsts.clone(),
            candidate_seconds: seconds.clone(),
            firsts,
            seconds,
            candidate_first_externals: Vec::new(),
            candidate_second_externals: Vec::new(),
            row_offsets: row_offsets(&element_counts, R),
            element_counts,
            total_elements,
        };
        provider.transform_candidates();
        provider
    }

    fn transform_candidates(&mut self) {
        let data = &*self.data;
        self.candidate_first_externals =
            transform_all(&mut self.candidate_firsts, |m| data.transform_first(m));
        self.candidate_second_externals =
            transform_all(&mut self.candidate_seconds, |m| data.transform_second(m));
    }

    fn linearization(&self) -> Linearization<EF, ESEC> {
        let data = &*self.data;
        Linearization {
            firsts: self.firsts.iter().map(|m| data.transform_first(m).0).collect(),
            seconds: self.seconds.iter().map(|m| data.transform_second(m).0).collect(),
            perturbed_firsts: perturbed_families(&self.firsts, |m| data.transform_first(m).0),
            perturbed_seconds: perturbed_families(&self.seconds, |m| data.transform_second(m).0),
        }
    }

    fn first_column(&self, first_index: usize) -> usize {
        first_index * F
    }

    fn second_column(&self, second_index: usize) -> usize {
        self.firsts.len() * F + second_index * SEC
    }

    /// Jacobian entries of all elements of one second model.
    fn second_triplets(
        &self,
        second_index: usize,
        linearization: &Linearization<EF, ESEC>,
    ) -> LinAlgResult<Vec<Triplet<usize, usize, f64>>> {
        let data = &*self.data;
        let count = self.element_counts[second_index];
        let column_second = self.second_column(second_index);
        let mut triplets = Vec::with_capacity(count * R * (F + SEC));

        for element in 0..count {
            let row = self.row_offsets[second_index] + element * R;
            let (first_index, value) = data.value(
                &linearization.firsts,
                &linearization.seconds,
                second_index,
                element,
            );
            if first_index >= self.firsts.len() {
                return Err(LinAlgError::DimensionMismatch(format!(
                    "element {} of second model {} refers to first model {} of {}",
                    element,
                    second_index,
                    first_index,
                    self.firsts.len()
                ))
                .log());
            }

            let column_first = self.first_column(first_index);
            for (parameter, firsts) in linearization.perturbed_firsts.iter().enumerate() {
                let (_, perturbed) =
                    data.value(firsts, &linearization.seconds, second_index, element);
                let derivative = forward_difference(&perturbed, &value);
                for d in 0..R {
                    triplets.push(Triplet::new(row + d, column_first + parameter, derivative[d]));
                }
            }

            for (parameter, seconds) in linearization.perturbed_seconds.iter().enumerate() {
                let (_, perturbed) =
                    data.value(&linearization.firsts, seconds, second_index, element);
                let derivative = forward_difference(&perturbed, &value);
                for d in 0..R {
                    triplets.push(Triplet::new(row + d, column_second + parameter, derivative[d]));
                }
            }
        }
        Ok(triplets)
    }
}

impl<D, const F: usize, const SEC: usize, const R: usize, const EF: usize, const ESEC: usize>
    ModelProvider for IndividualIndividualProvider<'_, D, F, SEC, R, EF, ESEC>
where
    D: IndividualIndividualModel<F, SEC, R, EF, ESEC>,
{
    fn parameter_count(&self) -> usize {
        F * self.firsts.len() + SEC * self.seconds.len()
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        for (index, first) in self.firsts.iter().enumerate() {
            self.candidate_firsts[index] = corrected(first, deltas, index * F);
        }
        let offset = F * self.firsts.len();
        for (index, second) in self.seconds.iter().enumerate() {
            self.candidate_seconds[index] = corrected(second, deltas, offset + index * SEC);
        }
        self.transform_candidates();
    }

    fn determine_robust_error(
        &self,
        estimator: Estimator,
        weighted_errors: &mut DVector<f64>,
        weights: &mut DVector<f64>,
    ) -> f64 {
        let mut errors = Vec::with_capacity(self.total_elements);
        for (second_index, &count) in self.element_counts.iter().enumerate() {
            for element in 0..count {
                match self.data.error(
                    &self.candidate_first_externals,
                    &self.candidate_second_externals,
                    second_index,
                    element,
                ) {
                    Some(error) => errors.push(error),
                    None => return f64::MAX,
                }
            }
        }

        robust_error(
            estimator,
            &errors,
            self.parameter_count(),
            weighted_errors,
            weights,
        )
    }

    fn accept_correction(&mut self) {
        self.firsts.clone_from(&self.candidate_firsts);
        self.seconds.clone_from(&self.candidate_seconds);
        self.data.model_accepted(&self.firsts, &self.seconds);
    }
}

impl<D, const F: usize, const SEC: usize, const R: usize, const EF: usize, const ESEC: usize>
    SparseProvider for IndividualIndividualProvider<'_, D, F, SEC, R, EF, ESEC>
where
    D: IndividualIndividualModel<F, SEC, R, EF, ESEC>,
{
    fn determine_jacobian(&self) -> LinAlgResult<SparseColMat<usize, f64>> {
        let linearization = self.linearization();

        #[cfg(feature = "parallel")]
        let groups: Vec<Vec<Triplet<usize, usize, f64>>> = (0..self.seconds.len())
            .into_par_iter()
            .map(|index| self.second_triplets(index, &linearization))
            .collect::<LinAlgResult<_>>()?;

        #[cfg(not(feature = "parallel"))]
        let groups: Vec<Vec<Triplet<usize, usize, f64>>> = (0..self.seconds.len())
            .map(|index| self.second_triplets(index, &linearization))
            .collect::<LinAlgResult<_>>()?;

        let mut builder = TripletBuilder::with_capacity(
            R * self.total_elements,
            self.parameter_count(),
            R * self.total_elements * (F + SEC),
        );
        for mut group in groups {
            builder.append(&mut group);
        }
        builder.build()
    }

    fn block_layout(&self) -> Option<BlockLayout> {
        Some(BlockLayout::new(F * self.firsts.len(), Some(F), SEC))
    }
}

/// Optimizes two families of individual models.
///
/// `element_counts[i]` is the number of elements owned by `seconds[i]`. Returns the optimized
/// first and second internal models.
///
/// # Errors
/// - `CoreError::InvalidInput` if there are no first models or no elements
/// - `CoreError::DimensionMismatch` if `element_counts` and `seconds` differ in length
/// - the optimizer errors of [`LevenbergMarquardt::optimize_sparse`]
pub fn optimize_individual_individual<
    D,
    const F: usize,
    const SEC: usize,
    const R: usize,
    const EF: usize,
    const ESEC: usize,
>(
    data: &mut D,
    firsts: &[FixedVector<f64, F>],
    seconds: &[FixedVector<f64, SEC>],
    element_counts: &[usize],
    config: &LevenbergMarquardtConfig,
) -> LmResult<SolverResult<(Vec<FixedVector<f64, F>>, Vec<FixedVector<f64, SEC>>)>>
where
    D: IndividualIndividualModel<F, SEC, R, EF, ESEC>,
{
    if firsts.is_empty() {
        return Err(CoreError::InvalidInput("no first models".to_string()).log().into());
    }
    let total = total_elements(element_counts, seconds.len(), "second")?;

    data.model_accepted(firsts, seconds);

    let mut provider = IndividualIndividualProvider::new(
        data,
        firsts.to_vec(),
        seconds.to_vec(),
        element_counts.to_vec(),
        total,
    );
    let result = LevenbergMarquardt::with_config(config.clone()).optimize_sparse(&mut provider)?;

    Ok(result.with_parameters((provider.firsts, provider.seconds)))
}
