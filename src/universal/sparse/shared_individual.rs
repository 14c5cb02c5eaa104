//! One shared model plus a family of individual models.

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::DVector;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::{Estimator, FixedVector};
use crate::error::LmResult;
use crate::linalg::{BlockLayout, LinAlgResult, TripletBuilder};
use crate::optimizer::{
    LevenbergMarquardt, LevenbergMarquardtConfig, ModelProvider, SolverResult, SparseProvider,
};
use crate::universal::sparse::{corrected, transform_all};
use crate::universal::{
    forward_difference, perturbed_externals, robust_error, row_offsets, total_elements,
};

/// A problem with one shared model (`S` internal, `ES` external parameters) and individual
/// models (`I` internal, `EI` external parameters), each owning its own elements.
pub trait SharedIndividualModel<
    const S: usize,
    const I: usize,
    const R: usize,
    const ES: usize,
    const EI: usize,
>: Sync
{
    fn value(
        &self,
        shared: &FixedVector<f64, ES>,
        individual: &FixedVector<f64, EI>,
        individual_index: usize,
        element_index: usize,
    ) -> FixedVector<f64, R>;

    fn error(
        &self,
        shared: &FixedVector<f64, ES>,
        individual: &FixedVector<f64, EI>,
        individual_index: usize,
        element_index: usize,
    ) -> Option<FixedVector<f64, R>>;

    /// Early rejection of a candidate shared model before any element is evaluated.
    fn shared_is_valid(&self, _shared: &FixedVector<f64, ES>) -> bool {
        true
    }

    fn transform_shared(
        &self,
        internal: &FixedVector<f64, S>,
    ) -> (FixedVector<f64, ES>, FixedVector<f64, S>);

    fn transform_individual(
        &self,
        internal: &FixedVector<f64, I>,
    ) -> (FixedVector<f64, EI>, FixedVector<f64, I>);

    /// Called with the initial models and with every accepted set of models.
    fn model_accepted(
        &mut self,
        _shared: &FixedVector<f64, S>,
        _individuals: &[FixedVector<f64, I>],
    ) {
    }
}

struct SharedIndividualProvider<
    'a,
    D,
    const S: usize,
    const I: usize,
    const R: usize,
    const ES: usize,
    const EI: usize,
> {
    data: &'a mut D,
    shared: FixedVector<f64, S>,
    individuals: Vec<FixedVector<f64, I>>,
    candidate_shared: FixedVector<f64, S>,
    candidate_individuals: Vec<FixedVector<f64, I>>,
    candidate_shared_external: FixedVector<f64, ES>,
    candidate_individual_externals: Vec<FixedVector<f64, EI>>,
    element_counts: Vec<usize>,
    row_offsets: Vec<usize>,
    total_elements: usize,
}

impl<'a, D, const S: usize, const I: usize, const R: usize, const ES: usize, const EI: usize>
    SharedIndividualProvider<'a, D, S, I, R, ES, EI>
where
    D: SharedIndividualModel<S, I, R, ES, EI>,
{
    fn new(
        data: &'a mut D,
        shared: FixedVector<f64, S>,
        individuals: Vec<FixedVector<f64, I>>,
        element_counts: Vec<usize>,
        total_elements: usize,
    ) -> Self {
        let mut provider = Self {
            data,
            shared,
            candidate_shared: shared,
            candidate_individuals: individuals.clone(),
            individuals,
            candidate_shared_external: FixedVector::new(),
            candidate_individual_externals: Vec::new(),
            row_offsets: row_offsets(&element_counts, R),
            element_counts,
            total_elements,
        };
        provider.transform_candidates();
        provider
    }

    fn transform_candidates(&mut self) {
        let data = &*self.data;
        let (external, renormalized) = data.transform_shared(&self.candidate_shared);
        self.candidate_shared = renormalized;
        self.candidate_shared_external = external;
        self.candidate_individual_externals =
            transform_all(&mut self.candidate_individuals, |m| data.transform_individual(m));
    }

    /// Jacobian entries of all elements of one individual model.
    fn individual_triplets(
        &self,
        individual_index: usize,
        shared_external: &FixedVector<f64, ES>,
        perturbed_shared: &[FixedVector<f64, ES>],
    ) -> Vec<Triplet<usize, usize, f64>> {
        let data = &*self.data;
        let individual = &self.individuals[individual_index];
        let (individual_external, _) = data.transform_individual(individual);
        let perturbed_individual =
            perturbed_externals(individual, |m| data.transform_individual(m).0);

        let column_individual = S + individual_index * I;
        let count = self.element_counts[individual_index];
        let mut triplets = Vec::with_capacity(count * R * (S + I));

        for element in 0..count {
            let row = self.row_offsets[individual_index] + element * R;
            let value =
                data.value(shared_external, &individual_external, individual_index, element);

            for (parameter, shared_eps) in perturbed_shared.iter().enumerate() {
                let derivative = forward_difference(
                    &data.value(shared_eps, &individual_external, individual_index, element),
                    &value,
                );
                for d in 0..R {
                    triplets.push(Triplet::new(row + d, parameter, derivative[d]));
                }
            }

            for (parameter, individual_eps) in perturbed_individual.iter().enumerate() {
                let derivative = forward_difference(
                    &data.value(shared_external, individual_eps, individual_index, element),
                    &value,
                );
                for d in 0..R {
                    triplets.push(Triplet::new(
                        row + d,
                        column_individual + parameter,
                        derivative[d],
                    ));
                }
            }
        }
        triplets
    }
}

impl<D, const S: usize, const I: usize, const R: usize, const ES: usize, const EI: usize>
    ModelProvider for SharedIndividualProvider<'_, D, S, I, R, ES, EI>
where
    D: SharedIndividualModel<S, I, R, ES, EI>,
{
    fn parameter_count(&self) -> usize {
        S + I * self.individuals.len()
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        self.candidate_shared = corrected(&self.shared, deltas, 0);
        for (index, individual) in self.individuals.iter().enumerate() {
            self.candidate_individuals[index] = corrected(individual, deltas, S + index * I);
        }
        self.transform_candidates();
    }

    fn determine_robust_error(
        &self,
        estimator: Estimator,
        weighted_errors: &mut DVector<f64>,
        weights: &mut DVector<f64>,
    ) -> f64 {
        if !self.data.shared_is_valid(&self.candidate_shared_external) {
            return f64::MAX;
        }

        let mut errors = Vec::with_capacity(self.total_elements);
        for (individual_index, &count) in self.element_counts.iter().enumerate() {
            let individual = &self.candidate_individual_externals[individual_index];
            for element in 0..count {
                match self.data.error(
                    &self.candidate_shared_external,
                    individual,
                    individual_index,
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
        self.shared = self.candidate_shared;
        self.individuals.clone_from(&self.candidate_individuals);
        self.data.model_accepted(&self.shared, &self.individuals);
    }
}

impl<D, const S: usize, const I: usize, const R: usize, const ES: usize, const EI: usize>
    SparseProvider for SharedIndividualProvider<'_, D, S, I, R, ES, EI>
where
    D: SharedIndividualModel<S, I, R, ES, EI>,
{
    fn determine_jacobian(&self) -> LinAlgResult<SparseColMat<usize, f64>> {
        let data = &*self.data;
        let (shared_external, _) = data.transform_shared(&self.shared);
        let perturbed_shared = perturbed_externals(&self.shared, |m| data.transform_shared(m).0);

        #[cfg(feature = "parallel")]
        let groups: Vec<Vec<Triplet<usize, usize, f64>>> = (0..self.individuals.len())
            .into_par_iter()
            .map(|index| self.individual_triplets(index, &shared_external, &perturbed_shared))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let groups: Vec<Vec<Triplet<usize, usize, f64>>> = (0..self.individuals.len())
            .map(|index| self.individual_triplets(index, &shared_external, &perturbed_shared))
            .collect();

        let mut builder = TripletBuilder::with_capacity(
            R * self.total_elements,
            self.parameter_count(),
            R * self.total_elements * (S + I),
        );
        for mut group in groups {
            builder.append(&mut group);
        }
        builder.build()
    }

    fn block_layout(&self) -> Option<BlockLayout> {
        Some(BlockLayout::new(S, None, I))
    }
}

/// Optimizes one shared model together with individual models.
///
/// `element_counts[i]` is the number of elements owned by `individuals[i]`. Returns the
/// optimized shared and individual internal models.
///
/// # Errors
/// - `CoreError::DimensionMismatch` if `element_counts` and `individuals` differ in length
/// - `CoreError::InvalidInput` if there are no elements at all
/// - the optimizer errors of [`LevenbergMarquardt::optimize_sparse`]
pub fn optimize_shared_individual<
    D,
    const S: usize,
    const I: usize,
    const R: usize,
    const ES: usize,
    const EI: usize,
>(
    data: &mut D,
    shared: &FixedVector<f64, S>,
    individuals: &[FixedVector<f64, I>],
    element_counts: &[usize],
    config: &LevenbergMarquardtConfig,
) -> LmResult<SolverResult<(FixedVector<f64, S>, Vec<FixedVector<f64, I>>)>>
where
    D: SharedIndividualModel<S, I, R, ES, EI>,
{
    let total = total_elements(element_counts, individuals.len(), "individual")?;

    data.model_accepted(shared, individuals);

    let mut provider = SharedIndividualProvider::new(
        data,
        *shared,
        individuals.to_vec(),
        element_counts.to_vec(),
        total,
    );
    let result = LevenbergMarquardt::with_config(config.clone()).optimize_sparse(&mut provider)?;

    Ok(result.with_parameters((provider.shared, provider.individuals)))
}
