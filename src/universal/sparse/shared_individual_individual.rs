//! One shared model plus two families of individual models.
//!
//! Same element structure as [`super::individual_individual`], with every element additionally
//! depending on the shared model. The shared and first models together form the dense `A` side
//! of the normal equations.

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
use crate::universal::{
    forward_difference, perturbed_externals, robust_error, row_offsets, total_elements,
};

pub trait SharedIndividualIndividualModel<
    const S: usize,
    const F: usize,
    const SEC: usize,
    const R: usize,
    const ES: usize,
    const EF: usize,
    const ESEC: usize,
>: Sync
{
    /// Value of one element of second model `second_index`, together with the index of the
    /// first model the element depends on.
    fn value(
        &self,
        shared: &FixedVector<f64, ES>,
        firsts: &[FixedVector<f64, EF>],
        seconds: &[FixedVector<f64, ESEC>],
        second_index: usize,
        element_index: usize,
    ) -> (usize, FixedVector<f64, R>);

    fn error(
        &self,
        shared: &FixedVector<f64, ES>,
        firsts: &[FixedVector<f64, EF>],
        seconds: &[FixedVector<f64, ESEC>],
        second_index: usize,
        element_index: usize,
    ) -> Option<FixedVector<f64, R>>;

    fn shared_is_valid(&self, _shared: &FixedVector<f64, ES>) -> bool {
        true
    }

    fn transform_shared(
        &self,
        internal: &FixedVector<f64, S>,
    ) -> (FixedVector<f64, ES>, FixedVector<f64, S>);

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
        _shared: &FixedVector<f64, S>,
        _firsts: &[FixedVector<f64, F>],
        _seconds: &[FixedVector<f64, SEC>],
    ) {
    }
}

/// Optimized shared, first and second internal models.
pub type SharedIndividualIndividualModels<const S: usize, const F: usize, const SEC: usize> = (
    FixedVector<f64, S>,
    Vec<FixedVector<f64, F>>,
    Vec<FixedVector<f64, SEC>>,
);

struct SharedIndividualIndividualProvider<
    'a,
    D,
    const S: usize,
    const F: usize,
    const SEC: usize,
    const R: usize,
    const ES: usize,
    const EF: usize,
    const ESEC: usize,
> {
    data: &'a mut D,
    shared: FixedVector<f64, S>,
    firsts: Vec<FixedVector<f64, F>>,
    seconds: Vec<FixedVector<f64, SEC>>,
    candidate_shared: FixedVector<f64, S>,
    candidate_firsts: Vec<FixedVector<f64, F>>,
    candidate_seconds: Vec<FixedVector<f64, SEC>>,
    candidate_shared_external: FixedVector<f64, ES>,
    candidate_first_externals: Vec<FixedVector<f64, EF>>,
    candidate_second_externals: Vec<FixedVector<f64, ESEC>>,
    element_counts: Vec<usize>,
    row_offsets: Vec<usize>,
    total_elements: usize,
}

struct Linearization<const ES: usize, const EF: usize, const ESEC: usize> {
    shared: FixedVector<f64, ES>,
    firsts: Vec<FixedVector<f64, EF>>,
    seconds: Vec<FixedVector<f64, ESEC>>,
    perturbed_shared: Vec<FixedVector<f64, ES>>,
    perturbed_firsts: Vec<Vec<FixedVector<f64, EF>>>,
    perturbed_seconds: Vec<Vec<FixedVector<f64, ESEC>>>,
}

impl<
    'a,
    D,
    const S: usize,
    const F: usize,
    const SEC: usize,
    const R: usize,
    const ES: usize,
    const EF: usize,
    const ESEC: usize,
> SharedIndividualIndividualProvider<'a, D, S, F, SEC, R, ES, EF, ESEC>
where
    D: SharedIndividualIndividualModel<S, F, SEC, R, ES, EF, ESEC>,
{
    fn new(
        data: &'a mut D,
        shared: FixedVector<f64, S>,
        firsts: Vec<FixedVector<f64, F>>,
        seconds: Vec<FixedVector<f64, SEC>>,
        element_counts: Vec<usize>,
        total_elements: usize,
    ) -> Self {
        let mut provider = Self {
            data,
            shared,
            candidate_shared: shared,
            candidate_firsts: firsts.clone(),
            candidate_seconds: seconds.clone(),
            firsts,
            seconds,
            candidate_shared_external: FixedVector::new(),
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
        let (external, renormalized) = data.transform_shared(&self.candidate_shared);
        self.candidate_shared = renormalized;
        self.candidate_shared_external = external;
        self.candidate_first_externals =
            transform_all(&mut self.candidate_firsts, |m| data.transform_first(m));
        self.candidate_second_externals =
            transform_all(&mut self.candidate_seconds, |m| data.transform_second(m));
    }

    fn linearization(&self) -> Linearization<ES, EF, ESEC> {
        let data = &*self.data;
        Linearization {
            shared: data.transform_shared(&self.shared).0,
            firsts: self.firsts.iter().map(|m| data.transform_first(m).0).collect(),
            seconds: self.seconds.iter().map(|m| data.transform_second(m).0).collect(),
            perturbed_shared: perturbed_externals(&self.shared, |m| data.transform_shared(m).0),
            perturbed_firsts: perturbed_families(&self.firsts, |m| data.transform_first(m).0),
            perturbed_seconds: perturbed_families(&self.seconds, |m| data.transform_second(m).0),
        }
    }

    /// Jacobian entries of all elements of one second model.
    fn second_triplets(
        &self,
        second_index: usize,
        lin: &Linearization<ES, EF, ESEC>,
    ) -> LinAlgResult<Vec<Triplet<usize, usize, f64>>> {
        let data = &*self.data;
        let count = self.element_counts[second_index];
        let column_second = S + self.firsts.len() * F + second_index * SEC;
        let mut triplets = Vec::with_capacity(count * R * (S + F + SEC));

        for element in 0..count {
            let row = self.row_offsets[second_index] + element * R;
            let (first_index, value) =
                data.value(&lin.shared, &lin.firsts, &lin.seconds, second_index, element);
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

            for (parameter, shared) in lin.perturbed_shared.iter().enumerate() {
                let (_, perturbed) =
                    data.value(shared, &lin.firsts, &lin.seconds, second_index, element);
                let derivative = forward_difference(&perturbed, &value);
                for d in 0..R {
                    triplets.push(Triplet::new(row + d, parameter, derivative[d]));
                }
            }

            let column_first = S + first_index * F;
            for (parameter, firsts) in lin.perturbed_firsts.iter().enumerate() {
                let (_, perturbed) =
                    data.value(&lin.shared, firsts, &lin.seconds, second_index, element);
                let derivative = forward_difference(&perturbed, &value);
                for d in 0..R {
                    triplets.push(Triplet::new(row + d, column_first + parameter, derivative[d]));
                }
            }

            for (parameter, seconds) in lin.perturbed_seconds.iter().enumerate() {
                let (_, perturbed) =
                    data.value(&lin.shared, &lin.firsts, seconds, second_index, element);
                let derivative = forward_difference(&perturbed, &value);
                for d in 0..R {
                    triplets.push(Triplet::new(row + d, column_second + parameter, derivative[d]));
                }
            }
        }
        Ok(triplets)
    }
}

impl<
    D,
    const S: usize,
    const F: usize,
    const SEC: usize,
    const R: usize,
    const ES: usize,
    const EF: usize,
    const ESEC: usize,
> ModelProvider for SharedIndividualIndividualProvider<'_, D, S, F, SEC, R, ES, EF, ESEC>
where
    D: SharedIndividualIndividualModel<S, F, SEC, R, ES, EF, ESEC>,
{
    fn parameter_count(&self) -> usize {
        S + F * self.firsts.len() + SEC * self.seconds.len()
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        self.candidate_shared = corrected(&self.shared, deltas, 0);
        for (index, first) in self.firsts.iter().enumerate() {
            self.candidate_firsts[index] = corrected(first, deltas, S + index * F);
        }
        let offset = S + F * self.firsts.len();
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
        if !self.data.shared_is_valid(&self.candidate_shared_external) {
            return f64::MAX;
        }

        let mut errors = Vec::with_capacity(self.total_elements);
        for (second_index, &count) in self.element_counts.iter().enumerate() {
            for element in 0..count {
                match self.data.error(
                    &self.candidate_shared_external,
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
        self.shared = self.candidate_shared;
        self.firsts.clone_from(&self.candidate_firsts);
        self.seconds.clone_from(&self.candidate_seconds);
        self.data
            .model_accepted(&self.shared, &self.firsts, &self.seconds);
    }
}

impl<
    D,
    const S: usize,
    const F: usize,
    const SEC: usize,
    const R: usize,
    const ES: usize,
    const EF: usize,
    const ESEC: usize,
> SparseProvider for SharedIndividualIndividualProvider<'_, D, S, F, SEC, R, ES, EF, ESEC>
where
    D: SharedIndividualIndividualModel<S, F, SEC, R, ES, EF, ESEC>,
{
    fn determine_jacobian(&self) -> LinAlgResult<SparseColMat<usize, f64>> {
        let lin = self.linearization();

        #[cfg(feature = "parallel")]
        let groups: Vec<Vec<Triplet<usize, usize, f64>>> = (0..self.seconds.len())
            .into_par_iter()
            .map(|index| self.second_triplets(index, &lin))
            .collect::<LinAlgResult<_>>()?;

        #[cfg(not(feature = "parallel"))]
        let groups: Vec<Vec<Triplet<usize, usize, f64>>> = (0..self.seconds.len())
            .map(|index| self.second_triplets(index, &lin))
            .collect::<LinAlgResult<_>>()?;

        let mut builder = TripletBuilder::with_capacity(
            R * self.total_elements,
            self.parameter_count(),
            R * self.total_elements * (S + F + SEC),
        );
        for mut group in groups {
            builder.append(&mut group);
        }
        builder.build()
    }

    fn block_layout(&self) -> Option<BlockLayout> {
        Some(BlockLayout::new(S + F * self.firsts.len(), None, SEC))
    }
}

/// Optimizes a shared model together with two families of individual models.
///
/// `element_counts[i]` is the number of elements owned by `seconds[i]`.
///
/// # Errors
/// - `CoreError::InvalidInput` if there are no first models or no elements
/// - `CoreError::DimensionMismatch` if `element_counts` and `seconds` differ in length
/// - the optimizer errors of [`LevenbergMarquardt::optimize_sparse`]
pub fn optimize_shared_individual_individual<
    D,
    const S: usize,
    const F: usize,
    const SEC: usize,
    const R: usize,
    const ES: usize,
    const EF: usize,
    const ESEC: usize,
>(
    data: &mut D,
    shared: &FixedVector<f64, S>,
    firsts: &[FixedVector<f64, F>],
    seconds: &[FixedVector<f64, SEC>],
    element_counts: &[usize],
    config: &LevenbergMarquardtConfig,
) -> LmResult<SolverResult<SharedIndividualIndividualModels<S, F, SEC>>>
where
    D: SharedIndividualIndividualModel<S, F, SEC, R, ES, EF, ESEC>,
{
    if firsts.is_empty() {
        return Err(CoreError::InvalidInput("no first models".to_string()).log().into());
    }
    let total = total_elements(element_counts, seconds.len(), "second")?;

    data.model_accepted(shared, firsts, seconds);

    let mut provider = SharedIndividualIndividualProvider::new(
        data,
        *shared,
        firsts.to_vec(),
        seconds.to_vec(),
        element_counts.to_vec(),
        total,
    );
    let result = LevenbergMarquardt::with_config(config.clone()).optimize_sparse(&mut provider)?;

    Ok(result.with_parameters((provider.shared, provider.firsts, provider.seconds)))
}
