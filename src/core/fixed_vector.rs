//! Fixed-capacity, stack allocated vector used for models and per-element results.
//!
//! Numeric Jacobians evaluate the caller's model once per parameter per element, so the
//! buffers travelling through those loops must never touch the heap. `FixedVector` is a thin
//! wrapper around `[T; N]` that adds the constructors the optimizers need (bulk copy, scalar
//! broadcast into the first slot, truncating prefix copy) and a bit-exact comparison.

use std::ops::{Deref, DerefMut, Index, IndexMut};

use crate::core::{CoreError, CoreResult};

/// A vector with exactly `N` elements stored inline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedVector<T, const N: usize> {
    data: [T; N],
}

impl<T: Copy + Default, const N: usize> FixedVector<T, N> {
    /// Creates a vector with all elements set to `T::default()`.
    pub fn new() -> Self {
        Self {
            data: [T::default(); N],
        }
    }

    /// Copies the first `N` elements of `values`.
    ///
    /// # Errors
    /// Returns `CoreError::DimensionMismatch` if `values` holds fewer than `N` elements.
    pub fn from_slice(values: &[T]) -> CoreResult<Self> {
        if values.len() < N {
            return Err(CoreError::DimensionMismatch(format!(
                "FixedVector needs {} values, got {}",
                N,
                values.len()
            ))
            .log());
        }

        let mut result = Self::new();
        result.data.copy_from_slice(&values[..N]);
        Ok(result)
    }

    /// Places `value` in the first slot and default-initializes the remaining slots.
    pub fn from_scalar(value: T) -> Self {
        let mut result = Self::new();
        if N > 0 {
            result.data[0] = value;
        }
        result
    }

    /// Copies as many leading elements of `values` as fit, truncating the rest.
    pub fn from_prefix(values: &[T]) -> Self {
        let mut result = Self::new();
        let count = values.len().min(N);
        result.data[..count].copy_from_slice(&values[..count]);
        result
    }
}

impl<T, const N: usize> FixedVector<T, N> {
    /// Compile-time capacity of the vector.
    pub const CAPACITY: usize = N;

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_array(self) -> [T; N] {
        self.data
    }

    pub fn as_array(&self) -> &[T; N] {
        &self.data
    }
}

impl<const N: usize> FixedVector<f64, N> {
    /// Bit-exact comparison of two buffers.
    ///
    /// Unlike `==` this distinguishes `0.0` from `-0.0` and treats identical NaN payloads as equal.
    pub fn bitwise_eq(&self, other: &Self) -> bool {
        self.data
            .iter()
            .zip(other.data.iter())
            .all(|(a, b)| a.to_bits() == b.to_bits())
    }

    /// Sum of squared elements.
    pub fn squared_norm(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum()
    }
}

impl<T: Copy + Default, const N: usize> Default for FixedVector<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> From<[T; N]> for FixedVector<T, N> {
    fn from(data: [T; N]) -> Self {
        Self { data }
    }
}

impl<T, const N: usize> Deref for FixedVector<T, N> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T, const N: usize> DerefMut for FixedVector<T, N> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T, const N: usize> Index<usize> for FixedVector<T, N> {
    type Output = T;

    #[inline]
    fn index(&self, index: usize) -> &T {
        &self.data[index]
    }
}

impl<T, const N: usize> IndexMut<usize> for FixedVector<T, N> {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.data[index]
    }
}
