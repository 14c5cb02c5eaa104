//! Robust estimators for re-weighted least squares.
//!
//! An estimator maps the squared residual magnitude of each element to a weight and to a
//! robust cost. The optimizers multiply residuals by these weights before building the normal
//! equations, which turns every Levenberg-Marquardt step into one iteration of iteratively
//! re-weighted least squares.
//!
//! # Available Estimators
//!
//! | Estimator | Weight `w(s)` for `s = r²` | Cost | Tuning constant |
//! |-----------|-----------------------------|------|-----------------|
//! | [`Estimator::Square`] | `1` | `s / 2` | - |
//! | [`Estimator::Linear`] | `1 / √s` | `√s` | - |
//! | [`Estimator::Huber`] | `1` if `s ≤ σ²`, else `σ / √s` | `s/2` or `σ√s - σ²/2` | 1.345 |
//! | [`Estimator::Tukey`] | `(1 - s/σ²)²` if `s ≤ σ²`, else `0` | `σ²/6 (1 - (1 - s/σ²)³)` | 4.6851 |
//! | [`Estimator::Cauchy`] | `1 / (1 + s/σ²)` | `σ²/2 ln(1 + s/σ²)` | 2.3849 |
//!
//! `σ` is estimated from the data (see [`Estimator::determine_sigma`]) for the estimators
//! that need it. Weights are capped at `10 / WEAK_EPS`.
//!
//! # Example
//!
//! ```
//! use lm_universal::core::Estimator;
//!
//! let huber: Estimator = "huber".parse().unwrap_or_default();
//! assert!(!huber.is_standard());
//!
//! // inlier keeps full weight
//! assert_eq!(huber.robust_weight_square(0.5, 1.0), 1.0);
//! // outlier is down-weighted
//! assert!(huber.robust_weight_square(100.0, 1.0) < 1.0);
//! ```

use std::{
    fmt,
    fmt::{Display, Formatter},
    str::FromStr,
};

use crate::core::{CoreError, EPS, WEAK_EPS};

/// Upper bound for any robust weight.
const MAXIMAL_WEIGHT: f64 = 10.0 / WEAK_EPS;

/// Consistency factor turning a median absolute deviation into a standard deviation.
const MAD_TO_SIGMA: f64 = 1.4826;

/// Closed family of robust estimators.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Estimator {
    /// Standard least squares, every element keeps weight one.
    #[default]
    Square,
    /// Absolute error (L1).
    Linear,
    /// Quadratic for inliers, linear for outliers.
    Huber,
    /// Redescending biweight, outliers get weight zero.
    Tukey,
    /// Lorentzian, heavy but never complete suppression.
    Cauchy,
}

impl Estimator {
    /// All estimator kinds, in declaration order.
    pub fn all() -> [Estimator; 5] {
        [
            Estimator::Square,
            Estimator::Linear,
            Estimator::Huber,
            Estimator::Tukey,
            Estimator::Cauchy,
        ]
    }

    /// True only for plain least squares, which skips the weight vector entirely.
    pub fn is_standard(self) -> bool {
        self == Estimator::Square
    }

    /// True for the estimators whose shape depends on a data-driven sigma.
    pub fn needs_sigma(self) -> bool {
        matches!(self, Estimator::Huber | Estimator::Tukey | Estimator::Cauchy)
    }

    /// Tuning constant giving 95% efficiency on normally distributed residuals.
    pub fn tuning_constant(self) -> f64 {
        match self {
            Estimator::Huber => 1.345,
            Estimator::Tukey => 4.6851,
            Estimator::Cauchy => 2.3849,
            Estimator::Square | Estimator::Linear => 0.0,
        }
    }

    /// Weight for a squared residual `sqr_value` given the squared sigma.
    pub fn robust_weight_square(self, sqr_value: f64, sqr_sigma: f64) -> f64 {
        match self {
            Estimator::Square => 1.0,
            Estimator::Linear => {
                if sqr_value < WEAK_EPS * WEAK_EPS {
                    1.0 / WEAK_EPS
                } else {
                    1.0 / sqr_value.sqrt()
                }
            }
            Estimator::Huber => {
                if sqr_value <= sqr_sigma {
                    1.0
                } else {
                    (sqr_sigma / sqr_value).sqrt().min(MAXIMAL_WEIGHT)
                }
            }
            Estimator::Tukey => {
                if sqr_value > sqr_sigma {
                    0.0
                } else {
                    let ratio = 1.0 - sqr_value / sqr_sigma;
                    (ratio * ratio).min(MAXIMAL_WEIGHT)
                }
            }
            Estimator::Cauchy => 1.0 / (1.0 + sqr_value / sqr_sigma),
        }
    }

    /// Weight for a (signed) residual `value` given sigma.
    pub fn robust_weight(self, value: f64, sigma: f64) -> f64 {
        let abs_value = value.abs();
        match self {
            Estimator::Square => 1.0,
            Estimator::Linear => {
                if abs_value < WEAK_EPS {
                    MAXIMAL_WEIGHT
                } else {
                    (1.0 / abs_value).min(MAXIMAL_WEIGHT)
                }
            }
            Estimator::Huber => {
                if abs_value <= sigma {
                    1.0
                } else {
                    (sigma / abs_value).min(MAXIMAL_WEIGHT)
                }
            }
            Estimator::Tukey => {
                if abs_value > sigma {
                    0.0
                } else {
                    let normalized = value / sigma;
                    let ratio = 1.0 - normalized * normalized;
                    (ratio * ratio).min(MAXIMAL_WEIGHT)
                }
            }
            Estimator::Cauchy => {
                let normalized = value / sigma;
                1.0 / (1.0 + normalized * normalized)
            }
        }
    }

    /// Robust cost of a squared residual given the squared sigma.
    pub fn robust_error_square(self, sqr_value: f64, sqr_sigma: f64) -> f64 {
        match self {
            Estimator::Square => sqr_value * 0.5,
            Estimator::Linear => sqr_value.sqrt(),
            Estimator::Huber => {
                if sqr_value <= sqr_sigma {
                    sqr_value * 0.5
                } else {
                    sqr_value.sqrt() * sqr_sigma.sqrt() - sqr_sigma * 0.5
                }
            }
            Estimator::Tukey => {
                if sqr_value <= sqr_sigma {
                    let ratio = 1.0 - sqr_value / sqr_sigma;
                    sqr_sigma / 6.0 * (1.0 - ratio * ratio * ratio)
                } else {
                    sqr_sigma / 6.0
                }
            }
            Estimator::Cauchy => (1.0 + sqr_value / sqr_sigma).ln() * sqr_sigma * 0.5,
        }
    }

    /// Robust cost of a (signed) residual given sigma.
    pub fn robust_error(self, value: f64, sigma: f64) -> f64 {
        let abs_value = value.abs();
        match self {
            Estimator::Square => value * value * 0.5,
            Estimator::Linear => abs_value,
            Estimator::Huber => {
                if abs_value <= sigma {
                    value * value * 0.5
                } else {
                    sigma * (abs_value - sigma * 0.5)
                }
            }
            Estimator::Tukey => {
                let sqr_sigma = sigma * sigma;
                if abs_value <= sigma {
                    let normalized = value / sigma;
                    let ratio = 1.0 - normalized * normalized;
                    sqr_sigma / 6.0 * (1.0 - ratio * ratio * ratio)
                } else {
                    sqr_sigma / 6.0
                }
            }
            Estimator::Cauchy => {
                let normalized = value / sigma;
                (1.0 + normalized * normalized).ln() * sigma * sigma * 0.5
            }
        }
    }

    /// Robust sigma estimated from the median of the squared residuals.
    ///
    /// `sigma = tuning · 1.4826 · (1 + 5 / (n - p)) · √median(sqr_errors)`, where the finite
    /// sample correction is applied only when there are more elements `n` than model parameters
    /// `p`. The upper median is used for even counts. The result is never below `EPS`.
    pub fn determine_sigma(self, sqr_errors: &[f64], model_parameters: usize) -> f64 {
        if sqr_errors.is_empty() {
            return EPS;
        }

        let number = sqr_errors.len();
        let mut sorted = sqr_errors.to_vec();
        let middle = number / 2;
        let (_, median, _) = sorted.select_nth_unstable_by(middle, f64::total_cmp);
        let median = *median;

        let correction = if number > model_parameters {
            1.0 + 5.0 / (number - model_parameters) as f64
        } else {
            1.0
        };

        (self.tuning_constant() * MAD_TO_SIGMA * correction * median.sqrt()).max(EPS)
    }

    /// Squared robust sigma, `0` for estimators without a sigma.
    pub fn determine_sigma_square(self, sqr_errors: &[f64], model_parameters: usize) -> f64 {
        if !self.needs_sigma() {
            return 0.0;
        }
        let sigma = self.determine_sigma(sqr_errors, model_parameters);
        sigma * sigma
    }

    /// Mean of the weighted squared errors.
    pub fn determine_robust_error(sqr_errors: &[f64], weights: &[f64]) -> f64 {
        debug_assert_eq!(sqr_errors.len(), weights.len());
        if sqr_errors.is_empty() {
            return 0.0;
        }

        let sum: f64 = sqr_errors
            .iter()
            .zip(weights.iter())
            .map(|(sqr, weight)| sqr * weight)
            .sum();
        sum / sqr_errors.len() as f64
    }

    /// Turns squared element errors into robust weights and an averaged robust error.
    ///
    /// `weighted_errors` holds `dimension` residual entries per element; each block is scaled
    /// by the element's weight in place. `weights` receives the same weight for each entry of
    /// the block and must have the same length as `weighted_errors`.
    ///
    /// Returns the mean of `sqr_error · weight` over all elements.
    pub fn sqr_errors_to_robust_errors(
        self,
        sqr_errors: &[f64],
        model_parameters: usize,
        weighted_errors: &mut [f64],
        weights: &mut [f64],
        dimension: usize,
    ) -> f64 {
        debug_assert_eq!(sqr_errors.len() * dimension, weighted_errors.len());
        debug_assert_eq!(weighted_errors.len(), weights.len());

        if sqr_errors.is_empty() {
            return 0.0;
        }

        let sqr_sigma = self.determine_sigma_square(sqr_errors, model_parameters);

        let mut robust_error = 0.0;
        for (n, &sqr_error) in sqr_errors.iter().enumerate() {
            let weight = self.robust_weight_square(sqr_error, sqr_sigma).max(WEAK_EPS);
            robust_error += sqr_error * weight;

            let range = n * dimension..(n + 1) * dimension;
            for value in &mut weighted_errors[range.clone()] {
                *value *= weight;
            }
            for value in &mut weights[range] {
                *value = weight;
            }
        }

        robust_error / sqr_errors.len() as f64
    }
}

impl Display for Estimator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Estimator::Square => write!(f, "square"),
            Estimator::Linear => write!(f, "linear"),
            Estimator::Huber => write!(f, "huber"),
            Estimator::Tukey => write!(f, "tukey"),
            Estimator::Cauchy => write!(f, "cauchy"),
        }
    }
}

impl FromStr for Estimator {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "square" => Ok(Estimator::Square),
            "linear" => Ok(Estimator::Linear),
            "huber" => Ok(Estimator::Huber),
            "tukey" => Ok(Estimator::Tukey),
            "cauchy" => Ok(Estimator::Cauchy),
            other => Err(CoreError::InvalidInput(format!("Unknown estimator '{other}'")).log()),
        }
    }
}
