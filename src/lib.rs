//! # lm-universal
//!
//! A generic Levenberg-Marquardt engine for nonlinear least squares problems in computer
//! vision: homographies, planes, camera poses and other small models observed through many
//! measurements.
//!
//! ## Features
//!
//! - **Universal adapters**: describe a problem by its value, error and model transformation;
//!   numeric Jacobians, robust errors and the model lifecycle come for free
//! - **Dense and block-sparse solvers**: one model with a dense Jacobian, or shared and
//!   individual model families with a sparse Jacobian solved by a Schur complement
//! - **Robust estimators**: Square, Linear, Huber, Tukey and Cauchy weighting
//! - **Advanced providers**: problems supplying their own normal equations, including plain
//!   Gauss-Newton iterations
//!
//! ## Model families
//!
//! | Adapter | Models | Linear solve |
//! |---|---|---|
//! | [`optimize_universal_model`] | one | dense |
//! | [`optimize_shared_individual`] | one shared, `n` individual | Schur complement |
//! | [`optimize_individual_individual`] | `f` first, `s` second | Schur complement |
//! | [`optimize_shared_individual_individual`] | one shared, `f` first, `s` second | Schur complement |

pub mod core;
pub mod error;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod optimizer;
pub mod problems;
pub mod universal;

// Re-export core types
pub use core::{Estimator, FixedVector};
pub use error::{LmError, LmResult};

pub use linalg::{LinearSolverType, SparseCholeskySolver};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{
    AdvancedDenseProvider, AdvancedSparseProvider, DenseProvider, LevenbergMarquardt,
    LevenbergMarquardtConfig, ModelProvider, OptimizationStatus, SolverResult, SparseProvider,
};
pub use universal::{
    DenseUniversalModel, IndividualIndividualModel, SharedIndividualIndividualModel,
    SharedIndividualModel, optimize_individual_individual, optimize_shared_individual,
    optimize_shared_individual_individual, optimize_universal_model,
};
