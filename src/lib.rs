//! # GNC Solver
//!
//! Outlier-robust nonlinear least squares over factor graphs with Graduated
//! Non-Convexity.
//!
//! A [`GncOptimizer`] wraps a base optimizer ([`GaussNewton`] or [`LevenbergMarquardt`])
//! and repeatedly solves a reweighted copy of the graph while a control parameter moves
//! the robust surrogate from convex towards the target loss. Factors that end with weight
//! zero are rejected as outliers.
//!
//! ## Features
//!
//! - **Two GNC loss families**: truncated least squares and Geman-McClure
//! - **Known inliers**: slots that are trusted a priori keep weight one
//! - **Pluggable base optimizer**: any [`optimizer::SolverConfig`]
//! - **Sparse linear algebra**: normal equations solved with `faer` sparse Cholesky
//! - **Observers**: per-iteration hooks for logging or recording the continuation
//!
//! ## Modules
//!
//! - [`core`]: values, noise models, loss functions, the factor graph
//! - [`factors`]: the [`Factor`] trait and prior, between and range factors
//! - [`linalg`]: sparse Cholesky solver
//! - [`optimizer`]: Gauss-Newton, Levenberg-Marquardt and GNC

pub mod core;
pub mod error;
pub mod factors;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod observers;
pub mod optimizer;

pub use core::{factor_graph::FactorGraph, noise_model::NoiseModel, values::Values};
pub use error::{GncSolverError, GncSolverResult};

pub use factors::{BetweenFactor, Factor, PriorFactor, RangeFactor};

pub use linalg::SparseCholeskySolver;
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use observers::{GncObserver, HistoryObserver, LoggingObserver};
pub use optimizer::{
    GaussNewton, GaussNewtonConfig, GncConfig, GncLossType, GncOptimizer, GncResult,
    GncStatus, GncVerbosity, LevenbergMarquardt, LevenbergMarquardtConfig, Solver,
    SolverConfig,
};
