//! Residual functions for factor graphs.
//!
//! A [`Factor`] computes a raw (unwhitened) residual and its Jacobian from the values of the
//! variables it connects. Noise models and robust losses are applied by the graph, not here.
//!
//! - [`PriorFactor`]: unary constraint `r = x − prior`
//! - [`BetweenFactor`]: relative constraint `r = (x_j − x_i) − z`
//! - [`RangeFactor`]: distance constraint `r = ||x_i − x_j|| − range`

use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::error;

pub mod between_factor;
pub mod prior_factor;
pub mod range_factor;

pub use between_factor::BetweenFactor;
pub use prior_factor::PriorFactor;
pub use range_factor::RangeFactor;

#[derive(Debug, Clone, Error)]
pub enum FactorError {
    /// Measurement and variable dimensions disagree
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    /// Invalid measurement or parameter values
    #[error("Invalid parameter values: {0}")]
    InvalidParameters(String),
}

impl FactorError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error for debugging context
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

pub type FactorResult<T> = Result<T, FactorError>;

pub trait Factor: Send + Sync {
    /// Compute the residual and, if requested, its Jacobian.
    ///
    /// `params` holds one vector per connected variable, in the order of the factor's keys.
    /// The Jacobian is `N × M`, where `N` is [`Factor::get_dimension`] and `M` the summed
    /// dimension of all connected variables.
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>);

    /// Number of rows in the residual.
    fn get_dimension(&self) -> usize;

    /// Number of variables the factor connects; the length of `params` in
    /// [`Factor::linearize`].
    fn num_variables(&self) -> usize;
}
