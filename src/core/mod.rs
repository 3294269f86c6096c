//! Core building blocks of the factor graph
//!
//! - Variable containers ([`values::Values`])
//! - Noise models, including robust wrapping ([`noise_model::NoiseModel`])
//! - Loss functions and the corrector that applies them
//! - The factor graph itself ([`factor_graph::FactorGraph`])

pub mod corrector;
pub mod factor_graph;
pub mod loss_functions;
pub mod noise_model;
pub mod values;

use thiserror::Error;
use tracing::error;

/// Core module error types for factor graphs, noise models and values
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Variable lookup or initialization error
    #[error("Variable error: {0}")]
    Variable(String),

    /// Factor linearization failed
    #[error("Factor linearization failed: {0}")]
    FactorLinearization(String),

    /// Symbolic structure construction failed
    #[error("Symbolic structure error: {0}")]
    SymbolicStructure(String),

    /// Dimension mismatch between residual, noise model and variables
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Noise model construction failed
    #[error("Invalid noise model: {0}")]
    InvalidNoiseModel(String),

    /// The noise model has no well-defined scale (e.g. it is robust-wrapped)
    #[error("Noise model of factor {slot} cannot be rescaled: {reason}")]
    UnscalableNoiseModel { slot: usize, reason: String },

    /// Factor slot does not exist in the graph
    #[error("Factor slot {slot} out of range for graph of size {size}")]
    SlotOutOfRange { slot: usize, size: usize },

    /// Loss function error
    #[error("Loss function error: {0}")]
    LossFunction(String),

    /// Invalid input parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying third-party error
    ///
    /// # Example
    /// ```ignore
    /// SymbolicSparseColMat::try_new_from_indices(rows, cols, &indices)
    ///     .map_err(|e| {
    ///         CoreError::SymbolicStructure("Failed to build sparsity pattern".to_string())
    ///             .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
