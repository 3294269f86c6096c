//! Error types for the gnc-solver library
//!
//! Every module defines its own `thiserror` enum (`CoreError`, `FactorError`,
//! `OptimizerError`, `LinAlgError`, `ObserverError`, `GncError`). Public entry points
//! return [`GncSolverError`], which wraps them transparently so the original message
//! and source chain are preserved.
//!
//! ```text
//! GncSolverError::Optimizer(
//!     OptimizerError::LinAlg(
//!         LinAlgError::SingularMatrix
//!     )
//! )
//! ```

use crate::{
    core::CoreError, factors::FactorError, linalg::LinAlgError, observers::ObserverError,
    optimizer::OptimizerError, optimizer::gnc::GncError,
};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the gnc-solver library
pub type GncSolverResult<T> = Result<T, GncSolverError>;

/// Top-level error type of the library.
///
/// ```rust,ignore
/// if let Err(e) = gnc.optimize() {
///     warn!("GNC failed: {}", e.chain_compact());
/// }
/// ```
#[derive(Debug, Error)]
pub enum GncSolverError {
    /// Graph construction, noise models and values
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Factor(#[from] FactorError),

    /// Base optimizer failures
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    #[error(transparent)]
    Observer(#[from] ObserverError),

    /// Configuration and continuation errors of the GNC loop
    #[error(transparent)]
    Gnc(#[from] GncError),
}

impl GncSolverError {
    /// Full error chain, one error per line.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Single-line error chain for log messages.
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimizer_error_chain_reaches_linalg() {
        let error = GncSolverError::from(OptimizerError::LinAlg(LinAlgError::SingularMatrix));

        let chain = error.chain();
        assert!(chain.contains("Singular matrix"));

        let compact = error.chain_compact();
        assert!(!compact.contains('\n'));
        assert!(compact.contains("Singular matrix"));
    }

    #[test]
    fn test_transparent_display() {
        let gnc = GncError::KnownInlierOutOfRange { slot: 7, size: 3 };
        let message = gnc.to_string();
        let error: GncSolverError = gnc.into();
        assert_eq!(error.to_string(), message);
        assert!(matches!(error, GncSolverError::Gnc(_)));
    }

    #[test]
    fn test_question_mark_conversion() {
        fn fails() -> GncSolverResult<()> {
            Err(CoreError::InvalidInput("negative weight".to_string()))?;
            Ok(())
        }

        match fails() {
            Err(GncSolverError::Core(CoreError::InvalidInput(msg))) => {
                assert_eq!(msg, "negative weight")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_factor_error_wraps() {
        let error: GncSolverError = FactorError::InvalidDimension {
            expected: 2,
            actual: 3,
        }
        .into();
        assert!(matches!(error, GncSolverError::Factor(_)));
    }
}
