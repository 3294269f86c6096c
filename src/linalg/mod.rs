//! Sparse linear solvers for the Gauss-Newton normal equations.

pub mod cholesky;

use faer::{Mat, sparse::SparseColMat};
use thiserror::Error;
use tracing::error;

pub use cholesky::SparseCholeskySolver;

/// Errors of the sparse normal-equation solvers
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Symbolic analysis of the sparsity pattern failed
    #[error("Cholesky factorization failed: {0}")]
    FactorizationFailed(String),

    /// `JᵀJ (+ λI)` is not positive definite, e.g. a variable no factor constrains
    #[error("Singular matrix: normal equations are not positive definite")]
    SingularMatrix,

    #[error("Could not assemble sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Row-major/column-major conversion failed
    #[error("Sparse storage conversion failed: {0}")]
    MatrixConversion(String),
}

impl LinAlgError {
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

pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Solver for `JᵀJ dx = −Jᵀr` and its damped variant.
pub trait SparseLinearSolver {
    /// Solve the normal equations `(JᵀJ) dx = −Jᵀr`.
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>>;

    /// Solve the damped system `(JᵀJ + λI) dx = −Jᵀr`.
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<Mat<f64>>;

    /// `JᵀJ` from the last solve (undamped).
    fn get_hessian(&self) -> Option<&SparseColMat<usize, f64>>;

    /// `Jᵀr` from the last solve.
    fn get_gradient(&self) -> Option<&Mat<f64>>;
}
