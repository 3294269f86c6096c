//! Nonlinear least-squares optimizers over a [`FactorGraph`].
//!
//! - [`GaussNewton`]: undamped normal equations, fast near the solution.
//! - [`LevenbergMarquardt`]: adaptive damping with step acceptance.
//! - [`gnc::GncOptimizer`]: Graduated Non-Convexity outer loop that drives either of the
//!   above through a sequence of reweighted problems to reject outliers.
//!
//! The two base optimizers are interchangeable through [`Solver`] and [`SolverConfig`]:
//! a configuration knows how to build its solver, which is how the GNC loop creates a
//! fresh base optimizer for every subproblem.

use std::{
    fmt,
    fmt::{Debug, Display, Formatter},
};

use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};
use thiserror::Error;
use tracing::{debug, error};
use web_time as time;

use crate::core::{factor_graph::FactorGraph, values::Values};
use crate::error::GncSolverResult;
use crate::linalg;

pub mod gauss_newton;
pub mod gnc;
pub mod levenberg_marquardt;

pub use gauss_newton::{GaussNewton, GaussNewtonConfig};
pub use gnc::{GncConfig, GncLossType, GncOptimizer, GncResult, GncStatus, GncVerbosity};
pub use levenberg_marquardt::{LevenbergMarquardt, LevenbergMarquardtConfig};

pub use crate::observers::{OptObserver, OptObserverVec};

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Linear system solve failed during optimization
    #[error("Linear system solve failed: {0}")]
    LinearSolveFailed(String),

    /// Invalid optimization parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// NaN or Inf in cost, gradient or parameters
    #[error("Numerical instability detected: {0}")]
    NumericalInstability(String),

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] linalg::LinAlgError),

    /// No variable is referenced by any factor
    #[error("Problem has no variables to optimize")]
    EmptyProblem,

    /// The graph has no factors
    #[error("Problem has no residual blocks")]
    NoResidualBlocks,

    /// Jacobi scaling matrix creation failed
    #[error("Failed to create Jacobi scaling matrix: {0}")]
    JacobiScalingCreation(String),

    /// Jacobi scaling requested before it was computed
    #[error("Jacobi scaling not initialized")]
    JacobiScalingNotInitialized,
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| OptimizerError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Detailed convergence information.
#[derive(Debug, Clone)]
pub struct ConvergenceInfo {
    pub final_gradient_norm: f64,
    pub final_parameter_update_norm: f64,
    pub cost_evaluations: usize,
    pub jacobian_evaluations: usize,
}

impl Display for ConvergenceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Final gradient norm: {:.2e}, Final parameter update norm: {:.2e}, Cost evaluations: {}, Jacobian evaluations: {}",
            self.final_gradient_norm,
            self.final_parameter_update_norm,
            self.cost_evaluations,
            self.jacobian_evaluations
        )
    }
}

/// Termination reason of a base optimizer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    Converged,
    MaxIterationsReached,
    CostToleranceReached,
    ParameterToleranceReached,
    GradientToleranceReached,
    Timeout,
    /// Trust region radius fell below minimum threshold
    TrustRegionRadiusTooSmall,
    /// Objective function fell below user-specified cutoff
    MinCostThresholdReached,
    /// NaN or Inf detected in cost or parameters
    InvalidNumericalValues,
}

impl OptimizationStatus {
    /// Whether the run stopped on a convergence criterion rather than a limit.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::Converged
                | OptimizationStatus::CostToleranceReached
                | OptimizationStatus::GradientToleranceReached
                | OptimizationStatus::ParameterToleranceReached
                | OptimizationStatus::MinCostThresholdReached
        )
    }

    /// Whether the run broke down numerically, leaving no usable estimate.
    pub fn is_failure(&self) -> bool {
        matches!(self, OptimizationStatus::InvalidNumericalValues)
    }
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::CostToleranceReached => write!(f, "Cost tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::Timeout => write!(f, "Timeout"),
            OptimizationStatus::TrustRegionRadiusTooSmall => {
                write!(f, "Trust region radius too small")
            }
            OptimizationStatus::MinCostThresholdReached => {
                write!(f, "Minimum cost threshold reached")
            }
            OptimizationStatus::InvalidNumericalValues => {
                write!(f, "Invalid numerical values (NaN/Inf) detected")
            }
        }
    }
}

/// Result of a solver execution.
#[derive(Debug, Clone)]
pub struct SolverResult<T> {
    pub parameters: T,
    pub status: OptimizationStatus,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub elapsed_time: time::Duration,
    pub convergence_info: Option<ConvergenceInfo>,
}

/// A nonlinear least-squares optimizer over a factor graph.
pub trait Solver {
    type Config;

    fn with_config(config: Self::Config) -> Self;

    /// Minimize the graph error starting from `initial`.
    ///
    /// Variables present in `initial` but not referenced by any factor are returned
    /// unchanged.
    fn optimize(
        &mut self,
        graph: &FactorGraph,
        initial: &Values,
    ) -> GncSolverResult<SolverResult<Values>>;
}

/// Configuration that knows which [`Solver`] it configures.
pub trait SolverConfig: Clone + PartialEq + Debug {
    type Solver: Solver<Config = Self>;

    fn build(&self) -> Self::Solver {
        Self::Solver::with_config(self.clone())
    }
}

/// End-of-run statistics a base optimizer logs at debug level.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub solver: &'static str,
    pub status: OptimizationStatus,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    /// Steps that were kept; every step for Gauss-Newton
    pub accepted_steps: usize,
    pub max_gradient_norm: f64,
    pub final_gradient_norm: f64,
    pub max_step_norm: f64,
    /// Damping at termination, for damped solvers
    pub final_damping: Option<f64>,
    pub elapsed: time::Duration,
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let outcome = if self.status.is_converged() {
            "converged"
        } else {
            "stopped"
        };
        writeln!(f, "{} {}: {}", self.solver, outcome, self.status)?;
        writeln!(
            f,
            "  cost        {:.6e} -> {:.6e} ({:.2}% reduction)",
            self.initial_cost,
            self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(f64::MIN_POSITIVE)
        )?;
        writeln!(
            f,
            "  iterations  {} ({} accepted)",
            self.iterations, self.accepted_steps
        )?;
        writeln!(
            f,
            "  |gradient|  max {:.2e}, final {:.2e}",
            self.max_gradient_norm, self.final_gradient_norm
        )?;
        writeln!(f, "  |step|      max {:.2e}", self.max_step_norm)?;
        if let Some(damping) = self.final_damping {
            writeln!(f, "  damping     {:.2e}", damping)?;
        }
        write!(
            f,
            "  time        {:.2}ms ({:.3}ms per iteration)",
            self.elapsed.as_secs_f64() * 1000.0,
            self.elapsed.as_secs_f64() * 1000.0 / self.iterations.max(1) as f64
        )
    }
}

/// Per-iteration statistics, printed as a table at debug level.
#[derive(Debug, Clone)]
pub struct IterationStats {
    pub iteration: usize,
    pub cost: f64,
    pub cost_change: f64,
    pub gradient_norm: f64,
    pub step_norm: f64,
    /// Step quality ratio (LM only)
    pub tr_ratio: f64,
    /// Damping or trust region radius (LM only)
    pub tr_radius: f64,
    pub iter_time_ms: f64,
    pub total_time_ms: f64,
    pub accepted: bool,
}

impl IterationStats {
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}  {:>11}  {:>11}  {:>11}  {:>13}  {:>6}",
            "iter",
            "cost",
            "cost_change",
            "|gradient|",
            "|step|",
            "tr_ratio",
            "tr_radius",
            "iter_time",
            "total_time",
            "status"
        );
    }

    pub fn print_line(&self) {
        let status = if self.iteration == 0 {
            "-"
        } else if self.accepted {
            "✓"
        } else {
            "✗"
        };

        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>13.2e}  {:>13.2e}  {:>11.2e}  {:>11.2e}  {:>9.2}ms  {:>11.2}ms  {:>6}",
            self.iteration,
            self.cost,
            self.cost_change,
            self.gradient_norm,
            self.step_norm,
            self.tr_ratio,
            self.tr_radius,
            self.iter_time_ms,
            self.total_time_ms,
            status
        );
    }
}

/// Diagonal column scaling `S = diag(1 / (1 + ‖J_c‖))`.
///
/// The scaled problem is solved for `ds` with Jacobian `J·S`; the parameter step is `S·ds`.
#[derive(Debug, Clone)]
pub struct JacobiScaling {
    diagonal: Vec<f64>,
    matrix: SparseColMat<usize, f64>,
}

impl JacobiScaling {
    pub fn from_jacobian(jacobian: &SparseColMat<usize, f64>) -> OptimizerResult<Self> {
        let cols = jacobian.ncols();
        let mut col_norm_squared = vec![0.0; cols];
        for t in jacobian.triplet_iter() {
            col_norm_squared[t.col] += t.val * t.val;
        }

        let diagonal: Vec<f64> = col_norm_squared
            .iter()
            .map(|sq| 1.0 / (1.0 + sq.sqrt()))
            .collect();
        let triplets: Vec<Triplet<usize, usize, f64>> = diagonal
            .iter()
            .enumerate()
            .map(|(c, s)| Triplet::new(c, c, *s))
            .collect();

        let matrix = SparseColMat::try_new_from_triplets(cols, cols, &triplets).map_err(|e| {
            OptimizerError::JacobiScalingCreation(e.to_string()).log_with_source(e)
        })?;

        Ok(Self { diagonal, matrix })
    }

    /// `J·S`
    pub fn scale_jacobian(&self, jacobian: &SparseColMat<usize, f64>) -> SparseColMat<usize, f64> {
        jacobian * &self.matrix
    }

    /// `S·v` for a column vector in scaled coordinates.
    pub fn unscale(&self, scaled: &Mat<f64>) -> Mat<f64> {
        Mat::from_fn(scaled.nrows(), 1, |i, _| scaled[(i, 0)] * self.diagonal[i])
    }
}

/// `‖x‖` over the variables listed in `order`.
pub(crate) fn parameter_norm(values: &Values, order: &[String]) -> f64 {
    order
        .iter()
        .filter_map(|key| values.get(key))
        .map(|v| v.norm_squared())
        .sum::<f64>()
        .sqrt()
}
