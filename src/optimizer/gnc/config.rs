//! GNC configuration.

use std::fmt::{self, Debug, Display, Formatter};

use tracing::{debug, warn};

use crate::optimizer::gnc::GncError;

/// Robust loss family driven by the continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GncLossType {
    /// Geman-McClure: smooth, `mu` decreases towards 1.
    GemanMcClure,
    /// Truncated least squares: hard inlier threshold, `mu` increases without bound.
    #[default]
    TruncatedLeastSquares,
}

impl Display for GncLossType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            GncLossType::GemanMcClure => write!(f, "Geman-McClure"),
            GncLossType::TruncatedLeastSquares => write!(f, "Truncated Least Squares"),
        }
    }
}

/// How much the outer loop reports through `tracing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum GncVerbosity {
    #[default]
    Silent,
    /// Start and finish lines.
    Summary,
    /// Per-iteration `mu`, weights and estimate as well.
    Values,
}

impl Display for GncVerbosity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            GncVerbosity::Silent => write!(f, "silent"),
            GncVerbosity::Summary => write!(f, "summary"),
            GncVerbosity::Values => write!(f, "values"),
        }
    }
}

/// Parameters of a GNC run, generic over the base optimizer configuration `P`.
///
/// # Example
///
/// ```
/// use gnc_solver::optimizer::{GaussNewtonConfig, GncConfig, GncLossType};
///
/// let config = GncConfig::new(GaussNewtonConfig::new())
///     .with_loss_type(GncLossType::GemanMcClure)
///     .with_inlier_cost_threshold(2.0)
///     .with_known_inliers(&[0, 1]);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.known_inliers, vec![0, 1]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GncConfig<P> {
    /// Configuration of the optimizer that solves every weighted subproblem
    pub base_optimizer_config: P,
    pub loss_type: GncLossType,
    /// `barcSq`: a factor whose error is at most this value is an inlier of the final cost
    pub inlier_cost_threshold: f64,
    /// Multiplicative `mu` update factor, `> 1`
    pub mu_step: f64,
    pub max_iterations: usize,
    /// `mu` convergence tolerance for TLS
    pub relative_cost_tolerance: f64,
    /// Distance from 0 or 1 at which a weight counts as decided
    pub weights_tolerance: f64,
    /// Slots trusted a priori; their weight stays 1
    pub known_inliers: Vec<usize>,
    pub verbosity: GncVerbosity,
}

impl<P: Default> Default for GncConfig<P> {
    fn default() -> Self {
        Self::new(P::default())
    }
}

impl<P> GncConfig<P> {
    pub fn new(base_optimizer_config: P) -> Self {
        Self {
            base_optimizer_config,
            loss_type: GncLossType::default(),
            inlier_cost_threshold: 1.0,
            mu_step: 1.4,
            max_iterations: 100,
            relative_cost_tolerance: 1e-5,
            weights_tolerance: 1e-4,
            known_inliers: Vec::new(),
            verbosity: GncVerbosity::default(),
        }
    }

    pub fn with_base_optimizer_config(mut self, base_optimizer_config: P) -> Self {
        self.base_optimizer_config = base_optimizer_config;
        self
    }

    pub fn with_loss_type(mut self, loss_type: GncLossType) -> Self {
        self.loss_type = loss_type;
        self
    }

    pub fn with_inlier_cost_threshold(mut self, inlier_cost_threshold: f64) -> Self {
        self.inlier_cost_threshold = inlier_cost_threshold;
        self
    }

    pub fn with_mu_step(mut self, mu_step: f64) -> Self {
        self.mu_step = mu_step;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        warn!(
            "GNC max iterations set to {}: changing it may lead to less accurate solutions",
            max_iterations
        );
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_relative_cost_tolerance(mut self, relative_cost_tolerance: f64) -> Self {
        self.relative_cost_tolerance = relative_cost_tolerance;
        self
    }

    pub fn with_weights_tolerance(mut self, weights_tolerance: f64) -> Self {
        self.weights_tolerance = weights_tolerance;
        self
    }

    /// Append slots to the known-inlier list.
    pub fn with_known_inliers(mut self, slots: &[usize]) -> Self {
        self.known_inliers.extend_from_slice(slots);
        self
    }

    pub fn with_verbosity(mut self, verbosity: GncVerbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Check the scalar parameters. Known-inlier slots are checked against the graph by
    /// `GncOptimizer::new`.
    pub fn validate(&self) -> Result<(), GncError> {
        let invalid = |reason: String| Err(GncError::InvalidConfig(reason).log());

        if !(self.inlier_cost_threshold.is_finite() && self.inlier_cost_threshold > 0.0) {
            return invalid(format!(
                "inlier cost threshold must be positive and finite, got {}",
                self.inlier_cost_threshold
            ));
        }
        if !(self.mu_step.is_finite() && self.mu_step > 1.0) {
            return invalid(format!(
                "mu step must be finite and greater than 1, got {}",
                self.mu_step
            ));
        }
        if self.max_iterations == 0 {
            return invalid("max iterations must be at least 1".to_string());
        }
        if !(self.relative_cost_tolerance.is_finite() && self.relative_cost_tolerance >= 0.0) {
            return invalid(format!(
                "relative cost tolerance must be non-negative, got {}",
                self.relative_cost_tolerance
            ));
        }
        if !(self.weights_tolerance.is_finite() && self.weights_tolerance >= 0.0) {
            return invalid(format!(
                "weights tolerance must be non-negative, got {}",
                self.weights_tolerance
            ));
        }
        Ok(())
    }
}

impl<P: Debug> GncConfig<P> {
    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "\nConfiguration:\n  Solver:              Graduated Non-Convexity\n  Loss type:           {}\n  Inlier threshold:    {:.4e}\n  Mu step:             {:.3}\n  Max iterations:      {}\n  Relative cost tol:   {:.2e}\n  Weights tol:         {:.2e}\n  Known inliers:       {:?}\n  Verbosity:           {}\n  Base optimizer:      {:?}",
            self.loss_type,
            self.inlier_cost_threshold,
            self.mu_step,
            self.max_iterations,
            self.relative_cost_tolerance,
            self.weights_tolerance,
            self.known_inliers,
            self.verbosity,
            self.base_optimizer_config
        );
    }
}
