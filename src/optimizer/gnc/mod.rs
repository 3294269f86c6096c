//! Graduated Non-Convexity (GNC) for outlier-robust estimation.
//!
//! GNC wraps a base least-squares optimizer and solves a sequence of weighted problems.
//! Each factor gets a weight in `[0, 1]` from its error at the current estimate; a control
//! parameter `mu` starts at a value that makes the robust surrogate nearly convex and is
//! moved step by step towards the actual robust cost. Factors whose weights fall to zero
//! are effectively rejected as outliers.
//!
//! ```text
//! strip robust losses ─► mu0 from worst initial error ─► weights = 1
//!        ┌──────────────────────────────────────────────────┘
//!        ▼
//!   weighted graph ─► base solve ─► weights(estimate, mu) ─► saturated? ─► update mu ─► mu converged?
//!        ▲                                                                                   │
//!        └──────────────────────────────────── no ───────────────────────────────────────────┘
//! ```
//!
//! The returned weights are the ones computed at the returned estimate; the estimate itself
//! comes from the solve weighted by the previous iteration's weights.
//!
//! Two loss families are available through [`GncLossType`]: truncated least squares (TLS,
//! default) and Geman-McClure (GM).
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use gnc_solver::core::{factor_graph::FactorGraph, noise_model::NoiseModel, values::Values};
//! use gnc_solver::factors::PriorFactor;
//! use gnc_solver::optimizer::{GaussNewtonConfig, GncConfig, GncOptimizer};
//! use nalgebra::dvector;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = FactorGraph::new();
//! for prior in [dvector![0.0, 0.0], dvector![0.0, 0.0], dvector![0.0, 0.0], dvector![1.0, 0.0]] {
//!     graph.add(
//!         vec!["x".to_string()],
//!         Arc::new(PriorFactor::new(prior)),
//!         NoiseModel::isotropic(2, 0.1)?,
//!     )?;
//! }
//! let mut initial = Values::new();
//! initial.insert("x", dvector![1.0, 0.0]);
//!
//! let mut gnc = GncOptimizer::new(&graph, &initial, GncConfig::new(GaussNewtonConfig::new()))?;
//! let result = gnc.optimize()?;
//! assert!(result.values.try_get("x")?.norm() < 1e-2);
//! assert!(result.weights[3] < 1e-3);
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - Yang, H., Antonante, P., Tzoumas, V., & Carlone, L. (2020). *Graduated Non-Convexity
//!   for Robust Spatial Perception: From Non-Minimal Solvers to Global Outlier Rejection*.
//!   IEEE RA-L.

pub mod config;
pub mod reweight;
pub mod schedule;
pub mod weights;

pub use config::{GncConfig, GncLossType, GncVerbosity};

use std::fmt::{self, Display, Formatter};

use nalgebra::DVector;
use thiserror::Error;
use tracing::{debug, error};
use web_time::{Duration, Instant};

use crate::core::{factor_graph::FactorGraph, values::Values};
use crate::error::GncSolverResult;
use crate::observers::{GncIteration, GncObserver, GncObserverVec, LoggingObserver};
use crate::optimizer::{OptimizerError, Solver, SolverConfig, SolverResult};

/// GNC-specific error types
#[derive(Debug, Clone, Error)]
pub enum GncError {
    #[error("Invalid GNC configuration: {0}")]
    InvalidConfig(String),

    #[error("Known inlier slot {slot} is out of range for a graph of {size} factors")]
    KnownInlierOutOfRange { slot: usize, size: usize },

    /// `mu0` is NaN or infinite, e.g. TLS with `2·rmax² == barcSq`
    #[error(
        "Degenerate initial control parameter mu0 = {mu} (max factor error {max_error:.6e}, inlier threshold {threshold:.6e})"
    )]
    DegenerateMu {
        mu: f64,
        max_error: f64,
        threshold: f64,
    },

    #[error("Weight vector has {actual} entries but the graph has {expected} factors")]
    WeightCountMismatch { expected: usize, actual: usize },

    #[error("Factor {slot} has non-finite error {error} at the current estimate")]
    NonFiniteFactorError { slot: usize, error: f64 },
}

impl GncError {
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

/// Terminal state of a GNC run. Both are successful outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GncStatus {
    /// Weights saturated, `mu` converged, or nothing to reweight
    Converged,
    MaxIterationsReached,
}

impl Display for GncStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            GncStatus::Converged => write!(f, "Converged"),
            GncStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
        }
    }
}

/// Outcome of [`GncOptimizer::optimize`].
#[derive(Debug, Clone)]
pub struct GncResult {
    pub values: Values,
    /// Final weights, in slot order
    pub weights: DVector<f64>,
    /// Outer iterations performed, each one base solve
    pub iterations: usize,
    pub status: GncStatus,
    /// Control parameter at termination. Equal to the one the final weights were computed
    /// with, unless the run stopped on `mu` convergence or the iteration limit.
    pub mu: f64,
    pub elapsed_time: Duration,
}

impl GncResult {
    /// Slots whose final weight is above one half.
    pub fn inlier_slots(&self) -> Vec<usize> {
        self.weights
            .iter()
            .enumerate()
            .filter(|(_, w)| **w > 0.5)
            .map(|(slot, _)| slot)
            .collect()
    }
}

/// Graduated Non-Convexity optimizer over a base optimizer configured by `P`.
pub struct GncOptimizer<P: SolverConfig> {
    graph: FactorGraph,
    state: Values,
    config: GncConfig<P>,
    weights: DVector<f64>,
    known_inlier_mask: Vec<bool>,
    observers: GncObserverVec,
}

impl<P: SolverConfig> GncOptimizer<P> {
    /// Validate `config` against `graph` and prepare a run.
    ///
    /// Robust noise models in `graph` are replaced by their base models; the weights
    /// become the only source of robustness.
    pub fn new(graph: &FactorGraph, initial: &Values, config: GncConfig<P>) -> GncSolverResult<Self> {
        config.validate()?;

        let size = graph.size();
        let mut known_inlier_mask = vec![false; size];
        for &slot in &config.known_inliers {
            if slot >= size {
                return Err(GncError::KnownInlierOutOfRange { slot, size }.log().into());
            }
            known_inlier_mask[slot] = true;
        }

        if graph.has_robust_factors() {
            debug!("GNC: replacing robust noise models by their base models");
        }
        let graph = reweight::strip_robust_losses(graph)?;

        let mut observers = GncObserverVec::new();
        if config.verbosity > GncVerbosity::Silent {
            observers.add(LoggingObserver::new(config.verbosity));
        }

        Ok(Self {
            graph,
            state: initial.clone(),
            config,
            weights: DVector::from_element(size, 1.0),
            known_inlier_mask,
            observers,
        })
    }

    pub fn add_observer(&mut self, observer: impl GncObserver + 'static) {
        self.observers.add(observer);
    }

    /// The graph being optimized, without robust losses.
    pub fn factors(&self) -> &FactorGraph {
        &self.graph
    }

    /// Current estimate: the initial one before `optimize`, the final one after.
    pub fn state(&self) -> &Values {
        &self.state
    }

    pub fn config(&self) -> &GncConfig<P> {
        &self.config
    }

    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    /// `mu0` from the largest factor error at the current estimate.
    pub fn initialize_mu(&self) -> GncSolverResult<f64> {
        // NaN wins the maximum.
        let max_error = self
            .graph
            .factor_errors(&self.state)?
            .into_iter()
            .fold(0.0, |max, e| if e.is_nan() || e > max { e } else { max });
        let threshold = self.config.inlier_cost_threshold;
        let mu = schedule::initial_mu(self.config.loss_type, max_error, threshold);

        if !max_error.is_finite() || !mu.is_finite() {
            return Err(GncError::DegenerateMu {
                mu,
                max_error,
                threshold,
            }
            .log()
            .into());
        }
        Ok(mu)
    }

    pub fn update_mu(&self, mu: f64) -> f64 {
        schedule::next_mu(self.config.loss_type, mu, self.config.mu_step)
    }

    pub fn check_mu_convergence(&self, mu: f64, prev_mu: f64) -> bool {
        schedule::mu_converged(
            self.config.loss_type,
            mu,
            prev_mu,
            self.config.relative_cost_tolerance,
        )
    }

    pub fn check_weights_convergence(&self, weights: &DVector<f64>) -> bool {
        schedule::weights_saturated(weights, self.config.weights_tolerance, |slot| {
            self.is_known_inlier(slot)
        })
    }

    /// Weight of every slot at `values`; known inliers get 1.
    pub fn calculate_weights(&self, values: &Values, mu: f64) -> GncSolverResult<DVector<f64>> {
        let errors = self.graph.factor_errors(values)?;
        if let Some((slot, &error)) = errors.iter().enumerate().find(|(_, e)| !e.is_finite()) {
            return Err(GncError::NonFiniteFactorError { slot, error }.log().into());
        }
        let mask = &self.known_inlier_mask;
        Ok(weights::weights_for_errors(
            self.config.loss_type,
            &errors,
            mu,
            self.config.inlier_cost_threshold,
            |slot| mask.get(slot).copied().unwrap_or(false),
        ))
    }

    pub fn make_weighted_graph(&self, weights: &DVector<f64>) -> GncSolverResult<FactorGraph> {
        reweight::make_weighted_graph(&self.graph, weights)
    }

    fn is_known_inlier(&self, slot: usize) -> bool {
        self.known_inlier_mask.get(slot).copied().unwrap_or(false)
    }

    /// One base solve of `graph` from the current estimate. A numerically broken run is an
    /// error; a run that stopped on a limit is kept.
    fn solve(&self, graph: &FactorGraph) -> GncSolverResult<SolverResult<Values>> {
        let result = self
            .config
            .base_optimizer_config
            .build()
            .optimize(graph, &self.state)?;
        if result.status.is_failure() || !result.final_cost.is_finite() {
            return Err(OptimizerError::NumericalInstability(format!(
                "base optimizer stopped with '{}' at cost {:e}",
                result.status, result.final_cost
            ))
            .log()
            .into());
        }
        Ok(result)
    }

    fn finish(&self, status: GncStatus, iterations: usize, mu: f64, start: Instant) -> GncResult {
        self.observers
            .notify_finish(&status, iterations, &self.weights);
        GncResult {
            values: self.state.clone(),
            weights: self.weights.clone(),
            iterations,
            status,
            mu,
            elapsed_time: start.elapsed(),
        }
    }

    /// Run the continuation until the weights saturate, `mu` converges, or the
    /// iteration limit is hit.
    pub fn optimize(&mut self) -> GncSolverResult<GncResult> {
        let start = Instant::now();
        if tracing::enabled!(tracing::Level::DEBUG) {
            self.config.print_configuration();
        }

        let mut mu = self.initialize_mu()?;
        self.weights = DVector::from_element(self.graph.size(), 1.0);
        self.observers.notify_start(mu, self.graph.error(&self.state)?);

        if self.known_inlier_mask.iter().all(|known| *known) {
            debug!("GNC: every factor is a known inlier, nothing to reweight");
            self.state = self.solve(&self.graph)?.parameters;
            return Ok(self.finish(GncStatus::Converged, 0, mu, start));
        }
        if mu <= 0.0 {
            debug!("GNC: mu0 = {:.6e} <= 0, all factors already inside the inlier region", mu);
            self.state = self.solve(&self.graph)?.parameters;
            return Ok(self.finish(GncStatus::Converged, 0, mu, start));
        }

        for iteration in 0..self.config.max_iterations {
            let weighted = self.make_weighted_graph(&self.weights)?;
            let result = self.solve(&weighted)?;
            let weights = self.calculate_weights(&result.parameters, mu)?;
            self.state = result.parameters;
            self.weights = weights;

            self.observers.notify(&GncIteration {
                iteration,
                mu,
                weights: &self.weights,
                values: &self.state,
                cost: result.final_cost,
            });

            if self.check_weights_convergence(&self.weights) {
                debug!("GNC: weights saturated at iteration {}", iteration);
                return Ok(self.finish(GncStatus::Converged, iteration + 1, mu, start));
            }

            let prev_mu = mu;
            mu = self.update_mu(mu);
            if self.check_mu_convergence(mu, prev_mu) {
                debug!("GNC: mu converged at iteration {} (mu = {:.6e})", iteration, mu);
                return Ok(self.finish(GncStatus::Converged, iteration + 1, mu, start));
            }
        }

        Ok(self.finish(
            GncStatus::MaxIterationsReached,
            self.config.max_iterations,
            mu,
            start,
        ))
    }
}
