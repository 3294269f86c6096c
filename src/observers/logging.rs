//! Verbosity-driven GNC progress logging through `tracing`.

use nalgebra::DVector;
use tracing::{debug, info};

use crate::observers::{GncIteration, GncObserver};
use crate::optimizer::gnc::{GncStatus, GncVerbosity};

/// Logs GNC progress at the level of detail selected by [`GncVerbosity`].
///
/// - `Summary`: start and finish lines at `info`.
/// - `Values`: additionally one `info` line per iteration with `mu` and the weights, and the
///   full estimate at `debug`.
///
/// `GncOptimizer` registers one automatically when the configured verbosity is not `Silent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingObserver {
    verbosity: GncVerbosity,
}

impl LoggingObserver {
    pub fn new(verbosity: GncVerbosity) -> Self {
        Self { verbosity }
    }

    pub fn verbosity(&self) -> GncVerbosity {
        self.verbosity
    }
}

impl GncObserver for LoggingObserver {
    fn on_start(&self, mu: f64, initial_cost: f64) {
        if self.verbosity >= GncVerbosity::Summary {
            info!("GNC start: mu = {:.6e}, initial cost = {:.6e}", mu, initial_cost);
        }
    }

    fn on_iteration(&self, iteration: &GncIteration<'_>) {
        if self.verbosity < GncVerbosity::Values {
            return;
        }
        info!(
            "GNC iter {:>3}: mu = {:.6e}, cost = {:.6e}, weights = {:.4?}",
            iteration.iteration,
            iteration.mu,
            iteration.cost,
            iteration.weights.as_slice()
        );
        for (key, value) in iteration.values.iter() {
            debug!("  {} = {:?}", key, value.as_slice());
        }
    }

    fn on_finish(&self, status: &GncStatus, iterations: usize, weights: &DVector<f64>) {
        if self.verbosity < GncVerbosity::Summary {
            return;
        }
        let inliers = weights.iter().filter(|w| **w > 0.5).count();
        info!(
            "GNC finished: {} after {} iterations, {}/{} factors kept as inliers",
            status,
            iterations,
            inliers,
            weights.len()
        );
        if self.verbosity >= GncVerbosity::Values {
            info!("GNC final weights: {:.4?}", weights.as_slice());
        }
    }
}
