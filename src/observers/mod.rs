//! Observer hooks for monitoring optimization progress.
//!
//! Two observer families exist:
//!
//! - [`OptObserver`]: called by the base optimizers (Gauss-Newton, Levenberg-Marquardt) after
//!   every inner iteration.
//! - [`GncObserver`]: called by the GNC outer loop at start, after every reweighted solve, and
//!   at termination.
//!
//! Observers take `&self`; implementations that accumulate data use interior mutability
//! (`Arc<Mutex<..>>`), which is why lock poisoning surfaces as [`ObserverError::MutexPoisoned`].
//!
//! # Example
//!
//! ```
//! use gnc_solver::observers::{GncObserver, HistoryObserver};
//!
//! let history = HistoryObserver::new();
//! // Hand a clone to the optimizer, keep `history` to read the records afterwards.
//! let _for_optimizer: Box<dyn GncObserver> = Box::new(history.clone());
//! assert!(history.records().map(|r| r.is_empty()).unwrap_or(false));
//! ```

pub mod logging;

pub use logging::LoggingObserver;

use std::sync::{Arc, Mutex};

use nalgebra::DVector;
use thiserror::Error;
use tracing::error;

use crate::core::values::Values;
use crate::optimizer::gnc::GncStatus;

/// Observer-specific error types
#[derive(Debug, Clone, Error)]
pub enum ObserverError {
    /// Shared observer state was poisoned by a panicking thread
    #[error("Mutex poisoned in {context}: {reason}")]
    MutexPoisoned { context: String, reason: String },
}

impl ObserverError {
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

pub type ObserverResult<T> = Result<T, ObserverError>;

/// Snapshot of one inner iteration of a base optimizer.
#[derive(Debug, Clone, Copy)]
pub struct SolverStep<'a> {
    pub iteration: usize,
    /// Estimate after the iteration (unchanged if the step was rejected)
    pub values: &'a Values,
    pub cost: f64,
    pub gradient_norm: f64,
    pub step_norm: f64,
    /// Damping after the iteration; `None` for undamped solvers
    pub damping: Option<f64>,
    pub accepted: bool,
}

/// Hook for inner iterations of a base optimizer.
pub trait OptObserver: Send {
    fn on_step(&self, step: &SolverStep<'_>);
}

#[derive(Default)]
pub struct OptObserverVec {
    observers: Vec<Box<dyn OptObserver>>,
}

impl OptObserverVec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: impl OptObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    #[inline]
    pub fn notify(&self, step: &SolverStep<'_>) {
        for observer in &self.observers {
            observer.on_step(step);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.observers.len()
    }
}

/// State after one reweighted solve of the GNC outer loop.
#[derive(Debug, Clone, Copy)]
pub struct GncIteration<'a> {
    /// Zero-based outer iteration
    pub iteration: usize,
    /// Control parameter the weights were computed with
    pub mu: f64,
    /// Weights recomputed at `values`, in slot order
    pub weights: &'a DVector<f64>,
    /// Estimate returned by the base optimizer
    pub values: &'a Values,
    /// Cost of the weighted subproblem at `values`
    pub cost: f64,
}

/// Hook for the GNC outer loop.
pub trait GncObserver: Send {
    /// Called once, before the first solve, with `mu0` and the error at the initial estimate.
    fn on_start(&self, _mu: f64, _initial_cost: f64) {}

    fn on_iteration(&self, iteration: &GncIteration<'_>);

    /// Called once with the terminal status, the outer iteration count and the final weights.
    fn on_finish(&self, _status: &GncStatus, _iterations: usize, _weights: &DVector<f64>) {}
}

#[derive(Default)]
pub struct GncObserverVec {
    observers: Vec<Box<dyn GncObserver>>,
}

impl GncObserverVec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: impl GncObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    #[inline]
    pub fn notify_start(&self, mu: f64, initial_cost: f64) {
        for observer in &self.observers {
            observer.on_start(mu, initial_cost);
        }
    }

    #[inline]
    pub fn notify(&self, iteration: &GncIteration<'_>) {
        for observer in &self.observers {
            observer.on_iteration(iteration);
        }
    }

    #[inline]
    pub fn notify_finish(&self, status: &GncStatus, iterations: usize, weights: &DVector<f64>) {
        for observer in &self.observers {
            observer.on_finish(status, iterations, weights);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.observers.len()
    }
}

/// Owned copy of a [`GncIteration`].
#[derive(Debug, Clone, PartialEq)]
pub struct GncIterationRecord {
    pub iteration: usize,
    pub mu: f64,
    pub weights: DVector<f64>,
    pub cost: f64,
}

/// Records every GNC iteration and the terminal status. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct HistoryObserver {
    records: Arc<Mutex<Vec<GncIterationRecord>>>,
    finish: Arc<Mutex<Option<(GncStatus, usize)>>>,
}

impl HistoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> ObserverResult<Vec<GncIterationRecord>> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .map_err(|e| {
                ObserverError::MutexPoisoned {
                    context: "HistoryObserver::records".to_string(),
                    reason: e.to_string(),
                }
                .log()
            })
    }

    /// Terminal status and iteration count, once the run has finished.
    pub fn finish(&self) -> ObserverResult<Option<(GncStatus, usize)>> {
        self.finish.lock().map(|guard| guard.clone()).map_err(|e| {
            ObserverError::MutexPoisoned {
                context: "HistoryObserver::finish".to_string(),
                reason: e.to_string(),
            }
            .log()
        })
    }
}

impl GncObserver for HistoryObserver {
    fn on_iteration(&self, iteration: &GncIteration<'_>) {
        if let Ok(mut guard) = self.records.lock().map_err(|e| {
            ObserverError::MutexPoisoned {
                context: "HistoryObserver::on_iteration".to_string(),
                reason: e.to_string(),
            }
            .log()
        }) {
            guard.push(GncIterationRecord {
                iteration: iteration.iteration,
                mu: iteration.mu,
                weights: iteration.weights.clone(),
                cost: iteration.cost,
            });
        }
    }

    fn on_finish(&self, status: &GncStatus, iterations: usize, _weights: &DVector<f64>) {
        if let Ok(mut guard) = self.finish.lock().map_err(|e| {
            ObserverError::MutexPoisoned {
                context: "HistoryObserver::on_finish".to_string(),
                reason: e.to_string(),
            }
            .log()
        }) {
            *guard = Some((status.clone(), iterations));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[derive(Clone)]
    struct TestObserver {
        calls: Arc<Mutex<Vec<usize>>>,
    }

    impl OptObserver for TestObserver {
        fn on_step(&self, step: &SolverStep<'_>) {
            if let Ok(mut guard) = self.calls.lock() {
                guard.push(step.iteration);
            }
        }
    }

    fn step(values: &Values, iteration: usize) -> SolverStep<'_> {
        SolverStep {
            iteration,
            values,
            cost: 1.0,
            gradient_norm: 0.1,
            step_norm: 0.01,
            damping: None,
            accepted: true,
        }
    }

    #[test]
    fn test_empty_observers() {
        let observers = OptObserverVec::new();
        assert!(observers.is_empty());
        assert_eq!(observers.len(), 0);
        observers.notify(&step(&Values::new(), 0));
    }

    #[test]
    fn test_opt_observers_receive_every_step() -> Result<(), ObserverError> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut observers = OptObserverVec::new();
        observers.add(TestObserver {
            calls: calls.clone(),
        });
        observers.add(TestObserver {
            calls: calls.clone(),
        });
        assert_eq!(observers.len(), 2);

        let values = Values::new();
        observers.notify(&step(&values, 0));
        observers.notify(&step(&values, 1));

        let guard = calls.lock().map_err(|e| {
            ObserverError::MutexPoisoned {
                context: "test_opt_observers_receive_every_step".to_string(),
                reason: e.to_string(),
            }
            .log()
        })?;
        assert_eq!(*guard, vec![0, 0, 1, 1]);
        Ok(())
    }

    #[test]
    fn test_history_observer_shares_storage() -> Result<(), ObserverError> {
        let history = HistoryObserver::new();
        let mut observers = GncObserverVec::new();
        observers.add(history.clone());

        let weights = dvector![1.0, 0.5];
        let values = Values::new();
        observers.notify(&GncIteration {
            iteration: 0,
            mu: 2.0,
            weights: &weights,
            values: &values,
            cost: 3.0,
        });
        observers.notify_finish(&GncStatus::Converged, 1, &weights);

        let records = history.records()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mu, 2.0);
        assert_eq!(records[0].weights, weights);
        assert_eq!(history.finish()?, Some((GncStatus::Converged, 1)));
        Ok(())
    }
}
