//! Levenberg-Marquardt optimization over a factor graph.
//!
//! Each iteration solves the damped normal equations
//!
//! ```text
//! (JᵀJ + λI)·h = −Jᵀr
//! ```
//!
//! and accepts the step only when the actual cost reduction agrees well enough with the
//! reduction predicted by the linear model. The ratio of the two,
//!
//! ```text
//! ρ = (F(x) − F(x + h)) / (L(0) − L(h)),    L(0) − L(h) = ½·hᵀ(λh − g)
//! ```
//!
//! drives the damping update (Nielsen's strategy):
//!
//! - `ρ > 0`: accept, `λ ← λ · max(1/3, 1 − (2ρ − 1)³)`, `ν ← 2`
//! - `ρ ≤ 0`: reject and restore the previous estimate, `λ ← λ · ν`, `ν ← 2ν`
//!
//! Small `λ` gives Gauss-Newton steps, large `λ` gives short gradient-descent steps. The
//! trust region radius reported in diagnostics is `1/λ`.
//!
//! # References
//!
//! - Madsen, K., Nielsen, H. B., & Tingleff, O. (2004). *Methods for Non-Linear Least
//!   Squares Problems* (2nd ed.). Chapter 3.
//! - Nielsen, H. B. (1999). *Damping Parameter in Marquardt's Method*. IMM-REP-1999-05.

use faer::{Mat, sparse::SparseColMat};
use tracing::debug;
use web_time::{Duration, Instant};

use crate::core::{factor_graph::FactorGraph, values::Values};
use crate::error::GncSolverResult;
use crate::linalg::{SparseCholeskySolver, SparseLinearSolver};
use crate::observers::SolverStep;
use crate::optimizer::{
    self, ConvergenceInfo, IterationStats, JacobiScaling, OptObserverVec, OptimizationStatus,
    OptimizerError, RunSummary, Solver, SolverConfig, SolverResult,
};

/// Configuration parameters for the Levenberg-Marquardt optimizer.
///
/// `damping` is the initial `λ`; each call to `optimize` starts again from it, so one
/// configured solver can be reused on different problems.
#[derive(Debug, Clone, PartialEq)]
pub struct LevenbergMarquardtConfig {
    pub max_iterations: usize,
    pub cost_tolerance: f64,
    pub parameter_tolerance: f64,
    pub gradient_tolerance: f64,
    pub timeout: Option<Duration>,
    pub damping: f64,
    pub damping_min: f64,
    pub damping_max: f64,
    /// Initial `ν` of the rejection schedule
    pub damping_nu: f64,
    pub min_cost_threshold: Option<f64>,
    /// Stop once `1/λ` falls below this radius.
    pub min_trust_region_radius: f64,
    pub use_jacobi_scaling: bool,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            cost_tolerance: 1e-6,
            parameter_tolerance: 1e-8,
            gradient_tolerance: 1e-10,
            timeout: None,
            damping: 1e-4,
            damping_min: 1e-12,
            damping_max: 1e12,
            damping_nu: 2.0,
            min_cost_threshold: None,
            min_trust_region_radius: 1e-32,
            use_jacobi_scaling: false,
        }
    }
}

impl LevenbergMarquardtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_cost_tolerance(mut self, cost_tolerance: f64) -> Self {
        self.cost_tolerance = cost_tolerance;
        self
    }

    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.damping_min = min;
        self.damping_max = max;
        self
    }

    pub fn with_min_cost_threshold(mut self, min_cost: f64) -> Self {
        self.min_cost_threshold = Some(min_cost);
        self
    }

    pub fn with_min_trust_region_radius(mut self, min_radius: f64) -> Self {
        self.min_trust_region_radius = min_radius;
        self
    }

    pub fn with_jacobi_scaling(mut self, use_jacobi_scaling: bool) -> Self {
        self.use_jacobi_scaling = use_jacobi_scaling;
        self
    }

    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:        Levenberg-Marquardt\n  Linear solver: Sparse Cholesky\n  Convergence Criteria:\n  Max iterations:      {}\n  Cost tolerance:      {:.2e}\n  Parameter tolerance: {:.2e}\n  Gradient tolerance:  {:.2e}\n  Timeout:             {:?}\n  Damping Parameters:\n  Initial damping:     {:.2e}\n  Damping range:       [{:.2e}, {:.2e}]\n  Initial nu:          {:.2}\n  Numerical Settings:\n  Jacobi scaling:      {}",
            self.max_iterations,
            self.cost_tolerance,
            self.parameter_tolerance,
            self.gradient_tolerance,
            self.timeout,
            self.damping,
            self.damping_min,
            self.damping_max,
            self.damping_nu,
            if self.use_jacobi_scaling {
                "enabled"
            } else {
                "disabled"
            }
        );
    }
}

impl SolverConfig for LevenbergMarquardtConfig {
    type Solver = LevenbergMarquardt;
}

/// Damping state of one run.
#[derive(Debug, Clone, Copy)]
struct Damping {
    lambda: f64,
    nu: f64,
}

struct StepResult {
    step: Mat<f64>,
    gradient_norm: f64,
    predicted_reduction: f64,
}

struct StepEvaluation {
    accepted: bool,
    cost_before: f64,
    rho: f64,
}

pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
    jacobi_scaling: Option<JacobiScaling>,
    observers: OptObserverVec,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

impl LevenbergMarquardt {
    pub fn new() -> Self {
        Self::with_config(LevenbergMarquardtConfig::default())
    }

    pub fn with_config(config: LevenbergMarquardtConfig) -> Self {
        Self {
            config,
            jacobi_scaling: None,
            observers: OptObserverVec::new(),
        }
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    pub fn add_observer(&mut self, observer: impl optimizer::OptObserver + 'static) {
        self.observers.add(observer);
    }

    /// Nielsen update. Returns whether the step is accepted.
    fn update_damping(&self, damping: &mut Damping, rho: f64) -> bool {
        if rho > 0.0 {
            let coff = 2.0 * rho - 1.0;
            damping.lambda *= (1.0_f64 / 3.0).max(1.0 - coff * coff * coff);
            damping.lambda = damping.lambda.max(self.config.damping_min);
            damping.nu = 2.0;
            true
        } else {
            damping.lambda *= damping.nu;
            damping.nu *= 2.0;
            damping.lambda = damping.lambda.min(self.config.damping_max);
            false
        }
    }

    fn compute_step_quality(current_cost: f64, new_cost: f64, predicted_reduction: f64) -> f64 {
        let actual_reduction = current_cost - new_cost;
        if predicted_reduction.abs() < 1e-15 {
            if actual_reduction > 0.0 { 1.0 } else { 0.0 }
        } else {
            actual_reduction / predicted_reduction
        }
    }

    /// `½·hᵀ(λh − g)`, evaluated in the coordinates the system was solved in.
    fn compute_predicted_reduction(lambda: f64, step: &Mat<f64>, gradient: &Mat<f64>) -> f64 {
        let diff = lambda * step - gradient;
        (0.5 * step.transpose() * &diff)[(0, 0)]
    }

    #[allow(clippy::too_many_arguments)]
    fn check_convergence(
        &self,
        iteration: usize,
        current_cost: f64,
        new_cost: f64,
        parameter_norm: f64,
        parameter_update_norm: f64,
        gradient_norm: f64,
        trust_region_radius: f64,
        elapsed: Duration,
        step_accepted: bool,
    ) -> Option<OptimizationStatus> {
        if !new_cost.is_finite() || !parameter_update_norm.is_finite() || !gradient_norm.is_finite()
        {
            return Some(OptimizationStatus::InvalidNumericalValues);
        }

        if let Some(timeout) = self.config.timeout
            && elapsed >= timeout
        {
            return Some(OptimizationStatus::Timeout);
        }

        if iteration + 1 >= self.config.max_iterations {
            return Some(OptimizationStatus::MaxIterationsReached);
        }

        // The gradient is evaluated before the step, so it is valid whether or not the
        // step was kept.
        if gradient_norm < self.config.gradient_tolerance {
            return Some(OptimizationStatus::GradientToleranceReached);
        }

        if trust_region_radius < self.config.min_trust_region_radius {
            return Some(OptimizationStatus::TrustRegionRadiusTooSmall);
        }

        if !step_accepted {
            return None;
        }

        if iteration > 0 {
            let relative_step_tolerance = self.config.parameter_tolerance
                * (parameter_norm + self.config.parameter_tolerance);
            if parameter_update_norm <= relative_step_tolerance {
                return Some(OptimizationStatus::ParameterToleranceReached);
            }

            let relative_cost_change = (current_cost - new_cost).abs() / current_cost.max(1e-10);
            if relative_cost_change < self.config.cost_tolerance {
                return Some(OptimizationStatus::CostToleranceReached);
            }
        }

        if let Some(min_cost) = self.config.min_cost_threshold
            && new_cost < min_cost
        {
            return Some(OptimizationStatus::MinCostThresholdReached);
        }

        None
    }

    fn compute_levenberg_marquardt_step(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        iteration: usize,
        lambda: f64,
        linear_solver: &mut SparseCholeskySolver,
    ) -> Result<StepResult, OptimizerError> {
        let scaled_jacobian = if self.config.use_jacobi_scaling {
            if iteration == 0 {
                self.jacobi_scaling = Some(JacobiScaling::from_jacobian(jacobian)?);
            }
            self.jacobi_scaling
                .as_ref()
                .ok_or_else(|| OptimizerError::JacobiScalingNotInitialized.log())?
                .scale_jacobian(jacobian)
        } else {
            jacobian.clone()
        };

        let scaled_step = linear_solver
            .solve_augmented_equation(residuals, &scaled_jacobian, lambda)
            .map_err(|e| OptimizerError::LinearSolveFailed(e.to_string()).log_with_source(e))?;

        let gradient = linear_solver.get_gradient().ok_or_else(|| {
            OptimizerError::NumericalInstability("Gradient not available".into()).log()
        })?;
        let gradient_norm = gradient.norm_l2();
        let predicted_reduction = Self::compute_predicted_reduction(lambda, &scaled_step, gradient);

        let step = if self.config.use_jacobi_scaling {
            self.jacobi_scaling
                .as_ref()
                .ok_or_else(|| OptimizerError::JacobiScalingNotInitialized.log())?
                .unscale(&scaled_step)
        } else {
            scaled_step
        };

        Ok(StepResult {
            step,
            gradient_norm,
            predicted_reduction,
        })
    }

    pub fn optimize(
        &mut self,
        graph: &FactorGraph,
        initial: &Values,
    ) -> GncSolverResult<SolverResult<Values>> {
        let start_time = Instant::now();

        if graph.is_empty() {
            return Err(OptimizerError::NoResidualBlocks.log().into());
        }
        let layout = graph.variable_layout(initial)?;
        if layout.total_dof() == 0 {
            return Err(OptimizerError::EmptyProblem.log().into());
        }
        let symbolic = graph.build_symbolic_structure(initial, &layout)?;

        let mut values = initial.clone();
        let initial_cost = graph.error(&values)?;
        let mut current_cost = initial_cost;

        let mut linear_solver = SparseCholeskySolver::new();
        self.jacobi_scaling = None;
        let mut damping = Damping {
            lambda: self.config.damping,
            nu: self.config.damping_nu,
        };

        let mut iteration = 0;
        let mut cost_evaluations = 1;
        let mut jacobian_evaluations = 0;
        let mut successful_steps = 0;
        let mut max_gradient_norm: f64 = 0.0;
        let mut max_parameter_update_norm: f64 = 0.0;

        let debug_enabled = tracing::enabled!(tracing::Level::DEBUG);
        if debug_enabled {
            self.config.print_configuration();
            IterationStats::print_header();
        }

        loop {
            let iter_start = Instant::now();

            let (residuals, jacobian) =
                graph.compute_residual_and_jacobian(&values, &layout, &symbolic)?;
            jacobian_evaluations += 1;

            let step_result = self.compute_levenberg_marquardt_step(
                &residuals,
                &jacobian,
                iteration,
                damping.lambda,
                &mut linear_solver,
            )?;

            let mut candidate = values.clone();
            let step_norm = candidate.retract(step_result.step.as_ref(), layout.order());
            max_gradient_norm = max_gradient_norm.max(step_result.gradient_norm);
            max_parameter_update_norm = max_parameter_update_norm.max(step_norm);

            let new_cost = graph.error(&candidate)?;
            cost_evaluations += 1;

            let rho =
                Self::compute_step_quality(current_cost, new_cost, step_result.predicted_reduction);
            let accepted = self.update_damping(&mut damping, rho);
            let step_eval = StepEvaluation {
                accepted,
                cost_before: current_cost,
                rho,
            };
            if accepted {
                values = candidate;
                current_cost = new_cost;
                successful_steps += 1;
            }

            if debug_enabled {
                IterationStats {
                    iteration,
                    cost: current_cost,
                    cost_change: step_eval.cost_before - current_cost,
                    gradient_norm: step_result.gradient_norm,
                    step_norm,
                    tr_ratio: step_eval.rho,
                    tr_radius: 1.0 / damping.lambda,
                    iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                    total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
                    accepted: step_eval.accepted,
                }
                .print_line();
            }

            self.observers.notify(&SolverStep {
                iteration,
                values: &values,
                cost: current_cost,
                gradient_norm: step_result.gradient_norm,
                step_norm,
                damping: Some(damping.lambda),
                accepted: step_eval.accepted,
            });

            let elapsed = start_time.elapsed();
            if let Some(status) = self.check_convergence(
                iteration,
                step_eval.cost_before,
                current_cost,
                optimizer::parameter_norm(&values, layout.order()),
                step_norm,
                step_result.gradient_norm,
                1.0 / damping.lambda,
                elapsed,
                step_eval.accepted,
            ) {
                let iterations = iteration + 1;
                if debug_enabled {
                    let summary = RunSummary {
                        solver: "Levenberg-Marquardt",
                        status: status.clone(),
                        initial_cost,
                        final_cost: current_cost,
                        iterations,
                        accepted_steps: successful_steps,
                        max_gradient_norm,
                        final_gradient_norm: step_result.gradient_norm,
                        max_step_norm: max_parameter_update_norm,
                        final_damping: Some(damping.lambda),
                        elapsed,
                    };
                    debug!("{}", summary);
                }

                return Ok(SolverResult {
                    parameters: values,
                    status,
                    initial_cost,
                    final_cost: current_cost,
                    iterations,
                    elapsed_time: elapsed,
                    convergence_info: Some(ConvergenceInfo {
                        final_gradient_norm: step_result.gradient_norm,
                        final_parameter_update_norm: step_norm,
                        cost_evaluations,
                        jacobian_evaluations,
                    }),
                });
            }

            iteration += 1;
        }
    }
}

impl Solver for LevenbergMarquardt {
    type Config = LevenbergMarquardtConfig;

    fn with_config(config: Self::Config) -> Self {
        LevenbergMarquardt::with_config(config)
    }

    fn optimize(
        &mut self,
        graph: &FactorGraph,
        initial: &Values,
    ) -> GncSolverResult<SolverResult<Values>> {
        LevenbergMarquardt::optimize(self, graph, initial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::noise_model::NoiseModel;
    use crate::factors::{BetweenFactor, Factor, PriorFactor, RangeFactor};
    use nalgebra::{DMatrix, DVector, dvector};
    use std::sync::Arc;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// r = 10(x2 − x1²), 1 − x1
    struct Rosenbrock;

    impl Factor for Rosenbrock {
        fn linearize(
            &self,
            params: &[DVector<f64>],
            compute_jacobian: bool,
        ) -> (DVector<f64>, Option<DMatrix<f64>>) {
            let x1 = params[0][0];
            let x2 = params[1][0];
            let residual = dvector![10.0 * (x2 - x1 * x1), 1.0 - x1];
            let jacobian = compute_jacobian
                .then(|| DMatrix::from_row_slice(2, 2, &[-20.0 * x1, 10.0, -1.0, 0.0]));
            (residual, jacobian)
        }

        fn get_dimension(&self) -> usize {
            2
        }

        fn num_variables(&self) -> usize {
            2
        }
    }

    #[test]
    fn test_rosenbrock_converges() -> TestResult {
        let mut graph = FactorGraph::new();
        graph.add(
            vec!["x1".to_string(), "x2".to_string()],
            Arc::new(Rosenbrock),
            NoiseModel::unit(2)?,
        )?;
        let mut initial = Values::new();
        initial.insert("x1", dvector![-1.2]);
        initial.insert("x2", dvector![1.0]);

        let config = LevenbergMarquardtConfig::new()
            .with_max_iterations(200)
            .with_cost_tolerance(1e-12)
            .with_parameter_tolerance(1e-12);
        let result = LevenbergMarquardt::with_config(config).optimize(&graph, &initial)?;

        assert!(result.status.is_converged(), "status {:?}", result.status);
        assert!((result.parameters.try_get("x1")?[0] - 1.0).abs() < 1e-4);
        assert!((result.parameters.try_get("x2")?[0] - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_range_chain_with_jacobi_scaling() -> TestResult {
        let mut graph = FactorGraph::new();
        graph.add(
            vec!["a".to_string()],
            Arc::new(PriorFactor::new(dvector![0.0, 0.0])),
            NoiseModel::isotropic(2, 0.01)?,
        )?;
        graph.add(
            vec!["a".to_string(), "b".to_string()],
            Arc::new(BetweenFactor::new(dvector![1.0, 0.0])?),
            NoiseModel::isotropic(2, 0.1)?,
        )?;
        graph.add(
            vec!["a".to_string(), "b".to_string()],
            Arc::new(RangeFactor::new(1.0, 2)?),
            NoiseModel::isotropic(1, 0.05)?,
        )?;

        let mut initial = Values::new();
        initial.insert("a", dvector![0.3, -0.2]);
        initial.insert("b", dvector![2.0, 1.0]);

        let result = LevenbergMarquardt::with_config(
            LevenbergMarquardtConfig::new().with_jacobi_scaling(true),
        )
        .optimize(&graph, &initial)?;

        assert!(result.final_cost < 1e-8, "final cost {}", result.final_cost);
        let b = result.parameters.try_get("b")?;
        assert!((b[0] - 1.0).abs() < 1e-4);
        assert!(b[1].abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_update_damping_nielsen() {
        let solver = LevenbergMarquardt::new();
        let mut damping = Damping {
            lambda: 1.0,
            nu: 2.0,
        };

        // Perfect agreement: λ shrinks by a third.
        assert!(solver.update_damping(&mut damping, 1.0));
        assert!((damping.lambda - 1.0 / 3.0).abs() < 1e-12);

        assert!(!solver.update_damping(&mut damping, -1.0));
        assert!((damping.lambda - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(damping.nu, 4.0);

        assert!(!solver.update_damping(&mut damping, 0.0));
        assert!((damping.lambda - 8.0 / 3.0).abs() < 1e-12);
        assert_eq!(damping.nu, 8.0);
    }

    #[test]
    fn test_step_quality_with_vanishing_prediction() {
        assert_eq!(LevenbergMarquardt::compute_step_quality(1.0, 0.5, 0.0), 1.0);
        assert_eq!(LevenbergMarquardt::compute_step_quality(1.0, 1.5, 0.0), 0.0);
        assert!((LevenbergMarquardt::compute_step_quality(1.0, 0.5, 1.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_config_is_not_mutated_by_a_run() -> TestResult {
        let mut graph = FactorGraph::new();
        graph.add(
            vec!["x".to_string()],
            Arc::new(PriorFactor::new(dvector![3.0])),
            NoiseModel::unit(1)?,
        )?;
        let mut initial = Values::new();
        initial.insert("x", dvector![0.0]);

        let config = LevenbergMarquardtConfig::new();
        let mut solver = config.build();
        let first = solver.optimize(&graph, &initial)?;
        let second = solver.optimize(&graph, &initial)?;
        assert_eq!(solver.config(), &config);
        assert_eq!(first.iterations, second.iterations);
        assert!((first.parameters.try_get("x")?[0] - 3.0).abs() < 1e-6);
        Ok(())
    }
}
