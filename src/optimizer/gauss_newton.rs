//! Gauss-Newton optimization over a factor graph.
//!
//! Minimizes `F(x) = Σᵢ errorᵢ(x)` by repeatedly linearizing the whitened residuals and
//! solving the normal equations
//!
//! ```text
//! JᵀJ·h = −Jᵀr
//! ```
//!
//! then updating `x ← x + h`. Every computed step is taken; there is no damping or step
//! rejection, so the method converges quadratically close to the solution but can
//! overshoot from a poor initial guess. [`LevenbergMarquardt`](crate::optimizer::LevenbergMarquardt)
//! is the safer choice in that case.
//!
//! Robust noise models are handled through their corrected residuals and Jacobians, which
//! turns each Gauss-Newton step into one iteratively-reweighted least-squares step.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use gnc_solver::core::{factor_graph::FactorGraph, noise_model::NoiseModel, values::Values};
//! use gnc_solver::factors::PriorFactor;
//! use gnc_solver::optimizer::{GaussNewton, GaussNewtonConfig, Solver};
//! use nalgebra::dvector;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = FactorGraph::new();
//! graph.add(
//!     vec!["x".to_string()],
//!     Arc::new(PriorFactor::new(dvector![1.0, 2.0])),
//!     NoiseModel::isotropic(2, 0.1)?,
//! )?;
//! let mut initial = Values::new();
//! initial.insert("x", dvector![0.0, 0.0]);
//!
//! let mut solver = GaussNewton::with_config(GaussNewtonConfig::new().with_max_iterations(10));
//! let result = solver.optimize(&graph, &initial)?;
//! assert!(result.final_cost < 1e-12);
//! # Ok(())
//! # }
//! ```

use faer::Mat;
use tracing::debug;
use web_time as time;

use crate::core::{factor_graph::FactorGraph, values::Values};
use crate::error::GncSolverResult;
use crate::linalg::{self, SparseLinearSolver};
use crate::observers::SolverStep;
use crate::optimizer::{
    self, IterationStats, JacobiScaling, OptimizationStatus, OptimizerError, RunSummary,
};

/// Configuration parameters for the Gauss-Newton optimizer.
///
/// The optimizer stops when ANY of the following holds:
/// - **Gradient**: `‖Jᵀr‖ < gradient_tolerance`
/// - **Parameter change**: `‖h‖ ≤ parameter_tolerance · (‖x‖ + parameter_tolerance)`
/// - **Cost change**: `|ΔF| / F < cost_tolerance`
/// - **Cost cutoff**: `F < min_cost_threshold`, if set
/// - **Limits**: `max_iterations` or `timeout`
#[derive(Debug, Clone, PartialEq)]
pub struct GaussNewtonConfig {
    pub max_iterations: usize,
    pub cost_tolerance: f64,
    pub parameter_tolerance: f64,
    pub gradient_tolerance: f64,
    pub timeout: Option<time::Duration>,
    /// Normalize Jacobian columns before solving.
    pub use_jacobi_scaling: bool,
    /// Diagonal added to `JᵀJ` so variables constrained only by zero-weight factors
    /// do not make the system singular. Zero disables it.
    pub min_diagonal: f64,
    pub min_cost_threshold: Option<f64>,
}

impl Default for GaussNewtonConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            cost_tolerance: 1e-6,
            parameter_tolerance: 1e-8,
            gradient_tolerance: 1e-10,
            timeout: None,
            use_jacobi_scaling: false,
            min_diagonal: 1e-10,
            min_cost_threshold: None,
        }
    }
}

impl GaussNewtonConfig {
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

    pub fn with_timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_jacobi_scaling(mut self, use_jacobi_scaling: bool) -> Self {
        self.use_jacobi_scaling = use_jacobi_scaling;
        self
    }

    pub fn with_min_diagonal(mut self, min_diagonal: f64) -> Self {
        self.min_diagonal = min_diagonal;
        self
    }

    pub fn with_min_cost_threshold(mut self, min_cost: f64) -> Self {
        self.min_cost_threshold = Some(min_cost);
        self
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "\nConfiguration:\n  Solver:        Gauss-Newton\n  Linear solver: Sparse Cholesky\n  Convergence Criteria:\n  Max iterations:      {}\n  Cost tolerance:      {:.2e}\n  Parameter tolerance: {:.2e}\n  Gradient tolerance:  {:.2e}\n  Timeout:             {:?}\n  Numerical Settings:\n  Jacobi scaling:      {}\n  Min diagonal:        {:.2e}",
            self.max_iterations,
            self.cost_tolerance,
            self.parameter_tolerance,
            self.gradient_tolerance,
            self.timeout,
            if self.use_jacobi_scaling {
                "enabled"
            } else {
                "disabled"
            },
            self.min_diagonal
        );
    }
}

impl optimizer::SolverConfig for GaussNewtonConfig {
    type Solver = GaussNewton;
}

/// Result from step computation
struct StepResult {
    step: Mat<f64>,
    gradient_norm: f64,
}

/// Gauss-Newton solver.
pub struct GaussNewton {
    config: GaussNewtonConfig,
    jacobi_scaling: Option<JacobiScaling>,
    observers: optimizer::OptObserverVec,
}

impl Default for GaussNewton {
    fn default() -> Self {
        Self::new()
    }
}

impl GaussNewton {
    pub fn new() -> Self {
        Self::with_config(GaussNewtonConfig::default())
    }

    pub fn with_config(config: GaussNewtonConfig) -> Self {
        Self {
            config,
            jacobi_scaling: None,
            observers: optimizer::OptObserverVec::new(),
        }
    }

    pub fn config(&self) -> &GaussNewtonConfig {
        &self.config
    }

    /// Add an observer notified after every iteration with the current values.
    pub fn add_observer(&mut self, observer: impl optimizer::OptObserver + 'static) {
        self.observers.add(observer);
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
        elapsed: time::Duration,
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

        // `iteration` is zero-based and the step has already been taken.
        if iteration + 1 >= self.config.max_iterations {
            return Some(OptimizationStatus::MaxIterationsReached);
        }

        if gradient_norm < self.config.gradient_tolerance {
            return Some(OptimizationStatus::GradientToleranceReached);
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

    fn compute_step(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &faer::sparse::SparseColMat<usize, f64>,
        iteration: usize,
        linear_solver: &mut linalg::SparseCholeskySolver,
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

        let solved = if self.config.min_diagonal > 0.0 {
            linear_solver.solve_augmented_equation(
                residuals,
                &scaled_jacobian,
                self.config.min_diagonal,
            )
        } else {
            linear_solver.solve_normal_equation(residuals, &scaled_jacobian)
        };
        let scaled_step = solved.map_err(|e| {
            OptimizerError::LinearSolveFailed(
                "Linear solver failed to solve Gauss-Newton system".to_string(),
            )
            .log_with_source(e)
        })?;

        let gradient_norm = linear_solver
            .get_gradient()
            .map(|g| g.norm_l2())
            .ok_or_else(|| {
                OptimizerError::LinearSolveFailed("Gradient unavailable after solve".to_string())
                    .log()
            })?;

        let step = match (&self.jacobi_scaling, self.config.use_jacobi_scaling) {
            (Some(scaling), true) => scaling.unscale(&scaled_step),
            _ => scaled_step,
        };

        Ok(StepResult {
            step,
            gradient_norm,
        })
    }

    pub fn optimize(
        &mut self,
        graph: &FactorGraph,
        initial: &Values,
    ) -> GncSolverResult<optimizer::SolverResult<Values>> {
        let start_time = time::Instant::now();

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

        let mut linear_solver = linalg::SparseCholeskySolver::new();
        self.jacobi_scaling = None;

        let mut iteration = 0;
        let mut cost_evaluations = 1;
        let mut jacobian_evaluations = 0;
        let mut max_gradient_norm: f64 = 0.0;
        let mut max_parameter_update_norm: f64 = 0.0;

        let debug_enabled = tracing::enabled!(tracing::Level::DEBUG);
        if debug_enabled {
            self.config.print_configuration();
            IterationStats::print_header();
        }

        loop {
            let iter_start = time::Instant::now();

            let (residuals, jacobian) =
                graph.compute_residual_and_jacobian(&values, &layout, &symbolic)?;
            jacobian_evaluations += 1;

            let step_result =
                self.compute_step(&residuals, &jacobian, iteration, &mut linear_solver)?;

            let step_norm = values.retract(step_result.step.as_ref(), layout.order());
            max_gradient_norm = max_gradient_norm.max(step_result.gradient_norm);
            max_parameter_update_norm = max_parameter_update_norm.max(step_norm);

            let cost_before_step = current_cost;
            current_cost = graph.error(&values)?;
            cost_evaluations += 1;

            if debug_enabled {
                IterationStats {
                    iteration,
                    cost: current_cost,
                    cost_change: cost_before_step - current_cost,
                    gradient_norm: step_result.gradient_norm,
                    step_norm,
                    tr_ratio: 0.0,
                    tr_radius: 0.0,
                    iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                    total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
                    accepted: true,
                }
                .print_line();
            }

            self.observers.notify(&SolverStep {
                iteration,
                values: &values,
                cost: current_cost,
                gradient_norm: step_result.gradient_norm,
                step_norm,
                damping: None,
                accepted: true,
            });

            let elapsed = start_time.elapsed();
            if let Some(status) = self.check_convergence(
                iteration,
                cost_before_step,
                current_cost,
                optimizer::parameter_norm(&values, layout.order()),
                step_norm,
                step_result.gradient_norm,
                elapsed,
            ) {
                let iterations = iteration + 1;
                if debug_enabled {
                    let summary = RunSummary {
                        solver: "Gauss-Newton",
                        status: status.clone(),
                        initial_cost,
                        final_cost: current_cost,
                        iterations,
                        accepted_steps: iterations,
                        max_gradient_norm,
                        final_gradient_norm: step_result.gradient_norm,
                        max_step_norm: max_parameter_update_norm,
                        final_damping: None,
                        elapsed,
                    };
                    debug!("{}", summary);
                }

                return Ok(optimizer::SolverResult {
                    parameters: values,
                    status,
                    initial_cost,
                    final_cost: current_cost,
                    iterations,
                    elapsed_time: elapsed,
                    convergence_info: Some(optimizer::ConvergenceInfo {
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

impl optimizer::Solver for GaussNewton {
    type Config = GaussNewtonConfig;

    fn with_config(config: Self::Config) -> Self {
        GaussNewton::with_config(config)
    }

    fn optimize(
        &mut self,
        graph: &FactorGraph,
        initial: &Values,
    ) -> GncSolverResult<optimizer::SolverResult<Values>> {
        GaussNewton::optimize(self, graph, initial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::noise_model::NoiseModel;
    use crate::error::GncSolverError;
    use crate::factors::{Factor, PriorFactor};
    use crate::optimizer::SolverConfig;
    use nalgebra::{DMatrix, DVector, dvector};
    use std::sync::Arc;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// r1 = 10(x2 − x1²)
    struct RosenbrockFactor1;

    impl Factor for RosenbrockFactor1 {
        fn linearize(
            &self,
            params: &[DVector<f64>],
            compute_jacobian: bool,
        ) -> (DVector<f64>, Option<DMatrix<f64>>) {
            let x1 = params[0][0];
            let x2 = params[1][0];
            let residual = dvector![10.0 * (x2 - x1 * x1)];
            let jacobian = compute_jacobian
                .then(|| DMatrix::from_row_slice(1, 2, &[-20.0 * x1, 10.0]));
            (residual, jacobian)
        }

        fn get_dimension(&self) -> usize {
            1
        }

        fn num_variables(&self) -> usize {
            2
        }
    }

    /// r2 = 1 − x1
    struct RosenbrockFactor2;

    impl Factor for RosenbrockFactor2 {
        fn linearize(
            &self,
            params: &[DVector<f64>],
            compute_jacobian: bool,
        ) -> (DVector<f64>, Option<DMatrix<f64>>) {
            let residual = dvector![1.0 - params[0][0]];
            let jacobian = compute_jacobian.then(|| DMatrix::from_element(1, 1, -1.0));
            (residual, jacobian)
        }

        fn get_dimension(&self) -> usize {
            1
        }

        fn num_variables(&self) -> usize {
            1
        }
    }

    fn rosenbrock() -> Result<(FactorGraph, Values), Box<dyn std::error::Error>> {
        let mut graph = FactorGraph::new();
        graph.add(
            vec!["x1".to_string(), "x2".to_string()],
            Arc::new(RosenbrockFactor1),
            NoiseModel::unit(1)?,
        )?;
        graph.add(
            vec!["x1".to_string()],
            Arc::new(RosenbrockFactor2),
            NoiseModel::unit(1)?,
        )?;

        let mut initial = Values::new();
        initial.insert("x1", dvector![-1.2]);
        initial.insert("x2", dvector![1.0]);
        Ok((graph, initial))
    }

    #[test]
    fn test_rosenbrock_optimization() -> TestResult {
        let (graph, initial) = rosenbrock()?;
        let config = GaussNewtonConfig::new()
            .with_max_iterations(100)
            .with_cost_tolerance(1e-8)
            .with_parameter_tolerance(1e-8)
            .with_gradient_tolerance(1e-10);

        let result = GaussNewton::with_config(config).optimize(&graph, &initial)?;

        let x1 = result.parameters.try_get("x1")?[0];
        let x2 = result.parameters.try_get("x2")?[0];
        assert!(result.status.is_converged(), "status {:?}", result.status);
        assert!((x1 - 1.0).abs() < 1e-4, "x1 = {x1}");
        assert!((x2 - 1.0).abs() < 1e-4, "x2 = {x2}");
        assert!(result.final_cost < 1e-6);
        Ok(())
    }

    #[test]
    fn test_jacobi_scaling_reaches_same_minimum() -> TestResult {
        let (graph, initial) = rosenbrock()?;
        let config = GaussNewtonConfig::new()
            .with_max_iterations(100)
            .with_jacobi_scaling(true);

        let result = GaussNewton::with_config(config).optimize(&graph, &initial)?;
        assert!((result.parameters.try_get("x1")?[0] - 1.0).abs() < 1e-4);
        assert!((result.parameters.try_get("x2")?[0] - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_outlier_pulls_least_squares_estimate() -> TestResult {
        let mut graph = FactorGraph::new();
        for prior in [dvector![0.0, 0.0], dvector![0.0, 0.0], dvector![0.0, 0.0], dvector![1.0, 0.0]] {
            graph.add(
                vec!["x".to_string()],
                Arc::new(PriorFactor::new(prior)),
                NoiseModel::isotropic(2, 0.1)?,
            )?;
        }
        let mut initial = Values::new();
        initial.insert("x", dvector![1.0, 0.0]);

        let result = GaussNewtonConfig::new().build().optimize(&graph, &initial)?;
        let x = result.parameters.try_get("x")?;
        assert!((x[0] - 0.25).abs() < 1e-6);
        assert!(x[1].abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_unreferenced_variables_pass_through() -> TestResult {
        let mut graph = FactorGraph::new();
        graph.add(
            vec!["x".to_string()],
            Arc::new(PriorFactor::new(dvector![2.0])),
            NoiseModel::unit(1)?,
        )?;
        let mut initial = Values::new();
        initial.insert("x", dvector![0.0]);
        initial.insert("untouched", dvector![7.0, 8.0]);

        let result = GaussNewton::new().optimize(&graph, &initial)?;
        assert_eq!(result.parameters.try_get("untouched")?, &dvector![7.0, 8.0]);
        assert!((result.parameters.try_get("x")?[0] - 2.0).abs() < 1e-8);
        Ok(())
    }

    #[test]
    fn test_empty_graph_is_rejected() {
        let result = GaussNewton::new().optimize(&FactorGraph::new(), &Values::new());
        assert!(matches!(
            result,
            Err(GncSolverError::Optimizer(OptimizerError::NoResidualBlocks))
        ));
    }

    #[test]
    fn test_max_iterations_limits_run() -> TestResult {
        let (graph, initial) = rosenbrock()?;
        let result = GaussNewton::with_config(GaussNewtonConfig::new().with_max_iterations(1))
            .optimize(&graph, &initial)?;
        assert_eq!(result.iterations, 1);
        Ok(())
    }

    #[test]
    fn test_config_builders_and_equality() {
        let a = GaussNewtonConfig::new().with_max_iterations(7);
        let b = GaussNewtonConfig::new().with_max_iterations(7);
        assert_eq!(a, b);
        assert_ne!(a, b.with_cost_tolerance(1e-3));
        assert_eq!(GaussNewtonConfig::default().max_iterations, 50);
    }
}
