//! End-to-end tests of the GNC optimizer.
//!
//! # Test Coverage
//!
//! - Outlier rejection on the four-prior point problem with TLS and GM
//! - Known inliers, robust input graphs, Levenberg-Marquardt as base optimizer
//! - A strongly nonlinear single-factor problem
//! - Range localization with beacons and corrupted ranges
//! - Observer notifications and error propagation

use std::sync::Arc;

use approx::assert_abs_diff_eq;
use gnc_solver::core::loss_functions::GemanMcClureLoss;
use gnc_solver::core::{factor_graph::FactorGraph, noise_model::NoiseModel, values::Values};
use gnc_solver::factors::{Factor, PriorFactor, RangeFactor};
use gnc_solver::observers::HistoryObserver;
use gnc_solver::optimizer::{
    GaussNewtonConfig, GncConfig, GncLossType, GncOptimizer, GncStatus,
    LevenbergMarquardtConfig, OptimizerError, Solver, SolverConfig,
};
use gnc_solver::GncSolverError;
use nalgebra::{DMatrix, DVector, dvector};

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// `h(x) = (cos x₀, sin x₁) − (1, 0)`
struct TrigFactor;

impl Factor for TrigFactor {
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let x = &params[0];
        let residual = dvector![x[0].cos() - 1.0, x[1].sin()];
        let jacobian = compute_jacobian
            .then(|| DMatrix::from_row_slice(2, 2, &[-x[0].sin(), 0.0, 0.0, x[1].cos()]));
        (residual, jacobian)
    }

    fn get_dimension(&self) -> usize {
        2
    }

    fn num_variables(&self) -> usize {
        1
    }
}

/// Three priors at the origin and one at (1, 0), all with sigma 0.1.
fn outlier_graph(robust: bool) -> Result<FactorGraph, Box<dyn std::error::Error>> {
    let loss = Arc::new(GemanMcClureLoss::new(1.0)?);
    let mut graph = FactorGraph::new();
    for prior in [
        dvector![0.0, 0.0],
        dvector![0.0, 0.0],
        dvector![0.0, 0.0],
        dvector![1.0, 0.0],
    ] {
        let base = NoiseModel::isotropic(2, 0.1)?;
        let noise = if robust {
            NoiseModel::robust(loss.clone(), base)?
        } else {
            base
        };
        graph.add(vec!["x".to_string()], Arc::new(PriorFactor::new(prior)), noise)?;
    }
    Ok(graph)
}

fn point(x: f64, y: f64) -> Values {
    let mut values = Values::new();
    values.insert("x", dvector![x, y]);
    values
}

#[test]
fn test_plain_gauss_newton_is_pulled_by_outlier() -> TestResult {
    let graph = outlier_graph(false)?;
    let result = GaussNewtonConfig::new()
        .build()
        .optimize(&graph, &point(1.0, 0.0))?;
    let x = result.parameters.try_get("x")?;
    assert_abs_diff_eq!(x[0], 0.25, epsilon = 1e-3);
    assert_abs_diff_eq!(x[1], 0.0, epsilon = 1e-3);
    Ok(())
}

#[test]
fn test_robust_graph_without_gnc_gets_stuck() -> TestResult {
    // Starting at the outlier, plain IRLS on the robust graph stays there.
    let graph = outlier_graph(true)?;
    let result = GaussNewtonConfig::new()
        .build()
        .optimize(&graph, &point(1.0, 0.0))?;
    let x = result.parameters.try_get("x")?;
    assert_abs_diff_eq!(x[0], 0.999706, epsilon = 1e-3);
    Ok(())
}

#[test]
fn test_gnc_tls_rejects_outlier() -> TestResult {
    let graph = outlier_graph(false)?;
    let mut gnc = GncOptimizer::new(&graph, &point(1.0, 0.0), GncConfig::new(GaussNewtonConfig::new()))?;
    let result = gnc.optimize()?;

    // The estimate comes from the solve weighted at x = 0.25, where the outlier still had
    // a small share: x ≈ 4e-3.
    let x = result.values.try_get("x")?;
    assert_abs_diff_eq!(x[0], 0.0, epsilon = 5e-3);
    assert_abs_diff_eq!(x[1], 0.0, epsilon = 1e-9);
    assert_eq!(result.status, GncStatus::Converged);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.inlier_slots(), vec![0, 1, 2]);
    assert!(result.weights[3] < 1e-3);
    assert!(gnc.state().equals(&result.values, 0.0));
    Ok(())
}

#[test]
fn test_gnc_gm_rejects_outlier() -> TestResult {
    let graph = outlier_graph(false)?;
    let config = GncConfig::new(GaussNewtonConfig::new()).with_loss_type(GncLossType::GemanMcClure);
    let mut gnc = GncOptimizer::new(&graph, &point(1.0, 0.0), config)?;
    let result = gnc.optimize()?;

    let x = result.values.try_get("x")?;
    assert_abs_diff_eq!(x[0], 0.0, epsilon = 1e-3);
    assert_eq!(result.status, GncStatus::Converged);
    assert_eq!(result.mu, 1.0);
    assert!(result.weights[3] < 1e-2);
    for slot in 0..3 {
        assert!(result.weights[slot] > 0.99);
    }
    Ok(())
}

#[test]
fn test_gnc_on_robust_input_graph() -> TestResult {
    let graph = outlier_graph(true)?;
    let mut gnc = GncOptimizer::new(&graph, &point(1.0, 0.0), GncConfig::new(GaussNewtonConfig::new()))?;
    let result = gnc.optimize()?;

    assert!(!gnc.factors().has_robust_factors());
    assert_abs_diff_eq!(result.values.try_get("x")?[0], 0.0, epsilon = 5e-3);
    assert_eq!(result.inlier_slots(), vec![0, 1, 2]);
    Ok(())
}

#[test]
fn test_gnc_with_known_inliers() -> TestResult {
    let graph = outlier_graph(false)?;
    let config = GncConfig::new(GaussNewtonConfig::new()).with_known_inliers(&[0, 1, 2]);
    let mut gnc = GncOptimizer::new(&graph, &point(1.0, 0.0), config)?;
    let result = gnc.optimize()?;

    // The unweighted solve already separates the outlier.
    assert_eq!(result.status, GncStatus::Converged);
    assert_eq!(result.iterations, 1);
    for slot in 0..3 {
        assert_eq!(result.weights[slot], 1.0);
    }
    assert!(result.weights[3] < 1e-3);

    let weighted = gnc.make_weighted_graph(&result.weights)?;
    let refined = GaussNewtonConfig::new()
        .build()
        .optimize(&weighted, &result.values)?;
    assert_abs_diff_eq!(refined.parameters.try_get("x")?[0], 0.0, epsilon = 1e-3);
    Ok(())
}

#[test]
fn test_gnc_with_levenberg_marquardt_base() -> TestResult {
    let graph = outlier_graph(false)?;
    let mut gnc = GncOptimizer::new(
        &graph,
        &point(1.0, 0.0),
        GncConfig::new(LevenbergMarquardtConfig::new()),
    )?;
    let result = gnc.optimize()?;
    assert_abs_diff_eq!(result.values.try_get("x")?[0], 0.0, epsilon = 5e-3);
    assert_eq!(result.inlier_slots(), vec![0, 1, 2]);
    Ok(())
}

#[test]
fn test_gnc_on_nonlinear_factor_reaches_zero_error() -> TestResult {
    let mut graph = FactorGraph::new();
    graph.add(
        vec!["x".to_string()],
        Arc::new(TrigFactor),
        NoiseModel::isotropic(2, 0.1)?,
    )?;

    let mut gnc = GncOptimizer::new(
        &graph,
        &point(3.0, 3.0),
        GncConfig::new(LevenbergMarquardtConfig::new()),
    )?;
    let result = gnc.optimize()?;
    assert_abs_diff_eq!(graph.error(&result.values)?, 0.0, epsilon = 1e-7);
    assert_eq!(result.weights[0], 1.0);
    Ok(())
}

#[test]
fn test_observer_sees_every_iteration() -> TestResult {
    let graph = outlier_graph(false)?;
    let history = HistoryObserver::new();
    let mut gnc = GncOptimizer::new(&graph, &point(1.0, 0.0), GncConfig::new(GaussNewtonConfig::new()))?;
    gnc.add_observer(history.clone());
    let result = gnc.optimize()?;

    let records = history.records()?;
    assert_eq!(records.len(), result.iterations);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.iteration, i);
        assert_eq!(record.weights.len(), 4);
        assert!(record.cost.is_finite());
    }
    // TLS mu grows by mu_step every iteration.
    for pair in records.windows(2) {
        assert_abs_diff_eq!(pair[1].mu, pair[0].mu * 1.4, epsilon = 1e-12);
    }
    assert_eq!(history.finish()?, Some((result.status.clone(), result.iterations)));
    Ok(())
}

#[test]
fn test_iteration_limit_is_reported() -> TestResult {
    let graph = outlier_graph(false)?;
    let config = GncConfig::new(GaussNewtonConfig::new())
        .with_loss_type(GncLossType::GemanMcClure)
        .with_max_iterations(2);
    let mut gnc = GncOptimizer::new(&graph, &point(1.0, 0.0), config)?;
    let result = gnc.optimize()?;

    assert_eq!(result.status, GncStatus::MaxIterationsReached);
    assert_eq!(result.iterations, 2);
    Ok(())
}

#[test]
fn test_optimize_is_repeatable() -> TestResult {
    let graph = outlier_graph(false)?;
    let config = GncConfig::new(GaussNewtonConfig::new());
    let first = GncOptimizer::new(&graph, &point(1.0, 0.0), config.clone())?.optimize()?;
    let second = GncOptimizer::new(&graph, &point(1.0, 0.0), config)?.optimize()?;

    assert!(first.values.equals(&second.values, 0.0));
    assert_eq!(first.weights, second.weights);
    assert_eq!(first.iterations, second.iterations);
    Ok(())
}

#[test]
fn test_range_localization_with_outliers_gm() -> TestResult {
    let truth = dvector![2.0, -1.0];
    let (inliers, outliers) = (10, 4);
    let count = inliers + outliers;

    let mut graph = FactorGraph::new();
    let mut initial = Values::new();
    let mut beacon_slots = Vec::new();
    for i in 0..count {
        let angle = 2.0 * std::f64::consts::PI * i as f64 / count as f64;
        let beacon = dvector![10.0 * angle.cos(), 10.0 * angle.sin()];
        let key = format!("b{i}");
        beacon_slots.push(graph.add(
            vec![key.clone()],
            Arc::new(PriorFactor::new(beacon.clone())),
            NoiseModel::isotropic(2, 1e-3)?,
        )?);
        initial.insert(key.clone(), beacon.clone());

        let range = (&truth - &beacon).norm() + if i < inliers { 0.0 } else { 6.0 };
        graph.add(
            vec!["p".to_string(), key],
            Arc::new(RangeFactor::new(range, 2)?),
            NoiseModel::isotropic(1, 0.05)?,
        )?;
    }
    initial.insert("p", dvector![0.0, 0.0]);

    let config = GncConfig::new(GaussNewtonConfig::new())
        .with_loss_type(GncLossType::GemanMcClure)
        .with_inlier_cost_threshold(4.5)
        .with_known_inliers(&beacon_slots);
    let result = GncOptimizer::new(&graph, &initial, config)?.optimize()?;

    let estimate = result.values.try_get("p")?;
    assert!((estimate - &truth).norm() < 1e-2);
    for i in 0..count {
        let range_slot = 2 * i + 1;
        if i < inliers {
            assert!(result.weights[range_slot] > 0.5, "inlier {i} rejected");
        } else {
            assert!(result.weights[range_slot] < 0.5, "outlier {i} kept");
        }
    }
    Ok(())
}

#[test]
fn test_unknown_variable_is_reported() -> TestResult {
    let graph = outlier_graph(false)?;
    let mut initial = Values::new();
    initial.insert("y", dvector![0.0, 0.0]);

    let gnc = GncOptimizer::new(&graph, &initial, GncConfig::new(GaussNewtonConfig::new()))?;
    assert!(matches!(gnc.initialize_mu(), Err(GncSolverError::Core(_))));
    Ok(())
}

#[test]
fn test_empty_graph_is_an_error() -> TestResult {
    let mut gnc = GncOptimizer::new(
        &FactorGraph::new(),
        &Values::new(),
        GncConfig::new(LevenbergMarquardtConfig::new()),
    )?;
    assert!(matches!(
        gnc.optimize(),
        Err(GncSolverError::Optimizer(OptimizerError::NoResidualBlocks))
    ));
    Ok(())
}
