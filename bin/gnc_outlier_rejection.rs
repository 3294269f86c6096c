use std::sync::Arc;

use clap::Parser;
use gnc_solver::core::{factor_graph::FactorGraph, noise_model::NoiseModel, values::Values};
use gnc_solver::factors::{PriorFactor, RangeFactor};
use gnc_solver::init_logger_with_level;
use gnc_solver::optimizer::{
    GaussNewtonConfig, GncConfig, GncLossType, GncOptimizer, GncVerbosity,
    LevenbergMarquardtConfig, Solver, SolverConfig,
};
use gnc_solver::{GncSolverError, GncSolverResult};
use nalgebra::{DVector, dvector};
use tracing::{Level, info, warn};

#[derive(Parser)]
#[command(name = "gnc_outlier_rejection")]
#[command(about = "Localize a 2D point from beacon ranges corrupted by outliers, with and without GNC")]
struct Args {
    /// Number of correct range measurements
    #[arg(short, long, default_value = "12")]
    inliers: usize,

    /// Number of corrupted range measurements
    #[arg(short, long, default_value = "6")]
    outliers: usize,

    /// GNC loss: "tls", "gm", or "all"
    #[arg(short, long, default_value = "all")]
    loss: String,

    /// Base optimizer: "gn" (Gauss-Newton) or "lm" (Levenberg-Marquardt)
    #[arg(short, long, default_value = "gn")]
    base: String,

    /// Standard deviation of the range noise
    #[arg(long, default_value = "0.05")]
    noise: f64,

    /// Size of the range corruption applied to outliers
    #[arg(long, default_value = "5.0")]
    outlier_scale: f64,

    /// GNC inlier cost threshold (error units, 4.5 is three sigma)
    #[arg(long, default_value = "4.5")]
    inlier_threshold: f64,

    /// Maximum number of GNC iterations
    #[arg(short, long, default_value = "100")]
    max_iterations: usize,

    /// Log every GNC iteration
    #[arg(short, long)]
    verbose: bool,
}

const BEACON_RADIUS: f64 = 10.0;
const BEACON_SIGMA: f64 = 1e-3;

struct Scenario {
    graph: FactorGraph,
    initial: Values,
    truth: DVector<f64>,
    /// Slots of the beacon priors
    beacon_slots: Vec<usize>,
    /// Slots of the range measurements with their ground-truth label
    range_slots: Vec<(usize, bool)>,
}

/// Beacons on a circle; one range per beacon, the last `outliers` of them corrupted.
fn build_scenario(args: &Args) -> GncSolverResult<Scenario> {
    let truth = dvector![2.0, -1.0];
    let count = args.inliers + args.outliers;

    let mut graph = FactorGraph::new();
    let mut initial = Values::new();
    let mut beacon_slots = Vec::with_capacity(count);
    let mut range_slots = Vec::with_capacity(count);

    for i in 0..count {
        let angle = 2.0 * std::f64::consts::PI * i as f64 / count as f64;
        let beacon = dvector![BEACON_RADIUS * angle.cos(), BEACON_RADIUS * angle.sin()];
        let key = format!("b{}", i);

        beacon_slots.push(graph.add(
            vec![key.clone()],
            Arc::new(PriorFactor::new(beacon.clone())),
            NoiseModel::isotropic(2, BEACON_SIGMA)?,
        )?);
        initial.insert(key.clone(), beacon.clone());

        let is_inlier = i < args.inliers;
        let true_range = (&truth - &beacon).norm();
        let measured = if is_inlier {
            true_range + args.noise * (1.7 * i as f64).sin()
        } else {
            true_range + args.outlier_scale * (1.0 + (0.37 * i as f64).cos())
        };

        let slot = graph.add(
            vec!["p".to_string(), key],
            Arc::new(RangeFactor::new(measured, 2)?),
            NoiseModel::isotropic(1, args.noise)?,
        )?;
        range_slots.push((slot, is_inlier));
    }
    initial.insert("p", dvector![0.0, 0.0]);

    Ok(Scenario {
        graph,
        initial,
        truth,
        beacon_slots,
        range_slots,
    })
}

struct RunSummary {
    method: String,
    estimate: DVector<f64>,
    position_error: f64,
    iterations: usize,
    status: String,
    precision: f64,
    recall: f64,
}

fn estimate_of(values: &Values) -> GncSolverResult<DVector<f64>> {
    Ok(values.try_get("p")?.clone())
}

fn run_plain<P: SolverConfig>(scenario: &Scenario, base: &P, name: &str) -> GncSolverResult<RunSummary> {
    let result = base.build().optimize(&scenario.graph, &scenario.initial)?;
    let estimate = estimate_of(&result.parameters)?;
    Ok(RunSummary {
        method: name.to_string(),
        position_error: (&estimate - &scenario.truth).norm(),
        estimate,
        iterations: result.iterations,
        status: result.status.to_string(),
        precision: f64::NAN,
        recall: f64::NAN,
    })
}

fn run_gnc<P: SolverConfig>(
    scenario: &Scenario,
    base: &P,
    loss_type: GncLossType,
    args: &Args,
) -> GncSolverResult<RunSummary> {
    let verbosity = if args.verbose {
        GncVerbosity::Values
    } else {
        GncVerbosity::Summary
    };
    let config = GncConfig::new(base.clone())
        .with_loss_type(loss_type)
        .with_inlier_cost_threshold(args.inlier_threshold)
        .with_max_iterations(args.max_iterations)
        .with_known_inliers(&scenario.beacon_slots)
        .with_verbosity(verbosity);

    let mut gnc = GncOptimizer::new(&scenario.graph, &scenario.initial, config)?;
    let result = gnc.optimize()?;
    let estimate = estimate_of(&result.values)?;

    let mut true_positive = 0usize;
    let mut predicted = 0usize;
    let mut actual = 0usize;
    for &(slot, is_inlier) in &scenario.range_slots {
        let kept = result.weights[slot] > 0.5;
        predicted += usize::from(kept);
        actual += usize::from(is_inlier);
        true_positive += usize::from(kept && is_inlier);
    }
    let ratio = |num: usize, den: usize| if den == 0 { f64::NAN } else { num as f64 / den as f64 };

    Ok(RunSummary {
        method: format!("GNC-{}", loss_type),
        position_error: (&estimate - &scenario.truth).norm(),
        estimate,
        iterations: result.iterations,
        status: result.status.to_string(),
        precision: ratio(true_positive, predicted),
        recall: ratio(true_positive, actual),
    })
}

fn format_summary_table(results: &[RunSummary]) {
    info!("Final summary table:");
    info!(
        "{:<32} | {:<22} | {:<10} | {:<5} | {:<9} | {:<9} | {:<26}",
        "Method", "Estimate", "Error", "Iters", "Precision", "Recall", "Status"
    );
    info!("{}", "-".repeat(130));
    for r in results {
        info!(
            "{:<32} | ({:>8.4}, {:>8.4})   | {:<10.4e} | {:<5} | {:<9.3} | {:<9.3} | {:<26}",
            r.method,
            r.estimate[0],
            r.estimate[1],
            r.position_error,
            r.iterations,
            r.precision,
            r.recall,
            r.status
        );
    }
    info!("{}", "-".repeat(130));
}

fn run_all<P: SolverConfig>(scenario: &Scenario, base: P, base_name: &str, args: &Args) -> GncSolverResult<Vec<RunSummary>> {
    let losses = match args.loss.to_lowercase().as_str() {
        "tls" => vec![GncLossType::TruncatedLeastSquares],
        "gm" => vec![GncLossType::GemanMcClure],
        "all" => vec![GncLossType::TruncatedLeastSquares, GncLossType::GemanMcClure],
        other => {
            return Err(gnc_solver::core::CoreError::InvalidInput(format!(
                "unknown GNC loss '{}', expected tls, gm or all",
                other
            ))
            .log()
            .into());
        }
    };

    let mut results = vec![run_plain(scenario, &base, base_name)?];
    for loss_type in losses {
        match run_gnc(scenario, &base, loss_type, args) {
            Ok(summary) => results.push(summary),
            Err(e) => warn!("GNC with {} failed: {}", loss_type, e.chain_compact()),
        }
    }
    Ok(results)
}

fn main() -> Result<(), GncSolverError> {
    let args = Args::parse();
    init_logger_with_level(if args.verbose { Level::DEBUG } else { Level::INFO });

    info!(
        "Range localization with {} inliers and {} outliers (noise {:.3}, outlier scale {:.2})",
        args.inliers, args.outliers, args.noise, args.outlier_scale
    );
    let scenario = build_scenario(&args)?;
    info!(
        "Problem Structure: Factors: {}, Variables: {}",
        scenario.graph.size(),
        scenario.initial.len()
    );

    let results = match args.base.to_lowercase().as_str() {
        "gn" | "gauss-newton" => run_all(&scenario, GaussNewtonConfig::new(), "Gauss-Newton", &args)?,
        "lm" | "levenberg-marquardt" => run_all(
            &scenario,
            LevenbergMarquardtConfig::new(),
            "Levenberg-Marquardt",
            &args,
        )?,
        other => {
            return Err(gnc_solver::core::CoreError::InvalidInput(format!(
                "unknown base optimizer '{}', expected gn or lm",
                other
            ))
            .log()
            .into());
        }
    };

    format_summary_table(&results);
    Ok(())
}
