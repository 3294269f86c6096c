//! Control-parameter schedule of the continuation.
//!
//! TLS starts from a small `mu` (nearly convex surrogate) and grows it by `mu_step`;
//! GM starts from a large `mu` and shrinks it towards 1, where the surrogate equals the
//! Geman-McClure cost.

use nalgebra::DVector;

use crate::optimizer::gnc::GncLossType;

/// `mu0` from the largest per-factor error `rmax²` at the initial estimate.
///
/// ```text
/// TLS: barcSq / (2·rmax² − barcSq)
/// GM:  2·rmax² / barcSq
/// ```
///
/// The TLS value is `<= 0` when every factor already lies inside the inlier region, and
/// is not finite when `2·rmax² = barcSq`.
pub fn initial_mu(loss_type: GncLossType, max_error: f64, inlier_cost_threshold: f64) -> f64 {
    match loss_type {
        GncLossType::TruncatedLeastSquares => {
            inlier_cost_threshold / (2.0 * max_error - inlier_cost_threshold)
        }
        GncLossType::GemanMcClure => 2.0 * max_error / inlier_cost_threshold,
    }
}

pub fn next_mu(loss_type: GncLossType, mu: f64, mu_step: f64) -> f64 {
    match loss_type {
        GncLossType::TruncatedLeastSquares => mu * mu_step,
        GncLossType::GemanMcClure => (mu / mu_step).max(1.0),
    }
}

pub fn mu_converged(
    loss_type: GncLossType,
    mu: f64,
    prev_mu: f64,
    relative_cost_tolerance: f64,
) -> bool {
    match loss_type {
        GncLossType::GemanMcClure => mu == 1.0,
        GncLossType::TruncatedLeastSquares => (mu - prev_mu).abs() <= relative_cost_tolerance,
    }
}

/// Every free weight is within `tol` of 0 or 1, and at least one weight is within `tol`
/// of 1. `pinned(slot)` marks known inliers, which are skipped in the first test.
pub fn weights_saturated<F>(weights: &DVector<f64>, tol: f64, pinned: F) -> bool
where
    F: Fn(usize) -> bool,
{
    let decided = weights
        .iter()
        .enumerate()
        .filter(|(slot, _)| !pinned(*slot))
        .all(|(_, w)| *w <= tol || *w >= 1.0 - tol);
    let any_inlier = weights.iter().any(|w| *w >= 1.0 - tol);
    decided && any_inlier
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn test_initial_mu() {
        // rmax² = 50, barcSq = 1
        let tls = initial_mu(GncLossType::TruncatedLeastSquares, 50.0, 1.0);
        assert!((tls - 1.0 / 99.0).abs() < 1e-15);
        let gm = initial_mu(GncLossType::GemanMcClure, 50.0, 1.0);
        assert!((gm - 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_initial_mu_inside_inlier_region() {
        assert!(initial_mu(GncLossType::TruncatedLeastSquares, 0.2, 1.0) <= 0.0);
        assert!(!initial_mu(GncLossType::TruncatedLeastSquares, 0.5, 1.0).is_finite());
    }

    #[test]
    fn test_next_mu() {
        assert!((next_mu(GncLossType::TruncatedLeastSquares, 1.0, 1.4) - 1.4).abs() < 1e-15);
        assert!((next_mu(GncLossType::GemanMcClure, 2.8, 1.4) - 2.0).abs() < 1e-15);
        assert_eq!(next_mu(GncLossType::GemanMcClure, 1.2, 1.4), 1.0);
        assert_eq!(next_mu(GncLossType::GemanMcClure, 1.0, 1.4), 1.0);
    }

    #[test]
    fn test_gm_mu_sequence_is_non_increasing_and_reaches_one() {
        let mut mu = 100.0;
        let mut steps = 0;
        while mu > 1.0 {
            let next = next_mu(GncLossType::GemanMcClure, mu, 1.4);
            assert!(next <= mu);
            mu = next;
            steps += 1;
        }
        assert_eq!(mu, 1.0);
        assert!(steps < 20);
    }

    #[test]
    fn test_mu_converged() {
        assert!(mu_converged(GncLossType::GemanMcClure, 1.0, 1.2, 1e-5));
        assert!(!mu_converged(GncLossType::GemanMcClure, 1.1, 1.2, 1e-5));
        assert!(mu_converged(GncLossType::TruncatedLeastSquares, 1.000001, 1.0, 1e-5));
        assert!(!mu_converged(GncLossType::TruncatedLeastSquares, 1.4, 1.0, 1e-5));
    }

    #[test]
    fn test_weights_saturated() {
        let none = |_| false;
        assert!(weights_saturated(&dvector![1.0, 0.0, 1.0], 1e-4, none));
        assert!(weights_saturated(&dvector![0.99995, 0.00005], 1e-4, none));
        assert!(!weights_saturated(&dvector![1.0, 0.5], 1e-4, none));
    }

    #[test]
    fn test_all_outlier_partition_is_not_saturated() {
        assert!(!weights_saturated(&dvector![0.0, 0.0, 0.0], 1e-4, |_| false));
    }

    #[test]
    fn test_known_inliers_skipped_in_decision() {
        // Slot 1 holds an undecided value but is pinned.
        assert!(weights_saturated(&dvector![0.0, 0.5, 1.0], 1e-4, |slot| slot == 1));
        // A pinned slot still counts as an inlier.
        assert!(weights_saturated(&dvector![1.0, 0.0], 1e-4, |slot| slot == 0));
    }
}
