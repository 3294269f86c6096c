//! Per-factor GNC weights.
//!
//! Both families map a factor error `e`, the control parameter `mu` and the inlier
//! threshold `barcSq` to a weight in `[0, 1]`. With `c = mu · barcSq`:
//!
//! ```text
//! TLS:  w = 1                       if e <= c
//!       w = (c / (e + c))²          otherwise
//! GM:   w = (c / (e + c))²
//! ```
//!
//! A factor with zero error always gets weight 1, including at `mu = 0`.

use nalgebra::DVector;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::optimizer::gnc::GncLossType;

fn rational_weight(error: f64, scaled_threshold: f64) -> f64 {
    let ratio = scaled_threshold / (error + scaled_threshold);
    ratio * ratio
}

pub fn tls_weight(error: f64, mu: f64, inlier_cost_threshold: f64) -> f64 {
    let scaled_threshold = mu * inlier_cost_threshold;
    if error <= scaled_threshold {
        1.0
    } else {
        rational_weight(error, scaled_threshold)
    }
}

pub fn gm_weight(error: f64, mu: f64, inlier_cost_threshold: f64) -> f64 {
    if error == 0.0 {
        return 1.0;
    }
    rational_weight(error, mu * inlier_cost_threshold)
}

pub fn weight(loss_type: GncLossType, error: f64, mu: f64, inlier_cost_threshold: f64) -> f64 {
    match loss_type {
        GncLossType::TruncatedLeastSquares => tls_weight(error, mu, inlier_cost_threshold),
        GncLossType::GemanMcClure => gm_weight(error, mu, inlier_cost_threshold),
    }
}

/// Weights for a whole error vector, in slot order. `pinned(slot)` forces weight 1.
pub fn weights_for_errors<F>(
    loss_type: GncLossType,
    errors: &[f64],
    mu: f64,
    inlier_cost_threshold: f64,
    pinned: F,
) -> DVector<f64>
where
    F: Fn(usize) -> bool + Sync,
{
    let compute = |(slot, error): (usize, &f64)| {
        if pinned(slot) {
            1.0
        } else {
            weight(loss_type, *error, mu, inlier_cost_threshold)
        }
    };

    #[cfg(feature = "parallel")]
    let weights: Vec<f64> = errors.par_iter().enumerate().map(compute).collect();

    #[cfg(not(feature = "parallel"))]
    let weights: Vec<f64> = errors.iter().enumerate().map(compute).collect();

    DVector::from_vec(weights)
}
