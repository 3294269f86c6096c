//! Robust loss functions used to wrap noise models.
//!
//! A loss `ρ(s)` acts on the squared whitened residual `s = ||W r||²`. Every loss returns
//! `[ρ(s), ρ'(s), ρ''(s)]`; the [`Corrector`](crate::core::corrector::Corrector) turns these
//! into an equivalent reweighted least-squares block.
//!
//! All losses here satisfy `ρ(0) = 0` and `ρ'(0) = 1`, so they agree with plain least
//! squares near the origin.
//!
//! # Example
//!
//! ```
//! use gnc_solver::core::loss_functions::{GemanMcClureLoss, LossFunction};
//! # use gnc_solver::core::CoreResult;
//! # fn example() -> CoreResult<()> {
//! let gm = GemanMcClureLoss::new(1.0)?;
//! let [rho, rho_prime, _] = gm.evaluate(100.0);
//! assert!(rho < 1.0);
//! assert!(rho_prime < 1e-3);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::fmt;

use crate::core::{CoreError, CoreResult};

/// A robust loss `ρ(s)` with its first two derivatives.
pub trait LossFunction: Send + Sync + fmt::Debug {
    /// Evaluate `[ρ(s), ρ'(s), ρ''(s)]` at the squared residual norm `s >= 0`.
    fn evaluate(&self, s: f64) -> [f64; 3];

    /// Short human-readable name used in logs.
    fn name(&self) -> &'static str;
}

fn check_scale(scale: f64) -> CoreResult<f64> {
    if !(scale.is_finite() && scale > 0.0) {
        return Err(CoreError::LossFunction(format!(
            "scale must be positive and finite, got {scale}"
        ))
        .log());
    }
    Ok(scale)
}

/// Huber loss: quadratic below `δ²`, linear in `||r||` above.
///
/// ```text
/// ρ(s) = s                 if s <= δ²
/// ρ(s) = 2δ√s − δ²         otherwise
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HuberLoss {
    scale: f64,
    scale2: f64,
}

impl HuberLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        let scale = check_scale(scale)?;
        Ok(Self {
            scale,
            scale2: scale * scale,
        })
    }
}

impl LossFunction for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            let r = s.sqrt();
            let rho1 = (self.scale / r).max(f64::MIN_POSITIVE);
            [2.0 * self.scale * r - self.scale2, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }

    fn name(&self) -> &'static str {
        "Huber"
    }
}

/// Cauchy (Lorentzian) loss.
///
/// ```text
/// ρ(s) = δ² · ln(1 + s/δ²)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CauchyLoss {
    scale2: f64,
    inv_scale2: f64,
}

impl CauchyLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        let scale = check_scale(scale)?;
        let scale2 = scale * scale;
        Ok(Self {
            scale2,
            inv_scale2: 1.0 / scale2,
        })
    }
}

impl LossFunction for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.inv_scale2;
        let inv = 1.0 / sum;
        [
            self.scale2 * sum.ln(),
            inv.max(f64::MIN_POSITIVE),
            -self.inv_scale2 * inv * inv,
        ]
    }

    fn name(&self) -> &'static str {
        "Cauchy"
    }
}

/// Geman-McClure loss. Bounded by `c²`; weights decay as `1/s²`.
///
/// ```text
/// ρ(s)   = s / (1 + s/c²)
/// ρ'(s)  = 1 / (1 + s/c²)²
/// ρ''(s) = −2 / (c² (1 + s/c²)³)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GemanMcClureLoss {
    inv_scale2: f64,
}

impl GemanMcClureLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        let scale = check_scale(scale)?;
        Ok(Self {
            inv_scale2: 1.0 / (scale * scale),
        })
    }
}

impl LossFunction for GemanMcClureLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let inv = 1.0 / (1.0 + s * self.inv_scale2);
        let inv2 = inv * inv;
        [s * inv, inv2, -2.0 * self.inv_scale2 * inv2 * inv]
    }

    fn name(&self) -> &'static str {
        "GemanMcClure"
    }
}
