//! Triggs correction for robust losses.
//!
//! Turns a robust block `ρ(||r||²)` into an equivalent least-squares block by rescaling the
//! whitened residual and applying a rank-one fix to the whitened Jacobian:
//!
//! ```text
//! √ρ₁ = √ρ'(s)
//! α   = 1 − √(1 + 2 s ρ''/ρ')
//! r̃   = √ρ₁ / (1 − α) · r
//! J̃   = √ρ₁ · (J − (α / s) · r rᵀ J)
//! ```
//!
//! Reference: Ceres Solver `internal/ceres/corrector.cc`.

use nalgebra::{DMatrix, DVector};

use crate::core::loss_functions::LossFunction;

/// Per-block scaling factors computed from `[ρ, ρ', ρ'']` at one squared norm.
#[derive(Debug, Clone)]
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    pub fn new(loss_function: &dyn LossFunction, sq_norm: f64) -> Self {
        let [_, rho1, rho2] = loss_function.evaluate(sq_norm);
        let sqrt_rho1 = rho1.sqrt();

        // Convex region or zero residual: plain reweighting.
        if sq_norm == 0.0 || rho2 <= 0.0 {
            return Self {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }

        let d = 1.0 + 2.0 * sq_norm * rho2 / rho1;
        let alpha = 1.0 - d.sqrt();

        Self {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / sq_norm,
        }
    }

    pub fn correct_jacobian(&self, residual: &DVector<f64>, jacobian: &mut DMatrix<f64>) {
        if self.alpha_sq_norm == 0.0 {
            *jacobian *= self.sqrt_rho1;
            return;
        }
        let r_rtj = residual * (residual.transpose() * &*jacobian);
        *jacobian = (&*jacobian - r_rtj * self.alpha_sq_norm) * self.sqrt_rho1;
    }

    pub fn correct_residuals(&self, residual: &mut DVector<f64>) {
        *residual *= self.residual_scaling;
    }
}
