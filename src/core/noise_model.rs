//! Measurement noise models.
//!
//! A noise model whitens a raw residual `r` into `W r`, where `Wᵀ W` is the information
//! matrix. The factor error is then `0.5 · ||W r||²`, or `0.5 · ρ(||W r||²)` when the model
//! is wrapped with a robust loss.
//!
//! # Example
//!
//! ```
//! use gnc_solver::core::noise_model::NoiseModel;
//! use nalgebra::dvector;
//! # use gnc_solver::core::CoreResult;
//! # fn example() -> CoreResult<()> {
//! let noise = NoiseModel::isotropic(2, 0.1)?;
//! let residual = dvector![1.0, 0.0];
//! assert!((noise.error(&residual) - 50.0).abs() < 1e-9);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::core::{CoreError, CoreResult, corrector::Corrector, loss_functions::LossFunction};

#[derive(Debug, Clone)]
pub enum NoiseModel {
    /// Full square-root information matrix `R` with `Rᵀ R = Σ⁻¹`.
    Gaussian { sqrt_information: DMatrix<f64> },
    /// Independent per-component standard deviations.
    Diagonal { sigmas: DVector<f64> },
    /// Same standard deviation for every component.
    Isotropic { dim: usize, sigma: f64 },
    /// Identity covariance.
    Unit { dim: usize },
    /// Robust loss applied on top of a base model.
    Robust {
        loss: Arc<dyn LossFunction>,
        base: Box<NoiseModel>,
    },
}

impl NoiseModel {
    pub fn isotropic(dim: usize, sigma: f64) -> CoreResult<Self> {
        if dim == 0 {
            return Err(
                CoreError::InvalidNoiseModel("dimension must be at least 1".to_string()).log(),
            );
        }
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(CoreError::InvalidNoiseModel(format!(
                "sigma must be positive and finite, got {sigma}"
            ))
            .log());
        }
        Ok(Self::Isotropic { dim, sigma })
    }

    pub fn diagonal(sigmas: DVector<f64>) -> CoreResult<Self> {
        if sigmas.is_empty() {
            return Err(
                CoreError::InvalidNoiseModel("diagonal model needs at least one sigma".to_string())
                    .log(),
            );
        }
        if let Some(bad) = sigmas.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(CoreError::InvalidNoiseModel(format!(
                "sigmas must be positive and finite, got {bad}"
            ))
            .log());
        }
        Ok(Self::Diagonal { sigmas })
    }

    pub fn unit(dim: usize) -> CoreResult<Self> {
        if dim == 0 {
            return Err(
                CoreError::InvalidNoiseModel("dimension must be at least 1".to_string()).log(),
            );
        }
        Ok(Self::Unit { dim })
    }

    pub fn from_sqrt_information(sqrt_information: DMatrix<f64>) -> CoreResult<Self> {
        if !sqrt_information.is_square() || sqrt_information.nrows() == 0 {
            return Err(CoreError::InvalidNoiseModel(format!(
                "square-root information must be square, got {}x{}",
                sqrt_information.nrows(),
                sqrt_information.ncols()
            ))
            .log());
        }
        Ok(Self::Gaussian { sqrt_information })
    }

    /// Gaussian model from a covariance matrix `Σ = L Lᵀ`; the square-root information is `L⁻¹`.
    pub fn from_covariance(covariance: DMatrix<f64>) -> CoreResult<Self> {
        if !covariance.is_square() {
            return Err(CoreError::InvalidNoiseModel(format!(
                "covariance must be square, got {}x{}",
                covariance.nrows(),
                covariance.ncols()
            ))
            .log());
        }
        let cholesky = covariance.cholesky().ok_or_else(|| {
            CoreError::InvalidNoiseModel("covariance is not positive definite".to_string()).log()
        })?;
        let sqrt_information = cholesky.l().try_inverse().ok_or_else(|| {
            CoreError::InvalidNoiseModel("covariance factor is singular".to_string()).log()
        })?;
        Self::from_sqrt_information(sqrt_information)
    }

    /// Wrap `base` with a robust loss. Nested robust models are rejected.
    pub fn robust(loss: Arc<dyn LossFunction>, base: NoiseModel) -> CoreResult<Self> {
        if base.is_robust() {
            return Err(CoreError::InvalidNoiseModel(
                "robust noise models cannot be nested".to_string(),
            )
            .log());
        }
        Ok(Self::Robust {
            loss,
            base: Box::new(base),
        })
    }

    pub fn dim(&self) -> usize {
        match self {
            Self::Gaussian { sqrt_information } => sqrt_information.nrows(),
            Self::Diagonal { sigmas } => sigmas.len(),
            Self::Isotropic { dim, .. } | Self::Unit { dim } => *dim,
            Self::Robust { base, .. } => base.dim(),
        }
    }

    pub fn is_robust(&self) -> bool {
        matches!(self, Self::Robust { .. })
    }

    pub fn loss(&self) -> Option<&Arc<dyn LossFunction>> {
        match self {
            Self::Robust { loss, .. } => Some(loss),
            _ => None,
        }
    }

    /// The model with any robust wrapper removed.
    pub fn without_robust_loss(&self) -> &NoiseModel {
        match self {
            Self::Robust { base, .. } => base.as_ref(),
            other => other,
        }
    }

    /// Per-component standard deviations, `None` when the information is singular.
    pub fn sigmas(&self) -> Option<DVector<f64>> {
        match self {
            Self::Gaussian { sqrt_information } => {
                let information = sqrt_information.transpose() * sqrt_information;
                let covariance = information.try_inverse()?;
                Some(covariance.diagonal().map(f64::sqrt))
            }
            Self::Diagonal { sigmas } => Some(sigmas.clone()),
            Self::Isotropic { dim, sigma } => Some(DVector::from_element(*dim, *sigma)),
            Self::Unit { dim } => Some(DVector::from_element(*dim, 1.0)),
            Self::Robust { base, .. } => base.sigmas(),
        }
    }

    /// `W r`, ignoring any robust loss.
    pub fn whiten(&self, residual: &DVector<f64>) -> DVector<f64> {
        match self {
            Self::Gaussian { sqrt_information } => sqrt_information * residual,
            Self::Diagonal { sigmas } => residual.component_div(sigmas),
            Self::Isotropic { sigma, .. } => residual / *sigma,
            Self::Unit { .. } => residual.clone(),
            Self::Robust { base, .. } => base.whiten(residual),
        }
    }

    /// `W J`, ignoring any robust loss.
    pub fn whiten_jacobian(&self, jacobian: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            Self::Gaussian { sqrt_information } => sqrt_information * jacobian,
            Self::Diagonal { sigmas } => {
                let mut whitened = jacobian.clone();
                for (i, sigma) in sigmas.iter().enumerate() {
                    whitened.row_mut(i).scale_mut(1.0 / sigma);
                }
                whitened
            }
            Self::Isotropic { sigma, .. } => jacobian / *sigma,
            Self::Unit { .. } => jacobian.clone(),
            Self::Robust { base, .. } => base.whiten_jacobian(jacobian),
        }
    }

    /// Whitened residual and Jacobian, with the robust correction applied when present.
    pub fn whiten_system(
        &self,
        residual: &DVector<f64>,
        jacobian: Option<&DMatrix<f64>>,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let mut whitened = self.whiten(residual);
        let mut whitened_jacobian = jacobian.map(|j| self.whiten_jacobian(j));

        if let Self::Robust { loss, .. } = self {
            let corrector = Corrector::new(loss.as_ref(), whitened.norm_squared());
            if let Some(jac) = whitened_jacobian.as_mut() {
                corrector.correct_jacobian(&whitened, jac);
            }
            corrector.correct_residuals(&mut whitened);
        }

        (whitened, whitened_jacobian)
    }

    /// Factor error for a raw residual: `0.5 ||W r||²`, or `0.5 ρ(||W r||²)` when robust.
    pub fn error(&self, residual: &DVector<f64>) -> f64 {
        let squared_norm = self.whiten(residual).norm_squared();
        match self {
            Self::Robust { loss, .. } => 0.5 * loss.evaluate(squared_norm)[0],
            _ => 0.5 * squared_norm,
        }
    }

    /// Copy of this model whose information is multiplied by `weight`.
    ///
    /// Returns `None` for robust models, which have no single scale to adjust.
    pub fn scaled_by_weight(&self, weight: f64) -> Option<NoiseModel> {
        let sqrt_weight = weight.sqrt();
        match self {
            Self::Gaussian { sqrt_information } => Some(Self::Gaussian {
                sqrt_information: sqrt_information * sqrt_weight,
            }),
            Self::Diagonal { sigmas } => Some(Self::Diagonal {
                sigmas: sigmas / sqrt_weight,
            }),
            Self::Isotropic { dim, sigma } => Some(Self::Isotropic {
                dim: *dim,
                sigma: sigma / sqrt_weight,
            }),
            Self::Unit { dim } => Some(Self::Isotropic {
                dim: *dim,
                sigma: 1.0 / sqrt_weight,
            }),
            Self::Robust { .. } => None,
        }
    }

    /// Structural comparison; robust losses compare by identity.
    pub fn equals(&self, other: &NoiseModel, tol: f64) -> bool {
        let close = |a: f64, b: f64| a == b || (a - b).abs() <= tol;
        match (self, other) {
            (
                Self::Gaussian { sqrt_information: a },
                Self::Gaussian { sqrt_information: b },
            ) => a.shape() == b.shape() && a.iter().zip(b.iter()).all(|(x, y)| close(*x, *y)),
            (Self::Diagonal { sigmas: a }, Self::Diagonal { sigmas: b }) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| close(*x, *y))
            }
            (
                Self::Isotropic { dim: da, sigma: sa },
                Self::Isotropic { dim: db, sigma: sb },
            ) => da == db && close(*sa, *sb),
            (Self::Unit { dim: a }, Self::Unit { dim: b }) => a == b,
            (
                Self::Robust { loss: la, base: ba },
                Self::Robust { loss: lb, base: bb },
            ) => Arc::ptr_eq(la, lb) && ba.equals(bb, tol),
            _ => false,
        }
    }
}

impl PartialEq for NoiseModel {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other, 0.0)
    }
}
