//! Graph transforms used by the GNC loop. Both return new graphs that share the residual
//! functions of their input.

use nalgebra::DVector;

use crate::core::{CoreError, CoreResult, factor_graph::FactorGraph};
use crate::error::GncSolverResult;
use crate::optimizer::gnc::GncError;

/// Copy of `graph` whose slot `i` has its information scaled by `weights[i]`.
///
/// Weight 0 keeps the slot with zero influence. Robust noise models cannot be scaled and
/// are rejected, as are negative or non-finite weights.
pub fn make_weighted_graph(
    graph: &FactorGraph,
    weights: &DVector<f64>,
) -> GncSolverResult<FactorGraph> {
    if weights.len() != graph.size() {
        return Err(GncError::WeightCountMismatch {
            expected: graph.size(),
            actual: weights.len(),
        }
        .log()
        .into());
    }

    let weighted = graph.with_noise_models(|slot, factor| {
        let weight = weights[slot];
        if !(weight.is_finite() && weight >= 0.0) {
            return Err(CoreError::InvalidInput(format!(
                "weight of slot {slot} must be finite and non-negative, got {weight}"
            ))
            .log());
        }
        factor.noise.scaled_by_weight(weight).ok_or_else(|| {
            CoreError::UnscalableNoiseModel {
                slot,
                reason: "robust noise models cannot be reweighted".to_string(),
            }
            .log()
        })
    })?;

    Ok(weighted)
}

/// Copy of `graph` with every robust noise model replaced by its base model.
pub fn strip_robust_losses(graph: &FactorGraph) -> CoreResult<FactorGraph> {
    graph.with_noise_models(|_, factor| Ok(factor.noise.without_robust_loss().clone()))
}
