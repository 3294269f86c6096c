//! Factor graph container and sparse linearization.
//!
//! A [`FactorGraph`] is an ordered list of [`GraphFactor`]s. The position of a factor in the
//! list is its *slot*; weights, known inliers and per-factor errors are all indexed by slot.
//! Residual functions are shared through `Arc`, so transformed copies of a graph (reweighted,
//! unwrapped) are cheap and keep pointing at the same factors.
//!
//! Linearization stacks the whitened residuals of all factors in slot order and assembles a
//! sparse Jacobian whose columns follow a [`VariableLayout`]: every variable referenced by a
//! factor, in key order, each occupying as many columns as its dimension.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use gnc_solver::core::{factor_graph::FactorGraph, noise_model::NoiseModel, values::Values};
//! use gnc_solver::factors::PriorFactor;
//! use nalgebra::dvector;
//! # use gnc_solver::core::CoreResult;
//! # fn example() -> CoreResult<()> {
//! let mut graph = FactorGraph::new();
//! graph.add(
//!     vec!["x".to_string()],
//!     Arc::new(PriorFactor::new(dvector![0.0, 0.0])),
//!     NoiseModel::isotropic(2, 0.1)?,
//! )?;
//!
//! let mut values = Values::new();
//! values.insert("x", dvector![1.0, 0.0]);
//! assert!((graph.error(&values)? - 50.0).abs() < 1e-9);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use faer::{
    Mat,
    sparse::{Argsort, Pair, SparseColMat, SymbolicSparseColMat},
};
use nalgebra::{DMatrix, DVector};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::{CoreError, CoreResult, noise_model::NoiseModel, values::Values};
use crate::factors::Factor;

/// Sparsity pattern of the Jacobian plus the ordering used to fill it.
pub struct SymbolicStructure {
    pub pattern: SymbolicSparseColMat<usize>,
    pub order: Argsort<usize>,
}

/// Column assignment for the variables touched by a graph.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableLayout {
    order: Vec<String>,
    column_start: HashMap<String, usize>,
    total_dof: usize,
}

impl VariableLayout {
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn column_start(&self, key: &str) -> Option<usize> {
        self.column_start.get(key).copied()
    }

    pub fn total_dof(&self) -> usize {
        self.total_dof
    }
}

/// One slot of a factor graph.
#[derive(Clone)]
pub struct GraphFactor {
    pub keys: Vec<String>,
    pub factor: Arc<dyn Factor>,
    pub noise: NoiseModel,
}

impl GraphFactor {
    fn params(&self, values: &Values) -> CoreResult<Vec<DVector<f64>>> {
        self.keys
            .iter()
            .map(|key| values.try_get(key).cloned())
            .collect()
    }

    /// Raw residual, before whitening.
    pub fn unwhitened_residual(&self, values: &Values) -> CoreResult<DVector<f64>> {
        let (residual, _) = self.factor.linearize(&self.params(values)?, false);
        self.check_residual_dim(&residual)?;
        Ok(residual)
    }

    /// `0.5 ||W r||²`, or `0.5 ρ(||W r||²)` for robust noise models.
    pub fn error(&self, values: &Values) -> CoreResult<f64> {
        Ok(self.noise.error(&self.unwhitened_residual(values)?))
    }

    /// Whitened (and robust-corrected) residual and Jacobian.
    pub fn linearize(
        &self,
        values: &Values,
        compute_jacobian: bool,
    ) -> CoreResult<(DVector<f64>, Option<DMatrix<f64>>)> {
        let params = self.params(values)?;
        let (residual, jacobian) = self.factor.linearize(&params, compute_jacobian);
        self.check_residual_dim(&residual)?;

        let jacobian = match (compute_jacobian, jacobian) {
            (false, _) => None,
            (true, Some(jac)) => {
                let expected_cols: usize = params.iter().map(|p| p.len()).sum();
                if jac.shape() != (residual.len(), expected_cols) {
                    return Err(CoreError::DimensionMismatch(format!(
                        "Jacobian of factor on {:?} is {}x{}, expected {}x{}",
                        self.keys,
                        jac.nrows(),
                        jac.ncols(),
                        residual.len(),
                        expected_cols
                    ))
                    .log());
                }
                Some(jac)
            }
            (true, None) => {
                return Err(CoreError::FactorLinearization(format!(
                    "Factor on {:?} returned no Jacobian when one was requested",
                    self.keys
                ))
                .log());
            }
        };

        Ok(self.noise.whiten_system(&residual, jacobian.as_ref()))
    }

    fn check_residual_dim(&self, residual: &DVector<f64>) -> CoreResult<()> {
        if residual.len() != self.noise.dim() {
            return Err(CoreError::DimensionMismatch(format!(
                "Factor on {:?} produced a residual of size {}, noise model expects {}",
                self.keys,
                residual.len(),
                self.noise.dim()
            ))
            .log());
        }
        Ok(())
    }
}

impl fmt::Debug for GraphFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphFactor")
            .field("keys", &self.keys)
            .field("dim", &self.factor.get_dimension())
            .field("noise", &self.noise)
            .finish()
    }
}

/// Ordered collection of factors.
#[derive(Debug, Clone, Default)]
pub struct FactorGraph {
    factors: Vec<GraphFactor>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a factor and return its slot.
    pub fn add(
        &mut self,
        keys: Vec<String>,
        factor: Arc<dyn Factor>,
        noise: NoiseModel,
    ) -> CoreResult<usize> {
        if keys.is_empty() {
            return Err(
                CoreError::InvalidInput("a factor needs at least one variable key".to_string())
                    .log(),
            );
        }
        if keys.len() != factor.num_variables() {
            return Err(CoreError::InvalidInput(format!(
                "factor on {:?} connects {} variables, got {} keys",
                keys,
                factor.num_variables(),
                keys.len()
            ))
            .log());
        }
        if factor.get_dimension() != noise.dim() {
            return Err(CoreError::DimensionMismatch(format!(
                "factor on {:?} has dimension {}, noise model has dimension {}",
                keys,
                factor.get_dimension(),
                noise.dim()
            ))
            .log());
        }
        self.factors.push(GraphFactor {
            keys,
            factor,
            noise,
        });
        Ok(self.factors.len() - 1)
    }

    pub fn size(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&GraphFactor> {
        self.factors.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GraphFactor> {
        self.factors.iter()
    }

    /// Error of a single slot at `values`.
    pub fn factor_error(&self, slot: usize, values: &Values) -> CoreResult<f64> {
        self.factors
            .get(slot)
            .ok_or_else(|| {
                CoreError::SlotOutOfRange {
                    slot,
                    size: self.size(),
                }
                .log()
            })?
            .error(values)
    }

    /// Error of every slot, in slot order.
    pub fn factor_errors(&self, values: &Values) -> CoreResult<Vec<f64>> {
        #[cfg(feature = "parallel")]
        let errors = self.factors.par_iter().map(|f| f.error(values)).collect();

        #[cfg(not(feature = "parallel"))]
        let errors = self.factors.iter().map(|f| f.error(values)).collect();

        errors
    }

    /// Total error: sum of the factor errors.
    pub fn error(&self, values: &Values) -> CoreResult<f64> {
        Ok(self.factor_errors(values)?.iter().sum())
    }

    pub fn is_robust(&self, slot: usize) -> bool {
        self.factors.get(slot).is_some_and(|f| f.noise.is_robust())
    }

    pub fn has_robust_factors(&self) -> bool {
        self.factors.iter().any(|f| f.noise.is_robust())
    }

    /// New graph with the same keys and residual functions but per-slot noise models
    /// produced by `noise_for`.
    pub fn with_noise_models<F>(&self, mut noise_for: F) -> CoreResult<FactorGraph>
    where
        F: FnMut(usize, &GraphFactor) -> CoreResult<NoiseModel>,
    {
        let factors = self
            .factors
            .iter()
            .enumerate()
            .map(|(slot, f)| {
                Ok(GraphFactor {
                    keys: f.keys.clone(),
                    factor: Arc::clone(&f.factor),
                    noise: noise_for(slot, f)?,
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(FactorGraph { factors })
    }

    /// Slot-wise comparison: same keys, same residual function instance, noise models equal
    /// within `tol`.
    pub fn equals(&self, other: &FactorGraph, tol: f64) -> bool {
        self.size() == other.size()
            && self.factors.iter().zip(other.factors.iter()).all(|(a, b)| {
                a.keys == b.keys && Arc::ptr_eq(&a.factor, &b.factor) && a.noise.equals(&b.noise, tol)
            })
    }

    pub fn residual_dimension(&self) -> usize {
        self.factors.iter().map(|f| f.noise.dim()).sum()
    }

    /// Columns for every variable referenced by a factor, in key order.
    pub fn variable_layout(&self, values: &Values) -> CoreResult<VariableLayout> {
        let keys: BTreeSet<&String> = self.factors.iter().flat_map(|f| f.keys.iter()).collect();

        let mut order = Vec::with_capacity(keys.len());
        let mut column_start = HashMap::with_capacity(keys.len());
        let mut total_dof = 0;
        for key in keys {
            let dim = values.try_get(key)?.len();
            column_start.insert(key.clone(), total_dof);
            order.push(key.clone());
            total_dof += dim;
        }

        Ok(VariableLayout {
            order,
            column_start,
            total_dof,
        })
    }

    /// Non-zero pattern of the Jacobian: one dense block per (factor, variable) pair.
    pub fn build_symbolic_structure(
        &self,
        values: &Values,
        layout: &VariableLayout,
    ) -> CoreResult<SymbolicStructure> {
        let mut indices = Vec::<Pair<usize, usize>>::new();

        let mut row_start = 0;
        for factor in &self.factors {
            let rows = factor.noise.dim();
            for key in &factor.keys {
                let col_start = layout.column_start(key).ok_or_else(|| {
                    CoreError::Variable(format!("Key '{key}' missing from the column layout")).log()
                })?;
                let var_size = values.try_get(key)?.len();
                for row in 0..rows {
                    for col in 0..var_size {
                        indices.push(Pair::new(row_start + row, col_start + col));
                    }
                }
            }
            row_start += rows;
        }

        let (pattern, order) = SymbolicSparseColMat::try_new_from_indices(
            self.residual_dimension(),
            layout.total_dof(),
            &indices,
        )
        .map_err(|e| {
            CoreError::SymbolicStructure(
                "Failed to build symbolic sparse matrix structure".to_string(),
            )
            .log_with_source(e)
        })?;

        Ok(SymbolicStructure { pattern, order })
    }

    /// Stacked whitened residual, in slot order.
    pub fn compute_residual(&self, values: &Values) -> CoreResult<Mat<f64>> {
        #[cfg(feature = "parallel")]
        let blocks: CoreResult<Vec<DVector<f64>>> = self
            .factors
            .par_iter()
            .map(|f| f.linearize(values, false).map(|(r, _)| r))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let blocks: CoreResult<Vec<DVector<f64>>> = self
            .factors
            .iter()
            .map(|f| f.linearize(values, false).map(|(r, _)| r))
            .collect();

        Ok(stack_residuals(&blocks?, self.residual_dimension()))
    }

    /// Stacked whitened residual and sparse whitened Jacobian.
    ///
    /// Jacobian values are emitted in the same order as the indices pushed by
    /// [`FactorGraph::build_symbolic_structure`].
    pub fn compute_residual_and_jacobian(
        &self,
        values: &Values,
        layout: &VariableLayout,
        symbolic: &SymbolicStructure,
    ) -> CoreResult<(Mat<f64>, SparseColMat<usize, f64>)> {
        #[cfg(feature = "parallel")]
        let blocks: CoreResult<Vec<(DVector<f64>, Vec<f64>)>> = self
            .factors
            .par_iter()
            .map(|f| linearize_block(f, values))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let blocks: CoreResult<Vec<(DVector<f64>, Vec<f64>)>> = self
            .factors
            .iter()
            .map(|f| linearize_block(f, values))
            .collect();

        let blocks = blocks?;

        let mut jacobian_values = Vec::with_capacity(symbolic.pattern.compute_nnz());
        let mut residuals = Vec::with_capacity(blocks.len());
        for (residual, mut block_values) in blocks {
            residuals.push(residual);
            jacobian_values.append(&mut block_values);
        }

        let jacobian = SparseColMat::new_from_argsort(
            symbolic.pattern.clone(),
            &symbolic.order,
            jacobian_values.as_slice(),
        )
        .map_err(|e| {
            CoreError::SymbolicStructure(
                "Failed to create sparse Jacobian from argsort".to_string(),
            )
            .log_with_source(e)
        })?;

        debug_assert_eq!(layout.total_dof(), jacobian.ncols());
        Ok((stack_residuals(&residuals, self.residual_dimension()), jacobian))
    }
}

impl PartialEq for FactorGraph {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other, 0.0)
    }
}

fn stack_residuals(blocks: &[DVector<f64>], total: usize) -> Mat<f64> {
    let mut stacked = Mat::<f64>::zeros(total, 1);
    let mut row = 0;
    for block in blocks {
        for value in block.iter() {
            stacked[(row, 0)] = *value;
            row += 1;
        }
    }
    stacked
}

/// Whitened residual plus Jacobian entries, row-major within each variable block.
fn linearize_block(factor: &GraphFactor, values: &Values) -> CoreResult<(DVector<f64>, Vec<f64>)> {
    let (residual, jacobian) = factor.linearize(values, true)?;
    let jacobian = jacobian.ok_or_else(|| {
        CoreError::FactorLinearization(format!("No Jacobian for factor on {:?}", factor.keys))
            .log()
    })?;

    let mut block_values = Vec::with_capacity(jacobian.len());
    let mut local_col = 0;
    for key in &factor.keys {
        let var_size = values.try_get(key)?.len();
        for row in 0..jacobian.nrows() {
            for col in 0..var_size {
                block_values.push(jacobian[(row, local_col + col)]);
            }
        }
        local_col += var_size;
    }

    Ok((residual, block_values))
}
