//! Prior factor for unary constraints on variables.

use super::Factor;
use nalgebra::{DMatrix, DVector};

/// Unary constraint pulling a variable towards a measured value.
///
/// ```text
/// r = x − x_prior,   J = I
/// ```
///
/// # Example
///
/// ```
/// use gnc_solver::factors::{Factor, PriorFactor};
/// use nalgebra::dvector;
///
/// let prior = PriorFactor::new(dvector![1.0, 0.0]);
/// let (residual, jacobian) = prior.linearize(&[dvector![0.0, 0.0]], true);
///
/// assert_eq!(residual, dvector![-1.0, 0.0]);
/// assert!(jacobian.is_some());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PriorFactor {
    pub data: DVector<f64>,
}

impl PriorFactor {
    pub fn new(data: DVector<f64>) -> Self {
        Self { data }
    }
}

impl Factor for PriorFactor {
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let residual = &params[0] - &self.data;
        let jacobian = compute_jacobian
            .then(|| DMatrix::<f64>::identity(residual.nrows(), residual.nrows()));
        (residual, jacobian)
    }

    fn get_dimension(&self) -> usize {
        self.data.len()
    }

    fn num_variables(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn test_prior_residual_and_jacobian() {
        let prior = PriorFactor::new(dvector![1.0, 2.0]);
        let (residual, jacobian) = prior.linearize(&[dvector![1.5, 2.3]], true);

        assert!((residual[0] - 0.5).abs() < 1e-12);
        assert!((residual[1] - 0.3).abs() < 1e-12);
        assert_eq!(jacobian, Some(DMatrix::identity(2, 2)));
        assert_eq!(prior.get_dimension(), 2);
    }

    #[test]
    fn test_prior_skips_jacobian_on_request() {
        let prior = PriorFactor::new(dvector![0.0]);
        let (_, jacobian) = prior.linearize(&[dvector![4.0]], false);
        assert!(jacobian.is_none());
    }
}
