//! Between factor for relative measurements in vector space.

use super::{Factor, FactorError, FactorResult};
use nalgebra::{DMatrix, DVector};

/// Relative measurement `z` between two variables of the same dimension.
///
/// ```text
/// r = (x_j − x_i) − z
/// J = [ −I | I ]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BetweenFactor {
    pub measurement: DVector<f64>,
}

impl BetweenFactor {
    pub fn new(measurement: DVector<f64>) -> FactorResult<Self> {
        if measurement.is_empty() {
            return Err(FactorError::InvalidDimension {
                expected: 1,
                actual: 0,
            }
            .log());
        }
        Ok(Self { measurement })
    }
}

impl Factor for BetweenFactor {
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let residual = (&params[1] - &params[0]) - &self.measurement;

        let jacobian = compute_jacobian.then(|| {
            let dim = self.measurement.len();
            let mut jacobian = DMatrix::<f64>::zeros(dim, 2 * dim);
            for i in 0..dim {
                jacobian[(i, i)] = -1.0;
                jacobian[(i, i + dim)] = 1.0;
            }
            jacobian
        });

        (residual, jacobian)
    }

    fn get_dimension(&self) -> usize {
        self.measurement.len()
    }

    fn num_variables(&self) -> usize {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_between_residual() -> TestResult {
        let factor = BetweenFactor::new(dvector![1.0, 0.0])?;
        let (residual, jacobian) =
            factor.linearize(&[dvector![0.0, 0.0], dvector![1.5, 0.5]], true);

        assert_eq!(residual, dvector![0.5, 0.5]);
        let jacobian = jacobian.ok_or("missing jacobian")?;
        assert_eq!(jacobian.shape(), (2, 4));
        assert_eq!(jacobian[(0, 0)], -1.0);
        assert_eq!(jacobian[(1, 3)], 1.0);
        assert_eq!(jacobian[(0, 1)], 0.0);
        Ok(())
    }

    #[test]
    fn test_between_rejects_empty_measurement() {
        assert!(BetweenFactor::new(DVector::zeros(0)).is_err());
    }
}
