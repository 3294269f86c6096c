//! Range factor: scalar distance between two points.

use super::{Factor, FactorError, FactorResult};
use nalgebra::{DMatrix, DVector};

/// Measured Euclidean distance between two points of equal dimension.
///
/// ```text
/// d = x_i − x_j
/// r = ||d|| − range
/// J = [ dᵀ/||d|| | −dᵀ/||d|| ]
/// ```
///
/// The Jacobian is undefined when both points coincide; a zero row is returned there.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeFactor {
    pub range: f64,
    pub point_dim: usize,
}

impl RangeFactor {
    pub fn new(range: f64, point_dim: usize) -> FactorResult<Self> {
        if !(range.is_finite() && range >= 0.0) {
            return Err(FactorError::InvalidParameters(format!(
                "range must be finite and non-negative, got {range}"
            ))
            .log());
        }
        if point_dim == 0 {
            return Err(FactorError::InvalidDimension {
                expected: 1,
                actual: 0,
            }
            .log());
        }
        Ok(Self { range, point_dim })
    }
}

impl Factor for RangeFactor {
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let diff = &params[0] - &params[1];
        let distance = diff.norm();
        let residual = DVector::from_element(1, distance - self.range);

        let jacobian = compute_jacobian.then(|| {
            let dim = self.point_dim;
            let mut jacobian = DMatrix::<f64>::zeros(1, 2 * dim);
            if distance > f64::EPSILON {
                for k in 0..dim {
                    let g = diff[k] / distance;
                    jacobian[(0, k)] = g;
                    jacobian[(0, k + dim)] = -g;
                }
            }
            jacobian
        });

        (residual, jacobian)
    }

    fn get_dimension(&self) -> usize {
        1
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
    fn test_range_residual_and_jacobian() -> TestResult {
        let factor = RangeFactor::new(4.0, 2)?;
        let (residual, jacobian) =
            factor.linearize(&[dvector![3.0, 4.0], dvector![0.0, 0.0]], true);

        assert!((residual[0] - 1.0).abs() < 1e-12);
        let jacobian = jacobian.ok_or("missing jacobian")?;
        assert!((jacobian[(0, 0)] - 0.6).abs() < 1e-12);
        assert!((jacobian[(0, 1)] - 0.8).abs() < 1e-12);
        assert!((jacobian[(0, 2)] + 0.6).abs() < 1e-12);
        assert!((jacobian[(0, 3)] + 0.8).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_range_jacobian_matches_finite_difference() -> TestResult {
        let factor = RangeFactor::new(1.0, 2)?;
        let xi = dvector![0.3, -1.2];
        let xj = dvector![2.0, 0.5];
        let (r0, jacobian) = factor.linearize(&[xi.clone(), xj.clone()], true);
        let jacobian = jacobian.ok_or("missing jacobian")?;

        let h = 1e-7;
        let mut xi_h = xi.clone();
        xi_h[1] += h;
        let (r1, _) = factor.linearize(&[xi_h, xj], false);
        assert!(((r1[0] - r0[0]) / h - jacobian[(0, 1)]).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_range_coincident_points() -> TestResult {
        let factor = RangeFactor::new(1.0, 2)?;
        let (residual, jacobian) =
            factor.linearize(&[dvector![1.0, 1.0], dvector![1.0, 1.0]], true);
        assert_eq!(residual[0], -1.0);
        assert_eq!(jacobian.ok_or("missing jacobian")?, DMatrix::zeros(1, 4));
        Ok(())
    }

    #[test]
    fn test_range_invalid_parameters() {
        assert!(RangeFactor::new(-1.0, 2).is_err());
        assert!(RangeFactor::new(1.0, 0).is_err());
    }
}
