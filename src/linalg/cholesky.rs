use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::{SparseColMat, Triplet},
};
use std::ops::Mul;

use crate::linalg::{LinAlgError, LinAlgResult, SparseLinearSolver};

/// Sparse Cholesky (LLᵀ) solver for the normal equations.
///
/// The symbolic factorization is computed on the first solve and reused afterwards, so one
/// instance must only ever see Jacobians with the same sparsity pattern.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    symbolic_factorization: Option<SymbolicLlt<usize>>,
    hessian: Option<SparseColMat<usize, f64>>,
    gradient: Option<Mat<f64>>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// `H = JᵀJ` and `g = Jᵀr`.
    fn normal_equations(
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<(SparseColMat<usize, f64>, Mat<f64>)> {
        let hessian = jacobians
            .as_ref()
            .transpose()
            .to_col_major()
            .map_err(|e| {
                LinAlgError::MatrixConversion(
                    "Failed to convert transposed Jacobian to column-major format".to_string(),
                )
                .log_with_source(e)
            })?
            .mul(jacobians.as_ref());

        let gradient = jacobians.as_ref().transpose().mul(residuals);
        Ok((hessian, gradient))
    }

    fn factorize_and_solve(
        &mut self,
        matrix: &SparseColMat<usize, f64>,
        gradient: &Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let symbolic = match &self.symbolic_factorization {
            Some(cached) => cached.clone(),
            None => {
                let symbolic =
                    SymbolicLlt::try_new(matrix.symbolic(), Side::Lower).map_err(|e| {
                        LinAlgError::FactorizationFailed(
                            "Symbolic Cholesky decomposition failed".to_string(),
                        )
                        .log_with_source(e)
                    })?;
                self.symbolic_factorization = Some(symbolic.clone());
                symbolic
            }
        };

        let cholesky = Llt::try_new_with_symbolic(symbolic, matrix.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

        Ok(cholesky.solve(-gradient))
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let (hessian, gradient) = Self::normal_equations(residuals, jacobians)?;
        let dx = self.factorize_and_solve(&hessian, &gradient)?;

        self.hessian = Some(hessian);
        self.gradient = Some(gradient);
        Ok(dx)
    }

    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<Mat<f64>> {
        let n = jacobians.ncols();
        let (hessian, gradient) = Self::normal_equations(residuals, jacobians)?;

        let damping: Vec<Triplet<usize, usize, f64>> =
            (0..n).map(|i| Triplet::new(i, i, lambda)).collect();
        let lambda_i = SparseColMat::try_new_from_triplets(n, n, &damping).map_err(|e| {
            LinAlgError::SparseMatrixCreation("Failed to create lambda*I matrix".to_string())
                .log_with_source(e)
        })?;

        let augmented = &hessian + lambda_i;
        let dx = self.factorize_and_solve(&augmented, &gradient)?;

        self.hessian = Some(hessian);
        self.gradient = Some(gradient);
        Ok(dx)
    }

    fn get_hessian(&self) -> Option<&SparseColMat<usize, f64>> {
        self.hessian.as_ref()
    }

    fn get_gradient(&self) -> Option<&Mat<f64>> {
        self.gradient.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-10;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn overdetermined_system()
    -> Result<(SparseColMat<usize, f64>, Mat<f64>), faer::sparse::CreationError> {
        let triplets = vec![
            Triplet::new(0, 0, 2.0),
            Triplet::new(0, 1, 1.0),
            Triplet::new(1, 0, 1.0),
            Triplet::new(1, 1, 3.0),
            Triplet::new(1, 2, 1.0),
            Triplet::new(2, 1, 1.0),
            Triplet::new(2, 2, 2.0),
            Triplet::new(3, 0, 1.5),
            Triplet::new(3, 2, 0.5),
        ];
        let jacobian = SparseColMat::try_new_from_triplets(4, 3, &triplets)?;
        let residuals = Mat::from_fn(4, 1, |i, _| [1.0, -2.0, 0.5, 1.2][i]);
        Ok((jacobian, residuals))
    }

    #[test]
    fn test_identity_system_has_known_solution() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let triplets = vec![Triplet::new(0, 0, 1.0), Triplet::new(1, 1, 1.0)];
        let jacobian = SparseColMat::try_new_from_triplets(2, 2, &triplets)?;
        let residuals = Mat::from_fn(2, 1, |i, _| -((i + 1) as f64));

        let dx = solver.solve_normal_equation(&residuals, &jacobian)?;
        assert!((dx[(0, 0)] - 1.0).abs() < TOLERANCE);
        assert!((dx[(1, 0)] - 2.0).abs() < TOLERANCE);
        assert!(solver.get_hessian().is_some());
        assert!(solver.get_gradient().is_some());
        Ok(())
    }

    #[test]
    fn test_normal_equation_residual_is_orthogonal() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = overdetermined_system()?;
        let dx = solver.solve_normal_equation(&residuals, &jacobian)?;

        // Jᵀ(J dx + r) = 0 at the least-squares solution.
        let updated = jacobian.as_ref().mul(&dx) + &residuals;
        let projected = jacobian.as_ref().transpose().mul(&updated);
        assert!(projected.norm_l2() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_cached_symbolic_factorization_gives_same_result() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = overdetermined_system()?;

        let first = solver.solve_normal_equation(&residuals, &jacobian)?;
        let second = solver.solve_normal_equation(&residuals, &jacobian)?;
        assert!((&first - &second).norm_l2() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_damping_shrinks_step() -> TestResult {
        let (jacobian, residuals) = overdetermined_system()?;

        let small = SparseCholeskySolver::new().solve_augmented_equation(
            &residuals,
            &jacobian,
            1e-3,
        )?;
        let large = SparseCholeskySolver::new().solve_augmented_equation(
            &residuals,
            &jacobian,
            1e3,
        )?;
        assert!(large.norm_l2() < small.norm_l2());
        Ok(())
    }
}
