//! Dense symmetric linear algebra shared by the factor, decomposition and
//! association components.
//!
//! Every covariance matrix that is factorized receives the same documented
//! diagonal jitter, `KernelConfig::jitter` times its mean diagonal. If the
//! Cholesky factorization still fails the caller gets a
//! `NumericalInstability` error; no further regularization is attempted.

use crate::error::EngineError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Cholesky, Diag, Eigh, SolveTriangular, UPLO};

/// Lower Cholesky factor `L` of a symmetric positive-definite matrix `V = L L'`.
#[derive(Clone, Debug)]
pub struct CholeskyFactor {
    lower: Array2<f64>,
}

impl CholeskyFactor {
    /// Factorizes `matrix + jitter * mean(diag) * I`.
    pub fn factorize(
        matrix: ArrayView2<f64>,
        jitter: f64,
        context: &str,
    ) -> Result<Self, EngineError> {
        let n = matrix.nrows();
        if n != matrix.ncols() {
            return Err(EngineError::dimension(
                format!("{context} (square matrix)"),
                n,
                matrix.ncols(),
            ));
        }
        let mean_diag = matrix.diag().mean().unwrap_or(0.0);
        if !mean_diag.is_finite() {
            return Err(EngineError::unstable(context, "non-finite diagonal"));
        }
        let mut shifted = matrix.to_owned();
        let ridge = jitter * mean_diag.abs();
        shifted.diag_mut().mapv_inplace(|d| d + ridge);

        let lower = shifted.cholesky(UPLO::Lower).map_err(|e| {
            EngineError::unstable(
                context,
                format!("Cholesky failed after diagonal jitter {ridge:.3e}: {e}"),
            )
        })?;
        Ok(Self { lower })
    }

    pub fn dim(&self) -> usize {
        self.lower.nrows()
    }

    /// `log|V| = 2 * sum(log(diag(L)))`.
    pub fn log_det(&self) -> f64 {
        2.0 * self.lower.diag().mapv(f64::ln).sum()
    }

    /// `L^-1 b`.
    pub fn whiten_vec(&self, b: ArrayView1<f64>) -> Result<Array1<f64>, EngineError> {
        Ok(self
            .lower
            .solve_triangular(UPLO::Lower, Diag::NonUnit, &b.to_owned())?)
    }

    /// `L^-1 B`, column by column.
    pub fn whiten(&self, b: ArrayView2<f64>) -> Result<Array2<f64>, EngineError> {
        Ok(self
            .lower
            .solve_triangular(UPLO::Lower, Diag::NonUnit, &b.to_owned())?)
    }

    /// `V^-1 b`.
    pub fn solve_vec(&self, b: ArrayView1<f64>) -> Result<Array1<f64>, EngineError> {
        let half = self.whiten_vec(b)?;
        Ok(self
            .lower
            .t()
            .solve_triangular(UPLO::Upper, Diag::NonUnit, &half)?)
    }

    /// The inverse `V^-1 = L^-T L^-1`.
    pub fn inverse(&self) -> Result<Array2<f64>, EngineError> {
        let lower_inv = self.whiten(Array2::eye(self.dim()).view())?;
        Ok(lower_inv.t().dot(&lower_inv))
    }
}

/// Eigen-decomposition of a symmetric matrix, eigenvalues in descending order.
pub fn descending_eigh(matrix: ArrayView2<f64>) -> Result<(Array1<f64>, Array2<f64>), EngineError> {
    let (values, vectors) = matrix.to_owned().eigh(UPLO::Lower)?;
    let n = values.len();
    let order: Vec<usize> = (0..n).rev().collect();
    Ok((values.select(Axis(0), &order), vectors.select(Axis(1), &order)))
}

/// Unbiased sample variance; zero for fewer than two values.
pub fn sample_variance(values: ArrayView1<f64>) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.sum() / n as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
}

/// Subtracts each column's mean in place.
pub fn center_columns(matrix: &mut Array2<f64>) {
    if let Some(means) = matrix.mean_axis(Axis(0)) {
        *matrix -= &means.insert_axis(Axis(0));
    }
}
