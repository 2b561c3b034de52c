use crate::config::KernelConfig;
use crate::error::EngineError;
use crate::linalg::descending_eigh;
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Smallest mean diagonal a kernel may have before normalization is refused.
const MIN_MEAN_DIAGONAL: f64 = 1e-12;

/// A symmetric positive-semidefinite cell x cell similarity matrix.
///
/// Matrices built by [`CovarianceMatrix::normalized`] have mean diagonal 1,
/// i.e. `trace(K) / N = 1`, so variance weights of different factors are
/// directly comparable.
///
/// Deserialized matrices pass through [`CovarianceMatrix::new`] with the
/// default [`KernelConfig`] tolerance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Array2<f64>", into = "Array2<f64>")]
pub struct CovarianceMatrix(Array2<f64>);

impl CovarianceMatrix {
    /// Wraps a caller-supplied kernel after checking shape, finiteness,
    /// symmetry and positive semidefiniteness. The stored matrix is exactly
    /// symmetrized; `tolerance` bounds both the asymmetry and the most
    /// negative eigenvalue, relative to the matrix scale.
    pub fn new(matrix: Array2<f64>, tolerance: f64) -> Result<Self, EngineError> {
        let n = matrix.nrows();
        if n != matrix.ncols() {
            return Err(EngineError::dimension(
                "covariance matrix columns",
                n,
                matrix.ncols(),
            ));
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::Input(
                "covariance matrix contains non-finite entries".to_string(),
            ));
        }
        let scale = matrix.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
        let asymmetry = matrix
            .indexed_iter()
            .map(|((i, j), v)| (v - matrix[[j, i]]).abs())
            .fold(0.0_f64, f64::max);
        if asymmetry > tolerance * scale {
            return Err(EngineError::Input(format!(
                "covariance matrix is not symmetric (max |K_ij - K_ji| = {asymmetry:.3e})"
            )));
        }
        let kernel = Self(symmetrize(matrix.view()));
        if !kernel.is_positive_semidefinite(tolerance)? {
            return Err(EngineError::Input(format!(
                "covariance matrix is not positive semidefinite (min eigenvalue {:.3e})",
                kernel.min_eigenvalue()?
            )));
        }
        Ok(kernel)
    }

    /// Symmetrizes `matrix` and rescales it to mean diagonal 1.
    pub fn normalized(matrix: Array2<f64>) -> Result<Self, EngineError> {
        if matrix.nrows() != matrix.ncols() {
            return Err(EngineError::dimension(
                "covariance matrix columns",
                matrix.nrows(),
                matrix.ncols(),
            ));
        }
        let sym = symmetrize(matrix.view());
        let mean_diag = sym.diag().mean().unwrap_or(0.0);
        if !(mean_diag > MIN_MEAN_DIAGONAL) || !mean_diag.is_finite() {
            return Err(EngineError::unstable(
                "kernel normalization",
                format!("mean diagonal {mean_diag:.3e} is not a usable scale"),
            ));
        }
        Ok(Self(sym / mean_diag))
    }

    /// The normalized linear kernel `Z Z'` of latent coordinates `Z` (cells x dims).
    pub fn from_latent(latent: ArrayView2<f64>) -> Result<Self, EngineError> {
        Self::normalized(latent.dot(&latent.t()))
    }

    pub fn dim(&self) -> usize {
        self.0.nrows()
    }

    pub fn as_view(&self) -> ArrayView2<'_, f64> {
        self.0.view()
    }

    pub fn trace(&self) -> f64 {
        self.0.diag().sum()
    }

    pub fn mean_diagonal(&self) -> f64 {
        self.trace() / self.dim() as f64
    }

    /// The normalized elementwise (Schur) product, which is again PSD.
    pub fn hadamard(&self, other: &CovarianceMatrix) -> Result<Self, EngineError> {
        if self.dim() != other.dim() {
            return Err(EngineError::dimension(
                "interaction kernel operand",
                self.dim(),
                other.dim(),
            ));
        }
        Self::normalized(&self.0 * &other.0)
    }

    pub fn min_eigenvalue(&self) -> Result<f64, EngineError> {
        let (values, _) = descending_eigh(self.0.view())?;
        Ok(values.iter().copied().fold(f64::INFINITY, f64::min))
    }

    /// Eigenvector of the largest eigenvalue, unit length.
    pub fn top_eigenvector(&self) -> Result<Array1<f64>, EngineError> {
        let (_, vectors) = descending_eigh(self.0.view())?;
        Ok(vectors.column(0).to_owned())
    }

    /// True when no eigenvalue is below `-tolerance * max(1, mean diagonal)`.
    pub fn is_positive_semidefinite(&self, tolerance: f64) -> Result<bool, EngineError> {
        let floor = -tolerance * self.mean_diagonal().abs().max(1.0);
        Ok(self.min_eigenvalue()? >= floor)
    }
}

impl TryFrom<Array2<f64>> for CovarianceMatrix {
    type Error = EngineError;

    fn try_from(matrix: Array2<f64>) -> Result<Self, Self::Error> {
        Self::new(matrix, KernelConfig::default().symmetry_tolerance)
    }
}

impl From<CovarianceMatrix> for Array2<f64> {
    fn from(kernel: CovarianceMatrix) -> Self {
        kernel.0
    }
}

impl Deref for CovarianceMatrix {
    type Target = Array2<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn symmetrize(matrix: ArrayView2<f64>) -> Array2<f64> {
    (&matrix + &matrix.t()) * 0.5
}

/// How a covariance term came to be. Interaction and conditioned terms name
/// the factors they were derived from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermOrigin {
    Standalone,
    ConditionedOn { parent: String },
    Interaction { left: String, right: String },
}

/// One named entry of a K-list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CovarianceTerm {
    pub name: String,
    pub kernel: CovarianceMatrix,
    pub origin: TermOrigin,
}

impl CovarianceTerm {
    pub fn standalone(name: impl Into<String>, kernel: CovarianceMatrix) -> Self {
        Self {
            name: name.into(),
            kernel,
            origin: TermOrigin::Standalone,
        }
    }
}

/// Checks that every kernel of a K-list is `n_cells x n_cells`.
pub fn validate_terms(terms: &[CovarianceTerm], n_cells: usize) -> Result<(), EngineError> {
    for term in terms {
        if term.kernel.dim() != n_cells {
            return Err(EngineError::dimension(
                format!("kernel '{}'", term.name),
                n_cells,
                term.kernel.dim(),
            ));
        }
    }
    Ok(())
}
