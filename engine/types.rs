use crate::error::EngineError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::collections::HashSet;
use std::ops::Deref;

/// Log-normalized expression values, cells in rows and genes in columns.
///
/// Produced upstream by the normalization step; immutable once wrapped.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct ExpressionMatrix(Array2<f64>);

impl ExpressionMatrix {
    pub fn new(values: Array2<f64>) -> Result<Self, EngineError> {
        if values.nrows() < 2 || values.ncols() == 0 {
            return Err(EngineError::Input(format!(
                "expression matrix must have at least 2 cells and 1 gene, got {}x{}",
                values.nrows(),
                values.ncols()
            )));
        }
        if let Some(((cell, gene), value)) = values.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(EngineError::Input(format!(
                "non-finite expression value {value} at cell {cell}, gene {gene}"
            )));
        }
        Ok(Self(values))
    }

    pub fn n_cells(&self) -> usize {
        self.0.nrows()
    }

    pub fn n_genes(&self) -> usize {
        self.0.ncols()
    }

    pub fn as_view(&self) -> ArrayView2<'_, f64> {
        self.0.view()
    }

    /// Expression of one gene across all cells.
    pub fn gene(&self, index: usize) -> ArrayView1<'_, f64> {
        self.0.column(index)
    }

    /// Copies the columns named by `genes` into a new cells x genes matrix.
    pub fn select(&self, genes: &GeneSet) -> Array2<f64> {
        self.0.select(Axis(1), genes.indices())
    }
}

impl Deref for ExpressionMatrix {
    type Target = Array2<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Per-gene technical noise variance, aligned with the expression columns.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct TechnicalNoise(Array1<f64>);

impl TechnicalNoise {
    pub fn new(values: Array1<f64>) -> Result<Self, EngineError> {
        if let Some((gene, value)) = values
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(EngineError::Input(format!(
                "technical noise must be finite and non-negative, gene {gene} has {value}"
            )));
        }
        Ok(Self(values))
    }

    /// A zero technical noise vector, for callers without a noise model.
    pub fn zeros(n_genes: usize) -> Self {
        Self(Array1::zeros(n_genes))
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }
}

impl Deref for TechnicalNoise {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A validated, duplicate-free list of gene indices.
///
/// Order is preserved as given; it defines the column order of any matrix
/// selected through the set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneSet(Vec<usize>);

impl GeneSet {
    pub fn new(indices: Vec<usize>, n_genes: usize) -> Result<Self, EngineError> {
        if indices.is_empty() {
            return Err(EngineError::Input("gene set is empty".to_string()));
        }
        let mut seen = HashSet::with_capacity(indices.len());
        for &index in &indices {
            if index >= n_genes {
                return Err(EngineError::Input(format!(
                    "gene index {index} is out of range for {n_genes} genes"
                )));
            }
            if !seen.insert(index) {
                return Err(EngineError::Input(format!(
                    "gene index {index} appears more than once in the gene set"
                )));
            }
        }
        Ok(Self(indices))
    }

    /// Builds a gene set from a boolean mask over all genes, such as the
    /// output of a variable-gene selector.
    pub fn from_mask(mask: &[bool]) -> Result<Self, EngineError> {
        let indices = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect();
        Self::new(indices, mask.len())
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Checks that `indices` address valid, distinct genes.
pub(crate) fn validate_gene_indices(indices: &[usize], n_genes: usize) -> Result<(), EngineError> {
    GeneSet::new(indices.to_vec(), n_genes).map(|_| ())
}

/// Checks that the technical noise vector has one entry per expression column.
pub(crate) fn validate_noise(
    expression: &ExpressionMatrix,
    noise: &TechnicalNoise,
) -> Result<(), EngineError> {
    if noise.len() != expression.n_genes() {
        return Err(EngineError::dimension(
            "technical noise length",
            expression.n_genes(),
            noise.len(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn gene_set_rejects_duplicates_and_out_of_range() {
        assert!(GeneSet::new(vec![0, 2, 1], 3).is_ok());
        assert!(matches!(
            GeneSet::new(vec![0, 0], 3),
            Err(EngineError::Input(_))
        ));
        assert!(matches!(GeneSet::new(vec![3], 3), Err(EngineError::Input(_))));
        assert!(matches!(GeneSet::new(vec![], 3), Err(EngineError::Input(_))));
    }

    #[test]
    fn gene_set_from_mask_keeps_flagged_genes_in_order() {
        let set = GeneSet::from_mask(&[false, true, true, false, true]).unwrap();
        assert_eq!(set.indices(), &[1, 2, 4]);
        assert!(GeneSet::from_mask(&[false, false]).is_err());
    }

    #[test]
    fn noise_must_be_non_negative() {
        assert!(TechnicalNoise::new(array![0.0, 0.3]).is_ok());
        assert!(TechnicalNoise::new(array![0.1, -0.2]).is_err());
        assert!(TechnicalNoise::new(array![f64::NAN]).is_err());
    }

    #[test]
    fn expression_rejects_non_finite_values() {
        let bad = array![[1.0, 2.0], [f64::INFINITY, 0.0]];
        assert!(ExpressionMatrix::new(bad).is_err());

        let good = ExpressionMatrix::new(array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).unwrap();
        let set = GeneSet::new(vec![2, 0], 3).unwrap();
        assert_eq!(good.select(&set), array![[3.0, 1.0], [6.0, 4.0]]);
    }

    #[test]
    fn noise_length_is_checked_against_gene_count() {
        let expr = ExpressionMatrix::new(Array2::zeros((3, 4))).unwrap();
        let noise = TechnicalNoise::zeros(3);
        assert!(matches!(
            validate_noise(&expr, &noise),
            Err(EngineError::DimensionMismatch { expected: 4, found: 3, .. })
        ));
    }
}
