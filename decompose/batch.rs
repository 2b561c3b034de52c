use itertools::Itertools;
use ndarray::{Array1, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::reml::{VarianceComponentResult, fit_gene};
use crate::config::EngineConfig;
use crate::error::{EngineError, FitFailure};
use crate::factor::kernel::{CovarianceTerm, validate_terms};
use crate::types::{ExpressionMatrix, TechnicalNoise, validate_gene_indices, validate_noise};

/// Label of the trailing noise weight.
pub const NOISE_LABEL: &str = "noise";

/// Variance decompositions of a set of genes against one K-list, ordered by
/// gene index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecompositionBatch {
    pub term_names: Vec<String>,
    pub results: Vec<VarianceComponentResult>,
}

impl DecompositionBatch {
    /// Term names followed by the noise label, one per weight.
    pub fn labels(&self) -> Vec<String> {
        self.term_names
            .iter()
            .cloned()
            .chain(std::iter::once(NOISE_LABEL.to_string()))
            .collect()
    }

    pub fn get(&self, gene: usize) -> Option<&VarianceComponentResult> {
        self.results
            .binary_search_by_key(&gene, |r| r.gene)
            .ok()
            .map(|i| &self.results[i])
    }

    pub fn converged(&self) -> impl Iterator<Item = &VarianceComponentResult> {
        self.results.iter().filter(|r| r.converged)
    }

    pub fn converged_count(&self) -> usize {
        self.converged().count()
    }

    /// Genes that did not converge, with the recorded reason.
    pub fn failures(&self) -> Vec<(usize, &FitFailure)> {
        self.results
            .iter()
            .filter_map(|r| r.failure.as_ref().map(|f| (r.gene, f)))
            .collect()
    }

    /// Average weight vector over converged genes; `None` if no gene converged.
    pub fn mean_weights(&self) -> Option<Array1<f64>> {
        let width = self.term_names.len() + 1;
        let (sum, count) = self.converged().fold(
            (Array1::<f64>::zeros(width), 0usize),
            |(mut acc, count), r| {
                acc += &Array1::from_vec(r.weights.clone());
                (acc, count + 1)
            },
        );
        (count > 0).then(|| sum / count as f64)
    }

    /// Combines shard batches fitted against the same K-list.
    pub fn merge(
        batches: impl IntoIterator<Item = DecompositionBatch>,
    ) -> Result<Self, EngineError> {
        let mut batches = batches.into_iter();
        let Some(first) = batches.next() else {
            return Err(EngineError::Input("no batches to merge".to_string()));
        };
        let term_names = first.term_names;
        let mut results = first.results;
        for batch in batches {
            if batch.term_names != term_names {
                return Err(EngineError::Input(format!(
                    "cannot merge batches fitted against different K-lists: {:?} vs {:?}",
                    term_names, batch.term_names
                )));
            }
            results.extend(batch.results);
        }
        results.sort_by_key(|r| r.gene);
        if let Some((a, _)) = results.iter().tuple_windows().find(|(a, b)| a.gene == b.gene) {
            return Err(EngineError::Input(format!(
                "gene {} appears in more than one shard",
                a.gene
            )));
        }
        Ok(Self {
            term_names,
            results,
        })
    }
}

/// Splits gene indices into at most `shards` contiguous, near-equal parts.
///
/// Each part can be decomposed independently, e.g. on a different machine,
/// and the outputs combined with [`DecompositionBatch::merge`].
pub fn split_into_shards(genes: &[usize], shards: usize) -> Result<Vec<Vec<usize>>, EngineError> {
    if shards == 0 {
        return Err(EngineError::Input("shard count must be at least 1".to_string()));
    }
    if genes.is_empty() {
        return Ok(Vec::new());
    }
    let size = genes.len().div_ceil(shards);
    Ok(genes.chunks(size).map(<[usize]>::to_vec).collect())
}

/// Fits every gene in `genes` against the K-list `terms`, in parallel.
///
/// Per-gene failures are recorded on the individual results; only invalid
/// inputs abort the call.
pub fn variance_decomposition(
    expression: &ExpressionMatrix,
    noise: &TechnicalNoise,
    terms: &[CovarianceTerm],
    genes: &[usize],
    config: &EngineConfig,
) -> Result<DecompositionBatch, EngineError> {
    validate_noise(expression, noise)?;
    validate_terms(terms, expression.n_cells())?;
    validate_gene_indices(genes, expression.n_genes())?;
    if let Some(name) = terms.iter().map(|t| &t.name).duplicates().next() {
        return Err(EngineError::Input(format!(
            "covariance term '{name}' appears more than once in the K-list"
        )));
    }

    let kernels: Vec<ArrayView2<f64>> = terms.iter().map(|t| t.kernel.as_view()).collect();
    log::info!(
        "Decomposing {} genes against {} covariance terms on {} cells",
        genes.len(),
        terms.len(),
        expression.n_cells()
    );

    let mut results: Vec<VarianceComponentResult> = genes
        .par_iter()
        .map(|&gene| fit_gene(gene, expression.gene(gene), noise[gene], &kernels, config))
        .collect();
    results.sort_by_key(|r| r.gene);

    let batch = DecompositionBatch {
        term_names: terms.iter().map(|t| t.name.clone()).collect(),
        results,
    };
    for (gene, failure) in batch.failures() {
        log::warn!("Gene {gene} did not converge: {failure}");
    }
    log::info!(
        "Variance decomposition converged for {} of {} genes",
        batch.converged_count(),
        batch.results.len()
    );
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor::kernel::CovarianceMatrix;
    use ndarray::Array2;

    fn result(gene: usize, weights: Vec<f64>, converged: bool) -> VarianceComponentResult {
        VarianceComponentResult {
            gene,
            variances: vec![0.0; weights.len() - 1],
            weights,
            residual_variance: 1.0,
            technical_variance: 0.0,
            mean: 0.0,
            log_likelihood: 0.0,
            converged,
            failure: (!converged).then_some(FitFailure::Degenerate),
            iterations: 1,
        }
    }

    #[test]
    fn shards_cover_every_gene_once() {
        let genes: Vec<usize> = (0..10).collect();
        let shards = split_into_shards(&genes, 3).unwrap();
        assert_eq!(shards.len(), 3);
        assert_eq!(shards.concat(), genes);
        assert!(split_into_shards(&genes, 0).is_err());
        assert_eq!(split_into_shards(&genes, 20).unwrap().len(), 10);
    }

    #[test]
    fn merge_sorts_and_rejects_overlap() {
        let names = vec!["cc".to_string()];
        let a = DecompositionBatch {
            term_names: names.clone(),
            results: vec![result(3, vec![0.5, 0.5], true)],
        };
        let b = DecompositionBatch {
            term_names: names.clone(),
            results: vec![result(1, vec![0.2, 0.8], true)],
        };
        let merged = DecompositionBatch::merge([a.clone(), b]).unwrap();
        assert_eq!(merged.results.iter().map(|r| r.gene).collect::<Vec<_>>(), vec![1, 3]);
        assert!(merged.get(3).is_some());
        assert!(merged.get(2).is_none());
        assert!(DecompositionBatch::merge([a.clone(), a]).is_err());
    }

    #[test]
    fn summaries_skip_unconverged_genes() {
        let batch = DecompositionBatch {
            term_names: vec!["cc".to_string()],
            results: vec![
                result(0, vec![0.5, 0.5], true),
                result(1, vec![f64::NAN, f64::NAN], false),
                result(2, vec![0.1, 0.9], true),
            ],
        };
        assert_eq!(batch.converged_count(), 2);
        assert_eq!(batch.failures(), vec![(1, &FitFailure::Degenerate)]);
        let mean = batch.mean_weights().unwrap();
        assert!((mean[0] - 0.3).abs() < 1e-12);
        assert_eq!(batch.labels(), vec!["cc".to_string(), "noise".to_string()]);
    }

    #[test]
    fn duplicate_term_names_are_rejected() {
        let expression = ExpressionMatrix::new(Array2::from_shape_fn((4, 2), |(i, j)| {
            (i * 3 + j) as f64
        }))
        .unwrap();
        let k = CovarianceMatrix::normalized(Array2::eye(4)).unwrap();
        let terms = vec![
            CovarianceTerm::standalone("cc", k.clone()),
            CovarianceTerm::standalone("cc", k),
        ];
        let result = variance_decomposition(
            &expression,
            &TechnicalNoise::zeros(2),
            &terms,
            &[0],
            &EngineConfig::default(),
        );
        assert!(matches!(result, Err(EngineError::Input(_))));
    }
}
