//! Removal of fitted factor effects from expression.
//!
//! For a converged gene with covariance `V = sum_k s_k K_k + (s_e + t) I` the
//! best linear unbiased predictor of the effect of term `k` is
//! `u_k = s_k K_k V^-1 (y - mu 1)`. Subtracting `u_k` for each removed term
//! gives the corrected expression.

use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

use super::batch::DecompositionBatch;
use super::reml::{VarianceComponentResult, assemble_covariance};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::factor::kernel::{CovarianceTerm, validate_terms};
use crate::linalg::CholeskyFactor;
use crate::types::ExpressionMatrix;

/// Expression with factor effects removed.
///
/// Only genes whose decomposition converged appear; the rest are listed in
/// `excluded` and are never imputed.
#[derive(Clone, Debug)]
pub struct CorrectedExpression {
    /// Gene index of each column of `values`.
    pub genes: Vec<usize>,
    /// Cells x corrected genes.
    pub values: Array2<f64>,
    pub excluded: Vec<usize>,
    pub removed_terms: Vec<String>,
}

impl CorrectedExpression {
    /// Column of `values` holding `gene`, if it was corrected.
    pub fn column_of(&self, gene: usize) -> Option<usize> {
        self.genes.iter().position(|&g| g == gene)
    }
}

/// Removes the effect of every K-list term.
pub fn correct_expression(
    expression: &ExpressionMatrix,
    batch: &DecompositionBatch,
    terms: &[CovarianceTerm],
    config: &EngineConfig,
) -> Result<CorrectedExpression, EngineError> {
    let all: Vec<usize> = (0..terms.len()).collect();
    correct_expression_removing(expression, batch, terms, &all, config)
}

/// Removes the effect of the K-list terms at positions `remove`, leaving the
/// other terms' contributions in place.
pub fn correct_expression_removing(
    expression: &ExpressionMatrix,
    batch: &DecompositionBatch,
    terms: &[CovarianceTerm],
    remove: &[usize],
    config: &EngineConfig,
) -> Result<CorrectedExpression, EngineError> {
    validate_terms(terms, expression.n_cells())?;
    if batch.term_names.len() != terms.len() {
        return Err(EngineError::dimension(
            "K-list length of the decomposition",
            terms.len(),
            batch.term_names.len(),
        ));
    }
    if let Some((fitted, given)) = batch
        .term_names
        .iter()
        .zip(terms)
        .find(|(fitted, term)| **fitted != term.name)
        .map(|(fitted, term)| (fitted, &term.name))
    {
        return Err(EngineError::Input(format!(
            "decomposition was fitted with term '{fitted}' where the K-list has '{given}'"
        )));
    }
    if let Some(&bad) = remove.iter().find(|&&k| k >= terms.len()) {
        return Err(EngineError::Input(format!(
            "term position {bad} is out of range for {} terms",
            terms.len()
        )));
    }
    if let Some(twice) = remove.iter().duplicates().next() {
        return Err(EngineError::Input(format!(
            "term position {twice} is listed more than once for removal"
        )));
    }
    for result in &batch.results {
        if result.gene >= expression.n_genes() {
            return Err(EngineError::Input(format!(
                "decomposed gene {} is out of range for {} genes",
                result.gene,
                expression.n_genes()
            )));
        }
        if result.converged && result.variances.len() != terms.len() {
            return Err(EngineError::dimension(
                format!("variance components of gene {}", result.gene),
                terms.len(),
                result.variances.len(),
            ));
        }
    }

    let kernels: Vec<ArrayView2<f64>> = terms.iter().map(|t| t.kernel.as_view()).collect();
    let kept: Vec<&VarianceComponentResult> = batch.converged().collect();
    let excluded: Vec<usize> = batch
        .results
        .iter()
        .filter(|r| !r.converged)
        .map(|r| r.gene)
        .collect();

    let columns = kept
        .par_iter()
        .map(|r| correct_gene(expression, r, &kernels, remove, config.kernel.jitter))
        .collect::<Result<Vec<Array1<f64>>, EngineError>>()?;

    let mut values = Array2::<f64>::zeros((expression.n_cells(), kept.len()));
    for (mut column, corrected) in values.axis_iter_mut(Axis(1)).zip(&columns) {
        column.assign(corrected);
    }
    if !excluded.is_empty() {
        log::info!(
            "Excluding {} unconverged genes from the corrected expression",
            excluded.len()
        );
    }

    Ok(CorrectedExpression {
        genes: kept.iter().map(|r| r.gene).collect(),
        values,
        excluded,
        removed_terms: remove.iter().map(|&k| terms[k].name.clone()).collect(),
    })
}

fn correct_gene(
    expression: &ExpressionMatrix,
    result: &VarianceComponentResult,
    kernels: &[ArrayView2<f64>],
    remove: &[usize],
    jitter: f64,
) -> Result<Array1<f64>, EngineError> {
    let y = expression.gene(result.gene);
    let mut corrected = y.to_owned();
    if remove.iter().all(|&k| result.variances[k] == 0.0) {
        return Ok(corrected);
    }

    let n = y.len();
    let v = assemble_covariance(
        kernels,
        &result.variances,
        result.residual_variance + result.technical_variance,
        n,
    );
    let chol = CholeskyFactor::factorize(
        v.view(),
        jitter,
        &format!("covariance of gene {}", result.gene),
    )?;
    let centered = y.mapv(|value| value - result.mean);
    let alpha = chol.solve_vec(centered.view())?;
    for &k in remove {
        let effect = kernels[k].dot(&alpha) * result.variances[k];
        corrected -= &effect;
    }
    Ok(corrected)
}
