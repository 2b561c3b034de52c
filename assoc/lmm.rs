use itertools::{Itertools, izip};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::config::EngineConfig;
use crate::decompose::reml::{assemble_covariance, fit_gene};
use crate::error::EngineError;
use crate::factor::kernel::{CovarianceTerm, validate_terms};
use crate::linalg::{CholeskyFactor, sample_variance};
use crate::types::{ExpressionMatrix, TechnicalNoise, validate_gene_indices, validate_noise};

/// Relative pivot below which the two-column design is treated as singular.
const SINGULAR_DESIGN_TOLERANCE: f64 = 1e-10;

/// Which predictors each selected response gene is tested against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairTarget {
    /// One reference gene against every selected gene.
    Reference(usize),
    /// Every selected gene against every other selected gene.
    AllSelected,
    /// An explicit predictor list, independent of the responses. Sharding the
    /// responses while keeping this list fixed gives fits that
    /// [`LmmFit::merge`] can recombine.
    Predictors(Vec<usize>),
}

/// Effect sizes and Wald tests for response x predictor gene pairs.
///
/// Rows follow `responses`, columns follow `predictors`. Pairs that could not
/// be tested (unconverged null model, a gene against itself, a constant
/// predictor) are `NaN` with `converged` false.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LmmFit {
    pub responses: Vec<usize>,
    pub predictors: Vec<usize>,
    pub beta: Array2<f64>,
    pub std_errors: Array2<f64>,
    /// Wald chi-squared statistic `(beta / se)^2`, one degree of freedom.
    pub statistics: Array2<f64>,
    pub p_values: Array2<f64>,
    pub converged: Array2<bool>,
    /// Names of the covariance terms the pairs were corrected for.
    pub covariance_terms: Vec<String>,
}

impl LmmFit {
    pub fn tested_pairs(&self) -> usize {
        self.converged.iter().filter(|&&ok| ok).count()
    }

    /// Stacks fits of disjoint response shards tested against the same
    /// predictors and covariance terms. Rows of the result are ordered by
    /// response gene.
    pub fn merge(fits: impl IntoIterator<Item = LmmFit>) -> Result<Self, EngineError> {
        let fits: Vec<LmmFit> = fits.into_iter().collect();
        let Some(first) = fits.first() else {
            return Err(EngineError::Input("no association fits to merge".to_string()));
        };
        for fit in &fits[1..] {
            if fit.predictors != first.predictors {
                return Err(EngineError::Input(format!(
                    "cannot merge fits with different predictors: {:?} vs {:?}",
                    first.predictors, fit.predictors
                )));
            }
            if fit.covariance_terms != first.covariance_terms {
                return Err(EngineError::Input(format!(
                    "cannot merge fits corrected for different K-lists: {:?} vs {:?}",
                    first.covariance_terms, fit.covariance_terms
                )));
            }
        }

        let responses: Vec<usize> = fits.iter().flat_map(|f| f.responses.iter().copied()).collect();
        let order: Vec<usize> = (0..responses.len()).sorted_by_key(|&i| responses[i]).collect();
        if let Some((&a, _)) = order
            .iter()
            .map(|&i| &responses[i])
            .tuple_windows()
            .find(|(a, b)| a == b)
        {
            return Err(EngineError::Input(format!(
                "response gene {a} appears in more than one shard"
            )));
        }

        let beta = stack_rows(fits.iter().map(|f| f.beta.view()), &order)?;
        let std_errors = stack_rows(fits.iter().map(|f| f.std_errors.view()), &order)?;
        let statistics = stack_rows(fits.iter().map(|f| f.statistics.view()), &order)?;
        let p_values = stack_rows(fits.iter().map(|f| f.p_values.view()), &order)?;
        let converged = stack_rows(fits.iter().map(|f| f.converged.view()), &order)?;

        Ok(Self {
            responses: order.iter().map(|&i| responses[i]).collect(),
            predictors: first.predictors.clone(),
            beta,
            std_errors,
            statistics,
            p_values,
            converged,
            covariance_terms: first.covariance_terms.clone(),
        })
    }
}

/// The same pairs tested with and without correction for the K-list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairwiseAssociation {
    pub corrected: LmmFit,
    pub uncorrected: LmmFit,
}

impl PairwiseAssociation {
    /// Merges corrected and uncorrected fits of response shards separately.
    pub fn merge(
        parts: impl IntoIterator<Item = PairwiseAssociation>,
    ) -> Result<Self, EngineError> {
        let (corrected, uncorrected): (Vec<LmmFit>, Vec<LmmFit>) = parts
            .into_iter()
            .map(|part| (part.corrected, part.uncorrected))
            .unzip();
        Ok(Self {
            corrected: LmmFit::merge(corrected)?,
            uncorrected: LmmFit::merge(uncorrected)?,
        })
    }
}

struct PairRow {
    beta: Array1<f64>,
    std_errors: Array1<f64>,
    converged: Array1<bool>,
}

impl PairRow {
    fn untested(width: usize) -> Self {
        Self {
            beta: Array1::from_elem(width, f64::NAN),
            std_errors: Array1::from_elem(width, f64::NAN),
            converged: Array1::from_elem(width, false),
        }
    }
}

/// Tests every response in `genes` against the predictors chosen by
/// `target`, with covariance `sum_k s_k K_k + (s_e + t) I` fitted once per
/// response under the null. With `terms = None` the covariance is a scaled
/// identity and the estimates are ordinary least squares.
pub fn lmm(
    expression: &ExpressionMatrix,
    noise: &TechnicalNoise,
    terms: Option<&[CovarianceTerm]>,
    genes: &[usize],
    target: &PairTarget,
    config: &EngineConfig,
) -> Result<LmmFit, EngineError> {
    validate_noise(expression, noise)?;
    validate_gene_indices(genes, expression.n_genes())?;
    let terms = terms.unwrap_or(&[]);
    validate_terms(terms, expression.n_cells())?;

    let predictors = match target {
        PairTarget::Reference(gene) => vec![*gene],
        PairTarget::AllSelected => genes.to_vec(),
        PairTarget::Predictors(list) => list.clone(),
    };
    validate_gene_indices(&predictors, expression.n_genes())?;
    let standardize = config.association.standardize;
    let design = Array2::from_shape_fn((expression.n_cells(), predictors.len()), |(i, p)| {
        expression[[i, predictors[p]]]
    });
    let design = if standardize {
        standardize_columns(design)
    } else {
        design
    };

    let kernels: Vec<ArrayView2<f64>> = terms.iter().map(|t| t.kernel.as_view()).collect();
    let chi2 = ChiSquared::new(1.0)
        .map_err(|e| EngineError::unstable("Wald test distribution", e.to_string()))?;

    log::info!(
        "Testing {} responses against {} predictors with {} covariance terms",
        genes.len(),
        predictors.len(),
        terms.len()
    );

    let rows: Vec<PairRow> = genes
        .par_iter()
        .map(|&gene| {
            test_response(expression, noise, gene, &predictors, design.view(), &kernels, config)
        })
        .collect();

    let shape = (genes.len(), predictors.len());
    let mut beta = Array2::from_elem(shape, f64::NAN);
    let mut std_errors = Array2::from_elem(shape, f64::NAN);
    let mut converged = Array2::from_elem(shape, false);
    for (row, mut b, mut se, mut ok) in izip!(
        &rows,
        beta.axis_iter_mut(Axis(0)),
        std_errors.axis_iter_mut(Axis(0)),
        converged.axis_iter_mut(Axis(0))
    ) {
        b.assign(&row.beta);
        se.assign(&row.std_errors);
        ok.assign(&row.converged);
    }
    let statistics = ndarray::Zip::from(&beta)
        .and(&std_errors)
        .map_collect(|&b, &se| (b / se).powi(2));
    let p_values =
        statistics.mapv(|stat| if stat.is_finite() { chi2.sf(stat) } else { f64::NAN });

    let fit = LmmFit {
        responses: genes.to_vec(),
        predictors,
        beta,
        std_errors,
        statistics,
        p_values,
        converged,
        covariance_terms: terms.iter().map(|t| t.name.clone()).collect(),
    };
    log::info!("Tested {} gene pairs", fit.tested_pairs());
    Ok(fit)
}

/// Runs [`lmm`] with the K-list and again without it.
pub fn associate(
    expression: &ExpressionMatrix,
    noise: &TechnicalNoise,
    terms: &[CovarianceTerm],
    genes: &[usize],
    target: &PairTarget,
    config: &EngineConfig,
) -> Result<PairwiseAssociation, EngineError> {
    Ok(PairwiseAssociation {
        corrected: lmm(expression, noise, Some(terms), genes, target, config)?,
        uncorrected: lmm(expression, noise, None, genes, target, config)?,
    })
}

/// Concatenates row blocks and reorders the rows by `order`.
fn stack_rows<'a, A: Clone + 'a>(
    blocks: impl Iterator<Item = ArrayView2<'a, A>>,
    order: &[usize],
) -> Result<Array2<A>, EngineError> {
    let blocks: Vec<ArrayView2<'a, A>> = blocks.collect();
    let stacked = ndarray::concatenate(Axis(0), &blocks)
        .map_err(|e| EngineError::Input(format!("cannot stack association fits: {e}")))?;
    Ok(stacked.select(Axis(0), order))
}

fn standardize_columns(mut matrix: Array2<f64>) -> Array2<f64> {
    for mut column in matrix.axis_iter_mut(Axis(1)) {
        standardize_in_place(&mut column);
    }
    matrix
}

/// Centers to mean 0 and scales to unit sample variance; constant columns
/// are only centered.
fn standardize_in_place(values: &mut ndarray::ArrayViewMut1<f64>) -> f64 {
    let mean = values.mean().unwrap_or(0.0);
    let sd = sample_variance(values.view()).sqrt();
    let scale = if sd > 0.0 { sd } else { 1.0 };
    values.mapv_inplace(|v| (v - mean) / scale);
    scale
}

fn test_response(
    expression: &ExpressionMatrix,
    noise: &TechnicalNoise,
    gene: usize,
    predictors: &[usize],
    design: ArrayView2<f64>,
    kernels: &[ArrayView2<f64>],
    config: &EngineConfig,
) -> PairRow {
    let width = predictors.len();
    let mut y = expression.gene(gene).to_owned();
    let mut technical = noise[gene];
    if config.association.standardize {
        let scale = standardize_in_place(&mut y.view_mut());
        technical /= scale * scale;
    }

    let null = fit_gene(gene, y.view(), technical, kernels, config);
    if !null.converged {
        log::warn!(
            "Null model for response gene {gene} did not converge: {}",
            null.failure.map(|f| f.to_string()).unwrap_or_default()
        );
        return PairRow::untested(width);
    }

    let v = assemble_covariance(
        kernels,
        &null.variances,
        null.residual_variance + null.technical_variance,
        y.len(),
    );
    let whitened = CholeskyFactor::factorize(v.view(), config.kernel.jitter, "null covariance")
        .and_then(|chol| {
            Ok((
                chol.whiten_vec(y.view())?,
                chol.whiten_vec(Array1::ones(y.len()).view())?,
                chol.whiten(design)?,
            ))
        });
    let (wy, w1, wx) = match whitened {
        Ok(parts) => parts,
        Err(e) => {
            log::warn!("Response gene {gene} skipped: {e}");
            return PairRow::untested(width);
        }
    };

    let mut row = PairRow::untested(width);
    for (p, &predictor) in predictors.iter().enumerate() {
        if predictor == gene {
            continue;
        }
        if let Some((b, se)) = gls_slope(wy.view(), w1.view(), wx.column(p)) {
            row.beta[p] = b;
            row.std_errors[p] = se;
            row.converged[p] = true;
        }
    }
    row
}

/// Slope and standard error of the whitened regression `y ~ 1 + x`.
fn gls_slope(y: ArrayView1<f64>, one: ArrayView1<f64>, x: ArrayView1<f64>) -> Option<(f64, f64)> {
    let a = one.dot(&one);
    let b = one.dot(&x);
    let d = x.dot(&x);
    let det = a * d - b * b;
    if !(det > SINGULAR_DESIGN_TOLERANCE * a * d) {
        return None;
    }
    let slope = (a * x.dot(&y) - b * one.dot(&y)) / det;
    let se = (a / det).sqrt();
    (slope.is_finite() && se.is_finite()).then_some((slope, se))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn gls_slope_with_identity_is_least_squares() {
        let x = array![0.0, 1.0, 2.0, 3.0];
        let y = array![1.0, 3.0, 5.2, 6.8];
        let one = Array1::ones(4);
        let (slope, se) = gls_slope(y.view(), one.view(), x.view()).unwrap();
        assert_abs_diff_eq!(slope, 1.96, epsilon = 1e-12);
        assert_abs_diff_eq!(se, (1.0_f64 / 5.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn constant_predictor_is_singular() {
        let x = array![2.0, 2.0, 2.0];
        let y = array![1.0, 2.0, 3.0];
        let one = Array1::ones(3);
        assert!(gls_slope(y.view(), one.view(), x.view()).is_none());
    }

    #[test]
    fn self_pairs_and_reference_bounds() {
        let expression = ExpressionMatrix::new(array![
            [1.0, 2.0, 0.5],
            [2.0, 1.0, 0.1],
            [3.0, 5.0, 0.9],
            [4.0, 3.0, 0.2],
            [5.0, 6.0, 0.4]
        ])
        .unwrap();
        let noise = TechnicalNoise::zeros(3);
        let config = EngineConfig::default();
        let fit = lmm(&expression, &noise, None, &[0, 1, 2], &PairTarget::AllSelected, &config)
            .unwrap();
        assert_eq!(fit.beta.dim(), (3, 3));
        for i in 0..3 {
            assert!(!fit.converged[[i, i]]);
            assert!(fit.beta[[i, i]].is_nan());
        }
        assert!(fit.converged[[0, 1]]);
        assert!(fit.p_values[[0, 1]] > 0.0 && fit.p_values[[0, 1]] < 1.0);
        assert!(
            lmm(&expression, &noise, None, &[0], &PairTarget::Reference(7), &config).is_err()
        );
        let outside = PairTarget::Predictors(vec![1, 3]);
        assert!(lmm(&expression, &noise, None, &[0], &outside, &config).is_err());
    }

    #[test]
    fn merge_rejects_mismatched_or_overlapping_shards() {
        let expression = ExpressionMatrix::new(array![
            [1.0, 2.0, 0.5],
            [2.0, 1.0, 0.1],
            [3.0, 5.0, 0.9],
            [4.0, 3.0, 0.2],
            [5.0, 6.0, 0.4]
        ])
        .unwrap();
        let noise = TechnicalNoise::zeros(3);
        let config = EngineConfig::default();
        let target = PairTarget::Predictors(vec![0, 1, 2]);
        let run = |genes: &[usize], target: &PairTarget| {
            lmm(&expression, &noise, None, genes, target, &config).unwrap()
        };

        let merged = LmmFit::merge([run(&[2], &target), run(&[0, 1], &target)]).unwrap();
        assert_eq!(merged.responses, vec![0, 1, 2]);
        assert_eq!(merged.beta.dim(), (3, 3));
        assert!(!merged.converged[[2, 2]]);

        assert!(LmmFit::merge([run(&[0, 1], &target), run(&[1, 2], &target)]).is_err());
        let other = PairTarget::Predictors(vec![0, 1]);
        assert!(LmmFit::merge([run(&[0], &target), run(&[1], &other)]).is_err());
        assert!(LmmFit::merge(Vec::new()).is_err());
    }
}
