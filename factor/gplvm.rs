// factor/gplvm.rs

//! # Latent Factor Estimation via a Linear-Kernel GPLVM
//!
//! Every gene `g` of the selected set is modeled as an independent draw
//!
//! ```text
//!   y_g ~ N(0, Z Z' + s_p K_p + s_i (K_p ∘ Z Z') + σ² I)
//! ```
//!
//! where `Z` (cells x k) are the latent coordinates being learned, `K_p` is the
//! kernel of an optional parent factor that is conditioned on (with scale
//! `s_p`), the Hadamard term only exists when an interaction is requested, and
//! `σ²` is the residual noise, bounded below by the subset's mean technical
//! noise.
//!
//! The parameters are found by BFGS on the negative log-likelihood averaged over
//! genes and cells, starting from the probabilistic-PCA solution. With ARD, a
//! relevance prior `rate * Σ_j ||z_j||² / N` shrinks latent dimensions that the
//! data does not support; the per-dimension variances `||z_j||² / N` of the
//! fitted coordinates (rotated to principal axes) are reported so the caller
//! can read off the true dimensionality from the drop in the spectrum.

use wolfe_bfgs::{Bfgs, BfgsSolution};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::factor::kernel::{CovarianceMatrix, CovarianceTerm, TermOrigin};
use crate::linalg::{CholeskyFactor, center_columns, descending_eigh, sample_variance};
use crate::types::{ExpressionMatrix, GeneSet, TechnicalNoise, validate_noise};

use ndarray::{Array1, Array2, Axis, s};

/// Fewest genes a latent factor can be fitted on.
pub const MIN_FACTOR_GENES: usize = 2;

/// Cost reported to the optimizer when a trial point cannot be evaluated.
const FAILED_EVALUATION_COST: f64 = 1e10;

/// Whether and how a new factor accounts for a previously fitted one.
#[derive(Clone, Copy, Debug)]
pub enum Conditioning<'a> {
    /// Fit the factor on its own.
    Standalone,
    /// Explain away the parent's covariance before fitting the new factor.
    On(&'a FittedFactor),
    /// As `On`, and additionally fit an interaction kernel `K_parent ∘ K_new`.
    WithInteraction(&'a FittedFactor),
}

impl<'a> Conditioning<'a> {
    fn parent(&self) -> Option<&'a FittedFactor> {
        match *self {
            Conditioning::Standalone => None,
            Conditioning::On(parent) | Conditioning::WithInteraction(parent) => Some(parent),
        }
    }
}

/// Everything needed to fit one latent factor.
#[derive(Clone, Copy, Debug)]
pub struct FactorRequest<'a> {
    pub name: &'a str,
    pub genes: &'a GeneSet,
    /// Number of latent dimensions `k`; with ARD typically 10 to 20.
    pub latent_dims: usize,
    pub ard: bool,
    pub conditioning: Conditioning<'a>,
}

/// A fitted latent factor and the covariance terms it contributes to a K-list.
#[derive(Clone, Debug)]
pub struct FittedFactor {
    pub term: CovarianceTerm,
    /// Latent coordinates, cells x k, rotated so columns are in order of
    /// decreasing variance.
    pub latent: Array2<f64>,
    /// Variance carried by each latent dimension, when ARD was requested.
    pub ard_weights: Option<Array1<f64>>,
    /// The interaction kernel with the parent factor, when requested.
    pub interaction: Option<CovarianceTerm>,
    /// Residual noise variance, in the units of the (standardized) gene subset.
    pub noise_variance: f64,
    pub parent_scale: Option<f64>,
    pub interaction_scale: Option<f64>,
    /// Log-likelihood per gene at the optimum.
    pub log_likelihood: f64,
    pub iterations: usize,
}

impl FittedFactor {
    pub fn name(&self) -> &str {
        &self.term.name
    }

    pub fn kernel(&self) -> &CovarianceMatrix {
        &self.term.kernel
    }

    /// The factor's own term followed by its interaction term, if any.
    pub fn terms(&self) -> impl Iterator<Item = &CovarianceTerm> {
        std::iter::once(&self.term).chain(self.interaction.as_ref())
    }
}

/// Fits a latent factor on the genes of `request` and returns its normalized kernel.
///
/// Fails with `Input` for gene sets smaller than [`MIN_FACTOR_GENES`] or a
/// latent dimension outside `1..=N-2`, and with `Convergence` if BFGS does not
/// reach the configured tolerance within the iteration cap. The expression
/// matrix is never modified.
pub fn fit_factor(
    expression: &ExpressionMatrix,
    noise: &TechnicalNoise,
    request: &FactorRequest<'_>,
    config: &EngineConfig,
) -> Result<FittedFactor, EngineError> {
    validate_noise(expression, noise)?;
    let n_cells = expression.n_cells();
    let genes = request.genes;
    if genes.len() < MIN_FACTOR_GENES {
        return Err(EngineError::Input(format!(
            "factor '{}' needs at least {} genes, the gene set has {}",
            request.name,
            MIN_FACTOR_GENES,
            genes.len()
        )));
    }
    if let Some(&bad) = genes.indices().iter().find(|&&g| g >= expression.n_genes()) {
        return Err(EngineError::Input(format!(
            "gene index {bad} is out of range for {} genes",
            expression.n_genes()
        )));
    }
    if request.latent_dims == 0 || request.latent_dims + 2 > n_cells {
        return Err(EngineError::Input(format!(
            "latent dimension must be between 1 and {} for {} cells, got {}",
            n_cells.saturating_sub(2),
            n_cells,
            request.latent_dims
        )));
    }
    let parent = request.conditioning.parent();
    if let Some(parent) = parent {
        if parent.kernel().dim() != n_cells {
            return Err(EngineError::dimension(
                format!("parent factor '{}'", parent.name()),
                n_cells,
                parent.kernel().dim(),
            ));
        }
    }

    log::info!(
        "Fitting factor '{}' on {} genes with {} latent dimension(s){}{}.",
        request.name,
        genes.len(),
        request.latent_dims,
        if request.ard { ", ARD" } else { "" },
        match request.conditioning {
            Conditioning::Standalone => String::new(),
            Conditioning::On(p) => format!(", conditioned on '{}'", p.name()),
            Conditioning::WithInteraction(p) => format!(", interacting with '{}'", p.name()),
        }
    );

    let (subset, technical) =
        internal::prepare_subset(expression, noise, genes, config.gplvm.standardize);
    let scatter = subset.dot(&subset.t()) / genes.len() as f64;
    let mean_diagonal = scatter.diag().mean().unwrap_or(0.0);
    if !(mean_diagonal > 0.0) {
        return Err(EngineError::Input(format!(
            "genes selected for factor '{}' have no variance across cells",
            request.name
        )));
    }
    // technical noise cannot claim more than half of the observed variance
    let technical_floor = technical.mean().unwrap_or(0.0).min(0.5 * mean_diagonal);

    let objective = internal::GplvmObjective {
        scatter,
        parent: parent.map(FittedFactor::kernel),
        interaction: matches!(request.conditioning, Conditioning::WithInteraction(_)),
        n_cells,
        latent_dims: request.latent_dims,
        technical_floor,
        ard_rate: request.ard.then_some(config.gplvm.ard_rate),
        jitter: config.kernel.jitter,
    };

    let initial = objective.initial_point()?;
    let initial_cost = objective.evaluate(&initial)?.cost;
    if !initial_cost.is_finite() {
        return Err(EngineError::Convergence {
            iterations: 0,
            reason: format!("initial cost is not finite: {initial_cost}"),
        });
    }
    log::debug!("Initial GPLVM cost for '{}': {:.6}", request.name, initial_cost);

    let cost_and_grad = |params: &Array1<f64>| -> (f64, Array1<f64>) {
        match objective.evaluate(params) {
            Ok(eval) if eval.cost.is_finite() && eval.gradient.iter().all(|g| g.is_finite()) => {
                (eval.cost, eval.gradient)
            }
            Ok(_) => (FAILED_EVALUATION_COST, Array1::zeros(params.len())),
            Err(e) => {
                log::debug!("GPLVM evaluation failed at a trial point: {e}");
                (FAILED_EVALUATION_COST, Array1::zeros(params.len()))
            }
        }
    };

    let BfgsSolution {
        final_point,
        iterations,
        ..
    } = Bfgs::new(initial, cost_and_grad)
        .with_tolerance(config.gplvm.tolerance)
        .with_max_iterations(config.gplvm.max_iterations)
        .run()
        .map_err(|e| EngineError::Convergence {
            iterations: config.gplvm.max_iterations,
            reason: format!("BFGS failed while fitting factor '{}': {:?}", request.name, e),
        })?;

    let fitted = objective.finish(&final_point, request, iterations)?;
    log::info!(
        "Factor '{}' fitted in {} iterations: noise variance {:.4}, log-likelihood per gene {:.4}.",
        fitted.name(),
        iterations,
        fitted.noise_variance,
        fitted.log_likelihood
    );
    if let Some(weights) = &fitted.ard_weights {
        log::info!("ARD weights for '{}': {:?}", fitted.name(), weights.to_vec());
    }
    Ok(fitted)
}

/// Internal module for the GPLVM objective.
mod internal {
    use super::*;

    /// Centers the selected genes (and optionally scales them to unit variance),
    /// rescaling their technical noise alongside.
    pub(super) fn prepare_subset(
        expression: &ExpressionMatrix,
        noise: &TechnicalNoise,
        genes: &GeneSet,
        standardize: bool,
    ) -> (Array2<f64>, Array1<f64>) {
        let mut subset = expression.select(genes);
        center_columns(&mut subset);
        let mut technical: Array1<f64> = genes.indices().iter().map(|&g| noise[g]).collect();
        if standardize {
            for (mut column, tech) in subset.axis_iter_mut(Axis(1)).zip(technical.iter_mut()) {
                let variance = sample_variance(column.view());
                if variance > f64::EPSILON {
                    column /= variance.sqrt();
                    *tech /= variance;
                }
            }
        }
        (subset, technical)
    }

    /// Cost, gradient and per-gene log-likelihood at one parameter vector.
    pub(super) struct Evaluation {
        pub(super) cost: f64,
        pub(super) gradient: Array1<f64>,
        pub(super) log_likelihood: f64,
    }

    /// Parameters unpacked from the flat optimizer vector
    /// `[Z (row-major), log σ_free², log s_p?, log s_i?]`.
    struct Unpacked {
        latent: Array2<f64>,
        free_noise: f64,
        parent_scale: Option<f64>,
        interaction_scale: Option<f64>,
    }

    pub(super) struct GplvmObjective<'a> {
        pub(super) scatter: Array2<f64>,
        pub(super) parent: Option<&'a CovarianceMatrix>,
        pub(super) interaction: bool,
        pub(super) n_cells: usize,
        pub(super) latent_dims: usize,
        pub(super) technical_floor: f64,
        pub(super) ard_rate: Option<f64>,
        pub(super) jitter: f64,
    }

    impl GplvmObjective<'_> {
        fn latent_len(&self) -> usize {
            self.n_cells * self.latent_dims
        }

        pub(super) fn n_params(&self) -> usize {
            let extra = match (self.parent.is_some(), self.interaction) {
                (false, _) => 0,
                (true, false) => 1,
                (true, true) => 2,
            };
            self.latent_len() + 1 + extra
        }

        fn unpack(&self, params: &Array1<f64>) -> Unpacked {
            let k = self.latent_dims;
            let nk = self.latent_len();
            let latent = Array2::from_shape_fn((self.n_cells, k), |(i, j)| params[i * k + j]);
            let parent_scale = self.parent.map(|_| params[nk + 1].exp());
            let interaction_scale =
                (self.parent.is_some() && self.interaction).then(|| params[nk + 2].exp());
            Unpacked {
                latent,
                free_noise: params[nk].exp(),
                parent_scale,
                interaction_scale,
            }
        }

        /// Probabilistic-PCA starting point. When a parent factor is present,
        /// the directions its kernel spans are deflated out of the scatter
        /// first and their excess variance seeds the parent scale.
        pub(super) fn initial_point(&self) -> Result<Array1<f64>, EngineError> {
            let n = self.n_cells;
            let k = self.latent_dims;
            let (values, vectors) = descending_eigh(self.scatter.view())?;
            let mean_eigenvalue = values.mean().unwrap_or(0.0).max(f64::MIN_POSITIVE);
            let floor = 1e-3 * mean_eigenvalue;

            let parent_basis = match self.parent {
                Some(parent) => {
                    let (pvals, pvecs) = descending_eigh(parent.as_view())?;
                    let cutoff = 1e-8 * pvals[0].max(f64::MIN_POSITIVE);
                    let rank = pvals.iter().filter(|&&v| v > cutoff).count();
                    Some(pvecs.slice(s![.., ..rank]).to_owned())
                }
                None => None,
            };
            let parent_rank = parent_basis.as_ref().map_or(0, |b| b.ncols());

            // the smallest eigenvalue belongs to the centering direction
            let lo = (k + parent_rank).min(n - 1);
            let rest = values.slice(s![lo..n - 1]);
            let noise = rest
                .mean()
                .unwrap_or(floor)
                .max(self.technical_floor + floor);

            let (directions, spectrum, parent_scale) = match (&parent_basis, self.parent) {
                (Some(basis), Some(parent)) => {
                    let projector = basis.dot(&basis.t());
                    let complement = Array2::<f64>::eye(n) - &projector;
                    let deflated = complement.dot(&self.scatter).dot(&complement);
                    let explained = (&projector * &self.scatter).sum() - parent_rank as f64 * noise;
                    let (dvals, dvecs) = descending_eigh(deflated.view())?;
                    (dvecs, dvals, Some((explained / parent.trace()).max(floor)))
                }
                _ => (vectors, values, None),
            };

            let mut params = Array1::zeros(self.n_params());
            for j in 0..k {
                let scale = (spectrum[j] - noise).max(floor).sqrt();
                for i in 0..n {
                    params[i * k + j] = directions[[i, j]] * scale;
                }
            }
            let nk = self.latent_len();
            params[nk] = (noise - self.technical_floor).max(floor).ln();
            if let Some(scale) = parent_scale {
                params[nk + 1] = scale.ln();
                if self.interaction {
                    params[nk + 2] = 0.1_f64.ln();
                }
            }
            Ok(params)
        }

        pub(super) fn evaluate(&self, params: &Array1<f64>) -> Result<Evaluation, EngineError> {
            let n = self.n_cells as f64;
            let nk = self.latent_len();
            let u = self.unpack(params);
            let latent_kernel = u.latent.dot(&u.latent.t());

            let mut covariance = latent_kernel.clone();
            let parent = self.parent.map(CovarianceMatrix::as_view);
            let interaction_kernel = match (parent, u.interaction_scale) {
                (Some(p), Some(_)) => Some(&p * &latent_kernel),
                _ => None,
            };
            if let (Some(p), Some(scale)) = (parent, u.parent_scale) {
                covariance.scaled_add(scale, &p);
            }
            if let (Some(ik), Some(scale)) = (&interaction_kernel, u.interaction_scale) {
                covariance.scaled_add(scale, ik);
            }
            let noise = self.technical_floor + u.free_noise;
            covariance.diag_mut().mapv_inplace(|d| d + noise);

            let chol =
                CholeskyFactor::factorize(covariance.view(), self.jitter, "GPLVM covariance")?;
            let inv = chol.inverse()?;
            let data_fit = (&inv * &self.scatter).sum();
            let log_likelihood =
                -0.5 * (chol.log_det() + data_fit + n * (2.0 * std::f64::consts::PI).ln());

            // derivative of the log-likelihood with respect to the covariance
            let dcov = (inv.dot(&self.scatter).dot(&inv) - &inv) * 0.5;

            let mut cost = -log_likelihood / n;
            let mut gradient = Array1::zeros(params.len());

            let mut latent_sensitivity = dcov.clone();
            if let (Some(p), Some(scale)) = (parent, u.interaction_scale) {
                latent_sensitivity.scaled_add(scale, &(&dcov * &p));
            }
            let mut latent_grad = latent_sensitivity.dot(&u.latent) * (-2.0 / n);
            if let Some(rate) = self.ard_rate {
                cost += rate * u.latent.mapv(|z| z * z).sum() / n;
                latent_grad.scaled_add(2.0 * rate / n, &u.latent);
            }
            for (slot, value) in gradient.slice_mut(s![..nk]).iter_mut().zip(latent_grad.iter()) {
                *slot = *value;
            }

            gradient[nk] = -u.free_noise * dcov.diag().sum() / n;
            if let (Some(p), Some(scale)) = (parent, u.parent_scale) {
                gradient[nk + 1] = -scale * (&dcov * &p).sum() / n;
            }
            if let (Some(ik), Some(scale)) = (&interaction_kernel, u.interaction_scale) {
                gradient[nk + 2] = -scale * (&dcov * ik).sum() / n;
            }

            Ok(Evaluation {
                cost,
                gradient,
                log_likelihood,
            })
        }

        /// Builds the fitted factor from the optimizer's final point.
        pub(super) fn finish(
            &self,
            params: &Array1<f64>,
            request: &FactorRequest<'_>,
            iterations: usize,
        ) -> Result<FittedFactor, EngineError> {
            let evaluation = self.evaluate(params)?;
            let u = self.unpack(params);

            let gram = u.latent.t().dot(&u.latent);
            let (variances, axes) = descending_eigh(gram.view())?;
            let latent = u.latent.dot(&axes);
            let kernel = CovarianceMatrix::from_latent(latent.view())?;
            let ard_weights = self
                .ard_rate
                .map(|_| variances.mapv(|v| v.max(0.0) / self.n_cells as f64));

            let origin = match request.conditioning {
                Conditioning::Standalone => TermOrigin::Standalone,
                Conditioning::On(p) | Conditioning::WithInteraction(p) => {
                    TermOrigin::ConditionedOn {
                        parent: p.name().to_string(),
                    }
                }
            };
            let interaction = match request.conditioning {
                Conditioning::WithInteraction(p) => Some(CovarianceTerm {
                    name: format!("{}:{}", p.name(), request.name),
                    kernel: p.kernel().hadamard(&kernel)?,
                    origin: TermOrigin::Interaction {
                        left: p.name().to_string(),
                        right: request.name.to_string(),
                    },
                }),
                Conditioning::Standalone | Conditioning::On(_) => None,
            };

            Ok(FittedFactor {
                term: CovarianceTerm {
                    name: request.name.to_string(),
                    kernel,
                    origin,
                },
                latent,
                ard_weights,
                interaction,
                noise_variance: self.technical_floor + u.free_noise,
                parent_scale: u.parent_scale,
                interaction_scale: u.interaction_scale,
                log_likelihood: evaluation.log_likelihood,
                iterations,
            })
        }
    }
}
