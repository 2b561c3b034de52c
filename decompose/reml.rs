//! Restricted maximum likelihood for one gene.
//!
//! The model is `y = mu 1 + sum_k u_k + e`, `u_k ~ N(0, s_k K_k)` and
//! `e ~ N(0, (s_e + t) I)` where `t` is the gene's fixed technical noise.
//! Variances are optimized on a log scale relative to the gene's sample
//! variance, so the same seeds and bounds work for every gene.

use std::cell::Cell;
use std::time::Instant;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use wolfe_bfgs::{Bfgs, BfgsSolution};

use super::seeding::generate_log_variance_seeds;
use crate::config::EngineConfig;
use crate::error::{EngineError, FitFailure};
use crate::linalg::{CholeskyFactor, sample_variance};

/// Cost handed to the optimizer when a trial point cannot be evaluated.
const FAILED_EVALUATION_COST: f64 = 1e10;

/// Total variances at or below this are treated as a degenerate fit.
const MIN_TOTAL_VARIANCE: f64 = 1e-12;

/// Per-gene outcome of a variance decomposition.
///
/// `weights` has one entry per K-list term followed by the noise entry
/// (free residual plus technical noise). For converged genes the weights are
/// non-negative and sum to 1. Non-converged genes keep their index and
/// failure reason, but every estimate is `NaN`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VarianceComponentResult {
    pub gene: usize,
    pub weights: Vec<f64>,
    /// Absolute variance `s_k` of each K-list term.
    pub variances: Vec<f64>,
    /// Fitted residual variance, excluding technical noise.
    pub residual_variance: f64,
    pub technical_variance: f64,
    /// Generalized least squares intercept.
    pub mean: f64,
    /// Restricted log-likelihood at the optimum.
    pub log_likelihood: f64,
    pub converged: bool,
    pub failure: Option<FitFailure>,
    pub iterations: usize,
}

impl VarianceComponentResult {
    fn failed(gene: usize, num_terms: usize, technical: f64, failure: FitFailure) -> Self {
        Self {
            gene,
            weights: vec![f64::NAN; num_terms + 1],
            variances: vec![f64::NAN; num_terms],
            residual_variance: f64::NAN,
            technical_variance: technical,
            mean: f64::NAN,
            log_likelihood: f64::NAN,
            converged: false,
            failure: Some(failure),
            iterations: 0,
        }
    }

    /// Share of the trailing noise weight.
    pub fn noise_weight(&self) -> f64 {
        self.weights.last().copied().unwrap_or(f64::NAN)
    }

    /// Share of the total variance attributed to fixed technical noise.
    pub fn technical_fraction(&self) -> f64 {
        self.technical_variance / self.total_variance()
    }

    pub fn total_variance(&self) -> f64 {
        let noise = self.residual_variance + self.technical_variance;
        match self.noise_weight() {
            w if w > 0.0 => noise / w,
            _ => self.variances.iter().sum::<f64>() + noise,
        }
    }
}

/// `sum_k s_k K_k + residual * I`.
pub(crate) fn assemble_covariance(
    kernels: &[ArrayView2<f64>],
    variances: &[f64],
    residual: f64,
    n_cells: usize,
) -> Array2<f64> {
    let mut v = Array2::<f64>::zeros((n_cells, n_cells));
    for (kernel, &s) in kernels.iter().zip(variances) {
        v.scaled_add(s, kernel);
    }
    v.diag_mut().mapv_inplace(|d| d + residual);
    v
}

pub(crate) struct RemlEvaluation {
    pub(crate) cost: f64,
    pub(crate) gradient: Array1<f64>,
    pub(crate) log_likelihood: f64,
    pub(crate) mean: f64,
}

/// REML objective for a single gene. Parameters are
/// `theta_j = ln(s_j / scale)`, the last one being the residual.
pub(crate) struct RemlProblem<'y, 'a, 'k> {
    y: ArrayView1<'y, f64>,
    kernels: &'a [ArrayView2<'k, f64>],
    technical: f64,
    scale: f64,
    jitter: f64,
}

impl<'y, 'a, 'k> RemlProblem<'y, 'a, 'k> {
    pub(crate) fn new(
        y: ArrayView1<'y, f64>,
        kernels: &'a [ArrayView2<'k, f64>],
        technical: f64,
        jitter: f64,
    ) -> Self {
        Self {
            y,
            kernels,
            technical,
            scale: sample_variance(y),
            jitter,
        }
    }

    fn variances(&self, theta: &Array1<f64>) -> Vec<f64> {
        theta.iter().map(|t| self.scale * t.exp()).collect()
    }

    /// Cost `-l_R / N` and its gradient in `theta`.
    pub(crate) fn evaluate(&self, theta: &Array1<f64>) -> Result<RemlEvaluation, EngineError> {
        let n = self.y.len();
        let m = self.kernels.len();
        let sig = self.variances(theta);
        let v = assemble_covariance(self.kernels, &sig[..m], sig[m] + self.technical, n);
        let chol = CholeskyFactor::factorize(v.view(), self.jitter, "gene covariance")?;
        let inv = chol.inverse()?;

        let ones = Array1::<f64>::ones(n);
        let vinv_one = inv.dot(&ones);
        let denom = vinv_one.sum();
        if !(denom > 0.0) {
            return Err(EngineError::unstable(
                "gene covariance",
                "1' V^-1 1 is not positive",
            ));
        }
        let vinv_y = inv.dot(&self.y);
        let mean = vinv_one.dot(&self.y) / denom;
        // P y with P = V^-1 - V^-1 1 1' V^-1 / (1' V^-1 1)
        let py = &vinv_y - &(&vinv_one * mean);
        let quad = self.y.dot(&py);

        let log_likelihood = -0.5
            * (chol.log_det()
                + denom.ln()
                + quad
                + (n as f64 - 1.0) * (2.0 * std::f64::consts::PI).ln());
        if !log_likelihood.is_finite() {
            return Err(EngineError::unstable(
                "gene covariance",
                "restricted likelihood is not finite",
            ));
        }

        let scale = 0.5 / n as f64;
        let mut gradient = Array1::<f64>::zeros(m + 1);
        for (k, kernel) in self.kernels.iter().enumerate() {
            let trace = Zip::from(&inv).and(kernel).fold(0.0, |acc, a, b| acc + a * b);
            let k_one = kernel.dot(&vinv_one);
            let k_py = kernel.dot(&py);
            let trace_p = trace - vinv_one.dot(&k_one) / denom;
            gradient[k] = scale * sig[k] * (trace_p - py.dot(&k_py));
        }
        let trace_p = inv.diag().sum() - vinv_one.dot(&vinv_one) / denom;
        gradient[m] = scale * sig[m] * (trace_p - py.dot(&py));

        Ok(RemlEvaluation {
            cost: -log_likelihood / n as f64,
            gradient,
            log_likelihood,
            mean,
        })
    }
}

/// Fits the variance components of one gene against a K-list.
///
/// Never returns an error: every failure mode is recorded on the result so
/// that a batch can carry on with the remaining genes.
pub fn fit_gene(
    gene: usize,
    y: ArrayView1<f64>,
    technical: f64,
    kernels: &[ArrayView2<f64>],
    config: &EngineConfig,
) -> VarianceComponentResult {
    let m = kernels.len();
    let problem = RemlProblem::new(y, kernels, technical, config.kernel.jitter);
    if !(problem.scale > f64::EPSILON) {
        return VarianceComponentResult::failed(gene, m, technical, FitFailure::Degenerate);
    }

    if m == 0 {
        return fit_noise_only(gene, &problem);
    }

    let settings = &config.decomposition;
    let deadline = settings.timeout().map(|budget| Instant::now() + budget);
    let timed_out = Cell::new(false);
    let seeds = generate_log_variance_seeds(m, settings.seed_strategy, settings.seed_bounds);

    let mut best: Option<(RemlEvaluation, Array1<f64>, usize)> = None;
    let mut last_error: Option<FitFailure> = None;

    for seed in seeds {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            timed_out.set(true);
            break;
        }
        let cost_and_grad = |theta: &Array1<f64>| -> (f64, Array1<f64>) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                timed_out.set(true);
                return (FAILED_EVALUATION_COST, Array1::zeros(theta.len()));
            }
            match problem.evaluate(theta) {
                Ok(eval)
                    if eval.cost.is_finite() && eval.gradient.iter().all(|g| g.is_finite()) =>
                {
                    (eval.cost, eval.gradient)
                }
                Ok(_) => (FAILED_EVALUATION_COST, Array1::zeros(theta.len())),
                Err(e) => {
                    log::trace!("Gene {gene}: evaluation failed at a trial point: {e}");
                    (FAILED_EVALUATION_COST, Array1::zeros(theta.len()))
                }
            }
        };

        match Bfgs::new(seed, cost_and_grad)
            .with_tolerance(settings.tolerance)
            .with_max_iterations(settings.max_iterations)
            .run()
        {
            Ok(BfgsSolution {
                final_point,
                iterations,
                ..
            }) => match problem.evaluate(&final_point) {
                Ok(eval) => {
                    let better = best
                        .as_ref()
                        .is_none_or(|(incumbent, _, _)| eval.cost < incumbent.cost);
                    if better {
                        best = Some((eval, final_point, iterations));
                    }
                }
                Err(e) => last_error = Some(FitFailure::Numerical(e.to_string())),
            },
            Err(e) => {
                log::debug!("Gene {gene}: optimizer restart failed: {e:?}");
                last_error = Some(FitFailure::Optimizer(format!("{e:?}")));
            }
        }
    }

    if timed_out.get() {
        return VarianceComponentResult::failed(gene, m, technical, FitFailure::TimedOut);
    }
    let Some((eval, theta, iterations)) = best else {
        let failure = last_error
            .unwrap_or_else(|| FitFailure::Optimizer("no optimizer restart was attempted".into()));
        return VarianceComponentResult::failed(gene, m, technical, failure);
    };

    let sig = problem.variances(&theta);
    summarize(gene, kernels, &sig, technical, eval, iterations)
}

/// Without covariance terms the REML estimate of the total variance is the
/// sample variance; whatever exceeds the technical noise is residual.
fn fit_noise_only(gene: usize, problem: &RemlProblem) -> VarianceComponentResult {
    let residual = (problem.scale - problem.technical).max(0.0);
    let theta = Array1::from_elem(1, (residual / problem.scale).ln());
    match problem.evaluate(&theta) {
        Ok(eval) => summarize(gene, &[], &[residual], problem.technical, eval, 0),
        Err(e) => VarianceComponentResult::failed(
            gene,
            0,
            problem.technical,
            FitFailure::Numerical(e.to_string()),
        ),
    }
}

fn summarize(
    gene: usize,
    kernels: &[ArrayView2<f64>],
    sig: &[f64],
    technical: f64,
    eval: RemlEvaluation,
    iterations: usize,
) -> VarianceComponentResult {
    let m = kernels.len();
    let mut components: Vec<f64> = kernels
        .iter()
        .zip(sig)
        .map(|(kernel, s)| s * kernel.diag().mean().unwrap_or(0.0))
        .collect();
    components.push(sig[m] + technical);
    let total: f64 = components.iter().sum();

    if !(total > MIN_TOTAL_VARIANCE) || !total.is_finite() {
        return VarianceComponentResult::failed(gene, m, technical, FitFailure::Degenerate);
    }
    let weights: Vec<f64> = components.iter().map(|c| c / total).collect();
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return VarianceComponentResult::failed(gene, m, technical, FitFailure::Degenerate);
    }

    VarianceComponentResult {
        gene,
        weights,
        variances: sig[..m].to_vec(),
        residual_variance: sig[m],
        technical_variance: technical,
        mean: eval.mean,
        log_likelihood: eval.log_likelihood,
        converged: true,
        failure: None,
        iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SeedStrategy;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn factor_kernel(n: usize) -> Array2<f64> {
        let f = Array1::from_shape_fn(n, |i| {
            (2.0 * std::f64::consts::PI * i as f64 / n as f64).sin()
        });
        let mut k = Array2::from_shape_fn((n, n), |(i, j)| f[i] * f[j]);
        let mean_diag = k.diag().mean().unwrap();
        k /= mean_diag;
        k
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let n = 15;
        let mut rng = StdRng::seed_from_u64(3);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let k = factor_kernel(n);
        let y = Array1::from_shape_fn(n, |_| normal.sample(&mut rng) + 2.0);
        let kernels = [k.view()];
        let problem = RemlProblem::new(y.view(), &kernels, 0.1, 0.0);

        let theta = ndarray::array![-0.7, -1.2];
        let eval = problem.evaluate(&theta).unwrap();
        let h = 1e-6;
        for j in 0..theta.len() {
            let mut up = theta.clone();
            up[j] += h;
            let mut down = theta.clone();
            down[j] -= h;
            let numeric =
                (problem.evaluate(&up).unwrap().cost - problem.evaluate(&down).unwrap().cost)
                    / (2.0 * h);
            assert_abs_diff_eq!(eval.gradient[j], numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn factor_driven_gene_gets_most_weight_on_factor() {
        let n = 40;
        let mut rng = StdRng::seed_from_u64(11);
        let normal = Normal::new(0.0, 0.3).unwrap();
        let k = factor_kernel(n);
        let y = Array1::from_shape_fn(n, |i| {
            3.0 * (2.0 * std::f64::consts::PI * i as f64 / n as f64).sin()
                + normal.sample(&mut rng)
                + 5.0
        });
        let kernels = [k.view()];
        let result = fit_gene(0, y.view(), 0.0, &kernels, &EngineConfig::default());

        assert!(result.converged, "failure: {:?}", result.failure);
        assert_abs_diff_eq!(result.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(result.weights[0] > 0.8, "weights {:?}", result.weights);
        assert_abs_diff_eq!(result.mean, 5.0, epsilon = 0.5);
    }

    #[test]
    fn noise_only_fit_is_closed_form() {
        let y = ndarray::array![1.0, 2.0, 4.0, 7.0];
        let result = fit_gene(2, y.view(), 1.0, &[], &EngineConfig::default());
        let var = sample_variance(y.view());
        assert!(result.converged);
        assert_eq!(result.weights, vec![1.0]);
        assert_abs_diff_eq!(result.residual_variance, var - 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.technical_fraction(), 1.0 / var, epsilon = 1e-12);
        assert_abs_diff_eq!(result.mean, 3.5, epsilon = 1e-12);
    }

    #[test]
    fn constant_gene_is_degenerate() {
        let y = Array1::from_elem(10, 3.0);
        let k = factor_kernel(10);
        let result = fit_gene(4, y.view(), 0.0, &[k.view()], &EngineConfig::default());
        assert!(!result.converged);
        assert_eq!(result.failure, Some(FitFailure::Degenerate));
        assert!(result.weights.iter().all(|w| w.is_nan()));
        assert_eq!(result.gene, 4);
    }

    #[test]
    fn zero_time_budget_times_out() {
        let n = 12;
        let k = factor_kernel(n);
        let y = Array1::from_shape_fn(n, |i| (i as f64).sqrt());
        let mut config = EngineConfig::default();
        config.decomposition.timeout_secs = Some(0.0);
        config.decomposition.seed_strategy = SeedStrategy::Single;
        let result = fit_gene(0, y.view(), 0.0, &[k.view()], &config);
        assert_eq!(result.failure, Some(FitFailure::TimedOut));
    }
}
