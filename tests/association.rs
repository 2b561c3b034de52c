mod common;

use cellfactor::assoc::{LmmFit, PairTarget, PairwiseAssociation, lmm};
use cellfactor::decompose::split_into_shards;
use cellfactor::session::ParentFactor;
use cellfactor::{EngineConfig, ExpressionMatrix, Session, TechnicalNoise};
use common::{init_logging, synthetic_expression};
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

fn ols_slope(y: &Array1<f64>, x: &Array1<f64>) -> f64 {
    let x_mean = x.mean().unwrap();
    let y_mean = y.mean().unwrap();
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - x_mean) * (b - y_mean)).sum();
    let sxx: f64 = x.iter().map(|a| (a - x_mean).powi(2)).sum();
    sxy / sxx
}

#[test]
fn lmm_without_kernels_reproduces_least_squares() {
    init_logging();
    let n = 25;
    let mut rng = StdRng::seed_from_u64(101);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let x = Array1::from_shape_fn(n, |_| normal.sample(&mut rng) * 2.0 + 1.0);
    let y = Array1::from_shape_fn(n, |i| 0.7 * x[i] - 3.0 + normal.sample(&mut rng));
    let mut values = Array2::<f64>::zeros((n, 2));
    values.column_mut(0).assign(&y);
    values.column_mut(1).assign(&x);
    let expression = ExpressionMatrix::new(values).unwrap();
    let noise = TechnicalNoise::new(ndarray::array![0.2, 0.1]).unwrap();

    let mut config = EngineConfig::default();
    config.association.standardize = false;
    let fit = lmm(&expression, &noise, None, &[0], &PairTarget::Reference(1), &config).unwrap();
    assert!(fit.converged[[0, 0]]);
    assert!((fit.beta[[0, 0]] - ols_slope(&y, &x)).abs() < 1e-8);
    assert!(fit.covariance_terms.is_empty());

    config.association.standardize = true;
    let fit = lmm(&expression, &noise, None, &[0], &PairTarget::Reference(1), &config).unwrap();
    let r = ols_slope(&y, &x) * x.std(1.0) / y.std(1.0);
    assert!((fit.beta[[0, 0]] - r).abs() < 1e-8);
    assert!(fit.p_values[[0, 0]] < 1e-3);
}

#[test]
fn factor_induced_correlation_disappears_after_correction() {
    init_logging();
    let (expression, _) = synthetic_expression(40, 14, 12, 0.3, 55);
    let mut session =
        Session::new(expression, TechnicalNoise::zeros(14), EngineConfig::default()).unwrap();
    session.add_gene_set("cycling", (0..10).collect()).unwrap();
    session
        .fit_factor("cell_cycle", "cycling", 1, false, ParentFactor::None)
        .unwrap();

    let association = session
        .associate(&[10, 11, 12, 13], &PairTarget::AllSelected)
        .unwrap();
    let corrected = &association.corrected;
    let uncorrected = &association.uncorrected;
    assert_eq!(corrected.beta.dim(), (4, 4));
    assert_eq!(corrected.covariance_terms, vec!["cell_cycle".to_string()]);

    // genes 10 and 11 both carry the factor
    assert!(uncorrected.converged[[0, 1]]);
    assert!(uncorrected.p_values[[0, 1]] < 1e-4);
    assert!(corrected.converged[[0, 1]]);
    assert!(corrected.p_values[[0, 1]] > uncorrected.p_values[[0, 1]]);
    assert!(corrected.beta[[0, 1]].abs() < uncorrected.beta[[0, 1]].abs());

    for i in 0..4 {
        assert!(!corrected.converged[[i, i]]);
        assert!(uncorrected.p_values[[i, i]].is_nan());
    }
    assert_eq!(uncorrected.tested_pairs(), 12);
}

#[test]
fn sharded_responses_merge_into_the_full_association() {
    init_logging();
    let (expression, _) = synthetic_expression(30, 12, 8, 0.3, 77);
    let mut session =
        Session::new(expression, TechnicalNoise::zeros(12), EngineConfig::default()).unwrap();
    session.add_gene_set("cycling", (0..8).collect()).unwrap();
    session
        .fit_factor("cell_cycle", "cycling", 1, false, ParentFactor::None)
        .unwrap();

    let responses: Vec<usize> = (6..12).collect();
    let target = PairTarget::Predictors(vec![6, 7, 9, 11]);
    let full = session.associate(&responses, &target).unwrap();
    let shards = split_into_shards(&responses, 3).unwrap();
    let parts: Vec<PairwiseAssociation> = shards
        .iter()
        .rev()
        .map(|shard| session.associate(shard, &target).unwrap())
        .collect();
    let merged = PairwiseAssociation::merge(parts).unwrap();

    for (a, b) in [
        (&merged.corrected, &full.corrected),
        (&merged.uncorrected, &full.uncorrected),
    ] {
        assert_eq!(a.responses, b.responses);
        assert_eq!(a.predictors, b.predictors);
        assert_eq!(a.covariance_terms, b.covariance_terms);
        assert_eq!(a.converged, b.converged);
        for (x, y) in a.beta.iter().zip(&b.beta) {
            assert!((x.is_nan() && y.is_nan()) || (x - y).abs() < 1e-10, "{x} vs {y}");
        }
        for (x, y) in a.p_values.iter().zip(&b.p_values) {
            assert!((x.is_nan() && y.is_nan()) || (x - y).abs() < 1e-10, "{x} vs {y}");
        }
    }
    assert!(!merged.corrected.converged[[0, 0]]);

    let overlapping = vec![full.corrected.clone(), full.corrected.clone()];
    assert!(LmmFit::merge(overlapping).is_err());
}
