use cellfactor::{ExpressionMatrix, TechnicalNoise};
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One period of a sine wave over the cells, mean zero.
pub fn sinusoid(n_cells: usize) -> Array1<f64> {
    Array1::from_shape_fn(n_cells, |i| {
        (2.0 * std::f64::consts::PI * i as f64 / n_cells as f64).sin()
    })
}

/// Cells x genes where the first `factor_genes` genes follow the sinusoid
/// with random loadings and small noise, and the rest are pure noise.
pub fn synthetic_expression(
    n_cells: usize,
    n_genes: usize,
    factor_genes: usize,
    factor_noise_sd: f64,
    seed: u64,
) -> (ExpressionMatrix, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let factor = sinusoid(n_cells);
    let loading = Uniform::new(1.5, 2.5);
    let offset = Uniform::new(2.0, 6.0);
    let factor_noise = Normal::new(0.0, factor_noise_sd).unwrap();
    let pure_noise = Normal::new(0.0, 1.0).unwrap();

    let mut values = Array2::<f64>::zeros((n_cells, n_genes));
    for (g, mut column) in values.columns_mut().into_iter().enumerate() {
        let base = offset.sample(&mut rng);
        if g < factor_genes {
            let a = loading.sample(&mut rng);
            for (i, v) in column.iter_mut().enumerate() {
                *v = base + a * factor[i] + factor_noise.sample(&mut rng);
            }
        } else {
            for v in column.iter_mut() {
                *v = base + pure_noise.sample(&mut rng);
            }
        }
    }
    (ExpressionMatrix::new(values).unwrap(), factor)
}

pub fn constant_noise(n_genes: usize, value: f64) -> TechnicalNoise {
    TechnicalNoise::new(Array1::from_elem(n_genes, value)).unwrap()
}

pub fn correlation(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    let a = a - a.mean().unwrap();
    let b = b - b.mean().unwrap();
    a.dot(&b) / (a.dot(&a).sqrt() * b.dot(&b).sqrt())
}
