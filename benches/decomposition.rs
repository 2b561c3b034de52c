use cellfactor::decompose::variance_decomposition;
use cellfactor::factor::{CovarianceMatrix, CovarianceTerm};
use cellfactor::{EngineConfig, ExpressionMatrix, TechnicalNoise};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn synthetic(n_cells: usize, n_genes: usize) -> (ExpressionMatrix, Vec<CovarianceTerm>) {
    let mut rng = StdRng::seed_from_u64(0x5EED_CE11 + n_cells as u64);
    let factor = Array1::from_shape_fn(n_cells, |i| {
        (2.0 * std::f64::consts::PI * i as f64 / n_cells as f64).sin()
    });
    let values = Array2::from_shape_fn((n_cells, n_genes), |(i, g)| {
        let loading = if g % 3 == 0 { 1.5 } else { 0.0 };
        loading * factor[i] + rng.gen_range(-1.0..1.0)
    });
    let kernel = CovarianceMatrix::from_latent(factor.view().insert_axis(Axis(1)))
        .expect("sinusoid kernel");
    (
        ExpressionMatrix::new(values).expect("finite expression"),
        vec![CovarianceTerm::standalone("cell_cycle", kernel)],
    )
}

fn benchmark_decomposition(c: &mut Criterion) {
    let config = EngineConfig::default();
    let n_genes = 32;

    let mut group = c.benchmark_group("variance_decomposition");
    group.sample_size(10);
    for n_cells in [50_usize, 100, 200] {
        let (expression, terms) = synthetic(n_cells, n_genes);
        let noise = TechnicalNoise::zeros(n_genes);
        let genes: Vec<usize> = (0..n_genes).collect();
        group.throughput(Throughput::Elements(n_genes as u64));

        group.bench_with_input(BenchmarkId::new("cells", n_cells), &n_cells, |b, _| {
            b.iter(|| {
                let batch = variance_decomposition(
                    black_box(&expression),
                    &noise,
                    &terms,
                    &genes,
                    &config,
                )
                .expect("decomposition");
                black_box(batch);
            });
        });
    }
    group.finish();
}

criterion_group!(decomposition, benchmark_decomposition);
criterion_main!(decomposition);
