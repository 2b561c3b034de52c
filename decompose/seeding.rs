use crate::config::SeedStrategy;
use ndarray::Array1;
use std::collections::HashSet;

fn clamp_to_bounds(value: f64, bounds: (f64, f64)) -> f64 {
    let (lo, hi) = if bounds.0 <= bounds.1 {
        bounds
    } else {
        (bounds.1, bounds.0)
    };
    value.clamp(lo, hi)
}

/// A seed putting `share` of the variance on `dominant` and splitting the rest
/// evenly over the other parameters.
fn dominated_seed(
    num_params: usize,
    dominant: usize,
    share: f64,
    bounds: (f64, f64),
) -> Array1<f64> {
    let others = (num_params - 1).max(1) as f64;
    Array1::from_shape_fn(num_params, |i| {
        let fraction = if i == dominant { share } else { (1.0 - share) / others };
        clamp_to_bounds(fraction.ln(), bounds)
    })
}

/// Starting points for a per-gene REML fit with `num_terms` covariance terms
/// plus the trailing noise term, as log-variances relative to the gene's
/// sample variance.
pub fn generate_log_variance_seeds(
    num_terms: usize,
    strategy: SeedStrategy,
    bounds: (f64, f64),
) -> Vec<Array1<f64>> {
    let num_params = num_terms + 1;
    let mut seeds = Vec::new();

    let equal = clamp_to_bounds((1.0 / num_params as f64).ln(), bounds);
    seeds.push(Array1::from_elem(num_params, equal));

    if matches!(strategy, SeedStrategy::Light | SeedStrategy::Exhaustive) {
        seeds.push(dominated_seed(num_params, num_terms, 0.9, bounds));
    }

    if strategy == SeedStrategy::Exhaustive {
        for term in 0..num_terms {
            seeds.push(dominated_seed(num_params, term, 0.8, bounds));
        }
    }

    let mut seen: HashSet<Vec<u64>> = HashSet::new();
    let mut unique: Vec<Array1<f64>> = Vec::with_capacity(seeds.len());
    for s in seeds.into_iter() {
        let key: Vec<u64> = s.iter().map(|&v| v.to_bits()).collect();
        if seen.insert(key) {
            unique.push(s);
        }
    }

    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn seed_counts_follow_strategy() {
        let bounds = (-8.0, 0.0);
        assert_eq!(generate_log_variance_seeds(2, SeedStrategy::Single, bounds).len(), 1);
        assert_eq!(generate_log_variance_seeds(2, SeedStrategy::Light, bounds).len(), 2);
        assert_eq!(generate_log_variance_seeds(2, SeedStrategy::Exhaustive, bounds).len(), 4);
    }

    #[test]
    fn seeds_are_clamped_and_deduplicated() {
        let seeds = generate_log_variance_seeds(1, SeedStrategy::Exhaustive, (-1.0, -1.0));
        assert_eq!(seeds.len(), 1);
        assert!(seeds[0].iter().all(|&v| v == -1.0));

        let seeds = generate_log_variance_seeds(3, SeedStrategy::Light, (-8.0, 0.0));
        assert_abs_diff_eq!(seeds[0][0], 0.25_f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(seeds[1][3], 0.9_f64.ln(), epsilon = 1e-12);
    }
}
