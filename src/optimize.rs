//! Box-constrained differential evolution (best/1/bin with dithered
//! mutation), used by the amplitude calibrator. Deliberately small: fixed
//! strategy, binomial crossover, convergence when the population cost spread
//! collapses relative to its mean.

use rand::Rng;

pub(crate) struct DeConfig {
    pub max_generations: usize,
    /// Population members per problem dimension.
    pub population_per_dim: usize,
    pub crossover: f64,
    pub tol: f64,
}

impl Default for DeConfig {
    fn default() -> Self {
        Self {
            max_generations: 300,
            population_per_dim: 15,
            crossover: 0.7,
            tol: 0.01,
        }
    }
}

/// Minimize `objective` over the box `bounds`; returns the best point and its
/// cost.
pub(crate) fn differential_evolution<F, R>(
    objective: F,
    bounds: &[(f64, f64)],
    config: &DeConfig,
    rng: &mut R,
) -> (Vec<f64>, f64)
where
    F: Fn(&[f64]) -> f64,
    R: Rng + ?Sized,
{
    let dim = bounds.len();
    let population_size = (config.population_per_dim * dim).max(5);

    let mut population: Vec<Vec<f64>> = (0..population_size)
        .map(|_| {
            bounds
                .iter()
                .map(|&(lo, hi)| rng.gen_range(lo..=hi))
                .collect()
        })
        .collect();
    let mut costs: Vec<f64> = population.iter().map(|member| objective(member)).collect();

    let mut best = argmin(&costs);
    let mut trial = vec![0.0; dim];

    for _ in 0..config.max_generations {
        // Dithered mutation factor, redrawn each generation.
        let mutation = rng.gen_range(0.5..1.0);

        for i in 0..population_size {
            let (r1, r2) = distinct_pair(population_size, i, rng);
            let forced = rng.gen_range(0..dim);
            for d in 0..dim {
                trial[d] = if d == forced || rng.gen_range(0.0..1.0) < config.crossover {
                    let value = population[best][d]
                        + mutation * (population[r1][d] - population[r2][d]);
                    value.clamp(bounds[d].0, bounds[d].1)
                } else {
                    population[i][d]
                };
            }
            let cost = objective(&trial);
            if cost <= costs[i] {
                population[i].copy_from_slice(&trial);
                costs[i] = cost;
                if cost < costs[best] {
                    best = i;
                }
            }
        }

        let mean = costs.iter().sum::<f64>() / population_size as f64;
        let variance = costs
            .iter()
            .map(|&c| (c - mean) * (c - mean))
            .sum::<f64>()
            / population_size as f64;
        if variance.sqrt() <= config.tol * mean.abs() {
            break;
        }
    }

    (population[best].clone(), costs[best])
}

fn argmin(costs: &[f64]) -> usize {
    let mut best = 0;
    for (i, &cost) in costs.iter().enumerate() {
        if cost < costs[best] {
            best = i;
        }
    }
    best
}

fn distinct_pair<R: Rng + ?Sized>(size: usize, exclude: usize, rng: &mut R) -> (usize, usize) {
    let r1 = loop {
        let candidate = rng.gen_range(0..size);
        if candidate != exclude {
            break candidate;
        }
    };
    let r2 = loop {
        let candidate = rng.gen_range(0..size);
        if candidate != exclude && candidate != r1 {
            break candidate;
        }
    };
    (r1, r2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn minimizes_a_shifted_sphere() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let objective =
            |x: &[f64]| (x[0] - 0.3) * (x[0] - 0.3) + (x[1] + 1.2) * (x[1] + 1.2) + 0.5;
        let bounds = [(-2.0, 2.0), (-2.0, 2.0)];
        let (x, cost) = differential_evolution(objective, &bounds, &DeConfig::default(), &mut rng);
        assert!(approx_eq!(f64, x[0], 0.3, epsilon = 1e-2));
        assert!(approx_eq!(f64, x[1], -1.2, epsilon = 1e-2));
        assert!(cost < 0.5 + 1e-3);
    }

    #[test]
    fn optimum_on_the_boundary_is_reachable() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let objective = |x: &[f64]| -x[0];
        let bounds = [(0.0, 1.0)];
        let (x, _) = differential_evolution(objective, &bounds, &DeConfig::default(), &mut rng);
        assert!(x[0] > 0.99, "got {}", x[0]);
    }
}
