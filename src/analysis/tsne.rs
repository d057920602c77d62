//! Exact t-SNE for small point sets (O(n^2) memory and time per iteration).

use rand::Rng;
use rand_distr::StandardNormal;

#[derive(Debug, Clone, Copy)]
pub struct TsneConfig {
    pub perplexity: f32,
    pub iterations: usize,
    pub learning_rate: f32,
    /// Iterations during which the affinities are exaggerated.
    pub exaggeration_iters: usize,
    pub exaggeration: f32,
}

impl Default for TsneConfig {
    fn default() -> Self {
        TsneConfig {
            perplexity: 30.0,
            iterations: 500,
            learning_rate: 200.0,
            exaggeration_iters: 100,
            exaggeration: 4.0,
        }
    }
}

fn squared_distances(data: &[f32], dim: usize) -> Vec<f32> {
    let n = data.len() / dim;
    let mut d = vec![0.0f32; n * n];
    for i in 0..n {
        let a = &data[i * dim..(i + 1) * dim];
        for j in (i + 1)..n {
            let b = &data[j * dim..(j + 1) * dim];
            let dist: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
            d[i * n + j] = dist;
            d[j * n + i] = dist;
        }
    }
    d
}

/// Row-conditional affinities whose entropy matches `log(perplexity)`,
/// found by bisection on the Gaussian precision, then symmetrized.
fn joint_probabilities(distances: &[f32], n: usize, perplexity: f32) -> Vec<f32> {
    let target = perplexity.min((n - 1) as f32).max(1.0).ln();
    let mut p = vec![0.0f32; n * n];
    let mut row = vec![0.0f32; n];

    for i in 0..n {
        let d = &distances[i * n..(i + 1) * n];
        let (mut beta, mut lo, mut hi) = (1.0f32, 0.0f32, f32::INFINITY);
        for _ in 0..64 {
            let min_d = (0..n)
                .filter(|&j| j != i)
                .map(|j| d[j])
                .fold(f32::INFINITY, f32::min);
            let mut sum = 0.0f32;
            for j in 0..n {
                row[j] = if j == i { 0.0 } else { (-(d[j] - min_d) * beta).exp() };
                sum += row[j];
            }
            let sum = sum.max(f32::MIN_POSITIVE);
            let mut entropy = 0.0f32;
            for j in 0..n {
                row[j] /= sum;
                if row[j] > 1e-12 {
                    entropy -= row[j] * row[j].ln();
                }
            }
            let gap = entropy - target;
            if gap.abs() < 1e-5 {
                break;
            }
            if gap > 0.0 {
                lo = beta;
                beta = if hi.is_finite() { (beta + hi) / 2.0 } else { beta * 2.0 };
            } else {
                hi = beta;
                beta = (beta + lo) / 2.0;
            }
        }
        p[i * n..(i + 1) * n].copy_from_slice(&row);
    }

    let mut joint = vec![0.0f32; n * n];
    let norm = 2.0 * n as f32;
    for i in 0..n {
        for j in 0..n {
            joint[i * n + j] = ((p[i * n + j] + p[j * n + i]) / norm).max(1e-12);
        }
    }
    joint
}

/// Embed `n` points of dimension `dim` (row-major in `data`) into the plane.
pub fn embed<R: Rng + ?Sized>(data: &[f32], dim: usize, config: &TsneConfig, rng: &mut R) -> Vec<[f32; 2]> {
    let n = if dim == 0 { 0 } else { data.len() / dim };
    if n < 2 {
        return vec![[0.0, 0.0]; n];
    }
    let p = joint_probabilities(&squared_distances(data, dim), n, config.perplexity);

    let mut y: Vec<[f32; 2]> = (0..n)
        .map(|_| {
            let a: f32 = rng.sample(StandardNormal);
            let b: f32 = rng.sample(StandardNormal);
            [a * 1e-4, b * 1e-4]
        })
        .collect();
    let mut velocity = vec![[0.0f32; 2]; n];
    let mut gains = vec![[1.0f32; 2]; n];
    let mut num = vec![0.0f32; n * n];

    for iter in 0..config.iterations {
        let exaggeration = if iter < config.exaggeration_iters {
            config.exaggeration
        } else {
            1.0
        };
        let momentum = if iter < 250 { 0.5 } else { 0.8 };

        // Student-t kernel
        let mut sum_q = 0.0f32;
        for i in 0..n {
            for j in (i + 1)..n {
                let dx = y[i][0] - y[j][0];
                let dy = y[i][1] - y[j][1];
                let q = 1.0 / (1.0 + dx * dx + dy * dy);
                num[i * n + j] = q;
                num[j * n + i] = q;
                sum_q += 2.0 * q;
            }
        }
        let sum_q = sum_q.max(f32::MIN_POSITIVE);

        for i in 0..n {
            let mut grad = [0.0f32; 2];
            for j in 0..n {
                if i == j {
                    continue;
                }
                let q = num[i * n + j];
                let coeff = 4.0 * (exaggeration * p[i * n + j] - (q / sum_q).max(1e-12)) * q;
                grad[0] += coeff * (y[i][0] - y[j][0]);
                grad[1] += coeff * (y[i][1] - y[j][1]);
            }
            for k in 0..2 {
                let same_sign = (grad[k] > 0.0) == (velocity[i][k] > 0.0);
                gains[i][k] = if same_sign {
                    (gains[i][k] * 0.8).max(0.01)
                } else {
                    gains[i][k] + 0.2
                };
                velocity[i][k] = momentum * velocity[i][k] - config.learning_rate * gains[i][k] * grad[k];
            }
        }
        for (point, v) in y.iter_mut().zip(velocity.iter()) {
            point[0] += v[0];
            point[1] += v[1];
        }

        let mean = y.iter().fold([0.0f32; 2], |acc, p| [acc[0] + p[0], acc[1] + p[1]]);
        for point in y.iter_mut() {
            point[0] -= mean[0] / n as f32;
            point[1] -= mean[1] / n as f32;
        }
    }
    y
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn centroid(points: &[[f32; 2]]) -> [f32; 2] {
        let s = points.iter().fold([0.0, 0.0], |a, p| [a[0] + p[0], a[1] + p[1]]);
        [s[0] / points.len() as f32, s[1] / points.len() as f32]
    }

    fn dist(a: [f32; 2], b: [f32; 2]) -> f32 {
        ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
    }

    #[test]
    fn test_separates_two_clusters() {
        let mut rng = StdRng::seed_from_u64(4);
        let noise = Normal::new(0.0f32, 0.1).unwrap();
        let dim = 5;
        let mut data = Vec::new();
        for i in 0..30 {
            let center = if i < 15 { 0.0 } else { 10.0 };
            for _ in 0..dim {
                data.push(center + noise.sample(&mut rng));
            }
        }
        let config = TsneConfig {
            perplexity: 5.0,
            iterations: 300,
            learning_rate: 50.0,
            ..Default::default()
        };
        let y = embed(&data, dim, &config, &mut rng);
        assert_eq!(y.len(), 30);
        assert!(y.iter().all(|p| p[0].is_finite() && p[1].is_finite()));

        let (a, b) = y.split_at(15);
        let (ca, cb) = (centroid(a), centroid(b));
        let spread = a
            .iter()
            .map(|&p| dist(p, ca))
            .chain(b.iter().map(|&p| dist(p, cb)))
            .fold(0.0f32, f32::max);
        assert!(dist(ca, cb) > spread, "clusters overlap: {} vs {}", dist(ca, cb), spread);
    }

    #[test]
    fn test_joint_probabilities_sum_to_one() {
        let data = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 5.0, 5.0];
        let p = joint_probabilities(&squared_distances(&data, 2), 4, 2.0);
        let total: f32 = (0..4)
            .flat_map(|i| (0..4).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| p[i * 4 + j])
            .sum();
        assert!((total - 1.0).abs() < 1e-3, "total {total}");
    }

    #[test]
    fn test_degenerate_inputs() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(embed(&[], 3, &TsneConfig::default(), &mut rng).is_empty());
        assert_eq!(embed(&[1.0, 2.0], 2, &TsneConfig::default(), &mut rng).len(), 1);
    }
}
