//! Stochastic trace and log-determinant estimates for residual branches.
//!
//! Jacobian-vector products are taken by central differences, so any
//! forward-only branch can be probed.

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::model::to_vec_f32;

const FD_STEP: f32 = 1e-3;

fn max_abs<B: Backend>(t: &Tensor<B, 4>) -> f32 {
    to_vec_f32(t.clone().abs().max())
        .first()
        .copied()
        .unwrap_or(0.0)
}

/// `J_f(h) v` by central differences, with the step taken along the
/// normalized direction.
pub fn jvp<B, F>(f: &F, h: &Tensor<B, 4>, v: Tensor<B, 4>) -> Tensor<B, 4>
where
    B: Backend,
    F: Fn(Tensor<B, 4>) -> Tensor<B, 4>,
{
    let scale = max_abs(&v);
    if scale == 0.0 {
        return v;
    }
    let dir = v.div_scalar(scale).mul_scalar(FD_STEP);
    let forward = f(h.clone() + dir.clone());
    let backward = f(h.clone() - dir);
    (forward - backward).mul_scalar(scale / (2.0 * FD_STEP))
}

fn gaussian_like<B: Backend, R: Rng + ?Sized>(shape: [usize; 4], device: &B::Device, rng: &mut R) -> Tensor<B, 4> {
    let len = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_data(TensorData::new(data, shape), device)
}

/// Per-row sum of `a * b` over every non-batch axis.
fn row_dot<B: Backend>(a: Tensor<B, 4>, b: Tensor<B, 4>) -> Vec<f32> {
    let [n, _, _, _] = a.dims();
    to_vec_f32((a * b).reshape([n as i32, -1]).sum_dim(1))
}

/// Hutchinson estimate of `log det(I + J_f(h))` for every row of `h`, using
/// the first `terms` terms of the power series and `samples` Gaussian
/// probes. With `terms == 1` this is the trace of `J_f`.
pub fn hutchinson_logdet<B, F, R>(f: &F, h: &Tensor<B, 4>, terms: usize, samples: usize, rng: &mut R) -> Vec<f32>
where
    B: Backend,
    F: Fn(Tensor<B, 4>) -> Tensor<B, 4>,
    R: Rng + ?Sized,
{
    let shape = h.dims();
    let mut totals = vec![0.0f32; shape[0]];
    for _ in 0..samples {
        let v = gaussian_like::<B, R>(shape, &h.device(), rng);
        let mut w = v.clone();
        for k in 1..=terms {
            w = jvp(f, h, w);
            let sign = if k % 2 == 1 { 1.0 } else { -1.0 };
            for (total, dot) in totals.iter_mut().zip(row_dot(v.clone(), w.clone())) {
                *total += sign * dot / k as f32;
            }
        }
    }
    totals.iter().map(|t| t / samples.max(1) as f32).collect()
}

/// Exact trace of `J_f` at a single point `h` (`[1, C, H, W]`), probing
/// every basis direction in chunks.
pub fn exact_trace<B, F>(f: &F, h: &Tensor<B, 4>, chunk: usize) -> f32
where
    B: Backend,
    F: Fn(Tensor<B, 4>) -> Tensor<B, 4>,
{
    let [_, c, hh, ww] = h.dims();
    let d = c * hh * ww;
    let device = h.device();
    let chunk = chunk.max(1);
    let mut trace = 0.0f32;
    let mut start = 0;
    while start < d {
        let len = chunk.min(d - start);
        let mut basis = vec![0.0f32; len * d];
        for i in 0..len {
            basis[i * d + start + i] = 1.0;
        }
        let basis = Tensor::<B, 4>::from_data(TensorData::new(basis, [len, c, hh, ww]), &device);
        let point = h.clone().repeat_dim(0, len);
        let step = basis.clone().mul_scalar(FD_STEP);
        let diff = (f(point.clone() + step.clone()) - f(point - step)).div_scalar(2.0 * FD_STEP);
        trace += row_dot(basis, diff).iter().sum::<f32>();
        start += len;
    }
    trace
}

/// Mean and population standard deviation.
pub fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    fn point() -> Tensor<TestBackend, 4> {
        Tensor::random([1, 4, 2, 2], Distribution::Normal(0.0, 1.0), &Default::default())
    }

    #[test]
    fn test_exact_trace_of_scaling() {
        let f = |x: Tensor<TestBackend, 4>| x.mul_scalar(0.5);
        let trace = exact_trace(&f, &point(), 5);
        assert!((trace - 8.0).abs() < 1e-2, "trace {trace}");
    }

    #[test]
    fn test_exact_trace_of_elementwise_square() {
        // J = diag(2h), trace = 2 * sum(h)
        let h = point();
        let expected = 2.0 * to_vec_f32(h.clone()).iter().sum::<f32>();
        let f = |x: Tensor<TestBackend, 4>| x.clone() * x;
        let trace = exact_trace(&f, &h, 16);
        assert!((trace - expected).abs() < 1e-2, "{trace} vs {expected}");
    }

    #[test]
    fn test_hutchinson_trace_is_unbiased() {
        let mut rng = StdRng::seed_from_u64(21);
        let f = |x: Tensor<TestBackend, 4>| x.mul_scalar(0.5);
        let estimate = hutchinson_logdet(&f, &point(), 1, 2000, &mut rng);
        assert_eq!(estimate.len(), 1);
        assert!((estimate[0] - 8.0).abs() < 0.5, "estimate {}", estimate[0]);
    }

    #[test]
    fn test_series_approaches_logdet() {
        let mut rng = StdRng::seed_from_u64(5);
        let f = |x: Tensor<TestBackend, 4>| x.mul_scalar(0.5);
        let estimate = hutchinson_logdet(&f, &point(), 10, 2000, &mut rng);
        let expected = 16.0 * 1.5f32.ln();
        assert!((estimate[0] - expected).abs() < 0.5, "{} vs {expected}", estimate[0]);
    }

    #[test]
    fn test_mean_std() {
        let (m, s) = mean_std(&[1.0, 3.0]);
        assert!((m - 2.0).abs() < 1e-6);
        assert!((s - 1.0).abs() < 1e-6);
        assert_eq!(mean_std(&[]), (0.0, 0.0));
    }
}
