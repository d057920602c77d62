use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Running average of a scalar weighted by batch size.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    pub val: f32,
    pub sum: f64,
    pub count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record `val` observed over `n` samples.
    pub fn update(&mut self, val: f32, n: usize) {
        self.val = val;
        self.sum += val as f64 * n as f64;
        self.count += n;
    }

    pub fn avg(&self) -> f32 {
        if self.count == 0 {
            return 0.0;
        }
        (self.sum / self.count as f64) as f32
    }
}

/// Percentage of rows whose label is among the `k` largest logits.
///
/// `k` is capped at the number of classes. A label outside the row counts
/// as a miss.
pub fn accuracy_topk(logits: &[f32], labels: &[usize], num_classes: usize, k: usize) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let k = k.min(num_classes);
    let hits = logits
        .chunks(num_classes)
        .zip(labels.iter())
        .filter(|(row, label)| {
            let Some(&target) = row.get(**label) else {
                return false;
            };
            // rank = number of classes scoring strictly higher
            row.iter().filter(|&&v| v > target).count() < k
        })
        .count();
    100.0 * hits as f32 / labels.len() as f32
}

/// Per-epoch meters owned by the trainer.
#[derive(Debug, Clone, Default)]
pub struct EpochMetrics {
    pub loss: AverageMeter,
    pub top1: AverageMeter,
    pub top5: AverageMeter,
    pub distill: AverageMeter,
    pub mse: AverageMeter,
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Per-batch timing tracker for profiling the training loop.
pub struct ThroughputMeter {
    batch_micros: VecDeque<u64>,
    capacity: usize,
    window_start: Instant,
    window_images: usize,
    window_overhead_micros: u128, // checkpoint time excluded from throughput
}

impl ThroughputMeter {
    pub fn with_capacity(capacity: usize) -> Self {
        ThroughputMeter {
            batch_micros: VecDeque::with_capacity(capacity),
            capacity,
            window_start: Instant::now(),
            window_images: 0,
            window_overhead_micros: 0,
        }
    }

    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn record_batch(&mut self, d: Duration, images: usize) {
        self.batch_micros.push_back(d.as_micros() as u64);
        if self.batch_micros.len() > self.capacity {
            self.batch_micros.pop_front();
        }
        self.window_images += images;
    }

    /// Record time spent saving checkpoints so it is excluded from the
    /// throughput window.
    pub fn record_overhead(&mut self, d: Duration) {
        self.window_overhead_micros += d.as_micros();
    }

    /// Mean of the last `last_n` batch times in milliseconds.
    pub fn avg_batch_ms(&self, last_n: usize) -> f32 {
        let n = self.batch_micros.len().min(last_n);
        if n == 0 {
            return 0.0;
        }
        let mean = self
            .batch_micros
            .iter()
            .rev()
            .take(n)
            .map(|&v| v as f64)
            .sum::<f64>()
            / n as f64;
        (mean / 1000.0) as f32
    }

    /// Images per second since the last `reset_window` call.
    pub fn images_per_sec(&self) -> f32 {
        let total_micros = self.window_start.elapsed().as_micros();
        let net_micros = total_micros.saturating_sub(self.window_overhead_micros);
        if net_micros == 0 {
            return 0.0;
        }
        self.window_images as f32 / (net_micros as f32 / 1_000_000.0)
    }

    pub fn reset_window(&mut self) {
        self.window_start = Instant::now();
        self.window_images = 0;
        self.window_overhead_micros = 0;
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}
