use std::f64::consts::PI;

/// Learning-rate policy applied once warm-up is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrPolicy {
    Constant,
    /// Multiply by `gamma` every `step_epochs` epochs.
    Step,
    /// Decay linearly to zero at the last iteration.
    Linear,
    Cosine,
}

/// Per-iteration learning rate: a linear warm-up ramp followed by a steady
/// policy.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    base_lr: f64,
    warmup_iters: usize,
    total_iters: usize,
    policy: LrPolicy,
    step_iters: usize,
    gamma: f64,
}

impl LrSchedule {
    pub fn new(
        base_lr: f64,
        steps_per_epoch: usize,
        warmup_epochs: usize,
        epochs: usize,
        policy: LrPolicy,
        step_epochs: usize,
        gamma: f64,
    ) -> Self {
        let steps_per_epoch = steps_per_epoch.max(1);
        LrSchedule {
            base_lr,
            warmup_iters: warmup_epochs * steps_per_epoch,
            total_iters: epochs * steps_per_epoch,
            policy,
            step_iters: step_epochs.max(1) * steps_per_epoch,
            gamma,
        }
    }

    pub fn warmup_iters(&self) -> usize {
        self.warmup_iters
    }

    pub fn is_warming_up(&self, iter: usize) -> bool {
        self.warmup_iters > 0 && iter <= self.warmup_iters
    }

    /// Learning rate for global iteration `iter` (0-based across epochs).
    pub fn lr_at(&self, iter: usize) -> f64 {
        if self.is_warming_up(iter) {
            return self.base_lr * iter as f64 / self.warmup_iters as f64;
        }
        let steady = iter.saturating_sub(self.warmup_iters);
        let span = self.total_iters.saturating_sub(self.warmup_iters).max(1);
        let progress = (steady as f64 / span as f64).min(1.0);
        match self.policy {
            LrPolicy::Constant => self.base_lr,
            LrPolicy::Step => self.base_lr * self.gamma.powi((steady / self.step_iters) as i32),
            LrPolicy::Linear => self.base_lr * (1.0 - progress),
            LrPolicy::Cosine => self.base_lr * 0.5 * (1.0 + (PI * progress).cos()),
        }
    }
}
