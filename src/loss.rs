//! Loss functions used by the fusion trainer.
//!
//! Reductions follow the usual framework defaults: elementwise means over
//! every entry unless stated otherwise.

use burn::prelude::*;
use burn::tensor::activation::{log_softmax, softmax};
use burn::tensor::TensorData;

/// Row-wise one-hot encoding of `labels` as a `[N, num_classes]` tensor.
/// Labels `>= num_classes` leave their row zero.
pub fn one_hot<B: Backend>(labels: &[usize], num_classes: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut data = vec![0.0f32; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        if label < num_classes {
            data[row * num_classes + label] = 1.0;
        }
    }
    Tensor::from_data(TensorData::new(data, [labels.len(), num_classes]), device)
}

/// Mean cross-entropy of `logits` against a target distribution.
pub fn soft_cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    let [n, _] = logits.dims();
    (targets * log_softmax(logits, 1)).sum().neg().div_scalar(n as f32)
}

/// Mean binary cross-entropy between probabilities and targets, with the
/// logarithms clamped at -100.
pub fn binary_cross_entropy<B: Backend>(probs: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    let log_p = probs.clone().log().clamp_min(-100.0);
    let log_not_p = probs.neg().add_scalar(1.0).log().clamp_min(-100.0);
    let not_targets = targets.clone().neg().add_scalar(1.0);
    (targets * log_p + not_targets * log_not_p).mean().neg()
}

/// Mean KL divergence `KL(target || exp(log_input))`, averaged over every
/// element.
pub fn kl_div<B: Backend>(log_input: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    let log_target = target.clone().clamp_min(1e-12).log();
    (target * (log_target - log_input)).mean()
}

/// Mean squared error.
pub fn mse<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, 1> {
    (a - b).powf_scalar(2.0).mean()
}

/// Knowledge-distillation hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct Distillation {
    /// Weight of the hard-label cross-entropy term.
    pub alpha: f32,
    pub temperature: f32,
}

impl Distillation {
    /// `(1 - alpha) * T^2 * KL(softmax(teacher / T) || softmax(student / T))
    ///  + alpha * CE(student, labels)`.
    pub fn loss<B: Backend>(
        &self,
        student: Tensor<B, 2>,
        labels: Tensor<B, 2>,
        teacher: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let t = self.temperature;
        let beta = (1.0 - self.alpha) * t * t;
        let soft_student = log_softmax(student.clone().div_scalar(t), 1);
        let soft_teacher = softmax(teacher.div_scalar(t), 1);
        let teacher_term = kl_div(soft_student, soft_teacher).mul_scalar(beta);
        let student_term = soft_cross_entropy(student, labels).mul_scalar(self.alpha);
        teacher_term + student_term
    }
}
