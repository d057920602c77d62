//! Actor-stack assembly and the algebraic latent cancellation.
//!
//! Every original image is fused with `nactors - 1` distractors drawn from
//! the same batch. Because the backbone latent of the fused image is trained
//! to be the mean of the actor latents, the original latent is recovered as
//! `nactors * z_fused - sum(z_distractors)`.

use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::{Int, TensorData};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::loss::{binary_cross_entropy, mse, one_hot, Distillation};
use crate::model::{FusionGenerator, InvertibleBackbone};

/// Tensors produced for one batch of originals.
#[derive(Debug, Clone)]
pub struct ActorStack<B: Backend> {
    /// `[N, nactors, C, H, W]`; each row holds its original image at a
    /// random actor position.
    pub actors: Tensor<B, 5>,
    /// `[(nactors - 1) * N, C, H, W]`, grouped distractor-major.
    pub distractors: Tensor<B, 4>,
}

fn index_tensor<B: Backend>(indices: Vec<i64>, device: &B::Device) -> Tensor<B, 1, Int> {
    let len = indices.len();
    Tensor::from_data(TensorData::new(indices, [len]), device)
}

/// Build the distractors and the shuffled actor stack for `inputs`.
///
/// The batch is duplicated `nactors - 1` times and the duplicates are
/// permuted as a whole, so each original is paired with random batch mates.
pub fn assemble_actors<B: Backend, R: Rng + ?Sized>(
    inputs: Tensor<B, 4>,
    nactors: usize,
    rng: &mut R,
) -> ActorStack<B> {
    let [n, c, h, w] = inputs.dims();
    let device = inputs.device();
    let k = nactors - 1;

    let repeated = Tensor::cat(vec![inputs.clone(); k], 0);
    let mut perm: Vec<i64> = (0..(k * n) as i64).collect();
    perm.shuffle(rng);
    let distractors = repeated.select(0, index_tensor::<B>(perm, &device));

    let grouped = distractors.clone().reshape([k, n, c, h, w]).swap_dims(0, 1);
    let stacked = Tensor::cat(vec![inputs.unsqueeze_dim::<5>(1), grouped], 1);

    let mut order: Vec<i64> = (0..nactors as i64).collect();
    order.shuffle(rng);
    let actors = stacked.select(1, index_tensor::<B>(order, &device));

    ActorStack {
        actors,
        distractors,
    }
}

/// Sum distractor latents `[(nactors - 1) * N, ...]` into `[N, ...]`.
pub fn sum_distractor_latents<B: Backend>(latents: Tensor<B, 4>, nactors: usize) -> Tensor<B, 4> {
    let [kn, c, h, w] = latents.dims();
    let k = nactors - 1;
    let n = kn / k;
    latents.reshape([k, n, c, h, w]).sum_dim(0).reshape([n, c, h, w])
}

/// `nactors * fused_latent - distractor_sum`.
pub fn recover_latent<B: Backend>(
    fused_latent: Tensor<B, 4>,
    distractor_sum: Tensor<B, 4>,
    nactors: usize,
) -> Tensor<B, 4> {
    fused_latent.mul_scalar(nactors as f32) - distractor_sum
}

/// Loss terms of one fusion step. Only `total` is differentiated.
#[derive(Debug, Clone)]
pub struct StepLosses<B: Backend> {
    pub total: Tensor<B, 1>,
    pub distill: Tensor<B, 1>,
    pub classify: Tensor<B, 1>,
    pub mse: Tensor<B, 1>,
    /// Logits of the recovered latents, `[N, num_classes]`.
    pub logits: Tensor<B, 2>,
}

/// The objective optimized by the fusion trainer.
#[derive(Debug, Clone, Copy)]
pub struct FusionObjective {
    pub nactors: usize,
    pub distillation: Distillation,
    /// Weight of the latent MSE term in `total`; 0 only logs it.
    pub mse_weight: f32,
}

impl FusionObjective {
    /// Run the fuse / encode / cancel / classify chain on one batch.
    ///
    /// Backbone outputs on the original and distractor images are detached;
    /// gradients reach the fusion network through the fused image only.
    pub fn compute<B, M, F, R>(
        &self,
        backbone: &M,
        fnet: &F,
        inputs: Tensor<B, 4>,
        labels: &[usize],
        rng: &mut R,
    ) -> StepLosses<B>
    where
        B: Backend,
        M: InvertibleBackbone<B>,
        F: FusionGenerator<B>,
        R: Rng + ?Sized,
    {
        let device = inputs.device();
        let stack = assemble_actors(inputs.clone(), self.nactors, rng);

        let distractor_sum =
            sum_distractor_latents(backbone.encode(stack.distractors).detach(), self.nactors);
        let teacher = backbone.forward(inputs);
        let teacher_logits = teacher.logits.detach();
        let true_latent = teacher.latent.detach();

        let fused = fnet.fuse(stack.actors);
        let recovered = recover_latent(backbone.encode(fused), distractor_sum, self.nactors);
        let logits = backbone.classify(recovered.clone());

        let targets = one_hot::<B>(labels, backbone.num_classes(), &device);
        let distill = self
            .distillation
            .loss(logits.clone(), targets.clone(), teacher_logits);
        let classify = binary_cross_entropy(softmax(logits.clone(), 1), targets);
        let mse = mse(true_latent, recovered);
        let total = distill.clone() + classify.clone() + mse.clone().mul_scalar(self.mse_weight);

        StepLosses {
            total,
            distill,
            classify,
            mse,
            logits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::to_vec_f32;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    /// Batch of `n` single-pixel images whose value is `index + 1`.
    fn constant_images(n: usize) -> Tensor<TestBackend, 4> {
        let data: Vec<f32> = (0..n).map(|i| (i + 1) as f32).collect();
        Tensor::from_data(TensorData::new(data, [n, 1, 1, 1]), &Default::default())
    }

    #[test]
    fn test_assemble_shapes() {
        let mut rng = StdRng::seed_from_u64(3);
        let stack = assemble_actors(constant_images(4), 3, &mut rng);
        assert_eq!(stack.actors.dims(), [4, 3, 1, 1, 1]);
        assert_eq!(stack.distractors.dims(), [8, 1, 1, 1]);
    }

    #[test]
    fn test_every_row_contains_its_original() {
        let mut rng = StdRng::seed_from_u64(11);
        let n = 5;
        let stack = assemble_actors(constant_images(n), 3, &mut rng);
        let actors = to_vec_f32(stack.actors);
        for row in 0..n {
            let values = &actors[row * 3..(row + 1) * 3];
            assert!(
                values.contains(&((row + 1) as f32)),
                "row {row} lost its original: {values:?}"
            );
        }
    }

    #[test]
    fn test_distractors_are_a_permutation_of_duplicates() {
        let mut rng = StdRng::seed_from_u64(5);
        let stack = assemble_actors(constant_images(3), 3, &mut rng);
        let mut values = to_vec_f32(stack.distractors);
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn test_actor_stack_matches_distractor_sum() {
        let mut rng = StdRng::seed_from_u64(9);
        let inputs = constant_images(4);
        let stack = assemble_actors(inputs.clone(), 3, &mut rng);
        let row_sums = to_vec_f32(stack.actors.sum_dim(1).reshape([4]));
        let distractor_sums =
            to_vec_f32(sum_distractor_latents(stack.distractors, 3).reshape([4]));
        let originals = to_vec_f32(inputs.reshape([4]));
        for i in 0..4 {
            assert!((row_sums[i] - (originals[i] + distractor_sums[i])).abs() < 1e-6);
        }
    }

    /// Backbone whose latent is all ones and whose logits are all zero.
    struct ConstantBackbone;

    impl InvertibleBackbone<TestBackend> for ConstantBackbone {
        fn encode(&self, x: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
            let [n, _, _, _] = x.dims();
            Tensor::ones([n, 1, 1, 1], &x.device())
        }

        fn classify(&self, z: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 2> {
            let [n, _, _, _] = z.dims();
            Tensor::zeros([n, 2], &z.device())
        }

        fn inverse(&self, z: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
            z
        }

        fn num_classes(&self) -> usize {
            2
        }

        fn in_shapes(&self) -> Vec<[usize; 3]> {
            vec![[1, 1, 1]]
        }
    }

    /// Returns the first actor unchanged.
    struct FirstActor;

    impl FusionGenerator<TestBackend> for FirstActor {
        fn fuse(&self, actors: Tensor<TestBackend, 5>) -> Tensor<TestBackend, 4> {
            let [n, _, c, h, w] = actors.dims();
            actors.narrow(1, 0, 1).reshape([n, c, h, w])
        }
    }

    #[test]
    fn test_step_loss_with_stub_networks() {
        let mut rng = StdRng::seed_from_u64(1);
        let objective = FusionObjective {
            nactors: 2,
            distillation: Distillation {
                alpha: 0.1,
                temperature: 6.0,
            },
            mse_weight: 0.0,
        };
        let losses = objective.compute(
            &ConstantBackbone,
            &FirstActor,
            constant_images(4),
            &[0, 1, 1, 0],
            &mut rng,
        );
        let ln2 = 2.0f32.ln();
        // identical logits: KL vanishes, CE on uniform logits is ln 2
        assert!((to_vec_f32(losses.distill)[0] - 0.1 * ln2).abs() < 1e-5);
        assert!((to_vec_f32(losses.classify)[0] - ln2).abs() < 1e-5);
        // 2 * 1 - 1 recovers the constant latent exactly
        assert!(to_vec_f32(losses.mse)[0].abs() < 1e-6);
        assert!((to_vec_f32(losses.total)[0] - 1.1 * ln2).abs() < 1e-5);
        assert_eq!(losses.logits.dims(), [4, 2]);
    }

    #[test]
    fn test_mse_weight_enters_total() {
        struct ShiftedBackbone;
        impl InvertibleBackbone<TestBackend> for ShiftedBackbone {
            fn encode(&self, x: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
                x
            }
            fn classify(&self, z: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 2> {
                let [n, _, _, _] = z.dims();
                Tensor::zeros([n, 2], &z.device())
            }
            fn inverse(&self, z: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
                z
            }
            fn num_classes(&self) -> usize {
                2
            }
            fn in_shapes(&self) -> Vec<[usize; 3]> {
                Vec::new()
            }
        }

        let objective = |mse_weight| FusionObjective {
            nactors: 2,
            distillation: Distillation {
                alpha: 0.1,
                temperature: 6.0,
            },
            mse_weight,
        };
        let unweighted = objective(0.0).compute(
            &ShiftedBackbone,
            &FirstActor,
            constant_images(3),
            &[0, 1, 0],
            &mut StdRng::seed_from_u64(2),
        );
        let weighted = objective(0.5).compute(
            &ShiftedBackbone,
            &FirstActor,
            constant_images(3),
            &[0, 1, 0],
            &mut StdRng::seed_from_u64(2),
        );
        let mse = to_vec_f32(weighted.mse)[0];
        let gap = to_vec_f32(weighted.total)[0] - to_vec_f32(unweighted.total)[0];
        assert!((gap - 0.5 * mse).abs() < 1e-5);
    }

    #[test]
    fn test_recover_latent_identity() {
        let device = Default::default();
        let fused = Tensor::<TestBackend, 4>::random([2, 3, 2, 2], Distribution::Normal(0.0, 1.0), &device);
        let sum = Tensor::<TestBackend, 4>::random([2, 3, 2, 2], Distribution::Normal(0.0, 1.0), &device);
        let recovered = to_vec_f32(recover_latent(fused.clone(), sum.clone(), 4));
        let fused = to_vec_f32(fused);
        let sum = to_vec_f32(sum);
        for i in 0..recovered.len() {
            assert!((4.0 * fused[i] - sum[i] - recovered[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_recovery_inverts_averaging() {
        let device = Default::default();
        let z = Tensor::<TestBackend, 4>::random([6, 2, 1, 1], Distribution::Normal(0.0, 1.0), &device);
        // originals are rows 0..2, two distractor groups follow
        let originals = z.clone().narrow(0, 0, 2);
        let distractors = z.clone().narrow(0, 2, 4);
        let sum = sum_distractor_latents(distractors, 3);
        let mean = (originals.clone() + sum.clone()).div_scalar(3.0);
        let recovered = to_vec_f32(recover_latent(mean, sum, 3));
        for (a, b) in recovered.iter().zip(to_vec_f32(originals).iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
