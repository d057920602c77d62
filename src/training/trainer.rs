use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::Rng;

use crate::checkpoint::{
    fusion_name, CheckpointKind, CheckpointMetadata, CheckpointMetrics, CheckpointStore,
};
use crate::dashboard::Dashboard;
use crate::data::{DataLoader, ImageDataset};
use crate::error::TrainingError;
use crate::fusion::FusionObjective;
use crate::loss::Distillation;
use crate::model::{to_vec_f32, FusionGenerator, InvertibleBackbone};
use crate::training::metrics::{accuracy_topk, EpochMetrics, ThroughputMeter};
use crate::training::schedule::{LrPolicy, LrSchedule};

/// Fusion trainer configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f64,
    /// Adam first-moment decay.
    pub beta1: f64,
    /// Epochs of linear warm-up; 0 disables it.
    pub warmup_epochs: usize,
    pub lr_policy: LrPolicy,
    pub lr_step_epochs: usize,
    pub lr_gamma: f64,
    /// Print a progress line every this many iterations.
    pub log_steps: usize,
    /// Save a checkpoint every this many epochs.
    pub save_steps: usize,
    /// Epoch of the fusion checkpoint to resume from; also offsets the
    /// epochs written into new checkpoint names.
    pub resume_g: usize,
    pub kd_alpha: f64,
    pub kd_temperature: f64,
    pub mse_weight: f64,
    pub shuffle: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            epochs: 200,
            batch_size: 128,
            lr: 2e-4,
            beta1: 0.5,
            warmup_epochs: 1,
            lr_policy: LrPolicy::Constant,
            lr_step_epochs: 50,
            lr_gamma: 0.1,
            log_steps: 50,
            save_steps: 10,
            resume_g: 0,
            kd_alpha: 0.1,
            kd_temperature: 6.0,
            mse_weight: 0.0,
            shuffle: true,
        }
    }
}

/// Result of a finished training run.
pub struct TrainOutcome<F> {
    pub fnet: F,
    /// Every checkpoint written, in order.
    pub checkpoints: Vec<PathBuf>,
    /// Averages over the last epoch.
    pub last_epoch: CheckpointMetrics,
}

/// Trains a fusion network against a frozen invertible backbone.
pub struct FusionTrainer {
    config: TrainerConfig,
    nactors: usize,
    model_name: String,
    store: CheckpointStore,
    dashboard: Option<Dashboard>,
}

impl FusionTrainer {
    pub fn new(
        config: TrainerConfig,
        nactors: usize,
        model_name: &str,
        store: CheckpointStore,
    ) -> Result<Self, TrainingError> {
        if nactors < 2 {
            return Err(TrainingError::TooFewActors(nactors));
        }
        Ok(FusionTrainer {
            config,
            nactors,
            model_name: model_name.to_string(),
            store,
            dashboard: None,
        })
    }

    /// Post the mean training loss of every epoch to `dashboard`.
    pub fn with_dashboard(mut self, dashboard: Option<Dashboard>) -> Self {
        self.dashboard = dashboard;
        self
    }

    fn post_epoch_loss(&self, epoch: usize, loss: f32) {
        let Some(dashboard) = &self.dashboard else {
            return;
        };
        if let Err(e) = dashboard.append("train_loss", "loss", epoch as f64, loss as f64) {
            tracing::warn!(error = %e, "dashboard update failed");
        }
    }

    fn objective(&self) -> FusionObjective {
        FusionObjective {
            nactors: self.nactors,
            distillation: Distillation {
                alpha: self.config.kd_alpha as f32,
                temperature: self.config.kd_temperature as f32,
            },
            mse_weight: self.config.mse_weight as f32,
        }
    }

    fn save<B: Backend, F: Module<B>>(
        &self,
        fnet: &F,
        epoch: usize,
        metrics: &CheckpointMetrics,
    ) -> Result<PathBuf, TrainingError> {
        let name = fusion_name(&self.model_name, self.nactors);
        let metadata = CheckpointMetadata::new(CheckpointKind::Fusion, &name, epoch, &self.model_name)
            .with_nactors(self.nactors)
            .with_metrics(metrics.clone());
        Ok(self.store.save(fnet.clone(), &metadata)?)
    }

    /// Run the full training loop. Only `fnet` is updated; the caller is
    /// expected to have frozen the backbone parameters.
    pub fn train<B, M, F, R>(
        &self,
        backbone: &M,
        mut fnet: F,
        trainset: &ImageDataset,
        device: &B::Device,
        rng: &mut R,
    ) -> Result<TrainOutcome<F>, TrainingError>
    where
        B: AutodiffBackend,
        M: InvertibleBackbone<B>,
        F: AutodiffModule<B> + FusionGenerator<B>,
        R: Rng + ?Sized,
    {
        let cfg = &self.config;
        let loader = DataLoader::new(trainset, cfg.batch_size, cfg.shuffle);
        let steps = loader.num_batches();
        let schedule = LrSchedule::new(
            cfg.lr,
            steps,
            cfg.warmup_epochs,
            cfg.epochs,
            cfg.lr_policy,
            cfg.lr_step_epochs,
            cfg.lr_gamma,
        );
        let objective = self.objective();
        let num_classes = backbone.num_classes();
        let mut optim = AdamConfig::new().with_beta_1(cfg.beta1 as f32).init();

        let mut metrics = EpochMetrics::new();
        let mut throughput = ThroughputMeter::new();
        let mut checkpoints = Vec::new();

        println!("|  Train Epochs: {}", cfg.epochs);
        println!("|  Initial Learning Rate: {}", cfg.lr);
        tracing::info!(
            nactors = self.nactors,
            steps_per_epoch = steps,
            warmup_iters = schedule.warmup_iters(),
            "starting fusion training"
        );

        for epoch in 1..=cfg.epochs {
            metrics.reset();
            throughput.reset_window();

            for (batch_idx, batch) in loader.iter(rng).enumerate() {
                let started = Instant::now();
                let lr = schedule.lr_at((epoch - 1) * steps + batch_idx);
                let n = batch.len();

                let inputs = batch.images_tensor::<B>(device);
                let losses = objective.compute(backbone, &fnet, inputs, &batch.labels, rng);

                let loss = scalar(losses.total.clone());
                if !loss.is_finite() {
                    println!();
                    return Err(TrainingError::NonFiniteLoss {
                        epoch,
                        iteration: batch_idx,
                    });
                }
                let logits = to_vec_f32(losses.logits.clone().detach());
                metrics.loss.update(loss, n);
                metrics.top1.update(accuracy_topk(&logits, &batch.labels, num_classes, 1), n);
                metrics.top5.update(accuracy_topk(&logits, &batch.labels, num_classes, 5), n);
                metrics.distill.update(scalar(losses.distill.clone()), n);
                metrics.mse.update(scalar(losses.mse.clone()), n);

                let grads = losses.total.backward();
                let grads = GradientsParams::from_grads(grads, &fnet);
                fnet = optim.step(lr, fnet, grads);
                throughput.record_batch(started.elapsed(), n);

                if batch_idx % cfg.log_steps == 0 {
                    print!(
                        "\r| Epoch [{:3}/{:3}] Iter[{:3}/{:3}]\t\tLoss: {:.4} Acc@1: {:.3} Acc@5: {:.3} Distill: {:.3} MSE: {:.3}",
                        epoch,
                        cfg.epochs,
                        batch_idx + 1,
                        steps,
                        loss,
                        metrics.top1.avg(),
                        metrics.top5.avg(),
                        metrics.distill.val,
                        metrics.mse.val,
                    );
                    std::io::stdout().flush().ok();
                }
            }
            println!();

            let summary = snapshot(&metrics);
            tracing::info!(
                epoch,
                loss = summary.loss,
                top1 = summary.top1,
                top5 = summary.top5,
                batch_ms = throughput.avg_batch_ms(steps),
                images_per_sec = throughput.images_per_sec(),
                "epoch finished"
            );
            self.post_epoch_loss(cfg.resume_g + epoch, summary.loss);

            if epoch % cfg.save_steps == 0 {
                let t = Instant::now();
                let path = self.save::<B, F>(&fnet, cfg.resume_g + epoch, &summary)?;
                throughput.record_overhead(t.elapsed());
                println!("  >> Checkpoint saved: {}", path.display());
                checkpoints.push(path);
            }
        }

        let last_epoch = snapshot(&metrics);
        let path = self.save::<B, F>(&fnet, cfg.resume_g + cfg.epochs, &last_epoch)?;
        println!("  >> Final checkpoint: {}", path.display());
        checkpoints.push(path);

        Ok(TrainOutcome {
            fnet,
            checkpoints,
            last_epoch,
        })
    }
}

fn scalar<B: Backend>(t: Tensor<B, 1>) -> f32 {
    to_vec_f32(t).first().copied().unwrap_or(f32::NAN)
}

fn snapshot(metrics: &EpochMetrics) -> CheckpointMetrics {
    CheckpointMetrics {
        loss: metrics.loss.avg(),
        top1: metrics.top1.avg(),
        top5: metrics.top5.avg(),
        distill: metrics.distill.avg(),
        mse: metrics.mse.avg(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::epoch_stem;
    use crate::model::{BackboneConfig, FusionConfig, FusionNet, IResNet};
    use burn::backend::{Autodiff, NdArray};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_dataset(n: usize) -> ImageDataset {
        let mut rng = StdRng::seed_from_u64(0);
        let pixels: Vec<f32> = (0..n * 16).map(|_| rng.random_range(-1.0..1.0)).collect();
        let labels: Vec<usize> = (0..n).map(|i| i % 2).collect();
        ImageDataset::new([1, 4, 4], pixels, labels).unwrap()
    }

    fn tiny_backbone(device: &<TestBackend as Backend>::Device) -> IResNet<TestBackend> {
        BackboneConfig {
            n_blocks: vec![1],
            n_strides: vec![1],
            n_channels: vec![4],
            n_classes: 2,
            coeff: 0.5,
            power_iter: 2,
            inverse_iters: 5,
            actnorm: false,
            ..Default::default()
        }
        .init::<TestBackend>([1, 4, 4], device)
        .unwrap()
        .no_grad()
    }

    fn tiny_fnet(device: &<TestBackend as Backend>::Device) -> FusionNet<TestBackend> {
        FusionConfig {
            nactors: 2,
            input_nc: 1,
            output_nc: 1,
            ngf: 2,
            ..Default::default()
        }
        .init(device)
    }

    fn config(epochs: usize, save_steps: usize) -> TrainerConfig {
        TrainerConfig {
            epochs,
            batch_size: 4,
            lr: 1e-3,
            warmup_epochs: 0,
            log_steps: 1,
            save_steps,
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_single_actor() {
        let dir = tempfile::tempdir().unwrap();
        let result = FusionTrainer::new(
            TrainerConfig::default(),
            1,
            "mnist_default",
            CheckpointStore::new(dir.path()),
        );
        assert!(matches!(result, Err(TrainingError::TooFewActors(1))));
    }

    #[test]
    fn test_training_writes_periodic_and_final_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let mut cfg = config(3, 2);
        cfg.resume_g = 10;
        let trainer =
            FusionTrainer::new(cfg, 2, "mnist_default", CheckpointStore::new(dir.path())).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let outcome = trainer
            .train(
                &tiny_backbone(&device),
                tiny_fnet(&device),
                &tiny_dataset(8),
                &device,
                &mut rng,
            )
            .unwrap();

        let name = fusion_name("mnist_default", 2);
        let expected: Vec<PathBuf> = [12, 13]
            .iter()
            .map(|&e| dir.path().join(format!("{}.mpk", epoch_stem(&name, e))))
            .collect();
        assert_eq!(outcome.checkpoints, expected);
        for path in &expected {
            assert!(path.is_file());
        }
        assert!(outcome.last_epoch.loss.is_finite());
        assert!(outcome.last_epoch.top1 >= 0.0 && outcome.last_epoch.top1 <= 100.0);
    }

    #[test]
    fn test_each_epoch_loss_is_posted_to_dashboard() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let (dashboard_config, requests) = crate::dashboard::spawn_test_server();
        let dashboard = Dashboard::connect(&dashboard_config).unwrap();
        requests.recv().unwrap();

        let mut cfg = config(2, 5);
        cfg.resume_g = 3;
        let trainer = FusionTrainer::new(cfg, 2, "mnist_default", CheckpointStore::new(dir.path()))
            .unwrap()
            .with_dashboard(dashboard);
        let mut rng = StdRng::seed_from_u64(5);
        trainer
            .train(
                &tiny_backbone(&device),
                tiny_fnet(&device),
                &tiny_dataset(4),
                &device,
                &mut rng,
            )
            .unwrap();

        let posted: Vec<serde_json::Value> = requests
            .try_iter()
            .map(|r| serde_json::from_str(r.splitn(3, ' ').nth(2).unwrap()).unwrap())
            .collect();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0]["win"], "train_loss");
        assert_eq!(posted[0]["data"][0]["x"][0], 4.0);
        assert_eq!(posted[1]["data"][0]["x"][0], 5.0);
    }

    #[test]
    fn test_training_updates_only_the_fusion_net() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let trainer = FusionTrainer::new(
            config(1, 1),
            2,
            "mnist_default",
            CheckpointStore::new(dir.path()),
        )
        .unwrap();

        let backbone = tiny_backbone(&device);
        let fnet = tiny_fnet(&device);
        let sample = tiny_dataset(2).head(2).images_tensor::<TestBackend>(&device);
        let backbone_before = to_vec_f32(backbone.forward(sample.clone()).logits);

        let actors = sample.clone().unsqueeze_dim::<5>(1).repeat_dim(1, 2);
        let fnet_before = to_vec_f32(fnet.valid().fuse(actors.clone().inner()));

        let mut rng = StdRng::seed_from_u64(3);
        let outcome = trainer
            .train(&backbone, fnet, &tiny_dataset(8), &device, &mut rng)
            .unwrap();

        assert_eq!(backbone_before, to_vec_f32(backbone.forward(sample).logits));
        let fnet_after = to_vec_f32(outcome.fnet.valid().fuse(actors.inner()));
        assert_ne!(fnet_before, fnet_after);
    }
}
