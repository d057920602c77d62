use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::Path;

use burn::prelude::*;
use burn::tensor::{Int, TensorData};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::analysis::trace::{exact_trace, hutchinson_logdet, mean_std};
use crate::analysis::tsne::{self, TsneConfig};
use crate::analysis::{AnalysisConfig, FusionCheckpoint, FusionStats, Tester};
use crate::config::AppConfig;
use crate::dashboard::Dashboard;
use crate::data::{npy, Batch, ImageDataset};
use crate::error::AnalysisError;
use crate::fusion::{assemble_actors, recover_latent, sum_distractor_latents};
use crate::imaging::{save_grid, save_scatter};
use crate::loss::{mse, one_hot, soft_cross_entropy};
use crate::model::{argmax_rows, to_vec_f32, FusionConfig, FusionGenerator, InvertibleBackbone};
use crate::training::metrics::{accuracy_topk, AverageMeter};

const SCATTER_SIZE: u32 = 512;
const TRACE_CHUNK: usize = 256;

/// Loss and accuracy of the backbone on a split.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccuracyReport {
    pub loss: f32,
    pub top1: f32,
    pub top5: f32,
    pub count: usize,
}

/// Error of `inverse(encode(x))` against `x`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InversionReport {
    pub mse: f32,
    pub max_abs: f32,
    pub count: usize,
}

/// Accuracy of classifying latents recovered through a fusion network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionReport {
    pub top1: f32,
    pub top5: f32,
    /// Top-1 of the backbone on the unfused images.
    pub backbone_top1: f32,
    /// Percentage of rows where both predictions agree.
    pub agreement: f32,
    pub latent_mse: f32,
    pub count: usize,
}

/// `||encode(x + d) - encode(x)|| / ||d||` over a dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensitivityReport {
    pub mean_ratio: f32,
    pub max_ratio: f32,
    pub count: usize,
}

/// One residual block at one probe count.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRow {
    pub block: usize,
    pub samples: usize,
    pub trace_mean: f32,
    pub trace_std: f32,
    pub exact_trace: Option<f32>,
    pub logdet: f32,
}

/// Batches of the first `limit` items (all items when `limit` is 0), in
/// dataset order.
fn sequential_batches(dataset: &ImageDataset, batch_size: usize, limit: usize) -> impl Iterator<Item = Batch> + '_ {
    let limit = if limit == 0 {
        dataset.len()
    } else {
        limit.min(dataset.len())
    };
    let batch_size = batch_size.max(1);
    (0..limit).step_by(batch_size).map(move |start| {
        let indices: Vec<usize> = (start..(start + batch_size).min(limit)).collect();
        dataset.batch(&indices)
    })
}

fn scalar<B: Backend>(t: Tensor<B, 1>) -> f32 {
    to_vec_f32(t).first().copied().unwrap_or(f32::NAN)
}

fn row_norms<B: Backend>(t: Tensor<B, 4>) -> Vec<f32> {
    let [n, _, _, _] = t.dims();
    to_vec_f32(t.powf_scalar(2.0).reshape([n as i32, -1]).sum_dim(1).sqrt())
}

/// Mean of every row's latent and the latents of the next `nactors - 1`
/// rows, wrapping around the batch.
fn rolling_mean<B: Backend>(z: Tensor<B, 4>, nactors: usize) -> Tensor<B, 4> {
    let [n, _, _, _] = z.dims();
    let device = z.device();
    let mut sum = z.clone();
    for k in 1..nactors {
        let indices: Vec<i64> = (0..n).map(|i| ((i + k) % n) as i64).collect();
        let indices = Tensor::<B, 1, Int>::from_data(TensorData::new(indices, [n]), &device);
        sum = sum + z.clone().select(0, indices);
    }
    sum.div_scalar(nactors as f32)
}

fn write_lines(path: &Path, lines: impl IntoIterator<Item = String>) -> Result<(), AnalysisError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = BufWriter::new(File::create(path)?);
    for line in lines {
        writeln!(file, "{line}")?;
    }
    file.flush()?;
    Ok(())
}

/// The evaluation routines, run against a frozen backbone.
pub struct Evaluator<B: Backend, M: InvertibleBackbone<B>> {
    backbone: M,
    device: B::Device,
    config: AnalysisConfig,
    fusion: FusionConfig,
    batch_size: usize,
    dashboard: Option<Dashboard>,
    rng: StdRng,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: InvertibleBackbone<B>> Evaluator<B, M> {
    pub fn new(backbone: M, device: B::Device, config: &AppConfig, rng: StdRng) -> Self {
        Evaluator {
            backbone,
            device,
            config: config.analysis.clone(),
            fusion: config.fusion.clone(),
            batch_size: config.training.batch_size,
            dashboard: None,
            rng,
            _backend: PhantomData,
        }
    }

    pub fn with_dashboard(mut self, dashboard: Option<Dashboard>) -> Self {
        self.dashboard = dashboard;
        self
    }

    pub fn accuracy(&self, dataset: &ImageDataset) -> Result<AccuracyReport, AnalysisError> {
        let num_classes = self.backbone.num_classes();
        let (mut loss, mut top1, mut top5) = (AverageMeter::new(), AverageMeter::new(), AverageMeter::new());
        for batch in sequential_batches(dataset, self.batch_size, self.config.max_samples) {
            let n = batch.len();
            let out = self.backbone.forward(batch.images_tensor::<B>(&self.device));
            let targets = one_hot::<B>(&batch.labels, num_classes, &self.device);
            loss.update(scalar(soft_cross_entropy(out.logits.clone(), targets)), n);
            let logits = to_vec_f32(out.logits);
            top1.update(accuracy_topk(&logits, &batch.labels, num_classes, 1), n);
            top5.update(accuracy_topk(&logits, &batch.labels, num_classes, 5), n);
        }
        if loss.count == 0 {
            return Err(AnalysisError::NoSamples("evaluate"));
        }
        Ok(AccuracyReport {
            loss: loss.avg(),
            top1: top1.avg(),
            top5: top5.avg(),
            count: loss.count,
        })
    }

    pub fn inversion_error(&self, dataset: &ImageDataset) -> Result<InversionReport, AnalysisError> {
        let mut error = AverageMeter::new();
        let mut max_abs = 0.0f32;
        for batch in sequential_batches(dataset, self.batch_size, self.config.max_samples) {
            let x = batch.images_tensor::<B>(&self.device);
            let recon = self.backbone.inverse(self.backbone.encode(x.clone()));
            error.update(scalar(mse(x.clone(), recon.clone())), batch.len());
            max_abs = max_abs.max(scalar((x - recon).abs().max()));
        }
        if error.count == 0 {
            return Err(AnalysisError::NoSamples("test-inverse"));
        }
        Ok(InversionReport {
            mse: error.avg(),
            max_abs,
            count: error.count,
        })
    }

    /// Invert the mean latent of random `nactors`-tuples. Returns the fused
    /// targets and the actor stacks, both row-major.
    pub fn fused_targets(&mut self, dataset: &ImageDataset, nactors: usize) -> (Vec<f32>, Vec<f32>) {
        let mut targets = Vec::new();
        let mut inputs = Vec::new();
        for batch in sequential_batches(dataset, self.batch_size, self.config.max_samples) {
            let x = batch.images_tensor::<B>(&self.device);
            let stack = assemble_actors(x, nactors, &mut self.rng);
            let [n, k, c, h, w] = stack.actors.dims();
            let z = self
                .backbone
                .encode(stack.actors.clone().reshape([n * k, c, h, w]));
            let [_, zc, zh, zw] = z.dims();
            let mean = z.reshape([n, k, zc, zh, zw]).mean_dim(1).reshape([n, zc, zh, zw]);
            targets.extend(to_vec_f32(self.backbone.inverse(mean)));
            inputs.extend(to_vec_f32(stack.actors));
        }
        (targets, inputs)
    }

    pub fn fusion_accuracy(
        &mut self,
        testset: &ImageDataset,
        nactors: usize,
        fusion: &FusionCheckpoint,
    ) -> Result<FusionReport, AnalysisError> {
        let [channels, _, _] = testset.shape();
        let fnet = FusionConfig {
            nactors,
            input_nc: channels,
            output_nc: channels,
            ..self.fusion.clone()
        }
        .init::<B>(&self.device);
        let fnet = fusion.store.load::<B, _>(fnet, &fusion.stem, &self.device)?;
        let num_classes = self.backbone.num_classes();

        let mut top1 = AverageMeter::new();
        let mut top5 = AverageMeter::new();
        let mut backbone_top1 = AverageMeter::new();
        let mut agreement = AverageMeter::new();
        let mut latent_mse = AverageMeter::new();

        for batch in sequential_batches(testset, self.batch_size, self.config.max_samples) {
            let n = batch.len();
            let x = batch.images_tensor::<B>(&self.device);
            let stack = assemble_actors(x.clone(), nactors, &mut self.rng);

            let fused = fnet.fuse(stack.actors);
            let dims = fused.dims();
            let mut pixels = to_vec_f32(fused);
            fusion.stats.denormalize(&mut pixels, [dims[1], dims[2], dims[3]]);
            let fused = Tensor::<B, 4>::from_data(TensorData::new(pixels, dims), &self.device);

            let distractor_sum = sum_distractor_latents(self.backbone.encode(stack.distractors), nactors);
            let recovered = recover_latent(self.backbone.encode(fused), distractor_sum, nactors);
            let truth = self.backbone.forward(x);
            latent_mse.update(scalar(mse(truth.latent, recovered.clone())), n);

            let logits = to_vec_f32(self.backbone.classify(recovered));
            let teacher = to_vec_f32(truth.logits);
            top1.update(accuracy_topk(&logits, &batch.labels, num_classes, 1), n);
            top5.update(accuracy_topk(&logits, &batch.labels, num_classes, 5), n);
            backbone_top1.update(accuracy_topk(&teacher, &batch.labels, num_classes, 1), n);
            let agree = argmax_rows(&logits, num_classes)
                .iter()
                .zip(argmax_rows(&teacher, num_classes))
                .filter(|(a, b)| **a == *b)
                .count();
            agreement.update(100.0 * agree as f32 / n as f32, n);
        }
        if top1.count == 0 {
            return Err(AnalysisError::NoSamples("eval-fusion-net"));
        }
        Ok(FusionReport {
            top1: top1.avg(),
            top5: top5.avg(),
            backbone_top1: backbone_top1.avg(),
            agreement: agreement.avg(),
            latent_mse: latent_mse.avg(),
            count: top1.count,
        })
    }

    pub fn sensitivity(&mut self, data: &ImageDataset, eps: f64) -> Result<SensitivityReport, AnalysisError> {
        let mut ratios = Vec::new();
        for batch in sequential_batches(data, self.batch_size, self.config.max_samples) {
            let [c, h, w] = batch.shape;
            let n = batch.len();
            let noise: Vec<f32> = (0..batch.images.len())
                .map(|_| {
                    let v: f32 = self.rng.sample(StandardNormal);
                    v * eps as f32
                })
                .collect();
            let delta = Tensor::<B, 4>::from_data(TensorData::new(noise, [n, c, h, w]), &self.device);
            let x = batch.images_tensor::<B>(&self.device);
            let z0 = self.backbone.encode(x.clone());
            let z1 = self.backbone.encode(x + delta.clone());
            let dz = row_norms(z1 - z0);
            let dx = row_norms(delta);
            ratios.extend(dz.iter().zip(&dx).map(|(a, b)| a / b.max(f32::MIN_POSITIVE)));
        }
        if ratios.is_empty() {
            return Err(AnalysisError::NoSamples("eval-sensitivity"));
        }
        Ok(SensitivityReport {
            mean_ratio: ratios.iter().sum::<f32>() / ratios.len() as f32,
            max_ratio: ratios.iter().copied().fold(0.0, f32::max),
            count: ratios.len(),
        })
    }

    /// Flattened latents of up to `tsne_max_points` items embedded in 2-D.
    pub fn embed_latents(&mut self, subset: &ImageDataset) -> (Vec<[f32; 2]>, Vec<usize>) {
        let mut features = Vec::new();
        let mut labels = Vec::new();
        let mut dim = 0;
        for batch in sequential_batches(subset, self.batch_size, self.config.tsne_max_points) {
            let z = self.backbone.encode(batch.images_tensor::<B>(&self.device));
            let [_, c, h, w] = z.dims();
            dim = c * h * w;
            features.extend(to_vec_f32(z));
            labels.extend(batch.labels);
        }
        let tsne_config = TsneConfig {
            perplexity: self.config.tsne_perplexity,
            iterations: self.config.tsne_iterations,
            ..Default::default()
        };
        tracing::info!(points = labels.len(), dim, "running t-SNE");
        (tsne::embed(&features, dim, &tsne_config, &mut self.rng), labels)
    }

    /// Trace and log-determinant estimates of every residual branch at the
    /// first test image.
    pub fn trace_estimates(&mut self, testset: &ImageDataset) -> Result<Vec<TraceRow>, AnalysisError> {
        if testset.is_empty() {
            return Err(AnalysisError::NoSamples("trace-estimation"));
        }
        let x = testset.head(1).images_tensor::<B>(&self.device);
        let backbone = &self.backbone;
        let rng = &mut self.rng;
        let cfg = &self.config;

        let mut rows = Vec::new();
        for (block, h) in backbone.block_inputs(x).into_iter().enumerate() {
            let f = |t: Tensor<B, 4>| backbone.residual(block, t);
            let [_, c, hh, ww] = h.dims();
            let exact = (c * hh * ww <= cfg.trace_exact_max_dim).then(|| exact_trace(&f, &h, TRACE_CHUNK));
            for &samples in &cfg.trace_sample_counts {
                let estimates: Vec<f32> = (0..cfg.trace_repeats.max(1))
                    .map(|_| hutchinson_logdet(&f, &h, 1, samples, rng)[0])
                    .collect();
                let (trace_mean, trace_std) = mean_std(&estimates);
                let logdet = hutchinson_logdet(&f, &h, cfg.trace_series_terms.max(1), samples, rng)[0];
                tracing::debug!(block, samples, trace_mean, trace_std, "trace estimate");
                rows.push(TraceRow {
                    block,
                    samples,
                    trace_mean,
                    trace_std,
                    exact_trace: exact,
                    logdet,
                });
            }
        }
        Ok(rows)
    }

    /// Invert evenly spaced points on the segment between the latents of the
    /// first two test images. Returns the images and their predicted labels.
    pub fn interpolation(&self, testset: &ImageDataset) -> Result<(Vec<f32>, Vec<usize>), AnalysisError> {
        if testset.len() < 2 {
            return Err(AnalysisError::NoSamples("interpolate"));
        }
        let z = self
            .backbone
            .encode(testset.batch(&[0, 1]).images_tensor::<B>(&self.device));
        let start = z.clone().narrow(0, 0, 1);
        let end = z.narrow(0, 1, 1);
        let steps = self.config.interpolation_steps.max(2);
        let points: Vec<Tensor<B, 4>> = (0..steps)
            .map(|i| {
                let t = i as f32 / (steps - 1) as f32;
                start.clone().mul_scalar(1.0 - t) + end.clone().mul_scalar(t)
            })
            .collect();
        let path = Tensor::cat(points, 0);
        let logits = to_vec_f32(self.backbone.classify(path.clone()));
        let predictions = argmax_rows(&logits, self.backbone.num_classes());
        Ok((to_vec_f32(self.backbone.inverse(path)), predictions))
    }

    fn post_accuracy(&self, epoch: usize, report: &AccuracyReport) {
        let Some(dashboard) = &self.dashboard else {
            return;
        };
        let series = [("top1", vec![report.top1 as f64]), ("top5", vec![report.top5 as f64])];
        if let Err(e) = dashboard.line("test_accuracy", "Test accuracy", &[epoch as f64], &series) {
            tracing::warn!(error = %e, "dashboard update failed");
        }
    }
}

impl<B: Backend, M: InvertibleBackbone<B>> Tester for Evaluator<B, M> {
    fn test(&mut self, testset: &ImageDataset, epoch: usize, log_path: &Path) -> Result<(), AnalysisError> {
        let report = self.accuracy(testset)?;
        println!(
            "| Validation Epoch #{}\t\t\tLoss: {:.4} Acc@1: {:.2}% Acc@5: {:.2}%",
            epoch, report.loss, report.top1, report.top5
        );
        let mut log = OpenOptions::new().create(true).append(true).open(log_path)?;
        writeln!(log, "{}\t{:.4}\t{:.3}\t{:.3}", epoch, report.loss, report.top1, report.top5)?;
        self.post_accuracy(epoch, &report);
        Ok(())
    }

    fn eval_invertibility(
        &mut self,
        testset: &ImageDataset,
        nactors: usize,
        out_dir: &Path,
        prefix: &str,
        extension: &str,
    ) -> Result<(), AnalysisError> {
        let batch = testset.head(self.config.grid_images.max(1));
        if batch.is_empty() {
            return Err(AnalysisError::NoSamples("eval-invertibility"));
        }
        let x = batch.images_tensor::<B>(&self.device);
        let z = self.backbone.encode(x.clone());
        let recon = self.backbone.inverse(z.clone());
        let fused = self.backbone.inverse(rolling_mean(z, nactors));

        let error = scalar(mse(x.clone(), recon.clone()));
        let max_abs = scalar((x.clone() - recon.clone()).abs().max());
        println!("| Invertibility: MSE {error:.6}  max error {max_abs:.6}");

        for (kind, images) in [("original", x), ("reconstructed", recon), ("fused", fused)] {
            let path = out_dir.join(format!("{prefix}_{kind}.{extension}"));
            save_grid(&path, &to_vec_f32(images), batch.shape, self.config.grid_rows)?;
            tracing::info!(path = %path.display(), "wrote grid");
        }
        Ok(())
    }

    fn generate_inversed_images(
        &mut self,
        trainset: &ImageDataset,
        nactors: usize,
        out_path: &Path,
    ) -> Result<(), AnalysisError> {
        let (targets, inputs) = self.fused_targets(trainset, nactors);
        let [c, h, w] = trainset.shape();
        let count = targets.len() / (c * h * w).max(1);
        if count == 0 {
            return Err(AnalysisError::NoSamples("sample-images"));
        }

        npy::write_f32(out_path, &targets, &[count, c, h, w])?;
        let stem = out_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let inputs_path = out_path.with_file_name(format!("{stem}_inputs.npy"));
        npy::write_f32(&inputs_path, &inputs, &[count, nactors, c, h, w])?;
        let stats_path = out_path.with_extension("json");
        FusionStats::compute(&targets, [c, h, w]).save(&stats_path)?;

        println!("| Fused targets: {} -> {}", count, out_path.display());
        tracing::info!(
            inputs = %inputs_path.display(),
            stats = %stats_path.display(),
            "wrote fusion dataset"
        );
        Ok(())
    }

    fn evaluate_fusion_net(
        &mut self,
        testset: &ImageDataset,
        nactors: usize,
        fusion: &FusionCheckpoint,
    ) -> Result<(), AnalysisError> {
        let report = self.fusion_accuracy(testset, nactors, fusion)?;
        println!(
            "| Fusion net ({} actors): Acc@1: {:.2}% Acc@5: {:.2}% | backbone Acc@1: {:.2}% | agreement: {:.2}% | latent MSE: {:.6}",
            nactors, report.top1, report.top5, report.backbone_top1, report.agreement, report.latent_mse
        );
        Ok(())
    }

    fn eval_sensitivity(&mut self, data: &ImageDataset, eps: f64) -> Result<(), AnalysisError> {
        let report = self.sensitivity(data, eps)?;
        println!(
            "| Sensitivity (eps {}): mean {:.4} max {:.4} over {} images",
            eps, report.mean_ratio, report.max_ratio, report.count
        );
        Ok(())
    }

    fn test_inversed_images(&mut self, subset: &ImageDataset) -> Result<(), AnalysisError> {
        let report = self.inversion_error(subset)?;
        println!(
            "| Inverse test: MSE {:.6} max error {:.6} over {} images",
            report.mse, report.max_abs, report.count
        );
        Ok(())
    }

    fn plot_latent(
        &mut self,
        subset: &ImageDataset,
        num_classes: usize,
        out_dir: &Path,
        extension: &str,
    ) -> Result<(), AnalysisError> {
        let (points, labels) = self.embed_latents(subset);
        let csv = out_dir.join(format!("latent_tsne_{num_classes}.csv"));
        write_lines(
            &csv,
            std::iter::once("x,y,label".to_string()).chain(
                points
                    .iter()
                    .zip(&labels)
                    .map(|(p, label)| format!("{},{},{}", p[0], p[1], label)),
            ),
        )?;
        let figure = out_dir.join(format!("latent_tsne_{num_classes}.{extension}"));
        save_scatter(&figure, &points, &labels, SCATTER_SIZE)?;
        println!("| t-SNE of {} latents -> {}", points.len(), figure.display());
        Ok(())
    }

    fn analyse_trace_estimation(
        &mut self,
        testset: &ImageDataset,
        out_dir: &Path,
        _extension: &str,
    ) -> Result<(), AnalysisError> {
        let rows = self.trace_estimates(testset)?;
        for row in &rows {
            println!(
                "| block {:2} samples {:4}: trace {:.4} +- {:.4} (exact {}) logdet {:.4}",
                row.block,
                row.samples,
                row.trace_mean,
                row.trace_std,
                row.exact_trace.map_or("-".to_string(), |t| format!("{t:.4}")),
                row.logdet
            );
        }
        let csv = out_dir.join("trace_estimation.csv");
        write_lines(
            &csv,
            std::iter::once("block,samples,trace_mean,trace_std,exact_trace,logdet".to_string()).chain(
                rows.iter().map(|r| {
                    format!(
                        "{},{},{},{},{},{}",
                        r.block,
                        r.samples,
                        r.trace_mean,
                        r.trace_std,
                        r.exact_trace.map_or(String::new(), |t| t.to_string()),
                        r.logdet
                    )
                }),
            ),
        )?;
        tracing::info!(path = %csv.display(), "wrote trace estimates");
        Ok(())
    }

    fn spectral_norms(&mut self) -> Result<Vec<f32>, AnalysisError> {
        Ok(self.backbone.spectral_norms())
    }

    fn interpolate(
        &mut self,
        testset: &ImageDataset,
        out_dir: &Path,
        prefix: &str,
        extension: &str,
    ) -> Result<(), AnalysisError> {
        let (images, predictions) = self.interpolation(testset)?;
        println!(
            "| Interpolating label {} -> {}: predicted {:?}",
            testset.label(0),
            testset.label(1),
            predictions
        );
        let path = out_dir.join(format!("{prefix}_interpolation.{extension}"));
        save_grid(&path, &images, testset.shape(), predictions.len())?;
        Ok(())
    }
}
