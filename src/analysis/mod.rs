//! Evaluation modes and the dispatcher that runs at most one of them.
//!
//! [`analyse`] resolves paths, subsets and required files, then hands off to
//! a [`Tester`]. [`Evaluator`] is the tester used by the binary.

mod evaluator;
mod mode;
mod stats;
pub mod trace;
pub mod tsne;

pub use evaluator::{
    AccuracyReport, Evaluator, FusionReport, InversionReport, SensitivityReport, TraceRow,
};
pub use mode::{resolve_mode, AnalysisFlags, AnalysisMode};
pub use stats::FusionStats;

use std::path::{Path, PathBuf};

use crate::checkpoint::{fusion_eval_name, CheckpointStore};
use crate::data::npy;
use crate::data::ImageDataset;
use crate::error::AnalysisError;
use crate::experiment::{Experiment, ExperimentPaths};

/// Settings of the evaluation routines.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Mode to run; takes precedence over `flags`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<AnalysisMode>,
    pub flags: AnalysisFlags,
    /// Scale of the Gaussian input perturbation in the sensitivity test.
    pub eps: f64,
    /// File extension of written figures.
    pub extension: String,
    /// Images per grid row in sample figures.
    pub grid_rows: usize,
    /// Images shown in the invertibility grids.
    pub grid_images: usize,
    /// Class kept by the inverse test.
    pub inverse_label: usize,
    /// Labels `< tsne_classes` are embedded.
    pub tsne_classes: usize,
    /// Cap on embedded points (exact t-SNE is quadratic).
    pub tsne_max_points: usize,
    pub tsne_perplexity: f32,
    pub tsne_iterations: usize,
    pub interpolation_steps: usize,
    /// Probe counts compared by the trace estimation.
    pub trace_sample_counts: Vec<usize>,
    /// Independent estimates per probe count.
    pub trace_repeats: usize,
    /// Power-series terms of the log-determinant estimate.
    pub trace_series_terms: usize,
    /// Blocks with more input dimensions skip the exact trace.
    pub trace_exact_max_dim: usize,
    /// Limit on images processed by a routine; 0 uses the whole split.
    pub max_samples: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            mode: None,
            flags: AnalysisFlags::default(),
            eps: 0.01,
            extension: "png".to_string(),
            grid_rows: 8,
            grid_images: 32,
            inverse_label: 1,
            tsne_classes: 7,
            tsne_max_points: 1000,
            tsne_perplexity: 30.0,
            tsne_iterations: 500,
            interpolation_steps: 8,
            trace_sample_counts: vec![1, 10, 100],
            trace_repeats: 5,
            trace_series_terms: 5,
            trace_exact_max_dim: 1024,
            max_samples: 0,
        }
    }
}

/// A fusion checkpoint ready to be loaded, with its normalization statistics.
#[derive(Debug, Clone)]
pub struct FusionCheckpoint {
    pub store: CheckpointStore,
    pub stem: String,
    pub stats: FusionStats,
}

/// Entry points of the evaluation modes, one per [`AnalysisMode`].
pub trait Tester {
    /// Test-set loss and accuracy, appended to `log_path`.
    fn test(&mut self, testset: &ImageDataset, epoch: usize, log_path: &Path) -> Result<(), AnalysisError>;

    /// Reconstruction error plus original/reconstructed/fused grids written
    /// as `<out_dir>/<prefix>_<kind>.<extension>`.
    fn eval_invertibility(
        &mut self,
        testset: &ImageDataset,
        nactors: usize,
        out_dir: &Path,
        prefix: &str,
        extension: &str,
    ) -> Result<(), AnalysisError>;

    /// Fused targets from inverted mean latents, written to `out_path`.
    fn generate_inversed_images(
        &mut self,
        trainset: &ImageDataset,
        nactors: usize,
        out_path: &Path,
    ) -> Result<(), AnalysisError>;

    fn evaluate_fusion_net(
        &mut self,
        testset: &ImageDataset,
        nactors: usize,
        fusion: &FusionCheckpoint,
    ) -> Result<(), AnalysisError>;

    fn eval_sensitivity(&mut self, data: &ImageDataset, eps: f64) -> Result<(), AnalysisError>;

    fn test_inversed_images(&mut self, subset: &ImageDataset) -> Result<(), AnalysisError>;

    fn plot_latent(
        &mut self,
        subset: &ImageDataset,
        num_classes: usize,
        out_dir: &Path,
        extension: &str,
    ) -> Result<(), AnalysisError>;

    fn analyse_trace_estimation(
        &mut self,
        testset: &ImageDataset,
        out_dir: &Path,
        extension: &str,
    ) -> Result<(), AnalysisError>;

    /// Spectral norm of every normalized layer.
    fn spectral_norms(&mut self) -> Result<Vec<f32>, AnalysisError>;

    fn interpolate(
        &mut self,
        testset: &ImageDataset,
        out_dir: &Path,
        prefix: &str,
        extension: &str,
    ) -> Result<(), AnalysisError>;
}

/// Everything the dispatcher reads.
pub struct AnalysisContext<'a> {
    pub model_name: &'a str,
    pub nactors: usize,
    pub concat_input: bool,
    /// Epoch of the loaded backbone checkpoint.
    pub epoch: usize,
    pub config: &'a AnalysisConfig,
    pub paths: &'a ExperimentPaths,
    pub trainset: &'a ImageDataset,
    pub testset: &'a ImageDataset,
}

impl<'a> AnalysisContext<'a> {
    pub fn from_experiment(experiment: &'a Experiment) -> Self {
        let config = &experiment.config;
        AnalysisContext {
            model_name: &experiment.model_name,
            nactors: config.fusion.nactors,
            concat_input: config.fusion.concat_input,
            epoch: config.experiment.resume,
            config: &config.analysis,
            paths: &experiment.paths,
            trainset: &experiment.trainset,
            testset: &experiment.testset,
        }
    }

    /// `<model_name>_<nactors>_e<epoch>`, the stem of per-run figures.
    pub fn figure_prefix(&self) -> String {
        format!("{}_{}_e{}", self.model_name, self.nactors, self.epoch)
    }

    /// `<fusion_data_dir>/<model_name>_<nactors>.npy`.
    pub fn fusion_targets_path(&self) -> PathBuf {
        self.paths
            .fusion_data
            .join(format!("{}_{}.npy", self.model_name, self.nactors))
    }

    /// `<fusion_results_dir>/<model_name>_<nactors>.json`.
    pub fn fusion_stats_path(&self) -> PathBuf {
        self.paths
            .fusion_results
            .join(format!("{}_{}.json", self.model_name, self.nactors))
    }
}

/// `(min, median, max)`; the median of an even count averages the middle
/// pair. `None` for an empty slice.
pub fn summarize(values: &[f32]) -> Option<(f32, f32, f32)> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let n = sorted.len();
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };
    Some((sorted[0], median, sorted[n - 1]))
}

/// Run `mode` through `tester`. Returns `false` when no mode was requested,
/// in which case the caller trains.
pub fn analyse<T: Tester + ?Sized>(
    mode: Option<AnalysisMode>,
    tester: &mut T,
    ctx: &AnalysisContext<'_>,
) -> Result<bool, AnalysisError> {
    let Some(mode) = mode else {
        return Ok(false);
    };
    tracing::info!(mode = %mode, "running analysis");
    let cfg = ctx.config;

    match mode {
        AnalysisMode::Evaluate => {
            tester.test(ctx.testset, ctx.epoch, &ctx.paths.test_log)?;
        }
        AnalysisMode::EvalInvertibility => {
            tester.eval_invertibility(
                ctx.testset,
                ctx.nactors,
                &ctx.paths.samples,
                &ctx.figure_prefix(),
                &cfg.extension,
            )?;
        }
        AnalysisMode::SampleImages => {
            std::fs::create_dir_all(&ctx.paths.fusion_data)?;
            tester.generate_inversed_images(ctx.trainset, ctx.nactors, &ctx.fusion_targets_path())?;
        }
        AnalysisMode::EvalFusionNet => {
            let store = CheckpointStore::new(&ctx.paths.fusion_checkpoints);
            let stem = fusion_eval_name(ctx.model_name, ctx.nactors, ctx.concat_input);
            if !store.exists(&stem) {
                return Err(AnalysisError::MissingFile(store.weights_path(&stem)));
            }
            let stats = FusionStats::load(&ctx.fusion_stats_path())?;
            let fusion = FusionCheckpoint { store, stem, stats };
            tester.evaluate_fusion_net(ctx.testset, ctx.nactors, &fusion)?;
        }
        AnalysisMode::EvalSensitivity => {
            let path = &ctx.paths.sensitivity_data;
            if !path.is_file() {
                return Err(AnalysisError::MissingFile(path.clone()));
            }
            let data = npy::read_images(path)?;
            tester.eval_sensitivity(&data, cfg.eps)?;
        }
        AnalysisMode::TestInverse => {
            let subset = ctx.trainset.filter_labels(|l| l == cfg.inverse_label);
            if subset.is_empty() {
                return Err(AnalysisError::NoSamples("test-inverse"));
            }
            tester.test_inversed_images(&subset)?;
        }
        AnalysisMode::PlotTsne => {
            let subset = ctx.trainset.filter_labels(|l| l < cfg.tsne_classes);
            if subset.is_empty() {
                return Err(AnalysisError::NoSamples("plot-tsne"));
            }
            tester.plot_latent(&subset, cfg.tsne_classes, &ctx.paths.samples, &cfg.extension)?;
        }
        AnalysisMode::TraceEstimation => {
            tester.analyse_trace_estimation(ctx.testset, &ctx.paths.samples, &cfg.extension)?;
        }
        AnalysisMode::SpectralNorm => {
            let norms = tester.spectral_norms()?;
            let (min, median, max) = summarize(&norms).ok_or(AnalysisError::NoSamples("spectral-norm"))?;
            println!("{min} {median} {max}");
        }
        AnalysisMode::Interpolate => {
            tester.interpolate(
                ctx.testset,
                &ctx.paths.samples,
                &ctx.figure_prefix(),
                &cfg.extension,
            )?;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ExperimentConfig, PathsConfig};

    #[derive(Default)]
    struct RecordingTester {
        calls: Vec<&'static str>,
        seen_labels: Vec<usize>,
        seen_paths: Vec<PathBuf>,
        seen_prefix: Option<String>,
        norms: Vec<f32>,
    }

    impl Tester for RecordingTester {
        fn test(&mut self, _: &ImageDataset, _: usize, log_path: &Path) -> Result<(), AnalysisError> {
            self.calls.push("test");
            self.seen_paths.push(log_path.to_path_buf());
            Ok(())
        }
        fn eval_invertibility(
            &mut self,
            _: &ImageDataset,
            _: usize,
            _: &Path,
            prefix: &str,
            _: &str,
        ) -> Result<(), AnalysisError> {
            self.calls.push("eval_invertibility");
            self.seen_prefix = Some(prefix.to_string());
            Ok(())
        }
        fn generate_inversed_images(&mut self, _: &ImageDataset, _: usize, out_path: &Path) -> Result<(), AnalysisError> {
            self.calls.push("generate_inversed_images");
            self.seen_paths.push(out_path.to_path_buf());
            Ok(())
        }
        fn evaluate_fusion_net(
            &mut self,
            _: &ImageDataset,
            _: usize,
            fusion: &FusionCheckpoint,
        ) -> Result<(), AnalysisError> {
            self.calls.push("evaluate_fusion_net");
            self.seen_prefix = Some(fusion.stem.clone());
            Ok(())
        }
        fn eval_sensitivity(&mut self, data: &ImageDataset, _: f64) -> Result<(), AnalysisError> {
            self.calls.push("eval_sensitivity");
            self.seen_labels = data.labels().to_vec();
            Ok(())
        }
        fn test_inversed_images(&mut self, subset: &ImageDataset) -> Result<(), AnalysisError> {
            self.calls.push("test_inversed_images");
            self.seen_labels = subset.labels().to_vec();
            Ok(())
        }
        fn plot_latent(&mut self, subset: &ImageDataset, _: usize, _: &Path, _: &str) -> Result<(), AnalysisError> {
            self.calls.push("plot_latent");
            self.seen_labels = subset.labels().to_vec();
            Ok(())
        }
        fn analyse_trace_estimation(&mut self, _: &ImageDataset, _: &Path, _: &str) -> Result<(), AnalysisError> {
            self.calls.push("analyse_trace_estimation");
            Ok(())
        }
        fn spectral_norms(&mut self) -> Result<Vec<f32>, AnalysisError> {
            self.calls.push("spectral_norms");
            Ok(self.norms.clone())
        }
        fn interpolate(&mut self, _: &ImageDataset, _: &Path, _: &str, _: &str) -> Result<(), AnalysisError> {
            self.calls.push("interpolate");
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: ExperimentPaths,
        config: AnalysisConfig,
        trainset: ImageDataset,
        testset: ImageDataset,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let experiment = ExperimentConfig {
                save_dir: dir.path().join("inet"),
                ..Default::default()
            };
            let locations = PathsConfig {
                fusion_data_dir: dir.path().join("fusion_data"),
                fusion_results_dir: dir.path().join("fusion"),
                sensitivity_data: dir.path().join("pix2pix").join("data.npy"),
            };
            let labels: Vec<usize> = (0..10).collect();
            let trainset = ImageDataset::new([1, 2, 2], vec![0.5; 40], labels).unwrap();
            let testset = ImageDataset::new([1, 2, 2], vec![0.5; 8], vec![3, 4]).unwrap();
            Fixture {
                paths: ExperimentPaths::new(&experiment, &locations),
                _dir: dir,
                config: AnalysisConfig::default(),
                trainset,
                testset,
            }
        }

        fn ctx(&self) -> AnalysisContext<'_> {
            AnalysisContext {
                model_name: "mnist_default",
                nactors: 2,
                concat_input: false,
                epoch: 7,
                config: &self.config,
                paths: &self.paths,
                trainset: &self.trainset,
                testset: &self.testset,
            }
        }
    }

    #[test]
    fn test_no_mode_does_nothing() {
        let fx = Fixture::new();
        let mut tester = RecordingTester::default();
        assert!(!analyse(None, &mut tester, &fx.ctx()).unwrap());
        assert!(tester.calls.is_empty());
    }

    #[test]
    fn test_flags_run_only_first_mode() {
        let fx = Fixture::new();
        let flags = AnalysisFlags {
            evaluate: true,
            norm: true,
            interpolate: true,
            ..Default::default()
        };
        let mut tester = RecordingTester::default();
        let ran = analyse(resolve_mode(None, &flags), &mut tester, &fx.ctx()).unwrap();
        assert!(ran);
        assert_eq!(tester.calls, vec!["test"]);
        assert_eq!(tester.seen_paths, vec![fx.paths.test_log.clone()]);
    }

    #[test]
    fn test_each_mode_calls_one_entry_point() {
        let fx = Fixture::new();
        let expected = [
            (AnalysisMode::Evaluate, "test"),
            (AnalysisMode::EvalInvertibility, "eval_invertibility"),
            (AnalysisMode::SampleImages, "generate_inversed_images"),
            (AnalysisMode::TestInverse, "test_inversed_images"),
            (AnalysisMode::PlotTsne, "plot_latent"),
            (AnalysisMode::TraceEstimation, "analyse_trace_estimation"),
            (AnalysisMode::SpectralNorm, "spectral_norms"),
            (AnalysisMode::Interpolate, "interpolate"),
        ];
        for (mode, entry) in expected {
            let mut tester = RecordingTester {
                norms: vec![1.0],
                ..Default::default()
            };
            assert!(analyse(Some(mode), &mut tester, &fx.ctx()).unwrap());
            assert_eq!(tester.calls, vec![entry], "mode {mode}");
        }
    }

    #[test]
    fn test_figure_prefix_and_sample_path() {
        let fx = Fixture::new();
        let mut tester = RecordingTester::default();
        analyse(Some(AnalysisMode::EvalInvertibility), &mut tester, &fx.ctx()).unwrap();
        assert_eq!(tester.seen_prefix.as_deref(), Some("mnist_default_2_e7"));

        let mut tester = RecordingTester::default();
        analyse(Some(AnalysisMode::SampleImages), &mut tester, &fx.ctx()).unwrap();
        assert_eq!(
            tester.seen_paths,
            vec![fx.paths.fusion_data.join("mnist_default_2.npy")]
        );
        assert!(fx.paths.fusion_data.is_dir());
    }

    #[test]
    fn test_inverse_keeps_one_label() {
        let fx = Fixture::new();
        let mut tester = RecordingTester::default();
        analyse(Some(AnalysisMode::TestInverse), &mut tester, &fx.ctx()).unwrap();
        assert_eq!(tester.seen_labels, vec![1]);
    }

    #[test]
    fn test_tsne_keeps_first_classes() {
        let fx = Fixture::new();
        let mut tester = RecordingTester::default();
        analyse(Some(AnalysisMode::PlotTsne), &mut tester, &fx.ctx()).unwrap();
        assert_eq!(tester.seen_labels, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_subset_is_an_error() {
        let mut fx = Fixture::new();
        fx.config.inverse_label = 42;
        let mut tester = RecordingTester::default();
        let err = analyse(Some(AnalysisMode::TestInverse), &mut tester, &fx.ctx()).unwrap_err();
        assert!(matches!(err, AnalysisError::NoSamples(_)));
        assert!(tester.calls.is_empty());
    }

    #[test]
    fn test_fusion_eval_requires_checkpoint_and_stats() {
        let fx = Fixture::new();
        let mut tester = RecordingTester::default();
        let err = analyse(Some(AnalysisMode::EvalFusionNet), &mut tester, &fx.ctx()).unwrap_err();
        match err {
            AnalysisError::MissingFile(path) => {
                assert_eq!(path, fx.paths.fusion_checkpoints.join("mnist_default_2.mpk"))
            }
            other => panic!("unexpected error: {other}"),
        }

        std::fs::create_dir_all(&fx.paths.fusion_checkpoints).unwrap();
        std::fs::write(fx.paths.fusion_checkpoints.join("mnist_default_2.mpk"), b"").unwrap();
        let err = analyse(Some(AnalysisMode::EvalFusionNet), &mut tester, &fx.ctx()).unwrap_err();
        match err {
            AnalysisError::MissingFile(path) => {
                assert_eq!(path, fx.paths.fusion_results.join("mnist_default_2.json"))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(tester.calls.is_empty());

        FusionStats {
            mean: vec![0.0],
            std: vec![1.0],
        }
        .save(&fx.paths.fusion_results.join("mnist_default_2.json"))
        .unwrap();
        assert!(analyse(Some(AnalysisMode::EvalFusionNet), &mut tester, &fx.ctx()).unwrap());
        assert_eq!(tester.calls, vec!["evaluate_fusion_net"]);
        assert_eq!(tester.seen_prefix.as_deref(), Some("mnist_default_2"));
    }

    #[test]
    fn test_sensitivity_requires_data_file() {
        let fx = Fixture::new();
        let mut tester = RecordingTester::default();
        let err = analyse(Some(AnalysisMode::EvalSensitivity), &mut tester, &fx.ctx()).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingFile(_)));

        let path = &fx.paths.sensitivity_data;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        npy::write_f32(path, &[0.0; 12], &[3, 1, 2, 2]).unwrap();
        analyse(Some(AnalysisMode::EvalSensitivity), &mut tester, &fx.ctx()).unwrap();
        assert_eq!(tester.calls, vec!["eval_sensitivity"]);
        assert_eq!(tester.seen_labels.len(), 3);
    }

    #[test]
    fn test_spectral_norm_needs_layers() {
        let fx = Fixture::new();
        let mut tester = RecordingTester::default();
        let err = analyse(Some(AnalysisMode::SpectralNorm), &mut tester, &fx.ctx()).unwrap_err();
        assert!(matches!(err, AnalysisError::NoSamples(_)));
    }

    #[test]
    fn test_summarize() {
        assert_eq!(summarize(&[]), None);
        assert_eq!(summarize(&[0.9, 0.2, 0.5]), Some((0.2, 0.5, 0.9)));
        let (min, median, max) = summarize(&[0.4, 0.1, 0.8, 0.2]).unwrap();
        assert_eq!((min, max), (0.1, 0.8));
        assert!((median - 0.3).abs() < 1e-6);
    }
}
