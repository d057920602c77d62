#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, Wgpu};
use burn::module::{AutodiffModule, Module};
use clap::Parser;

use inet_fusion::analysis::{analyse, resolve_mode, AnalysisContext, AnalysisMode, Evaluator};
use inet_fusion::checkpoint::{epoch_stem, fusion_name};
use inet_fusion::config::AppConfig;
use inet_fusion::dashboard::Dashboard;
use inet_fusion::experiment::Experiment;
use inet_fusion::logging::init_logging;
use inet_fusion::model::FusionConfig;
use inet_fusion::training::FusionTrainer;

type InferenceBackend = Wgpu;
type TrainBackend = Autodiff<Wgpu>;

/// Train a fusion network against a frozen invertible ResNet, or run one
/// analysis mode on the backbone.
#[derive(Parser)]
#[command(name = "train", about = "Fusion-network distillation and iResNet analysis")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override number of training epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Override learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Override number of fused images
    #[arg(long)]
    nactors: Option<usize>,

    /// Epoch of the backbone checkpoint to load
    #[arg(long)]
    resume: Option<usize>,

    /// Epoch of the fusion checkpoint to resume from
    #[arg(long = "resume-g")]
    resume_g: Option<usize>,

    /// Run one analysis mode instead of training
    #[arg(long, value_enum)]
    analyse: Option<AnalysisMode>,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    dump_config: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.dump_config {
        print!("{}", AppConfig::default_toml());
        return Ok(());
    }

    init_logging("info").map_err(|e| anyhow!("installing tracing subscriber: {e}"))?;

    // Load configuration
    let mut app_config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(epochs) = cli.epochs {
        app_config.training.epochs = epochs;
    }
    if let Some(lr) = cli.lr {
        app_config.training.lr = lr;
    }
    if let Some(nactors) = cli.nactors {
        app_config.fusion.nactors = nactors;
    }
    if let Some(resume) = cli.resume {
        app_config.experiment.resume = resume;
    }
    if let Some(resume_g) = cli.resume_g {
        app_config.training.resume_g = resume_g;
    }
    if cli.analyse.is_some() {
        app_config.analysis.mode = cli.analyse;
    }
    app_config.validate().context("validating configuration")?;

    let mut experiment = Experiment::setup(app_config).context("setting up experiment")?;
    tracing::info!(
        model = %experiment.model_name,
        train = experiment.trainset.len(),
        test = experiment.testset.len(),
        "datasets loaded"
    );

    let device = WgpuDevice::default();
    let backbone = experiment
        .build_backbone::<TrainBackend>(&device)
        .context("building backbone")?
        .no_grad();

    let dashboard = experiment.dashboard.take();
    let analysis = &experiment.config.analysis;
    if let Some(mode) = resolve_mode(analysis.mode, &analysis.flags) {
        let mut evaluator = Evaluator::<InferenceBackend, _>::new(
            backbone.valid(),
            device.clone(),
            &experiment.config,
            experiment.rng(),
        )
        .with_dashboard(dashboard);
        let ctx = AnalysisContext::from_experiment(&experiment);
        analyse(Some(mode), &mut evaluator, &ctx).with_context(|| format!("running {mode}"))?;
        return Ok(());
    }

    train(&experiment, &backbone, dashboard, &device)
}

fn train(
    experiment: &Experiment,
    backbone: &inet_fusion::model::IResNet<TrainBackend>,
    dashboard: Option<Dashboard>,
    device: &WgpuDevice,
) -> Result<()> {
    let config = &experiment.config;
    let nactors = config.fusion.nactors;
    let channels = experiment.in_shape[0];

    let fnet = FusionConfig {
        input_nc: channels,
        output_nc: channels,
        ..config.fusion.clone()
    }
    .init::<TrainBackend>(device);

    let store = experiment.checkpoint_store();
    let resume_stem = epoch_stem(
        &fusion_name(&experiment.model_name, nactors),
        config.training.resume_g,
    );
    let (fnet, resumed) = store
        .try_load::<TrainBackend, _>(fnet, &resume_stem, device)
        .with_context(|| format!("loading fusion checkpoint {resume_stem}"))?;
    if resumed {
        println!("Resumed fusion net from epoch {}", config.training.resume_g);
    }

    let trainer = FusionTrainer::new(config.training.clone(), nactors, &experiment.model_name, store)
        .context("creating trainer")?
        .with_dashboard(dashboard);
    let mut rng = experiment.rng();
    let outcome = trainer
        .train(backbone, fnet, &experiment.trainset, device, &mut rng)
        .context("training fusion network")?;

    let last = &outcome.last_epoch;
    println!(
        "| Training finished: Loss: {:.4} Acc@1: {:.2}% Acc@5: {:.2}% Distill: {:.4} MSE: {:.4}",
        last.loss, last.top1, last.top5, last.distill, last.mse
    );
    println!("| {} checkpoints written", outcome.checkpoints.len());
    Ok(())
}
