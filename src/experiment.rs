//! Experiment setup: path layout, directories, datasets, dashboard and the
//! frozen backbone.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::checkpoint::{backbone_name, epoch_stem, CheckpointStore};
use crate::config::AppConfig;
use crate::dashboard::Dashboard;
use crate::data::{load_data, ImageDataset};
use crate::error::SetupError;
use crate::model::IResNet;

/// Dataset and run identity.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub dataset: String,
    pub name: String,
    pub data_dir: PathBuf,
    pub save_dir: PathBuf,
    /// Epoch of the backbone checkpoint to load.
    pub resume: usize,
    /// Number of training images used to initialize ActNorm layers.
    pub init_batch: usize,
    pub seed: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            dataset: "cifar10".to_string(),
            name: "default".to_string(),
            data_dir: PathBuf::from("../data"),
            save_dir: PathBuf::from("../results/inet"),
            resume: 0,
            init_batch: 1024,
            seed: 0,
        }
    }
}

/// Locations shared with the fusion experiments.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub fusion_data_dir: PathBuf,
    pub fusion_results_dir: PathBuf,
    /// `.npy` array of images used by the sensitivity evaluation.
    pub sensitivity_data: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            fusion_data_dir: PathBuf::from("../data/fusion"),
            fusion_results_dir: PathBuf::from("../results/fusion"),
            sensitivity_data: PathBuf::from("../data/pix2pix/data.npy"),
        }
    }
}

/// Every path the harness reads or writes, derived once from configuration.
#[derive(Debug, Clone)]
pub struct ExperimentPaths {
    pub save_dir: PathBuf,
    pub checkpoints: PathBuf,
    pub samples: PathBuf,
    pub test_log: PathBuf,
    pub fusion_data: PathBuf,
    pub fusion_results: PathBuf,
    pub fusion_checkpoints: PathBuf,
    pub sensitivity_data: PathBuf,
}

impl ExperimentPaths {
    pub fn new(experiment: &ExperimentConfig, paths: &PathsConfig) -> Self {
        let save_dir = experiment.save_dir.clone();
        ExperimentPaths {
            checkpoints: save_dir.join("checkpoints"),
            samples: save_dir.join("samples").join("inet"),
            test_log: save_dir.join("test_log.txt"),
            save_dir,
            fusion_data: paths.fusion_data_dir.clone(),
            fusion_results: paths.fusion_results_dir.clone(),
            fusion_checkpoints: paths.fusion_results_dir.join("checkpoints"),
            sensitivity_data: paths.sensitivity_data.clone(),
        }
    }

    /// Create the save, checkpoint and sample directories.
    pub fn create_dirs(&self) -> Result<(), SetupError> {
        for dir in [&self.save_dir, &self.checkpoints, &self.samples] {
            create_dir(dir)?;
        }
        Ok(())
    }
}

pub(crate) fn create_dir(dir: &Path) -> Result<(), SetupError> {
    std::fs::create_dir_all(dir).map_err(|e| SetupError::CreateDir {
        path: dir.to_path_buf(),
        source: e,
    })
}

/// A prepared run: configuration, paths, datasets and dashboard.
pub struct Experiment {
    pub config: AppConfig,
    pub model_name: String,
    pub paths: ExperimentPaths,
    pub trainset: ImageDataset,
    pub testset: ImageDataset,
    /// Per-image shape `[C, H, W]`.
    pub in_shape: [usize; 3],
    pub dashboard: Option<Dashboard>,
}

impl Experiment {
    /// Check the dashboard, create directories and load both splits.
    pub fn setup(config: AppConfig) -> Result<Self, SetupError> {
        let dashboard = Dashboard::connect(&config.dashboard)?;
        let (trainset, testset, in_shape) =
            load_data(&config.experiment.dataset, &config.experiment.data_dir)?;
        let mut experiment = Self::with_data(config, trainset, testset)?;
        experiment.in_shape = in_shape;
        experiment.dashboard = dashboard;
        Ok(experiment)
    }

    /// Prepare a run on already loaded datasets. The dashboard is left
    /// disconnected. Every label must fit `backbone.n_classes`.
    pub fn with_data(
        config: AppConfig,
        trainset: ImageDataset,
        testset: ImageDataset,
    ) -> Result<Self, SetupError> {
        trainset.check_labels(config.backbone.n_classes)?;
        testset.check_labels(config.backbone.n_classes)?;
        let paths = ExperimentPaths::new(&config.experiment, &config.paths);
        paths.create_dirs()?;
        Ok(Experiment {
            model_name: config.model_name(),
            in_shape: trainset.shape(),
            config,
            paths,
            trainset,
            testset,
            dashboard: None,
        })
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(&self.paths.checkpoints)
    }

    /// Stem of the backbone checkpoint selected by `experiment.resume`.
    pub fn backbone_stem(&self) -> String {
        epoch_stem(&backbone_name(&self.model_name), self.config.experiment.resume)
    }

    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.config.experiment.seed)
    }

    /// Build the backbone, initialize its ActNorm layers on the first
    /// `init_batch` training images and load the required checkpoint.
    pub fn build_backbone<B: Backend>(&self, device: &B::Device) -> Result<IResNet<B>, SetupError> {
        let net = self.config.backbone.init::<B>(self.in_shape, device)?;
        tracing::info!("initializing actnorm parameters...");
        let init = self
            .trainset
            .head(self.config.experiment.init_batch)
            .images_tensor::<B>(device);
        let net = net.init_actnorm(init);
        let net = self
            .checkpoint_store()
            .load(net, &self.backbone_stem(), device)?;
        Ok(net)
    }
}
