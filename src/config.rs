use std::path::Path;

use crate::analysis::AnalysisConfig;
use crate::dashboard::DashboardConfig;
use crate::error::ConfigError;
use crate::experiment::{ExperimentConfig, PathsConfig};
use crate::model::{BackboneConfig, FusionConfig};
use crate::training::trainer::TrainerConfig;

/// Top-level application configuration, loadable from TOML.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub experiment: ExperimentConfig,
    pub backbone: BackboneConfig,
    pub fusion: FusionConfig,
    pub training: TrainerConfig,
    pub analysis: AnalysisConfig,
    pub paths: PathsConfig,
    pub dashboard: DashboardConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!("config file '{}' not found, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// `<dataset>_<name>`, the stem shared by every checkpoint and sample file.
    pub fn model_name(&self) -> String {
        format!("{}_{}", self.experiment.dataset, self.experiment.name)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.backbone;
        if b.n_blocks.is_empty() {
            return Err(ConfigError::Validation(
                "backbone.n_blocks must not be empty".into(),
            ));
        }
        if b.n_blocks.len() != b.n_strides.len() || b.n_blocks.len() != b.n_channels.len() {
            return Err(ConfigError::Validation(
                "backbone.n_blocks, n_strides and n_channels must have the same length".into(),
            ));
        }
        if b.n_strides.iter().any(|&s| s != 1 && s != 2) {
            return Err(ConfigError::Validation(
                "backbone.n_strides entries must be 1 or 2".into(),
            ));
        }
        if b.init_ds != 1 && b.init_ds != 2 {
            return Err(ConfigError::Validation(
                "backbone.init_ds must be 1 or 2".into(),
            ));
        }
        if b.n_classes < 2 {
            return Err(ConfigError::Validation(
                "backbone.n_classes must be >= 2".into(),
            ));
        }
        if b.coeff <= 0.0 || b.coeff >= 1.0 {
            return Err(ConfigError::Validation(
                "backbone.coeff must be in (0, 1)".into(),
            ));
        }
        if b.power_iter == 0 {
            return Err(ConfigError::Validation(
                "backbone.power_iter must be >= 1".into(),
            ));
        }
        if b.inverse_iters == 0 {
            return Err(ConfigError::Validation(
                "backbone.inverse_iters must be >= 1".into(),
            ));
        }

        if self.fusion.nactors < 2 {
            return Err(ConfigError::Validation(
                "fusion.nactors must be >= 2".into(),
            ));
        }
        if self.fusion.ngf == 0 {
            return Err(ConfigError::Validation("fusion.ngf must be > 0".into()));
        }

        let t = &self.training;
        if t.lr <= 0.0 {
            return Err(ConfigError::Validation("training.lr must be > 0".into()));
        }
        if t.beta1 < 0.0 || t.beta1 >= 1.0 {
            return Err(ConfigError::Validation(
                "training.beta1 must be in [0, 1)".into(),
            ));
        }
        if t.epochs == 0 {
            return Err(ConfigError::Validation(
                "training.epochs must be > 0".into(),
            ));
        }
        if t.batch_size == 0 {
            return Err(ConfigError::Validation(
                "training.batch_size must be > 0".into(),
            ));
        }
        if t.log_steps == 0 {
            return Err(ConfigError::Validation(
                "training.log_steps must be > 0".into(),
            ));
        }
        if t.save_steps == 0 {
            return Err(ConfigError::Validation(
                "training.save_steps must be > 0".into(),
            ));
        }
        if t.kd_alpha < 0.0 || t.kd_alpha > 1.0 {
            return Err(ConfigError::Validation(
                "training.kd_alpha must be in [0, 1]".into(),
            ));
        }
        if t.kd_temperature <= 0.0 {
            return Err(ConfigError::Validation(
                "training.kd_temperature must be > 0".into(),
            ));
        }
        if t.mse_weight < 0.0 {
            return Err(ConfigError::Validation(
                "training.mse_weight must be >= 0".into(),
            ));
        }

        if self.experiment.init_batch == 0 {
            return Err(ConfigError::Validation(
                "experiment.init_batch must be > 0".into(),
            ));
        }

        let a = &self.analysis;
        if a.eps <= 0.0 {
            return Err(ConfigError::Validation("analysis.eps must be > 0".into()));
        }
        if a.tsne_classes == 0 {
            return Err(ConfigError::Validation(
                "analysis.tsne_classes must be > 0".into(),
            ));
        }
        if a.interpolation_steps < 2 {
            return Err(ConfigError::Validation(
                "analysis.interpolation_steps must be >= 2".into(),
            ));
        }
        if a.trace_sample_counts.iter().any(|&n| n == 0) {
            return Err(ConfigError::Validation(
                "analysis.trace_sample_counts entries must be >= 1".into(),
            ));
        }

        Ok(())
    }

    /// Generate a TOML string with all default values (useful for creating
    /// example config files).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&AppConfig::default()).expect("default config serializes")
    }
}
