use std::path::PathBuf;

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read metadata from {path}: {source}")]
    MetadataRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse metadata from {path}: {source}")]
    MetadataParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("unsupported checkpoint format version {found} in {path} (expected {expected})")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("failed to save model: {0}")]
    ModelSave(String),

    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading datasets.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("unknown dataset '{0}' (expected 'cifar10', 'mnist' or 'fashion')")]
    UnknownDataset(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed data file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("failed to read npy array {path}: {reason}")]
    Npy { path: PathBuf, reason: String },

    #[error("dataset is empty")]
    Empty,

    #[error("label {label} does not fit a {num_classes}-class backbone")]
    LabelOutOfRange { label: usize, num_classes: usize },
}

/// Errors that can occur during training.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("nactors must be >= 2 to fuse images, got {0}")]
    TooFewActors(usize),

    #[error("loss became non-finite at epoch {epoch}, iteration {iteration}")]
    NonFiniteLoss { epoch: usize, iteration: usize },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("data error: {0}")]
    Data(#[from] DataError),
}

/// Errors raised by the analysis dispatcher and its evaluation routines.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("required file not found: {0}")]
    MissingFile(PathBuf),

    #[error("no samples available for {0}")]
    NoSamples(&'static str),

    #[error("failed to write image {path}: {reason}")]
    ImageWrite { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("training error: {0}")]
    Training(#[from] TrainingError),
}

/// Errors talking to the visdom-compatible dashboard server.
#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    #[error("could not reach dashboard at {url}: {source}")]
    Unreachable { url: String, source: reqwest::Error },

    #[error("dashboard at {url} answered with status {status}")]
    BadStatus { url: String, status: u16 },
}

/// Errors raised while preparing an experiment: directories, datasets,
/// backbone and dashboard.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid backbone configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("dashboard error: {0}")]
    Dashboard(#[from] DashboardError),
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),
}
