use serde::{Deserialize, Serialize};

/// Version written into every metadata sidecar.
pub const FORMAT_VERSION: u32 = 1;

/// Which network a checkpoint holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    Backbone,
    Fusion,
}

/// Metrics snapshot at checkpoint time (averages over the last epoch).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    pub loss: f32,
    pub top1: f32,
    pub top5: f32,
    pub distill: f32,
    pub mse: f32,
}

/// Sidecar written next to the weights as `<stem>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub format_version: u32,
    pub kind: CheckpointKind,
    /// File stem without the epoch suffix, e.g. `inet_cifar10_default`.
    pub name: String,
    pub epoch: usize,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nactors: Option<usize>,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<CheckpointMetrics>,
}

impl CheckpointMetadata {
    pub fn new(kind: CheckpointKind, name: &str, epoch: usize, model_name: &str) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        CheckpointMetadata {
            format_version: FORMAT_VERSION,
            kind,
            name: name.to_string(),
            epoch,
            model_name: model_name.to_string(),
            nactors: None,
            timestamp,
            metrics: None,
        }
    }

    pub fn with_nactors(mut self, nactors: usize) -> Self {
        self.nactors = Some(nactors);
        self
    }

    pub fn with_metrics(mut self, metrics: CheckpointMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// File stem of this checkpoint, `<name>_e<epoch>`.
    pub fn stem(&self) -> String {
        super::epoch_stem(&self.name, self.epoch)
    }
}
