//! Checkpoint naming and storage.
//!
//! Weights are stored as `<dir>/<stem>.mpk` with a JSON sidecar
//! `<dir>/<stem>.json`. Training checkpoints use the stem
//! `<name>_e<epoch>`; the fusion checkpoints read in evaluation mode use a
//! bare stem.

mod manager;
mod metadata;

pub use manager::CheckpointStore;
pub use metadata::{CheckpointKind, CheckpointMetadata, CheckpointMetrics, FORMAT_VERSION};

/// Stem shared by every backbone checkpoint of `model_name`.
pub fn backbone_name(model_name: &str) -> String {
    format!("inet_{model_name}")
}

/// Stem shared by every fusion checkpoint written during training.
pub fn fusion_name(model_name: &str, nactors: usize) -> String {
    format!("fnet_integrated_{model_name}_{nactors}_perturb")
}

/// Stem of the fusion checkpoint loaded by the fusion evaluation mode.
pub fn fusion_eval_name(model_name: &str, nactors: usize, concat_input: bool) -> String {
    let mut name = format!("{model_name}_{nactors}");
    if concat_input {
        name.push_str("_concatinput");
    }
    name
}

/// `<name>_e<epoch>`.
pub fn epoch_stem(name: &str, epoch: usize) -> String {
    format!("{name}_e{epoch}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_deterministic() {
        assert_eq!(backbone_name("cifar10_default"), "inet_cifar10_default");
        assert_eq!(
            epoch_stem(&backbone_name("cifar10_default"), 200),
            "inet_cifar10_default_e200"
        );
        assert_eq!(
            epoch_stem(&fusion_name("mnist_mixup", 3), 12),
            "fnet_integrated_mnist_mixup_3_perturb_e12"
        );
        assert_eq!(
            fusion_name("mnist_mixup", 3),
            fusion_name("mnist_mixup", 3)
        );
    }

    #[test]
    fn test_eval_name_marks_concat_input() {
        assert_eq!(fusion_eval_name("cifar10_default", 2, false), "cifar10_default_2");
        assert_eq!(
            fusion_eval_name("cifar10_default", 2, true),
            "cifar10_default_2_concatinput"
        );
    }
}
