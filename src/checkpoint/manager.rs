use std::fs;
use std::path::PathBuf;

use burn::prelude::*;
use burn::record::DefaultRecorder;

use crate::checkpoint::metadata::{CheckpointMetadata, FORMAT_VERSION};
use crate::error::CheckpointError;

const WEIGHTS_EXT: &str = "mpk";

/// Saves and loads module weights with their metadata sidecars in one
/// directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CheckpointStore { dir: dir.into() }
    }

    pub fn weights_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}.{WEIGHTS_EXT}"))
    }

    pub fn metadata_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}.json"))
    }

    pub fn exists(&self, stem: &str) -> bool {
        self.weights_path(stem).is_file()
    }

    /// Save `module` under `metadata.stem()`.
    ///
    /// Both files are written into a temporary directory first and moved into
    /// place afterwards, sidecar before weights, so a weights file on disk
    /// always has its metadata next to it.
    pub fn save<B: Backend, M: Module<B>>(
        &self,
        module: M,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf, CheckpointError> {
        let stem = metadata.stem();
        let tmp_dir = self.dir.join(format!(".{stem}.tmp"));
        fs::create_dir_all(&tmp_dir)?;

        let recorder = DefaultRecorder::default();
        module
            .save_file(tmp_dir.join("weights"), &recorder)
            .map_err(|e| CheckpointError::ModelSave(e.to_string()))?;
        fs::write(
            tmp_dir.join("metadata.json"),
            serde_json::to_string_pretty(metadata)?,
        )?;

        let final_path = self.weights_path(&stem);
        fs::rename(tmp_dir.join("metadata.json"), self.metadata_path(&stem))?;
        fs::rename(tmp_dir.join(format!("weights.{WEIGHTS_EXT}")), &final_path)?;
        fs::remove_dir_all(&tmp_dir)?;

        tracing::debug!(path = %final_path.display(), "checkpoint saved");
        Ok(final_path)
    }

    /// Read the sidecar of `stem`, if one exists, and check its version.
    pub fn read_metadata(&self, stem: &str) -> Result<Option<CheckpointMetadata>, CheckpointError> {
        let path = self.metadata_path(stem);
        if !path.is_file() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path).map_err(|e| CheckpointError::MetadataRead {
            path: path.clone(),
            source: e,
        })?;
        let metadata: CheckpointMetadata =
            serde_json::from_str(&json).map_err(|e| CheckpointError::MetadataParse {
                path: path.clone(),
                source: e,
            })?;
        if metadata.format_version != FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                path,
                found: metadata.format_version,
                expected: FORMAT_VERSION,
            });
        }
        Ok(Some(metadata))
    }

    /// Load the weights of `stem` into `module`. A missing file is an error.
    pub fn load<B: Backend, M: Module<B>>(
        &self,
        module: M,
        stem: &str,
        device: &B::Device,
    ) -> Result<M, CheckpointError> {
        let path = self.weights_path(stem);
        if !path.is_file() {
            return Err(CheckpointError::NotFound(path));
        }
        self.read_metadata(stem)?;

        let recorder = DefaultRecorder::default();
        let module = module
            .load_file(self.dir.join(stem), &recorder, device)
            .map_err(|e| CheckpointError::ModelLoad(e.to_string()))?;
        tracing::info!(path = %path.display(), "loaded checkpoint");
        Ok(module)
    }

    /// Like [`load`](Self::load), but a missing file leaves `module`
    /// untouched. The flag reports whether weights were loaded.
    pub fn try_load<B: Backend, M: Module<B>>(
        &self,
        module: M,
        stem: &str,
        device: &B::Device,
    ) -> Result<(M, bool), CheckpointError> {
        if !self.exists(stem) {
            tracing::info!(
                path = %self.weights_path(stem).display(),
                "no checkpoint found, starting fresh"
            );
            return Ok((module, false));
        }
        Ok((self.load(module, stem, device)?, true))
    }
}
