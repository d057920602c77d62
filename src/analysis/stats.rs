use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// Per-channel mean and standard deviation of a fused-image dataset, used to
/// undo the normalization the fusion network was trained with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionStats {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl FusionStats {
    /// Statistics of row-major `[N, C, H, W]` images.
    pub fn compute(images: &[f32], shape: [usize; 3]) -> Self {
        let [c, h, w] = shape;
        let plane = h * w;
        let n = images.len() / (c * plane).max(1);
        let count = (n * plane).max(1) as f64;
        let mut mean = vec![0.0f32; c];
        let mut std = vec![0.0f32; c];
        for ch in 0..c {
            let values = (0..n).flat_map(|i| {
                let start = (i * c + ch) * plane;
                images[start..start + plane].iter().map(|&v| v as f64)
            });
            let (sum, sq) = values.fold((0.0, 0.0), |(s, q), v| (s + v, q + v * v));
            let m = sum / count;
            mean[ch] = m as f32;
            std[ch] = (sq / count - m * m).max(0.0).sqrt() as f32;
        }
        FusionStats { mean, std }
    }

    pub fn load(path: &Path) -> Result<Self, AnalysisError> {
        if !path.is_file() {
            return Err(AnalysisError::MissingFile(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), AnalysisError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Map normalized `[N, C, H, W]` images back to the data scale in place.
    pub fn denormalize(&self, images: &mut [f32], shape: [usize; 3]) {
        if self.mean.is_empty() || self.std.is_empty() {
            return;
        }
        let [c, h, w] = shape;
        let plane = h * w;
        for (idx, chunk) in images.chunks_mut(plane).enumerate() {
            let ch = idx % c;
            let (m, s) = (self.mean[ch.min(self.mean.len() - 1)], self.std[ch.min(self.std.len() - 1)]);
            for v in chunk {
                *v = *v * s + m;
            }
        }
    }
}
