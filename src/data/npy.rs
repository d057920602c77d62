//! `.npy` array I/O for fusion datasets and sensitivity inputs.

use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use ndarray_npy::{read_npy, write_npy};

use crate::data::ImageDataset;
use crate::error::DataError;

/// Read an array of any rank, returning its row-major data and shape.
///
/// `f4`, `f8` and `u1` arrays are accepted; values are cast to f32 as-is.
pub fn read_f32(path: &Path) -> Result<(Vec<f32>, Vec<usize>), DataError> {
    let first = match read_npy::<_, ArrayD<f32>>(path) {
        Ok(array) => return Ok(flatten(array, |v| v)),
        Err(e) => e,
    };
    if let Ok(array) = read_npy::<_, ArrayD<f64>>(path) {
        return Ok(flatten(array, |v| v as f32));
    }
    if let Ok(array) = read_npy::<_, ArrayD<u8>>(path) {
        return Ok(flatten(array, f32::from));
    }
    Err(DataError::Npy {
        path: path.to_path_buf(),
        reason: first.to_string(),
    })
}

fn flatten<T: Copy>(array: ArrayD<T>, cast: impl Fn(T) -> f32) -> (Vec<f32>, Vec<usize>) {
    let shape = array.shape().to_vec();
    let data = array.as_standard_layout().iter().map(|&v| cast(v)).collect();
    (data, shape)
}

/// Write row-major f32 data with the given shape.
pub fn write_f32(path: &Path, data: &[f32], shape: &[usize]) -> Result<(), DataError> {
    let array = ArrayD::from_shape_vec(IxDyn(shape), data.to_vec()).map_err(|e| {
        DataError::Npy {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;
    write_npy(path, &array).map_err(|e| DataError::Npy {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Read an unlabeled `[N, C, H, W]` image array. Every item gets label 0.
pub fn read_images(path: &Path) -> Result<ImageDataset, DataError> {
    let (data, shape) = read_f32(path)?;
    if shape.len() != 4 {
        return Err(DataError::Npy {
            path: path.to_path_buf(),
            reason: format!("expected a rank-4 array, found shape {shape:?}"),
        });
    }
    ImageDataset::new([shape[1], shape[2], shape[3]], data, vec![0; shape[0]])
}
