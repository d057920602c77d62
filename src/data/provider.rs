use std::path::{Path, PathBuf};

use crate::data::ImageDataset;
use crate::error::DataError;

const CIFAR_SIDE: usize = 32;
const CIFAR_RECORD: usize = 1 + 3 * CIFAR_SIDE * CIFAR_SIDE;
const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;

/// Datasets the provider knows how to read from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Cifar10,
    Mnist,
    Fashion,
}

impl DatasetKind {
    pub fn parse(name: &str) -> Result<Self, DataError> {
        match name.to_ascii_lowercase().as_str() {
            "cifar10" => Ok(DatasetKind::Cifar10),
            "mnist" => Ok(DatasetKind::Mnist),
            "fashion" | "fashion-mnist" => Ok(DatasetKind::Fashion),
            _ => Err(DataError::UnknownDataset(name.to_string())),
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            DatasetKind::Cifar10 => 3,
            DatasetKind::Mnist | DatasetKind::Fashion => 1,
        }
    }

    /// Per-channel normalization mean.
    pub fn mean(&self) -> &'static [f32] {
        match self {
            DatasetKind::Cifar10 => &[0.4914, 0.4822, 0.4465],
            DatasetKind::Mnist => &[0.1307],
            DatasetKind::Fashion => &[0.2860],
        }
    }

    /// Per-channel normalization standard deviation.
    pub fn std(&self) -> &'static [f32] {
        match self {
            DatasetKind::Cifar10 => &[0.2023, 0.1994, 0.2010],
            DatasetKind::Mnist => &[0.3081],
            DatasetKind::Fashion => &[0.3530],
        }
    }

    fn subdir(&self) -> &'static str {
        match self {
            DatasetKind::Cifar10 => "cifar-10-batches-bin",
            DatasetKind::Mnist => "mnist",
            DatasetKind::Fashion => "fashion",
        }
    }
}

/// Load the train and test splits of `dataset` from `data_dir`, returning
/// them together with the per-image input shape.
pub fn load_data(
    dataset: &str,
    data_dir: &Path,
) -> Result<(ImageDataset, ImageDataset, [usize; 3]), DataError> {
    let kind = DatasetKind::parse(dataset)?;
    let root = data_dir.join(kind.subdir());
    let (train, test) = match kind {
        DatasetKind::Cifar10 => {
            let train_files: Vec<PathBuf> = (1..=5)
                .map(|i| root.join(format!("data_batch_{i}.bin")))
                .collect();
            let train = read_cifar(&train_files, kind)?;
            let test = read_cifar(&[root.join("test_batch.bin")], kind)?;
            (train, test)
        }
        DatasetKind::Mnist | DatasetKind::Fashion => {
            let train = read_idx_pair(
                &root.join("train-images-idx3-ubyte"),
                &root.join("train-labels-idx1-ubyte"),
                kind,
            )?;
            let test = read_idx_pair(
                &root.join("t10k-images-idx3-ubyte"),
                &root.join("t10k-labels-idx1-ubyte"),
                kind,
            )?;
            (train, test)
        }
    };
    if train.is_empty() {
        return Err(DataError::Empty);
    }
    tracing::info!(
        dataset,
        train = train.len(),
        test = test.len(),
        "loaded dataset"
    );
    let shape = train.shape();
    Ok((train, test, shape))
}

fn read_file(path: &Path) -> Result<Vec<u8>, DataError> {
    std::fs::read(path).map_err(|e| DataError::Read {
        path: path.to_path_buf(),
        source: e,
    })
}

fn read_cifar(files: &[PathBuf], kind: DatasetKind) -> Result<ImageDataset, DataError> {
    let mut pixels = Vec::new();
    let mut labels = Vec::new();
    for path in files {
        let bytes = read_file(path)?;
        let (mut p, mut l) = parse_cifar_records(&bytes, path)?;
        pixels.append(&mut p);
        labels.append(&mut l);
    }
    normalize(&mut pixels, kind, CIFAR_SIDE * CIFAR_SIDE);
    ImageDataset::new([3, CIFAR_SIDE, CIFAR_SIDE], pixels, labels)
}

fn read_idx_pair(
    images_path: &Path,
    labels_path: &Path,
    kind: DatasetKind,
) -> Result<ImageDataset, DataError> {
    let (mut pixels, rows, cols) = parse_idx_images(&read_file(images_path)?, images_path)?;
    let labels = parse_idx_labels(&read_file(labels_path)?, labels_path)?;
    if labels.len() * rows * cols != pixels.len() {
        return Err(DataError::Malformed {
            path: labels_path.to_path_buf(),
            reason: "label count does not match image count".into(),
        });
    }
    normalize(&mut pixels, kind, rows * cols);
    ImageDataset::new([1, rows, cols], pixels, labels)
}

/// Decode CIFAR-10 binary records (`label` byte + 3072 channel-major pixel
/// bytes) into `[0, 1]`-scaled pixels and labels.
pub fn parse_cifar_records(bytes: &[u8], path: &Path) -> Result<(Vec<f32>, Vec<usize>), DataError> {
    if bytes.len() % CIFAR_RECORD != 0 {
        return Err(DataError::Malformed {
            path: path.to_path_buf(),
            reason: format!("length {} is not a multiple of {CIFAR_RECORD}", bytes.len()),
        });
    }
    let n = bytes.len() / CIFAR_RECORD;
    let mut pixels = Vec::with_capacity(n * (CIFAR_RECORD - 1));
    let mut labels = Vec::with_capacity(n);
    for record in bytes.chunks_exact(CIFAR_RECORD) {
        labels.push(record[0] as usize);
        pixels.extend(record[1..].iter().map(|&b| b as f32 / 255.0));
    }
    Ok((pixels, labels))
}

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Decode an IDX3 image file into `[0, 1]`-scaled pixels, rows and columns.
pub fn parse_idx_images(bytes: &[u8], path: &Path) -> Result<(Vec<f32>, usize, usize), DataError> {
    let malformed = |reason: &str| DataError::Malformed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if bytes.len() < 16 {
        return Err(malformed("truncated header"));
    }
    if be_u32(bytes, 0) != IDX_IMAGES_MAGIC {
        return Err(malformed("bad magic number for images"));
    }
    let n = be_u32(bytes, 4) as usize;
    let rows = be_u32(bytes, 8) as usize;
    let cols = be_u32(bytes, 12) as usize;
    let body = &bytes[16..];
    if body.len() != n * rows * cols {
        return Err(malformed("pixel payload length does not match header"));
    }
    Ok((body.iter().map(|&b| b as f32 / 255.0).collect(), rows, cols))
}

/// Decode an IDX1 label file.
pub fn parse_idx_labels(bytes: &[u8], path: &Path) -> Result<Vec<usize>, DataError> {
    let malformed = |reason: &str| DataError::Malformed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if bytes.len() < 8 {
        return Err(malformed("truncated header"));
    }
    if be_u32(bytes, 0) != IDX_LABELS_MAGIC {
        return Err(malformed("bad magic number for labels"));
    }
    let n = be_u32(bytes, 4) as usize;
    let body = &bytes[8..];
    if body.len() != n {
        return Err(malformed("label payload length does not match header"));
    }
    Ok(body.iter().map(|&b| b as usize).collect())
}

/// Standardize channel-major pixels in place with the dataset statistics.
fn normalize(pixels: &mut [f32], kind: DatasetKind, plane: usize) {
    let channels = kind.channels();
    let (mean, std) = (kind.mean(), kind.std());
    for (i, px) in pixels.iter_mut().enumerate() {
        let c = (i / plane) % channels;
        *px = (*px - mean[c]) / std[c];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dataset_names() {
        assert_eq!(DatasetKind::parse("CIFAR10").unwrap(), DatasetKind::Cifar10);
        assert_eq!(DatasetKind::parse("mnist").unwrap(), DatasetKind::Mnist);
        assert!(matches!(
            DatasetKind::parse("imagenet"),
            Err(DataError::UnknownDataset(_))
        ));
    }

    #[test]
    fn test_parse_cifar_records() {
        let mut bytes = vec![0u8; 2 * CIFAR_RECORD];
        bytes[0] = 7;
        bytes[1] = 255;
        bytes[CIFAR_RECORD] = 2;
        let (pixels, labels) = parse_cifar_records(&bytes, Path::new("x.bin")).unwrap();
        assert_eq!(labels, vec![7, 2]);
        assert_eq!(pixels.len(), 2 * 3072);
        assert!((pixels[0] - 1.0).abs() < 1e-6);
        assert_eq!(pixels[1], 0.0);
    }

    #[test]
    fn test_parse_cifar_rejects_partial_record() {
        let bytes = vec![0u8; CIFAR_RECORD + 5];
        assert!(parse_cifar_records(&bytes, Path::new("x.bin")).is_err());
    }

    #[test]
    fn test_parse_idx_roundtrip() {
        let mut images = Vec::new();
        images.extend_from_slice(&IDX_IMAGES_MAGIC.to_be_bytes());
        images.extend_from_slice(&2u32.to_be_bytes());
        images.extend_from_slice(&2u32.to_be_bytes());
        images.extend_from_slice(&3u32.to_be_bytes());
        images.extend((0..12).map(|v| v as u8 * 20));
        let (pixels, rows, cols) = parse_idx_images(&images, Path::new("img")).unwrap();
        assert_eq!((rows, cols), (2, 3));
        assert_eq!(pixels.len(), 12);
        assert!((pixels[1] - 20.0 / 255.0).abs() < 1e-6);

        let mut labels = Vec::new();
        labels.extend_from_slice(&IDX_LABELS_MAGIC.to_be_bytes());
        labels.extend_from_slice(&2u32.to_be_bytes());
        labels.extend_from_slice(&[4, 9]);
        assert_eq!(parse_idx_labels(&labels, Path::new("lbl")).unwrap(), vec![4, 9]);
    }

    #[test]
    fn test_parse_idx_rejects_bad_magic() {
        let bytes = vec![0u8; 16];
        assert!(parse_idx_images(&bytes, Path::new("img")).is_err());
        assert!(parse_idx_labels(&bytes[..8], Path::new("lbl")).is_err());
    }

    #[test]
    fn test_load_data_from_mnist_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("mnist");
        std::fs::create_dir_all(&root).unwrap();

        let write_split = |prefix: &str, n: u32| {
            let mut images = Vec::new();
            images.extend_from_slice(&IDX_IMAGES_MAGIC.to_be_bytes());
            images.extend_from_slice(&n.to_be_bytes());
            images.extend_from_slice(&4u32.to_be_bytes());
            images.extend_from_slice(&4u32.to_be_bytes());
            images.extend(std::iter::repeat(128u8).take((n * 16) as usize));
            std::fs::write(root.join(format!("{prefix}-images-idx3-ubyte")), images).unwrap();

            let mut labels = Vec::new();
            labels.extend_from_slice(&IDX_LABELS_MAGIC.to_be_bytes());
            labels.extend_from_slice(&n.to_be_bytes());
            labels.extend((0..n).map(|i| (i % 10) as u8));
            std::fs::write(root.join(format!("{prefix}-labels-idx1-ubyte")), labels).unwrap();
        };
        write_split("train", 6);
        write_split("t10k", 3);

        let (train, test, shape) = load_data("mnist", dir.path()).unwrap();
        assert_eq!(shape, [1, 4, 4]);
        assert_eq!(train.len(), 6);
        assert_eq!(test.len(), 3);
        let expected = (128.0 / 255.0 - 0.1307) / 0.3081;
        assert!((train.image(0)[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_load_data_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_data("cifar10", dir.path()).unwrap_err();
        assert!(matches!(err, DataError::Read { .. }));
    }
}
