//! Image datasets: in-memory splits, batch loading, dataset providers and
//! `.npy` array I/O.

pub mod npy;
mod provider;

pub use provider::{load_data, parse_cifar_records, parse_idx_images, parse_idx_labels, DatasetKind};

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::DataError;

/// An ordered, finite collection of `(image [C, H, W], label)` pairs stored
/// contiguously.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    shape: [usize; 3],
    pixels: Vec<f32>,
    labels: Vec<usize>,
}

impl ImageDataset {
    pub fn new(shape: [usize; 3], pixels: Vec<f32>, labels: Vec<usize>) -> Result<Self, DataError> {
        let item = shape.iter().product::<usize>();
        if item == 0 || pixels.len() != item * labels.len() {
            return Err(DataError::Malformed {
                path: "<memory>".into(),
                reason: format!(
                    "{} pixels do not fit {} images of shape {:?}",
                    pixels.len(),
                    labels.len(),
                    shape
                ),
            });
        }
        Ok(ImageDataset {
            shape,
            pixels,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Per-image shape `[C, H, W]`.
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    fn item_len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn image(&self, index: usize) -> &[f32] {
        let n = self.item_len();
        &self.pixels[index * n..(index + 1) * n]
    }

    pub fn label(&self, index: usize) -> usize {
        self.labels[index]
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Fail on the first label that is not below `num_classes`.
    pub fn check_labels(&self, num_classes: usize) -> Result<(), DataError> {
        match self.labels.iter().copied().max() {
            Some(label) if label >= num_classes => Err(DataError::LabelOutOfRange { label, num_classes }),
            _ => Ok(()),
        }
    }

    /// Gather the given indices into a batch, in order.
    pub fn batch(&self, indices: &[usize]) -> Batch {
        let mut images = Vec::with_capacity(indices.len() * self.item_len());
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            images.extend_from_slice(self.image(i));
            labels.push(self.labels[i]);
        }
        Batch {
            shape: self.shape,
            images,
            labels,
        }
    }

    /// The first `n` items (or fewer if the dataset is smaller).
    pub fn head(&self, n: usize) -> Batch {
        let indices: Vec<usize> = (0..n.min(self.len())).collect();
        self.batch(&indices)
    }

    /// A new dataset holding only the items whose label satisfies `keep`.
    pub fn filter_labels(&self, keep: impl Fn(usize) -> bool) -> ImageDataset {
        let indices: Vec<usize> = (0..self.len()).filter(|&i| keep(self.labels[i])).collect();
        let batch = self.batch(&indices);
        ImageDataset {
            shape: self.shape,
            pixels: batch.images,
            labels: batch.labels,
        }
    }
}

/// A batch of images with their labels, still in host memory.
#[derive(Debug, Clone)]
pub struct Batch {
    pub shape: [usize; 3],
    pub images: Vec<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Upload the images as a `[N, C, H, W]` tensor.
    pub fn images_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let [c, h, w] = self.shape;
        Tensor::<B, 4>::from_data(
            TensorData::new(self.images.clone(), [self.len(), c, h, w]),
            device,
        )
    }
}

/// Iterates a dataset in batches, optionally reshuffling on every pass.
pub struct DataLoader<'a> {
    dataset: &'a ImageDataset,
    batch_size: usize,
    shuffle: bool,
}

impl<'a> DataLoader<'a> {
    pub fn new(dataset: &'a ImageDataset, batch_size: usize, shuffle: bool) -> Self {
        DataLoader {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
        }
    }

    pub fn dataset(&self) -> &'a ImageDataset {
        self.dataset
    }

    /// Number of batches per pass; the last batch may be short.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Start a new pass over the dataset.
    pub fn iter<R: Rng + ?Sized>(&self, rng: &mut R) -> BatchIter<'a> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(rng);
        }
        BatchIter {
            dataset: self.dataset,
            order,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }
}

pub struct BatchIter<'a> {
    dataset: &'a ImageDataset,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.dataset.batch(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }
}
