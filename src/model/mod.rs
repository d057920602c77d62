//! Networks and the traits the harness drives them through.
//!
//! The trainer and the analysis routines only see [`InvertibleBackbone`] and
//! [`FusionGenerator`], so tests can substitute small stand-ins for the burn
//! modules.

mod fusion_net;
mod iresnet;
mod layers;

pub use fusion_net::{FusionConfig, FusionNet};
pub use iresnet::{BackboneConfig, IResNet};
pub use layers::{squeeze, unsqueeze, ActNorm, Nonlinearity, SpectralConv2d, SpectralConv2dConfig};

use burn::prelude::*;

/// Logits and latent code from one backbone pass.
#[derive(Debug, Clone)]
pub struct BackboneOutput<B: Backend> {
    pub logits: Tensor<B, 2>,
    pub latent: Tensor<B, 4>,
}

/// A classifier whose feature map is analytically invertible.
pub trait InvertibleBackbone<B: Backend> {
    /// Map images `[N, C, H, W]` to latent codes.
    fn encode(&self, x: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Classify latent codes into `[N, num_classes]` logits.
    fn classify(&self, z: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Map latent codes back to image space.
    fn inverse(&self, z: Tensor<B, 4>) -> Tensor<B, 4>;

    fn num_classes(&self) -> usize;

    /// Input shape `[C, H, W]` of every residual block, in order.
    fn in_shapes(&self) -> Vec<[usize; 3]>;

    fn forward(&self, x: Tensor<B, 4>) -> BackboneOutput<B> {
        let latent = self.encode(x);
        BackboneOutput {
            logits: self.classify(latent.clone()),
            latent,
        }
    }

    /// Effective spectral norm of every normalized layer.
    fn spectral_norms(&self) -> Vec<f32> {
        Vec::new()
    }

    /// The argument of each residual branch for input `x`, in block order.
    fn block_inputs(&self, _x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        Vec::new()
    }

    /// Evaluate residual branch `block` at `h`.
    fn residual(&self, _block: usize, h: Tensor<B, 4>) -> Tensor<B, 4> {
        h.zeros_like()
    }
}

/// Blends a stack of actor images `[N, nactors, C, H, W]` into one image
/// `[N, C, H, W]` per row.
pub trait FusionGenerator<B: Backend> {
    fn fuse(&self, actors: Tensor<B, 5>) -> Tensor<B, 4>;
}

/// Read any tensor back to host memory as f32.
pub fn to_vec_f32<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// Index of the largest logit in every row of a row-major `[N, K]` buffer.
pub fn argmax_rows(logits: &[f32], num_classes: usize) -> Vec<usize> {
    logits
        .chunks(num_classes)
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}
