use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu};
use burn::prelude::*;

use crate::model::FusionGenerator;

/// Fusion generator settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Number of images fused into one composite.
    pub nactors: usize,
    /// Treat the actor stack as a single wide input rather than `nactors`
    /// separate inputs. Changes only the checkpoint naming.
    pub concat_input: bool,
    /// Channels per actor image.
    pub input_nc: usize,
    pub output_nc: usize,
    /// Base width of the generator.
    pub ngf: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            nactors: 2,
            concat_input: false,
            input_nc: 3,
            output_nc: 3,
            ngf: 8,
        }
    }
}

impl FusionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FusionNet<B> {
        let in_channels = self.input_nc * self.nactors;
        let conv = |c_in: usize, c_out: usize| {
            Conv2dConfig::new([c_in, c_out], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: 0.02,
                })
                .init(device)
        };
        FusionNet {
            conv_in: conv(in_channels, self.ngf),
            norm_in: BatchNormConfig::new(self.ngf).init(device),
            conv_mid: conv(self.ngf, self.ngf * 2),
            norm_mid: BatchNormConfig::new(self.ngf * 2).init(device),
            conv_out: conv(self.ngf * 2, self.output_nc),
            relu: Relu::new(),
        }
    }
}

/// Fusion network architecture.
///
/// ```text
/// Input:  [batch, nactors, C, H, W] -> [batch, nactors * C, H, W]
/// Conv:   nactors*C -> ngf, 3x3 same, BatchNorm, ReLU
/// Conv:   ngf -> 2*ngf, 3x3 same, BatchNorm, ReLU
/// Conv:   2*ngf -> output_nc, 3x3 same
/// ```
#[derive(Module, Debug)]
pub struct FusionNet<B: Backend> {
    conv_in: Conv2d<B>,
    norm_in: BatchNorm<B, 2>,
    conv_mid: Conv2d<B>,
    norm_mid: BatchNorm<B, 2>,
    conv_out: Conv2d<B>,
    relu: Relu,
}

impl<B: Backend> FusionNet<B> {
    pub fn forward(&self, actors: Tensor<B, 5>) -> Tensor<B, 4> {
        let [n, k, c, h, w] = actors.dims();
        let x = actors.reshape([n, k * c, h, w]);
        let x = self.relu.forward(self.norm_in.forward(self.conv_in.forward(x)));
        let x = self.relu.forward(self.norm_mid.forward(self.conv_mid.forward(x)));
        self.conv_out.forward(x)
    }
}

impl<B: Backend> FusionGenerator<B> for FusionNet<B> {
    fn fuse(&self, actors: Tensor<B, 5>) -> Tensor<B, 4> {
        self.forward(actors)
    }
}
