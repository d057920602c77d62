use burn::module::{Ignored, Param};
use burn::prelude::*;
use burn::tensor::activation;
use burn::tensor::module::{conv2d, conv_transpose2d};
use burn::tensor::ops::{ConvOptions, ConvTransposeOptions};
use burn::tensor::Distribution;

use crate::model::to_vec_f32;

/// Elementwise nonlinearity used inside residual branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nonlinearity {
    Elu,
    Relu,
    LeakyRelu,
    Softplus,
}

impl Nonlinearity {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Nonlinearity::Relu => activation::relu(x),
            Nonlinearity::LeakyRelu => activation::leaky_relu(x, 0.01),
            Nonlinearity::Elu => {
                let positive = x.clone().clamp_min(0.0);
                let negative = x.clamp_max(0.0).exp().sub_scalar(1.0);
                positive + negative
            }
            Nonlinearity::Softplus => {
                // relu(x) + log(1 + exp(-|x|)) stays finite for large |x|
                let positive = x.clone().clamp_min(0.0);
                let tail = x.abs().neg().exp().add_scalar(1.0).log();
                positive + tail
            }
        }
    }
}

/// Space-to-depth by a factor of two: `[N, C, H, W] -> [N, 4C, H/2, W/2]`.
pub fn squeeze<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [n, c, h, w] = x.dims();
    x.reshape([n, c, h / 2, 2, w / 2, 2])
        .permute([0, 1, 3, 5, 2, 4])
        .reshape([n, c * 4, h / 2, w / 2])
}

/// Inverse of [`squeeze`].
pub fn unsqueeze<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [n, c, h, w] = x.dims();
    x.reshape([n, c / 4, 2, 2, h, w])
        .permute([0, 1, 4, 2, 5, 3])
        .reshape([n, c / 4, h * 2, w * 2])
}

/// Per-channel affine normalization, `y = (x + bias) * exp(log_scale)`,
/// initialized from data.
#[derive(Module, Debug)]
pub struct ActNorm<B: Backend> {
    bias: Param<Tensor<B, 1>>,
    log_scale: Param<Tensor<B, 1>>,
}

impl<B: Backend> ActNorm<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        ActNorm {
            bias: Param::from_tensor(Tensor::zeros([channels], device)),
            log_scale: Param::from_tensor(Tensor::zeros([channels], device)),
        }
    }

    fn broadcast(t: Tensor<B, 1>) -> Tensor<B, 4> {
        let [c] = t.dims();
        t.reshape([1, c, 1, 1])
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        (x + Self::broadcast(self.bias.val())) * Self::broadcast(self.log_scale.val()).exp()
    }

    pub fn inverse(&self, y: Tensor<B, 4>) -> Tensor<B, 4> {
        y * Self::broadcast(self.log_scale.val()).neg().exp() - Self::broadcast(self.bias.val())
    }

    /// Set bias and scale so that `x` comes out with zero mean and unit
    /// variance per channel.
    pub fn initialized(self, x: Tensor<B, 4>) -> Self {
        let [_, c, _, _] = x.dims();
        let flat = x.detach().swap_dims(0, 1).reshape([c as i32, -1]);
        let mean = flat.clone().mean_dim(1);
        let var = (flat - mean.clone()).powf_scalar(2.0).mean_dim(1);
        let std = var.sqrt().add_scalar(1e-6);
        ActNorm {
            bias: Param::from_tensor(mean.neg().reshape([c])),
            log_scale: Param::from_tensor(std.log().neg().reshape([c])),
        }
    }
}

/// Configuration for [`SpectralConv2d`].
#[derive(Debug, Clone)]
pub struct SpectralConv2dConfig {
    pub channels: [usize; 2],
    pub kernel: usize,
    /// Spatial size `[H, W]` of the inputs the layer will see.
    pub input_hw: [usize; 2],
    pub coeff: f32,
    pub power_iter: usize,
}

impl SpectralConv2dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SpectralConv2d<B> {
        let [c_in, c_out] = self.channels;
        let k = self.kernel;
        let std = (2.0 / (c_in * k * k) as f64).sqrt();
        SpectralConv2d {
            weight: Param::from_tensor(Tensor::random(
                [c_out, c_in, k, k],
                Distribution::Normal(0.0, std),
                device,
            )),
            bias: Param::from_tensor(Tensor::zeros([c_out], device)),
            padding: Ignored(k / 2),
            input_hw: Ignored(self.input_hw),
            coeff: Ignored(self.coeff),
            power_iter: Ignored(self.power_iter.max(1)),
        }
    }
}

/// Same-padded convolution whose kernel is rescaled so that the operator
/// norm of the convolution never exceeds `coeff`.
///
/// The norm is estimated by power iteration through the convolution and its
/// transpose at the configured input size, restarted from a fixed vector on
/// every call so the layer stays stateless.
#[derive(Module, Debug)]
pub struct SpectralConv2d<B: Backend> {
    weight: Param<Tensor<B, 4>>,
    bias: Param<Tensor<B, 1>>,
    padding: Ignored<usize>,
    input_hw: Ignored<[usize; 2]>,
    coeff: Ignored<f32>,
    power_iter: Ignored<usize>,
}

fn l2_normalize<B: Backend>(t: Tensor<B, 4>) -> Tensor<B, 4> {
    let norm = t.clone().powf_scalar(2.0).sum().sqrt().add_scalar(1e-12);
    t / norm.reshape([1, 1, 1, 1])
}

impl<B: Backend> SpectralConv2d<B> {
    fn conv_options(&self) -> ConvOptions<2> {
        let p = *self.padding;
        ConvOptions::new([1, 1], [p, p], [1, 1], 1)
    }

    /// Largest singular value of the bias-free convolution, shape `[1]`.
    fn sigma(&self) -> Tensor<B, 1> {
        let w = self.weight.val();
        let fixed = w.clone().detach();
        let [_, c_in, _, _] = w.dims();
        let [h, wd] = *self.input_hw;
        let p = *self.padding;
        let transpose_options = ConvTransposeOptions::new([1, 1], [p, p], [0, 0], [1, 1], 1);

        let mut v = l2_normalize(Tensor::<B, 4>::ones([1, c_in, h, wd], &fixed.device()));
        let mut u = l2_normalize(conv2d(v.clone(), fixed.clone(), None, self.conv_options()));
        for _ in 1..*self.power_iter {
            v = l2_normalize(conv_transpose2d(u, fixed.clone(), None, transpose_options.clone()));
            u = l2_normalize(conv2d(v.clone(), fixed.clone(), None, self.conv_options()));
        }
        (u * conv2d(v, w, None, self.conv_options())).sum()
    }

    /// Kernel after rescaling to the configured bound.
    fn normalized_weight(&self) -> Tensor<B, 4> {
        let scale = self.sigma().div_scalar(*self.coeff).clamp_min(1.0);
        self.weight.val() / scale.reshape([1, 1, 1, 1])
    }

    /// Spectral norm of the convolution actually applied in `forward`.
    pub fn effective_norm(&self) -> f32 {
        let sigma = to_vec_f32(self.sigma()).first().copied().unwrap_or(f32::NAN);
        sigma.min(*self.coeff)
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        conv2d(
            x,
            self.normalized_weight(),
            Some(self.bias.val()),
            self.conv_options(),
        )
    }
}
