use burn::module::Ignored;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation;

use crate::error::ConfigError;
use crate::model::layers::{squeeze, unsqueeze, ActNorm, Nonlinearity, SpectralConv2d, SpectralConv2dConfig};
use crate::model::InvertibleBackbone;

/// Topology of the invertible backbone.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    /// Residual blocks per stage.
    pub n_blocks: Vec<usize>,
    /// 2 squeezes the stage input, 1 keeps the resolution.
    pub n_strides: Vec<usize>,
    /// Hidden width of the residual branches per stage.
    pub n_channels: Vec<usize>,
    pub n_classes: usize,
    /// Initial space-to-depth factor (1 or 2).
    pub init_ds: usize,
    /// Zero channels appended before the first stage.
    pub inj_pad: usize,
    /// Upper bound on the spectral norm of every residual convolution.
    pub coeff: f32,
    pub power_iter: usize,
    /// Fixed-point iterations used to invert each block.
    pub inverse_iters: usize,
    pub actnorm: bool,
    pub nonlin: Nonlinearity,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        BackboneConfig {
            n_blocks: vec![4, 4, 4],
            n_strides: vec![1, 2, 2],
            n_channels: vec![16, 64, 256],
            n_classes: 10,
            init_ds: 2,
            inj_pad: 0,
            coeff: 0.9,
            power_iter: 5,
            inverse_iters: 20,
            actnorm: true,
            nonlin: Nonlinearity::Elu,
        }
    }
}

impl BackboneConfig {
    /// Build the network for inputs of shape `[C, H, W]`.
    pub fn init<B: Backend>(
        &self,
        in_shape: [usize; 3],
        device: &B::Device,
    ) -> Result<IResNet<B>, ConfigError> {
        let [mut c, mut h, mut w] = in_shape;
        let downsample = |c: &mut usize, h: &mut usize, w: &mut usize| {
            if *h % 2 != 0 || *w % 2 != 0 {
                return Err(ConfigError::Validation(format!(
                    "cannot squeeze a {h}x{w} feature map; adjust backbone.n_strides or init_ds"
                )));
            }
            *c *= 4;
            *h /= 2;
            *w /= 2;
            Ok(())
        };
        if self.init_ds == 2 {
            downsample(&mut c, &mut h, &mut w)?;
        }
        c += self.inj_pad;

        let mut stages = Vec::with_capacity(self.n_blocks.len());
        let mut in_shapes = Vec::new();
        for ((&blocks, &stride), &hidden) in self
            .n_blocks
            .iter()
            .zip(self.n_strides.iter())
            .zip(self.n_channels.iter())
        {
            if stride == 2 {
                downsample(&mut c, &mut h, &mut w)?;
            }
            let blocks = (0..blocks)
                .map(|_| {
                    in_shapes.push([c, h, w]);
                    self.init_block(c, hidden, [h, w], device)
                })
                .collect();
            stages.push(Stage {
                blocks,
                squeeze: Ignored(stride == 2),
            });
        }

        Ok(IResNet {
            stages,
            classifier: LinearConfig::new(c, self.n_classes).init(device),
            init_ds: Ignored(self.init_ds),
            inj_pad: Ignored(self.inj_pad),
            inverse_iters: Ignored(self.inverse_iters),
            in_shapes: Ignored(in_shapes),
            num_classes: Ignored(self.n_classes),
        })
    }

    fn init_block<B: Backend>(
        &self,
        channels: usize,
        hidden: usize,
        input_hw: [usize; 2],
        device: &B::Device,
    ) -> IResBlock<B> {
        let conv = |c_in: usize, c_out: usize, kernel: usize| {
            SpectralConv2dConfig {
                channels: [c_in, c_out],
                kernel,
                input_hw,
                coeff: self.coeff,
                power_iter: self.power_iter,
            }
            .init(device)
        };
        IResBlock {
            actnorm: self.actnorm.then(|| ActNorm::new(channels, device)),
            conv1: conv(channels, hidden, 3),
            conv2: conv(hidden, hidden, 1),
            conv3: conv(hidden, channels, 3),
            nonlin: Ignored(self.nonlin),
        }
    }
}

/// `y = actnorm(x) + g(actnorm(x))` with a contractive branch `g`.
#[derive(Module, Debug)]
pub struct IResBlock<B: Backend> {
    actnorm: Option<ActNorm<B>>,
    conv1: SpectralConv2d<B>,
    conv2: SpectralConv2d<B>,
    conv3: SpectralConv2d<B>,
    nonlin: Ignored<Nonlinearity>,
}

impl<B: Backend> IResBlock<B> {
    fn normalize(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.actnorm {
            Some(norm) => norm.forward(x),
            None => x,
        }
    }

    fn branch(&self, h: Tensor<B, 4>) -> Tensor<B, 4> {
        let nl = *self.nonlin;
        let h = self.conv1.forward(nl.apply(h));
        let h = self.conv2.forward(nl.apply(h));
        self.conv3.forward(nl.apply(h))
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = self.normalize(x);
        h.clone() + self.branch(h)
    }

    /// Fixed-point inversion; converges because `g` is a contraction.
    fn inverse(&self, y: Tensor<B, 4>, iters: usize) -> Tensor<B, 4> {
        let mut h = y.clone();
        for _ in 0..iters {
            h = y.clone() - self.branch(h);
        }
        match &self.actnorm {
            Some(norm) => norm.inverse(h),
            None => h,
        }
    }

    fn spectral_norms(&self) -> [f32; 3] {
        [
            self.conv1.effective_norm(),
            self.conv2.effective_norm(),
            self.conv3.effective_norm(),
        ]
    }
}

#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    blocks: Vec<IResBlock<B>>,
    squeeze: Ignored<bool>,
}

/// Invertible residual network with a linear classifier on pooled latents.
#[derive(Module, Debug)]
pub struct IResNet<B: Backend> {
    stages: Vec<Stage<B>>,
    classifier: Linear<B>,
    init_ds: Ignored<usize>,
    inj_pad: Ignored<usize>,
    inverse_iters: Ignored<usize>,
    in_shapes: Ignored<Vec<[usize; 3]>>,
    num_classes: Ignored<usize>,
}

impl<B: Backend> IResNet<B> {
    fn pre_process(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = if *self.init_ds == 2 { squeeze(x) } else { x };
        if *self.inj_pad == 0 {
            return x;
        }
        let [n, _, h, w] = x.dims();
        let pad = Tensor::zeros([n, *self.inj_pad, h, w], &x.device());
        Tensor::cat(vec![x, pad], 1)
    }

    fn post_process(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = if *self.inj_pad == 0 {
            x
        } else {
            let [_, c, _, _] = x.dims();
            x.narrow(1, 0, c - *self.inj_pad)
        };
        if *self.init_ds == 2 {
            unsqueeze(x)
        } else {
            x
        }
    }

    /// Initialize every ActNorm layer from the statistics of `x`, layer by
    /// layer, so each sees the already-normalized output of its predecessors.
    pub fn init_actnorm(mut self, x: Tensor<B, 4>) -> Self {
        let mut h = self.pre_process(x);
        for stage in self.stages.iter_mut() {
            if *stage.squeeze {
                h = squeeze(h);
            }
            for block in stage.blocks.iter_mut() {
                if let Some(norm) = block.actnorm.take() {
                    block.actnorm = Some(norm.initialized(h.clone()));
                }
                h = block.forward(h);
            }
        }
        self
    }

    fn blocks(&self) -> impl Iterator<Item = &IResBlock<B>> {
        self.stages.iter().flat_map(|s| s.blocks.iter())
    }
}

impl<B: Backend> InvertibleBackbone<B> for IResNet<B> {
    fn encode(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut h = self.pre_process(x);
        for stage in &self.stages {
            if *stage.squeeze {
                h = squeeze(h);
            }
            for block in &stage.blocks {
                h = block.forward(h);
            }
        }
        h
    }

    fn classify(&self, z: Tensor<B, 4>) -> Tensor<B, 2> {
        let [n, c, _, _] = z.dims();
        let pooled = activation::relu(z).mean_dim(3).mean_dim(2).reshape([n, c]);
        self.classifier.forward(pooled)
    }

    fn inverse(&self, z: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut h = z;
        for stage in self.stages.iter().rev() {
            for block in stage.blocks.iter().rev() {
                h = block.inverse(h, *self.inverse_iters);
            }
            if *stage.squeeze {
                h = unsqueeze(h);
            }
        }
        self.post_process(h)
    }

    fn num_classes(&self) -> usize {
        *self.num_classes
    }

    fn in_shapes(&self) -> Vec<[usize; 3]> {
        self.in_shapes.0.clone()
    }

    fn spectral_norms(&self) -> Vec<f32> {
        self.blocks().flat_map(|b| b.spectral_norms()).collect()
    }

    fn block_inputs(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut inputs = Vec::new();
        let mut h = self.pre_process(x);
        for stage in &self.stages {
            if *stage.squeeze {
                h = squeeze(h);
            }
            for block in &stage.blocks {
                let normalized = block.normalize(h);
                inputs.push(normalized.clone());
                h = normalized.clone() + block.branch(normalized);
            }
        }
        inputs
    }

    fn residual(&self, block: usize, h: Tensor<B, 4>) -> Tensor<B, 4> {
        match self.blocks().nth(block) {
            Some(b) => b.branch(h),
            None => h.zeros_like(),
        }
    }
}
