use crate::model::layers::{conv2d, instance_norm, upsample2d, ResnetBlock};
use burn::nn::conv::{Conv2d, ConvTranspose2d};
use burn::nn::InstanceNorm;
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Configuration for the geometry predictor.
///
/// The network consumes recognition features at a quarter of the image
/// resolution, so with the default single downsample and three upsamples the
/// output lands back at full resolution.
#[derive(Config, Debug)]
pub struct GeomNetConfig {
    pub input_nc: usize,
    pub output_nc: usize,
    #[config(default = 64)]
    pub ngf: usize,
    #[config(default = 3)]
    pub n_blocks: usize,
    #[config(default = 1)]
    pub n_downsampling: usize,
    #[config(default = 3)]
    pub n_upsampling: usize,
    #[config(default = 0.02)]
    pub init_gain: f64,
}

#[derive(Module, Debug)]
pub struct GeomNet<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: InstanceNorm<B>,
    down_convs: Vec<Conv2d<B>>,
    down_norms: Vec<InstanceNorm<B>>,
    blocks: Vec<ResnetBlock<B>>,
    up_convs: Vec<ConvTranspose2d<B>>,
    up_norms: Vec<InstanceNorm<B>>,
    head: Conv2d<B>,
}

impl GeomNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GeomNet<B> {
        let gain = self.init_gain;
        let stem = conv2d(self.input_nc, self.ngf, 7, 1, 3, gain, device);
        let stem_norm = instance_norm(self.ngf, device);

        let mut channels = self.ngf;
        let mut down_convs = Vec::with_capacity(self.n_downsampling);
        let mut down_norms = Vec::with_capacity(self.n_downsampling);
        for _ in 0..self.n_downsampling {
            down_convs.push(conv2d(channels, channels * 2, 3, 2, 1, gain, device));
            down_norms.push(instance_norm(channels * 2, device));
            channels *= 2;
        }

        let blocks = (0..self.n_blocks)
            .map(|_| ResnetBlock::new(channels, gain, device))
            .collect();

        let mut up_convs = Vec::with_capacity(self.n_upsampling);
        let mut up_norms = Vec::with_capacity(self.n_upsampling);
        for _ in 0..self.n_upsampling {
            let next = (channels / 2).max(1);
            up_convs.push(upsample2d(channels, next, gain, device));
            up_norms.push(instance_norm(next, device));
            channels = next;
        }

        let head = conv2d(channels, self.output_nc, 7, 1, 3, gain, device);

        GeomNet {
            stem,
            stem_norm,
            down_convs,
            down_norms,
            blocks,
            up_convs,
            up_norms,
            head,
        }
    }

    /// Side length of the prediction for square features of side `feature_size`.
    pub fn output_size(&self, feature_size: usize) -> usize {
        let mut size = feature_size;
        for _ in 0..self.n_downsampling {
            size = size.div_ceil(2);
        }
        size << self.n_upsampling
    }
}

impl<B: Backend> GeomNet<B> {
    /// Predict a geometry map in [-1, 1] from backbone features.
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = relu(self.stem_norm.forward(self.stem.forward(features)));
        for (conv, norm) in self.down_convs.iter().zip(&self.down_norms) {
            x = relu(norm.forward(conv.forward(x)));
        }
        for block in &self.blocks {
            x = block.forward(x);
        }
        for (conv, norm) in self.up_convs.iter().zip(&self.up_norms) {
            x = relu(norm.forward(conv.forward(x)));
        }
        self.head.forward(x).tanh()
    }
}
