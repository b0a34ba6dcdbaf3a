use crate::model::layers::{conv2d, instance_norm, upsample2d, ResnetBlock};
use burn::nn::conv::{Conv2d, ConvTranspose2d};
use burn::nn::InstanceNorm;
use burn::prelude::*;
use burn::tensor::activation::{relu, sigmoid};

/// Configuration for the residual translation generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub input_nc: usize,
    pub output_nc: usize,
    #[config(default = 64)]
    pub ngf: usize,
    #[config(default = 3)]
    pub n_blocks: usize,
    #[config(default = 0.02)]
    pub init_gain: f64,
}

/// Encoder / residual blocks / decoder generator with a sigmoid head.
///
/// Spatial size is preserved; inputs must be divisible by 4.
#[derive(Module, Debug)]
pub struct ResnetGenerator<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: InstanceNorm<B>,
    down_convs: Vec<Conv2d<B>>,
    down_norms: Vec<InstanceNorm<B>>,
    blocks: Vec<ResnetBlock<B>>,
    up_convs: Vec<ConvTranspose2d<B>>,
    up_norms: Vec<InstanceNorm<B>>,
    head: Conv2d<B>,
}

impl GeneratorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResnetGenerator<B> {
        let gain = self.init_gain;
        let stem = conv2d(self.input_nc, self.ngf, 7, 1, 3, gain, device);
        let stem_norm = instance_norm(self.ngf, device);

        let mut down_convs = Vec::with_capacity(2);
        let mut down_norms = Vec::with_capacity(2);
        let mut channels = self.ngf;
        for _ in 0..2 {
            down_convs.push(conv2d(channels, channels * 2, 3, 2, 1, gain, device));
            down_norms.push(instance_norm(channels * 2, device));
            channels *= 2;
        }

        let blocks = (0..self.n_blocks)
            .map(|_| ResnetBlock::new(channels, gain, device))
            .collect();

        let mut up_convs = Vec::with_capacity(2);
        let mut up_norms = Vec::with_capacity(2);
        for _ in 0..2 {
            up_convs.push(upsample2d(channels, channels / 2, gain, device));
            up_norms.push(instance_norm(channels / 2, device));
            channels /= 2;
        }

        let head = conv2d(channels, self.output_nc, 7, 1, 3, gain, device);

        ResnetGenerator {
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
}

impl<B: Backend> ResnetGenerator<B> {
    /// Translate a batch of images in [0, 1] to the other domain, output in [0, 1].
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = relu(self.stem_norm.forward(self.stem.forward(images)));
        for (conv, norm) in self.down_convs.iter().zip(&self.down_norms) {
            x = relu(norm.forward(conv.forward(x)));
        }
        for block in &self.blocks {
            x = block.forward(x);
        }
        for (conv, norm) in self.up_convs.iter().zip(&self.up_norms) {
            x = relu(norm.forward(conv.forward(x)));
        }
        sigmoid(self.head.forward(x))
    }
}
