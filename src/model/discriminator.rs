use crate::model::layers::{conv2d, instance_norm};
use burn::nn::conv::Conv2d;
use burn::nn::InstanceNorm;
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Configuration for the PatchGAN discriminator.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub input_nc: usize,
    #[config(default = 64)]
    pub ndf: usize,
    #[config(default = 3)]
    pub n_layers: usize,
    #[config(default = 0.02)]
    pub init_gain: f64,
}

/// Fully convolutional discriminator producing one raw score per image patch.
#[derive(Module, Debug)]
pub struct PatchDiscriminator<B: Backend> {
    convs: Vec<Conv2d<B>>,
    norms: Vec<InstanceNorm<B>>,
    head: Conv2d<B>,
}

impl DiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PatchDiscriminator<B> {
        let gain = self.init_gain;
        let mut convs = Vec::with_capacity(self.n_layers + 1);
        let mut norms = Vec::with_capacity(self.n_layers);
        convs.push(conv2d(self.input_nc, self.ndf, 4, 2, 1, gain, device));

        let mut mult = 1;
        for n in 1..self.n_layers {
            let next = (1 << n).min(8);
            convs.push(conv2d(self.ndf * mult, self.ndf * next, 4, 2, 1, gain, device));
            norms.push(instance_norm(self.ndf * next, device));
            mult = next;
        }

        let next = (1 << self.n_layers).min(8);
        convs.push(conv2d(self.ndf * mult, self.ndf * next, 4, 1, 1, gain, device));
        norms.push(instance_norm(self.ndf * next, device));

        let head = conv2d(self.ndf * next, 1, 4, 1, 1, gain, device);

        PatchDiscriminator { convs, norms, head }
    }

    /// Side length of the patch score map for a square input, or `None` when
    /// the input is too small to leave any patch.
    pub fn output_size(&self, image_size: usize) -> Option<usize> {
        let mut size = image_size;
        for _ in 0..self.n_layers {
            size = conv_out(size, 4, 2, 1)?;
        }
        size = conv_out(size, 4, 1, 1)?;
        conv_out(size, 4, 1, 1)
    }
}

impl<B: Backend> PatchDiscriminator<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = leaky_relu(self.convs[0].forward(images), 0.2);
        for (conv, norm) in self.convs.iter().skip(1).zip(&self.norms) {
            x = leaky_relu(norm.forward(conv.forward(x)), 0.2);
        }
        self.head.forward(x)
    }
}

fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    (input + 2 * padding)
        .checked_sub(kernel)
        .map(|span| span / stride + 1)
}
