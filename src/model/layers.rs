use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{Initializer, InstanceNorm, InstanceNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// N(0, gain) weights for every freshly built layer.
pub fn normal_init(gain: f64) -> Initializer {
    Initializer::Normal {
        mean: 0.0,
        std: gain,
    }
}

pub fn conv2d<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    init_gain: f64,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_initializer(normal_init(init_gain))
        .init(device)
}

/// 3x3 stride-2 transposed convolution that exactly doubles the spatial size.
pub fn upsample2d<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    init_gain: f64,
    device: &B::Device,
) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .with_padding_out([1, 1])
        .with_initializer(normal_init(init_gain))
        .init(device)
}

pub fn instance_norm<B: Backend>(channels: usize, device: &B::Device) -> InstanceNorm<B> {
    InstanceNormConfig::new(channels).init(device)
}

/// Two 3x3 conv + instance-norm stages with an identity skip.
#[derive(Module, Debug)]
pub struct ResnetBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: InstanceNorm<B>,
    conv2: Conv2d<B>,
    norm2: InstanceNorm<B>,
}

impl<B: Backend> ResnetBlock<B> {
    pub fn new(channels: usize, init_gain: f64, device: &B::Device) -> Self {
        Self {
            conv1: conv2d(channels, channels, 3, 1, 1, init_gain, device),
            norm1: instance_norm(channels, device),
            conv2: conv2d(channels, channels, 3, 1, 1, init_gain, device),
            norm2: instance_norm(channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = relu(self.norm1.forward(self.conv1.forward(x.clone())));
        let out = self.norm2.forward(self.conv2.forward(out));
        x + out
    }
}
