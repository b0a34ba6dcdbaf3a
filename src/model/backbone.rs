//! Frozen perception networks used by the auxiliary and semantic losses.
//!
//! Training only ever talks to these through [`FeatureExtractor`] and
//! [`ImageEmbedder`], so any pretrained network that can be loaded as a burn
//! record and exposes the same shapes can be swapped in.

use crate::model::layers::{conv2d, normal_init};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::nn::conv::Conv2d;
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Maps an image batch to a spatial feature map at 1/4 of the input resolution.
pub trait FeatureExtractor<B: Backend> {
    fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Maps an image batch of side [`ImageEmbedder::input_size`] to one vector per image.
pub trait ImageEmbedder<B: Backend> {
    fn input_size(&self) -> usize;
    fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

#[derive(Config, Debug)]
pub struct RecognitionConfig {
    #[config(default = 3)]
    pub input_nc: usize,
    #[config(default = 768)]
    pub feature_channels: usize,
    #[config(default = 64)]
    pub base_filters: usize,
    #[config(default = 0.02)]
    pub init_gain: f64,
}

/// Two strided conv stages; the feature map keeps a quarter of the input size.
#[derive(Module, Debug)]
pub struct RecognitionBackbone<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
}

impl RecognitionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> RecognitionBackbone<B> {
        RecognitionBackbone {
            conv1: conv2d(self.input_nc, self.base_filters, 3, 2, 1, self.init_gain, device),
            conv2: conv2d(
                self.base_filters,
                self.feature_channels,
                3,
                2,
                1,
                self.init_gain,
                device,
            ),
        }
    }

    /// Side length of the feature map for a square input.
    pub fn output_size(&self, image_size: usize) -> usize {
        image_size.div_ceil(2).div_ceil(2)
    }
}

impl<B: Backend> FeatureExtractor<B> for RecognitionBackbone<B> {
    fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.conv1.forward(images));
        relu(self.conv2.forward(x))
    }
}

#[derive(Config, Debug)]
pub struct SemanticEncoderConfig {
    #[config(default = 3)]
    pub input_nc: usize,
    #[config(default = 512)]
    pub embed_dim: usize,
    #[config(default = 224)]
    pub input_size: usize,
    #[config(default = 32)]
    pub base_filters: usize,
    #[config(default = 0.02)]
    pub init_gain: f64,
}

/// Strided conv tower, global pooling and a linear projection.
#[derive(Module, Debug)]
pub struct SemanticEncoder<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: AdaptiveAvgPool2d,
    proj: Linear<B>,
    #[module(ignore)]
    input_size: usize,
}

impl SemanticEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SemanticEncoder<B> {
        let mut convs = Vec::with_capacity(3);
        let mut channels = self.input_nc;
        let mut width = self.base_filters;
        for _ in 0..3 {
            convs.push(conv2d(channels, width, 3, 2, 1, self.init_gain, device));
            channels = width;
            width *= 2;
        }
        SemanticEncoder {
            convs,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            proj: LinearConfig::new(channels, self.embed_dim)
                .with_initializer(normal_init(self.init_gain))
                .init(device),
            input_size: self.input_size,
        }
    }
}

impl<B: Backend> ImageEmbedder<B> for SemanticEncoder<B> {
    fn input_size(&self) -> usize {
        self.input_size
    }

    fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for conv in &self.convs {
            x = relu(conv.forward(x));
        }
        let x = self.pool.forward(x);
        let [batch, channels, _, _] = x.dims();
        self.proj.forward(x.reshape([batch, channels]))
    }
}
