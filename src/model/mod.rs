pub mod backbone;
pub mod discriminator;
pub mod generator;
pub mod geometry;
pub mod layers;
pub mod loss;

use burn::prelude::*;

pub use backbone::{
    FeatureExtractor, ImageEmbedder, RecognitionBackbone, RecognitionConfig, SemanticEncoder,
    SemanticEncoderConfig,
};
pub use discriminator::{DiscriminatorConfig, PatchDiscriminator};
pub use generator::{GeneratorConfig, ResnetGenerator};
pub use geometry::{GeomNet, GeomNetConfig};
pub use loss::{AuxiliaryPrediction, GeneratorLosses, LossComposer, PatchCrop};

/// Channel counts and widths for every network in the model set.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 3)]
    pub input_nc: usize,
    #[config(default = 3)]
    pub output_nc: usize,
    #[config(default = 3)]
    pub geom_nc: usize,
    #[config(default = 64)]
    pub ngf: usize,
    #[config(default = 64)]
    pub ndf: usize,
    #[config(default = 3)]
    pub n_blocks: usize,
    #[config(default = 3)]
    pub n_layers_d: usize,
    #[config(default = 768)]
    pub recog_feature_channels: usize,
    #[config(default = 64)]
    pub geom_filters: usize,
    #[config(default = 512)]
    pub embed_dim: usize,
    #[config(default = 224)]
    pub embed_size: usize,
    #[config(default = 0.02)]
    pub init_gain: f64,
}

/// Weights for each loss term and the semantic patch sampling.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = 1.0)]
    pub cond_cycle: f64,
    #[config(default = 1.0)]
    pub cond_gan: f64,
    #[config(default = 10.0)]
    pub cond_geom: f64,
    #[config(default = 10.0)]
    pub cond_recog: f64,
    #[config(default = 1)]
    pub n_patches: usize,
    #[config(default = 128)]
    pub patch_size: usize,
    #[config(default = false)]
    pub cos_clip: bool,
}

impl ModelConfig {
    /// A -> B translator.
    pub fn generator_a_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(self.input_nc, self.output_nc)
            .with_ngf(self.ngf)
            .with_n_blocks(self.n_blocks)
            .with_init_gain(self.init_gain)
    }

    /// B -> A translator.
    pub fn generator_b_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(self.output_nc, self.input_nc)
            .with_ngf(self.ngf)
            .with_n_blocks(self.n_blocks)
            .with_init_gain(self.init_gain)
    }

    pub fn discriminator_config(&self, input_nc: usize) -> DiscriminatorConfig {
        DiscriminatorConfig::new(input_nc)
            .with_ndf(self.ndf)
            .with_n_layers(self.n_layers_d)
            .with_init_gain(self.init_gain)
    }

    pub fn geom_config(&self) -> GeomNetConfig {
        GeomNetConfig::new(self.recog_feature_channels, self.geom_nc)
            .with_ngf(self.geom_filters)
            .with_n_blocks(self.n_blocks)
            .with_init_gain(self.init_gain)
    }

    /// Sketch network reading translated images and emitting one channel.
    pub fn sketch_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(3, 1)
            .with_ngf(self.ngf)
            .with_n_blocks(self.n_blocks)
            .with_init_gain(self.init_gain)
    }

    pub fn recognition_config(&self) -> RecognitionConfig {
        RecognitionConfig::new()
            .with_feature_channels(self.recog_feature_channels)
            .with_init_gain(self.init_gain)
    }

    pub fn semantic_config(&self) -> SemanticEncoderConfig {
        SemanticEncoderConfig::new()
            .with_embed_dim(self.embed_dim)
            .with_input_size(self.embed_size)
            .with_init_gain(self.init_gain)
    }

    pub fn init_generator_a<B: Backend>(&self, device: &B::Device) -> ResnetGenerator<B> {
        self.generator_a_config().init(device)
    }

    pub fn init_generator_b<B: Backend>(&self, device: &B::Device) -> ResnetGenerator<B> {
        self.generator_b_config().init(device)
    }

    /// Discriminator judging domain A images.
    pub fn init_discriminator_a<B: Backend>(&self, device: &B::Device) -> PatchDiscriminator<B> {
        self.discriminator_config(self.input_nc).init(device)
    }

    /// Discriminator judging domain B images.
    pub fn init_discriminator_b<B: Backend>(&self, device: &B::Device) -> PatchDiscriminator<B> {
        self.discriminator_config(self.output_nc).init(device)
    }
}
