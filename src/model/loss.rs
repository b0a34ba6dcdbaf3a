use crate::model::backbone::ImageEmbedder;
use crate::model::LossConfig;
use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use rand::Rng;

const BCE_EPS: f64 = 1e-7;
const COSINE_EPS: f64 = 1e-8;
const CLIP_MEAN: [f64; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f64; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Output of the auxiliary reconstruction path selected for the run.
#[derive(Debug, Clone)]
pub enum AuxiliaryPrediction<B: Backend> {
    /// Geometry map rescaled into [0, 1].
    Geometry(Tensor<B, 4>),
    /// Single-channel sketch in [0, 1].
    Sketch(Tensor<B, 4>),
    None,
}

impl<B: Backend> AuxiliaryPrediction<B> {
    pub fn tensor(&self) -> Option<&Tensor<B, 4>> {
        match self {
            Self::Geometry(t) | Self::Sketch(t) => Some(t),
            Self::None => None,
        }
    }

    /// Name under which the reconstruction loss is reported.
    pub fn loss_key(&self) -> Option<&'static str> {
        match self {
            Self::Geometry(_) => Some("loss_cycle_Geom"),
            Self::Sketch(_) => Some("loss_cycle_sketch"),
            Self::None => None,
        }
    }
}

/// Square crop shared between a source image and its translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchCrop {
    pub x: usize,
    pub y: usize,
    pub size: usize,
}

impl PatchCrop {
    /// Draw a crop of side `size` that fits inside a `height` x `width` image.
    pub fn sample<R: Rng + ?Sized>(rng: &mut R, height: usize, width: usize, size: usize) -> Self {
        let size = size.min(height).min(width);
        Self {
            x: rng.gen_range(0..=width - size),
            y: rng.gen_range(0..=height - size),
            size,
        }
    }

    pub fn apply<B: Backend>(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        images
            .slice_dim(2, self.y..self.y + self.size)
            .slice_dim(3, self.x..self.x + self.size)
    }
}

/// Per-patch weights: the full image counts once, each random crop 1/N.
pub fn patch_weights(n_patches: usize) -> Vec<f64> {
    let n = n_patches.max(1);
    (0..n)
        .map(|i| if i == 0 { 1.0 } else { 1.0 / n as f64 })
        .collect()
}

/// Weighted generator objective together with its unweighted parts.
#[derive(Debug, Clone)]
pub struct GeneratorLosses<B: Backend> {
    pub total: Tensor<B, 1>,
    pub cycle: Tensor<B, 1>,
    pub adversarial: Tensor<B, 1>,
    pub auxiliary: Option<Tensor<B, 1>>,
    pub semantic: Option<Tensor<B, 1>>,
}

/// Computes and weights every loss term of one training step.
#[derive(Debug, Clone)]
pub struct LossComposer {
    config: LossConfig,
}

impl LossComposer {
    pub fn new(config: LossConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Least-squares GAN criterion against a constant real (1) or fake (0) label.
    pub fn gan<B: Backend>(&self, prediction: Tensor<B, 4>, target_real: bool) -> Tensor<B, 1> {
        let target = if target_real { 1.0 } else { 0.0 };
        prediction.sub_scalar(target).square().mean()
    }

    /// Both generators are rewarded when their translations score as real.
    pub fn generator_adversarial<B: Backend>(
        &self,
        disc_a_on_fake_a: Tensor<B, 4>,
        disc_b_on_fake_b: Tensor<B, 4>,
    ) -> Tensor<B, 1> {
        self.gan(disc_a_on_fake_a, true) + self.gan(disc_b_on_fake_b, true)
    }

    /// L1 round-trip error for A->B->A plus B->A->B.
    pub fn cycle<B: Backend>(
        &self,
        real_a: Tensor<B, 4>,
        rec_a: Tensor<B, 4>,
        real_b: Tensor<B, 4>,
        rec_b: Tensor<B, 4>,
    ) -> Tensor<B, 1> {
        (rec_a - real_a).abs().mean() + (rec_b - real_b).abs().mean()
    }

    /// Binary cross-entropy between the auxiliary prediction and the side channel.
    ///
    /// Returns `None` when no auxiliary path is active.
    pub fn auxiliary<B: Backend>(
        &self,
        prediction: &AuxiliaryPrediction<B>,
        target: Tensor<B, 4>,
    ) -> Option<Tensor<B, 1>> {
        prediction
            .tensor()
            .map(|pred| binary_cross_entropy(pred.clone(), target))
    }

    /// Embedding distance between source and translated images over the full
    /// frame and every crop in `crops`.
    pub fn semantic<B: Backend, E: ImageEmbedder<B> + ?Sized>(
        &self,
        embedder: &E,
        source: Tensor<B, 4>,
        translated: Tensor<B, 4>,
        crops: &[PatchCrop],
    ) -> Tensor<B, 1> {
        let size = embedder.input_size();
        let source = to_three_channels(source);
        let translated = if translated.dims()[1] == 1 {
            clip_normalize(translated)
        } else {
            translated
        };
        let weights = patch_weights(crops.len() + 1);

        let mut pairs = vec![(resize(source.clone(), size), resize(translated.clone(), size))];
        for crop in crops {
            pairs.push((
                resize(crop.apply(source.clone()), size),
                resize(crop.apply(translated.clone()), size),
            ));
        }

        let device = source.device();
        let mut total = Tensor::<B, 1>::zeros([1], &device);
        for ((source_patch, translated_patch), weight) in pairs.into_iter().zip(weights) {
            let target = embedder.embed(source_patch).detach();
            let embedded = embedder.embed(translated_patch);
            let distance = if self.config.cos_clip {
                cosine_distance(embedded, target)
            } else {
                embedded.sub(target).square().mean()
            };
            total = total + distance.mul_scalar(weight);
        }
        total
    }

    /// `0.5 * cond_gan * (real + fake)`; callers pass fake scores computed on
    /// detached translations.
    pub fn discriminator<B: Backend>(
        &self,
        real_prediction: Tensor<B, 4>,
        fake_prediction: Tensor<B, 4>,
    ) -> Tensor<B, 1> {
        let real = self.gan(real_prediction, true);
        let fake = self.gan(fake_prediction, false);
        (real + fake).mul_scalar(self.config.cond_gan * 0.5)
    }

    /// Weighted sum of the generator terms. Disabled terms add nothing.
    pub fn compose<B: Backend>(
        &self,
        cycle: Tensor<B, 1>,
        adversarial: Tensor<B, 1>,
        auxiliary: Option<Tensor<B, 1>>,
        semantic: Option<Tensor<B, 1>>,
    ) -> GeneratorLosses<B> {
        let mut total = cycle.clone().mul_scalar(self.config.cond_cycle)
            + adversarial.clone().mul_scalar(self.config.cond_gan);
        if let Some(aux) = &auxiliary {
            total = total + aux.clone().mul_scalar(self.config.cond_geom);
        }
        if let Some(sem) = &semantic {
            total = total + sem.clone().mul_scalar(self.config.cond_recog);
        }
        GeneratorLosses {
            total,
            cycle,
            adversarial,
            auxiliary,
            semantic,
        }
    }
}

fn binary_cross_entropy<B: Backend>(prediction: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let p = prediction.clamp(BCE_EPS, 1.0 - BCE_EPS);
    let positive = target.clone() * p.clone().log();
    let negative = target.neg().add_scalar(1.0) * p.neg().add_scalar(1.0).log();
    (positive + negative).mean().neg()
}

fn cosine_distance<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 1> {
    let dot = (a.clone() * b.clone()).sum_dim(1);
    let norm_a = a.square().sum_dim(1).sqrt().clamp_min(COSINE_EPS);
    let norm_b = b.square().sum_dim(1).sqrt().clamp_min(COSINE_EPS);
    let similarity = dot / (norm_a * norm_b);
    similarity.mean().neg().add_scalar(1.0)
}

/// Broadcast a single-channel batch to three channels normalised with the
/// embedding backbone's colour statistics.
fn clip_normalize<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let planes = CLIP_MEAN
        .iter()
        .zip(CLIP_STD)
        .map(|(mean, std)| images.clone().sub_scalar(*mean).div_scalar(std))
        .collect();
    Tensor::cat(planes, 1)
}

fn to_three_channels<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    if images.dims()[1] == 1 {
        images.repeat_dim(1, 3)
    } else {
        images
    }
}

fn resize<B: Backend>(images: Tensor<B, 4>, size: usize) -> Tensor<B, 4> {
    let [_, _, height, width] = images.dims();
    if height == size && width == size {
        return images;
    }
    interpolate(
        images,
        [size, size],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}
