use crate::model::{
    AuxiliaryPrediction, FeatureExtractor, GeomNet, ImageEmbedder, ModelConfig, PatchDiscriminator,
    RecognitionBackbone, ResnetGenerator, SemanticEncoder,
};
use burn::prelude::*;
use std::fmt;

/// Checkpointed networks, named after their on-disk file stems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    GenA,
    GenB,
    DiscA,
    DiscB,
    Geom,
}

impl ModelRole {
    pub const ADVERSARIAL: [ModelRole; 4] = [
        ModelRole::GenA,
        ModelRole::GenB,
        ModelRole::DiscA,
        ModelRole::DiscB,
    ];

    pub fn file_stem(self) -> &'static str {
        match self {
            ModelRole::GenA => "netG_A",
            ModelRole::GenB => "netG_B",
            ModelRole::DiscA => "netD_A",
            ModelRole::DiscB => "netD_B",
            ModelRole::Geom => "netGeom",
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// The auxiliary reconstruction path chosen once from configuration.
#[derive(Debug, Clone)]
pub enum AuxiliaryNetwork<B: Backend> {
    Geometry {
        recognition: RecognitionBackbone<B>,
        geom: GeomNet<B>,
        trainable: bool,
    },
    Sketch {
        sketch: ResnetGenerator<B>,
    },
    None,
}

impl<B: Backend> AuxiliaryNetwork<B> {
    /// Run the auxiliary path on translated images.
    pub fn predict(&self, translated: Tensor<B, 4>) -> AuxiliaryPrediction<B> {
        match self {
            AuxiliaryNetwork::Geometry {
                recognition, geom, ..
            } => {
                let features = recognition.features(three_channels(translated));
                let geometry = geom.forward(features).add_scalar(1.0).div_scalar(2.0);
                AuxiliaryPrediction::Geometry(geometry)
            }
            AuxiliaryNetwork::Sketch { sketch } => {
                AuxiliaryPrediction::Sketch(sketch.forward(three_channels(translated)))
            }
            AuxiliaryNetwork::None => AuxiliaryPrediction::None,
        }
    }

    /// Geometry network, when it receives gradient updates.
    pub fn trainable_geom(&self) -> Option<&GeomNet<B>> {
        match self {
            AuxiliaryNetwork::Geometry {
                geom,
                trainable: true,
                ..
            } => Some(geom),
            _ => None,
        }
    }

    pub fn trainable_geom_mut(&mut self) -> Option<&mut GeomNet<B>> {
        match self {
            AuxiliaryNetwork::Geometry {
                geom,
                trainable: true,
                ..
            } => Some(geom),
            _ => None,
        }
    }
}

fn three_channels<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    if images.dims()[1] == 1 {
        images.repeat_dim(1, 3)
    } else {
        images
    }
}

/// Every network taking part in a training run.
///
/// Generators and discriminators are always trainable. Frozen networks have
/// gradient tracking disabled but still pass gradients through to their
/// inputs.
#[derive(Debug, Clone)]
pub struct ModelSet<B: Backend> {
    pub gen_a: ResnetGenerator<B>,
    pub gen_b: ResnetGenerator<B>,
    pub disc_a: PatchDiscriminator<B>,
    pub disc_b: PatchDiscriminator<B>,
    pub auxiliary: AuxiliaryNetwork<B>,
    pub semantic: Option<SemanticEncoder<B>>,
}

impl<B: Backend> ModelSet<B> {
    /// Freshly initialised generators and discriminators, no auxiliary networks.
    pub fn init(config: &ModelConfig, device: &B::Device) -> Self {
        Self {
            gen_a: config.init_generator_a(device),
            gen_b: config.init_generator_b(device),
            disc_a: config.init_discriminator_a(device),
            disc_b: config.init_discriminator_b(device),
            auxiliary: AuxiliaryNetwork::None,
            semantic: None,
        }
    }

    pub fn with_auxiliary(mut self, auxiliary: AuxiliaryNetwork<B>) -> Self {
        self.auxiliary = auxiliary;
        self
    }

    pub fn with_semantic(mut self, semantic: Option<SemanticEncoder<B>>) -> Self {
        self.semantic = semantic;
        self
    }

    /// Roles that own an optimizer in this run.
    pub fn trainable_roles(&self) -> Vec<ModelRole> {
        let mut roles = ModelRole::ADVERSARIAL.to_vec();
        if self.auxiliary.trainable_geom().is_some() {
            roles.push(ModelRole::Geom);
        }
        roles
    }

    pub fn semantic_embedder(&self) -> Option<&dyn ImageEmbedder<B>> {
        self.semantic
            .as_ref()
            .map(|encoder| encoder as &dyn ImageEmbedder<B>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GeneratorConfig, GeomNetConfig, RecognitionConfig};
    use burn::backend::NdArray;

    type TB = NdArray<f32>;

    #[test]
    fn geometry_prediction_is_rescaled_to_unit_range() {
        let device = Default::default();
        let auxiliary = AuxiliaryNetwork::Geometry {
            recognition: RecognitionConfig::new()
                .with_feature_channels(8)
                .with_base_filters(4)
                .init::<TB>(&device),
            geom: GeomNetConfig::new(8, 3)
                .with_ngf(4)
                .with_n_blocks(1)
                .init(&device),
            trainable: true,
        };
        // single-channel translations are broadcast before the backbone
        let translated = Tensor::<TB, 4>::ones([1, 1, 16, 16], &device);
        let prediction = auxiliary.predict(translated);
        let tensor = prediction.tensor().expect("geometry output").clone();
        assert_eq!(tensor.dims(), [1, 3, 16, 16]);
        let values = tensor.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(auxiliary.trainable_geom().is_some());
    }

    #[test]
    fn trainable_roles_follow_geometry_finetuning() {
        let device = Default::default();
        let config = ModelConfig::new().with_ngf(4).with_ndf(4).with_n_blocks(1);
        let models = ModelSet::<TB>::init(&config, &device);
        assert_eq!(models.trainable_roles(), ModelRole::ADVERSARIAL.to_vec());

        let sketch = AuxiliaryNetwork::Sketch {
            sketch: GeneratorConfig::new(3, 1).with_ngf(4).with_n_blocks(1).init(&device),
        };
        let models = models.with_auxiliary(sketch);
        assert!(matches!(models.auxiliary, AuxiliaryNetwork::Sketch { .. }));
        assert!(!models.trainable_roles().contains(&ModelRole::Geom));
        assert_eq!(ModelRole::Geom.to_string(), "netGeom");
    }
}
