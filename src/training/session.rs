use crate::data::{BatchResult, ImageBatch};
use crate::error::{BatchError, TrainError, TrainResult};
use crate::model::{
    AuxiliaryPrediction, GeomNet, LossComposer, PatchCrop, PatchDiscriminator, ResnetGenerator,
    SemanticEncoder,
};
use crate::training::checkpoint::{load_record_file, CheckpointManager, EpochTag, TrainingState};
use crate::training::models::{AuxiliaryNetwork, ModelRole, ModelSet};
use crate::training::observer::{LossAccumulator, TrainingObserver};
use crate::training::schedule::{LinearDecayLr, ScheduleController};
use crate::training::slot::TrainableSlot;
use crate::training::{CancellationToken, TrainingConfig};
use crate::utils::tensor_to_images;
use anyhow::Context;
use burn::module::Module;
use burn::optim::AdamConfig;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use image::RgbImage;
use rand::{rngs::StdRng, SeedableRng};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How an epoch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochOutcome {
    Completed,
    Cancelled,
}

/// Scalars produced by one training step, keyed by loss name.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub scalars: BTreeMap<String, f64>,
}

/// Detached tensors of the most recent step, kept for sample images.
#[derive(Debug, Clone)]
struct StepVisuals<B: Backend> {
    real_a: Tensor<B, 4>,
    real_b: Tensor<B, 4>,
    fake_a: Tensor<B, 4>,
    fake_b: Tensor<B, 4>,
    rec_a: Tensor<B, 4>,
    rec_b: Tensor<B, 4>,
    side_channel: Option<Tensor<B, 4>>,
    prediction: Option<(&'static str, Tensor<B, 4>)>,
}

struct Slots<B: AutodiffBackend> {
    gen_a: TrainableSlot<B, ResnetGenerator<B>>,
    gen_b: TrainableSlot<B, ResnetGenerator<B>>,
    disc_a: TrainableSlot<B, PatchDiscriminator<B>>,
    disc_b: TrainableSlot<B, PatchDiscriminator<B>>,
    geom: Option<TrainableSlot<B, GeomNet<B>>>,
}

impl<B: AutodiffBackend> Slots<B> {
    fn new(config: &TrainingConfig, with_geom: bool, epoch: usize) -> Self {
        let schedule = &config.schedule;
        let adam = AdamConfig::new()
            .with_beta_1(schedule.beta_1 as f32)
            .with_beta_2(schedule.beta_2 as f32);
        let controller = ScheduleController::new(
            schedule.accumulation_steps,
            schedule.n_epochs,
            schedule.decay_epoch,
        );
        let lr = || LinearDecayLr::new(schedule.lr, controller, epoch);
        Self {
            gen_a: TrainableSlot::new(ModelRole::GenA, &adam, lr()),
            gen_b: TrainableSlot::new(ModelRole::GenB, &adam, lr()),
            disc_a: TrainableSlot::new(ModelRole::DiscA, &adam, lr()),
            disc_b: TrainableSlot::new(ModelRole::DiscB, &adam, lr()),
            geom: with_geom.then(|| TrainableSlot::new(ModelRole::Geom, &adam, lr())),
        }
    }

    fn has_pending(&self) -> bool {
        self.gen_a.pending() > 0
            || self.gen_b.pending() > 0
            || self.disc_a.pending() > 0
            || self.disc_b.pending() > 0
            || self.geom.as_ref().is_some_and(|slot| slot.pending() > 0)
    }
}

/// Owns every network, optimizer and counter of one training run.
pub struct TrainingSession<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    models: ModelSet<B>,
    slots: Slots<B>,
    composer: LossComposer,
    schedule: ScheduleController,
    checkpoints: CheckpointManager,
    rng: StdRng,
    epoch: usize,
    global_step: usize,
    last_visuals: Option<StepVisuals<B::InnerBackend>>,
}

impl<B: AutodiffBackend> TrainingSession<B> {
    /// Build the model set, load frozen weights and resume state.
    ///
    /// `batches_per_epoch` seeds the global step counter when a run starts at
    /// a non-zero epoch without a saved state.
    pub fn new(
        config: TrainingConfig,
        device: B::Device,
        batches_per_epoch: usize,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        B::seed(&device, config.schedule.seed);

        let models = ModelSet::<B>::init(&config.model, &device)
            .with_auxiliary(build_auxiliary(&config, &device)?)
            .with_semantic(build_semantic(&config, &device)?);
        let checkpoints = CheckpointManager::new(
            config.run_dir(),
            config.checkpoint.save_epoch_freq,
            config.checkpoint.slow,
        );
        let schedule = ScheduleController::new(
            config.schedule.accumulation_steps,
            config.schedule.n_epochs,
            config.schedule.decay_epoch,
        );

        let mut epoch = config.schedule.start_epoch;
        let mut global_step = epoch * batches_per_epoch;
        let tag: EpochTag = config.checkpoint.which_epoch.parse()?;
        if config.checkpoint.continue_train && tag == EpochTag::Latest {
            if let Some(state) = checkpoints.read_state()? {
                epoch = state.next_epoch;
                global_step = state.global_step;
            }
        }

        let with_geom = models.auxiliary.trainable_geom().is_some();
        let slots = Slots::new(&config, with_geom, epoch);
        let rng = StdRng::seed_from_u64(config.schedule.seed);

        let mut session = Self {
            composer: LossComposer::new(config.loss.clone()),
            config,
            device,
            models,
            slots,
            schedule,
            checkpoints,
            rng,
            epoch,
            global_step,
            last_visuals: None,
        };
        session.resume(tag)?;
        Ok(session)
    }

    fn resume(&mut self, tag: EpochTag) -> anyhow::Result<()> {
        if self.config.checkpoint.continue_train {
            let source = self.checkpoints.clone();
            self.load_models(&source, tag)?;
            let restored = self.restore_optimizers(&source, tag)?;
            info!(
                "resumed {} from {} at epoch {} (step {}), optimizer state {}",
                tag,
                source.root().display(),
                self.epoch,
                self.global_step,
                if restored { "restored" } else { "fresh" }
            );
        } else if let Some(root) = self.config.checkpoint.load_pretrain.clone() {
            let source = CheckpointManager::new(root, 1, false);
            self.load_models(&source, tag)?;
            info!("loaded {} weights from {}", tag, source.root().display());
        } else {
            debug!("starting from freshly initialised weights");
        }
        Ok(())
    }

    fn load_models(&mut self, source: &CheckpointManager, tag: EpochTag) -> TrainResult<()> {
        let device = &self.device;
        let models = &mut self.models;
        models.gen_a = source.load(models.gen_a.clone(), ModelRole::GenA, tag, device)?;
        models.gen_b = source.load(models.gen_b.clone(), ModelRole::GenB, tag, device)?;
        models.disc_a = source.load(models.disc_a.clone(), ModelRole::DiscA, tag, device)?;
        models.disc_b = source.load(models.disc_b.clone(), ModelRole::DiscB, tag, device)?;
        if let Some(geom) = models.auxiliary.trainable_geom_mut() {
            *geom = source.load(geom.clone(), ModelRole::Geom, tag, device)?;
        }
        Ok(())
    }

    fn restore_optimizers(&mut self, source: &CheckpointManager, tag: EpochTag) -> TrainResult<bool> {
        let device = &self.device;
        let slots = &mut self.slots;
        let mut all = slots.gen_a.restore_optimizer(source, tag, device)?;
        all &= slots.gen_b.restore_optimizer(source, tag, device)?;
        all &= slots.disc_a.restore_optimizer(source, tag, device)?;
        all &= slots.disc_b.restore_optimizer(source, tag, device)?;
        if let Some(slot) = slots.geom.as_mut() {
            all &= slot.restore_optimizer(source, tag, device)?;
        }
        Ok(all)
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn models(&self) -> &ModelSet<B> {
        &self.models
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    fn sample_crops(&mut self, height: usize, width: usize) -> Vec<PatchCrop> {
        let loss = &self.config.loss;
        (1..loss.n_patches)
            .map(|_| PatchCrop::sample(&mut self.rng, height, width, loss.patch_size))
            .collect()
    }

    /// Forward, backward and accumulate one batch; apply the optimizers when
    /// the accumulation window closes.
    pub fn train_step(&mut self, batch: ImageBatch<B>) -> TrainResult<StepOutput> {
        let step = self.global_step;
        let [_, _, height, width] = batch.real_a.dims();
        let crops = if self.models.semantic.is_some() {
            self.sample_crops(height, width)
        } else {
            Vec::new()
        };

        let real_a = batch.real_a;
        let real_b = batch.real_b;
        let models = &self.models;

        let fake_b = models.gen_a.forward(real_a.clone());
        let rec_a = models.gen_b.forward(fake_b.clone());
        let fake_a = models.gen_b.forward(real_b.clone());
        let rec_b = models.gen_a.forward(fake_a.clone());

        let prediction = models.auxiliary.predict(fake_b.clone());
        let auxiliary = match (prediction.tensor(), batch.side_channel.clone()) {
            (None, _) => None,
            (Some(_), Some(target)) => self.composer.auxiliary(&prediction, target),
            (Some(_), None) => {
                return Err(TrainError::Batch(BatchError(
                    "auxiliary path is enabled but the batch has no side channel".to_string(),
                )))
            }
        };
        let adversarial = self.composer.generator_adversarial(
            models.disc_a.forward(fake_a.clone()),
            models.disc_b.forward(fake_b.clone()),
        );
        let cycle = self
            .composer
            .cycle(real_a.clone(), rec_a.clone(), real_b.clone(), rec_b.clone());
        let semantic = models.semantic_embedder().map(|embedder| {
            self.composer
                .semantic(embedder, real_a.clone(), fake_b.clone(), &crops)
        });
        let losses = self.composer.compose(cycle, adversarial, auxiliary, semantic);

        let mut scalars = BTreeMap::new();
        scalars.insert("total_G".to_string(), finite(&losses.total, "total_G", step)?);
        scalars.insert("loss_RC".to_string(), finite(&losses.cycle, "loss_RC", step)?);
        scalars.insert("loss_GAN".to_string(), finite(&losses.adversarial, "loss_GAN", step)?);
        if let (Some(key), Some(aux)) = (prediction.loss_key(), &losses.auxiliary) {
            scalars.insert(key.to_string(), finite(aux, key, step)?);
        }
        if let Some(semantic) = &losses.semantic {
            scalars.insert("loss_recog".to_string(), finite(semantic, "loss_recog", step)?);
        }

        let mut grads = losses.total.backward();
        self.slots.gen_a.accumulate(&self.models.gen_a, &mut grads);
        self.slots.gen_b.accumulate(&self.models.gen_b, &mut grads);
        if let (Some(slot), Some(geom)) = (
            self.slots.geom.as_mut(),
            self.models.auxiliary.trainable_geom(),
        ) {
            slot.accumulate(geom, &mut grads);
        }

        // fake images are detached so no gradient reaches the generators
        let loss_d_a = self.composer.discriminator(
            self.models.disc_a.forward(real_a.clone()),
            self.models.disc_a.forward(fake_a.clone().detach()),
        );
        scalars.insert("loss_D_A".to_string(), finite(&loss_d_a, "loss_D_A", step)?);
        let mut grads = loss_d_a.backward();
        self.slots.disc_a.accumulate(&self.models.disc_a, &mut grads);

        let loss_d_b = self.composer.discriminator(
            self.models.disc_b.forward(real_b.clone()),
            self.models.disc_b.forward(fake_b.clone().detach()),
        );
        scalars.insert("loss_D_B".to_string(), finite(&loss_d_b, "loss_D_B", step)?);
        let mut grads = loss_d_b.backward();
        self.slots.disc_b.accumulate(&self.models.disc_b, &mut grads);

        if self.schedule.should_step(step) {
            self.apply_updates();
        }
        self.global_step += 1;

        self.last_visuals = Some(StepVisuals {
            real_a: real_a.inner(),
            real_b: real_b.inner(),
            fake_a: fake_a.inner(),
            fake_b: fake_b.inner(),
            rec_a: rec_a.inner(),
            rec_b: rec_b.inner(),
            side_channel: batch.side_channel.map(|side| side.inner()),
            prediction: match &prediction {
                AuxiliaryPrediction::Geometry(t) => Some(("pred_geom", t.clone().inner())),
                AuxiliaryPrediction::Sketch(t) => Some(("pred_sketch", t.clone().inner())),
                AuxiliaryPrediction::None => None,
            },
        });

        Ok(StepOutput { scalars })
    }

    fn apply_updates(&mut self) {
        let models = &mut self.models;
        let slots = &mut self.slots;
        models.gen_a = slots.gen_a.apply(models.gen_a.clone());
        models.gen_b = slots.gen_b.apply(models.gen_b.clone());
        models.disc_a = slots.disc_a.apply(models.disc_a.clone());
        models.disc_b = slots.disc_b.apply(models.disc_b.clone());
        if let (Some(slot), Some(geom)) = (
            slots.geom.as_mut(),
            models.auxiliary.trainable_geom_mut(),
        ) {
            *geom = slot.apply(geom.clone());
        }
    }

    /// Train on every full batch, reporting every `log_int` steps.
    ///
    /// The token is checked before each batch. On cancellation the partial
    /// accumulation window is applied and "latest" checkpoints are written.
    pub fn run_epoch<I>(
        &mut self,
        batches: I,
        observer: &mut dyn TrainingObserver,
        cancel: &CancellationToken,
    ) -> anyhow::Result<EpochOutcome>
    where
        I: Iterator<Item = BatchResult<B>>,
    {
        let epoch = self.epoch;
        let batch_size = self.config.schedule.batch_size;
        let log_int = self.config.schedule.log_int.max(1);
        let started = Instant::now();
        let mut losses = LossAccumulator::new();

        for (index, batch) in batches.enumerate() {
            if cancel.is_cancelled() {
                self.stop()?;
                return Ok(EpochOutcome::Cancelled);
            }
            let batch = batch.map_err(TrainError::from)?;
            if batch.len() != batch_size {
                debug!("dropping short batch of {} samples", batch.len());
                continue;
            }
            let output = self.train_step(batch)?;
            losses.add(&output.scalars);

            if (index + 1) % log_int == 0 {
                let means = losses.drain();
                info!(
                    "epoch {} step {} elapsed {:.1}s",
                    epoch,
                    self.global_step,
                    started.elapsed().as_secs_f64()
                );
                observer.log_scalars(epoch, self.global_step, &means);
                let visuals = self.sample_visuals()?;
                observer.log_images(epoch, self.global_step, &visuals)?;
            }
        }

        if cancel.is_cancelled() {
            self.stop()?;
            return Ok(EpochOutcome::Cancelled);
        }
        self.end_epoch(observer)?;
        Ok(EpochOutcome::Completed)
    }

    /// Advance learning rates, write checkpoints and `state.json`, dump epoch images.
    pub fn end_epoch(&mut self, observer: &mut dyn TrainingObserver) -> anyhow::Result<()> {
        let epoch = self.epoch;
        let final_epoch = epoch + 1 >= self.config.schedule.n_epochs;
        if final_epoch && self.slots.has_pending() {
            info!("applying partial accumulation window before the final save");
            self.apply_updates();
        }

        let before = self.slots.gen_a.learning_rate();
        let after = self.slots.gen_a.advance_epoch();
        self.slots.gen_b.advance_epoch();
        self.slots.disc_a.advance_epoch();
        self.slots.disc_b.advance_epoch();
        if let Some(slot) = self.slots.geom.as_mut() {
            slot.advance_epoch();
        }
        if after != before {
            info!("learning rate {:.7} -> {:.7}", before, after);
        }

        let trainable = self.models.trainable_roles();
        for role in self.checkpoints.numbered_roles(epoch, &trainable) {
            self.save_role(role, EpochTag::Epoch(epoch))?;
        }
        for &role in &trainable {
            self.save_role(role, EpochTag::Latest)?;
        }
        self.epoch += 1;
        self.write_state()?;
        info!(
            "epoch {} done, checkpoints in {}",
            epoch,
            self.checkpoints.root().display()
        );

        if let Some(visuals) = &self.last_visuals {
            let grids = vec![
                ("fake_B".to_string(), tensor_to_images(visuals.fake_b.clone())?),
                ("fake_A".to_string(), tensor_to_images(visuals.fake_a.clone())?),
                ("rec_B".to_string(), tensor_to_images(visuals.rec_b.clone())?),
                ("rec_A".to_string(), tensor_to_images(visuals.rec_a.clone())?),
            ];
            observer.log_epoch_images(epoch, &grids)?;
        }
        Ok(())
    }

    /// Flush pending gradients and persist "latest" so a later run resumes here.
    fn stop(&mut self) -> anyhow::Result<()> {
        if self.slots.has_pending() {
            info!("applying partial accumulation window before stopping");
            self.apply_updates();
        }
        for role in self.models.trainable_roles() {
            self.save_role(role, EpochTag::Latest)?;
        }
        self.write_state()?;
        warn!(
            "stopped during epoch {} at step {}",
            self.epoch, self.global_step
        );
        Ok(())
    }

    fn write_state(&self) -> TrainResult<()> {
        self.checkpoints.write_state(&TrainingState {
            next_epoch: self.epoch,
            global_step: self.global_step,
        })
    }

    fn save_role(&self, role: ModelRole, tag: EpochTag) -> TrainResult<()> {
        let checkpoints = &self.checkpoints;
        match role {
            ModelRole::GenA => self.slots.gen_a.save(&self.models.gen_a, checkpoints, tag),
            ModelRole::GenB => self.slots.gen_b.save(&self.models.gen_b, checkpoints, tag),
            ModelRole::DiscA => self.slots.disc_a.save(&self.models.disc_a, checkpoints, tag),
            ModelRole::DiscB => self.slots.disc_b.save(&self.models.disc_b, checkpoints, tag),
            ModelRole::Geom => match (&self.slots.geom, self.models.auxiliary.trainable_geom()) {
                (Some(slot), Some(geom)) => slot.save(geom, checkpoints, tag),
                _ => Ok(()),
            },
        }
    }

    /// First image of each named visual from the latest step.
    fn sample_visuals(&self) -> anyhow::Result<Vec<(String, RgbImage)>> {
        let Some(visuals) = &self.last_visuals else {
            return Ok(Vec::new());
        };
        let mut named = vec![
            ("real_A", visuals.real_a.clone()),
            ("real_B", visuals.real_b.clone()),
            ("fake_A", visuals.fake_a.clone()),
            ("rec_A", visuals.rec_a.clone()),
            ("fake_B", visuals.fake_b.clone()),
        ];
        if let Some((name, prediction)) = &visuals.prediction {
            if let Some(side) = &visuals.side_channel {
                named.push(("side_channel", side.clone()));
            }
            named.push((name, prediction.clone()));
        }

        let mut images = Vec::with_capacity(named.len());
        for (name, tensor) in named {
            let first = tensor.slice_dim(0, 0..1);
            if let Some(image) = tensor_to_images(first)?.into_iter().next() {
                images.push((name.to_string(), image));
            }
        }
        Ok(images)
    }
}

fn finite<B: Backend>(value: &Tensor<B, 1>, term: &'static str, step: usize) -> TrainResult<f64> {
    let value = value.clone().into_scalar().elem::<f64>();
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TrainError::NonFinite { term, step })
    }
}

fn load_frozen<B: Backend, M: Module<B>>(
    module: M,
    weights: Option<&str>,
    what: &str,
    allow_untrained: bool,
    device: &B::Device,
) -> TrainResult<M> {
    match weights {
        Some(path) => load_record_file(module, Path::new(path), device),
        None if allow_untrained => {
            warn!("{what} has no weights path, using random initialisation");
            Ok(module)
        }
        None => Err(TrainError::Config(format!(
            "{what} needs pretrained weights (set allow_untrained_backbones to skip)"
        ))),
    }
}

fn build_auxiliary<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> anyhow::Result<AuxiliaryNetwork<B>> {
    let features = &config.features;
    let allow = features.allow_untrained_backbones;
    if features.use_geom {
        let recognition = load_frozen(
            config.model.recognition_config().init::<B>(device),
            features.recognition_weights.as_deref(),
            "recognition backbone",
            allow,
            device,
        )
        .context("loading recognition backbone")?
        .no_grad();
        let geom = load_frozen(
            config.model.geom_config().init::<B>(device),
            features.geom_pretrained.as_deref(),
            "geometry network",
            allow,
            device,
        )
        .context("loading geometry network")?;
        let trainable = features.finetune_geom;
        let geom = if trainable { geom } else { geom.no_grad() };
        info!(
            "geometry path enabled ({})",
            if trainable { "fine-tuned" } else { "frozen" }
        );
        return Ok(AuxiliaryNetwork::Geometry {
            recognition,
            geom,
            trainable,
        });
    }
    if features.use_sketch {
        let sketch = load_frozen(
            config.model.sketch_config().init::<B>(device),
            features.sketch_weights.as_deref(),
            "sketch network",
            allow,
            device,
        )
        .context("loading sketch network")?
        .no_grad();
        info!("sketch path enabled");
        return Ok(AuxiliaryNetwork::Sketch { sketch });
    }
    Ok(AuxiliaryNetwork::None)
}

fn build_semantic<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> anyhow::Result<Option<SemanticEncoder<B>>> {
    let features = &config.features;
    if !features.use_clip {
        return Ok(None);
    }
    let encoder = load_frozen(
        config.model.semantic_config().init::<B>(device),
        features.semantic_weights.as_deref(),
        "semantic encoder",
        features.allow_untrained_backbones,
        device,
    )
    .context("loading semantic encoder")?
    .no_grad();
    info!(
        "semantic term enabled with {} patch(es)",
        config.loss.n_patches
    );
    Ok(Some(encoder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataConfig;
    use crate::model::ModelConfig;
    use crate::training::observer::SampleObserver;
    use crate::training::{CheckpointConfig, FeatureConfig, ScheduleConfig};
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::{Distribution, TensorData};

    type TB = Autodiff<NdArray<f32>>;

    fn config(dir: &Path, accumulation_steps: usize) -> TrainingConfig {
        TrainingConfig::new(
            "unit".to_string(),
            DataConfig::new("a".to_string(), "b".to_string())
                .with_load_size(16)
                .with_crop_size(16),
        )
        .with_model(
            ModelConfig::new()
                .with_ngf(4)
                .with_ndf(4)
                .with_n_blocks(1)
                .with_n_layers_d(2),
        )
        .with_features(
            FeatureConfig::new()
                .with_use_geom(false)
                .with_use_clip(false),
        )
        .with_schedule(
            ScheduleConfig::new()
                .with_lr(0.01)
                .with_batch_size(1)
                .with_accumulation_steps(accumulation_steps)
                .with_n_epochs(2)
                .with_decay_epoch(1)
                .with_log_int(1),
        )
        .with_checkpoint(
            CheckpointConfig::new()
                .with_checkpoints_dir(dir.to_string_lossy().to_string())
                .with_save_epoch_freq(1),
        )
    }

    fn batch(fill: Option<f32>) -> ImageBatch<TB> {
        let device = Default::default();
        let image = || match fill {
            Some(value) => Tensor::<TB, 4>::full([1, 3, 16, 16], value, &device),
            None => Tensor::<TB, 4>::random([1, 3, 16, 16], Distribution::Default, &device),
        };
        ImageBatch {
            real_a: image(),
            real_b: image(),
            side_channel: None,
            indices: vec![0],
            names: vec!["sample".to_string()],
            labels: Tensor::zeros([1], &device),
        }
    }

    fn gen_a_output(session: &TrainingSession<TB>) -> Vec<f32> {
        let device = Default::default();
        let input = Tensor::<TB, 4>::full([1, 3, 16, 16], 0.3, &device);
        session
            .models()
            .gen_a
            .forward(input)
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn parameters_change_only_when_window_closes() {
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            TrainingSession::<TB>::new(config(dir.path(), 2), Default::default(), 4).unwrap();
        let initial = gen_a_output(&session);

        let output = session.train_step(batch(None)).unwrap();
        for key in ["total_G", "loss_RC", "loss_GAN", "loss_D_A", "loss_D_B"] {
            assert!(output.scalars.contains_key(key), "missing {key}");
        }
        assert!(!output.scalars.contains_key("loss_recog"));
        assert_eq!(gen_a_output(&session), initial);

        session.train_step(batch(None)).unwrap();
        assert_ne!(gen_a_output(&session), initial);
        assert_eq!(session.global_step(), 2);
    }

    #[test]
    fn non_finite_loss_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            TrainingSession::<TB>::new(config(dir.path(), 1), Default::default(), 4).unwrap();
        let result = session.train_step(batch(Some(f32::NAN)));
        assert!(matches!(result, Err(TrainError::NonFinite { step: 0, .. })));
    }

    #[test]
    fn epoch_end_writes_checkpoints_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            TrainingSession::<TB>::new(config(dir.path(), 1), Default::default(), 2).unwrap();
        let run_dir = session.checkpoints().root().to_path_buf();
        let mut observer = SampleObserver::new(&run_dir);
        let batches = vec![Ok(batch(None)), Ok(batch(None))];

        let outcome = session
            .run_epoch(batches.into_iter(), &mut observer, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome, EpochOutcome::Completed);
        assert_eq!(session.epoch(), 1);

        for stem in ["netG_A", "netG_B", "netD_A", "netD_B"] {
            assert!(run_dir.join(format!("{stem}_latest.mpk")).exists());
            assert!(run_dir.join(format!("{stem}_00.mpk")).exists());
            assert!(run_dir.join(format!("{stem}_optim_latest.mpk")).exists());
        }
        assert!(!run_dir.join("netGeom_latest.mpk").exists());
        let state = session.checkpoints().read_state().unwrap().unwrap();
        assert_eq!(
            state,
            TrainingState {
                next_epoch: 1,
                global_step: 2
            }
        );
        assert!(run_dir.join("epochs").join("epoch_1_fake_B.png").exists());
        assert!(run_dir.join("samples").read_dir().unwrap().next().is_some());
    }

    #[test]
    fn resumed_session_continues_from_saved_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            TrainingSession::<TB>::new(config(dir.path(), 1), Default::default(), 1).unwrap();
        let mut observer = SampleObserver::new(session.checkpoints().root());
        session
            .run_epoch(
                vec![Ok(batch(None))].into_iter(),
                &mut observer,
                &CancellationToken::new(),
            )
            .unwrap();
        let trained = gen_a_output(&session);

        let mut resume = config(dir.path(), 1);
        resume.checkpoint.continue_train = true;
        let resumed = TrainingSession::<TB>::new(resume, Default::default(), 1).unwrap();
        assert_eq!(resumed.epoch(), 1);
        assert_eq!(resumed.global_step(), 1);
        assert_eq!(gen_a_output(&resumed), trained);
    }

    #[test]
    fn cancellation_flushes_and_saves_latest() {
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            TrainingSession::<TB>::new(config(dir.path(), 4), Default::default(), 4).unwrap();
        session.train_step(batch(None)).unwrap();
        let before = gen_a_output(&session);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut observer = SampleObserver::new(session.checkpoints().root());
        let outcome = session
            .run_epoch(vec![Ok(batch(None))].into_iter(), &mut observer, &cancel)
            .unwrap();

        assert_eq!(outcome, EpochOutcome::Cancelled);
        assert_ne!(gen_a_output(&session), before);
        let root = session.checkpoints().root();
        assert!(root.join("netG_A_latest.mpk").exists());
        assert!(!root.join("netG_A_00.mpk").exists());
        let state = session.checkpoints().read_state().unwrap().unwrap();
        assert_eq!(state.next_epoch, 0);
        assert_eq!(state.global_step, 1);
    }

    #[test]
    fn frozen_networks_require_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut strict = config(dir.path(), 1);
        strict.features.use_clip = true;
        assert!(TrainingSession::<TB>::new(strict, Default::default(), 1).is_err());

        let mut relaxed = config(dir.path(), 1);
        relaxed.features.use_clip = true;
        relaxed.features.allow_untrained_backbones = true;
        relaxed.model.embed_size = 16;
        relaxed.loss.n_patches = 2;
        relaxed.loss.patch_size = 8;
        let mut session = TrainingSession::<TB>::new(relaxed, Default::default(), 1).unwrap();
        let output = session.train_step(batch(None)).unwrap();
        assert!(output.scalars["loss_recog"].is_finite());
    }

    #[test]
    fn pretrained_weights_load_from_another_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut source =
            TrainingSession::<TB>::new(config(dir.path(), 1), Default::default(), 1).unwrap();
        let mut observer = SampleObserver::new(source.checkpoints().root());
        source
            .run_epoch(
                vec![Ok(batch(None))].into_iter(),
                &mut observer,
                &CancellationToken::new(),
            )
            .unwrap();
        let trained = gen_a_output(&source);
        let source_root = source.checkpoints().root().to_string_lossy().to_string();

        let mut fresh = config(dir.path(), 1);
        fresh.name = "finetune".to_string();
        fresh.checkpoint.load_pretrain = Some(source_root);
        fresh.checkpoint.which_epoch = "0".to_string();
        let session = TrainingSession::<TB>::new(fresh, Default::default(), 1).unwrap();
        assert_eq!(gen_a_output(&session), trained);
        assert_eq!(session.epoch(), 0);
        assert_eq!(session.global_step(), 0);
        assert!(session.checkpoints().root().ends_with("finetune"));

        let mut missing = config(dir.path(), 1);
        missing.name = "finetune".to_string();
        let nowhere = dir.path().join("nowhere");
        missing.checkpoint.load_pretrain = Some(nowhere.to_string_lossy().to_string());
        assert!(TrainingSession::<TB>::new(missing, Default::default(), 1).is_err());
    }

    fn geometry_config(dir: &Path, finetune: bool) -> TrainingConfig {
        let mut config = config(dir, 1);
        config.data.side_channel_dir = Some("depth".to_string());
        config.model.recog_feature_channels = 8;
        config.model.geom_filters = 4;
        config.features = FeatureConfig::new()
            .with_use_geom(true)
            .with_use_clip(false)
            .with_finetune_geom(finetune)
            .with_allow_untrained_backbones(true);
        config
    }

    fn geometry_batch() -> ImageBatch<TB> {
        let device = Default::default();
        let mut batch = batch(None);
        batch.side_channel = Some(Tensor::<TB, 4>::random(
            [1, 3, 16, 16],
            Distribution::Default,
            &device,
        ));
        batch
    }

    fn geom_output(session: &TrainingSession<TB>) -> Vec<f32> {
        let device = Default::default();
        let values: Vec<f32> = (0..128).map(|i| (i as f32 * 0.37).sin()).collect();
        let features = Tensor::<TB, 4>::from_data(TensorData::new(values, [1, 8, 4, 4]), &device);
        match &session.models().auxiliary {
            AuxiliaryNetwork::Geometry { geom, .. } => {
                geom.forward(features).into_data().to_vec::<f32>().unwrap()
            }
            _ => panic!("geometry path is not enabled"),
        }
    }

    #[test]
    fn finetuned_geometry_network_trains_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = TrainingSession::<TB>::new(
            geometry_config(dir.path(), true),
            Default::default(),
            1,
        )
        .unwrap();
        assert!(session.slots.geom.is_some());
        assert!(session.models().trainable_roles().contains(&ModelRole::Geom));
        let before = geom_output(&session);

        let output = session.train_step(geometry_batch()).unwrap();
        assert!(output.scalars["loss_cycle_Geom"].is_finite());
        assert_ne!(geom_output(&session), before);

        let root = session.checkpoints().root().to_path_buf();
        let mut observer = SampleObserver::new(&root);
        session.end_epoch(&mut observer).unwrap();
        assert!(root.join("netGeom_latest.mpk").exists());
        assert!(root.join("netGeom_00.mpk").exists());
        assert!(root.join("netGeom_optim_latest.mpk").exists());
    }

    #[test]
    fn frozen_geometry_network_has_no_optimizer() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = TrainingSession::<TB>::new(
            geometry_config(dir.path(), false),
            Default::default(),
            1,
        )
        .unwrap();
        assert!(session.slots.geom.is_none());
        assert!(!session.models().trainable_roles().contains(&ModelRole::Geom));
        let before = geom_output(&session);

        let output = session.train_step(geometry_batch()).unwrap();
        assert!(output.scalars.contains_key("loss_cycle_Geom"));
        assert_eq!(geom_output(&session), before);

        let root = session.checkpoints().root().to_path_buf();
        let mut observer = SampleObserver::new(&root);
        session.end_epoch(&mut observer).unwrap();
        assert!(root.join("netG_A_latest.mpk").exists());
        assert!(!root.join("netGeom_latest.mpk").exists());
    }

    #[test]
    fn enabled_auxiliary_path_needs_a_side_channel() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = TrainingSession::<TB>::new(
            geometry_config(dir.path(), true),
            Default::default(),
            1,
        )
        .unwrap();
        let result = session.train_step(batch(None));
        assert!(matches!(result, Err(TrainError::Batch(_))));
    }
}
