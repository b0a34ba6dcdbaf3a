pub mod checkpoint;
pub mod models;
pub mod observer;
pub mod schedule;
pub mod session;
pub mod slot;

use crate::data::{
    BatchResult, DataConfig, DatasetAligner, Preprocess, SampleRecord, SampleTransformPipeline,
    SideChannelKind, UnpairedBatcher,
};
use crate::error::{TrainError, TrainResult};
use crate::model::{LossConfig, ModelConfig};
use anyhow::Context;
use burn::config::Config;
use burn::data::dataloader::DataLoaderBuilder;
use burn::tensor::backend::AutodiffBackend;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub use checkpoint::{CheckpointManager, EpochTag, TrainingState};
pub use models::{AuxiliaryNetwork, ModelRole, ModelSet};
pub use observer::{LossAccumulator, SampleObserver, TrainingObserver};
pub use schedule::{LinearDecayLr, ScheduleController};
pub use session::{EpochOutcome, StepOutput, TrainingSession};

/// Which optional supervision paths run and where their frozen weights live.
#[derive(Config, Debug)]
pub struct FeatureConfig {
    #[config(default = true)]
    pub use_geom: bool,
    #[config(default = false)]
    pub use_sketch: bool,
    #[config(default = true)]
    pub use_clip: bool,
    /// Give the geometry network its own optimizer.
    #[config(default = true)]
    pub finetune_geom: bool,
    pub geom_pretrained: Option<String>,
    pub sketch_weights: Option<String>,
    pub recognition_weights: Option<String>,
    pub semantic_weights: Option<String>,
    /// Run frozen networks with random weights when no path is given.
    #[config(default = false)]
    pub allow_untrained_backbones: bool,
}

impl FeatureConfig {
    pub fn side_channel_kind(&self) -> Option<SideChannelKind> {
        if self.use_geom {
            Some(SideChannelKind::Depth)
        } else if self.use_sketch {
            Some(SideChannelKind::Sketch)
        } else {
            None
        }
    }
}

#[derive(Config, Debug)]
pub struct ScheduleConfig {
    #[config(default = 2e-4)]
    pub lr: f64,
    #[config(default = 0.5)]
    pub beta_1: f64,
    #[config(default = 0.999)]
    pub beta_2: f64,
    #[config(default = 200)]
    pub n_epochs: usize,
    #[config(default = 100)]
    pub decay_epoch: usize,
    #[config(default = 0)]
    pub start_epoch: usize,
    /// Steps summed into one optimizer update.
    #[config(default = 16)]
    pub accumulation_steps: usize,
    #[config(default = 6)]
    pub batch_size: usize,
    #[config(default = 50)]
    pub log_int: usize,
    #[config(default = 0)]
    pub seed: u64,
}

#[derive(Config, Debug)]
pub struct CheckpointConfig {
    #[config(default = "String::from(\"checkpoints\")")]
    pub checkpoints_dir: String,
    #[config(default = 5)]
    pub save_epoch_freq: usize,
    /// Numbered checkpoints only for the A->B generator and geometry network.
    #[config(default = false)]
    pub slow: bool,
    #[config(default = false)]
    pub continue_train: bool,
    /// Directory holding `{role}_{which_epoch}.mpk` files to start from.
    pub load_pretrain: Option<String>,
    #[config(default = "String::from(\"latest\")")]
    pub which_epoch: String,
}

/// Training configuration loaded from a JSON file.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Run name; checkpoints go to `{checkpoints_dir}/{name}`.
    pub name: String,
    pub data: DataConfig,
    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,
    #[config(default = "LossConfig::new()")]
    pub loss: LossConfig,
    #[config(default = "FeatureConfig::new()")]
    pub features: FeatureConfig,
    #[config(default = "ScheduleConfig::new()")]
    pub schedule: ScheduleConfig,
    #[config(default = "CheckpointConfig::new()")]
    pub checkpoint: CheckpointConfig,
}

impl TrainingConfig {
    pub fn run_dir(&self) -> PathBuf {
        PathBuf::from(&self.checkpoint.checkpoints_dir).join(&self.name)
    }

    /// Reject option combinations that cannot produce a meaningful run.
    pub fn validate(&self) -> TrainResult<()> {
        let fail = |msg: &str| Err(TrainError::Config(msg.to_string()));
        let features = &self.features;
        let data = &self.data;

        if features.use_geom && features.use_sketch {
            return fail("use_geom and use_sketch both fill the auxiliary slot; enable one");
        }
        if (features.use_geom || features.use_sketch) && data.side_channel_dir.is_none() {
            return fail("the auxiliary path needs data.side_channel_dir");
        }
        if features.use_geom && self.model.geom_nc != 3 {
            return fail("depth side channels are RGB; model.geom_nc must be 3");
        }
        if self.checkpoint.continue_train && self.checkpoint.load_pretrain.is_some() {
            return fail("continue_train and load_pretrain are mutually exclusive");
        }
        self.checkpoint.which_epoch.parse::<EpochTag>()?;
        if self.loss.n_patches == 0 {
            return fail("loss.n_patches must be at least 1");
        }
        if self.loss.n_patches > 1 && self.loss.patch_size > data.crop_size {
            return fail("loss.patch_size cannot exceed data.crop_size");
        }
        if data.preprocess != Preprocess::Crop && data.crop_size > data.load_size {
            return fail("data.crop_size cannot exceed data.load_size");
        }
        if data.crop_size % 4 != 0 {
            return fail("data.crop_size must be divisible by 4");
        }
        let model = &self.model;
        if model
            .discriminator_config(model.input_nc)
            .output_size(data.crop_size)
            .is_none()
        {
            return Err(TrainError::Config(format!(
                "data.crop_size {} leaves no patches after {} discriminator layers",
                data.crop_size, model.n_layers_d
            )));
        }
        if features.use_geom {
            let features_size = model.recognition_config().output_size(data.crop_size);
            let predicted = model.geom_config().output_size(features_size);
            if predicted != data.crop_size {
                return Err(TrainError::Config(format!(
                    "geometry predictions would be {predicted}px for data.crop_size {}; use a multiple of 8",
                    data.crop_size
                )));
            }
        }
        if self.schedule.decay_epoch > self.schedule.n_epochs {
            return fail("schedule.decay_epoch cannot exceed schedule.n_epochs");
        }
        if self.schedule.accumulation_steps == 0 {
            return fail("schedule.accumulation_steps must be at least 1");
        }
        if self.schedule.batch_size == 0 {
            return fail("schedule.batch_size must be at least 1");
        }
        if self.checkpoint.save_epoch_freq == 0 {
            return fail("checkpoint.save_epoch_freq must be at least 1");
        }
        Ok(())
    }
}

/// Shared stop flag checked between training steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Align the dataset, build the session and train until `n_epochs` or
/// until `cancel` fires.
pub fn train<B: AutodiffBackend>(
    config: TrainingConfig,
    device: B::Device,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    config.validate()?;
    let run_dir = config.run_dir();
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create {}", run_dir.display()))?;
    config
        .save(run_dir.join("config.json"))
        .with_context(|| format!("failed to write config to {}", run_dir.display()))?;

    let side_kind = config.features.side_channel_kind();
    let mut aligner = DatasetAligner::from_config(&config.data);
    if side_kind.is_none() {
        if config.data.side_channel_dir.is_some() {
            warn!("side_channel_dir is set but no auxiliary path is enabled; ignoring it");
        }
        aligner = aligner.with_side_channel(None);
    }
    let view = aligner.align().context("failed to align dataset")?;

    let schedule = &config.schedule;
    let batches_per_epoch = view.length() / schedule.batch_size;
    if batches_per_epoch == 0 {
        return Err(anyhow::anyhow!(
            "dataset has {} samples, fewer than one batch of {}",
            view.length(),
            schedule.batch_size
        ));
    }
    info!(
        "dataset: {} samples, {} batches per epoch",
        view.length(),
        batches_per_epoch
    );

    let pipeline = SampleTransformPipeline::from_config(
        &config.data,
        config.model.input_nc,
        config.model.output_nc,
        side_kind,
    )?;
    let batcher = UnpairedBatcher::new(pipeline, schedule.seed);
    let loader = DataLoaderBuilder::<B, SampleRecord, BatchResult<B>>::new(batcher)
        .batch_size(schedule.batch_size)
        .shuffle(schedule.seed)
        .num_workers(config.data.num_workers)
        .set_device(device.clone())
        .build(view);

    let n_epochs = schedule.n_epochs;
    let mut session = TrainingSession::<B>::new(config.clone(), device, batches_per_epoch)?;
    let mut observer = SampleObserver::new(&run_dir);

    while session.epoch() < n_epochs {
        match session.run_epoch(loader.iter(), &mut observer, cancel)? {
            EpochOutcome::Completed => {}
            EpochOutcome::Cancelled => {
                info!("training interrupted, latest checkpoints saved");
                return Ok(());
            }
        }
    }
    info!("training finished after {} epochs", n_epochs);
    Ok(())
}
