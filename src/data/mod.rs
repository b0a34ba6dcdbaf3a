pub mod align;
pub mod transform;

use crate::error::{BatchError, TrainError};
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use burn::tensor::TensorData;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

pub use align::{scan_images, AlignedDatasetView, DatasetAligner, SampleRecord};
pub use transform::{ChannelMode, Preprocess, SampleTensors, SampleTransformPipeline, TransformParams};

/// Whether the dataset feeds training (equalized, augmented) or evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetMode {
    Train,
    Eval,
}

/// What the side-channel directory holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideChannelKind {
    /// Depth maps, consumed as RGB.
    Depth,
    /// Line sketches, consumed as single-channel.
    Sketch,
}

impl SideChannelKind {
    pub fn channel_mode(self) -> ChannelMode {
        match self {
            SideChannelKind::Depth => ChannelMode::Rgb,
            SideChannelKind::Sketch => ChannelMode::Gray,
        }
    }
}

/// Dataset locations and per-sample preprocessing.
#[derive(Config, Debug)]
pub struct DataConfig {
    /// Domain A root (photographs / full colour).
    pub domain_a_dir: String,
    /// Domain B root (line art / flat colour).
    pub domain_b_dir: String,
    /// Depth maps or sketches aligned to domain A by file name.
    pub side_channel_dir: Option<String>,
    /// Extension tried when a side-channel file name has no exact domain-A match.
    #[config(default = "String::from(\"jpg\")")]
    pub fallback_extension: String,
    pub max_dataset_size: Option<usize>,
    #[config(default = "DatasetMode::Train")]
    pub mode: DatasetMode,
    #[config(default = "Preprocess::ResizeAndCrop")]
    pub preprocess: Preprocess,
    #[config(default = 286)]
    pub load_size: usize,
    #[config(default = 256)]
    pub crop_size: usize,
    #[config(default = false)]
    pub no_flip: bool,
    #[config(default = 8)]
    pub num_workers: usize,
}

/// One training step worth of images.
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub real_a: Tensor<B, 4>,
    pub real_b: Tensor<B, 4>,
    pub side_channel: Option<Tensor<B, 4>>,
    pub indices: Vec<usize>,
    pub names: Vec<String>,
    /// Placeholder class labels, always zero.
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

pub type BatchResult<B> = Result<ImageBatch<B>, BatchError>;

/// Loads, transforms and stacks sample records on data-loader workers.
///
/// Every sample gets its own RNG seeded from a shared stream, so workers never
/// share transform state and never touch the aligned view.
#[derive(Clone)]
pub struct UnpairedBatcher {
    pipeline: SampleTransformPipeline,
    seeds: Arc<Mutex<StdRng>>,
}

impl UnpairedBatcher {
    pub fn new(pipeline: SampleTransformPipeline, seed: u64) -> Self {
        Self {
            pipeline,
            seeds: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    fn draw_seeds(&self, count: usize) -> Vec<u64> {
        let mut rng = match self.seeds.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (0..count).map(|_| rng.gen()).collect()
    }
}

impl<B: Backend> Batcher<B, SampleRecord, BatchResult<B>> for UnpairedBatcher {
    fn batch(&self, items: Vec<SampleRecord>, device: &B::Device) -> BatchResult<B> {
        let seeds = self.draw_seeds(items.len());
        build_batch::<B>(&items, &self.pipeline, &seeds, device)
            .map_err(|err| BatchError(err.to_string()))
    }
}

/// Transform and stack records into a batch, one seed per record.
pub fn build_batch<B: Backend>(
    records: &[SampleRecord],
    pipeline: &SampleTransformPipeline,
    seeds: &[u64],
    device: &B::Device,
) -> Result<ImageBatch<B>, TrainError> {
    if records.is_empty() {
        return Err(TrainError::Batch(BatchError("empty batch".to_string())));
    }

    let batch_size = records.len();
    let size = pipeline.crop_size() as usize;
    let mut a = Vec::new();
    let mut b = Vec::new();
    let mut side = Vec::new();
    let mut indices = Vec::with_capacity(batch_size);
    let mut names = Vec::with_capacity(batch_size);

    for (record, &seed) in records.iter().zip(seeds) {
        let mut rng = StdRng::seed_from_u64(seed);
        let sample = pipeline.load(record, &mut rng)?;
        a.extend(sample.domain_a);
        match sample.domain_b {
            Some(values) => b.extend(values),
            None => {
                return Err(TrainError::Batch(BatchError(format!(
                    "sample {} has no domain-B image",
                    record.name
                ))))
            }
        }
        if let Some(values) = sample.side_channel {
            side.extend(values);
        }
        indices.push(record.index);
        names.push(record.name.clone());
    }

    let a_channels = pipeline.domain_a_mode().channels();
    let b_channels = pipeline.domain_b_mode().channels();
    let real_a = Tensor::<B, 4>::from_data(
        TensorData::new(a, [batch_size, a_channels, size, size]),
        device,
    );
    let real_b = Tensor::<B, 4>::from_data(
        TensorData::new(b, [batch_size, b_channels, size, size]),
        device,
    );
    let side_channel = match pipeline.side_channel_mode() {
        Some(mode) if !side.is_empty() => {
            if side.len() != batch_size * mode.channels() * size * size {
                return Err(TrainError::Batch(BatchError(
                    "side-channel image missing for part of the batch".to_string(),
                )));
            }
            Some(Tensor::<B, 4>::from_data(
                TensorData::new(side, [batch_size, mode.channels(), size, size]),
                device,
            ))
        }
        _ => None,
    };
    let labels = Tensor::<B, 1, Int>::zeros([batch_size], device);

    Ok(ImageBatch {
        real_a,
        real_b,
        side_channel,
        indices,
        names,
        labels,
    })
}
