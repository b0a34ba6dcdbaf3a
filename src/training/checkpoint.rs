use crate::error::{TrainError, TrainResult};
use crate::training::models::ModelRole;
use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

const RECORD_EXTENSION: &str = "mpk";

/// Which checkpoint generation a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochTag {
    Latest,
    Epoch(usize),
}

impl fmt::Display for EpochTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochTag::Latest => f.write_str("latest"),
            EpochTag::Epoch(epoch) => write!(f, "{epoch:02}"),
        }
    }
}

impl FromStr for EpochTag {
    type Err = TrainError;

    fn from_str(value: &str) -> TrainResult<Self> {
        if value == "latest" {
            return Ok(EpochTag::Latest);
        }
        value
            .parse::<usize>()
            .map(EpochTag::Epoch)
            .map_err(|_| TrainError::Config(format!("unknown checkpoint tag `{value}`")))
    }
}

/// Progress persisted next to the checkpoints so a resumed run keeps counting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    /// First epoch a resumed run should execute.
    pub next_epoch: usize,
    pub global_step: usize,
}

/// Reads and writes `{role}_{tag}.mpk` model files, their optimizer state and
/// `state.json` under one run directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
    save_epoch_freq: usize,
    slow: bool,
    recorder: NamedMpkFileRecorder<FullPrecisionSettings>,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>, save_epoch_freq: usize, slow: bool) -> Self {
        Self {
            root: root.into(),
            save_epoch_freq: save_epoch_freq.max(1),
            slow,
            recorder: NamedMpkFileRecorder::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record path without extension; the recorder appends `.mpk`.
    pub fn path(&self, role: ModelRole, tag: EpochTag) -> PathBuf {
        self.root.join(format!("{}_{tag}", role.file_stem()))
    }

    pub fn optimizer_path(&self, role: ModelRole, tag: EpochTag) -> PathBuf {
        self.root.join(format!("{}_optim_{tag}", role.file_stem()))
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// Roles that get a numbered checkpoint at the end of `epoch`.
    pub fn numbered_roles(&self, epoch: usize, trainable: &[ModelRole]) -> Vec<ModelRole> {
        if (epoch + 1) % self.save_epoch_freq != 0 {
            return Vec::new();
        }
        trainable
            .iter()
            .copied()
            .filter(|role| !self.slow || matches!(role, ModelRole::GenA | ModelRole::Geom))
            .collect()
    }

    pub fn save<B: Backend, M: Module<B>>(
        &self,
        module: &M,
        role: ModelRole,
        tag: EpochTag,
    ) -> TrainResult<PathBuf> {
        let path = self.path(role, tag);
        std::fs::create_dir_all(&self.root)?;
        module
            .clone()
            .save_file(path.clone(), &self.recorder)
            .map_err(|reason| TrainError::CheckpointSave {
                path: path.with_extension(RECORD_EXTENSION),
                reason,
            })?;
        debug!("saved {}", path.display());
        Ok(path.with_extension(RECORD_EXTENSION))
    }

    pub fn load<B: Backend, M: Module<B>>(
        &self,
        module: M,
        role: ModelRole,
        tag: EpochTag,
        device: &B::Device,
    ) -> TrainResult<M> {
        load_record_file(module, &self.path(role, tag), device)
    }

    pub fn save_optimizer<B, M, O>(&self, optimizer: &O, role: ModelRole, tag: EpochTag) -> TrainResult<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let path = self.optimizer_path(role, tag);
        std::fs::create_dir_all(&self.root)?;
        Recorder::<B>::record(&self.recorder, optimizer.to_record(), path.clone()).map_err(
            |reason| TrainError::CheckpointSave {
                path: path.with_extension(RECORD_EXTENSION),
                reason,
            },
        )?;
        Ok(())
    }

    /// Restore optimizer state when a record exists; `None` leaves the caller's
    /// optimizer fresh.
    pub fn load_optimizer<B, M, O>(
        &self,
        optimizer: O,
        role: ModelRole,
        tag: EpochTag,
        device: &B::Device,
    ) -> TrainResult<Option<O>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let path = self.optimizer_path(role, tag);
        if !path.with_extension(RECORD_EXTENSION).exists() {
            return Ok(None);
        }
        let record = Recorder::<B>::load(&self.recorder, path.clone(), device).map_err(|reason| {
            TrainError::CheckpointLoad {
                path: path.with_extension(RECORD_EXTENSION),
                reason,
            }
        })?;
        Ok(Some(optimizer.load_record(record)))
    }

    pub fn write_state(&self, state: &TrainingState) -> TrainResult<()> {
        let path = self.state_path();
        std::fs::create_dir_all(&self.root)?;
        let json = serde_json::to_string_pretty(state)
            .map_err(|source| TrainError::State { path: path.clone(), source })?;
        std::fs::write(&path, json)?;
        Ok(())
    }

    pub fn read_state(&self) -> TrainResult<Option<TrainingState>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let state = serde_json::from_str(&contents).map_err(|source| TrainError::State { path, source })?;
        Ok(Some(state))
    }
}

/// Load a module record from an explicit file, used for frozen weights.
pub fn load_record_file<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    device: &B::Device,
) -> TrainResult<M> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let module = module
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|reason| TrainError::CheckpointLoad {
            path: path.with_extension(RECORD_EXTENSION),
            reason,
        })?;
    info!("loaded {}", path.with_extension(RECORD_EXTENSION).display());
    Ok(module)
}
