use crate::error::TrainResult;
use crate::training::checkpoint::{CheckpointManager, EpochTag};
use crate::training::models::ModelRole;
use crate::training::schedule::LinearDecayLr;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsAccumulator, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;

/// Optimizer, pending gradient sum and learning-rate schedule of one
/// trainable network.
pub struct TrainableSlot<B: AutodiffBackend, M: AutodiffModule<B>> {
    role: ModelRole,
    optimizer: OptimizerAdaptor<Adam, M, B>,
    accumulator: GradientsAccumulator<M>,
    pending: usize,
    lr: LinearDecayLr,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> TrainableSlot<B, M> {
    pub fn new(role: ModelRole, adam: &AdamConfig, lr: LinearDecayLr) -> Self {
        Self {
            role,
            optimizer: adam.init::<B, M>(),
            accumulator: GradientsAccumulator::new(),
            pending: 0,
            lr,
        }
    }

    pub fn role(&self) -> ModelRole {
        self.role
    }

    /// Number of backward passes summed since the last update.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr.current()
    }

    /// Move this module's gradients out of `grads` into the running sum.
    pub fn accumulate(&mut self, module: &M, grads: &mut B::Gradients) {
        let params = GradientsParams::from_module(grads, module);
        self.accumulator.accumulate(module, params);
        self.pending += 1;
    }

    /// Apply the summed gradients once and clear them. No-op when nothing is pending.
    pub fn apply(&mut self, module: M) -> M {
        if self.pending == 0 {
            return module;
        }
        let grads = self.accumulator.grads();
        self.pending = 0;
        self.optimizer.step(self.lr.current(), module, grads)
    }

    /// Advance the learning-rate schedule by one epoch.
    pub fn advance_epoch(&mut self) -> f64 {
        self.lr.advance()
    }

    pub fn save(&self, module: &M, checkpoints: &CheckpointManager, tag: EpochTag) -> TrainResult<()> {
        checkpoints.save::<B, M>(module, self.role, tag)?;
        checkpoints.save_optimizer::<B, M, _>(&self.optimizer, self.role, tag)
    }

    /// Restore optimizer state saved beside a model checkpoint, if any.
    pub fn restore_optimizer(
        &mut self,
        checkpoints: &CheckpointManager,
        tag: EpochTag,
        device: &B::Device,
    ) -> TrainResult<bool> {
        match checkpoints.load_optimizer::<B, M, _>(self.optimizer.clone(), self.role, tag, device)? {
            Some(optimizer) => {
                self.optimizer = optimizer;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
