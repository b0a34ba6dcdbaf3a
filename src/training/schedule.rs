/// Update cadence and learning-rate decay shared by every trainable model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleController {
    accumulation_steps: usize,
    n_epochs: usize,
    decay_epoch: usize,
}

impl ScheduleController {
    pub fn new(accumulation_steps: usize, n_epochs: usize, decay_epoch: usize) -> Self {
        Self {
            accumulation_steps: accumulation_steps.max(1),
            n_epochs,
            decay_epoch,
        }
    }

    pub fn accumulation_steps(&self) -> usize {
        self.accumulation_steps
    }

    /// True on the last step of each accumulation window.
    pub fn should_step(&self, global_step: usize) -> bool {
        (global_step + 1) % self.accumulation_steps == 0
    }

    /// Constant 1.0 until `decay_epoch`, then linear down to 0.0 at `n_epochs`.
    pub fn lr_multiplier(&self, epoch: usize) -> f64 {
        if epoch < self.decay_epoch {
            return 1.0;
        }
        if self.n_epochs <= self.decay_epoch {
            return 0.0;
        }
        let progress = (epoch - self.decay_epoch) as f64 / (self.n_epochs - self.decay_epoch) as f64;
        (1.0 - progress).clamp(0.0, 1.0)
    }
}

/// Per-optimizer learning rate following [`ScheduleController::lr_multiplier`].
///
/// Nothing is persisted: the epoch is restored from `state.json` and the
/// rate is recomputed from it.
#[derive(Clone, Debug)]
pub struct LinearDecayLr {
    base_lr: f64,
    controller: ScheduleController,
    epoch: usize,
}

impl LinearDecayLr {
    pub fn new(base_lr: f64, controller: ScheduleController, epoch: usize) -> Self {
        Self {
            base_lr,
            controller,
            epoch,
        }
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Learning rate for the current epoch.
    pub fn current(&self) -> f64 {
        self.base_lr * self.controller.lr_multiplier(self.epoch)
    }

    /// Move to the next epoch and return its rate.
    pub fn advance(&mut self) -> f64 {
        self.epoch += 1;
        self.current()
    }
}
