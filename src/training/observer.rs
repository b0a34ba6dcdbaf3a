use crate::utils::{save_concat_images, save_grid};
use anyhow::Result;
use image::RgbImage;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Sink for everything a run reports besides checkpoints.
pub trait TrainingObserver {
    fn log_scalars(&mut self, epoch: usize, step: usize, scalars: &BTreeMap<String, f64>);

    /// One image per name, in display order.
    fn log_images(&mut self, epoch: usize, step: usize, images: &[(String, RgbImage)]) -> Result<()>;

    /// Whole-batch grids written once per epoch.
    fn log_epoch_images(&mut self, epoch: usize, images: &[(String, Vec<RgbImage>)]) -> Result<()>;
}

/// Logs scalars through `tracing` and writes images under the run directory.
#[derive(Debug, Clone)]
pub struct SampleObserver {
    sample_dir: PathBuf,
    epoch_dir: PathBuf,
}

impl SampleObserver {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            sample_dir: run_dir.join("samples"),
            epoch_dir: run_dir.join("epochs"),
        }
    }

    pub fn sample_path(&self, epoch: usize, step: usize) -> PathBuf {
        self.sample_dir
            .join(format!("epoch{epoch:03}_step{step:08}.png"))
    }

    pub fn epoch_path(&self, epoch: usize, name: &str) -> PathBuf {
        self.epoch_dir.join(format!("epoch_{}_{name}.png", epoch + 1))
    }
}

impl TrainingObserver for SampleObserver {
    fn log_scalars(&mut self, epoch: usize, step: usize, scalars: &BTreeMap<String, f64>) {
        let summary = scalars
            .iter()
            .map(|(name, value)| format!("{name}: {value:.4}"))
            .collect::<Vec<_>>()
            .join(", ");
        info!("epoch {} step {}: {}", epoch, step, summary);
    }

    fn log_images(&mut self, epoch: usize, step: usize, images: &[(String, RgbImage)]) -> Result<()> {
        if images.is_empty() {
            return Ok(());
        }
        let strip: Vec<RgbImage> = images.iter().map(|(_, image)| image.clone()).collect();
        save_concat_images(&strip, &self.sample_path(epoch, step))
    }

    fn log_epoch_images(&mut self, epoch: usize, images: &[(String, Vec<RgbImage>)]) -> Result<()> {
        for (name, batch) in images {
            if batch.is_empty() {
                continue;
            }
            save_grid(batch, &self.epoch_path(epoch, name))?;
        }
        Ok(())
    }
}

/// Running mean of every named loss over one logging interval.
#[derive(Debug, Clone, Default)]
pub struct LossAccumulator {
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, usize>,
}

impl LossAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, values: &BTreeMap<String, f64>) {
        for (name, value) in values {
            *self.sums.entry(name.clone()).or_insert(0.0) += value;
            *self.counts.entry(name.clone()).or_insert(0) += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    /// Averages since the last drain; the accumulator starts over afterwards.
    pub fn drain(&mut self) -> BTreeMap<String, f64> {
        let counts = std::mem::take(&mut self.counts);
        std::mem::take(&mut self.sums)
            .into_iter()
            .map(|(name, sum)| {
                let count = counts.get(&name).copied().unwrap_or(1).max(1);
                (name, sum / count as f64)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn losses(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    #[test]
    fn accumulator_averages_and_resets() {
        let mut acc = LossAccumulator::new();
        acc.add(&losses(&[("total_G", 1.0), ("loss_D_A", 0.5)]));
        acc.add(&losses(&[("total_G", 3.0), ("loss_D_A", 1.5)]));
        let means = acc.drain();
        assert_eq!(means["total_G"], 2.0);
        assert_eq!(means["loss_D_A"], 1.0);
        assert!(acc.is_empty());
        assert!(acc.drain().is_empty());
    }

    #[test]
    fn observer_writes_strip_and_grids() {
        let dir = tempfile::tempdir().unwrap();
        let mut observer = SampleObserver::new(dir.path());
        let tile = RgbImage::new(4, 4);
        let visuals = vec![
            ("real_A".to_string(), tile.clone()),
            ("fake_B".to_string(), tile.clone()),
        ];
        observer.log_images(0, 49, &visuals).unwrap();
        let strip = image::open(observer.sample_path(0, 49)).unwrap();
        assert_eq!((strip.width(), strip.height()), (8, 4));

        let grids = vec![("fake_A".to_string(), vec![tile.clone(); 4])];
        observer.log_epoch_images(2, &grids).unwrap();
        let grid = image::open(observer.epoch_path(2, "fake_A")).unwrap();
        assert_eq!((grid.width(), grid.height()), (8, 8));
        assert!(observer
            .epoch_path(2, "fake_A")
            .ends_with("epochs/epoch_3_fake_A.png"));
    }
}
