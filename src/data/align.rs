use crate::data::{DataConfig, DatasetMode};
use crate::error::{TrainError, TrainResult};
use burn::data::dataset::Dataset;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File extensions accepted by the directory scan.
pub const IMG_EXTENSIONS: [&str; 6] = ["jpg", "JPG", "jpeg", "JPEG", "png", "PNG"];

/// One aligned training sample.
///
/// `domain_a` and `side_channel` show the same scene; `domain_b` is unpaired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub index: usize,
    pub name: String,
    pub domain_a: PathBuf,
    pub domain_b: Option<PathBuf>,
    pub side_channel: Option<PathBuf>,
}

/// Immutable, length-equalized sample list built once per run.
#[derive(Debug, Clone, Default)]
pub struct AlignedDatasetView {
    records: Vec<SampleRecord>,
}

impl AlignedDatasetView {
    pub fn length(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, index: usize) -> Option<&SampleRecord> {
        self.records.get(index)
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }
}

impl Dataset<SampleRecord> for AlignedDatasetView {
    fn get(&self, index: usize) -> Option<SampleRecord> {
        self.records.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Scans the domain directories and pairs them into an [`AlignedDatasetView`].
#[derive(Debug, Clone)]
pub struct DatasetAligner {
    domain_a: PathBuf,
    domain_b: Option<PathBuf>,
    side_channel: Option<PathBuf>,
    max_dataset_size: Option<usize>,
    fallback_extension: String,
    mode: DatasetMode,
}

impl DatasetAligner {
    pub fn new(domain_a: impl Into<PathBuf>, mode: DatasetMode) -> Self {
        Self {
            domain_a: domain_a.into(),
            domain_b: None,
            side_channel: None,
            max_dataset_size: None,
            fallback_extension: "jpg".to_string(),
            mode,
        }
    }

    pub fn from_config(config: &DataConfig) -> Self {
        Self::new(&config.domain_a_dir, config.mode)
            .with_domain_b(&config.domain_b_dir)
            .with_side_channel(config.side_channel_dir.as_ref().map(PathBuf::from))
            .with_max_dataset_size(config.max_dataset_size)
            .with_fallback_extension(&config.fallback_extension)
    }

    pub fn with_domain_b(mut self, dir: impl Into<PathBuf>) -> Self {
        self.domain_b = Some(dir.into());
        self
    }

    pub fn with_side_channel(mut self, dir: Option<PathBuf>) -> Self {
        self.side_channel = dir;
        self
    }

    pub fn with_max_dataset_size(mut self, max: Option<usize>) -> Self {
        self.max_dataset_size = max;
        self
    }

    pub fn with_fallback_extension(mut self, extension: &str) -> Self {
        self.fallback_extension = extension.trim_start_matches('.').to_string();
        self
    }

    /// Build the aligned view.
    ///
    /// A configured side-channel directory that does not exist is fatal.
    pub fn align(&self) -> TrainResult<AlignedDatasetView> {
        let mut domain_a = scan_images(&self.domain_a, self.max_dataset_size)?;
        let mut side = None;

        if let Some(side_dir) = &self.side_channel {
            if !side_dir.exists() {
                return Err(TrainError::MissingSideChannel(side_dir.clone()));
            }
            let side_files = scan_images(side_dir, self.max_dataset_size)?;
            let (paired_a, paired_side) =
                pair_side_channel(&domain_a, &side_files, &self.fallback_extension);
            info!(
                "found {} paired images ({} side-channel files)",
                paired_a.len(),
                side_files.len()
            );
            domain_a = paired_a;
            side = Some(paired_side);
        }

        if domain_a.is_empty() {
            return Err(TrainError::EmptyDomain(self.domain_a.clone()));
        }

        let domain_b = match &self.domain_b {
            Some(dir) => Some(scan_images(dir, self.max_dataset_size)?),
            None => None,
        };

        let (domain_a, side, domain_b) = match self.mode {
            DatasetMode::Train => {
                let (dir_b, domain_b) = match (&self.domain_b, domain_b) {
                    (Some(dir), Some(list)) => (dir, list),
                    _ => {
                        return Err(TrainError::Config(
                            "training mode needs a domain-B directory".to_string(),
                        ))
                    }
                };
                if domain_b.is_empty() {
                    return Err(TrainError::EmptyDomain(dir_b.clone()));
                }
                let (a, s, b) = equalize(domain_a, side, domain_b);
                (a, s, b.into_iter().map(Some).collect::<Vec<_>>())
            }
            DatasetMode::Eval => {
                let len = domain_a.len();
                let b = match domain_b {
                    Some(list) => (0..len).map(|i| list.get(i).cloned()).collect(),
                    None => vec![None; len],
                };
                (domain_a, side, b)
            }
        };

        let records = domain_a
            .into_iter()
            .zip(domain_b)
            .enumerate()
            .map(|(index, (a, b))| SampleRecord {
                index,
                name: base_name(&a),
                side_channel: side.as_ref().map(|s| s[index].clone()),
                domain_a: a,
                domain_b: b,
            })
            .collect::<Vec<_>>();
        debug!("aligned dataset length {}", records.len());

        Ok(AlignedDatasetView { records })
    }
}

/// Recursively list image files under `dir` in sorted order, capped at `max`.
pub fn scan_images(dir: &Path, max: Option<usize>) -> TrainResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(TrainError::NotADirectory(dir.to_path_buf()));
    }
    let pattern = format!("{}/**/*", glob::Pattern::escape(&dir.to_string_lossy()));
    let entries =
        glob::glob(&pattern).map_err(|err| TrainError::Config(format!("bad scan pattern: {err}")))?;

    let mut images = entries
        .filter_map(std::result::Result::ok)
        .filter(|path| path.is_file() && is_image_file(path))
        .collect::<Vec<_>>();
    images.sort();
    if let Some(max) = max {
        images.truncate(max);
    }
    Ok(images)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMG_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// File name up to the first dot.
fn base_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.split('.').next().unwrap_or_default().to_string()
}

/// Keep the domain-A files that have a side-channel counterpart, in side-channel order.
fn pair_side_channel(
    domain_a: &[PathBuf],
    side: &[PathBuf],
    fallback_extension: &str,
) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut by_name: HashMap<String, &PathBuf> = HashMap::new();
    for path in domain_a {
        if let Some(name) = path.file_name() {
            by_name
                .entry(name.to_string_lossy().into_owned())
                .or_insert(path);
        }
    }

    let mut paired_a = Vec::new();
    let mut paired_side = Vec::new();
    for side_path in side {
        let Some(name) = side_path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let substituted = format!("{}.{}", base_name(side_path), fallback_extension);
        let found = by_name.get(&name).or_else(|| by_name.get(&substituted));
        if let Some(a) = found {
            paired_a.push((*a).clone());
            paired_side.push(side_path.clone());
        }
    }
    (paired_a, paired_side)
}

/// Repeat the shorter list until it covers the longer one, then cut both to the same length.
fn equalize(
    domain_a: Vec<PathBuf>,
    side: Option<Vec<PathBuf>>,
    domain_b: Vec<PathBuf>,
) -> (Vec<PathBuf>, Option<Vec<PathBuf>>, Vec<PathBuf>) {
    let (mut a, mut side, mut b) = (domain_a, side, domain_b);
    if a.len() < b.len() {
        a = repeat_to(a, b.len());
        side = side.map(|s| repeat_to(s, b.len()));
    } else if b.len() < a.len() {
        b = repeat_to(b, a.len());
    }

    let cutoff = a.len().min(b.len());
    a.truncate(cutoff);
    b.truncate(cutoff);
    if let Some(s) = side.as_mut() {
        s.truncate(cutoff);
    }
    (a, side, b)
}

fn repeat_to<T: Clone>(items: Vec<T>, target: usize) -> Vec<T> {
    if items.is_empty() || items.len() >= target {
        return items;
    }
    let times = target.div_ceil(items.len());
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend(items.iter().cloned());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn touch_images(dir: &Path, names: &[String]) {
        std::fs::create_dir_all(dir).unwrap();
        for name in names {
            RgbImage::from_pixel(4, 4, Rgb([10, 20, 30]))
                .save(dir.join(name))
                .unwrap();
        }
    }

    fn numbered(prefix: &str, count: usize, ext: &str) -> Vec<String> {
        (0..count).map(|i| format!("{prefix}{i:03}.{ext}")).collect()
    }

    #[test]
    fn shorter_domain_is_repeated_then_truncated() {
        let root = tempfile::tempdir().unwrap();
        let a_dir = root.path().join("a");
        let b_dir = root.path().join("b");
        touch_images(&a_dir, &numbered("a", 10, "png"));
        touch_images(&b_dir, &numbered("b", 25, "png"));

        let view = DatasetAligner::new(&a_dir, DatasetMode::Train)
            .with_domain_b(&b_dir)
            .align()
            .unwrap();

        assert_eq!(view.length(), 25);
        let names = view.records().iter().map(|r| r.name.clone()).collect::<Vec<_>>();
        // All originals appear once before the first repetition.
        let originals = (0..10).map(|i| format!("a{i:03}")).collect::<Vec<_>>();
        assert_eq!(names[..10], originals[..]);
        assert_eq!(names[10], "a000");
        assert_eq!(names[24], "a004");
        let b_last = view.get(24).unwrap().domain_b.clone().unwrap();
        assert!(b_last.ends_with("b024.png"));
    }

    #[test]
    fn longer_domain_a_keeps_every_sample() {
        let root = tempfile::tempdir().unwrap();
        let a_dir = root.path().join("a");
        let b_dir = root.path().join("b");
        touch_images(&a_dir, &numbered("a", 7, "png"));
        touch_images(&b_dir, &numbered("b", 3, "png"));

        let view = DatasetAligner::new(&a_dir, DatasetMode::Train)
            .with_domain_b(&b_dir)
            .align()
            .unwrap();

        assert_eq!(view.length(), 7);
        assert!(view.get(3).unwrap().domain_b.as_ref().unwrap().ends_with("b000.png"));
    }

    #[test]
    fn side_channel_restricts_domain_a_to_matched_files() {
        let root = tempfile::tempdir().unwrap();
        let a_dir = root.path().join("a");
        let b_dir = root.path().join("b");
        let s_dir = root.path().join("depth");
        touch_images(&a_dir, &["x1.png".into(), "x2.jpg".into(), "x3.png".into()]);
        touch_images(&b_dir, &numbered("b", 2, "png"));
        // x2 matches through the extension fallback, x9 has no counterpart.
        touch_images(&s_dir, &["x1.png".into(), "x2.png".into(), "x9.png".into()]);

        let view = DatasetAligner::new(&a_dir, DatasetMode::Train)
            .with_domain_b(&b_dir)
            .with_side_channel(Some(s_dir.clone()))
            .align()
            .unwrap();

        assert_eq!(view.length(), 2);
        let first = view.get(0).unwrap();
        assert!(first.domain_a.ends_with("x1.png"));
        assert!(first.side_channel.as_ref().unwrap().ends_with("x1.png"));
        let second = view.get(1).unwrap();
        assert!(second.domain_a.ends_with("x2.jpg"));
        assert!(second.side_channel.as_ref().unwrap().ends_with("x2.png"));
    }

    #[test]
    fn side_channel_repeats_in_lock_step() {
        let root = tempfile::tempdir().unwrap();
        let a_dir = root.path().join("a");
        let b_dir = root.path().join("b");
        let s_dir = root.path().join("sketch");
        touch_images(&a_dir, &numbered("s", 2, "png"));
        touch_images(&s_dir, &numbered("s", 2, "png"));
        touch_images(&b_dir, &numbered("b", 5, "png"));

        let view = DatasetAligner::new(&a_dir, DatasetMode::Train)
            .with_domain_b(&b_dir)
            .with_side_channel(Some(s_dir))
            .align()
            .unwrap();

        assert_eq!(view.length(), 5);
        for record in view.records() {
            let a = record.domain_a.file_name().unwrap();
            let s = record.side_channel.as_ref().unwrap().file_name().unwrap();
            assert_eq!(a, s);
        }
    }

    #[test]
    fn missing_side_channel_directory_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let a_dir = root.path().join("a");
        let b_dir = root.path().join("b");
        touch_images(&a_dir, &numbered("a", 2, "png"));
        touch_images(&b_dir, &numbered("b", 2, "png"));

        let err = DatasetAligner::new(&a_dir, DatasetMode::Train)
            .with_domain_b(&b_dir)
            .with_side_channel(Some(root.path().join("nope")))
            .align()
            .unwrap_err();
        assert!(matches!(err, TrainError::MissingSideChannel(_)));
    }

    #[test]
    fn alignment_is_deterministic() {
        let root = tempfile::tempdir().unwrap();
        let a_dir = root.path().join("a");
        let b_dir = root.path().join("b");
        touch_images(&a_dir.join("nested"), &numbered("n", 3, "jpg"));
        touch_images(&a_dir, &numbered("a", 4, "png"));
        touch_images(&b_dir, &numbered("b", 9, "png"));
        std::fs::write(a_dir.join("notes.txt"), "skip me").unwrap();

        let aligner = DatasetAligner::new(&a_dir, DatasetMode::Train).with_domain_b(&b_dir);
        let first = aligner.align().unwrap();
        let second = aligner.align().unwrap();
        assert_eq!(first.records(), second.records());
        assert_eq!(first.length(), 9);
    }

    #[test]
    fn scan_respects_the_cap() {
        let root = tempfile::tempdir().unwrap();
        touch_images(root.path(), &numbered("a", 6, "png"));
        let images = scan_images(root.path(), Some(4)).unwrap();
        assert_eq!(images.len(), 4);
        assert!(images[3].ends_with("a003.png"));
    }

    #[test]
    fn eval_mode_skips_equalization() {
        let root = tempfile::tempdir().unwrap();
        let a_dir = root.path().join("a");
        let b_dir = root.path().join("b");
        touch_images(&a_dir, &numbered("a", 3, "png"));
        touch_images(&b_dir, &numbered("b", 1, "png"));

        let view = DatasetAligner::new(&a_dir, DatasetMode::Eval)
            .with_domain_b(&b_dir)
            .align()
            .unwrap();
        assert_eq!(view.length(), 3);
        assert!(view.get(0).unwrap().domain_b.is_some());
        assert!(view.get(2).unwrap().domain_b.is_none());
    }
}
