use crate::data::{DataConfig, DatasetMode, SampleRecord, SideChannelKind};
use crate::error::{TrainError, TrainResult};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How images are brought to the crop size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preprocess {
    /// Resize to `load_size` squared, then crop `crop_size`.
    ResizeAndCrop,
    /// Crop `crop_size` directly from the native image.
    Crop,
    /// Scale the width to `load_size` keeping the aspect ratio (height at
    /// least `crop_size`), then crop `crop_size`.
    ScaleWidthAndCrop,
}

/// Pixel layout of a loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Gray,
    Rgb,
}

impl ChannelMode {
    /// 1 -> grayscale, 3 -> colour.
    pub fn from_channels(channels: usize) -> TrainResult<Self> {
        match channels {
            1 => Ok(ChannelMode::Gray),
            3 => Ok(ChannelMode::Rgb),
            other => Err(TrainError::Config(format!(
                "unsupported channel count {other}, expected 1 or 3"
            ))),
        }
    }

    pub fn channels(self) -> usize {
        match self {
            ChannelMode::Gray => 1,
            ChannelMode::Rgb => 3,
        }
    }
}

/// Crop offset and flip decision shared by a domain-A image and its side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformParams {
    pub crop_x: u32,
    pub crop_y: u32,
    pub flip: bool,
}

/// CHW float planes in [0, 1] for one sample.
#[derive(Debug, Clone)]
pub struct SampleTensors {
    pub domain_a: Vec<f32>,
    pub domain_b: Option<Vec<f32>>,
    pub side_channel: Option<Vec<f32>>,
}

/// Per-sample geometric transform (resize, crop, flip) and channel conversion.
#[derive(Debug, Clone)]
pub struct SampleTransformPipeline {
    load_size: u32,
    crop_size: u32,
    preprocess: Preprocess,
    flip: bool,
    training: bool,
    domain_a: ChannelMode,
    domain_b: ChannelMode,
    side_channel: Option<SideChannelKind>,
}

impl SampleTransformPipeline {
    pub fn new(load_size: u32, crop_size: u32, preprocess: Preprocess, training: bool) -> Self {
        Self {
            load_size,
            crop_size,
            preprocess,
            flip: true,
            training,
            domain_a: ChannelMode::Rgb,
            domain_b: ChannelMode::Rgb,
            side_channel: None,
        }
    }

    pub fn from_config(
        config: &DataConfig,
        input_nc: usize,
        output_nc: usize,
        side_channel: Option<SideChannelKind>,
    ) -> TrainResult<Self> {
        Ok(Self::new(
            config.load_size as u32,
            config.crop_size as u32,
            config.preprocess,
            config.mode == DatasetMode::Train,
        )
        .with_flip(!config.no_flip)
        .with_domain_modes(
            ChannelMode::from_channels(input_nc)?,
            ChannelMode::from_channels(output_nc)?,
        )
        .with_side_channel(side_channel))
    }

    pub fn with_flip(mut self, flip: bool) -> Self {
        self.flip = flip;
        self
    }

    pub fn with_domain_modes(mut self, domain_a: ChannelMode, domain_b: ChannelMode) -> Self {
        self.domain_a = domain_a;
        self.domain_b = domain_b;
        self
    }

    pub fn with_side_channel(mut self, kind: Option<SideChannelKind>) -> Self {
        self.side_channel = kind;
        self
    }

    pub fn crop_size(&self) -> u32 {
        self.crop_size
    }

    pub fn domain_a_mode(&self) -> ChannelMode {
        self.domain_a
    }

    pub fn domain_b_mode(&self) -> ChannelMode {
        self.domain_b
    }

    pub fn side_channel_mode(&self) -> Option<ChannelMode> {
        self.side_channel.map(SideChannelKind::channel_mode)
    }

    fn working_size(&self, native: (u32, u32)) -> (u32, u32) {
        match self.preprocess {
            Preprocess::ResizeAndCrop => (self.load_size, self.load_size),
            Preprocess::Crop => native,
            Preprocess::ScaleWidthAndCrop => self.scaled_width_size(native),
        }
    }

    fn scaled_width_size(&self, (width, height): (u32, u32)) -> (u32, u32) {
        let scaled = u64::from(self.load_size) * u64::from(height) / u64::from(width.max(1));
        (self.load_size, (scaled as u32).max(self.crop_size))
    }

    /// Draw a random crop offset and flip for an image of the given native size.
    pub fn draw_params(&self, native: (u32, u32), rng: &mut impl Rng) -> TransformParams {
        let (width, height) = self.working_size(native);
        let max_x = width.saturating_sub(self.crop_size);
        let max_y = height.saturating_sub(self.crop_size);
        let crop_x = if max_x == 0 { 0 } else { rng.gen_range(0..=max_x) };
        let crop_y = if max_y == 0 { 0 } else { rng.gen_range(0..=max_y) };
        let flip = self.flip && rng.gen_bool(0.5);
        TransformParams {
            crop_x,
            crop_y,
            flip,
        }
    }

    /// Centre crop without flipping.
    pub fn fixed_params(&self, native: (u32, u32)) -> TransformParams {
        let (width, height) = self.working_size(native);
        TransformParams {
            crop_x: width.saturating_sub(self.crop_size) / 2,
            crop_y: height.saturating_sub(self.crop_size) / 2,
            flip: false,
        }
    }

    fn params_for(&self, native: (u32, u32), rng: &mut impl Rng) -> TransformParams {
        if self.training {
            self.draw_params(native, rng)
        } else {
            self.fixed_params(native)
        }
    }

    /// Convert, resize, crop and flip one image.
    pub fn apply(&self, img: &DynamicImage, params: TransformParams, mode: ChannelMode) -> DynamicImage {
        let img = match mode {
            ChannelMode::Gray => DynamicImage::ImageLuma8(img.to_luma8()),
            ChannelMode::Rgb => DynamicImage::ImageRgb8(img.to_rgb8()),
        };
        let target = self.working_size(img.dimensions());
        let img = if target == img.dimensions() {
            img
        } else {
            img.resize_exact(target.0, target.1, FilterType::CatmullRom)
        };
        let mut img = img.crop_imm(params.crop_x, params.crop_y, self.crop_size, self.crop_size);
        // Images smaller than the crop come back short.
        if img.dimensions() != (self.crop_size, self.crop_size) {
            img = img.resize_exact(self.crop_size, self.crop_size, FilterType::CatmullRom);
        }
        if params.flip {
            img = img.fliph();
        }
        img
    }

    /// Load and transform every image referenced by a record.
    pub fn load(&self, record: &SampleRecord, rng: &mut impl Rng) -> TrainResult<SampleTensors> {
        let img_a = open_image(&record.domain_a)?;
        let params = self.params_for(img_a.dimensions(), rng);
        let domain_a = image_to_chw(&self.apply(&img_a, params, self.domain_a), self.domain_a);

        let side_channel = match (self.side_channel, &record.side_channel) {
            (Some(kind), Some(path)) => {
                let mode = kind.channel_mode();
                let img = open_image(path)?;
                Some(image_to_chw(&self.apply(&img, params, mode), mode))
            }
            _ => None,
        };

        // Domain B has no spatial correspondence, so it draws its own parameters.
        let domain_b = match &record.domain_b {
            Some(path) => {
                let img = open_image(path)?;
                let params_b = self.params_for(img.dimensions(), rng);
                Some(image_to_chw(&self.apply(&img, params_b, self.domain_b), self.domain_b))
            }
            None => None,
        };

        Ok(SampleTensors {
            domain_a,
            domain_b,
            side_channel,
        })
    }
}

fn open_image(path: &Path) -> TrainResult<DynamicImage> {
    image::open(path).map_err(|source| TrainError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Convert image data to CHW floats in [0, 1].
pub fn image_to_chw(img: &DynamicImage, mode: ChannelMode) -> Vec<f32> {
    match mode {
        ChannelMode::Gray => img
            .to_luma8()
            .as_raw()
            .iter()
            .map(|&v| v as f32 / 255.0)
            .collect(),
        ChannelMode::Rgb => {
            let rgb = img.to_rgb8();
            let (width, height) = rgb.dimensions();
            let hw = (width * height) as usize;
            let mut out = vec![0.0f32; hw * 3];
            for (idx, pixel) in rgb.pixels().enumerate() {
                out[idx] = pixel[0] as f32 / 255.0;
                out[hw + idx] = pixel[1] as f32 / 255.0;
                out[2 * hw + idx] = pixel[2] as f32 / 255.0;
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use rand::{rngs::StdRng, SeedableRng};

    const MARKER: (u32, u32) = (16, 14);

    fn marked_rgb() -> DynamicImage {
        let mut img = RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]));
        img.put_pixel(MARKER.0, MARKER.1, Rgb([255, 255, 255]));
        DynamicImage::ImageRgb8(img)
    }

    fn marked_gray() -> DynamicImage {
        let mut img = GrayImage::from_pixel(32, 32, Luma([0]));
        img.put_pixel(MARKER.0, MARKER.1, Luma([255]));
        DynamicImage::ImageLuma8(img)
    }

    fn brightest(img: &DynamicImage) -> (u32, u32) {
        let gray = img.to_luma8();
        let mut best = (0, 0, 0u8);
        for (x, y, pixel) in gray.enumerate_pixels() {
            if pixel[0] > best.2 {
                best = (x, y, pixel[0]);
            }
        }
        (best.0, best.1)
    }

    #[test]
    fn side_channel_shares_crop_and_flip() {
        let pipeline = SampleTransformPipeline::new(32, 24, Preprocess::Crop, true);
        let a = marked_rgb();
        let side = marked_gray();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..20 {
            let params = pipeline.draw_params(a.dimensions(), &mut rng);
            let out_a = pipeline.apply(&a, params, ChannelMode::Rgb);
            let out_side = pipeline.apply(&side, params, ChannelMode::Gray);

            let mut expected_x = MARKER.0 - params.crop_x;
            if params.flip {
                expected_x = 23 - expected_x;
            }
            let expected = (expected_x, MARKER.1 - params.crop_y);
            assert_eq!(brightest(&out_a), expected);
            assert_eq!(brightest(&out_side), expected);
        }
    }

    #[test]
    fn resized_side_channel_tracks_domain_a() {
        let pipeline = SampleTransformPipeline::new(40, 24, Preprocess::ResizeAndCrop, true);
        let a = marked_rgb();
        let side = marked_gray();
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..10 {
            let params = pipeline.draw_params(a.dimensions(), &mut rng);
            let out_a = pipeline.apply(&a, params, ChannelMode::Rgb);
            let out_side = pipeline.apply(&side, params, ChannelMode::Gray);
            assert_eq!(out_a.dimensions(), (24, 24));
            assert_eq!(brightest(&out_a), brightest(&out_side));
        }
    }

    #[test]
    fn scale_width_keeps_aspect_ratio() {
        let pipeline = SampleTransformPipeline::new(32, 16, Preprocess::ScaleWidthAndCrop, true)
            .with_flip(false);
        let centre = |native| {
            let params = pipeline.fixed_params(native);
            (params.crop_x, params.crop_y)
        };
        // 64x32 scales to 32x16, 32x64 keeps its size, 64x8 is stretched to the crop height
        assert_eq!(centre((64, 32)), (8, 0));
        assert_eq!(centre((32, 64)), (8, 24));
        assert_eq!(centre((64, 8)), (8, 0));

        let mut rng = StdRng::seed_from_u64(5);
        let mut img = RgbImage::from_pixel(64, 32, Rgb([0, 0, 0]));
        img.put_pixel(40, 20, Rgb([255, 255, 255]));
        let a = DynamicImage::ImageRgb8(img);
        let mut side = GrayImage::from_pixel(64, 32, Luma([0]));
        side.put_pixel(40, 20, Luma([255]));
        let side = DynamicImage::ImageLuma8(side);
        for _ in 0..10 {
            let params = pipeline.draw_params(a.dimensions(), &mut rng);
            let out_a = pipeline.apply(&a, params, ChannelMode::Rgb);
            let out_side = pipeline.apply(&side, params, ChannelMode::Gray);
            assert_eq!(out_a.dimensions(), (16, 16));
            // the marker lands at x = 20 after scaling
            if params.crop_x > 4 {
                assert_eq!(brightest(&out_a), brightest(&out_side));
            }
        }
    }

    #[test]
    fn no_flip_never_flips() {
        let pipeline =
            SampleTransformPipeline::new(32, 16, Preprocess::ResizeAndCrop, true).with_flip(false);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            assert!(!pipeline.draw_params((64, 64), &mut rng).flip);
        }
    }

    #[test]
    fn eval_transform_is_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        marked_rgb().save(&path).unwrap();
        let record = SampleRecord {
            index: 0,
            name: "a".to_string(),
            domain_a: path,
            domain_b: None,
            side_channel: None,
        };

        let pipeline = SampleTransformPipeline::new(32, 24, Preprocess::Crop, false);
        let first = pipeline.load(&record, &mut StdRng::seed_from_u64(1)).unwrap();
        let second = pipeline.load(&record, &mut StdRng::seed_from_u64(2)).unwrap();
        assert_eq!(first.domain_a, second.domain_a);
        assert_eq!(
            pipeline.fixed_params((32, 32)),
            TransformParams {
                crop_x: 4,
                crop_y: 4,
                flip: false
            }
        );
    }

    #[test]
    fn channel_modes_set_plane_count() {
        let img = marked_rgb();
        assert_eq!(image_to_chw(&img, ChannelMode::Gray).len(), 32 * 32);
        let rgb = image_to_chw(&img, ChannelMode::Rgb);
        assert_eq!(rgb.len(), 3 * 32 * 32);
        let idx = (MARKER.1 * 32 + MARKER.0) as usize;
        assert_eq!(rgb[idx], 1.0);
        assert_eq!(rgb[2 * 32 * 32 + idx], 1.0);
        assert!(ChannelMode::from_channels(2).is_err());
    }
}
