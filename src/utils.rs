use anyhow::{Context, Result};
use burn::prelude::*;
use image::{GenericImage, Rgb, RgbImage};
use std::path::Path;

fn to_byte(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Convert a BCHW tensor in [0, 1] to RGB images; single-channel batches are
/// rendered as gray.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 1 && channels != 3 {
        return Err(anyhow::anyhow!(
            "expected 1 or 3 channels for images, got {channels}"
        ));
    }

    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("failed to read tensor data as f32: {err:?}"))?;
    let hw = height * width;
    let mut images = Vec::with_capacity(batch);

    for b in 0..batch {
        let base = b * channels * hw;
        let mut img = RgbImage::new(width as u32, height as u32);
        for y in 0..height {
            for x in 0..width {
                let idx = base + y * width + x;
                let pixel = if channels == 1 {
                    let v = to_byte(values[idx]);
                    Rgb([v, v, v])
                } else {
                    Rgb([
                        to_byte(values[idx]),
                        to_byte(values[idx + hw]),
                        to_byte(values[idx + 2 * hw]),
                    ])
                };
                img.put_pixel(x as u32, y as u32, pixel);
            }
        }
        images.push(img);
    }

    Ok(images)
}

/// Merge images into a fixed grid (rows x cols).
pub fn merge_images(images: &[RgbImage], rows: usize, cols: usize) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(anyhow::anyhow!("no images to merge"));
    }
    let width = images[0].width();
    let height = images[0].height();
    let mut out = RgbImage::new(width * cols as u32, height * rows as u32);

    for (idx, img) in images.iter().enumerate().take(rows * cols) {
        let row = idx / cols;
        let col = idx % cols;
        out.copy_from(img, (col as u32) * width, (row as u32) * height)
            .context("failed to copy image into grid")?;
    }

    Ok(out)
}

/// Smallest near-square grid holding `count` tiles.
pub fn grid_shape(count: usize) -> (usize, usize) {
    let cols = (count as f64).sqrt().ceil().max(1.0) as usize;
    let rows = count.div_ceil(cols).max(1);
    (rows, cols)
}

/// Concatenate images horizontally.
pub fn concat_images_horiz(images: &[RgbImage]) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(anyhow::anyhow!("no images to concatenate"));
    }
    let height = images.iter().map(|img| img.height()).max().unwrap_or(0);
    let total_width: u32 = images.iter().map(|img| img.width()).sum();
    let mut out = RgbImage::new(total_width, height);

    let mut offset_x = 0;
    for img in images {
        out.copy_from(img, offset_x, 0)
            .context("failed to concatenate image")?;
        offset_x += img.width();
    }

    Ok(out)
}

fn save_image(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    image
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))
}

/// Save a horizontal concatenation of images to disk.
pub fn save_concat_images(images: &[RgbImage], path: &Path) -> Result<()> {
    save_image(&concat_images_horiz(images)?, path)
}

/// Save images as a near-square grid.
pub fn save_grid(images: &[RgbImage], path: &Path) -> Result<()> {
    let (rows, cols) = grid_shape(images.len());
    save_image(&merge_images(images, rows, cols)?, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn gray_tensor_renders_as_equal_channels() {
        let device = Default::default();
        let tensor = Tensor::<NdArray<f32>, 4>::from_data(
            TensorData::new(vec![0.0f32, 1.0, 0.5, 2.0], [1, 1, 2, 2]),
            &device,
        );
        let images = tensor_to_images(tensor).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].get_pixel(1, 0), &Rgb([255, 255, 255]));
        assert_eq!(images[0].get_pixel(0, 1), &Rgb([128, 128, 128]));
        // out-of-range values are clamped
        assert_eq!(images[0].get_pixel(1, 1), &Rgb([255, 255, 255]));
    }

    #[test]
    fn rejects_unsupported_channel_counts() {
        let device = Default::default();
        let tensor = Tensor::<NdArray<f32>, 4>::zeros([1, 2, 2, 2], &device);
        assert!(tensor_to_images(tensor).is_err());
    }

    #[test]
    fn grid_fits_every_tile() {
        assert_eq!(grid_shape(1), (1, 1));
        assert_eq!(grid_shape(6), (2, 3));
        assert_eq!(grid_shape(9), (3, 3));

        let tiles = vec![RgbImage::new(4, 3); 5];
        let (rows, cols) = grid_shape(tiles.len());
        let grid = merge_images(&tiles, rows, cols).unwrap();
        assert_eq!(grid.dimensions(), (12, 6));

        let strip = concat_images_horiz(&tiles[..2]).unwrap();
        assert_eq!(strip.dimensions(), (8, 3));
    }
}
