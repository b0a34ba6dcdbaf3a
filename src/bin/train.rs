#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::graphics::AutoGraphicsApi;
use burn::backend::wgpu::{init_setup, RuntimeOptions};
use burn::backend::{Autodiff, WebGpu};
use burn::config::Config;
use clap::Parser;
use sketchcycle_burn::logging::init_tracing;
use sketchcycle_burn::training::{CancellationToken, TrainingConfig};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(about = "Train an unpaired translation model with auxiliary supervision")]
struct Args {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Override the run name from the config.
    #[arg(long)]
    name: Option<String>,
    /// Resume from the run's own checkpoints.
    #[arg(long)]
    continue_train: bool,
    /// Checkpoint tag to resume from ("latest" or an epoch number).
    #[arg(long)]
    which_epoch: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(name) = args.name {
        config.name = name;
    }
    if args.continue_train {
        config.checkpoint.continue_train = true;
    }
    if let Some(tag) = args.which_epoch {
        config.checkpoint.which_epoch = tag;
    }
    if let Some(seed) = args.seed {
        config.schedule.seed = seed;
    }
    config.validate()?;

    type Backend = WebGpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;
    let device = burn::backend::wgpu::WgpuDevice::default();
    let setup = init_setup::<AutoGraphicsApi>(&device, RuntimeOptions::default());
    let max_storage_buffer_binding_size =
        setup.device.limits().max_storage_buffer_binding_size as u64;
    adjust_batch_size_for_wgpu(&mut config, max_storage_buffer_binding_size)?;

    let cancel = CancellationToken::new();
    let handle = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        warn!("interrupt received, stopping after the current step");
        handle.cancel();
    }) {
        warn!("could not install interrupt handler: {err}");
    }

    info!("starting run {}", config.name);
    sketchcycle_burn::training::train::<AutodiffBackend>(config, device, &cancel)?;
    Ok(())
}

/// Lower the batch size until the largest convolution workspace fits in one
/// WGPU storage buffer.
fn adjust_batch_size_for_wgpu(
    config: &mut TrainingConfig,
    max_storage_buffer_binding_size: u64,
) -> Result<()> {
    let elem_bytes = std::mem::size_of::<f32>() as u64;
    let per_sample_bytes = estimate_max_conv_workspace_elems(config).saturating_mul(elem_bytes);
    if per_sample_bytes == 0 {
        return Ok(());
    }

    let safe_limit = max_storage_buffer_binding_size.saturating_sub(1);
    let max_batch = (safe_limit / per_sample_bytes) as usize;
    if max_batch == 0 {
        return Err(anyhow::anyhow!(
            "WGPU max storage buffer size ({max_storage_buffer_binding_size} bytes) is too small for a single sample (estimated {per_sample_bytes} bytes). Reduce crop_size or model widths."
        ));
    }

    if config.schedule.batch_size > max_batch {
        warn!(
            "wgpu max storage buffer size {} bytes; estimated conv workspace per sample {} bytes. lowering batch_size from {} to {}; each update now covers fewer samples.",
            max_storage_buffer_binding_size,
            per_sample_bytes,
            config.schedule.batch_size,
            max_batch
        );
        config.schedule.batch_size = max_batch;
    }

    Ok(())
}

/// im2col / col2im element count of the largest layer in any network.
fn estimate_max_conv_workspace_elems(config: &TrainingConfig) -> u64 {
    let model = &config.model;
    let size = config.data.crop_size as u64;
    let ngf = model.ngf as u64;
    let channels = model.input_nc.max(model.output_nc) as u64;

    // (input channels, kernel area, output side)
    let mut layers = vec![
        (channels, 49, size),
        (ngf, 9, size / 2),
        (ngf * 2, 9, size / 4),
        (ngf * 4, 9, size / 4),
        // transposed convs scatter from the input grid
        (ngf * 2, 9, size / 4),
        (ngf, 9, size / 2),
        (ngf, 49, size),
    ];

    let ndf = model.ndf as u64;
    let mut disc_size = size;
    let mut disc_in = channels;
    for n in 0..model.n_layers_d {
        disc_size = conv_out(disc_size, 4, 2, 1);
        layers.push((disc_in, 16, disc_size));
        disc_in = ndf * (1u64 << n).min(8);
    }
    disc_size = conv_out(disc_size, 4, 1, 1);
    layers.push((disc_in, 16, disc_size));

    if config.features.use_geom {
        let feature_size = size / 4;
        layers.push((model.recog_feature_channels as u64, 49, feature_size));
        layers.push((model.geom_filters as u64, 9, feature_size / 2));
    }

    layers
        .into_iter()
        .map(|(in_channels, kernel_area, out)| in_channels * kernel_area * out * out)
        .max()
        .unwrap_or(0)
}

fn conv_out(input: u64, kernel: u64, stride: u64, padding: u64) -> u64 {
    (input + 2 * padding).saturating_sub(kernel) / stride + 1
}
