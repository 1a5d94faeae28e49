//! Prepare an SDXL network-training run: validate the config, load the base
//! model, apply textual inversion and cache text encoder outputs.
//!
//! Usage: cargo run --bin prepare_sdxl_network -- /path/to/config.yaml

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use eridiffusion_network::trainers::{CaptionDataset, NetworkSession, TrainDataset};

#[derive(Parser, Debug)]
#[command(author, version, about = "Prepare SDXL network training with EriDiffusion")]
struct Args {
    /// Path to the training configuration YAML file
    config: PathBuf,

    /// Device to use (cuda:0, cuda:1, metal, cpu)
    #[arg(long)]
    device: Option<String>,

    /// Keep VAE and UNet on the device while caching text encoder outputs
    #[arg(long)]
    lowram: bool,

    /// Cache text encoder outputs to disk next to the images
    #[arg(long)]
    cache_to_disk: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    eridiffusion_network::logging::init_logger();
    eridiffusion_network::platform::log_backends();

    let mut config = eridiffusion_network::load_config(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;

    if let Some(device) = args.device {
        info!("Overriding device: {}", device);
        config.train.device = device;
    }
    if args.lowram {
        config.train.lowram = true;
    }
    if args.cache_to_disk {
        config.train.cache_text_encoder_outputs_to_disk = true;
    }

    let mut dataset = CaptionDataset::from_folder(&config.dataset, config.train.max_token_length)
        .with_context(|| format!("failed to read dataset {}", config.dataset.folder_path))?;
    info!("Dataset: {} samples", dataset.len());

    let session = NetworkSession::prepare(&config, &mut dataset, true).context("failed to prepare training")?;

    let model = session.model();
    info!("Model version: {} ({:?})", model.version, model.format);
    if let Some(ckpt) = &model.ckpt_info {
        info!("Checkpoint {} carries {} metadata entries", ckpt.path.display(), ckpt.metadata.len());
    }
    for extension in session.extensions() {
        info!(
            "Token `{}` -> ids {:?} / {:?}",
            extension.label,
            extension.ids(0),
            extension.ids(1)
        );
    }
    info!(
        "Ready: device {:?}, precision {:?}, text encoder outputs {:?}",
        session.device(),
        session.weight_dtype(),
        session.cache_mode()
    );
    eridiffusion_network::memory::log_memory_usage("after preparation");
    Ok(())
}
