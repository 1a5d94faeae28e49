//! SDXL checkpoint loader that handles different model formats

use candle_core::{DType, Device, Tensor};
use log::{info, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{Result, TrainerError};
use crate::models::residency::Resident;
use crate::models::text_encoder::{ClipTextEncoder, TextEncoderPair};
use crate::models::weight_map::WeightMap;
use crate::trainers::ModelConfig;

const UNET_PREFIX: &str = "model.diffusion_model.";
const VAE_PREFIX: &str = "first_stage_model.";
const CLIP_L_PREFIX: &str = "conditioner.embedders.0.transformer.";
const LOGIT_SCALE_KEY: &str = "conditioner.embedders.1.model.logit_scale";
const MAX_HEADER_LEN: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// `text_encoder/`, `text_encoder_2/`, `vae/`, `unet/` directories.
    Diffusers,
    /// One safetensors file with every component under its own prefix.
    StableDiffusion,
}

#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    pub metadata: HashMap<String, String>,
}

/// Everything the training core needs from the base model.
pub struct TargetModel {
    pub version: String,
    pub format: CheckpointFormat,
    pub text_encoders: TextEncoderPair,
    pub vae: WeightMap,
    pub unet: WeightMap,
    pub logit_scale: Option<f32>,
    pub ckpt_info: Option<CheckpointInfo>,
}

pub fn detect_format(path: &Path) -> Result<CheckpointFormat> {
    if path.is_dir() {
        Ok(CheckpointFormat::Diffusers)
    } else if path.is_file() {
        Ok(CheckpointFormat::StableDiffusion)
    } else {
        Err(TrainerError::Checkpoint(format!("{} does not exist", path.display())))
    }
}

/// `__metadata__` of a safetensors file, read from the header only.
pub fn read_safetensors_metadata(path: &Path) -> Result<HashMap<String, String>> {
    let mut file = File::open(path)?;
    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len > MAX_HEADER_LEN {
        return Err(TrainerError::Checkpoint(format!(
            "{}: header of {} bytes is not plausible",
            path.display(),
            header_len
        )));
    }
    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)?;
    let header: serde_json::Value = serde_json::from_slice(&header)?;

    let metadata = header
        .get("__metadata__")
        .and_then(|m| m.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Ok(metadata)
}

fn load_tensors(path: &Path) -> Result<HashMap<String, Tensor>> {
    if !path.exists() {
        return Err(TrainerError::Checkpoint(format!("{} not found", path.display())));
    }
    info!("Loading {}", path.display());
    Ok(candle_core::safetensors::load(path, &Device::Cpu)?)
}

fn require_weights(map: WeightMap, source: &Path) -> Result<WeightMap> {
    if map.is_empty() {
        return Err(TrainerError::Checkpoint(format!(
            "{} has no weights for {}",
            source.display(),
            map.name()
        )));
    }
    Ok(map)
}

/// Load text encoders, VAE and UNet for an SDXL base model.
///
/// Text encoders are placed on the CPU, VAE and UNet on `device`, all in
/// `dtype`. Explicit encoder paths in `config` override the checkpoint.
pub fn load_target_model(config: &ModelConfig, device: &Device, version: &str, dtype: DType) -> Result<TargetModel> {
    let root = Path::new(&config.name_or_path);
    let format = detect_format(root)?;
    info!("Loading SDXL model from {} ({:?})", root.display(), format);

    let (te1_tensors, te2_tensors, vae, unet, logit_scale, ckpt_path) = match format {
        CheckpointFormat::Diffusers => {
            let te1 = root.join("text_encoder").join("model.safetensors");
            let te2 = root.join("text_encoder_2").join("model.safetensors");
            let te1 = match &config.text_encoder_path {
                Some(p) => load_tensors(Path::new(p))?,
                None => load_tensors(&te1)?,
            };
            let te2 = match &config.text_encoder_2_path {
                Some(p) => load_tensors(Path::new(p))?,
                None => load_tensors(&te2)?,
            };
            let vae_path = root.join("vae").join("diffusion_pytorch_model.safetensors");
            let unet_path = root.join("unet").join("diffusion_pytorch_model.safetensors");
            let vae = WeightMap::new("vae", load_tensors(&vae_path)?, device.clone(), dtype)?;
            let unet = WeightMap::new("unet", load_tensors(&unet_path)?, device.clone(), dtype)?;
            (te1, te2, vae, unet, None, unet_path)
        }
        CheckpointFormat::StableDiffusion => {
            let all = load_tensors(root)?;
            let unet = require_weights(WeightMap::from_prefixed("unet", &all, UNET_PREFIX, device.clone(), dtype)?, root)?;
            let vae = require_weights(WeightMap::from_prefixed("vae", &all, VAE_PREFIX, device.clone(), dtype)?, root)?;
            let te1 = match &config.text_encoder_path {
                Some(p) => load_tensors(Path::new(p))?,
                None => all
                    .iter()
                    .filter_map(|(k, t)| k.strip_prefix(CLIP_L_PREFIX).map(|rest| (rest.to_string(), t.clone())))
                    .collect(),
            };
            let te2 = match &config.text_encoder_2_path {
                Some(p) => load_tensors(Path::new(p))?,
                None => {
                    return Err(TrainerError::config(
                        "single-file checkpoints need text_encoder_2_path for the CLIP-G encoder",
                    ))
                }
            };
            let logit_scale = match all.get(LOGIT_SCALE_KEY) {
                Some(t) => Some(t.to_dtype(DType::F32)?.flatten_all()?.get(0)?.to_scalar::<f32>()?),
                None => None,
            };
            (te1, te2, vae, unet, logit_scale, root.to_path_buf())
        }
    };

    let text_encoder1 = ClipTextEncoder::clip_l(te1_tensors, Device::Cpu, dtype)?;
    let text_encoder2 = ClipTextEncoder::clip_g(te2_tensors, Device::Cpu, dtype)?;

    let ckpt_info = match read_safetensors_metadata(&ckpt_path) {
        Ok(metadata) => Some(CheckpointInfo {
            path: ckpt_path,
            metadata,
        }),
        Err(e) => {
            warn!("Could not read checkpoint metadata: {}", e);
            None
        }
    };
    if let Some(scale) = logit_scale {
        info!("logit_scale: {}", scale);
    }

    Ok(TargetModel {
        version: version.to_string(),
        format,
        text_encoders: TextEncoderPair::new(Box::new(text_encoder1), Box::new(text_encoder2)),
        vae,
        unet,
        logit_scale,
        ckpt_info,
    })
}
