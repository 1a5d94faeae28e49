pub mod conditioning;
pub mod conditioning_cache;
pub mod dataset;
pub mod diagnostics;
pub mod model_family;
pub mod session;
pub mod text_encoders;
pub mod unet_call;

// Re-export key types
pub use conditioning::{get_text_cond, ConditioningSettings, ConditioningTriple};
pub use conditioning_cache::{CacheMode, CacheSettings, ConditioningCache};
pub use dataset::{Batch, CaptionDataset, TrainDataset};
pub use model_family::{ModelFamily, ModelFamilyKind, SdxlFamily};
pub use session::NetworkSession;
pub use unet_call::call_unet;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Result, TrainerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub job: Option<String>,
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub textual_inversion: TextualInversionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Diffusers directory or single-file checkpoint.
    pub name_or_path: String,
    #[serde(default = "default_family")]
    pub family: String,
    pub text_encoder_path: Option<String>,
    pub text_encoder_2_path: Option<String>,
    pub tokenizer_path: Option<String>,
    pub tokenizer_2_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub folder_path: String,
    #[serde(default = "default_caption_ext")]
    pub caption_ext: String,
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    #[serde(default = "default_bucket_reso_steps")]
    pub bucket_reso_steps: u32,
    #[serde(default)]
    pub caption_dropout_rate: f32,
    #[serde(default)]
    pub caption_tag_dropout_rate: f32,
    #[serde(default)]
    pub shuffle_caption: bool,
    #[serde(default)]
    pub keep_tokens: usize,
    #[serde(default)]
    pub token_warmup_step: usize,
    /// Where on-disk text encoder outputs go. Defaults to next to each image.
    pub text_encoder_cache_dir: Option<String>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub device: String,
    /// `no`, `fp16` or `bf16`.
    pub mixed_precision: String,
    pub full_fp16: bool,
    pub max_token_length: Option<usize>,
    pub cache_text_encoder_outputs: bool,
    pub cache_text_encoder_outputs_to_disk: bool,
    pub network_train_unet_only: bool,
    /// Keep VAE and UNet on the device while priming the text encoder cache.
    pub lowram: bool,
    pub clip_skip: Option<usize>,
    pub v_parameterization: bool,
    pub verify_cached_text_encoder_outputs: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            device: "cuda:0".to_string(),
            mixed_precision: "bf16".to_string(),
            full_fp16: false,
            max_token_length: None,
            cache_text_encoder_outputs: false,
            cache_text_encoder_outputs_to_disk: false,
            network_train_unet_only: false,
            lowram: false,
            clip_skip: None,
            v_parameterization: false,
            verify_cached_text_encoder_outputs: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextualInversionConfig {
    #[serde(default)]
    pub embeddings: Vec<String>,
    /// Token label. Defaults to each file's stem.
    pub name: Option<String>,
}

fn default_family() -> String {
    "sdxl".to_string()
}

fn default_caption_ext() -> String {
    "txt".to_string()
}

fn default_resolution() -> u32 {
    1024
}

fn default_bucket_reso_steps() -> u32 {
    64
}

impl TrainConfig {
    pub fn weight_dtype(&self) -> Result<DType> {
        match self.mixed_precision.as_str() {
            "no" | "fp32" => Ok(DType::F32),
            "fp16" => Ok(DType::F16),
            "bf16" => Ok(DType::BF16),
            other => Err(TrainerError::config(format!("unknown mixed_precision `{}`", other))),
        }
    }

    pub fn device(&self) -> Result<Device> {
        parse_device(&self.device)
    }
}

/// `cpu`, `cuda`, `cuda:N`, `metal` or `metal:N`.
pub fn parse_device(name: &str) -> Result<Device> {
    let (kind, ordinal) = match name.split_once(':') {
        Some((kind, n)) => {
            let n = n
                .parse::<usize>()
                .map_err(|_| TrainerError::config(format!("invalid device ordinal in `{}`", name)))?;
            (kind, n)
        }
        None => (name, 0),
    };
    match kind {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(ordinal)?),
        "metal" => Ok(Device::new_metal(ordinal)?),
        _ => Err(TrainerError::config(format!("unknown device `{}`", name))),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&config_str)?;
    Ok(config)
}
