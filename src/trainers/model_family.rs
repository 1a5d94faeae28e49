//! Model-family hooks of the network trainer.
//!
//! The generic training loop calls these at fixed points; each base model
//! family supplies its own loading, conditioning and denoiser call.

use candle_core::{DType, Device, Tensor};
use log::{info, warn};
use std::path::{Path, PathBuf};

use crate::error::{Result, TrainerError};
use crate::loaders::sdxl_checkpoint_loader::{self, TargetModel};
use crate::loaders::textual_inversion::{self, VocabularyExtension};
use crate::loaders::tokenizer::{ClipTokenizer, TokenizerPair};
use crate::models::denoiser::Denoiser;
use crate::models::residency::Resident;
use crate::models::sdxl_time_ids::TimeIds;
use crate::models::text_encoder::TextEncoderPair;
use crate::trainers::conditioning::{self, ConditioningSettings, ConditioningTriple};
use crate::trainers::conditioning_cache::{CacheMode, CacheSettings, ConditioningCache};
use crate::trainers::dataset::{Batch, TrainDataset};
use crate::trainers::unet_call;
use crate::trainers::{Config, ModelConfig, TextualInversionConfig, TrainConfig};

pub const MODEL_VERSION_SDXL_BASE_V1_0: &str = "sdxl_base_v1-0";
pub const SDXL_VAE_SCALE_FACTOR: f64 = 0.13025;
/// SDXL latents are 1/8 of the image and the UNet downsamples three more times.
pub const SDXL_BUCKET_RESO_STEPS: u32 = 32;
const SDXL_MAX_TOKEN_LENGTHS: [usize; 2] = [150, 225];
/// CLIP-G pads with `!` instead of EOS.
const CLIP_G_PAD_TOKEN: &str = "!";

pub trait ModelFamily {
    fn version_tag(&self) -> &'static str;

    fn vae_scale_factor(&self) -> f64;

    /// Reject configurations this family cannot train. Runs before any model is loaded.
    fn assert_extra_args(&self, config: &Config, dataset: &dyn TrainDataset) -> Result<()>;

    fn load_target_model(&self, config: &ModelConfig, device: &Device, dtype: DType) -> Result<TargetModel>;

    fn load_tokenizers(&self, config: &ModelConfig) -> Result<TokenizerPair>;

    fn load_textual_inversion(
        &self,
        config: &TextualInversionConfig,
        tokenizers: &mut TokenizerPair,
        text_encoders: &mut TextEncoderPair,
    ) -> Result<Vec<VocabularyExtension>>;

    fn is_text_encoder_outputs_cached(&self, train: &TrainConfig) -> bool {
        CacheMode::from_config(train) != CacheMode::Live
    }

    #[allow(clippy::too_many_arguments)]
    fn cache_text_encoder_outputs_if_needed(
        &self,
        cache: &ConditioningCache,
        settings: &CacheSettings,
        vae: &mut dyn Resident,
        unet: &mut dyn Resident,
        tokenizers: &TokenizerPair,
        text_encoders: &mut TextEncoderPair,
        dataset: &mut dyn TrainDataset,
    ) -> Result<()>;

    fn get_text_cond(
        &self,
        settings: &ConditioningSettings,
        batch: &Batch,
        text_encoders: &TextEncoderPair,
    ) -> Result<ConditioningTriple>;

    #[allow(clippy::too_many_arguments)]
    fn call_unet(
        &self,
        unet: &dyn Denoiser,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
        text_conds: ConditioningTriple,
        time_ids: &[TimeIds],
        device: &Device,
        weight_dtype: DType,
    ) -> Result<Tensor>;
}

/// Checks shared by every SDXL trainer.
pub fn verify_sdxl_training_args(train: &TrainConfig) -> Result<()> {
    if train.clip_skip.is_some() {
        return Err(TrainerError::config("clip_skip is not supported for SDXL"));
    }
    if train.v_parameterization {
        warn!("v_parameterization will be unexpected with SDXL base models");
    }
    if let Some(length) = train.max_token_length {
        if !SDXL_MAX_TOKEN_LENGTHS.contains(&length) {
            return Err(TrainerError::config(format!(
                "max_token_length must be unset, 150 or 225, got {}",
                length
            )));
        }
    }
    if train.full_fp16 && train.mixed_precision != "fp16" {
        return Err(TrainerError::config("full_fp16 requires mixed_precision: fp16"));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct SdxlFamily;

impl SdxlFamily {
    fn tokenizer_path(explicit: &Option<String>, root: &Path, dir: &str) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(PathBuf::from(path));
        }
        if root.is_dir() {
            return Ok(root.join(dir).join("tokenizer.json"));
        }
        Err(TrainerError::config(format!(
            "single-file checkpoints need an explicit path for {}",
            dir
        )))
    }
}

impl ModelFamily for SdxlFamily {
    fn version_tag(&self) -> &'static str {
        MODEL_VERSION_SDXL_BASE_V1_0
    }

    fn vae_scale_factor(&self) -> f64 {
        SDXL_VAE_SCALE_FACTOR
    }

    fn assert_extra_args(&self, config: &Config, dataset: &dyn TrainDataset) -> Result<()> {
        verify_sdxl_training_args(&config.train)?;
        ConditioningCache::new(
            CacheMode::from_config(&config.train),
            dataset,
            config.train.network_train_unet_only,
        )?;
        dataset.verify_bucket_reso_steps(SDXL_BUCKET_RESO_STEPS)
    }

    fn load_target_model(&self, config: &ModelConfig, device: &Device, dtype: DType) -> Result<TargetModel> {
        sdxl_checkpoint_loader::load_target_model(config, device, self.version_tag(), dtype)
    }

    fn load_tokenizers(&self, config: &ModelConfig) -> Result<TokenizerPair> {
        let root = Path::new(&config.name_or_path);
        let path1 = Self::tokenizer_path(&config.tokenizer_path, root, "tokenizer")?;
        let path2 = Self::tokenizer_path(&config.tokenizer_2_path, root, "tokenizer_2")?;
        let tokenizer1 = ClipTokenizer::from_file(&path1, None)?;
        let tokenizer2 = ClipTokenizer::from_file(&path2, Some(CLIP_G_PAD_TOKEN))?;
        Ok(TokenizerPair::new(Box::new(tokenizer1), Box::new(tokenizer2)))
    }

    fn load_textual_inversion(
        &self,
        config: &TextualInversionConfig,
        tokenizers: &mut TokenizerPair,
        text_encoders: &mut TextEncoderPair,
    ) -> Result<Vec<VocabularyExtension>> {
        if config.embeddings.is_empty() {
            return Ok(Vec::new());
        }
        let paths: Vec<PathBuf> = config.embeddings.iter().map(PathBuf::from).collect();
        textual_inversion::load_textual_inversion(&paths, config.name.as_deref(), tokenizers, text_encoders)
    }

    fn cache_text_encoder_outputs_if_needed(
        &self,
        cache: &ConditioningCache,
        settings: &CacheSettings,
        vae: &mut dyn Resident,
        unet: &mut dyn Resident,
        tokenizers: &TokenizerPair,
        text_encoders: &mut TextEncoderPair,
        dataset: &mut dyn TrainDataset,
    ) -> Result<()> {
        if cache.is_cached() {
            info!("Caching text encoder outputs ({:?})", cache.mode());
        }
        cache.prepare(settings, vae, unet, tokenizers, text_encoders, dataset)
    }

    fn get_text_cond(
        &self,
        settings: &ConditioningSettings,
        batch: &Batch,
        text_encoders: &TextEncoderPair,
    ) -> Result<ConditioningTriple> {
        conditioning::get_text_cond(settings, batch, text_encoders)
    }

    fn call_unet(
        &self,
        unet: &dyn Denoiser,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
        text_conds: ConditioningTriple,
        time_ids: &[TimeIds],
        device: &Device,
        weight_dtype: DType,
    ) -> Result<Tensor> {
        unet_call::call_unet(unet, noisy_latents, timesteps, text_conds, time_ids, device, weight_dtype)
    }
}

/// Families selectable by `model.family`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamilyKind {
    SdxlBase,
}

impl ModelFamilyKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sdxl" | "sdxl_base" | MODEL_VERSION_SDXL_BASE_V1_0 => Ok(ModelFamilyKind::SdxlBase),
            other => Err(TrainerError::config(format!("unsupported model family `{}`", other))),
        }
    }

    pub fn create(self) -> Box<dyn ModelFamily> {
        match self {
            ModelFamilyKind::SdxlBase => Box::new(SdxlFamily),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::trainers::dataset::tests::{dataset, dataset_config};
    use crate::trainers::DatasetConfig;

    pub fn config(train: TrainConfig, dataset: DatasetConfig) -> Config {
        Config {
            job: None,
            model: ModelConfig {
                name_or_path: "/models/sdxl".to_string(),
                family: "sdxl".to_string(),
                text_encoder_path: None,
                text_encoder_2_path: None,
                tokenizer_path: None,
                tokenizer_2_path: None,
            },
            dataset,
            train,
            textual_inversion: TextualInversionConfig::default(),
        }
    }

    #[test]
    fn family_names() -> Result<()> {
        assert_eq!(ModelFamilyKind::from_name("SDXL")?, ModelFamilyKind::SdxlBase);
        assert_eq!(ModelFamilyKind::from_name("sdxl")?.create().version_tag(), MODEL_VERSION_SDXL_BASE_V1_0);
        assert!(ModelFamilyKind::from_name("flux").is_err());
        Ok(())
    }

    #[test]
    fn sdxl_args_are_verified() {
        let train = TrainConfig {
            clip_skip: Some(2),
            ..Default::default()
        };
        assert!(verify_sdxl_training_args(&train).is_err());

        let train = TrainConfig {
            max_token_length: Some(100),
            ..Default::default()
        };
        assert!(verify_sdxl_training_args(&train).is_err());

        let train = TrainConfig {
            full_fp16: true,
            mixed_precision: "bf16".to_string(),
            ..Default::default()
        };
        assert!(verify_sdxl_training_args(&train).is_err());

        let train = TrainConfig {
            max_token_length: Some(225),
            v_parameterization: true,
            ..Default::default()
        };
        assert!(verify_sdxl_training_args(&train).is_ok());
    }

    #[test]
    fn caching_with_augmentation_is_rejected() {
        let mut dataset_cfg = dataset_config("/tmp");
        dataset_cfg.shuffle_caption = true;
        let ds = dataset(Path::new("/tmp"), 1, dataset_cfg.clone());
        let train = TrainConfig {
            cache_text_encoder_outputs: true,
            network_train_unet_only: true,
            ..Default::default()
        };
        let result = SdxlFamily.assert_extra_args(&config(train, dataset_cfg), &ds);
        assert!(matches!(result, Err(TrainerError::Configuration(_))));
    }

    #[test]
    fn bucket_steps_must_be_multiples_of_32() {
        let mut dataset_cfg = dataset_config("/tmp");
        dataset_cfg.bucket_reso_steps = 48;
        let ds = dataset(Path::new("/tmp"), 1, dataset_cfg.clone());
        let result = SdxlFamily.assert_extra_args(&config(TrainConfig::default(), dataset_cfg), &ds);
        assert!(result.is_err());
    }

    #[test]
    fn single_file_tokenizers_need_paths() {
        let model = ModelConfig {
            name_or_path: "/does/not/exist.safetensors".to_string(),
            family: "sdxl".to_string(),
            text_encoder_path: None,
            text_encoder_2_path: None,
            tokenizer_path: None,
            tokenizer_2_path: None,
        };
        assert!(matches!(SdxlFamily.load_tokenizers(&model), Err(TrainerError::Configuration(_))));
    }
}
