//! Setup of an SDXL network-training run up to the first step.

use candle_core::{DType, Device, Tensor};
use log::info;

use crate::error::Result;
use crate::loaders::sdxl_checkpoint_loader::TargetModel;
use crate::loaders::textual_inversion::VocabularyExtension;
use crate::loaders::tokenizer::TokenizerPair;
use crate::models::denoiser::Denoiser;
use crate::platform;
use crate::trainers::conditioning::{ConditioningSettings, ConditioningTriple};
use crate::trainers::conditioning_cache::{CacheMode, CacheSettings, ConditioningCache};
use crate::trainers::dataset::{Batch, TrainDataset};
use crate::trainers::model_family::{ModelFamily, ModelFamilyKind};
use crate::trainers::Config;

/// Models, tokenizers and conditioning state of a prepared run.
pub struct NetworkSession {
    family: Box<dyn ModelFamily>,
    model: TargetModel,
    cache: ConditioningCache,
    conditioning: ConditioningSettings,
    extensions: Vec<VocabularyExtension>,
}

impl NetworkSession {
    /// Validate `config`, load the base model and tokenizers, apply textual
    /// inversion and prime the text encoder cache when enabled.
    pub fn prepare(config: &Config, dataset: &mut dyn TrainDataset, is_main_process: bool) -> Result<Self> {
        let family = ModelFamilyKind::from_name(&config.model.family)?.create();
        family.assert_extra_args(config, dataset)?;

        let device = config.train.device()?;
        platform::ensure_available(&device)?;
        let weight_dtype = config.train.weight_dtype()?;

        let tokenizers = family.load_tokenizers(&config.model)?;
        let model = family.load_target_model(&config.model, &device, weight_dtype)?;
        Self::from_parts(family, model, tokenizers, config, dataset, is_main_process)
    }

    /// Finish setup from an already loaded model.
    pub fn from_parts(
        family: Box<dyn ModelFamily>,
        mut model: TargetModel,
        mut tokenizers: TokenizerPair,
        config: &Config,
        dataset: &mut dyn TrainDataset,
        is_main_process: bool,
    ) -> Result<Self> {
        let device = config.train.device()?;
        let weight_dtype = config.train.weight_dtype()?;
        let cache = ConditioningCache::new(
            CacheMode::from_config(&config.train),
            dataset,
            config.train.network_train_unet_only,
        )?;

        let extensions =
            family.load_textual_inversion(&config.textual_inversion, &mut tokenizers, &mut model.text_encoders)?;
        for extension in &extensions {
            if let Some((from, to)) = extension.replacement() {
                dataset.add_replacement(&from, &to);
            }
        }

        let settings = CacheSettings {
            lowram: config.train.lowram,
            device: device.clone(),
            weight_dtype,
            is_main_process,
        };
        family.cache_text_encoder_outputs_if_needed(
            &cache,
            &settings,
            &mut model.vae,
            &mut model.unet,
            &tokenizers,
            &mut model.text_encoders,
            dataset,
        )?;
        dataset.set_tokenizers(tokenizers);

        info!(
            "Prepared {} with {} textual inversion embedding(s), text encoder outputs {:?}",
            model.version,
            extensions.len(),
            cache.mode()
        );
        Ok(Self {
            family,
            model,
            cache,
            conditioning: ConditioningSettings {
                device,
                weight_dtype,
                max_token_length: config.train.max_token_length,
                full_fp16: config.train.full_fp16,
                verify_cached: config.train.verify_cached_text_encoder_outputs,
            },
            extensions,
        })
    }

    pub fn family(&self) -> &dyn ModelFamily {
        self.family.as_ref()
    }

    pub fn model(&self) -> &TargetModel {
        &self.model
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.cache.mode()
    }

    pub fn extensions(&self) -> &[VocabularyExtension] {
        &self.extensions
    }

    pub fn device(&self) -> &Device {
        &self.conditioning.device
    }

    pub fn weight_dtype(&self) -> DType {
        self.conditioning.weight_dtype
    }

    pub fn text_cond(&self, batch: &Batch) -> Result<ConditioningTriple> {
        self.family.get_text_cond(&self.conditioning, batch, &self.model.text_encoders)
    }

    /// Conditioning for `batch` followed by one denoiser call.
    pub fn predict_noise(
        &self,
        unet: &dyn Denoiser,
        batch: &Batch,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
    ) -> Result<Tensor> {
        let text_conds = self.text_cond(batch)?;
        self.family.call_unet(
            unet,
            noisy_latents,
            timesteps,
            text_conds,
            &batch.time_ids,
            &self.conditioning.device,
            self.conditioning.weight_dtype,
        )
    }
}
