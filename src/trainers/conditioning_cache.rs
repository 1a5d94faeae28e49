//! Caching of text encoder outputs for runs that only train the UNet network.

use candle_core::{DType, Device};
use log::{info, warn};

use crate::error::{Result, TrainerError};
use crate::loaders::tokenizer::TokenizerPair;
use crate::memory;
use crate::models::residency::{ModelRole, ResidencyLedger, Resident};
use crate::models::text_encoder::TextEncoderPair;
use crate::trainers::dataset::TrainDataset;
use crate::trainers::TrainConfig;

const TEXT_ENCODER_ROLES: [ModelRole; 2] = [ModelRole::TextEncoder1, ModelRole::TextEncoder2];

/// Whether conditioning is computed per batch or precomputed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Live,
    Cached { to_disk: bool },
}

impl CacheMode {
    pub fn from_config(train: &TrainConfig) -> Self {
        if train.cache_text_encoder_outputs || train.cache_text_encoder_outputs_to_disk {
            CacheMode::Cached {
                to_disk: train.cache_text_encoder_outputs_to_disk,
            }
        } else {
            CacheMode::Live
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Keep VAE and UNet where they are while priming.
    pub lowram: bool,
    pub device: Device,
    pub weight_dtype: DType,
    pub is_main_process: bool,
}

#[derive(Debug)]
pub struct ConditioningCache {
    mode: CacheMode,
}

impl ConditioningCache {
    /// Check that `mode` can be used with `dataset`.
    ///
    /// Caching needs fixed captions and a frozen text encoder, so it is
    /// rejected for augmented datasets and when the text encoders train.
    pub fn new(mode: CacheMode, dataset: &dyn TrainDataset, network_train_unet_only: bool) -> Result<Self> {
        if let CacheMode::Cached { .. } = mode {
            if !dataset.is_text_encoder_output_cacheable() {
                return Err(TrainerError::config(
                    "caching text encoder outputs requires captions without shuffle, dropout or token warmup",
                ));
            }
            if !network_train_unet_only {
                return Err(TrainerError::config(
                    "caching text encoder outputs requires network_train_unet_only",
                ));
            }
        }
        Ok(Self { mode })
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.mode, CacheMode::Cached { .. })
    }

    /// Put the models where training expects them, priming the cache if enabled.
    ///
    /// Cached mode moves VAE and UNet off the device (unless `lowram`),
    /// encodes every sample, leaves the text encoders at their earlier
    /// location in F32 and puts VAE and UNet back. The moves back happen even
    /// when encoding fails, and the encoding error is the one returned.
    pub fn prepare(
        &self,
        settings: &CacheSettings,
        vae: &mut dyn Resident,
        unet: &mut dyn Resident,
        tokenizers: &TokenizerPair,
        text_encoders: &mut TextEncoderPair,
        dataset: &mut dyn TrainDataset,
    ) -> Result<()> {
        let to_disk = match self.mode {
            CacheMode::Live => {
                info!("Moving text encoders to {:?}", settings.device);
                return text_encoders.relocate_all(&settings.device, None);
            }
            CacheMode::Cached { to_disk } => to_disk,
        };

        let mut ledger = ResidencyLedger::new();
        let primed = Self::prime(settings, to_disk, &mut ledger, vae, unet, tokenizers, text_encoders, dataset);
        let restored = Self::restore(&ledger, vae, unet, text_encoders);
        if let (Err(primary), Err(secondary)) = (&primed, &restored) {
            warn!("Restoring model placement after failed caching also failed: {} (caching: {})", secondary, primary);
        }
        primed.and(restored)
    }

    #[allow(clippy::too_many_arguments)]
    fn prime(
        settings: &CacheSettings,
        to_disk: bool,
        ledger: &mut ResidencyLedger,
        vae: &mut dyn Resident,
        unet: &mut dyn Resident,
        tokenizers: &TokenizerPair,
        text_encoders: &mut TextEncoderPair,
        dataset: &mut dyn TrainDataset,
    ) -> Result<()> {
        if !settings.lowram {
            ledger.offload(ModelRole::Vae, vae, &Device::Cpu)?;
            ledger.offload(ModelRole::Unet, unet, &Device::Cpu)?;
            memory::empty_cache(&settings.device)?;
        }

        for (role, placement) in TEXT_ENCODER_ROLES.into_iter().zip(text_encoders.placements()) {
            ledger.record_placement(role, placement);
        }
        text_encoders.relocate_all(&settings.device, Some(settings.weight_dtype))?;
        memory::log_memory_usage("before caching text encoder outputs");

        dataset.cache_text_encoder_outputs(
            tokenizers,
            text_encoders,
            &settings.device,
            settings.weight_dtype,
            to_disk,
            settings.is_main_process,
        )
    }

    /// Every move is attempted; the first failure is returned.
    fn restore(
        ledger: &ResidencyLedger,
        vae: &mut dyn Resident,
        unet: &mut dyn Resident,
        text_encoders: &mut TextEncoderPair,
    ) -> Result<()> {
        let mut first_error = None;
        let mut keep = |result: Result<()>| {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        };

        for (index, role) in TEXT_ENCODER_ROLES.into_iter().enumerate() {
            if let Some(prior) = ledger.prior(role) {
                let encoder = text_encoders.get_mut(index);
                info!("Moving {} back to {:?} in F32", encoder.name(), prior.device);
                keep(encoder.relocate(&prior.device, Some(DType::F32)));
            }
        }
        keep(ledger.restore(ModelRole::Vae, vae));
        keep(ledger.restore(ModelRole::Unet, unet));

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
