//! Per-batch text conditioning, from the cache or from the live encoders.

use candle_core::{DType, Device, Tensor};
use log::{debug, warn};

use crate::error::{Result, TrainerError};
use crate::models::text_encoder::TextEncoderPair;
use crate::trainers::dataset::Batch;
use crate::trainers::diagnostics;
use crate::trainers::text_encoders::hidden_states_sdxl;

/// Text conditioning of a batch: both hidden states and the pooled CLIP-G vector.
#[derive(Debug, Clone)]
pub struct ConditioningTriple {
    /// `(batch, tokens, 768)`
    pub hidden_states1: Tensor,
    /// `(batch, tokens, 1280)`
    pub hidden_states2: Tensor,
    /// `(batch, 1280)`
    pub pool2: Tensor,
}

impl ConditioningTriple {
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        Ok(Self {
            hidden_states1: self.hidden_states1.to_dtype(dtype)?,
            hidden_states2: self.hidden_states2.to_dtype(dtype)?,
            pool2: self.pool2.to_dtype(dtype)?,
        })
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            hidden_states1: self.hidden_states1.to_device(device)?,
            hidden_states2: self.hidden_states2.to_device(device)?,
            pool2: self.pool2.to_device(device)?,
        })
    }

    /// Leading dimension shared by all three tensors.
    pub fn batch_size(&self) -> Result<usize> {
        let b = self.hidden_states1.dim(0)?;
        for (what, t) in [("hidden_states2", &self.hidden_states2), ("pool2", &self.pool2)] {
            let other = t.dim(0)?;
            if other != b {
                return Err(TrainerError::shape(what, b, other));
            }
        }
        Ok(b)
    }

    /// Stack per-sample triples (no batch dimension) into one batch.
    pub fn stack(samples: &[ConditioningTriple]) -> Result<Self> {
        let h1: Vec<&Tensor> = samples.iter().map(|s| &s.hidden_states1).collect();
        let h2: Vec<&Tensor> = samples.iter().map(|s| &s.hidden_states2).collect();
        let p2: Vec<&Tensor> = samples.iter().map(|s| &s.pool2).collect();
        Ok(Self {
            hidden_states1: Tensor::stack(&h1, 0)?,
            hidden_states2: Tensor::stack(&h2, 0)?,
            pool2: Tensor::stack(&p2, 0)?,
        })
    }

    /// Sample `index` without its batch dimension.
    pub fn sample(&self, index: usize) -> Result<Self> {
        Ok(Self {
            hidden_states1: self.hidden_states1.get(index)?,
            hidden_states2: self.hidden_states2.get(index)?,
            pool2: self.pool2.get(index)?,
        })
    }
}

/// What the assembler needs to know about the run.
#[derive(Debug, Clone)]
pub struct ConditioningSettings {
    pub device: Device,
    pub weight_dtype: DType,
    pub max_token_length: Option<usize>,
    /// Cast live encoder outputs to `weight_dtype` too.
    pub full_fp16: bool,
    /// Recompute cached conditioning live and log how far it drifted.
    pub verify_cached: bool,
}

/// Conditioning for `batch`.
///
/// Precomputed outputs on the batch are moved to the device and cast to the
/// training precision. Otherwise the ids are encoded live with the configured
/// `max_token_length`. Failures propagate as-is.
pub fn get_text_cond(
    settings: &ConditioningSettings,
    batch: &Batch,
    text_encoders: &TextEncoderPair,
) -> Result<ConditioningTriple> {
    let triple = match &batch.text_encoder_outputs {
        None => {
            let input_ids1 = batch.input_ids1.to_device(&settings.device)?;
            let input_ids2 = batch.input_ids2.to_device(&settings.device)?;
            hidden_states_sdxl(
                settings.max_token_length,
                &input_ids1,
                &input_ids2,
                text_encoders.first(),
                text_encoders.second(),
                settings.full_fp16.then_some(settings.weight_dtype),
            )?
        }
        Some(cached) => {
            let triple = cached.to_device(&settings.device)?.to_dtype(settings.weight_dtype)?;
            if settings.verify_cached {
                let report = diagnostics::verify_cached_conditioning(
                    &triple,
                    batch,
                    text_encoders,
                    settings.max_token_length,
                    diagnostics::DEFAULT_TOLERANCE,
                )?;
                if report.within_budget() {
                    debug!("cached text encoder outputs verified: {:?}", report);
                } else {
                    warn!("cached text encoder outputs drifted from live encoders: {:?}", report);
                }
            }
            triple
        }
    };

    let expected = batch.len()?;
    let actual = triple.batch_size()?;
    if actual != expected {
        return Err(TrainerError::shape("conditioning batch", expected, actual));
    }
    Ok(triple)
}
