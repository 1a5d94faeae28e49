//! Debug check of cached conditioning against the live encoders.
//!
//! Only runs when `verify_cached_text_encoder_outputs` is set. It never fails
//! the step by itself; the caller decides what to log.

use candle_core::{DType, Device, Tensor};

use crate::error::Result;
use crate::models::text_encoder::TextEncoderPair;
use crate::trainers::conditioning::ConditioningTriple;
use crate::trainers::dataset::Batch;
use crate::trainers::text_encoders::hidden_states_sdxl;

pub const DEFAULT_TOLERANCE: f32 = 1e-2;
/// Elements allowed past the tolerance per sample and tensor.
pub const MISMATCHES_PER_SAMPLE: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub batch_size: usize,
    pub tolerance: f32,
    /// Elements outside the tolerance in hidden_states1, hidden_states2, pool2.
    pub mismatches: [usize; 3],
    pub max_abs_diff: f32,
}

impl VerificationReport {
    pub fn within_budget(&self) -> bool {
        let budget = self.batch_size * MISMATCHES_PER_SAMPLE;
        self.mismatches.iter().all(|&m| m <= budget)
    }
}

/// Recompute the conditioning of `batch` on the encoders' current device and
/// compare it with `cached`.
pub fn verify_cached_conditioning(
    cached: &ConditioningTriple,
    batch: &Batch,
    text_encoders: &TextEncoderPair,
    max_token_length: Option<usize>,
    tolerance: f32,
) -> Result<VerificationReport> {
    let device = text_encoders.first().placement().device;
    let live = hidden_states_sdxl(
        max_token_length,
        &batch.input_ids1.to_device(&device)?,
        &batch.input_ids2.to_device(&device)?,
        text_encoders.first(),
        text_encoders.second(),
        None,
    )?;
    compare(cached, &live, tolerance)
}

/// Element-wise comparison of two triples in F32 on the CPU.
pub fn compare(a: &ConditioningTriple, b: &ConditioningTriple, tolerance: f32) -> Result<VerificationReport> {
    let pairs = [
        (&a.hidden_states1, &b.hidden_states1),
        (&a.hidden_states2, &b.hidden_states2),
        (&a.pool2, &b.pool2),
    ];
    let mut mismatches = [0usize; 3];
    let mut max_abs_diff = 0f32;
    for (slot, (x, y)) in pairs.into_iter().enumerate() {
        let diff = (as_cpu_f32(x)? - as_cpu_f32(y)?)?.abs()?.flatten_all()?.to_vec1::<f32>()?;
        mismatches[slot] = diff.iter().filter(|&&d| d > tolerance).count();
        max_abs_diff = diff.iter().copied().fold(max_abs_diff, f32::max);
    }
    Ok(VerificationReport {
        batch_size: a.batch_size()?,
        tolerance,
        mismatches,
        max_abs_diff,
    })
}

fn as_cpu_f32(t: &Tensor) -> Result<Tensor> {
    Ok(t.to_device(&Device::Cpu)?.to_dtype(DType::F32)?)
}
