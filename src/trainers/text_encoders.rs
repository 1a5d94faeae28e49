//! Running both SDXL text encoders over chunked token ids.

use candle_core::{DType, Tensor};

use crate::error::{Result, TrainerError};
use crate::loaders::tokenizer::{chunk_count, MODEL_MAX_LENGTH};
use crate::models::text_encoder::TextEncoder;
use crate::trainers::conditioning::ConditioningTriple;

/// Encode `(batch, chunks, 77)` ids with both encoders.
///
/// Every 77-token window is encoded separately. Windows are merged as
/// `[BOS] body_1 ... body_n [EOS]`, so `chunks` windows yield
/// `chunks * 75 + 2` positions (77 for a single window). The pooled vector
/// comes from the first window of each sample. When `dtype` is set the outputs
/// are cast to it.
pub fn hidden_states_sdxl(
    max_token_length: Option<usize>,
    input_ids1: &Tensor,
    input_ids2: &Tensor,
    text_encoder1: &dyn TextEncoder,
    text_encoder2: &dyn TextEncoder,
    dtype: Option<DType>,
) -> Result<ConditioningTriple> {
    let chunks = chunk_count(max_token_length);
    let expected = |ids: &Tensor, what: &str| -> Result<usize> {
        let (b, n, len) = ids.dims3()?;
        if n != chunks || len != MODEL_MAX_LENGTH {
            return Err(TrainerError::shape(what, (b, chunks, MODEL_MAX_LENGTH), (b, n, len)));
        }
        Ok(b)
    };
    let b1 = expected(input_ids1, "input_ids1")?;
    let b2 = expected(input_ids2, "input_ids2")?;
    if b1 != b2 {
        return Err(TrainerError::shape("input_ids2 batch", b1, b2));
    }

    let flat1 = input_ids1.reshape((b1 * chunks, MODEL_MAX_LENGTH))?;
    let flat2 = input_ids2.reshape((b2 * chunks, MODEL_MAX_LENGTH))?;

    let out1 = text_encoder1.encode(&flat1)?;
    let out2 = text_encoder2.encode(&flat2)?;
    let pooled = out2
        .pooled
        .ok_or_else(|| TrainerError::Checkpoint(format!("{} has no text projection", text_encoder2.name())))?;

    let hidden_states1 = merge_chunks(&out1.hidden_states, b1, chunks)?;
    let hidden_states2 = merge_chunks(&out2.hidden_states, b1, chunks)?;
    let (_, pooled_dim) = pooled.dims2()?;
    let pool2 = pooled.reshape((b1, chunks, pooled_dim))?.narrow(1, 0, 1)?.squeeze(1)?;

    let triple = ConditioningTriple {
        hidden_states1,
        hidden_states2,
        pool2,
    };
    match dtype {
        Some(dtype) => triple.to_dtype(dtype),
        None => Ok(triple),
    }
}

fn merge_chunks(hidden: &Tensor, batch: usize, chunks: usize) -> Result<Tensor> {
    let (_, seq, dim) = hidden.dims3()?;
    let hidden = hidden.reshape((batch, chunks * seq, dim))?;
    if chunks == 1 {
        return Ok(hidden);
    }
    let mut parts = Vec::with_capacity(chunks + 2);
    parts.push(hidden.narrow(1, 0, 1)?);
    for chunk in 0..chunks {
        parts.push(hidden.narrow(1, chunk * seq + 1, seq - 2)?);
    }
    parts.push(hidden.narrow(1, chunks * seq - 1, 1)?);
    Ok(Tensor::cat(&parts, 1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEncoder;
    use candle_core::Device;

    fn ids(b: usize, chunks: usize) -> Result<Tensor> {
        let flat: Vec<u32> = (0..b * chunks * MODEL_MAX_LENGTH).map(|v| (v % 50) as u32).collect();
        Ok(Tensor::from_vec(flat, (b, chunks, MODEL_MAX_LENGTH), &Device::Cpu)?)
    }

    #[test]
    fn single_window_keeps_77_positions() -> Result<()> {
        let te1 = FakeEncoder::new("te1", 100, 8, None);
        let te2 = FakeEncoder::new("te2", 100, 12, Some(6));
        let triple = hidden_states_sdxl(None, &ids(2, 1)?, &ids(2, 1)?, &te1, &te2, None)?;
        assert_eq!(triple.hidden_states1.dims(), &[2, 77, 8]);
        assert_eq!(triple.hidden_states2.dims(), &[2, 77, 12]);
        assert_eq!(triple.pool2.dims(), &[2, 6]);
        Ok(())
    }

    #[test]
    fn three_windows_merge_to_227_positions() -> Result<()> {
        let te1 = FakeEncoder::new("te1", 100, 4, None);
        let te2 = FakeEncoder::new("te2", 100, 4, Some(3));
        let triple = hidden_states_sdxl(Some(225), &ids(1, 3)?, &ids(1, 3)?, &te1, &te2, Some(DType::F16))?;
        assert_eq!(triple.hidden_states1.dims(), &[1, 227, 4]);
        assert_eq!(triple.pool2.dims(), &[1, 3]);
        assert_eq!(triple.hidden_states1.dtype(), DType::F16);
        // one encoder pass per call, all windows batched together
        assert_eq!(te1.calls.get(), 1);
        Ok(())
    }

    #[test]
    fn window_count_must_match_max_token_length() -> Result<()> {
        let te1 = FakeEncoder::new("te1", 100, 4, None);
        let te2 = FakeEncoder::new("te2", 100, 4, Some(3));
        let result = hidden_states_sdxl(Some(150), &ids(1, 1)?, &ids(1, 1)?, &te1, &te2, None);
        assert!(matches!(result, Err(TrainerError::ShapeMismatch { .. })));
        Ok(())
    }

    #[test]
    fn second_encoder_must_pool() -> Result<()> {
        let te1 = FakeEncoder::new("te1", 100, 4, None);
        let te2 = FakeEncoder::new("te2", 100, 4, None);
        assert!(hidden_states_sdxl(None, &ids(1, 1)?, &ids(1, 1)?, &te1, &te2, None).is_err());
        Ok(())
    }
}
