//! SDXL micro-conditioning: original size, crop top-left and target size.
//!
//! Each of the six values per sample is embedded with the same sinusoidal
//! scheme the UNet uses for timesteps, giving `6 * SIZE_EMBEDDING_DIM` features
//! that are appended to the pooled text embedding.

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, TrainerError};

/// Width of the sinusoidal embedding for one scalar.
pub const SIZE_EMBEDDING_DIM: usize = 256;
/// Scalars per sample: orig h/w, crop top/left, target h/w.
pub const TIME_IDS_PER_SAMPLE: usize = 6;
const MAX_PERIOD: f64 = 10000.0;

/// Geometry of one training sample, all as `(height, width)` / `(top, left)` pairs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeIds {
    pub original_size: (u32, u32),
    pub crop_top_left: (u32, u32),
    pub target_size: (u32, u32),
}

impl TimeIds {
    /// No crop, original equals target.
    pub fn uncropped(height: u32, width: u32) -> Self {
        Self {
            original_size: (height, width),
            crop_top_left: (0, 0),
            target_size: (height, width),
        }
    }

    /// Resize `original` to cover `target`, then centre crop.
    pub fn center_crop(original: (u32, u32), target: (u32, u32)) -> Self {
        let (oh, ow) = (original.0.max(1) as f64, original.1.max(1) as f64);
        let scale = (target.0 as f64 / oh).max(target.1 as f64 / ow);
        let resized_h = (oh * scale).round() as u32;
        let resized_w = (ow * scale).round() as u32;
        Self {
            original_size: original,
            crop_top_left: (
                resized_h.saturating_sub(target.0) / 2,
                resized_w.saturating_sub(target.1) / 2,
            ),
            target_size: target,
        }
    }

    fn values(&self) -> [f32; TIME_IDS_PER_SAMPLE] {
        [
            self.original_size.0 as f32,
            self.original_size.1 as f32,
            self.crop_top_left.0 as f32,
            self.crop_top_left.1 as f32,
            self.target_size.0 as f32,
            self.target_size.1 as f32,
        ]
    }
}

/// Stack the raw time ids of a batch into `(batch, 6)` F32.
pub fn time_ids_tensor(batch: &[TimeIds], device: &Device) -> Result<Tensor> {
    if batch.is_empty() {
        return Err(TrainerError::shape("time ids", "at least one sample", 0));
    }
    let flat: Vec<f32> = batch.iter().flat_map(|t| t.values()).collect();
    Ok(Tensor::from_vec(flat, (batch.len(), TIME_IDS_PER_SAMPLE), device)?)
}

/// Sinusoidal embedding of a flat vector of scalars: `(n,) -> (n, dim)`, `[cos | sin]`.
pub fn timestep_embedding(values: &Tensor, dim: usize) -> Result<Tensor> {
    let half = dim / 2;
    let device = values.device();
    let exponent = (Tensor::arange(0u32, half as u32, device)?.to_dtype(DType::F32)?
        * (-MAX_PERIOD.ln() / half as f64))?;
    let freqs = exponent.exp()?.unsqueeze(0)?;
    let args = values.to_dtype(DType::F32)?.unsqueeze(1)?.broadcast_mul(&freqs)?;
    let mut embedding = Tensor::cat(&[args.cos()?, args.sin()?], 1)?;
    if dim % 2 == 1 {
        let pad = Tensor::zeros((embedding.dim(0)?, 1), DType::F32, device)?;
        embedding = Tensor::cat(&[&embedding, &pad], 1)?;
    }
    Ok(embedding)
}

/// Size/crop conditioning for a batch, `(batch, 6 * SIZE_EMBEDDING_DIM)` F32.
pub fn size_embeddings(batch: &[TimeIds], device: &Device) -> Result<Tensor> {
    let ids = time_ids_tensor(batch, device)?;
    let b = ids.dim(0)?;
    let embedded = timestep_embedding(&ids.flatten_all()?, SIZE_EMBEDDING_DIM)?;
    Ok(embedded.reshape((b, TIME_IDS_PER_SAMPLE * SIZE_EMBEDDING_DIM))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_ids_layout() -> Result<()> {
        let device = Device::Cpu;
        let ids = time_ids_tensor(&[TimeIds::uncropped(1024, 1024)], &device)?;
        assert_eq!(ids.dims(), &[1, 6]);
        assert_eq!(ids.to_vec2::<f32>()?[0], vec![1024.0, 1024.0, 0.0, 0.0, 1024.0, 1024.0]);
        Ok(())
    }

    #[test]
    fn test_center_crop() {
        let t = TimeIds::center_crop((1536, 2048), (1024, 1024));
        // scale 2/3 -> 1024 x 1365, crop left (1365 - 1024) / 2
        assert_eq!(t.crop_top_left, (0, 170));
        assert_eq!(t.original_size, (1536, 2048));
    }

    #[test]
    fn test_embedding_of_zero_is_cos_one_sin_zero() -> Result<()> {
        let device = Device::Cpu;
        let emb = timestep_embedding(&Tensor::new(&[0f32], &device)?, 8)?;
        assert_eq!(emb.to_vec2::<f32>()?[0], vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_size_embedding_width() -> Result<()> {
        let device = Device::Cpu;
        let batch = [TimeIds::uncropped(512, 512), TimeIds::uncropped(512, 512)];
        let emb = size_embeddings(&batch, &device)?;
        assert_eq!(emb.dims(), &[2, 1536]);
        Ok(())
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert!(size_embeddings(&[], &Device::Cpu).is_err());
    }
}
