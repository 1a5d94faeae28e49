//! Denoiser invocation with SDXL conditioning.

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, TrainerError};
use crate::models::denoiser::Denoiser;
use crate::models::sdxl_time_ids::{size_embeddings, TimeIds};
use crate::trainers::conditioning::ConditioningTriple;

/// Predict noise for `noisy_latents` at `timesteps`.
///
/// The UNet vector input is `[pool2 | size embedding]` and the cross-attention
/// context is both hidden states concatenated on the feature axis. The
/// denoiser output is returned as-is.
pub fn call_unet(
    unet: &dyn Denoiser,
    noisy_latents: &Tensor,
    timesteps: &Tensor,
    text_conds: ConditioningTriple,
    time_ids: &[TimeIds],
    device: &Device,
    weight_dtype: DType,
) -> Result<Tensor> {
    let batch = text_conds.batch_size()?;
    if time_ids.len() != batch {
        return Err(TrainerError::shape("time ids", batch, time_ids.len()));
    }

    let embs = size_embeddings(time_ids, device)?.to_dtype(weight_dtype)?;

    let ConditioningTriple {
        hidden_states1,
        hidden_states2,
        pool2,
    } = text_conds;
    let vector_embedding = Tensor::cat(&[&pool2.to_dtype(weight_dtype)?, &embs], 1)?;
    let text_embedding = Tensor::cat(&[&hidden_states1, &hidden_states2], 2)?.to_dtype(weight_dtype)?;

    // latents normally arrive in weight_dtype already
    let noisy_latents = noisy_latents.to_dtype(weight_dtype)?;
    unet.forward(&noisy_latents, timesteps, &text_embedding, &vector_embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sdxl_time_ids::{SIZE_EMBEDDING_DIM, TIME_IDS_PER_SAMPLE};
    use crate::testing::RecordingDenoiser;

    fn triple(b: usize) -> Result<ConditioningTriple> {
        let dev = Device::Cpu;
        Ok(ConditioningTriple {
            hidden_states1: Tensor::ones((b, 77, 8), DType::F32, &dev)?,
            hidden_states2: Tensor::ones((b, 77, 12), DType::F32, &dev)?,
            pool2: Tensor::ones((b, 12), DType::F32, &dev)?,
        })
    }

    #[test]
    fn assembles_vector_and_context() -> Result<()> {
        let dev = Device::Cpu;
        let latents = Tensor::arange(0f32, 2. * 4. * 8. * 8., &dev)?.reshape((2, 4, 8, 8))?;
        let timesteps = Tensor::new(&[10u32, 900], &dev)?;
        let output = Tensor::full(0.5f32, (2, 4, 8, 8), &dev)?;
        let unet = RecordingDenoiser::new(output.clone());
        let time_ids = vec![TimeIds::uncropped(512, 512); 2];

        let pred = call_unet(&unet, &latents, &timesteps, triple(2)?, &time_ids, &dev, DType::F32)?;

        assert_eq!(pred.flatten_all()?.to_vec1::<f32>()?, output.flatten_all()?.to_vec1::<f32>()?);
        assert_eq!(unet.input("vector").dims(), &[2, 12 + SIZE_EMBEDDING_DIM * TIME_IDS_PER_SAMPLE]);
        assert_eq!(unet.input("text").dims(), &[2, 77, 20]);
        assert_eq!(
            unet.input("latents").flatten_all()?.to_vec1::<f32>()?,
            latents.flatten_all()?.to_vec1::<f32>()?
        );
        assert_eq!(unet.input("timesteps").to_vec1::<u32>()?, vec![10, 900]);
        Ok(())
    }

    #[test]
    fn inputs_are_cast_to_training_precision() -> Result<()> {
        let dev = Device::Cpu;
        let latents = Tensor::zeros((1, 4, 8, 8), DType::F32, &dev)?;
        let timesteps = Tensor::new(&[1u32], &dev)?;
        let unet = RecordingDenoiser::new(Tensor::zeros((1, 4, 8, 8), DType::F16, &dev)?);

        call_unet(&unet, &latents, &timesteps, triple(1)?, &[TimeIds::uncropped(512, 512)], &dev, DType::F16)?;

        assert_eq!(unet.input("latents").dtype(), DType::F16);
        assert_eq!(unet.input("vector").dtype(), DType::F16);
        assert_eq!(unet.input("text").dtype(), DType::F16);
        Ok(())
    }

    #[test]
    fn time_ids_must_cover_batch() -> Result<()> {
        let dev = Device::Cpu;
        let unet = RecordingDenoiser::new(Tensor::zeros(1, DType::F32, &dev)?);
        let latents = Tensor::zeros((2, 4, 8, 8), DType::F32, &dev)?;
        let timesteps = Tensor::new(&[1u32, 2], &dev)?;
        let result = call_unet(&unet, &latents, &timesteps, triple(2)?, &[TimeIds::uncropped(512, 512)], &dev, DType::F32);
        assert!(matches!(result, Err(TrainerError::ShapeMismatch { .. })));
        Ok(())
    }
}
