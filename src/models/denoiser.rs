use candle_core::Tensor;

use crate::error::Result;

/// SDXL denoising network as seen by the training core.
///
/// `text_embedding` is `(batch, tokens, 2048)`, `vector_embedding` is
/// `(batch, 1280 + 1536)`.
pub trait Denoiser {
    fn forward(
        &self,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
        text_embedding: &Tensor,
        vector_embedding: &Tensor,
    ) -> Result<Tensor>;
}
