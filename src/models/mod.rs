//! Model-side types for SDXL network training
//!
//! The base architectures are external; this module holds the seams the
//! training core talks to and the CLIP wrapper it loads weights into.

pub mod clip_text;
pub mod denoiser;
pub mod residency;
pub mod sdxl_time_ids;
pub mod text_encoder;
pub mod weight_map;

pub use clip_text::{ClipTextConfig, ClipTextTransformer};
pub use denoiser::Denoiser;
pub use residency::{ModelRole, Placement, ResidencyLedger, Resident};
pub use sdxl_time_ids::{size_embeddings, TimeIds, SIZE_EMBEDDING_DIM};
pub use text_encoder::{ClipTextEncoder, EncoderOutput, TextEncoder, TextEncoderPair};
pub use weight_map::WeightMap;
