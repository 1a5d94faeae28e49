//! CLIP text encoders used by SDXL.
//!
//! The weights are kept as a [`WeightMap`] so the token embedding table can be
//! grown for textual inversion and the whole model relocated. The transformer
//! is rebuilt from the map after either change.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use std::collections::HashMap;

use crate::error::{Result, TrainerError};
use crate::models::clip_text::{ClipTextConfig, ClipTextTransformer};
use crate::models::residency::{Placement, Resident};
use crate::models::weight_map::WeightMap;

pub const TOKEN_EMBEDDING_KEY: &str = "text_model.embeddings.token_embedding.weight";
const TEXT_PROJECTION_KEY: &str = "text_projection.weight";

/// Output of one encoder pass over `(batch, 77)` token ids.
pub struct EncoderOutput {
    /// Penultimate-layer hidden states, `(batch, 77, hidden)`.
    pub hidden_states: Tensor,
    /// Projected EOS embedding, `(batch, projection)`. Only encoders with a projection produce it.
    pub pooled: Option<Tensor>,
}

pub trait TextEncoder: Resident {
    fn encode(&self, input_ids: &Tensor) -> Result<EncoderOutput>;

    /// Token embedding table, `(vocab, hidden)`.
    fn input_embeddings(&self) -> Result<Tensor>;

    fn set_input_embeddings(&mut self, table: Tensor) -> Result<()>;

    fn vocab_size(&self) -> Result<usize> {
        Ok(self.input_embeddings()?.dim(0)?)
    }

    /// Grow (or shrink) the embedding table to `vocab_size` rows. New rows are zero.
    fn resize_token_embeddings(&mut self, vocab_size: usize) -> Result<()> {
        let table = self.input_embeddings()?;
        let (rows, hidden) = table.dims2()?;
        let resized = if vocab_size > rows {
            let extra = Tensor::zeros((vocab_size - rows, hidden), table.dtype(), table.device())?;
            Tensor::cat(&[&table, &extra], 0)?
        } else if vocab_size < rows {
            table.narrow(0, 0, vocab_size)?
        } else {
            return Ok(());
        };
        self.set_input_embeddings(resized)
    }
}

pub struct ClipTextEncoder {
    weights: WeightMap,
    config: ClipTextConfig,
    transformer: ClipTextTransformer,
    projection: Option<Linear>,
}

impl ClipTextEncoder {
    pub fn new(weights: WeightMap, config: ClipTextConfig) -> Result<Self> {
        let (transformer, projection) = Self::build(&weights, &config)?;
        Ok(Self {
            weights,
            config,
            transformer,
            projection,
        })
    }

    /// CLIP ViT-L/14, the first SDXL text encoder.
    pub fn clip_l(tensors: HashMap<String, Tensor>, device: Device, dtype: DType) -> Result<Self> {
        let weights = WeightMap::new("text_encoder_1 (CLIP-L)", tensors, device, dtype)?;
        Self::new(weights, ClipTextConfig::clip_l())
    }

    /// OpenCLIP ViT-bigG/14, the second SDXL text encoder.
    pub fn clip_g(tensors: HashMap<String, Tensor>, device: Device, dtype: DType) -> Result<Self> {
        let weights = WeightMap::new("text_encoder_2 (CLIP-G)", tensors, device, dtype)?;
        Self::new(weights, ClipTextConfig::clip_g())
    }

    fn build(weights: &WeightMap, config: &ClipTextConfig) -> Result<(ClipTextTransformer, Option<Linear>)> {
        let table = weights.get(TOKEN_EMBEDDING_KEY).ok_or_else(|| {
            TrainerError::Checkpoint(format!("{} has no {}", weights.name(), TOKEN_EMBEDDING_KEY))
        })?;
        let mut config = config.clone();
        config.vocab_size = table.dim(0)?;

        let placement = weights.placement();
        let vb = VarBuilder::from_tensors(weights.tensors().clone(), placement.dtype, &placement.device);
        let transformer = ClipTextTransformer::new(vb, &config)?;
        let projection = weights
            .get(TEXT_PROJECTION_KEY)
            .map(|w| Linear::new(w.clone(), None));
        Ok((transformer, projection))
    }

    fn rebuild(&mut self) -> Result<()> {
        let (transformer, projection) = Self::build(&self.weights, &self.config)?;
        self.transformer = transformer;
        self.projection = projection;
        Ok(())
    }
}

impl Resident for ClipTextEncoder {
    fn name(&self) -> &str {
        self.weights.name()
    }

    fn placement(&self) -> Placement {
        self.weights.placement()
    }

    fn relocate(&mut self, device: &Device, dtype: Option<DType>) -> Result<()> {
        self.weights.relocate(device, dtype)?;
        self.rebuild()
    }
}

impl TextEncoder for ClipTextEncoder {
    fn encode(&self, input_ids: &Tensor) -> Result<EncoderOutput> {
        let (final_states, penultimate) = self.transformer.forward_hidden(input_ids)?;
        let pooled = match &self.projection {
            Some(projection) => {
                let eos = ClipTextTransformer::pooled_states(&final_states, input_ids, self.config.eos_token_id)?;
                Some(projection.forward(&eos)?)
            }
            None => None,
        };
        Ok(EncoderOutput {
            hidden_states: penultimate,
            pooled,
        })
    }

    fn input_embeddings(&self) -> Result<Tensor> {
        self.weights
            .get(TOKEN_EMBEDDING_KEY)
            .cloned()
            .ok_or_else(|| TrainerError::Checkpoint(format!("{} has no token embedding", self.name())))
    }

    fn set_input_embeddings(&mut self, table: Tensor) -> Result<()> {
        self.weights.insert(TOKEN_EMBEDDING_KEY, table)?;
        self.rebuild()
    }
}

/// The two SDXL text encoders, addressed by index 0 and 1.
pub struct TextEncoderPair {
    encoders: [Box<dyn TextEncoder>; 2],
}

impl TextEncoderPair {
    pub fn new(encoder1: Box<dyn TextEncoder>, encoder2: Box<dyn TextEncoder>) -> Self {
        Self {
            encoders: [encoder1, encoder2],
        }
    }

    pub fn get(&self, index: usize) -> &dyn TextEncoder {
        self.encoders[index].as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> &mut dyn TextEncoder {
        self.encoders[index].as_mut()
    }

    pub fn first(&self) -> &dyn TextEncoder {
        self.get(0)
    }

    pub fn second(&self) -> &dyn TextEncoder {
        self.get(1)
    }

    pub fn relocate_all(&mut self, device: &Device, dtype: Option<DType>) -> Result<()> {
        for encoder in self.encoders.iter_mut() {
            encoder.relocate(device, dtype)?;
        }
        Ok(())
    }

    pub fn placements(&self) -> [Placement; 2] {
        [self.encoders[0].placement(), self.encoders[1].placement()]
    }
}
