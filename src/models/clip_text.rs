//! CLIP text transformer with a configurable vocabulary size.
//!
//! Weight names follow the diffusers/transformers layout
//! (`text_model.embeddings.*`, `text_model.encoder.layers.N.*`,
//! `text_model.final_layer_norm.*`).

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};

pub const CLIP_EOS_TOKEN_ID: u32 = 49407;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// `x * sigmoid(1.702 x)`, used by OpenAI CLIP.
    QuickGelu,
    /// Exact erf GELU, used by OpenCLIP.
    Gelu,
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::QuickGelu => xs * candle_nn::ops::sigmoid(&(xs * 1.702f64)?)?,
            Activation::Gelu => xs.gelu_erf(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClipTextConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub activation: Activation,
    /// Pooling reads the final state at the first EOS.
    pub eos_token_id: u32,
}

impl ClipTextConfig {
    /// CLIP ViT-L/14
    pub fn clip_l() -> Self {
        Self {
            vocab_size: 49408,
            embed_dim: 768,
            intermediate_size: 3072,
            max_position_embeddings: 77,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            activation: Activation::QuickGelu,
            eos_token_id: CLIP_EOS_TOKEN_ID,
        }
    }

    /// OpenCLIP ViT-bigG/14
    pub fn clip_g() -> Self {
        Self {
            vocab_size: 49408,
            embed_dim: 1280,
            intermediate_size: 5120,
            max_position_embeddings: 77,
            num_hidden_layers: 32,
            num_attention_heads: 20,
            activation: Activation::Gelu,
            eos_token_id: CLIP_EOS_TOKEN_ID,
        }
    }
}

struct ClipAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl ClipAttention {
    fn new(vb: VarBuilder, c: &ClipTextConfig) -> Result<Self> {
        let head_dim = c.embed_dim / c.num_attention_heads;
        Ok(Self {
            q_proj: linear(c.embed_dim, c.embed_dim, vb.pp("q_proj"))?,
            k_proj: linear(c.embed_dim, c.embed_dim, vb.pp("k_proj"))?,
            v_proj: linear(c.embed_dim, c.embed_dim, vb.pp("v_proj"))?,
            out_proj: linear(c.embed_dim, c.embed_dim, vb.pp("out_proj"))?,
            num_heads: c.num_attention_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn heads(&self, xs: &Tensor, b: usize, seq: usize) -> Result<Tensor> {
        xs.reshape((b, seq, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Result<Tensor> {
        let (b, seq, embed_dim) = xs.dims3()?;
        let q = self.heads(&(self.q_proj.forward(xs)? * self.scale)?, b, seq)?;
        let k = self.heads(&self.k_proj.forward(xs)?, b, seq)?;
        let v = self.heads(&self.v_proj.forward(xs)?, b, seq)?;

        let attn = q.matmul(&k.t()?)?.broadcast_add(causal_mask)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, seq, embed_dim))?;
        self.out_proj.forward(&out)
    }
}

struct ClipEncoderLayer {
    layer_norm1: LayerNorm,
    self_attn: ClipAttention,
    layer_norm2: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl ClipEncoderLayer {
    fn new(vb: VarBuilder, c: &ClipTextConfig) -> Result<Self> {
        Ok(Self {
            layer_norm1: layer_norm(c.embed_dim, 1e-5, vb.pp("layer_norm1"))?,
            self_attn: ClipAttention::new(vb.pp("self_attn"), c)?,
            layer_norm2: layer_norm(c.embed_dim, 1e-5, vb.pp("layer_norm2"))?,
            fc1: linear(c.embed_dim, c.intermediate_size, vb.pp("mlp.fc1"))?,
            fc2: linear(c.intermediate_size, c.embed_dim, vb.pp("mlp.fc2"))?,
            activation: c.activation,
        })
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = self.self_attn.forward(&self.layer_norm1.forward(xs)?, causal_mask)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let hidden = self.fc1.forward(&self.layer_norm2.forward(&xs)?)?;
        let hidden = self.fc2.forward(&self.activation.forward(&hidden)?)?;
        hidden + residual
    }
}

pub struct ClipTextTransformer {
    token_embedding: Embedding,
    position_embedding: Embedding,
    layers: Vec<ClipEncoderLayer>,
    final_layer_norm: LayerNorm,
}

impl ClipTextTransformer {
    pub fn new(vb: VarBuilder, c: &ClipTextConfig) -> Result<Self> {
        let vb = vb.pp("text_model");
        let token_embedding = embedding(c.vocab_size, c.embed_dim, vb.pp("embeddings.token_embedding"))?;
        let position_embedding = embedding(
            c.max_position_embeddings,
            c.embed_dim,
            vb.pp("embeddings.position_embedding"),
        )?;
        let layers = (0..c.num_hidden_layers)
            .map(|i| ClipEncoderLayer::new(vb.pp(format!("encoder.layers.{}", i)), c))
            .collect::<Result<Vec<_>>>()?;
        let final_layer_norm = layer_norm(c.embed_dim, 1e-5, vb.pp("final_layer_norm"))?;
        Ok(Self {
            token_embedding,
            position_embedding,
            layers,
            final_layer_norm,
        })
    }

    fn causal_mask(seq: usize, dtype: DType, device: &Device) -> Result<Tensor> {
        let mask: Vec<f32> = (0..seq)
            .flat_map(|i| (0..seq).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        Tensor::from_vec(mask, (seq, seq), device)?.to_dtype(dtype)
    }

    /// Final-layer-normed output and the un-normed output of the second to
    /// last layer, both `(batch, seq, embed_dim)`.
    pub fn forward_hidden(&self, input_ids: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, seq) = input_ids.dims2()?;
        let positions = Tensor::arange(0u32, seq as u32, input_ids.device())?.unsqueeze(0)?;
        let mut xs = self
            .token_embedding
            .forward(input_ids)?
            .broadcast_add(&self.position_embedding.forward(&positions)?)?;
        let mask = Self::causal_mask(seq, xs.dtype(), xs.device())?;

        let penultimate_index = self.layers.len().saturating_sub(2);
        let mut penultimate = None;
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs, &mask)?;
            if i == penultimate_index {
                penultimate = Some(xs.clone());
            }
        }
        let penultimate = match penultimate {
            Some(p) => p,
            None => xs.clone(),
        };
        Ok((self.final_layer_norm.forward(&xs)?, penultimate))
    }

    /// Final hidden state at each row's first `eos_token_id`, or at its
    /// highest id when the row has no EOS.
    pub fn pooled_states(final_states: &Tensor, input_ids: &Tensor, eos_token_id: u32) -> Result<Tensor> {
        let ids = input_ids.to_vec2::<u32>()?;
        let rows = ids
            .iter()
            .enumerate()
            .map(|(row, ids)| {
                let pos = ids.iter().position(|&id| id == eos_token_id).unwrap_or_else(|| {
                    ids.iter()
                        .enumerate()
                        .max_by_key(|(_, id)| **id)
                        .map(|(i, _)| i)
                        .unwrap_or(0)
                });
                final_states.get(row)?.get(pos)
            })
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&rows, 0)
    }
}
