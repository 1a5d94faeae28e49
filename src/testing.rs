//! In-memory stand-ins for tokenizers, encoders and the denoiser.

use candle_core::{DType, Device, Tensor};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tokenizers::Tokenizer;

use crate::error::{Result, TrainerError};
use crate::loaders::tokenizer::{ClipTokenizer, TextTokenizer, Vocabulary};
use crate::models::denoiser::Denoiser;
use crate::models::residency::{Placement, Resident};
use crate::models::text_encoder::{EncoderOutput, TextEncoder};

/// Whitespace tokenizer. Added tokens get ids `base + n * stride`.
pub struct FakeTokenizer {
    base: usize,
    stride: u32,
    added: Vec<(String, u32)>,
}

impl FakeTokenizer {
    pub fn new(base: usize) -> Self {
        Self {
            base,
            stride: 1,
            added: Vec::new(),
        }
    }

    /// Assigns ids with gaps, like a tokenizer that reserves slots.
    pub fn with_gaps(base: usize) -> Self {
        Self {
            base,
            stride: 2,
            added: Vec::new(),
        }
    }
}

impl Vocabulary for FakeTokenizer {
    fn add_tokens(&mut self, tokens: &[String]) -> usize {
        let mut count = 0;
        for token in tokens {
            if self.token_id(token).is_none() {
                let id = self.base as u32 + self.added.len() as u32 * self.stride;
                self.added.push((token.clone(), id));
                count += 1;
            }
        }
        count
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.added.iter().find(|(t, _)| t == token).map(|(_, id)| *id)
    }

    fn vocab_len(&self) -> usize {
        self.base + self.added.len()
    }
}

impl TextTokenizer for FakeTokenizer {
    fn encode_plain(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .split_whitespace()
            .map(|word| {
                self.token_id(word).unwrap_or_else(|| {
                    let h = word.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
                    1 + h % (self.base as u32 - 3)
                })
            })
            .collect())
    }

    fn bos_id(&self) -> u32 {
        self.base as u32 - 2
    }

    fn eos_id(&self) -> u32 {
        self.base as u32 - 1
    }

    fn pad_id(&self) -> u32 {
        0
    }
}

/// Word-level vocabulary with CLIP's BOS/EOS as added special tokens.
const CLIP_STYLE_TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [
    {"id": 4, "content": "<|startoftext|>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 5, "content": "<|endoftext|>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
  ],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {"!": 0, "a": 1, "cat": 2, "photo": 3, "<|startoftext|>": 4, "<|endoftext|>": 5},
    "unk_token": "!"
  }
}"#;

/// A real `ClipTokenizer` over a six-entry vocabulary: `! a cat photo BOS EOS`.
pub fn clip_tokenizer(pad_with: Option<&str>) -> ClipTokenizer {
    let inner = Tokenizer::from_bytes(CLIP_STYLE_TOKENIZER_JSON.as_bytes()).expect("tokenizer json");
    ClipTokenizer::new(inner, pad_with).expect("clip special tokens")
}

/// Records every relocation.
pub struct FakeResident {
    name: String,
    placement: Placement,
    pub moves: Vec<Placement>,
}

impl FakeResident {
    pub fn new(name: &str, device: Device, dtype: DType) -> Self {
        Self {
            name: name.to_string(),
            placement: Placement::new(device, dtype),
            moves: Vec::new(),
        }
    }
}

impl Resident for FakeResident {
    fn name(&self) -> &str {
        &self.name
    }

    fn placement(&self) -> Placement {
        self.placement.clone()
    }

    fn relocate(&mut self, device: &Device, dtype: Option<DType>) -> Result<()> {
        let dtype = dtype.unwrap_or(self.placement.dtype);
        self.placement = Placement::new(device.clone(), dtype);
        self.moves.push(self.placement.clone());
        Ok(())
    }
}

/// Encoder whose hidden states are a scaled copy of the token ids.
pub struct FakeEncoder {
    inner: FakeResident,
    table: Tensor,
    hidden: usize,
    pooled_dim: Option<usize>,
    /// Shared so a test can keep counting after the encoder is moved away.
    pub calls: Rc<Cell<usize>>,
    fail_on_call: Option<usize>,
}

impl FakeEncoder {
    pub fn new(name: &str, vocab: usize, hidden: usize, pooled_dim: Option<usize>) -> Self {
        let values: Vec<f32> = (0..vocab * hidden).map(|v| v as f32).collect();
        let table = Tensor::from_vec(values, (vocab, hidden), &Device::Cpu).expect("table");
        Self {
            inner: FakeResident::new(name, Device::Cpu, DType::F32),
            table,
            hidden,
            pooled_dim,
            calls: Rc::new(Cell::new(0)),
            fail_on_call: None,
        }
    }

    /// Fail the `n`-th encode call (1-based).
    pub fn failing_on(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    pub fn moves(&self) -> &[Placement] {
        &self.inner.moves
    }
}

impl Resident for FakeEncoder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn placement(&self) -> Placement {
        self.inner.placement()
    }

    fn relocate(&mut self, device: &Device, dtype: Option<DType>) -> Result<()> {
        self.inner.relocate(device, dtype)
    }
}

impl TextEncoder for FakeEncoder {
    fn encode(&self, input_ids: &Tensor) -> Result<EncoderOutput> {
        let n = self.calls.get() + 1;
        self.calls.set(n);
        if self.fail_on_call == Some(n) {
            return Err(TrainerError::Compute(candle_core::Error::Msg("device lost".into())));
        }
        let (b, seq) = input_ids.dims2()?;
        let dtype = self.placement().dtype;
        let ids = (input_ids.to_dtype(DType::F32)? * 0.01)?;
        let hidden_states = ids
            .unsqueeze(2)?
            .broadcast_as((b, seq, self.hidden))?
            .contiguous()?
            .to_dtype(dtype)?;
        let pooled = match self.pooled_dim {
            Some(dim) => Some(
                ids.mean_keepdim(1)?
                    .broadcast_as((b, dim))?
                    .contiguous()?
                    .to_dtype(dtype)?,
            ),
            None => None,
        };
        Ok(EncoderOutput { hidden_states, pooled })
    }

    fn input_embeddings(&self) -> Result<Tensor> {
        Ok(self.table.clone())
    }

    fn set_input_embeddings(&mut self, table: Tensor) -> Result<()> {
        self.table = table;
        Ok(())
    }
}

/// Denoiser that records its inputs and returns a fixed tensor.
pub struct RecordingDenoiser {
    pub output: Tensor,
    pub seen: RefCell<HashMap<&'static str, Tensor>>,
}

impl RecordingDenoiser {
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            seen: RefCell::new(HashMap::new()),
        }
    }

    pub fn input(&self, name: &'static str) -> Tensor {
        self.seen.borrow().get(name).cloned().expect("denoiser was called")
    }
}

impl Denoiser for RecordingDenoiser {
    fn forward(
        &self,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
        text_embedding: &Tensor,
        vector_embedding: &Tensor,
    ) -> Result<Tensor> {
        let mut seen = self.seen.borrow_mut();
        seen.insert("latents", noisy_latents.clone());
        seen.insert("timesteps", timesteps.clone());
        seen.insert("text", text_embedding.clone());
        seen.insert("vector", vector_embedding.clone());
        Ok(self.output.clone())
    }
}
