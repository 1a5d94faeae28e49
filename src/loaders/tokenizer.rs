//! CLIP tokenizers and the chunked token-id layout SDXL training uses.

use candle_core::{Device, Tensor};
use log::info;
use std::path::Path;
use tokenizers::{AddedToken, Tokenizer};

use crate::error::{Result, TrainerError};

/// Tokens per encoder window, including BOS and EOS.
pub const MODEL_MAX_LENGTH: usize = 77;
/// Caption tokens per window.
pub const CHUNK_BODY: usize = MODEL_MAX_LENGTH - 2;

const BOS_TOKEN: &str = "<|startoftext|>";
const EOS_TOKEN: &str = "<|endoftext|>";

/// A vocabulary that textual inversion can extend.
pub trait Vocabulary {
    /// Register `tokens`, returning how many were new.
    fn add_tokens(&mut self, tokens: &[String]) -> usize;

    fn token_id(&self, token: &str) -> Option<u32>;

    /// Number of ids, including added tokens.
    fn vocab_len(&self) -> usize;
}

pub trait TextTokenizer: Vocabulary {
    /// Ids of `text` without BOS/EOS.
    fn encode_plain(&self, text: &str) -> Result<Vec<u32>>;

    fn bos_id(&self) -> u32;

    fn eos_id(&self) -> u32;

    fn pad_id(&self) -> u32;
}

pub struct ClipTokenizer {
    inner: Tokenizer,
    bos: u32,
    eos: u32,
    pad: u32,
}

impl ClipTokenizer {
    /// `pad_with` names the padding token; `None` pads with EOS.
    pub fn new(inner: Tokenizer, pad_with: Option<&str>) -> Result<Self> {
        let lookup = |token: &str| {
            inner
                .token_to_id(token)
                .ok_or_else(|| TrainerError::Tokenizer(format!("vocabulary has no `{}`", token)))
        };
        let bos = lookup(BOS_TOKEN)?;
        let eos = lookup(EOS_TOKEN)?;
        let pad = match pad_with {
            Some(token) => lookup(token)?,
            None => eos,
        };
        Ok(Self { inner, bos, eos, pad })
    }

    pub fn from_file(path: &Path, pad_with: Option<&str>) -> Result<Self> {
        info!("Loading tokenizer from: {}", path.display());
        let inner = Tokenizer::from_file(path)?;
        Self::new(inner, pad_with)
    }
}

impl Vocabulary for ClipTokenizer {
    fn add_tokens(&mut self, tokens: &[String]) -> usize {
        // the tokenizers crate counts words already in the base vocabulary as added
        let added: Vec<AddedToken> = tokens
            .iter()
            .filter(|t| self.inner.token_to_id(t.as_str()).is_none())
            .map(|t| AddedToken::from(t.clone(), false))
            .collect();
        if added.is_empty() {
            return 0;
        }
        self.inner.add_tokens(&added)
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    fn vocab_len(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TextTokenizer for ClipTokenizer {
    fn encode_plain(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, false)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn bos_id(&self) -> u32 {
        self.bos
    }

    fn eos_id(&self) -> u32 {
        self.eos
    }

    fn pad_id(&self) -> u32 {
        self.pad
    }
}

/// The tokenizers of both SDXL text encoders.
pub struct TokenizerPair {
    tokenizers: [Box<dyn TextTokenizer>; 2],
}

impl TokenizerPair {
    pub fn new(first: Box<dyn TextTokenizer>, second: Box<dyn TextTokenizer>) -> Self {
        Self {
            tokenizers: [first, second],
        }
    }

    pub fn get(&self, index: usize) -> &dyn TextTokenizer {
        self.tokenizers[index].as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> &mut dyn TextTokenizer {
        self.tokenizers[index].as_mut()
    }
}

/// Number of 77-token windows for a configured `max_token_length`.
pub fn chunk_count(max_token_length: Option<usize>) -> usize {
    max_token_length.map(|m| (m / CHUNK_BODY).max(1)).unwrap_or(1)
}

/// Token ids of one caption as `chunks * 77` values.
///
/// The caption is truncated to `chunks * 75` tokens. Each window is
/// `[BOS] body [EOS] pad...`; windows past the end of the caption hold only
/// `[BOS] [EOS] pad...`.
pub fn chunked_ids(tokenizer: &dyn TextTokenizer, caption: &str, max_token_length: Option<usize>) -> Result<Vec<u32>> {
    let chunks = chunk_count(max_token_length);
    let mut ids = tokenizer.encode_plain(caption)?;
    ids.truncate(chunks * CHUNK_BODY);

    let mut out = Vec::with_capacity(chunks * MODEL_MAX_LENGTH);
    for chunk in 0..chunks {
        let start = (chunk * CHUNK_BODY).min(ids.len());
        let end = ((chunk + 1) * CHUNK_BODY).min(ids.len());
        out.push(tokenizer.bos_id());
        out.extend_from_slice(&ids[start..end]);
        out.push(tokenizer.eos_id());
        out.resize((chunk + 1) * MODEL_MAX_LENGTH, tokenizer.pad_id());
    }
    Ok(out)
}

/// `(captions, chunks, 77)` u32 ids for a batch of captions.
pub fn batch_input_ids(
    tokenizer: &dyn TextTokenizer,
    captions: &[String],
    max_token_length: Option<usize>,
    device: &Device,
) -> Result<Tensor> {
    let chunks = chunk_count(max_token_length);
    let mut flat = Vec::with_capacity(captions.len() * chunks * MODEL_MAX_LENGTH);
    for caption in captions {
        flat.extend(chunked_ids(tokenizer, caption, max_token_length)?);
    }
    Ok(Tensor::from_vec(flat, (captions.len(), chunks, MODEL_MAX_LENGTH), device)?)
}
