//! Textual-inversion embeddings for both SDXL text encoders.
//!
//! Each embedding file adds `k` tokens (`label`, `label1`, ..., `label{k-1}`)
//! to both tokenizers and writes its vectors into the matching rows of each
//! encoder's token embedding table.

use candle_core::{Device, Tensor};
use log::info;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::error::{Result, TrainerError};
use crate::loaders::tokenizer::{TextTokenizer, TokenizerPair, Vocabulary};
use crate::models::text_encoder::TextEncoderPair;

/// Tensor names for the first and second text encoder.
pub const EMBEDDING_KEYS: [&str; 2] = ["clip_l", "clip_g"];

/// Tokens and vectors added from one embedding file.
#[derive(Debug, Clone)]
pub struct VocabularyExtension {
    pub source: PathBuf,
    pub label: String,
    pub token_strings: Vec<String>,
    /// First assigned id in each tokenizer.
    pub first_ids: [u32; 2],
    /// `(k, hidden)` vectors for each encoder.
    pub vectors: [Tensor; 2],
}

impl VocabularyExtension {
    pub fn vectors_per_token(&self) -> usize {
        self.token_strings.len()
    }

    pub fn ids(&self, tokenizer: usize) -> Range<u32> {
        let first = self.first_ids[tokenizer];
        first..first + self.vectors_per_token() as u32
    }

    /// Caption replacement expanding the label into all of its tokens.
    pub fn replacement(&self) -> Option<(String, String)> {
        (self.vectors_per_token() > 1).then(|| (self.label.clone(), self.token_strings.join(" ")))
    }
}

/// True when `path` names a safetensors file, by extension or by its header.
pub fn is_safetensors(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) == Some("safetensors") {
        return true;
    }
    // 8-byte little-endian header length, then the JSON header
    let mut head = [0u8; 9];
    match File::open(path).and_then(|mut f| f.read_exact(&mut head)) {
        Ok(()) => head[8] == b'{',
        Err(_) => false,
    }
}

/// Parent key some trainers nest the vectors under.
const NESTED_KEY: &str = "string_to_param";

fn read_embedding_tensors(path: &Path) -> Result<HashMap<String, Tensor>> {
    if is_safetensors(path) {
        return Ok(candle_core::safetensors::load(path, &Device::Cpu)?);
    }
    let nested = candle_core::pickle::read_all_with_key(path, Some(NESTED_KEY))
        .ok()
        .filter(|tensors| !tensors.is_empty());
    let tensors = match nested {
        Some(tensors) => tensors,
        None => candle_core::pickle::read_all(path)?,
    };
    Ok(tensors.into_iter().collect())
}

/// `clip_l` and `clip_g` vectors of an embedding file, each `(k, hidden)`.
///
/// Safetensors and PyTorch pickle files are accepted, with the vectors at
/// the top level or under `string_to_param`.
pub fn load_embedding_file(path: &Path) -> Result<[Tensor; 2]> {
    let fail = |reason: String| TrainerError::EmbeddingFile {
        path: path.display().to_string(),
        reason,
    };
    let mut tensors = read_embedding_tensors(path)?;
    let mut take = |key: &str| -> Result<Tensor> {
        let tensor = tensors
            .remove(key)
            .or_else(|| tensors.remove(&format!("{}.{}", NESTED_KEY, key)))
            .ok_or_else(|| fail(format!("missing `{}`", key)))?;
        match tensor.rank() {
            1 => Ok(tensor.unsqueeze(0)?),
            2 => Ok(tensor),
            r => Err(fail(format!("`{}` has rank {}, expected 2", key, r))),
        }
    };
    let clip_l = take(EMBEDDING_KEYS[0])?;
    let clip_g = take(EMBEDDING_KEYS[1])?;
    let (k1, k2) = (clip_l.dim(0)?, clip_g.dim(0)?);
    if k1 != k2 || k1 == 0 {
        return Err(fail(format!("clip_l has {} vectors but clip_g has {}", k1, k2)));
    }
    Ok([clip_l, clip_g])
}

/// `label`, `label1`, ..., `label{k-1}`.
pub fn token_strings(label: &str, vectors_per_token: usize) -> Vec<String> {
    std::iter::once(label.to_string())
        .chain((1..vectors_per_token).map(|i| format!("{}{}", label, i)))
        .collect()
}

/// Add `strings` to `tokenizer` and return the first assigned id.
///
/// Every string must be new and the ids must form a contiguous block at the
/// end of the vocabulary.
pub fn register_tokens(
    tokenizer: &mut dyn TextTokenizer,
    index: usize,
    strings: &[String],
    source: &Path,
) -> Result<u32> {
    let conflict = |token: &String| TrainerError::VocabularyConflict {
        token: token.clone(),
        tokenizer: index,
        source_file: source.display().to_string(),
    };
    if let Some(existing) = strings.iter().find(|s| tokenizer.token_id(s.as_str()).is_some()) {
        return Err(conflict(existing));
    }
    let before = tokenizer.vocab_len();
    let added = tokenizer.add_tokens(strings);
    if added != strings.len() {
        return Err(conflict(&strings[0]));
    }

    let integrity = |reason: String| TrainerError::VocabularyIntegrity {
        token: strings[0].clone(),
        tokenizer: index,
        reason,
    };
    let ids = strings
        .iter()
        .map(|s| tokenizer.token_id(s).ok_or_else(|| integrity(format!("`{}` has no id", s))))
        .collect::<Result<Vec<u32>>>()?;
    let first = ids[0];
    if first as usize != before {
        return Err(integrity(format!("first id {} does not follow vocabulary size {}", first, before)));
    }
    if let Some(pos) = (0..ids.len()).find(|&i| ids[i] != first + i as u32) {
        return Err(integrity(format!("ids {:?} are not contiguous at position {}", ids, pos)));
    }
    let last = first as usize + ids.len() - 1;
    if last + 1 != tokenizer.vocab_len() {
        return Err(integrity(format!(
            "last id {} is not the end of the vocabulary ({})",
            last,
            tokenizer.vocab_len()
        )));
    }
    Ok(first)
}

/// Register every embedding file and write its vectors into both encoders.
///
/// Tables are resized once after all files are registered; existing rows
/// are left untouched.
pub fn load_textual_inversion(
    paths: &[PathBuf],
    name: Option<&str>,
    tokenizers: &mut TokenizerPair,
    text_encoders: &mut TextEncoderPair,
) -> Result<Vec<VocabularyExtension>> {
    let mut extensions = Vec::with_capacity(paths.len());
    for path in paths {
        let vectors = load_embedding_file(path)?;
        let label = match name {
            Some(name) => name.to_string(),
            None => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| TrainerError::EmbeddingFile {
                    path: path.display().to_string(),
                    reason: "no file name".to_string(),
                })?,
        };
        let strings = token_strings(&label, vectors[0].dim(0)?);
        let first_ids = [
            register_tokens(tokenizers.get_mut(0), 0, &strings, path)?,
            register_tokens(tokenizers.get_mut(1), 1, &strings, path)?,
        ];
        let extension = VocabularyExtension {
            source: path.clone(),
            label,
            token_strings: strings,
            first_ids,
            vectors,
        };
        info!(
            "Textual Inversion embeddings `{}` loaded. Tokens are added: {:?} and {:?}",
            extension.label,
            extension.ids(0),
            extension.ids(1)
        );
        extensions.push(extension);
    }
    if extensions.is_empty() {
        return Ok(extensions);
    }

    for index in 0..2 {
        let vocab = tokenizers.get(index).vocab_len();
        let encoder = text_encoders.get_mut(index);
        encoder.resize_token_embeddings(vocab)?;
        let mut table = encoder.input_embeddings()?;
        for extension in &extensions {
            table = overwrite_rows(&table, extension.first_ids[index] as usize, &extension.vectors[index])?;
        }
        encoder.set_input_embeddings(table)?;
    }
    Ok(extensions)
}

/// `table` with rows `start..start + rows.dim(0)` replaced by `rows`.
fn overwrite_rows(table: &Tensor, start: usize, rows: &Tensor) -> Result<Tensor> {
    let (vocab, hidden) = table.dims2()?;
    let (k, width) = rows.dims2()?;
    if width != hidden {
        return Err(TrainerError::shape("embedding width", hidden, width));
    }
    if start + k > vocab {
        return Err(TrainerError::shape("embedding rows", vocab, start + k));
    }
    let rows = rows.to_dtype(table.dtype())?.to_device(table.device())?;
    let mut parts = Vec::with_capacity(3);
    if start > 0 {
        parts.push(table.narrow(0, 0, start)?);
    }
    parts.push(rows);
    if start + k < vocab {
        parts.push(table.narrow(0, start + k, vocab - start - k)?);
    }
    Ok(Tensor::cat(&parts, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{clip_tokenizer, FakeEncoder, FakeTokenizer};
    use candle_core::DType;

    fn write_embedding(dir: &Path, name: &str, k: usize, fill: f32) -> Result<PathBuf> {
        let path = dir.join(format!("{}.safetensors", name));
        let mut tensors = HashMap::new();
        tensors.insert("clip_l".to_string(), Tensor::full(fill, (k, 4), &Device::Cpu)?);
        tensors.insert("clip_g".to_string(), Tensor::full(fill, (k, 6), &Device::Cpu)?);
        candle_core::safetensors::save(&tensors, &path)?;
        Ok(path)
    }

    fn pairs(stride_gaps: bool) -> (TokenizerPair, TextEncoderPair) {
        let second: Box<dyn TextTokenizer> = if stride_gaps {
            Box::new(FakeTokenizer::with_gaps(10))
        } else {
            Box::new(FakeTokenizer::new(10))
        };
        (
            TokenizerPair::new(Box::new(FakeTokenizer::new(10)), second),
            TextEncoderPair::new(
                Box::new(FakeEncoder::new("te1", 10, 4, None)),
                Box::new(FakeEncoder::new("te2", 10, 6, Some(6))),
            ),
        )
    }

    #[test]
    fn token_strings_number_from_one() {
        assert_eq!(token_strings("sks", 3), vec!["sks", "sks1", "sks2"]);
        assert_eq!(token_strings("sks", 1), vec!["sks"]);
    }

    #[test]
    fn sniffs_safetensors_without_extension() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_embedding(dir.path(), "style", 1, 1.0)?;
        let renamed = dir.path().join("style.bin");
        std::fs::rename(&path, &renamed)?;
        assert!(is_safetensors(&renamed));
        assert!(!is_safetensors(&dir.path().join("missing.pt")));
        Ok(())
    }

    #[test]
    fn assigns_contiguous_rows_and_keeps_prior_ones() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_embedding(dir.path(), "style", 2, 7.0)?;
        let (mut tokenizers, mut encoders) = pairs(false);
        let before = encoders.get(0).input_embeddings()?.to_vec2::<f32>()?;

        let extensions = load_textual_inversion(&[path], None, &mut tokenizers, &mut encoders)?;

        assert_eq!(extensions.len(), 1);
        assert_eq!(extensions[0].ids(0), 10..12);
        assert_eq!(
            extensions[0].replacement(),
            Some(("style".to_string(), "style style1".to_string()))
        );
        let table = encoders.get(0).input_embeddings()?.to_vec2::<f32>()?;
        assert_eq!(table.len(), 12);
        assert_eq!(&table[..10], &before[..]);
        assert_eq!(table[10], vec![7.0; 4]);
        assert_eq!(table[11], vec![7.0; 4]);
        assert_eq!(encoders.get(1).vocab_size()?, 12);
        Ok(())
    }

    #[test]
    fn loading_the_same_file_twice_conflicts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_embedding(dir.path(), "style", 1, 1.0)?;
        let (mut tokenizers, mut encoders) = pairs(false);
        load_textual_inversion(&[path.clone()], None, &mut tokenizers, &mut encoders)?;
        let result = load_textual_inversion(&[path], None, &mut tokenizers, &mut encoders);
        assert!(matches!(result, Err(TrainerError::VocabularyConflict { tokenizer: 0, .. })));
        Ok(())
    }

    fn clip_pairs() -> (TokenizerPair, TextEncoderPair) {
        (
            TokenizerPair::new(Box::new(clip_tokenizer(None)), Box::new(clip_tokenizer(Some("!")))),
            TextEncoderPair::new(
                Box::new(FakeEncoder::new("te1", 6, 4, None)),
                Box::new(FakeEncoder::new("te2", 6, 6, Some(6))),
            ),
        )
    }

    #[test]
    fn existing_vocabulary_word_conflicts() {
        let mut tok = clip_tokenizer(None);
        let result = register_tokens(&mut tok, 1, &["cat".to_string()], Path::new("cat.safetensors"));
        assert!(matches!(
            result,
            Err(TrainerError::VocabularyConflict { ref token, tokenizer: 1, .. }) if token == "cat"
        ));
        assert_eq!(tok.vocab_len(), 6);
    }

    #[test]
    fn new_label_takes_next_id() -> Result<()> {
        let mut tok = clip_tokenizer(None);
        let first = register_tokens(&mut tok, 0, &["sks".to_string()], Path::new("sks.safetensors"))?;
        assert_eq!(first, 6);
        assert_eq!(tok.vocab_len(), 7);
        Ok(())
    }

    #[test]
    fn clip_tokenizers_extend_both_tables() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_embedding(dir.path(), "style", 2, 3.0)?;
        let (mut tokenizers, mut encoders) = clip_pairs();

        let extensions = load_textual_inversion(&[path], None, &mut tokenizers, &mut encoders)?;

        assert_eq!(extensions[0].ids(0), 6..8);
        assert_eq!(extensions[0].ids(1), 6..8);
        assert_eq!(tokenizers.get(0).token_id("style1"), Some(7));
        let table = encoders.get(0).input_embeddings()?.to_vec2::<f32>()?;
        assert_eq!(table.len(), 8);
        assert_eq!(table[7], vec![3.0; 4]);
        assert_eq!(encoders.get(1).vocab_size()?, 8);
        Ok(())
    }

    #[test]
    fn label_already_in_clip_vocabulary_conflicts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_embedding(dir.path(), "photo", 1, 1.0)?;
        let (mut tokenizers, mut encoders) = clip_pairs();
        let result = load_textual_inversion(&[path], None, &mut tokenizers, &mut encoders);
        assert!(matches!(result, Err(TrainerError::VocabularyConflict { tokenizer: 0, .. })));
        assert_eq!(encoders.get(0).vocab_size()?, 6);
        Ok(())
    }

    #[test]
    fn gapped_ids_fail_integrity() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_embedding(dir.path(), "style", 2, 1.0)?;
        let (mut tokenizers, mut encoders) = pairs(true);
        let result = load_textual_inversion(&[path], None, &mut tokenizers, &mut encoders);
        assert!(matches!(result, Err(TrainerError::VocabularyIntegrity { tokenizer: 1, .. })));
        Ok(())
    }

    #[test]
    fn name_override_labels_tokens() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_embedding(dir.path(), "file", 1, 2.0)?;
        let (mut tokenizers, mut encoders) = pairs(false);
        let extensions = load_textual_inversion(&[path], Some("ohwx"), &mut tokenizers, &mut encoders)?;
        assert_eq!(extensions[0].token_strings, vec!["ohwx"]);
        assert_eq!(tokenizers.get(1).token_id("ohwx"), Some(10));
        assert_eq!(extensions[0].replacement(), None);
        Ok(())
    }

    #[test]
    fn nested_keys_are_found() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("string_to_param.clip_l".to_string(), Tensor::ones((1, 4), DType::F32, &Device::Cpu)?);
        tensors.insert("string_to_param.clip_g".to_string(), Tensor::ones(6, DType::F32, &Device::Cpu)?);
        candle_core::safetensors::save(&tensors, &path)?;
        let [clip_l, clip_g] = load_embedding_file(&path)?;
        assert_eq!(clip_l.dims(), &[1, 4]);
        assert_eq!(clip_g.dims(), &[1, 6]);
        Ok(())
    }

    #[test]
    fn unreadable_pickle_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.pt");
        std::fs::write(&path, b"not a zip archive")?;
        assert!(load_embedding_file(&path).is_err());
        Ok(())
    }

    #[test]
    fn mismatched_vector_counts_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("clip_l".to_string(), Tensor::zeros((2, 4), DType::F32, &Device::Cpu)?);
        tensors.insert("clip_g".to_string(), Tensor::zeros((3, 6), DType::F32, &Device::Cpu)?);
        candle_core::safetensors::save(&tensors, &path)?;
        assert!(matches!(load_embedding_file(&path), Err(TrainerError::EmbeddingFile { .. })));
        Ok(())
    }
}
