//! Caption datasets and the cached text encoder outputs attached to their batches.

use candle_core::{DType, Device, Tensor};
use log::{info, warn};
use once_cell::unsync::OnceCell;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, TrainerError};
use crate::loaders::sdxl_checkpoint_loader::read_safetensors_metadata;
use crate::loaders::tokenizer::{batch_input_ids, TokenizerPair};
use crate::models::sdxl_time_ids::TimeIds;
use crate::models::text_encoder::TextEncoderPair;
use crate::trainers::conditioning::ConditioningTriple;
use crate::trainers::text_encoders::hidden_states_sdxl;
use crate::trainers::DatasetConfig;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];
const CACHE_SUFFIX: &str = "_te_outputs.safetensors";
const MAX_TOKEN_LENGTH_KEY: &str = "max_token_length";

/// One training batch as handed to the conditioning assembler.
#[derive(Debug, Clone)]
pub struct Batch {
    pub captions: Vec<String>,
    /// `(batch, chunks, 77)` ids for the first tokenizer.
    pub input_ids1: Tensor,
    /// `(batch, chunks, 77)` ids for the second tokenizer.
    pub input_ids2: Tensor,
    /// Precomputed conditioning when the cache is primed.
    pub text_encoder_outputs: Option<ConditioningTriple>,
    pub time_ids: Vec<TimeIds>,
}

impl Batch {
    pub fn len(&self) -> Result<usize> {
        Ok(self.input_ids1.dim(0)?)
    }
}

/// The dataset operations the training core relies on.
pub trait TrainDataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every caption is fixed per sample, so encoder outputs can be reused.
    fn is_text_encoder_output_cacheable(&self) -> bool;

    fn verify_bucket_reso_steps(&self, multiple: u32) -> Result<()>;

    /// Expand `from` into `to` in every caption.
    fn add_replacement(&mut self, from: &str, to: &str);

    /// Encode every sample once and keep the outputs for later batches.
    ///
    /// Either all samples are cached or none are.
    fn cache_text_encoder_outputs(
        &mut self,
        tokenizers: &TokenizerPair,
        text_encoders: &TextEncoderPair,
        device: &Device,
        dtype: DType,
        to_disk: bool,
        is_main_process: bool,
    ) -> Result<()>;

    /// Tokenizers used to build `input_ids` for batches.
    fn set_tokenizers(&mut self, tokenizers: TokenizerPair);

    fn batch(&mut self, indices: &[usize]) -> Result<Batch>;
}

#[derive(Debug, Clone)]
pub struct DatasetItem {
    pub image_path: PathBuf,
    pub caption: String,
    pub time_ids: TimeIds,
}

enum TextEncoderCache {
    Memory(Vec<ConditioningTriple>),
    Disk(Vec<PathBuf>),
}

/// Images with sibling caption files, trained at a fixed square resolution.
pub struct CaptionDataset {
    items: Vec<DatasetItem>,
    config: DatasetConfig,
    tokenizers: Option<TokenizerPair>,
    max_token_length: Option<usize>,
    replacements: Vec<(String, String)>,
    cache: OnceCell<TextEncoderCache>,
    current_step: usize,
    rng: StdRng,
}

impl CaptionDataset {
    /// Scan `config.folder_path` for images and their captions.
    pub fn from_folder(config: &DatasetConfig, max_token_length: Option<usize>) -> Result<Self> {
        let folder = Path::new(&config.folder_path);
        let mut image_paths: Vec<PathBuf> = fs::read_dir(folder)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        image_paths.sort();

        let target = (config.resolution, config.resolution);
        let items = image_paths
            .par_iter()
            .map(|path| {
                let (width, height) = image::image_dimensions(path).map_err(|e| {
                    TrainerError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("{}: {}", path.display(), e),
                    ))
                })?;
                let caption_path = path.with_extension(&config.caption_ext);
                let caption = match fs::read_to_string(&caption_path) {
                    Ok(text) => text.trim().to_string(),
                    Err(_) => {
                        warn!("No caption for {}, using empty caption", path.display());
                        String::new()
                    }
                };
                Ok(DatasetItem {
                    image_path: path.clone(),
                    caption,
                    time_ids: TimeIds::center_crop((height, width), target),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!("Found {} images in {}", items.len(), folder.display());
        Ok(Self::from_items(items, config.clone(), max_token_length))
    }

    pub fn from_items(items: Vec<DatasetItem>, config: DatasetConfig, max_token_length: Option<usize>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            items,
            config,
            tokenizers: None,
            max_token_length,
            replacements: Vec::new(),
            cache: OnceCell::new(),
            current_step: 0,
            rng,
        }
    }

    pub fn tokenizers(&self) -> Option<&TokenizerPair> {
        self.tokenizers.as_ref()
    }

    pub fn tokenizers_mut(&mut self) -> Option<&mut TokenizerPair> {
        self.tokenizers.as_mut()
    }

    /// Training step, used for token warmup.
    pub fn set_current_step(&mut self, step: usize) {
        self.current_step = step;
    }

    pub fn items(&self) -> &[DatasetItem] {
        &self.items
    }

    pub fn is_cached(&self) -> bool {
        self.cache.get().is_some()
    }

    fn replaced(&self, caption: &str) -> String {
        self.replacements
            .iter()
            .fold(caption.to_string(), |acc, (from, to)| acc.replace(from.as_str(), to))
    }

    /// Caption after replacements and random augmentation.
    fn process_caption(&mut self, caption: &str) -> String {
        let caption = self.replaced(caption);
        if self.config.caption_dropout_rate > 0.0 && self.rng.gen::<f32>() < self.config.caption_dropout_rate {
            return String::new();
        }

        let warming_up = self.config.token_warmup_step > 0 && self.current_step < self.config.token_warmup_step;
        if !self.config.shuffle_caption && self.config.caption_tag_dropout_rate <= 0.0 && !warming_up {
            return caption;
        }

        let tags: Vec<String> = caption.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect();
        let keep = self.config.keep_tokens.min(tags.len());
        let (fixed, rest) = tags.split_at(keep);
        let mut rest = rest.to_vec();

        if warming_up {
            let allowed = (rest.len() * self.current_step / self.config.token_warmup_step).max(1);
            rest.truncate(allowed);
        }
        if self.config.shuffle_caption {
            rest.shuffle(&mut self.rng);
        }
        if self.config.caption_tag_dropout_rate > 0.0 {
            let rate = self.config.caption_tag_dropout_rate;
            let rng = &mut self.rng;
            rest.retain(|_| rng.gen::<f32>() >= rate);
        }

        fixed.iter().chain(rest.iter()).cloned().collect::<Vec<_>>().join(", ")
    }

    fn cache_path(&self, item: &DatasetItem) -> PathBuf {
        match &self.config.text_encoder_cache_dir {
            Some(dir) => {
                let path_str = item.image_path.to_string_lossy();
                let hash = path_str.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
                Path::new(dir).join(format!("{:016x}{}", hash, CACHE_SUFFIX))
            }
            None => {
                let stem = item.image_path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
                item.image_path.with_file_name(format!("{}{}", stem, CACHE_SUFFIX))
            }
        }
    }

    fn encode_item(
        &self,
        item: &DatasetItem,
        tokenizers: &TokenizerPair,
        text_encoders: &TextEncoderPair,
        device: &Device,
        dtype: DType,
    ) -> Result<ConditioningTriple> {
        let captions = [self.replaced(&item.caption)];
        let ids1 = batch_input_ids(tokenizers.get(0), &captions, self.max_token_length, device)?;
        let ids2 = batch_input_ids(tokenizers.get(1), &captions, self.max_token_length, device)?;
        let triple = hidden_states_sdxl(
            self.max_token_length,
            &ids1,
            &ids2,
            text_encoders.first(),
            text_encoders.second(),
            Some(dtype),
        )?;
        triple.to_device(&Device::Cpu)?.sample(0)
    }

    fn cache_metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert(
            MAX_TOKEN_LENGTH_KEY.to_string(),
            self.max_token_length.map(|m| m.to_string()).unwrap_or_default(),
        );
        metadata
    }

    fn write_triple(&self, path: &Path, triple: &ConditioningTriple) -> Result<()> {
        let tensors = [
            ("hidden_states1", &triple.hidden_states1),
            ("hidden_states2", &triple.hidden_states2),
            ("pool2", &triple.pool2),
        ];
        safetensors::serialize_to_file(tensors, &Some(self.cache_metadata()), path).map_err(|e| {
            TrainerError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{}: {}", path.display(), e),
            ))
        })
    }

    /// A cache file written for another `max_token_length` has a different token count.
    fn check_cache_file(&self, path: &Path) -> Result<()> {
        let metadata = read_safetensors_metadata(path)?;
        let expected = self.cache_metadata();
        if metadata.get(MAX_TOKEN_LENGTH_KEY) != expected.get(MAX_TOKEN_LENGTH_KEY) {
            return Err(TrainerError::config(format!(
                "text encoder cache {} was written with a different max_token_length",
                path.display()
            )));
        }
        Ok(())
    }

    fn read_triple(path: &Path) -> Result<ConditioningTriple> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let mut take = |key: &str| {
            tensors.remove(key).ok_or_else(|| {
                TrainerError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{} has no `{}`", path.display(), key),
                ))
            })
        };
        Ok(ConditioningTriple {
            hidden_states1: take("hidden_states1")?,
            hidden_states2: take("hidden_states2")?,
            pool2: take("pool2")?,
        })
    }

    fn cache_to_memory(
        &self,
        tokenizers: &TokenizerPair,
        text_encoders: &TextEncoderPair,
        device: &Device,
        dtype: DType,
    ) -> Result<TextEncoderCache> {
        let progress = progress_bar(self.items.len());
        let mut triples = Vec::with_capacity(self.items.len());
        for item in &self.items {
            triples.push(self.encode_item(item, tokenizers, text_encoders, device, dtype)?);
            progress.inc(1);
        }
        progress.finish();
        Ok(TextEncoderCache::Memory(triples))
    }

    fn cache_to_disk(
        &self,
        tokenizers: &TokenizerPair,
        text_encoders: &TextEncoderPair,
        device: &Device,
        dtype: DType,
        is_main_process: bool,
    ) -> Result<TextEncoderCache> {
        let paths: Vec<PathBuf> = self.items.iter().map(|item| self.cache_path(item)).collect();
        if !is_main_process {
            for path in &paths {
                if !path.exists() {
                    return Err(TrainerError::config(format!(
                        "text encoder cache {} was not written by the main process",
                        path.display()
                    )));
                }
                self.check_cache_file(path)?;
            }
            return Ok(TextEncoderCache::Disk(paths));
        }
        if let Some(dir) = &self.config.text_encoder_cache_dir {
            fs::create_dir_all(dir)?;
        }

        let progress = progress_bar(self.items.len());
        let mut written: Vec<PathBuf> = Vec::with_capacity(paths.len());
        let result = self.items.iter().zip(&paths).try_for_each(|(item, path)| {
            let triple = self.encode_item(item, tokenizers, text_encoders, device, dtype)?;
            let tmp = path.with_extension("safetensors.tmp");
            self.write_triple(&tmp, &triple)?;
            written.push(tmp);
            progress.inc(1);
            Ok::<(), TrainerError>(())
        });
        progress.finish();

        if let Err(e) = result {
            for tmp in &written {
                let _ = fs::remove_file(tmp);
            }
            return Err(e);
        }
        publish(&written, &paths)?;
        Ok(TextEncoderCache::Disk(paths))
    }

    fn cached_outputs(&self, indices: &[usize]) -> Result<Option<ConditioningTriple>> {
        let samples = match self.cache.get() {
            None => return Ok(None),
            Some(TextEncoderCache::Memory(triples)) => {
                indices.iter().map(|&i| triples[i].clone()).collect::<Vec<_>>()
            }
            Some(TextEncoderCache::Disk(paths)) => indices
                .iter()
                .map(|&i| Self::read_triple(&paths[i]))
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(Some(ConditioningTriple::stack(&samples)?))
    }
}

/// Rename every temporary file onto its final path.
///
/// On the first failure the files already published and the remaining
/// temporaries are removed, so no partial cache is left behind.
fn publish(written: &[PathBuf], paths: &[PathBuf]) -> Result<()> {
    for (i, (tmp, path)) in written.iter().zip(paths).enumerate() {
        if let Err(e) = fs::rename(tmp, path) {
            warn!("failed to publish text encoder cache {}: {}", path.display(), e);
            for done in &paths[..i] {
                let _ = fs::remove_file(done);
            }
            for pending in &written[i..] {
                let _ = fs::remove_file(pending);
            }
            return Err(e.into());
        }
    }
    Ok(())
}

impl TrainDataset for CaptionDataset {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_text_encoder_output_cacheable(&self) -> bool {
        self.config.caption_dropout_rate <= 0.0
            && !self.config.shuffle_caption
            && self.config.token_warmup_step == 0
            && self.config.caption_tag_dropout_rate <= 0.0
    }

    fn verify_bucket_reso_steps(&self, multiple: u32) -> Result<()> {
        if self.config.bucket_reso_steps % multiple != 0 {
            return Err(TrainerError::config(format!(
                "bucket_reso_steps {} must be divisible by {}",
                self.config.bucket_reso_steps, multiple
            )));
        }
        if self.config.resolution % multiple != 0 {
            return Err(TrainerError::config(format!(
                "resolution {} must be divisible by {}",
                self.config.resolution, multiple
            )));
        }
        Ok(())
    }

    fn add_replacement(&mut self, from: &str, to: &str) {
        self.replacements.push((from.to_string(), to.to_string()));
    }

    fn cache_text_encoder_outputs(
        &mut self,
        tokenizers: &TokenizerPair,
        text_encoders: &TextEncoderPair,
        device: &Device,
        dtype: DType,
        to_disk: bool,
        is_main_process: bool,
    ) -> Result<()> {
        if self.cache.get().is_some() {
            info!("Text encoder outputs already cached");
            return Ok(());
        }
        info!(
            "Caching text encoder outputs for {} samples{}",
            self.items.len(),
            if to_disk { " to disk" } else { "" }
        );
        let cache = if to_disk {
            self.cache_to_disk(tokenizers, text_encoders, device, dtype, is_main_process)?
        } else {
            self.cache_to_memory(tokenizers, text_encoders, device, dtype)?
        };
        let _ = self.cache.set(cache);
        Ok(())
    }

    fn set_tokenizers(&mut self, tokenizers: TokenizerPair) {
        self.tokenizers = Some(tokenizers);
    }

    fn batch(&mut self, indices: &[usize]) -> Result<Batch> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.items.len()) {
            return Err(TrainerError::shape("batch index", format!("< {}", self.items.len()), bad));
        }
        let raw: Vec<String> = indices.iter().map(|&i| self.items[i].caption.clone()).collect();
        let captions: Vec<String> = raw.iter().map(|c| self.process_caption(c)).collect();
        let tokenizers = self
            .tokenizers
            .as_ref()
            .ok_or_else(|| TrainerError::config("dataset has no tokenizers"))?;
        let input_ids1 = batch_input_ids(tokenizers.get(0), &captions, self.max_token_length, &Device::Cpu)?;
        let input_ids2 = batch_input_ids(tokenizers.get(1), &captions, self.max_token_length, &Device::Cpu)?;

        Ok(Batch {
            captions,
            input_ids1,
            input_ids2,
            text_encoder_outputs: self.cached_outputs(indices)?,
            time_ids: indices.iter().map(|&i| self.items[i].time_ids).collect(),
        })
    }
}

#[cfg(feature = "progress-bar")]
fn progress_bar(len: usize) -> indicatif::ProgressBar {
    let bar = indicatif::ProgressBar::new(len as u64);
    if let Ok(style) = indicatif::ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} ({eta})") {
        bar.set_style(style);
    }
    bar.set_message("caching text encoder outputs");
    bar
}

#[cfg(not(feature = "progress-bar"))]
struct NoProgress;

#[cfg(not(feature = "progress-bar"))]
impl NoProgress {
    fn inc(&self, _: u64) {}
    fn finish(&self) {}
}

#[cfg(not(feature = "progress-bar"))]
fn progress_bar(_len: usize) -> NoProgress {
    NoProgress
}
