//! Error types for the network training core.
//!
//! Every variant is fatal for the run. Nothing in the crate retries or
//! substitutes partial results.

/// Result type alias using [`TrainerError`].
pub type Result<T> = std::result::Result<T, TrainerError>;

#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    /// Run configuration contradicts itself or the dataset. Raised before any compute.
    #[error("configuration: {0}")]
    Configuration(String),

    /// A textual-inversion label is already present in a tokenizer.
    #[error("token `{token}` already exists in tokenizer {tokenizer} (from {source_file})")]
    VocabularyConflict {
        token: String,
        tokenizer: usize,
        source_file: String,
    },

    /// Newly registered ids are not a contiguous block at the end of the vocabulary.
    #[error("tokenizer {tokenizer} assigned invalid ids for `{token}`: {reason}")]
    VocabularyIntegrity {
        token: String,
        tokenizer: usize,
        reason: String,
    },

    /// Device or kernel failure during encoding or denoising.
    #[error("compute: {0}")]
    Compute(#[from] candle_core::Error),

    /// Tensors disagree on a dimension the next stage relies on.
    #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    /// Textual-inversion embedding file is missing keys or malformed.
    #[error("embedding file {path}: {reason}")]
    EmbeddingFile { path: String, reason: String },

    /// Model checkpoint could not be interpreted.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    #[error("tokenizer: {0}")]
    Tokenizer(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tokenizers::Error> for TrainerError {
    fn from(error: tokenizers::Error) -> Self {
        TrainerError::Tokenizer(error.to_string())
    }
}

impl TrainerError {
    pub fn config(msg: impl Into<String>) -> Self {
        TrainerError::Configuration(msg.into())
    }

    pub fn shape(what: impl Into<String>, expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        TrainerError::ShapeMismatch {
            what: what.into(),
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}
