pub mod sdxl_checkpoint_loader;
pub mod textual_inversion;
pub mod tokenizer;

pub use sdxl_checkpoint_loader::{load_target_model, read_safetensors_metadata, CheckpointFormat, TargetModel};
pub use textual_inversion::{load_textual_inversion, VocabularyExtension};
pub use tokenizer::{ClipTokenizer, TextTokenizer, TokenizerPair, Vocabulary};
