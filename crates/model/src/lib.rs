//! Sequence-model boundary consumed by the training and evaluation drivers.
//!
//! The drivers only ever see [`SequenceModel`]: a forward pass over token
//! ids with an externally supplied attention mask, and an enumerable set of
//! trainable parameters. [`DecoderModel`] is the stock decoder-only
//! implementation behind that interface.

pub mod config;
pub mod decoder;

pub use config::ModelConfig;
pub use decoder::DecoderModel;

use candle_core::{Result, Tensor, Var};

/// Forward-pass output: logits shaped `[batch, seq, vocab_size]` plus the
/// per-layer attention weights.
pub struct ModelOutput {
    pub logits: Tensor,
    pub attentions: Vec<Tensor>,
}

pub trait SequenceModel {
    /// Runs the model over `input_ids` (`[batch, seq]`, i64). `mask` is a
    /// `[batch, 1, seq, seq]` f32 tensor where 1.0 marks a disallowed
    /// attention edge; `training` enables dropout.
    fn forward(&self, input_ids: &Tensor, training: bool, mask: &Tensor) -> Result<ModelOutput>;

    /// Named trainable parameters. Returned `Var`s share storage with the
    /// model, so setting them updates the model in place.
    fn parameters(&self) -> Vec<(String, Var)>;
}
