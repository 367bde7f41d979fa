use candle_core::{bail, Result};

/// Hyperparameters for [`crate::DecoderModel`].
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub ff_dim: usize,
    pub max_seq_len: usize,
    pub dropout_p: Option<f32>,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            bail!("vocab_size must be greater than zero");
        }
        if self.hidden_dim == 0 || self.n_layers == 0 || self.ff_dim == 0 {
            bail!("hidden_dim, n_layers and ff_dim must be greater than zero");
        }
        if self.n_heads == 0 || self.hidden_dim % self.n_heads != 0 {
            bail!(
                "hidden_dim {} must be divisible by n_heads {}",
                self.hidden_dim,
                self.n_heads
            );
        }
        if self.max_seq_len == 0 {
            bail!("max_seq_len must be greater than zero");
        }
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                bail!("dropout_p must be in [0, 1), got {}", p);
            }
        }
        Ok(())
    }
}
