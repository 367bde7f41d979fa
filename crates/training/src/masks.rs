//! Attention mask builders.
//!
//! Masks are `[batch, 1, seq, seq]` f32 tensors where `1.0` marks an edge
//! the model must not attend across; the model turns them into large
//! negative score biases. The combined mask satisfies
//! `mask[i][j] == 1` iff `j > i` or position `j` holds the padding value.

use candle_core::{Device, Result, Tensor};
use vocab::PAD_ID;

/// Upper-triangular exclusion: position `i` may attend to positions `<= i`.
pub fn causal_mask(batch: usize, seq: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; batch * seq * seq];
    for b in 0..batch {
        for q in 0..seq {
            let row_start = (b * seq + q) * seq;
            for k in (q + 1)..seq {
                data[row_start + k] = 1.0;
            }
        }
    }
    Tensor::from_vec(data, (batch, 1, seq, seq), device)
}

/// Excludes padded key positions for every query.
pub fn padding_mask(tokens: &[i64], batch: usize, seq: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; batch * seq * seq];
    for b in 0..batch {
        let row = &tokens[b * seq..(b + 1) * seq];
        for q in 0..seq {
            let row_start = (b * seq + q) * seq;
            for (k, &token) in row.iter().enumerate() {
                if token == PAD_ID {
                    data[row_start + k] = 1.0;
                }
            }
        }
    }
    Tensor::from_vec(data, (batch, 1, seq, seq), device)
}

/// Causal and padding exclusions combined with an elementwise maximum.
pub fn combined_mask(
    tokens: &[i64],
    batch: usize,
    seq: usize,
    device: &Device,
) -> Result<Tensor> {
    let causal = causal_mask(batch, seq, device)?;
    let padding = padding_mask(tokens, batch, seq, device)?;
    causal.maximum(&padding)
}
