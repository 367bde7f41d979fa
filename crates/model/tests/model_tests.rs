use candle_core::{Device, Result, Tensor};
use model::{DecoderModel, ModelConfig, SequenceModel};

fn build_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 16,
        hidden_dim: 8,
        n_layers: 2,
        n_heads: 2,
        ff_dim: 16,
        max_seq_len: 8,
        dropout_p: None,
    }
}

fn causal_mask(batch: usize, seq: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; batch * seq * seq];
    for b in 0..batch {
        for i in 0..seq {
            for j in 0..seq {
                if j > i {
                    data[(b * seq + i) * seq + j] = 1.0;
                }
            }
        }
    }
    Tensor::from_vec(data, (batch, 1, seq, seq), device)
}

#[test]
fn forward_produces_logits_and_attentions() -> Result<()> {
    let device = Device::Cpu;
    let model = DecoderModel::new(build_config(), device.clone())?;
    let token_ids = Tensor::from_slice(&[1i64, 2, 3, 4, 5, 6], (2, 3), &device)?;
    let mask = causal_mask(2, 3, &device)?;

    let output = model.forward(&token_ids, false, &mask)?;
    assert_eq!(output.logits.dims(), &[2, 3, 16]);
    assert_eq!(output.attentions.len(), 2);
    assert_eq!(output.attentions[0].dims(), &[2, 2, 3, 3]);
    Ok(())
}

#[test]
fn causal_mask_blocks_future_positions() -> Result<()> {
    let device = Device::Cpu;
    let model = DecoderModel::new(build_config(), device.clone())?;
    let mask = causal_mask(1, 4, &device)?;

    let a = Tensor::from_slice(&[1i64, 2, 3, 4], (1, 4), &device)?;
    let b = Tensor::from_slice(&[1i64, 2, 9, 10], (1, 4), &device)?;

    let logits_a = model.forward(&a, false, &mask)?.logits;
    let logits_b = model.forward(&b, false, &mask)?.logits;

    // The prediction at position 1 only depends on positions 0..=1.
    let row_a = logits_a.narrow(1, 1, 1)?.flatten_all()?.to_vec1::<f32>()?;
    let row_b = logits_b.narrow(1, 1, 1)?.flatten_all()?.to_vec1::<f32>()?;
    for (x, y) in row_a.iter().zip(row_b.iter()) {
        assert!((x - y).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn parameters_share_storage_with_the_model() -> Result<()> {
    let device = Device::Cpu;
    let model = DecoderModel::new(build_config(), device)?;
    let params = model.parameters();
    assert!(!params.is_empty());

    let first = params[0].1.as_tensor().clone();
    let again = model.parameters();
    // Same tensor identity on every enumeration.
    assert_eq!(first.id(), again[0].1.as_tensor().id());
    Ok(())
}

#[test]
fn rejects_sequences_beyond_max_len() -> Result<()> {
    let device = Device::Cpu;
    let model = DecoderModel::new(build_config(), device.clone())?;
    let ids: Vec<i64> = (0..10).collect();
    let token_ids = Tensor::from_slice(&ids, (1, 10), &device)?;
    let mask = causal_mask(1, 10, &device)?;
    assert!(model.forward(&token_ids, false, &mask).is_err());
    Ok(())
}
