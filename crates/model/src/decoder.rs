//! Compact decoder-only transformer backing [`crate::SequenceModel`].

use candle_core::{bail, DType, Device, Result, Tensor, Var, D};
use candle_nn::ops;

use crate::{config::ModelConfig, ModelOutput, SequenceModel};

const INIT_STD: f32 = 0.02;
const NORM_EPS: f64 = 1e-5;
const MASK_PENALTY: f64 = -1e9;

struct Norm {
    scale: Var,
    bias: Var,
}

impl Norm {
    fn new(hidden_dim: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            scale: Var::ones(hidden_dim, DType::F32, device)?,
            bias: Var::zeros(hidden_dim, DType::F32, device)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = variance.affine(1.0, NORM_EPS)?.sqrt()?;
        centered
            .broadcast_div(&denom)?
            .broadcast_mul(self.scale.as_tensor())?
            .broadcast_add(self.bias.as_tensor())
    }
}

struct Block {
    attn_norm: Norm,
    wq: Var,
    wk: Var,
    wv: Var,
    wo: Var,
    ff_norm: Norm,
    w1: Var,
    b1: Var,
    w2: Var,
    b2: Var,
}

impl Block {
    fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let h = config.hidden_dim;
        let ff = config.ff_dim;
        Ok(Self {
            attn_norm: Norm::new(h, device)?,
            wq: Var::randn(0f32, INIT_STD, (h, h), device)?,
            wk: Var::randn(0f32, INIT_STD, (h, h), device)?,
            wv: Var::randn(0f32, INIT_STD, (h, h), device)?,
            wo: Var::randn(0f32, INIT_STD, (h, h), device)?,
            ff_norm: Norm::new(h, device)?,
            w1: Var::randn(0f32, INIT_STD, (h, ff), device)?,
            b1: Var::zeros(ff, DType::F32, device)?,
            w2: Var::randn(0f32, INIT_STD, (ff, h), device)?,
            b2: Var::zeros(h, DType::F32, device)?,
        })
    }
}

pub struct DecoderModel {
    config: ModelConfig,
    device: Device,
    token_embedding: Var,
    position_embedding: Var,
    blocks: Vec<Block>,
    final_norm: Norm,
    output: Var,
}

impl DecoderModel {
    pub fn new(config: ModelConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let token_embedding = Var::randn(
            0f32,
            INIT_STD,
            (config.vocab_size, config.hidden_dim),
            &device,
        )?;
        let position_embedding = Var::randn(
            0f32,
            INIT_STD,
            (config.max_seq_len, config.hidden_dim),
            &device,
        )?;
        let mut blocks = Vec::with_capacity(config.n_layers);
        for _ in 0..config.n_layers {
            blocks.push(Block::new(&config, &device)?);
        }
        let final_norm = Norm::new(config.hidden_dim, &device)?;
        let output = Var::randn(
            0f32,
            INIT_STD,
            (config.hidden_dim, config.vocab_size),
            &device,
        )?;
        Ok(Self {
            config,
            device,
            token_embedding,
            position_embedding,
            blocks,
            final_norm,
            output,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn attention(
        &self,
        block: &Block,
        hidden: &Tensor,
        attn_bias: &Tensor,
        training: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, seq, _) = hidden.dims3()?;
        let heads = self.config.n_heads;
        let head_dim = self.config.hidden_dim / heads;

        let project = |weight: &Var| -> Result<Tensor> {
            hidden
                .broadcast_matmul(weight.as_tensor())?
                .reshape((batch, seq, heads, head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };

        let q = project(&block.wq)?;
        let k = project(&block.wk)?;
        let v = project(&block.wv)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = q
            .matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?
            .affine(scale, 0.0)?;
        let scores = scores.broadcast_add(attn_bias)?;
        let weights = ops::softmax_last_dim(&scores)?;
        let weights = self.maybe_dropout(&weights, training)?;

        let context = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, self.config.hidden_dim))?;
        let out = context.broadcast_matmul(block.wo.as_tensor())?;
        Ok((out, weights))
    }

    fn feed_forward(&self, block: &Block, hidden: &Tensor, training: bool) -> Result<Tensor> {
        let y = hidden
            .broadcast_matmul(block.w1.as_tensor())?
            .broadcast_add(block.b1.as_tensor())?
            .gelu()?
            .broadcast_matmul(block.w2.as_tensor())?
            .broadcast_add(block.b2.as_tensor())?;
        self.maybe_dropout(&y, training)
    }

    fn maybe_dropout(&self, x: &Tensor, training: bool) -> Result<Tensor> {
        match self.config.dropout_p {
            Some(p) if training && p > 0.0 => ops::dropout(x, p),
            _ => Ok(x.clone()),
        }
    }
}

impl SequenceModel for DecoderModel {
    fn forward(&self, input_ids: &Tensor, training: bool, mask: &Tensor) -> Result<ModelOutput> {
        let (batch, seq) = input_ids.dims2()?;
        if seq > self.config.max_seq_len {
            bail!(
                "sequence length {} exceeds max_seq_len {}",
                seq,
                self.config.max_seq_len
            );
        }

        let ids = input_ids.to_dtype(DType::U32)?.reshape((batch * seq,))?;
        let mut hidden = self
            .token_embedding
            .as_tensor()
            .index_select(&ids, 0)?
            .reshape((batch, seq, self.config.hidden_dim))?;
        let positions = self
            .position_embedding
            .as_tensor()
            .narrow(0, 0, seq)?
            .unsqueeze(0)?;
        hidden = hidden.broadcast_add(&positions)?;

        // 1.0 = disallowed edge, turned into a large negative score bias.
        let attn_bias = mask.affine(MASK_PENALTY, 0.0)?;

        let mut attentions = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let normed = block.attn_norm.forward(&hidden)?;
            let (attn_out, weights) = self.attention(block, &normed, &attn_bias, training)?;
            hidden = (hidden + attn_out)?;

            let normed = block.ff_norm.forward(&hidden)?;
            let ff_out = self.feed_forward(block, &normed, training)?;
            hidden = (hidden + ff_out)?;

            attentions.push(weights);
        }

        let normalized = self.final_norm.forward(&hidden)?;
        let logits = normalized.broadcast_matmul(self.output.as_tensor())?;
        Ok(ModelOutput { logits, attentions })
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        let mut params = vec![
            ("token_embedding".to_string(), self.token_embedding.clone()),
            (
                "position_embedding".to_string(),
                self.position_embedding.clone(),
            ),
        ];
        for (layer, block) in self.blocks.iter().enumerate() {
            let mut push = |suffix: &str, var: &Var| {
                params.push((format!("block_{layer}.{suffix}"), var.clone()));
            };
            push("attn_norm.scale", &block.attn_norm.scale);
            push("attn_norm.bias", &block.attn_norm.bias);
            push("wq", &block.wq);
            push("wk", &block.wk);
            push("wv", &block.wv);
            push("wo", &block.wo);
            push("ff_norm.scale", &block.ff_norm.scale);
            push("ff_norm.bias", &block.ff_norm.bias);
            push("w1", &block.w1);
            push("b1", &block.b1);
            push("w2", &block.w2);
            push("b2", &block.b2);
        }
        params.push(("final_norm.scale".to_string(), self.final_norm.scale.clone()));
        params.push(("final_norm.bias".to_string(), self.final_norm.bias.clone()));
        params.push(("output".to_string(), self.output.clone()));
        params
    }
}
