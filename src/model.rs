use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{linear_no_bias, Embedding, Init, Linear, VarBuilder};
use crate::config::ModelConfig;

/// A causal language model the trainer can drive.
///
/// The trainer never looks inside the model: it only needs logits for a batch
/// of token ids, and the parameters live in the `VarMap` the model was built
/// from.
pub trait LanguageModel {
    /// `input_ids` is `(batch, seq)` u32; returns `(batch, seq, vocab)` logits
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;
}

/// Mean token-level cross entropy between logits and next-token targets
pub fn token_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (b_sz, seq_len, vocab) = logits.dims3()?;
    let logits = logits.reshape((b_sz * seq_len, vocab))?.to_dtype(DType::F32)?;
    let targets = targets.reshape(b_sz * seq_len)?;
    candle_nn::loss::cross_entropy(&logits, &targets)
}

// --- RMSNorm (more efficient than LayerNorm for LLMs) ---

struct RmsNorm {
    scale: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let scale = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        Ok(Self { scale, eps })
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();

        let x = x.to_dtype(DType::F32)?;
        let variance = x.powf(2.)?.mean_keepdim(D::Minus1)?;
        let x_normed = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;

        x_normed.to_dtype(x_dtype)?.broadcast_mul(&self.scale)
    }
}

// --- Rotary Positional Embeddings (RoPE) ---

struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(dim: usize, max_seq_len: usize, theta: f32, device: &Device) -> Result<Self> {
        let theta = theta as f64;
        let inv_freq: Vec<_> = (0..dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / dim as f64)) as f32)
            .collect();

        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;

        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;

        let freqs = t.matmul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            sin: emb.sin()?,
            cos: emb.cos()?,
        })
    }

    /// Rotate `x` of shape `(B, H, Seq, D)`
    fn apply(&self, x: &Tensor, seq_len: usize) -> Result<Tensor> {
        let dtype = x.dtype();

        // (seq_len, head_dim) -> (1, 1, seq_len, head_dim)
        let cos = self.cos.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?.to_dtype(dtype)?;
        let sin = self.sin.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?.to_dtype(dtype)?;

        let rotated = Self::rotate_half(x)?;
        x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?
    }

    fn rotate_half(x: &Tensor) -> Result<Tensor> {
        let last_dim = x.dim(D::Minus1)?;
        let x1 = x.narrow(D::Minus1, 0, last_dim / 2)?;
        let x2 = x.narrow(D::Minus1, last_dim / 2, last_dim / 2)?;
        Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)
    }
}

// --- Causal Self Attention with Grouped Query Attention ---

struct CausalSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
    max_seq_len: usize,
    rope: RotaryEmbedding,
    // Cached causal mask (avoids recomputation)
    causal_mask_cache: std::cell::RefCell<Option<Tensor>>,
}

impl CausalSelfAttention {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let head_dim = cfg.hidden_size / cfg.num_heads;
        let scale = 1.0 / (head_dim as f64).sqrt();

        let kv_heads = cfg.kv_heads.unwrap_or(cfg.num_heads);
        let kv_size = kv_heads * head_dim;

        let rope = RotaryEmbedding::new(head_dim, cfg.max_seq_len, cfg.rope_theta, vb.device())?;

        Ok(Self {
            q_proj: linear_no_bias(cfg.hidden_size, cfg.hidden_size, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(cfg.hidden_size, kv_size, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(cfg.hidden_size, kv_size, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(cfg.hidden_size, cfg.hidden_size, vb.pp("o_proj"))?,
            num_heads: cfg.num_heads,
            num_kv_heads: kv_heads,
            head_dim,
            scale,
            max_seq_len: cfg.max_seq_len,
            rope,
            causal_mask_cache: std::cell::RefCell::new(None),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len, _hidden) = x.dims3()?;
        if seq_len > self.max_seq_len {
            return Err(candle_core::Error::Msg(format!(
                "sequence length {} exceeds max_seq_len {}",
                seq_len, self.max_seq_len
            )));
        }

        // Q: [B, Seq, H, D] -> [B, H, Seq, D]
        let q = self
            .q_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        // K, V: [B, Seq, KV_H, D] -> [B, KV_H, Seq, D]
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = self.rope.apply(&q, seq_len)?;
        let k = self.rope.apply(&k, seq_len)?;

        // Expand K and V for Grouped Query Attention if needed
        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let att_scores = (q.matmul(&k.t()?)? * self.scale)?;
        let mask = self
            .causal_mask(seq_len, att_scores.device())?
            .to_dtype(att_scores.dtype())?;
        let att_scores = att_scores.broadcast_add(&mask)?;

        let att_weights = candle_nn::ops::softmax_last_dim(&att_scores)?;
        let output = att_weights.matmul(&v)?;

        // [B, H, Seq, D] -> [B, Seq, H, D] -> [B, Seq, Hidden]
        let output = output
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, self.num_heads * self.head_dim))?;

        self.o_proj.forward(&output)
    }

    fn causal_mask(&self, seq_len: usize, device: &Device) -> Result<Tensor> {
        let mut cache = self.causal_mask_cache.borrow_mut();

        if let Some(ref mask) = *cache {
            if mask.dims()[2] == seq_len {
                return Ok(mask.clone());
            }
        }

        let mask: Vec<_> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();

        let mask_tensor = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?;
        *cache = Some(mask_tensor.clone());

        Ok(mask_tensor)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b_sz, n_kv_heads, seq_len, head_dim) = x.dims4()?;
    x.unsqueeze(2)?
        .expand((b_sz, n_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((b_sz, n_kv_heads * n_rep, seq_len, head_dim))
}

// --- MLP with SwiGLU Activation ---

struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let intermediate = cfg.intermediate_size.unwrap_or(hidden * 4);

        Ok(Self {
            gate_proj: linear_no_bias(hidden, intermediate, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden, intermediate, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(intermediate, hidden, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // SwiGLU: silu(gate) * up
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

// --- Decoder block: pre-norm attention and MLP with residuals ---

struct Block {
    input_layernorm: RmsNorm,
    self_attn: CausalSelfAttention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl Block {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            input_layernorm: RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            self_attn: CausalSelfAttention::new(cfg, vb.pp("self_attn"))?,
            post_attention_layernorm: RmsNorm::new(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let residual = x;
        let h = self.self_attn.forward(&self.input_layernorm.forward(x)?)?;
        let x = (residual + h)?;

        let h = self.mlp.forward(&self.post_attention_layernorm.forward(&x)?)?;
        x + h
    }
}

// --- Llama decoder ---

pub struct Llama {
    embed_tokens: Embedding,
    layers: Vec<Block>,
    norm: RmsNorm,
    lm_head: Linear,
}

impl Llama {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;

        let mut layers = Vec::with_capacity(cfg.num_layers);
        for i in 0..cfg.num_layers {
            layers.push(Block::new(cfg, vb.pp(format!("layers.{}", i)))?);
        }

        let norm = RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;
        let lm_head = linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
        })
    }
}

impl LanguageModel for Llama {
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let mut x = self.embed_tokens.forward(input_ids)?;

        for layer in &self.layers {
            x = layer.forward(&x)?.contiguous()?;
        }

        let x = self.norm.forward(&x)?;
        self.lm_head.forward(&x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny() -> ModelConfig {
        ModelConfig {
            name: "test".to_string(),
            hidden_size: 16,
            num_layers: 2,
            num_heads: 4,
            kv_heads: Some(2),
            intermediate_size: Some(32),
            vocab_size: 50,
            max_seq_len: 8,
            rope_theta: 10000.0,
            rms_norm_eps: 1e-5,
        }
    }

    #[test]
    fn test_forward_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Llama::new(&tiny(), vb).unwrap();

        let ids = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 8]], &Device::Cpu).unwrap();
        let logits = model.forward(&ids).unwrap();
        assert_eq!(logits.dims(), &[2, 4, 50]);
    }

    #[test]
    fn test_causality() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Llama::new(&tiny(), vb).unwrap();

        let a = Tensor::new(&[[1u32, 2, 3, 4]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[1u32, 2, 3, 9]], &Device::Cpu).unwrap();
        let la = model.forward(&a).unwrap().narrow(1, 0, 3).unwrap();
        let lb = model.forward(&b).unwrap().narrow(1, 0, 3).unwrap();

        let diff = (la - lb).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-5, "earlier positions saw a later token: {}", diff);
    }

    #[test]
    fn test_sequence_longer_than_max_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Llama::new(&tiny(), vb).unwrap();
        let ids = Tensor::zeros((1, 9), DType::U32, &Device::Cpu).unwrap();
        assert!(model.forward(&ids).is_err());
    }

    #[test]
    fn test_cross_entropy_of_uniform_logits() {
        let logits = Tensor::zeros((2, 3, 8), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((2, 3), DType::U32, &Device::Cpu).unwrap();
        let loss = token_cross_entropy(&logits, &targets).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - (8f32).ln()).abs() < 1e-5);
    }

    #[test]
    fn test_parameters_registered_in_varmap() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _model = Llama::new(&tiny(), vb).unwrap();

        let data = varmap.data().lock().unwrap();
        // embed + norm + lm_head + 2 * (2 norms + 4 attn + 3 mlp)
        assert_eq!(data.len(), 3 + 2 * 9);
        let norm = data.get("norm.weight").unwrap().as_tensor().to_vec1::<f32>().unwrap();
        assert!(norm.iter().all(|&v| v == 1.0));
    }
}
