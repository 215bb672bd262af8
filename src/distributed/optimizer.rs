//! Sharded AdamW Optimizer
//!
//! An AdamW implementation that works with explicitly provided gradients for
//! the parameter shards owned by this device. Moment buffers exist only for
//! owned shards, so inner optimizer state is split across the local group.
//!
//! # Why a Custom Optimizer?
//!
//! Candle's built-in AdamW takes a `GradStore` which is opaque and keyed by the
//! full parameters. Here the update runs on shard-local gradients after they
//! have been reduced across the local group and clipped, so the optimizer takes
//! explicit `(name, shard, gradient)` triples instead.

use candle_core::{DType, Result, Tensor, Var};
use std::collections::HashMap;

/// Shard gradient: parameter name, owned shard and its reduced gradient
pub type ShardGradient = (String, Var, Tensor);

/// AdamW optimizer configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    /// Learning rate
    pub lr: f64,
    /// Beta1 (first moment decay)
    pub beta1: f64,
    /// Beta2 (second moment decay)
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 4e-4,
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-8,
            weight_decay: 0.1,
        }
    }
}

impl AdamWConfig {
    /// Create config from learning rate with default betas
    pub fn with_lr(lr: f64) -> Self {
        Self { lr, ..Default::default() }
    }
}

/// Sharded AdamW optimizer
///
/// # AdamW Algorithm
///
/// For each parameter shard θ with gradient g:
/// ```text
/// m = β₁ * m + (1 - β₁) * g           # Update biased first moment
/// v = β₂ * v + (1 - β₂) * g²          # Update biased second moment
/// m̂ = m / (1 - β₁ᵗ)                   # Bias-corrected first moment
/// v̂ = v / (1 - β₂ᵗ)                   # Bias-corrected second moment
/// θ = θ - lr * (m̂ / (√v̂ + ε) + λ * θ) # Update with weight decay
/// ```
pub struct ShardedAdamW {
    /// First moment estimates (m)
    m: HashMap<String, Tensor>,
    /// Second moment estimates (v)
    v: HashMap<String, Tensor>,
    /// Configuration
    config: AdamWConfig,
    /// Current step (for bias correction)
    step_count: usize,
}

impl ShardedAdamW {
    /// Create a new optimizer over the owned shards
    ///
    /// # Arguments
    ///
    /// * `shards` - `(name, shard)` pairs this device updates
    /// * `config` - Optimizer configuration
    pub fn new<'a>(shards: impl IntoIterator<Item = (&'a str, &'a Var)>, config: AdamWConfig) -> Result<Self> {
        let mut m = HashMap::new();
        let mut v = HashMap::new();

        // Initialize moment buffers to zeros
        for (name, var) in shards {
            let tensor = var.as_tensor();
            let zeros = Tensor::zeros(tensor.shape(), tensor.dtype(), tensor.device())?;
            m.insert(name.to_string(), zeros.clone());
            v.insert(name.to_string(), zeros);
        }

        Ok(Self {
            m,
            v,
            config,
            step_count: 0,
        })
    }

    /// Perform an optimizer step with reduced shard gradients
    pub fn step(&mut self, shard_grads: &[ShardGradient]) -> Result<()> {
        self.step_count += 1;
        let t = self.step_count as f64;

        // Bias correction terms
        let bias_correction1 = 1.0 - self.config.beta1.powf(t);
        let bias_correction2 = 1.0 - self.config.beta2.powf(t);

        for (name, var, grad) in shard_grads {
            let m_t = self.m.get_mut(name).ok_or_else(|| {
                candle_core::Error::Msg(format!("Unknown parameter shard: {}", name))
            })?;
            let v_t = self.v.get_mut(name).ok_or_else(|| {
                candle_core::Error::Msg(format!("Unknown parameter shard: {}", name))
            })?;

            let grad = grad.to_device(var.device())?.to_dtype(var.dtype())?;

            // m = β₁ * m + (1 - β₁) * g
            let new_m = ((&*m_t * self.config.beta1)? + (&grad * (1.0 - self.config.beta1))?)?;

            // v = β₂ * v + (1 - β₂) * g²
            let new_v = ((&*v_t * self.config.beta2)? + (grad.sqr()? * (1.0 - self.config.beta2))?)?;

            *m_t = new_m.clone();
            *v_t = new_v.clone();

            // Bias-corrected moments
            let m_hat = (&new_m / bias_correction1)?;
            let v_hat = (&new_v / bias_correction2)?;

            // lr * (m̂ / (√v̂ + ε))
            let adam_update = (m_hat.div(&(v_hat.sqrt()? + self.config.eps)?)? * self.config.lr)?;

            // Decoupled weight decay: lr * λ * θ
            let param = var.as_tensor();
            let weight_decay_update = (param * (self.config.lr * self.config.weight_decay))?;

            let new_param = param.sub(&adam_update)?.sub(&weight_decay_update)?;
            var.set(&new_param)?;
        }

        Ok(())
    }

    /// Get the current step count
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Get the learning rate
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

/// Sum of squared gradient elements, accumulated in f64
pub fn grad_norm_sq(shard_grads: &[ShardGradient]) -> Result<f64> {
    let mut total_norm_sq = 0.0f64;

    for (_, _, grad) in shard_grads {
        total_norm_sq += grad
            .sqr()?
            .sum_all()?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;
    }

    Ok(total_norm_sq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap()
    }

    #[test]
    fn test_adamw_config_default() {
        let config = AdamWConfig::default();
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.95);
        assert_eq!(config.weight_decay, 0.1);
    }

    #[test]
    fn test_adamw_config_with_lr() {
        let config = AdamWConfig::with_lr(1e-4);
        assert_eq!(config.lr, 1e-4);
        assert_eq!(config.beta1, 0.9); // Default
    }

    #[test]
    fn test_first_step_moves_by_lr_against_gradient_sign() {
        // With bias correction, step 1 gives m̂/√v̂ = sign(g)
        let shard = var(&[1.0, -2.0]);
        let config = AdamWConfig { lr: 0.1, weight_decay: 0.0, ..Default::default() };
        let mut opt = ShardedAdamW::new([("w", &shard)], config).unwrap();

        let grad = Tensor::new(&[0.5f32, -3.0], &Device::Cpu).unwrap();
        opt.step(&[("w".to_string(), shard.clone(), grad)]).unwrap();

        let updated = shard.as_tensor().to_vec1::<f32>().unwrap();
        assert!((updated[0] - 0.9).abs() < 1e-5);
        assert!((updated[1] - -1.9).abs() < 1e-5);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_weight_decay_shrinks_with_zero_gradient() {
        let shard = var(&[2.0]);
        let config = AdamWConfig { lr: 0.5, weight_decay: 0.1, ..Default::default() };
        let mut opt = ShardedAdamW::new([("w", &shard)], config).unwrap();

        let grad = Tensor::new(&[0.0f32], &Device::Cpu).unwrap();
        opt.step(&[("w".to_string(), shard.clone(), grad)]).unwrap();

        // 2.0 - 0.5 * 0.1 * 2.0
        let updated = shard.as_tensor().to_vec1::<f32>().unwrap();
        assert!((updated[0] - 1.9).abs() < 1e-5);
    }

    #[test]
    fn test_unknown_shard_rejected() {
        let shard = var(&[1.0]);
        let mut opt = ShardedAdamW::new([("w", &shard)], AdamWConfig::default()).unwrap();
        let grad = Tensor::new(&[1.0f32], &Device::Cpu).unwrap();
        assert!(opt.step(&[("other".to_string(), shard.clone(), grad)]).is_err());
    }

    #[test]
    fn test_grad_norm_sq() {
        let shard = var(&[0.0, 0.0]);
        let g1 = Tensor::new(&[3.0f32, 0.0], &Device::Cpu).unwrap();
        let g2 = Tensor::new(&[0.0f32, 4.0], &Device::Cpu).unwrap();
        let grads = vec![("a".to_string(), shard.clone(), g1), ("b".to_string(), shard, g2)];
        assert!((grad_norm_sq(&grads).unwrap() - 25.0).abs() < 1e-9);
    }
}
