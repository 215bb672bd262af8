//! Sharded data-parallel model replica
//!
//! Every parameter is flattened, zero-padded to a multiple of the local group
//! size and split into equal chunks; local rank `r` owns chunk `r`, the
//! gradient for it and the inner optimizer state for it. The model itself
//! always computes with full-size parameters, so before a forward pass the
//! owned chunks are all-gathered back into the model's variables.
//!
//! # Gradient flow
//!
//! ```text
//! forward_backward(communicate=false)  full local grad -> pending (no communication)
//! forward_backward(communicate=true)   pending + grad -> reduce-scatter(avg) -> shard grad
//! clip_gradients                       global norm over shard grads
//! optimizer_step                       AdamW on owned shards, then regather per strategy
//! ```
//!
//! `NO_SHARD` keeps the same flow with a single chunk: gradients are
//! all-reduced and every device updates the full parameter.

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::VarMap;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::data::Batch;
use crate::distributed::optimizer::{grad_norm_sq, AdamWConfig, ShardGradient, ShardedAdamW};
use crate::distributed::sync::{all_gather_tensor, all_reduce_tensor, broadcast_tensor, reduce_scatter_tensor};
use crate::distributed::{ProcessGroup, ReduceOp};
use crate::model::{token_cross_entropy, LanguageModel};

/// How parameters are distributed across the local group
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ShardingStrategy {
    /// Shard parameters, gradients and optimizer state; regather lazily before forward
    #[default]
    #[serde(rename = "FULL_SHARD")]
    FullShard,
    /// Shard gradients and optimizer state; regather right after each step
    #[serde(rename = "SHARD_GRAD_OP")]
    ShardGradOp,
    /// Replicate everything; gradients are all-reduced
    #[serde(rename = "NO_SHARD")]
    NoShard,
}

impl ShardingStrategy {
    pub fn is_sharded(&self) -> bool {
        !matches!(self, ShardingStrategy::NoShard)
    }
}

impl std::str::FromStr for ShardingStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "FULL_SHARD" => Ok(ShardingStrategy::FullShard),
            "SHARD_GRAD_OP" => Ok(ShardingStrategy::ShardGradOp),
            "NO_SHARD" => Ok(ShardingStrategy::NoShard),
            _ => Err(format!(
                "Unknown sharding strategy: {}. Valid options: FULL_SHARD, SHARD_GRAD_OP, NO_SHARD",
                s
            )),
        }
    }
}

/// Position of one device's chunk within a flattened parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    /// Elements in the unpadded parameter
    pub numel: usize,
    /// Elements per chunk (`ceil(numel / num_shards)`)
    pub shard_len: usize,
    pub num_shards: usize,
    pub shard_index: usize,
}

impl ShardLayout {
    pub fn new(numel: usize, num_shards: usize, shard_index: usize) -> Self {
        Self {
            numel,
            shard_len: numel.div_ceil(num_shards),
            num_shards,
            shard_index,
        }
    }

    pub fn padded_len(&self) -> usize {
        self.shard_len * self.num_shards
    }

    /// Flatten and zero-pad `full` to `padded_len`
    pub fn pad(&self, full: &Tensor) -> Result<Tensor> {
        let flat = full.flatten_all()?;
        let padding = self.padded_len() - self.numel;
        if padding == 0 {
            return Ok(flat);
        }
        let zeros = Tensor::zeros(padding, flat.dtype(), flat.device())?;
        Tensor::cat(&[&flat, &zeros], 0)
    }

    /// This device's chunk of `full`
    pub fn split(&self, full: &Tensor) -> Result<Tensor> {
        self.pad(full)?
            .narrow(0, self.shard_index * self.shard_len, self.shard_len)?
            .contiguous()
    }

    /// Reassemble the full flat parameter from every chunk, in shard order
    pub fn join(&self, chunks: &[Tensor]) -> Result<Tensor> {
        Tensor::cat(chunks, 0)?.narrow(0, 0, self.numel)
    }
}

struct ParamSlot {
    name: String,
    /// The model's variable, full shape, used for forward
    full: Var,
    /// Owned chunk (flat); for `NO_SHARD` the whole flattened parameter
    shard: Var,
    layout: ShardLayout,
    /// Local full-size gradients from deferred micro-steps, flat and padded
    pending: Option<Tensor>,
    /// Reduced gradient for the owned chunk
    grad: Option<Tensor>,
}

/// The model as seen by one device of the local group
pub struct ShardedModelReplica {
    model: Box<dyn LanguageModel>,
    slots: Vec<ParamSlot>,
    optimizer: ShardedAdamW,
    local: Arc<dyn ProcessGroup>,
    strategy: ShardingStrategy,
    gradient_accumulation_steps: usize,
    device: Device,
    /// Full parameters no longer reflect the shards
    stale: bool,
}

impl ShardedModelReplica {
    /// Wrap `model`, whose variables all live in `varmap`.
    ///
    /// Collective: every member of both groups must call this. All replicas
    /// adopt the parameters of global rank 0 (broadcast over the global group,
    /// then over the local group) before the shards are cut.
    pub fn new(
        varmap: &VarMap,
        model: Box<dyn LanguageModel>,
        local: Arc<dyn ProcessGroup>,
        global: &dyn ProcessGroup,
        strategy: ShardingStrategy,
        gradient_accumulation_steps: usize,
        adamw: AdamWConfig,
    ) -> Result<Self> {
        if gradient_accumulation_steps == 0 {
            return Err(candle_core::Error::Msg("gradient_accumulation_steps must be positive".to_string()));
        }

        let mut named: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("VarMap lock poisoned".to_string()))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        // Every rank must walk parameters in the same order
        named.sort_by(|a, b| a.0.cmp(&b.0));

        let device = named
            .first()
            .map(|(_, var)| var.device().clone())
            .ok_or_else(|| candle_core::Error::Msg("model has no parameters".to_string()))?;

        let (num_shards, shard_index) = if strategy.is_sharded() {
            (local.size(), local.rank())
        } else {
            (1, 0)
        };

        let mut slots = Vec::with_capacity(named.len());
        for (name, full) in named {
            let value = broadcast_tensor(global, full.as_tensor(), 0)?;
            let value = broadcast_tensor(local.as_ref(), &value, 0)?;
            full.set(&value)?;

            let layout = ShardLayout::new(value.elem_count(), num_shards, shard_index);
            let shard = Var::from_tensor(&layout.split(&value)?)?;
            slots.push(ParamSlot {
                name,
                full,
                shard,
                layout,
                pending: None,
                grad: None,
            });
        }

        let optimizer = ShardedAdamW::new(slots.iter().map(|s| (s.name.as_str(), &s.shard)), adamw)?;

        debug!(
            "{}: {} parameters sharded {}-way ({:?})",
            local.name(),
            slots.len(),
            num_shards,
            strategy
        );

        Ok(Self {
            model,
            slots,
            optimizer,
            local,
            strategy,
            gradient_accumulation_steps,
            device,
            stale: false,
        })
    }

    /// The group this replica is sharded over
    pub fn local_group(&self) -> Arc<dyn ProcessGroup> {
        Arc::clone(&self.local)
    }

    pub fn gradient_accumulation_steps(&self) -> usize {
        self.gradient_accumulation_steps
    }

    /// Parameter names in the order used by snapshots
    pub fn parameter_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }

    /// Inner optimizer steps taken so far
    pub fn optimizer_steps(&self) -> usize {
        self.optimizer.step_count()
    }

    /// Rebuild full parameters from the shards if they are stale (collective)
    pub fn ensure_gathered(&mut self) -> Result<()> {
        if !self.stale {
            return Ok(());
        }

        for slot in &self.slots {
            let flat = if self.strategy.is_sharded() {
                let chunks = all_gather_tensor(self.local.as_ref(), slot.shard.as_tensor())?;
                slot.layout.join(&chunks)?
            } else {
                slot.shard.as_tensor().clone()
            };
            slot.full.set(&flat.reshape(slot.full.shape())?)?;
        }

        self.stale = false;
        Ok(())
    }

    /// Run one micro-step: forward, loss scaled by `1 / gradient_accumulation_steps`,
    /// backward.
    ///
    /// With `communicate == false` the local gradients are only accumulated;
    /// with `communicate == true` everything accumulated so far is averaged
    /// across the local group into the owned shard gradients. Returns the
    /// scaled loss, so summing over one inner step's micro-steps gives the
    /// mean loss.
    pub fn forward_backward(&mut self, batch: &Batch, communicate: bool) -> Result<f64> {
        self.ensure_gathered()?;

        let inputs = batch.inputs.to_device(&self.device)?;
        let targets = batch.targets.to_device(&self.device)?;

        let logits = self.model.forward(&inputs)?;
        let loss = (token_cross_entropy(&logits, &targets)? / self.gradient_accumulation_steps as f64)?;
        let grads = loss.backward()?;

        for slot in self.slots.iter_mut() {
            let grad = match grads.get(slot.full.as_tensor()) {
                Some(g) => slot.layout.pad(g)?,
                None => Tensor::zeros(slot.layout.padded_len(), slot.full.dtype(), &self.device)?,
            };
            slot.pending = Some(match slot.pending.take() {
                Some(acc) => (acc + grad)?,
                None => grad,
            });
        }

        if communicate {
            self.reduce_pending()?;
        }

        loss.to_dtype(DType::F64)?.to_scalar::<f64>()
    }

    /// Average pending local gradients across the local group into the shard grads
    fn reduce_pending(&mut self) -> Result<()> {
        for slot in self.slots.iter_mut() {
            let Some(pending) = slot.pending.take() else {
                continue;
            };
            let reduced = if self.strategy.is_sharded() {
                reduce_scatter_tensor(self.local.as_ref(), &pending, ReduceOp::Avg)?
            } else {
                all_reduce_tensor(self.local.as_ref(), &pending, ReduceOp::Avg)?
            };
            slot.grad = Some(match slot.grad.take() {
                Some(acc) => (acc + reduced)?,
                None => reduced,
            });
        }
        Ok(())
    }

    fn shard_gradients(&self) -> Vec<ShardGradient> {
        self.slots
            .iter()
            .filter_map(|s| s.grad.as_ref().map(|g| (s.name.clone(), s.shard.clone(), g.clone())))
            .collect()
    }

    /// Clip the global gradient norm to `max_norm` in place; returns the
    /// norm before clipping.
    ///
    /// Collective for sharded strategies: each device only holds the squares
    /// of its own chunks.
    pub fn clip_gradients(&mut self, max_norm: f64) -> Result<f64> {
        self.reduce_pending()?;

        let local_sq = grad_norm_sq(&self.shard_gradients())?;
        let total_sq = if self.strategy.is_sharded() {
            self.local.all_reduce_host(&[local_sq as f32], ReduceOp::Sum)?[0] as f64
        } else {
            local_sq
        };
        let total_norm = total_sq.sqrt();

        let clip_coef = max_norm / (total_norm + 1e-6);
        if clip_coef < 1.0 {
            for slot in self.slots.iter_mut() {
                if let Some(grad) = slot.grad.take() {
                    slot.grad = Some((grad * clip_coef)?);
                }
            }
        }

        Ok(total_norm)
    }

    /// Apply the inner optimizer to the owned shards at learning rate `lr`
    pub fn optimizer_step(&mut self, lr: f64) -> Result<()> {
        self.reduce_pending()?;

        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&self.shard_gradients())?;
        self.stale = true;

        match self.strategy {
            ShardingStrategy::FullShard => Ok(()),
            ShardingStrategy::ShardGradOp | ShardingStrategy::NoShard => self.ensure_gathered(),
        }
    }

    /// Drop every accumulated gradient
    pub fn zero_grad(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.pending = None;
            slot.grad = None;
        }
    }

    /// Full value of every parameter, copied to host memory (collective if the
    /// full parameters are stale)
    pub fn snapshot_full_parameters(&mut self) -> Result<Vec<Tensor>> {
        self.ensure_gathered()?;
        self.slots
            .iter()
            .map(|s| s.full.as_tensor().to_device(&Device::Cpu)?.copy())
            .collect()
    }

    /// Overwrite every parameter with `values` (same order and shapes as
    /// [`Self::snapshot_full_parameters`]) and re-cut the owned shards
    pub fn apply_full_parameters(&mut self, values: &[Tensor]) -> Result<()> {
        if values.len() != self.slots.len() {
            return Err(candle_core::Error::Msg(format!(
                "expected {} parameter values, got {}",
                self.slots.len(),
                values.len()
            )));
        }

        for (slot, value) in self.slots.iter().zip(values) {
            if value.dims() != slot.full.dims() {
                return Err(candle_core::Error::Msg(format!(
                    "shape mismatch for {}: expected {:?}, got {:?}",
                    slot.name,
                    slot.full.dims(),
                    value.dims()
                )));
            }
            let value = value.to_device(&self.device)?.to_dtype(slot.full.dtype())?;
            slot.full.set(&value)?;
            slot.shard.set(&slot.layout.split(&value)?)?;
        }

        self.stale = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::data::{FakeTokenSource, TokenSource};
    use crate::distributed::ThreadGroup;
    use crate::model::Llama;
    use candle_nn::VarBuilder;
    use std::thread;

    fn tiny_model() -> ModelConfig {
        ModelConfig {
            name: "test".to_string(),
            hidden_size: 8,
            num_layers: 1,
            num_heads: 2,
            kv_heads: Some(1),
            intermediate_size: Some(12),
            vocab_size: 30,
            max_seq_len: 8,
            rope_theta: 10000.0,
            rms_norm_eps: 1e-5,
        }
    }

    fn build(
        local: Arc<dyn ProcessGroup>,
        global: &dyn ProcessGroup,
        strategy: ShardingStrategy,
        grad_acc: usize,
    ) -> ShardedModelReplica {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Llama::new(&tiny_model(), vb).unwrap();
        ShardedModelReplica::new(&varmap, Box::new(model), local, global, strategy, grad_acc, AdamWConfig::with_lr(1e-2))
            .unwrap()
    }

    fn solo_groups() -> (Arc<dyn ProcessGroup>, ThreadGroup) {
        let local: Arc<dyn ProcessGroup> = Arc::new(ThreadGroup::create("local", 1).remove(0));
        (local, ThreadGroup::create("global", 1).remove(0))
    }

    fn max_abs_diff(a: &[Tensor], b: &[Tensor]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap())
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_layout_split_and_join() {
        let full = Tensor::arange(0f32, 7.0, &Device::Cpu).unwrap().reshape((7,)).unwrap();
        let layouts: Vec<_> = (0..3).map(|r| ShardLayout::new(7, 3, r)).collect();
        assert_eq!(layouts[0].shard_len, 3);
        assert_eq!(layouts[0].padded_len(), 9);

        let chunks: Vec<_> = layouts.iter().map(|l| l.split(&full).unwrap()).collect();
        assert_eq!(chunks[2].to_vec1::<f32>().unwrap(), vec![6.0, 0.0, 0.0]);

        let joined = layouts[0].join(&chunks).unwrap();
        assert_eq!(joined.to_vec1::<f32>().unwrap(), full.to_vec1::<f32>().unwrap());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("FULL_SHARD".parse::<ShardingStrategy>().unwrap(), ShardingStrategy::FullShard);
        assert_eq!("shard-grad-op".parse::<ShardingStrategy>().unwrap(), ShardingStrategy::ShardGradOp);
        assert_eq!("NO_SHARD".parse::<ShardingStrategy>().unwrap(), ShardingStrategy::NoShard);
        assert!("HYBRID".parse::<ShardingStrategy>().is_err());
        let yaml: ShardingStrategy = serde_yaml::from_str("SHARD_GRAD_OP").unwrap();
        assert_eq!(yaml, ShardingStrategy::ShardGradOp);
    }

    #[test]
    fn test_apply_then_snapshot_round_trips() {
        let (local, global) = solo_groups();
        let mut replica = build(local, &global, ShardingStrategy::FullShard, 1);

        let original = replica.snapshot_full_parameters().unwrap();
        let shifted: Vec<Tensor> = original.iter().map(|t| (t + 0.25).unwrap()).collect();
        replica.apply_full_parameters(&shifted).unwrap();

        let back = replica.snapshot_full_parameters().unwrap();
        assert_eq!(max_abs_diff(&back, &shifted), 0.0);
        assert!(replica.apply_full_parameters(&shifted[1..]).is_err());
    }

    #[test]
    fn test_clip_scales_to_max_norm() {
        let (local, global) = solo_groups();
        let mut replica = build(local, &global, ShardingStrategy::NoShard, 1);
        let batch = FakeTokenSource::new(30, 2, 6, 1).next_host_batch().unwrap().to_device(&Device::Cpu).unwrap();

        replica.forward_backward(&batch, true).unwrap();
        let norm = replica.clip_gradients(1e-3).unwrap();
        assert!(norm > 1e-3);

        let clipped = grad_norm_sq(&replica.shard_gradients()).unwrap().sqrt();
        assert!((clipped - 1e-3).abs() < 1e-5);
    }

    #[test]
    fn test_deferred_accumulation_matches_immediate() {
        // Two micro-steps: deferred-then-communicate vs communicate every time
        let (local, global) = solo_groups();
        let mut deferred = build(local, &global, ShardingStrategy::FullShard, 2);
        let (local, global) = solo_groups();
        let mut immediate = build(local, &global, ShardingStrategy::FullShard, 2);
        let init = deferred.snapshot_full_parameters().unwrap();
        immediate.apply_full_parameters(&init).unwrap();

        let mut source = FakeTokenSource::new(30, 2, 6, 5);
        let batches: Vec<Batch> = (0..2)
            .map(|_| source.next_host_batch().unwrap().to_device(&Device::Cpu).unwrap())
            .collect();

        let mut loss_a = 0.0;
        let mut loss_b = 0.0;
        for (i, batch) in batches.iter().enumerate() {
            loss_a += deferred.forward_backward(batch, i == 1).unwrap();
            loss_b += immediate.forward_backward(batch, true).unwrap();
        }
        assert!((loss_a - loss_b).abs() < 1e-6);

        for replica in [&mut deferred, &mut immediate] {
            replica.clip_gradients(1.0).unwrap();
            replica.optimizer_step(1e-2).unwrap();
            replica.zero_grad();
        }

        let a = deferred.snapshot_full_parameters().unwrap();
        let b = immediate.snapshot_full_parameters().unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-5);
    }

    /// Two devices sharing one node; returns each device's parameters after one step
    fn two_device_step(strategy: ShardingStrategy) -> Vec<Vec<Tensor>> {
        let handles: Vec<_> = ThreadGroup::create("local", 2)
            .into_iter()
            .map(|local| {
                thread::spawn(move || {
                    let rank = local.rank();
                    // Single node: every device is alone in its global group
                    let global = ThreadGroup::create("global", 1).remove(0);
                    let local: Arc<dyn ProcessGroup> = Arc::new(local);
                    let mut replica = build(local, &global, strategy, 1);

                    // Different data per device; gradients are averaged
                    let batch = FakeTokenSource::new(30, 2, 6, rank as u64)
                        .next_host_batch()
                        .unwrap()
                        .to_device(&Device::Cpu)
                        .unwrap();
                    replica.forward_backward(&batch, true).unwrap();
                    replica.clip_gradients(1.0).unwrap();
                    replica.optimizer_step(1e-2).unwrap();
                    replica.zero_grad();
                    replica.snapshot_full_parameters().unwrap()
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_local_group_stays_in_sync_for_every_strategy() {
        for strategy in [ShardingStrategy::FullShard, ShardingStrategy::ShardGradOp, ShardingStrategy::NoShard] {
            let params = two_device_step(strategy);
            assert_eq!(max_abs_diff(&params[0], &params[1]), 0.0, "{:?} diverged", strategy);
        }
    }
}
