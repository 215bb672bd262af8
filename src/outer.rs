//! Outer optimization across nodes
//!
//! Once per round every node contributes its pseudo-gradients to an
//! averaging all-reduce over the global group; a Nesterov momentum SGD step
//! then moves the offloaded parameters. All nodes start the round from the
//! same offloaded values and see the same averaged pseudo-gradients, so they
//! finish it with identical offloaded values.
//!
//! The devices of a node hold identical pseudo-gradients, so global group `r`
//! only averages chunk `r` of each one (the same chunking the replica uses).
//! The averaged chunks are then all-gathered over the local group, and every
//! node sends one copy of the model across the network per round.

use candle_core::{Result, Tensor};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

use crate::distributed::sync::{all_gather_tensor, all_reduce_tensor};
use crate::distributed::{ProcessGroup, ReduceOp};
use crate::offload::{OffloadedParameter, OffloadedParameterStore};
use crate::sharding::ShardLayout;

/// Outer optimizer configuration
#[derive(Debug, Clone)]
pub struct NesterovSgdConfig {
    pub lr: f64,
    pub momentum: f64,
    pub nesterov: bool,
}

impl NesterovSgdConfig {
    pub fn with_lr(lr: f64) -> Self {
        Self {
            lr,
            momentum: 0.9,
            nesterov: true,
        }
    }
}

/// SGD with momentum, no dampening and no weight decay
///
/// Update rules:
/// ```text
/// buf = g                     (first step)
/// buf = momentum * buf + g    (afterwards)
/// update = g + momentum * buf (nesterov)
/// update = buf                (standard)
/// param = param - lr * update
/// ```
pub struct NesterovSgd {
    config: NesterovSgdConfig,
    /// Momentum buffers keyed by parameter name
    buffers: HashMap<String, Tensor>,
}

impl NesterovSgd {
    pub fn new(config: NesterovSgdConfig) -> Self {
        Self {
            config,
            buffers: HashMap::new(),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    /// Step every parameter that carries a pseudo-gradient
    pub fn step(&mut self, params: &mut [OffloadedParameter]) -> Result<()> {
        let momentum = self.config.momentum;

        for param in params.iter_mut() {
            let Some(grad) = param.pseudo_gradient.as_ref() else {
                continue;
            };

            let update = if momentum != 0.0 {
                let buf = match self.buffers.remove(&param.name) {
                    Some(buf) => ((buf * momentum)? + grad)?,
                    None => grad.copy()?,
                };
                let update = if self.config.nesterov {
                    (grad + (&buf * momentum)?)?
                } else {
                    buf.clone()
                };
                self.buffers.insert(param.name.clone(), buf);
                update
            } else {
                grad.clone()
            };

            param.value = param.value.sub(&(update * self.config.lr)?)?;
        }

        Ok(())
    }
}

/// Averages pseudo-gradients over the global group and applies the outer step
pub struct OuterSynchronizer {
    global: Arc<dyn ProcessGroup>,
    local: Arc<dyn ProcessGroup>,
    optimizer: NesterovSgd,
}

impl OuterSynchronizer {
    pub fn new(global: Arc<dyn ProcessGroup>, local: Arc<dyn ProcessGroup>, outer_lr: f64) -> Self {
        Self {
            global,
            local,
            optimizer: NesterovSgd::new(NesterovSgdConfig::with_lr(outer_lr)),
        }
    }

    /// Global average of `grad`, of which this device exchanges only its local chunk
    fn average(&self, grad: &Tensor) -> Result<Tensor> {
        if self.local.size() == 1 {
            return all_reduce_tensor(self.global.as_ref(), grad, ReduceOp::Avg);
        }

        let layout = ShardLayout::new(grad.elem_count(), self.local.size(), self.local.rank());
        let chunk = all_reduce_tensor(self.global.as_ref(), &layout.split(grad)?, ReduceOp::Avg)?;
        let chunks = all_gather_tensor(self.local.as_ref(), &chunk)?;
        layout.join(&chunks)?.reshape(grad.dims())
    }

    /// Collective over the global and local groups: every device must call
    /// this once per round.
    ///
    /// Expects pseudo-gradients already computed in `store`; leaves them cleared.
    pub fn synchronize(&mut self, store: &mut OffloadedParameterStore) -> Result<()> {
        for param in store.params_mut() {
            let Some(grad) = param.pseudo_gradient.take() else {
                return Err(candle_core::Error::Msg(format!(
                    "no pseudo-gradient for {} at outer synchronization",
                    param.name
                )));
            };
            param.pseudo_gradient = Some(self.average(&grad)?);
        }

        self.optimizer.step(store.params_mut())?;
        store.zero_pseudo_gradients();

        debug!(
            "{}: outer step applied to {} parameters (lr {})",
            self.global.name(),
            store.params().len(),
            self.optimizer.learning_rate()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{thread_grid, GroupHandle, ThreadGroup};
    use candle_core::Device;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn solo() -> GroupHandle {
        Arc::new(ThreadGroup::create("solo", 1).remove(0))
    }

    /// Counts the elements this member contributes to collectives
    struct CountingGroup {
        inner: GroupHandle,
        sent: AtomicUsize,
    }

    impl ProcessGroup for CountingGroup {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn rank(&self) -> usize {
            self.inner.rank()
        }

        fn size(&self) -> usize {
            self.inner.size()
        }

        fn all_gather_host(&self, data: &[f32]) -> Result<Vec<Vec<f32>>> {
            self.sent.fetch_add(data.len(), Ordering::SeqCst);
            self.inner.all_gather_host(data)
        }
    }

    fn param(value: &[f32], grad: &[f32]) -> OffloadedParameter {
        OffloadedParameter {
            name: "w".to_string(),
            value: Tensor::new(value, &Device::Cpu).unwrap(),
            pseudo_gradient: Some(Tensor::new(grad, &Device::Cpu).unwrap()),
        }
    }

    #[test]
    fn test_nesterov_matches_reference_updates() {
        let mut opt = NesterovSgd::new(NesterovSgdConfig::with_lr(0.5));
        let mut params = vec![param(&[1.0], &[1.0])];

        // Step 1: buf = 1, update = 1 + 0.9 = 1.9, p = 1 - 0.95 = 0.05
        opt.step(&mut params).unwrap();
        let p = params[0].value.to_vec1::<f32>().unwrap()[0];
        assert!((p - 0.05).abs() < 1e-6);

        // Step 2 with g = 1: buf = 1.9, update = 1 + 1.71 = 2.71, p = 0.05 - 1.355
        opt.step(&mut params).unwrap();
        let p = params[0].value.to_vec1::<f32>().unwrap()[0];
        assert!((p - (0.05 - 1.355)).abs() < 1e-5);
    }

    #[test]
    fn test_plain_momentum_and_skip_missing() {
        let config = NesterovSgdConfig {
            lr: 1.0,
            momentum: 0.9,
            nesterov: false,
        };
        let mut opt = NesterovSgd::new(config);
        let mut params = vec![param(&[0.0], &[2.0])];
        params.push(OffloadedParameter {
            name: "frozen".to_string(),
            value: Tensor::new(&[3.0f32], &Device::Cpu).unwrap(),
            pseudo_gradient: None,
        });

        opt.step(&mut params).unwrap();
        assert_eq!(params[0].value.to_vec1::<f32>().unwrap(), vec![-2.0]);
        assert_eq!(params[1].value.to_vec1::<f32>().unwrap(), vec![3.0]);
    }

    #[test]
    fn test_unit_lr_without_momentum_reaches_live_average() {
        // p - (p - mean(live)) == mean(live)
        let config = NesterovSgdConfig {
            lr: 1.0,
            momentum: 0.0,
            nesterov: false,
        };
        let mut opt = NesterovSgd::new(config);
        let mut params = vec![param(&[4.0, 4.0], &[1.0, -2.0])];
        opt.step(&mut params).unwrap();
        assert_eq!(params[0].value.to_vec1::<f32>().unwrap(), vec![3.0, 6.0]);
    }

    #[test]
    fn test_nodes_agree_after_synchronize() {
        let handles: Vec<_> = ThreadGroup::create("global", 3)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let node = group.rank() as f32;
                    let mut sync = OuterSynchronizer::new(Arc::new(group), solo(), 0.7);
                    let mut store = OffloadedParameterStore::new(
                        vec!["w".to_string()],
                        vec![Tensor::new(&[1.0f32, 1.0], &Device::Cpu).unwrap()],
                    )
                    .unwrap();

                    // Each node drifted differently
                    let live = vec![Tensor::new(&[1.0 - 0.1 * node, 1.0 + node], &Device::Cpu).unwrap()];
                    store.compute_pseudo_gradients(&live).unwrap();
                    sync.synchronize(&mut store).unwrap();

                    assert!(store.params()[0].pseudo_gradient.is_none());
                    store.values()[0].to_vec1::<f32>().unwrap()
                })
            })
            .collect();

        let results: Vec<Vec<f32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);

        // Average pseudo-gradient [0.1, -1.0]; first Nesterov update is 1.9 * g
        let expected: [f32; 2] = [1.0 - 0.7 * 1.9 * 0.1, 1.0 + 0.7 * 1.9 * 1.0];
        for (got, want) in results[0].iter().zip(expected) {
            assert!((got - want).abs() < 1e-5);
        }
    }

    #[test]
    fn test_synchronize_requires_pseudo_gradients() {
        let mut sync = OuterSynchronizer::new(solo(), solo(), 0.7);
        let mut store =
            OffloadedParameterStore::new(vec!["w".to_string()], vec![Tensor::new(&[1.0f32], &Device::Cpu).unwrap()])
                .unwrap();
        assert!(sync.synchronize(&mut store).is_err());
    }

    #[test]
    fn test_each_device_exchanges_only_its_chunk_across_nodes() {
        // 2 nodes x 2 devices; 5 elements pad to 2 chunks of 3
        let handles: Vec<_> = thread_grid(2, 2)
            .into_iter()
            .enumerate()
            .map(|(rank, (local, global))| {
                thread::spawn(move || {
                    let node = (rank / 2) as f32;
                    let global = Arc::new(CountingGroup {
                        inner: global,
                        sent: AtomicUsize::new(0),
                    });
                    let mut sync = OuterSynchronizer::new(global.clone(), local, 1.0);
                    let mut store = OffloadedParameterStore::new(
                        vec!["w".to_string()],
                        vec![Tensor::zeros((1, 5), candle_core::DType::F32, &Device::Cpu).unwrap()],
                    )
                    .unwrap();

                    // Both devices of a node drifted the same way
                    let live = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0, 5.0]], &Device::Cpu).unwrap();
                    let live = (live * (node + 1.0) as f64).unwrap();
                    store.compute_pseudo_gradients(&[live]).unwrap();
                    sync.synchronize(&mut store).unwrap();

                    let values = store.values()[0].flatten_all().unwrap().to_vec1::<f32>().unwrap();
                    (global.sent.load(Ordering::SeqCst), store.values()[0].dims().to_vec(), values)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for (sent, dims, values) in &results {
            assert_eq!(*sent, 3);
            assert_eq!(dims, &vec![1, 5]);
            assert_eq!(values, &results[0].2);
        }

        // Mean drift is 1.5 * live; first Nesterov update is 1.9 * g
        let expected: Vec<f32> = [1.0f32, 2.0, 3.0, 4.0, 5.0].iter().map(|v| 1.9 * 1.5 * v).collect();
        for (got, want) in results[0].2.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-4);
        }
    }
}
