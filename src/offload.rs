//! Host-resident parameter snapshots
//!
//! The store keeps the full value of every parameter as of the last
//! synchronization point. At the end of a round the drift of the live model
//! from that snapshot becomes the pseudo-gradient the outer optimizer steps on.

use candle_core::{Device, Result, Tensor};

/// Host copy of one full parameter
#[derive(Debug, Clone)]
pub struct OffloadedParameter {
    pub name: String,
    /// Always on `Device::Cpu`
    pub value: Tensor,
    /// `value - live`, filled once per round and cleared after the outer step
    pub pseudo_gradient: Option<Tensor>,
}

/// Offloaded parameters, in the same order as the replica's snapshots
#[derive(Debug, Clone)]
pub struct OffloadedParameterStore {
    params: Vec<OffloadedParameter>,
}

impl OffloadedParameterStore {
    /// Seed the store from full parameter values (copied to host memory)
    pub fn new(names: Vec<String>, values: Vec<Tensor>) -> Result<Self> {
        if names.len() != values.len() {
            return Err(candle_core::Error::Msg(format!(
                "{} parameter names for {} values",
                names.len(),
                values.len()
            )));
        }

        let params = names
            .into_iter()
            .zip(values)
            .map(|(name, value)| {
                Ok(OffloadedParameter {
                    name,
                    value: value.to_device(&Device::Cpu)?.copy()?,
                    pseudo_gradient: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { params })
    }

    pub fn params(&self) -> &[OffloadedParameter] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [OffloadedParameter] {
        &mut self.params
    }

    /// Current offloaded values, for writing back into the live model
    pub fn values(&self) -> Vec<Tensor> {
        self.params.iter().map(|p| p.value.clone()).collect()
    }

    /// `pseudo_gradient = offloaded - live` for every parameter
    pub fn compute_pseudo_gradients(&mut self, live: &[Tensor]) -> Result<()> {
        if live.len() != self.params.len() {
            return Err(candle_core::Error::Msg(format!(
                "expected {} live parameters, got {}",
                self.params.len(),
                live.len()
            )));
        }

        for (param, live) in self.params.iter_mut().zip(live) {
            if live.dims() != param.value.dims() {
                return Err(candle_core::Error::Msg(format!(
                    "shape mismatch for {}: offloaded {:?}, live {:?}",
                    param.name,
                    param.value.dims(),
                    live.dims()
                )));
            }
            let live = live.to_device(&Device::Cpu)?.to_dtype(param.value.dtype())?;
            param.pseudo_gradient = Some(param.value.sub(&live)?);
        }

        Ok(())
    }

    pub fn zero_pseudo_gradients(&mut self) {
        for param in self.params.iter_mut() {
            param.pseudo_gradient = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    fn store(values: &[&[f32]]) -> OffloadedParameterStore {
        let names = (0..values.len()).map(|i| format!("p{}", i)).collect();
        let tensors = values.iter().map(|v| Tensor::new(*v, &Device::Cpu).unwrap()).collect();
        OffloadedParameterStore::new(names, tensors).unwrap()
    }

    #[test]
    fn test_pseudo_gradient_is_offloaded_minus_live() {
        let mut store = store(&[&[1.0, 2.0, 3.0], &[0.5]]);
        let live = vec![
            Tensor::new(&[0.5f32, 2.5, 3.0], &Device::Cpu).unwrap(),
            Tensor::new(&[-1.0f32], &Device::Cpu).unwrap(),
        ];
        store.compute_pseudo_gradients(&live).unwrap();

        let pg: Vec<Vec<f32>> = store
            .params()
            .iter()
            .map(|p| p.pseudo_gradient.as_ref().unwrap().to_vec1::<f32>().unwrap())
            .collect();
        assert_eq!(pg, vec![vec![0.5, -0.5, 0.0], vec![1.5]]);

        store.zero_pseudo_gradients();
        assert!(store.params().iter().all(|p| p.pseudo_gradient.is_none()));
    }

    #[test]
    fn test_mismatched_live_rejected() {
        let mut store = store(&[&[1.0, 2.0]]);
        let wrong_shape = vec![Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap()];
        assert!(store.compute_pseudo_gradients(&wrong_shape).is_err());
        assert!(store.compute_pseudo_gradients(&[]).is_err());
    }

    #[test]
    fn test_store_owns_independent_copies() {
        // The live model's parameters are updated in place after the store is seeded
        let live = Var::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        let store = OffloadedParameterStore::new(vec!["w".to_string()], vec![live.as_tensor().clone()]).unwrap();

        live.set(&Tensor::new(&[5.0f32, -5.0], &Device::Cpu).unwrap()).unwrap();
        assert_eq!(live.as_tensor().to_vec1::<f32>().unwrap(), vec![5.0, -5.0]);
        assert_eq!(store.values()[0].to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
    }
}
