//! Core trait and types for collective communication
//!
//! This module defines the `ProcessGroup` trait that all backends must implement,
//! plus tensor-level helpers that stage device tensors through host memory.

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Collective communication backend selection
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommBackend {
    /// Host-staged collectives over TCP, one process per device
    #[default]
    #[serde(alias = "cpu", alias = "cpu_staging")]
    Tcp,
    /// In-process collectives, one thread per device (simulation and tests)
    Threads,
}

impl std::str::FromStr for CommBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" | "cpu" | "cpu_staging" | "cpustaging" => Ok(CommBackend::Tcp),
            "threads" | "thread" | "local" => Ok(CommBackend::Threads),
            _ => Err(format!("Unknown comm backend: {}. Valid options: tcp, threads", s)),
        }
    }
}

/// Reduction applied by `all_reduce`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    /// Sum divided by the group size
    Avg,
}

/// A named set of ranks that take part in collectives together.
///
/// Every member must issue the same sequence of collective calls; each call
/// blocks until all members reach it. Contributions are combined in ascending
/// rank order, so every member observes bit-identical results.
pub trait ProcessGroup: Send + Sync {
    /// Group label used in log and error messages
    fn name(&self) -> &str;

    /// Rank of this member within the group
    fn rank(&self) -> usize;

    /// Number of members
    fn size(&self) -> usize;

    /// Collect every member's buffer; the result is indexed by group rank.
    fn all_gather_host(&self, data: &[f32]) -> Result<Vec<Vec<f32>>>;

    /// Element-wise reduction of every member's buffer.
    fn all_reduce_host(&self, data: &[f32], op: ReduceOp) -> Result<Vec<f32>> {
        let parts = self.all_gather_host(data)?;
        reduce_in_rank_order(&parts, op)
    }

    /// Every member receives the buffer contributed by `root`.
    fn broadcast_host(&self, data: &[f32], root: usize) -> Result<Vec<f32>> {
        check_root(self.name(), root, self.size())?;
        let mut parts = self.all_gather_host(data)?;
        Ok(parts.swap_remove(root))
    }

    /// Block until every member arrives
    fn barrier(&self) -> Result<()> {
        self.all_gather_host(&[]).map(|_| ())
    }
}

/// Combine contributions in rank order.
///
/// All buffers must have the same length.
pub fn reduce_in_rank_order(parts: &[Vec<f32>], op: ReduceOp) -> Result<Vec<f32>> {
    let Some((first, rest)) = parts.split_first() else {
        return Err(candle_core::Error::Msg("reduce over an empty group".to_string()));
    };

    let mut acc = first.clone();
    for (offset, part) in rest.iter().enumerate() {
        if part.len() != acc.len() {
            return Err(candle_core::Error::Msg(format!(
                "reduce length mismatch: rank 0 sent {} elements, rank {} sent {}",
                acc.len(),
                offset + 1,
                part.len()
            )));
        }
        for (a, &b) in acc.iter_mut().zip(part) {
            *a += b;
        }
    }

    if op == ReduceOp::Avg {
        let n = parts.len() as f32;
        for a in acc.iter_mut() {
            *a /= n;
        }
    }

    Ok(acc)
}

pub(crate) fn check_root(group: &str, root: usize, size: usize) -> Result<()> {
    if root >= size {
        return Err(candle_core::Error::Msg(format!(
            "{}: broadcast root {} out of range for group of {}",
            group, root, size
        )));
    }
    Ok(())
}

fn to_host(tensor: &Tensor) -> Result<Vec<f32>> {
    tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()
}

fn from_host(data: Vec<f32>, like: &Tensor) -> Result<Tensor> {
    Tensor::from_vec(data, like.shape(), like.device())?.to_dtype(like.dtype())
}

/// All-reduce a tensor, staging it through host memory.
///
/// Returns a new tensor with the same shape, dtype and device as the input.
pub fn all_reduce_tensor(group: &dyn ProcessGroup, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
    let reduced = group.all_reduce_host(&to_host(tensor)?, op)?;
    from_host(reduced, tensor)
}

/// All-gather a tensor; every member must contribute the same shape.
pub fn all_gather_tensor(group: &dyn ProcessGroup, tensor: &Tensor) -> Result<Vec<Tensor>> {
    let parts = group.all_gather_host(&to_host(tensor)?)?;
    parts.into_iter().map(|part| from_host(part, tensor)).collect()
}

/// Replace every member's tensor with the one held by `root`.
pub fn broadcast_tensor(group: &dyn ProcessGroup, tensor: &Tensor, root: usize) -> Result<Tensor> {
    let data = group.broadcast_host(&to_host(tensor)?, root)?;
    from_host(data, tensor)
}

/// Reduce a flat tensor across the group and keep this member's chunk.
///
/// The length must be a multiple of the group size; member `r` receives
/// elements `[r * chunk, (r + 1) * chunk)` of the reduced buffer.
///
/// Both host-staged backends implement this as a full all-reduce followed by
/// a local slice, so every member still sends and receives the whole buffer.
/// Only the memory held afterwards is sharded, not the traffic.
pub fn reduce_scatter_tensor(group: &dyn ProcessGroup, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
    let numel = tensor.elem_count();
    if numel % group.size() != 0 {
        return Err(candle_core::Error::Msg(format!(
            "{}: cannot scatter {} elements over {} members",
            group.name(),
            numel,
            group.size()
        )));
    }

    let chunk = numel / group.size();
    let start = group.rank() * chunk;
    let reduced = group.all_reduce_host(&to_host(tensor)?, op)?;
    Tensor::from_vec(reduced[start..start + chunk].to_vec(), chunk, tensor.device())?.to_dtype(tensor.dtype())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comm_backend_parsing() {
        assert_eq!("cpu".parse::<CommBackend>().unwrap(), CommBackend::Tcp);
        assert_eq!("tcp".parse::<CommBackend>().unwrap(), CommBackend::Tcp);
        assert_eq!("threads".parse::<CommBackend>().unwrap(), CommBackend::Threads);
        assert!("mpi".parse::<CommBackend>().is_err());
    }

    #[test]
    fn test_average_is_sum_over_n() {
        let parts = vec![vec![1.0, 2.0], vec![3.0, 6.0], vec![5.0, 1.0]];
        let avg = reduce_in_rank_order(&parts, ReduceOp::Avg).unwrap();
        assert!((avg[0] - 3.0).abs() < 1e-6);
        assert!((avg[1] - 3.0).abs() < 1e-6);

        let sum = reduce_in_rank_order(&parts, ReduceOp::Sum).unwrap();
        assert_eq!(sum, vec![9.0, 9.0]);
    }

    #[test]
    fn test_average_order_independent_within_tolerance() {
        let parts = vec![vec![0.1f32, 1e3], vec![0.7, -2e3], vec![1e-4, 5.5], vec![3.3, 0.25]];
        let mut reversed = parts.clone();
        reversed.reverse();

        let a = reduce_in_rank_order(&parts, ReduceOp::Avg).unwrap();
        let b = reduce_in_rank_order(&reversed, ReduceOp::Avg).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() <= 1e-4 * x.abs().max(1.0));
        }
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let parts = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(reduce_in_rank_order(&parts, ReduceOp::Sum).is_err());
        assert!(reduce_in_rank_order(&[], ReduceOp::Sum).is_err());
    }
}
