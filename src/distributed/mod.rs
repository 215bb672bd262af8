//! Collective Communication Module
//!
//! This module provides the process groups the trainer communicates over:
//! a *local* group (devices of one node, used for sharded computation) and a
//! *global* group (one device per node at the same local rank, used for the
//! once-per-round pseudo-gradient average).
//!
//! # Architecture
//!
//! The module uses a trait-based design with pluggable backends:
//!
//! - `ProcessGroup` - Core trait for collectives (gather, reduce, broadcast)
//! - `TcpGroup` - Default backend, one process per device, host-staged over TCP
//! - `ThreadGroup` - In-process backend, one thread per device
//!
//! # Usage
//!
//! ```ignore
//! let (local, global) = connect_tcp(&topology, timeout)?;
//! let avg = all_reduce_tensor(global.as_ref(), &pseudo_grad, ReduceOp::Avg)?;
//! ```

pub mod cpu_staging;
pub mod optimizer;
pub mod sync;
pub mod thread_group;

// Re-exports for convenience
pub use cpu_staging::TcpGroup;
pub use optimizer::{AdamWConfig, ShardedAdamW};
pub use sync::{CommBackend, ProcessGroup, ReduceOp};
pub use thread_group::ThreadGroup;

use std::sync::Arc;
use std::time::Duration;

use crate::topology::ProcessTopology;

/// Shared handle to a process group
pub type GroupHandle = Arc<dyn ProcessGroup>;

/// Default timeout for a single collective when `TIMEOUT_COLLECTIVE_MINUTES` is unset
pub const DEFAULT_COLLECTIVE_TIMEOUT_MINUTES: u64 = 120;

/// Collective timeout from `TIMEOUT_COLLECTIVE_MINUTES`
pub fn collective_timeout_from_env() -> anyhow::Result<Duration> {
    let minutes = match std::env::var("TIMEOUT_COLLECTIVE_MINUTES") {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("TIMEOUT_COLLECTIVE_MINUTES is not an integer ({}): {}", raw, e))?,
        Err(_) => DEFAULT_COLLECTIVE_TIMEOUT_MINUTES,
    };
    Ok(Duration::from_secs(minutes * 60))
}

/// Join this rank's local and global groups over TCP.
///
/// The local group is joined first on every rank. Global roots are local
/// ranks of node 0, so a node-0 root only starts accepting global peers after
/// its own local group is complete.
pub fn connect_tcp(topology: &ProcessTopology, timeout: Duration) -> anyhow::Result<(GroupHandle, GroupHandle)> {
    let local = TcpGroup::connect(
        &format!("local[node {}]", topology.node_index()),
        topology.local_rank,
        topology.local_world_size,
        topology.local_group_endpoint()?,
        timeout,
    )?;

    let global = TcpGroup::connect(
        &format!("global[local rank {}]", topology.local_rank),
        topology.node_index(),
        topology.num_nodes(),
        topology.global_group_endpoint()?,
        timeout,
    )?;

    Ok((Arc::new(local), Arc::new(global)))
}

/// In-process groups for a `num_nodes x devices_per_node` grid.
///
/// Returns `(local, global)` per global rank, indexed by rank.
pub fn thread_grid(num_nodes: usize, devices_per_node: usize) -> Vec<(GroupHandle, GroupHandle)> {
    let mut locals: Vec<Option<ThreadGroup>> = (0..num_nodes)
        .flat_map(|node| ThreadGroup::create(&format!("local[node {}]", node), devices_per_node))
        .map(Some)
        .collect();

    // globals_by_local_rank[r][node] is the member for rank node * devices_per_node + r
    let mut globals_by_local_rank: Vec<Vec<Option<ThreadGroup>>> = (0..devices_per_node)
        .map(|r| {
            ThreadGroup::create(&format!("global[local rank {}]", r), num_nodes)
                .into_iter()
                .map(Some)
                .collect()
        })
        .collect();

    (0..num_nodes * devices_per_node)
        .filter_map(|rank| {
            let (node, local_rank) = (rank / devices_per_node, rank % devices_per_node);
            let local = locals[rank].take()?;
            let global = globals_by_local_rank[local_rank][node].take()?;
            Some((Arc::new(local) as GroupHandle, Arc::new(global) as GroupHandle))
        })
        .collect()
}
