//! Process topology: a (nodes x devices-per-node) grid derived from the
//! launcher-provided rank identity.
//!
//! Every participant belongs to exactly one *local* group (all devices on its
//! node) and exactly one *global* group (the device at the same intra-node
//! position on every node).

use anyhow::{bail, Context, Result};
use std::env;
use std::net::SocketAddr;

/// Default rendezvous address when `MASTER_ADDR` is unset
pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
/// Default rendezvous port when `MASTER_PORT` is unset
pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// Immutable identity of this participant for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTopology {
    /// Global rank in `0..world_size`
    pub rank: usize,
    /// Total number of participants
    pub world_size: usize,
    /// Position within the node (`rank % local_world_size`)
    pub local_rank: usize,
    /// Devices per node
    pub local_world_size: usize,
    /// Rendezvous host (node 0)
    pub master_addr: String,
    /// Rendezvous base port
    pub master_port: u16,
}

impl ProcessTopology {
    /// Build a topology from explicit integers.
    ///
    /// Fails if `world_size` is not a multiple of `local_world_size`, or if the
    /// rank does not fit in the grid.
    pub fn new(rank: usize, world_size: usize, local_world_size: usize) -> Result<Self> {
        if local_world_size == 0 {
            bail!("LOCAL_WORLD_SIZE must be positive");
        }
        if world_size == 0 || world_size % local_world_size != 0 {
            bail!(
                "WORLD_SIZE ({}) must be a positive multiple of LOCAL_WORLD_SIZE ({})",
                world_size,
                local_world_size
            );
        }
        if rank >= world_size {
            bail!("RANK ({}) must be smaller than WORLD_SIZE ({})", rank, world_size);
        }

        Ok(Self {
            rank,
            world_size,
            local_rank: rank % local_world_size,
            local_world_size,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
        })
    }

    /// Read `RANK`, `WORLD_SIZE`, `LOCAL_RANK`, `LOCAL_WORLD_SIZE` (all required)
    /// and `MASTER_ADDR` / `MASTER_PORT` (optional) from the environment.
    pub fn from_env() -> Result<Self> {
        let rank = read_env_usize("RANK")?;
        let world_size = read_env_usize("WORLD_SIZE")?;
        let local_rank = read_env_usize("LOCAL_RANK")?;
        let local_world_size = read_env_usize("LOCAL_WORLD_SIZE")?;

        let mut topology = Self::new(rank, world_size, local_world_size)?;
        if topology.local_rank != local_rank {
            bail!(
                "LOCAL_RANK ({}) is inconsistent with RANK ({}) and LOCAL_WORLD_SIZE ({})",
                local_rank,
                rank,
                local_world_size
            );
        }

        if let Ok(addr) = env::var("MASTER_ADDR") {
            topology.master_addr = addr;
        }
        if let Ok(port) = env::var("MASTER_PORT") {
            topology.master_port = port
                .trim()
                .parse()
                .with_context(|| format!("MASTER_PORT is not a valid port: {}", port))?;
        }

        Ok(topology)
    }

    /// Override the rendezvous endpoint
    pub fn with_master(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.master_addr = addr.into();
        self.master_port = port;
        self
    }

    /// Number of nodes in the grid
    pub fn num_nodes(&self) -> usize {
        self.world_size / self.local_world_size
    }

    /// Index of the node hosting this rank
    pub fn node_index(&self) -> usize {
        self.rank / self.local_world_size
    }

    /// Global ranks of every device on this node, ordered by local rank
    pub fn local_group_ranks(&self) -> Vec<usize> {
        let first = self.node_index() * self.local_world_size;
        (first..first + self.local_world_size).collect()
    }

    /// Global ranks of the devices sharing this local rank, ordered by node
    pub fn global_group_ranks(&self) -> Vec<usize> {
        (0..self.num_nodes())
            .map(|node| node * self.local_world_size + self.local_rank)
            .collect()
    }

    /// Metric emission and console output happen on global rank 0 only
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    /// Endpoint where the root of this rank's global group listens.
    ///
    /// The root is node 0's device at the same local rank, which runs on the
    /// `MASTER_ADDR` host.
    pub fn global_group_endpoint(&self) -> Result<SocketAddr> {
        let port = self.master_port as usize + 1 + self.local_rank;
        resolve_endpoint(&self.master_addr, port)
    }

    /// Endpoint where the root of this node's local group listens (loopback).
    ///
    /// Offset by node index so several nodes can share one host; the ports
    /// follow the global group ports `master_port + 1 ..= master_port + local_world_size`.
    pub fn local_group_endpoint(&self) -> Result<SocketAddr> {
        let port = self.master_port as usize + 1 + self.local_world_size + self.node_index();
        resolve_endpoint("127.0.0.1", port)
    }
}

fn read_env_usize(name: &str) -> Result<usize> {
    let raw = env::var(name).with_context(|| format!("environment variable {} is required", name))?;
    raw.trim()
        .parse()
        .with_context(|| format!("environment variable {} is not an integer: {}", name, raw))
}

fn resolve_endpoint(host: &str, port: usize) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;

    let port = u16::try_from(port).with_context(|| format!("rendezvous port {} out of range", port))?;
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {}:{}", host, port))?
        .next()
        .with_context(|| format!("no address for {}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_for_two_nodes_of_four() {
        let topo = ProcessTopology::new(6, 8, 4).unwrap();
        assert_eq!(topo.num_nodes(), 2);
        assert_eq!(topo.node_index(), 1);
        assert_eq!(topo.local_rank, 2);
        assert_eq!(topo.local_group_ranks(), vec![4, 5, 6, 7]);
        assert_eq!(topo.global_group_ranks(), vec![2, 6]);
        assert!(!topo.is_primary());
    }

    #[test]
    fn test_every_rank_in_exactly_one_group_of_each_kind() {
        let (world, local) = (12, 3);
        let mut local_hits = vec![0usize; world];
        let mut global_hits = vec![0usize; world];

        for rank in 0..world {
            let topo = ProcessTopology::new(rank, world, local).unwrap();
            // Only count each group once: from its first member
            if topo.local_group_ranks()[0] == rank {
                for r in topo.local_group_ranks() {
                    local_hits[r] += 1;
                }
            }
            if topo.global_group_ranks()[0] == rank {
                for r in topo.global_group_ranks() {
                    global_hits[r] += 1;
                }
            }
        }

        assert!(local_hits.iter().all(|&n| n == 1));
        assert!(global_hits.iter().all(|&n| n == 1));
    }

    #[test]
    fn test_indivisible_world_size_rejected() {
        assert!(ProcessTopology::new(0, 6, 4).is_err());
        assert!(ProcessTopology::new(0, 4, 0).is_err());
        assert!(ProcessTopology::new(4, 4, 2).is_err());
    }

    #[test]
    fn test_single_node() {
        let topo = ProcessTopology::new(1, 2, 2).unwrap();
        assert_eq!(topo.num_nodes(), 1);
        assert_eq!(topo.global_group_ranks(), vec![1]);
    }

    #[test]
    fn test_endpoints_are_distinct_per_local_rank() {
        let a = ProcessTopology::new(0, 4, 2).unwrap().with_master("127.0.0.1", 30000);
        let b = ProcessTopology::new(1, 4, 2).unwrap().with_master("127.0.0.1", 30000);
        assert_eq!(a.global_group_endpoint().unwrap().port(), 30001);
        assert_eq!(b.global_group_endpoint().unwrap().port(), 30002);
        assert_eq!(a.local_group_endpoint().unwrap().port(), 30003);
    }

    #[test]
    fn test_nodes_on_one_host_get_distinct_local_ports() {
        let (world, local, master_port) = (6, 2, 30000);
        let mut local_ports = Vec::new();
        let mut global_ports = Vec::new();
        for rank in 0..world {
            let topo = ProcessTopology::new(rank, world, local).unwrap().with_master("127.0.0.1", master_port);
            local_ports.push(topo.local_group_endpoint().unwrap().port());
            global_ports.push(topo.global_group_endpoint().unwrap().port());
        }

        // Devices of one node agree; nodes differ
        assert_eq!(local_ports, vec![30003, 30003, 30004, 30004, 30005, 30005]);
        assert!(local_ports.iter().all(|p| !global_ports.contains(p)));
    }
}
