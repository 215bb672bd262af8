//! Host-staged collectives over TCP
//!
//! Each device runs in its own process. Collectives copy tensors to host
//! memory and route them through the group root: every member sends its
//! contribution to the root, the root combines them in rank order and sends
//! the result back. Nothing here retries: a dropped connection or a timeout
//! is fatal to the job.
//!
//! # Performance Characteristics
//!
//! - No external dependencies beyond a reachable root
//! - Root bandwidth grows with group size; fine for the once-per-round
//!   cross-node pseudo-gradient average and small local groups

use candle_core::Result;
use log::debug;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use super::sync::{check_root, reduce_in_rank_order, ProcessGroup, ReduceOp};

/// Pause between connection attempts while the root is not listening yet
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(200);
/// Upper bound for a single connection attempt
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Opcode {
    Gather = 1,
    ReduceSum = 2,
    ReduceAvg = 3,
    Broadcast = 4,
}

impl Opcode {
    fn for_reduce(op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum => Opcode::ReduceSum,
            ReduceOp::Avg => Opcode::ReduceAvg,
        }
    }
}

enum Role {
    /// Streams to ranks `1..size`, stored at index `rank - 1`
    Root { peers: Vec<TcpStream> },
    Peer { root: TcpStream },
}

/// One member of a TCP-backed process group
pub struct TcpGroup {
    name: String,
    rank: usize,
    size: usize,
    role: Role,
}

impl TcpGroup {
    /// Join a group rooted at `endpoint`.
    ///
    /// Rank 0 binds the endpoint's port and waits for `size - 1` peers; every
    /// other rank connects, retrying until `timeout` elapses. The same
    /// `timeout` bounds every subsequent read and write.
    pub fn connect(name: &str, rank: usize, size: usize, endpoint: SocketAddr, timeout: Duration) -> Result<Self> {
        if size == 0 || rank >= size {
            return Err(candle_core::Error::Msg(format!(
                "{}: rank {} invalid for group of {}",
                name, rank, size
            )));
        }

        let role = if size == 1 {
            Role::Root { peers: Vec::new() }
        } else if rank == 0 {
            Role::Root { peers: Self::accept_peers(name, size, endpoint.port(), timeout)? }
        } else {
            Role::Peer { root: Self::connect_root(name, rank, endpoint, timeout)? }
        };

        debug!("{}: rank {}/{} joined via {}", name, rank, size, endpoint);

        Ok(Self { name: name.to_string(), rank, size, role })
    }

    fn accept_peers(name: &str, size: usize, port: u16, timeout: Duration) -> Result<Vec<TcpStream>> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).map_err(|e| {
            candle_core::Error::Msg(format!("{}: cannot listen on port {}: {}", name, port, e))
        })?;

        let mut slots: Vec<Option<TcpStream>> = (1..size).map(|_| None).collect();
        for _ in 1..size {
            let (stream, addr) = listener.accept().map_err(candle_core::Error::wrap)?;
            configure(&stream, timeout)?;

            let peer_rank = read_u64(&stream)? as usize;
            if peer_rank == 0 || peer_rank >= size || slots[peer_rank - 1].is_some() {
                return Err(candle_core::Error::Msg(format!(
                    "{}: unexpected hello from {} claiming rank {}",
                    name, addr, peer_rank
                )));
            }
            debug!("{}: accepted rank {} from {}", name, peer_rank, addr);
            slots[peer_rank - 1] = Some(stream);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.ok_or_else(|| candle_core::Error::Msg(format!("{}: rank {} never joined", name, i + 1))))
            .collect()
    }

    fn connect_root(name: &str, rank: usize, endpoint: SocketAddr, timeout: Duration) -> Result<TcpStream> {
        let deadline = Instant::now() + timeout;
        let stream = loop {
            match TcpStream::connect_timeout(&endpoint, CONNECT_ATTEMPT_TIMEOUT) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!("{}: root {} not reachable yet ({}), retrying", name, endpoint, e);
                    thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(candle_core::Error::Msg(format!(
                        "{}: rank {} could not reach root at {}: {}",
                        name, rank, endpoint, e
                    )))
                }
            }
        };

        configure(&stream, timeout)?;
        write_u64(&stream, rank as u64)?;
        Ok(stream)
    }

    /// Root: receive one frame per peer, checking every peer issued `op`.
    fn collect(&self, peers: &[TcpStream], op: Opcode, own: &[f32]) -> Result<Vec<Vec<f32>>> {
        let mut parts = Vec::with_capacity(self.size);
        parts.push(own.to_vec());
        for (i, peer) in peers.iter().enumerate() {
            let (peer_op, data) = read_frame(peer)?;
            if peer_op != op as u8 {
                return Err(candle_core::Error::Msg(format!(
                    "{}: rank {} issued collective {} while root issued {:?}",
                    self.name,
                    i + 1,
                    peer_op,
                    op
                )));
            }
            parts.push(data);
        }
        Ok(parts)
    }
}

impl ProcessGroup for TcpGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather_host(&self, data: &[f32]) -> Result<Vec<Vec<f32>>> {
        match &self.role {
            Role::Root { peers } => {
                let parts = self.collect(peers, Opcode::Gather, data)?;
                for peer in peers {
                    write_u64(peer, parts.len() as u64)?;
                    for part in &parts {
                        write_frame(peer, Opcode::Gather, part)?;
                    }
                }
                Ok(parts)
            }
            Role::Peer { root } => {
                write_frame(root, Opcode::Gather, data)?;
                let count = read_u64(root)? as usize;
                (0..count).map(|_| read_frame(root).map(|(_, part)| part)).collect()
            }
        }
    }

    fn all_reduce_host(&self, data: &[f32], op: ReduceOp) -> Result<Vec<f32>> {
        let opcode = Opcode::for_reduce(op);
        match &self.role {
            Role::Root { peers } => {
                let parts = self.collect(peers, opcode, data)?;
                let reduced = reduce_in_rank_order(&parts, op)?;
                for peer in peers {
                    write_frame(peer, opcode, &reduced)?;
                }
                Ok(reduced)
            }
            Role::Peer { root } => {
                write_frame(root, opcode, data)?;
                read_frame(root).map(|(_, reduced)| reduced)
            }
        }
    }

    fn broadcast_host(&self, data: &[f32], root_rank: usize) -> Result<Vec<f32>> {
        check_root(&self.name, root_rank, self.size)?;
        let own: &[f32] = if self.rank == root_rank { data } else { &[] };

        match &self.role {
            Role::Root { peers } => {
                let mut parts = self.collect(peers, Opcode::Broadcast, own)?;
                let value = parts.swap_remove(root_rank);
                for peer in peers {
                    write_frame(peer, Opcode::Broadcast, &value)?;
                }
                Ok(value)
            }
            Role::Peer { root } => {
                write_frame(root, Opcode::Broadcast, own)?;
                read_frame(root).map(|(_, value)| value)
            }
        }
    }
}

fn configure(stream: &TcpStream, timeout: Duration) -> Result<()> {
    stream.set_nodelay(true).map_err(candle_core::Error::wrap)?;
    stream.set_read_timeout(Some(timeout)).map_err(candle_core::Error::wrap)?;
    stream.set_write_timeout(Some(timeout)).map_err(candle_core::Error::wrap)?;
    Ok(())
}

fn write_u64(mut stream: &TcpStream, value: u64) -> Result<()> {
    stream.write_all(&value.to_le_bytes()).map_err(candle_core::Error::wrap)
}

fn read_u64(mut stream: &TcpStream) -> Result<u64> {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).map_err(candle_core::Error::wrap)?;
    Ok(u64::from_le_bytes(buf))
}

/// Frame layout: opcode (1 byte), element count (u64 LE), f32 LE payload
fn write_frame(mut stream: &TcpStream, op: Opcode, data: &[f32]) -> Result<()> {
    let mut buf = Vec::with_capacity(9 + data.len() * 4);
    buf.push(op as u8);
    buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
    for value in data {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    stream.write_all(&buf).map_err(candle_core::Error::wrap)
}

fn read_frame(mut stream: &TcpStream) -> Result<(u8, Vec<f32>)> {
    let mut op = [0u8; 1];
    stream.read_exact(&mut op).map_err(candle_core::Error::wrap)?;
    let len = read_u64(stream)? as usize;

    let mut bytes = vec![0u8; len * 4];
    stream.read_exact(&mut bytes).map_err(candle_core::Error::wrap)?;
    let data = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok((op[0], data))
}
