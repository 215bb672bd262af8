use candle_core::{Device, Result, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Vocabulary size of the synthetic token stream
pub const FAKE_VOCAB_SIZE: usize = 1024;

// ============================================================================
// Batches
// ============================================================================

/// Token ids for one micro-step, both `(batch, seq)` u32 on the training device
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    /// `inputs` shifted left by one position
    pub targets: Tensor,
}

/// A batch still in host memory, before transfer to the training device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBatch {
    pub inputs: Vec<u32>,
    pub targets: Vec<u32>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl HostBatch {
    /// Split `batch_size` windows of `seq_len + 1` tokens into inputs and targets
    pub fn from_windows(tokens: &[u32], batch_size: usize, seq_len: usize) -> Result<Self> {
        let window = seq_len + 1;
        if tokens.len() != batch_size * window {
            return Err(candle_core::Error::Msg(format!(
                "expected {} tokens for {} windows of {}, got {}",
                batch_size * window,
                batch_size,
                window,
                tokens.len()
            )));
        }

        let mut inputs = Vec::with_capacity(batch_size * seq_len);
        let mut targets = Vec::with_capacity(batch_size * seq_len);
        for row in tokens.chunks_exact(window) {
            inputs.extend_from_slice(&row[..seq_len]);
            targets.extend_from_slice(&row[1..]);
        }

        Ok(Self { inputs, targets, batch_size, seq_len })
    }

    /// Transfer to `device`
    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        let shape = (self.batch_size, self.seq_len);
        Ok(Batch {
            inputs: Tensor::from_slice(&self.inputs, shape, device)?,
            targets: Tensor::from_slice(&self.targets, shape, device)?,
        })
    }
}

// ============================================================================
// Token Sources
// ============================================================================

/// Produces host-side batches; runs on the prefetch thread when one is used
pub trait TokenSource: Send {
    fn next_host_batch(&mut self) -> Result<HostBatch>;
}

/// Seeded random token ids in `[0, vocab_size)`
pub struct FakeTokenSource {
    rng: StdRng,
    vocab_size: usize,
    batch_size: usize,
    seq_len: usize,
}

impl FakeTokenSource {
    pub fn new(vocab_size: usize, batch_size: usize, seq_len: usize, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            vocab_size,
            batch_size,
            seq_len,
        }
    }
}

impl TokenSource for FakeTokenSource {
    fn next_host_batch(&mut self) -> Result<HostBatch> {
        let n_tokens = self.batch_size * (self.seq_len + 1);
        let tokens: Vec<u32> = (0..n_tokens)
            .map(|_| self.rng.gen_range(0..self.vocab_size) as u32)
            .collect();
        HostBatch::from_windows(&tokens, self.batch_size, self.seq_len)
    }
}

/// Memory-mapped file of raw little-endian u32 token ids.
///
/// # Data Sharding
/// The token range is split evenly across all ranks of the world; each rank
/// reads only its own shard and wraps around at its end, so the stream never
/// runs dry.
pub struct TokenFileSource {
    mmap: Mmap,
    batch_size: usize,
    seq_len: usize,
    cursor: usize,
    shard_start: usize,
    shard_end: usize,
}

impl TokenFileSource {
    /// Open `path` and select the shard of `rank` out of `world_size`
    pub fn open<P: AsRef<Path>>(
        path: P,
        batch_size: usize,
        seq_len: usize,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            candle_core::Error::Msg(format!("Failed to open data file {}: {}", path.display(), e))
        })?;

        // SAFETY: the mapping is read-only and the file is not modified while training
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| candle_core::Error::Msg(format!("Failed to mmap file: {}", e)))?
        };

        if mmap.len() % std::mem::size_of::<u32>() != 0 {
            return Err(candle_core::Error::Msg(format!(
                "{}: file size is not a multiple of u32 size",
                path.display()
            )));
        }

        let total_size = mmap.len() / std::mem::size_of::<u32>();
        let shard_size = total_size / world_size.max(1);
        let shard_start = rank * shard_size;
        let shard_end = if rank + 1 == world_size {
            total_size // Last rank gets any remainder
        } else {
            (rank + 1) * shard_size
        };

        let needed = batch_size * (seq_len + 1);
        if shard_end - shard_start < needed {
            return Err(candle_core::Error::Msg(format!(
                "{}: shard of rank {} holds {} tokens, one batch needs {}",
                path.display(),
                rank,
                shard_end - shard_start,
                needed
            )));
        }

        Ok(Self {
            mmap,
            batch_size,
            seq_len,
            cursor: shard_start,
            shard_start,
            shard_end,
        })
    }

    /// Number of tokens in this rank's shard
    pub fn shard_size(&self) -> usize {
        self.shard_end - self.shard_start
    }

    fn tokens(&self, start: usize, count: usize) -> Vec<u32> {
        let bytes = &self.mmap[start * 4..(start + count) * 4];
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

impl TokenSource for TokenFileSource {
    fn next_host_batch(&mut self) -> Result<HostBatch> {
        let n_tokens_needed = self.batch_size * (self.seq_len + 1);

        if self.cursor + n_tokens_needed > self.shard_end {
            self.cursor = self.shard_start;
        }

        let start = self.cursor;
        self.cursor += n_tokens_needed;

        HostBatch::from_windows(&self.tokens(start, n_tokens_needed), self.batch_size, self.seq_len)
    }
}

/// Write tokens as raw little-endian u32 for [`TokenFileSource`]
pub fn write_tokens_to_file<P: AsRef<Path>>(tokens: &[u32], path: P) -> std::io::Result<()> {
    use std::io::Write;

    let mut file = File::create(path)?;
    let mut bytes = Vec::with_capacity(tokens.len() * 4);
    for token in tokens {
        bytes.extend_from_slice(&token.to_le_bytes());
    }
    file.write_all(&bytes)?;
    file.sync_all()?;

    Ok(())
}

// ============================================================================
// Data Loaders
// ============================================================================

/// Blocking supplier of training batches
pub trait DataLoader {
    fn next_batch(&mut self) -> Result<Batch>;
}

/// Produces each batch inline when asked
pub struct SyncDataLoader {
    source: Box<dyn TokenSource>,
    device: Device,
}

impl SyncDataLoader {
    pub fn new(source: Box<dyn TokenSource>, device: Device) -> Self {
        Self { source, device }
    }
}

impl DataLoader for SyncDataLoader {
    fn next_batch(&mut self) -> Result<Batch> {
        self.source.next_host_batch()?.to_device(&self.device)
    }
}

/// Async prefetching data loader for CPU-GPU pipeline overlap
///
/// A background thread keeps up to `prefetch_count` host batches ready while
/// the device trains on the current one.
///
/// ```text
/// GPU: [Forward/Backward on batch N] → [Forward/Backward on batch N+1] → ...
/// CPU: [Load batch N+1]               → [Load batch N+2]                → ...
/// ```
pub struct PrefetchDataLoader {
    /// Receiver for prefetched batches; dropped first on shutdown to unblock the worker
    receiver: Option<Receiver<Result<HostBatch>>>,
    prefetch_thread: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    device: Device,
}

impl PrefetchDataLoader {
    pub fn new(source: Box<dyn TokenSource>, prefetch_count: usize, device: Device) -> Result<Self> {
        // Channel for passing prefetched batches (bounded to limit memory)
        let (sender, receiver) = mpsc::sync_channel(prefetch_count.max(1));

        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_signal_clone = Arc::clone(&stop_signal);

        let prefetch_thread = thread::Builder::new()
            .name("prefetch".to_string())
            .spawn(move || Self::prefetch_worker(source, sender, stop_signal_clone))
            .map_err(candle_core::Error::wrap)?;

        Ok(Self {
            receiver: Some(receiver),
            prefetch_thread: Some(prefetch_thread),
            stop_signal,
            device,
        })
    }

    fn prefetch_worker(
        mut source: Box<dyn TokenSource>,
        sender: SyncSender<Result<HostBatch>>,
        stop_signal: Arc<AtomicBool>,
    ) {
        while !stop_signal.load(Ordering::Relaxed) {
            let batch = source.next_host_batch();
            let failed = batch.is_err();

            // Blocks while the channel is full (backpressure)
            if sender.send(batch).is_err() || failed {
                break;
            }
        }
    }

    /// Stop the background thread and wait for it to exit
    pub fn shutdown(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        self.receiver.take();

        if let Some(handle) = self.prefetch_thread.take() {
            let _ = handle.join();
        }
    }
}

impl DataLoader for PrefetchDataLoader {
    fn next_batch(&mut self) -> Result<Batch> {
        let receiver = self
            .receiver
            .as_ref()
            .ok_or_else(|| candle_core::Error::Msg("Prefetch loader already shut down".to_string()))?;

        let batch = receiver
            .recv()
            .map_err(|_| candle_core::Error::Msg("Prefetch thread stopped".to_string()))??;

        batch.to_device(&self.device)
    }
}

impl Drop for PrefetchDataLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wrap `source` in a prefetching loader when `num_workers > 0`
pub fn create_data_loader(
    source: Box<dyn TokenSource>,
    num_workers: usize,
    device: Device,
) -> Result<Box<dyn DataLoader>> {
    if num_workers == 0 {
        Ok(Box::new(SyncDataLoader::new(source, device)))
    } else {
        Ok(Box::new(PrefetchDataLoader::new(source, num_workers, device)?))
    }
}
