//! Participant assembly
//!
//! Builds everything one device needs (groups, model, replica, data, sink)
//! and hands it to a [`DilocoTrainer`]. Two ways in: one process per device
//! configured from the environment, or a whole grid simulated with threads.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use log::{info, warn};
use std::thread;

use crate::config::{CommBackend, Config, ModelConfig, TargetDevice};
use crate::data::{create_data_loader, FakeTokenSource, TokenFileSource, TokenSource, FAKE_VOCAB_SIZE};
use crate::distributed::{collective_timeout_from_env, connect_tcp, thread_grid, AdamWConfig, GroupHandle};
use crate::metrics::create_metric_sink;
use crate::model::Llama;
use crate::sharding::ShardedModelReplica;
use crate::topology::ProcessTopology;
use crate::trainer::DilocoTrainer;

/// Pick the compute device for `local_rank`
pub fn select_device(target: TargetDevice, local_rank: usize) -> Result<Device> {
    match target {
        TargetDevice::Cpu => Ok(Device::Cpu),
        TargetDevice::Gpu => {
            let device = Device::cuda_if_available(local_rank)?;
            if device.is_cpu() {
                warn!("[rank {}] no CUDA device available, training on CPU", local_rank);
            }
            Ok(device)
        }
    }
}

fn token_source(
    config: &Config,
    model: &ModelConfig,
    topology: &ProcessTopology,
    batch_size: usize,
) -> Result<Box<dyn TokenSource>> {
    if config.fake_data {
        // Same stream on every rank
        let vocab = model.vocab_size.min(FAKE_VOCAB_SIZE);
        return Ok(Box::new(FakeTokenSource::new(vocab, batch_size, config.seq_length, config.seed)));
    }

    let source = TokenFileSource::open(
        &config.dataset_name_or_path,
        batch_size,
        config.seq_length,
        topology.rank,
        topology.world_size,
    )?;
    Ok(Box::new(source))
}

/// Build the trainer for one participant.
///
/// Collective: every member of `local` and `global` must call this
/// concurrently, since the replica agrees on initial parameters by broadcast.
pub fn build_trainer(
    config: &Config,
    topology: ProcessTopology,
    local: GroupHandle,
    global: GroupHandle,
    device: Device,
    headless: bool,
) -> Result<DilocoTrainer> {
    config.validate()?;
    let plan = config.batch_plan(topology.world_size)?;
    let model_config = ModelConfig::resolve(&config.path_model)?;
    if config.seq_length > model_config.max_seq_len {
        bail!(
            "seq_length ({}) exceeds max_seq_len ({}) of model {}",
            config.seq_length,
            model_config.max_seq_len,
            model_config.name
        );
    }

    info!(
        "[rank {}] global pg world : {}, local pg: {}",
        topology.local_rank,
        global.size(),
        local.size()
    );
    if topology.is_primary() {
        info!(
            "[rank {}] model {} (~{} params), {:?}, gradient_accumulation_steps={}",
            topology.local_rank,
            model_config.name,
            model_config.estimate_params_short(),
            config.sharding_strategy,
            plan.gradient_accumulation_steps
        );
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Llama::new(&model_config, vb)?;

    let replica = ShardedModelReplica::new(
        &varmap,
        Box::new(model),
        local,
        global.as_ref(),
        config.sharding_strategy,
        plan.gradient_accumulation_steps,
        AdamWConfig::with_lr(config.lr),
    )?;

    let source = token_source(config, &model_config, &topology, plan.per_device_batch_size)?;
    let data_loader = create_data_loader(source, config.num_workers, device)?;

    let metric_sink = if topology.is_primary() {
        Some(create_metric_sink(config, topology.world_size)?)
    } else {
        None
    };

    DilocoTrainer::new(config, topology, replica, global, data_loader, metric_sink, headless)
}

/// Run this process as the participant described by the environment
pub fn run_from_env(config: &Config, headless: bool) -> Result<()> {
    if config.backend != CommBackend::Tcp {
        bail!("backend {:?} only runs in-process; use --simulate NODESxDEVICES", config.backend);
    }

    let topology = ProcessTopology::from_env()?;
    let timeout = collective_timeout_from_env()?;
    let device = select_device(config.target_device, topology.local_rank)?;

    let (local, global) = connect_tcp(&topology, timeout)?;
    let mut trainer = build_trainer(config, topology, local, global, device, headless)?;
    trainer.fit()
}

/// Parse `"NxM"` into `(nodes, devices_per_node)`
pub fn parse_grid(grid: &str) -> Result<(usize, usize)> {
    let (nodes, devices) = grid
        .to_lowercase()
        .split_once('x')
        .map(|(n, d)| (n.trim().to_string(), d.trim().to_string()))
        .with_context(|| format!("grid '{}' is not of the form NODESxDEVICES", grid))?;

    let nodes: usize = nodes.parse().with_context(|| format!("invalid node count in '{}'", grid))?;
    let devices: usize = devices
        .parse()
        .with_context(|| format!("invalid devices-per-node count in '{}'", grid))?;
    if nodes == 0 || devices == 0 {
        bail!("grid '{}' must have at least one node and one device", grid);
    }
    Ok((nodes, devices))
}

/// Run `nodes x devices_per_node` participants as threads on the CPU.
///
/// Returns when the first participant finishes or fails. A failed participant
/// drops its groups, so the others fail at their next collective.
pub fn simulate(config: &Config, nodes: usize, devices_per_node: usize, headless: bool) -> Result<()> {
    let world_size = nodes * devices_per_node;
    // Fail before spawning anything
    config.validate()?;
    config.batch_plan(world_size)?;

    info!("simulating {} node(s) x {} device(s) on CPU", nodes, devices_per_node);

    let (sender, receiver) = std::sync::mpsc::channel();
    for (rank, (local, global)) in thread_grid(nodes, devices_per_node).into_iter().enumerate() {
        let config = config.clone();
        let sender = sender.clone();
        thread::Builder::new()
            .name(format!("rank-{}", rank))
            .spawn(move || {
                let result = ProcessTopology::new(rank, world_size, devices_per_node)
                    .and_then(|topology| build_trainer(&config, topology, local, global, Device::Cpu, headless))
                    .and_then(|mut trainer| trainer.fit());
                let _ = sender.send((rank, result));
            })
            .context("failed to spawn participant thread")?;
    }
    drop(sender);

    match receiver.recv() {
        Ok((rank, Err(e))) => Err(e.context(format!("participant {} failed", rank))),
        Ok((_, Ok(()))) => Ok(()),
        Err(_) => bail!("every participant exited without reporting"),
    }
}
