use anyhow::{bail, Result};
use candle_core::Tensor;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::data::DataLoader;
use crate::distributed::GroupHandle;
use crate::metrics::{MetricSink, StepMetrics};
use crate::offload::OffloadedParameterStore;
use crate::outer::OuterSynchronizer;
use crate::schedule::{CosineWithWarmup, LrScheduler};
use crate::sharding::ShardedModelReplica;
use crate::topology::ProcessTopology;

/// Where a participant is within the current round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// Running gradient-accumulation micro-steps
    Accumulating,
    /// Clipping and stepping the inner optimizer
    InnerOptimizerStep,
    /// Averaging pseudo-gradients and stepping the outer optimizer
    OuterSync,
}

/// Drives rounds of `local_steps` inner steps followed by one outer sync.
///
/// Every participant runs the same control flow; only the primary (global
/// rank 0) logs steps and reports metrics.
pub struct DilocoTrainer {
    topology: ProcessTopology,
    replica: ShardedModelReplica,
    store: OffloadedParameterStore,
    outer: OuterSynchronizer,
    scheduler: LrScheduler,
    data_loader: Box<dyn DataLoader>,
    metric_sink: Option<Box<dyn MetricSink>>,
    local_steps: usize,
    max_grad_norm: f64,
    outer_step: usize,
    last_real_step: usize,
    phase: RoundPhase,
    progress: Option<ProgressBar>,
    started: Instant,
}

impl DilocoTrainer {
    /// Wrap an already-synchronized replica.
    ///
    /// The offloaded store is seeded from the replica's current parameters,
    /// which is a collective over the local group when they are stale.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        topology: ProcessTopology,
        mut replica: ShardedModelReplica,
        global: GroupHandle,
        data_loader: Box<dyn DataLoader>,
        metric_sink: Option<Box<dyn MetricSink>>,
        headless: bool,
    ) -> Result<Self> {
        let store = OffloadedParameterStore::new(replica.parameter_names(), replica.snapshot_full_parameters()?)?;
        let outer = OuterSynchronizer::new(global, replica.local_group(), config.diloco.outer_lr);
        let scheduler = LrScheduler::new(CosineWithWarmup::new(config.lr, config.warmup_steps, config.total_steps));

        let progress = if topology.is_primary() && !headless {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {msg}") {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(120));
            Some(pb)
        } else {
            None
        };

        Ok(Self {
            topology,
            replica,
            store,
            outer,
            scheduler,
            data_loader,
            metric_sink,
            local_steps: config.diloco.local_steps,
            max_grad_norm: config.max_grad_norm,
            outer_step: 0,
            last_real_step: 0,
            phase: RoundPhase::Accumulating,
            progress,
            started: Instant::now(),
        })
    }

    /// Completed rounds
    pub fn outer_step(&self) -> usize {
        self.outer_step
    }

    /// `real_step` of the most recent inner step (0 before the first one)
    pub fn last_real_step(&self) -> usize {
        self.last_real_step
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn replica(&self) -> &ShardedModelReplica {
        &self.replica
    }

    pub fn replica_mut(&mut self) -> &mut ShardedModelReplica {
        &mut self.replica
    }

    pub fn store(&self) -> &OffloadedParameterStore {
        &self.store
    }

    pub fn scheduler(&self) -> &LrScheduler {
        &self.scheduler
    }

    /// Start from `values` (in [`ShardedModelReplica::parameter_names`] order)
    /// instead of the random initialization.
    ///
    /// Only before the first inner step. No communication: every participant
    /// must load the same values.
    pub fn load_parameters(&mut self, values: &[Tensor]) -> Result<()> {
        if self.last_real_step > 0 {
            bail!("parameters can only be loaded before training starts");
        }
        self.replica.apply_full_parameters(values)?;
        let snapshot = self.replica.snapshot_full_parameters()?;
        self.store = OffloadedParameterStore::new(self.replica.parameter_names(), snapshot)?;
        Ok(())
    }

    fn log(&self, message: &str) {
        let line = format!("[rank {}] {}", self.topology.local_rank, message);
        match &self.progress {
            Some(pb) => pb.suspend(|| info!("{}", line)),
            None => info!("{}", line),
        }
    }

    /// One inner step: all micro-steps, clip, inner optimizer, schedule.
    ///
    /// `inner_step` is the position within the current round.
    pub fn inner_step(&mut self, inner_step: usize) -> Result<StepMetrics> {
        let accumulation_steps = self.replica.gradient_accumulation_steps();

        self.phase = RoundPhase::Accumulating;
        let mut loss_batch = 0.0;
        for micro_step in 0..accumulation_steps {
            let batch = self.data_loader.next_batch()?;
            // Only the last micro-step reduces gradients across the local group
            let communicate = micro_step + 1 == accumulation_steps;
            loss_batch += self.replica.forward_backward(&batch, communicate)?;
        }

        self.phase = RoundPhase::InnerOptimizerStep;
        let grad_norm = self.replica.clip_gradients(self.max_grad_norm)?;
        self.replica.optimizer_step(self.scheduler.current_lr())?;
        let inner_lr = self.scheduler.step();
        self.replica.zero_grad();

        let real_step = self.outer_step * self.local_steps + inner_step + 1;
        self.last_real_step = real_step;
        let metrics = StepMetrics {
            loss: loss_batch,
            step: real_step,
            inner_lr,
        };

        if let Some(sink) = self.metric_sink.as_mut() {
            sink.log(&metrics)?;
        }
        if self.topology.is_primary() {
            self.log(&format!("step: {}, loss: {}, inner_lr: {}", real_step, loss_batch, inner_lr));
            if let Some(pb) = &self.progress {
                pb.set_message(format!(
                    "round {} | step {} | loss: {:.4} | grad: {:.4} | lr: {:.3e}",
                    self.outer_step, real_step, loss_batch, grad_norm, inner_lr
                ));
            }
        }
        debug!(
            "[rank {}] step {} grad_norm {:.4}",
            self.topology.local_rank, real_step, grad_norm
        );

        Ok(metrics)
    }

    /// `local_steps` inner steps followed by the outer synchronization.
    ///
    /// Collective over both groups. `outer_step` advances only once the
    /// averaged outer update has been written back into the live model.
    pub fn run_round(&mut self) -> Result<()> {
        if self.topology.is_primary() {
            self.log(&format!("outer_step step: {}", self.outer_step));
        }

        for inner_step in 0..self.local_steps {
            self.inner_step(inner_step)?;
        }

        self.phase = RoundPhase::OuterSync;
        let live = self.replica.snapshot_full_parameters()?;
        self.store.compute_pseudo_gradients(&live)?;
        self.outer.synchronize(&mut self.store)?;
        self.replica.apply_full_parameters(&self.store.values())?;

        self.outer_step += 1;
        self.phase = RoundPhase::Accumulating;
        debug!(
            "[rank {}] round {} done after {:.1}s",
            self.topology.local_rank,
            self.outer_step,
            self.started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Run rounds until the process is stopped or a round fails
    pub fn fit(&mut self) -> Result<()> {
        loop {
            if let Err(e) = self.run_round() {
                // Keep what was logged so far; the round error takes precedence
                let _ = self.finish();
                return Err(e);
            }
        }
    }

    /// Close the metric sink and the progress display
    pub fn finish(&mut self) -> Result<()> {
        if let Some(pb) = self.progress.take() {
            pb.finish_and_clear();
        }
        if let Some(sink) = self.metric_sink.as_mut() {
            sink.finish()?;
        }
        Ok(())
    }
}
