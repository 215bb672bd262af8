use anyhow::Result;
use clap::Parser;

use diloco::config::{CommBackend, Config, MetricLoggerType, ShardingStrategy, TargetDevice};
use diloco::launch;

/// Diloco: sharded intra-node training with periodic cross-node synchronization
#[derive(Parser, Debug)]
#[command(name = "diloco")]
#[command(about = "Hierarchical data-parallel language-model training", long_about = None)]
struct Args {
    /// Path to the configuration YAML file (defaults apply when omitted)
    #[arg(short = 'f', long = "config")]
    config_file: Option<String>,

    /// Run NODESxDEVICES participants as threads in this process (CPU only)
    #[arg(long = "simulate")]
    simulate: Option<String>,

    /// Headless mode: plain log lines, no progress display
    #[arg(long)]
    headless: bool,

    /// Override diloco.outer_lr
    #[arg(long = "outer-lr")]
    outer_lr: Option<f64>,

    /// Override diloco.local_steps
    #[arg(long = "local-steps")]
    local_steps: Option<usize>,

    /// Override the model preset name or model YAML path
    #[arg(long = "path-model")]
    path_model: Option<String>,

    /// Override sequence length
    #[arg(long = "seq-len")]
    seq_length: Option<usize>,

    /// Override the number of prefetched batches (0 = inline loading)
    #[arg(long = "num-workers")]
    num_workers: Option<usize>,

    /// Override the peak inner learning rate
    #[arg(long = "lr")]
    lr: Option<f64>,

    /// Override the global batch size
    #[arg(long = "total-batch-size")]
    total_batch_size: Option<usize>,

    /// Override the per-device micro-batch size
    #[arg(long = "per-device-batch-size")]
    per_device_train_batch_size: Option<usize>,

    #[arg(long = "warmup-steps")]
    warmup_steps: Option<usize>,

    #[arg(long = "total-steps")]
    total_steps: Option<usize>,

    /// Override sharding: FULL_SHARD, SHARD_GRAD_OP or NO_SHARD
    #[arg(long = "sharding-strategy")]
    sharding_strategy: Option<ShardingStrategy>,

    #[arg(long = "project")]
    project: Option<String>,

    /// Override the metric sink: jsonl or dummy
    #[arg(long = "metric-logger")]
    metric_logger_type: Option<MetricLoggerType>,

    /// Train on seeded random tokens
    #[arg(long = "fake-data")]
    fake_data: bool,

    /// Override the pre-tokenized dataset path
    #[arg(short = 'd', long = "data")]
    dataset: Option<String>,

    /// Override target device: "gpu" or "cpu"
    #[arg(long = "target-device")]
    target_device: Option<TargetDevice>,

    #[arg(long = "seed")]
    seed: Option<u64>,

    #[arg(long = "log-dir")]
    log_dir: Option<String>,
}

/// Apply `value` to `field` and report it unless headless
fn apply_override<T: std::fmt::Debug>(headless: bool, name: &str, field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        if !headless {
            println!("CLI override: {} = {:?} (was {:?})", name, value, field);
        }
        *field = value;
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let headless = args.headless;

    if !headless {
        println!("=== Diloco Training ===");
    }

    let mut config = match &args.config_file {
        Some(path) => {
            if !headless {
                println!("Loading configuration from: {}", path);
            }
            Config::from_yaml(path)?
        }
        None => Config::default(),
    };

    apply_override(headless, "diloco.outer_lr", &mut config.diloco.outer_lr, args.outer_lr);
    apply_override(headless, "diloco.local_steps", &mut config.diloco.local_steps, args.local_steps);
    apply_override(headless, "path_model", &mut config.path_model, args.path_model);
    apply_override(headless, "seq_length", &mut config.seq_length, args.seq_length);
    apply_override(headless, "num_workers", &mut config.num_workers, args.num_workers);
    apply_override(headless, "lr", &mut config.lr, args.lr);
    apply_override(headless, "total_batch_size", &mut config.total_batch_size, args.total_batch_size);
    apply_override(
        headless,
        "per_device_train_batch_size",
        &mut config.per_device_train_batch_size,
        args.per_device_train_batch_size,
    );
    apply_override(headless, "warmup_steps", &mut config.warmup_steps, args.warmup_steps);
    apply_override(headless, "total_steps", &mut config.total_steps, args.total_steps);
    apply_override(headless, "sharding_strategy", &mut config.sharding_strategy, args.sharding_strategy);
    apply_override(headless, "project", &mut config.project, args.project);
    apply_override(headless, "metric_logger_type", &mut config.metric_logger_type, args.metric_logger_type);
    apply_override(headless, "fake_data", &mut config.fake_data, args.fake_data.then_some(true));
    apply_override(headless, "dataset_name_or_path", &mut config.dataset_name_or_path, args.dataset);
    apply_override(headless, "target_device", &mut config.target_device, args.target_device);
    apply_override(headless, "seed", &mut config.seed, args.seed);
    apply_override(headless, "log_dir", &mut config.log_dir, args.log_dir);

    config.validate()?;

    match args.simulate {
        Some(grid) => {
            let (nodes, devices) = launch::parse_grid(&grid)?;
            config.backend = CommBackend::Threads;
            config.target_device = TargetDevice::Cpu;
            if !headless {
                println!("Simulating {} node(s) x {} device(s) in-process\n", nodes, devices);
            }
            launch::simulate(&config, nodes, devices, headless)
        }
        None => launch::run_from_env(&config, headless),
    }
}
