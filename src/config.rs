use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// Default value functions for serde
fn default_outer_lr() -> f64 { 0.7 }
fn default_local_steps() -> usize { 10 }
fn default_path_model() -> String { "llama-150m".to_string() }
fn default_seq_length() -> usize { 1024 }
fn default_num_workers() -> usize { 4 }
fn default_lr() -> f64 { 4e-4 }
fn default_total_batch_size() -> usize { 512 }
fn default_per_device_train_batch_size() -> usize { 32 }
fn default_warmup_steps() -> usize { 1000 }
fn default_total_steps() -> usize { 88_000 }
fn default_project() -> String { "debug".to_string() }
fn default_dataset() -> String { "data/train.bin".to_string() }
fn default_seed() -> u64 { 42 }
fn default_log_dir() -> String { "./runs".to_string() }
fn default_max_grad_norm() -> f64 { 1.0 }
fn default_rope_theta() -> f32 { 10000.0 }
fn default_rms_norm_eps() -> f64 { 1e-5 }

// Re-export the enums that appear in the configuration surface
pub use crate::distributed::sync::CommBackend;
pub use crate::metrics::MetricLoggerType;
pub use crate::sharding::ShardingStrategy;

/// Outer (cross-node) optimization settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DilocoConfig {
    /// Learning rate of the Nesterov momentum outer optimizer
    #[serde(default = "default_outer_lr")]
    pub outer_lr: f64,
    /// Inner steps per synchronization round
    #[serde(default = "default_local_steps")]
    pub local_steps: usize,
}

impl Default for DilocoConfig {
    fn default() -> Self {
        Self {
            outer_lr: default_outer_lr(),
            local_steps: default_local_steps(),
        }
    }
}

/// Target device for training
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetDevice {
    #[default]
    Gpu,
    Cpu,
}

impl std::str::FromStr for TargetDevice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gpu" | "cuda" => Ok(TargetDevice::Gpu),
            "cpu" => Ok(TargetDevice::Cpu),
            _ => Err(format!("Unknown target device: {}. Valid options: gpu, cpu", s)),
        }
    }
}

/// Complete run configuration, immutable once training starts
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub diloco: DilocoConfig,

    /// Model preset name or path to a model YAML file
    #[serde(default = "default_path_model")]
    pub path_model: String,
    #[serde(default = "default_seq_length")]
    pub seq_length: usize,
    /// Batches produced ahead of time by the data loader (0 = inline)
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Peak inner learning rate
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// Sequences per inner step across the whole world
    #[serde(default = "default_total_batch_size")]
    pub total_batch_size: usize,
    #[serde(default = "default_per_device_train_batch_size")]
    pub per_device_train_batch_size: usize,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    #[serde(default = "default_total_steps")]
    pub total_steps: usize,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,

    #[serde(default)]
    pub sharding_strategy: ShardingStrategy,
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default)]
    pub metric_logger_type: MetricLoggerType,
    /// Train on seeded random tokens instead of the dataset
    #[serde(default)]
    pub fake_data: bool,
    #[serde(default = "default_dataset")]
    pub dataset_name_or_path: String,

    #[serde(default)]
    pub target_device: TargetDevice,
    #[serde(default)]
    pub backend: CommBackend,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            diloco: DilocoConfig::default(),
            path_model: default_path_model(),
            seq_length: default_seq_length(),
            num_workers: default_num_workers(),
            lr: default_lr(),
            total_batch_size: default_total_batch_size(),
            per_device_train_batch_size: default_per_device_train_batch_size(),
            warmup_steps: default_warmup_steps(),
            total_steps: default_total_steps(),
            max_grad_norm: default_max_grad_norm(),
            sharding_strategy: ShardingStrategy::default(),
            project: default_project(),
            metric_logger_type: MetricLoggerType::default(),
            fake_data: false,
            dataset_name_or_path: default_dataset(),
            target_device: TargetDevice::default(),
            backend: CommBackend::default(),
            seed: default_seed(),
            log_dir: default_log_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    ///
    /// Missing fields take their default values. The result is validated
    /// before it is returned.
    ///
    /// # Errors
    /// - File not found
    /// - Invalid YAML syntax
    /// - Type mismatches in YAML values
    /// - Constraint violations (see [`Config::validate`])
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {}", path.display(), e))?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the constraints that do not depend on the world size
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.diloco.local_steps == 0 {
            anyhow::bail!("diloco.local_steps must be positive");
        }
        if !(self.diloco.outer_lr > 0.0) {
            anyhow::bail!("diloco.outer_lr must be positive, got {}", self.diloco.outer_lr);
        }
        if !(self.lr > 0.0) {
            anyhow::bail!("lr must be positive, got {}", self.lr);
        }
        if !(self.max_grad_norm > 0.0) {
            anyhow::bail!("max_grad_norm must be positive, got {}", self.max_grad_norm);
        }
        if self.seq_length == 0 {
            anyhow::bail!("seq_length must be positive");
        }
        if self.total_steps == 0 {
            anyhow::bail!("total_steps must be positive");
        }
        if self.warmup_steps > self.total_steps {
            anyhow::bail!(
                "warmup_steps ({}) cannot exceed total_steps ({})",
                self.warmup_steps,
                self.total_steps
            );
        }
        if self.total_batch_size == 0 || self.per_device_train_batch_size == 0 {
            anyhow::bail!("total_batch_size and per_device_train_batch_size must be positive");
        }
        if self.project.is_empty() {
            anyhow::bail!("project must not be empty");
        }
        Ok(())
    }

    /// Derive the per-device batch plan for a world of `world_size` devices
    pub fn batch_plan(&self, world_size: usize) -> anyhow::Result<BatchPlan> {
        BatchPlan::new(self.total_batch_size, world_size, self.per_device_train_batch_size)
    }
}

/// How the global batch is split across devices and accumulation micro-steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchPlan {
    pub total_batch_size: usize,
    pub world_size: usize,
    pub per_device_batch_size: usize,
    /// Sequences each device processes per inner step
    pub batch_size_per_device: usize,
    pub gradient_accumulation_steps: usize,
}

impl BatchPlan {
    /// `gradient_accumulation_steps = (total / world) / per_device`.
    ///
    /// Both divisions must be exact.
    pub fn new(total_batch_size: usize, world_size: usize, per_device_batch_size: usize) -> anyhow::Result<Self> {
        if world_size == 0 || per_device_batch_size == 0 || total_batch_size == 0 {
            anyhow::bail!(
                "batch sizes and world size must be positive (total={}, world={}, per_device={})",
                total_batch_size,
                world_size,
                per_device_batch_size
            );
        }
        if total_batch_size % world_size != 0 {
            anyhow::bail!(
                "total_batch_size ({}) must be divisible by world_size ({})",
                total_batch_size,
                world_size
            );
        }
        let batch_size_per_device = total_batch_size / world_size;
        if batch_size_per_device % per_device_batch_size != 0 {
            anyhow::bail!(
                "batch size per device ({}) must be divisible by per_device_train_batch_size ({})",
                batch_size_per_device,
                per_device_batch_size
            );
        }

        Ok(Self {
            total_batch_size,
            world_size,
            per_device_batch_size,
            batch_size_per_device,
            gradient_accumulation_steps: batch_size_per_device / per_device_batch_size,
        })
    }
}

/// Llama-style decoder dimensions
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelConfig {
    pub name: String,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    /// Grouped-query attention KV heads (defaults to `num_heads`)
    pub kv_heads: Option<usize>,
    /// SwiGLU hidden width (defaults to `4 * hidden_size`)
    pub intermediate_size: Option<usize>,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
}

impl ModelConfig {
    /// ~150M parameter Llama
    pub fn llama_150m() -> Self {
        Self {
            name: "llama-150m".to_string(),
            hidden_size: 1024,
            num_layers: 12,
            num_heads: 16,
            kv_heads: None,
            intermediate_size: Some(4096),
            vocab_size: 32000,
            max_seq_len: 1024,
            rope_theta: default_rope_theta(),
            rms_norm_eps: default_rms_norm_eps(),
        }
    }

    /// Tiny Llama for smoke tests and CPU simulation
    pub fn llama_tiny() -> Self {
        Self {
            name: "llama-tiny".to_string(),
            hidden_size: 64,
            num_layers: 2,
            num_heads: 4,
            kv_heads: Some(2),
            intermediate_size: Some(128),
            vocab_size: 1024,
            max_seq_len: 256,
            rope_theta: default_rope_theta(),
            rms_norm_eps: default_rms_norm_eps(),
        }
    }

    /// Resolve `path_model`: a preset name, otherwise a YAML file
    pub fn resolve(path_model: &str) -> anyhow::Result<Self> {
        let config = match path_model {
            "llama-150m" => Self::llama_150m(),
            "llama-tiny" => Self::llama_tiny(),
            path => {
                let content = fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!(
                        "path_model '{}' is neither a preset (llama-150m, llama-tiny) nor a readable file: {}",
                        path,
                        e
                    )
                })?;
                serde_yaml::from_str(&content)?
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            anyhow::bail!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size,
                self.num_heads
            );
        }
        let kv_heads = self.kv_heads.unwrap_or(self.num_heads);
        if kv_heads == 0 || self.num_heads % kv_heads != 0 {
            anyhow::bail!("num_heads ({}) must be divisible by kv_heads ({})", self.num_heads, kv_heads);
        }
        if (self.hidden_size / self.num_heads) % 2 != 0 {
            anyhow::bail!("head dimension must be even for rotary embeddings");
        }
        if self.vocab_size == 0 || self.num_layers == 0 {
            anyhow::bail!("vocab_size and num_layers must be positive");
        }
        Ok(())
    }

    /// Estimate parameter count in short format (e.g., "117m", "1.5b")
    pub fn estimate_params_short(&self) -> String {
        let head_dim = self.hidden_size / self.num_heads;
        let kv_heads = self.kv_heads.unwrap_or(self.num_heads);
        let kv_size = kv_heads * head_dim;
        let intermediate_size = self.intermediate_size.unwrap_or(self.hidden_size * 4);

        // Embedding
        let embed = self.vocab_size * self.hidden_size;

        // Attention per layer
        let attn = self.hidden_size * self.hidden_size +  // Q
                   self.hidden_size * kv_size +           // K
                   self.hidden_size * kv_size +           // V
                   self.hidden_size * self.hidden_size;   // O

        // MLP per layer
        let mlp = self.hidden_size * intermediate_size * 3;

        // Per layer total
        let layer = attn + mlp + 2 * self.hidden_size;

        // LM head + final norm
        let head = self.hidden_size * self.vocab_size + self.hidden_size;

        let total = embed + self.num_layers * layer + head;

        if total >= 1_000_000_000 {
            format!("{:.1}b", total as f64 / 1_000_000_000.0)
        } else if total >= 1_000_000 {
            format!("{}m", total / 1_000_000)
        } else {
            format!("{}k", total / 1000)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_run() {
        let config = Config::default();
        assert_eq!(config.diloco.outer_lr, 0.7);
        assert_eq!(config.diloco.local_steps, 10);
        assert_eq!(config.path_model, "llama-150m");
        assert_eq!(config.total_batch_size, 512);
        assert_eq!(config.per_device_train_batch_size, 32);
        assert_eq!(config.warmup_steps, 1000);
        assert_eq!(config.total_steps, 88_000);
        assert_eq!(config.sharding_strategy, ShardingStrategy::FullShard);
        assert!(!config.fake_data);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "diloco:\n  local_steps: 3\nlr: 0.001\nsharding_strategy: NO_SHARD\nmetric_logger_type: dummy\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.diloco.local_steps, 3);
        assert_eq!(config.diloco.outer_lr, 0.7);
        assert_eq!(config.lr, 0.001);
        assert_eq!(config.sharding_strategy, ShardingStrategy::NoShard);
        assert_eq!(config.metric_logger_type, MetricLoggerType::Dummy);
        assert_eq!(config.seq_length, 1024);
    }

    #[test]
    fn test_from_yaml_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "diloco:\n  local_steps: 0").unwrap();
        assert!(Config::from_yaml(file.path()).is_err());
    }

    #[test]
    fn test_batch_plan_divisibility() {
        let plan = BatchPlan::new(512, 8, 32).unwrap();
        assert_eq!(plan.batch_size_per_device, 64);
        assert_eq!(plan.gradient_accumulation_steps, 2);

        // 512 / 3 is not exact
        assert!(BatchPlan::new(512, 3, 32).is_err());
        // 512 / 8 = 64, not divisible by 48
        assert!(BatchPlan::new(512, 8, 48).is_err());
        assert!(BatchPlan::new(512, 0, 32).is_err());
    }

    #[test]
    fn test_batch_plan_for_all_divisors() {
        let total = 96;
        for world in (1..=total).filter(|w| total % w == 0) {
            let per_world = total / world;
            for per_device in (1..=per_world).filter(|p| per_world % p == 0) {
                let plan = BatchPlan::new(total, world, per_device).unwrap();
                assert!(plan.gradient_accumulation_steps >= 1);
                assert_eq!(plan.gradient_accumulation_steps * per_device * world, total);
            }
        }
    }

    #[test]
    fn test_model_presets_valid() {
        ModelConfig::llama_150m().validate().unwrap();
        ModelConfig::llama_tiny().validate().unwrap();
        assert_eq!(ModelConfig::resolve("llama-tiny").unwrap().hidden_size, 64);
        assert!(ModelConfig::resolve("/nonexistent/model.yaml").is_err());
        assert_eq!(ModelConfig::llama_150m().estimate_params_short(), "266m");
    }

    #[test]
    fn test_model_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "name: custom\nhidden_size: 32\nnum_layers: 1\nnum_heads: 2\nkv_heads: null\nintermediate_size: null\nvocab_size: 64\nmax_seq_len: 16"
        )
        .unwrap();
        let model = ModelConfig::resolve(file.path().to_str().unwrap()).unwrap();
        assert_eq!(model.name, "custom");
        assert_eq!(model.rope_theta, 10000.0);
    }
}
