//! Metric sinks
//!
//! Only the metric-emitting participant (global rank 0) owns a real sink; the
//! others never construct one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::Config;

/// Which sink rank 0 writes to
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricLoggerType {
    /// Append JSON lines under `<log_dir>/<project>/`
    #[default]
    Jsonl,
    /// Discard everything
    Dummy,
}

impl std::str::FromStr for MetricLoggerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jsonl" | "json" => Ok(MetricLoggerType::Jsonl),
            "dummy" | "none" => Ok(MetricLoggerType::Dummy),
            _ => Err(format!("Unknown metric logger: {}. Valid options: jsonl, dummy", s)),
        }
    }
}

/// Scalars reported after every inner step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    #[serde(rename = "Loss")]
    pub loss: f64,
    pub step: usize,
    pub inner_lr: f64,
}

pub trait MetricSink {
    fn log(&mut self, metrics: &StepMetrics) -> Result<()>;
    /// Flush and close; called once when the run ends
    fn finish(&mut self) -> Result<()>;
}

/// Writes one JSON object per line to `metrics.jsonl`
pub struct JsonlMetricSink {
    writer: Option<BufWriter<File>>,
}

impl JsonlMetricSink {
    /// Create `<log_dir>/<project>/`, record the run configuration in
    /// `run.json` and open `metrics.jsonl` for appending.
    pub fn create(config: &Config, world_size: usize) -> Result<Self> {
        let dir = Path::new(&config.log_dir).join(&config.project);
        fs::create_dir_all(&dir).with_context(|| format!("cannot create metrics directory {}", dir.display()))?;

        let run_info = serde_json::json!({
            "project": config.project,
            "started_at": chrono::Local::now().to_rfc3339(),
            "world_size": world_size,
            "config": config,
        });
        let run_path = dir.join("run.json");
        fs::write(&run_path, serde_json::to_string_pretty(&run_info)?)
            .with_context(|| format!("cannot write {}", run_path.display()))?;

        let metrics_path = dir.join("metrics.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&metrics_path)
            .with_context(|| format!("cannot open {}", metrics_path.display()))?;

        Ok(Self {
            writer: Some(BufWriter::new(file)),
        })
    }
}

impl MetricSink for JsonlMetricSink {
    fn log(&mut self, metrics: &StepMetrics) -> Result<()> {
        let writer = self.writer.as_mut().context("metric sink already finished")?;
        serde_json::to_writer(&mut *writer, metrics)?;
        writeln!(writer)?;
        // A killed run should still leave every logged step on disk
        writer.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// No-op sink
#[derive(Debug, Default)]
pub struct DummyMetricSink;

impl MetricSink for DummyMetricSink {
    fn log(&mut self, _metrics: &StepMetrics) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Build the sink selected by `config.metric_logger_type`
pub fn create_metric_sink(config: &Config, world_size: usize) -> Result<Box<dyn MetricSink>> {
    match config.metric_logger_type {
        MetricLoggerType::Jsonl => Ok(Box::new(JsonlMetricSink::create(config, world_size)?)),
        MetricLoggerType::Dummy => Ok(Box::new(DummyMetricSink)),
    }
}
