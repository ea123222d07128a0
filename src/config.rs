//! Run configuration.
//!
//! A run is described by a JSON document with two sections: the execution
//! manager (which benchmarks to run and how to tear them down) and the
//! execution monitor (which strategy supervises them, and its parameters).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;

use crate::benchmark::Benchmark;
use crate::error::Error;
use crate::perf::event::ReadMode;
use crate::util::process::KillMode;

/// The only execution manager there is.
pub const SIMPLE_MANAGER: &str = "simple";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub exec_manager: ManagerConfig,
    #[serde(default)]
    pub exec_monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    #[serde(rename = "type", default = "default_manager")]
    pub kind: String,

    #[serde(default)]
    pub kill_mode: KillMode,

    /// Upper bound on the run, in milliseconds.
    #[serde(default)]
    pub time_limit: Option<u64>,

    pub benchmarks: Vec<BenchmarkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchmarkConfig {
    pub name: String,
    pub cmd: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Registry key of the strategy.
    #[serde(rename = "type", default = "default_monitor")]
    pub kind: String,

    /// Length of one supervisory tick, in milliseconds.
    #[serde(default = "default_sampling_length")]
    pub sampling_length: u64,

    /// Counter backend. When absent the backend implied by `kind` is used.
    #[serde(default)]
    pub event: Option<String>,

    #[serde(default)]
    pub read_mode: ReadMode,

    /// Attach counters immediately rather than enabling them on exec.
    #[serde(default = "default_attach")]
    pub attach: bool,

    /// CPUs handed out by the CPU hopper. Defaults to the allowed set.
    #[serde(default)]
    pub cpus: Option<Vec<usize>>,
}

fn default_manager() -> String {
    SIMPLE_MANAGER.to_string()
}

fn default_monitor() -> String {
    "simple".to_string()
}

fn default_sampling_length() -> u64 {
    1000
}

fn default_attach() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            kind: default_monitor(),
            sampling_length: default_sampling_length(),
            event: None,
            read_mode: ReadMode::default(),
            attach: default_attach(),
            cpus: None,
        }
    }
}

impl MonitorConfig {
    /// A configuration for the given strategy with every parameter defaulted.
    pub fn with_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn sampling_length(&self) -> Duration {
        Duration::from_millis(self.sampling_length)
    }
}

impl ManagerConfig {
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit.map(Duration::from_millis)
    }

    /// Build the benchmark set, assigning ids in document order.
    pub fn benchmarks(&self) -> Result<Vec<Benchmark>> {
        self.benchmarks
            .iter()
            .enumerate()
            .map(|(id, b)| {
                Benchmark::from_command(id, &b.name, &b.cmd)
                    .with_context(|| format!("invalid benchmark {:?}", b.name))
            })
            .collect()
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("failed to load configuration {}", path.display()))
    }

    /// Parse and validate a configuration document.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.exec_manager.kind != SIMPLE_MANAGER {
            return Err(Error::InvalidConfig(format!(
                "unknown execution manager {:?}",
                self.exec_manager.kind
            ))
            .into());
        }
        if self.exec_manager.benchmarks.is_empty() {
            return Err(Error::InvalidConfig("no benchmarks given".to_string()).into());
        }
        if self.exec_monitor.sampling_length == 0 {
            return Err(Error::InvalidConfig("sampling_length must be positive".to_string()).into());
        }
        if self.exec_manager.time_limit == Some(0) {
            return Err(Error::InvalidConfig("time_limit must be positive".to_string()).into());
        }
        self.exec_manager.benchmarks()?;
        Ok(())
    }
}
