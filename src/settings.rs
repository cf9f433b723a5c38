use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::retry::RetryLimits;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Where objects are stored.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,
    /// Directory for `fs`, object store URL for `url`, ignored for `memory`.
    #[serde(default = "default_backend_path")]
    pub path: String,
    /// Upper bound for acquiring an advisory object lock. `None` waits forever.
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,
    /// SlateDB memtable flush interval.
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            path: default_backend_path(),
            lock_timeout_ms: None,
            flush_interval_ms: None,
        }
    }
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Fs
}

fn default_backend_path() -> String {
    "/tmp/ostoredb".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Fs,
    Memory,
    Url,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Number of tasks running enqueue bottom halves.
    #[serde(default = "default_enqueue_workers")]
    pub enqueue_workers: usize,
    /// Bottom halves allowed to be in flight before `queue_*` calls wait.
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding_enqueues: usize,
    /// Backlog size at which producers start being slowed down.
    #[serde(default = "default_delay_threshold")]
    pub backlog_delay_threshold: usize,
    /// Backlog size at which the slowdown reaches `backlog_max_delay_ms`.
    #[serde(default = "default_delay_ceiling")]
    pub backlog_delay_ceiling: usize,
    #[serde(default = "default_max_delay_ms")]
    pub backlog_max_delay_ms: u64,
    #[serde(default = "default_archive_shard_size")]
    pub archive_shard_size: usize,
    #[serde(default = "default_retrieve_shard_size")]
    pub retrieve_shard_size: usize,
    /// Age after which cached per-VID retrieve statistics are refreshed.
    #[serde(default = "default_stats_max_age_ms")]
    pub retrieve_stats_max_age_ms: u64,
    #[serde(default)]
    pub retry_limits: RetryLimits,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enqueue_workers: default_enqueue_workers(),
            max_outstanding_enqueues: default_max_outstanding(),
            backlog_delay_threshold: default_delay_threshold(),
            backlog_delay_ceiling: default_delay_ceiling(),
            backlog_max_delay_ms: default_max_delay_ms(),
            archive_shard_size: default_archive_shard_size(),
            retrieve_shard_size: default_retrieve_shard_size(),
            retrieve_stats_max_age_ms: default_stats_max_age_ms(),
            retry_limits: RetryLimits::default(),
        }
    }
}

fn default_enqueue_workers() -> usize {
    5
}

fn default_max_outstanding() -> usize {
    25_000
}

fn default_delay_threshold() -> usize {
    10_000
}

fn default_delay_ceiling() -> usize {
    25_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_archive_shard_size() -> usize {
    25_000
}

fn default_retrieve_shard_size() -> usize {
    25_000
}

fn default_stats_max_age_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Time without heartbeat progress after which an agent is declared dead.
    #[serde(default = "default_agent_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_agent_timeout_ms(),
            gc_interval_ms: default_gc_interval_ms(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_agent_timeout_ms() -> u64 {
    30_000
}

fn default_gc_interval_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }
}
