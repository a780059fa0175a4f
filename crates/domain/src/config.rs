use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node id of this controller within the cluster.
    #[serde(default = "d_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub ctrl: CtrlConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub rdm: RdmConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

/// A problem found while validating a loaded config.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Config {
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let mut error = |message: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message,
            })
        };
        if self.node_id.is_empty() {
            error("node_id must not be empty".into());
        }
        if self.network.create_circuit_retries == 0 {
            error("network.create_circuit_retries must be at least 1".into());
        }
        if self.network.cycle_seconds == 0 {
            error("network.cycle_seconds must be at least 1".into());
        }
        if self.ctrl.heartbeat_interval_secs == 0 {
            error("ctrl.heartbeat_interval_secs must be at least 1".into());
        }
        if self.rdm.log_size == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "rdm.log_size is 0; every router reconnect forces a full re-seed".into(),
            });
        }
        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router control channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtrlConfig {
    #[serde(default = "d_bind")]
    pub bind: String,
    /// Heartbeat send interval.
    #[serde(default = "d_3")]
    pub heartbeat_interval_secs: u64,
    /// Channel is flagged unresponsive when heartbeat round-trip exceeds
    /// this, or when no response arrives within it.
    #[serde(default = "d_5")]
    pub unresponsive_after_secs: u64,
    /// Per-message send timeout for outbound router RPCs.
    #[serde(default = "d_10")]
    pub send_timeout_secs: u64,
    /// Bounded outbound worker pool.
    #[serde(default = "d_queue")]
    pub queue_size: usize,
    #[serde(default = "d_workers")]
    pub max_workers: usize,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self {
            bind: d_bind(),
            heartbeat_interval_secs: 3,
            unresponsive_after_secs: 5,
            send_timeout_secs: 10,
            queue_size: d_queue(),
            max_workers: d_workers(),
        }
    }
}

impl CtrlConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn unresponsive_after(&self) -> Duration {
        Duration::from_secs(self.unresponsive_after_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Network / circuit options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Supervisor tick.
    #[serde(default = "d_60")]
    pub cycle_seconds: u64,
    /// Route-program dispatch timeout per attempt.
    #[serde(default = "d_10")]
    pub route_timeout_secs: u64,
    /// Circuit creation attempts before giving up.
    #[serde(default = "d_3_u32")]
    pub create_circuit_retries: u32,
    /// Failed links older than this are dropped by the clean pass.
    #[serde(default = "d_30")]
    pub failed_link_grace_secs: u64,
    /// Pending links older than this are eligible for redial.
    #[serde(default = "d_10")]
    pub pending_link_timeout_secs: u64,
    /// Initial latency charged to a link before it is measured.
    #[serde(default = "d_initial_latency_ms")]
    pub initial_link_latency_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cycle_seconds: 60,
            route_timeout_secs: 10,
            create_circuit_retries: 3,
            failed_link_grace_secs: 30,
            pending_link_timeout_secs: 10,
            initial_link_latency_ms: d_initial_latency_ms(),
        }
    }
}

impl NetworkConfig {
    pub fn cycle(&self) -> Duration {
        Duration::from_secs(self.cycle_seconds)
    }

    pub fn route_timeout(&self) -> Duration {
        Duration::from_secs(self.route_timeout_secs)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RDM replication
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmConfig {
    /// Change-sets retained for replay to reconnecting routers.
    #[serde(default = "d_log_size")]
    pub log_size: usize,
    /// Buffer size of per-subscriber change-set channels.
    #[serde(default = "d_listener_buffer")]
    pub listener_buffer: usize,
}

impl Default for RdmConfig {
    fn default() -> Self {
        Self {
            log_size: d_log_size(),
            listener_buffer: d_listener_buffer(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage & cluster
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "d_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: d_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Raft data directory. `None` runs the single-node local dispatcher.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Target in-flight command window for the adaptive rate limiter.
    #[serde(default = "d_inflight")]
    pub max_inflight_commands: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_inflight_commands: d_inflight(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_node_id() -> String {
    "ctrl1".into()
}
fn d_bind() -> String {
    "127.0.0.1:6262".into()
}
fn d_3() -> u64 {
    3
}
fn d_5() -> u64 {
    5
}
fn d_10() -> u64 {
    10
}
fn d_30() -> u64 {
    30
}
fn d_60() -> u64 {
    60
}
fn d_3_u32() -> u32 {
    3
}
fn d_queue() -> usize {
    1000
}
fn d_workers() -> usize {
    32
}
fn d_initial_latency_ms() -> u64 {
    65_000
}
fn d_log_size() -> usize {
    10_000
}
fn d_listener_buffer() -> usize {
    64
}
fn d_store_path() -> PathBuf {
    PathBuf::from("./data/trellis.db.json")
}
fn d_inflight() -> usize {
    256
}
