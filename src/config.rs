use crate::error::HaError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Upper bound for every configured interval, one year
pub const MAX_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedNode {
    pub node_id: String,
    pub hostname: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub seeds: Vec<SeedNode>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            hostname: default_hostname(),
            port: default_port(),
            seeds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_gossip_fanout")]
    pub gossip_fanout: usize,

    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    /// Leaders send a heartbeat every half of this
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_election_check_interval_ms")]
    pub election_check_interval_ms: u64,

    #[serde(default = "default_suspect_timeout_ms")]
    pub suspect_timeout_ms: u64,

    #[serde(default = "default_dead_timeout_ms")]
    pub dead_timeout_ms: u64,

    #[serde(default = "default_loop_error_backoff_ms")]
    pub loop_error_backoff_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: default_gossip_interval_ms(),
            gossip_fanout: default_gossip_fanout(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            election_check_interval_ms: default_election_check_interval_ms(),
            suspect_timeout_ms: default_suspect_timeout_ms(),
            dead_timeout_ms: default_dead_timeout_ms(),
            loop_error_backoff_ms: default_loop_error_backoff_ms(),
        }
    }
}

impl ClusterConfig {
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn election_timeout_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_min_ms),
            Duration::from_millis(self.election_timeout_max_ms),
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms / 2)
    }

    pub fn election_check_interval(&self) -> Duration {
        Duration::from_millis(self.election_check_interval_ms)
    }

    pub fn suspect_timeout(&self) -> Duration {
        Duration::from_millis(self.suspect_timeout_ms)
    }

    pub fn dead_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_timeout_ms)
    }

    pub fn loop_error_backoff(&self) -> Duration {
        Duration::from_millis(self.loop_error_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl LockConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    #[serde(default = "default_proposal_timeout_ms")]
    pub proposal_timeout_ms: u64,

    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            proposal_timeout_ms: default_proposal_timeout_ms(),
            retention_ms: default_retention_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl ConsensusConfig {
    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    #[serde(default = "default_cascade_threshold_depth")]
    pub cascade_threshold_depth: usize,

    #[serde(default = "default_cascade_window_ms")]
    pub cascade_window_ms: u64,

    #[serde(default = "default_cascade_quiescence_secs")]
    pub cascade_quiescence_secs: u64,

    #[serde(default = "default_critical_cascade_size")]
    pub critical_cascade_size: usize,

    #[serde(default = "default_max_concurrent_recoveries")]
    pub max_concurrent_recoveries: usize,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default = "default_recovery_timeout_secs")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default = "default_operation_retention_secs")]
    pub operation_retention_secs: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            cascade_threshold_depth: default_cascade_threshold_depth(),
            cascade_window_ms: default_cascade_window_ms(),
            cascade_quiescence_secs: default_cascade_quiescence_secs(),
            critical_cascade_size: default_critical_cascade_size(),
            max_concurrent_recoveries: default_max_concurrent_recoveries(),
            default_max_retries: default_max_retries(),
            default_timeout_secs: default_recovery_timeout_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            operation_retention_secs: default_operation_retention_secs(),
        }
    }
}

impl FailoverConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn cascade_window(&self) -> Duration {
        Duration::from_millis(self.cascade_window_ms)
    }

    pub fn cascade_quiescence(&self) -> Duration {
        Duration::from_secs(self.cascade_quiescence_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn operation_retention(&self) -> Duration {
        Duration::from_secs(self.operation_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    /// Directory for rolling JSON log files; console only when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,

    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
            max_files: default_max_log_files(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HaConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub locks: LockConfig,

    #[serde(default)]
    pub consensus: ConsensusConfig,

    #[serde(default)]
    pub failover: FailoverConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7946
}

fn default_gossip_interval_ms() -> u64 {
    5000
}

fn default_gossip_fanout() -> usize {
    3
}

fn default_election_timeout_min_ms() -> u64 {
    5000
}

fn default_election_timeout_max_ms() -> u64 {
    10000
}

fn default_heartbeat_timeout_ms() -> u64 {
    3000
}

fn default_election_check_interval_ms() -> u64 {
    500
}

fn default_suspect_timeout_ms() -> u64 {
    15000
}

fn default_dead_timeout_ms() -> u64 {
    30000
}

fn default_loop_error_backoff_ms() -> u64 {
    1000
}

fn default_lock_timeout_ms() -> u64 {
    30000
}

fn default_sweep_interval_ms() -> u64 {
    5000
}

fn default_threshold() -> f64 {
    0.5
}

fn default_proposal_timeout_ms() -> u64 {
    30000
}

fn default_retention_ms() -> u64 {
    300_000
}

fn default_failure_threshold() -> usize {
    5
}

fn default_failure_window_secs() -> u64 {
    600
}

fn default_cascade_threshold_depth() -> usize {
    3
}

fn default_cascade_window_ms() -> u64 {
    5000
}

fn default_cascade_quiescence_secs() -> u64 {
    60
}

fn default_critical_cascade_size() -> usize {
    10
}

fn default_max_concurrent_recoveries() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_recovery_timeout_secs() -> u64 {
    30
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_monitor_interval_ms() -> u64 {
    1000
}

fn default_health_check_interval_ms() -> u64 {
    5000
}

fn default_operation_retention_secs() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    7
}

impl HaConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HaError> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let content = fs::read_to_string(path)
            .map_err(|e| HaError::config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: HaConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load the first config file found in the usual locations, or defaults.
    pub fn discover() -> Result<Self, HaError> {
        let config_paths = [
            PathBuf::from("ha-node.yml"),
            dirs::config_dir()
                .map(|p| p.join("ha-node/config.yml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/ha-node/config.yml"),
        ];

        for path in &config_paths {
            if path.is_file() {
                return Self::load(path);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), HaError> {
        let path = path.as_ref();
        debug!("Saving configuration to {}", path.display());
        let yaml = serde_yaml::to_string(self)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Write atomically using a temporary file
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, yaml)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, HaError> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn validate_durations(&self) -> Result<(), HaError> {
        let cluster = &self.cluster;
        let failover = &self.failover;
        let millis = [
            ("cluster.gossip_interval_ms", cluster.gossip_interval_ms),
            ("cluster.election_timeout_max_ms", cluster.election_timeout_max_ms),
            ("cluster.heartbeat_timeout_ms", cluster.heartbeat_timeout_ms),
            ("cluster.election_check_interval_ms", cluster.election_check_interval_ms),
            ("cluster.dead_timeout_ms", cluster.dead_timeout_ms),
            ("cluster.loop_error_backoff_ms", cluster.loop_error_backoff_ms),
            ("locks.lock_timeout_ms", self.locks.lock_timeout_ms),
            ("locks.sweep_interval_ms", self.locks.sweep_interval_ms),
            ("consensus.proposal_timeout_ms", self.consensus.proposal_timeout_ms),
            ("consensus.retention_ms", self.consensus.retention_ms),
            ("consensus.sweep_interval_ms", self.consensus.sweep_interval_ms),
            ("failover.cascade_window_ms", failover.cascade_window_ms),
            ("failover.retry_backoff_ms", failover.retry_backoff_ms),
            ("failover.monitor_interval_ms", failover.monitor_interval_ms),
            ("failover.health_check_interval_ms", failover.health_check_interval_ms),
        ];
        let secs = [
            ("failover.failure_window_secs", failover.failure_window_secs),
            ("failover.cascade_quiescence_secs", failover.cascade_quiescence_secs),
            ("failover.default_timeout_secs", failover.default_timeout_secs),
            ("failover.operation_retention_secs", failover.operation_retention_secs),
        ];

        let too_long = millis
            .into_iter()
            .find(|(_, ms)| *ms > MAX_DURATION_MS)
            .or_else(|| {
                secs.into_iter()
                    .find(|(_, s)| s.saturating_mul(1000) > MAX_DURATION_MS)
            });
        match too_long {
            Some((field, _)) => Err(HaError::config(format!(
                "{} exceeds the one year maximum",
                field
            ))),
            None => Ok(()),
        }
    }

    pub fn validate(&self) -> Result<(), HaError> {
        if self.node.node_id.trim().is_empty() {
            return Err(HaError::config("Node id cannot be empty"));
        }

        let cluster = &self.cluster;
        if cluster.gossip_interval_ms == 0 {
            return Err(HaError::config("Gossip interval cannot be zero"));
        }
        if cluster.gossip_fanout == 0 {
            return Err(HaError::config("Gossip fanout cannot be zero"));
        }
        if cluster.election_timeout_min_ms == 0 {
            return Err(HaError::config("Election timeout cannot be zero"));
        }
        if cluster.election_timeout_min_ms > cluster.election_timeout_max_ms {
            return Err(HaError::config(
                "Election timeout minimum cannot exceed maximum",
            ));
        }
        if cluster.heartbeat_timeout_ms < 2 {
            return Err(HaError::config("Heartbeat timeout must be at least 2ms"));
        }
        if cluster.heartbeat_timeout_ms >= cluster.election_timeout_min_ms {
            return Err(HaError::config(
                "Heartbeat timeout must be shorter than the election timeout",
            ));
        }
        if cluster.election_check_interval_ms == 0 {
            return Err(HaError::config("Election check interval cannot be zero"));
        }
        if cluster.suspect_timeout_ms > cluster.dead_timeout_ms {
            return Err(HaError::config(
                "Suspect timeout cannot exceed dead timeout",
            ));
        }

        if self.locks.lock_timeout_ms == 0 || self.locks.sweep_interval_ms == 0 {
            return Err(HaError::config("Lock timeout and sweep interval cannot be zero"));
        }

        if !(0.0..=1.0).contains(&self.consensus.threshold) {
            return Err(HaError::config("Consensus threshold must be within [0, 1]"));
        }
        if self.consensus.sweep_interval_ms == 0 {
            return Err(HaError::config("Consensus sweep interval cannot be zero"));
        }

        let failover = &self.failover;
        if failover.failure_threshold == 0 {
            return Err(HaError::config("Failure threshold cannot be zero"));
        }
        if failover.cascade_threshold_depth < 2 {
            return Err(HaError::config("Cascade threshold depth must be at least 2"));
        }
        if failover.critical_cascade_size < failover.cascade_threshold_depth {
            return Err(HaError::config(
                "Critical cascade size cannot be below the cascade threshold depth",
            ));
        }
        if failover.max_concurrent_recoveries == 0 {
            return Err(HaError::config("Max concurrent recoveries cannot be zero"));
        }
        if failover.monitor_interval_ms == 0 || failover.health_check_interval_ms == 0 {
            return Err(HaError::config("Failover intervals cannot be zero"));
        }

        self.validate_durations()?;

        match self.logging.level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            _ => Err(HaError::config("Invalid log level")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = HaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster.gossip_interval(), Duration::from_secs(5));
        assert_eq!(config.cluster.heartbeat_interval(), Duration::from_millis(1500));
        assert_eq!(config.locks.lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.failover.failure_window(), Duration::from_secs(600));
        assert_eq!(config.consensus.threshold, 0.5);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "node:\n  node_id: alpha\ncluster:\n  gossip_fanout: 5\n";
        let config: HaConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.node.node_id, "alpha");
        assert_eq!(config.node.port, 7946);
        assert_eq!(config.cluster.gossip_fanout, 5);
        assert_eq!(config.cluster.election_timeout_max_ms, 10000);
        assert_eq!(config.failover.cascade_threshold_depth, 3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf/ha-node.yml");

        let mut config = HaConfig::default();
        config.node.node_id = "node-a".to_string();
        config.node.seeds.push(SeedNode {
            node_id: "node-b".to_string(),
            hostname: "10.0.0.2".to_string(),
            port: 7946,
        });
        config.save(&path).unwrap();

        let loaded = HaConfig::load(&path).unwrap();
        assert_eq!(loaded.node.node_id, "node-a");
        assert_eq!(loaded.node.seeds, config.node.seeds);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = HaConfig::default();
        config.cluster.election_timeout_min_ms = 20000;
        assert!(config.validate().is_err());

        let mut config = HaConfig::default();
        config.cluster.heartbeat_timeout_ms = 6000;
        assert!(config.validate().is_err());

        let mut config = HaConfig::default();
        config.consensus.threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = HaConfig::default();
        config.failover.cascade_threshold_depth = 1;
        assert!(config.validate().is_err());

        let mut config = HaConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unbounded_durations() {
        let mut config = HaConfig::default();
        config.failover.failure_window_secs = 10_000_000_000_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("failover.failure_window_secs"));

        let mut config = HaConfig::default();
        config.locks.lock_timeout_ms = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = HaConfig::default();
        config.failover.operation_retention_secs = MAX_DURATION_MS / 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let err = HaConfig::load("/definitely/not/here.yml").unwrap_err();
        assert!(matches!(err, HaError::Config(_)));
    }
}
