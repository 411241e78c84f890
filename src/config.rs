//! Orchestrator configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::process::BackoffPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Service binaries must live under this directory.
    #[serde(default = "default_allowed_base_dir")]
    pub allowed_base_dir: PathBuf,
    /// Captured child output goes to `<log_dir>/<instance-id>.log`.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Per-instance log size before rotation; 0 disables rotation.
    #[serde(default = "default_log_max_bytes")]
    pub log_max_bytes: u64,
    /// Delegated cgroup-v2 root for resource caps.
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Health checker tick interval.
    #[serde(default = "default_health_tick")]
    pub health_tick: Duration,
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
    #[serde(default = "default_restart_queue_capacity")]
    pub restart_queue_capacity: usize,
    /// Broadcast buffer for the in-process event bus.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_allowed_base_dir() -> PathBuf {
    PathBuf::from("/opt/services")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/panel-orchestrator")
}

fn default_log_max_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/panel-orchestrator")
}

fn default_health_tick() -> Duration {
    Duration::from_secs(1)
}

fn default_max_concurrent_probes() -> usize {
    5
}

fn default_restart_queue_capacity() -> usize {
    32
}

fn default_event_buffer() -> usize {
    128
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            allowed_base_dir: default_allowed_base_dir(),
            log_dir: default_log_dir(),
            log_max_bytes: default_log_max_bytes(),
            cgroup_root: default_cgroup_root(),
            backoff: BackoffPolicy::default(),
            health_tick: default_health_tick(),
            max_concurrent_probes: default_max_concurrent_probes(),
            restart_queue_capacity: default_restart_queue_capacity(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::OrchestratorConfig;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.max_concurrent_probes, 5);
        assert_eq!(config.health_tick, std::time::Duration::from_secs(1));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.toml");
        std::fs::write(
            &path,
            "allowed_base_dir = \"/srv/bin\"\nmax_concurrent_probes = 9\n",
        )
        .unwrap();

        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.allowed_base_dir, std::path::PathBuf::from("/srv/bin"));
        assert_eq!(config.max_concurrent_probes, 9);
        assert_eq!(config.restart_queue_capacity, 32);
    }
}
