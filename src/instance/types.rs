//! Instance-related type definitions.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Lower bound for health check intervals.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound for health check intervals.
pub const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Default per-probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_FAILURE_THRESHOLD: u32 = 1;
const MAX_FAILURE_THRESHOLD: u32 = 10;

/// What kind of service an instance runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Dns,
    Proxy,
    Vpn,
    Custom(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// One declared listen port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }
}

/// Optional resource caps applied to the live process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCaps {
    /// Memory ceiling in megabytes.
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// CPU ceiling as a percentage of one core (100 = one full core).
    #[serde(default)]
    pub cpu_percent: Option<u32>,
}

/// How an instance's health is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Signal-0 to the current PID.
    Process,
    /// TCP dial to the target address.
    Tcp,
    /// HTTP GET against the target URL.
    Http,
    /// SOCKS5 no-auth handshake against the target address.
    Socks5,
    /// Caller-supplied probe implementation.
    Custom,
}

/// Health policy embedded in an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSpec {
    pub kind: ProbeKind,
    /// host:port or URL, depending on the probe kind. Unused for Process.
    #[serde(default)]
    pub target: Option<String>,
    pub interval: Duration,
    pub failure_threshold: u32,
    #[serde(default = "default_probe_timeout")]
    pub timeout: Duration,
    /// Request a restart when the instance crosses the failure threshold.
    #[serde(default)]
    pub restart_on_unhealthy: bool,
}

fn default_probe_timeout() -> Duration {
    DEFAULT_PROBE_TIMEOUT
}

impl Default for HealthSpec {
    fn default() -> Self {
        Self {
            kind: ProbeKind::Process,
            target: None,
            interval: Duration::from_secs(30),
            failure_threshold: 3,
            timeout: DEFAULT_PROBE_TIMEOUT,
            restart_on_unhealthy: false,
        }
    }
}

impl HealthSpec {
    /// Clamp interval and threshold into their allowed ranges.
    pub fn sanitized(mut self) -> Self {
        self.interval = self.interval.clamp(MIN_CHECK_INTERVAL, MAX_CHECK_INTERVAL);
        self.failure_threshold = self
            .failure_threshold
            .clamp(MIN_FAILURE_THRESHOLD, MAX_FAILURE_THRESHOLD);
        self
    }
}

/// The declared intent to run one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Globally unique, lexicographically sortable id.
    pub id: String,
    pub kind: FeatureKind,
    pub name: String,
    /// Absolute path to the service binary.
    pub binary_path: PathBuf,
    pub working_dir: PathBuf,
    /// Environment, in declaration order.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Explicit, non-wildcard listen address.
    pub listen_ip: IpAddr,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub caps: Option<ResourceCaps>,
    pub shutdown_grace: Duration,
    #[serde(default)]
    pub auto_restart: bool,
    pub health: HealthSpec,
    pub router_id: String,
}

impl ServiceInstance {
    /// Generate a fresh instance id.
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Validate the declared fields. Isolation-level checks (path escape,
    /// port ownership) are the verifier's job; this rejects input that is
    /// malformed on its face.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(OrchestratorError::validation("instance id is empty"));
        }
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::validation("instance name is empty"));
        }
        if !self.binary_path.is_absolute() {
            return Err(OrchestratorError::validation(format!(
                "binary path is not absolute: {}",
                self.binary_path.display()
            )));
        }
        if self.ports.iter().any(|p| p.port == 0) {
            return Err(OrchestratorError::validation("port 0 is not allocatable"));
        }
        if self.shutdown_grace.is_zero() {
            return Err(OrchestratorError::validation("shutdown grace is zero"));
        }
        Ok(())
    }

    /// Declared TCP ports, the set the post-start binding check compares
    /// against the live listener table.
    pub fn tcp_ports(&self) -> Vec<u16> {
        self.ports
            .iter()
            .filter(|p| p.protocol == Protocol::Tcp)
            .map(|p| p.port)
            .collect()
    }
}
