//! Managed process runtime.

pub(crate) mod control;
mod managed;

#[cfg(target_os = "windows")]
pub(crate) mod win_api;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use managed::ManagedProcess;

/// Delay before the post-start binding check, letting the child reach its
/// own bind() call.
pub(crate) const BINDING_SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Managed process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
    BackingOff,
}

impl ProcessState {
    /// Terminal states: the run loop has finalized and no restart follows.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

/// Restart backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// A run at least this long resets the backoff and restart count.
    pub stable_uptime: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            stable_uptime: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// The interval following `current`, capped at `max`.
    pub fn next(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max)
    }
}

/// Read-only view of a managed process's runtime record.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub state: ProcessState,
    /// 0 when no process is running.
    pub pid: u32,
    pub restart_count: u32,
    pub backoff: Duration,
    /// Seconds since the current process started, when running.
    pub uptime_secs: Option<u64>,
}
