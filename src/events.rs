//! Lifecycle event model and the event bus seam.
//!
//! The bus carries observations, never authority: state lives in the
//! managed processes and the store, and is rebuilt from them after a
//! restart. Publication order is guaranteed per instance id only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::health::HealthState;
use crate::isolation::{Severity, ViolationLayer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    ServiceStarted,
    ServiceStopped,
    ServiceCrashed,
    FeatureHealthChanged,
    IsolationViolation,
}

/// Kind-specific event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventDetail {
    Started {
        pid: u32,
    },
    Stopped,
    Crashed {
        exit_code: Option<i32>,
        restart_count: u32,
        will_restart: bool,
        backoff_secs: u64,
    },
    HealthChanged {
        prev: HealthState,
        curr: HealthState,
        consecutive_failures: u32,
    },
    Violation {
        layer: ViolationLayer,
        severity: Severity,
        detail: String,
    },
}

/// Immutable published record of one lifecycle observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub instance_id: String,
    pub router_id: String,
    pub timestamp: DateTime<Utc>,
    pub detail: EventDetail,
}

impl LifecycleEvent {
    pub fn now(
        kind: LifecycleEventKind,
        instance_id: &str,
        router_id: &str,
        detail: EventDetail,
    ) -> Self {
        Self {
            kind,
            instance_id: instance_id.to_string(),
            router_id: router_id.to_string(),
            timestamp: Utc::now(),
            detail,
        }
    }
}

/// Event publication seam. Implementations deliver at-least-once; failures
/// are the implementation's to log, callers never treat them as fatal.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: LifecycleEvent) -> Result<()>;
}

/// In-process bus backed by a tokio broadcast channel.
///
/// Slow subscribers lag rather than block publication; a lagged receiver
/// observes `RecvError::Lagged` and continues from the oldest retained
/// event.
pub struct BroadcastBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(128)
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, event: LifecycleEvent) -> Result<()> {
        // Send fails only when no receiver exists; that is not an error
        // for an observation channel.
        let _ = self.sender.send(event);
        Ok(())
    }
}
