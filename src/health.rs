//! Ticker-driven health checking across all registered instances.
//!
//! One scheduler fans due probes out under a bounded concurrency limit.
//! State transitions follow the threshold rule: any success is healthy,
//! unhealthy needs `failure_threshold` consecutive failures. The record
//! update is visible to readers before the corresponding event is
//! published.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};

use crate::events::{EventBus, EventDetail, LifecycleEvent, LifecycleEventKind};
use crate::instance::HealthSpec;
use crate::probe::HealthProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Checking,
    Healthy,
    Unhealthy,
}

/// Per-instance health bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub state: HealthState,
    pub last_check: Option<DateTime<Utc>>,
    pub last_healthy: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_latency: Option<Duration>,
    pub last_error: Option<String>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            state: HealthState::Unknown,
            last_check: None,
            last_healthy: None,
            consecutive_failures: 0,
            last_latency: None,
            last_error: None,
        }
    }
}

/// Emitted when an unhealthy instance asks to be restarted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    pub instance_id: String,
    pub reason: String,
}

struct Entry {
    router_id: String,
    spec: HealthSpec,
    probe: Arc<dyn HealthProbe>,
    next_check_at: Instant,
    in_flight: bool,
    record: HealthRecord,
}

/// Scheduler shared by every registered instance.
pub struct HealthChecker {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    events: Arc<dyn EventBus>,
    permits: Arc<Semaphore>,
    tick: Duration,
    restart_tx: mpsc::Sender<RestartRequest>,
    restart_rx: Mutex<Option<mpsc::Receiver<RestartRequest>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl HealthChecker {
    pub fn new(
        events: Arc<dyn EventBus>,
        tick: Duration,
        max_concurrent_probes: usize,
        restart_capacity: usize,
    ) -> Self {
        let (restart_tx, restart_rx) = mpsc::channel(restart_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            events,
            permits: Arc::new(Semaphore::new(max_concurrent_probes.max(1))),
            tick,
            restart_tx,
            restart_rx: Mutex::new(Some(restart_rx)),
            shutdown_tx,
        }
    }

    /// Register an instance for periodic checking. Replaces any previous
    /// registration under the same id; the first check is due on the next
    /// tick.
    pub fn register(
        &self,
        instance_id: &str,
        router_id: &str,
        spec: HealthSpec,
        probe: Arc<dyn HealthProbe>,
    ) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            instance_id.to_string(),
            Entry {
                router_id: router_id.to_string(),
                spec,
                probe,
                next_check_at: Instant::now(),
                in_flight: false,
                record: HealthRecord::default(),
            },
        );
    }

    /// Drop an instance. A probe already in flight completes and its
    /// result is discarded.
    pub fn unregister(&self, instance_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(instance_id);
    }

    /// Forget the previous incarnation's history: state back to unknown,
    /// next check due immediately. Called when an instance's process
    /// reaches running, so stale pre-start failures do not stretch the
    /// first live check by a full interval.
    pub fn reset(&self, instance_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(instance_id) {
            entry.record = HealthRecord::default();
            entry.next_check_at = Instant::now();
        }
    }

    /// Read-only snapshot of an instance's health record.
    pub fn snapshot(&self, instance_id: &str) -> Option<HealthRecord> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(instance_id).map(|e| e.record.clone())
    }

    /// The restart-request stream, consumable once (by the supervisor).
    pub fn take_restart_receiver(&self) -> Option<mpsc::Receiver<RestartRequest>> {
        self.restart_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Spawn the scheduler loop. Call with a dedicated clone of the Arc.
    pub fn start(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.wait_for(|stop| *stop) => return,
                }
                Self::run_due_probes(&self);
            }
        });
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One tick: fan out every due probe that can get a permit. Due
    /// instances that find none are skipped until the next tick.
    fn run_due_probes(checker: &Arc<Self>) {
        let now = Instant::now();
        let mut entries = checker.entries.lock().unwrap_or_else(|e| e.into_inner());
        for (id, entry) in entries.iter_mut() {
            if entry.in_flight || entry.next_check_at > now {
                continue;
            }
            let Ok(permit) = Arc::clone(&checker.permits).try_acquire_owned() else {
                continue;
            };
            entry.in_flight = true;
            if entry.record.state == HealthState::Unknown {
                entry.record.state = HealthState::Checking;
            }

            let checker = Arc::clone(checker);
            let id = id.clone();
            let probe = Arc::clone(&entry.probe);
            let timeout = entry.spec.timeout;
            tokio::spawn(async move {
                let outcome = match tokio::time::timeout(timeout, probe.check(timeout)).await {
                    Ok(outcome) => outcome,
                    Err(_) => crate::probe::ProbeOutcome::unhealthy(timeout, "probe timed out"),
                };
                drop(permit);
                checker.apply_outcome(&id, outcome).await;
            });
        }
    }

    async fn apply_outcome(&self, instance_id: &str, outcome: crate::probe::ProbeOutcome) {
        let transition = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = entries.get_mut(instance_id) else {
                // Unregistered while the probe was in flight.
                return;
            };
            entry.in_flight = false;
            entry.next_check_at = Instant::now() + entry.spec.interval;

            let record = &mut entry.record;
            record.last_check = Some(Utc::now());
            record.last_latency = Some(outcome.latency);
            record.last_error = outcome.error;

            if outcome.healthy {
                record.consecutive_failures = 0;
                record.last_healthy = record.last_check;
                if record.state == HealthState::Healthy {
                    None
                } else {
                    let prev = record.state;
                    record.state = HealthState::Healthy;
                    Some(Transition {
                        prev,
                        curr: HealthState::Healthy,
                        consecutive_failures: 0,
                        router_id: entry.router_id.clone(),
                        request_restart: false,
                    })
                }
            } else {
                record.consecutive_failures += 1;
                if record.consecutive_failures >= entry.spec.failure_threshold
                    && record.state != HealthState::Unhealthy
                {
                    let prev = record.state;
                    record.state = HealthState::Unhealthy;
                    Some(Transition {
                        prev,
                        curr: HealthState::Unhealthy,
                        consecutive_failures: record.consecutive_failures,
                        router_id: entry.router_id.clone(),
                        request_restart: entry.spec.restart_on_unhealthy,
                    })
                } else {
                    // Failures under threshold are not transitions.
                    None
                }
            }
        };

        let Some(transition) = transition else {
            return;
        };

        let event = LifecycleEvent::now(
            LifecycleEventKind::FeatureHealthChanged,
            instance_id,
            &transition.router_id,
            EventDetail::HealthChanged {
                prev: transition.prev,
                curr: transition.curr,
                consecutive_failures: transition.consecutive_failures,
            },
        );
        if let Err(e) = self.events.publish(event).await {
            log::warn!("Failed to publish health change for {}: {}", instance_id, e);
        }

        if transition.request_restart {
            let request = RestartRequest {
                instance_id: instance_id.to_string(),
                reason: format!(
                    "unhealthy after {} consecutive failures",
                    transition.consecutive_failures
                ),
            };
            if let Err(e) = self.restart_tx.try_send(request) {
                log::warn!("Restart queue full, dropping request for {}: {}", instance_id, e);
            }
        }
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct Transition {
    prev: HealthState,
    curr: HealthState,
    consecutive_failures: u32,
    router_id: String,
    request_restart: bool,
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{HealthChecker, HealthState};
    use crate::events::{BroadcastBus, EventDetail, LifecycleEventKind};
    use crate::instance::{HealthSpec, ProbeKind};
    use crate::probe::{HealthProbe, ProbeOutcome};

    struct ScriptedProbe {
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn check(&self, _timeout: Duration) -> ProbeOutcome {
            if self.healthy.load(Ordering::SeqCst) {
                ProbeOutcome::healthy(Duration::from_millis(1))
            } else {
                ProbeOutcome::unhealthy(Duration::from_millis(1), "scripted failure")
            }
        }
    }

    fn spec(threshold: u32, restart: bool) -> HealthSpec {
        HealthSpec {
            kind: ProbeKind::Custom,
            target: None,
            interval: Duration::from_millis(40),
            failure_threshold: threshold,
            timeout: Duration::from_secs(1),
            restart_on_unhealthy: restart,
        }
    }

    async fn next_health_event(
        rx: &mut tokio::sync::broadcast::Receiver<crate::events::LifecycleEvent>,
    ) -> crate::events::LifecycleEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if event.kind == LifecycleEventKind::FeatureHealthChanged {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn single_success_transitions_to_healthy() {
        let bus = Arc::new(BroadcastBus::new(64));
        let mut rx = bus.subscribe();
        let checker = Arc::new(HealthChecker::new(
            Arc::<BroadcastBus>::clone(&bus),
            Duration::from_millis(10),
            5,
            8,
        ));
        let healthy = Arc::new(AtomicBool::new(true));
        checker.register(
            "svc-1",
            "router-1",
            spec(3, false),
            Arc::new(ScriptedProbe {
                healthy: Arc::clone(&healthy),
            }),
        );
        Arc::clone(&checker).start();

        let event = next_health_event(&mut rx).await;
        match event.detail {
            EventDetail::HealthChanged { prev, curr, consecutive_failures } => {
                assert_ne!(prev, HealthState::Healthy);
                assert_eq!(curr, HealthState::Healthy);
                assert_eq!(consecutive_failures, 0);
            }
            other => panic!("unexpected detail {:?}", other),
        }
        let record = checker.snapshot("svc-1").unwrap();
        assert_eq!(record.state, HealthState::Healthy);
        assert!(record.last_healthy.is_some());
        checker.shutdown();
    }

    #[tokio::test]
    async fn unhealthy_requires_threshold_and_emits_once() {
        let bus = Arc::new(BroadcastBus::new(64));
        let mut rx = bus.subscribe();
        let checker = Arc::new(HealthChecker::new(
            Arc::<BroadcastBus>::clone(&bus),
            Duration::from_millis(10),
            5,
            8,
        ));
        let healthy = Arc::new(AtomicBool::new(true));
        checker.register(
            "svc-1",
            "router-1",
            spec(3, false),
            Arc::new(ScriptedProbe {
                healthy: Arc::clone(&healthy),
            }),
        );
        Arc::clone(&checker).start();

        // Reach healthy first.
        let _ = next_health_event(&mut rx).await;

        healthy.store(false, Ordering::SeqCst);
        let event = next_health_event(&mut rx).await;
        match event.detail {
            EventDetail::HealthChanged { prev, curr, consecutive_failures } => {
                assert_eq!(prev, HealthState::Healthy);
                assert_eq!(curr, HealthState::Unhealthy);
                assert_eq!(consecutive_failures, 3);
            }
            other => panic!("unexpected detail {:?}", other),
        }

        // Recovery is a single success.
        healthy.store(true, Ordering::SeqCst);
        let event = next_health_event(&mut rx).await;
        match event.detail {
            EventDetail::HealthChanged { prev, curr, consecutive_failures } => {
                assert_eq!(prev, HealthState::Unhealthy);
                assert_eq!(curr, HealthState::Healthy);
                assert_eq!(consecutive_failures, 0);
            }
            other => panic!("unexpected detail {:?}", other),
        }
        checker.shutdown();
    }

    #[tokio::test]
    async fn threshold_breach_requests_restart() {
        let bus = Arc::new(BroadcastBus::new(64));
        let checker = Arc::new(HealthChecker::new(
            Arc::<BroadcastBus>::clone(&bus),
            Duration::from_millis(10),
            5,
            8,
        ));
        let mut restart_rx = checker.take_restart_receiver().unwrap();
        checker.register(
            "svc-1",
            "router-1",
            spec(1, true),
            Arc::new(ScriptedProbe {
                healthy: Arc::new(AtomicBool::new(false)),
            }),
        );
        Arc::clone(&checker).start();

        let request = tokio::time::timeout(Duration::from_secs(5), restart_rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(request.instance_id, "svc-1");
        assert!(request.reason.contains("unhealthy"));
        checker.shutdown();
    }

    struct SlowProbe {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl HealthProbe for SlowProbe {
        async fn check(&self, _timeout: Duration) -> ProbeOutcome {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(80)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            ProbeOutcome::healthy(Duration::from_millis(80))
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_permits() {
        let bus = Arc::new(BroadcastBus::new(64));
        let checker = Arc::new(HealthChecker::new(
            Arc::<BroadcastBus>::clone(&bus),
            Duration::from_millis(10),
            1,
            8,
        ));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            checker.register(
                &format!("svc-{i}"),
                "router-1",
                spec(3, false),
                Arc::new(SlowProbe {
                    current: Arc::clone(&current),
                    peak: Arc::clone(&peak),
                }),
            );
        }
        Arc::clone(&checker).start();

        tokio::time::sleep(Duration::from_millis(500)).await;
        checker.shutdown();
        assert_eq!(peak.load(Ordering::SeqCst), 1, "semaphore must bound probes");
    }

    #[tokio::test]
    async fn unregistered_instance_has_no_snapshot() {
        let bus = Arc::new(BroadcastBus::new(8));
        let checker = Arc::new(HealthChecker::new(
            Arc::<BroadcastBus>::clone(&bus),
            Duration::from_millis(10),
            5,
            8,
        ));
        checker.register(
            "svc-1",
            "router-1",
            spec(3, false),
            Arc::new(ScriptedProbe {
                healthy: Arc::new(AtomicBool::new(true)),
            }),
        );
        assert!(checker.snapshot("svc-1").is_some());
        checker.unregister("svc-1");
        assert!(checker.snapshot("svc-1").is_none());
    }
}
