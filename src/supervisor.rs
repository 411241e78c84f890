//! The orchestrator front: instance registration, pre-start gating,
//! dependency-ordered boot and shutdown, restart dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, EventDetail, LifecycleEvent, LifecycleEventKind};
use crate::graph::{DependencyManager, EdgeKind};
use crate::health::{HealthChecker, HealthRecord, HealthState};
use crate::instance::ServiceInstance;
use crate::isolation::{IsolationVerifier, Severity, VerifyReport, Violation};
use crate::limits::ResourceLimiter;
use crate::logcap::LogCapture;
use crate::probe::{probe_for_instance, HealthProbe};
use crate::process::{ManagedProcess, ProcessSnapshot, ProcessState};
use crate::store::InstanceStore;

/// Poll interval while waiting for a REQUIRES target to become healthy.
const HEALTH_WAIT_POLL: Duration = Duration::from_millis(100);

/// How one instance fared in a boot sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum BootOutcome {
    Started {
        /// false when a REQUIRES wait timed out on this instance.
        healthy: bool,
    },
    Blocked {
        violations: Vec<Violation>,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
    },
}

/// Aggregate result of one boot sequence.
#[derive(Debug, Clone, Serialize)]
pub struct BootReport {
    pub layers: Vec<Vec<String>>,
    pub outcomes: HashMap<String, BootOutcome>,
}

/// Combined runtime view of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub process: ProcessSnapshot,
    pub health: Option<HealthRecord>,
}

/// Owns the instance → managed process map. Processes are added once and
/// never replaced, so their identity is stable across start/stop.
pub struct Supervisor {
    config: OrchestratorConfig,
    processes: RwLock<HashMap<String, Arc<ManagedProcess>>>,
    store: Arc<dyn InstanceStore>,
    deps: Arc<DependencyManager>,
    checker: Arc<HealthChecker>,
    verifier: Arc<IsolationVerifier>,
    events: Arc<dyn EventBus>,
    limiter: Arc<dyn ResourceLimiter>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn InstanceStore>,
        deps: Arc<DependencyManager>,
        checker: Arc<HealthChecker>,
        verifier: Arc<IsolationVerifier>,
        events: Arc<dyn EventBus>,
        limiter: Arc<dyn ResourceLimiter>,
    ) -> Self {
        Self {
            config,
            processes: RwLock::new(HashMap::new()),
            store,
            deps,
            checker,
            verifier,
            events,
            limiter,
        }
    }

    fn get(&self, instance_id: &str) -> Option<Arc<ManagedProcess>> {
        let processes = self.processes.read().unwrap_or_else(|e| e.into_inner());
        processes.get(instance_id).cloned()
    }

    /// Register an instance with its declared probe. Idempotent on id
    /// collision: the existing managed process is returned untouched.
    pub async fn register(&self, instance: ServiceInstance) -> Result<Arc<ManagedProcess>> {
        self.register_inner(instance, None).await
    }

    /// Register an instance with a caller-supplied probe (the
    /// `ProbeKind::Custom` path).
    pub async fn register_with_probe(
        &self,
        instance: ServiceInstance,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Arc<ManagedProcess>> {
        self.register_inner(instance, Some(probe)).await
    }

    async fn register_inner(
        &self,
        instance: ServiceInstance,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> Result<Arc<ManagedProcess>> {
        instance.validate()?;
        let instance = ServiceInstance {
            health: instance.health.clone().sanitized(),
            ..instance
        };

        if let Some(existing) = self.get(&instance.id) {
            return Ok(existing);
        }

        if !self.store.exists(&instance.id).await? {
            self.store.insert(instance.clone()).await?;
        }

        let instance = Arc::new(instance);
        let logs = Arc::new(LogCapture::new(
            self.config.log_dir.join(format!("{}.log", instance.id)),
            self.config.log_max_bytes,
        )?);
        let process = Arc::new(ManagedProcess::new(
            Arc::clone(&instance),
            Arc::clone(&self.events),
            Arc::clone(&self.limiter),
            Arc::clone(&self.verifier),
            logs,
            self.config.backoff,
        ));

        let probe = match probe {
            Some(probe) => probe,
            None => probe_for_instance(&instance, process.pid_handle())?,
        };

        {
            let mut processes = self.processes.write().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = processes.get(&instance.id) {
                // Lost a registration race; keep the first one.
                return Ok(Arc::clone(existing));
            }
            processes.insert(instance.id.clone(), Arc::clone(&process));
        }
        self.checker
            .register(&instance.id, &instance.router_id, instance.health.clone(), probe);

        log::info!("Registered instance {} ({})", instance.id, instance.name);
        Ok(process)
    }

    /// Remove an instance once its process is terminal. Dependency edges
    /// referencing it are removed with it.
    pub async fn unregister(&self, instance_id: &str) -> Result<()> {
        let process = self
            .get(instance_id)
            .ok_or_else(|| OrchestratorError::not_found(instance_id))?;
        if !process.state().is_terminal() {
            return Err(OrchestratorError::validation(format!(
                "instance {} must be stopped before unregistering",
                instance_id
            )));
        }

        self.checker.unregister(instance_id);
        self.deps.cleanup_for_instance(instance_id).await?;
        self.store.remove(instance_id).await?;

        let mut processes = self.processes.write().unwrap_or_else(|e| e.into_inner());
        processes.remove(instance_id);
        log::info!("Unregistered instance {}", instance_id);
        Ok(())
    }

    /// Replace an instance's declaration. The process must be terminal;
    /// the next start picks up the new declaration and probe.
    pub async fn update_instance(&self, instance: ServiceInstance) -> Result<()> {
        instance.validate()?;
        let instance = ServiceInstance {
            health: instance.health.clone().sanitized(),
            ..instance
        };
        let process = self
            .get(&instance.id)
            .ok_or_else(|| OrchestratorError::not_found(&instance.id))?;

        let shared = Arc::new(instance.clone());
        let probe = probe_for_instance(&shared, process.pid_handle())?;
        process.set_instance(Arc::clone(&shared))?;
        self.store.update(instance).await?;
        self.checker
            .register(&shared.id, &shared.router_id, shared.health.clone(), probe);
        Ok(())
    }

    /// Start one instance, gated by pre-start isolation verification.
    pub async fn start(&self, instance_id: &str) -> Result<()> {
        let process = self
            .get(instance_id)
            .ok_or_else(|| OrchestratorError::not_found(instance_id))?;

        match process.state() {
            ProcessState::Running | ProcessState::Starting | ProcessState::BackingOff => {
                return Ok(())
            }
            _ => {}
        }

        let instance = process.instance();
        let report = self.verifier.verify(&instance).await;
        if !report.passed {
            self.publish_violations(&instance, &report).await;
            process.mark_crashed();
            return Err(OrchestratorError::isolation(
                instance_id,
                summarize(&report),
            ));
        }
        self.launch(instance_id, &process)
    }

    /// Start the process and refresh its health window once it is
    /// actually running.
    fn launch(&self, instance_id: &str, process: &Arc<ManagedProcess>) -> Result<()> {
        process.start()?;

        let checker = Arc::clone(&self.checker);
        let id = instance_id.to_string();
        let mut rx = process.subscribe_state();
        tokio::spawn(async move {
            if rx.wait_for(|s| *s == ProcessState::Running).await.is_ok() {
                checker.reset(&id);
            }
        });
        Ok(())
    }

    /// Stop one instance, draining until its run loop finalizes.
    pub async fn stop(&self, instance_id: &str) -> Result<()> {
        let process = self
            .get(instance_id)
            .ok_or_else(|| OrchestratorError::not_found(instance_id))?;
        process.stop().await
    }

    /// Health record for one instance, if registered.
    pub fn health(&self, instance_id: &str) -> Option<HealthRecord> {
        self.checker.snapshot(instance_id)
    }

    /// Runtime view across every registered instance.
    pub fn snapshot(&self) -> HashMap<String, RuntimeSnapshot> {
        let processes = self.processes.read().unwrap_or_else(|e| e.into_inner());
        processes
            .iter()
            .map(|(id, process)| {
                (
                    id.clone(),
                    RuntimeSnapshot {
                        process: process.snapshot(),
                        health: self.checker.snapshot(id),
                    },
                )
            })
            .collect()
    }

    /// Consume the health checker's restart requests: stop, then start.
    /// Events along the way come from the managed processes themselves.
    pub fn spawn_restart_consumer(self: Arc<Self>) -> Result<()> {
        let mut rx = self
            .checker
            .take_restart_receiver()
            .ok_or_else(|| OrchestratorError::internal("restart receiver already taken"))?;
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                // A request against an instance that is no longer running
                // is stale; restarting it would override an explicit stop.
                let active = self.get(&request.instance_id).is_some_and(|p| {
                    matches!(
                        p.state(),
                        ProcessState::Running | ProcessState::Starting | ProcessState::BackingOff
                    )
                });
                if !active {
                    log::debug!(
                        "Dropping stale restart request for {}",
                        request.instance_id
                    );
                    continue;
                }
                log::info!(
                    "Restarting {}: {}",
                    request.instance_id,
                    request.reason
                );
                if let Err(e) = self.stop(&request.instance_id).await {
                    log::warn!("Restart stop failed for {}: {}", request.instance_id, e);
                    continue;
                }
                if let Err(e) = self.start(&request.instance_id).await {
                    log::error!("Restart start failed for {}: {}", request.instance_id, e);
                }
            }
        });
        Ok(())
    }

    /// Bring a set of instances up in dependency order.
    ///
    /// Per layer: verify each instance (failures crash that instance and
    /// never its siblings), start the approved ones, then hold the layer
    /// until every REQUIRES target in it is healthy. Targets that miss
    /// their deadline poison their transitive REQUIRES dependents, which
    /// are marked crashed instead of started.
    pub async fn execute_boot_sequence(&self, ids: &[String]) -> Result<BootReport> {
        let layers = self.deps.compute_startup_order(ids)?;
        let boot_set: HashSet<&String> = ids.iter().collect();
        let mut outcomes: HashMap<String, BootOutcome> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();

        for layer in &layers {
            let mut approved: Vec<(String, Arc<ManagedProcess>)> = Vec::new();

            for id in layer {
                if let Some(edge) = self
                    .deps
                    .dependencies(id)
                    .into_iter()
                    .find(|e| e.kind == EdgeKind::Requires && failed.contains(&e.to))
                {
                    if let Some(process) = self.get(id) {
                        process.mark_crashed();
                    }
                    outcomes.insert(
                        id.clone(),
                        BootOutcome::Skipped {
                            reason: format!("dependency {} not healthy", edge.to),
                        },
                    );
                    failed.insert(id.clone());
                    continue;
                }

                let Some(process) = self.get(id) else {
                    outcomes.insert(
                        id.clone(),
                        BootOutcome::Failed {
                            error: "not registered".to_string(),
                        },
                    );
                    failed.insert(id.clone());
                    continue;
                };

                let instance = process.instance();
                let report = self.verifier.verify(&instance).await;
                if report.passed {
                    approved.push((id.clone(), process));
                } else {
                    self.publish_violations(&instance, &report).await;
                    process.mark_crashed();
                    outcomes.insert(
                        id.clone(),
                        BootOutcome::Blocked {
                            violations: report.violations,
                        },
                    );
                    failed.insert(id.clone());
                }
            }

            for (id, process) in &approved {
                match self.launch(id, process) {
                    Ok(()) => {
                        outcomes.insert(id.clone(), BootOutcome::Started { healthy: true });
                    }
                    Err(e) => {
                        outcomes.insert(
                            id.clone(),
                            BootOutcome::Failed {
                                error: e.to_string(),
                            },
                        );
                        failed.insert(id.clone());
                    }
                }
            }

            // Only REQUIRES targets gate the layer; WANTS never does.
            let waits: Vec<(String, Duration)> = approved
                .iter()
                .filter(|(id, _)| !failed.contains(id))
                .filter_map(|(id, _)| {
                    let deadline = self
                        .deps
                        .dependents(id)
                        .into_iter()
                        .filter(|e| {
                            e.kind == EdgeKind::Requires && boot_set.contains(&e.from)
                        })
                        .map(|e| e.health_timeout)
                        .max()?;
                    Some((id.clone(), deadline))
                })
                .collect();

            let results = join_all(
                waits
                    .iter()
                    .map(|(id, deadline)| self.wait_healthy(id, *deadline)),
            )
            .await;

            for ((id, _), healthy) in waits.iter().zip(results) {
                if !healthy {
                    log::warn!("Boot: {} did not become healthy in time", id);
                    outcomes.insert(id.clone(), BootOutcome::Started { healthy: false });
                    failed.insert(id.clone());
                }
            }
        }

        Ok(BootReport { layers, outcomes })
    }

    async fn wait_healthy(&self, instance_id: &str, deadline: Duration) -> bool {
        let wait = async {
            loop {
                if let Some(record) = self.checker.snapshot(instance_id) {
                    if record.state == HealthState::Healthy {
                        return;
                    }
                }
                tokio::time::sleep(HEALTH_WAIT_POLL).await;
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }

    /// Stop everything, in reverse dependency order. Each layer drains
    /// before the previous one is touched.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = {
            let processes = self.processes.read().unwrap_or_else(|e| e.into_inner());
            processes.keys().cloned().collect()
        };

        // A cycle snuck in out-of-band must not block shutdown.
        let layers = self
            .deps
            .compute_startup_order(&ids)
            .unwrap_or_else(|_| vec![ids.clone()]);

        for layer in layers.iter().rev() {
            let stops = layer.iter().filter_map(|id| self.get(id)).map(|process| async move {
                if let Err(e) = process.stop().await {
                    log::warn!("Shutdown stop failed for {}: {}", process.instance().id, e);
                }
            });
            join_all(stops).await;
        }
        log::info!("All instances stopped");
    }

    async fn publish_violations(&self, instance: &ServiceInstance, report: &VerifyReport) {
        for violation in &report.violations {
            if violation.severity != Severity::Error {
                continue;
            }
            let event = LifecycleEvent::now(
                LifecycleEventKind::IsolationViolation,
                &instance.id,
                &instance.router_id,
                EventDetail::Violation {
                    layer: violation.layer,
                    severity: violation.severity,
                    detail: violation.detail.clone(),
                },
            );
            if let Err(e) = self.events.publish(event).await {
                log::warn!(
                    "Failed to publish violation for {}: {}",
                    instance.id,
                    e
                );
            }
        }
    }
}

fn summarize(report: &VerifyReport) -> String {
    report
        .violations
        .iter()
        .filter(|v| v.severity == Severity::Error)
        .map(|v| v.detail.as_str())
        .collect::<Vec<&str>>()
        .join("; ")
}
