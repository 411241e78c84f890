//! Per-instance process state machine.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::control;
use super::{
    BackoffPolicy, ProcessSnapshot, ProcessState, BINDING_SETTLE_DELAY,
};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, EventDetail, LifecycleEvent, LifecycleEventKind};
use crate::instance::ServiceInstance;
use crate::isolation::{IsolationVerifier, Severity};
use crate::logcap::{LogCapture, StreamKind};
use crate::limits::ResourceLimiter;

/// Grace given to a force-killed child before its reaper is abandoned.
const FORCE_KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

struct Runtime {
    state: ProcessState,
    restart_count: u32,
    backoff: Duration,
    started_at: Option<Instant>,
}

struct Shared {
    instance: RwLock<Arc<ServiceInstance>>,
    runtime: RwLock<Runtime>,
    /// Mirrors `runtime.state` for waiters (stop, boot sequencing).
    state_tx: watch::Sender<ProcessState>,
    /// true = stop requested; cleared on start.
    stop_tx: watch::Sender<bool>,
    /// Shared with the process probe; 0 when nothing is running.
    pid: Arc<AtomicU32>,
    events: Arc<dyn EventBus>,
    limiter: Arc<dyn ResourceLimiter>,
    verifier: Arc<IsolationVerifier>,
    logs: Arc<LogCapture>,
    policy: BackoffPolicy,
}

/// Owns exactly one OS process for one instance and drives its lifecycle:
/// spawn, monitor, graceful stop, restart with bounded backoff.
///
/// At most one run loop is live at any time; a start issued while the
/// previous loop is finalizing chains behind it.
pub struct ManagedProcess {
    shared: Arc<Shared>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedProcess {
    pub fn new(
        instance: Arc<ServiceInstance>,
        events: Arc<dyn EventBus>,
        limiter: Arc<dyn ResourceLimiter>,
        verifier: Arc<IsolationVerifier>,
        logs: Arc<LogCapture>,
        policy: BackoffPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(ProcessState::Stopped);
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                instance: RwLock::new(instance),
                runtime: RwLock::new(Runtime {
                    state: ProcessState::Stopped,
                    restart_count: 0,
                    backoff: policy.initial,
                    started_at: None,
                }),
                state_tx,
                stop_tx,
                pid: Arc::new(AtomicU32::new(0)),
                events,
                limiter,
                verifier,
                logs,
                policy,
            }),
            run_handle: Mutex::new(None),
        }
    }

    pub fn instance(&self) -> Arc<ServiceInstance> {
        let guard = self
            .shared
            .instance
            .read()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the declared instance. Only legal while no process can be
    /// running; the next start picks up the new declaration.
    pub fn set_instance(&self, instance: Arc<ServiceInstance>) -> Result<()> {
        if !self.state().is_terminal() {
            return Err(OrchestratorError::validation(format!(
                "instance {} must be stopped before updating",
                self.instance().id
            )));
        }
        let mut guard = self
            .shared
            .instance
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *guard = instance;
        Ok(())
    }

    pub fn state(&self) -> ProcessState {
        self.shared
            .runtime
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .state
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> u32 {
        self.shared
            .runtime
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .restart_count
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let runtime = self
            .shared
            .runtime
            .read()
            .unwrap_or_else(|e| e.into_inner());
        ProcessSnapshot {
            state: runtime.state,
            pid: self.shared.pid.load(Ordering::SeqCst),
            restart_count: runtime.restart_count,
            backoff: runtime.backoff,
            uptime_secs: runtime.started_at.map(|t| t.elapsed().as_secs()),
        }
    }

    /// Handle the process probe reads the live PID through.
    pub fn pid_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.shared.pid)
    }

    /// Observe state transitions without polling.
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.shared.state_tx.subscribe()
    }

    /// Bring the instance up. Idempotent against `running`, `starting` and
    /// `backing_off` (a restart is already scheduled there). Returns as
    /// soon as the state is `starting`; the run loop owns everything after.
    pub fn start(&self) -> Result<()> {
        {
            let mut runtime = self
                .shared
                .runtime
                .write()
                .unwrap_or_else(|e| e.into_inner());
            match runtime.state {
                ProcessState::Running | ProcessState::Starting | ProcessState::BackingOff => {
                    return Ok(())
                }
                ProcessState::Stopping => {}
                ProcessState::Stopped | ProcessState::Crashed => {
                    // Fresh session: the previous backoff window is over.
                    runtime.restart_count = 0;
                    runtime.backoff = self.shared.policy.initial;
                }
            }
            runtime.state = ProcessState::Starting;
        }
        let _ = self.shared.state_tx.send(ProcessState::Starting);
        let _ = self.shared.stop_tx.send(false);

        let previous = self
            .run_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            // Never two loops over one child: wait out the old loop first.
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            run_loop(shared).await;
        });
        *self.run_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Request a stop and wait until the run loop has finalized. Idempotent
    /// against terminal states; a second concurrent stop awaits the same
    /// completion. Callers bound the wait with `tokio::time::timeout`; on
    /// expiry the process is left being reaped asynchronously.
    pub async fn stop(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        let _ = self.shared.stop_tx.send(true);

        let mut rx = self.shared.state_tx.subscribe();
        rx.wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| OrchestratorError::internal("state channel closed during stop"))?;
        Ok(())
    }

    /// Mark a never-started instance as crashed (isolation block, skipped
    /// dependency). No effect while a run loop is live.
    pub(crate) fn mark_crashed(&self) {
        let mut runtime = self
            .shared
            .runtime
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if runtime.state.is_terminal() {
            runtime.state = ProcessState::Crashed;
            drop(runtime);
            let _ = self.shared.state_tx.send(ProcessState::Crashed);
        }
    }
}

fn transition(shared: &Shared, to: ProcessState) {
    {
        let mut runtime = shared.runtime.write().unwrap_or_else(|e| e.into_inner());
        if runtime.state == to {
            return;
        }
        runtime.state = to;
    }
    let _ = shared.state_tx.send(to);
}

async fn publish(shared: &Shared, instance: &ServiceInstance, kind: LifecycleEventKind, detail: EventDetail) {
    let event = LifecycleEvent::now(kind, &instance.id, &instance.router_id, detail);
    if let Err(e) = shared.events.publish(event).await {
        log::warn!("Failed to publish {:?} for {}: {}", kind, instance.id, e);
    }
}

/// Wait until a stop is requested. A closed channel counts as a stop.
async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn spawn_child(instance: &ServiceInstance) -> std::io::Result<Child> {
    let mut cmd = Command::new(&instance.binary_path);
    cmd.args(&instance.args)
        .current_dir(&instance.working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &instance.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    {
        // Own process group so group signals reach descendants.
        cmd.process_group(0);
    }

    #[cfg(target_os = "windows")]
    {
        use windows::Win32::System::Threading::CREATE_NO_WINDOW;
        cmd.creation_flags(CREATE_NO_WINDOW.0);
    }

    cmd.spawn()
}

fn tee_output(shared: &Arc<Shared>, instance: &ServiceInstance, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let logs = Arc::clone(&shared.logs);
        let id = instance.id.clone();
        let mut lines = BufReader::new(stdout).lines();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Err(e) = logs.write_line(StreamKind::Stdout, &line) {
                    log::warn!("Log capture failed for {}: {}", id, e);
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let logs = Arc::clone(&shared.logs);
        let id = instance.id.clone();
        let mut lines = BufReader::new(stderr).lines();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Err(e) = logs.write_line(StreamKind::Stderr, &line) {
                    log::warn!("Log capture failed for {}: {}", id, e);
                }
            }
        });
    }
}

/// Graceful-terminate the child's process group, wait out the shutdown
/// grace, then force-kill whatever remains.
async fn shutdown_child(
    instance: &ServiceInstance,
    child: &mut Child,
    pid: u32,
) -> Option<std::process::ExitStatus> {
    if let Err(e) = control::terminate_group(pid) {
        log::warn!("Graceful signal failed for {} (pid {}): {}", instance.id, pid, e);
    }
    match tokio::time::timeout(instance.shutdown_grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            log::warn!("Failed to reap {} (pid {}): {}", instance.id, pid, e);
            None
        }
        Err(_) => {
            log::warn!(
                "{} (pid {}) did not exit within {:?}, force killing",
                instance.id,
                pid,
                instance.shutdown_grace
            );
            if let Err(e) = control::kill_group(pid) {
                log::error!("Failed to force kill {} (pid {}): {}", instance.id, pid, e);
            }
            match tokio::time::timeout(FORCE_KILL_REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                _ => None,
            }
        }
    }
}

/// Finalize the loop into `stopped` after a requested stop.
async fn finalize_stopped(shared: &Arc<Shared>, instance: &ServiceInstance) {
    transition(shared, ProcessState::Stopped);
    publish(
        shared,
        instance,
        LifecycleEventKind::ServiceStopped,
        EventDetail::Stopped,
    )
    .await;
}

/// Sleep out the current backoff window, interruptible by stop. Returns
/// false when the loop should exit.
async fn backoff_pause(
    shared: &Arc<Shared>,
    instance: &ServiceInstance,
    stop_rx: &mut watch::Receiver<bool>,
) -> bool {
    let backoff = {
        let runtime = shared.runtime.read().unwrap_or_else(|e| e.into_inner());
        runtime.backoff
    };
    transition(shared, ProcessState::BackingOff);
    tokio::select! {
        _ = tokio::time::sleep(backoff) => {}
        _ = wait_for_stop(stop_rx) => {
            finalize_stopped(shared, instance).await;
            return false;
        }
    }
    let mut runtime = shared.runtime.write().unwrap_or_else(|e| e.into_inner());
    runtime.backoff = shared.policy.next(backoff);
    true
}

async fn run_loop(shared: Arc<Shared>) {
    let mut stop_rx = shared.stop_tx.subscribe();

    loop {
        let instance = {
            let guard = shared.instance.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&guard)
        };

        if *stop_rx.borrow() {
            finalize_stopped(&shared, &instance).await;
            return;
        }

        transition(&shared, ProcessState::Starting);

        if let Some(caps) = &instance.caps {
            if let Err(e) = shared.limiter.prepare(&instance.id, caps) {
                log::warn!("Resource limiter prepare failed for {}: {}", instance.id, e);
            }
        }

        let mut child = match spawn_child(&instance) {
            Ok(child) => child,
            Err(e) => {
                log::warn!("Failed to spawn {}: {}", instance.id, e);
                if *stop_rx.borrow() {
                    finalize_stopped(&shared, &instance).await;
                    return;
                }
                if !instance.auto_restart {
                    let restart_count = {
                        let runtime = shared.runtime.read().unwrap_or_else(|e| e.into_inner());
                        runtime.restart_count
                    };
                    transition(&shared, ProcessState::Crashed);
                    publish(
                        &shared,
                        &instance,
                        LifecycleEventKind::ServiceCrashed,
                        EventDetail::Crashed {
                            exit_code: None,
                            restart_count,
                            will_restart: false,
                            backoff_secs: 0,
                        },
                    )
                    .await;
                    return;
                }
                {
                    let mut runtime = shared.runtime.write().unwrap_or_else(|e| e.into_inner());
                    runtime.restart_count += 1;
                }
                if !backoff_pause(&shared, &instance, &mut stop_rx).await {
                    return;
                }
                continue;
            }
        };

        let pid = child.id().unwrap_or(0);
        shared.pid.store(pid, Ordering::SeqCst);

        if instance.caps.is_some() {
            if let Err(e) = shared.limiter.assign(&instance.id, pid) {
                log::warn!("Resource limiter assign failed for {}: {}", instance.id, e);
            }
        }

        tee_output(&shared, &instance, &mut child);

        // Let the child reach its bind() before inspecting the listener
        // table; a stop during the settle window short-circuits.
        let mut stop_during_settle = false;
        tokio::select! {
            _ = tokio::time::sleep(BINDING_SETTLE_DELAY) => {}
            _ = wait_for_stop(&mut stop_rx) => { stop_during_settle = true; }
        }
        if stop_during_settle {
            transition(&shared, ProcessState::Stopping);
            let _ = shutdown_child(&instance, &mut child, pid).await;
            shared.pid.store(0, Ordering::SeqCst);
            shared.limiter.remove(&instance.id);
            finalize_stopped(&shared, &instance).await;
            return;
        }

        let report = shared.verifier.verify_bindings(&instance, pid);
        if !report.passed {
            for violation in &report.violations {
                if violation.severity == Severity::Error {
                    publish(
                        &shared,
                        &instance,
                        LifecycleEventKind::IsolationViolation,
                        EventDetail::Violation {
                            layer: violation.layer,
                            severity: violation.severity,
                            detail: violation.detail.clone(),
                        },
                    )
                    .await;
                }
            }
            log::error!(
                "Post-start binding verification failed for {} (pid {}), stopping",
                instance.id,
                pid
            );
            transition(&shared, ProcessState::Stopping);
            let _ = shutdown_child(&instance, &mut child, pid).await;
            shared.pid.store(0, Ordering::SeqCst);
            shared.limiter.remove(&instance.id);
            // Declared/actual divergence is not retried.
            transition(&shared, ProcessState::Crashed);
            return;
        }

        let started_at = Instant::now();
        {
            let mut runtime = shared.runtime.write().unwrap_or_else(|e| e.into_inner());
            runtime.started_at = Some(started_at);
        }
        transition(&shared, ProcessState::Running);
        publish(
            &shared,
            &instance,
            LifecycleEventKind::ServiceStarted,
            EventDetail::Started { pid },
        )
        .await;
        log::info!("Instance {} running (pid {})", instance.id, pid);

        let waited = tokio::select! {
            status = child.wait() => Some(status.ok()),
            _ = wait_for_stop(&mut stop_rx) => None,
        };
        let exit_status = match waited {
            Some(status) => status,
            None => {
                transition(&shared, ProcessState::Stopping);
                shutdown_child(&instance, &mut child, pid).await
            }
        };

        let uptime = started_at.elapsed();
        shared.pid.store(0, Ordering::SeqCst);
        {
            let mut runtime = shared.runtime.write().unwrap_or_else(|e| e.into_inner());
            runtime.started_at = None;
        }
        shared.limiter.remove(&instance.id);

        if *stop_rx.borrow() {
            finalize_stopped(&shared, &instance).await;
            return;
        }

        let exit_code = exit_status.and_then(|s| s.code());
        log::info!(
            "Instance {} exited (code {:?}) after {:?}",
            instance.id,
            exit_code,
            uptime
        );

        let (restart_count, backoff_secs) = {
            let mut runtime = shared.runtime.write().unwrap_or_else(|e| e.into_inner());
            if uptime >= shared.policy.stable_uptime {
                runtime.restart_count = 0;
                runtime.backoff = shared.policy.initial;
            }
            if instance.auto_restart {
                runtime.restart_count += 1;
            }
            (runtime.restart_count, runtime.backoff.as_secs())
        };

        publish(
            &shared,
            &instance,
            LifecycleEventKind::ServiceCrashed,
            EventDetail::Crashed {
                exit_code,
                restart_count,
                will_restart: instance.auto_restart,
                backoff_secs,
            },
        )
        .await;

        if !instance.auto_restart {
            transition(&shared, ProcessState::Crashed);
            return;
        }

        if !backoff_pause(&shared, &instance, &mut stop_rx).await {
            return;
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::panic)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{BackoffPolicy, ManagedProcess, ProcessState};
    use crate::events::BroadcastBus;
    use crate::instance::{FeatureKind, HealthSpec, ServiceInstance};
    use crate::isolation::IsolationVerifier;
    use crate::limits::NoopLimiter;
    use crate::logcap::LogCapture;
    use crate::registry::MemoryPortRegistry;

    fn shell_instance(id: &str, script: &str, auto_restart: bool) -> Arc<ServiceInstance> {
        Arc::new(ServiceInstance {
            id: id.to_string(),
            kind: FeatureKind::Custom("test".to_string()),
            name: id.to_string(),
            binary_path: "/bin/sh".into(),
            working_dir: "/tmp".into(),
            env: Vec::new(),
            args: vec!["-c".to_string(), script.to_string()],
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: Vec::new(),
            caps: None,
            shutdown_grace: Duration::from_secs(2),
            auto_restart,
            health: HealthSpec::default(),
            router_id: "router-1".to_string(),
        })
    }

    fn managed(instance: Arc<ServiceInstance>, policy: BackoffPolicy) -> (ManagedProcess, Arc<BroadcastBus>, tempfile::TempDir) {
        let bus = Arc::new(BroadcastBus::new(64));
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(
            LogCapture::new(dir.path().join(format!("{}.log", instance.id)), 1024 * 1024).unwrap(),
        );
        let verifier = Arc::new(IsolationVerifier::new(
            dir.path().to_path_buf(),
            Arc::new(MemoryPortRegistry::new()),
        ));
        let process = ManagedProcess::new(
            instance,
            Arc::<BroadcastBus>::clone(&bus),
            Arc::new(NoopLimiter::new()),
            verifier,
            logs,
            policy,
        );
        (process, bus, dir)
    }

    async fn wait_for_state(process: &ManagedProcess, wanted: ProcessState, within: Duration) {
        let mut rx = process.subscribe_state();
        tokio::time::timeout(within, rx.wait_for(|s| *s == wanted))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}, at {:?}", wanted, process.state()))
            .unwrap();
    }

    #[tokio::test]
    async fn start_runs_and_stop_finalizes() {
        let (process, _bus, _dir) = managed(
            shell_instance("svc-run", "sleep 30", false),
            BackoffPolicy::default(),
        );

        process.start().unwrap();
        wait_for_state(&process, ProcessState::Running, Duration::from_secs(5)).await;
        assert!(process.pid() > 0);

        process.stop().await.unwrap();
        assert_eq!(process.state(), ProcessState::Stopped);
        assert_eq!(process.pid(), 0);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (process, _bus, _dir) = managed(
            shell_instance("svc-idem", "sleep 30", false),
            BackoffPolicy::default(),
        );

        process.start().unwrap();
        wait_for_state(&process, ProcessState::Running, Duration::from_secs(5)).await;
        let pid = process.pid();

        process.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(process.pid(), pid, "second start must not respawn");

        process.stop().await.unwrap();
        process.stop().await.unwrap();
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn crash_without_auto_restart_goes_crashed() {
        let (process, _bus, _dir) = managed(
            shell_instance("svc-crash", "exit 1", false),
            BackoffPolicy::default(),
        );

        process.start().unwrap();
        wait_for_state(&process, ProcessState::Crashed, Duration::from_secs(5)).await;
        assert_eq!(process.pid(), 0);
        assert_eq!(process.restart_count(), 0);
    }

    #[tokio::test]
    async fn crash_loop_backs_off_and_stop_interrupts() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
            stable_uptime: Duration::from_secs(30),
        };
        let (process, _bus, _dir) = managed(shell_instance("svc-loop", "exit 1", true), policy);

        process.start().unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let restarts = process.restart_count();
        assert!(
            (3..=8).contains(&restarts),
            "expected bounded restart count, got {}",
            restarts
        );

        let stopped = tokio::time::timeout(Duration::from_millis(500), process.stop()).await;
        assert!(stopped.is_ok(), "stop must interrupt the backoff window");
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn ignoring_term_gets_force_killed_after_grace() {
        let (process, _bus, _dir) = managed(
            shell_instance(
                "svc-stubborn",
                "trap '' TERM; while true; do sleep 1; done",
                false,
            ),
            BackoffPolicy::default(),
        );

        process.start().unwrap();
        wait_for_state(&process, ProcessState::Running, Duration::from_secs(5)).await;

        let started = std::time::Instant::now();
        process.stop().await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(process.state(), ProcessState::Stopped);
        assert!(
            elapsed >= Duration::from_millis(1500),
            "force kill fired before the grace elapsed: {:?}",
            elapsed
        );
        assert!(elapsed < Duration::from_secs(10), "stop took too long: {:?}", elapsed);
    }

    #[tokio::test]
    async fn restart_after_stop_reaches_running() {
        let (process, _bus, _dir) = managed(
            shell_instance("svc-restart", "sleep 30", false),
            BackoffPolicy::default(),
        );

        process.start().unwrap();
        wait_for_state(&process, ProcessState::Running, Duration::from_secs(5)).await;
        process.stop().await.unwrap();

        process.start().unwrap();
        wait_for_state(&process, ProcessState::Running, Duration::from_secs(5)).await;
        assert!(process.pid() > 0);
        process.stop().await.unwrap();
    }
}
