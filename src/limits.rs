//! Resource limiting for managed processes.
//!
//! Platform-specific and best-effort: where no control-group mechanism is
//! available the limiter degrades to an observable no-op (one warning per
//! instance). Removal failures are logged, never fatal.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{OrchestratorError, Result};
use crate::instance::ResourceCaps;

/// Applies memory/CPU caps to a live PID and removes them on exit.
pub trait ResourceLimiter: Send + Sync {
    /// Create the control unit for an instance before its process spawns.
    fn prepare(&self, instance_id: &str, caps: &ResourceCaps) -> Result<()>;
    /// Attach a live PID to the instance's control unit.
    fn assign(&self, instance_id: &str, pid: u32) -> Result<()>;
    /// Tear the unit down after exit. Failures are logged by the caller's
    /// contract, never propagated as fatal.
    fn remove(&self, instance_id: &str);
}

/// Observable no-op for platforms without a usable control-group tree.
#[derive(Default)]
pub struct NoopLimiter {
    warned: Mutex<HashSet<String>>,
}

impl NoopLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn warn_once(&self, instance_id: &str) {
        let mut warned = self.warned.lock().unwrap_or_else(|e| e.into_inner());
        if warned.insert(instance_id.to_string()) {
            log::warn!(
                "Resource limits unavailable on this platform, {} runs uncapped",
                instance_id
            );
        }
    }
}

impl ResourceLimiter for NoopLimiter {
    fn prepare(&self, instance_id: &str, _caps: &ResourceCaps) -> Result<()> {
        self.warn_once(instance_id);
        Ok(())
    }

    fn assign(&self, _instance_id: &str, _pid: u32) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _instance_id: &str) {}
}

/// cgroup-v2 limiter: one child group per instance under a delegated root.
#[cfg(target_os = "linux")]
pub struct CgroupLimiter {
    root: PathBuf,
    warned: Mutex<HashSet<String>>,
}

#[cfg(target_os = "linux")]
impl CgroupLimiter {
    /// CPU period used for `cpu.max`, in microseconds.
    const CPU_PERIOD_USEC: u64 = 100_000;

    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            warned: Mutex::new(HashSet::new()),
        }
    }

    fn group_dir(&self, instance_id: &str) -> PathBuf {
        self.root.join(instance_id)
    }

    fn available(&self) -> bool {
        self.root.join("cgroup.procs").exists()
    }

    fn warn_once(&self, instance_id: &str) {
        let mut warned = self.warned.lock().unwrap_or_else(|e| e.into_inner());
        if warned.insert(instance_id.to_string()) {
            log::warn!(
                "cgroup root {} is not usable, {} runs uncapped",
                self.root.display(),
                instance_id
            );
        }
    }

    fn write_control(dir: &std::path::Path, file: &str, value: &str) -> Result<()> {
        std::fs::write(dir.join(file), value).map_err(|e| {
            OrchestratorError::io(format!("write {}/{}: {e}", dir.display(), file))
        })
    }
}

#[cfg(target_os = "linux")]
impl ResourceLimiter for CgroupLimiter {
    fn prepare(&self, instance_id: &str, caps: &ResourceCaps) -> Result<()> {
        if !self.available() {
            self.warn_once(instance_id);
            return Ok(());
        }

        let dir = self.group_dir(instance_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| OrchestratorError::io(format!("create {}: {e}", dir.display())))?;

        if let Some(memory_mb) = caps.memory_mb {
            Self::write_control(&dir, "memory.max", &(memory_mb * 1024 * 1024).to_string())?;
        }
        if let Some(cpu_percent) = caps.cpu_percent {
            let quota = u64::from(cpu_percent) * Self::CPU_PERIOD_USEC / 100;
            Self::write_control(&dir, "cpu.max", &format!("{} {}", quota, Self::CPU_PERIOD_USEC))?;
        }
        Ok(())
    }

    fn assign(&self, instance_id: &str, pid: u32) -> Result<()> {
        if !self.available() {
            return Ok(());
        }
        let dir = self.group_dir(instance_id);
        Self::write_control(&dir, "cgroup.procs", &pid.to_string())
    }

    fn remove(&self, instance_id: &str) {
        if !self.available() {
            return;
        }
        let dir = self.group_dir(instance_id);
        // The group must be empty; the process has exited by now, but a
        // straggling descendant makes this fail. Best effort.
        if let Err(e) = std::fs::remove_dir(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove cgroup {}: {}", dir.display(), e);
            }
        }
    }
}

/// The platform's default limiter.
#[cfg(target_os = "linux")]
pub fn platform_limiter(cgroup_root: PathBuf) -> std::sync::Arc<dyn ResourceLimiter> {
    std::sync::Arc::new(CgroupLimiter::new(cgroup_root))
}

#[cfg(not(target_os = "linux"))]
pub fn platform_limiter(_cgroup_root: PathBuf) -> std::sync::Arc<dyn ResourceLimiter> {
    std::sync::Arc::new(NoopLimiter::new())
}
