//! Service orchestrator for the router management backend.
//!
//! Supervises the auxiliary service processes (DNS, proxies, VPN helpers)
//! running alongside the panel: per-instance process lifecycles with
//! bounded restart backoff, continuous health checking, pre-start
//! isolation verification, and dependency-ordered boot and shutdown.
//!
//! Everything external (the relational store, the event bus, the port
//! registry, resource limits) is reached through injected traits, so
//! several orchestrators can coexist in one process.

mod config;
mod error;
mod events;
mod graph;
mod health;
mod instance;
mod isolation;
mod limits;
mod logcap;
mod probe;
mod process;
mod registry;
mod store;
mod supervisor;

pub use config::OrchestratorConfig;
pub use error::{ErrorKind, OrchestratorError, Result};
pub use events::{BroadcastBus, EventBus, EventDetail, LifecycleEvent, LifecycleEventKind};
pub use graph::{DependencyEdge, DependencyGraphView, DependencyManager, EdgeKind};
pub use health::{HealthChecker, HealthRecord, HealthState, RestartRequest};
pub use instance::{
    FeatureKind, HealthSpec, PortSpec, ProbeKind, Protocol, ResourceCaps, ServiceInstance,
};
pub use isolation::{IsolationVerifier, Severity, VerifyReport, Violation, ViolationLayer};
pub use limits::{platform_limiter, NoopLimiter, ResourceLimiter};
pub use logcap::{LogCapture, StreamKind};
pub use probe::{
    probe_for_instance, HealthProbe, HttpProbe, ProbeOutcome, ProcessProbe, Socks5Probe, TcpProbe,
};
pub use process::{BackoffPolicy, ManagedProcess, ProcessSnapshot, ProcessState};
pub use registry::{MemoryPortRegistry, PortRegistry};
pub use store::{EdgeStore, InstanceStore, MemoryStore};
pub use supervisor::{BootOutcome, BootReport, RuntimeSnapshot, Supervisor};

#[cfg(target_os = "linux")]
pub use limits::CgroupLimiter;
