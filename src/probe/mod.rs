//! Health probes.
//!
//! A probe answers one question about one target: healthy or not, and how
//! long the answer took. Probes are side-effect-free with respect to
//! instance state, honor the caller's timeout, and never panic; internal
//! errors surface as unhealthy plus a message.

mod kinds;

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use kinds::{HttpProbe, ProcessProbe, Socks5Probe, TcpProbe};

use crate::error::{OrchestratorError, Result};
use crate::instance::{ProbeKind, ServiceInstance};

/// Result of one probe invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency,
            error: None,
        }
    }

    pub fn unhealthy(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, timeout: Duration) -> ProbeOutcome;
}

/// Build the probe declared by an instance's health spec.
///
/// The PID handle is shared with the instance's managed process so the
/// process probe always sees the current incarnation. TCP and SOCKS5
/// targets default to the declared listen address and first declared
/// port; HTTP defaults to `http://<ip>:<port>/`. `ProbeKind::Custom`
/// has no buildable default, the caller must supply its own
/// [`HealthProbe`].
pub fn probe_for_instance(
    instance: &ServiceInstance,
    pid: Arc<AtomicU32>,
) -> Result<Arc<dyn HealthProbe>> {
    let default_addr = || -> Result<String> {
        let port = instance
            .ports
            .first()
            .map(|p| p.port)
            .ok_or_else(|| {
                OrchestratorError::validation(format!(
                    "instance {} declares no ports for its {:?} probe",
                    instance.id, instance.health.kind
                ))
            })?;
        Ok(format!("{}:{}", instance.listen_ip, port))
    };

    match instance.health.kind {
        ProbeKind::Process => Ok(Arc::new(ProcessProbe::new(pid))),
        ProbeKind::Tcp => {
            let addr = match &instance.health.target {
                Some(t) => t.clone(),
                None => default_addr()?,
            };
            Ok(Arc::new(TcpProbe::new(addr)))
        }
        ProbeKind::Http => {
            let url = match &instance.health.target {
                Some(t) => t.clone(),
                None => format!("http://{}/", default_addr()?),
            };
            Ok(Arc::new(HttpProbe::new(url)?))
        }
        ProbeKind::Socks5 => {
            let addr = match &instance.health.target {
                Some(t) => t.clone(),
                None => default_addr()?,
            };
            Ok(Arc::new(Socks5Probe::new(addr)))
        }
        ProbeKind::Custom => Err(OrchestratorError::validation(format!(
            "instance {} declares a custom probe but none was supplied",
            instance.id
        ))),
    }
}
