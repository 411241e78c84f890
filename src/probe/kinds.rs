//! Built-in probe implementations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;

use super::{HealthProbe, ProbeOutcome};
use crate::error::{OrchestratorError, Result};
use crate::process::control;

/// Signal-0 liveness check against the instance's current PID.
pub struct ProcessProbe {
    pid: Arc<AtomicU32>,
}

impl ProcessProbe {
    pub fn new(pid: Arc<AtomicU32>) -> Self {
        Self { pid }
    }
}

#[async_trait]
impl HealthProbe for ProcessProbe {
    async fn check(&self, _timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return ProbeOutcome::unhealthy(start.elapsed(), "process not running");
        }
        if !control::is_process_alive(pid) {
            return ProbeOutcome::unhealthy(start.elapsed(), format!("pid {} not found", pid));
        }
        if control::is_zombie(pid) {
            return ProbeOutcome::unhealthy(start.elapsed(), format!("pid {} is a zombie", pid));
        }
        ProbeOutcome::healthy(start.elapsed())
    }
}

/// TCP dial check: healthy iff the connection completes in time.
pub struct TcpProbe {
    addr: String,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_stream)) => ProbeOutcome::healthy(start.elapsed()),
            Ok(Err(e)) => ProbeOutcome::unhealthy(start.elapsed(), e.to_string()),
            Err(_) => ProbeOutcome::unhealthy(
                start.elapsed(),
                format!("connect to {} timed out", self.addr),
            ),
        }
    }
}

/// HTTP GET check. Redirects are followed; any status below 500 counts as
/// up, including 401 (service up, auth required).
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| OrchestratorError::internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();
        match self.client.get(&self.url).timeout(timeout).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if (200..500).contains(&status) {
                    ProbeOutcome::healthy(start.elapsed())
                } else {
                    ProbeOutcome::unhealthy(start.elapsed(), format!("status {}", status))
                }
            }
            Err(e) => ProbeOutcome::unhealthy(start.elapsed(), e.to_string()),
        }
    }
}

/// SOCKS5 no-auth handshake: send `05 01 00`, require a version-5 reply.
pub struct Socks5Probe {
    addr: String,
}

impl Socks5Probe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    async fn handshake(&self) -> std::result::Result<(), String> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| e.to_string())?;
        stream
            .write_all(&[0x05, 0x01, 0x00])
            .await
            .map_err(|e| e.to_string())?;
        let mut reply = [0u8; 2];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|e| e.to_string())?;
        if reply[0] != 0x05 {
            return Err(format!("unexpected version byte {:#04x}", reply[0]));
        }
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for Socks5Probe {
    async fn check(&self, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();
        match tokio::time::timeout(timeout, self.handshake()).await {
            Ok(Ok(())) => ProbeOutcome::healthy(start.elapsed()),
            Ok(Err(e)) => ProbeOutcome::unhealthy(start.elapsed(), e),
            Err(_) => ProbeOutcome::unhealthy(
                start.elapsed(),
                format!("handshake with {} timed out", self.addr),
            ),
        }
    }
}
