//! Port registry seam.
//!
//! Allocation and release are driven by upstream provisioning; the
//! orchestrator only reads the registry to confirm each declared port is
//! owned by the instance about to start.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{OrchestratorError, Result};
use crate::instance::Protocol;

/// Read side consumed by the isolation verifier.
#[async_trait]
pub trait PortRegistry: Send + Sync {
    /// The instance id holding (port, protocol), if any.
    async fn lookup(&self, port: u16, protocol: Protocol) -> Result<Option<String>>;
}

/// In-memory registry. Allocate/release mirror the upstream provisioning
/// surface so tests and the embedding backend can seed it.
#[derive(Default)]
pub struct MemoryPortRegistry {
    allocations: RwLock<HashMap<(u16, Protocol), String>>,
}

impl MemoryPortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, port: u16, protocol: Protocol, instance_id: &str) -> Result<()> {
        let mut map = self.allocations.write().unwrap_or_else(|e| e.into_inner());
        if let Some(owner) = map.get(&(port, protocol)) {
            if owner != instance_id {
                return Err(OrchestratorError::validation(format!(
                    "port {}/{:?} already allocated to {}",
                    port, protocol, owner
                )));
            }
            return Ok(());
        }
        map.insert((port, protocol), instance_id.to_string());
        Ok(())
    }

    pub fn release(&self, port: u16, protocol: Protocol) {
        let mut map = self.allocations.write().unwrap_or_else(|e| e.into_inner());
        map.remove(&(port, protocol));
    }

    pub fn release_for_instance(&self, instance_id: &str) {
        let mut map = self.allocations.write().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, owner| owner != instance_id);
    }
}

#[async_trait]
impl PortRegistry for MemoryPortRegistry {
    async fn lookup(&self, port: u16, protocol: Protocol) -> Result<Option<String>> {
        let map = self.allocations.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(&(port, protocol)).cloned())
    }
}
