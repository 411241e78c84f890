//! Persistence seams for instances and dependency edges.
//!
//! The relational store is an external collaborator; the orchestrator
//! talks to it through these traits and keeps only rebuildable caches in
//! memory. [`MemoryStore`] backs tests and single-host deployments that
//! persist elsewhere.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{OrchestratorError, Result};
use crate::graph::DependencyEdge;
use crate::instance::ServiceInstance;

/// CRUD over service instance records.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert(&self, instance: ServiceInstance) -> Result<()>;
    async fn update(&self, instance: ServiceInstance) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<ServiceInstance>>;
    async fn list(&self) -> Result<Vec<ServiceInstance>>;

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }
}

/// CRUD over dependency edge records.
#[async_trait]
pub trait EdgeStore: Send + Sync {
    async fn insert(&self, edge: DependencyEdge) -> Result<()>;
    async fn remove(&self, edge_id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<DependencyEdge>>;
    /// Remove every edge incident to the instance, returning removed ids.
    async fn remove_for_instance(&self, instance_id: &str) -> Result<Vec<String>>;
}

/// In-memory store implementing both seams.
#[derive(Default)]
pub struct MemoryStore {
    instances: RwLock<HashMap<String, ServiceInstance>>,
    edges: RwLock<HashMap<String, DependencyEdge>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert(&self, instance: ServiceInstance) -> Result<()> {
        let mut map = self.instances.write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&instance.id) {
            return Err(OrchestratorError::validation(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        map.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn update(&self, instance: ServiceInstance) -> Result<()> {
        let mut map = self.instances.write().unwrap_or_else(|e| e.into_inner());
        if !map.contains_key(&instance.id) {
            return Err(OrchestratorError::not_found(&instance.id));
        }
        map.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut map = self.instances.write().unwrap_or_else(|e| e.into_inner());
        map.remove(id)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::not_found(id))
    }

    async fn get(&self, id: &str) -> Result<Option<ServiceInstance>> {
        let map = self.instances.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ServiceInstance>> {
        let map = self.instances.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<ServiceInstance> = map.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}

#[async_trait]
impl EdgeStore for MemoryStore {
    async fn insert(&self, edge: DependencyEdge) -> Result<()> {
        let mut map = self.edges.write().unwrap_or_else(|e| e.into_inner());
        map.insert(edge.id.clone(), edge);
        Ok(())
    }

    async fn remove(&self, edge_id: &str) -> Result<()> {
        let mut map = self.edges.write().unwrap_or_else(|e| e.into_inner());
        map.remove(edge_id)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::not_found(edge_id))
    }

    async fn list(&self) -> Result<Vec<DependencyEdge>> {
        let map = self.edges.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<DependencyEdge> = map.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn remove_for_instance(&self, instance_id: &str) -> Result<Vec<String>> {
        let mut map = self.edges.write().unwrap_or_else(|e| e.into_inner());
        let doomed: Vec<String> = map
            .values()
            .filter(|e| e.from == instance_id || e.to == instance_id)
            .map(|e| e.id.clone())
            .collect();
        for id in &doomed {
            map.remove(id);
        }
        Ok(doomed)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use super::{InstanceStore as _, MemoryStore};
    use crate::instance::{FeatureKind, HealthSpec, ServiceInstance};

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            kind: FeatureKind::Proxy,
            name: id.to_string(),
            binary_path: "/opt/services/proxyd".into(),
            working_dir: "/opt/services".into(),
            env: Vec::new(),
            args: Vec::new(),
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: Vec::new(),
            caps: None,
            shutdown_grace: Duration::from_secs(5),
            auto_restart: false,
            health: HealthSpec::default(),
            router_id: "router-1".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_get_remove_roundtrip() {
        let store = MemoryStore::new();
        store.insert(instance("a")).await.unwrap();
        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.exists("a").await.unwrap());

        store.remove("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.remove("a").await.is_err());
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = MemoryStore::new();
        store.insert(instance("a")).await.unwrap();
        assert!(store.insert(instance("a")).await.is_err());
    }

    #[tokio::test]
    async fn list_is_sorted_by_id() {
        let store = MemoryStore::new();
        store.insert(instance("b")).await.unwrap();
        store.insert(instance("a")).await.unwrap();
        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
