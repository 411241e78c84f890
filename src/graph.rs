//! Dependency edges between instances.
//!
//! Edges live in the external store; a cache over them is rebuilt at
//! startup and after every mutation, so reads never touch the store.
//! The edge set is kept a DAG at insert time; a cycle smuggled in behind
//! the store's back still surfaces as a layering error.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::store::{EdgeStore, InstanceStore};

/// REQUIRES gates startup on the target's health; WANTS only orders it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Requires,
    Wants,
}

/// Directed edge: `from` depends on `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub id: String,
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
    /// Start the target automatically when the dependent starts.
    pub auto_start: bool,
    /// How long a boot layer waits for the target to become healthy.
    pub health_timeout: Duration,
}

/// Nodes and edges scoped to one router, for graph displays.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyGraphView {
    pub nodes: Vec<String>,
    pub edges: Vec<DependencyEdge>,
}

/// Owns the edge set; never the instances.
pub struct DependencyManager {
    instances: Arc<dyn InstanceStore>,
    edges: Arc<dyn EdgeStore>,
    cache: RwLock<Vec<DependencyEdge>>,
}

impl DependencyManager {
    pub async fn new(instances: Arc<dyn InstanceStore>, edges: Arc<dyn EdgeStore>) -> Result<Self> {
        let manager = Self {
            instances,
            edges,
            cache: RwLock::new(Vec::new()),
        };
        manager.rebuild_cache().await?;
        Ok(manager)
    }

    async fn rebuild_cache(&self) -> Result<()> {
        let edges = self.edges.list().await?;
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        *cache = edges;
        Ok(())
    }

    fn cached(&self) -> Vec<DependencyEdge> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Insert an edge after validating: no self-dependency, both
    /// endpoints exist, not a duplicate, and no cycle (checked by DFS
    /// from `to`; reaching `from` means the new edge closes a loop).
    pub async fn add_edge(
        &self,
        from: &str,
        to: &str,
        kind: EdgeKind,
        auto_start: bool,
        health_timeout: Duration,
    ) -> Result<DependencyEdge> {
        if from == to {
            return Err(OrchestratorError::validation(format!(
                "instance {} cannot depend on itself",
                from
            )));
        }
        if !self.instances.exists(from).await? {
            return Err(OrchestratorError::not_found(from));
        }
        if !self.instances.exists(to).await? {
            return Err(OrchestratorError::not_found(to));
        }

        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if cache.iter().any(|e| e.from == from && e.to == to) {
                return Err(OrchestratorError::duplicate_edge(from, to));
            }
            if let Some(mut path) = reach(&cache, to, from) {
                // Present the loop starting at the new edge's source.
                path.insert(0, from.to_string());
                return Err(OrchestratorError::cycle(&path));
            }
        }

        let edge = DependencyEdge {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: to.to_string(),
            kind,
            auto_start,
            health_timeout,
        };
        self.edges.insert(edge.clone()).await?;
        self.rebuild_cache().await?;
        log::info!("Dependency added: {} -> {} ({:?})", from, to, kind);
        Ok(edge)
    }

    /// Remove by edge id. Missing edges are an explicit not-found error.
    pub async fn remove_edge(&self, edge_id: &str) -> Result<()> {
        self.edges.remove(edge_id).await?;
        self.rebuild_cache().await?;
        Ok(())
    }

    /// Edges where `instance_id` is the dependent (its requirements).
    pub fn dependencies(&self, instance_id: &str) -> Vec<DependencyEdge> {
        self.cached()
            .into_iter()
            .filter(|e| e.from == instance_id)
            .collect()
    }

    /// Edges where `instance_id` is the target (who depends on it).
    pub fn dependents(&self, instance_id: &str) -> Vec<DependencyEdge> {
        self.cached()
            .into_iter()
            .filter(|e| e.to == instance_id)
            .collect()
    }

    /// Remove every edge incident to the instance. Called when an
    /// instance is destroyed.
    pub async fn cleanup_for_instance(&self, instance_id: &str) -> Result<()> {
        let removed = self.edges.remove_for_instance(instance_id).await?;
        if !removed.is_empty() {
            log::info!(
                "Removed {} dependency edge(s) for {}",
                removed.len(),
                instance_id
            );
        }
        self.rebuild_cache().await?;
        Ok(())
    }

    /// Instances of one router plus the edges among them.
    pub async fn graph_for_router(&self, router_id: &str) -> Result<DependencyGraphView> {
        let nodes: Vec<String> = self
            .instances
            .list()
            .await?
            .into_iter()
            .filter(|i| i.router_id == router_id)
            .map(|i| i.id)
            .collect();
        let node_set: HashSet<&String> = nodes.iter().collect();
        let edges = self
            .cached()
            .into_iter()
            .filter(|e| node_set.contains(&e.from) && node_set.contains(&e.to))
            .collect();
        Ok(DependencyGraphView { nodes, edges })
    }

    /// Kahn layering over the subgraph induced by `ids`. Layer 0 holds
    /// instances with no dependencies inside the subgraph; each later
    /// layer depends only on earlier ones. A layering that cannot cover
    /// every id means the DAG invariant was violated out-of-band.
    pub fn compute_startup_order(&self, ids: &[String]) -> Result<Vec<Vec<String>>> {
        let id_set: HashSet<&String> = ids.iter().collect();
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());

        // dep_count[x] = number of in-subgraph instances x depends on.
        let mut dep_count: HashMap<&String, usize> = ids.iter().map(|id| (id, 0)).collect();
        let mut dependents: HashMap<&String, Vec<&String>> = HashMap::new();
        for edge in cache.iter() {
            let (Some(&from), Some(&to)) = (id_set.get(&edge.from), id_set.get(&edge.to)) else {
                continue;
            };
            *dep_count.entry(from).or_insert(0) += 1;
            dependents.entry(to).or_default().push(from);
        }

        let mut layers: Vec<Vec<String>> = Vec::new();
        let mut emitted = 0usize;
        let mut ready: Vec<&String> = dep_count
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();

        while !ready.is_empty() {
            let mut layer: Vec<String> = ready.iter().map(|id| (*id).clone()).collect();
            layer.sort();
            emitted += layer.len();

            let mut next: Vec<&String> = Vec::new();
            for id in ready {
                for &dependent in dependents.get(id).into_iter().flatten() {
                    let count = dep_count
                        .get_mut(dependent)
                        .ok_or_else(|| OrchestratorError::internal("dependent outside subgraph"))?;
                    *count -= 1;
                    if *count == 0 {
                        next.push(dependent);
                    }
                }
            }
            layers.push(layer);
            ready = next;
        }

        if emitted < ids.len() {
            let stuck: Vec<String> = dep_count
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(id, _)| (*id).clone())
                .collect();
            return Err(OrchestratorError::cycle(&stuck));
        }

        Ok(layers)
    }
}

/// DFS along dependency direction: the path from `start` to `goal`, if
/// `goal` is reachable.
fn reach(edges: &[DependencyEdge], start: &str, goal: &str) -> Option<Vec<String>> {
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        successors
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<(&str, Vec<String>)> = vec![(start, vec![start.to_string()])];
    while let Some((node, path)) = stack.pop() {
        if node == goal {
            return Some(path);
        }
        if !visited.insert(node) {
            continue;
        }
        for next in successors.get(node).into_iter().flatten() {
            let mut next_path = path.clone();
            next_path.push((*next).to_string());
            stack.push((*next, next_path));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{DependencyManager, EdgeKind};
    use crate::error::ErrorKind;
    use crate::instance::{FeatureKind, HealthSpec, ServiceInstance};
    use crate::store::{InstanceStore as _, MemoryStore};

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            kind: FeatureKind::Dns,
            name: id.to_string(),
            binary_path: "/opt/services/svcd".into(),
            working_dir: "/opt/services".into(),
            env: Vec::new(),
            args: Vec::new(),
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: Vec::new(),
            caps: None,
            shutdown_grace: Duration::from_secs(2),
            auto_restart: false,
            health: HealthSpec::default(),
            router_id: "router-1".to_string(),
        }
    }

    async fn manager_with(ids: &[&str]) -> (DependencyManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for id in ids {
            store.insert(instance(id)).await.unwrap();
        }
        let manager = DependencyManager::new(
            Arc::<MemoryStore>::clone(&store),
            Arc::<MemoryStore>::clone(&store),
        )
        .await
        .unwrap();
        (manager, store)
    }

    const NO_WAIT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn chain_layers_leaves_first() {
        let (manager, _store) = manager_with(&["a", "b", "c"]).await;
        manager.add_edge("a", "b", EdgeKind::Requires, false, NO_WAIT).await.unwrap();
        manager.add_edge("b", "c", EdgeKind::Requires, false, NO_WAIT).await.unwrap();

        let layers = manager
            .compute_startup_order(&["a".to_string(), "b".to_string(), "c".to_string()])
            .unwrap();
        assert_eq!(
            layers,
            vec![
                vec!["c".to_string()],
                vec!["b".to_string()],
                vec!["a".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn layers_flatten_to_permutation() {
        let (manager, _store) = manager_with(&["a", "b", "c", "d"]).await;
        manager.add_edge("a", "c", EdgeKind::Requires, false, NO_WAIT).await.unwrap();
        manager.add_edge("b", "c", EdgeKind::Wants, false, NO_WAIT).await.unwrap();

        let ids: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let layers = manager.compute_startup_order(&ids).unwrap();

        let mut flat: Vec<String> = layers.iter().flatten().cloned().collect();
        flat.sort();
        assert_eq!(flat, ids);
        // c precedes both a and b.
        let layer_of = |id: &str| layers.iter().position(|l| l.iter().any(|x| x == id)).unwrap();
        assert!(layer_of("c") < layer_of("a"));
        assert!(layer_of("c") < layer_of("b"));
    }

    #[tokio::test]
    async fn cycle_is_rejected_with_path() {
        let (manager, _store) = manager_with(&["a", "b", "c"]).await;
        manager.add_edge("a", "b", EdgeKind::Requires, false, NO_WAIT).await.unwrap();
        manager.add_edge("b", "c", EdgeKind::Requires, false, NO_WAIT).await.unwrap();

        let err = manager
            .add_edge("c", "a", EdgeKind::Requires, false, NO_WAIT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cycle);
        assert_eq!(err.payload_get("path"), Some("c -> a -> b -> c"));

        // The rejected edge must not have mutated the graph.
        assert!(manager.dependencies("c").is_empty());
        assert_eq!(manager.dependents("c").len(), 1);
    }

    #[tokio::test]
    async fn self_dependency_rejected() {
        let (manager, _store) = manager_with(&["a"]).await;
        let err = manager
            .add_edge("a", "a", EdgeKind::Requires, false, NO_WAIT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn missing_endpoint_rejected() {
        let (manager, _store) = manager_with(&["a"]).await;
        let err = manager
            .add_edge("a", "ghost", EdgeKind::Requires, false, NO_WAIT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn duplicate_edge_rejected_and_readd_after_remove_works() {
        let (manager, _store) = manager_with(&["a", "b"]).await;
        let edge = manager
            .add_edge("a", "b", EdgeKind::Requires, false, NO_WAIT)
            .await
            .unwrap();

        let err = manager
            .add_edge("a", "b", EdgeKind::Wants, false, NO_WAIT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateEdge);

        manager.remove_edge(&edge.id).await.unwrap();
        let err = manager.remove_edge(&edge.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        manager
            .add_edge("a", "b", EdgeKind::Requires, false, NO_WAIT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cleanup_removes_incident_edges() {
        let (manager, _store) = manager_with(&["a", "b", "c"]).await;
        manager.add_edge("a", "b", EdgeKind::Requires, false, NO_WAIT).await.unwrap();
        manager.add_edge("b", "c", EdgeKind::Wants, false, NO_WAIT).await.unwrap();

        manager.cleanup_for_instance("b").await.unwrap();
        assert!(manager.dependencies("a").is_empty());
        assert!(manager.dependents("c").is_empty());
    }

    #[tokio::test]
    async fn graph_for_router_scopes_nodes_and_edges() {
        let store = Arc::new(MemoryStore::new());
        for id in ["a", "b"] {
            store.insert(instance(id)).await.unwrap();
        }
        let mut other = instance("x");
        other.router_id = "router-2".to_string();
        store.insert(other).await.unwrap();

        let manager = DependencyManager::new(
            Arc::<MemoryStore>::clone(&store),
            Arc::<MemoryStore>::clone(&store),
        )
        .await
        .unwrap();
        manager.add_edge("a", "b", EdgeKind::Requires, false, NO_WAIT).await.unwrap();
        manager.add_edge("a", "x", EdgeKind::Wants, false, NO_WAIT).await.unwrap();

        let view = manager.graph_for_router("router-1").await.unwrap();
        assert_eq!(view.nodes.len(), 2);
        assert_eq!(view.edges.len(), 1);
        assert_eq!(view.edges[0].to, "b");
    }

    #[tokio::test]
    async fn out_of_band_cycle_surfaces_in_layering() {
        use crate::graph::DependencyEdge;
        use crate::store::EdgeStore;

        let (manager, store) = manager_with(&["a", "b"]).await;
        manager.add_edge("a", "b", EdgeKind::Requires, false, NO_WAIT).await.unwrap();
        // Sneak the reverse edge straight into the store.
        EdgeStore::insert(
            store.as_ref(),
            DependencyEdge {
                id: "rogue".to_string(),
                from: "b".to_string(),
                to: "a".to_string(),
                kind: EdgeKind::Requires,
                auto_start: false,
                health_timeout: NO_WAIT,
            },
        )
        .await
        .unwrap();
        // Any mutation rebuilds the cache from the store.
        manager.cleanup_for_instance("unrelated").await.unwrap();

        let err = manager
            .compute_startup_order(&["a".to_string(), "b".to_string()])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cycle);
    }
}
