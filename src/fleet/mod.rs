mod node;
mod server;
mod task;

pub use node::Node;
pub use server::Server;
pub use task::{RemoteTask, TaskOutcome};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::DiscoroError;
use crate::message::Location;

/// In-memory registry of every node and server the scheduler currently
/// knows about, shared between the bootstrap, status-processor, timer and
/// client-RPC tasks. Mirrors the role of `_Scheduler`'s `_nodes` /
/// `_servers` dictionaries in the original implementation, but with a
/// single lock instead of relying on asyncoro's single-threaded
/// cooperative scheduling to make updates atomic.
#[derive(Clone)]
pub struct Fleet {
    inner: Arc<RwLock<FleetState>>,
}

#[derive(Default)]
struct FleetState {
    nodes: HashMap<Location, Node>,
    servers_by_name: HashMap<String, Vec<Location>>,
}

impl Fleet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(FleetState::default())),
        }
    }

    pub async fn upsert_node(&self, location: Location, agent_id: Option<String>) {
        let mut state = self.inner.write().await;
        state
            .nodes
            .entry(location)
            .or_insert_with(|| Node::new(location, agent_id.clone()));
        debug!(%location, "node tracked");
    }

    pub async fn remove_node(&self, location: &Location) -> Option<Node> {
        let mut state = self.inner.write().await;
        let removed = state.nodes.remove(location);
        if let Some(node) = &removed {
            for server_loc in node.servers.keys() {
                Self::drop_server_name_index(&mut state.servers_by_name, server_loc);
            }
            info!(%location, servers = node.servers.len(), "node lost");
        }
        removed
    }

    pub async fn add_server(&self, node_location: Location, server: Server) -> Result<(), DiscoroError> {
        let mut state = self.inner.write().await;
        let server_location = server.location;
        let name = server.name.clone();
        let node = state
            .nodes
            .entry(node_location)
            .or_insert_with(|| Node::new(node_location, None));
        node.add_server(server);
        state
            .servers_by_name
            .entry(name)
            .or_default()
            .push(server_location);
        Ok(())
    }

    pub async fn remove_server(&self, node_location: &Location, server_location: &Location) -> Option<Server> {
        let mut state = self.inner.write().await;
        let removed = state
            .nodes
            .get_mut(node_location)
            .and_then(|n| n.remove_server(server_location));
        if removed.is_some() {
            Self::drop_server_name_index(&mut state.servers_by_name, server_location);
        }
        removed
    }

    fn drop_server_name_index(index: &mut HashMap<String, Vec<Location>>, location: &Location) {
        index.retain(|_, locations| {
            locations.retain(|l| l != location);
            !locations.is_empty()
        });
    }

    /// Picks the least-loaded server registered under `name`, the same
    /// round-robin-by-load policy the original scheduler's default
    /// `node_allocate`/`run` path uses when a client does not pin a
    /// specific server.
    pub async fn pick_server(&self, name: &str) -> Result<Location, DiscoroError> {
        let state = self.inner.read().await;
        let candidates = state
            .servers_by_name
            .get(name)
            .ok_or_else(|| DiscoroError::NoServerAvailable {
                name: name.to_string(),
            })?;

        candidates
            .iter()
            .filter_map(|loc| {
                state
                    .nodes
                    .values()
                    .find_map(|n| n.servers.get(loc).map(|s| (*loc, s.load())))
            })
            .min_by_key(|(_, load)| *load)
            .map(|(loc, _)| loc)
            .ok_or_else(|| DiscoroError::NoServerAvailable {
                name: name.to_string(),
            })
    }

    pub async fn place_task(
        &self,
        node_location: &Location,
        server_location: &Location,
        task: RemoteTask,
    ) -> Result<(), DiscoroError> {
        let mut state = self.inner.write().await;
        let server = state
            .nodes
            .get_mut(node_location)
            .and_then(|n| n.server_mut(server_location))
            .ok_or(DiscoroError::NoServerAvailable {
                name: server_location.to_string(),
            })?;
        server.place_task(task);
        Ok(())
    }

    pub async fn set_server_status(
        &self,
        node_location: &Location,
        server_location: &Location,
        status: crate::message::DiscoroStatus,
    ) {
        let mut state = self.inner.write().await;
        if let Some(server) = state
            .nodes
            .get_mut(node_location)
            .and_then(|n| n.server_mut(server_location))
        {
            server.status = status;
        }
    }

    pub async fn set_node_status(&self, node_location: &Location, status: crate::message::DiscoroStatus) {
        let mut state = self.inner.write().await;
        if let Some(node) = state.nodes.get_mut(node_location) {
            node.status = status;
        }
    }

    pub async fn record_task_outcome(
        &self,
        node_location: &Location,
        server_location: &Location,
        task_id: uuid::Uuid,
        value: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let mut state = self.inner.write().await;
        if let Some(server) = state
            .nodes
            .get_mut(node_location)
            .and_then(|n| n.server_mut(server_location))
        {
            server.record_outcome(task_id, value, error);
        }
    }

    /// Consumes a buffered outcome for `task_id`, if one raced ahead of the
    /// spawn that placed it. Used by the spawn path to resolve the race
    /// described in §8: a termination that arrived before its own spawn ack
    /// must not leave the task sitting in `coros`.
    pub async fn take_buffered_outcome(
        &self,
        node_location: &Location,
        server_location: &Location,
        task_id: uuid::Uuid,
    ) -> Option<crate::fleet::TaskOutcome> {
        let mut state = self.inner.write().await;
        state
            .nodes
            .get_mut(node_location)
            .and_then(|n| n.server_mut(server_location))
            .and_then(|s| s.take_outcome(task_id))
    }

    pub async fn mark_pulse(&self, node_location: &Location, server_location: &Location) {
        let mut state = self.inner.write().await;
        if let Some(server) = state
            .nodes
            .get_mut(node_location)
            .and_then(|n| n.server_mut(server_location))
        {
            server.mark_pulse();
        }
    }

    /// Servers whose last pulse is older than `threshold`, candidates for
    /// the zombie-reclamation sweep the timer task runs periodically. Only
    /// `Initialized` servers are audited: a server still being discovered
    /// or bootstrapped hasn't pulsed yet and isn't a zombie, just new.
    pub async fn zombie_servers(&self, threshold: std::time::Duration) -> Vec<(Location, Location)> {
        let state = self.inner.read().await;
        state
            .nodes
            .values()
            .flat_map(|node| {
                node.servers
                    .values()
                    .filter(|s| s.status == crate::message::DiscoroStatus::ServerInitialized)
                    .filter(move |s| s.silent_for() >= threshold)
                    .map(move |s| (node.location, s.location))
            })
            .collect()
    }

    pub async fn node_count(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    pub async fn server_count(&self) -> usize {
        self.inner.read().await.nodes.values().map(|n| n.servers.len()).sum()
    }

    pub async fn snapshot_nodes(&self) -> Vec<Node> {
        self.inner.read().await.nodes.values().cloned().collect()
    }
}

impl Default for Fleet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
