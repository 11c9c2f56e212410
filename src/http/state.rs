use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::message::{CoroInfo, DiscoroStatus, Location, now_millis};
use crate::scheduler::status_processor::ObserverEvent;

/// One server as the dashboard has observed it. `coros_done` and
/// `last_coro` only ever grow from `CoroTerminated` events — the status
/// stream's `CoroCreated` is a client-local spawn notification and never
/// reaches this scheduler-side dashboard, so a currently running task
/// count isn't something the mirror can report faithfully.
#[derive(Debug, Clone, Serialize)]
pub struct ServerView {
    pub location: Location,
    pub status: DiscoroStatus,
    pub coros_done: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_coro: Option<CoroInfo>,
    pub update_time_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub host: String,
    pub status: DiscoroStatus,
    pub servers: HashMap<String, ServerView>,
    pub update_time_unix_ms: u64,
}

struct Mirror {
    nodes: HashMap<String, NodeView>,
    dirty: HashSet<String>,
    poll_sec: u64,
}

/// Dashboard-local view of the fleet, rebuilt from `ObserverEvent`s only.
pub struct DashboardState {
    inner: RwLock<Mirror>,
    pub document_root: PathBuf,
}

impl DashboardState {
    pub fn new(poll_sec: u64, document_root: PathBuf) -> Self {
        Self {
            inner: RwLock::new(Mirror {
                nodes: HashMap::new(),
                dirty: HashSet::new(),
                poll_sec,
            }),
            document_root,
        }
    }

    /// Folds one lifecycle event into the mirror. Node-level events
    /// (`host` set) touch only the node entry; server-level events
    /// (`location` set) touch the owning node's server map, creating the
    /// node entry on first sight the way the original dashboard does.
    pub async fn apply(&self, event: ObserverEvent) {
        let mut mirror = self.inner.write().await;
        let now = now_millis();

        if let Some(host) = event.host {
            let node = mirror.nodes.entry(host.clone()).or_insert_with(|| NodeView {
                host: host.clone(),
                status: event.status,
                servers: HashMap::new(),
                update_time_unix_ms: now,
            });
            node.status = event.status;
            node.update_time_unix_ms = now;
            mirror.dirty.insert(host);
            return;
        }

        let Some(location) = event.location else { return };
        let host = location.host();
        let node = mirror.nodes.entry(host.clone()).or_insert_with(|| NodeView {
            host: host.clone(),
            status: DiscoroStatus::NodeInitialized,
            servers: HashMap::new(),
            update_time_unix_ms: now,
        });
        node.update_time_unix_ms = now;

        let key = location.to_string();
        let server = node.servers.entry(key).or_insert_with(|| ServerView {
            location,
            status: event.status,
            coros_done: 0,
            last_coro: None,
            update_time_unix_ms: now,
        });
        if event.status.is_server() {
            server.status = event.status;
        }
        if let Some(coro) = event.coro {
            server.coros_done += 1;
            server.last_coro = Some(coro);
        }
        server.update_time_unix_ms = now;

        mirror.dirty.insert(host);
    }

    /// `GET /cluster_updates`: nodes touched since the last call, then
    /// clears the delta set.
    pub async fn updates(&self) -> Vec<NodeView> {
        let mut mirror = self.inner.write().await;
        let dirty = std::mem::take(&mut mirror.dirty);
        dirty.into_iter().filter_map(|host| mirror.nodes.get(&host).cloned()).collect()
    }

    /// `GET /cluster_status`: every node currently known.
    pub async fn status(&self) -> Vec<NodeView> {
        self.inner.read().await.nodes.values().cloned().collect()
    }

    pub async fn node_info(&self, host: &str) -> Option<NodeView> {
        self.inner.read().await.nodes.get(host).cloned()
    }

    pub async fn server_info(&self, location: Location) -> Option<ServerView> {
        let mirror = self.inner.read().await;
        mirror.nodes.get(&location.host())?.servers.get(&location.to_string()).cloned()
    }

    pub async fn poll_sec(&self) -> u64 {
        self.inner.read().await.poll_sec
    }

    pub async fn set_poll_sec(&self, timeout: i64) {
        let timeout = if timeout < 1 { 0 } else { timeout as u64 };
        self.inner.write().await.poll_sec = timeout;
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
