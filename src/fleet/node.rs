use std::collections::HashMap;
use std::time::Instant;

use crate::fleet::server::Server;
use crate::message::{DiscoroStatus, Location};

/// A discoro node: one machine running a `discoro_scheduler`-managed
/// fleet of coroutine servers. Mirrors `__Node` in the original scheduler.
#[derive(Debug, Clone)]
pub struct Node {
    pub location: Location,
    pub agent_id: Option<String>,
    pub status: DiscoroStatus,
    pub servers: HashMap<Location, Server>,
    pub discovered_at: Instant,
}

impl Node {
    pub fn new(location: Location, agent_id: Option<String>) -> Self {
        Self {
            location,
            agent_id,
            status: DiscoroStatus::NodeDiscovered,
            servers: HashMap::new(),
            discovered_at: Instant::now(),
        }
    }

    pub fn add_server(&mut self, server: Server) {
        self.servers.insert(server.location, server);
    }

    pub fn remove_server(&mut self, location: &Location) -> Option<Server> {
        self.servers.remove(location)
    }

    pub fn server_mut(&mut self, location: &Location) -> Option<&mut Server> {
        self.servers.get_mut(location)
    }

    pub fn total_load(&self) -> usize {
        self.servers.values().map(Server::load).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.servers.values().all(|s| s.coros.is_empty())
    }
}
