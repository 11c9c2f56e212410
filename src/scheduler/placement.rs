use crate::fleet::Node;
use crate::message::{DiscoroStatus, Location};

/// least-loaded-node x least-loaded-server-within-it, per the two-level
/// policy: node load is `ncoros / server_count`, server load is its own
/// `coros` length. Only `Initialized` nodes/servers are eligible.
pub fn pick_any(nodes: &[Node]) -> Option<(Location, Location)> {
    let best_node = nodes
        .iter()
        .filter(|n| n.status == DiscoroStatus::NodeInitialized && !n.servers.is_empty())
        .min_by(|a, b| node_load(a).partial_cmp(&node_load(b)).unwrap())?;

    let best_server = least_loaded_server(best_node)?;
    Some((best_node.location, best_server))
}

pub fn pick_node(nodes: &[Node], host: &str) -> Option<(Location, Location)> {
    let node = nodes
        .iter()
        .find(|n| n.status == DiscoroStatus::NodeInitialized && n.location.host() == host)?;
    let server = least_loaded_server(node)?;
    Some((node.location, server))
}

pub fn pick_server(nodes: &[Node], location: &Location) -> Option<(Location, Location)> {
    for node in nodes {
        if let Some(server) = node.servers.get(location)
            && server.status == DiscoroStatus::ServerInitialized
        {
            return Some((node.location, *location));
        }
    }
    None
}

pub fn fanout_nodes(nodes: &[Node]) -> Vec<(Location, Location)> {
    nodes
        .iter()
        .filter(|n| n.status == DiscoroStatus::NodeInitialized)
        .filter_map(|n| least_loaded_server(n).map(|s| (n.location, s)))
        .collect()
}

pub fn fanout_servers(nodes: &[Node]) -> Vec<(Location, Location)> {
    nodes
        .iter()
        .filter(|n| n.status == DiscoroStatus::NodeInitialized)
        .flat_map(|n| {
            n.servers
                .values()
                .filter(|s| s.status == DiscoroStatus::ServerInitialized)
                .map(move |s| (n.location, s.location))
        })
        .collect()
}

pub fn fanout_node_servers(nodes: &[Node], host: &str) -> Vec<(Location, Location)> {
    nodes
        .iter()
        .find(|n| n.status == DiscoroStatus::NodeInitialized && n.location.host() == host)
        .map(|n| {
            n.servers
                .values()
                .filter(|s| s.status == DiscoroStatus::ServerInitialized)
                .map(|s| (n.location, s.location))
                .collect()
        })
        .unwrap_or_default()
}

fn node_load(node: &Node) -> f64 {
    if node.servers.is_empty() {
        return f64::MAX;
    }
    node.total_load() as f64 / node.servers.len() as f64
}

fn least_loaded_server(node: &Node) -> Option<Location> {
    node.servers
        .values()
        .filter(|s| s.status == DiscoroStatus::ServerInitialized)
        .min_by_key(|s| s.load())
        .map(|s| s.location)
}

#[cfg(test)]
#[path = "placement_tests.rs"]
mod tests;
