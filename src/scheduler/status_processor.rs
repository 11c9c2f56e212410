use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::discovery::PeerEvent;
use crate::fleet::{Fleet, Server};
use crate::message::{CoroInfo, DiscoroStatus, Location};
use crate::scheduler::bootstrap::bootstrap_server;
use crate::scheduler::computation::Computation;
use crate::transport::QuicTransport;

/// Lifecycle/observation event forwarded to the active computation's
/// observer. A thin local stand-in for the wire `DiscoroStatus` 2-tuple —
/// the client-facing delivery (serializing this over the transport to the
/// client's `status_observer` task) happens in the client RPC layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ObserverEvent {
    pub status: DiscoroStatus,
    pub location: Option<Location>,
    pub host: Option<String>,
    pub coro: Option<CoroInfo>,
}

impl ObserverEvent {
    fn simple(status: DiscoroStatus, location: Location) -> Self {
        Self {
            status,
            location: Some(location),
            host: None,
            coro: None,
        }
    }

    fn host(status: DiscoroStatus, host: String) -> Self {
        Self {
            status,
            location: None,
            host: Some(host),
            coro: None,
        }
    }
}

/// A discovered peer is a server's location; a node is keyed by the
/// discovering host with the port zeroed out, so several servers on one
/// machine register under the same node the way §3 describes.
pub fn node_key(addr: SocketAddr) -> Location {
    Location::new(SocketAddr::new(addr.ip(), 0))
}

pub async fn handle_peer_online(
    fleet: &Fleet,
    transport: &QuicTransport,
    local_agent_id: &str,
    computation: Option<&Computation>,
    addr: SocketAddr,
    agent_id: Option<String>,
    observer: &mpsc::Sender<ObserverEvent>,
) {
    let node_location = node_key(addr);
    let server_location = Location::new(addr);

    fleet.upsert_node(node_location, agent_id).await;
    fleet
        .add_server(node_location, Server::new(format!("server@{addr}"), server_location, node_location))
        .await
        .ok();

    let node_ignored = fleet
        .snapshot_nodes()
        .await
        .iter()
        .find(|n| n.location == node_location)
        .map(|n| n.status == DiscoroStatus::NodeIgnore)
        .unwrap_or(false);
    if node_ignored {
        return;
    }

    if computation.is_some() {
        let _ = observer
            .send(ObserverEvent::simple(DiscoroStatus::ServerDiscovered, server_location))
            .await;
    }

    if let Err(err) = bootstrap_server(
        fleet,
        transport,
        local_agent_id,
        node_location,
        server_location,
        computation,
        &[],
        observer,
    )
    .await
    {
        warn!(%server_location, error = %err, "server bootstrap failed");
        return;
    }

    if computation.is_some() {
        let _ = observer
            .send(ObserverEvent::simple(DiscoroStatus::ServerInitialized, server_location))
            .await;
    }
}

/// Returns `true` when this offline event should cascade into closing the
/// active computation (the offline location was the client's pulse
/// endpoint).
pub async fn handle_peer_offline(
    fleet: &Fleet,
    addr: SocketAddr,
    has_active_computation: bool,
    client_pulse_location: Option<Location>,
    observer: &mpsc::Sender<ObserverEvent>,
) -> bool {
    let server_location = Location::new(addr);
    let node_location = node_key(addr);

    let removed = fleet.remove_server(&node_location, &server_location).await;
    if removed.is_some() && has_active_computation {
        let _ = observer
            .send(ObserverEvent::simple(DiscoroStatus::ServerDisconnected, server_location))
            .await;
    }

    let node_now_empty = fleet
        .snapshot_nodes()
        .await
        .iter()
        .find(|n| n.location == node_location)
        .map(|n| n.servers.is_empty())
        .unwrap_or(false);

    if node_now_empty {
        fleet.remove_node(&node_location).await;
        let _ = observer
            .send(ObserverEvent::host(DiscoroStatus::NodeDisconnected, node_location.host()))
            .await;
    }

    client_pulse_location == Some(server_location)
}

pub async fn handle_peer_event(
    fleet: &Fleet,
    transport: &QuicTransport,
    local_agent_id: &str,
    computation: Option<&Computation>,
    event: PeerEvent,
    client_pulse_location: Option<Location>,
    observer: &mpsc::Sender<ObserverEvent>,
) -> bool {
    match event {
        PeerEvent::Discovered { addr, agent_id } => {
            handle_peer_online(fleet, transport, local_agent_id, computation, addr, agent_id, observer).await;
            false
        }
        PeerEvent::Lost { addr } => {
            handle_peer_offline(fleet, addr, computation.is_some(), client_pulse_location, observer).await
        }
    }
}

/// Task-termination event reported by a server agent, either an ordinary
/// completion or a synthesized one from teardown.
pub async fn handle_task_termination(
    fleet: &Fleet,
    remote: SocketAddr,
    task_id: uuid::Uuid,
    value: Option<serde_json::Value>,
    error: Option<String>,
    observer: &mpsc::Sender<ObserverEvent>,
) {
    let node_location = node_key(remote);
    let server_location = Location::new(remote);

    let was_running = fleet
        .snapshot_nodes()
        .await
        .iter()
        .find(|n| n.location == node_location)
        .and_then(|n| n.servers.get(&server_location))
        .map(|s| s.coros.contains_key(&task_id))
        .unwrap_or(false);

    fleet
        .record_task_outcome(&node_location, &server_location, task_id, value, error)
        .await;

    if was_running {
        let _ = observer
            .send(ObserverEvent {
                status: DiscoroStatus::CoroTerminated,
                location: Some(server_location),
                host: None,
                coro: Some(CoroInfo {
                    task_id,
                    name: String::new(),
                    start_time_unix_ms: crate::message::now_millis(),
                }),
            })
            .await;
    } else {
        debug!(%task_id, %server_location, "termination buffered ahead of spawn ack");
    }
}

/// Synthesizes a `CoroTerminated` observer event per outstanding task when
/// a server is torn down out from under them, per §4.9: a server closing
/// with tasks still in `coros` must still resolve those tasks for whoever
/// is watching the status stream, rather than leaving them silently
/// unresolved.
pub async fn emit_synthetic_terminations(observer: &mpsc::Sender<ObserverEvent>, server_location: Location, task_ids: &[uuid::Uuid]) {
    for &task_id in task_ids {
        let _ = observer
            .send(ObserverEvent {
                status: DiscoroStatus::CoroTerminated,
                location: Some(server_location),
                host: None,
                coro: Some(CoroInfo {
                    task_id,
                    name: String::new(),
                    start_time_unix_ms: crate::message::now_millis(),
                }),
            })
            .await;
    }
}

#[cfg(test)]
#[path = "status_processor_tests.rs"]
mod tests;
