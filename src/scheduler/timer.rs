use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::fleet::Fleet;
use crate::message::{DiscoroStatus, Location};
use crate::scheduler::bootstrap::close_server;
use crate::scheduler::status_processor::ObserverEvent;
use crate::transport::QuicTransport;

/// Server agent heartbeat: updates `last_pulse` and logs when the
/// reported coroutine count disagrees with what the scheduler tracks
/// (the server and scheduler can briefly disagree across a spawn/complete
/// boundary; this is observational only).
pub async fn handle_heartbeat(fleet: &Fleet, server_addr: std::net::SocketAddr, reported_ncoros: u32) {
    let node_location = crate::scheduler::status_processor::node_key(server_addr);
    let server_location = Location::new(server_addr);
    fleet.mark_pulse(&node_location, &server_location).await;

    let actual = fleet
        .snapshot_nodes()
        .await
        .iter()
        .find(|n| n.location == node_location)
        .and_then(|n| n.servers.get(&server_location))
        .map(|s| s.load());

    if let Some(actual) = actual
        && actual as u32 != reported_ncoros
    {
        warn!(%server_location, reported_ncoros, actual, "server pulse reports a coros count mismatch");
    }
}

/// Outcome of processing an out-of-band `{status: ServerClosed, location}`
/// report, bubbling cascading node/computation closes up to the caller.
#[derive(Debug, Default, PartialEq)]
pub struct ServerClosedOutcome {
    pub node_closed: bool,
    pub all_nodes_closed: bool,
}

pub async fn handle_server_closed_report(
    fleet: &Fleet,
    server_addr: std::net::SocketAddr,
) -> ServerClosedOutcome {
    let node_location = crate::scheduler::status_processor::node_key(server_addr);
    let server_location = Location::new(server_addr);
    fleet
        .set_server_status(&node_location, &server_location, DiscoroStatus::ServerClosed)
        .await;

    let nodes = fleet.snapshot_nodes().await;
    let Some(node) = nodes.iter().find(|n| n.location == node_location) else {
        return ServerClosedOutcome::default();
    };

    let node_done = node
        .servers
        .values()
        .all(|s| s.status != DiscoroStatus::ServerInitialized);
    if node_done {
        fleet.set_node_status(&node_location, DiscoroStatus::NodeClosed).await;
    }

    let all_done = fleet
        .snapshot_nodes()
        .await
        .iter()
        .all(|n| n.status != DiscoroStatus::NodeInitialized);

    ServerClosedOutcome {
        node_closed: node_done,
        all_nodes_closed: all_done,
    }
}

/// Every `5 * pulse_interval`, audits every Initialized server and closes
/// any whose last pulse is older than the same threshold.
pub async fn audit_and_close_zombies(
    fleet: &Fleet,
    transport: &QuicTransport,
    local_agent_id: &str,
    pulse_interval: Duration,
    auth: &str,
    observer: &mpsc::Sender<ObserverEvent>,
) -> Vec<Location> {
    let threshold = pulse_interval * 5;
    let zombies = fleet.zombie_servers(threshold).await;
    let mut closed = Vec::new();

    for (node_location, server_location) in zombies {
        info!(%server_location, "server pulse is stale, declaring zombie");
        if close_server(fleet, transport, local_agent_id, &node_location, &server_location, auth, observer)
            .await
            .is_ok()
        {
            closed.push(server_location);
        }
    }
    closed
}

/// The client is declared dead once its last acknowledged pulse is older
/// than `5 * pulse_interval`.
pub fn client_is_dead(last_pulse_ack: Instant, pulse_interval: Duration) -> bool {
    last_pulse_ack.elapsed() > pulse_interval * 5
}

#[cfg(test)]
#[path = "timer_tests.rs"]
mod tests;
