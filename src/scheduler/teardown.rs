use tokio::sync::mpsc;
use tracing::info;

use crate::fleet::Fleet;
use crate::message::{DiscoroStatus, Location};
use crate::scheduler::bootstrap::close_server;
use crate::scheduler::status_processor::ObserverEvent;
use crate::transport::QuicTransport;

/// Closes every server on a node and marks the node closed, per §4.9.
/// Individual server-close failures are logged and otherwise ignored: a
/// node going away mid-teardown should not block the rest of the sweep.
pub async fn close_node(
    fleet: &Fleet,
    transport: &QuicTransport,
    local_agent_id: &str,
    node_location: &Location,
    auth: &str,
    observer: &mpsc::Sender<ObserverEvent>,
) {
    let server_locations: Vec<Location> = fleet
        .snapshot_nodes()
        .await
        .iter()
        .find(|n| &n.location == node_location)
        .map(|n| n.servers.keys().copied().collect())
        .unwrap_or_default();

    for server_location in server_locations {
        if let Err(err) = close_server(fleet, transport, local_agent_id, node_location, &server_location, auth, observer).await {
            info!(%server_location, error = %err, "error while closing server during node teardown");
        }
    }

    fleet.set_node_status(node_location, DiscoroStatus::NodeClosed).await;
}

/// Tears down the whole fleet for the active computation and removes its
/// staged-files directory. The scheduler main loop clears its own
/// `cur_*` state and returns to `Idle` after this returns.
pub async fn close_computation(
    fleet: &Fleet,
    transport: &QuicTransport,
    local_agent_id: &str,
    auth: &str,
    dest_dir: &std::path::Path,
    observer: &mpsc::Sender<ObserverEvent>,
) {
    let node_locations: Vec<Location> = fleet.snapshot_nodes().await.iter().map(|n| n.location).collect();

    for node_location in node_locations {
        close_node(fleet, transport, local_agent_id, &node_location, auth, observer).await;
    }

    if dest_dir.exists()
        && let Err(err) = tokio::fs::remove_dir_all(dest_dir).await
    {
        info!(path = %dest_dir.display(), error = %err, "failed to remove computation staging directory");
    }

    info!(auth, "computation closed");
}

#[cfg(test)]
#[path = "teardown_tests.rs"]
mod tests;
