use std::collections::HashMap;

use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::fleet::Fleet;
use crate::message::{AckPayload, Envelope, Location, MessageKind, TerminatePayload};
use crate::transport::QuicTransport;

/// Dashboard-initiated task cancellation (`POST /terminate_coros`).
/// Groups the requested task ids by the server currently hosting them and
/// sends one `Terminate` envelope per server. An id not hosted on any known
/// server is treated as already gone — it counts as terminated rather than
/// being silently dropped, matching the original's `terminate()==0` meaning
/// "no longer running".
pub async fn terminate_coros(
    fleet: &Fleet,
    transport: &QuicTransport,
    local_agent_id: &str,
    computation_id: Uuid,
    task_ids: &[Uuid],
) -> Vec<Uuid> {
    let mut wanted: std::collections::HashSet<Uuid> = task_ids.iter().copied().collect();
    let mut by_server: HashMap<Location, Vec<Uuid>> = HashMap::new();

    for node in fleet.snapshot_nodes().await {
        for server in node.servers.values() {
            let hosted: Vec<Uuid> = server.coros.keys().copied().filter(|id| wanted.contains(id)).collect();
            if !hosted.is_empty() {
                by_server.entry(server.location).or_default().extend(hosted);
            }
        }
    }

    let mut terminated: Vec<Uuid> = Vec::new();
    for ids in by_server.values() {
        for id in ids {
            wanted.remove(id);
        }
    }
    terminated.extend(wanted);
    for (server_location, ids) in by_server {
        let envelope = Envelope::new(
            local_agent_id.to_string(),
            "node.unknown".to_string(),
            MessageKind::Terminate,
            json!(TerminatePayload {
                computation_id,
                task_ids: ids.clone(),
            }),
        );

        match transport.send(server_location.addr, envelope).await {
            Ok(Some(reply)) => match reply.payload_as::<AckPayload>() {
                Ok(ack) if ack.accepted => terminated.extend(ids),
                Ok(_) => warn!(%server_location, "server rejected terminate request"),
                Err(err) => warn!(%server_location, error = %err, "malformed terminate ack"),
            },
            Ok(None) => warn!(%server_location, "terminate expected a response"),
            Err(err) => warn!(%server_location, error = %err, "failed to deliver terminate request"),
        }
    }

    terminated
}

#[cfg(test)]
#[path = "admin_tests.rs"]
mod tests;
