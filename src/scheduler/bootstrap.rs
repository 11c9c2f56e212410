use std::net::SocketAddr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use sha2::Digest;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::DiscoroError;
use crate::fleet::Fleet;
use crate::message::{
    AckPayload, CloseServerPayload, DiscoroStatus, Envelope, FileTransferPayload, Location,
    MessageKind, SetupPayload,
};
use crate::scheduler::computation::Computation;
use crate::scheduler::status_processor::{self, ObserverEvent};
use crate::transport::QuicTransport;

const FILE_CHUNK_SIZE: usize = 32 * 1024;

/// Brings a newly-discovered server to `Initialized`, per the bootstrap
/// protocol: idempotent, provisional-`Ignore` to prevent duplicate runs,
/// setup handshake, file staging, then promotion (and promoting the
/// parent node alongside the server).
pub async fn bootstrap_server(
    fleet: &Fleet,
    transport: &QuicTransport,
    local_agent_id: &str,
    node_location: Location,
    server_location: Location,
    computation: Option<&Computation>,
    files: &[(String, Vec<u8>)],
    observer: &mpsc::Sender<ObserverEvent>,
) -> Result<(), DiscoroError> {
    {
        let nodes = fleet.snapshot_nodes().await;
        if let Some(node) = nodes.iter().find(|n| n.location == node_location)
            && let Some(server) = node.servers.get(&server_location)
            && matches!(
                server.status,
                DiscoroStatus::ServerInitialized | DiscoroStatus::ServerIgnore
            )
        {
            return Ok(());
        }
    }

    fleet
        .set_server_status(&node_location, &server_location, DiscoroStatus::ServerIgnore)
        .await;

    let Some(computation) = computation else {
        fleet
            .set_server_status(&node_location, &server_location, DiscoroStatus::ServerDiscovered)
            .await;
        return Ok(());
    };

    info!(%server_location, "bootstrapping server for active computation");

    let setup = Envelope::new(
        local_agent_id.to_string(),
        "node.unknown".to_string(),
        MessageKind::Setup,
        json!(SetupPayload {
            computation_id: parse_auth(&computation.auth),
            auth: computation.auth.clone(),
            dest_path: computation.dest_dir.to_string_lossy().to_string(),
            xfer_files: computation.xfer_files.clone(),
        }),
    );

    let reply = transport
        .send(server_location.addr, setup)
        .await
        .map_err(|_| DiscoroError::TransportTimeout {
            addr: server_location.addr,
            elapsed_ms: 0,
        })?
        .ok_or_else(|| DiscoroError::Protocol {
            addr: server_location.addr,
            message: "setup expected a response".to_string(),
        })?;

    if reply.kind != MessageKind::Ack {
        fleet.remove_server(&node_location, &server_location).await;
        return Err(DiscoroError::Protocol {
            addr: server_location.addr,
            message: format!("setup rejected: {}", reply.kind),
        });
    }

    for (rel_path, bytes) in files {
        if let Err(err) = send_file(
            transport,
            server_location.addr,
            local_agent_id,
            parse_auth(&computation.auth),
            rel_path,
            bytes,
        )
        .await
        {
            warn!(%server_location, rel_path, error = %err, "file transfer failed, closing server");
            let _ = close_server(
                fleet,
                transport,
                local_agent_id,
                &node_location,
                &server_location,
                &computation.auth,
                observer,
            )
            .await;
            return Err(DiscoroError::FileTransfer {
                file: rel_path.clone(),
                message: err.to_string(),
            });
        }
    }

    fleet
        .set_server_status(&node_location, &server_location, DiscoroStatus::ServerInitialized)
        .await;
    fleet.mark_pulse(&node_location, &server_location).await;

    let nodes = fleet.snapshot_nodes().await;
    if let Some(node) = nodes.iter().find(|n| n.location == node_location)
        && node.status != DiscoroStatus::NodeInitialized
    {
        fleet.set_node_status(&node_location, DiscoroStatus::NodeInitialized).await;
    }

    Ok(())
}

async fn send_file(
    transport: &QuicTransport,
    addr: SocketAddr,
    local_agent_id: &str,
    computation_id: uuid::Uuid,
    rel_path: &str,
    bytes: &[u8],
) -> anyhow::Result<()> {
    let chunks: Vec<&[u8]> = if bytes.is_empty() {
        vec![&[]]
    } else {
        bytes.chunks(FILE_CHUNK_SIZE).collect()
    };
    let total = chunks.len();

    for (seq, chunk) in chunks.into_iter().enumerate() {
        let envelope = Envelope::new(
            local_agent_id.to_string(),
            "node.unknown".to_string(),
            MessageKind::FileTransfer,
            json!(FileTransferPayload {
                computation_id,
                rel_path: rel_path.to_string(),
                seq: seq as u32,
                done: seq + 1 == total,
                data_base64: STANDARD.encode(chunk),
            }),
        );

        let reply = transport
            .send(addr, envelope)
            .await?
            .ok_or_else(|| anyhow::anyhow!("file_transfer expected a response"))?;
        let ack: AckPayload = reply.payload_as()?;
        if !ack.accepted {
            anyhow::bail!("server rejected chunk {seq} of {rel_path}");
        }
    }
    Ok(())
}

pub async fn close_server(
    fleet: &Fleet,
    transport: &QuicTransport,
    local_agent_id: &str,
    node_location: &Location,
    server_location: &Location,
    auth: &str,
    observer: &mpsc::Sender<ObserverEvent>,
) -> Result<Vec<uuid::Uuid>, DiscoroError> {
    let outstanding: Vec<uuid::Uuid> = {
        let nodes = fleet.snapshot_nodes().await;
        nodes
            .iter()
            .find(|n| &n.location == node_location)
            .and_then(|n| n.servers.get(server_location))
            .map(|s| s.coros.keys().copied().collect())
            .unwrap_or_default()
    };

    let envelope = Envelope::new(
        local_agent_id.to_string(),
        "node.unknown".to_string(),
        MessageKind::CloseServer,
        json!(CloseServerPayload {
            computation_id: parse_auth(auth),
        }),
    );
    let _ = tokio::time::timeout(Duration::from_secs(10), transport.send(server_location.addr, envelope)).await;

    fleet.remove_server(node_location, server_location).await;
    status_processor::emit_synthetic_terminations(observer, *server_location, &outstanding).await;
    Ok(outstanding)
}

pub(crate) fn parse_auth(auth: &str) -> uuid::Uuid {
    uuid::Uuid::parse_str(auth).unwrap_or_else(|_| {
        let mut bytes = [0u8; 16];
        let digest = sha2::Sha256::digest(auth.as_bytes());
        bytes.copy_from_slice(&digest[..16]);
        uuid::Uuid::from_bytes(bytes)
    })
}

#[cfg(test)]
#[path = "bootstrap_tests.rs"]
mod tests;
