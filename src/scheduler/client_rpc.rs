use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fleet::{Fleet, RemoteTask};
use crate::message::{
    AckPayload, AwaitPayload, CloseComputationPayload, Envelope, ErrorCode, ErrorPayload,
    FileTransferPayload, Location, MessageKind, NodesQueryPayload, NodesQueryResponsePayload,
    RunAtPayload, RunEachPayload, RunPayload, SchedulePayload, ServersQueryPayload,
    ServersQueryResponsePayload,
};
use crate::scheduler::computation::Computation;
use crate::scheduler::placement;
use crate::transport::QuicTransport;

/// Outcome of processing one client request: the reply to send back on the
/// request's bidi stream, plus whatever the scheduler main loop needs to do
/// to its own state as a result.
pub struct RpcOutcome {
    pub reply: Envelope,
    pub adopt: Option<Computation>,
    pub close: bool,
}

impl RpcOutcome {
    fn reply_only(reply: Envelope) -> Self {
        Self {
            reply,
            adopt: None,
            close: false,
        }
    }
}

/// Constant-time shared-secret check, to avoid leaking match length through
/// branch timing on a value an attacker can resubmit freely.
fn secret_matches(given: Option<&str>, expected: &str) -> bool {
    use subtle::ConstantTimeEq;
    match given {
        Some(given) => given.len() == expected.len() && given.as_bytes().ct_eq(expected.as_bytes()).into(),
        None => false,
    }
}

fn error_reply(request: &Envelope, local_agent_id: &str, code: ErrorCode, message: impl Into<String>) -> Envelope {
    Envelope::response_to(
        request,
        local_agent_id.to_string(),
        MessageKind::Error,
        json!(ErrorPayload {
            code,
            message: message.into(),
            retryable: false,
        }),
    )
}

fn check_auth(active: Option<&Computation>, auth: &str) -> Result<(), ErrorPayload> {
    match active {
        Some(computation) if computation.auth == auth => Ok(()),
        Some(_) => Err(ErrorPayload {
            code: ErrorCode::NotAuthorized,
            message: "auth token does not match the active computation".to_string(),
            retryable: false,
        }),
        None => Err(ErrorPayload {
            code: ErrorCode::UnknownComputation,
            message: "no computation is active".to_string(),
            retryable: false,
        }),
    }
}

/// Dispatches one client-originated envelope. `active` is the scheduler's
/// current computation, if any; `staging_root` is where `schedule` stages
/// new computations' transfer files.
#[allow(clippy::too_many_arguments)]
pub async fn handle(
    fleet: &Fleet,
    transport: &QuicTransport,
    local_agent_id: &str,
    active: Option<&Computation>,
    zombie_period: Option<Duration>,
    scheduler_secret: Option<&str>,
    max_file_size: Option<u64>,
    staging_root: &Path,
    remote: SocketAddr,
    request: &Envelope,
) -> RpcOutcome {
    match request.kind {
        MessageKind::Schedule => {
            handle_schedule(local_agent_id, active, zombie_period, scheduler_secret, staging_root, remote, request)
        }
        MessageKind::Await => handle_await(local_agent_id, active, request),
        MessageKind::RunAt => handle_run_at(fleet, transport, local_agent_id, active, request).await,
        MessageKind::RunEach => handle_run_each(fleet, transport, local_agent_id, active, request).await,
        MessageKind::NodesQuery => handle_nodes_query(fleet, local_agent_id, active, request).await,
        MessageKind::ServersQuery => handle_servers_query(fleet, local_agent_id, active, request).await,
        MessageKind::CloseComputation => handle_close_computation(local_agent_id, active, request),
        MessageKind::FileTransfer => handle_file_transfer(local_agent_id, active, max_file_size, request).await,
        other => RpcOutcome::reply_only(error_reply(
            request,
            local_agent_id,
            ErrorCode::UnknownKind,
            format!("client RPC does not accept '{other}'"),
        )),
    }
}

fn handle_schedule(
    local_agent_id: &str,
    active: Option<&Computation>,
    zombie_period: Option<Duration>,
    scheduler_secret: Option<&str>,
    staging_root: &Path,
    remote: SocketAddr,
    request: &Envelope,
) -> RpcOutcome {
    if active.is_some() {
        return RpcOutcome::reply_only(error_reply(
            request,
            local_agent_id,
            ErrorCode::Internal,
            "scheduler already has an active computation",
        ));
    }

    let payload: SchedulePayload = match request.payload_as() {
        Ok(p) => p,
        Err(err) => return RpcOutcome::reply_only(invalid_envelope(request, local_agent_id, err)),
    };

    if let Some(secret) = scheduler_secret
        && !secret_matches(payload.client_secret.as_deref(), secret)
    {
        return RpcOutcome::reply_only(error_reply(
            request,
            local_agent_id,
            ErrorCode::NotAuthorized,
            crate::error::DiscoroError::NotAuthorized.to_string(),
        ));
    }

    let mut computation = match Computation::new(
        payload.name,
        payload.xfer_files,
        payload.depends,
        payload.nodes,
        payload.pulse_interval,
        payload.client_secret,
        staging_root,
    ) {
        Ok(c) => c,
        Err(err) => {
            return RpcOutcome::reply_only(error_reply(request, local_agent_id, ErrorCode::Internal, err.to_string()));
        }
    };

    if let Err(err) = computation.apply_zombie_period(zombie_period) {
        return RpcOutcome::reply_only(error_reply(request, local_agent_id, ErrorCode::Internal, err.to_string()));
    }

    computation.client_pulse_location = Some(Location::new(remote));

    let reply = Envelope::response_to(
        request,
        local_agent_id.to_string(),
        MessageKind::Ack,
        json!(AckPayload {
            accepted: true,
            auth: Some(computation.auth.clone()),
            value: None,
        }),
    );

    RpcOutcome {
        reply,
        adopt: Some(computation),
        close: false,
    }
}

fn handle_await(local_agent_id: &str, active: Option<&Computation>, request: &Envelope) -> RpcOutcome {
    let payload: AwaitPayload = match request.payload_as() {
        Ok(p) => p,
        Err(err) => return RpcOutcome::reply_only(invalid_envelope(request, local_agent_id, err)),
    };

    if let Err(err) = check_auth(active, &payload.auth) {
        return RpcOutcome::reply_only(Envelope::response_to(
            request,
            local_agent_id.to_string(),
            MessageKind::Error,
            json!(err),
        ));
    }

    RpcOutcome::reply_only(Envelope::response_to(
        request,
        local_agent_id.to_string(),
        MessageKind::Ack,
        json!(AckPayload {
            accepted: true,
            auth: None,
            value: None,
        }),
    ))
}

async fn handle_run_at(
    fleet: &Fleet,
    transport: &QuicTransport,
    local_agent_id: &str,
    active: Option<&Computation>,
    request: &Envelope,
) -> RpcOutcome {
    let payload: RunAtPayload = match request.payload_as() {
        Ok(p) => p,
        Err(err) => return RpcOutcome::reply_only(invalid_envelope(request, local_agent_id, err)),
    };

    let Some(computation) = active else {
        return RpcOutcome::reply_only(unknown_computation(request, local_agent_id));
    };
    if let Err(err) = check_auth(Some(computation), &payload.auth) {
        return RpcOutcome::reply_only(Envelope::response_to(
            request,
            local_agent_id.to_string(),
            MessageKind::Error,
            json!(err),
        ));
    }

    let nodes = fleet.snapshot_nodes().await;
    let target = match (&payload.location, &payload.host) {
        (Some(location), _) => placement::pick_server(&nodes, location),
        (None, Some(host)) => placement::pick_node(&nodes, host),
        (None, None) => placement::pick_any(&nodes),
    };

    let Some((node_location, server_location)) = target else {
        return RpcOutcome::reply_only(error_reply(
            request,
            local_agent_id,
            ErrorCode::NoServerAvailable,
            "no initialized server available to run this task",
        ));
    };

    match dispatch_run(fleet, transport, local_agent_id, computation, node_location, server_location, &payload.name, payload.args, payload.kwargs)
        .await
    {
        Ok(task_id) => RpcOutcome::reply_only(Envelope::response_to(
            request,
            local_agent_id.to_string(),
            MessageKind::Ack,
            json!(AckPayload {
                accepted: true,
                auth: None,
                value: Some(json!({"task_id": task_id, "location": server_location})),
            }),
        )),
        Err(message) => RpcOutcome::reply_only(error_reply(request, local_agent_id, ErrorCode::Internal, message)),
    }
}

async fn handle_run_each(
    fleet: &Fleet,
    transport: &QuicTransport,
    local_agent_id: &str,
    active: Option<&Computation>,
    request: &Envelope,
) -> RpcOutcome {
    let payload: RunEachPayload = match request.payload_as() {
        Ok(p) => p,
        Err(err) => return RpcOutcome::reply_only(invalid_envelope(request, local_agent_id, err)),
    };

    let Some(computation) = active else {
        return RpcOutcome::reply_only(unknown_computation(request, local_agent_id));
    };
    if let Err(err) = check_auth(Some(computation), &payload.auth) {
        return RpcOutcome::reply_only(Envelope::response_to(
            request,
            local_agent_id.to_string(),
            MessageKind::Error,
            json!(err),
        ));
    }

    let nodes = fleet.snapshot_nodes().await;
    let targets = if payload.one_per_node {
        placement::fanout_nodes(&nodes)
    } else {
        placement::fanout_servers(&nodes)
    };

    let mut dispatched = Vec::new();
    for (node_location, server_location) in targets {
        match dispatch_run(
            fleet,
            transport,
            local_agent_id,
            computation,
            node_location,
            server_location,
            &payload.name,
            payload.args.clone(),
            payload.kwargs.clone(),
        )
        .await
        {
            Ok(task_id) => dispatched.push(json!({"task_id": task_id, "location": server_location})),
            Err(message) => warn!(%server_location, error = %message, "run_each dispatch failed for this server"),
        }
    }

    RpcOutcome::reply_only(Envelope::response_to(
        request,
        local_agent_id.to_string(),
        MessageKind::Ack,
        json!(AckPayload {
            accepted: true,
            auth: None,
            value: Some(json!(dispatched)),
        }),
    ))
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_run(
    fleet: &Fleet,
    transport: &QuicTransport,
    local_agent_id: &str,
    computation: &Computation,
    node_location: Location,
    server_location: Location,
    name: &str,
    args: serde_json::Value,
    kwargs: serde_json::Value,
) -> Result<Uuid, String> {
    let task_id = Uuid::new_v4();
    let run_envelope = Envelope::new(
        local_agent_id.to_string(),
        "node.unknown".to_string(),
        MessageKind::Run,
        json!(RunPayload {
            task_id,
            computation_id: crate::scheduler::bootstrap::parse_auth(&computation.auth),
            name: name.to_string(),
            args,
            kwargs,
        }),
    );

    let reply = transport
        .send(server_location.addr, run_envelope)
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "run expected a response".to_string())?;

    let ack: AckPayload = reply.payload_as().map_err(|err| err.to_string())?;
    if !ack.accepted {
        return Err(format!("server at {server_location} rejected the run request"));
    }

    // The server can report this task's termination (an unsolicited
    // `Result`) before we get here, racing ahead of our own spawn ack; when
    // that happens the outcome is sitting in the server's done-buffer
    // rather than a live `coros` entry. Per §8's race law, the spawn must
    // yield to that termination rather than placing a task that already
    // finished.
    if fleet.take_buffered_outcome(&node_location, &server_location, task_id).await.is_some() {
        debug!(%task_id, %server_location, "spawn raced an already-buffered termination, not placing task");
    } else {
        fleet
            .place_task(&node_location, &server_location, RemoteTask::new(task_id, name, json!(null), json!(null)))
            .await
            .map_err(|err| err.to_string())?;
    }

    Ok(task_id)
}

async fn handle_nodes_query(
    fleet: &Fleet,
    local_agent_id: &str,
    active: Option<&Computation>,
    request: &Envelope,
) -> RpcOutcome {
    let payload: NodesQueryPayload = match request.payload_as() {
        Ok(p) => p,
        Err(err) => return RpcOutcome::reply_only(invalid_envelope(request, local_agent_id, err)),
    };
    if let Err(err) = check_auth(active, &payload.auth) {
        return RpcOutcome::reply_only(Envelope::response_to(
            request,
            local_agent_id.to_string(),
            MessageKind::Error,
            json!(err),
        ));
    }

    let nodes = fleet
        .snapshot_nodes()
        .await
        .into_iter()
        .filter(|n| n.status == crate::message::DiscoroStatus::NodeInitialized)
        .map(|n| n.location)
        .collect();

    RpcOutcome::reply_only(Envelope::response_to(
        request,
        local_agent_id.to_string(),
        MessageKind::Result,
        json!(NodesQueryResponsePayload { nodes }),
    ))
}

async fn handle_servers_query(
    fleet: &Fleet,
    local_agent_id: &str,
    active: Option<&Computation>,
    request: &Envelope,
) -> RpcOutcome {
    let payload: ServersQueryPayload = match request.payload_as() {
        Ok(p) => p,
        Err(err) => return RpcOutcome::reply_only(invalid_envelope(request, local_agent_id, err)),
    };
    if let Err(err) = check_auth(active, &payload.auth) {
        return RpcOutcome::reply_only(Envelope::response_to(
            request,
            local_agent_id.to_string(),
            MessageKind::Error,
            json!(err),
        ));
    }

    let mut servers: std::collections::HashMap<String, Vec<Location>> = std::collections::HashMap::new();
    for node in fleet.snapshot_nodes().await {
        if let Some(ref host) = payload.node
            && node.location.host() != *host
        {
            continue;
        }
        for server in node.servers.values() {
            servers.entry(server.name.clone()).or_default().push(server.location);
        }
    }

    RpcOutcome::reply_only(Envelope::response_to(
        request,
        local_agent_id.to_string(),
        MessageKind::Result,
        json!(ServersQueryResponsePayload { servers }),
    ))
}

fn handle_close_computation(local_agent_id: &str, active: Option<&Computation>, request: &Envelope) -> RpcOutcome {
    let payload: CloseComputationPayload = match request.payload_as() {
        Ok(p) => p,
        Err(err) => return RpcOutcome::reply_only(invalid_envelope(request, local_agent_id, err)),
    };
    if let Err(err) = check_auth(active, &payload.auth) {
        return RpcOutcome::reply_only(Envelope::response_to(
            request,
            local_agent_id.to_string(),
            MessageKind::Error,
            json!(err),
        ));
    }

    RpcOutcome {
        reply: Envelope::response_to(
            request,
            local_agent_id.to_string(),
            MessageKind::Ack,
            json!(AckPayload {
                accepted: true,
                auth: None,
                value: None,
            }),
        ),
        adopt: None,
        close: true,
    }
}

/// Receives one of the client's staged transfer files. Unlike the
/// scheduler-to-server leg (`bootstrap::send_file`), the response handler
/// that answers this request is stateless across calls, so multi-chunk
/// reassembly isn't available here: the whole file must arrive in a single
/// envelope (`seq == 0 && done`). Fine for the small data files a
/// computation typically ships; staged files larger than one message
/// should be fetched by the remote task itself instead.
async fn handle_file_transfer(
    local_agent_id: &str,
    active: Option<&Computation>,
    max_file_size: Option<u64>,
    request: &Envelope,
) -> RpcOutcome {
    let payload: FileTransferPayload = match request.payload_as() {
        Ok(p) => p,
        Err(err) => return RpcOutcome::reply_only(invalid_envelope(request, local_agent_id, err)),
    };

    let Some(computation) = active else {
        return RpcOutcome::reply_only(unknown_computation(request, local_agent_id));
    };
    if crate::scheduler::bootstrap::parse_auth(&computation.auth) != payload.computation_id {
        return RpcOutcome::reply_only(error_reply(
            request,
            local_agent_id,
            ErrorCode::NotAuthorized,
            "computation_id does not match the active computation",
        ));
    }
    if payload.seq != 0 || !payload.done {
        return RpcOutcome::reply_only(error_reply(
            request,
            local_agent_id,
            ErrorCode::Internal,
            "client uploads must fit in a single file_transfer chunk",
        ));
    }

    let bytes = match STANDARD.decode(&payload.data_base64) {
        Ok(b) => b,
        Err(err) => return RpcOutcome::reply_only(error_reply(request, local_agent_id, ErrorCode::InvalidEnvelope, err.to_string())),
    };

    if let Some(limit) = max_file_size
        && bytes.len() as u64 > limit
    {
        return RpcOutcome::reply_only(error_reply(
            request,
            local_agent_id,
            ErrorCode::Internal,
            format!("upload of {} bytes exceeds max_file_size of {limit}", bytes.len()),
        ));
    }

    let dest = computation.dest_dir.join(&payload.rel_path);
    if let Some(parent) = dest.parent()
        && let Err(err) = tokio::fs::create_dir_all(parent).await
    {
        return RpcOutcome::reply_only(error_reply(request, local_agent_id, ErrorCode::Internal, err.to_string()));
    }
    if let Err(err) = tokio::fs::write(&dest, &bytes).await {
        return RpcOutcome::reply_only(error_reply(request, local_agent_id, ErrorCode::Internal, err.to_string()));
    }

    RpcOutcome::reply_only(Envelope::response_to(
        request,
        local_agent_id.to_string(),
        MessageKind::Ack,
        json!(AckPayload {
            accepted: true,
            auth: None,
            value: None,
        }),
    ))
}

fn invalid_envelope(request: &Envelope, local_agent_id: &str, err: anyhow::Error) -> Envelope {
    error_reply(request, local_agent_id, ErrorCode::InvalidEnvelope, err.to_string())
}

fn unknown_computation(request: &Envelope, local_agent_id: &str) -> Envelope {
    error_reply(request, local_agent_id, ErrorCode::UnknownComputation, "no computation is active")
}

#[cfg(test)]
#[path = "client_rpc_tests.rs"]
mod tests;
