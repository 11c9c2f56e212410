//! Reference server agent: the remote worker process a scheduler
//! bootstraps computations onto. Implements the wire side of
//! `scheduler::bootstrap` and `scheduler::admin` — `Setup`, `FileTransfer`,
//! `Run`, `CloseServer`, `Terminate` — plus the periodic `Pulse` heartbeat
//! and fire-and-forget `Result`/`StatusUpdate` reports back to whichever
//! scheduler most recently set it up.
//!
//! Task execution itself is simulated: the message-passing/actor runtime
//! that would host real user code is an external collaborator per the
//! system overview, so `Run` just starts a short timer and reports back a
//! synthetic success.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::Parser;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use discoro::config::DiscoroHome;
use discoro::identity::Identity;
use discoro::message::{
    AckPayload, CloseServerPayload, DiscoroStatus, Envelope, FileTransferPayload, MessageKind,
    PulsePayload, ResultPayload, RunPayload, SetupPayload, StatusUpdatePayload, TerminatePayload,
};
use discoro::transport::QuicTransport;

/// The coroutine-server process a scheduler dispatches tasks to.
#[derive(Parser)]
#[command(author, version, about = "discoro reference server agent")]
struct Cli {
    /// Address to bind the QUIC listener on.
    #[arg(short = 'i', long, default_value = "0.0.0.0")]
    ip_addr: String,

    /// Port to listen on; 0 picks an ephemeral port.
    #[arg(short = 'u', long, default_value_t = 0)]
    udp_port: u16,

    /// Human-readable server name reported in Pulse/StatusUpdate.
    #[arg(short = 'n', long, default_value = "server")]
    name: String,

    /// Root directory for staged computation files and this process's
    /// identity material.
    #[arg(long)]
    dest_path: Option<PathBuf>,

    #[arg(short = 'd', long)]
    debug: bool,
}

/// The one computation this server is currently staged for, if any.
struct ActiveSetup {
    computation_id: Uuid,
    scheduler_addr: SocketAddr,
    dest_path: PathBuf,
}

struct ServerState {
    name: String,
    active: Mutex<Option<ActiveSetup>>,
    coros: Mutex<HashMap<Uuid, String>>,
    uploads: Mutex<HashMap<String, Vec<u8>>>,
    transport: std::sync::OnceLock<QuicTransport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let dest_path = cli.dest_path.unwrap_or_else(|| PathBuf::from("."));
    let home = DiscoroHome::from_root(dest_path.join(".discoro"));
    let identity = Identity::load_or_generate(&home).context("loading server identity")?;

    let state = Arc::new(ServerState {
        name: cli.name.clone(),
        active: Mutex::new(None),
        coros: Mutex::new(HashMap::new()),
        uploads: Mutex::new(HashMap::new()),
        transport: std::sync::OnceLock::new(),
    });

    let cancel = CancellationToken::new();
    let handler_state = state.clone();
    let response_handler: discoro::transport::ResponseHandlerFn = Arc::new(move |remote, envelope| {
        let state = handler_state.clone();
        Box::pin(async move { Some(handle_request(&state, remote, &envelope).await) }) as std::pin::Pin<Box<dyn std::future::Future<Output = Option<Envelope>> + Send>>
    });

    let bind_addr: SocketAddr = format!("{}:{}", cli.ip_addr, cli.udp_port).parse().context("parsing bind address")?;
    let transport = QuicTransport::bind_cancellable(
        bind_addr,
        &identity,
        cancel.clone(),
        256,
        Duration::from_secs(15),
        Duration::from_secs(60),
        Some(response_handler),
        Duration::from_secs(10),
    )
    .await
    .context("binding QUIC listener")?;
    state.transport.set(transport.clone()).ok();

    info!(agent_id = identity.agent_id(), addr = %transport.local_addr()?, "discoro server agent listening");

    let pulse_transport = transport.clone();
    let pulse_state = state.clone();
    let pulse_cancel = cancel.clone();
    tokio::spawn(async move { pulse_loop(pulse_transport, pulse_state, pulse_cancel).await });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    cancel.cancel();
    transport.close_all().await;
    Ok(())
}

async fn pulse_loop(transport: QuicTransport, state: Arc<ServerState>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let Some(scheduler_addr) = state.active.lock().await.as_ref().map(|a| a.scheduler_addr) else { continue };
                let ncoros = state.coros.lock().await.len() as u32;
                let Ok(local_addr) = transport.local_addr() else { continue };
                let envelope = Envelope::new(
                    transport.local_agent_id().to_string(),
                    "node.scheduler".to_string(),
                    MessageKind::Pulse,
                    json!(PulsePayload { location: discoro::message::Location::new(local_addr), ncoros }),
                );
                if let Err(err) = transport.send(scheduler_addr, envelope).await {
                    warn!(error = %err, "failed to send pulse");
                }
            }
        }
    }
}

async fn handle_request(state: &Arc<ServerState>, remote: SocketAddr, request: &Envelope) -> Envelope {
    match request.kind {
        MessageKind::Setup => handle_setup(state, remote, request).await,
        MessageKind::FileTransfer => handle_file_transfer(state, request).await,
        MessageKind::Run => handle_run(state, request).await,
        MessageKind::CloseServer => handle_close_server(state, request).await,
        MessageKind::Terminate => handle_terminate(state, request).await,
        other => reject(request, format!("server agent does not accept '{other}'")),
    }
}

async fn handle_setup(state: &Arc<ServerState>, remote: SocketAddr, request: &Envelope) -> Envelope {
    let payload: SetupPayload = match request.payload_as() {
        Ok(p) => p,
        Err(err) => return reject(request, err.to_string()),
    };

    let dest_path = PathBuf::from(&payload.dest_path);
    if let Err(err) = std::fs::create_dir_all(&dest_path) {
        return reject(request, format!("failed to create staging dir: {err}"));
    }

    *state.active.lock().await = Some(ActiveSetup {
        computation_id: payload.computation_id,
        scheduler_addr: remote,
        dest_path,
    });
    state.uploads.lock().await.clear();

    info!(name = %state.name, computation_id = %payload.computation_id, "staged for computation");
    ack(request)
}

async fn handle_file_transfer(state: &Arc<ServerState>, request: &Envelope) -> Envelope {
    let payload: FileTransferPayload = match request.payload_as() {
        Ok(p) => p,
        Err(err) => return reject(request, err.to_string()),
    };

    let active = state.active.lock().await;
    let Some(active) = active.as_ref() else {
        return reject(request, "no active computation staged".to_string());
    };
    if active.computation_id != payload.computation_id {
        return reject(request, "computation_id does not match the staged computation".to_string());
    }

    let bytes = match STANDARD.decode(&payload.data_base64) {
        Ok(b) => b,
        Err(err) => return reject(request, err.to_string()),
    };

    let mut uploads = state.uploads.lock().await;
    uploads.entry(payload.rel_path.clone()).or_default().extend_from_slice(&bytes);

    if payload.done {
        let complete = uploads.remove(&payload.rel_path).unwrap_or_default();
        let dest = active.dest_path.join(&payload.rel_path);
        if let Some(parent) = dest.parent()
            && let Err(err) = std::fs::create_dir_all(parent)
        {
            return reject(request, format!("failed to create parent dir: {err}"));
        }
        if let Err(err) = std::fs::write(&dest, &complete) {
            return reject(request, format!("failed to write staged file: {err}"));
        }
        info!(rel_path = %payload.rel_path, bytes = complete.len(), "staged file written");
    }

    ack(request)
}

async fn handle_run(state: &Arc<ServerState>, request: &Envelope) -> Envelope {
    let payload: RunPayload = match request.payload_as() {
        Ok(p) => p,
        Err(err) => return reject(request, err.to_string()),
    };

    let scheduler_addr = {
        let active = state.active.lock().await;
        match active.as_ref() {
            Some(active) if active.computation_id == payload.computation_id => active.scheduler_addr,
            _ => return reject(request, "computation_id does not match the staged computation".to_string()),
        }
    };

    state.coros.lock().await.insert(payload.task_id, payload.name.clone());
    info!(task_id = %payload.task_id, name = %payload.name, "task started");

    let task_id = payload.task_id;
    let local_agent_id = request.to.clone().unwrap_or_default();
    if let Some(transport) = state.transport.get().cloned() {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            state.coros.lock().await.remove(&task_id);
            let envelope = Envelope::new(
                local_agent_id,
                "node.scheduler".to_string(),
                MessageKind::Result,
                json!(ResultPayload {
                    task_id,
                    value: Some(json!(null)),
                    error: None,
                }),
            );
            let _ = transport.send(scheduler_addr, envelope).await;
        });
    }

    Envelope::response_to(
        request,
        "node.server".to_string(),
        MessageKind::Ack,
        json!(AckPayload {
            accepted: true,
            auth: None,
            value: Some(json!({"task_id": task_id})),
        }),
    )
}

async fn handle_close_server(state: &Arc<ServerState>, request: &Envelope) -> Envelope {
    let payload: CloseServerPayload = match request.payload_as() {
        Ok(p) => p,
        Err(err) => return reject(request, err.to_string()),
    };

    let scheduler_addr = state.active.lock().await.as_ref().map(|a| a.scheduler_addr);
    *state.active.lock().await = None;
    state.coros.lock().await.clear();
    info!(computation_id = %payload.computation_id, "closed by scheduler");

    if let (Some(scheduler_addr), Some(transport)) = (scheduler_addr, state.transport.get().cloned()) {
        let local_agent_id = request.to.clone().unwrap_or_default();
        tokio::spawn(async move {
            let envelope = Envelope::new(
                local_agent_id,
                "node.scheduler".to_string(),
                MessageKind::StatusUpdate,
                json!(StatusUpdatePayload {
                    status: DiscoroStatus::ServerClosed,
                    location: None,
                    name: None,
                    info: None,
                }),
            );
            let _ = transport.send(scheduler_addr, envelope).await;
        });
    }

    ack(request)
}

async fn handle_terminate(state: &Arc<ServerState>, request: &Envelope) -> Envelope {
    let payload: TerminatePayload = match request.payload_as() {
        Ok(p) => p,
        Err(err) => return reject(request, err.to_string()),
    };

    let mut coros = state.coros.lock().await;
    for task_id in &payload.task_ids {
        coros.remove(task_id);
    }
    info!(count = payload.task_ids.len(), "tasks terminated");

    ack(request)
}

fn ack(request: &Envelope) -> Envelope {
    Envelope::response_to(
        request,
        "node.server".to_string(),
        MessageKind::Ack,
        json!(AckPayload {
            accepted: true,
            auth: None,
            value: None,
        }),
    )
}

fn reject(request: &Envelope, message: String) -> Envelope {
    warn!(%message, "rejecting request");
    Envelope::response_to(
        request,
        "node.server".to_string(),
        MessageKind::Error,
        json!(discoro::message::ErrorPayload {
            code: discoro::message::ErrorCode::Internal,
            message,
            retryable: false,
        }),
    )
}
