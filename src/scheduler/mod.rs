pub mod admin;
pub mod bootstrap;
pub mod client_rpc;
pub mod computation;
pub mod placement;
pub mod status_processor;
pub mod teardown;
pub mod timer;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::discovery::PeerEvent;
use crate::fleet::Fleet;
use crate::identity::Identity;
use crate::message::MessageKind;
use crate::scheduler::computation::Computation;
use crate::scheduler::status_processor::ObserverEvent;
use crate::transport::QuicTransport;

/// Runs the scheduler: owns the fleet, the QUIC transport, and the single
/// active-computation slot. Mirrors `_Scheduler` from the original
/// implementation — one scheduler, one computation at a time, everything
/// else (nodes/servers) tracked in `fleet`.
pub struct Scheduler {
    pub fleet: Fleet,
    pub transport: QuicTransport,
    pub local_agent_id: String,
    staging_root: PathBuf,
    zombie_period: Option<Duration>,
    secret: Option<String>,
    max_file_size: Option<u64>,
    active: Arc<RwLock<Option<Computation>>>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// `secret`, when set, is the shared secret every client's `schedule`
    /// request must echo back in `SchedulePayload.client_secret`; `None`
    /// leaves the scheduler open to any client. `max_file_size`, when set,
    /// rejects `file_transfer` uploads whose decoded payload exceeds it.
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        bind_addr: SocketAddr,
        identity: &Identity,
        staging_root: PathBuf,
        zombie_period: Option<Duration>,
        max_connections: usize,
        secret: Option<String>,
        max_file_size: Option<u64>,
    ) -> Result<Self> {
        let fleet = Fleet::new();
        let active: Arc<RwLock<Option<Computation>>> = Arc::new(RwLock::new(None));
        let cancel = CancellationToken::new();
        let transport_cell: Arc<OnceLock<QuicTransport>> = Arc::new(OnceLock::new());

        let handler_fleet = fleet.clone();
        let handler_active = active.clone();
        let handler_staging = staging_root.clone();
        let handler_cell = transport_cell.clone();
        let handler_agent_id = identity.agent_id().to_string();
        let handler_secret = secret.clone();

        let response_handler: crate::transport::ResponseHandlerFn = Arc::new(move |remote_addr, envelope| {
            let fleet = handler_fleet.clone();
            let active = handler_active.clone();
            let staging_root = handler_staging.clone();
            let transport_cell = handler_cell.clone();
            let local_agent_id = handler_agent_id.clone();
            let secret = handler_secret.clone();

            Box::pin(async move {
                let Some(transport) = transport_cell.get() else {
                    warn!("client request arrived before scheduler transport was ready");
                    return None;
                };

                let guard = active.read().await;
                let outcome = client_rpc::handle(
                    &fleet,
                    transport,
                    &local_agent_id,
                    guard.as_ref(),
                    zombie_period,
                    secret.as_deref(),
                    max_file_size,
                    &staging_root,
                    remote_addr,
                    &envelope,
                )
                .await;
                drop(guard);

                if let Some(new_computation) = outcome.adopt {
                    *active.write().await = Some(new_computation);
                }
                if outcome.close {
                    *active.write().await = None;
                }

                Some(outcome.reply)
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = Option<crate::message::Envelope>> + Send>>
        });

        let transport = QuicTransport::bind_cancellable(
            bind_addr,
            identity,
            cancel.clone(),
            max_connections,
            Duration::from_secs(15),
            Duration::from_secs(60),
            Some(response_handler),
            Duration::from_secs(10),
        )
        .await?;
        transport_cell.set(transport.clone()).ok();

        Ok(Self {
            fleet,
            transport,
            local_agent_id: identity.agent_id().to_string(),
            staging_root,
            zombie_period,
            secret,
            max_file_size,
            active,
            cancel,
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drives peer discovery, inbound server reports, and the periodic
    /// zombie sweep until cancelled. `observer` receives every lifecycle
    /// event worth surfacing to a client's status stream.
    pub async fn run(&self, mut peer_rx: mpsc::Receiver<PeerEvent>, observer: mpsc::Sender<ObserverEvent>) {
        let mut inbound_rx = self.transport.subscribe_inbound();
        let mut zombie_tick = tokio::time::interval(self.zombie_sweep_interval());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("scheduler shutting down");
                    break;
                }
                Some(event) = peer_rx.recv() => {
                    self.on_peer_event(event, &observer).await;
                }
                Ok(inbound) = inbound_rx.recv() => {
                    self.on_inbound(inbound.remote, &inbound.envelope, &observer).await;
                }
                _ = zombie_tick.tick() => {
                    self.sweep_zombies(&observer).await;
                }
            }
        }
    }

    fn zombie_sweep_interval(&self) -> Duration {
        Self::interval_for(self.zombie_period)
    }

    fn interval_for(zombie_period: Option<Duration>) -> Duration {
        zombie_period
            .unwrap_or(computation::MAX_PULSE_INTERVAL)
            .max(Duration::from_secs(1))
    }

    async fn on_peer_event(&self, event: PeerEvent, observer: &mpsc::Sender<ObserverEvent>) {
        let active = self.active.read().await;
        let client_pulse_location = active.as_ref().and_then(|c| c.client_pulse_location);
        let pulse_close = status_processor::handle_peer_event(
            &self.fleet,
            &self.transport,
            &self.local_agent_id,
            active.as_ref(),
            event,
            client_pulse_location,
            observer,
        )
        .await;
        drop(active);

        if pulse_close {
            self.close_active_computation(observer).await;
        }
    }

    async fn on_inbound(&self, remote: SocketAddr, envelope: &crate::message::Envelope, observer: &mpsc::Sender<ObserverEvent>) {
        match envelope.kind {
            MessageKind::Pulse => {
                if let Ok(payload) = envelope.payload_as::<crate::message::PulsePayload>() {
                    timer::handle_heartbeat(&self.fleet, remote, payload.ncoros).await;
                }
            }
            MessageKind::StatusUpdate => {
                if let Ok(payload) = envelope.payload_as::<crate::message::StatusUpdatePayload>()
                    && payload.status == crate::message::DiscoroStatus::ServerClosed
                {
                    let outcome = timer::handle_server_closed_report(&self.fleet, remote).await;
                    if outcome.all_nodes_closed {
                        self.close_active_computation(observer).await;
                    }
                }
            }
            MessageKind::Result => {
                if let Ok(payload) = envelope.payload_as::<crate::message::ResultPayload>() {
                    status_processor::handle_task_termination(
                        &self.fleet,
                        remote,
                        payload.task_id,
                        payload.value,
                        payload.error,
                        observer,
                    )
                    .await;
                }
            }
            other => {
                warn!(%remote, kind = %other, "unexpected unsolicited message kind");
            }
        }
    }

    async fn sweep_zombies(&self, observer: &mpsc::Sender<ObserverEvent>) {
        let active = self.active.read().await;
        let Some(computation) = active.as_ref() else { return };
        let closed = timer::audit_and_close_zombies(
            &self.fleet,
            &self.transport,
            &self.local_agent_id,
            computation.pulse_interval,
            &computation.auth,
            observer,
        )
        .await;
        if !closed.is_empty() {
            info!(count = closed.len(), "zombie sweep closed stale servers");
        }
    }

    async fn close_active_computation(&self, observer: &mpsc::Sender<ObserverEvent>) {
        let mut active = self.active.write().await;
        let Some(computation) = active.take() else { return };
        drop(active);
        teardown::close_computation(
            &self.fleet,
            &self.transport,
            &self.local_agent_id,
            &computation.auth,
            &computation.dest_dir,
            observer,
        )
        .await;
    }

    pub async fn active_auth(&self) -> Option<String> {
        self.active.read().await.as_ref().map(|c| c.auth.clone())
    }

    /// Dashboard-initiated cancellation of specific running tasks. No-op
    /// (returns an empty vec) when no computation is active.
    pub async fn terminate_coros(&self, task_ids: &[uuid::Uuid]) -> Vec<uuid::Uuid> {
        let Some(auth) = self.active_auth().await else {
            return Vec::new();
        };
        let computation_id = bootstrap::parse_auth(&auth);
        admin::terminate_coros(&self.fleet, &self.transport, &self.local_agent_id, computation_id, task_ids).await
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
