//! Embedded HTTP monitoring dashboard, run in the same process as the
//! `Scheduler`. Mirrors the original scheduler's bundled `httpd`: read-only
//! `/cluster_updates` / `/cluster_status` / `/server_info` / `/node_info`
//! polling endpoints, a `/terminate_coros` admin action, `/set_poll_sec`,
//! and static file serving under a document root.
//!
//! The mirror state here is deliberately not the scheduler's `Fleet` — it
//! is rebuilt solely from the `ObserverEvent` stream the scheduler's main
//! loop already produces for clients, so a slow or stalled dashboard can
//! never block or corrupt the authoritative fleet (see `state.rs`).
//! `/terminate_coros` is the one path that still reaches into the live
//! scheduler, since cancellation has to act on real state, not a mirror.

mod routes;
mod state;

pub use routes::build_router;
pub use state::{DashboardState, NodeView, ServerView};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::scheduler::Scheduler;
use crate::scheduler::status_processor::ObserverEvent;

/// Drives the mirror-update task and the axum server until `cancel` fires.
pub async fn serve(
    bind_addr: SocketAddr,
    scheduler: Arc<Scheduler>,
    mut observer_rx: mpsc::Receiver<ObserverEvent>,
    document_root: PathBuf,
    poll_sec: u64,
    cancel: CancellationToken,
) -> Result<()> {
    let dashboard = Arc::new(DashboardState::new(poll_sec, document_root));

    let mirror_dashboard = dashboard.clone();
    let mirror_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = mirror_cancel.cancelled() => return,
                event = observer_rx.recv() => {
                    match event {
                        Some(event) => mirror_dashboard.apply(event).await,
                        None => return,
                    }
                }
            }
        }
    });

    let app = build_router(dashboard, scheduler);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "http dashboard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
