//! `discoro-scheduler`: the scheduler entry point. Binds the QUIC transport,
//! runs the scheduler event loop, embeds the HTTP monitoring dashboard, and
//! drives node discovery (static `--node` addresses plus mDNS). Mirrors the
//! original scheduler's combined "one process does everything" layout —
//! `discoro_server` stays a separate binary since it's a distinct role.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use discoro::config::{self, DiscoroHome, NodeAddr, PersistedState};
use discoro::discovery::{run_mdns_discovery, run_static_discovery};
use discoro::identity::Identity;
use discoro::scheduler::Scheduler;
use discoro::scheduler::computation::MAX_PULSE_INTERVAL;

/// Port the embedded HTTP dashboard listens on, matching the original
/// scheduler's bundled `httpd` default.
const DASHBOARD_PORT: u16 = 8181;

#[derive(Parser)]
#[command(author, version, about = "discoro distributed task scheduler")]
struct Cli {
    /// Address to bind the scheduler's QUIC listener on.
    #[arg(short = 'i', long, default_value = "0.0.0.0")]
    ip_addr: String,

    /// External address clients/nodes should use to reach this scheduler,
    /// when it differs from `ip_addr` (behind NAT or a reverse proxy).
    #[arg(long)]
    ext_ip_addr: Option<String>,

    /// Port to listen on; 0 picks an ephemeral port.
    #[arg(short = 'u', long, default_value_t = 0)]
    udp_port: u16,

    /// Human-readable scheduler name, reported to the dashboard.
    #[arg(short = 'n', long, default_value = "scheduler")]
    name: String,

    /// Root directory for identity material and per-computation staging.
    #[arg(long)]
    dest_path: Option<PathBuf>,

    /// Reject client file uploads larger than this many bytes.
    #[arg(long)]
    max_file_size: Option<u64>,

    /// Shared secret clients must echo back in `schedule` to be accepted.
    #[arg(short = 's', long)]
    secret: Option<String>,

    /// TLS certificate file. discoro mints its own self-signed Ed25519 cert
    /// from the durable node identity (see `identity::Identity`); this flag
    /// is accepted for CLI compatibility but an externally supplied
    /// cert/key pair is not wired into the QUIC transport.
    #[arg(long)]
    certfile: Option<PathBuf>,

    /// TLS key file; see `certfile`.
    #[arg(long)]
    keyfile: Option<PathBuf>,

    /// Statically-known node address to bootstrap against, in addition to
    /// mDNS discovery. Repeatable.
    #[arg(long = "node")]
    nodes: Vec<String>,

    /// How long a server may go without a pulse before it's declared a
    /// zombie and torn down. Floored at `MAX_PULSE_INTERVAL`.
    #[arg(long, default_value_t = 1800)]
    zombie_period: u64,

    #[arg(short = 'd', long)]
    debug: bool,

    /// Wipe the discoro home directory before starting.
    #[arg(long)]
    clean: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(certfile) = &cli.certfile {
        warn!(path = %certfile.display(), "--certfile is accepted but not used: discoro mints its own self-signed cert from node identity");
    }
    if let Some(keyfile) = &cli.keyfile {
        warn!(path = %keyfile.display(), "--keyfile is accepted but not used: discoro mints its own self-signed cert from node identity");
    }

    let dest_path = cli.dest_path.clone().unwrap_or_else(|| PathBuf::from("."));
    let home = DiscoroHome::from_root(dest_path.join(".discoro"));

    if cli.clean && home.root.exists() {
        info!(path = %home.root.display(), "--clean: wiping discoro home");
        std::fs::remove_dir_all(&home.root).with_context(|| format!("failed to clean {}", home.root.display()))?;
    }

    let identity = Identity::load_or_generate(&home).context("loading scheduler identity")?;

    let zombie_period = Duration::from_secs(cli.zombie_period).max(MAX_PULSE_INTERVAL);

    let bind_addr: SocketAddr = format!("{}:{}", cli.ip_addr, cli.udp_port).parse().context("parsing bind address")?;
    let scheduler = Scheduler::bind(bind_addr, &identity, dest_path.clone(), Some(zombie_period), 256, cli.secret.clone(), cli.max_file_size)
        .await
        .context("binding scheduler QUIC listener")?;
    let scheduler_addr = scheduler.transport.local_addr().context("reading scheduler local address")?;
    let advertised = cli.ext_ip_addr.as_deref().unwrap_or(&cli.ip_addr);
    info!(agent_id = identity.agent_id(), name = %cli.name, addr = %scheduler_addr, advertised, "discoro scheduler listening");

    let cancel = scheduler.cancel_token();
    let (peer_tx, peer_rx) = mpsc::channel(256);
    let (observer_tx, observer_rx) = mpsc::channel(256);

    let scheduler = std::sync::Arc::new(scheduler);
    let run_scheduler = scheduler.clone();
    let run_handle = tokio::spawn(async move { run_scheduler.run(peer_rx, observer_tx).await });

    let http_bind_addr: SocketAddr = format!("{}:{}", cli.ip_addr, DASHBOARD_PORT).parse().context("parsing dashboard bind address")?;
    let document_root = PathBuf::from("web");
    let http_scheduler = scheduler.clone();
    let http_cancel = cancel.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(err) = discoro::http::serve(http_bind_addr, http_scheduler, observer_rx, document_root, 10, http_cancel).await {
            warn!(error = %err, "http dashboard exited");
        }
    });

    let persisted = config::load_persisted_state(&home.state).await.unwrap_or_default();
    let mut known_nodes: Vec<String> = cli.nodes.clone();
    for known in persisted.known_nodes {
        if !known_nodes.contains(&known) {
            known_nodes.push(known);
        }
    }

    let mut static_nodes = Vec::with_capacity(known_nodes.len());
    for raw in &known_nodes {
        let node = match NodeAddr::parse(raw) {
            Ok(node) => node,
            Err(err) => {
                warn!(raw, error = %err, "skipping unparseable node address");
                continue;
            }
        };
        match node.resolve_async().await {
            Ok(addr) => static_nodes.push(addr),
            Err(err) => warn!(raw, error = %err, "skipping unresolvable node address"),
        }
    }
    let state_path = home.state.clone();
    let persist_nodes = known_nodes.clone();
    tokio::spawn(async move {
        let state = PersistedState { known_nodes: persist_nodes };
        if let Err(err) = config::save_persisted_state(&state_path, &state).await {
            warn!(error = %err, "failed to persist known nodes");
        }
    });

    let static_tx = peer_tx.clone();
    let static_cancel = cancel.clone();
    let static_handle = tokio::spawn(async move { run_static_discovery(static_nodes, static_tx, static_cancel).await });

    let mdns_agent_id = identity.agent_id().to_string();
    let mdns_tx = peer_tx.clone();
    let mdns_cancel = cancel.clone();
    let mdns_handle = tokio::spawn(async move { run_mdns_discovery(mdns_agent_id, scheduler_addr.port(), mdns_tx, mdns_cancel).await });

    let stdin_cancel = cancel.clone();
    let stdin_handle = tokio::spawn(async move { read_stdin_until_quit(stdin_cancel).await });

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
            cancel.cancel();
        }
    }

    scheduler.transport.close_all().await;
    let _ = run_handle.await;
    let _ = http_handle.await;
    let _ = static_handle.await;
    let _ = mdns_handle.await;
    let _ = stdin_handle.await;
    Ok(())
}

/// Reads stdin line by line; `quit` or `exit` (case-insensitive) or EOF
/// triggers shutdown, mirroring the original scheduler's interactive
/// console loop.
async fn read_stdin_until_quit(cancel: CancellationToken) {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim().to_ascii_lowercase();
                        if trimmed == "quit" || trimmed == "exit" {
                            cancel.cancel();
                            return;
                        }
                    }
                    Ok(None) | Err(_) => {
                        cancel.cancel();
                        return;
                    }
                }
            }
        }
    }
}
