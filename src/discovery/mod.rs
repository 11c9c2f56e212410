use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const SERVICE_TYPE: &str = "_discoro._udp.local.";

/// A node address becoming reachable or unreachable, fed into the
/// scheduler's bootstrap protocol. Nodes are addressed by `SocketAddr`
/// (a `Location`); `agent_id` is carried as informational metadata only —
/// discoro does not pin trust to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Discovered {
        addr: SocketAddr,
        agent_id: Option<String>,
    },
    Lost {
        addr: SocketAddr,
    },
}

// ---------------------------------------------------------------------------
// Static discovery — the `--node` CLI flag
// ---------------------------------------------------------------------------

pub async fn run_static_discovery(
    nodes: Vec<SocketAddr>,
    tx: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    for addr in nodes {
        tx.send(PeerEvent::Discovered {
            addr,
            agent_id: None,
        })
        .await
        .map_err(|_| anyhow::anyhow!("peer event channel closed"))?;
    }
    cancel.cancelled().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// mDNS discovery — automatic node discovery on the local network
// ---------------------------------------------------------------------------

pub async fn run_mdns_discovery(
    local_agent_id: String,
    port: u16,
    tx: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let mdns = ServiceDaemon::new().context("failed to start mDNS daemon")?;

    let instance_name = format!("discoro-{}", local_agent_id);
    let hostname = format!("{instance_name}.local.");

    let properties = [("agent_id", local_agent_id.as_str())];

    let service = ServiceInfo::new(
        SERVICE_TYPE,
        &instance_name,
        &hostname,
        "",
        port,
        &properties[..],
    )
    .context("failed to build mDNS service info")?;

    mdns.register(service)
        .context("failed to register mDNS advertisement")?;

    let receiver = mdns
        .browse(SERVICE_TYPE)
        .context("failed to start mDNS browse")?;

    let mut fullname_to_addr = HashMap::<String, SocketAddr>::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = receiver.recv_async() => {
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(error = %err, "mDNS browse channel closed");
                        break;
                    }
                };

                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        match parse_resolved_service(&local_agent_id, &info) {
                            Some((peer_event, fullname, addr)) => {
                                fullname_to_addr.insert(fullname, addr);
                                if tx.send(peer_event).await.is_err() {
                                    break;
                                }
                            }
                            None => {}
                        }
                    }
                    ServiceEvent::ServiceRemoved(_service_type, fullname) => {
                        if let Some(addr) = fullname_to_addr.remove(&fullname)
                            && tx.send(PeerEvent::Lost { addr }).await.is_err()
                        {
                            break;
                        }
                    }
                    other => {
                        debug!(event = ?other, "ignoring non-resolved mDNS event");
                    }
                }
            }
        }
    }

    let _ = mdns.shutdown();
    Ok(())
}

fn parse_resolved_service(
    local_agent_id: &str,
    info: &ServiceInfo,
) -> Option<(PeerEvent, String, SocketAddr)> {
    let agent_id = info.get_property_val_str("agent_id")?;
    if agent_id == local_agent_id {
        return None;
    }

    let ip = preferred_ip(info)?;
    let addr = SocketAddr::new(ip, info.get_port());
    let event = PeerEvent::Discovered {
        addr,
        agent_id: Some(agent_id.to_string()),
    };

    Some((event, info.get_fullname().to_string(), addr))
}

fn preferred_ip(info: &ServiceInfo) -> Option<IpAddr> {
    let mut v4 = None;
    let mut v6 = None;

    for ip in info.get_addresses() {
        match ip {
            IpAddr::V4(ipv4) if !ipv4.is_loopback() => {
                v4 = Some(IpAddr::V4(*ipv4));
                break;
            }
            IpAddr::V6(ipv6) if !ipv6.is_loopback() => {
                v6 = Some(IpAddr::V6(*ipv6));
            }
            _ => {}
        }
    }

    v4.or(v6)
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
