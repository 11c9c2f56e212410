use super::*;
use crate::identity::Identity;
use crate::message::MessageKind;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::tempdir;

async fn make_transport_pair() -> (
    Identity,
    Identity,
    QuicTransport,
    QuicTransport,
    tempfile::TempDir,
    tempfile::TempDir,
) {
    let dir_a = tempdir().expect("tempdir a");
    let home_a = crate::config::DiscoroHome::from_root(PathBuf::from(dir_a.path()));
    let id_a = Identity::load_or_generate(&home_a).expect("identity a");

    let dir_b = tempdir().expect("tempdir b");
    let home_b = crate::config::DiscoroHome::from_root(PathBuf::from(dir_b.path()));
    let id_b = Identity::load_or_generate(&home_b).expect("identity b");

    let transport_b = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &id_b, 128)
        .await
        .expect("bind b");
    let transport_a = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &id_a, 128)
        .await
        .expect("bind a");

    (id_a, id_b, transport_a, transport_b, dir_a, dir_b)
}

#[tokio::test]
async fn endpoint_binds_and_reports_addr() {
    let dir = tempdir().expect("tempdir");
    let home = crate::config::DiscoroHome::from_root(PathBuf::from(dir.path()));
    let identity = Identity::load_or_generate(&home).expect("identity");

    let transport = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &identity, 128)
        .await
        .expect("bind");

    let addr = transport.local_addr().expect("local_addr");
    assert_eq!(addr.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
    assert_ne!(addr.port(), 0);
}

#[tokio::test]
async fn two_peers_connect_by_address() {
    let (_id_a, _id_b, transport_a, transport_b, _dir_a, _dir_b) = make_transport_pair().await;
    let addr_b = transport_b.local_addr().expect("local_addr b");

    let conn = transport_a.ensure_connection(addr_b).await.expect("connect");
    assert!(conn.close_reason().is_none());
    assert!(transport_a.has_connection(addr_b).await);
}

#[tokio::test]
async fn send_pulse_unidirectional() {
    let (id_a, _id_b, transport_a, transport_b, _dir_a, _dir_b) = make_transport_pair().await;
    let addr_b = transport_b.local_addr().expect("local_addr b");
    let mut rx_b = transport_b.subscribe_inbound();

    let pulse = Envelope::new(
        id_a.agent_id().to_string(),
        "scheduler".to_string(),
        MessageKind::Pulse,
        json!({"location": "127.0.0.1:9", "ncoros": 3}),
    );

    let result = transport_a.send(addr_b, pulse.clone()).await.expect("send");
    assert!(result.is_none());

    let received = tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
        .await
        .expect("timeout waiting for inbound")
        .expect("recv");
    assert_eq!(received.envelope.kind, MessageKind::Pulse);
    assert_eq!(received.envelope.from.as_deref(), Some(id_a.agent_id()));
}

#[tokio::test]
async fn send_request_bidirectional_default_error() {
    let (id_a, _id_b, transport_a, transport_b, _dir_a, _dir_b) = make_transport_pair().await;
    let addr_b = transport_b.local_addr().expect("local_addr b");

    let request = Envelope::new(
        id_a.agent_id().to_string(),
        "scheduler".to_string(),
        MessageKind::NodesQuery,
        json!({"auth": "x"}),
    );

    let result = transport_a
        .send(addr_b, request.clone())
        .await
        .expect("send");
    let response = result.expect("expected response");
    assert_eq!(response.kind, MessageKind::Error);
    assert_eq!(response.ref_id, Some(request.id));
}
