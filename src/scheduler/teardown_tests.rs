use super::*;
use crate::fleet::Server;
use crate::identity::Identity;
use crate::message::{AckPayload, Envelope, MessageKind};
use std::path::PathBuf;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn bind_acking_server() -> (Identity, QuicTransport, tempfile::TempDir) {
    let dir = tempdir().expect("tempdir");
    let home = crate::config::DiscoroHome::from_root(PathBuf::from(dir.path()));
    let identity = Identity::load_or_generate(&home).expect("identity");

    let handler: crate::transport::ResponseHandlerFn = std::sync::Arc::new(move |_addr, envelope: std::sync::Arc<Envelope>| {
        Box::pin(async move {
            Some(Envelope::response_to(
                &envelope,
                "node.server".to_string(),
                MessageKind::Ack,
                serde_json::json!(AckPayload {
                    accepted: true,
                    auth: None,
                    value: None,
                }),
            ))
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = Option<Envelope>> + Send>>
    });

    let transport = QuicTransport::bind_cancellable(
        "127.0.0.1:0".parse().unwrap(),
        &identity,
        CancellationToken::new(),
        128,
        std::time::Duration::from_secs(15),
        std::time::Duration::from_secs(60),
        Some(handler),
        std::time::Duration::from_secs(10),
    )
    .await
    .expect("bind");

    (identity, transport, dir)
}

#[tokio::test]
async fn close_node_closes_every_server_and_marks_node_closed() {
    let fleet = Fleet::new();
    let (_id_s1, server1, _d1) = bind_acking_server().await;
    let (_id_s2, server2, _d2) = bind_acking_server().await;
    let (_id_sched, sched_transport, _dsched) = bind_acking_server().await;

    let node_location = crate::scheduler::status_processor::node_key(server1.local_addr().unwrap());
    fleet.upsert_node(node_location, None).await;
    fleet
        .add_server(node_location, Server::new("s1", Location::new(server1.local_addr().unwrap()), node_location))
        .await
        .unwrap();
    fleet
        .add_server(node_location, Server::new("s2", Location::new(server2.local_addr().unwrap()), node_location))
        .await
        .unwrap();

    let (observer, _rx) = mpsc::channel(8);
    close_node(&fleet, &sched_transport, "node.sched", &node_location, "auth123", &observer).await;

    assert_eq!(fleet.server_count().await, 0);
    let nodes = fleet.snapshot_nodes().await;
    assert_eq!(nodes[0].status, DiscoroStatus::NodeClosed);
}

#[tokio::test]
async fn close_computation_removes_staging_directory() {
    let fleet = Fleet::new();
    let (_id_sched, sched_transport, _dsched) = bind_acking_server().await;
    let staging = tempdir().unwrap();
    let dest_dir = staging.path().join("auth123");
    tokio::fs::create_dir_all(&dest_dir).await.unwrap();

    let (observer, _rx) = mpsc::channel(8);
    close_computation(&fleet, &sched_transport, "node.sched", "auth123", &dest_dir, &observer).await;

    assert!(!dest_dir.exists());
}
