use super::*;
use crate::identity::Identity;
use serde_json::json;
use std::path::PathBuf;
use tempfile::tempdir;
use tokio::sync::mpsc;

async fn bind_transport() -> (Identity, QuicTransport, tempfile::TempDir) {
    let dir = tempdir().expect("tempdir");
    let home = crate::config::DiscoroHome::from_root(PathBuf::from(dir.path()));
    let identity = Identity::load_or_generate(&home).expect("identity");
    let transport = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &identity, 128)
        .await
        .expect("bind");
    (identity, transport, dir)
}

#[test]
fn node_key_zeroes_the_port() {
    let addr: SocketAddr = "10.0.0.5:9001".parse().unwrap();
    let key = node_key(addr);
    assert_eq!(key.host(), "10.0.0.5");
    assert_eq!(key.port(), 0);
}

#[test]
fn two_servers_same_host_share_a_node_key() {
    let a: SocketAddr = "10.0.0.5:9001".parse().unwrap();
    let b: SocketAddr = "10.0.0.5:9002".parse().unwrap();
    assert_eq!(node_key(a), node_key(b));
}

#[tokio::test]
async fn peer_online_without_computation_marks_server_discovered() {
    let fleet = Fleet::new();
    let (_id, transport, _dir) = bind_transport().await;
    let (tx, mut rx) = mpsc::channel(8);
    let addr: SocketAddr = "127.0.0.1:19001".parse().unwrap();

    handle_peer_online(&fleet, &transport, "node.sched", None, addr, None, &tx).await;

    let nodes = fleet.snapshot_nodes().await;
    let server = &nodes[0].servers[&Location::new(addr)];
    assert_eq!(server.status, DiscoroStatus::ServerDiscovered);
    assert!(rx.try_recv().is_err(), "no observer event without an active computation");
}

#[tokio::test]
async fn peer_offline_removes_server_and_emits_when_computation_active() {
    let fleet = Fleet::new();
    let addr: SocketAddr = "127.0.0.1:19002".parse().unwrap();
    let node_location = node_key(addr);
    let server_location = Location::new(addr);
    fleet.upsert_node(node_location, None).await;
    fleet
        .add_server(node_location, crate::fleet::Server::new("s1", server_location, node_location))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let cascade = handle_peer_offline(&fleet, addr, true, None, &tx).await;
    assert!(!cascade);

    let first = rx.recv().await.expect("server disconnected event");
    assert_eq!(first.status, DiscoroStatus::ServerDisconnected);
    let second = rx.recv().await.expect("node disconnected event");
    assert_eq!(second.status, DiscoroStatus::NodeDisconnected);
}

#[tokio::test]
async fn peer_offline_at_client_pulse_location_cascades_close() {
    let fleet = Fleet::new();
    let addr: SocketAddr = "127.0.0.1:19003".parse().unwrap();
    let node_location = node_key(addr);
    let server_location = Location::new(addr);
    fleet.upsert_node(node_location, None).await;
    fleet
        .add_server(node_location, crate::fleet::Server::new("s1", server_location, node_location))
        .await
        .unwrap();

    let (tx, _rx) = mpsc::channel(8);
    let cascade = handle_peer_offline(&fleet, addr, false, Some(server_location), &tx).await;
    assert!(cascade);
}

#[tokio::test]
async fn termination_racing_ahead_of_spawn_is_buffered_not_emitted() {
    let fleet = Fleet::new();
    let addr: SocketAddr = "127.0.0.1:19004".parse().unwrap();
    let node_location = node_key(addr);
    let server_location = Location::new(addr);
    fleet.upsert_node(node_location, None).await;
    fleet
        .add_server(node_location, crate::fleet::Server::new("s1", server_location, node_location))
        .await
        .unwrap();

    let task_id = uuid::Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(8);
    handle_task_termination(&fleet, addr, task_id, Some(json!("done")), None, &tx).await;

    assert!(rx.try_recv().is_err(), "no running task, so nothing should be observed");

    let nodes = fleet.snapshot_nodes().await;
    let server = &nodes[0].servers[&server_location];
    assert!(server.done.iter().any(|o| o.task_id == task_id));
}

#[tokio::test]
async fn termination_of_a_running_task_is_observed() {
    let fleet = Fleet::new();
    let addr: SocketAddr = "127.0.0.1:19005".parse().unwrap();
    let node_location = node_key(addr);
    let server_location = Location::new(addr);
    fleet.upsert_node(node_location, None).await;
    fleet
        .add_server(node_location, crate::fleet::Server::new("s1", server_location, node_location))
        .await
        .unwrap();

    let task_id = uuid::Uuid::new_v4();
    fleet
        .place_task(
            &node_location,
            &server_location,
            crate::fleet::RemoteTask::new(task_id, "f", json!([]), json!({})),
        )
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    handle_task_termination(&fleet, addr, task_id, Some(json!(1)), None, &tx).await;

    let event = rx.recv().await.expect("observed termination");
    assert_eq!(event.coro.unwrap().task_id, task_id);
}
