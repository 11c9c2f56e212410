use super::*;
use serde_json::json;

fn loc(port: u16) -> Location {
    format!("127.0.0.1:{port}").parse().unwrap()
}

#[tokio::test]
async fn pick_server_prefers_least_loaded() {
    let fleet = Fleet::new();
    let node = loc(9000);
    fleet.upsert_node(node, None).await;

    let mut busy = Server::new("calc", loc(9001), node);
    busy.place_task(RemoteTask::new(uuid::Uuid::new_v4(), "f", json!([]), json!({})));
    fleet.add_server(node, busy).await.unwrap();
    fleet.add_server(node, Server::new("calc", loc(9002), node)).await.unwrap();

    let picked = fleet.pick_server("calc").await.unwrap();
    assert_eq!(picked, loc(9002));
}

#[tokio::test]
async fn pick_server_errors_when_name_unknown() {
    let fleet = Fleet::new();
    let err = fleet.pick_server("missing").await.unwrap_err();
    assert!(matches!(err, DiscoroError::NoServerAvailable { .. }));
}

#[tokio::test]
async fn remove_node_drops_all_its_servers_from_the_name_index() {
    let fleet = Fleet::new();
    let node = loc(9000);
    fleet.upsert_node(node, None).await;
    fleet.add_server(node, Server::new("calc", loc(9001), node)).await.unwrap();

    fleet.remove_node(&node).await;
    let err = fleet.pick_server("calc").await.unwrap_err();
    assert!(matches!(err, DiscoroError::NoServerAvailable { .. }));
}

#[tokio::test]
async fn zombie_servers_reports_stale_pulses_only() {
    let fleet = Fleet::new();
    let node = loc(9000);
    fleet.upsert_node(node, None).await;
    let mut server = Server::new("calc", loc(9001), node);
    server.status = crate::message::DiscoroStatus::ServerInitialized;
    fleet.add_server(node, server).await.unwrap();

    let fresh = fleet.zombie_servers(std::time::Duration::from_secs(60)).await;
    assert!(fresh.is_empty());

    let stale = fleet.zombie_servers(std::time::Duration::from_millis(0)).await;
    assert_eq!(stale, vec![(node, loc(9001))]);
}

#[tokio::test]
async fn place_task_and_mark_pulse_round_trip() {
    let fleet = Fleet::new();
    let node = loc(9000);
    let server_loc = loc(9001);
    fleet.upsert_node(node, None).await;
    fleet.add_server(node, Server::new("calc", server_loc, node)).await.unwrap();

    let task_id = uuid::Uuid::new_v4();
    fleet
        .place_task(&node, &server_loc, RemoteTask::new(task_id, "f", json!([]), json!({})))
        .await
        .unwrap();
    fleet.mark_pulse(&node, &server_loc).await;

    let nodes = fleet.snapshot_nodes().await;
    let server = &nodes[0].servers[&server_loc];
    assert_eq!(server.load(), 1);
}
