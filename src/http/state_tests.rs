use super::*;

fn loc(port: u16) -> Location {
    format!("127.0.0.1:{port}").parse().unwrap()
}

#[tokio::test]
async fn server_event_creates_node_and_server_entries() {
    let dashboard = DashboardState::new(10, PathBuf::from("."));
    dashboard
        .apply(ObserverEvent {
            status: DiscoroStatus::ServerDiscovered,
            location: Some(loc(9001)),
            host: None,
            coro: None,
        })
        .await;

    let status = dashboard.status().await;
    assert_eq!(status.len(), 1);
    let node = &status[0];
    assert_eq!(node.host, "127.0.0.1");
    let server = node.servers.get(&loc(9001).to_string()).expect("server entry");
    assert_eq!(server.status, DiscoroStatus::ServerDiscovered);
    assert_eq!(server.coros_done, 0);
}

#[tokio::test]
async fn cluster_updates_drains_the_dirty_set() {
    let dashboard = DashboardState::new(10, PathBuf::from("."));
    dashboard
        .apply(ObserverEvent {
            status: DiscoroStatus::ServerInitialized,
            location: Some(loc(9001)),
            host: None,
            coro: None,
        })
        .await;

    let first = dashboard.updates().await;
    assert_eq!(first.len(), 1);
    let second = dashboard.updates().await;
    assert!(second.is_empty(), "dirty set should be cleared after the first read");

    // status() is unaffected by draining the dirty set.
    assert_eq!(dashboard.status().await.len(), 1);
}

#[tokio::test]
async fn coro_created_event_increments_done_count_and_records_last_coro() {
    let dashboard = DashboardState::new(10, PathBuf::from("."));
    let task_id = uuid::Uuid::new_v4();
    dashboard
        .apply(ObserverEvent {
            status: DiscoroStatus::CoroCreated,
            location: Some(loc(9001)),
            host: None,
            coro: Some(CoroInfo {
                task_id,
                name: "compute".to_string(),
                start_time_unix_ms: 1,
            }),
        })
        .await;

    let server = dashboard.server_info(loc(9001)).await.expect("server entry");
    assert_eq!(server.coros_done, 1);
    assert_eq!(server.last_coro.unwrap().task_id, task_id);
}

#[tokio::test]
async fn node_level_event_does_not_touch_servers() {
    let dashboard = DashboardState::new(10, PathBuf::from("."));
    dashboard
        .apply(ObserverEvent {
            status: DiscoroStatus::NodeDisconnected,
            location: None,
            host: Some("127.0.0.1".to_string()),
            coro: None,
        })
        .await;

    let node = dashboard.node_info("127.0.0.1").await.expect("node entry");
    assert_eq!(node.status, DiscoroStatus::NodeDisconnected);
    assert!(node.servers.is_empty());
}

#[tokio::test]
async fn set_poll_sec_clamps_negative_values_to_zero() {
    let dashboard = DashboardState::new(10, PathBuf::from("."));
    dashboard.set_poll_sec(-5).await;
    assert_eq!(dashboard.poll_sec().await, 0);

    dashboard.set_poll_sec(30).await;
    assert_eq!(dashboard.poll_sec().await, 30);
}

#[tokio::test]
async fn unknown_server_info_lookup_returns_none() {
    let dashboard = DashboardState::new(10, PathBuf::from("."));
    assert!(dashboard.server_info(loc(9999)).await.is_none());
}
