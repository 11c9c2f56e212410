use super::*;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn static_discovery_emits_all_configured_nodes_then_waits() {
    let (tx, mut rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let nodes = vec![
        "127.0.0.1:9001".parse().unwrap(),
        "127.0.0.1:9002".parse().unwrap(),
    ];

    let cancel_clone = cancel.clone();
    let handle = tokio::spawn(run_static_discovery(nodes.clone(), tx, cancel_clone));

    let first = rx.recv().await.expect("first event");
    let second = rx.recv().await.expect("second event");
    assert_eq!(
        first,
        PeerEvent::Discovered {
            addr: nodes[0],
            agent_id: None
        }
    );
    assert_eq!(
        second,
        PeerEvent::Discovered {
            addr: nodes[1],
            agent_id: None
        }
    );

    assert!(
        tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err(),
        "static discovery must not emit further events before cancellation"
    );

    cancel.cancel();
    handle.await.expect("task join").expect("static discovery result");
}

#[test]
fn service_type_is_discoro_scoped() {
    assert_eq!(SERVICE_TYPE, "_discoro._udp.local.");
}
