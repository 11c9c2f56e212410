use super::*;
use serde_json::json;

fn loc(port: u16) -> Location {
    format!("127.0.0.1:{port}").parse().unwrap()
}

#[test]
fn setup_payload_defaults_empty_xfer_files() {
    let json = json!({
        "computation_id": Uuid::nil(),
        "auth": "tok",
        "dest_path": "/tmp/x",
    });
    let payload: SetupPayload = serde_json::from_value(json).unwrap();
    assert!(payload.xfer_files.is_empty());
}

#[test]
fn run_payload_round_trips() {
    let payload = RunPayload {
        task_id: Uuid::new_v4(),
        computation_id: Uuid::new_v4(),
        name: "compute".to_string(),
        args: json!([1, 2]),
        kwargs: json!({"n": 3}),
    };
    let json = serde_json::to_string(&payload).unwrap();
    let back: RunPayload = serde_json::from_str(&json).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn pulse_payload_carries_location_and_load() {
    let payload = PulsePayload {
        location: loc(9001),
        ncoros: 3,
    };
    let json = serde_json::to_string(&payload).unwrap();
    assert!(json.contains("\"127.0.0.1:9001\""));
    let back: PulsePayload = serde_json::from_str(&json).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn status_update_payload_omits_absent_optionals() {
    let payload = StatusUpdatePayload {
        status: DiscoroStatus::NodeDiscovered,
        location: None,
        name: None,
        info: None,
    };
    let json = serde_json::to_string(&payload).unwrap();
    assert!(!json.contains("location"));
    assert!(!json.contains("\"name\""));
    assert!(!json.contains("info"));
}

#[test]
fn schedule_payload_defaults_collections() {
    let json = json!({"name": "job"});
    let payload: SchedulePayload = serde_json::from_value(json).unwrap();
    assert!(payload.xfer_files.is_empty());
    assert!(payload.depends.is_empty());
    assert!(payload.nodes.is_none());
    assert!(payload.client_secret.is_none());
}

#[test]
fn run_each_payload_one_per_node_defaults_false() {
    let json = json!({"auth": "tok", "name": "job"});
    let payload: RunEachPayload = serde_json::from_value(json).unwrap();
    assert!(!payload.one_per_node);
}

#[test]
fn ack_payload_optional_fields_round_trip() {
    let payload = AckPayload {
        accepted: true,
        auth: Some("tok".to_string()),
        value: Some(json!(42)),
    };
    let json = serde_json::to_string(&payload).unwrap();
    let back: AckPayload = serde_json::from_str(&json).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn result_payload_omits_error_when_ok() {
    let ok = ResultPayload {
        task_id: Uuid::new_v4(),
        value: Some(json!("done")),
        error: None,
    };
    let json = serde_json::to_string(&ok).unwrap();
    assert!(json.contains("value"));
    assert!(!json.contains("error"));

    let failed = ResultPayload {
        task_id: Uuid::new_v4(),
        value: None,
        error: Some("boom".to_string()),
    };
    assert!(serde_json::to_string(&failed).unwrap().contains("error"));
}

#[test]
fn error_code_serializes_snake_case() {
    assert_eq!(
        serde_json::to_string(&ErrorCode::NoServerAvailable).unwrap(),
        "\"no_server_available\""
    );
    assert_eq!(
        serde_json::to_string(&ErrorCode::UnknownComputation).unwrap(),
        "\"unknown_computation\""
    );
}

#[test]
fn error_payload_serde_roundtrip() {
    let e = ErrorPayload {
        code: ErrorCode::NotAuthorized,
        message: "bad secret".to_string(),
        retryable: false,
    };
    let v = serde_json::to_value(&e).unwrap();
    let back: ErrorPayload = serde_json::from_value(v).unwrap();
    assert_eq!(e, back);
}

#[test]
fn nodes_query_response_carries_locations() {
    let payload = NodesQueryResponsePayload {
        nodes: vec![loc(9000), loc(9001)],
    };
    let json = serde_json::to_string(&payload).unwrap();
    let back: NodesQueryResponsePayload = serde_json::from_str(&json).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn servers_query_response_maps_names_to_locations() {
    let mut servers = HashMap::new();
    servers.insert("calc".to_string(), vec![loc(9001), loc(9002)]);
    let payload = ServersQueryResponsePayload { servers };
    let json = serde_json::to_string(&payload).unwrap();
    let back: ServersQueryResponsePayload = serde_json::from_str(&json).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn file_transfer_payload_round_trips_base64_chunk() {
    let payload = FileTransferPayload {
        computation_id: Uuid::new_v4(),
        rel_path: "f.txt".to_string(),
        seq: 0,
        done: true,
        data_base64: "aGVsbG8=".to_string(),
    };
    let json = serde_json::to_string(&payload).unwrap();
    let back: FileTransferPayload = serde_json::from_str(&json).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn servers_query_payload_node_filter_is_optional() {
    let json = json!({"auth": "tok"});
    let payload: ServersQueryPayload = serde_json::from_value(json).unwrap();
    assert!(payload.node.is_none());
}
