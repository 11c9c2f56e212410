use super::*;
use serde_json::json;

fn agent_a() -> String {
    "node.a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4".to_string()
}

fn agent_b() -> String {
    "node.f6e5d4c3b2a1f6e5d4c3b2a1f6e5d4c3".to_string()
}

#[test]
fn envelope_round_trip() {
    let envelope = Envelope::new(
        agent_a(),
        agent_b(),
        MessageKind::Schedule,
        json!({"name": "compute"}),
    );
    let encoded = serde_json::to_string(&envelope).expect("serialize");
    let decoded: Envelope = serde_json::from_str(&encoded).expect("deserialize");
    assert_eq!(decoded.kind, MessageKind::Schedule);
    assert_eq!(decoded.payload_value().unwrap()["name"], json!("compute"));
}

#[test]
fn response_links_request_id() {
    let req = Envelope::new(agent_a(), agent_b(), MessageKind::Pulse, json!({}));
    let resp = Envelope::response_to(
        &req,
        req.to.clone().unwrap(),
        MessageKind::Ack,
        json!({"accepted": true}),
    );
    assert_eq!(resp.ref_id, Some(req.id));
    assert_eq!(resp.to, req.from);
}

#[test]
fn envelope_validation_rejects_nil_id() {
    let mut envelope = Envelope::new(agent_a(), agent_b(), MessageKind::Pulse, json!({}));
    envelope.id = Uuid::nil();
    assert!(envelope.validate().is_err());
}

#[test]
fn envelope_new_sets_defaults() {
    let env = Envelope::new(agent_a(), agent_b(), MessageKind::Pulse, json!({}));
    assert!(env.ref_id.is_none());
    assert!(!env.id.is_nil());
}

#[test]
fn unknown_envelope_fields_are_ignored() {
    let raw = r#"{
            "id":"6fc0ec4f-e59f-4bea-9d57-0d9fdd1108f1",
            "from":"node.aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "to":"node.bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            "kind":"status_update",
            "payload":{"status":1},
            "extra":"ignored"
        }"#;
    let decoded: Envelope = serde_json::from_str(raw).expect("deserialize");
    assert_eq!(decoded.kind, MessageKind::StatusUpdate);
}

#[test]
fn ref_field_serializes_as_ref_not_ref_id() {
    let env = Envelope::new(agent_a(), agent_b(), MessageKind::Pulse, json!({}));
    let v = serde_json::to_value(&env).unwrap();
    assert!(v.get("ref_id").is_none());
}

#[test]
fn ref_field_present_when_set() {
    let req = Envelope::new(agent_a(), agent_b(), MessageKind::Pulse, json!({}));
    let resp = Envelope::response_to(&req, agent_b(), MessageKind::Ack, json!({"accepted": true}));
    let v = serde_json::to_value(&resp).unwrap();
    assert_eq!(v["ref"].as_str().unwrap(), req.id.to_string());
}

// =========================================================================
// Property-based tests
// =========================================================================

use proptest::prelude::*;

proptest! {
    #[test]
    fn response_always_links_request(
        from_hex in "[0-9a-f]{32}",
        to_hex in "[0-9a-f]{32}",
    ) {
        let from_id = format!("node.{from_hex}");
        let to_id = format!("node.{to_hex}");
        let req = Envelope::new(from_id, to_id.clone(), MessageKind::Schedule, json!({"name":"x"}));
        let resp = Envelope::response_to(&req, to_id, MessageKind::Ack, json!({"accepted": true}));
        prop_assert_eq!(resp.ref_id, Some(req.id));
        prop_assert_eq!(resp.to, req.from);
    }

    #[test]
    fn non_nil_ids_always_validate(
        from_hex in "[0-9a-f]{32}",
        to_hex in "[0-9a-f]{32}",
    ) {
        let from_id = format!("node.{from_hex}");
        let to_id = format!("node.{to_hex}");
        let env = Envelope::new(from_id, to_id, MessageKind::Pulse, json!({}));
        prop_assert!(env.validate().is_ok());
    }
}
