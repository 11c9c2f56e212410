use super::*;
use crate::message::MessageKind;
use serde_json::json;

fn from_id() -> String {
    "node.a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4".to_string()
}

fn to_id() -> String {
    "node.f6e5d4c3b2a1f6e5d4c3b2a1f6e5d4c3".to_string()
}

#[test]
fn default_error_response_contract() {
    let req = Envelope::new(from_id(), to_id(), MessageKind::NodesQuery, json!({}));
    let resp = default_error_response(&req, &to_id());
    assert_eq!(resp.kind, MessageKind::Error);
    assert_eq!(resp.ref_id, Some(req.id));
    assert_eq!(resp.from.as_deref(), Some(to_id().as_str()));
    assert_eq!(resp.to.as_deref(), Some(from_id().as_str()));
    let payload = resp.payload_value().unwrap();
    assert_eq!(
        payload.get("code").and_then(|v| v.as_str()),
        Some("unknown_kind")
    );
}

#[test]
fn default_error_response_uses_unknown_kind_code() {
    for kind in [
        MessageKind::Setup,
        MessageKind::Run,
        MessageKind::Schedule,
        MessageKind::CloseComputation,
    ] {
        let req = Envelope::new(from_id(), to_id(), kind, json!({}));
        let resp = default_error_response(&req, &to_id());
        assert_eq!(resp.kind, MessageKind::Error);
        assert_eq!(resp.ref_id, Some(req.id));
        let payload = resp.payload_value().unwrap();
        assert_eq!(payload.get("code").and_then(|v| v.as_str()), Some("unknown_kind"));
    }
}
