//! Wire shapes the relay itself produces. Everything else is forwarded
//! untouched apart from re-serialization.

use serde_json::{json, Value};

use crate::namespace::Namespace;

/// `{"type":"<primary>_status","online":bool}`
pub fn status_message(namespace: Namespace, online: bool) -> String {
    json!({ "type": namespace.status_type(), "online": online }).to_string()
}

/// `{"type":"error","message":"<primary>_offline"}`
pub fn offline_error(namespace: Namespace) -> String {
    json!({ "type": "error", "message": namespace.offline_error() }).to_string()
}

/// Parse an inbound payload. `None` means the frame is dropped.
pub fn parse_payload(raw: &str) -> Option<Value> {
    serde_json::from_str(raw).ok()
}
