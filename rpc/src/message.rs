//! JSON-RPC 2.0 message shapes.
//!
//! Three shapes exist on the wire: request (id + method), response (id +
//! result or error), and notification (method, no id). Ids are integers or
//! UUID strings.

use serde::{Deserialize, Serialize};

use crate::error::ErrorObject;

/// A request or response correlation id: integer or string (UUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl RequestId {
    /// Fresh UUID-shaped id.
    #[must_use]
    pub fn fresh() -> Self {
        Self::Text(uuid::Uuid::new_v4().to_string())
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    #[must_use]
    pub fn new(id: RequestId, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    #[must_use]
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    #[must_use]
    pub fn result(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A classified incoming frame.
#[derive(Debug)]
pub enum IncomingMessage {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// Classify a raw frame into one of the three message shapes.
///
/// Returns `None` for frames that are none of them (logged and dropped by
/// the peer).
#[must_use]
pub fn parse_message(frame: serde_json::Value) -> Option<IncomingMessage> {
    let has_id = frame.get("id").is_some_and(|id| !id.is_null());
    let has_method = frame.get("method").is_some();
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (has_id, has_method, has_result_or_error) {
        (true, true, _) => serde_json::from_value(frame)
            .ok()
            .map(IncomingMessage::Request),
        (true, false, true) => serde_json::from_value(frame)
            .ok()
            .map(IncomingMessage::Response),
        (false, true, _) => serde_json::from_value(frame)
            .ok()
            .map(IncomingMessage::Notification),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_untagged_serde() {
        let n: RequestId = serde_json::from_value(serde_json::json!(42)).unwrap();
        assert_eq!(n, RequestId::Number(42));
        let s: RequestId = serde_json::from_value(serde_json::json!("abc-123")).unwrap();
        assert_eq!(s, RequestId::Text("abc-123".to_string()));
        assert_eq!(serde_json::to_value(&n).unwrap(), serde_json::json!(42));
    }

    #[test]
    fn fresh_ids_are_distinct() {
        assert_ne!(RequestId::fresh(), RequestId::fresh());
    }

    #[test]
    fn request_serialization_omits_none_params() {
        let req = Request::new(RequestId::Number(1), "shutdown", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "shutdown");
        assert!(
            json.get("params").is_none(),
            "params must be omitted, not null"
        );
    }

    #[test]
    fn parse_classifies_request() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}
        });
        assert!(matches!(
            parse_message(frame),
            Some(IncomingMessage::Request(_))
        ));
    }

    #[test]
    fn parse_classifies_response_with_result() {
        let frame = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        assert!(matches!(
            parse_message(frame),
            Some(IncomingMessage::Response(_))
        ));
    }

    #[test]
    fn parse_classifies_response_with_error() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": -32600, "message": "invalid request"}
        });
        let parsed = parse_message(frame);
        match parsed {
            Some(IncomingMessage::Response(resp)) => {
                assert_eq!(resp.error.unwrap().code, -32600);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn parse_classifies_notification() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0", "method": "$/progress",
            "params": {"token": "t", "value": 1}
        });
        assert!(matches!(
            parse_message(frame),
            Some(IncomingMessage::Notification(_))
        ));
    }

    #[test]
    fn parse_rejects_shapeless_frame() {
        assert!(parse_message(serde_json::json!({"jsonrpc": "2.0"})).is_none());
        assert!(parse_message(serde_json::json!({"id": 1})).is_none());
    }

    #[test]
    fn parse_accepts_string_ids() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "3f6c0b4e-8e9f-4e38-9fb6-1c2b5f0a9d11",
            "result": null
        });
        match parse_message(frame) {
            Some(IncomingMessage::Response(resp)) => {
                assert!(matches!(resp.id, RequestId::Text(_)));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }
}
