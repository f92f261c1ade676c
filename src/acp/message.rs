// JSON-RPC 2.0 wire types for the agent protocol
//
// Every line on the agent's stdout is one JSON message, classified by
// shape: an id with a result or error is a response to one of our
// requests, an id with a method is a request from the agent, a method
// without an id is a notification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Error object carried in a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Request sent to the agent.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl OutgoingRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

/// Response sent back to the agent for one of its requests.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl OutgoingResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A message received from the agent, classified by shape.
#[derive(Debug, Clone)]
pub enum Envelope {
    /// Answer to a request we sent.
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<RpcError>,
    },
    /// Request initiated by the agent (e.g. a permission ask).
    ServerRequest {
        id: Value,
        method: String,
        params: Value,
    },
    /// Fire-and-forget notification (e.g. a session update).
    Notification { method: String, params: Value },
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

impl Envelope {
    /// Decode one line of agent output. Returns None for lines that are not
    /// valid JSON-RPC; the stream may carry stray diagnostics.
    pub fn decode(line: &str) -> Option<Envelope> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let raw: RawMessage = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                log::debug!("[Protocol] Ignoring non-JSON line: {} ({})", line, e);
                return None;
            }
        };

        match (raw.id, raw.method) {
            (Some(id), None) if raw.result.is_some() || raw.error.is_some() => {
                // Responses to our requests always carry our numeric ids.
                let id = id.as_u64()?;
                Some(Envelope::Response {
                    id,
                    result: raw.result,
                    error: raw.error,
                })
            }
            (Some(id), Some(method)) => Some(Envelope::ServerRequest {
                id,
                method,
                params: raw.params.unwrap_or(Value::Null),
            }),
            (None, Some(method)) => Some(Envelope::Notification {
                method,
                params: raw.params.unwrap_or(Value::Null),
            }),
            _ => {
                log::debug!("[Protocol] Ignoring malformed message");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_success_response() {
        let envelope =
            Envelope::decode(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        match envelope {
            Envelope::Response { id, result, error } => {
                assert_eq!(id, 3);
                assert_eq!(result, Some(json!({"ok": true})));
                assert!(error.is_none());
            }
            other => panic!("expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_response() {
        let envelope = Envelope::decode(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        match envelope {
            Envelope::Response { id, result, error } => {
                assert_eq!(id, 4);
                assert!(result.is_none());
                let error = error.unwrap();
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "no such method");
            }
            other => panic!("expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_server_request() {
        let envelope = Envelope::decode(
            r#"{"jsonrpc":"2.0","id":"perm-1","method":"session/request_permission","params":{"toolCall":{}}}"#,
        )
        .unwrap();
        match envelope {
            Envelope::ServerRequest { id, method, params } => {
                assert_eq!(id, json!("perm-1"));
                assert_eq!(method, "session/request_permission");
                assert!(params.get("toolCall").is_some());
            }
            other => panic!("expected ServerRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_notification() {
        let envelope = Envelope::decode(
            r#"{"jsonrpc":"2.0","method":"session/update","params":{"progress":40}}"#,
        )
        .unwrap();
        match envelope {
            Envelope::Notification { method, params } => {
                assert_eq!(method, "session/update");
                assert_eq!(params["progress"], 40);
            }
            other => panic!("expected Notification, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_notification_without_params() {
        let envelope =
            Envelope::decode(r#"{"jsonrpc":"2.0","method":"session/idle"}"#).unwrap();
        match envelope {
            Envelope::Notification { method, params } => {
                assert_eq!(method, "session/idle");
                assert_eq!(params, Value::Null);
            }
            other => panic!("expected Notification, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_lines() {
        assert!(Envelope::decode("").is_none());
        assert!(Envelope::decode("   ").is_none());
        assert!(Envelope::decode("debug: starting up").is_none());
        assert!(Envelope::decode(r#"{"jsonrpc":"2.0"}"#).is_none());
        // Bare id with neither result nor error is not a response.
        assert!(Envelope::decode(r#"{"jsonrpc":"2.0","id":9}"#).is_none());
    }

    #[test]
    fn test_outgoing_request_serialization() {
        let request = OutgoingRequest::new(1, "initialize", Some(json!({"protocolVersion": 1})));
        let encoded = serde_json::to_string(&request).unwrap();
        assert!(encoded.contains(r#""jsonrpc":"2.0""#));
        assert!(encoded.contains(r#""id":1"#));
        assert!(encoded.contains(r#""method":"initialize""#));

        let bare = OutgoingRequest::new(2, "session/new", None);
        let encoded = serde_json::to_string(&bare).unwrap();
        assert!(!encoded.contains("params"));
    }

    #[test]
    fn test_outgoing_response_serialization() {
        let ok = OutgoingResponse::success(json!("perm-1"), json!({"outcome": "allowed"}));
        let encoded = serde_json::to_string(&ok).unwrap();
        assert!(encoded.contains(r#""id":"perm-1""#));
        assert!(!encoded.contains("error"));

        let err = OutgoingResponse::failure(json!(7), -32601, "no handler");
        let encoded = serde_json::to_string(&err).unwrap();
        assert!(encoded.contains(r#""code":-32601"#));
        assert!(!encoded.contains("result"));
    }
}
