//! JSON-RPC 2.0 framing for the tool server

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request id: the assistant client sends both strings and numbers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{}", s),
            RequestId::Number(n) => write!(f, "{}", n),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A method call without an id; no response is expected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: ErrorCode, message: String) -> Self {
        Self {
            code: code as i32,
            message,
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(message: String) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal(message: String) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_and_notification_discriminate_on_id() {
        let request = r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{}}"#;
        let message: JsonRpcMessage = serde_json::from_str(request).unwrap();
        assert!(matches!(message, JsonRpcMessage::Request(_)));

        let notification = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let message: JsonRpcMessage = serde_json::from_str(notification).unwrap();
        assert!(matches!(message, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn success_response_omits_error() {
        let response = JsonRpcResponse::success(RequestId::Number(1), json!({"ok": true}));
        let encoded = serde_json::to_string(&response).unwrap();
        assert!(encoded.contains(r#""jsonrpc":"2.0""#));
        assert!(encoded.contains(r#""result":{"ok":true}"#));
        assert!(!encoded.contains("error"));
    }

    #[test]
    fn error_response_carries_code() {
        let response = JsonRpcResponse::error(
            RequestId::String("abc".to_string()),
            JsonRpcError::method_not_found("nope"),
        );
        let encoded = serde_json::to_string(&response).unwrap();
        assert!(encoded.contains(r#""code":-32601"#));
        assert!(encoded.contains("Method not found"));
        assert!(!encoded.contains("result"));
    }

    #[test]
    fn string_and_number_ids_roundtrip() {
        let a: RequestId = serde_json::from_str("7").unwrap();
        assert_eq!(a, RequestId::Number(7));
        let b: RequestId = serde_json::from_str(r#""req-1""#).unwrap();
        assert_eq!(b, RequestId::String("req-1".to_string()));
    }
}
