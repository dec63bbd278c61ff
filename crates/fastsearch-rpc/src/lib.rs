pub mod frame;

pub use frame::{FrameError, MAX_FRAME_LEN, read_frame, write_frame};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl JsonRpcRequest {
    pub fn new(method: &str, params: Value, id: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Error codes on the wire.
pub const ERR_PARSE: i64 = -32700;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_SERVER: i64 = -32000;

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trip() {
        let req = JsonRpcRequest::new("ping", json!({}), json!(1));
        let serialized = serde_json::to_string(&req).expect("serialize");
        let back: JsonRpcRequest = serde_json::from_str(&serialized).expect("deserialize");
        assert_eq!(back.method, "ping");
        assert_eq!(back.id, json!(1));
    }

    #[test]
    fn missing_params_default_to_null() {
        let back: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"ping","id":7}"#).unwrap();
        assert!(back.params.is_null());
        assert_eq!(back.id, json!(7));
    }

    #[test]
    fn success_response_has_no_error() {
        let resp = JsonRpcResponse::success(json!(42), json!({"ok": true}));
        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap()["ok"], true);
        let text = serde_json::to_string(&JsonRpcResponse::success(json!(1), json!(null))).unwrap();
        assert!(!text.contains("error"));
    }

    #[test]
    fn error_response_has_no_result() {
        let resp = JsonRpcResponse::error(json!(1), ERR_METHOD_NOT_FOUND, "Method not found");
        assert!(resp.result.is_none());
        assert_eq!(resp.error.as_ref().unwrap().code, -32601);
    }

    #[test]
    fn parse_error_code_is_standard() {
        let resp = JsonRpcResponse::error(Value::Null, ERR_PARSE, "Parse error");
        assert_eq!(resp.error.as_ref().unwrap().code, -32700);
        assert!(resp.id.is_null());
    }
}
