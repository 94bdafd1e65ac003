//! JSON-RPC 2.0 parsing and MCP method validation.

use serde_json::Value;
use thiserror::Error;

use crate::event::{JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcMessageType};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("not a JSON object")]
    NotAnObject,
    #[error("not JSON-RPC 2.0")]
    NotJsonRpc,
    #[error("unknown JSON-RPC message shape")]
    UnknownShape,
    #[error("unknown MCP method: {0}")]
    UnknownMethod(String),
    #[error("request message has no id")]
    RequestWithoutId,
    #[error("notification message has id")]
    NotificationWithId,
}

/// MCP methods and their descriptions, per the 2025-06-18 protocol schema.
/// Everything else is rejected.
pub const MCP_METHODS: &[(&str, &str)] = &[
    // Lifecycle
    ("initialize", "Initialize connection"),
    ("ping", "Ping connection"),
    ("notifications/initialized", "Connection initialized"),
    ("notifications/cancelled", "Connection cancelled"),
    // Tools
    ("tools/list", "List available tools"),
    ("tools/call", "Execute a tool"),
    ("notifications/tools/list_changed", "Tool list changed"),
    // Resources
    ("resources/list", "List available resources"),
    ("resources/templates/list", "List available resource templates"),
    ("resources/read", "Read a resource"),
    ("resources/subscribe", "Subscribe to resource updates"),
    ("resources/unsubscribe", "Unsubscribe from resource updates"),
    ("notifications/resources/list_changed", "Resource list changed"),
    ("notifications/resources/updated", "Resource updated"),
    // Prompts
    ("prompts/list", "List available prompts"),
    ("prompts/get", "Get a prompt"),
    ("completion/complete", "Complete a prompt"),
    ("notifications/prompts/list_changed", "Prompt list changed"),
    // Notifications
    ("notifications/progress", "Progress update"),
    // Logging
    ("logging/setLevel", "Set logging level"),
    ("notifications/message", "Log message"),
    // Client capabilities
    ("sampling/createMessage", "Create LLM message"),
    ("elicitation/create", "Create elicitation"),
    ("roots/list", "List roots"),
    ("notifications/roots/list_changed", "Root list changed"),
];

/// Whether `method` is a known MCP method.
pub fn is_mcp_method(method: &str) -> bool {
    MCP_METHODS.iter().any(|&(m, _)| m == method)
}

/// Human-readable description of an MCP method.
pub fn method_description(method: &str) -> &'static str {
    MCP_METHODS
        .iter()
        .find(|&&(m, _)| m == method)
        .map(|&(_, d)| d)
        .unwrap_or("Unknown method")
}

fn parse_id(v: &Value) -> Option<JsonRpcId> {
    match v {
        Value::Number(n) => n.as_i64().map(JsonRpcId::Number),
        Value::String(s) => Some(JsonRpcId::String(s.clone())),
        _ => None,
    }
}

/// Parse one JSON-RPC 2.0 message.
///
/// Classification by field presence: `method`+`id` is a request, `id` +
/// (`result` | `error`) is a response, `method` alone is a notification.
/// Anything else is rejected.
pub fn parse(data: &[u8]) -> Result<JsonRpcMessage, ParseError> {
    let value: Value = serde_json::from_slice(data)?;
    let obj = value.as_object().ok_or(ParseError::NotAnObject)?;

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(ParseError::NotJsonRpc);
    }

    let has_method = obj.contains_key("method");
    let has_id = obj.contains_key("id");
    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");

    let params = obj
        .get("params")
        .and_then(Value::as_object)
        .cloned();

    if has_method && has_id {
        Ok(JsonRpcMessage {
            message_type: JsonRpcMessageType::Request,
            id: obj.get("id").and_then(parse_id),
            method: obj.get("method").and_then(Value::as_str).map(String::from),
            params,
            result: None,
            error: None,
            request: None,
        })
    } else if has_id && (has_result || has_error) {
        let error = obj.get("error").and_then(Value::as_object).map(|e| {
            JsonRpcError {
                code: e.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: e
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                data: e.get("data").cloned(),
            }
        });

        Ok(JsonRpcMessage {
            message_type: JsonRpcMessageType::Response,
            id: obj.get("id").and_then(parse_id),
            method: None,
            params: None,
            result: obj.get("result").cloned(),
            error,
            request: None,
        })
    } else if has_method {
        Ok(JsonRpcMessage {
            message_type: JsonRpcMessageType::Notification,
            id: None,
            method: obj.get("method").and_then(Value::as_str).map(String::from),
            params,
            result: None,
            error: None,
            request: None,
        })
    } else {
        Err(ParseError::UnknownShape)
    }
}

/// Validate a parsed message against the MCP protocol rules. Requests and
/// notifications must carry a known method; responses carry none.
pub fn validate_mcp(msg: &JsonRpcMessage) -> Result<(), ParseError> {
    match msg.message_type {
        JsonRpcMessageType::Request => {
            let method = msg.method.as_deref().unwrap_or("");
            if !is_mcp_method(method) {
                return Err(ParseError::UnknownMethod(method.to_string()));
            }
            if msg.id.is_none() {
                return Err(ParseError::RequestWithoutId);
            }
            Ok(())
        }
        JsonRpcMessageType::Response => {
            if msg.id.is_none() {
                return Err(ParseError::RequestWithoutId);
            }
            Ok(())
        }
        JsonRpcMessageType::Notification => {
            let method = msg.method.as_deref().unwrap_or("");
            if !is_mcp_method(method) {
                return Err(ParseError::UnknownMethod(method.to_string()));
            }
            if msg.id.is_some() {
                return Err(ParseError::NotificationWithId);
            }
            Ok(())
        }
    }
}
