//! The userspace event model: process hops and chains, JSON-RPC messages,
//! the intermediate pipeline events, and the final `McpEvent`.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport a message was captured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Stdio,
    Http,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Stdio => write!(f, "stdio"),
            TransportType::Http => write!(f, "http"),
        }
    }
}

/// One delivery leg of a message between two processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessHop {
    pub from_pid: u32,
    pub from_comm: String,
    pub to_pid: u32,
    pub to_comm: String,
    pub timestamp: DateTime<Utc>,
}

/// The ordered chain of hops one message traveled through.
///
/// The hop list is shared: the dedup cache and every emitted event hold
/// the same chain, so a hop observed after emission still enriches the
/// already-emitted event. For a message going client (100) -> proxy (200)
/// -> server (300) the chain holds [100->200, 200->300].
#[derive(Debug, Clone, Default)]
pub struct ProcessChain {
    hops: Arc<Mutex<Vec<ProcessHop>>>,
}

impl ProcessChain {
    pub fn new(first: ProcessHop) -> Self {
        ProcessChain {
            hops: Arc::new(Mutex::new(vec![first])),
        }
    }

    pub fn from_hops(hops: Vec<ProcessHop>) -> Self {
        ProcessChain {
            hops: Arc::new(Mutex::new(hops)),
        }
    }

    /// Append a hop unless an identical (from_pid, to_pid) leg is already
    /// present. Returns whether the hop was added.
    pub fn add_hop(&self, hop: ProcessHop) -> bool {
        let mut hops = self.hops.lock().unwrap();
        if hops
            .iter()
            .any(|h| h.from_pid == hop.from_pid && h.to_pid == hop.to_pid)
        {
            return false;
        }
        hops.push(hop);
        true
    }

    /// Snapshot of the hops in first-seen order.
    pub fn hops(&self) -> Vec<ProcessHop> {
        self.hops.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.hops.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.lock().unwrap().is_empty()
    }

    /// Unique representation of the chain: "from->to|from->to|...".
    pub fn signature(&self) -> String {
        let hops = self.hops.lock().unwrap();
        hops.iter()
            .map(|h| format!("{}->{}", h.from_pid, h.to_pid))
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Direction-independent signature for request/response pairing.
    ///
    /// A request (A->B) and its response (B->A) flow in opposite
    /// directions over the same pair, so the first hop's endpoints are
    /// sorted: "min<->max".
    pub fn correlation_signature(&self) -> String {
        let hops = self.hops.lock().unwrap();
        match hops.first() {
            Some(hop) => {
                let (a, b) = if hop.from_pid <= hop.to_pid {
                    (hop.from_pid, hop.to_pid)
                } else {
                    (hop.to_pid, hop.from_pid)
                };
                format!("{}<->{}", a, b)
            }
            None => String::new(),
        }
    }

    /// PID of the original sender (first hop).
    pub fn source_pid(&self) -> u32 {
        self.hops.lock().unwrap().first().map_or(0, |h| h.from_pid)
    }

    /// PID of the final receiver (last hop).
    pub fn dest_pid(&self) -> u32 {
        self.hops.lock().unwrap().last().map_or(0, |h| h.to_pid)
    }
}

impl PartialEq for ProcessChain {
    fn eq(&self, other: &Self) -> bool {
        self.hops() == other.hops()
    }
}

impl Serialize for ProcessChain {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Repr<'a> {
            hops: &'a [ProcessHop],
        }
        let hops = self.hops.lock().unwrap();
        Repr { hops: &hops }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ProcessChain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr {
            #[serde(default)]
            hops: Vec<ProcessHop>,
        }
        let repr = Repr::deserialize(deserializer)?;
        Ok(ProcessChain::from_hops(repr.hops))
    }
}

/// Stdio endpoints of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioTransport {
    pub from_pid: u32,
    pub from_comm: String,
    pub to_pid: u32,
    pub to_comm: String,
}

/// HTTP endpoint of a message (one side only: we observe the client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTransport {
    pub pid: u32,
    pub comm: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    pub is_request: bool,
}

/// Kind of a JSON-RPC 2.0 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonRpcMessageType {
    Request,
    Response,
    Notification,
}

impl fmt::Display for JsonRpcMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonRpcMessageType::Request => write!(f, "request"),
            JsonRpcMessageType::Response => write!(f, "response"),
            JsonRpcMessageType::Notification => write!(f, "notification"),
        }
    }
}

/// JSON-RPC id: a string or an integer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
}

impl fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonRpcId::Number(n) => write!(f, "{}", n),
            JsonRpcId::String(s) => write!(f, "{}", s),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A parsed JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(rename = "type")]
    pub message_type: JsonRpcMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// For responses: the request this response answers, attached during
    /// correlation. Always None for requests and notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Box<JsonRpcMessage>>,
}

impl JsonRpcMessage {
    /// Tool name of a tools/call request, if that is what this is.
    pub fn tool_name(&self) -> Option<&str> {
        if self.method.as_deref() != Some("tools/call") {
            return None;
        }
        self.params.as_ref()?.get("name")?.as_str()
    }

    /// Resource URI of a resources/read|subscribe|unsubscribe request.
    pub fn resource_uri(&self) -> Option<&str> {
        match self.method.as_deref() {
            Some("resources/read") | Some("resources/subscribe")
            | Some("resources/unsubscribe") => {}
            _ => return None,
        }
        self.params.as_ref()?.get("uri")?.as_str()
    }
}

/// A fully reconstructed and correlated MCP message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpEvent {
    pub timestamp: DateTime<Utc>,
    pub transport_type: TransportType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdio_transport: Option<StdioTransport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_transport: Option<HttpTransport>,
    pub process_chain: ProcessChain,
    #[serde(flatten)]
    pub message: JsonRpcMessage,
    pub raw: String,
}

// ---------------------------------------------------------------------------
// Intermediate pipeline events
// ---------------------------------------------------------------------------

/// Direction of a stdio operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioDirection {
    Read,
    Write,
}

/// An aggregated stdio JSON payload with resolved pipe endpoints.
#[derive(Debug, Clone)]
pub struct FsAggregatedEvent {
    pub direction: StdioDirection,
    pub pid: u32,
    pub comm: String,
    pub from_pid: u32,
    pub from_comm: String,
    pub to_pid: u32,
    pub to_comm: String,
    pub payload: Vec<u8>,
}

/// A complete HTTP request reassembled from a TLS session.
#[derive(Debug, Clone)]
pub struct HttpRequestEvent {
    pub pid: u32,
    pub comm: String,
    pub ssl_ctx: u64,
    pub host: String,
    pub method: String,
    pub path: String,
    pub payload: Vec<u8>,
}

/// A complete HTTP response reassembled from a TLS session.
#[derive(Debug, Clone)]
pub struct HttpResponseEvent {
    pub pid: u32,
    pub comm: String,
    pub ssl_ctx: u64,
    pub host: String,
    pub status: u16,
    pub payload: Vec<u8>,
}

/// One `data:` record of a Server-Sent Events stream.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub pid: u32,
    pub comm: String,
    pub ssl_ctx: u64,
    pub host: String,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(from: u32, to: u32) -> ProcessHop {
        ProcessHop {
            from_pid: from,
            from_comm: format!("p{}", from),
            to_pid: to,
            to_comm: format!("p{}", to),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn chain_signature_format() {
        let chain = ProcessChain::new(hop(100, 200));
        chain.add_hop(hop(200, 300));
        assert_eq!(chain.signature(), "100->200|200->300");
    }

    #[test]
    fn correlation_signature_is_direction_independent() {
        let req = ProcessChain::new(hop(100, 200));
        let resp = ProcessChain::new(hop(200, 100));
        assert_eq!(req.correlation_signature(), "100<->200");
        assert_eq!(req.correlation_signature(), resp.correlation_signature());
    }

    #[test]
    fn duplicate_hop_not_added() {
        let chain = ProcessChain::new(hop(100, 200));
        assert!(!chain.add_hop(hop(100, 200)));
        assert_eq!(chain.len(), 1);
        assert!(chain.add_hop(hop(200, 300)));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn source_and_dest_pids() {
        let chain = ProcessChain::new(hop(100, 200));
        chain.add_hop(hop(200, 300));
        assert_eq!(chain.source_pid(), 100);
        assert_eq!(chain.dest_pid(), 300);
    }

    #[test]
    fn empty_chain_signatures() {
        let chain = ProcessChain::from_hops(vec![]);
        assert_eq!(chain.signature(), "");
        assert_eq!(chain.correlation_signature(), "");
        assert_eq!(chain.source_pid(), 0);
        assert_eq!(chain.dest_pid(), 0);
    }

    #[test]
    fn shared_chain_enriches_after_clone() {
        // The metadata cache and an emitted event share the same chain.
        let chain = ProcessChain::new(hop(100, 200));
        let emitted = chain.clone();
        chain.add_hop(hop(200, 300));
        assert_eq!(emitted.len(), 2);
    }

    #[test]
    fn chain_serializes_hops() {
        let chain = ProcessChain::new(hop(100, 200));
        let json = serde_json::to_value(&chain).unwrap();
        assert_eq!(json["hops"][0]["from_pid"], 100);
        assert_eq!(json["hops"][0]["to_pid"], 200);
    }

    #[test]
    fn jsonrpc_id_serialization() {
        assert_eq!(
            serde_json::to_string(&JsonRpcId::Number(42)).unwrap(),
            "42"
        );
        assert_eq!(
            serde_json::to_string(&JsonRpcId::String("abc".into())).unwrap(),
            "\"abc\""
        );
    }

    #[test]
    fn tool_name_extraction() {
        let mut params = serde_json::Map::new();
        params.insert("name".into(), Value::String("fs.read".into()));
        let msg = JsonRpcMessage {
            message_type: JsonRpcMessageType::Request,
            id: Some(JsonRpcId::Number(1)),
            method: Some("tools/call".into()),
            params: Some(params),
            result: None,
            error: None,
            request: None,
        };
        assert_eq!(msg.tool_name(), Some("fs.read"));
        assert_eq!(msg.resource_uri(), None);
    }
}
