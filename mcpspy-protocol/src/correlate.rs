//! MCP message assembly: multi-value JSON decoding, content-hash
//! deduplication with process-chain tracking, MCP validation, and
//! request/response correlation.
//!
//! Deduplication keys on the SHA-1 of the raw JSON bytes. The first
//! observer of a payload wins emission; later observers of the same bytes
//! (the docker-proxy pattern) only append their hop to the shared chain.
//!
//! Correlation pairs a response with its cached request by JSON-RPC id,
//! scoped to the normalized process pair for stdio and session-wide for
//! HTTP. Responses with no matching request are dropped.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use log::debug;
use serde_json::value::RawValue;
use sha1::{Digest, Sha1};

use crate::cache::ExpiringCache;
use crate::event::{
    FsAggregatedEvent, HttpRequestEvent, HttpResponseEvent, HttpTransport, JsonRpcMessage,
    JsonRpcMessageType, McpEvent, ProcessChain, ProcessHop, SseEvent, StdioTransport,
    TransportType,
};
use crate::jsonrpc;

const REQUEST_ID_CACHE_SIZE: usize = 4096;
const REQUEST_ID_CACHE_TTL: Duration = Duration::from_secs(5);
const SEEN_HASH_CACHE_SIZE: usize = 4096;
const SEEN_HASH_CACHE_TTL: Duration = Duration::from_secs(2);

/// Metadata for a message identified by content hash: the chain of
/// process hops it has been observed on.
struct MessageMetadata {
    chain: ProcessChain,
}

/// HTTP-transport input to the parser: a reassembled request, response,
/// or SSE record.
pub enum HttpInput<'a> {
    Request(&'a HttpRequestEvent),
    Response(&'a HttpResponseEvent),
    Sse(&'a SseEvent),
}

/// The JSON-RPC parser and correlator. Thread-safe; may be invoked from
/// any subscriber thread.
pub struct McpParser {
    request_id_cache: Mutex<ExpiringCache<String, JsonRpcMessage>>,
    seen_hash_cache: Mutex<ExpiringCache<String, MessageMetadata>>,
}

impl Default for McpParser {
    fn default() -> Self {
        McpParser::new()
    }
}

impl McpParser {
    pub fn new() -> Self {
        McpParser {
            request_id_cache: Mutex::new(ExpiringCache::new(
                REQUEST_ID_CACHE_SIZE,
                REQUEST_ID_CACHE_TTL,
            )),
            seen_hash_cache: Mutex::new(ExpiringCache::new(
                SEEN_HASH_CACHE_SIZE,
                SEEN_HASH_CACHE_TTL,
            )),
        }
    }

    /// Parse aggregated stdio data into MCP events.
    pub fn parse_stdio(&self, ev: &FsAggregatedEvent) -> Vec<McpEvent> {
        let mut out = Vec::new();

        for raw in split_json_values(&ev.payload) {
            let hop = ProcessHop {
                from_pid: ev.from_pid,
                from_comm: ev.from_comm.clone(),
                to_pid: ev.to_pid,
                to_comm: ev.to_comm.clone(),
                timestamp: Utc::now(),
            };

            let (chain, is_new) = self.track_message(&raw, hop);
            if !is_new {
                debug!(
                    "duplicate stdio message, hop added to chain {}",
                    chain.signature()
                );
                continue;
            }

            let mut msg = match jsonrpc::parse(raw.as_bytes()) {
                Ok(m) => m,
                Err(e) => {
                    debug!("failed to parse JSON-RPC: {}", e);
                    continue;
                }
            };
            if let Err(e) = jsonrpc::validate_mcp(&msg) {
                debug!("invalid MCP message: {}", e);
                continue;
            }

            if !self.correlate(&mut msg, Some(&chain)) {
                debug!(
                    "dropping response without matching request (chain {})",
                    chain.correlation_signature()
                );
                continue;
            }

            out.push(McpEvent {
                timestamp: Utc::now(),
                transport_type: TransportType::Stdio,
                stdio_transport: Some(StdioTransport {
                    from_pid: ev.from_pid,
                    from_comm: ev.from_comm.clone(),
                    to_pid: ev.to_pid,
                    to_comm: ev.to_comm.clone(),
                }),
                http_transport: None,
                process_chain: chain,
                message: msg,
                raw,
            });
        }

        out
    }

    /// Parse reassembled HTTP payload data into MCP events.
    pub fn parse_http(&self, input: HttpInput<'_>) -> Vec<McpEvent> {
        let (payload, pid, comm, host, is_request) = match &input {
            HttpInput::Request(ev) => (&ev.payload, ev.pid, &ev.comm, &ev.host, true),
            HttpInput::Response(ev) => (&ev.payload, ev.pid, &ev.comm, &ev.host, false),
            HttpInput::Sse(ev) => (&ev.data, ev.pid, &ev.comm, &ev.host, false),
        };

        let mut out = Vec::new();

        for raw in split_json_values(payload) {
            // HTTP has no intermediate processes; the hop is degenerate.
            let hop = ProcessHop {
                from_pid: pid,
                from_comm: comm.clone(),
                to_pid: pid,
                to_comm: comm.clone(),
                timestamp: Utc::now(),
            };

            let (chain, is_new) = self.track_message(&raw, hop);
            if !is_new {
                debug!("duplicate http message, skipping");
                continue;
            }

            let mut msg = match jsonrpc::parse(raw.as_bytes()) {
                Ok(m) => m,
                Err(e) => {
                    debug!("failed to parse JSON-RPC: {}", e);
                    continue;
                }
            };
            if let Err(e) = jsonrpc::validate_mcp(&msg) {
                debug!("invalid MCP message: {}", e);
                continue;
            }

            // Requests and responses arrive on different sides of the
            // proxying process for HTTP, so the chain is not part of the
            // correlation key.
            if !self.correlate(&mut msg, None) {
                debug!("dropping http response without matching request");
                continue;
            }

            out.push(McpEvent {
                timestamp: Utc::now(),
                transport_type: TransportType::Http,
                stdio_transport: None,
                http_transport: Some(HttpTransport {
                    pid,
                    comm: comm.clone(),
                    host: host.clone(),
                    is_request,
                }),
                process_chain: chain,
                message: msg,
                raw,
            });
        }

        out
    }

    /// Record a hop for this content hash. Returns the shared chain and
    /// whether this is the first observation of the payload.
    fn track_message(&self, raw: &str, hop: ProcessHop) -> (ProcessChain, bool) {
        let hash = content_hash(raw.as_bytes());
        let mut cache = self.seen_hash_cache.lock().unwrap();

        if let Some(meta) = cache.get(&hash) {
            let chain = meta.chain.clone();
            if chain.add_hop(hop) {
                debug!("added hop to message chain {}", chain.signature());
            }
            return (chain, false);
        }

        let chain = ProcessChain::new(hop);
        cache.insert(
            hash,
            MessageMetadata {
                chain: chain.clone(),
            },
        );
        (chain, true)
    }

    /// Cache requests and attach cached requests to responses. Returns
    /// false when a response has no matching request and must be dropped.
    fn correlate(&self, msg: &mut JsonRpcMessage, chain: Option<&ProcessChain>) -> bool {
        match msg.message_type {
            JsonRpcMessageType::Request => {
                if let Some(key) = cache_key(msg, chain) {
                    self.request_id_cache
                        .lock()
                        .unwrap()
                        .insert(key, msg.clone());
                }
                true
            }
            JsonRpcMessageType::Response => {
                let key = match cache_key(msg, chain) {
                    Some(k) => k,
                    None => return false,
                };
                let mut cache = self.request_id_cache.lock().unwrap();
                match cache.get(&key) {
                    Some(req) => {
                        msg.request = Some(Box::new(req.clone()));
                        true
                    }
                    None => false,
                }
            }
            // Notifications have no ids and never correlate.
            JsonRpcMessageType::Notification => true,
        }
    }

    /// Cache sizes (tests and diagnostics).
    pub fn cache_sizes(&self) -> (usize, usize) {
        (
            self.request_id_cache.lock().unwrap().len(),
            self.seen_hash_cache.lock().unwrap().len(),
        )
    }
}

/// SHA-1 of the raw JSON bytes, hex-encoded.
fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Correlation cache key: typed id plus the normalized process-pair
/// signature for stdio ("i:1|100<->200"), id alone for HTTP.
fn cache_key(msg: &JsonRpcMessage, chain: Option<&ProcessChain>) -> Option<String> {
    use crate::event::JsonRpcId;

    let base = match msg.id.as_ref()? {
        JsonRpcId::Number(n) => format!("i:{}", n),
        JsonRpcId::String(s) => format!("s:{}", s),
    };

    match chain {
        Some(chain) => {
            let sig = chain.correlation_signature();
            if sig.is_empty() {
                Some(base)
            } else {
                Some(format!("{}|{}", base, sig))
            }
        }
        None => Some(base),
    }
}

/// Split a buffer into the raw texts of its concatenated JSON values.
/// Decoding stops at the first syntax error; whitespace-only residue is
/// normal for newline-delimited streams.
fn split_json_values(data: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let stream = serde_json::Deserializer::from_slice(data).into_iter::<Box<RawValue>>();

    for value in stream {
        match value {
            Ok(raw) => {
                let text = raw.get().trim();
                if !text.is_empty() {
                    out.push(text.to_string());
                }
            }
            Err(e) => {
                if !out.is_empty() || !is_blank(data) {
                    debug!("json stream decode stopped: {}", e);
                }
                break;
            }
        }
    }

    out
}

fn is_blank(data: &[u8]) -> bool {
    data.iter().all(|b| b.is_ascii_whitespace())
}
