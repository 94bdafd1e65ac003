//! Reconstructs Model Context Protocol conversations from raw capture
//! events — no sockets, no files, just bytes in and correlated messages
//! out.
//!
//! MCP traffic is JSON-RPC 2.0 over one of two transports: stdio pipes
//! between a client and a child server process, or HTTPS to a remote
//! gateway. The capture layer (eBPF, in `mcpspy-agent`) delivers raw
//! fragments of both; this crate turns them into a canonical event
//! stream:
//!
//! 1. [`stdio`] aggregates pipe fragments into balanced JSON buffers,
//!    keyed by (pid, file pointer), using the same bracket-counting rule
//!    the kernel applies.
//! 2. [`tls_session`] reassembles TLS plaintext per SSL context into
//!    discrete HTTP/1.1 messages ([`http1`]), HTTP/2 streams
//!    ([`http2`]), and Server-Sent Events records ([`sse`]).
//! 3. [`jsonrpc`] parses and validates JSON-RPC 2.0 against the MCP
//!    method list, and [`correlate`] deduplicates payloads by content
//!    hash, tracks multi-hop process chains (client → docker-proxy →
//!    server), and pairs responses with their requests.
//!
//! Everything here is pure and synchronous, which is what makes the
//! pipeline testable: each stage is a state machine fed with byte
//! buffers. Wiring, I/O, and the event bus live in the agent.

/// Capacity-bounded expiring caches for dedup and correlation windows.
pub mod cache;
/// Content-hash dedup, process-chain tracking, request/response pairing.
pub mod correlate;
/// Event model: process chains, JSON-RPC messages, MCP events.
pub mod event;
/// HTTP/1.1 head parsing and body framing via nom.
pub mod http1;
/// Minimal HTTP/2 frame parsing and per-stream coalescing.
pub mod http2;
/// JSON-RPC 2.0 parsing and the MCP method allow-list.
pub mod jsonrpc;
/// Session identity and deterministic session ids.
pub mod session;
/// Server-Sent Events record splitting.
pub mod sse;
/// Userspace stdio stream aggregation.
pub mod stdio;
/// Per-SSL-session HTTP reassembly.
pub mod tls_session;

pub use correlate::{HttpInput, McpParser};
pub use event::{
    FsAggregatedEvent, HttpRequestEvent, HttpResponseEvent, JsonRpcId, JsonRpcMessage,
    JsonRpcMessageType, McpEvent, ProcessChain, ProcessHop, SseEvent, StdioDirection,
    TransportType,
};
pub use stdio::{FsSessionManager, RawDataEvent};
pub use tls_session::{SessionOutput, TlsDirection, TlsPayloadInput, TlsSessionManager};
