//! Per-SSL-session reassembly of TLS plaintext into discrete HTTP
//! requests, responses, and SSE records.
//!
//! Each SSL context pointer owns one `TlsSession` with independent send
//! and receive buffers. HTTP/1.1 messages are cut at header boundaries
//! and framed by Content-Length or chunked coding; HTTP/2 DATA frames are
//! coalesced per stream until END_STREAM. A `text/event-stream` response
//! flips the receive side into SSE mode.

use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;

use crate::event::{HttpRequestEvent, HttpResponseEvent, SseEvent};
use crate::http1::{self, BodyFraming, ChunkedBody};
use crate::http2::Http2Assembler;
use crate::sse::SseSplitter;

/// Direction of a captured TLS payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsDirection {
    /// SSL_write: client-to-server plaintext.
    Send,
    /// SSL_read: server-to-client plaintext.
    Recv,
}

/// Userspace form of a kernel TLS payload event.
#[derive(Debug, Clone)]
pub struct TlsPayloadInput {
    pub pid: u32,
    pub comm: String,
    pub ssl_ctx: u64,
    /// Kernel's HTTP version hint (0 = unknown).
    pub http_version: u8,
    pub direction: TlsDirection,
    pub payload: Vec<u8>,
}

/// Output of feeding one payload into the reassembler.
#[derive(Debug, Clone)]
pub enum SessionOutput {
    Request(HttpRequestEvent),
    Response(HttpResponseEvent),
    Sse(SseEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpVersion {
    H1,
    H2,
}

#[derive(Default)]
struct TlsSession {
    version: Option<HttpVersion>,
    /// Server-side sessions are ignored permanently.
    ignored: bool,
    /// Host header of the most recent request, stamped on responses.
    host: String,
    send_buf: Vec<u8>,
    recv_buf: Vec<u8>,
    send_h2: Http2Assembler,
    recv_h2: Http2Assembler,
    /// Set while the receive side is an SSE stream.
    sse: Option<SseSplitter>,
    /// The SSE stream uses chunked transfer coding.
    sse_chunked: bool,
}

/// Reassembles HTTP traffic for every live SSL session.
pub struct TlsSessionManager {
    sessions: Mutex<HashMap<u64, TlsSession>>,
}

impl Default for TlsSessionManager {
    fn default() -> Self {
        TlsSessionManager::new()
    }
}

impl TlsSessionManager {
    pub fn new() -> Self {
        TlsSessionManager {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live sessions (tests and diagnostics).
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Destroy a session on SSL_free; in-flight partial messages are
    /// discarded.
    pub fn handle_free(&self, ssl_ctx: u64) {
        self.sessions.lock().unwrap().remove(&ssl_ctx);
    }

    /// Feed one captured payload, returning every message it completes.
    pub fn handle_payload(&self, input: &TlsPayloadInput) -> Vec<SessionOutput> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.entry(input.ssl_ctx).or_default();

        if session.ignored {
            return Vec::new();
        }

        if session.version.is_none() {
            match classify(input) {
                Classified::Version(v) => session.version = Some(v),
                Classified::ServerSide => {
                    debug!(
                        "ssl_ctx {:#x}: server-side session, ignoring",
                        input.ssl_ctx
                    );
                    session.ignored = true;
                    return Vec::new();
                }
                Classified::Unknown => return Vec::new(),
            }
        }

        match session.version {
            Some(HttpVersion::H1) => match input.direction {
                TlsDirection::Send => drain_h1_requests(session, input),
                TlsDirection::Recv => drain_h1_responses(session, input),
            },
            Some(HttpVersion::H2) => drain_h2(session, input),
            _ => Vec::new(),
        }
    }
}

enum Classified {
    Version(HttpVersion),
    ServerSide,
    Unknown,
}

/// Decide the session's HTTP version, preferring the kernel's hint.
/// A request arriving on the receive side (or a response leaving on the
/// send side) marks the session as a server we do not observe.
fn classify(input: &TlsPayloadInput) -> Classified {
    let data = &input.payload;

    let looks_request =
        http1::looks_like_request(data) || data.starts_with(crate::http2::PREFACE);
    let looks_response = http1::looks_like_response(data);

    match input.direction {
        TlsDirection::Recv if looks_request => return Classified::ServerSide,
        TlsDirection::Send if looks_response => return Classified::ServerSide,
        _ => {}
    }

    match input.http_version {
        1 => return Classified::Version(HttpVersion::H1),
        2 => return Classified::Version(HttpVersion::H2),
        _ => {}
    }

    if data.starts_with(crate::http2::PREFACE) {
        Classified::Version(HttpVersion::H2)
    } else if looks_request || looks_response {
        Classified::Version(HttpVersion::H1)
    } else {
        Classified::Unknown
    }
}

/// Cut complete HTTP/1.1 requests off the front of the send buffer.
fn drain_h1_requests(session: &mut TlsSession, input: &TlsPayloadInput) -> Vec<SessionOutput> {
    session.send_buf.extend_from_slice(&input.payload);
    let mut out = Vec::new();

    loop {
        let head = match http1::parse_request_head(&session.send_buf) {
            Some(h) => h,
            None => break,
        };

        let rest = &session.send_buf[head.header_len..];
        let (body, total) = match http1::body_framing(&head.headers) {
            BodyFraming::ContentLength(n) => {
                if rest.len() < n {
                    break;
                }
                (rest[..n].to_vec(), head.header_len + n)
            }
            BodyFraming::Chunked => match http1::decode_chunked(rest) {
                ChunkedBody::Complete { body, consumed } => (body, head.header_len + consumed),
                ChunkedBody::Incomplete => break,
                ChunkedBody::Malformed => {
                    // Keep the payload rather than lose the message.
                    (rest.to_vec(), session.send_buf.len())
                }
            },
            BodyFraming::Unbounded => (rest.to_vec(), session.send_buf.len()),
        };

        if let Some(host) = head.headers.get("host") {
            session.host = host.clone();
        }

        out.push(SessionOutput::Request(HttpRequestEvent {
            pid: input.pid,
            comm: input.comm.clone(),
            ssl_ctx: input.ssl_ctx,
            host: session.host.clone(),
            method: head.method,
            path: head.path,
            payload: body,
        }));

        session.send_buf.drain(..total);
    }

    out
}

/// Cut complete HTTP/1.1 responses (or SSE records) off the front of the
/// receive buffer.
fn drain_h1_responses(session: &mut TlsSession, input: &TlsPayloadInput) -> Vec<SessionOutput> {
    session.recv_buf.extend_from_slice(&input.payload);
    let mut out = Vec::new();

    loop {
        if session.sse.is_some() {
            out.extend(drain_sse(session, input));
            if session.sse.is_some() {
                // Still streaming; everything buffered has been consumed.
                break;
            }
            continue;
        }

        let head = match http1::parse_response_head(&session.recv_buf) {
            Some(h) => h,
            None => break,
        };

        if http1::is_event_stream(&head.headers) {
            session.sse = Some(SseSplitter::new());
            session.sse_chunked =
                http1::body_framing(&head.headers) == BodyFraming::Chunked;
            session.recv_buf.drain(..head.header_len);

            out.push(SessionOutput::Response(HttpResponseEvent {
                pid: input.pid,
                comm: input.comm.clone(),
                ssl_ctx: input.ssl_ctx,
                host: session.host.clone(),
                status: head.status,
                payload: Vec::new(),
            }));
            continue;
        }

        let rest = &session.recv_buf[head.header_len..];
        let (body, total) = match http1::body_framing(&head.headers) {
            BodyFraming::ContentLength(n) => {
                if rest.len() < n {
                    break;
                }
                (rest[..n].to_vec(), head.header_len + n)
            }
            BodyFraming::Chunked => match http1::decode_chunked(rest) {
                ChunkedBody::Complete { body, consumed } => (body, head.header_len + consumed),
                ChunkedBody::Incomplete => break,
                ChunkedBody::Malformed => (rest.to_vec(), session.recv_buf.len()),
            },
            BodyFraming::Unbounded => (rest.to_vec(), session.recv_buf.len()),
        };

        out.push(SessionOutput::Response(HttpResponseEvent {
            pid: input.pid,
            comm: input.comm.clone(),
            ssl_ctx: input.ssl_ctx,
            host: session.host.clone(),
            status: head.status,
            payload: body,
        }));

        session.recv_buf.drain(..total);
    }

    out
}

/// Feed buffered receive bytes through the active SSE splitter,
/// de-chunking first when the stream is chunk-coded.
fn drain_sse(session: &mut TlsSession, input: &TlsPayloadInput) -> Vec<SessionOutput> {
    let mut records = Vec::new();
    let mut stream_ended = false;

    if session.sse_chunked {
        let drain = http1::drain_chunks(&session.recv_buf);
        if drain.malformed {
            // Fall back to the raw bytes so records are not lost.
            let raw: Vec<u8> = session.recv_buf.drain(..).collect();
            if let Some(splitter) = session.sse.as_mut() {
                records.extend(splitter.feed(&raw));
            }
        } else {
            if let Some(splitter) = session.sse.as_mut() {
                records.extend(splitter.feed(&drain.decoded));
            }
            session.recv_buf.drain(..drain.consumed);
            stream_ended = drain.ended;
        }
    } else {
        let raw: Vec<u8> = session.recv_buf.drain(..).collect();
        if let Some(splitter) = session.sse.as_mut() {
            records.extend(splitter.feed(&raw));
        }
    }

    if stream_ended {
        session.sse = None;
        session.sse_chunked = false;
    }

    records
        .into_iter()
        .map(|data| {
            SessionOutput::Sse(SseEvent {
                pid: input.pid,
                comm: input.comm.clone(),
                ssl_ctx: input.ssl_ctx,
                host: session.host.clone(),
                data,
            })
        })
        .collect()
}

/// HTTP/2: coalesce DATA frames per stream; emissions are requests on the
/// send side, responses on the receive side.
fn drain_h2(session: &mut TlsSession, input: &TlsPayloadInput) -> Vec<SessionOutput> {
    let messages = match input.direction {
        TlsDirection::Send => session.send_h2.feed(&input.payload),
        TlsDirection::Recv => session.recv_h2.feed(&input.payload),
    };

    messages
        .into_iter()
        .map(|msg| match input.direction {
            TlsDirection::Send => SessionOutput::Request(HttpRequestEvent {
                pid: input.pid,
                comm: input.comm.clone(),
                ssl_ctx: input.ssl_ctx,
                host: session.host.clone(),
                method: String::new(),
                path: String::new(),
                payload: msg.payload,
            }),
            TlsDirection::Recv => SessionOutput::Response(HttpResponseEvent {
                pid: input.pid,
                comm: input.comm.clone(),
                ssl_ctx: input.ssl_ctx,
                host: session.host.clone(),
                status: 0,
                payload: msg.payload,
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(ssl_ctx: u64, dir: TlsDirection, payload: &[u8]) -> TlsPayloadInput {
        TlsPayloadInput {
            pid: 42,
            comm: "python3".into(),
            ssl_ctx,
            http_version: 0,
            direction: dir,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn request_with_content_length() {
        let mgr = TlsSessionManager::new();
        let raw = b"POST /mcp HTTP/1.1\r\nHost: gw.example.com\r\nContent-Length: 17\r\n\r\n{\"jsonrpc\":\"2.0\"}";
        let out = mgr.handle_payload(&input(1, TlsDirection::Send, raw));
        assert_eq!(out.len(), 1);
        match &out[0] {
            SessionOutput::Request(req) => {
                assert_eq!(req.method, "POST");
                assert_eq!(req.host, "gw.example.com");
                assert_eq!(req.payload, b"{\"jsonrpc\":\"2.0\"}");
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn fragmented_request_reassembled() {
        let mgr = TlsSessionManager::new();
        let raw: &[u8] =
            b"POST /mcp HTTP/1.1\r\nHost: h\r\nContent-Length: 17\r\n\r\n{\"jsonrpc\":\"2.0\"}";
        assert!(mgr
            .handle_payload(&input(1, TlsDirection::Send, &raw[..30]))
            .is_empty());
        let out = mgr.handle_payload(&input(1, TlsDirection::Send, &raw[30..]));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn chunked_response_decoded() {
        let mgr = TlsSessionManager::new();
        // Establish client direction first.
        mgr.handle_payload(&input(
            1,
            TlsDirection::Send,
            b"POST /mcp HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n",
        ));
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n8\r\n{\"id\":1}\r\n0\r\n\r\n";
        let out = mgr.handle_payload(&input(1, TlsDirection::Recv, raw));
        assert_eq!(out.len(), 1);
        match &out[0] {
            SessionOutput::Response(resp) => {
                assert_eq!(resp.status, 200);
                assert_eq!(resp.payload, b"{\"id\":1}");
                assert_eq!(resp.host, "h");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn malformed_chunked_falls_back_to_raw() {
        let mgr = TlsSessionManager::new();
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nnot-hex\r\n{\"id\":1}";
        let out = mgr.handle_payload(&input(2, TlsDirection::Recv, raw));
        assert_eq!(out.len(), 1);
        match &out[0] {
            SessionOutput::Response(resp) => {
                assert_eq!(resp.payload, b"not-hex\r\n{\"id\":1}");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn sse_stream_produces_records() {
        let mgr = TlsSessionManager::new();
        mgr.handle_payload(&input(
            3,
            TlsDirection::Send,
            b"GET /events HTTP/1.1\r\nHost: sse.example.com\r\n\r\n",
        ));
        let head = b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n";
        let out = mgr.handle_payload(&input(3, TlsDirection::Recv, head));
        // The header alone yields the response event.
        assert_eq!(out.len(), 1);

        let out = mgr.handle_payload(&input(3, TlsDirection::Recv, b"data: {\"a\":1}\n\n"));
        assert_eq!(out.len(), 1);
        match &out[0] {
            SessionOutput::Sse(sse) => {
                assert_eq!(sse.data, b"{\"a\":1}");
                assert_eq!(sse.host, "sse.example.com");
                assert_eq!(sse.ssl_ctx, 3);
            }
            other => panic!("expected sse, got {:?}", other),
        }
    }

    #[test]
    fn server_side_session_ignored() {
        let mgr = TlsSessionManager::new();
        // A request arriving on the read side means we are inside a server.
        let out = mgr.handle_payload(&input(
            4,
            TlsDirection::Recv,
            b"POST /mcp HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n",
        ));
        assert!(out.is_empty());
        // Even well-formed client traffic is dropped afterwards.
        let out = mgr.handle_payload(&input(
            4,
            TlsDirection::Send,
            b"POST /mcp HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n",
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn http2_data_frames_emitted() {
        let mgr = TlsSessionManager::new();
        let mut raw = crate::http2::PREFACE.to_vec();
        // DATA frame, END_STREAM, stream 1.
        let body = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}";
        raw.push((body.len() >> 16) as u8);
        raw.push((body.len() >> 8) as u8);
        raw.push(body.len() as u8);
        raw.push(0); // DATA
        raw.push(1); // END_STREAM
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.extend_from_slice(body);

        let out = mgr.handle_payload(&input(5, TlsDirection::Send, &raw));
        assert_eq!(out.len(), 1);
        match &out[0] {
            SessionOutput::Request(req) => assert_eq!(req.payload, body),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn free_discards_partial_state() {
        let mgr = TlsSessionManager::new();
        mgr.handle_payload(&input(
            6,
            TlsDirection::Send,
            b"POST /mcp HTTP/1.1\r\nHost: h\r\nContent-Length: 100\r\n\r\n{\"partial",
        ));
        assert_eq!(mgr.session_count(), 1);
        mgr.handle_free(6);
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn kernel_version_hint_respected() {
        let mgr = TlsSessionManager::new();
        let mut ev = input(7, TlsDirection::Send, b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 2\r\n\r\n{}");
        ev.http_version = 1;
        let out = mgr.handle_payload(&ev);
        assert_eq!(out.len(), 1);
    }
}
