//! End-to-end pipeline scenarios: raw capture fragments in, correlated
//! MCP events out.

use mcpspy_protocol::event::StdioDirection;
use mcpspy_protocol::{
    FsSessionManager, HttpInput, JsonRpcMessageType, McpParser, RawDataEvent, SessionOutput,
    TlsDirection, TlsPayloadInput, TlsSessionManager, TransportType,
};

fn write_event(from: u32, to: u32, payload: &[u8]) -> RawDataEvent {
    RawDataEvent {
        direction: StdioDirection::Write,
        pid: from,
        comm: format!("p{}", from),
        file_ptr: 0x1000 + u64::from(from),
        from_pid: from,
        from_comm: format!("p{}", from),
        to_pid: to,
        to_comm: format!("p{}", to),
        payload: payload.to_vec(),
    }
}

fn read_event(reader: u32, writer: u32, payload: &[u8]) -> RawDataEvent {
    RawDataEvent {
        direction: StdioDirection::Read,
        pid: reader,
        comm: format!("p{}", reader),
        file_ptr: 0x2000 + u64::from(reader),
        from_pid: writer,
        from_comm: format!("p{}", writer),
        to_pid: reader,
        to_comm: format!("p{}", reader),
        payload: payload.to_vec(),
    }
}

/// Scenario 1: stdio initialize request and response correlate into a
/// pair sharing the normalized process signature.
#[test]
fn stdio_initialize_round_trip() {
    let fs = FsSessionManager::new();
    let parser = McpParser::new();

    let req = fs
        .handle_data(&write_event(
            100,
            200,
            br#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{}}}"#,
        ))
        .expect("request aggregates");
    let req_events = parser.parse_stdio(&req);
    assert_eq!(req_events.len(), 1);
    assert_eq!(req_events[0].message.message_type, JsonRpcMessageType::Request);

    let resp = fs
        .handle_data(&read_event(
            100,
            200,
            br#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}"#,
        ))
        .expect("response aggregates");
    let resp_events = parser.parse_stdio(&resp);
    assert_eq!(resp_events.len(), 1);

    let ev = &resp_events[0];
    assert_eq!(ev.transport_type, TransportType::Stdio);
    assert_eq!(ev.message.message_type, JsonRpcMessageType::Response);
    let embedded = ev.message.request.as_ref().expect("embedded request");
    assert_eq!(embedded.method.as_deref(), Some("initialize"));
    assert_eq!(ev.process_chain.correlation_signature(), "100<->200");
}

/// Scenario 2: a tools/call split over three writes produces exactly one
/// request event.
#[test]
fn fragmented_stdio_tools_call() {
    let fs = FsSessionManager::new();
    let parser = McpParser::new();

    let fragments: [&[u8]; 3] = [
        br#"{"jsonrpc":"2.0","id":"#,
        br#"2,"method":"tools/call","params":{"name":"fs.read""#,
        b"}}",
    ];

    let mut events = Vec::new();
    for frag in fragments {
        if let Some(agg) = fs.handle_data(&write_event(100, 200, frag)) {
            events.extend(parser.parse_stdio(&agg));
        }
    }

    assert_eq!(events.len(), 1);
    let msg = &events[0].message;
    assert_eq!(msg.message_type, JsonRpcMessageType::Request);
    assert_eq!(msg.method.as_deref(), Some("tools/call"));
    assert_eq!(
        msg.id,
        Some(mcpspy_protocol::JsonRpcId::Number(2))
    );
}

/// Scenario 3: the same bytes observed on two hops (docker-proxy) emit
/// once, with both hops on the chain in first-seen order.
#[test]
fn duplicate_through_proxy_builds_chain() {
    let fs = FsSessionManager::new();
    let parser = McpParser::new();

    let payload: &[u8] = br#"{"jsonrpc":"2.0","id":4,"method":"tools/list"}"#;

    let first = fs.handle_data(&write_event(100, 200, payload)).unwrap();
    let emitted = parser.parse_stdio(&first);
    assert_eq!(emitted.len(), 1);

    let second = fs.handle_data(&write_event(200, 300, payload)).unwrap();
    assert!(parser.parse_stdio(&second).is_empty());

    let hops = emitted[0].process_chain.hops();
    assert_eq!(hops.len(), 2);
    assert_eq!((hops[0].from_pid, hops[0].to_pid), (100, 200));
    assert_eq!((hops[1].from_pid, hops[1].to_pid), (200, 300));
}

/// Scenario 4: a response with no cached request vanishes.
#[test]
fn unmatched_response_is_dropped() {
    let fs = FsSessionManager::new();
    let parser = McpParser::new();

    let agg = fs
        .handle_data(&read_event(100, 200, br#"{"jsonrpc":"2.0","id":9999,"result":{}}"#))
        .unwrap();
    assert!(parser.parse_stdio(&agg).is_empty());
}

/// Scenario 5: notifications pass through without touching the
/// correlation cache.
#[test]
fn notification_never_correlates() {
    let fs = FsSessionManager::new();
    let parser = McpParser::new();

    let agg = fs
        .handle_data(&write_event(
            100,
            200,
            br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        ))
        .unwrap();
    let events = parser.parse_stdio(&agg);
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].message.message_type,
        JsonRpcMessageType::Notification
    );
    assert_eq!(parser.cache_sizes().0, 0);
}

/// Scenario 6: a TLS session carrying a request and a chunked JSON
/// response yields an http-transport MCP pair.
#[test]
fn tls_chunked_response_round_trip() {
    let tls = TlsSessionManager::new();
    let parser = McpParser::new();

    let request = b"POST /mcp HTTP/1.1\r\nHost: gateway.example.com\r\nContent-Type: application/json\r\nContent-Length: 40\r\n\r\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}";
    let send = TlsPayloadInput {
        pid: 42,
        comm: "python3".into(),
        ssl_ctx: 0xbeef,
        http_version: 1,
        direction: TlsDirection::Send,
        payload: request.to_vec(),
    };
    let outputs = tls.handle_payload(&send);
    assert_eq!(outputs.len(), 1);

    let mut mcp_events = Vec::new();
    for out in &outputs {
        match out {
            SessionOutput::Request(req) => {
                mcp_events.extend(parser.parse_http(HttpInput::Request(req)));
            }
            other => panic!("expected request, got {:?}", other),
        }
    }
    assert_eq!(mcp_events.len(), 1);

    let body = br#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
    let mut chunked = format!("{:x}\r\n", body.len()).into_bytes();
    chunked.extend_from_slice(body);
    chunked.extend_from_slice(b"\r\n0\r\n\r\n");
    let mut response = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    response.extend_from_slice(&chunked);

    let recv = TlsPayloadInput {
        pid: 42,
        comm: "python3".into(),
        ssl_ctx: 0xbeef,
        http_version: 1,
        direction: TlsDirection::Recv,
        payload: response,
    };
    let outputs = tls.handle_payload(&recv);
    assert_eq!(outputs.len(), 1);

    for out in &outputs {
        match out {
            SessionOutput::Response(resp) => {
                assert_eq!(resp.status, 200);
                assert_eq!(resp.host, "gateway.example.com");
                mcp_events.extend(parser.parse_http(HttpInput::Response(resp)));
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    assert_eq!(mcp_events.len(), 2);
    let resp_ev = &mcp_events[1];
    assert_eq!(resp_ev.transport_type, TransportType::Http);
    assert!(resp_ev.message.request.is_some());
}

/// Boundary: identical inputs delivered at different chunk sizes produce
/// identical aggregation; an input past 64 KiB drops cleanly.
#[test]
fn chunk_size_boundaries() {
    let payload = {
        let mut p = br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"data":""#.to_vec();
        p.extend(std::iter::repeat(b'x').take(40_000));
        p.extend_from_slice(b"\"}}");
        p
    };

    let mut outputs = Vec::new();
    for chunk_size in [1usize, 64, 4096, 65_535] {
        let fs = FsSessionManager::new();
        let mut emitted = None;
        for piece in payload.chunks(chunk_size) {
            if let Some(agg) = fs.handle_data(&write_event(100, 200, piece)) {
                assert!(emitted.is_none(), "double emission at chunk {}", chunk_size);
                emitted = Some(agg.payload);
            }
        }
        outputs.push(emitted.expect("payload under the cap must aggregate"));
    }
    assert!(outputs.windows(2).all(|w| w[0] == w[1]));

    // 65 537 bytes of one stream drop cleanly: no emission, no state.
    let fs = FsSessionManager::new();
    let mut big = br#"{"data":""#.to_vec();
    big.extend(std::iter::repeat(b'y').take(65_537 - big.len() - 2));
    big.extend_from_slice(b"\"}");
    assert_eq!(big.len(), 65_537);
    let mut emitted = 0;
    for piece in big.chunks(4096) {
        if fs.handle_data(&write_event(100, 201, piece)).is_some() {
            emitted += 1;
        }
    }
    assert_eq!(emitted, 0);
    assert_eq!(fs.stream_count(), 0);
}

/// Round-trip law: serializing and re-parsing an emitted event yields an
/// equal event.
#[test]
fn mcp_event_serde_round_trip() {
    let fs = FsSessionManager::new();
    let parser = McpParser::new();

    let agg = fs
        .handle_data(&write_event(
            100,
            200,
            br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"fs.read"}}"#,
        ))
        .unwrap();
    let events = parser.parse_stdio(&agg);
    let ev = &events[0];

    let json = serde_json::to_string(ev).unwrap();
    let back: mcpspy_protocol::McpEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(&back, ev);
}
