//! HTTP/1.1 message parsing: request/status lines and headers via nom,
//! body framing via Content-Length or chunked transfer coding.

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{char, space1},
    combinator::opt,
    sequence::tuple,
    IResult,
};
use std::collections::HashMap;

/// Parsed head of an HTTP/1.x request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: String,
    /// Headers with lowercased names.
    pub headers: HashMap<String, String>,
    /// Byte offset where the body starts.
    pub header_len: usize,
}

/// Parsed head of an HTTP/1.x response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
    pub header_len: usize,
}

/// How the message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    ContentLength(usize),
    Chunked,
    /// Neither header present: body runs to whatever is buffered.
    Unbounded,
}

/// Result of decoding a chunked body prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkedBody {
    /// Terminal chunk seen; `consumed` covers through the final CRLF.
    Complete { body: Vec<u8>, consumed: usize },
    /// More chunks expected.
    Incomplete,
    /// Chunk framing did not parse.
    Malformed,
}

/// Quick check: does this look like the start of an HTTP request?
pub fn looks_like_request(data: &[u8]) -> bool {
    const METHODS: &[&[u8]] = &[
        b"GET ",
        b"POST ",
        b"PUT ",
        b"DELETE ",
        b"PATCH ",
        b"HEAD ",
        b"OPTIONS ",
        b"CONNECT ",
    ];
    METHODS.iter().any(|m| data.starts_with(m))
}

/// Quick check: does this look like the start of an HTTP response?
pub fn looks_like_response(data: &[u8]) -> bool {
    data.starts_with(b"HTTP/1.0 ") || data.starts_with(b"HTTP/1.1 ")
}

fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&c)
}

fn parse_method(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(|c: u8| c.is_ascii_uppercase())(input)
}

#[allow(clippy::type_complexity)]
fn parse_request_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (input, method) = parse_method(input)?;
    let (input, _) = space1(input)?;
    let (input, path) = take_while1(|c: u8| c != b' ' && c != b'\r' && c != b'\n')(input)?;
    let (input, _) = space1(input)?;
    let (input, version) = take_while1(|c: u8| c != b'\r' && c != b'\n')(input)?;
    let (input, _) = tag(b"\r\n")(input)?;
    Ok((input, (method, path, version)))
}

#[allow(clippy::type_complexity)]
fn parse_status_line(input: &[u8]) -> IResult<&[u8], (&[u8], u16, &[u8])> {
    let (input, version) = take_while1(|c: u8| c != b' ' && c != b'\r')(input)?;
    let (input, _) = space1(input)?;
    let (input, code_bytes) = take_while1(|c: u8| c.is_ascii_digit())(input)?;
    let code: u16 = std::str::from_utf8(code_bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let (input, _) = opt(space1)(input)?;
    // Reason phrase is optional and runs to CRLF.
    let (input, reason) =
        take_while1::<_, _, nom::error::Error<&[u8]>>(|c: u8| c != b'\r' && c != b'\n')(input)
            .unwrap_or((input, b"" as &[u8]));
    let (input, _) = tag(b"\r\n")(input)?;
    Ok((input, (version, code, reason)))
}

fn parse_header(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (input, name) = take_while1(is_token_char)(input)?;
    let (input, _) = tuple((char(':'), opt(space1)))(input)?;
    let (input, value) = take_while1(|c: u8| c != b'\r' && c != b'\n')(input)?;
    let (input, _) = tag(b"\r\n")(input)?;
    Ok((input, (name, value)))
}

/// Parse headers until the blank line. Returns None when the terminator
/// has not arrived yet (or a header is malformed mid-buffer).
fn parse_headers(mut input: &[u8]) -> Option<(HashMap<String, String>, &[u8])> {
    let mut headers = HashMap::new();

    loop {
        if input.starts_with(b"\r\n") {
            return Some((headers, &input[2..]));
        }
        if input.is_empty() {
            return None;
        }

        match parse_header(input) {
            Ok((rest, (name, value))) => {
                let name = String::from_utf8_lossy(name).to_lowercase();
                let value = String::from_utf8_lossy(value).to_string();
                headers.insert(name, value);
                input = rest;
            }
            Err(_) => return None,
        }
    }
}

/// Parse a complete request head. None until the full header block
/// (terminated by `\r\n\r\n`) is buffered.
pub fn parse_request_head(data: &[u8]) -> Option<RequestHead> {
    let (rest, (method, path, version)) = parse_request_line(data).ok()?;
    let (headers, body) = parse_headers(rest)?;

    Some(RequestHead {
        method: String::from_utf8_lossy(method).to_string(),
        path: String::from_utf8_lossy(path).to_string(),
        version: String::from_utf8_lossy(version).to_string(),
        headers,
        header_len: data.len() - body.len(),
    })
}

/// Parse a complete response head. None until the full header block is
/// buffered.
pub fn parse_response_head(data: &[u8]) -> Option<ResponseHead> {
    let (rest, (version, status, reason)) = parse_status_line(data).ok()?;
    let (headers, body) = parse_headers(rest)?;

    Some(ResponseHead {
        version: String::from_utf8_lossy(version).to_string(),
        status,
        reason: String::from_utf8_lossy(reason).to_string(),
        headers,
        header_len: data.len() - body.len(),
    })
}

/// Decide how the body is delimited from the parsed headers.
pub fn body_framing(headers: &HashMap<String, String>) -> BodyFraming {
    if let Some(te) = headers.get("transfer-encoding") {
        if te.to_lowercase().contains("chunked") {
            return BodyFraming::Chunked;
        }
    }
    if let Some(cl) = headers.get("content-length") {
        if let Ok(n) = cl.trim().parse::<usize>() {
            return BodyFraming::ContentLength(n);
        }
    }
    BodyFraming::Unbounded
}

/// Whether the response head announces a Server-Sent Events stream.
pub fn is_event_stream(headers: &HashMap<String, String>) -> bool {
    headers
        .get("content-type")
        .map(|ct| ct.to_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

/// Decode a chunked body from the start of `data`.
///
/// Malformed framing is reported rather than guessed at; the caller falls
/// back to the raw bytes so MCP payloads are not lost.
pub fn decode_chunked(data: &[u8]) -> ChunkedBody {
    let mut body = Vec::new();
    let mut offset = 0usize;

    loop {
        let line_end = match find(&data[offset..], b"\r\n") {
            Some(i) => i,
            None => return ChunkedBody::Incomplete,
        };

        // Chunk extensions after ';' are ignored.
        let size_line = &data[offset..offset + line_end];
        let size_str = match std::str::from_utf8(size_line) {
            Ok(s) => s.split(';').next().unwrap_or("").trim(),
            Err(_) => return ChunkedBody::Malformed,
        };
        let chunk_size = match usize::from_str_radix(size_str, 16) {
            Ok(n) => n,
            Err(_) => return ChunkedBody::Malformed,
        };

        offset += line_end + 2;

        if chunk_size == 0 {
            // Terminal chunk. Tolerate missing or malformed trailers: the
            // body is complete either way.
            let consumed = match find(&data[offset..], b"\r\n") {
                Some(i) => offset + i + 2,
                None => offset,
            };
            return ChunkedBody::Complete { body, consumed };
        }

        if offset + chunk_size + 2 > data.len() {
            return ChunkedBody::Incomplete;
        }

        body.extend_from_slice(&data[offset..offset + chunk_size]);
        offset += chunk_size;

        if &data[offset..offset + 2] != b"\r\n" {
            return ChunkedBody::Malformed;
        }
        offset += 2;
    }
}

/// Progress of draining complete chunks off the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDrain {
    pub decoded: Vec<u8>,
    pub consumed: usize,
    /// Terminal chunk consumed; the chunked body is over.
    pub ended: bool,
    /// Framing broke; the caller should fall back to raw bytes.
    pub malformed: bool,
}

/// Decode as many complete chunks as are buffered, without requiring the
/// terminal chunk. Used for streaming (SSE-over-chunked) bodies.
pub fn drain_chunks(data: &[u8]) -> ChunkDrain {
    let mut decoded = Vec::new();
    let mut offset = 0usize;

    loop {
        let line_end = match find(&data[offset..], b"\r\n") {
            Some(i) => i,
            None => {
                return ChunkDrain {
                    decoded,
                    consumed: offset,
                    ended: false,
                    malformed: false,
                }
            }
        };

        let size_line = &data[offset..offset + line_end];
        let size_str = match std::str::from_utf8(size_line) {
            Ok(s) => s.split(';').next().unwrap_or("").trim(),
            Err(_) => {
                return ChunkDrain {
                    decoded,
                    consumed: offset,
                    ended: false,
                    malformed: true,
                }
            }
        };
        let chunk_size = match usize::from_str_radix(size_str, 16) {
            Ok(n) => n,
            Err(_) => {
                return ChunkDrain {
                    decoded,
                    consumed: offset,
                    ended: false,
                    malformed: true,
                }
            }
        };

        if chunk_size == 0 {
            let consumed = match find(&data[offset + line_end + 2..], b"\r\n") {
                Some(i) => offset + line_end + 2 + i + 2,
                None => offset + line_end + 2,
            };
            return ChunkDrain {
                decoded,
                consumed,
                ended: true,
                malformed: false,
            };
        }

        let data_start = offset + line_end + 2;
        if data_start + chunk_size + 2 > data.len() {
            return ChunkDrain {
                decoded,
                consumed: offset,
                ended: false,
                malformed: false,
            };
        }

        decoded.extend_from_slice(&data[data_start..data_start + chunk_size]);
        if &data[data_start + chunk_size..data_start + chunk_size + 2] != b"\r\n" {
            return ChunkDrain {
                decoded,
                consumed: offset,
                ended: false,
                malformed: true,
            };
        }
        offset = data_start + chunk_size + 2;
    }
}

/// First index of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request() {
        let raw = b"POST /mcp HTTP/1.1\r\nHost: gateway.example.com\r\nContent-Type: application/json\r\nContent-Length: 17\r\n\r\n{\"jsonrpc\":\"2.0\"}";
        let req = parse_request_head(raw).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/mcp");
        assert_eq!(req.headers.get("host").unwrap(), "gateway.example.com");
        assert_eq!(body_framing(&req.headers), BodyFraming::ContentLength(17));
        assert_eq!(&raw[req.header_len..], b"{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn parse_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"id\":1}";
        let resp = parse_response_head(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(body_framing(&resp.headers), BodyFraming::Unbounded);
    }

    #[test]
    fn incomplete_headers_return_none() {
        let raw = b"POST /mcp HTTP/1.1\r\nHost: gateway.example.com\r\nContent-Ty";
        assert!(parse_request_head(raw).is_none());
    }

    #[test]
    fn lf_only_line_endings_fail_parse() {
        let raw = b"POST /mcp HTTP/1.1\nHost: example.com\n\n";
        assert!(parse_request_head(raw).is_none());
    }

    #[test]
    fn header_value_with_colon() {
        let raw = b"POST / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        let req = parse_request_head(raw).unwrap();
        assert_eq!(req.headers.get("host").unwrap(), "example.com:8080");
    }

    #[test]
    fn path_with_query_string() {
        let raw = b"POST /mcp?session=4 HTTP/1.1\r\nHost: h\r\n\r\n";
        let req = parse_request_head(raw).unwrap();
        assert_eq!(req.path, "/mcp?session=4");
    }

    #[test]
    fn quick_checks() {
        assert!(looks_like_request(b"POST /mcp HTTP/1.1\r\n"));
        assert!(looks_like_request(b"GET / HTTP/1.1\r\n"));
        assert!(!looks_like_request(b"{\"jsonrpc\":\"2.0\"}"));
        assert!(looks_like_response(b"HTTP/1.1 200 OK\r\n"));
        assert!(!looks_like_response(b"POST / HTTP/1.1\r\n"));
    }

    #[test]
    fn chunked_framing_detected() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let resp = parse_response_head(raw).unwrap();
        assert_eq!(body_framing(&resp.headers), BodyFraming::Chunked);
    }

    #[test]
    fn event_stream_detected() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n";
        let resp = parse_response_head(raw).unwrap();
        assert!(is_event_stream(&resp.headers));
    }

    #[test]
    fn decode_chunked_complete() {
        let data = b"7\r\n{\"a\":1}\r\n0\r\n\r\n";
        match decode_chunked(data) {
            ChunkedBody::Complete { body, consumed } => {
                assert_eq!(body, b"{\"a\":1}");
                assert_eq!(consumed, data.len());
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn decode_chunked_multiple_chunks() {
        let data = b"3\r\n{\"a\r\n4\r\n\":1}\r\n0\r\n\r\n";
        match decode_chunked(data) {
            ChunkedBody::Complete { body, .. } => assert_eq!(body, b"{\"a\":1}"),
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn decode_chunked_incomplete() {
        assert_eq!(decode_chunked(b"7\r\n{\"a\""), ChunkedBody::Incomplete);
        assert_eq!(decode_chunked(b"7\r\n{\"a\":1}\r\n"), ChunkedBody::Incomplete);
    }

    #[test]
    fn decode_chunked_malformed_size() {
        assert_eq!(decode_chunked(b"zz\r\nabc\r\n"), ChunkedBody::Malformed);
    }

    #[test]
    fn decode_chunked_bad_separator() {
        // Chunk data not followed by CRLF.
        assert_eq!(decode_chunked(b"3\r\nabcXX0\r\n\r\n"), ChunkedBody::Malformed);
    }

    #[test]
    fn decode_chunked_extension_ignored() {
        let data = b"7;ext=1\r\n{\"a\":1}\r\n0\r\n\r\n";
        match decode_chunked(data) {
            ChunkedBody::Complete { body, .. } => assert_eq!(body, b"{\"a\":1}"),
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn content_length_capped_parse() {
        let mut headers = HashMap::new();
        headers.insert("content-length".to_string(), "not-a-number".to_string());
        assert_eq!(body_framing(&headers), BodyFraming::Unbounded);
    }

    #[test]
    fn drain_chunks_partial_stream() {
        // Two complete chunks buffered, no terminal chunk yet.
        let drain = drain_chunks(b"3\r\nabc\r\n2\r\nde\r\n4\r\nfg");
        assert_eq!(drain.decoded, b"abcde");
        assert_eq!(drain.consumed, 15);
        assert!(!drain.ended);
        assert!(!drain.malformed);
    }

    #[test]
    fn drain_chunks_terminal() {
        let drain = drain_chunks(b"2\r\nhi\r\n0\r\n\r\n");
        assert_eq!(drain.decoded, b"hi");
        assert!(drain.ended);
        assert_eq!(drain.consumed, 12);
    }
}
