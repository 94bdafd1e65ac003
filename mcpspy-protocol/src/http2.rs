//! Minimal HTTP/2 frame parsing: enough to pull JSON-RPC bodies out of
//! DATA frames. HEADERS frames are tracked for stream accounting but not
//! HPACK-decoded.

use std::collections::HashMap;

/// HTTP/2 client connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;

const FLAG_END_STREAM: u8 = 0x1;

/// One parsed frame header plus its payload bounds.
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    length: usize,
    frame_type: u8,
    flags: u8,
    stream_id: u32,
}

fn parse_frame_header(data: &[u8]) -> Option<FrameHeader> {
    if data.len() < FRAME_HEADER_LEN {
        return None;
    }
    let length = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | data[2] as usize;
    let frame_type = data[3];
    let flags = data[4];
    let stream_id = (((data[5] & 0x7f) as u32) << 24)
        | ((data[6] as u32) << 16)
        | ((data[7] as u32) << 8)
        | data[8] as u32;
    Some(FrameHeader {
        length,
        frame_type,
        flags,
        stream_id,
    })
}

/// A fully coalesced HTTP/2 message: all DATA payloads of one stream, in
/// order, ended by END_STREAM.
#[derive(Debug, Clone)]
pub struct Http2Message {
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

/// Incremental HTTP/2 stream assembler for one direction of a connection.
///
/// Feed it plaintext as captured; it buffers partial frames internally and
/// returns completed messages as streams end.
#[derive(Debug, Default)]
pub struct Http2Assembler {
    buf: Vec<u8>,
    preface_stripped: bool,
    streams: HashMap<u32, Vec<u8>>,
}

impl Http2Assembler {
    pub fn new() -> Self {
        Http2Assembler::default()
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Http2Message> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        if !self.preface_stripped && self.buf.starts_with(PREFACE) {
            self.buf.drain(..PREFACE.len());
            self.preface_stripped = true;
        }

        loop {
            let header = match parse_frame_header(&self.buf) {
                Some(h) => h,
                None => break,
            };
            let total = FRAME_HEADER_LEN + header.length;
            if self.buf.len() < total {
                break;
            }

            let payload = &self.buf[FRAME_HEADER_LEN..total];
            match header.frame_type {
                FRAME_DATA => {
                    // Padding (flag 0x8) is rare on API traffic; the pad
                    // length prefix is stripped when present.
                    let body: &[u8] = if header.flags & 0x8 != 0 && !payload.is_empty() {
                        let pad = payload[0] as usize;
                        let data = &payload[1..];
                        &data[..data.len().saturating_sub(pad)]
                    } else {
                        payload
                    };
                    self.streams
                        .entry(header.stream_id)
                        .or_default()
                        .extend_from_slice(body);

                    if header.flags & FLAG_END_STREAM != 0 {
                        if let Some(payload) = self.streams.remove(&header.stream_id) {
                            if !payload.is_empty() {
                                out.push(Http2Message {
                                    stream_id: header.stream_id,
                                    payload,
                                });
                            }
                        }
                    }
                }
                FRAME_HEADERS => {
                    // Ensure the stream exists so a HEADERS-only stream
                    // with END_STREAM is cleaned up.
                    self.streams.entry(header.stream_id).or_default();
                    if header.flags & FLAG_END_STREAM != 0 {
                        if let Some(payload) = self.streams.remove(&header.stream_id) {
                            if !payload.is_empty() {
                                out.push(Http2Message {
                                    stream_id: header.stream_id,
                                    payload,
                                });
                            }
                        }
                    }
                }
                // SETTINGS, WINDOW_UPDATE, PING, GOAWAY, RST_STREAM,
                // PRIORITY, CONTINUATION: skipped.
                _ => {}
            }

            self.buf.drain(..total);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        let len = payload.len();
        f.push((len >> 16) as u8);
        f.push((len >> 8) as u8);
        f.push(len as u8);
        f.push(frame_type);
        f.push(flags);
        f.extend_from_slice(&stream_id.to_be_bytes());
        f.extend_from_slice(payload);
        f
    }

    #[test]
    fn single_data_frame_with_end_stream() {
        let mut asm = Http2Assembler::new();
        let msgs = asm.feed(&frame(FRAME_DATA, FLAG_END_STREAM, 1, b"{\"a\":1}"));
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].stream_id, 1);
        assert_eq!(msgs[0].payload, b"{\"a\":1}");
    }

    #[test]
    fn data_coalesced_until_end_stream() {
        let mut asm = Http2Assembler::new();
        assert!(asm.feed(&frame(FRAME_DATA, 0, 3, b"{\"a\":")).is_empty());
        let msgs = asm.feed(&frame(FRAME_DATA, FLAG_END_STREAM, 3, b"1}"));
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, b"{\"a\":1}");
    }

    #[test]
    fn interleaved_streams_kept_separate() {
        let mut asm = Http2Assembler::new();
        asm.feed(&frame(FRAME_DATA, 0, 1, b"{\"x\":"));
        asm.feed(&frame(FRAME_DATA, 0, 3, b"{\"y\":"));
        let m1 = asm.feed(&frame(FRAME_DATA, FLAG_END_STREAM, 1, b"1}"));
        assert_eq!(m1[0].payload, b"{\"x\":1}");
        let m3 = asm.feed(&frame(FRAME_DATA, FLAG_END_STREAM, 3, b"2}"));
        assert_eq!(m3[0].payload, b"{\"y\":2}");
    }

    #[test]
    fn preface_stripped() {
        let mut asm = Http2Assembler::new();
        let mut data = PREFACE.to_vec();
        data.extend_from_slice(&frame(FRAME_DATA, FLAG_END_STREAM, 1, b"{}"));
        let msgs = asm.feed(&data);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, b"{}");
    }

    #[test]
    fn partial_frame_buffered() {
        let mut asm = Http2Assembler::new();
        let full = frame(FRAME_DATA, FLAG_END_STREAM, 1, b"{\"a\":1}");
        assert!(asm.feed(&full[..5]).is_empty());
        let msgs = asm.feed(&full[5..]);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, b"{\"a\":1}");
    }

    #[test]
    fn control_frames_skipped() {
        let mut asm = Http2Assembler::new();
        // SETTINGS (type 4) on stream 0.
        assert!(asm.feed(&frame(4, 0, 0, &[0; 6])).is_empty());
        let msgs = asm.feed(&frame(FRAME_DATA, FLAG_END_STREAM, 1, b"{}"));
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn headers_only_stream_produces_nothing() {
        let mut asm = Http2Assembler::new();
        let msgs = asm.feed(&frame(FRAME_HEADERS, FLAG_END_STREAM, 5, &[0x82]));
        assert!(msgs.is_empty());
    }
}
