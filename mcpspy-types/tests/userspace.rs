//! Integration tests for mcpspy-types userspace helpers (requires `user` feature).

use mcpspy_types::*;

// ---- comm decoding ----

#[test]
fn header_comm_normal() {
    let mut e = TlsFreeEvent::zeroed();
    let name = b"node\0";
    e.header.comm[..name.len()].copy_from_slice(name);
    assert_eq!(e.header.comm_str(), "node");
}

#[test]
fn header_comm_full_length() {
    let mut e = TlsFreeEvent::zeroed();
    e.header.comm = *b"0123456789abcdef";
    assert_eq!(e.header.comm_str(), "0123456789abcdef");
}

#[test]
fn header_comm_empty() {
    let e = TlsFreeEvent::zeroed();
    assert_eq!(e.header.comm_str(), "");
}

#[test]
fn header_comm_invalid_utf8() {
    let mut e = TlsFreeEvent::zeroed();
    e.header.comm[0] = 0xFF;
    e.header.comm[1] = 0xFE;
    assert_eq!(e.header.comm_str(), "<invalid>");
}

// ---- payload slicing and truncation ----

#[test]
fn data_event_payload_bounds() {
    let mut e = Box::new(DataEvent::zeroed());
    e.buf[..5].copy_from_slice(b"{\"a\"}");
    e.size = 5;
    e.buf_size = 5;
    assert_eq!(e.payload(), b"{\"a\"}");
    assert!(!e.truncated());
}

#[test]
fn data_event_truncation_flag() {
    let mut e = Box::new(DataEvent::zeroed());
    e.size = (MAX_BUF_SIZE as u32) + 100;
    e.buf_size = MAX_BUF_SIZE as u32;
    assert_eq!(e.payload().len(), MAX_BUF_SIZE);
    assert!(e.truncated());
}

#[test]
fn data_event_buf_size_clamped() {
    let mut e = Box::new(DataEvent::zeroed());
    // A corrupt buf_size larger than the array must not panic.
    e.buf_size = u32::MAX;
    assert_eq!(e.payload().len(), MAX_BUF_SIZE);
}

#[test]
fn tls_payload_event_payload_bounds() {
    let mut e = Box::new(TlsPayloadEvent::zeroed());
    e.buf[..4].copy_from_slice(b"POST");
    e.size = 4;
    e.buf_size = 4;
    assert_eq!(e.payload(), b"POST");
    assert!(!e.truncated());
}

// ---- library path decoding ----

#[test]
fn library_event_path() {
    let mut e = Box::new(LibraryEvent::zeroed());
    let path = b"/usr/lib/x86_64-linux-gnu/libssl.so.3\0";
    e.path[..path.len()].copy_from_slice(path);
    assert_eq!(e.path_str(), "/usr/lib/x86_64-linux-gnu/libssl.so.3");
}

// ---- event type tags ----

#[test]
fn event_type_round_trip() {
    for t in [
        EventType::Read,
        EventType::Write,
        EventType::Library,
        EventType::TlsPayloadSend,
        EventType::TlsPayloadRecv,
        EventType::TlsFree,
    ] {
        assert_eq!(EventType::from_u8(t as u8), Some(t));
    }
    assert_eq!(EventType::from_u8(0), None);
    assert_eq!(EventType::from_u8(7), None);
}

// ---- layout assumptions ----

#[test]
fn event_type_is_first_byte() {
    // Userspace demultiplexes on byte 0 of every record.
    let mut e = Box::new(TlsPayloadEvent::zeroed());
    e.header.event_type = EventType::TlsPayloadRecv as u8;
    let bytes = unsafe {
        std::slice::from_raw_parts(
            &*e as *const TlsPayloadEvent as *const u8,
            std::mem::size_of::<TlsPayloadEvent>(),
        )
    };
    assert_eq!(bytes[0], 5);
}
