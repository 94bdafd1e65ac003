#![cfg_attr(not(feature = "user"), no_std)]

//! Wire types shared between the eBPF programs and userspace.
//!
//! Every struct here is `#[repr(C)]` and mirrors exactly what the kernel
//! writes into the ring buffer or stores in maps. The first byte of every
//! ring-buffer record is the event type tag, which userspace uses to pick
//! the struct to decode.

/// Maximum length for process names.
pub const TASK_COMM_LEN: usize = 16;

/// Maximum library path length carried in a library event.
/// Shorter than the kernel's PATH_MAX to save ring-buffer space.
pub const PATH_MAX: usize = 512;

/// Maximum payload carried per data / TLS payload event, and the cap on
/// per-stream aggregation buffers.
pub const MAX_BUF_SIZE: usize = 64 * 1024;

/// Event types, stored in the first byte of every ring-buffer record.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Aggregated JSON read from a file/pipe.
    Read = 1,
    /// Aggregated JSON written to a file/pipe.
    Write = 2,
    /// A TLS library was opened or found mapped.
    Library = 3,
    /// Plaintext captured on the send side of a TLS session.
    TlsPayloadSend = 4,
    /// Plaintext captured on the receive side of a TLS session.
    TlsPayloadRecv = 5,
    /// A TLS session was freed.
    TlsFree = 6,
}

impl EventType {
    pub fn from_u8(v: u8) -> Option<EventType> {
        match v {
            1 => Some(EventType::Read),
            2 => Some(EventType::Write),
            3 => Some(EventType::Library),
            4 => Some(EventType::TlsPayloadSend),
            5 => Some(EventType::TlsPayloadRecv),
            6 => Some(EventType::TlsFree),
            _ => None,
        }
    }
}

/// HTTP version of a TLS session, as classified in the kernel.
pub const HTTP_VERSION_UNKNOWN: u8 = 0;
pub const HTTP_VERSION_1: u8 = 1;
pub const HTTP_VERSION_2: u8 = 2;

/// HTTP message kind, used during session role classification.
pub const HTTP_MESSAGE_REQUEST: u8 = 1;
pub const HTTP_MESSAGE_RESPONSE: u8 = 2;
pub const HTTP_MESSAGE_UNKNOWN: u8 = 3;

/// Common header for all ring-buffer records. `event_type` must stay at
/// byte offset 0 for userspace demultiplexing.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EventHeader {
    pub event_type: u8,
    pub _pad: [u8; 3],
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

impl EventHeader {
    pub const fn zeroed() -> Self {
        EventHeader {
            event_type: 0,
            _pad: [0; 3],
            pid: 0,
            comm: [0; TASK_COMM_LEN],
        }
    }
}

/// Aggregated stdio JSON payload (event types 1 and 2).
///
/// The stdio endpoint fields are resolved in the kernel from the FIFO
/// inode tracking map: for reads the peer is the last writer of the
/// inode, for writes the last reader.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DataEvent {
    pub header: EventHeader,

    /// Inode of the file/pipe the stream runs over.
    pub inode: u32,
    /// Sender (writer) endpoint.
    pub from_pid: u32,
    pub from_comm: [u8; TASK_COMM_LEN],
    /// Receiver (reader) endpoint.
    pub to_pid: u32,
    pub to_comm: [u8; TASK_COMM_LEN],
    pub _pad: [u8; 4],
    /// Kernel `struct file *`, the stream identity together with pid.
    pub file_ptr: u64,
    /// Actual aggregated size.
    pub size: u32,
    /// Bytes present in `buf` (`buf_size < size` signals truncation).
    pub buf_size: u32,
    pub buf: [u8; MAX_BUF_SIZE],
}

impl DataEvent {
    pub const fn zeroed() -> Self {
        DataEvent {
            header: EventHeader::zeroed(),
            inode: 0,
            from_pid: 0,
            from_comm: [0; TASK_COMM_LEN],
            to_pid: 0,
            to_comm: [0; TASK_COMM_LEN],
            _pad: [0; 4],
            file_ptr: 0,
            size: 0,
            buf_size: 0,
            buf: [0; MAX_BUF_SIZE],
        }
    }
}

/// A TLS library observation (event type 3).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LibraryEvent {
    pub header: EventHeader,

    /// Inode of the library file, the dedup key for hooking.
    pub inode: u64,
    /// Mount namespace the path is valid in.
    pub mnt_ns_id: u32,
    pub _pad: [u8; 4],
    pub path: [u8; PATH_MAX],
}

impl LibraryEvent {
    pub const fn zeroed() -> Self {
        LibraryEvent {
            header: EventHeader::zeroed(),
            inode: 0,
            mnt_ns_id: 0,
            _pad: [0; 4],
            path: [0; PATH_MAX],
        }
    }
}

/// TLS plaintext captured around SSL_read/SSL_write (event types 4 and 5).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TlsPayloadEvent {
    pub header: EventHeader,

    /// SSL context pointer, the session identity.
    pub ssl_ctx: u64,
    /// Actual payload size.
    pub size: u32,
    /// Bytes present in `buf` (`buf_size < size` signals truncation).
    pub buf_size: u32,
    /// Identified HTTP version of the session.
    pub http_version: u8,
    pub _pad: [u8; 7],
    pub buf: [u8; MAX_BUF_SIZE],
}

impl TlsPayloadEvent {
    pub const fn zeroed() -> Self {
        TlsPayloadEvent {
            header: EventHeader::zeroed(),
            ssl_ctx: 0,
            size: 0,
            buf_size: 0,
            http_version: HTTP_VERSION_UNKNOWN,
            _pad: [0; 7],
            buf: [0; MAX_BUF_SIZE],
        }
    }
}

/// SSL_free notification (event type 6).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TlsFreeEvent {
    pub header: EventHeader,
    pub ssl_ctx: u64,
}

impl TlsFreeEvent {
    pub const fn zeroed() -> Self {
        TlsFreeEvent {
            header: EventHeader::zeroed(),
            ssl_ctx: 0,
        }
    }
}

/// One side of a unidirectional stdio byte stream.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub pid: u32,
    pub _pad: u32,
    pub file_ptr: u64,
}

/// Per-stream JSON aggregation state, kept in a kernel LRU map and staged
/// through per-CPU scratch. Invariant: `close_brackets <= open_brackets`
/// at every byte; a violation drops the stream.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct JsonAggregationState {
    pub accumulated_size: u32,
    pub open_brackets: u32,
    pub close_brackets: u32,
    pub found_opening: u8,
    /// EventType::Read or EventType::Write.
    pub operation: u8,
    pub _pad: [u8; 2],
    pub last_update_ns: u64,
    pub data: [u8; MAX_BUF_SIZE],
}

/// SSL session state tracked between SSL_new and SSL_free.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SslSession {
    pub http_version: u8,
    /// Set to 1 once SSL_do_handshake succeeds.
    pub is_active: u8,
}

/// Reader/writer endpoints of a FIFO inode, used to resolve stdio
/// process hops.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct InodeProcessInfo {
    pub reader_pid: u32,
    pub reader_comm: [u8; TASK_COMM_LEN],
    pub writer_pid: u32,
    pub writer_comm: [u8; TASK_COMM_LEN],
}

/// SSL_read args stashed between the entry uprobe and the return uprobe.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SslReadArgs {
    pub ssl: u64,
    pub buf: u64,
}

/// SSL_read_ex args; `readbytes` is the userspace `size_t *` out-param.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SslReadExArgs {
    pub ssl: u64,
    pub buf: u64,
    pub readbytes: u64,
}

#[cfg(feature = "user")]
mod pod_impls {
    use super::*;
    // SAFETY: all types are #[repr(C)], Copy, and contain only primitive
    // and array fields.
    unsafe impl aya::Pod for DataEvent {}
    unsafe impl aya::Pod for LibraryEvent {}
    unsafe impl aya::Pod for TlsPayloadEvent {}
    unsafe impl aya::Pod for TlsFreeEvent {}
    unsafe impl aya::Pod for StreamKey {}
    unsafe impl aya::Pod for JsonAggregationState {}
    unsafe impl aya::Pod for SslSession {}
    unsafe impl aya::Pod for InodeProcessInfo {}
    unsafe impl aya::Pod for SslReadArgs {}
    unsafe impl aya::Pod for SslReadExArgs {}
}

#[cfg(feature = "user")]
pub mod userspace {
    use super::*;

    /// Decode a NUL-terminated byte array as a string.
    pub fn bytes_to_str(bytes: &[u8]) -> &str {
        let len = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
        core::str::from_utf8(&bytes[..len]).unwrap_or("<invalid>")
    }

    impl EventHeader {
        pub fn comm_str(&self) -> &str {
            bytes_to_str(&self.comm)
        }
    }

    impl DataEvent {
        /// The captured payload bytes (up to `buf_size`).
        pub fn payload(&self) -> &[u8] {
            let len = (self.buf_size as usize).min(MAX_BUF_SIZE);
            &self.buf[..len]
        }

        pub fn from_comm_str(&self) -> &str {
            bytes_to_str(&self.from_comm)
        }

        pub fn to_comm_str(&self) -> &str {
            bytes_to_str(&self.to_comm)
        }

        pub fn truncated(&self) -> bool {
            self.size > self.buf_size
        }
    }

    impl LibraryEvent {
        pub fn path_str(&self) -> &str {
            bytes_to_str(&self.path)
        }
    }

    impl TlsPayloadEvent {
        pub fn payload(&self) -> &[u8] {
            let len = (self.buf_size as usize).min(MAX_BUF_SIZE);
            &self.buf[..len]
        }

        pub fn truncated(&self) -> bool {
            self.size > self.buf_size
        }
    }
}
