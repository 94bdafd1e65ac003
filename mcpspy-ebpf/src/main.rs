#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_current_task, bpf_ktime_get_ns,
    },
    macros::{fentry, fexit, map, uprobe, uretprobe},
    maps::{Array, HashMap, LruHashMap, PerCpuArray, RingBuf},
    programs::{FEntryContext, FExitContext, ProbeContext, RetProbeContext},
};
use aya_ebpf_bindings::helpers::{
    bpf_d_path, bpf_loop, bpf_probe_read_kernel, bpf_probe_read_user,
};
use aya_log_ebpf::debug;
use core::ffi::c_void;
use mcpspy_types::{
    DataEvent, EventHeader, EventType, InodeProcessInfo, JsonAggregationState, LibraryEvent,
    SslReadArgs, SslReadExArgs, SslSession, StreamKey, TlsFreeEvent, TlsPayloadEvent,
    HTTP_MESSAGE_REQUEST, HTTP_MESSAGE_RESPONSE, HTTP_MESSAGE_UNKNOWN, HTTP_VERSION_1,
    HTTP_VERSION_2, HTTP_VERSION_UNKNOWN, MAX_BUF_SIZE, PATH_MAX, TASK_COMM_LEN,
};

// ---------------------------------------------------------------------------
// Maps
// ---------------------------------------------------------------------------

/// Single ring buffer shared by all event kinds (4 MiB).
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(4 * 1024 * 1024, 0);

/// Per-stream JSON aggregation, keyed by (pid, file pointer).
/// LRU so abandoned streams age out under pressure.
#[map]
static JSON_STREAMS: LruHashMap<StreamKey, JsonAggregationState> =
    LruHashMap::with_max_entries(256, 0);

/// Per-CPU scratch slot used to initialize new 64 KiB aggregation states
/// without blowing the kernel stack. Tracing programs are not preempted,
/// so the current CPU's slot is exclusively ours for the program's run.
#[map]
static JSON_SCRATCH: PerCpuArray<JsonAggregationState> = PerCpuArray::with_max_entries(1, 0);

/// SSL session state, keyed by SSL context pointer.
#[map]
static SSL_SESSIONS: HashMap<u64, SslSession> = HashMap::with_max_entries(10240, 0);

/// SSL_read args stashed between entry and return probes, keyed by PID.
#[map]
static SSL_READ_ARGS: HashMap<u32, SslReadArgs> = HashMap::with_max_entries(1024, 0);

/// SSL_read_ex args stashed between entry and return probes, keyed by PID.
#[map]
static SSL_READ_EX_ARGS: HashMap<u32, SslReadExArgs> = HashMap::with_max_entries(1024, 0);

/// SSL_do_handshake context stashed between entry and return, keyed by PID.
#[map]
static SSL_HANDSHAKE_ARGS: HashMap<u32, u64> = HashMap::with_max_entries(1024, 0);

/// FIFO inode -> last observed reader/writer endpoints, used to resolve
/// stdio process hops at submit time.
#[map]
static INODE_PROCESS: HashMap<u32, InodeProcessInfo> = HashMap::with_max_entries(1024, 0);

/// The agent's own PID (index 0), filtered out of the vfs hooks so we
/// don't trace our own output.
#[map]
static SELF_PID: Array<u32> = Array::with_max_entries(1, 0);

// ---------------------------------------------------------------------------
// Kernel struct access
//
// Field offsets below are for x86_64 default-config kernels (5.15 through
// 6.x). The same precedent as reading sock_common by fixed offset: these
// fields have been layout-stable for years. Userspace falls back to /proc
// for the mount namespace when the kernel-side read yields 0.
// ---------------------------------------------------------------------------

const FILE_F_PATH_OFFSET: usize = 16;
const FILE_F_INODE_OFFSET: usize = 32;
const INODE_I_MODE_OFFSET: usize = 0;
const INODE_I_INO_OFFSET: usize = 64;
const TASK_NSPROXY_OFFSET: usize = 0x790;
const NSPROXY_MNT_NS_OFFSET: usize = 24;
const MNT_NS_INUM_OFFSET: usize = 16;

const S_IFMT: u16 = 0o170000;
const S_IFDIR: u16 = 0o040000;
const S_IFIFO: u16 = 0o010000;

/// Stream stale timeout: streams idle longer than this restart aggregation.
const STREAM_STALE_NS: u64 = 5_000_000_000;

#[inline(always)]
unsafe fn read_kernel<T: Copy>(ptr: u64) -> Option<T> {
    let mut val = core::mem::MaybeUninit::<T>::uninit();
    let ret = bpf_probe_read_kernel(
        val.as_mut_ptr() as *mut c_void,
        core::mem::size_of::<T>() as u32,
        ptr as *const c_void,
    );
    if ret != 0 {
        return None;
    }
    Some(val.assume_init())
}

/// Read (i_ino, i_mode) from a `struct file *`.
#[inline(always)]
unsafe fn read_file_inode(file: u64) -> Option<(u64, u16)> {
    let inode: u64 = read_kernel(file + FILE_F_INODE_OFFSET as u64)?;
    if inode == 0 {
        return None;
    }
    let ino: u64 = read_kernel(inode + INODE_I_INO_OFFSET as u64)?;
    let mode: u16 = read_kernel(inode + INODE_I_MODE_OFFSET as u64)?;
    Some((ino, mode))
}

/// Mount namespace inum of the current task. Returns 0 when any link in
/// the chain cannot be read.
#[inline(always)]
unsafe fn get_mount_ns_id() -> u32 {
    let task = bpf_get_current_task();
    if task == 0 {
        return 0;
    }
    let nsproxy: u64 = match read_kernel(task + TASK_NSPROXY_OFFSET as u64) {
        Some(p) => p,
        None => return 0,
    };
    if nsproxy == 0 {
        return 0;
    }
    let mnt_ns: u64 = match read_kernel(nsproxy + NSPROXY_MNT_NS_OFFSET as u64) {
        Some(p) => p,
        None => return 0,
    };
    if mnt_ns == 0 {
        return 0;
    }
    read_kernel(mnt_ns + MNT_NS_INUM_OFFSET as u64).unwrap_or(0)
}

#[inline(always)]
fn current_comm() -> [u8; TASK_COMM_LEN] {
    match bpf_get_current_comm() {
        Ok(comm) => comm,
        Err(_) => {
            let mut comm = [0u8; TASK_COMM_LEN];
            comm[0] = b'?';
            comm
        }
    }
}

#[inline(always)]
fn is_self(pid: u32) -> bool {
    if let Some(p) = SELF_PID.get_ptr(0) {
        return unsafe { *p } == pid;
    }
    false
}

// ---------------------------------------------------------------------------
// JSON aggregation
// ---------------------------------------------------------------------------

const CHUNK_SIZE: u32 = 64;
/// 1024 chunks x 64 bytes covers the full 64 KiB aggregation window.
const MAX_CHUNKS: u32 = 1024;

#[repr(C)]
struct BracketCountCtx {
    buf: u64,
    size: u32,
    open: u32,
    close: u32,
    invalid: u8,
}

/// bpf_loop callback: count `{` / `}` in one 64-byte chunk of the user
/// buffer. `open`/`close` are seeded with the stream's running totals so
/// the underflow check holds across fragment boundaries.
unsafe extern "C" fn count_brackets_cb(index: u64, ctx: *mut c_void) -> i64 {
    let c = &mut *(ctx as *mut BracketCountCtx);
    if c.invalid != 0 {
        return 1;
    }

    let offset = (index as u32) * CHUNK_SIZE;
    if offset >= c.size {
        return 1;
    }

    let remaining = c.size - offset;
    let read_size = if remaining < CHUNK_SIZE {
        remaining
    } else {
        CHUNK_SIZE
    };

    let mut chunk = [0u8; CHUNK_SIZE as usize];
    if bpf_probe_read_user(
        chunk.as_mut_ptr() as *mut c_void,
        read_size,
        (c.buf + offset as u64) as *const c_void,
    ) != 0
    {
        c.invalid = 1;
        return 1;
    }

    let mut i = 0usize;
    while i < CHUNK_SIZE as usize {
        if (i as u32) >= read_size {
            break;
        }
        let ch = chunk[i];
        if ch == b'{' {
            c.open += 1;
        } else if ch == b'}' {
            c.close += 1;
            if c.close > c.open {
                c.invalid = 1;
                return 1;
            }
        }
        i += 1;
    }

    0
}

/// Update the stream's bracket counts from a user buffer segment.
/// Returns false when the close-count exceeds the open-count, which marks
/// the stream invalid.
#[inline(always)]
unsafe fn update_bracket_counts(
    state: *mut JsonAggregationState,
    buf: u64,
    size: u32,
) -> bool {
    let mut ctx = BracketCountCtx {
        buf,
        size,
        open: (*state).open_brackets,
        close: (*state).close_brackets,
        invalid: 0,
    };

    bpf_loop(
        MAX_CHUNKS,
        count_brackets_cb as *mut c_void,
        &mut ctx as *mut BracketCountCtx as *mut c_void,
        0,
    );

    if ctx.invalid != 0 {
        return false;
    }

    (*state).open_brackets = ctx.open;
    (*state).close_brackets = ctx.close;
    true
}

#[inline(always)]
unsafe fn is_json_complete(state: *const JsonAggregationState) -> bool {
    (*state).open_brackets > 0 && (*state).open_brackets == (*state).close_brackets
}

/// First observation of a stream must begin with `{`, tolerating
/// whitespace in the first 8 bytes.
#[inline(always)]
unsafe fn is_json_data(buf: u64, size: u32) -> bool {
    if size < 8 {
        return false;
    }

    let mut check = [0u8; 8];
    if bpf_probe_read_user(
        check.as_mut_ptr() as *mut c_void,
        check.len() as u32,
        buf as *const c_void,
    ) != 0
    {
        return false;
    }

    let mut i = 0usize;
    while i < 8 {
        let c = check[i];
        if c == b' ' || c == b'\t' || c == b'\n' || c == b'\r' {
            i += 1;
            continue;
        }
        return c == b'{';
    }

    false
}

/// Append a user buffer segment to the aggregation state.
/// Returns false on overflow (stream exceeds 64 KiB), which drops the stream.
#[inline(always)]
unsafe fn append_to_aggregation(
    state: *mut JsonAggregationState,
    buf: u64,
    size: u32,
) -> bool {
    if size == 0 || size as usize > MAX_BUF_SIZE {
        return false;
    }

    let offset = (*state).accumulated_size;
    if offset as usize >= MAX_BUF_SIZE {
        return false;
    }

    let remaining = MAX_BUF_SIZE as u32 - offset;
    if size > remaining {
        return false;
    }

    let dst = (*state).data.as_mut_ptr().add(offset as usize);
    if bpf_probe_read_user(dst as *mut c_void, size, buf as *const c_void) != 0 {
        return false;
    }

    (*state).accumulated_size = offset + size;
    true
}

/// Submit the completed aggregation buffer as a data event, with stdio
/// endpoints resolved from the FIFO inode map.
#[inline(always)]
unsafe fn submit_json_event(key: &StreamKey, state: *const JsonAggregationState, inode: u32) {
    let mut entry = match EVENTS.reserve::<DataEvent>(0) {
        Some(e) => e,
        None => return,
    };
    let ev = &mut *entry.as_mut_ptr();

    ev.header.event_type = (*state).operation;
    ev.header._pad = [0; 3];
    ev.header.pid = key.pid;
    ev.header.comm = current_comm();

    ev.inode = inode;
    ev.from_pid = 0;
    ev.from_comm = [0; TASK_COMM_LEN];
    ev.to_pid = 0;
    ev.to_comm = [0; TASK_COMM_LEN];
    if let Some(info) = INODE_PROCESS.get(&inode) {
        ev.from_pid = info.writer_pid;
        ev.from_comm = info.writer_comm;
        ev.to_pid = info.reader_pid;
        ev.to_comm = info.reader_comm;
    }
    ev._pad = [0; 4];
    ev.file_ptr = key.file_ptr;

    let size = (*state).accumulated_size;
    let copy = if size as usize > MAX_BUF_SIZE {
        MAX_BUF_SIZE as u32
    } else {
        size
    };
    ev.size = size;
    ev.buf_size = copy;

    if bpf_probe_read_kernel(
        ev.buf.as_mut_ptr() as *mut c_void,
        copy,
        (*state).data.as_ptr() as *const c_void,
    ) != 0
    {
        entry.discard(0);
        return;
    }

    entry.submit(0);
}

/// Record one endpoint of a FIFO inode. `is_reader` distinguishes the
/// vfs_read side from the vfs_write side.
#[inline(always)]
unsafe fn track_fifo_endpoint(inode: u32, pid: u32, is_reader: bool) {
    let mut info = match INODE_PROCESS.get(&inode) {
        Some(i) => *i,
        None => InodeProcessInfo {
            reader_pid: 0,
            reader_comm: [0; TASK_COMM_LEN],
            writer_pid: 0,
            writer_comm: [0; TASK_COMM_LEN],
        },
    };

    if is_reader {
        info.reader_pid = pid;
        info.reader_comm = current_comm();
    } else {
        info.writer_pid = pid;
        info.writer_comm = current_comm();
    }

    let _ = INODE_PROCESS.insert(&inode, &info, 0);
}

/// Shared body of the vfs_read/vfs_write fexit hooks.
#[inline(always)]
unsafe fn handle_vfs_io(file: u64, buf: u64, ret: i64, operation: EventType) {
    if ret <= 0 || file == 0 || buf == 0 {
        return;
    }

    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    if is_self(pid) {
        return;
    }

    let size = (ret as u64 & 0x7FFF_FFFF) as u32;

    let (ino64, mode) = match read_file_inode(file) {
        Some(v) => v,
        None => (0, 0),
    };
    let inode = ino64 as u32;

    if mode & S_IFMT == S_IFIFO {
        track_fifo_endpoint(inode, pid, operation == EventType::Read);
    }

    let key = StreamKey {
        pid,
        _pad: 0,
        file_ptr: file,
    };

    let now = bpf_ktime_get_ns();

    if let Some(state) = JSON_STREAMS.get_ptr_mut(&key) {
        // Streams idle past the stale window restart from scratch.
        if now.saturating_sub((*state).last_update_ns) > STREAM_STALE_NS {
            let _ = JSON_STREAMS.remove(&key);
        } else {
            if !append_to_aggregation(state, buf, size) {
                let _ = JSON_STREAMS.remove(&key);
                return;
            }
            if !update_bracket_counts(state, buf, size) {
                let _ = JSON_STREAMS.remove(&key);
                return;
            }
            (*state).last_update_ns = now;

            if is_json_complete(state) {
                submit_json_event(&key, state, inode);
                let _ = JSON_STREAMS.remove(&key);
            } else {
                // Re-insert from the map value itself to refresh LRU recency.
                let _ = JSON_STREAMS.insert(&key, &*state, 0);
            }
            return;
        }
    }

    // New stream: must look like the start of a JSON object.
    if !is_json_data(buf, size) {
        return;
    }

    let state = match JSON_SCRATCH.get_ptr_mut(0) {
        Some(p) => p,
        None => return,
    };

    (*state).accumulated_size = 0;
    (*state).open_brackets = 0;
    (*state).close_brackets = 0;
    (*state).found_opening = 1;
    (*state).operation = operation as u8;
    (*state).last_update_ns = now;

    if !append_to_aggregation(state, buf, size) {
        return;
    }
    if !update_bracket_counts(state, buf, size) {
        return;
    }

    if is_json_complete(state) {
        submit_json_event(&key, state, inode);
        return;
    }

    let _ = JSON_STREAMS.insert(&key, &*state, 0);
}

// ---------------------------------------------------------------------------
// vfs hooks
// ---------------------------------------------------------------------------

#[fexit(function = "vfs_read")]
pub fn exit_vfs_read(ctx: FExitContext) -> u32 {
    unsafe {
        let file: u64 = ctx.arg(0);
        let buf: u64 = ctx.arg(1);
        let ret: i64 = ctx.arg(4);
        handle_vfs_io(file, buf, ret, EventType::Read);
    }
    0
}

#[fexit(function = "vfs_write")]
pub fn exit_vfs_write(ctx: FExitContext) -> u32 {
    unsafe {
        let file: u64 = ctx.arg(0);
        let buf: u64 = ctx.arg(1);
        let ret: i64 = ctx.arg(4);
        handle_vfs_io(file, buf, ret, EventType::Write);
    }
    0
}

// ---------------------------------------------------------------------------
// Library discovery
// ---------------------------------------------------------------------------

/// Deny-list of path prefixes that can never hold hookable libraries.
#[inline(always)]
fn is_path_relevant(path: &[u8; PATH_MAX]) -> bool {
    const DENIED: [&[u8]; 5] = [b"/proc/", b"/sys/", b"/dev/", b"/mnt/", b"/memf"];

    let mut d = 0usize;
    while d < DENIED.len() {
        let prefix = DENIED[d];
        let mut matches = true;
        let mut i = 0usize;
        while i < prefix.len() {
            if path[i] != prefix[i] {
                matches = false;
                break;
            }
            i += 1;
        }
        if matches {
            return false;
        }
        d += 1;
    }
    true
}

/// Offset of the byte after the last '/' in the NUL-terminated path.
#[inline(always)]
fn basename_offset(path: &[u8; PATH_MAX]) -> usize {
    let mut last = 0usize;
    let mut i = 0usize;
    while i < PATH_MAX {
        let c = path[i];
        if c == 0 {
            break;
        }
        if c == b'/' && i + 1 < PATH_MAX {
            last = i + 1;
        }
        i += 1;
    }
    last
}

/// Base-name allow-list for TLS hooking: "libssl*" and the statically
/// linked "node" binary.
#[inline(always)]
fn is_filename_relevant(path: &[u8; PATH_MAX], base: usize) -> bool {
    if base + 6 < PATH_MAX {
        let p = &path[base..base + 6];
        if p == b"libssl" {
            return true;
        }
    }

    if base + 5 < PATH_MAX
        && path[base] == b'n'
        && path[base + 1] == b'o'
        && path[base + 2] == b'd'
        && path[base + 3] == b'e'
        && path[base + 4] == 0
    {
        return true;
    }

    false
}

/// Emit a library event whenever an interesting file is opened. We hook
/// security_file_open rather than an LSM program because bpf_d_path gives
/// us the full materialized path from here.
#[fentry(function = "security_file_open")]
pub fn trace_security_file_open(ctx: FEntryContext) -> u32 {
    unsafe {
        let file: u64 = ctx.arg(0);
        if file == 0 {
            return 0;
        }

        if let Some((_, mode)) = read_file_inode(file) {
            if mode & S_IFMT == S_IFDIR {
                return 0;
            }
        }

        let mut entry = match EVENTS.reserve::<LibraryEvent>(0) {
            Some(e) => e,
            None => {
                debug!(&ctx, "ring buffer full, dropping library event");
                return 0;
            }
        };
        let ev = &mut *entry.as_mut_ptr();

        ev.path = [0; PATH_MAX];
        let ret = bpf_d_path(
            (file + FILE_F_PATH_OFFSET as u64) as *mut aya_ebpf_bindings::bindings::path,
            ev.path.as_mut_ptr() as *mut core::ffi::c_char,
            PATH_MAX as u32,
        );
        if ret < 0 {
            entry.discard(0);
            return 0;
        }

        let base = basename_offset(&ev.path);
        if !is_filename_relevant(&ev.path, base) || !is_path_relevant(&ev.path) {
            entry.discard(0);
            return 0;
        }

        ev.header.event_type = EventType::Library as u8;
        ev.header._pad = [0; 3];
        ev.header.pid = (bpf_get_current_pid_tgid() >> 32) as u32;
        ev.header.comm = current_comm();
        ev.inode = match read_file_inode(file) {
            Some((ino, _)) => ino,
            None => 0,
        };
        ev.mnt_ns_id = get_mount_ns_id();
        ev._pad = [0; 4];

        entry.submit(0);
    }
    0
}

// ---------------------------------------------------------------------------
// TLS payload classification
// ---------------------------------------------------------------------------

#[inline(always)]
fn is_http1_request(buf: &[u8; 24], size: u32) -> bool {
    if size < 4 {
        return false;
    }
    (buf[0] == b'G' && buf[1] == b'E' && buf[2] == b'T' && buf[3] == b' ')
        || (buf[0] == b'P' && buf[1] == b'O' && buf[2] == b'S' && buf[3] == b'T')
        || (buf[0] == b'P' && buf[1] == b'U' && buf[2] == b'T' && buf[3] == b' ')
        || (buf[0] == b'H' && buf[1] == b'E' && buf[2] == b'A' && buf[3] == b'D')
        || (size >= 6
            && buf[0] == b'D'
            && buf[1] == b'E'
            && buf[2] == b'L'
            && buf[3] == b'E'
            && buf[4] == b'T'
            && buf[5] == b'E')
        || (size >= 5
            && buf[0] == b'P'
            && buf[1] == b'A'
            && buf[2] == b'T'
            && buf[3] == b'C'
            && buf[4] == b'H')
        || (size >= 7
            && buf[0] == b'O'
            && buf[1] == b'P'
            && buf[2] == b'T'
            && buf[3] == b'I'
            && buf[4] == b'O'
            && buf[5] == b'N'
            && buf[6] == b'S')
        || (size >= 7
            && buf[0] == b'C'
            && buf[1] == b'O'
            && buf[2] == b'N'
            && buf[3] == b'N'
            && buf[4] == b'E'
            && buf[5] == b'C'
            && buf[6] == b'T')
}

#[inline(always)]
fn is_http1_response(buf: &[u8; 24], size: u32) -> bool {
    size >= 8
        && buf[0] == b'H'
        && buf[1] == b'T'
        && buf[2] == b'T'
        && buf[3] == b'P'
        && buf[4] == b'/'
        && buf[5] == b'1'
        && buf[6] == b'.'
}

/// HTTP/2 client connection preface: "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n".
#[inline(always)]
fn is_http2_preface(buf: &[u8; 24], size: u32) -> bool {
    if size < 24 {
        return false;
    }
    const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
    let mut i = 0usize;
    while i < 24 {
        if buf[i] != PREFACE[i] {
            return false;
        }
        i += 1;
    }
    true
}

/// Classify the HTTP version and message kind from the first bytes of a
/// TLS payload. Returns (version, message_type).
#[inline(always)]
unsafe fn identify_http(buf: u64, size: u32) -> (u8, u8) {
    if size < 4 {
        return (HTTP_VERSION_UNKNOWN, HTTP_MESSAGE_UNKNOWN);
    }

    let mut data = [0u8; 24];
    let probe = if size < 24 { size } else { 24 };
    if bpf_probe_read_user(
        data.as_mut_ptr() as *mut c_void,
        probe,
        buf as *const c_void,
    ) != 0
    {
        return (HTTP_VERSION_UNKNOWN, HTTP_MESSAGE_UNKNOWN);
    }

    if is_http2_preface(&data, size) {
        // Only clients send the preface.
        return (HTTP_VERSION_2, HTTP_MESSAGE_REQUEST);
    }
    if is_http1_request(&data, size) {
        return (HTTP_VERSION_1, HTTP_MESSAGE_REQUEST);
    }
    if is_http1_response(&data, size) {
        return (HTTP_VERSION_1, HTTP_MESSAGE_RESPONSE);
    }

    (HTTP_VERSION_UNKNOWN, HTTP_MESSAGE_UNKNOWN)
}

/// Direction of a TLS capture, for role classification.
#[derive(Clone, Copy, PartialEq, Eq)]
enum TlsDir {
    Send,
    Recv,
}

/// Shared session bookkeeping for all four SSL I/O probes. Returns the
/// session's HTTP version if the payload should be emitted, None if the
/// event is to be skipped or the session dropped.
#[inline(always)]
unsafe fn classify_session(ssl_ptr: u64, buf: u64, size: u32, dir: TlsDir) -> Option<u8> {
    let session = SSL_SESSIONS.get_ptr_mut(&ssl_ptr)?;

    // Only sessions with a completed handshake carry application data.
    if (*session).is_active == 0 {
        return None;
    }

    if (*session).http_version == HTTP_VERSION_UNKNOWN {
        let (version, message_type) = identify_http(buf, size);
        if version == HTTP_VERSION_UNKNOWN {
            return None;
        }

        // We observe HTTP clients only: a request arriving on the read
        // side (or a response leaving on the write side) means this
        // process is a server, so the whole session is dropped.
        if (dir == TlsDir::Recv && message_type == HTTP_MESSAGE_REQUEST)
            || (dir == TlsDir::Send && message_type == HTTP_MESSAGE_RESPONSE)
        {
            let _ = SSL_SESSIONS.remove(&ssl_ptr);
            return None;
        }

        (*session).http_version = version;
    }

    Some((*session).http_version)
}

/// Emit a TLS payload event carrying up to 64 KiB of plaintext.
#[inline(always)]
unsafe fn submit_tls_payload(ssl_ptr: u64, buf: u64, size: u32, http_version: u8, dir: TlsDir) {
    let mut entry = match EVENTS.reserve::<TlsPayloadEvent>(0) {
        Some(e) => e,
        None => return,
    };
    let ev = &mut *entry.as_mut_ptr();

    ev.header.event_type = match dir {
        TlsDir::Send => EventType::TlsPayloadSend as u8,
        TlsDir::Recv => EventType::TlsPayloadRecv as u8,
    };
    ev.header._pad = [0; 3];
    ev.header.pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    ev.header.comm = current_comm();
    ev.ssl_ctx = ssl_ptr;
    ev.http_version = http_version;
    ev._pad = [0; 7];

    let size = size & 0x7FFF_FFFF;
    ev.size = size;
    ev.buf_size = if size as usize > MAX_BUF_SIZE {
        MAX_BUF_SIZE as u32
    } else {
        size
    };

    if bpf_probe_read_user(
        ev.buf.as_mut_ptr() as *mut c_void,
        ev.buf_size,
        buf as *const c_void,
    ) != 0
    {
        entry.discard(0);
        return;
    }

    entry.submit(0);
}

// ---------------------------------------------------------------------------
// SSL uprobes
// ---------------------------------------------------------------------------

#[uprobe]
pub fn ssl_read_entry(ctx: ProbeContext) -> u32 {
    let ssl: u64 = match ctx.arg(0) {
        Some(v) => v,
        None => return 0,
    };
    let buf: u64 = match ctx.arg(1) {
        Some(v) => v,
        None => return 0,
    };

    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    let args = SslReadArgs { ssl, buf };
    let _ = SSL_READ_ARGS.insert(&pid, &args, 0);
    0
}

#[uretprobe]
pub fn ssl_read_exit(ctx: RetProbeContext) -> u32 {
    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;

    let args = match unsafe { SSL_READ_ARGS.get(&pid) } {
        Some(a) => *a,
        None => return 0,
    };
    let _ = SSL_READ_ARGS.remove(&pid);

    let ret: i32 = match ctx.ret() {
        Some(v) => v,
        None => return 0,
    };
    if ret <= 0 {
        return 0;
    }

    unsafe {
        let size = ret as u32;
        if let Some(version) = classify_session(args.ssl, args.buf, size, TlsDir::Recv) {
            submit_tls_payload(args.ssl, args.buf, size, version, TlsDir::Recv);
        }
    }
    0
}

#[uprobe]
pub fn ssl_write_entry(ctx: ProbeContext) -> u32 {
    let ssl: u64 = match ctx.arg(0) {
        Some(v) => v,
        None => return 0,
    };
    let buf: u64 = match ctx.arg(1) {
        Some(v) => v,
        None => return 0,
    };
    let num: i32 = match ctx.arg(2) {
        Some(v) => v,
        None => return 0,
    };
    if num <= 0 {
        return 0;
    }

    unsafe {
        let size = num as u32;
        if let Some(version) = classify_session(ssl, buf, size, TlsDir::Send) {
            submit_tls_payload(ssl, buf, size, version, TlsDir::Send);
        }
    }
    0
}

#[uprobe]
pub fn ssl_read_ex_entry(ctx: ProbeContext) -> u32 {
    let ssl: u64 = match ctx.arg(0) {
        Some(v) => v,
        None => return 0,
    };
    let buf: u64 = match ctx.arg(1) {
        Some(v) => v,
        None => return 0,
    };
    let readbytes: u64 = match ctx.arg(3) {
        Some(v) => v,
        None => return 0,
    };

    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    let args = SslReadExArgs {
        ssl,
        buf,
        readbytes,
    };
    let _ = SSL_READ_EX_ARGS.insert(&pid, &args, 0);
    0
}

#[uretprobe]
pub fn ssl_read_ex_exit(ctx: RetProbeContext) -> u32 {
    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;

    let args = match unsafe { SSL_READ_EX_ARGS.get(&pid) } {
        Some(a) => *a,
        None => return 0,
    };
    let _ = SSL_READ_EX_ARGS.remove(&pid);

    // SSL_read_ex returns 1 on success; the byte count is in *readbytes.
    let ret: i32 = match ctx.ret() {
        Some(v) => v,
        None => return 0,
    };
    if ret != 1 || args.readbytes == 0 {
        return 0;
    }

    unsafe {
        let actual: u64 = match read_user_u64(args.readbytes) {
            Some(v) => v,
            None => return 0,
        };
        if actual == 0 {
            return 0;
        }
        let size = (actual & 0x7FFF_FFFF) as u32;

        if let Some(version) = classify_session(args.ssl, args.buf, size, TlsDir::Recv) {
            submit_tls_payload(args.ssl, args.buf, size, version, TlsDir::Recv);
        }
    }
    0
}

#[inline(always)]
unsafe fn read_user_u64(ptr: u64) -> Option<u64> {
    let mut val: u64 = 0;
    if bpf_probe_read_user(
        &mut val as *mut u64 as *mut c_void,
        core::mem::size_of::<u64>() as u32,
        ptr as *const c_void,
    ) != 0
    {
        return None;
    }
    Some(val)
}

#[uprobe]
pub fn ssl_write_ex_entry(ctx: ProbeContext) -> u32 {
    let ssl: u64 = match ctx.arg(0) {
        Some(v) => v,
        None => return 0,
    };
    let buf: u64 = match ctx.arg(1) {
        Some(v) => v,
        None => return 0,
    };
    let num: u64 = match ctx.arg(2) {
        Some(v) => v,
        None => return 0,
    };
    if num == 0 {
        return 0;
    }

    unsafe {
        let size = (num & 0x7FFF_FFFF) as u32;
        if let Some(version) = classify_session(ssl, buf, size, TlsDir::Send) {
            submit_tls_payload(ssl, buf, size, version, TlsDir::Send);
        }
    }
    0
}

/// Track SSL session creation.
#[uretprobe]
pub fn ssl_new_exit(ctx: RetProbeContext) -> u32 {
    let ssl: u64 = match ctx.ret() {
        Some(v) => v,
        None => return 0,
    };
    if ssl == 0 {
        return 0;
    }

    let session = SslSession {
        http_version: HTTP_VERSION_UNKNOWN,
        is_active: 0,
    };
    let _ = SSL_SESSIONS.insert(&ssl, &session, 0);
    0
}

/// Track SSL session destruction and notify userspace so reassembly state
/// is torn down.
#[uprobe]
pub fn ssl_free_entry(ctx: ProbeContext) -> u32 {
    let ssl: u64 = match ctx.arg(0) {
        Some(v) => v,
        None => return 0,
    };
    if ssl == 0 {
        return 0;
    }

    let _ = SSL_SESSIONS.remove(&ssl);

    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    let _ = SSL_READ_ARGS.remove(&pid);
    let _ = SSL_READ_EX_ARGS.remove(&pid);

    if let Some(mut entry) = EVENTS.reserve::<TlsFreeEvent>(0) {
        let ev = unsafe { &mut *entry.as_mut_ptr() };
        ev.header = EventHeader::zeroed();
        ev.header.event_type = EventType::TlsFree as u8;
        ev.header.pid = pid;
        ev.header.comm = current_comm();
        ev.ssl_ctx = ssl;
        entry.submit(0);
    }
    0
}

#[uprobe]
pub fn ssl_do_handshake_entry(ctx: ProbeContext) -> u32 {
    let ssl: u64 = match ctx.arg(0) {
        Some(v) => v,
        None => return 0,
    };

    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    let _ = SSL_HANDSHAKE_ARGS.insert(&pid, &ssl, 0);
    0
}

/// Mark the session active once the handshake succeeds.
#[uretprobe]
pub fn ssl_do_handshake_exit(ctx: RetProbeContext) -> u32 {
    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;

    let ssl = match unsafe { SSL_HANDSHAKE_ARGS.get(&pid) } {
        Some(s) => *s,
        None => return 0,
    };
    let _ = SSL_HANDSHAKE_ARGS.remove(&pid);

    let ret: i32 = match ctx.ret() {
        Some(v) => v,
        None => return 0,
    };
    if ret != 1 {
        return 0;
    }

    unsafe {
        if let Some(session) = SSL_SESSIONS.get_ptr_mut(&ssl) {
            (*session).is_active = 1;
        }
    }
    0
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
