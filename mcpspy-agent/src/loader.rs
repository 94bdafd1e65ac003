//! eBPF program lifecycle: loading, attachment, and the ring-buffer
//! reader that demultiplexes kernel events onto the bus.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use aya::{
    include_bytes_aligned,
    maps::{Array, MapData, RingBuf},
    programs::{FEntry, FExit, UProbe},
    Btf, Ebpf,
};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;

use mcpspy_types::{
    DataEvent, EventType, LibraryEvent as RawLibraryEvent, TlsFreeEvent as RawTlsFreeEvent,
    TlsPayloadEvent as RawTlsPayloadEvent,
};

use mcpspy_protocol::event::StdioDirection;
use mcpspy_protocol::{RawDataEvent, TlsDirection, TlsPayloadInput};

use crate::bus::{EventBus, LibraryEvent, TlsFreeEvent};
use crate::hooks::SslProbeAttacher;

/// Uprobe programs and the library symbols they attach to.
const SSL_PROBES: &[(&str, &str)] = &[
    ("ssl_read_entry", "SSL_read"),
    ("ssl_read_exit", "SSL_read"),
    ("ssl_write_entry", "SSL_write"),
    ("ssl_read_ex_entry", "SSL_read_ex"),
    ("ssl_read_ex_exit", "SSL_read_ex"),
    ("ssl_write_ex_entry", "SSL_write_ex"),
    ("ssl_new_exit", "SSL_new"),
    ("ssl_free_entry", "SSL_free"),
    ("ssl_do_handshake_entry", "SSL_do_handshake"),
    ("ssl_do_handshake_exit", "SSL_do_handshake"),
];

/// Owns the loaded eBPF object. Program attachment for libraries happens
/// through [`ProbeAttacher`] clones, which share the object behind a
/// mutex with the loader.
pub struct Loader {
    bpf: Arc<Mutex<Ebpf>>,
}

impl Loader {
    /// Load the kernel object and attach the always-on hooks. A failure
    /// to attach any single hook degrades coverage but does not abort;
    /// failure to load the object itself is fatal.
    pub fn load() -> Result<(Self, RingBuf<MapData>)> {
        // Bump the memlock rlimit for pre-5.11 kernels without cgroup
        // accounting.
        let rlim = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) } != 0 {
            warn!("failed to raise memlock rlimit");
        }

        let mut bpf = Ebpf::load(include_bytes_aligned!(concat!(
            env!("OUT_DIR"),
            "/mcpspy-ebpf"
        )))
        .context("failed to load eBPF object (was the BPF build skipped?)")?;

        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("failed to initialize eBPF logger: {}", e);
        }

        // Let the kernel filter out our own stdio.
        {
            let map = bpf
                .map_mut("SELF_PID")
                .ok_or_else(|| anyhow!("SELF_PID map missing"))?;
            let mut arr: Array<_, u32> = Array::try_from(map)?;
            arr.set(0, std::process::id(), 0)?;
        }

        info!("loading eBPF programs");

        match Btf::from_sys_fs() {
            Ok(btf) => {
                attach_fexit(&mut bpf, "exit_vfs_read", "vfs_read", &btf);
                attach_fexit(&mut bpf, "exit_vfs_write", "vfs_write", &btf);
                attach_fentry(&mut bpf, "trace_security_file_open", "security_file_open", &btf);
            }
            Err(e) => {
                warn!("BTF unavailable, stdio and discovery hooks disabled: {}", e);
            }
        }

        // Load (but do not yet attach) the SSL uprobes; attachment
        // happens per discovered library.
        for &(prog_name, _) in SSL_PROBES {
            let prog: &mut UProbe = bpf
                .program_mut(prog_name)
                .ok_or_else(|| anyhow!("program {} missing", prog_name))?
                .try_into()?;
            prog.load()
                .with_context(|| format!("failed to load {}", prog_name))?;
        }

        let ring = RingBuf::try_from(
            bpf.take_map("EVENTS")
                .ok_or_else(|| anyhow!("EVENTS map missing"))?,
        )
        .context("failed to open ring buffer")?;

        info!("eBPF programs loaded");

        Ok((
            Loader {
                bpf: Arc::new(Mutex::new(bpf)),
            },
            ring,
        ))
    }

    pub fn attacher(&self) -> ProbeAttacher {
        ProbeAttacher {
            bpf: self.bpf.clone(),
        }
    }
}

fn attach_fexit(bpf: &mut Ebpf, prog_name: &str, fn_name: &str, btf: &Btf) {
    let result = (|| -> Result<()> {
        let prog: &mut FExit = bpf
            .program_mut(prog_name)
            .ok_or_else(|| anyhow!("program {} missing", prog_name))?
            .try_into()?;
        prog.load(fn_name, btf)?;
        prog.attach()?;
        Ok(())
    })();

    match result {
        Ok(()) => info!("attached fexit/{}", fn_name),
        Err(e) => warn!("failed to attach fexit/{}: {:#}", fn_name, e),
    }
}

fn attach_fentry(bpf: &mut Ebpf, prog_name: &str, fn_name: &str, btf: &Btf) {
    let result = (|| -> Result<()> {
        let prog: &mut FEntry = bpf
            .program_mut(prog_name)
            .ok_or_else(|| anyhow!("program {} missing", prog_name))?
            .try_into()?;
        prog.load(fn_name, btf)?;
        prog.attach()?;
        Ok(())
    })();

    match result {
        Ok(()) => info!("attached fentry/{}", fn_name),
        Err(e) => warn!("failed to attach fentry/{}: {:#}", fn_name, e),
    }
}

/// Attaches the SSL probe set to a library path. Cheap to clone; used
/// from the hook worker thread.
#[derive(Clone)]
pub struct ProbeAttacher {
    bpf: Arc<Mutex<Ebpf>>,
}

impl SslProbeAttacher for ProbeAttacher {
    fn attach_ssl_probes(&self, library_path: &Path) -> Result<()> {
        let mut bpf = self.bpf.lock().unwrap();
        let mut attached = 0usize;

        for &(prog_name, symbol) in SSL_PROBES {
            let prog: &mut UProbe = match bpf.program_mut(prog_name) {
                Some(p) => p.try_into()?,
                None => continue,
            };
            match prog.attach(Some(symbol), 0, library_path, None) {
                Ok(_) => {
                    attached += 1;
                    debug!("attached {} to {} at {}", prog_name, symbol, library_path.display());
                }
                Err(e) => {
                    // Older OpenSSL builds lack the _ex symbols; static
                    // binaries may strip everything.
                    debug!(
                        "could not attach {} to {} at {}: {}",
                        prog_name,
                        symbol,
                        library_path.display(),
                        e
                    );
                }
            }
        }

        if attached == 0 {
            anyhow::bail!("no SSL symbols found in {}", library_path.display());
        }
        Ok(())
    }
}

/// Reads kernel events off the ring buffer and publishes them on the
/// bus. Cancelling the shutdown signal drains and exits.
pub async fn run_ring_reader(
    ring: RingBuf<MapData>,
    bus: Arc<EventBus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut fd = match AsyncFd::new(ring) {
        Ok(fd) => fd,
        Err(e) => {
            warn!("failed to register ring buffer with the reactor: {}", e);
            return;
        }
    };

    loop {
        let mut guard = tokio::select! {
            guard = fd.readable_mut() => match guard {
                Ok(g) => g,
                Err(e) => {
                    warn!("ring buffer poll error: {}", e);
                    break;
                }
            },
            _ = shutdown.changed() => {
                debug!("ring buffer reader shutting down");
                break;
            }
        };

        let ring = guard.get_inner_mut();
        while let Some(item) = ring.next() {
            dispatch_record(&item, &bus);
        }
        guard.clear_ready();
    }
}

/// Decode one ring-buffer record by its type tag and publish it.
fn dispatch_record(item: &[u8], bus: &EventBus) {
    let tag = match item.first().copied().and_then(EventType::from_u8) {
        Some(t) => t,
        None => {
            warn!("ring buffer record with unknown tag, {} bytes", item.len());
            return;
        }
    };

    match tag {
        EventType::Read | EventType::Write => {
            if item.len() < std::mem::size_of::<DataEvent>() {
                warn!("truncated data event ({} bytes)", item.len());
                return;
            }
            let ev = unsafe { (item.as_ptr() as *const DataEvent).read_unaligned() };
            let direction = if tag == EventType::Read {
                StdioDirection::Read
            } else {
                StdioDirection::Write
            };
            bus.raw_data.publish(&RawDataEvent {
                direction,
                pid: ev.header.pid,
                comm: ev.header.comm_str().to_string(),
                file_ptr: ev.file_ptr,
                from_pid: ev.from_pid,
                from_comm: ev.from_comm_str().to_string(),
                to_pid: ev.to_pid,
                to_comm: ev.to_comm_str().to_string(),
                payload: ev.payload().to_vec(),
            });
        }
        EventType::Library => {
            if item.len() < std::mem::size_of::<RawLibraryEvent>() {
                warn!("truncated library event ({} bytes)", item.len());
                return;
            }
            let ev = unsafe { (item.as_ptr() as *const RawLibraryEvent).read_unaligned() };
            bus.library.publish(&LibraryEvent {
                pid: ev.header.pid,
                comm: ev.header.comm_str().to_string(),
                inode: ev.inode,
                mnt_ns_id: ev.mnt_ns_id,
                path: std::path::PathBuf::from(ev.path_str()),
            });
        }
        EventType::TlsPayloadSend | EventType::TlsPayloadRecv => {
            if item.len() < std::mem::size_of::<RawTlsPayloadEvent>() {
                warn!("truncated TLS payload event ({} bytes)", item.len());
                return;
            }
            let ev = unsafe { (item.as_ptr() as *const RawTlsPayloadEvent).read_unaligned() };
            let direction = if tag == EventType::TlsPayloadSend {
                TlsDirection::Send
            } else {
                TlsDirection::Recv
            };
            if ev.truncated() {
                debug!(
                    "TLS payload truncated: {} of {} bytes captured (ssl_ctx {:#x})",
                    ev.buf_size, ev.size, ev.ssl_ctx
                );
            }
            bus.tls_payload.publish(&TlsPayloadInput {
                pid: ev.header.pid,
                comm: ev.header.comm_str().to_string(),
                ssl_ctx: ev.ssl_ctx,
                http_version: ev.http_version,
                direction,
                payload: ev.payload().to_vec(),
            });
        }
        EventType::TlsFree => {
            if item.len() < std::mem::size_of::<RawTlsFreeEvent>() {
                warn!("truncated TLS free event ({} bytes)", item.len());
                return;
            }
            let ev = unsafe { (item.as_ptr() as *const RawTlsFreeEvent).read_unaligned() };
            bus.tls_free.publish(&TlsFreeEvent {
                pid: ev.header.pid,
                ssl_ctx: ev.ssl_ctx,
            });
        }
    }
}
