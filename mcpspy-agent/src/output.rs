//! Event consumers: console rendering and JSONL file output.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::warn;

use mcpspy_protocol::{jsonrpc, JsonRpcMessageType, McpEvent, TransportType};

/// Formats one line per MCP event plus a shutdown statistics table.
pub struct ConsoleDisplay {
    writer: Mutex<Box<dyn Write + Send>>,
    show_buffers: bool,
    stats: Mutex<HashMap<String, u64>>,
}

impl ConsoleDisplay {
    pub fn new(writer: Box<dyn Write + Send>, show_buffers: bool) -> Self {
        ConsoleDisplay {
            writer: Mutex::new(writer),
            show_buffers,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn print_header(&self) {
        let mut w = self.writer.lock().unwrap();
        let _ = writeln!(w, "mcpspy - Model Context Protocol monitor");
        let _ = writeln!(w, "{}", "-".repeat(80));
    }

    pub fn print_info(&self, msg: &str) {
        let mut w = self.writer.lock().unwrap();
        let _ = writeln!(w, "{}", msg);
    }

    /// One line: timestamp, transport flow, message info.
    pub fn print_message(&self, ev: &McpEvent) {
        if let Some(method) = ev.message.method.as_deref() {
            *self
                .stats
                .lock()
                .unwrap()
                .entry(method.to_string())
                .or_insert(0) += 1;
        }

        let ts = ev.timestamp.format("%H:%M:%S%.3f");
        let flow = format_flow(ev);
        let info = format_message_info(ev);

        let mut w = self.writer.lock().unwrap();
        let _ = writeln!(w, "{} {} {}", ts, flow, info);

        if self.show_buffers && !ev.raw.is_empty() {
            let _ = write_buffer(&mut **w, &ev.raw);
        }
    }

    /// Per-method counters, printed at shutdown.
    pub fn print_stats(&self) {
        let stats = self.stats.lock().unwrap();
        let mut w = self.writer.lock().unwrap();

        let _ = writeln!(w, "\n{}", "-".repeat(80));
        let _ = writeln!(w, "Statistics:");
        let mut entries: Vec<_> = stats.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        for (method, count) in entries {
            let _ = writeln!(w, "  {:<40} {}", method, count);
        }
    }
}

fn format_flow(ev: &McpEvent) -> String {
    match ev.transport_type {
        TransportType::Stdio => match &ev.stdio_transport {
            Some(t) => format!(
                "STDIO {}[{}] -> {}[{}]",
                t.from_comm, t.from_pid, t.to_comm, t.to_pid
            ),
            None => "STDIO ?".to_string(),
        },
        TransportType::Http => match &ev.http_transport {
            Some(t) if t.is_request => {
                format!("HTTP  {}[{}] -> {}", t.comm, t.pid, t.host)
            }
            Some(t) => format!("HTTP  {} -> {}[{}]", t.host, t.comm, t.pid),
            None => "HTTP  ?".to_string(),
        },
    }
}

fn format_message_info(ev: &McpEvent) -> String {
    let msg = &ev.message;
    let id = msg
        .id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());

    match msg.message_type {
        JsonRpcMessageType::Request => {
            let method = msg.method.as_deref().unwrap_or("");
            let mut info = format!("[{}] REQ  {}", id, method);
            if let Some(tool) = msg.tool_name() {
                info.push_str(&format!(" ({})", tool));
            } else if let Some(uri) = msg.resource_uri() {
                info.push_str(&format!(" ({})", uri));
            }
            info.push_str(&format!("  {}", jsonrpc::method_description(method)));
            info
        }
        JsonRpcMessageType::Response => match &msg.error {
            Some(err) => format!("[{}] ERR  {} (code: {})", id, err.message, err.code),
            None => format!("[{}] RESP OK", id),
        },
        JsonRpcMessageType::Notification => {
            let method = msg.method.as_deref().unwrap_or("");
            format!(
                "[-] NOTF {}  {}",
                method,
                jsonrpc::method_description(method)
            )
        }
    }
}

/// Pretty-print the raw JSON inside a bordered block.
fn write_buffer(w: &mut dyn Write, raw: &str) -> std::io::Result<()> {
    let pretty = serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| raw.to_string());

    writeln!(w, "+----")?;
    for line in pretty.lines() {
        if !line.is_empty() {
            writeln!(w, "| {}", line)?;
        }
    }
    writeln!(w, "+----")
}

/// Writes each event as one JSON line.
pub struct JsonlWriter {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create output file {}", path.display()))?;
        Ok(JsonlWriter {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn write_event(&self, ev: &McpEvent) {
        let mut w = self.writer.lock().unwrap();
        match serde_json::to_string(ev) {
            Ok(json) => {
                if writeln!(w, "{}", json).and_then(|_| w.flush()).is_err() {
                    warn!("failed to write JSONL event");
                }
            }
            Err(e) => warn!("failed to serialize event: {}", e),
        }
    }
}
