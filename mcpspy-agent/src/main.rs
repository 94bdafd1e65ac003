mod bus;
mod config;
mod discovery;
mod hooks;
mod loader;
mod namespace;
mod output;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use tokio::signal;
use tokio::sync::watch;

use mcpspy_protocol::{FsSessionManager, HttpInput, McpParser, SessionOutput, TlsSessionManager};

use bus::{EventBus, LibraryEvent};
use config::Config;
use hooks::{HookWorker, LibraryManager};
use output::{ConsoleDisplay, JsonlWriter};

#[derive(Debug, Parser)]
#[command(name = "mcpspy")]
#[command(about = "Monitor Model Context Protocol communication")]
#[command(long_about = "mcpspy uses eBPF to reconstruct MCP (Model Context Protocol) \
conversations by analyzing JSON-RPC 2.0 messages over stdio pipes and TLS sessions.")]
struct Cli {
    /// Show raw message buffers
    #[arg(short = 'b', long = "buffers")]
    buffers: bool,

    /// Enable verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Output file (JSONL format)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        cli.log_level
            .parse::<LevelFilter>()
            .with_context(|| format!("invalid log level '{}'", cli.log_level))?
    };

    env_logger::Builder::new().filter_level(level).init();

    let config = Config::builder()
        .log_level(level)
        .show_buffers(cli.buffers)
        .jsonl_output(cli.output)
        .build();

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let console = Arc::new(ConsoleDisplay::new(
        Box::new(std::io::stdout()),
        config.show_buffers,
    ));
    console.print_header();

    let jsonl = match &config.jsonl_output {
        Some(path) => Some(Arc::new(JsonlWriter::create(path)?)),
        None => None,
    };

    let bus = EventBus::new();

    // Pipeline stages.
    let fs_sessions = Arc::new(FsSessionManager::new());
    let tls_sessions = Arc::new(TlsSessionManager::new());
    let parser = Arc::new(McpParser::new());

    wire_pipeline(
        &bus,
        fs_sessions,
        tls_sessions,
        parser,
        console.clone(),
        jsonl,
    );

    // Kernel side.
    console.print_info("Loading eBPF programs...");
    let (loader, ring) = loader::Loader::load()?;

    // Library hooking: worker thread + kernel event subscription +
    // startup discovery sweep.
    let own_mnt_ns = namespace::current_mount_namespace()
        .context("failed to resolve own mount namespace")?;
    let manager = LibraryManager::new(loader.attacher(), own_mnt_ns)?;
    let hook_worker = HookWorker::spawn(manager)?;

    {
        let sender = hook_worker.sender();
        bus.library.subscribe(move |ev: &LibraryEvent| {
            let mut ev = ev.clone();
            // The kernel reports 0 when the namespace chain could not be
            // read; fall back to /proc of the opening process.
            if ev.mnt_ns_id == 0 {
                if let Ok(ns) = namespace::mount_namespace_of(ev.pid as i32) {
                    ev.mnt_ns_id = ns as u32;
                }
            }
            let _ = sender.send(ev);
        });
    }

    let targets = discovery::discover();
    info!("discovered {} SSL targets", targets.len());
    for target in targets {
        hook_worker.submit(LibraryEvent {
            pid: target.pid,
            comm: String::new(),
            inode: target.inode,
            mnt_ns_id: target.mnt_ns_id as u32,
            path: target.path,
        });
    }

    // Ring buffer reader.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reader = tokio::spawn(loader::run_ring_reader(ring, bus.clone(), shutdown_rx));

    console.print_info("Monitoring MCP communication... Press Ctrl+C to stop");
    console.print_info("");

    signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    if let Err(e) = reader.await {
        warn!("ring reader task failed: {}", e);
    }
    hook_worker.close();

    console.print_stats();
    Ok(())
}

/// Connect the pipeline stages through the bus: kernel events flow into
/// the aggregators, aggregated payloads into the parser, and correlated
/// MCP events into the sinks.
fn wire_pipeline(
    bus: &Arc<EventBus>,
    fs_sessions: Arc<FsSessionManager>,
    tls_sessions: Arc<TlsSessionManager>,
    parser: Arc<McpParser>,
    console: Arc<ConsoleDisplay>,
    jsonl: Option<Arc<JsonlWriter>>,
) {
    // Stage D: raw stdio fragments -> aggregated JSON buffers.
    {
        let bus2 = bus.clone();
        bus.raw_data.subscribe(move |ev| {
            if let Some(agg) = fs_sessions.handle_data(ev) {
                bus2.fs_aggregated.publish(&agg);
            }
        });
    }

    // Stage C: TLS payloads -> HTTP messages and SSE records.
    {
        let bus2 = bus.clone();
        let tls = tls_sessions.clone();
        bus.tls_payload.subscribe(move |ev| {
            for output in tls.handle_payload(ev) {
                match output {
                    SessionOutput::Request(req) => bus2.http_request.publish(&req),
                    SessionOutput::Response(resp) => bus2.http_response.publish(&resp),
                    SessionOutput::Sse(sse) => bus2.sse.publish(&sse),
                }
            }
        });
    }
    {
        let tls = tls_sessions;
        bus.tls_free.subscribe(move |ev| tls.handle_free(ev.ssl_ctx));
    }

    // Stage E: aggregated payloads -> correlated MCP events.
    {
        let bus2 = bus.clone();
        let p = parser.clone();
        bus.fs_aggregated.subscribe(move |ev| {
            for mcp in p.parse_stdio(ev) {
                bus2.mcp.publish(&mcp);
            }
        });
    }
    {
        let bus2 = bus.clone();
        let p = parser.clone();
        bus.http_request.subscribe(move |ev| {
            for mcp in p.parse_http(HttpInput::Request(ev)) {
                bus2.mcp.publish(&mcp);
            }
        });
    }
    {
        let bus2 = bus.clone();
        let p = parser.clone();
        bus.http_response.subscribe(move |ev| {
            for mcp in p.parse_http(HttpInput::Response(ev)) {
                bus2.mcp.publish(&mcp);
            }
        });
    }
    {
        let bus2 = bus.clone();
        let p = parser;
        bus.sse.subscribe(move |ev| {
            for mcp in p.parse_http(HttpInput::Sse(ev)) {
                bus2.mcp.publish(&mcp);
            }
        });
    }

    // Sinks.
    {
        let console = console.clone();
        bus.mcp.subscribe(move |ev| console.print_message(ev));
    }
    if let Some(jsonl) = jsonl {
        bus.mcp.subscribe(move |ev| jsonl.write_event(ev));
    }
}
