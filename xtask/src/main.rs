use anyhow::{Context, Result};
use clap::Parser;
use std::process::Command;

#[derive(Debug, Parser)]
pub struct Options {
    #[clap(subcommand)]
    command: Subcommand,
}

#[derive(Debug, Parser)]
enum Subcommand {
    /// Build the eBPF programs
    BuildEbpf(BuildEbpfOptions),
    /// Build the entire project (eBPF + userspace)
    Build(BuildOptions),
    /// Run the agent (builds everything first)
    Run(RunOptions),
}

#[derive(Debug, Parser)]
pub struct BuildEbpfOptions {
    /// Build in release mode
    #[clap(long)]
    release: bool,
    /// Target architecture
    #[clap(long, default_value = "bpfel-unknown-none")]
    target: String,
}

#[derive(Debug, Parser)]
pub struct BuildOptions {
    /// Build in release mode
    #[clap(long)]
    release: bool,
}

#[derive(Debug, Parser)]
pub struct RunOptions {
    /// Build in release mode
    #[clap(long)]
    release: bool,
    /// Arguments to pass to the agent
    #[clap(last = true)]
    run_args: Vec<String>,
}

fn main() {
    if let Err(e) = try_main() {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let opts = Options::parse();

    match opts.command {
        Subcommand::BuildEbpf(opts) => build_ebpf(opts),
        Subcommand::Build(opts) => {
            build_ebpf(BuildEbpfOptions {
                release: opts.release,
                target: "bpfel-unknown-none".to_string(),
            })?;
            build_userspace(opts.release)
        }
        Subcommand::Run(opts) => {
            build_ebpf(BuildEbpfOptions {
                release: opts.release,
                target: "bpfel-unknown-none".to_string(),
            })?;
            build_userspace(opts.release)?;
            run_agent(opts)
        }
    }
}

fn build_ebpf(opts: BuildEbpfOptions) -> Result<()> {
    let mut args = vec![
        "run",
        "nightly",
        "cargo",
        "build",
        "--package",
        "mcpspy-ebpf",
        "-Z",
        "build-std=core",
        "--target",
        &opts.target,
    ];
    if opts.release {
        args.push("--release");
    }

    let status = Command::new("rustup")
        .args(&args)
        .status()
        .context("failed to run rustup (is the nightly toolchain installed?)")?;
    anyhow::ensure!(status.success(), "eBPF build failed");
    Ok(())
}

fn build_userspace(release: bool) -> Result<()> {
    let mut args = vec!["build", "--package", "mcpspy-agent"];
    if release {
        args.push("--release");
    }

    let status = Command::new("cargo")
        .args(&args)
        .status()
        .context("failed to run cargo")?;
    anyhow::ensure!(status.success(), "userspace build failed");
    Ok(())
}

fn run_agent(opts: RunOptions) -> Result<()> {
    let profile = if opts.release { "release" } else { "debug" };
    let bin = format!("target/{}/mcpspy", profile);

    // Tracing needs root.
    let status = Command::new("sudo")
        .arg(&bin)
        .args(&opts.run_args)
        .status()
        .with_context(|| format!("failed to run {}", bin))?;
    anyhow::ensure!(status.success(), "agent exited with failure");
    Ok(())
}
