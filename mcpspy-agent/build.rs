use std::env;
use std::ffi::OsString;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let dst = out_dir.join("mcpspy-ebpf");

    // Escape hatch: skip eBPF compilation (CI, or when xtask already
    // built it). The resulting stub object fails Ebpf::load at runtime.
    if env::var("MCPSPY_SKIP_EBPF_BUILD").is_ok() {
        write_stub(&dst);
        return;
    }

    let ebpf_dir = match find_ebpf_crate() {
        Some(dir) => dir,
        None => {
            println!("cargo:warning=mcpspy-ebpf crate not found, writing stub BPF object");
            write_stub(&dst);
            return;
        }
    };

    println!("cargo:rerun-if-changed={}", ebpf_dir.display());
    println!("cargo:rerun-if-env-changed=MCPSPY_SKIP_EBPF_BUILD");

    if !nightly_available() {
        println!(
            "cargo:warning=rustup nightly toolchain unavailable, writing stub BPF object \
             (run `cargo xtask build-ebpf` on a configured host)"
        );
        write_stub(&dst);
        return;
    }

    if let Err(e) = compile_ebpf(&ebpf_dir, &out_dir, &dst) {
        println!("cargo:warning=BPF build failed ({e}), writing stub BPF object");
        write_stub(&dst);
    }
}

fn write_stub(dst: &Path) {
    std::fs::write(dst, []).unwrap();
}

/// The eBPF crate lives next to this one in the workspace.
fn find_ebpf_crate() -> Option<PathBuf> {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").ok()?);
    let dir = manifest_dir.parent()?.join("mcpspy-ebpf");
    dir.join("Cargo.toml").exists().then_some(dir)
}

fn nightly_available() -> bool {
    Command::new("rustup")
        .args(["run", "nightly", "rustc", "--version"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Compile mcpspy-ebpf for the BPF target with build-std, mirroring what
/// `cargo xtask build-ebpf` does, and copy the object into OUT_DIR.
fn compile_ebpf(ebpf_dir: &Path, out_dir: &Path, dst: &Path) -> Result<(), String> {
    let endian = env::var("CARGO_CFG_TARGET_ENDIAN").map_err(|e| e.to_string())?;
    let target = match endian.as_str() {
        "little" => "bpfel-unknown-none",
        "big" => "bpfeb-unknown-none",
        other => return Err(format!("unsupported endian: {other}")),
    };

    let arch = env::var("CARGO_CFG_TARGET_ARCH").map_err(|e| e.to_string())?;

    let mut rustflags = OsString::new();
    for s in [
        "--cfg=bpf_target_arch=\"",
        &arch,
        "\"",
        "\x1f",
        "-Cdebuginfo=2",
        "\x1f",
        "-Clink-arg=--btf",
    ] {
        rustflags.push(s);
    }

    // A target dir that cannot collide with the output binary name.
    let target_dir = out_dir.join("ebpf-target");

    let mut cmd = Command::new("rustup");
    cmd.args([
        "run",
        "nightly",
        "cargo",
        "build",
        "--package",
        "mcpspy-ebpf",
        "-Z",
        "build-std=core",
        "--bins",
        "--message-format=json",
        "--release",
        "--target",
        target,
        "--target-dir",
    ]);
    cmd.arg(&target_dir);
    cmd.env("CARGO_ENCODED_RUSTFLAGS", rustflags);
    cmd.env_remove("RUSTC");
    cmd.env_remove("RUSTC_WORKSPACE_WRAPPER");
    cmd.current_dir(ebpf_dir);

    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("failed to spawn cargo: {e}"))?;

    // Find the compiled binary in the JSON build messages.
    let stdout = child.stdout.take().unwrap();
    let mut binary_path: Option<PathBuf> = None;
    for line in std::io::BufReader::new(stdout).lines().map_while(Result::ok) {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&line) {
            if json.get("reason").and_then(|v| v.as_str()) == Some("compiler-artifact") {
                if let Some(exe) = json.get("executable").and_then(|v| v.as_str()) {
                    binary_path = Some(PathBuf::from(exe));
                }
            }
        }
    }

    let status = child
        .wait()
        .map_err(|e| format!("failed to wait for cargo: {e}"))?;
    if !status.success() {
        return Err(format!("cargo build for mcpspy-ebpf failed: {status}"));
    }

    let binary = binary_path.ok_or("mcpspy-ebpf binary not found in cargo output")?;
    std::fs::copy(&binary, dst)
        .map_err(|e| format!("failed to copy {} to {}: {e}", binary.display(), dst.display()))?;
    Ok(())
}
