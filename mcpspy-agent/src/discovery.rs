//! Startup enumeration of SSL targets: libssl shared objects on disk,
//! known statically-linked binaries, and libraries already mapped by
//! running processes. Libraries loaded later are caught by the kernel's
//! security_file_open hook.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::namespace::mount_namespace_of;

/// Directories searched for dynamic libssl builds.
const LIBRARY_DIRS: &[&str] = &[
    "/usr/lib",
    "/usr/lib64",
    "/usr/local/lib",
    "/usr/local/lib64",
    "/lib",
    "/lib64",
];

/// Binaries known to statically link OpenSSL.
const STATIC_SSL_BINARIES: &[&str] = &["node", "deno", "python3", "python", "curl", "nginx", "envoy"];

/// How deep the library directory walk descends (multiarch layouts are
/// one level down, e.g. /usr/lib/x86_64-linux-gnu).
const MAX_WALK_DEPTH: usize = 3;

/// A discovered SSL library or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslTarget {
    pub path: PathBuf,
    /// Process the target was found in; 0 when found on disk.
    pub pid: u32,
    pub inode: u64,
    pub mnt_ns_id: u64,
}

/// Enumerate all SSL targets visible right now.
pub fn discover() -> Vec<SslTarget> {
    let own_ns = mount_namespace_of(std::process::id() as i32).unwrap_or(0);
    let mut targets = Vec::new();

    for dir in LIBRARY_DIRS {
        walk_for_libssl(Path::new(dir), 0, own_ns, &mut targets);
    }

    discover_static_binaries(own_ns, &mut targets);

    if let Err(e) = discover_from_proc(&mut targets) {
        warn!("failed to scan /proc for SSL libraries: {}", e);
    }

    deduplicate(targets)
}

fn walk_for_libssl(dir: &Path, depth: usize, mnt_ns: u64, out: &mut Vec<SslTarget>) {
    if depth > MAX_WALK_DEPTH {
        return;
    }
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };

        if meta.is_dir() {
            walk_for_libssl(&path, depth + 1, mnt_ns, out);
            continue;
        }

        let name = entry.file_name();
        if name.to_string_lossy().contains("libssl.so") {
            debug!("found dynamic SSL library: {}", path.display());
            out.push(SslTarget {
                path,
                pid: 0,
                inode: meta.ino(),
                mnt_ns_id: mnt_ns,
            });
        }
    }
}

fn discover_static_binaries(mnt_ns: u64, out: &mut Vec<SslTarget>) {
    let mut dirs: Vec<PathBuf> = std::env::var("PATH")
        .unwrap_or_default()
        .split(':')
        .map(PathBuf::from)
        .collect();
    dirs.extend(
        ["/usr/bin", "/usr/local/bin", "/usr/sbin", "/usr/local/sbin"]
            .iter()
            .map(PathBuf::from),
    );

    for dir in dirs {
        for name in STATIC_SSL_BINARIES {
            let path = dir.join(name);
            let meta = match fs::metadata(&path) {
                Ok(m) if !m.is_dir() => m,
                _ => continue,
            };
            debug!("found static SSL binary: {}", path.display());
            out.push(SslTarget {
                path,
                pid: 0,
                inode: meta.ino(),
                mnt_ns_id: mnt_ns,
            });
        }
    }
}

/// Scan /proc/<pid>/maps of every process for mapped libssl copies, and
/// check process executables against the static binary list. Containers
/// show up here with their own mount namespace ids.
fn discover_from_proc(out: &mut Vec<SslTarget>) -> std::io::Result<()> {
    for entry in fs::read_dir("/proc")?.flatten() {
        let pid: u32 = match entry.file_name().to_string_lossy().parse() {
            Ok(p) => p,
            Err(_) => continue,
        };

        let mnt_ns = mount_namespace_of(pid as i32).unwrap_or(0);

        let maps = match fs::read_to_string(format!("/proc/{}/maps", pid)) {
            Ok(m) => m,
            Err(_) => continue,
        };
        for line in maps.lines() {
            if !line.contains("libssl.so") {
                continue;
            }
            let lib_path = match line.split_whitespace().nth(5) {
                Some(p) if p.starts_with('/') => PathBuf::from(p),
                _ => continue,
            };
            // Resolve through the process root so container paths work.
            let rooted = PathBuf::from(format!("/proc/{}/root{}", pid, lib_path.display()));
            let meta_path = if rooted.exists() { &rooted } else { &lib_path };
            let inode = fs::metadata(meta_path).map(|m| m.ino()).unwrap_or(0);

            debug!("found SSL library in process {}: {}", pid, lib_path.display());
            out.push(SslTarget {
                path: lib_path,
                pid,
                inode,
                mnt_ns_id: mnt_ns,
            });
        }

        if let Ok(exe) = fs::read_link(format!("/proc/{}/exe", pid)) {
            let base = exe
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if STATIC_SSL_BINARIES.contains(&base.as_str()) {
                let inode = fs::metadata(&exe).map(|m| m.ino()).unwrap_or(0);
                debug!("found static SSL binary process {}: {}", pid, exe.display());
                out.push(SslTarget {
                    path: exe,
                    pid,
                    inode,
                    mnt_ns_id: mnt_ns,
                });
            }
        }
    }
    Ok(())
}

fn deduplicate(targets: Vec<SslTarget>) -> Vec<SslTarget> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|t| seen.insert((t.path.clone(), t.mnt_ns_id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduplicate_by_path_and_namespace() {
        let t = |path: &str, ns: u64| SslTarget {
            path: PathBuf::from(path),
            pid: 0,
            inode: 1,
            mnt_ns_id: ns,
        };
        let out = deduplicate(vec![
            t("/usr/lib/libssl.so.3", 1),
            t("/usr/lib/libssl.so.3", 1),
            t("/usr/lib/libssl.so.3", 2),
        ]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn discover_does_not_panic() {
        // Runs against the live system; contents vary, the walk must not
        // blow up either way.
        let targets = discover();
        for t in &targets {
            assert!(t.path.is_absolute());
        }
    }
}
