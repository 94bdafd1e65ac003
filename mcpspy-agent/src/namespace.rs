//! Mount-namespace switching for cross-container uprobe attachment.
//!
//! The switcher opens its own mount namespace at construction (the
//! "home" fd) and can temporarily enter any other mount namespace by id.
//! Namespace fds are cached and revalidated with fstat, both on use and
//! by a background validator thread. Every `switch_to` must be paired
//! with a `restore` on the same OS thread — in practice the dedicated
//! library-hook worker thread, which is what keeps `setns` from leaking
//! into unrelated tasks.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsFd;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{trace, warn};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::fstat;

/// How often the background validator sweeps the fd cache.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Mount namespace id of the current process.
pub fn current_mount_namespace() -> Result<u64> {
    mount_namespace_of(std::process::id() as i32)
}

/// Mount namespace id of the given process.
pub fn mount_namespace_of(pid: i32) -> Result<u64> {
    let link = format!("/proc/{}/ns/mnt", pid);
    let target = std::fs::read_link(&link)
        .with_context(|| format!("failed to read mount namespace link {}", link))?;
    parse_ns_link(&target.to_string_lossy())
}

/// Parse a namespace link target of the form "mnt:[4026531840]".
fn parse_ns_link(target: &str) -> Result<u64> {
    let id = target
        .strip_prefix("mnt:[")
        .and_then(|rest| rest.strip_suffix(']'))
        .with_context(|| format!("unexpected namespace link format: {}", target))?;
    id.parse()
        .with_context(|| format!("failed to parse namespace id: {}", id))
}

/// Whether a namespace fd is still usable.
fn is_valid_fd(file: &File) -> bool {
    fstat(file.as_raw_fd()).is_ok()
}

/// Cache of namespace id -> opened fd. Writers are rare; reads happen on
/// every switch.
struct FdCache {
    fds: RwLock<HashMap<u64, Arc<File>>>,
}

impl FdCache {
    fn new() -> Self {
        FdCache {
            fds: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, ns_id: u64) -> Option<Arc<File>> {
        self.fds.read().unwrap().get(&ns_id).cloned()
    }

    fn set(&self, ns_id: u64, file: File) {
        self.fds.write().unwrap().insert(ns_id, Arc::new(file));
    }

    fn remove(&self, ns_id: u64) {
        self.fds.write().unwrap().remove(&ns_id);
    }

    fn clear(&self) {
        self.fds.write().unwrap().clear();
    }

    /// Drop every cached fd that no longer fstats cleanly.
    fn validate_and_clean(&self) {
        self.fds.write().unwrap().retain(|_, f| is_valid_fd(f));
    }

    fn len(&self) -> usize {
        self.fds.read().unwrap().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchState {
    Unlocked,
    Switched,
    Closed,
}

/// Temporarily switches the calling thread into other mount namespaces.
pub struct MountNamespaceSwitcher {
    home: File,
    cache: Arc<FdCache>,
    state: Mutex<SwitchState>,
    stop: Arc<AtomicBool>,
    validator: Mutex<Option<JoinHandle<()>>>,
}

impl MountNamespaceSwitcher {
    /// Open the current mount namespace as the restore target and start
    /// the background fd validator.
    pub fn new() -> Result<Self> {
        let home = File::open("/proc/self/ns/mnt")
            .context("failed to open current mount namespace")?;
        trace!("mount namespace switcher created, home fd {}", home.as_raw_fd());

        let cache = Arc::new(FdCache::new());
        let stop = Arc::new(AtomicBool::new(false));

        let validator = {
            let cache = cache.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("mcpspy-ns-validator".into())
                .spawn(move || loop {
                    let mut waited = Duration::ZERO;
                    while waited < CLEANUP_INTERVAL {
                        if stop.load(Ordering::Relaxed) {
                            return;
                        }
                        std::thread::sleep(Duration::from_millis(500));
                        waited += Duration::from_millis(500);
                    }
                    cache.validate_and_clean();
                })
                .context("failed to spawn namespace fd validator")?
        };

        Ok(MountNamespaceSwitcher {
            home,
            cache,
            state: Mutex::new(SwitchState::Unlocked),
            stop,
            validator: Mutex::new(Some(validator)),
        })
    }

    /// Enter the mount namespace with the given id. The calling thread
    /// stays in that namespace until `restore`.
    pub fn switch_to(&self, ns_id: u64) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            match *state {
                SwitchState::Unlocked => {}
                SwitchState::Switched => bail!("already switched, restore first"),
                SwitchState::Closed => bail!("switcher is closed"),
            }
        }

        trace!("switching to mount namespace {}", ns_id);

        if let Some(fd) = self.cache.get(ns_id) {
            if is_valid_fd(&fd) {
                match setns(fd.as_fd(), CloneFlags::CLONE_NEWNS) {
                    Ok(()) => {
                        *self.state.lock().unwrap() = SwitchState::Switched;
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("cached fd for namespace {} failed: {}, rescanning", ns_id, e);
                        self.cache.remove(ns_id);
                    }
                }
            } else {
                self.cache.remove(ns_id);
            }
        }

        let file = find_namespace_by_id(ns_id)
            .with_context(|| format!("failed to find mount namespace {}", ns_id))?;

        setns(file.as_fd(), CloneFlags::CLONE_NEWNS)
            .with_context(|| format!("failed to switch to mount namespace {}", ns_id))?;

        self.cache.set(ns_id, file);
        *self.state.lock().unwrap() = SwitchState::Switched;
        Ok(())
    }

    /// Return to the home mount namespace. Runs unconditionally so every
    /// exit path of an attach can call it.
    pub fn restore(&self) -> Result<()> {
        trace!("restoring home mount namespace");

        {
            let state = self.state.lock().unwrap();
            if *state == SwitchState::Closed {
                bail!("switcher is closed");
            }
        }

        setns(self.home.as_fd(), CloneFlags::CLONE_NEWNS)
            .context("failed to restore home mount namespace")?;

        *self.state.lock().unwrap() = SwitchState::Unlocked;
        Ok(())
    }

    /// Number of cached namespace fds (tests and diagnostics).
    pub fn cached_fds(&self) -> usize {
        self.cache.len()
    }

    /// Stop the validator and release every fd. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == SwitchState::Closed {
            return;
        }
        *state = SwitchState::Closed;
        drop(state);

        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.validator.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.cache.clear();
    }
}

impl Drop for MountNamespaceSwitcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Scan /proc for a process living in the target namespace and open its
/// ns link.
fn find_namespace_by_id(ns_id: u64) -> Result<File> {
    let proc = std::fs::read_dir("/proc").context("failed to read /proc")?;

    for entry in proc.flatten() {
        let name = entry.file_name();
        let pid: i32 = match name.to_string_lossy().parse() {
            Ok(p) => p,
            Err(_) => continue,
        };

        match mount_namespace_of(pid) {
            Ok(id) if id == ns_id => {
                let path = format!("/proc/{}/ns/mnt", pid);
                if let Ok(file) = File::open(Path::new(&path)) {
                    return Ok(file);
                }
            }
            _ => continue,
        }
    }

    bail!("no process found in mount namespace {}", ns_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ns_link_formats() {
        assert_eq!(parse_ns_link("mnt:[4026531840]").unwrap(), 4026531840);
        assert!(parse_ns_link("uts:[4026531840]").is_err());
        assert!(parse_ns_link("mnt:[abc]").is_err());
        assert!(parse_ns_link("garbage").is_err());
    }

    #[test]
    fn current_namespace_is_resolvable() {
        let ns = current_mount_namespace().unwrap();
        assert!(ns > 0);
        assert_eq!(ns, mount_namespace_of(std::process::id() as i32).unwrap());
    }

    #[test]
    fn unknown_pid_fails() {
        assert!(mount_namespace_of(-1).is_err());
    }

    #[test]
    fn fd_cache_set_get_remove() {
        let cache = FdCache::new();
        cache.set(1, File::open("/dev/null").unwrap());
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
        cache.remove(1);
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn fd_cache_validation_keeps_live_fds() {
        let cache = FdCache::new();
        cache.set(1, File::open("/dev/null").unwrap());
        cache.validate_and_clean();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn switcher_close_is_idempotent() {
        let sw = MountNamespaceSwitcher::new().unwrap();
        sw.close();
        sw.close();
        assert!(sw.switch_to(1).is_err());
        assert!(sw.restore().is_err());
    }

    #[test]
    fn switch_to_own_namespace_and_restore() {
        let sw = MountNamespaceSwitcher::new().unwrap();
        let ns = current_mount_namespace().unwrap();

        // Entering our own namespace needs no privileges beyond what we
        // already hold; skip quietly where even that is denied.
        match sw.switch_to(ns) {
            Ok(()) => {
                sw.restore().unwrap();
            }
            Err(e) => {
                eprintln!("skipping setns test (insufficient privileges): {:#}", e);
            }
        }
        sw.close();
    }
}
