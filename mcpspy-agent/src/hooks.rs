//! Library hook management: attaches SSL uprobes to each discovered
//! library exactly once, switching mount namespaces when the library
//! lives in a container.
//!
//! The manager runs on a dedicated worker thread fed by a channel. The
//! bus subscriber only forwards events into the channel, so publishers
//! never block; the worker thread is also what satisfies the OS-thread
//! pinning `setns` requires.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use log::{debug, trace, warn};

use crate::bus::LibraryEvent;
use crate::namespace::MountNamespaceSwitcher;

/// Something that can attach the SSL probe set to a library path.
pub trait SslProbeAttacher: Send + 'static {
    fn attach_ssl_probes(&self, library_path: &Path) -> Result<()>;
}

/// Tracks which library inodes are hooked and which failed. Failures are
/// sticky: a library that failed once is never retried.
pub struct LibraryManager<A: SslProbeAttacher> {
    attacher: A,
    own_mnt_ns: u64,
    switcher: MountNamespaceSwitcher,
    hooked: HashMap<u64, PathBuf>,
    failed: HashMap<u64, String>,
}

impl<A: SslProbeAttacher> LibraryManager<A> {
    pub fn new(attacher: A, own_mnt_ns: u64) -> Result<Self> {
        let switcher =
            MountNamespaceSwitcher::new().context("failed to create mount namespace switcher")?;

        Ok(LibraryManager {
            attacher,
            own_mnt_ns,
            switcher,
            hooked: HashMap::new(),
            failed: HashMap::new(),
        })
    }

    /// Hook one observed library. No-op when the inode is already hooked
    /// or previously failed.
    pub fn process_library_event(&mut self, event: &LibraryEvent) -> Result<()> {
        let inode = event.inode;
        let path = &event.path;
        let target_ns = u64::from(event.mnt_ns_id);

        if let Some(hooked_path) = self.hooked.get(&inode) {
            trace!(
                "library already hooked: inode {} path {} (hooked as {})",
                inode,
                path.display(),
                hooked_path.display()
            );
            return Ok(());
        }

        if let Some(err) = self.failed.get(&inode) {
            trace!(
                "library previously failed, skipping: inode {} path {} ({})",
                inode,
                path.display(),
                err
            );
            return Ok(());
        }

        let result = if target_ns != 0 && target_ns != self.own_mnt_ns {
            self.attach_in_namespace(path, target_ns)
        } else {
            self.attacher.attach_ssl_probes(path)
        };

        match result {
            Ok(()) => {
                debug!(
                    "attached SSL probes: inode {} path {} mnt_ns {}",
                    inode,
                    path.display(),
                    target_ns
                );
                self.hooked.insert(inode, path.clone());
                Ok(())
            }
            Err(e) => {
                // First failure for this inode gets a warning; the sticky
                // entry silences every later observation.
                warn!(
                    "failed to attach SSL probes to {} (inode {}): {:#}",
                    path.display(),
                    inode,
                    e
                );
                self.failed.insert(inode, format!("{:#}", e));
                Err(e)
            }
        }
    }

    /// Attach inside another mount namespace. Restore runs on every exit
    /// path; a restore failure is logged but the attach error (if any) is
    /// what propagates.
    fn attach_in_namespace(&self, path: &Path, target_ns: u64) -> Result<()> {
        debug!(
            "switching mount namespace {} -> {} to attach {}",
            self.own_mnt_ns,
            target_ns,
            path.display()
        );

        self.switcher
            .switch_to(target_ns)
            .with_context(|| format!("failed to switch to mount namespace {}", target_ns))?;

        let attach_result = self.attacher.attach_ssl_probes(path);

        if let Err(restore_err) = self.switcher.restore() {
            warn!(
                "failed to restore mount namespace after attaching {}: {:#}",
                path.display(),
                restore_err
            );
        }

        attach_result
    }

    /// (hooked, failed) counts.
    pub fn stats(&self) -> (usize, usize) {
        (self.hooked.len(), self.failed.len())
    }

    pub fn close(&self) {
        self.switcher.close();
    }
}

/// Handle to the hook worker thread.
pub struct HookWorker {
    tx: Sender<LibraryEvent>,
    handle: Option<JoinHandle<()>>,
}

impl HookWorker {
    /// Spawn the worker around a manager. Events sent to the returned
    /// handle are processed strictly in order on one thread.
    pub fn spawn<A: SslProbeAttacher>(mut manager: LibraryManager<A>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<LibraryEvent>();

        let handle = std::thread::Builder::new()
            .name("mcpspy-hooks".into())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    // Failures are recorded in the manager; nothing to do here.
                    let _ = manager.process_library_event(&event);
                }
                manager.close();
            })
            .context("failed to spawn library hook worker")?;

        Ok(HookWorker {
            tx,
            handle: Some(handle),
        })
    }

    /// Queue an event for the worker. Never blocks.
    pub fn submit(&self, event: LibraryEvent) {
        let _ = self.tx.send(event);
    }

    /// A sender usable from bus subscribers.
    pub fn sender(&self) -> Sender<LibraryEvent> {
        self.tx.clone()
    }

    /// Drop the channel and wait for the worker to drain.
    pub fn close(mut self) {
        drop(self.tx);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingAttacher {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl SslProbeAttacher for CountingAttacher {
        fn attach_ssl_probes(&self, _path: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("attach refused");
            }
            Ok(())
        }
    }

    fn event(inode: u64, path: &str) -> LibraryEvent {
        LibraryEvent {
            pid: 1,
            comm: "node".into(),
            inode,
            mnt_ns_id: 0,
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn hooks_each_inode_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut mgr = LibraryManager::new(
            CountingAttacher {
                calls: calls.clone(),
                fail: false,
            },
            1,
        )
        .unwrap();

        mgr.process_library_event(&event(10, "/usr/lib/libssl.so.3"))
            .unwrap();
        mgr.process_library_event(&event(10, "/usr/lib/libssl.so.3"))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.stats(), (1, 0));
        mgr.close();
    }

    #[test]
    fn failures_are_sticky() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut mgr = LibraryManager::new(
            CountingAttacher {
                calls: calls.clone(),
                fail: true,
            },
            1,
        )
        .unwrap();

        assert!(mgr.process_library_event(&event(10, "/usr/lib/libssl.so.3")).is_err());
        // Second observation short-circuits without a retry.
        assert!(mgr.process_library_event(&event(10, "/usr/lib/libssl.so.3")).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.stats(), (0, 1));
        mgr.close();
    }

    #[test]
    fn distinct_inodes_hook_independently() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut mgr = LibraryManager::new(
            CountingAttacher {
                calls: calls.clone(),
                fail: false,
            },
            1,
        )
        .unwrap();

        mgr.process_library_event(&event(10, "/usr/lib/libssl.so.3"))
            .unwrap();
        mgr.process_library_event(&event(11, "/usr/lib/libssl.so.1.1"))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(mgr.stats(), (2, 0));
        mgr.close();
    }

    #[test]
    fn worker_drains_queue() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mgr = LibraryManager::new(
            CountingAttacher {
                calls: calls.clone(),
                fail: false,
            },
            1,
        )
        .unwrap();
        let worker = HookWorker::spawn(mgr).unwrap();

        worker.submit(event(20, "/usr/lib/libssl.so.3"));
        worker.submit(event(21, "/usr/lib/libssl.so.1.1"));
        worker.close();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
