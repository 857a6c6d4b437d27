//! Background heartbeat for a held session lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::io::lock::LockHandle;

/// Refreshes the lock on its own thread so a long-running agent never lets it
/// go stale. Stops on drop.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
}

impl HeartbeatMonitor {
    pub fn start(lock: Arc<LockHandle>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        let thread = thread::Builder::new()
            .name("revloop-heartbeat".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    match lock.heartbeat() {
                        Ok(true) => debug!("heartbeat"),
                        Ok(false) => {
                            warn!(path = %lock.path().display(), "session lock lost");
                            flag.store(true, Ordering::SeqCst);
                            break;
                        }
                        // Transient write failures are retried next tick; the
                        // lock only goes stale after several misses.
                        Err(e) => warn!(err = %e, "heartbeat write failed"),
                    }
                }
            })
            .context("spawn heartbeat thread")?;
        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
            lost,
        })
    }

    /// True once the lock file stopped carrying our session id.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        // Dropping the sender wakes the thread immediately.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::io::config::LockConfig;
    use crate::io::lock::{Acquire, LockRecord, SessionInfo, SessionLock};

    fn acquire(logs: &std::path::Path, project: &std::path::Path) -> Arc<LockHandle> {
        let locks = SessionLock::new(logs, LockConfig::default());
        let session = SessionInfo {
            session_id: "hb".to_string(),
            session_name: "hb@main".to_string(),
            mode: "cycle".to_string(),
        };
        match locks.acquire(project, Some("main"), &session).expect("acquire") {
            Acquire::Acquired(handle) => Arc::new(handle),
            Acquire::Conflict(conflict) => panic!("unexpected conflict: {conflict}"),
        }
    }

    fn read(handle: &LockHandle) -> LockRecord {
        serde_json::from_slice(&fs::read(handle.path()).expect("read")).expect("parse")
    }

    #[test]
    fn refreshes_heartbeat_periodically() {
        let logs = tempfile::tempdir().expect("logs");
        let project = tempfile::tempdir().expect("project");
        let handle = acquire(logs.path(), project.path());
        let before = read(&handle).last_heartbeat;

        let monitor =
            HeartbeatMonitor::start(Arc::clone(&handle), Duration::from_millis(20)).expect("start");
        thread::sleep(Duration::from_millis(150));
        drop(monitor);

        assert!(read(&handle).last_heartbeat > before);
    }

    #[test]
    fn reports_lost_lock() {
        let logs = tempfile::tempdir().expect("logs");
        let project = tempfile::tempdir().expect("project");
        let handle = acquire(logs.path(), project.path());
        let mut record = read(&handle);
        record.session_id = "intruder".to_string();
        fs::write(handle.path(), serde_json::to_vec(&record).expect("json")).expect("write");

        let mut monitor =
            HeartbeatMonitor::start(Arc::clone(&handle), Duration::from_millis(10)).expect("start");
        let mut waited = 0;
        while !monitor.is_lost() && waited < 100 {
            thread::sleep(Duration::from_millis(10));
            waited += 1;
        }
        assert!(monitor.is_lost());
        monitor.stop();
        assert_eq!(read(&handle).session_id, "intruder");
    }
}
