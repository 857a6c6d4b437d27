//! Concurrent acquirers of one session lock.

use std::sync::{Arc, Barrier};
use std::thread;

use revloop::io::config::LockConfig;
use revloop::io::lock::{Acquire, SessionInfo, SessionLock};

const RACERS: usize = 8;

#[test]
fn exactly_one_racer_wins() {
    let logs = tempfile::tempdir().expect("logs");
    let project = tempfile::tempdir().expect("project");
    let barrier = Arc::new(Barrier::new(RACERS));

    let handles: Vec<_> = (0..RACERS)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let logs = logs.path().to_path_buf();
            let project = project.path().to_path_buf();
            thread::spawn(move || {
                let locks = SessionLock::new(&logs, LockConfig::default());
                let session = SessionInfo {
                    session_id: format!("racer-{i}"),
                    session_name: format!("racer-{i}@main"),
                    mode: "cycle".to_string(),
                };
                barrier.wait();
                locks
                    .acquire(&project, Some("main"), &session)
                    .expect("acquire")
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.join().expect("racer thread") {
            Acquire::Acquired(lock) => winners.push(lock),
            Acquire::Conflict(_) => conflicts += 1,
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, RACERS - 1);

    let active = SessionLock::new(logs.path(), LockConfig::default())
        .list_active()
        .expect("list");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].session_id, winners[0].record().expect("record").session_id);
}

#[test]
fn different_branches_do_not_conflict() {
    let logs = tempfile::tempdir().expect("logs");
    let project = tempfile::tempdir().expect("project");
    let locks = SessionLock::new(logs.path(), LockConfig::default());
    let session = |id: &str| SessionInfo {
        session_id: id.to_string(),
        session_name: id.to_string(),
        mode: "cycle".to_string(),
    };

    let main = locks
        .acquire(project.path(), Some("main"), &session("a"))
        .expect("main");
    let feature = locks
        .acquire(project.path(), Some("feature/x"), &session("b"))
        .expect("feature");
    assert!(matches!(main, Acquire::Acquired(_)));
    assert!(matches!(feature, Acquire::Acquired(_)));
}
