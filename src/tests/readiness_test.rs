use std::time::Duration;

use test_env_log::test;

use crate::tenant_core::readiness::{ReadinessMonitor, ReadinessState};

#[test(tokio::test)]
async fn defaults_to_default_state_without_a_file() {
    let monitor = ReadinessMonitor::new(None).unwrap();
    assert_eq!(monitor.current(), ReadinessState::Default);
    assert!(monitor.accepting_connections());
    assert!(monitor.current().is_ready());
    assert!(monitor.reason().is_none());
}

#[test(tokio::test)]
async fn reads_initial_state_from_file() {
    let dir = tempdir();
    let path = dir.join("readiness_state");
    std::fs::write(&path, "read_only").unwrap();

    let monitor = ReadinessMonitor::new(Some(path)).unwrap();
    assert_eq!(monitor.current(), ReadinessState::ReadOnly);
    assert!(monitor.accepting_connections());
    assert!(monitor.current().is_readonly());

    std::fs::remove_dir_all(&dir).ok();
}

#[test(tokio::test)]
async fn picks_up_changes_to_the_file() {
    let dir = tempdir();
    let path = dir.join("readiness_state");
    std::fs::write(&path, "").unwrap();

    let monitor = ReadinessMonitor::new(Some(path.clone())).unwrap();
    assert_eq!(monitor.current(), ReadinessState::Default);

    std::fs::write(&path, "offline:maintenance").unwrap();

    let wait = tokio::time::timeout(Duration::from_secs(3), monitor.wait_for_change());
    wait.await.expect("expected a readiness change notification");
    assert_eq!(monitor.current(), ReadinessState::Offline);
    assert!(!monitor.accepting_connections());
    assert_eq!(monitor.reason().as_deref(), Some("maintenance"));

    std::fs::write(&path, "read_only").unwrap();
    let wait = tokio::time::timeout(Duration::from_secs(3), monitor.wait_for_change());
    wait.await.expect("expected a readiness change notification");
    assert_eq!(monitor.current(), ReadinessState::ReadOnly);
    assert!(monitor.accepting_connections());
    assert!(monitor.current().is_readonly());

    std::fs::remove_dir_all(&dir).ok();
}

fn tempdir() -> std::path::PathBuf {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut dir = std::env::temp_dir();
    dir.push(format!("tenant-core-readiness-test-{}-{}", std::process::id(), n));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
