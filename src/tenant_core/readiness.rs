use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::tenant_core::common::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadinessState {
    /// No readiness file configured, its contents couldn't be parsed, or the file is
    /// missing: serve normally.
    Default = 0,
    ReadOnly = 1,
    Offline = 2,
    Blocked = 3,
}

impl ReadinessState {
    fn parse_line(line: &str) -> (ReadinessState, Option<String>) {
        let mut parts = line.trim().splitn(2, ':');
        let state = match parts.next().unwrap_or("") {
            "default" | "" => ReadinessState::Default,
            "read_only" => ReadinessState::ReadOnly,
            "offline" => ReadinessState::Offline,
            "blocked" => ReadinessState::Blocked,
            other => {
                warn!(state = other, "unrecognized readiness state, treating as default");
                ReadinessState::Default
            }
        };
        let reason = parts.next().map(str::to_string);
        (state, reason)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ReadinessState::ReadOnly,
            2 => ReadinessState::Offline,
            3 => ReadinessState::Blocked,
            _ => ReadinessState::Default,
        }
    }

    /// `is_online = state != Offline`.
    pub fn is_online(self) -> bool {
        !matches!(self, ReadinessState::Offline)
    }

    /// `is_ready = state in {Default, ReadOnly}`.
    pub fn is_ready(self) -> bool {
        matches!(self, ReadinessState::Default | ReadinessState::ReadOnly)
    }

    pub fn is_blocked(self) -> bool {
        matches!(self, ReadinessState::Blocked)
    }

    pub fn is_readonly(self) -> bool {
        matches!(self, ReadinessState::ReadOnly)
    }
}

/// Watches a readiness state file on disk and exposes its last-parsed value plus an
/// accompanying free-form reason string, so operators can signal maintenance/failover
/// windows without restarting the tenant. With no file configured, readiness is always
/// `Default` with no reason.
pub struct ReadinessMonitor {
    state: AtomicU8,
    reason: Mutex<Option<String>>,
    changed: Notify,
    // kept alive for as long as the monitor is; dropping it stops the watch.
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ReadinessMonitor {
    pub fn new(path: Option<PathBuf>) -> Result<Arc<Self>> {
        let (initial, initial_reason) = match &path {
            Some(p) => match read_state_file(p) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "failed to read readiness state file, treating as default");
                    (ReadinessState::Default, None)
                }
            },
            None => (ReadinessState::Default, None),
        };

        let monitor = Arc::new(ReadinessMonitor {
            state: AtomicU8::new(initial as u8),
            reason: Mutex::new(initial_reason),
            changed: Notify::new(),
            _watcher: Mutex::new(None),
        });

        if let Some(path) = path {
            let watcher = spawn_watch(monitor.clone(), path)?;
            *monitor._watcher.lock().unwrap() = Some(watcher);
        }

        Ok(monitor)
    }

    pub fn current(&self) -> ReadinessState {
        ReadinessState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap().clone()
    }

    /// Whether this tenant should currently be admitting new client sessions. Mirrors
    /// `Tenant::accepting_connections`, which tracks `is_online` directly:
    /// `is_online ⇔ accepting_connections`.
    pub fn accepting_connections(&self) -> bool {
        self.current().is_online()
    }

    pub async fn wait_for_change(&self) {
        self.changed.notified().await;
    }

    fn apply(&self, state: ReadinessState, reason: Option<String>) {
        let changed = self.state.swap(state as u8, Ordering::AcqRel) != state as u8;
        *self.reason.lock().unwrap() = reason;
        if changed {
            info!(?state, "readiness state changed");
        }
        self.changed.notify_waiters();
    }
}

fn spawn_watch(monitor: Arc<ReadinessMonitor>, path: PathBuf) -> Result<RecommendedWatcher> {
    let watch_path = path.clone();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(_) => match read_state_file(&watch_path) {
                Ok((state, reason)) => monitor.apply(state, reason),
                Err(e) => {
                    warn!(error = %e, "failed to re-read readiness state file, treating as default");
                    monitor.apply(ReadinessState::Default, None);
                }
            },
            Err(e) => warn!(error = %e, "readiness file watcher error"),
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(500)),
    )
    .map_err(|e| crate::tenant_core::common::Error::startup(e.to_string()))?;

    let watch_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| crate::tenant_core::common::Error::startup(e.to_string()))?;

    Ok(watcher)
}

/// Reads and parses the one-line `state[:reason]` readiness file format. A missing file is
/// treated as `Default` rather than an error; any other I/O error propagates so the caller
/// can log it.
fn read_state_file(path: &Path) -> Result<(ReadinessState, Option<String>)> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(ReadinessState::parse_line(contents.lines().next().unwrap_or(""))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((ReadinessState::Default, None)),
        Err(e) => Err(e.into()),
    }
}
