use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, MutexGuard, Notify, RwLock};
use tokio_postgres::Notification;
use tracing::{error, info, warn};

use crate::tenant_core::backend::BackendConn;
use crate::tenant_core::common::{Error, Result};
use crate::tenant_core::config::ClusterEndpoint;

const SYSEVENT_CHANNEL: &str = "tenant_sysevent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SysConnState {
    Disconnected = 0,
    Connecting = 1,
    Listening = 2,
    Healthy = 3,
}

impl SysConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SysConnState::Disconnected,
            1 => SysConnState::Connecting,
            2 => SysConnState::Listening,
            _ => SysConnState::Healthy,
        }
    }
}

/// The tenant's single privileged connection to the system database. It carries a
/// reconnect state machine (Disconnected -> Connecting -> Listening -> Healthy) driven by a
/// background task, and is rebuilt whenever `on_switch_over` reports a new cluster master.
pub struct SysConn {
    endpoint: RwLock<ClusterEndpoint>,
    system_database: String,
    app_name: String,
    reconnect_interval: Duration,
    state: AtomicU8,
    conn: Mutex<Option<BackendConn>>,
    ha_master_serial: AtomicU64,
    ready: Notify,
    wake_reconnect: Notify,
    sysevent_tx: mpsc::UnboundedSender<Notification>,
    sysevent_rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    /// Fed one reason string every time `run_reconnect_loop` detects the healthy
    /// connection went away unexpectedly (`BackendConn::lost_signal`), so the tenant-level
    /// `on_sys_pgcon_connection_lost` callback can run without `SysConn` holding a reference
    /// back to the owning `Tenant` (same shape as `sysevent_tx`/`sysevent_rx`).
    conn_lost_tx: mpsc::UnboundedSender<String>,
    conn_lost_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    /// Permanently halts `run_reconnect_loop`: once set, the loop exits instead of rebuilding
    /// the connection, waking any `wait_until_healthy` waiters with an error first. Distinct
    /// from the transient `Disconnected` state `on_switch_over`/`terminate` put the
    /// connection in, which the loop is expected to recover from on its own.
    stopped: AtomicBool,
    /// Set when the reconnect loop hits a non-retryable `BackendError` while the tenant is
    /// still running, putting the connection into a terminal unavailable state rather than
    /// retrying forever (decision recorded in DESIGN.md). Cleared on the next successful
    /// connect or explicit `on_switch_over`.
    fatal_error: Mutex<Option<String>>,
}

impl SysConn {
    pub fn new(endpoint: ClusterEndpoint, system_database: String, app_name: String, reconnect_interval: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        Arc::new(SysConn {
            endpoint: RwLock::new(endpoint),
            system_database,
            app_name,
            reconnect_interval,
            state: AtomicU8::new(SysConnState::Disconnected as u8),
            conn: Mutex::new(None),
            ha_master_serial: AtomicU64::new(0),
            ready: Notify::new(),
            wake_reconnect: Notify::new(),
            sysevent_tx: tx,
            sysevent_rx: Mutex::new(Some(rx)),
            conn_lost_tx: lost_tx,
            conn_lost_rx: Mutex::new(Some(lost_rx)),
            stopped: AtomicBool::new(false),
            fatal_error: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SysConnState {
        SysConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: SysConnState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn ha_master_serial(&self) -> u64 {
        self.ha_master_serial.load(Ordering::Acquire)
    }

    /// Swaps the cluster endpoint this SysConn targets and drops the current connection so
    /// the reconnect loop rebuilds it against the new master. Bumps `ha_master_serial` so
    /// in-flight backend connects started against the old master discover the switch and
    /// discard their result.
    pub async fn on_switch_over(&self, new_master: ClusterEndpoint) {
        {
            let mut endpoint = self.endpoint.write().await;
            *endpoint = new_master;
        }
        self.ha_master_serial.fetch_add(1, Ordering::AcqRel);
        self.set_state(SysConnState::Disconnected);
        *self.fatal_error.lock().await = None;
        let mut conn = self.conn.lock().await;
        if let Some(old) = conn.take() {
            old.terminate();
        }
        drop(conn);
        self.wake_reconnect.notify_one();
        info!("sysconn switched over to new master");
    }

    pub async fn current_endpoint(&self) -> ClusterEndpoint {
        self.endpoint.read().await.clone()
    }

    /// Waits for the connection to become healthy. Returns early with an error if the
    /// tenant has shut down, or if the reconnect loop has hit a non-retryable
    /// `BackendError` and entered its terminal unavailable state — callers such as
    /// `Tenant::run_init` should not block forever on a SysConn that will never recover on
    /// its own.
    pub async fn wait_until_healthy(&self) -> Result<()> {
        loop {
            // Register as a waiter before checking state, so a transition to Healthy that
            // happens between the check and the await is never missed.
            let notified = self.ready.notified();
            if self.state() == SysConnState::Healthy {
                return Ok(());
            }
            if self.stopped.load(Ordering::Acquire) {
                return Err(Error::closed());
            }
            if let Some(msg) = self.fatal_error.lock().await.clone() {
                return Err(Error::backend_unavailable(msg));
            }
            notified.await;
        }
    }

    pub fn take_sysevent_receiver(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.sysevent_rx.try_lock().ok().and_then(|mut guard| guard.take())
    }

    /// Takes the receiving half of the connection-lost channel. The tenant drains this in
    /// its own background task and calls `on_sys_pgcon_connection_lost` for every reason
    /// string that arrives — see `run_reconnect_loop`'s `Healthy` branch, the only producer.
    pub fn take_conn_lost_receiver(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.conn_lost_rx.try_lock().ok().and_then(|mut guard| guard.take())
    }

    /// Scoped access to the live system-db connection. If the held connection is absent or
    /// unhealthy, waits on the ready event for the background reconnect loop to restore it
    /// rather than failing the caller immediately — mutual exclusion plus "callers wait for
    /// readiness" is this primitive's whole point (spec §4.3/§5). Only returns an error if
    /// the tenant is shutting down or the reconnect loop has given up with a non-retryable
    /// `BackendError` (see `wait_until_healthy`).
    pub async fn use_sys_pgcon(&self) -> Result<SysConnGuard<'_>> {
        loop {
            self.wait_until_healthy().await?;
            let guard = self.conn.lock().await;
            if guard.is_some() && self.state() == SysConnState::Healthy {
                return Ok(SysConnGuard { guard });
            }
            // lost healthiness between the wait above and taking the lock (e.g. a
            // concurrent on_switch_over); loop and wait again.
        }
    }

    /// Publishes one sysevent notification over the system connection.
    pub async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        let conn = self.use_sys_pgcon().await?;
        conn.notify(channel, payload).await
    }

    /// The background reconnect loop. Intended to run for the tenant's whole lifetime as a
    /// non-interruptable task: a SysConn that stops reconnecting leaves the tenant unable to
    /// serve any database.
    pub async fn run_reconnect_loop(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                self.ready.notify_waiters();
                self.wake_reconnect.notify_waiters();
                return;
            }

            if self.state() == SysConnState::Healthy {
                let lost_signal = {
                    let guard = self.conn.lock().await;
                    guard.as_ref().map(BackendConn::lost_signal)
                };
                match lost_signal {
                    Some(lost) => {
                        tokio::select! {
                            _ = self.wake_reconnect.notified() => {}
                            _ = lost.notified() => {
                                warn!("system connection lost unexpectedly, reconnecting");
                                let _ = self.conn_lost_tx.send("system connection lost unexpectedly".to_string());
                                self.set_state(SysConnState::Disconnected);
                                self.ready.notify_waiters();
                                let mut guard = self.conn.lock().await;
                                if let Some(conn) = guard.take() {
                                    conn.terminate();
                                }
                            }
                        }
                    }
                    // no connection currently held despite being Healthy shouldn't happen,
                    // but fall back to the plain wake-on-notify wait rather than spin.
                    None => self.wake_reconnect.notified().await,
                }
                continue;
            }

            self.set_state(SysConnState::Connecting);
            let endpoint = self.current_endpoint().await;
            let serial_at_open = self.ha_master_serial();

            match BackendConn::open(&endpoint, &self.system_database, &self.app_name, Some(self.sysevent_tx.clone())).await {
                Ok(conn) => {
                    if self.ha_master_serial() != serial_at_open {
                        warn!("master changed mid-connect, discarding and retrying");
                        conn.terminate();
                        continue;
                    }
                    conn.mark_as_system_db();
                    if let Err(e) = conn.listen_for_sysevent(SYSEVENT_CHANNEL).await {
                        error!(error = %e, "failed to subscribe to sysevent channel");
                        conn.terminate();
                        self.set_state(SysConnState::Disconnected);
                        self.sleep_or_wake().await;
                        continue;
                    }
                    self.set_state(SysConnState::Listening);
                    {
                        let mut guard = self.conn.lock().await;
                        *guard = Some(conn);
                    }
                    *self.fatal_error.lock().await = None;
                    self.set_state(SysConnState::Healthy);
                    self.ready.notify_waiters();
                    info!("sysconn healthy");
                }
                Err(e) if e.is_retryable_backend_error() => {
                    warn!(error = %e, "sysconn connect failed, will retry");
                    self.set_state(SysConnState::Disconnected);
                    self.sleep_or_wake().await;
                }
                Err(e) => {
                    // Non-retryable BackendError: rather than raise out of a detached
                    // background task with nobody to catch it, enter a terminal unavailable
                    // state and wait for an explicit nudge (on_switch_over or shutdown)
                    // before trying again. See DESIGN.md.
                    error!(error = %e, "sysconn connect failed with a non-retryable error");
                    *self.fatal_error.lock().await = Some(e.to_string());
                    self.set_state(SysConnState::Disconnected);
                    self.ready.notify_waiters();
                    self.wake_reconnect.notified().await;
                }
            }
        }
    }

    async fn sleep_or_wake(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.reconnect_interval) => {},
            _ = self.wake_reconnect.notified() => {},
        }
    }

    /// Tears down the current connection, leaving state `Disconnected` so
    /// `run_reconnect_loop` rebuilds it on its own next iteration. Used standalone (via
    /// `terminate_sys_pgcon`) to force a fresh reconnect cycle without shutting the tenant
    /// down. For a permanent stop, use `shutdown` instead.
    pub async fn terminate(&self) {
        self.set_state(SysConnState::Disconnected);
        *self.fatal_error.lock().await = None;
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.terminate();
        }
        drop(guard);
        self.wake_reconnect.notify_one();
    }

    /// Permanently stops the reconnect loop: sets both the ready and reconnect events and
    /// lets the loop exit. Called from `Tenant::stop`; unlike `terminate`, the loop does not
    /// attempt to rebuild the connection afterward.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.set_state(SysConnState::Disconnected);
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.terminate();
        }
        drop(guard);
        self.ready.notify_waiters();
        self.wake_reconnect.notify_waiters();
    }
}

pub struct SysConnGuard<'a> {
    guard: MutexGuard<'a, Option<BackendConn>>,
}

impl Deref for SysConnGuard<'_> {
    type Target = BackendConn;
    fn deref(&self) -> &BackendConn {
        self.guard.as_ref().expect("checked Some in use_sys_pgcon")
    }
}
