use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_postgres::types::{FromSql, ToSql};
use tokio_postgres::{AsyncMessage, NoTls, Notification};
use tracing::{debug, info, warn};

use crate::tenant_core::common::{Error, Result};
use crate::tenant_core::config::ClusterEndpoint;

/// A cancellation handle for one `BackendConn`'s backend process, independent of the
/// connection's own lifetime: `start_pg_cancellation`/`finish_pg_cancellation` bracket a
/// concurrent `pg_cancel_backend` so overlapping cancels are rejected.
///
/// This deliberately doesn't use `tokio_postgres::CancelToken`'s wire-level cancel request:
/// the tenant issues `SELECT pg_cancel_backend($pid)` as ordinary SQL over the SysConn, so
/// all a canceller needs is the target's backend pid.
pub struct CancelToken {
    backend_pid: i32,
    is_cancelling: AtomicBool,
}

impl CancelToken {
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// Returns true and marks cancelling if no cancel is already in flight.
    pub fn start_pg_cancellation(&self) -> bool {
        self.is_cancelling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_pg_cancellation(&self) {
        self.is_cancelling.store(false, Ordering::Release);
    }

    pub fn is_cancelling(&self) -> bool {
        self.is_cancelling.load(Ordering::Acquire)
    }
}

/// One live connection to a backend database.
pub struct BackendConn {
    client: tokio_postgres::Client,
    driver: JoinHandle<()>,
    dbname: String,
    cancel: Arc<CancelToken>,
    is_healthy: Arc<AtomicBool>,
    is_idle: AtomicBool,
    is_system_db: AtomicBool,
    stmt_cache_size: AtomicU32,
    /// Fires when the connection goes away unexpectedly: either the driver task observes
    /// the transport close/error on its own, or a caller forces it via `abort()`. A clean
    /// `terminate()` never fires this — that's the distinction spec §4.1 draws between the
    /// two teardown methods. `SysConn::run_reconnect_loop` watches this to detect an
    /// organically-dropped system connection and trigger `on_sys_pgcon_connection_lost`.
    lost: Arc<Notify>,
}

impl BackendConn {
    /// Establishes a new physical session to `dbname` on `endpoint`. If `notify_tx` is
    /// given, asynchronous backend notifications (`LISTEN`/`NOTIFY`) are forwarded to it —
    /// used by `SysConn::listen_for_sysevent`.
    pub async fn open(
        endpoint: &ClusterEndpoint,
        dbname: &str,
        app_name: &str,
        notify_tx: Option<mpsc::UnboundedSender<Notification>>,
    ) -> Result<Self> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&endpoint.host)
            .port(endpoint.port)
            .user(&endpoint.user)
            .password(&endpoint.password)
            .dbname(dbname)
            .application_name(app_name);

        let (client, mut connection) = config.connect(NoTls).await?;
        let is_healthy = Arc::new(AtomicBool::new(true));
        let healthy_for_driver = is_healthy.clone();
        let lost = Arc::new(Notify::new());
        let lost_for_driver = lost.clone();

        let driver = tokio::spawn(async move {
            loop {
                match futures::future::poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(AsyncMessage::Notification(n))) => {
                        if let Some(tx) = &notify_tx {
                            let _ = tx.send(n);
                        }
                    }
                    Some(Ok(AsyncMessage::Notice(n))) => {
                        debug!(message = %n.message(), "backend notice");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "backend connection driver error");
                        healthy_for_driver.store(false, Ordering::Release);
                        lost_for_driver.notify_one();
                        break;
                    }
                    None => {
                        healthy_for_driver.store(false, Ordering::Release);
                        lost_for_driver.notify_one();
                        break;
                    }
                }
            }
        });

        let backend_pid: i32 = client
            .query_one("SELECT pg_backend_pid()", &[])
            .await
            .map(|row| row.get(0))?;

        info!(dbname, backend_pid, "opened backend connection");

        Ok(BackendConn {
            client,
            driver,
            dbname: dbname.to_string(),
            cancel: Arc::new(CancelToken {
                backend_pid,
                is_cancelling: AtomicBool::new(false),
            }),
            is_healthy,
            is_idle: AtomicBool::new(false),
            is_system_db: AtomicBool::new(false),
            stmt_cache_size: AtomicU32::new(0),
            lost,
        })
    }

    /// A handle a caller can await to learn when this connection goes away unexpectedly
    /// (driver-detected loss or `abort()`), without polling `is_healthy()`.
    pub fn lost_signal(&self) -> Arc<Notify> {
        self.lost.clone()
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    pub fn backend_pid(&self) -> i32 {
        self.cancel.backend_pid()
    }

    pub fn cancel_token(&self) -> Arc<CancelToken> {
        self.cancel.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy.load(Ordering::Acquire) && !self.driver.is_finished()
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle.load(Ordering::Acquire)
    }

    pub fn set_idle(&self, idle: bool) {
        self.is_idle.store(idle, Ordering::Release);
    }

    pub fn is_cancelling(&self) -> bool {
        self.cancel.is_cancelling()
    }

    pub fn start_pg_cancellation(&self) -> bool {
        self.cancel.start_pg_cancellation()
    }

    pub fn finish_pg_cancellation(&self) {
        self.cancel.finish_pg_cancellation()
    }

    pub fn mark_as_system_db(&self) {
        self.is_system_db.store(true, Ordering::Release);
    }

    pub fn is_system_db(&self) -> bool {
        self.is_system_db.load(Ordering::Acquire)
    }

    pub fn stmt_cache_size(&self) -> u32 {
        self.stmt_cache_size.load(Ordering::Relaxed)
    }

    pub fn set_stmt_cache_size(&self, n: u32) {
        self.stmt_cache_size.store(n, Ordering::Relaxed);
    }

    /// Subscribes to a sysevent channel. Notifications on this channel are delivered to
    /// the `notify_tx` given to `open`.
    pub async fn listen_for_sysevent(&self, channel: &str) -> Result<()> {
        self.client
            .batch_execute(&format!("LISTEN \"{}\"", channel))
            .await?;
        Ok(())
    }

    /// Executes `query` and returns a single scalar column, or `None` if the query
    /// returned no rows.
    pub async fn sql_fetch_val<T>(&self, query: &str, args: &[&(dyn ToSql + Sync)]) -> Result<Option<T>>
    where
        T: for<'a> FromSql<'a>,
    {
        let row = self.client.query_opt(query, args).await?;
        Ok(match row {
            Some(row) => Some(row.try_get(0)?),
            None => None,
        })
    }

    /// Executes `query` and returns the values of its first column for every row.
    pub async fn sql_fetch_col<T>(&self, query: &str, args: &[&(dyn ToSql + Sync)]) -> Result<Vec<T>>
    where
        T: for<'a> FromSql<'a>,
    {
        let rows = self.client.query(query, args).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(row.try_get(0).map_err(tokio_postgres::Error::from)?);
        }
        Ok(out)
    }

    pub async fn batch_execute(&self, sql: &str) -> Result<()> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    /// Executes `query` and maps each returned row with `map`, for queries whose shape
    /// doesn't fit a single scalar column (the reflection-cache and backend-id queries,
    /// which return multi-column rows).
    pub async fn sql_fetch_rows<T>(
        &self,
        query: &str,
        args: &[&(dyn ToSql + Sync)],
        map: impl Fn(&tokio_postgres::Row) -> Result<T>,
    ) -> Result<Vec<T>> {
        let rows = self.client.query(query, args).await?;
        rows.iter().map(map).collect()
    }

    /// Publishes one sysevent notification on the
    /// `ensure-database-not-used`/`database-quarantine`/... pub-sub channel.
    pub async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        self.client.execute("SELECT pg_notify($1, $2)", &[&channel, &payload]).await?;
        Ok(())
    }

    /// Forcibly drops the connection and fires its connection-lost signal (`lost_signal`) —
    /// used when something decides this backend must go away unexpectedly, as opposed to
    /// `terminate()`'s expected, quiet teardown. `SysConn::run_reconnect_loop` and the pool
    /// both watch `lost_signal` for exactly this.
    pub fn abort(self) {
        self.is_healthy.store(false, Ordering::Release);
        self.lost.notify_one();
        self.driver.abort();
    }

    /// Clean close: no connection-lost signal fires, since this is an expected shutdown
    /// (pool eviction, explicit reconnect, tenant stop) rather than an unexpected drop.
    pub fn terminate(self) {
        self.is_healthy.store(false, Ordering::Release);
        self.driver.abort();
    }

    pub fn close_error() -> Error {
        Error::closed()
    }
}

impl std::fmt::Debug for BackendConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConn")
            .field("dbname", &self.dbname)
            .field("backend_pid", &self.backend_pid())
            .field("is_healthy", &self.is_healthy())
            .field("is_idle", &self.is_idle())
            .finish()
    }
}
