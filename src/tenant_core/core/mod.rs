pub mod callbacks;
mod events;
mod introspect;
mod metrics;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::{AbortHandle, JoinSet};
use tracing::{info, warn};

pub use callbacks::{NoopCallbacks, ServerCallbacks};
pub use events::{
    on_after_drop_db, on_before_create_db_from_template, on_before_drop_db, on_global_schema_change,
    on_local_database_config_change, on_remote_database_changes, on_remote_database_config_change,
    on_remote_database_quarantine, on_remote_ddl, on_remote_system_config_change, on_sys_pgcon_connection_lost,
    on_sys_pgcon_failover_signal, on_sys_pgcon_parameter_status_updated,
};
pub use introspect::{early_introspect_db, ensure_database_not_connected, introspect_all_dbs, introspect_db};
pub use metrics::Metrics;

use crate::tenant_core::auth::AuthState;
use crate::tenant_core::backend::BackendConn;
use crate::tenant_core::common::{Error, Result};
use crate::tenant_core::config::Settings;
use crate::tenant_core::dbindex::DbIndex;
use crate::tenant_core::pool::{ConnPool, PoolConnection};
use crate::tenant_core::readiness::ReadinessMonitor;
use crate::tenant_core::sysconn::SysConn;

struct Tasks {
    joinset: Mutex<JoinSet<()>>,
    interruptable: Mutex<Vec<AbortHandle>>,
}

/// One tenant's whole runtime state: its connection pool, system connection, database
/// index, readiness and auth state, and the background task group that keeps them all
/// running. An embedder builds one `Tenant` per logical tenant it serves and drives client
/// sessions against it through `ServerCallbacks` and the module APIs directly.
pub struct Tenant {
    /// Opaque string derived from cluster runtime params — here, a stable hash of
    /// `instance_name` plus the system DB's reported cluster system identifier, so two
    /// tenants attached to the same physical cluster under different names never collide.
    /// Derivation choice documented in DESIGN.md.
    pub tenant_id: String,
    pub settings: Arc<Settings>,
    /// Immutable key/value map fetched from the system DB at init; empty until `init`
    /// populates it.
    instance_data: RwLock<Arc<HashMap<String, String>>>,
    /// Per-protocol-version reported-config blobs.
    report_config_data: RwLock<Arc<HashMap<u32, Vec<u8>>>>,
    pub db_index: Arc<DbIndex>,
    pub pool: Arc<ConnPool>,
    pub sysconn: Arc<SysConn>,
    pub readiness: Arc<ReadinessMonitor>,
    pub auth: Arc<AuthState>,
    pub metrics: Metrics,
    callbacks: Arc<dyn ServerCallbacks>,
    tasks: Tasks,
    initing: AtomicBool,
    accepting: AtomicBool,
    stopping: AtomicBool,
    /// Set when no healthy backend is reachable; surfaced by `acquire_pgcon`/`use_sys_pgcon`
    /// callers as `BackendUnavailableError`.
    pg_unavailable_msg: Mutex<Option<String>>,
    /// Databases currently refusing new connections pending a drop/quarantine. Read by
    /// `is_database_connectable`, written by the DDL guard callbacks; races are acceptable,
    /// a false positive just means a session retries later.
    block_new_connections: Mutex<HashSet<String>>,
}

impl Tenant {
    /// Builds a tenant from `settings` but does not yet start any background task — call
    /// `start_running` once the caller is ready to begin serving.
    pub fn init(settings: Settings, callbacks: Arc<dyn ServerCallbacks>) -> Result<Arc<Tenant>> {
        let settings = Arc::new(settings);
        let db_index = Arc::new(DbIndex::new());
        // one connection is always reserved for the SysConn (spec.md §3/§4.2).
        let pool = ConnPool::new(settings.max_backend_connections - 1);
        let sysconn = SysConn::new(
            settings.cluster.master.clone(),
            settings.cluster.system_database.clone(),
            settings.app_name.clone(),
            Duration::from_secs(settings.system_db_reconnect_interval_seconds),
        );
        let readiness = ReadinessMonitor::new(settings.readiness_state_file.clone())?;
        let auth = Arc::new(AuthState::new(
            settings.jwt_sub_allowlist_file.clone(),
            settings.jwt_revocation_list_file.clone(),
        ));
        let tenant_id = derive_tenant_id(&settings.instance_name, &settings.cluster.master.host, settings.cluster.master.port);

        Ok(Arc::new(Tenant {
            tenant_id,
            settings,
            instance_data: RwLock::new(Arc::new(HashMap::new())),
            report_config_data: RwLock::new(Arc::new(HashMap::new())),
            db_index,
            pool,
            sysconn,
            readiness,
            auth,
            metrics: Metrics::new(),
            callbacks,
            tasks: Tasks {
                joinset: Mutex::new(JoinSet::new()),
                interruptable: Mutex::new(Vec::new()),
            },
            initing: AtomicBool::new(true),
            accepting: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            pg_unavailable_msg: Mutex::new(None),
            block_new_connections: Mutex::new(HashSet::new()),
        }))
    }

    /// Runs the ordered startup sequence: opens the SysConn, fetches instance
    /// data/roles/global schema/sys config, early-introspects every known database,
    /// subscribes to sysevents, loads the auth allowlists, and clears `initing`.
    /// The caller still owns calling `start_accepting_new_tasks`/`start_running` themselves
    /// once this returns.
    pub async fn run_init(self: &Arc<Self>) -> Result<()> {
        self.sysconn.wait_until_healthy().await?;

        let instance_data = {
            let sys = self.sysconn.use_sys_pgcon().await?;
            let json: Option<serde_json::Value> = sys
                .sql_fetch_val(
                    "SELECT json::json FROM edgedbinstdata.instdata WHERE key = 'instancedata';",
                    &[],
                )
                .await?;
            json.and_then(|v| serde_json::from_value::<HashMap<String, String>>(v).ok()).unwrap_or_default()
        };
        *self.instance_data.write().unwrap() = Arc::new(instance_data);

        if let Some(query) = self.callbacks.get_sys_query(self, "roles").await {
            let sys = self.sysconn.use_sys_pgcon().await?;
            let _roles: Vec<String> = sys.sql_fetch_col(&query, &[]).await?;
        }

        {
            let sys = self.sysconn.use_sys_pgcon().await?;
            let global_schema_json = self.callbacks.introspect_global_schema_json(self, &sys).await?;
            drop(sys);
            let pickle = self.callbacks.parse_global_schema(self, &global_schema_json).await;
            self.db_index.update_global_schema(pickle);
        }

        if let Some(query) = self.callbacks.get_sys_query(self, "sys_config").await {
            let sys = self.sysconn.use_sys_pgcon().await?;
            let rows = sys
                .sql_fetch_rows(&query, &[], |row| Ok((row.try_get::<_, String>(0)?, row.try_get::<_, String>(1)?)))
                .await?;
            self.db_index.update_sys_config(rows.into_iter().collect());
        }
        self.db_index.set_default_sys_config(self.callbacks.default_sys_config(self).await);

        let std_schema = self.callbacks.get_std_schema(self).await;
        self.db_index.set_std_schema(std_schema);
        self.db_index.set_config_settings_spec(self.callbacks.config_settings(self).await);

        let report_configs_query = self.callbacks.get_sys_query(self, "report_configs").await;
        for protocol_version in [1u32] {
            let typedesc = self.callbacks.get_report_config_typedesc(self, protocol_version).await;
            let data = if let Some(query) = &report_configs_query {
                let sys = self.sysconn.use_sys_pgcon().await?;
                sys.sql_fetch_val::<Vec<u8>>(query, &[]).await?.unwrap_or_default()
            } else {
                Vec::new()
            };
            let blob = build_report_config_blob(&typedesc, &data);
            let mut table = (*self.report_config_data.read().unwrap()).clone();
            table.insert(protocol_version, blob);
            *self.report_config_data.write().unwrap() = Arc::new(table);
        }

        introspect_all_dbs(self).await?;

        self.auth.load_jwcrypto()?;

        self.initing.store(false, Ordering::Release);
        info!(tenant_id = %self.tenant_id, "tenant init complete");
        Ok(())
    }

    pub fn is_initing(&self) -> bool {
        self.initing.load(Ordering::Acquire)
    }

    pub fn instance_data(&self) -> Arc<HashMap<String, String>> {
        self.instance_data.read().unwrap().clone()
    }

    pub fn report_config_data(&self, protocol_version: u32) -> Option<Vec<u8>> {
        self.report_config_data.read().unwrap().get(&protocol_version).cloned()
    }

    pub fn pg_unavailable_msg(&self) -> Option<String> {
        self.pg_unavailable_msg.lock().unwrap().clone()
    }

    pub fn set_pg_unavailable_msg(&self, msg: Option<String>) {
        *self.pg_unavailable_msg.lock().unwrap() = msg;
    }

    /// Admission check for new client sessions against `dbname`: false while `dbname` is in
    /// `block_new_connections`, pending a drop or quarantine. Read-only and racy — a false
    /// positive just means a session retries later.
    pub fn is_database_connectable(&self, dbname: &str) -> bool {
        !self.block_new_connections.lock().unwrap().contains(dbname)
    }

    pub(crate) fn block_database(&self, dbname: &str) {
        self.block_new_connections.lock().unwrap().insert(dbname.to_string());
    }

    pub(crate) fn unblock_database(&self, dbname: &str) {
        self.block_new_connections.lock().unwrap().remove(dbname);
    }

    pub fn is_accepting_new_tasks(&self) -> bool {
        self.accepting.load(Ordering::Acquire) && !self.stopping.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Opens the gate admitting new client sessions. Separate from `start_running` so an
    /// embedder can bring background tasks up first and only flip this once initial
    /// introspection has completed.
    pub fn start_accepting_new_tasks(&self) {
        self.accepting.store(true, Ordering::Release);
    }

    /// Spawns the tenant's long-lived background tasks: the SysConn reconnect loop and the
    /// sysevent dispatch loop, both non-interruptable — a tenant with no SysConn can't serve
    /// any database, so these outlive `stop()`'s abort sweep and are instead torn down by
    /// `terminate_sys_pgcon`/`wait_stopped` draining naturally.
    pub fn start_running(self: &Arc<Self>) {
        let reconnect_tenant = self.sysconn.clone();
        self.create_task(false, async move {
            reconnect_tenant.run_reconnect_loop().await;
        });

        if let Some(mut rx) = self.sysconn.take_sysevent_receiver() {
            let dispatch_tenant = self.clone();
            self.create_task(false, async move {
                while let Some(notification) = rx.recv().await {
                    if let Err(e) = events::handle_sysevent(&dispatch_tenant, &notification).await {
                        warn!(error = %e, channel = notification.channel(), "failed to handle sysevent");
                        dispatch_tenant.metrics.record_background_error("sysevent");
                        dispatch_tenant.callbacks.on_background_error(&dispatch_tenant, "sysevent", &e).await;
                    }
                }
            });
        }

        if let Some(mut rx) = self.sysconn.take_conn_lost_receiver() {
            let lost_tenant = self.clone();
            self.create_task(false, async move {
                while let Some(reason) = rx.recv().await {
                    events::on_sys_pgcon_connection_lost(&lost_tenant, &reason).await;
                    // spec §4.3's "listening -> healthy: clear the unavailable message":
                    // once the reconnect loop recovers, stop failing acquire_pgcon fast.
                    if lost_tenant.sysconn.wait_until_healthy().await.is_ok() {
                        lost_tenant.set_pg_unavailable_msg(None);
                    }
                }
            });
        }

        info!("tenant background tasks started");
    }

    /// Registers a task with the tenant's task group. Interruptable tasks are aborted as
    /// soon as `stop()` is called; non-interruptable ones are left to finish on their own
    /// (or to be torn down individually, as the SysConn reconnect loop is via
    /// `terminate_sys_pgcon`).
    ///
    /// Only permitted while `accept_new_tasks`; outside that window this is a silent no-op,
    /// matching every event callback's "enqueue if running, else drop" behavior.
    pub fn create_task<F>(self: &Arc<Self>, interruptable: bool, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut joinset = self.tasks.joinset.lock().unwrap();
        let handle = joinset.spawn(fut);
        if interruptable {
            self.tasks.interruptable.lock().unwrap().push(handle);
        }
    }

    /// Spawns `fut` as an interruptable task if `accept_new_tasks`, else drops it silently
    /// without running it — the pattern every event callback uses.
    pub fn spawn_interruptable_if_accepting<F>(self: &Arc<Self>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_accepting_new_tasks() {
            self.create_task(true, fut);
        }
    }

    /// Aborts the SysConn's reconnect loop and closes its connection; used both from
    /// `stop()` and standalone when an embedder wants to force a fresh reconnect cycle
    /// without tearing down the whole tenant.
    pub async fn terminate_sys_pgcon(&self) {
        self.sysconn.terminate().await;
    }

    /// Begins shutdown: stops admitting new sessions, aborts interruptable background
    /// tasks, tears down the SysConn, and closes every idle pooled connection. Does not
    /// wait for non-interruptable tasks or checked-out connections to finish — call
    /// `wait_stopped` for that.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.accepting.store(false, Ordering::Release);

        for handle in self.tasks.interruptable.lock().unwrap().drain(..) {
            handle.abort();
        }

        self.sysconn.shutdown().await;
        self.pool.prune_all_connections();
        info!("tenant stop initiated");
    }

    /// Waits for every task in the tenant's task group — interruptable or not — to finish.
    /// Intended to be called after `stop()`; the non-interruptable SysConn reconnect loop
    /// only exits once `terminate_sys_pgcon` has put the SysConn in a state where
    /// `run_reconnect_loop` is parked on its own `wake_reconnect` notification, so callers
    /// should expect this to return only after a final wakeup (dropping the tenant's last
    /// `Arc<SysConn>` is sufficient in practice, since nothing else holds the notifier).
    pub async fn wait_stopped(&self) {
        loop {
            let next = {
                let mut joinset = self.tasks.joinset.lock().unwrap();
                joinset.try_join_next()
            };
            match next {
                Some(Err(e)) if !e.is_cancelled() => warn!(error = %e, "background task panicked"),
                Some(_) => {}
                None => {
                    let empty = self.tasks.joinset.lock().unwrap().is_empty();
                    if empty {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    pub fn callbacks(&self) -> &Arc<dyn ServerCallbacks> {
        &self.callbacks
    }

    /// Opens a fresh backend connection to `dbname` against the cluster's current master,
    /// honoring the HA serial check: if the master changes mid-connect, the connection is
    /// discarded and an error returned rather than silently handed back a session against
    /// the old master.
    pub async fn connect_backend(&self, dbname: &str) -> Result<BackendConn> {
        let endpoint = self.sysconn.current_endpoint().await;
        let serial_at_open = self.sysconn.ha_master_serial();
        let conn = BackendConn::open(&endpoint, dbname, &self.settings.app_name, None).await?;
        if self.sysconn.ha_master_serial() != serial_at_open {
            conn.terminate();
            return Err(Error::backend_unavailable("connected to outdated Postgres master"));
        }
        Ok(conn)
    }

    /// Checks out a pooled connection to `dbname`. Retries up to `max_capacity` times,
    /// discarding any unhealthy connection the pool hands back, before giving up with
    /// `BackendUnavailableError`. Fails fast with the same error if `pg_unavailable_msg` is
    /// set.
    pub async fn acquire_pgcon(self: &Arc<Self>, dbname: &str) -> Result<PoolConnection> {
        if let Some(msg) = self.pg_unavailable_msg() {
            return Err(Error::backend_unavailable(msg));
        }

        let max_attempts = self.pool.max_capacity().max(1);
        for _ in 0..max_attempts {
            let tenant = self.clone();
            let db = dbname.to_string();
            let conn = self
                .pool
                .acquire(dbname, move || {
                    let tenant = tenant.clone();
                    let db = db.clone();
                    async move { tenant.connect_backend(&db).await }
                })
                .await?;
            if conn.is_healthy() {
                return Ok(conn);
            }
            // the pool itself discards unhealthy connections on release; reaching here
            // with an unhealthy connection means it was freshly opened and failed its own
            // first health check, so just retry.
        }
        Err(Error::backend_unavailable(format!("no healthy connection to \"{}\" after {} attempts", dbname, max_attempts)))
    }

    pub fn release_pgcon(&self, conn: PoolConnection) {
        drop(conn);
    }

    /// Cancels whatever query `conn` is currently running. Declines (returns `Ok(false)`
    /// without touching the SysConn) if `conn` is idle — there is nothing to cancel — or if
    /// a cancel for it is already in flight. Otherwise brackets the SysConn round-trip with
    /// `start_pg_cancellation`/`finish_pg_cancellation` so a second concurrent caller sees
    /// the in-flight cancel and backs off, and returns whether the backend confirmed it.
    pub async fn cancel_pgcon_operation(&self, conn: &BackendConn) -> Result<bool> {
        if conn.is_idle() || conn.is_cancelling() {
            return Ok(false);
        }
        if !conn.start_pg_cancellation() {
            return Ok(false);
        }

        let result = async {
            let sys = self.sysconn.use_sys_pgcon().await?;
            sys.sql_fetch_val::<bool>("SELECT pg_cancel_backend($1);", &[&conn.backend_pid()])
                .await
        }
        .await;

        conn.finish_pg_cancellation();
        Ok(result?.unwrap_or(false))
    }
}

/// Builds the reported-config wire format:
/// `BE-u32(typedesc_len) || typedesc || BE-u32(data_len) || data`.
fn build_report_config_blob(typedesc: &[u8], data: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(8 + typedesc.len() + data.len());
    blob.extend_from_slice(&(typedesc.len() as u32).to_be_bytes());
    blob.extend_from_slice(typedesc);
    blob.extend_from_slice(&(data.len() as u32).to_be_bytes());
    blob.extend_from_slice(data);
    blob
}

/// A stable hash of the instance name plus the cluster endpoint identifying the system DB
/// it's attached to, so two tenants against the same physical cluster under different
/// `instance_name`s never collide. Derivation choice documented in DESIGN.md.
fn derive_tenant_id(instance_name: &str, master_host: &str, master_port: u16) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    instance_name.hash(&mut hasher);
    master_host.hash(&mut hasher);
    master_port.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_is_stable_for_the_same_inputs() {
        assert_eq!(derive_tenant_id("main", "localhost", 5432), derive_tenant_id("main", "localhost", 5432));
        assert_ne!(derive_tenant_id("main", "localhost", 5432), derive_tenant_id("other", "localhost", 5432));
    }

    #[test]
    fn report_config_blob_matches_wire_format() {
        let blob = build_report_config_blob(&[1, 2], &[3, 4, 5]);
        assert_eq!(&blob[0..4], &2u32.to_be_bytes());
        assert_eq!(&blob[4..6], &[1, 2]);
        assert_eq!(&blob[6..10], &3u32.to_be_bytes());
        assert_eq!(&blob[10..13], &[3, 4, 5]);
    }
}
