use async_trait::async_trait;
use serde_json::Value as SettingValue;

use crate::tenant_core::auth::{AuthMethod, Transport};
use crate::tenant_core::backend::BackendConn;
use crate::tenant_core::common::{Error, Result};
use crate::tenant_core::config::ClusterEndpoint;
use crate::tenant_core::core::Tenant;

/// The tenant's external collaborators: whoever embeds this crate implements
/// `ServerCallbacks` to supply introspection data, learn about database lifecycle events
/// and HA failover, and be notified of background errors, without the tenant runtime
/// needing to know anything about the wire-protocol front-end, HTTP auth surface, query
/// compiler pool, or any other caller-owned concern.
///
/// Every method has a default implementation (no-op for notifications, a conservative
/// fallback for data-producing calls); implementors override only what they need.
#[async_trait]
pub trait ServerCallbacks: Send + Sync {
    // -- introspection data sources --

    /// The names of every database the cluster currently knows about (`get_dbnames`),
    /// used by `init` and `on_remote_database_changes` to detect adds/drops.
    async fn get_dbnames(&self, _tenant: &Tenant) -> Vec<String> {
        Vec::new()
    }

    /// Looks up a named SQL query template owned by the server layer (`get_sys_query`) —
    /// e.g. the roles query, whose exact text is left to a template the embedder registers.
    /// `None` means the caller has nothing registered under that name.
    async fn get_sys_query(&self, _tenant: &Tenant, _name: &str) -> Option<String> {
        None
    }

    /// Parses `user_schema_json` (as returned by the `_SchemaExtension`/reflection queries)
    /// into the opaque pickle a `DatabaseEntry` stores. Delegates to the query compiler pool
    /// when one is available (`get_compiler_pool`); the default here stands in for "no
    /// compiler pool configured" by passing the JSON straight through.
    async fn parse_user_schema(&self, _tenant: &Tenant, _dbname: &str, user_schema_json: &[u8]) -> Vec<u8> {
        user_schema_json.to_vec()
    }

    /// Parses the global schema JSON the same way (`introspect_global_schema`/
    /// `introspect_global_schema_json`).
    async fn parse_global_schema(&self, _tenant: &Tenant, global_schema_json: &[u8]) -> Vec<u8> {
        global_schema_json.to_vec()
    }

    /// The standard (builtin) schema pickle (`get_std_schema`), prepended ahead of every
    /// database's user schema during compilation. Out of scope to actually compile here;
    /// an embedder with a compiler pool supplies the precompiled bytes.
    async fn get_std_schema(&self, _tenant: &Tenant) -> Vec<u8> {
        Vec::new()
    }

    /// Fetches `dbname`'s user schema as raw JSON over `conn` (`introspect_user_schema_json`),
    /// ahead of `parse_user_schema` turning it into a pickle.
    async fn introspect_user_schema_json(&self, _tenant: &Tenant, _conn: &BackendConn, _dbname: &str) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Fetches `dbname`'s per-database config as raw JSON over `conn`
    /// (`introspect_db_config`).
    async fn introspect_db_config(&self, _tenant: &Tenant, _conn: &BackendConn, _dbname: &str) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Fetches the cluster-wide global schema as raw JSON over `conn`
    /// (`introspect_global_schema_json`), ahead of `parse_global_schema`.
    async fn introspect_global_schema_json(&self, _tenant: &Tenant, _conn: &BackendConn) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// The report-config typedesc for `protocol_version`, used to build the
    /// `report_config_data` blob.
    async fn get_report_config_typedesc(&self, _tenant: &Tenant, _protocol_version: u32) -> Vec<u8> {
        Vec::new()
    }

    /// The server's default auth method for sessions over `transport` when no `sys_auth`
    /// rule matches.
    async fn get_default_auth_method(&self, _tenant: &Tenant, _transport: Transport) -> AuthMethod {
        AuthMethod::Trust
    }

    /// The config setting specification table (`config_settings`), used to validate and
    /// interpret values read back from `pg_settings`-style introspection.
    async fn config_settings(&self, _tenant: &Tenant) -> SettingValue {
        SettingValue::Null
    }

    /// The built-in defaults for every tenant-wide config setting, layered underneath
    /// whatever `sys_config` has been explicitly set (`default_sysconfig`).
    async fn default_sys_config(&self, _tenant: &Tenant) -> std::collections::HashMap<String, String> {
        std::collections::HashMap::new()
    }

    /// True when running under the test harness (`in_test_mode`); lets an embedder relax
    /// timeouts or skip real network calls in its own callback implementations.
    fn in_test_mode(&self) -> bool {
        false
    }

    /// Nudges the idle-connection garbage collector to re-evaluate its schedule
    /// (`reinit_idle_gc_collector`), called after `on_remote_system_config_change` in case
    /// an idle-timeout setting changed.
    async fn reinit_idle_gc_collector(&self, _tenant: &Tenant) {}

    // -- lifecycle / event notifications --

    /// A new database became known to this tenant (either first seen at boot, or created
    /// afterward via a sysevent).
    async fn on_db_registered(&self, _tenant: &Tenant, _dbname: &str) {}

    /// A database was dropped or otherwise unregistered; its pooled connections have
    /// already been pruned by the time this fires.
    async fn on_db_unregistered(&self, _tenant: &Tenant, _dbname: &str) {}

    /// A database's schema (DDL) or config changed, bumping its `dbver`.
    async fn on_schema_changed(&self, _tenant: &Tenant, _dbname: &str, _dbver: u64) {}

    /// The tenant-wide system config changed.
    async fn on_sys_config_changed(&self, _tenant: &Tenant) {}

    /// The global schema was re-fetched and re-parsed.
    async fn on_global_schema_changed(&self, _tenant: &Tenant) {}

    /// The cluster failed over to a new master; `new_master` is where the SysConn and all
    /// new pooled connections will be opened from here on.
    async fn on_switch_over(&self, _tenant: &Tenant, _new_master: &ClusterEndpoint) {}

    /// A background task (SysConn reconnect, sysevent dispatch, pool connect) hit an error
    /// it could not itself resolve. Fired for observability; the tenant has already decided
    /// internally whether to retry.
    async fn on_background_error(&self, _tenant: &Tenant, _component: &'static str, _err: &Error) {}
}

/// A `ServerCallbacks` that does nothing beyond the trait's own defaults; useful for tests
/// and for embedders that only care about a subset of events by wrapping this and
/// delegating selectively.
pub struct NoopCallbacks;

#[async_trait]
impl ServerCallbacks for NoopCallbacks {}
