use std::sync::Arc;

use serde::Deserialize;
use tokio_postgres::Notification;
use tracing::{info, warn};

use crate::tenant_core::common::{Error, Result};
use crate::tenant_core::core::introspect::{early_introspect_db, ensure_database_not_connected, introspect_db};
use crate::tenant_core::core::Tenant;

/// Sysevent payloads are JSON objects keyed by `dbname` where applicable; every other field
/// any particular channel might carry is ignored here.
#[derive(Deserialize, Default)]
struct SysEventPayload {
    #[serde(default)]
    dbname: Option<String>,
}

fn require_dbname(channel: &str, payload: SysEventPayload) -> Result<String> {
    payload.dbname.ok_or_else(|| Error::execution(format!("{} event missing dbname", channel)))
}

async fn run_background<F>(tenant: &Arc<Tenant>, component: &'static str, fut: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let tenant = tenant.clone();
    tenant.clone().spawn_interruptable_if_accepting(async move {
        if let Err(e) = fut.await {
            warn!(component, error = %e, "sysevent-triggered task failed");
            tenant.metrics.record_background_error(component);
            tenant.callbacks().on_background_error(&tenant, component, &e).await;
        }
    });
}

/// Dispatches one `NOTIFY` received on the tenant's sysevent channel to the matching
/// callback. Each callback is non-blocking: it enqueues an interruptable task
/// if the tenant is still accepting new tasks, else drops the work silently.
pub async fn handle_sysevent(tenant: &Arc<Tenant>, notification: &Notification) -> Result<()> {
    let channel = notification.channel();
    let payload: SysEventPayload = serde_json::from_str(notification.payload()).unwrap_or_default();

    match channel {
        "schema-changes" => on_remote_ddl(tenant, &require_dbname(channel, payload)?).await,
        "database-changes" => on_remote_database_changes(tenant).await,
        "database-config-changes" => on_remote_database_config_change(tenant, &require_dbname(channel, payload)?).await,
        "system-config-changes" => on_remote_system_config_change(tenant).await,
        "global-schema-changes" => on_global_schema_change(tenant).await,
        "ensure-database-not-used" => {
            let dbname = require_dbname(channel, payload)?;
            tenant.block_database(&dbname);
            tenant.pool.prune_inactive_connections(&dbname);
        }
        "database-quarantine" => on_remote_database_quarantine(tenant, &require_dbname(channel, payload)?).await,
        other => warn!(channel = other, "ignoring unrecognized sysevent channel"),
    }
    Ok(())
}

/// A database's schema or per-database config changed remotely; re-introspect it.
pub async fn on_remote_ddl(tenant: &Arc<Tenant>, dbname: &str) {
    let dbname = dbname.to_string();
    let target = tenant.clone();
    run_background(tenant, "on_remote_ddl", async move { introspect_db(&target, &dbname).await }).await;
}

/// Same handling as `on_remote_ddl`, named separately because the two sysevent channels
/// are conceptually distinct upstream.
pub async fn on_remote_database_config_change(tenant: &Arc<Tenant>, dbname: &str) {
    let dbname = dbname.to_string();
    let target = tenant.clone();
    run_background(tenant, "on_remote_database_config_change", async move { introspect_db(&target, &dbname).await }).await;
}

/// A local client changed `dbname`'s config; re-introspect so the DbIndex reflects it
/// without waiting for the remote round-trip.
pub async fn on_local_database_config_change(tenant: &Arc<Tenant>, dbname: &str) {
    let dbname = dbname.to_string();
    let target = tenant.clone();
    run_background(tenant, "on_local_database_config_change", async move { introspect_db(&target, &dbname).await }).await;
}

/// The cluster's database set changed: list current names, early-introspect any the
/// DbIndex doesn't know yet, and unregister any it has that are gone.
pub async fn on_remote_database_changes(tenant: &Arc<Tenant>) {
    let target = tenant.clone();
    run_background(tenant, "on_remote_database_changes", async move {
        let current = target.callbacks().get_dbnames(&target).await;
        let known: Vec<String> = target.db_index.iter_dbs().into_iter().map(|e| e.name.clone()).collect();

        for dbname in &current {
            if !target.db_index.has_db(dbname) {
                early_introspect_db(&target, dbname).await?;
            }
        }
        for dbname in &known {
            if !current.contains(dbname) {
                target.db_index.unregister_db(dbname);
                target.pool.prune_inactive_connections(dbname);
                target.callbacks().on_db_unregistered(&target, dbname).await;
            }
        }
        Ok(())
    })
    .await;
}

/// The tenant-wide system config changed remotely: reload it via the server's `sys_config`
/// query template, fold it into the DbIndex, and nudge the idle-GC collector in case an
/// idle-timeout setting changed.
pub async fn on_remote_system_config_change(tenant: &Arc<Tenant>) {
    let target = tenant.clone();
    run_background(tenant, "on_remote_system_config_change", async move {
        if let Some(query) = target.callbacks().get_sys_query(&target, "sys_config").await {
            let sys = target.sysconn.use_sys_pgcon().await?;
            let rows = sys.sql_fetch_rows(&query, &[], |row| Ok((row.try_get::<_, String>(0)?, row.try_get::<_, String>(1)?))).await?;
            target.db_index.update_sys_config(rows.into_iter().collect());
        }
        target.callbacks().on_sys_config_changed(&target).await;
        target.callbacks().reinit_idle_gc_collector(&target).await;
        Ok(())
    })
    .await;
}

/// The global schema changed remotely: re-fetch it as JSON and re-parse.
pub async fn on_global_schema_change(tenant: &Arc<Tenant>) {
    let target = tenant.clone();
    run_background(tenant, "on_global_schema_change", async move {
        let sys = target.sysconn.use_sys_pgcon().await?;
        let json = target.callbacks().introspect_global_schema_json(&target, &sys).await?;
        drop(sys);
        let pickle = target.callbacks().parse_global_schema(&target, &json).await;
        target.db_index.update_global_schema(pickle);
        target.callbacks().on_global_schema_changed(&target).await;
        Ok(())
    })
    .await;
}

/// A peer quarantined `dbname` (it's mid-drop there too): block new local connections to
/// it and prune whatever idle ones this tenant was holding.
pub async fn on_remote_database_quarantine(tenant: &Arc<Tenant>, dbname: &str) {
    info!(dbname, "database quarantined by a peer");
    tenant.block_database(dbname);
    tenant.pool.prune_inactive_connections(dbname);
}

/// Rejects destructive DDL against the database a session is currently connected to;
/// otherwise waits for `dbname` to drain.
pub async fn on_before_drop_db(tenant: &Arc<Tenant>, dbname: &str, current: &str) -> Result<()> {
    if dbname == current {
        return Err(Error::execution("cannot drop the database a session is currently connected to"));
    }
    ensure_database_not_connected(tenant, dbname).await
}

/// Same guard as `on_before_drop_db`, applied before cloning a database from a template.
pub async fn on_before_create_db_from_template(tenant: &Arc<Tenant>, dbname: &str, current: &str) -> Result<()> {
    if dbname == current {
        return Err(Error::execution("cannot use the database a session is currently connected to as a template"));
    }
    ensure_database_not_connected(tenant, dbname).await
}

/// Clears `dbname`'s bookkeeping once a drop has actually completed: unregisters it from
/// the DbIndex and lifts any quarantine left over from `ensure_database_not_connected`.
pub async fn on_after_drop_db(tenant: &Arc<Tenant>, dbname: &str) {
    tenant.db_index.unregister_db(dbname);
    tenant.pool.prune_inactive_connections(dbname);
    tenant.unblock_database(dbname);
    tenant.callbacks().on_db_unregistered(tenant, dbname).await;
}

/// The system connection's driver reported a failover signal. No adaptive-HA backend is
/// modeled here (see DESIGN.md), so this always takes the "no HA backend" branch: force
/// the SysConn to rebuild against its currently configured master, which in turn
/// re-validates `ha_master_serial` for every in-flight backend connect.
pub async fn on_sys_pgcon_failover_signal(tenant: &Arc<Tenant>) {
    let endpoint = tenant.sysconn.current_endpoint().await;
    tenant.sysconn.on_switch_over(endpoint.clone()).await;
    tenant.pool.prune_all_connections();
    tenant.callbacks().on_switch_over(tenant, &endpoint).await;
}

/// A `ParameterStatus` update came in on the system connection; `in_hot_standby = on` means
/// the server the SysConn is attached to just became a standby, which is exactly a
/// failover signal.
pub async fn on_sys_pgcon_parameter_status_updated(tenant: &Arc<Tenant>, name: &str, value: &str) {
    if name == "in_hot_standby" && value == "on" {
        on_sys_pgcon_failover_signal(tenant).await;
    }
}

/// The system connection dropped unexpectedly: mark the tenant unavailable and let the
/// reconnect loop take over; it is non-interruptable and keeps retrying for the tenant's
/// whole lifetime.
pub async fn on_sys_pgcon_connection_lost(tenant: &Arc<Tenant>, reason: &str) {
    warn!(reason, "system connection lost");
    tenant.set_pg_unavailable_msg(Some(reason.to_string()));
    tenant.terminate_sys_pgcon().await;
}
