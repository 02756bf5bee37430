use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as SettingValue;
use tokio::time::Instant;
use tracing::info;

use crate::tenant_core::backend::{BackendConn, BackendErrorKind};
use crate::tenant_core::common::{Error, Result};
use crate::tenant_core::core::Tenant;
use crate::tenant_core::dbindex::DatabaseEntryFields;

/// `SELECT json_agg(name) FROM edgedb."_SchemaExtension";`
async fn fetch_extensions(conn: &BackendConn) -> Result<Arc<HashSet<String>>> {
    let agg: Option<SettingValue> = conn.sql_fetch_val(r#"SELECT json_agg(name) FROM edgedb."_SchemaExtension";"#, &[]).await?;
    let names = match agg {
        Some(SettingValue::Array(items)) => items.into_iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        _ => HashSet::new(),
    };
    Ok(Arc::new(names))
}

/// `SELECT json_object_agg("id"::text, "backend_id")::text FROM edgedb."_SchemaType";`
async fn fetch_backend_ids(conn: &BackendConn) -> Result<HashMap<String, String>> {
    let raw: Option<String> = conn
        .sql_fetch_val(r#"SELECT json_object_agg("id"::text, "backend_id")::text FROM edgedb."_SchemaType";"#, &[])
        .await?;
    Ok(match raw {
        Some(text) => serde_json::from_str(&text)?,
        None => HashMap::new(),
    })
}

/// Reflection cache query over `edgedb._get_cached_reflection()`.
async fn fetch_reflection_cache(conn: &BackendConn) -> Result<HashMap<String, Vec<String>>> {
    let rows = conn
        .sql_fetch_rows("SELECT name, value FROM edgedb._get_cached_reflection();", &[], |row| {
            Ok((row.try_get::<_, String>(0)?, row.try_get::<_, Vec<String>>(1)?))
        })
        .await?;
    Ok(rows.into_iter().collect())
}

/// Early introspection: opens a connection to `dbname`, reads only the extension set, and
/// registers it with every other field left null so the database is admissible before full
/// schema parsing completes. Invalid-catalog errors
/// (the database was dropped mid-race) are swallowed, matching the init sequence's
/// "ignore databases that 404".
pub async fn early_introspect_db(tenant: &Arc<Tenant>, dbname: &str) -> Result<()> {
    let conn = match tenant.acquire_pgcon(dbname).await {
        Ok(conn) => conn,
        Err(e) if e.code_is(BackendErrorKind::InvalidCatalog) => return Ok(()),
        Err(e) => return Err(e),
    };

    let extensions = fetch_extensions(&conn).await?;
    drop(conn);

    tenant.db_index.register_db(
        dbname,
        DatabaseEntryFields {
            extensions,
            ..Default::default()
        },
    );
    tenant.callbacks().on_db_registered(tenant, dbname).await;
    Ok(())
}

/// Full re-introspection of one database. Multiple concurrent calls for the same `dbname`
/// are safe: each computes its own snapshot and the last `register_db` wins.
pub async fn introspect_db(tenant: &Arc<Tenant>, dbname: &str) -> Result<()> {
    let conn = match tenant.acquire_pgcon(dbname).await {
        Ok(conn) => conn,
        Err(e) if e.code_is(BackendErrorKind::InvalidCatalog) => {
            if tenant.db_index.has_db(dbname) {
                tenant.db_index.unregister_db(dbname);
                tenant.pool.prune_inactive_connections(dbname);
                tenant.callbacks().on_db_unregistered(tenant, dbname).await;
            }
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let extensions = fetch_extensions(&conn).await?;
    let backend_ids = fetch_backend_ids(&conn).await?;
    let reflection_cache = fetch_reflection_cache(&conn).await?;
    let user_schema_json = tenant.callbacks().introspect_user_schema_json(tenant, &conn, dbname).await?;
    let db_config_json = tenant.callbacks().introspect_db_config(tenant, &conn, dbname).await?;
    drop(conn);

    let user_schema_pickle = tenant.callbacks().parse_user_schema(tenant, dbname, &user_schema_json).await;
    let db_config: HashMap<String, SettingValue> = if db_config_json.is_empty() {
        HashMap::new()
    } else {
        serde_json::from_slice(&db_config_json)?
    };

    let fields = DatabaseEntryFields {
        user_schema_pickle: Some(Arc::new(user_schema_pickle)),
        db_config: Some(Arc::new(db_config)),
        reflection_cache: Some(Arc::new(reflection_cache)),
        backend_ids: Some(Arc::new(backend_ids)),
        extensions,
        ext_config_settings: None,
    };

    let was_known = tenant.db_index.has_db(dbname);
    let entry = tenant.db_index.register_db(dbname, fields);
    if was_known {
        tenant.callbacks().on_schema_changed(tenant, dbname, entry.dbver).await;
    } else {
        tenant.callbacks().on_db_registered(tenant, dbname).await;
    }
    Ok(())
}

/// Lists every database the cluster currently knows about and early-introspects each
/// concurrently. Run once during `run_init`, before `start_accepting_new_tasks` opens the
/// gate.
pub async fn introspect_all_dbs(tenant: &Arc<Tenant>) -> Result<()> {
    let dbnames = tenant.callbacks().get_dbnames(tenant).await;
    info!(count = dbnames.len(), "introspecting databases");

    let mut set = tokio::task::JoinSet::new();
    for dbname in dbnames {
        let tenant = tenant.clone();
        set.spawn(async move {
            if let Err(e) = early_introspect_db(&tenant, &dbname).await {
                tracing::warn!(dbname, error = %e, "early introspection failed, skipping database");
            }
        });
    }
    while set.join_next().await.is_some() {}
    Ok(())
}

/// Guards destructive DDL against in-flight sessions. Fails immediately if the DbIndex
/// reports any live local views; otherwise blocks new connections to `dbname`,
/// prunes idle local connections, tells peers to do the same, then polls `pg_stat_activity`
/// with exponential backoff until no backend session remains on `dbname` or the tenant's
/// configured timeout elapses.
pub async fn ensure_database_not_connected(tenant: &Arc<Tenant>, dbname: &str) -> Result<()> {
    if tenant.db_index.count_connections(dbname) > 0 {
        return Err(Error::execution("database being accessed"));
    }

    tenant.block_database(dbname);
    tenant.pool.prune_inactive_connections(dbname);

    let payload = serde_json::json!({ "dbname": dbname }).to_string();
    tenant.sysconn.notify("ensure-database-not-used", &payload).await?;

    let timeout = Duration::from_secs(tenant.settings.ensure_db_not_connected_timeout_seconds);
    let deadline = Instant::now() + timeout;
    let mut backoff = Duration::from_millis(25);

    loop {
        let pids: Vec<i32> = {
            let sys = tenant.sysconn.use_sys_pgcon().await?;
            sys.sql_fetch_col("SELECT pid FROM pg_stat_activity WHERE datname = $1;", &[&dbname]).await?
        };
        if pids.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::execution(format!(
                "database \"{}\" still has {} active backend session(s) after waiting",
                dbname,
                pids.len()
            )));
        }

        tokio::time::sleep(backoff.min(deadline - now)).await;
        backoff = (backoff * 2).min(Duration::from_secs(1));
    }
}
