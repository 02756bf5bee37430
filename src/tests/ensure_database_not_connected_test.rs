use test_env_log::test;

use crate::tenant_core::core::ensure_database_not_connected;
use crate::tenant_core::dbindex::DatabaseEntryFields;
use crate::tests::common::test_tenant;

/// `ensure_database_not_connected` fails immediately on a live local view without touching
/// the network, so this much is testable without a real Postgres instance.
#[test(tokio::test)]
async fn fails_immediately_with_an_active_local_view() {
    let tenant = test_tenant();
    tenant.db_index.register_db("app_db", DatabaseEntryFields::default());
    let view = tenant.db_index.new_view("app_db");

    let err = ensure_database_not_connected(&tenant, "app_db").await.unwrap_err();
    assert_eq!(err.to_string(), "database being accessed");

    drop(view);
}

/// Requires a local Postgres test instance: with no local view held, the function still
/// needs a healthy SysConn to emit the `ensure-database-not-used` sysevent and poll
/// `pg_stat_activity`; run with `cargo test -- --ignored`.
#[test(tokio::test)]
#[ignore = "requires a local Postgres test instance"]
async fn succeeds_once_the_cluster_reports_no_sessions() {
    let tenant = test_tenant();
    tenant.db_index.register_db("app_db", DatabaseEntryFields::default());

    tokio::spawn(tenant.sysconn.clone().run_reconnect_loop());
    tenant.sysconn.wait_until_healthy().await.unwrap();

    ensure_database_not_connected(&tenant, "app_db")
        .await
        .expect("no sessions on app_db, should succeed once drained");
    assert!(!tenant.is_database_connectable("app_db"));
}
