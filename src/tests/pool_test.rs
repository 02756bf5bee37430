use test_env_log::test;

use crate::tenant_core::backend::BackendConn;
use crate::tenant_core::pool::ConnPool;
use crate::tests::common::test_settings;

/// Requires a local Postgres test instance with both `postgres` and `template1` reachable
/// (true of any default install); run with `cargo test -- --ignored`.
#[test(tokio::test)]
#[ignore = "requires a local Postgres test instance"]
async fn reuses_idle_connection_for_same_database() {
    let settings = test_settings();
    let pool = ConnPool::new(10);

    let connect = {
        let settings = settings.clone();
        move || {
            let settings = settings.clone();
            async move { BackendConn::open(&settings.cluster.master, "postgres", &settings.app_name, None).await }
        }
    };

    let conn1 = pool.acquire("postgres", connect.clone()).await.unwrap();
    let pid1 = conn1.backend_pid();
    drop(conn1);

    let conn2 = pool.acquire("postgres", connect).await.unwrap();
    assert_eq!(conn2.backend_pid(), pid1, "expected the idle connection to be reused");
}

#[test(tokio::test)]
#[ignore = "requires a local Postgres test instance"]
async fn evicts_other_databases_idle_connection_under_capacity() {
    let settings = test_settings();
    let pool = ConnPool::new(1);

    let settings_a = settings.clone();
    let conn_a = pool
        .acquire("postgres", move || {
            let settings = settings_a.clone();
            async move { BackendConn::open(&settings.cluster.master, "postgres", &settings.app_name, None).await }
        })
        .await
        .unwrap();
    let pid_a = conn_a.backend_pid();
    drop(conn_a); // now idle, the pool's only connection

    assert_eq!(pool.current_capacity().0, 1);

    let settings_b = settings.clone();
    let conn_b = pool
        .acquire("template1", move || {
            let settings = settings_b.clone();
            async move { BackendConn::open(&settings.cluster.master, "template1", &settings.app_name, None).await }
        })
        .await
        .unwrap();

    assert_eq!(conn_b.dbname(), "template1");
    assert_ne!(conn_b.backend_pid(), pid_a);
    assert_eq!(pool.current_capacity().0, 1, "evicting the idle connection should keep total_open at capacity");
}
