use test_env_log::test;

use crate::tenant_core::backend::BackendConn;
use crate::tests::common::test_settings;

/// Requires a local Postgres reachable with the `TENANT_CORE_TEST_*` credentials (see
/// tests/common.rs); run with `cargo test -- --ignored` against a real instance.
#[test(tokio::test)]
#[ignore = "requires a local Postgres test instance"]
async fn opens_and_queries_a_connection() {
    let settings = test_settings();
    let conn = BackendConn::open(&settings.cluster.master, "postgres", &settings.app_name, None)
        .await
        .expect("failed to open backend connection");

    assert!(conn.is_healthy());
    assert!(conn.backend_pid() > 0);

    let one: Option<i32> = conn.sql_fetch_val("SELECT 1", &[]).await.unwrap();
    assert_eq!(one, Some(1));

    let names: Vec<String> = conn
        .sql_fetch_col("SELECT datname FROM pg_database ORDER BY datname", &[])
        .await
        .unwrap();
    assert!(names.contains(&"postgres".to_string()));

    conn.terminate();
}

#[test(tokio::test)]
#[ignore = "requires a local Postgres test instance"]
async fn cancel_token_is_independent_of_connection_lifetime() {
    let settings = test_settings();
    let conn = BackendConn::open(&settings.cluster.master, "postgres", &settings.app_name, None)
        .await
        .unwrap();
    let token = conn.cancel_token();
    assert_eq!(token.backend_pid(), conn.backend_pid());
    assert!(token.start_pg_cancellation());
    assert!(!token.start_pg_cancellation());
    token.finish_pg_cancellation();
    assert!(token.start_pg_cancellation());

    conn.terminate();
    // the token outlives the connection it came from
    assert!(token.backend_pid() > 0);
}

#[test(tokio::test)]
#[ignore = "requires a local Postgres test instance"]
async fn abort_fires_lost_signal_but_terminate_does_not() {
    let settings = test_settings();

    let aborted = BackendConn::open(&settings.cluster.master, "postgres", &settings.app_name, None)
        .await
        .unwrap();
    let lost = aborted.lost_signal();
    aborted.abort();
    tokio::time::timeout(std::time::Duration::from_secs(1), lost.notified())
        .await
        .expect("abort() should fire the connection-lost signal");

    let terminated = BackendConn::open(&settings.cluster.master, "postgres", &settings.app_name, None)
        .await
        .unwrap();
    let lost = terminated.lost_signal();
    terminated.terminate();
    assert!(
        tokio::time::timeout(std::time::Duration::from_millis(200), lost.notified()).await.is_err(),
        "terminate() should not fire the connection-lost signal"
    );
}
