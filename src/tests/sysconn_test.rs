use std::time::Duration;

use test_env_log::test;

use crate::tenant_core::common::ErrorKind;
use crate::tenant_core::sysconn::{SysConn, SysConnState};
use crate::tests::common::test_settings;

/// Requires a local Postgres test instance; run with `cargo test -- --ignored`.
#[test(tokio::test)]
#[ignore = "requires a local Postgres test instance"]
async fn reconnect_loop_reaches_healthy() {
    let settings = test_settings();
    let sysconn = SysConn::new(
        settings.cluster.master.clone(),
        "postgres".to_string(),
        settings.app_name.clone(),
        Duration::from_millis(100),
    );

    let loop_handle = tokio::spawn(sysconn.clone().run_reconnect_loop());

    tokio::time::timeout(Duration::from_secs(5), sysconn.wait_until_healthy())
        .await
        .expect("sysconn did not become healthy in time")
        .unwrap();
    assert_eq!(sysconn.state(), SysConnState::Healthy);

    let guard = sysconn.use_sys_pgcon().await.unwrap();
    let one: Option<i32> = guard.sql_fetch_val("SELECT 1", &[]).await.unwrap();
    assert_eq!(one, Some(1));
    drop(guard);

    sysconn.terminate().await;
    loop_handle.abort();
}

#[test(tokio::test)]
#[ignore = "requires a local Postgres test instance"]
async fn switch_over_forces_a_reconnect() {
    let settings = test_settings();
    let sysconn = SysConn::new(
        settings.cluster.master.clone(),
        "postgres".to_string(),
        settings.app_name.clone(),
        Duration::from_millis(100),
    );
    let loop_handle = tokio::spawn(sysconn.clone().run_reconnect_loop());

    sysconn.wait_until_healthy().await.unwrap();
    let serial_before = sysconn.ha_master_serial();

    sysconn.on_switch_over(settings.cluster.master.clone()).await;
    assert_eq!(sysconn.ha_master_serial(), serial_before + 1);
    assert_eq!(sysconn.state(), SysConnState::Disconnected);

    sysconn.wait_until_healthy().await.unwrap();
    assert_eq!(sysconn.state(), SysConnState::Healthy);

    sysconn.terminate().await;
    loop_handle.abort();
}

/// An organically-dropped system connection (nobody called `terminate`/`on_switch_over`)
/// must still be detected and rebuilt — this is the self-healing promise spec §4.3 makes
/// for `SysConn`.
#[test(tokio::test)]
#[ignore = "requires a local Postgres test instance"]
async fn organic_connection_loss_is_detected_and_reconnected() {
    use crate::tenant_core::backend::BackendConn;

    let settings = test_settings();
    let sysconn = SysConn::new(
        settings.cluster.master.clone(),
        "postgres".to_string(),
        settings.app_name.clone(),
        Duration::from_millis(100),
    );
    let mut lost_rx = sysconn.take_conn_lost_receiver().unwrap();
    let loop_handle = tokio::spawn(sysconn.clone().run_reconnect_loop());

    sysconn.wait_until_healthy().await.unwrap();
    let pid_before = {
        let guard = sysconn.use_sys_pgcon().await.unwrap();
        guard.backend_pid()
    };

    // Kill the backend out from under the connection from a side session, simulating an
    // unexpected drop rather than a clean terminate()/on_switch_over().
    let killer = BackendConn::open(&settings.cluster.master, "postgres", &settings.app_name, None)
        .await
        .unwrap();
    let _: Option<bool> = killer.sql_fetch_val("SELECT pg_terminate_backend($1)", &[&pid_before]).await.unwrap();
    killer.terminate();

    tokio::time::timeout(Duration::from_secs(5), lost_rx.recv())
        .await
        .expect("connection-lost reason never arrived")
        .expect("conn_lost channel closed unexpectedly");

    tokio::time::timeout(Duration::from_secs(5), sysconn.wait_until_healthy())
        .await
        .expect("sysconn did not reconnect in time")
        .unwrap();
    let pid_after = {
        let guard = sysconn.use_sys_pgcon().await.unwrap();
        guard.backend_pid()
    };
    assert_ne!(pid_before, pid_after);

    sysconn.terminate().await;
    loop_handle.abort();
}

/// `shutdown` is the permanent variant of `terminate` that makes the reconnect loop return
/// rather than rebuild the connection.
#[test(tokio::test)]
#[ignore = "requires a local Postgres test instance"]
async fn shutdown_stops_the_reconnect_loop_and_unblocks_waiters() {
    let settings = test_settings();
    let sysconn = SysConn::new(
        settings.cluster.master.clone(),
        "postgres".to_string(),
        settings.app_name.clone(),
        Duration::from_millis(100),
    );
    let loop_handle = tokio::spawn(sysconn.clone().run_reconnect_loop());

    sysconn.wait_until_healthy().await.unwrap();
    sysconn.shutdown().await;

    let err = sysconn.wait_until_healthy().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ClosedError));

    tokio::time::timeout(Duration::from_secs(1), loop_handle)
        .await
        .expect("reconnect loop did not exit after shutdown")
        .unwrap();
}
