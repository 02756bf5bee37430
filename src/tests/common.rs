use std::env;
use std::sync::Arc;

use crate::tenant_core::config::{ClusterConfig, ClusterEndpoint, Settings};
use crate::tenant_core::core::{NoopCallbacks, ServerCallbacks, Tenant};

pub const TEST_SYSTEM_DATABASE: &str = "tenant_core_test_system";

fn env_or(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Builds `Settings` pointing at a local test Postgres instance, overridable via
/// `TENANT_CORE_TEST_*` environment variables for CI setups that run Postgres elsewhere.
pub fn test_settings() -> Settings {
    let master = ClusterEndpoint {
        host: env_or("TENANT_CORE_TEST_HOST", "127.0.0.1"),
        port: env_or("TENANT_CORE_TEST_PORT", "5432").parse().unwrap(),
        user: env_or("TENANT_CORE_TEST_USER", "tenant_core_test"),
        password: env_or("TENANT_CORE_TEST_PASSWORD", "tenant_core_test"),
    };

    let mut settings = Settings::test_only_new(ClusterConfig {
        system_database: TEST_SYSTEM_DATABASE.to_string(),
        master,
        replicas: Vec::new(),
    });
    settings.app_name = "tenant-core-test".to_string();
    settings
}

pub fn test_tenant() -> Arc<Tenant> {
    test_tenant_with_callbacks(Arc::new(NoopCallbacks))
}

pub fn test_tenant_with_callbacks(callbacks: Arc<dyn ServerCallbacks>) -> Arc<Tenant> {
    Tenant::init(test_settings(), callbacks).expect("tenant init should not touch the network")
}
