use std::path::PathBuf;

use serde::Deserialize;
use tracing::{debug, info, info_span};

use crate::tenant_core::common::{Error, Result};
use crate::tenant_core::config::cluster::ClusterConfig;
use crate::tenant_core::config::load::{find_config_file, replace_env_vars};

/// Lower/upper clamp for `Tenant::suggested_client_pool_size`:
/// `clamp(max_backend, [MIN, MAX])`.
pub const MIN_SUGGESTED_CLIENT_POOL_SIZE: u32 = 10;
pub const MAX_SUGGESTED_CLIENT_POOL_SIZE: u32 = 100;

/// How long `SysConn`'s reconnect loop waits between connection attempts, absent a
/// shorter-circuiting signal on the reconnect event.
pub const DEFAULT_SYSTEM_DB_RECONNECT_INTERVAL_SECONDS: u64 = 1;

/// Hard timeout for `ensure_database_not_connected`'s drain poll.
pub const ENSURE_DB_NOT_CONNECTED_TIMEOUT_SECONDS: u64 = 10;

/// Per-tenant configuration.
///
/// Never stored in a process-wide static: there is no global mutable state at process
/// scope, so each `Tenant` owns its own `Settings` (usually behind an `Arc`), making
/// multi-tenant tests (and multiple tenants per process) straightforward.
#[derive(Deserialize, Clone)]
pub struct Settings {
    /// config_path is the path of the loaded config file
    #[serde(skip_deserializing)]
    config_path: PathBuf,
    /// app_name identifies this tenant's sessions to the cluster if not overridden by a client
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// the logical instance this tenant belongs to
    pub instance_name: String,
    /// the Postgres cluster (master + replicas) this tenant is attached to
    pub cluster: ClusterConfig,
    /// global cap on live backend connections, one of which is reserved for the SysConn
    #[serde(default = "default_max_backend_connections")]
    pub max_backend_connections: u32,
    /// path to a file whose contents drive the ReadinessMonitor; absent means readiness
    /// always reports Default/online.
    #[serde(default)]
    pub readiness_state_file: Option<PathBuf>,
    /// path to a newline-delimited file of allowed JWT `sub` claims
    #[serde(default)]
    pub jwt_sub_allowlist_file: Option<PathBuf>,
    /// path to a newline-delimited file of revoked JWT `jti` claims
    #[serde(default)]
    pub jwt_revocation_list_file: Option<PathBuf>,
    #[serde(default = "default_reconnect_interval")]
    pub system_db_reconnect_interval_seconds: u64,
    #[serde(default = "default_ensure_db_timeout")]
    pub ensure_db_not_connected_timeout_seconds: u64,
}

fn default_app_name() -> String {
    "tenant-core".to_string()
}
const fn default_max_backend_connections() -> u32 {
    100
}
const fn default_reconnect_interval() -> u64 {
    DEFAULT_SYSTEM_DB_RECONNECT_INTERVAL_SECONDS
}
const fn default_ensure_db_timeout() -> u64 {
    ENSURE_DB_NOT_CONNECTED_TIMEOUT_SECONDS
}

impl Settings {
    #[cfg(test)]
    pub fn test_only_new(cluster: ClusterConfig) -> Self {
        Settings {
            config_path: PathBuf::new(),
            app_name: default_app_name(),
            instance_name: "test".to_string(),
            cluster,
            max_backend_connections: default_max_backend_connections(),
            readiness_state_file: None,
            jwt_sub_allowlist_file: None,
            jwt_revocation_list_file: None,
            system_db_reconnect_interval_seconds: default_reconnect_interval(),
            ensure_db_not_connected_timeout_seconds: default_ensure_db_timeout(),
        }
    }

    pub(crate) fn load(&mut self, path: PathBuf) -> Result<()> {
        self.config_path = path;
        if self.max_backend_connections < 2 {
            // one connection is always reserved for the SysConn
            return Err(Error::startup("max_backend_connections must be >= 2"));
        }
        self.cluster.load()
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// The client-facing pool size hint derived from `max_backend_connections`.
    pub fn suggested_client_pool_size(&self) -> u32 {
        self.max_backend_connections
            .clamp(MIN_SUGGESTED_CLIENT_POOL_SIZE, MAX_SUGGESTED_CLIENT_POOL_SIZE)
    }
}

/// Load settings from `tenant-core.yaml`, searching the locations `find_config_file`
/// checks in order.
pub fn load_config(config_name: &str) -> Result<Settings> {
    let _span = info_span!("loading config file").entered();
    let config_path = find_config_file(config_name)?;
    info!(config_path = %config_path.to_string_lossy().into_owned(), "found config file");
    let raw_yaml = std::fs::read_to_string(&config_path)?;
    let yaml_text = replace_env_vars(&raw_yaml)?;

    debug!("parsing settings yaml");
    let mut settings: Settings = serde_yaml::from_str(&yaml_text)?;
    settings.load(config_path)?;
    Ok(settings)
}
