mod cluster;
mod load;
mod settings;

pub use cluster::{ClusterConfig, ClusterEndpoint};
pub use load::find_config_file;
pub use settings::{
    load_config, Settings, DEFAULT_SYSTEM_DB_RECONNECT_INTERVAL_SECONDS,
    ENSURE_DB_NOT_CONNECTED_TIMEOUT_SECONDS, MAX_SUGGESTED_CLIENT_POOL_SIZE,
    MIN_SUGGESTED_CLIENT_POOL_SIZE,
};
