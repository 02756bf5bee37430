use serde::Deserialize;

use crate::tenant_core::common::{Error, Result};

/// One reachable Postgres endpoint: either the current master or one of its replicas.
/// Trimmed to what the tenant core needs to open a backend connection; TLS negotiation and
/// routing are the wire-protocol front-end's concern, out of scope here.
#[derive(Deserialize, Clone, Debug)]
pub struct ClusterEndpoint {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_host() -> String {
    "localhost".to_string()
}
const fn default_port() -> u16 {
    5432
}

impl ClusterEndpoint {
    fn load(&mut self, defaults: &ClusterEndpoint) -> Result<()> {
        if self.host.is_empty() {
            self.host = defaults.host.clone();
        }
        if self.user.is_empty() {
            self.user = defaults.user.clone();
        }
        if self.port == 0 {
            self.port = defaults.port;
        }
        if self.host.is_empty() {
            return Err(Error::startup("cluster endpoint host not set"));
        }
        Ok(())
    }
}

/// The cluster this tenant is attached to: a master plus zero or more replicas used only
/// for HA failover bookkeeping. The tenant always issues its privileged SysConn and pooled
/// backend connections against whichever endpoint is currently master.
#[derive(Deserialize, Clone, Debug)]
pub struct ClusterConfig {
    /// the system database name holding cross-tenant metadata
    #[serde(default = "default_system_db")]
    pub system_database: String,
    pub master: ClusterEndpoint,
    #[serde(default)]
    pub replicas: Vec<ClusterEndpoint>,
}

fn default_system_db() -> String {
    "edgedb_system".to_string()
}

impl ClusterConfig {
    pub(crate) fn load(&mut self) -> Result<()> {
        let defaults = self.master.clone();
        for replica in &mut self.replicas {
            replica.load(&defaults)?;
        }
        if self.master.host.is_empty() {
            return Err(Error::startup("postgres cluster master host not set"));
        }
        Ok(())
    }
}
