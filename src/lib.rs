pub mod tenant_core;
#[cfg(test)]
mod tests;

pub use crate::tenant_core::*;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::tenant_core::common::Result;
use crate::tenant_core::config::{load_config, Settings};

pub fn init_tracing(max_level: Level) {
    let subscriber = FmtSubscriber::builder()
        // all spans/events with a level higher than TRACE (e.g, debug, info, warn, etc.)
        // will be written to stdout.
        .with_max_level(max_level)
        // completes the builder.
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// Loads this tenant's configuration from tenant-core.yaml.
/// See tenant_core::config::load_config for more info.
pub fn init_settings() -> Result<Settings> {
    load_config("tenant-core.yaml")
}
