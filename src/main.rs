use std::sync::Arc;

use tokio::runtime::Builder;
use tracing::{error, info, info_span, Level};

use tenant_core::core::{NoopCallbacks, Tenant};
use tenant_core::{init_settings, init_tracing};

fn main() {
    init_tracing(Level::INFO);
    let _span = info_span!("startup").entered();

    let settings = init_settings().expect("could not load config");

    let tokio_rt = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("could not create tokio runtime");

    tokio_rt.block_on(async move {
        // The wire-protocol front-end and any HTTP auth surface are owned by whoever embeds
        // this crate; main() here only demonstrates bringing one tenant's runtime core up
        // and down cleanly.
        let tenant = Tenant::init(settings, Arc::new(NoopCallbacks)).expect("tenant init failed");
        tenant.start_running();

        if let Err(e) = tenant.run_init().await {
            error!(error = %e, "tenant init failed");
            return;
        }
        tenant.start_accepting_new_tasks();
        info!("tenant is ready to accept sessions");

        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
        info!("shutting down");
        tenant.stop().await;
        tenant.wait_stopped().await;
    });
}
