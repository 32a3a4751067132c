use anyhow::Context;
use streamnet_config::load as load_config;
use streamnet_runtime::{
    poll::poll_loop, shutdown_signal, telemetry, Collaborators, Services, TaskSupervisor,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise tracing")?;

    info!("starting Streamnet backend");

    let config = load_config().context("failed to load configuration")?;

    let services = Arc::new(
        Services::initialise(&config, Collaborators::default())
            .await
            .context("failed to initialise services")?,
    );

    services
        .rehydrate()
        .await
        .context("failed to rehydrate open sessions")?;

    let mut supervisor = TaskSupervisor::new();

    {
        let services = services.clone();
        let shutdown = supervisor.subscribe();
        supervisor.spawn("token-refresher", async move {
            services.refresher.run(shutdown).await;
        });
    }
    {
        let services = services.clone();
        let shutdown = supervisor.subscribe();
        supervisor.spawn("grace-controller", async move {
            services.grace.run(shutdown).await;
        });
    }
    {
        let services = services.clone();
        let shutdown = supervisor.subscribe();
        supervisor.spawn("live-state-poll", async move {
            poll_loop(&services, shutdown).await;
        });
    }
    {
        let services = services.clone();
        let shutdown = supervisor.subscribe();
        supervisor.spawn("pending-raid-reaper", async move {
            services.correlator.run_reaper(shutdown).await;
        });
    }

    info!("backend initialised, awaiting shutdown signal");
    shutdown_signal().await;

    supervisor.shutdown().await;
    info!("streamnet backend stopped");
    Ok(())
}
