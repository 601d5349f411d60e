use std::env;

use anyhow::Context;
use coordinator::{Coordinator, CoordinatorConfig};
use log::info;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => CoordinatorConfig::from_json_file(&path)
            .with_context(|| format!("loading config from {path}"))?,
        None => CoordinatorConfig::from_env().context("loading config from the environment")?,
    };

    info!(
        total_clients = config.total_clients.get(),
        round_timeout_secs = config.round_timeout_secs;
        "starting coordinator"
    );

    let listener = TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;

    let coordinator = Coordinator::from_config(&config);
    let shutdown = CancellationToken::new();

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received SIGINT");
        }
        ctrl_c.cancel();
    });

    coordinator.serve(listener, shutdown).await?;
    Ok(())
}
