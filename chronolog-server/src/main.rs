use std::sync::Arc;

use chronolog_server::server::BoxError;
use chronolog_server::{Cli, Server};
use chronolog_store::{CollectionRouter, SystemClock};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (router_config, server_config) = Cli::parse().into_parts();
    for pattern in &router_config.patterns {
        log::info!("Registered collection {pattern}");
    }

    let router = Arc::new(CollectionRouter::open(router_config, Arc::new(SystemClock))?);
    let server = Server::new(server_config, router);
    server.run_until(shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
