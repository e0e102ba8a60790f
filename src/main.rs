//! LFX v2 authentication service - bus-facing identity facade

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lfx_auth_service::{
    bus::BusClient, cli::Cli, config::Config, dispatcher::Dispatcher, providers,
    service::UserService, setup_tracing, sidecar,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_handle = match setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to setup tracing: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(url) = cli.nats_url {
                config.nats.url = url;
            }
            if let Some(port) = cli.port {
                config.sidecar.port = port;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        provider = ?config.provider,
        nats = %config.nats.url,
        "Starting auth service"
    );

    // Connect the bus and construct the configured adapter; both are fatal
    // configuration errors at startup
    let bus = match BusClient::connect(&config.nats).await {
        Ok(bus) => bus,
        Err(e) => {
            error!("Failed to connect to the message bus: {e}");
            return ExitCode::FAILURE;
        }
    };

    let provider = match providers::build(&config, &bus).await {
        Ok(provider) => provider,
        Err(e) => {
            error!("Failed to construct the identity provider: {e}");
            return ExitCode::FAILURE;
        }
    };

    let service = Arc::new(UserService::new(provider));
    let dispatcher = Dispatcher::new(bus.clone(), service);

    if let Err(e) = dispatcher.run().await {
        error!("Failed to establish subscriptions: {e}");
        return ExitCode::FAILURE;
    }

    // Readiness flips once the subscriptions exist
    let state = sidecar::SidecarState::new();
    state.set_ready(true);

    let shutdown = CancellationToken::new();
    let sidecar_task = tokio::spawn({
        let config = config.sidecar.clone();
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        async move { sidecar::serve(&config, state, Some(log_handle), shutdown).await }
    });

    wait_for_signal().await;

    info!("Shutting down");
    state.set_ready(false);
    shutdown.cancel();

    dispatcher.shutdown(config.shutdown_timeout).await;
    if let Err(e) = bus.drain().await {
        warn!("Bus drain failed: {e}");
    }
    match sidecar_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Sidecar failed: {e}"),
        Err(e) => warn!("Sidecar task failed: {e}"),
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
