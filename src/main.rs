//! EventListener Kubernetes Operator
//!
//! Main entry point for the operator. Sets up the Kubernetes client, loads
//! configuration from the environment and runs the reconciliation loop.

use kube::Client;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use event_listener_operator::{config::ControllerConfig, controllers::event_listener_controller, metrics};

/// Operator metrics and health port
const METRICS_PORT: u16 = 8080;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting EventListener Operator");

    let config = ControllerConfig::from_env();
    info!(
        image = %config.image,
        system_namespace = %config.system_namespace,
        "Loaded controller configuration"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let metrics_handle = tokio::spawn(metrics::serve(METRICS_PORT));
    let controller_handle = tokio::spawn(event_listener_controller::run(client, config));

    tokio::select! {
        _ = controller_handle => {
            info!("EventListener controller exited");
        }
        res = metrics_handle => {
            error!("Metrics server exited unexpectedly: {:?}", res);
        }
        res = shutdown_signal() => {
            res?;
            info!("Received shutdown signal, stopping operator");
        }
    }

    info!("EventListener Operator stopped");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,event_listener_operator=debug,kube=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                info!("Received CTRL+C signal");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM signal");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received CTRL+C signal");
    }

    Ok(())
}
