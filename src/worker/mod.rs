//! Gateway worker, the process the supervisor launches.
//!
//! Loads the registry, binds the loopback HTTP surface, announces readiness on
//! the status channel, optionally connects enabled providers, and serves until
//! a shutdown signal arrives. Every provider is disconnected on the way out.

pub mod api;
pub mod gateway;
pub mod status;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::WorkerSettings;
use crate::provider::{GatewayError, ProcessTransportFactory, ProviderRegistry, RetryPolicy};

pub use gateway::Gateway;
pub use status::{StatusChannel, StatusChannelLayer, WorkerMessage, EXIT_PORT_IN_USE};

/// Run the worker until Ctrl-C or SIGTERM.
pub async fn run(settings: &WorkerSettings, channel: StatusChannel) -> Result<(), GatewayError> {
    run_until(settings, channel, shutdown_signal()).await
}

/// Run the worker until `shutdown` resolves.
pub async fn run_until(
    settings: &WorkerSettings,
    channel: StatusChannel,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), GatewayError> {
    let registry = Arc::new(ProviderRegistry::open(&settings.config_dir));
    tracing::info!(
        config_dir = %settings.config_dir.display(),
        providers = registry.len(),
        routes = registry.route_count(),
        "registry loaded"
    );

    let gateway = Arc::new(
        Gateway::new(
            registry,
            Arc::new(ProcessTransportFactory::default()),
            RetryPolicy::default(),
        )
        .with_instance_id(settings.instance_id.clone()),
    );

    let listener = bind(settings.port).await?;
    let port = listener
        .local_addr()
        .map(|addr| addr.port())
        .unwrap_or(settings.port);
    channel.ready(port);
    tracing::info!(port, "worker listening on http://127.0.0.1:{port}");

    if !settings.no_autoconnect {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            gateway.connect_enabled(&RetryPolicy::default()).await;
        });
    }

    let served = axum::serve(listener, api::router(Arc::clone(&gateway)))
        .with_graceful_shutdown(shutdown)
        .await;

    tracing::info!("shutting down, disconnecting all providers");
    gateway.disconnect_all().await;

    served.map_err(|e| GatewayError::Internal {
        reason: format!("server error: {e}"),
    })
}

async fn bind(port: u16) -> Result<TcpListener, GatewayError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            tracing::error!(port, "port already in use");
            Err(GatewayError::PortInUse {
                first: port,
                last: port,
            })
        }
        Err(e) => Err(GatewayError::Internal {
            reason: format!("failed to bind {addr}: {e}"),
        }),
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
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
