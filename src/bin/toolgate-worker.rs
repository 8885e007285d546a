//! `toolgate-worker`: the gateway process launched by the supervisor.
//!
//! Stdout is reserved for status records (JSON lines); human-readable logs go
//! to the log file only.

use clap::Parser;

use toolgate::config::WorkerSettings;
use toolgate::provider::GatewayError;
use toolgate::worker::{self, StatusChannel, EXIT_PORT_IN_USE};
use toolgate::TracingOptions;

#[tokio::main]
async fn main() {
    let settings = WorkerSettings::parse();
    let channel = StatusChannel::stdout();

    if let Err(e) = toolgate::init_tracing(TracingOptions {
        name: "toolgate-worker",
        level: settings.log_level.clone(),
        log_dir: toolgate::data_dir().join("logs"),
        stderr: false,
        status: Some(channel.clone()),
    }) {
        eprintln!("failed to initialize logging: {e:#}");
    }

    match worker::run(&settings, channel).await {
        Ok(()) => tracing::info!("worker exited"),
        Err(e @ GatewayError::PortInUse { .. }) => {
            tracing::error!(error = %e, "port unavailable");
            eprintln!("{e}");
            std::process::exit(EXIT_PORT_IN_USE);
        }
        Err(e) => {
            tracing::error!(error = %e, "worker failed");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
