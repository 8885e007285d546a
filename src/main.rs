//! `toolgate`: the supervisor.
//!
//! Keeps a `toolgate-worker` alive and prints one JSON line per notable status
//! change on stdout. Reads line commands on stdin:
//! `status`, `logs`, `start`, `restart`, `force-fix`, `stop`, `quit`.

use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use toolgate::config::SupervisorSettings;
use toolgate::supervisor::{
    resolve_config_dir, resolve_worker_command, spawn_supervisor, HttpHealthChecker,
    ProcessLauncher, SupervisorConfig, SupervisorHandle, TcpPortProbe,
};
use toolgate::TracingOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SupervisorSettings::parse();

    toolgate::init_tracing(TracingOptions {
        name: "toolgate",
        level: settings.log_level.clone(),
        log_dir: toolgate::data_dir().join("logs"),
        stderr: true,
        status: None,
    })?;

    let worker_command = resolve_worker_command(settings.worker_command.as_deref())?;
    let config_dir = resolve_config_dir(settings.config_dir.as_deref());
    tracing::info!(
        worker = %worker_command.display(),
        config_dir = %config_dir.display(),
        port = settings.port,
        max_attempts = settings.max_attempts,
        "starting supervisor"
    );

    let (handle, task) = spawn_supervisor(
        SupervisorConfig::from_settings(&settings, config_dir),
        Arc::new(ProcessLauncher::new(worker_command)),
        Arc::new(HttpHealthChecker::new()?),
        Arc::new(TcpPortProbe),
    );

    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_line("status", &event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "status events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    handle.start().await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = toolgate::worker::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_command(&handle, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
        }
    }

    handle.stop().await?;
    drop(handle);
    let _ = task.await;
    tracing::info!("supervisor exited");
    Ok(())
}

/// Run one stdin command. Returns `false` when the supervisor should exit.
async fn handle_command(handle: &SupervisorHandle, command: &str) -> bool {
    let result = match command {
        "" => Ok(()),
        "status" => handle.snapshot().await.map(|s| print_line("snapshot", &s)),
        "logs" => handle.logs().await.map(|l| print_line("logs", &l)),
        "start" => handle.start().await,
        "restart" => handle.restart().await,
        "force-fix" => handle.force_fix().await,
        "stop" => handle.stop().await,
        "quit" | "exit" => return false,
        other => {
            print_line("error", &format!("unknown command '{other}'"));
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::error!(command, error = %e, "command failed");
        print_line("error", &e.to_string());
    }
    true
}

fn print_line<T: Serialize>(kind: &str, data: &T) {
    let line = serde_json::json!({ "type": kind, "data": data });
    println!("{line}");
}
