//! Spawning the worker process and relaying its output.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::provider::GatewayError;

/// Arguments for one worker launch.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub port: u16,
    pub config_dir: PathBuf,
    pub log_level: String,
    pub instance_id: String,
}

/// Something the worker did.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Stdout(String),
    Stderr(String),
    /// The process ended. `None` when it was killed by a signal.
    Exited(Option<i32>),
}

/// A [`WorkerEvent`] tagged with the launch it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct LauncherEvent {
    pub generation: u64,
    pub event: WorkerEvent,
}

/// A running worker. Dropping the handle kills the process.
pub trait WorkerHandle: Send {
    fn pid(&self) -> Option<u32>;
    fn kill(&mut self);
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(
        &self,
        spec: &LaunchSpec,
        generation: u64,
        events: mpsc::UnboundedSender<LauncherEvent>,
    ) -> Result<Box<dyn WorkerHandle>, GatewayError>;
}

// ─── Process launcher ────────────────────────────────────────────────────────

/// How long to wait for buffered output after the worker exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ProcessLauncher {
    command: PathBuf,
}

impl ProcessLauncher {
    pub fn new(command: PathBuf) -> Self {
        Self { command }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        spec: &LaunchSpec,
        generation: u64,
        events: mpsc::UnboundedSender<LauncherEvent>,
    ) -> Result<Box<dyn WorkerHandle>, GatewayError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--port")
            .arg(spec.port.to_string())
            .arg("--config-dir")
            .arg(&spec.config_dir)
            .arg("--log-level")
            .arg(&spec.log_level)
            .arg("--instance-id")
            .arg(&spec.instance_id);

        // Windows: prevent console window from appearing for the worker
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| GatewayError::SpawnFailed {
            id: "worker".into(),
            reason: format!("{}: {e}", self.command.display()),
        })?;
        let pid = child.id();

        tracing::info!(
            pid = ?pid,
            port = spec.port,
            command = %self.command.display(),
            "worker spawned"
        );

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(
                stdout,
                generation,
                events.clone(),
                WorkerEvent::Stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(
                stderr,
                generation,
                events.clone(),
                WorkerEvent::Stderr,
            )));
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            // A dropped sender counts as a kill request.
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let code = match exited {
                Some(status) => status.ok().and_then(|s| s.code()),
                None => {
                    let _ = child.kill().await;
                    None
                }
            };
            // Deliver the tail of the output before the exit.
            for reader in readers {
                let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
            }
            let _ = events.send(LauncherEvent {
                generation,
                event: WorkerEvent::Exited(code),
            });
        });

        Ok(Box::new(ProcessHandle {
            pid,
            kill: Some(kill_tx),
        }))
    }
}

struct ProcessHandle {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

async fn forward_lines<R>(
    reader: R,
    generation: u64,
    events: mpsc::UnboundedSender<LauncherEvent>,
    wrap: fn(String) -> WorkerEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let event = LauncherEvent {
            generation,
            event: wrap(line),
        };
        if events.send(event).is_err() {
            break;
        }
    }
}
