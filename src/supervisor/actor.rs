//! The supervisor actor.
//!
//! A single task owns all worker state and reacts to three inputs: commands
//! from [`SupervisorHandle`]s, events from the running worker (output lines,
//! exit), and its own timers (post-spawn grace period, restart delay).
//! Events from a worker the actor already replaced or killed carry a stale
//! generation and are ignored, so self-inflicted exits never trigger restarts.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::health::{HealthChecker, WorkerHealth};
use super::launcher::{LaunchSpec, LauncherEvent, WorkerEvent, WorkerHandle, WorkerLauncher};
use super::logs::{self, LogSnapshot, WorkerLogs, LOG_CAPACITY};
use super::ports::{select_port, PortProbe, PORT_SCAN_WINDOW};
use super::state::{StatusEvent, SupervisorSnapshot, WorkerStatus};
use crate::config::{SupervisorSettings, DEFAULT_MAX_ATTEMPTS, DEFAULT_PORT};
use crate::provider::GatewayError;
use crate::worker::{WorkerMessage, EXIT_PORT_IN_USE};

/// Capacity of the status event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub config_dir: PathBuf,
    pub base_port: u16,
    pub max_attempts: u32,
    pub log_level: String,
    pub grace_period: Duration,
    pub restart_delay: Duration,
    pub port_window: u16,
    pub log_capacity: usize,
}

impl SupervisorConfig {
    pub fn from_settings(settings: &SupervisorSettings, config_dir: PathBuf) -> Self {
        Self {
            config_dir,
            base_port: settings.port,
            max_attempts: settings.max_attempts.max(1),
            log_level: settings.log_level.clone(),
            grace_period: settings.grace_period(),
            restart_delay: settings.restart_delay(),
            ..Self::default()
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("./config"),
            base_port: DEFAULT_PORT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            log_level: "info".into(),
            grace_period: Duration::from_secs(2),
            restart_delay: Duration::from_secs(3),
            port_window: PORT_SCAN_WINDOW,
            log_capacity: LOG_CAPACITY,
        }
    }
}

// ─── Handle ──────────────────────────────────────────────────────────────────

enum Command {
    Start,
    Stop(oneshot::Sender<()>),
    Restart,
    ForceFix,
    Snapshot(oneshot::Sender<SupervisorSnapshot>),
    Logs(oneshot::Sender<LogSnapshot>),
}

/// Cloneable front door to the supervisor actor. The actor kills the worker
/// and exits once every handle is dropped.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<StatusEvent>,
}

impl SupervisorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub async fn start(&self) -> Result<(), GatewayError> {
        self.send(Command::Start).await
    }

    /// Kill the worker without restart. Resolves once the worker is gone.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stop(tx)).await?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn restart(&self) -> Result<(), GatewayError> {
        self.send(Command::Restart).await
    }

    /// Kill any stale worker, reset attempts and rejected ports, and start again.
    pub async fn force_fix(&self) -> Result<(), GatewayError> {
        self.send(Command::ForceFix).await
    }

    pub async fn snapshot(&self) -> Result<SupervisorSnapshot, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx)).await?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn logs(&self) -> Result<LogSnapshot, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Logs(tx)).await?;
        rx.await.map_err(|_| stopped())
    }

    async fn send(&self, command: Command) -> Result<(), GatewayError> {
        self.commands.send(command).await.map_err(|_| stopped())
    }
}

fn stopped() -> GatewayError {
    GatewayError::Internal {
        reason: "supervisor task has stopped".into(),
    }
}

/// Spawn the supervisor actor. The worker is not started until
/// [`SupervisorHandle::start`].
pub fn spawn_supervisor(
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    health: Arc<dyn HealthChecker>,
    probe: Arc<dyn PortProbe>,
) -> (SupervisorHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(32);
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let (worker_tx, worker_rx) = mpsc::unbounded_channel();
    let (health_tx, health_rx) = mpsc::unbounded_channel();

    let actor = Supervisor {
        next_port: config.base_port,
        logs: WorkerLogs::new(config.log_capacity),
        config,
        launcher,
        health,
        probe,
        status: WorkerStatus::Idle,
        port: None,
        attempts: 0,
        rejected_ports: BTreeSet::new(),
        worker: None,
        generation: 0,
        instance_id: uuid::Uuid::new_v4().to_string(),
        events: event_tx.clone(),
        worker_tx,
        health_tx,
        health_due: None,
        restart_due: None,
    };
    let task = tokio::spawn(actor.run(command_rx, worker_rx, health_rx));

    (
        SupervisorHandle {
            commands: command_tx,
            events: event_tx,
        },
        task,
    )
}

// ─── Actor ───────────────────────────────────────────────────────────────────

struct Supervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    health: Arc<dyn HealthChecker>,
    probe: Arc<dyn PortProbe>,

    status: WorkerStatus,
    port: Option<u16>,
    next_port: u16,
    attempts: u32,
    rejected_ports: BTreeSet<u16>,
    worker: Option<Box<dyn WorkerHandle>>,
    generation: u64,
    instance_id: String,
    logs: WorkerLogs,

    events: broadcast::Sender<StatusEvent>,
    worker_tx: mpsc::UnboundedSender<LauncherEvent>,
    health_tx: mpsc::UnboundedSender<HealthOutcome>,
    health_due: Option<Instant>,
    restart_due: Option<Instant>,
}

/// A finished health check, tagged with the launch it was made for.
struct HealthOutcome {
    generation: u64,
    port: u16,
    result: Result<WorkerHealth, GatewayError>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut worker_events: mpsc::UnboundedReceiver<LauncherEvent>,
        mut health_results: mpsc::UnboundedReceiver<HealthOutcome>,
    ) {
        loop {
            tokio::select! {
                biased;

                // Worker output queued before a command is handled first.
                Some(event) = worker_events.recv() => self.handle_worker_event(event),
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::info!("all supervisor handles dropped, shutting down");
                        self.kill_worker();
                        break;
                    }
                },
                Some(outcome) = health_results.recv() => self.finish_health_check(outcome),
                _ = wait_until(self.health_due) => {
                    self.health_due = None;
                    self.begin_health_check();
                }
                _ = wait_until(self.restart_due) => {
                    self.restart_due = None;
                    self.start();
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => match self.status {
                WorkerStatus::Idle | WorkerStatus::Stopped => self.start(),
                WorkerStatus::FailedPermanently => {
                    tracing::warn!("worker failed permanently, force-fix required");
                }
                status => tracing::debug!(?status, "start ignored, worker already active"),
            },
            Command::Stop(ack) => {
                self.cancel_timers();
                self.kill_worker();
                self.transition(WorkerStatus::Stopped, "worker stopped");
                let _ = ack.send(());
            }
            Command::Restart => {
                if self.status == WorkerStatus::FailedPermanently {
                    tracing::warn!("restart ignored, force-fix required");
                    return;
                }
                self.cancel_timers();
                self.kill_worker();
                self.start();
            }
            Command::ForceFix => {
                tracing::info!(
                    attempts = self.attempts,
                    rejected_ports = ?self.rejected_ports,
                    "force-fix: killing worker and resetting state"
                );
                self.cancel_timers();
                self.kill_worker();
                self.attempts = 0;
                self.rejected_ports.clear();
                self.next_port = self.config.base_port;
                self.start();
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Logs(reply) => {
                let _ = reply.send(self.logs.snapshot());
            }
        }
    }

    /// One spawn cycle: check the attempt bound, pick a port, launch, and
    /// schedule the health check.
    fn start(&mut self) {
        if self.attempts >= self.config.max_attempts {
            let err = GatewayError::StartupAttemptsExhausted {
                attempts: self.attempts,
            };
            tracing::error!(error = %err, "giving up on worker");
            self.kill_worker();
            self.transition(WorkerStatus::FailedPermanently, err.to_string());
            return;
        }

        self.attempts += 1;
        self.transition(WorkerStatus::Spawning, "spawning worker");

        let port = match select_port(
            self.probe.as_ref(),
            self.next_port,
            &mut self.rejected_ports,
            self.config.port_window,
        ) {
            Ok(port) => port,
            Err(e) => return self.fail_cycle(e),
        };
        self.port = Some(port);

        self.generation += 1;
        let spec = LaunchSpec {
            port,
            config_dir: self.config.config_dir.clone(),
            log_level: self.config.log_level.clone(),
            instance_id: self.instance_id.clone(),
        };
        match self
            .launcher
            .launch(&spec, self.generation, self.worker_tx.clone())
        {
            Ok(handle) => {
                self.worker = Some(handle);
                self.health_due = Some(Instant::now() + self.config.grace_period);
                self.transition(WorkerStatus::AwaitingHealthCheck, "waiting for worker health");
            }
            Err(e) => self.fail_cycle(e),
        }
    }

    /// Run the check off the actor task so commands are served meanwhile.
    fn begin_health_check(&mut self) {
        if self.status != WorkerStatus::AwaitingHealthCheck {
            return;
        }
        let Some(port) = self.port else {
            return;
        };

        let health = Arc::clone(&self.health);
        let results = self.health_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = health.check(port).await;
            let _ = results.send(HealthOutcome {
                generation,
                port,
                result,
            });
        });
    }

    fn finish_health_check(&mut self, outcome: HealthOutcome) {
        let HealthOutcome {
            generation,
            port,
            result,
        } = outcome;
        if generation != self.generation || self.status != WorkerStatus::AwaitingHealthCheck {
            tracing::debug!(generation, port, "ignoring health result for a replaced worker");
            return;
        }

        let result = result.and_then(|health| match health.instance_id {
            Some(id) if id != self.instance_id => Err(GatewayError::HealthCheckFailed {
                port,
                reason: format!("answered by another worker instance ({id})"),
            }),
            _ => Ok(()),
        });

        match result {
            Ok(()) => {
                self.attempts = 0;
                self.rejected_ports.clear();
                self.next_port = port;
                self.transition(WorkerStatus::Running, format!("worker healthy on port {port}"));
            }
            Err(e) => self.fail_cycle(e),
        }
    }

    fn handle_worker_event(&mut self, LauncherEvent { generation, event }: LauncherEvent) {
        let current = generation == self.generation && self.worker.is_some();

        match event {
            WorkerEvent::Stdout(line) => match self.logs.push_stdout(line) {
                Some(WorkerMessage::Ready { port, .. }) if current => {
                    if self.port != Some(port) {
                        tracing::info!(port, "worker reported a different port");
                    }
                    self.port = Some(port);
                }
                Some(WorkerMessage::Log { level, text, .. }) => logs::relay(&level, &text),
                _ => {}
            },
            WorkerEvent::Stderr(line) => {
                tracing::debug!(target: "toolgate::worker", stderr = %line);
                self.logs.push_stderr(line);
            }
            WorkerEvent::Exited(code) if current => self.handle_exit(code),
            WorkerEvent::Exited(code) => {
                tracing::debug!(?code, generation, "ignoring exit of a replaced worker");
            }
        }
    }

    fn handle_exit(&mut self, code: Option<i32>) {
        self.worker = None;

        match self.status {
            WorkerStatus::AwaitingHealthCheck => {
                self.health_due = None;
                if code == Some(EXIT_PORT_IN_USE) {
                    if let Some(port) = self.port {
                        self.rejected_ports.insert(port);
                        self.next_port = port.saturating_add(1);
                        return self.fail_cycle(GatewayError::PortInUse {
                            first: port,
                            last: port,
                        });
                    }
                }
                self.fail_cycle(GatewayError::HealthCheckFailed {
                    port: self.port.unwrap_or(self.next_port),
                    reason: format!("worker exited during startup (code {code:?})"),
                });
            }
            WorkerStatus::Running => match code {
                Some(code) if code != 0 => {
                    tracing::warn!(code, "worker crashed");
                    self.fail_cycle(GatewayError::ConnectionLost {
                        id: "worker".into(),
                        reason: format!("worker exited with code {code}"),
                    });
                }
                _ => {
                    tracing::info!(?code, "worker exited");
                    self.transition(WorkerStatus::Stopped, "worker exited");
                }
            },
            status => tracing::debug!(?status, ?code, "worker exit in passive state"),
        }
    }

    /// Kill the worker and schedule the next cycle.
    fn fail_cycle(&mut self, err: GatewayError) {
        tracing::warn!(
            error = %err,
            attempts = self.attempts,
            max_attempts = self.config.max_attempts,
            "worker start cycle failed"
        );
        self.kill_worker();
        self.health_due = None;
        self.restart_due = Some(Instant::now() + self.config.restart_delay);
        self.transition(WorkerStatus::Restarting, err.to_string());
    }

    fn kill_worker(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            tracing::info!(pid = ?worker.pid(), "killing worker");
            worker.kill();
        }
        // Anything the old worker still says is stale from here on.
        self.generation += 1;
    }

    fn cancel_timers(&mut self) {
        self.health_due = None;
        self.restart_due = None;
    }

    fn transition(&mut self, status: WorkerStatus, message: impl Into<String>) {
        let message = message.into();
        self.status = status;
        tracing::info!(
            status = ?status,
            port = ?self.port,
            attempts = self.attempts,
            "{message}"
        );

        if status.is_notable() {
            let _ = self.events.send(StatusEvent {
                status,
                port: self.port,
                attempts: self.attempts,
                message,
                timestamp: Utc::now(),
            });
        }
    }

    fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            status: self.status,
            port: self.port,
            attempts: self.attempts,
            max_attempts: self.config.max_attempts,
            rejected_ports: self.rejected_ports.iter().copied().collect(),
            pid: self.worker.as_ref().and_then(|w| w.pid()),
            instance_id: self.instance_id.clone(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
