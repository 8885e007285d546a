//! Command-line settings for the worker and the supervisor.
//!
//! Every flag can also be supplied through a `TOOLGATE_*` environment variable.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Default port the worker listens on.
pub const DEFAULT_PORT: u16 = 3001;

/// Default start attempts before the supervisor gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Settings for the `toolgate-worker` process.
#[derive(Parser, Debug, Clone)]
#[command(name = "toolgate-worker", version, about = "Tool provider gateway worker")]
pub struct WorkerSettings {
    /// Port to listen on (loopback only)
    #[arg(long, env = "TOOLGATE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory holding clients.json and tool_mappings.json
    #[arg(long, env = "TOOLGATE_CONFIG_DIR", default_value = "./config")]
    pub config_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "TOOLGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Identifier echoed by /health so the supervisor can tell its worker apart
    #[arg(long, env = "TOOLGATE_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Skip connecting enabled providers at startup
    #[arg(long)]
    pub no_autoconnect: bool,
}

/// Settings for the `toolgate` supervisor.
#[derive(Parser, Debug, Clone)]
#[command(name = "toolgate", version, about = "Supervised local gateway for tool providers")]
pub struct SupervisorSettings {
    /// Worker executable (defaults to a sibling toolgate-worker, then PATH)
    #[arg(long, env = "TOOLGATE_WORKER_COMMAND")]
    pub worker_command: Option<PathBuf>,

    /// Config directory handed to the worker
    #[arg(long, env = "TOOLGATE_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// First port to try for the worker
    #[arg(long, env = "TOOLGATE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Start attempts before giving up until force-fix
    #[arg(long, env = "TOOLGATE_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Log level for the supervisor and the worker
    #[arg(long, env = "TOOLGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Seconds to wait after spawning before the health check
    #[arg(long, default_value_t = 2)]
    pub grace_secs: u64,

    /// Seconds to wait before restarting a failed worker
    #[arg(long, default_value_t = 3)]
    pub restart_delay_secs: u64,
}

impl SupervisorSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

/// Normalize a log level name, falling back to `info` for anything unknown.
pub fn normalize_log_level(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}
