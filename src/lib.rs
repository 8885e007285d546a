pub mod config;
pub mod provider;
pub mod supervisor;
pub mod worker;

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use worker::{StatusChannel, StatusChannelLayer};

/// Return the platform-standard data directory for toolgate.
///
/// - macOS: `~/Library/Application Support/toolgate/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolgate\`
/// - Linux: `$XDG_DATA_HOME/toolgate/` (fallback `~/.local/share/toolgate/`)
///
/// Falls back to `~/.toolgate/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolgate");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolgate")
}

/// Where and how a process writes its logs.
pub struct TracingOptions {
    /// Log file stem, e.g. `toolgate-worker` → `toolgate-worker.log`.
    pub name: &'static str,
    pub level: String,
    pub log_dir: PathBuf,
    /// Also write human-readable logs to stderr.
    pub stderr: bool,
    /// Mirror every event onto the worker status channel.
    pub status: Option<StatusChannel>,
}

/// Initialize the tracing subscriber.
///
/// On each startup:
/// 1. Rotates existing logs (`<name>.log` → `.1` → `.2` → `.3`, keeps last 3).
/// 2. Opens a fresh log file with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log path for discoverability.
///
/// `RUST_LOG` overrides the configured level.
pub fn init_tracing(options: TracingOptions) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(&options.log_dir)
        .with_context(|| format!("failed to create log dir {}", options.log_dir.display()))?;

    let log_path = options.log_dir.join(format!("{}.log", options.name));
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let level = config::normalize_log_level(&options.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,toolgate={level},toolgate_worker={level},tower_http={level}"
        ))
    });

    let file_layer = fmt::layer()
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let stderr_layer = options
        .stderr
        .then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    let status_layer = options.status.map(StatusChannelLayer::new);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .with(status_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        process = options.name,
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== toolgate starting ==="
    );

    Ok(log_path)
}

/// Rotate log files: `x.log` → `x.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Without explicit flushing, log entries may sit in OS buffers and be lost
/// when the supervisor kills the worker.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
