//! Locating the worker binary and the config directory.

use std::path::{Path, PathBuf};

use crate::provider::GatewayError;

/// Name of the worker executable.
pub const WORKER_BINARY: &str = "toolgate-worker";

/// Resolve the worker executable.
///
/// 1. An explicit `--worker-command`.
/// 2. A `toolgate-worker` next to the supervisor executable.
/// 3. `toolgate-worker` on `PATH`.
pub fn resolve_worker_command(explicit: Option<&Path>) -> Result<PathBuf, GatewayError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    let binary = format!("{WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX);
    if let Ok(exe) = std::env::current_exe() {
        if let Some(sibling) = exe.parent().map(|dir| dir.join(&binary)) {
            if sibling.is_file() {
                return Ok(sibling);
            }
        }
    }

    which::which(WORKER_BINARY).map_err(|e| GatewayError::SpawnFailed {
        id: WORKER_BINARY.to_string(),
        reason: format!("worker binary not found next to the supervisor or on PATH: {e}"),
    })
}

/// Resolve the config directory handed to the worker.
///
/// Dev trees (`./config`, `../config`) win, then packaged layouts relative to
/// the executable, then `<data_dir>/config`, which is created.
pub fn resolve_config_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_default();
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));

    if let Some(found) = first_existing(&config_candidates(&cwd, exe_dir.as_deref())) {
        return found;
    }

    let fallback = crate::data_dir().join("config");
    if let Err(e) = std::fs::create_dir_all(&fallback) {
        tracing::warn!(error = %e, dir = %fallback.display(), "failed to create config dir");
    }
    fallback
}

/// Candidate config directories in priority order.
fn config_candidates(cwd: &Path, exe_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = vec![cwd.join("config"), cwd.join("..").join("config")];
    if let Some(exe_dir) = exe_dir {
        // macOS .app bundle: Resources/ is a sibling of MacOS/
        candidates.push(exe_dir.join("../Resources/config"));
        candidates.push(exe_dir.join("resources/config"));
    }
    candidates
}

fn first_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates
        .iter()
        .find(|dir| dir.is_dir())
        .map(|dir| dir.canonicalize().unwrap_or_else(|_| dir.clone()))
}
