pub mod process;

use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};
use vmfleet_shared::errors::FleetResult;

/// Orchestrator log file name inside `logs/`.
pub const LOG_FILE: &str = "vmfleet.log";

/// Find an executable by name in `PATH`.
///
/// Names containing a path separator are checked as-is.
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    if binary.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(binary);
        return is_executable(&path).then_some(path);
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Run an external tool to completion, capturing its output.
///
/// Returns a human-readable reason on spawn failure or non-zero exit, with
/// the tool's stderr attached so the caller can put it in an instance error.
pub async fn run_tool(cmd: &mut Command) -> Result<Output, String> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    tracing::debug!(command = ?cmd.as_std(), "Running tool");

    let output = cmd
        .output()
        .await
        .map_err(|e| format!("failed to run {program}: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        ));
    }
    Ok(output)
}

/// Log to `<logs_dir>/vmfleet.log`, plus warnings (or everything with
/// `verbose`) on stderr.
///
/// The returned guard must be held until exit so buffered lines are flushed.
pub fn init_logging(logs_dir: &Path, verbose: bool) -> FleetResult<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;
    let appender = tracing_appender::rolling::never(logs_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let default = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    register_to_tracing(Some(non_blocking), env_filter, stderr_level(verbose));
    Ok(guard)
}

/// Log to stderr only. Used when the run must not touch the workdir.
pub fn init_stderr_logging(verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    register_to_tracing(None, env_filter, stderr_level(verbose));
}

fn stderr_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    }
}

pub fn register_to_tracing(
    file: Option<NonBlocking>,
    env_filter: EnvFilter,
    stderr_level: LevelFilter,
) {
    let file_layer = file.map(|writer| {
        fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(false)
    });

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(stderr_level);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init();
}
