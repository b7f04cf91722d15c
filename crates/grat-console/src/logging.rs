use crate::config::ConsoleConfig;
use chrono::{DateTime, Utc};
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the per-run log file open and syncs it to disk when the console exits.
#[derive(Debug)]
pub struct LogGuard {
    run_log: Option<(PathBuf, Arc<File>)>,
}

impl LogGuard {
    pub fn path(&self) -> Option<&Path> {
        self.run_log.as_ref().map(|(path, _)| path.as_path())
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some((_, file)) = &self.run_log {
            let _ = file.sync_data();
        }
    }
}

/// Human-readable events go to stderr so stdout only carries command output.
/// Each invocation also gets its own plain-text file under the log dir.
pub fn init_logging(config: &ConsoleConfig, command: &str) -> LogGuard {
    let level = if config.debug {
        "debug".to_string()
    } else {
        std::env::var("GRAT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (run_log, open_error) = match open_run_log(&config.log_dir, command, Utc::now()) {
        Ok(run_log) => (run_log, None),
        Err(err) => (None, Some(err)),
    };
    let file_layer = run_log.as_ref().map(|(_, file)| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(file.clone())
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .is_ok();
    if let Some(err) = open_error {
        warn!(event = "log_file_unavailable", log_dir = %config.log_dir, error = %err);
    }
    let guard = LogGuard { run_log };
    if installed {
        if let Some(path) = guard.path() {
            debug!(event = "log_file_opened", command = command, path = %path.display());
        }
    }
    guard
}

fn run_log_name(command: &str, started: DateTime<Utc>) -> String {
    format!(
        "grat-{}-{command}-{}.log",
        started.format("%Y%m%dT%H%M%SZ"),
        std::process::id()
    )
}

/// A blank log dir disables the file; a dir that cannot be created is an error.
fn open_run_log(
    log_dir: &str,
    command: &str,
    started: DateTime<Utc>,
) -> io::Result<Option<(PathBuf, Arc<File>)>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(run_log_name(command, started));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Some((path, Arc::new(file))))
}
