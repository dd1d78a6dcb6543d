//! Logging setup for the probe.
//!
//! Console output always goes to stderr so stdout stays clean JSON. When a
//! log directory is configured, a daily rolling file is written as well and
//! files older than the retention period are removed at startup.

use std::fs;
use std::io;
use std::path::Path;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_NAME: &str = "tvheadend-probe.log";

/// Logging settings after merging file and command line.
#[derive(Debug, Clone)]
pub struct LogSettings<'a> {
    pub level: &'a str,
    pub log_dir: Option<&'a Path>,
    pub retention_days: u64,
}

/// Install the global subscriber and bridge `log` records into it.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the program.
pub fn init_logging(
    settings: &LogSettings<'_>,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(settings.level));

    let console = fmt::layer()
        .with_writer(io::stderr)
        .with_target(true)
        .with_level(true)
        .with_timer(LocalTimeTimer);

    let (file, guard) = match settings.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            clean_old_logs(dir, settings.retention_days)?;

            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_timer(LocalTimeTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to set default subscriber: {}", e))?;
    tracing_log::LogTracer::init().map_err(|e| format!("Failed to initialize LogTracer: {}", e))?;

    Ok(guard)
}

/// Remove probe log files last modified before the retention cutoff.
fn clean_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<()> {
    let cutoff = Local::now() - chrono::Duration::days(retention_days as i64);

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_probe_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_NAME));
        if !path.is_file() || !is_probe_log {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => chrono::DateTime::<Local>::from(modified),
            Err(_) => continue,
        };
        if modified < cutoff {
            if let Err(e) = fs::remove_file(&path) {
                eprintln!("Failed to remove old log file {:?}: {}", path, e);
            }
        }
    }

    Ok(())
}

/// Local time stamps for log lines.
#[derive(Debug, Clone, Copy)]
struct LocalTimeTimer;

impl fmt::time::FormatTime for LocalTimeTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}
