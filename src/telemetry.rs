//! Tracing setup: stdout and rolling-file layers with retention pruning.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};
use crate::paths;

const LOG_FILE_PREFIX: &str = "packmaint.log";

#[derive(Clone)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: LoggingConfig) -> Self {
        Self { verbosity, logging }
    }
}

pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(config.verbosity).into())
        .with_env_var("PM_LOG")
        .from_env_lossy();

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.logging.stdout {
        layers.push(build_stdout_layer(config.logging.stdout_format));
    }

    let mut file_setup_error = None;
    if config.logging.file.enabled {
        let dir = resolve_log_dir(&config.logging.file);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                if let Err(err) = prune_logs(&dir, LOG_FILE_PREFIX, &config.logging.file) {
                    file_setup_error = Some(format!("log retention failed: {err}"));
                }
                let (layer, guard) = build_file_layer(&config.logging.file, &dir);
                layers.push(layer);
                guards.push(guard);
            }
            Err(err) => {
                file_setup_error =
                    Some(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }

    layers.push(Box::new(filter));
    Registry::default().with(layers).init();

    if let Some(error) = file_setup_error {
        tracing::warn!("{error}");
    }

    TelemetryGuard { _guards: guards }
}

fn build_stdout_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Tree => Box::new(tracing_tree::HierarchicalLayer::new(2)),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true),
        ),
    }
}

fn build_file_layer(
    config: &FileLoggingConfig,
    dir: &Path,
) -> (
    Box<dyn Layer<Registry> + Send + Sync>,
    tracing_appender::non_blocking::WorkerGuard,
) {
    let rotation = match config.rotation {
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Minutely => tracing_appender::rolling::Rotation::MINUTELY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    };
    let appender =
        tracing_appender::rolling::RollingFileAppender::new(rotation, dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Tree => Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_ansi(false)
                .with_writer(writer),
        ),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_current_span(true),
        ),
    };
    (layer, guard)
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}

fn resolve_log_dir(config: &FileLoggingConfig) -> PathBuf {
    config.dir.clone().unwrap_or_else(paths::log_dir)
}

/// Remove rotated log files that exceed the retention limits (age first,
/// then count, oldest out).
fn prune_logs(dir: &Path, prefix: &str, config: &FileLoggingConfig) -> std::io::Result<usize> {
    let max_age = config
        .retention_max_age_days
        .map(|days| Duration::from_secs(days.saturating_mul(24 * 60 * 60)));
    if max_age.is_none() && config.retention_max_files.is_none() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        entries.push((path, meta.modified().unwrap_or(now)));
    }

    let to_remove = select_prunable(&mut entries, max_age, config.retention_max_files, now);
    let mut removed = 0usize;
    for path in to_remove {
        if fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn select_prunable(
    entries: &mut Vec<(PathBuf, SystemTime)>,
    max_age: Option<Duration>,
    max_files: Option<usize>,
    now: SystemTime,
) -> Vec<PathBuf> {
    let mut removed = Vec::new();

    if let Some(max_age) = max_age {
        entries.retain(|(path, modified)| {
            let age = now.duration_since(*modified).unwrap_or(Duration::ZERO);
            if age > max_age {
                removed.push(path.clone());
                false
            } else {
                true
            }
        });
    }

    if let Some(max_files) = max_files
        && entries.len() > max_files
    {
        entries.sort_by_key(|(_, modified)| *modified);
        let excess = entries.len() - max_files;
        for (path, _) in entries.drain(..excess) {
            removed.push(path);
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_prunable_respects_age_and_count() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        let mut entries = vec![
            (PathBuf::from("old.log"), now - Duration::from_secs(9_000)),
            (PathBuf::from("mid.log"), now - Duration::from_secs(500)),
            (PathBuf::from("new.log"), now - Duration::from_secs(40)),
            (PathBuf::from("newest.log"), now - Duration::from_secs(5)),
        ];

        let removed = select_prunable(
            &mut entries,
            Some(Duration::from_secs(1_000)),
            Some(2),
            now,
        );

        assert!(removed.contains(&PathBuf::from("old.log")));
        assert!(removed.contains(&PathBuf::from("mid.log")));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn no_limits_means_no_pruning() {
        let now = SystemTime::now();
        let mut entries = vec![(PathBuf::from("a.log"), now)];
        let removed = select_prunable(&mut entries, None, None, now);
        assert!(removed.is_empty());
        assert_eq!(entries.len(), 1);
    }
}
