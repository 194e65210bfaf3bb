use crate::config::LoggingConfig;
use crate::error::HaError;
use crate::task::TaskGroup;
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// Set once a subscriber has been installed successfully
static INSTALLED: Mutex<bool> = parking_lot::const_mutex(false);
const LOG_CLEANUP_INTERVAL: Duration = Duration::from_secs(86400);

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global tracing subscriber. Once a call has succeeded, later
/// calls do nothing; a failed call can be retried.
///
/// The returned group runs log file cleanup and must be shut down with the
/// rest of the process.
pub fn init(config: &LoggingConfig) -> Result<TaskGroup, HaError> {
    let maintenance = TaskGroup::new("logging");
    let mut installed = INSTALLED.lock();
    if *installed {
        return Ok(maintenance);
    }

    install(config)?;
    *installed = true;

    if let Some(dir) = config.directory.clone() {
        let max_files = config.max_files;
        if tokio::runtime::Handle::try_current().is_ok() {
            maintenance.spawn_loop(
                "log-cleanup",
                LOG_CLEANUP_INTERVAL,
                LOG_CLEANUP_INTERVAL,
                move || {
                    let dir = dir.clone();
                    async move {
                        cleanup_old_logs(&dir, max_files);
                        Ok(())
                    }
                },
            );
        } else {
            cleanup_old_logs(&dir, max_files);
        }
    }

    Ok(maintenance)
}

fn install(config: &LoggingConfig) -> Result<(), HaError> {
    let console = if config.json {
        fmt::Layer::new()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(env_filter(&config.level))
            .boxed()
    } else {
        fmt::Layer::new()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(true)
            .with_filter(env_filter(&config.level))
            .boxed()
    };

    let file = match &config.directory {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("ha-node")
                .filename_suffix("log")
                .build(dir)
                .map_err(|e| HaError::config(format!("Failed to create log appender: {}", e)))?;

            Some(
                fmt::Layer::new()
                    .json()
                    .with_writer(appender)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(env_filter(&config.level))
                    .boxed(),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry().with(console).with(file);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| HaError::config(format!("Failed to set tracing subscriber: {}", e)))
}

/// Keep only the newest `max_files` `.log` files in `log_dir`.
pub fn cleanup_old_logs(log_dir: &Path, max_files: usize) {
    if let Ok(entries) = fs::read_dir(log_dir) {
        let mut log_files: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .map(|ext| ext == "log")
                    .unwrap_or(false)
            })
            .collect();

        // Newest first
        log_files.sort_by_key(|entry| {
            std::cmp::Reverse(
                entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            )
        });

        for old_file in log_files.iter().skip(max_files) {
            let _ = fs::remove_file(old_file.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cleanup_keeps_newest() {
        let dir = tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("ha-node.{}.log", i)), "x").unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        cleanup_old_logs(dir.path(), 2);

        let remaining: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.contains(&"notes.txt".to_string()));
        assert!(remaining.contains(&"ha-node.4.log".to_string()));
        assert!(remaining.contains(&"ha-node.3.log".to_string()));
    }

    #[tokio::test]
    async fn test_failed_init_can_be_retried() {
        let blocker = tempdir().unwrap();
        let file = blocker.path().join("not-a-dir");
        fs::write(&file, "x").unwrap();

        let config = LoggingConfig {
            directory: Some(file.join("logs")),
            ..LoggingConfig::default()
        };
        assert!(init(&config).is_err());
        assert!(!*INSTALLED.lock());

        let dir = tempdir().unwrap();
        let config = LoggingConfig {
            directory: Some(dir.path().to_path_buf()),
            ..LoggingConfig::default()
        };
        let maintenance = init(&config).unwrap();
        assert!(*INSTALLED.lock());
        maintenance.shutdown().await;
        assert!(maintenance.is_cancelled());

        // Already installed
        init(&LoggingConfig::default()).unwrap().shutdown().await;
    }
}
