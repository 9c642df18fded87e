//! Tracing initialisation.
//!
//! The supervisor writes two of the four log files itself: the deployment log
//! (everything except keep-alive traffic) and the keep-alive log. The serving
//! and tunnel logs are written by the child processes.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{
    filter::{filter_fn, Targets},
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Target used by every keep-alive event so it can be routed to its own file.
pub const KEEPALIVE_TARGET: &str = "serve_tunnel::keepalive";

pub const DEPLOY_LOG: &str = "deploy.log";
pub const KEEPALIVE_LOG: &str = "keepalive.log";

/// Paths of the log files owned by the supervisor.
#[derive(Debug, Clone)]
pub struct LogFiles {
    pub deploy: PathBuf,
    pub keep_alive: PathBuf,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("serve_tunnel=info"))
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

/// Build the stderr and file layers for `log_dir` without installing them.
fn build_subscriber(
    log_dir: &Path,
) -> Result<(impl tracing::Subscriber + Send + Sync + 'static, LogFiles)> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let files = LogFiles {
        deploy: log_dir.join(DEPLOY_LOG),
        keep_alive: log_dir.join(KEEPALIVE_LOG),
    };
    let deploy = Arc::new(open_append(&files.deploy)?);
    let keep_alive = Arc::new(open_append(&files.keep_alive)?);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let deploy_layer = fmt::layer()
        .with_writer(deploy)
        .with_ansi(false)
        .with_target(true)
        .with_span_events(FmtSpan::NONE)
        .with_filter(filter_fn(|meta| meta.target() != KEEPALIVE_TARGET));

    let keep_alive_layer = fmt::layer()
        .with_writer(keep_alive)
        .with_ansi(false)
        .with_target(false)
        .with_filter(Targets::new().with_target(KEEPALIVE_TARGET, tracing::Level::TRACE));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(deploy_layer)
        .with(keep_alive_layer);

    Ok((subscriber, files))
}

/// Initialise stderr plus file logging under `log_dir`.
pub fn init_logging(log_dir: &Path) -> Result<LogFiles> {
    let (subscriber, files) = build_subscriber(log_dir)?;
    subscriber
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(files)
}

/// Initialise stderr-only logging, used before a log directory is known.
pub fn init_stderr_logging() {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .try_init()
        .ok();
}

#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("serve_tunnel=debug"));
        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_records_are_routed_to_their_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let (subscriber, files) = build_subscriber(&dir.path().join("logs")).unwrap();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: KEEPALIVE_TARGET, "keep-alive request succeeded marker-ka");
            tracing::info!("serving process ready marker-deploy");
        });

        let deploy = std::fs::read_to_string(&files.deploy).unwrap();
        let keep_alive = std::fs::read_to_string(&files.keep_alive).unwrap();
        assert!(deploy.contains("marker-deploy"), "{deploy}");
        assert!(!deploy.contains("marker-ka"), "{deploy}");
        assert!(keep_alive.contains("marker-ka"), "{keep_alive}");
        assert!(!keep_alive.contains("marker-deploy"), "{keep_alive}");
    }

    #[test]
    fn log_files_are_appended_to() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(log_dir.join(DEPLOY_LOG), "previous run\n").unwrap();

        let (subscriber, files) = build_subscriber(&log_dir).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("second run marker");
        });

        let deploy = std::fs::read_to_string(&files.deploy).unwrap();
        assert!(deploy.starts_with("previous run\n"));
        assert!(deploy.contains("second run marker"));
    }
}
