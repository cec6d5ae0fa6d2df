use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// What log levels are supported?
/// Higher-value variants are more severe.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl LogLevel {
    /// `EnvFilter` directive for this level. `tracing` has no critical level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = std::convert::Infallible;

    /// Unknown names fall back to `info`.
    fn from_str(level: &str) -> Result<Self, Self::Err> {
        Ok(match level.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "critical" => LogLevel::Critical,
            _ => LogLevel::Info,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    pub log_level: LogLevel,
    /// When set, text logs and call events are also written below this directory.
    pub log_dir: Option<PathBuf>,
    pub log_file: String,
    pub event_file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            log_file: "pubsub-rpc.log".to_string(),
            event_file: "calls.json".to_string(),
        }
    }
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>) -> Self {
        Self {
            log_level,
            log_dir,
            ..Self::default()
        }
    }
}

/// Installs the global subscriber: stdout, plus a daily rolling text log and
/// a JSON file of `request` events when a log directory is configured.
///
/// `RUST_LOG` wins over the configured level. The returned guard must be kept
/// alive for the file writer to flush. Calling this twice is harmless; the
/// second call leaves the first subscriber in place.
pub fn init_tracing(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let (subscriber, guard) = build_subscriber(config)?;
    let _ = subscriber.try_init();
    Ok(guard)
}

/// The level filter sits on the stdout and text layers only. The event file
/// has its own `request=info` filter so call events are kept at any level.
fn build_subscriber(config: &LogConfig) -> Result<(impl Subscriber + Send + Sync + 'static, Option<WorkerGuard>)> {
    let level_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()))
    };

    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .with_filter(level_filter());

    let (file_layers, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create log directory {}", dir.display()))?;

            let txt_appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.log_file);
            let (txt_writer, guard) = tracing_appender::non_blocking(txt_appender);
            let txt_layer = fmt::layer()
                .with_writer(txt_writer)
                .with_ansi(false)
                .with_filter(level_filter());

            let json_appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.event_file);
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_appender)
                .with_target(true)
                .with_filter(EnvFilter::new("request=info"));

            (Some(txt_layer.and_then(json_layer)), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layers);
    Ok((subscriber, guard))
}
