use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

pub use tracing_appender::non_blocking::WorkerGuard;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("invalid log filter {filter:?}: {reason}")]
    Filter { filter: String, reason: String },

    #[error("cannot open log directory {dir}: {reason}")]
    Appender { dir: PathBuf, reason: String },

    #[error("global subscriber already installed")]
    AlreadyInitialized,
}

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Hourly,
    Daily,
    Never,
}

impl From<LogRotation> for rolling::Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => rolling::Rotation::HOURLY,
            LogRotation::Daily => rolling::Rotation::DAILY,
            LogRotation::Never => rolling::Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error). `RUST_LOG` wins.
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for log files. If None, no file logging.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Prefix for log file names.
    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    #[serde(default)]
    pub rotation: LogRotation,

    /// Whether to output JSON format.
    #[serde(default)]
    pub json_format: bool,

    /// Whether to also output to console (stdout).
    #[serde(default = "default_true")]
    pub console_output: bool,

    /// Include thread names, so the accept thread shows up as `rnode-accept`.
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_prefix() -> String {
    "rnode".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            log_dir: None,
            file_prefix: default_prefix(),
            rotation: LogRotation::default(),
            json_format: false,
            console_output: true,
            thread_names: true,
        }
    }
}

impl LogConfig {
    /// Build the level filter, preferring `RUST_LOG` over the configured level.
    pub fn env_filter(&self) -> Result<EnvFilter, LogError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).map_err(|e| LogError::Filter {
            filter: self.level.clone(),
            reason: e.to_string(),
        })
    }
}

/// Initialize the logging system. Should be called once at program startup.
/// Returns a guard that must be held alive for the duration of the program
/// (for the non-blocking file writer).
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, LogError> {
    let env_filter = config.env_filter()?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let console_layer: Option<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>> =
        if config.console_output {
            let layer = fmt::layer().with_thread_names(config.thread_names);
            if config.json_format {
                Some(Box::new(layer.json()))
            } else {
                Some(Box::new(layer))
            }
        } else {
            None
        };

    let (file_layer, guard): (
        Option<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>>,
        Option<WorkerGuard>,
    ) = if let Some(ref log_dir) = config.log_dir {
        let file_appender = rolling::RollingFileAppender::builder()
            .rotation(config.rotation.into())
            .filename_prefix(&config.file_prefix)
            .filename_suffix("log")
            .build(log_dir)
            .map_err(|e| LogError::Appender {
                dir: log_dir.clone(),
                reason: e.to_string(),
            })?;

        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let layer = fmt::layer()
            .with_ansi(false)
            .with_thread_names(config.thread_names)
            .with_writer(non_blocking);
        let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json_format {
            Box::new(layer.json())
        } else {
            Box::new(layer)
        };

        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    registry
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LogError::AlreadyInitialized)?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.file_prefix, "rnode");
        assert_eq!(config.rotation, LogRotation::Hourly);
        assert!(config.console_output);
        assert!(config.thread_names);
    }

    #[test]
    fn test_from_toml() {
        let config: LogConfig = toml::from_str(
            r#"
            level = "debug"
            rotation = "daily"
            json_format = true
            "#,
        )
        .unwrap();
        assert_eq!(config.level, "debug");
        assert_eq!(config.rotation, LogRotation::Daily);
        assert!(config.json_format);
        assert_eq!(config.file_prefix, "rnode");
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_unknown_rotation_rejected() {
        let result: Result<LogConfig, _> = toml::from_str(r#"rotation = "weekly""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_filter() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LogConfig {
            level: "rnode=loud".into(),
            ..LogConfig::default()
        };
        assert!(matches!(config.env_filter(), Err(LogError::Filter { .. })));
    }
}
