//! # Structured Logging
//!
//! Subscriber initialisation and severity-aware logging of collected errors.

use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use serde::{Serialize, Deserialize};
use tracing::{debug, error, info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::collector::ReducedError;
use crate::taxonomy::Severity;
use crate::types::{Error, Result};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Keeps the non-blocking file writer alive for the life of the process
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name for identification
    pub service_name: String,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Whether to include file and line information
    pub include_source_code: bool,
    /// Whether to also write to a daily rolling file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "error-pipeline".to_string(),
            json_format: true,
            include_source_code: false,
            file_output: false,
            log_dir: None,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.level.parse::<Level>().is_err() {
            return Err(Error::InvalidConfig(format!("unknown log level '{}'", self.level)));
        }
        if self.file_output && self.log_dir.is_none() {
            return Err(Error::InvalidConfig("logging.file_output requires logging.log_dir".into()));
        }
        Ok(())
    }
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();
    config.validate()?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", config.level)));

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_file(config.include_source_code)
            .with_line_number(config.include_source_code)
    });

    let text_layer = (!config.json_format).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(config.include_source_code)
            .with_line_number(config.include_source_code)
    });

    let file_layer = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(dir)) => {
            let appender = tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        }
        _ => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Init(format!("failed to set global subscriber: {}", e)))?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    info!(
        service = %config.service_name,
        level = %config.level,
        json = config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Log level used for errors of a given severity
pub fn severity_level(severity: Severity) -> Level {
    match severity {
        Severity::Critical | Severity::High => Level::ERROR,
        Severity::Medium => Level::WARN,
        Severity::Low => Level::INFO,
        Severity::Info => Level::DEBUG,
    }
}

/// Logs a collected error at the level given by [`severity_level`]
pub fn log_reduced_error(error: &ReducedError) {
    let workflow = error
        .context
        .as_ref()
        .and_then(|ctx| ctx.workflow_id.as_deref())
        .unwrap_or("-");
    let node = error
        .context
        .as_ref()
        .and_then(|ctx| ctx.node_id.as_deref())
        .unwrap_or("-");

    match error.severity {
        Severity::Critical | Severity::High => {
            error!(
                error_id = %error.id,
                severity = %error.severity,
                category = %error.category,
                error_type = %error.error_type,
                code = ?error.code,
                workflow = %workflow,
                node = %node,
                mode = %error.mode,
                strategy = %error.recovery_strategy,
                stack = ?error.stack_trace,
                related = ?error.related_error_ids,
                "{}", error.message
            );
        }
        Severity::Medium => {
            warn!(
                error_id = %error.id,
                severity = %error.severity,
                category = %error.category,
                error_type = %error.error_type,
                code = ?error.code,
                workflow = %workflow,
                node = %node,
                mode = %error.mode,
                "{}", error.message
            );
        }
        Severity::Low => {
            info!(
                error_id = %error.id,
                severity = %error.severity,
                category = %error.category,
                workflow = %workflow,
                "{}", error.message
            );
        }
        Severity::Info => {
            debug!(
                error_id = %error.id,
                severity = %error.severity,
                category = %error.category,
                "{}", error.message
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_levels() {
        assert_eq!(severity_level(Severity::Critical), Level::ERROR);
        assert_eq!(severity_level(Severity::High), Level::ERROR);
        assert_eq!(severity_level(Severity::Medium), Level::WARN);
        assert_eq!(severity_level(Severity::Low), Level::INFO);
        assert_eq!(severity_level(Severity::Info), Level::DEBUG);
    }

    #[test]
    fn test_config_validation() {
        assert!(LoggingConfig::default().validate().is_ok());

        let config = LoggingConfig { level: "loud".into(), ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = LoggingConfig { file_output: true, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig { json_format: false, level: "debug".into(), ..Default::default() };
        // Another test harness may already own the global subscriber
        let first = init_logging(Some(config.clone()));
        if first.is_ok() {
            assert!(init_logging(Some(config)).is_ok());
        }
    }
}
