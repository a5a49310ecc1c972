//! # Pipeline Configuration
//!
//! Layered settings for every component. Sources, lowest precedence first:
//! built-in defaults, an optional TOML/JSON/YAML file, then environment
//! variables prefixed with `ERROR_PIPELINE_` using `__` between path
//! segments (for example `ERROR_PIPELINE_COLLECTOR__INITIAL_MODE=reduced`).

use std::path::Path;

use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::classifier::ClassifierConfig;
use crate::collector::CollectorConfig;
use crate::logging::LoggingConfig;
use crate::performance::MonitorConfig;
use crate::recovery::RecoveryConfig;
use crate::types::Result;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ERROR_PIPELINE";

/// Settings for the whole pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub logging: LoggingConfig,
    pub classifier: ClassifierConfig,
    pub monitor: MonitorConfig,
    pub collector: CollectorConfig,
    pub recovery: RecoveryConfig,
}

impl PipelineConfig {
    /// Loads `.env`, then environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::load(None::<&Path>)
    }

    /// Loads an optional file and environment variables over the defaults
    pub fn load<P: AsRef<Path>>(file: Option<P>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            let path = path.as_ref();
            debug!(path = %path.display(), "Loading pipeline configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: PipelineConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validates every section
    pub fn validate(&self) -> Result<()> {
        self.logging.validate()?;
        self.classifier.validate()?;
        self.monitor.validate()?;
        self.collector.mode_table()?;
        self.recovery.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectionMode;
    use crate::types::Error;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.collector.initial_mode, CollectionMode::Full);
        assert_eq!(config.recovery.plan_ttl_secs, 1800);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("error-pipeline-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[classifier]
max_history = 50

[collector]
initial_mode = "reduced"

[recovery]
plan_ttl_secs = 60
"#
        )
        .unwrap();

        let config = PipelineConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.classifier.max_history, 50);
        assert_eq!(config.collector.initial_mode, CollectionMode::Reduced);
        assert_eq!(config.recovery.plan_ttl_secs, 60);
        assert_eq!(config.recovery.max_alternatives, 3);
    }

    #[test]
    fn test_invalid_file_values_are_rejected() {
        let path = std::env::temp_dir().join(format!("error-pipeline-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[recovery]\nplan_ttl_secs = 0\n").unwrap();

        let result = PipelineConfig::load(Some(&path));
        std::fs::remove_file(&path).ok();

        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = PipelineConfig::load(Some("/nonexistent/error-pipeline.toml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
