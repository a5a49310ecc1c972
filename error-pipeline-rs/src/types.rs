//! # Pipeline Error Types
//!
//! Failures raised by the pipeline itself. Faults that the pipeline
//! *handles* are modelled by [`crate::context::Fault`] and
//! [`crate::classifier::ClassifiedError`]; this module only covers the
//! cases where an operation on the pipeline cannot be honoured.

use thiserror::Error;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by pipeline operations
#[derive(Debug, Error)]
pub enum Error {
    /// An entity with the same identifier is already registered
    #[error("{kind} '{id}' already exists")]
    Conflict {
        /// What kind of entity clashed (rule, strategy)
        kind: &'static str,
        /// The duplicated identifier
        id: String,
    },

    /// The referenced entity does not exist
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// What kind of entity was looked up (plan, action)
        kind: &'static str,
        /// The identifier that was not found
        id: String,
    },

    /// Every candidate recovery action was filtered out
    #[error("no feasible recovery action for error {error_id}")]
    NoFeasibleAction {
        /// Id of the classified error the plan was requested for
        error_id: String,
    },

    /// A recovery plan was used after its expiry time
    #[error("recovery plan '{plan_id}' expired at {expired_at}")]
    PlanExpired {
        /// The expired plan
        plan_id: String,
        /// When it expired
        expired_at: chrono::DateTime<chrono::Utc>,
    },

    /// A classification predicate could not be evaluated
    #[error("rule predicate failed: {0}")]
    Predicate(String),

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The external sink refused or failed to accept errors
    #[error("sink failure: {0}")]
    Sink(String),

    /// A recovery action handler reported a failure
    #[error("recovery action failed: {0}")]
    Action(String),

    /// Global initialisation (such as installing the subscriber) failed
    #[error("initialization failed: {0}")]
    Init(String),

    /// The component has been shut down
    #[error("{0} has been shut down")]
    ShutDown(&'static str),

    /// Loading layered configuration failed
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Rule (de)serialisation failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a [`Error::Conflict`]
    pub fn conflict<S: Into<String>>(kind: &'static str, id: S) -> Self {
        Error::Conflict { kind, id: id.into() }
    }

    /// Shorthand for a [`Error::NotFound`]
    pub fn not_found<S: Into<String>>(kind: &'static str, id: S) -> Self {
        Error::NotFound { kind, id: id.into() }
    }

    /// Returns true for failures caused by caller input rather than the pipeline
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. } | Error::NotFound { .. } | Error::PlanExpired { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::conflict("rule", "network-error");
        assert_eq!(err.to_string(), "rule 'network-error' already exists");

        let err = Error::NoFeasibleAction { error_id: "abc".to_string() };
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_caller_errors() {
        assert!(Error::not_found("plan", "p-1").is_caller_error());
        assert!(!Error::Sink("closed".into()).is_caller_error());
        assert!(!Error::ShutDown("collector").is_caller_error());
    }
}
