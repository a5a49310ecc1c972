//! # Error Taxonomy
//!
//! The domain taxonomy attached to every classified fault: a severity,
//! a category and a type, plus the recovery strategy a rule recommends.

use std::fmt;
use serde::{Serialize, Deserialize};

/// The severity level of a classified error.
///
/// Variants are declared from least to most severe so the derived `Ord`
/// gives the total order used by severity thresholds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, not an actual failure
    Info,
    /// A minor issue that doesn't affect overall functionality
    Low,
    /// A significant issue that may impact some functionality
    #[default]
    Medium,
    /// A serious issue blocking the current operation
    High,
    /// A failure that needs immediate attention
    Critical,
}

impl Severity {
    /// All severities, least severe first
    pub const ALL: [Severity; 5] = [
        Severity::Info,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    /// Stable lowercase label used in metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Broad area a fault belongs to, used for routing and filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Connectivity between services
    Network,
    /// Credentials, tokens and permissions
    Authentication,
    /// Throttling by a remote service
    RateLimit,
    /// An operation exceeded its deadline
    Timeout,
    /// Failures of an AI/LLM provider
    AiService,
    /// Producing or validating a workflow definition
    WorkflowGeneration,
    /// A workflow node failed at run time
    NodeExecution,
    /// Input rejected by validation
    Validation,
    /// Parsing or transforming data
    DataProcessing,
    /// Missing or malformed configuration
    Configuration,
    /// Memory, disk or quota exhaustion
    Resource,
    /// Anything not covered above
    System,
}

impl ErrorCategory {
    /// Stable label used in metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Authentication => "AUTHENTICATION",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::AiService => "AI_SERVICE",
            ErrorCategory::WorkflowGeneration => "WORKFLOW_GENERATION",
            ErrorCategory::NodeExecution => "NODE_EXECUTION",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::DataProcessing => "DATA_PROCESSING",
            ErrorCategory::Configuration => "CONFIGURATION",
            ErrorCategory::Resource => "RESOURCE",
            ErrorCategory::System => "SYSTEM",
        }
    }

    /// Generic user-facing text for errors of this category
    pub fn default_user_message(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "A network problem interrupted the operation. Please check your connection and try again.",
            ErrorCategory::Authentication => "Authentication failed. Please check your credentials and try again.",
            ErrorCategory::RateLimit => "Too many requests. Please wait a moment before trying again.",
            ErrorCategory::Timeout => "The operation took too long to complete. Please try again.",
            ErrorCategory::AiService => "The AI service is currently unavailable. Please try again shortly.",
            ErrorCategory::WorkflowGeneration => "The workflow could not be generated. Please review its structure.",
            ErrorCategory::NodeExecution => "A step in your workflow failed to run.",
            ErrorCategory::Validation => "The provided data is invalid. Please check your input and try again.",
            ErrorCategory::DataProcessing => "The data could not be processed.",
            ErrorCategory::Configuration => "The system is not configured correctly.",
            ErrorCategory::Resource => "The system is running low on resources. Please try again later.",
            ErrorCategory::System => "An unexpected error occurred. Please try again or contact support.",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The specific kind of fault within a category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    ConnectionRefused,
    ConnectionReset,
    DnsResolution,
    InvalidCredentials,
    TokenExpired,
    PermissionDenied,
    RateLimitExceeded,
    QuotaExceeded,
    RequestTimeout,
    ModelUnavailable,
    ContextLengthExceeded,
    InvalidStructure,
    MissingNode,
    InvalidConnection,
    NodeFailure,
    InvalidInput,
    ParseFailure,
    MissingConfiguration,
    OutOfMemory,
    Unknown,
}

impl ErrorType {
    /// Stable label used in metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorType::ConnectionReset => "CONNECTION_RESET",
            ErrorType::DnsResolution => "DNS_RESOLUTION",
            ErrorType::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorType::TokenExpired => "TOKEN_EXPIRED",
            ErrorType::PermissionDenied => "PERMISSION_DENIED",
            ErrorType::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorType::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorType::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorType::ModelUnavailable => "MODEL_UNAVAILABLE",
            ErrorType::ContextLengthExceeded => "CONTEXT_LENGTH_EXCEEDED",
            ErrorType::InvalidStructure => "INVALID_STRUCTURE",
            ErrorType::MissingNode => "MISSING_NODE",
            ErrorType::InvalidConnection => "INVALID_CONNECTION",
            ErrorType::NodeFailure => "NODE_FAILURE",
            ErrorType::InvalidInput => "INVALID_INPUT",
            ErrorType::ParseFailure => "PARSE_FAILURE",
            ErrorType::MissingConfiguration => "MISSING_CONFIGURATION",
            ErrorType::OutOfMemory => "OUT_OF_MEMORY",
            ErrorType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery approach recommended by the classification rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Retry immediately
    Retry,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Switch to an alternative implementation or provider
    Fallback,
    /// Refresh credentials or reconfigure
    Reconfigure,
    /// A human has to fix the input
    UserIntervention,
    /// Hand over to an operator
    Escalate,
    /// Nothing useful can be done automatically
    None,
}

impl RecoveryStrategy {
    /// Stable label used in metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::RetryWithBackoff => "retry_with_backoff",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::Reconfigure => "reconfigure",
            RecoveryStrategy::UserIntervention => "user_intervention",
            RecoveryStrategy::Escalate => "escalate",
            RecoveryStrategy::None => "none",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::default(), Severity::Medium);
    }

    #[test]
    fn test_serde_labels() {
        let json = serde_json::to_string(&ErrorCategory::WorkflowGeneration).unwrap();
        assert_eq!(json, "\"WORKFLOW_GENERATION\"");

        let severity: Severity = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(severity, Severity::High);

        let strategy = serde_json::to_string(&RecoveryStrategy::RetryWithBackoff).unwrap();
        assert_eq!(strategy, "\"retry_with_backoff\"");
    }
}
