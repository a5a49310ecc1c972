//! # Fault Input and Error Context
//!
//! A [`Fault`] is the raw failure handed to the pipeline; an
//! [`ErrorContext`] carries the situational data (who, which workflow,
//! execution telemetry) that the classifier and collector look at.

use std::error::Error as StdError;
use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// A raw fault before classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fault {
    /// The raw error message
    pub message: String,
    /// Error name or type as reported by the source (e.g. `TimeoutError`)
    pub name: Option<String>,
    /// Machine-readable code (e.g. `ECONNREFUSED`, `429`)
    pub code: Option<String>,
    /// Stack trace, if one was captured
    pub stack_trace: Option<String>,
    /// When the fault happened
    pub occurred_at: DateTime<Utc>,
}

impl Fault {
    /// Creates a fault from a message
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            name: None,
            code: None,
            stack_trace: None,
            occurred_at: Utc::now(),
        }
    }

    /// Builds a fault from a Rust error, capturing its source chain and a backtrace
    pub fn from_error<E>(error: &E) -> Self
    where
        E: StdError + ?Sized,
    {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        let backtrace = backtrace::Backtrace::new();

        Self {
            message,
            name: None,
            code: None,
            stack_trace: Some(format!("{:?}", backtrace)),
            occurred_at: Utc::now(),
        }
    }

    /// Sets the error name
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the error code
    pub fn code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attaches a stack trace
    pub fn stack_trace<S: Into<String>>(mut self, stack: S) -> Self {
        self.stack_trace = Some(stack.into());
        self
    }

    /// Overrides the occurrence time
    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{}: ", name)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (Code: {})", code)?;
        }
        Ok(())
    }
}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Fault::new(message)
    }
}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Fault::new(message)
    }
}

/// Execution telemetry captured alongside a fault
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// How long the failing operation ran
    pub execution_time_ms: Option<u64>,
    /// Memory in use when the fault happened
    pub memory_usage_bytes: Option<u64>,
    /// CPU time consumed by the operation
    pub cpu_time_ms: Option<u64>,
    /// Number of nodes in the workflow being executed
    pub node_count: Option<u32>,
    /// Upstream requests made before the failure
    pub request_count: Option<u32>,
}

impl Telemetry {
    /// Keeps only the execution time
    pub fn minimal(&self) -> Self {
        Self {
            execution_time_ms: self.execution_time_ms,
            ..Default::default()
        }
    }

    /// Keeps timing and memory, drops counters
    pub fn standard(&self) -> Self {
        Self {
            execution_time_ms: self.execution_time_ms,
            memory_usage_bytes: self.memory_usage_bytes,
            cpu_time_ms: self.cpu_time_ms,
            ..Default::default()
        }
    }
}

/// Situational data attached to a fault
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub user_id: Option<String>,
    pub workflow_id: Option<String>,
    pub node_id: Option<String>,
    pub execution_id: Option<String>,
    pub session_id: Option<String>,
    /// The operation being performed when the error occurred
    pub operation: Option<String>,
    pub telemetry: Option<Telemetry>,
    /// Additional context keys and values
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ErrorContext {
    /// Creates an empty context
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user<S: Into<String>>(mut self, user_id: S) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn workflow<S: Into<String>>(mut self, workflow_id: S) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn node<S: Into<String>>(mut self, node_id: S) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn execution<S: Into<String>>(mut self, execution_id: S) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn session<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn operation<S: Into<String>>(mut self, operation: S) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Adds a metadata key-value pair
    pub fn add<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), value);
        }
        self
    }

    /// Looks up a field by name, covering both the typed fields and metadata
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let typed = match key {
            "user_id" => self.user_id.as_ref(),
            "workflow_id" => self.workflow_id.as_ref(),
            "node_id" => self.node_id.as_ref(),
            "execution_id" => self.execution_id.as_ref(),
            "session_id" => self.session_id.as_ref(),
            "operation" => self.operation.as_ref(),
            _ => return self.metadata.get(key).cloned(),
        };
        typed.map(|value| serde_json::Value::String(value.clone()))
    }

    /// Keeps identifiers needed to correlate the error, drops the rest
    pub fn essential(&self) -> Self {
        Self {
            user_id: self.user_id.clone(),
            workflow_id: self.workflow_id.clone(),
            node_id: self.node_id.clone(),
            execution_id: self.execution_id.clone(),
            operation: self.operation.clone(),
            ..Default::default()
        }
    }

    /// Keeps only the workflow location
    pub fn minimal(&self) -> Self {
        Self {
            workflow_id: self.workflow_id.clone(),
            node_id: self.node_id.clone(),
            ..Default::default()
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operation {
            Some(operation) => write!(f, "during operation: {}", operation)?,
            None => write!(f, "context")?,
        }

        let ids = [
            ("user", &self.user_id),
            ("workflow", &self.workflow_id),
            ("node", &self.node_id),
            ("execution", &self.execution_id),
        ];
        let present: Vec<String> = ids
            .iter()
            .filter_map(|(name, value)| value.as_ref().map(|v| format!("{}: {}", name, v)))
            .collect();
        if !present.is_empty() {
            write!(f, " [{}]", present.join(", "))?;
        }

        Ok(())
    }
}
