//! # Error Pipeline
//!
//! Adaptive error handling for workflow services: faults are classified by
//! a prioritized rule set, collected with a level of detail that follows
//! system load, and turned into ranked recovery plans.
//!
//! ## Components
//!
//! - [`classifier`]: rule-based classification with bounded history
//! - [`performance`]: load sampling, pipeline overhead and alerts
//! - [`collector`]: mode-aware gating, reduction, batching and emission
//! - [`recovery`]: strategy registry, plan generation and action execution
//! - [`config`]: layered configuration for all of the above
//!
//! [`ErrorPipeline`] wires the components together:
//!
//! ```no_run
//! use std::sync::Arc;
//! use error_pipeline::{ErrorContext, ErrorPipeline, Fault, NoopExecutor, PipelineConfig, TracingSink};
//!
//! # async fn run() -> error_pipeline::Result<()> {
//! let pipeline = ErrorPipeline::new(PipelineConfig::from_env()?, Arc::new(TracingSink), Arc::new(NoopExecutor))?;
//! pipeline.start();
//!
//! let (error, outcome) = pipeline.handle_fault(
//!     &Fault::new("ECONNREFUSED 10.0.0.7:443"),
//!     &ErrorContext::new().workflow("wf-42"),
//! );
//! println!("{} collected: {}", error.category, outcome.processed);
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod taxonomy;
pub mod context;
pub mod sanitization;
pub mod events;
pub mod classifier;
pub mod performance;
pub mod collector;
pub mod sink;
pub mod retry;
pub mod recovery;
pub mod logging;
pub mod monitoring;
pub mod config;

use std::sync::Arc;

use tracing::{debug, info};

// Re-export commonly used types
pub use types::{Error, Result};
pub use taxonomy::{ErrorCategory, ErrorType, RecoveryStrategy, Severity};
pub use context::{ErrorContext, Fault, Telemetry};
pub use classifier::{ClassificationRule, ClassifiedError, ClassifierConfig, ErrorClassifier, RuleCondition};
pub use performance::{LoadProbe, MonitorConfig, PerformanceMonitor, PerformanceSnapshot, PerformanceStatus};
pub use collector::{AdaptiveCollector, CollectionMode, CollectorConfig, ProcessOutcome, ProcessStatus, ReducedError};
pub use sink::{ErrorSink, MemorySink, TracingSink};
pub use retry::{RetryConfig, RetryPolicy, RetryResult};
pub use recovery::{
    ActionExecutor, ActionType, AttemptResult, NoopExecutor, RecoveryAction, RecoveryAttempt, RecoveryContext,
    RecoveryManager, RecoveryPlan, Strategy,
};
pub use logging::{init_logging, LoggingConfig};
pub use crate::config::PipelineConfig;

/// Installs logging from the pipeline configuration
pub fn init(config: &PipelineConfig) -> Result<()> {
    init_logging(Some(config.logging.clone()))
}

/// Classifier, monitor, collector and recovery manager sharing one monitor
pub struct ErrorPipeline {
    classifier: ErrorClassifier,
    monitor: Arc<PerformanceMonitor>,
    collector: Arc<AdaptiveCollector>,
    recovery: RecoveryManager,
}

impl ErrorPipeline {
    /// Builds a pipeline sampling the host through `sysinfo`
    pub fn new(config: PipelineConfig, sink: Arc<dyn ErrorSink>, executor: Arc<dyn ActionExecutor>) -> Result<Self> {
        config.validate()?;
        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone())?);
        Self::assemble(config, monitor, sink, executor)
    }

    /// Builds a pipeline with a custom load probe
    pub fn with_probe(
        config: PipelineConfig,
        probe: Arc<dyn LoadProbe>,
        sink: Arc<dyn ErrorSink>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        let monitor = Arc::new(PerformanceMonitor::with_probe(config.monitor.clone(), probe)?);
        Self::assemble(config, monitor, sink, executor)
    }

    fn assemble(
        config: PipelineConfig,
        monitor: Arc<PerformanceMonitor>,
        sink: Arc<dyn ErrorSink>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Result<Self> {
        let classifier = ErrorClassifier::new(config.classifier).with_monitor(monitor.clone());
        let collector = Arc::new(AdaptiveCollector::new(config.collector, sink)?);
        collector.attach_monitor(monitor.clone());
        let recovery = RecoveryManager::new(config.recovery, executor)?.with_monitor(monitor.clone());

        Ok(Self {
            classifier,
            monitor,
            collector,
            recovery,
        })
    }

    /// Starts load sampling and the flush timer. Requires a Tokio runtime.
    pub fn start(&self) {
        let sampling = self.monitor.start();
        let flushing = self.collector.start_flush_timer();
        info!(sampling, flushing, "Error pipeline started");
    }

    /// Classifies a fault and hands it to the collector
    pub fn handle_fault(&self, fault: &Fault, context: &ErrorContext) -> (ClassifiedError, ProcessOutcome) {
        let error = self.classifier.classify_error(fault, context);
        let outcome = self.collector.process_error(&error, context);
        debug!(
            error_id = %error.id,
            status = ?outcome.status,
            mode = %outcome.mode,
            "Fault handled"
        );
        (error, outcome)
    }

    /// Plans recovery for an error still in the classifier history
    pub fn plan_recovery(&self, error_id: &str, context: RecoveryContext) -> Result<RecoveryPlan> {
        let error = self
            .classifier
            .get_error(error_id)
            .ok_or_else(|| Error::not_found("error", error_id))?;
        self.recovery.generate_recovery_plan(&error, context)
    }

    /// Executes a plan action; retry actions count against the error's retry budget
    pub async fn execute_recovery(&self, plan_id: &str, action_id: &str) -> Result<RecoveryAttempt> {
        let attempt = self.recovery.execute_recovery_action(plan_id, action_id).await?;
        if attempt.action_type == ActionType::Retry {
            self.classifier.increment_retry_count(&attempt.error_id);
        }
        Ok(attempt)
    }

    /// Stops sampling, flushes queued errors and closes the collector
    pub fn shutdown(&self) -> usize {
        self.monitor.stop();
        let flushed = self.collector.shutdown();
        info!(flushed, "Error pipeline shut down");
        flushed
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn collector(&self) -> &Arc<AdaptiveCollector> {
        &self.collector
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }
}

impl std::fmt::Debug for ErrorPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorPipeline")
            .field("mode", &self.collector.mode())
            .field("status", &self.monitor.status())
            .field("recovery", &self.recovery)
            .finish()
    }
}
