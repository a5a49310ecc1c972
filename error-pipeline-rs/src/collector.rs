//! # Adaptive Collector
//!
//! Decides which classified errors are kept, how much detail survives and
//! when they are handed to the [`ErrorSink`]. The amount of work spent is
//! governed by the active [`CollectionMode`]; modes tighten from FULL to
//! EMERGENCY and may be switched manually or by an attached
//! [`PerformanceMonitor`].
//!
//! Gates are applied in order: severity threshold, category/type filters,
//! the monitor's severity veto, then the per-second rate limit. The first
//! failing gate decides the rejection reason. Errors whose dispatch fails
//! give their rate-limit slot back.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, Deserialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::classifier::ClassifiedError;
use crate::context::{ErrorContext, Telemetry};
use crate::events::{EventBus, Subscription};
use crate::monitoring;
use crate::performance::{OperationKind, PerformanceMonitor};
use crate::sanitization::{sanitize_context, sanitize_message};
use crate::sink::ErrorSink;
use crate::taxonomy::{ErrorCategory, ErrorType, RecoveryStrategy, Severity};
use crate::types::{Error, Result};

/// Stack frames kept when traces are truncated
const TRUNCATED_STACK_LINES: usize = 10;

/// Transitions kept in the mode log
const TRANSITION_LOG_SIZE: usize = 10;

/// How much error detail is collected. Later variants are more restrictive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CollectionMode {
    // Lowercase aliases: layered config sources lowercase map keys
    #[default]
    #[serde(alias = "full")]
    Full,
    #[serde(alias = "reduced")]
    Reduced,
    #[serde(alias = "minimal")]
    Minimal,
    #[serde(alias = "emergency")]
    Emergency,
}

impl CollectionMode {
    /// All modes from least to most restrictive
    pub const ALL: [CollectionMode; 4] = [
        CollectionMode::Full,
        CollectionMode::Reduced,
        CollectionMode::Minimal,
        CollectionMode::Emergency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionMode::Full => "FULL",
            CollectionMode::Reduced => "REDUCED",
            CollectionMode::Minimal => "MINIMAL",
            CollectionMode::Emergency => "EMERGENCY",
        }
    }

    fn index(&self) -> usize {
        match self {
            CollectionMode::Full => 0,
            CollectionMode::Reduced => 1,
            CollectionMode::Minimal => 2,
            CollectionMode::Emergency => 3,
        }
    }
}

impl fmt::Display for CollectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryDetail {
    Full,
    Standard,
    /// Execution time only
    Minimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackTraceDetail {
    Full,
    Truncated,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextDetail {
    Full,
    Essential,
    Minimal,
}

/// Which parts of an error are collected at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectFlags {
    pub telemetry: bool,
    pub stack_trace: bool,
    pub context: bool,
    pub metadata: bool,
    pub related_errors: bool,
}

impl CollectFlags {
    fn count(&self) -> usize {
        [self.telemetry, self.stack_trace, self.context, self.metadata, self.related_errors]
            .iter()
            .filter(|flag| **flag)
            .count()
    }
}

/// Settings of a single collection mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub collect: CollectFlags,
    pub telemetry_detail: TelemetryDetail,
    pub stack_trace_detail: StackTraceDetail,
    pub context_detail: ContextDetail,
    pub max_errors_per_second: u32,
    pub max_queue_size: usize,
    pub batch_size: usize,
    pub processing_delay_ms: u64,
    /// Errors below this severity are rejected
    pub severity_threshold: Severity,
    /// Allowed categories; empty admits all
    #[serde(default)]
    pub category_filter: Vec<ErrorCategory>,
    /// Allowed types; empty admits all
    #[serde(default)]
    pub type_filter: Vec<ErrorType>,
}

impl CollectionConfig {
    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ms)
    }

    /// Whether accepted errors wait in the queue instead of being emitted directly
    pub fn queues(&self) -> bool {
        self.batch_size > 1 || self.processing_delay_ms > 0
    }

    fn validate(&self, mode: CollectionMode) -> Result<()> {
        if self.max_queue_size == 0 || self.batch_size == 0 || self.max_errors_per_second == 0 {
            return Err(Error::InvalidConfig(format!(
                "{} mode needs positive queue size, batch size and rate",
                mode
            )));
        }
        Ok(())
    }

    fn full() -> Self {
        Self {
            collect: CollectFlags {
                telemetry: true,
                stack_trace: true,
                context: true,
                metadata: true,
                related_errors: true,
            },
            telemetry_detail: TelemetryDetail::Full,
            stack_trace_detail: StackTraceDetail::Full,
            context_detail: ContextDetail::Full,
            max_errors_per_second: 100,
            max_queue_size: 1000,
            batch_size: 10,
            processing_delay_ms: 100,
            severity_threshold: Severity::Info,
            category_filter: Vec::new(),
            type_filter: Vec::new(),
        }
    }

    fn reduced() -> Self {
        Self {
            collect: CollectFlags {
                telemetry: true,
                stack_trace: true,
                context: true,
                metadata: false,
                related_errors: true,
            },
            telemetry_detail: TelemetryDetail::Standard,
            stack_trace_detail: StackTraceDetail::Truncated,
            context_detail: ContextDetail::Essential,
            max_errors_per_second: 50,
            max_queue_size: 500,
            batch_size: 20,
            processing_delay_ms: 200,
            severity_threshold: Severity::Low,
            category_filter: Vec::new(),
            type_filter: Vec::new(),
        }
    }

    fn minimal() -> Self {
        Self {
            collect: CollectFlags {
                telemetry: true,
                stack_trace: false,
                context: true,
                metadata: false,
                related_errors: false,
            },
            telemetry_detail: TelemetryDetail::Minimal,
            stack_trace_detail: StackTraceDetail::None,
            context_detail: ContextDetail::Minimal,
            max_errors_per_second: 20,
            max_queue_size: 100,
            batch_size: 50,
            processing_delay_ms: 500,
            severity_threshold: Severity::High,
            category_filter: Vec::new(),
            type_filter: Vec::new(),
        }
    }

    fn emergency() -> Self {
        Self {
            collect: CollectFlags {
                telemetry: false,
                stack_trace: false,
                context: true,
                metadata: false,
                related_errors: false,
            },
            telemetry_detail: TelemetryDetail::Minimal,
            stack_trace_detail: StackTraceDetail::None,
            context_detail: ContextDetail::Minimal,
            max_errors_per_second: 5,
            max_queue_size: 50,
            batch_size: 100,
            processing_delay_ms: 1000,
            severity_threshold: Severity::Critical,
            category_filter: Vec::new(),
            type_filter: Vec::new(),
        }
    }
}

/// One validated configuration per mode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeTable {
    configs: [CollectionConfig; 4],
}

impl ModeTable {
    /// Builds a table, checking that every limit tightens from FULL to EMERGENCY
    pub fn new(
        full: CollectionConfig,
        reduced: CollectionConfig,
        minimal: CollectionConfig,
        emergency: CollectionConfig,
    ) -> Result<Self> {
        let table = Self { configs: [full, reduced, minimal, emergency] };
        table.validate()?;
        Ok(table)
    }

    pub fn get(&self, mode: CollectionMode) -> &CollectionConfig {
        &self.configs[mode.index()]
    }

    /// Returns a copy with one mode replaced, re-validated
    pub fn with_override(&self, mode: CollectionMode, config: CollectionConfig) -> Result<Self> {
        let mut configs = self.configs.clone();
        configs[mode.index()] = config;
        let table = Self { configs };
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        for mode in CollectionMode::ALL {
            self.get(mode).validate(mode)?;
        }

        for pair in CollectionMode::ALL.windows(2) {
            let (looser_mode, stricter_mode) = (pair[0], pair[1]);
            let looser = self.get(looser_mode);
            let stricter = self.get(stricter_mode);
            let violation = if stricter.max_errors_per_second > looser.max_errors_per_second {
                Some("max_errors_per_second")
            } else if stricter.max_queue_size > looser.max_queue_size {
                Some("max_queue_size")
            } else if stricter.severity_threshold < looser.severity_threshold {
                Some("severity_threshold")
            } else if stricter.collect.count() > looser.collect.count() {
                Some("collected fields")
            } else if stricter.telemetry_detail < looser.telemetry_detail
                || stricter.stack_trace_detail < looser.stack_trace_detail
                || stricter.context_detail < looser.context_detail
            {
                Some("detail level")
            } else {
                None
            };

            if let Some(field) = violation {
                return Err(Error::InvalidConfig(format!(
                    "{} must not be looser in {} than in {}",
                    field, stricter_mode, looser_mode
                )));
            }
        }
        Ok(())
    }
}

impl Default for ModeTable {
    fn default() -> Self {
        Self {
            configs: [
                CollectionConfig::full(),
                CollectionConfig::reduced(),
                CollectionConfig::minimal(),
                CollectionConfig::emergency(),
            ],
        }
    }
}

/// Collector tuning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub initial_mode: CollectionMode,
    /// Per-mode replacements for the built-in table
    pub overrides: HashMap<CollectionMode, CollectionConfig>,
}

impl CollectorConfig {
    /// Builds the validated mode table
    pub fn mode_table(&self) -> Result<ModeTable> {
        let mut table = ModeTable::default();
        for mode in CollectionMode::ALL {
            if let Some(config) = self.overrides.get(&mode) {
                table = table.with_override(mode, config.clone())?;
            }
        }
        Ok(table)
    }
}

/// An error trimmed to what the active mode collects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedError {
    pub id: String,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub error_type: ErrorType,
    pub message: String,
    pub user_message: String,
    pub code: Option<String>,
    pub recovery_strategy: RecoveryStrategy,
    pub is_retryable: bool,
    pub retry_count: u32,
    pub telemetry: Option<Telemetry>,
    pub stack_trace: Option<String>,
    pub context: Option<ErrorContext>,
    pub related_error_ids: Vec<String>,
    /// Mode in effect when the error was collected
    pub mode: CollectionMode,
    pub occurred_at: DateTime<Utc>,
    pub collected_at: DateTime<Utc>,
}

impl ReducedError {
    /// Applies a mode's detail settings to a classified error
    pub fn reduce(
        error: &ClassifiedError,
        context: &ErrorContext,
        mode: CollectionMode,
        config: &CollectionConfig,
    ) -> Self {
        let source = if context == &ErrorContext::default() {
            &error.context
        } else {
            context
        };

        let telemetry = if config.collect.telemetry {
            source.telemetry.as_ref().map(|telemetry| match config.telemetry_detail {
                TelemetryDetail::Full => telemetry.clone(),
                TelemetryDetail::Standard => telemetry.standard(),
                TelemetryDetail::Minimal => telemetry.minimal(),
            })
        } else {
            None
        };

        let stack_trace = if config.collect.stack_trace {
            error.stack_trace.as_ref().and_then(|stack| match config.stack_trace_detail {
                StackTraceDetail::Full => Some(sanitize_message(stack)),
                StackTraceDetail::Truncated => Some(sanitize_message(&truncate_stack(stack))),
                StackTraceDetail::None => None,
            })
        } else {
            None
        };

        let context = if config.collect.context {
            let sanitized = sanitize_context(source);
            let mut reduced = match config.context_detail {
                ContextDetail::Full => sanitized,
                ContextDetail::Essential => sanitized.essential(),
                ContextDetail::Minimal => sanitized.minimal(),
            };
            reduced.telemetry = None;
            if !config.collect.metadata {
                reduced.metadata.clear();
            }
            Some(reduced)
        } else {
            None
        };

        let related_error_ids = if config.collect.related_errors {
            error.related_error_ids.clone()
        } else {
            Vec::new()
        };

        Self {
            id: error.id.clone(),
            severity: error.severity,
            category: error.category,
            error_type: error.error_type,
            // Technical text embeds the raw fault message
            message: sanitize_message(&error.messages.technical),
            user_message: error.messages.user.clone(),
            code: error.code.clone(),
            recovery_strategy: error.recovery_strategy,
            is_retryable: error.is_retryable,
            retry_count: error.retry_count,
            telemetry,
            stack_trace,
            context,
            related_error_ids,
            mode,
            occurred_at: error.occurred_at,
            collected_at: Utc::now(),
        }
    }

    /// Identification and message only, used when regular emission failed
    pub fn bare(&self) -> Self {
        Self {
            telemetry: None,
            stack_trace: None,
            context: None,
            related_error_ids: Vec::new(),
            ..self.clone()
        }
    }
}

fn truncate_stack(stack: &str) -> String {
    let mut lines = stack.lines();
    let kept: Vec<&str> = lines.by_ref().take(TRUNCATED_STACK_LINES).collect();
    let remaining = lines.count();
    if remaining == 0 {
        kept.join("\n")
    } else {
        format!("{}\n... {} more frames", kept.join("\n"), remaining)
    }
}

/// Why an error was not collected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    BelowSeverityThreshold,
    CategoryFiltered,
    TypeFiltered,
    PerformanceConstraints,
    RateLimitExceeded,
    ShutDown,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::BelowSeverityThreshold => "Below severity threshold",
            RejectReason::CategoryFiltered => "Category filtered",
            RejectReason::TypeFiltered => "Type filtered",
            RejectReason::PerformanceConstraints => "Performance constraints",
            RejectReason::RateLimitExceeded => "Rate limit exceeded",
            RejectReason::ShutDown => "Collector shut down",
        }
    }

    /// Whether the rejection was caused by load rather than by configuration
    fn is_drop(&self) -> bool {
        matches!(self, RejectReason::PerformanceConstraints | RejectReason::RateLimitExceeded)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Accepted,
    Rejected,
    Failed,
}

/// Result of [`AdaptiveCollector::process_error`]
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub status: ProcessStatus,
    pub processed: bool,
    pub reason: Option<String>,
    pub mode: CollectionMode,
    /// Time spent inside the collector
    pub overhead: Duration,
    /// The collected form, when accepted
    pub reduced: Option<ReducedError>,
}

impl ProcessOutcome {
    fn rejected(reason: RejectReason, mode: CollectionMode, overhead: Duration) -> Self {
        Self {
            status: ProcessStatus::Rejected,
            processed: false,
            reason: Some(reason.as_str().to_string()),
            mode,
            overhead,
            reduced: None,
        }
    }
}

/// A recorded mode change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from: CollectionMode,
    pub to: CollectionMode,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Notifications published by the collector
#[derive(Debug, Clone)]
pub enum CollectorEvent {
    ModeChanged(ModeTransition),
    /// Oldest queued errors were evicted to respect the queue cap
    Overflow { removed: usize, remaining: usize },
    /// The sink failed or panicked
    ProcessingError { error_id: Option<String>, message: String },
}

/// Running counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorStatistics {
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: HashMap<RejectReason, u64>,
    /// Evicted from the queue on overflow
    pub evicted: u64,
    pub flushed: u64,
    pub failed: u64,
    pub mode_changes: u64,
}

impl CollectorStatistics {
    pub fn rejected_total(&self) -> u64 {
        self.rejected.values().sum()
    }

    /// Fraction of submissions lost to load shedding or eviction
    pub fn drop_rate(&self) -> f64 {
        if self.submitted == 0 {
            return 0.0;
        }
        let shed: u64 = self
            .rejected
            .iter()
            .filter(|(reason, _)| reason.is_drop())
            .map(|(_, count)| count)
            .sum();
        ((shed + self.evicted) as f64 / self.submitted as f64).min(1.0)
    }
}

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    count: u32,
}

/// Mode-aware error collector
pub struct AdaptiveCollector {
    table: RwLock<ModeTable>,
    mode_tx: watch::Sender<CollectionMode>,
    transitions: Mutex<VecDeque<ModeTransition>>,
    queue: Mutex<VecDeque<ReducedError>>,
    window: Mutex<RateWindow>,
    stats: Mutex<CollectorStatistics>,
    sink: Arc<dyn ErrorSink>,
    monitor: RwLock<Option<Arc<PerformanceMonitor>>>,
    monitor_subscriptions: Mutex<Vec<Subscription>>,
    events: EventBus<CollectorEvent>,
    /// Held for the duration of a flush
    flush_lock: Mutex<()>,
    timer_running: AtomicBool,
    shut_down: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl AdaptiveCollector {
    pub fn new(config: CollectorConfig, sink: Arc<dyn ErrorSink>) -> Result<Self> {
        let table = config.mode_table()?;
        let (mode_tx, _) = watch::channel(config.initial_mode);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            table: RwLock::new(table),
            mode_tx,
            transitions: Mutex::new(VecDeque::with_capacity(TRANSITION_LOG_SIZE)),
            queue: Mutex::new(VecDeque::new()),
            window: Mutex::new(RateWindow { started: Instant::now(), count: 0 }),
            stats: Mutex::new(CollectorStatistics::default()),
            sink,
            monitor: RwLock::new(None),
            monitor_subscriptions: Mutex::new(Vec::new()),
            events: EventBus::new("collector"),
            flush_lock: Mutex::new(()),
            timer_running: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn mode(&self) -> CollectionMode {
        *self.mode_tx.borrow()
    }

    /// Configuration of the active mode
    pub fn mode_config(&self) -> CollectionConfig {
        self.table.read().get(self.mode()).clone()
    }

    /// Runs an error through the gates and either queues or emits it
    pub fn process_error(&self, error: &ClassifiedError, context: &ErrorContext) -> ProcessOutcome {
        let started = Instant::now();
        let monitor = self.monitor.read().clone();
        let token = monitor
            .as_ref()
            .map(|monitor| monitor.start_operation(OperationKind::Processing));

        let outcome = self.process_inner(error, context, monitor.as_deref(), started);

        if let (Some(monitor), Some(token)) = (monitor.as_ref(), token) {
            monitor.end_operation(token);
            let drop_rate = self.stats.lock().drop_rate();
            monitor.record_processing_impact(self.queue_len(), started.elapsed(), drop_rate);
        }
        monitoring::record_process_outcome(&outcome);
        outcome
    }

    fn process_inner(
        &self,
        error: &ClassifiedError,
        context: &ErrorContext,
        monitor: Option<&PerformanceMonitor>,
        started: Instant,
    ) -> ProcessOutcome {
        let mode = self.mode();
        if self.shut_down.load(Ordering::SeqCst) {
            return ProcessOutcome::rejected(RejectReason::ShutDown, mode, started.elapsed());
        }

        self.stats.lock().submitted += 1;
        let config = self.table.read().get(mode).clone();

        if let Some(reason) = self.gate(error, &config, monitor) {
            debug!(error_id = %error.id, mode = %mode, reason = %reason, "Error not collected");
            *self.stats.lock().rejected.entry(reason).or_insert(0) += 1;
            return ProcessOutcome::rejected(reason, mode, started.elapsed());
        }

        let reduced = ReducedError::reduce(error, context, mode, &config);
        let dispatched = catch_unwind(AssertUnwindSafe(|| self.dispatch(reduced.clone(), &config)));

        let failure = match dispatched {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };

        match failure {
            None => {
                self.stats.lock().accepted += 1;
                ProcessOutcome {
                    status: ProcessStatus::Accepted,
                    processed: true,
                    reason: None,
                    mode,
                    overhead: started.elapsed(),
                    reduced: Some(reduced),
                }
            }
            Some(message) => {
                self.release_rate_slot();
                self.report_failure(Some(&reduced), &message);
                ProcessOutcome {
                    status: ProcessStatus::Failed,
                    processed: false,
                    reason: Some(format!("Processing failed: {}", message)),
                    mode,
                    overhead: started.elapsed(),
                    reduced: None,
                }
            }
        }
    }

    fn gate(
        &self,
        error: &ClassifiedError,
        config: &CollectionConfig,
        monitor: Option<&PerformanceMonitor>,
    ) -> Option<RejectReason> {
        if error.severity < config.severity_threshold {
            return Some(RejectReason::BelowSeverityThreshold);
        }
        if !config.category_filter.is_empty() && !config.category_filter.contains(&error.category) {
            return Some(RejectReason::CategoryFiltered);
        }
        if !config.type_filter.is_empty() && !config.type_filter.contains(&error.error_type) {
            return Some(RejectReason::TypeFiltered);
        }
        // Overlaps with the severity threshold; whichever is stricter decides
        if let Some(monitor) = monitor {
            if !monitor.can_process_error(error.severity) {
                return Some(RejectReason::PerformanceConstraints);
            }
        }

        let mut window = self.window.lock();
        if window.started.elapsed() >= Duration::from_secs(1) {
            window.started = Instant::now();
            window.count = 0;
        }
        if window.count >= config.max_errors_per_second {
            return Some(RejectReason::RateLimitExceeded);
        }
        window.count += 1;
        None
    }

    /// Returns the slot taken by an error whose dispatch failed
    fn release_rate_slot(&self) {
        let mut window = self.window.lock();
        window.count = window.count.saturating_sub(1);
    }

    fn dispatch(&self, reduced: ReducedError, config: &CollectionConfig) -> Result<()> {
        if !config.queues() {
            return self.sink.emit(std::slice::from_ref(&reduced));
        }

        let (removed, remaining) = {
            let mut queue = self.queue.lock();
            queue.push_back(reduced);
            self.trim_queue(&mut queue)
        };
        self.report_trim(removed, remaining);
        Ok(())
    }

    /// Evicts the oldest entries beyond the active mode's limit.
    ///
    /// The limit is read while the queue lock is held, so a concurrent mode
    /// change either sees this push or is seen by it.
    fn trim_queue(&self, queue: &mut VecDeque<ReducedError>) -> (usize, usize) {
        let max_queue_size = self.table.read().get(self.mode()).max_queue_size;
        let removed = queue.len().saturating_sub(max_queue_size);
        queue.drain(..removed);
        (removed, queue.len())
    }

    fn enforce_queue_limit(&self) {
        let (removed, remaining) = {
            let mut queue = self.queue.lock();
            self.trim_queue(&mut queue)
        };
        self.report_trim(removed, remaining);
    }

    fn report_trim(&self, removed: usize, remaining: usize) {
        monitoring::record_queue_length(remaining);
        if removed > 0 {
            warn!(removed, remaining, "Error queue overflow; oldest entries evicted");
            self.stats.lock().evicted += removed as u64;
            monitoring::record_overflow(removed);
            self.events.publish(&CollectorEvent::Overflow { removed, remaining });
        }
    }

    fn report_failure(&self, reduced: Option<&ReducedError>, message: &str) {
        error!(error_id = ?reduced.map(|r| r.id.as_str()), error = %message, "Error collection failed");
        self.stats.lock().failed += 1;
        self.events.publish(&CollectorEvent::ProcessingError {
            error_id: reduced.map(|r| r.id.clone()),
            message: message.to_string(),
        });

        if let Some(reduced) = reduced {
            let bare = reduced.bare();
            let fallback = catch_unwind(AssertUnwindSafe(|| self.sink.emit(std::slice::from_ref(&bare))));
            if !matches!(fallback, Ok(Ok(()))) {
                warn!(error_id = %reduced.id, "Minimal fallback emission failed");
            }
        }
    }

    fn emit_batch(&self, batch: &[ReducedError]) -> bool {
        let emitted = catch_unwind(AssertUnwindSafe(|| self.sink.emit(batch)));
        let failure = match emitted {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        error!(batch = batch.len(), error = %failure, "Flushing error batch failed");
        self.stats.lock().failed += batch.len() as u64;
        self.events.publish(&CollectorEvent::ProcessingError { error_id: None, message: failure });
        false
    }

    /// Emits one batch from the queue; used by the flush timer
    pub fn flush_batch(&self) -> usize {
        let Some(_flushing) = self.flush_lock.try_lock() else {
            return 0;
        };

        let batch_size = self.mode_config().batch_size;
        let batch: Vec<ReducedError> = {
            let mut queue = self.queue.lock();
            let take = batch_size.min(queue.len());
            queue.drain(..take).collect()
        };

        let flushed = if !batch.is_empty() && self.emit_batch(&batch) {
            batch.len()
        } else {
            0
        };
        self.finish_flush(flushed);
        flushed
    }

    /// Drains the whole queue. Returns 0 when another flush is in progress.
    pub fn flush_queue(&self) -> usize {
        let Some(_flushing) = self.flush_lock.try_lock() else {
            debug!("Flush already in progress");
            return 0;
        };
        self.drain_queue()
    }

    /// Emits every queued error; the caller holds `flush_lock`
    fn drain_queue(&self) -> usize {
        let started = Instant::now();
        let batch_size = self.mode_config().batch_size;
        let drained: Vec<ReducedError> = self.queue.lock().drain(..).collect();

        let flushed: usize = drained
            .chunks(batch_size)
            .filter(|batch| self.emit_batch(batch))
            .map(|batch| batch.len())
            .sum();

        if flushed > 0 {
            debug!(flushed, elapsed_ms = started.elapsed().as_millis() as u64, "Error queue flushed");
        }
        self.finish_flush(flushed);
        flushed
    }

    fn finish_flush(&self, flushed: usize) {
        self.stats.lock().flushed += flushed as u64;
        monitoring::record_flush(flushed);
        monitoring::record_queue_length(self.queue_len());
    }

    /// Switches mode; returns false when already in that mode
    pub fn set_mode<S: Into<String>>(&self, mode: CollectionMode, reason: S) -> bool {
        let transition = {
            let mut transitions = self.transitions.lock();
            let from = self.mode();
            if from == mode {
                return false;
            }

            self.mode_tx.send_replace(mode);
            let transition = ModeTransition {
                from,
                to: mode,
                timestamp: Utc::now(),
                reason: reason.into(),
            };
            transitions.push_back(transition.clone());
            while transitions.len() > TRANSITION_LOG_SIZE {
                transitions.pop_front();
            }
            transition
        };

        info!(from = %transition.from, to = %transition.to, reason = %transition.reason, "Collection mode changed");
        self.stats.lock().mode_changes += 1;
        monitoring::record_mode_change(transition.from, transition.to);

        self.enforce_queue_limit();
        self.events.publish(&CollectorEvent::ModeChanged(transition));
        true
    }

    /// Replaces one mode's configuration; the table is re-validated
    pub fn override_mode_config(&self, mode: CollectionMode, config: CollectionConfig) -> Result<()> {
        {
            let mut table = self.table.write();
            *table = table.with_override(mode, config)?;
        }
        info!(mode = %mode, "Collection mode configuration overridden");

        if mode == self.mode() {
            self.enforce_queue_limit();
            // Wake the flush timer so it picks up the new delay
            self.mode_tx.send_modify(|_| {});
        }
        Ok(())
    }

    /// Follows a monitor's recommendations and uses it to veto work under load.
    ///
    /// A critical alert forces EMERGENCY; a snapshot carrying a critical alert
    /// never relaxes below it.
    pub fn attach_monitor(self: &Arc<Self>, monitor: Arc<PerformanceMonitor>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let on_alert = monitor.on_alert(move |alert| {
            if !alert.is_critical() {
                return;
            }
            if let Some(collector) = weak.upgrade() {
                collector.set_mode(
                    CollectionMode::Emergency,
                    format!("Critical {} alert: {:.1} >= {:.1}", alert.metric, alert.value, alert.threshold),
                );
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let on_snapshot = monitor.on_snapshot(move |snapshot| {
            let Some(collector) = weak.upgrade() else {
                return;
            };
            if snapshot.has_critical_alert() {
                collector.set_mode(CollectionMode::Emergency, "Critical performance alert");
            } else {
                collector.set_mode(
                    snapshot.recommended_mode,
                    format!("Performance status {}", snapshot.status),
                );
            }
        });

        let mut subscriptions = self.monitor_subscriptions.lock();
        subscriptions.clear();
        subscriptions.push(on_alert);
        subscriptions.push(on_snapshot);
        *self.monitor.write() = Some(monitor);
        info!("Performance monitor attached to collector");
    }

    /// Starts the periodic flush; returns false if already running or shut down
    pub fn start_flush_timer(self: &Arc<Self>) -> bool {
        if self.shut_down.load(Ordering::SeqCst) || self.timer_running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let mut mode_rx = self.mode_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                let delay = match weak.upgrade() {
                    Some(collector) => collector.mode_config().processing_delay().max(Duration::from_millis(1)),
                    None => break,
                };

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    changed = mode_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        debug!("Flush timer reconfigured");
                    }
                    _ = tokio::time::sleep(delay) => {
                        match weak.upgrade() {
                            Some(collector) => {
                                collector.flush_batch();
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("Flush timer stopped");
        });

        true
    }

    /// Stops the timer, flushes once and rejects all later submissions
    pub fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let _ = self.shutdown_tx.send(());
        self.timer_running.store(false, Ordering::SeqCst);
        self.monitor_subscriptions.lock().clear();

        // Waits for an in-flight timer flush, then drains what it left
        let flushed = {
            let _flushing = self.flush_lock.lock();
            self.drain_queue()
        };
        info!(flushed, "Collector shut down");
        flushed
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Recent mode transitions, oldest first
    pub fn transitions(&self) -> Vec<ModeTransition> {
        self.transitions.lock().iter().cloned().collect()
    }

    pub fn statistics(&self) -> CollectorStatistics {
        self.stats.lock().clone()
    }

    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CollectorEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }
}

impl Drop for AdaptiveCollector {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl fmt::Debug for AdaptiveCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveCollector")
            .field("mode", &self.mode())
            .field("queue", &self.queue_len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic: unknown payload".to_string()
    }
}
