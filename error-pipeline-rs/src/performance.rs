//! # Performance Monitor
//!
//! Samples system load and the pipeline's own handling overhead, derives an
//! OPTIMAL / DEGRADED / CRITICAL status and recommends a collection mode.
//!
//! Load figures come from a [`LoadProbe`]. The default [`SysinfoProbe`]
//! reads the host through `sysinfo`; [`StaticProbe`] returns fixed values
//! for deterministic hosts and tests. Overhead is measured by bracketing
//! pipeline work with [`PerformanceMonitor::start_operation`] and
//! [`PerformanceMonitor::end_operation`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, Deserialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collector::CollectionMode;
use crate::events::{EventBus, Subscription};
use crate::monitoring;
use crate::taxonomy::Severity;
use crate::types::{Error, Result};

/// Raw figures reported by a [`LoadProbe`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSample {
    /// Cumulative idle CPU ticks
    pub cpu_idle_ticks: u64,
    /// Cumulative total CPU ticks
    pub cpu_total_ticks: u64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    /// Memory in use by this process, when the probe can tell
    pub heap_used_bytes: Option<u64>,
    /// Memory available to this process, when the probe can tell
    pub heap_total_bytes: Option<u64>,
    /// Time since memory was last reclaimed, when the probe can tell
    pub since_last_reclaim: Option<Duration>,
}

/// Source of system load figures
pub trait LoadProbe: Send + Sync {
    /// Reads the current load
    fn sample(&self) -> LoadSample;

    /// Event-loop lag measured by the host; `None` lets the monitor measure it
    fn event_loop_lag(&self) -> Option<Duration> {
        None
    }
}

/// Host load through `sysinfo`.
///
/// Process memory is the resident set of the current process against the
/// cgroup memory limit, or physical memory when there is none.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    ticks: Mutex<(u64, u64)>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = %e, "Current process id unavailable; process memory not sampled");
                None
            }
        };

        Self {
            system: Mutex::new(system),
            pid,
            ticks: Mutex::new((0, 0)),
        }
    }

    fn process_memory(&self, system: &mut System) -> (Option<u64>, Option<u64>) {
        let Some(pid) = self.pid else {
            return (None, None);
        };
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
        let used = system.process(pid).map(|process| process.memory());
        let total = system
            .cgroup_limits()
            .map(|limits| limits.total_memory)
            .filter(|total| *total > 0)
            .unwrap_or_else(|| system.total_memory());
        (used, used.map(|_| total))
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProbe for SysinfoProbe {
    fn sample(&self) -> LoadSample {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        // sysinfo reports a usage percentage; fold it into synthetic tick counters
        let usage = system.global_cpu_usage().clamp(0.0, 100.0) as f64;
        let mut ticks = self.ticks.lock();
        ticks.0 += ((100.0 - usage) * 10.0).round() as u64;
        ticks.1 += 1000;
        let (heap_used_bytes, heap_total_bytes) = self.process_memory(&mut system);

        LoadSample {
            cpu_idle_ticks: ticks.0,
            cpu_total_ticks: ticks.1,
            memory_used_bytes: system.used_memory(),
            memory_total_bytes: system.total_memory(),
            heap_used_bytes,
            heap_total_bytes,
            since_last_reclaim: None,
        }
    }
}

impl fmt::Debug for SysinfoProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysinfoProbe").finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct StaticLoad {
    cpu_percent: f64,
    memory_percent: f64,
    lag: Option<Duration>,
    since_last_reclaim: Option<Duration>,
    /// Used and available process memory
    heap: Option<(u64, u64)>,
}

/// A probe returning configurable fixed values
#[derive(Debug)]
pub struct StaticProbe {
    load: Mutex<StaticLoad>,
    ticks: Mutex<(u64, u64)>,
}

impl StaticProbe {
    /// An idle host: 0% CPU, 0% memory, no lag
    pub fn new() -> Self {
        Self {
            load: Mutex::new(StaticLoad {
                cpu_percent: 0.0,
                memory_percent: 0.0,
                lag: Some(Duration::ZERO),
                since_last_reclaim: None,
                heap: None,
            }),
            ticks: Mutex::new((0, 0)),
        }
    }

    pub fn with_cpu(self, percent: f64) -> Self {
        self.set_cpu(percent);
        self
    }

    pub fn with_memory(self, percent: f64) -> Self {
        self.set_memory(percent);
        self
    }

    pub fn with_lag(self, lag: Duration) -> Self {
        self.set_lag(lag);
        self
    }

    pub fn with_last_reclaim(self, ago: Duration) -> Self {
        self.load.lock().since_last_reclaim = Some(ago);
        self
    }

    /// Reports process memory; it then takes precedence over host memory
    pub fn with_heap(self, used_bytes: u64, total_bytes: u64) -> Self {
        self.load.lock().heap = Some((used_bytes, total_bytes));
        self
    }

    pub fn set_cpu(&self, percent: f64) {
        self.load.lock().cpu_percent = percent.clamp(0.0, 100.0);
    }

    pub fn set_memory(&self, percent: f64) {
        self.load.lock().memory_percent = percent.clamp(0.0, 100.0);
    }

    pub fn set_lag(&self, lag: Duration) {
        self.load.lock().lag = Some(lag);
    }
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProbe for StaticProbe {
    fn sample(&self) -> LoadSample {
        let load = *self.load.lock();
        let mut ticks = self.ticks.lock();
        ticks.0 += ((100.0 - load.cpu_percent) * 10.0).round() as u64;
        ticks.1 += 1000;

        let total = 1_000_000u64;
        LoadSample {
            cpu_idle_ticks: ticks.0,
            cpu_total_ticks: ticks.1,
            memory_used_bytes: (total as f64 * load.memory_percent / 100.0) as u64,
            memory_total_bytes: total,
            heap_used_bytes: load.heap.map(|(used, _)| used),
            heap_total_bytes: load.heap.map(|(_, total)| total),
            since_last_reclaim: load.since_last_reclaim,
        }
    }

    fn event_loop_lag(&self) -> Option<Duration> {
        self.load.lock().lag
    }
}

/// Kinds of pipeline work whose overhead is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Classification,
    Processing,
    Logging,
    Reporting,
    Recovery,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Classification,
        OperationKind::Processing,
        OperationKind::Logging,
        OperationKind::Reporting,
        OperationKind::Recovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Classification => "classification",
            OperationKind::Processing => "processing",
            OperationKind::Logging => "logging",
            OperationKind::Reporting => "reporting",
            OperationKind::Recovery => "recovery",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle for an in-flight measured operation
#[derive(Debug)]
#[must_use = "pass the token to end_operation to record the overhead"]
pub struct OperationToken {
    kind: OperationKind,
    started: Instant,
}

impl OperationToken {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

/// Overall health derived from the current sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceStatus {
    Optimal,
    Degraded,
    Critical,
}

impl PerformanceStatus {
    /// Collection mode suited to this status
    pub fn recommended_mode(&self) -> CollectionMode {
        match self {
            PerformanceStatus::Optimal => CollectionMode::Full,
            PerformanceStatus::Degraded => CollectionMode::Reduced,
            PerformanceStatus::Critical => CollectionMode::Minimal,
        }
    }

    /// Whether an error of this severity may still be processed
    pub fn admits(&self, severity: Severity) -> bool {
        match self {
            PerformanceStatus::Optimal => true,
            PerformanceStatus::Degraded => severity >= Severity::High,
            PerformanceStatus::Critical => severity == Severity::Critical,
        }
    }
}

impl fmt::Display for PerformanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PerformanceStatus::Optimal => "OPTIMAL",
            PerformanceStatus::Degraded => "DEGRADED",
            PerformanceStatus::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// Metrics that participate in status derivation and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    Cpu,
    Memory,
    EventLoopLag,
    Overhead,
}

impl AlertMetric {
    pub const ALL: [AlertMetric; 4] = [
        AlertMetric::Cpu,
        AlertMetric::Memory,
        AlertMetric::EventLoopLag,
        AlertMetric::Overhead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMetric::Cpu => "cpu",
            AlertMetric::Memory => "memory",
            AlertMetric::EventLoopLag => "event_loop_lag",
            AlertMetric::Overhead => "overhead",
        }
    }

    fn recommendation(&self, severity: AlertSeverity) -> &'static str {
        match (self, severity) {
            (AlertMetric::Cpu, AlertSeverity::Warning) => "Reduce error detail collection to lower CPU usage",
            (AlertMetric::Cpu, AlertSeverity::Critical) => "Switch to minimal collection and shed non-critical errors",
            (AlertMetric::Memory, AlertSeverity::Warning) => "Shrink queues and drop verbose error context",
            (AlertMetric::Memory, AlertSeverity::Critical) => "Flush queues immediately and collect critical errors only",
            (AlertMetric::EventLoopLag, AlertSeverity::Warning) => "Batch error processing to relieve the scheduler",
            (AlertMetric::EventLoopLag, AlertSeverity::Critical) => "Defer all non-critical error handling",
            (AlertMetric::Overhead, AlertSeverity::Warning) => "Simplify classification rules or reduce detail levels",
            (AlertMetric::Overhead, AlertSeverity::Critical) => "Error handling is too expensive; enter emergency mode",
        }
    }
}

impl fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Raised once per sample for each metric over its degraded threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub id: String,
    pub metric: AlertMetric,
    pub severity: AlertSeverity,
    pub value: f64,
    /// The threshold that was crossed
    pub threshold: f64,
    pub recommendation: String,
    pub timestamp: DateTime<Utc>,
}

impl PerformanceAlert {
    pub fn is_critical(&self) -> bool {
        self.severity == AlertSeverity::Critical
    }
}

/// Degraded and critical limits per metric
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    pub degraded_cpu_percent: f64,
    pub critical_cpu_percent: f64,
    pub degraded_memory_percent: f64,
    pub critical_memory_percent: f64,
    pub degraded_lag_ms: f64,
    pub critical_lag_ms: f64,
    pub degraded_overhead_ms: f64,
    pub critical_overhead_ms: f64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            degraded_cpu_percent: 70.0,
            critical_cpu_percent: 90.0,
            degraded_memory_percent: 80.0,
            critical_memory_percent: 95.0,
            degraded_lag_ms: 50.0,
            critical_lag_ms: 200.0,
            degraded_overhead_ms: 10.0,
            critical_overhead_ms: 50.0,
        }
    }
}

impl PerformanceThresholds {
    /// (degraded, critical) limits for a metric
    pub fn limits(&self, metric: AlertMetric) -> (f64, f64) {
        match metric {
            AlertMetric::Cpu => (self.degraded_cpu_percent, self.critical_cpu_percent),
            AlertMetric::Memory => (self.degraded_memory_percent, self.critical_memory_percent),
            AlertMetric::EventLoopLag => (self.degraded_lag_ms, self.critical_lag_ms),
            AlertMetric::Overhead => (self.degraded_overhead_ms, self.critical_overhead_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for metric in AlertMetric::ALL {
            let (degraded, critical) = self.limits(metric);
            if !(degraded >= 0.0 && degraded <= critical) {
                return Err(Error::InvalidConfig(format!(
                    "{} thresholds must satisfy 0 <= degraded ({}) <= critical ({})",
                    metric, degraded, critical
                )));
            }
        }
        Ok(())
    }
}

/// Monitor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling period of the background task
    pub sample_interval_ms: u64,
    /// Snapshots kept; history is pruned to twice this
    pub history_window: usize,
    /// Durations kept per operation kind
    pub overhead_window: usize,
    pub thresholds: PerformanceThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5000,
            history_window: 60,
            overhead_window: 1000,
            thresholds: PerformanceThresholds::default(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(Error::InvalidConfig("monitor.sample_interval_ms must be positive".into()));
        }
        if self.history_window == 0 || self.overhead_window == 0 {
            return Err(Error::InvalidConfig("monitor windows must be positive".into()));
        }
        self.thresholds.validate()
    }
}

/// Mean handling cost per operation kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverheadBreakdown {
    pub classification_ms: f64,
    pub processing_ms: f64,
    pub logging_ms: f64,
    pub reporting_ms: f64,
    pub recovery_ms: f64,
    /// Sum of the per-kind means
    pub total_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemLoad {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub heap_used_bytes: Option<u64>,
    pub event_loop_lag_ms: f64,
    pub active_handles: usize,
    /// 0.0 (no recent reclamation) to 1.0 (reclaimed within the last second)
    pub gc_pressure: f64,
}

/// Backpressure figures reported by the collector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingImpact {
    pub queue_size: usize,
    pub processing_delay_ms: f64,
    /// Fraction of submitted errors that were dropped
    pub drop_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub overhead: OverheadBreakdown,
    pub system: SystemLoad,
    pub processing: ProcessingImpact,
}

impl PerformanceMetrics {
    /// Current value of a watched metric
    pub fn value(&self, metric: AlertMetric) -> f64 {
        match metric {
            AlertMetric::Cpu => self.system.cpu_percent,
            AlertMetric::Memory => self.system.memory_percent,
            AlertMetric::EventLoopLag => self.system.event_loop_lag_ms,
            AlertMetric::Overhead => self.overhead.total_ms,
        }
    }
}

/// One sample of the monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub metrics: PerformanceMetrics,
    pub status: PerformanceStatus,
    pub recommended_mode: CollectionMode,
    /// Alerts raised on this sample
    pub alerts: Vec<PerformanceAlert>,
}

impl PerformanceSnapshot {
    pub fn has_critical_alert(&self) -> bool {
        self.alerts.iter().any(PerformanceAlert::is_critical)
    }
}

/// Derives the status from metrics alone
pub fn derive_status(metrics: &PerformanceMetrics, thresholds: &PerformanceThresholds) -> PerformanceStatus {
    let breaches = |pick: fn((f64, f64)) -> f64| {
        AlertMetric::ALL
            .iter()
            .any(|metric| metrics.value(*metric) >= pick(thresholds.limits(*metric)))
    };

    if breaches(|(_, critical)| critical) {
        PerformanceStatus::Critical
    } else if breaches(|(degraded, _)| degraded) {
        PerformanceStatus::Degraded
    } else {
        PerformanceStatus::Optimal
    }
}

/// One alert per metric at or above its degraded threshold
pub fn derive_alerts(metrics: &PerformanceMetrics, thresholds: &PerformanceThresholds) -> Vec<PerformanceAlert> {
    let now = Utc::now();
    AlertMetric::ALL
        .iter()
        .filter_map(|metric| {
            let value = metrics.value(*metric);
            let (degraded, critical) = thresholds.limits(*metric);
            let (severity, threshold) = if value >= critical {
                (AlertSeverity::Critical, critical)
            } else if value >= degraded {
                (AlertSeverity::Warning, degraded)
            } else {
                return None;
            };

            Some(PerformanceAlert {
                id: Uuid::new_v4().to_string(),
                metric: *metric,
                severity,
                value,
                threshold,
                recommendation: metric.recommendation(severity).to_string(),
                timestamp: now,
            })
        })
        .collect()
}

/// Process memory ratio when the probe reports it, host memory otherwise
fn memory_percent(sample: &LoadSample) -> f64 {
    let (used, total) = match (sample.heap_used_bytes, sample.heap_total_bytes) {
        (Some(used), Some(total)) if total > 0 => (used, total),
        _ => (sample.memory_used_bytes, sample.memory_total_bytes),
    };
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

fn gc_pressure(since_last_reclaim: Option<Duration>) -> f64 {
    match since_last_reclaim {
        Some(ago) if ago <= Duration::from_secs(1) => 1.0,
        Some(ago) if ago <= Duration::from_secs(5) => 0.5,
        Some(ago) if ago <= Duration::from_secs(30) => 0.2,
        _ => 0.0,
    }
}

fn mean_ms(samples: &VecDeque<Duration>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let total: f64 = samples.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
    total / samples.len() as f64
}

/// Samples load and handling overhead; publishes snapshots and alerts
pub struct PerformanceMonitor {
    config: MonitorConfig,
    probe: Arc<dyn LoadProbe>,
    overhead: Mutex<HashMap<OperationKind, VecDeque<Duration>>>,
    last_ticks: Mutex<Option<(u64, u64)>>,
    processing: Mutex<ProcessingImpact>,
    current: RwLock<Option<PerformanceSnapshot>>,
    history: RwLock<VecDeque<PerformanceSnapshot>>,
    snapshots: EventBus<PerformanceSnapshot>,
    alerts: EventBus<PerformanceAlert>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl PerformanceMonitor {
    /// Creates a monitor backed by `sysinfo`
    pub fn new(config: MonitorConfig) -> Result<Self> {
        Self::with_probe(config, Arc::new(SysinfoProbe::new()))
    }

    /// Creates a monitor with a custom load probe
    pub fn with_probe(config: MonitorConfig, probe: Arc<dyn LoadProbe>) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            probe,
            overhead: Mutex::new(HashMap::new()),
            last_ticks: Mutex::new(None),
            processing: Mutex::new(ProcessingImpact::default()),
            current: RwLock::new(None),
            history: RwLock::new(VecDeque::new()),
            snapshots: EventBus::new("performance.snapshot"),
            alerts: EventBus::new("performance.alert"),
            running: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Starts periodic sampling; returns false if already running
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = Duration::from_millis(self.config.sample_interval_ms);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Performance sampler stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        let Some(monitor) = weak.upgrade() else {
                            break;
                        };
                        monitor.collect_sample().await;
                    }
                }
            }
        });

        info!(interval_ms = self.config.sample_interval_ms, "Performance monitoring started");
        true
    }

    /// Stops periodic sampling; returns false if it was not running
    pub fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shutdown_tx.send(());
        info!("Performance monitoring stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Begins measuring an operation
    pub fn start_operation(&self, kind: OperationKind) -> OperationToken {
        OperationToken { kind, started: Instant::now() }
    }

    /// Records the duration of a measured operation
    pub fn end_operation(&self, token: OperationToken) -> Duration {
        let elapsed = token.started.elapsed();
        self.record_overhead(token.kind, elapsed);
        elapsed
    }

    /// Records an externally measured duration
    pub fn record_overhead(&self, kind: OperationKind, elapsed: Duration) {
        let mut overhead = self.overhead.lock();
        let window = overhead.entry(kind).or_default();
        window.push_back(elapsed);
        while window.len() > self.config.overhead_window {
            window.pop_front();
        }
        drop(overhead);

        monitoring::record_overhead(kind, elapsed);
    }

    /// Mean duration per operation kind over the rolling windows
    pub fn overhead_breakdown(&self) -> OverheadBreakdown {
        let overhead = self.overhead.lock();
        let mean = |kind| overhead.get(&kind).map(mean_ms).unwrap_or(0.0);

        let mut breakdown = OverheadBreakdown {
            classification_ms: mean(OperationKind::Classification),
            processing_ms: mean(OperationKind::Processing),
            logging_ms: mean(OperationKind::Logging),
            reporting_ms: mean(OperationKind::Reporting),
            recovery_ms: mean(OperationKind::Recovery),
            total_ms: 0.0,
        };
        breakdown.total_ms = breakdown.classification_ms
            + breakdown.processing_ms
            + breakdown.logging_ms
            + breakdown.reporting_ms
            + breakdown.recovery_ms;
        breakdown
    }

    /// Updates the backpressure figures included in the next sample
    pub fn record_processing_impact(&self, queue_size: usize, processing_delay: Duration, drop_rate: f64) {
        *self.processing.lock() = ProcessingImpact {
            queue_size,
            processing_delay_ms: processing_delay.as_secs_f64() * 1000.0,
            drop_rate: drop_rate.clamp(0.0, 1.0),
        };
    }

    /// Takes one sample, publishes alerts and then the snapshot
    pub async fn collect_sample(&self) -> PerformanceSnapshot {
        let lag = match self.probe.event_loop_lag() {
            Some(lag) => lag,
            None => measure_scheduling_lag().await,
        };
        self.sample_with_lag(lag)
    }

    fn sample_with_lag(&self, lag: Duration) -> PerformanceSnapshot {
        let sample = self.probe.sample();
        let metrics = PerformanceMetrics {
            overhead: self.overhead_breakdown(),
            system: SystemLoad {
                cpu_percent: self.cpu_percent(&sample),
                memory_percent: memory_percent(&sample),
                heap_used_bytes: sample.heap_used_bytes,
                event_loop_lag_ms: lag.as_secs_f64() * 1000.0,
                active_handles: tokio::runtime::Handle::try_current()
                    .map(|handle| handle.metrics().num_alive_tasks())
                    .unwrap_or(0),
                gc_pressure: gc_pressure(sample.since_last_reclaim),
            },
            processing: self.processing.lock().clone(),
        };

        let thresholds = &self.config.thresholds;
        let status = derive_status(&metrics, thresholds);
        let alerts = derive_alerts(&metrics, thresholds);
        let snapshot = PerformanceSnapshot {
            timestamp: Utc::now(),
            metrics,
            status,
            recommended_mode: status.recommended_mode(),
            alerts,
        };

        let previous = self.current.write().replace(snapshot.clone());
        if previous.map(|p| p.status) != Some(status) {
            info!(status = %status, mode = %snapshot.recommended_mode, "Performance status changed");
        }

        {
            let mut history = self.history.write();
            history.push_back(snapshot.clone());
            let cap = self.config.history_window * 2;
            while history.len() > cap {
                history.pop_front();
            }
        }

        for alert in &snapshot.alerts {
            warn!(
                metric = %alert.metric,
                severity = ?alert.severity,
                value = alert.value,
                threshold = alert.threshold,
                "Performance alert"
            );
            monitoring::record_alert(alert);
            self.alerts.publish(alert);
        }
        monitoring::record_snapshot(&snapshot);
        self.snapshots.publish(&snapshot);

        snapshot
    }

    fn cpu_percent(&self, sample: &LoadSample) -> f64 {
        let mut last = self.last_ticks.lock();
        let percent = match *last {
            Some((idle, total)) if sample.cpu_total_ticks > total => {
                let idle_delta = sample.cpu_idle_ticks.saturating_sub(idle) as f64;
                let total_delta = (sample.cpu_total_ticks - total) as f64;
                (1.0 - idle_delta / total_delta) * 100.0
            }
            // First sample: fall back to the cumulative ratio
            _ if sample.cpu_total_ticks > 0 => {
                (1.0 - sample.cpu_idle_ticks as f64 / sample.cpu_total_ticks as f64) * 100.0
            }
            _ => 0.0,
        };
        *last = Some((sample.cpu_idle_ticks, sample.cpu_total_ticks));
        percent.clamp(0.0, 100.0)
    }

    /// Most recent snapshot, if any sample was taken
    pub fn current_snapshot(&self) -> Option<PerformanceSnapshot> {
        self.current.read().clone()
    }

    /// Status of the most recent sample; OPTIMAL before the first one
    pub fn status(&self) -> PerformanceStatus {
        self.current
            .read()
            .as_ref()
            .map(|snapshot| snapshot.status)
            .unwrap_or(PerformanceStatus::Optimal)
    }

    /// Whether an error of this severity should be processed under current load
    pub fn can_process_error(&self, severity: Severity) -> bool {
        self.status().admits(severity)
    }

    pub fn history(&self) -> Vec<PerformanceSnapshot> {
        self.history.read().iter().cloned().collect()
    }

    /// Subscribes to snapshots
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn on_snapshot<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PerformanceSnapshot) + Send + Sync + 'static,
    {
        self.snapshots.subscribe(callback)
    }

    /// Subscribes to alerts
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn on_alert<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PerformanceAlert) + Send + Sync + 'static,
    {
        self.alerts.subscribe(callback)
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("config", &self.config)
            .field("status", &self.status())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn measure_scheduling_lag() -> Duration {
    if tokio::runtime::Handle::try_current().is_err() {
        return Duration::ZERO;
    }
    let scheduled = Instant::now();
    tokio::spawn(async move { scheduled.elapsed() })
        .await
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn monitor(probe: StaticProbe) -> PerformanceMonitor {
        PerformanceMonitor::with_probe(MonitorConfig::default(), Arc::new(probe)).unwrap()
    }

    #[test]
    fn test_memory_prefers_process_figures() {
        let host = LoadSample { memory_used_bytes: 30, memory_total_bytes: 100, ..Default::default() };
        assert!((memory_percent(&host) - 30.0).abs() < 1e-9);

        let process = LoadSample { heap_used_bytes: Some(900), heap_total_bytes: Some(1000), ..host };
        assert!((memory_percent(&process) - 90.0).abs() < 1e-9);

        let unknown_total = LoadSample { heap_total_bytes: Some(0), ..process };
        assert!((memory_percent(&unknown_total) - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_process_memory_drives_alerts() {
        let monitor = monitor(StaticProbe::new().with_memory(10.0).with_heap(970, 1000));
        let snapshot = monitor.collect_sample().await;

        assert_eq!(snapshot.metrics.system.heap_used_bytes, Some(970));
        assert!((snapshot.metrics.system.memory_percent - 97.0).abs() < 0.01);
        assert!(snapshot.has_critical_alert());
    }

    #[test]
    fn test_sysinfo_probe_reports_process_memory() {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return;
        }
        let sample = SysinfoProbe::new().sample();
        assert!(sample.heap_used_bytes.is_some_and(|used| used > 0));
        assert!(sample.heap_total_bytes >= sample.heap_used_bytes);
        assert!(sample.memory_total_bytes > 0);
    }

    #[tokio::test]
    async fn test_idle_host_is_optimal() {
        let monitor = monitor(StaticProbe::new().with_cpu(10.0).with_memory(30.0));
        let snapshot = monitor.collect_sample().await;

        assert_eq!(snapshot.status, PerformanceStatus::Optimal);
        assert_eq!(snapshot.recommended_mode, CollectionMode::Full);
        assert!(snapshot.alerts.is_empty());
        assert!((snapshot.metrics.system.cpu_percent - 10.0).abs() < 0.5);
        assert!((snapshot.metrics.system.memory_percent - 30.0).abs() < 0.5);
        assert!(monitor.can_process_error(Severity::Info));
    }

    #[tokio::test]
    async fn test_degraded_and_critical_status() {
        let probe = Arc::new(StaticProbe::new().with_cpu(75.0));
        let monitor = PerformanceMonitor::with_probe(MonitorConfig::default(), probe.clone()).unwrap();

        let snapshot = monitor.collect_sample().await;
        assert_eq!(snapshot.status, PerformanceStatus::Degraded);
        assert_eq!(snapshot.recommended_mode, CollectionMode::Reduced);
        assert!(monitor.can_process_error(Severity::High));
        assert!(!monitor.can_process_error(Severity::Medium));

        probe.set_memory(96.0);
        let snapshot = monitor.collect_sample().await;
        assert_eq!(snapshot.status, PerformanceStatus::Critical);
        assert_eq!(snapshot.recommended_mode, CollectionMode::Minimal);
        assert!(monitor.can_process_error(Severity::Critical));
        assert!(!monitor.can_process_error(Severity::High));
    }

    #[tokio::test]
    async fn test_alerts_published_before_snapshot() {
        let monitor = monitor(StaticProbe::new().with_cpu(95.0).with_lag(Duration::from_millis(60)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let alert_order = order.clone();
        let _alerts = monitor.on_alert(move |alert| {
            alert_order.lock().push(format!("alert:{}", alert.metric));
        });
        let snapshot_order = order.clone();
        let _snapshots = monitor.on_snapshot(move |_| {
            snapshot_order.lock().push("snapshot".to_string());
        });

        let snapshot = monitor.collect_sample().await;
        assert_eq!(snapshot.alerts.len(), 2);
        assert!(snapshot.has_critical_alert());

        let cpu = snapshot.alerts.iter().find(|a| a.metric == AlertMetric::Cpu).unwrap();
        assert_eq!(cpu.severity, AlertSeverity::Critical);
        assert_eq!(cpu.threshold, 90.0);
        let lag = snapshot.alerts.iter().find(|a| a.metric == AlertMetric::EventLoopLag).unwrap();
        assert_eq!(lag.severity, AlertSeverity::Warning);

        let order = order.lock();
        assert_eq!(order.len(), 3);
        assert_eq!(order.last().map(String::as_str), Some("snapshot"));
    }

    #[tokio::test]
    async fn test_overhead_tracking() {
        let monitor = monitor(StaticProbe::new());
        monitor.record_overhead(OperationKind::Classification, Duration::from_millis(4));
        monitor.record_overhead(OperationKind::Classification, Duration::from_millis(6));
        monitor.record_overhead(OperationKind::Processing, Duration::from_millis(3));

        let breakdown = monitor.overhead_breakdown();
        assert!((breakdown.classification_ms - 5.0).abs() < 1e-6);
        assert!((breakdown.processing_ms - 3.0).abs() < 1e-6);
        assert!((breakdown.total_ms - 8.0).abs() < 1e-6);

        monitor.record_overhead(OperationKind::Logging, Duration::from_millis(60));
        let snapshot = monitor.collect_sample().await;
        assert_eq!(snapshot.status, PerformanceStatus::Critical);
        assert!(snapshot.alerts.iter().any(|a| a.metric == AlertMetric::Overhead));
    }

    #[test]
    fn test_operation_tokens() {
        let monitor = monitor(StaticProbe::new());
        let token = monitor.start_operation(OperationKind::Recovery);
        assert_eq!(token.kind(), OperationKind::Recovery);
        let elapsed = monitor.end_operation(token);
        assert!(monitor.overhead_breakdown().recovery_ms >= 0.0);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_overhead_window_is_bounded() {
        let config = MonitorConfig { overhead_window: 3, ..Default::default() };
        let monitor = PerformanceMonitor::with_probe(config, Arc::new(StaticProbe::new())).unwrap();

        for ms in [100, 100, 1, 1, 1] {
            monitor.record_overhead(OperationKind::Reporting, Duration::from_millis(ms));
        }
        assert!((monitor.overhead_breakdown().reporting_ms - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_history_pruned_to_twice_window() {
        let config = MonitorConfig { history_window: 2, ..Default::default() };
        let monitor = PerformanceMonitor::with_probe(config, Arc::new(StaticProbe::new())).unwrap();

        for _ in 0..7 {
            monitor.collect_sample().await;
        }
        assert_eq!(monitor.history().len(), 4);
    }

    #[tokio::test]
    async fn test_processing_impact_and_gc_pressure() {
        let monitor = monitor(StaticProbe::new().with_last_reclaim(Duration::from_secs(3)));
        monitor.record_processing_impact(42, Duration::from_millis(200), 0.25);

        let snapshot = monitor.collect_sample().await;
        assert_eq!(snapshot.metrics.processing.queue_size, 42);
        assert_eq!(snapshot.metrics.processing.drop_rate, 0.25);
        assert_eq!(snapshot.metrics.system.gc_pressure, 0.5);
    }

    #[test]
    fn test_gc_pressure_buckets() {
        assert_eq!(gc_pressure(Some(Duration::from_millis(500))), 1.0);
        assert_eq!(gc_pressure(Some(Duration::from_secs(5))), 0.5);
        assert_eq!(gc_pressure(Some(Duration::from_secs(20))), 0.2);
        assert_eq!(gc_pressure(Some(Duration::from_secs(31))), 0.0);
        assert_eq!(gc_pressure(None), 0.0);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut config = MonitorConfig::default();
        config.thresholds.degraded_cpu_percent = 95.0;
        let result = PerformanceMonitor::with_probe(config, Arc::new(StaticProbe::new()));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_start_and_stop_sampler() {
        let config = MonitorConfig { sample_interval_ms: 10, ..Default::default() };
        let monitor = Arc::new(PerformanceMonitor::with_probe(config, Arc::new(StaticProbe::new())).unwrap());
        let samples = Arc::new(AtomicUsize::new(0));

        let counter = samples.clone();
        let _sub = monitor.on_snapshot(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(monitor.start());
        assert!(!monitor.start());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(monitor.stop());
        assert!(!monitor.stop());

        assert!(samples.load(Ordering::SeqCst) >= 2);
        assert!(monitor.current_snapshot().is_some());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn metrics(cpu: f64, memory: f64, lag: f64, overhead: f64) -> PerformanceMetrics {
            PerformanceMetrics {
                overhead: OverheadBreakdown { total_ms: overhead, ..Default::default() },
                system: SystemLoad {
                    cpu_percent: cpu,
                    memory_percent: memory,
                    event_loop_lag_ms: lag,
                    ..Default::default()
                },
                processing: ProcessingImpact::default(),
            }
        }

        proptest! {
            #[test]
            fn status_matches_worst_breach(
                cpu in 0.0f64..100.0,
                memory in 0.0f64..100.0,
                lag in 0.0f64..400.0,
                overhead in 0.0f64..100.0,
            ) {
                let thresholds = PerformanceThresholds::default();
                let metrics = metrics(cpu, memory, lag, overhead);

                let any_critical = cpu >= 90.0 || memory >= 95.0 || lag >= 200.0 || overhead >= 50.0;
                let any_degraded = cpu >= 70.0 || memory >= 80.0 || lag >= 50.0 || overhead >= 10.0;
                let expected = if any_critical {
                    PerformanceStatus::Critical
                } else if any_degraded {
                    PerformanceStatus::Degraded
                } else {
                    PerformanceStatus::Optimal
                };

                prop_assert_eq!(derive_status(&metrics, &thresholds), expected);
                prop_assert_eq!(
                    derive_alerts(&metrics, &thresholds).iter().any(PerformanceAlert::is_critical),
                    any_critical
                );
            }
        }
    }
}
