//! # Error Classifier
//!
//! Deterministic, rule-based classification of raw faults into the
//! severity × category × type taxonomy.
//!
//! Rules are plain data ([`ClassificationRule`] + [`RuleCondition`]) so a
//! rule set can be exported, diffed and unit tested. Rules are evaluated in
//! descending priority and the first match wins. A condition that cannot be
//! evaluated (bad regex, failing or panicking [`Classify`] implementation)
//! is logged and treated as a non-match. A priority-0 catch-all rule is
//! always present, so [`ErrorClassifier::classify_error`] never fails.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{ErrorContext, Fault};
use crate::monitoring;
use crate::performance::{OperationKind, PerformanceMonitor};
use crate::sanitization::{sanitize_context, sanitize_message};
use crate::taxonomy::{ErrorCategory, ErrorType, RecoveryStrategy, Severity};
use crate::types::{Error, Result};

/// Id of the built-in catch-all rule
pub const GENERIC_RULE_ID: &str = "generic-error";

/// A host-defined predicate for rules that cannot be expressed as data
pub trait Classify: Send + Sync {
    /// Returns whether the fault matches
    fn matches(&self, fault: &Fault, context: &ErrorContext) -> Result<bool>;
}

/// Wrapper giving custom predicates `Clone` and `Debug`
#[derive(Clone)]
pub struct CustomCondition {
    pub name: String,
    predicate: Arc<dyn Classify>,
}

impl CustomCondition {
    pub fn new<S: Into<String>>(name: S, predicate: Arc<dyn Classify>) -> Self {
        Self { name: name.into(), predicate }
    }
}

impl fmt::Debug for CustomCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustomCondition({})", self.name)
    }
}

/// Structured rule predicate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Matches everything; used by catch-all rules
    Always,
    /// Message contains any of the needles (case-insensitive)
    MessageContains(Vec<String>),
    /// Message matches the regular expression
    MessageMatches(String),
    /// Fault code equals any of the values (case-insensitive)
    CodeEquals(Vec<String>),
    /// Fault name equals the value (case-insensitive)
    NameEquals(String),
    /// Context has a value for the key
    ContextHas(String),
    /// Context value for the key equals the JSON value
    ContextEquals { key: String, value: serde_json::Value },
    All(Vec<RuleCondition>),
    Any(Vec<RuleCondition>),
    Not(Box<RuleCondition>),
    /// Host predicate; not serialisable
    #[serde(skip)]
    Custom(CustomCondition),
}

impl RuleCondition {
    /// Convenience constructor for [`RuleCondition::MessageContains`]
    pub fn contains<I, S>(needles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RuleCondition::MessageContains(needles.into_iter().map(Into::into).collect())
    }

    /// Convenience constructor for [`RuleCondition::CodeEquals`]
    pub fn code<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RuleCondition::CodeEquals(codes.into_iter().map(Into::into).collect())
    }

    fn is_always(&self) -> bool {
        matches!(self, RuleCondition::Always)
    }

    fn evaluate(&self, fault: &Fault, context: &ErrorContext, regexes: &RegexCache) -> Result<bool> {
        match self {
            RuleCondition::Always => Ok(true),
            RuleCondition::MessageContains(needles) => {
                let message = fault.message.to_lowercase();
                Ok(needles.iter().any(|needle| message.contains(&needle.to_lowercase())))
            }
            RuleCondition::MessageMatches(pattern) => regexes.is_match(pattern, &fault.message),
            RuleCondition::CodeEquals(codes) => Ok(fault
                .code
                .as_deref()
                .map(|code| codes.iter().any(|c| c.eq_ignore_ascii_case(code)))
                .unwrap_or(false)),
            RuleCondition::NameEquals(name) => Ok(fault
                .name
                .as_deref()
                .map(|n| n.eq_ignore_ascii_case(name))
                .unwrap_or(false)),
            RuleCondition::ContextHas(key) => Ok(context.get(key).is_some()),
            RuleCondition::ContextEquals { key, value } => Ok(context.get(key).as_ref() == Some(value)),
            RuleCondition::All(conditions) => {
                for condition in conditions {
                    if !condition.evaluate(fault, context, regexes)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            RuleCondition::Any(conditions) => {
                for condition in conditions {
                    if condition.evaluate(fault, context, regexes)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            RuleCondition::Not(condition) => Ok(!condition.evaluate(fault, context, regexes)?),
            RuleCondition::Custom(custom) => {
                match catch_unwind(AssertUnwindSafe(|| custom.predicate.matches(fault, context))) {
                    Ok(result) => result,
                    Err(_) => Err(Error::Predicate(format!("custom predicate '{}' panicked", custom.name))),
                }
            }
        }
    }
}

/// Compiled regular expressions keyed by pattern
#[derive(Debug, Default)]
struct RegexCache {
    compiled: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn is_match(&self, pattern: &str, text: &str) -> Result<bool> {
        if let Some(regex) = self.compiled.read().get(pattern) {
            return Ok(regex.is_match(text));
        }

        let regex = Regex::new(pattern)
            .map_err(|e| Error::Predicate(format!("invalid pattern '{}': {}", pattern, e)))?;
        let matched = regex.is_match(text);
        self.compiled.write().insert(pattern.to_string(), regex);
        Ok(matched)
    }
}

/// A classification rule: a predicate plus the taxonomy it assigns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRule {
    /// Unique identifier
    pub id: String,
    /// Higher priorities are evaluated first
    pub priority: u32,
    pub condition: RuleCondition,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub error_type: ErrorType,
    pub recovery_strategy: RecoveryStrategy,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    pub retryable: bool,
    pub max_retries: u32,
    /// User-facing message; the category default is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ClassificationRule {
    /// Creates a rule classifying matches as SYSTEM/UNKNOWN/MEDIUM until refined
    pub fn new<S: Into<String>>(id: S, priority: u32, condition: RuleCondition) -> Self {
        Self {
            id: id.into(),
            priority,
            condition,
            severity: Severity::Medium,
            category: ErrorCategory::System,
            error_type: ErrorType::Unknown,
            recovery_strategy: RecoveryStrategy::None,
            suggested_actions: Vec::new(),
            retryable: false,
            max_retries: 0,
            user_message: None,
            tags: Vec::new(),
        }
    }

    /// Sets the taxonomy triple
    pub fn classify(mut self, severity: Severity, category: ErrorCategory, error_type: ErrorType) -> Self {
        self.severity = severity;
        self.category = category;
        self.error_type = error_type;
        self
    }

    pub fn strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.recovery_strategy = strategy;
        self
    }

    /// Marks matches as retryable up to `max_retries` times
    pub fn retryable(mut self, max_retries: u32) -> Self {
        self.retryable = true;
        self.max_retries = max_retries;
        self
    }

    pub fn actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggested_actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn user_message<S: Into<String>>(mut self, message: S) -> Self {
        self.user_message = Some(message.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    fn is_catch_all(&self) -> bool {
        self.priority == 0 && self.condition.is_always()
    }
}

/// The three renderings of a fault message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessages {
    /// The message as received
    pub raw: String,
    /// Taxonomy-prefixed message for operators
    pub technical: String,
    /// Sanitised message safe to show end users
    pub user: String,
}

/// A fault enriched with taxonomy and recovery metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub id: String,
    /// Rule that produced this classification
    pub rule_id: String,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub error_type: ErrorType,
    pub messages: ErrorMessages,
    pub code: Option<String>,
    pub context: ErrorContext,
    pub stack_trace: Option<String>,
    pub recovery_strategy: RecoveryStrategy,
    pub suggested_actions: Vec<String>,
    pub related_error_ids: Vec<String>,
    pub is_retryable: bool,
    pub max_retries: u32,
    /// The only field that changes after classification
    pub retry_count: u32,
    pub tags: Vec<String>,
    pub occurred_at: DateTime<Utc>,
    pub classified_at: DateTime<Utc>,
}

impl ClassifiedError {
    /// Whether another retry is still within the rule's budget
    pub fn can_retry(&self) -> bool {
        self.is_retryable && self.retry_count < self.max_retries
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.messages.technical)
    }
}

/// Oldest and newest retained classification times
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub oldest: DateTime<Utc>,
    pub newest: DateTime<Utc>,
}

/// Counts over the retained history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationStatistics {
    pub total: usize,
    pub by_severity: HashMap<Severity, usize>,
    pub by_category: HashMap<ErrorCategory, usize>,
    pub by_type: HashMap<ErrorType, usize>,
    pub by_recovery_strategy: HashMap<RecoveryStrategy, usize>,
    pub time_range: Option<TimeRange>,
}

/// Classifier tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Ring buffer capacity for classified errors
    pub max_history: usize,
    /// Window in which other errors may be reported as related
    pub related_window_secs: i64,
    /// Two errors of the same user within this window are related
    pub same_user_window_secs: i64,
    /// Upper bound on history entries scanned for relations
    pub related_scan_limit: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_history: 1000,
            related_window_secs: 300,
            same_user_window_secs: 60,
            related_scan_limit: 100,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_history == 0 {
            return Err(Error::InvalidConfig("classifier.max_history must be positive".into()));
        }
        if self.related_window_secs < 0 || self.same_user_window_secs < 0 {
            return Err(Error::InvalidConfig("classifier windows must not be negative".into()));
        }
        Ok(())
    }
}

/// Rule-based error classifier with a bounded history
pub struct ErrorClassifier {
    config: ClassifierConfig,
    /// Replaced copy-on-write so matching never holds the lock
    rules: RwLock<Arc<Vec<ClassificationRule>>>,
    history: RwLock<VecDeque<ClassifiedError>>,
    regexes: RegexCache,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl ErrorClassifier {
    /// Creates a classifier with the built-in rule set
    pub fn new(config: ClassifierConfig) -> Self {
        Self::with_rules(config, default_rules())
    }

    /// Creates a classifier with a custom rule set.
    ///
    /// A catch-all rule is appended when the set has none.
    pub fn with_rules(config: ClassifierConfig, mut rules: Vec<ClassificationRule>) -> Self {
        if !rules.iter().any(ClassificationRule::is_catch_all) {
            rules.push(generic_rule());
        }
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        Self {
            history: RwLock::new(VecDeque::with_capacity(config.max_history.min(1024))),
            config,
            rules: RwLock::new(Arc::new(rules)),
            regexes: RegexCache::default(),
            monitor: None,
        }
    }

    /// Attaches a performance monitor used to instrument classification time
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Classifies a fault. Never fails.
    pub fn classify_error(&self, fault: &Fault, context: &ErrorContext) -> ClassifiedError {
        let token = self
            .monitor
            .as_ref()
            .map(|monitor| monitor.start_operation(OperationKind::Classification));

        let rule = self.match_rule(fault, context);
        let mut classified = build_classified(&rule, fault, context);
        classified.related_error_ids = self.find_related(&classified);

        {
            let mut history = self.history.write();
            history.push_back(classified.clone());
            while history.len() > self.config.max_history {
                history.pop_front();
            }
        }

        monitoring::record_classification(&classified);
        debug!(
            error_id = %classified.id,
            rule = %classified.rule_id,
            severity = %classified.severity,
            category = %classified.category,
            error_type = %classified.error_type,
            related = classified.related_error_ids.len(),
            "Fault classified"
        );

        if let (Some(monitor), Some(token)) = (&self.monitor, token) {
            monitor.end_operation(token);
        }

        classified
    }

    fn match_rule(&self, fault: &Fault, context: &ErrorContext) -> ClassificationRule {
        // Custom predicates may call back into the classifier
        let rules = Arc::clone(&self.rules.read());
        for rule in rules.iter() {
            match rule.condition.evaluate(fault, context, &self.regexes) {
                Ok(true) => return rule.clone(),
                Ok(false) => {}
                Err(e) => {
                    warn!(rule = %rule.id, error = %e, "Rule predicate failed; treating as no match");
                    monitoring::record_predicate_failure(&rule.id);
                }
            }
        }
        // Only reachable if every catch-all predicate failed, which `Always` cannot
        generic_rule()
    }

    fn find_related(&self, classified: &ClassifiedError) -> Vec<String> {
        let window = ChronoDuration::seconds(self.config.related_window_secs);
        let user_window = ChronoDuration::seconds(self.config.same_user_window_secs);
        let history = self.history.read();

        history
            .iter()
            .rev()
            .take(self.config.related_scan_limit)
            .filter(|other| (classified.occurred_at - other.occurred_at).abs() <= window)
            .filter(|other| {
                let same_user = match (&classified.context.user_id, &other.context.user_id) {
                    (Some(a), Some(b)) => {
                        a == b && (classified.occurred_at - other.occurred_at).abs() <= user_window
                    }
                    _ => false,
                };
                let same_workflow = match (&classified.context.workflow_id, &other.context.workflow_id) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                };
                let same_message = classified.messages.raw == other.messages.raw;
                same_user || same_workflow || same_message
            })
            .map(|other| other.id.clone())
            .collect()
    }

    /// Adds a rule; duplicate ids are rejected
    pub fn add_rule(&self, rule: ClassificationRule) -> Result<()> {
        let mut guard = self.rules.write();
        if guard.iter().any(|existing| existing.id == rule.id) {
            return Err(Error::conflict("rule", rule.id));
        }
        let rules = Arc::make_mut(&mut *guard);

        info!(rule = %rule.id, priority = rule.priority, "Classification rule added");
        let position = rules
            .iter()
            .position(|existing| existing.priority < rule.priority)
            .unwrap_or(rules.len());
        rules.insert(position, rule);
        Ok(())
    }

    /// Removes a rule by id; returns whether one was removed.
    ///
    /// The last catch-all rule is kept.
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut guard = self.rules.write();
        let Some(index) = guard.iter().position(|rule| rule.id == rule_id) else {
            return false;
        };

        if guard[index].is_catch_all() && guard.iter().filter(|r| r.is_catch_all()).count() == 1 {
            warn!(rule = %rule_id, "Refusing to remove the last catch-all rule");
            return false;
        }

        Arc::make_mut(&mut *guard).remove(index);
        info!(rule = %rule_id, "Classification rule removed");
        true
    }

    /// Current rules in evaluation order
    pub fn rules(&self) -> Vec<ClassificationRule> {
        self.rules.read().as_ref().clone()
    }

    /// Serialises the rule set to JSON; fails if it contains custom predicates
    pub fn export_rules(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self.rules.read().as_slice())?)
    }

    /// Replaces the rule set from JSON produced by [`Self::export_rules`]
    pub fn import_rules(&self, json: &str) -> Result<usize> {
        let mut imported: Vec<ClassificationRule> = serde_json::from_str(json)?;

        let mut seen = std::collections::HashSet::new();
        for rule in &imported {
            if !seen.insert(rule.id.clone()) {
                return Err(Error::conflict("rule", rule.id.clone()));
            }
        }
        if !imported.iter().any(ClassificationRule::is_catch_all) {
            return Err(Error::InvalidConfig(
                "rule set must contain a priority-0 catch-all rule".into(),
            ));
        }

        imported.sort_by(|a, b| b.priority.cmp(&a.priority));
        let count = imported.len();
        *self.rules.write() = Arc::new(imported);
        info!(rules = count, "Classification rules imported");
        Ok(count)
    }

    /// Looks up a retained classified error
    pub fn get_error(&self, error_id: &str) -> Option<ClassifiedError> {
        self.history.read().iter().find(|e| e.id == error_id).cloned()
    }

    /// Most recent classified errors, newest first
    pub fn recent_errors(&self, limit: usize) -> Vec<ClassifiedError> {
        self.history.read().iter().rev().take(limit).cloned().collect()
    }

    /// Bumps the retry count of a retained error and returns the new value
    pub fn increment_retry_count(&self, error_id: &str) -> Option<u32> {
        let mut history = self.history.write();
        let error = history.iter_mut().find(|e| e.id == error_id)?;
        error.retry_count += 1;
        Some(error.retry_count)
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    pub fn clear_history(&self) {
        self.history.write().clear();
    }

    /// Counts partitioned by severity, category, type and recovery strategy
    pub fn get_statistics(&self) -> ClassificationStatistics {
        let history = self.history.read();
        let mut stats = ClassificationStatistics {
            total: history.len(),
            ..Default::default()
        };

        for error in history.iter() {
            *stats.by_severity.entry(error.severity).or_insert(0) += 1;
            *stats.by_category.entry(error.category).or_insert(0) += 1;
            *stats.by_type.entry(error.error_type).or_insert(0) += 1;
            *stats.by_recovery_strategy.entry(error.recovery_strategy).or_insert(0) += 1;
        }

        stats.time_range = match (history.front(), history.back()) {
            (Some(oldest), Some(newest)) => Some(TimeRange {
                oldest: oldest.classified_at,
                newest: newest.classified_at,
            }),
            _ => None,
        };

        stats
    }
}

impl fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("rules", &self.rules.read().len())
            .field("history", &self.history.read().len())
            .field("config", &self.config)
            .finish()
    }
}

fn build_classified(rule: &ClassificationRule, fault: &Fault, context: &ErrorContext) -> ClassifiedError {
    let mut technical = format!("[{}/{}] {}", rule.category, rule.error_type, fault.message);
    if let Some(code) = &fault.code {
        technical.push_str(&format!(" (Code: {})", code));
    }
    let user = rule
        .user_message
        .clone()
        .unwrap_or_else(|| rule.category.default_user_message().to_string());

    ClassifiedError {
        id: Uuid::new_v4().to_string(),
        rule_id: rule.id.clone(),
        severity: rule.severity,
        category: rule.category,
        error_type: rule.error_type,
        messages: ErrorMessages {
            raw: fault.message.clone(),
            technical,
            user: sanitize_message(&user),
        },
        code: fault.code.clone(),
        context: sanitize_context(context),
        stack_trace: fault.stack_trace.clone(),
        recovery_strategy: rule.recovery_strategy,
        suggested_actions: rule.suggested_actions.clone(),
        related_error_ids: Vec::new(),
        is_retryable: rule.retryable,
        max_retries: rule.max_retries,
        retry_count: 0,
        tags: rule.tags.clone(),
        occurred_at: fault.occurred_at,
        classified_at: Utc::now(),
    }
}

fn generic_rule() -> ClassificationRule {
    ClassificationRule::new(GENERIC_RULE_ID, 0, RuleCondition::Always)
        .classify(Severity::Medium, ErrorCategory::System, ErrorType::Unknown)
        .strategy(RecoveryStrategy::Escalate)
        .actions(["Check the system logs for details", "Contact support if the problem persists"])
        .tags(["unclassified"])
}

/// The built-in rule set, highest priority first
pub fn default_rules() -> Vec<ClassificationRule> {
    use ErrorCategory as C;
    use ErrorType as T;
    use RecoveryStrategy as S;
    use RuleCondition as R;
    use Severity as Sev;

    vec![
        ClassificationRule::new("auth-token-expired", 100, R::contains(["token expired", "jwt expired", "session expired"]))
            .classify(Sev::Medium, C::Authentication, T::TokenExpired)
            .strategy(S::Reconfigure)
            .retryable(1)
            .actions(["Refresh the access token", "Sign in again"])
            .user_message("Your session has expired. Please sign in again.")
            .tags(["auth"]),
        ClassificationRule::new(
            "auth-invalid-credentials",
            98,
            R::Any(vec![
                R::contains(["unauthorized", "invalid api key", "authentication failed", "invalid credentials"]),
                R::code(["401"]),
            ]),
        )
        .classify(Sev::High, C::Authentication, T::InvalidCredentials)
        .strategy(S::Reconfigure)
        .actions(["Verify the configured credentials", "Rotate the API key"])
        .tags(["auth"]),
        ClassificationRule::new(
            "auth-permission-denied",
            97,
            R::Any(vec![R::contains(["forbidden", "permission denied", "access denied"]), R::code(["403"])]),
        )
        .classify(Sev::High, C::Authentication, T::PermissionDenied)
        .strategy(S::Escalate)
        .actions(["Request access from an administrator"])
        .tags(["auth"]),
        ClassificationRule::new(
            "rate-limit",
            95,
            R::Any(vec![R::contains(["rate limit", "too many requests"]), R::code(["429"])]),
        )
        .classify(Sev::Medium, C::RateLimit, T::RateLimitExceeded)
        .strategy(S::RetryWithBackoff)
        .retryable(3)
        .actions(["Wait before retrying", "Reduce request frequency"])
        .tags(["throttling"]),
        ClassificationRule::new("quota-exceeded", 94, R::contains(["quota exceeded", "insufficient_quota", "billing"]))
            .classify(Sev::High, C::RateLimit, T::QuotaExceeded)
            .strategy(S::Escalate)
            .actions(["Check the account plan and usage limits"])
            .tags(["throttling"]),
        ClassificationRule::new(
            "network-connection-refused",
            92,
            R::Any(vec![R::contains(["econnrefused", "connection refused"]), R::code(["ECONNREFUSED"])]),
        )
        .classify(Sev::High, C::Network, T::ConnectionRefused)
        .strategy(S::RetryWithBackoff)
        .retryable(5)
        .actions(["Verify the target service is running", "Check host and port configuration"])
        .tags(["network", "transient"]),
        ClassificationRule::new(
            "network-dns",
            91,
            R::Any(vec![R::contains(["enotfound", "getaddrinfo", "dns lookup"]), R::code(["ENOTFOUND"])]),
        )
        .classify(Sev::High, C::Network, T::DnsResolution)
        .strategy(S::RetryWithBackoff)
        .retryable(3)
        .actions(["Check the hostname", "Verify DNS configuration"])
        .tags(["network"]),
        ClassificationRule::new(
            "network-connection-reset",
            90,
            R::Any(vec![R::contains(["econnreset", "socket hang up", "connection reset"]), R::code(["ECONNRESET"])]),
        )
        .classify(Sev::Medium, C::Network, T::ConnectionReset)
        .strategy(S::Retry)
        .retryable(5)
        .actions(["Retry the request"])
        .tags(["network", "transient"]),
        ClassificationRule::new(
            "timeout",
            88,
            R::Any(vec![R::contains(["timeout", "timed out", "etimedout"]), R::code(["ETIMEDOUT"])]),
        )
        .classify(Sev::Medium, C::Timeout, T::RequestTimeout)
        .strategy(S::RetryWithBackoff)
        .retryable(3)
        .actions(["Retry with a longer timeout", "Split the work into smaller requests"])
        .tags(["transient"]),
        ClassificationRule::new(
            "ai-context-length",
            86,
            R::contains(["context length", "maximum context", "token limit", "too many tokens"]),
        )
        .classify(Sev::High, C::AiService, T::ContextLengthExceeded)
        .strategy(S::UserIntervention)
        .actions(["Shorten the prompt", "Summarise earlier input"])
        .tags(["ai"]),
        ClassificationRule::new(
            "ai-service-unavailable",
            85,
            R::All(vec![
                R::contains(["model", "llm", "openai", "anthropic", "ai service"]),
                R::contains(["unavailable", "overloaded", "503", "not found"]),
            ]),
        )
        .classify(Sev::High, C::AiService, T::ModelUnavailable)
        .strategy(S::Fallback)
        .retryable(2)
        .actions(["Switch to a fallback model", "Retry later"])
        .tags(["ai", "transient"]),
        ClassificationRule::new(
            "workflow-invalid-structure",
            80,
            R::All(vec![
                R::contains(["workflow"]),
                R::contains(["invalid", "structure", "malformed"]),
            ]),
        )
        .classify(Sev::High, C::WorkflowGeneration, T::InvalidStructure)
        .strategy(S::UserIntervention)
        .actions(["Validate the workflow definition", "Regenerate the workflow"])
        .user_message("The workflow structure is invalid. Please review the workflow and try again.")
        .tags(["workflow"]),
        ClassificationRule::new("workflow-missing-node", 78, R::contains(["missing node", "node not found", "unknown node type"]))
            .classify(Sev::High, C::WorkflowGeneration, T::MissingNode)
            .strategy(S::UserIntervention)
            .actions(["Add the missing node", "Check node type names"])
            .tags(["workflow"]),
        ClassificationRule::new(
            "workflow-invalid-connection",
            76,
            R::contains(["invalid connection", "connection between nodes", "dangling connection"]),
        )
        .classify(Sev::Medium, C::WorkflowGeneration, T::InvalidConnection)
        .strategy(S::UserIntervention)
        .actions(["Reconnect the affected nodes"])
        .tags(["workflow"]),
        ClassificationRule::new(
            "node-execution",
            70,
            R::contains(["node execution failed", "failed to execute node", "execution of node"]),
        )
        .classify(Sev::Medium, C::NodeExecution, T::NodeFailure)
        .strategy(S::Retry)
        .retryable(2)
        .actions(["Inspect the node input", "Re-run the node"])
        .tags(["workflow"]),
        ClassificationRule::new(
            "resource-out-of-memory",
            60,
            R::Any(vec![
                R::contains(["out of memory", "heap limit", "allocation failed"]),
                R::code(["ENOMEM"]),
            ]),
        )
        .classify(Sev::Critical, C::Resource, T::OutOfMemory)
        .strategy(S::Escalate)
        .actions(["Reduce batch sizes", "Increase available memory"])
        .tags(["resource"]),
        ClassificationRule::new(
            "configuration-missing",
            55,
            R::contains(["missing configuration", "not configured", "environment variable", "config"]),
        )
        .classify(Sev::High, C::Configuration, T::MissingConfiguration)
        .strategy(S::Reconfigure)
        .actions(["Review the configuration", "Set the required environment variables"])
        .tags(["configuration"]),
        ClassificationRule::new(
            "validation",
            50,
            R::contains(["validation", "invalid input", "required field", "must be"]),
        )
        .classify(Sev::Low, C::Validation, T::InvalidInput)
        .strategy(S::UserIntervention)
        .actions(["Correct the highlighted input"])
        .tags(["input"]),
        ClassificationRule::new(
            "data-parse",
            45,
            R::contains(["json", "parse", "unexpected token", "syntax error"]),
        )
        .classify(Sev::Medium, C::DataProcessing, T::ParseFailure)
        .strategy(S::UserIntervention)
        .actions(["Check the data format"])
        .tags(["data"]),
        ClassificationRule::new("network-generic", 40, R::contains(["network", "connection"]))
            .classify(Sev::Medium, C::Network, T::ConnectionReset)
            .strategy(S::RetryWithBackoff)
            .retryable(3)
            .actions(["Check network connectivity"])
            .tags(["network"]),
        generic_rule(),
    ]
}
