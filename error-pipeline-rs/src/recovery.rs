//! # Recovery Manager
//!
//! Turns a classified error into a ranked [`RecoveryPlan`] and executes
//! actions from it.
//!
//! Strategies are registered with applicability rules and an
//! [`ActionGenerator`]. Plan generation merges the candidates of every
//! applicable strategy, removes duplicates, ranks them and drops actions
//! whose preconditions the [`RecoveryContext`] does not meet. Execution
//! dispatches on [`ActionType`]; retry, fallback and alternative actions
//! are carried out by the host's [`ActionExecutor`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Serialize, Deserialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classifier::ClassifiedError;
use crate::events::{EventBus, Subscription};
use crate::monitoring;
use crate::performance::{OperationKind, PerformanceMonitor};
use crate::retry::{RetryConfig, RetryPolicy, RetryResult};
use crate::taxonomy::{ErrorCategory, ErrorType, Severity};
use crate::types::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Retry,
    Fallback,
    Alternative,
    Manual,
    Escalate,
    Abort,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Retry => "retry",
            ActionType::Fallback => "fallback",
            ActionType::Alternative => "alternative",
            ActionType::Manual => "manual",
            ActionType::Escalate => "escalate",
            ActionType::Abort => "abort",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserExperience {
    Beginner,
    Intermediate,
    Expert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

/// Connection quality, from worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Offline,
    Poor,
    Fair,
    Good,
    Excellent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConstraints {
    /// Load as a fraction of capacity (0.0 - 1.0)
    pub system_load: Option<f64>,
    pub memory_available_mb: Option<u64>,
    /// Time the caller is willing to spend on recovery
    pub time_budget_ms: Option<u64>,
}

/// What is known about the situation a recovery is requested in
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub user_role: Option<String>,
    pub user_experience: Option<UserExperience>,
    pub environment: Option<Environment>,
    pub resources: Option<ResourceConstraints>,
    pub network_quality: Option<NetworkQuality>,
    pub workflow_criticality: Option<Criticality>,
    #[serde(default)]
    pub previous_failures: u32,
}

impl RecoveryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role<S: Into<String>>(mut self, role: S) -> Self {
        self.user_role = Some(role.into());
        self
    }

    pub fn experience(mut self, experience: UserExperience) -> Self {
        self.user_experience = Some(experience);
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn system_load(mut self, load: f64) -> Self {
        self.resources.get_or_insert_with(Default::default).system_load = Some(load);
        self
    }

    pub fn network(mut self, quality: NetworkQuality) -> Self {
        self.network_quality = Some(quality);
        self
    }

    pub fn criticality(mut self, criticality: Criticality) -> Self {
        self.workflow_criticality = Some(criticality);
        self
    }

    pub fn previous_failures(mut self, failures: u32) -> Self {
        self.previous_failures = failures;
        self
    }

    fn system_load_value(&self) -> Option<f64> {
        self.resources.as_ref().and_then(|r| r.system_load)
    }
}

/// Preconditions an action places on the recovery context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionConditions {
    pub max_system_load: Option<f64>,
    pub min_network_quality: Option<NetworkQuality>,
    /// Excluded once the error has been retried this many times
    pub max_retry_count: Option<u32>,
}

/// A single remediation step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub id: String,
    pub action_type: ActionType,
    pub priority: u32,
    pub description: String,
    pub user_message: String,
    pub estimated_duration_ms: u64,
    pub success_probability: f64,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub conditions: ActionConditions,
    /// Strategy that produced the action
    pub strategy_id: String,
}

impl RecoveryAction {
    /// Whether the action's preconditions hold for this error and context
    pub fn is_feasible(&self, error: &ClassifiedError, context: &RecoveryContext) -> bool {
        if self.action_type == ActionType::Retry && error.retry_count >= error.max_retries {
            return false;
        }
        if let Some(max) = self.conditions.max_retry_count {
            if error.retry_count >= max {
                return false;
            }
        }
        if let (Some(max), Some(load)) = (self.conditions.max_system_load, context.system_load_value()) {
            if load > max {
                return false;
            }
        }
        if let (Some(min), Some(quality)) = (self.conditions.min_network_quality, context.network_quality) {
            if quality < min {
                return false;
            }
        }
        true
    }

    fn parameter_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(|value| value.as_u64())
    }
}

/// Blueprint for actions produced by [`TemplateActions`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub action_type: ActionType,
    pub priority: u32,
    pub description: String,
    pub user_message: String,
    pub estimated_duration_ms: u64,
    pub success_probability: f64,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub conditions: ActionConditions,
}

impl ActionTemplate {
    pub fn new<D, U>(action_type: ActionType, priority: u32, description: D, user_message: U) -> Self
    where
        D: Into<String>,
        U: Into<String>,
    {
        Self {
            action_type,
            priority,
            description: description.into(),
            user_message: user_message.into(),
            estimated_duration_ms: 1_000,
            success_probability: 0.5,
            parameters: serde_json::Map::new(),
            conditions: ActionConditions::default(),
        }
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = ms;
        self
    }

    pub fn probability(mut self, probability: f64) -> Self {
        self.success_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn param<K: Into<String>>(mut self, key: K, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn max_system_load(mut self, load: f64) -> Self {
        self.conditions.max_system_load = Some(load);
        self
    }

    pub fn min_network(mut self, quality: NetworkQuality) -> Self {
        self.conditions.min_network_quality = Some(quality);
        self
    }

    pub fn max_retry_count(mut self, count: u32) -> Self {
        self.conditions.max_retry_count = Some(count);
        self
    }
}

/// Produces candidate actions for an error
pub trait ActionGenerator: Send + Sync {
    fn generate(&self, error: &ClassifiedError, context: &RecoveryContext) -> Vec<RecoveryAction>;
}

/// Generator that instantiates a fixed list of templates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateActions {
    pub templates: Vec<ActionTemplate>,
}

impl TemplateActions {
    pub fn new(templates: Vec<ActionTemplate>) -> Self {
        Self { templates }
    }
}

impl ActionGenerator for TemplateActions {
    fn generate(&self, _error: &ClassifiedError, _context: &RecoveryContext) -> Vec<RecoveryAction> {
        self.templates
            .iter()
            .map(|template| RecoveryAction {
                id: Uuid::new_v4().to_string(),
                action_type: template.action_type,
                priority: template.priority,
                description: template.description.clone(),
                user_message: template.user_message.clone(),
                estimated_duration_ms: template.estimated_duration_ms,
                success_probability: template.success_probability,
                parameters: template.parameters.clone(),
                conditions: template.conditions.clone(),
                strategy_id: String::new(),
            })
            .collect()
    }
}

/// A registered recovery strategy
#[derive(Clone)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    /// Free-form grouping label used in metrics
    pub category: String,
    pub priority: u32,
    /// Empty lists match everything
    pub categories: Vec<ErrorCategory>,
    pub error_types: Vec<ErrorType>,
    pub severities: Vec<Severity>,
    pub roles: Vec<String>,
    pub environments: Vec<Environment>,
    generator: Arc<dyn ActionGenerator>,
}

impl Strategy {
    pub fn new<I, N, C>(id: I, name: N, category: C, priority: u32, generator: Arc<dyn ActionGenerator>) -> Self
    where
        I: Into<String>,
        N: Into<String>,
        C: Into<String>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            category: category.into(),
            priority,
            categories: Vec::new(),
            error_types: Vec::new(),
            severities: Vec::new(),
            roles: Vec::new(),
            environments: Vec::new(),
            generator,
        }
    }

    /// Strategy backed by [`TemplateActions`]
    pub fn from_templates<I, N, C>(id: I, name: N, category: C, priority: u32, templates: Vec<ActionTemplate>) -> Self
    where
        I: Into<String>,
        N: Into<String>,
        C: Into<String>,
    {
        Self::new(id, name, category, priority, Arc::new(TemplateActions::new(templates)))
    }

    pub fn for_categories<I: IntoIterator<Item = ErrorCategory>>(mut self, categories: I) -> Self {
        self.categories = categories.into_iter().collect();
        self
    }

    pub fn for_types<I: IntoIterator<Item = ErrorType>>(mut self, types: I) -> Self {
        self.error_types = types.into_iter().collect();
        self
    }

    pub fn for_severities<I: IntoIterator<Item = Severity>>(mut self, severities: I) -> Self {
        self.severities = severities.into_iter().collect();
        self
    }

    pub fn for_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn for_environments<I: IntoIterator<Item = Environment>>(mut self, environments: I) -> Self {
        self.environments = environments.into_iter().collect();
        self
    }

    /// Whether the strategy handles this error in this context
    pub fn applies_to(&self, error: &ClassifiedError, context: &RecoveryContext) -> bool {
        fn admits<T: PartialEq>(allowed: &[T], value: &T) -> bool {
            allowed.is_empty() || allowed.contains(value)
        }

        let role_ok = self.roles.is_empty()
            || context
                .user_role
                .as_ref()
                .map(|role| self.roles.iter().any(|r| r.eq_ignore_ascii_case(role)))
                .unwrap_or(false);
        let environment_ok = self.environments.is_empty()
            || context
                .environment
                .map(|env| self.environments.contains(&env))
                .unwrap_or(false);

        admits(&self.categories, &error.category)
            && admits(&self.error_types, &error.error_type)
            && admits(&self.severities, &error.severity)
            && role_ok
            && environment_ok
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("priority", &self.priority)
            .finish()
    }
}

/// A ranked set of actions for one error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub id: String,
    pub error_id: String,
    pub context: RecoveryContext,
    /// Feasible actions, highest priority first
    pub actions: Vec<RecoveryAction>,
    pub recommended_action: RecoveryAction,
    pub alternatives: Vec<RecoveryAction>,
    pub estimated_total_time_ms: u64,
    pub success_probability: f64,
    pub guidance: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RecoveryPlan {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn action(&self, action_id: &str) -> Option<&RecoveryAction> {
        self.actions.iter().find(|action| action.id == action_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptResult {
    Success,
    Failure,
    Partial,
    Abandoned,
}

impl AttemptResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptResult::Success => "success",
            AttemptResult::Failure => "failure",
            AttemptResult::Partial => "partial",
            AttemptResult::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for AttemptResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one action execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub plan_id: String,
    pub action_id: String,
    pub error_id: String,
    pub action_type: ActionType,
    pub strategy_id: String,
    /// Category label of the originating strategy
    pub strategy_category: String,
    pub result: AttemptResult,
    pub duration_ms: u64,
    /// Handler invocations made
    pub invocations: u32,
    pub notes: Option<String>,
}

/// Performs retry, fallback and alternative actions on behalf of the host
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Carries out the action once; the returned text is kept as notes
    async fn execute(&self, action: &RecoveryAction, plan: &RecoveryPlan) -> Result<Option<String>>;
}

/// Executor that acknowledges every action without doing anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExecutor;

#[async_trait]
impl ActionExecutor for NoopExecutor {
    async fn execute(&self, action: &RecoveryAction, _plan: &RecoveryPlan) -> Result<Option<String>> {
        debug!(action_id = %action.id, action_type = %action.action_type, "No executor configured; action acknowledged");
        Ok(None)
    }
}

/// Notifications published by the manager
#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    PlanGenerated { plan_id: String, error_id: String, actions: usize },
    /// An escalate action ran
    Escalated { plan_id: String, error_id: String, action: RecoveryAction },
    AttemptRecorded(RecoveryAttempt),
}

/// Success figures for one strategy category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySuccess {
    pub category: String,
    pub attempts: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub partial: u64,
    pub abandoned: u64,
    pub mean_duration_ms: f64,
    /// Best five strategy categories by success rate
    pub top_categories: Vec<CategorySuccess>,
}

/// Recovery manager tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// How long a plan stays executable
    pub plan_ttl_secs: i64,
    /// Attempts kept in history
    pub max_history: usize,
    pub max_alternatives: usize,
    /// Defaults for retry actions; actions may override `max_attempts` and `backoff_ms`
    pub retry: RetryConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            plan_ttl_secs: 30 * 60,
            max_history: 5000,
            max_alternatives: 3,
            retry: RetryConfig::default(),
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.plan_ttl_secs <= 0 {
            return Err(Error::InvalidConfig("recovery.plan_ttl_secs must be positive".into()));
        }
        if self.max_history == 0 {
            return Err(Error::InvalidConfig("recovery.max_history must be positive".into()));
        }
        self.retry.validate()
    }
}

/// Strategy registry, plan store and action runner
pub struct RecoveryManager {
    config: RecoveryConfig,
    strategies: RwLock<Vec<Strategy>>,
    plans: RwLock<HashMap<String, RecoveryPlan>>,
    history: RwLock<VecDeque<RecoveryAttempt>>,
    executor: Arc<dyn ActionExecutor>,
    monitor: Option<Arc<PerformanceMonitor>>,
    events: EventBus<RecoveryEvent>,
}

impl RecoveryManager {
    /// Creates a manager with the built-in strategies
    pub fn new(config: RecoveryConfig, executor: Arc<dyn ActionExecutor>) -> Result<Self> {
        let manager = Self::empty(config, executor)?;
        for strategy in default_strategies() {
            manager.register_strategy(strategy)?;
        }
        Ok(manager)
    }

    /// Creates a manager without any strategies
    pub fn empty(config: RecoveryConfig, executor: Arc<dyn ActionExecutor>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            strategies: RwLock::new(Vec::new()),
            plans: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            executor,
            monitor: None,
            events: EventBus::new("recovery"),
        })
    }

    /// Attaches a performance monitor used to instrument recovery work
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Registers a strategy; duplicate ids are rejected
    pub fn register_strategy(&self, strategy: Strategy) -> Result<()> {
        let mut strategies = self.strategies.write();
        if strategies.iter().any(|existing| existing.id == strategy.id) {
            return Err(Error::conflict("strategy", strategy.id));
        }

        debug!(strategy = %strategy.id, priority = strategy.priority, "Recovery strategy registered");
        let position = strategies
            .iter()
            .position(|existing| existing.priority < strategy.priority)
            .unwrap_or(strategies.len());
        strategies.insert(position, strategy);
        Ok(())
    }

    /// Removes a strategy; returns whether one was removed
    pub fn unregister_strategy(&self, strategy_id: &str) -> bool {
        let mut strategies = self.strategies.write();
        let before = strategies.len();
        strategies.retain(|strategy| strategy.id != strategy_id);
        before != strategies.len()
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        self.strategies.read().iter().map(|s| s.id.clone()).collect()
    }

    /// Builds and stores a plan for the error
    pub fn generate_recovery_plan(&self, error: &ClassifiedError, context: RecoveryContext) -> Result<RecoveryPlan> {
        let token = self
            .monitor
            .as_ref()
            .map(|monitor| monitor.start_operation(OperationKind::Recovery));
        let result = self.build_plan(error, context);
        if let (Some(monitor), Some(token)) = (&self.monitor, token) {
            monitor.end_operation(token);
        }

        let plan = result?;
        self.purge_expired_plans();
        self.plans.write().insert(plan.id.clone(), plan.clone());
        info!(
            plan_id = %plan.id,
            error_id = %plan.error_id,
            actions = plan.actions.len(),
            recommended = %plan.recommended_action.action_type,
            probability = plan.success_probability,
            "Recovery plan generated"
        );
        self.events.publish(&RecoveryEvent::PlanGenerated {
            plan_id: plan.id.clone(),
            error_id: plan.error_id.clone(),
            actions: plan.actions.len(),
        });
        Ok(plan)
    }

    fn build_plan(&self, error: &ClassifiedError, context: RecoveryContext) -> Result<RecoveryPlan> {
        let mut candidates = Vec::new();
        let mut seen = HashSet::new();
        // Generators run outside the registry lock
        let applicable: Vec<Strategy> = self
            .strategies
            .read()
            .iter()
            .filter(|s| s.applies_to(error, &context))
            .cloned()
            .collect();
        for strategy in &applicable {
            for mut action in strategy.generator.generate(error, &context) {
                if !seen.insert((action.action_type, action.description.clone())) {
                    continue;
                }
                action.strategy_id = strategy.id.clone();
                candidates.push(action);
            }
        }

        // Stable sort keeps strategy order among equal priorities
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        let total = candidates.len();
        let actions: Vec<RecoveryAction> = candidates
            .into_iter()
            .filter(|action| action.is_feasible(error, &context))
            .collect();

        debug!(error_id = %error.id, candidates = total, feasible = actions.len(), "Recovery candidates filtered");

        let Some(recommended) = actions.first().cloned() else {
            warn!(error_id = %error.id, candidates = total, "No feasible recovery action");
            return Err(Error::NoFeasibleAction { error_id: error.id.clone() });
        };
        let alternatives: Vec<RecoveryAction> = actions
            .iter()
            .skip(1)
            .take(self.config.max_alternatives)
            .cloned()
            .collect();

        let mut probability = recommended.success_probability;
        if context.previous_failures > 2 {
            probability *= 0.8;
        }
        match context.network_quality {
            Some(NetworkQuality::Excellent) => probability *= 1.1,
            Some(NetworkQuality::Poor) => probability *= 0.7,
            _ => {}
        }
        let probability = probability.clamp(0.0, 1.0);

        let created_at = Utc::now();
        Ok(RecoveryPlan {
            id: Uuid::new_v4().to_string(),
            error_id: error.id.clone(),
            guidance: guidance(&recommended, alternatives.len(), probability, context.user_experience),
            estimated_total_time_ms: (recommended.estimated_duration_ms as f64 * 1.2).round() as u64,
            success_probability: probability,
            recommended_action: recommended,
            alternatives,
            actions,
            context,
            created_at,
            expires_at: created_at + ChronoDuration::seconds(self.config.plan_ttl_secs),
        })
    }

    pub fn get_plan(&self, plan_id: &str) -> Option<RecoveryPlan> {
        self.plans.read().get(plan_id).cloned()
    }

    /// Drops expired plans; returns how many were removed
    pub fn purge_expired_plans(&self) -> usize {
        let mut plans = self.plans.write();
        let before = plans.len();
        plans.retain(|_, plan| !plan.is_expired());
        let removed = before - plans.len();
        if removed > 0 {
            debug!(removed, "Expired recovery plans purged");
        }
        removed
    }

    /// Executes one action of a stored plan and records exactly one attempt
    pub async fn execute_recovery_action(&self, plan_id: &str, action_id: &str) -> Result<RecoveryAttempt> {
        let plan = self
            .get_plan(plan_id)
            .ok_or_else(|| Error::not_found("plan", plan_id))?;
        if plan.is_expired() {
            return Err(Error::PlanExpired {
                plan_id: plan.id.clone(),
                expired_at: plan.expires_at,
            });
        }
        let action = plan
            .action(action_id)
            .cloned()
            .ok_or_else(|| Error::not_found("action", action_id))?;

        let started = Instant::now();
        let token = self
            .monitor
            .as_ref()
            .map(|monitor| monitor.start_operation(OperationKind::Recovery));

        let (result, invocations, notes) = self.run_action(&plan, &action).await;

        if let (Some(monitor), Some(token)) = (&self.monitor, token) {
            monitor.end_operation(token);
        }

        let strategy_category = self
            .strategies
            .read()
            .iter()
            .find(|s| s.id == action.strategy_id)
            .map(|s| s.category.clone())
            .unwrap_or_else(|| "unregistered".to_string());

        let attempt = RecoveryAttempt {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            plan_id: plan.id.clone(),
            action_id: action.id.clone(),
            error_id: plan.error_id.clone(),
            action_type: action.action_type,
            strategy_id: action.strategy_id.clone(),
            strategy_category,
            result,
            duration_ms: started.elapsed().as_millis() as u64,
            invocations,
            notes,
        };
        self.record_attempt(attempt.clone());
        Ok(attempt)
    }

    async fn run_action(&self, plan: &RecoveryPlan, action: &RecoveryAction) -> (AttemptResult, u32, Option<String>) {
        match action.action_type {
            ActionType::Retry => {
                let mut policy = RetryPolicy::new(format!("recovery.{}", action.strategy_id), Some(self.config.retry.clone()));
                if let Some(attempts) = action.parameter_u64("max_attempts") {
                    policy = policy.with_max_attempts(attempts.min(u32::MAX as u64) as u32);
                }
                if let Some(backoff) = action.parameter_u64("backoff_ms") {
                    policy = policy.with_base_backoff(Duration::from_millis(backoff));
                }

                let outcome = policy
                    .retry(&action.description, |_| self.invoke(action, plan))
                    .await;
                match outcome {
                    RetryResult::Success { value, attempts } => (AttemptResult::Success, attempts, value),
                    RetryResult::Failure { error, attempts } => (
                        AttemptResult::Failure,
                        attempts,
                        Some(format!("failed after {} attempts: {}", attempts, error)),
                    ),
                }
            }
            ActionType::Fallback | ActionType::Alternative => match self.invoke(action, plan).await {
                Ok(notes) => (AttemptResult::Success, 1, notes),
                Err(error) => (AttemptResult::Failure, 1, Some(error.to_string())),
            },
            ActionType::Manual => (
                AttemptResult::Partial,
                0,
                Some(format!("Awaiting user action: {}", action.user_message)),
            ),
            ActionType::Escalate => {
                warn!(plan_id = %plan.id, error_id = %plan.error_id, action = %action.description, "Recovery escalated");
                self.events.publish(&RecoveryEvent::Escalated {
                    plan_id: plan.id.clone(),
                    error_id: plan.error_id.clone(),
                    action: action.clone(),
                });
                (AttemptResult::Success, 0, Some("Escalation notified".to_string()))
            }
            ActionType::Abort => (AttemptResult::Abandoned, 0, Some(action.description.clone())),
        }
    }

    /// One executor call with panics turned into errors
    async fn invoke(&self, action: &RecoveryAction, plan: &RecoveryPlan) -> Result<Option<String>> {
        match std::panic::AssertUnwindSafe(self.executor.execute(action, plan))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(action_id = %action.id, panic = %message, "Recovery action handler panicked");
                Err(Error::Action(format!("handler panicked: {}", message)))
            }
        }
    }

    fn record_attempt(&self, attempt: RecoveryAttempt) {
        info!(
            attempt_id = %attempt.id,
            plan_id = %attempt.plan_id,
            action_type = %attempt.action_type,
            result = %attempt.result,
            duration_ms = attempt.duration_ms,
            "Recovery attempt recorded"
        );
        monitoring::record_recovery_attempt(attempt.action_type.as_str(), attempt.result.as_str(), attempt.duration_ms);

        {
            let mut history = self.history.write();
            history.push_back(attempt.clone());
            while history.len() > self.config.max_history {
                history.pop_front();
            }
        }
        self.events.publish(&RecoveryEvent::AttemptRecorded(attempt));
    }

    pub fn attempts_for_plan(&self, plan_id: &str) -> Vec<RecoveryAttempt> {
        self.history
            .read()
            .iter()
            .filter(|attempt| attempt.plan_id == plan_id)
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    /// Aggregates over the retained attempt history
    pub fn metrics(&self) -> RecoveryMetrics {
        let history = self.history.read();
        let mut metrics = RecoveryMetrics {
            total: history.len() as u64,
            ..Default::default()
        };
        let mut per_category: HashMap<&str, (u64, u64)> = HashMap::new();
        let mut total_duration = 0u64;

        for attempt in history.iter() {
            match attempt.result {
                AttemptResult::Success => metrics.successes += 1,
                AttemptResult::Failure => metrics.failures += 1,
                AttemptResult::Partial => metrics.partial += 1,
                AttemptResult::Abandoned => metrics.abandoned += 1,
            }
            total_duration += attempt.duration_ms;

            let entry = per_category.entry(attempt.strategy_category.as_str()).or_insert((0, 0));
            entry.0 += 1;
            if attempt.result == AttemptResult::Success {
                entry.1 += 1;
            }
        }

        if metrics.total > 0 {
            metrics.mean_duration_ms = total_duration as f64 / metrics.total as f64;
        }

        let mut categories: Vec<CategorySuccess> = per_category
            .into_iter()
            .map(|(category, (attempts, successes))| CategorySuccess {
                category: category.to_string(),
                attempts,
                success_rate: successes as f64 / attempts as f64,
            })
            .collect();
        categories.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then(b.attempts.cmp(&a.attempts))
                .then(a.category.cmp(&b.category))
        });
        categories.truncate(5);
        metrics.top_categories = categories;

        metrics
    }

    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RecoveryEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }
}

impl fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("strategies", &self.strategies.read().len())
            .field("plans", &self.plans.read().len())
            .field("history", &self.history.read().len())
            .finish()
    }
}

fn guidance(
    recommended: &RecoveryAction,
    alternatives: usize,
    probability: f64,
    experience: Option<UserExperience>,
) -> String {
    match experience {
        Some(UserExperience::Beginner) => {
            let mut text = format!("{} We will guide you through the next step.", recommended.user_message);
            if alternatives > 0 {
                text.push_str(" If that does not help, other options are available.");
            }
            text
        }
        Some(UserExperience::Expert) => format!(
            "{}: {} (p={:.0}%, {} alternatives)",
            recommended.action_type,
            recommended.description,
            probability * 100.0,
            alternatives
        ),
        Some(UserExperience::Intermediate) | None => format!(
            "Recommended: {}. {} alternative(s) available.",
            recommended.description, alternatives
        ),
    }
}

/// The built-in strategies
pub fn default_strategies() -> Vec<Strategy> {
    use ActionType as A;
    use serde_json::json;

    vec![
        Strategy::from_templates(
            "network-recovery",
            "Network recovery",
            "network",
            90,
            vec![
                ActionTemplate::new(A::Retry, 90, "Retry the request with exponential backoff", "Retrying the connection...")
                    .duration_ms(3_000)
                    .probability(0.7)
                    .param("max_attempts", json!(3))
                    .param("backoff_ms", json!(500))
                    .min_network(NetworkQuality::Poor),
                ActionTemplate::new(A::Alternative, 60, "Switch to a backup endpoint", "Trying an alternative service endpoint.")
                    .duration_ms(2_000)
                    .probability(0.5)
                    .min_network(NetworkQuality::Fair),
                ActionTemplate::new(A::Manual, 30, "Check network connectivity and service status", "Please check your network connection.")
                    .duration_ms(60_000)
                    .probability(0.8),
            ],
        )
        .for_categories([ErrorCategory::Network, ErrorCategory::Timeout]),
        Strategy::from_templates(
            "rate-limit-recovery",
            "Rate limit recovery",
            "throttling",
            85,
            vec![
                ActionTemplate::new(A::Retry, 85, "Wait for the rate limit window and retry", "Waiting for the rate limit to reset...")
                    .duration_ms(30_000)
                    .probability(0.8)
                    .param("max_attempts", json!(2))
                    .param("backoff_ms", json!(5_000)),
                ActionTemplate::new(A::Fallback, 55, "Queue the request for deferred execution", "Your request has been queued and will run shortly.")
                    .duration_ms(60_000)
                    .probability(0.6),
                ActionTemplate::new(A::Manual, 20, "Review plan limits and usage", "You have reached a usage limit. Please review your plan.")
                    .duration_ms(300_000)
                    .probability(0.9),
            ],
        )
        .for_categories([ErrorCategory::RateLimit]),
        Strategy::from_templates(
            "authentication-recovery",
            "Authentication recovery",
            "auth",
            80,
            vec![
                ActionTemplate::new(A::Manual, 80, "Re-authenticate and refresh credentials", "Please sign in again or update your credentials.")
                    .duration_ms(60_000)
                    .probability(0.9),
                ActionTemplate::new(A::Escalate, 40, "Ask an administrator to grant access", "An administrator has been notified.")
                    .duration_ms(600_000)
                    .probability(0.7),
            ],
        )
        .for_categories([ErrorCategory::Authentication]),
        Strategy::from_templates(
            "ai-service-recovery",
            "AI service recovery",
            "ai",
            80,
            vec![
                ActionTemplate::new(A::Fallback, 85, "Switch to a fallback model", "Switching to an alternative AI model.")
                    .duration_ms(5_000)
                    .probability(0.75)
                    .min_network(NetworkQuality::Fair),
                ActionTemplate::new(A::Alternative, 70, "Reduce the prompt size and resubmit", "Simplifying the request and trying again.")
                    .duration_ms(8_000)
                    .probability(0.6),
                ActionTemplate::new(A::Retry, 60, "Retry the AI request", "Retrying the AI request...")
                    .duration_ms(10_000)
                    .probability(0.5)
                    .param("max_attempts", json!(2))
                    .max_system_load(0.9),
            ],
        )
        .for_categories([ErrorCategory::AiService]),
        Strategy::from_templates(
            "workflow-repair",
            "Workflow repair",
            "workflow",
            75,
            vec![
                ActionTemplate::new(A::Manual, 80, "Review and correct the workflow definition", "Please review the highlighted parts of your workflow.")
                    .duration_ms(120_000)
                    .probability(0.85),
                ActionTemplate::new(A::Alternative, 70, "Regenerate the workflow from a simplified request", "Regenerating the workflow with a simpler structure.")
                    .duration_ms(15_000)
                    .probability(0.6)
                    .max_system_load(0.8),
                ActionTemplate::new(A::Abort, 10, "Cancel workflow generation", "Workflow generation was cancelled.")
                    .duration_ms(0)
                    .probability(1.0),
            ],
        )
        .for_categories([ErrorCategory::WorkflowGeneration, ErrorCategory::Validation]),
        Strategy::from_templates(
            "node-execution-recovery",
            "Node execution recovery",
            "execution",
            70,
            vec![
                ActionTemplate::new(A::Retry, 80, "Re-run the failed node", "Re-running the failed step...")
                    .duration_ms(5_000)
                    .probability(0.6)
                    .max_system_load(0.9),
                ActionTemplate::new(A::Alternative, 50, "Skip the node and continue the workflow", "Skipping the failed step.")
                    .duration_ms(1_000)
                    .probability(0.7)
                    .max_retry_count(3),
                ActionTemplate::new(A::Manual, 40, "Inspect the node configuration and input data", "Please check the step's configuration and input.")
                    .duration_ms(120_000)
                    .probability(0.8),
            ],
        )
        .for_categories([ErrorCategory::NodeExecution, ErrorCategory::DataProcessing]),
        Strategy::from_templates(
            "resource-relief",
            "Resource relief",
            "resource",
            65,
            vec![
                ActionTemplate::new(A::Fallback, 75, "Reduce workload and batch sizes", "Reducing workload to free resources.")
                    .duration_ms(10_000)
                    .probability(0.6),
                ActionTemplate::new(A::Escalate, 70, "Notify operations about resource exhaustion", "The operations team has been notified.")
                    .duration_ms(300_000)
                    .probability(0.8),
            ],
        )
        .for_categories([ErrorCategory::Resource, ErrorCategory::Configuration]),
        Strategy::from_templates(
            "generic-recovery",
            "Generic recovery",
            "generic",
            0,
            vec![
                ActionTemplate::new(A::Retry, 40, "Retry the operation", "Retrying...")
                    .duration_ms(2_000)
                    .probability(0.4),
                ActionTemplate::new(A::Manual, 30, "Check the logs for details", "Something went wrong. Please try again or check the details.")
                    .duration_ms(60_000)
                    .probability(0.5),
                ActionTemplate::new(A::Escalate, 20, "Contact support", "Support has been notified.")
                    .duration_ms(3_600_000)
                    .probability(0.9),
                ActionTemplate::new(A::Abort, 5, "Abort the operation", "The operation was cancelled.")
                    .duration_ms(0)
                    .probability(1.0),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierConfig, ErrorClassifier};
    use crate::context::{ErrorContext, Fault};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn classified(message: &str) -> ClassifiedError {
        ErrorClassifier::new(ClassifierConfig::default()).classify_error(&Fault::new(message), &ErrorContext::new())
    }

    fn fast_config() -> RecoveryConfig {
        RecoveryConfig {
            retry: RetryConfig {
                max_attempts: 3,
                base_backoff_ms: 1,
                max_backoff_ms: 2,
                jitter_factor: 0.0,
                attempt_timeout_ms: Some(1_000),
            },
            ..Default::default()
        }
    }

    fn manager() -> RecoveryManager {
        RecoveryManager::new(fast_config(), Arc::new(NoopExecutor)).unwrap()
    }

    struct FlakyExecutor {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActionExecutor for FlakyExecutor {
        async fn execute(&self, _action: &RecoveryAction, _plan: &RecoveryPlan) -> Result<Option<String>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(Error::Action(format!("call {} failed", call)))
            } else {
                Ok(Some("recovered".to_string()))
            }
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl ActionExecutor for PanickingExecutor {
        async fn execute(&self, _action: &RecoveryAction, _plan: &RecoveryPlan) -> Result<Option<String>> {
            panic!("handler bug")
        }
    }

    fn action_of(plan: &RecoveryPlan, action_type: ActionType) -> RecoveryAction {
        plan.actions
            .iter()
            .find(|a| a.action_type == action_type)
            .cloned()
            .unwrap_or_else(|| panic!("plan has no {} action", action_type))
    }

    #[test]
    fn test_network_plan() {
        let manager = manager();
        let error = classified("ECONNREFUSED network connection failed");
        let plan = manager.generate_recovery_plan(&error, RecoveryContext::new()).unwrap();

        assert_eq!(plan.recommended_action.action_type, ActionType::Retry);
        assert_eq!(plan.recommended_action.strategy_id, "network-recovery");
        assert_eq!(plan.actions[0], plan.recommended_action);
        assert!(plan.alternatives.len() <= 3);
        assert_eq!(plan.estimated_total_time_ms, 3_600);
        assert!((plan.success_probability - 0.7).abs() < 1e-9);
        assert_eq!(plan.expires_at - plan.created_at, ChronoDuration::minutes(30));

        let priorities: Vec<u32> = plan.actions.iter().map(|a| a.priority).collect();
        assert!(priorities.windows(2).all(|w| w[0] >= w[1]));
        assert!(manager.get_plan(&plan.id).is_some());
    }

    #[test]
    fn test_actions_are_deduplicated() {
        let manager = manager();
        manager
            .register_strategy(Strategy::from_templates(
                "duplicate",
                "Duplicate",
                "network",
                95,
                vec![ActionTemplate::new(ActionType::Retry, 99, "Retry the operation", "again")],
            ))
            .unwrap();

        let plan = manager.generate_recovery_plan(&classified("xyz123"), RecoveryContext::new()).unwrap();
        let keys: Vec<(ActionType, &str)> = plan
            .actions
            .iter()
            .map(|a| (a.action_type, a.description.as_str()))
            .collect();
        let unique: HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
    }

    #[test]
    fn test_probability_adjustments() {
        let manager = manager();
        let error = classified("ECONNREFUSED");

        let plan = manager
            .generate_recovery_plan(&error, RecoveryContext::new().previous_failures(3))
            .unwrap();
        assert!((plan.success_probability - 0.56).abs() < 1e-9);

        let plan = manager
            .generate_recovery_plan(&error, RecoveryContext::new().network(NetworkQuality::Excellent))
            .unwrap();
        assert!((plan.success_probability - 0.77).abs() < 1e-9);

        let plan = manager
            .generate_recovery_plan(&error, RecoveryContext::new().network(NetworkQuality::Poor))
            .unwrap();
        assert!((plan.success_probability - 0.49).abs() < 1e-9);
    }

    #[test]
    fn test_feasibility_filter() {
        let manager = manager();
        let mut error = classified("ECONNREFUSED");
        error.retry_count = error.max_retries;

        let plan = manager
            .generate_recovery_plan(&error, RecoveryContext::new().network(NetworkQuality::Offline))
            .unwrap();
        assert!(plan.actions.iter().all(|a| a.action_type != ActionType::Retry));
        assert!(plan.actions.iter().all(|a| a.description != "Switch to a backup endpoint"));
        for action in &plan.actions {
            assert!(action.is_feasible(&error, &plan.context));
        }
    }

    #[test]
    fn test_no_feasible_action() {
        let manager = RecoveryManager::empty(fast_config(), Arc::new(NoopExecutor)).unwrap();
        manager
            .register_strategy(Strategy::from_templates(
                "retry-only",
                "Retry only",
                "test",
                10,
                vec![ActionTemplate::new(ActionType::Retry, 10, "Retry", "Retrying")],
            ))
            .unwrap();

        let error = classified("Workflow structure is invalid, missing node");
        let result = manager.generate_recovery_plan(&error, RecoveryContext::new());
        assert!(matches!(result, Err(Error::NoFeasibleAction { .. })));
    }

    #[test]
    fn test_strategy_registry() {
        let manager = manager();
        let duplicate = Strategy::from_templates("generic-recovery", "Again", "generic", 1, Vec::new());
        assert!(matches!(manager.register_strategy(duplicate), Err(Error::Conflict { .. })));

        assert!(manager.unregister_strategy("generic-recovery"));
        assert!(!manager.unregister_strategy("generic-recovery"));
        assert!(!manager.strategy_ids().contains(&"generic-recovery".to_string()));
    }

    #[test]
    fn test_context_requirements() {
        let strategy = Strategy::from_templates("ops", "Ops", "ops", 10, Vec::new())
            .for_roles(["admin"])
            .for_environments([Environment::Production])
            .for_severities([Severity::Critical]);
        let mut error = classified("xyz123");
        error.severity = Severity::Critical;

        let ctx = RecoveryContext::new().role("Admin").environment(Environment::Production);
        assert!(strategy.applies_to(&error, &ctx));
        assert!(!strategy.applies_to(&error, &RecoveryContext::new().role("admin")));
        assert!(!strategy.applies_to(&error, &ctx.clone().environment(Environment::Staging)));
    }

    #[test]
    fn test_guidance_by_experience() {
        let manager = manager();
        let error = classified("ECONNREFUSED");

        let beginner = manager
            .generate_recovery_plan(&error, RecoveryContext::new().experience(UserExperience::Beginner))
            .unwrap();
        assert!(beginner.guidance.starts_with("Retrying the connection..."));

        let expert = manager
            .generate_recovery_plan(&error, RecoveryContext::new().experience(UserExperience::Expert))
            .unwrap();
        assert!(expert.guidance.starts_with("retry: Retry the request"));
        assert!(expert.guidance.contains("p=70%"));
    }

    #[tokio::test]
    async fn test_retry_action_succeeds_after_failures() {
        let executor = Arc::new(FlakyExecutor { failures_before_success: 2, calls: AtomicU32::new(0) });
        let manager = RecoveryManager::new(fast_config(), executor.clone()).unwrap();
        let plan = manager.generate_recovery_plan(&classified("ECONNREFUSED"), RecoveryContext::new()).unwrap();
        let action = action_of(&plan, ActionType::Retry);

        let attempt = manager.execute_recovery_action(&plan.id, &action.id).await.unwrap();
        assert_eq!(attempt.result, AttemptResult::Success);
        assert_eq!(attempt.invocations, 3);
        assert_eq!(attempt.notes.as_deref(), Some("recovered"));
        assert_eq!(attempt.strategy_category, "network");
        assert_eq!(manager.attempts_for_plan(&plan.id).len(), 1);
    }

    #[tokio::test]
    async fn test_retry_action_is_bounded() {
        let executor = Arc::new(FlakyExecutor { failures_before_success: u32::MAX, calls: AtomicU32::new(0) });
        let manager = RecoveryManager::new(fast_config(), executor.clone()).unwrap();
        let plan = manager.generate_recovery_plan(&classified("ECONNREFUSED"), RecoveryContext::new()).unwrap();
        let action = action_of(&plan, ActionType::Retry);

        let attempt = manager.execute_recovery_action(&plan.id, &action.id).await.unwrap();
        assert_eq!(attempt.result, AttemptResult::Failure);
        assert_eq!(attempt.invocations, 3);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panicking_handler_yields_one_attempt() {
        let manager = RecoveryManager::new(fast_config(), Arc::new(PanickingExecutor)).unwrap();
        let plan = manager.generate_recovery_plan(&classified("model overloaded"), RecoveryContext::new()).unwrap();
        let action = action_of(&plan, ActionType::Fallback);

        let attempt = manager.execute_recovery_action(&plan.id, &action.id).await.unwrap();
        assert_eq!(attempt.result, AttemptResult::Failure);
        assert!(attempt.notes.unwrap().contains("handler bug"));
        assert_eq!(manager.history_len(), 1);
    }

    #[tokio::test]
    async fn test_non_executor_actions() {
        let manager = manager();
        let escalations = Arc::new(AtomicU32::new(0));
        let counter = escalations.clone();
        let _sub = manager.on_event(move |event| {
            if matches!(event, RecoveryEvent::Escalated { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let plan = manager.generate_recovery_plan(&classified("xyz123"), RecoveryContext::new()).unwrap();

        let manual = manager
            .execute_recovery_action(&plan.id, &action_of(&plan, ActionType::Manual).id)
            .await
            .unwrap();
        assert_eq!(manual.result, AttemptResult::Partial);

        let escalate = manager
            .execute_recovery_action(&plan.id, &action_of(&plan, ActionType::Escalate).id)
            .await
            .unwrap();
        assert_eq!(escalate.result, AttemptResult::Success);
        assert_eq!(escalations.load(Ordering::SeqCst), 1);

        let abort = manager
            .execute_recovery_action(&plan.id, &action_of(&plan, ActionType::Abort).id)
            .await
            .unwrap();
        assert_eq!(abort.result, AttemptResult::Abandoned);

        assert_eq!(manager.attempts_for_plan(&plan.id).len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_and_expired_plans() {
        let manager = manager();
        assert!(matches!(
            manager.execute_recovery_action("missing", "a").await,
            Err(Error::NotFound { kind: "plan", .. })
        ));

        let plan = manager.generate_recovery_plan(&classified("xyz123"), RecoveryContext::new()).unwrap();
        assert!(matches!(
            manager.execute_recovery_action(&plan.id, "missing").await,
            Err(Error::NotFound { kind: "action", .. })
        ));

        let short = RecoveryManager::new(RecoveryConfig { plan_ttl_secs: 1, ..fast_config() }, Arc::new(NoopExecutor)).unwrap();
        let plan = short.generate_recovery_plan(&classified("xyz123"), RecoveryContext::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let result = short.execute_recovery_action(&plan.id, &plan.recommended_action.id).await;
        assert!(matches!(result, Err(Error::PlanExpired { .. })));
        assert_eq!(short.history_len(), 0);
        assert_eq!(short.purge_expired_plans(), 1);
        assert!(short.get_plan(&plan.id).is_none());
    }

    #[tokio::test]
    async fn test_generating_a_plan_drops_expired_ones() {
        let manager = RecoveryManager::new(RecoveryConfig { plan_ttl_secs: 1, ..fast_config() }, Arc::new(NoopExecutor)).unwrap();
        let stale = manager.generate_recovery_plan(&classified("xyz123"), RecoveryContext::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let fresh = manager.generate_recovery_plan(&classified("ECONNREFUSED"), RecoveryContext::new()).unwrap();
        assert!(manager.get_plan(&stale.id).is_none());
        assert!(manager.get_plan(&fresh.id).is_some());
        assert_eq!(manager.purge_expired_plans(), 0);
    }

    /// Mutates the registry of the manager that invokes it
    struct ReentrantGenerator {
        manager: std::sync::OnceLock<std::sync::Weak<RecoveryManager>>,
        calls: AtomicU32,
    }

    impl ActionGenerator for ReentrantGenerator {
        fn generate(&self, error: &ClassifiedError, context: &RecoveryContext) -> Vec<RecoveryAction> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(manager) = self.manager.get().and_then(|weak| weak.upgrade()) {
                manager.unregister_strategy("network-recovery");
            }
            TemplateActions::new(vec![ActionTemplate::new(ActionType::Manual, 90, "Check the registry", "Checking.")])
                .generate(error, context)
        }
    }

    #[test]
    fn test_generator_may_modify_registry() {
        let manager = Arc::new(manager());
        let generator = Arc::new(ReentrantGenerator {
            manager: std::sync::OnceLock::new(),
            calls: AtomicU32::new(0),
        });
        let _ = generator.manager.set(Arc::downgrade(&manager));
        manager
            .register_strategy(Strategy::new("reentrant", "Reentrant", "test", 200, generator.clone()))
            .unwrap();

        let plan = manager.generate_recovery_plan(&classified("ECONNREFUSED"), RecoveryContext::new()).unwrap();
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert!(plan.actions.iter().any(|a| a.strategy_id == "reentrant"));
        assert!(!manager.strategy_ids().contains(&"network-recovery".to_string()));
    }

    #[tokio::test]
    async fn test_metrics() {
        let manager = manager();
        let plan = manager.generate_recovery_plan(&classified("xyz123"), RecoveryContext::new()).unwrap();
        for action_type in [ActionType::Manual, ActionType::Abort] {
            let action = action_of(&plan, action_type);
            manager.execute_recovery_action(&plan.id, &action.id).await.unwrap();
        }

        let network = manager.generate_recovery_plan(&classified("ECONNREFUSED"), RecoveryContext::new()).unwrap();
        manager
            .execute_recovery_action(&network.id, &network.recommended_action.id)
            .await
            .unwrap();

        let metrics = manager.metrics();
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.partial, 1);
        assert_eq!(metrics.abandoned, 1);
        assert_eq!(metrics.top_categories.len(), 2);
        assert_eq!(metrics.top_categories[0].category, "network");
        assert_eq!(metrics.top_categories[0].success_rate, 1.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let manager = RecoveryManager::new(RecoveryConfig { max_history: 2, ..fast_config() }, Arc::new(NoopExecutor)).unwrap();
        for i in 0..4 {
            manager.record_attempt(RecoveryAttempt {
                id: format!("a-{}", i),
                timestamp: Utc::now(),
                plan_id: "p".into(),
                action_id: "x".into(),
                error_id: "e".into(),
                action_type: ActionType::Abort,
                strategy_id: "s".into(),
                strategy_category: "c".into(),
                result: AttemptResult::Abandoned,
                duration_ms: 0,
                invocations: 0,
                notes: None,
            });
        }
        assert_eq!(manager.history_len(), 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn quality() -> impl proptest::strategy::Strategy<Value = Option<NetworkQuality>> {
            proptest::option::of(prop_oneof![
                Just(NetworkQuality::Offline),
                Just(NetworkQuality::Poor),
                Just(NetworkQuality::Fair),
                Just(NetworkQuality::Good),
                Just(NetworkQuality::Excellent),
            ])
        }

        proptest! {
            #[test]
            fn plans_contain_only_feasible_actions(
                message in prop_oneof![
                    Just("ECONNREFUSED"),
                    Just("rate limit exceeded"),
                    Just("model overloaded"),
                    Just("node execution failed"),
                    Just("out of memory"),
                    Just("xyz123"),
                ],
                retry_count in 0u32..8,
                load in proptest::option::of(0.0f64..1.0),
                network in quality(),
                failures in 0u32..6,
            ) {
                let manager = manager();
                let mut error = classified(message);
                error.retry_count = retry_count;

                let mut context = RecoveryContext::new().previous_failures(failures);
                if let Some(load) = load {
                    context = context.system_load(load);
                }
                context.network_quality = network;

                if let Ok(plan) = manager.generate_recovery_plan(&error, context.clone()) {
                    for action in &plan.actions {
                        prop_assert!(action.is_feasible(&error, &context));
                    }
                    prop_assert!(plan.actions.contains(&plan.recommended_action));
                    prop_assert!(plan.alternatives.len() <= 3);
                    prop_assert!((0.0..=1.0).contains(&plan.success_probability));
                }
            }
        }
    }
}
