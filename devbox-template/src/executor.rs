//! Runs a template's actions against one workspace account.
//!
//! A run is validated up front without side effects. Actions then execute in ascending
//! `order`; one whose dependencies have not succeeded yet is deferred and reconsidered
//! after every completion. A fatal failure aborts the run and rolls back every
//! succeeded action in reverse completion order.

// Standard library
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// External crates
use devbox_core::{ErrorKind, ProvisionError, Result, System};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

// Internal imports
use crate::condition::Condition;
use crate::context::{references, value_references, ExecutionContext};
use crate::error::ActionError;
use crate::handler::{ActionContext, ActionHandler, ActionResult};
use crate::model::{ActionDefinition, ActionType, Params, RollbackBehavior, Template};
use crate::registry::HandlerRegistry;

pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-attempt time limits.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionTimeouts {
    pub default: Duration,
    pub per_type: BTreeMap<ActionType, Duration>,
}

impl Default for ActionTimeouts {
    fn default() -> Self {
        Self {
            default: DEFAULT_ACTION_TIMEOUT,
            per_type: BTreeMap::new(),
        }
    }
}

impl ActionTimeouts {
    pub fn with_type(mut self, action_type: ActionType, timeout: Duration) -> Self {
        self.per_type.insert(action_type, timeout);
        self
    }

    /// The action's own override, else the per-type value, else the default.
    pub fn for_action(&self, action: &ActionDefinition) -> Duration {
        action
            .timeout_secs
            .map(Duration::from_secs)
            .or_else(|| self.per_type.get(&action.action_type).copied())
            .unwrap_or(self.default)
    }
}

/// The account a run acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountTarget {
    pub username: String,
    pub home_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Aborted,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRecord {
    pub action_id: String,
    pub action_type: ActionType,
    pub state: ActionState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Outputs with secret values redacted.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackFailure {
    pub action_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted {
        action_id: String,
        kind: ErrorKind,
        attempts: u32,
        reason: String,
    },
}

/// Everything that happened during one run.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateRunReport {
    pub template_id: String,
    pub outcome: RunOutcome,
    pub actions: Vec<ActionRecord>,
    pub rollback_failures: Vec<RollbackFailure>,
    /// `workspace_file` of the template after substitution, on success.
    pub workspace_file: Option<PathBuf>,
    pub context: ExecutionContext,
}

impl TemplateRunReport {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    pub fn record(&self, action_id: &str) -> Option<&ActionRecord> {
        self.actions.iter().find(|r| r.action_id == action_id)
    }

    /// The typed error for an aborted run.
    pub fn error(&self) -> Option<ProvisionError> {
        match &self.outcome {
            RunOutcome::Completed => None,
            RunOutcome::Aborted {
                action_id,
                kind: ErrorKind::ActionValidation,
                reason,
                ..
            } => Some(ProvisionError::ActionValidation {
                action_id: action_id.clone(),
                reason: reason.clone(),
            }),
            RunOutcome::Aborted {
                action_id,
                attempts,
                reason,
                ..
            } => Some(ProvisionError::ActionExecution {
                action_id: action_id.clone(),
                attempts: *attempts,
                reason: reason.clone(),
            }),
        }
    }

    pub fn warnings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.actions.iter().flat_map(|r| {
            r.warnings
                .iter()
                .map(move |w| (r.action_id.as_str(), w.as_str()))
        })
    }
}

fn validation_error(action_id: &str, reason: impl Into<String>) -> ProvisionError {
    ProvisionError::ActionValidation {
        action_id: action_id.to_string(),
        reason: reason.into(),
    }
}

enum Dependencies {
    Ready,
    Waiting,
    Blocked(String),
}

struct Completed {
    index: usize,
    params: Params,
    result: ActionResult,
}

/// Executes templates with an injected handler registry.
pub struct TemplateExecutor {
    registry: Arc<HandlerRegistry>,
    system: Arc<dyn System>,
    timeouts: ActionTimeouts,
}

impl TemplateExecutor {
    pub fn new(registry: Arc<HandlerRegistry>, system: Arc<dyn System>) -> Self {
        Self {
            registry,
            system,
            timeouts: ActionTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: ActionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    fn handler(&self, action: &ActionDefinition) -> Result<&dyn ActionHandler> {
        self.registry.get(action.action_type).ok_or_else(|| {
            validation_error(
                &action.id,
                format!("no handler registered for '{}'", action.action_type),
            )
        })
    }

    /// Check a template against the seed context without touching the system.
    pub fn validate(&self, template: &Template, seed: &ExecutionContext) -> Result<()> {
        let mut ids = HashSet::new();
        for action in &template.actions {
            let valid_id = !action.id.is_empty()
                && action
                    .id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid_id {
                return Err(validation_error(&action.id, "invalid action id"));
            }
            if !ids.insert(action.id.as_str()) {
                return Err(validation_error(&action.id, "duplicate action id"));
            }
        }

        // Variable name -> ids of the actions that publish it.
        let mut providers: HashMap<String, Vec<&str>> = HashMap::new();
        for action in &template.actions {
            let handler = self.handler(action)?;
            for key in handler.provides() {
                for name in [format!("{}.{}", action.id, key), key.to_string()] {
                    providers.entry(name).or_default().push(action.id.as_str());
                }
            }
        }
        let resolvable = |name: &str, action_id: &str| {
            seed.contains(name)
                || providers
                    .get(name)
                    .is_some_and(|ids| ids.iter().any(|id| *id != action_id))
        };

        for action in &template.actions {
            for dep in &action.depends_on {
                if dep == &action.id {
                    return Err(validation_error(&action.id, "action depends on itself"));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(validation_error(
                        &action.id,
                        format!("unknown dependency '{}'", dep),
                    ));
                }
            }

            self.handler(action)?
                .validate(&action.parameters)
                .map_err(|e| validation_error(&action.id, e.to_string()))?;

            let mut names = value_references(&Value::Object(action.parameters.clone()));
            if let Some(source) = &action.condition {
                let condition = Condition::parse(source).map_err(|e| {
                    validation_error(&action.id, format!("invalid condition: {}", e))
                })?;
                names.extend(condition.references());
            }
            if let Some(name) = names.iter().find(|n| !resolvable(n.as_str(), action.id.as_str())) {
                return Err(validation_error(
                    &action.id,
                    format!("undefined variable '${{{}}}'", name),
                ));
            }
        }

        if let Some(file) = &template.workspace_file {
            if let Some(name) = references(file).into_iter().find(|n| !resolvable(n.as_str(), "")) {
                return Err(validation_error(
                    "workspace_file",
                    format!("undefined variable '${{{}}}'", name),
                ));
            }
        }
        Ok(())
    }

    /// Validate and run `template`. Pre-flight problems are returned as
    /// `ActionValidation` errors before anything runs; everything after that is
    /// described by the report.
    #[instrument(skip_all, fields(template_id = %template.id, username = %target.username))]
    pub fn run(
        &self,
        template: &Template,
        target: &AccountTarget,
        seed: ExecutionContext,
    ) -> Result<TemplateRunReport> {
        self.validate(template, &seed)?;
        info!(actions = template.actions.len(), "Running template");

        let actions = &template.actions;
        let index: HashMap<&str, usize> = actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.as_str(), i))
            .collect();
        let mut order: Vec<usize> = (0..actions.len()).collect();
        order.sort_by_key(|&i| actions[i].order);

        let mut ctx = seed;
        let mut records: Vec<ActionRecord> = actions
            .iter()
            .map(|a| ActionRecord {
                action_id: a.id.clone(),
                action_type: a.action_type,
                state: ActionState::Pending,
                attempts: 0,
                warnings: Vec::new(),
                error: None,
                outputs: BTreeMap::new(),
            })
            .collect();
        let mut completed: Vec<Completed> = Vec::new();
        let mut outcome = RunOutcome::Completed;

        'schedule: loop {
            let mut progressed = false;
            for &i in &order {
                if records[i].state != ActionState::Pending {
                    continue;
                }
                let action = &actions[i];
                match dependency_status(action, &index, &records) {
                    Dependencies::Waiting => continue,
                    Dependencies::Blocked(dep) => {
                        let reason = format!("dependency '{}' did not succeed", dep);
                        info!(action_id = %action.id, "{}; skipping", reason);
                        records[i].state = ActionState::Skipped;
                        records[i].error = Some(reason.clone());
                        if action.fatal_on_error {
                            records[i].state = ActionState::Aborted;
                            outcome = RunOutcome::Aborted {
                                action_id: action.id.clone(),
                                kind: ErrorKind::ActionExecution,
                                attempts: 0,
                                reason,
                            };
                            break 'schedule;
                        }
                    }
                    Dependencies::Ready => {
                        if let Some(aborted) =
                            self.run_action(action, target, &mut ctx, &mut records[i], i, &mut completed)
                        {
                            outcome = aborted;
                            break 'schedule;
                        }
                    }
                }
                progressed = true;
                break;
            }

            if !progressed {
                // Whatever is still pending waits on itself through a cycle.
                for &i in &order {
                    if records[i].state != ActionState::Pending {
                        continue;
                    }
                    let action = &actions[i];
                    warn!(action_id = %action.id, "Dependency cycle; skipping");
                    records[i].state = ActionState::Skipped;
                    records[i].error = Some("dependency cycle".to_string());
                    if action.fatal_on_error && outcome == RunOutcome::Completed {
                        records[i].state = ActionState::Aborted;
                        outcome = RunOutcome::Aborted {
                            action_id: action.id.clone(),
                            kind: ErrorKind::ActionExecution,
                            attempts: 0,
                            reason: "dependency cycle".to_string(),
                        };
                    }
                }
                break;
            }
        }

        let mut rollback_failures = Vec::new();
        if let RunOutcome::Aborted { action_id, reason, .. } = &outcome {
            warn!(action_id = %action_id, reason = %reason, "Template aborted; rolling back");
            rollback_failures = self.rollback(actions, target, &ctx, &mut records, &completed);
        }

        let workspace_file = match (&outcome, &template.workspace_file) {
            (RunOutcome::Completed, Some(file)) => match ctx.substitute(file) {
                Ok(path) => Some(PathBuf::from(path)),
                Err(name) => {
                    warn!(variable = %name, "workspace_file references an undefined variable");
                    None
                }
            },
            _ => None,
        };

        info!(
            success = outcome == RunOutcome::Completed,
            context_keys = ?ctx.keys().collect::<Vec<_>>(),
            "Template run finished"
        );
        Ok(TemplateRunReport {
            template_id: template.id.clone(),
            outcome,
            actions: records,
            rollback_failures,
            workspace_file,
            context: ctx,
        })
    }

    /// Run one ready action. Returns the abort outcome if the run must stop.
    fn run_action(
        &self,
        action: &ActionDefinition,
        target: &AccountTarget,
        ctx: &mut ExecutionContext,
        record: &mut ActionRecord,
        index: usize,
        completed: &mut Vec<Completed>,
    ) -> Option<RunOutcome> {
        record.state = ActionState::Running;

        if let Some(source) = &action.condition {
            match Condition::parse(source) {
                Ok(condition) if !condition.evaluate(ctx) => {
                    info!(action_id = %action.id, condition = %source, "Condition false; skipping");
                    record.state = ActionState::Skipped;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    return self.fail(action, record, ActionError::invalid(format!("invalid condition: {}", e)));
                }
            }
        }

        let handler = match self.handler(action) {
            Ok(handler) => handler,
            Err(e) => return self.fail(action, record, ActionError::invalid(e.to_string())),
        };

        let params = match ctx.substitute_value(&Value::Object(action.parameters.clone())) {
            Ok(Value::Object(params)) => params,
            Ok(_) => Params::new(),
            Err(name) => {
                return self.fail(
                    action,
                    record,
                    ActionError::invalid(format!("undefined variable '${{{}}}'", name)),
                )
            }
        };
        if let Err(e) = handler.validate(&params) {
            return self.fail(action, record, e);
        }

        let timeout = self.timeouts.for_action(action);
        let max_attempts = action.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            record.attempts = attempt;
            debug!(action_id = %action.id, attempt, max_attempts, "Executing action");

            let action_ctx = ActionContext {
                action_id: &action.id,
                params: &params,
                vars: ctx,
                username: &target.username,
                home_dir: &target.home_dir,
                system: self.system.as_ref(),
                deadline: Instant::now() + timeout,
            };
            match handler.execute(&action_ctx) {
                Ok(result) => {
                    ctx.add_outputs(&action.id, &result.outputs, &result.secret_outputs);
                    record.state = ActionState::Succeeded;
                    record.warnings = result.warnings.clone();
                    record.outputs = result.redacted_outputs();
                    if result.skipped {
                        info!(action_id = %action.id, "Nothing to do");
                    } else {
                        info!(action_id = %action.id, action_type = %action.action_type, attempts = attempt, "Action succeeded");
                    }
                    completed.push(Completed {
                        index,
                        params,
                        result,
                    });
                    return None;
                }
                Err(e) => {
                    warn!(action_id = %action.id, attempt, max_attempts, error = %e, "Action attempt failed");
                    let retry = e.is_retryable() && attempt < max_attempts;
                    last_error = Some(e);
                    if !retry {
                        break;
                    }
                    thread::sleep(action.retry.delay_before(attempt + 1));
                }
            }
        }

        let error = last_error.unwrap_or_else(|| ActionError::failed("no attempt was made"));
        self.fail(action, record, error)
    }

    /// Record a failed action; abort if it is fatal.
    fn fail(
        &self,
        action: &ActionDefinition,
        record: &mut ActionRecord,
        error: ActionError,
    ) -> Option<RunOutcome> {
        let kind = match error {
            ActionError::Invalid(_) => ErrorKind::ActionValidation,
            _ => ErrorKind::ActionExecution,
        };
        record.state = ActionState::Failed;
        record.error = Some(error.to_string());

        if !action.fatal_on_error {
            warn!(action_id = %action.id, error = %error, "Non-fatal action failed; continuing");
            return None;
        }
        record.state = ActionState::Aborted;
        Some(RunOutcome::Aborted {
            action_id: action.id.clone(),
            kind,
            attempts: record.attempts,
            reason: error.to_string(),
        })
    }

    /// Roll back succeeded actions newest first. Failures are collected, never propagated.
    fn rollback(
        &self,
        actions: &[ActionDefinition],
        target: &AccountTarget,
        ctx: &ExecutionContext,
        records: &mut [ActionRecord],
        completed: &[Completed],
    ) -> Vec<RollbackFailure> {
        let mut failures = Vec::new();
        for done in completed.iter().rev() {
            let action = &actions[done.index];
            if action.rollback == RollbackBehavior::Skip {
                debug!(action_id = %action.id, "Rollback skipped by definition");
                continue;
            }
            let Ok(handler) = self.handler(action) else {
                continue;
            };

            let action_ctx = ActionContext {
                action_id: &action.id,
                params: &done.params,
                vars: ctx,
                username: &target.username,
                home_dir: &target.home_dir,
                system: self.system.as_ref(),
                deadline: Instant::now() + self.timeouts.for_action(action),
            };
            match handler.rollback(&action_ctx, &done.result) {
                Ok(()) => {
                    info!(action_id = %action.id, "Rolled back");
                    records[done.index].state = ActionState::RolledBack;
                }
                Err(e) => {
                    warn!(action_id = %action.id, error = %e, "Rollback failed");
                    failures.push(RollbackFailure {
                        action_id: action.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        failures
    }
}

fn dependency_status(
    action: &ActionDefinition,
    index: &HashMap<&str, usize>,
    records: &[ActionRecord],
) -> Dependencies {
    let mut waiting = false;
    for dep in &action.depends_on {
        let Some(&i) = index.get(dep.as_str()) else {
            return Dependencies::Blocked(dep.clone());
        };
        match records[i].state {
            ActionState::Succeeded => {}
            ActionState::Pending | ActionState::Running => waiting = true,
            _ => return Dependencies::Blocked(dep.clone()),
        }
    }
    if waiting {
        Dependencies::Waiting
    } else {
        Dependencies::Ready
    }
}
