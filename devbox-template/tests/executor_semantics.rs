//! Scheduling, retry and rollback semantics of the executor, observed through a
//! recording handler so the assertions do not depend on any real action type.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use devbox_core::fake::FakeSystem;
use devbox_core::ProvisionError;
use devbox_template::{
    AccountTarget, ActionContext, ActionDefinition, ActionError, ActionHandler, ActionResult,
    ActionState, ActionType, ExecutionContext, HandlerRegistry, ParamSpec, RetryPolicy,
    RollbackBehavior, RunOutcome, Template, TemplateExecutor,
};

/// Records `exec:<id>` / `rollback:<id>` and fails on demand.
#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<String>>,
    failures_left: Mutex<HashMap<String, u64>>,
}

impl RecordingHandler {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

impl ActionHandler for RecordingHandler {
    fn action_type(&self) -> ActionType {
        ActionType::RunScript
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        &[]
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[
            ParamSpec::bool("fail"),
            ParamSpec::integer("fail_times"),
            ParamSpec::bool("invalid"),
            ParamSpec::string("value"),
        ];
        PARAMS
    }

    fn provides(&self) -> &'static [&'static str] {
        &["value"]
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("exec:{}", ctx.action_id));

        if ctx.opt_bool("invalid")?.unwrap_or(false) {
            return Err(ActionError::invalid("bad input"));
        }
        if ctx.opt_bool("fail")?.unwrap_or(false) {
            return Err(ActionError::failed("boom"));
        }
        if let Some(times) = ctx.opt_u64("fail_times")? {
            let mut left = self.failures_left.lock().unwrap();
            let remaining = left.entry(ctx.action_id.to_string()).or_insert(times);
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ActionError::failed("transient"));
            }
        }

        let value = ctx.opt_str("value")?.unwrap_or_else(|| ctx.action_id.to_string());
        Ok(ActionResult::new().output("value", value))
    }

    fn rollback(&self, ctx: &ActionContext<'_>, _result: &ActionResult) -> Result<(), ActionError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("rollback:{}", ctx.action_id));
        Ok(())
    }
}

fn setup() -> (Arc<RecordingHandler>, TemplateExecutor) {
    let handler = Arc::new(RecordingHandler::default());
    let registry = HandlerRegistry::builder()
        .register_arc(handler.clone())
        .build();
    let executor = TemplateExecutor::new(Arc::new(registry), Arc::new(FakeSystem::new()));
    (handler, executor)
}

fn action(id: &str, order: i32) -> ActionDefinition {
    ActionDefinition::new(id, ActionType::RunScript).order(order)
}

fn template(actions: Vec<ActionDefinition>) -> Template {
    Template {
        id: "recorded".to_string(),
        name: "Recorded".to_string(),
        version: "1".to_string(),
        description: None,
        workspace_file: None,
        actions,
    }
}

fn target() -> AccountTarget {
    AccountTarget {
        username: "acme_dev1".to_string(),
        home_dir: PathBuf::from("/home/acme_dev1"),
    }
}

fn seed() -> ExecutionContext {
    ExecutionContext::new()
        .with("username", "acme_dev1")
        .with("home_dir", "/home/acme_dev1")
}

#[test]
fn test_dependent_of_failed_fatal_action_never_runs() {
    let (handler, executor) = setup();
    let t = template(vec![
        action("a", 1).param("fail", true),
        action("b", 2).depends_on("a"),
    ]);

    let report = executor.run(&t, &target(), seed()).unwrap();

    assert_eq!(handler.events(), vec!["exec:a"]);
    assert!(matches!(&report.outcome, RunOutcome::Aborted { action_id, .. } if action_id == "a"));
    assert_eq!(report.record("a").unwrap().state, ActionState::Aborted);
    assert_eq!(report.record("b").unwrap().state, ActionState::Pending);
    assert!(matches!(
        report.error(),
        Some(ProvisionError::ActionExecution { attempts: 1, .. })
    ));
}

#[test]
fn test_rollback_in_reverse_completion_order_exactly_once() {
    let (handler, executor) = setup();
    let t = template(vec![
        action("one", 1),
        action("two", 2),
        action("three", 3).param("fail", true),
        action("four", 4),
    ]);

    let report = executor.run(&t, &target(), seed()).unwrap();

    assert_eq!(
        handler.events(),
        vec!["exec:one", "exec:two", "exec:three", "rollback:two", "rollback:one"]
    );
    assert_eq!(handler.count("rollback:one"), 1);
    assert_eq!(handler.count("rollback:two"), 1);
    assert_eq!(handler.count("exec:four"), 0);
    assert_eq!(handler.count("rollback:four"), 0);
    assert_eq!(report.record("one").unwrap().state, ActionState::RolledBack);
    assert_eq!(report.record("two").unwrap().state, ActionState::RolledBack);
    assert!(report.rollback_failures.is_empty());
}

#[test]
fn test_rollback_skip_is_honored() {
    let (handler, executor) = setup();
    let t = template(vec![
        action("one", 1),
        action("two", 2).rollback(RollbackBehavior::Skip),
        action("three", 3).param("fail", true),
    ]);

    executor.run(&t, &target(), seed()).unwrap();

    assert_eq!(handler.count("rollback:two"), 0);
    assert_eq!(handler.count("rollback:one"), 1);
}

#[test]
fn test_action_waits_for_later_ordered_dependency() {
    let (handler, executor) = setup();
    let t = template(vec![
        action("config", 1).depends_on("clone"),
        action("clone", 2),
        action("finish", 3),
    ]);

    let report = executor.run(&t, &target(), seed()).unwrap();

    assert!(report.is_success());
    assert_eq!(handler.events(), vec!["exec:clone", "exec:config", "exec:finish"]);
}

#[test]
fn test_ties_keep_declaration_order() {
    let (handler, executor) = setup();
    let t = template(vec![action("b", 0), action("a", 0), action("c", 0)]);
    executor.run(&t, &target(), seed()).unwrap();
    assert_eq!(handler.events(), vec!["exec:b", "exec:a", "exec:c"]);
}

#[test]
fn test_non_fatal_failure_continues() {
    let (handler, executor) = setup();
    let t = template(vec![
        action("optional", 1).param("fail", true).non_fatal(),
        action("next", 2),
        action("needs-optional", 3).depends_on("optional").non_fatal(),
    ]);

    let report = executor.run(&t, &target(), seed()).unwrap();

    assert!(report.is_success());
    assert_eq!(handler.events(), vec!["exec:optional", "exec:next"]);
    assert_eq!(report.record("optional").unwrap().state, ActionState::Failed);
    assert_eq!(
        report.record("needs-optional").unwrap().state,
        ActionState::Skipped
    );
    assert_eq!(handler.count("rollback:next"), 0);
}

#[test]
fn test_fatal_dependent_of_skipped_action_aborts() {
    let (handler, executor) = setup();
    let t = template(vec![
        action("one", 1),
        action("gated", 2).condition("false"),
        action("needs-gated", 3).depends_on("gated"),
    ]);

    let report = executor.run(&t, &target(), seed()).unwrap();

    assert!(!report.is_success());
    assert_eq!(report.record("gated").unwrap().state, ActionState::Skipped);
    assert_eq!(handler.events(), vec!["exec:one", "rollback:one"]);
}

#[test]
fn test_retry_until_success() {
    let (handler, executor) = setup();
    let t = template(vec![action("flaky", 1)
        .param("fail_times", 2)
        .retry(RetryPolicy::attempts(3, 0))]);

    let report = executor.run(&t, &target(), seed()).unwrap();

    assert!(report.is_success());
    assert_eq!(handler.count("exec:flaky"), 3);
    let record = report.record("flaky").unwrap();
    assert_eq!(record.attempts, 3);
    assert_eq!(record.state, ActionState::Succeeded);
}

#[test]
fn test_retries_exhausted() {
    let (handler, executor) = setup();
    let t = template(vec![action("flaky", 1)
        .param("fail_times", 5)
        .retry(RetryPolicy::attempts(2, 0))]);

    let report = executor.run(&t, &target(), seed()).unwrap();

    assert_eq!(handler.count("exec:flaky"), 2);
    assert!(matches!(
        report.error(),
        Some(ProvisionError::ActionExecution { attempts: 2, .. })
    ));
}

#[test]
fn test_invalid_input_is_not_retried() {
    let (handler, executor) = setup();
    let t = template(vec![action("bad", 1)
        .param("invalid", true)
        .retry(RetryPolicy::attempts(5, 0))]);

    let report = executor.run(&t, &target(), seed()).unwrap();

    assert_eq!(handler.count("exec:bad"), 1);
    assert!(matches!(
        report.error(),
        Some(ProvisionError::ActionValidation { .. })
    ));
}

#[test]
fn test_conditions() {
    let (handler, executor) = setup();
    let t = template(vec![
        action("db", 1).condition("${with_db} == true"),
        action("cache", 2).condition("defined(redis_url)"),
        action("always", 3).condition("!defined(redis_url) && ${username} != root"),
    ]);

    let report = executor
        .run(&t, &target(), seed().with("with_db", "true"))
        .unwrap();

    assert!(report.is_success());
    assert_eq!(handler.events(), vec!["exec:db", "exec:always"]);
    assert_eq!(report.record("cache").unwrap().state, ActionState::Skipped);
}

#[test]
fn test_outputs_flow_between_actions() {
    let (handler, executor) = setup();
    let t = template(vec![
        action("first", 1).param("value", "/home/${username}/app"),
        action("second", 2).param("value", "${first.value}/src"),
        action("third", 3).param("value", "${value}!"),
    ]);

    let report = executor.run(&t, &target(), seed()).unwrap();

    assert!(report.is_success());
    assert_eq!(handler.count("exec:third"), 1);
    assert_eq!(report.context.get("first.value"), Some("/home/acme_dev1/app"));
    assert_eq!(report.context.get("second.value"), Some("/home/acme_dev1/app/src"));
    assert_eq!(report.context.get("third.value"), Some("/home/acme_dev1/app/src!"));
}

#[test]
fn test_undefined_variable_fails_before_anything_runs() {
    let (handler, executor) = setup();
    let t = template(vec![
        action("first", 1),
        action("second", 2).param("value", "/home/${username}/${project}"),
    ]);

    let err = executor.run(&t, &target(), seed()).unwrap_err();

    assert!(matches!(err, ProvisionError::ActionValidation { ref action_id, .. } if action_id == "second"));
    assert!(handler.events().is_empty());
}

#[test]
fn test_preflight_rejects_broken_templates() {
    let (handler, executor) = setup();

    let duplicate = template(vec![action("a", 1), action("a", 2)]);
    assert!(executor.run(&duplicate, &target(), seed()).is_err());

    let unknown_dep = template(vec![action("a", 1).depends_on("ghost")]);
    assert!(executor.run(&unknown_dep, &target(), seed()).is_err());

    let bad_condition = template(vec![action("a", 1).condition("${x} ==")]);
    assert!(executor.run(&bad_condition, &target(), seed()).is_err());

    let unknown_param = template(vec![action("a", 1).param("nonsense", 1)]);
    assert!(executor.run(&unknown_param, &target(), seed()).is_err());

    let missing_handler = template(vec![ActionDefinition::new("a", ActionType::GitClone)]);
    assert!(executor.run(&missing_handler, &target(), seed()).is_err());

    let own_output = template(vec![action("a", 1).param("value", "${a.value}")]);
    assert!(executor.run(&own_output, &target(), seed()).is_err());

    assert!(handler.events().is_empty());
}

#[test]
fn test_dependency_cycle_is_skipped() {
    let (handler, executor) = setup();
    let t = template(vec![
        action("ok", 1),
        action("x", 2).depends_on("y").non_fatal(),
        action("y", 3).depends_on("x").non_fatal(),
    ]);

    let report = executor.run(&t, &target(), seed()).unwrap();

    assert!(report.is_success());
    assert_eq!(handler.events(), vec!["exec:ok"]);
    assert_eq!(report.record("x").unwrap().state, ActionState::Skipped);
    assert_eq!(report.record("y").unwrap().state, ActionState::Skipped);
}

#[test]
fn test_workspace_file_is_resolved() {
    let (_probe, executor) = setup();
    let mut t = template(vec![action("clone", 1).param("value", "/home/acme_dev1/app")]);
    t.workspace_file = Some("${clone.value}/app.code-workspace".to_string());

    let report = executor.run(&t, &target(), seed()).unwrap();

    assert_eq!(
        report.workspace_file,
        Some(PathBuf::from("/home/acme_dev1/app/app.code-workspace"))
    );
}
