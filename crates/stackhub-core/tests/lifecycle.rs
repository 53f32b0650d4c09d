//! End-to-end lifecycle runs against the mock delegate.
//!
//! Every test gets a scratch state directory and a scratch manifest
//! directory; the mock records each invocation so ordering, environment
//! bindings, and skipped components can be asserted directly.

use stackhub_core::{
    CancellationToken, CoreError, Engine, ExpansionErrorKind, RunOptions, RunReport, StateLock,
};
use stackhub_runtime::MockDelegate;
use stackhub_schema::parse_manifest_str;
use stackhub_state::{BundleStatus, ComponentStatus, OperationStatus, StackStatus, Verb};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    state_dir: TempDir,
    manifest_dir: TempDir,
    mock: Arc<MockDelegate>,
}

impl Fixture {
    fn new(mock: MockDelegate) -> Self {
        Self {
            state_dir: tempfile::tempdir().unwrap(),
            manifest_dir: tempfile::tempdir().unwrap(),
            mock: Arc::new(mock),
        }
    }

    fn engine(&self) -> Engine {
        Engine::new(self.state_dir.path(), Box::new(Arc::clone(&self.mock)))
    }

    fn run(&self, manifest: &str, options: &RunOptions) -> Result<RunReport, CoreError> {
        self.run_with(self.engine(), manifest, options)
    }

    fn run_with(
        &self,
        engine: Engine,
        manifest: &str,
        options: &RunOptions,
    ) -> Result<RunReport, CoreError> {
        let manifest = parse_manifest_str(manifest).unwrap();
        engine.run(manifest, self.manifest_dir.path(), options)
    }

    fn state(&self) -> stackhub_state::StateManifest {
        self.engine().load_state().unwrap().expect("state persisted")
    }
}

fn options(verb: Verb) -> RunOptions {
    let mut opts = RunOptions::new(verb);
    opts.ready_interval = Duration::from_millis(20);
    opts
}

fn deploy() -> RunOptions {
    options(Verb::Deploy)
}

const DIAMOND: &str = r#"
manifest_version = 1
[meta]
name = "diamond"

[[components]]
name = "a"
depends = ["b", "c"]

[[components]]
name = "b"
depends = ["d"]

[[components]]
name = "c"
depends = ["d"]

[[components]]
name = "d"
"#;

#[test]
fn diamond_deploys_dependencies_first() {
    let fx = Fixture::new(MockDelegate::new());
    let report = fx.run(DIAMOND, &deploy()).unwrap();

    assert_eq!(fx.mock.invocation_order(), ["d", "b", "c", "a"]);
    assert_eq!(report.stack_status, StackStatus::Deployed);
    assert_eq!(report.completed, ["d", "b", "c", "a"]);
    assert_eq!(fx.state().lifecycle_order, ["d", "b", "c", "a"]);
}

#[test]
fn undeploy_runs_in_reverse_order() {
    let fx = Fixture::new(MockDelegate::new());
    fx.run(DIAMOND, &deploy()).unwrap();
    fx.mock.reset_calls();

    let report = fx.run(DIAMOND, &options(Verb::Undeploy)).unwrap();
    assert_eq!(fx.mock.invocation_order(), ["a", "c", "b", "d"]);
    assert_eq!(report.stack_status, StackStatus::Undeployed);
    assert!(fx
        .state()
        .statuses()
        .values()
        .all(|s| *s == ComponentStatus::Undeployed));
}

#[test]
fn dependency_cycle_is_rejected_before_any_work() {
    let fx = Fixture::new(MockDelegate::new());
    let manifest = r#"
manifest_version = 1
[meta]
name = "cycle"
[[components]]
name = "a"
depends = ["b"]
[[components]]
name = "b"
depends = ["a"]
"#;
    let err = fx.run(manifest, &deploy()).unwrap_err();
    assert!(matches!(err, CoreError::DependencyCycle(_)));
    assert!(err.is_manifest_error());
    assert!(fx.mock.calls().is_empty());
    assert!(fx.engine().load_state().unwrap().is_none());
}

#[test]
fn undefined_dependencies_are_all_reported() {
    let fx = Fixture::new(MockDelegate::new());
    let manifest = r#"
manifest_version = 1
[meta]
name = "ghosts"
[[components]]
name = "a"
depends = ["ghost"]
[[components]]
name = "b"
depends = ["phantom"]
"#;
    match fx.run(manifest, &deploy()) {
        Err(CoreError::UndefinedDependencies(list)) => assert_eq!(list.len(), 2),
        other => panic!("expected undefined dependencies, got {other:?}"),
    }
}

const WEB: &str = r#"
manifest_version = 1
[meta]
name = "web"

[[parameters]]
name = "domain"
value = "example.com"

[[components]]
name = "db"

[[components]]
name = "web"
depends = ["db"]

[[components.outputs]]
name = "url"
value = "https://${host}.${domain}"

[[outputs]]
name = "endpoint"
value = "${url:web}"
"#;

fn web_mock() -> MockDelegate {
    MockDelegate::new()
        .with_outputs("db", Verb::Deploy, &[("dsn", "postgres://db:5432")])
        .with_outputs("web", Verb::Deploy, &[("host", "www")])
}

#[test]
fn stack_outputs_are_evaluated_after_deploy() {
    let fx = Fixture::new(web_mock());
    let report = fx.run(WEB, &deploy()).unwrap();

    assert_eq!(report.outputs.len(), 1);
    assert_eq!(report.outputs[0].name, "endpoint");
    assert_eq!(report.outputs[0].value, "https://www.example.com");

    let state = fx.state();
    let keys: Vec<String> = state.captured_outputs.iter().map(|o| o.key()).collect();
    assert!(keys.contains(&"dsn:db".to_owned()));
    assert!(keys.contains(&"url:web".to_owned()));
}

#[test]
fn redeploy_is_idempotent() {
    let fx = Fixture::new(web_mock());
    let first = fx.run(WEB, &deploy()).unwrap();
    let state_one = fx.state();
    let second = fx.run(WEB, &deploy()).unwrap();
    let state_two = fx.state();

    assert_eq!(first.stack_status, second.stack_status);
    assert_eq!(first.outputs, second.outputs);
    assert_eq!(state_one.captured_outputs, state_two.captured_outputs);
    assert_eq!(state_one.stack_outputs, state_two.stack_outputs);
    assert_eq!(state_one.meta.deployment_id, state_two.meta.deployment_id);
    assert_eq!(state_one.statuses(), state_two.statuses());
    assert_eq!(state_two.operations.len(), 2);
}

#[test]
fn self_reference_fails_with_loop_error() {
    let fx = Fixture::new(MockDelegate::new());
    let manifest = r#"
manifest_version = 1
[meta]
name = "loop"
[[parameters]]
name = "x"
value = "${x}"
[[components]]
name = "a"
"#;
    match fx.run(manifest, &deploy()) {
        Err(CoreError::Expansion(errors)) => {
            assert!(errors.iter().any(|e| e.kind == ExpansionErrorKind::Loop));
        }
        other => panic!("expected expansion error, got {other:?}"),
    }
    assert!(fx.mock.calls().is_empty());
}

#[test]
fn force_tolerates_expansion_errors() {
    let fx = Fixture::new(MockDelegate::new());
    let manifest = r#"
manifest_version = 1
[meta]
name = "unknown"
[[parameters]]
name = "x"
value = "${nowhere}"
env = "X"
[[components]]
name = "a"
"#;
    let mut opts = deploy();
    opts.force = true;
    let report = fx.run(manifest, &opts).unwrap();
    assert_eq!(report.stack_status, StackStatus::Deployed);
    let env = &fx.mock.calls_for("a")[0].env;
    assert!(env.contains(&("X".to_owned(), "(unknown)".to_owned())));
}

#[test]
fn dependency_output_shadows_global_parameter() {
    let mock = MockDelegate::new().with_outputs("a", Verb::Deploy, &[("foo", "from-a")]);
    let fx = Fixture::new(mock);
    let manifest = r#"
manifest_version = 1
[meta]
name = "precedence"

[[parameters]]
name = "foo"
value = "global"

[[parameters]]
name = "seen"
component = "b"
kind = "link"
value = "${foo}"
env = "SEEN"

[[parameters]]
name = "plain"
component = "b"
value = "${foo}"
env = "PLAIN"

[[components]]
name = "a"

[[components]]
name = "b"
depends = ["a"]
"#;
    fx.run(manifest, &deploy()).unwrap();

    let env = &fx.mock.calls_for("b")[0].env;
    assert!(env.contains(&("SEEN".to_owned(), "from-a".to_owned())));
    // Non-link parameters are locked before any component runs.
    assert!(env.contains(&("PLAIN".to_owned(), "global".to_owned())));
}

#[test]
fn delegate_receives_component_environment() {
    let fx = Fixture::new(MockDelegate::new());
    let manifest = r#"
manifest_version = 1
[meta]
name = "env"
[[parameters]]
name = "region"
value = "eu-west-1"
env = "REGION"
[[components]]
name = "a"
"#;
    fx.run(manifest, &deploy()).unwrap();

    let env = &fx.mock.calls_for("a")[0].env;
    let get = |k: &str| env.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
    assert_eq!(get("STACKHUB_COMPONENT"), Some("a"));
    assert_eq!(get("STACKHUB_VERB"), Some("deploy"));
    assert_eq!(get("REGION"), Some("eu-west-1"));
    assert_eq!(get("STACKHUB_RANDOM").map(str::len), Some(16));
}

const CLUSTER: &str = r#"
manifest_version = 1
[meta]
name = "cluster"

[[components]]
name = "k"
provides = ["kubernetes"]

[[components]]
name = "app"
depends = ["k"]
requires = ["kubernetes"]
"#;

#[test]
fn capabilities_follow_component_lifecycle() {
    let fx = Fixture::new(MockDelegate::new());
    fx.run(CLUSTER, &deploy()).unwrap();
    let state = fx.state();
    assert_eq!(state.provides.get("kubernetes"), Some(&vec!["k".to_owned()]));
    assert_eq!(state.step("k").unwrap().provides, ["kubernetes"]);

    fx.run(CLUSTER, &options(Verb::Undeploy)).unwrap();
    let state = fx.state();
    assert!(!state.provides.contains_key("kubernetes"));
    assert!(state.step("k").unwrap().provides.is_empty());
}

#[test]
fn dynamic_provides_are_registered() {
    let mock = MockDelegate::new().with_outputs("k", Verb::Deploy, &[("provides", "ingress, tls")]);
    let fx = Fixture::new(mock);
    fx.run(CLUSTER, &deploy()).unwrap();

    let state = fx.state();
    assert_eq!(state.provides.get("ingress"), Some(&vec!["k".to_owned()]));
    assert_eq!(state.provides.get("tls"), Some(&vec!["k".to_owned()]));
    assert!(state.step("k").unwrap().raw_outputs.is_empty());
}

#[test]
fn stack_provides_follow_stack_status() {
    let manifest = r#"
manifest_version = 1
provides = ["api"]
[meta]
name = "platform"

[[components]]
name = "db"

[[components]]
name = "web"
depends = ["db"]
"#;
    let fx = Fixture::new(MockDelegate::new());

    let mut partial = deploy();
    partial.selection.limit = Some("db".to_owned());
    fx.run(manifest, &partial).unwrap();
    assert!(!fx.state().provides.contains_key("api"));

    fx.run(manifest, &deploy()).unwrap();
    assert_eq!(
        fx.state().provides.get("api"),
        Some(&vec!["platform".to_owned()])
    );

    let report = fx.run(manifest, &options(Verb::Undeploy)).unwrap();
    assert_eq!(report.stack_status, StackStatus::Undeployed);
    assert!(!fx.state().provides.contains_key("api"));
}

const PRODUCER: &str = r#"
manifest_version = 1
[meta]
name = "producer"

[[components]]
name = "a"

[[components]]
name = "b"
depends = ["a"]
requires = ["queue"]
"#;

#[test]
fn dynamic_provides_satisfy_later_requirements() {
    let mock = MockDelegate::new().with_outputs("a", Verb::Deploy, &[("provides", "queue")]);
    let fx = Fixture::new(mock);
    let report = fx.run(PRODUCER, &deploy()).unwrap();

    assert_eq!(report.stack_status, StackStatus::Deployed);
    assert_eq!(report.completed, ["a", "b"]);
    assert!(fx.mock.invoked("b"));
    assert_eq!(fx.state().provides.get("queue"), Some(&vec!["a".to_owned()]));
}

#[test]
fn requirement_nobody_provides_fails_at_the_consumer() {
    let fx = Fixture::new(MockDelegate::new());
    let err = fx.run(PRODUCER, &deploy()).unwrap_err();

    assert!(matches!(
        err,
        CoreError::RequirementsNotSatisfied { ref component, ref missing }
            if component == "b" && missing == &["queue".to_owned()]
    ));
    assert!(fx.mock.invoked("a"));
    assert!(!fx.mock.invoked("b"));
    assert_eq!(fx.state().status_of("a"), Some(ComponentStatus::Deployed));
}

fn broker_manifest(tuning: &str) -> String {
    format!(
        r#"
manifest_version = 1
[meta]
name = "queue"

[lifecycle]
optional_requires = [{tuning}]

[[parameters]]
name = "use_broker"
value = "false"

[[components]]
name = "base"

[[components]]
name = "broker"
provides = ["mq"]
enabled_by = ["use_broker"]

[[components]]
name = "worker"
depends = ["base"]
requires = ["mq"]
"#
    )
}

#[test]
fn optional_requirement_skips_component() {
    let fx = Fixture::new(MockDelegate::new());
    let report = fx.run(&broker_manifest("\"mq:worker\""), &deploy()).unwrap();

    assert_eq!(report.stack_status, StackStatus::Deployed);
    assert!(report.failed.is_empty());
    assert!(report.skipped.contains(&"worker".to_owned()));
    assert!(report.skipped.contains(&"broker".to_owned()));
    assert!(!fx.mock.invoked("worker"));
    assert!(!fx.mock.invoked("broker"));
    assert!(fx.state().step("worker").is_none());
}

#[test]
fn mandatory_requirement_is_fatal() {
    let fx = Fixture::new(MockDelegate::new());
    let err = fx.run(&broker_manifest(""), &deploy()).unwrap_err();

    assert!(matches!(
        err,
        CoreError::RequirementsNotSatisfied { ref component, ref missing }
            if component == "worker" && missing == &["mq".to_owned()]
    ));
    let state = fx.state();
    assert_eq!(state.status_of("worker"), Some(ComponentStatus::Error));
    assert_eq!(state.meta.status, Some(StackStatus::Incomplete));
    assert_eq!(
        state.operations.last().unwrap().status,
        OperationStatus::Error
    );
}

#[test]
fn requirement_tuned_for_another_component_is_still_fatal() {
    let fx = Fixture::new(MockDelegate::new());
    let err = fx
        .run(&broker_manifest("\"mq:base\""), &deploy())
        .unwrap_err();
    assert!(matches!(err, CoreError::RequirementsNotSatisfied { .. }));
}

#[test]
fn gated_component_state_is_cleared() {
    let fx = Fixture::new(MockDelegate::new());
    let enabled = broker_manifest("\"mq:worker\"").replace("value = \"false\"", "value = \"true\"");
    fx.run(&enabled, &deploy()).unwrap();
    assert_eq!(fx.state().status_of("broker"), Some(ComponentStatus::Deployed));
    assert!(fx.mock.invoked("worker"));

    fx.run(&broker_manifest("\"mq:worker\""), &deploy()).unwrap();
    assert!(fx.state().step("broker").is_none());
}

const FOUR: &str = r#"
manifest_version = 1
[meta]
name = "four"

[lifecycle]
optional = ["extra"]

[[components]]
name = "one"

[[components]]
name = "two"
depends = ["one"]

[[components]]
name = "three"
depends = ["two"]

[[components]]
name = "extra"
"#;

#[test]
fn optional_failure_leaves_stack_deployed() {
    let fx = Fixture::new(MockDelegate::new().failing("extra", Verb::Deploy));
    let report = fx.run(FOUR, &deploy()).unwrap();

    assert_eq!(report.stack_status, StackStatus::Deployed);
    assert_eq!(report.failed, ["extra"]);
    assert_eq!(fx.state().status_of("extra"), Some(ComponentStatus::Error));
    assert_eq!(
        fx.state().operations.last().unwrap().status,
        OperationStatus::Incomplete
    );
}

#[test]
fn mandatory_failure_aborts_the_run() {
    let fx = Fixture::new(MockDelegate::new().failing("two", Verb::Deploy));
    let err = fx.run(FOUR, &deploy()).unwrap_err();

    assert!(matches!(err, CoreError::ComponentFailed { ref component, .. } if component == "two"));
    assert!(!fx.mock.invoked("three"));
    let state = fx.state();
    assert_eq!(state.status_of("one"), Some(ComponentStatus::Deployed));
    assert_eq!(state.status_of("two"), Some(ComponentStatus::Error));
    assert_eq!(state.meta.status, Some(StackStatus::Incomplete));
    assert!(state.step("two").unwrap().message.is_some());
}

#[test]
fn force_degrades_mandatory_failure_to_incomplete() {
    let fx = Fixture::new(MockDelegate::new().failing("two", Verb::Deploy));
    let mut opts = deploy();
    opts.force = true;
    let report = fx.run(FOUR, &opts).unwrap();

    assert_eq!(report.stack_status, StackStatus::Incomplete);
    let message = report.message.unwrap();
    assert!(message.contains("two=error"));
    assert!(message.contains("one=deployed"));
    // three depends on the failed component and is never attempted.
    assert!(!fx.mock.invoked("three"));
    assert_eq!(report.failed, ["three", "two"]);
    assert!(fx.mock.invoked("extra"));
}

#[test]
fn failed_optional_dependency_blocks_dependents_only() {
    let manifest = r#"
manifest_version = 1
[meta]
name = "blocked"
[lifecycle]
optional = ["cache", "api"]
[[components]]
name = "cache"
[[components]]
name = "api"
depends = ["cache"]
[[components]]
name = "web"
"#;
    let fx = Fixture::new(MockDelegate::new().failing("cache", Verb::Deploy));
    let report = fx.run(manifest, &deploy()).unwrap();

    assert_eq!(report.stack_status, StackStatus::Deployed);
    assert_eq!(report.failed, ["api", "cache"]);
    assert!(!fx.mock.invoked("api"));
    assert!(fx.mock.invoked("web"));
}

const CHAIN: &str = r#"
manifest_version = 1
[meta]
name = "chain"

[[components]]
name = "c1"

[[components]]
name = "c2"
depends = ["c1"]

[[components]]
name = "c3"
depends = ["c2"]

[[components.outputs]]
name = "joined"
value = "${out:c2}+${out:c3}"

[[components]]
name = "c4"
depends = ["c3"]
provides = ["queue"]

[[components]]
name = "c5"
depends = ["c4"]
requires = ["queue"]

[[outputs]]
name = "last"
value = "${out:c5}"
"#;

fn chain_mock() -> MockDelegate {
    (1..=5).fold(MockDelegate::new(), |mock, i| {
        let value = format!("v{i}");
        mock.with_outputs(&format!("c{i}"), Verb::Deploy, &[("out", value.as_str())])
    })
}

#[test]
fn resumed_run_matches_uninterrupted_run() {
    let interrupted = Fixture::new(chain_mock());
    let mut first = deploy();
    first.selection.limit = Some("c2".to_owned());
    let partial = interrupted.run(CHAIN, &first).unwrap();
    assert_eq!(partial.stack_status, StackStatus::Incomplete);
    assert_eq!(interrupted.mock.invocation_order(), ["c1", "c2"]);

    let mut rest = deploy();
    rest.selection.offset = Some("c3".to_owned());
    let resumed = interrupted.run(CHAIN, &rest).unwrap();
    assert_eq!(
        interrupted.mock.invocation_order(),
        ["c1", "c2", "c3", "c4", "c5"]
    );

    let straight = Fixture::new(chain_mock());
    let full = straight.run(CHAIN, &deploy()).unwrap();

    assert_eq!(resumed.stack_status, StackStatus::Deployed);
    assert_eq!(resumed.stack_status, full.stack_status);
    assert_eq!(resumed.outputs, full.outputs);

    let a = interrupted.state();
    let b = straight.state();
    assert_eq!(a.statuses(), b.statuses());
    assert_eq!(a.captured_outputs, b.captured_outputs);
    assert_eq!(a.stack_outputs, b.stack_outputs);
    assert_eq!(a.provides, b.provides);
    assert!(a
        .captured_outputs
        .iter()
        .any(|o| o.key() == "joined:c3" && o.value == "v2+v3"));
}

#[test]
fn explicit_component_list_runs_only_those() {
    let fx = Fixture::new(MockDelegate::new());
    let mut opts = deploy();
    opts.selection.components = vec!["a".to_owned(), "d".to_owned()];
    let report = fx.run(DIAMOND, &opts).unwrap();
    assert_eq!(fx.mock.invocation_order(), ["d", "a"]);
    assert_eq!(report.stack_status, StackStatus::Incomplete);
}

#[test]
fn component_list_skips_the_stack_ready_gate() {
    let manifest = r#"
manifest_version = 1
[meta]
name = "gated"
[[lifecycle.ready_conditions]]
dns = "no-such-host.invalid"
wait_seconds = 1
[[components]]
name = "db"
[[components]]
name = "web"
depends = ["db"]
"#;
    let fx = Fixture::new(MockDelegate::new());
    let mut opts = deploy();
    opts.selection.components = vec!["db".to_owned(), "web".to_owned()];
    let report = fx.run(manifest, &opts).unwrap();
    assert_eq!(report.stack_status, StackStatus::Deployed);
    assert_eq!(report.completed, ["db", "web"]);

    let err = fx.run(manifest, &deploy()).unwrap_err();
    assert!(matches!(err, CoreError::ReadyTimeout { .. }));
}

#[test]
fn unknown_offset_is_rejected() {
    let fx = Fixture::new(chain_mock());
    let mut opts = deploy();
    opts.selection.offset = Some("c9".to_owned());
    assert!(matches!(
        fx.run(CHAIN, &opts),
        Err(CoreError::UnknownComponent(ref n)) if n == "c9"
    ));
}

#[test]
fn cancellation_stops_after_current_component() {
    let token = CancellationToken::new();
    let trigger = token.clone();
    let mock = chain_mock().on_invoke("c2", Verb::Deploy, move |_| trigger.cancel());
    let fx = Fixture::new(mock);

    let engine = fx.engine().with_cancellation(token);
    let err = fx.run_with(engine, CHAIN, &deploy()).unwrap_err();
    assert!(matches!(err, CoreError::Cancelled));
    assert_eq!(fx.mock.invocation_order(), ["c1", "c2"]);

    let state = fx.state();
    assert_eq!(state.status_of("c2"), Some(ComponentStatus::Deployed));
    assert!(state.step("c3").is_none());
    assert_eq!(
        state.operations.last().unwrap().status,
        OperationStatus::Cancelled
    );

    let mut rest = deploy();
    rest.selection.offset = Some("c3".to_owned());
    let report = fx.run(CHAIN, &rest).unwrap();
    assert_eq!(report.stack_status, StackStatus::Deployed);
}

#[test]
fn held_state_lock_refuses_to_start() {
    let fx = Fixture::new(MockDelegate::new());
    let engine = fx.engine();
    let _held = StateLock::acquire(&engine.layout().lock_file()).unwrap();

    let err = fx.run_with(engine, DIAMOND, &deploy()).unwrap_err();
    assert!(matches!(err, CoreError::StateLocked(_)));
    assert!(err.is_state_error());
    assert!(fx.mock.calls().is_empty());
}

#[test]
fn dry_run_leaves_state_untouched() {
    let fx = Fixture::new(MockDelegate::new());
    let mut opts = deploy();
    opts.dry_run = true;
    let report = fx.run(DIAMOND, &opts).unwrap();

    assert_eq!(report.completed.len(), 4);
    assert!(fx
        .mock
        .calls()
        .iter()
        .all(|c| c.verb_name == "deploy-test"));
    assert!(fx.engine().load_state().unwrap().is_none());
}

#[test]
fn hooks_run_around_the_verb() {
    let manifest = r#"
manifest_version = 1
[meta]
name = "hooks"
[[components]]
name = "a"
[[components.hooks]]
file = "pre.sh"
triggers = ["pre-*"]
[[components.hooks]]
file = "notify.sh"
triggers = ["post-deploy"]
error = "ignore"
"#;
    let fx = Fixture::new(MockDelegate::new().failing_hook("notify.sh"));
    fx.run(manifest, &deploy()).unwrap();

    let sequence: Vec<Option<String>> = fx.mock.calls().into_iter().map(|c| c.hook).collect();
    assert_eq!(
        sequence,
        [Some("pre.sh".to_owned()), None, Some("notify.sh".to_owned())]
    );
    assert_eq!(fx.state().status_of("a"), Some(ComponentStatus::Deployed));
}

#[test]
fn failing_pre_hook_fails_the_component() {
    let manifest = r#"
manifest_version = 1
[meta]
name = "hooks"
[[components]]
name = "a"
[[components.hooks]]
file = "check.sh"
triggers = ["pre-deploy"]
"#;
    let fx = Fixture::new(MockDelegate::new().failing_hook("check.sh"));
    let err = fx.run(manifest, &deploy()).unwrap_err();
    assert!(matches!(err, CoreError::ComponentFailed { .. }));
    assert!(fx.mock.calls_for("a").is_empty());
}

#[test]
fn ready_condition_gates_component() {
    let manifest = r#"
manifest_version = 1
[meta]
name = "ready"
[lifecycle]
optional = ["flaky"]
[[lifecycle.ready_conditions]]
component = "web"
dns = "${host}"
wait_seconds = 5
[[lifecycle.ready_conditions]]
component = "flaky"
dns = "no-such-host.invalid"
wait_seconds = 1
[[components]]
name = "web"
[[components]]
name = "flaky"
"#;
    let mock = MockDelegate::new().with_outputs("web", Verb::Deploy, &[("host", "localhost")]);
    let fx = Fixture::new(mock);
    let report = fx.run(manifest, &deploy()).unwrap();

    assert_eq!(report.stack_status, StackStatus::Deployed);
    assert_eq!(report.failed, ["flaky"]);
    let state = fx.state();
    assert_eq!(state.status_of("web"), Some(ComponentStatus::Deployed));
    assert_eq!(state.status_of("flaky"), Some(ComponentStatus::Error));
    assert!(state
        .step("flaky")
        .and_then(|s| s.message.as_deref())
        .is_some_and(|m| m.contains("not ready")));
}

fn backup_mock() -> MockDelegate {
    MockDelegate::new()
        .with_outputs(
            "one",
            Verb::Backup,
            &[
                ("kind", "snapshot"),
                ("timestamp", "2026-01-01T00:00:00Z"),
                ("archive", "s3://bucket/one"),
            ],
        )
        .with_outputs("two", Verb::Backup, &[("archive", "s3://bucket/two")])
}

#[test]
fn backup_writes_a_bundle() {
    let fx = Fixture::new(backup_mock());
    fx.run(FOUR, &deploy()).unwrap();

    let mut opts = options(Verb::Backup);
    opts.bundle_key = Some("backups/nightly.json".to_owned());
    let report = fx.run(FOUR, &opts).unwrap();
    assert_eq!(report.bundle.as_deref(), Some("backups/nightly.json"));
    assert_eq!(report.stack_status, StackStatus::Deployed);

    let bundle = fx.engine().read_bundle("backups/nightly.json").unwrap();
    assert_eq!(bundle.status, BundleStatus::Success);
    assert_eq!(bundle.components.len(), 4);
    let one = &bundle.components["one"];
    assert_eq!(one.kind.as_deref(), Some("snapshot"));
    assert_eq!(one.timestamp, "2026-01-01T00:00:00Z");
    assert_eq!(one.outputs.len(), 1);
    assert_eq!(one.outputs[0].value, "s3://bucket/one");

    assert!(fx
        .state()
        .statuses()
        .values()
        .all(|s| *s == ComponentStatus::Deployed));
}

#[test]
fn partial_backup_is_recorded() {
    let fx = Fixture::new(backup_mock().failing("extra", Verb::Backup));
    fx.run(FOUR, &deploy()).unwrap();

    let report = fx.run(FOUR, &options(Verb::Backup)).unwrap();
    let key = report.bundle.unwrap();
    assert!(key.starts_with("backups/four-"));
    assert!(fx.state_dir.path().join(&key).exists());

    let bundle = fx.engine().read_bundle(&key).unwrap();
    assert_eq!(bundle.status, BundleStatus::Partial);
    assert_eq!(bundle.components["extra"].status, BundleStatus::Error);
    assert_eq!(fx.state().status_of("extra"), Some(ComponentStatus::Deployed));
}

#[test]
fn persisted_state_is_versioned_json() {
    let fx = Fixture::new(web_mock());
    fx.run(WEB, &deploy()).unwrap();

    let raw = std::fs::read(fx.engine().layout().state_file()).unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(doc["kind"], "state");
    assert_eq!(doc["version"], 1);
    assert_eq!(doc["meta"]["status"], "deployed");
    assert_eq!(doc["components"]["web"]["status"], "deployed");
    assert!(doc["checksum"].is_string());
}
