use crate::capabilities::{check_requirements, probe_environment};
use crate::concurrency::{CancellationToken, StateLock};
use crate::order::ensure_lifecycle_order;
use crate::params::{
    lock_parameters, stack_outputs, ComponentParameters, ExpansionError, ExpansionScope, Expander,
    LockContext, LockedParameters, NoPrompt, Prompter,
};
use crate::ready::{wait_ready, ReadyTarget};
use crate::status::{aggregate_stack_status, validate_transition};
use crate::{CapabilityDelta, CoreError, Provides, RequirementTuning};
use serde::Serialize;
use stackhub_runtime::{
    parse_outputs, run_hooks, split_reserved, take_dynamic_provides, Delegate, DelegateOutput,
    HookPhase, Invocation,
};
use stackhub_schema::{
    flatten_parameters, parse_manifest_file, Component, Manifest, ReadyCondition,
};
use stackhub_state::{
    BackupBundle, BundleComponent, BundleStatus, CapturedOutput, ComponentStatus,
    OperationStatus, StackStatus, StateLayout, StateManifest, StateStore, Verb,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_READY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which part of the lifecycle order a run covers.
///
/// `offset` and `limit` name the first and last component to run (both
/// inclusive) in the direction of the run; `components`, when non-empty,
/// further restricts the range to the listed names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub offset: Option<String>,
    pub limit: Option<String>,
    pub components: Vec<String>,
}

impl Selection {
    pub fn is_everything(&self) -> bool {
        self.offset.is_none() && self.limit.is_none() && self.components.is_empty()
    }

    pub fn apply(&self, order: &[String]) -> Result<Vec<String>, CoreError> {
        let position = |name: &str| {
            order
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| CoreError::UnknownComponent(name.to_owned()))
        };
        for name in &self.components {
            position(name)?;
        }
        let start = match self.offset.as_deref() {
            Some(name) => position(name)?,
            None => 0,
        };
        let end = match self.limit.as_deref() {
            Some(name) => position(name)? + 1,
            None => order.len(),
        };
        if start >= end {
            warn!("selection is empty: offset comes after limit");
            return Ok(Vec::new());
        }
        Ok(order[start..end]
            .iter()
            .filter(|n| self.components.is_empty() || self.components.contains(n))
            .cloned()
            .collect())
    }
}

/// Per-invocation tuning of a lifecycle run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub verb: Verb,
    pub selection: Selection,
    /// Downgrade mandatory failures and expansion errors to warnings.
    pub force: bool,
    /// Invoke `<verb>-test` and leave the persisted state untouched.
    pub dry_run: bool,
    pub ready_interval: Duration,
    /// Wait budget for ready conditions that do not declare one.
    pub default_ready_wait: Option<Duration>,
    pub probe_timeout: Duration,
    /// Requirement tuning rules applied after the manifest's own.
    pub optional_requires: Vec<String>,
    /// Storage key for the backup bundle, relative to the state directory.
    pub bundle_key: Option<String>,
}

impl RunOptions {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            selection: Selection::default(),
            force: false,
            dry_run: false,
            ready_interval: DEFAULT_READY_INTERVAL,
            default_ready_wait: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            optional_requires: Vec::new(),
            bundle_key: None,
        }
    }

    fn as_operation_options(&self) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        if self.force {
            options.insert("force".to_owned(), "true".to_owned());
        }
        if self.dry_run {
            options.insert("dry_run".to_owned(), "true".to_owned());
        }
        if let Some(offset) = &self.selection.offset {
            options.insert("offset".to_owned(), offset.clone());
        }
        if let Some(limit) = &self.selection.limit {
            options.insert("limit".to_owned(), limit.clone());
        }
        if !self.selection.components.is_empty() {
            options.insert("components".to_owned(), self.selection.components.join(","));
        }
        if !self.optional_requires.is_empty() {
            options.insert(
                "optional_requires".to_owned(),
                self.optional_requires.join(","),
            );
        }
        options
    }
}

/// Summary of a finished lifecycle run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub verb: Verb,
    pub operation_id: String,
    pub stack_status: StackStatus,
    pub message: Option<String>,
    pub outputs: Vec<CapturedOutput>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    /// Storage key of the written backup bundle.
    pub bundle: Option<String>,
}

/// Central orchestration engine for stack lifecycle runs.
///
/// Owns the state directory, the component delegate, and the collaborators a
/// run needs (prompter, cancellation token). Each run holds the state lock for
/// its whole duration and persists a full snapshot after every transition.
pub struct Engine {
    layout: StateLayout,
    store: StateStore,
    delegate: Box<dyn Delegate>,
    prompter: Box<dyn Prompter>,
    expander: Expander,
    token: CancellationToken,
}

impl Engine {
    pub fn new(state_root: impl Into<PathBuf>, delegate: Box<dyn Delegate>) -> Self {
        let layout = StateLayout::new(state_root);
        let store = StateStore::new(Box::new(layout.storage()), layout.state_key());
        Self {
            layout,
            store,
            delegate,
            prompter: Box::new(NoPrompt),
            expander: Expander::new(),
            token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_prompter(mut self, prompter: Box<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    pub fn delegate_name(&self) -> &str {
        self.delegate.name()
    }

    pub fn load_state(&self) -> Result<Option<StateManifest>, CoreError> {
        Ok(self.store.load()?)
    }

    pub fn read_bundle(&self, key: &str) -> Result<BackupBundle, CoreError> {
        Ok(self.store.read_bundle(key)?)
    }

    /// Parse the manifest at `manifest_path` and run it.
    pub fn run_file(
        &self,
        manifest_path: &Path,
        options: &RunOptions,
    ) -> Result<RunReport, CoreError> {
        let manifest = parse_manifest_file(manifest_path)?;
        let manifest_dir = manifest_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        self.run(manifest, &manifest_dir, options)
    }

    /// Run `options.verb` over the selected components of `manifest`.
    ///
    /// Progress recorded by prior runs is carried forward, so a run
    /// interrupted after component N can be resumed with
    /// `selection.offset` set to component N+1.
    pub fn run(
        &self,
        mut manifest: Manifest,
        manifest_dir: &Path,
        options: &RunOptions,
    ) -> Result<RunReport, CoreError> {
        manifest.validate()?;
        let order = ensure_lifecycle_order(&mut manifest)?.to_vec();
        let stack_name = manifest.stack_name().to_owned();
        info!("{} stack {stack_name}", options.verb);

        self.layout.initialize()?;
        let _lock = StateLock::acquire(&self.layout.lock_file())?;
        self.store.check()?;

        let mut state = StateManifest::new(&stack_name);
        state.lifecycle_order.clone_from(&order);
        if let Some(prior) = self.store.load()? {
            if prior.meta.stack_name != stack_name {
                warn!(
                    "state belongs to stack '{}', continuing as '{stack_name}'",
                    prior.meta.stack_name
                );
            }
            debug!("resuming deployment {}", prior.meta.deployment_id);
            state.merge_prior(prior);
        }

        let mut sequence = order;
        if options.verb == Verb::Undeploy {
            sequence.reverse();
        }
        let selected = options.selection.apply(&sequence)?;

        let locked = {
            let flat = flatten_parameters(&manifest.parameters);
            let ctx = LockContext {
                manifest_dir,
                stack_name: &stack_name,
                deployment_id: &state.meta.deployment_id,
                prior: &state.stack_parameters,
            };
            lock_parameters(&flat, &ctx, self.prompter.as_ref(), &self.expander)
        };
        tolerate(options.force, locked.errors.clone())?;
        state.stack_parameters.clone_from(&locked.parameters);

        let mut tuning = RequirementTuning::parse(&manifest.lifecycle.optional_requires);
        for rule in &options.optional_requires {
            tuning.apply(rule);
        }
        let mut provides = Provides::from_map(state.provides.clone());
        if options.verb == Verb::Deploy {
            let found = probe_environment(&manifest, &mut provides, options.probe_timeout);
            if !found.is_empty() {
                debug!("environment provides {}", found.join(", "));
            }
            check_stack_requirements(&manifest, &provides, &tuning)?;
        }
        state.provides = provides.as_map().clone();

        let operation_id =
            state.begin_operation(options.verb, selected.clone(), options.as_operation_options());
        state.set_stack_status(options.verb.stack_in_progress(), None);

        let mut run = Run {
            engine: self,
            manifest: &manifest,
            manifest_dir,
            options,
            locked,
            tuning,
            provides,
            state,
            completed: Vec::new(),
            failed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            bundle: BackupBundle::new(),
        };
        run.save()?;

        let reached_end =
            options.selection.components.is_empty() && selected.last() == sequence.last();
        match run.execute(&selected, reached_end) {
            Ok(()) => run.finish(&operation_id),
            Err(e) => {
                run.abort(&operation_id, &e);
                Err(e)
            }
        }
    }
}

/// Expansion errors are fatal unless the run is forced.
fn tolerate(force: bool, errors: Vec<ExpansionError>) -> Result<(), CoreError> {
    if errors.is_empty() {
        return Ok(());
    }
    if !force {
        return Err(CoreError::Expansion(errors));
    }
    for e in &errors {
        warn!("ignoring expansion error: {e}");
    }
    Ok(())
}

/// Stack-level requirements nothing in the stack provides must come from the environment.
fn check_stack_requirements(
    manifest: &Manifest,
    provides: &Provides,
    tuning: &RequirementTuning,
) -> Result<(), CoreError> {
    let missing: Vec<String> = manifest
        .requires
        .iter()
        .filter(|req| !provides.is_provided(req))
        .filter(|req| !manifest.components.iter().any(|c| c.provides.contains(req)))
        .filter(|req| !tuning.is_optional(req, None))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(CoreError::RequirementsNotSatisfied {
            component: manifest.stack_name().to_owned(),
            missing,
        })
    }
}

enum Outcome {
    Completed,
    /// Gated off or missing optional requirements; not counted in the stack status.
    Skipped,
    /// Nothing to do for this verb, e.g. backing up a component that is not deployed.
    Untouched,
    Failed(CoreError),
}

/// Mutable context of one lifecycle run, alive while the state lock is held.
struct Run<'e> {
    engine: &'e Engine,
    manifest: &'e Manifest,
    manifest_dir: &'e Path,
    options: &'e RunOptions,
    locked: LockedParameters,
    tuning: RequirementTuning,
    provides: Provides,
    state: StateManifest,
    completed: Vec<String>,
    failed: BTreeSet<String>,
    skipped: BTreeSet<String>,
    bundle: BackupBundle,
}

impl<'e> Run<'e> {
    fn verb(&self) -> Verb {
        self.options.verb
    }

    fn save(&self) -> Result<(), CoreError> {
        if self.options.dry_run {
            return Ok(());
        }
        self.engine.store.save(&self.state)?;
        Ok(())
    }

    fn execute(&mut self, selected: &[String], reached_end: bool) -> Result<(), CoreError> {
        for name in selected {
            if self.engine.token.is_cancelled() {
                info!("cancelled before {name}");
                return Err(CoreError::Cancelled);
            }
            match self.step(name)? {
                Outcome::Completed => self.completed.push(name.clone()),
                Outcome::Skipped => {
                    self.skipped.insert(name.clone());
                }
                Outcome::Untouched => {}
                Outcome::Failed(err) => self.handle_failure(name, err)?,
            }
        }

        if self.verb() == Verb::Deploy && reached_end && self.failed.is_empty() {
            if let Err(err) = self.stack_ready() {
                if matches!(err, CoreError::Cancelled) || !self.options.force {
                    return Err(err);
                }
                warn!("stack not ready, continuing in force mode: {err}");
            }
        }
        Ok(())
    }

    fn handle_failure(&mut self, name: &str, err: CoreError) -> Result<(), CoreError> {
        self.failed.insert(name.to_owned());
        if !self.manifest.is_mandatory(name) {
            warn!("optional component {name} failed: {err}");
            return Ok(());
        }
        if self.options.force {
            warn!("mandatory component {name} failed, continuing in force mode: {err}");
            return Ok(());
        }
        Err(err)
    }

    fn component(&self, name: &str) -> Result<&'e Component, CoreError> {
        self.manifest
            .component(name)
            .ok_or_else(|| CoreError::UnknownComponent(name.to_owned()))
    }

    fn parameters_for(
        &self,
        component: &Component,
        errors: &mut Vec<ExpansionError>,
    ) -> ComponentParameters {
        let outputs = self.state.component_outputs();
        ComponentParameters::build(
            &self.engine.expander,
            &self.locked,
            &outputs,
            self.manifest,
            component,
            errors,
        )
    }

    fn step(&mut self, name: &str) -> Result<Outcome, CoreError> {
        let component = self.component(name)?;
        let verb = self.verb();
        let prior = self.state.status_of(name);

        if verb == Verb::Deploy {
            if let Some(dep) = component.depends.iter().find(|d| self.failed.contains(*d)) {
                let err = CoreError::ComponentFailed {
                    component: name.to_owned(),
                    detail: format!("dependency {dep} failed"),
                };
                return self.record_failure(name, prior, err);
            }
        }
        if verb == Verb::Backup && prior != Some(ComponentStatus::Deployed) {
            debug!("{name} is not deployed, nothing to back up");
            return Ok(Outcome::Untouched);
        }

        let mut errors = Vec::new();
        let params = self.parameters_for(component, &mut errors);
        tolerate(self.options.force, errors)?;

        if let Some(gate) = params.disabled_by(&self.engine.expander, &component.enabled_by) {
            info!("skipping {name}: disabled by {gate}");
            if verb != Verb::Backup {
                self.state.clear_step(name);
                CapabilityDelta::withdraw(name).apply(&mut self.provides);
                self.state.provides = self.provides.as_map().clone();
                self.save()?;
            }
            return Ok(Outcome::Skipped);
        }

        if verb == Verb::Deploy {
            let check = check_requirements(component, &self.provides, &self.tuning);
            if !check.missing_mandatory.is_empty() {
                let err = CoreError::RequirementsNotSatisfied {
                    component: name.to_owned(),
                    missing: check.missing_mandatory,
                };
                return self.record_failure(name, prior, err);
            }
            if !check.missing_optional.is_empty() {
                info!(
                    "skipping {name}: optional requirements not provided: {}",
                    check.missing_optional.join(", ")
                );
                return Ok(Outcome::Skipped);
            }
        }

        let in_progress = verb.in_progress();
        validate_transition(prior, in_progress)?;
        self.state.set_status(name, in_progress, None);
        if let Some(step) = self.state.step_mut(name) {
            step.parameters.clone_from(&params.parameters);
        }
        self.save()?;

        let invocation = self.invocation(component, &params);
        info!("{} {name}", invocation.verb_name());
        let output = match self.invoke(component, &invocation) {
            Ok(output) => output,
            Err(err) => return self.record_failure(name, prior, err),
        };

        match verb {
            Verb::Deploy => self.complete_deploy(component, &params, &output),
            Verb::Undeploy => self.complete_undeploy(name),
            Verb::Backup => self.complete_backup(component, &output),
        }
    }

    fn invocation(&self, component: &Component, params: &ComponentParameters) -> Invocation {
        let mut invocation = Invocation::new(
            &component.name,
            component.source_dir(self.manifest_dir),
            self.verb(),
        );
        invocation.dry_run = self.options.dry_run;
        invocation.env = vec![
            ("STACKHUB_COMPONENT".to_owned(), component.name.clone()),
            ("STACKHUB_RANDOM".to_owned(), invocation.random_seed()),
            ("STACKHUB_VERB".to_owned(), invocation.verb_name()),
        ];
        invocation.env.extend(params.env());
        invocation
    }

    fn invoke(
        &self,
        component: &Component,
        invocation: &Invocation,
    ) -> Result<DelegateOutput, CoreError> {
        let failed = |detail: String| CoreError::ComponentFailed {
            component: component.name.clone(),
            detail,
        };
        let delegate = self.engine.delegate.as_ref();

        run_hooks(delegate, &component.hooks, HookPhase::Pre, invocation)
            .map_err(|e| failed(e.to_string()))?;
        let output = delegate
            .invoke(invocation)
            .map_err(|e| failed(e.to_string()))?;
        if !output.success() {
            return Err(failed(output.failure_detail()));
        }
        run_hooks(delegate, &component.hooks, HookPhase::Post, invocation)
            .map_err(|e| failed(e.to_string()))?;
        Ok(output)
    }

    fn record_failure(
        &mut self,
        name: &str,
        prior: Option<ComponentStatus>,
        err: CoreError,
    ) -> Result<Outcome, CoreError> {
        let message = Some(err.to_string());
        if self.verb() == Verb::Backup {
            if let Some(status) = prior {
                self.state.set_status(name, status, message);
            }
            self.bundle.record(
                name,
                BundleComponent {
                    timestamp: chrono::Utc::now().to_rfc3339(),
                    status: BundleStatus::Error,
                    kind: self.manifest.component(name).and_then(|c| c.kind.clone()),
                    outputs: Vec::new(),
                },
            );
        } else {
            self.state.set_status(name, ComponentStatus::Error, message);
        }
        self.save()?;
        Ok(Outcome::Failed(err))
    }

    fn complete_deploy(
        &mut self,
        component: &Component,
        params: &ComponentParameters,
        output: &DelegateOutput,
    ) -> Result<Outcome, CoreError> {
        let name = component.name.as_str();
        let prior = Some(ComponentStatus::Deploying);

        let mut raw = parse_outputs(&output.stdout);
        let dynamic = take_dynamic_provides(&mut raw);
        split_reserved(&mut raw);
        let captured = match params.capture_outputs(&self.engine.expander, &component.outputs, &raw)
        {
            Ok(captured) => captured,
            Err(errors) => return self.record_failure(name, prior, CoreError::Expansion(errors)),
        };
        if let Some(step) = self.state.step_mut(name) {
            step.raw_outputs.clone_from(&raw);
            step.outputs.clone_from(&captured);
        }

        let mut view = params.clone();
        for out in &captured {
            view.table.insert(out.name.clone(), out.value.clone());
            view.table.insert(out.key(), out.value.clone());
        }
        let manifest = self.manifest;
        for rc in manifest.ready_conditions_for(Some(name)) {
            let mut errors = Vec::new();
            let target = self.ready_target(rc, &view.scope(), &mut errors);
            if !errors.is_empty() {
                return self.record_failure(name, prior, CoreError::Expansion(errors));
            }
            match wait_ready(&target, self.options.ready_interval, &self.engine.token) {
                Ok(()) => {}
                Err(CoreError::Cancelled) => {
                    self.state.set_status(
                        name,
                        ComponentStatus::Error,
                        Some("cancelled while waiting to become ready".to_owned()),
                    );
                    self.save()?;
                    return Err(CoreError::Cancelled);
                }
                Err(err) => return self.record_failure(name, prior, err),
            }
        }

        let delta = CapabilityDelta::register(component, &dynamic);
        validate_transition(prior, ComponentStatus::Deployed)?;
        self.state.set_status(name, ComponentStatus::Deployed, None);
        if let CapabilityDelta::Register { capabilities, .. } = &delta {
            if let Some(step) = self.state.step_mut(name) {
                step.provides.clone_from(capabilities);
            }
        }
        self.save()?;

        delta.apply(&mut self.provides);
        self.state.provides = self.provides.as_map().clone();
        self.state.refresh_captured_outputs();
        self.save()?;
        info!("{name} deployed");
        Ok(Outcome::Completed)
    }

    fn complete_undeploy(&mut self, name: &str) -> Result<Outcome, CoreError> {
        validate_transition(Some(ComponentStatus::Undeploying), ComponentStatus::Undeployed)?;
        self.state.set_status(name, ComponentStatus::Undeployed, None);
        if let Some(step) = self.state.step_mut(name) {
            step.raw_outputs.clear();
            step.outputs.clear();
            step.provides.clear();
        }
        self.save()?;

        CapabilityDelta::withdraw(name).apply(&mut self.provides);
        self.state.provides = self.provides.as_map().clone();
        self.state.refresh_captured_outputs();
        self.save()?;
        info!("{name} undeployed");
        Ok(Outcome::Completed)
    }

    fn complete_backup(
        &mut self,
        component: &Component,
        output: &DelegateOutput,
    ) -> Result<Outcome, CoreError> {
        let name = component.name.as_str();
        let mut raw = parse_outputs(&output.stdout);
        let reserved = split_reserved(&mut raw);
        let outputs = raw
            .iter()
            .map(|(k, v)| CapturedOutput::new(Some(name), k, v))
            .collect();
        self.bundle.record(
            name,
            BundleComponent {
                timestamp: reserved
                    .timestamp
                    .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
                status: BundleStatus::Success,
                kind: reserved.kind.or_else(|| component.kind.clone()),
                outputs,
            },
        );

        validate_transition(Some(ComponentStatus::Backuping), ComponentStatus::Deployed)?;
        self.state.set_status(name, ComponentStatus::Deployed, None);
        self.save()?;
        info!("{name} backed up");
        Ok(Outcome::Completed)
    }

    fn ready_target(
        &self,
        rc: &ReadyCondition,
        scope: &ExpansionScope<'_>,
        errors: &mut Vec<ExpansionError>,
    ) -> ReadyTarget {
        let label = rc.component.as_deref().unwrap_or("stack");
        let expander = &self.engine.expander;
        let wait = match rc.wait_seconds {
            Some(secs) => Duration::from_secs(secs),
            None => self
                .options
                .default_ready_wait
                .unwrap_or_else(|| Duration::from_secs(rc.wait_seconds())),
        };
        ReadyTarget {
            dns: rc
                .dns
                .as_deref()
                .map(|d| expander.expand(scope, &format!("ready dns of {label}"), d, errors)),
            url: rc
                .url
                .as_deref()
                .map(|u| expander.expand(scope, &format!("ready url of {label}"), u, errors)),
            wait,
            secrets: scope.secret_values(),
        }
    }

    fn stack_ready(&self) -> Result<(), CoreError> {
        let mut table = self.locked.table.clone();
        for out in &self.state.component_outputs() {
            table.insert(out.key(), out.value.clone());
        }
        let scope = ExpansionScope::stack(&table);
        for rc in self.manifest.ready_conditions_for(None) {
            let mut errors = Vec::new();
            let target = self.ready_target(rc, &scope, &mut errors);
            if !errors.is_empty() {
                return Err(CoreError::Expansion(errors));
            }
            wait_ready(&target, self.options.ready_interval, &self.engine.token)?;
        }
        Ok(())
    }

    /// Components that do not count towards the stack status: skipped in
    /// this run, or never run and currently gated off or short of optional
    /// requirements.
    fn excluded(&self) -> BTreeSet<String> {
        let mut excluded = self.skipped.clone();
        for component in &self.manifest.components {
            if self.state.step(&component.name).is_some() {
                continue;
            }
            let mut ignored = Vec::new();
            let params = self.parameters_for(component, &mut ignored);
            let gated_off = params
                .disabled_by(&self.engine.expander, &component.enabled_by)
                .is_some();
            let check = check_requirements(component, &self.provides, &self.tuning);
            if gated_off
                || (check.missing_mandatory.is_empty() && !check.missing_optional.is_empty())
            {
                excluded.insert(component.name.clone());
            }
        }
        excluded
    }

    fn aggregate(&mut self) -> (StackStatus, Option<String>) {
        let (status, message) =
            aggregate_stack_status(self.manifest, &self.state.statuses(), &self.excluded());
        self.state.set_stack_status(status, message.clone());
        (status, message)
    }

    /// Stack capabilities hold while the whole stack is deployed and are
    /// withdrawn once every component is down again.
    fn update_stack_provides(&mut self, stack_status: StackStatus) {
        let stack = self.manifest.stack_name();
        let delta = match (self.verb(), stack_status) {
            (Verb::Deploy, StackStatus::Deployed) if !self.manifest.provides.is_empty() => {
                CapabilityDelta::register_stack(stack, &self.manifest.provides)
            }
            (Verb::Undeploy, StackStatus::Undeployed) => CapabilityDelta::withdraw(stack),
            _ => return,
        };
        delta.apply(&mut self.provides);
        self.state.provides = self.provides.as_map().clone();
    }

    fn finish(mut self, operation_id: &str) -> Result<RunReport, CoreError> {
        match self.verb() {
            Verb::Deploy => {
                self.state.refresh_captured_outputs();
                let mut errors = Vec::new();
                self.state.stack_outputs = stack_outputs(
                    &self.engine.expander,
                    &self.locked,
                    &self.state.captured_outputs,
                    &self.manifest.outputs,
                    &mut errors,
                );
                for e in &errors {
                    warn!("stack output: {e}");
                }
            }
            Verb::Undeploy => {
                let all_down = self.manifest.components.iter().all(|c| {
                    matches!(
                        self.state.status_of(&c.name),
                        None | Some(ComponentStatus::Undeployed)
                    )
                });
                if all_down {
                    self.state.stack_outputs.clear();
                }
            }
            Verb::Backup => {}
        }

        let (stack_status, message) = self.aggregate();
        if let Some(msg) = &message {
            info!("{msg}");
        }
        self.update_stack_provides(stack_status);
        let op_status = if self.failed.is_empty() {
            OperationStatus::Success
        } else {
            OperationStatus::Incomplete
        };
        self.state
            .finish_operation(operation_id, op_status, message.clone());
        self.save()?;

        let bundle = if self.verb() == Verb::Backup && !self.options.dry_run {
            let key = self.options.bundle_key.clone().unwrap_or_else(|| {
                self.engine
                    .layout
                    .bundle_key(&format!("{}-{operation_id}", self.manifest.stack_name()))
            });
            self.engine.store.write_bundle(&key, &self.bundle)?;
            info!("backup bundle {key}: {}", self.bundle.status);
            Some(key)
        } else {
            None
        };

        info!("stack {} is {stack_status}", self.manifest.stack_name());
        Ok(RunReport {
            verb: self.verb(),
            operation_id: operation_id.to_owned(),
            stack_status,
            message,
            outputs: self.state.stack_outputs.clone(),
            completed: self.completed,
            failed: self.failed.into_iter().collect(),
            skipped: self.skipped.into_iter().collect(),
            bundle,
        })
    }

    /// Record a fatal error in the state before it is returned.
    fn abort(&mut self, operation_id: &str, err: &CoreError) {
        self.aggregate();
        let status = if matches!(err, CoreError::Cancelled) {
            OperationStatus::Cancelled
        } else {
            OperationStatus::Error
        };
        self.state
            .finish_operation(operation_id, status, Some(err.to_string()));
        if let Err(e) = self.save() {
            warn!("failed to persist state after error: {e}");
        }
    }
}
