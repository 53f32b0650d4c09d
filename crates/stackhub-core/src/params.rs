//! Parameter locking and `${}`/`#{}` expansion.
//!
//! Locking runs once per invocation at stack scope and produces the table of
//! qualified names to values every later substitution reads from. Expansion
//! then happens per component, with that component's dependencies deciding
//! which captured outputs a bare name resolves to.

use crate::expr::{EvalFailure, Evaluator};
use crate::secrets::{looks_secret, mask};
use stackhub_schema::{Component, FlatParameter, Manifest, OutputSpec, ParameterKind};
use stackhub_state::{CapturedOutput, LockedParameter};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::debug;

pub const MAX_EXPANSION_DEPTH: usize = 10;
pub const UNKNOWN_PLACEHOLDER: &str = "(unknown)";
pub const LOOP_PLACEHOLDER: &str = "(loop)";

pub const DEPLOYMENT_ID_KEY: &str = "hub.deploymentId";
pub const STACK_NAME_KEY: &str = "hub.stackName";
pub const COMPONENT_NAME_KEY: &str = "hub.componentName";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpansionErrorKind {
    Unknown,
    Loop,
    Eval(String),
    Empty,
    Source(String),
    Prompt(String),
}

/// A problem found while locking or expanding a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionError {
    /// The parameter, output, or condition being expanded.
    pub context: String,
    pub reference: String,
    pub kind: ExpansionErrorKind,
}

impl fmt::Display for ExpansionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ctx = &self.context;
        let r = &self.reference;
        match &self.kind {
            ExpansionErrorKind::Unknown => write!(f, "{ctx}: unknown reference `{r}`"),
            ExpansionErrorKind::Loop => write!(f, "{ctx}: probable loop expanding `{r}`"),
            ExpansionErrorKind::Eval(m) => write!(f, "{ctx}: cannot evaluate `#{{{r}}}`: {m}"),
            ExpansionErrorKind::Empty => write!(f, "{ctx}: parameter has no value"),
            ExpansionErrorKind::Source(m) => write!(f, "{ctx}: cannot read `{r}`: {m}"),
            ExpansionErrorKind::Prompt(m) => write!(f, "{ctx}: prompt failed: {m}"),
        }
    }
}

fn error(context: &str, reference: &str, kind: ExpansionErrorKind) -> ExpansionError {
    ExpansionError {
        context: context.to_owned(),
        reference: reference.to_owned(),
        kind,
    }
}

pub fn has_markers(value: &str) -> bool {
    value.contains("${") || value.contains("#{")
}

/// Values that switch a component off when its gate parameter expands to them.
pub fn is_false_literal(value: &str) -> bool {
    let v = value.trim();
    v.is_empty()
        || v == UNKNOWN_PLACEHOLDER
        || ["false", "0", "no"].iter().any(|f| v.eq_ignore_ascii_case(f))
}

/// Name resolution for one expansion: a value table plus the component whose
/// point of view bare names are resolved from.
#[derive(Debug, Clone, Copy)]
pub struct ExpansionScope<'a> {
    values: &'a BTreeMap<String, String>,
    component: Option<&'a str>,
    depends: &'a [String],
}

impl<'a> ExpansionScope<'a> {
    pub fn stack(values: &'a BTreeMap<String, String>) -> Self {
        Self {
            values,
            component: None,
            depends: &[],
        }
    }

    pub fn component(
        values: &'a BTreeMap<String, String>,
        component: &'a str,
        depends: &'a [String],
    ) -> Self {
        Self {
            values,
            component: Some(component),
            depends,
        }
    }

    /// Resolve a reference. Qualified names (`name|comp`, `name:comp`) are
    /// looked up as written; a bare name tries `name|<component>`, then
    /// `name:<dependency>` from the last dependency to the first, then `name`.
    /// Values in scope whose names look like they hold secrets.
    pub fn secret_values(&self) -> Vec<String> {
        self.values
            .iter()
            .filter(|(name, value)| looks_secret(name) && !value.is_empty())
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn resolve(&self, name: &str) -> Option<&'a str> {
        if name.contains('|') || name.contains(':') {
            return self.values.get(name).map(String::as_str);
        }
        if let Some(comp) = self.component {
            if let Some(v) = self.values.get(&format!("{name}|{comp}")) {
                return Some(v);
            }
        }
        for dep in self.depends.iter().rev() {
            if let Some(v) = self.values.get(&format!("{name}:{dep}")) {
                return Some(v);
            }
        }
        self.values.get(name).map(String::as_str)
    }
}

fn find_marker(s: &str) -> Option<usize> {
    match (s.find("${"), s.find("#{")) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// The `${..}` and `#{..}` markers left in a partially expanded value,
/// without the text already substituted around them.
fn references(input: &str) -> String {
    let mut found = Vec::new();
    let mut rest = input;
    while let Some(pos) = find_marker(rest) {
        let body_start = pos + 2;
        let Some(len) = body_len(&rest[body_start..]) else {
            break;
        };
        found.push(&rest[pos..=body_start + len]);
        rest = &rest[body_start + len + 1..];
    }
    found.join(" ")
}

/// Length of the marker body, up to the `}` that balances the opening brace.
fn body_len(s: &str) -> Option<usize> {
    let mut depth = 1usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Substitutes `${name}` references and evaluates `#{expr}` expressions.
#[derive(Default)]
pub struct Expander {
    evaluator: Evaluator,
}

impl Expander {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand every marker in `input`.
    ///
    /// Problems are appended to `errors` and replaced by a placeholder, so
    /// expansion always produces a value.
    pub fn expand(
        &self,
        scope: &ExpansionScope<'_>,
        context: &str,
        input: &str,
        errors: &mut Vec<ExpansionError>,
    ) -> String {
        self.expand_at(scope, context, input, 0, errors)
    }

    fn expand_at(
        &self,
        scope: &ExpansionScope<'_>,
        context: &str,
        input: &str,
        depth: usize,
        errors: &mut Vec<ExpansionError>,
    ) -> String {
        if !has_markers(input) {
            return input.to_owned();
        }
        if depth >= MAX_EXPANSION_DEPTH {
            errors.push(error(context, &references(input), ExpansionErrorKind::Loop));
            return LOOP_PLACEHOLDER.to_owned();
        }

        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(pos) = find_marker(rest) {
            out.push_str(&rest[..pos]);
            let sigil = rest.as_bytes()[pos];
            let body_start = pos + 2;
            let Some(len) = body_len(&rest[body_start..]) else {
                // Unterminated marker: keep the text as is.
                out.push_str(&rest[pos..]);
                rest = "";
                break;
            };
            let body = &rest[body_start..body_start + len];
            rest = &rest[body_start + len + 1..];

            let value = if sigil == b'$' {
                self.reference(scope, context, body.trim(), depth, errors)
            } else {
                self.evaluate(scope, context, body, depth, errors)
            };
            out.push_str(&value);
        }
        out.push_str(rest);
        out
    }

    fn reference(
        &self,
        scope: &ExpansionScope<'_>,
        context: &str,
        name: &str,
        depth: usize,
        errors: &mut Vec<ExpansionError>,
    ) -> String {
        if let Some(value) = scope.resolve(name) {
            self.expand_at(scope, context, value, depth + 1, errors)
        } else {
            errors.push(error(context, name, ExpansionErrorKind::Unknown));
            UNKNOWN_PLACEHOLDER.to_owned()
        }
    }

    fn evaluate(
        &self,
        scope: &ExpansionScope<'_>,
        context: &str,
        body: &str,
        depth: usize,
        errors: &mut Vec<ExpansionError>,
    ) -> String {
        let body = if has_markers(body) {
            self.expand_at(scope, context, body, depth + 1, errors)
        } else {
            body.to_owned()
        };
        let result = {
            let mut lookup = |name: &str| {
                scope
                    .resolve(name)
                    .map(|v| self.expand_at(scope, context, v, depth + 1, errors))
            };
            self.evaluator.eval(&body, &mut lookup)
        };
        match result {
            Ok(value) => value,
            Err(EvalFailure::Unresolved(name)) => {
                errors.push(error(context, &name, ExpansionErrorKind::Unknown));
                UNKNOWN_PLACEHOLDER.to_owned()
            }
            Err(EvalFailure::Failed(msg)) => {
                errors.push(error(context, body.trim(), ExpansionErrorKind::Eval(msg)));
                UNKNOWN_PLACEHOLDER.to_owned()
            }
        }
    }
}

/// Source of values for `kind = "user"` parameters nobody supplied.
pub trait Prompter {
    fn ask(&self, parameter: &FlatParameter) -> Result<String, String>;
}

/// Prompter for non-interactive runs: every question is an error.
pub struct NoPrompt;

impl Prompter for NoPrompt {
    fn ask(&self, _parameter: &FlatParameter) -> Result<String, String> {
        Err("no value supplied and prompting is disabled".to_owned())
    }
}

pub struct LockContext<'a> {
    /// Base for relative `from_file` paths.
    pub manifest_dir: &'a Path,
    pub stack_name: &'a str,
    pub deployment_id: &'a str,
    /// Values locked by a prior run; reused instead of prompting again.
    pub prior: &'a [LockedParameter],
}

/// Result of locking the stack's parameters.
#[derive(Debug, Clone, Default)]
pub struct LockedParameters {
    pub parameters: Vec<LockedParameter>,
    pub kinds: BTreeMap<String, ParameterKind>,
    /// Qualified name to value, including the injected `hub.*` values.
    pub table: BTreeMap<String, String>,
    pub errors: Vec<ExpansionError>,
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.filter(|s| !s.is_empty())
}

fn source_value(
    p: &FlatParameter,
    ctx: &LockContext<'_>,
    prompter: &dyn Prompter,
    errors: &mut Vec<ExpansionError>,
) -> String {
    let qname = p.qualified_name();
    if let Some(v) = non_empty(p.value.as_deref()) {
        return v.to_owned();
    }
    if let Some(var) = non_empty(p.from_env.as_deref()) {
        if let Ok(v) = std::env::var(var) {
            if !v.is_empty() {
                return v;
            }
        }
    }
    if let Some(file) = non_empty(p.from_file.as_deref()) {
        match std::fs::read_to_string(ctx.manifest_dir.join(file)) {
            Ok(content) => return content.trim().to_owned(),
            Err(e) => errors.push(error(
                &qname,
                file,
                ExpansionErrorKind::Source(e.to_string()),
            )),
        }
    }
    if let Some(v) = non_empty(p.default.as_deref()) {
        return v.to_owned();
    }
    if p.kind == ParameterKind::User {
        if let Some(prior) = ctx.prior.iter().find(|l| l.name == qname) {
            return prior.value.clone();
        }
        match prompter.ask(p) {
            Ok(v) => return v,
            Err(msg) => errors.push(error(&qname, &qname, ExpansionErrorKind::Prompt(msg))),
        }
    }
    String::new()
}

/// Resolve every flattened parameter to a value and expand the non-link ones
/// against the resulting table.
///
/// Errors are collected, never raised; the caller decides whether they are fatal.
pub fn lock_parameters(
    flat: &[FlatParameter],
    ctx: &LockContext<'_>,
    prompter: &dyn Prompter,
    expander: &Expander,
) -> LockedParameters {
    let mut locked = LockedParameters::default();
    locked
        .table
        .insert(DEPLOYMENT_ID_KEY.to_owned(), ctx.deployment_id.to_owned());
    locked
        .table
        .insert(STACK_NAME_KEY.to_owned(), ctx.stack_name.to_owned());

    for p in flat {
        let qname = p.qualified_name();
        let value = source_value(p, ctx, prompter, &mut locked.errors);
        if value.is_empty() && p.kind != ParameterKind::Link && !p.allows_empty() {
            locked
                .errors
                .push(error(&qname, &qname, ExpansionErrorKind::Empty));
        }
        debug!("locked {qname} = {}", mask(&qname, &value));
        locked.table.insert(qname.clone(), value.clone());
        locked.kinds.insert(qname.clone(), p.kind);
        locked.parameters.push(LockedParameter {
            name: qname,
            value,
            env: p.env.clone(),
        });
    }

    let mut expanded = Vec::new();
    for (idx, (p, lp)) in flat.iter().zip(&locked.parameters).enumerate() {
        if p.kind == ParameterKind::Link || !has_markers(&lp.value) {
            continue;
        }
        let scope = match p.component.as_deref() {
            Some(comp) => ExpansionScope::component(&locked.table, comp, &[]),
            None => ExpansionScope::stack(&locked.table),
        };
        let value = expander.expand(&scope, &lp.name, &lp.value, &mut locked.errors);
        expanded.push((idx, value));
    }
    for (idx, value) in expanded {
        let lp = &mut locked.parameters[idx];
        locked.table.insert(lp.name.clone(), value.clone());
        lp.value = value;
    }
    locked
}

/// The expanded view of the parameters and outputs one component sees.
#[derive(Debug, Clone)]
pub struct ComponentParameters {
    pub component: String,
    pub depends: Vec<String>,
    pub table: BTreeMap<String, String>,
    /// Parameters visible to the component, fully expanded.
    pub parameters: Vec<LockedParameter>,
}

impl ComponentParameters {
    /// Build the component's view and expand its parameters, link parameters included.
    ///
    /// Captured outputs of other components with the same declared kind are
    /// hidden from the component.
    pub fn build(
        expander: &Expander,
        locked: &LockedParameters,
        outputs: &[CapturedOutput],
        manifest: &Manifest,
        component: &Component,
        errors: &mut Vec<ExpansionError>,
    ) -> Self {
        let mut table = BTreeMap::new();
        for out in outputs {
            let producer_kind = out
                .component
                .as_deref()
                .and_then(|c| manifest.component(c))
                .and_then(|c| c.kind.as_deref());
            if component.kind.is_some() && producer_kind == component.kind.as_deref() {
                continue;
            }
            table.insert(out.key(), out.value.clone());
        }
        table.extend(locked.table.iter().map(|(k, v)| (k.clone(), v.clone())));
        table.insert(COMPONENT_NAME_KEY.to_owned(), component.name.clone());

        let visible: Vec<&LockedParameter> = locked
            .parameters
            .iter()
            .filter(|p| match p.name.split_once('|') {
                Some((_, comp)) => comp == component.name,
                None => true,
            })
            .collect();

        let mut expanded = Vec::with_capacity(visible.len());
        {
            let scope = ExpansionScope::component(&table, &component.name, &component.depends);
            for p in &visible {
                let value = expander.expand(&scope, &p.name, &p.value, errors);
                expanded.push(LockedParameter {
                    name: p.name.clone(),
                    value,
                    env: p.env.clone(),
                });
            }
        }
        for p in &expanded {
            table.insert(p.name.clone(), p.value.clone());
        }

        Self {
            component: component.name.clone(),
            depends: component.depends.clone(),
            table,
            parameters: expanded,
        }
    }

    pub fn scope(&self) -> ExpansionScope<'_> {
        ExpansionScope::component(&self.table, &self.component, &self.depends)
    }

    pub fn expand(
        &self,
        expander: &Expander,
        context: &str,
        input: &str,
        errors: &mut Vec<ExpansionError>,
    ) -> String {
        expander.expand(&self.scope(), context, input, errors)
    }

    /// Environment bindings requested by the visible parameters.
    pub fn env(&self) -> Vec<(String, String)> {
        self.parameters
            .iter()
            .filter_map(|p| p.env.as_ref().map(|e| (e.clone(), p.value.clone())))
            .collect()
    }

    /// The first gate parameter whose value is a false literal, if any.
    /// An unresolvable gate counts as false.
    pub fn disabled_by(&self, expander: &Expander, gates: &[String]) -> Option<String> {
        let scope = self.scope();
        for gate in gates {
            let mut ignored = Vec::new();
            let value = scope
                .resolve(gate)
                .map(|v| expander.expand(&scope, gate, v, &mut ignored));
            match value {
                Some(v) if !is_false_literal(&v) => {}
                _ => return Some(gate.clone()),
            }
        }
        None
    }

    /// Turn raw outputs into captured outputs and evaluate the declared ones.
    ///
    /// Declared output templates see the raw outputs as bare names. A
    /// declared output that does not resolve fails the whole capture.
    pub fn capture_outputs(
        &self,
        expander: &Expander,
        specs: &[OutputSpec],
        raw: &BTreeMap<String, String>,
    ) -> Result<Vec<CapturedOutput>, Vec<ExpansionError>> {
        let comp = self.component.as_str();
        let mut captured: Vec<CapturedOutput> = raw
            .iter()
            .map(|(k, v)| CapturedOutput::new(Some(comp), k, v))
            .collect();

        let mut table = self.table.clone();
        for (k, v) in raw {
            table.insert(k.clone(), v.clone());
            table.insert(format!("{k}:{comp}"), v.clone());
        }
        let scope = ExpansionScope::component(&table, comp, &self.depends);

        let mut errors = Vec::new();
        for spec in specs {
            let template = spec
                .value
                .clone()
                .unwrap_or_else(|| format!("${{{}}}", spec.name));
            let context = format!("output {}:{comp}", spec.name);
            let value = expander.expand(&scope, &context, &template, &mut errors);
            let mut out = CapturedOutput::new(Some(comp), &spec.name, &value);
            out.kind.clone_from(&spec.kind);
            out.brief.clone_from(&spec.brief);
            match captured.iter_mut().find(|c| c.name == spec.name) {
                Some(existing) => *existing = out,
                None => captured.push(out),
            }
        }
        if errors.is_empty() {
            Ok(captured)
        } else {
            Err(errors)
        }
    }
}

/// Evaluate stack-level outputs against stack parameters and captured outputs.
pub fn stack_outputs(
    expander: &Expander,
    locked: &LockedParameters,
    captured: &[CapturedOutput],
    specs: &[OutputSpec],
    errors: &mut Vec<ExpansionError>,
) -> Vec<CapturedOutput> {
    let mut table = locked.table.clone();
    for out in captured {
        table.insert(out.key(), out.value.clone());
    }
    let scope = ExpansionScope::stack(&table);
    specs
        .iter()
        .map(|spec| {
            let template = spec
                .value
                .clone()
                .unwrap_or_else(|| format!("${{{}}}", spec.name));
            let value = expander.expand(&scope, &format!("output {}", spec.name), &template, errors);
            let mut out = CapturedOutput::new(None, &spec.name, &value);
            out.kind.clone_from(&spec.kind);
            out.brief.clone_from(&spec.brief);
            out
        })
        .collect()
}
