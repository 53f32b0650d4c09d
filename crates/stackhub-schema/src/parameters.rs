use serde::{Deserialize, Serialize};
use std::fmt;

/// Value of `empty` that lets a parameter lock with an empty value.
pub const EMPTY_ALLOW: &str = "allow";

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    #[default]
    Plain,
    /// Supplied by the operator; asked for when empty.
    User,
    Tech,
    /// Expanded per component only, typically referencing outputs.
    Link,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterKind::Plain => write!(f, "plain"),
            ParameterKind::User => write!(f, "user"),
            ParameterKind::Tech => write!(f, "tech"),
            ParameterKind::Link => write!(f, "link"),
        }
    }
}

/// A parameter declaration as written in the manifest, possibly nested.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub kind: ParameterKind,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub default: Option<String>,
    /// Environment variable the locked value is exported as to the delegate.
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub from_env: Option<String>,
    #[serde(default)]
    pub from_file: Option<String>,
    #[serde(default)]
    pub empty: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// A parameter after flattening: `name` is the full dotted path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlatParameter {
    pub name: String,
    pub component: Option<String>,
    pub kind: ParameterKind,
    pub value: Option<String>,
    pub default: Option<String>,
    pub env: Option<String>,
    pub from_env: Option<String>,
    pub from_file: Option<String>,
    pub empty: Option<String>,
}

impl FlatParameter {
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.name, self.component.as_deref())
    }

    pub fn allows_empty(&self) -> bool {
        self.empty.as_deref() == Some(EMPTY_ALLOW)
    }
}

/// `name` or `name|component`.
pub fn qualified_name(name: &str, component: Option<&str>) -> String {
    match component {
        Some(c) if !c.is_empty() => format!("{name}|{c}"),
        _ => name.to_owned(),
    }
}

pub fn split_qualified(qualified: &str) -> (&str, Option<&str>) {
    match qualified.split_once('|') {
        Some((name, component)) => (name, Some(component)),
        None => (qualified, None),
    }
}

/// Flatten a parameter tree into dotted qualified parameters.
///
/// A node with children is emitted itself only when it carries a value source;
/// otherwise it only contributes its name as a prefix. Children inherit the
/// parent's `component` unless they declare their own.
pub fn flatten_parameters(params: &[Parameter]) -> Vec<FlatParameter> {
    let mut out = Vec::new();
    for p in params {
        flatten_into(p, None, None, &mut out);
    }
    out
}

fn flatten_into(
    p: &Parameter,
    prefix: Option<&str>,
    inherited_component: Option<&str>,
    out: &mut Vec<FlatParameter>,
) {
    let name = match prefix {
        Some(pre) => format!("{pre}.{}", p.name),
        None => p.name.clone(),
    };
    let component = p
        .component
        .as_deref()
        .or(inherited_component)
        .map(str::to_owned);

    let has_source = p.value.is_some()
        || p.default.is_some()
        || p.from_env.is_some()
        || p.from_file.is_some()
        || p.env.is_some();
    if p.parameters.is_empty() || has_source {
        out.push(FlatParameter {
            name: name.clone(),
            component: component.clone(),
            kind: p.kind,
            value: p.value.clone(),
            default: p.default.clone(),
            env: p.env.clone(),
            from_env: p.from_env.clone(),
            from_file: p.from_file.clone(),
            empty: p.empty.clone(),
        });
    }

    for child in &p.parameters {
        flatten_into(child, Some(&name), component.as_deref(), out);
    }
}
