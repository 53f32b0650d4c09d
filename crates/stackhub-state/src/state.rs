use crate::StateError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current state document version. Incremented on incompatible changes.
pub const STATE_FORMAT_VERSION: u32 = 1;
pub const STATE_KIND: &str = "state";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Deploy,
    Undeploy,
    Backup,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Deploy => "deploy",
            Verb::Undeploy => "undeploy",
            Verb::Backup => "backup",
        }
    }

    pub fn in_progress(self) -> ComponentStatus {
        match self {
            Verb::Deploy => ComponentStatus::Deploying,
            Verb::Undeploy => ComponentStatus::Undeploying,
            Verb::Backup => ComponentStatus::Backuping,
        }
    }

    pub fn stack_in_progress(self) -> StackStatus {
        match self {
            Verb::Deploy => StackStatus::Deploying,
            Verb::Undeploy => StackStatus::Undeploying,
            Verb::Backup => StackStatus::Backuping,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Deploying,
    Deployed,
    Undeploying,
    Undeployed,
    Backuping,
    Error,
}

impl ComponentStatus {
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            ComponentStatus::Deploying | ComponentStatus::Undeploying | ComponentStatus::Backuping
        )
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentStatus::Deploying => write!(f, "deploying"),
            ComponentStatus::Deployed => write!(f, "deployed"),
            ComponentStatus::Undeploying => write!(f, "undeploying"),
            ComponentStatus::Undeployed => write!(f, "undeployed"),
            ComponentStatus::Backuping => write!(f, "backuping"),
            ComponentStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    Deploying,
    Undeploying,
    Backuping,
    Deployed,
    Undeployed,
    Incomplete,
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackStatus::Deploying => write!(f, "deploying"),
            StackStatus::Undeploying => write!(f, "undeploying"),
            StackStatus::Backuping => write!(f, "backuping"),
            StackStatus::Deployed => write!(f, "deployed"),
            StackStatus::Undeployed => write!(f, "undeployed"),
            StackStatus::Incomplete => write!(f, "incomplete"),
        }
    }
}

/// A parameter whose value is resolved and safe to substitute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockedParameter {
    /// Qualified name: `name` or `name|component`.
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

/// A value produced by a component run, keyed by `name[:component]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapturedOutput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
}

impl CapturedOutput {
    pub fn new(component: Option<&str>, name: &str, value: &str) -> Self {
        Self {
            name: name.to_owned(),
            component: component.map(str::to_owned),
            value: value.to_owned(),
            kind: None,
            brief: None,
        }
    }

    pub fn key(&self) -> String {
        match self.component.as_deref() {
            Some(c) => format!("{}:{c}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Progress record of one component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateStep {
    pub status: ComponentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub started_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub parameters: Vec<LockedParameter>,
    #[serde(default)]
    pub raw_outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: Vec<CapturedOutput>,
    /// Capabilities this component was registered for on its last deploy.
    #[serde(default)]
    pub provides: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    InProgress,
    Success,
    Incomplete,
    Error,
    Cancelled,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::InProgress => write!(f, "in-progress"),
            OperationStatus::Success => write!(f, "success"),
            OperationStatus::Incomplete => write!(f, "incomplete"),
            OperationStatus::Error => write!(f, "error"),
            OperationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One entry of the append-only operations log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation {
    pub id: String,
    pub verb: Verb,
    pub timestamp: String,
    pub status: OperationStatus,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateMeta {
    pub stack_name: String,
    pub deployment_id: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StackStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The durable source of truth for resuming a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateManifest {
    pub version: u32,
    pub kind: String,
    pub meta: StateMeta,
    #[serde(default)]
    pub lifecycle_order: Vec<String>,
    #[serde(default)]
    pub stack_parameters: Vec<LockedParameter>,
    #[serde(default)]
    pub captured_outputs: Vec<CapturedOutput>,
    #[serde(default)]
    pub stack_outputs: Vec<CapturedOutput>,
    #[serde(default)]
    pub provides: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub components: BTreeMap<String, StateStep>,
    #[serde(default)]
    pub operations: Vec<Operation>,
    /// blake3 over the document with this field absent. `None` for hand-written state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn generate_deployment_id(stack_name: &str) -> String {
    let seed = format!(
        "{stack_name}:{}",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
    blake3::hash(seed.as_bytes()).to_hex()[..16].to_owned()
}

impl StateManifest {
    pub fn new(stack_name: &str) -> Self {
        let ts = now();
        Self {
            version: STATE_FORMAT_VERSION,
            kind: STATE_KIND.to_owned(),
            meta: StateMeta {
                stack_name: stack_name.to_owned(),
                deployment_id: generate_deployment_id(stack_name),
                created_at: ts.clone(),
                updated_at: ts,
                status: None,
                message: None,
            },
            lifecycle_order: Vec::new(),
            stack_parameters: Vec::new(),
            captured_outputs: Vec::new(),
            stack_outputs: Vec::new(),
            provides: BTreeMap::new(),
            components: BTreeMap::new(),
            operations: Vec::new(),
            checksum: None,
        }
    }

    /// Carry progress of a prior run into this freshly created state.
    ///
    /// Identity, per-component steps, capabilities, outputs, and the operations
    /// log come from `prior`; the lifecycle order and stack parameters stay as
    /// computed for the current run.
    pub fn merge_prior(&mut self, prior: StateManifest) {
        self.meta.deployment_id = prior.meta.deployment_id;
        self.meta.created_at = prior.meta.created_at;
        self.meta.status = prior.meta.status;
        self.meta.message = prior.meta.message;
        if self.lifecycle_order.is_empty() {
            self.lifecycle_order = prior.lifecycle_order;
        }
        if self.stack_parameters.is_empty() {
            self.stack_parameters = prior.stack_parameters;
        }
        self.captured_outputs = prior.captured_outputs;
        self.stack_outputs = prior.stack_outputs;
        self.provides = prior.provides;
        self.components = prior.components;
        self.operations = prior.operations;
    }

    pub fn step(&self, component: &str) -> Option<&StateStep> {
        self.components.get(component)
    }

    pub fn status_of(&self, component: &str) -> Option<ComponentStatus> {
        self.components.get(component).map(|s| s.status)
    }

    pub fn statuses(&self) -> BTreeMap<String, ComponentStatus> {
        self.components
            .iter()
            .map(|(name, step)| (name.clone(), step.status))
            .collect()
    }

    /// Set a component's status, creating its step on first use.
    pub fn set_status(&mut self, component: &str, status: ComponentStatus, message: Option<String>) {
        let ts = now();
        let step = self
            .components
            .entry(component.to_owned())
            .or_insert_with(|| StateStep {
                status,
                message: None,
                started_at: ts.clone(),
                updated_at: ts.clone(),
                parameters: Vec::new(),
                raw_outputs: BTreeMap::new(),
                outputs: Vec::new(),
                provides: Vec::new(),
            });
        if status.is_in_progress() {
            step.started_at.clone_from(&ts);
        }
        step.status = status;
        step.message = message;
        step.updated_at = ts.clone();
        self.meta.updated_at = ts;
    }

    pub fn step_mut(&mut self, component: &str) -> Option<&mut StateStep> {
        self.components.get_mut(component)
    }

    pub fn clear_step(&mut self, component: &str) {
        if self.components.remove(component).is_some() {
            self.meta.updated_at = now();
        }
    }

    /// Outputs of all components, in lifecycle order first, then the rest.
    pub fn component_outputs(&self) -> Vec<CapturedOutput> {
        let mut out = Vec::new();
        for name in &self.lifecycle_order {
            if let Some(step) = self.components.get(name) {
                out.extend(step.outputs.iter().cloned());
            }
        }
        for (name, step) in &self.components {
            if !self.lifecycle_order.contains(name) {
                out.extend(step.outputs.iter().cloned());
            }
        }
        out
    }

    pub fn refresh_captured_outputs(&mut self) {
        self.captured_outputs = self.component_outputs();
    }

    pub fn set_stack_status(&mut self, status: StackStatus, message: Option<String>) {
        self.meta.status = Some(status);
        self.meta.message = message;
        self.meta.updated_at = now();
    }

    /// Append an in-progress operation and return its id.
    pub fn begin_operation(
        &mut self,
        verb: Verb,
        components: Vec<String>,
        options: BTreeMap<String, String>,
    ) -> String {
        let ts = chrono::Utc::now();
        let id = format!(
            "{}-{}",
            ts.format("%Y%m%d%H%M%S%3f"),
            &blake3::hash(format!("{}:{verb}", self.meta.deployment_id).as_bytes()).to_hex()[..8]
        );
        self.operations.push(Operation {
            id: id.clone(),
            verb,
            timestamp: ts.to_rfc3339(),
            status: OperationStatus::InProgress,
            components,
            options,
            message: None,
        });
        id
    }

    pub fn finish_operation(&mut self, id: &str, status: OperationStatus, message: Option<String>) {
        if let Some(op) = self.operations.iter_mut().rev().find(|op| op.id == id) {
            op.status = status;
            op.message = message;
        }
    }

    fn compute_checksum(&self) -> Result<String, StateError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    /// Serialize with an embedded checksum.
    pub fn to_json(&self) -> Result<String, StateError> {
        let mut sealed = self.clone();
        sealed.checksum = Some(sealed.compute_checksum()?);
        Ok(serde_json::to_string_pretty(&sealed)?)
    }

    pub fn from_json(content: &[u8], origin: &str) -> Result<Self, StateError> {
        let state: StateManifest = serde_json::from_slice(content)?;
        if state.kind != STATE_KIND {
            return Err(StateError::KindMismatch {
                expected: STATE_KIND.to_owned(),
                found: state.kind,
            });
        }
        if state.version != STATE_FORMAT_VERSION {
            return Err(StateError::VersionMismatch {
                kind: STATE_KIND.to_owned(),
                expected: STATE_FORMAT_VERSION,
                found: state.version,
            });
        }
        if let Some(ref expected) = state.checksum {
            let actual = state.compute_checksum()?;
            if actual != *expected {
                return Err(StateError::IntegrityFailure {
                    path: origin.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(state)
    }
}
