//! Lifecycle execution engine for stackhub.
//!
//! This crate ties the manifest, the persisted state, and the component
//! delegates together into the `Engine`: it resolves the component order,
//! locks and expands parameters (`${name}` references and `#{expr}`
//! expressions), tracks which components provide which capabilities, gates
//! deployments on ready conditions, and drives the resumable per-component
//! state machine that ends in an aggregate stack status.

pub mod capabilities;
pub mod concurrency;
pub mod engine;
pub mod expr;
pub mod order;
pub mod params;
pub mod ready;
pub mod secrets;
pub mod status;

pub use capabilities::{
    CapabilityDelta, Provides, RequirementCheck, RequirementTuning, ENVIRONMENT_PROVIDER,
};
pub use concurrency::{install_signal_handler, CancellationToken, StateLock};
pub use engine::{Engine, RunOptions, RunReport, Selection};
pub use expr::Evaluator;
pub use order::{ensure_lifecycle_order, resolve_order, UndefinedDependency};
pub use params::{
    is_false_literal, lock_parameters, ExpansionError, ExpansionErrorKind, ExpansionScope,
    Expander, LockContext, LockedParameters, NoPrompt, Prompter, LOOP_PLACEHOLDER,
    MAX_EXPANSION_DEPTH, UNKNOWN_PLACEHOLDER,
};
pub use ready::{wait_ready, ReadyTarget};
pub use secrets::{looks_secret, mask, redact};
pub use status::{aggregate_stack_status, validate_transition};

use thiserror::Error;

fn join_display<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] stackhub_schema::ManifestError),
    #[error("state error: {0}")]
    State(#[from] stackhub_state::StateError),
    #[error("runtime error: {0}")]
    Runtime(#[from] stackhub_runtime::RuntimeError),
    #[error("undefined dependencies: {}", join_display(.0))]
    UndefinedDependencies(Vec<UndefinedDependency>),
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
    #[error("expansion failed: {}", join_display(.0))]
    Expansion(Vec<ExpansionError>),
    #[error("requirements of {component} not satisfied: {}", .missing.join(", "))]
    RequirementsNotSatisfied {
        component: String,
        missing: Vec<String>,
    },
    #[error("component {component} failed: {detail}")]
    ComponentFailed { component: String, detail: String },
    #[error("{target} not ready after {waited_secs}s")]
    ReadyTimeout { target: String, waited_secs: u64 },
    #[error("state at {0} is locked by another stackhub process")]
    StateLocked(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("unknown component: {0}")]
    UnknownComponent(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn is_manifest_error(&self) -> bool {
        matches!(
            self,
            CoreError::Manifest(_)
                | CoreError::UndefinedDependencies(_)
                | CoreError::DependencyCycle(_)
                | CoreError::UnknownComponent(_)
        )
    }

    pub fn is_state_error(&self) -> bool {
        matches!(self, CoreError::State(_) | CoreError::StateLocked(_))
    }
}
