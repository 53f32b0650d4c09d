//! Execution boundary for stackhub components.
//!
//! This crate implements everything that touches the outside world on behalf
//! of a component: the pluggable `Delegate` trait with a process-based
//! implementation (stdout/stderr drained concurrently) and a scriptable mock,
//! glob-triggered pre/post hooks, parsing of the `Outputs:` block a component
//! prints, and probes for environment-level capabilities such as installed
//! command-line tools.

pub mod delegate;
pub mod hooks;
pub mod mock;
pub mod outputs;
pub mod prereq;
pub mod process;

pub use delegate::{select_delegate, Delegate, DelegateOutput, Invocation};
pub use hooks::{matching_hooks, run_hooks, HookPhase};
pub use mock::{MockCall, MockDelegate};
pub use outputs::{parse_outputs, split_reserved, take_dynamic_provides, ReservedOutputs};
pub use prereq::{format_missing, EnvRequirement, MissingPrereq};
pub use process::ProcessDelegate;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("delegate '{0}' is not available")]
    DelegateUnavailable(String),
    #[error("component '{component}' has no '{verb}' implementation in {dir}")]
    NoImplementation {
        component: String,
        verb: String,
        dir: String,
    },
    #[error("execution failed: {0}")]
    ExecFailed(String),
    #[error("hook '{hook}' of component '{component}' failed: {detail}")]
    HookFailed {
        component: String,
        hook: String,
        detail: String,
    },
    #[error("unknown environment requirement '{0}'")]
    UnknownRequirement(String),
}
