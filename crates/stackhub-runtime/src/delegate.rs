use crate::RuntimeError;
use stackhub_state::Verb;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One request to run a component implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub component: String,
    pub dir: PathBuf,
    pub verb: Verb,
    pub dry_run: bool,
    /// Variables passed to the implementation in addition to the inherited environment.
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(component: &str, dir: impl Into<PathBuf>, verb: Verb) -> Self {
        Self {
            component: component.to_owned(),
            dir: dir.into(),
            verb,
            dry_run: false,
            env: Vec::new(),
        }
    }

    /// `deploy`, or `deploy-test` for a dry run.
    pub fn verb_name(&self) -> String {
        if self.dry_run {
            format!("{}-test", self.verb)
        } else {
            self.verb.to_string()
        }
    }

    /// Per-invocation seed exported to the implementation.
    pub fn random_seed(&self) -> String {
        let seed = format!(
            "{}:{}:{}",
            self.component,
            self.verb,
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        blake3::hash(seed.as_bytes()).to_hex()[..16].to_owned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelegateOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl DelegateOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last few stderr lines, for error messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let all: Vec<&str> = text.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }

    pub fn failure_detail(&self) -> String {
        let status = match self.exit_code {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_owned(),
        };
        let tail = self.stderr_tail(5);
        if tail.is_empty() {
            status
        } else {
            format!("{status}: {tail}")
        }
    }
}

/// External executor of component business logic.
///
/// Invocation is a single blocking call; cancellation never interrupts it.
pub trait Delegate: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(&self, invocation: &Invocation) -> Result<DelegateOutput, RuntimeError>;

    /// Run a hook script located at `script` with the invocation's environment.
    fn run_hook(
        &self,
        script: &Path,
        invocation: &Invocation,
    ) -> Result<DelegateOutput, RuntimeError>;
}

impl<D: Delegate + ?Sized> Delegate for Arc<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn invoke(&self, invocation: &Invocation) -> Result<DelegateOutput, RuntimeError> {
        (**self).invoke(invocation)
    }

    fn run_hook(
        &self,
        script: &Path,
        invocation: &Invocation,
    ) -> Result<DelegateOutput, RuntimeError> {
        (**self).run_hook(script, invocation)
    }
}

pub fn select_delegate(name: &str) -> Result<Box<dyn Delegate>, RuntimeError> {
    match name {
        "process" => Ok(Box::new(crate::process::ProcessDelegate::new())),
        "mock" => Ok(Box::new(crate::mock::MockDelegate::new())),
        other => Err(RuntimeError::DelegateUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_delegates() {
        assert_eq!(select_delegate("process").unwrap().name(), "process");
        assert_eq!(select_delegate("mock").unwrap().name(), "mock");
    }

    #[test]
    fn select_invalid_delegate_fails() {
        assert!(matches!(
            select_delegate("ssh"),
            Err(RuntimeError::DelegateUnavailable(_))
        ));
    }

    #[test]
    fn verb_name_has_test_suffix_on_dry_run() {
        let mut inv = Invocation::new("db", "/tmp", Verb::Undeploy);
        assert_eq!(inv.verb_name(), "undeploy");
        inv.dry_run = true;
        assert_eq!(inv.verb_name(), "undeploy-test");
    }

    #[test]
    fn failure_detail_includes_stderr_tail() {
        let out = DelegateOutput {
            stdout: Vec::new(),
            stderr: b"one\ntwo\nthree\nfour\nfive\nsix\n".to_vec(),
            exit_code: Some(2),
        };
        assert!(!out.success());
        let detail = out.failure_detail();
        assert!(detail.starts_with("exited with code 2"));
        assert!(detail.contains("six"));
        assert!(!detail.contains("one"));
    }

    #[test]
    fn random_seed_is_short_hex() {
        let inv = Invocation::new("db", "/tmp", Verb::Deploy);
        let seed = inv.random_seed();
        assert_eq!(seed.len(), 16);
        assert!(seed.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
