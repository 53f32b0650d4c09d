use crate::delegate::{Delegate, DelegateOutput, Invocation};
use crate::RuntimeError;
use stackhub_state::Verb;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

type Callback = Arc<dyn Fn(&Invocation) + Send + Sync>;

#[derive(Clone, Default)]
struct Behavior {
    outputs: Vec<(String, String)>,
    fail: Option<i32>,
    callback: Option<Callback>,
}

/// A call observed by [`MockDelegate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub component: String,
    pub verb_name: String,
    pub env: Vec<(String, String)>,
    /// File name of the hook, `None` for the verb itself.
    pub hook: Option<String>,
}

/// In-memory delegate for tests: every invocation succeeds unless scripted
/// otherwise, and every call is recorded.
#[derive(Default)]
pub struct MockDelegate {
    behaviors: Mutex<HashMap<(String, Verb), Behavior>>,
    failing_hooks: Mutex<Vec<String>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, component: &str, verb: Verb, edit: impl FnOnce(&mut Behavior)) {
        if let Ok(mut map) = self.behaviors.lock() {
            edit(map.entry((component.to_owned(), verb)).or_default());
        }
    }

    /// Print `pairs` as an `Outputs:` block when `component` runs `verb`.
    #[must_use]
    pub fn with_outputs(self, component: &str, verb: Verb, pairs: &[(&str, &str)]) -> Self {
        self.script(component, verb, |b| {
            b.outputs = pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect();
        });
        self
    }

    /// Exit with a non-zero code when `component` runs `verb`.
    #[must_use]
    pub fn failing(self, component: &str, verb: Verb) -> Self {
        self.script(component, verb, |b| b.fail = Some(1));
        self
    }

    /// Run `f` whenever `component` runs `verb`, before the result is produced.
    #[must_use]
    pub fn on_invoke<F>(self, component: &str, verb: Verb, f: F) -> Self
    where
        F: Fn(&Invocation) + Send + Sync + 'static,
    {
        self.script(component, verb, |b| b.callback = Some(Arc::new(f)));
        self
    }

    /// Make every hook whose file name equals `file` fail.
    #[must_use]
    pub fn failing_hook(self, file: &str) -> Self {
        if let Ok(mut hooks) = self.failing_hooks.lock() {
            hooks.push(file.to_owned());
        }
        self
    }

    /// Clear scripted failures for `component`, keeping its outputs.
    pub fn recover(&self, component: &str, verb: Verb) {
        self.script(component, verb, |b| b.fail = None);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Verb invocations of `component`, hooks excluded.
    pub fn calls_for(&self, component: &str) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.component == component && c.hook.is_none())
            .collect()
    }

    pub fn invoked(&self, component: &str) -> bool {
        !self.calls_for(component).is_empty()
    }

    /// Components in the order their verbs were invoked.
    pub fn invocation_order(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.hook.is_none())
            .map(|c| c.component)
            .collect()
    }

    pub fn reset_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn record(&self, invocation: &Invocation, hook: Option<String>) -> Result<(), RuntimeError> {
        self.calls
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?
            .push(MockCall {
                component: invocation.component.clone(),
                verb_name: invocation.verb_name(),
                env: invocation.env.clone(),
                hook,
            });
        Ok(())
    }
}

impl Delegate for MockDelegate {
    fn name(&self) -> &str {
        "mock"
    }

    fn invoke(&self, invocation: &Invocation) -> Result<DelegateOutput, RuntimeError> {
        self.record(invocation, None)?;
        let behavior = self
            .behaviors
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?
            .get(&(invocation.component.clone(), invocation.verb))
            .cloned()
            .unwrap_or_default();

        if let Some(cb) = &behavior.callback {
            cb(invocation);
        }
        if let Some(code) = behavior.fail {
            return Ok(DelegateOutput {
                stdout: Vec::new(),
                stderr: format!("mock failure of {}", invocation.component).into_bytes(),
                exit_code: Some(code),
            });
        }

        let mut stdout = String::new();
        if !behavior.outputs.is_empty() {
            stdout.push_str("Outputs:\n");
            for (k, v) in &behavior.outputs {
                stdout.push_str(&format!("{k} = {v}\n"));
            }
        }
        Ok(DelegateOutput {
            stdout: stdout.into_bytes(),
            stderr: Vec::new(),
            exit_code: Some(0),
        })
    }

    fn run_hook(
        &self,
        script: &Path,
        invocation: &Invocation,
    ) -> Result<DelegateOutput, RuntimeError> {
        let file = script
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.record(invocation, Some(file.clone()))?;
        let fails = self
            .failing_hooks
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?
            .contains(&file);
        Ok(DelegateOutput {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: Some(i32::from(fails)),
        })
    }
}
