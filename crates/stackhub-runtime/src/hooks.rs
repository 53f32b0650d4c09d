use crate::delegate::{Delegate, Invocation};
use crate::RuntimeError;
use stackhub_schema::Hook;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    /// Trigger string a hook pattern is matched against, e.g. `pre-deploy`.
    pub fn trigger(self, verb_name: &str) -> String {
        match self {
            HookPhase::Pre => format!("pre-{verb_name}"),
            HookPhase::Post => format!("post-{verb_name}"),
        }
    }
}

/// Hooks with at least one trigger pattern matching `trigger`, in declaration order.
///
/// Malformed patterns never match.
pub fn matching_hooks<'a>(hooks: &'a [Hook], trigger: &str) -> Vec<&'a Hook> {
    hooks
        .iter()
        .filter(|h| {
            h.triggers.iter().any(|t| match glob::Pattern::new(t) {
                Ok(p) => p.matches(trigger),
                Err(e) => {
                    warn!("invalid hook trigger '{t}' on {}: {e}", h.file);
                    false
                }
            })
        })
        .collect()
}

/// Run the hooks of one phase for an invocation.
///
/// Hook paths are relative to the component directory. A failing hook is
/// fatal unless it declares `error = "ignore"`.
pub fn run_hooks(
    delegate: &dyn Delegate,
    hooks: &[Hook],
    phase: HookPhase,
    invocation: &Invocation,
) -> Result<(), RuntimeError> {
    let trigger = phase.trigger(&invocation.verb_name());
    for hook in matching_hooks(hooks, &trigger) {
        let script = invocation.dir.join(&hook.file);
        debug!("{trigger} hook {} for {}", hook.file, invocation.component);

        let detail = match delegate.run_hook(&script, invocation) {
            Ok(out) if out.success() => continue,
            Ok(out) => out.failure_detail(),
            Err(e) => e.to_string(),
        };
        if hook.ignores_errors() {
            warn!(
                "ignoring failed hook {} of {}: {detail}",
                hook.file, invocation.component
            );
            continue;
        }
        return Err(RuntimeError::HookFailed {
            component: invocation.component.clone(),
            hook: hook.file.clone(),
            detail,
        });
    }
    Ok(())
}
