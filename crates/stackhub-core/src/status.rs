use crate::CoreError;
use stackhub_schema::Manifest;
use stackhub_state::{ComponentStatus, StackStatus};
use std::collections::{BTreeMap, BTreeSet};

/// Guard for component step updates. `None` is a component never run.
pub fn validate_transition(
    from: Option<ComponentStatus>,
    to: ComponentStatus,
) -> Result<(), CoreError> {
    use stackhub_state::ComponentStatus::{
        Backuping, Deployed, Deploying, Error, Undeployed, Undeploying,
    };

    let valid = to.is_in_progress()
        || to == Error
        || matches!(
            (from, to),
            (Some(Deploying), Deployed)
                | (Some(Undeploying), Undeployed)
                | (Some(Backuping), Deployed | Undeployed)
        );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.map_or_else(|| "pending".to_owned(), |s| s.to_string()),
            to: to.to_string(),
        })
    }
}

fn describe(name: &str, statuses: &BTreeMap<String, ComponentStatus>) -> String {
    match statuses.get(name) {
        Some(s) => format!("{name}={s}"),
        None => format!("{name}=pending"),
    }
}

/// Aggregate stack status from component statuses and the mandatory/optional
/// partition. Components in `skipped` do not count.
///
/// Returns a diagnostic listing every counted component when the stack is
/// `incomplete`.
pub fn aggregate_stack_status(
    manifest: &Manifest,
    statuses: &BTreeMap<String, ComponentStatus>,
    skipped: &BTreeSet<String>,
) -> (StackStatus, Option<String>) {
    let counted = |names: Vec<String>| -> Vec<String> {
        names.into_iter().filter(|n| !skipped.contains(n)).collect()
    };
    let mandatory = counted(manifest.mandatory_components());
    let optional = counted(manifest.optional_components());
    let is = |name: &String, want: ComponentStatus| statuses.get(name) == Some(&want);

    let any_optional_deployed = optional.iter().any(|n| is(n, ComponentStatus::Deployed));

    if mandatory.is_empty() {
        let status = if any_optional_deployed {
            StackStatus::Deployed
        } else {
            StackStatus::Undeployed
        };
        return (status, None);
    }
    if mandatory.iter().all(|n| is(n, ComponentStatus::Deployed)) {
        return (StackStatus::Deployed, None);
    }
    if mandatory.iter().all(|n| is(n, ComponentStatus::Undeployed)) && !any_optional_deployed {
        return (StackStatus::Undeployed, None);
    }

    let listing: Vec<String> = mandatory
        .iter()
        .chain(optional.iter())
        .map(|n| describe(n, statuses))
        .collect();
    (
        StackStatus::Incomplete,
        Some(format!("stack incomplete: {}", listing.join(", "))),
    )
}
