use stackhub_runtime::{format_missing, EnvRequirement};
use stackhub_schema::{Component, Manifest};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};

/// Provider name for capabilities satisfied by the ambient environment.
pub const ENVIRONMENT_PROVIDER: &str = "*environment*";

/// Which providers currently satisfy each capability, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provides {
    map: BTreeMap<String, Vec<String>>,
}

impl Provides {
    pub fn from_map(mut map: BTreeMap<String, Vec<String>>) -> Self {
        map.retain(|_, providers| !providers.is_empty());
        Self { map }
    }

    pub fn as_map(&self) -> &BTreeMap<String, Vec<String>> {
        &self.map
    }

    pub fn into_map(self) -> BTreeMap<String, Vec<String>> {
        self.map
    }

    pub fn is_provided(&self, capability: &str) -> bool {
        self.map.get(capability).is_some_and(|p| !p.is_empty())
    }

    pub fn providers(&self, capability: &str) -> &[String] {
        self.map.get(capability).map(Vec::as_slice).unwrap_or_default()
    }

    /// The provider that wins when several satisfy a capability: the latest.
    pub fn provider(&self, capability: &str) -> Option<&str> {
        self.providers(capability).last().map(String::as_str)
    }

    /// Register `provider` for `capability`. Re-adding is a no-op.
    pub fn add(&mut self, capability: &str, provider: &str) {
        let providers = self.map.entry(capability.to_owned()).or_default();
        if providers.iter().any(|p| p == provider) {
            return;
        }
        if let Some(previous) = providers.last() {
            warn!("capability {capability} provided by both {previous} and {provider}; {provider} wins");
        }
        providers.push(provider.to_owned());
    }

    /// Drop `provider` everywhere, and every capability left without providers.
    pub fn remove_provider(&mut self, provider: &str) {
        for providers in self.map.values_mut() {
            providers.retain(|p| p != provider);
        }
        self.map.retain(|_, providers| !providers.is_empty());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TuningEntry {
    stack: bool,
    all_components: bool,
    components: BTreeSet<String>,
    excluded: BTreeSet<String>,
}

/// Rules that turn missing requirements into skips.
///
/// Rules apply in order, each overriding the older ones it overlaps:
/// `cap` (stack and every component), `cap:*` (every component),
/// `cap:comp`, `!cap` (forget every older rule for `cap`), and `!cap:comp`
/// (forget older rules for `cap` as they apply to `comp`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementTuning {
    entries: BTreeMap<String, TuningEntry>,
}

impl RequirementTuning {
    pub fn parse<S: AsRef<str>>(rules: &[S]) -> Self {
        let mut tuning = Self::default();
        for rule in rules {
            tuning.apply(rule.as_ref());
        }
        tuning
    }

    pub fn apply(&mut self, rule: &str) {
        let rule = rule.trim();
        let (erase, body) = match rule.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, rule),
        };
        let (cap, scope) = match body.split_once(':') {
            Some((cap, comp)) => (cap.trim(), Some(comp.trim())),
            None => (body, None),
        };
        if cap.is_empty() {
            return;
        }

        match (erase, scope) {
            (true, None) => {
                self.entries.remove(cap);
            }
            (true, Some("*")) => {
                if let Some(e) = self.entries.get_mut(cap) {
                    e.all_components = false;
                    e.components.clear();
                }
            }
            (true, Some(comp)) => {
                if let Some(e) = self.entries.get_mut(cap) {
                    e.components.remove(comp);
                    e.excluded.insert(comp.to_owned());
                }
            }
            (false, None) => {
                let e = self.entries.entry(cap.to_owned()).or_default();
                e.stack = true;
                e.all_components = true;
                e.excluded.clear();
            }
            (false, Some("*")) => {
                let e = self.entries.entry(cap.to_owned()).or_default();
                e.all_components = true;
                e.excluded.clear();
            }
            (false, Some(comp)) => {
                let e = self.entries.entry(cap.to_owned()).or_default();
                e.excluded.remove(comp);
                e.components.insert(comp.to_owned());
            }
        }
    }

    /// Whether `capability` is optional for `component`, or for the stack itself when `None`.
    pub fn is_optional(&self, capability: &str, component: Option<&str>) -> bool {
        let Some(e) = self.entries.get(capability) else {
            return false;
        };
        match component {
            None => e.stack,
            Some(c) => e.components.contains(c) || (e.all_components && !e.excluded.contains(c)),
        }
    }
}

/// Outcome of checking a component's `requires` against the provides map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementCheck {
    pub missing_mandatory: Vec<String>,
    pub missing_optional: Vec<String>,
}

impl RequirementCheck {
    pub fn satisfied(&self) -> bool {
        self.missing_mandatory.is_empty() && self.missing_optional.is_empty()
    }
}

pub fn check_requirements(
    component: &Component,
    provides: &Provides,
    tuning: &RequirementTuning,
) -> RequirementCheck {
    let mut check = RequirementCheck::default();
    for req in &component.requires {
        if provides.is_provided(req) {
            continue;
        }
        if tuning.is_optional(req, Some(component.name.as_str())) {
            check.missing_optional.push(req.clone());
        } else {
            check.missing_mandatory.push(req.clone());
        }
    }
    check
}

/// Probe the environment for requirements nothing else will satisfy and
/// register the present ones under [`ENVIRONMENT_PROVIDER`].
///
/// A requirement is probed when no component declares it and it is not
/// already provided. Requirements that are not environment capabilities are
/// left alone: a component may still report them through its `provides`
/// output, and the per-component check fails when none has by the time a
/// consumer runs. Returns the capabilities registered.
pub fn probe_environment(
    manifest: &Manifest,
    provides: &mut Provides,
    timeout: Duration,
) -> Vec<String> {
    let declared: BTreeSet<&str> = manifest
        .components
        .iter()
        .flat_map(|c| c.provides.iter())
        .map(String::as_str)
        .collect();
    let candidates: BTreeSet<&str> = manifest
        .requires
        .iter()
        .chain(manifest.components.iter().flat_map(|c| c.requires.iter()))
        .map(String::as_str)
        .collect();

    let mut registered = Vec::new();
    let mut missing = Vec::new();
    for cap in candidates {
        if declared.contains(cap) || provides.is_provided(cap) {
            continue;
        }
        let requirement = EnvRequirement::parse(cap);
        if matches!(requirement, EnvRequirement::Unknown(_)) {
            debug!("{cap} is not an environment capability, leaving it to the components");
            continue;
        }
        if requirement.probe(timeout).unwrap_or(false) {
            provides.add(cap, ENVIRONMENT_PROVIDER);
            registered.push(cap.to_owned());
        } else {
            missing.push(requirement.missing());
        }
    }
    if !missing.is_empty() {
        debug!("{}", format_missing(&missing));
    }
    registered
}

/// A pending change to the provides map, applied only after the step that
/// produced it has been persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityDelta {
    Register {
        component: String,
        capabilities: Vec<String>,
    },
    Withdraw {
        component: String,
    },
}

impl CapabilityDelta {
    /// Declared plus dynamically reported capabilities of a deployed component.
    pub fn register(component: &Component, dynamic: &[String]) -> Self {
        let mut capabilities: Vec<String> = Vec::new();
        for cap in component.provides.iter().chain(dynamic) {
            if !capabilities.contains(cap) {
                capabilities.push(cap.clone());
            }
        }
        CapabilityDelta::Register {
            component: component.name.clone(),
            capabilities,
        }
    }

    /// Stack-level capabilities, provided under the stack name.
    pub fn register_stack(stack: &str, capabilities: &[String]) -> Self {
        let mut deduped: Vec<String> = Vec::new();
        for cap in capabilities {
            if !deduped.contains(cap) {
                deduped.push(cap.clone());
            }
        }
        CapabilityDelta::Register {
            component: stack.to_owned(),
            capabilities: deduped,
        }
    }

    pub fn withdraw(component: &str) -> Self {
        CapabilityDelta::Withdraw {
            component: component.to_owned(),
        }
    }

    pub fn apply(&self, provides: &mut Provides) {
        match self {
            CapabilityDelta::Register {
                component,
                capabilities,
            } => {
                for cap in capabilities {
                    provides.add(cap, component);
                }
            }
            CapabilityDelta::Withdraw { component } => provides.remove_provider(component),
        }
    }
}
