use crate::parameters::Parameter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default wait budget for a ready condition.
pub const DEFAULT_READY_WAIT_SECS: u64 = 1200;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported manifest_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("meta.name must not be empty")]
    EmptyStackName,
    #[error("component name must not be empty")]
    EmptyComponentName,
    #[error("component '{0}' is declared more than once")]
    DuplicateComponent(String),
    #[error("{context} references unknown component '{name}'")]
    UnknownComponent { context: String, name: String },
    #[error("component '{0}' is listed as both mandatory and optional")]
    ConflictingPartition(String),
    #[error("ready condition for {0} declares neither dns nor url")]
    EmptyReadyCondition(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub manifest_version: u32,
    pub meta: MetaSection,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MetaSection {
    pub name: String,
    #[serde(default)]
    pub brief: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LifecycleSection {
    /// Explicit execution order. When empty it is derived from `depends`.
    #[serde(default)]
    pub order: Vec<String>,
    #[serde(default)]
    pub mandatory: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default)]
    pub optional_requires: Vec<String>,
    #[serde(default = "default_delegate")]
    pub delegate: String,
    #[serde(default)]
    pub ready_conditions: Vec<ReadyCondition>,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            mandatory: Vec::new(),
            optional: Vec::new(),
            optional_requires: Vec::new(),
            delegate: default_delegate(),
            ready_conditions: Vec::new(),
        }
    }
}

fn default_delegate() -> String {
    "process".to_owned()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Component {
    pub name: String,
    /// Implementation directory, relative to the manifest. Defaults to `components/<name>`.
    #[serde(default)]
    pub source: Option<String>,
    /// Declared kind. Components of the same kind never see each other's outputs.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    /// Parameters gating this component: a false-like value skips it.
    #[serde(default)]
    pub enabled_by: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub hooks: Vec<Hook>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

impl Component {
    pub fn source_dir(&self, manifest_dir: &Path) -> PathBuf {
        match self.source.as_deref() {
            Some(src) if !src.is_empty() => manifest_dir.join(src),
            _ => manifest_dir.join("components").join(&self.name),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Hook {
    pub file: String,
    /// Glob-style patterns over `<pre|post>-<verb>`, e.g. `pre-*` or `*-deploy`.
    pub triggers: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Hook {
    pub fn ignores_errors(&self) -> bool {
        self.error.as_deref() == Some("ignore")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OutputSpec {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub brief: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReadyCondition {
    /// Component gated by this condition; stack-level when absent.
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub dns: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub wait_seconds: Option<u64>,
}

impl ReadyCondition {
    pub fn wait_seconds(&self) -> u64 {
        self.wait_seconds.unwrap_or(DEFAULT_READY_WAIT_SECS)
    }
}

impl Manifest {
    pub fn stack_name(&self) -> &str {
        &self.meta.name
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn component_names(&self) -> Vec<&str> {
        self.components.iter().map(|c| c.name.as_str()).collect()
    }

    /// Whether a failure of `name` aborts the stack.
    ///
    /// With no explicit partition every component is mandatory; with only one
    /// list given, the other is its complement.
    pub fn is_mandatory(&self, name: &str) -> bool {
        let lc = &self.lifecycle;
        if !lc.mandatory.is_empty() {
            return lc.mandatory.iter().any(|m| m == name);
        }
        !lc.optional.iter().any(|o| o == name)
    }

    pub fn mandatory_components(&self) -> Vec<String> {
        self.components
            .iter()
            .filter(|c| self.is_mandatory(&c.name))
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn optional_components(&self) -> Vec<String> {
        self.components
            .iter()
            .filter(|c| !self.is_mandatory(&c.name))
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn ready_conditions_for<'a>(
        &'a self,
        component: Option<&'a str>,
    ) -> impl Iterator<Item = &'a ReadyCondition> + 'a {
        self.lifecycle
            .ready_conditions
            .iter()
            .filter(move |rc| rc.component.as_deref() == component)
    }

    /// Structural checks that must pass before any lifecycle run starts.
    ///
    /// Undefined `depends` entries are reported by the dependency resolver,
    /// which lists all of them at once.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.manifest_version != 1 {
            return Err(ManifestError::UnsupportedVersion(self.manifest_version));
        }
        if self.meta.name.trim().is_empty() {
            return Err(ManifestError::EmptyStackName);
        }

        let mut seen = BTreeSet::new();
        for c in &self.components {
            if c.name.trim().is_empty() {
                return Err(ManifestError::EmptyComponentName);
            }
            if !seen.insert(c.name.as_str()) {
                return Err(ManifestError::DuplicateComponent(c.name.clone()));
            }
        }

        let check = |context: &str, names: &[String]| -> Result<(), ManifestError> {
            for name in names {
                if !seen.contains(name.as_str()) {
                    return Err(ManifestError::UnknownComponent {
                        context: context.to_owned(),
                        name: name.clone(),
                    });
                }
            }
            Ok(())
        };
        check("lifecycle.order", &self.lifecycle.order)?;
        check("lifecycle.mandatory", &self.lifecycle.mandatory)?;
        check("lifecycle.optional", &self.lifecycle.optional)?;

        for name in &self.lifecycle.mandatory {
            if self.lifecycle.optional.contains(name) {
                return Err(ManifestError::ConflictingPartition(name.clone()));
            }
        }

        for rc in &self.lifecycle.ready_conditions {
            let label = match rc.component.as_deref() {
                Some(c) => {
                    if !seen.contains(c) {
                        return Err(ManifestError::UnknownComponent {
                            context: "lifecycle.ready_conditions".to_owned(),
                            name: c.to_owned(),
                        });
                    }
                    format!("component '{c}'")
                }
                None => "the stack".to_owned(),
            };
            if rc.dns.is_none() && rc.url.is_none() {
                return Err(ManifestError::EmptyReadyCondition(label));
            }
        }

        Ok(())
    }
}

pub fn parse_manifest_str(input: &str) -> Result<Manifest, ManifestError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<Manifest, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
manifest_version = 1
requires = ["aws"]
provides = ["stack-dns"]

[meta]
name = "demo"
brief = "demo stack"

[lifecycle]
optional = ["dashboard"]
optional_requires = ["vault:dashboard"]

[[lifecycle.ready_conditions]]
component = "ingress"
dns = "${ingress.fqdn}"
wait_seconds = 60

[[components]]
name = "cluster"
source = "components/eks"
provides = ["kubernetes"]

[[components]]
name = "ingress"
kind = "ingress"
depends = ["cluster"]
requires = ["kubernetes"]

[[components.hooks]]
file = "hooks/notify.sh"
triggers = ["post-*"]
error = "ignore"

[[components.outputs]]
name = "ingress.fqdn"
brief = "public name"

[[components]]
name = "dashboard"
depends = ["ingress"]
requires = ["kubernetes", "vault"]
enabled_by = ["dashboard.enabled"]

[[parameters]]
name = "dns.domain"
value = "example.com"

[[outputs]]
name = "dashboard.url"
value = "https://${ingress.fqdn}"
"#;

    #[test]
    fn parses_full_manifest() {
        let manifest = parse_manifest_str(FULL).expect("should parse");
        assert_eq!(manifest.stack_name(), "demo");
        assert_eq!(manifest.components.len(), 3);
        assert_eq!(manifest.requires, vec!["aws"]);
        assert_eq!(manifest.lifecycle.delegate, "process");
        let ingress = manifest.component("ingress").unwrap();
        assert_eq!(ingress.kind.as_deref(), Some("ingress"));
        assert!(ingress.hooks[0].ignores_errors());
        assert_eq!(
            manifest.ready_conditions_for(Some("ingress")).count(),
            1,
            "ready condition must be attached to ingress"
        );
        assert_eq!(manifest.ready_conditions_for(None).count(), 0);
        manifest.validate().unwrap();
    }

    #[test]
    fn parses_minimal_manifest() {
        let manifest = parse_manifest_str(
            r#"
manifest_version = 1
[meta]
name = "tiny"
"#,
        )
        .unwrap();
        assert!(manifest.components.is_empty());
        assert!(manifest.lifecycle.order.is_empty());
        manifest.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = r#"
manifest_version = 1
[meta]
name = "x"
colour = "blue"
"#;
        assert!(parse_manifest_str(input).is_err());
    }

    #[test]
    fn partition_defaults_to_all_mandatory() {
        let mut manifest = parse_manifest_str(FULL).unwrap();
        assert_eq!(manifest.mandatory_components(), vec!["cluster", "ingress"]);
        assert_eq!(manifest.optional_components(), vec!["dashboard"]);

        manifest.lifecycle.optional.clear();
        assert_eq!(manifest.mandatory_components().len(), 3);

        manifest.lifecycle.mandatory = vec!["cluster".to_owned()];
        assert!(manifest.is_mandatory("cluster"));
        assert!(!manifest.is_mandatory("ingress"));
    }

    #[test]
    fn source_dir_defaults_to_components_dir() {
        let manifest = parse_manifest_str(FULL).unwrap();
        let base = Path::new("/stack");
        assert_eq!(
            manifest.component("cluster").unwrap().source_dir(base),
            PathBuf::from("/stack/components/eks")
        );
        assert_eq!(
            manifest.component("dashboard").unwrap().source_dir(base),
            PathBuf::from("/stack/components/dashboard")
        );
    }

    #[test]
    fn validate_rejects_duplicates() {
        let mut manifest = parse_manifest_str(FULL).unwrap();
        manifest.components.push(Component {
            name: "cluster".to_owned(),
            ..Component::default()
        });
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::DuplicateComponent(n)) if n == "cluster"
        ));
    }

    #[test]
    fn validate_rejects_unknown_order_entry() {
        let mut manifest = parse_manifest_str(FULL).unwrap();
        manifest.lifecycle.order = vec!["cluster".to_owned(), "ghost".to_owned()];
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn validate_rejects_conflicting_partition() {
        let mut manifest = parse_manifest_str(FULL).unwrap();
        manifest.lifecycle.mandatory = vec!["dashboard".to_owned()];
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::ConflictingPartition(_))
        ));
    }

    #[test]
    fn validate_rejects_empty_ready_condition() {
        let mut manifest = parse_manifest_str(FULL).unwrap();
        manifest.lifecycle.ready_conditions.push(ReadyCondition::default());
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::EmptyReadyCondition(_))
        ));
    }

    #[test]
    fn ready_wait_defaults() {
        assert_eq!(ReadyCondition::default().wait_seconds(), DEFAULT_READY_WAIT_SECS);
    }
}
