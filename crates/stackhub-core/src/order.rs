use crate::CoreError;
use stackhub_schema::Manifest;
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

/// A `depends` entry naming a component that is not declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndefinedDependency {
    pub component: String,
    pub dependency: String,
}

impl fmt::Display for UndefinedDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.component, self.dependency)
    }
}

/// Order components so that each one follows all of its transitive dependencies.
///
/// Components are expanded depth-first in declaration order. Every undefined
/// dependency is reported at once; a cycle of any length is an error.
pub fn resolve_order(manifest: &Manifest) -> Result<Vec<String>, CoreError> {
    let undefined: Vec<UndefinedDependency> = manifest
        .components
        .iter()
        .flat_map(|c| {
            c.depends
                .iter()
                .filter(|d| manifest.component(d).is_none())
                .map(|d| UndefinedDependency {
                    component: c.name.clone(),
                    dependency: d.clone(),
                })
        })
        .collect();
    if !undefined.is_empty() {
        return Err(CoreError::UndefinedDependencies(undefined));
    }

    let mut resolver = Resolver {
        manifest,
        placed: HashSet::new(),
        path: Vec::new(),
        order: Vec::with_capacity(manifest.components.len()),
    };
    for component in &manifest.components {
        resolver.visit(&component.name)?;
    }
    debug!("resolved order: {}", resolver.order.join(", "));
    Ok(resolver.order)
}

struct Resolver<'a> {
    manifest: &'a Manifest,
    placed: HashSet<&'a str>,
    path: Vec<&'a str>,
    order: Vec<String>,
}

impl<'a> Resolver<'a> {
    fn visit(&mut self, name: &'a str) -> Result<(), CoreError> {
        if self.placed.contains(name) {
            return Ok(());
        }
        if let Some(start) = self.path.iter().position(|p| *p == name) {
            let mut cycle: Vec<String> = self.path[start..].iter().map(|s| (*s).to_owned()).collect();
            cycle.push(name.to_owned());
            return Err(CoreError::DependencyCycle(cycle));
        }
        let component = self
            .manifest
            .component(name)
            .ok_or_else(|| CoreError::UnknownComponent(name.to_owned()))?;

        self.path.push(name);
        for dep in &component.depends {
            self.visit(dep)?;
        }
        self.path.pop();

        self.placed.insert(name);
        self.order.push(name.to_owned());
        Ok(())
    }
}

/// The lifecycle order of `manifest`, resolving and caching it when absent.
///
/// An explicitly declared order is trusted verbatim.
pub fn ensure_lifecycle_order(manifest: &mut Manifest) -> Result<&[String], CoreError> {
    if manifest.lifecycle.order.is_empty() {
        manifest.lifecycle.order = resolve_order(manifest)?;
    }
    Ok(&manifest.lifecycle.order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackhub_schema::parse_manifest_str;

    fn manifest(components: &[(&str, &[&str])]) -> Manifest {
        let mut toml = String::from("manifest_version = 1\n[meta]\nname = \"t\"\n");
        for (name, deps) in components {
            let deps: Vec<String> = deps.iter().map(|d| format!("\"{d}\"")).collect();
            toml.push_str(&format!(
                "[[components]]\nname = \"{name}\"\ndepends = [{}]\n",
                deps.join(", ")
            ));
        }
        parse_manifest_str(&toml).unwrap()
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn diamond_places_shared_dependency_once() {
        let m = manifest(&[("a", &["b", "c"]), ("b", &["d"]), ("c", &["d"]), ("d", &[])]);
        let order = resolve_order(&m).unwrap();
        assert_eq!(order, vec!["d", "b", "c", "a"]);
    }

    #[test]
    fn every_component_follows_its_dependencies() {
        let m = manifest(&[
            ("app", &["db", "cache"]),
            ("cache", &["net"]),
            ("db", &["net", "storage"]),
            ("storage", &[]),
            ("net", &[]),
            ("monitor", &["app"]),
        ]);
        let order = resolve_order(&m).unwrap();
        assert_eq!(order.len(), 6);
        for c in &m.components {
            for d in &c.depends {
                assert!(position(&order, d) < position(&order, &c.name));
            }
        }
    }

    #[test]
    fn independent_components_keep_declaration_order() {
        let m = manifest(&[("x", &[]), ("y", &[]), ("z", &[])]);
        assert_eq!(resolve_order(&m).unwrap(), vec!["x", "y", "z"]);
    }

    #[test]
    fn two_node_cycle_is_rejected() {
        let m = manifest(&[("a", &["b"]), ("b", &["a"])]);
        match resolve_order(&m).unwrap_err() {
            CoreError::DependencyCycle(path) => assert_eq!(path, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn long_cycle_is_rejected() {
        let m = manifest(&[("a", &["b"]), ("b", &["c"]), ("c", &["d"]), ("d", &["a"])]);
        assert!(matches!(
            resolve_order(&m),
            Err(CoreError::DependencyCycle(ref p)) if p.len() == 5
        ));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let m = manifest(&[("a", &["a"])]);
        assert!(matches!(resolve_order(&m), Err(CoreError::DependencyCycle(_))));
    }

    #[test]
    fn all_undefined_dependencies_are_listed() {
        let m = manifest(&[("a", &["ghost"]), ("b", &["phantom", "a"])]);
        match resolve_order(&m).unwrap_err() {
            CoreError::UndefinedDependencies(list) => {
                assert_eq!(list.len(), 2);
                assert_eq!(list[0].to_string(), "a -> ghost");
                assert_eq!(list[1].dependency, "phantom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn explicit_order_is_trusted() {
        let mut m = manifest(&[("a", &["b"]), ("b", &[])]);
        m.lifecycle.order = vec!["a".to_owned(), "b".to_owned()];
        assert_eq!(ensure_lifecycle_order(&mut m).unwrap(), ["a", "b"]);
    }

    #[test]
    fn resolved_order_is_cached_on_manifest() {
        let mut m = manifest(&[("a", &["b"]), ("b", &[])]);
        ensure_lifecycle_order(&mut m).unwrap();
        assert_eq!(m.lifecycle.order, vec!["b", "a"]);
    }
}
