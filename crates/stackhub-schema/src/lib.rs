//! Stack manifest schema for stackhub.
//!
//! This crate defines the declarative layer: TOML manifest parsing (`Manifest`),
//! components with their `depends`/`requires`/`provides` declarations, the
//! nested parameter tree and its flattening into qualified names
//! (`FlatParameter`), output and ready-condition declarations, and structural
//! validation performed before any lifecycle run starts.

pub mod manifest;
pub mod parameters;

pub use manifest::{
    parse_manifest_file, parse_manifest_str, Component, Hook, LifecycleSection, Manifest,
    ManifestError, MetaSection, OutputSpec, ReadyCondition, DEFAULT_READY_WAIT_SECS,
};
pub use parameters::{
    flatten_parameters, qualified_name, split_qualified, FlatParameter, Parameter, ParameterKind,
    EMPTY_ALLOW,
};
