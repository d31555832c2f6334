//! Dependency allowlist for sandboxed block bundles.
//!
//! A bundle's non-relative imports are checked here before anything is
//! instantiated. Three host modules exist:
//! - Ui: node construction (the rendering library)
//! - DomRenderer: access to the block's mount point
//! - Graph: entity data, updates and nested-block hooks

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A host-provided module a bundle may import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostModule {
    Ui,
    DomRenderer,
    Graph,
}

impl HostModule {
    pub const ALL: [HostModule; 3] = [Self::Ui, Self::DomRenderer, Self::Graph];

    /// The specifier bundles import this module under by default.
    pub fn default_specifier(&self) -> &'static str {
        match self {
            Self::Ui => "react",
            Self::DomRenderer => "react-dom",
            Self::Graph => "@blockprotocol/graph",
        }
    }

    /// Function names this module provides.
    pub fn functions(&self) -> &'static [&'static str] {
        match self {
            Self::Ui => &[
                "create_element",
                "create_text",
                "set_attribute",
                "append_child",
                "set_text",
            ],
            Self::DomRenderer => &["mount_node", "clear"],
            Self::Graph => &[
                "block_entity_id",
                "entity_property",
                "is_readonly",
                "props_json",
                "update_property",
                "embed_entity",
                "release_hook",
            ],
        }
    }
}

/// Outcome of checking one specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecifierClass {
    /// `./x` or `../x`: served from the prefetched local module cache.
    Relative,
    /// Allowlisted and bound to a host module.
    Host(HostModule),
    /// Allowlisted but no host module answers to it.
    Unresolvable,
    /// Not in the allowlist.
    Blocked,
}

pub fn is_relative(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../")
}

/// Immutable set of non-relative specifiers a bundle may import, plus the
/// specifier each host module answers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyAllowlist {
    allowed: BTreeSet<String>,
    bindings: HashMap<String, HostModule>,
}

impl Default for DependencyAllowlist {
    fn default() -> Self {
        Self::new(HostModule::ALL.iter().map(|m| m.default_specifier()))
    }
}

impl DependencyAllowlist {
    /// Allowlist over `specifiers`, with host modules bound to their default
    /// specifiers.
    pub fn new<I, S>(specifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bindings = HostModule::ALL
            .iter()
            .map(|m| (m.default_specifier().to_string(), *m))
            .collect();
        Self {
            allowed: specifiers.into_iter().map(Into::into).collect(),
            bindings,
        }
    }

    /// Binds a host module to a different specifier. The old binding is dropped.
    pub fn with_binding(mut self, module: HostModule, specifier: impl Into<String>) -> Self {
        self.bindings.retain(|_, m| *m != module);
        self.bindings.insert(specifier.into(), module);
        self
    }

    pub fn is_allowed(&self, specifier: &str) -> bool {
        self.allowed.contains(specifier)
    }

    pub fn classify(&self, specifier: &str) -> SpecifierClass {
        if is_relative(specifier) {
            return SpecifierClass::Relative;
        }
        if !self.is_allowed(specifier) {
            return SpecifierClass::Blocked;
        }
        match self.bindings.get(specifier) {
            Some(module) => SpecifierClass::Host(*module),
            None => SpecifierClass::Unresolvable,
        }
    }

    /// Specifier currently bound to `module`.
    pub fn specifier_for(&self, module: HostModule) -> Option<&str> {
        self.bindings
            .iter()
            .find(|(_, m)| **m == module)
            .map(|(s, _)| s.as_str())
    }

    /// Allowed specifiers in sorted order.
    pub fn specifiers(&self) -> Vec<String> {
        self.allowed.iter().cloned().collect()
    }
}
