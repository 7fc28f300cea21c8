use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// A manifest declares, for one machine or group, which catalogs to consult
/// and which items to install, remove, update or offer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TypedBuilder)]
pub struct Manifest {
    /// Catalog names in priority order, highest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub catalogs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub managed_installs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub managed_uninstalls: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub managed_updates: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub optional_installs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub featured_items: Vec<String>,

    /// Nested manifest references, resolved recursively. A repeated
    /// reference in the inclusion graph is a no-op, not an error.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub included_manifests: Vec<String>,

    /// Predicate-gated sublists, merged when the predicate evaluates true
    /// against host facts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub conditional_items: Vec<ConditionalItems>,

    #[serde(flatten)]
    #[builder(default)]
    pub extra: BTreeMap<String, plist::Value>,
}

/// A conditional sublist inside a manifest. Shares the manifest's shape so
/// conditionals can nest.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct ConditionalItems {
    pub condition: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub managed_installs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub managed_uninstalls: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub managed_updates: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub optional_installs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub featured_items: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub included_manifests: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub conditional_items: Vec<ConditionalItems>,
}

/// Local-only, writable record of the optional items the user has chosen to
/// install or remove. Merged into the effective manifest before resolution;
/// written back only on deliberate changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelfServeManifest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_installs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_uninstalls: Vec<String>,
}

impl SelfServeManifest {
    pub fn add_install(&mut self, name: &str) -> bool {
        if self.managed_installs.iter().any(|n| n == name) {
            return false;
        }
        self.managed_installs.push(name.to_string());
        self.managed_uninstalls.retain(|n| n != name);
        true
    }

    pub fn add_uninstall(&mut self, name: &str) -> bool {
        if self.managed_uninstalls.iter().any(|n| n == name) {
            return false;
        }
        self.managed_uninstalls.push(name.to_string());
        self.managed_installs.retain(|n| n != name);
        true
    }

    pub fn remove_install(&mut self, name: &str) -> bool {
        let before = self.managed_installs.len();
        self.managed_installs.retain(|n| n != name);
        self.managed_installs.len() != before
    }

    pub fn remove_uninstall(&mut self, name: &str) -> bool {
        let before = self.managed_uninstalls.len();
        self.managed_uninstalls.retain(|n| n != name);
        self.managed_uninstalls.len() != before
    }
}
