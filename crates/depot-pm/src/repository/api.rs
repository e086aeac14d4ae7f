//! Repository document types
//!
//! Response type for `GET <endpoint>/<name>`.

use crate::manifest::Manifest;
use crate::semver;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One package's record in a repository
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryDocument {
    /// Package name
    #[serde(default)]
    pub name: String,

    /// Published versions (version → manifest)
    #[serde(default)]
    pub versions: BTreeMap<String, Manifest>,

    /// Tags (tag name → version), e.g. `latest`
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Timestamps (`created`, `modified`, and one per version)
    #[serde(default)]
    pub time: BTreeMap<String, serde_json::Value>,
}

impl RepositoryDocument {
    /// Published version numbers, lowest first
    ///
    /// Unparseable version keys sort after valid ones, in text order.
    pub fn version_numbers(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.versions.keys().cloned().collect();
        semver::sort_versions(&mut versions);
        versions
    }

    /// Manifest of a published version
    pub fn manifest(&self, version: &str) -> Option<&Manifest> {
        self.versions.get(version)
    }
}
