//! Package manifest parsing (depot.json)
//!
//! Provides the manifest structure read from package directories and
//! repository documents.

use crate::semver::Version;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the manifest inside a package directory
pub const MANIFEST_FILE: &str = "depot.json";

/// Errors that can occur during manifest parsing
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Failed to read manifest file
    #[error("Failed to read manifest {}: {source}", path.display())]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse JSON
    #[error("Failed to parse manifest {}: {source}", path.display())]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Validation error
    #[error("Invalid manifest: {0}")]
    ValidationError(String),
}

/// Package manifest (depot.json)
///
/// Only `name`, `version` and `dependencies` are interpreted; every other
/// field is carried along untouched so a rewritten manifest keeps it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// Package name (must be unique)
    pub name: String,

    /// Semver version
    pub version: String,

    /// Dependencies (name → range). A `null` range accepts any version.
    #[serde(default, deserialize_with = "deserialize_ranges")]
    pub dependencies: BTreeMap<String, String>,

    /// Fields not interpreted by the resolver
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn deserialize_ranges<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Option<String>>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(name, range)| (name, range.unwrap_or_else(|| "*".to_string())))
        .collect())
}

impl Manifest {
    /// Create a manifest with no dependencies
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dependencies: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Add a dependency (builder style)
    pub fn with_dependency(mut self, name: impl Into<String>, range: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), range.into());
        self
    }

    /// Parse a manifest from a file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Manifest =
            serde_json::from_str(&content).map_err(|source| ManifestError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read `<dir>/depot.json`, returning `None` when the file does not exist
    pub fn from_dir(dir: &Path) -> Result<Option<Self>, ManifestError> {
        let path = dir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        Self::from_file(&path).map(Some)
    }

    /// Parse a manifest from a JSON string
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest =
            serde_json::from_str(content).map_err(|source| ManifestError::ParseError {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest
    pub fn validate(&self) -> Result<(), ManifestError> {
        if !is_valid_package_name(&self.name) {
            return Err(ManifestError::ValidationError(format!(
                "Invalid package name: '{}'. Must contain only alphanumeric characters, dots, hyphens, underscores, and optional @org/ prefix",
                self.name
            )));
        }

        if let Err(e) = Version::parse(&self.version) {
            return Err(ManifestError::ValidationError(format!(
                "Invalid version '{}' for {}: {}",
                self.version, self.name, e
            )));
        }

        for name in self.dependencies.keys() {
            if !is_valid_package_name(name) {
                return Err(ManifestError::ValidationError(format!(
                    "Invalid dependency name '{}' in {}",
                    name, self.name
                )));
            }
        }

        Ok(())
    }

    /// Write manifest to a file
    pub fn to_file(&self, path: &Path) -> Result<(), ManifestError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ManifestError::ValidationError(e.to_string()))?;
        std::fs::write(path, content + "\n").map_err(|source| ManifestError::IoError {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Validate a package name
pub fn is_valid_package_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    // Handle scoped packages (@org/package)
    if let Some(scoped) = name.strip_prefix('@') {
        return match scoped.split_once('/') {
            Some((org, pkg)) => is_valid_name_part(org) && is_valid_name_part(pkg),
            None => false,
        };
    }

    is_valid_name_part(name)
}

/// Validate a name part (alphanumeric, dots, hyphens, underscores)
fn is_valid_name_part(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}
