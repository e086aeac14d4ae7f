//! Dependency tree
//!
//! Tracks, per package name, every range imposed on it by its requirers and
//! the highest known version satisfying all of them. Adding a requirement
//! may change a package's selection; the newly selected manifest's own
//! dependencies are then merged in turn, transitively, until nothing
//! changes.

use crate::manifest::Manifest;
use crate::semver::{self, SemverError};
use crate::source::{Source, SourceError, VersionMap};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during dependency resolution
#[derive(Debug, Error)]
pub enum TreeError {
    /// No known version satisfies every requirer
    #[error("{}", conflict_message(name, ranges, versions))]
    DependencyConflict {
        name: String,
        /// requirer → range
        ranges: BTreeMap<String, String>,
        /// every version any source offered, lowest first
        versions: Vec<String>,
    },

    /// No source has ever heard of the package
    #[error("Package not found: {name} (required as '{range}' by {requirer})")]
    PackageNotFound {
        name: String,
        requirer: String,
        range: String,
    },

    /// Malformed version or range
    #[error("Semver error: {0}")]
    SemverError(#[from] SemverError),

    /// A source lookup failed
    #[error("{0}")]
    SourceError(#[from] SourceError),
}

fn conflict_message(name: &str, ranges: &BTreeMap<String, String>, versions: &[String]) -> String {
    let mut message = format!("No version of {} satisfies all requirements:", name);
    for (requirer, range) in ranges {
        let _ = write!(message, "\n  {} requires {}@{}", requirer, name, range);
    }
    let available = if versions.is_empty() {
        "none".to_string()
    } else {
        versions.join(", ")
    };
    let _ = write!(message, "\nAvailable versions: {}", available);
    message
}

/// The resolver's working record for one package name
pub struct PackageNode {
    /// Versions discovered so far (version → manifest)
    pub versions: VersionMap,

    /// Ranges imposed on this package (requirer → range)
    pub ranges: BTreeMap<String, String>,

    /// Selected version; satisfies every range and is a key of `versions`
    pub current_version: Option<String>,

    /// Sources in priority order
    sources: Vec<Arc<dyn Source>>,

    /// Sources before this index have already been consulted
    next_source: usize,
}

impl PackageNode {
    fn new(sources: Vec<Arc<dyn Source>>) -> Self {
        Self {
            versions: VersionMap::new(),
            ranges: BTreeMap::new(),
            current_version: None,
            sources,
            next_source: 0,
        }
    }

    /// Manifest of the selected version
    pub fn current_manifest(&self) -> Option<&Manifest> {
        self.current_version
            .as_ref()
            .and_then(|version| self.versions.get(version))
    }

    fn known_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.versions.keys().cloned().collect();
        semver::sort_versions(&mut versions);
        versions
    }
}

/// Ranges and selection of one node, as they were before a cascade
type Checkpoint = BTreeMap<String, (BTreeMap<String, String>, Option<String>)>;

/// Name → node map, rooted at the package being installed
pub struct DependencyTree {
    nodes: BTreeMap<String, PackageNode>,
    sources: Vec<Arc<dyn Source>>,
    root: Option<String>,
}

impl DependencyTree {
    /// Create an empty tree whose nodes consult `sources` in order
    pub fn new(sources: Vec<Arc<dyn Source>>) -> Self {
        Self {
            nodes: BTreeMap::new(),
            sources,
            root: None,
        }
    }

    /// Build the full tree for `root`
    pub async fn build(root: &Manifest, sources: Vec<Arc<dyn Source>>) -> Result<Self, TreeError> {
        let mut tree = Self::new(sources);
        tree.set_root(root);
        for (name, range) in &root.dependencies {
            tree.add_requirement(&root.name, name, range).await?;
        }
        Ok(tree)
    }

    /// Insert the root pseudo-node: one fixed version, no ranges, no sources
    pub fn set_root(&mut self, root: &Manifest) {
        let mut node = PackageNode::new(Vec::new());
        node.versions.insert(root.version.clone(), root.clone());
        node.current_version = Some(root.version.clone());
        self.nodes.insert(root.name.clone(), node);
        self.root = Some(root.name.clone());
    }

    /// Make a version known without consulting any source
    pub fn insert_version(&mut self, manifest: Manifest) {
        let sources = self.sources.clone();
        self.nodes
            .entry(manifest.name.clone())
            .or_insert_with(|| PackageNode::new(sources))
            .versions
            .insert(manifest.version.clone(), manifest);
    }

    /// Name of the root package, if one was set
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// Record that `requirer` needs `name` at `range`
    ///
    /// Returns whether `name`'s selection changed. When a selection changes,
    /// the newly selected manifest's dependencies are merged with the
    /// package as requirer, and so on down the graph; packages only the
    /// superseded manifest required lose their selection. On error every
    /// node the call touched gets back its ranges and selection. Versions
    /// learned from sources are kept.
    pub async fn add_requirement(
        &mut self,
        requirer: &str,
        name: &str,
        range: &str,
    ) -> Result<bool, TreeError> {
        let mut saved = Checkpoint::new();
        let result = self.cascade(&mut saved, requirer, name, range).await;
        if result.is_err() {
            self.restore(saved);
        }
        result
    }

    async fn cascade(
        &mut self,
        saved: &mut Checkpoint,
        requirer: &str,
        name: &str,
        range: &str,
    ) -> Result<bool, TreeError> {
        let mut pending = VecDeque::new();
        pending.push_back((requirer.to_string(), name.to_string(), range.to_string()));

        let mut first = None;
        while let Some((requirer, name, range)) = pending.pop_front() {
            // A requirer superseded earlier in this cascade no longer counts
            if first.is_some() && !self.is_current_requirement(&requirer, &name, &range) {
                continue;
            }

            self.remember(saved, &name);
            let previous = self.current_manifest(&name).cloned();
            let changed = self.merge(&requirer, &name, &range).await?;
            first.get_or_insert(changed);
            if !changed {
                continue;
            }

            let Some(selected) = self.current_manifest(&name).cloned() else {
                continue;
            };
            log::debug!(
                "{} now at {} (ranges: {:?})",
                name,
                selected.version,
                self.nodes.get(&name).map(|n| &n.ranges)
            );

            if let Some(previous) = previous {
                let dropped = previous
                    .dependencies
                    .keys()
                    .filter(|dep| !selected.dependencies.contains_key(*dep))
                    .map(|dep| (name.clone(), dep.clone()))
                    .collect();
                self.release(saved, dropped);
            }

            for (dep, dep_range) in &selected.dependencies {
                pending.push_back((name.clone(), dep.clone(), dep_range.clone()));
            }
        }

        Ok(first.unwrap_or(false))
    }

    /// Merge one requirement into `name`'s node, returning whether its
    /// selection changed
    async fn merge(&mut self, requirer: &str, name: &str, range: &str) -> Result<bool, TreeError> {
        let sources = self.sources.clone();
        let node = self
            .nodes
            .entry(name.to_string())
            .or_insert_with(|| PackageNode::new(sources));

        node.ranges.insert(requirer.to_string(), range.to_string());
        match select(node, name).await {
            Err(TreeError::PackageNotFound { .. }) => Err(TreeError::PackageNotFound {
                name: name.to_string(),
                requirer: requirer.to_string(),
                range: range.to_string(),
            }),
            other => other,
        }
    }

    /// Drop `(requirer, dependency)` ranges; a dependency left with no
    /// requirer loses its selection, releasing its own dependencies in turn
    fn release(&mut self, saved: &mut Checkpoint, mut orphans: VecDeque<(String, String)>) {
        while let Some((requirer, dep)) = orphans.pop_front() {
            if self.root.as_deref() == Some(dep.as_str()) {
                continue;
            }
            self.remember(saved, &dep);
            let Some(node) = self.nodes.get_mut(&dep) else {
                continue;
            };
            node.ranges.remove(&requirer);
            if !node.ranges.is_empty() {
                continue;
            }
            let Some(manifest) = node.current_manifest().cloned() else {
                continue;
            };

            log::debug!("{}@{} is no longer required", dep, manifest.version);
            node.current_version = None;
            for next in manifest.dependencies.keys() {
                orphans.push_back((dep.clone(), next.clone()));
            }
        }
    }

    /// Save `name`'s ranges and selection the first time a cascade touches it
    fn remember(&self, saved: &mut Checkpoint, name: &str) {
        if saved.contains_key(name) {
            return;
        }
        let state = self
            .nodes
            .get(name)
            .map(|node| (node.ranges.clone(), node.current_version.clone()))
            .unwrap_or_default();
        saved.insert(name.to_string(), state);
    }

    fn restore(&mut self, saved: Checkpoint) {
        for (name, (ranges, current_version)) in saved {
            if let Some(node) = self.nodes.get_mut(&name) {
                node.ranges = ranges;
                node.current_version = current_version;
            }
        }
    }

    /// Whether a requirement from `requirer` still reflects the tree
    ///
    /// Requirers outside the tree and the root always count. A package in
    /// the tree counts only while its selected manifest declares `name` at
    /// `range`.
    pub fn is_current_requirement(&self, requirer: &str, name: &str, range: &str) -> bool {
        if self.root.as_deref() == Some(requirer) || !self.nodes.contains_key(requirer) {
            return true;
        }
        self.current_manifest(requirer)
            .and_then(|manifest| manifest.dependencies.get(name))
            .is_some_and(|declared| declared == range)
    }

    /// Selected version of `name`
    pub fn current_version(&self, name: &str) -> Option<&str> {
        self.nodes
            .get(name)
            .and_then(|node| node.current_version.as_deref())
    }

    /// Manifest of the selected version of `name`
    pub fn current_manifest(&self, name: &str) -> Option<&Manifest> {
        self.nodes.get(name).and_then(PackageNode::current_manifest)
    }

    pub fn node(&self, name: &str) -> Option<&PackageNode> {
        self.nodes.get(name)
    }

    /// Every (name, selected version) except the root, sorted by name
    ///
    /// Packages nothing requires any more have no selection and are left out.
    pub fn selections(&self) -> Vec<(String, String)> {
        self.nodes
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != self.root.as_deref())
            .filter_map(|(name, node)| {
                node.current_version
                    .as_ref()
                    .map(|version| (name.clone(), version.clone()))
            })
            .collect()
    }
}

/// Keep or recompute the node's selection against its full range set,
/// consulting further sources only when nothing known satisfies
async fn select(node: &mut PackageNode, name: &str) -> Result<bool, TreeError> {
    if let Some(current) = &node.current_version {
        if semver::satisfies_all(current, node.ranges.values())? {
            return Ok(false);
        }
    }

    loop {
        if let Some(version) = semver::max_satisfying(node.versions.keys(), node.ranges.values())? {
            let changed = node.current_version.as_deref() != Some(version.as_str());
            node.current_version = Some(version);
            return Ok(changed);
        }

        let Some(source) = node.sources.get(node.next_source).cloned() else {
            break;
        };

        // A failed lookup leaves the source to be asked again
        log::debug!("Looking up {} in {}", name, source.describe());
        let found = source.lookup(name).await?;
        node.next_source += 1;
        for (version, manifest) in found {
            node.versions.entry(version).or_insert(manifest);
        }
    }

    if node.versions.is_empty() {
        return Err(TreeError::PackageNotFound {
            name: name.to_string(),
            requirer: String::new(),
            range: String::new(),
        });
    }

    Err(TreeError::DependencyConflict {
        name: name.to_string(),
        ranges: node.ranges.clone(),
        versions: node.known_versions(),
    })
}
