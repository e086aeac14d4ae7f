//! Package sources
//!
//! A source answers one question: which versions of a package does it
//! know, and what are their manifests. The dependency tree consults its
//! sources in priority order.

use crate::fsutil;
use crate::manifest::{Manifest, ManifestError};
use crate::repository::{redact, RepositoryClient, RepositoryError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Available versions of one package (version → manifest)
pub type VersionMap = BTreeMap<String, Manifest>;

/// Errors that can occur while looking up a package
#[derive(Debug, Error)]
pub enum SourceError {
    /// A local manifest exists but is unreadable
    #[error("Manifest error: {0}")]
    ManifestError(#[from] ManifestError),

    /// Repository lookup failed
    #[error("Repository error: {0}")]
    RepositoryError(#[from] RepositoryError),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Where package versions come from
#[async_trait]
pub trait Source: Send + Sync {
    /// Short description for logs and diagnostics
    fn describe(&self) -> String;

    /// Versions of `name` this source can provide
    ///
    /// An unknown package yields an empty map, not an error.
    async fn lookup(&self, name: &str) -> Result<VersionMap, SourceError>;
}

/// Packages already materialized under a directory (`<base>/<name>/depot.json`)
#[derive(Debug, Clone)]
pub struct LocalDirectorySource {
    base_dir: PathBuf,
}

impl LocalDirectorySource {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl Source for LocalDirectorySource {
    fn describe(&self) -> String {
        format!("local:{}", self.base_dir.display())
    }

    async fn lookup(&self, name: &str) -> Result<VersionMap, SourceError> {
        let dir = self.base_dir.join(name);
        let manifest = fsutil::blocking(move || -> Result<_, SourceError> {
            Ok(Manifest::from_dir(&dir)?)
        })
        .await?;

        let mut versions = VersionMap::new();
        if let Some(manifest) = manifest {
            versions.insert(manifest.version.clone(), manifest);
        }
        Ok(versions)
    }
}

/// Versions published at one repository endpoint
pub struct RepositorySource {
    client: Arc<RepositoryClient>,
    endpoint: Url,
}

impl RepositorySource {
    pub fn new(client: Arc<RepositoryClient>, endpoint: Url) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl Source for RepositorySource {
    fn describe(&self) -> String {
        redact(&self.endpoint)
    }

    async fn lookup(&self, name: &str) -> Result<VersionMap, SourceError> {
        let document = self.client.document(&self.endpoint, name).await?;
        Ok(document
            .map(|doc| doc.versions.clone())
            .unwrap_or_default())
    }
}
