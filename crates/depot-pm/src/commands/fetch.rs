//! Fetch command
//!
//! Resolves the project's full dependency tree and downloads every selected
//! package into the cache without installing anything.

use crate::fsutil;
use crate::install::{FetchReport, InstallError, InstallOptions, Installer};
use crate::manifest::Manifest;
use std::path::Path;

/// Fetch every dependency of `<project_dir>/depot.json` into the cache
pub async fn fetch_project(
    project_dir: &Path,
    installer: &Installer,
    options: &InstallOptions,
) -> Result<FetchReport, InstallError> {
    let dir = project_dir.to_path_buf();
    let manifest = fsutil::blocking(move || -> Result<_, InstallError> { Ok(Manifest::from_dir(&dir)?) })
        .await?
        .ok_or_else(|| InstallError::NoManifest(project_dir.to_path_buf()))?;

    log::info!("Fetching dependencies for {}@{}", manifest.name, manifest.version);
    installer.fetch(&manifest, options).await
}
