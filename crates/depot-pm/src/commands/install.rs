//! Install command
//!
//! Installs the dependencies of ./depot.json, or explicit package
//! specifiers given on the command line.

use crate::archive;
use crate::cache::Cache;
use crate::fsutil;
use crate::install::{FetchTask, InstallError, InstallOptions, InstallReport, Installer};
use crate::manifest::{is_valid_package_name, Manifest, MANIFEST_FILE};
use crate::semver::Range;
use std::path::{Path, PathBuf};

/// Requirer recorded for packages named on the command line outside a project
const COMMAND_LINE: &str = "<command line>";

/// Parsed package specifier
#[derive(Debug, PartialEq)]
pub enum PackageSpecifier {
    /// `name`, `name@range` or `name@tag`
    Named { name: String, range: Option<String> },

    /// A package directory containing depot.json
    Directory(PathBuf),

    /// A `.tar.gz` package archive
    Archive(PathBuf),
}

impl PackageSpecifier {
    /// Parse a package specifier string
    ///
    /// Formats:
    /// - `package` - highest available version
    /// - `package@1.2.3` - exact version
    /// - `package@^1.2.0` - version range
    /// - `package@beta` - tagged version
    /// - `./path/to/package` - local package directory
    /// - `./package-1.0.0.tar.gz` - local package archive
    ///
    /// Paths are relative to `base_dir`.
    pub fn parse(spec: &str, base_dir: &Path) -> Result<Self, InstallError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(InstallError::InvalidSpecifier("empty specifier".to_string()));
        }

        let path = base_dir.join(spec);
        if (spec.ends_with(".tar.gz") || spec.ends_with(".tgz")) && path.is_file() {
            return Ok(PackageSpecifier::Archive(path));
        }
        if path.join(MANIFEST_FILE).is_file() {
            return Ok(PackageSpecifier::Directory(path));
        }
        if spec.starts_with('.') || spec.starts_with('/') || spec.contains('\\') {
            return Err(InstallError::InvalidSpecifier(format!(
                "'{}' is not a package directory or archive",
                spec
            )));
        }

        // Scoped packages (@org/name@range) have their version separator after the scope
        let split_at = if let Some(rest) = spec.strip_prefix('@') {
            rest.find('@').map(|pos| pos + 1)
        } else {
            spec.find('@')
        };

        let (name, range) = match split_at {
            Some(pos) => (&spec[..pos], Some(&spec[pos + 1..])),
            None => (spec, None),
        };

        if !is_valid_package_name(name) {
            return Err(InstallError::InvalidSpecifier(format!(
                "invalid package name in '{}'",
                spec
            )));
        }
        if range == Some("") {
            return Err(InstallError::InvalidSpecifier(format!(
                "empty version in '{}'",
                spec
            )));
        }

        Ok(PackageSpecifier::Named {
            name: name.to_string(),
            range: range.map(str::to_string),
        })
    }
}

/// Install every dependency of `<project_dir>/depot.json`
pub async fn install_project(
    project_dir: &Path,
    installer: &Installer,
    options: &InstallOptions,
) -> Result<InstallReport, InstallError> {
    let manifest = read_project(project_dir)
        .await?
        .ok_or_else(|| InstallError::NoManifest(project_dir.to_path_buf()))?;

    log::info!("Installing dependencies for {}@{}", manifest.name, manifest.version);
    installer.install(&manifest, options).await
}

/// Install explicit package specifiers
///
/// Local directories and archives are added to the cache first. With
/// `save`, each package is recorded in the project's depot.json: with the
/// range as given, or the installed version when no range (or a tag) was
/// given.
pub async fn install_packages(
    project_dir: &Path,
    specs: &[String],
    save: bool,
    installer: &Installer,
    options: &InstallOptions,
) -> Result<InstallReport, InstallError> {
    let project = read_project(project_dir).await?;
    let requirer = project
        .as_ref()
        .map(|m| m.name.clone())
        .unwrap_or_else(|| COMMAND_LINE.to_string());
    let cache = installer.client().cache().clone();

    let mut pinned = Vec::new();
    let mut tasks = Vec::new();
    let mut saved: Vec<(String, Option<String>)> = Vec::new();

    for spec in specs {
        let manifest = match PackageSpecifier::parse(spec, project_dir)? {
            PackageSpecifier::Named { name, range } => {
                let explicit = range.clone().filter(|r| Range::parse(r).is_ok());
                tasks.push(FetchTask::new(&name, range.as_deref().unwrap_or("*"), &requirer));
                saved.push((name, explicit));
                continue;
            }
            PackageSpecifier::Directory(dir) => cache_directory(&cache, dir).await?,
            PackageSpecifier::Archive(path) => cache_archive(&cache, path).await?,
        };

        log::info!("Added local package {}@{} to the cache", manifest.name, manifest.version);
        tasks.push(FetchTask::new(&manifest.name, &manifest.version, &requirer));
        saved.push((manifest.name.clone(), None));
        pinned.push(manifest);
    }

    let report = installer
        .install_tasks(project.as_ref(), pinned, tasks, options)
        .await?;

    if save {
        match project {
            Some(mut manifest) => {
                for (name, range) in saved {
                    let Some(range) = range.or_else(|| report.selected.get(&name).cloned()) else {
                        continue;
                    };
                    log::info!("Saving {}@{} to {}", name, range, MANIFEST_FILE);
                    manifest.dependencies.insert(name, range);
                }
                let path = project_dir.join(MANIFEST_FILE);
                fsutil::blocking(move || -> Result<_, InstallError> { Ok(manifest.to_file(&path)?) }).await?;
            }
            None => log::warn!(
                "No {} in {}, not saving dependencies",
                MANIFEST_FILE,
                project_dir.display()
            ),
        }
    }

    Ok(report)
}

async fn read_project(project_dir: &Path) -> Result<Option<Manifest>, InstallError> {
    let dir = project_dir.to_path_buf();
    fsutil::blocking(move || -> Result<_, InstallError> { Ok(Manifest::from_dir(&dir)?) }).await
}

/// Add a package directory to the cache under its manifest's name and version
async fn cache_directory(cache: &Cache, dir: PathBuf) -> Result<Manifest, InstallError> {
    let cache = cache.clone();
    fsutil::blocking(move || -> Result<_, InstallError> {
        let manifest = Manifest::from_dir(&dir)?.ok_or_else(|| InstallError::NoManifest(dir.clone()))?;
        cache.update(&manifest.name, &manifest.version, &dir)?;
        Ok(manifest)
    })
    .await
}

/// Unpack a package archive and add it to the cache
async fn cache_archive(cache: &Cache, path: PathBuf) -> Result<Manifest, InstallError> {
    let cache = cache.clone();
    fsutil::blocking(move || -> Result<_, InstallError> {
        let scratch = tempfile::Builder::new()
            .prefix("local-")
            .tempdir_in(cache.tmp_dir())?;
        let unpacked = scratch.path().join("package");
        archive::extract(&path, &unpacked)?;

        let manifest =
            Manifest::from_dir(&unpacked)?.ok_or_else(|| InstallError::NoManifest(path.clone()))?;
        cache.update(&manifest.name, &manifest.version, &unpacked)?;
        Ok(manifest)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str, range: Option<&str>) -> PackageSpecifier {
        PackageSpecifier::Named {
            name: name.to_string(),
            range: range.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_named_specifiers() {
        let base = Path::new("/nonexistent");
        assert_eq!(PackageSpecifier::parse("bar", base).unwrap(), named("bar", None));
        assert_eq!(
            PackageSpecifier::parse("bar@>=0.0.2", base).unwrap(),
            named("bar", Some(">=0.0.2"))
        );
        assert_eq!(
            PackageSpecifier::parse("bar@beta", base).unwrap(),
            named("bar", Some("beta"))
        );
        assert_eq!(
            PackageSpecifier::parse("@org/bar@^1.0.0", base).unwrap(),
            named("@org/bar", Some("^1.0.0"))
        );
        assert_eq!(
            PackageSpecifier::parse("@org/bar", base).unwrap(),
            named("@org/bar", None)
        );
    }

    #[test]
    fn test_parse_invalid_specifiers() {
        let base = Path::new("/nonexistent");
        assert!(PackageSpecifier::parse("", base).is_err());
        assert!(PackageSpecifier::parse("bar@", base).is_err());
        assert!(PackageSpecifier::parse("@bar", base).is_err());
        assert!(PackageSpecifier::parse("./missing", base).is_err());
    }

    #[test]
    fn test_parse_local_specifiers() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = tmp.path().join("bar");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join(MANIFEST_FILE), r#"{"name": "bar", "version": "1.0.0"}"#).unwrap();
        std::fs::write(tmp.path().join("bar-1.0.0.tar.gz"), b"").unwrap();

        assert_eq!(
            PackageSpecifier::parse("./bar", tmp.path()).unwrap(),
            PackageSpecifier::Directory(tmp.path().join("./bar"))
        );
        assert_eq!(
            PackageSpecifier::parse("bar-1.0.0.tar.gz", tmp.path()).unwrap(),
            PackageSpecifier::Archive(tmp.path().join("bar-1.0.0.tar.gz"))
        );
    }
}
