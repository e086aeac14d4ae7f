//! Install orchestration
//!
//! Turns fetch tasks `(name, range, requirer)` into packages under the
//! target directory:
//!
//! 1. resolve tags against the repositories and record the requirement in
//!    the run's [`DependencyTree`], whose selection is the version to
//!    install; requirements from superseded manifests are dropped;
//! 2. skip `(name, version)` pairs this run already handled;
//! 3. under the name's lock, compare with what is already installed (skip,
//!    conflict, or remove when forced);
//! 4. fetch through the cache and copy into `<target>/<name>`, unless the
//!    tree has since selected another version;
//! 5. queue the installed manifest's dependencies.
//!
//! Every run gets its own tree, processed set and report.

mod auth;
mod queue;

pub use queue::FetchQueue;

use crate::archive::ArchiveError;
use crate::cache::CacheError;
use crate::fsutil;
use crate::manifest::{is_valid_package_name, Manifest, ManifestError};
use crate::prompt::CredentialPrompt;
use crate::repository::{Fetched, RepositoryClient, RepositoryError, Resolved};
use crate::semver::{self, Range, SemverError};
use crate::source::{LocalDirectorySource, RepositorySource, Source, SourceError};
use crate::tree::{DependencyTree, TreeError};
use auth::AuthRetry;
use parking_lot::Mutex as SyncMutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Errors that can occur during installation
#[derive(Debug, Error)]
pub enum InstallError {
    /// A different, incompatible version is already installed
    #[error(
        "{name}@{installed} is installed at {} but {requirer} requires {name}@{range} (use --force to reinstall)",
        path.display()
    )]
    InstalledVersionConflict {
        name: String,
        installed: String,
        range: String,
        requirer: String,
        path: PathBuf,
    },

    /// The run was cancelled
    #[error("Installation cancelled")]
    Cancelled,

    /// No depot.json in the project directory
    #[error("No depot.json found in {}", .0.display())]
    NoManifest(PathBuf),

    /// Invalid package specifier
    #[error("Invalid package specifier: {0}")]
    InvalidSpecifier(String),

    /// A dependency name that cannot be used as a directory name
    #[error("Invalid package name '{name}' required by {requirer}")]
    InvalidPackageName { name: String, requirer: String },

    /// Resolution error
    #[error("{0}")]
    TreeError(#[from] TreeError),

    /// Repository error
    #[error("{0}")]
    RepositoryError(#[from] RepositoryError),

    /// Cache error
    #[error("Cache error: {0}")]
    CacheError(#[from] CacheError),

    /// Archive error
    #[error("Archive error: {0}")]
    ArchiveError(#[from] ArchiveError),

    /// Manifest error
    #[error("Manifest error: {0}")]
    ManifestError(#[from] ManifestError),

    /// Semver error
    #[error("Semver error: {0}")]
    SemverError(#[from] SemverError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl InstallError {
    /// URL that answered 401, wherever in the chain the error came from
    pub fn auth_url(&self) -> Option<&str> {
        let repository = match self {
            InstallError::RepositoryError(e) => e,
            InstallError::TreeError(TreeError::SourceError(SourceError::RepositoryError(e))) => e,
            _ => return None,
        };
        match repository {
            RepositoryError::AuthRequired { url } => Some(url),
            _ => None,
        }
    }
}

/// Install options
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Where packages are installed (`<target>/<name>`)
    pub target_dir: PathBuf,

    /// Maximum number of concurrent tasks
    pub concurrency: usize,

    /// Replace installed packages that conflict with a new requirement
    pub force: bool,

    /// Aborts the run when cancelled
    pub cancel: CancellationToken,
}

impl InstallOptions {
    pub fn new(target_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_dir: target_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            target_dir: PathBuf::from(crate::config::DEFAULT_TARGET_DIR),
            concurrency: crate::config::DEFAULT_CONCURRENCY,
            force: false,
            cancel: CancellationToken::new(),
        }
    }
}

/// One unit of work: acquire `name` satisfying `range` for `requirer`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub name: String,
    pub range: String,
    pub requirer: String,
}

impl FetchTask {
    pub fn new(name: impl Into<String>, range: impl Into<String>, requirer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            range: range.into(),
            requirer: requirer.into(),
        }
    }

    /// One task per dependency of `manifest`
    pub fn dependencies_of(manifest: &Manifest) -> Vec<FetchTask> {
        manifest
            .dependencies
            .iter()
            .map(|(name, range)| FetchTask::new(name, range, &manifest.name))
            .collect()
    }
}

/// Install result
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Packages copied into the target directory, in completion order
    pub installed: Vec<(String, String)>,

    /// How many of those came from the cache
    pub from_cache: usize,

    /// Tasks satisfied by what was already installed
    pub skipped: usize,

    /// Version on disk for every package the run touched (name → version)
    pub selected: BTreeMap<String, String>,
}

/// Fetch result
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchReport {
    /// Packages now in the cache
    pub fetched: Vec<(String, String)>,

    /// How many of those were already cached
    pub from_cache: usize,
}

/// Runs installs against a fixed set of repositories
pub struct Installer {
    client: Arc<RepositoryClient>,
    endpoints: Arc<[Url]>,
    auth: Arc<AuthRetry>,
}

impl Installer {
    /// `endpoints` in priority order
    pub fn new(
        client: Arc<RepositoryClient>,
        endpoints: Vec<Url>,
        prompt: Arc<dyn CredentialPrompt>,
    ) -> Self {
        let auth = Arc::new(AuthRetry::new(client.clone(), prompt));
        Self {
            client,
            endpoints: endpoints.into(),
            auth,
        }
    }

    pub fn client(&self) -> &Arc<RepositoryClient> {
        &self.client
    }

    /// Tree sources for a target directory: what is installed there, then
    /// each repository in priority order
    pub fn sources(&self, target_dir: &Path) -> Vec<Arc<dyn Source>> {
        let mut sources: Vec<Arc<dyn Source>> =
            vec![Arc::new(LocalDirectorySource::new(target_dir))];
        for endpoint in self.endpoints.iter() {
            sources.push(Arc::new(RepositorySource::new(
                self.client.clone(),
                endpoint.clone(),
            )));
        }
        sources
    }

    /// Install every dependency of `root`
    pub async fn install(&self, root: &Manifest, options: &InstallOptions) -> Result<InstallReport, InstallError> {
        self.install_tasks(Some(root), Vec::new(), FetchTask::dependencies_of(root), options)
            .await
    }

    /// Install `tasks` and everything they depend on
    ///
    /// `pinned` manifests are packages the caller already placed in the
    /// cache (local directories or archives); they are known to the tree
    /// up front and never resolved against a repository.
    pub async fn install_tasks(
        &self,
        root: Option<&Manifest>,
        pinned: Vec<Manifest>,
        tasks: Vec<FetchTask>,
        options: &InstallOptions,
    ) -> Result<InstallReport, InstallError> {
        let target_dir = options.target_dir.clone();
        fsutil::blocking(move || std::fs::create_dir_all(&target_dir)).await?;

        let mut tree = DependencyTree::new(self.sources(&options.target_dir));
        if let Some(root) = root {
            tree.set_root(root);
        }
        let mut pinned_names = HashSet::new();
        for manifest in pinned {
            pinned_names.insert(manifest.name.clone());
            tree.insert_version(manifest);
        }

        let run = Arc::new(Run {
            client: self.client.clone(),
            endpoints: self.endpoints.clone(),
            auth: self.auth.clone(),
            target_dir: options.target_dir.clone(),
            force: options.force,
            pinned: pinned_names,
            tree: Mutex::new(tree),
            processed: Mutex::new(HashSet::new()),
            locks: SyncMutex::new(HashMap::new()),
            placed: SyncMutex::new(HashSet::new()),
            kept: SyncMutex::new(HashMap::new()),
            report: SyncMutex::new(InstallReport::default()),
        });

        let mut queue = FetchQueue::new(options.concurrency, options.cancel.clone());
        for task in tasks {
            queue.push(task);
        }
        log::debug!("Starting install with {} tasks", queue.len());

        let worker = run.clone();
        queue
            .run(move |task| {
                let run = worker.clone();
                async move { run.process(task).await }
            })
            .await?;

        let report = run.report.lock().clone();
        Ok(report)
    }

    /// Resolve the full tree for `root` and fetch every selected package
    /// into the cache without installing anything
    ///
    /// Packages already installed at their selected version are left alone.
    pub async fn fetch(&self, root: &Manifest, options: &InstallOptions) -> Result<FetchReport, InstallError> {
        let sources = self.sources(&options.target_dir);
        let tree = self
            .auth
            .run(|| async {
                Ok(DependencyTree::build(root, sources.clone()).await?)
            })
            .await?;

        let installed = LocalDirectorySource::new(&options.target_dir);
        let report = Arc::new(SyncMutex::new(FetchReport::default()));
        let mut queue = FetchQueue::new(options.concurrency, options.cancel.clone());
        for (name, version) in tree.selections() {
            let on_disk = installed.lookup(&name).await.map_err(TreeError::from)?;
            if on_disk.contains_key(&version) {
                log::debug!("{}@{} already installed, not fetching", name, version);
                continue;
            }
            queue.push((name, version));
        }

        let (client, endpoints, auth, sink) = (
            self.client.clone(),
            self.endpoints.clone(),
            self.auth.clone(),
            report.clone(),
        );
        queue
            .run(move |(name, version): (String, String)| {
                let (client, endpoints, auth, sink) =
                    (client.clone(), endpoints.clone(), auth.clone(), sink.clone());
                async move {
                    let fetched = auth
                        .run(|| async {
                            Ok(client.fetch(&name, &version, &endpoints, None).await?)
                        })
                        .await?;

                    let mut report = sink.lock();
                    report.fetched.push((name, version));
                    if fetched.from_cache {
                        report.from_cache += 1;
                    }
                    Ok(Vec::new())
                }
            })
            .await?;

        let report = report.lock().clone();
        Ok(report)
    }
}

/// State of one install run
struct Run {
    client: Arc<RepositoryClient>,
    endpoints: Arc<[Url]>,
    auth: Arc<AuthRetry>,
    target_dir: PathBuf,
    force: bool,
    pinned: HashSet<String>,
    tree: Mutex<DependencyTree>,
    processed: Mutex<HashSet<(String, String)>>,
    /// Held from inspecting `<target>/<name>` until the install finishes
    locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Names this run wrote into the target directory
    placed: SyncMutex<HashSet<String>>,
    /// Installed manifests kept in place of the tree's selection
    kept: SyncMutex<HashMap<String, Manifest>>,
    report: SyncMutex<InstallReport>,
}

impl Run {
    async fn process(&self, task: FetchTask) -> Result<Vec<FetchTask>, InstallError> {
        self.install_one(&task).await.inspect_err(|e| {
            log::error!(
                "Failed to install {}@{} (required by {}): {}",
                task.name,
                task.range,
                task.requirer,
                e
            );
        })
    }

    async fn install_one(&self, task: &FetchTask) -> Result<Vec<FetchTask>, InstallError> {
        if !is_valid_package_name(&task.name) {
            return Err(InstallError::InvalidPackageName {
                name: task.name.clone(),
                requirer: task.requirer.clone(),
            });
        }

        // Ranges are the tree's to resolve; a tag names one exact version
        let resolved = if self.pinned.contains(&task.name) || Range::parse(&task.range).is_ok() {
            None
        } else {
            Some(self.auth.run(|| self.resolve(task)).await?)
        };
        let range = match &resolved {
            Some(resolved) => resolved.version.clone(),
            None => task.range.clone(),
        };
        let Some(version) = self.auth.run(|| self.record(task, &range)).await? else {
            log::debug!(
                "{} no longer requires {}@{}, skipping",
                task.requirer,
                task.name,
                task.range
            );
            return Ok(Vec::new());
        };

        let key = (task.name.clone(), version.clone());
        if !self.processed.lock().await.insert(key.clone()) {
            log::debug!("{}@{} already handled in this run", task.name, version);
            return Ok(Vec::new());
        }

        // One task per name from inspecting the target directory to installing
        let lock = self.name_lock(&task.name);
        let _guard = lock.lock().await;

        if !self.still_selected(&task.name, &version).await {
            self.processed.lock().await.remove(&key);
            return Ok(Vec::new());
        }

        let dest = self.target_dir.join(&task.name);
        if let Some(installed) = read_installed(&dest).await? {
            if installed.version == version {
                log::debug!("{}@{} already installed", task.name, version);
                return Ok(self.skip(&installed));
            }
            if !self.placed.lock().contains(&task.name) {
                match self.unmet_range(&task.name, &installed.version).await? {
                    None => {
                        log::warn!(
                            "{}@{} is installed and satisfies every requirement, keeping it",
                            task.name,
                            installed.version
                        );
                        self.kept.lock().insert(task.name.clone(), installed.clone());
                        return Ok(self.skip(&installed));
                    }
                    Some((requirer, range)) if !self.force => {
                        return Err(InstallError::InstalledVersionConflict {
                            name: task.name.clone(),
                            installed: installed.version,
                            range,
                            requirer,
                            path: dest,
                        });
                    }
                    Some(_) => {
                        log::info!("Removing {}@{} from {}", task.name, installed.version, dest.display());
                        let stale = dest.clone();
                        fsutil::blocking(move || fsutil::remove_dir(&stale)).await?;
                    }
                }
            }
        }

        let resolved = resolved.filter(|r| r.version == version);
        let fetched = self
            .auth
            .run(|| self.fetch(&task.name, &version, resolved.as_ref()))
            .await?;

        if !self.still_selected(&task.name, &version).await {
            self.processed.lock().await.remove(&key);
            return Ok(Vec::new());
        }
        install_dir(&fetched.dir, &dest).await?;
        self.placed.lock().insert(task.name.clone());
        self.kept.lock().remove(&task.name);
        log::info!("Installed {}@{}", task.name, version);

        {
            let mut report = self.report.lock();
            report.installed.push((task.name.clone(), version.clone()));
            report.selected.insert(task.name.clone(), version);
            if fetched.from_cache {
                report.from_cache += 1;
            }
        }

        Ok(FetchTask::dependencies_of(&fetched.manifest))
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks.lock().entry(name.to_string()).or_default().clone()
    }

    /// Whether the tree still selects `name@version`
    async fn still_selected(&self, name: &str, version: &str) -> bool {
        let current = self.tree.lock().await.current_version(name).map(str::to_string);
        if current.as_deref() == Some(version) {
            return true;
        }
        log::debug!(
            "{}@{} superseded by {}, not installing",
            name,
            version,
            current.as_deref().unwrap_or("nothing")
        );
        false
    }

    /// First (requirer, range) the installed version fails, if any
    async fn unmet_range(&self, name: &str, installed: &str) -> Result<Option<(String, String)>, InstallError> {
        let tree = self.tree.lock().await;
        let Some(node) = tree.node(name) else {
            return Ok(None);
        };
        for (requirer, range) in &node.ranges {
            if !semver::satisfies(installed, range)? {
                return Ok(Some((requirer.clone(), range.clone())));
            }
        }
        Ok(None)
    }

    /// Whether `task` came from a manifest that no longer applies
    fn is_stale(&self, tree: &DependencyTree, task: &FetchTask) -> bool {
        if let Some(kept) = self.kept.lock().get(&task.requirer) {
            return kept.dependencies.get(&task.name) != Some(&task.range);
        }
        !tree.is_current_requirement(&task.requirer, &task.name, &task.range)
    }

    async fn resolve(&self, task: &FetchTask) -> Result<Resolved, InstallError> {
        Ok(self
            .client
            .resolve(&task.name, &task.range, &self.endpoints)
            .await?)
    }

    /// Record the requirement and return the tree's selection, or `None`
    /// when the requirer has moved on
    async fn record(&self, task: &FetchTask, range: &str) -> Result<Option<String>, InstallError> {
        let mut tree = self.tree.lock().await;
        if self.is_stale(&tree, task) {
            return Ok(None);
        }
        tree.add_requirement(&task.requirer, &task.name, range).await?;
        let version = tree.current_version(&task.name).ok_or_else(|| {
            TreeError::PackageNotFound {
                name: task.name.clone(),
                requirer: task.requirer.clone(),
                range: range.to_string(),
            }
        })?;
        Ok(Some(version.to_string()))
    }

    async fn fetch(&self, name: &str, version: &str, resolved: Option<&Resolved>) -> Result<Fetched, InstallError> {
        Ok(self
            .client
            .fetch(name, version, &self.endpoints, resolved)
            .await?)
    }

    fn skip(&self, installed: &Manifest) -> Vec<FetchTask> {
        let mut report = self.report.lock();
        report.skipped += 1;
        report
            .selected
            .insert(installed.name.clone(), installed.version.clone());
        FetchTask::dependencies_of(installed)
    }
}

async fn read_installed(dir: &Path) -> Result<Option<Manifest>, InstallError> {
    let dir = dir.to_path_buf();
    fsutil::blocking(move || -> Result<_, InstallError> { Ok(Manifest::from_dir(&dir)?) }).await
}

/// Copy an extracted package to `dest` via a sibling staging directory
async fn install_dir(from: &Path, dest: &Path) -> Result<(), InstallError> {
    let (from, dest) = (from.to_path_buf(), dest.to_path_buf());
    fsutil::blocking(move || -> Result<(), InstallError> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let staging = tempfile::Builder::new().prefix(".install-").tempdir_in(parent)?;
        fsutil::copy_dir(&from, staging.path())?;
        fsutil::remove_dir(&dest)?;
        Ok(std::fs::rename(staging.path(), &dest)?)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_url_through_tree() {
        let err = InstallError::TreeError(TreeError::SourceError(SourceError::RepositoryError(
            RepositoryError::AuthRequired {
                url: "http://localhost/bar".to_string(),
            },
        )));
        assert_eq!(err.auth_url(), Some("http://localhost/bar"));

        let err = InstallError::RepositoryError(RepositoryError::HttpStatus {
            status: 500,
            url: "http://localhost/bar".to_string(),
        });
        assert_eq!(err.auth_url(), None);
    }

    #[test]
    fn test_dependencies_of() {
        let manifest = Manifest::new("foo", "0.0.1")
            .with_dependency("bar", ">=0.0.2")
            .with_dependency("baz", "*");
        assert_eq!(
            FetchTask::dependencies_of(&manifest),
            vec![
                FetchTask::new("bar", ">=0.0.2", "foo"),
                FetchTask::new("baz", "*", "foo"),
            ]
        );
    }

    #[tokio::test]
    async fn test_install_dir_replaces() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("new.txt"), "new").unwrap();

        let dest = tmp.path().join("target/bar");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("old.txt"), "old").unwrap();

        install_dir(&src, &dest).await.unwrap();
        assert!(dest.join("new.txt").is_file());
        assert!(!dest.join("old.txt").exists());
    }
}
