//! Package cache
//!
//! Keeps one archive and one extracted copy per (name, version) under
//! `~/.depot/cache/`.
//!
//! Directory structure:
//! ```text
//! ~/.depot/cache/
//! ├── <name>/
//! │   └── <version>/
//! │       ├── <name>-<version>.tar.gz
//! │       ├── package/
//! │       └── metadata.json
//! └── .tmp/
//! ```

mod metadata;

pub use metadata::{file_checksum, CacheMetadata, MetadataError};

use crate::archive::{self, ArchiveError, PACKAGE_DIR};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

const METADATA_FILE: &str = "metadata.json";
const TMP_DIR: &str = ".tmp";

/// Errors that can occur during cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error (file operations)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Cache directory creation failed
    #[error("Failed to create cache directory: {0}")]
    CacheInitError(String),

    /// Archiving or extraction failed
    #[error("Archive error: {0}")]
    ArchiveError(#[from] ArchiveError),

    /// Metadata error
    #[error("Metadata error: {0}")]
    MetadataError(#[from] MetadataError),

    /// Directory to add does not exist
    #[error("Package directory not found: {}", .0.display())]
    SourceNotFound(PathBuf),
}

/// Paths of one cached package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The package archive
    pub archive: PathBuf,

    /// The extracted package contents
    pub dir: PathBuf,
}

/// On-disk package cache keyed by (name, version)
#[derive(Debug, Clone)]
pub struct Cache {
    /// Root cache directory (~/.depot/cache/)
    root: PathBuf,
}

impl Cache {
    /// Initialize the cache at the default location (~/.depot/cache/)
    pub fn init() -> Result<Self, CacheError> {
        Self::new(Self::default_dir()?)
    }

    /// Initialize a cache rooted at `root`, creating it if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(root.join(TMP_DIR)).map_err(|e| {
            CacheError::CacheInitError(format!("{}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    /// Default cache directory (~/.depot/cache/)
    pub fn default_dir() -> Result<PathBuf, CacheError> {
        let home = dirs::home_dir().ok_or_else(|| {
            CacheError::CacheInitError("Could not determine home directory".to_string())
        })?;

        Ok(home.join(".depot").join("cache"))
    }

    /// Get the cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch directory for downloads and staging, on the cache's filesystem
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    /// Directory holding one (name, version) entry
    pub fn entry_dir(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(name).join(version)
    }

    /// Look up a cached package
    pub fn get(&self, name: &str, version: &str) -> Result<Option<CacheEntry>, CacheError> {
        let entry = self.entry(name, version);
        if entry.archive.try_exists()? && entry.dir.try_exists()? {
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    /// Archive `source_dir` and store it (archive plus extracted copy)
    ///
    /// Replaces any existing entry for the key.
    pub fn add(&self, name: &str, version: &str, source_dir: &Path) -> Result<CacheEntry, CacheError> {
        if !source_dir.is_dir() {
            return Err(CacheError::SourceNotFound(source_dir.to_path_buf()));
        }

        let staging = self.staging_dir()?;
        let archive_name = archive_file_name(name, version);
        archive::create(source_dir, &staging.path().join(&archive_name))?;

        self.commit(name, version, staging)
    }

    /// Move an already downloaded archive into the cache and extract it
    ///
    /// Any existing entry for the key is cleared first.
    pub fn move_tar(&self, name: &str, version: &str, tar_path: &Path) -> Result<CacheEntry, CacheError> {
        self.clear(Some(name), Some(version))?;

        let staging = self.staging_dir()?;
        let staged = staging.path().join(archive_file_name(name, version));
        move_file(tar_path, &staged)?;

        self.commit(name, version, staging)
    }

    /// Clear one entry, all versions of a package, or the whole cache
    pub fn clear(&self, name: Option<&str>, version: Option<&str>) -> Result<(), CacheError> {
        let target = match (name, version) {
            (Some(name), Some(version)) => self.entry_dir(name, version),
            (Some(name), None) => self.root.join(name),
            (None, _) => {
                for entry in fs::read_dir(&self.root)? {
                    let path = entry?.path();
                    if path.file_name() == Some(TMP_DIR.as_ref()) {
                        continue;
                    }
                    remove_path(&path)?;
                }
                return Ok(());
            }
        };

        log::debug!("Clearing cache {}", target.display());
        remove_path(&target)
    }

    /// Replace the entry for (name, version) with the contents of `source_dir`
    pub fn update(&self, name: &str, version: &str, source_dir: &Path) -> Result<CacheEntry, CacheError> {
        self.clear(Some(name), Some(version))?;
        self.add(name, version, source_dir)
    }

    /// Metadata of every cached entry, sorted by name then version
    pub fn list(&self) -> Result<Vec<CacheMetadata>, CacheError> {
        let mut entries = Vec::new();
        // <name>/<version>/metadata.json, or one level deeper for scoped names
        let walker = WalkDir::new(&self.root)
            .max_depth(4)
            .into_iter()
            .filter_entry(|e| {
                !(e.depth() == 1 && e.file_name() == TMP_DIR)
                    && !(e.depth() == 3 && e.file_name() == PACKAGE_DIR)
            });

        for entry in walker {
            let entry = entry.map_err(|e| CacheError::IoError(io::Error::other(e)))?;
            if entry.depth() >= 3 && entry.file_type().is_file() && entry.file_name() == METADATA_FILE {
                entries.push(CacheMetadata::load(entry.path())?);
            }
        }

        entries.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(entries)
    }

    /// Load the metadata recorded for an entry
    pub fn metadata(&self, name: &str, version: &str) -> Result<CacheMetadata, CacheError> {
        let path = self.entry_dir(name, version).join(METADATA_FILE);
        Ok(CacheMetadata::load(&path)?)
    }

    fn entry(&self, name: &str, version: &str) -> CacheEntry {
        let dir = self.entry_dir(name, version);
        CacheEntry {
            archive: dir.join(archive_file_name(name, version)),
            dir: dir.join(PACKAGE_DIR),
        }
    }

    fn staging_dir(&self) -> Result<tempfile::TempDir, CacheError> {
        let tmp = self.tmp_dir();
        fs::create_dir_all(&tmp)?;
        Ok(tempfile::Builder::new().prefix("entry-").tempdir_in(tmp)?)
    }

    /// Extract the staged archive, record metadata and move the staging
    /// directory into place. The staging directory is removed on failure.
    fn commit(&self, name: &str, version: &str, staging: tempfile::TempDir) -> Result<CacheEntry, CacheError> {
        let archive_path = staging.path().join(archive_file_name(name, version));
        archive::extract(&archive_path, &staging.path().join(PACKAGE_DIR))?;
        CacheMetadata::for_archive(name, version, &archive_path)?
            .save(&staging.path().join(METADATA_FILE))?;

        let entry_dir = self.entry_dir(name, version);
        remove_path(&entry_dir)?;
        if let Some(parent) = entry_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(staging.path(), &entry_dir)?;

        log::debug!("Cached {}@{} in {}", name, version, entry_dir.display());
        Ok(self.entry(name, version))
    }
}

/// Archive file name for a package (`<name>-<version>.tar.gz`)
///
/// Scoped names (`@org/name`) use their last segment.
pub fn archive_file_name(name: &str, version: &str) -> String {
    let base = name.rsplit('/').next().unwrap_or(name);
    format!("{}-{}.tar.gz", base, version)
}

/// Rename, falling back to copy + remove across filesystems
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

fn remove_path(path: &Path) -> Result<(), CacheError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
