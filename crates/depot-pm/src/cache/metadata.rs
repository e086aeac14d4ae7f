//! Cache entry metadata
//!
//! Stores the archive checksum and caching time next to each cached package.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during metadata operations
#[derive(Debug, Error)]
pub enum MetadataError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Metadata for one cached (name, version) entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheMetadata {
    /// Package name
    pub name: String,

    /// Package version (semver string)
    pub version: String,

    /// SHA-256 checksum of the archive (hex-encoded)
    pub checksum: String,

    /// Timestamp when cached (Unix timestamp)
    pub cached_at: u64,
}

impl CacheMetadata {
    /// Create metadata for an archive, hashing its contents
    pub fn for_archive(name: &str, version: &str, archive: &Path) -> Result<Self, MetadataError> {
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            checksum: file_checksum(archive)?,
            cached_at: current_timestamp(),
        })
    }

    /// Load metadata from a JSON file
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let contents = fs::read_to_string(path)?;
        let metadata = serde_json::from_str(&contents)?;
        Ok(metadata)
    }

    /// Save metadata to a JSON file
    pub fn save(&self, path: &Path) -> Result<(), MetadataError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// SHA-256 of a file, hex-encoded
pub fn file_checksum(path: &Path) -> Result<String, MetadataError> {
    let mut hasher = Sha256::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_archive_hashes_contents() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bar-0.0.2.tar.gz");
        fs::write(&archive, b"hello world").unwrap();

        let metadata = CacheMetadata::for_archive("bar", "0.0.2", &archive).unwrap();
        assert_eq!(
            metadata.checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert!(metadata.cached_at > 0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        let metadata = CacheMetadata {
            name: "bar".to_string(),
            version: "0.0.2".to_string(),
            checksum: "abc123".to_string(),
            cached_at: 42,
        };

        metadata.save(&path).unwrap();
        assert_eq!(CacheMetadata::load(&path).unwrap(), metadata);
    }
}
