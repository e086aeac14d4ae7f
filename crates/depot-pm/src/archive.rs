//! Package archives (.tar.gz)
//!
//! Archives store the package contents under a top-level `package/`
//! directory. Extraction accepts archives with any single top-level
//! directory, or none at all.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use thiserror::Error;

/// Directory name used inside archives and cache entries
pub const PACKAGE_DIR: &str = "package";

/// Errors that can occur while creating or extracting archives
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Archive could not be written
    #[error("Failed to create archive {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Archive could not be read or unpacked (corrupt or truncated)
    #[error("Failed to extract archive {}: {source}", path.display())]
    Extract {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Archive the contents of `source_dir` into the gzipped tarball `dest`
pub fn create(source_dir: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let wrap = |source| ArchiveError::Create {
        path: dest.to_path_buf(),
        source,
    };

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = File::create(dest).map_err(wrap)?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    builder.append_dir_all(PACKAGE_DIR, source_dir).map_err(wrap)?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .and_then(|file| file.sync_all())
        .map_err(wrap)?;

    Ok(())
}

/// Extract the tarball `archive` so that its package contents end up
/// directly inside `dest`.
///
/// `dest` must not exist yet. Nothing is left behind on failure.
pub fn extract(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let staging = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(parent)?;

    let wrap = |source| ArchiveError::Extract {
        path: archive.to_path_buf(),
        source,
    };

    let file = File::open(archive).map_err(wrap)?;
    Archive::new(GzDecoder::new(file))
        .unpack(staging.path())
        .map_err(wrap)?;

    let root = single_top_level_dir(staging.path())?.unwrap_or_else(|| staging.path().to_path_buf());
    fs::rename(&root, dest)?;

    Ok(())
}

/// The only entry of `dir` when it is a directory
fn single_top_level_dir(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(dir)?;
    let first = match entries.next() {
        Some(entry) => entry?,
        None => return Ok(None),
    };
    if entries.next().is_some() || !first.file_type()?.is_dir() {
        return Ok(None);
    }
    Ok(Some(first.path()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_extract() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("lib")).unwrap();
        fs::write(src.join("depot.json"), "{}").unwrap();
        fs::write(src.join("lib/index.js"), "module.exports = 1;").unwrap();

        let tarball = tmp.path().join("out/pkg-1.0.0.tar.gz");
        create(&src, &tarball).unwrap();

        let dest = tmp.path().join("extracted");
        extract(&tarball, &dest).unwrap();
        assert!(dest.join("depot.json").is_file());
        assert_eq!(
            fs::read_to_string(dest.join("lib/index.js")).unwrap(),
            "module.exports = 1;"
        );
    }

    #[test]
    fn test_extract_flat_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = tmp.path().join("flat.tar.gz");
        {
            let file = File::create(&tarball).unwrap();
            let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
            let data = b"{}";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "depot.json", &data[..]).unwrap();
            builder.append_data(&mut header, "README", &data[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = tmp.path().join("pkg");
        extract(&tarball, &dest).unwrap();
        assert!(dest.join("depot.json").is_file());
        assert!(dest.join("README").is_file());
    }

    #[test]
    fn test_corrupt_archive_leaves_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = tmp.path().join("bad.tar.gz");
        fs::write(&tarball, b"definitely not gzip").unwrap();

        let dest = tmp.path().join("pkg");
        let err = extract(&tarball, &dest).unwrap_err();
        assert!(matches!(err, ArchiveError::Extract { .. }));
        assert!(!dest.exists());

        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".extract-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
