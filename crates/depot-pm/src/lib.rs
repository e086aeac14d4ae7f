//! Depot Package Manager Library
//!
//! This crate provides dependency resolution and package acquisition for
//! depot, including:
//! - Semver version parsing and range matching
//! - Package manifest parsing (depot.json)
//! - Package sources (installed packages, remote repositories)
//! - On-disk package cache
//! - Repository HTTP client
//! - Dependency tree with cascading re-resolution
//! - Concurrent installation

pub mod archive;
pub mod cache;
pub mod commands;
pub mod config;
pub mod fsutil;
pub mod install;
pub mod manifest;
pub mod prompt;
pub mod repository;
pub mod semver;
pub mod source;
pub mod tree;

pub use cache::{Cache, CacheEntry, CacheError, CacheMetadata};
pub use config::{Config, ConfigError};
pub use install::{
    FetchQueue, FetchReport, FetchTask, InstallError, InstallOptions, InstallReport, Installer,
};
pub use manifest::{Manifest, ManifestError};
pub use prompt::{CredentialPrompt, TerminalPrompt};
pub use repository::{
    Credentials, Fetched, RepositoryClient, RepositoryDocument, RepositoryError, Resolved,
};
pub use semver::{max_satisfying, satisfies, Range, SemverError, Version};
pub use source::{LocalDirectorySource, RepositorySource, Source, SourceError, VersionMap};
pub use tree::{DependencyTree, PackageNode, TreeError};
