//! Package repository client
//!
//! Talks to CouchDB-style package repositories: one JSON document per
//! package at `<endpoint>/<name>` and one archive per version at
//! `<endpoint>/<name>/<name>-<version>.tar.gz`.

pub mod api;
pub mod client;

pub use api::RepositoryDocument;
pub use client::{
    parse_endpoint, redact, Credentials, Fetched, RepositoryClient, RepositoryError, Resolved,
    DEFAULT_REPOSITORY, DEFAULT_TIMEOUT,
};
