//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use depot_pm::repository::Credentials;
use depot_pm::{archive, CredentialPrompt, Manifest, Source, SourceError, VersionMap};
use serde_json::{json, Value};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// `Basic` header value for alice:secret
pub const ALICE_AUTH: &str = "Basic YWxpY2U6c2VjcmV0";

/// Manifest with `(name, range)` dependencies
pub fn manifest(name: &str, version: &str, deps: &[(&str, &str)]) -> Manifest {
    deps.iter()
        .fold(Manifest::new(name, version), |m, (dep, range)| m.with_dependency(*dep, *range))
}

/// Write `manifest` plus a marker file into `dir`
pub fn write_package(dir: &Path, manifest: &Manifest) {
    fs::create_dir_all(dir).unwrap();
    manifest.to_file(&dir.join("depot.json")).unwrap();
    fs::write(
        dir.join("index.js"),
        format!("module.exports = '{}@{}';\n", manifest.name, manifest.version),
    )
    .unwrap();
}

/// Bytes of a package archive for `manifest`
pub fn tarball(manifest: &Manifest) -> Vec<u8> {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    write_package(&src, manifest);
    let out = tmp.path().join("package.tar.gz");
    archive::create(&src, &out).unwrap();
    fs::read(out).unwrap()
}

/// Repository document listing `manifests`
pub fn document(name: &str, manifests: &[Manifest], tags: &[(&str, &str)]) -> Value {
    let versions: serde_json::Map<String, Value> = manifests
        .iter()
        .map(|m| (m.version.clone(), serde_json::to_value(m).unwrap()))
        .collect();
    let tags: serde_json::Map<String, Value> = tags
        .iter()
        .map(|(tag, version)| (tag.to_string(), json!(version)))
        .collect();
    json!({
        "_id": name,
        "name": name,
        "versions": versions,
        "tags": tags,
        "time": {"created": "2011-06-01T10:00:00Z"},
    })
}

/// Contents of the marker file an installed package carries
pub fn installed_marker(target: &Path, name: &str) -> String {
    fs::read_to_string(target.join(name).join("index.js")).unwrap()
}

/// In-memory source that counts lookups
pub struct SpySource {
    manifests: Vec<Manifest>,
    lookups: AtomicUsize,
}

impl SpySource {
    pub fn new(manifests: Vec<Manifest>) -> Arc<Self> {
        Arc::new(Self {
            manifests,
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for SpySource {
    fn describe(&self) -> String {
        "spy".to_string()
    }

    async fn lookup(&self, name: &str) -> Result<VersionMap, SourceError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .manifests
            .iter()
            .filter(|m| m.name == name)
            .map(|m| (m.version.clone(), m.clone()))
            .collect())
    }
}

/// Prompt answering with fixed credentials
pub struct ScriptedPrompt {
    credentials: Credentials,
    calls: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn new(username: &str, password: &str) -> Arc<Self> {
        Arc::new(Self {
            credentials: Credentials::new(username, password),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialPrompt for ScriptedPrompt {
    async fn credentials(&self, _url: &str) -> io::Result<Credentials> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.credentials.clone())
    }
}

/// Prompt that must never be called
pub struct NoPrompt;

#[async_trait]
impl CredentialPrompt for NoPrompt {
    async fn credentials(&self, url: &str) -> io::Result<Credentials> {
        panic!("unexpected credential prompt for {}", url);
    }
}

/// httpmock matcher for requests carrying no Authorization header
pub fn unauthenticated(req: &httpmock::prelude::HttpMockRequest) -> bool {
    !req.headers
        .as_ref()
        .map(|headers| {
            headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("authorization"))
        })
        .unwrap_or(false)
}
