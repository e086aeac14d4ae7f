//! Integration tests for the repository client against a mock repository

mod common;

use common::*;
use depot_pm::repository::{parse_endpoint, Credentials};
use depot_pm::{Cache, RepositoryClient, RepositoryError};
use httpmock::prelude::*;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;

fn client(tmp: &TempDir) -> RepositoryClient {
    RepositoryClient::new(Cache::new(tmp.path().join("cache")).unwrap()).unwrap()
}

fn endpoint(server: &MockServer, db: &str) -> Url {
    parse_endpoint(&server.url(db)).unwrap()
}

fn bar_versions() -> Vec<depot_pm::Manifest> {
    vec![
        manifest("bar", "0.0.1", &[]),
        manifest("bar", "0.0.2", &[("baz", ">=1.0.0")]),
    ]
}

#[tokio::test]
async fn test_resolve_tag_exact_and_range() {
    let server = MockServer::start_async().await;
    let doc = server
        .mock_async(|when, then| {
            when.method(GET).path("/registry/bar");
            then.status(200)
                .json_body(document("bar", &bar_versions(), &[("stable", "0.0.1")]));
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = client(&tmp);
    let endpoints = [endpoint(&server, "/registry")];

    let tagged = client.resolve("bar", "stable", &endpoints).await.unwrap();
    assert_eq!(tagged.version, "0.0.1");

    let exact = client.resolve("bar", "0.0.2", &endpoints).await.unwrap();
    assert_eq!(exact.version, "0.0.2");
    assert_eq!(exact.document.manifest("0.0.2").unwrap().dependencies["baz"], ">=1.0.0");

    let ranged = client.resolve("bar", ">=0.0.1", &endpoints).await.unwrap();
    assert_eq!(ranged.version, "0.0.2");
    assert_eq!(ranged.endpoint, endpoints[0]);

    // one document request for all three lookups
    doc.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_resolve_falls_back_to_next_endpoint() {
    let server = MockServer::start_async().await;
    let missing = server
        .mock_async(|when, then| {
            when.method(GET).path("/private/bar");
            then.status(404).json_body(serde_json::json!({"error": "not_found"}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/public/bar");
            then.status(200).json_body(document("bar", &bar_versions(), &[]));
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = client(&tmp);
    let endpoints = [endpoint(&server, "/private"), endpoint(&server, "/public")];

    let resolved = client.resolve("bar", "*", &endpoints).await.unwrap();
    assert_eq!(resolved.version, "0.0.2");
    assert_eq!(resolved.endpoint, endpoints[1]);
    missing.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_resolve_package_not_found() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/a/ghost");
            then.status(404);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/b/ghost");
            then.status(404);
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = client(&tmp);
    let endpoints = [endpoint(&server, "/a"), endpoint(&server, "/b")];

    let err = client.resolve("ghost", "*", &endpoints).await.unwrap_err();
    match err {
        RepositoryError::PackageNotFound { name, endpoints } => {
            assert_eq!(name, "ghost");
            assert!(endpoints.contains("/a"));
            assert!(endpoints.contains("/b"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_resolve_no_matching_version() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/registry/bar");
            then.status(200).json_body(document("bar", &bar_versions(), &[]));
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = client(&tmp);
    let endpoints = [endpoint(&server, "/registry")];

    let err = client.resolve("bar", ">=1.0.0", &endpoints).await.unwrap_err();
    assert!(err.to_string().contains("0.0.1, 0.0.2"), "{}", err);
    assert!(matches!(
        err,
        RepositoryError::NoMatchingVersion { ref range, .. } if range == ">=1.0.0"
    ));
}

#[tokio::test]
async fn test_unauthorized_is_typed() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/registry/bar");
            then.status(401);
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = client(&tmp);
    let endpoints = [endpoint(&server, "/registry")];

    match client.resolve("bar", "*", &endpoints).await.unwrap_err() {
        RepositoryError::AuthRequired { url } => assert!(url.ends_with("/registry/bar"), "{}", url),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_failed_request_is_not_memoized() {
    let server = MockServer::start_async().await;
    let denied = server
        .mock_async(|when, then| {
            when.method(GET).path("/registry/bar").matches(unauthenticated);
            then.status(401);
        })
        .await;
    let allowed = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/registry/bar")
                .header("Authorization", ALICE_AUTH);
            then.status(200).json_body(document("bar", &bar_versions(), &[]));
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = client(&tmp);
    let endpoints = [endpoint(&server, "/registry")];

    assert!(client.resolve("bar", "*", &endpoints).await.is_err());
    client.set_credentials(&endpoints[0], Credentials::new("alice", "secret"));
    let resolved = client.resolve("bar", "*", &endpoints).await.unwrap();
    assert_eq!(resolved.version, "0.0.2");

    denied.assert_hits_async(1).await;
    allowed.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_inline_credentials() {
    let server = MockServer::start_async().await;
    let doc = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/registry/bar")
                .header("Authorization", ALICE_AUTH);
            then.status(200).json_body(document("bar", &bar_versions(), &[]));
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = client(&tmp);
    let mut url = endpoint(&server, "/registry");
    url.set_username("alice").unwrap();
    url.set_password(Some("secret")).unwrap();

    let resolved = client.resolve("bar", "0.0.1", &[url]).await.unwrap();
    assert_eq!(resolved.version, "0.0.1");
    doc.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_fetch_downloads_once() {
    let server = MockServer::start_async().await;
    let versions = bar_versions();
    server
        .mock_async(|when, then| {
            when.method(GET).path("/registry/bar");
            then.status(200).json_body(document("bar", &versions, &[]));
        })
        .await;
    let archive = server
        .mock_async(|when, then| {
            when.method(GET).path("/registry/bar/bar-0.0.2.tar.gz");
            then.status(200).body(tarball(&versions[1]));
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = client(&tmp);
    let endpoints = [endpoint(&server, "/registry")];

    let first = client.fetch("bar", "0.0.2", &endpoints, None).await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(first.manifest.dependencies["baz"], ">=1.0.0");
    assert!(first.archive.is_file());
    assert_eq!(
        fs::read_to_string(first.dir.join("index.js")).unwrap(),
        "module.exports = 'bar@0.0.2';\n"
    );

    let second = client.fetch("bar", "0.0.2", &endpoints, None).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.dir, first.dir);
    assert_eq!(second.manifest.version, "0.0.2");

    archive.assert_hits_async(1).await;
    let meta = client.cache().metadata("bar", "0.0.2").unwrap();
    assert_eq!(meta.checksum.len(), 64);
}

#[tokio::test]
async fn test_failed_download_leaves_nothing() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/registry/bar");
            then.status(200).json_body(document("bar", &bar_versions(), &[]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/registry/bar/bar-0.0.1.tar.gz");
            then.status(500).body("boom");
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = client(&tmp);
    let endpoints = [endpoint(&server, "/registry")];

    match client.fetch("bar", "0.0.1", &endpoints, None).await.unwrap_err() {
        RepositoryError::HttpStatus { status, url } => {
            assert_eq!(status, 500);
            assert!(url.ends_with("bar-0.0.1.tar.gz"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(client.cache().get("bar", "0.0.1").unwrap(), None);
    assert_eq!(fs::read_dir(client.cache().tmp_dir()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_corrupt_archive_is_reported() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/registry/bar");
            then.status(200).json_body(document("bar", &bar_versions(), &[]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/registry/bar/bar-0.0.1.tar.gz");
            then.status(200).body("not a tarball");
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = client(&tmp);
    let endpoints = [endpoint(&server, "/registry")];

    let err = client.fetch("bar", "0.0.1", &endpoints, None).await.unwrap_err();
    assert!(matches!(err, RepositoryError::CacheError(_)), "{}", err);
    assert_eq!(client.cache().get("bar", "0.0.1").unwrap(), None);
    assert_eq!(fs::read_dir(client.cache().tmp_dir()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_timeout() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/registry/slow");
            then.status(200).delay(Duration::from_secs(5));
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = RepositoryClient::with_timeout(
        Cache::new(tmp.path().join("cache")).unwrap(),
        Duration::from_millis(200),
    )
    .unwrap();
    let endpoints = [endpoint(&server, "/registry")];

    let err = client.resolve("slow", "*", &endpoints).await.unwrap_err();
    assert!(matches!(err, RepositoryError::Timeout { .. }), "{}", err);
}

#[tokio::test]
async fn test_concurrent_lookups_share_one_request() {
    let server = MockServer::start_async().await;
    let doc = server
        .mock_async(|when, then| {
            when.method(GET).path("/registry/bar");
            then.status(200)
                .delay(Duration::from_millis(100))
                .json_body(document("bar", &bar_versions(), &[]));
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = Arc::new(client(&tmp));
    let endpoint = endpoint(&server, "/registry");

    let mut lookups = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let (client, endpoint) = (client.clone(), endpoint.clone());
        lookups.spawn(async move { client.document(&endpoint, "bar").await });
    }
    while let Some(result) = lookups.join_next().await {
        assert!(result.unwrap().unwrap().is_some());
    }

    doc.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_fetch_finds_version_on_lower_priority_endpoint() {
    let server = MockServer::start_async().await;
    let newer = manifest("bar", "0.0.3", &[]);
    server
        .mock_async(|when, then| {
            when.method(GET).path("/first/bar");
            then.status(200).json_body(document("bar", &bar_versions(), &[]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/second/bar");
            then.status(200)
                .json_body(document("bar", std::slice::from_ref(&newer), &[]));
        })
        .await;
    let archive = server
        .mock_async(|when, then| {
            when.method(GET).path("/second/bar/bar-0.0.3.tar.gz");
            then.status(200).body(tarball(&newer));
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = client(&tmp);
    let endpoints = [endpoint(&server, "/first"), endpoint(&server, "/second")];

    let located = client.locate("bar", "0.0.3", &endpoints).await.unwrap();
    assert_eq!(located.endpoint, endpoints[1]);

    let fetched = client.fetch("bar", "0.0.3", &endpoints, None).await.unwrap();
    assert_eq!(fetched.manifest.version, "0.0.3");
    archive.assert_hits_async(1).await;

    let err = client.locate("bar", "9.9.9", &endpoints).await.unwrap_err();
    assert!(matches!(err, RepositoryError::VersionNotFound { .. }), "{}", err);
}

#[tokio::test]
async fn test_invalid_published_manifests_are_ignored() {
    let server = MockServer::start_async().await;
    let mut body = document("bar", &bar_versions(), &[]);
    body["versions"]["0.0.9"] = serde_json::json!({
        "name": "bar",
        "version": "0.0.9",
        "dependencies": {"../escape": "*"}
    });
    body["versions"]["1.0.0"] = serde_json::json!({"name": "bar", "version": "0.0.1"});
    server
        .mock_async(|when, then| {
            when.method(GET).path("/registry/bar");
            then.status(200).json_body(body);
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let client = client(&tmp);
    let endpoints = [endpoint(&server, "/registry")];

    let resolved = client.resolve("bar", "*", &endpoints).await.unwrap();
    assert_eq!(resolved.version, "0.0.2");
    assert_eq!(resolved.document.version_numbers(), vec!["0.0.1", "0.0.2"]);
}

#[tokio::test]
async fn test_path_like_names_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let client = client(&tmp);
    let endpoints = [Url::parse("http://127.0.0.1:9/registry").unwrap()];

    for name in ["../escape", "a/b", ".hidden"] {
        let err = client.resolve(name, "*", &endpoints).await.unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidPackageName(_)), "{}", err);
        let err = client.fetch(name, "1.0.0", &endpoints, None).await.unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidPackageName(_)), "{}", err);
    }
    assert!(!tmp.path().join("escape").exists());
}
