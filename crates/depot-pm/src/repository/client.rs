//! Repository HTTP client
//!
//! Provides an async HTTP client for CouchDB-style package repositories.
//! Documents are memoized per (endpoint, name) for the lifetime of the
//! client; archives are streamed into the cache's scratch directory and
//! handed to [`Cache::move_tar`].

use super::api::RepositoryDocument;
use crate::cache::{archive_file_name, Cache, CacheError};
use crate::fsutil;
use crate::manifest::{is_valid_package_name, Manifest, ManifestError};
use crate::semver::{self, SemverError};
use parking_lot::{Mutex, RwLock};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use url::Url;

/// Default repository URL
pub const DEFAULT_REPOSITORY: &str = "https://repository.depot.dev";

/// Default timeout for document fetches and archive downloads
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur during repository operations
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The repository answered 401
    #[error("Authentication required for {url}")]
    AuthRequired { url: String },

    /// The repository answered with a status of 300 or above
    #[error("HTTP {status} for URL: {url}")]
    HttpStatus { status: u16, url: String },

    /// Request did not complete within the client timeout
    #[error("Request timed out: {url}")]
    Timeout { url: String },

    /// No endpoint knows the package
    #[error("Package not found: {name} (searched {endpoints})")]
    PackageNotFound { name: String, endpoints: String },

    /// The package exists but no version satisfies the requested range
    #[error(
        "No version of {name} matches '{range}'. Available versions: {}",
        available.join(", ")
    )]
    NoMatchingVersion {
        name: String,
        range: String,
        available: Vec<String>,
    },

    /// A tag points at a version the document does not contain
    #[error("Version {version} not found for package {name}")]
    VersionNotFound { name: String, version: String },

    /// The repository document could not be parsed
    #[error("Invalid document for {name} from {url}: {source}")]
    InvalidDocument {
        name: String,
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A package name that cannot be used as a path component
    #[error("Invalid package name: '{0}'")]
    InvalidPackageName(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// Cache error
    #[error("Cache error: {0}")]
    CacheError(#[from] CacheError),

    /// Malformed version or range
    #[error("Semver error: {0}")]
    SemverError(#[from] SemverError),

    /// Manifest of a fetched package could not be read
    #[error("Manifest error: {0}")]
    ManifestError(#[from] ManifestError),
}

/// Basic-auth credentials for one repository origin
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Outcome of resolving a name and range against the endpoints
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Concrete version selected
    pub version: String,

    /// Document the version was selected from
    pub document: Arc<RepositoryDocument>,

    /// Endpoint that served the document
    pub endpoint: Url,
}

/// A package available on disk in the cache
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Cached archive
    pub archive: PathBuf,

    /// Extracted package contents
    pub dir: PathBuf,

    pub version: String,
    pub manifest: Manifest,

    /// Whether the cache already held the package
    pub from_cache: bool,
}

type DocumentCell = Arc<OnceCell<Option<Arc<RepositoryDocument>>>>;

/// Repository client for interacting with package repositories
pub struct RepositoryClient {
    /// HTTP client
    client: Client,

    /// Package cache that downloads land in
    cache: Cache,

    /// Memoized documents keyed by (endpoint, name)
    documents: Mutex<HashMap<(String, String), DocumentCell>>,

    /// Credentials keyed by endpoint origin
    credentials: RwLock<HashMap<String, Credentials>>,
}

impl RepositoryClient {
    /// Create a new repository client with the default timeout
    pub fn new(cache: Cache) -> Result<Self, RepositoryError> {
        Self::with_timeout(cache, DEFAULT_TIMEOUT)
    }

    /// Create a new repository client with a custom timeout
    pub fn with_timeout(cache: Cache, timeout: Duration) -> Result<Self, RepositoryError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(format!("depot/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            cache,
            documents: Mutex::new(HashMap::new()),
            credentials: RwLock::new(HashMap::new()),
        })
    }

    /// The cache this client downloads into
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Remember credentials for every URL sharing `url`'s origin
    pub fn set_credentials(&self, url: &Url, credentials: Credentials) {
        let origin = url.origin().ascii_serialization();
        log::debug!("Using credentials for {} as {}", origin, credentials.username);
        self.credentials.write().insert(origin, credentials);
    }

    /// Get the document for `name` from one endpoint
    ///
    /// GET <endpoint>/<name>. Returns `None` on 404. Successful lookups
    /// (including 404) are memoized; failures are not, so a later call
    /// retries.
    pub async fn document(
        &self,
        endpoint: &Url,
        name: &str,
    ) -> Result<Option<Arc<RepositoryDocument>>, RepositoryError> {
        check_name(name)?;
        let cell = {
            let mut documents = self.documents.lock();
            documents
                .entry((endpoint.to_string(), name.to_string()))
                .or_default()
                .clone()
        };

        let document = cell
            .get_or_try_init(|| async {
                Ok::<_, RepositoryError>(self.fetch_document(endpoint, name).await?.map(Arc::new))
            })
            .await?;
        Ok(document.clone())
    }

    /// Resolve `range` for `name` against `endpoints` in priority order
    ///
    /// The first endpoint holding a document decides: a tag name selects
    /// the tagged version, an exact published version selects itself, any
    /// other range selects the highest satisfying version.
    pub async fn resolve(
        &self,
        name: &str,
        range: &str,
        endpoints: &[Url],
    ) -> Result<Resolved, RepositoryError> {
        for endpoint in endpoints {
            let Some(document) = self.document(endpoint, name).await? else {
                log::debug!("{} not found at {}", name, redact(endpoint));
                continue;
            };

            let version = select_version(&document, name, range)?;
            log::debug!("Resolved {}@{} to {} at {}", name, range, version, redact(endpoint));
            return Ok(Resolved {
                version,
                document,
                endpoint: endpoint.clone(),
            });
        }

        Err(RepositoryError::PackageNotFound {
            name: name.to_string(),
            endpoints: endpoints
                .iter()
                .map(redact)
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Find the highest-priority endpoint that publishes `name@version`
    ///
    /// Unlike [`resolve`](Self::resolve), an endpoint whose document lacks
    /// the version does not decide; the search moves on.
    pub async fn locate(
        &self,
        name: &str,
        version: &str,
        endpoints: &[Url],
    ) -> Result<Resolved, RepositoryError> {
        let mut known = false;
        for endpoint in endpoints {
            let Some(document) = self.document(endpoint, name).await? else {
                continue;
            };
            known = true;
            if document.versions.contains_key(version) {
                log::debug!("Found {}@{} at {}", name, version, redact(endpoint));
                return Ok(Resolved {
                    version: version.to_string(),
                    document,
                    endpoint: endpoint.clone(),
                });
            }
        }

        if known {
            return Err(RepositoryError::VersionNotFound {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        Err(RepositoryError::PackageNotFound {
            name: name.to_string(),
            endpoints: endpoints
                .iter()
                .map(redact)
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Make `name@version` available in the cache
    ///
    /// A cache hit returns without touching the network. Otherwise the
    /// archive is downloaded from `resolved` when the caller already has it,
    /// or from the first endpoint that publishes the version.
    pub async fn fetch(
        &self,
        name: &str,
        version: &str,
        endpoints: &[Url],
        resolved: Option<&Resolved>,
    ) -> Result<Fetched, RepositoryError> {
        check_name(name)?;
        if let Some(fetched) = self.cached(name, version).await? {
            log::debug!("Using cached {}@{}", name, version);
            return Ok(fetched);
        }

        let resolved = match resolved {
            Some(resolved) if resolved.version == version => resolved.clone(),
            _ => self.locate(name, version, endpoints).await?,
        };

        let url = endpoint_url(
            &resolved.endpoint,
            &[name, &archive_file_name(name, version)],
        )?;
        log::info!("Downloading {}@{}", name, version);

        // Removed on drop, so a failed download leaves nothing behind
        let tmp_dir = self.cache.tmp_dir();
        let (file, temp_path) = fsutil::blocking(move || {
            std::fs::create_dir_all(&tmp_dir)?;
            tempfile::Builder::new()
                .prefix("download-")
                .suffix(".tar.gz")
                .tempfile_in(&tmp_dir)
                .map(|file| file.into_parts())
        })
        .await?;

        let mut file = tokio::fs::File::from_std(file);
        let bytes = self.download(&url, &mut file).await?;
        drop(file);
        log::debug!("Downloaded {} bytes from {}", bytes, redact(&url));

        let cache = self.cache.clone();
        let (owned_name, owned_version) = (name.to_string(), version.to_string());
        let entry = fsutil::blocking(move || -> Result<_, RepositoryError> {
            let entry = cache.move_tar(&owned_name, &owned_version, &temp_path)?;
            drop(temp_path);
            Ok(entry)
        })
        .await?;

        let manifest = match resolved.document.manifest(version) {
            Some(manifest) => manifest.clone(),
            None => read_manifest(entry.dir.clone(), name, version).await?,
        };

        Ok(Fetched {
            archive: entry.archive,
            dir: entry.dir,
            version: version.to_string(),
            manifest,
            from_cache: false,
        })
    }

    async fn cached(&self, name: &str, version: &str) -> Result<Option<Fetched>, RepositoryError> {
        let cache = self.cache.clone();
        let (owned_name, owned_version) = (name.to_string(), version.to_string());
        let entry = fsutil::blocking(move || -> Result<_, RepositoryError> {
            Ok(cache.get(&owned_name, &owned_version)?)
        })
        .await?;

        let Some(entry) = entry else {
            return Ok(None);
        };
        let manifest = read_manifest(entry.dir.clone(), name, version).await?;

        Ok(Some(Fetched {
            archive: entry.archive,
            dir: entry.dir,
            version: version.to_string(),
            manifest,
            from_cache: true,
        }))
    }

    async fn fetch_document(
        &self,
        endpoint: &Url,
        name: &str,
    ) -> Result<Option<RepositoryDocument>, RepositoryError> {
        let url = endpoint_url(endpoint, &[name])?;
        let display = redact(&url);
        log::debug!("GET {}", display);

        let response = self
            .request(&url)
            .send()
            .await
            .map_err(|e| transport_error(&display, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(response.status(), &display)?;

        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(&display, e))?;
        let mut document: RepositoryDocument =
            serde_json::from_slice(&body).map_err(|source| RepositoryError::InvalidDocument {
                name: name.to_string(),
                url: display.clone(),
                source,
            })?;

        document.versions.retain(|version, manifest| {
            let valid = manifest.version == *version && manifest.validate().is_ok();
            if !valid {
                log::warn!("Ignoring invalid manifest for {}@{} from {}", name, version, display);
            }
            valid
        });
        Ok(Some(document))
    }

    /// Stream the body of `url` into `file`, returning the byte count
    async fn download(&self, url: &Url, file: &mut tokio::fs::File) -> Result<u64, RepositoryError> {
        let display = redact(url);
        let mut response = self
            .request(url)
            .send()
            .await
            .map_err(|e| transport_error(&display, e))?;
        check_status(response.status(), &display)?;

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| transport_error(&display, e))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    /// GET request with credentials applied
    ///
    /// Inline `user:pass@` credentials are moved out of the URL into a
    /// basic-auth header; otherwise remembered credentials for the origin
    /// are used.
    fn request(&self, url: &Url) -> RequestBuilder {
        let mut bare = url.clone();
        let _ = bare.set_username("");
        let _ = bare.set_password(None);

        let request = self.client.get(bare);
        if !url.username().is_empty() {
            return request.basic_auth(url.username(), url.password());
        }

        let origin = url.origin().ascii_serialization();
        match self.credentials.read().get(&origin) {
            Some(creds) => request.basic_auth(&creds.username, Some(&creds.password)),
            None => request,
        }
    }
}

/// Parse a repository endpoint URL (http or https)
pub fn parse_endpoint(endpoint: &str) -> Result<Url, RepositoryError> {
    let url = Url::parse(endpoint)
        .map_err(|e| RepositoryError::InvalidUrl(format!("{}: {}", endpoint, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(RepositoryError::InvalidUrl(format!(
            "{}: unsupported scheme '{}'",
            endpoint, scheme
        ))),
    }
}

/// URL without userinfo, for logs and error messages
pub fn redact(url: &Url) -> String {
    let mut bare = url.clone();
    let _ = bare.set_username("");
    let _ = bare.set_password(None);
    bare.to_string()
}

/// Pick the version of `name` that `range` refers to in `document`
fn select_version(
    document: &RepositoryDocument,
    name: &str,
    range: &str,
) -> Result<String, RepositoryError> {
    if let Some(tagged) = document.tags.get(range) {
        if !document.versions.contains_key(tagged) {
            return Err(RepositoryError::VersionNotFound {
                name: name.to_string(),
                version: tagged.clone(),
            });
        }
        return Ok(tagged.clone());
    }

    if document.versions.contains_key(range) {
        return Ok(range.to_string());
    }

    match semver::max_satisfying(document.versions.keys(), [range])? {
        Some(version) => Ok(version),
        None => Err(RepositoryError::NoMatchingVersion {
            name: name.to_string(),
            range: range.to_string(),
            available: document.version_numbers(),
        }),
    }
}

/// Append path segments to an endpoint
///
/// Segments are percent-encoded, so a scoped name travels as `@org%2Fname`.
fn endpoint_url(endpoint: &Url, segments: &[&str]) -> Result<Url, RepositoryError> {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .map_err(|_| RepositoryError::InvalidUrl(redact(endpoint)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Names become cache and install paths
fn check_name(name: &str) -> Result<(), RepositoryError> {
    if is_valid_package_name(name) {
        Ok(())
    } else {
        Err(RepositoryError::InvalidPackageName(name.to_string()))
    }
}

fn check_status(status: StatusCode, url: &str) -> Result<(), RepositoryError> {
    if status == StatusCode::UNAUTHORIZED {
        return Err(RepositoryError::AuthRequired {
            url: url.to_string(),
        });
    }
    if status.as_u16() >= 300 {
        return Err(RepositoryError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    Ok(())
}

fn transport_error(url: &str, error: reqwest::Error) -> RepositoryError {
    if error.is_timeout() {
        RepositoryError::Timeout {
            url: url.to_string(),
        }
    } else {
        RepositoryError::HttpError(error)
    }
}

async fn read_manifest(dir: PathBuf, name: &str, version: &str) -> Result<Manifest, RepositoryError> {
    let manifest = fsutil::blocking(move || -> Result<_, RepositoryError> {
        Ok(Manifest::from_dir(&dir)?)
    })
    .await?;

    // Archives without a manifest still install; they just have no dependencies
    Ok(manifest.unwrap_or_else(|| Manifest::new(name, version)))
}
