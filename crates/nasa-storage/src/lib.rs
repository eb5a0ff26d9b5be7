//! Artifact file cache, catalog persistence, and HTTP fetch utilities.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use nasa_core::Catalog;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;
use walkdir::WalkDir;

pub const CRATE_NAME: &str = "nasa-storage";

pub const CATALOG_FILE: &str = "catalog.json";
pub const LOG_FILE: &str = "harvest.log";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtifactTotals {
    pub file_count: u64,
    pub total_bytes: u64,
}

/// Existence-checked file cache rooted at the data directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute_path(&self, relative_path: &Path) -> PathBuf {
        self.root.join(relative_path)
    }

    pub async fn exists(&self, relative_path: &Path) -> anyhow::Result<bool> {
        let path = self.absolute_path(relative_path);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking artifact path {}", path.display()))
    }

    /// Write `bytes` unless a file already sits at `relative_path`.
    pub async fn store_if_absent(
        &self,
        relative_path: &Path,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let absolute_path = self.absolute_path(relative_path);
        let deduplicated = self.exists(relative_path).await?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }
        Ok(StoredArtifact {
            relative_path: relative_path.to_path_buf(),
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    /// Pretty-print `value` to `relative_path`, leaving the file untouched when
    /// it already holds the same bytes.
    pub async fn write_json(
        &self,
        relative_path: &Path,
        value: &JsonValue,
    ) -> anyhow::Result<StoredArtifact> {
        let absolute_path = self.absolute_path(relative_path);
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {}", relative_path.display()))?;

        let unchanged = match fs::read(&absolute_path).await {
            Ok(existing) => existing == bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading {}", absolute_path.display()));
            }
        };
        if !unchanged {
            write_atomic(&absolute_path, &bytes).await?;
        }

        Ok(StoredArtifact {
            relative_path: relative_path.to_path_buf(),
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: unchanged,
        })
    }

    /// Count harvested files under the root, ignoring the catalog, the log and
    /// in-flight temp files.
    pub fn scan_totals(&self) -> ArtifactTotals {
        let mut totals = ArtifactTotals::default();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            let name = entry.file_name().to_string_lossy();
            if is_temp_name(&name) {
                continue;
            }
            if entry.depth() == 1 && (name == CATALOG_FILE || name == LOG_FILE) {
                continue;
            }
            totals.file_count += 1;
            totals.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
        totals
    }
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

/// Write through a temp file in the target directory, then rename into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating artifact directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Where the catalog document lives between runs.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Returns the stored catalog, or an empty one when nothing was saved yet.
    async fn load(&self) -> anyhow::Result<Catalog>;

    async fn save(&self, catalog: &Catalog) -> anyhow::Result<()>;
}

/// `catalog.json` on disk.
#[derive(Debug, Clone)]
pub struct FileCatalogStore {
    path: PathBuf,
}

impl FileCatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(CATALOG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CatalogStore for FileCatalogStore {
    async fn load(&self) -> anyhow::Result<Catalog> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Catalog::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    async fn save(&self, catalog: &Catalog) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(catalog).context("serializing catalog")?;
        write_atomic(&self.path, &bytes).await
    }
}

#[derive(Debug, Default)]
struct MemoryCatalogState {
    catalog: Option<Catalog>,
    saves: usize,
}

/// In-memory catalog; clones share the same document.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalogStore {
    state: Arc<Mutex<MemoryCatalogState>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(catalog: Catalog) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryCatalogState {
                catalog: Some(catalog),
                saves: 0,
            })),
        }
    }

    pub async fn snapshot(&self) -> Option<Catalog> {
        self.state.lock().await.catalog.clone()
    }

    pub async fn save_count(&self) -> usize {
        self.state.lock().await.saves
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn load(&self) -> anyhow::Result<Catalog> {
        Ok(self.state.lock().await.catalog.clone().unwrap_or_default())
    }

    async fn save(&self, catalog: &Catalog) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.catalog = Some(catalog.clone());
        state.saves += 1;
        Ok(())
    }
}

/// Which per-call timeout applies to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Metadata,
    Download,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub metadata_timeout: Duration,
    pub download_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            metadata_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Single-attempt GET client. Every call either succeeds or reports why.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    metadata_timeout: Duration,
    download_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            metadata_timeout: config.metadata_timeout,
            download_timeout: config.download_timeout,
        })
    }

    pub fn timeout_for(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::Metadata => self.metadata_timeout,
            RequestKind::Download => self.download_timeout,
        }
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        kind: RequestKind,
    ) -> Result<JsonValue, FetchError> {
        let response = self.send(self.client.get(url).query(query), url, kind).await?;
        decode_json(response)
    }

    pub async fn get_json_with_bearer(
        &self,
        url: &str,
        query: &[(&str, String)],
        token: &str,
        kind: RequestKind,
    ) -> Result<JsonValue, FetchError> {
        let request = self.client.get(url).query(query).bearer_auth(token);
        let response = self.send(request, url, kind).await?;
        decode_json(response)
    }

    pub async fn get_bytes(
        &self,
        url: &str,
        kind: RequestKind,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(self.client.get(url), url, kind).await
    }

    async fn send(
        &self,
        request: RequestBuilder,
        url: &str,
        kind: RequestKind,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url, ?kind);
        async move {
            let response = request
                .timeout(self.timeout_for(kind))
                .send()
                .await
                .map_err(reqwest::Error::without_url)?;
            let status = response.status();
            // query strings carry the api key; keep them out of errors and logs
            let mut final_url = response.url().clone();
            final_url.set_query(None);
            let final_url = final_url.to_string();
            debug!(status = status.as_u16(), "response received");

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = response
                .bytes()
                .await
                .map_err(reqwest::Error::without_url)?
                .to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

fn decode_json(response: FetchedResponse) -> Result<JsonValue, FetchError> {
    serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
        url: response.final_url,
        source,
    })
}
