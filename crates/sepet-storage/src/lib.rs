//! Durable file, snapshot and HTTP plumbing for Sepet.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub mod archive;
pub mod csv_files;
pub mod snapshot;

pub use archive::{ArchiveManager, ArchiveOutcome, ArchiveUploader, UnpackReport, Unpacker};
pub use csv_files::CategoryFileStore;
pub use snapshot::{MergeOutcome, SnapshotStore};

pub const SNAPSHOT_PREFIX: &str = "sepet_data_";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("malformed row in table {table}: {reason}")]
    MalformedRow { table: String, reason: String },
    #[error("not a snapshot file name: {0}")]
    SnapshotName(String),
    #[error("archive upload failed: {0}")]
    Upload(String),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

pub(crate) fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

/// Write `bytes` to `path` through a sibling temp file and an atomic rename.
///
/// Readers either see the previous file or the complete new one. The temp file
/// is removed when any step fails.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<WrittenFile> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(io_error(parent))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(temp_name_for(&file_name));

    let write_result: std::io::Result<()> = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    match write_result {
        Ok(()) => Ok(WrittenFile {
            path: path.to_path_buf(),
            sha256: sha256_hex(bytes),
            byte_size: bytes.len(),
        }),
        Err(source) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

pub(crate) fn temp_name_for(file_name: &str) -> String {
    format!(".{file_name}.{}.tmp", Uuid::new_v4())
}

/// In-flight temp files left by [`write_atomic`] or a snapshot working copy.
pub fn is_temp_file(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(".tmp")
}

pub fn store_file_name(date: NaiveDate) -> String {
    format!("{SNAPSHOT_PREFIX}{}.db", date.format("%Y-%m-%d"))
}

pub fn archive_file_name(date: NaiveDate) -> String {
    format!("{}.gz", store_file_name(date))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFile {
    Store(NaiveDate),
    Archive(NaiveDate),
}

impl SnapshotFile {
    pub fn date(self) -> NaiveDate {
        match self {
            SnapshotFile::Store(date) | SnapshotFile::Archive(date) => date,
        }
    }
}

/// Recognise `sepet_data_YYYY-MM-DD.db` and `sepet_data_YYYY-MM-DD.db.gz`.
pub fn classify_snapshot_file(file_name: &str) -> Option<SnapshotFile> {
    let rest = file_name.strip_prefix(SNAPSHOT_PREFIX)?;
    let (stamp, is_archive) = if let Some(stamp) = rest.strip_suffix(".db.gz") {
        (stamp, true)
    } else {
        (rest.strip_suffix(".db")?, false)
    };
    if stamp.len() != 10 {
        return None;
    }
    let date = NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok()?;
    Some(if is_archive {
        SnapshotFile::Archive(date)
    } else {
        SnapshotFile::Store(date)
    })
}

/// Retry budget for one page fetched through the unlocking proxy.
#[derive(Debug, Clone, Copy)]
pub struct ProxyRetry {
    /// Total tries, the first one included.
    pub attempts: usize,
    pub first_pause: Duration,
    pub max_pause: Duration,
}

impl Default for ProxyRetry {
    fn default() -> Self {
        Self {
            attempts: 4,
            first_pause: Duration::from_millis(500),
            max_pause: Duration::from_secs(8),
        }
    }
}

impl ProxyRetry {
    /// Pause before retry `retry` (zero-based), doubling from `first_pause` up to `max_pause`.
    pub fn pause(&self, retry: usize) -> Duration {
        let mut pause = self.first_pause;
        for _ in 0..retry {
            if pause >= self.max_pause {
                break;
            }
            pause = pause.saturating_mul(2);
        }
        pause.min(self.max_pause)
    }

    fn worth_retrying(outcome: &Result<reqwest::Response, reqwest::Error>) -> bool {
        match outcome {
            Ok(resp) => retried_status(resp.status()),
            // a dropped tunnel or a slow upstream behind the proxy
            Err(err) => err.is_timeout() || err.is_connect(),
        }
    }
}

/// Throttling and upstream failures reported by the proxy. A 407 means bad
/// proxy credentials and is never retried.
pub fn retried_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Route every request through this proxy (the unlocking proxy for anti-bot shops).
    pub proxy: Option<String>,
    pub accept_invalid_certs: bool,
    pub global_concurrency: usize,
    pub per_shop_concurrency: usize,
    pub retry: ProxyRetry,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            proxy: None,
            accept_invalid_certs: false,
            global_concurrency: 8,
            per_shop_concurrency: 2,
            retry: ProxyRetry::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_shop_limit: usize,
    per_shop: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: ProxyRetry,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher closed")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .with_context(|| format!("parsing proxy url {proxy}"))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_shop_limit: config.per_shop_concurrency.max(1),
            per_shop: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn per_shop_semaphore(&self, shop: &str) -> Arc<Semaphore> {
        let mut map = self.per_shop.lock().await;
        map.entry(shop.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_shop_limit)))
            .clone()
    }

    /// GET `url` under the global and per-shop limits, retried per [`ProxyRetry`].
    pub async fn fetch_bytes(&self, shop: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_shop = self.per_shop_semaphore(shop).await;
        let _shop = per_shop.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", shop, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            let outcome = self.client.get(url).send().await;
            if retry + 1 < self.retry.attempts && ProxyRetry::worth_retrying(&outcome) {
                let pause = self.retry.pause(retry);
                tracing::debug!(retry, pause_ms = pause.as_millis() as u64, "retrying fetch");
                tokio::time::sleep(pause).await;
                retry += 1;
                continue;
            }

            let resp = outcome?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            return Ok(FetchedResponse {
                status,
                final_url,
                body,
            });
        }
    }
}
