//! Authenticated archive deposit endpoint in front of the snapshot Unpacker.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sepet_storage::archive::{ARCHIVE_NAME_HEADER, SECRET_HEADER};
use sepet_storage::{
    classify_snapshot_file, write_atomic, SnapshotFile, UnpackReport, Unpacker,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const MAX_ARCHIVE_BYTES: usize = 1024 * 1024 * 1024;

pub struct AppState {
    watch_dir: PathBuf,
    secret_digest: [u8; 32],
    unpacker: Unpacker,
    // one deposit at a time; the unpacker rewrites the whole directory
    deposit_lock: Mutex<()>,
}

impl AppState {
    pub fn new(watch_dir: impl Into<PathBuf>, secret: &str) -> Self {
        let watch_dir = watch_dir.into();
        Self {
            unpacker: Unpacker::new(watch_dir.clone()),
            watch_dir,
            secret_digest: digest(secret.as_bytes()),
            deposit_lock: Mutex::new(()),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(SECRET_HEADER)
            .map(|value| digest(value.as_bytes()) == self.secret_digest)
            .unwrap_or(false)
    }
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

#[derive(Debug, Serialize)]
pub struct DepositResponse {
    pub archive: String,
    pub sha256: String,
    pub bytes: usize,
    pub extracted: Option<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn reject(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/snapshots", get(snapshots_handler))
        .route("/deposit", post(deposit_handler))
        .layer(DefaultBodyLimit::max(MAX_ARCHIVE_BYTES))
        .with_state(Arc::new(state))
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, watch_dir = %state.watch_dir.display(), "deposit endpoint listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("SEPET_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5001);
    let watch_dir = std::env::var("SEPET_WATCH_DIR").unwrap_or_else(|_| "./database".to_string());
    let secret = std::env::var("SEPET_UPLOAD_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("SEPET_UPLOAD_SECRET must be set to accept deposits"))?;
    serve(SocketAddr::from(([0, 0, 0, 0], port)), AppState::new(watch_dir, &secret)).await
}

async fn deposit_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.authorized(&headers) {
        warn!("deposit rejected: bad or missing secret");
        return reject(StatusCode::UNAUTHORIZED, "invalid upload secret");
    }

    let Some(name) = headers
        .get(ARCHIVE_NAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
    else {
        return reject(StatusCode::BAD_REQUEST, format!("missing {ARCHIVE_NAME_HEADER} header"));
    };
    // The name is only accepted in canonical form, which also rules out path separators.
    if !matches!(classify_snapshot_file(name), Some(SnapshotFile::Archive(_))) {
        return reject(StatusCode::BAD_REQUEST, format!("not a snapshot archive name: {name:?}"));
    }
    if body.is_empty() {
        return reject(StatusCode::BAD_REQUEST, "empty archive");
    }

    let _guard = state.deposit_lock.lock().await;
    let target = state.watch_dir.join(name);
    let written = match write_atomic(&target, &body).await {
        Ok(written) => written,
        Err(err) => {
            error!(error = %err, "could not store deposited archive");
            return reject(StatusCode::INTERNAL_SERVER_ERROR, "could not store archive");
        }
    };
    info!(archive = name, bytes = written.byte_size, sha256 = %written.sha256, "archive deposited");

    // The store for this date may predate the archive just written.
    let report = match state.unpacker.unpack_forced().await {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "unpack after deposit failed");
            return reject(StatusCode::INTERNAL_SERVER_ERROR, format!("archive stored but unpack failed: {err}"));
        }
    };

    (StatusCode::CREATED, Json(deposit_response(name, &written.sha256, written.byte_size, report)))
        .into_response()
}

fn deposit_response(name: &str, sha256: &str, bytes: usize, report: UnpackReport) -> DepositResponse {
    let file_name = |path: PathBuf| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    DepositResponse {
        archive: name.to_string(),
        sha256: sha256.to_string(),
        bytes,
        extracted: report.extracted.map(file_name),
        removed: report.removed.into_iter().map(file_name).collect(),
    }
}

#[derive(Debug, Serialize)]
struct SnapshotListing {
    stores: Vec<String>,
    archives: Vec<String>,
}

async fn snapshots_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut entries = match tokio::fs::read_dir(&state.watch_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Json(SnapshotListing {
                stores: Vec::new(),
                archives: Vec::new(),
            })
            .into_response()
        }
        Err(err) => return reject(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };

    let mut listing = SnapshotListing {
        stores: Vec::new(),
        archives: Vec::new(),
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let name = entry.file_name().to_string_lossy().into_owned();
                match classify_snapshot_file(&name) {
                    Some(SnapshotFile::Store(_)) => listing.stores.push(name),
                    Some(SnapshotFile::Archive(_)) => listing.archives.push(name),
                    None => {}
                }
            }
            Ok(None) => break,
            Err(err) => return reject(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
    listing.stores.sort();
    listing.archives.sort();
    Json(listing).into_response()
}
