//! Gzip archives of daily snapshot stores, the watched-directory unpacker and
//! the upload client that hands archives to a deposit endpoint.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};

use crate::{
    archive_file_name, classify_snapshot_file, io_error, is_temp_file, store_file_name,
    write_atomic, Result, SnapshotFile, StorageError,
};

pub const SECRET_HEADER: &str = "x-upload-secret";
pub const ARCHIVE_NAME_HEADER: &str = "x-archive-name";

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveOutcome {
    pub archive_path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
    pub source_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ArchiveManager {
    db_dir: PathBuf,
}

impl ArchiveManager {
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_dir: db_dir.into(),
        }
    }

    pub fn archive_path(&self, date: NaiveDate) -> PathBuf {
        self.db_dir.join(archive_file_name(date))
    }

    /// Compress the day's store into `sepet_data_<date>.db.gz` next to it.
    pub async fn archive(&self, date: NaiveDate) -> Result<ArchiveOutcome> {
        let store_path = self.db_dir.join(store_file_name(date));
        let raw = fs::read(&store_path).await.map_err(io_error(&store_path))?;
        let source_bytes = raw.len();

        let inner_name = store_file_name(date);
        let compressed = tokio::task::spawn_blocking(move || gzip_one(&inner_name, &raw))
            .await?
            .map_err(io_error(&store_path))?;

        let archive_path = self.archive_path(date);
        let written = write_atomic(&archive_path, &compressed).await?;
        info!(
            archive = %archive_path.display(),
            sha256 = %written.sha256,
            bytes = written.byte_size,
            "archived snapshot store"
        );

        Ok(ArchiveOutcome {
            archive_path,
            sha256: written.sha256,
            byte_size: written.byte_size,
            source_bytes,
        })
    }
}

fn gzip_one(inner_name: &str, raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzBuilder::new()
        .filename(inner_name)
        .write(Vec::with_capacity(raw.len() / 4), Compression::best());
    encoder.write_all(raw)?;
    encoder.finish()
}

fn gunzip(compressed: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UnpackReport {
    pub extracted: Option<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub no_op: bool,
}

/// Keeps a watched directory down to the newest archive and its extracted store.
#[derive(Debug, Clone)]
pub struct Unpacker {
    watch_dir: PathBuf,
}

struct Listing {
    archives: Vec<(NaiveDate, PathBuf)>,
    stores: Vec<(NaiveDate, PathBuf)>,
    unrelated: Vec<PathBuf>,
}

impl Unpacker {
    pub fn new(watch_dir: impl Into<PathBuf>) -> Self {
        Self {
            watch_dir: watch_dir.into(),
        }
    }

    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    pub async fn unpack(&self) -> Result<UnpackReport> {
        let listing = self.list().await?;

        if let ([(archive_date, _)], [(store_date, _)]) =
            (listing.archives.as_slice(), listing.stores.as_slice())
        {
            if archive_date == store_date && listing.unrelated.is_empty() {
                return Ok(UnpackReport {
                    no_op: true,
                    ..UnpackReport::default()
                });
            }
        }
        self.extract_newest(listing).await
    }

    /// Like [`Unpacker::unpack`], but always re-extracts the newest archive.
    ///
    /// Used right after an archive was replaced in place, when a matching
    /// store already exists but holds the previous contents.
    pub async fn unpack_forced(&self) -> Result<UnpackReport> {
        let listing = self.list().await?;
        self.extract_newest(listing).await
    }

    async fn extract_newest(&self, listing: Listing) -> Result<UnpackReport> {
        let newest_archive = listing.archives.iter().max_by_key(|(date, _)| *date).cloned();
        let mut report = UnpackReport::default();

        let keep_date = match newest_archive {
            Some((date, archive_path)) => {
                let store_path = self.watch_dir.join(store_file_name(date));
                let compressed = fs::read(&archive_path)
                    .await
                    .map_err(io_error(&archive_path))?;
                let raw = tokio::task::spawn_blocking(move || gunzip(&compressed))
                    .await?
                    .map_err(io_error(&archive_path))?;
                write_atomic(&store_path, &raw).await?;
                info!(archive = %archive_path.display(), store = %store_path.display(), "extracted archive");
                report.extracted = Some(store_path);
                Some(date)
            }
            None => listing.stores.iter().map(|(date, _)| *date).max(),
        };

        let stale = listing
            .archives
            .iter()
            .chain(listing.stores.iter())
            .filter(|(date, _)| Some(*date) != keep_date)
            .map(|(_, path)| path.clone())
            .chain(listing.unrelated);

        for path in stale {
            match fs::remove_file(&path).await {
                Ok(()) => report.removed.push(path),
                Err(err) => warn!(path = %path.display(), error = %err, "could not remove stale file"),
            }
        }

        report.no_op = report.extracted.is_none() && report.removed.is_empty();
        Ok(report)
    }

    async fn list(&self) -> Result<Listing> {
        fs::create_dir_all(&self.watch_dir)
            .await
            .map_err(io_error(&self.watch_dir))?;
        let mut entries = fs::read_dir(&self.watch_dir)
            .await
            .map_err(io_error(&self.watch_dir))?;

        let mut listing = Listing {
            archives: Vec::new(),
            stores: Vec::new(),
            unrelated: Vec::new(),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error(&self.watch_dir))?
        {
            let file_type = entry.file_type().await.map_err(io_error(&entry.path()))?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_temp_file(&name) {
                continue;
            }
            match classify_snapshot_file(&name) {
                Some(SnapshotFile::Archive(date)) => listing.archives.push((date, entry.path())),
                Some(SnapshotFile::Store(date)) => listing.stores.push((date, entry.path())),
                None => listing.unrelated.push(entry.path()),
            }
        }
        Ok(listing)
    }
}

/// Posts an archive to the deposit endpoint with the shared secret.
#[derive(Debug, Clone)]
pub struct ArchiveUploader {
    client: reqwest::Client,
    endpoint: String,
    secret: String,
}

impl ArchiveUploader {
    pub fn new(endpoint: impl Into<String>, secret: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("building upload client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            secret: secret.into(),
        })
    }

    pub async fn upload(&self, archive_path: &Path) -> Result<u16> {
        let file_name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !matches!(classify_snapshot_file(&file_name), Some(SnapshotFile::Archive(_))) {
            return Err(StorageError::SnapshotName(file_name));
        }
        let body = fs::read(archive_path).await.map_err(io_error(archive_path))?;

        let response = self
            .client
            .post(&self.endpoint)
            .header(SECRET_HEADER, &self.secret)
            .header(ARCHIVE_NAME_HEADER, &file_name)
            .body(body)
            .send()
            .await
            .map_err(|err| StorageError::Upload(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Upload(format!(
                "{} responded {status}",
                self.endpoint
            )));
        }
        info!(archive = %file_name, %status, "uploaded archive");
        Ok(status.as_u16())
    }
}
