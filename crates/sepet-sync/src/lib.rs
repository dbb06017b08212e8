//! Crawl, consolidate, merge and archive pipeline for Sepet.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use sepet_core::{CategoryEntry, PipelineError, ShopConfig};
use sepet_session::{LoaderConfig, PageLoader, SessionManager, SessionProvider, SessionSettings};
use sepet_storage::{
    ArchiveManager, ArchiveOutcome, ArchiveUploader, CategoryFileStore, MergeOutcome, SnapshotStore,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod classifier;
mod consolidate;
mod orchestrator;
mod supervisor;

pub use classifier::{AcceptAll, ClassifierError, HttpClassifier, KeywordRules, Prediction, ProductClassifier};
pub use consolidate::{ConsolidationOutcome, CsvConsolidator, GrayZone};
pub use orchestrator::{
    Extraction, Politeness, RecordExtractor, ShopOrchestrator, SkippedCategory, WorkerFailure, WorkerReport,
};
pub use supervisor::{
    partition_catalog, InProcessLauncher, ProcessLauncher, ProcessSupervisor, SupervisorParts, WorkerJob,
    WorkerLauncher, WorkerRunner,
};

pub const SHOPS_FILE: &str = "shops.yaml";
pub const CATALOG_FILE: &str = "catalog.yaml";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub db_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub workers_per_shop: usize,
    pub delay_min: Duration,
    pub delay_max: Duration,
    pub scroll_interval: Duration,
    pub max_scrolls: usize,
    pub proxy_url: Option<String>,
    pub chrome_path: Option<PathBuf>,
    pub classifier_rules: Option<PathBuf>,
    pub classifier_url: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub upload_url: Option<String>,
    pub upload_secret: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values take the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let path = |key: &str, default: &str| PathBuf::from(text(key).unwrap_or_else(|| default.to_string()));
        let number = |key: &str, default: u64| -> u64 {
            text(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };

        Self {
            config_dir: path("SEPET_CONFIG_DIR", "./configs"),
            downloads_dir: path("SEPET_DOWNLOADS_DIR", "./downloads"),
            db_dir: path("SEPET_DB_DIR", "./database"),
            reports_dir: path("SEPET_REPORTS_DIR", "./reports"),
            workers_per_shop: number("SEPET_WORKERS_PER_SHOP", 2).max(1) as usize,
            delay_min: Duration::from_secs(number("SEPET_DELAY_MIN_SECS", 5)),
            delay_max: Duration::from_secs(number("SEPET_DELAY_MAX_SECS", 20)),
            scroll_interval: Duration::from_millis(number("SEPET_SCROLL_INTERVAL_MS", 2000)),
            max_scrolls: number("SEPET_MAX_SCROLLS", 60) as usize,
            proxy_url: text("SEPET_PROXY_URL"),
            chrome_path: text("SEPET_CHROME_PATH").map(PathBuf::from),
            classifier_rules: text("SEPET_CLASSIFIER_RULES").map(PathBuf::from),
            classifier_url: text("SEPET_CLASSIFIER_URL"),
            scheduler_enabled: text("SEPET_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: text("SEPET_SYNC_CRON").unwrap_or_else(|| "0 0 14 * * *".to_string()),
            upload_url: text("SEPET_UPLOAD_URL"),
            upload_secret: text("SEPET_UPLOAD_SECRET"),
        }
    }

    pub fn shops_path(&self) -> PathBuf {
        self.config_dir.join(SHOPS_FILE)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.config_dir.join(CATALOG_FILE)
    }

    pub fn politeness(&self) -> Politeness {
        Politeness {
            min: self.delay_min,
            max: self.delay_max.max(self.delay_min),
        }
    }

    pub fn page_loader(&self) -> PageLoader {
        PageLoader::new(LoaderConfig {
            scroll_interval: self.scroll_interval,
            max_scroll_iterations: self.max_scrolls,
            ..LoaderConfig::default()
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            chrome_path: self.chrome_path.clone(),
            proxy_url: self.proxy_url.clone(),
            ..SessionSettings::default()
        }
    }

    pub fn file_store(&self) -> CategoryFileStore {
        CategoryFileStore::new(&self.downloads_dir)
    }

    pub fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(&self.db_dir)
    }

    pub fn archive_manager(&self) -> ArchiveManager {
        ArchiveManager::new(&self.db_dir)
    }
}

async fn load_yaml_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::ConfigMissing {
                path: path.display().to_string(),
            }
            .into())
        }
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub async fn load_shops(path: &Path) -> Result<Vec<ShopConfig>> {
    load_yaml_list(path).await
}

pub async fn load_catalog(path: &Path) -> Result<Vec<CategoryEntry>> {
    load_yaml_list(path).await
}

/// The configured classifier, or `None` when the gate is off.
///
/// A classifier that cannot be built is replaced by [`AcceptAll`].
pub async fn build_classifier(config: &SyncConfig) -> Option<Arc<dyn ProductClassifier>> {
    if let Some(url) = &config.classifier_url {
        return Some(match HttpClassifier::new(url.clone(), Duration::from_secs(10)) {
            Ok(classifier) => Arc::new(classifier),
            Err(err) => {
                warn!(error = %err, "http classifier unavailable; accepting all records");
                Arc::new(AcceptAll)
            }
        });
    }
    let path = config.classifier_rules.as_ref()?;
    Some(match KeywordRules::from_file(path).await {
        Ok(rules) => Arc::new(rules),
        Err(err) => {
            warn!(error = %err, "keyword rules unavailable; accepting all records");
            Arc::new(AcceptAll)
        }
    })
}

pub async fn worker_runner_from_config(config: &SyncConfig) -> Result<WorkerRunner> {
    let shops = load_shops(&config.shops_path()).await?;
    let catalog = load_catalog(&config.catalog_path()).await?;
    let sessions: Arc<dyn SessionProvider> = Arc::new(SessionManager::new(config.session_settings()));
    Ok(
        WorkerRunner::new(shops, catalog, sessions, config.page_loader(), config.file_store())
            .with_politeness(config.politeness()),
    )
}

pub async fn consolidator_from_config(config: &SyncConfig) -> CsvConsolidator {
    let consolidator = CsvConsolidator::new(config.file_store());
    match build_classifier(config).await {
        Some(classifier) => {
            info!(classifier = classifier.name(), "classifier gate enabled");
            consolidator.with_classifier(classifier, GrayZone::default())
        }
        None => consolidator,
    }
}

pub async fn supervisor_from_config(
    config: &SyncConfig,
    launcher: Arc<dyn WorkerLauncher>,
) -> Result<ProcessSupervisor> {
    let shops = load_shops(&config.shops_path()).await?;
    let catalog = load_catalog(&config.catalog_path()).await?;
    info!(shops = shops.len(), categories = catalog.len(), "configuration loaded");

    let supervisor = ProcessSupervisor::new(SupervisorParts {
        shops,
        catalog,
        sessions: Arc::new(SessionManager::new(config.session_settings())),
        launcher,
        consolidator: consolidator_from_config(config).await,
        snapshots: config.snapshot_store(),
        archives: config.archive_manager(),
        reports_dir: config.reports_dir.clone(),
        workers_per_shop: config.workers_per_shop,
    });
    Ok(match (&config.upload_url, &config.upload_secret) {
        (Some(url), Some(secret)) => supervisor.with_uploader(ArchiveUploader::new(url, secret)?),
        (Some(_), None) => {
            warn!("SEPET_UPLOAD_URL set without SEPET_UPLOAD_SECRET; upload disabled");
            supervisor
        }
        _ => supervisor,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShopStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShopRunSummary {
    pub shop_name: String,
    pub table: String,
    pub status: ShopStatus,
    pub failure: Option<WorkerFailure>,
    pub workers: usize,
    pub workers_failed: usize,
    pub workers_fatal: usize,
    pub categories_attempted: usize,
    pub categories_written: usize,
    pub categories_skipped: Vec<SkippedCategory>,
    pub records_written: usize,
    pub consolidation: Option<ConsolidationOutcome>,
    pub merge: Option<MergeOutcome>,
}

impl ShopRunSummary {
    fn new(shop: &ShopConfig) -> Self {
        Self {
            shop_name: shop.shop_name.clone(),
            table: shop.table_name(),
            status: ShopStatus::Completed,
            failure: None,
            workers: 0,
            workers_failed: 0,
            workers_fatal: 0,
            categories_attempted: 0,
            categories_written: 0,
            categories_skipped: Vec::new(),
            records_written: 0,
            consolidation: None,
            merge: None,
        }
    }

    fn absorb(&mut self, reports: &[WorkerReport]) {
        for report in reports {
            self.workers_fatal += usize::from(report.fatal.is_some());
            self.categories_attempted += report.categories_attempted;
            self.categories_written += report.categories_written;
            self.records_written += report.records_written;
            self.categories_skipped.extend(report.skipped.iter().cloned());
        }
    }

    fn fail(&mut self, err: &PipelineError) {
        self.status = ShopStatus::Failed;
        self.failure = Some(WorkerFailure {
            kind: err.kind(),
            reason: err.to_string(),
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    pub status: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub shops: Vec<ShopRunSummary>,
    pub archive: Option<ArchiveOutcome>,
    pub upload: Option<UploadSummary>,
    pub reports_dir: Option<String>,
}

/// Write `run_summary.json` and `daily_brief.md` under `<reports_root>/<run_id>/`.
pub async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(reports_dir.join("daily_brief.md"), daily_brief(summary))
        .await
        .context("writing daily_brief.md")?;
    Ok(reports_dir)
}

fn daily_brief(summary: &RunSummary) -> String {
    let mut skipped_by_kind: BTreeMap<String, usize> = BTreeMap::new();
    for shop in &summary.shops {
        for skipped in &shop.categories_skipped {
            *skipped_by_kind.entry(format!("{:?}", skipped.kind)).or_default() += 1;
        }
    }

    let mut lines = vec![
        "# Sepet Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Date: {}", summary.date),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        String::new(),
        "## Shops".to_string(),
    ];
    for shop in &summary.shops {
        let rows = shop
            .merge
            .as_ref()
            .map(|m| format!("{} rows (+{})", m.rows_after, m.rows_added()))
            .unwrap_or_else(|| "not merged".to_string());
        lines.push(format!(
            "- {}: {:?}, {} categories written, {} skipped, {}",
            shop.shop_name,
            shop.status,
            shop.categories_written,
            shop.categories_skipped.len(),
            rows
        ));
        if let Some(failure) = &shop.failure {
            lines.push(format!("  - {:?}: {}", failure.kind, failure.reason));
        }
    }
    if !skipped_by_kind.is_empty() {
        lines.push(String::new());
        lines.push("## Skipped categories".to_string());
        lines.extend(skipped_by_kind.iter().map(|(kind, n)| format!("- {kind}: {n}")));
    }
    if let Some(archive) = &summary.archive {
        lines.push(String::new());
        lines.push(format!(
            "Archive: `{}` ({} bytes, sha256 {})",
            archive.archive_path.display(),
            archive.byte_size,
            archive.sha256
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Cron job that runs the supervisor for the local calendar day, when enabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    supervisor: Arc<ProcessSupervisor>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let supervisor = Arc::clone(&supervisor);
        Box::pin(async move {
            let today = Local::now().date_naive();
            match supervisor.run_once(today).await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled run finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
