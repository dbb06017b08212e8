use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sepet_adapters::AdapterRegistry;
use sepet_core::{day_stamp, CategoryEntry, FailureKind, PipelineError, ShopConfig};
use sepet_session::{PageLoader, SessionProvider};
use sepet_storage::{ArchiveManager, ArchiveUploader, CategoryFileStore, SnapshotStore};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::consolidate::CsvConsolidator;
use crate::orchestrator::{Politeness, ShopOrchestrator, WorkerFailure, WorkerReport};
use crate::{write_reports, RunSummary, ShopRunSummary, ShopStatus, UploadSummary};

/// One catalog chunk of one shop for one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub shop_name: String,
    pub chunk_index: usize,
    pub chunk_count: usize,
    pub date: NaiveDate,
}

/// Split `catalog` into `chunks` contiguous, near-equal slices.
///
/// The split only depends on the catalog and the chunk count, so a worker
/// process recomputes exactly the slice the supervisor assigned it.
pub fn partition_catalog(catalog: &[CategoryEntry], chunks: usize) -> Vec<&[CategoryEntry]> {
    if catalog.is_empty() {
        return Vec::new();
    }
    let count = chunks.clamp(1, catalog.len());
    let (base, extra) = (catalog.len() / count, catalog.len() % count);
    let mut out = Vec::with_capacity(count);
    let mut start = 0;
    for index in 0..count {
        let len = base + usize::from(index < extra);
        out.push(&catalog[start..start + len]);
        start += len;
    }
    out
}

/// Everything a worker needs to crawl its chunk.
pub struct WorkerRunner {
    shops: Vec<ShopConfig>,
    catalog: Vec<CategoryEntry>,
    registry: AdapterRegistry,
    sessions: Arc<dyn SessionProvider>,
    loader: PageLoader,
    files: CategoryFileStore,
    politeness: Politeness,
}

impl WorkerRunner {
    pub fn new(
        shops: Vec<ShopConfig>,
        catalog: Vec<CategoryEntry>,
        sessions: Arc<dyn SessionProvider>,
        loader: PageLoader,
        files: CategoryFileStore,
    ) -> Self {
        Self {
            shops,
            catalog,
            registry: AdapterRegistry::builtin(),
            sessions,
            loader,
            files,
            politeness: Politeness::default(),
        }
    }

    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_politeness(mut self, politeness: Politeness) -> Self {
        self.politeness = politeness;
        self
    }

    pub async fn run(&self, job: &WorkerJob) -> Result<WorkerReport> {
        let shop = self
            .shops
            .iter()
            .find(|shop| shop.shop_name == job.shop_name)
            .ok_or_else(|| anyhow!("unknown shop {:?}", job.shop_name))?;
        let chunks = partition_catalog(&self.catalog, job.chunk_count);
        let chunk = chunks.get(job.chunk_index).ok_or_else(|| {
            anyhow!(
                "chunk {} out of range; catalog splits into {} chunks",
                job.chunk_index,
                chunks.len()
            )
        })?;

        let adapter = match self.registry.create(shop) {
            Ok(adapter) => adapter,
            Err(err) => {
                return Ok(WorkerReport {
                    shop_name: shop.shop_name.clone(),
                    chunk_index: job.chunk_index,
                    fatal: Some(WorkerFailure {
                        kind: FailureKind::SessionInit,
                        reason: err.to_string(),
                    }),
                    ..WorkerReport::default()
                })
            }
        };

        let orchestrator = ShopOrchestrator::new(
            shop.clone(),
            adapter,
            Arc::clone(&self.sessions),
            self.loader.clone(),
            self.files.clone(),
        )
        .with_politeness(self.politeness);
        Ok(orchestrator.run(chunk, job.chunk_index, job.date).await)
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, job: WorkerJob) -> Result<WorkerReport>;
}

/// Runs workers as tasks in this process.
pub struct InProcessLauncher {
    runner: Arc<WorkerRunner>,
}

impl InProcessLauncher {
    pub fn new(runner: Arc<WorkerRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, job: WorkerJob) -> Result<WorkerReport> {
        self.runner.run(&job).await
    }
}

/// Runs each worker as `<program> worker --shop .. --chunk .. --chunks .. --date ..`
/// and reads its [`WorkerReport`] from the last line of stdout.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("locating the running executable")?;
        Ok(Self::new(program))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, job: WorkerJob) -> Result<WorkerReport> {
        let output = Command::new(&self.program)
            .arg("worker")
            .args(["--shop", job.shop_name.as_str()])
            .args(["--chunk", &job.chunk_index.to_string()])
            .args(["--chunks", &job.chunk_count.to_string()])
            .args(["--date", &day_stamp(job.date)])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning worker {}", self.program.display()))?;

        if !output.status.success() {
            bail!(
                "worker for {} chunk {} exited with {}",
                job.shop_name,
                job.chunk_index,
                output.status
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .context("worker printed no report")?;
        serde_json::from_str(line).context("parsing worker report")
    }
}

/// Runs every enabled shop: workers, then consolidation, then the snapshot
/// merge; after all shops, metadata, archive and optional upload.
pub struct ProcessSupervisor {
    shops: Vec<ShopConfig>,
    catalog: Vec<CategoryEntry>,
    registry: AdapterRegistry,
    sessions: Arc<dyn SessionProvider>,
    launcher: Arc<dyn WorkerLauncher>,
    consolidator: CsvConsolidator,
    snapshots: SnapshotStore,
    archives: ArchiveManager,
    uploader: Option<ArchiveUploader>,
    reports_dir: PathBuf,
    workers_per_shop: usize,
}

pub struct SupervisorParts {
    pub shops: Vec<ShopConfig>,
    pub catalog: Vec<CategoryEntry>,
    pub sessions: Arc<dyn SessionProvider>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub consolidator: CsvConsolidator,
    pub snapshots: SnapshotStore,
    pub archives: ArchiveManager,
    pub reports_dir: PathBuf,
    pub workers_per_shop: usize,
}

impl ProcessSupervisor {
    pub fn new(parts: SupervisorParts) -> Self {
        Self {
            shops: parts.shops,
            catalog: parts.catalog,
            registry: AdapterRegistry::builtin(),
            sessions: parts.sessions,
            launcher: parts.launcher,
            consolidator: parts.consolidator,
            snapshots: parts.snapshots,
            archives: parts.archives,
            uploader: None,
            reports_dir: parts.reports_dir,
            workers_per_shop: parts.workers_per_shop.max(1),
        }
    }

    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_uploader(mut self, uploader: ArchiveUploader) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub async fn run_once(&self, date: NaiveDate) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, %date);
        self.run_inner(run_id, date).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, date: NaiveDate) -> Result<RunSummary> {
        let started_at = Utc::now();
        let seeded_from = self
            .snapshots
            .prepare_day(date)
            .await
            .context("preparing the day's snapshot store")?;
        if let Some(previous) = &seeded_from {
            info!(from = %previous.display(), "seeded snapshot store");
        }

        let mut shops = Vec::new();
        for shop in self.shops.iter().filter(|shop| shop.enabled) {
            shops.push(self.run_shop(shop, date).await);
        }

        self.snapshots
            .refresh_metadata(date, &self.shops, &self.catalog)
            .await
            .context("refreshing metadata tables")?;
        let archive = self
            .archives
            .archive(date)
            .await
            .context("archiving the snapshot store")?;
        info!(path = %archive.archive_path.display(), bytes = archive.byte_size, "archive written");

        let upload = match &self.uploader {
            Some(uploader) => Some(match uploader.upload(&archive.archive_path).await {
                Ok(status) => UploadSummary {
                    status: Some(status),
                    error: None,
                },
                Err(err) => {
                    warn!(error = %err, "archive upload failed");
                    UploadSummary {
                        status: None,
                        error: Some(err.to_string()),
                    }
                }
            }),
            None => None,
        };

        let summary = RunSummary {
            run_id,
            date,
            started_at,
            finished_at: Utc::now(),
            shops,
            archive: Some(archive),
            upload,
            reports_dir: None,
        };
        let reports_dir = write_reports(&self.reports_dir, &summary).await?;
        Ok(RunSummary {
            reports_dir: Some(reports_dir.display().to_string()),
            ..summary
        })
    }

    async fn run_shop(&self, shop: &ShopConfig, date: NaiveDate) -> ShopRunSummary {
        let span = info_span!("shop", shop = %shop.shop_name);
        self.run_shop_inner(shop, date).instrument(span).await
    }

    async fn run_shop_inner(&self, shop: &ShopConfig, date: NaiveDate) -> ShopRunSummary {
        let mut summary = ShopRunSummary::new(shop);

        let preflight = if self.registry.contains(&shop.adapter_reference) {
            self.sessions.preflight(shop).map_err(|err| err.to_string())
        } else {
            Err(format!("no adapter registered for {:?}", shop.adapter_reference))
        };
        if let Err(reason) = preflight {
            let failure = PipelineError::SessionInit {
                shop: shop.shop_name.clone(),
                reason,
            };
            warn!(kind = ?failure.kind(), error = %failure, "shop skipped");
            summary.status = ShopStatus::Skipped;
            summary.failure = Some(WorkerFailure {
                kind: failure.kind(),
                reason: failure.to_string(),
            });
            return summary;
        }

        let chunk_count = partition_catalog(&self.catalog, self.workers_per_shop).len();
        let mut workers = JoinSet::new();
        for chunk_index in 0..chunk_count {
            let launcher = Arc::clone(&self.launcher);
            let job = WorkerJob {
                shop_name: shop.shop_name.clone(),
                chunk_index,
                chunk_count,
                date,
            };
            workers.spawn(async move { (chunk_index, launcher.launch(job).await) });
        }
        summary.workers = chunk_count;

        let mut reports = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(report))) => reports.push(report),
                Ok((chunk_index, Err(err))) => {
                    error!(chunk_index, error = %format!("{err:#}"), "worker failed");
                    summary.workers_failed += 1;
                }
                Err(err) => {
                    error!(error = %err, "worker task panicked or was cancelled");
                    summary.workers_failed += 1;
                }
            }
        }
        reports.sort_by_key(|report| report.chunk_index);
        summary.absorb(&reports);

        let consolidation = match self.consolidator.consolidate(&shop.shop_name, date).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(kind = ?err.kind(), error = %err, "consolidation failed; raw files kept");
                summary.fail(&err);
                return summary;
            }
        };

        if !consolidation.records.is_empty() {
            match self
                .snapshots
                .merge_shop(date, &shop.table_name(), &consolidation.records)
                .await
            {
                Ok(outcome) => summary.merge = Some(outcome),
                Err(err) => {
                    let err = PipelineError::Merge {
                        shop: shop.shop_name.clone(),
                        reason: err.to_string(),
                    };
                    error!(kind = ?err.kind(), error = %err, "merge aborted; store untouched");
                    summary.consolidation = Some(consolidation);
                    summary.fail(&err);
                    return summary;
                }
            }
        } else {
            info!("nothing to merge");
        }
        summary.consolidation = Some(consolidation);

        if summary.workers > 0 && summary.workers_fatal + summary.workers_failed == summary.workers {
            summary.status = ShopStatus::Failed;
            if summary.failure.is_none() {
                summary.failure = reports.iter().find_map(|report| report.fatal.clone());
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use sepet_core::{scrape_timestamp, ProductRecord};
    use sepet_storage::{classify_snapshot_file, SnapshotFile};
    use tempfile::tempdir;

    use super::*;
    use crate::orchestrator::tests::{a101, catalog, fast_loader, FixtureSessions};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    #[test]
    fn partition_is_contiguous_balanced_and_stable() {
        let catalog: Vec<_> = (0..5)
            .map(|i| CategoryEntry {
                product_id: i,
                turkish_name: format!("k{i}"),
                category_id: 1,
                turkish_category: "x".into(),
            })
            .collect();

        let chunks = partition_catalog(&catalog, 3);
        let sizes: Vec<_> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, [2, 2, 1]);
        assert_eq!(chunks.concat(), catalog);
        assert_eq!(partition_catalog(&catalog, chunks.len()), chunks);

        assert_eq!(partition_catalog(&catalog, 9).len(), 5);
        assert_eq!(partition_catalog(&catalog, 0).len(), 1);
        assert!(partition_catalog(&[], 4).is_empty());
    }

    /// Writes one category file per job instead of crawling.
    struct WritingLauncher {
        files: CategoryFileStore,
        jobs: Mutex<Vec<WorkerJob>>,
    }

    #[async_trait]
    impl WorkerLauncher for WritingLauncher {
        async fn launch(&self, job: WorkerJob) -> Result<WorkerReport> {
            self.jobs.lock().unwrap().push(job.clone());
            let record = ProductRecord {
                scrape_timestamp: scrape_timestamp::parse("2026-10-18 14:00:00").unwrap(),
                display_name: format!("Ürün {}", job.chunk_index),
                shop_id: 1,
                category_id: 1,
                product_id: 1,
                price: 10.0,
                discount_price: 10.0,
                url: format!("https://www.a101.com.tr/urun-p-{}", job.chunk_index),
                scraped_product_id: format!("{}", job.chunk_index),
            };
            self.files
                .write_category(&job.shop_name, job.date, &format!("k{}", job.chunk_index), &[record])
                .await?;
            Ok(WorkerReport {
                shop_name: job.shop_name,
                chunk_index: job.chunk_index,
                categories_attempted: 1,
                categories_written: 1,
                records_written: 1,
                ..WorkerReport::default()
            })
        }
    }

    struct Dirs {
        _root: tempfile::TempDir,
        files: CategoryFileStore,
        db: PathBuf,
        reports: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = tempdir().unwrap();
        let files = CategoryFileStore::new(root.path().join("downloads"));
        let db = root.path().join("database");
        let reports = root.path().join("reports");
        Dirs {
            files,
            db,
            reports,
            _root: root,
        }
    }

    fn supervisor(dirs: &Dirs, shops: Vec<ShopConfig>, launcher: Arc<dyn WorkerLauncher>) -> ProcessSupervisor {
        ProcessSupervisor::new(SupervisorParts {
            shops,
            catalog: catalog(),
            sessions: Arc::new(FixtureSessions {
                stall_on: None,
                refuse: false,
            }),
            launcher,
            consolidator: CsvConsolidator::new(dirs.files.clone()),
            snapshots: SnapshotStore::new(&dirs.db),
            archives: ArchiveManager::new(&dirs.db),
            reports_dir: dirs.reports.clone(),
            workers_per_shop: 2,
        })
    }

    #[tokio::test]
    async fn full_run_merges_archives_and_reports() {
        let dirs = dirs();
        let launcher = Arc::new(WritingLauncher {
            files: dirs.files.clone(),
            jobs: Mutex::new(Vec::new()),
        });
        let mut unknown = a101();
        unknown.shop_name = "Koop".into();
        unknown.adapter_reference = "koop".into();
        let mut disabled = a101();
        disabled.shop_name = "Kapali".into();
        disabled.enabled = false;

        let summary = supervisor(&dirs, vec![a101(), unknown, disabled], launcher.clone())
            .run_once(day())
            .await
            .unwrap();

        let jobs = launcher.jobs.lock().unwrap().clone();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.chunk_count == 2 && job.shop_name == "A101"));

        assert_eq!(summary.shops.len(), 2);
        assert_eq!(summary.shops[0].status, ShopStatus::Completed);
        assert_eq!(summary.shops[0].merge.as_ref().unwrap().rows_after, 2);
        assert_eq!(summary.shops[1].status, ShopStatus::Skipped);
        assert_eq!(
            summary.shops[1].failure.as_ref().map(|f| f.kind),
            Some(FailureKind::SessionInit)
        );

        let snapshots = SnapshotStore::new(&dirs.db);
        assert_eq!(snapshots.read_table(day(), "A101").await.unwrap().len(), 2);
        let archive = summary.archive.as_ref().unwrap();
        assert_eq!(
            classify_snapshot_file(&archive.archive_path.file_name().unwrap().to_string_lossy()),
            Some(SnapshotFile::Archive(day()))
        );

        let reports_dir = PathBuf::from(summary.reports_dir.as_ref().unwrap());
        assert!(reports_dir.join("run_summary.json").exists());
        assert!(reports_dir.join("daily_brief.md").exists());
    }

    #[tokio::test]
    async fn rerunning_the_same_day_never_loses_rows() {
        let dirs = dirs();
        let launcher = Arc::new(WritingLauncher {
            files: dirs.files.clone(),
            jobs: Mutex::new(Vec::new()),
        });
        let supervisor = supervisor(&dirs, vec![a101()], launcher);

        let first = supervisor.run_once(day()).await.unwrap();
        let second = supervisor.run_once(day()).await.unwrap();

        let first_rows = first.shops[0].merge.as_ref().unwrap().rows_after;
        let second_merge = second.shops[0].merge.as_ref().unwrap();
        assert!(second_merge.rows_after >= first_rows);
        assert_eq!(second_merge.rows_added(), 0);
    }

    #[tokio::test]
    async fn in_process_workers_crawl_through_the_orchestrator() {
        let dirs = dirs();
        let runner = WorkerRunner::new(
            vec![a101()],
            catalog(),
            Arc::new(FixtureSessions {
                stall_on: Some("S%C3%BCt".into()),
                refuse: false,
            }),
            fast_loader(),
            dirs.files.clone(),
        )
        .with_politeness(Politeness::none());
        let launcher = Arc::new(InProcessLauncher::new(Arc::new(runner)));

        let summary = supervisor(&dirs, vec![a101()], launcher)
            .run_once(day())
            .await
            .unwrap();

        let shop = &summary.shops[0];
        assert_eq!(shop.categories_attempted, 3);
        assert_eq!(shop.categories_written, 2);
        assert_eq!(shop.categories_skipped.len(), 1);
        assert_eq!(shop.categories_skipped[0].kind, FailureKind::PageLoadTimeout);
        // both categories see the same two fixture items
        assert_eq!(shop.consolidation.as_ref().unwrap().records.len(), 2);
    }

    #[tokio::test]
    async fn worker_runner_rejects_out_of_range_chunks() {
        let dirs = dirs();
        let runner = WorkerRunner::new(
            vec![a101()],
            catalog(),
            Arc::new(FixtureSessions {
                stall_on: None,
                refuse: false,
            }),
            fast_loader(),
            dirs.files.clone(),
        );
        let job = WorkerJob {
            shop_name: "A101".into(),
            chunk_index: 5,
            chunk_count: 2,
            date: day(),
        };
        assert!(runner.run(&job).await.is_err());
    }
}
