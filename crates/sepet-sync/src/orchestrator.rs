use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use rand::Rng;
use sepet_adapters::ShopAdapter;
use sepet_core::{scrape_timestamp, CategoryEntry, FailureKind, PipelineError, ProductRecord, ShopConfig};
use sepet_session::{BrowsingSession, LoadedPages, PageLoadError, PageLoader, SessionProvider};
use sepet_storage::CategoryFileStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

/// Uniform random pause before each category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Politeness {
    pub min: Duration,
    pub max: Duration,
}

impl Politeness {
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn pick(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let millis = rand::rng().random_range(self.min.as_millis()..=self.max.as_millis());
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

impl Default for Politeness {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(5),
            max: Duration::from_secs(20),
        }
    }
}

/// Normalized records of one category plus the elements that were skipped.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub records: Vec<ProductRecord>,
    pub skipped: usize,
}

/// Turns loaded pages into [`ProductRecord`]s for one shop and category.
pub struct RecordExtractor<'a> {
    adapter: &'a dyn ShopAdapter,
    shop: &'a ShopConfig,
}

impl<'a> RecordExtractor<'a> {
    pub fn new(adapter: &'a dyn ShopAdapter, shop: &'a ShopConfig) -> Self {
        Self { adapter, shop }
    }

    /// A malformed element is logged and skipped; it never fails the page.
    pub fn extract(
        &self,
        pages: &LoadedPages,
        category: &CategoryEntry,
        crawled_at: NaiveDateTime,
    ) -> Result<Extraction, PipelineError> {
        let mut out = Extraction::default();
        for page in &pages.pages {
            let items = self.adapter.parse_page(page).map_err(|err| PipelineError::Extraction {
                shop: self.shop.shop_name.clone(),
                category: category.turkish_name.clone(),
                reason: err.to_string(),
            })?;

            for item in items {
                let raw = match item {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!(
                            shop = %self.shop.shop_name,
                            category = %category.turkish_name,
                            kind = ?FailureKind::Extraction,
                            error = %err,
                            "skipping malformed element"
                        );
                        out.skipped += 1;
                        continue;
                    }
                };

                let Some(scraped_product_id) = raw
                    .item_id
                    .clone()
                    .or_else(|| self.adapter.scraped_id_from_url(&raw.url))
                else {
                    warn!(
                        shop = %self.shop.shop_name,
                        category = %category.turkish_name,
                        kind = ?FailureKind::Extraction,
                        url = %raw.url,
                        "skipping element without an item id"
                    );
                    out.skipped += 1;
                    continue;
                };

                let prices = self.adapter.parse_price(&raw.price_fragment);
                if prices.is_zero() {
                    debug!(shop = %self.shop.shop_name, url = %raw.url, "keeping element with a zero price pair");
                }
                out.records.push(ProductRecord {
                    scrape_timestamp: crawled_at,
                    display_name: raw.display_name,
                    shop_id: self.shop.shop_id,
                    category_id: category.category_id,
                    product_id: category.product_id,
                    price: prices.regular,
                    discount_price: prices.discount,
                    url: raw.url,
                    scraped_product_id,
                });
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedCategory {
    pub category: String,
    pub kind: FailureKind,
    pub reason: String,
    #[serde(with = "scrape_timestamp")]
    pub at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub kind: FailureKind,
    pub reason: String,
}

/// What one worker did with its catalog chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub shop_name: String,
    pub chunk_index: usize,
    pub categories_attempted: usize,
    pub categories_written: usize,
    pub categories_empty: usize,
    pub records_written: usize,
    pub elements_skipped: usize,
    pub skipped: Vec<SkippedCategory>,
    /// Set when the worker never got a session; nothing was crawled.
    pub fatal: Option<WorkerFailure>,
}

/// Crawls one shop's catalog chunk with a single session.
pub struct ShopOrchestrator {
    shop: ShopConfig,
    adapter: Box<dyn ShopAdapter>,
    sessions: Arc<dyn SessionProvider>,
    loader: PageLoader,
    files: CategoryFileStore,
    politeness: Politeness,
}

impl ShopOrchestrator {
    pub fn new(
        shop: ShopConfig,
        adapter: Box<dyn ShopAdapter>,
        sessions: Arc<dyn SessionProvider>,
        loader: PageLoader,
        files: CategoryFileStore,
    ) -> Self {
        Self {
            shop,
            adapter,
            sessions,
            loader,
            files,
            politeness: Politeness::default(),
        }
    }

    pub fn with_politeness(mut self, politeness: Politeness) -> Self {
        self.politeness = politeness;
        self
    }

    pub async fn run(&self, chunk: &[CategoryEntry], chunk_index: usize, date: NaiveDate) -> WorkerReport {
        let span = info_span!(
            "shop_run",
            shop = %self.shop.shop_name,
            chunk = chunk_index,
            categories = chunk.len()
        );
        self.run_inner(chunk, chunk_index, date).instrument(span).await
    }

    async fn run_inner(&self, chunk: &[CategoryEntry], chunk_index: usize, date: NaiveDate) -> WorkerReport {
        let mut report = WorkerReport {
            shop_name: self.shop.shop_name.clone(),
            chunk_index,
            ..WorkerReport::default()
        };

        let mut session = match self.sessions.acquire(&self.shop).await {
            Ok(session) => session,
            Err(err) => {
                let failure = PipelineError::SessionInit {
                    shop: self.shop.shop_name.clone(),
                    reason: err.to_string(),
                };
                warn!(kind = ?failure.kind(), error = %failure, "worker gave up on shop");
                report.fatal = Some(WorkerFailure {
                    kind: failure.kind(),
                    reason: failure.to_string(),
                });
                return report;
            }
        };

        for category in chunk {
            let wait = self.politeness.pick();
            info!(category = %category.turkish_name, wait_ms = wait.as_millis() as u64, "waiting before next category");
            tokio::time::sleep(wait).await;

            report.categories_attempted += 1;
            match self.crawl_category(session.as_mut(), category, date).await {
                Ok((written, skipped)) => {
                    report.elements_skipped += skipped;
                    if written == 0 {
                        report.categories_empty += 1;
                    } else {
                        report.categories_written += 1;
                        report.records_written += written;
                    }
                }
                Err(err) => {
                    let at = now();
                    warn!(
                        category = %category.turkish_name,
                        kind = ?err.kind(),
                        at = %at,
                        error = %err,
                        "category skipped"
                    );
                    report.skipped.push(SkippedCategory {
                        category: category.turkish_name.clone(),
                        kind: err.kind(),
                        reason: err.to_string(),
                        at,
                    });
                }
            }
        }

        self.sessions.release(&self.shop, session).await;
        info!(
            written = report.categories_written,
            skipped = report.skipped.len(),
            records = report.records_written,
            "worker finished"
        );
        report
    }

    /// Returns the number of records written and elements skipped.
    async fn crawl_category(
        &self,
        session: &mut dyn BrowsingSession,
        category: &CategoryEntry,
        date: NaiveDate,
    ) -> Result<(usize, usize), PipelineError> {
        let shop = &self.shop.shop_name;
        let request = self
            .adapter
            .build_search_request(category)
            .map_err(|err| PipelineError::Extraction {
                shop: shop.clone(),
                category: category.turkish_name.clone(),
                reason: err.to_string(),
            })?;

        let crawled_at = now();
        let pages = self
            .loader
            .load(session, &request)
            .await
            .map_err(|err| match err {
                PageLoadError::Timeout { waited, .. } => PipelineError::PageLoadTimeout {
                    shop: shop.clone(),
                    category: category.turkish_name.clone(),
                    waited_secs: waited.as_secs(),
                },
                PageLoadError::Session(err) => PipelineError::Extraction {
                    shop: shop.clone(),
                    category: category.turkish_name.clone(),
                    reason: err.to_string(),
                },
            })?;

        let extraction = RecordExtractor::new(self.adapter.as_ref(), &self.shop).extract(
            &pages,
            category,
            crawled_at,
        )?;

        let written = self
            .files
            .write_category(shop, date, &category.turkish_name, &extraction.records)
            .await
            .map_err(|err| PipelineError::Persist {
                shop: shop.clone(),
                category: category.turkish_name.clone(),
                reason: err.to_string(),
            })?;
        match written {
            Some(file) => info!(
                category = %category.turkish_name,
                records = extraction.records.len(),
                path = %file.path.display(),
                "category file written"
            ),
            None => info!(category = %category.turkish_name, "no results; nothing written"),
        }
        Ok((extraction.records.len(), extraction.skipped))
    }
}

/// Crawl time at whole-second precision, the resolution records are stored at.
fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}
