use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use sepet_core::{PipelineError, ProductRecord};
use sepet_storage::csv_files::read_records;
use sepet_storage::{CategoryFileStore, WrittenFile};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::classifier::ProductClassifier;

/// Confidence band in which a prediction is logged as borderline. The
/// classifier's label still decides whether the record is kept.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrayZone {
    pub low: f64,
    pub high: f64,
}

impl Default for GrayZone {
    fn default() -> Self {
        Self {
            low: 0.2,
            high: 0.7,
        }
    }
}

impl GrayZone {
    pub fn contains(&self, confidence: f64) -> bool {
        (self.low..=self.high).contains(&confidence)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationOutcome {
    pub files_read: usize,
    pub rows_read: usize,
    pub duplicates_dropped: usize,
    pub classifier_dropped: usize,
    pub classifier_borderline: usize,
    pub classifier_fallbacks: usize,
    #[serde(skip)]
    pub records: Vec<ProductRecord>,
    pub combined: Option<WrittenFile>,
}

#[derive(Clone)]
pub struct CsvConsolidator {
    files: CategoryFileStore,
    classifier: Option<Arc<dyn ProductClassifier>>,
    gray_zone: GrayZone,
}

impl CsvConsolidator {
    pub fn new(files: CategoryFileStore) -> Self {
        Self {
            files,
            classifier: None,
            gray_zone: GrayZone::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ProductClassifier>, gray_zone: GrayZone) -> Self {
        self.classifier = Some(classifier);
        self.gray_zone = gray_zone;
        self
    }

    pub fn files(&self) -> &CategoryFileStore {
        &self.files
    }

    /// Merge one shop's category files for `date` into `combined.csv`.
    ///
    /// Category files are read in file-name order and deduplicated by
    /// `scraped_product_id`, first occurrence wins. Nothing is written when
    /// the day has no category files. Category files are never modified.
    pub async fn consolidate(
        &self,
        shop_name: &str,
        date: NaiveDate,
    ) -> Result<ConsolidationOutcome, PipelineError> {
        let span = info_span!("consolidate", shop = shop_name, %date);
        self.consolidate_inner(shop_name, date).instrument(span).await
    }

    async fn consolidate_inner(
        &self,
        shop_name: &str,
        date: NaiveDate,
    ) -> Result<ConsolidationOutcome, PipelineError> {
        let io_failure = |err: sepet_storage::StorageError| PipelineError::ConsolidationIo {
            shop: shop_name.to_string(),
            reason: err.to_string(),
        };

        let paths = self
            .files
            .list_category_files(shop_name, date)
            .await
            .map_err(io_failure)?;
        let mut outcome = ConsolidationOutcome {
            files_read: paths.len(),
            ..ConsolidationOutcome::default()
        };
        if paths.is_empty() {
            info!("no category files to consolidate");
            return Ok(outcome);
        }

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for path in &paths {
            let rows = read_records(path).await.map_err(io_failure)?;
            outcome.rows_read += rows.len();
            for row in rows {
                if seen.insert(row.scraped_product_id.clone()) {
                    unique.push(row);
                } else {
                    outcome.duplicates_dropped += 1;
                }
            }
        }

        outcome.records = match &self.classifier {
            Some(classifier) => self.gate(classifier.as_ref(), unique, &mut outcome).await,
            None => unique,
        };

        let written = self
            .files
            .write_combined(shop_name, date, &outcome.records)
            .await
            .map_err(io_failure)?;
        info!(
            files = outcome.files_read,
            rows_read = outcome.rows_read,
            rows_kept = outcome.records.len(),
            duplicates = outcome.duplicates_dropped,
            dropped = outcome.classifier_dropped,
            "consolidated category files"
        );
        outcome.combined = Some(written);
        Ok(outcome)
    }

    async fn gate(
        &self,
        classifier: &dyn ProductClassifier,
        records: Vec<ProductRecord>,
        outcome: &mut ConsolidationOutcome,
    ) -> Vec<ProductRecord> {
        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            match classifier.predict(&record.display_name).await {
                Ok(prediction) => {
                    if self.gray_zone.contains(prediction.confidence) {
                        info!(
                            name = %record.display_name,
                            label = prediction.label,
                            confidence = prediction.confidence,
                            "borderline prediction"
                        );
                        outcome.classifier_borderline += 1;
                    }
                    if !prediction.label {
                        debug!(name = %record.display_name, confidence = prediction.confidence, "dropped as non-food");
                        outcome.classifier_dropped += 1;
                        continue;
                    }
                }
                Err(err) => {
                    if outcome.classifier_fallbacks == 0 {
                        warn!(classifier = classifier.name(), error = %err, "classifier unavailable; accepting records");
                    }
                    outcome.classifier_fallbacks += 1;
                }
            }
            kept.push(record);
        }
        kept
    }
}
