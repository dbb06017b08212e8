//! Per-category and consolidated `;`-delimited record files.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use sepet_core::{day_stamp, ProductRecord, PRODUCT_RECORD_COLUMNS};
use tokio::fs;

use crate::{io_error, is_temp_file, write_atomic, Result, StorageError, WrittenFile};

pub const COMBINED_FILE_NAME: &str = "combined.csv";
const DELIMITER: u8 = b';';

/// Lays out `<root>/<shop_name>/<YYYY-MM-DD>/<category>.csv`.
#[derive(Debug, Clone)]
pub struct CategoryFileStore {
    root: PathBuf,
}

impl CategoryFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn day_dir(&self, shop_name: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(file_safe(shop_name))
            .join(day_stamp(date))
    }

    pub fn category_path(&self, shop_name: &str, date: NaiveDate, category_name: &str) -> PathBuf {
        self.day_dir(shop_name, date)
            .join(format!("{}.csv", file_safe(category_name)))
    }

    pub fn combined_path(&self, shop_name: &str, date: NaiveDate) -> PathBuf {
        self.day_dir(shop_name, date).join(COMBINED_FILE_NAME)
    }

    /// Overwrites the category file wholesale. An empty result set writes nothing.
    pub async fn write_category(
        &self,
        shop_name: &str,
        date: NaiveDate,
        category_name: &str,
        records: &[ProductRecord],
    ) -> Result<Option<WrittenFile>> {
        if records.is_empty() {
            return Ok(None);
        }
        let path = self.category_path(shop_name, date, category_name);
        let bytes = encode_records(&path, records)?;
        write_atomic(&path, &bytes).await.map(Some)
    }

    pub async fn write_combined(
        &self,
        shop_name: &str,
        date: NaiveDate,
        records: &[ProductRecord],
    ) -> Result<WrittenFile> {
        let path = self.combined_path(shop_name, date);
        let bytes = encode_records(&path, records)?;
        write_atomic(&path, &bytes).await
    }

    /// Category files for one shop and day, sorted by file name.
    pub async fn list_category_files(&self, shop_name: &str, date: NaiveDate) -> Result<Vec<PathBuf>> {
        let dir = self.day_dir(shop_name, date);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&dir)(err)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&dir))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == COMBINED_FILE_NAME || is_temp_file(&name) || !name.ends_with(".csv") {
                continue;
            }
            files.push(entry.path());
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    pub async fn read_combined(&self, shop_name: &str, date: NaiveDate) -> Result<Vec<ProductRecord>> {
        read_records(&self.combined_path(shop_name, date)).await
    }
}

pub async fn read_records(path: &Path) -> Result<Vec<ProductRecord>> {
    let bytes = fs::read(path).await.map_err(io_error(path))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(DELIMITER)
        .has_headers(true)
        .from_reader(bytes.as_slice());

    reader
        .deserialize::<ProductRecord>()
        .map(|row| row.map_err(|source| csv_error(path, source)))
        .collect()
}

fn encode_records(path: &Path, records: &[ProductRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(DELIMITER)
        .has_headers(false)
        .from_writer(Vec::new());

    writer
        .write_record(PRODUCT_RECORD_COLUMNS)
        .map_err(|source| csv_error(path, source))?;
    for record in records {
        writer
            .serialize(record)
            .map_err(|source| csv_error(path, source))?;
    }
    writer
        .into_inner()
        .map_err(|err| csv_error(path, csv::Error::from(err.into_error())))
}

fn csv_error(path: &Path, source: csv::Error) -> StorageError {
    StorageError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

fn file_safe(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect();
    if cleaned.is_empty() || cleaned.starts_with('.') {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sepet_core::scrape_timestamp;
    use tempfile::tempdir;

    fn record(name: &str, scraped_id: &str, price: f64, discount: f64) -> ProductRecord {
        ProductRecord {
            scrape_timestamp: scrape_timestamp::parse("2026-10-18 14:00:00").unwrap(),
            display_name: name.into(),
            shop_id: 1,
            category_id: 2,
            product_id: 5,
            price,
            discount_price: discount,
            url: format!("https://www.a101.com.tr/{scraped_id}"),
            scraped_product_id: scraped_id.into(),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    #[tokio::test]
    async fn category_files_round_trip_with_semicolon_header() {
        let dir = tempdir().unwrap();
        let store = CategoryFileStore::new(dir.path());
        let rows = vec![
            record("Sütaş Süt 1 L; tam yağlı", "p-1", 42.5, 39.9),
            record("Pınar Süt 1 L", "p-2", 41.0, 41.0),
        ];

        let written = store
            .write_category("A101", day(), "Süt", &rows)
            .await
            .unwrap()
            .expect("file written");
        assert!(written.path.ends_with("A101/2026-10-18/Süt.csv"));

        let raw = std::fs::read_to_string(&written.path).unwrap();
        assert!(raw.starts_with(
            "scrape_timestamp;display_name;shop_id;category_id;product_id;price;discount_price;url;scraped_product_id\n"
        ));
        assert!(raw.contains("2026-10-18 14:00:00;"));

        let back = read_records(&written.path).await.unwrap();
        assert_eq!(back, rows);
    }

    #[tokio::test]
    async fn empty_result_sets_write_no_file() {
        let dir = tempdir().unwrap();
        let store = CategoryFileStore::new(dir.path());
        let written = store.write_category("A101", day(), "Sucuk", &[]).await.unwrap();
        assert!(written.is_none());
        assert!(!store.category_path("A101", day(), "Sucuk").exists());
    }

    #[tokio::test]
    async fn listing_is_sorted_and_skips_combined() {
        let dir = tempdir().unwrap();
        let store = CategoryFileStore::new(dir.path());
        for name in ["Zeytin", "Ayran", "Makarna"] {
            store
                .write_category("Migros", day(), name, &[record(name, name, 1.0, 1.0)])
                .await
                .unwrap();
        }
        store.write_combined("Migros", day(), &[]).await.unwrap();

        let files = store.list_category_files("Migros", day()).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["Ayran.csv", "Makarna.csv", "Zeytin.csv"]);

        let missing = store.list_category_files("Nowhere", day()).await.unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn category_names_cannot_escape_the_day_dir() {
        assert_eq!(file_safe("Un/Irmik"), "Un_Irmik");
        assert_eq!(file_safe(".."), "_..");
    }
}
