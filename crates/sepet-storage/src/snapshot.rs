//! Daily SQLite snapshot store: one table per shop plus metadata tables.
//!
//! Every mutation runs against a temporary copy of the day's store file which
//! is renamed over the original only after the transaction commits. A failed
//! merge leaves the store exactly as it was.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use sepet_core::{scrape_timestamp, CategoryEntry, ProductRecord, ShopConfig, SCRAPE_TIMESTAMP_FORMAT};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::fs;
use tracing::{debug, info};

use crate::{
    classify_snapshot_file, io_error, store_file_name, temp_name_for, Result, SnapshotFile,
    StorageError,
};

pub const SHOPS_METADATA_TABLE: &str = "shops_metadata";
pub const CATEGORIES_METADATA_TABLE: &str = "food_categories_metadata";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub table: String,
    pub rows_before: usize,
    pub incoming: usize,
    pub rows_after: usize,
}

impl MergeOutcome {
    pub fn rows_added(&self) -> usize {
        self.rows_after - self.rows_before
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    db_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_dir: db_dir.into(),
        }
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    pub fn store_path(&self, date: NaiveDate) -> PathBuf {
        self.db_dir.join(store_file_name(date))
    }

    /// Seed the day's store from the newest earlier store when it does not exist yet.
    ///
    /// Returns the store it was seeded from, if any.
    pub async fn prepare_day(&self, date: NaiveDate) -> Result<Option<PathBuf>> {
        let target = self.store_path(date);
        if fs::try_exists(&target).await.map_err(io_error(&target))? {
            return Ok(None);
        }
        fs::create_dir_all(&self.db_dir)
            .await
            .map_err(io_error(&self.db_dir))?;

        let Some(previous) = self.newest_store_before(date).await? else {
            debug!(date = %date, "no earlier snapshot store to seed from");
            return Ok(None);
        };

        let temp = self.db_dir.join(temp_name_for(&store_file_name(date)));
        let copied: std::io::Result<()> = async {
            fs::copy(&previous, &temp).await?;
            fs::rename(&temp, &target).await
        }
        .await;
        if let Err(source) = copied {
            let _ = fs::remove_file(&temp).await;
            return Err(StorageError::Io {
                path: target,
                source,
            });
        }
        info!(from = %previous.display(), to = %target.display(), "seeded snapshot store");
        Ok(Some(previous))
    }

    async fn newest_store_before(&self, date: NaiveDate) -> Result<Option<PathBuf>> {
        let mut entries = fs::read_dir(&self.db_dir)
            .await
            .map_err(io_error(&self.db_dir))?;
        let mut newest: Option<(NaiveDate, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.db_dir))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(SnapshotFile::Store(found)) = classify_snapshot_file(&name) {
                if found < date && newest.as_ref().map_or(true, |(best, _)| found > *best) {
                    newest = Some((found, entry.path()));
                }
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    /// Union `incoming` into `table`, collapsing only exact duplicates.
    ///
    /// Existing rows are kept verbatim and first; an incoming row is added
    /// unless an identical row is already present.
    pub async fn merge_shop(
        &self,
        date: NaiveDate,
        table: &str,
        incoming: &[ProductRecord],
    ) -> Result<MergeOutcome> {
        let copy = WorkingCopy::open(&self.store_path(date)).await?;
        let merged = merge_into(copy.pool(), table, incoming).await;
        match merged {
            Ok(outcome) => {
                copy.commit().await?;
                info!(
                    table,
                    rows_before = outcome.rows_before,
                    rows_after = outcome.rows_after,
                    "merged shop snapshot"
                );
                Ok(outcome)
            }
            Err(err) => {
                copy.discard().await;
                Err(err)
            }
        }
    }

    /// Rewrite `shops_metadata` and `food_categories_metadata` wholesale.
    pub async fn refresh_metadata(
        &self,
        date: NaiveDate,
        shops: &[ShopConfig],
        catalog: &[CategoryEntry],
    ) -> Result<()> {
        let copy = WorkingCopy::open(&self.store_path(date)).await?;
        match write_metadata(copy.pool(), shops, catalog).await {
            Ok(()) => copy.commit().await,
            Err(err) => {
                copy.discard().await;
                Err(err)
            }
        }
    }

    pub async fn read_table(&self, date: NaiveDate, table: &str) -> Result<Vec<ProductRecord>> {
        let pool = open_pool(&self.store_path(date), false).await?;
        let rows = read_shop_rows(&pool, table).await;
        pool.close().await;
        rows
    }

    pub async fn table_names(&self, date: NaiveDate) -> Result<Vec<String>> {
        let pool = open_pool(&self.store_path(date), false).await?;
        let names = sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await;
        pool.close().await;
        Ok(names?)
    }
}

struct WorkingCopy {
    target: PathBuf,
    temp: PathBuf,
    pool: SqlitePool,
}

impl WorkingCopy {
    async fn open(target: &Path) -> Result<Self> {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).await.map_err(io_error(dir))?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = dir.join(temp_name_for(&file_name));

        if fs::try_exists(target).await.map_err(io_error(target))? {
            fs::copy(target, &temp).await.map_err(io_error(&temp))?;
        }

        match open_pool(&temp, true).await {
            Ok(pool) => Ok(Self {
                target: target.to_path_buf(),
                temp,
                pool,
            }),
            Err(err) => {
                let _ = fs::remove_file(&temp).await;
                Err(err)
            }
        }
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn commit(self) -> Result<()> {
        self.pool.close().await;
        if let Err(source) = fs::rename(&self.temp, &self.target).await {
            let _ = fs::remove_file(&self.temp).await;
            return Err(StorageError::Io {
                path: self.target,
                source,
            });
        }
        Ok(())
    }

    async fn discard(self) {
        self.pool.close().await;
        let _ = fs::remove_file(&self.temp).await;
    }
}

async fn open_pool(path: &Path, create: bool) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Delete);
    Ok(SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?)
}

fn quoted(table: &str) -> String {
    format!("\"{}\"", table.replace('"', "\"\""))
}

async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let found: Option<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

async fn read_shop_rows(pool: &SqlitePool, table: &str) -> Result<Vec<ProductRecord>> {
    if !table_exists(pool, table).await? {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT scrape_timestamp, display_name, shop_id, category_id, product_id, \
         price, discount_price, url, scraped_product_id FROM {} ORDER BY rowid",
        quoted(table)
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(|row| decode_row(table, row)).collect()
}

fn decode_row(table: &str, row: &sqlx::sqlite::SqliteRow) -> Result<ProductRecord> {
    let malformed = |reason: String| StorageError::MalformedRow {
        table: table.to_string(),
        reason,
    };
    let id = |column: &str| -> Result<u32> {
        let raw: i64 = row.try_get(column)?;
        u32::try_from(raw).map_err(|_| malformed(format!("{column} out of range: {raw}")))
    };
    let raw_ts: String = row.try_get("scrape_timestamp")?;

    Ok(ProductRecord {
        scrape_timestamp: scrape_timestamp::parse(&raw_ts)
            .map_err(|err| malformed(format!("bad timestamp {raw_ts:?}: {err}")))?,
        display_name: row.try_get("display_name")?,
        shop_id: id("shop_id")?,
        category_id: id("category_id")?,
        product_id: id("product_id")?,
        price: row.try_get("price")?,
        discount_price: row.try_get("discount_price")?,
        url: row.try_get("url")?,
        scraped_product_id: row.try_get("scraped_product_id")?,
    })
}

async fn merge_into(pool: &SqlitePool, table: &str, incoming: &[ProductRecord]) -> Result<MergeOutcome> {
    let existing = read_shop_rows(pool, table).await?;
    let rows_before = existing.len();

    let mut seen: HashSet<_> = existing.iter().map(ProductRecord::exact_key).collect();
    let mut merged = existing;
    for record in incoming {
        if seen.insert(record.exact_key()) {
            merged.push(record.clone());
        }
    }

    let mut tx = pool.begin().await?;
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", quoted(table)))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE {} (
            scrape_timestamp TEXT NOT NULL,
            display_name TEXT NOT NULL,
            shop_id INTEGER NOT NULL,
            category_id INTEGER NOT NULL,
            product_id INTEGER NOT NULL,
            price REAL NOT NULL,
            discount_price REAL NOT NULL,
            url TEXT NOT NULL,
            scraped_product_id TEXT NOT NULL
        )",
        quoted(table)
    ))
    .execute(&mut *tx)
    .await?;

    let insert = format!(
        "INSERT INTO {} (scrape_timestamp, display_name, shop_id, category_id, product_id, \
         price, discount_price, url, scraped_product_id) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        quoted(table)
    );
    for record in &merged {
        sqlx::query(&insert)
            .bind(record.scrape_timestamp.format(SCRAPE_TIMESTAMP_FORMAT).to_string())
            .bind(&record.display_name)
            .bind(i64::from(record.shop_id))
            .bind(i64::from(record.category_id))
            .bind(i64::from(record.product_id))
            .bind(record.price)
            .bind(record.discount_price)
            .bind(&record.url)
            .bind(&record.scraped_product_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(MergeOutcome {
        table: table.to_string(),
        rows_before,
        incoming: incoming.len(),
        rows_after: merged.len(),
    })
}

async fn write_metadata(pool: &SqlitePool, shops: &[ShopConfig], catalog: &[CategoryEntry]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(&format!("DROP TABLE IF EXISTS {SHOPS_METADATA_TABLE}"))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE {SHOPS_METADATA_TABLE} (
            shop_id INTEGER NOT NULL,
            shop_name TEXT NOT NULL,
            base_url TEXT NOT NULL,
            logo TEXT
        )"
    ))
    .execute(&mut *tx)
    .await?;
    for shop in shops {
        sqlx::query(&format!(
            "INSERT INTO {SHOPS_METADATA_TABLE} (shop_id, shop_name, base_url, logo) VALUES (?, ?, ?, ?)"
        ))
        .bind(i64::from(shop.shop_id))
        .bind(&shop.shop_name)
        .bind(&shop.base_url)
        .bind(shop.logo.as_deref())
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(&format!("DROP TABLE IF EXISTS {CATEGORIES_METADATA_TABLE}"))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE {CATEGORIES_METADATA_TABLE} (
            product_id INTEGER NOT NULL,
            TurkishName TEXT NOT NULL,
            category_id INTEGER NOT NULL,
            TurkishCategory TEXT NOT NULL
        )"
    ))
    .execute(&mut *tx)
    .await?;
    for entry in catalog {
        sqlx::query(&format!(
            "INSERT INTO {CATEGORIES_METADATA_TABLE} (product_id, TurkishName, category_id, TurkishCategory) \
             VALUES (?, ?, ?, ?)"
        ))
        .bind(i64::from(entry.product_id))
        .bind(&entry.turkish_name)
        .bind(i64::from(entry.category_id))
        .bind(&entry.turkish_category)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sepet_core::SessionKind;
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    fn record(scraped_id: &str, price: f64) -> ProductRecord {
        ProductRecord {
            scrape_timestamp: scrape_timestamp::parse("2026-10-18 14:00:00").unwrap(),
            display_name: format!("Ürün {scraped_id}"),
            shop_id: 2,
            category_id: 1,
            product_id: 10,
            price,
            discount_price: price,
            url: format!("https://www.migros.com.tr/urun-p-{scraped_id}"),
            scraped_product_id: scraped_id.into(),
        }
    }

    #[tokio::test]
    async fn merge_is_additive_and_collapses_exact_duplicates() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        let first = store
            .merge_shop(day(18), "Migros", &[record("1", 10.0), record("2", 20.0)])
            .await
            .unwrap();
        assert_eq!((first.rows_before, first.rows_after), (0, 2));

        let second = store
            .merge_shop(
                day(18),
                "Migros",
                &[record("2", 20.0), record("2", 21.5), record("3", 5.0)],
            )
            .await
            .unwrap();
        assert_eq!(second.rows_before, 2);
        assert_eq!(second.rows_after, 4);
        assert_eq!(second.rows_added(), 2);

        let again = store
            .merge_shop(day(18), "Migros", &[record("1", 10.0)])
            .await
            .unwrap();
        assert_eq!(again.rows_after, again.rows_before);

        let rows = store.read_table(day(18), "Migros").await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.scraped_product_id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "2", "3"]);
        assert_eq!(rows[2].price, 21.5);
    }

    #[tokio::test]
    async fn merge_leaves_no_working_copy_behind() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store
            .merge_shop(day(18), "A101", &[record("9", 3.5)])
            .await
            .unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["sepet_data_2026-10-18.db"]);
    }

    #[tokio::test]
    async fn failed_merge_leaves_the_store_untouched() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store
            .merge_shop(day(18), "A101", &[record("9", 3.5)])
            .await
            .unwrap();

        let pool = open_pool(&store.store_path(day(18)), false).await.unwrap();
        sqlx::query(
            "INSERT INTO \"A101\" (scrape_timestamp, display_name, shop_id, category_id, product_id, \
             price, discount_price, url, scraped_product_id) \
             VALUES ('garbage', 'Bozuk', 1, 1, 1, 1.0, 1.0, 'https://www.a101.com.tr/x', 'x')",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;
        let before = std::fs::read(store.store_path(day(18))).unwrap();

        let err = store
            .merge_shop(day(18), "A101", &[record("10", 4.0)])
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::MalformedRow { .. }), "{err}");
        assert_eq!(std::fs::read(store.store_path(day(18))).unwrap(), before);
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["sepet_data_2026-10-18.db"]);
    }

    #[tokio::test]
    async fn new_day_is_seeded_from_newest_earlier_store() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.merge_shop(day(15), "A101", &[record("old", 1.0)]).await.unwrap();
        store.merge_shop(day(17), "A101", &[record("newer", 2.0)]).await.unwrap();

        let seeded = store.prepare_day(day(18)).await.unwrap();
        assert_eq!(seeded, Some(store.store_path(day(17))));
        assert_eq!(store.prepare_day(day(18)).await.unwrap(), None);

        let rows = store.read_table(day(18), "A101").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].scraped_product_id, "newer");
    }

    #[tokio::test]
    async fn metadata_tables_are_rewritten_wholesale() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let shop = ShopConfig {
            shop_id: 1,
            shop_name: "A101".into(),
            base_url: "https://www.a101.com.tr".into(),
            adapter_reference: "a101".into(),
            enabled: true,
            session_kind: SessionKind::Plain,
            logo: Some("a101.png".into()),
        };
        let entry = CategoryEntry {
            product_id: 1,
            turkish_name: "Süt".into(),
            category_id: 1,
            turkish_category: "Süt Ürünleri".into(),
        };

        store
            .refresh_metadata(day(18), &[shop.clone(), shop.clone()], &[entry.clone()])
            .await
            .unwrap();
        store
            .refresh_metadata(day(18), &[shop], &[entry])
            .await
            .unwrap();

        let tables = store.table_names(day(18)).await.unwrap();
        assert_eq!(tables, [CATEGORIES_METADATA_TABLE, SHOPS_METADATA_TABLE]);

        let pool = open_pool(&store.store_path(day(18)), false).await.unwrap();
        let shops: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM shops_metadata")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(shops, 1);
        pool.close().await;
    }
}
