//! Core domain model and failure taxonomy for Sepet.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timestamp layout used in per-category files and snapshot tables.
pub const SCRAPE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Header row of every per-category and consolidated file, in column order.
pub const PRODUCT_RECORD_COLUMNS: [&str; 9] = [
    "scrape_timestamp",
    "display_name",
    "shop_id",
    "category_id",
    "product_id",
    "price",
    "discount_price",
    "url",
    "scraped_product_id",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    Plain,
    AntiBot,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Plain => f.write_str("plain"),
            SessionKind::AntiBot => f.write_str("anti_bot"),
        }
    }
}

/// Static per-retailer configuration, loaded once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopConfig {
    pub shop_id: u32,
    pub shop_name: String,
    pub base_url: String,
    pub adapter_reference: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub session_kind: SessionKind,
    #[serde(default)]
    pub logo: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ShopConfig {
    /// Name of this shop's table in the snapshot store.
    pub fn table_name(&self) -> String {
        sanitize_table_name(&self.shop_name)
    }
}

/// One catalog item searched for on every shop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEntry {
    pub product_id: u32,
    pub turkish_name: String,
    pub category_id: u32,
    pub turkish_category: String,
}

/// One normalized price observation for one item at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    #[serde(with = "scrape_timestamp")]
    pub scrape_timestamp: NaiveDateTime,
    pub display_name: String,
    pub shop_id: u32,
    pub category_id: u32,
    pub product_id: u32,
    pub price: f64,
    pub discount_price: f64,
    pub url: String,
    pub scraped_product_id: String,
}

/// Hashable identity over every column of a [`ProductRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExactRowKey {
    scrape_timestamp: NaiveDateTime,
    display_name: String,
    shop_id: u32,
    category_id: u32,
    product_id: u32,
    price_bits: u64,
    discount_price_bits: u64,
    url: String,
    scraped_product_id: String,
}

impl ProductRecord {
    pub fn satisfies_price_invariant(&self) -> bool {
        self.discount_price >= 0.0 && self.price >= self.discount_price
    }

    pub fn exact_key(&self) -> ExactRowKey {
        ExactRowKey {
            scrape_timestamp: self.scrape_timestamp,
            display_name: self.display_name.clone(),
            shop_id: self.shop_id,
            category_id: self.category_id,
            product_id: self.product_id,
            price_bits: normalized_bits(self.price),
            discount_price_bits: normalized_bits(self.discount_price),
            url: self.url.clone(),
            scraped_product_id: self.scraped_product_id.clone(),
        }
    }
}

// -0.0 and 0.0 must collapse to the same row.
fn normalized_bits(value: f64) -> u64 {
    if value == 0.0 {
        0f64.to_bits()
    } else {
        value.to_bits()
    }
}

pub mod scrape_timestamp {
    use chrono::NaiveDateTime;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    use super::SCRAPE_TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(SCRAPE_TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(D::Error::custom)
    }

    /// Accepts the canonical layout and the ISO `T`-separated variant older files carry.
    pub fn parse(raw: &str) -> Result<NaiveDateTime, chrono::ParseError> {
        let raw = raw.trim();
        NaiveDateTime::parse_from_str(raw, SCRAPE_TIMESTAMP_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
    }
}

/// Labelled `(regular, discount)` pair returned by every shop adapter.
///
/// Both values are rounded to two decimals and always satisfy
/// `regular >= discount >= 0`; without a promotion they are equal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePair {
    pub regular: f64,
    pub discount: f64,
}

impl PricePair {
    pub const ZERO: PricePair = PricePair {
        regular: 0.0,
        discount: 0.0,
    };

    pub fn regular_only(price: f64) -> Self {
        let price = clean_amount(price);
        Self {
            regular: price,
            discount: price,
        }
    }

    /// A promoted price. A pair handed over in the wrong order is swapped
    /// so the larger amount is always the regular price.
    pub fn promoted(regular: f64, discount: f64) -> Self {
        let regular = clean_amount(regular);
        let discount = clean_amount(discount);
        if discount == 0.0 {
            return Self::regular_only(regular);
        }
        if regular == 0.0 {
            return Self::regular_only(discount);
        }
        Self {
            regular: regular.max(discount),
            discount: regular.min(discount),
        }
    }

    pub fn has_promotion(&self) -> bool {
        self.discount < self.regular
    }

    pub fn is_zero(&self) -> bool {
        self.regular == 0.0 && self.discount == 0.0
    }
}

fn clean_amount(value: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    (value * 100.0).round() / 100.0
}

/// Snapshot-store table name for a shop: every character outside `[A-Za-z0-9_]` becomes `_`.
pub fn sanitize_table_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

pub fn day_stamp(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// How far a failure reaches before the pipeline skips and continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureScope {
    Record,
    Category,
    Shop,
    Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SessionInit,
    PageLoadTimeout,
    Extraction,
    Persist,
    ConsolidationIo,
    Merge,
    ConfigMissing,
}

impl FailureKind {
    pub fn scope(self) -> FailureScope {
        match self {
            FailureKind::Extraction => FailureScope::Record,
            FailureKind::PageLoadTimeout | FailureKind::Persist => FailureScope::Category,
            FailureKind::SessionInit | FailureKind::ConsolidationIo | FailureKind::Merge => {
                FailureScope::Shop
            }
            FailureKind::ConfigMissing => FailureScope::Process,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("session init failed for shop {shop}: {reason}")]
    SessionInit { shop: String, reason: String },
    #[error("page load timed out for {shop}/{category} after {waited_secs}s")]
    PageLoadTimeout {
        shop: String,
        category: String,
        waited_secs: u64,
    },
    #[error("extraction failed for {shop}/{category}: {reason}")]
    Extraction {
        shop: String,
        category: String,
        reason: String,
    },
    #[error("writing category file failed for {shop}/{category}: {reason}")]
    Persist {
        shop: String,
        category: String,
        reason: String,
    },
    #[error("consolidation io failed for {shop}: {reason}")]
    ConsolidationIo { shop: String, reason: String },
    #[error("snapshot merge failed for {shop}: {reason}")]
    Merge { shop: String, reason: String },
    #[error("configuration missing: {path}")]
    ConfigMissing { path: String },
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::SessionInit { .. } => FailureKind::SessionInit,
            PipelineError::PageLoadTimeout { .. } => FailureKind::PageLoadTimeout,
            PipelineError::Extraction { .. } => FailureKind::Extraction,
            PipelineError::Persist { .. } => FailureKind::Persist,
            PipelineError::ConsolidationIo { .. } => FailureKind::ConsolidationIo,
            PipelineError::Merge { .. } => FailureKind::Merge,
            PipelineError::ConfigMissing { .. } => FailureKind::ConfigMissing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> NaiveDateTime {
        scrape_timestamp::parse("2026-10-18 14:05:09").unwrap()
    }

    #[test]
    fn promoted_pair_keeps_regular_above_discount() {
        let pair = PricePair::promoted(294.95, 219.95);
        assert_eq!(pair.regular, 294.95);
        assert_eq!(pair.discount, 219.95);
        assert!(pair.has_promotion());

        let swapped = PricePair::promoted(219.95, 294.95);
        assert_eq!(swapped, pair);
    }

    #[test]
    fn missing_discount_collapses_to_regular_price() {
        let pair = PricePair::promoted(33.0, 0.0);
        assert_eq!(pair, PricePair::regular_only(33.0));
        assert!(!pair.has_promotion());

        let rounded = PricePair::regular_only(12.345_6);
        assert_eq!(rounded.regular, 12.35);
        assert_eq!(PricePair::regular_only(f64::NAN), PricePair::ZERO);
    }

    #[test]
    fn table_names_are_sanitized() {
        assert_eq!(sanitize_table_name("A101"), "A101");
        assert_eq!(sanitize_table_name("Onur Market"), "Onur_Market");
        assert_eq!(sanitize_table_name("Çağrı-Market"), "_a_r__Market");
    }

    #[test]
    fn exact_key_ignores_signed_zero() {
        let a = ProductRecord {
            scrape_timestamp: ts(),
            display_name: "Pirinç 1 kg".into(),
            shop_id: 1,
            category_id: 3,
            product_id: 7,
            price: 0.0,
            discount_price: 0.0,
            url: "/pirinc-p-1".into(),
            scraped_product_id: "1".into(),
        };
        let mut b = a.clone();
        b.price = -0.0;
        assert_eq!(a.exact_key(), b.exact_key());
        b.display_name.push('!');
        assert_ne!(a.exact_key(), b.exact_key());
    }

    #[test]
    fn timestamp_accepts_iso_variant() {
        let parsed = scrape_timestamp::parse("2026-10-18T14:05:09.123").unwrap();
        assert_eq!(parsed.format(SCRAPE_TIMESTAMP_FORMAT).to_string(), "2026-10-18 14:05:09");
    }

    #[test]
    fn shop_config_defaults() {
        let shop: ShopConfig = serde_json::from_str(
            r#"{"shop_id": 4, "shop_name": "Onurmarket", "base_url": "https://www.onurmarket.com",
                "adapter_reference": "onurmarket", "session_kind": "anti_bot"}"#,
        )
        .unwrap();
        assert!(shop.enabled);
        assert_eq!(shop.session_kind, SessionKind::AntiBot);
        assert_eq!(shop.table_name(), "Onurmarket");
    }

    #[test]
    fn failure_kinds_map_to_scopes() {
        assert_eq!(FailureKind::Extraction.scope(), FailureScope::Record);
        assert_eq!(FailureKind::PageLoadTimeout.scope(), FailureScope::Category);
        assert_eq!(FailureKind::Persist.scope(), FailureScope::Category);
        assert_eq!(FailureKind::Merge.scope(), FailureScope::Shop);
        let err = PipelineError::ConfigMissing {
            path: "configs/shops.yaml".into(),
        };
        assert_eq!(err.kind().scope(), FailureScope::Process);
    }
}
