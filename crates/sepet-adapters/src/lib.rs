//! Shop adapter contract, the static adapter registry and shared page helpers.

use std::collections::BTreeMap;
use std::time::Duration;

use scraper::{ElementRef, Selector};
use sepet_core::{CategoryEntry, PricePair, ShopConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

mod shops;

pub use shops::{
    A101Adapter, CarrefoursaAdapter, MacrocenterAdapter, MigrosAdapter, OnurmarketAdapter,
};

/// How the page loader reaches the full result set of one search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Pagination {
    ScrollUntilStable,
    ClickNextUntilAbsent { next_selector: String },
    SinglePage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub url: String,
    /// Must match at least once before `ready_timeout` or the category is skipped.
    pub ready_selector: String,
    /// Counted between scrolls.
    pub item_selector: String,
    pub pagination: Pagination,
    pub ready_timeout: Duration,
}

/// Field strings lifted from one result tile, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProduct {
    pub display_name: String,
    /// Whatever the adapter's `parse_price` understands: tile text or the price markup.
    pub price_fragment: String,
    pub url: String,
    pub item_id: Option<String>,
}

pub type ParsedItem = Result<RawProduct, AdapterError>;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("missing {0}")]
    Missing(String),
    #[error("invalid url {url:?}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("no adapter registered for {0:?}")]
    UnknownAdapter(String),
}

/// Page-structure knowledge for exactly one retailer.
pub trait ShopAdapter: Send + Sync {
    fn key(&self) -> &'static str;

    fn build_search_request(&self, category: &CategoryEntry) -> Result<SearchRequest, AdapterError>;

    /// One entry per result tile; a malformed tile is an `Err` entry, not a page failure.
    fn parse_page(&self, content: &str) -> Result<Vec<ParsedItem>, AdapterError>;

    /// Malformed fragments yield [`PricePair::ZERO`] and a warning.
    fn parse_price(&self, fragment: &str) -> PricePair;

    /// Item id recovered from a product URL when the tile carries none.
    fn scraped_id_from_url(&self, url: &str) -> Option<String> {
        id_after_marker(url, "p-")
    }
}

pub type AdapterConstructor = fn(&ShopConfig) -> Box<dyn ShopAdapter>;

/// Adapter key (`ShopConfig::adapter_reference`) to constructor.
#[derive(Clone)]
pub struct AdapterRegistry {
    constructors: BTreeMap<&'static str, AdapterConstructor>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("a101", A101Adapter::boxed);
        registry.register("carrefoursa", CarrefoursaAdapter::boxed);
        registry.register("macrocenter", MacrocenterAdapter::boxed);
        registry.register("migros", MigrosAdapter::boxed);
        registry.register("onurmarket", OnurmarketAdapter::boxed);
        registry
    }

    pub fn register(&mut self, key: &'static str, constructor: AdapterConstructor) {
        self.constructors.insert(key, constructor);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.constructors.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }

    pub fn create(&self, shop: &ShopConfig) -> Result<Box<dyn ShopAdapter>, AdapterError> {
        self.constructors
            .get(shop.adapter_reference.as_str())
            .map(|constructor| constructor(shop))
            .ok_or_else(|| AdapterError::UnknownAdapter(shop.adapter_reference.clone()))
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

pub fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

pub fn select_all<'a>(scope: ElementRef<'a>, selector: &str) -> Result<Vec<ElementRef<'a>>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(scope.select(&sel).collect())
}

pub fn select_first<'a>(scope: ElementRef<'a>, selector: &str) -> Result<Option<ElementRef<'a>>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(scope.select(&sel).next())
}

pub fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<String>())
}

pub fn select_first_text(scope: ElementRef<'_>, selector: &str) -> Result<Option<String>, AdapterError> {
    Ok(select_first(scope, selector)?.and_then(element_text))
}

pub fn select_first_attr(
    scope: ElementRef<'_>,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    Ok(select_first(scope, selector)?
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none))
}

/// Parse one Turkish-formatted amount: `₺1.234,56`, `294,95 TL`, `33,00`.
///
/// Dots are thousands separators and the comma is the decimal mark.
pub fn parse_turkish_amount(text: &str) -> Option<f64> {
    let digits: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    let digits = digits.trim_matches(|c| c == ',' || c == '.');
    if digits.is_empty() {
        return None;
    }
    digits.replace('.', "").replace(',', ".").parse::<f64>().ok()
}

/// Every Turkish-formatted amount in `text`, in order of appearance.
pub fn find_turkish_amounts(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() || ((ch == ',' || ch == '.') && !current.is_empty()) {
            current.push(ch);
            continue;
        }
        if !current.is_empty() {
            if let Some(amount) = parse_turkish_amount(&current) {
                out.push(amount);
            }
            current.clear();
        }
    }
    out
}

/// Resolve `href` against the shop's base URL.
pub fn absolute_url(base_url: &str, href: &str) -> Result<String, AdapterError> {
    let base = Url::parse(base_url).map_err(|source| AdapterError::Url {
        url: base_url.to_string(),
        source,
    })?;
    base.join(href.trim())
        .map(String::from)
        .map_err(|source| AdapterError::Url {
            url: href.to_string(),
            source,
        })
}

/// Build `<base_url><path>` and let `query` fill the query string.
pub fn search_url(
    base_url: &str,
    path: &str,
    query: impl FnOnce(&mut Url),
) -> Result<String, AdapterError> {
    let mut url = Url::parse(base_url)
        .and_then(|base| base.join(path))
        .map_err(|source| AdapterError::Url {
            url: format!("{base_url}{path}"),
            source,
        })?;
    query(&mut url);
    Ok(url.into())
}

/// The text after the last `marker` in `url`, without query, fragment or trailing slash.
pub fn id_after_marker(url: &str, marker: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.trim_end_matches('/');
    let (_, id) = path.rsplit_once(marker)?;
    text_or_none(id)
}
