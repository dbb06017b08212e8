use std::time::Duration;

use scraper::{ElementRef, Html};
use sepet_core::{CategoryEntry, PricePair, ShopConfig};
use tracing::{debug, warn};

use crate::{
    absolute_url, element_text, find_turkish_amounts, id_after_marker, parse_turkish_amount,
    search_url, select_all, select_first, select_first_attr, select_first_text, AdapterError,
    Pagination, ParsedItem, RawProduct, SearchRequest, ShopAdapter,
};

fn unparseable(adapter: &'static str, fragment: &str) -> PricePair {
    let preview: String = fragment.chars().take(120).collect();
    warn!(adapter, fragment = %preview, "unparseable price fragment");
    PricePair::ZERO
}

/// Current price plus an optional struck-through regular price.
fn labelled(adapter: &'static str, fragment: &str, current: Option<f64>, regular: Option<f64>) -> PricePair {
    match (current, regular) {
        (Some(current), Some(regular)) => PricePair::promoted(regular, current),
        (Some(current), None) => PricePair::regular_only(current),
        (None, _) => unparseable(adapter, fragment),
    }
}

fn missing(what: &str) -> AdapterError {
    AdapterError::Missing(what.to_string())
}

fn tiles<'a>(
    document: &'a Html,
    selector: &str,
    mut parse: impl FnMut(ElementRef<'a>) -> Result<Option<RawProduct>, AdapterError>,
) -> Result<Vec<ParsedItem>, AdapterError> {
    Ok(select_all(document.root_element(), selector)?
        .into_iter()
        .filter_map(|tile| parse(tile).transpose())
        .collect())
}

fn amount_in(scope: ElementRef<'_>, selector: &str) -> Option<f64> {
    select_first_text(scope, selector)
        .ok()
        .flatten()
        .and_then(|text| parse_turkish_amount(&text))
}

// ---------------------------------------------------------------------------

/// a101.com.tr: infinite scroll over `article` tiles, prices inside a `section`
/// with an optional `line-through` span.
#[derive(Debug, Clone)]
pub struct A101Adapter {
    base_url: String,
}

impl A101Adapter {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn boxed(shop: &ShopConfig) -> Box<dyn ShopAdapter> {
        Box::new(Self::new(&shop.base_url))
    }

    fn parse_tile(&self, tile: ElementRef<'_>) -> Result<Option<RawProduct>, AdapterError> {
        let link = select_first(tile, "a[href]")?.ok_or_else(|| missing("a101 tile link"))?;
        let href = link.value().attr("href").unwrap_or_default();
        let url = absolute_url(&self.base_url, href)?;
        if !url.starts_with(&self.base_url) {
            debug!(%url, "skipping off-site tile");
            return Ok(None);
        }

        let display_name = link
            .value()
            .attr("title")
            .and_then(crate::text_or_none)
            .or_else(|| element_text(link))
            .ok_or_else(|| missing("a101 tile title"))?;

        let price_section = select_all(tile, "section")?
            .into_iter()
            .find(|section| section.text().any(|t| t.contains('₺')))
            .ok_or_else(|| missing("a101 price section"))?;

        Ok(Some(RawProduct {
            display_name,
            price_fragment: price_section.html(),
            url,
            item_id: None,
        }))
    }
}

impl ShopAdapter for A101Adapter {
    fn key(&self) -> &'static str {
        "a101"
    }

    fn build_search_request(&self, category: &CategoryEntry) -> Result<SearchRequest, AdapterError> {
        let url = search_url(&self.base_url, "/arama", |u| {
            u.query_pairs_mut()
                .append_pair("k", &category.turkish_name)
                .append_pair("kurumsal", "1");
        })?;
        Ok(SearchRequest {
            url,
            ready_selector: "article".into(),
            item_selector: "article".into(),
            pagination: Pagination::ScrollUntilStable,
            ready_timeout: Duration::from_secs(10),
        })
    }

    fn parse_page(&self, content: &str) -> Result<Vec<ParsedItem>, AdapterError> {
        let document = Html::parse_document(content);
        tiles(&document, "article", |tile| self.parse_tile(tile))
    }

    fn parse_price(&self, fragment: &str) -> PricePair {
        let html = Html::parse_fragment(fragment);
        let root = html.root_element();
        let regular = amount_in(root, "span.line-through");
        let current = select_all(root, "span")
            .unwrap_or_default()
            .into_iter()
            .filter(|span| !span.value().classes().any(|c| c == "line-through"))
            .filter_map(element_text)
            .find_map(|text| parse_turkish_amount(&text));
        labelled(self.key(), fragment, current, regular)
    }
}

// ---------------------------------------------------------------------------

/// macrocenter.com.tr: Angular product cards, loyalty price in `fe-money-discount-label`.
#[derive(Debug, Clone)]
pub struct MacrocenterAdapter {
    base_url: String,
}

impl MacrocenterAdapter {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn boxed(shop: &ShopConfig) -> Box<dyn ShopAdapter> {
        Box::new(Self::new(&shop.base_url))
    }

    fn parse_tile(&self, tile: ElementRef<'_>) -> Result<Option<RawProduct>, AdapterError> {
        let link = select_first(tile, "a.text-decoration-ellipsis")?
            .ok_or_else(|| missing("macrocenter product link"))?;
        let display_name = element_text(link).ok_or_else(|| missing("macrocenter product name"))?;
        let href = link
            .value()
            .attr("href")
            .ok_or_else(|| missing("macrocenter product href"))?;

        Ok(Some(RawProduct {
            display_name,
            price_fragment: tile.html(),
            url: absolute_url(&self.base_url, href)?,
            item_id: None,
        }))
    }
}

impl ShopAdapter for MacrocenterAdapter {
    fn key(&self) -> &'static str {
        "macrocenter"
    }

    fn build_search_request(&self, category: &CategoryEntry) -> Result<SearchRequest, AdapterError> {
        let url = search_url(&self.base_url, "/arama", |u| {
            u.query_pairs_mut().append_pair("q", &category.turkish_name);
        })?;
        Ok(SearchRequest {
            url,
            ready_selector: "fe-product-list".into(),
            item_selector: "fe-product-card".into(),
            pagination: Pagination::ScrollUntilStable,
            ready_timeout: Duration::from_secs(15),
        })
    }

    fn parse_page(&self, content: &str) -> Result<Vec<ParsedItem>, AdapterError> {
        let document = Html::parse_document(content);
        tiles(&document, "fe-product-card", |tile| self.parse_tile(tile))
    }

    fn parse_price(&self, fragment: &str) -> PricePair {
        let html = Html::parse_fragment(fragment);
        let root = html.root_element();
        let regular = amount_in(root, "fe-product-price");
        let loyalty = amount_in(root, "fe-money-discount-label div.price-content");
        match (regular, loyalty) {
            (Some(regular), Some(loyalty)) => PricePair::promoted(regular, loyalty),
            (Some(regular), None) => PricePair::regular_only(regular),
            (None, _) => unparseable(self.key(), fragment),
        }
    }

    fn scraped_id_from_url(&self, url: &str) -> Option<String> {
        id_after_marker(url, "-")
    }
}

// ---------------------------------------------------------------------------

const MIGROS_LOYALTY_LABEL: &str = "Money ile";

/// migros.com.tr: paginated with a next button; prices arrive as one text run
/// such as `294,95 TLMoney ile219,95 TL`.
#[derive(Debug, Clone)]
pub struct MigrosAdapter {
    base_url: String,
}

impl MigrosAdapter {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn boxed(shop: &ShopConfig) -> Box<dyn ShopAdapter> {
        Box::new(Self::new(&shop.base_url))
    }

    fn parse_tile(&self, tile: ElementRef<'_>) -> Result<Option<RawProduct>, AdapterError> {
        let link = select_first(tile, "#product-name")?.ok_or_else(|| missing("migros product name"))?;
        let display_name = element_text(link).ok_or_else(|| missing("migros product name text"))?;
        let href = link
            .value()
            .attr("href")
            .ok_or_else(|| missing("migros product href"))?;
        let price_fragment = select_first_text(tile, "div.price-container")?
            .ok_or_else(|| missing("migros price container"))?;

        Ok(Some(RawProduct {
            display_name,
            price_fragment,
            url: absolute_url(&self.base_url, href)?,
            item_id: None,
        }))
    }
}

impl ShopAdapter for MigrosAdapter {
    fn key(&self) -> &'static str {
        "migros"
    }

    fn build_search_request(&self, category: &CategoryEntry) -> Result<SearchRequest, AdapterError> {
        let url = search_url(&self.base_url, "/arama", |u| {
            u.query_pairs_mut().append_pair("q", &category.turkish_name);
        })?;
        Ok(SearchRequest {
            url,
            ready_selector: "fe-product-price".into(),
            item_selector: "mat-card".into(),
            pagination: Pagination::ClickNextUntilAbsent {
                next_selector: "#pagination-button-next".into(),
            },
            ready_timeout: Duration::from_secs(20),
        })
    }

    fn parse_page(&self, content: &str) -> Result<Vec<ParsedItem>, AdapterError> {
        let document = Html::parse_document(content);
        tiles(&document, "mat-card", |tile| self.parse_tile(tile))
    }

    /// The shelf price is the last amount before the `Money ile` label, the
    /// loyalty price the first amount after it.
    fn parse_price(&self, fragment: &str) -> PricePair {
        let cleaned = fragment.replace("İyi Fiyat", "");
        let (shelf, loyalty) = match cleaned.split_once(MIGROS_LOYALTY_LABEL) {
            Some((shelf, loyalty)) => (shelf, Some(loyalty)),
            None => (cleaned.as_str(), None),
        };
        let Some(regular) = find_turkish_amounts(shelf).last().copied() else {
            return unparseable(self.key(), fragment);
        };
        match loyalty.and_then(|text| find_turkish_amounts(text).first().copied()) {
            Some(discount) => PricePair::promoted(regular, discount),
            None => PricePair::regular_only(regular),
        }
    }
}

// ---------------------------------------------------------------------------

/// carrefoursa.com: the first results page carries everything; the current
/// price sits in a machine-readable `content` attribute.
#[derive(Debug, Clone)]
pub struct CarrefoursaAdapter {
    base_url: String,
}

impl CarrefoursaAdapter {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn boxed(shop: &ShopConfig) -> Box<dyn ShopAdapter> {
        Box::new(Self::new(&shop.base_url))
    }

    fn parse_tile(&self, tile: ElementRef<'_>) -> Result<Option<RawProduct>, AdapterError> {
        if select_first(tile, "div.advice")?.is_some() {
            debug!("skipping advice tile");
            return Ok(None);
        }
        let name = select_first(tile, "h3.item-name")?.ok_or_else(|| missing("carrefoursa item name"))?;
        let display_name = element_text(name).ok_or_else(|| missing("carrefoursa item name text"))?;
        let item_id = name.value().attr("content").and_then(crate::text_or_none);
        let href = select_first_attr(tile, "a.product-return", "href")?
            .ok_or_else(|| missing("carrefoursa product link"))?;
        let price = select_first(tile, "div.item-price-contain")?
            .ok_or_else(|| missing("carrefoursa price block"))?;

        Ok(Some(RawProduct {
            display_name,
            price_fragment: price.html(),
            url: absolute_url(&self.base_url, &href)?,
            item_id,
        }))
    }
}

impl ShopAdapter for CarrefoursaAdapter {
    fn key(&self) -> &'static str {
        "carrefoursa"
    }

    fn build_search_request(&self, category: &CategoryEntry) -> Result<SearchRequest, AdapterError> {
        let url = search_url(&self.base_url, "/search", |u| {
            u.query_pairs_mut()
                .append_pair("q", &format!("{}:relevance", category.turkish_name))
                .append_pair("page", "1");
        })?;
        Ok(SearchRequest {
            url,
            ready_selector: ".product-listing-item".into(),
            item_selector: "div.product-card".into(),
            pagination: Pagination::SinglePage,
            ready_timeout: Duration::from_secs(10),
        })
    }

    fn parse_page(&self, content: &str) -> Result<Vec<ParsedItem>, AdapterError> {
        let document = Html::parse_document(content);
        tiles(&document, "div.product-card", |tile| self.parse_tile(tile))
    }

    fn parse_price(&self, fragment: &str) -> PricePair {
        let html = Html::parse_fragment(fragment);
        let root = html.root_element();
        let current = select_first_attr(root, "span.item-price", "content")
            .ok()
            .flatten()
            .and_then(|raw| raw.parse::<f64>().ok())
            .or_else(|| amount_in(root, "span.item-price"));
        let regular = amount_in(root, "span.priceLineThrough");
        labelled(self.key(), fragment, current, regular)
    }
}

// ---------------------------------------------------------------------------

/// onurmarket.com: served through the unlocking proxy; tiles carry a `data-id`.
#[derive(Debug, Clone)]
pub struct OnurmarketAdapter {
    base_url: String,
}

impl OnurmarketAdapter {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn boxed(shop: &ShopConfig) -> Box<dyn ShopAdapter> {
        Box::new(Self::new(&shop.base_url))
    }

    fn parse_tile(&self, tile: ElementRef<'_>) -> Result<Option<RawProduct>, AdapterError> {
        let display_name = select_first_text(tile, "div.productName")?
            .ok_or_else(|| missing("onurmarket product name"))?;
        let link = select_first(tile, "a.detailUrl")?.ok_or_else(|| missing("onurmarket detail link"))?;
        let href = link
            .value()
            .attr("href")
            .ok_or_else(|| missing("onurmarket detail href"))?;
        let price = select_first(tile, "div.productPrice")?
            .ok_or_else(|| missing("onurmarket price block"))?;

        Ok(Some(RawProduct {
            display_name,
            price_fragment: price.html(),
            url: absolute_url(&self.base_url, href)?,
            item_id: link.value().attr("data-id").and_then(crate::text_or_none),
        }))
    }
}

impl ShopAdapter for OnurmarketAdapter {
    fn key(&self) -> &'static str {
        "onurmarket"
    }

    fn build_search_request(&self, category: &CategoryEntry) -> Result<SearchRequest, AdapterError> {
        let keyword: String = url::form_urlencoded::byte_serialize(category.turkish_name.as_bytes()).collect();
        let url = search_url(&self.base_url, "/Arama", |u| {
            u.set_query(Some(&format!("1&kelime={keyword}")));
        })?;
        Ok(SearchRequest {
            url,
            ready_selector: "#ProductPageProductList, div.productItem".into(),
            item_selector: "div.productItem".into(),
            pagination: Pagination::SinglePage,
            ready_timeout: Duration::from_secs(15),
        })
    }

    fn parse_page(&self, content: &str) -> Result<Vec<ParsedItem>, AdapterError> {
        let document = Html::parse_document(content);
        tiles(&document, "div.productItem", |tile| self.parse_tile(tile))
    }

    fn parse_price(&self, fragment: &str) -> PricePair {
        let html = Html::parse_fragment(fragment);
        let root = html.root_element();
        let current = amount_in(root, "span.discountPriceSpan");
        let regular = amount_in(root, "span.regularPriceSpan");
        labelled(self.key(), fragment, current, regular)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(shop: &str) -> String {
        let path = workspace_root().join("fixtures").join(shop).join("search.html");
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn category(name: &str) -> CategoryEntry {
        CategoryEntry {
            product_id: 1,
            turkish_name: name.into(),
            category_id: 1,
            turkish_category: "Süt Ürünleri".into(),
        }
    }

    #[test]
    fn a101_parses_promoted_and_regular_tiles_and_drops_off_site_links() {
        let adapter = A101Adapter::new("https://www.a101.com.tr");
        let items = adapter.parse_page(&fixture("a101")).unwrap();
        let items: Vec<_> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].display_name, "Sütaş Yarım Yağlı Süt 1 L");
        assert_eq!(
            adapter.scraped_id_from_url(&items[0].url).as_deref(),
            Some("27001234")
        );
        assert_eq!(adapter.parse_price(&items[0].price_fragment), PricePair::promoted(42.5, 37.75));
        assert_eq!(adapter.parse_price(&items[1].price_fragment), PricePair::regular_only(1234.5));
    }

    #[test]
    fn a101_search_request_scrolls() {
        let adapter = A101Adapter::new("https://www.a101.com.tr/");
        let req = adapter.build_search_request(&category("Süt")).unwrap();
        assert_eq!(req.url, "https://www.a101.com.tr/arama?k=S%C3%BCt&kurumsal=1");
        assert_eq!(req.pagination, Pagination::ScrollUntilStable);
        assert_eq!(req.ready_timeout, Duration::from_secs(10));
    }

    #[test]
    fn macrocenter_reads_loyalty_label_and_dash_ids() {
        let adapter = MacrocenterAdapter::new("https://www.macrocenter.com.tr");
        let items: Vec<_> = adapter
            .parse_page(&fixture("macrocenter"))
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].url, "https://www.macrocenter.com.tr/baldo-pirinc-1-kg-p-2f1a9");
        assert_eq!(adapter.scraped_id_from_url(&items[0].url).as_deref(), Some("2f1a9"));
        assert_eq!(adapter.parse_price(&items[0].price_fragment), PricePair::promoted(89.95, 79.95));
        assert_eq!(adapter.parse_price(&items[1].price_fragment), PricePair::regular_only(112.0));
    }

    #[test]
    fn migros_price_text_variants() {
        let adapter = MigrosAdapter::new("https://www.migros.com.tr");
        assert_eq!(
            adapter.parse_price(" 294,95 TLMoney ile219,95 TL"),
            PricePair::promoted(294.95, 219.95)
        );
        assert_eq!(adapter.parse_price("İyi Fiyat 1.049,90 TL"), PricePair::regular_only(1049.9));
        assert_eq!(adapter.parse_price("Tükendi"), PricePair::ZERO);
        assert_eq!(
            adapter.parse_price("2 Al 1 Öde 294,95 TL Money ile 219,95 TL 3 adet"),
            PricePair::promoted(294.95, 219.95)
        );
        assert_eq!(
            adapter.parse_price("%10 indirim 149,50 TL"),
            PricePair::regular_only(149.5)
        );
        assert_eq!(adapter.parse_price("89,90 TL Money ile"), PricePair::regular_only(89.9));
    }

    #[test]
    fn migros_page_reports_malformed_tile_without_failing_page() {
        let adapter = MigrosAdapter::new("https://www.migros.com.tr");
        let items = adapter.parse_page(&fixture("migros")).unwrap();
        assert_eq!(items.len(), 3);
        assert!(items[2].is_err());
        let first = items[0].as_ref().unwrap();
        assert_eq!(first.url, "https://www.migros.com.tr/pinar-sucuk-250-g-p-1b9e4");
        assert_eq!(adapter.parse_price(&first.price_fragment), PricePair::promoted(294.95, 219.95));
        assert!(matches!(
            adapter.build_search_request(&category("Sucuk")).unwrap().pagination,
            Pagination::ClickNextUntilAbsent { .. }
        ));
    }

    #[test]
    fn carrefoursa_skips_advice_and_reads_content_attribute() {
        let adapter = CarrefoursaAdapter::new("https://www.carrefoursa.com");
        let items: Vec<_> = adapter
            .parse_page(&fixture("carrefoursa"))
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_id.as_deref(), Some("30234567"));
        assert_eq!(items[0].url, "https://www.carrefoursa.com/zeytinyagi-1-l/p/30234567");
        assert_eq!(adapter.parse_price(&items[0].price_fragment), PricePair::promoted(899.9, 849.9));
        assert_eq!(adapter.parse_price(&items[1].price_fragment), PricePair::regular_only(64.5));

        let req = adapter.build_search_request(&category("Zeytin Yağı")).unwrap();
        assert_eq!(
            req.url,
            "https://www.carrefoursa.com/search?q=Zeytin+Ya%C4%9F%C4%B1%3Arelevance&page=1"
        );
    }

    #[test]
    fn onurmarket_uses_data_id_and_proxy_friendly_url() {
        let adapter = OnurmarketAdapter::new("https://www.onurmarket.com");
        let items: Vec<_> = adapter
            .parse_page(&fixture("onurmarket"))
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_id.as_deref(), Some("10452"));
        assert_eq!(adapter.parse_price(&items[0].price_fragment), PricePair::promoted(180.0, 108.0));
        assert_eq!(adapter.parse_price(&items[1].price_fragment), PricePair::regular_only(54.9));

        let req = adapter.build_search_request(&category("Süt Tozu")).unwrap();
        assert_eq!(req.url, "https://www.onurmarket.com/Arama?1&kelime=S%C3%BCt+Tozu");
    }
}
