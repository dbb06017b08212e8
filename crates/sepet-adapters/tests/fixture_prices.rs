// Every registered adapter must parse its captured search page into prices
// that respect regular >= discount >= 0.

use std::path::Path;

use sepet_adapters::AdapterRegistry;
use sepet_core::{SessionKind, ShopConfig};

const SHOPS: [(&str, &str); 5] = [
    ("a101", "https://www.a101.com.tr"),
    ("carrefoursa", "https://www.carrefoursa.com"),
    ("macrocenter", "https://www.macrocenter.com.tr"),
    ("migros", "https://www.migros.com.tr"),
    ("onurmarket", "https://www.onurmarket.com"),
];

#[test]
fn every_fixture_yields_valid_price_pairs() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let registry = AdapterRegistry::builtin();

    for (index, (key, base_url)) in SHOPS.iter().enumerate() {
        let shop = ShopConfig {
            shop_id: index as u32 + 1,
            shop_name: key.to_string(),
            base_url: base_url.to_string(),
            adapter_reference: key.to_string(),
            enabled: true,
            session_kind: SessionKind::Plain,
            logo: None,
        };
        let adapter = registry.create(&shop).expect("registered adapter");
        let html = std::fs::read_to_string(root.join("fixtures").join(key).join("search.html"))
            .expect("fixture present");

        let parsed: Vec<_> = adapter
            .parse_page(&html)
            .expect("page parses")
            .into_iter()
            .filter_map(Result::ok)
            .collect();
        assert!(!parsed.is_empty(), "{key} fixture produced no items");

        for item in parsed {
            let pair = adapter.parse_price(&item.price_fragment);
            assert!(pair.regular > 0.0, "{key}: {} has no price", item.display_name);
            assert!(pair.regular >= pair.discount && pair.discount >= 0.0);
            let id = item
                .item_id
                .clone()
                .or_else(|| adapter.scraped_id_from_url(&item.url));
            assert!(id.is_some(), "{key}: no id for {}", item.url);
        }
    }
}
