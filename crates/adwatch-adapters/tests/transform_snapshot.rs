use adwatch_adapters::{leboncoin_adapter, vinted_adapter, MarketplaceAdapter};
use chrono::{TimeZone, Utc};
use serde_json::Value as JsonValue;

fn fixture(name: &str) -> JsonValue {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    let text = std::fs::read_to_string(&path).unwrap();
    serde_json::from_str(&text).unwrap()
}

#[test]
fn leboncoin_search_fixture_transforms() {
    let response = fixture("leboncoin_search.json");
    let adapter = leboncoin_adapter();
    let ads: Vec<_> = response["ads"]
        .as_array()
        .unwrap()
        .iter()
        .map(|raw| adapter.transform_ad(raw))
        .collect();
    assert_eq!(ads.len(), 3);

    let lamp = &ads[0];
    assert_eq!(lamp.marketplace, "leboncoin");
    assert_eq!(lamp.external_id, "2561234567");
    assert_eq!(lamp.title, "Lampe champignon vintage");
    assert_eq!(lamp.price.amount, 45.0);
    assert_eq!(lamp.price.to_string(), "45 EUR");
    assert_eq!(lamp.url, "https://www.leboncoin.fr/ad/luminaires/2561234567");
    assert_eq!(lamp.images.len(), 2);
    assert!(lamp.images[0].ends_with("large-1.jpg"));
    assert_eq!(lamp.location.as_deref(), Some("Lyon (69003)"));
    assert_eq!(
        lamp.published_at,
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap())
    );

    let sconce = &ads[1];
    assert_eq!(sconce.external_id, "2561230000");
    assert_eq!(sconce.price.amount, 120.0);
    assert_eq!(sconce.url, "https://www.leboncoin.fr/ad/2561230000");
    assert_eq!(sconce.images, vec!["https://img.leboncoin.fr/api/v1/lbcpb1/images/bb/thumb.jpg"]);
    assert_eq!(sconce.location.as_deref(), Some("75011"));
    assert_eq!(
        sconce.published_at,
        Some(Utc.with_ymd_and_hms(2024, 2, 28, 7, 0, 0).unwrap())
    );
    assert_eq!(sconce.description, "");

    let unkeyed = &ads[2];
    assert_eq!(unkeyed.external_id, "");
    assert_eq!(unkeyed.url, "");
    assert_eq!(unkeyed.price.amount, 0.0);
}

#[test]
fn vinted_catalog_fixture_transforms() {
    let response = fixture("vinted_catalog.json");
    let adapter = vinted_adapter();
    let ads: Vec<_> = response["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|raw| adapter.transform_ad(raw))
        .collect();
    assert_eq!(ads.len(), 2);

    let shirt = &ads[0];
    assert_eq!(shirt.marketplace, "vinted");
    assert_eq!(shirt.external_id, "4242");
    assert_eq!(shirt.price.amount, 12.5);
    assert_eq!(shirt.price.currency, "EUR");
    assert_eq!(shirt.price.suffix.as_deref(), Some("(14.08 incl. fees)"));
    assert_eq!(shirt.description, "Zara · M · Très bon état");
    assert_eq!(shirt.images, vec!["https://images.vinted.net/t/4242/full.jpeg"]);
    assert_eq!(shirt.url, "https://www.vinted.fr/items/4242-chemise-en-lin");
    assert_eq!(
        shirt.published_at,
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap())
    );

    let jacket = &ads[1];
    assert_eq!(jacket.external_id, "4343");
    assert_eq!(jacket.price.amount, 30.0);
    assert_eq!(jacket.price.suffix, None);
    assert_eq!(jacket.description, "L");
    assert_eq!(jacket.url, "https://www.vinted.fr/items/4343");
    assert!(jacket.images.is_empty());
    assert_eq!(jacket.published_at, None);
}
