//! Marketplace adapter contract, concrete marketplace adapters and the retrying search entry point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use adwatch_core::{Ad, FilterMap, Price};
use adwatch_storage::{retry_with_backoff, BackoffPolicy, FetchError, HttpFetcher, Retryable};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "adwatch-adapters";

/// Per-marketplace knobs read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketplaceConfig {
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
    pub limit: u32,
    pub sort: SortOrder,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 1000,
            timeout_ms: 15_000,
            limit: 35,
            sort: SortOrder::Newest,
        }
    }
}

impl MarketplaceConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
            .with_attempt_timeout(Some(Duration::from_millis(self.timeout_ms.max(1))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Newest,
    PriceAsc,
    PriceDesc,
    Relevance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub text: String,
    /// Adapter defaults already merged with the query's own filters.
    pub settings: FilterMap,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub ads: Vec<Ad>,
    pub has_more: bool,
    pub total_count: Option<u64>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Network level failure; retried by [`search_with_retry`].
    #[error("transport error: {0}")]
    Transport(String),
    #[error("marketplace rejected the request (status {status:?}): {message}")]
    Upstream { status: Option<u16>, message: String },
    #[error("invalid settings: {0}")]
    Validation(String),
}

impl AdapterError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl Retryable for AdapterError {
    fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Transport(_))
    }

    fn timed_out(after: Duration) -> Self {
        AdapterError::Transport(format!("search timed out after {}ms", after.as_millis()))
    }
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        if err.is_retryable() {
            return AdapterError::Transport(err.to_string());
        }
        match err {
            FetchError::HttpStatus { status, url, body } => AdapterError::Upstream {
                status: Some(status),
                message: if body.is_empty() {
                    url
                } else {
                    format!("{url}: {body}")
                },
            },
            other => AdapterError::Upstream {
                status: other.status(),
                message: other.to_string(),
            },
        }
    }
}

#[async_trait]
pub trait MarketplaceAdapter: Send + Sync {
    fn marketplace_id(&self) -> &'static str;
    fn display_name(&self) -> &'static str;

    /// Filter values applied when a query does not set them.
    fn default_settings(&self) -> FilterMap;

    fn validate_settings(&self, settings: &FilterMap) -> Result<(), AdapterError>;

    /// Exactly one outbound request: one call, one page.
    async fn search(
        &self,
        http: &HttpFetcher,
        request: &SearchRequest,
        config: &MarketplaceConfig,
    ) -> Result<SearchPage, AdapterError>;

    /// Total: unknown or missing fields degrade to defaults.
    fn transform_ad(&self, raw: &JsonValue) -> Ad;
}

/// Defaults overlaid with the query's own filters.
pub fn merge_settings(adapter: &dyn MarketplaceAdapter, filters: &FilterMap) -> FilterMap {
    let mut settings = adapter.default_settings();
    for (key, value) in filters {
        settings.insert(key.clone(), value.clone());
    }
    settings
}

/// Validates settings, then runs one search through the shared backoff policy.
pub async fn search_with_retry(
    adapter: &dyn MarketplaceAdapter,
    http: &HttpFetcher,
    request: &SearchRequest,
    config: &MarketplaceConfig,
) -> Result<SearchPage, AdapterError> {
    adapter.validate_settings(&request.settings)?;
    let policy = config.backoff_policy();
    let operation = format!("{} search \"{}\"", adapter.marketplace_id(), request.text);
    let page = retry_with_backoff(&policy, &operation, |attempt| {
        debug!(marketplace = adapter.marketplace_id(), attempt, "searching");
        adapter.search(http, request, config)
    })
    .await?;
    debug!(
        marketplace = adapter.marketplace_id(),
        ads = page.ads.len(),
        has_more = page.has_more,
        "search finished"
    );
    Ok(page)
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn MarketplaceAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("marketplaces", &self.marketplace_ids())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(leboncoin_adapter()));
        registry.register(Arc::new(vinted_adapter()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn MarketplaceAdapter>) {
        self.adapters
            .insert(adapter.marketplace_id().to_string(), adapter);
    }

    pub fn get(&self, marketplace: &str) -> Option<Arc<dyn MarketplaceAdapter>> {
        self.adapters.get(marketplace).cloned()
    }

    pub fn marketplace_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

/// Accepts numbers and numeric strings ("12.50").
fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let cur = json_at(value, path)?;
    cur.as_f64()
        .or_else(|| cur.as_str().and_then(|s| s.trim().replace(',', ".").parse().ok()))
}

/// Ids arrive as numbers or strings depending on the endpoint.
fn json_id(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_string_vec(value: &JsonValue, path: &[&str]) -> Vec<String> {
    json_at(value, path)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn expect_kind(
    settings: &FilterMap,
    key: &str,
    what: &str,
    ok: impl Fn(&JsonValue) -> bool,
) -> Result<(), AdapterError> {
    match settings.get(key) {
        None | Some(JsonValue::Null) => Ok(()),
        Some(value) if ok(value) => Ok(()),
        Some(value) => Err(AdapterError::validation(format!(
            "`{key}` must be {what}, got {value}"
        ))),
    }
}

fn is_id_like(value: &JsonValue) -> bool {
    value.is_string() || value.is_u64()
}

fn is_id_list(value: &JsonValue) -> bool {
    value
        .as_array()
        .is_some_and(|arr| arr.iter().all(is_id_like))
}

fn id_list(value: Option<&JsonValue>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| match v {
                    JsonValue::String(s) => Some(s.clone()),
                    JsonValue::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn price_bound(value: f64) -> JsonValue {
    if value.fract() == 0.0 && value >= 0.0 {
        json!(value as u64)
    } else {
        json!(value)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LeboncoinAdapter {
    endpoint: &'static str,
}

pub fn leboncoin_adapter() -> LeboncoinAdapter {
    LeboncoinAdapter {
        endpoint: "https://api.leboncoin.fr/finder/search",
    }
}

const LEBONCOIN_OWNER_TYPES: &[&str] = &["all", "private", "pro"];

impl LeboncoinAdapter {
    pub fn build_search_body(&self, request: &SearchRequest, config: &MarketplaceConfig) -> JsonValue {
        let (sort_by, sort_order) = match config.sort {
            SortOrder::Newest => ("time", "desc"),
            SortOrder::PriceAsc => ("price", "asc"),
            SortOrder::PriceDesc => ("price", "desc"),
            SortOrder::Relevance => ("relevance", "desc"),
        };

        let mut filters = json!({
            "keywords": { "text": request.text },
            "enums": { "ad_type": ["offer"] },
        });

        if let Some(category) = request.settings.get("category").filter(|v| !v.is_null()) {
            let id = match category {
                JsonValue::Number(n) => n.to_string(),
                other => other.as_str().unwrap_or_default().to_string(),
            };
            filters["category"] = json!({ "id": id });
        }

        let mut price = serde_json::Map::new();
        if let Some(min) = request.min_price {
            price.insert("min".into(), price_bound(min));
        }
        if let Some(max) = request.max_price {
            price.insert("max".into(), price_bound(max));
        }
        if !price.is_empty() {
            filters["ranges"] = json!({ "price": price });
        }

        if let Some(locations) = request.settings.get("locations").and_then(|v| v.as_array()) {
            if !locations.is_empty() {
                filters["location"] = json!({ "locations": locations });
            }
        }

        if request.settings.get("shippable").and_then(|v| v.as_bool()) == Some(true) {
            filters["enums"]["shippable"] = json!(["true"]);
        }

        let owner_type = request
            .settings
            .get("owner_type")
            .and_then(|v| v.as_str())
            .unwrap_or("all");

        json!({
            "limit": config.limit,
            "limit_alu": 0,
            "offset": 0,
            "sort_by": sort_by,
            "sort_order": sort_order,
            "owner_type": owner_type,
            "filters": filters,
        })
    }
}

#[async_trait]
impl MarketplaceAdapter for LeboncoinAdapter {
    fn marketplace_id(&self) -> &'static str {
        "leboncoin"
    }

    fn display_name(&self) -> &'static str {
        "Leboncoin"
    }

    fn default_settings(&self) -> FilterMap {
        let mut settings = FilterMap::new();
        settings.insert("owner_type".into(), json!("all"));
        settings.insert("shippable".into(), json!(false));
        settings
    }

    fn validate_settings(&self, settings: &FilterMap) -> Result<(), AdapterError> {
        expect_kind(settings, "category", "a category id", is_id_like)?;
        expect_kind(settings, "locations", "an array of location objects", |v| {
            v.as_array()
                .is_some_and(|arr| arr.iter().all(|l| l.is_object() || l.is_string()))
        })?;
        expect_kind(settings, "shippable", "a boolean", JsonValue::is_boolean)?;
        expect_kind(settings, "owner_type", "one of all|private|pro", |v| {
            v.as_str().is_some_and(|s| LEBONCOIN_OWNER_TYPES.contains(&s))
        })?;
        Ok(())
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        request: &SearchRequest,
        config: &MarketplaceConfig,
    ) -> Result<SearchPage, AdapterError> {
        let body = self.build_search_body(request, config);
        let headers = [
            ("Accept", "application/json".to_string()),
            ("Origin", "https://www.leboncoin.fr".to_string()),
        ];
        let response = http
            .post_json(self.marketplace_id(), self.endpoint, &body, &headers)
            .await?;

        let raw_ads = response
            .get("ads")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let total_count = response.get("total").and_then(|v| v.as_u64());
        let ads: Vec<Ad> = raw_ads.iter().map(|raw| self.transform_ad(raw)).collect();
        let has_more = total_count.is_some_and(|total| total > ads.len() as u64);

        Ok(SearchPage {
            ads,
            has_more,
            total_count,
        })
    }

    fn transform_ad(&self, raw: &JsonValue) -> Ad {
        let external_id = json_id(raw, &["list_id"])
            .or_else(|| json_id(raw, &["id"]))
            .unwrap_or_default();

        let amount = json_f64(raw, &["price_cents"])
            .map(|cents| cents / 100.0)
            .or_else(|| {
                json_at(raw, &["price"])
                    .and_then(|p| p.as_array())
                    .and_then(|arr| arr.first())
                    .and_then(|v| v.as_f64())
            })
            .or_else(|| json_f64(raw, &["price"]))
            .unwrap_or(0.0);

        let url = json_str(raw, &["url"])
            .map(ToString::to_string)
            .unwrap_or_else(|| {
                if external_id.is_empty() {
                    String::new()
                } else {
                    format!("https://www.leboncoin.fr/ad/{external_id}")
                }
            });

        let mut images = json_string_vec(raw, &["images", "urls_large"]);
        if images.is_empty() {
            images = json_string_vec(raw, &["images", "urls"]);
        }
        if images.is_empty() {
            if let Some(thumb) = json_str(raw, &["images", "thumb_url"]) {
                images.push(thumb.to_string());
            }
        }

        let location = match (
            json_str(raw, &["location", "city"]).and_then(text_or_none),
            json_str(raw, &["location", "zipcode"]).and_then(text_or_none),
        ) {
            (Some(city), Some(zip)) => Some(format!("{city} ({zip})")),
            (Some(city), None) => Some(city),
            (None, Some(zip)) => Some(zip),
            (None, None) => None,
        };

        let published_at = json_str(raw, &["first_publication_date"])
            .or_else(|| json_str(raw, &["index_date"]))
            .and_then(parse_leboncoin_date);

        Ad {
            marketplace: self.marketplace_id().to_string(),
            external_id,
            title: json_str(raw, &["subject"]).unwrap_or_default().to_string(),
            price: Price {
                amount,
                currency: "EUR".to_string(),
                suffix: None,
            },
            description: json_str(raw, &["body"]).unwrap_or_default().to_string(),
            url,
            images,
            location,
            published_at,
            matched_query: None,
            raw: raw.clone(),
        }
    }
}

// Dates come as "2024-03-01 10:15:00" without an offset; read them as UTC.
fn parse_leboncoin_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Debug, Clone, Copy)]
pub struct VintedAdapter;

pub fn vinted_adapter() -> VintedAdapter {
    VintedAdapter
}

const VINTED_ID_FILTERS: &[&str] = &["catalog_ids", "brand_ids", "size_ids", "status_ids", "color_ids"];

impl VintedAdapter {
    pub fn endpoint(&self, settings: &FilterMap) -> String {
        let domain = settings
            .get("domain")
            .and_then(|v| v.as_str())
            .unwrap_or("fr");
        format!("https://www.vinted.{domain}/api/v2/catalog/items")
    }

    pub fn build_query(&self, request: &SearchRequest, config: &MarketplaceConfig) -> Vec<(String, String)> {
        let order = match config.sort {
            SortOrder::Newest => "newest_first",
            SortOrder::PriceAsc => "price_low_to_high",
            SortOrder::PriceDesc => "price_high_to_low",
            SortOrder::Relevance => "relevance",
        };
        let mut query = vec![
            ("search_text".to_string(), request.text.clone()),
            ("page".to_string(), "1".to_string()),
            ("per_page".to_string(), config.limit.to_string()),
            ("order".to_string(), order.to_string()),
        ];
        if let Some(min) = request.min_price {
            query.push(("price_from".to_string(), min.to_string()));
        }
        if let Some(max) = request.max_price {
            query.push(("price_to".to_string(), max.to_string()));
        }
        for key in VINTED_ID_FILTERS {
            let ids = id_list(request.settings.get(*key));
            if !ids.is_empty() {
                query.push((key.to_string(), ids.join(",")));
            }
        }
        if let Some(currency) = request.settings.get("currency").and_then(|v| v.as_str()) {
            query.push(("currency".to_string(), currency.to_string()));
        }
        query
    }
}

#[async_trait]
impl MarketplaceAdapter for VintedAdapter {
    fn marketplace_id(&self) -> &'static str {
        "vinted"
    }

    fn display_name(&self) -> &'static str {
        "Vinted"
    }

    fn default_settings(&self) -> FilterMap {
        let mut settings = FilterMap::new();
        settings.insert("domain".into(), json!("fr"));
        settings
    }

    fn validate_settings(&self, settings: &FilterMap) -> Result<(), AdapterError> {
        for key in VINTED_ID_FILTERS {
            expect_kind(settings, key, "an array of ids", is_id_list)?;
        }
        expect_kind(settings, "domain", "a domain suffix such as \"fr\"", |v| {
            v.as_str().is_some_and(|s| {
                !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
            })
        })?;
        expect_kind(settings, "currency", "an ISO currency code", |v| {
            v.as_str().is_some_and(|s| s.len() == 3)
        })?;
        Ok(())
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        request: &SearchRequest,
        config: &MarketplaceConfig,
    ) -> Result<SearchPage, AdapterError> {
        let url = self.endpoint(&request.settings);
        let query = self.build_query(request, config);
        let headers = [("Accept", "application/json".to_string())];
        let response = http
            .get_json(self.marketplace_id(), &url, &query, &headers)
            .await?;

        if let Some(message) = json_str(&response, &["message"]).filter(|_| response.get("items").is_none()) {
            warn!(marketplace = self.marketplace_id(), upstream = message, "search returned no items field");
            return Err(AdapterError::Upstream {
                status: None,
                message: message.to_string(),
            });
        }

        let raw_items = response
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let ads: Vec<Ad> = raw_items.iter().map(|raw| self.transform_ad(raw)).collect();
        let total_count = json_at(&response, &["pagination", "total_entries"]).and_then(|v| v.as_u64());
        let current_page = json_at(&response, &["pagination", "current_page"])
            .and_then(|v| v.as_u64())
            .unwrap_or(1);
        let total_pages = json_at(&response, &["pagination", "total_pages"])
            .and_then(|v| v.as_u64())
            .unwrap_or(1);

        Ok(SearchPage {
            ads,
            has_more: current_page < total_pages,
            total_count,
        })
    }

    fn transform_ad(&self, raw: &JsonValue) -> Ad {
        let external_id = json_id(raw, &["id"]).unwrap_or_default();

        let amount = json_f64(raw, &["price", "amount"])
            .or_else(|| json_f64(raw, &["price"]))
            .unwrap_or(0.0);
        let currency = json_str(raw, &["price", "currency_code"])
            .or_else(|| json_str(raw, &["currency"]))
            .unwrap_or("EUR")
            .to_string();
        let suffix = json_f64(raw, &["total_item_price", "amount"])
            .or_else(|| json_f64(raw, &["total_item_price"]))
            .filter(|total| *total > amount)
            .map(|total| format!("({total:.2} incl. fees)"));

        let description = [
            json_str(raw, &["brand_title"]),
            json_str(raw, &["size_title"]),
            json_str(raw, &["status"]),
        ]
        .into_iter()
        .flatten()
        .filter_map(text_or_none)
        .collect::<Vec<_>>()
        .join(" · ");

        let mut images = Vec::new();
        if let Some(photo) = json_str(raw, &["photo", "full_size_url"]).or_else(|| json_str(raw, &["photo", "url"])) {
            images.push(photo.to_string());
        }
        if let Some(photos) = json_at(raw, &["photos"]).and_then(|v| v.as_array()) {
            for photo in photos {
                if let Some(url) = json_str(photo, &["url"]) {
                    if !images.iter().any(|i| i == url) {
                        images.push(url.to_string());
                    }
                }
            }
        }

        let published_at = json_at(raw, &["photo", "high_resolution", "timestamp"])
            .and_then(|v| v.as_i64())
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

        let url = json_str(raw, &["url"]).map(ToString::to_string).unwrap_or_else(|| {
            if external_id.is_empty() {
                String::new()
            } else {
                format!("https://www.vinted.fr/items/{external_id}")
            }
        });

        Ad {
            marketplace: self.marketplace_id().to_string(),
            external_id,
            title: json_str(raw, &["title"]).unwrap_or_default().to_string(),
            price: Price {
                amount,
                currency,
                suffix,
            },
            description,
            url,
            images,
            location: json_str(raw, &["user", "city"]).and_then(text_or_none),
            published_at,
            matched_query: None,
            raw: raw.clone(),
        }
    }
}
