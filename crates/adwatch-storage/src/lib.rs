//! In-memory ad dedup cache + HTTP fetch and retry utilities for adwatch.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use adwatch_core::{Ad, AdKey};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "adwatch-storage";

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheConfig {
    /// Oldest-inserted entries are evicted once this many are held.
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub max_entries: Option<usize>,
    pub by_marketplace: BTreeMap<String, usize>,
}

#[derive(Debug)]
struct CacheSlot {
    ad: Ad,
    seq: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<AdKey, CacheSlot>,
    // Insertion order; entries whose seq no longer matches are stale.
    order: VecDeque<(AdKey, u64)>,
    next_seq: u64,
}

impl CacheInner {
    fn compact_order(&mut self) {
        if self.order.len() <= self.entries.len() * 2 + 64 {
            return;
        }
        let mut live: Vec<(AdKey, u64)> = self
            .entries
            .iter()
            .map(|(k, slot)| (k.clone(), slot.seq))
            .collect();
        live.sort_by_key(|(_, seq)| *seq);
        self.order = live.into();
    }
}

/// Per-marketplace, per-ad ledger of listings already seen.
///
/// Keys are `(marketplace, external_id)`; overwriting an existing key replaces
/// the stored ad but keeps its original insertion position.
#[derive(Debug, Default)]
pub struct AdCache {
    inner: RwLock<CacheInner>,
    max_entries: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
}

impl AdCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            max_entries: config.max_entries.filter(|n| *n > 0),
            ..Default::default()
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn has(&self, marketplace: &str, external_id: &str) -> bool {
        self.contains(&AdKey::new(marketplace, external_id))
    }

    pub fn contains(&self, key: &AdKey) -> bool {
        let found = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains_key(key);
        if found {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn get(&self, marketplace: &str, external_id: &str) -> Option<Ad> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(&AdKey::new(marketplace, external_id))
            .map(|slot| slot.ad.clone())
    }

    pub fn set(&self, ad: Ad) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        self.insert_locked(&mut inner, ad);
    }

    pub fn set_many(&self, ads: impl IntoIterator<Item = Ad>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for ad in ads {
            self.insert_locked(&mut inner, ad);
        }
    }

    fn insert_locked(&self, inner: &mut CacheInner, ad: Ad) {
        let key = ad.key();
        if let Some(slot) = inner.entries.get_mut(&key) {
            slot.ad = ad;
            return;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.push_back((key.clone(), seq));
        inner.entries.insert(key, CacheSlot { ad, seq });
        self.inserts.fetch_add(1, Ordering::Relaxed);

        if let Some(max) = self.max_entries {
            while inner.entries.len() > max {
                let Some((old_key, old_seq)) = inner.order.pop_front() else {
                    break;
                };
                let live = inner
                    .entries
                    .get(&old_key)
                    .is_some_and(|slot| slot.seq == old_seq);
                if live {
                    inner.entries.remove(&old_key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %old_key, "evicted ad from cache");
                }
            }
        }
        inner.compact_order();
    }

    pub fn delete(&self, marketplace: &str, external_id: &str) -> Option<Ad> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner
            .entries
            .remove(&AdKey::new(marketplace, external_id))
            .map(|slot| slot.ad);
        inner.compact_order();
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.clear();
        inner.order.clear();
    }

    /// Drops every entry of one marketplace; returns how many were removed.
    pub fn clear_marketplace(&self, marketplace: &str) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.entries.len();
        inner.entries.retain(|key, _| key.marketplace != marketplace);
        inner.order.retain(|(key, _)| key.marketplace != marketplace);
        before - inner.entries.len()
    }

    pub fn size(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn keys(&self) -> Vec<AdKey> {
        let mut keys: Vec<AdKey> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut by_marketplace: BTreeMap<String, usize> = BTreeMap::new();
        for key in inner.entries.keys() {
            *by_marketplace.entry(key.marketplace.clone()).or_default() += 1;
        }
        CacheStats {
            entries: inner.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            max_entries: self.max_entries,
            by_marketplace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Lower-cased fragments of transport failures worth retrying.
pub const RETRYABLE_ERROR_PATTERNS: &[&str] = &[
    "etimedout",
    "econnreset",
    "econnrefused",
    "enotfound",
    "eai_again",
    "epipe",
    "socket hang up",
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection closed",
    "network",
    "dns",
];

pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RETRYABLE_ERROR_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        return RetryDisposition::Retryable;
    }
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    if is_retryable_message(&err.to_string()) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Errors the shared retry loop knows how to classify.
pub trait Retryable: std::fmt::Display {
    fn is_retryable(&self) -> bool;

    /// Error produced when an attempt loses the race against its timeout.
    fn timed_out(after: Duration) -> Self;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
    pub attempt_timeout: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            multiplier: 1.8,
            max_delay: Duration::from_secs(30),
            jitter: true,
            attempt_timeout: Some(Duration::from_secs(15)),
        }
    }
}

impl BackoffPolicy {
    pub const JITTER_MIN: f64 = 0.8;
    pub const JITTER_MAX: f64 = 1.2;

    pub fn new(max_retries: usize, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// `base × multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        self.scaled_delay(attempt_index, 1.0)
    }

    pub fn jittered_delay_for_attempt(&self, attempt_index: usize) -> Duration {
        if !self.jitter {
            return self.delay_for_attempt(attempt_index);
        }
        let factor = rand::thread_rng().gen_range(Self::JITTER_MIN..=Self::JITTER_MAX);
        self.scaled_delay(attempt_index, factor)
    }

    fn scaled_delay(&self, attempt_index: usize, factor: f64) -> Duration {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent) * factor;
        let capped = secs.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or
/// `max_retries` retries have been spent. Each attempt races
/// `attempt_timeout` when one is set.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0usize;
    loop {
        let result = match policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(limit)),
            },
            None => op(attempt).await,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() || attempt >= policy.max_retries {
            if attempt > 0 {
                warn!(operation, attempts = attempt + 1, error = %err, "giving up after retries");
            }
            return Err(err);
        }

        let delay = policy.jittered_delay_for_attempt(attempt);
        warn!(
            operation,
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retryable failure; backing off"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_scope_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_scope_concurrency: 4,
        }
    }
}

/// Single-attempt HTTP client with global and per-scope concurrency limits.
///
/// A scope is a marketplace id or a notification channel kind. Retrying is
/// left to [`retry_with_backoff`].
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_scope_limit: usize,
    per_scope: Mutex<HashMap<String, Arc<Semaphore>>>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedResponse {
    pub fn json(&self) -> Result<JsonValue, FetchError> {
        if self.body.is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_slice(&self.body).map_err(|e| FetchError::Decode {
            url: self.final_url.clone(),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("invalid JSON from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("http client is shutting down")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Timeout(_) => RetryDisposition::Retryable,
            FetchError::Decode { .. } | FetchError::Closed => RetryDisposition::NonRetryable,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }

    fn timed_out(after: Duration) -> Self {
        FetchError::Timeout(after)
    }
}

const ERROR_BODY_SNIPPET: usize = 512;

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_scope_limit: config.per_scope_concurrency.max(1),
            per_scope: Mutex::new(HashMap::new()),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        let mut map = self.per_scope.lock().await;
        map.entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
            .clone()
    }

    /// Sends one request. Non-2xx responses become [`FetchError::HttpStatus`].
    pub async fn execute(
        &self,
        scope: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_scope = self.scope_semaphore(scope).await;
        let _scoped = per_scope.acquire().await.map_err(|_| FetchError::Closed)?;

        send_once(request)
            .instrument(info_span!("http_request", scope))
            .await
    }

    pub async fn get_json(
        &self,
        scope: &str,
        url: &str,
        query: &[(String, String)],
        headers: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let mut request = self.client.get(url).query(query);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        self.execute(scope, request).await?.json()
    }

    pub async fn post_json(
        &self,
        scope: &str,
        url: &str,
        body: &JsonValue,
        headers: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        self.execute(scope, request).await?.json()
    }
}

async fn send_once(request: reqwest::RequestBuilder) -> Result<FetchedResponse, FetchError> {
    let resp = request.send().await?;
    let status = resp.status();
    let final_url = resp.url().to_string();
    let body = resp.bytes().await?.to_vec();

    if status.is_success() {
        debug!(%status, url = %final_url, bytes = body.len(), "http request succeeded");
        return Ok(FetchedResponse {
            status,
            final_url,
            body,
            fetched_at: Utc::now(),
        });
    }

    let snippet: String = String::from_utf8_lossy(&body)
        .chars()
        .take(ERROR_BODY_SNIPPET)
        .collect();
    Err(FetchError::HttpStatus {
        status: status.as_u16(),
        url: final_url,
        body: snippet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use adwatch_core::Price;
    use std::sync::atomic::AtomicUsize;

    fn ad(marketplace: &str, id: &str) -> Ad {
        Ad {
            marketplace: marketplace.to_string(),
            external_id: id.to_string(),
            title: format!("title {id}"),
            price: Price::default(),
            description: String::new(),
            url: String::new(),
            images: vec![],
            location: None,
            published_at: None,
            matched_query: None,
            raw: JsonValue::Null,
        }
    }

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (retryable={})", self.retryable)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }

        fn timed_out(_after: Duration) -> Self {
            TestError { retryable: true }
        }
    }

    fn fast_policy(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy::new(max_retries, Duration::from_millis(1)).with_attempt_timeout(None)
    }

    #[test]
    fn cache_has_set_get_delete() {
        let cache = AdCache::unbounded();
        assert!(!cache.has("vinted", "1"));
        cache.set(ad("vinted", "1"));
        assert!(cache.has("vinted", "1"));
        assert!(!cache.has("leboncoin", "1"));
        assert_eq!(cache.get("vinted", "1").unwrap().title, "title 1");
        assert!(cache.delete("vinted", "1").is_some());
        assert!(cache.delete("vinted", "1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn overwrite_keeps_single_entry() {
        let cache = AdCache::unbounded();
        cache.set(ad("vinted", "1"));
        let mut changed = ad("vinted", "1");
        changed.title = "new title".into();
        cache.set(changed);
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get("vinted", "1").unwrap().title, "new title");
        assert_eq!(cache.stats().inserts, 1);
    }

    #[test]
    fn clear_marketplace_only_touches_that_marketplace() {
        let cache = AdCache::unbounded();
        cache.set_many([ad("a", "1"), ad("a", "2"), ad("b", "1")]);
        assert_eq!(cache.clear_marketplace("a"), 2);
        assert_eq!(cache.keys(), vec![AdKey::new("b", "1")]);
        cache.clear();
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn bounded_cache_evicts_oldest_first() {
        let cache = AdCache::new(CacheConfig {
            max_entries: Some(2),
        });
        cache.set(ad("a", "1"));
        cache.set(ad("a", "2"));
        // re-setting does not refresh the position of "1"
        cache.set(ad("a", "1"));
        cache.set(ad("a", "3"));

        assert_eq!(cache.keys(), vec![AdKey::new("a", "2"), AdKey::new("a", "3")]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn deleted_then_reinserted_entry_is_not_evicted_by_stale_order() {
        let cache = AdCache::new(CacheConfig {
            max_entries: Some(2),
        });
        cache.set(ad("a", "1"));
        cache.delete("a", "1");
        cache.set(ad("a", "2"));
        cache.set(ad("a", "1"));
        cache.set(ad("a", "3"));

        assert_eq!(cache.keys(), vec![AdKey::new("a", "1"), AdKey::new("a", "3")]);
    }

    #[test]
    fn stats_track_hits_misses_and_marketplaces() {
        let cache = AdCache::unbounded();
        cache.set_many([ad("a", "1"), ad("b", "1"), ad("b", "2")]);
        assert!(cache.has("a", "1"));
        assert!(!cache.has("a", "9"));

        let stats = cache.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.by_marketplace.get("b"), Some(&2));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(1000),
            multiplier: 1.8,
            max_delay: Duration::from_secs(30),
            jitter: false,
            attempt_timeout: None,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert!((policy.delay_for_attempt(1).as_secs_f64() - 1.8).abs() < 1e-6);
        assert!((policy.delay_for_attempt(2).as_secs_f64() - 3.24).abs() < 1e-6);
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(30));
    }

    #[test]
    fn jittered_delays_stay_in_band_and_never_decrease() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let mut previous = Duration::ZERO;
            for attempt in 0..12 {
                let delay = policy.jittered_delay_for_attempt(attempt);
                let nominal = policy.delay_for_attempt(attempt).as_secs_f64();
                assert!(delay.as_secs_f64() >= (nominal * 0.8).min(30.0) - 1e-6);
                assert!(delay <= policy.max_delay);
                assert!(delay >= previous, "attempt {attempt} went backwards");
                previous = delay;
            }
        }
    }

    #[tokio::test]
    async fn retry_stops_after_max_retries() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), TestError> = retry_with_backoff(&fast_policy(3), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError { retryable: true }) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_retryable_error_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), TestError> = retry_with_backoff(&fast_policy(5), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError { retryable: false }) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let result: Result<usize, TestError> = retry_with_backoff(&fast_policy(5), "test", |attempt| async move {
            if attempt < 2 {
                Err(TestError { retryable: true })
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn slow_attempts_time_out_and_are_retried() {
        let calls = AtomicUsize::new(0);
        let policy = fast_policy(2).with_attempt_timeout(Some(Duration::from_millis(5)));
        let result: Result<(), TestError> = retry_with_backoff(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            }
        })
        .await;

        assert!(result.unwrap_err().retryable);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn message_patterns_and_status_classification() {
        assert!(is_retryable_message("read ECONNRESET"));
        assert!(is_retryable_message("Socket hang up"));
        assert!(is_retryable_message("operation timed out"));
        assert!(!is_retryable_message("invalid category id"));

        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);

        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://x".into(),
            body: String::new(),
        };
        assert!(err.is_retryable());
        assert!(FetchError::timed_out(Duration::from_secs(1)).is_retryable());
    }
}
