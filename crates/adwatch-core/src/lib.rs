//! Core domain model and in-process event bus for adwatch.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adwatch-core";

/// Marketplace used when neither the query nor the watcher names one.
pub const DEFAULT_MARKETPLACE: &str = "leboncoin";

/// Composite identity of a listing. Two ads with the same key are the same listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdKey {
    pub marketplace: String,
    pub external_id: String,
}

impl AdKey {
    pub fn new(marketplace: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            marketplace: marketplace.into(),
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for AdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.marketplace, self.external_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: f64,
    pub currency: String,
    /// Display suffix such as "/month" or "incl. fees".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

impl Default for Price {
    fn default() -> Self {
        Self {
            amount: 0.0,
            currency: "EUR".to_string(),
            suffix: None,
        }
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let amount = if self.amount.fract() == 0.0 {
            format!("{:.0}", self.amount)
        } else {
            format!("{:.2}", self.amount)
        };
        write!(f, "{amount} {}", self.currency)?;
        if let Some(suffix) = &self.suffix {
            write!(f, " {suffix}")?;
        }
        Ok(())
    }
}

/// Canonical, marketplace-agnostic listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ad {
    pub marketplace: String,
    pub external_id: String,
    pub title: String,
    pub price: Price,
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    /// Text of the query that surfaced this ad during a tick.
    #[serde(default)]
    pub matched_query: Option<String>,
    /// Untouched marketplace record.
    #[serde(default)]
    pub raw: JsonValue,
}

impl Ad {
    pub fn key(&self) -> AdKey {
        AdKey::new(self.marketplace.clone(), self.external_id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatcherStatus {
    #[default]
    Active,
    Stopped,
}

/// Marketplace-specific filters attached to a query (category, location, ...).
pub type FilterMap = BTreeMap<String, JsonValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub marketplace: Option<String>,
    #[serde(default)]
    pub filters: FilterMap,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            enabled: true,
            marketplace: None,
            filters: FilterMap::new(),
        }
    }

    pub fn on(mut self, marketplace: impl Into<String>) -> Self {
        self.marketplace = Some(marketplace.into());
        self
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Discord,
    Email,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Discord => f.write_str("discord"),
            ChannelKind::Email => f.write_str("email"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum ChannelConfig {
    #[serde(alias = "discord")]
    Discord { webhook_url: String },
    #[serde(alias = "email")]
    Email { address: String },
}

impl ChannelConfig {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelConfig::Discord { .. } => ChannelKind::Discord,
            ChannelConfig::Email { .. } => ChannelKind::Email,
        }
    }

    /// Short, log-safe label (never the full webhook secret).
    pub fn label(&self) -> String {
        match self {
            ChannelConfig::Discord { webhook_url } => {
                let tail: String = webhook_url
                    .rsplit('/')
                    .nth(1)
                    .unwrap_or_default()
                    .chars()
                    .take(8)
                    .collect();
                format!("discord:{tail}")
            }
            ChannelConfig::Email { address } => format!("email:{address}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watcher {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub queries: Vec<SearchQuery>,
    pub schedule: String,
    #[serde(default)]
    pub status: WatcherStatus,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub default_marketplace: Option<String>,
    #[serde(default)]
    pub notifications: Vec<ChannelConfig>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
}

impl Watcher {
    pub fn new(id: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            queries: Vec::new(),
            schedule: schedule.into(),
            status: WatcherStatus::Active,
            min_price: None,
            max_price: None,
            default_marketplace: None,
            notifications: Vec::new(),
            last_run: None,
            run_count: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == WatcherStatus::Active
    }

    pub fn enabled_queries(&self) -> impl Iterator<Item = &SearchQuery> {
        self.queries.iter().filter(|q| q.enabled)
    }

    /// Query override, then watcher default, then [`DEFAULT_MARKETPLACE`].
    pub fn effective_marketplace<'a>(&'a self, query: &'a SearchQuery) -> &'a str {
        query
            .marketplace
            .as_deref()
            .or(self.default_marketplace.as_deref())
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(DEFAULT_MARKETPLACE)
    }

    pub fn price_in_bounds(&self, ad: &Ad) -> bool {
        let amount = ad.price.amount;
        if let Some(min) = self.min_price {
            if amount < min {
                return false;
            }
        }
        if let Some(max) = self.max_price {
            if amount > max {
                return false;
            }
        }
        true
    }

    /// Comma-joined query texts, used in notifications.
    pub fn query_summary(&self) -> String {
        self.enabled_queries()
            .map(|q| q.text.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    JobStarted,
    JobCompleted,
    JobError,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::JobStarted => f.write_str("JOB_STARTED"),
            EventKind::JobCompleted => f.write_str("JOB_COMPLETED"),
            EventKind::JobError => f.write_str("JOB_ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum WatcherEvent {
    JobStarted {
        watcher_id: String,
        at: DateTime<Utc>,
    },
    JobCompleted {
        watcher_id: String,
        new_ads: Vec<Ad>,
        first_run: bool,
        at: DateTime<Utc>,
    },
    JobError {
        watcher_id: String,
        message: String,
        at: DateTime<Utc>,
    },
}

impl WatcherEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WatcherEvent::JobStarted { .. } => EventKind::JobStarted,
            WatcherEvent::JobCompleted { .. } => EventKind::JobCompleted,
            WatcherEvent::JobError { .. } => EventKind::JobError,
        }
    }

    pub fn watcher_id(&self) -> &str {
        match self {
            WatcherEvent::JobStarted { watcher_id, .. }
            | WatcherEvent::JobCompleted { watcher_id, .. }
            | WatcherEvent::JobError { watcher_id, .. } => watcher_id,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            WatcherEvent::JobStarted { at, .. }
            | WatcherEvent::JobCompleted { at, .. }
            | WatcherEvent::JobError { at, .. } => *at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

pub type EventHandler = Arc<dyn Fn(&WatcherEvent) -> anyhow::Result<()> + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    handler: EventHandler,
}

/// Synchronous publish/subscribe keyed by [`EventKind`].
///
/// Handlers run on the publisher's thread in registration order. A handler
/// returning an error or panicking is logged and the remaining handlers still
/// run. Nothing is buffered: events emitted with no subscriber are dropped.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("EventBus").field("subscribers", &count).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&WatcherEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_handler(kind, Arc::new(handler))
    }

    pub fn subscribe_handler(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { id, kind, handler });
        id
    }

    /// Registers one handler under several kinds; returns one id per kind.
    pub fn subscribe_many<F>(&self, kinds: &[EventKind], handler: F) -> Vec<SubscriptionId>
    where
        F: Fn(&WatcherEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        kinds
            .iter()
            .map(|kind| self.subscribe_handler(*kind, handler.clone()))
            .collect()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }

    /// Delivers `event` to every matching handler; returns how many succeeded.
    pub fn emit(&self, event: &WatcherEvent) -> usize {
        let kind = event.kind();
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<EventHandler> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.handler.clone())
            .collect();

        debug!(event = %kind, watcher_id = event.watcher_id(), handlers = handlers.len(), "emitting event");

        let mut delivered = 0usize;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    warn!(event = %kind, watcher_id = event.watcher_id(), error = %format!("{err:#}"), "event handler failed");
                }
                Err(_) => {
                    error!(event = %kind, watcher_id = event.watcher_id(), "event handler panicked");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ad(marketplace: &str, id: &str, amount: f64) -> Ad {
        Ad {
            marketplace: marketplace.to_string(),
            external_id: id.to_string(),
            title: format!("ad {id}"),
            price: Price {
                amount,
                ..Price::default()
            },
            description: String::new(),
            url: format!("https://{marketplace}.example/{id}"),
            images: vec![],
            location: None,
            published_at: None,
            matched_query: None,
            raw: JsonValue::Null,
        }
    }

    fn started(id: &str) -> WatcherEvent {
        WatcherEvent::JobStarted {
            watcher_id: id.to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn effective_marketplace_falls_back_in_order() {
        let mut watcher = Watcher::new("w1", "*/5 * * * *");
        let plain = SearchQuery::new("lamp");
        let overridden = SearchQuery::new("lamp").on("vinted");

        assert_eq!(watcher.effective_marketplace(&plain), DEFAULT_MARKETPLACE);
        watcher.default_marketplace = Some("ebay".into());
        assert_eq!(watcher.effective_marketplace(&plain), "ebay");
        assert_eq!(watcher.effective_marketplace(&overridden), "vinted");
    }

    #[test]
    fn price_bounds_are_inclusive() {
        let mut watcher = Watcher::new("w1", "* * * * *");
        watcher.min_price = Some(10.0);
        watcher.max_price = Some(20.0);
        assert!(watcher.price_in_bounds(&ad("a", "1", 10.0)));
        assert!(watcher.price_in_bounds(&ad("a", "2", 20.0)));
        assert!(!watcher.price_in_bounds(&ad("a", "3", 9.99)));
        assert!(!watcher.price_in_bounds(&ad("a", "4", 20.5)));
    }

    #[test]
    fn key_ignores_field_drift() {
        let a = ad("vinted", "42", 10.0);
        let mut b = a.clone();
        b.title = "renamed".into();
        b.price.amount = 99.0;
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().to_string(), "vinted:42");
    }

    #[test]
    fn channel_config_accepts_either_case() {
        let upper: ChannelConfig =
            serde_json::from_str(r#"{"kind":"DISCORD","webhook_url":"https://x/api/webhooks/1/abc"}"#).unwrap();
        let lower: ChannelConfig = serde_json::from_str(r#"{"kind":"email","address":"me@example.com"}"#).unwrap();
        assert_eq!(upper.kind(), ChannelKind::Discord);
        assert_eq!(lower.kind(), ChannelKind::Email);
        assert_eq!(lower.label(), "email:me@example.com");
    }

    #[test]
    fn subscribers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let seen = seen.clone();
            bus.subscribe(EventKind::JobStarted, move |_| {
                seen.lock().unwrap().push(n);
                Ok(())
            });
        }
        assert_eq!(bus.emit(&started("w1")), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_and_panicking_subscribers_do_not_stop_others() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        bus.subscribe(EventKind::JobStarted, |_| Err(anyhow::anyhow!("boom")));
        bus.subscribe(EventKind::JobStarted, |_| panic!("handler panic"));
        let h = hits.clone();
        bus.subscribe(EventKind::JobStarted, move |_| {
            *h.lock().unwrap() += 1;
            Ok(())
        });

        assert_eq!(bus.emit(&started("w1")), 1);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn events_only_reach_matching_kind_and_unsubscribe_works() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let id = bus.subscribe(EventKind::JobError, move |_| {
            *h.lock().unwrap() += 1;
            Ok(())
        });

        assert_eq!(bus.emit(&started("w1")), 0);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(EventKind::JobError), 0);
        assert_eq!(*hits.lock().unwrap(), 0);
    }
}
