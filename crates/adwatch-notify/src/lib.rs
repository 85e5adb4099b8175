//! Notification fan-out: Discord webhooks, email through an HTTP relay, batching and per-channel retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use adwatch_core::{Ad, ChannelConfig, ChannelKind};
use adwatch_storage::{retry_with_backoff, BackoffPolicy, FetchError, HttpFetcher, Retryable};
use askama::Template;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "adwatch-notify";

/// Hard ceiling imposed by Discord on embeds per webhook message.
pub const DISCORD_MAX_EMBEDS: usize = 10;
pub const DESCRIPTION_LIMIT: usize = 200;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enable_batching: bool,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub item_delay_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub discord: DiscordSettings,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enable_batching: true,
            batch_size: 10,
            batch_delay_ms: 2000,
            item_delay_ms: 500,
            max_retries: 3,
            retry_delay_ms: 1000,
            discord: DiscordSettings::default(),
        }
    }
}

impl NotificationConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
            .with_attempt_timeout(Some(DELIVERY_TIMEOUT))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordSettings {
    pub username: String,
    pub avatar_url: Option<String>,
}

impl Default for DiscordSettings {
    fn default() -> Self {
        Self {
            username: "Ad Watcher".to_string(),
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailRelayConfig {
    pub relay_url: Option<String>,
    pub from: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("channel not configured: {0}")]
    NotConfigured(String),
    #[error("delivery transport failed: {0}")]
    Transport(String),
    #[error("channel rejected delivery (status {status:?}): {message}")]
    Rejected { status: Option<u16>, message: String },
    #[error("message rendering failed: {0}")]
    Render(String),
}

impl Retryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transport(_))
    }

    fn timed_out(after: Duration) -> Self {
        DeliveryError::Transport(format!("delivery timed out after {}ms", after.as_millis()))
    }
}

impl From<FetchError> for DeliveryError {
    fn from(err: FetchError) -> Self {
        if err.is_retryable() {
            DeliveryError::Transport(err.to_string())
        } else {
            DeliveryError::Rejected {
                status: err.status(),
                message: err.to_string(),
            }
        }
    }
}

/// Watcher-level facts rendered into every message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifyContext {
    pub watcher_id: String,
    pub watcher_name: Option<String>,
    pub query_summary: String,
}

impl NotifyContext {
    pub fn display_name(&self) -> &str {
        self.watcher_name.as_deref().unwrap_or(&self.watcher_id)
    }
}

/// 1-based position of a message within one channel's delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchInfo {
    pub index: usize,
    pub total: usize,
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn max_ads_per_message(&self) -> usize {
        usize::MAX
    }

    /// One outbound message. Retries are the dispatcher's job.
    async fn send(
        &self,
        channel: &ChannelConfig,
        ads: &[Ad],
        ctx: &NotifyContext,
        batch: BatchInfo,
    ) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    pub channel: String,
    pub messages_sent: usize,
    pub messages_failed: usize,
    pub ads_delivered: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub channels: Vec<ChannelReport>,
}

impl DispatchReport {
    pub fn messages_failed(&self) -> usize {
        self.channels.iter().map(|c| c.messages_failed).sum()
    }

    pub fn messages_sent(&self) -> usize {
        self.channels.iter().map(|c| c.messages_sent).sum()
    }
}

/// Seam used by the scheduler so ticks can run against a recording notifier.
#[async_trait]
pub trait AdNotifier: Send + Sync {
    async fn notify(&self, ads: &[Ad], channels: &[ChannelConfig], ctx: &NotifyContext) -> DispatchReport;
}

pub struct NotificationDispatcher {
    config: NotificationConfig,
    senders: HashMap<ChannelKind, Arc<dyn ChannelSender>>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("config", &self.config)
            .field("channels", &self.senders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NotificationDispatcher {
    /// Dispatcher with no channel senders; see [`Self::with_sender`].
    pub fn empty(config: NotificationConfig) -> Self {
        Self {
            config,
            senders: HashMap::new(),
        }
    }

    pub fn new(config: NotificationConfig, http: Arc<HttpFetcher>, email: EmailRelayConfig) -> Self {
        let discord = DiscordWebhookSender::new(http.clone(), config.discord.clone());
        Self::empty(config)
            .with_sender(Arc::new(discord))
            .with_sender(Arc::new(EmailRelaySender::new(http, email)))
    }

    pub fn with_sender(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(sender.kind(), sender);
        self
    }

    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    /// Splits `count` ads into message-sized groups and the pause that follows each.
    pub fn plan(&self, count: usize, max_per_message: usize) -> (Vec<std::ops::Range<usize>>, Duration) {
        if count == 0 {
            return (Vec::new(), Duration::ZERO);
        }
        let (size, pause) = if self.config.enable_batching && count > 1 {
            (
                self.config.batch_size.clamp(1, max_per_message.max(1)),
                Duration::from_millis(self.config.batch_delay_ms),
            )
        } else {
            (1, Duration::from_millis(self.config.item_delay_ms))
        };
        let ranges = (0..count)
            .step_by(size)
            .map(|start| start..(start + size).min(count))
            .collect();
        (ranges, pause)
    }

    async fn deliver_channel(&self, channel: &ChannelConfig, ads: &[Ad], ctx: &NotifyContext) -> ChannelReport {
        let label = channel.label();
        let mut report = ChannelReport {
            channel: label.clone(),
            messages_sent: 0,
            messages_failed: 0,
            ads_delivered: 0,
        };

        let Some(sender) = self.senders.get(&channel.kind()) else {
            warn!(channel = %label, "no sender registered for channel kind");
            report.messages_failed = 1;
            return report;
        };

        let (ranges, pause) = self.plan(ads.len(), sender.max_ads_per_message());
        let policy = self.config.backoff_policy();
        let total = ranges.len();

        for (i, range) in ranges.into_iter().enumerate() {
            if i > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            let chunk = &ads[range];
            let batch = BatchInfo { index: i + 1, total };
            let operation = format!("notify {label} ({}/{total})", i + 1);
            let result = retry_with_backoff(&policy, &operation, |_| sender.send(channel, chunk, ctx, batch)).await;
            match result {
                Ok(()) => {
                    report.messages_sent += 1;
                    report.ads_delivered += chunk.len();
                }
                Err(err) => {
                    warn!(channel = %label, watcher_id = %ctx.watcher_id, error = %err, "notification delivery failed");
                    report.messages_failed += 1;
                }
            }
        }
        report
    }
}

#[async_trait]
impl AdNotifier for NotificationDispatcher {
    /// Fans out to every channel concurrently and waits for all of them.
    async fn notify(&self, ads: &[Ad], channels: &[ChannelConfig], ctx: &NotifyContext) -> DispatchReport {
        if ads.is_empty() || channels.is_empty() {
            return DispatchReport::default();
        }
        let reports = join_all(channels.iter().map(|channel| self.deliver_channel(channel, ads, ctx))).await;
        let report = DispatchReport { channels: reports };
        info!(
            watcher_id = %ctx.watcher_id,
            ads = ads.len(),
            sent = report.messages_sent(),
            failed = report.messages_failed(),
            "notifications dispatched"
        );
        report
    }
}

/// Keeps at most `limit` characters, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscordPayload {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscordEmbed {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub description: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedThumbnail>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedThumbnail {
    pub url: String,
}

const EMBED_COLOR: u32 = 0x0058_65F2;

fn field(name: &str, value: impl Into<String>, inline: bool) -> EmbedField {
    let value = value.into();
    EmbedField {
        name: name.to_string(),
        value: if value.trim().is_empty() { "-".to_string() } else { value },
        inline,
    }
}

pub struct DiscordWebhookSender {
    http: Arc<HttpFetcher>,
    settings: DiscordSettings,
}

impl DiscordWebhookSender {
    pub fn new(http: Arc<HttpFetcher>, settings: DiscordSettings) -> Self {
        Self { http, settings }
    }

    pub fn build_payload(&self, ads: &[Ad], ctx: &NotifyContext, batch: BatchInfo) -> DiscordPayload {
        build_discord_payload(&self.settings, ads, ctx, batch)
    }
}

pub fn build_discord_payload(
    settings: &DiscordSettings,
    ads: &[Ad],
    ctx: &NotifyContext,
    batch: BatchInfo,
) -> DiscordPayload {
    if ads.len() > DISCORD_MAX_EMBEDS {
        warn!(ads = ads.len(), "discord message truncated to {DISCORD_MAX_EMBEDS} embeds");
    }
    let shown = &ads[..ads.len().min(DISCORD_MAX_EMBEDS)];

    let content = if batch.total > 1 || shown.len() > 1 {
        let mut line = format!(
            "{} new ads for **{}**",
            shown.len(),
            ctx.display_name()
        );
        if batch.total > 1 {
            line.push_str(&format!(" (batch {}/{})", batch.index, batch.total));
        }
        Some(line)
    } else {
        None
    };

    let now = Utc::now();
    let embeds = shown
        .iter()
        .map(|ad| {
            let query = ad
                .matched_query
                .clone()
                .unwrap_or_else(|| ctx.query_summary.clone());
            DiscordEmbed {
                title: truncate_chars(if ad.title.is_empty() { "(untitled)" } else { ad.title.as_str() }, 256),
                url: Some(ad.url.clone()).filter(|u| !u.is_empty()),
                description: truncate_chars(&ad.description, DESCRIPTION_LIMIT),
                color: EMBED_COLOR,
                fields: vec![
                    field("Price", ad.price.to_string(), true),
                    field("Marketplace", ad.marketplace.clone(), true),
                    field("Location", ad.location.clone().unwrap_or_default(), true),
                    field("Search", query, false),
                    field("Watcher", ctx.watcher_id.clone(), false),
                ],
                thumbnail: ad.images.first().map(|url| EmbedThumbnail { url: url.clone() }),
                timestamp: ad
                    .published_at
                    .unwrap_or(now)
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            }
        })
        .collect();

    DiscordPayload {
        username: settings.username.clone(),
        avatar_url: settings.avatar_url.clone(),
        content,
        embeds,
    }
}

#[async_trait]
impl ChannelSender for DiscordWebhookSender {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Discord
    }

    fn max_ads_per_message(&self) -> usize {
        DISCORD_MAX_EMBEDS
    }

    async fn send(
        &self,
        channel: &ChannelConfig,
        ads: &[Ad],
        ctx: &NotifyContext,
        batch: BatchInfo,
    ) -> Result<(), DeliveryError> {
        let ChannelConfig::Discord { webhook_url } = channel else {
            return Err(DeliveryError::NotConfigured(format!("{} is not a discord channel", channel.label())));
        };
        let payload = self.build_payload(ads, ctx, batch);
        let body = serde_json::to_value(&payload).map_err(|e| DeliveryError::Rejected {
            status: None,
            message: e.to_string(),
        })?;
        self.http.post_json("discord", webhook_url, &body, &[]).await?;
        debug!(channel = %channel.label(), embeds = payload.embeds.len(), "discord message sent");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub subject: String,
    pub text: String,
    pub html: String,
}

#[derive(Debug, Clone)]
struct EmailRow {
    url: String,
    title: String,
    price: String,
    marketplace: String,
    location: String,
    description: String,
}

#[derive(Template)]
#[template(path = "email_digest.html")]
struct EmailDigestHtml<'a> {
    query_summary: &'a str,
    rows: &'a [EmailRow],
}

#[derive(Template)]
#[template(path = "email_digest.txt")]
struct EmailDigestText<'a> {
    query_summary: &'a str,
    watcher_id: &'a str,
    rows: &'a [EmailRow],
}

pub fn render_email(ads: &[Ad], ctx: &NotifyContext, batch: BatchInfo) -> Result<EmailMessage, DeliveryError> {
    let noun = if ads.len() == 1 { "ad" } else { "ads" };
    let mut subject = format!("[adwatch] {} new {noun} for {}", ads.len(), ctx.display_name());
    if batch.total > 1 {
        subject.push_str(&format!(" ({}/{})", batch.index, batch.total));
    }

    let rows: Vec<EmailRow> = ads
        .iter()
        .map(|ad| EmailRow {
            url: ad.url.clone(),
            title: ad.title.clone(),
            price: ad.price.to_string(),
            marketplace: ad.marketplace.clone(),
            location: ad.location.clone().unwrap_or_else(|| "-".to_string()),
            description: truncate_chars(&ad.description, DESCRIPTION_LIMIT),
        })
        .collect();

    let html = EmailDigestHtml {
        query_summary: &ctx.query_summary,
        rows: &rows,
    }
    .render()
    .map_err(|e| DeliveryError::Render(e.to_string()))?;
    let text = EmailDigestText {
        query_summary: &ctx.query_summary,
        watcher_id: &ctx.watcher_id,
        rows: &rows,
    }
    .render()
    .map_err(|e| DeliveryError::Render(e.to_string()))?;

    Ok(EmailMessage { subject, text, html })
}

pub struct EmailRelaySender {
    http: Arc<HttpFetcher>,
    relay: EmailRelayConfig,
}

impl EmailRelaySender {
    pub fn new(http: Arc<HttpFetcher>, relay: EmailRelayConfig) -> Self {
        Self { http, relay }
    }
}

#[async_trait]
impl ChannelSender for EmailRelaySender {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(
        &self,
        channel: &ChannelConfig,
        ads: &[Ad],
        ctx: &NotifyContext,
        batch: BatchInfo,
    ) -> Result<(), DeliveryError> {
        let ChannelConfig::Email { address } = channel else {
            return Err(DeliveryError::NotConfigured(format!("{} is not an email channel", channel.label())));
        };
        let Some(relay_url) = self.relay.relay_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Err(DeliveryError::NotConfigured("email relay_url is not set".to_string()));
        };

        let message = render_email(ads, ctx, batch)?;
        let body = json!({
            "from": self.relay.from.as_deref().unwrap_or("adwatch@localhost"),
            "to": address,
            "subject": message.subject,
            "text": message.text,
            "html": message.html,
        });
        let mut headers = Vec::new();
        if let Some(key) = &self.relay.api_key {
            headers.push(("Authorization", format!("Bearer {key}")));
        }
        self.http.post_json("email", relay_url, &body, &headers).await?;
        debug!(channel = %channel.label(), ads = ads.len(), "email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adwatch_core::Price;
    use adwatch_storage::HttpClientConfig;
    use chrono::TimeZone;
    use serde_json::Value as JsonValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn ad(id: &str) -> Ad {
        Ad {
            marketplace: "leboncoin".to_string(),
            external_id: id.to_string(),
            title: format!("Lamp {id}"),
            price: Price {
                amount: 40.0,
                currency: "EUR".to_string(),
                suffix: None,
            },
            description: "brass lamp".to_string(),
            url: format!("https://example.test/ad/{id}"),
            images: vec![format!("https://example.test/img/{id}.jpg")],
            location: Some("Lyon".to_string()),
            published_at: None,
            matched_query: Some("lamp".to_string()),
            raw: JsonValue::Null,
        }
    }

    fn ads(n: usize) -> Vec<Ad> {
        (0..n).map(|i| ad(&i.to_string())).collect()
    }

    fn ctx() -> NotifyContext {
        NotifyContext {
            watcher_id: "w1".to_string(),
            watcher_name: Some("Lamps".to_string()),
            query_summary: "lamp".to_string(),
        }
    }

    fn fast_config(enable_batching: bool) -> NotificationConfig {
        NotificationConfig {
            enable_batching,
            batch_delay_ms: 0,
            item_delay_ms: 0,
            retry_delay_ms: 1,
            ..Default::default()
        }
    }

    fn discord() -> ChannelConfig {
        ChannelConfig::Discord {
            webhook_url: "https://discord.test/api/webhooks/123456789/token".to_string(),
        }
    }

    fn email() -> ChannelConfig {
        ChannelConfig::Email {
            address: "me@example.test".to_string(),
        }
    }

    /// Records batch sizes; fails the first `failures` calls.
    struct RecordingSender {
        kind: ChannelKind,
        max_per_message: usize,
        failures: AtomicUsize,
        retryable: bool,
        calls: AtomicUsize,
        batches: Mutex<Vec<usize>>,
    }

    impl RecordingSender {
        fn new(kind: ChannelKind) -> Self {
            Self {
                kind,
                max_per_message: usize::MAX,
                failures: AtomicUsize::new(0),
                retryable: true,
                calls: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
            }
        }

        fn failing(mut self, failures: usize, retryable: bool) -> Self {
            self.failures = AtomicUsize::new(failures);
            self.retryable = retryable;
            self
        }

        fn batches(&self) -> Vec<usize> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelSender for RecordingSender {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        fn max_ads_per_message(&self) -> usize {
            self.max_per_message
        }

        async fn send(
            &self,
            _channel: &ChannelConfig,
            ads: &[Ad],
            _ctx: &NotifyContext,
            _batch: BatchInfo,
        ) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(if self.retryable {
                    DeliveryError::Transport("ECONNRESET".into())
                } else {
                    DeliveryError::Rejected {
                        status: Some(404),
                        message: "unknown webhook".into(),
                    }
                });
            }
            self.batches.lock().unwrap().push(ads.len());
            Ok(())
        }
    }

    #[tokio::test]
    async fn batches_are_partitioned_and_sequential() {
        let sender = Arc::new(RecordingSender::new(ChannelKind::Discord));
        let dispatcher = NotificationDispatcher::empty(fast_config(true)).with_sender(sender.clone());

        let report = dispatcher.notify(&ads(23), &[discord()], &ctx()).await;

        assert_eq!(sender.batches(), vec![10, 10, 3]);
        assert_eq!(report.channels[0].messages_sent, 3);
        assert_eq!(report.channels[0].ads_delivered, 23);
        assert_eq!(report.messages_failed(), 0);
    }

    #[tokio::test]
    async fn batch_size_never_exceeds_sender_ceiling() {
        let mut recording = RecordingSender::new(ChannelKind::Discord);
        recording.max_per_message = DISCORD_MAX_EMBEDS;
        let sender = Arc::new(recording);
        let config = NotificationConfig {
            batch_size: 25,
            ..fast_config(true)
        };
        let dispatcher = NotificationDispatcher::empty(config).with_sender(sender.clone());

        dispatcher.notify(&ads(25), &[discord()], &ctx()).await;
        assert_eq!(sender.batches(), vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn disabled_batching_sends_items_individually() {
        let sender = Arc::new(RecordingSender::new(ChannelKind::Email));
        let dispatcher = NotificationDispatcher::empty(fast_config(false)).with_sender(sender.clone());

        dispatcher.notify(&ads(4), &[email()], &ctx()).await;
        assert_eq!(sender.batches(), vec![1, 1, 1, 1]);
    }

    #[tokio::test]
    async fn single_ad_is_one_message() {
        let sender = Arc::new(RecordingSender::new(ChannelKind::Discord));
        let dispatcher = NotificationDispatcher::empty(fast_config(true)).with_sender(sender.clone());

        dispatcher.notify(&ads(1), &[discord()], &ctx()).await;
        assert_eq!(sender.batches(), vec![1]);
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_others() {
        let discord_sender = Arc::new(RecordingSender::new(ChannelKind::Discord));
        let email_sender = Arc::new(RecordingSender::new(ChannelKind::Email).failing(usize::MAX, false));
        let dispatcher = NotificationDispatcher::empty(fast_config(true))
            .with_sender(discord_sender.clone())
            .with_sender(email_sender.clone());

        let report = dispatcher.notify(&ads(3), &[email(), discord()], &ctx()).await;

        assert_eq!(discord_sender.batches(), vec![3]);
        assert_eq!(email_sender.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.messages_sent(), 1);
        assert_eq!(report.messages_failed(), 1);
    }

    #[tokio::test]
    async fn transient_delivery_failures_are_retried() {
        let sender = Arc::new(RecordingSender::new(ChannelKind::Discord).failing(2, true));
        let dispatcher = NotificationDispatcher::empty(fast_config(true)).with_sender(sender.clone());

        let report = dispatcher.notify(&ads(2), &[discord()], &ctx()).await;

        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.messages_sent(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_are_swallowed() {
        let sender = Arc::new(RecordingSender::new(ChannelKind::Discord).failing(usize::MAX, true));
        let config = NotificationConfig {
            max_retries: 2,
            ..fast_config(true)
        };
        let dispatcher = NotificationDispatcher::empty(config).with_sender(sender.clone());

        let report = dispatcher.notify(&ads(2), &[discord()], &ctx()).await;

        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.messages_failed(), 1);
    }

    #[tokio::test]
    async fn missing_sender_counts_as_failure() {
        let dispatcher = NotificationDispatcher::empty(fast_config(true));
        let report = dispatcher.notify(&ads(2), &[email()], &ctx()).await;
        assert_eq!(report.messages_failed(), 1);
    }

    #[test]
    fn plan_covers_every_ad_once() {
        let dispatcher = NotificationDispatcher::empty(NotificationConfig::default());
        let (ranges, pause) = dispatcher.plan(21, usize::MAX);
        assert_eq!(ranges, vec![0..10, 10..20, 20..21]);
        assert_eq!(pause, Duration::from_secs(2));

        let (ranges, pause) = dispatcher.plan(1, usize::MAX);
        assert_eq!(ranges, vec![0..1]);
        assert_eq!(pause, Duration::from_millis(500));

        assert!(dispatcher.plan(0, usize::MAX).0.is_empty());
    }

    #[test]
    fn discord_payload_has_expected_shape() {
        let mut first = ad("1");
        first.description = "x".repeat(250);
        first.published_at = Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap());
        let mut second = ad("2");
        second.images.clear();
        second.location = None;

        let payload = build_discord_payload(
            &DiscordSettings::default(),
            &[first, second],
            &ctx(),
            BatchInfo { index: 1, total: 2 },
        );
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(value["username"], "Ad Watcher");
        assert!(value.get("avatar_url").is_none());
        assert_eq!(value["content"], "2 new ads for **Lamps** (batch 1/2)");
        assert_eq!(value["embeds"].as_array().unwrap().len(), 2);

        let embed = &value["embeds"][0];
        assert_eq!(embed["title"], "Lamp 1");
        assert_eq!(embed["url"], "https://example.test/ad/1");
        let description = embed["description"].as_str().unwrap();
        assert_eq!(description.chars().count(), DESCRIPTION_LIMIT + 1);
        assert!(description.ends_with('…'));
        assert_eq!(embed["thumbnail"]["url"], "https://example.test/img/1.jpg");
        assert_eq!(embed["timestamp"], "2024-03-01T10:15:00.000Z");

        let names: Vec<&str> = embed["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Price", "Marketplace", "Location", "Search", "Watcher"]);
        assert_eq!(embed["fields"][0]["value"], "40 EUR");
        assert_eq!(embed["fields"][4]["value"], "w1");

        let bare = &value["embeds"][1];
        assert!(bare.get("thumbnail").is_none());
        assert_eq!(bare["fields"][2]["value"], "-");
    }

    #[test]
    fn discord_payload_caps_embeds() {
        let payload = build_discord_payload(
            &DiscordSettings::default(),
            &ads(14),
            &ctx(),
            BatchInfo { index: 1, total: 1 },
        );
        assert_eq!(payload.embeds.len(), DISCORD_MAX_EMBEDS);
    }

    #[test]
    fn single_ad_payload_has_no_summary_line() {
        let payload = build_discord_payload(
            &DiscordSettings::default(),
            &ads(1),
            &ctx(),
            BatchInfo { index: 1, total: 1 },
        );
        assert!(payload.content.is_none());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("ééé", 2), "éé…");
        assert_eq!(truncate_chars("short", 200), "short");
    }

    #[test]
    fn email_render_escapes_html() {
        let mut listing = ad("7");
        listing.title = "<Lamp> & shade".to_string();
        let message = render_email(&[listing], &ctx(), BatchInfo { index: 1, total: 1 }).unwrap();

        assert_eq!(message.subject, "[adwatch] 1 new ad for Lamps");
        assert!(message.text.contains("- <Lamp> & shade |"));
        assert!(message.html.contains("&lt;Lamp&gt; &amp; shade"));
        assert!(!message.html.contains("<Lamp>"));
        assert!(message.html.contains("example.test"));
    }

    #[tokio::test]
    async fn email_without_relay_is_not_configured() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let sender = EmailRelaySender::new(http, EmailRelayConfig::default());
        let err = sender
            .send(&email(), &ads(1), &ctx(), BatchInfo { index: 1, total: 1 })
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::NotConfigured(_)));
        assert!(!err.is_retryable());
    }
}
